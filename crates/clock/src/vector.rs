//! Vector clock and the four-valued causal comparator.

use distlab_types::NodeId;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Owned snapshot of a vector clock's entries.
pub type VectorSnapshot = BTreeMap<NodeId, u64>;

/// Causal relation between two vector clock snapshots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CausalRelation {
    Equal,
    HappensBefore,
    HappensAfter,
    Concurrent,
}

impl CausalRelation {
    /// The relation with operands swapped.
    pub fn inverse(self) -> Self {
        match self {
            CausalRelation::HappensBefore => CausalRelation::HappensAfter,
            CausalRelation::HappensAfter => CausalRelation::HappensBefore,
            other => other,
        }
    }
}

/// Per-node vector clock.
///
/// Constructed with the owner id and the full participant list; entries for
/// all participants start at zero. The owner's entry counts its observed
/// local events plus incoming merges.
#[derive(Debug)]
pub struct VectorClock {
    owner: NodeId,
    clock: RwLock<VectorSnapshot>,
}

impl VectorClock {
    pub fn new(owner: NodeId, participants: &[NodeId]) -> Self {
        let clock = participants.iter().map(|id| (id.clone(), 0)).collect();
        Self {
            owner,
            clock: RwLock::new(clock),
        }
    }

    pub fn owner(&self) -> &NodeId {
        &self.owner
    }

    /// Snapshot of the current entries.
    pub fn snapshot(&self) -> VectorSnapshot {
        self.clock.read().clone()
    }

    /// Entry for a specific node; missing entries read as zero.
    pub fn get(&self, id: &NodeId) -> u64 {
        self.clock.read().get(id).copied().unwrap_or(0)
    }

    /// Increment the owner's entry and return the new snapshot.
    /// Call on local and send events.
    pub fn increment(&self) -> VectorSnapshot {
        let mut clock = self.clock.write();
        *clock.entry(self.owner.clone()).or_insert(0) += 1;
        clock.clone()
    }

    /// Merge a received snapshot: entrywise max, then increment the owner's
    /// entry. Returns the new snapshot. Call on receive events.
    pub fn merge(&self, received: &VectorSnapshot) -> VectorSnapshot {
        let mut clock = self.clock.write();
        for (id, &value) in received {
            let entry = clock.entry(id.clone()).or_insert(0);
            if value > *entry {
                *entry = value;
            }
        }
        *clock.entry(self.owner.clone()).or_insert(0) += 1;
        clock.clone()
    }

    /// Causal relation of this clock's current value to another snapshot.
    pub fn compare(&self, other: &VectorSnapshot) -> CausalRelation {
        compare_vector_clocks(&self.clock.read(), other)
    }
}

/// Compare two vector clock snapshots over the union of their key sets.
/// Missing keys read as zero. Returns exactly one of the four relations.
pub fn compare_vector_clocks(a: &VectorSnapshot, b: &VectorSnapshot) -> CausalRelation {
    let mut a_le = true;
    let mut b_le = true;
    let mut equal = true;

    for key in a.keys().chain(b.keys()) {
        let av = a.get(key).copied().unwrap_or(0);
        let bv = b.get(key).copied().unwrap_or(0);
        if av != bv {
            equal = false;
        }
        if av > bv {
            b_le = false;
        }
        if bv > av {
            a_le = false;
        }
    }

    if equal {
        CausalRelation::Equal
    } else if a_le {
        CausalRelation::HappensBefore
    } else if b_le {
        CausalRelation::HappensAfter
    } else {
        CausalRelation::Concurrent
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(names: &[&str]) -> Vec<NodeId> {
        names.iter().map(|n| NodeId::from(*n)).collect()
    }

    fn snap(entries: &[(&str, u64)]) -> VectorSnapshot {
        entries
            .iter()
            .map(|(id, v)| (NodeId::from(*id), *v))
            .collect()
    }

    #[test]
    fn test_starts_at_zero_for_all_participants() {
        let clock = VectorClock::new("a".into(), &ids(&["a", "b", "c"]));
        assert_eq!(clock.get(&"a".into()), 0);
        assert_eq!(clock.get(&"c".into()), 0);
        assert_eq!(clock.snapshot().len(), 3);
    }

    #[test]
    fn test_increment_bumps_only_owner() {
        let clock = VectorClock::new("a".into(), &ids(&["a", "b"]));
        let snapshot = clock.increment();
        assert_eq!(snapshot[&NodeId::from("a")], 1);
        assert_eq!(snapshot[&NodeId::from("b")], 0);
    }

    #[test]
    fn test_merge_takes_entrywise_max_then_bumps_owner() {
        let clock = VectorClock::new("a".into(), &ids(&["a", "b"]));
        clock.increment(); // a=1
        let merged = clock.merge(&snap(&[("a", 0), ("b", 4)]));
        assert_eq!(merged[&NodeId::from("a")], 2);
        assert_eq!(merged[&NodeId::from("b")], 4);
    }

    #[test]
    fn test_merge_learns_unknown_participants() {
        let clock = VectorClock::new("a".into(), &ids(&["a"]));
        let merged = clock.merge(&snap(&[("z", 7)]));
        assert_eq!(merged[&NodeId::from("z")], 7);
    }

    #[test]
    fn test_compare_equal() {
        let a = snap(&[("x", 1), ("y", 2)]);
        assert_eq!(compare_vector_clocks(&a, &a.clone()), CausalRelation::Equal);
    }

    #[test]
    fn test_compare_happens_before_and_dual() {
        let a = snap(&[("x", 1), ("y", 2)]);
        let b = snap(&[("x", 1), ("y", 3)]);
        assert_eq!(compare_vector_clocks(&a, &b), CausalRelation::HappensBefore);
        assert_eq!(compare_vector_clocks(&b, &a), CausalRelation::HappensAfter);
        assert_eq!(
            compare_vector_clocks(&a, &b).inverse(),
            compare_vector_clocks(&b, &a)
        );
    }

    #[test]
    fn test_compare_concurrent() {
        let a = snap(&[("x", 2), ("y", 0)]);
        let b = snap(&[("x", 0), ("y", 2)]);
        assert_eq!(compare_vector_clocks(&a, &b), CausalRelation::Concurrent);
        assert_eq!(compare_vector_clocks(&b, &a), CausalRelation::Concurrent);
    }

    #[test]
    fn test_compare_missing_keys_read_as_zero() {
        let a = snap(&[("x", 1)]);
        let b = snap(&[("x", 1), ("y", 1)]);
        assert_eq!(compare_vector_clocks(&a, &b), CausalRelation::HappensBefore);
    }
}
