//! Grow-only and positive-negative counters.

use distlab_types::NodeId;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Grow-only counter: each replica owns one entry, the value is the sum,
/// and merge takes the entrywise max.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct GCounter {
    node_id: NodeId,
    counts: BTreeMap<NodeId, u64>,
}

impl GCounter {
    pub fn new(node_id: NodeId) -> Self {
        let counts = BTreeMap::from([(node_id.clone(), 0)]);
        Self { node_id, counts }
    }

    /// Bump this replica's entry. `amount` must be positive to preserve the
    /// grow-only property; zero is ignored.
    pub fn increment(&mut self, amount: u64) -> u64 {
        let entry = self.counts.entry(self.node_id.clone()).or_insert(0);
        *entry += amount;
        *entry
    }

    /// Total across all replicas.
    pub fn value(&self) -> u64 {
        self.counts.values().sum()
    }

    /// This replica's own entry.
    pub fn local_count(&self) -> u64 {
        self.counts.get(&self.node_id).copied().unwrap_or(0)
    }

    /// Entrywise max with another replica's state.
    pub fn merge(&mut self, other: &GCounter) {
        for (node, &count) in &other.counts {
            let entry = self.counts.entry(node.clone()).or_insert(0);
            if count > *entry {
                *entry = count;
            }
        }
    }

    /// Internal state, for gossip payloads.
    pub fn state(&self) -> &BTreeMap<NodeId, u64> {
        &self.counts
    }

    pub fn from_state(node_id: NodeId, counts: BTreeMap<NodeId, u64>) -> Self {
        let mut counter = Self { node_id, counts };
        counter
            .counts
            .entry(counter.node_id.clone())
            .or_insert(0);
        counter
    }
}

/// Counter supporting increment and decrement: two G-counters, value `P - N`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PNCounter {
    positive: GCounter,
    negative: GCounter,
}

impl PNCounter {
    pub fn new(node_id: NodeId) -> Self {
        Self {
            positive: GCounter::new(node_id.clone()),
            negative: GCounter::new(node_id),
        }
    }

    pub fn increment(&mut self, amount: u64) -> i64 {
        self.positive.increment(amount);
        self.value()
    }

    pub fn decrement(&mut self, amount: u64) -> i64 {
        self.negative.increment(amount);
        self.value()
    }

    /// Can go negative.
    pub fn value(&self) -> i64 {
        self.positive.value() as i64 - self.negative.value() as i64
    }

    pub fn merge(&mut self, other: &PNCounter) {
        self.positive.merge(&other.positive);
        self.negative.merge(&other.negative);
    }

    pub fn positive(&self) -> &GCounter {
        &self.positive
    }

    pub fn negative(&self) -> &GCounter {
        &self.negative
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gcounter_concurrent_increments_survive_merge() {
        let mut a = GCounter::new("a".into());
        let mut b = GCounter::new("b".into());
        a.increment(3);
        b.increment(2);

        a.merge(&b);
        assert_eq!(a.value(), 5);
        assert_eq!(a.local_count(), 3);
    }

    #[test]
    fn test_gcounter_merge_laws() {
        let mut a = GCounter::new("a".into());
        let mut b = GCounter::new("b".into());
        let mut c = GCounter::new("c".into());
        a.increment(1);
        b.increment(2);
        c.increment(3);

        // Commutative: a⊔b == b⊔a
        let mut ab = a.clone();
        ab.merge(&b);
        let mut ba = b.clone();
        ba.merge(&a);
        assert_eq!(ab.value(), ba.value());

        // Associative: (a⊔b)⊔c == a⊔(b⊔c)
        let mut abc = ab.clone();
        abc.merge(&c);
        let mut bc = b.clone();
        bc.merge(&c);
        let mut a_bc = a.clone();
        a_bc.merge(&bc);
        assert_eq!(abc.value(), a_bc.value());

        // Idempotent: a⊔a == a
        let mut aa = a.clone();
        aa.merge(&a);
        assert_eq!(aa, a);
    }

    #[test]
    fn test_pncounter_goes_negative() {
        let mut counter = PNCounter::new("a".into());
        counter.increment(2);
        assert_eq!(counter.decrement(5), -3);
    }

    #[test]
    fn test_pncounter_convergence() {
        let mut a = PNCounter::new("a".into());
        let mut b = PNCounter::new("b".into());
        a.increment(3);
        b.increment(1);
        b.decrement(2);

        a.merge(&b);
        b.merge(&a);
        assert_eq!(a.value(), 2);
        assert_eq!(b.value(), 2);
    }
}
