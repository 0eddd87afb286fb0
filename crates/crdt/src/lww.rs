//! Last-writer-wins register and element set.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Tie-breaking policy when an add and a remove carry the same timestamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Bias {
    Add,
    Remove,
}

/// Single-value register where the highest timestamp wins.
///
/// Equal timestamps fall back to comparing the serialized values, which is
/// arbitrary but deterministic — both replicas pick the same winner.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LwwRegister {
    value: serde_json::Value,
    timestamp: u64,
}

impl LwwRegister {
    pub fn new() -> Self {
        Self {
            value: serde_json::Value::Null,
            timestamp: 0,
        }
    }

    /// Apply a write. Returns whether the register changed.
    pub fn set(&mut self, value: serde_json::Value, timestamp: u64) -> bool {
        if timestamp > self.timestamp
            || (timestamp == self.timestamp && value.to_string() > self.value.to_string())
        {
            self.value = value;
            self.timestamp = timestamp;
            return true;
        }
        false
    }

    pub fn get(&self) -> (&serde_json::Value, u64) {
        (&self.value, self.timestamp)
    }

    pub fn value(&self) -> &serde_json::Value {
        &self.value
    }

    pub fn timestamp(&self) -> u64 {
        self.timestamp
    }

    /// Merge is just `set` with the other replica's state.
    pub fn merge(&mut self, other: &LwwRegister) -> bool {
        self.set(other.value.clone(), other.timestamp)
    }
}

impl Default for LwwRegister {
    fn default() -> Self {
        Self::new()
    }
}

/// Last-writer-wins element set.
///
/// Keeps per-element add and remove timestamps; an element is present when
/// its add timestamp beats its remove timestamp (ties resolved by [`Bias`]).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LwwSet {
    add_map: BTreeMap<String, u64>,
    remove_map: BTreeMap<String, u64>,
    bias: Bias,
}

impl LwwSet {
    pub fn new(bias: Bias) -> Self {
        Self {
            add_map: BTreeMap::new(),
            remove_map: BTreeMap::new(),
            bias,
        }
    }

    /// Record an add. Returns whether the add timestamp advanced.
    pub fn add(&mut self, element: impl Into<String>, timestamp: u64) -> bool {
        let element = element.into();
        match self.add_map.get(&element) {
            Some(&current) if timestamp <= current => false,
            _ => {
                self.add_map.insert(element, timestamp);
                true
            }
        }
    }

    /// Record a remove. Returns whether the remove timestamp advanced.
    pub fn remove(&mut self, element: impl Into<String>, timestamp: u64) -> bool {
        let element = element.into();
        match self.remove_map.get(&element) {
            Some(&current) if timestamp <= current => false,
            _ => {
                self.remove_map.insert(element, timestamp);
                true
            }
        }
    }

    pub fn contains(&self, element: &str) -> bool {
        let Some(&add_ts) = self.add_map.get(element) else {
            return false;
        };
        match self.remove_map.get(element) {
            None => true,
            Some(&remove_ts) if add_ts > remove_ts => true,
            Some(&remove_ts) if add_ts == remove_ts => self.bias == Bias::Add,
            Some(_) => false,
        }
    }

    /// Elements currently in the set.
    pub fn value(&self) -> BTreeSet<String> {
        self.add_map
            .keys()
            .filter(|element| self.contains(element))
            .cloned()
            .collect()
    }

    /// Entrywise max of both timestamp maps.
    pub fn merge(&mut self, other: &LwwSet) {
        for (element, &ts) in &other.add_map {
            let entry = self.add_map.entry(element.clone()).or_insert(0);
            if ts > *entry {
                *entry = ts;
            }
        }
        for (element, &ts) in &other.remove_map {
            let entry = self.remove_map.entry(element.clone()).or_insert(0);
            if ts > *entry {
                *entry = ts;
            }
        }
    }
}
