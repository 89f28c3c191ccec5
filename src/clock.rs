//! Vector clock primitives: per-client monotonic counters that order
//! operations causally or detect that two operations are concurrent.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Outcome of comparing two vector clocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClockOrdering {
    Equal,
    /// Self is causally before the other clock.
    LessThan,
    /// Self is causally after the other clock.
    GreaterThan,
    /// Neither clock dominates the other.
    Concurrent,
}

/// Map from client id to that client's operation counter.
///
/// Counters only ever increase. A clock attached to an operation is the
/// value *after* the authoring client bumped its own counter.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VectorClock(pub BTreeMap<String, u64>);

impl VectorClock {
    pub fn new() -> Self {
        Self(BTreeMap::new())
    }

    pub fn get(&self, client_id: &str) -> u64 {
        self.0.get(client_id).copied().unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Pointwise comparison. `Concurrent` iff neither side dominates.
    pub fn compare(&self, other: &VectorClock) -> ClockOrdering {
        let mut self_lte = true;
        let mut other_lte = true;

        for (client, &count) in &self.0 {
            if count > other.get(client) {
                self_lte = false;
            }
        }
        for (client, &count) in &other.0 {
            if count > self.get(client) {
                other_lte = false;
            }
        }

        match (self_lte, other_lte) {
            (true, true) => ClockOrdering::Equal,
            (true, false) => ClockOrdering::LessThan,
            (false, true) => ClockOrdering::GreaterThan,
            (false, false) => ClockOrdering::Concurrent,
        }
    }

    /// Pointwise maximum of both clocks.
    pub fn merge(&self, other: &VectorClock) -> VectorClock {
        let mut merged = self.0.clone();
        for (client, &count) in &other.0 {
            let entry = merged.entry(client.clone()).or_insert(0);
            if count > *entry {
                *entry = count;
            }
        }
        VectorClock(merged)
    }

    /// Bump a single client's counter by one, returning the new clock.
    pub fn increment(&self, client_id: &str) -> VectorClock {
        let mut next = self.0.clone();
        *next.entry(client_id.to_string()).or_insert(0) += 1;
        VectorClock(next)
    }

    /// In-place pointwise maximum, used when folding many op clocks.
    pub fn merge_in_place(&mut self, other: &VectorClock) {
        for (client, &count) in &other.0 {
            let entry = self.0.entry(client.clone()).or_insert(0);
            if count > *entry {
                *entry = count;
            }
        }
    }

    /// True when `self` is causally after or equal to `other`.
    pub fn dominates(&self, other: &VectorClock) -> bool {
        matches!(
            self.compare(other),
            ClockOrdering::Equal | ClockOrdering::GreaterThan
        )
    }
}

impl fmt::Display for VectorClock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{")?;
        for (i, (client, count)) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}:{}", client, count)?;
        }
        write!(f, "}}")
    }
}

impl FromIterator<(String, u64)> for VectorClock {
    fn from_iter<I: IntoIterator<Item = (String, u64)>>(iter: I) -> Self {
        VectorClock(iter.into_iter().collect())
    }
}
