//! Derived clock views over the log: the current global clock and the
//! per-entity frontier used for entity-scoped conflict detection.

use std::collections::BTreeMap;

use tracing::debug;

use crate::clock::VectorClock;
use crate::error::Result;
use crate::storage::Storage;
use crate::store::OpLogStore;

/// Most recent clock observed per `"entityType:entityId"` key, as opposed to
/// the global clock's per-client maxima across all entities.
pub type EntityFrontier = BTreeMap<String, VectorClock>;

impl<S: Storage> OpLogStore<S> {
    /// The current global vector clock.
    ///
    /// Fast path: the stored clock row. Fallback (databases that predate the
    /// clock row): the last snapshot's clock merged with the pointwise max of
    /// all tail op clocks.
    pub fn current_vector_clock(&mut self) -> Result<VectorClock> {
        if let Some((clock, _)) = self.vector_clock_entry()? {
            return Ok(clock);
        }

        let (mut clock, from_seq) = match self.load_state_cache()? {
            Some(snapshot) => (snapshot.vector_clock, snapshot.last_applied_op_seq),
            None => (VectorClock::new(), 0),
        };
        for entry in self.ops_after_seq(from_seq)? {
            clock.merge_in_place(&entry.op.vector_clock);
        }
        debug!(clock = %clock, "derived clock from snapshot and tail");
        Ok(clock)
    }

    /// The clock of the highest-sequence op touching each entity.
    ///
    /// Entities folded into the snapshot but untouched since appear with the
    /// snapshot's clock (the snapshot's `entity_keys` set distinguishes them
    /// from entities that never existed or were deleted before the fold).
    /// `entity_type` narrows the result when given.
    pub fn entity_frontier(&mut self, entity_type: Option<&str>) -> Result<EntityFrontier> {
        let mut frontier = EntityFrontier::new();

        if let Some(snapshot) = self.load_state_cache()? {
            if let Some(keys) = &snapshot.entity_keys {
                for key in keys {
                    if let Some(filter) = entity_type {
                        if !key.starts_with(&format!("{}:", filter)) {
                            continue;
                        }
                    }
                    frontier.insert(key.clone(), snapshot.vector_clock.clone());
                }
            }
        }

        // Tail entries override snapshot-era values; later seqs override
        // earlier ones because entries arrive in sequence order.
        for entry in self.ops_after_seq(0)? {
            if entry.rejected_at.is_some() {
                continue;
            }
            if let Some(filter) = entity_type {
                if entry.op.entity_type != filter {
                    continue;
                }
            }
            for key in entry.op.entity_keys() {
                frontier.insert(key, entry.op.vector_clock.clone());
            }
        }

        Ok(frontier)
    }
}
