//! The ordered, concurrently mutable stage sequence of one chain.

use crate::chain::stage::Stage;
use std::sync::{Arc, PoisonError, RwLock};

/// Ordered stage sequence with reader/writer locking.
///
/// Lookups are expected to be frequent relative to mutations (attachment
/// logic, diagnostics), so reads take the shared lock and never serialize
/// against each other.
pub(crate) struct StageRegistry {
    stages: RwLock<Vec<Arc<dyn Stage>>>,
}

impl StageRegistry {
    pub(crate) fn new() -> Self {
        Self {
            stages: RwLock::new(Vec::new()),
        }
    }

    /// Appends a stage to the end of the sequence.
    ///
    /// No uniqueness check: callers supply unique identifiers.
    pub(crate) fn add(&self, stage: Arc<dyn Stage>) {
        self.stages
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(stage);
    }

    /// First stage whose identifier equals `id`. Absence is a normal
    /// outcome for optional stages, not an error.
    pub(crate) fn get(&self, id: &str) -> Option<Arc<dyn Stage>> {
        self.stages
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .find(|stage| stage.id() == id)
            .cloned()
    }

    /// Current sequence length.
    pub(crate) fn count(&self) -> usize {
        self.stages
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// The last stage in the sequence, if any.
    pub(crate) fn last(&self) -> Option<Arc<dyn Stage>> {
        self.stages
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .last()
            .cloned()
    }

    /// A copy of the sequence in processing order.
    pub(crate) fn snapshot(&self) -> Vec<Arc<dyn Stage>> {
        self.stages
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Stops and removes every stage matching `id`.
    ///
    /// All matches are removed, not just the first, which guards against
    /// accidental duplicates. Unknown ids are a no-op.
    pub(crate) fn remove(&self, id: &str) {
        let mut stages = self.stages.write().unwrap_or_else(PoisonError::into_inner);
        stages.retain(|stage| {
            if stage.id() == id {
                stage.stop();
                false
            } else {
                true
            }
        });
    }

    /// Stops every stage in sequence order and empties the collection.
    pub(crate) fn clear(&self) {
        let mut stages = self.stages.write().unwrap_or_else(PoisonError::into_inner);
        for stage in stages.iter() {
            stage.stop();
        }
        stages.clear();
    }
}
