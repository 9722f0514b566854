use std::fmt;
use std::sync::{Arc, Mutex};

use crate::error::{QuadlogError, QuadlogResult, ValidationError};
use crate::model::{Action, Element, Solution};
use crate::stats::MutationCounter;
use crate::storage::RelationView;

use super::SolutionSink;

/// Writes (or deletes) the head elements of solutions against one relation.
///
/// Elements accumulate until `capacity` is reached or [`SolutionSink::flush`]
/// is called. The returned count is the number of elements actually changed.
pub struct MutationBuffer {
    action: Action,
    view: Arc<dyn RelationView>,
    capacity: usize,
    pending: Mutex<Vec<Element>>,
    changed: MutationCounter,
}

impl fmt::Debug for MutationBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MutationBuffer")
            .field("action", &self.action)
            .field("relation", &self.view.name())
            .field("timestamp", &self.view.timestamp())
            .field("capacity", &self.capacity)
            .finish_non_exhaustive()
    }
}

impl MutationBuffer {
    /// Creates a buffer for `action`, which must be a mutation.
    pub fn new(action: Action, view: Arc<dyn RelationView>, capacity: usize) -> Result<Self, ValidationError> {
        if !action.is_mutation() {
            return Err(ValidationError::MutationRequired { action });
        }
        Ok(Self {
            action,
            view,
            capacity: capacity.max(1),
            pending: Mutex::new(Vec::new()),
            changed: MutationCounter::new(),
        })
    }

    /// The mutation applied on flush.
    #[must_use]
    pub const fn action(&self) -> Action {
        self.action
    }

    /// The target relation.
    #[must_use]
    pub fn relation(&self) -> &str {
        self.view.name()
    }

    fn lock_pending(&self) -> QuadlogResult<std::sync::MutexGuard<'_, Vec<Element>>> {
        self.pending
            .lock()
            .map_err(|_| QuadlogError::internal("poisoned lock: mutation buffer"))
    }

    fn write(&self, elements: &[Element]) -> QuadlogResult<()> {
        if elements.is_empty() {
            return Ok(());
        }
        let n = match self.action {
            Action::Insert => self.view.insert(elements)?,
            Action::Delete => self.view.delete(elements)?,
            Action::Query => 0,
        };
        self.changed.add(n);
        Ok(())
    }
}

impl SolutionSink for MutationBuffer {
    fn add_chunk(&self, chunk: Vec<Solution>) -> QuadlogResult<()> {
        let full = {
            let mut pending = self.lock_pending()?;
            pending.extend(chunk.into_iter().filter_map(Solution::into_element));
            if pending.len() >= self.capacity {
                std::mem::take(&mut *pending)
            } else {
                Vec::new()
            }
        };
        self.write(&full)
    }

    fn flush(&self) -> QuadlogResult<u64> {
        let rest = std::mem::take(&mut *self.lock_pending()?);
        self.write(&rest)?;
        Ok(self.changed.take())
    }
}
