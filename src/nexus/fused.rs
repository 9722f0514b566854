use std::collections::BTreeSet;
use std::sync::Arc;

use crate::model::{Element, TermId};
use crate::storage::{PartitionId, RelationView, StorageError, Timestamp};

/// Read-only union of several relations seen at the same timestamp.
pub(crate) struct FusedView {
    name: String,
    timestamp: Timestamp,
    views: Vec<Arc<dyn RelationView>>,
}

impl FusedView {
    pub(crate) fn new(views: Vec<Arc<dyn RelationView>>, timestamp: Timestamp) -> Self {
        let name = views.iter().map(|v| v.name()).collect::<Vec<_>>().join("|");
        Self { name, timestamp, views }
    }

    fn union<F>(&self, read: F) -> Result<Vec<Element>, StorageError>
    where
        F: Fn(&dyn RelationView) -> Result<Vec<Element>, StorageError>,
    {
        let mut seen = BTreeSet::new();
        for view in &self.views {
            seen.extend(read(view.as_ref())?);
        }
        Ok(seen.into_iter().collect())
    }
}

impl RelationView for FusedView {
    fn name(&self) -> &str {
        &self.name
    }

    fn timestamp(&self) -> Timestamp {
        self.timestamp
    }

    fn access_path(&self, pattern: &[Option<TermId>]) -> Result<Vec<Element>, StorageError> {
        self.union(|v| v.access_path(pattern))
    }

    fn range_count(&self, pattern: &[Option<TermId>]) -> Result<u64, StorageError> {
        // Upper bound: overlaps between the relations are counted twice.
        self.views.iter().try_fold(0u64, |acc, v| Ok(acc.saturating_add(v.range_count(pattern)?)))
    }

    fn insert(&self, _chunk: &[Element]) -> Result<u64, StorageError> {
        Err(StorageError::ReadOnly(self.name.clone()))
    }

    fn delete(&self, _chunk: &[Element]) -> Result<u64, StorageError> {
        Err(StorageError::ReadOnly(self.name.clone()))
    }

    fn partition_count(&self) -> usize {
        self.views.iter().map(|v| v.partition_count()).max().unwrap_or(1)
    }

    fn partition_access_path(
        &self,
        partition: PartitionId,
        pattern: &[Option<TermId>],
    ) -> Result<Vec<Element>, StorageError> {
        self.union(|v| v.partition_access_path(partition, pattern))
    }
}
