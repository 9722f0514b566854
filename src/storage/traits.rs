//! Abstract storage traits for quadlog.
//!
//! The engine consumes the index layer through these traits only:
//! - [`IndexManager`] owns relations, the commit history and the executor;
//! - [`RelationView`] reads and writes one relation at one timestamp.
//!
//! Values crossing these traits are already-resolved [`TermId`]s.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::model::{Element, TermId};
use crate::runtime::TaskPool;

/// Errors that can occur during storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// Relation not found.
    #[error("Relation not found: {0}")]
    RelationNotFound(String),

    /// The snapshot backing a timestamp has been released.
    #[error("Snapshot at {0} has been released")]
    SnapshotReleased(Timestamp),

    /// The timestamp is ahead of the commit history.
    #[error("No commit point at {0}")]
    UnknownTimestamp(Timestamp),

    /// Write against a view that only supports reads.
    #[error("Relation '{0}' is read-only at this timestamp")]
    ReadOnly(String),

    /// Transaction not found.
    #[error("Transaction not found: {0}")]
    TransactionNotFound(TxId),

    /// Backend error.
    #[error("Storage backend error: {0}")]
    BackendError(String),

    /// Serialization failed.
    #[error("Serialization error: {0}")]
    SerializationError(String),
}

/// A commit point, or [`Timestamp::UNISOLATED`] for the live view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Timestamp(u64);

impl Timestamp {
    /// The live, writable view. Reads see every flushed write immediately.
    pub const UNISOLATED: Self = Self(0);

    /// Wraps a raw commit time.
    #[must_use]
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// The raw commit time.
    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }

    /// Returns true for the live view.
    #[must_use]
    pub const fn is_unisolated(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_unisolated() {
            f.write_str("unisolated")
        } else {
            write!(f, "t{}", self.0)
        }
    }
}

/// Opaque identity of an index manager, used as the nexus cache key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IndexManagerId(Uuid);

impl IndexManagerId {
    /// Creates a new random id.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for IndexManagerId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for IndexManagerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of a read-only transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TxId(Uuid);

impl TxId {
    /// Creates a new random id.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for TxId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TxId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Callback run with the id of an index manager being torn down.
pub type TeardownHook = Box<dyn FnOnce(IndexManagerId) + Send>;

/// Index partition number within a federation.
pub type PartitionId = usize;

/// Deployment shape of an index manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum IndexManagerKind {
    /// A single-process journal.
    Journal {
        /// Released commit points may be overwritten.
        slot_reuse: bool,
    },
    /// A partitioned, distributed federation.
    Federation {
        /// Number of index partitions.
        partitions: usize,
    },
}

impl IndexManagerKind {
    /// Returns true for a federation.
    #[must_use]
    pub const fn is_distributed(self) -> bool {
        matches!(self, Self::Federation { .. })
    }
}

/// One relation seen at one timestamp.
///
/// # Concurrency
/// Views are shared across join workers and must tolerate concurrent reads.
/// Writes only happen through buffer flushes.
pub trait RelationView: Send + Sync {
    /// Relation name.
    fn name(&self) -> &str;

    /// Timestamp of the view.
    fn timestamp(&self) -> Timestamp;

    /// Every element matching the pattern (`None` slots are wildcards).
    fn access_path(&self, pattern: &[Option<TermId>]) -> Result<Vec<Element>, StorageError>;

    /// Number of elements matching the pattern.
    fn range_count(&self, pattern: &[Option<TermId>]) -> Result<u64, StorageError>;

    /// Writes the chunk, returning how many elements were not already present.
    fn insert(&self, chunk: &[Element]) -> Result<u64, StorageError>;

    /// Removes the chunk, returning how many elements were present.
    fn delete(&self, chunk: &[Element]) -> Result<u64, StorageError>;

    /// Number of index partitions backing the relation.
    fn partition_count(&self) -> usize {
        1
    }

    /// Elements of one partition matching the pattern.
    fn partition_access_path(
        &self,
        partition: PartitionId,
        pattern: &[Option<TermId>],
    ) -> Result<Vec<Element>, StorageError> {
        if partition == 0 {
            self.access_path(pattern)
        } else {
            Ok(Vec::new())
        }
    }
}

/// The index layer consumed by the engine.
pub trait IndexManager: Send + Sync {
    /// Identity used to key cached evaluation contexts.
    fn id(&self) -> IndexManagerId;

    /// Deployment shape.
    fn kind(&self) -> IndexManagerKind;

    /// Resolves a relation at a timestamp. Unknown relations are created empty.
    fn relation_view(&self, name: &str, timestamp: Timestamp) -> Result<Arc<dyn RelationView>, StorageError>;

    /// Most recent commit point.
    fn last_commit_time(&self) -> Timestamp;

    /// Checkpoints the live view, returning the new commit point.
    fn commit(&self) -> Result<Timestamp, StorageError>;

    /// Opens a read-only transaction pinning the commit point at `timestamp`.
    fn new_read_only_tx(&self, timestamp: Timestamp) -> Result<TxId, StorageError>;

    /// Releases a read-only transaction.
    fn abort(&self, tx: TxId) -> Result<(), StorageError>;

    /// Opens a read-only transaction on the most recent commit point.
    ///
    /// Backends that commit concurrently should override this so no commit
    /// can release the point between reading and pinning it.
    fn pin_last_commit(&self) -> Result<(TxId, Timestamp), StorageError> {
        let timestamp = self.last_commit_time();
        Ok((self.new_read_only_tx(timestamp)?, timestamp))
    }

    /// Partitions that may hold elements matching the pattern.
    fn partitions(&self, _relation: &str, _pattern: &[Option<TermId>]) -> Vec<PartitionId> {
        vec![0]
    }

    /// Pool running step tasks against this index manager.
    fn executor(&self) -> Arc<TaskPool>;

    /// Registers a hook to run when the index manager is dropped.
    ///
    /// Nexus factories use this to evict their cached instances.
    fn on_teardown(&self, hook: TeardownHook);
}
