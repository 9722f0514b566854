//! Storage interfaces consumed by the engine, plus in-memory backends.
//!
//! The engine never touches physical indices; it reads and writes relations
//! through [`RelationView`] and manages commit points through [`IndexManager`].

pub mod memory;
mod traits;

pub use memory::{CommitRecord, MemoryFederation, MemoryJournal, MemoryView, SlotPolicy};
pub use traits::{
    IndexManager, IndexManagerId, IndexManagerKind, PartitionId, RelationView, StorageError, TeardownHook,
    Timestamp, TxId,
};
