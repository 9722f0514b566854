//! Solution buffers.
//!
//! Producers push chunks of solutions into a [`SolutionSink`]. Three sinks
//! exist:
//! - [`BlockingBuffer`]: bounded queue drained by a [`QueryIterator`];
//! - [`MutationBuffer`]: writes or deletes head elements on flush;
//! - [`UnsynchronizedBuffer`]: single-writer front that batches and filters
//!   solutions before forwarding them to a shared sink.

mod blocking;
mod mutation;
mod unsync;

pub use blocking::{BlockingBuffer, QueryIterator};
pub use mutation::MutationBuffer;
pub use unsync::UnsynchronizedBuffer;

use crate::error::QuadlogResult;
use crate::model::Solution;

/// A thread-safe destination for chunks of solutions.
pub trait SolutionSink: Send + Sync {
    /// Adds a chunk. May block while the sink is full.
    fn add_chunk(&self, chunk: Vec<Solution>) -> QuadlogResult<()>;

    /// Writes anything pending and returns the number of elements changed
    /// since the previous flush. Calling it again with nothing pending
    /// returns 0.
    fn flush(&self) -> QuadlogResult<u64>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn _assert_sink_object_safe(_: &dyn SolutionSink) {}
}
