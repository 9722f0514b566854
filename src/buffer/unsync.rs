use std::fmt;
use std::sync::Arc;

use crate::error::QuadlogResult;
use crate::model::{Solution, SolutionFilter};

use super::SolutionSink;

/// Single-writer front for a shared sink.
///
/// Solutions rejected by the filter never reach the target. Accepted
/// solutions are forwarded in chunks of `capacity`.
pub struct UnsynchronizedBuffer {
    target: Arc<dyn SolutionSink>,
    filter: Option<SolutionFilter>,
    capacity: usize,
    chunk: Vec<Solution>,
    accepted: u64,
    rejected: u64,
    chunks: u64,
}

impl fmt::Debug for UnsynchronizedBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UnsynchronizedBuffer")
            .field("capacity", &self.capacity)
            .field("pending", &self.chunk.len())
            .field("accepted", &self.accepted)
            .field("rejected", &self.rejected)
            .finish_non_exhaustive()
    }
}

impl UnsynchronizedBuffer {
    /// Creates a buffer forwarding to `target`.
    #[must_use]
    pub fn new(target: Arc<dyn SolutionSink>, capacity: usize, filter: Option<SolutionFilter>) -> Self {
        let capacity = capacity.max(1);
        Self {
            target,
            filter,
            capacity,
            chunk: Vec::with_capacity(capacity),
            accepted: 0,
            rejected: 0,
            chunks: 0,
        }
    }

    /// Adds a solution. Returns false if the filter rejected it.
    pub fn add(&mut self, solution: Solution) -> QuadlogResult<bool> {
        if let Some(filter) = &self.filter {
            if !filter.accept(&solution) {
                self.rejected += 1;
                return Ok(false);
            }
        }
        self.chunk.push(solution);
        self.accepted += 1;
        if self.chunk.len() >= self.capacity {
            self.forward()?;
        }
        Ok(true)
    }

    /// Forwards the partial chunk to the target.
    pub fn flush(&mut self) -> QuadlogResult<()> {
        self.forward()
    }

    fn forward(&mut self) -> QuadlogResult<()> {
        if self.chunk.is_empty() {
            return Ok(());
        }
        let chunk = std::mem::replace(&mut self.chunk, Vec::with_capacity(self.capacity));
        self.chunks += 1;
        self.target.add_chunk(chunk)
    }

    /// Solutions accepted so far.
    #[must_use]
    pub const fn accepted(&self) -> u64 {
        self.accepted
    }

    /// Solutions rejected by the filter so far.
    #[must_use]
    pub const fn rejected(&self) -> u64 {
        self.rejected
    }

    /// Chunks forwarded so far.
    #[must_use]
    pub const fn chunks(&self) -> u64 {
        self.chunks
    }
}
