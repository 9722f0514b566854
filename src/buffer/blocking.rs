use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};

use crate::config::BufferConfig;
use crate::error::{ExecutionError, QuadlogError, QuadlogResult};
use crate::model::Solution;
use crate::runtime::{CancelToken, TaskHandle};
use crate::stats::RuleStats;

use super::SolutionSink;

/// Producer side of a query: a bounded queue of solution chunks.
///
/// Producers block while the queue is full. Once the consuming
/// [`QueryIterator`] is closed every further chunk is rejected.
#[derive(Debug)]
pub struct BlockingBuffer {
    tx: Sender<Vec<Solution>>,
    closed: Arc<AtomicBool>,
}

impl BlockingBuffer {
    /// Creates a buffer and the iterator draining it.
    #[must_use]
    pub fn new(config: &BufferConfig) -> (Self, QueryIterator) {
        let (tx, rx) = bounded(config.chunk_of_chunks_capacity.max(1));
        let closed = Arc::new(AtomicBool::new(false));
        let iterator = QueryIterator {
            rx: Some(rx),
            pending: VecDeque::new(),
            handle: None,
            closed: Arc::clone(&closed),
            chunk_capacity: config.chunk_capacity.max(1),
            chunk_timeout: config.chunk_timeout,
            finished: false,
            stats: None,
        };
        (Self { tx, closed }, iterator)
    }

    /// Returns true once the consumer has gone away.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

impl SolutionSink for BlockingBuffer {
    fn add_chunk(&self, chunk: Vec<Solution>) -> QuadlogResult<()> {
        if self.is_closed() {
            return Err(ExecutionError::BufferClosed.into());
        }
        if chunk.is_empty() {
            return Ok(());
        }
        self.tx
            .send(chunk)
            .map_err(|_| QuadlogError::Execution(ExecutionError::BufferClosed))
    }

    fn flush(&self) -> QuadlogResult<u64> {
        Ok(0)
    }
}

/// Consumer side of a query.
///
/// Chunks are combined up to the configured chunk capacity; if the fill
/// timeout expires first the partial chunk is returned. When the producer
/// finishes with an error, the iterator yields that error once and then ends.
///
/// Dropping or cancelling the iterator cancels the producing task.
#[derive(Debug)]
pub struct QueryIterator {
    rx: Option<Receiver<Vec<Solution>>>,
    pending: VecDeque<Solution>,
    handle: Option<TaskHandle<RuleStats>>,
    closed: Arc<AtomicBool>,
    chunk_capacity: usize,
    chunk_timeout: Duration,
    finished: bool,
    stats: Option<RuleStats>,
}

impl QueryIterator {
    /// Attaches the task producing into the paired buffer.
    pub fn attach(&mut self, handle: TaskHandle<RuleStats>) {
        if self.closed.load(Ordering::Acquire) {
            handle.cancel();
            return;
        }
        self.handle = Some(handle);
    }

    /// Returns true once a producing task is attached.
    #[must_use]
    pub const fn is_attached(&self) -> bool {
        self.handle.is_some()
    }

    /// Token of the producing task, if one is attached.
    #[must_use]
    pub fn cancel_token(&self) -> Option<CancelToken> {
        self.handle.as_ref().map(|h| h.token().clone())
    }

    /// Statistics of the producing task, once the iterator is exhausted.
    #[must_use]
    pub const fn stats(&self) -> Option<&RuleStats> {
        self.stats.as_ref()
    }

    /// Returns true once the iterator was closed or exhausted.
    #[must_use]
    pub const fn is_finished(&self) -> bool {
        self.finished
    }

    /// Closes the iterator and cancels the producing task.
    ///
    /// Returns true only for the first call.
    pub fn cancel(&mut self) -> bool {
        if self.closed.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.finished = true;
        self.pending.clear();
        // Dropping the receiver unblocks producers waiting on a full queue.
        self.rx = None;
        if let Some(handle) = self.handle.take() {
            if handle.cancel() {
                tracing::debug!(task = %handle.id(), name = handle.name(), "query cancelled");
            }
        }
        true
    }

    /// The next combined chunk.
    pub fn next_chunk(&mut self) -> Option<QuadlogResult<Vec<Solution>>> {
        if self.finished {
            return None;
        }
        let Some(rx) = self.rx.as_ref() else {
            self.finished = true;
            return None;
        };
        let Ok(mut chunk) = rx.recv() else {
            return self.finish();
        };

        let deadline = Instant::now() + self.chunk_timeout;
        while chunk.len() < self.chunk_capacity {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match rx.recv_timeout(remaining) {
                Ok(more) => chunk.extend(more),
                Err(RecvTimeoutError::Timeout | RecvTimeoutError::Disconnected) => break,
            }
        }
        Some(Ok(chunk))
    }

    fn finish(&mut self) -> Option<QuadlogResult<Vec<Solution>>> {
        self.finished = true;
        self.rx = None;
        self.closed.store(true, Ordering::Release);
        let handle = self.handle.take()?;
        match handle.join() {
            Ok(stats) => {
                self.stats = Some(stats);
                None
            }
            Err(e) if e.is_cancelled() => None,
            Err(e) => Some(Err(e)),
        }
    }

    /// Adapts the iterator into an async stream.
    ///
    /// The iterator is drained on a blocking task of the current tokio runtime.
    #[cfg(feature = "async")]
    pub fn into_stream(self) -> tokio_stream::wrappers::ReceiverStream<QuadlogResult<Solution>> {
        let (tx, rx) = tokio::sync::mpsc::channel(self.chunk_capacity);
        tokio::task::spawn_blocking(move || {
            for item in self {
                if tx.blocking_send(item).is_err() {
                    break;
                }
            }
        });
        tokio_stream::wrappers::ReceiverStream::new(rx)
    }
}

impl Iterator for QueryIterator {
    type Item = QuadlogResult<Solution>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(solution) = self.pending.pop_front() {
                return Some(Ok(solution));
            }
            match self.next_chunk()? {
                Ok(chunk) => self.pending.extend(chunk),
                Err(e) => return Some(Err(e)),
            }
        }
    }
}

impl Drop for QueryIterator {
    fn drop(&mut self) {
        self.cancel();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;

    use super::*;
    use crate::config::PoolConfig;
    use crate::model::{BindingSet, Predicate, Rule, SolutionFlags, Term, TermId, Var};
    use crate::runtime::TaskPool;
    use crate::stats::StatsBuilder;

    fn solution(x: u64) -> Solution {
        let rule = Arc::new(
            Rule::builder("r")
                .head(Predicate::new("out", vec![Term::var("x")]).unwrap())
                .tail(Predicate::new("in", vec![Term::var("x")]).unwrap())
                .build()
                .unwrap(),
        );
        let mut bs = BindingSet::new();
        bs.set(Var::new("x"), TermId::new(x));
        Solution::new(SolutionFlags::ELEMENT, &rule, &bs)
    }

    fn config(chunk_capacity: usize, chunk_of_chunks_capacity: usize) -> BufferConfig {
        BufferConfig {
            chunk_capacity,
            chunk_of_chunks_capacity,
            chunk_timeout: Duration::from_millis(5),
            ..BufferConfig::default()
        }
    }

    #[test]
    fn drains_all_chunks_after_producer_finishes() {
        let (buffer, mut it) = BlockingBuffer::new(&config(10, 4));
        buffer.add_chunk(vec![solution(1), solution(2)]).unwrap();
        buffer.add_chunk(vec![solution(3)]).unwrap();
        drop(buffer);

        let chunk = it.next_chunk().unwrap().unwrap();
        assert_eq!(chunk.len(), 3);
        assert!(it.next_chunk().is_none());
        assert!(it.is_finished());
    }

    #[test]
    fn producer_blocks_until_consumer_drains() {
        let (buffer, it) = BlockingBuffer::new(&config(1, 1));
        let producer = thread::spawn(move || {
            for i in 0..20 {
                buffer.add_chunk(vec![solution(i)]).unwrap();
            }
        });
        let got: Vec<_> = it.map(Result::unwrap).collect();
        producer.join().unwrap();
        assert_eq!(got.len(), 20);
    }

    #[test]
    fn closing_the_iterator_rejects_producers() {
        let (buffer, mut it) = BlockingBuffer::new(&config(1, 1));
        assert!(it.cancel());
        assert!(!it.cancel());
        assert!(buffer.is_closed());
        let err = buffer.add_chunk(vec![solution(1)]).unwrap_err();
        assert!(matches!(err, QuadlogError::Execution(ExecutionError::BufferClosed)));
    }

    #[test]
    fn task_error_is_yielded_once() {
        let pool = TaskPool::start("test", &PoolConfig::default()).unwrap();
        let (buffer, mut it) = BlockingBuffer::new(&config(4, 4));
        let handle = pool
            .submit("failing", move |_| {
                buffer.add_chunk(vec![solution(1)])?;
                Err(QuadlogError::internal("boom"))
            })
            .unwrap();
        it.attach(handle);

        assert!(it.next().unwrap().is_ok());
        let err = it.next().unwrap().unwrap_err();
        assert!(err.to_string().contains("boom"));
        assert!(it.next().is_none());
    }

    #[test]
    fn stats_are_available_after_exhaustion() {
        let pool = TaskPool::start("test", &PoolConfig::default()).unwrap();
        let (buffer, mut it) = BlockingBuffer::new(&config(4, 4));
        let handle = pool
            .submit("ok", move |_| {
                buffer.add_chunk(vec![solution(7)])?;
                let mut stats = StatsBuilder::new("ok");
                stats.record_solutions(1);
                Ok(stats.settle(0))
            })
            .unwrap();
        it.attach(handle);
        assert_eq!(it.by_ref().count(), 1);
        assert_eq!(it.stats().map(RuleStats::solution_count), Some(1));
    }

    #[test]
    fn drop_cancels_attached_task() {
        let pool = TaskPool::start("test", &PoolConfig::default()).unwrap();
        let (buffer, mut it) = BlockingBuffer::new(&config(1, 1));
        let handle = pool
            .submit("endless", move |token| {
                let mut i = 0;
                loop {
                    token.check("endless")?;
                    buffer.add_chunk(vec![solution(i)])?;
                    i += 1;
                }
            })
            .unwrap();
        it.attach(handle);
        let token = it.cancel_token().unwrap();
        assert!(it.next().unwrap().is_ok());
        drop(it);
        assert!(token.is_cancelled());
    }
}
