//! Bounded task pool for step execution.
//!
//! Step tasks run on a fixed set of named worker threads fed by a bounded
//! queue. Submission never blocks: a full queue is reported to the caller.
//! Every task carries a [`CancelToken`] that the task polls cooperatively.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TrySendError};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::PoolConfig;
use crate::error::{ExecutionError, QuadlogError, QuadlogResult};

/// Unique identifier for a submitted task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(Uuid);

impl TaskId {
    /// Creates a new random task id.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Cooperative cancellation flag shared between a task and its handle.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    /// A fresh, uncancelled token.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests cancellation. Returns true only for the call that flipped the flag.
    pub fn cancel(&self) -> bool {
        !self.0.swap(true, Ordering::AcqRel)
    }

    /// Returns true once cancellation was requested.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    /// Fails with [`ExecutionError::Cancelled`] if cancellation was requested.
    pub fn check(&self, task: &str) -> Result<(), ExecutionError> {
        if self.is_cancelled() {
            return Err(ExecutionError::Cancelled {
                task: task.to_string(),
            });
        }
        Ok(())
    }
}

type Job = Box<dyn FnOnce() + Send + 'static>;

/// A fixed-size pool of worker threads draining a bounded job queue.
pub struct TaskPool {
    name: String,
    tx: Option<Sender<Job>>,
    workers: Vec<JoinHandle<()>>,
    queue_capacity: usize,
}

impl fmt::Debug for TaskPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskPool")
            .field("name", &self.name)
            .field("workers", &self.workers.len())
            .field("queue_capacity", &self.queue_capacity)
            .finish()
    }
}

impl TaskPool {
    /// Starts the workers.
    pub fn start(name: &str, config: &PoolConfig) -> QuadlogResult<Self> {
        let workers = config.workers.max(1);
        let queue_capacity = config.queue_capacity.max(1);
        let (tx, rx) = bounded::<Job>(queue_capacity);

        let mut handles = Vec::with_capacity(workers);
        for idx in 0..workers {
            let rx: Receiver<Job> = rx.clone();
            let handle = thread::Builder::new()
                .name(format!("quadlog-{name}-{idx}"))
                .spawn(move || {
                    while let Ok(job) = rx.recv() {
                        job();
                    }
                })
                .map_err(|e| QuadlogError::internal(format!("failed to spawn worker: {e}")))?;
            handles.push(handle);
        }

        tracing::debug!(pool = name, workers, queue_capacity, "task pool started");
        Ok(Self {
            name: name.to_string(),
            tx: Some(tx),
            workers: handles,
            queue_capacity,
        })
    }

    /// Pool label.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Number of worker threads.
    #[must_use]
    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    /// Maximum queued tasks.
    #[must_use]
    pub const fn queue_capacity(&self) -> usize {
        self.queue_capacity
    }

    /// Submits a task without blocking.
    ///
    /// A task whose token is cancelled before it starts never runs and
    /// reports [`ExecutionError::Cancelled`].
    pub fn submit<T, F>(&self, task: &str, f: F) -> QuadlogResult<TaskHandle<T>>
    where
        T: Send + 'static,
        F: FnOnce(&CancelToken) -> QuadlogResult<T> + Send + 'static,
    {
        let token = CancelToken::new();
        let (reply_tx, reply_rx) = bounded::<QuadlogResult<T>>(1);
        let job_token = token.clone();
        let job_name = task.to_string();
        let job: Job = Box::new(move || {
            let result = match job_token.check(&job_name) {
                Ok(()) => f(&job_token),
                Err(e) => Err(e.into()),
            };
            let _ = reply_tx.send(result);
        });

        let tx = self.tx.as_ref().ok_or_else(|| ExecutionError::Disconnected {
            path: self.name.clone(),
        })?;
        match tx.try_send(job) {
            Ok(()) => Ok(TaskHandle {
                id: TaskId::new(),
                name: task.to_string(),
                path: self.name.clone(),
                token,
                rx: reply_rx,
            }),
            Err(TrySendError::Full(_)) => Err(ExecutionError::QueueFull {
                capacity: self.queue_capacity,
            }
            .into()),
            Err(TrySendError::Disconnected(_)) => Err(ExecutionError::Disconnected {
                path: self.name.clone(),
            }
            .into()),
        }
    }
}

impl Drop for TaskPool {
    fn drop(&mut self) {
        // Close the queue: workers drain it then exit.
        drop(self.tx.take());
        let current = thread::current().id();
        for handle in self.workers.drain(..) {
            // The last owner may be a job running on this very pool.
            if handle.thread().id() != current {
                let _ = handle.join();
            }
        }
    }
}

/// Handle to a submitted task.
#[derive(Debug)]
pub struct TaskHandle<T> {
    id: TaskId,
    name: String,
    path: String,
    token: CancelToken,
    rx: Receiver<QuadlogResult<T>>,
}

impl<T> TaskHandle<T> {
    /// Task identifier.
    #[must_use]
    pub const fn id(&self) -> TaskId {
        self.id
    }

    /// Task label.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The token observed by the task.
    #[must_use]
    pub fn token(&self) -> &CancelToken {
        &self.token
    }

    /// Requests cancellation. Returns true only the first time.
    pub fn cancel(&self) -> bool {
        self.token.cancel()
    }

    /// Returns true once cancellation was requested.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Waits for the task to complete.
    pub fn join(self) -> QuadlogResult<T> {
        let path = self.path;
        self.rx
            .recv()
            .map_err(|_| QuadlogError::Execution(ExecutionError::Disconnected { path }))?
    }

    /// Waits for the task to complete with a timeout.
    pub fn join_timeout(self, timeout: Duration) -> QuadlogResult<T> {
        let path = self.path;
        self.rx.recv_timeout(timeout).map_err(|err| match err {
            RecvTimeoutError::Timeout => QuadlogError::Execution(ExecutionError::Timeout {
                duration_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
            }),
            RecvTimeoutError::Disconnected => {
                QuadlogError::Execution(ExecutionError::Disconnected { path })
            }
        })?
    }
}
