//! Program orchestration: dispatch, read consistency and closure fixed points.
//!
//! A query streams solutions through a [`QueryIterator`] while the producing
//! task runs on the index manager's executor. A mutation runs to completion
//! on the calling thread and reports how many elements actually changed. A closure program is
//! applied round after round until a round changes nothing.

use std::fmt;
use std::sync::Arc;

use crate::buffer::QueryIterator;
use crate::error::{ExecutionError, QuadlogError, QuadlogResult, ValidationError};
use crate::model::{Action, Step};
use crate::nexus::NexusFactory;
use crate::runtime::CancelToken;
use crate::stats::{RuleLog, RuleStats, StatsBuilder};
use crate::storage::{IndexManager, IndexManagerKind, StorageError, Timestamp, TxId};
use crate::task::{MutationTask, QueryTask};

/// Lifecycle of a [`ProgramOrchestrator`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OrchestratorState {
    /// Nothing submitted yet.
    Idle,
    /// Validating and routing a step.
    Dispatching,
    /// A query iterator was handed out.
    QueryStreaming,
    /// A mutation (or closure round) is running.
    MutationRunning,
    /// The last mutation completed.
    Done,
    /// The last submission failed.
    Failed,
}

/// Outcome of a mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MutationResult {
    /// Elements actually inserted or removed.
    pub count: u64,
    /// Statistics of the whole run.
    pub stats: RuleStats,
}

/// Outcome of [`submit`].
#[derive(Debug)]
pub enum Submission {
    /// Solutions of a query, produced asynchronously.
    Query(QueryIterator),
    /// Result of a completed mutation.
    Mutation(MutationResult),
}

impl Submission {
    /// The query iterator, or an internal error for a mutation result.
    pub fn into_query(self) -> QuadlogResult<QueryIterator> {
        match self {
            Self::Query(it) => Ok(it),
            Self::Mutation(_) => Err(QuadlogError::internal("expected a query submission")),
        }
    }

    /// The mutation result, or an internal error for a query.
    pub fn into_mutation(self) -> QuadlogResult<MutationResult> {
        match self {
            Self::Mutation(result) => Ok(result),
            Self::Query(_) => Err(QuadlogError::internal("expected a mutation submission")),
        }
    }
}

fn transaction_error(err: &StorageError) -> ExecutionError {
    ExecutionError::Transaction { reason: err.to_string() }
}

/// Pins a read-consistent view for the duration of one mutation.
///
/// On a federation the last commit point is pinned. On a journal that reuses
/// slots a commit is forced and pinned, so the mutation never reads a slot it
/// is rewriting. A write-once journal needs nothing. The pinned point is read
/// through a nexus of its own; the shared factory is never moved. Dropping
/// the guard aborts the read-only transaction.
struct ReadConsistencyGuard<'a> {
    index_manager: &'a dyn IndexManager,
    tx: Option<TxId>,
    read_timestamp: Option<Timestamp>,
}

impl<'a> ReadConsistencyGuard<'a> {
    fn acquire(index_manager: &'a dyn IndexManager) -> Result<Self, ExecutionError> {
        let pin = match index_manager.kind() {
            IndexManagerKind::Federation { .. } => true,
            IndexManagerKind::Journal { slot_reuse: true } => {
                index_manager.commit().map_err(|e| transaction_error(&e))?;
                true
            }
            IndexManagerKind::Journal { slot_reuse: false } => false,
        };
        let mut guard = Self {
            index_manager,
            tx: None,
            read_timestamp: None,
        };
        if pin {
            let (tx, ts) = index_manager
                .pin_last_commit()
                .map_err(|e| transaction_error(&e))?;
            guard.tx = Some(tx);
            guard.read_timestamp = Some(ts);
            tracing::debug!(%tx, read = %ts, "read-consistent view pinned");
        }
        Ok(guard)
    }

    /// Commit point the mutation reads, if one was pinned.
    const fn read_timestamp(&self) -> Option<Timestamp> {
        self.read_timestamp
    }

    fn release(mut self) -> Result<(), ExecutionError> {
        self.finish()
    }

    fn finish(&mut self) -> Result<(), ExecutionError> {
        match self.tx.take() {
            Some(tx) => self.index_manager.abort(tx).map_err(|e| transaction_error(&e)),
            None => Ok(()),
        }
    }
}

impl Drop for ReadConsistencyGuard<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.finish() {
            tracing::warn!(error = %e, "failed to release read-only transaction");
        }
    }
}

/// Routes steps to query, mutation or closure execution.
pub struct ProgramOrchestrator {
    factory: Arc<NexusFactory>,
    index_manager: Arc<dyn IndexManager>,
    action: Action,
    state: OrchestratorState,
}

impl fmt::Debug for ProgramOrchestrator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProgramOrchestrator")
            .field("factory", &self.factory.fingerprint())
            .field("index_manager", &self.index_manager.id())
            .field("action", &self.action)
            .field("state", &self.state)
            .finish()
    }
}

impl ProgramOrchestrator {
    /// An orchestrator applying `action` through `factory` on `index_manager`.
    #[must_use]
    pub fn new(factory: Arc<NexusFactory>, index_manager: Arc<dyn IndexManager>, action: Action) -> Self {
        Self {
            factory,
            index_manager,
            action,
            state: OrchestratorState::Idle,
        }
    }

    /// Current lifecycle state.
    #[must_use]
    pub const fn state(&self) -> OrchestratorState {
        self.state
    }

    /// Validates and runs `step`.
    ///
    /// Queries return as soon as the producing task is scheduled. Mutations
    /// block until every write is flushed.
    pub fn execute(&mut self, step: &Step) -> QuadlogResult<Submission> {
        self.state = OrchestratorState::Dispatching;
        let result = self.dispatch(step);
        self.state = match &result {
            Ok(Submission::Query(_)) => OrchestratorState::QueryStreaming,
            Ok(Submission::Mutation(_)) => OrchestratorState::Done,
            Err(_) => OrchestratorState::Failed,
        };
        result
    }

    fn dispatch(&mut self, step: &Step) -> QuadlogResult<Submission> {
        step.validate()?;
        if !self.action.is_mutation() {
            if step.involves_closure() {
                return Err(ValidationError::ClosureRequiresMutation {
                    program: step.name().to_string(),
                    action: self.action,
                }
                .into());
            }
            return self.execute_query(step).map(Submission::Query);
        }

        self.state = OrchestratorState::MutationRunning;
        let stats = if step.is_closure() {
            self.execute_closure(step)?
        } else if step.embeds_closure() {
            self.execute_program_with_embedded_closure(step)?
        } else {
            self.execute_mutation(step, 0)?
        };
        RuleLog::log(&stats);
        Ok(Submission::Mutation(MutationResult {
            count: stats.mutation_count(),
            stats,
        }))
    }

    fn execute_query(&self, step: &Step) -> QuadlogResult<QueryIterator> {
        let nexus = self.factory.new_instance(&self.index_manager)?;
        let (buffer, mut iterator) = nexus.new_query_buffer();
        let task = QueryTask::new(Arc::clone(&nexus), step.clone());
        let executor = self.index_manager.executor();
        // The nexus only holds the index manager weakly.
        let index_manager = Arc::clone(&self.index_manager);
        match executor.submit(step.name(), move |token| {
            let stats = task.run(buffer, token);
            drop(index_manager);
            stats
        }) {
            Ok(handle) => {
                tracing::debug!(task = %handle.id(), step = step.name(), "query scheduled");
                iterator.attach(handle);
                Ok(iterator)
            }
            Err(e) => {
                tracing::error!(step = step.name(), error = %e, "failed to schedule query");
                iterator.cancel();
                Err(e)
            }
        }
    }

    /// Runs on the calling thread, so open query iterators holding every
    /// executor worker cannot starve it.
    fn execute_mutation(&self, step: &Step, closure_round: u32) -> QuadlogResult<RuleStats> {
        let guard = ReadConsistencyGuard::acquire(self.index_manager.as_ref())?;
        let nexus = match guard.read_timestamp() {
            Some(ts) => self.factory.pinned_instance(&self.index_manager, ts),
            None => self.factory.new_instance(&self.index_manager)?,
        };
        let task = MutationTask::new(nexus, self.action, closure_round);
        let stats = task.run(step, &CancelToken::new())?;
        guard.release()?;
        Ok(stats)
    }

    fn execute_closure(&self, step: &Step) -> QuadlogResult<RuleStats> {
        let limit = self.factory.config().max_closure_rounds;
        let mut totals = StatsBuilder::new(step.name());
        let mut total = 0;
        let mut round = 0;
        loop {
            round += 1;
            if let Some(max) = limit {
                if round > max {
                    return Err(ExecutionError::ClosureDiverged {
                        program: step.name().to_string(),
                        rounds: max,
                    }
                    .into());
                }
            }
            let stats = self.execute_mutation(step, round)?;
            let delta = stats.mutation_count();
            tracing::debug!(program = step.name(), round, delta, "closure round complete");
            total += delta;
            totals.merge(stats);
            if delta == 0 {
                break;
            }
        }
        tracing::info!(program = step.name(), mutations = total, "Computed fixed point after {round} rounds");
        Ok(totals.settle(total))
    }

    fn execute_program_with_embedded_closure(&self, step: &Step) -> QuadlogResult<RuleStats> {
        let Step::Program(program) = step else {
            return self.execute_mutation(step, 0);
        };
        if program.is_parallel() {
            return Err(ValidationError::ParallelEmbedsClosure {
                program: program.name().to_string(),
            }
            .into());
        }
        let mut stats = StatsBuilder::new(program.name());
        let mut total = 0;
        for child in program.steps() {
            let child = if child.is_closure() {
                self.execute_closure(child)?
            } else if child.embeds_closure() {
                self.execute_program_with_embedded_closure(child)?
            } else {
                self.execute_mutation(child, 0)?
            };
            total += child.mutation_count();
            stats.merge(child);
        }
        Ok(stats.settle(total))
    }
}

/// Runs `step` with `action` on `index_manager` through `factory`.
///
/// `action` decides the dispatch; the factory's own action is only a default
/// for callers going through [`EvaluationNexus`](crate::nexus::EvaluationNexus).
pub fn submit(
    step: &Step,
    action: Action,
    factory: &Arc<NexusFactory>,
    index_manager: Arc<dyn IndexManager>,
) -> QuadlogResult<Submission> {
    ProgramOrchestrator::new(Arc::clone(factory), index_manager, action).execute(step)
}
