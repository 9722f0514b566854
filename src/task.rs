//! Tasks evaluating one step against a nexus.
//!
//! [`QueryTask`] streams solutions into a [`BlockingBuffer`]. [`MutationTask`]
//! writes the head elements of every rule and reports how many elements
//! actually changed.
//!
//! Steps of a sequential program run one after another, and the writes of a
//! mutation step are flushed before the next step starts. Steps of a parallel
//! program run concurrently, at most `max_parallel_subqueries` at a time; their
//! writes are flushed together once every step has finished.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::thread;

use crate::buffer::{BlockingBuffer, MutationBuffer, SolutionSink};
use crate::error::{QuadlogError, QuadlogResult};
use crate::join;
use crate::model::{Action, Program, QueryOptions, Solution, SolutionFlags, Step};
use crate::nexus::EvaluationNexus;
use crate::runtime::CancelToken;
use crate::stats::{RuleStats, StatsBuilder};

/// Runs `f` over `steps`, at most `width` at a time, keeping step order.
fn run_grouped<T, F>(steps: &[Step], width: usize, f: F) -> QuadlogResult<Vec<T>>
where
    T: Send,
    F: Fn(&Step) -> QuadlogResult<T> + Sync,
{
    let f = &f;
    let mut out = Vec::with_capacity(steps.len());
    for group in steps.chunks(width.max(1)) {
        let results: Vec<QuadlogResult<T>> = thread::scope(|s| {
            let handles: Vec<_> = group.iter().map(|step| s.spawn(move || f(step))).collect();
            handles
                .into_iter()
                .map(|h| {
                    h.join()
                        .unwrap_or_else(|_| Err(QuadlogError::internal("program step panicked")))
                })
                .collect()
        });
        for result in results {
            out.push(result?);
        }
    }
    Ok(out)
}

fn runs_parallel(nexus: &EvaluationNexus, program: &Program) -> bool {
    program.is_parallel() && nexus.config().allows_parallel_rules() && program.step_count() > 1
}

/// Sink collecting every solution for post-processing.
#[derive(Debug, Default)]
struct Collector(Mutex<Vec<Solution>>);

impl Collector {
    fn take(&self) -> QuadlogResult<Vec<Solution>> {
        let mut guard = self
            .0
            .lock()
            .map_err(|_| QuadlogError::internal("poisoned lock: query collector"))?;
        Ok(std::mem::take(&mut *guard))
    }
}

impl SolutionSink for Collector {
    fn add_chunk(&self, chunk: Vec<Solution>) -> QuadlogResult<()> {
        self.0
            .lock()
            .map_err(|_| QuadlogError::internal("poisoned lock: query collector"))?
            .extend(chunk);
        Ok(())
    }

    fn flush(&self) -> QuadlogResult<u64> {
        Ok(0)
    }
}

/// Applies ordering, restriction, de-duplication and slicing, in that order.
fn post_process(mut solutions: Vec<Solution>, options: &QueryOptions, flags: SolutionFlags) -> Vec<Solution> {
    if !options.order_by.is_empty() {
        solutions.sort_by_cached_key(|s| {
            options
                .order_by
                .iter()
                .map(|v| s.bindings().and_then(|b| b.get(v)))
                .collect::<Vec<_>>()
        });
    }
    let mut solutions: Vec<Solution> = solutions.into_iter().map(|s| s.restrict(flags)).collect();
    if options.distinct {
        let mut seen = HashSet::new();
        solutions.retain(|s| seen.insert((s.element().cloned(), s.bindings().cloned())));
    }
    if let Some(slice) = options.slice {
        let offset = usize::try_from(slice.offset).unwrap_or(usize::MAX);
        let limit = slice
            .limit
            .map_or(usize::MAX, |l| usize::try_from(l).unwrap_or(usize::MAX));
        solutions = solutions.into_iter().skip(offset).take(limit).collect();
    }
    solutions
}

/// Evaluates a step as a query, streaming into a blocking buffer.
#[derive(Debug)]
pub struct QueryTask {
    nexus: Arc<EvaluationNexus>,
    step: Step,
}

impl QueryTask {
    /// A task evaluating `step` against `nexus`.
    #[must_use]
    pub const fn new(nexus: Arc<EvaluationNexus>, step: Step) -> Self {
        Self { nexus, step }
    }

    /// Runs the query. The buffer is dropped on return, which ends the
    /// paired iterator.
    pub fn run(self, buffer: BlockingBuffer, token: &CancelToken) -> QuadlogResult<RuleStats> {
        let flags = self.nexus.solution_flags();
        let options = self.step.options();
        let buffer: Arc<dyn SolutionSink> = Arc::new(buffer);
        if options.is_empty() {
            return self.evaluate(&self.step, flags, &buffer, token);
        }

        let collector = Arc::new(Collector::default());
        let sink: Arc<dyn SolutionSink> = Arc::clone(&collector) as Arc<dyn SolutionSink>;
        let stats = self.evaluate(&self.step, flags | SolutionFlags::BINDINGS, &sink, token)?;
        let solutions = post_process(collector.take()?, options, flags);
        tracing::trace!(step = self.step.name(), kept = solutions.len(), "query options applied");

        let capacity = self.nexus.config().chunk_capacity.max(1);
        let mut chunk = Vec::with_capacity(capacity);
        for solution in solutions {
            chunk.push(solution);
            if chunk.len() == capacity {
                token.check(self.step.name())?;
                buffer.add_chunk(std::mem::replace(&mut chunk, Vec::with_capacity(capacity)))?;
            }
        }
        buffer.add_chunk(chunk)?;
        Ok(stats)
    }

    fn evaluate(
        &self,
        step: &Step,
        flags: SolutionFlags,
        sink: &Arc<dyn SolutionSink>,
        token: &CancelToken,
    ) -> QuadlogResult<RuleStats> {
        match step {
            Step::Rule(rule) => Ok(join::evaluate(&self.nexus, rule, flags, Arc::clone(sink), token)?.settle(0)),
            Step::Program(program) => {
                let mut stats = StatsBuilder::new(program.name());
                let children = if runs_parallel(&self.nexus, program) {
                    run_grouped(program.steps(), self.nexus.config().max_parallel_subqueries, |s| {
                        self.evaluate(s, flags, sink, token)
                    })?
                } else {
                    program
                        .steps()
                        .iter()
                        .map(|s| self.evaluate(s, flags, sink, token))
                        .collect::<QuadlogResult<Vec<_>>>()?
                };
                for child in children {
                    stats.merge(child);
                }
                Ok(stats.settle(0))
            }
        }
    }
}

/// A rule evaluated into a mutation buffer that has not been flushed yet.
enum Staged {
    Open {
        stats: StatsBuilder,
        buffer: Arc<MutationBuffer>,
    },
    Done {
        stats: StatsBuilder,
        mutations: u64,
    },
}

impl Staged {
    fn settle(self) -> QuadlogResult<RuleStats> {
        match self {
            Self::Open { stats, buffer } => {
                let mutations = buffer.flush()?;
                Ok(stats.settle(mutations))
            }
            Self::Done { stats, mutations } => Ok(stats.settle(mutations)),
        }
    }
}

/// Evaluates a step as an insert or delete.
///
/// Never handles closures: the orchestrator drives closure rounds and
/// submits one task per round.
#[derive(Debug)]
pub struct MutationTask {
    nexus: Arc<EvaluationNexus>,
    action: Action,
    closure_round: u32,
}

impl MutationTask {
    /// A task applying `action` with `nexus`, tagged with `closure_round`
    /// (0 outside a closure).
    #[must_use]
    pub const fn new(nexus: Arc<EvaluationNexus>, action: Action, closure_round: u32) -> Self {
        Self {
            nexus,
            action,
            closure_round,
        }
    }

    /// Runs the step and returns its statistics; the mutation count is the
    /// number of elements actually changed.
    pub fn run(&self, step: &Step, token: &CancelToken) -> QuadlogResult<RuleStats> {
        let (mut stats, mutations) = self.mutate(step, token)?;
        stats.set_closure_round(self.closure_round);
        Ok(stats.settle(mutations))
    }

    fn mutate(&self, step: &Step, token: &CancelToken) -> QuadlogResult<(StatsBuilder, u64)> {
        match self.stage(step, token)? {
            Staged::Open { stats, buffer } => Ok((stats, buffer.flush()?)),
            Staged::Done { stats, mutations } => Ok((stats, mutations)),
        }
    }

    /// Evaluates a step. Rules are left unflushed.
    fn stage(&self, step: &Step, token: &CancelToken) -> QuadlogResult<Staged> {
        match step {
            Step::Rule(rule) => {
                let buffer = Arc::new(
                    self.nexus
                        .new_mutation_buffer(self.action, rule.head().relation())?,
                );
                let sink: Arc<dyn SolutionSink> = Arc::clone(&buffer) as Arc<dyn SolutionSink>;
                let flags = self.nexus.solution_flags() | SolutionFlags::ELEMENT;
                let stats = join::evaluate(&self.nexus, rule, flags, sink, token)?;
                Ok(Staged::Open { stats, buffer })
            }
            Step::Program(program) => {
                let mut stats = StatsBuilder::new(program.name());
                let mut mutations = 0;
                if runs_parallel(&self.nexus, program) {
                    let staged = run_grouped(program.steps(), self.nexus.config().max_parallel_subqueries, |s| {
                        self.stage(s, token)
                    })?;
                    for child in staged {
                        let child = child.settle()?;
                        mutations += child.mutation_count();
                        stats.merge(child);
                    }
                } else {
                    for child in program.steps() {
                        let (child, n) = self.mutate(child, token)?;
                        mutations += n;
                        stats.merge(child.settle(n));
                    }
                }
                Ok(Staged::Done { stats, mutations })
            }
        }
    }
}
