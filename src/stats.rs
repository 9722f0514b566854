//! Rule execution statistics.
//!
//! Statistics are accumulated in an open [`StatsBuilder`] and sealed into a
//! [`RuleStats`] exactly once by [`StatsBuilder::settle`], which consumes the
//! builder. The aggregate mutation count therefore cannot be assigned twice.

use std::fmt::Write as _;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Concurrent tally of elements written by buffer flushes.
#[derive(Debug, Default)]
pub struct MutationCounter(AtomicU64);

impl MutationCounter {
    /// A zero counter.
    #[must_use]
    pub const fn new() -> Self {
        Self(AtomicU64::new(0))
    }

    /// Adds `n` mutations.
    pub fn add(&self, n: u64) {
        self.0.fetch_add(n, Ordering::AcqRel);
    }

    /// Current total.
    #[must_use]
    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Acquire)
    }

    /// Returns the total and resets it to zero.
    pub fn take(&self) -> u64 {
        self.0.swap(0, Ordering::AcqRel)
    }
}

/// Open accumulator for one step.
#[derive(Debug)]
pub struct StatsBuilder {
    name: String,
    closure_round: u32,
    started: Instant,
    solution_count: u64,
    chunk_count: u64,
    children: Vec<RuleStats>,
}

impl StatsBuilder {
    /// Starts the clock for a step.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            closure_round: 0,
            started: Instant::now(),
            solution_count: 0,
            chunk_count: 0,
            children: Vec::new(),
        }
    }

    /// Tags the step with a closure round.
    pub fn set_closure_round(&mut self, round: u32) {
        self.closure_round = round;
    }

    /// Records solutions produced by this step itself.
    pub fn record_solutions(&mut self, n: u64) {
        self.solution_count += n;
    }

    /// Records chunks emitted by this step itself.
    pub fn record_chunks(&mut self, n: u64) {
        self.chunk_count += n;
    }

    /// Merges a finished child. The child's mutation count is kept in the
    /// detail but never folded into this builder.
    pub fn merge(&mut self, child: RuleStats) {
        self.solution_count += child.solution_count;
        self.chunk_count += child.chunk_count;
        self.children.push(child);
    }

    /// Seals the statistics with the aggregate mutation count.
    #[must_use]
    pub fn settle(self, mutation_count: u64) -> RuleStats {
        RuleStats {
            name: self.name,
            closure_round: self.closure_round,
            elapsed: self.started.elapsed(),
            solution_count: self.solution_count,
            chunk_count: self.chunk_count,
            mutation_count,
            children: self.children,
        }
    }
}

/// Sealed statistics for a finished step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleStats {
    name: String,
    closure_round: u32,
    elapsed: Duration,
    solution_count: u64,
    chunk_count: u64,
    mutation_count: u64,
    children: Vec<RuleStats>,
}

impl RuleStats {
    /// Step label.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Closure round, or 0 outside a closure.
    #[must_use]
    pub const fn closure_round(&self) -> u32 {
        self.closure_round
    }

    /// Wall time of the step.
    #[must_use]
    pub const fn elapsed(&self) -> Duration {
        self.elapsed
    }

    /// Solutions computed by the step and its children.
    #[must_use]
    pub const fn solution_count(&self) -> u64 {
        self.solution_count
    }

    /// Chunks emitted by the step and its children.
    #[must_use]
    pub const fn chunk_count(&self) -> u64 {
        self.chunk_count
    }

    /// Elements actually inserted or removed.
    #[must_use]
    pub const fn mutation_count(&self) -> u64 {
        self.mutation_count
    }

    /// Statistics of the sub-steps, in completion order.
    #[must_use]
    pub fn children(&self) -> &[Self] {
        &self.children
    }

    /// Per-round mutation deltas of a closure, in round order.
    #[must_use]
    pub fn round_deltas(&self) -> Vec<u64> {
        let mut rounds: Vec<&Self> = self.children.iter().filter(|c| c.closure_round > 0).collect();
        rounds.sort_by_key(|c| c.closure_round);
        rounds.iter().map(|c| c.mutation_count).collect()
    }

    /// Number of closure rounds recorded directly under this step.
    #[must_use]
    pub fn round_count(&self) -> usize {
        self.children.iter().filter(|c| c.closure_round > 0).count()
    }
}

/// Renders statistics through `tracing`.
#[derive(Debug, Clone, Copy, Default)]
pub struct RuleLog;

impl RuleLog {
    /// Header of the rendered table.
    pub const HEADER: &'static str = "rule, round, elapsed_ms, solutions, chunks, mutations";

    /// Logs the statistics at info level.
    pub fn log(stats: &RuleStats) {
        tracing::info!(
            target: "quadlog::rules",
            program = stats.name(),
            mutations = stats.mutation_count(),
            "\n{}",
            Self::render(stats)
        );
    }

    /// Renders the statistics as a comma-delimited table, one row per step.
    #[must_use]
    pub fn render(stats: &RuleStats) -> String {
        let mut out = String::from(Self::HEADER);
        Self::render_rows(stats, 0, &mut out);
        out
    }

    fn render_rows(stats: &RuleStats, depth: usize, out: &mut String) {
        let _ = write!(
            out,
            "\n{}{}, {}, {}, {}, {}, {}",
            "  ".repeat(depth),
            stats.name,
            stats.closure_round,
            stats.elapsed.as_millis(),
            stats.solution_count,
            stats.chunk_count,
            stats.mutation_count
        );
        for child in &stats.children {
            Self::render_rows(child, depth + 1, out);
        }
    }
}
