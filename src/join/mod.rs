//! Join strategies and rule evaluation.
//!
//! A rule is evaluated by joining its tail predicates in plan order and
//! writing one solution per surviving binding set into a sink. The strategy
//! is picked per rule: a rule may force one, otherwise the deployment shape
//! of the index manager decides.

mod distributed;
mod local;
mod plan;

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::buffer::{SolutionSink, UnsynchronizedBuffer};
use crate::error::QuadlogResult;
use crate::model::{Rule, SolutionFlags};
use crate::nexus::EvaluationNexus;
use crate::runtime::CancelToken;
use crate::stats::StatsBuilder;
use crate::storage::{IndexManagerKind, RelationView};

pub use plan::{EvaluationPlan, PlanKind};

/// How the joins of a rule are executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JoinStrategy {
    /// One in-process worker per join dimension against local handles.
    LocalPipeline,
    /// One worker per index partition touched, per join dimension.
    DistributedPipeline,
}

impl fmt::Display for JoinStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::LocalPipeline => f.write_str("local-pipeline"),
            Self::DistributedPipeline => f.write_str("distributed-pipeline"),
        }
    }
}

/// Picks the join strategy for each rule invocation.
///
/// Nothing is cached: a program may mix a scratch relation on a journal
/// with relations on a federation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct JoinStrategyFactory {
    default: Option<JoinStrategy>,
}

impl JoinStrategyFactory {
    /// A factory using `default` for rules that do not force a strategy.
    /// `None` selects by index manager kind.
    #[must_use]
    pub const fn new(default: Option<JoinStrategy>) -> Self {
        Self { default }
    }

    /// Strategy for `rule` against an index manager of the given kind.
    #[must_use]
    pub fn select(&self, rule: &Rule, kind: IndexManagerKind) -> JoinStrategy {
        rule.strategy().or(self.default).unwrap_or(match kind {
            IndexManagerKind::Federation { .. } => JoinStrategy::DistributedPipeline,
            IndexManagerKind::Journal { .. } => JoinStrategy::LocalPipeline,
        })
    }
}

/// Everything a pipeline needs to join one rule.
#[derive(Clone, Copy)]
pub(crate) struct JoinInput<'a> {
    pub(crate) nexus: &'a EvaluationNexus,
    pub(crate) rule: &'a Arc<Rule>,
    pub(crate) plan: &'a [usize],
    /// Aligned with the rule tail.
    pub(crate) views: &'a [Arc<dyn RelationView>],
}

/// Evaluates `rule` into `sink`, returning open statistics for the rule.
///
/// Solutions pass the nexus filter before they reach the sink.
pub fn evaluate(
    nexus: &EvaluationNexus,
    rule: &Arc<Rule>,
    flags: SolutionFlags,
    sink: Arc<dyn SolutionSink>,
    token: &CancelToken,
) -> QuadlogResult<StatsBuilder> {
    let mut stats = StatsBuilder::new(rule.name());
    token.check(rule.name())?;

    let views = rule
        .tail()
        .iter()
        .map(|p| nexus.tail_view(p))
        .collect::<QuadlogResult<Vec<_>>>()?;
    let plan = match nexus.plan_kind() {
        PlanKind::Fixed => EvaluationPlan::fixed(rule),
        PlanKind::RangeCount => EvaluationPlan::range_count(rule, &views, &nexus.new_binding_set(rule))?,
    };
    let strategy = nexus.join_strategy(rule);
    tracing::trace!(rule = rule.name(), %strategy, order = ?plan.order(), "evaluating rule");

    let mut out = nexus.new_unsynchronized_buffer(sink, nexus.config().chunk_capacity);
    let input = JoinInput {
        nexus,
        rule,
        plan: plan.order(),
        views: &views,
    };
    match strategy {
        JoinStrategy::LocalPipeline => local::run(&input, flags, &mut out, token)?,
        JoinStrategy::DistributedPipeline => distributed::run(&input, flags, &mut out, token)?,
    }

    stats.record_solutions(out.accepted());
    stats.record_chunks(out.chunks());
    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Predicate, Term};

    fn rule(strategy: Option<JoinStrategy>) -> Rule {
        let mut b = Rule::builder("r")
            .head(Predicate::new("out", vec![Term::var("x")]).unwrap())
            .tail(Predicate::new("in", vec![Term::var("x")]).unwrap());
        if let Some(s) = strategy {
            b = b.strategy(s);
        }
        b.build().unwrap()
    }

    #[test]
    fn selects_by_index_manager_kind() {
        let f = JoinStrategyFactory::default();
        let r = rule(None);
        assert_eq!(
            f.select(&r, IndexManagerKind::Journal { slot_reuse: false }),
            JoinStrategy::LocalPipeline
        );
        assert_eq!(
            f.select(&r, IndexManagerKind::Federation { partitions: 4 }),
            JoinStrategy::DistributedPipeline
        );
    }

    #[test]
    fn rule_override_wins_over_default() {
        let f = JoinStrategyFactory::new(Some(JoinStrategy::DistributedPipeline));
        assert_eq!(
            f.select(&rule(None), IndexManagerKind::Journal { slot_reuse: true }),
            JoinStrategy::DistributedPipeline
        );
        assert_eq!(
            f.select(
                &rule(Some(JoinStrategy::LocalPipeline)),
                IndexManagerKind::Federation { partitions: 2 }
            ),
            JoinStrategy::LocalPipeline
        );
    }
}
