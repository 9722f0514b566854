//! Evaluation plans: the order in which tail predicates are joined.

use std::collections::BTreeSet;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::QuadlogResult;
use crate::model::{BindingSet, Rule, Var};
use crate::storage::RelationView;

/// How a join order is chosen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanKind {
    /// Tail order as written.
    #[default]
    Fixed,
    /// Greedy: smallest range count first, preferring predicates that share
    /// an already-bound variable.
    RangeCount,
}

/// A join order over the tail of one rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EvaluationPlan {
    order: Vec<usize>,
    range_counts: Vec<Option<u64>>,
}

impl EvaluationPlan {
    /// The tail in declaration order.
    #[must_use]
    pub fn fixed(rule: &Rule) -> Self {
        Self {
            order: (0..rule.tail_count()).collect(),
            range_counts: vec![None; rule.tail_count()],
        }
    }

    /// Orders the tail greedily by range count.
    ///
    /// `views` must be aligned with the tail of `rule`.
    pub fn range_count(rule: &Rule, views: &[Arc<dyn RelationView>], initial: &BindingSet) -> QuadlogResult<Self> {
        let counts = rule
            .tail()
            .iter()
            .zip(views)
            .map(|(p, v)| v.range_count(&p.pattern(initial)))
            .collect::<Result<Vec<_>, _>>()?;

        let mut bound: BTreeSet<&Var> = initial.iter().map(|(v, _)| v).collect();
        let mut remaining: Vec<usize> = (0..rule.tail_count()).collect();
        let mut order = Vec::with_capacity(remaining.len());

        while !remaining.is_empty() {
            let connected: Vec<usize> = remaining
                .iter()
                .copied()
                .filter(|&i| rule.tail()[i].variables().iter().any(|v| bound.contains(v)))
                .collect();
            let candidates = if connected.is_empty() { &remaining } else { &connected };
            let Some(&next) = candidates.iter().min_by_key(|&&i| (counts[i], i)) else {
                break;
            };
            remaining.retain(|&i| i != next);
            bound.extend(rule.tail()[next].variables());
            order.push(next);
        }

        Ok(Self {
            order,
            range_counts: counts.into_iter().map(Some).collect(),
        })
    }

    /// Tail indices in join order.
    #[must_use]
    pub fn order(&self) -> &[usize] {
        &self.order
    }

    /// Range count of each tail predicate (by tail index), if computed.
    #[must_use]
    pub fn range_counts(&self) -> &[Option<u64>] {
        &self.range_counts
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PoolConfig;
    use crate::model::{Element, Predicate, Term};
    use crate::storage::{IndexManager, MemoryJournal, SlotPolicy, Timestamp};

    fn rule() -> Rule {
        // big(?x ?y), small(?y), other(?z ?w)
        Rule::builder("plan")
            .head(Predicate::new("out", vec![Term::var("x"), Term::var("z")]).unwrap())
            .tail(Predicate::new("big", vec![Term::var("x"), Term::var("y")]).unwrap())
            .tail(Predicate::new("small", vec![Term::var("y")]).unwrap())
            .tail(Predicate::new("other", vec![Term::var("z"), Term::var("w")]).unwrap())
            .build()
            .unwrap()
    }

    #[test]
    fn fixed_plan_keeps_tail_order() {
        assert_eq!(EvaluationPlan::fixed(&rule()).order(), &[0, 1, 2]);
    }

    #[test]
    fn range_count_plan_starts_small_and_stays_connected() {
        let j = MemoryJournal::new(SlotPolicy::Worm, &PoolConfig::default()).unwrap();
        let big: Vec<Element> = (0..10).map(|i| Element::from([i, i])).collect();
        j.load("big", &big).unwrap();
        j.load("small", &[Element::from([1])]).unwrap();
        j.load("other", &[Element::from([1, 1]), Element::from([2, 2])]).unwrap();

        let r = rule();
        let views: Vec<_> = r
            .tail()
            .iter()
            .map(|p| j.relation_view(p.relation(), Timestamp::UNISOLATED).unwrap())
            .collect();
        let plan = EvaluationPlan::range_count(&r, &views, &BindingSet::new()).unwrap();
        // small first; big shares ?y so it comes before the larger-but-disconnected other.
        assert_eq!(plan.order(), &[1, 0, 2]);
        assert_eq!(plan.range_counts()[0], Some(10));
    }
}
