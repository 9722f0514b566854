//! Actions, solutions and solution filters.

use std::collections::BTreeSet;
use std::fmt;
use std::ops::BitOr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::rule::Rule;
use super::term::{BindingSet, Element, TermId};

/// What a program does with its solutions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    /// Stream solutions to the caller.
    Query,
    /// Write solutions onto the head relation.
    Insert,
    /// Remove solutions from the head relation.
    Delete,
}

impl Action {
    /// Returns true for `Insert` and `Delete`.
    #[must_use]
    pub const fn is_mutation(self) -> bool {
        matches!(self, Self::Insert | Self::Delete)
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Query => "query",
            Self::Insert => "insert",
            Self::Delete => "delete",
        };
        f.write_str(s)
    }
}

/// Bit flags selecting what a [`Solution`] carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SolutionFlags(u8);

impl SolutionFlags {
    /// Materialize the head element.
    pub const ELEMENT: Self = Self(1 << 0);
    /// Keep a clone of the bindings.
    pub const BINDINGS: Self = Self(1 << 1);
    /// Keep the rule that licensed the solution.
    pub const RULE: Self = Self(1 << 2);
    /// Everything.
    pub const ALL: Self = Self(0b111);
    /// Nothing.
    pub const NONE: Self = Self(0);

    /// Returns true if every flag of `other` is set.
    #[must_use]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// Raw bits.
    #[must_use]
    pub const fn bits(self) -> u8 {
        self.0
    }

    /// Builds flags from raw bits, dropping unknown bits.
    #[must_use]
    pub const fn from_bits_truncate(bits: u8) -> Self {
        Self(bits & Self::ALL.0)
    }
}

impl Default for SolutionFlags {
    fn default() -> Self {
        Self::ELEMENT
    }
}

impl BitOr for SolutionFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// A materialized result of evaluating a rule against one binding set.
#[derive(Debug, Clone, PartialEq)]
pub struct Solution {
    element: Option<Element>,
    bindings: Option<BindingSet>,
    rule: Option<Arc<Rule>>,
}

impl Solution {
    /// Builds a solution according to `flags`.
    ///
    /// The element is only present if the head is fully bound.
    #[must_use]
    pub fn new(flags: SolutionFlags, rule: &Arc<Rule>, bindings: &BindingSet) -> Self {
        let element = if flags.contains(SolutionFlags::ELEMENT) {
            rule.head().materialize(bindings)
        } else {
            None
        };
        Self {
            element,
            bindings: flags.contains(SolutionFlags::BINDINGS).then(|| bindings.clone()),
            rule: flags.contains(SolutionFlags::RULE).then(|| Arc::clone(rule)),
        }
    }

    /// The derived element.
    #[must_use]
    pub const fn element(&self) -> Option<&Element> {
        self.element.as_ref()
    }

    /// The bindings that produced the solution.
    #[must_use]
    pub const fn bindings(&self) -> Option<&BindingSet> {
        self.bindings.as_ref()
    }

    /// The rule that licensed the solution.
    #[must_use]
    pub fn rule(&self) -> Option<&Arc<Rule>> {
        self.rule.as_ref()
    }

    /// Consumes the solution, returning the element.
    #[must_use]
    pub fn into_element(self) -> Option<Element> {
        self.element
    }

    /// Drops the parts not selected by `flags`.
    #[must_use]
    pub fn restrict(mut self, flags: SolutionFlags) -> Self {
        if !flags.contains(SolutionFlags::ELEMENT) {
            self.element = None;
        }
        if !flags.contains(SolutionFlags::BINDINGS) {
            self.bindings = None;
        }
        if !flags.contains(SolutionFlags::RULE) {
            self.rule = None;
        }
        self
    }
}

/// A serializable filter keeping solutions out of a buffer.
///
/// Filters look at the materialized element; a solution without an element
/// always passes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum SolutionFilter {
    /// Reject elements whose value at `position` is one of `values`.
    ExcludeValues {
        /// Element position.
        position: usize,
        /// Rejected identifiers.
        values: BTreeSet<TermId>,
    },
    /// Reject elements whose values at `left` and `right` are equal.
    RejectReflexive {
        /// First position.
        left: usize,
        /// Second position.
        right: usize,
    },
    /// Reject elements already present in this set (e.g. axioms).
    ExcludeElements {
        /// Rejected elements.
        elements: BTreeSet<Element>,
    },
    /// Accept only if every filter accepts.
    AllOf {
        /// Filters.
        filters: Vec<SolutionFilter>,
    },
}

impl SolutionFilter {
    /// Returns true if the solution may enter the buffer.
    #[must_use]
    pub fn accept(&self, solution: &Solution) -> bool {
        solution.element().map_or(true, |e| self.accept_element(e))
    }

    /// Returns true if the element may enter the buffer.
    #[must_use]
    pub fn accept_element(&self, element: &Element) -> bool {
        match self {
            Self::ExcludeValues { position, values } => {
                element.get(*position).map_or(true, |v| !values.contains(&v))
            }
            Self::RejectReflexive { left, right } => {
                match (element.get(*left), element.get(*right)) {
                    (Some(a), Some(b)) => a != b,
                    _ => true,
                }
            }
            Self::ExcludeElements { elements } => !elements.contains(element),
            Self::AllOf { filters } => filters.iter().all(|f| f.accept_element(element)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Predicate, Term, Var};

    fn rule() -> Arc<Rule> {
        Arc::new(
            Rule::builder("r")
                .head(Predicate::new("kb.spo", vec![Term::var("x"), Term::constant(5), Term::var("y")]).unwrap())
                .tail(Predicate::new("kb.spo", vec![Term::var("x"), Term::constant(6), Term::var("y")]).unwrap())
                .build()
                .unwrap(),
        )
    }

    fn bindings(x: u64, y: u64) -> BindingSet {
        let mut bs = BindingSet::new();
        bs.set(Var::new("x"), TermId::new(x));
        bs.set(Var::new("y"), TermId::new(y));
        bs
    }

    #[test]
    fn action_mutation() {
        assert!(!Action::Query.is_mutation());
        assert!(Action::Insert.is_mutation());
        assert!(Action::Delete.is_mutation());
    }

    #[test]
    fn flags_control_solution_contents() {
        let r = rule();
        let bs = bindings(1, 2);

        let s = Solution::new(SolutionFlags::ELEMENT, &r, &bs);
        assert_eq!(s.element(), Some(&Element::from([1, 5, 2])));
        assert!(s.bindings().is_none());
        assert!(s.rule().is_none());

        let s = Solution::new(SolutionFlags::BINDINGS | SolutionFlags::RULE, &r, &bs);
        assert!(s.element().is_none());
        assert_eq!(s.bindings(), Some(&bs));
        assert_eq!(s.rule().map(|r| r.name()), Some("r"));

        assert!(SolutionFlags::ALL.contains(SolutionFlags::RULE));
        assert_eq!(SolutionFlags::from_bits_truncate(0xff), SolutionFlags::ALL);
    }

    #[test]
    fn restrict_drops_unselected_parts() {
        let r = rule();
        let s = Solution::new(SolutionFlags::ALL, &r, &bindings(1, 2)).restrict(SolutionFlags::ELEMENT);
        assert_eq!(s.element(), Some(&Element::from([1, 5, 2])));
        assert!(s.bindings().is_none());
        assert!(s.rule().is_none());
    }

    #[test]
    fn filters_reject_matching_elements() {
        let r = rule();
        let reflexive = Solution::new(SolutionFlags::ELEMENT, &r, &bindings(3, 3));
        let plain = Solution::new(SolutionFlags::ELEMENT, &r, &bindings(3, 4));

        let f = SolutionFilter::RejectReflexive { left: 0, right: 2 };
        assert!(!f.accept(&reflexive));
        assert!(f.accept(&plain));

        let f = SolutionFilter::AllOf {
            filters: vec![
                f,
                SolutionFilter::ExcludeValues {
                    position: 2,
                    values: [TermId::new(4)].into_iter().collect(),
                },
            ],
        };
        assert!(!f.accept(&plain));

        let no_element = Solution::new(SolutionFlags::BINDINGS, &r, &bindings(3, 3));
        assert!(f.accept(&no_element));
    }

    #[test]
    fn filter_serde_roundtrip() {
        let f = SolutionFilter::ExcludeElements {
            elements: [Element::from([1, 2, 3])].into_iter().collect(),
        };
        let json = serde_json::to_string(&f).unwrap();
        assert!(json.contains("exclude_elements"));
        let back: SolutionFilter = serde_json::from_str(&json).unwrap();
        assert_eq!(back, f);
    }
}
