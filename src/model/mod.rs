//! Data model for rule evaluation.
//!
//! Steps are a closed sum type (`Step::Rule` or `Step::Program`) so every
//! decision point matches on them exhaustively.

mod predicate;
mod program;
mod rule;
mod solution;
mod term;

pub use predicate::{validate_relation_name, Constraint, Predicate, MAX_RELATION_NAME_LEN};
pub use program::{Program, QueryOptions, Slice, Step};
pub use rule::{Rule, RuleBuilder};
pub use solution::{Action, Solution, SolutionFilter, SolutionFlags};
pub use term::{BindingSet, Element, Term, TermId, Var};
