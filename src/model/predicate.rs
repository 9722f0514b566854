//! Predicates and constraints.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::ValidationError;

use super::term::{BindingSet, Element, Term, TermId, Var};

/// Maximum length of a relation name.
pub const MAX_RELATION_NAME_LEN: usize = 256;

static RELATION_NAME: OnceLock<Regex> = OnceLock::new();

fn relation_name_regex() -> &'static Regex {
    RELATION_NAME.get_or_init(|| {
        // Namespaces look like `kb.spo` or `tmp_focus-1.spo`.
        Regex::new(r"^[A-Za-z_][A-Za-z0-9_.\-]*$").expect("relation name regex is valid")
    })
}

/// Validates a relation name.
pub fn validate_relation_name(name: &str) -> Result<(), ValidationError> {
    if name.len() > MAX_RELATION_NAME_LEN || !relation_name_regex().is_match(name) {
        return Err(ValidationError::InvalidRelationName {
            name: name.to_string(),
        });
    }
    Ok(())
}

/// An access pattern over one relation, or a fused view over several.
///
/// A predicate naming more than one relation may only appear in the tail
/// of a rule; reads against it see the union of those relations.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Predicate {
    relations: Vec<String>,
    terms: Vec<Term>,
}

impl Predicate {
    /// Creates a predicate over a single relation.
    pub fn new(relation: impl Into<String>, terms: Vec<Term>) -> Result<Self, ValidationError> {
        Self::fused(vec![relation.into()], terms)
    }

    /// Creates a predicate reading the union of several relations.
    pub fn fused(relations: Vec<String>, terms: Vec<Term>) -> Result<Self, ValidationError> {
        if relations.is_empty() {
            return Err(ValidationError::MissingField {
                field: "relations".to_string(),
            });
        }
        if terms.is_empty() {
            return Err(ValidationError::MissingField {
                field: "terms".to_string(),
            });
        }
        for name in &relations {
            validate_relation_name(name)?;
        }
        Ok(Self { relations, terms })
    }

    /// The primary relation name.
    #[must_use]
    pub fn relation(&self) -> &str {
        &self.relations[0]
    }

    /// Every relation this predicate reads.
    #[must_use]
    pub fn relations(&self) -> &[String] {
        &self.relations
    }

    /// Returns true if the predicate reads more than one relation.
    #[must_use]
    pub fn is_fused(&self) -> bool {
        self.relations.len() > 1
    }

    /// The slots of the predicate.
    #[must_use]
    pub fn terms(&self) -> &[Term] {
        &self.terms
    }

    /// Number of slots.
    #[must_use]
    pub fn arity(&self) -> usize {
        self.terms.len()
    }

    /// Variables appearing in this predicate, in slot order, without duplicates.
    #[must_use]
    pub fn variables(&self) -> Vec<&Var> {
        let mut out: Vec<&Var> = Vec::new();
        for v in self.terms.iter().filter_map(Term::as_var) {
            if !out.contains(&v) {
                out.push(v);
            }
        }
        out
    }

    /// Resolves each slot against `bindings`: `Some` for constants and bound variables.
    #[must_use]
    pub fn pattern(&self, bindings: &BindingSet) -> Vec<Option<TermId>> {
        self.terms.iter().map(|t| t.resolve(bindings)).collect()
    }

    /// Number of slots left unbound by `bindings`.
    #[must_use]
    pub fn unbound_count(&self, bindings: &BindingSet) -> usize {
        self.pattern(bindings).iter().filter(|p| p.is_none()).count()
    }

    /// Materializes an element from the bindings; `None` if any slot is unbound.
    #[must_use]
    pub fn materialize(&self, bindings: &BindingSet) -> Option<Element> {
        self.terms
            .iter()
            .map(|t| t.resolve(bindings))
            .collect::<Option<Vec<_>>>()
            .map(Element::new)
    }
}

impl fmt::Display for Predicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}(", self.relations.join("|"))?;
        for (i, t) in self.terms.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{t}")?;
        }
        write!(f, ")")
    }
}

/// A filter on the bindings of a rule.
///
/// A constraint that mentions an unbound variable is not yet decidable and
/// accepts; it is re-evaluated once the variable becomes bound.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Constraint {
    /// Both terms must resolve to the same identifier.
    Equal(Term, Term),
    /// The terms must resolve to different identifiers.
    NotEqual(Term, Term),
    /// The variable must be bound to one of the values.
    In {
        /// Constrained variable.
        var: Var,
        /// Allowed values.
        values: BTreeSet<TermId>,
    },
    /// The variable must not be bound to any of the values.
    NotIn {
        /// Constrained variable.
        var: Var,
        /// Rejected values.
        values: BTreeSet<TermId>,
    },
}

impl Constraint {
    /// Evaluates the constraint against the current bindings.
    #[must_use]
    pub fn accept(&self, bindings: &BindingSet) -> bool {
        match self {
            Self::Equal(a, b) => match (a.resolve(bindings), b.resolve(bindings)) {
                (Some(a), Some(b)) => a == b,
                _ => true,
            },
            Self::NotEqual(a, b) => match (a.resolve(bindings), b.resolve(bindings)) {
                (Some(a), Some(b)) => a != b,
                _ => true,
            },
            Self::In { var, values } => bindings.get(var).map_or(true, |v| values.contains(&v)),
            Self::NotIn { var, values } => bindings.get(var).map_or(true, |v| !values.contains(&v)),
        }
    }
}
