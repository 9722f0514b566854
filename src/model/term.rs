//! Terms, elements and binding sets.
//!
//! The engine never sees RDF values. Every constant is an already-resolved
//! internal identifier (`TermId`) handed out by the lexicon layer.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Internal identifier of an interned term.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TermId(u64);

impl TermId {
    /// Wraps a raw identifier.
    #[must_use]
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// The raw identifier.
    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl From<u64> for TermId {
    fn from(raw: u64) -> Self {
        Self(raw)
    }
}

impl fmt::Display for TermId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A logical variable.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Var(String);

impl Var {
    /// Creates a variable. A leading `?` is stripped.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        match name.strip_prefix('?') {
            Some(stripped) => Self(stripped.to_string()),
            None => Self(name),
        }
    }

    /// The variable name without the `?` sigil.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Var {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "?{}", self.0)
    }
}

/// A slot of a predicate: either a variable or a constant.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Term {
    /// A variable, bound during the join.
    Var(Var),
    /// A constant identifier.
    Const(TermId),
}

impl Term {
    /// Shorthand for a variable term.
    #[must_use]
    pub fn var(name: impl Into<String>) -> Self {
        Self::Var(Var::new(name))
    }

    /// Shorthand for a constant term.
    #[must_use]
    pub const fn constant(raw: u64) -> Self {
        Self::Const(TermId::new(raw))
    }

    /// Returns the variable, if this term is one.
    #[must_use]
    pub const fn as_var(&self) -> Option<&Var> {
        match self {
            Self::Var(v) => Some(v),
            Self::Const(_) => None,
        }
    }

    /// Resolves the term against a binding set.
    #[must_use]
    pub fn resolve(&self, bindings: &BindingSet) -> Option<TermId> {
        match self {
            Self::Const(id) => Some(*id),
            Self::Var(v) => bindings.get(v),
        }
    }
}

impl fmt::Display for Term {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Var(v) => write!(f, "{v}"),
            Self::Const(id) => write!(f, "{id}"),
        }
    }
}

/// A fact stored in a relation: a fixed-arity tuple of term identifiers.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Element(Vec<TermId>);

impl Element {
    /// Creates an element from identifiers.
    #[must_use]
    pub fn new(values: Vec<TermId>) -> Self {
        Self(values)
    }

    /// The tuple values.
    #[must_use]
    pub fn values(&self) -> &[TermId] {
        &self.0
    }

    /// The value at `position`.
    #[must_use]
    pub fn get(&self, position: usize) -> Option<TermId> {
        self.0.get(position).copied()
    }

    /// Number of positions.
    #[must_use]
    pub fn arity(&self) -> usize {
        self.0.len()
    }

    /// Returns true if every bound slot of `pattern` matches this element.
    #[must_use]
    pub fn matches(&self, pattern: &[Option<TermId>]) -> bool {
        self.0.len() == pattern.len()
            && self
                .0
                .iter()
                .zip(pattern)
                .all(|(v, p)| p.map_or(true, |p| p == *v))
    }
}

impl<const N: usize> From<[u64; N]> for Element {
    fn from(values: [u64; N]) -> Self {
        Self(values.into_iter().map(TermId::new).collect())
    }
}

impl fmt::Display for Element {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "(")?;
        for (i, v) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, " ")?;
            }
            write!(f, "{v}")?;
        }
        write!(f, ")")
    }
}

/// A partial assignment of variables to term identifiers.
///
/// Binding sets are cloned, never shared, when a join forks across branches.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BindingSet(BTreeMap<Var, TermId>);

impl BindingSet {
    /// An empty binding set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The value bound to `var`, if any.
    #[must_use]
    pub fn get(&self, var: &Var) -> Option<TermId> {
        self.0.get(var).copied()
    }

    /// Binds `var`, replacing any previous binding.
    pub fn set(&mut self, var: Var, value: TermId) {
        self.0.insert(var, value);
    }

    /// Removes the binding for `var`.
    pub fn clear(&mut self, var: &Var) {
        self.0.remove(var);
    }

    /// Returns true if `var` is bound.
    #[must_use]
    pub fn is_bound(&self, var: &Var) -> bool {
        self.0.contains_key(var)
    }

    /// Number of bound variables.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Returns true if nothing is bound.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Iterates over the bindings in variable order.
    pub fn iter(&self) -> impl Iterator<Item = (&Var, TermId)> {
        self.0.iter().map(|(k, v)| (k, *v))
    }

    /// Copies every binding of `other` into `self`.
    pub fn extend_from(&mut self, other: &Self) {
        for (k, v) in other.iter() {
            self.0.insert(k.clone(), v);
        }
    }
}

impl fmt::Display for BindingSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{")?;
        for (i, (k, v)) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{k}={v}")?;
        }
        write!(f, "}}")
    }
}
