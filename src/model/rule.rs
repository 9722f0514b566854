//! Rules: one conjunctive join producing elements for a head relation.

use std::collections::HashMap;
use std::fmt;

use crate::error::ValidationError;
use crate::join::JoinStrategy;

use super::predicate::{Constraint, Predicate};
use super::program::QueryOptions;
use super::term::{BindingSet, TermId, Var};

/// A conjunctive join over the tail predicates, writing into the head.
#[derive(Debug, Clone, PartialEq)]
pub struct Rule {
    name: String,
    head: Predicate,
    tail: Vec<Predicate>,
    constraints: Vec<Constraint>,
    constants: BindingSet,
    strategy: Option<JoinStrategy>,
    options: QueryOptions,
}

impl Rule {
    /// Starts building a rule.
    #[must_use]
    pub fn builder(name: impl Into<String>) -> RuleBuilder {
        RuleBuilder::new(name)
    }

    /// Rule label.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The head predicate.
    #[must_use]
    pub const fn head(&self) -> &Predicate {
        &self.head
    }

    /// The tail predicates in declaration order.
    #[must_use]
    pub fn tail(&self) -> &[Predicate] {
        &self.tail
    }

    /// Number of tail predicates.
    #[must_use]
    pub fn tail_count(&self) -> usize {
        self.tail.len()
    }

    /// Constraints checked after every bind.
    #[must_use]
    pub fn constraints(&self) -> &[Constraint] {
        &self.constraints
    }

    /// Bindings applied to every new binding set for this rule.
    #[must_use]
    pub const fn constants(&self) -> &BindingSet {
        &self.constants
    }

    /// Join strategy forced for this rule, overriding the selection by index manager.
    #[must_use]
    pub const fn strategy(&self) -> Option<JoinStrategy> {
        self.strategy
    }

    /// Options applied when the rule runs as a query.
    #[must_use]
    pub const fn options(&self) -> &QueryOptions {
        &self.options
    }

    /// Returns true if every constraint accepts `bindings`.
    #[must_use]
    pub fn is_consistent(&self, bindings: &BindingSet) -> bool {
        self.constraints.iter().all(|c| c.accept(bindings))
    }

    /// Returns true if every slot of the head is bound.
    #[must_use]
    pub fn is_fully_bound(&self, bindings: &BindingSet) -> bool {
        self.head.pattern(bindings).iter().all(Option::is_some)
    }
}

impl fmt::Display for Rule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {} :- ", self.name, self.head)?;
        for (i, p) in self.tail.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{p}")?;
        }
        if !self.constraints.is_empty() {
            write!(f, " [{} constraints]", self.constraints.len())?;
        }
        Ok(())
    }
}

/// Builder for [`Rule`].
#[derive(Debug)]
pub struct RuleBuilder {
    name: String,
    head: Option<Predicate>,
    tail: Vec<Predicate>,
    constraints: Vec<Constraint>,
    constants: BindingSet,
    strategy: Option<JoinStrategy>,
    options: QueryOptions,
}

impl RuleBuilder {
    fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            head: None,
            tail: Vec::new(),
            constraints: Vec::new(),
            constants: BindingSet::new(),
            strategy: None,
            options: QueryOptions::default(),
        }
    }

    /// Sets the head.
    #[must_use]
    pub fn head(mut self, head: Predicate) -> Self {
        self.head = Some(head);
        self
    }

    /// Appends a tail predicate.
    #[must_use]
    pub fn tail(mut self, predicate: Predicate) -> Self {
        self.tail.push(predicate);
        self
    }

    /// Adds a constraint.
    #[must_use]
    pub fn constraint(mut self, constraint: Constraint) -> Self {
        self.constraints.push(constraint);
        self
    }

    /// Binds a variable to a constant for every evaluation of the rule.
    #[must_use]
    pub fn constant(mut self, var: impl Into<String>, value: u64) -> Self {
        self.constants.set(Var::new(var), TermId::new(value));
        self
    }

    /// Forces a join strategy for this rule.
    #[must_use]
    pub const fn strategy(mut self, strategy: JoinStrategy) -> Self {
        self.strategy = Some(strategy);
        self
    }

    /// Sets the query options.
    #[must_use]
    pub fn options(mut self, options: QueryOptions) -> Self {
        self.options = options;
        self
    }

    /// Validates and builds the rule.
    pub fn build(self) -> Result<Rule, ValidationError> {
        let name = self.name.trim().to_string();
        if name.is_empty() {
            return Err(ValidationError::MissingField {
                field: "name".to_string(),
            });
        }
        let head = self.head.ok_or_else(|| ValidationError::MissingField {
            field: "head".to_string(),
        })?;
        if head.is_fused() {
            return Err(ValidationError::FusedHead { rule: name });
        }
        if self.tail.is_empty() {
            return Err(ValidationError::EmptyTail { rule: name });
        }

        let mut arities: HashMap<&str, usize> = HashMap::new();
        for p in std::iter::once(&head).chain(self.tail.iter()) {
            for relation in p.relations() {
                let expected = *arities.entry(relation.as_str()).or_insert_with(|| p.arity());
                if expected != p.arity() {
                    return Err(ValidationError::ArityMismatch {
                        relation: relation.clone(),
                        expected,
                        actual: p.arity(),
                    });
                }
            }
        }

        for var in head.variables() {
            let in_tail = self.tail.iter().any(|p| p.variables().contains(&var));
            if !in_tail && !self.constants.is_bound(var) {
                return Err(ValidationError::UnboundHeadVariable {
                    rule: name,
                    var: var.to_string(),
                });
            }
        }

        Ok(Rule {
            name,
            head,
            tail: self.tail,
            constraints: self.constraints,
            constants: self.constants,
            strategy: self.strategy,
            options: self.options,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Term;

    fn spo(s: Term, p: Term, o: Term) -> Predicate {
        Predicate::new("kb.spo", vec![s, p, o]).unwrap()
    }

    #[test]
    fn builds_rdfs9_style_rule() {
        // (?u rdf:type ?x) :- (?v rdfs:subClassOf ?x), (?u rdf:type ?v)
        let rule = Rule::builder("rdfs9")
            .head(spo(Term::var("u"), Term::constant(1), Term::var("x")))
            .tail(spo(Term::var("v"), Term::constant(2), Term::var("x")))
            .tail(spo(Term::var("u"), Term::constant(1), Term::var("v")))
            .build()
            .unwrap();
        assert_eq!(rule.tail_count(), 2);
        assert_eq!(rule.name(), "rdfs9");
        assert!(rule.to_string().starts_with("rdfs9: kb.spo(?u, #1, ?x) :- "));
    }

    #[test]
    fn rejects_range_unrestricted_head() {
        let err = Rule::builder("bad")
            .head(spo(Term::var("a"), Term::constant(1), Term::var("z")))
            .tail(spo(Term::var("a"), Term::constant(1), Term::var("b")))
            .build()
            .unwrap_err();
        assert!(matches!(err, ValidationError::UnboundHeadVariable { .. }));
    }

    #[test]
    fn constants_restrict_head_variables() {
        let rule = Rule::builder("with_constant")
            .head(spo(Term::var("a"), Term::constant(1), Term::var("z")))
            .tail(spo(Term::var("a"), Term::constant(1), Term::var("b")))
            .constant("z", 42)
            .build()
            .unwrap();
        assert_eq!(rule.constants().get(&Var::new("z")), Some(TermId::new(42)));
    }

    #[test]
    fn rejects_empty_tail_and_fused_head() {
        let err = Rule::builder("empty")
            .head(spo(Term::constant(1), Term::constant(1), Term::constant(1)))
            .build()
            .unwrap_err();
        assert!(matches!(err, ValidationError::EmptyTail { .. }));

        let fused = Predicate::fused(
            vec!["a.spo".to_string(), "b.spo".to_string()],
            vec![Term::var("x")],
        )
        .unwrap();
        let err = Rule::builder("fused")
            .head(fused)
            .tail(Predicate::new("a.spo", vec![Term::var("x")]).unwrap())
            .build()
            .unwrap_err();
        assert!(matches!(err, ValidationError::FusedHead { .. }));
    }

    #[test]
    fn rejects_arity_mismatch() {
        let err = Rule::builder("arity")
            .head(Predicate::new("kb.spo", vec![Term::var("x"), Term::var("y")]).unwrap())
            .tail(spo(Term::var("x"), Term::constant(1), Term::var("y")))
            .build()
            .unwrap_err();
        assert!(matches!(err, ValidationError::ArityMismatch { .. }));
    }
}
