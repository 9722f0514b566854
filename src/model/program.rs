//! Programs: ordered or unordered compositions of rules and sub-programs.
//!
//! Shape invariants are enforced while a program is being built:
//! - a parallel program never embeds a closure;
//! - a closure program contains only rules.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::ValidationError;

use super::rule::Rule;
use super::term::Var;

/// Offset/limit applied to a query result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Slice {
    /// Solutions to skip.
    pub offset: u64,
    /// Maximum solutions to emit.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<u64>,
}

/// Options applied when a step is evaluated as a query.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct QueryOptions {
    /// Drop duplicate solutions.
    #[serde(default)]
    pub distinct: bool,
    /// Sort solutions by these variables (ascending, unbound first).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub order_by: Vec<Var>,
    /// Offset/limit.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub slice: Option<Slice>,
}

impl QueryOptions {
    /// No options.
    pub const NONE: Self = Self {
        distinct: false,
        order_by: Vec::new(),
        slice: None,
    };

    /// Returns true if evaluation must be stable: results are collected and
    /// post-processed before any solution reaches the caller.
    #[must_use]
    pub fn is_stable(&self) -> bool {
        !self.order_by.is_empty() || self.slice.is_some()
    }

    /// Returns true if no option is set.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        !self.distinct && !self.is_stable()
    }
}

/// One unit of execution: a rule or a program.
#[derive(Debug, Clone, PartialEq)]
pub enum Step {
    /// A single rule.
    Rule(Arc<Rule>),
    /// A composition of steps.
    Program(Arc<Program>),
}

impl Step {
    /// Step label.
    #[must_use]
    pub fn name(&self) -> &str {
        match self {
            Self::Rule(r) => r.name(),
            Self::Program(p) => p.name(),
        }
    }

    /// Returns true for a rule.
    #[must_use]
    pub const fn is_rule(&self) -> bool {
        matches!(self, Self::Rule(_))
    }

    /// Returns true if this step is itself a closure program.
    #[must_use]
    pub fn is_closure(&self) -> bool {
        match self {
            Self::Rule(_) => false,
            Self::Program(p) => p.is_closure(),
        }
    }

    /// Returns true if this is a non-closure program containing a closure
    /// at any depth.
    #[must_use]
    pub fn embeds_closure(&self) -> bool {
        match self {
            Self::Rule(_) => false,
            Self::Program(p) => !p.is_closure() && p.contains_closure(),
        }
    }

    /// Returns true if this step is or contains a closure.
    #[must_use]
    pub fn involves_closure(&self) -> bool {
        self.is_closure() || self.embeds_closure()
    }

    /// Query options for the step.
    #[must_use]
    pub fn options(&self) -> &QueryOptions {
        match self {
            Self::Rule(r) => r.options(),
            Self::Program(p) => p.options(),
        }
    }

    /// All rules reachable from this step, depth first.
    #[must_use]
    pub fn rules(&self) -> Vec<Arc<Rule>> {
        let mut out = Vec::new();
        self.collect_rules(&mut out);
        out
    }

    fn collect_rules(&self, out: &mut Vec<Arc<Rule>>) {
        match self {
            Self::Rule(r) => out.push(Arc::clone(r)),
            Self::Program(p) => {
                for s in p.steps() {
                    s.collect_rules(out);
                }
            }
        }
    }

    /// Re-checks the shape invariants of the whole tree.
    pub fn validate(&self) -> Result<(), ValidationError> {
        match self {
            Self::Rule(_) => Ok(()),
            Self::Program(p) => p.validate(),
        }
    }
}

impl From<Rule> for Step {
    fn from(rule: Rule) -> Self {
        Self::Rule(Arc::new(rule))
    }
}

impl From<Arc<Rule>> for Step {
    fn from(rule: Arc<Rule>) -> Self {
        Self::Rule(rule)
    }
}

impl From<Program> for Step {
    fn from(program: Program) -> Self {
        Self::Program(Arc::new(program))
    }
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Rule(r) => write!(f, "{r}"),
            Self::Program(p) => write!(f, "{p}"),
        }
    }
}

/// An ordered (sequential) or unordered (parallel) composition of steps.
#[derive(Debug, Clone, PartialEq)]
pub struct Program {
    name: String,
    parallel: bool,
    closure: bool,
    steps: Vec<Step>,
    options: QueryOptions,
}

impl Program {
    /// An empty sequential program: each step sees the writes of the previous one.
    #[must_use]
    pub fn sequential(name: impl Into<String>) -> Self {
        Self::with_flags(name, false, false)
    }

    /// An empty parallel program: steps have no dependencies among themselves.
    #[must_use]
    pub fn parallel(name: impl Into<String>) -> Self {
        Self::with_flags(name, true, false)
    }

    /// A closure program computing the fixed point of `rules`.
    ///
    /// The program is labelled `closure[r1 r2 ...]`.
    pub fn closure_of<I>(rules: I) -> Result<Self, ValidationError>
    where
        I: IntoIterator,
        I::Item: Into<Arc<Rule>>,
    {
        let rules: Vec<Arc<Rule>> = rules.into_iter().map(Into::into).collect();
        if rules.is_empty() {
            return Err(ValidationError::MissingField {
                field: "rules".to_string(),
            });
        }
        // Space separated: the rule log is comma delimited.
        let names: Vec<&str> = rules.iter().map(|r| r.name()).collect();
        let label = format!("closure[{}]", names.join(" "));
        let mut program = Self::with_flags(label, true, true);
        program.steps = rules.into_iter().map(Step::Rule).collect();
        Ok(program)
    }

    fn with_flags(name: impl Into<String>, parallel: bool, closure: bool) -> Self {
        Self {
            name: name.into(),
            parallel,
            closure,
            steps: Vec::new(),
            options: QueryOptions::default(),
        }
    }

    /// Sets query options, returning the program.
    #[must_use]
    pub fn with_options(mut self, options: QueryOptions) -> Self {
        self.options = options;
        self
    }

    /// Program label.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// True iff the steps have no dependencies among themselves.
    #[must_use]
    pub const fn is_parallel(&self) -> bool {
        self.parallel
    }

    /// True iff the steps run until a fixed point is reached.
    #[must_use]
    pub const fn is_closure(&self) -> bool {
        self.closure
    }

    /// Query options.
    #[must_use]
    pub const fn options(&self) -> &QueryOptions {
        &self.options
    }

    /// The steps in declaration order.
    #[must_use]
    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    /// Number of direct steps.
    #[must_use]
    pub fn step_count(&self) -> usize {
        self.steps.len()
    }

    fn contains_closure(&self) -> bool {
        self.steps.iter().any(Step::involves_closure)
    }

    /// Appends a step.
    pub fn add_step(&mut self, step: impl Into<Step>) -> Result<(), ValidationError> {
        let step = step.into();
        if self.closure && !step.is_rule() {
            return Err(ValidationError::ClosureContainsProgram {
                program: self.name.clone(),
            });
        }
        if self.parallel && step.involves_closure() {
            return Err(ValidationError::ParallelEmbedsClosure {
                program: self.name.clone(),
            });
        }
        self.steps.push(step);
        Ok(())
    }

    /// Appends a step, returning the program.
    pub fn then(mut self, step: impl Into<Step>) -> Result<Self, ValidationError> {
        self.add_step(step)?;
        Ok(self)
    }

    /// Appends a closure sub-program over `rules`.
    pub fn add_closure_of<I>(&mut self, rules: I) -> Result<(), ValidationError>
    where
        I: IntoIterator,
        I::Item: Into<Arc<Rule>>,
    {
        if self.parallel {
            return Err(ValidationError::ParallelEmbedsClosure {
                program: self.name.clone(),
            });
        }
        let sub = Self::closure_of(rules)?;
        self.add_step(sub)
    }

    /// Re-checks the shape invariants of this program and every sub-program.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.closure && self.steps.iter().any(|s| !s.is_rule()) {
            return Err(ValidationError::ClosureContainsProgram {
                program: self.name.clone(),
            });
        }
        if self.parallel && self.contains_closure() {
            return Err(ValidationError::ParallelEmbedsClosure {
                program: self.name.clone(),
            });
        }
        for step in &self.steps {
            step.validate()?;
        }
        Ok(())
    }

    fn fmt_depth(&self, f: &mut fmt::Formatter<'_>, depth: usize) -> fmt::Result {
        write!(
            f,
            "{}Program{{ name={}, parallel={}, closure={}, nsteps={} }}",
            ".".repeat(depth),
            self.name,
            self.parallel,
            self.closure,
            self.steps.len()
        )?;
        for step in &self.steps {
            writeln!(f)?;
            match step {
                Step::Rule(r) => write!(f, "{}{r}", ".".repeat(depth + 1))?,
                Step::Program(p) => p.fmt_depth(f, depth + 1)?,
            }
        }
        Ok(())
    }
}

impl fmt::Display for Program {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.fmt_depth(f, 0)
    }
}
