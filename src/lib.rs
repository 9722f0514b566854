//! # quadlog - rule and program execution for a quad store
//!
//! quadlog evaluates rules (conjunctive joins over indexed relations) either as
//! one-shot queries that stream solutions back to the caller, or as mutation
//! programs that insert or delete the facts they derive. Closure programs are
//! applied round after round until they reach a fixed point.
//!
//! ## Core Concepts
//!
//! - **Step**: a [`Rule`] or a [`Program`] of steps, sequential or parallel
//! - **`NexusFactory`**: serializable evaluation context, rebuilt per index manager
//! - **`EvaluationNexus`**: timestamps, views, buffers and join strategy for one context
//! - **`ProgramOrchestrator`**: dispatch, read consistency and the closure loop
//! - **`RuleStats`**: per-step counters sealed exactly once
//!
//! ## Usage
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use quadlog::{Action, IndexManager, MemoryJournal, NexusDescriptor, NexusFactory, PoolConfig};
//! use quadlog::{Predicate, Program, Rule, SlotPolicy, Step, Term};
//!
//! let journal: Arc<dyn IndexManager> =
//!     Arc::new(MemoryJournal::new(SlotPolicy::Worm, &PoolConfig::default())?);
//! let factory = NexusFactory::new(NexusDescriptor::new(Action::Insert))?;
//!
//! let subclass = Rule::builder("subclass")
//!     .head(Predicate::new("kb.spo", vec![Term::var("x"), Term::constant(1), Term::var("z")])?)
//!     .tail(Predicate::new("kb.spo", vec![Term::var("x"), Term::constant(1), Term::var("y")])?)
//!     .tail(Predicate::new("kb.spo", vec![Term::var("y"), Term::constant(1), Term::var("z")])?)
//!     .build()?;
//! let closure = Program::closure_of([subclass])?;
//!
//! let result = quadlog::submit(&Step::from(closure), Action::Insert, &factory, journal)?
//!     .into_mutation()?;
//! println!("{} facts derived", result.count);
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

// Core types
pub mod config;
pub mod error;
pub mod model;
pub mod stats;

// Storage and scheduling
pub mod runtime;
pub mod storage;

// Evaluation
pub mod buffer;
pub mod join;
pub mod nexus;
pub mod program;
pub mod task;

pub use buffer::{BlockingBuffer, MutationBuffer, QueryIterator, SolutionSink, UnsynchronizedBuffer};
pub use config::{BufferConfig, PoolConfig};
pub use error::{ExecutionError, QuadlogError, QuadlogResult, ValidationError};
pub use join::{EvaluationPlan, JoinStrategy, JoinStrategyFactory, PlanKind};
pub use model::{
    Action, BindingSet, Constraint, Element, Predicate, Program, QueryOptions, Rule, RuleBuilder, Slice, Solution,
    SolutionFilter, SolutionFlags, Step, Term, TermId, Var,
};
pub use nexus::{EvaluationNexus, NexusDescriptor, NexusFactory};
pub use program::{submit, MutationResult, OrchestratorState, ProgramOrchestrator, Submission};
pub use runtime::{CancelToken, TaskHandle, TaskId, TaskPool};
pub use stats::{MutationCounter, RuleLog, RuleStats, StatsBuilder};
pub use storage::{
    IndexManager, IndexManagerId, IndexManagerKind, MemoryFederation, MemoryJournal, RelationView, SlotPolicy,
    StorageError, TeardownHook, Timestamp, TxId,
};
pub use task::{MutationTask, QueryTask};
