use std::fmt;
use std::sync::{Arc, Weak};

use crate::buffer::{BlockingBuffer, MutationBuffer, QueryIterator, SolutionSink, UnsynchronizedBuffer};
use crate::config::BufferConfig;
use crate::error::{ExecutionError, QuadlogResult, ValidationError};
use crate::join::{JoinStrategy, JoinStrategyFactory, PlanKind};
use crate::model::{Action, BindingSet, Constraint, Element, Predicate, Rule, Solution, SolutionFilter, SolutionFlags, Step, Term};
use crate::program::{self, MutationResult};
use crate::storage::{IndexManager, IndexManagerId, IndexManagerKind, RelationView, Timestamp};

use super::descriptor::NexusDescriptor;
use super::factory::NexusFactory;
use super::fused::FusedView;

/// Evaluation context bound to one index manager and one timestamp pair.
///
/// Obtained from [`NexusFactory::new_instance`]; never serialized. The nexus
/// does not keep its index manager alive.
pub struct EvaluationNexus {
    factory: Weak<NexusFactory>,
    index_manager: Weak<dyn IndexManager>,
    index_manager_id: IndexManagerId,
    kind: IndexManagerKind,
    action: Action,
    write_timestamp: Timestamp,
    read_timestamp: Timestamp,
    flags: SolutionFlags,
    filter: Option<SolutionFilter>,
    plan: PlanKind,
    strategies: JoinStrategyFactory,
    config: BufferConfig,
}

impl fmt::Debug for EvaluationNexus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EvaluationNexus")
            .field("index_manager", &self.index_manager_id)
            .field("action", &self.action)
            .field("write_timestamp", &self.write_timestamp)
            .field("read_timestamp", &self.read_timestamp)
            .field("flags", &self.flags)
            .field("plan", &self.plan)
            .finish_non_exhaustive()
    }
}

impl EvaluationNexus {
    pub(super) fn new(
        factory: Weak<NexusFactory>,
        index_manager: &Arc<dyn IndexManager>,
        descriptor: &NexusDescriptor,
        read_timestamp: Timestamp,
        config: BufferConfig,
    ) -> Self {
        Self {
            factory,
            index_manager: Arc::downgrade(index_manager),
            index_manager_id: index_manager.id(),
            kind: index_manager.kind(),
            action: descriptor.action,
            write_timestamp: descriptor.write_timestamp,
            read_timestamp,
            flags: descriptor.solution_flags,
            filter: descriptor.filter.clone(),
            plan: descriptor.plan,
            strategies: JoinStrategyFactory::new(descriptor.default_strategy),
            config,
        }
    }

    /// The index manager this nexus reads and writes, if it is still alive.
    pub fn index_manager(&self) -> Result<Arc<dyn IndexManager>, ExecutionError> {
        self.index_manager
            .upgrade()
            .ok_or(ExecutionError::IndexManagerReleased {
                id: self.index_manager_id,
            })
    }

    /// Identity of the index manager.
    #[must_use]
    pub const fn index_manager_id(&self) -> IndexManagerId {
        self.index_manager_id
    }

    /// Default action of the context.
    #[must_use]
    pub const fn action(&self) -> Action {
        self.action
    }

    /// Timestamp of written views.
    #[must_use]
    pub const fn write_timestamp(&self) -> Timestamp {
        self.write_timestamp
    }

    /// Timestamp of read views.
    #[must_use]
    pub const fn read_timestamp(&self) -> Timestamp {
        self.read_timestamp
    }

    /// What each solution carries.
    #[must_use]
    pub const fn solution_flags(&self) -> SolutionFlags {
        self.flags
    }

    /// Filter applied by unsynchronized buffers.
    #[must_use]
    pub const fn filter(&self) -> Option<&SolutionFilter> {
        self.filter.as_ref()
    }

    /// How join orders are chosen.
    #[must_use]
    pub const fn plan_kind(&self) -> PlanKind {
        self.plan
    }

    /// Buffer and scheduling configuration.
    #[must_use]
    pub const fn config(&self) -> &BufferConfig {
        &self.config
    }

    /// The factory that built this nexus.
    pub fn factory(&self) -> Result<Arc<NexusFactory>, ExecutionError> {
        self.factory.upgrade().ok_or(ExecutionError::FactoryReleased)
    }

    /// Join strategy for `rule`.
    #[must_use]
    pub fn join_strategy(&self, rule: &Rule) -> JoinStrategy {
        self.strategies.select(rule, self.kind)
    }

    /// A fresh binding set carrying the constants of `rule`.
    #[must_use]
    pub fn new_binding_set(&self, rule: &Rule) -> BindingSet {
        rule.constants().clone()
    }

    /// A solution shaped by this context's flags.
    #[must_use]
    pub fn new_solution(&self, rule: &Arc<Rule>, bindings: &BindingSet) -> Solution {
        Solution::new(self.flags, rule, bindings)
    }

    /// Binds the variables of `predicate` from `element`, then checks `constraints`.
    ///
    /// Returns false if a slot disagrees with the element or a constraint
    /// rejects the bindings. Bindings applied before the failure are kept;
    /// clone first if the previous state is needed.
    pub fn bind(
        &self,
        predicate: &Predicate,
        constraints: &[Constraint],
        element: &Element,
        bindings: &mut BindingSet,
    ) -> bool {
        if element.arity() != predicate.arity() {
            return false;
        }
        for (term, value) in predicate.terms().iter().zip(element.values()) {
            match term {
                Term::Const(c) => {
                    if c != value {
                        return false;
                    }
                }
                Term::Var(v) => match bindings.get(v) {
                    Some(bound) if bound != *value => return false,
                    Some(_) => {}
                    None => bindings.set(v.clone(), *value),
                },
            }
        }
        constraints.iter().all(|c| c.accept(bindings))
    }

    /// Writable view of the head relation of `rule`.
    pub fn head_view(&self, rule: &Rule) -> QuadlogResult<Arc<dyn RelationView>> {
        Ok(self
            .index_manager()?
            .relation_view(rule.head().relation(), self.write_timestamp)?)
    }

    /// Read view for a tail predicate; fused predicates read the union.
    pub fn tail_view(&self, predicate: &Predicate) -> QuadlogResult<Arc<dyn RelationView>> {
        let index_manager = self.index_manager()?;
        if !predicate.is_fused() {
            return Ok(index_manager.relation_view(predicate.relation(), self.read_timestamp)?);
        }
        let views = predicate
            .relations()
            .iter()
            .map(|name| index_manager.relation_view(name, self.read_timestamp))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Arc::new(FusedView::new(views, self.read_timestamp)))
    }

    /// A bounded buffer and the iterator draining it.
    #[must_use]
    pub fn new_query_buffer(&self) -> (BlockingBuffer, QueryIterator) {
        BlockingBuffer::new(&self.config)
    }

    /// A buffer writing solutions into `relation`.
    pub fn new_insert_buffer(&self, relation: &str) -> QuadlogResult<MutationBuffer> {
        self.new_mutation_buffer(Action::Insert, relation)
    }

    /// A buffer deleting solutions from `relation`.
    pub fn new_delete_buffer(&self, relation: &str) -> QuadlogResult<MutationBuffer> {
        self.new_mutation_buffer(Action::Delete, relation)
    }

    /// A buffer applying `action` to `relation`.
    pub fn new_mutation_buffer(&self, action: Action, relation: &str) -> QuadlogResult<MutationBuffer> {
        let view = self.index_manager()?.relation_view(relation, self.write_timestamp)?;
        Ok(MutationBuffer::new(action, view, self.config.chunk_capacity)?)
    }

    /// A single-writer buffer forwarding filtered chunks to `target`.
    #[must_use]
    pub fn new_unsynchronized_buffer(&self, target: Arc<dyn SolutionSink>, capacity: usize) -> UnsynchronizedBuffer {
        UnsynchronizedBuffer::new(target, capacity, self.filter.clone())
    }

    /// Runs `step` as a query. Not to be called from a buffer callback.
    pub fn run_query(&self, step: &Step) -> QuadlogResult<QueryIterator> {
        let factory = self.factory()?;
        program::submit(step, Action::Query, &factory, self.index_manager()?)?
            .into_query()
    }

    /// Runs `step` with this context's mutation action. Not to be called
    /// from a buffer callback.
    pub fn run_mutation(&self, step: &Step) -> QuadlogResult<MutationResult> {
        if !self.action.is_mutation() {
            return Err(ValidationError::MutationRequired { action: self.action }.into());
        }
        let factory = self.factory()?;
        program::submit(step, self.action, &factory, self.index_manager()?)?
            .into_mutation()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PoolConfig;
    use crate::model::{TermId, Var};
    use crate::storage::{MemoryJournal, SlotPolicy};

    fn nexus() -> (Arc<NexusFactory>, Arc<EvaluationNexus>) {
        let factory = NexusFactory::new(NexusDescriptor::new(Action::Insert)).unwrap();
        let im: Arc<dyn IndexManager> = Arc::new(MemoryJournal::new(SlotPolicy::Worm, &PoolConfig::default()).unwrap());
        let nexus = factory.new_instance(&im).unwrap();
        (factory, nexus)
    }

    fn spo() -> Predicate {
        Predicate::new("kb.spo", vec![Term::var("s"), Term::constant(7), Term::var("o")]).unwrap()
    }

    #[test]
    fn bind_applies_values_and_checks_constants() {
        let (_f, nexus) = nexus();
        let mut bs = BindingSet::new();
        assert!(nexus.bind(&spo(), &[], &Element::from([1, 7, 2]), &mut bs));
        assert_eq!(bs.get(&Var::new("s")), Some(TermId::new(1)));
        assert_eq!(bs.get(&Var::new("o")), Some(TermId::new(2)));

        let mut bs = BindingSet::new();
        assert!(!nexus.bind(&spo(), &[], &Element::from([1, 8, 2]), &mut bs));
    }

    #[test]
    fn bind_keeps_partial_state_on_constraint_failure() {
        let (_f, nexus) = nexus();
        let reflexive = [Constraint::NotEqual(Term::var("s"), Term::var("o"))];
        let mut bs = BindingSet::new();
        assert!(!nexus.bind(&spo(), &reflexive, &Element::from([3, 7, 3]), &mut bs));
        // The bindings stay applied.
        assert_eq!(bs.len(), 2);
    }

    #[test]
    fn bind_rejects_conflicting_binding() {
        let (_f, nexus) = nexus();
        let mut bs = BindingSet::new();
        bs.set(Var::new("s"), TermId::new(9));
        assert!(!nexus.bind(&spo(), &[], &Element::from([1, 7, 2]), &mut bs));
    }

    #[test]
    fn fused_tail_view_reads_union() {
        let (_f, nexus) = nexus();
        let a = nexus.new_insert_buffer("a").unwrap();
        let rule = Arc::new(
            Rule::builder("seed")
                .head(Predicate::new("a", vec![Term::var("x")]).unwrap())
                .tail(Predicate::new("a", vec![Term::var("x")]).unwrap())
                .build()
                .unwrap(),
        );
        let mut bs = BindingSet::new();
        bs.set(Var::new("x"), TermId::new(1));
        a.add_chunk(vec![nexus.new_solution(&rule, &bs)]).unwrap();
        assert_eq!(a.flush().unwrap(), 1);

        let fused = Predicate::fused(vec!["a".to_string(), "b".to_string()], vec![Term::var("x")]).unwrap();
        let view = nexus.tail_view(&fused).unwrap();
        assert_eq!(view.name(), "a|b");
        assert_eq!(view.access_path(&[None]).unwrap(), vec![Element::from([1])]);
    }

    #[test]
    fn nexus_does_not_keep_index_manager_alive() {
        let factory = NexusFactory::new(NexusDescriptor::new(Action::Insert)).unwrap();
        let im: Arc<dyn IndexManager> = Arc::new(MemoryJournal::new(SlotPolicy::Worm, &PoolConfig::default()).unwrap());
        let weak = Arc::downgrade(&im);
        let nexus = factory.new_instance(&im).unwrap();
        drop(im);

        assert!(weak.upgrade().is_none());
        assert!(matches!(
            nexus.index_manager(),
            Err(ExecutionError::IndexManagerReleased { .. })
        ));
        assert!(nexus.head_view(&copy_rule()).is_err());
        // Teardown evicted the cached instance.
        assert_eq!(factory.cached().unwrap(), 0);
    }

    fn copy_rule() -> Rule {
        Rule::builder("copy")
            .head(Predicate::new("b", vec![Term::var("x")]).unwrap())
            .tail(Predicate::new("a", vec![Term::var("x")]).unwrap())
            .build()
            .unwrap()
    }

    #[test]
    fn released_factory_is_reported() {
        let (factory, nexus) = nexus();
        drop(factory);
        assert!(matches!(nexus.factory(), Err(ExecutionError::FactoryReleased)));
    }
}
