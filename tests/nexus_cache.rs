use quadlog::config::keys;
use quadlog::{
    Action, BufferConfig, ExecutionError, IndexManager, MemoryFederation, MemoryJournal, NexusDescriptor, NexusFactory,
    PlanKind, PoolConfig, SlotPolicy, SolutionFilter, SolutionFlags, Timestamp, ValidationError,
};
use std::sync::Arc;
use std::time::Duration;

fn managers() -> (Arc<dyn IndexManager>, Arc<dyn IndexManager>) {
    let journal: Arc<dyn IndexManager> = Arc::new(MemoryJournal::new(SlotPolicy::Worm, &PoolConfig::default()).unwrap());
    let federation: Arc<dyn IndexManager> = Arc::new(MemoryFederation::new(2, &PoolConfig::default()).unwrap());
    (journal, federation)
}

#[test]
fn one_nexus_per_index_manager() {
    let factory = NexusFactory::new(NexusDescriptor::new(Action::Insert)).unwrap();
    let (journal, federation) = managers();

    let a = factory.new_instance(&journal).unwrap();
    let b = factory.new_instance(&federation).unwrap();
    assert!(!Arc::ptr_eq(&a, &b));
    assert!(Arc::ptr_eq(&a, &factory.new_instance(&journal).unwrap()));
    assert_eq!(factory.cached().unwrap(), 2);

    assert!(factory.set_read_timestamp(Timestamp::new(1)).unwrap());
    assert_eq!(factory.cached().unwrap(), 0);
    let c = factory.new_instance(&journal).unwrap();
    assert!(!Arc::ptr_eq(&a, &c));
    assert_eq!(c.read_timestamp(), Timestamp::new(1));
}

#[test]
fn nexus_carries_descriptor_settings() {
    let filter = SolutionFilter::RejectReflexive { left: 0, right: 1 };
    let descriptor = NexusDescriptor::new(Action::Delete)
        .with_write_timestamp(Timestamp::UNISOLATED)
        .with_solution_flags(SolutionFlags::ELEMENT | SolutionFlags::RULE)
        .with_filter(filter.clone())
        .with_plan(PlanKind::RangeCount)
        .with_property(keys::CHUNK_CAPACITY, 64)
        .with_property(keys::CHUNK_TIMEOUT_MS, 25);
    let factory = NexusFactory::new(descriptor).unwrap();
    let (journal, _) = managers();
    let nexus = factory.new_instance(&journal).unwrap();

    assert_eq!(nexus.action(), Action::Delete);
    assert_eq!(nexus.solution_flags(), SolutionFlags::ELEMENT | SolutionFlags::RULE);
    assert_eq!(nexus.filter(), Some(&filter));
    assert_eq!(nexus.plan_kind(), PlanKind::RangeCount);
    assert_eq!(nexus.config().chunk_capacity, 64);
    assert_eq!(nexus.config().chunk_timeout, Duration::from_millis(25));
    assert_eq!(nexus.index_manager_id(), journal.id());
    assert_eq!(nexus.index_manager().unwrap().id(), journal.id());
}

#[test]
fn factory_survives_serialization() {
    let config = BufferConfig {
        chunk_capacity: 10,
        max_closure_rounds: Some(50),
        ..BufferConfig::default()
    };
    let factory = NexusFactory::new(NexusDescriptor::new(Action::Insert).with_config(&config)).unwrap();
    factory.set_read_timestamp(Timestamp::new(3)).unwrap();

    let bytes = factory.to_bytes().unwrap();
    let rebuilt = NexusFactory::from_bytes(&bytes).unwrap();
    assert_eq!(rebuilt.config(), &config);
    assert_eq!(rebuilt.read_timestamp().unwrap(), Timestamp::new(3));

    let (journal, _) = managers();
    // A rebuilt factory has its own cache.
    let a = factory.new_instance(&journal).unwrap();
    let b = rebuilt.new_instance(&journal).unwrap();
    assert!(!Arc::ptr_eq(&a, &b));
}

#[test]
fn corrupted_descriptor_is_rejected() {
    let factory = NexusFactory::new(NexusDescriptor::new(Action::Query)).unwrap();
    let mut bytes = factory.to_bytes().unwrap();
    let last = bytes.len() - 1;
    bytes[last] ^= 0x55;
    assert!(matches!(
        NexusFactory::from_bytes(&bytes),
        Err(ValidationError::InvalidDescriptor { .. })
    ));
}

#[test]
fn released_manager_gets_fresh_nexus() {
    let factory = NexusFactory::new(NexusDescriptor::new(Action::Query)).unwrap();
    let (journal, federation) = managers();
    let a = factory.new_instance(&journal).unwrap();
    factory.new_instance(&federation).unwrap();

    assert!(factory.release(journal.id()).unwrap());
    assert_eq!(factory.cached().unwrap(), 1);
    assert!(!Arc::ptr_eq(&a, &factory.new_instance(&journal).unwrap()));
}

#[test]
fn cache_does_not_outlive_dropped_manager() {
    let factory = NexusFactory::new(NexusDescriptor::new(Action::Insert)).unwrap();
    let journal = Arc::new(MemoryJournal::new(SlotPolicy::Worm, &PoolConfig::default()).unwrap());
    let im: Arc<dyn IndexManager> = journal.clone();
    let nexus = factory.new_instance(&im).unwrap();
    let weak = Arc::downgrade(&journal);

    drop(journal);
    drop(im);
    assert!(weak.upgrade().is_none());
    assert_eq!(factory.cached().unwrap(), 0);
    assert!(matches!(
        nexus.index_manager(),
        Err(ExecutionError::IndexManagerReleased { .. })
    ));
}
