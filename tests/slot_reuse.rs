use quadlog::{
    submit, Action, Element, IndexManager, MemoryJournal, NexusDescriptor, NexusFactory, PoolConfig, Predicate,
    Program, QuadlogError, Rule, SlotPolicy, Step, StorageError, Term, Timestamp,
};
use std::sync::Arc;

fn transitive() -> Rule {
    Rule::builder("tc")
        .head(Predicate::new("kb.tc", vec![Term::var("x"), Term::var("z")]).unwrap())
        .tail(Predicate::new("kb.tc", vec![Term::var("x"), Term::var("y")]).unwrap())
        .tail(Predicate::new("kb.edge", vec![Term::var("y"), Term::var("z")]).unwrap())
        .build()
        .unwrap()
}

fn chain() -> Vec<Element> {
    (1..=4).map(|i| Element::from([i, i + 1])).collect()
}

#[test]
fn released_snapshots_are_unreadable() {
    let journal = MemoryJournal::new(SlotPolicy::Reuse, &PoolConfig::default()).unwrap();
    journal.load("kb.edge", &chain()).unwrap();
    let old = journal.commit().unwrap();
    journal.commit().unwrap();

    let view = journal.relation_view("kb.edge", old).unwrap();
    assert!(matches!(
        view.access_path(&[None, None]),
        Err(StorageError::SnapshotReleased(ts)) if ts == old
    ));
}

#[test]
fn pinned_snapshot_survives_commits() {
    let journal = MemoryJournal::new(SlotPolicy::Reuse, &PoolConfig::default()).unwrap();
    journal.load("kb.edge", &chain()).unwrap();
    let pinned = journal.commit().unwrap();
    let tx = journal.new_read_only_tx(pinned).unwrap();
    journal.load("kb.edge", &[Element::from([9, 9])]).unwrap();
    journal.commit().unwrap();

    let view = journal.relation_view("kb.edge", pinned).unwrap();
    assert_eq!(view.access_path(&[None, None]).unwrap().len(), 4);
    journal.abort(tx).unwrap();
    assert_eq!(journal.open_transactions(), 0);
}

#[test]
fn closure_on_reusing_journal_commits_each_round() {
    let journal = Arc::new(MemoryJournal::new(SlotPolicy::Reuse, &PoolConfig::default()).unwrap());
    journal.load("kb.edge", &chain()).unwrap();
    journal.load("kb.tc", &chain()).unwrap();
    let im: Arc<dyn IndexManager> = journal.clone();
    let commits_before = journal.commit_log().len();

    let factory = NexusFactory::new(NexusDescriptor::new(Action::Insert)).unwrap();
    let closure = Step::from(Program::closure_of([transitive()]).unwrap());
    let result = submit(&closure, Action::Insert, &factory, im)
        .unwrap()
        .into_mutation()
        .unwrap();

    assert_eq!(result.stats.round_deltas(), vec![3, 2, 1, 0]);
    assert_eq!(result.count, 6);
    assert_eq!(journal.contents("kb.tc").unwrap().len(), 10);
    // One forced commit per round.
    assert_eq!(journal.commit_log().len(), commits_before + 4);
    assert_eq!(journal.open_transactions(), 0);
    assert_eq!(factory.read_timestamp().unwrap(), Timestamp::UNISOLATED);
}

#[test]
fn reusing_journal_reaches_same_fixed_point_as_write_once() {
    let mut results = Vec::new();
    for policy in [SlotPolicy::Worm, SlotPolicy::Reuse] {
        let journal = Arc::new(MemoryJournal::new(policy, &PoolConfig::default()).unwrap());
        journal.load("kb.edge", &chain()).unwrap();
        journal.load("kb.tc", &chain()).unwrap();
        let im: Arc<dyn IndexManager> = journal.clone();
        let factory = NexusFactory::new(NexusDescriptor::new(Action::Insert)).unwrap();
        let closure = Step::from(Program::closure_of([transitive()]).unwrap());
        submit(&closure, Action::Insert, &factory, im).unwrap();
        results.push(journal.contents("kb.tc").unwrap());
    }
    assert_eq!(results[0], results[1]);
}

#[test]
fn failing_closure_round_releases_pinned_checkpoint() {
    let journal = Arc::new(MemoryJournal::new(SlotPolicy::Reuse, &PoolConfig::default()).unwrap());
    journal.load("kb.edge", &chain()).unwrap();
    journal.load("kb.tc", &chain()).unwrap();
    let im: Arc<dyn IndexManager> = journal.clone();
    // Writes against a commit point are rejected.
    let factory =
        NexusFactory::new(NexusDescriptor::new(Action::Insert).with_write_timestamp(Timestamp::new(1))).unwrap();

    let closure = Step::from(Program::closure_of([transitive()]).unwrap());
    let err = submit(&closure, Action::Insert, &factory, Arc::clone(&im)).unwrap_err();
    assert!(matches!(err, QuadlogError::Storage(StorageError::ReadOnly(_))));
    assert_eq!(journal.open_transactions(), 0);
    assert_eq!(factory.read_timestamp().unwrap(), Timestamp::UNISOLATED);
    assert_eq!(journal.contents("kb.tc").unwrap().len(), 4);

    // The journal is still usable afterwards.
    let factory = NexusFactory::new(NexusDescriptor::new(Action::Insert)).unwrap();
    let result = submit(&closure, Action::Insert, &factory, im)
        .unwrap()
        .into_mutation()
        .unwrap();
    assert_eq!(result.count, 6);
}
