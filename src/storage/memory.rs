//! In-memory storage backend.
//!
//! This module provides thread-safe in-memory implementations of the storage
//! traits: a [`MemoryJournal`] and a partitioned [`MemoryFederation`]. They are
//! intended for embedded usage, tests, and as a reference implementation.
//!
//! Commit history is kept as immutable snapshots keyed by commit point. A
//! journal configured with [`SlotPolicy::Reuse`] releases every snapshot that
//! no read-only transaction pins as soon as the next commit happens; reading
//! a released snapshot fails. A federation commits on every write and always
//! releases unpinned snapshots, so its history holds at most the pinned
//! commit points plus the latest one.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::PoolConfig;
use crate::error::QuadlogResult;
use crate::model::{Element, TermId};
use crate::runtime::TaskPool;
use crate::storage::traits::{
    IndexManager, IndexManagerId, IndexManagerKind, PartitionId, RelationView, StorageError, TeardownHook, Timestamp,
    TxId,
};

fn lock_err(context: &'static str) -> StorageError {
    StorageError::BackendError(format!("poisoned lock: {context}"))
}

/// What a journal does with commit points nobody reads any more.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SlotPolicy {
    /// Write once, read many: every commit point stays readable.
    Worm,
    /// Unpinned commit points are released on the next commit.
    Reuse,
}

/// One entry of the commit log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitRecord {
    /// The commit point.
    pub timestamp: Timestamp,
    /// Wall-clock time of the commit.
    pub committed_at: DateTime<Utc>,
}

type Tables = HashMap<String, BTreeSet<Element>>;

#[derive(Debug)]
enum Snapshot {
    Retained(Arc<Vec<Tables>>),
    Released,
}

#[derive(Debug)]
struct StoreState {
    live: Vec<Tables>,
    history: BTreeMap<Timestamp, Snapshot>,
    last_commit: Timestamp,
    pinned: HashMap<TxId, Timestamp>,
    log: Vec<CommitRecord>,
}

#[derive(Debug)]
struct Store {
    partitions: usize,
    slot_policy: SlotPolicy,
    auto_commit: bool,
    state: RwLock<StoreState>,
}

impl Store {
    fn new(partitions: usize, slot_policy: SlotPolicy, auto_commit: bool) -> Self {
        let partitions = partitions.max(1);
        let mut state = StoreState {
            live: vec![Tables::new(); partitions],
            history: BTreeMap::new(),
            last_commit: Timestamp::UNISOLATED,
            pinned: HashMap::new(),
            log: Vec::new(),
        };
        Self::commit_locked(&mut state, false);
        Self {
            partitions,
            slot_policy,
            auto_commit,
            state: RwLock::new(state),
        }
    }

    fn partition_of(&self, element: &Element) -> PartitionId {
        partition_for(element.get(0), self.partitions)
    }

    /// Whether a commit releases the snapshots nobody pins.
    fn releases_unpinned(&self) -> bool {
        self.slot_policy == SlotPolicy::Reuse || self.auto_commit
    }

    fn commit_locked(state: &mut StoreState, release_unpinned: bool) -> Timestamp {
        let next = Timestamp::new(state.last_commit.get() + 1);
        if release_unpinned {
            let pinned: BTreeSet<Timestamp> = state.pinned.values().copied().collect();
            for (ts, snapshot) in &mut state.history {
                if !pinned.contains(ts) {
                    *snapshot = Snapshot::Released;
                }
            }
        }
        state
            .history
            .insert(next, Snapshot::Retained(Arc::new(state.live.clone())));
        state.last_commit = next;
        state.log.push(CommitRecord {
            timestamp: next,
            committed_at: Utc::now(),
        });
        tracing::trace!(commit = %next, "memory store committed");
        next
    }

    fn snapshot(state: &StoreState, timestamp: Timestamp) -> Result<Arc<Vec<Tables>>, StorageError> {
        if timestamp > state.last_commit {
            return Err(StorageError::UnknownTimestamp(timestamp));
        }
        match state.history.range(..=timestamp).next_back() {
            Some((_, Snapshot::Retained(tables))) => Ok(Arc::clone(tables)),
            Some((_, Snapshot::Released)) => Err(StorageError::SnapshotReleased(timestamp)),
            None => Err(StorageError::UnknownTimestamp(timestamp)),
        }
    }

    fn read<T>(
        &self,
        timestamp: Timestamp,
        f: impl FnOnce(&[Tables]) -> T,
    ) -> Result<T, StorageError> {
        let state = self.state.read().map_err(|_| lock_err("store.read"))?;
        if timestamp.is_unisolated() {
            return Ok(f(&state.live));
        }
        let tables = Self::snapshot(&state, timestamp)?;
        Ok(f(&tables))
    }

    fn scan(
        &self,
        name: &str,
        timestamp: Timestamp,
        partition: Option<PartitionId>,
        pattern: &[Option<TermId>],
    ) -> Result<Vec<Element>, StorageError> {
        self.read(timestamp, |tables| {
            let selected: Vec<&Tables> = match partition {
                Some(p) => tables.get(p).into_iter().collect(),
                None => tables.iter().collect(),
            };
            selected
                .into_iter()
                .filter_map(|t| t.get(name))
                .flat_map(|rel| {
                    rel.iter()
                        .filter(|e| pattern.is_empty() || e.matches(pattern))
                        .cloned()
                })
                .collect()
        })
    }

    fn write(&self, name: &str, timestamp: Timestamp, chunk: &[Element], insert: bool) -> Result<u64, StorageError> {
        if !timestamp.is_unisolated() {
            return Err(StorageError::ReadOnly(name.to_string()));
        }
        let mut state = self.state.write().map_err(|_| lock_err("store.write"))?;
        let mut changed = 0u64;
        for element in chunk {
            let partition = self.partition_of(element);
            let relation = state.live[partition].entry(name.to_string()).or_default();
            let hit = if insert {
                relation.insert(element.clone())
            } else {
                relation.remove(element)
            };
            if hit {
                changed += 1;
            }
        }
        if self.auto_commit && changed > 0 {
            Self::commit_locked(&mut state, self.releases_unpinned());
        }
        Ok(changed)
    }

    fn commit(&self) -> Result<Timestamp, StorageError> {
        let mut state = self.state.write().map_err(|_| lock_err("store.commit"))?;
        Ok(Self::commit_locked(&mut state, self.releases_unpinned()))
    }

    fn last_commit_time(&self) -> Timestamp {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .last_commit
    }

    fn pin(&self, timestamp: Timestamp) -> Result<TxId, StorageError> {
        let mut state = self.state.write().map_err(|_| lock_err("store.pin"))?;
        if timestamp.is_unisolated() {
            return Err(StorageError::BackendError(
                "read-only transaction requires a commit point".to_string(),
            ));
        }
        Self::snapshot(&state, timestamp)?;
        let tx = TxId::new();
        state.pinned.insert(tx, timestamp);
        Ok(tx)
    }

    fn pin_latest(&self) -> Result<(TxId, Timestamp), StorageError> {
        let mut state = self.state.write().map_err(|_| lock_err("store.pin"))?;
        let timestamp = state.last_commit;
        Self::snapshot(&state, timestamp)?;
        let tx = TxId::new();
        state.pinned.insert(tx, timestamp);
        Ok((tx, timestamp))
    }

    fn unpin(&self, tx: TxId) -> Result<(), StorageError> {
        let mut state = self.state.write().map_err(|_| lock_err("store.unpin"))?;
        state
            .pinned
            .remove(&tx)
            .map(|_| ())
            .ok_or(StorageError::TransactionNotFound(tx))
    }

    fn open_transactions(&self) -> usize {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .pinned
            .len()
    }

    fn commit_log(&self) -> Vec<CommitRecord> {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .log
            .clone()
    }
}

/// Hooks run when an index manager is dropped.
#[derive(Default)]
struct Teardown(Mutex<Vec<TeardownHook>>);

impl Teardown {
    fn register(&self, hook: TeardownHook) {
        self.0.lock().unwrap_or_else(PoisonError::into_inner).push(hook);
    }

    fn run(&mut self, id: IndexManagerId) {
        let hooks = std::mem::take(self.0.get_mut().unwrap_or_else(PoisonError::into_inner));
        for hook in hooks {
            hook(id);
        }
    }
}

impl fmt::Debug for Teardown {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let hooks = self.0.lock().map_or(0, |h| h.len());
        f.debug_struct("Teardown").field("hooks", &hooks).finish()
    }
}

fn partition_for(first: Option<TermId>, partitions: usize) -> PartitionId {
    let n = u64::try_from(partitions.max(1)).unwrap_or(1);
    first.map_or(0, |id| usize::try_from(id.get() % n).unwrap_or(0))
}

/// A relation of a memory store at one timestamp.
#[derive(Debug)]
pub struct MemoryView {
    store: Arc<Store>,
    name: String,
    timestamp: Timestamp,
}

impl RelationView for MemoryView {
    fn name(&self) -> &str {
        &self.name
    }

    fn timestamp(&self) -> Timestamp {
        self.timestamp
    }

    fn access_path(&self, pattern: &[Option<TermId>]) -> Result<Vec<Element>, StorageError> {
        self.store.scan(&self.name, self.timestamp, None, pattern)
    }

    fn range_count(&self, pattern: &[Option<TermId>]) -> Result<u64, StorageError> {
        let n = self.access_path(pattern)?.len();
        Ok(u64::try_from(n).unwrap_or(u64::MAX))
    }

    fn insert(&self, chunk: &[Element]) -> Result<u64, StorageError> {
        self.store.write(&self.name, self.timestamp, chunk, true)
    }

    fn delete(&self, chunk: &[Element]) -> Result<u64, StorageError> {
        self.store.write(&self.name, self.timestamp, chunk, false)
    }

    fn partition_count(&self) -> usize {
        self.store.partitions
    }

    fn partition_access_path(
        &self,
        partition: PartitionId,
        pattern: &[Option<TermId>],
    ) -> Result<Vec<Element>, StorageError> {
        self.store.scan(&self.name, self.timestamp, Some(partition), pattern)
    }
}

/// Single-process journal.
#[derive(Debug)]
pub struct MemoryJournal {
    id: IndexManagerId,
    store: Arc<Store>,
    executor: Arc<TaskPool>,
    teardown: Teardown,
}

impl MemoryJournal {
    /// Creates an empty journal with its own task pool.
    pub fn new(slot_policy: SlotPolicy, pool: &PoolConfig) -> QuadlogResult<Self> {
        Ok(Self::with_executor(
            slot_policy,
            Arc::new(TaskPool::start("journal", pool)?),
        ))
    }

    /// Creates an empty journal sharing an existing task pool.
    #[must_use]
    pub fn with_executor(slot_policy: SlotPolicy, executor: Arc<TaskPool>) -> Self {
        Self {
            id: IndexManagerId::new(),
            store: Arc::new(Store::new(1, slot_policy, false)),
            executor,
            teardown: Teardown::default(),
        }
    }

    /// Slot policy of the journal.
    #[must_use]
    pub fn slot_policy(&self) -> SlotPolicy {
        self.store.slot_policy
    }

    /// Writes elements to the live view of `relation`.
    pub fn load(&self, relation: &str, elements: &[Element]) -> Result<u64, StorageError> {
        self.store.write(relation, Timestamp::UNISOLATED, elements, true)
    }

    /// Live contents of `relation`.
    pub fn contents(&self, relation: &str) -> Result<BTreeSet<Element>, StorageError> {
        Ok(self
            .store
            .scan(relation, Timestamp::UNISOLATED, None, &[])?
            .into_iter()
            .collect())
    }

    /// Number of read-only transactions still open.
    #[must_use]
    pub fn open_transactions(&self) -> usize {
        self.store.open_transactions()
    }

    /// Commit log, oldest first.
    #[must_use]
    pub fn commit_log(&self) -> Vec<CommitRecord> {
        self.store.commit_log()
    }
}

/// Partitioned federation. Every write commits on its own.
///
/// Elements are placed by the value of their first position. Only the latest
/// commit point and those pinned by a read-only transaction stay readable.
#[derive(Debug)]
pub struct MemoryFederation {
    id: IndexManagerId,
    store: Arc<Store>,
    executor: Arc<TaskPool>,
    teardown: Teardown,
}

impl MemoryFederation {
    /// Creates an empty federation with its own task pool.
    pub fn new(partitions: usize, pool: &PoolConfig) -> QuadlogResult<Self> {
        Ok(Self::with_executor(
            partitions,
            Arc::new(TaskPool::start("federation", pool)?),
        ))
    }

    /// Creates an empty federation sharing an existing task pool.
    #[must_use]
    pub fn with_executor(partitions: usize, executor: Arc<TaskPool>) -> Self {
        Self {
            id: IndexManagerId::new(),
            store: Arc::new(Store::new(partitions, SlotPolicy::Worm, true)),
            executor,
            teardown: Teardown::default(),
        }
    }

    /// Number of partitions.
    #[must_use]
    pub fn partition_count(&self) -> usize {
        self.store.partitions
    }

    /// Writes elements to `relation`.
    pub fn load(&self, relation: &str, elements: &[Element]) -> Result<u64, StorageError> {
        self.store.write(relation, Timestamp::UNISOLATED, elements, true)
    }

    /// Live contents of `relation`.
    pub fn contents(&self, relation: &str) -> Result<BTreeSet<Element>, StorageError> {
        Ok(self
            .store
            .scan(relation, Timestamp::UNISOLATED, None, &[])?
            .into_iter()
            .collect())
    }

    /// Live contents of one partition of `relation`.
    pub fn partition_contents(&self, relation: &str, partition: PartitionId) -> Result<Vec<Element>, StorageError> {
        self.store.scan(relation, Timestamp::UNISOLATED, Some(partition), &[])
    }

    /// Number of read-only transactions still open.
    #[must_use]
    pub fn open_transactions(&self) -> usize {
        self.store.open_transactions()
    }
}

fn view(store: &Arc<Store>, name: &str, timestamp: Timestamp) -> Result<Arc<dyn RelationView>, StorageError> {
    crate::model::validate_relation_name(name).map_err(|e| StorageError::BackendError(e.to_string()))?;
    Ok(Arc::new(MemoryView {
        store: Arc::clone(store),
        name: name.to_string(),
        timestamp,
    }))
}

impl IndexManager for MemoryJournal {
    fn id(&self) -> IndexManagerId {
        self.id
    }

    fn kind(&self) -> IndexManagerKind {
        IndexManagerKind::Journal {
            slot_reuse: self.store.slot_policy == SlotPolicy::Reuse,
        }
    }

    fn relation_view(&self, name: &str, timestamp: Timestamp) -> Result<Arc<dyn RelationView>, StorageError> {
        view(&self.store, name, timestamp)
    }

    fn last_commit_time(&self) -> Timestamp {
        self.store.last_commit_time()
    }

    fn commit(&self) -> Result<Timestamp, StorageError> {
        self.store.commit()
    }

    fn new_read_only_tx(&self, timestamp: Timestamp) -> Result<TxId, StorageError> {
        self.store.pin(timestamp)
    }

    fn abort(&self, tx: TxId) -> Result<(), StorageError> {
        self.store.unpin(tx)
    }

    fn pin_last_commit(&self) -> Result<(TxId, Timestamp), StorageError> {
        self.store.pin_latest()
    }

    fn executor(&self) -> Arc<TaskPool> {
        Arc::clone(&self.executor)
    }

    fn on_teardown(&self, hook: TeardownHook) {
        self.teardown.register(hook);
    }
}

impl Drop for MemoryJournal {
    fn drop(&mut self) {
        self.teardown.run(self.id);
    }
}

impl IndexManager for MemoryFederation {
    fn id(&self) -> IndexManagerId {
        self.id
    }

    fn kind(&self) -> IndexManagerKind {
        IndexManagerKind::Federation {
            partitions: self.store.partitions,
        }
    }

    fn relation_view(&self, name: &str, timestamp: Timestamp) -> Result<Arc<dyn RelationView>, StorageError> {
        view(&self.store, name, timestamp)
    }

    fn last_commit_time(&self) -> Timestamp {
        self.store.last_commit_time()
    }

    fn commit(&self) -> Result<Timestamp, StorageError> {
        self.store.commit()
    }

    fn new_read_only_tx(&self, timestamp: Timestamp) -> Result<TxId, StorageError> {
        self.store.pin(timestamp)
    }

    fn abort(&self, tx: TxId) -> Result<(), StorageError> {
        self.store.unpin(tx)
    }

    fn pin_last_commit(&self) -> Result<(TxId, Timestamp), StorageError> {
        self.store.pin_latest()
    }

    fn partitions(&self, _relation: &str, pattern: &[Option<TermId>]) -> Vec<PartitionId> {
        match pattern.first().copied().flatten() {
            Some(first) => vec![partition_for(Some(first), self.store.partitions)],
            None => (0..self.store.partitions).collect(),
        }
    }

    fn executor(&self) -> Arc<TaskPool> {
        Arc::clone(&self.executor)
    }

    fn on_teardown(&self, hook: TeardownHook) {
        self.teardown.register(hook);
    }
}

impl Drop for MemoryFederation {
    fn drop(&mut self) {
        self.teardown.run(self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn journal(policy: SlotPolicy) -> MemoryJournal {
        MemoryJournal::new(policy, &PoolConfig::default()).unwrap()
    }

    #[test]
    fn insert_counts_only_new_elements() {
        let j = journal(SlotPolicy::Worm);
        let v = j.relation_view("kb.spo", Timestamp::UNISOLATED).unwrap();
        assert_eq!(v.insert(&[Element::from([1, 2, 3]), Element::from([1, 2, 4])]).unwrap(), 2);
        assert_eq!(v.insert(&[Element::from([1, 2, 3])]).unwrap(), 0);
        assert_eq!(v.delete(&[Element::from([1, 2, 3]), Element::from([9, 9, 9])]).unwrap(), 1);
        assert_eq!(j.contents("kb.spo").unwrap().len(), 1);
    }

    #[test]
    fn snapshots_are_isolated_from_later_writes() {
        let j = journal(SlotPolicy::Worm);
        j.load("kb.spo", &[Element::from([1, 1, 1])]).unwrap();
        let t = j.commit().unwrap();
        j.load("kb.spo", &[Element::from([2, 2, 2])]).unwrap();

        let historical = j.relation_view("kb.spo", t).unwrap();
        assert_eq!(historical.access_path(&[None, None, None]).unwrap().len(), 1);
        assert!(matches!(
            historical.insert(&[Element::from([3, 3, 3])]),
            Err(StorageError::ReadOnly(_))
        ));

        let live = j.relation_view("kb.spo", Timestamp::UNISOLATED).unwrap();
        assert_eq!(live.range_count(&[None, None, None]).unwrap(), 2);
    }

    #[test]
    fn slot_reuse_releases_unpinned_snapshots() {
        let j = journal(SlotPolicy::Reuse);
        let t1 = j.commit().unwrap();
        let pinned = j.commit().unwrap();
        let tx = j.new_read_only_tx(pinned).unwrap();
        j.commit().unwrap();

        let released = j.relation_view("kb.spo", t1).unwrap();
        assert!(matches!(
            released.access_path(&[None]),
            Err(StorageError::SnapshotReleased(_))
        ));
        let kept = j.relation_view("kb.spo", pinned).unwrap();
        assert!(kept.access_path(&[None]).is_ok());

        j.abort(tx).unwrap();
        assert_eq!(j.open_transactions(), 0);
        j.commit().unwrap();
        assert!(kept.access_path(&[None]).is_err());
        assert!(matches!(j.abort(tx), Err(StorageError::TransactionNotFound(_))));
    }

    #[test]
    fn worm_keeps_every_snapshot() {
        let j = journal(SlotPolicy::Worm);
        let t1 = j.commit().unwrap();
        j.commit().unwrap();
        j.commit().unwrap();
        assert!(j.relation_view("kb.spo", t1).unwrap().access_path(&[None]).is_ok());
        assert_eq!(j.commit_log().len(), 4);
    }

    #[test]
    fn federation_places_by_first_position_and_autocommits() {
        let f = MemoryFederation::new(3, &PoolConfig::default()).unwrap();
        let before = f.last_commit_time();
        f.load("kb.spo", &[Element::from([3, 0, 0]), Element::from([4, 0, 0]), Element::from([5, 0, 0])])
            .unwrap();
        assert!(f.last_commit_time() > before);

        assert_eq!(f.partition_contents("kb.spo", 0).unwrap(), vec![Element::from([3, 0, 0])]);
        assert_eq!(f.partition_contents("kb.spo", 1).unwrap(), vec![Element::from([4, 0, 0])]);
        assert_eq!(f.partitions("kb.spo", &[Some(TermId::new(5)), None, None]), vec![2]);
        assert_eq!(f.partitions("kb.spo", &[None, None, None]), vec![0, 1, 2]);

        let v = f.relation_view("kb.spo", f.last_commit_time()).unwrap();
        assert_eq!(v.partition_count(), 3);
        assert_eq!(v.access_path(&[None, None, None]).unwrap().len(), 3);
    }

    #[test]
    fn federation_keeps_only_pinned_and_latest_snapshots() {
        let f = MemoryFederation::new(2, &PoolConfig::default()).unwrap();
        f.load("kb.spo", &[Element::from([1, 0, 0])]).unwrap();
        let pinned = f.last_commit_time();
        let tx = f.new_read_only_tx(pinned).unwrap();
        f.load("kb.spo", &[Element::from([2, 0, 0])]).unwrap();
        let stale = f.last_commit_time();
        f.load("kb.spo", &[Element::from([3, 0, 0])]).unwrap();

        let view = |ts| f.relation_view("kb.spo", ts).unwrap().access_path(&[None, None, None]);
        assert_eq!(view(pinned).unwrap().len(), 1);
        assert!(matches!(view(stale), Err(StorageError::SnapshotReleased(_))));
        assert_eq!(view(f.last_commit_time()).unwrap().len(), 3);

        f.abort(tx).unwrap();
        f.load("kb.spo", &[Element::from([4, 0, 0])]).unwrap();
        assert!(view(pinned).is_err());
    }

    #[test]
    fn teardown_hooks_run_once_on_drop() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        let fired = Arc::new(AtomicUsize::new(0));
        let j = journal(SlotPolicy::Worm);
        let id = j.id();
        let seen = Arc::clone(&fired);
        j.on_teardown(Box::new(move |dropped| {
            assert_eq!(dropped, id);
            seen.fetch_add(1, Ordering::SeqCst);
        }));
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        drop(j);
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn unknown_timestamp_is_rejected() {
        let j = journal(SlotPolicy::Worm);
        let future = Timestamp::new(j.last_commit_time().get() + 10);
        assert!(matches!(j.new_read_only_tx(future), Err(StorageError::UnknownTimestamp(_))));
        assert!(j.new_read_only_tx(Timestamp::UNISOLATED).is_err());
    }
}
