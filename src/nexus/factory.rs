use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::config::BufferConfig;
use crate::error::{QuadlogError, QuadlogResult, ValidationError};
use crate::model::Action;
use crate::storage::{IndexManager, IndexManagerId, Timestamp};

use super::codec;
use super::descriptor::NexusDescriptor;
use super::evaluation::EvaluationNexus;

#[derive(Debug)]
struct FactoryState {
    read_timestamp: Timestamp,
    cache: HashMap<IndexManagerId, Arc<EvaluationNexus>>,
    // Managers that will call `release` when dropped.
    hooked: HashSet<IndexManagerId>,
}

/// Builds and caches [`EvaluationNexus`] instances for one evaluation context.
///
/// Everything but the read timestamp is fixed at construction. Instances are
/// cached per index manager; changing the read timestamp drops them all, and
/// dropping an index manager drops its instance.
#[derive(Debug)]
pub struct NexusFactory {
    descriptor: NexusDescriptor,
    config: BufferConfig,
    fingerprint: String,
    state: Mutex<FactoryState>,
}

impl NexusFactory {
    /// Validates the descriptor and creates a factory.
    pub fn new(descriptor: NexusDescriptor) -> Result<Arc<Self>, ValidationError> {
        let config = descriptor.validate()?;
        let fingerprint = descriptor.fingerprint();
        tracing::debug!(
            fingerprint = %fingerprint,
            action = %descriptor.action,
            read = %descriptor.read_timestamp,
            write = %descriptor.write_timestamp,
            "nexus factory created"
        );
        Ok(Arc::new(Self {
            state: Mutex::new(FactoryState {
                read_timestamp: descriptor.read_timestamp,
                cache: HashMap::new(),
                hooked: HashSet::new(),
            }),
            descriptor,
            config,
            fingerprint,
        }))
    }

    /// Rebuilds a factory from [`NexusFactory::to_bytes`] output.
    pub fn from_bytes(bytes: &[u8]) -> Result<Arc<Self>, ValidationError> {
        Self::new(codec::decode(bytes)?)
    }

    /// Serializes the descriptor, including the current read timestamp.
    pub fn to_bytes(&self) -> QuadlogResult<Vec<u8>> {
        Ok(codec::encode(&self.descriptor()?)?)
    }

    fn lock(&self) -> QuadlogResult<MutexGuard<'_, FactoryState>> {
        self.state
            .lock()
            .map_err(|_| QuadlogError::internal("poisoned lock: nexus factory"))
    }

    /// The descriptor with the current read timestamp.
    pub fn descriptor(&self) -> QuadlogResult<NexusDescriptor> {
        let read = self.read_timestamp()?;
        Ok(self.descriptor.clone().with_read_timestamp(read))
    }

    /// Default action of the context.
    #[must_use]
    pub const fn action(&self) -> Action {
        self.descriptor.action
    }

    /// Timestamp written by mutations.
    #[must_use]
    pub const fn write_timestamp(&self) -> Timestamp {
        self.descriptor.write_timestamp
    }

    /// Current read timestamp.
    pub fn read_timestamp(&self) -> QuadlogResult<Timestamp> {
        Ok(self.lock()?.read_timestamp)
    }

    /// Resolved buffer configuration.
    #[must_use]
    pub const fn config(&self) -> &BufferConfig {
        &self.config
    }

    /// Fingerprint of the descriptor the factory was created from.
    #[must_use]
    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    /// Moves the read timestamp. Every cached nexus is dropped when it changes.
    ///
    /// Returns false if the timestamp was already current.
    pub fn set_read_timestamp(&self, timestamp: Timestamp) -> QuadlogResult<bool> {
        let mut state = self.lock()?;
        if state.read_timestamp == timestamp {
            return Ok(false);
        }
        let dropped = state.cache.len();
        state.read_timestamp = timestamp;
        state.cache.clear();
        tracing::debug!(
            fingerprint = %self.fingerprint,
            read = %timestamp,
            dropped,
            "read timestamp advanced"
        );
        Ok(true)
    }

    /// The nexus for `index_manager` at the current read timestamp.
    ///
    /// Concurrent callers for the same index manager get the same instance.
    pub fn new_instance(self: &Arc<Self>, index_manager: &Arc<dyn IndexManager>) -> QuadlogResult<Arc<EvaluationNexus>> {
        let mut state = self.lock()?;
        let id = index_manager.id();
        if let Some(nexus) = state.cache.get(&id) {
            return Ok(Arc::clone(nexus));
        }
        if state.hooked.insert(id) {
            let factory = Arc::downgrade(self);
            index_manager.on_teardown(Box::new(move |id| {
                if let Some(factory) = factory.upgrade() {
                    if let Err(e) = factory.release(id) {
                        tracing::warn!(index_manager = %id, error = %e, "failed to evict nexus");
                    }
                }
            }));
        }
        let nexus = Arc::new(EvaluationNexus::new(
            Arc::downgrade(self),
            index_manager,
            &self.descriptor,
            state.read_timestamp,
            self.config.clone(),
        ));
        state.cache.insert(id, Arc::clone(&nexus));
        Ok(nexus)
    }

    /// An uncached nexus for `index_manager` reading at `read_timestamp`.
    ///
    /// The factory's own read timestamp and cache are left untouched, so
    /// overlapping callers pinning different commit points do not interfere.
    #[must_use]
    pub fn pinned_instance(
        self: &Arc<Self>,
        index_manager: &Arc<dyn IndexManager>,
        read_timestamp: Timestamp,
    ) -> Arc<EvaluationNexus> {
        Arc::new(EvaluationNexus::new(
            Arc::downgrade(self),
            index_manager,
            &self.descriptor,
            read_timestamp,
            self.config.clone(),
        ))
    }

    /// Drops the cached nexus for an index manager being torn down.
    ///
    /// Index managers call this on drop; returns true if one was cached.
    pub fn release(&self, id: IndexManagerId) -> QuadlogResult<bool> {
        let mut state = self.lock()?;
        state.hooked.remove(&id);
        Ok(state.cache.remove(&id).is_some())
    }

    /// Number of cached instances.
    pub fn cached(&self) -> QuadlogResult<usize> {
        Ok(self.lock()?.cache.len())
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use super::*;
    use crate::config::PoolConfig;
    use crate::storage::{MemoryJournal, SlotPolicy};

    fn manager() -> Arc<dyn IndexManager> {
        Arc::new(MemoryJournal::new(SlotPolicy::Worm, &PoolConfig::default()).unwrap())
    }

    #[test]
    fn same_instance_until_read_timestamp_changes() {
        let factory = NexusFactory::new(NexusDescriptor::new(Action::Insert)).unwrap();
        let im = manager();
        let a = factory.new_instance(&im).unwrap();
        let b = factory.new_instance(&im).unwrap();
        assert!(Arc::ptr_eq(&a, &b));

        assert!(!factory.set_read_timestamp(Timestamp::UNISOLATED).unwrap());
        assert!(Arc::ptr_eq(&a, &factory.new_instance(&im).unwrap()));

        assert!(factory.set_read_timestamp(Timestamp::new(5)).unwrap());
        let c = factory.new_instance(&im).unwrap();
        assert!(!Arc::ptr_eq(&a, &c));
        assert_eq!(c.read_timestamp(), Timestamp::new(5));
        assert_eq!(a.read_timestamp(), Timestamp::UNISOLATED);
    }

    #[test]
    fn concurrent_callers_share_one_instance() {
        let factory = NexusFactory::new(NexusDescriptor::new(Action::Query)).unwrap();
        let im = manager();
        let instances: Vec<_> = thread::scope(|s| {
            let handles: Vec<_> = (0..8)
                .map(|_| s.spawn(|| factory.new_instance(&im).unwrap()))
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });
        assert!(instances.windows(2).all(|w| Arc::ptr_eq(&w[0], &w[1])));
        assert_eq!(factory.cached().unwrap(), 1);
    }

    #[test]
    fn release_drops_cached_instance() {
        let factory = NexusFactory::new(NexusDescriptor::new(Action::Query)).unwrap();
        let im = manager();
        let a = factory.new_instance(&im).unwrap();
        assert!(factory.release(im.id()).unwrap());
        assert!(!factory.release(im.id()).unwrap());
        assert!(!Arc::ptr_eq(&a, &factory.new_instance(&im).unwrap()));
    }

    #[test]
    fn dropping_index_manager_evicts_its_instance() {
        let factory = NexusFactory::new(NexusDescriptor::new(Action::Query)).unwrap();
        let kept = manager();
        let dropped = manager();
        let weak = Arc::downgrade(&dropped);
        factory.new_instance(&kept).unwrap();
        factory.new_instance(&dropped).unwrap();
        // Invalidation does not register a second hook.
        factory.set_read_timestamp(Timestamp::new(1)).unwrap();
        factory.new_instance(&dropped).unwrap();
        assert_eq!(factory.cached().unwrap(), 1);

        drop(dropped);
        assert!(weak.upgrade().is_none());
        assert_eq!(factory.cached().unwrap(), 0);
        factory.new_instance(&kept).unwrap();
        assert_eq!(factory.cached().unwrap(), 1);
    }

    #[test]
    fn pinned_instance_leaves_factory_alone() {
        let factory = NexusFactory::new(NexusDescriptor::new(Action::Insert)).unwrap();
        let im = manager();
        let cached = factory.new_instance(&im).unwrap();
        let pinned = factory.pinned_instance(&im, Timestamp::new(1));

        assert_eq!(pinned.read_timestamp(), Timestamp::new(1));
        assert_eq!(factory.read_timestamp().unwrap(), Timestamp::UNISOLATED);
        assert!(Arc::ptr_eq(&cached, &factory.new_instance(&im).unwrap()));
    }

    #[test]
    fn bytes_roundtrip_keeps_read_timestamp() {
        let factory = NexusFactory::new(NexusDescriptor::new(Action::Insert)).unwrap();
        factory.set_read_timestamp(Timestamp::new(9)).unwrap();
        let bytes = factory.to_bytes().unwrap();
        let rebuilt = NexusFactory::from_bytes(&bytes).unwrap();
        assert_eq!(rebuilt.read_timestamp().unwrap(), Timestamp::new(9));
        assert_eq!(rebuilt.action(), Action::Insert);
        assert_eq!(rebuilt.descriptor().unwrap(), factory.descriptor().unwrap());
    }
}
