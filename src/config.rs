//! Engine configuration.
//!
//! Configuration is carried as a string property map inside the nexus
//! descriptor (so it survives serialization) and resolved into typed
//! structs with validation when an evaluation nexus is built.

use std::collections::BTreeMap;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ValidationError;

/// Property names understood by [`BufferConfig::from_properties`].
pub mod keys {
    /// Solutions per chunk.
    pub const CHUNK_CAPACITY: &str = "quadlog.chunkCapacity";
    /// Chunks a blocking buffer can hold before producers block.
    pub const CHUNK_OF_CHUNKS_CAPACITY: &str = "quadlog.chunkOfChunksCapacity";
    /// How long the iterator waits to fill a chunk before yielding a partial one.
    pub const CHUNK_TIMEOUT_MS: &str = "quadlog.chunkTimeoutMs";
    /// Rules of a parallel program evaluated concurrently.
    pub const MAX_PARALLEL_SUBQUERIES: &str = "quadlog.maxParallelSubqueries";
    /// Run every program step in order and flush after each one.
    pub const FORCE_SERIAL_EXECUTION: &str = "quadlog.forceSerialExecution";
    /// Upper bound on closure rounds (0 means unbounded).
    pub const MAX_CLOSURE_ROUNDS: &str = "quadlog.maxClosureRounds";
}

/// Task pool sizing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Number of worker threads.
    pub workers: usize,
    /// Maximum queued tasks.
    pub queue_capacity: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            queue_capacity: 1024,
        }
    }
}

/// Buffer and scheduling knobs for one evaluation context.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BufferConfig {
    /// Solutions per chunk.
    pub chunk_capacity: usize,
    /// Chunks a blocking buffer can hold before producers block.
    pub chunk_of_chunks_capacity: usize,
    /// Fill timeout for the iterator; expiry yields a partial chunk.
    pub chunk_timeout: Duration,
    /// Rules of a parallel program evaluated concurrently.
    pub max_parallel_subqueries: usize,
    /// Disable rule-level parallelism and flush after every step.
    pub force_serial_execution: bool,
    /// Upper bound on closure rounds (`None` means unbounded).
    pub max_closure_rounds: Option<u32>,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            chunk_capacity: 1000,
            chunk_of_chunks_capacity: 100,
            chunk_timeout: Duration::from_millis(10),
            max_parallel_subqueries: 4,
            force_serial_execution: false,
            max_closure_rounds: None,
        }
    }
}

impl BufferConfig {
    /// Resolves the configuration from a property map, falling back to defaults.
    pub fn from_properties(properties: &BTreeMap<String, String>) -> Result<Self, ValidationError> {
        let defaults = Self::default();
        let chunk_capacity = property(properties, keys::CHUNK_CAPACITY, defaults.chunk_capacity, positive)?;
        let chunk_of_chunks_capacity = property(
            properties,
            keys::CHUNK_OF_CHUNKS_CAPACITY,
            defaults.chunk_of_chunks_capacity,
            positive,
        )?;
        let timeout_ms: u64 = property(properties, keys::CHUNK_TIMEOUT_MS, 10, |_| Ok(()))?;
        let max_parallel_subqueries = property(
            properties,
            keys::MAX_PARALLEL_SUBQUERIES,
            defaults.max_parallel_subqueries,
            |_| Ok(()),
        )?;
        let force_serial_execution = property(
            properties,
            keys::FORCE_SERIAL_EXECUTION,
            defaults.force_serial_execution,
            |_| Ok(()),
        )?;
        let max_rounds: u32 = property(properties, keys::MAX_CLOSURE_ROUNDS, 0, |_| Ok(()))?;

        Ok(Self {
            chunk_capacity,
            chunk_of_chunks_capacity,
            chunk_timeout: Duration::from_millis(timeout_ms),
            max_parallel_subqueries,
            force_serial_execution,
            max_closure_rounds: (max_rounds > 0).then_some(max_rounds),
        })
    }

    /// Writes this configuration as properties.
    #[must_use]
    pub fn to_properties(&self) -> BTreeMap<String, String> {
        let timeout_ms = u64::try_from(self.chunk_timeout.as_millis()).unwrap_or(u64::MAX);
        let mut out = BTreeMap::new();
        out.insert(keys::CHUNK_CAPACITY.to_string(), self.chunk_capacity.to_string());
        out.insert(
            keys::CHUNK_OF_CHUNKS_CAPACITY.to_string(),
            self.chunk_of_chunks_capacity.to_string(),
        );
        out.insert(keys::CHUNK_TIMEOUT_MS.to_string(), timeout_ms.to_string());
        out.insert(
            keys::MAX_PARALLEL_SUBQUERIES.to_string(),
            self.max_parallel_subqueries.to_string(),
        );
        out.insert(
            keys::FORCE_SERIAL_EXECUTION.to_string(),
            self.force_serial_execution.to_string(),
        );
        out.insert(
            keys::MAX_CLOSURE_ROUNDS.to_string(),
            self.max_closure_rounds.unwrap_or(0).to_string(),
        );
        out
    }

    /// Returns true if the rules of a parallel program may run concurrently.
    #[must_use]
    pub const fn allows_parallel_rules(&self) -> bool {
        !self.force_serial_execution && self.max_parallel_subqueries > 1
    }
}

fn positive(v: &usize) -> Result<(), String> {
    if *v == 0 {
        Err("must be positive".to_string())
    } else {
        Ok(())
    }
}

/// Resolves, parses and validates a property value.
pub fn property<T, V>(
    properties: &BTreeMap<String, String>,
    name: &str,
    default: T,
    validator: V,
) -> Result<T, ValidationError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    V: Fn(&T) -> Result<(), String>,
{
    let Some(raw) = properties.get(name) else {
        return Ok(default);
    };
    let invalid = |reason: String| ValidationError::InvalidProperty {
        name: name.to_string(),
        value: raw.clone(),
        reason,
    };
    let value = raw.trim().parse::<T>().map_err(|e| invalid(e.to_string()))?;
    validator(&value).map_err(invalid)?;
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_when_no_properties() {
        let cfg = BufferConfig::from_properties(&BTreeMap::new()).unwrap();
        assert_eq!(cfg, BufferConfig::default());
        assert!(cfg.allows_parallel_rules());
    }

    #[test]
    fn properties_roundtrip() {
        let cfg = BufferConfig {
            chunk_capacity: 7,
            chunk_of_chunks_capacity: 3,
            chunk_timeout: Duration::from_millis(250),
            max_parallel_subqueries: 1,
            force_serial_execution: true,
            max_closure_rounds: Some(12),
        };
        let back = BufferConfig::from_properties(&cfg.to_properties()).unwrap();
        assert_eq!(back, cfg);
        assert!(!back.allows_parallel_rules());
    }

    #[test]
    fn rejects_malformed_values() {
        let mut props = BTreeMap::new();
        props.insert(keys::CHUNK_CAPACITY.to_string(), "lots".to_string());
        let err = BufferConfig::from_properties(&props).unwrap_err();
        assert!(matches!(err, ValidationError::InvalidProperty { ref name, .. } if name == keys::CHUNK_CAPACITY));

        props.insert(keys::CHUNK_CAPACITY.to_string(), "0".to_string());
        let err = BufferConfig::from_properties(&props).unwrap_err();
        assert!(err.to_string().contains("must be positive"));
    }
}
