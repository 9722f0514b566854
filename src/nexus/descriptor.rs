use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::config::BufferConfig;
use crate::error::ValidationError;
use crate::join::{JoinStrategy, PlanKind};
use crate::model::{Action, SolutionFilter, SolutionFlags};
use crate::storage::Timestamp;

/// Current descriptor layout version.
pub const DESCRIPTOR_VERSION: u32 = 1;

/// Serializable description of an evaluation context.
///
/// Everything a worker needs to rebuild an [`EvaluationNexus`](super::EvaluationNexus)
/// against its own index manager.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NexusDescriptor {
    /// Layout version.
    pub version: u32,
    /// Default action for steps run through the nexus.
    pub action: Action,
    /// Timestamp of the views written by mutations.
    pub write_timestamp: Timestamp,
    /// Timestamp of the views read by joins.
    pub read_timestamp: Timestamp,
    /// String properties, resolved into a [`BufferConfig`].
    #[serde(default)]
    pub properties: BTreeMap<String, String>,
    /// What each solution carries.
    pub solution_flags: SolutionFlags,
    /// Filter applied before solutions reach a buffer.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter: Option<SolutionFilter>,
    /// How join orders are chosen.
    #[serde(default)]
    pub plan: PlanKind,
    /// Strategy for rules that do not force one; `None` selects by index manager kind.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_strategy: Option<JoinStrategy>,
}

impl NexusDescriptor {
    /// A descriptor for `action` over the live view with default settings.
    #[must_use]
    pub fn new(action: Action) -> Self {
        Self {
            version: DESCRIPTOR_VERSION,
            action,
            write_timestamp: Timestamp::UNISOLATED,
            read_timestamp: Timestamp::UNISOLATED,
            properties: BTreeMap::new(),
            solution_flags: SolutionFlags::default(),
            filter: None,
            plan: PlanKind::default(),
            default_strategy: None,
        }
    }

    /// Sets the read timestamp.
    #[must_use]
    pub const fn with_read_timestamp(mut self, timestamp: Timestamp) -> Self {
        self.read_timestamp = timestamp;
        self
    }

    /// Sets the write timestamp.
    #[must_use]
    pub const fn with_write_timestamp(mut self, timestamp: Timestamp) -> Self {
        self.write_timestamp = timestamp;
        self
    }

    /// Sets one property.
    #[must_use]
    pub fn with_property(mut self, name: impl Into<String>, value: impl ToString) -> Self {
        self.properties.insert(name.into(), value.to_string());
        self
    }

    /// Replaces the properties with those of `config`.
    #[must_use]
    pub fn with_config(mut self, config: &BufferConfig) -> Self {
        self.properties.extend(config.to_properties());
        self
    }

    /// Sets the solution flags.
    #[must_use]
    pub const fn with_solution_flags(mut self, flags: SolutionFlags) -> Self {
        self.solution_flags = flags;
        self
    }

    /// Sets the solution filter.
    #[must_use]
    pub fn with_filter(mut self, filter: SolutionFilter) -> Self {
        self.filter = Some(filter);
        self
    }

    /// Sets the plan kind.
    #[must_use]
    pub const fn with_plan(mut self, plan: PlanKind) -> Self {
        self.plan = plan;
        self
    }

    /// Sets the default join strategy.
    #[must_use]
    pub const fn with_default_strategy(mut self, strategy: JoinStrategy) -> Self {
        self.default_strategy = Some(strategy);
        self
    }

    /// Checks the descriptor and resolves its buffer configuration.
    pub fn validate(&self) -> Result<BufferConfig, ValidationError> {
        if self.version != DESCRIPTOR_VERSION {
            return Err(ValidationError::InvalidDescriptor {
                reason: format!(
                    "unsupported descriptor version {} (expected {DESCRIPTOR_VERSION})",
                    self.version
                ),
            });
        }
        if self.action.is_mutation() && !self.solution_flags.contains(SolutionFlags::ELEMENT) {
            return Err(ValidationError::InvalidDescriptor {
                reason: format!("{} requires element solutions", self.action),
            });
        }
        BufferConfig::from_properties(&self.properties)
    }

    /// Stable fingerprint of the descriptor, for logs.
    #[must_use]
    pub fn fingerprint(&self) -> String {
        // serde_json keeps struct field order and BTreeMap key order.
        let bytes = serde_json::to_vec(self).unwrap_or_default();
        let hash = blake3::hash(&bytes);
        hash.to_hex().as_str()[..16].to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::keys;

    #[test]
    fn defaults_validate() {
        let d = NexusDescriptor::new(Action::Insert);
        let cfg = d.validate().unwrap();
        assert_eq!(cfg, BufferConfig::default());
        assert_eq!(d.read_timestamp, Timestamp::UNISOLATED);
    }

    #[test]
    fn mutation_requires_element_flag() {
        let d = NexusDescriptor::new(Action::Delete).with_solution_flags(SolutionFlags::BINDINGS);
        assert!(matches!(d.validate(), Err(ValidationError::InvalidDescriptor { .. })));
        let d = NexusDescriptor::new(Action::Query).with_solution_flags(SolutionFlags::BINDINGS);
        assert!(d.validate().is_ok());
    }

    #[test]
    fn bad_property_fails_validation() {
        let d = NexusDescriptor::new(Action::Query).with_property(keys::CHUNK_CAPACITY, "-1");
        assert!(matches!(d.validate(), Err(ValidationError::InvalidProperty { .. })));
    }

    #[test]
    fn fingerprint_tracks_content() {
        let a = NexusDescriptor::new(Action::Query);
        let b = a.clone().with_read_timestamp(Timestamp::new(7));
        assert_eq!(a.fingerprint(), a.clone().fingerprint());
        assert_ne!(a.fingerprint(), b.fingerprint());
        assert_eq!(a.fingerprint().len(), 16);
    }
}
