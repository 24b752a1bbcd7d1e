//! Coalescer configuration.

use serde::{Deserialize, Serialize};

/// How a single-key fetch that found nothing is reported.
///
/// Bulk fetches always report missing keys as absent; this only governs the
/// single-key path, where backends disagree on whether a miss is an error.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MissingKeyPolicy {
    /// Resolve the request with `None`.
    #[default]
    Absent,
    /// Reject the request with [`CoalesceError::NotFound`](crate::CoalesceError::NotFound).
    Reject,
}

/// Configuration for a [`Coalescer`](crate::Coalescer).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoalescerConfig {
    /// Name of the `coalescer` tracing span each flush task runs in.
    pub name: String,
    /// Reporting of single-key misses.
    pub missing_key_policy: MissingKeyPolicy,
}

impl Default for CoalescerConfig {
    fn default() -> Self {
        Self {
            name: "coalescer".to_string(),
            missing_key_policy: MissingKeyPolicy::Absent,
        }
    }
}

impl CoalescerConfig {
    /// Creates a named configuration with default settings.
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Sets the single-key miss policy.
    pub fn with_missing_key_policy(mut self, policy: MissingKeyPolicy) -> Self {
        self.missing_key_policy = policy;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = CoalescerConfig::default();
        assert_eq!(config.name, "coalescer");
        assert_eq!(config.missing_key_policy, MissingKeyPolicy::Absent);
    }

    #[test]
    fn test_builder() {
        let config = CoalescerConfig::named("users").with_missing_key_policy(MissingKeyPolicy::Reject);
        assert_eq!(config.name, "users");
        assert_eq!(config.missing_key_policy, MissingKeyPolicy::Reject);
    }

    #[test]
    fn test_deserialize_partial() {
        let config: CoalescerConfig =
            serde_json::from_str(r#"{"missing_key_policy":"reject"}"#).unwrap();
        assert_eq!(config.name, "coalescer");
        assert_eq!(config.missing_key_policy, MissingKeyPolicy::Reject);
    }
}
