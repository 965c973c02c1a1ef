//! Configuration for the scheduler, the concurrency manager and chains.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use relay_core::TaskCategory;
use serde::{Deserialize, Serialize};

/// Configuration for the task scheduler.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Write task and execution snapshots to storage
    pub persist: bool,
    /// Route executions through the concurrency manager when one is attached
    pub admission_control: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            persist: true,
            admission_control: true,
        }
    }
}

/// Per-category concurrency ceilings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConcurrencyConfig {
    /// Limit for categories without an explicit entry
    pub default_limit: usize,
    /// Explicit per-category limits
    pub limits: HashMap<TaskCategory, usize>,
}

impl Default for ConcurrencyConfig {
    fn default() -> Self {
        let limits = HashMap::from([
            (TaskCategory::Api, 10),
            (TaskCategory::Plugin, 5),
            (TaskCategory::Custom, 5),
            (TaskCategory::Workflow, 2),
        ]);
        Self {
            default_limit: 5,
            limits,
        }
    }
}

impl ConcurrencyConfig {
    /// Same limit for every category.
    pub fn uniform(limit: usize) -> Self {
        Self {
            default_limit: limit,
            limits: HashMap::new(),
        }
    }

    /// Set the limit for one category.
    pub fn with_limit(mut self, category: TaskCategory, limit: usize) -> Self {
        self.limits.insert(category, limit);
        self
    }

    /// Set the shared default.
    pub fn with_default_limit(mut self, limit: usize) -> Self {
        self.default_limit = limit;
        self
    }

    /// Effective limit for `category`.
    pub fn limit_for(&self, category: TaskCategory) -> usize {
        self.limits.get(&category).copied().unwrap_or(self.default_limit)
    }
}

/// What happens to a node whose dependency was skipped by its condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SkippedDependencyPolicy {
    /// The dependency is unsatisfied: abort the chain
    #[default]
    Abort,
    /// Skip the dependent as well and keep going
    Skip,
}

/// Configuration for chain execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChainConfig {
    /// Upper bound on waiting for one node's execution, in milliseconds
    pub node_timeout_ms: u64,
    /// Handling of skipped dependencies
    pub skipped_dependency: SkippedDependencyPolicy,
    /// Interval used by the polling completion waiter, in milliseconds
    pub poll_interval_ms: u64,
}

impl Default for ChainConfig {
    fn default() -> Self {
        Self {
            node_timeout_ms: 600_000,
            skipped_dependency: SkippedDependencyPolicy::Abort,
            poll_interval_ms: 100,
        }
    }
}

impl ChainConfig {
    /// Set the node timeout.
    pub fn with_node_timeout(mut self, timeout: Duration) -> Self {
        self.node_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Set the skipped-dependency policy.
    pub fn with_skipped_dependency(mut self, policy: SkippedDependencyPolicy) -> Self {
        self.skipped_dependency = policy;
        self
    }

    /// Node timeout as a duration.
    pub fn node_timeout(&self) -> Duration {
        Duration::from_millis(self.node_timeout_ms)
    }

    /// Poll interval as a duration.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// Top-level configuration, as read from a JSON file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Directory of the JSON store
    pub storage_path: PathBuf,
    /// Scheduler settings
    pub scheduler: SchedulerConfig,
    /// Concurrency limits
    pub concurrency: ConcurrencyConfig,
    /// Chain settings
    pub chain: ChainConfig,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            storage_path: PathBuf::from(".relay"),
            scheduler: SchedulerConfig::default(),
            concurrency: ConcurrencyConfig::default(),
            chain: ChainConfig::default(),
        }
    }
}

impl RelayConfig {
    /// Parse from JSON; missing fields take their defaults.
    pub fn from_json(json: &str) -> serde_json::Result<Self> {
        serde_json::from_str(json)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_limits() {
        let config = ConcurrencyConfig::default();
        assert_eq!(config.limit_for(TaskCategory::Api), 10);
        assert_eq!(config.limit_for(TaskCategory::Workflow), 2);
    }

    #[test]
    fn test_uniform_and_override() {
        let config = ConcurrencyConfig::uniform(3).with_limit(TaskCategory::Api, 7);
        assert_eq!(config.limit_for(TaskCategory::Api), 7);
        assert_eq!(config.limit_for(TaskCategory::Plugin), 3);
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let json = r#"{
            "storage_path": "/tmp/relay",
            "concurrency": {"limits": {"api": 4}},
            "chain": {"skipped_dependency": "skip"}
        }"#;
        let config = RelayConfig::from_json(json).unwrap();

        assert_eq!(config.storage_path, PathBuf::from("/tmp/relay"));
        assert_eq!(config.concurrency.limit_for(TaskCategory::Api), 4);
        assert_eq!(config.concurrency.limit_for(TaskCategory::Custom), 5);
        assert_eq!(config.chain.skipped_dependency, SkippedDependencyPolicy::Skip);
        assert_eq!(config.chain.node_timeout(), Duration::from_secs(600));
        assert!(config.scheduler.persist);
    }
}
