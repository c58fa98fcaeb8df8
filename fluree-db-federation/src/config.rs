//! Federation join configuration
//!
//! Pool sizes and batching constants for the join strategies. Defaults match
//! the long-standing hard-coded values; hosts can override them from a config
//! file section (serde) or from `FLUREE_FEDERATION_*` environment variables.

use crate::error::{FederationError, Result};
use crate::queue::DEFAULT_QUEUE_CAPACITY;
use serde::{Deserialize, Serialize};
use std::env;

/// Default number of worker threads per nested-loop join cursor.
///
/// This is also the cap on in-flight remote calls for one cursor.
pub const DEFAULT_JOIN_WORKERS: usize = 40;

/// Block size used by the bound join while it is still ramping up
pub const DEFAULT_BOUND_JOIN_INITIAL_BLOCK: usize = 3;

/// Block size used by the bound join once ramped up
pub const DEFAULT_BOUND_JOIN_BLOCK_SIZE: usize = 10;

/// Number of processed bindings after which the bound join ramps up
pub const DEFAULT_BOUND_JOIN_RAMP_AFTER: usize = 10;

const DEFAULT_THREAD_NAME_PREFIX: &str = "fluree-federation";

/// Configuration shared by all federated join cursors
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FederationConfig {
    /// Worker threads per nested-loop / caching join cursor
    pub join_workers: usize,
    /// Result streams buffered between producers and the consumer
    pub queue_capacity: usize,
    /// Bound join block size before the ramp
    pub bound_join_initial_block: usize,
    /// Bound join block size after the ramp
    pub bound_join_block_size: usize,
    /// Processed bindings after which the bound join switches block size
    pub bound_join_ramp_after: usize,
    /// Prefix for spawned thread names
    pub thread_name_prefix: String,
}

impl Default for FederationConfig {
    fn default() -> Self {
        Self {
            join_workers: DEFAULT_JOIN_WORKERS,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            bound_join_initial_block: DEFAULT_BOUND_JOIN_INITIAL_BLOCK,
            bound_join_block_size: DEFAULT_BOUND_JOIN_BLOCK_SIZE,
            bound_join_ramp_after: DEFAULT_BOUND_JOIN_RAMP_AFTER,
            thread_name_prefix: DEFAULT_THREAD_NAME_PREFIX.to_string(),
        }
    }
}

impl FederationConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Defaults overlaid with `FLUREE_FEDERATION_*` environment variables
    ///
    /// Recognised variables: `FLUREE_FEDERATION_JOIN_WORKERS`,
    /// `FLUREE_FEDERATION_QUEUE_CAPACITY`, `FLUREE_FEDERATION_BOUND_JOIN_INITIAL_BLOCK`,
    /// `FLUREE_FEDERATION_BOUND_JOIN_BLOCK_SIZE`, `FLUREE_FEDERATION_BOUND_JOIN_RAMP_AFTER`.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        if let Some(v) = env_usize("FLUREE_FEDERATION_JOIN_WORKERS")? {
            config.join_workers = v;
        }
        if let Some(v) = env_usize("FLUREE_FEDERATION_QUEUE_CAPACITY")? {
            config.queue_capacity = v;
        }
        if let Some(v) = env_usize("FLUREE_FEDERATION_BOUND_JOIN_INITIAL_BLOCK")? {
            config.bound_join_initial_block = v;
        }
        if let Some(v) = env_usize("FLUREE_FEDERATION_BOUND_JOIN_BLOCK_SIZE")? {
            config.bound_join_block_size = v;
        }
        if let Some(v) = env_usize("FLUREE_FEDERATION_BOUND_JOIN_RAMP_AFTER")? {
            config.bound_join_ramp_after = v;
        }
        config.validate()?;
        Ok(config)
    }

    /// Set worker threads per join cursor
    pub fn with_join_workers(mut self, workers: usize) -> Self {
        self.join_workers = workers;
        self
    }

    /// Set queue capacity
    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity;
        self
    }

    /// Set bound join block sizes and ramp threshold
    pub fn with_bound_join_blocks(mut self, initial: usize, ramped: usize, ramp_after: usize) -> Self {
        self.bound_join_initial_block = initial;
        self.bound_join_block_size = ramped;
        self.bound_join_ramp_after = ramp_after;
        self
    }

    pub fn with_thread_name_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.thread_name_prefix = prefix.into();
        self
    }

    /// Reject sizes that would deadlock or never make progress
    pub fn validate(&self) -> Result<()> {
        let checks = [
            ("join_workers", self.join_workers),
            ("queue_capacity", self.queue_capacity),
            ("bound_join_initial_block", self.bound_join_initial_block),
            ("bound_join_block_size", self.bound_join_block_size),
        ];
        for (name, value) in checks {
            if value == 0 {
                return Err(FederationError::InvalidConfig(format!(
                    "{} must be at least 1",
                    name
                )));
            }
        }
        Ok(())
    }

    /// Bound join block size after `processed` bindings
    pub fn bound_join_block_for(&self, processed: usize) -> usize {
        if processed > self.bound_join_ramp_after {
            self.bound_join_block_size
        } else {
            self.bound_join_initial_block
        }
    }

    pub(crate) fn thread_name(&self, role: &str) -> String {
        format!("{}-{}", self.thread_name_prefix, role)
    }
}

fn env_usize(name: &str) -> Result<Option<usize>> {
    match env::var(name) {
        Ok(raw) => raw.trim().parse::<usize>().map(Some).map_err(|e| {
            FederationError::InvalidConfig(format!("{}={:?}: {}", name, raw, e))
        }),
        Err(env::VarError::NotPresent) => Ok(None),
        Err(e) => Err(FederationError::InvalidConfig(format!("{}: {}", name, e))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = FederationConfig::default();
        assert_eq!(config.join_workers, 40);
        assert_eq!(config.queue_capacity, 1024);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_block_ramp() {
        let config = FederationConfig::default();
        assert_eq!(config.bound_join_block_for(1), 3);
        assert_eq!(config.bound_join_block_for(10), 3);
        assert_eq!(config.bound_join_block_for(11), 10);
    }

    #[test]
    fn test_partial_deserialize_keeps_defaults() {
        let config: FederationConfig =
            serde_json::from_str(r#"{"join_workers": 4, "queue_capacity": 16}"#).unwrap();
        assert_eq!(config.join_workers, 4);
        assert_eq!(config.queue_capacity, 16);
        assert_eq!(config.bound_join_block_size, DEFAULT_BOUND_JOIN_BLOCK_SIZE);
        assert_eq!(config.thread_name_prefix, "fluree-federation");
    }

    #[test]
    fn test_validate_rejects_zero_workers() {
        let config = FederationConfig::default().with_join_workers(0);
        assert!(matches!(
            config.validate(),
            Err(FederationError::InvalidConfig(_))
        ));
    }
}
