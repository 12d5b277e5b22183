//! Coordinator configuration

use crate::error::{CoordinatorError, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// What to do when commit fails on a write conflict.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ConflictPolicy {
    /// Roll back and surface the conflict to the caller
    #[default]
    Abort,
    /// Roll back, take a fresh start timestamp and commit again
    Retry { max_attempts: u32 },
}

/// Tunables of the transaction coordinator.
///
/// Every field has a default, so a partial JSON document is a valid config.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    /// Identifier of this coordinator; embedded in transaction ids and used
    /// as the node hosting job roots
    pub server_id: u64,

    /// Lock TTL attached to pre-writes and pessimistic locks
    pub lock_ttl_ms: u64,

    /// How long a pessimistic lock request waits on a conflicting lock
    pub lock_wait_timeout_ms: u64,

    /// Interval between primary lock heartbeats
    pub heartbeat_interval_ms: u64,

    pub enable_one_pc: bool,
    pub one_pc_max_keys: usize,
    pub one_pc_max_bytes: usize,

    pub enable_async_commit: bool,
    /// Upper bound on secondary keys for async commit
    pub async_commit_max_keys: usize,
    /// Upper bound on primary plus secondary key bytes for async commit
    pub async_commit_max_bytes: usize,

    /// Re-resolutions allowed per partition call after region splits
    pub region_retry_limit: usize,

    /// Commit timestamp refreshes allowed for the primary commit
    pub commit_ts_retry_limit: usize,

    pub conflict_policy: ConflictPolicy,

    /// Rows per batch emitted by partition sources
    pub scan_batch_size: usize,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            server_id: 1,
            lock_ttl_ms: 3000,
            lock_wait_timeout_ms: 1000,
            heartbeat_interval_ms: 1500,
            enable_one_pc: true,
            one_pc_max_keys: 64,
            one_pc_max_bytes: 16 * 1024,
            enable_async_commit: true,
            async_commit_max_keys: 256,
            async_commit_max_bytes: 5120,
            region_retry_limit: 8,
            commit_ts_retry_limit: 3,
            conflict_policy: ConflictPolicy::Abort,
            scan_batch_size: 128,
        }
    }
}

impl CoordinatorConfig {
    /// Parse and validate a JSON config
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| CoordinatorError::InvalidConfig(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let positive = [
            ("lock_ttl_ms", self.lock_ttl_ms as usize),
            ("heartbeat_interval_ms", self.heartbeat_interval_ms as usize),
            ("region_retry_limit", self.region_retry_limit),
            ("scan_batch_size", self.scan_batch_size),
        ];
        for (name, value) in positive {
            if value == 0 {
                return Err(CoordinatorError::InvalidConfig(format!(
                    "{name} must be greater than zero"
                )));
            }
        }
        if self.enable_one_pc && (self.one_pc_max_keys == 0 || self.one_pc_max_bytes == 0) {
            return Err(CoordinatorError::InvalidConfig(
                "one-phase commit limits must be greater than zero".to_string(),
            ));
        }
        if let ConflictPolicy::Retry { max_attempts: 0 } = self.conflict_policy {
            return Err(CoordinatorError::InvalidConfig(
                "retry policy needs at least one attempt".to_string(),
            ));
        }
        Ok(())
    }

    pub fn with_server_id(mut self, server_id: u64) -> Self {
        self.server_id = server_id;
        self
    }

    pub fn with_lock_ttl(mut self, ttl: Duration) -> Self {
        self.lock_ttl_ms = ttl.as_millis() as u64;
        self
    }

    pub fn with_lock_wait_timeout(mut self, timeout: Duration) -> Self {
        self.lock_wait_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval_ms = interval.as_millis() as u64;
        self
    }

    pub fn with_one_pc(mut self, enabled: bool) -> Self {
        self.enable_one_pc = enabled;
        self
    }

    pub fn with_async_commit(mut self, enabled: bool) -> Self {
        self.enable_async_commit = enabled;
        self
    }

    pub fn with_conflict_policy(mut self, policy: ConflictPolicy) -> Self {
        self.conflict_policy = policy;
        self
    }

    pub fn with_scan_batch_size(mut self, size: usize) -> Self {
        self.scan_batch_size = size;
        self
    }

    pub fn lock_wait_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_wait_timeout_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }
}
