//! Registry configuration that downstream crates can serialize/deserialize.

use serde::{Deserialize, Serialize};

use crate::error::{Error, ErrorKind, Result};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// Optional cap on queries attached to a single schema node. `None` keeps
    /// the slot table growable.
    pub max_queries_per_node: Option<usize>,

    /// Lower bound for source polling periods; shorter periods are clamped.
    pub min_source_period_ms: u64,

    /// Max jobs the executor drains per wakeup before re-checking for shutdown.
    pub executor_batch_limit: usize,

    /// How long the communication thread waits on the inbound channel per poll.
    pub comm_poll_interval_ms: u64,

    /// Upper bound for any inbound relocatable block.
    pub max_block_bytes: usize,

    /// Address the local side places received blocks at. Inbound blocks are
    /// rebased from the sender's base to this one before use.
    pub block_base: u64,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            max_queries_per_node: None,
            min_source_period_ms: 1,
            executor_batch_limit: 1024,
            comm_poll_interval_ms: 50,
            max_block_bytes: 16 * 1024 * 1024, // 16 MiB
            block_base: 0x1000,
        }
    }
}

/// Partial overrides, as carried by definition files.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfigOverrides {
    pub max_queries_per_node: Option<usize>,
    pub min_source_period_ms: Option<u64>,
    pub executor_batch_limit: Option<usize>,
    pub comm_poll_interval_ms: Option<u64>,
    pub max_block_bytes: Option<usize>,
}

impl RegistryConfig {
    /// Create a config from environment variables, falling back to defaults.
    ///
    /// Environment variables:
    /// - `DMREG_MAX_QUERIES_PER_NODE`: per-node query cap
    /// - `DMREG_MIN_SOURCE_PERIOD_MS`: minimal source period
    /// - `DMREG_EXECUTOR_BATCH_LIMIT`: jobs drained per executor wakeup
    /// - `DMREG_COMM_POLL_MS`: inbound channel poll interval
    /// - `DMREG_MAX_BLOCK_BYTES`: inbound block size limit
    /// - `DMREG_BLOCK_BASE`: local block base address (decimal or `0x` hex)
    pub fn from_env() -> Self {
        let mut cfg = Self::default();

        if let Ok(s) = std::env::var("DMREG_MAX_QUERIES_PER_NODE") {
            if let Ok(v) = s.parse::<usize>() {
                cfg.max_queries_per_node = Some(v);
            }
        }

        if let Ok(s) = std::env::var("DMREG_MIN_SOURCE_PERIOD_MS") {
            if let Ok(v) = s.parse::<u64>() {
                cfg.min_source_period_ms = v;
            }
        }

        if let Ok(s) = std::env::var("DMREG_EXECUTOR_BATCH_LIMIT") {
            if let Ok(v) = s.parse::<usize>() {
                cfg.executor_batch_limit = v.max(1);
            }
        }

        if let Ok(s) = std::env::var("DMREG_COMM_POLL_MS") {
            if let Ok(v) = s.parse::<u64>() {
                cfg.comm_poll_interval_ms = v;
            }
        }

        if let Ok(s) = std::env::var("DMREG_MAX_BLOCK_BYTES") {
            if let Ok(v) = s.parse::<usize>() {
                cfg.max_block_bytes = v;
            }
        }

        if let Ok(s) = std::env::var("DMREG_BLOCK_BASE") {
            let parsed = match s.strip_prefix("0x") {
                Some(hex) => u64::from_str_radix(hex, 16).ok(),
                None => s.parse::<u64>().ok(),
            };
            // zero is the null pointer and cannot be a base
            if let Some(v) = parsed.filter(|v| *v != 0) {
                cfg.block_base = v;
            }
        }

        cfg
    }

    /// Reject values the registry cannot run with.
    pub fn validate(&self) -> Result<()> {
        // zero encodes the null pointer in relocatable blocks
        if self.block_base == 0 {
            return Err(Error::at(ErrorKind::NullArgument, "block_base"));
        }
        if self.max_queries_per_node == Some(0) {
            return Err(Error::at(ErrorKind::Size, "max_queries_per_node"));
        }
        Ok(())
    }

    /// Apply definition-file overrides on top of this config.
    pub fn apply(&mut self, doc: &ConfigOverrides) {
        if let Some(v) = doc.max_queries_per_node {
            self.max_queries_per_node = Some(v);
        }
        if let Some(v) = doc.min_source_period_ms {
            self.min_source_period_ms = v;
        }
        if let Some(v) = doc.executor_batch_limit {
            self.executor_batch_limit = v.max(1);
        }
        if let Some(v) = doc.comm_poll_interval_ms {
            self.comm_poll_interval_ms = v;
        }
        if let Some(v) = doc.max_block_bytes {
            self.max_block_bytes = v;
        }
    }
}
