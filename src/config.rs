//! Recognized configuration options (spec §6) with their documented
//! defaults. Loading this from a file/CLI is an external collaborator;
//! this module only owns the struct, its defaults, and cross-field
//! validation.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};
use crate::memory_budget::AGENT_GLOBAL_WRITER_PERMIT;

fn default_instance_limit() -> usize {
    50
}

fn default_batch_flush_interval_ms() -> u64 {
    1000
}

fn default_save_offset_interval_ms() -> u64 {
    1000
}

fn default_core_thread_sleep_secs() -> u64 {
    1
}

fn default_check_finish_at_least_count() -> u32 {
    5
}

fn default_instance_db_clean_interval_ms() -> u64 {
    10_000
}

fn default_db_instance_expire_cycle_count() -> u32 {
    3
}

fn default_agent_global_writer_permit() -> u64 {
    100 * 1024 * 1024
}

fn default_action_bus_capacity() -> usize {
    100
}

fn default_clean_instance_once_limit() -> usize {
    10
}

fn default_shutdown_grace_ms() -> u64 {
    5_000
}

/// Engine-wide configuration, shared by every `InstanceManager`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub instance_limit: usize,
    pub batch_flush_interval_ms: u64,
    pub save_offset_interval_ms: u64,
    pub core_thread_sleep_secs: u64,
    pub check_finish_at_least_count: u32,
    pub instance_db_clean_interval_ms: u64,
    pub db_instance_expire_cycle_count: u32,
    pub agent_global_writer_permit: u64,
    pub action_bus_capacity: usize,
    pub clean_instance_once_limit: usize,
    pub field_splitter: String,
    /// How long `SinkPipeline::shutdown` waits for the flusher to exit on
    /// its own before abandoning whatever batch it is retrying (spec §4.5:
    /// "if the transport is destroyed, in-flight batches are abandoned").
    pub shutdown_grace_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            instance_limit: default_instance_limit(),
            batch_flush_interval_ms: default_batch_flush_interval_ms(),
            save_offset_interval_ms: default_save_offset_interval_ms(),
            core_thread_sleep_secs: default_core_thread_sleep_secs(),
            check_finish_at_least_count: default_check_finish_at_least_count(),
            instance_db_clean_interval_ms: default_instance_db_clean_interval_ms(),
            db_instance_expire_cycle_count: default_db_instance_expire_cycle_count(),
            agent_global_writer_permit: default_agent_global_writer_permit(),
            action_bus_capacity: default_action_bus_capacity(),
            clean_instance_once_limit: default_clean_instance_once_limit(),
            field_splitter: String::new(),
            shutdown_grace_ms: default_shutdown_grace_ms(),
        }
    }
}

impl EngineConfig {
    pub fn validate(&self) -> Result<()> {
        if self.instance_limit == 0 {
            return Err(EngineError::Fatal {
                reason: "instance_limit must be > 0".into(),
            });
        }
        if self.action_bus_capacity == 0 {
            return Err(EngineError::Fatal {
                reason: "action_bus_capacity must be > 0".into(),
            });
        }
        Ok(())
    }

    pub fn batch_flush_interval(&self) -> Duration {
        Duration::from_millis(self.batch_flush_interval_ms)
    }

    pub fn save_offset_interval(&self) -> Duration {
        Duration::from_millis(self.save_offset_interval_ms)
    }

    pub fn core_thread_sleep(&self) -> Duration {
        Duration::from_secs(self.core_thread_sleep_secs)
    }

    pub fn instance_db_clean_interval(&self) -> Duration {
        Duration::from_millis(self.instance_db_clean_interval_ms)
    }

    pub fn writer_permit_pool(&self) -> &'static str {
        AGENT_GLOBAL_WRITER_PERMIT
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }
}
