// Scheduler and backend configuration. Every field has a serde default so a
// definition file only needs to name the settings it overrides.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{PipeflowError, Result};

// ── Scheduler ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Bounded wait on the completion queue before the scheduler looks at
    /// deferred sessions again. Default: 50 ms.
    pub completion_wait_ms: u64,

    /// How long a node may wait for an execution slot before the session is
    /// deferred. Default: 1 ms.
    pub slot_acquire_timeout_ms: u64,

    /// Hard ceiling on the number of shards a single demultiplexer may
    /// produce. Default: 10 000.
    pub max_demultiply_shards: usize,

    /// Pause between disarm attempts while draining. Default: 1 ms.
    pub disarm_backoff_ms: u64,

    /// Worker threads dedicated to custom node `execute` calls.
    /// 0 runs plugins inline on the scheduler thread. Default: 0.
    pub custom_node_workers: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            completion_wait_ms: 50,
            slot_acquire_timeout_ms: 1,
            max_demultiply_shards: 10_000,
            disarm_backoff_ms: 1,
            custom_node_workers: 0,
        }
    }
}

impl SchedulerConfig {
    pub fn completion_wait(&self) -> Duration {
        Duration::from_millis(self.completion_wait_ms)
    }

    pub fn slot_acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.slot_acquire_timeout_ms)
    }

    pub fn disarm_backoff(&self) -> Duration {
        Duration::from_millis(self.disarm_backoff_ms)
    }

    /// Reject settings under which no request could complete.
    pub fn validate(&self) -> Result<()> {
        if self.completion_wait_ms == 0 {
            return Err(PipeflowError::Config("completion_wait_ms must be positive".into()));
        }
        if self.max_demultiply_shards == 0 {
            return Err(PipeflowError::Config("max_demultiply_shards must be positive".into()));
        }
        Ok(())
    }
}

// ── Backend ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    /// Concurrent inference slots per model. Default: 1.
    pub execution_slots: usize,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self { execution_slots: 1 }
    }
}
