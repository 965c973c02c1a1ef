//! Strategies for waiting until an execution reaches a terminal state.

use std::time::Duration;

use async_trait::async_trait;
use relay_core::{Execution, ExecutionId};
use tokio::time::Instant;

use crate::error::{ExecutionError, Result};
use crate::scheduler::TaskScheduler;

/// Waits for an execution to finish.
#[async_trait]
pub trait CompletionWaiter: Send + Sync {
    /// Resolve with the terminal execution, or fail with
    /// [`ExecutionError::AdmissionTimeout`] after `timeout`.
    async fn wait_for_terminal(&self, execution_id: ExecutionId, timeout: Duration) -> Result<Execution>;
}

/// Push-based: subscribes to the execution's status channel.
#[async_trait]
impl CompletionWaiter for TaskScheduler {
    async fn wait_for_terminal(&self, execution_id: ExecutionId, timeout: Duration) -> Result<Execution> {
        TaskScheduler::wait_for_terminal(self, execution_id, timeout).await
    }
}

/// Poll-based: re-reads the execution status at a fixed interval.
pub struct PollingWaiter {
    scheduler: TaskScheduler,
    interval: Duration,
}

impl PollingWaiter {
    /// Poll `scheduler` every `interval`.
    pub fn new(scheduler: TaskScheduler, interval: Duration) -> Self {
        Self { scheduler, interval }
    }
}

#[async_trait]
impl CompletionWaiter for PollingWaiter {
    async fn wait_for_terminal(&self, execution_id: ExecutionId, timeout: Duration) -> Result<Execution> {
        let start = Instant::now();

        loop {
            let execution = self.scheduler.get_task_status(execution_id).await?;
            if execution.is_terminal() {
                return Ok(execution);
            }
            if start.elapsed() >= timeout {
                return Err(ExecutionError::AdmissionTimeout {
                    id: execution_id.to_string(),
                    timeout,
                });
            }
            tokio::time::sleep(self.interval.min(timeout.saturating_sub(start.elapsed()))).await;
        }
    }
}
