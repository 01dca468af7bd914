use std::time::Duration;

use anyhow::{bail, Result};
use async_queue_core::{Runnable, TaskId};
use serde::{Deserialize, Serialize};
use slog::{debug, Logger};

/// State that is injected into every sleep task
#[derive(Debug, Clone)]
pub struct RunnableState {
    logger: Logger,
}

impl RunnableState {
    pub fn new(logger: &Logger) -> Self {
        RunnableState {
            logger: logger.clone(),
        }
    }
}

/// Output of a sleep task
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskReport {
    pub position: usize,
    pub task_id: TaskId,
    pub duration_ms: u64,
}

/// SleepTask
/// Waits for a fixed duration, then reports back. Fails instead when told to.
#[derive(Debug, Clone)]
pub struct SleepTask {
    id: TaskId,
    position: usize,
    duration: Duration,
    fails: bool,
}

impl SleepTask {
    pub fn new(position: usize, duration: Duration) -> Self {
        Self {
            id: format!("sleep-{}", position),
            position,
            duration,
            fails: false,
        }
    }

    pub fn failing(mut self, fails: bool) -> Self {
        self.fails = fails;
        self
    }
}

impl Runnable<TaskReport, RunnableState> for SleepTask {
    fn id(&self) -> TaskId {
        self.id.clone()
    }

    async fn run(&self, state: RunnableState) -> Result<TaskReport> {
        debug!(state.logger, "sleeping"; "task_id" => self.id.as_str(), "duration_ms" => self.duration.as_millis() as u64);
        tokio::time::sleep(self.duration).await;
        if self.fails {
            bail!("task at position {} was configured to fail", self.position);
        }
        Ok(TaskReport {
            position: self.position,
            task_id: self.id.clone(),
            duration_ms: self.duration.as_millis() as u64,
        })
    }
}
