use std::{fmt, sync::Arc};

use thiserror::Error;

use crate::{
    task::Task,
    task_queue::{TaskQueue, WeakTaskQueue},
};

/// Raised by `TaskQueue::dequeue` when the argument is neither an index, a task nor absent
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("InvalidArgument: argument must either be an index, a task or absent")]
pub struct InvalidArgument;

/// QueueError
/// An error raised while the queue was executing.
///
/// Holds a weak reference to the queue that raised it, so the failing task can
/// still be looked up after the fact. The lookups read the queue's current
/// cursor, which only points at the failing task until the queue is resumed.
#[derive(Error)]
#[error("QueueError: {message}")]
pub struct QueueError<T> {
    message: String,
    queue: WeakTaskQueue<T>,
    data: Option<Arc<anyhow::Error>>,
}

impl<T> QueueError<T> {
    /// An error raised by `queue`, without data
    pub fn new(message: impl Into<String>, queue: &TaskQueue<T>) -> Self {
        Self {
            message: message.into(),
            queue: queue.downgrade(),
            data: None,
        }
    }

    /// Attach the failure that caused this error
    pub fn with_data(mut self, data: anyhow::Error) -> Self {
        self.data = Some(Arc::new(data));
        self
    }

    pub(crate) fn detached(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            queue: WeakTaskQueue::new(),
            data: None,
        }
    }

    /// The message, without the `QueueError: ` prefix
    pub fn message(&self) -> &str {
        &self.message
    }

    /// The original failure, if any
    pub fn data(&self) -> Option<&anyhow::Error> {
        self.data.as_deref()
    }

    /// The queue which raised the error, `None` once it has been dropped
    pub fn queue(&self) -> Option<TaskQueue<T>> {
        self.queue.upgrade()
    }
}

impl<T: Clone + Send + Sync + 'static> QueueError<T> {
    /// Index of the failed task, read from the queue's current cursor
    pub async fn failed_task_index(&self) -> Option<usize> {
        self.queue()?.current_task_index().await
    }

    /// The failed task, read from the queue's current cursor
    pub async fn failed_task(&self) -> Option<Task<T>> {
        self.queue()?.current_running_task().await
    }
}

impl<T> Clone for QueueError<T> {
    fn clone(&self) -> Self {
        Self {
            message: self.message.clone(),
            queue: self.queue.clone(),
            data: self.data.clone(),
        }
    }
}

impl<T> fmt::Debug for QueueError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueueError")
            .field("message", &self.message)
            .field("data", &self.data)
            .finish_non_exhaustive()
    }
}

/// Renders the error together with its data, e.g. `QueueError: <message> (<data>)`
pub struct Detailed<'a, T>(&'a QueueError<T>);

impl<T> QueueError<T> {
    /// Display adapter which includes the data
    pub fn detailed(&self) -> Detailed<'_, T> {
        Detailed(self)
    }
}

impl<T> fmt::Display for Detailed<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)?;
        if let Some(data) = &self.0.data {
            write!(f, " ({:#})", data)?;
        }
        Ok(())
    }
}
