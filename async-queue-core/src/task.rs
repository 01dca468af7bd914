use std::{fmt, future::Future, pin::Pin, sync::Arc};

use anyhow::Result;

pub type TaskId = String;

/// The boxed future a task produces each time it is invoked
pub type TaskFuture<T> = Pin<Box<dyn Future<Output = Result<T>> + Send>>;

type TaskHandler<T> = Arc<dyn Fn() -> TaskFuture<T> + Send + Sync>;

/// A unit of work that can be adapted into a queue task
pub trait Runnable<RunnableOutput, RunnableState> {
    /// an identifier for the task, used in logs and error messages
    fn id(&self) -> TaskId;

    /// run the task given the state it needs
    fn run(
        &self,
        state: RunnableState,
    ) -> impl std::future::Future<Output = Result<RunnableOutput>> + Send;
}

/// Task
/// A zero-argument deferred operation held by the task queue.
///
/// Cloning a task shares its identity: two clones compare equal, while two tasks
/// built from identical closures do not.
pub struct Task<T> {
    id: TaskId,
    handler: TaskHandler<T>,
}

impl<T: Send + 'static> Task<T> {
    /// Wrap a closure returning a future
    pub fn new<F, Fut>(handler: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        Self::with_id(nanoid::nanoid!(), handler)
    }

    /// Wrap a closure under an explicit id
    pub fn with_id<F, Fut>(id: impl Into<TaskId>, handler: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        Self {
            id: id.into(),
            handler: Arc::new(move || -> TaskFuture<T> { Box::pin(handler()) }),
        }
    }

    /// Adapt a runnable, handing it a clone of `state` on every invocation
    pub fn from_runnable<R, S>(runnable: R, state: S) -> Self
    where
        R: Runnable<T, S> + Send + Sync + 'static,
        S: Clone + Send + Sync + 'static,
    {
        let id = runnable.id();
        let runnable = Arc::new(runnable);
        Self::with_id(id, move || {
            let runnable = runnable.clone();
            let state = state.clone();
            async move { runnable.run(state).await }
        })
    }
}

impl<T> Task<T> {
    pub fn id(&self) -> &TaskId {
        &self.id
    }

    /// Invoke the task, the returned future does nothing until polled
    pub fn call(&self) -> TaskFuture<T> {
        (self.handler)()
    }

    /// `true` if both handles point at the same task instance
    pub fn same(&self, other: &Task<T>) -> bool {
        std::ptr::addr_eq(Arc::as_ptr(&self.handler), Arc::as_ptr(&other.handler))
    }
}

impl<T> Clone for Task<T> {
    fn clone(&self) -> Self {
        Self {
            id: self.id.clone(),
            handler: self.handler.clone(),
        }
    }
}

impl<T> PartialEq for Task<T> {
    fn eq(&self, other: &Self) -> bool {
        self.same(other)
    }
}

impl<T> Eq for Task<T> {}

impl<T> fmt::Debug for Task<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task").field("id", &self.id).finish()
    }
}

impl<T> fmt::Display for Task<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task({})", self.id)
    }
}
