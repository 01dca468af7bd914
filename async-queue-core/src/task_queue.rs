use std::{
    any::Any,
    sync::{Arc, Weak},
};

use serde::{Deserialize, Serialize};
use slog::{debug, error, info, warn, Logger};
use tokio::sync::{watch, RwLock};

use crate::{
    error::{InvalidArgument, QueueError},
    task::Task,
};

/// What a run settles to: the ordered results, or the error that halted it
pub type RunOutcome<T> = Result<Vec<T>, QueueError<T>>;

/// Run-state of a queue as seen from outside the run loop
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Idle,
    Running,
    /// Halted before the task under the cursor, either by `pause` or by a failure
    Paused,
}

/// A point-in-time view of the queue
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStatus {
    pub state: RunState,
    /// Same as `current_task_index`
    pub cursor: Option<usize>,
    pub length: usize,
    /// Number of results collected by the current or most recent run
    pub completed: usize,
}

/// RunHandle
/// An awaitable view of a single run of the queue. Clones observe the same run.
pub struct RunHandle<T> {
    outcome: watch::Receiver<Option<RunOutcome<T>>>,
}

impl<T: Clone> RunHandle<T> {
    fn resolved(outcome: RunOutcome<T>) -> Self {
        let (_, outcome) = watch::channel(Some(outcome));
        Self { outcome }
    }

    /// `true` once the run has completed, paused or failed
    pub fn is_settled(&self) -> bool {
        self.outcome.borrow().is_some() || self.outcome.has_changed().is_err()
    }

    /// `true` if both handles observe the same run
    pub fn same(&self, other: &RunHandle<T>) -> bool {
        self.outcome.same_channel(&other.outcome)
    }

    /// Wait for the run to settle
    pub async fn wait(mut self) -> RunOutcome<T> {
        let outcome: Option<RunOutcome<T>> = match self.outcome.wait_for(Option::is_some).await {
            Ok(outcome) => (*outcome).clone(),
            Err(_) => None,
        };
        outcome.unwrap_or_else(|| Err(QueueError::detached("Queue run ended before settling")))
    }
}

impl<T> Clone for RunHandle<T> {
    fn clone(&self) -> Self {
        Self {
            outcome: self.outcome.clone(),
        }
    }
}

impl<T> std::fmt::Debug for RunHandle<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunHandle")
            .field("settled", &self.outcome.borrow().is_some())
            .finish()
    }
}

enum Step<T> {
    Run(Task<T>),
    Paused,
    Exhausted,
}

struct QueueState<T> {
    /// Tasks, read live by the run loop
    tasks: Vec<Task<T>>,

    /// Cleared by `pause`, checked by the run loop before each task
    running: bool,

    /// Cursor, the next task to execute or the task that failed
    index: Option<usize>,

    /// Results of the current or most recent run
    results: Vec<T>,

    /// The current or most recent run
    last_run: Option<RunHandle<T>>,

    /// Bumped on every launch and clear, a run loop with an older generation is stale
    generation: u64,
}

impl<T: Clone> QueueState<T> {
    fn advance(&mut self, position: usize) -> Step<T> {
        if position >= self.tasks.len() {
            self.running = false;
            self.index = Some(self.tasks.len());
            return Step::Exhausted;
        }

        self.index = Some(position);
        if !self.running {
            return Step::Paused;
        }
        Step::Run(self.tasks[position].clone())
    }

    fn remove_at(&mut self, index: usize) -> Option<Task<T>> {
        if index >= self.tasks.len() {
            return None;
        }
        if index == self.tasks.len() - 1 {
            return self.tasks.pop();
        }
        Some(self.tasks.remove(index))
    }

    fn run_state(&self) -> RunState {
        match self.index {
            _ if self.running => RunState::Running,
            Some(index) if index < self.tasks.len() => RunState::Paused,
            _ => RunState::Idle,
        }
    }
}

enum Selector<T> {
    Index(Option<usize>),
    Task(Task<T>),
    Last,
}

macro_rules! downcast_index {
    ($arg:expr, $($ty:ty),+) => {
        $(
            if let Some(index) = $arg.downcast_ref::<$ty>() {
                return Ok(Selector::Index(usize::try_from(*index).ok()));
            }
        )+
    };
}

impl<T: Send + 'static> Selector<T> {
    fn parse(arg: Option<&(dyn Any + Send + Sync)>) -> Result<Self, InvalidArgument> {
        let Some(arg) = arg else {
            return Ok(Selector::Last);
        };
        if let Some(task) = arg.downcast_ref::<Task<T>>() {
            return Ok(Selector::Task(task.clone()));
        }
        downcast_index!(arg, usize, u8, u16, u32, u64, isize, i8, i16, i32, i64);
        Err(InvalidArgument)
    }
}

/// TaskQueue
/// Runs an ordered list of async tasks one at a time, collecting their results.
///
/// Execution can be paused between tasks and resumed from the same place. A failing
/// task halts the run at its position and surfaces a `QueueError`, keeping the results
/// collected so far. The queue is a cheap handle, clones share the same state.
pub struct TaskQueue<T> {
    logger: Logger,
    inner: Arc<RwLock<QueueState<T>>>,
}

/// A non-owning reference to a `TaskQueue`
pub struct WeakTaskQueue<T> {
    logger: Logger,
    inner: Weak<RwLock<QueueState<T>>>,
}

impl<T> WeakTaskQueue<T> {
    pub(crate) fn new() -> Self {
        Self {
            logger: Logger::root(slog::Discard, slog::o!()),
            inner: Weak::new(),
        }
    }

    /// The queue, if it is still alive
    pub fn upgrade(&self) -> Option<TaskQueue<T>> {
        Some(TaskQueue {
            logger: self.logger.clone(),
            inner: self.inner.upgrade()?,
        })
    }
}

impl<T> Clone for WeakTaskQueue<T> {
    fn clone(&self) -> Self {
        Self {
            logger: self.logger.clone(),
            inner: self.inner.clone(),
        }
    }
}

impl<T> Clone for TaskQueue<T> {
    fn clone(&self) -> Self {
        Self {
            logger: self.logger.clone(),
            inner: self.inner.clone(),
        }
    }
}

impl<T> std::fmt::Debug for TaskQueue<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskQueue").finish_non_exhaustive()
    }
}

impl<T> TaskQueue<T> {
    /// An empty queue
    pub fn new(logger: &Logger) -> Self {
        Self::with_tasks(logger, vec![])
    }

    /// A queue holding `tasks` in order
    pub fn with_tasks(logger: &Logger, tasks: Vec<Task<T>>) -> Self {
        Self {
            logger: logger.clone(),
            inner: Arc::new(RwLock::new(QueueState {
                tasks,
                running: false,
                index: None,
                results: vec![],
                last_run: None,
                generation: 0,
            })),
        }
    }

    /// A reference that does not keep the queue alive
    pub fn downgrade(&self) -> WeakTaskQueue<T> {
        WeakTaskQueue {
            logger: self.logger.clone(),
            inner: Arc::downgrade(&self.inner),
        }
    }
}

impl<T: Clone + Send + Sync + 'static> TaskQueue<T> {
    /// Append tasks to the end of the queue
    pub async fn enqueue(&self, tasks: impl IntoIterator<Item = Task<T>>) {
        let mut state = self.inner.write().await;
        state.tasks.extend(tasks);
        debug!(self.logger, "enqueued tasks"; "length" => state.tasks.len());
    }

    /// Append a single task
    pub async fn enqueue_one(&self, task: Task<T>) {
        self.enqueue([task]).await
    }

    /// Remove a task selected by an index of any integer type, by a task reference, or
    /// the last task when `arg` is `None`
    pub async fn dequeue(
        &self,
        arg: Option<&(dyn Any + Send + Sync)>,
    ) -> Result<Option<Task<T>>, InvalidArgument> {
        let removed = match Selector::<T>::parse(arg)? {
            Selector::Index(Some(index)) => self.dequeue_at(index).await,
            Selector::Index(None) => None,
            Selector::Task(task) => self.dequeue_task(Some(&task)).await,
            Selector::Last => self.pop().await,
        };
        Ok(removed)
    }

    /// Remove the task at `index`, `None` if out of bounds
    pub async fn dequeue_at(&self, index: usize) -> Option<Task<T>> {
        self.inner.write().await.remove_at(index)
    }

    /// Remove the first occurrence of `task`, or the last task when `task` is `None`
    pub async fn dequeue_task(&self, task: Option<&Task<T>>) -> Option<Task<T>> {
        let mut state = self.inner.write().await;
        let Some(task) = task else {
            return state.tasks.pop();
        };
        let index = state.tasks.iter().position(|t| t.same(task))?;
        state.remove_at(index)
    }

    /// Remove the last task
    pub async fn pop(&self) -> Option<Task<T>> {
        self.dequeue_task(None).await
    }

    /// The last added task, without removing it
    pub async fn peek(&self) -> Option<Task<T>> {
        self.inner.read().await.tasks.last().cloned()
    }

    /// Alias of `peek`
    pub async fn last(&self) -> Option<Task<T>> {
        self.peek().await
    }

    /// Number of tasks in the queue
    pub async fn len(&self) -> usize {
        self.inner.read().await.tasks.len()
    }

    /// `true` if the queue holds no tasks
    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.tasks.is_empty()
    }

    /// Empty the queue and forget the current run.
    ///
    /// A task already in flight is not cancelled, its outcome is discarded once it
    /// settles. Await `pause` first to let it land in the results.
    pub async fn clear(&self) {
        let mut state = self.inner.write().await;
        if state.running {
            warn!(self.logger, "clearing a running queue, the task in flight will be discarded";
                "position" => state.index);
        }
        state.generation += 1;
        state.tasks.clear();
        state.running = false;
        state.index = None;
        state.results.clear();
        state.last_run = None;
        info!(self.logger, "cleared queue");
    }

    /// Start executing from the first task.
    ///
    /// Returns the run in flight instead if there is one.
    pub async fn start(&self) -> RunHandle<T> {
        let mut state = self.inner.write().await;
        if let Some(run) = state.last_run.as_ref().filter(|run| !run.is_settled()) {
            debug!(self.logger, "queue already running");
            return run.clone();
        }
        info!(self.logger, "starting queue"; "length" => state.tasks.len());
        self.launch_from(&mut state, 0, vec![])
    }

    /// Stop after the task in flight completes.
    ///
    /// The returned handle settles once the run loop reaches its next check.
    pub async fn pause(&self) -> RunHandle<T> {
        let mut state = self.inner.write().await;
        state.running = false;
        debug!(self.logger, "pausing queue"; "position" => state.index);
        state
            .last_run
            .clone()
            .unwrap_or_else(|| RunHandle::resolved(Ok(vec![])))
    }

    /// Continue from the cursor, keeping the results collected so far.
    ///
    /// Waits for a run still in flight to settle first. A queue which was not paused
    /// continues from wherever its cursor was left. After a completed run the cursor
    /// sits past the last task, so only tasks enqueued since then run; the last task
    /// is not run again.
    pub async fn resume(&self) -> RunHandle<T> {
        loop {
            let in_flight = {
                let mut state = self.inner.write().await;
                match state.last_run.clone().filter(|run| !run.is_settled()) {
                    Some(run) => run,
                    None => {
                        let from = state.index.unwrap_or(0);
                        let results = state.results.clone();
                        info!(self.logger, "resuming queue";
                            "position" => from, "completed" => results.len());
                        return self.launch_from(&mut state, from, results);
                    }
                }
            };
            debug!(self.logger, "waiting for the run in flight before resuming");
            let _ = in_flight.wait().await;
        }
    }

    /// Pause, wait for the run to settle, then clear the queue.
    ///
    /// Returns `None` if there was no run to stop.
    pub async fn stop(&self) -> Result<Option<Vec<T>>, QueueError<T>> {
        let run = {
            let mut state = self.inner.write().await;
            state.running = false;
            state.last_run.clone()
        };
        let outcome = match run {
            Some(run) => Some(run.wait().await),
            None => {
                debug!(self.logger, "queue already stopped");
                None
            }
        };
        self.clear().await;
        outcome.transpose()
    }

    /// `true` while a run is executing tasks
    pub async fn is_running(&self) -> bool {
        self.inner.read().await.running
    }

    /// Index of the task running, or where the queue paused or failed
    pub async fn current_task_index(&self) -> Option<usize> {
        self.inner.read().await.index
    }

    /// The task under the cursor
    pub async fn current_running_task(&self) -> Option<Task<T>> {
        let state = self.inner.read().await;
        state.index.and_then(|index| state.tasks.get(index).cloned())
    }

    /// Results of the current or most recent run
    pub async fn last_results(&self) -> Vec<T> {
        self.inner.read().await.results.clone()
    }

    /// Handle of the current or most recent run, `None` after `clear` or `stop`
    pub async fn last_run(&self) -> Option<RunHandle<T>> {
        self.inner.read().await.last_run.clone()
    }

    /// Snapshot of the run-state, cursor and counts
    pub async fn status(&self) -> QueueStatus {
        let state = self.inner.read().await;
        QueueStatus {
            state: state.run_state(),
            cursor: state.index,
            length: state.tasks.len(),
            completed: state.results.len(),
        }
    }

    fn launch_from(&self, state: &mut QueueState<T>, from: usize, results: Vec<T>) -> RunHandle<T> {
        state.generation += 1;
        state.running = true;
        state.results = results.clone();

        let run = match state.advance(from) {
            Step::Run(task) => {
                let (settle, outcome) = watch::channel(None);
                let queue = self.clone();
                let generation = state.generation;
                tokio::spawn(async move {
                    queue.drive(generation, from, results, task, settle).await;
                });
                RunHandle { outcome }
            }
            Step::Paused | Step::Exhausted => {
                debug!(self.logger, "nothing to run"; "position" => from);
                RunHandle::resolved(Ok(results))
            }
        };
        state.last_run = Some(run.clone());
        run
    }

    /// The run loop. Settles the run while still holding the state lock so that a
    /// settled handle always agrees with the state.
    async fn drive(
        self,
        generation: u64,
        mut position: usize,
        mut results: Vec<T>,
        mut task: Task<T>,
        settle: watch::Sender<Option<RunOutcome<T>>>,
    ) {
        loop {
            debug!(self.logger, "running task"; "position" => position, "task_id" => task.id().as_str());
            let outcome = match tokio::spawn(task.call()).await {
                Ok(outcome) => outcome,
                Err(e) => Err(panic_error(e)),
            };

            let mut state = self.inner.write().await;
            let settled = if state.generation != generation {
                warn!(self.logger, "queue was cleared while a task was running, discarding its outcome";
                    "task_id" => task.id().as_str());
                Some(match outcome {
                    Ok(_) => Ok(std::mem::take(&mut results)),
                    Err(e) => Err(self.task_failed(position, &task, e)),
                })
            } else {
                match outcome {
                    Ok(value) => {
                        state.results.push(value.clone());
                        results.push(value);
                        position += 1;
                        match state.advance(position) {
                            Step::Run(next) => {
                                task = next;
                                None
                            }
                            Step::Paused => {
                                info!(self.logger, "queue paused";
                                    "position" => position, "completed" => results.len());
                                Some(Ok(std::mem::take(&mut results)))
                            }
                            Step::Exhausted => {
                                info!(self.logger, "queue finished"; "completed" => results.len());
                                Some(Ok(std::mem::take(&mut results)))
                            }
                        }
                    }
                    Err(e) => {
                        state.running = false;
                        state.index = Some(position);
                        error!(self.logger, "task failed, queue paused";
                            "position" => position,
                            "task_id" => task.id().as_str(),
                            "error" => format!("{:#}", e));
                        Some(Err(self.task_failed(position, &task, e)))
                    }
                }
            };

            if let Some(outcome) = settled {
                settle.send_replace(Some(outcome));
                return;
            }
        }
    }

    fn task_failed(&self, position: usize, task: &Task<T>, error: anyhow::Error) -> QueueError<T> {
        QueueError::new(
            format!(
                "Queue paused at task #{} due to error in handler {}",
                position + 1,
                task
            ),
            self,
        )
        .with_data(error)
    }
}

/// Turns a task that panicked or was cancelled into an ordinary task failure
fn panic_error(error: tokio::task::JoinError) -> anyhow::Error {
    if !error.is_panic() {
        return anyhow::anyhow!("task was cancelled: {}", error);
    }
    let payload = error.into_panic();
    let message = payload
        .downcast_ref::<&str>()
        .map(|message| message.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic payload".to_string());
    anyhow::anyhow!("task panicked: {}", message)
}

#[cfg(test)]
mod tests {
    use std::{
        sync::atomic::{AtomicUsize, Ordering},
        time::Duration,
    };

    use super::*;

    const MIN_LENGTH: usize = 2;

    fn logger() -> Logger {
        Logger::root(slog::Discard, slog::o!())
    }

    fn instant(value: u32) -> Task<u32> {
        Task::new(move || async move { Ok(value) })
    }

    fn delayed(value: u32) -> Task<u32> {
        Task::new(move || async move {
            tokio::time::sleep(Duration::from_millis(500)).await;
            Ok(value)
        })
    }

    fn failing(message: &'static str) -> Task<u32> {
        Task::new(move || async move { Err::<u32, _>(anyhow::anyhow!(message)) })
    }

    fn counted(value: u32, calls: Arc<AtomicUsize>) -> Task<u32> {
        Task::new(move || {
            let calls = calls.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(100)).await;
                Ok(value)
            }
        })
    }

    fn queue() -> TaskQueue<u32> {
        TaskQueue::with_tasks(&logger(), vec![delayed(1), delayed(2)])
    }

    #[tokio::test]
    async fn test_initializes_empty_by_default() {
        let queue = TaskQueue::<u32>::new(&logger());
        assert_eq!(queue.len().await, 0);
        assert!(queue.is_empty().await);
        assert!(!queue.is_running().await);
        assert_eq!(queue.current_task_index().await, None);
        assert!(queue.last_run().await.is_none());
    }

    #[tokio::test]
    async fn test_enqueues_in_call_order() {
        let queue = queue();
        let (a, b, c) = (instant(3), instant(4), instant(5));

        queue.enqueue_one(a.clone()).await;
        assert_eq!(queue.len().await, MIN_LENGTH + 1);

        queue.enqueue([b.clone(), c.clone()]).await;
        assert_eq!(queue.len().await, MIN_LENGTH + 3);

        assert_eq!(queue.pop().await, Some(c));
        assert_eq!(queue.pop().await, Some(b));
        assert_eq!(queue.pop().await, Some(a));
    }

    #[tokio::test]
    async fn test_peeks_into_empty_queue() {
        assert!(TaskQueue::<u32>::new(&logger()).peek().await.is_none());
    }

    #[tokio::test]
    async fn test_dequeues_last_task_and_peeks() {
        let queue = queue();
        let task = instant(3);
        queue.enqueue_one(task.clone()).await;

        assert_eq!(queue.last().await, Some(task.clone()));
        assert_eq!(queue.peek().await, queue.last().await);
        assert_eq!(queue.len().await, MIN_LENGTH + 1);
        assert_eq!(queue.dequeue(None).await.unwrap(), Some(task));
        assert_eq!(queue.len().await, MIN_LENGTH);
    }

    #[tokio::test]
    async fn test_dequeues_by_reference_not_by_value() {
        let queue = queue();
        let task = instant(3);
        queue.enqueue_one(task.clone()).await;

        assert_eq!(queue.dequeue(Some(&task)).await.unwrap(), Some(task));
        assert_eq!(queue.len().await, MIN_LENGTH);

        queue.enqueue_one(instant(3)).await;
        assert_eq!(queue.dequeue(Some(&instant(3))).await.unwrap(), None);
        assert_eq!(queue.len().await, MIN_LENGTH + 1);
    }

    #[tokio::test]
    async fn test_dequeues_only_the_given_instance() {
        let first = instant(3);
        let second = instant(3);
        let queue = TaskQueue::with_tasks(&logger(), vec![first.clone(), second.clone()]);

        assert_eq!(queue.dequeue_task(Some(&second)).await, Some(second));
        assert_eq!(queue.len().await, 1);
        assert_eq!(queue.peek().await, Some(first));
    }

    #[tokio::test]
    async fn test_dequeues_first_duplicate() {
        let shared = instant(3);
        let other = instant(4);
        let queue = TaskQueue::with_tasks(
            &logger(),
            vec![shared.clone(), other.clone(), shared.clone()],
        );

        assert_eq!(queue.dequeue_task(Some(&shared)).await, Some(shared.clone()));
        assert_eq!(queue.dequeue_at(0).await, Some(other));
        assert_eq!(queue.peek().await, Some(shared));
    }

    #[tokio::test]
    async fn test_dequeues_by_index() {
        let queue = queue();
        let task = instant(3);
        let index = queue.len().await;
        queue.enqueue_one(task.clone()).await;

        assert_eq!(queue.dequeue(Some(&index)).await.unwrap(), Some(task));
        assert_eq!(queue.len().await, MIN_LENGTH);
        assert!(queue.dequeue(Some(&0)).await.unwrap().is_some());
        assert_eq!(queue.len().await, 1);

        // negative or out of bounds indexes remove nothing
        assert_eq!(queue.dequeue(Some(&-1)).await.unwrap(), None);
        assert_eq!(queue.dequeue(Some(&100u64)).await.unwrap(), None);
        assert_eq!(queue.dequeue_at(100).await, None);
        assert_eq!(queue.len().await, 1);
    }

    #[tokio::test]
    async fn test_dequeue_at_last_index_matches_pop() {
        let (a, b) = (instant(1), instant(2));
        let by_index = TaskQueue::with_tasks(&logger(), vec![a.clone(), b.clone()]);
        let by_pop = TaskQueue::with_tasks(&logger(), vec![a, b.clone()]);

        assert_eq!(by_index.dequeue_at(1).await, Some(b.clone()));
        assert_eq!(by_pop.pop().await, Some(b));
        assert_eq!(by_index.peek().await, by_pop.peek().await);
    }

    #[tokio::test]
    async fn test_dequeue_at_max_index_removes_nothing() {
        let queue = queue();

        assert_eq!(queue.dequeue_at(usize::MAX).await, None);
        assert_eq!(queue.dequeue(Some(&u64::MAX)).await.unwrap(), None);
        assert_eq!(queue.dequeue(Some(&usize::MAX)).await.unwrap(), None);
        assert_eq!(queue.len().await, MIN_LENGTH);
    }

    #[tokio::test]
    async fn test_does_not_dequeue_invalid_args() {
        let queue = queue();
        assert_eq!(
            queue.dequeue(Some(&"will not work")).await,
            Err(InvalidArgument)
        );
        assert_eq!(queue.len().await, MIN_LENGTH);
    }

    #[tokio::test(start_paused = true)]
    async fn test_runs_and_finishes_the_queue() {
        let queue = queue();
        assert!(!queue.is_running().await);
        assert!(queue.last_run().await.is_none());

        let run = queue.start().await;
        assert!(queue.is_running().await);
        assert!(run.same(&queue.last_run().await.unwrap()));
        assert!(run.same(&queue.start().await));

        let results = run.wait().await.unwrap();
        assert_eq!(results, vec![1, 2]);
        assert_eq!(results.len(), queue.len().await);
        assert!(!queue.is_running().await);
        assert_eq!(queue.last_results().await, vec![1, 2]);
        assert_eq!(queue.status().await.state, RunState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_after_completion_runs_again() {
        let queue = queue();
        let first = queue.start().await;
        assert_eq!(first.clone().wait().await.unwrap(), vec![1, 2]);

        let second = queue.start().await;
        assert!(!second.same(&first));
        assert_eq!(second.wait().await.unwrap(), vec![1, 2]);
        assert_eq!(queue.last_results().await, vec![1, 2]);
    }

    #[tokio::test]
    async fn test_start_on_empty_queue_resolves_immediately() {
        let queue = TaskQueue::<u32>::new(&logger());
        let run = queue.start().await;
        assert!(run.is_settled());
        assert_eq!(run.wait().await.unwrap(), Vec::<u32>::new());
        assert!(!queue.is_running().await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reads_tasks_appended_during_a_run() {
        let queue = TaskQueue::with_tasks(&logger(), vec![delayed(1)]);
        let run = queue.start().await;
        queue.enqueue_one(delayed(2)).await;

        assert_eq!(run.wait().await.unwrap(), vec![1, 2]);
    }

    async fn assert_fails_and_pauses(queue: &TaskQueue<u32>, failing_task: &Task<u32>) {
        let error = queue.start().await.wait().await.unwrap_err();

        assert_eq!(error.data().unwrap().to_string(), "boom");
        assert!(error.message().contains("task #2"));
        assert!(error.to_string().starts_with("QueueError: "));
        assert!(!queue.is_running().await);
        assert_eq!(queue.current_task_index().await, Some(1));
        assert_eq!(queue.last_results().await, vec![1]);
        assert_eq!(error.failed_task_index().await, Some(1));
        assert_eq!(error.failed_task().await.as_ref(), Some(failing_task));
        assert_eq!(
            error.queue().unwrap().last_results().await,
            queue.last_results().await
        );
        assert_eq!(queue.status().await.state, RunState::Paused);
    }

    #[tokio::test]
    async fn test_fails_with_queue_error_and_pauses() {
        let failing_task = failing("boom");
        let queue = TaskQueue::with_tasks(&logger(), vec![instant(1), failing_task.clone()]);
        assert_fails_and_pauses(&queue, &failing_task).await;
    }

    #[tokio::test]
    async fn test_panicking_task_fails_like_an_error() {
        let panicking = Task::new(|| async {
            if true {
                panic!("kaboom");
            }
            Ok(2u32)
        });
        let queue = TaskQueue::with_tasks(&logger(), vec![instant(1), panicking.clone()]);

        let error = queue.start().await.wait().await.unwrap_err();
        assert!(error.message().contains("task #2"));
        assert_eq!(error.data().unwrap().to_string(), "task panicked: kaboom");
        assert!(error.queue().is_some());
        assert!(!queue.is_running().await);
        assert_eq!(queue.current_task_index().await, Some(1));
        assert_eq!(error.failed_task().await, Some(panicking));
        assert_eq!(queue.last_results().await, vec![1]);
        assert_eq!(queue.status().await.state, RunState::Paused);

        // the queue is still usable once the panicking task is gone
        queue.pop().await;
        queue.enqueue_one(instant(3)).await;
        assert_eq!(queue.resume().await.wait().await.unwrap(), vec![1, 3]);
    }

    #[tokio::test]
    async fn test_resumes_from_the_failed_task() {
        let failing_task = failing("boom");
        let queue = TaskQueue::with_tasks(&logger(), vec![instant(1), failing_task.clone()]);
        assert_fails_and_pauses(&queue, &failing_task).await;

        assert_eq!(queue.pop().await, Some(failing_task));
        queue.enqueue([instant(3), instant(4)]).await;

        assert_eq!(queue.resume().await.wait().await.unwrap(), vec![1, 3, 4]);
        assert!(!queue.is_running().await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pauses_and_resumes() {
        let queue = queue();
        queue.start().await;

        // first task done, second in flight
        tokio::time::sleep(Duration::from_millis(750)).await;
        assert_eq!(queue.current_task_index().await, Some(1));

        let paused = queue.pause().await.wait().await.unwrap();
        assert_eq!(paused, vec![1, 2]);
        assert!(!queue.is_running().await);
        assert_eq!(queue.current_task_index().await, Some(2));

        queue.enqueue([instant(3), instant(4)]).await;
        assert_eq!(queue.status().await.state, RunState::Paused);
        assert_eq!(
            queue.resume().await.wait().await.unwrap(),
            vec![1, 2, 3, 4]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_pause_right_after_start_lets_the_first_task_finish() {
        let queue = queue();
        queue.start().await;

        let paused = queue.pause().await.wait().await.unwrap();
        assert!(queue.last_run().await.is_some());
        assert_eq!(paused, vec![1]);
        assert!(!queue.is_running().await);
        assert_eq!(queue.current_task_index().await, Some(1));
        assert_eq!(queue.last_results().await, vec![1]);

        queue.enqueue([instant(3), instant(4)]).await;
        assert_eq!(
            queue.resume().await.wait().await.unwrap(),
            vec![1, 2, 3, 4]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_resume_while_running_waits_for_the_run() {
        let calls = Arc::new(AtomicUsize::new(0));
        let queue = TaskQueue::with_tasks(
            &logger(),
            vec![counted(1, calls.clone()), counted(2, calls.clone())],
        );

        let run = queue.start().await;
        let resumed = queue.resume().await;
        assert!(run.is_settled());
        assert!(!resumed.same(&run));

        assert_eq!(resumed.wait().await.unwrap(), vec![1, 2]);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_resume_after_completion_runs_only_new_tasks() {
        let calls = Arc::new(AtomicUsize::new(0));
        let queue = TaskQueue::with_tasks(&logger(), vec![counted(1, calls.clone())]);
        assert_eq!(queue.start().await.wait().await.unwrap(), vec![1]);

        queue.enqueue_one(counted(2, calls.clone())).await;
        assert_eq!(queue.resume().await.wait().await.unwrap(), vec![1, 2]);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_pause_without_a_run_resolves_empty() {
        let queue = queue();
        let paused = queue.pause().await;
        assert!(paused.is_settled());
        assert!(paused.wait().await.unwrap().is_empty());
        assert!(queue.last_run().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stops_the_queue_and_gives_results() {
        let queue = queue();
        queue.start().await;

        assert_eq!(queue.stop().await.unwrap(), Some(vec![1]));
        assert!(!queue.is_running().await);
        assert!(queue.last_run().await.is_none());
        assert_eq!(queue.current_task_index().await, None);
        assert!(queue.is_empty().await);

        let queue = TaskQueue::<u32>::new(&logger());
        queue.start().await;
        assert_eq!(queue.stop().await.unwrap(), Some(vec![]));

        // already stopped
        assert_eq!(queue.stop().await.unwrap(), None);
        assert_eq!(queue.stop().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_stop_surfaces_the_failure_and_clears() {
        let queue = TaskQueue::with_tasks(&logger(), vec![instant(1), failing("boom")]);
        assert!(queue.start().await.wait().await.is_err());

        let error = queue.stop().await.unwrap_err();
        assert_eq!(error.data().unwrap().to_string(), "boom");
        assert!(queue.is_empty().await);
        assert_eq!(queue.stop().await.unwrap(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_clears_the_queue_and_stops_execution() {
        let queue = TaskQueue::with_tasks(&logger(), vec![delayed(1)]);
        let run = queue.start().await;
        assert!(queue.is_running().await);

        queue.clear().await;
        assert!(!queue.is_running().await);
        assert_eq!(queue.current_task_index().await, None);
        assert!(queue.is_empty().await);
        assert!(queue.last_run().await.is_none());

        // the task in flight still completes, but its result is discarded
        assert_eq!(run.wait().await.unwrap(), Vec::<u32>::new());
        assert!(queue.last_results().await.is_empty());
        assert_eq!(queue.status().await.state, RunState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_status_serializes() {
        let queue = queue();
        queue.start().await;
        queue.pause().await.wait().await.unwrap();

        let status = serde_json::to_value(queue.status().await).unwrap();
        assert_eq!(
            status,
            serde_json::json!({
                "state": "paused",
                "cursor": 1,
                "length": 2,
                "completed": 1,
            })
        );
    }
}
