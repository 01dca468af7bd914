pub mod error;
pub mod task;
pub mod task_queue;

pub use error::{InvalidArgument, QueueError};
pub use task::{Runnable, Task, TaskFuture, TaskId};
pub use task_queue::{QueueStatus, RunHandle, RunOutcome, RunState, TaskQueue, WeakTaskQueue};
