mod task;

use std::{
    fs::OpenOptions,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use anyhow::{anyhow, Result};
use async_channel::{Receiver, Sender};
use async_queue_core::{QueueError, QueueStatus, RunState, Task, TaskQueue};
use clap::{Parser, ValueEnum};
use rand::Rng;
use serde::Serialize;
use slog::{error, info, warn, Drain, Logger};

use crate::task::{RunnableState, SleepTask, TaskReport};

#[derive(Debug, Clone, ValueEnum)]
enum LoggingMode {
    Stdout,
    File,
    None,
}

#[derive(Parser, Debug, Clone)]
struct Args {
    /// Number of tasks to enqueue
    #[clap(long, default_value = "5", env)]
    pub tasks: usize,

    /// Duration of every task (ms)
    #[clap(long, default_value = "500", env)]
    pub task_duration_ms: u64,

    /// Upper bound of the random jitter added to every task's duration (ms)
    #[clap(long, default_value = "0", env)]
    pub jitter_ms: u64,

    /// Position of a task that fails instead of completing
    #[clap(long, env)]
    pub fail_at: Option<usize>,

    /// Pause the queue this long after starting it (ms)
    #[clap(long, env)]
    pub pause_after_ms: Option<u64>,

    /// How long to stay paused before resuming (ms)
    #[clap(long, default_value = "1000", env)]
    pub pause_for_ms: u64,

    /// Logging mode
    #[clap(long, default_value = "stdout", env)]
    pub log_mode: LoggingMode,

    /// Log level
    #[clap(long, default_value = "info", env)]
    pub log_level: String,

    /// Log path
    #[clap(long, default_value = "./debug.log", env)]
    pub log_path: String,
}

/// Commands sent to the queue driver
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Control {
    Pause,
    Resume,
    Stop,
}

/// Printed to stdout once the queue settles
#[derive(Debug, Serialize)]
struct Report {
    status: QueueStatus,
    results: Vec<TaskReport>,
    error: Option<String>,
}

fn get_logger(args: &Args) -> Result<Logger> {
    let level = args
        .log_level
        .parse::<slog::Level>()
        .map_err(|_| anyhow!("invalid log level: {}", args.log_level))?;
    match args.log_mode {
        LoggingMode::File => {
            let file = OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(&args.log_path)?;

            let decorator = slog_term::PlainSyncDecorator::new(file);
            let drain = slog_term::FullFormat::new(decorator).build().fuse();
            let drain = slog::LevelFilter::new(drain, level).fuse();
            let drain = slog_async::Async::new(drain)
                .overflow_strategy(slog_async::OverflowStrategy::Block)
                .build()
                .fuse();
            Ok(slog::Logger::root(drain, slog::o!()))
        }
        LoggingMode::Stdout => {
            let decorator = slog_term::TermDecorator::new().stderr().build();
            let drain = slog_term::FullFormat::new(decorator).build().fuse();
            let drain = slog::LevelFilter::new(drain, level).fuse();
            let drain = slog_async::Async::new(drain)
                .overflow_strategy(slog_async::OverflowStrategy::Block)
                .build()
                .fuse();
            Ok(slog::Logger::root(drain, slog::o!()))
        }
        LoggingMode::None => Ok(slog::Logger::root(slog::Discard, slog::o!())),
    }
}

fn build_tasks(args: &Args, state: &RunnableState) -> Vec<Task<TaskReport>> {
    let mut rng = rand::thread_rng();
    (0..args.tasks)
        .map(|position| {
            let jitter = if args.jitter_ms > 0 {
                rng.gen_range(0..=args.jitter_ms)
            } else {
                0
            };
            let duration = Duration::from_millis(args.task_duration_ms.saturating_add(jitter));
            let task = SleepTask::new(position, duration).failing(args.fail_at == Some(position));
            Task::from_runnable(task, state.clone())
        })
        .collect()
}

/// Turns SIGTERM/SIGINT into a stop command
async fn watch_signals(term: Arc<AtomicBool>, control: Sender<Control>) {
    while !term.load(Ordering::Relaxed) {
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    let _ = control.send(Control::Stop).await;
}

async fn schedule_pause(pause_after: Duration, pause_for: Duration, control: Sender<Control>) {
    tokio::time::sleep(pause_after).await;
    if control.send(Control::Pause).await.is_err() {
        return;
    }
    tokio::time::sleep(pause_for).await;
    let _ = control.send(Control::Resume).await;
}

/// Runs the queue until it settles, applying control commands along the way.
///
/// Returns `None` if the queue was stopped before it ever ran.
async fn drive(
    logger: &Logger,
    queue: &TaskQueue<TaskReport>,
    control: Receiver<Control>,
) -> Result<Option<Vec<TaskReport>>, QueueError<TaskReport>> {
    let mut run = Some(queue.start().await);
    loop {
        let Some(current) = run.clone() else {
            // paused, only a command can make progress
            match control.recv().await {
                Ok(Control::Resume) => {
                    info!(logger, "resuming queue");
                    run = Some(queue.resume().await);
                }
                Ok(Control::Pause) => {}
                Ok(Control::Stop) | Err(_) => return queue.stop().await,
            }
            continue;
        };

        tokio::select! {
            outcome = current.wait() => return outcome.map(Some),
            command = control.recv() => match command {
                Ok(Control::Pause) => {
                    let results = queue.pause().await.wait().await?;
                    if queue.status().await.state == RunState::Idle {
                        return Ok(Some(results));
                    }
                    info!(logger, "queue paused"; "completed" => results.len());
                    run = None;
                }
                Ok(Control::Resume) => {}
                Ok(Control::Stop) | Err(_) => {
                    warn!(logger, "stopping queue");
                    return queue.stop().await;
                }
            },
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Setup signal handling
    let term = Arc::new(AtomicBool::new(false));
    signal_hook::flag::register(signal_hook::consts::SIGTERM, Arc::clone(&term))?;
    signal_hook::flag::register(signal_hook::consts::SIGINT, Arc::clone(&term))?;

    // Parse the command line arguments
    let args = Args::parse();
    let logger = get_logger(&args)?;

    // Setup the queue
    let state = RunnableState::new(&logger);
    let queue = TaskQueue::with_tasks(&logger, build_tasks(&args, &state));

    // Setup the control channel
    let (control_tx, control_rx) = async_channel::unbounded();
    tokio::spawn(watch_signals(term, control_tx.clone()));
    if let Some(pause_after_ms) = args.pause_after_ms {
        tokio::spawn(schedule_pause(
            Duration::from_millis(pause_after_ms),
            Duration::from_millis(args.pause_for_ms),
            control_tx.clone(),
        ));
    }

    // Run the queue
    let outcome = drive(&logger, &queue, control_rx).await;
    let report = match &outcome {
        Ok(results) => Report {
            status: queue.status().await,
            results: results.clone().unwrap_or_default(),
            error: None,
        },
        Err(e) => {
            error!(logger, "queue failed"; "error" => e.detailed().to_string());
            Report {
                status: queue.status().await,
                results: queue.last_results().await,
                error: Some(e.detailed().to_string()),
            }
        }
    };
    println!("{}", serde_json::to_string_pretty(&report)?);

    outcome.map(|_| ()).map_err(anyhow::Error::new)
}
