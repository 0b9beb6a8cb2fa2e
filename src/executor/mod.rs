pub mod local;

use std::{
    future::Future,
    panic::{catch_unwind, AssertUnwindSafe},
    sync::Arc,
};

use anyhow::anyhow;
use log::{error, info, warn};
use tokio::task::JoinSet;

use crate::plan::{
    state::CompletionStore,
    tracker::{ExecutionReport, StateTracker},
    WorkItem,
};

/// Performs one step of one module. Implementations block; the driver runs them on the
/// blocking thread pool.
pub trait BuildExecutor: Send + Sync + 'static {
    fn execute(&self, item: &WorkItem) -> anyhow::Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunOptions {
    pub jobs: usize,
    pub stop_on_failure: bool,
}

impl Default for RunOptions {
    fn default() -> Self {
        RunOptions {
            jobs: 1,
            stop_on_failure: false,
        }
    }
}

/// Pulls runnable items from the tracker and executes up to `jobs` of them at a time until
/// nothing is runnable and nothing is running. Ctrl-C cancels the tracker; running steps
/// are allowed to finish.
pub async fn run<S, E>(
    tracker: Arc<StateTracker<S>>,
    executor: Arc<E>,
    options: RunOptions,
) -> ExecutionReport
where
    S: CompletionStore + 'static,
    E: BuildExecutor,
{
    run_until(tracker, executor, options, ctrl_c).await
}

async fn ctrl_c() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!("Could not listen for Ctrl-C: {}", err);
        std::future::pending::<()>().await;
    }
}

/// Like [`run`], cancelling the tracker whenever a future made by `interrupt` completes.
///
/// One listener task lives for the whole run, so an interrupt is seen whatever the loop is
/// doing at the time.
pub async fn run_until<S, E, I, F>(
    tracker: Arc<StateTracker<S>>,
    executor: Arc<E>,
    options: RunOptions,
    interrupt: I,
) -> ExecutionReport
where
    S: CompletionStore + 'static,
    E: BuildExecutor,
    I: Fn() -> F + Send + 'static,
    F: Future<Output = ()> + Send + 'static,
{
    let listener = tokio::spawn({
        let tracker = tracker.clone();
        async move {
            loop {
                interrupt().await;
                if tracker.is_cancelled() {
                    warn!("Already interrupted, still waiting for running steps");
                } else {
                    warn!("Interrupted, waiting for running steps");
                    tracker.cancel();
                }
            }
        }
    });

    let jobs = options.jobs.max(1);
    let mut tasks: JoinSet<(WorkItem, anyhow::Result<()>)> = JoinSet::new();

    loop {
        while tasks.len() < jobs {
            let Some(item) = tracker.next_runnable() else {
                break;
            };
            info!("Running {}", item);
            let executor = executor.clone();
            tasks.spawn_blocking(move || {
                let result = catch_unwind(AssertUnwindSafe(|| executor.execute(&item)))
                    .unwrap_or_else(|_| Err(anyhow!("step panicked")));
                (item, result)
            });
        }
        let Some(joined) = tasks.join_next().await else {
            break;
        };
        match joined {
            Ok((item, Ok(()))) => {
                if let Err(err) = tracker.mark_done(&item) {
                    error!("Could not record completion of {}: {}", item, err);
                }
            }
            Ok((item, Err(err))) => {
                tracker.mark_failed(&item, &err);
                if options.stop_on_failure {
                    tracker.cancel();
                }
            }
            Err(err) => error!("Step task failed: {}", err),
        }
    }

    listener.abort();
    tracker.report()
}
