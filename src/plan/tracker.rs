use std::{
    collections::BTreeMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Mutex, MutexGuard,
    },
};

use log::{debug, error, info};
use thiserror::Error;

use crate::model::ModuleName;

use super::{
    state::{CompletionStore, StoreError},
    BuildPlan, Step, WorkItem, WorkKey,
};

#[derive(Debug, Clone, PartialEq, Eq)]
enum WorkState {
    Pending,
    Running,
    Done,
    /// Complete before this run started.
    Skipped,
    Failed(String),
    Blocked(WorkKey),
}

/// Execution-time failures. Neither aborts the rest of the plan.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WorkItemError {
    #[error("{key} failed: {message}")]
    Failed { key: WorkKey, message: String },
    #[error("{key} blocked by {blocked_by}")]
    Blocked { key: WorkKey, blocked_by: WorkKey },
}

/// The outcome of one run over a plan.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecutionReport {
    pub done: Vec<WorkKey>,
    pub skipped: Vec<WorkKey>,
    pub failed: Vec<WorkItemError>,
    pub blocked: Vec<WorkItemError>,
    /// Not attempted because the run was cancelled.
    pub pending: Vec<WorkKey>,
}

impl ExecutionReport {
    pub fn is_success(&self) -> bool {
        self.failed.is_empty() && self.blocked.is_empty() && self.pending.is_empty()
    }
}

/// Hands out runnable work items of a plan and records their completion.
pub struct StateTracker<S> {
    plan: BuildPlan,
    store: S,
    fingerprints: BTreeMap<ModuleName, String>,
    states: Mutex<BTreeMap<WorkKey, WorkState>>,
    cancelled: AtomicBool,
}

impl<S> StateTracker<S>
where
    S: CompletionStore,
{
    /// Invalidates the records of every module whose fingerprint changed, then marks the
    /// items already recorded as complete.
    pub fn new(plan: BuildPlan, store: S) -> Result<Self, StoreError> {
        let fingerprints: BTreeMap<ModuleName, String> = plan
            .order()
            .modules()
            .iter()
            .map(|entry| (entry.name.clone(), entry.fingerprint()))
            .collect();

        for (module, fingerprint) in &fingerprints {
            let stale = Step::ALL.into_iter().any(|step| {
                store
                    .get(&WorkKey::new(module.clone(), step))
                    .is_some_and(|recorded| &recorded != fingerprint)
            });
            if stale {
                info!("{} changed since the last run, all of its steps will run again", module);
                store.remove_module(module)?;
            }
        }

        let states = plan
            .items()
            .iter()
            .map(|item| {
                let key = item.key();
                let state = match (store.get(&key), fingerprints.get(&item.module)) {
                    (Some(recorded), Some(fingerprint)) if &recorded == fingerprint => {
                        debug!("{} is already complete", key);
                        WorkState::Skipped
                    }
                    _ => WorkState::Pending,
                };
                (key, state)
            })
            .collect();

        Ok(StateTracker {
            plan,
            store,
            fingerprints,
            states: Mutex::new(states),
            cancelled: AtomicBool::new(false),
        })
    }

    pub fn plan(&self) -> &BuildPlan {
        &self.plan
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    fn states(&self) -> MutexGuard<'_, BTreeMap<WorkKey, WorkState>> {
        self.states
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// The first pending item, in plan order, whose preconditions are all complete. Items
    /// that depend on a failed or blocked item become blocked on the way.
    pub fn next_runnable(&self) -> Option<WorkItem> {
        if self.is_cancelled() {
            return None;
        }
        let mut states = self.states();
        propagate_blocked(&self.plan, &mut states);
        let item = self.plan.items().iter().find(|item| {
            states.get(&item.key()) == Some(&WorkState::Pending)
                && item.preconditions.iter().all(|precondition| {
                    matches!(
                        states.get(precondition),
                        Some(WorkState::Done | WorkState::Skipped) | None
                    )
                })
        })?;
        states.insert(item.key(), WorkState::Running);
        Some(item.clone())
    }

    /// Records success. The step counts as complete only once the store accepted it.
    pub fn mark_done(&self, item: &WorkItem) -> Result<(), StoreError> {
        let key = item.key();
        let fingerprint = self
            .fingerprints
            .get(&item.module)
            .cloned()
            .unwrap_or_default();
        match self.store.set(key.clone(), fingerprint) {
            Ok(()) => {
                debug!("{} done", key);
                self.states().insert(key, WorkState::Done);
                Ok(())
            }
            Err(err) => {
                self.states()
                    .insert(key, WorkState::Failed(format!("could not record completion: {err}")));
                Err(err)
            }
        }
    }

    /// Records a failure for this run only; nothing is persisted.
    pub fn mark_failed(&self, item: &WorkItem, err: &anyhow::Error) {
        error!("{} failed: {:#}", item, err);
        self.states()
            .insert(item.key(), WorkState::Failed(format!("{err:#}")));
    }

    /// Stops handing out new items. Running items may still be marked.
    pub fn cancel(&self) {
        if !self.cancelled.swap(true, Ordering::SeqCst) {
            info!("Cancelling, no new steps will be started");
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    pub fn running(&self) -> usize {
        self.states()
            .values()
            .filter(|state| **state == WorkState::Running)
            .count()
    }

    /// Whether every step of `module` is recorded as complete for its current version.
    pub fn is_built(&self, module: &ModuleName) -> bool {
        is_built(&self.store, module, self.fingerprints.get(module))
    }

    pub fn report(&self) -> ExecutionReport {
        let mut states = self.states();
        propagate_blocked(&self.plan, &mut states);
        let mut report = ExecutionReport::default();
        for item in self.plan.items() {
            let key = item.key();
            match states.get(&key) {
                Some(WorkState::Done) => report.done.push(key),
                Some(WorkState::Skipped) => report.skipped.push(key),
                Some(WorkState::Failed(message)) => report.failed.push(WorkItemError::Failed {
                    key,
                    message: message.clone(),
                }),
                Some(WorkState::Blocked(blocked_by)) => {
                    report.blocked.push(WorkItemError::Blocked {
                        key,
                        blocked_by: blocked_by.clone(),
                    })
                }
                Some(WorkState::Pending | WorkState::Running) | None => report.pending.push(key),
            }
        }
        report
    }
}

/// Steps of `module` recorded with `fingerprint`, in step order.
pub fn completed_steps<S>(store: &S, module: &ModuleName, fingerprint: &str) -> Vec<Step>
where
    S: CompletionStore + ?Sized,
{
    Step::ALL
        .into_iter()
        .filter(|step| {
            store.get(&WorkKey::new(module.clone(), *step)).as_deref() == Some(fingerprint)
        })
        .collect()
}

/// Whether every step of `module` is recorded with `fingerprint`.
pub fn is_built<S>(store: &S, module: &ModuleName, fingerprint: Option<&String>) -> bool
where
    S: CompletionStore + ?Sized,
{
    fingerprint.is_some_and(|fingerprint| {
        completed_steps(store, module, fingerprint).len() == Step::ALL.len()
    })
}

/// Preconditions always come earlier in the plan, so one pass in plan order is enough.
fn propagate_blocked(plan: &BuildPlan, states: &mut BTreeMap<WorkKey, WorkState>) {
    for item in plan.items() {
        let key = item.key();
        if states.get(&key) != Some(&WorkState::Pending) {
            continue;
        }
        let blocker = item.preconditions.iter().find_map(|precondition| {
            match states.get(precondition) {
                Some(WorkState::Failed(_)) => Some(precondition.clone()),
                Some(WorkState::Blocked(root)) => Some(root.clone()),
                _ => None,
            }
        });
        if let Some(blocker) = blocker {
            debug!("{} is blocked by {}", key, blocker);
            states.insert(key, WorkState::Blocked(blocker));
        }
    }
}
