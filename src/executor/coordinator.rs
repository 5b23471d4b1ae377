//! Run coordination across nodes.
//!
//! Plays run one after another. Within a play every selected node gets its
//! own worker, spawned on the runtime and gated by a semaphore with one
//! permit per fork. A worker runs the play's tasks strictly in order and
//! owns its node's report slot; the coordinator collects the slots once
//! every worker has finished.
//!
//! Cancellation stops dispatch: workers still waiting for a permit give up,
//! running workers finish their current task and skip the rest, and no
//! further play starts.

use futures::future::join_all;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};

use super::task::TaskExecutor;
use crate::callback::{NullCallback, RunCallback};
use crate::error::Result;
use crate::inventory::{Inventory, ManagedNode};
use crate::playbook::{Playbook, ResolvedPlay, Task};
use crate::report::{NodePlayReport, NodePlayState, PlayReport, RunReport, TaskRecord};
use crate::roles::RoleLibrary;
use crate::vars::Vars;

const SKIP_CANCELLED: &str = "run cancelled";
const SKIP_EARLIER_FAILURE: &str = "node failed in an earlier play";
const SKIP_PANICKED: &str = "worker panicked";

/// Fans playbooks out across inventory nodes.
pub struct RunCoordinator {
    executor: Arc<TaskExecutor>,
    library: RoleLibrary,
    extra_vars: Vars,
    callback: Arc<dyn RunCallback>,
    cancel: CancellationToken,
}

/// Everything a node worker needs, shared across the workers of a play.
struct Worker {
    executor: Arc<TaskExecutor>,
    callback: Arc<dyn RunCallback>,
    cancel: CancellationToken,
    semaphore: Arc<Semaphore>,
    play: Arc<ResolvedPlay>,
}

impl RunCoordinator {
    pub fn new(executor: TaskExecutor, library: RoleLibrary) -> Self {
        Self {
            executor: Arc::new(executor),
            library,
            extra_vars: Vars::new(),
            callback: Arc::new(NullCallback),
            cancel: CancellationToken::new(),
        }
    }

    /// Variables overriding every other variable source.
    pub fn with_extra_vars(mut self, extra_vars: Vars) -> Self {
        self.extra_vars = extra_vars;
        self
    }

    pub fn with_callback(mut self, callback: Arc<dyn RunCallback>) -> Self {
        self.callback = callback;
        self
    }

    /// Uses `token` to cancel the run.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// Token that cancels this coordinator's runs.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn executor(&self) -> &TaskExecutor {
        &self.executor
    }

    /// Resolves `playbook` and runs it against `inventory`.
    ///
    /// Load and variable errors are returned before any node is contacted.
    /// Execution errors never fail the call; they are part of the report.
    pub async fn run(&self, playbook: &Playbook, inventory: &Inventory) -> Result<RunReport> {
        let plays = playbook.resolve(&self.library, self.executor.modules(), &self.extra_vars)?;
        Ok(self.run_resolved(&playbook.name, plays, inventory).await)
    }

    /// Runs already resolved plays.
    #[instrument(skip(self, plays, inventory), fields(playbook = %name))]
    pub async fn run_resolved(
        &self,
        name: &str,
        plays: Vec<ResolvedPlay>,
        inventory: &Inventory,
    ) -> RunReport {
        let mut report = RunReport::new(name, self.executor.config().check_mode);
        let mut failed: HashSet<String> = HashSet::new();

        for play in plays {
            if self.cancel.is_cancelled() {
                warn!(play = %play.name, "Run cancelled, not starting play");
                report.cancelled = true;
                break;
            }

            let play_report = self.run_play(Arc::new(play), inventory, &failed).await;
            for slot in &play_report.nodes {
                if slot.state == NodePlayState::Failed {
                    failed.insert(slot.node.clone());
                }
                if slot.state == NodePlayState::Cancelled {
                    report.cancelled = true;
                }
            }
            self.callback.on_play_end(&play_report).await;
            report.plays.push(play_report);
        }

        if self.cancel.is_cancelled() {
            report.cancelled = true;
        }
        report.finished_at = chrono::Utc::now();
        info!(
            success = report.success(),
            cancelled = report.cancelled,
            "Run finished"
        );
        self.callback.on_run_end(&report).await;
        report
    }

    async fn run_play(
        &self,
        play: Arc<ResolvedPlay>,
        inventory: &Inventory,
        failed: &HashSet<String>,
    ) -> PlayReport {
        let nodes: Vec<ManagedNode> = inventory.select(&play.hosts).into_iter().cloned().collect();
        let names: Vec<String> = nodes.iter().map(|n| n.name.clone()).collect();

        info!(
            play = %play.name,
            hosts = %play.hosts,
            nodes = nodes.len(),
            tasks = play.tasks.len(),
            "Starting play"
        );
        if nodes.is_empty() {
            warn!(play = %play.name, hosts = %play.hosts, "No nodes matched");
        }
        self.callback.on_play_start(&play.name, &names).await;

        let worker = Arc::new(Worker {
            executor: Arc::clone(&self.executor),
            callback: Arc::clone(&self.callback),
            cancel: self.cancel.clone(),
            semaphore: Arc::new(Semaphore::new(self.executor.config().forks.max(1))),
            play: Arc::clone(&play),
        });

        let handles: Vec<_> = nodes
            .into_iter()
            .map(|node| {
                let worker = Arc::clone(&worker);
                let excluded = failed.contains(&node.name);
                tokio::spawn(async move { worker.run_node(node, excluded).await })
            })
            .collect();

        let mut slots = Vec::with_capacity(handles.len());
        for (joined, name) in join_all(handles).await.into_iter().zip(names) {
            match joined {
                Ok(slot) => slots.push(slot),
                Err(e) => {
                    // The worker's own records died with it.
                    error!(node = %name, error = %e, "Node worker panicked");
                    let mut slot = NodePlayReport::new(name);
                    worker.skip(&mut slot, &play.tasks, SKIP_PANICKED).await;
                    slot.transition(NodePlayState::Failed);
                    slots.push(slot);
                }
            }
        }

        PlayReport {
            name: play.name.clone(),
            hosts: play.hosts.clone(),
            nodes: slots,
        }
    }
}

impl Worker {
    async fn run_node(&self, node: ManagedNode, excluded: bool) -> NodePlayReport {
        let tasks = Arc::clone(&self.play.tasks);
        let mut slot = NodePlayReport::new(&node.name);

        if excluded {
            self.skip(&mut slot, &tasks, SKIP_EARLIER_FAILURE).await;
            slot.transition(NodePlayState::Failed);
            return slot;
        }

        let permit = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => None,
            permit = Arc::clone(&self.semaphore).acquire_owned() => permit.ok(),
        };
        let Some(_permit) = permit else {
            self.skip(&mut slot, &tasks, SKIP_CANCELLED).await;
            slot.transition(NodePlayState::Cancelled);
            return slot;
        };

        slot.transition(NodePlayState::Running);
        info!(node = %node.name, play = %self.play.name, "Node started");

        let session = match self.executor.connect(&node).await {
            Ok(session) => session,
            Err(e) => {
                warn!(node = %node.name, error = %e, "Node unreachable");
                if let Some((first, rest)) = tasks.split_first() {
                    let record = TaskRecord::new(
                        first.display_name(),
                        &first.action,
                        crate::report::TaskResult::failed(e.to_string()),
                        std::time::Duration::ZERO,
                    );
                    self.callback.on_task_result(&node.name, &record).await;
                    slot.tasks.push(record);
                    self.skip(&mut slot, rest, "node unreachable").await;
                }
                slot.transition(NodePlayState::Failed);
                return slot;
            }
        };

        let become_user = self.play.become_user.as_deref();
        for (idx, task) in tasks.iter().enumerate() {
            if self.cancel.is_cancelled() {
                self.skip(&mut slot, &tasks[idx..], SKIP_CANCELLED).await;
                slot.transition(NodePlayState::Cancelled);
                break;
            }

            info!(node = %node.name, task = %task.display_name(), "Running task");
            let context = task.context(self.play.r#become, become_user);
            let started = Instant::now();
            let result = self.executor.execute_on(&session, task, &context).await;

            let mut record =
                TaskRecord::new(task.display_name(), &task.action, result, started.elapsed());
            if task.ignore_errors && record.outcome == crate::report::TaskOutcome::Failed {
                record.ignored = true;
            }
            info!(
                node = %node.name,
                task = %record.task,
                outcome = %record.outcome,
                ignored = record.ignored,
                "Task finished"
            );
            self.callback.on_task_result(&node.name, &record).await;

            let fatal = record.is_fatal();
            slot.tasks.push(record);
            if fatal {
                let reason = format!("halted after failure of '{}'", task.display_name());
                self.skip(&mut slot, &tasks[idx + 1..], &reason).await;
                slot.transition(NodePlayState::Failed);
                break;
            }
        }

        session.close().await;
        if slot.state == NodePlayState::Running {
            slot.transition(NodePlayState::Completed);
        }
        slot
    }

    async fn skip(&self, slot: &mut NodePlayReport, tasks: &[Task], reason: &str) {
        for task in tasks {
            let record = TaskRecord::skipped(task.display_name(), &task.action, reason);
            self.callback.on_task_result(&slot.node, &record).await;
            slot.tasks.push(record);
        }
    }
}
