//! Run reports.
//!
//! Every (node, task) pair of a run ends up as a [`TaskRecord`]. Records are
//! grouped per node and play in [`NodePlayReport`], per play in
//! [`PlayReport`], and per run in [`RunReport`].

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::time::Duration;

use crate::error::{exit_code, Result};

/// Outcome of one task on one node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskOutcome {
    /// The node was mutated (or would be, in check mode)
    Changed,
    /// The node was already in the desired state
    Unchanged,
    /// The task failed
    Failed,
    /// The task never ran
    Skipped,
}

impl fmt::Display for TaskOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TaskOutcome::Changed => "changed",
            TaskOutcome::Unchanged => "ok",
            TaskOutcome::Failed => "failed",
            TaskOutcome::Skipped => "skipped",
        };
        f.write_str(s)
    }
}

/// Result of executing one task on one node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskResult {
    pub outcome: TaskOutcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl TaskResult {
    pub fn changed(msg: impl Into<String>) -> Self {
        Self {
            outcome: TaskOutcome::Changed,
            message: Some(msg.into()),
        }
    }

    pub fn unchanged(msg: impl Into<String>) -> Self {
        Self {
            outcome: TaskOutcome::Unchanged,
            message: Some(msg.into()),
        }
    }

    pub fn failed(msg: impl Into<String>) -> Self {
        Self {
            outcome: TaskOutcome::Failed,
            message: Some(msg.into()),
        }
    }

    pub fn skipped(msg: impl Into<String>) -> Self {
        Self {
            outcome: TaskOutcome::Skipped,
            message: Some(msg.into()),
        }
    }
}

/// One (node, task) entry of a report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskRecord {
    /// Task name, prefixed with its role
    pub task: String,
    /// Module that ran the task
    pub action: String,
    pub outcome: TaskOutcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// A failure that did not halt the node
    #[serde(default)]
    pub ignored: bool,
    /// Wall-clock time spent on the task
    #[serde(default)]
    pub duration_ms: u64,
}

impl TaskRecord {
    /// Creates a record from a task result.
    pub fn new(
        task: impl Into<String>,
        action: impl Into<String>,
        result: TaskResult,
        duration: Duration,
    ) -> Self {
        Self {
            task: task.into(),
            action: action.into(),
            outcome: result.outcome,
            message: result.message,
            ignored: false,
            duration_ms: u64::try_from(duration.as_millis()).unwrap_or(u64::MAX),
        }
    }

    /// Record for a task that never ran.
    pub fn skipped(task: impl Into<String>, action: impl Into<String>, reason: &str) -> Self {
        Self::new(task, action, TaskResult::skipped(reason), Duration::ZERO)
    }

    /// Whether this record halts the node's play.
    pub fn is_fatal(&self) -> bool {
        self.outcome == TaskOutcome::Failed && !self.ignored
    }
}

/// State of one node within one play.
///
/// `pending -> running -> {completed | failed | cancelled}`. The last three
/// are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodePlayState {
    #[default]
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl NodePlayState {
    /// Returns true if no further transition is possible.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            NodePlayState::Completed | NodePlayState::Failed | NodePlayState::Cancelled
        )
    }

    /// Returns true if `self -> next` is a legal transition.
    pub fn can_transition_to(self, next: NodePlayState) -> bool {
        use NodePlayState::*;
        matches!(
            (self, next),
            (Pending, Running)
                | (Pending, Failed)
                | (Pending, Cancelled)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, Cancelled)
        )
    }
}

impl fmt::Display for NodePlayState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            NodePlayState::Pending => "pending",
            NodePlayState::Running => "running",
            NodePlayState::Completed => "completed",
            NodePlayState::Failed => "failed",
            NodePlayState::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// Report slot of one node for one play, owned by that node's worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodePlayReport {
    pub node: String,
    pub state: NodePlayState,
    pub tasks: Vec<TaskRecord>,
}

impl NodePlayReport {
    pub fn new(node: impl Into<String>) -> Self {
        Self {
            node: node.into(),
            state: NodePlayState::Pending,
            tasks: Vec::new(),
        }
    }

    /// Moves to `next`, ignoring illegal transitions.
    pub fn transition(&mut self, next: NodePlayState) -> bool {
        if self.state.can_transition_to(next) {
            self.state = next;
            true
        } else {
            tracing::warn!(
                node = %self.node,
                from = %self.state,
                to = %next,
                "Ignoring illegal node state transition"
            );
            false
        }
    }

    /// Outcome of the named task, if it was recorded.
    pub fn outcome_of(&self, task: &str) -> Option<TaskOutcome> {
        self.tasks.iter().find(|r| r.task == task).map(|r| r.outcome)
    }
}

/// Report of one play.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlayReport {
    pub name: String,
    pub hosts: String,
    /// Node slots in inventory order
    pub nodes: Vec<NodePlayReport>,
}

impl PlayReport {
    pub fn node(&self, name: &str) -> Option<&NodePlayReport> {
        self.nodes.iter().find(|n| n.node == name)
    }
}

/// Per-node totals across a run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeRecap {
    pub ok: usize,
    pub changed: usize,
    pub failed: usize,
    pub skipped: usize,
    pub ignored: usize,
}

impl NodeRecap {
    fn add(&mut self, record: &TaskRecord) {
        match record.outcome {
            TaskOutcome::Unchanged => self.ok += 1,
            TaskOutcome::Changed => self.changed += 1,
            TaskOutcome::Failed if record.ignored => self.ignored += 1,
            TaskOutcome::Failed => self.failed += 1,
            TaskOutcome::Skipped => self.skipped += 1,
        }
    }
}

/// Report of a whole run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunReport {
    pub playbook: String,
    pub check_mode: bool,
    pub plays: Vec<PlayReport>,
    pub cancelled: bool,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl RunReport {
    pub fn new(playbook: impl Into<String>, check_mode: bool) -> Self {
        let now = Utc::now();
        Self {
            playbook: playbook.into(),
            check_mode,
            plays: Vec::new(),
            cancelled: false,
            started_at: now,
            finished_at: now,
        }
    }

    /// True when no node failed and the run was not cancelled.
    pub fn success(&self) -> bool {
        !self.cancelled && self.failed_nodes().is_empty()
    }

    /// Nodes that failed any play, in order of first failure.
    pub fn failed_nodes(&self) -> Vec<&str> {
        let mut failed: Vec<&str> = Vec::new();
        for node in self.plays.iter().flat_map(|p| &p.nodes) {
            if node.state == NodePlayState::Failed && !failed.contains(&node.node.as_str()) {
                failed.push(&node.node);
            }
        }
        failed
    }

    /// Per-node totals, in order of first appearance.
    pub fn recap(&self) -> IndexMap<String, NodeRecap> {
        let mut recap: IndexMap<String, NodeRecap> = IndexMap::new();
        for node in self.plays.iter().flat_map(|p| &p.nodes) {
            let entry = recap.entry(node.node.clone()).or_default();
            for record in &node.tasks {
                entry.add(record);
            }
        }
        recap
    }

    /// Every record of `node`, across plays, in execution order.
    pub fn records_for<'a>(&'a self, node: &'a str) -> impl Iterator<Item = &'a TaskRecord> + 'a {
        self.plays
            .iter()
            .flat_map(|p| &p.nodes)
            .filter(move |n| n.node == node)
            .flat_map(|n| &n.tasks)
    }

    /// Process exit code for this report.
    pub fn exit_code(&self) -> i32 {
        if self.cancelled {
            exit_code::CANCELLED
        } else if self.failed_nodes().is_empty() {
            exit_code::SUCCESS
        } else {
            exit_code::NODES_FAILED
        }
    }

    /// Serializes the report as pretty JSON.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Writes the report as JSON to `path`.
    pub fn write_json(&self, path: impl AsRef<Path>) -> Result<()> {
        std::fs::write(path, self.to_json()?)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn record(task: &str, result: TaskResult) -> TaskRecord {
        TaskRecord::new(task, "package", result, Duration::from_millis(5))
    }

    fn report() -> RunReport {
        let mut srv1 = NodePlayReport::new("srv1");
        srv1.transition(NodePlayState::Running);
        srv1.tasks.push(record("a", TaskResult::changed("installed")));
        srv1.tasks.push(record("b", TaskResult::unchanged("present")));
        srv1.transition(NodePlayState::Completed);

        let mut srv2 = NodePlayReport::new("srv2");
        srv2.transition(NodePlayState::Running);
        srv2.tasks.push(record("a", TaskResult::failed("boom")));
        srv2.tasks.push(TaskRecord::skipped("b", "package", "node failed"));
        srv2.transition(NodePlayState::Failed);

        let mut run = RunReport::new("site", false);
        run.plays.push(PlayReport {
            name: "base".into(),
            hosts: "all".into(),
            nodes: vec![srv1, srv2],
        });
        run
    }

    #[test]
    fn test_state_machine() {
        use NodePlayState::*;
        assert!(Pending.can_transition_to(Running));
        assert!(Running.can_transition_to(Completed));
        assert!(Running.can_transition_to(Failed));
        assert!(!Failed.can_transition_to(Running));
        assert!(!Completed.can_transition_to(Failed));
        assert!(Failed.is_terminal());

        let mut slot = NodePlayReport::new("srv1");
        assert!(!slot.transition(Completed));
        assert_eq!(slot.state, Pending);
    }

    #[test]
    fn test_recap_and_exit_code() {
        let run = report();
        assert!(!run.success());
        assert_eq!(run.failed_nodes(), vec!["srv2"]);
        assert_eq!(run.exit_code(), exit_code::NODES_FAILED);

        let recap = run.recap();
        assert_eq!(
            recap["srv1"],
            NodeRecap {
                ok: 1,
                changed: 1,
                ..Default::default()
            }
        );
        assert_eq!(recap["srv2"].failed, 1);
        assert_eq!(recap["srv2"].skipped, 1);
    }

    #[test]
    fn test_cancelled_exit_code() {
        let mut run = report();
        run.cancelled = true;
        assert_eq!(run.exit_code(), exit_code::CANCELLED);
    }

    #[test]
    fn test_ignored_failure_is_not_fatal() {
        let mut rec = record("a", TaskResult::failed("boom"));
        assert!(rec.is_fatal());
        rec.ignored = true;
        assert!(!rec.is_fatal());
    }

    #[test]
    fn test_json_roundtrip_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("report.json");
        let run = report();
        run.write_json(&path).unwrap();

        let loaded: RunReport =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(loaded, run);
        assert!(std::fs::read_to_string(&path)
            .unwrap()
            .contains("\"outcome\": \"unchanged\""));
    }
}
