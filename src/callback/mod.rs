//! Callbacks for run events.
//!
//! The coordinator reports progress through a [`RunCallback`]. Every method
//! has an empty default, so implementations override only what they need.
//! Task results arrive from node workers concurrently, in no particular
//! order across nodes.

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::report::{PlayReport, RunReport, TaskRecord};

/// Receiver of run events.
#[async_trait]
pub trait RunCallback: Send + Sync {
    /// Called when a play starts, with the selected node names.
    async fn on_play_start(&self, play: &str, nodes: &[String]) {
        let _ = (play, nodes);
    }

    /// Called when a task finished (or was skipped) on a node.
    async fn on_task_result(&self, node: &str, record: &TaskRecord) {
        let _ = (node, record);
    }

    /// Called when every node of a play is done.
    async fn on_play_end(&self, report: &PlayReport) {
        let _ = report;
    }

    /// Called once after the last play.
    async fn on_run_end(&self, report: &RunReport) {
        let _ = report;
    }
}

/// Callback that ignores every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullCallback;

#[async_trait]
impl RunCallback for NullCallback {}

/// An event captured by [`RecordingCallback`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunEvent {
    PlayStart { play: String, nodes: Vec<String> },
    TaskResult { node: String, record: TaskRecord },
    PlayEnd { play: String },
    RunEnd { success: bool },
}

/// Callback that keeps every event in memory.
#[derive(Debug, Default)]
pub struct RecordingCallback {
    events: Mutex<Vec<RunEvent>>,
}

impl RecordingCallback {
    pub fn new() -> Self {
        Self::default()
    }

    /// Events received so far.
    pub fn events(&self) -> Vec<RunEvent> {
        self.events.lock().clone()
    }

    /// Task results of `node`, in the order they arrived.
    pub fn records_for(&self, node: &str) -> Vec<TaskRecord> {
        self.events
            .lock()
            .iter()
            .filter_map(|event| match event {
                RunEvent::TaskResult { node: n, record } if n == node => Some(record.clone()),
                _ => None,
            })
            .collect()
    }
}

#[async_trait]
impl RunCallback for RecordingCallback {
    async fn on_play_start(&self, play: &str, nodes: &[String]) {
        self.events.lock().push(RunEvent::PlayStart {
            play: play.to_string(),
            nodes: nodes.to_vec(),
        });
    }

    async fn on_task_result(&self, node: &str, record: &TaskRecord) {
        self.events.lock().push(RunEvent::TaskResult {
            node: node.to_string(),
            record: record.clone(),
        });
    }

    async fn on_play_end(&self, report: &PlayReport) {
        self.events.lock().push(RunEvent::PlayEnd {
            play: report.name.clone(),
        });
    }

    async fn on_run_end(&self, report: &RunReport) {
        self.events.lock().push(RunEvent::RunEnd {
            success: report.success(),
        });
    }
}
