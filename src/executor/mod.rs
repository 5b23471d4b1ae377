//! Core execution engine for Homestead
//!
//! - [`task::TaskExecutor`] applies one task to one node: it plans the
//!   task, then applies the planned mutation unless running in check mode.
//! - [`coordinator::RunCoordinator`] fans plays out across nodes, one
//!   worker per node, bounded by the number of forks.

pub mod coordinator;
pub mod task;

pub use coordinator::RunCoordinator;
pub use task::{NodeSession, TaskExecutor};

use std::time::Duration;

use crate::retry::RetryPolicy;

/// Default number of nodes worked on in parallel.
pub const DEFAULT_FORKS: usize = 5;

/// Configuration for the executor
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Maximum number of parallel node workers
    pub forks: usize,
    /// Plan tasks without applying mutations
    pub check_mode: bool,
    /// Timeout for each connection attempt
    pub connect_timeout: Duration,
    /// Timeout for a whole task execution
    pub command_timeout: Duration,
    /// Retry policy for retryable connection errors
    pub retry: RetryPolicy,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            forks: DEFAULT_FORKS,
            check_mode: false,
            connect_timeout: Duration::from_secs(30),
            command_timeout: Duration::from_secs(300),
            retry: RetryPolicy::default(),
        }
    }
}

impl ExecutorConfig {
    pub fn with_forks(mut self, forks: usize) -> Self {
        self.forks = forks.max(1);
        self
    }

    pub fn with_check_mode(mut self, check_mode: bool) -> Self {
        self.check_mode = check_mode;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout = timeout;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }
}
