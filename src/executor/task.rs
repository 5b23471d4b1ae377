//! Task execution on a single node.
//!
//! Executing a task is a plan followed by an optional apply. The plan
//! observes the node and returns the mutation needed to reach the desired
//! state. No mutation means the task is `unchanged`. Otherwise the
//! mutation is applied and the task is `changed`. In check mode the
//! mutation is reported but never applied.

use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument};

use super::ExecutorConfig;
use crate::connection::{Connection, ConnectionError, Connector};
use crate::error::{Error, Result};
use crate::inventory::ManagedNode;
use crate::modules::{self, Module, ModuleContext, ModuleRegistry, ModuleResult};
use crate::playbook::Task;
use crate::report::TaskResult;

/// An open connection to one node.
pub struct NodeSession {
    node: String,
    connection: Arc<dyn Connection>,
}

impl NodeSession {
    pub fn new(node: impl Into<String>, connection: Arc<dyn Connection>) -> Self {
        Self {
            node: node.into(),
            connection,
        }
    }

    /// Name of the node.
    pub fn node(&self) -> &str {
        &self.node
    }

    pub fn connection(&self) -> &dyn Connection {
        self.connection.as_ref()
    }

    /// Closes the underlying connection.
    pub async fn close(self) {
        if let Err(e) = self.connection.close().await {
            debug!(node = %self.node, error = %e, "Error closing connection");
        }
    }
}

/// Applies tasks to nodes.
pub struct TaskExecutor {
    connector: Arc<dyn Connector>,
    modules: Arc<ModuleRegistry>,
    config: ExecutorConfig,
}

impl TaskExecutor {
    pub fn new(
        connector: Arc<dyn Connector>,
        modules: Arc<ModuleRegistry>,
        config: ExecutorConfig,
    ) -> Self {
        Self {
            connector,
            modules,
            config,
        }
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    pub fn modules(&self) -> &ModuleRegistry {
        &self.modules
    }

    /// Opens a session to `node`.
    ///
    /// Each attempt is bounded by the connect timeout. Retryable failures
    /// are retried according to the retry policy.
    #[instrument(skip(self, node), fields(node = %node.name))]
    pub async fn connect(&self, node: &ManagedNode) -> Result<NodeSession> {
        let timeout = self.config.connect_timeout;
        let connector = &self.connector;

        let connection = self
            .config
            .retry
            .retry_if(
                || async move {
                    match tokio::time::timeout(timeout, connector.connect(node)).await {
                        Ok(result) => result,
                        Err(_) => Err(ConnectionError::Timeout(timeout.as_secs())),
                    }
                },
                ConnectionError::is_retryable,
            )
            .await
            .map_err(|source| Error::Connection {
                node: node.name.clone(),
                source,
            })?;

        debug!(address = %connection.identifier(), "Connected");
        Ok(NodeSession::new(&node.name, connection))
    }

    /// Connects to `node`, executes `task` and closes the session.
    ///
    /// A connection failure is reported as a failed task.
    pub async fn execute(&self, node: &ManagedNode, task: &Task) -> TaskResult {
        let session = match self.connect(node).await {
            Ok(session) => session,
            Err(e) => return TaskResult::failed(e.to_string()),
        };
        let context = task.context(false, None);
        let result = self.execute_on(&session, task, &context).await;
        session.close().await;
        result
    }

    /// Executes `task` over an open session.
    ///
    /// Never returns an error: module errors and timeouts become a failed
    /// [`TaskResult`].
    pub async fn execute_on(
        &self,
        session: &NodeSession,
        task: &Task,
        context: &ModuleContext,
    ) -> TaskResult {
        let Some(module) = self.modules.get(&task.action) else {
            return TaskResult::failed(format!("unknown action '{}'", task.action));
        };

        let timeout = self.config.command_timeout;
        let run = self.plan_and_apply(module.as_ref(), session.connection(), task, context);
        match tokio::time::timeout(timeout, run).await {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => TaskResult::failed(
                Error::TaskFailed {
                    task: task.display_name(),
                    node: session.node().to_string(),
                    message: e.to_string(),
                }
                .to_string(),
            ),
            Err(_) => TaskResult::failed(
                Error::ExecutionTimeout {
                    task: task.display_name(),
                    node: session.node().to_string(),
                    timeout_secs: timeout_secs(timeout),
                }
                .to_string(),
            ),
        }
    }

    async fn plan_and_apply(
        &self,
        module: &dyn Module,
        connection: &dyn Connection,
        task: &Task,
        context: &ModuleContext,
    ) -> ModuleResult<TaskResult> {
        let plan = module.plan(connection, &task.params, context).await?;

        match plan.mutation {
            None => Ok(TaskResult::unchanged(plan.msg)),
            Some(_) if self.config.check_mode => {
                info!(task = %task.display_name(), "Check mode: {}", plan.msg);
                Ok(TaskResult::changed(format!("would change: {}", plan.msg)))
            }
            Some(mutation) => {
                debug!(
                    task = %task.display_name(),
                    steps = mutation.steps.len(),
                    "Applying mutation: {}",
                    mutation.summary()
                );
                modules::apply(connection, &mutation, context).await?;
                Ok(TaskResult::changed(plan.msg))
            }
        }
    }
}

fn timeout_secs(timeout: Duration) -> u64 {
    if timeout.subsec_nanos() > 0 {
        timeout.as_secs() + 1
    } else {
        timeout.as_secs()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::local::LocalConnection;
    use crate::report::TaskOutcome;

    fn executor(check_mode: bool) -> TaskExecutor {
        TaskExecutor::new(
            Arc::new(crate::connection::TransportConnector::default()),
            Arc::new(ModuleRegistry::with_builtins()),
            ExecutorConfig::default().with_check_mode(check_mode),
        )
    }

    fn session() -> NodeSession {
        NodeSession::new("localhost", Arc::new(LocalConnection::new()))
    }

    #[tokio::test]
    async fn test_changed_then_unchanged() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("motd");
        let task = Task::new("motd", "copy")
            .with_param("dest", dest.to_string_lossy().into_owned())
            .with_param("content", "hello\n");

        let exec = executor(false);
        let ctx = ModuleContext::new();
        let first = exec.execute_on(&session(), &task, &ctx).await;
        assert_eq!(first.outcome, TaskOutcome::Changed, "{:?}", first.message);
        let second = exec.execute_on(&session(), &task, &ctx).await;
        assert_eq!(second.outcome, TaskOutcome::Unchanged);
        assert_eq!(std::fs::read_to_string(&dest).unwrap(), "hello\n");
    }

    #[tokio::test]
    async fn test_check_mode_does_not_mutate() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data");
        let task = Task::new("data dir", "file")
            .with_param("path", path.to_string_lossy().into_owned())
            .with_param("state", "directory");

        let result = executor(true)
            .execute_on(&session(), &task, &ModuleContext::new())
            .await;
        assert_eq!(result.outcome, TaskOutcome::Changed);
        assert!(result.message.unwrap().starts_with("would change"));
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_unknown_action_fails() {
        let task = Task::new("x", "frob");
        let result = executor(false)
            .execute_on(&session(), &task, &ModuleContext::new())
            .await;
        assert_eq!(result.outcome, TaskOutcome::Failed);
    }

    #[tokio::test]
    async fn test_timeout_is_task_failure() {
        let dir = tempfile::tempdir().unwrap();
        let task = Task::new("slow", "command")
            .with_param("cmd", "sleep 5")
            .with_param("creates", dir.path().join("never").to_string_lossy().into_owned());

        let exec = TaskExecutor::new(
            Arc::new(crate::connection::TransportConnector::default()),
            Arc::new(ModuleRegistry::with_builtins()),
            ExecutorConfig::default().with_command_timeout(Duration::from_millis(200)),
        );
        let result = exec
            .execute_on(&session(), &task, &ModuleContext::new())
            .await;
        assert_eq!(result.outcome, TaskOutcome::Failed);
        assert!(result.message.unwrap().contains("timed out"));
    }

    #[test]
    fn test_timeout_secs_rounds_up() {
        assert_eq!(timeout_secs(Duration::from_millis(200)), 1);
        assert_eq!(timeout_secs(Duration::from_secs(300)), 300);
    }
}
