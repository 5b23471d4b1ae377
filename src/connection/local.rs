//! Local connection module
//!
//! Runs commands on the control node itself, for nodes declared with
//! `connection_transport=local`.

use async_trait::async_trait;
use std::fs;
use std::os::unix::fs::MetadataExt;
use std::path::Path;
use std::process::{Output, Stdio};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, trace};

use super::{
    exists_command, parse_stat_output, read_command, stat_command, write_stdin_command,
    CommandResult, Connection, ConnectionError, ConnectionResult, ExecuteOptions, FileStat,
    TransferOptions,
};

/// Local connection for executing commands on the current host
#[derive(Debug, Clone)]
pub struct LocalConnection {
    /// Identifier for this connection
    identifier: String,
}

impl LocalConnection {
    /// Create a new local connection named after this host
    pub fn new() -> Self {
        let identifier = hostname::get()
            .map(|h| h.to_string_lossy().to_string())
            .unwrap_or_else(|_| "localhost".to_string());

        Self { identifier }
    }

    /// Create a local connection with a custom identifier
    pub fn with_identifier(identifier: impl Into<String>) -> Self {
        Self {
            identifier: identifier.into(),
        }
    }

    fn build_command(&self, command: &str, options: &ExecuteOptions) -> Command {
        let mut cmd = if options.escalate {
            let user = options.escalate_user.as_deref().unwrap_or("root");
            let mut c = Command::new("sudo");
            c.arg("-n")
                .arg("-u")
                .arg(user)
                .arg("--")
                .arg("sh")
                .arg("-c")
                .arg(command);
            c
        } else {
            let mut c = Command::new("sh");
            c.arg("-c").arg(command);
            c
        };

        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        cmd
    }

    async fn run_raw(
        &self,
        command: &str,
        options: &ExecuteOptions,
        input: Option<&[u8]>,
    ) -> ConnectionResult<Output> {
        let mut child = self.build_command(command, options).spawn().map_err(|e| {
            ConnectionError::ExecutionFailed(format!("Failed to spawn process: {}", e))
        })?;

        // Close stdin after writing so `cat`-style consumers see EOF.
        if let Some(mut stdin) = child.stdin.take() {
            if let Some(bytes) = input {
                stdin.write_all(bytes).await.map_err(|e| {
                    ConnectionError::ExecutionFailed(format!("Failed to write stdin: {}", e))
                })?;
            }
        }

        child.wait_with_output().await.map_err(|e| {
            ConnectionError::ExecutionFailed(format!("Failed to wait for process: {}", e))
        })
    }

    async fn run(
        &self,
        command: &str,
        options: &ExecuteOptions,
        input: Option<&[u8]>,
    ) -> ConnectionResult<CommandResult> {
        let output = self.run_raw(command, options, input).await?;

        let exit_code = output.status.code().unwrap_or(-1);
        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).to_string();

        trace!(exit_code = %exit_code, stdout_len = %stdout.len(), stderr_len = %stderr.len(), "Command completed");

        if output.status.success() {
            Ok(CommandResult::success(stdout, stderr))
        } else {
            Ok(CommandResult::failure(exit_code, stdout, stderr))
        }
    }

    /// Run a file inspection command under sudo.
    async fn run_escalated_read(
        &self,
        command: &str,
        options: &TransferOptions,
    ) -> ConnectionResult<Output> {
        debug!(command = %command, "Inspecting file with escalation");
        self.run_raw(command, &options.exec_options(), None).await
    }

    fn set_mode(&self, path: &Path, mode: u32) -> ConnectionResult<()> {
        use std::os::unix::fs::PermissionsExt;

        fs::set_permissions(path, fs::Permissions::from_mode(mode)).map_err(|e| {
            ConnectionError::TransferFailed(format!(
                "Failed to set permissions on {}: {}",
                path.display(),
                e
            ))
        })
    }
}

impl Default for LocalConnection {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Connection for LocalConnection {
    fn identifier(&self) -> &str {
        &self.identifier
    }

    async fn is_alive(&self) -> bool {
        true
    }

    async fn execute(
        &self,
        command: &str,
        options: Option<ExecuteOptions>,
    ) -> ConnectionResult<CommandResult> {
        let options = options.unwrap_or_default();
        debug!(command = %command, "Executing local command");
        self.run(command, &options, None).await
    }

    async fn upload_content(
        &self,
        content: &[u8],
        remote_path: &Path,
        options: Option<TransferOptions>,
    ) -> ConnectionResult<()> {
        let options = options.unwrap_or_default();
        debug!(dst = %remote_path.display(), size = %content.len(), "Writing content locally");

        if options.escalate {
            let exec = ExecuteOptions::new().with_escalation(options.escalate_user.clone());
            let result = self
                .run(
                    &write_stdin_command(remote_path, &options),
                    &exec,
                    Some(content),
                )
                .await?;
            if !result.success {
                return Err(ConnectionError::TransferFailed(format!(
                    "Failed to write to {}: {}",
                    remote_path.display(),
                    result.stderr.trim()
                )));
            }
            return Ok(());
        }

        if options.create_dirs {
            if let Some(parent) = remote_path.parent() {
                fs::create_dir_all(parent).map_err(|e| {
                    ConnectionError::TransferFailed(format!(
                        "Failed to create directory {}: {}",
                        parent.display(),
                        e
                    ))
                })?;
            }
        }

        fs::write(remote_path, content).map_err(|e| {
            ConnectionError::TransferFailed(format!(
                "Failed to write to {}: {}",
                remote_path.display(),
                e
            ))
        })?;

        if let Some(mode) = options.mode {
            self.set_mode(remote_path, mode)?;
        }

        Ok(())
    }

    async fn download_content(
        &self,
        remote_path: &Path,
        options: Option<TransferOptions>,
    ) -> ConnectionResult<Vec<u8>> {
        debug!(src = %remote_path.display(), "Reading file content locally");

        if let Some(options) = options.filter(|o| o.escalate) {
            let output = self
                .run_escalated_read(&read_command(remote_path), &options)
                .await?;
            if !output.status.success() {
                return Err(ConnectionError::TransferFailed(format!(
                    "Failed to read {}: {}",
                    remote_path.display(),
                    String::from_utf8_lossy(&output.stderr).trim()
                )));
            }
            return Ok(output.stdout);
        }

        fs::read(remote_path).map_err(|e| {
            ConnectionError::TransferFailed(format!(
                "Failed to read {}: {}",
                remote_path.display(),
                e
            ))
        })
    }

    async fn path_exists(
        &self,
        path: &Path,
        options: Option<TransferOptions>,
    ) -> ConnectionResult<bool> {
        if let Some(options) = options.filter(|o| o.escalate) {
            let output = self
                .run_escalated_read(&exists_command(path), &options)
                .await?;
            return Ok(output.status.success());
        }
        Ok(path.exists())
    }

    async fn stat(
        &self,
        path: &Path,
        options: Option<TransferOptions>,
    ) -> ConnectionResult<Option<FileStat>> {
        if let Some(options) = options.filter(|o| o.escalate) {
            let output = self.run_escalated_read(&stat_command(path), &options).await?;
            if !output.status.success() {
                return Err(ConnectionError::TransferFailed(format!(
                    "Failed to stat {}: {}",
                    path.display(),
                    String::from_utf8_lossy(&output.stderr).trim()
                )));
            }
            return parse_stat_output(path, &String::from_utf8_lossy(&output.stdout));
        }

        let metadata = match fs::metadata(path) {
            Ok(metadata) => metadata,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(ConnectionError::TransferFailed(format!(
                    "Failed to stat {}: {}",
                    path.display(),
                    e
                )))
            }
        };

        Ok(Some(FileStat {
            size: metadata.len(),
            mode: metadata.mode() & 0o7777,
            is_dir: metadata.is_dir(),
            is_file: metadata.is_file(),
        }))
    }

    async fn close(&self) -> ConnectionResult<()> {
        Ok(())
    }
}
