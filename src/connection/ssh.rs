//! SSH connection module
//!
//! Drives the system OpenSSH client through `tokio::process`. Every call is
//! a separate `ssh` invocation multiplexed over one control master, so a
//! session costs a single handshake. Authentication relies on the user's
//! agent and `~/.ssh/config`; `BatchMode` keeps the client from prompting.

use async_trait::async_trait;
use serde::{de, Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::process::{Output, Stdio};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, trace};

use super::{
    escalate_command, exists_command, parse_stat_output, read_command, stat_command,
    write_stdin_command, CommandResult, Connection, ConnectionError, ConnectionResult,
    ExecuteOptions, FileStat, TransferOptions,
};
use crate::inventory::ManagedNode;

/// Exit status the OpenSSH client reserves for its own failures.
const SSH_FAILURE_STATUS: i32 = 255;

/// Settings shared by every SSH connection of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SshSettings {
    /// Path or name of the `ssh` binary
    pub executable: String,
    /// Extra arguments passed before the destination
    #[serde(deserialize_with = "scalar_args")]
    pub extra_args: Vec<String>,
    /// Handshake timeout in seconds (`ConnectTimeout`)
    pub connect_timeout: u64,
    /// How long the control master outlives the last session
    pub control_persist: String,
    /// Directory for control sockets, defaults to the temp dir
    pub control_dir: Option<PathBuf>,
}

impl Default for SshSettings {
    fn default() -> Self {
        Self {
            executable: "ssh".to_string(),
            extra_args: Vec::new(),
            connect_timeout: 30,
            control_persist: "60s".to_string(),
            control_dir: None,
        }
    }
}

/// Read a list of arguments, accepting numbers and booleans as text.
///
/// YAML reads flags such as `-4` as integers.
fn scalar_args<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<String>, D::Error> {
    Vec::<Value>::deserialize(deserializer)?
        .into_iter()
        .map(|value| match value {
            Value::String(s) => Ok(s),
            Value::Number(n) => Ok(n.to_string()),
            Value::Bool(b) => Ok(b.to_string()),
            other => Err(de::Error::custom(format!(
                "ssh argument must be a string, found {}",
                other
            ))),
        })
        .collect()
}

/// Connection to a managed node over the OpenSSH client.
#[derive(Debug, Clone)]
pub struct SshConnection {
    identifier: String,
    executable: String,
    connect_timeout: u64,
    /// Options and destination, reused by every invocation
    base_args: Vec<String>,
}

impl SshConnection {
    /// Open a connection and verify the node is reachable.
    pub async fn connect(node: &ManagedNode, settings: &SshSettings) -> ConnectionResult<Self> {
        let control_dir = settings
            .control_dir
            .clone()
            .unwrap_or_else(|| std::env::temp_dir().join("homestead-ssh"));
        tokio::fs::create_dir_all(&control_dir).await?;

        let conn = Self {
            identifier: node.name.clone(),
            executable: settings.executable.clone(),
            connect_timeout: settings.connect_timeout,
            base_args: Self::base_args(node, settings, &control_dir),
        };

        debug!(node = %node.name, address = %node.connect_address(), "Opening SSH session");
        let output = conn.invoke("true", None).await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(
                classify_ssh_failure(&stderr, conn.connect_timeout).unwrap_or_else(|| {
                    ConnectionError::ConnectionFailed(stderr.trim().to_string())
                }),
            );
        }

        Ok(conn)
    }

    fn base_args(node: &ManagedNode, settings: &SshSettings, control_dir: &Path) -> Vec<String> {
        let mut args = vec![
            "-o".to_string(),
            "BatchMode=yes".to_string(),
            "-o".to_string(),
            format!("ConnectTimeout={}", settings.connect_timeout),
            "-o".to_string(),
            "ControlMaster=auto".to_string(),
            "-o".to_string(),
            format!("ControlPersist={}", settings.control_persist),
            "-o".to_string(),
            format!("ControlPath={}", control_dir.join("%C").display()),
            "-p".to_string(),
            node.port.to_string(),
        ];
        if let Some(user) = &node.user {
            args.push("-l".to_string());
            args.push(user.clone());
        }
        args.extend(settings.extra_args.iter().cloned());
        args.push(node.connect_address().to_string());
        args
    }

    async fn invoke(&self, remote: &str, input: Option<&[u8]>) -> ConnectionResult<Output> {
        let mut cmd = Command::new(&self.executable);
        cmd.args(&self.base_args)
            .arg("--")
            .arg(remote)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| {
            ConnectionError::ExecutionFailed(format!("Failed to spawn {}: {}", self.executable, e))
        })?;

        if let Some(mut stdin) = child.stdin.take() {
            if let Some(bytes) = input {
                stdin.write_all(bytes).await.map_err(|e| {
                    ConnectionError::TransferFailed(format!("Failed to write stdin: {}", e))
                })?;
            }
        }

        child.wait_with_output().await.map_err(|e| {
            ConnectionError::ExecutionFailed(format!("Failed to wait for ssh: {}", e))
        })
    }

    /// Run `remote`, surfacing transport failures as errors.
    async fn run(&self, remote: &str, input: Option<&[u8]>) -> ConnectionResult<Output> {
        let output = self.invoke(remote, input).await?;
        if output.status.code() == Some(SSH_FAILURE_STATUS) {
            let stderr = String::from_utf8_lossy(&output.stderr);
            if let Some(err) = classify_ssh_failure(&stderr, self.connect_timeout) {
                return Err(err);
            }
        }
        Ok(output)
    }
}

/// Build the remote shell command line for `command` under `options`.
fn remote_command(command: &str, options: &ExecuteOptions) -> String {
    escalate_command(command, options.escalate, options.escalate_user.as_deref())
}

/// Build the remote command line for a file inspection under `options`.
fn remote_read(command: &str, options: Option<TransferOptions>) -> String {
    remote_command(command, &options.unwrap_or_default().exec_options())
}

/// Map OpenSSH client diagnostics to a connection error.
///
/// Returns `None` when the output does not look like a client failure, in
/// which case a 255 exit came from the remote command itself.
fn classify_ssh_failure(stderr: &str, connect_timeout: u64) -> Option<ConnectionError> {
    let message = stderr.trim().to_string();
    if message.contains("Permission denied") || message.contains("Host key verification failed")
    {
        Some(ConnectionError::AuthenticationFailed(message))
    } else if message.contains("Could not resolve hostname") {
        Some(ConnectionError::HostNotFound(message))
    } else if message.contains("timed out") {
        Some(ConnectionError::Timeout(connect_timeout))
    } else if message.contains("Connection refused")
        || message.contains("No route to host")
        || message.contains("Network is unreachable")
    {
        Some(ConnectionError::ConnectionFailed(message))
    } else if message.contains("closed by remote host")
        || message.contains("Broken pipe")
        || message.contains("Connection reset")
    {
        Some(ConnectionError::ConnectionClosed)
    } else {
        None
    }
}

#[async_trait]
impl Connection for SshConnection {
    fn identifier(&self) -> &str {
        &self.identifier
    }

    async fn is_alive(&self) -> bool {
        matches!(self.run("true", None).await, Ok(output) if output.status.success())
    }

    async fn execute(
        &self,
        command: &str,
        options: Option<ExecuteOptions>,
    ) -> ConnectionResult<CommandResult> {
        let options = options.unwrap_or_default();
        let remote = remote_command(command, &options);
        debug!(node = %self.identifier, command = %command, "Executing remote command");

        let output = self.run(&remote, None).await?;

        let exit_code = output.status.code().unwrap_or(-1);
        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).to_string();
        trace!(exit_code = %exit_code, stdout_len = %stdout.len(), "Remote command completed");

        if output.status.success() {
            Ok(CommandResult::success(stdout, stderr))
        } else {
            Ok(CommandResult::failure(exit_code, stdout, stderr))
        }
    }

    async fn upload_content(
        &self,
        content: &[u8],
        remote_path: &Path,
        options: Option<TransferOptions>,
    ) -> ConnectionResult<()> {
        let options = options.unwrap_or_default();
        debug!(node = %self.identifier, dst = %remote_path.display(), size = %content.len(), "Uploading content");

        let remote = escalate_command(
            &write_stdin_command(remote_path, &options),
            options.escalate,
            options.escalate_user.as_deref(),
        );
        let output = self.run(&remote, Some(content)).await?;
        if !output.status.success() {
            return Err(ConnectionError::TransferFailed(format!(
                "Failed to write to {}: {}",
                remote_path.display(),
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(())
    }

    async fn download_content(
        &self,
        remote_path: &Path,
        options: Option<TransferOptions>,
    ) -> ConnectionResult<Vec<u8>> {
        let remote = remote_read(&read_command(remote_path), options);
        let output = self.run(&remote, None).await?;
        if !output.status.success() {
            return Err(ConnectionError::TransferFailed(format!(
                "Failed to read {}: {}",
                remote_path.display(),
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(output.stdout)
    }

    async fn path_exists(
        &self,
        path: &Path,
        options: Option<TransferOptions>,
    ) -> ConnectionResult<bool> {
        let remote = remote_read(&exists_command(path), options);
        Ok(self.run(&remote, None).await?.status.success())
    }

    async fn stat(
        &self,
        path: &Path,
        options: Option<TransferOptions>,
    ) -> ConnectionResult<Option<FileStat>> {
        let remote = remote_read(&stat_command(path), options);
        let output = self.run(&remote, None).await?;
        if !output.status.success() {
            return Err(ConnectionError::TransferFailed(format!(
                "Failed to stat {}: {}",
                path.display(),
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        parse_stat_output(path, &String::from_utf8_lossy(&output.stdout))
    }

    async fn close(&self) -> ConnectionResult<()> {
        let status = Command::new(&self.executable)
            .args(["-O", "exit"])
            .args(&self.base_args)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await?;
        trace!(node = %self.identifier, ?status, "Closed control master");
        Ok(())
    }
}
