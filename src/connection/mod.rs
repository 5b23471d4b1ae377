//! Connection layer for managed node communication.
//!
//! Modules never care how commands reach a node. They talk to a
//! [`Connection`], which is either a local shell on the control node or an
//! OpenSSH client session. The task executor obtains connections through a
//! [`Connector`], which is also the seam tests use to substitute scripted
//! nodes.
//!
//! # Example
//!
//! ```rust,ignore
//! use homestead::connection::{Connector, ExecuteOptions, TransportConnector};
//!
//! let connector = TransportConnector::new(SshSettings::default());
//! let conn = connector.connect(&node).await?;
//!
//! let result = conn.execute("uname -a", None).await?;
//! println!("{}", result.stdout);
//!
//! let opts = ExecuteOptions::new().with_escalation(Some("root".into()));
//! conn.execute("systemctl restart docker", Some(opts)).await?;
//! ```

/// Local execution connection implementation.
pub mod local;

/// OpenSSH client connection implementation.
pub mod ssh;

use async_trait::async_trait;
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;

use crate::inventory::{ManagedNode, Transport};

pub use local::LocalConnection;
pub use ssh::{SshConnection, SshSettings};

/// Errors that can occur during connection operations.
#[derive(Error, Debug)]
pub enum ConnectionError {
    /// Failed to establish the connection.
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Authentication was rejected by the node.
    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    /// The command could not be run (distinct from a non-zero exit code).
    #[error("Command execution failed: {0}")]
    ExecutionFailed(String),

    /// Writing or reading a file failed.
    #[error("File transfer failed: {0}")]
    TransferFailed(String),

    /// Connection or operation timed out.
    #[error("Connection timeout after {0} seconds")]
    Timeout(u64),

    /// Node address could not be resolved.
    #[error("Host not found: {0}")]
    HostNotFound(String),

    /// Connection was closed unexpectedly.
    #[error("Connection closed")]
    ConnectionClosed,

    /// I/O error during connection operations.
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

impl ConnectionError {
    /// Whether a fresh connection attempt might succeed.
    ///
    /// Authentication and name resolution failures are not retried.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ConnectionError::ConnectionFailed(_)
                | ConnectionError::Timeout(_)
                | ConnectionError::ConnectionClosed
        )
    }
}

/// Result type for connection operations.
pub type ConnectionResult<T> = Result<T, ConnectionError>;

/// The result of executing a command on a connection.
///
/// # Example
///
/// ```rust
/// use homestead::connection::CommandResult;
///
/// let result = CommandResult::success("Hello".into(), String::new());
/// assert!(result.success);
/// assert_eq!(result.exit_code, 0);
///
/// let failed = CommandResult::failure(1, String::new(), "error".into());
/// assert!(!failed.success);
/// ```
#[derive(Debug, Clone)]
pub struct CommandResult {
    /// Exit code of the command.
    pub exit_code: i32,
    /// Content written to standard output.
    pub stdout: String,
    /// Content written to standard error.
    pub stderr: String,
    /// `true` if `exit_code == 0`.
    pub success: bool,
}

impl CommandResult {
    /// Create a new successful command result
    pub fn success(stdout: String, stderr: String) -> Self {
        Self {
            exit_code: 0,
            stdout,
            stderr,
            success: true,
        }
    }

    /// Create a new failed command result
    pub fn failure(exit_code: i32, stdout: String, stderr: String) -> Self {
        Self {
            exit_code,
            stdout,
            stderr,
            success: false,
        }
    }

    /// Get the combined output (stdout + stderr)
    pub fn combined_output(&self) -> String {
        if self.stderr.is_empty() {
            self.stdout.clone()
        } else if self.stdout.is_empty() {
            self.stderr.clone()
        } else {
            format!("{}\n{}", self.stdout, self.stderr)
        }
    }
}

/// Options for command execution
#[derive(Debug, Clone, Default)]
pub struct ExecuteOptions {
    /// Run command with privilege escalation
    pub escalate: bool,
    /// User to escalate to (default: root)
    pub escalate_user: Option<String>,
}

impl ExecuteOptions {
    /// Create new execute options
    pub fn new() -> Self {
        Self::default()
    }

    /// Enable privilege escalation
    pub fn with_escalation(mut self, user: Option<String>) -> Self {
        self.escalate = true;
        self.escalate_user = user;
        self
    }
}

/// Options for file transfer and inspection
#[derive(Debug, Clone, Default)]
pub struct TransferOptions {
    /// File mode (permissions) to set
    pub mode: Option<u32>,
    /// Create parent directories if they don't exist
    pub create_dirs: bool,
    /// Read, stat or write the file with privilege escalation
    pub escalate: bool,
    /// User to escalate to (default: root)
    pub escalate_user: Option<String>,
}

impl TransferOptions {
    /// Create new transfer options
    pub fn new() -> Self {
        Self::default()
    }

    /// Set file mode
    pub fn with_mode(mut self, mode: u32) -> Self {
        self.mode = Some(mode);
        self
    }

    /// Enable directory creation
    pub fn with_create_dirs(mut self) -> Self {
        self.create_dirs = true;
        self
    }

    /// Enable privilege escalation
    pub fn with_escalation(mut self, user: Option<String>) -> Self {
        self.escalate = true;
        self.escalate_user = user;
        self
    }

    /// Execute options carrying the same escalation
    pub fn exec_options(&self) -> ExecuteOptions {
        ExecuteOptions {
            escalate: self.escalate,
            escalate_user: self.escalate_user.clone(),
            ..Default::default()
        }
    }
}

/// File metadata relevant to idempotence checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileStat {
    /// File size in bytes
    pub size: u64,
    /// Permission bits (`mode & 0o7777`)
    pub mode: u32,
    /// Is this a directory?
    pub is_dir: bool,
    /// Is this a regular file?
    pub is_file: bool,
}

/// The main connection trait that all transport implementations must implement
#[async_trait]
pub trait Connection: Send + Sync {
    /// Get the connection identifier (node name or address)
    fn identifier(&self) -> &str;

    /// Check if the connection is still alive
    async fn is_alive(&self) -> bool;

    /// Execute a shell command on the node
    async fn execute(
        &self,
        command: &str,
        options: Option<ExecuteOptions>,
    ) -> ConnectionResult<CommandResult>;

    /// Write content to a file on the node
    async fn upload_content(
        &self,
        content: &[u8],
        remote_path: &Path,
        options: Option<TransferOptions>,
    ) -> ConnectionResult<()>;

    /// Read a file from the node
    async fn download_content(
        &self,
        remote_path: &Path,
        options: Option<TransferOptions>,
    ) -> ConnectionResult<Vec<u8>>;

    /// Check if a path exists on the node
    async fn path_exists(
        &self,
        path: &Path,
        options: Option<TransferOptions>,
    ) -> ConnectionResult<bool>;

    /// Stat a path, `None` when it does not exist
    async fn stat(
        &self,
        path: &Path,
        options: Option<TransferOptions>,
    ) -> ConnectionResult<Option<FileStat>>;

    /// Close the connection
    async fn close(&self) -> ConnectionResult<()>;
}

/// Opens connections to managed nodes.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Establish a connection to `node`.
    async fn connect(&self, node: &ManagedNode) -> ConnectionResult<Arc<dyn Connection>>;
}

/// Default connector choosing a transport from the node definition.
#[derive(Debug, Clone, Default)]
pub struct TransportConnector {
    ssh: SshSettings,
}

impl TransportConnector {
    /// Create a connector using the given SSH settings.
    pub fn new(ssh: SshSettings) -> Self {
        Self { ssh }
    }
}

#[async_trait]
impl Connector for TransportConnector {
    async fn connect(&self, node: &ManagedNode) -> ConnectionResult<Arc<dyn Connection>> {
        match node.transport {
            Transport::Local => Ok(Arc::new(LocalConnection::with_identifier(&node.name))),
            Transport::Ssh => {
                let conn = SshConnection::connect(node, &self.ssh).await?;
                Ok(Arc::new(conn))
            }
        }
    }
}

/// Wrap `command` for privilege escalation when requested.
///
/// The command is handed to `sh -c` under `sudo -n`, so it must not prompt.
pub(crate) fn escalate_command(command: &str, escalate: bool, user: Option<&str>) -> String {
    if !escalate {
        return command.to_string();
    }
    format!(
        "sudo -n -u {} -- sh -c {}",
        shell_words::quote(user.unwrap_or("root")),
        shell_words::quote(command)
    )
}

/// Shell snippet writing stdin to `path`, used when a plain file write is
/// not possible (remote nodes, escalated writes).
pub(crate) fn write_stdin_command(path: &Path, options: &TransferOptions) -> String {
    let target = shell_words::quote(&path.to_string_lossy()).into_owned();
    let mut parts = Vec::new();
    if options.create_dirs {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            parts.push(format!(
                "mkdir -p {}",
                shell_words::quote(&parent.to_string_lossy())
            ));
        }
    }
    parts.push(format!("cat > {}", target));
    if let Some(mode) = options.mode {
        parts.push(format!("chmod {:o} {}", mode, target));
    }
    parts.join(" && ")
}

/// Shell command printing the content of `path`.
pub(crate) fn read_command(path: &Path) -> String {
    format!("cat {}", shell_words::quote(&path.to_string_lossy()))
}

/// Shell command succeeding when `path` exists.
pub(crate) fn exists_command(path: &Path) -> String {
    format!("test -e {}", shell_words::quote(&path.to_string_lossy()))
}

/// Shell command printing `size mode kind` for `path`, nothing when missing.
pub(crate) fn stat_command(path: &Path) -> String {
    let quoted = shell_words::quote(&path.to_string_lossy()).into_owned();
    format!("if [ -e {0} ]; then stat -c '%s %a %F' {0}; fi", quoted)
}

/// Parse the output of [`stat_command`]; `Ok(None)` for a missing path.
pub(crate) fn parse_stat_output(path: &Path, stdout: &str) -> ConnectionResult<Option<FileStat>> {
    if stdout.trim().is_empty() {
        return Ok(None);
    }
    parse_stat(stdout).map(Some).ok_or_else(|| {
        ConnectionError::TransferFailed(format!(
            "Unexpected stat output for {}: {}",
            path.display(),
            stdout.trim()
        ))
    })
}

fn parse_stat(line: &str) -> Option<FileStat> {
    let mut parts = line.trim().splitn(3, ' ');
    let size = parts.next()?.parse().ok()?;
    let mode = u32::from_str_radix(parts.next()?, 8).ok()?;
    let kind = parts.next()?;
    Some(FileStat {
        size,
        mode,
        is_dir: kind == "directory",
        is_file: kind.starts_with("regular"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_parse_stat() {
        assert_eq!(
            parse_stat("220 644 regular file\n"),
            Some(FileStat {
                size: 220,
                mode: 0o644,
                is_dir: false,
                is_file: true,
            })
        );
        assert_eq!(
            parse_stat("4096 755 directory"),
            Some(FileStat {
                size: 4096,
                mode: 0o755,
                is_dir: true,
                is_file: false,
            })
        );
        assert_eq!(parse_stat("garbage"), None);

        let path = Path::new("/etc/sudoers.d/deploy");
        assert_eq!(parse_stat_output(path, "\n").unwrap(), None);
        assert!(parse_stat_output(path, "garbage").is_err());
    }

    #[test]
    fn test_read_commands_quote_paths() {
        let path = Path::new("/srv/my media/index");
        assert_eq!(read_command(path), "cat '/srv/my media/index'");
        assert_eq!(exists_command(path), "test -e '/srv/my media/index'");
        assert_eq!(
            stat_command(path),
            "if [ -e '/srv/my media/index' ]; then stat -c '%s %a %F' '/srv/my media/index'; fi"
        );
    }

    #[test]
    fn test_transfer_escalation_carries_to_exec_options() {
        let exec = TransferOptions::new()
            .with_escalation(Some("deploy".into()))
            .exec_options();
        assert!(exec.escalate);
        assert_eq!(exec.escalate_user.as_deref(), Some("deploy"));
        assert!(!TransferOptions::new().exec_options().escalate);
    }

    #[test]
    fn test_retryable_errors() {
        assert!(ConnectionError::Timeout(10).is_retryable());
        assert!(ConnectionError::ConnectionFailed("refused".into()).is_retryable());
        assert!(!ConnectionError::AuthenticationFailed("denied".into()).is_retryable());
        assert!(!ConnectionError::HostNotFound("srv9".into()).is_retryable());
    }

    #[test]
    fn test_escalate_command() {
        assert_eq!(escalate_command("id -u", false, None), "id -u");
        assert_eq!(
            escalate_command("id -u", true, None),
            "sudo -n -u root -- sh -c 'id -u'"
        );
        assert_eq!(
            escalate_command("whoami", true, Some("deploy")),
            "sudo -n -u deploy -- sh -c whoami"
        );
    }

    #[test]
    fn test_write_stdin_command() {
        let path = PathBuf::from("/etc/apt/sources.list.d/docker.list");
        let options = TransferOptions::new().with_create_dirs().with_mode(0o644);
        assert_eq!(
            write_stdin_command(&path, &options),
            "mkdir -p /etc/apt/sources.list.d && cat > /etc/apt/sources.list.d/docker.list && chmod 644 /etc/apt/sources.list.d/docker.list"
        );
    }

    #[test]
    fn test_combined_output() {
        let result = CommandResult::failure(1, "out".into(), "err".into());
        assert_eq!(result.combined_output(), "out\nerr");
    }
}
