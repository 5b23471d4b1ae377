//! Shared test utilities for the Homestead test suite.
//!
//! This module provides:
//! - `FakeNode`, an in-memory Debian-like node implementing `Connection`
//! - `FakeConnector`, handing out fake nodes with scripted connect failures
//! - Builders for inventories, executors and coordinators
//!
//! # Usage
//!
//! ```rust,ignore
//! mod common;
//! use common::*;
//! ```

#![allow(dead_code)]

use std::collections::{BTreeSet, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;

use homestead::connection::{
    CommandResult, Connection, ConnectionError, ConnectionResult, Connector, ExecuteOptions,
    FileStat, TransferOptions,
};
use homestead::executor::{ExecutorConfig, RunCoordinator, TaskExecutor};
use homestead::inventory::{Inventory, ManagedNode};
use homestead::modules::ModuleRegistry;
use homestead::retry::RetryPolicy;
use homestead::roles::RoleLibrary;

// ============================================================================
// Concurrency tracking
// ============================================================================

/// Counts connections that are open at the same time.
#[derive(Debug, Default)]
pub struct Concurrency {
    active: AtomicUsize,
    max: AtomicUsize,
}

impl Concurrency {
    fn enter(&self) {
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max.fetch_max(now, Ordering::SeqCst);
    }

    fn exit(&self) {
        self.active.fetch_sub(1, Ordering::SeqCst);
    }

    /// Highest number of simultaneously open connections seen.
    pub fn max(&self) -> usize {
        self.max.load(Ordering::SeqCst)
    }
}

// ============================================================================
// Fake node
// ============================================================================

/// An in-memory node that understands the commands the built-in modules
/// issue against a Debian host: `dpkg-query`, `apt-get`, signing key
/// installation and `rm -f`. Every other command succeeds with no output.
///
/// Restricted paths behave like root-owned files: reading, inspecting or
/// writing them without escalation fails with "Permission denied".
#[derive(Debug)]
pub struct FakeNode {
    name: String,
    packages: RwLock<BTreeSet<String>>,
    files: RwLock<HashMap<PathBuf, (Vec<u8>, u32)>>,
    dirs: RwLock<BTreeSet<PathBuf>>,
    commands: RwLock<Vec<String>>,
    fail_patterns: RwLock<Vec<String>>,
    restricted: RwLock<HashSet<PathBuf>>,
    escalated: RwLock<Vec<String>>,
    delay: RwLock<Option<Duration>>,
    concurrency: RwLock<Option<Arc<Concurrency>>>,
}

impl FakeNode {
    /// Create an empty node.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            packages: RwLock::new(BTreeSet::new()),
            files: RwLock::new(HashMap::new()),
            dirs: RwLock::new(BTreeSet::new()),
            commands: RwLock::new(Vec::new()),
            fail_patterns: RwLock::new(Vec::new()),
            restricted: RwLock::new(HashSet::new()),
            escalated: RwLock::new(Vec::new()),
            delay: RwLock::new(None),
            concurrency: RwLock::new(None),
        }
    }

    /// Mark a package as installed.
    pub fn install(&self, package: &str) {
        self.packages.write().insert(package.to_string());
    }

    /// Whether a package is installed.
    pub fn has_package(&self, package: &str) -> bool {
        self.packages.read().contains(package)
    }

    /// Installed packages, sorted.
    pub fn packages(&self) -> Vec<String> {
        self.packages.read().iter().cloned().collect()
    }

    /// Put a file on the node.
    pub fn put_file(&self, path: impl Into<PathBuf>, content: impl Into<Vec<u8>>) {
        self.files.write().insert(path.into(), (content.into(), 0o644));
    }

    /// Content of a file, if present.
    pub fn file(&self, path: impl AsRef<Path>) -> Option<Vec<u8>> {
        self.files.read().get(path.as_ref()).map(|(c, _)| c.clone())
    }

    /// Content of a file as text, if present.
    pub fn file_text(&self, path: impl AsRef<Path>) -> Option<String> {
        self.file(path)
            .map(|content| String::from_utf8_lossy(&content).into_owned())
    }

    /// Every command executed so far, in order.
    pub fn commands(&self) -> Vec<String> {
        self.commands.read().clone()
    }

    /// Commands that would change the node, leaving out read-only queries.
    pub fn mutating_commands(&self) -> Vec<String> {
        self.commands()
            .into_iter()
            .filter(|c| !c.starts_with("dpkg-query"))
            .collect()
    }

    /// Forget the command log.
    pub fn clear_commands(&self) {
        self.commands.write().clear();
    }

    /// Make every command containing `pattern` exit with status 1.
    pub fn fail_on(&self, pattern: impl Into<String>) {
        self.fail_patterns.write().push(pattern.into());
    }

    /// Only allow escalated access to `path`.
    pub fn restrict(&self, path: impl Into<PathBuf>) {
        self.restricted.write().insert(path.into());
    }

    /// File operations performed with escalation, as `"<op> <path>"`.
    pub fn escalated_operations(&self) -> Vec<String> {
        self.escalated.read().clone()
    }

    /// Mode of a file, if present.
    pub fn file_mode(&self, path: impl AsRef<Path>) -> Option<u32> {
        self.files.read().get(path.as_ref()).map(|(_, mode)| *mode)
    }

    /// Sleep this long in every command.
    pub fn set_delay(&self, delay: Duration) {
        *self.delay.write() = Some(delay);
    }

    fn track(&self, concurrency: Arc<Concurrency>) {
        concurrency.enter();
        *self.concurrency.write() = Some(concurrency);
    }

    fn check_access(
        &self,
        op: &str,
        path: &Path,
        options: Option<&TransferOptions>,
    ) -> ConnectionResult<()> {
        if options.map_or(false, |o| o.escalate) {
            self.escalated
                .write()
                .push(format!("{} {}", op, path.display()));
            return Ok(());
        }
        if self.restricted.read().contains(path) {
            return Err(ConnectionError::TransferFailed(format!(
                "Failed to {} {}: Permission denied",
                op,
                path.display()
            )));
        }
        Ok(())
    }

    fn simulate(&self, command: &str) -> CommandResult {
        let ok = |stdout: &str| CommandResult::success(stdout.to_string(), String::new());

        if self
            .fail_patterns
            .read()
            .iter()
            .any(|pattern| command.contains(pattern.as_str()))
        {
            return CommandResult::failure(1, String::new(), "simulated failure".to_string());
        }

        if command.starts_with("dpkg-query") {
            let package = last_word(command);
            return if self.has_package(&package) {
                ok("install ok installed")
            } else {
                CommandResult::failure(
                    1,
                    String::new(),
                    format!("dpkg-query: no packages found matching {}", package),
                )
            };
        }

        if let Some(rest) = command.split("apt-get install -y ").nth(1) {
            let mut packages = self.packages.write();
            for word in shell_words::split(rest).unwrap_or_default() {
                packages.insert(word);
            }
            return ok("");
        }

        if let Some(rest) = command.split("apt-get remove -y ").nth(1) {
            let mut packages = self.packages.write();
            for word in shell_words::split(rest).unwrap_or_default() {
                packages.remove(&word);
            }
            return ok("");
        }

        if let Some(rest) = command.split("gpg --dearmor -o ").nth(1) {
            let path = shell_words::split(rest)
                .ok()
                .and_then(|words| words.into_iter().next())
                .unwrap_or_default();
            self.files
                .write()
                .insert(PathBuf::from(path), (b"PGP KEY".to_vec(), 0o644));
            return ok("");
        }

        if let Some(rest) = command.strip_prefix("rm -f ") {
            for word in shell_words::split(rest).unwrap_or_default() {
                self.files.write().remove(Path::new(&word));
            }
            return ok("");
        }

        ok("")
    }
}

fn last_word(command: &str) -> String {
    shell_words::split(command)
        .ok()
        .and_then(|words| words.last().cloned())
        .unwrap_or_default()
}

#[async_trait]
impl Connection for FakeNode {
    fn identifier(&self) -> &str {
        &self.name
    }

    async fn is_alive(&self) -> bool {
        true
    }

    async fn execute(
        &self,
        command: &str,
        _options: Option<ExecuteOptions>,
    ) -> ConnectionResult<CommandResult> {
        self.commands.write().push(command.to_string());
        let delay = *self.delay.read();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        Ok(self.simulate(command))
    }

    async fn upload_content(
        &self,
        content: &[u8],
        remote_path: &Path,
        options: Option<TransferOptions>,
    ) -> ConnectionResult<()> {
        self.check_access("write", remote_path, options.as_ref())?;
        let mode = options.and_then(|o| o.mode).unwrap_or(0o644);
        self.commands
            .write()
            .push(format!("write {}", remote_path.display()));
        self.files
            .write()
            .insert(remote_path.to_path_buf(), (content.to_vec(), mode));
        Ok(())
    }

    async fn download_content(
        &self,
        remote_path: &Path,
        options: Option<TransferOptions>,
    ) -> ConnectionResult<Vec<u8>> {
        self.check_access("read", remote_path, options.as_ref())?;
        self.file(remote_path).ok_or_else(|| {
            ConnectionError::TransferFailed(format!("{} not found", remote_path.display()))
        })
    }

    async fn path_exists(
        &self,
        path: &Path,
        options: Option<TransferOptions>,
    ) -> ConnectionResult<bool> {
        self.check_access("test", path, options.as_ref())?;
        Ok(self.files.read().contains_key(path) || self.dirs.read().contains(path))
    }

    async fn stat(
        &self,
        path: &Path,
        options: Option<TransferOptions>,
    ) -> ConnectionResult<Option<FileStat>> {
        self.check_access("stat", path, options.as_ref())?;
        if let Some((content, mode)) = self.files.read().get(path) {
            return Ok(Some(FileStat {
                size: content.len() as u64,
                mode: *mode,
                is_dir: false,
                is_file: true,
            }));
        }
        if self.dirs.read().contains(path) {
            return Ok(Some(FileStat {
                size: 4096,
                mode: 0o755,
                is_dir: true,
                is_file: false,
            }));
        }
        Ok(None)
    }

    async fn close(&self) -> ConnectionResult<()> {
        if let Some(concurrency) = self.concurrency.write().take() {
            concurrency.exit();
        }
        Ok(())
    }
}

// ============================================================================
// Fake connector
// ============================================================================

/// Hands out `FakeNode`s by node name.
#[derive(Debug, Default)]
pub struct FakeConnector {
    nodes: HashMap<String, Arc<FakeNode>>,
    pending_failures: RwLock<HashMap<String, u32>>,
    unreachable: RwLock<HashSet<String>>,
    attempts: RwLock<HashMap<String, u32>>,
    concurrency: Arc<Concurrency>,
}

impl FakeConnector {
    /// Create a connector with one empty fake node per name.
    pub fn new(names: &[&str]) -> Self {
        Self {
            nodes: names
                .iter()
                .map(|name| (name.to_string(), Arc::new(FakeNode::new(*name))))
                .collect(),
            ..Self::default()
        }
    }

    /// The fake node behind `name`.
    pub fn node(&self, name: &str) -> Arc<FakeNode> {
        Arc::clone(&self.nodes[name])
    }

    /// Refuse the next `count` connection attempts to `name`.
    pub fn fail_connects(&self, name: &str, count: u32) {
        self.pending_failures.write().insert(name.to_string(), count);
    }

    /// Refuse every connection attempt to `name`.
    pub fn make_unreachable(&self, name: &str) {
        self.unreachable.write().insert(name.to_string());
    }

    /// Number of connection attempts made to `name`.
    pub fn attempts(&self, name: &str) -> u32 {
        self.attempts.read().get(name).copied().unwrap_or(0)
    }

    /// Highest number of nodes connected at the same time.
    pub fn max_concurrent(&self) -> usize {
        self.concurrency.max()
    }
}

#[async_trait]
impl Connector for FakeConnector {
    async fn connect(&self, node: &ManagedNode) -> ConnectionResult<Arc<dyn Connection>> {
        *self.attempts.write().entry(node.name.clone()).or_insert(0) += 1;

        if self.unreachable.read().contains(&node.name) {
            return Err(ConnectionError::ConnectionFailed(format!(
                "{}: connection refused",
                node.name
            )));
        }

        {
            let mut pending = self.pending_failures.write();
            if let Some(remaining) = pending.get_mut(&node.name).filter(|r| **r > 0) {
                *remaining -= 1;
                return Err(ConnectionError::ConnectionFailed(format!(
                    "{}: connection reset",
                    node.name
                )));
            }
        }

        let fake = self
            .nodes
            .get(&node.name)
            .ok_or_else(|| ConnectionError::HostNotFound(node.name.clone()))?;
        fake.track(Arc::clone(&self.concurrency));
        Ok(Arc::clone(fake) as Arc<dyn Connection>)
    }
}

// ============================================================================
// Builders
// ============================================================================

/// Inventory with every name in group `docker`.
pub fn docker_inventory(names: &[&str]) -> Inventory {
    let text = format!("[docker]\n{}\n", names.join("\n"));
    Inventory::parse_ini(&text, "test-hosts").expect("valid test inventory")
}

/// Executor configuration with fast retries.
pub fn fast_config() -> ExecutorConfig {
    ExecutorConfig::default().with_retry(RetryPolicy::constant(2, Duration::from_millis(5)))
}

/// Executor over a fake connector with the built-in modules.
pub fn executor(connector: Arc<FakeConnector>, config: ExecutorConfig) -> TaskExecutor {
    TaskExecutor::new(connector, Arc::new(ModuleRegistry::with_builtins()), config)
}

/// Coordinator over a fake connector with the built-in roles.
pub fn coordinator(connector: Arc<FakeConnector>, config: ExecutorConfig) -> RunCoordinator {
    RunCoordinator::new(executor(connector, config), RoleLibrary::with_builtins())
}

/// The reference homelab playbook: docker on every node of group `docker`.
pub const DOCKER_PLAYBOOK: &str = r#"
- name: provision docker hosts
  hosts: docker
  roles:
    - docker
"#;
