//! # Homestead - idempotent playbooks for homelab servers
//!
//! Homestead applies YAML playbooks to the machines of an inventory. Every
//! task is idempotent: it observes the node first and only changes what
//! differs from the desired state, so running a playbook twice reports
//! nothing changed the second time.
//!
//! ## Core Concepts
//!
//! - **Inventory**: managed nodes, organized into groups
//! - **Playbook**: ordered plays, each targeting a host pattern
//! - **Tasks**: one action (`package`, `file`, ...) with parameters
//! - **Roles**: reusable task lists with default variables
//! - **Modules**: the actions, split into a `plan` and an `apply` half
//! - **Connections**: OpenSSH or local shell transport to a node
//!
//! ## Architecture Overview
//!
//! ```text
//!  Inventory ─┐
//!             ├─> Playbook::resolve ──> RunCoordinator ──> TaskExecutor ──> Module::plan/apply
//!  Playbook ──┘   (roles + vars)        (per-node workers)   (connection)
//!                                              │
//!                                              └──> RunReport
//! ```
//!
//! ## Quick Example
//!
//! ```rust,ignore
//! use homestead::prelude::*;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let inventory = Inventory::load("hosts")?;
//!     let library = RoleLibrary::with_builtins();
//!     let playbook = PlaybookLoader::new(&library).load("site.yml")?;
//!
//!     let executor = TaskExecutor::new(
//!         Arc::new(TransportConnector::default()),
//!         Arc::new(ModuleRegistry::with_builtins()),
//!         ExecutorConfig::default().with_forks(10),
//!     );
//!     let report = RunCoordinator::new(executor, library)
//!         .run(&playbook, &inventory)
//!         .await?;
//!
//!     println!("success: {}", report.success());
//!     Ok(())
//! }
//! ```

#![warn(clippy::all)]
#![allow(clippy::module_name_repetitions)]

/// Convenient re-exports of commonly used types and traits.
pub mod prelude {
    pub use crate::callback::{NullCallback, RunCallback};
    pub use crate::connection::{
        CommandResult, Connection, ConnectionError, Connector, ExecuteOptions, LocalConnection,
        SshConnection, SshSettings, TransportConnector,
    };
    pub use crate::error::{Error, Result};
    pub use crate::executor::{ExecutorConfig, RunCoordinator, TaskExecutor};
    pub use crate::inventory::{Group, Inventory, ManagedNode};
    pub use crate::modules::{Module, ModuleContext, ModuleRegistry, Plan};
    pub use crate::playbook::{Play, Playbook, PlaybookLoader, Task};
    pub use crate::report::{RunReport, TaskOutcome, TaskRecord};
    pub use crate::roles::{Role, RoleLibrary};
    pub use crate::vars::Vars;
}

// ============================================================================
// Core Modules
// ============================================================================

/// Error types and result aliases.
pub mod error;

/// Variables and `{{ name }}` substitution.
pub mod vars;

/// Retry policies for transient failures.
pub mod retry;

/// Layered configuration.
pub mod config;

// ============================================================================
// Loading
// ============================================================================

/// Managed nodes and groups.
pub mod inventory;

/// Playbooks, plays and tasks.
pub mod playbook;

/// Built-in and on-disk roles.
pub mod roles;

// ============================================================================
// Execution
// ============================================================================

/// Transports to managed nodes.
pub mod connection;

/// Idempotent actions.
pub mod modules;

/// Task execution and run coordination.
pub mod executor;

/// Run events.
pub mod callback;

/// Run reports.
pub mod report;

pub use error::{Error, Result};
