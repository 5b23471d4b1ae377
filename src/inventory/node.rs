//! Managed node definition for the Homestead inventory.
//!
//! A [`ManagedNode`] is a machine the control node provisions. Besides its
//! name it carries the connection parameters used to reach it, free-form
//! variables and the groups it belongs to.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use crate::vars::Vars;

/// Default SSH port.
pub const DEFAULT_PORT: u16 = 22;

static HOSTNAME: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[A-Za-z0-9]([A-Za-z0-9-]{0,61}[A-Za-z0-9])?(\.[A-Za-z0-9]([A-Za-z0-9-]{0,61}[A-Za-z0-9])?)*\.?$")
        .expect("valid hostname regex")
});

/// How commands reach a node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    /// OpenSSH client (default)
    #[default]
    Ssh,
    /// Shell on the control node
    Local,
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Transport::Ssh => write!(f, "ssh"),
            Transport::Local => write!(f, "local"),
        }
    }
}

impl FromStr for Transport {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "ssh" => Ok(Transport::Ssh),
            "local" => Ok(Transport::Local),
            other => Err(format!("unknown transport '{}'", other)),
        }
    }
}

/// Connection parameters as declared, before defaults are applied.
///
/// `None` means "not declared here", which lets a later declaration or a
/// group default fill the gap without counting as a conflict.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectionParams {
    /// Address to connect to
    pub address: Option<String>,
    /// Login user
    pub user: Option<String>,
    /// SSH port
    pub port: Option<u16>,
    /// Transport
    pub transport: Option<Transport>,
}

/// Connection parameter a variable key maps to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionKey {
    /// `connection_address` / `ansible_host`
    Address,
    /// `connection_user` / `ansible_user`
    User,
    /// `connection_port` / `ansible_port`
    Port,
    /// `connection_transport` / `ansible_connection`
    Transport,
}

impl ConnectionKey {
    /// Recognize a connection key, including the Ansible aliases.
    pub fn from_key(key: &str) -> Option<Self> {
        match key {
            "connection_address" | "ansible_host" => Some(Self::Address),
            "connection_user" | "ansible_user" => Some(Self::User),
            "connection_port" | "ansible_port" => Some(Self::Port),
            "connection_transport" | "ansible_connection" => Some(Self::Transport),
            _ => None,
        }
    }
}

impl ConnectionParams {
    /// Set the parameter named by `key` from `value`.
    ///
    /// Returns an error message for values of the wrong shape.
    pub fn set(&mut self, key: ConnectionKey, value: &Value) -> Result<(), String> {
        match key {
            ConnectionKey::Address => self.address = Some(scalar_text(value)?),
            ConnectionKey::User => self.user = Some(scalar_text(value)?),
            ConnectionKey::Port => {
                let port = match value {
                    Value::Number(n) => n.as_u64().and_then(|p| u16::try_from(p).ok()),
                    Value::String(s) => s.trim().parse::<u16>().ok(),
                    _ => None,
                };
                self.port = Some(port.ok_or_else(|| {
                    format!("non-numeric port '{}'", scalar_text(value).unwrap_or_default())
                })?);
            }
            ConnectionKey::Transport => {
                self.transport = Some(scalar_text(value)?.parse::<Transport>()?);
            }
        }
        Ok(())
    }

    /// Merge a later declaration, failing on conflicting values.
    pub fn merge(&mut self, other: &ConnectionParams) -> Result<(), String> {
        fn merge_field<T: PartialEq + Clone + fmt::Debug>(
            field: &str,
            mine: &mut Option<T>,
            theirs: &Option<T>,
        ) -> Result<(), String> {
            match (mine.as_ref(), theirs) {
                (Some(a), Some(b)) if a != b => {
                    Err(format!("{} {:?} conflicts with {:?}", field, a, b))
                }
                (None, Some(b)) => {
                    *mine = Some(b.clone());
                    Ok(())
                }
                _ => Ok(()),
            }
        }

        merge_field("address", &mut self.address, &other.address)?;
        merge_field("user", &mut self.user, &other.user)?;
        merge_field("port", &mut self.port, &other.port)?;
        merge_field("transport", &mut self.transport, &other.transport)?;
        Ok(())
    }

    /// Fill parameters not declared on the node from `defaults`.
    pub fn fill_from(&mut self, defaults: &ConnectionParams) {
        if self.address.is_none() {
            self.address = defaults.address.clone();
        }
        if self.user.is_none() {
            self.user = defaults.user.clone();
        }
        if self.port.is_none() {
            self.port = defaults.port;
        }
        if self.transport.is_none() {
            self.transport = defaults.transport;
        }
    }
}

fn scalar_text(value: &Value) -> Result<String, String> {
    match value {
        Value::String(s) => Ok(s.clone()),
        Value::Number(n) => Ok(n.to_string()),
        Value::Bool(b) => Ok(b.to_string()),
        other => Err(format!("expected a scalar, found {}", other)),
    }
}

/// A managed node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManagedNode {
    /// Node name as written in the inventory
    pub name: String,

    /// Connection address, the name is used when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,

    /// Login user, the SSH client default when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,

    /// SSH port
    #[serde(default = "default_port")]
    pub port: u16,

    /// Transport
    #[serde(default)]
    pub transport: Transport,

    /// Node variables
    #[serde(default)]
    pub vars: Vars,

    /// Groups this node belongs to
    #[serde(default)]
    pub groups: BTreeSet<String>,
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

impl ManagedNode {
    /// Create a new node with default connection parameters
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            address: None,
            user: None,
            port: DEFAULT_PORT,
            transport: Transport::default(),
            vars: Vars::new(),
            groups: BTreeSet::new(),
        }
    }

    /// Create a node from resolved connection parameters
    pub fn from_params(name: impl Into<String>, params: &ConnectionParams) -> Self {
        Self {
            address: params.address.clone(),
            user: params.user.clone(),
            port: params.port.unwrap_or(DEFAULT_PORT),
            transport: params.transport.unwrap_or_default(),
            ..Self::new(name)
        }
    }

    /// Address used to reach the node
    pub fn connect_address(&self) -> &str {
        self.address.as_deref().unwrap_or(&self.name)
    }

    /// Whether the node can be reached at all.
    ///
    /// Local nodes always can. Remote nodes need an explicit address or a
    /// name that is a syntactically valid host name.
    pub fn is_resolvable(&self) -> bool {
        match self.transport {
            Transport::Local => true,
            Transport::Ssh => match &self.address {
                Some(address) => !address.trim().is_empty(),
                None => is_valid_hostname(&self.name),
            },
        }
    }

    /// Check if the node belongs to a group
    pub fn in_group(&self, group: &str) -> bool {
        self.groups.contains(group)
    }
}

impl fmt::Display for ManagedNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)?;
        if let Some(address) = &self.address {
            write!(f, " ({}", address)?;
            if self.port != DEFAULT_PORT {
                write!(f, ":{}", self.port)?;
            }
            write!(f, ")")?;
        }
        Ok(())
    }
}

/// Whether `name` is a syntactically valid host name or IPv4 address.
pub fn is_valid_hostname(name: &str) -> bool {
    name.len() <= 253 && HOSTNAME.is_match(name)
}
