//! Group definition for the Homestead inventory.

use serde::{Deserialize, Serialize};

use super::node::{ConnectionKey, ConnectionParams};
use crate::vars::Vars;

/// A named group of nodes
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Group {
    /// Group name
    pub name: String,

    /// Direct member node names, in declaration order
    #[serde(default)]
    pub nodes: Vec<String>,

    /// Child group names, in declaration order
    #[serde(default)]
    pub children: Vec<String>,

    /// Group variables (connection keys excluded)
    #[serde(default)]
    pub vars: Vars,

    /// Connection defaults for member nodes
    #[serde(skip)]
    pub connection: ConnectionParams,
}

impl Group {
    /// Create a new group with the given name
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Add a member node, ignoring repeats
    pub fn add_node(&mut self, node: impl Into<String>) {
        let node = node.into();
        if !self.nodes.contains(&node) {
            self.nodes.push(node);
        }
    }

    /// Check if a node is a direct member
    pub fn has_node(&self, node: &str) -> bool {
        self.nodes.iter().any(|n| n == node)
    }

    /// Add a child group, ignoring repeats
    pub fn add_child(&mut self, child: impl Into<String>) {
        let child = child.into();
        if !self.children.contains(&child) {
            self.children.push(child);
        }
    }

    /// Set a variable. Connection keys become member defaults.
    pub fn set_var(&mut self, key: &str, value: serde_json::Value) -> Result<(), String> {
        match ConnectionKey::from_key(key) {
            Some(conn_key) => self.connection.set(conn_key, &value),
            None => {
                self.vars.insert(key.to_string(), value);
                Ok(())
            }
        }
    }
}
