//! Inventory management for Homestead.
//!
//! This module provides:
//! - Loading INI and YAML inventories
//! - Group hierarchy through `[name:children]`
//! - Group connection defaults through `[name:vars]`
//! - Target pattern selection

pub mod group;
pub mod node;

pub use group::Group;
pub use node::{ConnectionKey, ConnectionParams, ManagedNode, Transport, DEFAULT_PORT};

use indexmap::IndexMap;
use regex::Regex;
use serde::Deserialize;
use serde_json::Value;
use std::collections::{BTreeSet, HashSet, VecDeque};
use std::path::Path;
use thiserror::Error;
use tracing::{debug, warn};

use crate::error::Error;
use crate::vars::Vars;

/// Name of the implicit group containing every node.
pub const ALL_GROUP: &str = "all";
/// Name of the group holding nodes without any explicit group.
pub const UNGROUPED: &str = "ungrouped";

/// Errors that can occur while loading an inventory
#[derive(Debug, Error)]
pub enum InventoryError {
    #[error("{origin}{}: {message}", .line.map(|l| format!(":{}", l)).unwrap_or_default())]
    Parse {
        origin: String,
        line: Option<usize>,
        message: String,
    },

    #[error("node '{name}' declared with conflicting connection parameters: {message}")]
    DuplicateNode { name: String, message: String },

    #[error("node '{0}' has no connection address and its name is not a valid host name")]
    UnresolvableNode(String),

    #[error("inventory not found: {0}")]
    NotFound(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for inventory operations
pub type InventoryResult<T> = Result<T, InventoryError>;

impl From<InventoryError> for Error {
    fn from(err: InventoryError) -> Self {
        match err {
            InventoryError::Parse {
                origin,
                line,
                message,
            } => match line {
                Some(line) => Error::parse(origin, format!("line {}: {}", line, message)),
                None => Error::parse(origin, message),
            },
            InventoryError::DuplicateNode { name, message } => {
                Error::DuplicateNode { name, message }
            }
            InventoryError::UnresolvableNode(name) => Error::UnresolvableNode(name),
            InventoryError::NotFound(path) => Error::FileNotFound(path.into()),
            InventoryError::Io(e) => Error::Io(e),
        }
    }
}

/// The loaded inventory: nodes and groups in declaration order
#[derive(Debug, Clone)]
pub struct Inventory {
    nodes: IndexMap<String, ManagedNode>,
    groups: IndexMap<String, Group>,
    source: Option<String>,
}

impl Default for Inventory {
    fn default() -> Self {
        Self::new()
    }
}

impl Inventory {
    /// Create a new empty inventory with the default groups
    pub fn new() -> Self {
        let mut groups = IndexMap::new();
        groups.insert(ALL_GROUP.to_string(), Group::new(ALL_GROUP));
        groups.insert(UNGROUPED.to_string(), Group::new(UNGROUPED));
        Self {
            nodes: IndexMap::new(),
            groups,
            source: None,
        }
    }

    /// Load an inventory file, choosing the format by extension
    pub fn load<P: AsRef<Path>>(path: P) -> InventoryResult<Self> {
        let path = path.as_ref();
        if !path.is_file() {
            return Err(InventoryError::NotFound(path.display().to_string()));
        }

        let text = std::fs::read_to_string(path)?;
        let origin = path.display().to_string();
        let mut inventory = match path.extension().and_then(|e| e.to_str()) {
            Some("yml") | Some("yaml") => Self::parse_yaml(&text, &origin)?,
            _ => Self::parse_ini(&text, &origin)?,
        };
        inventory.source = Some(origin);

        debug!(
            nodes = inventory.nodes.len(),
            groups = inventory.groups.len(),
            "Loaded inventory"
        );
        Ok(inventory)
    }

    /// Parse the INI inventory format
    pub fn parse_ini(text: &str, origin: &str) -> InventoryResult<Self> {
        let mut builder = Builder::new(origin);
        let mut current_group = UNGROUPED.to_string();
        let mut section = Section::Nodes;

        for (idx, raw) in text.lines().enumerate() {
            let line_no = idx + 1;
            let line = raw.trim();

            if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
                continue;
            }

            if line.starts_with('[') {
                let (name, kind) = parse_header(line).map_err(|m| builder.error(line_no, m))?;
                builder.group_mut(&name);
                current_group = name;
                section = kind;
                continue;
            }

            match section {
                Section::Nodes => {
                    let (name, params, vars) =
                        parse_node_line(line).map_err(|m| builder.error(line_no, m))?;
                    builder.declare_node(&name, &current_group, params, vars)?;
                }
                Section::Vars => {
                    let (key, value) = line
                        .split_once('=')
                        .ok_or_else(|| builder.error(line_no, format!("expected 'key=value', found '{}'", line)))?;
                    let key = key.trim();
                    if key.is_empty() {
                        return Err(builder.error(line_no, "empty variable name"));
                    }
                    let value = parse_ini_value(value.trim()).map_err(|m| builder.error(line_no, m))?;
                    builder
                        .group_mut(&current_group)
                        .set_var(key, value)
                        .map_err(|m| builder.error(line_no, m))?;
                }
                Section::Children => {
                    if !is_valid_group_name(line) {
                        return Err(builder.error(line_no, format!("invalid group name '{}'", line)));
                    }
                    builder.group_mut(line);
                    builder.group_mut(&current_group).add_child(line);
                }
            }
        }

        builder.finish()
    }

    /// Parse the YAML inventory format (`all: {hosts, children, vars}`)
    pub fn parse_yaml(text: &str, origin: &str) -> InventoryResult<Self> {
        let root: IndexMap<String, Option<YamlGroup>> =
            serde_yaml::from_str(text).map_err(|e| InventoryError::Parse {
                origin: origin.to_string(),
                line: e.location().map(|l| l.line()),
                message: e.to_string(),
            })?;

        let mut builder = Builder::new(origin);
        for (name, group) in root {
            builder.yaml_group(&name, group.unwrap_or_default())?;
        }
        builder.finish()
    }

    /// Add an already resolved node
    pub fn add_node(&mut self, mut node: ManagedNode) {
        node.groups.insert(ALL_GROUP.to_string());
        for group in node.groups.clone() {
            self.groups
                .entry(group.clone())
                .or_insert_with(|| Group::new(&group))
                .add_node(&node.name);
        }
        self.nodes.insert(node.name.clone(), node);
    }

    /// Get a node by name
    pub fn node(&self, name: &str) -> Option<&ManagedNode> {
        self.nodes.get(name)
    }

    /// Get a group by name
    pub fn group(&self, name: &str) -> Option<&Group> {
        self.groups.get(name)
    }

    /// All nodes in declaration order
    pub fn nodes(&self) -> impl Iterator<Item = &ManagedNode> {
        self.nodes.values()
    }

    /// All groups in declaration order
    pub fn groups(&self) -> impl Iterator<Item = &Group> {
        self.groups.values()
    }

    /// Number of nodes
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Where the inventory was loaded from
    pub fn source(&self) -> Option<&str> {
        self.source.as_deref()
    }

    /// Select the nodes matching a target pattern.
    ///
    /// Supported patterns:
    /// - `all` or `*` - every node
    /// - `groupname` - nodes of the group and its child groups
    /// - `nodename` - a single node
    /// - `web*` - glob on node names
    /// - `a:b`, `a,b` - union
    ///
    /// Nodes come back in inventory declaration order. A pattern that
    /// matches nothing selects nothing.
    pub fn select(&self, pattern: &str) -> Vec<&ManagedNode> {
        let mut selected: HashSet<&str> = HashSet::new();

        for part in pattern.split([':', ',']).map(str::trim).filter(|p| !p.is_empty()) {
            if part == ALL_GROUP || part == "*" {
                selected.extend(self.nodes.keys().map(String::as_str));
            } else if self.groups.contains_key(part) {
                selected.extend(self.group_members(part));
            } else if let Some(node) = self.nodes.get(part) {
                selected.insert(&node.name);
            } else if part.contains('*') || part.contains('?') {
                match Regex::new(&glob_to_regex(part)) {
                    Ok(re) => selected.extend(
                        self.nodes
                            .keys()
                            .filter(|name| re.is_match(name))
                            .map(String::as_str),
                    ),
                    Err(_) => warn!(pattern = %part, "Invalid node pattern"),
                }
            } else {
                warn!(pattern = %part, "Pattern matched no nodes");
            }
        }

        self.nodes
            .values()
            .filter(|node| selected.contains(node.name.as_str()))
            .collect()
    }

    /// Member names of a group, including nested child groups
    fn group_members(&self, name: &str) -> HashSet<&str> {
        let mut members = HashSet::new();
        let mut visited = HashSet::new();
        let mut queue = VecDeque::from([name]);

        while let Some(current) = queue.pop_front() {
            if !visited.insert(current) {
                continue;
            }
            if let Some(group) = self.groups.get(current) {
                members.extend(group.nodes.iter().map(String::as_str));
                queue.extend(group.children.iter().map(String::as_str));
            }
        }
        members
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Section {
    Nodes,
    Vars,
    Children,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct YamlGroup {
    #[serde(default)]
    hosts: IndexMap<String, Option<Vars>>,
    #[serde(default)]
    children: IndexMap<String, Option<YamlGroup>>,
    #[serde(default)]
    vars: Vars,
}

#[derive(Debug)]
struct NodeDecl {
    params: ConnectionParams,
    vars: Vars,
}

/// Accumulates declarations, then resolves group defaults and validates.
struct Builder {
    origin: String,
    decls: IndexMap<String, NodeDecl>,
    groups: IndexMap<String, Group>,
}

impl Builder {
    fn new(origin: &str) -> Self {
        let inventory = Inventory::new();
        Self {
            origin: origin.to_string(),
            decls: IndexMap::new(),
            groups: inventory.groups,
        }
    }

    fn error(&self, line: usize, message: impl Into<String>) -> InventoryError {
        InventoryError::Parse {
            origin: self.origin.clone(),
            line: Some(line),
            message: message.into(),
        }
    }

    fn group_mut(&mut self, name: &str) -> &mut Group {
        self.groups
            .entry(name.to_string())
            .or_insert_with(|| Group::new(name))
    }

    fn declare_node(
        &mut self,
        name: &str,
        group: &str,
        params: ConnectionParams,
        vars: Vars,
    ) -> InventoryResult<()> {
        match self.decls.get_mut(name) {
            Some(existing) => {
                existing
                    .params
                    .merge(&params)
                    .map_err(|message| InventoryError::DuplicateNode {
                        name: name.to_string(),
                        message,
                    })?;
                existing.vars.extend(vars);
            }
            None => {
                self.decls
                    .insert(name.to_string(), NodeDecl { params, vars });
            }
        }
        self.group_mut(group).add_node(name);
        Ok(())
    }

    fn yaml_group(&mut self, name: &str, def: YamlGroup) -> InventoryResult<()> {
        if !is_valid_group_name(name) {
            return Err(InventoryError::Parse {
                origin: self.origin.clone(),
                line: None,
                message: format!("invalid group name '{}'", name),
            });
        }
        self.group_mut(name);

        for (node_name, vars) in def.hosts {
            let mut params = ConnectionParams::default();
            let mut node_vars = Vars::new();
            for (key, value) in vars.unwrap_or_default() {
                match ConnectionKey::from_key(&key) {
                    Some(conn_key) => {
                        params.set(conn_key, &value).map_err(|m| InventoryError::Parse {
                            origin: self.origin.clone(),
                            line: None,
                            message: format!("node '{}': {}", node_name, m),
                        })?
                    }
                    None => {
                        node_vars.insert(key, value);
                    }
                }
            }
            self.declare_node(&node_name, name, params, node_vars)?;
        }

        for (key, value) in def.vars {
            let origin = self.origin.clone();
            self.group_mut(name)
                .set_var(&key, value)
                .map_err(|m| InventoryError::Parse {
                    origin,
                    line: None,
                    message: format!("group '{}': {}", name, m),
                })?;
        }

        for (child, child_def) in def.children {
            self.group_mut(name).add_child(&child);
            self.yaml_group(&child, child_def.unwrap_or_default())?;
        }

        Ok(())
    }

    /// Groups whose connection defaults apply to `node`, nearest first.
    fn default_chain(&self, node: &str) -> Vec<&Group> {
        let mut chain = Vec::new();
        let mut visited = HashSet::new();
        let mut queue: VecDeque<&str> = self
            .groups
            .values()
            .filter(|g| g.name != ALL_GROUP && g.has_node(node))
            .map(|g| g.name.as_str())
            .collect();

        while let Some(name) = queue.pop_front() {
            if name == ALL_GROUP || !visited.insert(name) {
                continue;
            }
            if let Some(group) = self.groups.get(name) {
                chain.push(group);
                queue.extend(
                    self.groups
                        .values()
                        .filter(|parent| parent.children.iter().any(|c| c == name))
                        .map(|parent| parent.name.as_str()),
                );
            }
        }

        if let Some(all) = self.groups.get(ALL_GROUP) {
            chain.push(all);
        }
        chain
    }

    fn finish(mut self) -> InventoryResult<Inventory> {
        let mut nodes = IndexMap::new();

        for (name, decl) in &self.decls {
            let mut params = decl.params.clone();
            for group in self.default_chain(name) {
                params.fill_from(&group.connection);
            }

            let mut node = ManagedNode::from_params(name, &params);
            node.vars = decl.vars.clone();
            node.groups = self
                .groups
                .values()
                .filter(|g| g.has_node(name))
                .map(|g| g.name.clone())
                .collect::<BTreeSet<_>>();

            if !node.is_resolvable() {
                return Err(InventoryError::UnresolvableNode(name.clone()));
            }
            nodes.insert(name.clone(), node);
        }

        // `ungrouped` only keeps nodes that ended up in no other group
        let grouped: HashSet<String> = self
            .groups
            .values()
            .filter(|g| g.name != UNGROUPED && g.name != ALL_GROUP)
            .flat_map(|g| g.nodes.iter().cloned())
            .collect();
        if let Some(ungrouped) = self.groups.get_mut(UNGROUPED) {
            ungrouped.nodes.retain(|n| !grouped.contains(n));
        }

        for node in nodes.values_mut() {
            if grouped.contains(&node.name) {
                node.groups.remove(UNGROUPED);
            }
            node.groups.insert(ALL_GROUP.to_string());
        }
        if let Some(all) = self.groups.get_mut(ALL_GROUP) {
            for name in nodes.keys() {
                all.add_node(name);
            }
        }

        Ok(Inventory {
            nodes,
            groups: self.groups,
            source: None,
        })
    }
}

fn parse_header(line: &str) -> Result<(String, Section), String> {
    let inner = line
        .strip_prefix('[')
        .and_then(|l| l.strip_suffix(']'))
        .ok_or_else(|| format!("malformed section header '{}'", line))?
        .trim();

    let (name, section) = match inner.split_once(':') {
        Some((name, "vars")) => (name, Section::Vars),
        Some((name, "children")) => (name, Section::Children),
        Some((_, suffix)) => return Err(format!("unknown section type '{}'", suffix)),
        None => (inner, Section::Nodes),
    };

    if !is_valid_group_name(name) {
        return Err(format!("invalid group name '{}'", name));
    }
    Ok((name.to_string(), section))
}

fn parse_node_line(line: &str) -> Result<(String, ConnectionParams, Vars), String> {
    let tokens = shell_words::split(line).map_err(|e| format!("{} in '{}'", e, line))?;
    let mut tokens = tokens.into_iter();
    let name = tokens.next().ok_or_else(|| "missing node name".to_string())?;
    if name.contains('=') {
        return Err(format!("expected a node name, found '{}'", name));
    }

    let mut params = ConnectionParams::default();
    let mut vars = Vars::new();
    for token in tokens {
        let (key, value) = token
            .split_once('=')
            .ok_or_else(|| format!("'{}' is not a key=value pair", token))?;
        if key.is_empty() {
            return Err(format!("empty variable name in '{}'", token));
        }
        let value = parse_scalar(value);
        match ConnectionKey::from_key(key) {
            Some(conn_key) => params.set(conn_key, &value)?,
            None => {
                vars.insert(key.to_string(), value);
            }
        }
    }

    Ok((name, params, vars))
}

/// Parse a `[group:vars]` value, honoring shell quoting.
fn parse_ini_value(value: &str) -> Result<Value, String> {
    if value.starts_with('"') || value.starts_with('\'') {
        let mut words = shell_words::split(value).map_err(|e| format!("{} in '{}'", e, value))?;
        if words.len() != 1 {
            return Err(format!("unexpected text after quoted value '{}'", value));
        }
        return Ok(Value::String(words.remove(0)));
    }
    Ok(parse_scalar(value))
}

/// Interpret an unquoted value as bool, integer, float or string.
fn parse_scalar(value: &str) -> Value {
    match value {
        "true" | "True" | "yes" => return Value::Bool(true),
        "false" | "False" | "no" => return Value::Bool(false),
        _ => {}
    }
    if let Ok(n) = value.parse::<i64>() {
        return Value::from(n);
    }
    if let Ok(f) = value.parse::<f64>() {
        if f.is_finite() && value.contains('.') {
            return Value::from(f);
        }
    }
    Value::String(value.to_string())
}

fn is_valid_group_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-' || c == '.')
}

/// Convert a glob pattern to regex
fn glob_to_regex(pattern: &str) -> String {
    let mut regex = String::from("^");
    for ch in pattern.chars() {
        match ch {
            '*' => regex.push_str(".*"),
            '?' => regex.push('.'),
            c => regex.push_str(&regex::escape(&c.to_string())),
        }
    }
    regex.push('$');
    regex
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn names(nodes: Vec<&ManagedNode>) -> Vec<&str> {
        nodes.into_iter().map(|n| n.name.as_str()).collect()
    }

    #[test]
    fn test_empty_inventory() {
        let inv = Inventory::new();
        assert_eq!(inv.node_count(), 0);
        assert!(inv.group(ALL_GROUP).is_some());
        assert!(inv.group(UNGROUPED).is_some());
    }

    #[test]
    fn test_parse_ini() {
        let inv = Inventory::parse_ini(
            r#"
# homelab
standalone connection_address=10.0.0.99

[webservers]
web1 ansible_host=10.0.0.1
web2 connection_address=10.0.0.2 connection_port=2222 http_port=8080

[databases]
db1 connection_address=10.0.0.10

[webservers:vars]
ansible_user=deploy
tier="front end"

[production:children]
webservers
databases
"#,
            "hosts",
        )
        .unwrap();

        assert_eq!(inv.node_count(), 4);
        let web2 = inv.node("web2").unwrap();
        assert_eq!(web2.address.as_deref(), Some("10.0.0.2"));
        assert_eq!(web2.port, 2222);
        assert_eq!(web2.user.as_deref(), Some("deploy"));
        assert_eq!(web2.vars["http_port"], json!(8080));
        assert!(web2.in_group("webservers"));
        assert!(web2.in_group(ALL_GROUP));

        let db1 = inv.node("db1").unwrap();
        assert_eq!(db1.user, None);
        assert_eq!(db1.port, DEFAULT_PORT);

        let webservers = inv.group("webservers").unwrap();
        assert_eq!(webservers.vars["tier"], json!("front end"));
        assert!(inv.group(UNGROUPED).unwrap().has_node("standalone"));
        assert!(inv.node("standalone").unwrap().in_group(UNGROUPED));
    }

    #[test]
    fn test_select() {
        let inv = Inventory::parse_ini(
            "[web]\nweb1\nweb2\n[db]\ndb1\n[prod:children]\nweb\n",
            "hosts",
        )
        .unwrap();

        assert_eq!(names(inv.select("all")), vec!["web1", "web2", "db1"]);
        assert_eq!(names(inv.select("prod")), vec!["web1", "web2"]);
        assert_eq!(names(inv.select("db1:web2")), vec!["web2", "db1"]);
        assert_eq!(names(inv.select("db, web1")), vec!["web1", "db1"]);
        assert_eq!(names(inv.select("web*")), vec!["web1", "web2"]);
        assert!(inv.select("nosuchgroup").is_empty());
    }

    #[test]
    fn test_second_mention_adds_membership() {
        let inv = Inventory::parse_ini(
            "[web]\nsrv1 connection_address=10.0.0.1\n[docker]\nsrv1\n",
            "hosts",
        )
        .unwrap();

        let srv1 = inv.node("srv1").unwrap();
        assert!(srv1.in_group("web"));
        assert!(srv1.in_group("docker"));
        assert_eq!(srv1.address.as_deref(), Some("10.0.0.1"));
    }

    #[test]
    fn test_duplicate_conflicting_node() {
        let err = Inventory::parse_ini(
            "[web]\nsrv1 connection_address=10.0.0.1\n[docker]\nsrv1 connection_address=10.0.0.2\n",
            "hosts",
        )
        .unwrap_err();
        assert!(matches!(err, InventoryError::DuplicateNode { ref name, .. } if name == "srv1"));
    }

    #[test]
    fn test_unresolvable_node() {
        let err = Inventory::parse_ini("[web]\nweb_01!\n", "hosts").unwrap_err();
        assert!(matches!(err, InventoryError::UnresolvableNode(ref name) if name == "web_01!"));
    }

    #[test]
    fn test_parse_errors_carry_line_numbers() {
        let err = Inventory::parse_ini("[web]\nsrv1 connection_port=abc\n", "hosts").unwrap_err();
        assert!(matches!(err, InventoryError::Parse { line: Some(2), .. }));

        let err = Inventory::parse_ini("[web\nsrv1\n", "hosts").unwrap_err();
        assert!(matches!(err, InventoryError::Parse { line: Some(1), .. }));

        let err = Inventory::parse_ini("[web]\nsrv1 oops\n", "hosts").unwrap_err();
        assert!(matches!(err, InventoryError::Parse { line: Some(2), .. }));

        let err = Inventory::parse_ini("[web:hosts]\n", "hosts").unwrap_err();
        assert!(matches!(err, InventoryError::Parse { .. }));

        let err = Inventory::parse_ini("[web:vars]\nnovalue\n", "hosts").unwrap_err();
        assert_eq!(err.to_string(), "hosts:2: expected 'key=value', found 'novalue'");
    }

    #[test]
    fn test_child_group_defaults() {
        let inv = Inventory::parse_ini(
            "[pis]\npi1\n[arm:children]\npis\n[arm:vars]\nansible_user=pi\n[all:vars]\nansible_port=2200\n",
            "hosts",
        )
        .unwrap();

        let pi1 = inv.node("pi1").unwrap();
        assert_eq!(pi1.user.as_deref(), Some("pi"));
        assert_eq!(pi1.port, 2200);
    }

    #[test]
    fn test_parse_yaml() {
        let inv = Inventory::parse_yaml(
            r#"
all:
  vars:
    connection_user: admin
  hosts:
    srv1:
      connection_address: 192.168.1.10
  children:
    docker:
      hosts:
        srv2:
          ansible_port: 2222
          role_hint: media
        srv1:
"#,
            "hosts.yml",
        )
        .unwrap();

        assert_eq!(names(inv.select("all")), vec!["srv1", "srv2"]);
        assert_eq!(names(inv.select("docker")), vec!["srv1", "srv2"]);
        let srv2 = inv.node("srv2").unwrap();
        assert_eq!(srv2.port, 2222);
        assert_eq!(srv2.user.as_deref(), Some("admin"));
        assert_eq!(srv2.vars["role_hint"], json!("media"));
    }

    #[test]
    fn test_parse_yaml_rejects_unknown_keys() {
        let err = Inventory::parse_yaml("all:\n  hots:\n    srv1:\n", "hosts.yml").unwrap_err();
        assert!(matches!(err, InventoryError::Parse { .. }));
    }

    #[test]
    fn test_local_transport() {
        let inv = Inventory::parse_ini("control connection_transport=local\n", "hosts").unwrap();
        assert_eq!(inv.node("control").unwrap().transport, Transport::Local);
    }
}
