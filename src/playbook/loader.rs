//! Playbook loading.

use serde::Deserialize;
use serde_json::Value;
use std::path::Path;
use tracing::{debug, info};

use super::task::{Task, TaskEntry};
use super::{Play, PlayEntry, Playbook, RoleRef};
use crate::error::{Error, Result};
use crate::roles::RoleLibrary;
use crate::vars::Vars;

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawPlay {
    #[serde(default)]
    name: Option<String>,
    hosts: String,
    #[serde(default)]
    vars: Option<Vars>,
    #[serde(default, rename = "become")]
    r#become: bool,
    #[serde(default)]
    become_user: Option<String>,
    #[serde(default)]
    roles: Vec<RawRoleRef>,
    #[serde(default)]
    tasks: Vec<TaskEntry>,
}

/// `- docker` or `- role: docker` with variables either under `vars:` or
/// inline next to `role:`.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawRoleRef {
    Simple(String),
    Full {
        role: String,
        #[serde(default)]
        vars: Option<Vars>,
        #[serde(flatten)]
        inline: Vars,
    },
}

impl RawRoleRef {
    fn into_role_ref(self) -> RoleRef {
        match self {
            RawRoleRef::Simple(name) => RoleRef::new(name),
            RawRoleRef::Full { role, vars, inline } => {
                let mut merged = inline;
                merged.extend(vars.unwrap_or_default());
                RoleRef { name: role, vars: merged }
            }
        }
    }
}

/// Loads playbooks and checks their role references against a library.
pub struct PlaybookLoader<'a> {
    library: &'a RoleLibrary,
}

impl<'a> PlaybookLoader<'a> {
    /// Creates a loader resolving roles through `library`.
    pub fn new(library: &'a RoleLibrary) -> Self {
        Self { library }
    }

    /// Loads a playbook from a YAML file.
    pub fn load(&self, path: impl AsRef<Path>) -> Result<Playbook> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => Error::FileNotFound(path.to_path_buf()),
            _ => Error::Io(e),
        })?;

        let mut playbook = self.parse(&text, &path.display().to_string())?;
        if let Some(stem) = path.file_stem() {
            playbook.name = stem.to_string_lossy().into_owned();
        }
        playbook.source = Some(path.to_path_buf());
        info!(
            playbook = %playbook.name,
            plays = playbook.plays.len(),
            "Loaded playbook"
        );
        Ok(playbook)
    }

    /// Parses a playbook from YAML text.
    ///
    /// `origin` names the source in error messages.
    pub fn parse(&self, text: &str, origin: &str) -> Result<Playbook> {
        let raw: Vec<RawPlay> = serde_yaml::from_str::<Option<Vec<RawPlay>>>(text)
            .map_err(|e| Error::yaml(origin, &e))?
            .unwrap_or_default();

        if raw.is_empty() {
            return Err(Error::parse(origin, "playbook contains no plays"));
        }

        let plays = raw
            .into_iter()
            .enumerate()
            .map(|(idx, raw)| self.build_play(idx, raw, origin))
            .collect::<Result<Vec<_>>>()?;

        Ok(Playbook {
            name: origin.to_string(),
            plays,
            source: None,
        })
    }

    fn build_play(&self, idx: usize, raw: RawPlay, origin: &str) -> Result<Play> {
        let name = raw
            .name
            .filter(|n| !n.trim().is_empty())
            .unwrap_or_else(|| format!("play #{}", idx + 1));

        if raw.hosts.trim().is_empty() {
            return Err(Error::parse(origin, format!("{} has an empty hosts pattern", name)));
        }

        let mut entries: Vec<PlayEntry> = raw
            .roles
            .into_iter()
            .map(|r| PlayEntry::Role(r.into_role_ref()))
            .collect();

        for entry in &raw.tasks {
            entries.push(match role_entry(entry, origin)? {
                Some(role_ref) => PlayEntry::Role(role_ref),
                None => PlayEntry::Task(Task::from_entry(entry, origin)?),
            });
        }

        let play = Play {
            name,
            hosts: raw.hosts,
            vars: raw.vars.unwrap_or_default(),
            r#become: raw.r#become,
            become_user: raw.become_user,
            entries,
        };

        for role_ref in play.role_refs() {
            if self.library.lookup(&role_ref.name)?.is_none() {
                return Err(Error::UnknownRole {
                    role: role_ref.name.clone(),
                    play: play.name.clone(),
                });
            }
        }

        debug!(play = %play.name, entries = play.entries.len(), "Parsed play");
        Ok(play)
    }
}

/// Reads `- role: x` and `- include_role: {name: x}` task entries.
fn role_entry(entry: &TaskEntry, origin: &str) -> Result<Option<RoleRef>> {
    let name = match (entry.get("role"), entry.get("include_role")) {
        (None, None) => return Ok(None),
        (Some(Value::String(name)), None) => name.clone(),
        (None, Some(Value::String(name))) => name.clone(),
        (None, Some(Value::Object(spec))) => match spec.get("name") {
            Some(Value::String(name)) => name.clone(),
            _ => {
                return Err(Error::parse(
                    origin,
                    "include_role requires a string 'name'",
                ))
            }
        },
        (Some(_), Some(_)) => {
            return Err(Error::parse(
                origin,
                "an entry cannot use both role and include_role",
            ))
        }
        _ => return Err(Error::parse(origin, "role name must be a string")),
    };

    let mut vars = Vars::new();
    for (key, value) in entry {
        match key.as_str() {
            "role" | "include_role" | "name" => {}
            "vars" => match value {
                Value::Object(map) => {
                    vars.extend(map.iter().map(|(k, v)| (k.clone(), v.clone())));
                }
                Value::Null => {}
                other => {
                    return Err(Error::parse(
                        origin,
                        format!("vars of role '{}' must be a mapping, found {}", name, other),
                    ))
                }
            },
            other => {
                return Err(Error::parse(
                    origin,
                    format!("unexpected key '{}' in reference to role '{}'", other, name),
                ))
            }
        }
    }

    Ok(Some(RoleRef { name, vars }))
}
