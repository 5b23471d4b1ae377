//! Apt repository module
//!
//! Manages a one-line source list under `/etc/apt/sources.list.d`, and
//! optionally the dearmored signing key the line refers to.

use async_trait::async_trait;
use std::path::{Path, PathBuf};

use super::{
    get_state, package, quote, Module, ModuleContext, ModuleError, ModuleParams, ModuleResult,
    ParamExt, Plan, Step,
};
use crate::connection::Connection;

/// Directory holding source list files
pub const SOURCES_DIR: &str = "/etc/apt/sources.list.d";

/// Module for APT repositories
pub struct AptRepositoryModule;

impl AptRepositoryModule {
    fn list_path(params: &ModuleParams, repo: &str) -> ModuleResult<PathBuf> {
        let filename = match params.get_string("filename")? {
            Some(name) => name,
            None => default_filename(repo),
        };
        if filename.contains('/') || filename.is_empty() {
            return Err(ModuleError::InvalidParameter(format!(
                "filename '{}' must be a plain file name",
                filename
            )));
        }
        let filename = filename.trim_end_matches(".list");
        Ok(Path::new(SOURCES_DIR).join(format!("{}.list", filename)))
    }
}

/// Derive a list file name from the repository URL.
pub fn default_filename(repo: &str) -> String {
    let url = repo
        .split_whitespace()
        .find(|part| part.starts_with("http://") || part.starts_with("https://"))
        .unwrap_or(repo);
    let stripped = url
        .trim_start_matches("https://")
        .trim_start_matches("http://");
    let name: String = stripped
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect();
    let name = name.trim_matches('_').to_string();
    if name.is_empty() {
        "homestead".to_string()
    } else {
        name
    }
}

/// Download `url` and store it dearmored at `keyring`.
pub fn key_install_command(url: &str, keyring: &str) -> String {
    let dir = Path::new(keyring)
        .parent()
        .map(|p| p.to_string_lossy().to_string())
        .filter(|p| !p.is_empty())
        .unwrap_or_else(|| "/".to_string());
    format!(
        "install -m 0755 -d {} && curl -fsSL {} | gpg --dearmor -o {} && chmod a+r {}",
        quote(&dir),
        quote(url),
        quote(keyring),
        quote(keyring)
    )
}

#[async_trait]
impl Module for AptRepositoryModule {
    fn name(&self) -> &'static str {
        "apt_repository"
    }

    fn description(&self) -> &'static str {
        "Add or remove an APT source list and its signing key"
    }

    fn required_params(&self) -> &[&'static str] {
        &["repo"]
    }

    fn validate_params(&self, params: &ModuleParams) -> ModuleResult<()> {
        let repo = params.get_string_required("repo")?;
        if repo.contains('\n') {
            return Err(ModuleError::InvalidParameter(
                "repo must be a single line".to_string(),
            ));
        }
        get_state(params, &["present", "absent"], "present")?;
        Self::list_path(params, &repo)?;
        match (params.get_string("key_url")?, params.get_string("keyring")?) {
            (Some(_), None) => Err(ModuleError::MissingParameter(
                "keyring (required with key_url)".to_string(),
            )),
            _ => Ok(()),
        }
    }

    async fn plan(
        &self,
        connection: &dyn Connection,
        params: &ModuleParams,
        context: &ModuleContext,
    ) -> ModuleResult<Plan> {
        let repo = params.get_string_required("repo")?;
        let path = Self::list_path(params, &repo)?;
        let state = get_state(params, &["present", "absent"], "present")?;
        let update_cache = params.get_bool_or("update_cache", true)?;

        let read = context.read_options();
        let current = match connection.stat(&path, Some(read.clone())).await? {
            Some(stat) if stat.is_file => {
                Some(connection.download_content(&path, Some(read.clone())).await?)
            }
            Some(_) => {
                return Err(ModuleError::ExecutionFailed(format!(
                    "{} exists and is not a regular file",
                    path.display()
                )))
            }
            None => None,
        };

        let mut steps = Vec::new();
        if state == "absent" {
            if current.is_some() {
                steps.push(Step::run(
                    format!("remove {}", path.display()),
                    format!("rm -f {}", quote(&path.to_string_lossy())),
                ));
            }
        } else {
            if let (Some(url), Some(keyring)) =
                (params.get_string("key_url")?, params.get_string("keyring")?)
            {
                if !connection.path_exists(Path::new(&keyring), Some(read)).await? {
                    steps.push(Step::run(
                        format!("install signing key {}", keyring),
                        key_install_command(&url, &keyring),
                    ));
                }
            }

            let desired = format!("{}\n", repo.trim());
            if current.as_deref() != Some(desired.as_bytes()) {
                steps.push(Step::write(&path, desired.into_bytes(), Some(0o644)));
            }
        }

        if steps.is_empty() {
            return Ok(Plan::unchanged(format!(
                "repository {} already {}",
                path.display(),
                state
            )));
        }
        if update_cache {
            steps.push(package::update_step());
        }
        let verb = if state == "absent" { "removed" } else { "configured" };
        Ok(Plan::change(
            format!("repository {} {}", path.display(), verb),
            steps,
        ))
    }
}
