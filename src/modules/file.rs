//! File module - manage file, directory and permission state

use async_trait::async_trait;
use std::path::Path;

use super::{
    get_state, quote, Module, ModuleContext, ModuleError, ModuleParams, ModuleResult, ParamExt,
    Plan, Step,
};
use crate::connection::{Connection, FileStat};

const STATES: &[&str] = &["file", "directory", "absent", "touch"];

/// Module for file and directory state
pub struct FileModule;

/// Step fixing the mode of an existing path, if it differs
pub(crate) fn chmod_step(path: &Path, current: &FileStat, mode: Option<u32>) -> Option<Step> {
    let mode = mode?;
    if current.mode == mode {
        return None;
    }
    Some(Step::run(
        format!("chmod {:o} {}", mode, path.display()),
        format!("chmod {:o} {}", mode, quote(&path.to_string_lossy())),
    ))
}

#[async_trait]
impl Module for FileModule {
    fn name(&self) -> &'static str {
        "file"
    }

    fn description(&self) -> &'static str {
        "Manage files, directories and their permissions"
    }

    fn required_params(&self) -> &[&'static str] {
        &["path"]
    }

    fn validate_params(&self, params: &ModuleParams) -> ModuleResult<()> {
        let path = params.get_string_required("path")?;
        if !path.starts_with('/') {
            return Err(ModuleError::InvalidParameter(format!(
                "path '{}' must be absolute",
                path
            )));
        }
        get_state(params, STATES, "file")?;
        params.get_mode("mode")?;
        Ok(())
    }

    async fn plan(
        &self,
        connection: &dyn Connection,
        params: &ModuleParams,
        context: &ModuleContext,
    ) -> ModuleResult<Plan> {
        let path_str = params.get_string_required("path")?;
        let path = Path::new(&path_str);
        let state = get_state(params, STATES, "file")?;
        let mode = params.get_mode("mode")?;
        let current = connection.stat(path, Some(context.read_options())).await?;
        let quoted = quote(&path_str);

        let plan = match (state, current) {
            ("absent", None) => Plan::unchanged(format!("{} already absent", path_str)),
            ("absent", Some(_)) => Plan::change(
                format!("remove {}", path_str),
                vec![Step::run(format!("remove {}", path_str), format!("rm -rf {}", quoted))],
            ),

            ("directory", None) => {
                let mut command = format!("mkdir -p {}", quoted);
                if let Some(mode) = mode {
                    command.push_str(&format!(" && chmod {:o} {}", mode, quoted));
                }
                Plan::change(
                    format!("create directory {}", path_str),
                    vec![Step::run(format!("create directory {}", path_str), command)],
                )
            }
            ("directory", Some(stat)) if !stat.is_dir => {
                return Err(ModuleError::ExecutionFailed(format!(
                    "{} exists and is not a directory",
                    path_str
                )))
            }

            ("touch", None) => Plan::change(
                format!("create {}", path_str),
                vec![Step::write(path, Vec::new(), mode)],
            ),

            ("file", None) => {
                return Err(ModuleError::ExecutionFailed(format!(
                    "{} does not exist",
                    path_str
                )))
            }
            ("file", Some(stat)) | ("touch", Some(stat)) if stat.is_dir => {
                return Err(ModuleError::ExecutionFailed(format!(
                    "{} is a directory",
                    path_str
                )))
            }

            (_, Some(stat)) => Plan::change(
                format!("{} mode", path_str),
                chmod_step(path, &stat, mode).into_iter().collect(),
            ),
            (other, None) => {
                return Err(ModuleError::InvalidParameter(format!(
                    "unsupported state '{}'",
                    other
                )))
            }
        };

        if plan.is_change() {
            Ok(plan)
        } else {
            Ok(Plan::unchanged(format!("{} already {}", path_str, state)))
        }
    }
}
