//! Copy module - place content in a file on the node
//!
//! The content comes either inline (`content`) or from a file on the
//! control node (`src`). The node file is rewritten only when its SHA-256
//! digest differs from the desired content.

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::path::Path;

use super::{
    file::chmod_step, Module, ModuleContext, ModuleError, ModuleParams, ModuleResult, ParamExt,
    Plan, Step,
};
use crate::connection::Connection;

/// Module for copying content to nodes
pub struct CopyModule;

impl CopyModule {
    fn desired_content(params: &ModuleParams) -> ModuleResult<Vec<u8>> {
        match (params.get_string("content")?, params.get_string("src")?) {
            (Some(content), None) => Ok(content.into_bytes()),
            (None, Some(src)) => std::fs::read(&src).map_err(|e| {
                ModuleError::InvalidParameter(format!("cannot read src '{}': {}", src, e))
            }),
            (Some(_), Some(_)) => Err(ModuleError::InvalidParameter(
                "content and src are mutually exclusive".to_string(),
            )),
            (None, None) => Err(ModuleError::MissingParameter("content or src".to_string())),
        }
    }
}

/// Hex SHA-256 digest of `data`
pub fn checksum(data: &[u8]) -> String {
    Sha256::digest(data)
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect()
}

#[async_trait]
impl Module for CopyModule {
    fn name(&self) -> &'static str {
        "copy"
    }

    fn description(&self) -> &'static str {
        "Write inline or local content to a file on the node"
    }

    fn required_params(&self) -> &[&'static str] {
        &["dest"]
    }

    fn validate_params(&self, params: &ModuleParams) -> ModuleResult<()> {
        params.get_string_required("dest")?;
        params.get_mode("mode")?;
        match (params.contains_key("content"), params.contains_key("src")) {
            (true, true) => Err(ModuleError::InvalidParameter(
                "content and src are mutually exclusive".to_string(),
            )),
            (false, false) => Err(ModuleError::MissingParameter("content or src".to_string())),
            _ => Ok(()),
        }
    }

    async fn plan(
        &self,
        connection: &dyn Connection,
        params: &ModuleParams,
        context: &ModuleContext,
    ) -> ModuleResult<Plan> {
        let dest_str = params.get_string_required("dest")?;
        let dest = Path::new(&dest_str);
        let mode = params.get_mode("mode")?;
        let desired = Self::desired_content(params)?;
        let desired_sum = checksum(&desired);

        let read = context.read_options();
        match connection.stat(dest, Some(read.clone())).await? {
            Some(stat) if stat.is_dir => Err(ModuleError::ExecutionFailed(format!(
                "{} is a directory",
                dest_str
            ))),
            Some(stat) => {
                let current = connection.download_content(dest, Some(read)).await?;
                if checksum(&current) != desired_sum {
                    return Ok(Plan::change(
                        format!("update {} (sha256 {})", dest_str, &desired_sum[..12]),
                        vec![Step::write(dest, desired, mode.or(Some(stat.mode)))],
                    ));
                }
                match chmod_step(dest, &stat, mode) {
                    Some(step) => Ok(Plan::change(format!("{} mode", dest_str), vec![step])),
                    None => Ok(Plan::unchanged(format!("{} up to date", dest_str))),
                }
            }
            None => Ok(Plan::change(
                format!("create {} (sha256 {})", dest_str, &desired_sum[..12]),
                vec![Step::write(dest, desired, mode)],
            )),
        }
    }
}
