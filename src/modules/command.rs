//! Command module - run a guarded command
//!
//! A bare command cannot tell whether it already ran, so `creates` or
//! `removes` is mandatory: the command runs only while the `creates` path
//! is missing, or while the `removes` path still exists.

use async_trait::async_trait;
use std::path::Path;

use super::{quote, Module, ModuleContext, ModuleError, ModuleParams, ModuleResult, ParamExt, Plan, Step};
use crate::connection::Connection;

/// Module for guarded commands
pub struct CommandModule;

impl CommandModule {
    fn command_line(params: &ModuleParams) -> ModuleResult<String> {
        let cmd = match params.get_vec_string("argv")? {
            Some(argv) if !argv.is_empty() => shell_words::join(&argv),
            Some(_) => {
                return Err(ModuleError::InvalidParameter(
                    "argv cannot be empty".to_string(),
                ))
            }
            None => params.get_string_required("cmd")?,
        };
        if cmd.trim().is_empty() {
            return Err(ModuleError::InvalidParameter("cmd cannot be empty".to_string()));
        }
        Ok(match params.get_string("chdir")? {
            Some(dir) => format!("cd {} && {}", quote(&dir), cmd),
            None => cmd,
        })
    }
}

#[async_trait]
impl Module for CommandModule {
    fn name(&self) -> &'static str {
        "command"
    }

    fn description(&self) -> &'static str {
        "Run a command guarded by creates/removes"
    }

    fn validate_params(&self, params: &ModuleParams) -> ModuleResult<()> {
        if params.get("cmd").is_none() && params.get("argv").is_none() {
            return Err(ModuleError::MissingParameter(
                "Either 'cmd' or 'argv' must be provided".to_string(),
            ));
        }
        Self::command_line(params)?;
        let creates = params.get_string("creates")?;
        let removes = params.get_string("removes")?;
        if creates.is_none() && removes.is_none() {
            return Err(ModuleError::MissingParameter(
                "creates or removes (commands must be idempotent)".to_string(),
            ));
        }
        Ok(())
    }

    async fn plan(
        &self,
        connection: &dyn Connection,
        params: &ModuleParams,
        context: &ModuleContext,
    ) -> ModuleResult<Plan> {
        let command = Self::command_line(params)?;
        let read = context.read_options();

        if let Some(creates) = params.get_string("creates")? {
            if connection.path_exists(Path::new(&creates), Some(read.clone())).await? {
                return Ok(Plan::unchanged(format!("'{}' exists", creates)));
            }
        }
        if let Some(removes) = params.get_string("removes")? {
            if !connection.path_exists(Path::new(&removes), Some(read)).await? {
                return Ok(Plan::unchanged(format!("'{}' does not exist", removes)));
            }
        }

        Ok(Plan::change(
            format!("run {}", command),
            vec![Step::run(format!("run {}", command), command)],
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn params(value: serde_json::Value) -> ModuleParams {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_requires_guard() {
        let unguarded = params(json!({"cmd": "make install"}));
        assert!(matches!(
            CommandModule.validate_params(&unguarded),
            Err(ModuleError::MissingParameter(_))
        ));

        let guarded = params(json!({"cmd": "make install", "creates": "/usr/local/bin/tool"}));
        assert!(CommandModule.validate_params(&guarded).is_ok());
    }

    #[test]
    fn test_command_line() {
        let p = params(json!({"argv": ["tar", "xf", "my file.tar"], "chdir": "/opt", "creates": "/opt/x"}));
        assert_eq!(
            CommandModule::command_line(&p).unwrap(),
            "cd /opt && tar xf 'my file.tar'"
        );
    }
}
