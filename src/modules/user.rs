//! User module - manage local user accounts

use async_trait::async_trait;
use std::collections::BTreeSet;

use super::{
    get_state, quote, Module, ModuleContext, ModuleParams, ModuleResult, ParamExt, Plan, Step,
};
use crate::connection::Connection;

/// Module for user accounts
pub struct UserModule;

/// Account details read from `getent passwd`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserInfo {
    pub name: String,
    pub uid: u32,
    pub home: String,
    pub shell: String,
}

/// Parse one `getent passwd` line
pub fn parse_passwd(line: &str) -> Option<UserInfo> {
    let fields: Vec<&str> = line.trim().split(':').collect();
    if fields.len() < 7 {
        return None;
    }
    Some(UserInfo {
        name: fields[0].to_string(),
        uid: fields[2].parse().ok()?,
        home: fields[5].to_string(),
        shell: fields[6].to_string(),
    })
}

impl UserModule {
    async fn lookup(
        connection: &dyn Connection,
        name: &str,
        context: &ModuleContext,
    ) -> ModuleResult<Option<UserInfo>> {
        let result = connection
            .execute(&format!("getent passwd {}", quote(name)), Some(context.exec_options()))
            .await?;
        Ok(if result.success {
            parse_passwd(&result.stdout)
        } else {
            None
        })
    }

    async fn groups(
        connection: &dyn Connection,
        name: &str,
        context: &ModuleContext,
    ) -> ModuleResult<BTreeSet<String>> {
        let result = connection
            .execute(&format!("id -nG {}", quote(name)), Some(context.exec_options()))
            .await?;
        Ok(result.stdout.split_whitespace().map(str::to_string).collect())
    }
}

#[async_trait]
impl Module for UserModule {
    fn name(&self) -> &'static str {
        "user"
    }

    fn description(&self) -> &'static str {
        "Create, update or remove user accounts"
    }

    fn required_params(&self) -> &[&'static str] {
        &["name"]
    }

    fn validate_params(&self, params: &ModuleParams) -> ModuleResult<()> {
        params.get_string_required("name")?;
        get_state(params, &["present", "absent"], "present")?;
        params.get_vec_string("groups")?;
        params.get_bool("system")?;
        params.get_bool("remove")?;
        Ok(())
    }

    async fn plan(
        &self,
        connection: &dyn Connection,
        params: &ModuleParams,
        context: &ModuleContext,
    ) -> ModuleResult<Plan> {
        let name = params.get_string_required("name")?;
        let state = get_state(params, &["present", "absent"], "present")?;
        let shell = params.get_string("shell")?;
        let groups = params.get_vec_string("groups")?.unwrap_or_default();
        let existing = Self::lookup(connection, &name, context).await?;

        let mut steps = Vec::new();
        match (state, existing) {
            ("absent", Some(_)) => {
                let flag = if params.get_bool_or("remove", false)? { "-r " } else { "" };
                steps.push(Step::run(
                    format!("remove user {}", name),
                    format!("userdel {}{}", flag, quote(&name)),
                ));
            }
            ("present", None) => {
                let mut cmd = String::from("useradd -m");
                if params.get_bool_or("system", false)? {
                    cmd.push_str(" --system");
                }
                if let Some(shell) = &shell {
                    cmd.push_str(&format!(" -s {}", quote(shell)));
                }
                if !groups.is_empty() {
                    cmd.push_str(&format!(" -G {}", quote(&groups.join(","))));
                }
                cmd.push_str(&format!(" {}", quote(&name)));
                steps.push(Step::run(format!("create user {}", name), cmd));
            }
            ("present", Some(info)) => {
                if let Some(shell) = shell.filter(|s| *s != info.shell) {
                    steps.push(Step::run(
                        format!("set shell of {} to {}", name, shell),
                        format!("usermod -s {} {}", quote(&shell), quote(&name)),
                    ));
                }
                if !groups.is_empty() {
                    let current = Self::groups(connection, &name, context).await?;
                    let missing: Vec<&str> = groups
                        .iter()
                        .filter(|g| !current.contains(*g))
                        .map(String::as_str)
                        .collect();
                    if !missing.is_empty() {
                        steps.push(Step::run(
                            format!("add {} to {}", name, missing.join(", ")),
                            format!("usermod -a -G {} {}", quote(&missing.join(",")), quote(&name)),
                        ));
                    }
                }
            }
            _ => {}
        }

        if steps.is_empty() {
            return Ok(Plan::unchanged(format!("user {} already {}", name, state)));
        }
        let msg = steps
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(", ");
        Ok(Plan::change(msg, steps))
    }
}
