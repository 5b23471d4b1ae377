//! Package module - Debian/Ubuntu package management
//!
//! Observes package state with `dpkg-query` and converges it with
//! `apt-get`. Only the packages that are not yet in the desired state are
//! passed to `apt-get`, so a converged node sees no `apt-get` call at all.

use async_trait::async_trait;

use super::{
    get_state, quote, Module, ModuleContext, ModuleError, ModuleParams, ModuleResult, ParamExt,
    Plan, Step,
};
use crate::connection::Connection;

/// Environment prefix keeping `apt-get` from prompting
const NONINTERACTIVE: &str = "DEBIAN_FRONTEND=noninteractive";

/// Module for APT package management
pub struct PackageModule;

impl PackageModule {
    fn packages(params: &ModuleParams) -> ModuleResult<Vec<String>> {
        let names = params
            .get_vec_string("name")?
            .ok_or_else(|| ModuleError::MissingParameter("name".to_string()))?;
        if names.is_empty() {
            return Err(ModuleError::InvalidParameter(
                "name must list at least one package".to_string(),
            ));
        }
        Ok(names)
    }

    /// Check if a package is installed
    async fn is_installed(
        connection: &dyn Connection,
        package: &str,
        context: &ModuleContext,
    ) -> ModuleResult<bool> {
        let result = connection
            .execute(&status_query(package), Some(context.exec_options()))
            .await?;
        Ok(result.success && result.stdout.contains("install ok installed"))
    }
}

/// `dpkg-query` invocation printing a package's status line
pub fn status_query(package: &str) -> String {
    format!("dpkg-query -W -f='${{Status}}' {}", quote(package))
}

/// `apt-get install` for `packages`
pub fn install_command(packages: &[String]) -> String {
    format!(
        "{} apt-get install -y {}",
        NONINTERACTIVE,
        packages.iter().map(|p| quote(p)).collect::<Vec<_>>().join(" ")
    )
}

/// `apt-get remove` for `packages`
pub fn remove_command(packages: &[String]) -> String {
    format!(
        "{} apt-get remove -y {}",
        NONINTERACTIVE,
        packages.iter().map(|p| quote(p)).collect::<Vec<_>>().join(" ")
    )
}

/// Refresh the package index
pub fn update_step() -> Step {
    Step::run("update package cache", "apt-get update")
}

#[async_trait]
impl Module for PackageModule {
    fn name(&self) -> &'static str {
        "package"
    }

    fn description(&self) -> &'static str {
        "Install or remove Debian packages"
    }

    fn required_params(&self) -> &[&'static str] {
        &["name"]
    }

    fn validate_params(&self, params: &ModuleParams) -> ModuleResult<()> {
        Self::packages(params)?;
        get_state(params, &["present", "absent"], "present")?;
        params.get_bool("update_cache")?;
        Ok(())
    }

    async fn plan(
        &self,
        connection: &dyn Connection,
        params: &ModuleParams,
        context: &ModuleContext,
    ) -> ModuleResult<Plan> {
        let packages = Self::packages(params)?;
        let state = get_state(params, &["present", "absent"], "present")?;
        let want_installed = state == "present";

        let mut pending = Vec::new();
        for package in &packages {
            if Self::is_installed(connection, package, context).await? != want_installed {
                pending.push(package.clone());
            }
        }

        if pending.is_empty() {
            return Ok(Plan::unchanged(format!(
                "{} already {}",
                packages.join(", "),
                state
            )));
        }

        let mut steps = Vec::new();
        if params.get_bool_or("update_cache", false)? {
            steps.push(update_step());
        }
        if want_installed {
            steps.push(Step::run(
                format!("install {}", pending.join(", ")),
                install_command(&pending),
            ));
            Ok(Plan::change(format!("install {}", pending.join(", ")), steps))
        } else {
            steps.push(Step::run(
                format!("remove {}", pending.join(", ")),
                remove_command(&pending),
            ));
            Ok(Plan::change(format!("remove {}", pending.join(", ")), steps))
        }
    }
}
