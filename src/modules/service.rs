//! Service module - manage systemd units

use async_trait::async_trait;

use super::{
    get_state, quote, Module, ModuleContext, ModuleError, ModuleParams, ModuleResult, ParamExt,
    Plan, Step,
};
use crate::connection::Connection;

/// Module for systemd services
pub struct ServiceModule;

impl ServiceModule {
    /// `systemctl <query> <unit>` exit status
    async fn query(
        connection: &dyn Connection,
        query: &str,
        unit: &str,
        context: &ModuleContext,
    ) -> ModuleResult<bool> {
        let cmd = format!("systemctl {} {}", query, quote(unit));
        let result = connection.execute(&cmd, Some(context.exec_options())).await?;
        Ok(result.success)
    }

    fn action(verb: &str, unit: &str) -> Step {
        Step::run(
            format!("{} {}", verb, unit),
            format!("systemctl {} {}", verb, quote(unit)),
        )
    }
}

#[async_trait]
impl Module for ServiceModule {
    fn name(&self) -> &'static str {
        "service"
    }

    fn description(&self) -> &'static str {
        "Start, stop, enable or disable systemd services"
    }

    fn required_params(&self) -> &[&'static str] {
        &["name"]
    }

    fn validate_params(&self, params: &ModuleParams) -> ModuleResult<()> {
        params.get_string_required("name")?;
        let enabled = params.get_bool("enabled")?;
        if !params.contains_key("state") && enabled.is_none() {
            return Err(ModuleError::MissingParameter(
                "one of state or enabled".to_string(),
            ));
        }
        get_state(params, &["started", "stopped"], "started")?;
        Ok(())
    }

    async fn plan(
        &self,
        connection: &dyn Connection,
        params: &ModuleParams,
        context: &ModuleContext,
    ) -> ModuleResult<Plan> {
        let unit = params.get_string_required("name")?;
        let enabled = params.get_bool("enabled")?;
        let state = if params.contains_key("state") {
            Some(get_state(params, &["started", "stopped"], "started")?)
        } else {
            None
        };

        let mut steps = Vec::new();
        if let Some(state) = state {
            let active = Self::query(connection, "is-active", &unit, context).await?;
            match (state, active) {
                ("started", false) => steps.push(Self::action("start", &unit)),
                ("stopped", true) => steps.push(Self::action("stop", &unit)),
                _ => {}
            }
        }
        if let Some(want) = enabled {
            let is_enabled = Self::query(connection, "is-enabled", &unit, context).await?;
            if want != is_enabled {
                steps.push(Self::action(if want { "enable" } else { "disable" }, &unit));
            }
        }

        if steps.is_empty() {
            return Ok(Plan::unchanged(format!("{} already in desired state", unit)));
        }
        let msg = steps
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(", ");
        Ok(Plan::change(msg, steps))
    }
}
