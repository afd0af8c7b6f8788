use super::CommandRunner;
use crate::{
    config::OperationalMode,
    error::{PanelError, Result},
};
use std::{collections::BTreeMap, fmt, str::FromStr, sync::Arc};
use tracing::{error, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceAction {
    Enable,
    Disable,
    Restart,
}

impl ServiceAction {
    pub fn as_str(self) -> &'static str {
        match self {
            ServiceAction::Enable => "enable",
            ServiceAction::Disable => "disable",
            ServiceAction::Restart => "restart",
        }
    }

    pub fn past_tense(self) -> &'static str {
        match self {
            ServiceAction::Enable => "enabled",
            ServiceAction::Disable => "disabled",
            ServiceAction::Restart => "restarted",
        }
    }
}

impl FromStr for ServiceAction {
    type Err = PanelError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "enable" => Ok(ServiceAction::Enable),
            "disable" => Ok(ServiceAction::Disable),
            "restart" => Ok(ServiceAction::Restart),
            other => Err(PanelError::InvalidAction(other.to_string())),
        }
    }
}

impl fmt::Display for ServiceAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Thin wrapper over `systemctl` for the services shown on the panel.
#[derive(Clone)]
pub struct ServiceManager {
    mode: OperationalMode,
    runner: Arc<dyn CommandRunner>,
    services: Vec<String>,
}

impl ServiceManager {
    pub fn new(mode: OperationalMode, runner: Arc<dyn CommandRunner>, services: Vec<String>) -> Self {
        Self {
            mode,
            runner,
            services,
        }
    }

    /// `systemctl is-enabled` for every watched service. Empty when simulated.
    pub async fn statuses(&self) -> Result<BTreeMap<String, String>> {
        let mut statuses = BTreeMap::new();
        if !self.mode.is_live() {
            return Ok(statuses);
        }

        for service in &self.services {
            let output = self
                .runner
                .output("systemctl", &["is-enabled", service])
                .await?;
            let status = match output.stdout.trim() {
                "" if !output.success => "unknown",
                status => status,
            };
            statuses.insert(service.clone(), status.to_string());
        }
        Ok(statuses)
    }

    pub async fn apply(&self, service: &str, action: ServiceAction) -> Result<()> {
        if !self.mode.is_live() {
            info!("Simulated mode: skipping systemctl {} {}", action, service);
            return Ok(());
        }

        self.runner
            .run("sudo", &["systemctl", action.as_str(), service])
            .await
            .map_err(|e| {
                error!("Failed to {} service {}: {}", action, service, e);
                PanelError::ExternalCommand(format!("failed to {} service {}: {}", action, service, e))
            })?;
        info!("Service {} {}", service, action.past_tense());
        Ok(())
    }
}
