//! Check command.

use clap::Args;
use serde_json::Value;

use crate::client::DaemonClient;
use crate::error::CliError;
use crate::utils::{emit, GlobalOptions};

/// Check one port's availability.
#[derive(Args)]
pub struct CheckCommand {
    /// The port to check
    #[arg(value_name = "PORT")]
    pub port: u16,
}

impl CheckCommand {
    /// Execute the command.
    pub fn execute(&self, global: &GlobalOptions) -> Result<(), CliError> {
        let client = DaemonClient::new(global)?;
        let reply = client.get(&format!("/check/{}", self.port))?;

        let available = reply
            .get("available")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        let line = if available {
            format!("port {} is available", self.port)
        } else if let Some(holder) = reply.get("allocated_to").filter(|v| !v.is_null()) {
            let service = holder
                .get("service_type")
                .and_then(Value::as_str)
                .unwrap_or("?");
            format!("port {} is allocated to service type '{service}'", self.port)
        } else if let Some(usage) = reply.get("system_usage").filter(|v| !v.is_null()) {
            let process = usage.get("process").and_then(Value::as_str).unwrap_or("?");
            format!("port {} is in use by {process}", self.port)
        } else {
            format!("port {} is in use", self.port)
        };

        emit(global, &line, &reply);
        Ok(())
    }
}
