//! Instances command.

use clap::Args;
use serde_json::Value;

use crate::client::DaemonClient;
use crate::error::CliError;
use crate::utils::{emit, GlobalOptions};

/// List registered instances.
#[derive(Args)]
pub struct InstancesCommand {}

impl InstancesCommand {
    /// Execute the command.
    pub fn execute(&self, global: &GlobalOptions) -> Result<(), CliError> {
        let client = DaemonClient::new(global)?;
        let reply = client.get("/instance/list")?;

        let empty = Vec::new();
        let instances = reply
            .get("instances")
            .and_then(Value::as_array)
            .unwrap_or(&empty);

        let mut lines = Vec::with_capacity(instances.len() + 1);
        if instances.is_empty() {
            lines.push("no registered instances".to_string());
        }
        for instance in instances {
            let id = instance
                .get("instance_id")
                .and_then(Value::as_str)
                .unwrap_or("?");
            let dir = instance
                .get("working_directory")
                .and_then(Value::as_str)
                .unwrap_or("-");
            let locks = instance
                .get("active_locks")
                .and_then(Value::as_array)
                .map_or(0, Vec::len);
            lines.push(format!("{id:<24} {locks:>2} lock(s)  {dir}"));
        }

        emit(global, &lines.join("\n"), &reply);
        Ok(())
    }
}
