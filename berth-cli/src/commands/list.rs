//! List command.

use clap::Args;
use serde_json::Value;

use crate::client::DaemonClient;
use crate::error::CliError;
use crate::utils::{emit, GlobalOptions};

/// List active allocations.
#[derive(Args)]
pub struct ListCommand {
    /// Include lock ids and instance details
    #[arg(short = 'v', long)]
    pub verbose: bool,
}

impl ListCommand {
    /// Execute the command.
    pub fn execute(&self, global: &GlobalOptions) -> Result<(), CliError> {
        let client = DaemonClient::new(global)?;
        let reply = client.get("/allocations")?;

        let empty = Vec::new();
        let allocations = reply
            .get("allocations")
            .and_then(Value::as_array)
            .unwrap_or(&empty);

        let mut lines = Vec::with_capacity(allocations.len() + 1);
        if allocations.is_empty() {
            lines.push("no active allocations".to_string());
        }
        for allocation in allocations {
            let port = allocation.get("port").and_then(Value::as_u64).unwrap_or(0);
            let service = allocation
                .get("service_type")
                .and_then(Value::as_str)
                .unwrap_or("?");
            let instance = allocation
                .get("instance_id")
                .and_then(Value::as_str)
                .unwrap_or("?");
            if self.verbose {
                let lock_id = allocation
                    .get("lock_id")
                    .and_then(Value::as_str)
                    .unwrap_or("?");
                let state = allocation
                    .get("state")
                    .and_then(Value::as_str)
                    .unwrap_or("?");
                lines.push(format!(
                    "{port:>5}  {service:<12} {instance:<20} {state:<8} {lock_id}"
                ));
            } else {
                lines.push(format!("{port:>5}  {service:<12} {instance}"));
            }
        }

        emit(global, &lines.join("\n"), &reply);
        Ok(())
    }
}
