//! Allocate command.

use clap::Args;
use serde_json::{json, Value};

use crate::client::DaemonClient;
use crate::error::CliError;
use crate::utils::{emit, GlobalOptions};

/// Allocate a port for a service type.
#[derive(Args)]
pub struct AllocateCommand {
    /// Service type (e.g. dev, api, ai)
    #[arg(short = 's', long = "service", value_name = "TYPE")]
    pub service_type: String,

    /// Preferred port
    #[arg(short = 'p', long = "port", value_name = "PORT")]
    pub port: Option<u16>,

    /// Service name label
    #[arg(short = 'n', long = "name", value_name = "NAME")]
    pub name: Option<String>,

    /// Project path
    #[arg(long, value_name = "PATH")]
    pub project: Option<String>,

    /// Instance id (defaults to one derived from this process)
    #[arg(long, value_name = "ID", env = "BERTH_INSTANCE_ID")]
    pub instance: Option<String>,

    /// Plan the allocation without reserving
    #[arg(long)]
    pub dry_run: bool,
}

impl AllocateCommand {
    /// Execute the command.
    pub fn execute(&self, global: &GlobalOptions) -> Result<(), CliError> {
        let client = DaemonClient::new(global)?;
        let instance_id = self
            .instance
            .clone()
            .unwrap_or_else(|| format!("cli-{}", std::process::id()));

        let body = json!({
            "service_type": self.service_type,
            "service_name": self.name,
            "preferred_port": self.port,
            "project_path": self.project,
            "instance_id": instance_id,
            "pid": std::process::id(),
            "dry_run": self.dry_run,
        });
        let reply = client.post("/allocate", &body)?;

        emit(global, &describe(&reply), &reply);
        Ok(())
    }
}

fn describe(reply: &Value) -> String {
    let port = reply.get("port").and_then(Value::as_u64).unwrap_or(0);
    let lock_id = reply.get("lock_id").and_then(Value::as_str).unwrap_or("-");

    let mut line = if reply.get("dry_run").is_some() {
        format!("port {port} would be allocated")
    } else if reply.get("existing").is_some() {
        format!("port {port} already held (lock {lock_id})")
    } else {
        format!("allocated port {port} (lock {lock_id})")
    };
    if let Some(range) = reply.get("allocated_range").and_then(Value::as_array) {
        line.push_str(&format!(
            " [new range {}-{}]",
            range.first().and_then(Value::as_u64).unwrap_or(0),
            range.get(1).and_then(Value::as_u64).unwrap_or(0),
        ));
    }
    line
}
