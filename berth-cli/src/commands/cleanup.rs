//! Cleanup command.

use clap::Args;
use serde_json::{json, Value};

use crate::client::DaemonClient;
use crate::error::CliError;
use crate::utils::{emit, GlobalOptions};

/// Remove stale allocations.
#[derive(Args)]
pub struct CleanupCommand {
    /// Also remove allocations that cannot be verified
    #[arg(short = 'f', long)]
    pub force: bool,
}

impl CleanupCommand {
    /// Execute the command.
    pub fn execute(&self, global: &GlobalOptions) -> Result<(), CliError> {
        let client = DaemonClient::new(global)?;
        let reply = client.post("/cleanup", &json!({ "force": self.force }))?;
        let cleaned = reply.get("cleaned").and_then(Value::as_u64).unwrap_or(0);
        emit(
            global,
            &format!("cleaned up {cleaned} allocation(s)"),
            &reply,
        );
        Ok(())
    }
}
