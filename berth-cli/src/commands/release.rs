//! Release command.

use clap::Args;
use serde_json::Value;

use crate::client::DaemonClient;
use crate::error::CliError;
use crate::utils::{emit, GlobalOptions};

/// Release an allocation by lock id.
#[derive(Args)]
pub struct ReleaseCommand {
    /// The lock id returned by allocate
    #[arg(value_name = "LOCK_ID")]
    pub lock_id: String,
}

impl ReleaseCommand {
    /// Execute the command.
    pub fn execute(&self, global: &GlobalOptions) -> Result<(), CliError> {
        let client = DaemonClient::new(global)?;
        let reply = client.delete(&format!("/allocate/{}", self.lock_id))?;
        let port = reply.get("port").and_then(Value::as_u64).unwrap_or(0);
        emit(global, &format!("released port {port}"), &reply);
        Ok(())
    }
}
