//! Scan command.

use clap::Args;
use serde_json::Value;

use crate::client::DaemonClient;
use crate::error::CliError;
use crate::utils::{emit, GlobalOptions};

/// Scan a port range for occupied ports.
#[derive(Args)]
pub struct ScanCommand {
    /// Low end of the range, inclusive
    #[arg(short = 's', long = "start", value_name = "N", default_value_t = 3000)]
    pub start: u16,

    /// High end of the range, inclusive
    #[arg(short = 'e', long = "end", value_name = "N", default_value_t = 9999)]
    pub end: u16,
}

impl ScanCommand {
    /// Execute the command.
    pub fn execute(&self, global: &GlobalOptions) -> Result<(), CliError> {
        if self.end < self.start {
            return Err(CliError::InvalidArguments(
                "end must be greater than or equal to start".into(),
            ));
        }
        let client = DaemonClient::new(global)?;
        let reply = client.get(&format!("/scan?start={}&end={}", self.start, self.end))?;

        let empty = Vec::new();
        let in_use = reply
            .get("ports_in_use")
            .and_then(Value::as_array)
            .unwrap_or(&empty);

        let mut lines = vec![format!(
            "{} port(s) in use between {} and {}",
            in_use.len(),
            self.start,
            self.end
        )];
        for entry in in_use {
            let port = entry.get("port").and_then(Value::as_u64).unwrap_or(0);
            let holder = entry
                .get("allocated_to")
                .filter(|v| !v.is_null())
                .and_then(|a| a.get("service_type"))
                .and_then(Value::as_str);
            let usage = entry
                .get("system_usage")
                .filter(|v| !v.is_null())
                .and_then(|u| u.get("process"))
                .and_then(Value::as_str);
            let detail = match (holder, usage) {
                (Some(service), _) => format!("allocated: {service}"),
                (None, Some(process)) => format!("system: {process}"),
                (None, None) => "system".to_string(),
            };
            lines.push(format!("{port:>5}  {detail}"));
        }

        emit(global, &lines.join("\n"), &reply);
        Ok(())
    }
}
