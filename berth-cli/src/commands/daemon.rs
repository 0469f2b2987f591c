//! Daemon lifecycle commands.

use clap::{Args, Subcommand};
use serde_json::json;

use crate::client::DaemonClient;
use crate::error::CliError;
use crate::utils::{emit, GlobalOptions};

/// Manage the daemon process.
#[derive(Args)]
pub struct DaemonCommand {
    #[command(subcommand)]
    action: DaemonAction,
}

#[derive(Subcommand)]
enum DaemonAction {
    /// Run the daemon in the foreground
    Start,
    /// Stop a running daemon via its pidfile
    Stop,
    /// Show daemon status
    Status,
}

impl DaemonCommand {
    /// Execute the command.
    pub fn execute(&self, global: &GlobalOptions) -> Result<(), CliError> {
        match self.action {
            DaemonAction::Start => start(global),
            DaemonAction::Stop => stop(global),
            DaemonAction::Status => status(global),
        }
    }
}

fn start(global: &GlobalOptions) -> Result<(), CliError> {
    let settings = global.settings()?;
    let daemon = berth::Daemon::bootstrap(settings).map_err(|e| match e {
        berth::Error::Validation { .. } => CliError::Config(format!(
            "{e}; run `berth config validate` for details"
        )),
        other => CliError::Library(other),
    })?;

    let report = daemon.recovery_report().clone();
    if report.repaired_anything() {
        tracing::info!(?report, "startup recovery repaired state");
    }

    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(daemon.run()).map_err(CliError::Library)
}

fn stop(global: &GlobalOptions) -> Result<(), CliError> {
    let settings = global.settings()?;
    let pidfile = settings.pidfile_path();
    let raw = std::fs::read_to_string(&pidfile).map_err(|_| {
        CliError::SemanticFailure("no pidfile; the daemon does not appear to be running".into())
    })?;
    let pid: i32 = raw
        .trim()
        .parse()
        .map_err(|_| CliError::SemanticFailure(format!("malformed pidfile {}", pidfile.display())))?;

    signal_terminate(pid)?;
    emit(
        global,
        &format!("sent SIGTERM to daemon (pid {pid})"),
        &json!({ "stopped": true, "pid": pid }),
    );
    Ok(())
}

#[cfg(unix)]
fn signal_terminate(pid: i32) -> Result<(), CliError> {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    kill(Pid::from_raw(pid), Signal::SIGTERM).map_err(|e| {
        CliError::SemanticFailure(format!("could not signal pid {pid}: {e}"))
    })
}

#[cfg(not(unix))]
fn signal_terminate(_pid: i32) -> Result<(), CliError> {
    Err(CliError::SemanticFailure(
        "daemon stop is only supported on unix".into(),
    ))
}

fn status(global: &GlobalOptions) -> Result<(), CliError> {
    let client = DaemonClient::new(global)?;
    let body = client.get("/status")?;
    let uptime = body.get("uptime").and_then(serde_json::Value::as_u64).unwrap_or(0);
    let allocations = body
        .get("allocations")
        .and_then(serde_json::Value::as_u64)
        .unwrap_or(0);
    emit(
        global,
        &format!("daemon up {uptime}s, {allocations} allocation(s)"),
        &body,
    );
    Ok(())
}
