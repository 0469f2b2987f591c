//! Shared CLI plumbing: global options, settings resolution, output.

use std::path::PathBuf;

use berth::Settings;
use serde_json::Value;

use crate::error::CliError;

/// Global CLI options shared across all commands.
#[derive(Debug, Clone)]
#[allow(dead_code)] // verbosity fields are consumed by init_tracing in main
pub struct GlobalOptions {
    /// Enable verbose output.
    pub verbose: bool,

    /// Suppress non-essential output.
    pub quiet: bool,

    /// Emit JSON instead of human-readable output.
    pub json: bool,

    /// Override the data directory location.
    pub data_dir: Option<PathBuf>,

    /// Override the daemon port.
    pub daemon_port: Option<u16>,
}

impl GlobalOptions {
    /// Resolve daemon settings for this invocation.
    pub fn settings(&self) -> Result<Settings, CliError> {
        let mut builder = Settings::builder();
        if let Some(dir) = &self.data_dir {
            builder = builder.data_dir(dir);
        }
        if let Some(port) = self.daemon_port {
            builder = builder.listen_port(port);
        }
        builder.build().map_err(|e| CliError::Config(e.to_string()))
    }
}

/// Install the tracing subscriber for this process.
///
/// `BERTH_LOG` overrides the level, in `tracing_subscriber::EnvFilter`
/// syntax; the verbosity flags win over it.
pub fn init_tracing(verbose: bool, quiet: bool) {
    let default = if verbose {
        "debug"
    } else if quiet {
        "error"
    } else {
        "info"
    };
    let filter = tracing_subscriber::EnvFilter::try_from_env("BERTH_LOG")
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

/// Print either the human line(s) or the JSON payload.
pub fn emit(global: &GlobalOptions, human: &str, json: &Value) {
    if global.json {
        println!(
            "{}",
            serde_json::to_string_pretty(json).unwrap_or_else(|_| "{}".to_string())
        );
    } else if !human.is_empty() {
        println!("{human}");
    }
}
