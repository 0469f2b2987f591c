//! CLI structure and command definitions.

use crate::commands::{
    AllocateCommand, CheckCommand, CleanupCommand, ConfigCommand, DaemonCommand, DoctorCommand,
    InstancesCommand, ListCommand, ReleaseCommand, ScanCommand,
};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Per-user port coordination for development workstations.
#[derive(Parser)]
#[command(name = "berth")]
#[command(version, about = "Coordinate development ports through a per-user daemon", long_about = None)]
pub struct Cli {
    /// Enable verbose output
    #[arg(long, global = true)]
    pub verbose: bool,

    /// Suppress non-essential output
    #[arg(long, global = true)]
    pub quiet: bool,

    /// Emit JSON instead of human-readable output
    #[arg(long, global = true)]
    pub json: bool,

    /// Override the data directory location
    #[arg(long, value_name = "PATH", global = true, env = "BERTH_DATA_DIR")]
    pub data_dir: Option<PathBuf>,

    /// Override the daemon port
    #[arg(long, value_name = "PORT", global = true, env = "BERTH_DAEMON_PORT")]
    pub daemon_port: Option<u16>,

    #[command(subcommand)]
    pub command: Command,
}

/// Available CLI commands.
#[derive(Subcommand)]
pub enum Command {
    /// Manage the daemon process
    Daemon(DaemonCommand),

    /// Allocate a port for a service type
    Allocate(AllocateCommand),

    /// Release an allocation by lock id
    Release(ReleaseCommand),

    /// Check one port's availability
    Check(CheckCommand),

    /// List active allocations
    List(ListCommand),

    /// Scan a port range for occupied ports
    Scan(ScanCommand),

    /// Remove stale allocations
    Cleanup(CleanupCommand),

    /// List registered instances
    Instances(InstancesCommand),

    /// Inspect and manage configuration
    Config(ConfigCommand),

    /// Run local diagnostics
    Doctor(DoctorCommand),
}
