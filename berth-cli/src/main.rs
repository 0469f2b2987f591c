//! Main entry point for the berth CLI.
//!
//! Subcommands either talk to the running daemon over its loopback HTTP API
//! (`allocate`, `release`, `check`, ...) or work directly against the user's
//! data directory (`daemon start`, `config ...`).

mod cli;
mod client;
mod commands;
mod error;
mod utils;

use clap::Parser;
use cli::{Cli, Command};
use utils::GlobalOptions;

fn main() {
    let cli = Cli::parse();
    utils::init_tracing(cli.verbose, cli.quiet);

    let global = GlobalOptions {
        verbose: cli.verbose,
        quiet: cli.quiet,
        json: cli.json,
        data_dir: cli.data_dir,
        daemon_port: cli.daemon_port,
    };

    let result = match cli.command {
        Command::Daemon(cmd) => cmd.execute(&global),
        Command::Allocate(cmd) => cmd.execute(&global),
        Command::Release(cmd) => cmd.execute(&global),
        Command::Check(cmd) => cmd.execute(&global),
        Command::List(cmd) => cmd.execute(&global),
        Command::Scan(cmd) => cmd.execute(&global),
        Command::Cleanup(cmd) => cmd.execute(&global),
        Command::Instances(cmd) => cmd.execute(&global),
        Command::Config(cmd) => cmd.execute(&global),
        Command::Doctor(cmd) => cmd.execute(&global),
    };

    match result {
        Ok(()) => std::process::exit(0),
        Err(e) => {
            eprintln!("Error: {e}");
            std::process::exit(e.exit_code());
        }
    }
}
