//! ## credence-cli
//! **Operational interface for the balance tracker**
//!
//! Runs a deterministic churn simulation against an in-memory store and
//! renders the effective configuration.

use clap::Parser;

mod commands;

use commands::{Cli, Commands};

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Simulate(args) => commands::run_simulation(args),
        Commands::Config(args) => commands::show_config(args),
    }
}
