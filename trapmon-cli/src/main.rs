//! Command-line front end for the monitor core: boot a session from a flat
//! disk image and either run it standalone, record it, or replay a log
//! against it.

mod cmd;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "trapmon", version, about = "trap-and-emulate monitor harness")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Boot a session and report where it settles.
    Run(cmd::run::Cmd),
    /// Boot a session paired with a fresh record log.
    Record(cmd::record::Cmd),
    /// Boot a session and pump an existing log against it.
    Replay(cmd::replay::Cmd),
}

fn main() {
    env_logger::init();
    let cli = Cli::parse();
    match &cli.command {
        Commands::Run(cmd) => cmd.execute(),
        Commands::Record(cmd) => cmd.execute(),
        Commands::Replay(cmd) => cmd.execute(),
    }
}
