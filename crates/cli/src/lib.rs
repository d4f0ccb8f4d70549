pub mod commands;

use clap::{Parser, Subcommand};
use std::process::ExitCode;

#[derive(Debug, Parser)]
#[command(
    name = "toolcrib",
    about = "Toolcrib operator CLI",
    long_about = "Operate the tool-lending approval service: migrations, config inspection, readiness checks, demo data, and ledger audits.",
    after_help = "Examples:\n  toolcrib doctor --json\n  toolcrib seed\n  toolcrib history 3f0c9a52-1d8e-4c55-9a1b-7f1e2f8d9b10"
)]
pub struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    #[command(about = "Apply pending database migrations and return structured status output")]
    Migrate,
    #[command(about = "Create demo requests covering approval, rejection, and resubmission paths")]
    Seed,
    #[command(
        about = "Inspect effective configuration values with source attribution"
    )]
    Config,
    #[command(about = "Validate config, DB connectivity, and schema migration state")]
    Doctor {
        #[arg(long, help = "Emit machine-readable JSON output")]
        json: bool,
    },
    #[command(about = "Print a request's status history and verify its ledger chain")]
    History {
        #[arg(help = "Request id")]
        request_id: String,
    },
}

pub fn run() -> ExitCode {
    let cli = Cli::parse();

    let result = match cli.command {
        Command::Migrate => commands::migrate::run(),
        Command::Seed => commands::seed::run(),
        Command::Config => {
            commands::CommandResult { exit_code: 0, output: commands::config::run() }
        }
        Command::Doctor { json } => commands::doctor::run(json),
        Command::History { request_id } => commands::history::run(&request_id),
    };

    println!("{}", result.output);
    ExitCode::from(result.exit_code)
}
