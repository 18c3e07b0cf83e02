pub mod commands;

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(
    name = "dossier",
    about = "Dossier operator CLI",
    long_about = "Run the Telegram-to-CRM assistant, inspect configuration, and check runtime readiness.",
    after_help = "Examples:\n  dossier run\n  dossier doctor --json\n  dossier config"
)]
pub struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    #[command(about = "Run the bot: connect the store, start the update loop")]
    Run {
        #[arg(long, help = "Path to a dossier.toml config file")]
        config: Option<PathBuf>,
    },
    #[command(about = "Validate config, store connectivity, and API token readiness")]
    Doctor {
        #[arg(long, help = "Emit machine-readable JSON output")]
        json: bool,
    },
    #[command(about = "Inspect effective configuration values with secrets redacted")]
    Config,
}

pub fn run() -> ExitCode {
    let cli = Cli::parse();

    match cli.command {
        Command::Run { config } => match commands::run::run(config) {
            Ok(()) => ExitCode::SUCCESS,
            Err(error) => {
                eprintln!("dossier run failed: {error:#}");
                ExitCode::FAILURE
            }
        },
        Command::Doctor { json } => {
            let (output, healthy) = commands::doctor::run(json);
            println!("{output}");
            if healthy {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            }
        }
        Command::Config => {
            println!("{}", commands::config::run());
            ExitCode::SUCCESS
        }
    }
}
