pub mod commands;

use clap::{Parser, Subcommand};
use std::process::ExitCode;

#[derive(Debug, Parser)]
#[command(
    name = "concierge",
    about = "Concierge operator CLI",
    long_about = "Inspect concierge configuration and ontology, check runtime readiness, and run offline turns.",
    after_help = "Examples:\n  concierge doctor --json\n  concierge config\n  concierge ontology\n  concierge route --text \"티셔츠 재고 있나요\" --text \"1번이요\""
)]
pub struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    #[command(about = "Validate config, ontology loading, database connectivity and adapters")]
    Doctor {
        #[arg(long, help = "Emit machine-readable JSON output")]
        json: bool,
    },
    #[command(
        about = "Inspect effective configuration values with source attribution and redaction"
    )]
    Config,
    #[command(about = "Load the configured ontology and print its summary")]
    Ontology,
    #[command(about = "Run messages through the router and agents against an in-memory session")]
    Route {
        #[arg(long = "text", required = true, help = "Customer message; repeat for more turns")]
        texts: Vec<String>,
        #[arg(long, default_value = commands::route::DEFAULT_SESSION, help = "Chat id to use")]
        session: String,
    },
}

pub fn run() -> ExitCode {
    let cli = Cli::parse();

    let result = match cli.command {
        Command::Doctor { json } => commands::doctor::run(json),
        Command::Config => {
            commands::CommandResult { exit_code: 0, output: commands::config::run() }
        }
        Command::Ontology => commands::ontology::run(),
        Command::Route { texts, session } => commands::route::run(&texts, &session),
    };

    println!("{}", result.output);
    ExitCode::from(result.exit_code)
}
