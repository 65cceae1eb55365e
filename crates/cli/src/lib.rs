pub mod commands;

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use leadflow_core::config::{AppConfig, LoadOptions, LogFormat, LoggingConfig};

use crate::commands::machine_transition::MachineTransitionArgs;
use crate::commands::seed::SeedArgs;
use crate::commands::transition::TransitionArgs;

#[derive(Debug, Parser)]
#[command(
    name = "leadflow",
    about = "Leadflow pipeline operator CLI",
    long_about = "Operate the lead pipeline engine: migrations, configuration, seeding, transitions and history.",
    after_help = "Examples:\n  leadflow migrate\n  leadflow seed --demo\n  leadflow transition lead-1001 stg-review --user user1\n  leadflow history lead-1001"
)]
pub struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    #[command(about = "Apply pending database migrations and return structured status output")]
    Migrate,
    #[command(about = "Inspect effective configuration values with source attribution")]
    Config,
    #[command(about = "Load a TOML pipeline document (stages, rules, SLAs, teams, leads)")]
    Seed {
        #[arg(help = "Path to the pipeline seed document")]
        file: Option<PathBuf>,
        #[arg(long, help = "Load the built-in demo pipeline instead of a file")]
        demo: bool,
    },
    #[command(about = "Move a lead to a stage through the team-aware executor")]
    Transition {
        lead_id: String,
        target_stage_id: String,
        #[arg(long, help = "Event name recorded on the transition")]
        event: Option<String>,
        #[arg(long, help = "Acting user; omit for a system transition")]
        user: Option<String>,
        #[arg(long, help = "JSON document replacing the lead context")]
        context: Option<String>,
    },
    #[command(about = "Send an event to the tenant state machine (rules apply, teams do not)")]
    MachineTransition {
        lead_id: String,
        event: String,
        #[arg(long, help = "Acting user; omit for a system transition")]
        user: Option<String>,
        #[arg(long, help = "JSON document evaluated by the guards and stored on the lead")]
        context: Option<String>,
    },
    #[command(about = "List the stages a lead can move to next, with their owning teams")]
    Options {
        lead_id: String,
        #[arg(long)]
        user: Option<String>,
    },
    #[command(about = "Show a lead's transition history and turnaround report")]
    History { lead_id: String },
    #[command(about = "List a tenant's teams with the stages they own")]
    Teams { tenant_id: String },
}

pub fn run() -> ExitCode {
    let cli = Cli::parse();
    if let Ok(config) = AppConfig::load(LoadOptions::default()) {
        init_logging(&config.logging);
    }

    let result = match cli.command {
        Command::Migrate => commands::migrate::run(),
        Command::Config => commands::config::run(),
        Command::Seed { file, demo } => commands::seed::run(SeedArgs { file, demo }),
        Command::Transition { lead_id, target_stage_id, event, user, context } => {
            commands::transition::run(TransitionArgs { lead_id, target_stage_id, event, user, context })
        }
        Command::MachineTransition { lead_id, event, user, context } => {
            commands::machine_transition::run(MachineTransitionArgs { lead_id, event, user, context })
        }
        Command::Options { lead_id, user } => commands::options::run(lead_id, user),
        Command::History { lead_id } => commands::history::run(lead_id),
        Command::Teams { tenant_id } => commands::teams::run(tenant_id),
    };

    println!("{}", result.output);
    ExitCode::from(result.exit_code)
}

/// Logs go to stderr; stdout carries only the command payload.
pub fn init_logging(logging: &LoggingConfig) {
    use tracing::Level;

    let log_level = logging.level.parse::<Level>().unwrap_or(Level::INFO);
    let builder =
        tracing_subscriber::fmt().with_target(false).with_max_level(log_level).with_writer(std::io::stderr);

    // A subscriber may already be installed (tests, embedding); keep it.
    let _ = match logging.format {
        LogFormat::Compact => builder.compact().try_init(),
        LogFormat::Pretty => builder.pretty().try_init(),
        LogFormat::Json => builder.json().try_init(),
    };
}
