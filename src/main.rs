use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};

use actilog::commands::{
    self, AppendArgs, ConfigCommands, ExpandArgs, PurgeArgs, QueryArgs, StartArgs,
};
use actilog::logging;

#[derive(Parser)]
#[command(author, version, about = "Actilog activity log CLI")]
struct Cli {
    /// Path to the configuration file. Defaults to ./.actilog/config.toml
    #[arg(long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the Actilog server
    Start(StartArgs),
    /// Record one event from the command line
    Append(AppendArgs),
    /// List events, grouped by occasion
    Query(QueryArgs),
    /// Expand one collapsed occasion group
    Expand(ExpandArgs),
    /// Delete events past the retention horizon
    Purge(PurgeArgs),
    /// Inspect or update configuration
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    logging::init()?;

    let Cli { config, command } = Cli::parse();

    match command {
        Commands::Start(args) => commands::start(config, args).await?,
        Commands::Append(args) => commands::append(config, args)?,
        Commands::Query(args) => commands::query(config, args)?,
        Commands::Expand(args) => commands::expand(config, args)?,
        Commands::Purge(args) => commands::purge(config, args)?,
        Commands::Config { command } => commands::config_cmd(config, command)?,
    }

    Ok(())
}
