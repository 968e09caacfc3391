use std::{collections::BTreeSet, path::PathBuf, sync::Arc};

use anyhow::{Context, Result, bail};
use chrono::Utc;
use clap::{Args, Subcommand};

use crate::{
    config::{self, Config, ConfigUpdate},
    event::{ContextMap, EventId, Initiator, Level},
    permit::StaticGrants,
    query::{ExpandSpec, FilterStage, QueryMode, QueryRequest, Refinement},
    server,
    service::LogService,
    store::{AppendRequest, EventStore},
};

#[derive(Args)]
pub struct StartArgs {
    /// Override the configured port.
    #[arg(long)]
    pub port: Option<u16>,
}

pub async fn start(config_path: Option<PathBuf>, args: StartArgs) -> Result<()> {
    let (mut config, path) = config::load_or_default(config_path)?;
    if let Some(port) = args.port {
        config.port = port;
    }
    tracing::info!("starting actilog with config {}", path.display());
    server::run(config).await?;
    Ok(())
}

#[derive(Args)]
pub struct AppendArgs {
    pub category: String,
    pub message: String,
    #[arg(long, default_value = "info")]
    pub level: String,
    #[arg(long)]
    pub occasion: Option<String>,
    /// Context entries as key=value, repeatable.
    #[arg(long = "context", value_name = "KEY=VALUE")]
    pub context: Vec<String>,
}

pub fn append(config_path: Option<PathBuf>, args: AppendArgs) -> Result<()> {
    let service = open_service(config_path)?;

    let mut context = ContextMap::new();
    for entry in &args.context {
        let Some((key, value)) = entry.split_once('=') else {
            bail!("context entry '{entry}' is not of the form key=value");
        };
        context.insert(key.to_string(), value.to_string());
    }

    let event = service.record(AppendRequest {
        category: args.category,
        level: args.level.parse::<Level>()?,
        message: args.message,
        initiator: Initiator::Cli {
            name: cli_actor_name(),
        },
        occasion_id: args.occasion,
        context,
        timestamp: None,
    })?;

    println!("{}", serde_json::to_string_pretty(&event)?);
    Ok(())
}

#[derive(Args)]
pub struct QueryArgs {
    #[arg(long, default_value_t = 1)]
    pub page: usize,
    /// Groups per page; defaults to the configured list page size.
    #[arg(long)]
    pub page_size: Option<usize>,
    /// Inclusive upper id bound pinned on the first page.
    #[arg(long)]
    pub ceiling: Option<u64>,
    /// Restrict to these ids (comma-separated).
    #[arg(long, value_delimiter = ',')]
    pub ids: Vec<u64>,
    #[arg(long)]
    pub min_level: Option<String>,
    #[arg(long)]
    pub search: Option<String>,
    /// Filter stage for --min-level/--search: pre_grouping changes member
    /// counts, post_grouping (the default) preserves them.
    #[arg(long)]
    pub stage: Option<String>,
    /// Query with this access token's grant instead of the default.
    #[arg(long)]
    pub token: Option<String>,
}

pub fn query(config_path: Option<PathBuf>, args: QueryArgs) -> Result<()> {
    let service = open_service(config_path)?;

    let min_level = args
        .min_level
        .as_deref()
        .map(str::parse::<Level>)
        .transpose()?;
    let refinement = if min_level.is_some() || args.search.is_some() {
        Some(Refinement {
            stage: match args.stage.as_deref() {
                None => FilterStage::default(),
                Some("pre_grouping") => FilterStage::PreGrouping,
                Some("post_grouping") => FilterStage::PostGrouping,
                Some(other) => bail!("unknown filter stage '{other}'"),
            },
            min_level,
            search: args.search,
        })
    } else {
        None
    };

    let request = QueryRequest {
        mode: QueryMode::Listing,
        page: args.page,
        page_size: args.page_size.unwrap_or_else(|| service.list_page_size()),
        id_allowlist: if args.ids.is_empty() {
            None
        } else {
            Some(args.ids.iter().copied().map(EventId::from_u64).collect::<BTreeSet<_>>())
        },
        ceiling: args.ceiling.map(EventId::from_u64),
        refinement,
        expand: None,
    };

    let result = service.query(args.token.as_deref(), request)?;
    println!("{}", serde_json::to_string_pretty(&result)?);
    Ok(())
}

#[derive(Args)]
pub struct ExpandArgs {
    /// Id of the collapsed group's representative.
    pub anchor: u64,
    pub occasion_id: String,
    #[arg(long, default_value_t = 50)]
    pub count: usize,
    #[arg(long)]
    pub token: Option<String>,
}

pub fn expand(config_path: Option<PathBuf>, args: ExpandArgs) -> Result<()> {
    let service = open_service(config_path)?;

    let request = QueryRequest {
        mode: QueryMode::ExpandGroup,
        expand: Some(ExpandSpec {
            anchor: EventId::from_u64(args.anchor),
            occasion_id: args.occasion_id,
            count: args.count,
        }),
        ..QueryRequest::default()
    };
    let result = service.query(args.token.as_deref(), request)?;
    println!("{}", serde_json::to_string_pretty(&result)?);
    Ok(())
}

#[derive(Args)]
pub struct PurgeArgs {
    /// Delete events older than this many days.
    #[arg(long)]
    pub older_than_days: u32,
}

pub fn purge(config_path: Option<PathBuf>, args: PurgeArgs) -> Result<()> {
    let service = open_service(config_path)?;
    let cutoff = Utc::now() - chrono::Duration::days(args.older_than_days as i64);
    let removed = service.purge_older_than(cutoff)?;
    println!("purged {removed} events");
    Ok(())
}

#[derive(Subcommand)]
pub enum ConfigCommands {
    /// Print the active configuration.
    Show,
    /// Update configuration values.
    Set(ConfigSetArgs),
}

#[derive(Args)]
pub struct ConfigSetArgs {
    #[arg(long)]
    pub port: Option<u16>,
    #[arg(long)]
    pub data_dir: Option<PathBuf>,
    #[arg(long)]
    pub list_page_size: Option<usize>,
    #[arg(long)]
    pub page_limit: Option<usize>,
    #[arg(long)]
    pub retention_days: Option<u32>,
}

pub fn config_cmd(config_path: Option<PathBuf>, command: ConfigCommands) -> Result<()> {
    let (mut config, path) = config::load_or_default(config_path)?;
    match command {
        ConfigCommands::Show => {
            println!("{}", toml::to_string_pretty(&config)?);
        }
        ConfigCommands::Set(args) => {
            config.apply_update(ConfigUpdate {
                port: args.port,
                data_dir: args.data_dir,
                list_page_size: args.list_page_size,
                page_limit: args.page_limit,
                retention_days: args.retention_days.map(Some),
            });
            config.save(&path)?;
            println!("updated {}", path.display());
        }
    }
    Ok(())
}

fn open_service(config_path: Option<PathBuf>) -> Result<LogService> {
    let (config, _) = config::load_or_default(config_path)?;
    service_from(&config)
}

fn service_from(config: &Config) -> Result<LogService> {
    let store = Arc::new(
        EventStore::open(config.event_store_path())
            .context("failed to open event store (is the server running?)")?,
    );
    let grants: Arc<StaticGrants> = Arc::new(config.grants.clone());
    Ok(LogService::new(
        store,
        grants,
        config.list_page_size,
        config.page_limit,
    ))
}

fn cli_actor_name() -> String {
    std::env::var("USER")
        .or_else(|_| std::env::var("USERNAME"))
        .unwrap_or_else(|_| "actilog".to_string())
}
