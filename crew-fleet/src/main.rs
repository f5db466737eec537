//! crew-fleet: one AI crew per team, each bound to the team's chat channels.
//!
//!   crew-fleet run                    — start every team's bot, ctrl-c to stop
//!   crew-fleet tenant add <id> ...    — register a team
//!   crew-fleet tenant list            — list registered teams
//!   crew-fleet tenant remove <id>     — unregister a team
//!   crew-fleet health                 — show which teams are eligible to start
//!
//! `run` requires ANTHROPIC_API_KEY.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use crew_fleet::config::FleetSettings;
use crew_fleet::crew::LifecycleManager;
use crew_fleet::fleet::{BroadcastKind, FleetOrchestrator};
use crew_fleet::llm::{LlmClient, LlmCrewFactory};
use crew_fleet::store::{TenantConfig, TenantStore};
use crew_fleet::transport::irc::IrcTransport;

#[derive(Parser)]
#[command(name = "crew-fleet", about = "Multi-tenant team chat bot fleet")]
struct Args {
    /// Settings file (TOML)
    #[arg(long, env = "CREW_FLEET_CONFIG", default_value = "crew-fleet.toml")]
    config: PathBuf,

    /// Tenant database path
    #[arg(long, env = "CREW_FLEET_DB", default_value = "/tmp/crew-fleet/tenants.db")]
    database: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start every eligible team's bot and run until ctrl-c
    Run {
        /// Anthropic API key (or set ANTHROPIC_API_KEY env var)
        #[arg(long, env = "ANTHROPIC_API_KEY")]
        api_key: String,

        /// Claude model (overrides the settings file)
        #[arg(long)]
        model: Option<String>,

        /// IRC server address host:port (overrides the settings file)
        #[arg(long)]
        server: Option<String>,
    },

    /// Manage registered teams
    Tenant {
        #[command(subcommand)]
        action: TenantAction,
    },

    /// Show which teams would start and why others are skipped
    Health,
}

#[derive(Subcommand)]
enum TenantAction {
    /// Register or update a team
    Add {
        tenant_id: String,
        /// Chat transport token
        #[arg(long)]
        token: String,
        /// Main team channel
        #[arg(long)]
        primary: String,
        /// Leadership / admin channel
        #[arg(long)]
        secondary: String,
        /// Display name
        #[arg(long, default_value = "")]
        name: String,
    },
    /// List registered teams
    List,
    /// Unregister a team
    Remove { tenant_id: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    // JSON logs with CREW_LOG_JSON=1, human-readable otherwise
    let json_logs = std::env::var("CREW_LOG_JSON").unwrap_or_default() == "1";
    let filter = EnvFilter::from_default_env().add_directive("crew_fleet=info".parse()?);
    if json_logs {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    let args = Args::parse();
    if let Some(parent) = args.database.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let store = TenantStore::open(&args.database)?;

    match args.command {
        Command::Run {
            api_key,
            model,
            server,
        } => {
            let mut settings = FleetSettings::load(&args.config)?;
            if let Some(model) = model {
                settings.llm.model = model;
            }
            if let Some(server) = server {
                settings.irc.server = server;
            }
            run(settings, store, api_key).await
        }
        Command::Tenant { action } => tenant(&store, action),
        Command::Health => health(&store),
    }
}

async fn run(settings: FleetSettings, store: TenantStore, api_key: String) -> Result<()> {
    let llm = LlmClient::new(api_key).with_model(&settings.llm.model);
    let factory = Arc::new(LlmCrewFactory::new(llm, settings.crew()));
    let manager = Arc::new(LifecycleManager::new(factory, settings.lifecycle()));
    let transport = Arc::new(IrcTransport::new(settings.irc()));
    let fleet = FleetOrchestrator::new(manager, Arc::new(store), transport);

    tracing::info!(
        server = %settings.irc.server,
        model = %settings.llm.model,
        "Starting crew fleet"
    );
    let report = fleet.start_all().await?;
    if report.started.is_empty() {
        tracing::warn!("No team bots started; add teams with `crew-fleet tenant add`");
    }
    fleet
        .broadcast(BroadcastKind::Startup, settings.template(BroadcastKind::Startup))
        .await;

    tracing::info!("Fleet running. Ctrl+C to stop.");
    tokio::signal::ctrl_c().await?;

    tracing::info!("Shutting down fleet");
    fleet
        .broadcast(BroadcastKind::Shutdown, settings.template(BroadcastKind::Shutdown))
        .await;
    let summary = fleet.stop_all().await;
    for (tenant_id, error) in &summary.failed {
        tracing::warn!(%tenant_id, %error, "Crew did not shut down cleanly");
    }
    Ok(())
}

fn tenant(store: &TenantStore, action: TenantAction) -> Result<()> {
    match action {
        TenantAction::Add {
            tenant_id,
            token,
            primary,
            secondary,
            name,
        } => {
            let config = TenantConfig {
                tenant_id,
                transport_token: token,
                primary_channel_id: primary,
                secondary_channel_id: secondary,
                display_name: name,
            };
            store.upsert(&config)?;
            println!("Saved {} ({})", config.tenant_id, config.name());
            if let Err(reason) = config.eligibility() {
                println!("  warning: will be skipped at startup: {reason}");
            }
        }
        TenantAction::List => {
            let configs = store.list()?;
            if configs.is_empty() {
                println!("No teams registered.");
            }
            for c in &configs {
                println!(
                    "{:<20} {:<24} {} / {}  token={}",
                    c.tenant_id,
                    c.name(),
                    c.primary_channel_id,
                    c.secondary_channel_id,
                    mask(&c.transport_token)
                );
            }
        }
        TenantAction::Remove { tenant_id } => {
            if store.remove(&tenant_id)? {
                println!("Removed {tenant_id}");
            } else {
                println!("No team {tenant_id}");
            }
        }
    }
    Ok(())
}

fn health(store: &TenantStore) -> Result<()> {
    let configs = store.list()?;
    let mut eligible = 0;
    for c in &configs {
        match c.eligibility() {
            Ok(()) => {
                eligible += 1;
                println!("✅ {:<20} ready", c.tenant_id);
            }
            Err(reason) => println!("⏭️  {:<20} skipped: {reason}", c.tenant_id),
        }
    }
    println!("{eligible}/{} teams eligible", configs.len());
    Ok(())
}

/// Tokens too short to hide a tail are shown by length only.
const MASK_MIN_CHARS: usize = 12;

fn mask(token: &str) -> String {
    let len = token.chars().count();
    if len == 0 {
        return "<none>".to_string();
    }
    if len < MASK_MIN_CHARS {
        return format!("<{len} chars>");
    }
    let tail: String = token.chars().skip(len - 4).collect();
    format!("…{tail}")
}
