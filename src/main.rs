use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, EnvFilter};

use hazardwatch::agent::{self, Agent};
use hazardwatch::config::Config;
use hazardwatch::model::telemetry::parse_timestamp;
use hazardwatch::rules::ThresholdRule;

/// Road-hazard telemetry aggregation and driver feedback service.
#[derive(Parser)]
#[command(name = "hazardwatch", about)]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Logging verbosity level (trace, debug, info, warn, error).
    #[arg(long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Print version information and exit.
    Version,
    /// Print all hazard locations with map bounds as JSON.
    Locations {
        #[command(subcommand)]
        action: Option<LocationsCommand>,
    },
    /// Manage threshold rules.
    Rules {
        #[command(subcommand)]
        action: RulesCommand,
    },
    /// Print recent alerts as JSON.
    History {
        /// Only alerts after this instant (RFC 3339). Default: 24h ago.
        #[arg(long, value_parser = parse_since)]
        since: Option<DateTime<Utc>>,

        /// Minimum number of alerts to return, backfilling with older ones.
        #[arg(long, default_value_t = 50)]
        min_results: usize,
    },
}

#[derive(Subcommand)]
enum LocationsCommand {
    /// Show one location and its device count.
    Show {
        #[arg(allow_negative_numbers = true)]
        latitude: f64,
        #[arg(allow_negative_numbers = true)]
        longitude: f64,
    },
    /// Show one device's samples at a location, oldest first.
    Device {
        device: String,
        #[arg(allow_negative_numbers = true)]
        latitude: f64,
        #[arg(allow_negative_numbers = true)]
        longitude: f64,
    },
    /// Delete the locations at the given `lat,lng` coordinates.
    Delete {
        #[arg(required = true, allow_hyphen_values = true, value_parser = parse_coordinate)]
        coordinates: Vec<(f64, f64)>,
    },
    /// Delete every location.
    Clear,
}

#[derive(Subcommand)]
enum RulesCommand {
    /// List rules, optionally for one region.
    List {
        #[arg(long)]
        region: Option<String>,
    },
    /// Show the rule at a coordinate, or an unsaved draft if none exists.
    Lookup {
        region: String,
        #[arg(allow_negative_numbers = true)]
        latitude: f64,
        #[arg(allow_negative_numbers = true)]
        longitude: f64,
    },
    /// Save a rule read from a JSON file.
    Save { file: PathBuf },
    /// Enable a rule.
    Enable { region: String, rule: String },
    /// Disable a rule.
    Disable { region: String, rule: String },
    /// Delete a rule.
    Delete { region: String, rule: String },
}

fn parse_coordinate(raw: &str) -> Result<(f64, f64), String> {
    let (lat, lng) = raw
        .split_once(',')
        .ok_or_else(|| format!("expected lat,lng, got {raw}"))?;
    let parse = |v: &str| {
        v.trim()
            .parse::<f64>()
            .map_err(|e| format!("invalid coordinate {v:?}: {e}"))
    };
    Ok((parse(lat)?, parse(lng)?))
}

fn parse_since(raw: &str) -> Result<DateTime<Utc>, String> {
    parse_timestamp(raw).ok_or_else(|| format!("invalid timestamp: {raw}"))
}

/// Build-time version info, injected via build.rs or the environment.
mod version {
    /// Release version string (set at build time).
    pub const RELEASE: &str = env!("CARGO_PKG_VERSION");

    /// Git commit hash (set at build time via env, or "unknown").
    pub fn git_commit() -> &'static str {
        option_env!("GIT_COMMIT").unwrap_or("unknown")
    }

    /// Full version string with platform info.
    pub fn full() -> String {
        format!(
            "{} (commit: {}, {}/{})",
            RELEASE,
            git_commit(),
            std::env::consts::OS,
            std::env::consts::ARCH,
        )
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Handle version subcommand before anything else.
    if let Some(Command::Version) = &cli.command {
        println!("hazardwatch {}", version::full());
        return Ok(());
    }

    // Config is required for everything else.
    let config_path = cli
        .config
        .context("--config is required (use --help for usage)")?;

    let cfg = Config::load(&config_path)
        .with_context(|| format!("loading config from {}", config_path.display()))?;

    // An explicit --log-level wins over the config file.
    let level = if cli.log_level != "info" {
        cli.log_level.clone()
    } else {
        cfg.log_level.clone()
    };
    let filter =
        EnvFilter::try_new(&level).with_context(|| format!("invalid log level: {level}"))?;

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .init();

    // Build and run the tokio runtime.
    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("building tokio runtime")?;

    match cli.command {
        None => {
            tracing::info!(
                version = version::RELEASE,
                commit = version::git_commit(),
                "starting hazardwatch",
            );
            rt.block_on(run(cfg))
        }
        Some(command) => rt.block_on(admin(cfg, command)),
    }
}

async fn run(cfg: Config) -> Result<()> {
    // Set up signal handling.
    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();

    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        .context("registering SIGTERM handler")?;

    tokio::spawn(async move {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("received SIGINT, shutting down");
            }
            _ = sigterm.recv() => {
                tracing::info!("received SIGTERM, shutting down");
            }
        }

        let _ = shutdown_tx.send(());
    });

    // Start the agent.
    let mut agent = Agent::new(cfg)?;
    agent.start().await?;

    // Wait for shutdown signal.
    let _ = shutdown_rx.await;

    // Graceful shutdown.
    agent.stop().await?;

    tracing::info!("hazardwatch stopped");

    Ok(())
}

async fn admin(cfg: Config, command: Command) -> Result<()> {
    let backend = Arc::new(agent::open_backend(&cfg.storage));

    match command {
        Command::Version => {}
        Command::Locations { action } => {
            let store = agent::aggregate_store(backend, &cfg.storage);
            match action {
                None => {
                    let snapshot = store
                        .load_snapshot()
                        .await
                        .context("loading location aggregate")?;
                    print_json(&snapshot.overview())?;
                }
                Some(LocationsCommand::Show {
                    latitude,
                    longitude,
                }) => {
                    let snapshot = store
                        .load_snapshot()
                        .await
                        .context("loading location aggregate")?;
                    let details = snapshot
                        .details(latitude, longitude)
                        .with_context(|| format!("no location at {latitude},{longitude}"))?;
                    print_json(&details)?;
                }
                Some(LocationsCommand::Device {
                    device,
                    latitude,
                    longitude,
                }) => {
                    let snapshot = store
                        .load_snapshot()
                        .await
                        .context("loading location aggregate")?;
                    let report = snapshot
                        .device_report(&device, latitude, longitude)
                        .with_context(|| {
                            format!("device {device} has no samples at {latitude},{longitude}")
                        })?;
                    print_json(&report)?;
                }
                Some(LocationsCommand::Delete { coordinates }) => {
                    let removed = store
                        .delete_batch(&coordinates)
                        .await
                        .context("deleting locations")?;
                    tracing::info!(requested = coordinates.len(), removed, "locations deleted");
                }
                Some(LocationsCommand::Clear) => {
                    store.delete_all().await.context("clearing locations")?;
                    tracing::info!("all locations deleted");
                }
            }
        }
        Command::Rules { action } => {
            let registry = agent::rule_registry(backend, &cfg.storage);
            match action {
                RulesCommand::List { region } => {
                    let rules = match region {
                        Some(region) => registry.list_for_region(&region).await?,
                        None => registry.list_all().await?,
                    };
                    print_json(&rules)?;
                }
                RulesCommand::Lookup {
                    region,
                    latitude,
                    longitude,
                } => {
                    let rule = registry
                        .rule_for_coordinate(&region, latitude, longitude)
                        .await?;
                    print_json(&rule)?;
                }
                RulesCommand::Save { file } => {
                    let rule = read_rule(&file)?;
                    print_json(&registry.save(rule).await?)?;
                }
                RulesCommand::Enable { region, rule } => {
                    print_json(&registry.set_enabled(&region, &rule, true).await?)?;
                }
                RulesCommand::Disable { region, rule } => {
                    print_json(&registry.set_enabled(&region, &rule, false).await?)?;
                }
                RulesCommand::Delete { region, rule } => {
                    registry.delete(&region, &rule).await?;
                    tracing::info!(region = %region, rule = %rule, "rule deleted");
                }
            }
        }
        Command::History { since, min_results } => {
            let since = since.unwrap_or_else(|| Utc::now() - chrono::Duration::hours(24));
            let reader = agent::history_reader(backend, &cfg.storage);
            let items = reader
                .load_recent(since, min_results)
                .await
                .context("loading alert history")?;
            print_json(&items)?;
        }
    }

    Ok(())
}

fn read_rule(path: &Path) -> Result<ThresholdRule> {
    let data = std::fs::read_to_string(path)
        .with_context(|| format!("reading rule file {}", path.display()))?;
    serde_json::from_str(&data).with_context(|| format!("parsing rule file {}", path.display()))
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    let text = serde_json::to_string_pretty(value).context("encoding output")?;
    println!("{text}");
    Ok(())
}
