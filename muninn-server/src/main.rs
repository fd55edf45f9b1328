//! Muninn server binary
//!
//! Loads the TOML configuration, initialises storage and the router, then
//! pumps MQTT publishes through the engine until Ctrl+C. The `--sql` mode
//! instead collects the schemas declared by every configured Lua script,
//! merges them and prints the CREATE TABLE statements to stdout without
//! contacting the broker or the database.

mod mqtt;

use anyhow::{Context, Result};
use clap::Parser;
use muninn::config::Config;
use muninn::router::Router;
use muninn::schema::Schema;
use muninn::storage::{Sink, Storage, StorageConfig};
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(
  name = "muninn-server",
  version,
  about = "MQTT ingestion engine with Lua transforms and PostgreSQL storage"
)]
struct Cli {
  /// Path to the configuration file
  #[arg(long, default_value = "config.toml")]
  config: std::path::PathBuf,

  /// Don't execute SQL statements, just log them
  #[arg(long)]
  dry_run: bool,

  /// Generate SQL schema from the configured Lua scripts and exit
  #[arg(long)]
  sql: bool,

  /// Log level DEBUG, INFO, or ERROR (overrides the config file)
  #[arg(long)]
  log: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
  let cli = Cli::parse();

  let config = Config::load(&cli.config)
    .with_context(|| format!("failed to load configuration from {}", cli.config.display()))?;

  // --sql mode never touches broker or database
  if cli.sql {
    return generate_sql(&config);
  }

  init_logging(cli.log.as_deref().unwrap_or(&config.logging.level))?;
  info!("Starting muninn-server {}", env!("CARGO_PKG_VERSION"));

  let storage = Storage::connect(StorageConfig {
    connection_url: config.database.connection_url(),
    pool_size: config.database.pool_size,
    dry_run: cli.dry_run,
  })
  .await
  .context("failed to initialize storage")?;
  if cli.dry_run {
    info!("Running in dry-run mode - SQL will be logged instead of executed");
  } else {
    info!("Storage initialized successfully");
  }
  let sink = Arc::new(storage);

  let routes = config.build_routes();
  // With no routes at all, fall back to the legacy topic list; every
  // message then takes the passthrough path
  let filters: Vec<String> = if routes.is_empty() {
    config.mqtt.topics.clone()
  } else {
    routes.iter().map(|r| r.filter.clone()).collect()
  };

  let mut router = Router::new(routes, Arc::clone(&sink) as Arc<dyn Sink>)
    .context("failed to initialize router")?;
  info!("Router initialized successfully");

  let settings = mqtt::MqttSettings {
    broker: config.mqtt.broker.clone(),
    client_id: config.mqtt.client_id.clone(),
    username: config.mqtt.username.clone(),
    password: config.mqtt.password.clone(),
    qos: config.mqtt.qos,
  };
  let result = mqtt::run(&settings, &filters, &router).await;

  router.close().await;
  drop(router);
  if let Ok(storage) = Arc::try_unwrap(sink) {
    let _ = storage.close().await;
  }

  result
}

/// Load every configured Lua script, merge the declared schemas and print
/// the resulting DDL.
fn generate_sql(config: &Config) -> Result<()> {
  let mut schemas = Vec::new();
  for path in config.script_paths() {
    let schema = Schema::load_from_script(&path)
      .with_context(|| format!("failed to load schema from {path}"))?;
    schemas.push(schema);
  }

  let merged = Schema::merge(schemas);
  if merged.is_empty() {
    println!("-- No schemas defined in Lua scripts");
  } else {
    println!("{}", merged.generate_sql());
  }
  Ok(())
}

/// Initialise the tracing subscriber from a DEBUG/INFO/ERROR level string.
fn init_logging(level: &str) -> Result<()> {
  let level = match level.to_uppercase().as_str() {
    "DEBUG" => "debug",
    "ERROR" => "error",
    // Unknown or empty levels fall back to INFO
    _ => "info",
  };

  tracing_subscriber::registry()
    .with(fmt::layer())
    .with(
      EnvFilter::from_default_env()
        .add_directive(format!("muninn={level}").parse()?)
        .add_directive(format!("muninn_server={level}").parse()?),
    )
    .init();
  Ok(())
}
