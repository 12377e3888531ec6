use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;
use url::Url;

use invoice_sync::cache::{CacheStorage, SqliteStorage};
use invoice_sync::config::Config;
use invoice_sync::event::{ConnectivityProbe, EventHandler, HttpProbe};
use invoice_sync::mediator::{HttpFetcher, NetworkMediator, Request};
use invoice_sync::store::{OfflineStore, RecordType};
use invoice_sync::sync::{HttpRemoteSync, SyncEngine};

#[derive(Parser, Debug)]
#[command(name = "invoice-sync")]
#[command(about = "Offline-first cache and sync layer for the invoicing app")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/invoice-sync/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Save a record locally (marked pending)
  Save {
    record_type: String,
    id: String,
    /// JSON payload
    data: String,
  },
  /// Show one record, or every record of a type
  Get { record_type: String, id: Option<String> },
  /// Delete one record
  Remove { record_type: String, id: String },
  /// Delete every record of a type, or everything
  Clear { record_type: Option<String> },
  /// Print the number of records awaiting sync
  Pending,
  /// Push pending records to the backend
  Sync,
  /// Fill the precache partition from the manifest
  Install,
  /// Install if needed, then purge partitions of other versions
  Activate,
  /// List cache partitions
  Partitions,
  /// Serve a URL through the mediator
  Fetch {
    url: String,
    /// Treat the request as a page navigation
    #[arg(long)]
    navigate: bool,
  },
  /// Watch connectivity and sync whenever the backend comes back
  Watch,
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();
  let config = Config::load(args.config.as_deref())?;
  let _guard = init_logging()?;

  match args.command {
    Command::Save {
      record_type,
      id,
      data,
    } => {
      let store = open_store(&config)?;
      let data: serde_json::Value =
        serde_json::from_str(&data).map_err(|e| eyre!("Invalid JSON payload: {}", e))?;
      let record = store.save(&RecordType::from(record_type.as_str()), &id, data)?;
      println!("{}", serde_json::to_string_pretty(&record)?);
      println!("pending: {}", store.pending_count()?);
    }
    Command::Get { record_type, id } => {
      let store = open_store(&config)?;
      let records = store.get(&RecordType::from(record_type.as_str()), id.as_deref())?;
      println!("{}", serde_json::to_string_pretty(&records)?);
    }
    Command::Remove { record_type, id } => {
      let store = open_store(&config)?;
      let removed = store.remove(&RecordType::from(record_type.as_str()), &id)?;
      println!("removed: {}, pending: {}", removed, store.pending_count()?);
    }
    Command::Clear { record_type } => {
      let store = open_store(&config)?;
      let record_type = record_type.map(|t| RecordType::from(t.as_str()));
      let deleted = store.clear(record_type.as_ref())?;
      println!("deleted: {}", deleted);
    }
    Command::Pending => {
      let store = open_store(&config)?;
      println!("{}", store.pending_count()?);
    }
    Command::Sync => {
      let store = Arc::new(open_store(&config)?);
      let online = probe(&config)?.is_reachable().await;
      let engine = sync_engine(&config, store, online)?;
      if !online {
        println!("backend unreachable, {} record(s) stay pending", engine.store().pending_count()?);
        return Ok(());
      }
      let report = engine.sync_all().await?;
      println!(
        "attempted: {}, synced: {}, failed: {}",
        report.attempted, report.succeeded, report.failed
      );
    }
    Command::Install => {
      let mediator = mediator(&config)?;
      mediator.install().await?;
      println!("installed {}", mediator.config().precache_name());
    }
    Command::Activate => {
      let mediator = mediator(&config)?;
      mediator.install().await?;
      let deleted = mediator.activate().await?;
      println!("active: {}, purged: {:?}", mediator.config().version, deleted);
    }
    Command::Partitions => {
      let storage = open_cache(&config)?;
      for name in storage.partition_names()? {
        let count = storage.entry_count(&name)?;
        println!("{}\t{}", name, count);
      }
    }
    Command::Fetch { url, navigate } => {
      let mediator = mediator(&config)?;
      if !mediator.resume()? {
        mediator.install().await?;
        mediator.activate().await?;
      }

      let url = config
        .origin_url()?
        .join(&url)
        .map_err(|e| eyre!("Invalid URL '{}': {}", url, e))?;
      let request = if navigate {
        Request::navigate(url)
      } else {
        Request::get(url)
      };

      let served = mediator.handle(&request).await?;
      // Let background revalidation land before the process exits.
      mediator.tasks().settle().await;
      eprintln!("status: {} ({:?})", served.response.status, served.source);
      println!("{}", String::from_utf8_lossy(&served.response.body));
    }
    Command::Watch => {
      let store = Arc::new(open_store(&config)?);
      let engine = sync_engine(&config, store, false)?;
      let events = EventHandler::with_probe(
        probe(&config)?,
        Duration::from_secs(config.sync.probe_interval_secs),
      );

      let mut pending = engine.store().subscribe_pending();
      tokio::spawn(async move {
        while pending.changed().await.is_ok() {
          let count = *pending.borrow();
          tracing::info!(pending = count, "Pending count changed");
        }
      });

      tokio::select! {
        _ = engine.run(events) => {}
        _ = tokio::signal::ctrl_c() => {}
      }
    }
  }

  Ok(())
}

/// Log to a daily rolling file in the data directory.
fn init_logging() -> Result<WorkerGuard> {
  let log_dir = Config::data_dir()?.join("logs");
  std::fs::create_dir_all(&log_dir)
    .map_err(|e| eyre!("Failed to create log directory {}: {}", log_dir.display(), e))?;

  let appender = tracing_appender::rolling::daily(&log_dir, "invoice-sync.log");
  let (writer, guard) = tracing_appender::non_blocking(appender);

  let filter =
    EnvFilter::try_from_env("INVOICE_SYNC_LOG").unwrap_or_else(|_| EnvFilter::new("info"));

  tracing_subscriber::fmt()
    .with_env_filter(filter)
    .with_writer(writer)
    .with_ansi(false)
    .init();

  Ok(guard)
}

fn open_store(config: &Config) -> Result<OfflineStore> {
  let path = match &config.store.database {
    Some(path) => path.clone(),
    None => OfflineStore::default_path()?,
  };
  let store = OfflineStore::new(path);
  store.open()?;
  Ok(store)
}

fn open_cache(config: &Config) -> Result<SqliteStorage> {
  let storage = match &config.cache.database {
    Some(path) => SqliteStorage::open_at(path)?,
    None => SqliteStorage::open()?,
  };
  Ok(storage)
}

fn mediator(config: &Config) -> Result<NetworkMediator<SqliteStorage, HttpFetcher>> {
  Ok(NetworkMediator::new(
    config.mediator_config()?,
    open_cache(config)?,
    HttpFetcher::new()?,
  ))
}

fn sync_engine(
  config: &Config,
  store: Arc<OfflineStore>,
  online: bool,
) -> Result<SyncEngine<HttpRemoteSync>> {
  let remote = HttpRemoteSync::new(
    config.backend_base()?,
    config.sync.endpoints.clone(),
    Duration::from_secs(config.cache.fetch_timeout_secs),
  )?;
  Ok(SyncEngine::new(store, remote, online).with_background_tags(config.sync.background_tags.clone()))
}

fn probe(config: &Config) -> Result<HttpProbe> {
  let url: Url = config.backend_base()?;
  Ok(HttpProbe::new(url, Duration::from_secs(5))?)
}
