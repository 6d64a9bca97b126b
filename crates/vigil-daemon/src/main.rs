use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context};
use chrono::Utc;
use clap::{Parser, Subcommand};
use rusqlite::Connection;
use tokio::sync::watch;
use tracing::{error, info, warn};
use uuid::Uuid;
use vigil_core::VigilConfig;
use vigil_sensors::{
    DaemonSettings, LeaseOutcome, LeaseStore, SensorDaemon, SensorHandle, SensorId,
    SensorRegistry, SqliteSensorStore, TickQuery, TickRunner, TickSettings,
};

mod directory;
mod spool;

const LEASE_NAME: &str = "sensor-daemon";

#[derive(Parser)]
#[command(name = "vigil-daemon", version, about = "Sensor evaluation and run scheduling daemon")]
struct Cli {
    /// Config file (default: $VIGIL_CONFIG or ~/.vigil/vigil.toml).
    #[arg(long, global = true)]
    config: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the scheduler until interrupted.
    Run,
    /// Show recent ticks of a sensor.
    Ticks {
        /// Sensor as <location>/<name>.
        sensor: String,
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    /// Print a sensor's cursor, or clear it with --reset.
    Cursor {
        sensor: String,
        #[arg(long)]
        reset: bool,
    },
    /// Resume ticking a sensor.
    Start { sensor: String },
    /// Stop ticking a sensor.
    Stop { sensor: String },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "vigil_daemon=info,vigil_sensors=info".into()),
        )
        .init();

    let cli = Cli::parse();

    // explicit flag > VIGIL_CONFIG env > ~/.vigil/vigil.toml
    let config_path = cli.config.or_else(|| std::env::var("VIGIL_CONFIG").ok());
    let config = VigilConfig::load(config_path.as_deref()).map_err(|e| {
        error!(code = e.code(), error = %e, "cannot load configuration");
        e
    })?;

    match cli.command {
        Command::Run => run(config).await,
        Command::Ticks { sensor, limit } => {
            let handle = open_handle(&config)?;
            for tick in handle.ticks(&parse_sensor(&sensor)?, &TickQuery::latest(limit))? {
                let keys: Vec<_> = tick.run_keys().collect();
                println!(
                    "{}  {:<8} dispatched={} suppressed={} keys=[{}]{}{}",
                    tick.ended_at.to_rfc3339(),
                    tick.status,
                    tick.dispatched.len(),
                    tick.suppressed_keys.len(),
                    keys.join(","),
                    tick.skip_reason
                        .as_deref()
                        .map(|r| format!(" skip=\"{r}\""))
                        .unwrap_or_default(),
                    tick.error
                        .as_deref()
                        .map(|e| format!(" error=\"{e}\""))
                        .unwrap_or_default(),
                );
            }
            Ok(())
        }
        Command::Cursor { sensor, reset } => {
            let handle = open_handle(&config)?;
            let id = parse_sensor(&sensor)?;
            if reset {
                handle.set_cursor(&id, None)?;
                println!("cursor cleared for {id}");
            } else {
                match handle.cursor(&id)? {
                    Some(cursor) => println!("{cursor}"),
                    None => println!("(no cursor)"),
                }
            }
            Ok(())
        }
        Command::Start { sensor } => {
            let id = parse_sensor(&sensor)?;
            open_handle(&config)?.start(&id)?;
            println!("{id} started");
            Ok(())
        }
        Command::Stop { sensor } => {
            let id = parse_sensor(&sensor)?;
            open_handle(&config)?.stop(&id)?;
            println!("{id} stopped");
            Ok(())
        }
    }
}

async fn run(config: VigilConfig) -> anyhow::Result<()> {
    let db_path = &config.database.path;
    info!(path = %db_path, "opening SQLite database");
    let store = Arc::new(SqliteSensorStore::new(open_db(db_path)?)?);
    let leases = LeaseStore::new(open_db(db_path)?)?;

    let holder = format!("{}-{}", std::process::id(), Uuid::new_v4());
    let ttl = chrono::Duration::seconds(config.daemon.lease_ttl_secs as i64);
    if let LeaseOutcome::HeldBy { holder: other, expires_at } =
        leases.try_acquire(LEASE_NAME, &holder, ttl, Utc::now())?
    {
        bail!("another daemon ({other}) holds the scheduler lease until {expires_at}");
    }
    info!(%holder, "scheduler lease acquired");

    let registry = Arc::new(SensorRegistry::new(Default::default()));
    for sensor in &config.sensors {
        registry.register(
            directory::definition(sensor),
            Arc::new(directory::DirectorySensor::new(&sensor.directory, &sensor.job)),
        )?;
    }
    if registry.all().is_empty() {
        warn!("no sensors configured; the daemon will idle");
    }

    let runner = Arc::new(TickRunner::new(
        store,
        Arc::new(spool::SpoolDispatcher::new(&config.dispatch.spool_dir)),
        registry,
        TickSettings::from_config(&config),
    ));
    let daemon = SensorDaemon::new(runner, DaemonSettings::from_config(&config));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let daemon_task = tokio::spawn(daemon.run(shutdown_rx));

    tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            signal?;
            info!("interrupt received");
        }
        lost = keep_lease(&leases, &holder, ttl) => {
            error!(error = %lost, "scheduler lease lost; stopping");
        }
    }

    let _ = shutdown_tx.send(true);
    daemon_task.await?;
    leases.release(LEASE_NAME, &holder)?;
    Ok(())
}

/// Renew the lease until renewal fails. Returns the failure.
async fn keep_lease(
    leases: &LeaseStore,
    holder: &str,
    ttl: chrono::Duration,
) -> vigil_sensors::SensorError {
    let period = ttl
        .to_std()
        .map(|d| d / 3)
        .unwrap_or(Duration::from_secs(10))
        .max(Duration::from_millis(100));
    let mut interval = tokio::time::interval(period);
    interval.tick().await;
    loop {
        interval.tick().await;
        if let Err(e) = leases.renew(LEASE_NAME, holder, ttl, Utc::now()) {
            return e;
        }
    }
}

fn open_handle(config: &VigilConfig) -> anyhow::Result<SensorHandle> {
    Ok(SensorHandle::open(open_db(&config.database.path)?)?)
}

fn open_db(path: &str) -> anyhow::Result<Connection> {
    ensure_parent_dir(path);
    let db = Connection::open(path).with_context(|| format!("opening database {path}"))?;
    db.execute_batch("PRAGMA journal_mode=WAL; PRAGMA busy_timeout=5000;")?;
    Ok(db)
}

fn parse_sensor(s: &str) -> anyhow::Result<SensorId> {
    SensorId::parse(s).ok_or_else(|| anyhow!("expected <location>/<name>, got '{s}'"))
}

fn ensure_parent_dir(path: &str) {
    if let Some(parent) = Path::new(path).parent() {
        if !parent.as_os_str().is_empty() {
            if let Err(e) = std::fs::create_dir_all(parent) {
                warn!(path = %parent.display(), error = %e, "cannot create database directory");
            }
        }
    }
}
