use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{anyhow, Context, Result};
use clap::{Arg, ArgAction, ArgMatches, Command};
use config::{Config as SettingsBuilder, Environment};
use fs2::FileExt;
use metrics::describe_counter;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use pilestore_rpc::{start_server, AppState};
use pilestore_security::{RateLimitConfig, RateLimiter};
use pilestore_storage::{
    Config as PileTable, EntryStore, ExpirySweeper, PileStorage, SweepSettings,
};
use serde::Deserialize;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

mod version;

use version::{git_commit_hash, PILESTORE_VERSION};

const DEFAULT_DATA_DIR: &str = "./data";
const PILE_TABLE_FILENAME: &str = "pilestore.json";
const LOCK_FILENAME: &str = ".pilestore.lock";

/// Service settings after defaults, `PILESTORE_*` variables and flags are merged.
#[derive(Debug, Clone, PartialEq, Eq)]
struct AppConfig {
    data_dir: PathBuf,
    pile_config: PathBuf,
    bind: IpAddr,
    port: u16,
    sweep_interval: Duration,
    orphan_grace: Duration,
    log_level: String,
    log_format: String,
    prometheus_enabled: bool,
}

#[derive(Debug, Deserialize)]
struct RawSettings {
    data_dir: String,
    #[serde(default)]
    config: Option<String>,
    bind: String,
    port: u16,
    sweep_interval: String,
    orphan_grace: String,
    log_level: String,
    log_format: String,
    metrics: bool,
}

impl AppConfig {
    fn load(environment: Environment) -> Result<Self> {
        let settings = SettingsBuilder::builder()
            .set_default("data_dir", DEFAULT_DATA_DIR)?
            .set_default("bind", "0.0.0.0")?
            .set_default("port", 1995)?
            .set_default("sweep_interval", "5m")?
            .set_default("orphan_grace", "10m")?
            .set_default("log_level", "info")?
            .set_default("log_format", "pretty")?
            .set_default("metrics", true)?
            .add_source(environment)
            .build()
            .context("failed to read service settings")?;

        let raw: RawSettings = settings
            .try_deserialize()
            .context("invalid service settings")?;
        Self::from_raw(raw)
    }

    fn from_raw(raw: RawSettings) -> Result<Self> {
        let data_dir = PathBuf::from(&raw.data_dir);
        let pile_config = raw
            .config
            .filter(|path| !path.trim().is_empty())
            .map(PathBuf::from)
            .unwrap_or_else(|| data_dir.join(PILE_TABLE_FILENAME));
        let bind = raw
            .bind
            .parse()
            .with_context(|| format!("invalid bind address {}", raw.bind))?;

        Ok(Self {
            data_dir,
            pile_config,
            bind,
            port: raw.port,
            sweep_interval: parse_duration("sweep interval", &raw.sweep_interval)?,
            orphan_grace: parse_duration("orphan grace", &raw.orphan_grace)?,
            log_level: raw.log_level,
            log_format: raw.log_format,
            prometheus_enabled: raw.metrics,
        })
    }

    fn validate(&self) -> Result<()> {
        if self.sweep_interval.is_zero() {
            anyhow::bail!("sweep interval must be greater than zero");
        }
        if !matches!(self.log_format.as_str(), "pretty" | "json") {
            anyhow::bail!(
                "unknown log format {} (expected pretty or json)",
                self.log_format
            );
        }
        Ok(())
    }

    fn listen_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind, self.port)
    }

    fn sweep_settings(&self) -> SweepSettings {
        SweepSettings {
            interval: self.sweep_interval,
            orphan_grace: self.orphan_grace,
        }
    }
}

fn parse_duration(label: &str, value: &str) -> Result<Duration> {
    humantime::parse_duration(value.trim())
        .with_context(|| format!("invalid {label} {value:?}"))
}

fn cli() -> Command {
    Command::new("pilestore")
        .version(PILESTORE_VERSION)
        .about("Multi-tenant ephemeral blob storage")
        .disable_version_flag(true)
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("Pile configuration file (JSON or TOML)"),
        )
        .arg(
            Arg::new("data-dir")
                .short('d')
                .long("data-dir")
                .value_name("DIR")
                .help("Data directory"),
        )
        .arg(
            Arg::new("bind")
                .long("bind")
                .value_name("ADDR")
                .help("Address to listen on"),
        )
        .arg(
            Arg::new("port")
                .short('p')
                .long("port")
                .value_name("PORT")
                .value_parser(clap::value_parser!(u16))
                .help("Port to listen on"),
        )
        .arg(
            Arg::new("log-level")
                .long("log-level")
                .value_name("LEVEL")
                .value_parser(["trace", "debug", "info", "warn", "error"])
                .help("Override the log level"),
        )
        .arg(
            Arg::new("log-format")
                .long("log-format")
                .value_name("FORMAT")
                .value_parser(["pretty", "json"])
                .help("Select log output format"),
        )
        .arg(
            Arg::new("sweep-interval")
                .long("sweep-interval")
                .value_name("DURATION")
                .help("Time between expiration sweeps, e.g. 5m"),
        )
        .arg(
            Arg::new("check")
                .long("check")
                .action(ArgAction::SetTrue)
                .help("Load the configuration, reconcile the store and exit"),
        )
        .arg(
            Arg::new("version")
                .short('V')
                .long("version")
                .action(ArgAction::SetTrue)
                .help("Print version information and exit"),
        )
}

fn load_config_with_overrides(matches: &ArgMatches, environment: Environment) -> Result<AppConfig> {
    let mut config = AppConfig::load(environment)?;
    apply_overrides(matches, &mut config)?;
    config.validate()?;
    Ok(config)
}

fn apply_overrides(matches: &ArgMatches, config: &mut AppConfig) -> Result<()> {
    if let Some(data_dir) = matches.get_one::<String>("data-dir") {
        let default_table = config.data_dir.join(PILE_TABLE_FILENAME);
        config.data_dir = PathBuf::from(data_dir);
        if config.pile_config == default_table {
            config.pile_config = config.data_dir.join(PILE_TABLE_FILENAME);
        }
    }

    if let Some(path) = matches.get_one::<String>("config") {
        config.pile_config = PathBuf::from(path);
    }

    if let Some(bind) = matches.get_one::<String>("bind") {
        config.bind = bind
            .parse()
            .with_context(|| format!("invalid bind address {bind}"))?;
    }

    if let Some(port) = matches.get_one::<u16>("port") {
        config.port = *port;
    }

    if let Some(log_level) = matches.get_one::<String>("log-level") {
        config.log_level = log_level.clone();
    }

    if let Some(log_format) = matches.get_one::<String>("log-format") {
        config.log_format = log_format.clone();
    }

    if let Some(interval) = matches.get_one::<String>("sweep-interval") {
        config.sweep_interval = parse_duration("sweep interval", interval)?;
    }

    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let matches = cli().get_matches();

    if matches.get_flag("version") {
        print_version_info();
        return Ok(());
    }

    let config = load_config_with_overrides(&matches, Environment::with_prefix("PILESTORE"))?;
    init_logging(&config)?;

    info!(
        version = PILESTORE_VERSION,
        commit = git_commit_hash(),
        data_dir = %config.data_dir.display(),
        piles = %config.pile_config.display(),
        "Starting pilestore"
    );

    if matches.get_flag("check") {
        let _lock = DataDirLock::acquire(&config.data_dir, "check")?;
        let (store, piles) = open_store(&config)?;
        println!(
            "pilestore {}: {} pile(s) configured, {} entries in store",
            PILESTORE_VERSION,
            piles.piles.len(),
            count_entries(&store, &piles)
        );
        return Ok(());
    }

    let _lock = DataDirLock::acquire(&config.data_dir, "serve")?;
    let (store, piles) = open_store(&config)?;
    let store = Arc::new(store);
    let piles = Arc::new(piles);

    let metrics = init_metrics(&config);

    let sweeper = ExpirySweeper::new(
        Arc::clone(&store),
        Arc::clone(&piles),
        config.sweep_settings(),
    );
    if let Err(err) = sweeper.sweep_once().await {
        warn!(operation = "startup", error = %err, "Initial sweep failed");
    }
    let sweeper = sweeper.spawn();

    let limiter = RateLimiter::new(RateLimitConfig::default())
        .map_err(|err| anyhow!("failed to build rate limiter: {err}"))?;
    let storage: Arc<dyn PileStorage> = store.clone();
    let mut state = AppState::new(storage, piles, Arc::new(limiter));
    state.metrics = metrics;

    let served = start_server(state, config.listen_addr(), shutdown_signal()).await;

    sweeper.stop().await;
    if let Err(err) = store.meta().flush() {
        error!(error = %err, "Failed to flush metadata store");
    }
    info!("pilestore stopped");
    served
}

/// Load the pile table, open both stores and reconcile them.
fn open_store(config: &AppConfig) -> Result<(EntryStore, PileTable)> {
    let piles = PileTable::load(&config.pile_config).with_context(|| {
        format!(
            "failed to load pile configuration from {}",
            config.pile_config.display()
        )
    })?;
    let store = EntryStore::open(&config.data_dir).with_context(|| {
        format!("failed to open store in {}", config.data_dir.display())
    })?;
    let report = store
        .startup(&piles)
        .context("startup reconciliation failed")?;
    for (pile, entries) in &report.dropped {
        info!(operation = "startup", pile = %pile, entries, "Forgot unconfigured pile");
    }
    Ok((store, piles))
}

fn count_entries(store: &EntryStore, piles: &PileTable) -> usize {
    store.meta().read(|txn| {
        Ok::<_, std::convert::Infallible>(
            piles
                .pile_names()
                .filter_map(|pile| txn.namespace(pile))
                .map(|namespace| namespace.len())
                .sum(),
        )
    })
    .unwrap_or_default()
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        error!(error = %err, "Failed to listen for shutdown signal");
        return;
    }
    info!("Shutdown signal received");
}

fn init_metrics(config: &AppConfig) -> Option<PrometheusHandle> {
    if !config.prometheus_enabled {
        info!("Prometheus metrics exporter disabled via configuration");
        return None;
    }

    match PrometheusBuilder::new().install_recorder() {
        Ok(handle) => {
            info!("Prometheus metrics exporter registered");
            describe_counter!("pilestore_entries_created_total", "Entries stored");
            describe_counter!(
                "pilestore_entries_expired_total",
                "Entries removed by the expiration sweeper"
            );
            describe_counter!(
                "pilestore_orphans_reclaimed_total",
                "Blob files without metadata removed by the sweeper"
            );
            describe_counter!(
                "pilestore_rate_limited_total",
                "Requests refused by the rate limiter"
            );
            Some(handle)
        }
        Err(err) => {
            warn!("Failed to install Prometheus metrics exporter: {}", err);
            None
        }
    }
}

fn init_logging(config: &AppConfig) -> Result<()> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    if config.log_format == "json" {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .try_init()?;
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().pretty())
            .try_init()?;
    }

    Ok(())
}

fn print_version_info() {
    println!("pilestore {} (commit {})", PILESTORE_VERSION, git_commit_hash());
}

/// Exclusive advisory lock on the data directory, released on drop.
///
/// sled and the blob tree assume a single owner, so a second pilestore
/// pointed at the same directory must refuse to start.
struct DataDirLock {
    path: PathBuf,
    file: File,
}

impl DataDirLock {
    fn acquire<P: AsRef<Path>>(data_dir: P, mode: &str) -> Result<Self> {
        let dir = data_dir.as_ref();
        fs::create_dir_all(dir)
            .with_context(|| format!("failed to create data directory {}", dir.display()))?;
        let lock_path = dir.join(LOCK_FILENAME);
        let mut file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(&lock_path)
            .with_context(|| format!("failed to open {}", lock_path.display()))?;

        if file.try_lock_exclusive().is_err() {
            let holder = fs::read_to_string(&lock_path).unwrap_or_default();
            let holder = holder.trim();
            anyhow::bail!(
                "another pilestore already owns {} ({})",
                dir.display(),
                if holder.is_empty() { "holder unknown" } else { holder }
            );
        }

        let since = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.as_secs())
            .unwrap_or_default();
        file.set_len(0)?;
        writeln!(
            file,
            "pid {} mode {} since {} version {}",
            std::process::id(),
            mode,
            since,
            PILESTORE_VERSION
        )?;
        file.flush()?;

        Ok(Self {
            path: lock_path,
            file,
        })
    }
}

impl Drop for DataDirLock {
    fn drop(&mut self) {
        let _ = self.file.unlock();
        let _ = fs::remove_file(&self.path);
    }
}
