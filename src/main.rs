mod api;
mod bed;
mod diagnostics;
mod sync;
mod time_provider;

use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::{Context, Result, bail};
use clap::{ArgAction, Parser};
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use crate::api::{ApiServer, ApiServerConfig};
use crate::bed::board::BedBoard;
use crate::bed::catalog::load_clinic_config;
use crate::diagnostics::{DiagnosticsContext, sleep_until};
use crate::sync::bridge::{PersistenceBridge, RealtimeFeed};
use crate::sync::cache::LocalCache;
use crate::sync::remote::{RemoteWorker, TableDirStore};
use crate::time_provider::{SystemClock, TimeProvider};

#[derive(Parser, Debug)]
#[command(
    name = "bedboard",
    version,
    about = "Clinic treatment-bed scheduler with local cache and shared-store sync"
)]
struct Cli {
    #[arg(long, default_value = "clinic.json")]
    config: PathBuf,

    /// Local bed cache, rewritten after every change.
    #[arg(long, default_value = "beds-cache.json")]
    state: PathBuf,

    /// Shared directory used as the remote bed and visit store.
    #[arg(long)]
    remote_dir: Option<PathBuf>,

    #[arg(long)]
    tick_ms: Option<u64>,

    #[arg(long)]
    diagnostics: bool,

    #[arg(long, default_value = "0.0.0.0")]
    api_bind: String,

    #[arg(long, default_value_t = 8098)]
    api_port: u16,

    #[arg(long, default_value_t = true, action = ArgAction::Set)]
    mdns_enabled: bool,

    #[arg(long, default_value = "bedboard")]
    mdns_instance: String,

    /// Overrides RUST_LOG, e.g. `bedboard=debug`.
    #[arg(long)]
    log_filter: Option<String>,
}

fn main() {
    if let Err(err) = run() {
        eprintln!("error: {err:#}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_filter.as_deref())?;
    if cli.tick_ms == Some(0) {
        bail!("--tick-ms must be greater than zero");
    }

    let config = load_clinic_config(&cli.config)
        .with_context(|| format!("failed to load {}", cli.config.display()))?;
    info!(
        version = config.version,
        presets = config.catalog.presets.len(),
        quick_treatments = config.catalog.quick_treatments.len(),
        "clinic config loaded"
    );
    let mut settings = config.settings;
    if let Some(tick_ms) = cli.tick_ms {
        settings.tick_ms = tick_ms;
    }

    let clock: Arc<dyn TimeProvider> = Arc::new(SystemClock);
    let cache = LocalCache::new(&cli.state);
    let roster = cache.load_roster(settings.bed_count);
    let sync_mode = match &cli.remote_dir {
        Some(dir) => format!("remote ({})", dir.display()),
        None => "local only".to_string(),
    };

    if cli.diagnostics {
        let cache_path = cache.path().display().to_string();
        let board = BedBoard::new(
            roster,
            Box::new(PersistenceBridge::new(cache, None)),
            config.catalog,
            settings,
            Arc::clone(&clock),
            None,
        );
        diagnostics::run_diagnostics(
            &board,
            &DiagnosticsContext {
                clock_label: clock.label(),
                sync_mode,
                cache_path,
            },
        );
        return Ok(());
    }

    let remote = match &cli.remote_dir {
        Some(dir) => {
            let store = TableDirStore::open(dir, Arc::clone(&clock))
                .with_context(|| format!("failed to open remote store {}", dir.display()))?;
            Some(RemoteWorker::spawn(Box::new(store)))
        }
        None => None,
    };
    let bridge = PersistenceBridge::new(cache, remote);
    let visits = bridge.visit_log();
    let tick = Duration::from_millis(settings.tick_ms);
    let board = Arc::new(Mutex::new(BedBoard::new(
        roster,
        Box::new(bridge),
        config.catalog,
        settings,
        Arc::clone(&clock),
        visits,
    )));

    let (realtime_tx, feed) = RealtimeFeed::channel();
    let api_server = ApiServer::start(
        ApiServerConfig {
            bind_addr: cli.api_bind.clone(),
            port: cli.api_port,
            mdns_enabled: cli.mdns_enabled,
            mdns_instance: cli.mdns_instance,
        },
        Arc::clone(&board),
        realtime_tx,
    )
    .with_context(|| {
        format!(
            "failed to start local API at {}:{}",
            cli.api_bind, cli.api_port
        )
    })?;

    info!(%sync_mode, tick_ms = tick.as_millis() as u64, "bed board running");
    let result = run_tick_loop(&board, &feed, tick);
    drop(api_server);
    result
}

fn run_tick_loop(board: &Arc<Mutex<BedBoard>>, feed: &RealtimeFeed, tick: Duration) -> Result<()> {
    let mut next_tick = Instant::now() + tick;
    loop {
        sleep_until(next_tick);
        next_tick += tick;
        // Skip missed ticks after a stall.
        let now = Instant::now();
        if next_tick < now {
            next_tick = now + tick;
        }

        let mut guard = board
            .lock()
            .map_err(|_| anyhow::anyhow!("bed board lock poisoned"))?;
        for event in feed.drain() {
            if !guard.apply_realtime(&event) {
                warn!(bed_id = event.bed_id, stamp = event.timestamp, "realtime event not applied");
            }
        }
        let outcome = guard.tick();
        drop(guard);

        if outcome.updated > 0 {
            debug!(updated = outcome.updated, "timers refreshed");
        }
        for bed_id in outcome.overtime {
            warn!(bed_id, "treatment step overtime");
        }
        for bed_id in outcome.near_end {
            info!(bed_id, "treatment step nearly finished");
        }
        match outcome.keep_awake {
            Some(true) => info!("keep-awake asserted"),
            Some(false) => info!("keep-awake released"),
            None => {}
        }
    }
}

fn init_tracing(filter: Option<&str>) -> Result<()> {
    let filter = match filter {
        Some(directives) => EnvFilter::try_new(directives)
            .with_context(|| format!("invalid --log-filter '{directives}'"))?,
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init()
        .map_err(|err| anyhow::anyhow!("could not install log subscriber: {err}"))
}
