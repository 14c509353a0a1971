//! Signal Ledger service
//!
//! Startup order: environment, config, store, static signal batch (bounded by
//! a timeout), settlement scheduler, HTTP server. Ctrl-C stops the server,
//! lets the scheduler finish the signal it is on, then checkpoints the WAL.

use anyhow::{Context, Result};
use clap::Parser;
use dotenv::dotenv;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use signal_ledger::api::create_router;
use signal_ledger::signals::{OutcomeSource, RandomOutcome};
use signal_ledger::{LedgerConfig, LedgerEngine};

#[derive(Parser, Debug)]
#[command(name = "signal-ledger")]
#[command(about = "Signal ledger - balances, signals and settlement")]
struct Args {
    /// TOML config file
    #[arg(long, env = "LEDGER_CONFIG")]
    config: Option<PathBuf>,

    /// SQLite database path (overrides config and LEDGER_DB_PATH)
    #[arg(long)]
    db_path: Option<String>,

    /// HTTP listen address (overrides config and LEDGER_BIND_ADDR)
    #[arg(long)]
    bind: Option<String>,

    /// Seed for settlement outcomes; random if unset
    #[arg(long, env = "LEDGER_OUTCOME_SEED")]
    outcome_seed: Option<u64>,
}

#[tokio::main]
async fn main() -> Result<()> {
    load_env();
    init_tracing();

    let args = Args::parse();
    let mut config = LedgerConfig::load(args.config.as_deref())?;
    if let Some(db_path) = args.db_path {
        config.db_path = db_path;
    }
    if let Some(bind) = args.bind {
        config.bind_addr = bind;
    }
    config.validate()?;

    info!("🚀 Signal ledger starting");
    info!(
        "📋 Config: db={} bind={} settle_every={}s bonus_rate={}",
        config.db_path, config.bind_addr, config.settle_interval_secs, config.referral_bonus_rate
    );

    let bind_addr = config.bind_addr.clone();
    let engine = Arc::new(LedgerEngine::open(config).context("opening ledger store")?);

    // Must finish before the first settlement cycle can see the batch.
    engine
        .seed_static_signals()
        .await
        .context("seeding static signals")?;

    let outcomes: Arc<dyn OutcomeSource> = match args.outcome_seed {
        Some(seed) => {
            warn!("⚠️  Settlement outcomes seeded with {} (deterministic)", seed);
            Arc::new(RandomOutcome::seeded(seed))
        }
        None => Arc::new(RandomOutcome::from_entropy()),
    };
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let scheduler = engine.settlement_scheduler(outcomes).spawn(shutdown_rx);

    let app = create_router(engine.clone());
    let listener = TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("binding {}", bind_addr))?;
    info!("🎯 API server listening on {}", bind_addr);

    let served = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error");

    info!("🛑 Shutting down");
    shutdown_tx.send(true).ok();
    if let Err(e) = scheduler.await {
        error!("Settlement scheduler task failed: {}", e);
    }
    if let Err(e) = engine.close().await {
        error!("Ledger checkpoint failed: {}", e);
    }

    served
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for ctrl-c: {}", e);
        std::future::pending::<()>().await;
    }
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "signal_ledger=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

fn load_env() {
    // 1) Standard dotenv search (cwd + parents)
    let _ = dotenv();

    // 2) Also try the crate root when launched from elsewhere
    let manifest_dir = Path::new(env!("CARGO_MANIFEST_DIR"));
    let candidate = manifest_dir.join(".env");
    if candidate.exists() {
        let _ = dotenv::from_path(&candidate);
    }
}
