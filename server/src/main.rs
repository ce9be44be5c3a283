use anyhow::{Context, Result};
use clap::Parser;
use crashline_engine::{CrashEngine, EngineConfig};
use crashline_server::api;
use crashline_server::cache::TtlCache;
use crashline_server::config::ServerConfig;
use crashline_server::coordinator::{BetCoordinator, BetLimits, CashoutThrottle};
use crashline_server::db;
use crashline_server::driver;
use crashline_server::ledger::{Ledger, LedgerConfig};
use crashline_server::payments::gateway::{GatewayConfig, PaymentGateway};
use crashline_server::payments::{PaymentsService, Reconciler};
use crashline_server::seed_store::SeedStore;
use crashline_server::AppState;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch, Mutex};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Host interface to bind (default: localhost).
    #[arg(long, default_value = "127.0.0.1")]
    host: IpAddr,

    #[arg(short, long, default_value_t = 8080)]
    port: u16,

    /// SQLite database path or URL.
    #[arg(long, default_value = "sqlite://crashline.db")]
    db: String,
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing();

    let config = ServerConfig::from_env().map_err(|err| anyhow::anyhow!(err.to_string()))?;

    let pool = db::connect(&args.db, &config.db)
        .await
        .with_context(|| format!("failed to open database {}", args.db))?;

    let write_gate = Arc::new(Mutex::new(()));
    let ledger = Ledger::new(
        pool.clone(),
        Arc::clone(&write_gate),
        LedgerConfig {
            settlement_window_seconds: config.settlement_window_seconds,
            max_round_age_ms: config.max_round_age_ms,
        },
    );

    let seed_store = Arc::new(
        SeedStore::new(
            pool.clone(),
            Arc::clone(&write_gate),
            config.seed_master.as_deref(),
            config.allow_ephemeral_seeds,
        )
        .map_err(|err| anyhow::anyhow!(err.to_string()))?,
    );
    seed_store
        .verify_chain_head()
        .await
        .map_err(|err| anyhow::anyhow!(err.to_string()))?;

    let (engine, round_events) = CrashEngine::new(EngineConfig {
        round_gap_ms: config.round_gap_ms,
        client_seed: Vec::new(),
    });
    let engine = Arc::new(Mutex::new(engine));

    let coordinator = BetCoordinator::new(
        Arc::clone(&engine),
        ledger.clone(),
        BetLimits {
            min_bet: config.min_bet,
            max_bet: config.max_bet,
        },
        CashoutThrottle {
            min_interval_ms: config.cashout_min_interval_ms,
            prune_age_ms: config.cashout_prune_age_ms,
            max_entries: config.max_cashout_entries,
        },
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let gateway = PaymentGateway::new(GatewayConfig {
        collections_base_url: config.collections_base_url.clone(),
        disbursements_base_url: config.disbursements_base_url.clone(),
        token: config.gateway_token.clone(),
        account_name: "crashline".to_string(),
    })
    .map_err(|err| anyhow::anyhow!(err.to_string()))?;

    let reconciler = Reconciler::new(
        ledger.clone(),
        gateway.clone(),
        config.polling.clone(),
        shutdown_rx.clone(),
    );
    reconciler
        .resume()
        .await
        .map_err(|err| anyhow::anyhow!(err.to_string()))?;

    let payments = PaymentsService::new(
        ledger.clone(),
        gateway,
        config.payment_limits.clone(),
        Arc::clone(&reconciler),
    );

    let cache = Arc::new(TtlCache::new(1_024));
    let cache_sweeper = cache.start(Duration::from_secs(5));

    let cashout_gate = coordinator.cashout_gate();
    let gate_pruner = cashout_gate.start(Duration::from_millis(
        (config.cashout_prune_age_ms.max(1_000) as u64) / 2,
    ));

    let (ticks, _) = broadcast::channel(256);
    let tick_loop = driver::spawn_tick_loop(
        Arc::clone(&engine),
        Arc::clone(&seed_store),
        ticks.clone(),
        config.broadcast_interval_ms,
        shutdown_rx.clone(),
    );
    let settlement = driver::spawn_settlement(ledger.clone(), round_events);

    let state = Arc::new(AppState {
        config,
        engine: Arc::clone(&engine),
        ledger,
        seed_store,
        coordinator,
        payments,
        cache,
        ticks,
    });
    let app = api::router(state);

    let addr = SocketAddr::new(args.host, args.port);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!(%addr, "listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    // Shutdown order: connections are drained, then the tick loop stops,
    // the engine forgets its seed, in-flight payment polls wind down, and
    // the pool closes last.
    info!("shutting down");
    let _ = shutdown_tx.send(true);
    let _ = tick_loop.await;
    engine.lock().await.dispose();
    reconciler.drain(Duration::from_secs(10)).await;
    settlement.abort();
    cache_sweeper.abort();
    gate_pruner.abort();
    pool.close().await;

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };
    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(_) => std::future::pending().await,
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
