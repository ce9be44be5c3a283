//! Background tasks that keep the engine moving: the tick loop and the
//! lifecycle settlement consumer.
//!
//! The tick loop advances the engine on a fixed cadence, starts the next
//! round from the seed store when one is due, and publishes a status frame
//! on the broadcast channel. Frames are lossy by design — a dropped frame
//! is superseded by the next one — and publishing never blocks. Lifecycle
//! events travel on a separate unbounded channel and are consumed reliably
//! by the settlement task, which writes round starts and crashes through
//! the ledger.

use crate::ledger::Ledger;
use crate::seed_store::SeedStore;
use crashline_engine::{CrashEngine, EngineStatus, RoundEvent};
use crashline_types::api::TickFrame;
use crashline_types::now_ms;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{error, warn};

pub fn frame_from(status: &EngineStatus) -> TickFrame {
    TickFrame {
        round_id: status.round_id,
        status: status.status,
        multiplier: status.multiplier,
        started_at: status.started_at,
        commit_idx: status.commit_idx,
        server_seed_hash: status.seed_hash.map(hex::encode),
    }
}

/// Spawn the tick loop. Exits when the shutdown signal flips.
pub fn spawn_tick_loop(
    engine: Arc<Mutex<CrashEngine>>,
    seed_store: Arc<SeedStore>,
    ticks: broadcast::Sender<TickFrame>,
    interval_ms: u64,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_millis(interval_ms.max(10)));
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        return;
                    }
                }
            }

            let now = now_ms();
            let needs_round = {
                let mut engine = engine.lock().await;
                engine.advance(now);
                engine.needs_round(now)
            };

            // The seed fetch happens outside the engine lock; the engine's
            // synchronous sections never wait on I/O.
            if needs_round {
                match seed_store.ensure_next().await {
                    Ok(prep) => {
                        let mut engine = engine.lock().await;
                        let now = now_ms();
                        if engine.needs_round(now) {
                            if let Err(err) = engine.start_round(prep, now) {
                                warn!(error = %err, "round start raced; retrying next tick");
                            }
                        }
                    }
                    Err(err) => {
                        // The next tick is the retry path.
                        error!(error = %err, "failed to prepare the next round");
                    }
                }
            }

            let status = engine.lock().await.status(now_ms());
            let _ = ticks.send(frame_from(&status));
        }
    })
}

/// Spawn the settlement consumer. Runs until the engine (the only sender)
/// is dropped, so every emitted lifecycle event is persisted.
pub fn spawn_settlement(
    ledger: Ledger,
    mut events: mpsc::UnboundedReceiver<RoundEvent>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match event {
                RoundEvent::Started(started) => {
                    if let Err(err) = ledger.persist_round_start(&started).await {
                        error!(round_id = %started.round_id, error = %err, "failed to persist round start");
                    }
                }
                RoundEvent::Crashed(crashed) => {
                    if let Err(err) = ledger.persist_round_crash(&crashed).await {
                        error!(round_id = %crashed.round_id, error = %err, "failed to persist round crash");
                    }
                }
            }
        }
    })
}
