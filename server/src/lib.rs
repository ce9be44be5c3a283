//! The hosted crash-game service: ledger, seed store, bet coordination,
//! payment reconciliation, and the thin HTTP layer over them.

use crashline_engine::CrashEngine;
use crashline_types::api::TickFrame;
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex};

pub mod api;
pub mod auth;
pub mod cache;
pub mod config;
pub mod coordinator;
pub mod db;
pub mod driver;
pub mod error;
pub mod ledger;
pub mod payments;
pub mod ratelimit;
pub mod seed_store;

#[cfg(test)]
mod tests;

use cache::TtlCache;
use config::ServerConfig;
use coordinator::BetCoordinator;
use ledger::Ledger;
use payments::PaymentsService;
use seed_store::SeedStore;

/// Shared handle set behind every request handler.
pub struct AppState {
    pub config: ServerConfig,
    pub engine: Arc<Mutex<CrashEngine>>,
    pub ledger: Ledger,
    pub seed_store: Arc<SeedStore>,
    pub coordinator: BetCoordinator,
    pub payments: PaymentsService,
    pub cache: Arc<TtlCache>,
    pub ticks: broadcast::Sender<TickFrame>,
}
