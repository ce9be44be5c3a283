//! Connection pool setup and schema initialization.

use crate::config::DbConfig;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::str::FromStr;
use std::time::Duration;
use tracing::info;

/// One statement per entry; applied in order and idempotent, so boot can
/// always run the whole batch.
const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS users (
        id TEXT PRIMARY KEY,
        phone TEXT NOT NULL UNIQUE,
        password_hash TEXT NOT NULL,
        balance INTEGER NOT NULL DEFAULT 0 CHECK (balance >= 0),
        external_payment_id TEXT NOT NULL UNIQUE,
        created_at INTEGER NOT NULL,
        updated_at INTEGER NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS rounds (
        round_id TEXT PRIMARY KEY,
        commit_idx INTEGER,
        server_seed_hash TEXT NOT NULL,
        server_seed TEXT,
        crash_point INTEGER,
        started_at INTEGER NOT NULL,
        ended_at INTEGER,
        settlement_window_seconds INTEGER NOT NULL DEFAULT 300,
        settlement_closed_at INTEGER
    )",
    "CREATE TABLE IF NOT EXISTS bets (
        id TEXT PRIMARY KEY,
        round_id TEXT NOT NULL REFERENCES rounds(round_id),
        user_id TEXT NOT NULL REFERENCES users(id),
        bet_amount INTEGER NOT NULL CHECK (bet_amount > 0),
        payout INTEGER,
        status TEXT NOT NULL,
        bet_placed_at INTEGER NOT NULL,
        claimed_at INTEGER,
        created_at INTEGER NOT NULL,
        updated_at INTEGER NOT NULL
    )",
    // Source of truth for at-most-one-active-bet; application checks only
    // produce friendlier errors.
    "CREATE UNIQUE INDEX IF NOT EXISTS bets_one_active
        ON bets(user_id, round_id) WHERE status = 'active'",
    "CREATE INDEX IF NOT EXISTS bets_by_round ON bets(round_id)",
    "CREATE INDEX IF NOT EXISTS bets_by_user ON bets(user_id, bet_placed_at)",
    "CREATE TABLE IF NOT EXISTS seed_commits (
        idx INTEGER PRIMARY KEY,
        seed_hash TEXT NOT NULL UNIQUE,
        created_at INTEGER NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS payments (
        id TEXT PRIMARY KEY,
        user_id TEXT NOT NULL REFERENCES users(id),
        kind TEXT NOT NULL,
        amount INTEGER NOT NULL CHECK (amount > 0),
        phone TEXT NOT NULL,
        gateway_txn_id TEXT UNIQUE,
        external_id TEXT NOT NULL UNIQUE,
        status TEXT NOT NULL,
        gateway_status TEXT,
        error_reason TEXT,
        created_at INTEGER NOT NULL,
        updated_at INTEGER NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS payments_by_user ON payments(user_id, created_at)",
];

pub async fn connect(database_url: &str, config: &DbConfig) -> Result<SqlitePool, sqlx::Error> {
    let options = SqliteConnectOptions::from_str(database_url)?
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .busy_timeout(Duration::from_millis(config.statement_timeout_ms))
        .foreign_keys(true);

    let pool = SqlitePoolOptions::new()
        .max_connections(config.max_connections)
        .acquire_timeout(Duration::from_millis(config.connection_timeout_ms))
        .idle_timeout(Duration::from_millis(config.idle_timeout_ms))
        .connect_with(options)
        .await?;

    init_schema(&pool).await?;
    info!(url = %database_url, "database ready");
    Ok(pool)
}

pub async fn init_schema(pool: &SqlitePool) -> Result<(), sqlx::Error> {
    for statement in SCHEMA {
        sqlx::query(statement).execute(pool).await?;
    }
    Ok(())
}

/// SQLite reports constraint hits as database errors; the unique ones are
/// business conflicts, not faults.
pub fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(
        err,
        sqlx::Error::Database(db) if db.message().contains("UNIQUE constraint failed")
    )
}

#[cfg(test)]
pub(crate) async fn test_pool() -> SqlitePool {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .expect("open in-memory database");
    init_schema(&pool).await.expect("apply schema");
    pool
}
