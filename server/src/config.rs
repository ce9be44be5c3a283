//! Service configuration loaded from environment variables.
//!
//! Every operational knob has a default; only values that parse are
//! accepted, anything malformed is a startup error rather than a silent
//! fallback.

use crate::error::ApiError;
use crashline_types::Amount;

#[derive(Debug, Clone)]
pub struct DbConfig {
    pub max_connections: u32,
    pub statement_timeout_ms: u64,
    pub connection_timeout_ms: u64,
    pub idle_timeout_ms: u64,
}

#[derive(Debug, Clone)]
pub struct PaymentLimits {
    pub min_deposit: Amount,
    pub max_deposit: Amount,
    pub min_withdraw: Amount,
    pub max_withdraw: Amount,
}

#[derive(Debug, Clone)]
pub struct PollingConfig {
    pub attempts: u32,
    pub interval_ms: u64,
    pub concurrency: usize,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Master secret for deterministic seed derivation. Absence degrades
    /// provable fairness across restarts.
    pub seed_master: Option<String>,
    /// Permit round generation from ephemeral seeds when no master secret
    /// is configured. Off by default: a restart would orphan commitments.
    pub allow_ephemeral_seeds: bool,

    pub broadcast_interval_ms: u64,
    pub request_timeout_ms: u64,
    pub round_gap_ms: i64,

    pub db: DbConfig,

    pub min_bet: Amount,
    pub max_bet: Amount,
    pub max_round_age_ms: i64,
    pub settlement_window_seconds: i64,

    pub cashout_min_interval_ms: i64,
    pub cashout_prune_age_ms: i64,
    pub max_cashout_entries: usize,

    pub payment_limits: PaymentLimits,
    pub polling: PollingConfig,
    pub collections_base_url: String,
    pub disbursements_base_url: String,
    pub gateway_token: String,

    pub auth_token_secret: String,
    pub admin_token: Option<String>,

    pub cache_ttl_ms: u64,
    pub round_history_limit: i64,
}

impl ServerConfig {
    pub fn from_env() -> Result<Self, ApiError> {
        Ok(ServerConfig {
            seed_master: optional_env("SEED_MASTER"),
            allow_ephemeral_seeds: flag_env("ALLOW_EPHEMERAL_SEEDS"),

            broadcast_interval_ms: parsed_env("BROADCAST_INTERVAL_MS", 100)?,
            request_timeout_ms: parsed_env("REQUEST_TIMEOUT_MS", 15_000)?,
            round_gap_ms: parsed_env("ROUND_GAP_MS", 5_000)?,

            db: DbConfig {
                max_connections: parsed_env("DB_MAX_CONNECTIONS", 5)?,
                statement_timeout_ms: parsed_env("DB_STATEMENT_TIMEOUT_MS", 5_000)?,
                connection_timeout_ms: parsed_env("DB_CONNECTION_TIMEOUT_MS", 5_000)?,
                idle_timeout_ms: parsed_env("DB_IDLE_TIMEOUT_MS", 30_000)?,
            },

            min_bet: amount_env("MIN_BET_AMOUNT", "1.00")?,
            max_bet: amount_env("MAX_BET_AMOUNT", "10000.00")?,
            max_round_age_ms: parsed_env::<i64>("MAX_ROUND_AGE_SECONDS", 300)? * 1_000,
            settlement_window_seconds: parsed_env("SETTLEMENT_WINDOW_SECONDS", 300)?,

            cashout_min_interval_ms: parsed_env("CASHOUT_MIN_INTERVAL_MS", 1_000)?,
            cashout_prune_age_ms: parsed_env("CASHOUT_PRUNE_AGE_MS", 60_000)?,
            max_cashout_entries: parsed_env("MAX_CASHOUT_ENTRIES", 10_000)?,

            payment_limits: PaymentLimits {
                min_deposit: amount_env("MIN_DEPOSIT_AMOUNT", "10.00")?,
                max_deposit: amount_env("MAX_DEPOSIT_AMOUNT", "100000.00")?,
                min_withdraw: amount_env("MIN_WITHDRAW_AMOUNT", "10.00")?,
                max_withdraw: amount_env("MAX_WITHDRAW_AMOUNT", "100000.00")?,
            },
            polling: PollingConfig {
                attempts: parsed_env("PAYMENT_POLL_ATTEMPTS", 60)?,
                interval_ms: parsed_env("PAYMENT_POLL_INTERVAL_MS", 5_000)?,
                concurrency: parsed_env("PAYMENT_POLL_CONCURRENCY", 32)?,
            },
            collections_base_url: optional_env("COLLECTIONS_BASE_URL")
                .unwrap_or_else(|| "http://127.0.0.1:9400/collections".to_string()),
            disbursements_base_url: optional_env("DISBURSEMENTS_BASE_URL")
                .unwrap_or_else(|| "http://127.0.0.1:9400/disbursements".to_string()),
            gateway_token: optional_env("GATEWAY_TOKEN").unwrap_or_default(),

            auth_token_secret: optional_env("AUTH_TOKEN_SECRET").unwrap_or_else(|| {
                tracing::warn!("AUTH_TOKEN_SECRET is unset; using the insecure dev secret");
                "insecure-dev-secret".to_string()
            }),
            admin_token: optional_env("ADMIN_TOKEN"),

            cache_ttl_ms: parsed_env("CACHE_TTL_MS", 2_000)?,
            round_history_limit: parsed_env("ROUND_HISTORY_LIMIT", 50)?,
        })
    }
}

fn optional_env(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn flag_env(key: &str) -> bool {
    matches!(
        std::env::var(key).as_deref(),
        Ok("1") | Ok("true") | Ok("TRUE") | Ok("yes") | Ok("YES")
    )
}

fn parsed_env<T: std::str::FromStr>(key: &str, fallback: T) -> Result<T, ApiError> {
    match optional_env(key) {
        None => Ok(fallback),
        Some(raw) => raw
            .parse()
            .map_err(|_| ApiError::internal(format!("invalid {key}: {raw}"))),
    }
}

fn amount_env(key: &str, fallback: &str) -> Result<Amount, ApiError> {
    let raw = optional_env(key).unwrap_or_else(|| fallback.to_string());
    raw.parse()
        .map_err(|err| ApiError::internal(format!("invalid {key}: {err}")))
}
