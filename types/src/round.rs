//! Round and bet domain types shared between the engine and the ledger.

use crate::money::{Amount, Multiplier};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Public lifecycle state of the engine's current round.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RoundStatus {
    Waiting,
    Running,
    Crashed,
}

impl RoundStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RoundStatus::Waiting => "waiting",
            RoundStatus::Running => "running",
            RoundStatus::Crashed => "crashed",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BetStatus {
    Active,
    Cashed,
    Lost,
    Refunded,
}

impl BetStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BetStatus::Active => "active",
            BetStatus::Cashed => "cashed",
            BetStatus::Lost => "lost",
            BetStatus::Refunded => "refunded",
        }
    }

    pub fn parse(raw: &str) -> Option<BetStatus> {
        match raw {
            "active" => Some(BetStatus::Active),
            "cashed" => Some(BetStatus::Cashed),
            "lost" => Some(BetStatus::Lost),
            "refunded" => Some(BetStatus::Refunded),
            _ => None,
        }
    }
}

/// A persisted round, as stored by the ledger. Hashes and seeds are
/// lowercase hex; `server_seed` stays null until the round is revealed.
#[derive(Clone, Debug, Serialize)]
pub struct RoundRecord {
    #[serde(rename = "roundId")]
    pub round_id: Uuid,
    #[serde(rename = "commitIdx")]
    pub commit_idx: Option<i64>,
    #[serde(rename = "serverSeedHash")]
    pub server_seed_hash: String,
    #[serde(rename = "serverSeed", skip_serializing_if = "Option::is_none")]
    pub server_seed: Option<String>,
    /// Null while the round is running; written at crash time together
    /// with the reveal so the detail endpoint never leaks a live value.
    #[serde(rename = "crashPoint", skip_serializing_if = "Option::is_none")]
    pub crash_point: Option<Multiplier>,
    #[serde(rename = "startedAt")]
    pub started_at: i64,
    #[serde(rename = "endedAt")]
    pub ended_at: Option<i64>,
    #[serde(rename = "settlementWindowSeconds")]
    pub settlement_window_seconds: i64,
    #[serde(rename = "settlementClosedAt", skip_serializing_if = "Option::is_none")]
    pub settlement_closed_at: Option<i64>,
}

#[derive(Clone, Debug, Serialize)]
pub struct BetRecord {
    #[serde(rename = "betId")]
    pub id: Uuid,
    #[serde(rename = "roundId")]
    pub round_id: Uuid,
    #[serde(rename = "userId")]
    pub user_id: Uuid,
    #[serde(rename = "betAmount")]
    pub bet_amount: Amount,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payout: Option<Amount>,
    pub status: BetStatus,
    #[serde(rename = "betPlacedAt")]
    pub bet_placed_at: i64,
    #[serde(rename = "claimedAt", skip_serializing_if = "Option::is_none")]
    pub claimed_at: Option<i64>,
}

/// A seed commitment: the hash is published before any round consumes the
/// seed at that index.
#[derive(Clone, Debug, Serialize)]
pub struct SeedCommit {
    pub idx: i64,
    #[serde(rename = "seedHash")]
    pub seed_hash: String,
    #[serde(rename = "createdAt")]
    pub created_at: i64,
}
