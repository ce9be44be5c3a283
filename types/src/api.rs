//! Wire payloads for the HTTP surface.
//!
//! Field names follow the public contract (camelCase); monetary fields are
//! exact decimal strings on output and accept strings or numbers on input.

use crate::money::{Amount, Multiplier};
use crate::payment::{PaymentRecord, PaymentStatus};
use crate::round::{BetRecord, RoundRecord, RoundStatus, SeedCommit};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
    #[serde(rename = "errorCode")]
    pub error_code: u16,
}

#[derive(Clone, Debug, Deserialize)]
pub struct BetRequest {
    #[serde(rename = "betAmount")]
    pub bet_amount: Amount,
}

#[derive(Clone, Debug, Serialize)]
pub struct BetResponse {
    #[serde(rename = "betId")]
    pub bet_id: Uuid,
    #[serde(rename = "roundId")]
    pub round_id: Uuid,
    #[serde(rename = "serverSeedHash")]
    pub server_seed_hash: String,
    #[serde(rename = "startedAt")]
    pub started_at: i64,
    pub balance: Amount,
}

#[derive(Clone, Debug, Serialize)]
pub struct CashoutResponse {
    pub success: bool,
    pub payout: Amount,
    pub multiplier: Multiplier,
    pub balance: Amount,
    pub idempotent: bool,
}

#[derive(Clone, Debug, Serialize)]
pub struct RoundStatusResponse {
    #[serde(rename = "roundId")]
    pub round_id: Option<Uuid>,
    pub status: RoundStatus,
    pub multiplier: Multiplier,
    #[serde(rename = "startedAt")]
    pub started_at: Option<i64>,
    #[serde(rename = "commitIdx")]
    pub commit_idx: Option<i64>,
    #[serde(rename = "serverSeedHash")]
    pub server_seed_hash: Option<String>,
}

#[derive(Clone, Debug, Serialize)]
pub struct RoundHistoryResponse {
    pub rounds: Vec<RoundRecord>,
}

#[derive(Clone, Debug, Serialize)]
pub struct RoundDetailResponse {
    pub round: RoundRecord,
    pub bets: Vec<BetRecord>,
}

#[derive(Clone, Debug, Serialize)]
pub struct CommitmentResponse {
    pub idx: i64,
    #[serde(rename = "seedHash")]
    pub seed_hash: String,
    #[serde(rename = "createdAt")]
    pub created_at: i64,
}

impl From<SeedCommit> for CommitmentResponse {
    fn from(commit: SeedCommit) -> Self {
        CommitmentResponse {
            idx: commit.idx,
            seed_hash: commit.seed_hash,
            created_at: commit.created_at,
        }
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct RevealResponse {
    #[serde(rename = "roundId")]
    pub round_id: Uuid,
    #[serde(rename = "commitIdx")]
    pub commit_idx: Option<i64>,
    #[serde(rename = "serverSeed")]
    pub server_seed: String,
    #[serde(rename = "serverSeedHash")]
    pub server_seed_hash: String,
    #[serde(rename = "revealedAt")]
    pub revealed_at: i64,
    #[serde(rename = "crashPoint")]
    pub crash_point: Multiplier,
    #[serde(rename = "startedAt")]
    pub started_at: i64,
    #[serde(rename = "endedAt")]
    pub ended_at: i64,
}

#[derive(Clone, Debug, Deserialize)]
pub struct PaymentRequest {
    pub amount: Amount,
    #[serde(rename = "transactionUUID")]
    pub transaction_uuid: Uuid,
}

#[derive(Clone, Debug, Serialize)]
pub struct PaymentAcceptedResponse {
    #[serde(rename = "paymentId")]
    pub payment_id: Uuid,
    #[serde(rename = "transactionId")]
    pub transaction_id: String,
    pub amount: Amount,
    pub status: PaymentStatus,
    #[serde(rename = "newBalance", skip_serializing_if = "Option::is_none")]
    pub new_balance: Option<Amount>,
}

#[derive(Clone, Debug, Serialize)]
pub struct PaymentStatusResponse {
    pub status: PaymentStatus,
    pub details: PaymentRecord,
}

#[derive(Clone, Debug, Serialize)]
pub struct PaymentHistoryResponse {
    pub transactions: Vec<PaymentRecord>,
    pub count: i64,
    pub limit: i64,
    pub offset: i64,
}

/// One frame of the periodic engine broadcast.
#[derive(Clone, Debug, Serialize)]
pub struct TickFrame {
    #[serde(rename = "roundId")]
    pub round_id: Option<Uuid>,
    pub status: RoundStatus,
    pub multiplier: Multiplier,
    #[serde(rename = "startedAt")]
    pub started_at: Option<i64>,
    #[serde(rename = "commitIdx")]
    pub commit_idx: Option<i64>,
    #[serde(rename = "serverSeedHash")]
    pub server_seed_hash: Option<String>,
}
