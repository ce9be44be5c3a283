//! Bridges the round engine and the ledger on the user-facing paths.
//!
//! A bet is two phases: the ledger debit commits first, then the player is
//! registered with the in-process engine. Keeping them separate avoids
//! holding a storage transaction open across an in-memory operation and
//! makes each failure mode recoverable — a join that loses the race with
//! the crash is compensated by refunding the bet in a fresh transaction.

use crate::error::ApiError;
use crate::ledger::Ledger;
use crate::ratelimit::{RateLimiter, RateLimiterConfig};
use crashline_engine::{CrashEngine, EngineError, JoinAck};
use crashline_types::api::{BetResponse, CashoutResponse};
use crashline_types::{now_ms, Amount, RoundStatus};
use std::sync::Arc;
use tokio::sync::Mutex;
use uuid::Uuid;

#[derive(Clone, Copy, Debug)]
pub struct BetLimits {
    pub min_bet: Amount,
    pub max_bet: Amount,
}

#[derive(Clone, Copy, Debug)]
pub struct CashoutThrottle {
    pub min_interval_ms: i64,
    pub prune_age_ms: i64,
    pub max_entries: usize,
}

pub struct BetCoordinator {
    engine: Arc<Mutex<CrashEngine>>,
    ledger: Ledger,
    limits: BetLimits,
    cashout_gate: Arc<RateLimiter>,
}

impl BetCoordinator {
    pub fn new(
        engine: Arc<Mutex<CrashEngine>>,
        ledger: Ledger,
        limits: BetLimits,
        throttle: CashoutThrottle,
    ) -> Self {
        let cashout_gate = Arc::new(RateLimiter::new(RateLimiterConfig {
            window_ms: throttle.min_interval_ms,
            max_in_window: 1,
            max_entries: throttle.max_entries,
            prune_age_ms: throttle.prune_age_ms,
        }));
        Self {
            engine,
            ledger,
            limits,
            cashout_gate,
        }
    }

    /// The per-user cashout throttle, exposed so the server can run its
    /// periodic prune alongside the other bounded maps.
    pub fn cashout_gate(&self) -> Arc<RateLimiter> {
        Arc::clone(&self.cashout_gate)
    }

    pub async fn place_bet(&self, user_id: Uuid, amount: Amount) -> Result<BetResponse, ApiError> {
        if !amount.is_positive() || amount < self.limits.min_bet || amount > self.limits.max_bet {
            return Err(ApiError::validation(format!(
                "bet amount must be between {} and {}",
                self.limits.min_bet, self.limits.max_bet
            )));
        }

        let now = now_ms();
        let snapshot = self.engine.lock().await.status(now);
        if snapshot.status != RoundStatus::Running {
            return Err(ApiError::validation("no running round"));
        }
        let round_id = snapshot
            .round_id
            .ok_or_else(|| ApiError::internal("running round without an id"))?;

        let (bet_id, balance) = self.ledger.place_bet(user_id, round_id, amount).await?;
        let ack = self
            .join_or_compensate(user_id, amount, round_id, bet_id)
            .await?;

        Ok(BetResponse {
            bet_id,
            round_id: ack.round_id,
            server_seed_hash: hex::encode(ack.seed_hash),
            started_at: ack.started_at,
            balance,
        })
    }

    /// Register the debited bet with the engine; if the round turned over
    /// in between, refund the bet in a new transaction and report the
    /// round as gone.
    pub(crate) async fn join_or_compensate(
        &self,
        user_id: Uuid,
        amount: Amount,
        round_id: Uuid,
        bet_id: Uuid,
    ) -> Result<JoinAck, ApiError> {
        let joined = self
            .engine
            .lock()
            .await
            .join(user_id, amount, round_id, now_ms());
        match joined {
            Ok(ack) => Ok(ack),
            Err(join_err) => {
                match self.ledger.admin_refund(bet_id).await {
                    Ok(_) => {
                        tracing::warn!(
                            user_id = %user_id,
                            round_id = %round_id,
                            error = %join_err,
                            "engine join failed after debit; bet refunded"
                        );
                    }
                    Err(refund_err) => {
                        // Funds are debited with no seat in the round and no
                        // refund recorded. Manual reconciliation required.
                        tracing::error!(
                            user_id = %user_id,
                            bet_id = %bet_id,
                            round_id = %round_id,
                            join_error = %join_err,
                            refund_error = %refund_err,
                            "bet compensation failed; funds need manual reconciliation"
                        );
                    }
                }
                Err(match join_err {
                    EngineError::AlreadyJoined => {
                        ApiError::conflict("bet already placed for this round")
                    }
                    _ => ApiError::validation("round ended before the bet was accepted"),
                })
            }
        }
    }

    pub async fn cashout(&self, user_id: Uuid) -> Result<CashoutResponse, ApiError> {
        let now = now_ms();
        let decision = self.cashout_gate.check(&user_id.to_string(), now);
        if !decision.allowed {
            return Err(ApiError::RateLimited);
        }

        let (round_id, adjudication) = {
            let mut engine = self.engine.lock().await;
            let round_id = engine.status(now).round_id;
            (round_id, engine.cashout(user_id, now))
        };

        let settlement = match adjudication {
            Ok(outcome) => {
                self.ledger
                    .settle_cashout(user_id, outcome.round_id, Some(&outcome))
                    .await?
            }
            // The engine already saw this player cash out; the ledger
            // answers idempotently from the bet row.
            Err(EngineError::AlreadyCashed) => {
                let round_id =
                    round_id.ok_or_else(|| ApiError::validation("no running round"))?;
                self.ledger.settle_cashout(user_id, round_id, None).await?
            }
            Err(EngineError::NotJoined) => {
                return Err(ApiError::validation("no active bet in this round"))
            }
            Err(EngineError::NotRunning) => {
                return Err(ApiError::validation("no running round"))
            }
            Err(other) => {
                return Err(ApiError::internal(format!(
                    "unexpected engine cashout error: {other}"
                )))
            }
        };

        Ok(CashoutResponse {
            success: settlement.win,
            payout: settlement.payout,
            multiplier: settlement.multiplier,
            balance: settlement.balance,
            idempotent: settlement.idempotent,
        })
    }
}
