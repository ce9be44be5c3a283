//! Transactional ledger: users, bets, rounds, and payment intents.
//!
//! The ledger exclusively owns every balance mutation. Each public
//! operation runs inside a single transaction so partial effects are
//! impossible; business failures roll back and surface a typed error.
//! Writers additionally serialize on an in-process gate because SQLite is
//! single-writer — the partial unique index and the conditional debit
//! remain the storage-level source of truth.

use crate::db;
use crate::error::ApiError;
use crashline_engine::{CashoutOutcome, RoundCrashed, RoundStarted};
use crashline_types::{
    now_ms, Amount, BetRecord, BetStatus, Multiplier, PaymentKind, PaymentRecord, PaymentStatus,
    RoundRecord,
};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use std::sync::Arc;
use tokio::sync::Mutex;
use uuid::Uuid;

#[derive(Clone)]
pub struct LedgerConfig {
    pub settlement_window_seconds: i64,
    pub max_round_age_ms: i64,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            settlement_window_seconds: 300,
            max_round_age_ms: 300_000,
        }
    }
}

#[derive(Clone, Debug)]
pub struct UserRecord {
    pub id: Uuid,
    pub phone: String,
    pub balance: Amount,
    pub external_payment_id: String,
    pub created_at: i64,
}

#[derive(Clone, Copy, Debug)]
pub struct CashoutSettlement {
    pub win: bool,
    pub payout: Amount,
    pub multiplier: Multiplier,
    pub balance: Amount,
    pub idempotent: bool,
}

#[derive(Clone, Copy, Debug)]
pub struct RefundOutcome {
    pub already_refunded: bool,
    pub balance: Amount,
}

#[derive(Clone, Debug)]
pub struct FinalizeOutcome {
    pub already_terminal: bool,
    pub status: PaymentStatus,
}

#[derive(Clone)]
pub struct Ledger {
    pool: SqlitePool,
    write_gate: Arc<Mutex<()>>,
    config: LedgerConfig,
}

impl Ledger {
    pub fn new(pool: SqlitePool, write_gate: Arc<Mutex<()>>, config: LedgerConfig) -> Self {
        Self {
            pool,
            write_gate,
            config,
        }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    // ── users ───────────────────────────────────────────────────────────

    pub async fn create_user(&self, phone: &str, password_hash: &str) -> Result<UserRecord, ApiError> {
        let _gate = self.write_gate.lock().await;
        let now = now_ms();
        let id = Uuid::new_v4();
        let external_payment_id = Uuid::new_v4().to_string();
        let inserted = sqlx::query(
            "INSERT INTO users (id, phone, password_hash, balance, external_payment_id, created_at, updated_at)
             VALUES (?, ?, ?, 0, ?, ?, ?)",
        )
        .bind(id.to_string())
        .bind(phone)
        .bind(password_hash)
        .bind(&external_payment_id)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await;
        match inserted {
            Ok(_) => Ok(UserRecord {
                id,
                phone: phone.to_string(),
                balance: Amount::ZERO,
                external_payment_id,
                created_at: now,
            }),
            Err(err) if db::is_unique_violation(&err) => {
                Err(ApiError::conflict("phone already registered"))
            }
            Err(err) => Err(err.into()),
        }
    }

    pub async fn user_balance(&self, user_id: Uuid) -> Result<Amount, ApiError> {
        let row = sqlx::query("SELECT balance FROM users WHERE id = ?")
            .bind(user_id.to_string())
            .fetch_optional(&self.pool)
            .await?
            .ok_or(ApiError::NotFound("user"))?;
        Ok(Amount::from_hundredths(row.get::<i64, _>(0)))
    }

    pub async fn user_phone(&self, user_id: Uuid) -> Result<String, ApiError> {
        let row = sqlx::query("SELECT phone FROM users WHERE id = ?")
            .bind(user_id.to_string())
            .fetch_optional(&self.pool)
            .await?
            .ok_or(ApiError::NotFound("user"))?;
        Ok(row.get::<String, _>(0))
    }

    // ── bets ────────────────────────────────────────────────────────────

    /// Atomic "debit + insert bet". Fails with `RoundStale` past the round
    /// age window, `Conflict` on a duplicate bet, `InsufficientFunds` when
    /// the conditional debit touches zero rows.
    pub async fn place_bet(
        &self,
        user_id: Uuid,
        round_id: Uuid,
        amount: Amount,
    ) -> Result<(Uuid, Amount), ApiError> {
        let _gate = self.write_gate.lock().await;
        let now = now_ms();
        let mut tx = self.pool.begin().await?;

        let round = sqlx::query("SELECT started_at FROM rounds WHERE round_id = ?")
            .bind(round_id.to_string())
            .fetch_optional(&mut *tx)
            .await?
            .ok_or(ApiError::NotFound("round"))?;
        let started_at: i64 = round.get(0);
        if now.saturating_sub(started_at) > self.config.max_round_age_ms {
            return Err(ApiError::RoundStale);
        }

        let existing = sqlx::query("SELECT 1 FROM bets WHERE user_id = ? AND round_id = ? LIMIT 1")
            .bind(user_id.to_string())
            .bind(round_id.to_string())
            .fetch_optional(&mut *tx)
            .await?;
        if existing.is_some() {
            return Err(ApiError::conflict("bet already placed for this round"));
        }

        let debited = sqlx::query(
            "UPDATE users SET balance = balance - ?, updated_at = ?
             WHERE id = ? AND balance >= ? RETURNING balance",
        )
        .bind(amount.hundredths())
        .bind(now)
        .bind(user_id.to_string())
        .bind(amount.hundredths())
        .fetch_optional(&mut *tx)
        .await?;
        let new_balance = match debited {
            Some(row) => Amount::from_hundredths(row.get::<i64, _>(0)),
            None => {
                let known = sqlx::query("SELECT 1 FROM users WHERE id = ?")
                    .bind(user_id.to_string())
                    .fetch_optional(&mut *tx)
                    .await?;
                return Err(if known.is_some() {
                    ApiError::InsufficientFunds
                } else {
                    ApiError::NotFound("user")
                });
            }
        };

        let bet_id = Uuid::new_v4();
        let inserted = sqlx::query(
            "INSERT INTO bets (id, round_id, user_id, bet_amount, payout, status, bet_placed_at, created_at, updated_at)
             VALUES (?, ?, ?, ?, NULL, 'active', ?, ?, ?)",
        )
        .bind(bet_id.to_string())
        .bind(round_id.to_string())
        .bind(user_id.to_string())
        .bind(amount.hundredths())
        .bind(now)
        .bind(now)
        .bind(now)
        .execute(&mut *tx)
        .await;
        if let Err(err) = inserted {
            return Err(if db::is_unique_violation(&err) {
                ApiError::conflict("bet already placed for this round")
            } else {
                err.into()
            });
        }

        tx.commit().await?;
        Ok((bet_id, new_balance))
    }

    /// Settle a cashout against the ledger. Replays answer from the bet
    /// row without further mutation; a closed settlement window rejects
    /// everything.
    ///
    /// `outcome` is the engine's adjudication, `None` when the engine
    /// reported the player already cashed (pure replay).
    pub async fn settle_cashout(
        &self,
        user_id: Uuid,
        round_id: Uuid,
        outcome: Option<&CashoutOutcome>,
    ) -> Result<CashoutSettlement, ApiError> {
        let _gate = self.write_gate.lock().await;
        let now = now_ms();
        let mut tx = self.pool.begin().await?;

        let round = sqlx::query(
            "SELECT settlement_closed_at, crash_point FROM rounds WHERE round_id = ?",
        )
        .bind(round_id.to_string())
        .fetch_optional(&mut *tx)
        .await?
        .ok_or(ApiError::NotFound("round"))?;
        if let Some(closed_at) = round.get::<Option<i64>, _>(0) {
            if closed_at < now {
                return Err(ApiError::SettlementClosed);
            }
        }
        let crash_point = round
            .get::<Option<i64>, _>(1)
            .map(|hundredths| Multiplier::from_hundredths(hundredths.max(0) as u64));

        let bet = sqlx::query(
            "SELECT id, status, payout, bet_amount FROM bets WHERE user_id = ? AND round_id = ?",
        )
        .bind(user_id.to_string())
        .bind(round_id.to_string())
        .fetch_optional(&mut *tx)
        .await?
        .ok_or(ApiError::NotFound("bet"))?;
        let bet_id: String = bet.get(0);
        let status = BetStatus::parse(&bet.get::<String, _>(1))
            .ok_or_else(|| ApiError::internal("unknown bet status in storage"))?;
        let bet_amount = Amount::from_hundredths(bet.get::<i64, _>(3));

        match status {
            BetStatus::Cashed => {
                let payout = Amount::from_hundredths(bet.get::<Option<i64>, _>(2).unwrap_or(0));
                let balance = balance_in_tx(&mut tx, user_id).await?;
                Ok(CashoutSettlement {
                    win: true,
                    payout,
                    multiplier: implied_multiplier(payout, bet_amount),
                    balance,
                    idempotent: true,
                })
            }
            BetStatus::Lost | BetStatus::Refunded => {
                let balance = balance_in_tx(&mut tx, user_id).await?;
                Ok(CashoutSettlement {
                    win: false,
                    payout: Amount::ZERO,
                    multiplier: crash_point.unwrap_or(Multiplier::ONE),
                    balance,
                    idempotent: true,
                })
            }
            BetStatus::Active => {
                let Some(outcome) = outcome else {
                    return Err(ApiError::internal(
                        "engine reported a cashed player but the bet is still active",
                    ));
                };
                if !outcome.win {
                    sqlx::query(
                        "UPDATE bets SET status = 'lost', payout = 0, updated_at = ? WHERE id = ?",
                    )
                    .bind(now)
                    .bind(&bet_id)
                    .execute(&mut *tx)
                    .await?;
                    let balance = balance_in_tx(&mut tx, user_id).await?;
                    tx.commit().await?;
                    return Ok(CashoutSettlement {
                        win: false,
                        payout: Amount::ZERO,
                        multiplier: outcome.multiplier,
                        balance,
                        idempotent: false,
                    });
                }

                let credited = sqlx::query(
                    "UPDATE users SET balance = balance + ?, updated_at = ?
                     WHERE id = ? RETURNING balance",
                )
                .bind(outcome.payout.hundredths())
                .bind(now)
                .bind(user_id.to_string())
                .fetch_optional(&mut *tx)
                .await?
                .ok_or(ApiError::NotFound("user"))?;
                let balance = Amount::from_hundredths(credited.get::<i64, _>(0));

                sqlx::query(
                    "UPDATE bets SET status = 'cashed', payout = ?, claimed_at = ?, updated_at = ?
                     WHERE id = ?",
                )
                .bind(outcome.payout.hundredths())
                .bind(now)
                .bind(now)
                .bind(&bet_id)
                .execute(&mut *tx)
                .await?;

                tx.commit().await?;
                Ok(CashoutSettlement {
                    win: true,
                    payout: outcome.payout,
                    multiplier: outcome.multiplier,
                    balance,
                    idempotent: false,
                })
            }
        }
    }

    /// Post-hoc refund of a bet that never cashed. No-op when already
    /// refunded; cashed bets are rejected.
    pub async fn admin_refund(&self, bet_id: Uuid) -> Result<RefundOutcome, ApiError> {
        let _gate = self.write_gate.lock().await;
        let now = now_ms();
        let mut tx = self.pool.begin().await?;

        let bet = sqlx::query("SELECT user_id, bet_amount, status FROM bets WHERE id = ?")
            .bind(bet_id.to_string())
            .fetch_optional(&mut *tx)
            .await?
            .ok_or(ApiError::NotFound("bet"))?;
        let user_id: String = bet.get(0);
        let bet_amount = Amount::from_hundredths(bet.get::<i64, _>(1));
        let status = BetStatus::parse(&bet.get::<String, _>(2))
            .ok_or_else(|| ApiError::internal("unknown bet status in storage"))?;

        match status {
            BetStatus::Refunded => {
                let balance = balance_in_tx_raw(&mut tx, &user_id).await?;
                Ok(RefundOutcome {
                    already_refunded: true,
                    balance,
                })
            }
            BetStatus::Cashed => Err(ApiError::conflict("bet already cashed out")),
            BetStatus::Active | BetStatus::Lost => {
                sqlx::query(
                    "UPDATE bets SET status = 'refunded', payout = 0, updated_at = ? WHERE id = ?",
                )
                .bind(now)
                .bind(bet_id.to_string())
                .execute(&mut *tx)
                .await?;
                let credited = sqlx::query(
                    "UPDATE users SET balance = balance + ?, updated_at = ?
                     WHERE id = ? RETURNING balance",
                )
                .bind(bet_amount.hundredths())
                .bind(now)
                .bind(&user_id)
                .fetch_optional(&mut *tx)
                .await?
                .ok_or(ApiError::NotFound("user"))?;
                let balance = Amount::from_hundredths(credited.get::<i64, _>(0));
                tx.commit().await?;
                Ok(RefundOutcome {
                    already_refunded: false,
                    balance,
                })
            }
        }
    }

    // ── rounds ──────────────────────────────────────────────────────────

    pub async fn persist_round_start(&self, event: &RoundStarted) -> Result<(), ApiError> {
        let _gate = self.write_gate.lock().await;
        sqlx::query(
            "INSERT OR IGNORE INTO rounds
                (round_id, commit_idx, server_seed_hash, server_seed, crash_point,
                 started_at, ended_at, settlement_window_seconds, settlement_closed_at)
             VALUES (?, ?, ?, NULL, NULL, ?, NULL, ?, NULL)",
        )
        .bind(event.round_id.to_string())
        .bind(event.commit_idx)
        .bind(hex::encode(event.seed_hash))
        .bind(event.started_at)
        .bind(self.config.settlement_window_seconds)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Reveal the seed, fix the crash point, open the settlement-close
    /// clock, and mark every still-active bet of the round as lost.
    pub async fn persist_round_crash(&self, event: &RoundCrashed) -> Result<(), ApiError> {
        let _gate = self.write_gate.lock().await;
        let now = now_ms();
        let mut tx = self.pool.begin().await?;

        let updated = sqlx::query(
            "UPDATE rounds SET crash_point = ?, ended_at = ?, server_seed = ?,
                    settlement_closed_at = ? + settlement_window_seconds * 1000
             WHERE round_id = ?",
        )
        .bind(event.crash_point.hundredths() as i64)
        .bind(event.ended_at)
        .bind(hex::encode(event.seed))
        .bind(event.ended_at)
        .bind(event.round_id.to_string())
        .execute(&mut *tx)
        .await?;
        if updated.rows_affected() == 0 {
            tracing::warn!(round_id = %event.round_id, "crash persisted for an unknown round");
        }

        sqlx::query(
            "UPDATE bets SET status = 'lost', payout = 0, updated_at = ?
             WHERE round_id = ? AND status = 'active'",
        )
        .bind(now)
        .bind(event.round_id.to_string())
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    pub async fn round_history(&self, limit: i64) -> Result<Vec<RoundRecord>, ApiError> {
        let rows = sqlx::query(
            "SELECT round_id, commit_idx, server_seed_hash, server_seed, crash_point,
                    started_at, ended_at, settlement_window_seconds, settlement_closed_at
             FROM rounds WHERE ended_at IS NOT NULL
             ORDER BY started_at DESC LIMIT ?",
        )
        .bind(limit.max(0))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(round_from_row).collect()
    }

    pub async fn round_detail(
        &self,
        round_id: Uuid,
    ) -> Result<(RoundRecord, Vec<BetRecord>), ApiError> {
        let row = sqlx::query(
            "SELECT round_id, commit_idx, server_seed_hash, server_seed, crash_point,
                    started_at, ended_at, settlement_window_seconds, settlement_closed_at
             FROM rounds WHERE round_id = ?",
        )
        .bind(round_id.to_string())
        .fetch_optional(&self.pool)
        .await?
        .ok_or(ApiError::NotFound("round"))?;
        let round = round_from_row(&row)?;

        let bet_rows = sqlx::query(
            "SELECT id, round_id, user_id, bet_amount, payout, status, bet_placed_at, claimed_at
             FROM bets WHERE round_id = ? ORDER BY bet_placed_at ASC",
        )
        .bind(round_id.to_string())
        .fetch_all(&self.pool)
        .await?;
        let bets = bet_rows
            .iter()
            .map(bet_from_row)
            .collect::<Result<Vec<_>, _>>()?;
        Ok((round, bets))
    }

    /// The reveal for a crashed round. Running rounds reject: the seed is
    /// still secret.
    pub async fn reveal(&self, round_id: Uuid) -> Result<RoundRecord, ApiError> {
        let (round, _) = self.round_detail(round_id).await?;
        if round.ended_at.is_none() || round.server_seed.is_none() {
            return Err(ApiError::validation("round is still running"));
        }
        Ok(round)
    }

    pub async fn bet_by_id(&self, bet_id: Uuid) -> Result<BetRecord, ApiError> {
        let row = sqlx::query(
            "SELECT id, round_id, user_id, bet_amount, payout, status, bet_placed_at, claimed_at
             FROM bets WHERE id = ?",
        )
        .bind(bet_id.to_string())
        .fetch_optional(&self.pool)
        .await?
        .ok_or(ApiError::NotFound("bet"))?;
        bet_from_row(&row)
    }

    // ── payment intents ─────────────────────────────────────────────────

    /// Record a deposit intent. Balances move only when the intent is
    /// finalized as confirmed.
    pub async fn create_deposit(
        &self,
        user_id: Uuid,
        amount: Amount,
        external_id: Uuid,
    ) -> Result<PaymentRecord, ApiError> {
        let _gate = self.write_gate.lock().await;
        let phone = self.user_phone(user_id).await?;
        let now = now_ms();
        let mut tx = self.pool.begin().await?;

        let pending = sqlx::query(
            "SELECT 1 FROM payments
             WHERE user_id = ? AND kind = 'deposit' AND status IN ('pending', 'processing') LIMIT 1",
        )
        .bind(user_id.to_string())
        .fetch_optional(&mut *tx)
        .await?;
        if pending.is_some() {
            return Err(ApiError::conflict("a pending deposit already exists"));
        }

        let record = PaymentRecord {
            id: Uuid::new_v4(),
            user_id,
            kind: PaymentKind::Deposit,
            amount,
            phone,
            gateway_txn_id: None,
            external_id: external_id.to_string(),
            status: PaymentStatus::Pending,
            gateway_status: None,
            error_reason: None,
            created_at: now,
            updated_at: now,
        };
        insert_payment(&mut tx, &record).await?;
        tx.commit().await?;
        Ok(record)
    }

    /// Record a withdrawal intent, debiting the balance in the same
    /// transaction ("debit on intent").
    pub async fn create_withdraw(
        &self,
        user_id: Uuid,
        amount: Amount,
        external_id: Uuid,
    ) -> Result<(PaymentRecord, Amount), ApiError> {
        let _gate = self.write_gate.lock().await;
        let phone = self.user_phone(user_id).await?;
        let now = now_ms();
        let mut tx = self.pool.begin().await?;

        let pending = sqlx::query(
            "SELECT 1 FROM payments
             WHERE user_id = ? AND kind = 'withdraw' AND status IN ('pending', 'processing') LIMIT 1",
        )
        .bind(user_id.to_string())
        .fetch_optional(&mut *tx)
        .await?;
        if pending.is_some() {
            return Err(ApiError::conflict("a pending withdrawal already exists"));
        }

        let debited = sqlx::query(
            "UPDATE users SET balance = balance - ?, updated_at = ?
             WHERE id = ? AND balance >= ? RETURNING balance",
        )
        .bind(amount.hundredths())
        .bind(now)
        .bind(user_id.to_string())
        .bind(amount.hundredths())
        .fetch_optional(&mut *tx)
        .await?
        .ok_or(ApiError::InsufficientFunds)?;
        let new_balance = Amount::from_hundredths(debited.get::<i64, _>(0));

        let record = PaymentRecord {
            id: Uuid::new_v4(),
            user_id,
            kind: PaymentKind::Withdraw,
            amount,
            phone,
            gateway_txn_id: None,
            external_id: external_id.to_string(),
            status: PaymentStatus::Processing,
            gateway_status: None,
            error_reason: None,
            created_at: now,
            updated_at: now,
        };
        insert_payment(&mut tx, &record).await?;
        tx.commit().await?;
        Ok((record, new_balance))
    }

    pub async fn set_gateway_txn(
        &self,
        payment_id: Uuid,
        gateway_txn_id: Option<&str>,
        gateway_status: Option<&str>,
    ) -> Result<(), ApiError> {
        let _gate = self.write_gate.lock().await;
        sqlx::query(
            "UPDATE payments SET gateway_txn_id = COALESCE(?, gateway_txn_id),
                    gateway_status = COALESCE(?, gateway_status), updated_at = ?
             WHERE id = ?",
        )
        .bind(gateway_txn_id)
        .bind(gateway_status)
        .bind(now_ms())
        .bind(payment_id.to_string())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Take an intent to a terminal state exactly once. The status is
    /// re-read inside the transaction, so duplicate gateway callbacks and
    /// the poller cannot double-credit or double-refund.
    ///
    /// Balance effects: deposit + confirmed credits the user; withdrawal +
    /// failed/expired restores the debit taken at intent creation.
    pub async fn finalize_intent(
        &self,
        payment_id: Uuid,
        terminal: PaymentStatus,
        gateway_status: Option<&str>,
        error_reason: Option<&str>,
    ) -> Result<FinalizeOutcome, ApiError> {
        if !terminal.is_terminal() {
            return Err(ApiError::internal("finalize_intent requires a terminal status"));
        }
        let _gate = self.write_gate.lock().await;
        let now = now_ms();
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query("SELECT user_id, kind, amount, status FROM payments WHERE id = ?")
            .bind(payment_id.to_string())
            .fetch_optional(&mut *tx)
            .await?
            .ok_or(ApiError::NotFound("payment"))?;
        let user_id: String = row.get(0);
        let kind = PaymentKind::parse(&row.get::<String, _>(1))
            .ok_or_else(|| ApiError::internal("unknown payment kind in storage"))?;
        let amount = Amount::from_hundredths(row.get::<i64, _>(2));
        let current = PaymentStatus::parse(&row.get::<String, _>(3))
            .ok_or_else(|| ApiError::internal("unknown payment status in storage"))?;

        if current.is_terminal() {
            return Ok(FinalizeOutcome {
                already_terminal: true,
                status: current,
            });
        }

        let credit = match (kind, terminal) {
            (PaymentKind::Deposit, PaymentStatus::Confirmed) => Some(amount),
            (PaymentKind::Withdraw, PaymentStatus::Failed | PaymentStatus::Expired) => Some(amount),
            _ => None,
        };
        if let Some(credit) = credit {
            sqlx::query("UPDATE users SET balance = balance + ?, updated_at = ? WHERE id = ?")
                .bind(credit.hundredths())
                .bind(now)
                .bind(&user_id)
                .execute(&mut *tx)
                .await?;
        }

        sqlx::query(
            "UPDATE payments SET status = ?, gateway_status = COALESCE(?, gateway_status),
                    error_reason = ?, updated_at = ?
             WHERE id = ?",
        )
        .bind(terminal.as_str())
        .bind(gateway_status)
        .bind(error_reason)
        .bind(now)
        .bind(payment_id.to_string())
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(FinalizeOutcome {
            already_terminal: false,
            status: terminal,
        })
    }

    pub async fn payment_by_external(
        &self,
        user_id: Uuid,
        external_id: &str,
    ) -> Result<PaymentRecord, ApiError> {
        let row = sqlx::query(
            "SELECT id, user_id, kind, amount, phone, gateway_txn_id, external_id, status,
                    gateway_status, error_reason, created_at, updated_at
             FROM payments WHERE external_id = ? AND user_id = ?",
        )
        .bind(external_id)
        .bind(user_id.to_string())
        .fetch_optional(&self.pool)
        .await?
        .ok_or(ApiError::NotFound("payment"))?;
        payment_from_row(&row)
    }

    pub async fn payment_history(
        &self,
        user_id: Uuid,
        limit: i64,
        offset: i64,
    ) -> Result<(Vec<PaymentRecord>, i64), ApiError> {
        let rows = sqlx::query(
            "SELECT id, user_id, kind, amount, phone, gateway_txn_id, external_id, status,
                    gateway_status, error_reason, created_at, updated_at
             FROM payments WHERE user_id = ?
             ORDER BY created_at DESC LIMIT ? OFFSET ?",
        )
        .bind(user_id.to_string())
        .bind(limit.max(0))
        .bind(offset.max(0))
        .fetch_all(&self.pool)
        .await?;
        let transactions = rows
            .iter()
            .map(payment_from_row)
            .collect::<Result<Vec<_>, _>>()?;

        let count_row = sqlx::query("SELECT COUNT(*) FROM payments WHERE user_id = ?")
            .bind(user_id.to_string())
            .fetch_one(&self.pool)
            .await?;
        Ok((transactions, count_row.get::<i64, _>(0)))
    }

    /// Non-terminal intents, oldest first. The reconciler resumes these at
    /// boot so a restart never strands an in-flight payment.
    pub async fn open_intents(&self) -> Result<Vec<PaymentRecord>, ApiError> {
        let rows = sqlx::query(
            "SELECT id, user_id, kind, amount, phone, gateway_txn_id, external_id, status,
                    gateway_status, error_reason, created_at, updated_at
             FROM payments WHERE status IN ('pending', 'processing')
             ORDER BY created_at ASC",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(payment_from_row).collect()
    }
}

async fn balance_in_tx(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    user_id: Uuid,
) -> Result<Amount, ApiError> {
    let user = user_id.to_string();
    balance_in_tx_raw(tx, &user).await
}

async fn balance_in_tx_raw(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    user_id: &str,
) -> Result<Amount, ApiError> {
    let row = sqlx::query("SELECT balance FROM users WHERE id = ?")
        .bind(user_id)
        .fetch_optional(&mut **tx)
        .await?
        .ok_or(ApiError::NotFound("user"))?;
    Ok(Amount::from_hundredths(row.get::<i64, _>(0)))
}

async fn insert_payment(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    record: &PaymentRecord,
) -> Result<(), ApiError> {
    let inserted = sqlx::query(
        "INSERT INTO payments (id, user_id, kind, amount, phone, gateway_txn_id, external_id,
                               status, gateway_status, error_reason, created_at, updated_at)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(record.id.to_string())
    .bind(record.user_id.to_string())
    .bind(record.kind.as_str())
    .bind(record.amount.hundredths())
    .bind(&record.phone)
    .bind(record.gateway_txn_id.as_deref())
    .bind(&record.external_id)
    .bind(record.status.as_str())
    .bind(record.gateway_status.as_deref())
    .bind(record.error_reason.as_deref())
    .bind(record.created_at)
    .bind(record.updated_at)
    .execute(&mut **tx)
    .await;
    match inserted {
        Ok(_) => Ok(()),
        Err(err) if db::is_unique_violation(&err) => {
            Err(ApiError::conflict("transaction already submitted"))
        }
        Err(err) => Err(err.into()),
    }
}

/// Reconstruct the cashout multiplier from a settled bet for idempotent
/// replies. Exact whenever the payout was produced by `mul_multiplier`.
fn implied_multiplier(payout: Amount, bet_amount: Amount) -> Multiplier {
    if bet_amount.hundredths() <= 0 {
        return Multiplier::ONE;
    }
    let scaled = payout.hundredths() as i128 * 100;
    let bet = bet_amount.hundredths() as i128;
    let hundredths = (scaled + bet / 2) / bet;
    Multiplier::from_hundredths(hundredths.clamp(0, u64::MAX as i128) as u64)
}

fn parse_stored_uuid(raw: &str) -> Result<Uuid, ApiError> {
    Uuid::parse_str(raw).map_err(|_| ApiError::internal("malformed id in storage"))
}

fn round_from_row(row: &SqliteRow) -> Result<RoundRecord, ApiError> {
    Ok(RoundRecord {
        round_id: parse_stored_uuid(&row.get::<String, _>(0))?,
        commit_idx: row.get::<Option<i64>, _>(1),
        server_seed_hash: row.get::<String, _>(2),
        server_seed: row.get::<Option<String>, _>(3),
        crash_point: row
            .get::<Option<i64>, _>(4)
            .map(|hundredths| Multiplier::from_hundredths(hundredths.max(0) as u64)),
        started_at: row.get::<i64, _>(5),
        ended_at: row.get::<Option<i64>, _>(6),
        settlement_window_seconds: row.get::<i64, _>(7),
        settlement_closed_at: row.get::<Option<i64>, _>(8),
    })
}

fn bet_from_row(row: &SqliteRow) -> Result<BetRecord, ApiError> {
    Ok(BetRecord {
        id: parse_stored_uuid(&row.get::<String, _>(0))?,
        round_id: parse_stored_uuid(&row.get::<String, _>(1))?,
        user_id: parse_stored_uuid(&row.get::<String, _>(2))?,
        bet_amount: Amount::from_hundredths(row.get::<i64, _>(3)),
        payout: row.get::<Option<i64>, _>(4).map(Amount::from_hundredths),
        status: BetStatus::parse(&row.get::<String, _>(5))
            .ok_or_else(|| ApiError::internal("unknown bet status in storage"))?,
        bet_placed_at: row.get::<i64, _>(6),
        claimed_at: row.get::<Option<i64>, _>(7),
    })
}

fn payment_from_row(row: &SqliteRow) -> Result<PaymentRecord, ApiError> {
    Ok(PaymentRecord {
        id: parse_stored_uuid(&row.get::<String, _>(0))?,
        user_id: parse_stored_uuid(&row.get::<String, _>(1))?,
        kind: PaymentKind::parse(&row.get::<String, _>(2))
            .ok_or_else(|| ApiError::internal("unknown payment kind in storage"))?,
        amount: Amount::from_hundredths(row.get::<i64, _>(3)),
        phone: row.get::<String, _>(4),
        gateway_txn_id: row.get::<Option<String>, _>(5),
        external_id: row.get::<String, _>(6),
        status: PaymentStatus::parse(&row.get::<String, _>(7))
            .ok_or_else(|| ApiError::internal("unknown payment status in storage"))?,
        gateway_status: row.get::<Option<String>, _>(8),
        error_reason: row.get::<Option<String>, _>(9),
        created_at: row.get::<i64, _>(10),
        updated_at: row.get::<i64, _>(11),
    })
}
