//! The persisted seed commitment chain.
//!
//! Commitment (the public hash, persisted before use) is separated from
//! revelation (the seed, disclosed when the round crashes). A client that
//! fetched commitment `i` before a round can later verify both that the
//! revealed seed hashes to it and that the crash point derives from the
//! seed.

use crate::error::ApiError;
use crashline_engine::{ephemeral_seed, fairness, RoundPrep, SeedChain};
use crashline_types::{now_ms, SeedCommit};
use sqlx::{Row, SqlitePool};
use std::sync::Arc;
use tokio::sync::Mutex;

pub struct SeedStore {
    pool: SqlitePool,
    write_gate: Arc<Mutex<()>>,
    chain: Option<SeedChain>,
}

impl SeedStore {
    /// Without a master secret seeds cannot be re-derived after a restart,
    /// which orphans already-published commitments. That degraded mode must
    /// be opted into explicitly.
    pub fn new(
        pool: SqlitePool,
        write_gate: Arc<Mutex<()>>,
        master_secret: Option<&str>,
        allow_ephemeral: bool,
    ) -> Result<Self, ApiError> {
        let chain = match master_secret {
            Some(secret) => Some(SeedChain::new(secret.as_bytes().to_vec())),
            None if allow_ephemeral => {
                tracing::warn!(
                    "SEED_MASTER is unset; running on ephemeral seeds — commitments will not be \
                     re-derivable after a restart"
                );
                None
            }
            None => {
                return Err(ApiError::internal(
                    "SEED_MASTER is required unless ALLOW_EPHEMERAL_SEEDS is set",
                ))
            }
        };
        Ok(Self {
            pool,
            write_gate,
            chain,
        })
    }

    pub fn derives_deterministically(&self) -> bool {
        self.chain.is_some()
    }

    /// Highest-index commitment, if any.
    pub async fn latest(&self) -> Result<Option<SeedCommit>, ApiError> {
        let row = sqlx::query(
            "SELECT idx, seed_hash, created_at FROM seed_commits ORDER BY idx DESC LIMIT 1",
        )
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|row| SeedCommit {
            idx: row.get::<i64, _>(0),
            seed_hash: row.get::<String, _>(1),
            created_at: row.get::<i64, _>(2),
        }))
    }

    /// Prepare the next round's seed: derive it, persist its commitment at
    /// `max(idx)+1`, and hand both to the engine. Idempotent under
    /// concurrent callers via the unique index on `idx`.
    pub async fn ensure_next(&self) -> Result<RoundPrep, ApiError> {
        let _gate = self.write_gate.lock().await;

        let row = sqlx::query("SELECT COALESCE(MAX(idx) + 1, 0) FROM seed_commits")
            .fetch_one(&self.pool)
            .await?;
        let idx: i64 = row.get(0);

        let seed = match &self.chain {
            Some(chain) => chain.seed_for(idx),
            None => ephemeral_seed(),
        };
        let seed_hash = fairness::seed_hash(&seed);

        let inserted = sqlx::query(
            "INSERT OR IGNORE INTO seed_commits (idx, seed_hash, created_at) VALUES (?, ?, ?)",
        )
        .bind(idx)
        .bind(hex::encode(seed_hash))
        .bind(now_ms())
        .execute(&self.pool)
        .await?;

        if inserted.rows_affected() == 0 {
            // Someone else committed this index first; only a deterministic
            // chain can still produce the matching seed.
            let stored = sqlx::query("SELECT seed_hash FROM seed_commits WHERE idx = ?")
                .bind(idx)
                .fetch_one(&self.pool)
                .await?;
            let stored_hash: String = stored.get(0);
            if stored_hash != hex::encode(seed_hash) {
                return Err(ApiError::internal(format!(
                    "commitment {idx} exists with a different hash; cannot recover its seed"
                )));
            }
        }

        Ok(RoundPrep::new(Some(idx), seed))
    }

    /// Verify that the persisted chain is still derivable from the
    /// configured master secret. Run at boot; a mismatch means the secret
    /// changed under existing commitments.
    pub async fn verify_chain_head(&self) -> Result<(), ApiError> {
        let Some(chain) = &self.chain else {
            return Ok(());
        };
        let Some(latest) = self.latest().await? else {
            return Ok(());
        };
        let derived = fairness::seed_hash(&chain.seed_for(latest.idx));
        if hex::encode(derived) != latest.seed_hash {
            return Err(ApiError::internal(format!(
                "seed commitment {} does not derive from the configured master secret",
                latest.idx
            )));
        }
        Ok(())
    }
}
