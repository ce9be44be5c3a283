//! End-to-end scenarios across the engine, ledger, coordinator, and
//! payment reconciler, against an in-memory database.

use crate::config::PollingConfig;
use crate::coordinator::{BetCoordinator, BetLimits, CashoutThrottle};
use crate::db;
use crate::error::ApiError;
use crate::ledger::{Ledger, LedgerConfig, UserRecord};
use crate::payments::gateway::{GatewayConfig, PaymentGateway};
use crate::payments::Reconciler;
use crate::seed_store::SeedStore;
use axum::extract::{Path, State};
use axum::routing::get;
use axum::{Json, Router};
use crashline_engine::{
    derive_crash_point, fairness, CrashEngine, EngineConfig, RoundEvent, RoundPrep, RoundStarted,
    SeedChain,
};
use crashline_types::{now_ms, Amount, BetStatus, Multiplier, PaymentStatus};
use sha2::{Digest, Sha256};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex};
use uuid::Uuid;

fn amount(raw: &str) -> Amount {
    raw.parse().expect("test amount")
}

async fn test_ledger() -> Ledger {
    let pool = db::test_pool().await;
    Ledger::new(
        pool,
        Arc::new(Mutex::new(())),
        LedgerConfig::default(),
    )
}

async fn new_user(ledger: &Ledger, phone: &str) -> UserRecord {
    ledger
        .create_user(phone, "password-hash")
        .await
        .expect("create user")
}

/// Fund a user through the deposit flow: intent plus confirmed finalize.
async fn fund(ledger: &Ledger, user_id: Uuid, raw: &str) {
    let record = ledger
        .create_deposit(user_id, amount(raw), Uuid::new_v4())
        .await
        .expect("create deposit");
    ledger
        .finalize_intent(record.id, PaymentStatus::Confirmed, Some("SUCCESSFUL"), None)
        .await
        .expect("confirm deposit");
}

/// First chain index whose crash point is at least `min_hundredths`.
fn prep_with_crash_at_least(min_hundredths: u64) -> RoundPrep {
    let chain = SeedChain::new(b"server test chain".to_vec());
    for idx in 0..10_000 {
        let seed = chain.seed_for(idx);
        if derive_crash_point(&seed, b"").hundredths() >= min_hundredths {
            return RoundPrep::new(Some(idx), seed);
        }
    }
    panic!("no chain index with crash >= {min_hundredths}");
}

fn expect_started(events: &mut mpsc::UnboundedReceiver<RoundEvent>) -> RoundStarted {
    match events.try_recv().expect("expected a lifecycle event") {
        RoundEvent::Started(started) => started,
        other => panic!("expected Started, got {other:?}"),
    }
}

// ── bets and cashouts ───────────────────────────────────────────────────

#[tokio::test]
async fn cashout_settles_and_replays_idempotently() {
    let ledger = test_ledger().await;
    let user = new_user(&ledger, "256700000001").await;
    fund(&ledger, user.id, "100.00").await;

    let (mut engine, mut events) = CrashEngine::new(EngineConfig::default());
    let t0 = now_ms();
    let round_id = engine
        .start_round(prep_with_crash_at_least(400), t0)
        .unwrap();
    ledger
        .persist_round_start(&expect_started(&mut events))
        .await
        .unwrap();

    let (bet_id, balance) = ledger
        .place_bet(user.id, round_id, amount("10.00"))
        .await
        .unwrap();
    assert_eq!(balance.to_string(), "90.00");
    engine
        .join(user.id, amount("10.00"), round_id, t0 + 100)
        .unwrap();

    let outcome = engine.cashout(user.id, t0 + 2_200).unwrap();
    assert!(outcome.win);
    assert_eq!(outcome.multiplier.hundredths(), 320);

    let settled = ledger
        .settle_cashout(user.id, round_id, Some(&outcome))
        .await
        .unwrap();
    assert!(settled.win);
    assert!(!settled.idempotent);
    assert_eq!(settled.payout.to_string(), "32.00");
    assert_eq!(settled.balance.to_string(), "122.00");

    let bet = ledger.bet_by_id(bet_id).await.unwrap();
    assert_eq!(bet.status, BetStatus::Cashed);
    assert!(bet.claimed_at.is_some());
    assert_eq!(bet.payout.unwrap().to_string(), "32.00");

    // A repeated cashout answers from the bet row with no further credit.
    let replay = ledger.settle_cashout(user.id, round_id, None).await.unwrap();
    assert!(replay.idempotent);
    assert!(replay.win);
    assert_eq!(replay.payout.to_string(), "32.00");
    assert_eq!(replay.multiplier.hundredths(), 320);
    assert_eq!(replay.balance.to_string(), "122.00");
}

#[tokio::test]
async fn losing_bet_is_marked_lost_and_the_reveal_verifies() {
    let ledger = test_ledger().await;
    let user = new_user(&ledger, "256700000002").await;
    fund(&ledger, user.id, "100.00").await;

    let (mut engine, mut events) = CrashEngine::new(EngineConfig::default());
    let t0 = now_ms();
    let prep = prep_with_crash_at_least(150);
    let crash = derive_crash_point(&prep.seed, b"");
    let deadline = t0 + ((crash.hundredths() - 100) * 10).max(100) as i64;
    let round_id = engine.start_round(prep, t0).unwrap();
    let started = expect_started(&mut events);
    ledger.persist_round_start(&started).await.unwrap();

    ledger
        .place_bet(user.id, round_id, amount("10.00"))
        .await
        .unwrap();
    engine
        .join(user.id, amount("10.00"), round_id, t0)
        .unwrap();

    // Never cashes out; the deadline fires.
    engine.advance(deadline);
    let crashed = match events.try_recv().unwrap() {
        RoundEvent::Crashed(crashed) => crashed,
        other => panic!("expected Crashed, got {other:?}"),
    };
    ledger.persist_round_crash(&crashed).await.unwrap();

    assert_eq!(
        ledger.user_balance(user.id).await.unwrap().to_string(),
        "90.00"
    );
    let (round, bets) = ledger.round_detail(round_id).await.unwrap();
    assert_eq!(bets.len(), 1);
    assert_eq!(bets[0].status, BetStatus::Lost);
    assert_eq!(bets[0].payout.unwrap(), Amount::ZERO);
    assert_eq!(
        round.settlement_closed_at.unwrap(),
        round.ended_at.unwrap() + 300 * 1_000
    );

    // Commitment binding: the revealed seed hashes to the committed value
    // and re-derives the crash point.
    let revealed = ledger.reveal(round_id).await.unwrap();
    let seed_bytes: [u8; 32] = hex::decode(revealed.server_seed.as_ref().unwrap())
        .unwrap()
        .try_into()
        .unwrap();
    let digest: [u8; 32] = Sha256::digest(seed_bytes).into();
    assert_eq!(hex::encode(digest), revealed.server_seed_hash);
    assert!(fairness::verify_commitment(&digest, &seed_bytes));
    assert_eq!(derive_crash_point(&seed_bytes, b""), crash);
    assert_eq!(revealed.crash_point.unwrap(), crash);

    // A late cashout replays as a loss at the crash point.
    let replay = ledger.settle_cashout(user.id, round_id, None).await.unwrap();
    assert!(replay.idempotent);
    assert!(!replay.win);
    assert_eq!(replay.payout, Amount::ZERO);
    assert_eq!(replay.multiplier, revealed.crash_point.unwrap());
}

#[tokio::test]
async fn duplicate_bets_leave_exactly_one_row() {
    let ledger = test_ledger().await;
    let user = new_user(&ledger, "256700000003").await;
    fund(&ledger, user.id, "100.00").await;

    let (mut engine, mut events) = CrashEngine::new(EngineConfig::default());
    let round_id = engine
        .start_round(prep_with_crash_at_least(200), now_ms())
        .unwrap();
    ledger
        .persist_round_start(&expect_started(&mut events))
        .await
        .unwrap();

    let (first, second) = tokio::join!(
        ledger.place_bet(user.id, round_id, amount("10.00")),
        ledger.place_bet(user.id, round_id, amount("10.00")),
    );
    let successes = [first.is_ok(), second.is_ok()]
        .into_iter()
        .filter(|ok| *ok)
        .count();
    assert_eq!(successes, 1);
    let failure = if first.is_err() { first } else { second };
    assert!(matches!(failure, Err(ApiError::Conflict(_))));

    let (_, bets) = ledger.round_detail(round_id).await.unwrap();
    assert_eq!(bets.len(), 1);
    assert_eq!(
        ledger.user_balance(user.id).await.unwrap().to_string(),
        "90.00"
    );
}

#[tokio::test]
async fn bet_guards_reject_bad_funds_and_stale_rounds() {
    let ledger = test_ledger().await;
    let user = new_user(&ledger, "256700000004").await;
    fund(&ledger, user.id, "5.00").await;

    let (mut engine, mut events) = CrashEngine::new(EngineConfig::default());
    let round_id = engine
        .start_round(prep_with_crash_at_least(200), now_ms())
        .unwrap();
    ledger
        .persist_round_start(&expect_started(&mut events))
        .await
        .unwrap();

    let broke = ledger.place_bet(user.id, round_id, amount("10.00")).await;
    assert!(matches!(broke, Err(ApiError::InsufficientFunds)));

    let unknown_user = ledger
        .place_bet(Uuid::new_v4(), round_id, amount("1.00"))
        .await;
    assert!(matches!(unknown_user, Err(ApiError::NotFound("user"))));

    let unknown_round = ledger
        .place_bet(user.id, Uuid::new_v4(), amount("1.00"))
        .await;
    assert!(matches!(unknown_round, Err(ApiError::NotFound("round"))));

    // A round whose start is past the age window refuses bets.
    let stale = RoundStarted {
        round_id: Uuid::new_v4(),
        commit_idx: None,
        seed_hash: [0u8; 32],
        crash_point: Multiplier::ONE,
        started_at: now_ms() - 400_000,
    };
    ledger.persist_round_start(&stale).await.unwrap();
    let too_late = ledger
        .place_bet(user.id, stale.round_id, amount("1.00"))
        .await;
    assert!(matches!(too_late, Err(ApiError::RoundStale)));
}

#[tokio::test]
async fn settlement_window_closes_cashouts() {
    let ledger = test_ledger().await;

    // A round that crashed long enough ago that ended_at + window is
    // already behind now. The window check precedes the bet lookup, so
    // every cashout against it is rejected.
    let (mut engine, mut events) = CrashEngine::new(EngineConfig::default());
    let prep = prep_with_crash_at_least(150);
    let crash = derive_crash_point(&prep.seed, b"");
    let delay = ((crash.hundredths() - 100) * 10).max(100) as i64;
    let t0 = now_ms() - 301_000 - delay;
    let round_id = engine.start_round(prep, t0).unwrap();
    ledger
        .persist_round_start(&expect_started(&mut events))
        .await
        .unwrap();

    engine.advance(t0 + delay);
    let crashed = match events.try_recv().unwrap() {
        RoundEvent::Crashed(crashed) => crashed,
        other => panic!("expected Crashed, got {other:?}"),
    };
    ledger.persist_round_crash(&crashed).await.unwrap();

    let rejected = ledger.settle_cashout(Uuid::new_v4(), round_id, None).await;
    assert!(matches!(rejected, Err(ApiError::SettlementClosed)));
}

#[tokio::test]
async fn admin_refund_restores_funds_once() {
    let ledger = test_ledger().await;
    let user = new_user(&ledger, "256700000006").await;
    fund(&ledger, user.id, "100.00").await;

    let (mut engine, mut events) = CrashEngine::new(EngineConfig::default());
    let round_id = engine
        .start_round(prep_with_crash_at_least(200), now_ms())
        .unwrap();
    ledger
        .persist_round_start(&expect_started(&mut events))
        .await
        .unwrap();
    let (bet_id, _) = ledger
        .place_bet(user.id, round_id, amount("25.00"))
        .await
        .unwrap();

    let refund = ledger.admin_refund(bet_id).await.unwrap();
    assert!(!refund.already_refunded);
    assert_eq!(refund.balance.to_string(), "100.00");
    assert_eq!(
        ledger.bet_by_id(bet_id).await.unwrap().status,
        BetStatus::Refunded
    );

    let again = ledger.admin_refund(bet_id).await.unwrap();
    assert!(again.already_refunded);
    assert_eq!(again.balance.to_string(), "100.00");
}

#[tokio::test]
async fn cashed_bets_cannot_be_refunded() {
    let ledger = test_ledger().await;
    let user = new_user(&ledger, "256700000007").await;
    fund(&ledger, user.id, "100.00").await;

    let (mut engine, mut events) = CrashEngine::new(EngineConfig::default());
    let t0 = now_ms();
    let round_id = engine
        .start_round(prep_with_crash_at_least(300), t0)
        .unwrap();
    ledger
        .persist_round_start(&expect_started(&mut events))
        .await
        .unwrap();
    let (bet_id, _) = ledger
        .place_bet(user.id, round_id, amount("10.00"))
        .await
        .unwrap();
    engine
        .join(user.id, amount("10.00"), round_id, t0)
        .unwrap();
    let outcome = engine.cashout(user.id, t0 + 500).unwrap();
    ledger
        .settle_cashout(user.id, round_id, Some(&outcome))
        .await
        .unwrap();

    let rejected = ledger.admin_refund(bet_id).await;
    assert!(matches!(rejected, Err(ApiError::Conflict(_))));
}

#[tokio::test]
async fn failed_engine_join_is_compensated() {
    let ledger = test_ledger().await;
    let user = new_user(&ledger, "256700000008").await;
    fund(&ledger, user.id, "50.00").await;

    // The ledger accepted the bet against a round the engine no longer
    // runs (it has none at all here).
    let started = RoundStarted {
        round_id: Uuid::new_v4(),
        commit_idx: None,
        seed_hash: [0u8; 32],
        crash_point: Multiplier::ONE,
        started_at: now_ms(),
    };
    ledger.persist_round_start(&started).await.unwrap();
    let (bet_id, balance) = ledger
        .place_bet(user.id, started.round_id, amount("10.00"))
        .await
        .unwrap();
    assert_eq!(balance.to_string(), "40.00");

    let (engine, _events) = CrashEngine::new(EngineConfig::default());
    let coordinator = BetCoordinator::new(
        Arc::new(Mutex::new(engine)),
        ledger.clone(),
        BetLimits {
            min_bet: amount("1.00"),
            max_bet: amount("1000.00"),
        },
        CashoutThrottle {
            min_interval_ms: 1_000,
            prune_age_ms: 60_000,
            max_entries: 128,
        },
    );

    let err = coordinator
        .join_or_compensate(user.id, amount("10.00"), started.round_id, bet_id)
        .await
        .unwrap_err();
    assert!(matches!(err, ApiError::Validation(_)));

    assert_eq!(
        ledger.user_balance(user.id).await.unwrap().to_string(),
        "50.00"
    );
    assert_eq!(
        ledger.bet_by_id(bet_id).await.unwrap().status,
        BetStatus::Refunded
    );
}

#[tokio::test]
async fn cashout_attempts_are_throttled_per_user() {
    let ledger = test_ledger().await;
    let user = new_user(&ledger, "256700000009").await;

    let (engine, _events) = CrashEngine::new(EngineConfig::default());
    let coordinator = BetCoordinator::new(
        Arc::new(Mutex::new(engine)),
        ledger,
        BetLimits {
            min_bet: amount("1.00"),
            max_bet: amount("1000.00"),
        },
        CashoutThrottle {
            min_interval_ms: 60_000,
            prune_age_ms: 60_000,
            max_entries: 128,
        },
    );

    // No round is running, so the first attempt fails validation — but it
    // still consumes the per-user slot.
    let first = coordinator.cashout(user.id).await;
    assert!(matches!(first, Err(ApiError::Validation(_))));
    let second = coordinator.cashout(user.id).await;
    assert!(matches!(second, Err(ApiError::RateLimited)));
}

// ── payments ────────────────────────────────────────────────────────────

#[tokio::test]
async fn deposits_credit_exactly_once() {
    let ledger = test_ledger().await;
    let user = new_user(&ledger, "256700000010").await;

    let record = ledger
        .create_deposit(user.id, amount("50.00"), Uuid::new_v4())
        .await
        .unwrap();
    assert_eq!(record.status, PaymentStatus::Pending);
    assert_eq!(ledger.user_balance(user.id).await.unwrap(), Amount::ZERO);

    let outcome = ledger
        .finalize_intent(record.id, PaymentStatus::Confirmed, Some("SUCCESSFUL"), None)
        .await
        .unwrap();
    assert!(!outcome.already_terminal);
    assert_eq!(
        ledger.user_balance(user.id).await.unwrap().to_string(),
        "50.00"
    );

    // Duplicate confirmation (late callback) cannot double-credit.
    let replay = ledger
        .finalize_intent(record.id, PaymentStatus::Confirmed, Some("SUCCESSFUL"), None)
        .await
        .unwrap();
    assert!(replay.already_terminal);
    assert_eq!(
        ledger.user_balance(user.id).await.unwrap().to_string(),
        "50.00"
    );
}

#[tokio::test]
async fn failed_and_expired_deposits_never_credit() {
    let ledger = test_ledger().await;
    let user = new_user(&ledger, "256700000011").await;

    let record = ledger
        .create_deposit(user.id, amount("50.00"), Uuid::new_v4())
        .await
        .unwrap();
    ledger
        .finalize_intent(record.id, PaymentStatus::Failed, Some("FAILED"), Some("declined"))
        .await
        .unwrap();
    assert_eq!(ledger.user_balance(user.id).await.unwrap(), Amount::ZERO);

    let second = ledger
        .create_deposit(user.id, amount("25.00"), Uuid::new_v4())
        .await
        .unwrap();
    ledger
        .finalize_intent(second.id, PaymentStatus::Expired, None, Some("timed out"))
        .await
        .unwrap();
    assert_eq!(ledger.user_balance(user.id).await.unwrap(), Amount::ZERO);
}

#[tokio::test]
async fn withdrawal_debits_then_refunds_on_failure() {
    let ledger = test_ledger().await;
    let user = new_user(&ledger, "256700000012").await;
    fund(&ledger, user.id, "70.00").await;

    let (record, balance) = ledger
        .create_withdraw(user.id, amount("20.00"), Uuid::new_v4())
        .await
        .unwrap();
    assert_eq!(record.status, PaymentStatus::Processing);
    assert_eq!(balance.to_string(), "50.00");

    ledger
        .finalize_intent(record.id, PaymentStatus::Failed, Some("FAILED"), Some("rejected"))
        .await
        .unwrap();
    assert_eq!(
        ledger.user_balance(user.id).await.unwrap().to_string(),
        "70.00"
    );

    // A later expiry on the same intent cannot refund twice.
    let replay = ledger
        .finalize_intent(record.id, PaymentStatus::Expired, None, None)
        .await
        .unwrap();
    assert!(replay.already_terminal);
    assert_eq!(
        ledger.user_balance(user.id).await.unwrap().to_string(),
        "70.00"
    );
}

#[tokio::test]
async fn confirmed_withdrawal_keeps_the_debit() {
    let ledger = test_ledger().await;
    let user = new_user(&ledger, "256700000013").await;
    fund(&ledger, user.id, "70.00").await;

    let (record, balance) = ledger
        .create_withdraw(user.id, amount("20.00"), Uuid::new_v4())
        .await
        .unwrap();
    assert_eq!(balance.to_string(), "50.00");

    ledger
        .finalize_intent(record.id, PaymentStatus::Confirmed, Some("COMPLETED"), None)
        .await
        .unwrap();
    assert_eq!(
        ledger.user_balance(user.id).await.unwrap().to_string(),
        "50.00"
    );

    let insufficient = ledger
        .create_withdraw(user.id, amount("60.00"), Uuid::new_v4())
        .await;
    assert!(matches!(insufficient, Err(ApiError::InsufficientFunds)));
}

#[tokio::test]
async fn pending_intents_conflict_and_external_ids_are_unique() {
    let ledger = test_ledger().await;
    let user = new_user(&ledger, "256700000014").await;
    let other = new_user(&ledger, "256700000015").await;
    fund(&ledger, user.id, "100.00").await;

    let external = Uuid::new_v4();
    let record = ledger
        .create_deposit(user.id, amount("10.00"), external)
        .await
        .unwrap();

    let duplicate_pending = ledger
        .create_deposit(user.id, amount("10.00"), Uuid::new_v4())
        .await;
    assert!(matches!(duplicate_pending, Err(ApiError::Conflict(_))));

    // A different user reusing the same transaction UUID hits the unique
    // external id.
    let reused = ledger.create_deposit(other.id, amount("10.00"), external).await;
    assert!(matches!(reused, Err(ApiError::Conflict(_))));

    // Withdrawals track their own pending window.
    let (withdraw, _) = ledger
        .create_withdraw(user.id, amount("10.00"), Uuid::new_v4())
        .await
        .unwrap();
    let duplicate_withdraw = ledger
        .create_withdraw(user.id, amount("10.00"), Uuid::new_v4())
        .await;
    assert!(matches!(duplicate_withdraw, Err(ApiError::Conflict(_))));

    ledger
        .finalize_intent(record.id, PaymentStatus::Failed, None, None)
        .await
        .unwrap();
    ledger
        .finalize_intent(withdraw.id, PaymentStatus::Failed, None, None)
        .await
        .unwrap();
    assert!(ledger
        .create_deposit(user.id, amount("10.00"), Uuid::new_v4())
        .await
        .is_ok());
}

// ── reconciler against a scripted gateway ───────────────────────────────

#[derive(Clone)]
struct ScriptedGateway {
    statuses: Arc<StdMutex<VecDeque<String>>>,
}

async fn scripted_status(
    State(gateway): State<ScriptedGateway>,
    Path(_uuid): Path<String>,
) -> Json<serde_json::Value> {
    let mut statuses = gateway.statuses.lock().unwrap();
    let status = if statuses.len() > 1 {
        statuses.pop_front().unwrap()
    } else {
        statuses
            .front()
            .cloned()
            .unwrap_or_else(|| "PENDING".to_string())
    };
    Json(serde_json::json!({ "status": status, "transaction_id": "gw-txn-1" }))
}

/// Serve `/collections/status/:uuid` and `/disbursements/status/:uuid`
/// from a script of status strings; the last entry repeats.
async fn spawn_scripted_gateway(script: &[&str]) -> String {
    let state = ScriptedGateway {
        statuses: Arc::new(StdMutex::new(
            script.iter().map(|s| s.to_string()).collect(),
        )),
    };
    let app = Router::new()
        .route("/collections/status/:uuid", get(scripted_status))
        .route("/disbursements/status/:uuid", get(scripted_status))
        .with_state(state);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind scripted gateway");
    let addr = listener.local_addr().expect("gateway addr");
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    format!("http://{addr}")
}

fn test_gateway(base: &str) -> PaymentGateway {
    PaymentGateway::new(GatewayConfig {
        collections_base_url: format!("{base}/collections"),
        disbursements_base_url: format!("{base}/disbursements"),
        token: "test-token".to_string(),
        account_name: "crashline".to_string(),
    })
    .expect("gateway client")
}

async fn wait_for_status(ledger: &Ledger, user_id: Uuid, external_id: &str, want: PaymentStatus) {
    for _ in 0..300 {
        let record = ledger
            .payment_by_external(user_id, external_id)
            .await
            .expect("payment record");
        if record.status == want {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("intent never reached {want:?}");
}

#[tokio::test]
async fn reconciler_confirms_a_deposit_after_polling() {
    let ledger = test_ledger().await;
    let user = new_user(&ledger, "256700000016").await;
    let record = ledger
        .create_deposit(user.id, amount("50.00"), Uuid::new_v4())
        .await
        .unwrap();

    let base = spawn_scripted_gateway(&["PENDING", "PENDING", "successful"]).await;
    let (_shutdown_tx, shutdown_rx) = watch::channel(false);
    let reconciler = Reconciler::new(
        ledger.clone(),
        test_gateway(&base),
        PollingConfig {
            attempts: 20,
            interval_ms: 10,
            concurrency: 4,
        },
        shutdown_rx,
    );
    reconciler
        .watch_intent(record.id, record.kind, record.external_id.clone())
        .await;

    wait_for_status(&ledger, user.id, &record.external_id, PaymentStatus::Confirmed).await;
    assert_eq!(
        ledger.user_balance(user.id).await.unwrap().to_string(),
        "50.00"
    );

    // A duplicate terminal callback after the poller finished is a no-op.
    let replay = ledger
        .finalize_intent(record.id, PaymentStatus::Confirmed, Some("SUCCESSFUL"), None)
        .await
        .unwrap();
    assert!(replay.already_terminal);
    assert_eq!(
        ledger.user_balance(user.id).await.unwrap().to_string(),
        "50.00"
    );
}

#[tokio::test]
async fn reconciler_expires_a_withdrawal_and_refunds() {
    let ledger = test_ledger().await;
    let user = new_user(&ledger, "256700000017").await;
    fund(&ledger, user.id, "70.00").await;

    let (record, balance) = ledger
        .create_withdraw(user.id, amount("20.00"), Uuid::new_v4())
        .await
        .unwrap();
    assert_eq!(balance.to_string(), "50.00");

    let base = spawn_scripted_gateway(&["PENDING"]).await;
    let (_shutdown_tx, shutdown_rx) = watch::channel(false);
    let reconciler = Reconciler::new(
        ledger.clone(),
        test_gateway(&base),
        PollingConfig {
            attempts: 3,
            interval_ms: 10,
            concurrency: 4,
        },
        shutdown_rx,
    );
    reconciler
        .watch_intent(record.id, record.kind, record.external_id.clone())
        .await;

    wait_for_status(&ledger, user.id, &record.external_id, PaymentStatus::Expired).await;
    assert_eq!(
        ledger.user_balance(user.id).await.unwrap().to_string(),
        "70.00"
    );
}

// ── seed store ──────────────────────────────────────────────────────────

#[tokio::test]
async fn seed_chain_persists_and_survives_restart() {
    let pool = db::test_pool().await;
    let gate = Arc::new(Mutex::new(()));
    let store = SeedStore::new(pool.clone(), Arc::clone(&gate), Some("master"), false).unwrap();

    assert!(store.latest().await.unwrap().is_none());
    let first = store.ensure_next().await.unwrap();
    assert_eq!(first.commit_idx, Some(0));
    let second = store.ensure_next().await.unwrap();
    assert_eq!(second.commit_idx, Some(1));

    let latest = store.latest().await.unwrap().unwrap();
    assert_eq!(latest.idx, 1);
    assert_eq!(latest.seed_hash, hex::encode(second.seed_hash));

    // Same secret after a restart: chain verifies and continues.
    let restarted = SeedStore::new(pool.clone(), Arc::clone(&gate), Some("master"), false).unwrap();
    restarted.verify_chain_head().await.unwrap();
    let third = restarted.ensure_next().await.unwrap();
    assert_eq!(third.commit_idx, Some(2));

    // A different secret cannot own the persisted chain.
    let imposter = SeedStore::new(pool, gate, Some("other"), false).unwrap();
    assert!(imposter.verify_chain_head().await.is_err());
}

#[tokio::test]
async fn seed_store_requires_a_master_secret_or_the_dev_flag() {
    let pool = db::test_pool().await;
    let gate = Arc::new(Mutex::new(()));
    assert!(SeedStore::new(pool.clone(), Arc::clone(&gate), None, false).is_err());

    let degraded = SeedStore::new(pool, gate, None, true).unwrap();
    assert!(!degraded.derives_deterministically());
    let prep = degraded.ensure_next().await.unwrap();
    assert_eq!(prep.commit_idx, Some(0));
}
