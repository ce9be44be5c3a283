//! Provably-fair crash engine: seed chain, crash-point derivation, and the
//! single-owner round state machine.

pub mod fairness;
pub mod round;

pub use fairness::{
    derive_crash_point, ephemeral_seed, seed_hash, verify_commitment, SeedChain, SEED_LEN,
};
pub use round::{
    CashoutOutcome, CrashEngine, EngineConfig, EngineError, EngineStatus, JoinAck, RoundCrashed,
    RoundEvent, RoundPrep, RoundStarted, DEFAULT_ROUND_GAP_MS, MIN_CRASH_DELAY_MS,
};
