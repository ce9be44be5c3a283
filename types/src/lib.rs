//! Shared value types for the crashline workspace: exact-decimal money,
//! round/bet/payment domain enums, and the HTTP wire payloads.

pub mod api;
pub mod money;
pub mod payment;
pub mod round;

pub use money::{Amount, MoneyParseError, Multiplier};
pub use payment::{
    map_gateway_status, GatewayDisposition, PaymentKind, PaymentRecord, PaymentStatus,
};
pub use round::{BetRecord, BetStatus, RoundRecord, RoundStatus, SeedCommit};

/// Current unix time in milliseconds. All timestamps in the system (engine,
/// ledger, API) are epoch milliseconds.
pub fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as i64)
        .unwrap_or(0)
}
