//! Payment intent types and the gateway status vocabulary.

use crate::money::Amount;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PaymentKind {
    Deposit,
    Withdraw,
}

impl PaymentKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentKind::Deposit => "deposit",
            PaymentKind::Withdraw => "withdraw",
        }
    }

    pub fn parse(raw: &str) -> Option<PaymentKind> {
        match raw {
            "deposit" => Some(PaymentKind::Deposit),
            "withdraw" => Some(PaymentKind::Withdraw),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PaymentStatus {
    Pending,
    Processing,
    Confirmed,
    Failed,
    Expired,
}

impl PaymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentStatus::Pending => "pending",
            PaymentStatus::Processing => "processing",
            PaymentStatus::Confirmed => "confirmed",
            PaymentStatus::Failed => "failed",
            PaymentStatus::Expired => "expired",
        }
    }

    pub fn parse(raw: &str) -> Option<PaymentStatus> {
        match raw {
            "pending" => Some(PaymentStatus::Pending),
            "processing" => Some(PaymentStatus::Processing),
            "confirmed" => Some(PaymentStatus::Confirmed),
            "failed" => Some(PaymentStatus::Failed),
            "expired" => Some(PaymentStatus::Expired),
            _ => None,
        }
    }

    /// Terminal states never transition again and never move a balance
    /// a second time.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            PaymentStatus::Confirmed | PaymentStatus::Failed | PaymentStatus::Expired
        )
    }
}

/// What a raw gateway status string means for an intent.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GatewayDisposition {
    Success,
    Failure,
    Pending,
}

/// Case-insensitive mapping of the gateway's status vocabulary. Anything
/// unrecognized is treated as still pending and polled again.
pub fn map_gateway_status(raw: &str) -> GatewayDisposition {
    match raw.trim().to_ascii_uppercase().as_str() {
        "SUCCESSFUL" | "SUCCESS" | "CONFIRMED" | "COMPLETED" | "OK" => GatewayDisposition::Success,
        "FAILED" | "FAILURE" | "ERROR" | "REJECTED" | "DECLINED" => GatewayDisposition::Failure,
        _ => GatewayDisposition::Pending,
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct PaymentRecord {
    #[serde(rename = "paymentId")]
    pub id: Uuid,
    #[serde(rename = "userId")]
    pub user_id: Uuid,
    #[serde(rename = "type")]
    pub kind: PaymentKind,
    pub amount: Amount,
    pub phone: String,
    #[serde(rename = "gatewayTxnId", skip_serializing_if = "Option::is_none")]
    pub gateway_txn_id: Option<String>,
    #[serde(rename = "transactionId")]
    pub external_id: String,
    pub status: PaymentStatus,
    #[serde(rename = "gatewayStatus", skip_serializing_if = "Option::is_none")]
    pub gateway_status: Option<String>,
    #[serde(rename = "errorReason", skip_serializing_if = "Option::is_none")]
    pub error_reason: Option<String>,
    #[serde(rename = "createdAt")]
    pub created_at: i64,
    #[serde(rename = "updatedAt")]
    pub updated_at: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gateway_mapping_is_case_insensitive() {
        assert_eq!(map_gateway_status("successful"), GatewayDisposition::Success);
        assert_eq!(map_gateway_status("Completed"), GatewayDisposition::Success);
        assert_eq!(map_gateway_status(" OK "), GatewayDisposition::Success);
        assert_eq!(map_gateway_status("REJECTED"), GatewayDisposition::Failure);
        assert_eq!(map_gateway_status("declined"), GatewayDisposition::Failure);
        assert_eq!(map_gateway_status("IN_PROGRESS"), GatewayDisposition::Pending);
        assert_eq!(map_gateway_status(""), GatewayDisposition::Pending);
    }

    #[test]
    fn terminal_states() {
        assert!(!PaymentStatus::Pending.is_terminal());
        assert!(!PaymentStatus::Processing.is_terminal());
        assert!(PaymentStatus::Confirmed.is_terminal());
        assert!(PaymentStatus::Failed.is_terminal());
        assert!(PaymentStatus::Expired.is_terminal());
    }

    #[test]
    fn status_round_trips_through_storage_text() {
        for status in [
            PaymentStatus::Pending,
            PaymentStatus::Processing,
            PaymentStatus::Confirmed,
            PaymentStatus::Failed,
            PaymentStatus::Expired,
        ] {
            assert_eq!(PaymentStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(PaymentStatus::parse("unknown"), None);
    }
}
