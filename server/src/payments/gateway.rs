//! HTTP client for the external mobile-money gateway.
//!
//! Two base URLs: collections move money in (deposits), disbursements move
//! money out (withdrawals). Both accept the same request shape and answer
//! with a gateway transaction id plus a free-form status string that is
//! mapped case-insensitively by `crashline_types::map_gateway_status`.

use crate::error::ApiError;
use crashline_types::{Amount, PaymentKind};
use serde::{Deserialize, Serialize};
use std::time::Duration;

const GATEWAY_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Clone, Debug)]
pub struct GatewayConfig {
    pub collections_base_url: String,
    pub disbursements_base_url: String,
    pub token: String,
    /// Account name presented as the counterparty on gateway requests.
    pub account_name: String,
}

#[derive(Serialize)]
struct GatewayRequest<'a> {
    amount: Amount,
    sender: &'a str,
    receiver: &'a str,
    uuid: &'a str,
    token: &'a str,
    description: &'a str,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct GatewayReply {
    #[serde(
        rename = "transaction_id",
        alias = "transactionId",
        alias = "txn_id",
        default
    )]
    pub transaction_id: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}

#[derive(Clone)]
pub struct PaymentGateway {
    client: reqwest::Client,
    config: GatewayConfig,
}

impl PaymentGateway {
    pub fn new(config: GatewayConfig) -> Result<Self, ApiError> {
        let client = reqwest::Client::builder()
            .timeout(GATEWAY_REQUEST_TIMEOUT)
            .build()
            .map_err(|err| ApiError::internal(format!("gateway client: {err}")))?;
        Ok(Self { client, config })
    }

    /// Ask the gateway to collect `amount` from `phone` (deposit).
    pub async fn initiate_collection(
        &self,
        amount: Amount,
        phone: &str,
        uuid: &str,
    ) -> Result<GatewayReply, ApiError> {
        self.initiate(
            &self.config.collections_base_url,
            GatewayRequest {
                amount,
                sender: phone,
                receiver: &self.config.account_name,
                uuid,
                token: &self.config.token,
                description: "wallet deposit",
            },
        )
        .await
    }

    /// Ask the gateway to disburse `amount` to `phone` (withdrawal).
    pub async fn initiate_disbursement(
        &self,
        amount: Amount,
        phone: &str,
        uuid: &str,
    ) -> Result<GatewayReply, ApiError> {
        self.initiate(
            &self.config.disbursements_base_url,
            GatewayRequest {
                amount,
                sender: &self.config.account_name,
                receiver: phone,
                uuid,
                token: &self.config.token,
                description: "wallet withdrawal",
            },
        )
        .await
    }

    /// Poll the status endpoint for an in-flight transaction.
    pub async fn fetch_status(
        &self,
        kind: PaymentKind,
        uuid: &str,
    ) -> Result<GatewayReply, ApiError> {
        let base = match kind {
            PaymentKind::Deposit => &self.config.collections_base_url,
            PaymentKind::Withdraw => &self.config.disbursements_base_url,
        };
        let url = format!("{}/status/{uuid}", base.trim_end_matches('/'));
        let response = self
            .client
            .get(&url)
            .bearer_auth(&self.config.token)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(ApiError::Downstream(format!(
                "gateway status returned HTTP {}",
                response.status()
            )));
        }
        Ok(response.json::<GatewayReply>().await?)
    }

    async fn initiate(
        &self,
        base_url: &str,
        request: GatewayRequest<'_>,
    ) -> Result<GatewayReply, ApiError> {
        let response = self.client.post(base_url).json(&request).send().await?;
        if !response.status().is_success() {
            return Err(ApiError::Downstream(format!(
                "gateway returned HTTP {}",
                response.status()
            )));
        }
        Ok(response.json::<GatewayReply>().await?)
    }
}
