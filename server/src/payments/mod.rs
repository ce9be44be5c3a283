//! Payment intents and the background reconciler.
//!
//! Deposits credit the balance exactly once, when and only when the intent
//! reaches `confirmed`. Withdrawals debit at intent creation and restore
//! the debit on any terminal non-confirmed state. Every terminal
//! transition re-reads the intent status inside the ledger transaction, so
//! the poller, duplicate gateway callbacks, and manual transitions cannot
//! move a balance twice.

pub mod gateway;

use crate::config::{PaymentLimits, PollingConfig};
use crate::error::ApiError;
use crate::ledger::Ledger;
use crashline_types::api::{
    PaymentAcceptedResponse, PaymentHistoryResponse, PaymentRequest, PaymentStatusResponse,
};
use crashline_types::{map_gateway_status, Amount, GatewayDisposition, PaymentKind, PaymentStatus};
use gateway::PaymentGateway;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// The terminal transition a gateway answer implies, if any.
fn terminal_for(disposition: GatewayDisposition) -> Option<PaymentStatus> {
    match disposition {
        GatewayDisposition::Success => Some(PaymentStatus::Confirmed),
        GatewayDisposition::Failure => Some(PaymentStatus::Failed),
        GatewayDisposition::Pending => None,
    }
}

pub struct Reconciler {
    ledger: Ledger,
    gateway: PaymentGateway,
    polling: PollingConfig,
    permits: Arc<Semaphore>,
    shutdown: watch::Receiver<bool>,
    tasks: Mutex<JoinSet<()>>,
}

impl Reconciler {
    pub fn new(
        ledger: Ledger,
        gateway: PaymentGateway,
        polling: PollingConfig,
        shutdown: watch::Receiver<bool>,
    ) -> Arc<Self> {
        let permits = Arc::new(Semaphore::new(polling.concurrency.max(1)));
        Arc::new(Self {
            ledger,
            gateway,
            polling,
            permits,
            shutdown,
            tasks: Mutex::new(JoinSet::new()),
        })
    }

    /// Resume polling for every non-terminal intent. Run at boot so a
    /// restart never strands an in-flight payment.
    pub async fn resume(self: &Arc<Self>) -> Result<(), ApiError> {
        let open = self.ledger.open_intents().await?;
        if !open.is_empty() {
            info!(count = open.len(), "resuming payment polling");
        }
        for intent in open {
            self.watch_intent(intent.id, intent.kind, intent.external_id)
                .await;
        }
        Ok(())
    }

    /// Spawn one supervised polling job for an intent.
    pub async fn watch_intent(self: &Arc<Self>, payment_id: Uuid, kind: PaymentKind, external_id: String) {
        let reconciler = Arc::clone(self);
        self.tasks.lock().await.spawn(async move {
            reconciler.poll_intent(payment_id, kind, external_id).await;
        });
    }

    /// Wait for in-flight polling jobs to wind down, up to `deadline`.
    /// Jobs check the shutdown signal between attempts; any transition in
    /// progress either commits or rolls back inside the ledger.
    pub async fn drain(&self, deadline: Duration) {
        let mut tasks = self.tasks.lock().await;
        let result = tokio::time::timeout(deadline, async {
            while tasks.join_next().await.is_some() {}
        })
        .await;
        if result.is_err() {
            warn!("payment reconciler drain deadline elapsed; aborting remaining jobs");
            tasks.abort_all();
        }
    }

    async fn poll_intent(self: Arc<Self>, payment_id: Uuid, kind: PaymentKind, external_id: String) {
        let Ok(_permit) = self.permits.acquire().await else {
            return;
        };
        let mut shutdown = self.shutdown.clone();
        let interval = Duration::from_millis(self.polling.interval_ms);

        for attempt in 1..=self.polling.attempts {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        debug!(payment_id = %payment_id, "poller stopping for shutdown");
                        return;
                    }
                }
            }

            let reply = match self.gateway.fetch_status(kind, &external_id).await {
                Ok(reply) => reply,
                Err(err) => {
                    warn!(payment_id = %payment_id, attempt, error = %err, "gateway status poll failed");
                    continue;
                }
            };
            let raw_status = reply.status.unwrap_or_default();

            match terminal_for(map_gateway_status(&raw_status)) {
                Some(terminal) => {
                    let reason = match terminal {
                        PaymentStatus::Failed => Some("gateway reported failure"),
                        _ => None,
                    };
                    self.finalize(payment_id, terminal, Some(&raw_status), reason)
                        .await;
                    return;
                }
                None => {
                    if let Err(err) = self
                        .ledger
                        .set_gateway_txn(payment_id, reply.transaction_id.as_deref(), Some(&raw_status))
                        .await
                    {
                        warn!(payment_id = %payment_id, error = %err, "failed to record gateway status");
                    }
                }
            }
        }

        // No terminal answer before the attempts ran out.
        self.finalize(
            payment_id,
            PaymentStatus::Expired,
            None,
            Some("no terminal gateway status within the polling window"),
        )
        .await;
    }

    async fn finalize(
        &self,
        payment_id: Uuid,
        terminal: PaymentStatus,
        gateway_status: Option<&str>,
        reason: Option<&str>,
    ) {
        match self
            .ledger
            .finalize_intent(payment_id, terminal, gateway_status, reason)
            .await
        {
            Ok(outcome) if outcome.already_terminal => {
                debug!(payment_id = %payment_id, status = outcome.status.as_str(), "intent already terminal");
            }
            Ok(outcome) => {
                info!(payment_id = %payment_id, status = outcome.status.as_str(), "payment intent finalized");
            }
            Err(err) => {
                tracing::error!(payment_id = %payment_id, error = %err, "failed to finalize payment intent");
            }
        }
    }
}

pub struct PaymentsService {
    ledger: Ledger,
    gateway: PaymentGateway,
    limits: PaymentLimits,
    reconciler: Arc<Reconciler>,
}

impl PaymentsService {
    pub fn new(
        ledger: Ledger,
        gateway: PaymentGateway,
        limits: PaymentLimits,
        reconciler: Arc<Reconciler>,
    ) -> Self {
        Self {
            ledger,
            gateway,
            limits,
            reconciler,
        }
    }

    pub async fn deposit(
        &self,
        user_id: Uuid,
        request: PaymentRequest,
    ) -> Result<PaymentAcceptedResponse, ApiError> {
        check_range(
            request.amount,
            self.limits.min_deposit,
            self.limits.max_deposit,
        )?;
        let record = self
            .ledger
            .create_deposit(user_id, request.amount, request.transaction_uuid)
            .await?;

        let status = match self
            .gateway
            .initiate_collection(record.amount, &record.phone, &record.external_id)
            .await
        {
            Ok(reply) => {
                let raw_status = reply.status.clone().unwrap_or_default();
                self.ledger
                    .set_gateway_txn(record.id, reply.transaction_id.as_deref(), Some(&raw_status))
                    .await?;
                match terminal_for(map_gateway_status(&raw_status)) {
                    Some(PaymentStatus::Failed) => {
                        self.ledger
                            .finalize_intent(
                                record.id,
                                PaymentStatus::Failed,
                                Some(&raw_status),
                                Some("gateway rejected the collection"),
                            )
                            .await?;
                        return Err(ApiError::Downstream(
                            "gateway rejected the deposit".to_string(),
                        ));
                    }
                    Some(terminal) => {
                        self.ledger
                            .finalize_intent(record.id, terminal, Some(&raw_status), None)
                            .await?;
                        terminal
                    }
                    None => {
                        self.reconciler
                            .watch_intent(record.id, record.kind, record.external_id.clone())
                            .await;
                        PaymentStatus::Pending
                    }
                }
            }
            Err(err) => {
                // The collection request itself failed; keep the intent
                // pending and let the poller chase it.
                warn!(payment_id = %record.id, error = %err, "collection request failed; polling");
                self.reconciler
                    .watch_intent(record.id, record.kind, record.external_id.clone())
                    .await;
                PaymentStatus::Pending
            }
        };

        Ok(PaymentAcceptedResponse {
            payment_id: record.id,
            transaction_id: record.external_id,
            amount: record.amount,
            status,
            new_balance: None,
        })
    }

    pub async fn withdraw(
        &self,
        user_id: Uuid,
        request: PaymentRequest,
    ) -> Result<PaymentAcceptedResponse, ApiError> {
        check_range(
            request.amount,
            self.limits.min_withdraw,
            self.limits.max_withdraw,
        )?;
        let (record, new_balance) = self
            .ledger
            .create_withdraw(user_id, request.amount, request.transaction_uuid)
            .await?;

        let (status, balance) = match self
            .gateway
            .initiate_disbursement(record.amount, &record.phone, &record.external_id)
            .await
        {
            Ok(reply) => {
                let raw_status = reply.status.clone().unwrap_or_default();
                self.ledger
                    .set_gateway_txn(record.id, reply.transaction_id.as_deref(), Some(&raw_status))
                    .await?;
                match terminal_for(map_gateway_status(&raw_status)) {
                    Some(PaymentStatus::Failed) => {
                        // Synchronous rejection: the terminal transition
                        // restores the debit in the same transaction.
                        self.ledger
                            .finalize_intent(
                                record.id,
                                PaymentStatus::Failed,
                                Some(&raw_status),
                                Some("gateway rejected the disbursement"),
                            )
                            .await?;
                        return Err(ApiError::Downstream(
                            "gateway rejected the withdrawal".to_string(),
                        ));
                    }
                    Some(terminal) => {
                        self.ledger
                            .finalize_intent(record.id, terminal, Some(&raw_status), None)
                            .await?;
                        (terminal, new_balance)
                    }
                    None => {
                        self.reconciler
                            .watch_intent(record.id, record.kind, record.external_id.clone())
                            .await;
                        (PaymentStatus::Processing, new_balance)
                    }
                }
            }
            Err(err) => {
                warn!(payment_id = %record.id, error = %err, "disbursement request failed; polling");
                self.reconciler
                    .watch_intent(record.id, record.kind, record.external_id.clone())
                    .await;
                (PaymentStatus::Processing, new_balance)
            }
        };

        Ok(PaymentAcceptedResponse {
            payment_id: record.id,
            transaction_id: record.external_id,
            amount: record.amount,
            status,
            new_balance: Some(balance),
        })
    }

    pub async fn status(
        &self,
        user_id: Uuid,
        transaction_id: &str,
    ) -> Result<PaymentStatusResponse, ApiError> {
        let record = self
            .ledger
            .payment_by_external(user_id, transaction_id)
            .await?;
        Ok(PaymentStatusResponse {
            status: record.status,
            details: record,
        })
    }

    pub async fn history(
        &self,
        user_id: Uuid,
        limit: i64,
        offset: i64,
    ) -> Result<PaymentHistoryResponse, ApiError> {
        let (transactions, count) = self.ledger.payment_history(user_id, limit, offset).await?;
        Ok(PaymentHistoryResponse {
            transactions,
            count,
            limit,
            offset,
        })
    }
}

fn check_range(amount: Amount, min: Amount, max: Amount) -> Result<(), ApiError> {
    if !amount.is_positive() || amount < min || amount > max {
        return Err(ApiError::validation(format!(
            "amount must be between {min} and {max}"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dispositions_map_to_terminal_transitions() {
        assert_eq!(
            terminal_for(GatewayDisposition::Success),
            Some(PaymentStatus::Confirmed)
        );
        assert_eq!(
            terminal_for(GatewayDisposition::Failure),
            Some(PaymentStatus::Failed)
        );
        assert_eq!(terminal_for(GatewayDisposition::Pending), None);
    }

    #[test]
    fn range_check_bounds() {
        let min: Amount = "10.00".parse().unwrap();
        let max: Amount = "100.00".parse().unwrap();
        assert!(check_range("10.00".parse().unwrap(), min, max).is_ok());
        assert!(check_range("100.00".parse().unwrap(), min, max).is_ok());
        assert!(check_range("9.99".parse().unwrap(), min, max).is_err());
        assert!(check_range("100.01".parse().unwrap(), min, max).is_err());
        assert!(check_range(Amount::ZERO, min, max).is_err());
    }
}
