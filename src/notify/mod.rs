//! Inbound payment delivery: ledger -> core banking. Mirrors the outbound
//! relay: the ingestor writes an event row, signals the delivery worker, and
//! the recovery sweep re-signals whatever is still pending.

use async_trait::async_trait;
use parking_lot::Mutex;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::accounts::BridgeAccounts;
use crate::error::{AppError, AppResult, LedgerError};
use crate::relay::retry::RetryConfig;
use crate::relay::sweeper::SweepTarget;
use crate::store::models::{BridgeAccount, InboundPaymentEvent};
use crate::store::InboundEventStore;

/// What core banking is told about a payment received on the ledger
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InboundPaymentNotification {
    pub cursor_id: i64,
    pub tenant_id: String,
    pub asset_code: String,
    pub amount: Decimal,
}

impl From<&InboundPaymentEvent> for InboundPaymentNotification {
    fn from(event: &InboundPaymentEvent) -> Self {
        Self {
            cursor_id: event.cursor_id,
            tenant_id: event.tenant_id.clone(),
            asset_code: event.asset_code.clone(),
            amount: event.amount,
        }
    }
}

#[async_trait]
pub trait CoreBankingNotifier: Send + Sync {
    async fn notify(
        &self,
        bridge: &BridgeAccount,
        notification: &InboundPaymentNotification,
    ) -> AppResult<()>;
}

/// Posts notifications to the core banking platform on behalf of the tenant
pub struct HttpCoreBankingNotifier {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpCoreBankingNotifier {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(15))
                .build()
                .unwrap_or_default(),
            endpoint: endpoint.into(),
        }
    }
}

#[async_trait]
impl CoreBankingNotifier for HttpCoreBankingNotifier {
    async fn notify(
        &self,
        bridge: &BridgeAccount,
        notification: &InboundPaymentNotification,
    ) -> AppResult<()> {
        let response = self
            .client
            .post(&self.endpoint)
            .header("X-Mifos-Platform-TenantId", &bridge.tenant_id)
            .header("Authorization", format!("Basic {}", bridge.access_token))
            .json(notification)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(LedgerError::failed(
                "core_banking_notify",
                format!("core banking answered {}: {}", status, body),
            )
            .into());
        }
        Ok(())
    }
}

/// Used when no core banking endpoint is configured
pub struct LoggingNotifier;

#[async_trait]
impl CoreBankingNotifier for LoggingNotifier {
    async fn notify(
        &self,
        _bridge: &BridgeAccount,
        notification: &InboundPaymentNotification,
    ) -> AppResult<()> {
        info!(
            "📥 Inbound payment for {}: {} {} (cursor {})",
            notification.tenant_id, notification.amount, notification.asset_code, notification.cursor_id
        );
        Ok(())
    }
}

// ========== DELIVERY QUEUE ==========

pub struct InboundDelivery {
    store: Arc<dyn InboundEventStore>,
    signal: mpsc::UnboundedSender<i64>,
}

impl InboundDelivery {
    pub fn new(store: Arc<dyn InboundEventStore>, signal: mpsc::UnboundedSender<i64>) -> Self {
        Self { store, signal }
    }

    pub fn notify(&self, event_id: i64) {
        if self.signal.send(event_id).is_err() {
            debug!("Delivery worker not listening, event {} waits for the sweep", event_id);
        }
    }
}

#[async_trait]
impl SweepTarget for InboundDelivery {
    fn name(&self) -> &'static str {
        "inbound payment"
    }

    async fn resignal_pending(&self) -> AppResult<usize> {
        let pending = self.store.pending_events().await?;
        for event in &pending {
            self.notify(event.id);
        }
        Ok(pending.len())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum DeliveryOutcome {
    Skipped,
    Delivered,
    RetryAfter(Duration),
    Exhausted,
}

pub struct InboundDeliveryWorker {
    store: Arc<dyn InboundEventStore>,
    accounts: Arc<BridgeAccounts>,
    notifier: Arc<dyn CoreBankingNotifier>,
    retry: RetryConfig,
    in_flight: Mutex<HashSet<i64>>,
}

impl InboundDeliveryWorker {
    pub fn new(
        store: Arc<dyn InboundEventStore>,
        accounts: Arc<BridgeAccounts>,
        notifier: Arc<dyn CoreBankingNotifier>,
        retry: RetryConfig,
    ) -> Self {
        Self {
            store,
            accounts,
            notifier,
            retry,
            in_flight: Mutex::new(HashSet::new()),
        }
    }

    pub fn start(self: Arc<Self>, mut signals: mpsc::UnboundedReceiver<i64>) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!("🔄 Inbound delivery worker started");
            while let Some(event_id) = signals.recv().await {
                if !self.in_flight.lock().insert(event_id) {
                    continue;
                }
                let worker = self.clone();
                tokio::spawn(async move {
                    loop {
                        match worker.deliver(event_id).await {
                            Ok(DeliveryOutcome::RetryAfter(delay)) => {
                                tokio::time::sleep(delay).await
                            }
                            Ok(_) => break,
                            Err(e) => {
                                error!("❌ Delivery of event {} aborted: {}", event_id, e);
                                break;
                            }
                        }
                    }
                    worker.in_flight.lock().remove(&event_id);
                });
            }
        })
    }

    pub async fn deliver(&self, event_id: i64) -> AppResult<DeliveryOutcome> {
        let Some(event) = self.store.get_event(event_id).await? else {
            return Ok(DeliveryOutcome::Skipped);
        };
        if !event.is_pending() {
            return Ok(DeliveryOutcome::Skipped);
        }

        let result = match self.accounts.find(&event.tenant_id).await? {
            Some(bridge) => {
                self.notifier
                    .notify(&bridge, &InboundPaymentNotification::from(&event))
                    .await
            }
            None => Err(AppError::Internal(format!(
                "tenant {} no longer has a bridge",
                event.tenant_id
            ))),
        };

        match result {
            Ok(()) => {
                self.store.mark_delivered(event_id).await?;
                info!(
                    "✓ Inbound payment {} delivered to {}",
                    event_id, event.tenant_id
                );
                Ok(DeliveryOutcome::Delivered)
            }
            Err(e) => match self.store.record_delivery_failure(event_id).await? {
                Some(remaining) if remaining > 0 => {
                    let delay = self
                        .retry
                        .delay_after_failures(self.retry.failures_for(remaining));
                    warn!(
                        "⚠️  Delivery of inbound payment {} failed ({}), retrying in {:?}",
                        event_id, e, delay
                    );
                    Ok(DeliveryOutcome::RetryAfter(delay))
                }
                Some(_) => {
                    error!(
                        "❌ Inbound payment {} for {} could not be delivered: {}. Operator attention required",
                        event_id, event.tenant_id, e
                    );
                    Ok(DeliveryOutcome::Exhausted)
                }
                None => Ok(DeliveryOutcome::Skipped),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::SecretKey;
    use crate::store::models::NewInboundPayment;
    use crate::store::{LedgerCursorStore, MemoryStore};
    use chrono::Utc;
    use rust_decimal_macros::dec;

    /// Fails a fixed number of times, then records what it was sent
    #[derive(Default)]
    struct FlakyNotifier {
        failures_left: Mutex<usize>,
        delivered: Mutex<Vec<InboundPaymentNotification>>,
    }

    #[async_trait]
    impl CoreBankingNotifier for FlakyNotifier {
        async fn notify(
            &self,
            _bridge: &BridgeAccount,
            notification: &InboundPaymentNotification,
        ) -> AppResult<()> {
            let mut failures = self.failures_left.lock();
            if *failures > 0 {
                *failures -= 1;
                return Err(LedgerError::failed("core_banking_notify", "unavailable").into());
            }
            self.delivered.lock().push(notification.clone());
            Ok(())
        }
    }

    async fn setup(failures: usize) -> (Arc<MemoryStore>, Arc<FlakyNotifier>, InboundDeliveryWorker, i64) {
        let store = Arc::new(MemoryStore::new());
        let accounts = Arc::new(BridgeAccounts::new(store.clone()));
        accounts
            .create(&BridgeAccount {
                tenant_id: "alice".to_string(),
                api_key: "key".to_string(),
                access_token: "token".to_string(),
                ledger_account_id: "GALICE".to_string(),
                ledger_private_key: SecretKey::new("SGALICE"),
                vault: None,
                created_on: Utc::now(),
            })
            .await
            .unwrap();

        let event = store
            .record_inbound_payment(
                &NewInboundPayment {
                    tenant_id: "alice".to_string(),
                    paging_token: "42".to_string(),
                    asset_code: "USD".to_string(),
                    asset_issuer: "GISSUER".to_string(),
                    amount: dec!(7.5),
                },
                3,
            )
            .await
            .unwrap()
            .unwrap();

        let notifier = Arc::new(FlakyNotifier {
            failures_left: Mutex::new(failures),
            ..Default::default()
        });
        let retry = RetryConfig {
            initial_delay_ms: 1,
            max_delay_ms: 2,
            ..Default::default()
        };
        let worker = InboundDeliveryWorker::new(store.clone(), accounts, notifier.clone(), retry);
        (store, notifier, worker, event.id)
    }

    #[tokio::test]
    async fn test_delivers_notification_once() {
        let (store, notifier, worker, id) = setup(0).await;

        assert_eq!(worker.deliver(id).await.unwrap(), DeliveryOutcome::Delivered);
        assert_eq!(worker.deliver(id).await.unwrap(), DeliveryOutcome::Skipped);

        let delivered = notifier.delivered.lock().clone();
        assert_eq!(delivered.len(), 1);
        assert_eq!(delivered[0].tenant_id, "alice");
        assert_eq!(delivered[0].amount, dec!(7.5));
        assert!(store.pending_events().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_delivery_retries_are_bounded() {
        let (store, notifier, worker, id) = setup(usize::MAX).await;

        assert!(matches!(worker.deliver(id).await.unwrap(), DeliveryOutcome::RetryAfter(_)));
        assert!(matches!(worker.deliver(id).await.unwrap(), DeliveryOutcome::RetryAfter(_)));
        assert_eq!(worker.deliver(id).await.unwrap(), DeliveryOutcome::Exhausted);
        assert_eq!(worker.deliver(id).await.unwrap(), DeliveryOutcome::Skipped);

        assert!(notifier.delivered.lock().is_empty());
        let event = store.get_event(id).await.unwrap().unwrap();
        assert!(!event.processed);
        assert_eq!(event.retries_remaining, 0);
    }
}
