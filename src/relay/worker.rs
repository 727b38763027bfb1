use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::retry::RetryConfig;
use super::PaymentInstruction;
use crate::accounts::BridgeAccounts;
use crate::error::{AppError, AppResult};
use crate::federation::Federation;
use crate::gateway::{IssuedAsset, LedgerGateway, PaymentOrder};
use crate::locks::KeyedLocks;
use crate::store::models::BridgeAccount;
use crate::store::PaymentOutboxStore;

/// What one dispatch attempt did with an outbox entry
#[derive(Debug, Clone, PartialEq)]
pub enum DispatchOutcome {
    /// Missing, already processed or out of retries; nothing was submitted
    Skipped,
    Submitted { tx_hash: String },
    RetryAfter(Duration),
    /// The last retry failed; the entry stays unprocessed for an operator
    Exhausted,
    /// The entry can never succeed (tenant deleted, unreadable payload)
    Abandoned,
}

/// Drains outbox signals and submits payments to the ledger, one in-flight
/// submission per source account.
pub struct PaymentRelayWorker {
    store: Arc<dyn PaymentOutboxStore>,
    gateway: Arc<dyn LedgerGateway>,
    accounts: Arc<BridgeAccounts>,
    federation: Arc<Federation>,
    retry: RetryConfig,
    source_locks: KeyedLocks,
    in_flight: Mutex<HashSet<i64>>,
}

impl PaymentRelayWorker {
    pub fn new(
        store: Arc<dyn PaymentOutboxStore>,
        gateway: Arc<dyn LedgerGateway>,
        accounts: Arc<BridgeAccounts>,
        federation: Arc<Federation>,
        retry: RetryConfig,
    ) -> Self {
        Self {
            store,
            gateway,
            accounts,
            federation,
            retry,
            source_locks: KeyedLocks::new(),
            in_flight: Mutex::new(HashSet::new()),
        }
    }

    /// Start consuming entry ids (runs in background)
    pub fn start(self: Arc<Self>, mut signals: mpsc::UnboundedReceiver<i64>) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!("🔄 Payment relay worker started");
            while let Some(entry_id) = signals.recv().await {
                // a signal for an entry already being worked on is redundant
                if !self.in_flight.lock().insert(entry_id) {
                    debug!("Entry {} already in flight", entry_id);
                    continue;
                }
                let worker = self.clone();
                tokio::spawn(async move {
                    worker.run_to_completion(entry_id).await;
                    worker.in_flight.lock().remove(&entry_id);
                });
            }
            info!("Payment relay worker stopped");
        })
    }

    /// Dispatches an entry until it succeeds, exhausts its budget or is abandoned
    async fn run_to_completion(&self, entry_id: i64) {
        loop {
            match self.dispatch(entry_id).await {
                Ok(DispatchOutcome::RetryAfter(delay)) => tokio::time::sleep(delay).await,
                Ok(_) => return,
                Err(e) => {
                    // store unavailable; the sweep picks the entry up again
                    error!("❌ Dispatch of entry {} aborted: {}", entry_id, e);
                    return;
                }
            }
        }
    }

    /// One attempt at an entry. Entries that are processed or out of retries
    /// are never submitted again.
    pub async fn dispatch(&self, entry_id: i64) -> AppResult<DispatchOutcome> {
        let Some(entry) = self.store.get_entry(entry_id).await? else {
            warn!("Outbox entry {} does not exist", entry_id);
            return Ok(DispatchOutcome::Skipped);
        };
        if !entry.is_pending() {
            return Ok(DispatchOutcome::Skipped);
        }

        let instruction: PaymentInstruction = match serde_json::from_str(&entry.payload) {
            Ok(instruction) => instruction,
            Err(e) => {
                error!("❌ Entry {} has an unreadable payload, abandoning: {}", entry_id, e);
                self.store.abandon(entry_id).await?;
                return Ok(DispatchOutcome::Abandoned);
            }
        };

        let Some(bridge) = self.accounts.find(&instruction.source_tenant).await? else {
            warn!(
                "Tenant {} no longer exists, abandoning entry {}",
                instruction.source_tenant, entry_id
            );
            self.store.abandon(entry_id).await?;
            return Ok(DispatchOutcome::Abandoned);
        };

        let order = match self.build_order(&bridge, &instruction).await {
            Ok(order) => order,
            Err(AppError::Database(e)) => return Err(AppError::Database(e)),
            Err(e) => return self.record_failure(entry_id, &e).await,
        };

        let _guard = self.source_locks.lock(&bridge.ledger_account_id).await;

        // the entry may have been finished while we waited for the source account
        match self.store.get_entry(entry_id).await? {
            Some(entry) if entry.is_pending() => {}
            _ => return Ok(DispatchOutcome::Skipped),
        }

        match self.gateway.submit_payment(&order).await {
            Ok(tx_hash) => {
                self.store.mark_processed(entry_id).await?;
                info!(
                    "✓ Payment {} submitted: {} {} to {} (tx {})",
                    entry_id, order.amount, order.asset.code, order.destination, tx_hash
                );
                Ok(DispatchOutcome::Submitted { tx_hash })
            }
            Err(e) => self.record_failure(entry_id, &e).await,
        }
    }

    async fn build_order(
        &self,
        bridge: &BridgeAccount,
        instruction: &PaymentInstruction,
    ) -> AppResult<PaymentOrder> {
        let destination = self
            .federation
            .resolve_destination(&instruction.destination_address)
            .await?;

        let issuer = match &instruction.issuer_address {
            Some(address) => self.federation.local().resolve_top_level(address).await?,
            None => bridge.vault_account().unwrap_or_else(|| bridge.main_account()),
        };

        Ok(PaymentOrder {
            signer: bridge.ledger_private_key.clone(),
            destination,
            asset: IssuedAsset::new(instruction.asset_code.clone(), issuer.public_key),
            amount: instruction.amount,
        })
    }

    async fn record_failure(&self, entry_id: i64, cause: &AppError) -> AppResult<DispatchOutcome> {
        match self.store.record_failure(entry_id).await? {
            Some(remaining) if remaining > 0 => {
                let delay = self
                    .retry
                    .delay_after_failures(self.retry.failures_for(remaining));
                warn!(
                    "⚠️  Payment {} failed ({}), {} retries left, next attempt in {:?}",
                    entry_id, cause, remaining, delay
                );
                Ok(DispatchOutcome::RetryAfter(delay))
            }
            Some(_) => {
                error!(
                    "❌ Payment {} failed permanently after exhausting its retries: {}. Operator attention required",
                    entry_id, cause
                );
                Ok(DispatchOutcome::Exhausted)
            }
            None => Ok(DispatchOutcome::Skipped),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::federation::address::{FederationAddress, LedgerAccountId};
    use crate::federation::{FederationResolver, RemoteFederationClient};
    use crate::gateway::mock::{GatewayCall, RecordingGateway};
    use crate::gateway::SecretKey;
    use crate::store::MemoryStore;
    use chrono::Utc;
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;

    struct Harness {
        store: Arc<MemoryStore>,
        gateway: RecordingGateway,
        accounts: Arc<BridgeAccounts>,
        worker: Arc<PaymentRelayWorker>,
    }

    async fn harness() -> Harness {
        let store = Arc::new(MemoryStore::new());
        let gateway = RecordingGateway::new();
        let accounts = Arc::new(BridgeAccounts::new(store.clone()));

        for tenant in ["alice", "bob"] {
            let account_id = format!("G{}", tenant.to_uppercase());
            let secret = gateway.register_account(&account_id);
            accounts
                .create(&BridgeAccount {
                    tenant_id: tenant.to_string(),
                    api_key: "key".to_string(),
                    access_token: "token".to_string(),
                    ledger_account_id: account_id,
                    ledger_private_key: secret,
                    vault: None,
                    created_on: Utc::now(),
                })
                .await
                .unwrap();
        }

        // bob accepts USD issued by alice's main account
        gateway
            .set_trust_line_size(
                &SecretKey::new("SGBOB"),
                &LedgerAccountId::main_account("GALICE"),
                "USD",
                dec!(1000),
            )
            .await
            .unwrap();
        gateway.clear_calls();

        let resolver = Arc::new(FederationResolver::new("test.org", accounts.clone()));
        let federation = Arc::new(Federation::new(resolver, RemoteFederationClient::new()));
        let retry = RetryConfig {
            initial_delay_ms: 1,
            max_delay_ms: 5,
            ..Default::default()
        };

        let worker = Arc::new(PaymentRelayWorker::new(
            store.clone(),
            Arc::new(gateway.clone()),
            accounts.clone(),
            federation,
            retry,
        ));

        Harness {
            store,
            gateway,
            accounts,
            worker,
        }
    }

    async fn queue(store: &MemoryStore, destination: &str, amount: Decimal) -> i64 {
        let instruction = PaymentInstruction {
            asset_code: "USD".to_string(),
            amount,
            source_tenant: "alice".to_string(),
            destination_address: FederationAddress::parse(destination).unwrap(),
            issuer_address: None,
        };
        store
            .insert_entry(&serde_json::to_string(&instruction).unwrap(), 3)
            .await
            .unwrap()
            .id
    }

    #[tokio::test]
    async fn test_successful_dispatch_marks_processed() {
        let h = harness().await;
        let id = queue(&h.store, "bob:17*test.org", dec!(25)).await;

        let outcome = h.worker.dispatch(id).await.unwrap();
        assert!(matches!(outcome, DispatchOutcome::Submitted { .. }));

        assert!(h.store.get_entry(id).await.unwrap().unwrap().processed);
        assert_eq!(h.gateway.held("GBOB", "USD", "GALICE"), dec!(25));
        assert_eq!(
            h.gateway.payments(),
            vec![GatewayCall::Payment {
                source: "GALICE".to_string(),
                destination: LedgerAccountId::sub_account("GBOB", "17"),
                asset: IssuedAsset::new("USD", "GALICE"),
                amount: dec!(25),
            }]
        );
    }

    #[tokio::test]
    async fn test_processed_entry_is_never_resubmitted() {
        let h = harness().await;
        let id = queue(&h.store, "bob*test.org", dec!(5)).await;

        h.worker.dispatch(id).await.unwrap();
        assert_eq!(h.gateway.payments().len(), 1);

        let again = h.worker.dispatch(id).await.unwrap();
        assert_eq!(again, DispatchOutcome::Skipped);
        assert_eq!(h.gateway.payments().len(), 1);
    }

    #[tokio::test]
    async fn test_retry_exhaustion_stops_after_budget() {
        let h = harness().await;
        let id = queue(&h.store, "bob*test.org", dec!(5)).await;
        h.gateway.fail_next_payments(usize::MAX);

        assert!(matches!(
            h.worker.dispatch(id).await.unwrap(),
            DispatchOutcome::RetryAfter(_)
        ));
        assert!(matches!(
            h.worker.dispatch(id).await.unwrap(),
            DispatchOutcome::RetryAfter(_)
        ));
        assert_eq!(h.worker.dispatch(id).await.unwrap(), DispatchOutcome::Exhausted);

        // no fourth attempt reaches the ledger
        h.gateway.fail_next_payments(0);
        assert_eq!(h.worker.dispatch(id).await.unwrap(), DispatchOutcome::Skipped);
        assert!(h.gateway.payments().is_empty());

        let entry = h.store.get_entry(id).await.unwrap().unwrap();
        assert!(!entry.processed);
        assert_eq!(entry.retries_remaining, 0);
        assert_eq!(h.store.failed_entries().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_unresolvable_destination_consumes_retries() {
        let h = harness().await;
        let id = queue(&h.store, "carol*test.org", dec!(5)).await;

        assert!(matches!(
            h.worker.dispatch(id).await.unwrap(),
            DispatchOutcome::RetryAfter(_)
        ));
        assert_eq!(
            h.store.get_entry(id).await.unwrap().unwrap().retries_remaining,
            2
        );
    }

    #[tokio::test]
    async fn test_deleted_tenant_abandons_entry() {
        let h = harness().await;
        let id = queue(&h.store, "bob*test.org", dec!(5)).await;
        h.accounts.delete("alice").await.unwrap();

        assert_eq!(h.worker.dispatch(id).await.unwrap(), DispatchOutcome::Abandoned);
        assert!(h.gateway.payments().is_empty());
        assert_eq!(h.store.failed_entries().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_worker_retries_until_success() {
        let h = harness().await;
        let (tx, rx) = mpsc::unbounded_channel();
        h.worker.clone().start(rx);

        h.gateway.fail_next_payments(2);
        let id = queue(&h.store, "bob*test.org", dec!(8)).await;
        tx.send(id).unwrap();
        // duplicate signals do not produce duplicate submissions
        tx.send(id).unwrap();

        for _ in 0..200 {
            if h.store.get_entry(id).await.unwrap().unwrap().processed {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        let entry = h.store.get_entry(id).await.unwrap().unwrap();
        assert!(entry.processed);
        assert_eq!(entry.retries_remaining, 1);
        assert_eq!(h.gateway.payments().len(), 1);
    }
}
