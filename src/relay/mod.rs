//! Outbound payment relay: core banking -> ledger.
//!
//! `PaymentOutbox::enqueue` is the only write path for outbound payments. It
//! persists first and then wakes the `PaymentRelayWorker` over a channel; the
//! `RecoverySweeper` re-signals anything persisted but never dispatched.

pub mod retry;
pub mod sweeper;
pub mod worker;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, instrument};

use crate::error::{AppError, AppResult};
use crate::federation::address::FederationAddress;
use crate::store::models::PaymentRelayEntry;
use crate::store::PaymentOutboxStore;

pub use retry::RetryConfig;
pub use sweeper::RecoverySweeper;
pub use worker::{DispatchOutcome, PaymentRelayWorker};

/// A payment requested by core banking, stored as the outbox payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaymentInstruction {
    pub asset_code: String,
    pub amount: Decimal,
    pub source_tenant: String,
    pub destination_address: FederationAddress,
    /// Issuer of the asset; defaults to the source tenant's vault, or its main
    /// account when no vault exists
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub issuer_address: Option<FederationAddress>,
}

impl PaymentInstruction {
    pub fn validate(&self) -> AppResult<()> {
        if self.amount <= Decimal::ZERO {
            return Err(AppError::InvalidInput(format!(
                "Payment amount must be positive, got {}",
                self.amount
            )));
        }
        if self.asset_code.is_empty()
            || self.asset_code.len() > 12
            || !self.asset_code.chars().all(|c| c.is_ascii_alphanumeric())
        {
            return Err(AppError::InvalidInput(format!(
                "Invalid asset code {}",
                self.asset_code
            )));
        }
        Ok(())
    }
}

pub type RelaySignal = mpsc::UnboundedSender<i64>;

pub struct PaymentOutbox {
    store: Arc<dyn PaymentOutboxStore>,
    retry_budget: i32,
    signal: RelaySignal,
}

impl PaymentOutbox {
    pub fn new(store: Arc<dyn PaymentOutboxStore>, retry_budget: i32, signal: RelaySignal) -> Self {
        Self {
            store,
            retry_budget,
            signal,
        }
    }

    #[instrument(skip(self, instruction), fields(tenant = %instruction.source_tenant))]
    pub async fn enqueue(&self, instruction: &PaymentInstruction) -> AppResult<i64> {
        instruction.validate()?;
        let payload = serde_json::to_string(instruction)?;

        // write, then signal: a lost signal is recovered by the sweep
        let entry = self.store.insert_entry(&payload, self.retry_budget).await?;
        info!(
            "📤 Payment {} queued: {} {} to {}",
            entry.id, instruction.amount, instruction.asset_code, instruction.destination_address
        );

        self.notify(entry.id);
        Ok(entry.id)
    }

    /// Wakes the worker for an entry; a closed channel is left to the sweep
    pub fn notify(&self, entry_id: i64) {
        if self.signal.send(entry_id).is_err() {
            debug!("Relay worker not listening, entry {} waits for the sweep", entry_id);
        }
    }

    pub async fn pending_entries(&self) -> AppResult<Vec<PaymentRelayEntry>> {
        self.store.pending_entries().await
    }

    pub async fn failed_entries(&self) -> AppResult<Vec<PaymentRelayEntry>> {
        self.store.failed_entries().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use rust_decimal_macros::dec;

    fn instruction(amount: Decimal) -> PaymentInstruction {
        PaymentInstruction {
            asset_code: "USD".to_string(),
            amount,
            source_tenant: "alice".to_string(),
            destination_address: FederationAddress::parse("bob*test.org").unwrap(),
            issuer_address: None,
        }
    }

    #[tokio::test]
    async fn test_enqueue_persists_before_signalling() {
        let store = Arc::new(MemoryStore::new());
        let (tx, mut rx) = mpsc::unbounded_channel();
        let outbox = PaymentOutbox::new(store.clone(), 3, tx);

        let id = outbox.enqueue(&instruction(dec!(10))).await.unwrap();

        assert_eq!(rx.recv().await, Some(id));
        let entry = store.get_entry(id).await.unwrap().unwrap();
        assert!(!entry.processed);
        assert_eq!(entry.retries_remaining, 3);

        let stored: PaymentInstruction = serde_json::from_str(&entry.payload).unwrap();
        assert_eq!(stored, instruction(dec!(10)));
    }

    #[tokio::test]
    async fn test_enqueue_survives_missing_worker() {
        let store = Arc::new(MemoryStore::new());
        let (tx, rx) = mpsc::unbounded_channel();
        drop(rx);
        let outbox = PaymentOutbox::new(store, 3, tx);

        let id = outbox.enqueue(&instruction(dec!(10))).await.unwrap();
        let pending = outbox.pending_entries().await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, id);
    }

    #[tokio::test]
    async fn test_rejects_invalid_instructions() {
        let store = Arc::new(MemoryStore::new());
        let (tx, _rx) = mpsc::unbounded_channel();
        let outbox = PaymentOutbox::new(store.clone(), 3, tx);

        assert!(outbox.enqueue(&instruction(dec!(0))).await.is_err());

        let mut bad_code = instruction(dec!(5));
        bad_code.asset_code = "US D".to_string();
        assert!(outbox.enqueue(&bad_code).await.is_err());

        assert!(store.pending_entries().await.unwrap().is_empty());
    }
}
