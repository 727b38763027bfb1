pub mod memory;
pub mod models;
pub mod postgres;

use async_trait::async_trait;

use crate::error::AppResult;
use models::{
    BridgeAccount, InboundPaymentEvent, LedgerCursor, NewInboundPayment, PaymentRelayEntry,
    VaultAccount,
};

pub use memory::MemoryStore;
pub use postgres::PostgresStore;

/// Tenant <-> ledger account rows. Callers go through `accounts::BridgeAccounts`,
/// which adds per-tenant serialization on top.
#[async_trait]
pub trait BridgeAccountStore: Send + Sync {
    /// Returns false when a row for the tenant already exists
    async fn insert_bridge(&self, account: &BridgeAccount) -> AppResult<bool>;

    async fn find_bridge(&self, tenant_id: &str) -> AppResult<Option<BridgeAccount>>;

    async fn list_bridges(&self) -> AppResult<Vec<BridgeAccount>>;

    /// Sets both vault fields at once. Returns false when the tenant is unknown
    /// or already has a vault.
    async fn attach_vault(&self, tenant_id: &str, vault: &VaultAccount) -> AppResult<bool>;

    async fn delete_bridge(&self, tenant_id: &str) -> AppResult<bool>;
}

/// Durable queue of outbound payment instructions
#[async_trait]
pub trait PaymentOutboxStore: Send + Sync {
    async fn insert_entry(&self, payload: &str, retries: i32) -> AppResult<PaymentRelayEntry>;

    async fn get_entry(&self, id: i64) -> AppResult<Option<PaymentRelayEntry>>;

    /// Returns false when the entry was already processed
    async fn mark_processed(&self, id: i64) -> AppResult<bool>;

    /// Decrements the retry budget of an unprocessed entry and returns what is
    /// left, or `None` when the entry is processed or already exhausted
    async fn record_failure(&self, id: i64) -> AppResult<Option<i32>>;

    /// Zeroes the retry budget so the entry is never attempted again
    async fn abandon(&self, id: i64) -> AppResult<bool>;

    /// processed = false and retries_remaining > 0, oldest first
    async fn pending_entries(&self) -> AppResult<Vec<PaymentRelayEntry>>;

    /// processed = false and retries_remaining = 0
    async fn failed_entries(&self) -> AppResult<Vec<PaymentRelayEntry>>;
}

#[async_trait]
pub trait LedgerCursorStore: Send + Sync {
    /// Highest-id cursor with processed = true
    async fn latest_processed_cursor(&self) -> AppResult<Option<LedgerCursor>>;

    /// Records a feed position that carried no event for core banking
    async fn advance_cursor(&self, cursor: &str) -> AppResult<LedgerCursor>;

    /// Writes the inbound event and marks its cursor processed in one atomic
    /// step. Returns `None` when the event was already recorded; the cursor is
    /// still advanced in that case.
    async fn record_inbound_payment(
        &self,
        payment: &NewInboundPayment,
        retries: i32,
    ) -> AppResult<Option<InboundPaymentEvent>>;
}

/// Inbound events awaiting delivery to core banking
#[async_trait]
pub trait InboundEventStore: Send + Sync {
    async fn get_event(&self, id: i64) -> AppResult<Option<InboundPaymentEvent>>;

    async fn mark_delivered(&self, id: i64) -> AppResult<bool>;

    async fn record_delivery_failure(&self, id: i64) -> AppResult<Option<i32>>;

    async fn pending_events(&self) -> AppResult<Vec<InboundPaymentEvent>>;
}
