use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use tokio::sync::RwLock;

use super::models::*;
use super::{BridgeAccountStore, InboundEventStore, LedgerCursorStore, PaymentOutboxStore};
use crate::error::AppResult;

/// Process-local store with the same semantics as `PostgresStore`. Used by the
/// tests and when no database is configured; nothing survives a restart.
#[derive(Default)]
pub struct MemoryStore {
    bridges: RwLock<HashMap<String, BridgeAccount>>,
    relay_entries: RwLock<Vec<PaymentRelayEntry>>,
    ingestion: RwLock<IngestionTables>,
}

#[derive(Default)]
struct IngestionTables {
    cursors: Vec<LedgerCursor>,
    events: Vec<InboundPaymentEvent>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

// ========== BRIDGE ACCOUNTS ==========

#[async_trait]
impl BridgeAccountStore for MemoryStore {
    async fn insert_bridge(&self, account: &BridgeAccount) -> AppResult<bool> {
        let mut bridges = self.bridges.write().await;
        if bridges.contains_key(&account.tenant_id) {
            return Ok(false);
        }
        bridges.insert(account.tenant_id.clone(), account.clone());
        Ok(true)
    }

    async fn find_bridge(&self, tenant_id: &str) -> AppResult<Option<BridgeAccount>> {
        let bridges = self.bridges.read().await;
        Ok(bridges.get(tenant_id).cloned())
    }

    async fn list_bridges(&self) -> AppResult<Vec<BridgeAccount>> {
        let bridges = self.bridges.read().await;
        let mut all: Vec<BridgeAccount> = bridges.values().cloned().collect();
        all.sort_by_key(|bridge| bridge.created_on);
        Ok(all)
    }

    async fn attach_vault(&self, tenant_id: &str, vault: &VaultAccount) -> AppResult<bool> {
        let mut bridges = self.bridges.write().await;
        match bridges.get_mut(tenant_id) {
            Some(bridge) if bridge.vault.is_none() => {
                bridge.vault = Some(vault.clone());
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn delete_bridge(&self, tenant_id: &str) -> AppResult<bool> {
        let mut bridges = self.bridges.write().await;
        Ok(bridges.remove(tenant_id).is_some())
    }
}

// ========== OUTBOX ==========

#[async_trait]
impl PaymentOutboxStore for MemoryStore {
    async fn insert_entry(&self, payload: &str, retries: i32) -> AppResult<PaymentRelayEntry> {
        let mut entries = self.relay_entries.write().await;
        let now = Utc::now();
        let entry = PaymentRelayEntry {
            id: entries.len() as i64 + 1,
            payload: payload.to_string(),
            processed: false,
            retries_remaining: retries,
            created_on: now,
            last_modified_on: now,
        };
        entries.push(entry.clone());
        Ok(entry)
    }

    async fn get_entry(&self, id: i64) -> AppResult<Option<PaymentRelayEntry>> {
        let entries = self.relay_entries.read().await;
        Ok(entries.iter().find(|e| e.id == id).cloned())
    }

    async fn mark_processed(&self, id: i64) -> AppResult<bool> {
        let mut entries = self.relay_entries.write().await;
        match entries.iter_mut().find(|e| e.id == id && !e.processed) {
            Some(entry) => {
                entry.processed = true;
                entry.last_modified_on = Utc::now();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn record_failure(&self, id: i64) -> AppResult<Option<i32>> {
        let mut entries = self.relay_entries.write().await;
        Ok(entries
            .iter_mut()
            .find(|e| e.id == id && e.is_pending())
            .map(|entry| {
                entry.retries_remaining -= 1;
                entry.last_modified_on = Utc::now();
                entry.retries_remaining
            }))
    }

    async fn abandon(&self, id: i64) -> AppResult<bool> {
        let mut entries = self.relay_entries.write().await;
        match entries.iter_mut().find(|e| e.id == id && !e.processed) {
            Some(entry) => {
                entry.retries_remaining = 0;
                entry.last_modified_on = Utc::now();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn pending_entries(&self) -> AppResult<Vec<PaymentRelayEntry>> {
        let entries = self.relay_entries.read().await;
        Ok(entries.iter().filter(|e| e.is_pending()).cloned().collect())
    }

    async fn failed_entries(&self) -> AppResult<Vec<PaymentRelayEntry>> {
        let entries = self.relay_entries.read().await;
        Ok(entries
            .iter()
            .filter(|e| e.is_terminally_failed())
            .cloned()
            .collect())
    }
}

// ========== INGESTION ==========

#[async_trait]
impl LedgerCursorStore for MemoryStore {
    async fn latest_processed_cursor(&self) -> AppResult<Option<LedgerCursor>> {
        let tables = self.ingestion.read().await;
        Ok(tables
            .cursors
            .iter()
            .filter(|c| c.processed)
            .max_by_key(|c| c.id)
            .cloned())
    }

    async fn advance_cursor(&self, cursor: &str) -> AppResult<LedgerCursor> {
        let mut tables = self.ingestion.write().await;
        let cursor = LedgerCursor {
            id: tables.cursors.len() as i64 + 1,
            cursor: cursor.to_string(),
            processed: true,
        };
        tables.cursors.push(cursor.clone());
        Ok(cursor)
    }

    async fn record_inbound_payment(
        &self,
        payment: &NewInboundPayment,
        retries: i32,
    ) -> AppResult<Option<InboundPaymentEvent>> {
        // one write lock covers both tables, which makes the pair atomic
        let mut tables = self.ingestion.write().await;

        let cursor_id = tables.cursors.len() as i64 + 1;
        tables.cursors.push(LedgerCursor {
            id: cursor_id,
            cursor: payment.paging_token.clone(),
            processed: true,
        });

        let duplicate = tables.events.iter().any(|e| {
            e.tenant_id == payment.tenant_id && e.paging_token == payment.paging_token
        });
        if duplicate {
            return Ok(None);
        }

        let now = Utc::now();
        let event = InboundPaymentEvent {
            id: tables.events.len() as i64 + 1,
            cursor_id,
            tenant_id: payment.tenant_id.clone(),
            paging_token: payment.paging_token.clone(),
            asset_code: payment.asset_code.clone(),
            asset_issuer: payment.asset_issuer.clone(),
            amount: payment.amount,
            processed: false,
            retries_remaining: retries,
            created_on: now,
            last_modified_on: now,
        };
        tables.events.push(event.clone());
        Ok(Some(event))
    }
}

#[async_trait]
impl InboundEventStore for MemoryStore {
    async fn get_event(&self, id: i64) -> AppResult<Option<InboundPaymentEvent>> {
        let tables = self.ingestion.read().await;
        Ok(tables.events.iter().find(|e| e.id == id).cloned())
    }

    async fn mark_delivered(&self, id: i64) -> AppResult<bool> {
        let mut tables = self.ingestion.write().await;
        match tables.events.iter_mut().find(|e| e.id == id && !e.processed) {
            Some(event) => {
                event.processed = true;
                event.last_modified_on = Utc::now();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn record_delivery_failure(&self, id: i64) -> AppResult<Option<i32>> {
        let mut tables = self.ingestion.write().await;
        Ok(tables
            .events
            .iter_mut()
            .find(|e| e.id == id && e.is_pending())
            .map(|event| {
                event.retries_remaining -= 1;
                event.last_modified_on = Utc::now();
                event.retries_remaining
            }))
    }

    async fn pending_events(&self) -> AppResult<Vec<InboundPaymentEvent>> {
        let tables = self.ingestion.read().await;
        Ok(tables
            .events
            .iter()
            .filter(|e| e.is_pending())
            .cloned()
            .collect())
    }
}
