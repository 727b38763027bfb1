use async_trait::async_trait;
use sqlx::{postgres::PgPoolOptions, PgPool};
use std::time::Duration;
use tracing::info;

use super::models::*;
use super::{BridgeAccountStore, InboundEventStore, LedgerCursorStore, PaymentOutboxStore};
use crate::error::AppResult;

const RELAY_COLUMNS: &str =
    "id, payload, processed, retries_remaining, created_on, last_modified_on";
const EVENT_COLUMNS: &str = "id, cursor_id, tenant_id, paging_token, asset_code, asset_issuer, \
     amount, processed, retries_remaining, created_on, last_modified_on";

/// Postgres-backed store, the source of truth for bridge state
pub struct PostgresStore {
    pub pool: PgPool,
}

impl PostgresStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str) -> AppResult<Self> {
        info!("📊 Connecting to database...");

        let pool = PgPoolOptions::new()
            .max_connections(20)
            .min_connections(2)
            .acquire_timeout(Duration::from_secs(30))
            .idle_timeout(Duration::from_secs(600))
            .max_lifetime(Duration::from_secs(1800))
            .connect(database_url)
            .await?;

        info!("🔄 Running database migrations...");
        sqlx::migrate!("./migrations").run(&pool).await?;

        info!("✓ Database initialized");
        Ok(Self::new(pool))
    }
}

// ========== BRIDGE ACCOUNTS ==========

#[async_trait]
impl BridgeAccountStore for PostgresStore {
    async fn insert_bridge(&self, account: &BridgeAccount) -> AppResult<bool> {
        let (vault_id, vault_key) = match &account.vault {
            Some(vault) => (
                Some(vault.account_id.clone()),
                Some(vault.private_key.expose().to_string()),
            ),
            None => (None, None),
        };

        let result = sqlx::query(
            r#"
            INSERT INTO bridge_accounts
                (tenant_id, api_key, access_token, ledger_account_id, ledger_private_key,
                 vault_account_id, vault_private_key, created_on)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (tenant_id) DO NOTHING
            "#,
        )
        .bind(&account.tenant_id)
        .bind(&account.api_key)
        .bind(&account.access_token)
        .bind(&account.ledger_account_id)
        .bind(account.ledger_private_key.expose())
        .bind(vault_id)
        .bind(vault_key)
        .bind(account.created_on)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn find_bridge(&self, tenant_id: &str) -> AppResult<Option<BridgeAccount>> {
        let row = sqlx::query_as::<_, BridgeAccountRow>(
            r#"
            SELECT tenant_id, api_key, access_token, ledger_account_id, ledger_private_key,
                   vault_account_id, vault_private_key, created_on
            FROM bridge_accounts
            WHERE tenant_id = $1
            "#,
        )
        .bind(tenant_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(BridgeAccount::try_from).transpose()
    }

    async fn list_bridges(&self) -> AppResult<Vec<BridgeAccount>> {
        let rows = sqlx::query_as::<_, BridgeAccountRow>(
            r#"
            SELECT tenant_id, api_key, access_token, ledger_account_id, ledger_private_key,
                   vault_account_id, vault_private_key, created_on
            FROM bridge_accounts
            ORDER BY created_on
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(BridgeAccount::try_from).collect()
    }

    async fn attach_vault(&self, tenant_id: &str, vault: &VaultAccount) -> AppResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE bridge_accounts
            SET vault_account_id = $2, vault_private_key = $3
            WHERE tenant_id = $1 AND vault_account_id IS NULL
            "#,
        )
        .bind(tenant_id)
        .bind(&vault.account_id)
        .bind(vault.private_key.expose())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn delete_bridge(&self, tenant_id: &str) -> AppResult<bool> {
        let result = sqlx::query("DELETE FROM bridge_accounts WHERE tenant_id = $1")
            .bind(tenant_id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() == 1)
    }
}

// ========== OUTBOX ==========

#[async_trait]
impl PaymentOutboxStore for PostgresStore {
    async fn insert_entry(&self, payload: &str, retries: i32) -> AppResult<PaymentRelayEntry> {
        let entry = sqlx::query_as::<_, PaymentRelayEntry>(&format!(
            r#"
            INSERT INTO payment_relay_entries (payload, processed, retries_remaining)
            VALUES ($1, FALSE, $2)
            RETURNING {}
            "#,
            RELAY_COLUMNS
        ))
        .bind(payload)
        .bind(retries)
        .fetch_one(&self.pool)
        .await?;

        Ok(entry)
    }

    async fn get_entry(&self, id: i64) -> AppResult<Option<PaymentRelayEntry>> {
        let entry = sqlx::query_as::<_, PaymentRelayEntry>(&format!(
            "SELECT {} FROM payment_relay_entries WHERE id = $1",
            RELAY_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(entry)
    }

    async fn mark_processed(&self, id: i64) -> AppResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE payment_relay_entries
            SET processed = TRUE, last_modified_on = NOW()
            WHERE id = $1 AND processed = FALSE
            "#,
        )
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn record_failure(&self, id: i64) -> AppResult<Option<i32>> {
        let remaining = sqlx::query_scalar::<_, i32>(
            r#"
            UPDATE payment_relay_entries
            SET retries_remaining = retries_remaining - 1, last_modified_on = NOW()
            WHERE id = $1 AND processed = FALSE AND retries_remaining > 0
            RETURNING retries_remaining
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(remaining)
    }

    async fn abandon(&self, id: i64) -> AppResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE payment_relay_entries
            SET retries_remaining = 0, last_modified_on = NOW()
            WHERE id = $1 AND processed = FALSE
            "#,
        )
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn pending_entries(&self) -> AppResult<Vec<PaymentRelayEntry>> {
        let entries = sqlx::query_as::<_, PaymentRelayEntry>(&format!(
            r#"
            SELECT {} FROM payment_relay_entries
            WHERE processed = FALSE AND retries_remaining > 0
            ORDER BY id
            "#,
            RELAY_COLUMNS
        ))
        .fetch_all(&self.pool)
        .await?;

        Ok(entries)
    }

    async fn failed_entries(&self) -> AppResult<Vec<PaymentRelayEntry>> {
        let entries = sqlx::query_as::<_, PaymentRelayEntry>(&format!(
            r#"
            SELECT {} FROM payment_relay_entries
            WHERE processed = FALSE AND retries_remaining <= 0
            ORDER BY id
            "#,
            RELAY_COLUMNS
        ))
        .fetch_all(&self.pool)
        .await?;

        Ok(entries)
    }
}

// ========== INGESTION ==========

#[async_trait]
impl LedgerCursorStore for PostgresStore {
    async fn latest_processed_cursor(&self) -> AppResult<Option<LedgerCursor>> {
        let cursor = sqlx::query_as::<_, LedgerCursor>(
            r#"
            SELECT id, cursor, processed FROM ledger_cursors
            WHERE processed = TRUE
            ORDER BY id DESC
            LIMIT 1
            "#,
        )
        .fetch_optional(&self.pool)
        .await?;

        Ok(cursor)
    }

    async fn advance_cursor(&self, cursor: &str) -> AppResult<LedgerCursor> {
        let cursor = sqlx::query_as::<_, LedgerCursor>(
            r#"
            INSERT INTO ledger_cursors (cursor, processed)
            VALUES ($1, TRUE)
            RETURNING id, cursor, processed
            "#,
        )
        .bind(cursor)
        .fetch_one(&self.pool)
        .await?;

        Ok(cursor)
    }

    async fn record_inbound_payment(
        &self,
        payment: &NewInboundPayment,
        retries: i32,
    ) -> AppResult<Option<InboundPaymentEvent>> {
        let mut tx = self.pool.begin().await?;

        let cursor_id = sqlx::query_scalar::<_, i64>(
            "INSERT INTO ledger_cursors (cursor, processed) VALUES ($1, FALSE) RETURNING id",
        )
        .bind(&payment.paging_token)
        .fetch_one(&mut *tx)
        .await?;

        let event = sqlx::query_as::<_, InboundPaymentEvent>(&format!(
            r#"
            INSERT INTO inbound_payment_events
                (cursor_id, tenant_id, paging_token, asset_code, asset_issuer, amount,
                 processed, retries_remaining)
            VALUES ($1, $2, $3, $4, $5, $6, FALSE, $7)
            ON CONFLICT (tenant_id, paging_token) DO NOTHING
            RETURNING {}
            "#,
            EVENT_COLUMNS
        ))
        .bind(cursor_id)
        .bind(&payment.tenant_id)
        .bind(&payment.paging_token)
        .bind(&payment.asset_code)
        .bind(&payment.asset_issuer)
        .bind(payment.amount)
        .bind(retries)
        .fetch_optional(&mut *tx)
        .await?;

        sqlx::query("UPDATE ledger_cursors SET processed = TRUE WHERE id = $1")
            .bind(cursor_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(event)
    }
}

#[async_trait]
impl InboundEventStore for PostgresStore {
    async fn get_event(&self, id: i64) -> AppResult<Option<InboundPaymentEvent>> {
        let event = sqlx::query_as::<_, InboundPaymentEvent>(&format!(
            "SELECT {} FROM inbound_payment_events WHERE id = $1",
            EVENT_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(event)
    }

    async fn mark_delivered(&self, id: i64) -> AppResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE inbound_payment_events
            SET processed = TRUE, last_modified_on = NOW()
            WHERE id = $1 AND processed = FALSE
            "#,
        )
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn record_delivery_failure(&self, id: i64) -> AppResult<Option<i32>> {
        let remaining = sqlx::query_scalar::<_, i32>(
            r#"
            UPDATE inbound_payment_events
            SET retries_remaining = retries_remaining - 1, last_modified_on = NOW()
            WHERE id = $1 AND processed = FALSE AND retries_remaining > 0
            RETURNING retries_remaining
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(remaining)
    }

    async fn pending_events(&self) -> AppResult<Vec<InboundPaymentEvent>> {
        let events = sqlx::query_as::<_, InboundPaymentEvent>(&format!(
            r#"
            SELECT {} FROM inbound_payment_events
            WHERE processed = FALSE AND retries_remaining > 0
            ORDER BY id
            "#,
            EVENT_COLUMNS
        ))
        .fetch_all(&self.pool)
        .await?;

        Ok(events)
    }
}
