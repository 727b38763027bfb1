use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::prelude::FromRow;

use crate::error::{AppError, AppResult};
use crate::federation::address::LedgerAccountId;
use crate::gateway::SecretKey;

// ========== BRIDGE ACCOUNTS ==========

/// The issuing account provisioned for a tenant on first issuance adjustment
#[derive(Debug, Clone, PartialEq)]
pub struct VaultAccount {
    pub account_id: String,
    pub private_key: SecretKey,
}

impl VaultAccount {
    pub fn ledger_account(&self) -> LedgerAccountId {
        LedgerAccountId::main_account(self.account_id.clone())
    }
}

/// One core-banking tenant and its ledger accounts
#[derive(Debug, Clone, PartialEq)]
pub struct BridgeAccount {
    pub tenant_id: String,
    pub api_key: String,
    pub access_token: String,
    pub ledger_account_id: String,
    pub ledger_private_key: SecretKey,
    pub vault: Option<VaultAccount>,
    pub created_on: DateTime<Utc>,
}

impl BridgeAccount {
    pub fn main_account(&self) -> LedgerAccountId {
        LedgerAccountId::main_account(self.ledger_account_id.clone())
    }

    pub fn vault_account(&self) -> Option<LedgerAccountId> {
        self.vault.as_ref().map(VaultAccount::ledger_account)
    }
}

#[derive(Debug, FromRow)]
pub struct BridgeAccountRow {
    pub tenant_id: String,
    pub api_key: String,
    pub access_token: String,
    pub ledger_account_id: String,
    pub ledger_private_key: String,
    pub vault_account_id: Option<String>,
    pub vault_private_key: Option<String>,
    pub created_on: DateTime<Utc>,
}

impl TryFrom<BridgeAccountRow> for BridgeAccount {
    type Error = AppError;

    fn try_from(row: BridgeAccountRow) -> AppResult<Self> {
        let vault = match (row.vault_account_id, row.vault_private_key) {
            (Some(account_id), Some(private_key)) => Some(VaultAccount {
                account_id,
                private_key: SecretKey::new(private_key),
            }),
            (None, None) => None,
            _ => {
                return Err(AppError::Internal(format!(
                    "Bridge account {} has a half-provisioned vault",
                    row.tenant_id
                )))
            }
        };

        Ok(BridgeAccount {
            tenant_id: row.tenant_id,
            api_key: row.api_key,
            access_token: row.access_token,
            ledger_account_id: row.ledger_account_id,
            ledger_private_key: SecretKey::new(row.ledger_private_key),
            vault,
            created_on: row.created_on,
        })
    }
}

// ========== OUTBOX ==========

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct PaymentRelayEntry {
    pub id: i64,
    pub payload: String,
    pub processed: bool,
    pub retries_remaining: i32,
    pub created_on: DateTime<Utc>,
    pub last_modified_on: DateTime<Utc>,
}

impl PaymentRelayEntry {
    /// Still owed a dispatch attempt
    pub fn is_pending(&self) -> bool {
        !self.processed && self.retries_remaining > 0
    }

    pub fn is_terminally_failed(&self) -> bool {
        !self.processed && self.retries_remaining <= 0
    }
}

// ========== INGESTION ==========

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct LedgerCursor {
    pub id: i64,
    pub cursor: String,
    pub processed: bool,
}

/// An inbound ledger payment not yet written to the store
#[derive(Debug, Clone, PartialEq)]
pub struct NewInboundPayment {
    pub tenant_id: String,
    pub paging_token: String,
    pub asset_code: String,
    pub asset_issuer: String,
    pub amount: Decimal,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct InboundPaymentEvent {
    pub id: i64,
    pub cursor_id: i64,
    pub tenant_id: String,
    pub paging_token: String,
    pub asset_code: String,
    pub asset_issuer: String,
    pub amount: Decimal,
    pub processed: bool,
    pub retries_remaining: i32,
    pub created_on: DateTime<Utc>,
    pub last_modified_on: DateTime<Utc>,
}

impl InboundPaymentEvent {
    pub fn is_pending(&self) -> bool {
        !self.processed && self.retries_remaining > 0
    }
}
