pub mod horizon;
#[cfg(test)]
pub mod mock;

use async_trait::async_trait;
use futures::stream::BoxStream;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::AppResult;
use crate::federation::address::LedgerAccountId;

pub use horizon::{HorizonConfig, HorizonGateway};

/// Secret seed of a ledger account. Never printed.
#[derive(Clone, PartialEq, Eq)]
pub struct SecretKey(String);

impl SecretKey {
    pub fn new(seed: impl Into<String>) -> Self {
        Self(seed.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for SecretKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SecretKey(***)")
    }
}

/// A freshly created ledger account
#[derive(Debug, Clone)]
pub struct KeyPair {
    pub account_id: String,
    pub secret: SecretKey,
}

/// A non-native asset: code plus issuing account
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IssuedAsset {
    pub code: String,
    pub issuer: String,
}

impl IssuedAsset {
    pub fn new(code: impl Into<String>, issuer: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            issuer: issuer.into(),
        }
    }
}

/// A payment to be signed and submitted. The source account is the account
/// owning `signer`.
#[derive(Debug, Clone)]
pub struct PaymentOrder {
    pub signer: SecretKey,
    pub destination: LedgerAccountId,
    pub asset: IssuedAsset,
    pub amount: Decimal,
}

/// One balance line of a ledger account
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssetBalance {
    /// `None` for the native asset
    pub asset: Option<IssuedAsset>,
    pub balance: Decimal,
    /// Trustline size; `None` for the native asset
    pub limit: Option<Decimal>,
}

/// A payment observed on the ledger's payment feed for one account
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerPayment {
    pub paging_token: String,
    pub from: String,
    pub to: String,
    /// `None` for the native asset
    pub asset: Option<IssuedAsset>,
    pub amount: Decimal,
}

pub type PaymentStream = BoxStream<'static, AppResult<LedgerPayment>>;

/// Client of the external settlement network. Owns signing, sequence numbers
/// and transaction-level network retries.
#[async_trait]
pub trait LedgerGateway: Send + Sync {
    /// The installation account that funds new accounts
    fn installation_account(&self) -> LedgerAccountId;

    async fn create_account(&self) -> AppResult<KeyPair>;

    async fn create_vault_account(&self) -> AppResult<KeyPair>;

    /// Set the trustline from the signer's account to `issuer` for `asset_code`
    async fn set_trust_line_size(
        &self,
        signer: &SecretKey,
        issuer: &LedgerAccountId,
        asset_code: &str,
        max_amount: Decimal,
    ) -> AppResult<()>;

    /// Returns the transaction hash
    async fn submit_payment(&self, payment: &PaymentOrder) -> AppResult<String>;

    /// Balance of `asset_code` summed over all issuers
    async fn get_balance(&self, account: &LedgerAccountId, asset_code: &str)
        -> AppResult<Decimal>;

    async fn get_balance_by_issuer(
        &self,
        account: &LedgerAccountId,
        asset_code: &str,
        issuer: &LedgerAccountId,
    ) -> AppResult<Decimal>;

    /// Size of the trustline `trustor` extends to `issuer` for `asset_code`;
    /// zero when no trustline exists
    async fn currency_trust_size(
        &self,
        trustor: &LedgerAccountId,
        asset_code: &str,
        issuer: &LedgerAccountId,
    ) -> AppResult<Decimal>;

    async fn account_balances(&self, account: &LedgerAccountId) -> AppResult<Vec<AssetBalance>>;

    /// Paging token of the newest entry on `account`'s payment feed, `"0"`
    /// for an account with no history. Pins "now" to a fixed position.
    async fn latest_paging_token(&self, account: &LedgerAccountId) -> AppResult<String>;

    /// Payments touching `account`, starting after `cursor` or from now
    async fn subscribe_payments(
        &self,
        account: &LedgerAccountId,
        cursor: Option<String>,
    ) -> AppResult<PaymentStream>;
}
