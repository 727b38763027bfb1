use std::sync::Arc;
use tracing::{debug, warn};

use super::address::{normalize_domain, AddressTarget, FederationAddress, LedgerAccountId};
use crate::accounts::BridgeAccounts;
use crate::error::{AppResult, FederationError};

/// Resolves addresses under the bridge's own federation domain
pub struct FederationResolver {
    /// `None` when the configured domain is not a valid domain name
    local_domain: Option<String>,
    accounts: Arc<BridgeAccounts>,
}

impl FederationResolver {
    pub fn new(configured_domain: &str, accounts: Arc<BridgeAccounts>) -> Self {
        let local_domain = normalize_domain(configured_domain);
        if local_domain.is_none() {
            warn!(
                "⚠️  Federation domain '{}' is not a valid domain name, no addresses will resolve",
                configured_domain
            );
        }
        Self {
            local_domain,
            accounts,
        }
    }

    pub fn local_domain(&self) -> Option<&str> {
        self.local_domain.as_deref()
    }

    pub fn handles_domain(&self, domain: &str) -> bool {
        match (&self.local_domain, normalize_domain(domain)) {
            (Some(local), Some(domain)) => *local == domain,
            _ => false,
        }
    }

    pub async fn resolve(&self, address: &FederationAddress) -> AppResult<LedgerAccountId> {
        debug!("Resolving {}", address);

        if !self.handles_domain(address.domain()) {
            return Err(FederationError::WrongDomain(address.domain().to_string()).into());
        }

        let bridge = self
            .accounts
            .find(address.tenant())
            .await?
            .ok_or_else(|| FederationError::AddressNotFound(address.to_string()))?;

        match address.target() {
            AddressTarget::Vault => bridge
                .vault_account()
                .ok_or_else(|| FederationError::AddressNotFound(address.to_string()).into()),
            AddressTarget::Main => Ok(bridge.main_account()),
            // sub-accounts are caller-trusted, nothing on the ledger is checked
            AddressTarget::SubAccount(sub) => Ok(LedgerAccountId::sub_account(
                bridge.ledger_account_id,
                sub.clone(),
            )),
        }
    }

    /// Resolves to an account that can act as a trustline issuer
    pub async fn resolve_top_level(
        &self,
        address: &FederationAddress,
    ) -> AppResult<LedgerAccountId> {
        let account = self.resolve(address).await?;
        if !account.is_top_level() {
            return Err(FederationError::NeedsTopLevelAccount(address.to_string()).into());
        }
        Ok(account)
    }
}
