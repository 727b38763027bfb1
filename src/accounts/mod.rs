use std::sync::Arc;
use tokio::sync::OwnedMutexGuard;
use tracing::{debug, info};

use crate::error::{AppResult, BridgeError};
use crate::locks::KeyedLocks;
use crate::store::models::{BridgeAccount, VaultAccount};
use crate::store::BridgeAccountStore;

/// Single owner of BridgeAccount rows. Read-modify-write sequences on a
/// tenant's accounts or keys run under `lock_tenant`.
pub struct BridgeAccounts {
    store: Arc<dyn BridgeAccountStore>,
    locks: KeyedLocks,
}

impl BridgeAccounts {
    pub fn new(store: Arc<dyn BridgeAccountStore>) -> Self {
        Self {
            store,
            locks: KeyedLocks::new(),
        }
    }

    pub async fn lock_tenant(&self, tenant_id: &str) -> OwnedMutexGuard<()> {
        self.locks.lock(tenant_id).await
    }

    pub async fn find(&self, tenant_id: &str) -> AppResult<Option<BridgeAccount>> {
        self.store.find_bridge(tenant_id).await
    }

    /// Like `find`, but a missing tenant is an error
    pub async fn require(&self, tenant_id: &str) -> AppResult<BridgeAccount> {
        self.store
            .find_bridge(tenant_id)
            .await?
            .ok_or_else(|| BridgeError::TenantNotFound(tenant_id.to_string()).into())
    }

    pub async fn list(&self) -> AppResult<Vec<BridgeAccount>> {
        self.store.list_bridges().await
    }

    pub async fn create(&self, account: &BridgeAccount) -> AppResult<()> {
        if !self.store.insert_bridge(account).await? {
            return Err(BridgeError::TenantAlreadyExists(account.tenant_id.clone()).into());
        }
        info!("✓ Bridge account stored for tenant {}", account.tenant_id);
        Ok(())
    }

    /// Caller must hold the tenant lock
    pub async fn attach_vault(&self, tenant_id: &str, vault: &VaultAccount) -> AppResult<()> {
        if !self.store.attach_vault(tenant_id, vault).await? {
            return Err(BridgeError::TenantNotFound(tenant_id.to_string()).into());
        }
        info!("✓ Vault {} attached to tenant {}", vault.account_id, tenant_id);
        Ok(())
    }

    /// Caller must hold the tenant lock
    pub async fn delete(&self, tenant_id: &str) -> AppResult<()> {
        if !self.store.delete_bridge(tenant_id).await? {
            return Err(BridgeError::TenantNotFound(tenant_id.to_string()).into());
        }
        info!("🗑️ Bridge account deleted for tenant {}", tenant_id);
        Ok(())
    }

    /// Checks the API key presented for a tenant
    pub async fn authenticate(&self, tenant_id: &str, api_key: &str) -> AppResult<BridgeAccount> {
        match self.store.find_bridge(tenant_id).await? {
            Some(account) if account.api_key == api_key => Ok(account),
            _ => {
                debug!("Rejected API key for tenant {}", tenant_id);
                Err(BridgeError::Unauthorized.into())
            }
        }
    }
}
