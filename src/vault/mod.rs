//! Vault issuance netting: keeps the trustline a tenant extends to its own
//! vault, and the vault-issued balance it holds, at a requested amount.
//!
//! The ledger rejects any state where a balance exceeds its trustline, so the
//! trustline grows before the vault pays out and shrinks only after the tenant
//! has paid back.

use rust_decimal::Decimal;
use std::sync::Arc;
use tracing::{info, instrument};

use crate::accounts::BridgeAccounts;
use crate::error::AppResult;
use crate::gateway::{IssuedAsset, LedgerGateway, PaymentOrder};
use crate::store::models::{BridgeAccount, VaultAccount};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NettingPlan {
    Unchanged,
    /// Raise the trustline to the target, then issue `delta`
    Grow { delta: Decimal },
    /// Reclaim up to `requested`, then lower the trustline by what came back
    Shrink { requested: Decimal },
}

pub fn plan(target: Decimal, current_trusted: Decimal) -> NettingPlan {
    let delta = target - current_trusted;
    if delta > Decimal::ZERO {
        NettingPlan::Grow { delta }
    } else if delta < Decimal::ZERO {
        NettingPlan::Shrink {
            requested: delta.abs(),
        }
    } else {
        NettingPlan::Unchanged
    }
}

/// Never more than the tenant holds, never more than was asked for
pub fn reclaimable(held: Decimal, requested: Decimal) -> Decimal {
    held.min(requested.abs()).max(Decimal::ZERO)
}

pub struct VaultNettingEngine {
    accounts: Arc<BridgeAccounts>,
    gateway: Arc<dyn LedgerGateway>,
}

impl VaultNettingEngine {
    pub fn new(accounts: Arc<BridgeAccounts>, gateway: Arc<dyn LedgerGateway>) -> Self {
        Self { accounts, gateway }
    }

    /// Moves the amount of `asset_code` issued to the tenant by its vault
    /// towards `target` and returns the resulting trustline size.
    /// Calls for the same tenant are serialized.
    #[instrument(skip(self))]
    pub async fn adjust_issued_amount(
        &self,
        tenant_id: &str,
        asset_code: &str,
        target: Decimal,
    ) -> AppResult<Decimal> {
        let _guard = self.accounts.lock_tenant(tenant_id).await;
        let bridge = self.accounts.require(tenant_id).await?;

        let vault = match bridge.vault.clone() {
            Some(vault) => vault,
            None => {
                let vault = self.provision_vault(&bridge).await?;
                if target <= Decimal::ZERO {
                    return Ok(Decimal::ZERO);
                }
                vault
            }
        };
        let target = target.max(Decimal::ZERO);

        let tenant_account = bridge.main_account();
        let vault_account = vault.ledger_account();
        let asset = IssuedAsset::new(asset_code, vault.account_id.clone());

        let current_trusted = self
            .gateway
            .currency_trust_size(&tenant_account, asset_code, &vault_account)
            .await?;

        match plan(target, current_trusted) {
            NettingPlan::Unchanged => Ok(current_trusted),

            NettingPlan::Grow { delta } => {
                self.gateway
                    .set_trust_line_size(&bridge.ledger_private_key, &vault_account, asset_code, target)
                    .await?;
                self.gateway
                    .submit_payment(&PaymentOrder {
                        signer: vault.private_key.clone(),
                        destination: tenant_account,
                        asset,
                        amount: delta,
                    })
                    .await?;

                info!("✓ Vault issued {} {} to {} (now {})", delta, asset_code, tenant_id, target);
                Ok(target)
            }

            NettingPlan::Shrink { requested } => {
                let held = self
                    .gateway
                    .get_balance_by_issuer(&tenant_account, asset_code, &vault_account)
                    .await?;
                let reclaim = reclaimable(held, requested);

                // tenant pays back to the vault, signed by the tenant
                if reclaim > Decimal::ZERO {
                    self.gateway
                        .submit_payment(&PaymentOrder {
                            signer: bridge.ledger_private_key.clone(),
                            destination: vault_account.clone(),
                            asset,
                            amount: reclaim,
                        })
                        .await?;
                }

                let remaining = current_trusted - reclaim;
                self.gateway
                    .set_trust_line_size(&bridge.ledger_private_key, &vault_account, asset_code, remaining)
                    .await?;

                info!(
                    "✓ Vault reclaimed {} {} from {} (now {})",
                    reclaim, asset_code, tenant_id, remaining
                );
                Ok(remaining)
            }
        }
    }

    /// Caller holds the tenant lock
    async fn provision_vault(&self, bridge: &BridgeAccount) -> AppResult<VaultAccount> {
        let keypair = self.gateway.create_vault_account().await?;
        let vault = VaultAccount {
            account_id: keypair.account_id,
            private_key: keypair.secret,
        };
        self.accounts.attach_vault(&bridge.tenant_id, &vault).await?;
        Ok(vault)
    }
}
