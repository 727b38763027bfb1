use rust_decimal::Decimal;
use std::sync::Arc;
use tracing::{info, instrument};

use crate::accounts::BridgeAccounts;
use crate::error::{AppResult, BridgeError};
use crate::federation::address::{FederationAddress, LedgerAccountId};
use crate::federation::FederationResolver;
use crate::gateway::LedgerGateway;
use crate::ingest::StreamIngestor;
use crate::relay::{PaymentInstruction, PaymentOutbox};
use crate::store::models::{BridgeAccount, PaymentRelayEntry};
use crate::vault::VaultNettingEngine;

/// Everything the HTTP surface can ask of the bridge
pub struct BridgeService {
    accounts: Arc<BridgeAccounts>,
    gateway: Arc<dyn LedgerGateway>,
    resolver: Arc<FederationResolver>,
    outbox: Arc<PaymentOutbox>,
    ingestor: Arc<StreamIngestor>,
    netting: Arc<VaultNettingEngine>,
}

impl BridgeService {
    pub fn new(
        accounts: Arc<BridgeAccounts>,
        gateway: Arc<dyn LedgerGateway>,
        resolver: Arc<FederationResolver>,
        outbox: Arc<PaymentOutbox>,
        ingestor: Arc<StreamIngestor>,
        netting: Arc<VaultNettingEngine>,
    ) -> Self {
        Self {
            accounts,
            gateway,
            resolver,
            outbox,
            ingestor,
            netting,
        }
    }

    pub fn accounts(&self) -> &BridgeAccounts {
        &self.accounts
    }

    pub fn resolver(&self) -> &FederationResolver {
        &self.resolver
    }

    // ========== ONBOARDING ==========

    /// Creates the tenant's ledger account, stores the bridge and starts
    /// listening for its payments. Returns the tenant's API key.
    #[instrument(skip(self, access_token))]
    pub async fn create_bridge(&self, tenant_id: &str, access_token: &str) -> AppResult<String> {
        let _guard = self.accounts.lock_tenant(tenant_id).await;
        if self.accounts.find(tenant_id).await?.is_some() {
            return Err(BridgeError::TenantAlreadyExists(tenant_id.to_string()).into());
        }

        let keypair = self.gateway.create_account().await?;
        let bridge = BridgeAccount {
            tenant_id: tenant_id.to_string(),
            api_key: hex::encode(rand::random::<[u8; 24]>()),
            access_token: access_token.to_string(),
            ledger_account_id: keypair.account_id,
            ledger_private_key: keypair.secret,
            vault: None,
            created_on: chrono::Utc::now(),
        };
        self.accounts.create(&bridge).await?;
        self.ingestor.on_provisioned(&bridge).await;

        info!("✅ Bridge created for tenant {} ({})", tenant_id, bridge.ledger_account_id);
        Ok(bridge.api_key)
    }

    /// Removes a bridge. Refused while the main or vault account still holds
    /// any issued asset, since its keys are deleted with the row.
    #[instrument(skip(self))]
    pub async fn delete_bridge(&self, tenant_id: &str) -> AppResult<()> {
        let _guard = self.accounts.lock_tenant(tenant_id).await;
        let bridge = self.accounts.require(tenant_id).await?;

        let held_by = std::iter::once(bridge.main_account()).chain(bridge.vault_account());
        for account in held_by {
            let balances = self.gateway.account_balances(&account).await?;
            let outstanding = balances
                .into_iter()
                .filter(|line| line.balance > Decimal::ZERO)
                .find_map(|line| line.asset);
            if let Some(asset) = outstanding {
                return Err(BridgeError::BalancesOutstanding {
                    tenant_id: tenant_id.to_string(),
                    asset_code: asset.code,
                    issuer: asset.issuer,
                }
                .into());
            }
        }

        self.accounts.delete(tenant_id).await?;
        self.ingestor.on_deleted(tenant_id);
        info!("✅ Bridge deleted for tenant {}", tenant_id);
        Ok(())
    }

    // ========== TRUSTLINES ==========

    /// Sets the tenant's trustline towards another account. The tenant's own
    /// vault is refused here; issuance goes through `adjust_vault_issued_assets`.
    #[instrument(skip(self, target), fields(address = %target))]
    pub async fn adjust_trust_line(
        &self,
        tenant_id: &str,
        target: &FederationAddress,
        asset_code: &str,
        max_amount: Decimal,
    ) -> AppResult<()> {
        let issuer = self.resolver.resolve_top_level(target).await?;

        let _guard = self.accounts.lock_tenant(tenant_id).await;
        let bridge = self.accounts.require(tenant_id).await?;

        if bridge.vault_account().as_ref() == Some(&issuer) {
            return Err(BridgeError::SelfReferentialTrustline {
                tenant_id: tenant_id.to_string(),
                address: target.to_string(),
            }
            .into());
        }

        self.gateway
            .set_trust_line_size(&bridge.ledger_private_key, &issuer, asset_code, max_amount)
            .await?;
        info!("✓ Trustline {} -> {} for {} set to {}", tenant_id, target, asset_code, max_amount);
        Ok(())
    }

    pub async fn adjust_vault_issued_assets(
        &self,
        tenant_id: &str,
        asset_code: &str,
        amount: Decimal,
    ) -> AppResult<Decimal> {
        self.netting
            .adjust_issued_amount(tenant_id, asset_code, amount)
            .await
    }

    // ========== PAYMENTS ==========

    pub async fn send_payment(&self, instruction: &PaymentInstruction) -> AppResult<i64> {
        self.accounts.require(&instruction.source_tenant).await?;
        self.outbox.enqueue(instruction).await
    }

    pub async fn failed_payments(&self) -> AppResult<Vec<PaymentRelayEntry>> {
        self.outbox.failed_entries().await
    }

    // ========== BALANCES ==========

    pub async fn get_balance(&self, tenant_id: &str, asset_code: &str) -> AppResult<Decimal> {
        let bridge = self.accounts.require(tenant_id).await?;
        self.gateway
            .get_balance(&bridge.main_account(), asset_code)
            .await
    }

    pub async fn get_balance_by_issuer(
        &self,
        tenant_id: &str,
        asset_code: &str,
        issuer: &FederationAddress,
    ) -> AppResult<Decimal> {
        let bridge = self.accounts.require(tenant_id).await?;
        let issuer = self.resolver.resolve_top_level(issuer).await?;
        self.gateway
            .get_balance_by_issuer(&bridge.main_account(), asset_code, &issuer)
            .await
    }

    pub async fn get_installation_account_balance(
        &self,
        asset_code: &str,
        issuer: &FederationAddress,
    ) -> AppResult<Decimal> {
        let issuer = self.resolver.resolve_top_level(issuer).await?;
        let installation: LedgerAccountId = self.gateway.installation_account();
        self.gateway
            .get_balance_by_issuer(&installation, asset_code, &issuer)
            .await
    }

    pub async fn tenant_has_vault(&self, tenant_id: &str) -> AppResult<bool> {
        Ok(self.accounts.require(tenant_id).await?.vault.is_some())
    }

    /// Size of the trustline the tenant extends to its vault; zero without a vault
    pub async fn get_vault_issued_assets(
        &self,
        tenant_id: &str,
        asset_code: &str,
    ) -> AppResult<Decimal> {
        let bridge = self.accounts.require(tenant_id).await?;
        match bridge.vault_account() {
            Some(vault) => {
                self.gateway
                    .currency_trust_size(&bridge.main_account(), asset_code, &vault)
                    .await
            }
            None => Ok(Decimal::ZERO),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{AppError, FederationError};
    use crate::gateway::mock::{GatewayCall, RecordingGateway, INSTALLATION_ACCOUNT};
    use crate::gateway::{IssuedAsset, PaymentOrder, SecretKey};
    use crate::ingest::StreamSettings;
    use crate::notify::InboundDelivery;
    use crate::store::{MemoryStore, PaymentOutboxStore};
    use rust_decimal_macros::dec;
    use std::time::Duration;
    use tokio::sync::mpsc;

    struct Harness {
        store: Arc<MemoryStore>,
        gateway: RecordingGateway,
        ingestor: Arc<StreamIngestor>,
        service: BridgeService,
    }

    fn harness() -> Harness {
        let store = Arc::new(MemoryStore::new());
        let gateway = RecordingGateway::new();
        let ledger: Arc<dyn LedgerGateway> = Arc::new(gateway.clone());
        let accounts = Arc::new(BridgeAccounts::new(store.clone()));
        let resolver = Arc::new(FederationResolver::new("test.org", accounts.clone()));

        let (relay_tx, _relay_rx) = mpsc::unbounded_channel();
        let outbox = Arc::new(PaymentOutbox::new(store.clone(), 3, relay_tx));
        let (delivery_tx, _delivery_rx) = mpsc::unbounded_channel();
        let delivery = Arc::new(InboundDelivery::new(store.clone(), delivery_tx));
        let ingestor = Arc::new(StreamIngestor::new(
            ledger.clone(),
            accounts.clone(),
            store.clone(),
            delivery,
            StreamSettings {
                poll_interval: Duration::from_millis(5),
                reconnect_delay: Duration::from_millis(5),
            },
            3,
        ));
        let netting = Arc::new(VaultNettingEngine::new(accounts.clone(), ledger.clone()));

        let service = BridgeService::new(
            accounts,
            ledger,
            resolver,
            outbox,
            ingestor.clone(),
            netting,
        );
        Harness {
            store,
            gateway,
            ingestor,
            service,
        }
    }

    fn addr(text: &str) -> FederationAddress {
        FederationAddress::parse(text).unwrap()
    }

    #[tokio::test]
    async fn test_create_bridge() {
        let h = harness();
        let api_key = h.service.create_bridge("alice", "token").await.unwrap();

        assert_eq!(api_key.len(), 48);
        assert!(h.ingestor.is_subscribed("alice"));
        assert!(matches!(
            h.gateway.calls().as_slice(),
            [GatewayCall::CreateAccount(_)]
        ));
        assert!(h.service.accounts().authenticate("alice", &api_key).await.is_ok());

        assert!(matches!(
            h.service.create_bridge("alice", "token").await,
            Err(AppError::Bridge(BridgeError::TenantAlreadyExists(_)))
        ));
        assert_eq!(h.gateway.calls().len(), 1);
    }

    #[tokio::test]
    async fn test_self_referential_trustline_is_rejected() {
        let h = harness();
        h.service.create_bridge("alice", "token").await.unwrap();
        h.service
            .adjust_vault_issued_assets("alice", "USD", dec!(0))
            .await
            .unwrap();
        h.gateway.clear_calls();

        let result = h
            .service
            .adjust_trust_line("alice", &addr("alice:vault*test.org"), "USD", dec!(10))
            .await;
        assert!(matches!(
            result,
            Err(AppError::Bridge(BridgeError::SelfReferentialTrustline { .. }))
        ));
        assert!(h.gateway.calls().is_empty());
    }

    #[tokio::test]
    async fn test_trustline_to_another_tenant() {
        let h = harness();
        h.service.create_bridge("alice", "token").await.unwrap();
        h.service.create_bridge("bob", "token").await.unwrap();
        h.gateway.clear_calls();

        h.service
            .adjust_trust_line("alice", &addr("bob*test.org"), "USD", dec!(250))
            .await
            .unwrap();

        let bob = h.service.accounts().require("bob").await.unwrap();
        let alice = h.service.accounts().require("alice").await.unwrap();
        assert_eq!(
            h.gateway.trust(&alice.ledger_account_id, "USD", &bob.ledger_account_id),
            dec!(250)
        );

        assert!(matches!(
            h.service
                .adjust_trust_line("alice", &addr("bob:12*test.org"), "USD", dec!(1))
                .await,
            Err(AppError::Federation(FederationError::NeedsTopLevelAccount(_)))
        ));
    }

    #[tokio::test]
    async fn test_delete_refused_while_holding_issued_assets() {
        let h = harness();
        h.service.create_bridge("alice", "token").await.unwrap();
        h.service
            .adjust_vault_issued_assets("alice", "USD", dec!(20))
            .await
            .unwrap();

        assert!(matches!(
            h.service.delete_bridge("alice").await,
            Err(AppError::Bridge(BridgeError::BalancesOutstanding { .. }))
        ));
        assert!(h.ingestor.is_subscribed("alice"));

        h.service
            .adjust_vault_issued_assets("alice", "USD", dec!(0))
            .await
            .unwrap();
        h.service.delete_bridge("alice").await.unwrap();

        assert!(!h.ingestor.is_subscribed("alice"));
        assert!(matches!(
            h.service.tenant_has_vault("alice").await,
            Err(AppError::Bridge(BridgeError::TenantNotFound(_)))
        ));
    }

    #[tokio::test]
    async fn test_send_payment_requires_known_tenant() {
        let h = harness();
        let instruction = PaymentInstruction {
            asset_code: "USD".to_string(),
            amount: dec!(5),
            source_tenant: "ghost".to_string(),
            destination_address: addr("bob*test.org"),
            issuer_address: None,
        };
        assert!(matches!(
            h.service.send_payment(&instruction).await,
            Err(AppError::Bridge(BridgeError::TenantNotFound(_)))
        ));
        assert!(h.store.pending_entries().await.unwrap().is_empty());

        h.service.create_bridge("ghost", "token").await.unwrap();
        let id = h.service.send_payment(&instruction).await.unwrap();
        assert_eq!(h.store.pending_entries().await.unwrap()[0].id, id);
    }

    #[tokio::test]
    async fn test_balances_and_vault_queries() {
        let h = harness();
        h.service.create_bridge("alice", "token").await.unwrap();

        assert!(!h.service.tenant_has_vault("alice").await.unwrap());
        assert_eq!(
            h.service.get_vault_issued_assets("alice", "USD").await.unwrap(),
            dec!(0)
        );

        h.service
            .adjust_vault_issued_assets("alice", "USD", dec!(75))
            .await
            .unwrap();

        assert!(h.service.tenant_has_vault("alice").await.unwrap());
        assert_eq!(
            h.service.get_vault_issued_assets("alice", "USD").await.unwrap(),
            dec!(75)
        );
        assert_eq!(h.service.get_balance("alice", "USD").await.unwrap(), dec!(75));
        assert_eq!(
            h.service
                .get_balance_by_issuer("alice", "USD", &addr("alice:vault*test.org"))
                .await
                .unwrap(),
            dec!(75)
        );
        assert_eq!(
            h.service
                .get_balance_by_issuer("alice", "USD", &addr("alice*test.org"))
                .await
                .unwrap(),
            dec!(0)
        );
    }

    #[tokio::test]
    async fn test_installation_account_balance() {
        let h = harness();
        h.service.create_bridge("alice", "token").await.unwrap();
        let alice = h.service.accounts().require("alice").await.unwrap();

        h.gateway
            .set_trust_line_size(
                &SecretKey::new("SINSTALLATION"),
                &alice.main_account(),
                "USD",
                dec!(100),
            )
            .await
            .unwrap();
        h.gateway
            .submit_payment(&PaymentOrder {
                signer: alice.ledger_private_key.clone(),
                destination: LedgerAccountId::main_account(INSTALLATION_ACCOUNT),
                asset: IssuedAsset::new("USD", alice.ledger_account_id.clone()),
                amount: dec!(12),
            })
            .await
            .unwrap();

        assert_eq!(
            h.service
                .get_installation_account_balance("USD", &addr("alice*test.org"))
                .await
                .unwrap(),
            dec!(12)
        );
    }
}
