//! In-process ledger used by unit tests. Tracks trustlines and balances the way
//! the network does and records every mutating call in order.

use async_trait::async_trait;
use futures::stream;
use parking_lot::Mutex;
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use super::{
    AssetBalance, IssuedAsset, KeyPair, LedgerGateway, LedgerPayment, PaymentOrder,
    PaymentStream, SecretKey,
};
use crate::error::{AppResult, LedgerError};
use crate::federation::address::LedgerAccountId;

pub const INSTALLATION_ACCOUNT: &str = "GINSTALLATION";

#[derive(Debug, Clone, PartialEq)]
pub enum GatewayCall {
    CreateAccount(String),
    CreateVaultAccount(String),
    SetTrustLine {
        trustor: String,
        issuer: String,
        asset_code: String,
        limit: Decimal,
    },
    Payment {
        source: String,
        destination: LedgerAccountId,
        asset: IssuedAsset,
        amount: Decimal,
    },
}

type LineKey = (String, String, String);

#[derive(Default)]
struct LedgerState {
    secrets: HashMap<String, String>,
    trust: HashMap<LineKey, Decimal>,
    balances: HashMap<LineKey, Decimal>,
    history: Vec<(String, LedgerPayment)>,
    calls: Vec<GatewayCall>,
    next_id: u64,
    failing_payments: usize,
    failing_streams: usize,
}

impl LedgerState {
    fn account_of(&self, secret: &SecretKey) -> AppResult<String> {
        self.secrets
            .get(secret.expose())
            .cloned()
            .ok_or_else(|| LedgerError::InvalidKey("unknown signer".to_string()).into())
    }

    fn new_account(&mut self) -> KeyPair {
        self.next_id += 1;
        let account_id = format!("GACCOUNT{}", self.next_id);
        let secret = format!("SSECRET{}", self.next_id);
        self.secrets.insert(secret.clone(), account_id.clone());
        KeyPair {
            account_id,
            secret: SecretKey::new(secret),
        }
    }

    fn record_history(&mut self, payment: LedgerPayment) {
        self.history.push((payment.from.clone(), payment.clone()));
        if payment.to != payment.from {
            self.history.push((payment.to.clone(), payment));
        }
    }
}

#[derive(Clone, Default)]
pub struct RecordingGateway {
    state: Arc<Mutex<LedgerState>>,
}

impl RecordingGateway {
    pub fn new() -> Self {
        let gateway = Self::default();
        gateway
            .state
            .lock()
            .secrets
            .insert("SINSTALLATION".to_string(), INSTALLATION_ACCOUNT.to_string());
        gateway
    }

    pub fn calls(&self) -> Vec<GatewayCall> {
        self.state.lock().calls.clone()
    }

    pub fn clear_calls(&self) {
        self.state.lock().calls.clear();
    }

    pub fn payments(&self) -> Vec<GatewayCall> {
        self.calls()
            .into_iter()
            .filter(|call| matches!(call, GatewayCall::Payment { .. }))
            .collect()
    }

    /// The next `count` payment submissions fail without touching balances
    pub fn fail_next_payments(&self, count: usize) {
        self.state.lock().failing_payments = count;
    }

    /// The next `count` payment feeds yield an error and end
    pub fn fail_next_streams(&self, count: usize) {
        self.state.lock().failing_streams = count;
    }

    /// Registers an externally created account and returns its signer
    pub fn register_account(&self, account_id: &str) -> SecretKey {
        let secret = format!("S{}", account_id);
        self.state
            .lock()
            .secrets
            .insert(secret.clone(), account_id.to_string());
        SecretKey::new(secret)
    }

    pub fn trust(&self, trustor: &str, asset_code: &str, issuer: &str) -> Decimal {
        self.state
            .lock()
            .trust
            .get(&(trustor.to_string(), asset_code.to_string(), issuer.to_string()))
            .copied()
            .unwrap_or(Decimal::ZERO)
    }

    pub fn held(&self, holder: &str, asset_code: &str, issuer: &str) -> Decimal {
        self.state
            .lock()
            .balances
            .get(&(holder.to_string(), asset_code.to_string(), issuer.to_string()))
            .copied()
            .unwrap_or(Decimal::ZERO)
    }

    /// Simulates a payment made outside the bridge and returns its paging token
    pub fn push_external_payment(
        &self,
        from: &str,
        to: &str,
        asset: Option<IssuedAsset>,
        amount: Decimal,
    ) -> String {
        let mut state = self.state.lock();
        state.next_id += 1;
        let paging_token = state.next_id.to_string();
        state.record_history(LedgerPayment {
            paging_token: paging_token.clone(),
            from: from.to_string(),
            to: to.to_string(),
            asset,
            amount,
        });
        paging_token
    }

    fn apply_payment(state: &mut LedgerState, source: &str, payment: &PaymentOrder) -> AppResult<()> {
        let asset = &payment.asset;
        let destination = payment.destination.public_key.as_str();
        let amount = payment.amount;

        if source != asset.issuer {
            let key = (source.to_string(), asset.code.clone(), asset.issuer.clone());
            let held = state.balances.get(&key).copied().unwrap_or(Decimal::ZERO);
            if held < amount {
                return Err(LedgerError::failed("submit_payment", "underfunded").into());
            }
        }
        if destination != asset.issuer {
            let key = (destination.to_string(), asset.code.clone(), asset.issuer.clone());
            let limit = state.trust.get(&key).copied().unwrap_or(Decimal::ZERO);
            let held = state.balances.get(&key).copied().unwrap_or(Decimal::ZERO);
            if held + amount > limit {
                return Err(LedgerError::failed("submit_payment", "line full").into());
            }
        }

        if source != asset.issuer {
            let key = (source.to_string(), asset.code.clone(), asset.issuer.clone());
            *state.balances.entry(key).or_default() -= amount;
        }
        if destination != asset.issuer {
            let key = (destination.to_string(), asset.code.clone(), asset.issuer.clone());
            *state.balances.entry(key).or_default() += amount;
        }
        Ok(())
    }
}

#[async_trait]
impl LedgerGateway for RecordingGateway {
    fn installation_account(&self) -> LedgerAccountId {
        LedgerAccountId::main_account(INSTALLATION_ACCOUNT)
    }

    async fn create_account(&self) -> AppResult<KeyPair> {
        let mut state = self.state.lock();
        let keypair = state.new_account();
        state
            .calls
            .push(GatewayCall::CreateAccount(keypair.account_id.clone()));
        Ok(keypair)
    }

    async fn create_vault_account(&self) -> AppResult<KeyPair> {
        let mut state = self.state.lock();
        let keypair = state.new_account();
        state
            .calls
            .push(GatewayCall::CreateVaultAccount(keypair.account_id.clone()));
        Ok(keypair)
    }

    async fn set_trust_line_size(
        &self,
        signer: &SecretKey,
        issuer: &LedgerAccountId,
        asset_code: &str,
        max_amount: Decimal,
    ) -> AppResult<()> {
        let mut state = self.state.lock();
        let trustor = state.account_of(signer)?;
        let key = (trustor.clone(), asset_code.to_string(), issuer.public_key.clone());

        let held = state.balances.get(&key).copied().unwrap_or(Decimal::ZERO);
        if max_amount < held {
            return Err(LedgerError::failed("set_trust_line_size", "limit below balance").into());
        }

        state.trust.insert(key, max_amount);
        state.calls.push(GatewayCall::SetTrustLine {
            trustor,
            issuer: issuer.public_key.clone(),
            asset_code: asset_code.to_string(),
            limit: max_amount,
        });
        Ok(())
    }

    async fn submit_payment(&self, payment: &PaymentOrder) -> AppResult<String> {
        let mut state = self.state.lock();
        let source = state.account_of(&payment.signer)?;

        if state.failing_payments > 0 {
            state.failing_payments -= 1;
            return Err(LedgerError::failed("submit_payment", "injected failure").into());
        }

        Self::apply_payment(&mut state, &source, payment)?;

        state.next_id += 1;
        let paging_token = state.next_id.to_string();
        state.record_history(LedgerPayment {
            paging_token: paging_token.clone(),
            from: source.clone(),
            to: payment.destination.public_key.clone(),
            asset: Some(payment.asset.clone()),
            amount: payment.amount,
        });
        state.calls.push(GatewayCall::Payment {
            source,
            destination: payment.destination.clone(),
            asset: payment.asset.clone(),
            amount: payment.amount,
        });
        Ok(format!("tx{}", paging_token))
    }

    async fn get_balance(&self, account: &LedgerAccountId, asset_code: &str) -> AppResult<Decimal> {
        let state = self.state.lock();
        Ok(state
            .balances
            .iter()
            .filter(|((holder, code, _), _)| holder == &account.public_key && code == asset_code)
            .map(|(_, amount)| *amount)
            .sum())
    }

    async fn get_balance_by_issuer(
        &self,
        account: &LedgerAccountId,
        asset_code: &str,
        issuer: &LedgerAccountId,
    ) -> AppResult<Decimal> {
        Ok(self.held(&account.public_key, asset_code, &issuer.public_key))
    }

    async fn currency_trust_size(
        &self,
        trustor: &LedgerAccountId,
        asset_code: &str,
        issuer: &LedgerAccountId,
    ) -> AppResult<Decimal> {
        Ok(self.trust(&trustor.public_key, asset_code, &issuer.public_key))
    }

    async fn account_balances(&self, account: &LedgerAccountId) -> AppResult<Vec<AssetBalance>> {
        let state = self.state.lock();
        let mut lines: Vec<AssetBalance> = state
            .trust
            .iter()
            .filter(|((trustor, _, _), _)| trustor == &account.public_key)
            .map(|(key, limit)| AssetBalance {
                asset: Some(IssuedAsset::new(key.1.clone(), key.2.clone())),
                balance: state.balances.get(key).copied().unwrap_or(Decimal::ZERO),
                limit: Some(*limit),
            })
            .collect();
        lines.sort_by(|a, b| format!("{:?}", a.asset).cmp(&format!("{:?}", b.asset)));
        Ok(lines)
    }

    async fn latest_paging_token(&self, _account: &LedgerAccountId) -> AppResult<String> {
        Ok(self.state.lock().next_id.to_string())
    }

    async fn subscribe_payments(
        &self,
        account: &LedgerAccountId,
        cursor: Option<String>,
    ) -> AppResult<PaymentStream> {
        let state = self.state.clone();
        let account = account.public_key.clone();

        let (start, failing) = {
            let mut guard = state.lock();
            let start = match cursor {
                Some(cursor) => cursor.parse::<u64>().unwrap_or(0),
                None => guard.next_id,
            };
            let failing = guard.failing_streams > 0;
            if failing {
                guard.failing_streams -= 1;
            }
            (start, failing)
        };

        if failing {
            let error: AppResult<LedgerPayment> =
                Err(LedgerError::failed("subscribe_payments", "injected disconnect").into());
            return Ok(Box::pin(stream::iter(vec![error])));
        }

        let stream = stream::unfold(start, move |last_seen| {
            let state = state.clone();
            let account = account.clone();
            async move {
                loop {
                    let next = state
                        .lock()
                        .history
                        .iter()
                        .filter(|(owner, _)| owner == &account)
                        .map(|(_, payment)| payment)
                        .find(|payment| {
                            payment.paging_token.parse::<u64>().unwrap_or(0) > last_seen
                        })
                        .cloned();
                    match next {
                        Some(payment) => {
                            let token = payment.paging_token.parse::<u64>().unwrap_or(last_seen);
                            return Some((Ok(payment), token));
                        }
                        None => tokio::time::sleep(Duration::from_millis(5)).await,
                    }
                }
            }
        });

        Ok(Box::pin(stream))
    }
}
