use async_trait::async_trait;
use base64::Engine;
use ed25519_dalek::{Signer, SigningKey};
use futures::stream;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use std::collections::VecDeque;
use std::time::Duration;
use stellar_xdr::curr::{
    AccountId, AlphaNum12, AlphaNum4, Asset, AssetCode12, AssetCode4, ChangeTrustAsset,
    ChangeTrustOp, CreateAccountOp, DecoratedSignature, Hash, Limits, Memo, MuxedAccount,
    Operation, OperationBody, PaymentOp, Preconditions, PublicKey, SequenceNumber, Signature,
    SignatureHint, Transaction, TransactionEnvelope, TransactionExt, TransactionSignaturePayload,
    TransactionSignaturePayloadTaggedTransaction, TransactionV1Envelope, Uint256, WriteXdr,
};
use tracing::{debug, info, instrument, warn};

use super::{
    AssetBalance, IssuedAsset, KeyPair, LedgerGateway, LedgerPayment, PaymentOrder,
    PaymentStream, SecretKey,
};
use crate::error::{AppResult, LedgerError};
use crate::federation::address::{LedgerAccountId, SubAccountMemo};
use crate::locks::KeyedLocks;

const STROOPS_PER_UNIT: Decimal = dec!(10000000);
const BASE_FEE: u32 = 100;
const PAGE_LIMIT: usize = 200;

#[derive(Debug, Clone)]
pub struct HorizonConfig {
    pub horizon_url: String,
    pub network_passphrase: String,
    pub installation_account_secret: SecretKey,
    pub new_account_starting_balance: Decimal,
    pub vault_account_starting_balance: Decimal,
    pub poll_interval: Duration,
}

/// Signing material decoded from a strkey seed
struct Signer25519 {
    signing_key: SigningKey,
    public_key: [u8; 32],
}

impl Signer25519 {
    fn from_secret(secret: &SecretKey) -> AppResult<Self> {
        let seed = stellar_strkey::ed25519::PrivateKey::from_string(secret.expose())
            .map_err(|_| LedgerError::InvalidKey("malformed secret seed".to_string()))?;
        let signing_key = SigningKey::from_bytes(&seed.0);
        let public_key = signing_key.verifying_key().to_bytes();
        Ok(Self {
            signing_key,
            public_key,
        })
    }

    fn account_id(&self) -> String {
        stellar_strkey::ed25519::PublicKey(self.public_key).to_string()
    }

    fn decorated_signature(&self, message: &[u8]) -> AppResult<DecoratedSignature> {
        let signature = self.signing_key.sign(message).to_bytes();
        let mut hint = [0u8; 4];
        hint.copy_from_slice(&self.public_key[28..32]);
        Ok(DecoratedSignature {
            hint: SignatureHint(hint),
            signature: Signature(
                signature
                    .to_vec()
                    .try_into()
                    .map_err(|_| LedgerError::failed("sign", "signature length"))?,
            ),
        })
    }
}

// ========== HORIZON RESPONSE MODELS ==========

#[derive(Debug, Deserialize)]
struct HorizonAccount {
    sequence: String,
    balances: Vec<HorizonBalance>,
}

#[derive(Debug, Deserialize)]
struct HorizonBalance {
    balance: Decimal,
    limit: Option<Decimal>,
    asset_type: String,
    asset_code: Option<String>,
    asset_issuer: Option<String>,
}

impl From<HorizonBalance> for AssetBalance {
    fn from(balance: HorizonBalance) -> Self {
        let asset = match (balance.asset_type.as_str(), balance.asset_code, balance.asset_issuer) {
            ("native", _, _) => None,
            (_, Some(code), Some(issuer)) => Some(IssuedAsset::new(code, issuer)),
            _ => None,
        };
        AssetBalance {
            asset,
            balance: balance.balance,
            limit: balance.limit,
        }
    }
}

#[derive(Debug, Deserialize)]
struct HorizonPage<T> {
    #[serde(rename = "_embedded")]
    embedded: HorizonRecords<T>,
}

#[derive(Debug, Deserialize)]
struct HorizonRecords<T> {
    records: Vec<T>,
}

#[derive(Debug, Deserialize)]
struct HorizonPaymentRecord {
    paging_token: String,
    #[serde(rename = "type")]
    kind: String,
    from: Option<String>,
    to: Option<String>,
    asset_type: Option<String>,
    asset_code: Option<String>,
    asset_issuer: Option<String>,
    amount: Option<Decimal>,
}

impl HorizonPaymentRecord {
    fn into_payment(self) -> Option<LedgerPayment> {
        if self.kind != "payment" {
            return None;
        }
        let asset = match (self.asset_type.as_deref(), self.asset_code, self.asset_issuer) {
            (Some("native"), _, _) => None,
            (_, Some(code), Some(issuer)) => Some(IssuedAsset::new(code, issuer)),
            _ => None,
        };
        Some(LedgerPayment {
            paging_token: self.paging_token,
            from: self.from?,
            to: self.to?,
            asset,
            amount: self.amount?,
        })
    }
}

#[derive(Debug, Deserialize)]
struct SubmitResponse {
    hash: String,
}

// ========== GATEWAY ==========

/// `LedgerGateway` backed by a Horizon server
pub struct HorizonGateway {
    config: HorizonConfig,
    client: reqwest::Client,
    installation_account: String,
    submissions: KeyedLocks,
}

impl HorizonGateway {
    pub fn new(config: HorizonConfig) -> AppResult<Self> {
        let installation_account =
            Signer25519::from_secret(&config.installation_account_secret)?.account_id();
        info!("Horizon gateway using installation account {}", installation_account);
        Ok(Self {
            config,
            client: reqwest::Client::new(),
            installation_account,
            submissions: KeyedLocks::new(),
        })
    }

    fn network_id(&self) -> Hash {
        Hash(Sha256::digest(self.config.network_passphrase.as_bytes()).into())
    }

    async fn load_account(&self, account_id: &str) -> AppResult<Option<HorizonAccount>> {
        let url = format!("{}/accounts/{}", self.config.horizon_url, account_id);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| LedgerError::failed("load_account", e.to_string()))?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            let status = response.status();
            return Err(LedgerError::failed("load_account", format!("horizon status {}", status)).into());
        }

        let account = response
            .json::<HorizonAccount>()
            .await
            .map_err(|e| LedgerError::failed("load_account", e.to_string()))?;
        Ok(Some(account))
    }

    async fn balances_of(&self, account_id: &str) -> AppResult<Vec<AssetBalance>> {
        Ok(self
            .load_account(account_id)
            .await?
            .map(|account| account.balances.into_iter().map(AssetBalance::from).collect())
            .unwrap_or_default())
    }

    /// Builds, signs and submits a single-operation transaction from the
    /// signer's account. Submissions from one source account are serialized so
    /// sequence numbers never collide.
    async fn submit(
        &self,
        operation: &str,
        signer: &SecretKey,
        body: OperationBody,
        memo: Memo,
    ) -> AppResult<String> {
        let signer = Signer25519::from_secret(signer)?;
        let source = signer.account_id();
        let _guard = self.submissions.lock(&source).await;

        let account = self
            .load_account(&source)
            .await?
            .ok_or_else(|| LedgerError::failed(operation, format!("source account {} not found", source)))?;
        let sequence: i64 = account
            .sequence
            .parse()
            .map_err(|_| LedgerError::failed(operation, "invalid sequence number"))?;

        let tx = Transaction {
            source_account: MuxedAccount::Ed25519(Uint256(signer.public_key)),
            fee: BASE_FEE,
            seq_num: SequenceNumber(sequence + 1),
            cond: Preconditions::None,
            memo,
            operations: vec![Operation {
                source_account: None,
                body,
            }]
            .try_into()
            .map_err(|_| LedgerError::failed(operation, "operation list"))?,
            ext: TransactionExt::V0,
        };

        let payload = TransactionSignaturePayload {
            network_id: self.network_id(),
            tagged_transaction: TransactionSignaturePayloadTaggedTransaction::Tx(tx.clone()),
        };
        let payload_xdr = payload
            .to_xdr(Limits::none())
            .map_err(|e| LedgerError::failed(operation, format!("xdr: {}", e)))?;
        let tx_hash: [u8; 32] = Sha256::digest(&payload_xdr).into();

        let envelope = TransactionEnvelope::Tx(TransactionV1Envelope {
            tx,
            signatures: vec![signer.decorated_signature(&tx_hash)?]
                .try_into()
                .map_err(|_| LedgerError::failed(operation, "signature list"))?,
        });
        let envelope_xdr = envelope
            .to_xdr(Limits::none())
            .map_err(|e| LedgerError::failed(operation, format!("xdr: {}", e)))?;
        let encoded = base64::engine::general_purpose::STANDARD.encode(envelope_xdr);

        let response = self
            .client
            .post(format!("{}/transactions", self.config.horizon_url))
            .form(&[("tx", encoded)])
            .send()
            .await
            .map_err(|e| LedgerError::failed(operation, e.to_string()))?;

        if !response.status().is_success() {
            let error_text = response.text().await.unwrap_or_default();
            return Err(LedgerError::failed(operation, error_text).into());
        }

        let submitted = response
            .json::<SubmitResponse>()
            .await
            .map_err(|e| LedgerError::failed(operation, e.to_string()))?;

        debug!(
            "{} submitted from {} (local hash {})",
            operation,
            source,
            hex::encode(tx_hash)
        );
        Ok(submitted.hash)
    }

    async fn create_funded_account(&self, starting_balance: Decimal) -> AppResult<KeyPair> {
        let seed: [u8; 32] = rand::random();
        let signing_key = SigningKey::from_bytes(&seed);
        let public_key = signing_key.verifying_key().to_bytes();

        let body = OperationBody::CreateAccount(CreateAccountOp {
            destination: account_id_from_bytes(public_key),
            starting_balance: to_stroops(starting_balance)?,
        });
        self.submit(
            "create_account",
            &self.config.installation_account_secret,
            body,
            Memo::None,
        )
        .await?;

        Ok(KeyPair {
            account_id: stellar_strkey::ed25519::PublicKey(public_key).to_string(),
            secret: SecretKey::new(stellar_strkey::ed25519::PrivateKey(seed).to_string()),
        })
    }
}

#[async_trait]
impl LedgerGateway for HorizonGateway {
    fn installation_account(&self) -> LedgerAccountId {
        LedgerAccountId::main_account(self.installation_account.clone())
    }

    #[instrument(skip(self))]
    async fn create_account(&self) -> AppResult<KeyPair> {
        let keypair = self
            .create_funded_account(self.config.new_account_starting_balance)
            .await?;
        info!("✓ Ledger account created: {}", keypair.account_id);
        Ok(keypair)
    }

    #[instrument(skip(self))]
    async fn create_vault_account(&self) -> AppResult<KeyPair> {
        let keypair = self
            .create_funded_account(self.config.vault_account_starting_balance)
            .await?;
        info!("✓ Vault account created: {}", keypair.account_id);
        Ok(keypair)
    }

    #[instrument(skip(self, signer))]
    async fn set_trust_line_size(
        &self,
        signer: &SecretKey,
        issuer: &LedgerAccountId,
        asset_code: &str,
        max_amount: Decimal,
    ) -> AppResult<()> {
        let line = match credit_asset(asset_code, &issuer.public_key)? {
            Asset::CreditAlphanum4(asset) => ChangeTrustAsset::CreditAlphanum4(asset),
            Asset::CreditAlphanum12(asset) => ChangeTrustAsset::CreditAlphanum12(asset),
            _ => return Err(LedgerError::failed("set_trust_line_size", "native asset").into()),
        };
        let body = OperationBody::ChangeTrust(ChangeTrustOp {
            line,
            limit: to_stroops(max_amount)?,
        });
        self.submit("set_trust_line_size", signer, body, Memo::None)
            .await?;
        Ok(())
    }

    #[instrument(skip(self, payment), fields(destination = %payment.destination, amount = %payment.amount))]
    async fn submit_payment(&self, payment: &PaymentOrder) -> AppResult<String> {
        let destination = account_bytes(&payment.destination.public_key)?;
        let body = OperationBody::Payment(PaymentOp {
            destination: MuxedAccount::Ed25519(Uint256(destination)),
            asset: credit_asset(&payment.asset.code, &payment.asset.issuer)?,
            amount: to_stroops(payment.amount)?,
        });
        let memo = match payment.destination.memo() {
            None => Memo::None,
            Some(SubAccountMemo::Id(id)) => Memo::Id(id),
            Some(SubAccountMemo::Text(text)) => Memo::Text(
                text.as_bytes()
                    .to_vec()
                    .try_into()
                    .map_err(|_| LedgerError::failed("submit_payment", "memo too long"))?,
            ),
        };
        self.submit("submit_payment", &payment.signer, body, memo).await
    }

    async fn get_balance(&self, account: &LedgerAccountId, asset_code: &str) -> AppResult<Decimal> {
        let balances = self.balances_of(&account.public_key).await?;
        Ok(sum_balances(&balances, asset_code, None))
    }

    async fn get_balance_by_issuer(
        &self,
        account: &LedgerAccountId,
        asset_code: &str,
        issuer: &LedgerAccountId,
    ) -> AppResult<Decimal> {
        let balances = self.balances_of(&account.public_key).await?;
        Ok(sum_balances(&balances, asset_code, Some(&issuer.public_key)))
    }

    async fn currency_trust_size(
        &self,
        trustor: &LedgerAccountId,
        asset_code: &str,
        issuer: &LedgerAccountId,
    ) -> AppResult<Decimal> {
        let balances = self.balances_of(&trustor.public_key).await?;
        Ok(balances
            .iter()
            .find(|line| {
                line.asset
                    .as_ref()
                    .map(|a| a.code == asset_code && a.issuer == issuer.public_key)
                    .unwrap_or(false)
            })
            .and_then(|line| line.limit)
            .unwrap_or(Decimal::ZERO))
    }

    async fn account_balances(&self, account: &LedgerAccountId) -> AppResult<Vec<AssetBalance>> {
        self.balances_of(&account.public_key).await
    }

    async fn latest_paging_token(&self, account: &LedgerAccountId) -> AppResult<String> {
        let response = self
            .client
            .get(payments_url(&self.config.horizon_url, account))
            .query(&[("order", "desc"), ("limit", "1")])
            .send()
            .await
            .map_err(|e| LedgerError::failed("latest_paging_token", e.to_string()))?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok("0".to_string());
        }
        if !response.status().is_success() {
            let status = response.status();
            return Err(LedgerError::failed("latest_paging_token", format!("horizon status {}", status)).into());
        }

        let page = response
            .json::<HorizonPage<HorizonPaymentRecord>>()
            .await
            .map_err(|e| LedgerError::failed("latest_paging_token", e.to_string()))?;
        Ok(page
            .embedded
            .records
            .into_iter()
            .next()
            .map(|record| record.paging_token)
            .unwrap_or_else(|| "0".to_string()))
    }

    async fn subscribe_payments(
        &self,
        account: &LedgerAccountId,
        cursor: Option<String>,
    ) -> AppResult<PaymentStream> {
        // Horizon re-reads `cursor=now` on every request, so an idle poll
        // would skip whatever closed since the last one
        let cursor = match cursor {
            Some(cursor) => cursor,
            None => self.latest_paging_token(account).await?,
        };
        debug!("Polling payments of {} after {}", account.public_key, cursor);

        let poller = PaymentPoller {
            client: self.client.clone(),
            url: payments_url(&self.config.horizon_url, account),
            cursor,
            poll_interval: self.config.poll_interval,
            buffer: VecDeque::new(),
        };

        let stream = stream::unfold(poller, |mut poller| async move {
            loop {
                if let Some(payment) = poller.buffer.pop_front() {
                    return Some((Ok(payment), poller));
                }
                if let Err(e) = poller.fetch_page().await {
                    return Some((Err(e), poller));
                }
                if poller.buffer.is_empty() {
                    tokio::time::sleep(poller.poll_interval).await;
                }
            }
        });

        Ok(Box::pin(stream))
    }
}

/// Cursor-driven long poll over an account's payment history
struct PaymentPoller {
    client: reqwest::Client,
    url: String,
    cursor: String,
    poll_interval: Duration,
    buffer: VecDeque<LedgerPayment>,
}

impl PaymentPoller {
    async fn fetch_page(&mut self) -> AppResult<()> {
        let limit = PAGE_LIMIT.to_string();
        let response = self
            .client
            .get(&self.url)
            .query(&[
                ("cursor", self.cursor.as_str()),
                ("order", "asc"),
                ("limit", limit.as_str()),
            ])
            .send()
            .await
            .map_err(|e| LedgerError::failed("subscribe_payments", e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            warn!("Payment feed {} answered {}", self.url, status);
            return Err(LedgerError::failed("subscribe_payments", format!("horizon status {}", status)).into());
        }

        let page = response
            .json::<HorizonPage<HorizonPaymentRecord>>()
            .await
            .map_err(|e| LedgerError::failed("subscribe_payments", e.to_string()))?;

        for record in page.embedded.records {
            self.cursor = record.paging_token.clone();
            if let Some(payment) = record.into_payment() {
                self.buffer.push_back(payment);
            }
        }
        Ok(())
    }
}

fn payments_url(horizon_url: &str, account: &LedgerAccountId) -> String {
    format!("{}/accounts/{}/payments", horizon_url, account.public_key)
}

// ========== XDR HELPERS ==========

fn account_bytes(account_id: &str) -> AppResult<[u8; 32]> {
    stellar_strkey::ed25519::PublicKey::from_string(account_id)
        .map(|key| key.0)
        .map_err(|_| LedgerError::InvalidKey(format!("malformed account id {}", account_id)).into())
}

fn account_id_from_bytes(bytes: [u8; 32]) -> AccountId {
    AccountId(PublicKey::PublicKeyTypeEd25519(Uint256(bytes)))
}

fn credit_asset(code: &str, issuer: &str) -> AppResult<Asset> {
    let issuer = account_id_from_bytes(account_bytes(issuer)?);
    let bytes = code.as_bytes();
    match bytes.len() {
        1..=4 => {
            let mut asset_code = [0u8; 4];
            asset_code[..bytes.len()].copy_from_slice(bytes);
            Ok(Asset::CreditAlphanum4(AlphaNum4 {
                asset_code: AssetCode4(asset_code),
                issuer,
            }))
        }
        5..=12 => {
            let mut asset_code = [0u8; 12];
            asset_code[..bytes.len()].copy_from_slice(bytes);
            Ok(Asset::CreditAlphanum12(AlphaNum12 {
                asset_code: AssetCode12(asset_code),
                issuer,
            }))
        }
        _ => Err(LedgerError::failed("asset", format!("invalid asset code {}", code)).into()),
    }
}

/// Converts a decimal amount into the ledger's 7-decimal fixed point
pub fn to_stroops(amount: Decimal) -> AppResult<i64> {
    if amount.is_sign_negative() || amount.normalize().scale() > 7 {
        return Err(LedgerError::AmountOutOfRange(amount.to_string()).into());
    }
    (amount * STROOPS_PER_UNIT)
        .to_i64()
        .ok_or_else(|| LedgerError::AmountOutOfRange(amount.to_string()).into())
}

fn sum_balances(balances: &[AssetBalance], asset_code: &str, issuer: Option<&str>) -> Decimal {
    balances
        .iter()
        .filter(|line| match &line.asset {
            None => asset_code == "XLM" && issuer.is_none(),
            Some(asset) => {
                asset.code == asset_code && issuer.map(|i| i == asset.issuer).unwrap_or(true)
            }
        })
        .map(|line| line.balance)
        .sum()
}
