use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use validator::{Validate, ValidationError};

use crate::error::{AppError, AppResult};
use crate::federation::address::FederationAddress;
use crate::relay::PaymentInstruction;
use crate::store::models::PaymentRelayEntry;

fn positive_amount(amount: &Decimal) -> Result<(), ValidationError> {
    if *amount > Decimal::ZERO {
        Ok(())
    } else {
        Err(ValidationError::new("amount_not_positive"))
    }
}

fn non_negative_amount(amount: &Decimal) -> Result<(), ValidationError> {
    if *amount >= Decimal::ZERO {
        Ok(())
    } else {
        Err(ValidationError::new("amount_negative"))
    }
}

fn asset_code(code: &str) -> Result<(), ValidationError> {
    if !code.is_empty() && code.len() <= 12 && code.chars().all(|c| c.is_ascii_alphanumeric()) {
        Ok(())
    } else {
        Err(ValidationError::new("invalid_asset_code"))
    }
}

fn federation_address(address: &str) -> Result<(), ValidationError> {
    FederationAddress::parse(address)
        .map(|_| ())
        .map_err(|_| ValidationError::new("invalid_federation_address"))
}

fn parse_address(address: &str) -> AppResult<FederationAddress> {
    Ok(FederationAddress::parse(address)?)
}

// ========== REQUEST MODELS ==========

/// Body of `POST /modules/stellar/bridge`
#[derive(Debug, Deserialize, Validate)]
pub struct CreateBridgeRequest {
    /// Credential the bridge presents to core banking for this tenant
    #[validate(length(min = 1, message = "must not be empty"))]
    pub access_token: String,
}

#[derive(Debug, Deserialize, Validate)]
pub struct TrustlineRequest {
    #[validate(custom = "non_negative_amount")]
    pub max_amount: Decimal,
}

#[derive(Debug, Deserialize, Validate)]
pub struct VaultSizeRequest {
    #[validate(custom = "non_negative_amount")]
    pub amount: Decimal,
}

/// Payment in the bridge's own format
#[derive(Debug, Deserialize, Validate)]
pub struct PaymentRequest {
    #[validate(custom = "asset_code")]
    pub asset_code: String,
    #[validate(custom = "positive_amount")]
    pub amount: Decimal,
    #[validate(custom = "federation_address")]
    pub destination_address: String,
    #[validate(custom = "federation_address")]
    pub issuer_address: Option<String>,
}

impl PaymentRequest {
    pub fn into_instruction(self, source_tenant: &str) -> AppResult<PaymentInstruction> {
        Ok(PaymentInstruction {
            asset_code: self.asset_code,
            amount: self.amount,
            source_tenant: source_tenant.to_string(),
            destination_address: parse_address(&self.destination_address)?,
            issuer_address: self
                .issuer_address
                .as_deref()
                .map(parse_address)
                .transpose()?,
        })
    }
}

/// Journal entry pushed by core banking when a transfer is booked. The
/// payment details carry the destination: bank number is the federation
/// domain, account number the name.
#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct JournalEntryRequest {
    #[validate]
    pub currency: JournalCurrency,
    #[validate(custom = "positive_amount")]
    pub amount: Decimal,
    #[validate]
    pub transaction_details: JournalTransactionDetails,
}

#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct JournalCurrency {
    #[validate(custom = "asset_code")]
    pub code: String,
}

#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct JournalTransactionDetails {
    #[validate]
    pub payment_details: JournalPaymentDetails,
}

#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct JournalPaymentDetails {
    #[validate(length(min = 1, message = "must name the destination account"))]
    pub account_number: String,
    #[validate(length(min = 1, message = "must name the destination domain"))]
    pub bank_number: String,
}

impl JournalEntryRequest {
    pub fn into_instruction(self, source_tenant: &str) -> AppResult<PaymentInstruction> {
        let details = self.transaction_details.payment_details;
        let destination = format!("{}*{}", details.account_number.trim(), details.bank_number.trim());
        let destination_address = FederationAddress::parse(&destination).map_err(|_| {
            AppError::InvalidInput(format!(
                "Journal entry does not name a valid destination: {}",
                destination
            ))
        })?;

        Ok(PaymentInstruction {
            asset_code: self.currency.code,
            amount: self.amount,
            source_tenant: source_tenant.to_string(),
            destination_address,
            issuer_address: None,
        })
    }
}

#[derive(Debug, Deserialize)]
pub struct FederationQuery {
    #[serde(rename = "type")]
    pub query_type: String,
    pub q: String,
}

// ========== RESPONSE MODELS ==========

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub timestamp: DateTime<Utc>,
    pub federation_domain: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct CreateBridgeResponse {
    pub tenant_id: String,
    pub api_key: String,
}

#[derive(Debug, Serialize)]
pub struct PaymentAccepted {
    pub payment_id: i64,
}

#[derive(Debug, Serialize)]
pub struct BalanceResponse {
    pub asset_code: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub issuer: Option<String>,
    pub balance: Decimal,
}

#[derive(Debug, Serialize)]
pub struct VaultResponse {
    pub asset_code: String,
    pub has_vault: bool,
    pub issued_amount: Decimal,
}

/// Relay entry whose retry budget ran out
#[derive(Debug, Serialize)]
pub struct FailedPayment {
    pub id: i64,
    pub instruction: Option<PaymentInstruction>,
    pub payload: String,
    pub created_on: DateTime<Utc>,
    pub last_modified_on: DateTime<Utc>,
}

impl From<PaymentRelayEntry> for FailedPayment {
    fn from(entry: PaymentRelayEntry) -> Self {
        Self {
            id: entry.id,
            instruction: serde_json::from_str(&entry.payload).ok(),
            payload: entry.payload,
            created_on: entry.created_on,
            last_modified_on: entry.last_modified_on,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::middleware::validate;
    use rust_decimal_macros::dec;

    fn journal_entry(account: &str, bank: &str, amount: &str) -> JournalEntryRequest {
        serde_json::from_value(serde_json::json!({
            "currency": { "code": "USD", "decimalPlaces": 2 },
            "amount": amount,
            "transactionDetails": {
                "paymentDetails": { "accountNumber": account, "bankNumber": bank }
            }
        }))
        .unwrap()
    }

    #[test]
    fn test_journal_entry_becomes_payment_instruction() {
        let entry = journal_entry("bob", "test.org", "12.50");
        assert!(validate(&entry).is_ok());

        let instruction = entry.into_instruction("alice").unwrap();
        assert_eq!(instruction.asset_code, "USD");
        assert_eq!(instruction.amount, dec!(12.50));
        assert_eq!(instruction.source_tenant, "alice");
        assert_eq!(instruction.destination_address.to_string(), "bob*test.org");
        assert!(instruction.issuer_address.is_none());
    }

    #[test]
    fn test_journal_entry_without_destination_is_rejected() {
        assert!(validate(&journal_entry("", "test.org", "1")).is_err());
        assert!(validate(&journal_entry("bob", "test.org", "0")).is_err());
        assert!(journal_entry("bob", "not a domain", "1")
            .into_instruction("alice")
            .is_err());
    }

    #[test]
    fn test_payment_request_validation() {
        let request = PaymentRequest {
            asset_code: "USD".to_string(),
            amount: dec!(5),
            destination_address: "bob*test.org".to_string(),
            issuer_address: Some("alice:vault*test.org".to_string()),
        };
        assert!(validate(&request).is_ok());
        let instruction = request.into_instruction("alice").unwrap();
        assert!(instruction.issuer_address.unwrap().is_vault_address());

        let bad = PaymentRequest {
            asset_code: "US D".to_string(),
            amount: dec!(-1),
            destination_address: "nobody".to_string(),
            issuer_address: None,
        };
        let err = validate(&bad).unwrap_err().to_string();
        assert!(err.contains("asset_code"));
        assert!(err.contains("amount"));
        assert!(err.contains("destination_address"));
    }
}
