use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::FederationError;

const VAULT_MARKER: &str = "vault";
const MAX_DOMAIN_LENGTH: usize = 253;
const MAX_LABEL_LENGTH: usize = 63;

/// What the name part of an address points at
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum AddressTarget {
    /// `tenant*domain`
    Main,
    /// `tenant:subaccount*domain`
    SubAccount(String),
    /// `tenant:vault*domain`
    Vault,
}

/// A routable `name*domain` address. Not persisted.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FederationAddress {
    tenant: String,
    target: AddressTarget,
    domain: String,
}

impl FederationAddress {
    pub fn parse(text: &str) -> Result<Self, FederationError> {
        let invalid = || FederationError::InvalidAddress(text.to_string());

        let (name, domain) = text.split_once('*').ok_or_else(invalid)?;
        if domain.contains('*') {
            return Err(invalid());
        }

        let domain = normalize_domain(domain).ok_or_else(invalid)?;

        let (tenant, target) = match name.split_once(':') {
            None => (name, AddressTarget::Main),
            Some((tenant, suffix)) => {
                // vault and sub-account markers are mutually exclusive
                if suffix.is_empty() || suffix.contains(':') {
                    return Err(invalid());
                }
                if suffix == VAULT_MARKER {
                    (tenant, AddressTarget::Vault)
                } else {
                    (tenant, AddressTarget::SubAccount(suffix.to_string()))
                }
            }
        };

        if tenant.is_empty() || !is_valid_name_part(tenant) {
            return Err(invalid());
        }
        if let AddressTarget::SubAccount(sub) = &target {
            if !is_valid_name_part(sub) {
                return Err(invalid());
            }
        }

        Ok(Self {
            tenant: tenant.to_string(),
            target,
            domain,
        })
    }

    pub fn main(tenant: &str, domain: &str) -> Result<Self, FederationError> {
        Self::parse(&format!("{}*{}", tenant, domain))
    }

    pub fn vault(tenant: &str, domain: &str) -> Result<Self, FederationError> {
        Self::parse(&format!("{}:{}*{}", tenant, VAULT_MARKER, domain))
    }

    pub fn tenant(&self) -> &str {
        &self.tenant
    }

    pub fn domain(&self) -> &str {
        &self.domain
    }

    pub fn target(&self) -> &AddressTarget {
        &self.target
    }

    pub fn is_vault_address(&self) -> bool {
        self.target == AddressTarget::Vault
    }

    pub fn sub_account(&self) -> Option<&str> {
        match &self.target {
            AddressTarget::SubAccount(sub) => Some(sub),
            _ => None,
        }
    }
}

impl fmt::Display for FederationAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.target {
            AddressTarget::Main => write!(f, "{}*{}", self.tenant, self.domain),
            AddressTarget::SubAccount(sub) => {
                write!(f, "{}:{}*{}", self.tenant, sub, self.domain)
            }
            AddressTarget::Vault => {
                write!(f, "{}:{}*{}", self.tenant, VAULT_MARKER, self.domain)
            }
        }
    }
}

impl FromStr for FederationAddress {
    type Err = FederationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl Serialize for FederationAddress {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for FederationAddress {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        Self::parse(&text).map_err(serde::de::Error::custom)
    }
}

fn is_valid_name_part(part: &str) -> bool {
    !part
        .chars()
        .any(|c| c.is_whitespace() || c.is_control() || c == '*' || c == ':')
}

/// Lower-cases and validates an internet domain name. Returns `None` when the
/// text is not a syntactically valid domain.
pub fn normalize_domain(text: &str) -> Option<String> {
    let domain = text.to_ascii_lowercase();
    if domain.is_empty() || domain.len() > MAX_DOMAIN_LENGTH {
        return None;
    }

    let labels: Vec<&str> = domain.split('.').collect();
    for label in &labels {
        if label.is_empty() || label.len() > MAX_LABEL_LENGTH {
            return None;
        }
        if label.starts_with('-') || label.ends_with('-') {
            return None;
        }
        if !label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-') {
            return None;
        }
    }

    // A numeric top-level label would make this an IP address, not a domain.
    let tld = labels.last()?;
    if tld.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }

    Some(domain)
}

/// A ledger account, optionally qualified by a sub-account discriminator
/// (carried as a memo on the wire).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LedgerAccountId {
    pub public_key: String,
    pub sub_account: Option<String>,
}

impl LedgerAccountId {
    pub fn main_account(public_key: impl Into<String>) -> Self {
        Self {
            public_key: public_key.into(),
            sub_account: None,
        }
    }

    pub fn sub_account(public_key: impl Into<String>, sub_account: impl Into<String>) -> Self {
        Self {
            public_key: public_key.into(),
            sub_account: Some(sub_account.into()),
        }
    }

    pub fn is_top_level(&self) -> bool {
        self.sub_account.is_none()
    }

    /// Numeric sub-accounts travel as an id memo, anything else as text
    pub fn memo(&self) -> Option<SubAccountMemo<'_>> {
        self.sub_account
            .as_deref()
            .map(|sub| match sub.parse::<u64>() {
                Ok(id) => SubAccountMemo::Id(id),
                Err(_) => SubAccountMemo::Text(sub),
            })
    }
}

/// Wire form of a sub-account discriminator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubAccountMemo<'a> {
    Id(u64),
    Text(&'a str),
}

impl SubAccountMemo<'_> {
    /// Memo type as named in federation answers
    pub fn memo_type(&self) -> &'static str {
        match self {
            SubAccountMemo::Id(_) => "id",
            SubAccountMemo::Text(_) => "text",
        }
    }
}

impl fmt::Display for LedgerAccountId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.sub_account {
            Some(sub) => write!(f, "{}:{}", self.public_key, sub),
            None => write!(f, "{}", self.public_key),
        }
    }
}
