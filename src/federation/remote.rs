use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, instrument};

use super::address::{FederationAddress, LedgerAccountId};
use super::FederationRecord;
use crate::error::{AppResult, FederationError};

const STELLAR_TOML_PATH: &str = "/.well-known/stellar.toml";

#[derive(Debug, Deserialize)]
struct StellarToml {
    #[serde(rename = "FEDERATION_SERVER")]
    federation_server: Option<String>,
}

/// Client side of the federation protocol for domains other than our own:
/// `https://<domain>/.well-known/stellar.toml` names the federation server,
/// which is then asked `?type=name&q=<address>`.
pub struct RemoteFederationClient {
    client: reqwest::Client,
    scheme: String,
}

impl RemoteFederationClient {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(10))
                .build()
                .unwrap_or_default(),
            scheme: "https".to_string(),
        }
    }

    #[instrument(skip(self, address), fields(address = %address))]
    pub async fn resolve(&self, address: &FederationAddress) -> AppResult<LedgerAccountId> {
        let server = self.federation_server(address).await?;

        let record = self
            .client
            .get(&server)
            .query(&[("type", "name"), ("q", &address.to_string())])
            .send()
            .await
            .and_then(|response| response.error_for_status())
            .map_err(|e| lookup_failed(address, e.to_string()))?
            .json::<FederationRecord>()
            .await
            .map_err(|e| lookup_failed(address, e.to_string()))?;

        debug!("Remote federation resolved {} to {}", address, record.account_id);
        Ok(record.ledger_account())
    }

    async fn federation_server(&self, address: &FederationAddress) -> AppResult<String> {
        let url = format!("{}://{}{}", self.scheme, address.domain(), STELLAR_TOML_PATH);
        let body = self
            .client
            .get(&url)
            .send()
            .await
            .and_then(|response| response.error_for_status())
            .map_err(|e| lookup_failed(address, e.to_string()))?
            .text()
            .await
            .map_err(|e| lookup_failed(address, e.to_string()))?;

        parse_federation_server(&body).ok_or_else(|| {
            lookup_failed(address, "stellar.toml has no FEDERATION_SERVER".to_string()).into()
        })
    }
}

impl Default for RemoteFederationClient {
    fn default() -> Self {
        Self::new()
    }
}

fn parse_federation_server(stellar_toml: &str) -> Option<String> {
    toml::from_str::<StellarToml>(stellar_toml)
        .ok()?
        .federation_server
        .filter(|server| !server.trim().is_empty())
}

fn lookup_failed(address: &FederationAddress, message: String) -> FederationError {
    FederationError::RemoteLookupFailed {
        address: address.to_string(),
        message,
    }
}
