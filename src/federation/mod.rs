pub mod address;
pub mod remote;
pub mod resolver;

use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::error::AppResult;
use address::{FederationAddress, LedgerAccountId};

pub use remote::RemoteFederationClient;
pub use resolver::FederationResolver;

/// Answer to a `type=name` federation query
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FederationRecord {
    pub stellar_address: String,
    pub account_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memo_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memo: Option<String>,
}

impl FederationRecord {
    pub fn new(address: &FederationAddress, account: &LedgerAccountId) -> Self {
        Self {
            stellar_address: address.to_string(),
            account_id: account.public_key.clone(),
            memo_type: account.memo().map(|memo| memo.memo_type().to_string()),
            memo: account.sub_account.clone(),
        }
    }

    pub fn ledger_account(&self) -> LedgerAccountId {
        LedgerAccountId {
            public_key: self.account_id.clone(),
            sub_account: self.memo.clone().filter(|memo| !memo.is_empty()),
        }
    }
}

/// Routes payment destinations: addresses under the local domain resolve
/// against the bridge's own accounts, everything else goes over the wire.
pub struct Federation {
    local: Arc<FederationResolver>,
    remote: RemoteFederationClient,
}

impl Federation {
    pub fn new(local: Arc<FederationResolver>, remote: RemoteFederationClient) -> Self {
        Self { local, remote }
    }

    pub fn local(&self) -> &FederationResolver {
        &self.local
    }

    pub async fn resolve_destination(
        &self,
        address: &FederationAddress,
    ) -> AppResult<LedgerAccountId> {
        if self.local.handles_domain(address.domain()) {
            self.local.resolve(address).await
        } else {
            self.remote.resolve(address).await
        }
    }
}
