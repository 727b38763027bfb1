use axum::{async_trait, extract::FromRequestParts, http::request::Parts};

use super::handler::AppState;
use crate::error::{AppError, BridgeError};
use crate::store::models::BridgeAccount;

pub const API_KEY_HEADER: &str = "x-stellar-bridge-api-key";
pub const TENANT_HEADER: &str = "x-mifos-platform-tenantid";

/// The tenant named by `X-Mifos-Platform-TenantId`, not yet authenticated
#[derive(Debug, Clone)]
pub struct TenantId(pub String);

/// A tenant whose API key matched its bridge account
#[derive(Debug, Clone)]
pub struct AuthenticatedTenant(pub BridgeAccount);

fn header_value(parts: &Parts, name: &str) -> Option<String> {
    parts
        .headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
}

#[async_trait]
impl<S: Send + Sync> FromRequestParts<S> for TenantId {
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        header_value(parts, TENANT_HEADER)
            .map(TenantId)
            .ok_or_else(|| AppError::InvalidInput("Missing X-Mifos-Platform-TenantId header".to_string()))
    }
}

#[async_trait]
impl FromRequestParts<AppState> for AuthenticatedTenant {
    type Rejection = AppError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let (Some(tenant_id), Some(api_key)) = (
            header_value(parts, TENANT_HEADER),
            header_value(parts, API_KEY_HEADER),
        ) else {
            return Err(BridgeError::Unauthorized.into());
        };

        let bridge = state
            .service
            .accounts()
            .authenticate(&tenant_id, &api_key)
            .await?;
        Ok(AuthenticatedTenant(bridge))
    }
}
