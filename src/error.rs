use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use sqlx::migrate::MigrateError;
use thiserror::Error;

/// Top-level error type for the entire bridge
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Federation error: {0}")]
    Federation(#[from] FederationError),

    #[error("Bridge error: {0}")]
    Bridge(#[from] BridgeError),

    #[error("Ledger error: {0}")]
    Ledger(#[from] LedgerError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Address parsing and resolution errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FederationError {
    #[error("Invalid federation address: {0}")]
    InvalidAddress(String),

    #[error("Domain {0} is not served by this federation server")]
    WrongDomain(String),

    #[error("Address not found: {0}")]
    AddressNotFound(String),

    #[error("Address {0} must resolve to a top-level account")]
    NeedsTopLevelAccount(String),

    #[error("Remote federation lookup failed for {address}: {message}")]
    RemoteLookupFailed { address: String, message: String },
}

/// Tenant and policy errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BridgeError {
    #[error("No bridge account exists for tenant {0}")]
    TenantNotFound(String),

    #[error("A bridge account already exists for tenant {0}")]
    TenantAlreadyExists(String),

    #[error("Tenant {tenant_id} may not extend a trustline to its own vault ({address})")]
    SelfReferentialTrustline { tenant_id: String, address: String },

    #[error("Tenant {tenant_id} still holds {asset_code} issued by {issuer}")]
    BalancesOutstanding {
        tenant_id: String,
        asset_code: String,
        issuer: String,
    },

    #[error("Unauthorized")]
    Unauthorized,
}

/// Errors raised by the ledger gateway
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LedgerError {
    #[error("Ledger operation {operation} failed: {message}")]
    OperationFailed { operation: String, message: String },

    #[error("Invalid key material: {0}")]
    InvalidKey(String),

    #[error("Amount {0} cannot be represented on the ledger")]
    AmountOutOfRange(String),
}

impl LedgerError {
    pub fn failed(operation: &str, message: impl Into<String>) -> Self {
        LedgerError::OperationFailed {
            operation: operation.to_string(),
            message: message.into(),
        }
    }
}

/// API error response structure
#[derive(Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub error_code: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let message = self.to_string();
        let (status, error_code, details) = match &self {
            AppError::Federation(FederationError::InvalidAddress(address)) => (
                StatusCode::NOT_FOUND,
                "INVALID_ADDRESS",
                Some(serde_json::json!({ "address": address })),
            ),
            AppError::Federation(FederationError::WrongDomain(domain)) => (
                StatusCode::NOT_FOUND,
                "WRONG_DOMAIN",
                Some(serde_json::json!({ "domain": domain })),
            ),
            AppError::Federation(FederationError::AddressNotFound(address)) => (
                StatusCode::NOT_FOUND,
                "ADDRESS_NOT_FOUND",
                Some(serde_json::json!({ "address": address })),
            ),
            AppError::Federation(FederationError::NeedsTopLevelAccount(address)) => (
                StatusCode::UNPROCESSABLE_ENTITY,
                "NEEDS_TOP_LEVEL_ACCOUNT",
                Some(serde_json::json!({ "address": address })),
            ),
            AppError::Federation(FederationError::RemoteLookupFailed { address, .. }) => (
                StatusCode::NOT_FOUND,
                "REMOTE_LOOKUP_FAILED",
                Some(serde_json::json!({ "address": address })),
            ),
            AppError::Bridge(BridgeError::TenantNotFound(tenant_id)) => (
                StatusCode::NOT_FOUND,
                "TENANT_NOT_FOUND",
                Some(serde_json::json!({ "tenant_id": tenant_id })),
            ),
            AppError::Bridge(BridgeError::TenantAlreadyExists(tenant_id)) => (
                StatusCode::CONFLICT,
                "TENANT_ALREADY_EXISTS",
                Some(serde_json::json!({ "tenant_id": tenant_id })),
            ),
            AppError::Bridge(BridgeError::SelfReferentialTrustline { address, .. }) => (
                StatusCode::UNPROCESSABLE_ENTITY,
                "SELF_REFERENTIAL_TRUSTLINE",
                Some(serde_json::json!({ "address": address })),
            ),
            AppError::Bridge(BridgeError::BalancesOutstanding {
                asset_code, issuer, ..
            }) => (
                StatusCode::CONFLICT,
                "BALANCES_OUTSTANDING",
                Some(serde_json::json!({ "asset_code": asset_code, "issuer": issuer })),
            ),
            AppError::Bridge(BridgeError::Unauthorized) => {
                (StatusCode::UNAUTHORIZED, "UNAUTHORIZED", None)
            }
            AppError::Ledger(LedgerError::OperationFailed { operation, .. }) => (
                StatusCode::BAD_GATEWAY,
                "LEDGER_OPERATION_FAILED",
                Some(serde_json::json!({ "operation": operation })),
            ),
            AppError::Ledger(LedgerError::AmountOutOfRange(_)) | AppError::InvalidInput(_) => {
                (StatusCode::BAD_REQUEST, "INVALID_INPUT", None)
            }
            AppError::Database(_) => (StatusCode::INTERNAL_SERVER_ERROR, "DATABASE_ERROR", None),
            _ => (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR", None),
        };

        // Storage failures never echo driver detail back to callers.
        let message = match status {
            StatusCode::INTERNAL_SERVER_ERROR => "An internal error occurred".to_string(),
            _ => message,
        };

        let body = Json(ErrorResponse {
            error: message,
            error_code: error_code.to_string(),
            details,
        });

        (status, body).into_response()
    }
}

impl From<MigrateError> for AppError {
    fn from(error: MigrateError) -> Self {
        AppError::Internal(format!("Migration error: {:?}", error))
    }
}

impl From<serde_json::Error> for AppError {
    fn from(error: serde_json::Error) -> Self {
        AppError::InvalidInput(format!("Malformed payload: {}", error))
    }
}

impl From<rust_decimal::Error> for AppError {
    fn from(error: rust_decimal::Error) -> Self {
        AppError::InvalidInput(format!("Decimal conversion error: {:?}", error))
    }
}

impl From<reqwest::Error> for AppError {
    fn from(error: reqwest::Error) -> Self {
        AppError::Ledger(LedgerError::failed("http", format!("{:?}", error)))
    }
}

impl From<config::ConfigError> for AppError {
    fn from(error: config::ConfigError) -> Self {
        AppError::Config(error.to_string())
    }
}

/// Result type alias for the application
pub type AppResult<T> = Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        let not_found: AppError = FederationError::AddressNotFound("bob*test.org".into()).into();
        assert_eq!(not_found.into_response().status(), StatusCode::NOT_FOUND);

        let top_level: AppError =
            FederationError::NeedsTopLevelAccount("bob:7*test.org".into()).into();
        assert_eq!(
            top_level.into_response().status(),
            StatusCode::UNPROCESSABLE_ENTITY
        );

        let ledger: AppError = LedgerError::failed("submit_payment", "timeout").into();
        assert_eq!(ledger.into_response().status(), StatusCode::BAD_GATEWAY);
    }
}
