use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use chrono::Utc;
use std::sync::Arc;
use tracing::{debug, info};

use super::auth::{AuthenticatedTenant, TenantId};
use super::models::*;
use crate::error::{AppError, AppResult};
use crate::federation::address::FederationAddress;
use crate::federation::FederationRecord;
use crate::middleware::{validate, ValidatedJson};
use crate::service::BridgeService;

pub const ENTITY_HEADER: &str = "x-mifos-entity";
pub const ACTION_HEADER: &str = "x-mifos-action";

#[derive(Clone)]
pub struct AppState {
    pub service: Arc<BridgeService>,
}

/// GET /health
pub async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        timestamp: Utc::now(),
        federation_domain: state
            .service
            .resolver()
            .local_domain()
            .map(str::to_string),
    })
}

/// GET /federation?type=name&q=alice*test.org
///
/// Only `type=name` is served; anything else answers 501. Lookup failures
/// answer 404.
pub async fn federation_lookup(
    State(state): State<AppState>,
    Query(query): Query<FederationQuery>,
) -> Response {
    if !query.query_type.eq_ignore_ascii_case("name") {
        let body = serde_json::json!({
            "error": format!("Federation query type {} is not supported", query.query_type),
            "error_code": "UNSUPPORTED_QUERY_TYPE",
        });
        return (StatusCode::NOT_IMPLEMENTED, Json(body)).into_response();
    }

    match resolve_name(&state, &query.q).await {
        Ok(record) => Json(record).into_response(),
        Err(AppError::Federation(e)) => {
            debug!("Federation lookup for {} failed: {}", query.q, e);
            AppError::Federation(e).into_response()
        }
        Err(e) => e.into_response(),
    }
}

async fn resolve_name(state: &AppState, name: &str) -> AppResult<FederationRecord> {
    let address = FederationAddress::parse(name)?;
    let account = state.service.resolver().resolve(&address).await?;
    Ok(FederationRecord::new(&address, &account))
}

// ========== BRIDGE LIFECYCLE ==========

/// POST /modules/stellar/bridge
pub async fn create_bridge(
    State(state): State<AppState>,
    TenantId(tenant_id): TenantId,
    ValidatedJson(request): ValidatedJson<CreateBridgeRequest>,
) -> AppResult<(StatusCode, Json<CreateBridgeResponse>)> {
    info!("📥 Bridge requested for tenant {}", tenant_id);
    let api_key = state
        .service
        .create_bridge(&tenant_id, &request.access_token)
        .await?;
    Ok((
        StatusCode::CREATED,
        Json(CreateBridgeResponse { tenant_id, api_key }),
    ))
}

/// DELETE /modules/stellar/bridge
pub async fn delete_bridge(
    State(state): State<AppState>,
    AuthenticatedTenant(bridge): AuthenticatedTenant,
) -> AppResult<StatusCode> {
    state.service.delete_bridge(&bridge.tenant_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

// ========== TRUSTLINES & VAULT ==========

/// PUT /modules/stellar/bridge/trustlines/:asset_code/:issuer
pub async fn adjust_trust_line(
    State(state): State<AppState>,
    AuthenticatedTenant(bridge): AuthenticatedTenant,
    Path((asset_code, issuer)): Path<(String, String)>,
    ValidatedJson(request): ValidatedJson<TrustlineRequest>,
) -> AppResult<StatusCode> {
    let issuer = FederationAddress::parse(&issuer)?;
    state
        .service
        .adjust_trust_line(&bridge.tenant_id, &issuer, &asset_code, request.max_amount)
        .await?;
    Ok(StatusCode::OK)
}

/// PUT /modules/stellar/bridge/vault/:asset_code
pub async fn adjust_vault(
    State(state): State<AppState>,
    AuthenticatedTenant(bridge): AuthenticatedTenant,
    Path(asset_code): Path<String>,
    ValidatedJson(request): ValidatedJson<VaultSizeRequest>,
) -> AppResult<Json<VaultResponse>> {
    let issued_amount = state
        .service
        .adjust_vault_issued_assets(&bridge.tenant_id, &asset_code, request.amount)
        .await?;
    Ok(Json(VaultResponse {
        asset_code,
        has_vault: true,
        issued_amount,
    }))
}

/// GET /modules/stellar/bridge/vault/:asset_code
pub async fn get_vault(
    State(state): State<AppState>,
    AuthenticatedTenant(bridge): AuthenticatedTenant,
    Path(asset_code): Path<String>,
) -> AppResult<Json<VaultResponse>> {
    let issued_amount = state
        .service
        .get_vault_issued_assets(&bridge.tenant_id, &asset_code)
        .await?;
    Ok(Json(VaultResponse {
        has_vault: bridge.vault.is_some(),
        asset_code,
        issued_amount,
    }))
}

// ========== PAYMENTS ==========

fn is_journal_entry(headers: &HeaderMap) -> bool {
    let header_is = |name: &str, expected: &str| {
        headers
            .get(name)
            .and_then(|value| value.to_str().ok())
            .map(|value| value.trim().eq_ignore_ascii_case(expected))
            .unwrap_or(false)
    };
    header_is(ENTITY_HEADER, "JOURNALENTRY") && header_is(ACTION_HEADER, "CREATE")
}

/// POST /modules/stellar/bridge/payments
///
/// Accepts either a `PaymentRequest` or, when flagged by the core banking
/// entity headers, a journal entry.
pub async fn send_payment(
    State(state): State<AppState>,
    AuthenticatedTenant(bridge): AuthenticatedTenant,
    headers: HeaderMap,
    body: Bytes,
) -> AppResult<(StatusCode, Json<PaymentAccepted>)> {
    let instruction = if is_journal_entry(&headers) {
        let entry: JournalEntryRequest = serde_json::from_slice(&body)?;
        validate(&entry)?;
        entry.into_instruction(&bridge.tenant_id)?
    } else {
        let request: PaymentRequest = serde_json::from_slice(&body)?;
        validate(&request)?;
        request.into_instruction(&bridge.tenant_id)?
    };

    let payment_id = state.service.send_payment(&instruction).await?;
    info!(
        "📤 Payment {} queued: {} {} from {} to {}",
        payment_id,
        instruction.amount,
        instruction.asset_code,
        instruction.source_tenant,
        instruction.destination_address
    );
    Ok((StatusCode::ACCEPTED, Json(PaymentAccepted { payment_id })))
}

// ========== BALANCES ==========

/// GET /modules/stellar/bridge/balances/:asset_code
pub async fn get_balance(
    State(state): State<AppState>,
    AuthenticatedTenant(bridge): AuthenticatedTenant,
    Path(asset_code): Path<String>,
) -> AppResult<Json<BalanceResponse>> {
    let balance = state
        .service
        .get_balance(&bridge.tenant_id, &asset_code)
        .await?;
    Ok(Json(BalanceResponse {
        asset_code,
        issuer: None,
        balance,
    }))
}

/// GET /modules/stellar/bridge/balances/:asset_code/:issuer
pub async fn get_balance_by_issuer(
    State(state): State<AppState>,
    AuthenticatedTenant(bridge): AuthenticatedTenant,
    Path((asset_code, issuer)): Path<(String, String)>,
) -> AppResult<Json<BalanceResponse>> {
    let issuer_address = FederationAddress::parse(&issuer)?;
    let balance = state
        .service
        .get_balance_by_issuer(&bridge.tenant_id, &asset_code, &issuer_address)
        .await?;
    Ok(Json(BalanceResponse {
        asset_code,
        issuer: Some(issuer_address.to_string()),
        balance,
    }))
}

// ========== ADMIN ==========

/// GET /admin/payments/failed
pub async fn list_failed_payments(
    State(state): State<AppState>,
) -> AppResult<Json<Vec<FailedPayment>>> {
    let failed = state.service.failed_payments().await?;
    Ok(Json(failed.into_iter().map(FailedPayment::from).collect()))
}
