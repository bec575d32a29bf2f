//! HTTP handlers for the facilitator API.

use axum::Json;
use axum::Router;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use serde_json::json;
use std::sync::Arc;

use crate::claims::{ClaimError, ClaimsService, InMemoryClaimsStore, ReportClaimRequest};
use crate::engine::FacilitatorEngine;
use crate::facilitator::{Facilitator, FacilitatorError};
use crate::types::{ErrorResponse, SettleRequest, VerifyRequest};

pub const API_KEY_HEADER: &str = "x-api-key";

#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<FacilitatorEngine>,
    pub claims: Arc<ClaimsService<InMemoryClaimsStore>>,
}

pub fn routes(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(get_healthz))
        .route("/supported", get(get_supported))
        .route("/verify", post(post_verify))
        .route("/settle", post(post_settle))
        .route("/claims/report", post(post_claims_report))
        .with_state(state)
}

async fn get_healthz() -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

async fn get_supported(State(state): State<AppState>) -> Response {
    match state.engine.supported().await {
        Ok(supported) => Json(supported).into_response(),
        Err(e) => facilitator_error(e),
    }
}

/// POST /verify: check a payment without settling it. Domain failures come
/// back as 200 with `isValid: false`; only undecodable requests are 400.
async fn post_verify(
    State(state): State<AppState>,
    Json(request): Json<VerifyRequest>,
) -> Response {
    match state.engine.verify(request).await {
        Ok(response) => Json(response).into_response(),
        Err(e) => facilitator_error(e),
    }
}

/// POST /settle: execute a payment. Failed settlements are 200 with
/// `success: false` and a machine-readable reason.
async fn post_settle(State(state): State<AppState>, Json(request): Json<SettleRequest>) -> Response {
    match state.engine.settle(request).await {
        Ok(response) => Json(response).into_response(),
        Err(e) => facilitator_error(e),
    }
}

/// POST /claims/report: a resource server reports a broken settlement.
/// Authenticated with the `X-Api-Key` header.
async fn post_claims_report(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<ReportClaimRequest>,
) -> Response {
    let Some(api_key) = headers.get(API_KEY_HEADER).and_then(|v| v.to_str().ok()) else {
        return error_response(StatusCode::UNAUTHORIZED, "missing X-Api-Key header");
    };
    match state.claims.report_failure(api_key, request).await {
        Ok(claim) => (StatusCode::CREATED, Json(claim)).into_response(),
        Err(e) => claim_error(e),
    }
}

fn facilitator_error(e: FacilitatorError) -> Response {
    match e {
        FacilitatorError::MalformedPayload(detail) => {
            tracing::info!(error = %detail, "rejected malformed request");
            error_response(StatusCode::BAD_REQUEST, &detail)
        }
        FacilitatorError::Internal(detail) => {
            tracing::error!(error = %detail, "internal facilitator error");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "internal error")
        }
    }
}

fn claim_error(e: ClaimError) -> Response {
    let status = match &e {
        ClaimError::Unauthorized => StatusCode::UNAUTHORIZED,
        ClaimError::DuplicateClaim | ClaimError::PayoutInFlight => StatusCode::CONFLICT,
        ClaimError::NotFound => StatusCode::NOT_FOUND,
        ClaimError::UnsupportedNetwork(_) | ClaimError::InvalidTransition { .. } => {
            StatusCode::BAD_REQUEST
        }
        ClaimError::NoRefundWallet(_)
        | ClaimError::PayoutFailed(_)
        | ClaimError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    if status.is_server_error() {
        tracing::error!(error = %e, "claim operation failed");
    }
    error_response(status, &e.to_string())
}

fn error_response(status: StatusCode, message: &str) -> Response {
    (
        status,
        Json(ErrorResponse {
            error: message.to_string(),
        }),
    )
        .into_response()
}
