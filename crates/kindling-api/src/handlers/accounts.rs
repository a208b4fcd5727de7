//! Account enrollment and lifecycle handlers

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use kindling_common::types::{AccountId, ConnectionType, Provider};
use kindling_core::onboarding::{
    validate_enrollment, ConnectionTestResult, CredentialInput, EnrollmentRequest,
};
use kindling_storage::{Account, HealthSnapshot};
use serde::Serialize;
use std::sync::Arc;

use crate::error::ApiResult;
use crate::state::AppState;

/// Outcome of a dry-run validation
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationResponse {
    pub valid: bool,
    pub email: String,
    pub provider: Provider,
    pub connection_type: ConnectionType,
    /// Credentials arrive as an authorization code still to be exchanged
    pub requires_code_exchange: bool,
}

/// Check an enrollment request without storing anything
pub async fn validate_account(
    Json(input): Json<EnrollmentRequest>,
) -> ApiResult<Json<ValidationResponse>> {
    let validated = validate_enrollment(&input)?;

    Ok(Json(ValidationResponse {
        valid: true,
        email: validated.account.email,
        provider: validated.account.provider,
        connection_type: validated.account.connection_type,
        requires_code_exchange: matches!(
            validated.credentials,
            CredentialInput::AuthorizationCode { .. }
        ),
    }))
}

/// Enroll a new account
pub async fn create_account(
    State(state): State<Arc<AppState>>,
    Json(input): Json<EnrollmentRequest>,
) -> ApiResult<(StatusCode, Json<Account>)> {
    let account = state.engine.onboarding.enroll(&input).await?;
    Ok((StatusCode::CREATED, Json(account)))
}

pub async fn test_connection(
    State(state): State<Arc<AppState>>,
    Path(id): Path<AccountId>,
) -> ApiResult<Json<ConnectionTestResult>> {
    Ok(Json(state.engine.onboarding.test_connection(id).await?))
}

pub async fn pause_account(
    State(state): State<Arc<AppState>>,
    Path(id): Path<AccountId>,
) -> ApiResult<Json<Account>> {
    Ok(Json(state.engine.onboarding.pause(id).await?))
}

pub async fn resume_account(
    State(state): State<Arc<AppState>>,
    Path(id): Path<AccountId>,
) -> ApiResult<Json<Account>> {
    Ok(Json(state.engine.onboarding.resume(id).await?))
}

/// Recompute one account's health from its message history
pub async fn recompute_health(
    State(state): State<Arc<AppState>>,
    Path(id): Path<AccountId>,
) -> ApiResult<Json<HealthSnapshot>> {
    Ok(Json(state.engine.health.recompute(id).await?))
}
