//! Domain-wide directory import

use axum::{extract::State, http::StatusCode, Json};
use kindling_core::onboarding::{DirectoryImport, ImportSummary};
use std::sync::Arc;
use tracing::info;

use crate::error::ApiResult;
use crate::state::AppState;

/// Enroll every active user of a Workspace domain
pub async fn import_directory(
    State(state): State<Arc<AppState>>,
    Json(input): Json<DirectoryImport>,
) -> ApiResult<(StatusCode, Json<ImportSummary>)> {
    let summary = state.engine.onboarding.import_domain_users(&input).await?;

    info!(
        domain = %input.domain,
        imported = summary.imported.len(),
        "Directory import finished"
    );
    Ok((StatusCode::CREATED, Json(summary)))
}
