//! Read-only queue and platform stats

use axum::{extract::State, Json};
use kindling_core::health::PlatformStats;
use kindling_storage::JobStats;
use serde::Serialize;
use std::sync::Arc;

use crate::error::ApiResult;
use crate::state::AppState;

#[derive(Debug, Serialize)]
pub struct QueueStatsResponse {
    pub queue: String,
    #[serde(flatten)]
    pub stats: JobStats,
}

/// Job counts per status on the warmup queue
pub async fn queue_stats(State(state): State<Arc<AppState>>) -> ApiResult<Json<QueueStatsResponse>> {
    let queue = &state.engine.queue;
    let stats = queue.stats().await?;

    Ok(Json(QueueStatsResponse {
        queue: queue.name().to_string(),
        stats,
    }))
}

/// Health score distribution across active accounts
pub async fn platform_stats(State(state): State<Arc<AppState>>) -> ApiResult<Json<PlatformStats>> {
    Ok(Json(state.engine.health.platform_stats().await?))
}
