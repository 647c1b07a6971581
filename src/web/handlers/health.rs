use axum::{extract::State, routing::get, Json, Router};
use serde::Serialize;
use std::sync::Arc;

use crate::AppContext;

pub fn health_router(ctx: Arc<AppContext>) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .with_state(ctx)
}

#[derive(Debug, Serialize)]
pub struct HealthStatus {
    pub status: &'static str,
    pub redis: &'static str,
    pub database: &'static str,
    pub queue_length: usize,
}

fn connection(up: bool) -> &'static str {
    if up {
        "connected"
    } else {
        "disconnected"
    }
}

// Always 200: a down dependency shows up as "degraded".
async fn health_check(State(ctx): State<Arc<AppContext>>) -> Json<HealthStatus> {
    let report = ctx.task_manager.health().await;
    Json(HealthStatus {
        status: if report.database && report.queue { "healthy" } else { "degraded" },
        redis: connection(report.queue),
        database: connection(report.database),
        queue_length: report.queue_length,
    })
}
