use axum::Router;
use serde::Serialize;
use std::sync::Arc;
use crate::AppContext;

pub mod health;
pub mod tasks;
pub mod videos;


pub fn router(ctx: Arc<AppContext>) -> Router {
    Router::new()
        .nest("/tasks", tasks::tasks_router(ctx.clone()))
        .nest("/video", videos::videos_router(ctx.clone()))
        .merge(health::health_router(ctx))
}

#[derive(Debug, Serialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    pub data: Option<T>,
    pub error: Option<String>,
}

impl<T: Serialize> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn error(error: String) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(error),
        }
    }
}
