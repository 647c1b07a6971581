use axum::{
    routing::{post, get},
    Router,
    extract::{State, Path, Json},
    response::IntoResponse,
    http::StatusCode,
};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use serde::Serialize;
use tracing::{error, warn};

use super::ApiResponse;
use crate::fetch::FetchError;
use crate::schedule::types::{
    BackgroundMusicParams, CaptionParams, MergeParams, Task, TaskParams, TaskStatus,
};
use crate::AppContext;

const MB: f64 = 1024.0 * 1024.0;

pub fn tasks_router(ctx: Arc<AppContext>) -> Router {
    Router::new()
        .route("/caption", post(create_caption_task))
        .route("/merge", post(create_merge_task))
        .route("/background-music", post(create_background_music_task))
        .route("/:task_id", get(get_task))
        .with_state(ctx)
}

#[derive(Debug, Serialize)]
pub struct TaskCreated {
    pub task_id: String,
    pub status: TaskStatus,
    pub message: String,
}

/// Public projection of a task record.
#[derive(Debug, Serialize)]
pub struct TaskView {
    pub task_id: String,
    pub status: TaskStatus,
    pub video_url: Option<String>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl From<Task> for TaskView {
    fn from(task: Task) -> Self {
        Self {
            task_id: task.id,
            status: task.status,
            video_url: task.result_ref,
            error: task.error,
            created_at: task.created_at,
            updated_at: task.updated_at,
            completed_at: task.completed_at,
        }
    }
}

type Reply<T> = (StatusCode, Json<ApiResponse<T>>);

fn reject<T: Serialize>(status: StatusCode, message: String) -> Reply<T> {
    (status, Json(ApiResponse::error(message)))
}

async fn create_caption_task(
    State(ctx): State<Arc<AppContext>>,
    Json(params): Json<CaptionParams>,
) -> impl IntoResponse {
    create_task(&ctx, TaskParams::Caption(params)).await
}

async fn create_merge_task(
    State(ctx): State<Arc<AppContext>>,
    Json(params): Json<MergeParams>,
) -> impl IntoResponse {
    create_task(&ctx, TaskParams::Merge(params)).await
}

async fn create_background_music_task(
    State(ctx): State<Arc<AppContext>>,
    Json(params): Json<BackgroundMusicParams>,
) -> impl IntoResponse {
    create_task(&ctx, TaskParams::BackgroundMusic(params)).await
}

async fn create_task(ctx: &AppContext, params: TaskParams) -> Reply<TaskCreated> {
    if let Err(e) = params.validate() {
        return reject(StatusCode::BAD_REQUEST, e.to_string());
    }
    if let Err(rejection) = check_input_sizes(ctx, &params).await {
        return rejection;
    }

    let task_type = params.task_type();
    match ctx.task_manager.submit(params).await {
        Ok(task) => (
            StatusCode::CREATED,
            Json(ApiResponse::success(TaskCreated {
                task_id: task.id,
                status: task.status,
                message: format!("{} task queued successfully", task_type.label()),
            })),
        ),
        Err(e) => {
            error!("Failed to create {} task: {:#}", task_type, e);
            reject(StatusCode::INTERNAL_SERVER_ERROR, format!("Failed to create task: {}", e))
        }
    }
}

/// Probe every input before anything is persisted: one oversized file is a
/// 413, an unreachable one a 400, and the combined size has its own ceiling.
async fn check_input_sizes(ctx: &AppContext, params: &TaskParams) -> Result<(), Reply<TaskCreated>> {
    let fetcher = ctx.task_manager.fetcher();
    let mut total = 0;

    for url in params.input_urls() {
        match fetcher.probe_size(url).await {
            Ok(probe) => total += probe.bytes(),
            Err(e @ FetchError::SizeLimitExceeded { .. }) => {
                return Err(reject(StatusCode::PAYLOAD_TOO_LARGE, e.to_string()));
            }
            Err(e) => {
                warn!("Rejecting task, input {} is not accessible: {}", url, e);
                return Err(reject(StatusCode::BAD_REQUEST, format!("Unable to access URL {}: {}", url, e)));
            }
        }
    }

    let limit = fetcher.max_file_size().saturating_mul(params.total_size_factor());
    if total > limit {
        return Err(reject(
            StatusCode::PAYLOAD_TOO_LARGE,
            format!(
                "Total file size {:.2}MB exceeds limit of {:.0}MB",
                total as f64 / MB,
                limit as f64 / MB
            ),
        ));
    }
    Ok(())
}

async fn get_task(
    State(ctx): State<Arc<AppContext>>,
    Path(task_id): Path<String>,
) -> impl IntoResponse {
    match ctx.task_manager.get_task(&task_id).await {
        Ok(Some(task)) => (
            StatusCode::OK,
            Json(ApiResponse::success(TaskView::from(task)))
        ),
        Ok(None) => reject(StatusCode::NOT_FOUND, "Task not found".to_string()),
        Err(e) => {
            error!("Failed to get task: {}", e);
            reject(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
        },
    }
}
