use axum::{
    body::Body,
    extract::{Path, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use std::sync::Arc;
use tokio_util::io::ReaderStream;
use tracing::{debug, error};

use super::ApiResponse;
use crate::schedule::types::TaskType;
use crate::AppContext;

pub fn videos_router(ctx: Arc<AppContext>) -> Router {
    Router::new()
        .route("/:filename", get(serve_video))
        .with_state(ctx)
}

fn not_found() -> Response {
    (
        StatusCode::NOT_FOUND,
        Json(ApiResponse::<()>::error("Video not found".to_string())),
    )
        .into_response()
}

async fn serve_video(
    State(ctx): State<Arc<AppContext>>,
    Path(filename): Path<String>,
) -> Response {
    if TaskType::from_output_filename(&filename).is_none() {
        debug!("Refusing to serve {}", filename);
        return not_found();
    }

    let path = ctx.task_manager.output_dir().join(&filename);
    let file = match tokio::fs::File::open(&path).await {
        Ok(file) => file,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return not_found(),
        Err(e) => {
            error!("Error serving video {}: {}", filename, e);
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ApiResponse::<()>::error("Internal server error".to_string())),
            )
                .into_response();
        }
    };
    let length = file.metadata().await.map(|meta| meta.len()).ok();

    let mut response = Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "video/mp4")
        .header(header::CONTENT_DISPOSITION, format!("inline; filename=\"{}\"", filename))
        .header(header::CACHE_CONTROL, "public, max-age=3600");
    if let Some(length) = length {
        response = response.header(header::CONTENT_LENGTH, length);
    }

    match response.body(Body::from_stream(ReaderStream::new(file))) {
        Ok(response) => response,
        Err(e) => {
            error!("Failed to build response for {}: {}", filename, e);
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}
