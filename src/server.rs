use std::future::Future;
use std::time::Instant;

use anyhow::{Context, Result};
use axum::extract::multipart::MultipartRejection;
use axum::extract::{DefaultBodyLimit, Multipart, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use bytes::Bytes;
use log::{error, info, warn};
use serde_json::json;
use tokio::net::TcpListener;
use uuid::Uuid;

use facecomp_vision::Stage;

use crate::config::ServerConfig;
use crate::error::CompareError;
use crate::service::{ComparisonResult, Comparator};

/// Multipart part names of the two uploads.
pub const IMAGE_PARTS: [&str; 2] = ["image1", "image2"];

/// JSON error body: `{"error": {"stage": ..., "message": ...}}`.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    stage: Stage,
    message: String,
}

impl ApiError {
    fn bad_upload(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            stage: Stage::Load,
            message: message.into(),
        }
    }

    /// Map a failed comparison to a response, keeping internal detail in the log.
    fn from_compare(id: Uuid, err: CompareError) -> Self {
        let stage = err.stage();
        if err.is_client_error() {
            warn!("{}: rejected upload: {}", id, err);
            return Self {
                status: StatusCode::BAD_REQUEST,
                stage,
                message: err.to_string(),
            };
        }
        match err {
            CompareError::Narrative(e) => {
                error!("{}: narrative generation failed: {}", id, e);
                Self {
                    status: StatusCode::BAD_GATEWAY,
                    stage,
                    message: "narrative generation failed".to_string(),
                }
            }
            other => {
                error!("{}: {} stage failed: {:#}", id, stage, anyhow::Error::new(other));
                Self {
                    status: StatusCode::INTERNAL_SERVER_ERROR,
                    stage,
                    message: "internal error".to_string(),
                }
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = json!({
            "error": {
                "stage": self.stage.as_str(),
                "message": self.message,
            }
        });
        (self.status, Json(body)).into_response()
    }
}

pub fn router(comparator: Comparator, body_limit: usize) -> Router {
    Router::new()
        .route("/faces", post(compare_faces))
        .route("/healthz", get(|| async { "ok" }))
        .layer(DefaultBodyLimit::max(body_limit))
        .with_state(comparator)
}

async fn compare_faces(
    State(comparator): State<Comparator>,
    multipart: Result<Multipart, MultipartRejection>,
) -> Result<Json<ComparisonResult>, ApiError> {
    let id = Uuid::new_v4();
    let started = Instant::now();

    let multipart =
        multipart.map_err(|e| ApiError::bad_upload(e.status(), e.body_text()))?;
    let [a, b] = read_uploads(multipart).await.map_err(|e| {
        warn!("{}: {}", id, e.message);
        e
    })?;
    info!("{}: comparing uploads of {} and {} bytes", id, a.len(), b.len());

    let result = comparator
        .compare(a, b)
        .await
        .map_err(|e| ApiError::from_compare(id, e))?;
    info!(
        "{}: similarity {:.2} in {:.2?}",
        id,
        result.similarity_score,
        started.elapsed()
    );
    Ok(Json(result))
}

async fn read_uploads(mut multipart: Multipart) -> Result<[Bytes; 2], ApiError> {
    let mut uploads: [Option<Bytes>; 2] = [None, None];
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::bad_upload(e.status(), e.body_text()))?
    {
        let Some(slot) = field
            .name()
            .and_then(|name| IMAGE_PARTS.iter().position(|part| *part == name))
        else {
            continue;
        };
        let data = field
            .bytes()
            .await
            .map_err(|e| ApiError::bad_upload(e.status(), e.body_text()))?;
        uploads[slot] = Some(data);
    }

    let [a, b] = uploads;
    let take = |upload: Option<Bytes>, name: &str| {
        upload.filter(|data| !data.is_empty()).ok_or_else(|| {
            ApiError::bad_upload(
                StatusCode::BAD_REQUEST,
                format!("missing or empty part \"{}\"", name),
            )
        })
    };
    Ok([take(a, IMAGE_PARTS[0])?, take(b, IMAGE_PARTS[1])?])
}

/// Serve on an already bound listener until `shutdown` resolves.
pub async fn serve_on<F>(
    listener: TcpListener,
    comparator: Comparator,
    body_limit: usize,
    shutdown: F,
) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    axum::serve(listener, router(comparator, body_limit))
        .with_graceful_shutdown(shutdown)
        .await
        .context("HTTP server failed")
}

pub async fn serve(comparator: Comparator, cfg: &ServerConfig) -> Result<()> {
    let listener = TcpListener::bind(&cfg.bind)
        .await
        .with_context(|| format!("Failed to bind {}", cfg.bind))?;
    info!("Listening on http://{}", listener.local_addr()?);
    serve_on(listener, comparator, cfg.body_limit_bytes, shutdown_signal()).await?;
    info!("Server stopped");
    Ok(())
}

async fn shutdown_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Ctrl-C received, finishing in-flight requests"),
        Err(e) => {
            error!("Cannot listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await
        }
    }
}
