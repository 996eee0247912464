//! Interactive session: a small HTTP app over the dataset and its 2-D points.

use anyhow::{Context, Result};
use axum::extract::{Path, State};
use axum::http::{header, StatusCode};
use axum::response::{Html, IntoResponse, Json, Response};
use axum::routing::get;
use axum::Router;
use diex_core::models::Dataset;
use diex_core::pipeline::PipelineError;
use diex_core::visualize::{Method, VisualizationResults};
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info, warn};

const PAGE: &str = include_str!("session.html");

pub struct Session {
    dataset: Dataset,
    results: VisualizationResults,
}

impl Session {
    pub fn new(dataset: Dataset, results: VisualizationResults) -> Result<Self, PipelineError> {
        if dataset.len() != results.points.len() {
            return Err(PipelineError::RowMismatch {
                samples: dataset.len(),
                rows: results.points.len(),
            });
        }
        Ok(Self { dataset, results })
    }
}

#[derive(Serialize)]
struct DatasetView<'a> {
    name: &'a str,
    brain_key: &'a str,
    method: Method,
    samples: Vec<SampleView<'a>>,
}

#[derive(Serialize)]
struct SampleView<'a> {
    id: usize,
    filepath: &'a std::path::Path,
    tags: &'a [String],
    x: f32,
    y: f32,
}

pub fn router(session: Session) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/api/dataset", get(dataset))
        .route("/media/:id", get(media))
        .with_state(Arc::new(session))
}

async fn index() -> Html<&'static str> {
    Html(PAGE)
}

async fn dataset(State(session): State<Arc<Session>>) -> Response {
    let samples = session
        .dataset
        .samples()
        .iter()
        .zip(&session.results.points)
        .map(|(s, [x, y])| SampleView {
            id: s.id,
            filepath: &s.filepath,
            tags: &s.tags,
            x: *x,
            y: *y,
        })
        .collect();
    Json(DatasetView {
        name: &session.dataset.name,
        brain_key: &session.results.brain_key,
        method: session.results.method,
        samples,
    })
    .into_response()
}

async fn media(State(session): State<Arc<Session>>, Path(id): Path<usize>) -> Response {
    let Some(sample) = session.dataset.get(id) else {
        return StatusCode::NOT_FOUND.into_response();
    };
    match tokio::fs::read(&sample.filepath).await {
        Ok(bytes) => {
            let mime = infer::get(&bytes)
                .map(|kind| kind.mime_type())
                .unwrap_or("application/octet-stream");
            ([(header::CONTENT_TYPE, mime)], bytes).into_response()
        }
        Err(err) => {
            debug!(path = %sample.filepath.display(), error = %err, "media read failed");
            StatusCode::NOT_FOUND.into_response()
        }
    }
}

/// Serves `router` on `bind:port` until Ctrl-C.
pub async fn serve(router: Router, bind: &str, port: u16) -> Result<()> {
    let addr = format!("{bind}:{port}");
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind session to {addr}"))?;
    info!("Session running at http://{}/ (Ctrl-C to exit)", listener.local_addr()?);
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("session server failed")?;
    info!("Session closed");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!("failed to listen for Ctrl-C: {err}");
        std::future::pending::<()>().await;
    }
}
