// JSON endpoints: library listing, chapter status, job control, markers, cache

use std::path::PathBuf;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use pipeline_core::{
    ChapterKey, ChapterStatus, JobProgress, JobStart, JobState, MarkerStore, OutputState,
    PlaybackMarker, PurgeReport,
};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::ApiError;
use crate::metrics::{system_metrics, DetailedMetricsResponse};
use crate::state::AppState;

#[derive(Serialize)]
pub struct BookSummary {
    pub id: String,
    pub title: String,
    pub author: Option<String>,
    pub chapters: usize,
    pub has_cover: bool,
}

#[derive(Serialize)]
pub struct ChapterSummary {
    pub id: String,
    pub index: usize,
    pub title: String,
    pub track_number: u32,
    pub output_state: OutputState,
    pub job: Option<JobState>,
    /// The playback marker points into this chapter.
    pub has_progress: bool,
}

#[derive(Deserialize, Default)]
pub struct SynthesizeParams {
    #[serde(default)]
    pub restart: bool,
}

#[derive(Serialize)]
pub struct SynthesizeResponse {
    pub status: &'static str,
    pub output: Option<PathBuf>,
    pub progress: Option<JobProgress>,
}

#[derive(Deserialize, Default)]
pub struct PurgeParams {
    #[serde(default)]
    pub outputs: bool,
}

pub async fn health_check() -> &'static str {
    "ok"
}

pub async fn list_books(State(state): State<AppState>) -> Result<Json<Vec<BookSummary>>, ApiError> {
    let mut out = Vec::new();
    for book in state.library.books()? {
        out.push(BookSummary {
            title: book.title(),
            author: book.author().map(str::to_string),
            chapters: book.chapters()?.len(),
            has_cover: book.cover_path().is_some(),
            id: book.id,
        });
    }
    Ok(Json(out))
}

pub async fn list_chapters(
    State(state): State<AppState>,
    Path(book_id): Path<String>,
) -> Result<Json<Vec<ChapterSummary>>, ApiError> {
    let book = state.book(&book_id)?;
    let marker = MarkerStore::for_book(&book).load().await;

    let mut out = Vec::new();
    for chapter in book.chapters()? {
        let job = state
            .scheduler
            .last_job(&ChapterKey::new(&book, &chapter))
            .await
            .map(|handle| handle.progress().state);
        out.push(ChapterSummary {
            output_state: state.scheduler.output_state(&book, &chapter).await,
            has_progress: marker.as_ref().is_some_and(|m| m.chapter == chapter.id),
            id: chapter.id,
            index: chapter.index,
            title: chapter.title,
            track_number: chapter.track_number,
            job,
        });
    }
    Ok(Json(out))
}

pub async fn chapter_status(
    State(state): State<AppState>,
    Path((book_id, chapter_id)): Path<(String, String)>,
) -> Result<Json<ChapterStatus>, ApiError> {
    let (book, chapter) = state.chapter(&book_id, &chapter_id)?;
    Ok(Json(state.scheduler.chapter_status(&book, &chapter).await?))
}

pub async fn synthesize(
    State(state): State<AppState>,
    Path((book_id, chapter_id)): Path<(String, String)>,
    Query(params): Query<SynthesizeParams>,
) -> Result<(StatusCode, Json<SynthesizeResponse>), ApiError> {
    let (book, chapter) = state.chapter(&book_id, &chapter_id)?;

    let start = if params.restart {
        info!("Restarting {}/{}", book.id, chapter.id);
        JobStart::Running(state.scheduler.restart(&book, &chapter).await?)
    } else {
        state.scheduler.ensure_job(&book, &chapter).await?
    };

    Ok(match start {
        JobStart::Assembled(output) => (
            StatusCode::OK,
            Json(SynthesizeResponse {
                status: "assembled",
                output: Some(output),
                progress: None,
            }),
        ),
        JobStart::Running(handle) => (
            StatusCode::ACCEPTED,
            Json(SynthesizeResponse {
                status: "running",
                output: None,
                progress: Some(handle.progress()),
            }),
        ),
    })
}

pub async fn abort(
    State(state): State<AppState>,
    Path((book_id, chapter_id)): Path<(String, String)>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let (book, chapter) = state.chapter(&book_id, &chapter_id)?;
    let aborted = state.scheduler.abort(&ChapterKey::new(&book, &chapter)).await;
    Ok(Json(serde_json::json!({ "aborted": aborted })))
}

pub async fn get_playback(
    State(state): State<AppState>,
    Path(book_id): Path<String>,
) -> Result<Json<PlaybackMarker>, ApiError> {
    let book = state.book(&book_id)?;
    MarkerStore::for_book(&book)
        .load()
        .await
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("no playback position for {}", book.id)))
}

pub async fn clear_playback(
    State(state): State<AppState>,
    Path(book_id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let book = state.book(&book_id)?;
    let cleared = MarkerStore::for_book(&book).clear().await?;
    Ok(Json(serde_json::json!({ "cleared": cleared })))
}

pub async fn purge_cache(
    State(state): State<AppState>,
    Path(book_id): Path<String>,
    Query(params): Query<PurgeParams>,
) -> Result<Json<PurgeReport>, ApiError> {
    let book = state.book(&book_id)?;
    Ok(Json(state.scheduler.purge(&book, params.outputs).await?))
}

pub async fn metrics_endpoint(State(state): State<AppState>) -> Json<DetailedMetricsResponse> {
    Json(DetailedMetricsResponse {
        timestamp: chrono::Utc::now(),
        system: system_metrics(&state.metrics),
        endpoints: state.metrics.endpoint_stats(),
        pipeline: state.scheduler.metrics().snapshot(),
    })
}
