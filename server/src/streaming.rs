// Audio endpoints: finished files, progressive WAV, single chunks and the
// live WebSocket session

use std::sync::Arc;

use axum::{
    body::{Body, Bytes},
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, Query, Request, State,
    },
    http::{header, StatusCode},
    response::{IntoResponse, Response},
};
use base64::Engine;
use futures_util::{SinkExt, StreamExt};
use pipeline_core::{
    audio::{decode_wav, pcm_bytes, silence, streaming_header},
    Book, Chapter, ChannelSink, ChapterKey, OutputState, PlaybackController,
    PlaybackState, PlayedChunk,
};
use serde::Deserialize;
use tower::ServiceExt;
use tower_http::services::ServeFile;
use tracing::{info, warn};

use crate::error::ApiError;
use crate::state::AppState;
use crate::validation::validate_chunk_index;

#[derive(Deserialize, Default)]
pub struct StreamParams {
    pub from: Option<usize>,
}

/// The finished chapter file when there is one (Range requests supported),
/// otherwise a progressive stream of the chapter as it is synthesized.
pub async fn chapter_audio(
    State(state): State<AppState>,
    Path((book_id, chapter_id)): Path<(String, String)>,
    request: Request,
) -> Result<Response, ApiError> {
    let (book, chapter) = state.chapter(&book_id, &chapter_id)?;
    let output = chapter.output_path(state.scheduler.output_extension());

    if state.scheduler.output_state(&book, &chapter).await == OutputState::Valid {
        let response = match ServeFile::new(&output).oneshot(request).await {
            Ok(response) => response,
            Err(never) => match never {},
        };
        return Ok(response.map(Body::new));
    }
    progressive(&state, &book, &chapter, 0).await
}

/// Progressive WAV of a chapter from chunk `from` on.
pub async fn stream_chapter(
    State(state): State<AppState>,
    Path((book_id, chapter_id)): Path<(String, String)>,
    Query(params): Query<StreamParams>,
) -> Result<Response, ApiError> {
    let from = params.from.unwrap_or(0);
    validate_chunk_index(from)?;
    let (book, chapter) = state.chapter(&book_id, &chapter_id)?;
    progressive(&state, &book, &chapter, from).await
}

/// One chunk as a standalone WAV, waiting for it if necessary.
pub async fn chunk(
    State(state): State<AppState>,
    Path((book_id, chapter_id, index)): Path<(String, String, usize)>,
) -> Result<Response, ApiError> {
    validate_chunk_index(index)?;
    let (book, chapter) = state.chapter(&book_id, &chapter_id)?;
    let handle = state.scheduler.attach(&book, &chapter).await?;
    if index >= handle.len() {
        return Err(ApiError::NotFound(format!(
            "chunk {} of {} ({} chunks)",
            index,
            handle.key(),
            handle.len()
        )));
    }

    handle.prioritize(index..index + 1);
    let audio = handle.chunk_audio(index).await?;
    Ok((
        [
            (header::CONTENT_TYPE, "audio/wav".to_string()),
            (header::HeaderName::from_static("x-chunk-index"), index.to_string()),
            (header::HeaderName::from_static("x-chunk-count"), handle.len().to_string()),
        ],
        audio.to_vec(),
    )
        .into_response())
}

async fn progressive(
    state: &AppState,
    book: &Book,
    chapter: &Chapter,
    from: usize,
) -> Result<Response, ApiError> {
    let handle = state.scheduler.attach(book, chapter).await?;
    let total = handle.len();
    if from >= total {
        return Err(ApiError::InvalidInput(format!(
            "chunk {} is past the end of {} ({} chunks)",
            from, chapter.id, total
        )));
    }
    let prebuffer = state.scheduler.settings().prebuffer.max(1);
    let pause = handle.plan().voice.pause;

    // The first chunk fixes the stream format; failures here still get a status.
    handle.prioritize(from..(from + prebuffer).min(total));
    let first = decode_wav(&handle.chunk_audio(from).await?)?;
    let spec = first.spec;
    info!("Streaming {} from chunk {} of {}", handle.key(), from, total);

    let stream = async_stream::stream! {
        yield Ok::<_, std::io::Error>(Bytes::from(streaming_header(&spec)));
        yield Ok(Bytes::from(pcm_bytes(&first.samples)));

        let gap = pcm_bytes(&silence(&spec, pause));
        for index in (from + 1)..total {
            handle.prioritize(index..(index + prebuffer).min(total));
            let decoded = match handle.chunk_audio(index).await {
                Ok(audio) => decode_wav(&audio),
                Err(err) => Err(err),
            };
            match decoded {
                Ok(chunk) if chunk.spec == spec => {
                    yield Ok(Bytes::from(gap.clone()));
                    yield Ok(Bytes::from(pcm_bytes(&chunk.samples)));
                }
                Ok(_) => {
                    warn!("Chunk {} of {} changes the audio format, ending stream", index, handle.key());
                    yield Err(std::io::Error::other("audio format changed mid-chapter"));
                    break;
                }
                Err(err) => {
                    warn!("Stream of {} stopped at chunk {}: {}", handle.key(), index, err);
                    yield Err(std::io::Error::other(err.to_string()));
                    break;
                }
            }
        }
    };

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "audio/wav")
        .header(header::CACHE_CONTROL, "no-cache")
        .header("x-chunk-count", total)
        .header("x-chunk-start", from)
        .body(Body::from_stream(stream))
        .map_err(|e| ApiError::InternalError(format!("response build error: {e}")))
}

/// WebSocket live playback. The server drives a playback controller and
/// sends each chunk as a JSON message with base64 WAV audio; the client
/// may send `pause`, `resume` or `stop`. Without `from`, a session resumes
/// at the saved playback position when it is in this chapter.
pub async fn live(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Path((book_id, chapter_id)): Path<(String, String)>,
    Query(params): Query<StreamParams>,
) -> Result<Response, ApiError> {
    if let Some(from) = params.from {
        validate_chunk_index(from)?;
    }
    let (book, chapter) = state.chapter(&book_id, &chapter_id)?;
    Ok(ws
        .on_upgrade(move |socket| live_session(socket, state, book, chapter, params.from))
        .into_response())
}

async fn live_session(
    socket: WebSocket,
    state: AppState,
    book: Book,
    chapter: Chapter,
    from: Option<usize>,
) {
    let key = ChapterKey::new(&book, &chapter);
    let controller = PlaybackController::new(Arc::clone(&state.scheduler), book);
    let start = match from {
        Some(from) => from,
        None => match controller.resume_point().await {
            Some((resume, chunk)) if resume.id == chapter.id => chunk,
            _ => 0,
        },
    };
    info!("Live session for {} starting at chunk {}", key, start);

    let control = controller.control();
    let mut states = control.subscribe();
    let (mut sender, mut receiver) = socket.split();
    let (mut sink, mut chunks) = ChannelSink::new(1);
    let playback = tokio::spawn(async move { controller.play(&chapter, start, &mut sink).await });

    let mut states_open = true;
    loop {
        tokio::select! {
            chunk = chunks.recv() => {
                let Some(chunk) = chunk else { break };
                if sender.send(Message::Text(chunk_message(&chunk).into())).await.is_err() {
                    control.abort();
                    break;
                }
            }
            changed = states.changed(), if states_open => {
                if changed.is_err() {
                    states_open = false;
                    continue;
                }
                let current = *states.borrow_and_update();
                let _ = sender.send(Message::Text(status_message(current).into())).await;
            }
            msg = receiver.next() => match msg {
                Some(Ok(Message::Text(text))) => match text.as_str().trim() {
                    "pause" => control.pause(),
                    "resume" => control.resume(),
                    "stop" | "abort" => control.abort(),
                    other => warn!("Unknown live command: {}", other),
                },
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => {
                    control.abort();
                    break;
                }
                Some(Ok(_)) => {}
            },
        }
    }

    let outcome = match playback.await {
        Ok(Ok(final_state)) => status_message(final_state),
        Ok(Err(err)) => {
            warn!("Live session for {} ended: {}", key, err);
            let api = ApiError::from(err);
            serde_json::json!({ "error": api.to_string(), "code": api.status().as_u16() }).to_string()
        }
        Err(join_err) => {
            warn!("Live session task for {} failed: {}", key, join_err);
            serde_json::json!({ "error": format!("Task join error: {join_err}"), "code": 500 }).to_string()
        }
    };
    let _ = sender.send(Message::Text(outcome.into())).await;
    let _ = sender.close().await;
}

fn chunk_message(chunk: &PlayedChunk) -> String {
    serde_json::json!({
        "type": "chunk",
        "chapter": chunk.chapter,
        "index": chunk.index,
        "total": chunk.total,
        "audio_base64": base64::engine::general_purpose::STANDARD.encode(chunk.audio.as_slice()),
    })
    .to_string()
}

fn status_message(state: PlaybackState) -> String {
    serde_json::json!({ "type": "status", "state": state }).to_string()
}
