//! Client tests against a small in-process mock of the engine's HTTP API.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Duration;

use axum::{
    extract::Query,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use engine_core::{
    EngineError, EngineRuntime, ExternalRuntime, SynthesisEngine, SynthesisRequest, VoiceParams,
    VoicevoxClient,
};
use serde_json::{json, Value};

async fn audio_query(Query(params): Query<HashMap<String, String>>) -> Response {
    match params.get("text").map(String::as_str) {
        Some("reject me") => (StatusCode::UNPROCESSABLE_ENTITY, "unsupported text").into_response(),
        Some("explode") => (StatusCode::INTERNAL_SERVER_ERROR, "engine crashed").into_response(),
        Some(text) => Json(json!({
            "speedScale": 1.0,
            "pitchScale": 0.0,
            "intonationScale": 1.0,
            "postPhonemeLength": 0.1,
            "kana": text,
            "speaker": params.get("speaker").cloned().unwrap_or_default(),
        }))
        .into_response(),
        None => (StatusCode::BAD_REQUEST, "missing text").into_response(),
    }
}

// Echoes the received query behind a RIFF tag so tests can inspect it.
async fn synthesis(Json(query): Json<Value>) -> Vec<u8> {
    let mut body = b"RIFF".to_vec();
    body.extend(serde_json::to_vec(&query).unwrap());
    body
}

async fn spawn_mock_engine() -> SocketAddr {
    let app = Router::new()
        .route("/version", get(|| async { Json("0.14.0") }))
        .route("/audio_query", post(audio_query))
        .route("/synthesis", post(synthesis));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

fn client_for(addr: SocketAddr) -> VoicevoxClient {
    VoicevoxClient::new(&format!("http://{addr}"), Duration::from_secs(5)).unwrap()
}

#[tokio::test]
async fn test_synthesize_applies_voice_scales() {
    let addr = spawn_mock_engine().await;
    let client = client_for(addr);
    let voice = VoiceParams {
        speaker: 8,
        speed: Some(1.25),
        pitch: None,
        intonation: Some(0.5),
    };

    let wav = client
        .synthesize(&SynthesisRequest::new("こんにちは。", voice))
        .await
        .unwrap();

    assert_eq!(&wav[..4], b"RIFF");
    let echoed: Value = serde_json::from_slice(&wav[4..]).unwrap();
    assert_eq!(echoed["speedScale"], json!(1.25));
    assert_eq!(echoed["pitchScale"], json!(0.0));
    assert_eq!(echoed["intonationScale"], json!(0.5));
    assert_eq!(echoed["kana"], json!("こんにちは。"));
    assert_eq!(echoed["speaker"], json!("8"));
}

#[tokio::test]
async fn test_client_error_maps_to_rejected() {
    let addr = spawn_mock_engine().await;
    let client = client_for(addr);

    let err = client
        .synthesize(&SynthesisRequest::new("reject me", VoiceParams::default()))
        .await
        .unwrap_err();

    match err {
        EngineError::Rejected { status, message } => {
            assert_eq!(status, 422);
            assert!(message.contains("unsupported"));
        }
        other => panic!("expected Rejected, got {other:?}"),
    }
    assert!(!client
        .synthesize(&SynthesisRequest::new("reject me", VoiceParams::default()))
        .await
        .unwrap_err()
        .is_retryable());
}

#[tokio::test]
async fn test_server_error_is_retryable() {
    let addr = spawn_mock_engine().await;
    let client = client_for(addr);

    let err = client
        .synthesize(&SynthesisRequest::new("explode", VoiceParams::default()))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Malformed(_)));
    assert!(err.is_retryable());
}

#[tokio::test]
async fn test_unreachable_engine_is_unavailable() {
    // Reserve a port, then free it so nothing is listening there.
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let client = client_for(addr);
    let err = client
        .synthesize(&SynthesisRequest::new("hello", VoiceParams::default()))
        .await
        .unwrap_err();
    match &err {
        EngineError::Unavailable { endpoint, .. } => assert_eq!(endpoint, &format!("http://{addr}")),
        other => panic!("expected Unavailable, got {other:?}"),
    }
    assert!(err.is_retryable());
}

#[tokio::test]
async fn test_external_runtime_readiness() {
    let addr = spawn_mock_engine().await;
    let runtime = ExternalRuntime::new(client_for(addr), Duration::from_secs(2));
    runtime.ensure_ready().await.unwrap();
    assert_eq!(runtime.address(), format!("http://{addr}"));
    runtime.shutdown().await.unwrap();

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let dead = listener.local_addr().unwrap();
    drop(listener);
    let runtime = ExternalRuntime::new(client_for(dead), Duration::from_millis(600));
    let err = runtime.ensure_ready().await.unwrap_err();
    assert!(matches!(err, EngineError::Unavailable { .. }));
}
