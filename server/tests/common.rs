//! Common utilities for integration tests

#![allow(dead_code)]

use std::sync::Arc;

use axum::{
    body::{to_bytes, Body},
    http::{Request, StatusCode},
    response::Response,
    Router,
};
use pipeline_core::testing::{write_book, ScriptedEngine};
use pipeline_core::{ChapterKey, JobScheduler, Library, PipelineSettings, WavEncoder};
use server::{build_router, config::ServerConfig, state::AppState};
use tempfile::TempDir;
use tower::ServiceExt;

pub const CHAPTER_ONE: &str = "一段落目の文。\n\n二段落目の文。\n\n三段落目の文。\n";
pub const CHAPTER_TWO: &str = "短い章。\n";

pub struct TestApp {
    pub root: TempDir,
    pub engine: Arc<ScriptedEngine>,
    pub state: AppState,
    pub router: Router,
}

/// A library with one book (`novel`, two chapters) served by a scripted
/// engine and the WAV encoder.
pub fn create_test_app() -> TestApp {
    create_test_app_with(ScriptedEngine::new())
}

pub fn create_test_app_with(engine: ScriptedEngine) -> TestApp {
    let root = TempDir::new().expect("temp dir");
    write_book(
        root.path(),
        "novel",
        &[("01-opening.txt", CHAPTER_ONE), ("02-ending.txt", CHAPTER_TWO)],
    );

    let engine = Arc::new(engine);
    let settings = PipelineSettings::default().with_jobs(2).with_retry(2, 1);
    let scheduler = JobScheduler::new(settings, engine.clone(), Arc::new(WavEncoder));
    let library = Library::open(root.path()).expect("open library");
    let config = ServerConfig {
        library_root: root.path().to_path_buf(),
        ..ServerConfig::default()
    };
    let state = AppState::new(library, scheduler, config);
    let router = build_router(state.clone());

    TestApp {
        root,
        engine,
        state,
        router,
    }
}

impl TestApp {
    pub async fn get(&self, uri: &str) -> Response {
        self.send(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
    }

    pub async fn post(&self, uri: &str) -> Response {
        self.send(
            Request::builder()
                .method("POST")
                .uri(uri)
                .body(Body::empty())
                .unwrap(),
        )
        .await
    }

    pub async fn delete(&self, uri: &str) -> Response {
        self.send(
            Request::builder()
                .method("DELETE")
                .uri(uri)
                .body(Body::empty())
                .unwrap(),
        )
        .await
    }

    pub async fn send(&self, request: Request<Body>) -> Response {
        self.router.clone().oneshot(request).await.unwrap()
    }

    /// Wait for the job of a chapter started through the API.
    pub async fn wait_for_job(&self, book: &str, chapter: &str) {
        let (book, chapter) = self.state.chapter(book, chapter).unwrap();
        let handle = self
            .state
            .scheduler
            .last_job(&ChapterKey::new(&book, &chapter))
            .await
            .expect("a job was started");
        handle.wait().await;
    }
}

pub async fn body_bytes(response: Response) -> Vec<u8> {
    to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap()
        .to_vec()
}

pub async fn body_json(response: Response) -> serde_json::Value {
    serde_json::from_slice(&body_bytes(response).await).unwrap()
}

pub fn assert_status(response: &Response, expected: StatusCode) {
    assert_eq!(response.status(), expected, "unexpected status for response");
}
