//! Per-chapter synthesis jobs.
//!
//! A job owns the chunk plan of one chapter and drives every chunk through
//! the worker pool, publishing per-chunk progress on a `watch` channel.
//! Listeners (the streaming server, the playback controller) subscribe to
//! that channel and can pull individual chunks forward through the
//! priority lane while the job keeps working in the background.

use std::collections::HashSet;
use std::fmt;
use std::ops::Range;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock};

use engine_core::SynthesisRequest;
use futures::stream::{self, StreamExt};
use serde::Serialize;
use tokio::sync::{watch, Semaphore};
use tracing::{debug, error, info, warn};

use crate::assembler::{Assembler, TrackTags};
use crate::cache::{ChapterCache, ChunkCache, ChunkManifest, ManifestEntry};
use crate::chunker::split_text;
use crate::error::{PipelineError, Result};
use crate::identity::ChunkIdentity;
use crate::library::{Book, Chapter};
use crate::metrics::PipelineMetrics;
use crate::pool::{ChunkOutcome, Lane, SynthesisPool};
use crate::report::{ChapterReport, FailedChunk};
use crate::settings::{PipelineSettings, VoiceSettings};

/// Identifies a chapter across the process.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct ChapterKey {
    pub book: String,
    pub chapter: String,
}

impl ChapterKey {
    pub fn new(book: &Book, chapter: &Chapter) -> Self {
        Self {
            book: book.id.clone(),
            chapter: chapter.id.clone(),
        }
    }
}

impl fmt::Display for ChapterKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.book, self.chapter)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlannedChunk {
    pub index: usize,
    pub text: String,
    pub start: usize,
    pub end: usize,
    pub identity: ChunkIdentity,
}

/// Everything needed to synthesize and assemble one chapter.
#[derive(Clone)]
pub struct ChapterPlan {
    pub book_id: String,
    pub chapter: Chapter,
    pub voice: VoiceSettings,
    pub chunks: Vec<PlannedChunk>,
    pub cache: ChapterCache,
    pub tags: TrackTags,
    pub cover: Option<PathBuf>,
    pub output: PathBuf,
}

impl ChapterPlan {
    /// Read and chunk the chapter text and compute every chunk identity.
    pub async fn build(
        book: &Book,
        chapter: &Chapter,
        settings: &PipelineSettings,
        cache: &ChunkCache,
        output_extension: &str,
        track_total: usize,
    ) -> Result<Self> {
        let text = chapter.read_text().await?;
        let pieces = split_text(&text, settings.max_chars_per_chunk);
        if pieces.is_empty() {
            return Err(PipelineError::Chunking {
                chapter: chapter.id.clone(),
                reason: "no speakable text".to_string(),
            });
        }

        let voice = book.voice(&settings.voice);
        let signature = book.override_signature();
        let chunks = pieces
            .into_iter()
            .map(|piece| PlannedChunk {
                identity: ChunkIdentity::compute(&piece.text, &voice, signature.as_deref()),
                index: piece.index,
                text: piece.text,
                start: piece.start,
                end: piece.end,
            })
            .collect();

        Ok(Self {
            book_id: book.id.clone(),
            chapter: chapter.clone(),
            voice,
            chunks,
            cache: cache.chapter(book, chapter),
            tags: TrackTags::for_chapter(book, chapter, track_total),
            cover: book.cover_path(),
            output: chapter.output_path(output_extension),
        })
    }

    pub fn key(&self) -> ChapterKey {
        ChapterKey {
            book: self.book_id.clone(),
            chapter: self.chapter.id.clone(),
        }
    }

    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    pub fn request(&self, index: usize) -> Option<SynthesisRequest> {
        self.chunks
            .get(index)
            .map(|chunk| SynthesisRequest::new(chunk.text.clone(), self.voice.engine_params()))
    }

    pub fn manifest(&self) -> ChunkManifest {
        ChunkManifest {
            book: self.book_id.clone(),
            chapter: self.chapter.id.clone(),
            chunks: self
                .chunks
                .iter()
                .map(|chunk| ManifestEntry {
                    index: chunk.index,
                    start: chunk.start,
                    end: chunk.end,
                    identity: chunk.identity.clone(),
                    text: chunk.text.clone(),
                })
                .collect(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Pending,
    Running,
    Assembling,
    Completed,
    PartiallyFailed,
    Skipped,
    Failed,
    Cancelled,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        !matches!(self, JobState::Pending | JobState::Running | JobState::Assembling)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    EngineUnavailable,
    EngineRejected,
    EngineFailed,
    Storage,
    Other,
}

impl From<&PipelineError> for FailureKind {
    fn from(err: &PipelineError) -> Self {
        match err {
            PipelineError::EngineUnavailable { .. } => FailureKind::EngineUnavailable,
            PipelineError::EngineRejected(_) => FailureKind::EngineRejected,
            PipelineError::EngineFailed(_) => FailureKind::EngineFailed,
            PipelineError::Storage { .. } => FailureKind::Storage,
            _ => FailureKind::Other,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ChunkState {
    Pending,
    Cached,
    Failed { kind: FailureKind, message: String },
}

impl ChunkState {
    pub fn is_pending(&self) -> bool {
        matches!(self, ChunkState::Pending)
    }
}

#[derive(Debug, Clone)]
struct ChunkFailure {
    kind: FailureKind,
    message: String,
}

type ChunkResult = std::result::Result<ChunkOutcome, ChunkFailure>;

/// Live view of a job.
#[derive(Debug, Clone, Serialize)]
pub struct JobProgress {
    pub state: JobState,
    pub total: usize,
    pub cached_at_start: usize,
    pub synthesized: usize,
    pub chunks: Vec<ChunkState>,
    pub output: Option<PathBuf>,
    pub error: Option<String>,
}

impl JobProgress {
    fn new(total: usize) -> Self {
        Self {
            state: JobState::Pending,
            total,
            cached_at_start: 0,
            synthesized: 0,
            chunks: vec![ChunkState::Pending; total],
            output: None,
            error: None,
        }
    }

    pub fn cached(&self) -> usize {
        self.chunks.iter().filter(|c| matches!(c, ChunkState::Cached)).count()
    }

    pub fn failed(&self) -> Vec<FailedChunk> {
        self.chunks
            .iter()
            .enumerate()
            .filter_map(|(index, state)| match state {
                ChunkState::Failed { kind, message } => Some(FailedChunk {
                    index,
                    kind: *kind,
                    message: message.clone(),
                }),
                _ => None,
            })
            .collect()
    }

    // Only the first result for a chunk counts.
    fn record(&mut self, index: usize, result: &ChunkResult) {
        let Some(slot) = self.chunks.get_mut(index) else {
            return;
        };
        if !slot.is_pending() {
            return;
        }
        *slot = match result {
            Ok(outcome) => {
                if *outcome == ChunkOutcome::Synthesized {
                    self.synthesized += 1;
                }
                ChunkState::Cached
            }
            Err(failure) => ChunkState::Failed {
                kind: failure.kind,
                message: failure.message.clone(),
            },
        };
    }
}

/// State shared by every job of one run. The first time a chunk finds the
/// engine unreachable before anything in the run has been synthesized, the
/// whole run stops: the engine is down, not the chunk.
pub(crate) struct RunContext {
    synthesized_any: AtomicBool,
    abort: watch::Sender<Option<(String, String)>>,
}

impl RunContext {
    pub(crate) fn new() -> Arc<Self> {
        let (abort, _) = watch::channel(None);
        Arc::new(Self {
            synthesized_any: AtomicBool::new(false),
            abort,
        })
    }

    fn record_success(&self) {
        self.synthesized_any.store(true, Ordering::SeqCst);
    }

    fn escalate(&self, endpoint: String, reason: String) {
        if self.synthesized_any.load(Ordering::SeqCst) {
            return;
        }
        self.abort.send_if_modified(|current| {
            if current.is_some() {
                return false;
            }
            *current = Some((endpoint, reason));
            true
        });
    }

    pub(crate) fn aborted(&self) -> Option<PipelineError> {
        self.abort
            .borrow()
            .clone()
            .map(|(endpoint, reason)| PipelineError::EngineUnavailable { endpoint, reason })
    }
}

struct JobShared {
    plan: Arc<ChapterPlan>,
    pool: Arc<SynthesisPool>,
    run: Arc<RunContext>,
    progress: watch::Sender<JobProgress>,
    cancel: watch::Sender<bool>,
    results: Vec<OnceLock<ChunkResult>>,
    prioritized: Mutex<HashSet<usize>>,
    // No background work: chunks are synthesized only when a listener asks.
    on_demand: bool,
}

impl JobShared {
    async fn process_chunk(&self, index: usize, lane: Lane) -> Option<ChunkResult> {
        let slot = self.results.get(index)?;
        if let Some(done) = slot.get() {
            return Some(done.clone());
        }
        let chunk = &self.plan.chunks[index];
        let request = self.plan.request(index)?;

        let result = match self
            .pool
            .ensure_cached(&self.plan.cache, &chunk.identity, &request, lane)
            .await
        {
            Ok(outcome) => {
                if outcome == ChunkOutcome::Synthesized {
                    self.run.record_success();
                }
                debug!(chapter = %self.plan.key(), index, ?outcome, ?lane, "chunk cached");
                Ok(outcome)
            }
            Err(err) => {
                error!("Chunk {} of {} failed: {}", index, self.plan.key(), err);
                if matches!(err, PipelineError::EngineUnavailable { .. }) {
                    self.run.escalate(self.pool.endpoint(), err.to_string());
                }
                Err(ChunkFailure {
                    kind: FailureKind::from(&err),
                    message: err.to_string(),
                })
            }
        };

        let _ = slot.set(result);
        let settled = slot.get().cloned().unwrap_or_else(|| Err(ChunkFailure {
            kind: FailureKind::Other,
            message: "chunk result missing".to_string(),
        }));
        self.progress.send_modify(|p| p.record(index, &settled));
        Some(settled)
    }

    fn set_state(&self, state: JobState) {
        self.progress.send_modify(|p| p.state = state);
    }

    fn is_cancelled(&self) -> bool {
        *self.cancel.borrow()
    }
}

async fn cancelled(rx: &mut watch::Receiver<bool>) {
    if rx.wait_for(|c| *c).await.is_err() {
        std::future::pending::<()>().await;
    }
}

async fn run_aborted(rx: &mut watch::Receiver<Option<(String, String)>>) -> PipelineError {
    let reason = match rx.wait_for(|r| r.is_some()).await {
        Ok(reason) => reason.clone(),
        Err(_) => None,
    };
    match reason {
        Some((endpoint, reason)) => PipelineError::EngineUnavailable { endpoint, reason },
        None => std::future::pending().await,
    }
}

/// Handle to a running (or finished) chapter job. Cheap to clone.
#[derive(Clone)]
pub struct JobHandle {
    shared: Arc<JobShared>,
}

impl JobHandle {
    pub fn key(&self) -> ChapterKey {
        self.shared.plan.key()
    }

    pub fn plan(&self) -> &ChapterPlan {
        &self.shared.plan
    }

    pub fn len(&self) -> usize {
        self.shared.plan.len()
    }

    pub fn is_empty(&self) -> bool {
        self.shared.plan.is_empty()
    }

    pub fn progress(&self) -> JobProgress {
        self.shared.progress.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<JobProgress> {
        self.shared.progress.subscribe()
    }

    pub fn is_finished(&self) -> bool {
        self.shared.progress.borrow().state.is_terminal()
    }

    /// Ask the job to stop. Chunks already stored stay cached.
    pub fn cancel(&self) {
        self.shared.cancel.send_replace(true);
    }

    /// Move the chunks in `range` to the front of the worker pool.
    pub fn prioritize(&self, range: Range<usize>) {
        let end = range.end.min(self.len());
        for index in range.start..end {
            if self.shared.results[index].get().is_some() {
                continue;
            }
            let fresh = self
                .shared
                .prioritized
                .lock()
                .map(|mut set| set.insert(index))
                .unwrap_or(false);
            if !fresh {
                continue;
            }
            let shared = Arc::clone(&self.shared);
            tokio::spawn(async move {
                let mut cancel = shared.cancel.subscribe();
                tokio::select! {
                    _ = shared.process_chunk(index, Lane::Priority) => {}
                    _ = cancelled(&mut cancel) => {}
                }
            });
        }
    }

    /// Wait until chunk `index` is cached. Fails if the chunk failed or the
    /// job ended without producing it.
    pub async fn wait_for_chunk(&self, index: usize) -> Result<()> {
        if index >= self.len() {
            return Err(PipelineError::NotFound(format!(
                "chunk {} of {} ({} chunks)",
                index,
                self.key(),
                self.len()
            )));
        }
        let on_demand = self.shared.on_demand;
        if on_demand {
            self.prioritize(index..index + 1);
        }
        let mut rx = self.subscribe();
        let mut cancel = self.shared.cancel.subscribe();
        let (chunk, state, error) = {
            let progress = tokio::select! {
                biased;
                progress = rx.wait_for(|p| {
                    !p.chunks[index].is_pending() || (p.state.is_terminal() && !on_demand)
                }) => progress.map_err(|_| PipelineError::Cancelled)?,
                _ = cancelled(&mut cancel) => return Err(PipelineError::Cancelled),
            };
            (progress.chunks[index].clone(), progress.state, progress.error.clone())
        };

        match chunk {
            ChunkState::Cached => Ok(()),
            ChunkState::Failed { kind, message } => Err(match kind {
                FailureKind::EngineUnavailable => PipelineError::EngineUnavailable {
                    endpoint: self.shared.pool.endpoint(),
                    reason: message,
                },
                FailureKind::EngineRejected => PipelineError::EngineRejected(message),
                _ => PipelineError::EngineFailed(message),
            }),
            ChunkState::Pending => Err(match (state, self.shared.run.aborted(), error) {
                (JobState::Cancelled, _, _) => PipelineError::Cancelled,
                (_, Some(aborted), _) => aborted,
                (_, None, Some(error)) => PipelineError::EngineFailed(error),
                _ => PipelineError::Cancelled,
            }),
        }
    }

    /// Audio of chunk `index`, waiting for it if necessary.
    pub async fn chunk_audio(&self, index: usize) -> Result<Arc<Vec<u8>>> {
        self.wait_for_chunk(index).await?;
        let chunk = &self.shared.plan.chunks[index];
        self.shared.plan.cache.fetch(&chunk.identity).await
    }

    /// Wait for the job to finish and summarize it.
    pub async fn wait(&self) -> ChapterReport {
        let mut rx = self.subscribe();
        let progress = match rx.wait_for(|p| p.state.is_terminal()).await {
            Ok(progress) => progress.clone(),
            Err(_) => self.progress(),
        };
        ChapterReport::from_progress(&self.shared.plan, &progress)
    }
}

/// What a new job needs besides its plan.
pub(crate) struct JobContext {
    pub pool: Arc<SynthesisPool>,
    pub assembler: Arc<Assembler>,
    pub chapter_permits: Arc<Semaphore>,
    pub metrics: Arc<PipelineMetrics>,
    pub run: Arc<RunContext>,
    /// Produce the chapter file at the end. Off when a valid output exists
    /// and the job only serves chunks to a listener.
    pub assemble: bool,
    pub keep_cache: bool,
    pub allow_partial: bool,
}

/// Start a job for `plan` on the current runtime.
pub(crate) fn start(plan: ChapterPlan, ctx: JobContext) -> JobHandle {
    let total = plan.len();
    let (progress, _) = watch::channel(JobProgress::new(total));
    let (cancel, _) = watch::channel(false);
    let shared = Arc::new(JobShared {
        plan: Arc::new(plan),
        pool: Arc::clone(&ctx.pool),
        run: Arc::clone(&ctx.run),
        progress,
        cancel,
        results: (0..total).map(|_| OnceLock::new()).collect(),
        prioritized: Mutex::new(HashSet::new()),
        on_demand: !ctx.assemble,
    });

    let runner = JobRunner {
        shared: Arc::clone(&shared),
        ctx,
    };
    tokio::spawn(runner.run());
    JobHandle { shared }
}

struct JobRunner {
    shared: Arc<JobShared>,
    ctx: JobContext,
}

impl JobRunner {
    async fn run(self) {
        let key = self.shared.plan.key();
        let (state, output, error) = match self.execute().await {
            Ok((state, output)) => (state, output, None),
            Err(PipelineError::Cancelled) => (JobState::Cancelled, None, None),
            Err(err) => {
                error!("Chapter {} failed: {}", key, err);
                (JobState::Failed, None, Some(err.to_string()))
            }
        };

        self.shared.progress.send_modify(|p| {
            p.state = state;
            p.output = output;
            p.error = error;
        });
        let progress = self.shared.progress.borrow().clone();
        info!(
            "Chapter {} finished: {:?} ({} cached at start, {} synthesized, {} failed of {})",
            key,
            state,
            progress.cached_at_start,
            progress.synthesized,
            progress.failed().len(),
            progress.total
        );
    }

    async fn execute(&self) -> Result<(JobState, Option<PathBuf>)> {
        if !self.ctx.assemble {
            return self.serve_cached().await;
        }
        let shared = &self.shared;
        let plan = &shared.plan;
        let mut cancel = shared.cancel.subscribe();
        let mut abort = shared.run.abort.subscribe();

        let _slot = tokio::select! {
            permit = Arc::clone(&self.ctx.chapter_permits).acquire_owned() => {
                permit.map_err(|_| PipelineError::Cancelled)?
            }
            _ = cancelled(&mut cancel) => return Err(PipelineError::Cancelled),
            err = run_aborted(&mut abort) => return Err(err),
        };
        let _active = self.ctx.metrics.enter_chapter();
        shared.set_state(JobState::Running);
        info!("Synthesizing {} ({} chunks)", plan.key(), plan.len());

        plan.cache.clear_marker().await?;
        plan.cache.write_manifest(&plan.manifest()).await?;

        let pending = self.record_cache_hits().await;
        debug!("{}: {} chunks to synthesize", plan.key(), pending.len());

        let work = stream::iter(pending)
            .map(move |index| shared.process_chunk(index, Lane::Background))
            .buffer_unordered(shared.pool.capacity())
            .collect::<Vec<_>>();
        tokio::select! {
            _ = work => {}
            _ = cancelled(&mut cancel) => return Err(PipelineError::Cancelled),
            err = run_aborted(&mut abort) => return Err(err),
        }
        if shared.is_cancelled() {
            return Err(PipelineError::Cancelled);
        }
        if let Some(err) = shared.run.aborted() {
            return Err(err);
        }

        let failed = shared.progress.borrow().failed().len();
        let state = if failed == 0 {
            JobState::Completed
        } else {
            warn!("{}: {} of {} chunks failed", plan.key(), failed, plan.len());
            JobState::PartiallyFailed
        };

        if failed > 0 && !self.ctx.allow_partial {
            return Ok((state, None));
        }

        shared.set_state(JobState::Assembling);
        let output = self.ctx.assembler.assemble(plan, self.ctx.allow_partial).await?;
        if failed == 0 {
            if self.ctx.keep_cache {
                plan.cache.mark_complete(plan.len()).await?;
            } else {
                plan.cache.remove().await?;
            }
        }
        Ok((state, Some(output)))
    }

    /// The chapter already has a valid output. Record what is cached and
    /// finish; listeners synthesize missing chunks on demand.
    async fn serve_cached(&self) -> Result<(JobState, Option<PathBuf>)> {
        let plan = &self.shared.plan;
        plan.cache.write_manifest(&plan.manifest()).await?;
        let missing = self.record_cache_hits().await;
        debug!("{}: serving, {} chunks not cached", plan.key(), missing.len());
        // Keep the cache from reading as an interrupted run.
        plan.cache.mark_complete(plan.len()).await?;
        Ok((JobState::Skipped, Some(plan.output.clone())))
    }

    /// Settle every cached chunk as a hit. Returns the chunks still missing.
    async fn record_cache_hits(&self) -> Vec<usize> {
        let shared = &self.shared;
        let plan = &shared.plan;
        let mut missing = Vec::new();
        for chunk in &plan.chunks {
            if !shared.progress.borrow().chunks[chunk.index].is_pending() {
                continue;
            }
            if plan.cache.lookup(&chunk.identity).await {
                self.ctx.metrics.record_cache_hit();
                let _ = shared.results[chunk.index].set(Ok(ChunkOutcome::Hit));
                shared.progress.send_modify(|p| {
                    if p.chunks[chunk.index].is_pending() {
                        p.cached_at_start += 1;
                        p.record(chunk.index, &Ok(ChunkOutcome::Hit));
                    }
                });
            } else {
                missing.push(chunk.index);
            }
        }
        missing
    }
}
