//! Job registry and batch runs.
//!
//! At most one job exists per chapter at a time: a batch run, a streaming
//! request and a playback session asking for the same chapter all get the
//! same [`JobHandle`]. Chapters run concurrently up to the pool size.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use engine_core::SynthesisEngine;
use serde::Serialize;
use tokio::sync::{Mutex, Semaphore};
use tracing::{error, info, warn};

use crate::assembler::{Assembler, Encoder};
use crate::cache::{CacheScope, ChunkCache};
use crate::error::{PipelineError, Result};
use crate::job::{self, ChapterKey, ChapterPlan, JobContext, JobHandle, JobState, RunContext};
use crate::library::{Book, Chapter};
use crate::metrics::PipelineMetrics;
use crate::pool::{RetryPolicy, SynthesisPool};
use crate::report::{ChapterReport, RunReport};
use crate::settings::PipelineSettings;

/// State of a chapter's assembled file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputState {
    Missing,
    /// Present and backed by a complete cache (or no cache at all).
    Valid,
    /// Present, but its cache has no completion marker: an interrupted run.
    Stale,
}

/// Result of asking for a chapter to be synthesized.
#[derive(Clone)]
pub enum JobStart {
    Assembled(PathBuf),
    Running(JobHandle),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StartMode {
    /// Skip chapters with a valid output.
    Batch,
    /// Always produce a job; assemble only if the output is not valid.
    Attach,
    /// Drop the chapter's cache and output, then start over.
    Restart,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChunkStatus {
    pub index: usize,
    pub start: usize,
    pub end: usize,
    pub chars: usize,
    pub identity: String,
    pub cached: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChapterStatus {
    pub book: String,
    pub chapter: String,
    pub index: usize,
    pub title: String,
    pub track_number: u32,
    pub output: PathBuf,
    pub output_state: OutputState,
    pub total_chunks: usize,
    pub cached_chunks: usize,
    pub job: Option<JobState>,
    pub chunks: Vec<ChunkStatus>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct PurgeReport {
    pub chunks_removed: usize,
    pub outputs_removed: usize,
}

pub struct JobScheduler {
    settings: Arc<PipelineSettings>,
    cache: ChunkCache,
    pool: Arc<SynthesisPool>,
    assembler: Arc<Assembler>,
    chapter_permits: Arc<Semaphore>,
    metrics: Arc<PipelineMetrics>,
    registry: Mutex<HashMap<ChapterKey, JobHandle>>,
    // Serializes job starts per chapter; the registry lock is only held
    // for lookups and inserts.
    starting: DashMap<ChapterKey, Arc<Mutex<()>>>,
}

impl JobScheduler {
    pub fn new(
        settings: PipelineSettings,
        engine: Arc<dyn SynthesisEngine>,
        encoder: Arc<dyn Encoder>,
    ) -> Self {
        let metrics = PipelineMetrics::new();
        let workers = settings.worker_limit();
        let pool = SynthesisPool::new(
            engine,
            workers,
            RetryPolicy {
                attempts: settings.retry_attempts,
                backoff: settings.retry_backoff(),
            },
            Arc::clone(&metrics),
        );
        info!("Synthesis pool ready with {} workers", workers);

        Self {
            cache: ChunkCache::new(settings.cache_dir.clone(), Arc::clone(&metrics)),
            pool: Arc::new(pool),
            assembler: Arc::new(Assembler::new(encoder, Arc::clone(&metrics))),
            chapter_permits: Arc::new(Semaphore::new(workers)),
            settings: Arc::new(settings),
            metrics,
            registry: Mutex::new(HashMap::new()),
            starting: DashMap::new(),
        }
    }

    pub fn settings(&self) -> &PipelineSettings {
        &self.settings
    }

    pub fn cache(&self) -> &ChunkCache {
        &self.cache
    }

    pub fn metrics(&self) -> Arc<PipelineMetrics> {
        Arc::clone(&self.metrics)
    }

    pub fn output_extension(&self) -> &'static str {
        self.assembler.extension()
    }

    pub async fn output_state(&self, book: &Book, chapter: &Chapter) -> OutputState {
        let output = chapter.output_path(self.output_extension());
        if !tokio::fs::try_exists(&output).await.unwrap_or(false) {
            return OutputState::Missing;
        }
        let cache = self.cache.chapter(book, chapter);
        if cache.exists().await && !cache.is_complete().await {
            OutputState::Stale
        } else {
            OutputState::Valid
        }
    }

    /// Chunk plan of a chapter, without starting anything.
    pub async fn plan(&self, book: &Book, chapter: &Chapter) -> Result<ChapterPlan> {
        let track_total = book.chapters()?.len();
        ChapterPlan::build(
            book,
            chapter,
            &self.settings,
            &self.cache,
            self.output_extension(),
            track_total,
        )
        .await
    }

    /// Start (or join) synthesis of a chapter, unless its output is
    /// already valid.
    pub async fn ensure_job(&self, book: &Book, chapter: &Chapter) -> Result<JobStart> {
        self.start_or_join(book, chapter, StartMode::Batch, RunContext::new()).await
    }

    /// Job serving chunks of a chapter to a listener. Joins the in-flight
    /// job if there is one.
    pub async fn attach(&self, book: &Book, chapter: &Chapter) -> Result<JobHandle> {
        match self
            .start_or_join(book, chapter, StartMode::Attach, RunContext::new())
            .await?
        {
            JobStart::Running(handle) => Ok(handle),
            JobStart::Assembled(path) => Err(PipelineError::InvalidInput(format!(
                "no job for already assembled {}",
                path.display()
            ))),
        }
    }

    /// Throw away a chapter's cache and output and synthesize it again.
    pub async fn restart(&self, book: &Book, chapter: &Chapter) -> Result<JobHandle> {
        match self
            .start_or_join(book, chapter, StartMode::Restart, RunContext::new())
            .await?
        {
            JobStart::Running(handle) => Ok(handle),
            JobStart::Assembled(path) => Err(PipelineError::InvalidInput(format!(
                "restart left {} in place",
                path.display()
            ))),
        }
    }

    /// The chapter's current job, if one is still running.
    pub async fn active_job(&self, key: &ChapterKey) -> Option<JobHandle> {
        self.registry
            .lock()
            .await
            .get(key)
            .filter(|handle| !handle.is_finished())
            .cloned()
    }

    /// Last job known for the chapter, finished or not.
    pub async fn last_job(&self, key: &ChapterKey) -> Option<JobHandle> {
        self.registry.lock().await.get(key).cloned()
    }

    /// Cancel the chapter's running job. Returns false if none was running.
    pub async fn abort(&self, key: &ChapterKey) -> bool {
        match self.active_job(key).await {
            Some(handle) => {
                info!("Aborting {}", key);
                handle.cancel();
                true
            }
            None => false,
        }
    }

    async fn start_or_join(
        &self,
        book: &Book,
        chapter: &Chapter,
        mode: StartMode,
        run: Arc<RunContext>,
    ) -> Result<JobStart> {
        let key = ChapterKey::new(book, chapter);
        let gate = Arc::clone(self.starting.entry(key.clone()).or_default().value());
        let _starting = gate.lock().await;

        if let Some(existing) = self.active_job(&key).await {
            if mode != StartMode::Restart {
                return Ok(JobStart::Running(existing));
            }
            existing.cancel();
            existing.wait().await;
        }

        let output = chapter.output_path(self.output_extension());
        let assemble = match mode {
            StartMode::Restart => {
                self.cache.clear(CacheScope::Chapter(book, chapter)).await?;
                remove_if_exists(&output).await?;
                true
            }
            StartMode::Batch | StartMode::Attach => match self.output_state(book, chapter).await {
                OutputState::Valid if !self.settings.overwrite => {
                    if mode == StartMode::Batch {
                        return Ok(JobStart::Assembled(output));
                    }
                    false
                }
                OutputState::Stale => {
                    warn!("Removing partial output {}", output.display());
                    remove_if_exists(&output).await?;
                    true
                }
                OutputState::Valid | OutputState::Missing => true,
            },
        };

        let plan = self.plan(book, chapter).await?;
        plan.cache.prepare().await?;
        let handle = job::start(
            plan,
            JobContext {
                pool: Arc::clone(&self.pool),
                assembler: Arc::clone(&self.assembler),
                chapter_permits: Arc::clone(&self.chapter_permits),
                metrics: Arc::clone(&self.metrics),
                run,
                assemble,
                keep_cache: self.settings.keep_cache,
                allow_partial: self.settings.allow_partial,
            },
        );
        self.registry.lock().await.insert(key, handle.clone());
        Ok(JobStart::Running(handle))
    }

    /// Synthesize and assemble every chapter of `book` from position
    /// `start_offset` on. Chapters are independent: one failing chapter
    /// does not stop the others. The whole run stops early only if the
    /// engine turns out to be unreachable before anything was synthesized.
    pub async fn run_book(&self, book: &Book, start_offset: usize) -> Result<RunReport> {
        let chapters = book.chapters()?;
        if start_offset > 0 && start_offset >= chapters.len() {
            return Err(PipelineError::InvalidInput(format!(
                "start offset {} is past the last chapter ({} chapters)",
                start_offset,
                chapters.len()
            )));
        }
        let selected = &chapters[start_offset..];
        info!(
            "Processing {} chapters of {} with {} workers",
            selected.len(),
            book.id,
            self.settings.effective_jobs(selected.len())
        );

        let run = RunContext::new();
        let mut reports = Vec::with_capacity(selected.len());
        let mut handles = Vec::new();
        for chapter in selected {
            match self
                .start_or_join(book, chapter, StartMode::Batch, Arc::clone(&run))
                .await
            {
                Ok(JobStart::Assembled(path)) => {
                    info!("Skipping {}: {} exists", chapter.id, path.display());
                    reports.push(ChapterReport::skipped(chapter, path));
                }
                Ok(JobStart::Running(handle)) => handles.push(handle),
                Err(err) => {
                    error!("Cannot start {}: {}", chapter.id, err);
                    reports.push(ChapterReport::not_started(chapter, &err));
                }
            }
        }
        for handle in handles {
            reports.push(handle.wait().await);
        }
        reports.sort_by_key(|r| r.index);

        if let Some(err) = run.aborted() {
            return Err(err);
        }
        Ok(RunReport {
            book: book.id.clone(),
            chapters: reports,
        })
    }

    /// Chunk list of a chapter with per-chunk cache state.
    pub async fn chapter_status(&self, book: &Book, chapter: &Chapter) -> Result<ChapterStatus> {
        let plan = self.plan(book, chapter).await?;
        let mut chunks = Vec::with_capacity(plan.len());
        for chunk in &plan.chunks {
            chunks.push(ChunkStatus {
                index: chunk.index,
                start: chunk.start,
                end: chunk.end,
                chars: chunk.text.chars().count(),
                identity: chunk.identity.to_string(),
                cached: plan.cache.lookup(&chunk.identity).await,
            });
        }
        let job = self
            .last_job(&ChapterKey::new(book, chapter))
            .await
            .map(|handle| handle.progress().state);

        Ok(ChapterStatus {
            book: book.id.clone(),
            chapter: chapter.id.clone(),
            index: chapter.index,
            title: chapter.title.clone(),
            track_number: chapter.track_number,
            output: plan.output.clone(),
            output_state: self.output_state(book, chapter).await,
            total_chunks: plan.len(),
            cached_chunks: chunks.iter().filter(|c| c.cached).count(),
            job,
            chunks,
        })
    }

    /// Remove the book's cache, and its assembled outputs when asked to.
    /// Running jobs of the book are cancelled first.
    pub async fn purge(&self, book: &Book, include_outputs: bool) -> Result<PurgeReport> {
        let running: Vec<JobHandle> = self
            .registry
            .lock()
            .await
            .iter()
            .filter(|(key, handle)| key.book == book.id && !handle.is_finished())
            .map(|(_, handle)| handle.clone())
            .collect();
        for handle in &running {
            handle.cancel();
            handle.wait().await;
        }

        let mut report = PurgeReport {
            chunks_removed: self.cache.clear(CacheScope::Book(book)).await?,
            outputs_removed: 0,
        };
        if include_outputs {
            for chapter in book.chapters()? {
                if remove_if_exists(&chapter.output_path(self.output_extension())).await? {
                    report.outputs_removed += 1;
                }
            }
        }
        info!(
            "Purged {}: {} chunks, {} outputs",
            book.id, report.chunks_removed, report.outputs_removed
        );
        Ok(report)
    }
}

async fn remove_if_exists(path: &std::path::Path) -> Result<bool> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(PipelineError::storage(path, e)),
    }
}
