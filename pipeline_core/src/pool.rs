//! Bounded pool of engine calls.
//!
//! Every engine call in the process goes through one semaphore of `N`
//! permits. Two lanes share it: background work (batch synthesis) and
//! priority work (chunks a listener is waiting for). While any priority
//! request is queued, background requests do not take permits, so the
//! next free slot goes to the listener. Calls already running are never
//! interrupted.
//!
//! Concurrent requests for the same chunk identity are coalesced: the
//! second caller waits for the first and then finds the chunk cached.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use engine_core::{SynthesisEngine, SynthesisRequest};
use tokio::sync::{Mutex, Notify, OwnedSemaphorePermit, Semaphore};
use tracing::{debug, warn};

use crate::cache::ChapterCache;
use crate::error::{PipelineError, Result};
use crate::identity::ChunkIdentity;
use crate::metrics::PipelineMetrics;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lane {
    Background,
    Priority,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkOutcome {
    /// Already in the cache; no engine call was made.
    Hit,
    /// Synthesized and stored by this call.
    Synthesized,
}

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub backoff: Duration,
}

impl RetryPolicy {
    fn delay(&self, attempt: u32) -> Duration {
        self.backoff.saturating_mul(1u32 << attempt.saturating_sub(1).min(6))
    }
}

pub struct SynthesisPool {
    engine: Arc<dyn SynthesisEngine>,
    permits: Arc<Semaphore>,
    capacity: usize,
    priority_waiting: AtomicUsize,
    priority_drained: Notify,
    in_flight: DashMap<ChunkIdentity, Arc<Mutex<()>>>,
    retry: RetryPolicy,
    metrics: Arc<PipelineMetrics>,
}

impl SynthesisPool {
    pub fn new(
        engine: Arc<dyn SynthesisEngine>,
        capacity: usize,
        retry: RetryPolicy,
        metrics: Arc<PipelineMetrics>,
    ) -> Self {
        let capacity = capacity.max(1);
        Self {
            engine,
            permits: Arc::new(Semaphore::new(capacity)),
            capacity,
            priority_waiting: AtomicUsize::new(0),
            priority_drained: Notify::new(),
            in_flight: DashMap::new(),
            retry,
            metrics,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn endpoint(&self) -> String {
        self.engine.endpoint()
    }

    /// Make sure the chunk `id` is in `cache`, synthesizing it if needed.
    pub async fn ensure_cached(
        &self,
        cache: &ChapterCache,
        id: &ChunkIdentity,
        request: &SynthesisRequest,
        lane: Lane,
    ) -> Result<ChunkOutcome> {
        if cache.lookup(id).await {
            self.metrics.record_cache_hit();
            return Ok(ChunkOutcome::Hit);
        }

        let permit = self.acquire(lane).await?;
        let lock = self
            .in_flight
            .entry(id.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();

        let outcome = {
            let _guard = lock.lock().await;
            self.synthesize_locked(cache, id, request).await
        };
        drop(permit);
        drop(lock);

        // Only the map still holds it: nobody else is waiting on this identity.
        self.in_flight.remove_if(id, |_, entry| Arc::strong_count(entry) == 1);
        outcome
    }

    async fn synthesize_locked(
        &self,
        cache: &ChapterCache,
        id: &ChunkIdentity,
        request: &SynthesisRequest,
    ) -> Result<ChunkOutcome> {
        if cache.lookup(id).await {
            debug!(chunk = id.short(), "chunk produced by a concurrent request");
            self.metrics.record_cache_hit();
            return Ok(ChunkOutcome::Hit);
        }
        self.metrics.record_cache_miss();
        let audio = self.call_engine(request).await?;
        cache.store(id, &audio).await?;
        Ok(ChunkOutcome::Synthesized)
    }

    async fn call_engine(&self, request: &SynthesisRequest) -> Result<Vec<u8>> {
        let attempts = self.retry.attempts.max(1);
        let mut attempt = 0;
        loop {
            attempt += 1;
            let started = Instant::now();
            let result = {
                let _in_flight = self.metrics.enter_engine();
                self.engine.synthesize(request).await
            };
            match result {
                Ok(audio) => {
                    self.metrics.record_synthesis(started.elapsed().as_millis() as u64);
                    return Ok(audio);
                }
                Err(err) if err.is_retryable() && attempt < attempts => {
                    let delay = self.retry.delay(attempt);
                    warn!(
                        "Engine call failed (attempt {}/{}), retrying in {}ms: {}",
                        attempt,
                        attempts,
                        delay.as_millis(),
                        err
                    );
                    self.metrics.record_retry();
                    tokio::time::sleep(delay).await;
                }
                Err(err) => {
                    self.metrics.record_engine_failure();
                    return Err(err.into());
                }
            }
        }
    }

    async fn acquire(&self, lane: Lane) -> Result<OwnedSemaphorePermit> {
        match lane {
            Lane::Priority => {
                self.priority_waiting.fetch_add(1, Ordering::SeqCst);
                let permit = Arc::clone(&self.permits).acquire_owned().await;
                if self.priority_waiting.fetch_sub(1, Ordering::SeqCst) == 1 {
                    self.priority_drained.notify_waiters();
                }
                permit.map_err(|_| PipelineError::Cancelled)
            }
            Lane::Background => loop {
                while self.priority_waiting.load(Ordering::SeqCst) > 0 {
                    let drained = self.priority_drained.notified();
                    if self.priority_waiting.load(Ordering::SeqCst) == 0 {
                        break;
                    }
                    drained.await;
                }
                let permit = Arc::clone(&self.permits)
                    .acquire_owned()
                    .await
                    .map_err(|_| PipelineError::Cancelled)?;
                if self.priority_waiting.load(Ordering::SeqCst) == 0 {
                    return Ok(permit);
                }
                // A listener queued up while we waited; let it go first.
                drop(permit);
                tokio::task::yield_now().await;
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::ChunkCache;
    use crate::library::Book;
    use crate::settings::VoiceSettings;
    use crate::testing::ScriptedEngine;
    use tempfile::TempDir;

    struct Fixture {
        _root: TempDir,
        cache: ChapterCache,
        engine: Arc<ScriptedEngine>,
        metrics: Arc<PipelineMetrics>,
    }

    fn fixture(engine: ScriptedEngine) -> Fixture {
        let root = TempDir::new().unwrap();
        let dir = root.path().join("book");
        std::fs::create_dir(&dir).unwrap();
        std::fs::write(dir.join("01.txt"), "x").unwrap();
        let book = Book::open(&dir).unwrap();
        let chapter = book.chapter("01.txt").unwrap();
        let metrics = PipelineMetrics::new();
        let cache = ChunkCache::new(None, Arc::clone(&metrics)).chapter(&book, &chapter);
        Fixture {
            _root: root,
            cache,
            engine: Arc::new(engine),
            metrics,
        }
    }

    fn pool(f: &Fixture, capacity: usize, attempts: u32) -> Arc<SynthesisPool> {
        Arc::new(SynthesisPool::new(
            f.engine.clone(),
            capacity,
            RetryPolicy {
                attempts,
                backoff: Duration::from_millis(1),
            },
            Arc::clone(&f.metrics),
        ))
    }

    fn request(text: &str) -> (ChunkIdentity, SynthesisRequest) {
        let voice = VoiceSettings::default();
        (
            ChunkIdentity::compute(text, &voice, None),
            SynthesisRequest::new(text, voice.engine_params()),
        )
    }

    #[tokio::test]
    async fn test_second_request_is_a_cache_hit() {
        let f = fixture(ScriptedEngine::new());
        let pool = pool(&f, 2, 1);
        let (id, req) = request("一文目。");

        let first = pool.ensure_cached(&f.cache, &id, &req, Lane::Background).await.unwrap();
        let second = pool.ensure_cached(&f.cache, &id, &req, Lane::Background).await.unwrap();
        assert_eq!(first, ChunkOutcome::Synthesized);
        assert_eq!(second, ChunkOutcome::Hit);
        assert_eq!(f.engine.calls(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_requests_for_same_identity_coalesce() {
        let f = fixture(ScriptedEngine::new().with_delay(Duration::from_millis(50)));
        let pool = pool(&f, 4, 1);
        let (id, req) = request("同じ文。");

        let mut tasks = Vec::new();
        for _ in 0..4 {
            let (pool, cache, id, req) = (pool.clone(), f.cache.clone(), id.clone(), req.clone());
            tasks.push(tokio::spawn(async move {
                pool.ensure_cached(&cache, &id, &req, Lane::Background).await
            }));
        }
        for task in tasks {
            task.await.unwrap().unwrap();
        }
        assert_eq!(f.engine.calls(), 1);
        assert!(pool.in_flight.is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_in_flight_calls_never_exceed_capacity() {
        let f = fixture(ScriptedEngine::new().with_delay(Duration::from_millis(20)));
        let pool = pool(&f, 3, 1);

        let mut tasks = Vec::new();
        for i in 0..12 {
            let (pool, cache) = (pool.clone(), f.cache.clone());
            let (id, req) = request(&format!("文 {i}。"));
            let lane = if i % 3 == 0 { Lane::Priority } else { Lane::Background };
            tasks.push(tokio::spawn(async move {
                pool.ensure_cached(&cache, &id, &req, lane).await
            }));
        }
        for task in tasks {
            task.await.unwrap().unwrap();
        }
        assert_eq!(f.engine.calls(), 12);
        assert!(f.metrics.peak_in_flight() <= 3);
        assert!(f.engine.peak_concurrency() <= 3);
    }

    #[tokio::test]
    async fn test_transient_failures_are_retried() {
        let f = fixture(ScriptedEngine::new().fail_first("不安定。", 2));
        let pool = pool(&f, 1, 3);
        let (id, req) = request("不安定。");

        let outcome = pool.ensure_cached(&f.cache, &id, &req, Lane::Background).await.unwrap();
        assert_eq!(outcome, ChunkOutcome::Synthesized);
        assert_eq!(f.engine.calls(), 3);
        assert!(f.cache.lookup(&id).await);
    }

    #[tokio::test]
    async fn test_rejection_is_not_retried() {
        let f = fixture(ScriptedEngine::new().reject("拒否。"));
        let pool = pool(&f, 1, 5);
        let (id, req) = request("拒否。");

        let err = pool.ensure_cached(&f.cache, &id, &req, Lane::Background).await.unwrap_err();
        assert!(matches!(err, PipelineError::EngineRejected(_)));
        assert_eq!(f.engine.calls(), 1);
        assert!(!f.cache.lookup(&id).await);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_priority_request_overtakes_queued_background_work() {
        let f = fixture(ScriptedEngine::new().with_delay(Duration::from_millis(40)));
        let pool = pool(&f, 1, 1);

        // Occupy the only slot, then queue background work behind it.
        let mut background = Vec::new();
        for i in 0..4 {
            let (pool, cache) = (pool.clone(), f.cache.clone());
            let (id, req) = request(&format!("背景 {i}。"));
            background.push(tokio::spawn(async move {
                pool.ensure_cached(&cache, &id, &req, Lane::Background).await
            }));
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        let (id, req) = request("優先。");
        pool.ensure_cached(&f.cache, &id, &req, Lane::Priority).await.unwrap();
        for task in background {
            task.await.unwrap().unwrap();
        }

        let order = f.engine.texts();
        let position = order.iter().position(|t| t == "優先。").unwrap();
        // At most the call already running (plus one that raced the queue)
        // may precede the priority request.
        assert!(position <= 2, "priority served at position {position}: {order:?}");
    }
}
