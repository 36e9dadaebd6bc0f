// Pipeline counters shared by the cache, the worker pool and the scheduler.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use serde::Serialize;

#[derive(Debug, Default)]
pub struct PipelineMetrics {
    engine_calls: AtomicU64,
    engine_failures: AtomicU64,
    engine_retries: AtomicU64,
    total_synthesis_time_ms: AtomicU64,
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
    chunks_stored: AtomicU64,
    chapters_assembled: AtomicU64,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
    active_chapters: AtomicUsize,
    peak_active_chapters: AtomicUsize,
}

/// Decrements its gauge when dropped.
pub struct GaugeGuard {
    metrics: Arc<PipelineMetrics>,
    chapter: bool,
}

impl Drop for GaugeGuard {
    fn drop(&mut self) {
        let gauge = if self.chapter {
            &self.metrics.active_chapters
        } else {
            &self.metrics.in_flight
        };
        gauge.fetch_sub(1, Ordering::SeqCst);
    }
}

impl PipelineMetrics {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Count one engine call as in flight until the guard drops.
    pub fn enter_engine(self: &Arc<Self>) -> GaugeGuard {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(now, Ordering::SeqCst);
        self.engine_calls.fetch_add(1, Ordering::Relaxed);
        GaugeGuard {
            metrics: Arc::clone(self),
            chapter: false,
        }
    }

    /// Count one chapter as actively synthesizing until the guard drops.
    pub fn enter_chapter(self: &Arc<Self>) -> GaugeGuard {
        let now = self.active_chapters.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_active_chapters.fetch_max(now, Ordering::SeqCst);
        GaugeGuard {
            metrics: Arc::clone(self),
            chapter: true,
        }
    }

    pub fn record_synthesis(&self, time_ms: u64) {
        self.total_synthesis_time_ms.fetch_add(time_ms, Ordering::Relaxed);
    }

    pub fn record_engine_failure(&self) {
        self.engine_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_retry(&self) {
        self.engine_retries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cache_hit(&self) {
        self.cache_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cache_miss(&self) {
        self.cache_misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_chunk_stored(&self) {
        self.chunks_stored.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_chapter_assembled(&self) {
        self.chapters_assembled.fetch_add(1, Ordering::Relaxed);
    }

    pub fn peak_in_flight(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }

    pub fn peak_active_chapters(&self) -> usize {
        self.peak_active_chapters.load(Ordering::SeqCst)
    }

    pub fn engine_calls(&self) -> u64 {
        self.engine_calls.load(Ordering::Relaxed)
    }

    pub fn avg_synthesis_time_ms(&self) -> f64 {
        let calls = self.engine_calls.load(Ordering::Relaxed);
        if calls == 0 {
            return 0.0;
        }
        self.total_synthesis_time_ms.load(Ordering::Relaxed) as f64 / calls as f64
    }

    pub fn cache_hit_rate(&self) -> f64 {
        let hits = self.cache_hits.load(Ordering::Relaxed);
        let misses = self.cache_misses.load(Ordering::Relaxed);
        let total = hits + misses;
        if total == 0 {
            return 0.0;
        }
        (hits as f64 / total as f64) * 100.0
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            engine_calls: self.engine_calls.load(Ordering::Relaxed),
            engine_failures: self.engine_failures.load(Ordering::Relaxed),
            engine_retries: self.engine_retries.load(Ordering::Relaxed),
            avg_synthesis_time_ms: self.avg_synthesis_time_ms(),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            cache_misses: self.cache_misses.load(Ordering::Relaxed),
            cache_hit_rate: self.cache_hit_rate(),
            chunks_stored: self.chunks_stored.load(Ordering::Relaxed),
            chapters_assembled: self.chapters_assembled.load(Ordering::Relaxed),
            in_flight: self.in_flight.load(Ordering::SeqCst),
            peak_in_flight: self.peak_in_flight(),
            active_chapters: self.active_chapters.load(Ordering::SeqCst),
            peak_active_chapters: self.peak_active_chapters(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub engine_calls: u64,
    pub engine_failures: u64,
    pub engine_retries: u64,
    pub avg_synthesis_time_ms: f64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub cache_hit_rate: f64,
    pub chunks_stored: u64,
    pub chapters_assembled: u64,
    pub in_flight: usize,
    pub peak_in_flight: usize,
    pub active_chapters: usize,
    pub peak_active_chapters: usize,
}
