// Request metrics and the /metrics report

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use chrono::{DateTime, Utc};
use pipeline_core::MetricsSnapshot;
use serde::Serialize;

const LATENCY_SAMPLES: usize = 1000;

/// Counters for one route
#[derive(Debug)]
pub struct EndpointMetrics {
    request_count: AtomicU64,
    error_count: AtomicU64,
    total_latency_ms: AtomicU64,
    max_latency_ms: AtomicU64,
    // Last LATENCY_SAMPLES latencies, for percentiles
    samples: Mutex<VecDeque<u64>>,
}

impl EndpointMetrics {
    pub fn new() -> Self {
        Self {
            request_count: AtomicU64::new(0),
            error_count: AtomicU64::new(0),
            total_latency_ms: AtomicU64::new(0),
            max_latency_ms: AtomicU64::new(0),
            samples: Mutex::new(VecDeque::with_capacity(LATENCY_SAMPLES)),
        }
    }

    pub fn record(&self, latency_ms: u64, is_error: bool) {
        self.request_count.fetch_add(1, Ordering::Relaxed);
        self.total_latency_ms.fetch_add(latency_ms, Ordering::Relaxed);
        self.max_latency_ms.fetch_max(latency_ms, Ordering::Relaxed);
        if is_error {
            self.error_count.fetch_add(1, Ordering::Relaxed);
        }
        if let Ok(mut samples) = self.samples.lock() {
            if samples.len() == LATENCY_SAMPLES {
                samples.pop_front();
            }
            samples.push_back(latency_ms);
        }
    }

    pub fn request_count(&self) -> u64 {
        self.request_count.load(Ordering::Relaxed)
    }

    pub fn avg_latency_ms(&self) -> f64 {
        let count = self.request_count();
        if count == 0 {
            return 0.0;
        }
        self.total_latency_ms.load(Ordering::Relaxed) as f64 / count as f64
    }

    fn percentile(&self, p: usize) -> u64 {
        let Ok(samples) = self.samples.lock() else {
            return 0;
        };
        if samples.is_empty() {
            return 0;
        }
        let mut sorted: Vec<u64> = samples.iter().copied().collect();
        sorted.sort_unstable();
        sorted[(sorted.len() * p / 100).min(sorted.len() - 1)]
    }

    pub fn stats(&self) -> EndpointStats {
        EndpointStats {
            request_count: self.request_count(),
            error_count: self.error_count.load(Ordering::Relaxed),
            avg_latency_ms: self.avg_latency_ms(),
            max_latency_ms: self.max_latency_ms.load(Ordering::Relaxed),
            p50_latency_ms: self.percentile(50),
            p95_latency_ms: self.percentile(95),
            p99_latency_ms: self.percentile(99),
        }
    }
}

impl Default for EndpointMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Server-wide metrics, keyed by matched route
#[derive(Debug)]
pub struct AppMetrics {
    started: Instant,
    endpoints: Mutex<HashMap<String, Arc<EndpointMetrics>>>,
}

impl AppMetrics {
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
            endpoints: Mutex::new(HashMap::new()),
        }
    }

    pub fn record(&self, route: &str, latency_ms: u64, is_error: bool) {
        let endpoint = match self.endpoints.lock() {
            Ok(mut endpoints) => endpoints
                .entry(route.to_string())
                .or_insert_with(|| Arc::new(EndpointMetrics::new()))
                .clone(),
            Err(_) => return,
        };
        endpoint.record(latency_ms, is_error);
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.started.elapsed().as_secs()
    }

    pub fn request_count(&self) -> u64 {
        self.endpoints
            .lock()
            .map(|e| e.values().map(|m| m.request_count()).sum())
            .unwrap_or(0)
    }

    pub fn endpoint_stats(&self) -> BTreeMap<String, EndpointStats> {
        self.endpoints
            .lock()
            .map(|e| e.iter().map(|(route, m)| (route.clone(), m.stats())).collect())
            .unwrap_or_default()
    }
}

impl Default for AppMetrics {
    fn default() -> Self {
        Self::new()
    }
}

pub fn system_metrics(metrics: &AppMetrics) -> SystemMetrics {
    let mut system = sysinfo::System::new();
    system.refresh_cpu();
    system.refresh_memory();

    let memory_used = system.used_memory();
    let memory_total = system.total_memory();
    let memory_usage_percent = if memory_total > 0 {
        (memory_used as f64 / memory_total as f64 * 100.0) as f32
    } else {
        0.0
    };

    SystemMetrics {
        cpu_usage_percent: system.global_cpu_info().cpu_usage(),
        memory_used_mb: memory_used / 1024 / 1024,
        memory_total_mb: memory_total / 1024 / 1024,
        memory_usage_percent,
        request_count: metrics.request_count(),
        uptime_seconds: metrics.uptime_seconds(),
        system_load: sysinfo::System::load_average().one.into(),
    }
}

#[derive(Serialize)]
pub struct DetailedMetricsResponse {
    pub timestamp: DateTime<Utc>,
    pub system: SystemMetrics,
    pub endpoints: BTreeMap<String, EndpointStats>,
    pub pipeline: MetricsSnapshot,
}

#[derive(Serialize)]
pub struct SystemMetrics {
    pub cpu_usage_percent: f32,
    pub memory_used_mb: u64,
    pub memory_total_mb: u64,
    pub memory_usage_percent: f32,
    pub request_count: u64,
    pub uptime_seconds: u64,
    pub system_load: Option<f64>,
}

#[derive(Debug, Serialize)]
pub struct EndpointStats {
    pub request_count: u64,
    pub error_count: u64,
    pub avg_latency_ms: f64,
    pub max_latency_ms: u64,
    pub p50_latency_ms: u64,
    pub p95_latency_ms: u64,
    pub p99_latency_ms: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_percentiles() {
        let endpoint = EndpointMetrics::new();
        for latency in 1..=100 {
            endpoint.record(latency, latency % 10 == 0);
        }
        let stats = endpoint.stats();
        assert_eq!(stats.request_count, 100);
        assert_eq!(stats.error_count, 10);
        assert_eq!(stats.max_latency_ms, 100);
        assert_eq!(stats.p50_latency_ms, 51);
        assert!((stats.avg_latency_ms - 50.5).abs() < f64::EPSILON);
    }

    #[test]
    fn test_samples_are_bounded() {
        let endpoint = EndpointMetrics::new();
        for _ in 0..(LATENCY_SAMPLES + 10) {
            endpoint.record(1, false);
        }
        assert_eq!(endpoint.samples.lock().unwrap().len(), LATENCY_SAMPLES);
    }

    #[test]
    fn test_app_metrics_group_by_route() {
        let metrics = AppMetrics::new();
        metrics.record("/books", 3, false);
        metrics.record("/books", 5, false);
        metrics.record("/health", 1, false);
        let stats = metrics.endpoint_stats();
        assert_eq!(stats["/books"].request_count, 2);
        assert_eq!(metrics.request_count(), 3);
    }
}
