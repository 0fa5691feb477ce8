/// Engine Metrics
///
/// In-process counters, gauges and histograms populated by the download
/// engine and the multi-source verifier. The registry is a plain struct of
/// atomics so recording never blocks a worker; scrapers take a point-in-time
/// snapshot.
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

/// Fixed-bucket histogram. Buckets are cumulative upper bounds, the last
/// one catches everything above.
#[derive(Debug)]
pub struct Histogram {
    bounds: Vec<f64>,
    counts: Vec<AtomicU64>,
    sum: Mutex<f64>,
    total: AtomicU64,
}

impl Histogram {
    pub fn new(bounds: Vec<f64>) -> Self {
        let mut counts = Vec::with_capacity(bounds.len() + 1);
        for _ in 0..=bounds.len() {
            counts.push(AtomicU64::new(0));
        }
        Self {
            bounds,
            counts,
            sum: Mutex::new(0.0),
            total: AtomicU64::new(0),
        }
    }

    pub fn observe(&self, value: f64) {
        let idx = self
            .bounds
            .iter()
            .position(|b| value <= *b)
            .unwrap_or(self.bounds.len());
        self.counts[idx].fetch_add(1, Ordering::Relaxed);
        self.total.fetch_add(1, Ordering::Relaxed);
        *self.sum.lock().unwrap() += value;
    }

    pub fn count(&self) -> u64 {
        self.total.load(Ordering::Relaxed)
    }

    pub fn sum(&self) -> f64 {
        *self.sum.lock().unwrap()
    }

    pub fn mean(&self) -> f64 {
        let count = self.count();
        if count == 0 {
            0.0
        } else {
            self.sum() / count as f64
        }
    }

    fn snapshot(&self) -> HistogramSnapshot {
        HistogramSnapshot {
            count: self.count(),
            sum: self.sum(),
            buckets: self
                .bounds
                .iter()
                .zip(self.counts.iter())
                .map(|(b, c)| (*b, c.load(Ordering::Relaxed)))
                .collect(),
            overflow: self.counts[self.bounds.len()].load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct HistogramSnapshot {
    pub count: u64,
    pub sum: f64,
    pub buckets: Vec<(f64, u64)>,
    pub overflow: u64,
}

/// Metric sinks produced by the engine and verifier.
#[derive(Debug)]
pub struct MetricsRegistry {
    active_downloads: AtomicI64,
    verification_failures: AtomicU64,
    verification_results: Mutex<HashMap<String, u64>>,
    chunk_download_time: Histogram,
    verification_providers: Histogram,
    verification_duration: Histogram,
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self {
            active_downloads: AtomicI64::new(0),
            verification_failures: AtomicU64::new(0),
            verification_results: Mutex::new(HashMap::new()),
            // seconds
            chunk_download_time: Histogram::new(vec![0.1, 0.5, 1.0, 5.0, 10.0, 30.0]),
            verification_providers: Histogram::new(vec![1.0, 2.0, 5.0, 10.0, 25.0]),
            verification_duration: Histogram::new(vec![0.05, 0.25, 1.0, 5.0, 10.0]),
        }
    }

    pub fn download_started(&self) {
        self.active_downloads.fetch_add(1, Ordering::Relaxed);
    }

    pub fn download_finished(&self) {
        self.active_downloads.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn active_downloads(&self) -> i64 {
        self.active_downloads.load(Ordering::Relaxed)
    }

    pub fn observe_chunk_time(&self, elapsed: Duration) {
        self.chunk_download_time.observe(elapsed.as_secs_f64());
    }

    pub fn chunk_download_time(&self) -> &Histogram {
        &self.chunk_download_time
    }

    pub fn record_verification_failure(&self) {
        self.verification_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn verification_failures(&self) -> u64 {
        self.verification_failures.load(Ordering::Relaxed)
    }

    pub fn record_verification_result(&self, kind: &str) {
        let mut results = self.verification_results.lock().unwrap();
        *results.entry(kind.to_string()).or_insert(0) += 1;
    }

    pub fn verification_result(&self, kind: &str) -> u64 {
        self.verification_results
            .lock()
            .unwrap()
            .get(kind)
            .copied()
            .unwrap_or(0)
    }

    pub fn observe_verification_providers(&self, count: usize) {
        self.verification_providers.observe(count as f64);
    }

    pub fn observe_verification_duration(&self, elapsed: Duration) {
        self.verification_duration.observe(elapsed.as_secs_f64());
    }

    /// Point-in-time copy of every sink, for display or scraping.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            active_downloads: self.active_downloads(),
            verification_failures: self.verification_failures(),
            verification_results: self.verification_results.lock().unwrap().clone(),
            chunk_download_time: self.chunk_download_time.snapshot(),
            verification_providers: self.verification_providers.snapshot(),
            verification_duration: self.verification_duration.snapshot(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub active_downloads: i64,
    pub verification_failures: u64,
    pub verification_results: HashMap<String, u64>,
    pub chunk_download_time: HistogramSnapshot,
    pub verification_providers: HistogramSnapshot,
    pub verification_duration: HistogramSnapshot,
}
