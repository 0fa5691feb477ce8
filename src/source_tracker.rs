/// Per-Job Source Tracker
///
/// Scores the sources participating in one download so chunk workers keep
/// steering work toward whichever endpoint is currently delivering. The
/// table lives only as long as the job and is independent of the cross-job
/// peer scorer: it tracks the handful of sources chosen for this download,
/// nothing else.
use crate::source::{Source, SourceKind};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;

const NEUTRAL_SCORE: f64 = 0.5;
/// Unknown peers get a nudge over unknown mirrors so the overlay is tried
/// first when nothing is known yet.
const PEER_PRIOR: f64 = 0.55;
const RELIABILITY_WEIGHT: f64 = 0.6;
const THROUGHPUT_WEIGHT: f64 = 0.4;
const REFERENCE_THROUGHPUT_BPS: f64 = 10.0 * 1024.0 * 1024.0;
const FAILURE_COOLDOWN: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Default)]
struct SourceJobStats {
    success_count: u64,
    failure_count: u64,
    total_bytes: u64,
    total_time: Duration,
    last_failure: Option<Instant>,
}

impl SourceJobStats {
    fn score(&self, now: Instant) -> f64 {
        let total = self.success_count + self.failure_count;
        if total == 0 {
            return NEUTRAL_SCORE;
        }

        let reliability = self.success_count as f64 / total as f64;
        let throughput = if self.total_time.as_secs_f64() > 0.0 {
            self.total_bytes as f64 / self.total_time.as_secs_f64()
        } else {
            0.0
        };
        let throughput_score = throughput / (throughput + REFERENCE_THROUGHPUT_BPS);

        let mut score = RELIABILITY_WEIGHT * reliability + THROUGHPUT_WEIGHT * throughput_score;
        if let Some(at) = self.last_failure {
            if now.duration_since(at) < FAILURE_COOLDOWN {
                score *= 0.5;
            }
        }
        score
    }
}

#[derive(Default)]
pub struct SourceTracker {
    stats: Mutex<HashMap<String, SourceJobStats>>,
}

impl SourceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pick the best source for the next chunk attempt. Ties go to the
    /// earlier entry in `sources`, so the caller's preference ordering is
    /// the tiebreak. Returns the index into `sources`.
    pub fn select(&self, sources: &[Source]) -> Option<usize> {
        if sources.is_empty() {
            return None;
        }
        let now = Instant::now();
        let stats = self.stats.lock().unwrap();

        let mut best = 0;
        let mut best_score = f64::MIN;
        for (i, source) in sources.iter().enumerate() {
            let score = match stats.get(source.id()) {
                Some(s) => s.score(now),
                None => match source.kind() {
                    SourceKind::Peer => PEER_PRIOR,
                    SourceKind::Mirror => NEUTRAL_SCORE,
                },
            };
            if score > best_score {
                best = i;
                best_score = score;
            }
        }
        Some(best)
    }

    pub fn record_success(&self, source_id: &str, bytes: u64, elapsed: Duration) {
        let mut stats = self.stats.lock().unwrap();
        let entry = stats.entry(source_id.to_string()).or_default();
        entry.success_count += 1;
        entry.total_bytes += bytes;
        entry.total_time += elapsed;
    }

    pub fn record_failure(&self, source_id: &str) {
        let mut stats = self.stats.lock().unwrap();
        let entry = stats.entry(source_id.to_string()).or_default();
        entry.failure_count += 1;
        entry.last_failure = Some(Instant::now());
    }

    pub fn failures(&self, source_id: &str) -> u64 {
        self.stats
            .lock()
            .unwrap()
            .get(source_id)
            .map(|s| s.failure_count)
            .unwrap_or(0)
    }

    pub fn successes(&self, source_id: &str) -> u64 {
        self.stats
            .lock()
            .unwrap()
            .get(source_id)
            .map(|s| s.success_count)
            .unwrap_or(0)
    }
}
