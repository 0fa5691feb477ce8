/// Peer Scorer
///
/// Cross-download reputation for overlay peers. Every transfer feeds
/// latency/throughput/success observations into an exponentially smoothed
/// per-peer record; the scorer turns those into a score in [0, 1] that
/// drives source selection and the adaptive rate limiter. Misbehaving peers
/// (bad bytes, protocol abuse) get a timed blacklist.
///
/// The whole table sits behind one read/write lock. Scoring reads take the
/// read lock and never touch I/O; observation updates take the write lock
/// and refresh the cached score in place.
use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::RwLock;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info};

const EMA_ALPHA: f64 = 0.3;
const MIN_SAMPLES: u64 = 3;
const NEUTRAL_SCORE: f64 = 0.5;
const MIN_SELECTABLE_SCORE: f64 = 0.1;
const REFERENCE_LATENCY_MS: f64 = 100.0;
const REFERENCE_THROUGHPUT_BPS: f64 = 10.0 * 1024.0 * 1024.0;
const SCORE_CACHE_TTL: Duration = Duration::from_secs(60);
const FRESHNESS_DECAY_HOURS: f64 = 24.0;
const DEFAULT_RETENTION: Duration = Duration::from_secs(24 * 3600);

/// Everything the scorer knows about one peer.
#[derive(Debug, Clone)]
struct PeerStats {
    avg_latency_ms: f64,
    avg_throughput_bps: f64,
    total_requests: u64,
    success_count: u64,
    failure_count: u64,
    bytes_down: u64,
    bytes_up: u64,
    first_seen: Instant,
    last_seen: Instant,
    last_success: Option<Instant>,
    last_failure: Option<Instant>,
    blacklisted: bool,
    blacklist_reason: Option<String>,
    blacklist_until: Option<Instant>,
    cached_score: f64,
    score_cached_at: Option<Instant>,
}

impl PeerStats {
    fn new(now: Instant) -> Self {
        Self {
            avg_latency_ms: 0.0,
            avg_throughput_bps: 0.0,
            total_requests: 0,
            success_count: 0,
            failure_count: 0,
            bytes_down: 0,
            bytes_up: 0,
            first_seen: now,
            last_seen: now,
            last_success: None,
            last_failure: None,
            blacklisted: false,
            blacklist_reason: None,
            blacklist_until: None,
            cached_score: NEUTRAL_SCORE,
            score_cached_at: None,
        }
    }

    fn success_rate(&self) -> f64 {
        if self.total_requests == 0 {
            0.0
        } else {
            self.success_count as f64 / self.total_requests as f64
        }
    }

    fn is_blacklisted_at(&self, now: Instant) -> bool {
        self.blacklisted && self.blacklist_until.map(|u| now < u).unwrap_or(false)
    }

    fn clear_expired_blacklist(&mut self, now: Instant) {
        if self.blacklisted && !self.is_blacklisted_at(now) {
            self.blacklisted = false;
            self.blacklist_reason = None;
            self.blacklist_until = None;
        }
    }

    fn compute_score(&self, now: Instant) -> f64 {
        if self.is_blacklisted_at(now) {
            return 0.0;
        }
        if self.total_requests < MIN_SAMPLES {
            return NEUTRAL_SCORE;
        }

        let latency_score = REFERENCE_LATENCY_MS / (REFERENCE_LATENCY_MS + self.avg_latency_ms);
        let throughput_score = (self.avg_throughput_bps
            / (self.avg_throughput_bps + REFERENCE_THROUGHPUT_BPS))
            .min(1.0);
        let reliability = self.success_rate();
        let hours_idle = now.duration_since(self.last_seen).as_secs_f64() / 3600.0;
        let freshness = (-hours_idle / FRESHNESS_DECAY_HOURS).exp();

        let score = 0.30 * latency_score
            + 0.30 * throughput_score
            + 0.25 * reliability
            + 0.15 * freshness;
        score.clamp(0.0, 1.0)
    }

    /// Cached score when still fresh, a recomputation otherwise.
    fn score_at(&self, now: Instant) -> f64 {
        if self.is_blacklisted_at(now) {
            return 0.0;
        }
        if let Some(at) = self.score_cached_at {
            if now.duration_since(at) < SCORE_CACHE_TTL {
                return self.cached_score;
            }
        }
        self.compute_score(now)
    }

    fn refresh_cache(&mut self, now: Instant) {
        self.cached_score = self.compute_score(now);
        self.score_cached_at = Some(now);
    }
}

/// Copy-out view of a peer's record for display and the adaptive limiter.
#[derive(Debug, Clone)]
pub struct PeerStatsSnapshot {
    pub peer_id: String,
    pub avg_latency_ms: f64,
    pub avg_throughput_bps: f64,
    pub success_rate: f64,
    pub total_requests: u64,
    pub success_count: u64,
    pub failure_count: u64,
    pub bytes_down: u64,
    pub bytes_up: u64,
    pub blacklisted: bool,
    pub blacklist_reason: Option<String>,
}

pub struct PeerScorer {
    peers: RwLock<HashMap<String, PeerStats>>,
    retention: Duration,
}

impl Default for PeerScorer {
    fn default() -> Self {
        Self::new()
    }
}

impl PeerScorer {
    pub fn new() -> Self {
        Self::with_retention(DEFAULT_RETENTION)
    }

    pub fn with_retention(retention: Duration) -> Self {
        Self {
            peers: RwLock::new(HashMap::new()),
            retention,
        }
    }

    /// Record a successful transfer from a peer.
    pub fn record_success(&self, peer: &str, bytes: u64, latency_ms: f64, throughput_bps: f64) {
        let now = Instant::now();
        let mut peers = self.peers.write().unwrap();
        let stats = peers
            .entry(peer.to_string())
            .or_insert_with(|| PeerStats::new(now));

        stats.total_requests += 1;
        stats.success_count += 1;
        stats.bytes_down += bytes;
        stats.last_seen = now;
        stats.last_success = Some(now);

        // First observation seeds the averages outright.
        if stats.success_count == 1 {
            stats.avg_latency_ms = latency_ms;
            stats.avg_throughput_bps = throughput_bps;
        } else {
            stats.avg_latency_ms = EMA_ALPHA * latency_ms + (1.0 - EMA_ALPHA) * stats.avg_latency_ms;
            stats.avg_throughput_bps =
                EMA_ALPHA * throughput_bps + (1.0 - EMA_ALPHA) * stats.avg_throughput_bps;
        }

        stats.clear_expired_blacklist(now);
        stats.refresh_cache(now);
    }

    /// Record a failed transfer attempt against a peer.
    pub fn record_failure(&self, peer: &str, reason: &str) {
        let now = Instant::now();
        let mut peers = self.peers.write().unwrap();
        let stats = peers
            .entry(peer.to_string())
            .or_insert_with(|| PeerStats::new(now));

        stats.total_requests += 1;
        stats.failure_count += 1;
        stats.last_seen = now;
        stats.last_failure = Some(now);
        stats.refresh_cache(now);

        debug!(peer = %peer, reason = %reason, "recorded peer failure");
    }

    /// Record bytes served to a peer by the local node.
    pub fn record_upload(&self, peer: &str, bytes: u64) {
        let now = Instant::now();
        let mut peers = self.peers.write().unwrap();
        let stats = peers
            .entry(peer.to_string())
            .or_insert_with(|| PeerStats::new(now));
        stats.bytes_up += bytes;
        stats.last_seen = now;
    }

    /// Exclude a peer from selection for `duration`.
    pub fn blacklist(&self, peer: &str, reason: &str, duration: Duration) {
        let now = Instant::now();
        let mut peers = self.peers.write().unwrap();
        let stats = peers
            .entry(peer.to_string())
            .or_insert_with(|| PeerStats::new(now));

        stats.blacklisted = true;
        stats.blacklist_reason = Some(reason.to_string());
        stats.blacklist_until = Some(now + duration);
        stats.cached_score = 0.0;
        stats.score_cached_at = Some(now);

        info!(peer = %peer, reason = %reason, ?duration, "peer blacklisted");
    }

    pub fn is_blacklisted(&self, peer: &str) -> bool {
        let now = Instant::now();
        self.peers
            .read()
            .unwrap()
            .get(peer)
            .map(|p| p.is_blacklisted_at(now))
            .unwrap_or(false)
    }

    /// Score in [0, 1]. Unknown peers and peers with fewer than three
    /// samples sit at the neutral 0.5; blacklisted peers score 0.
    pub fn score(&self, peer: &str) -> f64 {
        let now = Instant::now();
        self.peers
            .read()
            .unwrap()
            .get(peer)
            .map(|p| p.score_at(now))
            .unwrap_or(NEUTRAL_SCORE)
    }

    /// Best-scoring candidates: blacklisted peers and peers scoring below
    /// the selection floor are dropped, the rest sorted descending.
    pub fn select_best(&self, candidates: &[String], n: usize) -> Vec<String> {
        let now = Instant::now();
        let peers = self.peers.read().unwrap();

        let mut scored: Vec<(String, f64)> = candidates
            .iter()
            .filter_map(|id| match peers.get(id) {
                Some(p) if p.is_blacklisted_at(now) => None,
                Some(p) => Some((id.clone(), p.score_at(now))),
                None => Some((id.clone(), NEUTRAL_SCORE)),
            })
            .filter(|(_, score)| *score >= MIN_SELECTABLE_SCORE)
            .collect();

        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(Ordering::Equal));
        scored.truncate(n);
        scored.into_iter().map(|(id, _)| id).collect()
    }

    /// Mostly-best selection with an exploration tail: 70% of the picks are
    /// the top scorers, the rest are stride-sampled from the next tier so
    /// newer peers keep getting traffic.
    pub fn select_diverse(&self, candidates: &[String], n: usize) -> Vec<String> {
        if n == 0 {
            return Vec::new();
        }
        let ranked = self.select_best(candidates, 2 * n);
        if ranked.len() <= n {
            return ranked;
        }

        let top_n = ((0.7 * n as f64).ceil() as usize).min(n);
        let mut picks: Vec<String> = ranked[..top_n].to_vec();
        let tail = &ranked[top_n..];
        let remainder = n - top_n;
        if remainder > 0 && !tail.is_empty() {
            let stride = (tail.len() / remainder).max(1);
            let mut i = 0;
            while picks.len() < n && i < tail.len() {
                picks.push(tail[i].clone());
                i += stride;
            }
        }
        picks
    }

    /// Drop peers unseen past the retention window and clear expired
    /// blacklists. Returns how many peers were removed.
    pub fn cleanup(&self) -> usize {
        let now = Instant::now();
        let mut peers = self.peers.write().unwrap();
        let before = peers.len();
        peers.retain(|_, p| now.duration_since(p.last_seen) <= self.retention);
        for stats in peers.values_mut() {
            stats.clear_expired_blacklist(now);
        }
        let removed = before - peers.len();
        if removed > 0 {
            debug!(removed, "pruned stale peers from scorer");
        }
        removed
    }

    pub fn peer_count(&self) -> usize {
        self.peers.read().unwrap().len()
    }

    pub fn stats(&self, peer: &str) -> Option<PeerStatsSnapshot> {
        let now = Instant::now();
        self.peers.read().unwrap().get(peer).map(|p| PeerStatsSnapshot {
            peer_id: peer.to_string(),
            avg_latency_ms: p.avg_latency_ms,
            avg_throughput_bps: p.avg_throughput_bps,
            success_rate: p.success_rate(),
            total_requests: p.total_requests,
            success_count: p.success_count,
            failure_count: p.failure_count,
            bytes_down: p.bytes_down,
            bytes_up: p.bytes_up,
            blacklisted: p.is_blacklisted_at(now),
            blacklist_reason: p.blacklist_reason.clone(),
        })
    }
}
