/// Bandwidth Limiting
///
/// Two layers of token-bucket throttling cover every byte of overlay I/O: a
/// global bucket shared by the whole process and a per-peer bucket created
/// lazily on first use. Mirror traffic is charged only to the global bucket.
///
/// Buckets use a debt model: acquirers debit tokens immediately and sleep
/// off any deficit, which serializes concurrent acquirers and keeps the
/// classic bound — bytes granted over any window never exceed
/// `burst + rate * window`.
///
/// When a peer scorer is attached, a background tick retunes each per-peer
/// rate from the peer's score and smoothed latency; a second tick sweeps
/// limiters that have gone idle.
use crate::config::RateLimitConfig;
use crate::peer_scorer::PeerScorer;
use std::collections::HashMap;
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{ready, Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::RwLock;
use tokio::time::{interval, sleep, Instant, Sleep};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::debug;

/// Smallest burst any throttled bucket will allow.
pub const MIN_BURST: u64 = 64 * 1024;
/// Largest burst any bucket will accumulate while idle.
pub const MAX_BURST: u64 = 4 * 1024 * 1024;

fn burst_for(rate_bps: u64) -> u64 {
    rate_bps.clamp(MIN_BURST, MAX_BURST)
}

struct BucketState {
    rate: f64,
    burst: f64,
    tokens: f64,
    last_refill: Instant,
}

/// A token bucket refilled continuously at `rate` bytes per second.
/// A bucket with rate 0 is the identity and never throttles.
pub struct TokenBucket {
    state: Mutex<BucketState>,
}

impl TokenBucket {
    pub fn new(rate_bps: u64) -> Self {
        let burst = burst_for(rate_bps) as f64;
        Self {
            state: Mutex::new(BucketState {
                rate: rate_bps as f64,
                burst,
                tokens: burst,
                last_refill: Instant::now(),
            }),
        }
    }

    pub fn unlimited() -> Self {
        Self::new(0)
    }

    pub fn rate(&self) -> u64 {
        self.state.lock().unwrap().rate as u64
    }

    pub fn burst(&self) -> u64 {
        self.state.lock().unwrap().burst as u64
    }

    pub fn is_unlimited(&self) -> bool {
        self.state.lock().unwrap().rate <= 0.0
    }

    /// Atomically retune rate and burst. Accumulated tokens are capped at
    /// the new burst so a rate cut takes effect immediately.
    pub fn set_rate(&self, rate_bps: u64) {
        let mut state = self.state.lock().unwrap();
        let now = Instant::now();
        Self::refill(&mut state, now);
        state.rate = rate_bps as f64;
        state.burst = burst_for(rate_bps) as f64;
        state.tokens = state.tokens.min(state.burst);
    }

    fn refill(state: &mut BucketState, now: Instant) {
        if state.rate <= 0.0 {
            return;
        }
        let elapsed = now.duration_since(state.last_refill).as_secs_f64();
        state.tokens = (state.tokens + elapsed * state.rate).min(state.burst);
        state.last_refill = now;
    }

    /// Debit `n` tokens and return how long the caller must sleep before
    /// the debt clears. Never blocks.
    pub fn reserve(&self, n: u64) -> Duration {
        let mut state = self.state.lock().unwrap();
        if state.rate <= 0.0 {
            return Duration::ZERO;
        }
        let now = Instant::now();
        Self::refill(&mut state, now);
        state.tokens -= n as f64;
        if state.tokens >= 0.0 {
            Duration::ZERO
        } else {
            Duration::from_secs_f64(-state.tokens / state.rate)
        }
    }

    /// Sleep until `n` tokens are available. Requests larger than the burst
    /// are split into burst-sized pieces, so any `n` is legal. Cancellation
    /// is by dropping the future.
    pub async fn wait_n(&self, n: u64) {
        if n == 0 || self.is_unlimited() {
            return;
        }
        let mut remaining = n;
        while remaining > 0 {
            let piece = remaining.min(self.burst().max(1));
            let wait = self.reserve(piece);
            if !wait.is_zero() {
                sleep(wait).await;
            }
            remaining -= piece;
        }
    }
}

struct PeerEntry {
    bucket: Arc<TokenBucket>,
    base_rate: u64,
    current_rate: u64,
    last_access: Instant,
}

/// The global + per-peer limiter pair.
pub struct RateLimitManager {
    config: RateLimitConfig,
    global_read: Arc<TokenBucket>,
    global_write: Arc<TokenBucket>,
    peers: RwLock<HashMap<String, PeerEntry>>,
    scorer: Option<Arc<PeerScorer>>,
}

impl RateLimitManager {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            global_read: Arc::new(TokenBucket::new(config.global_download_bps)),
            global_write: Arc::new(TokenBucket::new(config.global_upload_bps)),
            peers: RwLock::new(HashMap::new()),
            scorer: None,
            config,
        }
    }

    /// Attach the scorer that drives adaptive per-peer rates.
    pub fn with_scorer(mut self, scorer: Arc<PeerScorer>) -> Self {
        self.scorer = Some(scorer);
        self
    }

    /// Per-peer base rate: fixed when configured, otherwise an even split
    /// of the global budget across the expected peer population, floored.
    fn base_peer_rate(&self) -> u64 {
        if self.config.per_peer_rate_bps > 0 {
            return self.config.per_peer_rate_bps;
        }
        if self.config.global_download_bps == 0 {
            return 0;
        }
        (self.config.global_download_bps / self.config.expected_peers.max(1) as u64)
            .max(self.config.min_peer_rate_bps)
    }

    async fn peer_bucket(&self, peer_id: &str) -> Arc<TokenBucket> {
        let now = Instant::now();
        let mut peers = self.peers.write().await;
        let base = self.base_peer_rate();
        let entry = peers.entry(peer_id.to_string()).or_insert_with(|| PeerEntry {
            bucket: Arc::new(TokenBucket::new(base)),
            base_rate: base,
            current_rate: base,
            last_access: now,
        });
        entry.last_access = now;
        entry.bucket.clone()
    }

    /// Charge `n` downloaded bytes against the peer (when given) and the
    /// global read budget, sleeping as needed.
    pub async fn charge_download(&self, peer_id: Option<&str>, n: u64) {
        if let Some(id) = peer_id {
            let bucket = self.peer_bucket(id).await;
            bucket.wait_n(n).await;
        }
        self.global_read.wait_n(n).await;
    }

    /// Charge `n` uploaded bytes against the peer (when given) and the
    /// global write budget.
    pub async fn charge_upload(&self, peer_id: Option<&str>, n: u64) {
        if let Some(id) = peer_id {
            let bucket = self.peer_bucket(id).await;
            bucket.wait_n(n).await;
        }
        self.global_write.wait_n(n).await;
    }

    /// Wrap a reader so every byte read is charged to the global read
    /// bucket and, when a peer id is given, that peer's bucket.
    pub async fn wrap_reader<R: AsyncRead + Unpin>(
        &self,
        peer_id: Option<&str>,
        reader: R,
    ) -> ThrottledReader<R> {
        let peer = match peer_id {
            Some(id) => Some(self.peer_bucket(id).await),
            None => None,
        };
        ThrottledReader {
            inner: reader,
            global: self.global_read.clone(),
            peer,
            delay: None,
        }
    }

    /// Wrap a writer; bytes written are charged to the global write bucket
    /// and the peer's bucket when a peer id is given.
    pub async fn wrap_writer<W: AsyncWrite + Unpin>(
        &self,
        peer_id: Option<&str>,
        writer: W,
    ) -> ThrottledWriter<W> {
        let peer = match peer_id {
            Some(id) => Some(self.peer_bucket(id).await),
            None => None,
        };
        ThrottledWriter {
            inner: writer,
            global: self.global_write.clone(),
            peer,
            delay: None,
        }
    }

    /// Recompute every per-peer rate from the scorer signal. No-op when no
    /// scorer is attached or per-peer limiting is off.
    pub async fn adaptive_tick(&self) {
        let Some(scorer) = &self.scorer else {
            return;
        };
        let threshold = self.config.latency_threshold_ms;
        let mut peers = self.peers.write().await;
        for (id, entry) in peers.iter_mut() {
            if entry.base_rate == 0 {
                continue;
            }

            let mut factor = 0.5 + scorer.score(id);
            if threshold > 0.0 {
                if let Some(stats) = scorer.stats(id) {
                    if stats.avg_latency_ms > threshold {
                        let penalty =
                            (0.15 * (stats.avg_latency_ms - threshold) / threshold).min(0.3);
                        factor *= 1.0 - penalty;
                    }
                }
            }

            let ceiling = ((entry.base_rate as f64 * self.config.max_boost) as u64)
                .max(self.config.min_peer_rate_bps);
            let new_rate = ((entry.base_rate as f64 * factor) as u64)
                .clamp(self.config.min_peer_rate_bps, ceiling);

            if new_rate != entry.current_rate {
                debug!(peer = %id, old = entry.current_rate, new = new_rate, "adaptive rate change");
                entry.bucket.set_rate(new_rate);
                entry.current_rate = new_rate;
            }
        }
    }

    /// Drop per-peer limiters idle past the configured timeout. Returns the
    /// number removed.
    pub async fn cleanup_tick(&self) -> usize {
        let now = Instant::now();
        let idle = self.config.idle_timeout();
        let mut peers = self.peers.write().await;
        let before = peers.len();
        peers.retain(|_, e| now.duration_since(e.last_access) <= idle);
        let removed = before - peers.len();
        if removed > 0 {
            debug!(removed, "removed idle peer limiters");
        }
        removed
    }

    /// Start the cleanup ticker and, when a scorer is attached, the
    /// adaptive ticker. Both exit promptly on shutdown.
    pub fn spawn_background(self: &Arc<Self>, tracker: &TaskTracker, shutdown: CancellationToken) {
        let manager = self.clone();
        let token = shutdown.clone();
        tracker.spawn(async move {
            let mut tick = interval(manager.config.cleanup_interval());
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tick.tick() => {
                        manager.cleanup_tick().await;
                    }
                }
            }
        });

        if self.scorer.is_some() {
            let manager = self.clone();
            tracker.spawn(async move {
                let mut tick = interval(manager.config.adaptive_interval());
                loop {
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tick.tick() => {
                            manager.adaptive_tick().await;
                        }
                    }
                }
            });
        }
    }

    /// Current rate applied to a peer, if a limiter exists for it.
    pub async fn peer_rate(&self, peer_id: &str) -> Option<u64> {
        self.peers
            .read()
            .await
            .get(peer_id)
            .map(|e| e.current_rate)
    }

    pub async fn peer_count(&self) -> usize {
        self.peers.read().await.len()
    }
}

/// Reader half of the limiter pair: charges bytes after each inner read and
/// sleeps off the debt before the next one, so transferred bytes are always
/// reported to the caller.
pub struct ThrottledReader<R> {
    inner: R,
    global: Arc<TokenBucket>,
    peer: Option<Arc<TokenBucket>>,
    delay: Option<Pin<Box<Sleep>>>,
}

impl<R: AsyncRead + Unpin> AsyncRead for ThrottledReader<R> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if let Some(delay) = this.delay.as_mut() {
            ready!(delay.as_mut().poll(cx));
            this.delay = None;
        }

        let before = buf.filled().len();
        ready!(Pin::new(&mut this.inner).poll_read(cx, buf))?;
        let n = (buf.filled().len() - before) as u64;
        if n > 0 {
            let mut wait = this.global.reserve(n);
            if let Some(peer) = &this.peer {
                wait = wait.max(peer.reserve(n));
            }
            if !wait.is_zero() {
                this.delay = Some(Box::pin(sleep(wait)));
            }
        }
        Poll::Ready(Ok(()))
    }
}

/// Writer half; same post-charge discipline as the reader.
pub struct ThrottledWriter<W> {
    inner: W,
    global: Arc<TokenBucket>,
    peer: Option<Arc<TokenBucket>>,
    delay: Option<Pin<Box<Sleep>>>,
}

impl<W: AsyncWrite + Unpin> AsyncWrite for ThrottledWriter<W> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        if let Some(delay) = this.delay.as_mut() {
            ready!(delay.as_mut().poll(cx));
            this.delay = None;
        }

        let n = ready!(Pin::new(&mut this.inner).poll_write(cx, buf))?;
        if n > 0 {
            let mut wait = this.global.reserve(n as u64);
            if let Some(peer) = &this.peer {
                wait = wait.max(peer.reserve(n as u64));
            }
            if !wait.is_zero() {
                this.delay = Some(Box::pin(sleep(wait)));
            }
        }
        Poll::Ready(Ok(n))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    fn limit_config(global_down: u64, per_peer: u64) -> RateLimitConfig {
        RateLimitConfig {
            global_download_bps: global_down,
            global_upload_bps: 0,
            per_peer_rate_bps: per_peer,
            expected_peers: 10,
            min_peer_rate_bps: 50_000,
            max_boost: 2.0,
            latency_threshold_ms: 300.0,
            adaptive_interval_secs: 10,
            cleanup_interval_secs: 30,
            idle_timeout_secs: 30,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn full_bucket_grants_burst_immediately() {
        let bucket = TokenBucket::new(100 * 1024);
        let start = Instant::now();
        bucket.wait_n(bucket.burst()).await;
        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn debt_is_slept_off_at_rate() {
        let bucket = TokenBucket::new(100 * 1024);
        bucket.wait_n(bucket.burst()).await;

        let start = Instant::now();
        bucket.wait_n(50 * 1024).await;
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(490), "elapsed {:?}", elapsed);
        assert!(elapsed <= Duration::from_millis(600), "elapsed {:?}", elapsed);
    }

    #[tokio::test(start_paused = true)]
    async fn oversized_requests_are_split() {
        let bucket = TokenBucket::new(128 * 1024);
        let burst = bucket.burst();

        let start = Instant::now();
        bucket.wait_n(4 * burst).await;
        // First burst is free, three more must drain at the configured rate.
        let expected = Duration::from_secs_f64(3.0 * burst as f64 / (128.0 * 1024.0));
        assert!(start.elapsed() >= expected - Duration::from_millis(50));
    }

    #[tokio::test(start_paused = true)]
    async fn bound_holds_over_a_window() {
        let rate = 64 * 1024u64;
        let bucket = TokenBucket::new(rate);
        let total = 4 * bucket.burst();

        let start = Instant::now();
        let mut granted = 0u64;
        while granted < total {
            bucket.wait_n(4096).await;
            granted += 4096;
        }
        // granted <= burst + rate * elapsed  =>  elapsed >= (granted - burst) / rate
        let floor = Duration::from_secs_f64((total - bucket.burst()) as f64 / rate as f64);
        assert!(start.elapsed() >= floor - Duration::from_millis(50));
    }

    #[tokio::test(start_paused = true)]
    async fn zero_rate_is_identity() {
        let bucket = TokenBucket::unlimited();
        let start = Instant::now();
        bucket.wait_n(10 * 1024 * 1024 * 1024).await;
        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn set_rate_retunes_burst() {
        let bucket = TokenBucket::new(100 * 1024);
        assert_eq!(bucket.burst(), 100 * 1024);

        bucket.set_rate(8 * 1024 * 1024);
        assert_eq!(bucket.rate(), 8 * 1024 * 1024);
        assert_eq!(bucket.burst(), MAX_BURST);

        bucket.set_rate(1024);
        assert_eq!(bucket.burst(), MIN_BURST);
    }

    #[tokio::test(start_paused = true)]
    async fn mirror_traffic_only_charges_global() {
        let manager = RateLimitManager::new(limit_config(1024 * 1024, 200_000));
        manager.charge_download(None, 4096).await;
        assert_eq!(manager.peer_count().await, 0);

        manager.charge_download(Some("p1"), 4096).await;
        assert_eq!(manager.peer_count().await, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn idle_limiters_are_cleaned_up() {
        let manager = RateLimitManager::new(limit_config(0, 200_000));
        manager.charge_download(Some("p1"), 1).await;
        manager.charge_download(Some("p2"), 1).await;
        assert_eq!(manager.peer_count().await, 2);

        tokio::time::advance(Duration::from_secs(31)).await;
        manager.charge_download(Some("p2"), 1).await;

        assert_eq!(manager.cleanup_tick().await, 1);
        assert_eq!(manager.peer_count().await, 1);
        assert!(manager.peer_rate("p2").await.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn adaptive_tick_follows_score() {
        let scorer = Arc::new(PeerScorer::new());
        let manager =
            RateLimitManager::new(limit_config(0, 200_000)).with_scorer(scorer.clone());

        manager.charge_download(Some("good"), 1).await;
        manager.charge_download(Some("bad"), 1).await;

        for _ in 0..5 {
            scorer.record_success("good", 1 << 20, 10.0, 50_000_000.0);
        }
        scorer.blacklist("bad", "abuse", Duration::from_secs(3600));

        manager.adaptive_tick().await;

        let good = manager.peer_rate("good").await.unwrap();
        let bad = manager.peer_rate("bad").await.unwrap();
        // factor = 0.5 + score: boosted for the good peer, halved (and then
        // floored) for the blacklisted one.
        assert!(good > 200_000, "good rate {}", good);
        assert!(bad < 200_000, "bad rate {}", bad);
        assert!(bad >= 50_000);
    }

    #[tokio::test(start_paused = true)]
    async fn derived_peer_rate_splits_global_budget() {
        let manager = RateLimitManager::new(limit_config(10 * 1024 * 1024, 0));
        manager.charge_download(Some("p"), 1).await;
        // 10 MiB/s across 10 expected peers.
        assert_eq!(manager.peer_rate("p").await.unwrap(), 1024 * 1024);

        let floored = RateLimitManager::new(limit_config(100_000, 0));
        floored.charge_download(Some("p"), 1).await;
        assert_eq!(floored.peer_rate("p").await.unwrap(), 50_000);
    }

    #[tokio::test(start_paused = true)]
    async fn throttled_reader_paces_bulk_reads() {
        let rate = 64 * 1024u64;
        let manager = RateLimitManager::new(limit_config(rate, 0));
        let data = vec![7u8; 3 * 64 * 1024];
        let mut reader = manager
            .wrap_reader(None, std::io::Cursor::new(data.clone()))
            .await;

        let start = Instant::now();
        let mut out = Vec::new();
        reader.read_to_end(&mut out).await.unwrap();

        assert_eq!(out, data);
        // 3 bursts total, the first one free.
        let floor = Duration::from_secs_f64(2.0 * 64.0 * 1024.0 / rate as f64);
        assert!(start.elapsed() >= floor - Duration::from_millis(100));
    }

    #[tokio::test(start_paused = true)]
    async fn background_loops_stop_on_shutdown() {
        let scorer = Arc::new(PeerScorer::new());
        let manager = Arc::new(
            RateLimitManager::new(limit_config(0, 100_000)).with_scorer(scorer),
        );
        let tracker = TaskTracker::new();
        let shutdown = CancellationToken::new();

        manager.spawn_background(&tracker, shutdown.clone());
        tracker.close();

        shutdown.cancel();
        tracker.wait().await;
    }
}
