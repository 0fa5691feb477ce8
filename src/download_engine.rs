/// Multi-Source Download Engine
///
/// Fetches a content-addressed package from mirrors and overlay peers at
/// the same time. Large files with at least one peer are split into chunks
/// pulled by a bounded worker pool, with per-chunk retry and cross-source
/// failover driven by the per-job tracker. Everything else races full-file
/// fetches, giving peers a short head start before the mirror joins.
///
/// The assembled artifact is accepted only when its SHA-256 matches the
/// requested hash. In racing mode a peer caught serving bad bytes is
/// blacklisted; in chunked mode blame cannot be pinned on one source, so
/// nobody is.
use crate::audit_logger::{AuditEvent, AuditEventType, AuditLogger};
use crate::config::DownloadConfig;
use crate::content_cache::ContentCache;
use crate::error::{truncate_id, DownloadError};
use crate::hashing::sha256_hex;
use crate::metrics::MetricsRegistry;
use crate::peer_scorer::PeerScorer;
use crate::rate_limiter::RateLimitManager;
use crate::resume_store::{ChunkStatus, DownloadStatus, ResumeStore};
use crate::source::{Source, SourceKind};
use crate::source_tracker::SourceTracker;
use crate::verifier::MultiSourceVerifier;
use bytes::Bytes;
use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout, Instant};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

/// One contiguous byte range of the artifact, fetched as a unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkSpec {
    pub index: u32,
    pub start: u64,
    pub end: u64,
}

/// Partition `[0, expected_size)` into chunk_size steps; the last chunk may
/// be smaller.
pub fn build_chunks(expected_size: u64, chunk_size: u64) -> Vec<ChunkSpec> {
    debug_assert!(chunk_size > 0);
    let mut chunks = Vec::with_capacity(expected_size.div_ceil(chunk_size.max(1)) as usize);
    let mut index: u32 = 0;
    let mut start: u64 = 0;
    while start < expected_size {
        let end = (start + chunk_size).min(expected_size);
        chunks.push(ChunkSpec { index, start, end });
        index += 1;
        start = end;
    }
    chunks
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceType {
    Peer,
    Mirror,
    Mixed,
}

impl fmt::Display for SourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourceType::Peer => write!(f, "peer"),
            SourceType::Mirror => write!(f, "mirror"),
            SourceType::Mixed => write!(f, "mixed"),
        }
    }
}

fn source_type_for(peer_bytes: u64, mirror_bytes: u64) -> SourceType {
    if mirror_bytes == 0 {
        SourceType::Peer
    } else if peer_bytes == 0 {
        SourceType::Mirror
    } else {
        SourceType::Mixed
    }
}

/// What the caller hands the engine.
#[derive(Clone)]
pub struct DownloadRequest {
    pub hash: String,
    pub expected_size: u64,
    pub package_name: Option<String>,
    pub peers: Vec<Source>,
    pub mirror: Option<Source>,
}

impl DownloadRequest {
    pub fn new(hash: impl Into<String>, expected_size: u64) -> Self {
        Self {
            hash: hash.into(),
            expected_size,
            package_name: None,
            peers: Vec::new(),
            mirror: None,
        }
    }

    pub fn with_package_name(mut self, name: impl Into<String>) -> Self {
        self.package_name = Some(name.into());
        self
    }

    pub fn with_peers(mut self, peers: Vec<Source>) -> Self {
        self.peers = peers;
        self
    }

    pub fn with_mirror(mut self, mirror: Source) -> Self {
        self.mirror = Some(mirror);
        self
    }

    /// URL recorded in the resume store for this download.
    fn record_url(&self) -> String {
        match &self.mirror {
            Some(mirror) => mirror.id().to_string(),
            None => format!("p2p://{}", self.hash),
        }
    }
}

#[derive(Debug)]
pub struct DownloadResult {
    pub data: Bytes,
    pub hash: String,
    pub size: u64,
    pub duration: Duration,
    pub source_type: SourceType,
    pub peer_bytes: u64,
    pub mirror_bytes: u64,
    pub chunks_total: u32,
    pub chunks_from_p2p: u32,
}

pub struct DownloadEngine {
    config: DownloadConfig,
    metrics: Arc<MetricsRegistry>,
    scorer: Option<Arc<PeerScorer>>,
    resume: Option<Arc<ResumeStore>>,
    limits: Option<Arc<RateLimitManager>>,
    cache: Option<Arc<dyn ContentCache>>,
    verifier: Option<Arc<MultiSourceVerifier>>,
    audit: Option<Arc<AuditLogger>>,
    mismatch_blacklist: Duration,
}

impl DownloadEngine {
    pub fn new(config: DownloadConfig, metrics: Arc<MetricsRegistry>) -> Self {
        Self {
            config,
            metrics,
            scorer: None,
            resume: None,
            limits: None,
            cache: None,
            verifier: None,
            audit: None,
            mismatch_blacklist: Duration::from_secs(24 * 3600),
        }
    }

    pub fn with_scorer(mut self, scorer: Arc<PeerScorer>) -> Self {
        self.scorer = Some(scorer);
        self
    }

    pub fn with_resume_store(mut self, store: Arc<ResumeStore>) -> Self {
        self.resume = Some(store);
        self
    }

    pub fn with_rate_limits(mut self, limits: Arc<RateLimitManager>) -> Self {
        self.limits = Some(limits);
        self
    }

    pub fn with_cache(mut self, cache: Arc<dyn ContentCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn with_verifier(mut self, verifier: Arc<MultiSourceVerifier>) -> Self {
        self.verifier = Some(verifier);
        self
    }

    pub fn with_audit(mut self, audit: Arc<AuditLogger>) -> Self {
        self.audit = Some(audit);
        self
    }

    pub fn with_mismatch_blacklist(mut self, duration: Duration) -> Self {
        self.mismatch_blacklist = duration;
        self
    }

    /// Download one package. The verified artifact is handed to the content
    /// cache (when attached) and the outcome journaled before returning.
    pub async fn download(
        &self,
        request: DownloadRequest,
        cancel: CancellationToken,
    ) -> Result<DownloadResult, DownloadError> {
        let hash = request.hash.clone();
        let package_name = request.package_name.clone();

        self.metrics.download_started();
        let started = Instant::now();
        let result = self.run(request, &cancel, started).await;
        self.metrics.download_finished();

        match &result {
            Ok(res) => {
                if let Some(cache) = &self.cache {
                    let filename = package_name.clone().unwrap_or_else(|| hash.clone());
                    if let Err(e) = cache.put(&hash, &filename, res.data.clone()).await {
                        warn!(hash = %truncate_id(&hash), error = %e, "cache store failed");
                    }
                }
                info!(
                    hash = %truncate_id(&hash),
                    size = res.size,
                    source = %res.source_type,
                    chunks = res.chunks_total,
                    ms = res.duration.as_millis() as u64,
                    "download complete"
                );
                if let Some(audit) = &self.audit {
                    let mut event = AuditEvent::new(AuditEventType::DownloadComplete, &hash)
                        .with_package_size(res.size)
                        .with_duration(res.duration)
                        .with_source(res.source_type.to_string())
                        .with_transfer(res.peer_bytes, res.mirror_bytes)
                        .with_chunks(res.chunks_total, res.chunks_from_p2p);
                    if let Some(name) = &package_name {
                        event = event.with_package_name(name.clone());
                    }
                    audit.log(&event);
                }
            }
            Err(e) => {
                warn!(hash = %truncate_id(&hash), error = %e, "download failed");
                if let Some(audit) = &self.audit {
                    let mut event = AuditEvent::new(AuditEventType::DownloadFailed, &hash)
                        .with_duration(started.elapsed())
                        .with_error(e.to_string())
                        .with_reason(e.kind());
                    if let Some(name) = &package_name {
                        event = event.with_package_name(name.clone());
                    }
                    audit.log(&event);
                }
            }
        }

        result
    }

    /// `download` under a caller deadline. The job is cancelled when the
    /// deadline fires.
    pub async fn download_with_timeout(
        &self,
        request: DownloadRequest,
        cancel: CancellationToken,
        deadline: Duration,
    ) -> Result<DownloadResult, DownloadError> {
        let job = cancel.child_token();
        match timeout(deadline, self.download(request, job.clone())).await {
            Ok(result) => result,
            Err(_) => {
                job.cancel();
                Err(DownloadError::Timeout)
            }
        }
    }

    async fn run(
        &self,
        request: DownloadRequest,
        cancel: &CancellationToken,
        started: Instant,
    ) -> Result<DownloadResult, DownloadError> {
        if request.peers.is_empty() && request.mirror.is_none() {
            return Err(DownloadError::NoSources);
        }

        if let Some(verifier) = &self.verifier {
            if !request.peers.is_empty() {
                verifier.verify(&request.hash).await;
            }
        }

        let peers = self.eligible_peers(&request.peers);
        if peers.is_empty() && request.mirror.is_none() {
            return Err(DownloadError::NoSources);
        }

        if request.expected_size >= self.config.min_chunked_size && !peers.is_empty() {
            self.download_chunked(request, peers, cancel, started).await
        } else {
            self.download_racing(request, peers, cancel, started).await
        }
    }

    /// Drop blacklisted and hopeless peers up front; the scorer's ordering
    /// becomes the tiebreak ordering for the per-job tracker.
    fn eligible_peers(&self, peers: &[Source]) -> Vec<Source> {
        let Some(scorer) = &self.scorer else {
            return peers.to_vec();
        };
        let ids: Vec<String> = peers.iter().map(|p| p.id().to_string()).collect();
        scorer
            .select_best(&ids, ids.len())
            .iter()
            .filter_map(|id| peers.iter().find(|p| p.id() == id.as_str()).cloned())
            .collect()
    }

    async fn download_chunked(
        &self,
        request: DownloadRequest,
        peers: Vec<Source>,
        cancel: &CancellationToken,
        started: Instant,
    ) -> Result<DownloadResult, DownloadError> {
        let hash = request.hash.clone();
        let size = request.expected_size;
        let chunks = build_chunks(size, self.config.chunk_size);
        let total_chunks = chunks.len() as u32;

        // A failed create means no durable progress is possible; anything
        // after that is best-effort.
        if let Some(store) = &self.resume {
            store
                .create(&hash, &request.record_url(), size, self.config.chunk_size)
                .map_err(|e| DownloadError::Store(e.to_string()))?;
            if let Err(e) = store.update_status(&hash, DownloadStatus::InProgress) {
                warn!(hash = %truncate_id(&hash), error = %e, "resume store update failed");
            }
        }

        let mut all_sources = peers;
        if let Some(mirror) = request.mirror.clone() {
            all_sources.push(mirror);
        }
        let sources: Arc<Vec<Source>> = Arc::new(all_sources);

        debug!(
            hash = %truncate_id(&hash),
            size,
            chunks = total_chunks,
            sources = sources.len(),
            "starting chunked download"
        );

        let tracker = Arc::new(SourceTracker::new());
        let job_cancel = cancel.child_token();
        let queue: Arc<Mutex<VecDeque<ChunkSpec>>> =
            Arc::new(Mutex::new(chunks.iter().copied().collect()));
        let (result_tx, mut result_rx) = mpsc::channel::<ChunkOutcome>(chunks.len().max(1));

        let workers = TaskTracker::new();
        let worker_count = self
            .config
            .max_concurrent_chunks
            .min(sources.len())
            .min(chunks.len())
            .max(1);
        for _ in 0..worker_count {
            workers.spawn(run_chunk_worker(ChunkWorkerCtx {
                hash: hash.clone(),
                sources: sources.clone(),
                tracker: tracker.clone(),
                scorer: self.scorer.clone(),
                limits: self.limits.clone(),
                store: self.resume.clone(),
                metrics: self.metrics.clone(),
                queue: queue.clone(),
                results: result_tx.clone(),
                cancel: job_cancel.clone(),
                chunk_timeout: self.config.chunk_timeout(),
                max_retries: self.config.max_chunk_retries,
            }));
        }
        workers.close();
        drop(result_tx);

        let mut assembled = vec![0u8; size as usize];
        let mut peer_bytes: u64 = 0;
        let mut mirror_bytes: u64 = 0;
        let mut chunks_from_p2p: u32 = 0;
        let mut failure: Option<DownloadError> = None;
        let mut cancelled = false;
        let mut received = 0usize;

        while received < chunks.len() {
            tokio::select! {
                _ = cancel.cancelled() => {
                    cancelled = true;
                    break;
                }
                outcome = result_rx.recv() => {
                    let Some(outcome) = outcome else {
                        // Workers exited without delivering everything;
                        // only cancellation does that.
                        cancelled = true;
                        break;
                    };
                    received += 1;
                    match outcome.result {
                        Ok((data, kind)) => {
                            let spec = outcome.spec;
                            assembled[spec.start as usize..spec.end as usize]
                                .copy_from_slice(&data);
                            match kind {
                                SourceKind::Peer => {
                                    peer_bytes += data.len() as u64;
                                    chunks_from_p2p += 1;
                                }
                                SourceKind::Mirror => mirror_bytes += data.len() as u64,
                            }
                        }
                        Err(fail) => {
                            let cause = fail
                                .history
                                .last()
                                .cloned()
                                .unwrap_or_else(|| "no sources left".to_string());
                            failure = Some(DownloadError::ChunkFailed {
                                index: outcome.spec.index,
                                attempts: fail.attempts,
                                cause,
                                history: fail.history,
                            });
                            break;
                        }
                    }
                }
            }
        }

        // Stop the pool and let every worker observe the cancellation
        // before this returns.
        job_cancel.cancel();
        while result_rx.recv().await.is_some() {}
        workers.wait().await;

        if cancelled {
            if let Some(store) = &self.resume {
                let _ = store.reset_in_progress(&hash);
            }
            return Err(DownloadError::Cancelled);
        }
        if let Some(err) = failure {
            if let Some(store) = &self.resume {
                let _ = store.reset_in_progress(&hash);
                let _ = store.fail(&hash, &err.to_string());
            }
            return Err(err);
        }

        let actual = sha256_hex(&assembled);
        if actual != hash {
            self.metrics.record_verification_failure();
            if let Some(audit) = &self.audit {
                audit.log(
                    &AuditEvent::new(AuditEventType::VerificationFailed, &hash)
                        .with_package_size(size)
                        .with_source(SourceType::Mixed.to_string())
                        .with_reason("assembled artifact hash mismatch"),
                );
            }
            if let Some(store) = &self.resume {
                let _ = store.fail(&hash, "hash mismatch");
            }
            return Err(DownloadError::HashMismatch {
                expected: truncate_id(&hash),
                actual: truncate_id(&actual),
            });
        }

        if let Some(store) = &self.resume {
            if let Err(e) = store.complete(&hash).and_then(|_| store.delete(&hash)) {
                warn!(hash = %truncate_id(&hash), error = %e, "resume store cleanup failed");
            }
        }

        Ok(DownloadResult {
            data: Bytes::from(assembled),
            hash,
            size,
            duration: started.elapsed(),
            source_type: source_type_for(peer_bytes, mirror_bytes),
            peer_bytes,
            mirror_bytes,
            chunks_total: total_chunks,
            chunks_from_p2p,
        })
    }

    async fn download_racing(
        &self,
        request: DownloadRequest,
        peers: Vec<Source>,
        cancel: &CancellationToken,
        started: Instant,
    ) -> Result<DownloadResult, DownloadError> {
        let hash = request.hash.clone();
        let racer_count = peers.len() + usize::from(request.mirror.is_some());
        if racer_count == 0 {
            return Err(DownloadError::NoSources);
        }

        debug!(
            hash = %truncate_id(&hash),
            peers = peers.len(),
            mirror = request.mirror.is_some(),
            "starting race"
        );

        let job_cancel = cancel.child_token();
        let (tx, mut rx) = mpsc::channel::<RaceOutcome>(racer_count);
        let racers = TaskTracker::new();

        // The mirror gets in late so a healthy swarm can win outright; with
        // nobody to race there is no head start to give.
        let mirror_delay = if peers.is_empty() {
            None
        } else {
            Some(self.config.mirror_fallback_delay())
        };
        for peer in peers {
            racers.spawn(run_racer(
                peer,
                hash.clone(),
                None,
                job_cancel.clone(),
                tx.clone(),
            ));
        }
        if let Some(mirror) = request.mirror.clone() {
            racers.spawn(run_racer(
                mirror,
                hash.clone(),
                mirror_delay,
                job_cancel.clone(),
                tx.clone(),
            ));
        }
        racers.close();
        drop(tx);

        let mut last_error: Option<String> = None;
        let mut winner: Option<(Source, Duration, Bytes)> = None;
        let mut parent_cancelled = false;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    parent_cancelled = true;
                    break;
                }
                outcome = rx.recv() => {
                    let Some(outcome) = outcome else { break };
                    match outcome.result {
                        RaceResult::Cancelled => {}
                        RaceResult::Error(msg) => {
                            debug!(
                                source = %truncate_id(outcome.source.id()),
                                error = %msg,
                                "racer failed"
                            );
                            if let (Some(peer_id), Some(scorer)) =
                                (outcome.source.peer_id(), &self.scorer)
                            {
                                scorer.record_failure(peer_id, &msg);
                            }
                            last_error = Some(msg);
                        }
                        RaceResult::Data(data) => {
                            if sha256_hex(&data) == hash {
                                winner = Some((outcome.source, outcome.elapsed, data));
                                break;
                            }
                            self.handle_race_mismatch(&hash, &outcome.source);
                            last_error = Some(format!(
                                "hash mismatch from {}",
                                truncate_id(outcome.source.id())
                            ));
                        }
                    }
                }
            }
        }

        job_cancel.cancel();
        while rx.recv().await.is_some() {}
        racers.wait().await;

        if parent_cancelled {
            return Err(DownloadError::Cancelled);
        }

        let Some((source, elapsed, data)) = winner else {
            return Err(DownloadError::AllSourcesFailed {
                last_cause: last_error.unwrap_or_else(|| "no racers responded".to_string()),
            });
        };

        if let (Some(peer_id), Some(scorer)) = (source.peer_id(), &self.scorer) {
            let secs = elapsed.as_secs_f64();
            let throughput = if secs > 0.0 { data.len() as f64 / secs } else { 0.0 };
            scorer.record_success(peer_id, data.len() as u64, secs * 1000.0, throughput);
        }
        if let Some(limits) = &self.limits {
            tokio::select! {
                _ = cancel.cancelled() => return Err(DownloadError::Cancelled),
                _ = limits.charge_download(source.peer_id(), data.len() as u64) => {}
            }
        }

        let (peer_bytes, mirror_bytes, chunks_from_p2p) = match source.kind() {
            SourceKind::Peer => (data.len() as u64, 0, 1),
            SourceKind::Mirror => (0, data.len() as u64, 0),
        };

        Ok(DownloadResult {
            size: data.len() as u64,
            data,
            hash,
            duration: started.elapsed(),
            source_type: match source.kind() {
                SourceKind::Peer => SourceType::Peer,
                SourceKind::Mirror => SourceType::Mirror,
            },
            peer_bytes,
            mirror_bytes,
            chunks_total: 1,
            chunks_from_p2p,
        })
    }

    /// A racer returned bytes that hash to the wrong value. Peers get a
    /// long blacklist for that; mirrors never do.
    fn handle_race_mismatch(&self, hash: &str, source: &Source) {
        self.metrics.record_verification_failure();
        warn!(
            hash = %truncate_id(hash),
            source = %truncate_id(source.id()),
            kind = %source.kind(),
            "raced response failed verification"
        );
        if let Some(audit) = &self.audit {
            let mut event = AuditEvent::new(AuditEventType::VerificationFailed, hash)
                .with_source(source.kind().to_string())
                .with_reason("hash mismatch");
            if let Some(peer_id) = source.peer_id() {
                event = event.with_peer_id(peer_id);
            }
            audit.log(&event);
        }

        if let Some(peer_id) = source.peer_id() {
            if let Some(scorer) = &self.scorer {
                scorer.blacklist(peer_id, "hash mismatch", self.mismatch_blacklist);
                if let Some(audit) = &self.audit {
                    audit.log(
                        &AuditEvent::new(AuditEventType::PeerBlacklisted, hash)
                            .with_peer_id(peer_id)
                            .with_reason("hash mismatch"),
                    );
                }
            }
        }
    }
}

struct ChunkWorkerCtx {
    hash: String,
    sources: Arc<Vec<Source>>,
    tracker: Arc<SourceTracker>,
    scorer: Option<Arc<PeerScorer>>,
    limits: Option<Arc<RateLimitManager>>,
    store: Option<Arc<ResumeStore>>,
    metrics: Arc<MetricsRegistry>,
    queue: Arc<Mutex<VecDeque<ChunkSpec>>>,
    results: mpsc::Sender<ChunkOutcome>,
    cancel: CancellationToken,
    chunk_timeout: Duration,
    max_retries: u32,
}

struct ChunkOutcome {
    spec: ChunkSpec,
    result: Result<(Bytes, SourceKind), ChunkFailure>,
}

struct ChunkFailure {
    attempts: u32,
    history: Vec<String>,
}

async fn run_chunk_worker(ctx: ChunkWorkerCtx) {
    loop {
        if ctx.cancel.is_cancelled() {
            return;
        }
        let next = ctx.queue.lock().unwrap().pop_front();
        let Some(spec) = next else { return };

        match fetch_chunk(&ctx, spec).await {
            // Cancelled mid-attempt; the collector is already unwinding.
            None => return,
            Some(result) => {
                if ctx.results.send(ChunkOutcome { spec, result }).await.is_err() {
                    return;
                }
            }
        }
    }
}

/// Fetch one chunk, retrying across sources. Returns `None` on
/// cancellation, otherwise the chunk bytes or the accumulated failure
/// history.
async fn fetch_chunk(
    ctx: &ChunkWorkerCtx,
    spec: ChunkSpec,
) -> Option<Result<(Bytes, SourceKind), ChunkFailure>> {
    let expected_len = (spec.end - spec.start) as usize;
    let mut history: Vec<String> = Vec::new();

    if let Some(store) = &ctx.store {
        if let Err(e) = store.update_chunk(&ctx.hash, spec.index, ChunkStatus::InProgress) {
            warn!(chunk = spec.index, error = %e, "resume store update failed");
        }
    }

    for attempt in 1..=ctx.max_retries {
        let Some(idx) = ctx.tracker.select(&ctx.sources) else {
            break;
        };
        let source = &ctx.sources[idx];
        let attempt_started = Instant::now();

        let fetched = tokio::select! {
            _ = ctx.cancel.cancelled() => return None,
            res = timeout(ctx.chunk_timeout, source.download(&ctx.hash, spec.start, spec.end)) => res,
        };
        let elapsed = attempt_started.elapsed();

        let data = match fetched {
            Err(_) => Err(format!(
                "attempt {}: {} timed out after {:?}",
                attempt,
                truncate_id(source.id()),
                ctx.chunk_timeout
            )),
            Ok(Err(e)) => Err(format!("attempt {}: {}: {}", attempt, truncate_id(source.id()), e)),
            Ok(Ok(data)) if data.len() != expected_len => Err(format!(
                "attempt {}: {} returned {} of {} bytes",
                attempt,
                truncate_id(source.id()),
                data.len(),
                expected_len
            )),
            Ok(Ok(data)) => Ok(data),
        };

        match data {
            Ok(data) => {
                ctx.tracker.record_success(source.id(), data.len() as u64, elapsed);
                if let (Some(peer_id), Some(scorer)) = (source.peer_id(), &ctx.scorer) {
                    let secs = elapsed.as_secs_f64();
                    let throughput = if secs > 0.0 { data.len() as f64 / secs } else { 0.0 };
                    scorer.record_success(peer_id, data.len() as u64, secs * 1000.0, throughput);
                }
                if let Some(limits) = &ctx.limits {
                    tokio::select! {
                        _ = ctx.cancel.cancelled() => return None,
                        _ = limits.charge_download(source.peer_id(), data.len() as u64) => {}
                    }
                }
                ctx.metrics.observe_chunk_time(elapsed);
                if let Some(store) = &ctx.store {
                    if let Err(e) = store.update_chunk(&ctx.hash, spec.index, ChunkStatus::Completed)
                    {
                        warn!(chunk = spec.index, error = %e, "resume store update failed");
                    }
                }
                return Some(Ok((data, source.kind())));
            }
            Err(msg) => {
                debug!(chunk = spec.index, error = %msg, "chunk attempt failed");
                ctx.tracker.record_failure(source.id());
                if let (Some(peer_id), Some(scorer)) = (source.peer_id(), &ctx.scorer) {
                    scorer.record_failure(peer_id, &msg);
                }
                history.push(msg);
            }
        }
    }

    Some(Err(ChunkFailure {
        attempts: ctx.max_retries,
        history,
    }))
}

struct RaceOutcome {
    source: Source,
    elapsed: Duration,
    result: RaceResult,
}

enum RaceResult {
    Data(Bytes),
    Error(String),
    Cancelled,
}

async fn run_racer(
    source: Source,
    hash: String,
    delay: Option<Duration>,
    cancel: CancellationToken,
    tx: mpsc::Sender<RaceOutcome>,
) {
    let started = Instant::now();

    if let Some(delay) = delay {
        tokio::select! {
            _ = cancel.cancelled() => {
                let _ = tx
                    .send(RaceOutcome {
                        source,
                        elapsed: started.elapsed(),
                        result: RaceResult::Cancelled,
                    })
                    .await;
                return;
            }
            _ = sleep(delay) => {}
        }
    }

    let result = tokio::select! {
        _ = cancel.cancelled() => RaceResult::Cancelled,
        res = source.download_full(&hash) => match res {
            Ok(data) => RaceResult::Data(data),
            Err(e) => RaceResult::Error(e.to_string()),
        }
    };

    let _ = tx
        .send(RaceOutcome {
            source,
            elapsed: started.elapsed(),
            result,
        })
        .await;
}
