//! End-to-end download engine tests against scripted in-memory transports.

use anyhow::{bail, Result};
use async_trait::async_trait;
use bytes::Bytes;
use pkgswarm::audit_logger::{AuditEventType, AuditLogger};
use pkgswarm::config::{AuditConfig, DownloadConfig};
use pkgswarm::content_cache::{ContentCache, MemoryCache};
use pkgswarm::download_engine::{DownloadEngine, DownloadRequest, SourceType};
use pkgswarm::error::DownloadError;
use pkgswarm::hashing::sha256_hex;
use pkgswarm::metrics::MetricsRegistry;
use pkgswarm::peer_scorer::PeerScorer;
use pkgswarm::resume_store::{ChunkStatus, ResumeStore};
use pkgswarm::source::{Source, Transport};
use pkgswarm::verifier::{MultiSourceVerifier, ProviderLookup};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

const MIB: u64 = 1024 * 1024;

/// Transport serving a fixed payload with a scripted delay, optionally
/// always failing.
struct SimTransport {
    data: Vec<u8>,
    delay: Duration,
    fail: bool,
    requests: AtomicU64,
}

impl SimTransport {
    fn serving(data: Vec<u8>) -> Self {
        Self {
            data,
            delay: Duration::ZERO,
            fail: false,
            requests: AtomicU64::new(0),
        }
    }

    fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    fn failing() -> Self {
        Self {
            data: Vec::new(),
            delay: Duration::ZERO,
            fail: true,
            requests: AtomicU64::new(0),
        }
    }

    fn requests(&self) -> u64 {
        self.requests.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl Transport for SimTransport {
    async fn fetch_range(&self, _hash: &str, start: u64, end: u64) -> Result<Bytes> {
        self.requests.fetch_add(1, Ordering::Relaxed);
        tokio::time::sleep(self.delay).await;
        if self.fail {
            bail!("simulated transport failure");
        }
        let end = (end as usize).min(self.data.len());
        if start as usize > end {
            bail!("range out of bounds");
        }
        Ok(Bytes::copy_from_slice(&self.data[start as usize..end]))
    }

    async fn fetch_full(&self, _hash: &str) -> Result<Bytes> {
        self.requests.fetch_add(1, Ordering::Relaxed);
        tokio::time::sleep(self.delay).await;
        if self.fail {
            bail!("simulated transport failure");
        }
        Ok(Bytes::copy_from_slice(&self.data))
    }
}

fn payload(size: usize) -> Vec<u8> {
    let mut rng = StdRng::seed_from_u64(0x706b_6773);
    (0..size).map(|_| rng.gen()).collect()
}

fn engine_config() -> DownloadConfig {
    DownloadConfig {
        chunk_size: 4 * MIB,
        min_chunked_size: 10 * MIB,
        max_concurrent_chunks: 8,
        max_chunk_retries: 3,
        chunk_timeout_secs: 30,
        mirror_fallback_delay_ms: 200,
    }
}

// Scenario: small file, mirror only. Racing mode with a single racer.
#[tokio::test]
async fn pure_mirror_small_file() {
    let data = payload(1000);
    let hash = sha256_hex(&data);
    let metrics = Arc::new(MetricsRegistry::new());
    let engine = DownloadEngine::new(engine_config(), metrics);

    let request = DownloadRequest::new(hash.clone(), 1000)
        .with_mirror(Source::mirror("http://mirror.example/pkg.deb", Arc::new(SimTransport::serving(data.clone()))));

    let result = engine
        .download(request, CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(result.source_type, SourceType::Mirror);
    assert_eq!(result.chunks_total, 1);
    assert_eq!(result.chunks_from_p2p, 0);
    assert_eq!(result.mirror_bytes, 1000);
    assert_eq!(result.peer_bytes, 0);
    assert_eq!(result.size, 1000);
    assert_eq!(result.data.as_ref(), &data[..]);
    assert_eq!(result.hash, hash);
}

// Scenario: fast peer beats the delayed mirror; mirror task is cancelled.
#[tokio::test]
async fn race_peer_wins() {
    let data = payload(5000);
    let hash = sha256_hex(&data);
    let metrics = Arc::new(MetricsRegistry::new());
    let engine = DownloadEngine::new(engine_config(), metrics);

    let mirror_transport = Arc::new(
        SimTransport::serving(data.clone()).with_delay(Duration::from_millis(500)),
    );
    let request = DownloadRequest::new(hash.clone(), 5000)
        .with_peers(vec![Source::peer(
            "peer-fast",
            Arc::new(SimTransport::serving(data.clone()).with_delay(Duration::from_millis(10))),
        )])
        .with_mirror(Source::mirror("http://mirror.example", mirror_transport));

    let result = engine
        .download(request, CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(result.source_type, SourceType::Peer);
    assert_eq!(result.peer_bytes, 5000);
    assert_eq!(result.mirror_bytes, 0);
    assert_eq!(result.chunks_from_p2p, 1);
    assert_eq!(result.data.as_ref(), &data[..]);
}

// Scenario: a peer serves garbage; the mirror's correct bytes win and the
// peer is blacklisted for it.
#[tokio::test]
async fn race_lying_peer_is_blacklisted() {
    let data = payload(1000);
    let hash = sha256_hex(&data);
    let metrics = Arc::new(MetricsRegistry::new());
    let scorer = Arc::new(PeerScorer::new());
    let engine =
        DownloadEngine::new(engine_config(), metrics.clone()).with_scorer(scorer.clone());

    let garbage = vec![0x5au8; 1001];
    let request = DownloadRequest::new(hash.clone(), 1000)
        .with_peers(vec![Source::peer(
            "peer-liar",
            Arc::new(SimTransport::serving(garbage)),
        )])
        .with_mirror(Source::mirror(
            "http://mirror.example",
            Arc::new(SimTransport::serving(data.clone()).with_delay(Duration::from_millis(300))),
        ));

    let result = engine
        .download(request, CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(result.source_type, SourceType::Mirror);
    assert_eq!(result.data.as_ref(), &data[..]);
    assert!(scorer.is_blacklisted("peer-liar"));
    let stats = scorer.stats("peer-liar").unwrap();
    assert_eq!(stats.blacklist_reason.as_deref(), Some("hash mismatch"));
    assert_eq!(metrics.verification_failures(), 1);
}

// Scenario: 15 MiB over one range-capable peer, 4 MiB chunks.
#[tokio::test]
async fn chunked_single_peer() {
    let data = payload((15 * MIB) as usize);
    let hash = sha256_hex(&data);
    let metrics = Arc::new(MetricsRegistry::new());
    let engine = DownloadEngine::new(engine_config(), metrics.clone());

    let request = DownloadRequest::new(hash.clone(), 15 * MIB).with_peers(vec![Source::peer(
        "peer-1",
        Arc::new(SimTransport::serving(data.clone())),
    )]);

    let result = engine
        .download(request, CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(result.chunks_total, 4);
    assert_eq!(result.chunks_from_p2p, 4);
    assert_eq!(result.source_type, SourceType::Peer);
    assert_eq!(result.peer_bytes, 15 * MIB);
    assert_eq!(result.size, 15 * MIB);
    assert_eq!(sha256_hex(&result.data), hash);
    assert_eq!(metrics.snapshot().chunk_download_time.count, 4);
}

// Scenario: one of three peers always errors; retries fail over and the
// download still completes intact.
#[tokio::test]
async fn chunked_survives_failing_peer() {
    let data = payload((12 * MIB) as usize);
    let hash = sha256_hex(&data);
    let metrics = Arc::new(MetricsRegistry::new());
    let scorer = Arc::new(PeerScorer::new());
    let engine =
        DownloadEngine::new(engine_config(), metrics).with_scorer(scorer.clone());

    let bad = Arc::new(SimTransport::failing());
    let request = DownloadRequest::new(hash.clone(), 12 * MIB).with_peers(vec![
        Source::peer("peer-bad", bad.clone()),
        Source::peer("peer-good-1", Arc::new(SimTransport::serving(data.clone()))),
        Source::peer("peer-good-2", Arc::new(SimTransport::serving(data.clone()))),
    ]);

    let result = engine
        .download(request, CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(sha256_hex(&result.data), hash);
    assert_eq!(result.size, 12 * MIB);
    assert_eq!(result.chunks_total, 3);
    // The bad peer was tried at least once and its failures recorded.
    assert!(bad.requests() >= 1);
    assert!(scorer.stats("peer-bad").unwrap().failure_count >= 1);
}

// Scenario: cancellation mid-download returns promptly and leaves no chunk
// record in flight.
#[tokio::test]
async fn cancellation_is_prompt_and_clean() {
    let data = payload((12 * MIB) as usize);
    let hash = sha256_hex(&data);
    let metrics = Arc::new(MetricsRegistry::new());
    let store = Arc::new(ResumeStore::open_in_memory().unwrap());
    let engine = Arc::new(
        DownloadEngine::new(engine_config(), metrics).with_resume_store(store.clone()),
    );

    let request = DownloadRequest::new(hash.clone(), 12 * MIB).with_peers(vec![Source::peer(
        "peer-slow",
        Arc::new(SimTransport::serving(data.clone()).with_delay(Duration::from_millis(500))),
    )]);

    let cancel = CancellationToken::new();
    let task = {
        let engine = engine.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { engine.download(request, cancel).await })
    };

    tokio::time::sleep(Duration::from_millis(50)).await;
    let cancelled_at = Instant::now();
    cancel.cancel();

    let result = task.await.unwrap();
    assert!(matches!(result, Err(DownloadError::Cancelled)));
    assert!(
        cancelled_at.elapsed() <= Duration::from_millis(200),
        "engine took {:?} to unwind",
        cancelled_at.elapsed()
    );

    let (_, chunks) = store.get(&hash).unwrap().unwrap();
    assert!(chunks.iter().all(|c| c.status != ChunkStatus::InProgress));
}

#[tokio::test]
async fn no_sources_is_an_error() {
    let engine = DownloadEngine::new(engine_config(), Arc::new(MetricsRegistry::new()));
    let result = engine
        .download(
            DownloadRequest::new("ab".repeat(32), 1000),
            CancellationToken::new(),
        )
        .await;
    assert!(matches!(result, Err(DownloadError::NoSources)));
}

#[tokio::test]
async fn race_exhaustion_reports_last_cause() {
    let engine = DownloadEngine::new(engine_config(), Arc::new(MetricsRegistry::new()));
    let request = DownloadRequest::new("ab".repeat(32), 1000).with_peers(vec![
        Source::peer("p1", Arc::new(SimTransport::failing())),
        Source::peer("p2", Arc::new(SimTransport::failing())),
    ]);

    match engine.download(request, CancellationToken::new()).await {
        Err(DownloadError::AllSourcesFailed { last_cause }) => {
            assert!(last_cause.contains("simulated transport failure"));
        }
        other => panic!("unexpected outcome: {:?}", other.map(|r| r.source_type)),
    }
}

// Chunked mode with a hopeless swarm falls back to the mirror for every
// chunk; accounting reflects a pure-mirror transfer.
#[tokio::test]
async fn chunked_falls_back_to_mirror() {
    let data = payload((12 * MIB) as usize);
    let hash = sha256_hex(&data);
    let engine = DownloadEngine::new(engine_config(), Arc::new(MetricsRegistry::new()));

    let request = DownloadRequest::new(hash.clone(), 12 * MIB)
        .with_peers(vec![Source::peer("peer-dead", Arc::new(SimTransport::failing()))])
        .with_mirror(Source::mirror(
            "http://mirror.example",
            Arc::new(SimTransport::serving(data.clone())),
        ));

    let result = engine
        .download(request, CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(result.source_type, SourceType::Mirror);
    assert_eq!(result.chunks_from_p2p, 0);
    assert_eq!(result.mirror_bytes, 12 * MIB);
    assert_eq!(sha256_hex(&result.data), hash);
}

// A chunk whose retries are exhausted fails the download with history.
#[tokio::test]
async fn chunk_retry_exhaustion_fails_download() {
    let hash = "cd".repeat(32);
    let store = Arc::new(ResumeStore::open_in_memory().unwrap());
    let engine = DownloadEngine::new(engine_config(), Arc::new(MetricsRegistry::new()))
        .with_resume_store(store.clone());

    let request = DownloadRequest::new(hash.clone(), 12 * MIB)
        .with_peers(vec![Source::peer("peer-dead", Arc::new(SimTransport::failing()))]);

    match engine.download(request, CancellationToken::new()).await {
        Err(DownloadError::ChunkFailed {
            attempts, history, ..
        }) => {
            assert_eq!(attempts, 3);
            assert_eq!(history.len(), 3);
        }
        other => panic!("unexpected outcome: {:?}", other.map(|r| r.source_type)),
    }

    // The failure is durable and nothing is left mid-flight.
    let (record, chunks) = store.get(&hash).unwrap().unwrap();
    assert_eq!(record.status.as_str(), "failed");
    assert!(chunks.iter().all(|c| c.status != ChunkStatus::InProgress));
}

// Successful chunked downloads are journaled then removed from the resume
// store.
#[tokio::test]
async fn resume_record_removed_after_success() {
    let data = payload((12 * MIB) as usize);
    let hash = sha256_hex(&data);
    let store = Arc::new(ResumeStore::open_in_memory().unwrap());
    let engine = DownloadEngine::new(engine_config(), Arc::new(MetricsRegistry::new()))
        .with_resume_store(store.clone());

    let request = DownloadRequest::new(hash.clone(), 12 * MIB).with_peers(vec![Source::peer(
        "peer-1",
        Arc::new(SimTransport::serving(data.clone())),
    )]);

    engine
        .download(request, CancellationToken::new())
        .await
        .unwrap();

    assert!(store.get(&hash).unwrap().is_none());
    assert!(store.pending_downloads().unwrap().is_empty());
}

// The verified artifact lands in the content cache under its hash.
#[tokio::test]
async fn verified_artifact_reaches_cache() {
    let data = payload(2000);
    let hash = sha256_hex(&data);
    let cache = Arc::new(MemoryCache::new());
    let engine = DownloadEngine::new(engine_config(), Arc::new(MetricsRegistry::new()))
        .with_cache(cache.clone());

    let request = DownloadRequest::new(hash.clone(), 2000)
        .with_package_name("curl_8.5.0_amd64.deb")
        .with_mirror(Source::mirror(
            "http://mirror.example",
            Arc::new(SimTransport::serving(data.clone())),
        ));

    engine
        .download(request, CancellationToken::new())
        .await
        .unwrap();

    assert!(cache.has(&hash).await);
    assert_eq!(cache.get(&hash).await.unwrap().as_ref(), &data[..]);
}

struct FixedProviders(Vec<String>);

#[async_trait]
impl ProviderLookup for FixedProviders {
    async fn providers(&self, _hash: &str) -> Result<Vec<String>> {
        Ok(self.0.clone())
    }
}

// Provider verification runs before peer downloads and feeds its metrics.
#[tokio::test]
async fn provider_verification_is_observational() {
    let data = payload(1500);
    let hash = sha256_hex(&data);
    let metrics = Arc::new(MetricsRegistry::new());
    let verifier = Arc::new(MultiSourceVerifier::new(
        Arc::new(FixedProviders(vec!["p1".into(), "p2".into()])),
        metrics.clone(),
    ));
    let engine =
        DownloadEngine::new(engine_config(), metrics.clone()).with_verifier(verifier);

    let request = DownloadRequest::new(hash.clone(), 1500).with_peers(vec![Source::peer(
        "p1",
        Arc::new(SimTransport::serving(data.clone())),
    )]);

    let result = engine
        .download(request, CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(result.source_type, SourceType::Peer);
    assert_eq!(metrics.verification_result("verified"), 1);
}

// Every download outcome shows up in the audit journal with truncated ids.
#[tokio::test]
async fn outcomes_are_journaled() {
    let dir = tempfile::TempDir::new().unwrap();
    let audit_config = AuditConfig {
        log_path: None,
        max_size_bytes: 1 << 20,
        max_backups: 2,
    };
    let audit = Arc::new(AuditLogger::new(dir.path().join("audit.log"), &audit_config).unwrap());

    let data = payload(800);
    let hash = sha256_hex(&data);
    let engine = DownloadEngine::new(engine_config(), Arc::new(MetricsRegistry::new()))
        .with_audit(audit.clone());

    let request = DownloadRequest::new(hash.clone(), 800)
        .with_package_name("tiny.deb")
        .with_mirror(Source::mirror(
            "http://mirror.example",
            Arc::new(SimTransport::serving(data)),
        ));
    engine
        .download(request, CancellationToken::new())
        .await
        .unwrap();

    let failing = DownloadRequest::new("ef".repeat(32), 900)
        .with_mirror(Source::mirror(
            "http://mirror.example",
            Arc::new(SimTransport::failing()),
        ));
    let _ = engine.download(failing, CancellationToken::new()).await;

    let events = audit.tail(10).unwrap();
    assert!(events
        .iter()
        .any(|e| e.event_type == AuditEventType::DownloadComplete
            && e.package_name.as_deref() == Some("tiny.deb")));
    assert!(events
        .iter()
        .any(|e| e.event_type == AuditEventType::DownloadFailed));
    assert!(events.iter().all(|e| e.package_hash.len() <= 16));
}

// A caller deadline maps to the Timeout error kind.
#[tokio::test]
async fn deadline_maps_to_timeout() {
    let data = payload(1000);
    let hash = sha256_hex(&data);
    let engine = DownloadEngine::new(engine_config(), Arc::new(MetricsRegistry::new()));

    let request = DownloadRequest::new(hash, 1000).with_mirror(Source::mirror(
        "http://mirror.example",
        Arc::new(SimTransport::serving(data).with_delay(Duration::from_secs(30))),
    ));

    let result = engine
        .download_with_timeout(request, CancellationToken::new(), Duration::from_millis(100))
        .await;
    assert!(matches!(result, Err(DownloadError::Timeout)));
}
