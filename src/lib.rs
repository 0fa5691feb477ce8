// ===================================================================================================
// pkgswarm - Caching P2P Distribution Overlay for OS Packages
// ===================================================================================================
//
// pkgswarm fetches content-addressed packages simultaneously from
// conventional mirrors and from overlay peers that already hold the same
// bytes, assembles them under SHA-256 verification, and re-serves what it
// has to its neighbors.
//
// The heart of the crate is the multi-source download engine and the three
// subsystems that drive it:
// - the peer scorer, which turns transfer observations into a [0, 1] score
//   per peer and manages timed blacklists;
// - the rate limiter pair, which throttles every byte of overlay I/O
//   through a global and a per-peer token bucket, with the per-peer rate
//   retuned from the scorer signal;
// - the resume store, which journals chunk-level progress to SQLite so a
//   crashed node picks up where it left off.
//
// Index parsing, the content-addressed blob cache, the HTTP front-end and
// the wire transports live outside this crate; they are consumed through
// the narrow traits in `package_index`, `content_cache` and `source`.
//
// ===================================================================================================

// ===== DOWNLOAD CORE =====
pub mod download_engine;   // Chunked + racing multi-source download strategies
pub mod source;            // Peer/mirror source handles over injected transports
pub mod source_tracker;    // Per-job adaptive source selection
pub mod peer_scorer;       // Cross-job peer reputation and blacklists
pub mod rate_limiter;      // Global + per-peer token-bucket bandwidth limiting
pub mod resume_store;      // Crash-safe download/chunk state in SQLite
pub mod verifier;          // Multi-source provider verification via the DHT

// ===== EXTERNAL COLLABORATOR INTERFACES =====
pub mod content_cache;     // Content-addressed blob cache consumed by the engine
pub mod package_index;     // Repository index lookups consumed by the front-end

// ===== OBSERVABILITY =====
pub mod audit_logger;      // JSON-per-line audit journal with rotation
pub mod metrics;           // Counters, gauges and histograms for the engine

// ===== SYSTEM PLUMBING =====
pub mod cli;               // Maintenance command-line interface
pub mod config;            // TOML configuration with engine defaults
pub mod error;             // Engine error kinds and redaction helpers
pub mod hashing;           // SHA-256 helpers for artifact verification
pub mod logging;           // Tracing subscriber setup
