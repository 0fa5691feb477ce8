use thiserror::Error;

/// Errors surfaced by the download engine.
///
/// Transport-level failures are retried internally with source reselection
/// and only show up here once a chunk or a whole race is out of options.
/// Messages carry truncated identifiers only; full hashes and peer ids never
/// reach callers or logs.
#[derive(Debug, Error)]
pub enum DownloadError {
    /// No peer sources and no mirror were supplied.
    #[error("no sources available for download")]
    NoSources,

    /// Racing mode exhausted every racer with only transient errors.
    #[error("all sources failed: {last_cause}")]
    AllSourcesFailed { last_cause: String },

    /// The assembled artifact (or every raced response) failed SHA-256
    /// verification.
    #[error("hash mismatch: expected {expected}, got {actual}")]
    HashMismatch { expected: String, actual: String },

    /// A single chunk ran out of retries.
    #[error("chunk {index} failed after {attempts} attempts: {cause}")]
    ChunkFailed {
        index: u32,
        attempts: u32,
        cause: String,
        history: Vec<String>,
    },

    /// The caller's deadline elapsed before the download finished.
    #[error("download timed out")]
    Timeout,

    /// The caller cancelled the download.
    #[error("download cancelled")]
    Cancelled,

    /// The resume store rejected the initial record; the job cannot make
    /// durable progress and is abandoned.
    #[error("resume store error: {0}")]
    Store(String),
}

impl DownloadError {
    /// Stable kind name, used for audit events and metrics labels.
    pub fn kind(&self) -> &'static str {
        match self {
            DownloadError::NoSources => "no_sources",
            DownloadError::AllSourcesFailed { .. } => "all_sources_failed",
            DownloadError::HashMismatch { .. } => "hash_mismatch",
            DownloadError::ChunkFailed { .. } => "chunk_failed",
            DownloadError::Timeout => "timeout",
            DownloadError::Cancelled => "cancelled",
            DownloadError::Store(_) => "store",
        }
    }
}

/// Truncate a hash or peer id to 16 characters for logging and error text.
pub fn truncate_id(id: &str) -> String {
    id.chars().take(16).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncates_long_ids() {
        let hash = "a".repeat(64);
        assert_eq!(truncate_id(&hash).len(), 16);
        assert_eq!(truncate_id("short"), "short");
    }

    #[test]
    fn error_kinds_are_stable() {
        assert_eq!(DownloadError::NoSources.kind(), "no_sources");
        assert_eq!(
            DownloadError::ChunkFailed {
                index: 3,
                attempts: 3,
                cause: "timeout".into(),
                history: vec![],
            }
            .kind(),
            "chunk_failed"
        );
        assert_eq!(DownloadError::Cancelled.kind(), "cancelled");
    }

    #[test]
    fn display_includes_context() {
        let err = DownloadError::AllSourcesFailed {
            last_cause: "connection refused".into(),
        };
        assert!(err.to_string().contains("connection refused"));
    }
}
