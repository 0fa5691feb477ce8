/// Multi-Source Verification
///
/// Before a swarm is trusted for a package, the verifier asks the DHT (via
/// an injected lookup) how many providers advertise the hash. The verdict
/// is observational: it feeds metrics and the audit journal but never
/// blocks a download, and a lookup failure simply counts as unverified.
use crate::audit_logger::{AuditEvent, AuditEventType, AuditLogger};
use crate::metrics::MetricsRegistry;
use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{timeout, Instant};
use tracing::debug;

const DEFAULT_QUERY_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_MIN_PROVIDERS: usize = 2;

/// DHT provider lookup, supplied by the network layer.
#[async_trait]
pub trait ProviderLookup: Send + Sync {
    async fn providers(&self, hash: &str) -> Result<Vec<String>>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VerificationOutcome {
    /// Enough independent providers advertise the hash.
    Verified { providers: usize },
    /// Too few providers, a lookup error, or a query timeout.
    Unverified { reason: String },
}

pub struct MultiSourceVerifier {
    lookup: Arc<dyn ProviderLookup>,
    metrics: Arc<MetricsRegistry>,
    audit: Option<Arc<AuditLogger>>,
    min_providers: usize,
    query_timeout: Duration,
}

impl MultiSourceVerifier {
    pub fn new(lookup: Arc<dyn ProviderLookup>, metrics: Arc<MetricsRegistry>) -> Self {
        Self {
            lookup,
            metrics,
            audit: None,
            min_providers: DEFAULT_MIN_PROVIDERS,
            query_timeout: DEFAULT_QUERY_TIMEOUT,
        }
    }

    pub fn with_audit(mut self, audit: Arc<AuditLogger>) -> Self {
        self.audit = Some(audit);
        self
    }

    pub fn with_min_providers(mut self, min_providers: usize) -> Self {
        self.min_providers = min_providers;
        self
    }

    pub fn with_query_timeout(mut self, query_timeout: Duration) -> Self {
        self.query_timeout = query_timeout;
        self
    }

    /// Count providers for `hash` and record the verdict.
    pub async fn verify(&self, hash: &str) -> VerificationOutcome {
        let start = Instant::now();
        let outcome = match timeout(self.query_timeout, self.lookup.providers(hash)).await {
            Ok(Ok(providers)) => {
                self.metrics.observe_verification_providers(providers.len());
                if providers.len() >= self.min_providers {
                    VerificationOutcome::Verified {
                        providers: providers.len(),
                    }
                } else {
                    VerificationOutcome::Unverified {
                        reason: format!(
                            "only {} of {} required providers",
                            providers.len(),
                            self.min_providers
                        ),
                    }
                }
            }
            Ok(Err(e)) => VerificationOutcome::Unverified {
                reason: format!("provider lookup failed: {}", e),
            },
            Err(_) => VerificationOutcome::Unverified {
                reason: "provider lookup timed out".to_string(),
            },
        };
        let elapsed = start.elapsed();
        self.metrics.observe_verification_duration(elapsed);

        match &outcome {
            VerificationOutcome::Verified { providers } => {
                self.metrics.record_verification_result("verified");
                debug!(hash = %crate::error::truncate_id(hash), providers, "multi-source verified");
                if let Some(audit) = &self.audit {
                    audit.log(
                        &AuditEvent::new(AuditEventType::MultiSourceVerified, hash)
                            .with_duration(elapsed)
                            .with_provider_count(*providers),
                    );
                }
            }
            VerificationOutcome::Unverified { reason } => {
                self.metrics.record_verification_result("unverified");
                debug!(hash = %crate::error::truncate_id(hash), reason = %reason, "multi-source unverified");
                if let Some(audit) = &self.audit {
                    audit.log(
                        &AuditEvent::new(AuditEventType::MultiSourceUnverified, hash)
                            .with_duration(elapsed)
                            .with_reason(reason.clone()),
                    );
                }
            }
        }
        outcome
    }
}
