//! Provider clients and the capability trait the coordinator fans out over.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::error::SourceError;
use crate::layers::guard::SourceGuard;
use crate::layers::result::SourceStatus;
use crate::layers::usage::ApiUsageStats;
use crate::layers::{DiscoveredPaper, DiscoveryConfiguration, DiscoverySource, SourcePaper};

pub mod arxiv;
pub mod openalex;
pub mod semantic_scholar;

pub use arxiv::ArxivClient;
pub use openalex::OpenAlexClient;
pub use semantic_scholar::SemanticScholarClient;

/// What one source produced for one discovery request. Never an error:
/// failures are folded into `status` with an empty paper list.
#[derive(Debug, Clone)]
pub struct SourceReport {
    pub source: DiscoverySource,
    pub papers: Vec<DiscoveredPaper>,
    pub status: SourceStatus,
    pub elapsed: Duration,
}

impl SourceReport {
    pub fn succeeded(source: DiscoverySource, papers: Vec<DiscoveredPaper>, elapsed: Duration) -> Self {
        Self {
            source,
            papers,
            status: SourceStatus::Succeeded,
            elapsed,
        }
    }

    pub fn empty(source: DiscoverySource, status: SourceStatus, elapsed: Duration) -> Self {
        Self {
            source,
            papers: Vec::new(),
            status,
            elapsed,
        }
    }
}

/// The discovery capability every provider exposes to the coordinator.
#[async_trait]
pub trait RelatedPaperSource: Send + Sync {
    fn source(&self) -> DiscoverySource;

    async fn discover(&self, paper: &SourcePaper, config: &DiscoveryConfiguration) -> SourceReport;

    fn usage(&self) -> Option<ApiUsageStats> {
        None
    }

    fn reset_usage(&self) {}
}

/// A raw provider integration. Errors are allowed here; [`Guarded`] turns
/// them into empty reports.
#[async_trait]
pub trait SourceClient: Send + Sync {
    fn source(&self) -> DiscoverySource;

    async fn fetch(
        &self,
        paper: &SourcePaper,
        config: &DiscoveryConfiguration,
    ) -> Result<Vec<DiscoveredPaper>, SourceError>;
}

/// Puts a [`SourceClient`] behind its source's rate limiter and circuit breaker.
pub struct Guarded<C> {
    client: C,
    guard: Arc<SourceGuard>,
}

impl<C: SourceClient> Guarded<C> {
    pub fn new(client: C, guard: Arc<SourceGuard>) -> Self {
        Self { client, guard }
    }

    pub fn guard(&self) -> &SourceGuard {
        &self.guard
    }
}

#[async_trait]
impl<C: SourceClient> RelatedPaperSource for Guarded<C> {
    fn source(&self) -> DiscoverySource {
        self.client.source()
    }

    async fn discover(&self, paper: &SourcePaper, config: &DiscoveryConfiguration) -> SourceReport {
        let source = self.client.source();
        let started = Instant::now();

        let permit = match self.guard.admit().await {
            Ok(permit) => permit,
            Err(e) => {
                warn!(source = %source, error = %e, "Skipping source");
                let status = match e {
                    SourceError::RateLimited(_) => SourceStatus::RateLimited,
                    _ => SourceStatus::CircuitOpen,
                };
                return SourceReport::empty(source, status, started.elapsed());
            }
        };

        match self.client.fetch(paper, config).await {
            Ok(papers) => {
                permit.succeed();
                let papers = trim_to_budget(papers, config);
                debug!(source = %source, n = papers.len(), "Source discovery complete");
                SourceReport::succeeded(source, papers, started.elapsed())
            }
            Err(e) => {
                permit.fail();
                warn!(source = %source, error = %e, "Source discovery failed");
                SourceReport::empty(source, SourceStatus::Failed(e.to_string()), started.elapsed())
            }
        }
    }

    fn usage(&self) -> Option<ApiUsageStats> {
        Some(self.guard.usage())
    }

    fn reset_usage(&self) {
        self.guard.reset_usage();
    }
}

/// Best first, capped at the per-source budget. Without a later AI pass
/// nothing can lift a paper over the threshold, so drop those early.
fn trim_to_budget(mut papers: Vec<DiscoveredPaper>, config: &DiscoveryConfiguration) -> Vec<DiscoveredPaper> {
    if !config.enable_ai_synthesis {
        papers.retain(|p| p.relevance_score() >= config.min_relevance);
    }
    papers.sort_by(|a, b| {
        b.relevance_score()
            .total_cmp(&a.relevance_score())
            .then_with(|| a.title.cmp(&b.title))
    });
    if config.max_results_per_source > 0 {
        papers.truncate(config.max_results_per_source);
    }
    papers
}

/// Shared HTTP client with a sane request timeout and a polite user agent.
pub(crate) fn http_client() -> reqwest::Client {
    reqwest::Client::builder()
        .user_agent(concat!("related-papers/", env!("CARGO_PKG_VERSION")))
        .timeout(Duration::from_secs(60))
        .build()
        .unwrap_or_else(|e| {
            warn!(error = %e, "Falling back to default HTTP client");
            reqwest::Client::new()
        })
}

pub(crate) async fn check_status(
    source: DiscoverySource,
    resp: reqwest::Response,
) -> Result<reqwest::Response, SourceError> {
    let status = resp.status();
    if status.is_success() {
        Ok(resp)
    } else {
        Err(SourceError::Status {
            provider: source,
            status: status.as_u16(),
        })
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::layers::guard::{CircuitState, GuardConfig};
    use crate::layers::RelationshipType;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Client that fails the first `failures` calls and counts every call.
    pub(crate) struct FlakyClient {
        pub failures: usize,
        pub calls: AtomicUsize,
    }

    #[async_trait]
    impl SourceClient for FlakyClient {
        fn source(&self) -> DiscoverySource {
            DiscoverySource::AcademicGraph
        }

        async fn fetch(
            &self,
            _paper: &SourcePaper,
            _config: &DiscoveryConfiguration,
        ) -> Result<Vec<DiscoveredPaper>, SourceError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.failures {
                return Err(SourceError::Status {
                    provider: DiscoverySource::AcademicGraph,
                    status: 503,
                });
            }
            Ok((0..30)
                .map(|i| {
                    DiscoveredPaper::new(
                        format!("Candidate paper number {}", i),
                        DiscoverySource::AcademicGraph,
                        RelationshipType::CitedBy,
                        i as f64 / 30.0,
                    )
                })
                .collect())
        }
    }

    fn guarded(failures: usize, threshold: u32) -> Guarded<FlakyClient> {
        let config = GuardConfig {
            requests_per_minute: 10_000,
            burst: 1_000,
            failure_threshold: threshold,
            ..GuardConfig::default()
        };
        Guarded::new(
            FlakyClient {
                failures,
                calls: AtomicUsize::new(0),
            },
            Arc::new(SourceGuard::new(DiscoverySource::AcademicGraph, config)),
        )
    }

    #[tokio::test]
    async fn test_errors_become_empty_reports() {
        let source = guarded(1, 5);
        let paper = SourcePaper::new("p", "Some source paper");
        let report = source.discover(&paper, &DiscoveryConfiguration::default()).await;
        assert!(report.papers.is_empty());
        assert!(matches!(report.status, SourceStatus::Failed(_)));
        assert_eq!(source.usage().unwrap().failed_requests, 1);
    }

    #[tokio::test]
    async fn test_results_sorted_and_capped() {
        let source = guarded(0, 5);
        let paper = SourcePaper::new("p", "Some source paper");
        let config = DiscoveryConfiguration::default().with_max_results_per_source(5);
        let report = source.discover(&paper, &config).await;
        assert_eq!(report.papers.len(), 5);
        assert!(report.papers[0].relevance_score() >= report.papers[4].relevance_score());
        assert!(report.status.is_success());
    }

    #[tokio::test]
    async fn test_without_ai_low_relevance_dropped() {
        let source = guarded(0, 5);
        let paper = SourcePaper::new("p", "Some source paper");
        let config = DiscoveryConfiguration::default()
            .with_ai_synthesis(false)
            .with_min_relevance(0.5)
            .with_max_results_per_source(100);
        let report = source.discover(&paper, &config).await;
        assert_eq!(report.papers.len(), 15);
        assert!(report.papers.iter().all(|p| p.relevance_score() >= 0.5));
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_circuit_skips_network() {
        let source = guarded(usize::MAX, 2);
        let paper = SourcePaper::new("p", "Some source paper");
        let config = DiscoveryConfiguration::default();
        source.discover(&paper, &config).await;
        source.discover(&paper, &config).await;
        assert_eq!(source.guard().circuit_state(), CircuitState::Open);

        for _ in 0..3 {
            let report = source.discover(&paper, &config).await;
            assert_eq!(report.status, SourceStatus::CircuitOpen);
        }
        assert_eq!(source.client.calls.load(Ordering::SeqCst), 2);

        tokio::time::advance(Duration::from_secs(31)).await;
        source.discover(&paper, &config).await;
        assert_eq!(source.client.calls.load(Ordering::SeqCst), 3);
        assert_eq!(source.guard().circuit_state(), CircuitState::Open);
    }
}
