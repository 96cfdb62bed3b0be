//! Concurrent fan-out over the enabled sources with per-source and overall
//! timeouts. Always returns a result; nothing inside escapes as an error.

use std::collections::{BTreeMap, HashMap};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures_util::FutureExt;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::{timeout, timeout_at, Instant};
use tracing::{debug, info, instrument, warn};

use crate::config::Settings;
use crate::error::{DiscoveryError, Result};
use crate::layers::discovery::{
    ArxivClient, Guarded, OpenAlexClient, RelatedPaperSource, SemanticScholarClient, SourceReport,
};
use crate::layers::guard::SourceGuard;
use crate::layers::llm::OpenAiCompatibleModel;
use crate::layers::resolution::Resolver;
use crate::layers::result::{RelatedPaperDiscoveryResult, SourceStatistics, SourceStatus};
use crate::layers::store::DiscoveryStore;
use crate::layers::synthesis::SynthesisEngine;
use crate::layers::usage::ApiUsageStats;
use crate::layers::{DiscoveredPaper, DiscoveryConfiguration, DiscoverySource, SourcePaper};

pub struct DiscoveryCoordinator {
    sources: Vec<Arc<dyn RelatedPaperSource>>,
    synthesis: Arc<SynthesisEngine>,
    executor: Arc<Semaphore>,
    store: Option<Arc<dyn DiscoveryStore>>,
}

impl DiscoveryCoordinator {
    pub fn new(sources: Vec<Arc<dyn RelatedPaperSource>>, synthesis: SynthesisEngine) -> Self {
        Self {
            sources,
            synthesis: Arc::new(synthesis),
            executor: Arc::new(Semaphore::new(crate::config::DEFAULT_MAX_CONCURRENT_REQUESTS)),
            store: None,
        }
    }

    /// Caps concurrent outbound provider calls across every request served
    /// by this coordinator.
    pub fn with_max_concurrency(mut self, permits: usize) -> Self {
        self.executor = Arc::new(Semaphore::new(permits.max(1)));
        self
    }

    pub fn with_store(mut self, store: Arc<dyn DiscoveryStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Production wiring: the three provider clients behind their guards and,
    /// when configured, an OpenAI-compatible model for relevance scoring.
    pub fn from_settings(settings: &Settings) -> Result<Self> {
        let guard = |source: DiscoverySource| Arc::new(SourceGuard::new(source, settings.guard_config(source)));

        let sources: Vec<Arc<dyn RelatedPaperSource>> = vec![
            Arc::new(Guarded::new(
                OpenAlexClient::new(settings.openalex_email.clone()),
                guard(DiscoverySource::BibliographicIndex),
            )),
            Arc::new(Guarded::new(
                SemanticScholarClient::new(settings.semantic_scholar_api_key.clone()),
                guard(DiscoverySource::AcademicGraph),
            )),
            Arc::new(Guarded::new(ArxivClient::new(), guard(DiscoverySource::RealtimeResearch))),
        ];

        let mut synthesis = SynthesisEngine::new();
        if let Some(llm) = &settings.llm {
            let model = OpenAiCompatibleModel::new(&llm.base_url, llm.api_key.clone(), llm.model.clone())
                .map_err(|e| DiscoveryError::Config(e.to_string()))?;
            info!(model = %llm.model, "Language model relevance scoring enabled");
            synthesis = synthesis
                .with_language_model(Arc::new(model))
                .with_llm_timeout(llm.timeout);
        }

        Ok(Self::new(sources, synthesis).with_max_concurrency(settings.max_concurrent_requests))
    }

    /// One snapshot per registered source, plus the language model if any.
    pub fn usage_report(&self) -> Vec<ApiUsageStats> {
        self.sources
            .iter()
            .filter_map(|s| s.usage())
            .chain(self.synthesis.usage())
            .collect()
    }

    pub fn reset_usage(&self) {
        for source in &self.sources {
            source.reset_usage();
        }
        self.synthesis.reset_usage();
        info!("Usage counters reset");
    }

    /// Never fails: errors and panics anywhere in the fan-out become a
    /// partial, review-flagged result.
    #[instrument(skip_all, fields(paper = %paper.id))]
    pub async fn coordinate_discovery(
        &self,
        paper: &SourcePaper,
        config: &DiscoveryConfiguration,
    ) -> RelatedPaperDiscoveryResult {
        let started_at = Utc::now();
        let outcome = AssertUnwindSafe(self.run(paper, config, started_at)).catch_unwind().await;

        let error = match outcome {
            Ok(Ok(result)) => return result,
            Ok(Err(e)) => e,
            Err(panic) => DiscoveryError::from_panic(panic),
        };
        warn!(paper = %paper.id, error = %error, "Discovery coordination failed");
        RelatedPaperDiscoveryResult::partial(&paper.id, BTreeMap::new(), error.to_string(), started_at)
    }

    /// Serve a stored result for the same paper and policy when there is
    /// one; otherwise discover and store the result unless it is degraded.
    pub async fn discover_or_reuse(
        &self,
        paper: &SourcePaper,
        config: &DiscoveryConfiguration,
    ) -> Arc<RelatedPaperDiscoveryResult> {
        let fingerprint = config.fingerprint();
        if let Some(store) = &self.store {
            if let Some(hit) = store.get(&paper.id, &fingerprint).await {
                info!(paper = %paper.id, "Reusing stored discovery");
                return hit;
            }
        }

        let result = Arc::new(self.coordinate_discovery(paper, config).await);
        if let Some(store) = &self.store {
            if !result.is_degraded() {
                store.put(&paper.id, &fingerprint, Arc::clone(&result)).await;
            }
        }
        result
    }

    async fn run(
        &self,
        paper: &SourcePaper,
        config: &DiscoveryConfiguration,
        started_at: DateTime<Utc>,
    ) -> Result<RelatedPaperDiscoveryResult> {
        let active: Vec<Arc<dyn RelatedPaperSource>> = self
            .sources
            .iter()
            .filter(|s| config.is_enabled(s.source()))
            .cloned()
            .collect();
        if active.is_empty() {
            return Err(DiscoveryError::Config(
                "no registered source is enabled for this request".to_string(),
            ));
        }

        // Bounds synthesis as well as the fan-out.
        let deadline = Instant::now() + config.overall_timeout;
        let reports = self.fan_out(&active, paper, config, deadline).await;

        let mut source_statistics = BTreeMap::new();
        let mut warnings = Vec::new();
        let mut raw = Vec::new();
        for (source, report) in reports {
            if !report.status.is_success() {
                warnings.push(report.status.describe(source));
            }
            source_statistics.insert(
                source,
                SourceStatistics::new(report.papers.len(), report.status, report.elapsed),
            );
            raw.extend(report.papers);
        }
        let any_succeeded = source_statistics.values().any(|s| s.status.is_success());
        info!(raw = raw.len(), failed = warnings.len(), "Source fan-out complete");

        let result = if config.enable_ai_synthesis && !raw.is_empty() {
            self.synthesis
                .synthesize_results_before(paper, raw, config, source_statistics, started_at, deadline)
                .await
        } else {
            fallback(paper, raw, config, source_statistics, started_at)
        };

        let mut result = result.with_warnings(warnings);
        if !any_succeeded {
            result.requires_user_review = true;
        }
        Ok(result)
    }

    /// One task per source, each under its own timeout and the shared
    /// executor. Tasks still running at the overall deadline are aborted and
    /// reported as abandoned; finished reports are kept.
    async fn fan_out(
        &self,
        active: &[Arc<dyn RelatedPaperSource>],
        paper: &SourcePaper,
        config: &DiscoveryConfiguration,
        deadline: Instant,
    ) -> BTreeMap<DiscoverySource, SourceReport> {
        let started = Instant::now();
        let per_source = config.per_source_timeout(active.len());
        debug!(sources = active.len(), per_source = ?per_source, "Fanning out");

        let mut tasks = JoinSet::new();
        let mut task_sources = HashMap::new();
        for source in active {
            let kind = source.source();
            let source = Arc::clone(source);
            let executor = Arc::clone(&self.executor);
            let paper = paper.clone();
            let config = config.clone();
            let handle = tasks.spawn(async move {
                let task_started = Instant::now();
                let work = async {
                    match executor.acquire_owned().await {
                        Ok(_permit) => source.discover(&paper, &config).await,
                        Err(_) => SourceReport::empty(
                            kind,
                            SourceStatus::Failed("executor closed".to_string()),
                            task_started.elapsed(),
                        ),
                    }
                };
                match timeout(per_source, work).await {
                    Ok(report) => report,
                    Err(_) => {
                        warn!(source = %kind, timeout = ?per_source, "Source timed out");
                        SourceReport::empty(kind, SourceStatus::TimedOut, task_started.elapsed())
                    }
                }
            });
            task_sources.insert(handle.id(), kind);
        }

        let mut reports = BTreeMap::new();
        loop {
            match timeout_at(deadline, tasks.join_next_with_id()).await {
                Ok(Some(Ok((_, report)))) => {
                    reports.insert(report.source, report);
                }
                Ok(Some(Err(join_error))) => {
                    let Some(kind) = task_sources.get(&join_error.id()).copied() else {
                        continue;
                    };
                    let message = if join_error.is_panic() {
                        DiscoveryError::from_panic(join_error.into_panic()).to_string()
                    } else {
                        DiscoveryError::Coordination(join_error.to_string()).to_string()
                    };
                    warn!(source = %kind, error = %message, "Source task failed");
                    reports.insert(
                        kind,
                        SourceReport::empty(kind, SourceStatus::Failed(message), started.elapsed()),
                    );
                }
                Ok(None) => break,
                Err(_) => {
                    warn!(
                        pending = tasks.len(),
                        timeout = ?config.overall_timeout,
                        "Overall timeout reached, continuing with finished sources"
                    );
                    tasks.abort_all();
                    break;
                }
            }
        }

        for kind in task_sources.into_values() {
            reports
                .entry(kind)
                .or_insert_with(|| SourceReport::empty(kind, SourceStatus::Abandoned, started.elapsed()));
        }
        reports
    }
}

/// No synthesis: concatenate, drop the source paper itself and anything
/// under the threshold, cap.
fn fallback(
    paper: &SourcePaper,
    raw: Vec<DiscoveredPaper>,
    config: &DiscoveryConfiguration,
    source_statistics: BTreeMap<DiscoverySource, SourceStatistics>,
    started_at: DateTime<Utc>,
) -> RelatedPaperDiscoveryResult {
    let papers: Vec<DiscoveredPaper> = raw
        .into_iter()
        .filter(|p| !Resolver::is_source_paper(paper, p))
        .filter(|p| p.relevance_score() >= config.min_relevance)
        .take(config.effective_max_papers())
        .collect();
    debug!(kept = papers.len(), "Fallback assembly without synthesis");
    RelatedPaperDiscoveryResult::completed(&paper.id, papers, source_statistics, started_at)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::LlmError;
    use crate::layers::llm::LanguageModel;
    use crate::layers::store::InMemoryDiscoveryStore;
    use crate::layers::RelationshipType;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    enum Behaviour {
        Papers(usize),
        Fail,
        Hang,
        Panic,
        Slow(Duration, usize),
    }

    struct StubSource {
        kind: DiscoverySource,
        behaviour: Behaviour,
        calls: AtomicUsize,
    }

    impl StubSource {
        fn arc(kind: DiscoverySource, behaviour: Behaviour) -> Arc<StubSource> {
            Arc::new(StubSource {
                kind,
                behaviour,
                calls: AtomicUsize::new(0),
            })
        }
    }

    fn papers(kind: DiscoverySource, n: usize) -> Vec<DiscoveredPaper> {
        (0..n)
            .map(|i| {
                DiscoveredPaper::new(
                    format!("{} candidate paper {}", kind, i),
                    kind,
                    RelationshipType::KeywordOverlap,
                    0.5 + (i % 5) as f64 / 10.0,
                )
            })
            .collect()
    }

    #[async_trait]
    impl RelatedPaperSource for StubSource {
        fn source(&self) -> DiscoverySource {
            self.kind
        }

        async fn discover(&self, _paper: &SourcePaper, _config: &DiscoveryConfiguration) -> SourceReport {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match &self.behaviour {
                Behaviour::Papers(n) => SourceReport::succeeded(self.kind, papers(self.kind, *n), Duration::ZERO),
                Behaviour::Fail => SourceReport::empty(self.kind, SourceStatus::Failed("503".into()), Duration::ZERO),
                Behaviour::Hang => {
                    std::future::pending::<()>().await;
                    SourceReport::empty(self.kind, SourceStatus::Succeeded, Duration::ZERO)
                }
                Behaviour::Panic => panic!("provider exploded"),
                Behaviour::Slow(delay, n) => {
                    tokio::time::sleep(*delay).await;
                    SourceReport::succeeded(self.kind, papers(self.kind, *n), *delay)
                }
            }
        }
    }

    fn coordinator(sources: Vec<Arc<StubSource>>) -> DiscoveryCoordinator {
        let sources = sources
            .into_iter()
            .map(|s| s as Arc<dyn RelatedPaperSource>)
            .collect();
        DiscoveryCoordinator::new(sources, SynthesisEngine::new())
    }

    fn source_paper() -> SourcePaper {
        SourcePaper::new("paper-1", "Attention is all you need")
    }

    #[tokio::test]
    async fn test_graceful_degradation() {
        let coordinator = coordinator(vec![
            StubSource::arc(DiscoverySource::BibliographicIndex, Behaviour::Fail),
            StubSource::arc(DiscoverySource::AcademicGraph, Behaviour::Papers(8)),
            StubSource::arc(DiscoverySource::RealtimeResearch, Behaviour::Fail),
        ]);
        let result = coordinator
            .coordinate_discovery(&source_paper(), &DiscoveryConfiguration::default())
            .await;

        assert_eq!(result.discovered_papers.len(), 8);
        assert!(!result.requires_user_review);
        assert!(result.errors.is_empty());
        assert_eq!(result.warnings.len(), 2);
        let graph = &result.source_statistics[&DiscoverySource::AcademicGraph];
        assert_eq!((graph.raw_count, graph.final_count), (8, 8));
        assert!(matches!(
            result.source_statistics[&DiscoverySource::BibliographicIndex].status,
            SourceStatus::Failed(_)
        ));
    }

    #[tokio::test]
    async fn test_total_failure_still_returns_result() {
        let coordinator = coordinator(vec![
            StubSource::arc(DiscoverySource::BibliographicIndex, Behaviour::Fail),
            StubSource::arc(DiscoverySource::AcademicGraph, Behaviour::Fail),
            StubSource::arc(DiscoverySource::RealtimeResearch, Behaviour::Fail),
        ]);
        let result = coordinator
            .coordinate_discovery(&source_paper(), &DiscoveryConfiguration::default())
            .await;
        assert!(result.discovered_papers.is_empty());
        assert!(result.requires_user_review);
        assert_eq!(result.warnings.len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_hanging_source_times_out() {
        let coordinator = coordinator(vec![
            StubSource::arc(DiscoverySource::AcademicGraph, Behaviour::Papers(4)),
            StubSource::arc(DiscoverySource::RealtimeResearch, Behaviour::Hang),
        ]);
        let config = DiscoveryConfiguration::default()
            .with_sources([DiscoverySource::AcademicGraph, DiscoverySource::RealtimeResearch])
            .with_overall_timeout(Duration::from_secs(120));

        let started = Instant::now();
        let result = coordinator.coordinate_discovery(&source_paper(), &config).await;
        let elapsed = started.elapsed();

        assert_eq!(result.discovered_papers.len(), 4);
        assert_eq!(
            result.source_statistics[&DiscoverySource::RealtimeResearch].status,
            SourceStatus::TimedOut
        );
        // 120s split over two sources.
        assert!(elapsed >= Duration::from_secs(60));
        assert!(elapsed < Duration::from_secs(61));
    }

    #[tokio::test(start_paused = true)]
    async fn test_overall_timeout_keeps_finished_sources() {
        let coordinator = coordinator(vec![
            StubSource::arc(DiscoverySource::BibliographicIndex, Behaviour::Papers(3)),
            StubSource::arc(DiscoverySource::AcademicGraph, Behaviour::Slow(Duration::from_secs(50), 5)),
        ]);
        let config = DiscoveryConfiguration::default()
            .with_sources([DiscoverySource::BibliographicIndex, DiscoverySource::AcademicGraph])
            .with_source_timeout(Duration::from_secs(300))
            .with_overall_timeout(Duration::from_secs(40));

        let started = Instant::now();
        let result = coordinator.coordinate_discovery(&source_paper(), &config).await;

        assert!(started.elapsed() <= Duration::from_secs(41));
        assert_eq!(result.discovered_papers.len(), 3);
        assert_eq!(
            result.source_statistics[&DiscoverySource::AcademicGraph].status,
            SourceStatus::Abandoned
        );
        assert!(!result.requires_user_review);
    }

    #[tokio::test]
    async fn test_panicking_source_is_contained() {
        let coordinator = coordinator(vec![
            StubSource::arc(DiscoverySource::AcademicGraph, Behaviour::Panic),
            StubSource::arc(DiscoverySource::RealtimeResearch, Behaviour::Papers(2)),
        ]);
        let result = coordinator
            .coordinate_discovery(&source_paper(), &DiscoveryConfiguration::default())
            .await;
        assert_eq!(result.discovered_papers.len(), 2);
        match &result.source_statistics[&DiscoverySource::AcademicGraph].status {
            SourceStatus::Failed(msg) => assert!(msg.contains("provider exploded")),
            other => panic!("unexpected status {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_no_enabled_sources_is_partial() {
        let coordinator = coordinator(vec![StubSource::arc(DiscoverySource::AcademicGraph, Behaviour::Papers(2))]);
        let config = DiscoveryConfiguration::default().with_sources([DiscoverySource::RealtimeResearch]);
        let result = coordinator.coordinate_discovery(&source_paper(), &config).await;
        assert!(result.discovered_papers.is_empty());
        assert!(result.requires_user_review);
        assert_eq!(result.errors.len(), 1);
    }

    #[tokio::test]
    async fn test_cap_and_fallback_without_ai() {
        let coordinator = coordinator(vec![
            StubSource::arc(DiscoverySource::BibliographicIndex, Behaviour::Papers(40)),
            StubSource::arc(DiscoverySource::AcademicGraph, Behaviour::Papers(40)),
        ]);
        let config = DiscoveryConfiguration::default()
            .with_sources([DiscoverySource::BibliographicIndex, DiscoverySource::AcademicGraph])
            .with_ai_synthesis(false)
            .with_min_relevance(0.65)
            .with_max_total_papers(20);
        let result = coordinator.coordinate_discovery(&source_paper(), &config).await;
        assert_eq!(result.discovered_papers.len(), 20);
        assert!(result.discovered_papers.iter().all(|p| p.relevance_score() >= 0.65));
        assert!(result.discovered_papers.iter().all(|p| p.composite_score.is_none()));
    }

    #[tokio::test]
    async fn test_disabled_source_is_not_called() {
        let skipped = StubSource::arc(DiscoverySource::RealtimeResearch, Behaviour::Papers(2));
        let coordinator = coordinator(vec![
            StubSource::arc(DiscoverySource::AcademicGraph, Behaviour::Papers(2)),
            Arc::clone(&skipped),
        ]);
        let config = DiscoveryConfiguration::default().with_sources([DiscoverySource::AcademicGraph]);
        let result = coordinator.coordinate_discovery(&source_paper(), &config).await;
        assert_eq!(skipped.calls.load(Ordering::SeqCst), 0);
        assert!(!result.source_statistics.contains_key(&DiscoverySource::RealtimeResearch));
    }

    #[tokio::test]
    async fn test_discover_or_reuse_skips_second_fan_out() {
        let source = StubSource::arc(DiscoverySource::AcademicGraph, Behaviour::Papers(3));
        let coordinator = coordinator(vec![Arc::clone(&source)])
            .with_store(Arc::new(InMemoryDiscoveryStore::new()));
        let config = DiscoveryConfiguration::default().with_sources([DiscoverySource::AcademicGraph]);

        let first = coordinator.discover_or_reuse(&source_paper(), &config).await;
        let second = coordinator.discover_or_reuse(&source_paper(), &config).await;
        assert_eq!(source.calls.load(Ordering::SeqCst), 1);
        assert!(Arc::ptr_eq(&first, &second));

        let other = config.clone().with_min_relevance(0.9);
        coordinator.discover_or_reuse(&source_paper(), &other).await;
        assert_eq!(source.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_degraded_results_are_not_stored() {
        let source = StubSource::arc(DiscoverySource::AcademicGraph, Behaviour::Fail);
        let coordinator = coordinator(vec![Arc::clone(&source)])
            .with_store(Arc::new(InMemoryDiscoveryStore::new()));
        let config = DiscoveryConfiguration::default().with_sources([DiscoverySource::AcademicGraph]);

        coordinator.discover_or_reuse(&source_paper(), &config).await;
        coordinator.discover_or_reuse(&source_paper(), &config).await;
        assert_eq!(source.calls.load(Ordering::SeqCst), 2);
    }

    struct StalledModel;

    #[async_trait]
    impl LanguageModel for StalledModel {
        async fn complete(&self, _prompt: &str) -> std::result::Result<String, LlmError> {
            std::future::pending::<()>().await;
            Ok(String::new())
        }

        fn model_id(&self) -> &str {
            "stalled"
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_overall_timeout_bounds_ai_synthesis() {
        let sources: Vec<Arc<dyn RelatedPaperSource>> = vec![StubSource::arc(
            DiscoverySource::AcademicGraph,
            Behaviour::Slow(Duration::from_secs(30), 3),
        )];
        let synthesis = SynthesisEngine::new()
            .with_language_model(Arc::new(StalledModel))
            .with_llm_timeout(Duration::from_secs(300));
        let coordinator = DiscoveryCoordinator::new(sources, synthesis);
        let config = DiscoveryConfiguration::default()
            .with_sources([DiscoverySource::AcademicGraph])
            .with_source_timeout(Duration::from_secs(300))
            .with_overall_timeout(Duration::from_secs(40));

        let started = Instant::now();
        let result = coordinator.coordinate_discovery(&source_paper(), &config).await;

        assert!(started.elapsed() <= Duration::from_secs(41));
        assert_eq!(result.discovered_papers.len(), 3);
        assert_eq!(result.ai_enhanced_papers, 0);
        assert!(!result.requires_user_review);
    }
}
