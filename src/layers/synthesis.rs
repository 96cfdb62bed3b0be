//! Dedup, optional language-model re-scoring, quality filter, ranking and
//! truncation of the combined candidate list.

use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures_util::stream::{self, StreamExt};
use futures_util::FutureExt;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::{DiscoveryError, LlmError, Result};
use crate::layers::guard::CircuitState;
use crate::layers::llm::{build_batch_prompt, parse_scores, LanguageModel};
use crate::layers::ranking::{rank, RankingWeights};
use crate::layers::resolution::Resolver;
use crate::layers::result::{RelatedPaperDiscoveryResult, SourceStatistics};
use crate::layers::usage::{ApiUsageStats, PricingModel, UsageTracker};
use crate::layers::{DiscoveredPaper, DiscoveryConfiguration, DiscoverySource, SourcePaper};

pub const AI_BATCH_SIZE: usize = 10;
/// Titles shorter than this are treated as junk records.
pub const MIN_TITLE_CHARS: usize = 10;

pub struct SynthesisEngine {
    llm: Option<Arc<dyn LanguageModel>>,
    llm_usage: Option<Arc<UsageTracker>>,
    llm_timeout: Duration,
    max_concurrent_batches: usize,
    ai_score_weight: f64,
    weights: RankingWeights,
}

impl Default for SynthesisEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl SynthesisEngine {
    /// Engine without a language model: dedup, filter and rank only.
    pub fn new() -> Self {
        Self {
            llm: None,
            llm_usage: None,
            llm_timeout: Duration::from_secs(30),
            max_concurrent_batches: 4,
            ai_score_weight: 0.7,
            weights: RankingWeights::default(),
        }
    }

    pub fn with_language_model(mut self, llm: Arc<dyn LanguageModel>) -> Self {
        let pricing = PricingModel::PayPerUse {
            free_requests: 0,
            cost_per_request: 0.002,
        };
        self.llm_usage = Some(Arc::new(UsageTracker::new(
            format!("language-model:{}", llm.model_id()),
            pricing,
        )));
        self.llm = Some(llm);
        self
    }

    pub fn with_llm_timeout(mut self, timeout: Duration) -> Self {
        self.llm_timeout = timeout;
        self
    }

    pub fn with_max_concurrent_batches(mut self, n: usize) -> Self {
        self.max_concurrent_batches = n.max(1);
        self
    }

    /// How far an AI score pulls the existing relevance: 0 ignores it, 1
    /// replaces it.
    pub fn with_ai_score_weight(mut self, weight: f64) -> Self {
        self.ai_score_weight = weight.clamp(0.0, 1.0);
        self
    }

    pub fn usage(&self) -> Option<ApiUsageStats> {
        self.llm_usage.as_ref().map(|u| u.snapshot(CircuitState::Closed))
    }

    pub fn reset_usage(&self) {
        if let Some(usage) = &self.llm_usage {
            usage.reset();
        }
    }

    /// Never fails: any error or panic inside the pipeline becomes an empty,
    /// review-flagged result carrying the message.
    pub async fn synthesize_results(
        &self,
        source: &SourcePaper,
        raw: Vec<DiscoveredPaper>,
        config: &DiscoveryConfiguration,
        source_statistics: BTreeMap<DiscoverySource, SourceStatistics>,
        started_at: DateTime<Utc>,
    ) -> RelatedPaperDiscoveryResult {
        self.synthesize(source, raw, config, source_statistics, started_at, None)
            .await
    }

    /// Like [`Self::synthesize_results`], but AI scoring still running at
    /// `deadline` is abandoned and every candidate keeps its pre-AI score.
    pub async fn synthesize_results_before(
        &self,
        source: &SourcePaper,
        raw: Vec<DiscoveredPaper>,
        config: &DiscoveryConfiguration,
        source_statistics: BTreeMap<DiscoverySource, SourceStatistics>,
        started_at: DateTime<Utc>,
        deadline: Instant,
    ) -> RelatedPaperDiscoveryResult {
        self.synthesize(source, raw, config, source_statistics, started_at, Some(deadline))
            .await
    }

    async fn synthesize(
        &self,
        source: &SourcePaper,
        raw: Vec<DiscoveredPaper>,
        config: &DiscoveryConfiguration,
        source_statistics: BTreeMap<DiscoverySource, SourceStatistics>,
        started_at: DateTime<Utc>,
        deadline: Option<Instant>,
    ) -> RelatedPaperDiscoveryResult {
        let outcome = AssertUnwindSafe(self.run(source, raw, config, source_statistics.clone(), started_at, deadline))
            .catch_unwind()
            .await;

        let error = match outcome {
            Ok(Ok(result)) => return result,
            Ok(Err(e)) => e,
            Err(panic) => DiscoveryError::from_panic(panic),
        };
        warn!(paper = %source.id, error = %error, "Synthesis failed, returning partial result");
        RelatedPaperDiscoveryResult::partial(&source.id, source_statistics, error.to_string(), started_at)
    }

    async fn run(
        &self,
        source: &SourcePaper,
        raw: Vec<DiscoveredPaper>,
        config: &DiscoveryConfiguration,
        source_statistics: BTreeMap<DiscoverySource, SourceStatistics>,
        started_at: DateTime<Utc>,
        deadline: Option<Instant>,
    ) -> Result<RelatedPaperDiscoveryResult> {
        if !config.min_relevance.is_finite() || !(0.0..=1.0).contains(&config.min_relevance) {
            return Err(DiscoveryError::Config(format!(
                "minimum relevance must be within [0, 1], got {}",
                config.min_relevance
            )));
        }
        if !self.weights.validate() {
            return Err(DiscoveryError::Synthesis(
                "ranking weights must be non-negative and sum to 1.0".to_string(),
            ));
        }

        let raw_count = raw.len();
        let candidates: Vec<DiscoveredPaper> = raw
            .into_iter()
            .filter(|p| !Resolver::is_source_paper(source, p))
            .collect();
        let unique = deduplicate(candidates);
        debug!(raw = raw_count, unique = unique.len(), "Deduplicated candidates");

        let (enhanced, ai_enhanced_papers) = self.enhance_relevance(source, unique, deadline).await;
        let filtered = quality_filter(enhanced, config.min_relevance);
        let mut ranked = rank(filtered, &self.weights);
        ranked.truncate(config.effective_max_papers());

        info!(
            paper = %source.id,
            raw = raw_count,
            kept = ranked.len(),
            ai_enhanced = ai_enhanced_papers,
            "Synthesis complete"
        );
        let mut result = RelatedPaperDiscoveryResult::completed(&source.id, ranked, source_statistics, started_at);
        result.ai_enhanced_papers = ai_enhanced_papers;
        Ok(result)
    }

    /// Best-effort: a batch that times out, errors or replies with nothing
    /// parseable keeps its pre-AI scores. Past `deadline` nothing is applied.
    async fn enhance_relevance(
        &self,
        source: &SourcePaper,
        papers: Vec<DiscoveredPaper>,
        deadline: Option<Instant>,
    ) -> (Vec<DiscoveredPaper>, usize) {
        let Some(llm) = self.llm.as_ref() else {
            return (papers, 0);
        };
        if papers.is_empty() {
            return (papers, 0);
        }

        let batches: Vec<Vec<DiscoveredPaper>> = papers.chunks(AI_BATCH_SIZE).map(|c| c.to_vec()).collect();
        let scoring = stream::iter(
            batches
                .iter()
                .enumerate()
                .map(|(i, batch)| self.score_batch(llm.as_ref(), source, i, batch)),
        )
        .buffered(self.max_concurrent_batches)
        .collect::<Vec<HashMap<usize, f64>>>();
        let scored = match deadline {
            Some(deadline) => match tokio::time::timeout_at(deadline, scoring).await {
                Ok(scored) => scored,
                Err(_) => {
                    warn!(batches = batches.len(), "Overall timeout reached during AI scoring, keeping pre-AI scores");
                    return (papers, 0);
                }
            },
            None => scoring.await,
        };

        let mut adjusted = 0;
        let mut out = Vec::with_capacity(papers.len());
        for (batch, scores) in batches.into_iter().zip(scored) {
            for (idx, mut paper) in batch.into_iter().enumerate() {
                if let Some(ai_score) = scores.get(&idx) {
                    let blended = paper.relevance_score() * (1.0 - self.ai_score_weight) + ai_score * self.ai_score_weight;
                    paper.set_relevance_score(blended);
                    adjusted += 1;
                }
                out.push(paper);
            }
        }
        (out, adjusted)
    }

    async fn score_batch(
        &self,
        llm: &dyn LanguageModel,
        source: &SourcePaper,
        batch_index: usize,
        batch: &[DiscoveredPaper],
    ) -> HashMap<usize, f64> {
        let prompt = build_batch_prompt(source, batch);
        let started = Instant::now();
        let outcome = match tokio::time::timeout(self.llm_timeout, llm.complete(&prompt)).await {
            Ok(reply) => reply,
            Err(_) => Err(LlmError::Timeout(self.llm_timeout)),
        };

        match outcome {
            Ok(reply) => {
                if let Some(usage) = &self.llm_usage {
                    usage.record_success(started.elapsed());
                }
                let scores = parse_scores(&reply, batch.len());
                if scores.len() < batch.len() {
                    debug!(
                        batch = batch_index,
                        parsed = scores.len(),
                        expected = batch.len(),
                        "Some scores missing from model reply"
                    );
                }
                scores
            }
            Err(e) => {
                if let Some(usage) = &self.llm_usage {
                    usage.record_failure(started.elapsed());
                }
                warn!(batch = batch_index, error = %e, "AI scoring batch failed");
                HashMap::new()
            }
        }
    }
}

/// Total preference order among records with the same identity key; `Less`
/// means `a` wins. Relevance first, then completeness and source trust,
/// then plain field order so no two distinct records compare equal.
fn preference(a: &DiscoveredPaper, b: &DiscoveredPaper) -> Ordering {
    b.relevance_score()
        .total_cmp(&a.relevance_score())
        .then_with(|| b.completeness().total_cmp(&a.completeness()))
        .then_with(|| b.source.reliability().total_cmp(&a.source.reliability()))
        .then_with(|| a.title.cmp(&b.title))
        .then_with(|| a.doi.cmp(&b.doi))
        .then_with(|| a.external_id.cmp(&b.external_id))
        .then_with(|| a.url.cmp(&b.url))
        .then_with(|| a.authors.cmp(&b.authors))
        .then_with(|| a.venue.cmp(&b.venue))
        .then_with(|| a.year.cmp(&b.year))
        .then_with(|| a.abstract_text.cmp(&b.abstract_text))
        .then_with(|| a.citation_count.cmp(&b.citation_count))
        .then_with(|| a.relationship.cmp(&b.relationship))
        .then_with(|| a.source.cmp(&b.source))
        .then_with(|| a.corroborating_sources.cmp(&b.corroborating_sources))
}

fn merge_group(mut group: Vec<DiscoveredPaper>) -> Option<DiscoveredPaper> {
    group.sort_by(preference);
    let mut records = group.into_iter();
    let mut winner = records.next()?;

    for other in records {
        if winner.authors.is_empty() {
            winner.authors = other.authors.clone();
        }
        winner.doi = winner.doi.take().or(other.doi);
        winner.external_id = winner.external_id.take().or(other.external_id);
        winner.abstract_text = winner.abstract_text.take().or(other.abstract_text);
        winner.venue = winner.venue.take().or(other.venue);
        winner.year = winner.year.or(other.year);
        winner.url = winner.url.take().or(other.url);
        winner.citation_count = match (winner.citation_count, other.citation_count) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (a, b) => a.or(b),
        };
        if other.relationship.importance() > winner.relationship.importance() {
            winner.relationship = other.relationship;
        }
        winner.corroborating_sources.extend(other.corroborating_sources);
    }
    Some(winner)
}

/// Collapse records sharing an identity key. The outcome depends only on
/// the multiset of inputs, never on their order; output is sorted by key.
pub fn deduplicate(papers: Vec<DiscoveredPaper>) -> Vec<DiscoveredPaper> {
    let mut groups: BTreeMap<String, Vec<DiscoveredPaper>> = BTreeMap::new();
    for paper in papers {
        groups.entry(paper.identity_key()).or_default().push(paper);
    }
    groups.into_values().filter_map(merge_group).collect()
}

/// Drop junk titles and anything under the relevance threshold.
pub fn quality_filter(papers: Vec<DiscoveredPaper>, min_relevance: f64) -> Vec<DiscoveredPaper> {
    papers
        .into_iter()
        .filter(|p| p.title.trim().chars().count() >= MIN_TITLE_CHARS)
        .filter(|p| p.relevance_score() >= min_relevance)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layers::RelationshipType;
    use async_trait::async_trait;
    use proptest::prelude::*;
    use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};

    fn paper(title: &str, source: DiscoverySource, relevance: f64) -> DiscoveredPaper {
        DiscoveredPaper::new(title, source, RelationshipType::SemanticSimilarity, relevance)
    }

    fn source_paper() -> SourcePaper {
        SourcePaper::new("src-1", "Attention is all you need").with_doi("10.9/source")
    }

    /// Replies with a fixed score for every candidate, except that batches
    /// containing `fail_marker` error out.
    struct ScriptedModel {
        score: f64,
        fail_marker: Option<&'static str>,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl LanguageModel for ScriptedModel {
        async fn complete(&self, prompt: &str) -> std::result::Result<String, LlmError> {
            self.calls.fetch_add(1, AtomicOrdering::SeqCst);
            if let Some(marker) = self.fail_marker {
                if prompt.contains(marker) {
                    return Err(LlmError::Unavailable("scripted failure".into()));
                }
            }
            let n = prompt.matches("\nPaper ").count();
            Ok((1..=n)
                .map(|i| format!("Paper {}: score {:.2}", i, self.score))
                .collect::<Vec<_>>()
                .join("\n"))
        }

        fn model_id(&self) -> &str {
            "scripted"
        }
    }

    struct HangingModel;

    #[async_trait]
    impl LanguageModel for HangingModel {
        async fn complete(&self, _prompt: &str) -> std::result::Result<String, LlmError> {
            std::future::pending::<()>().await;
            Ok(String::new())
        }

        fn model_id(&self) -> &str {
            "hanging"
        }
    }

    #[test]
    fn test_dedup_by_doi_keeps_higher_score() {
        let a = paper("First title variant", DiscoverySource::BibliographicIndex, 0.6).with_doi("10.1/abc");
        let b = paper("Second title variant", DiscoverySource::AcademicGraph, 0.9).with_doi("10.1/abc");
        let out = deduplicate(vec![a, b]);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].relevance_score(), 0.9);
        assert_eq!(out[0].title, "Second title variant");
        assert_eq!(out[0].corroborating_sources.len(), 2);
    }

    #[test]
    fn test_merge_fills_gaps_and_keeps_strongest_relationship() {
        let winner = DiscoveredPaper::new(
            "Shared record title",
            DiscoverySource::RealtimeResearch,
            RelationshipType::Trending,
            0.9,
        )
        .with_doi("10.1/x");
        let loser = DiscoveredPaper::new(
            "Shared record title",
            DiscoverySource::AcademicGraph,
            RelationshipType::Cites,
            0.4,
        )
        .with_doi("10.1/X")
        .with_venue("ACL")
        .with_citation_count(42);

        let out = deduplicate(vec![winner, loser]);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].source, DiscoverySource::RealtimeResearch);
        assert_eq!(out[0].relationship, RelationshipType::Cites);
        assert_eq!(out[0].venue.as_deref(), Some("ACL"));
        assert_eq!(out[0].citation_count, Some(42));
        assert_eq!(out[0].relevance_score(), 0.9);
    }

    fn arb_paper() -> impl Strategy<Value = DiscoveredPaper> {
        (
            0usize..4,
            0usize..3,
            0usize..3,
            0u8..=10,
            proptest::option::of(0u32..500),
        )
            .prop_map(|(title, doi, source, score, citations)| {
                let mut p = DiscoveredPaper::new(
                    format!("Candidate paper title {}", title),
                    DiscoverySource::ALL[source],
                    RelationshipType::KeywordOverlap,
                    score as f64 / 10.0,
                );
                if doi > 0 {
                    p.doi = Some(format!("10.1/{}", doi));
                }
                p.citation_count = citations;
                p
            })
    }

    proptest! {
        #[test]
        fn dedup_is_order_independent(
            (papers, shuffled) in proptest::collection::vec(arb_paper(), 0..12)
                .prop_flat_map(|v| (Just(v.clone()), Just(v).prop_shuffle()))
        ) {
            prop_assert_eq!(deduplicate(papers), deduplicate(shuffled));
        }

        #[test]
        fn dedup_keys_are_unique_and_scores_bounded(papers in proptest::collection::vec(arb_paper(), 0..12)) {
            let out = deduplicate(papers);
            let keys: std::collections::BTreeSet<String> = out.iter().map(|p| p.identity_key()).collect();
            prop_assert_eq!(keys.len(), out.len());
            for p in &out {
                prop_assert!((0.0..=1.0).contains(&p.relevance_score()));
            }
        }
    }

    #[test]
    fn test_quality_filter() {
        let papers = vec![
            paper("Too short", DiscoverySource::AcademicGraph, 0.9),
            paper("Long enough title", DiscoverySource::AcademicGraph, 0.2),
            paper("Long enough title two", DiscoverySource::AcademicGraph, 0.5),
        ];
        let kept = quality_filter(papers, 0.3);
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].title, "Long enough title two");
    }

    #[tokio::test]
    async fn test_pipeline_without_model() {
        let engine = SynthesisEngine::new();
        let raw = vec![
            paper("Attention is all you need", DiscoverySource::AcademicGraph, 1.0).with_doi("10.9/source"),
            paper("Transformers in vision tasks", DiscoverySource::AcademicGraph, 0.8).with_doi("10.1/a"),
            paper("Transformers in vision tasks", DiscoverySource::BibliographicIndex, 0.7).with_doi("10.1/a"),
            paper("Recurrent networks revisited", DiscoverySource::RealtimeResearch, 0.1),
            paper("Sequence models with memory", DiscoverySource::RealtimeResearch, 0.6),
        ];
        let config = DiscoveryConfiguration::default().with_min_relevance(0.3);

        let result = engine
            .synthesize_results(&source_paper(), raw, &config, BTreeMap::new(), Utc::now())
            .await;
        assert!(!result.requires_user_review);
        assert!(result.errors.is_empty());
        assert_eq!(result.discovered_papers.len(), 2);
        assert!(result.discovered_papers.iter().all(|p| p.relevance_score() >= 0.3));
        assert!(result.discovered_papers.iter().all(|p| p.composite_score.unwrap() <= 1.0));
        assert!((result.confidence_score - 0.7).abs() < 1e-9);
        assert_eq!(result.ai_enhanced_papers, 0);
    }

    #[tokio::test]
    async fn test_cap_applied() {
        let engine = SynthesisEngine::new();
        let raw: Vec<DiscoveredPaper> = (0..40)
            .map(|i| paper(&format!("Distinct candidate number {}", i), DiscoverySource::AcademicGraph, 0.9))
            .collect();
        let config = DiscoveryConfiguration::default().with_max_total_papers(7);
        let result = engine
            .synthesize_results(&source_paper(), raw, &config, BTreeMap::new(), Utc::now())
            .await;
        assert_eq!(result.discovered_papers.len(), 7);
    }

    #[tokio::test]
    async fn test_ai_scores_applied_in_batches() {
        let model = Arc::new(ScriptedModel {
            score: 1.0,
            fail_marker: None,
            calls: AtomicUsize::new(0),
        });
        let engine = SynthesisEngine::new()
            .with_language_model(model.clone())
            .with_ai_score_weight(1.0);
        let raw: Vec<DiscoveredPaper> = (0..25)
            .map(|i| paper(&format!("Distinct candidate number {}", i), DiscoverySource::AcademicGraph, 0.4))
            .collect();
        let config = DiscoveryConfiguration::default().with_min_relevance(0.0);

        let result = engine
            .synthesize_results(&source_paper(), raw, &config, BTreeMap::new(), Utc::now())
            .await;
        assert_eq!(model.calls.load(AtomicOrdering::SeqCst), 3);
        assert_eq!(result.ai_enhanced_papers, 25);
        assert!(result.discovered_papers.iter().all(|p| p.relevance_score() == 1.0));
        assert_eq!(engine.usage().unwrap().successful_requests, 3);
    }

    #[tokio::test]
    async fn test_failed_batch_keeps_pre_ai_scores() {
        let model = Arc::new(ScriptedModel {
            score: 0.9,
            fail_marker: Some("Distinct candidate number 15"),
            calls: AtomicUsize::new(0),
        });
        let engine = SynthesisEngine::new()
            .with_language_model(model)
            .with_ai_score_weight(1.0);
        let raw: Vec<DiscoveredPaper> = (10..30)
            .map(|i| paper(&format!("Distinct candidate number {}", i), DiscoverySource::AcademicGraph, 0.5))
            .collect();
        let config = DiscoveryConfiguration::default().with_min_relevance(0.0);

        let result = engine
            .synthesize_results(&source_paper(), raw, &config, BTreeMap::new(), Utc::now())
            .await;
        assert_eq!(result.discovered_papers.len(), 20);
        assert_eq!(result.ai_enhanced_papers, 10);
        let unchanged = result
            .discovered_papers
            .iter()
            .filter(|p| p.relevance_score() == 0.5)
            .count();
        assert_eq!(unchanged, 10);
        assert!(!result.requires_user_review);
    }

    #[tokio::test(start_paused = true)]
    async fn test_hanging_model_degrades_to_pre_ai_scores() {
        let engine = SynthesisEngine::new()
            .with_language_model(Arc::new(HangingModel))
            .with_llm_timeout(Duration::from_secs(5));
        let raw = vec![paper("A perfectly fine title", DiscoverySource::AcademicGraph, 0.6)];
        let result = engine
            .synthesize_results(&source_paper(), raw, &DiscoveryConfiguration::default(), BTreeMap::new(), Utc::now())
            .await;
        assert_eq!(result.discovered_papers.len(), 1);
        assert_eq!(result.discovered_papers[0].relevance_score(), 0.6);
        assert_eq!(engine.usage().unwrap().failed_requests, 1);
    }

    #[tokio::test]
    async fn test_invalid_config_becomes_partial_result() {
        let engine = SynthesisEngine::new();
        let raw = vec![paper("A perfectly fine title", DiscoverySource::AcademicGraph, 0.6)];
        let config = DiscoveryConfiguration::default().with_min_relevance(f64::NAN);
        let result = engine
            .synthesize_results(&source_paper(), raw, &config, BTreeMap::new(), Utc::now())
            .await;
        assert!(result.discovered_papers.is_empty());
        assert!(result.requires_user_review);
        assert_eq!(result.errors.len(), 1);
        assert!(result.errors[0].contains("minimum relevance"));
    }

    #[tokio::test]
    async fn test_ranking_identical_across_runs() {
        let engine = SynthesisEngine::new();
        let raw: Vec<DiscoveredPaper> = (0..15)
            .map(|i| {
                paper(
                    &format!("Repeatable candidate {}", i % 9),
                    DiscoverySource::ALL[i % 3],
                    0.3 + (i % 5) as f64 / 10.0,
                )
            })
            .collect();
        let mut reversed = raw.clone();
        reversed.reverse();
        let config = DiscoveryConfiguration::default();
        let first = engine
            .synthesize_results(&source_paper(), raw, &config, BTreeMap::new(), Utc::now())
            .await;
        let second = engine
            .synthesize_results(&source_paper(), reversed, &config, BTreeMap::new(), Utc::now())
            .await;
        assert_eq!(first.discovered_papers, second.discovered_papers);
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_cuts_ai_scoring_short() {
        let engine = SynthesisEngine::new()
            .with_language_model(Arc::new(HangingModel))
            .with_llm_timeout(Duration::from_secs(30));
        let raw: Vec<DiscoveredPaper> = (0..25)
            .map(|i| paper(&format!("Distinct candidate number {}", i), DiscoverySource::AcademicGraph, 0.6))
            .collect();
        let started = Instant::now();
        let result = engine
            .synthesize_results_before(
                &source_paper(),
                raw,
                &DiscoveryConfiguration::default(),
                BTreeMap::new(),
                Utc::now(),
                started + Duration::from_secs(5),
            )
            .await;

        assert!(started.elapsed() <= Duration::from_secs(6));
        assert_eq!(result.discovered_papers.len(), 25);
        assert_eq!(result.ai_enhanced_papers, 0);
        assert!(result.discovered_papers.iter().all(|p| p.relevance_score() == 0.6));
        assert!(!result.requires_user_review);
    }

    #[tokio::test(start_paused = true)]
    async fn test_batch_timeout_is_reported_as_llm_timeout() {
        let engine = SynthesisEngine::new()
            .with_language_model(Arc::new(HangingModel))
            .with_llm_timeout(Duration::from_secs(2));
        let batch = vec![paper("A perfectly fine title", DiscoverySource::AcademicGraph, 0.6)];
        let scores = engine.score_batch(&HangingModel, &source_paper(), 0, &batch).await;
        assert!(scores.is_empty());
        assert_eq!(engine.usage().unwrap().failed_requests, 1);
        assert_eq!(
            LlmError::Timeout(Duration::from_secs(2)).to_string(),
            "Completion timed out after 2s"
        );
    }
}
