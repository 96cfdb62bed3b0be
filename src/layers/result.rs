use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::layers::{DiscoveredPaper, DiscoverySource, RelationshipType};

/// How a single source's part of the fan-out ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", content = "detail", rename_all = "kebab-case")]
pub enum SourceStatus {
    Succeeded,
    Failed(String),
    TimedOut,
    CircuitOpen,
    RateLimited,
    /// Still running when the overall timeout elapsed.
    Abandoned,
}

impl SourceStatus {
    pub fn is_success(&self) -> bool {
        matches!(self, SourceStatus::Succeeded)
    }

    pub fn describe(&self, source: DiscoverySource) -> String {
        match self {
            SourceStatus::Succeeded => format!("{}: succeeded", source),
            SourceStatus::Failed(msg) => format!("{}: failed: {}", source, msg),
            SourceStatus::TimedOut => format!("{}: timed out", source),
            SourceStatus::CircuitOpen => format!("{}: circuit open, skipped", source),
            SourceStatus::RateLimited => format!("{}: rate limit exceeded, skipped", source),
            SourceStatus::Abandoned => format!("{}: abandoned at overall timeout", source),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceStatistics {
    pub raw_count: usize,
    pub final_count: usize,
    pub status: SourceStatus,
    pub elapsed_ms: u64,
}

impl SourceStatistics {
    pub fn new(raw_count: usize, status: SourceStatus, elapsed: Duration) -> Self {
        Self {
            raw_count,
            final_count: 0,
            status,
            elapsed_ms: u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX),
        }
    }
}

/// The bounded, ranked output of one discovery invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelatedPaperDiscoveryResult {
    pub source_paper_id: String,
    pub discovered_papers: Vec<DiscoveredPaper>,
    pub source_statistics: BTreeMap<DiscoverySource, SourceStatistics>,
    pub relationship_statistics: BTreeMap<RelationshipType, usize>,
    /// Mean relevance of the included papers, 0.0 when empty.
    pub confidence_score: f64,
    /// Papers whose relevance was adjusted by the language model.
    pub ai_enhanced_papers: usize,
    pub warnings: Vec<String>,
    pub errors: Vec<String>,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub processing_time_ms: u64,
    /// Set on partial or degraded completion.
    pub requires_user_review: bool,
}

impl RelatedPaperDiscoveryResult {
    /// A successful result over an already ranked and capped paper list.
    pub fn completed(
        source_paper_id: impl Into<String>,
        discovered_papers: Vec<DiscoveredPaper>,
        mut source_statistics: BTreeMap<DiscoverySource, SourceStatistics>,
        started_at: DateTime<Utc>,
    ) -> Self {
        for stats in source_statistics.values_mut() {
            stats.final_count = 0;
        }
        let mut relationship_statistics = BTreeMap::new();
        for paper in &discovered_papers {
            source_statistics
                .entry(paper.source)
                .or_insert_with(|| SourceStatistics::new(0, SourceStatus::Succeeded, Duration::ZERO))
                .final_count += 1;
            *relationship_statistics.entry(paper.relationship).or_insert(0) += 1;
        }

        let completed_at = Utc::now();
        Self {
            source_paper_id: source_paper_id.into(),
            confidence_score: mean_relevance(&discovered_papers),
            discovered_papers,
            source_statistics,
            relationship_statistics,
            ai_enhanced_papers: 0,
            warnings: Vec::new(),
            errors: Vec::new(),
            started_at,
            completed_at,
            processing_time_ms: elapsed_ms(started_at, completed_at),
            requires_user_review: false,
        }
    }

    /// Degraded result: no papers, the failure recorded, review required.
    pub fn partial(
        source_paper_id: impl Into<String>,
        source_statistics: BTreeMap<DiscoverySource, SourceStatistics>,
        error: impl Into<String>,
        started_at: DateTime<Utc>,
    ) -> Self {
        let mut result = Self::completed(source_paper_id, Vec::new(), source_statistics, started_at);
        result.errors.push(error.into());
        result.requires_user_review = true;
        result
    }

    pub fn with_warnings(mut self, warnings: Vec<String>) -> Self {
        let mut all = warnings;
        all.append(&mut self.warnings);
        self.warnings = all;
        self
    }

    pub fn is_degraded(&self) -> bool {
        self.requires_user_review || !self.errors.is_empty()
    }
}

fn mean_relevance(papers: &[DiscoveredPaper]) -> f64 {
    if papers.is_empty() {
        return 0.0;
    }
    papers.iter().map(|p| p.relevance_score()).sum::<f64>() / papers.len() as f64
}

fn elapsed_ms(start: DateTime<Utc>, end: DateTime<Utc>) -> u64 {
    u64::try_from((end - start).num_milliseconds()).unwrap_or(0)
}
