//! Composite ranking score.
//!
//! ```text
//! composite = relevance          * 0.40
//!           + relationship weight * 0.25
//!           + citation impact     * 0.20
//!           + completeness        * 0.10
//!           + source reliability  * 0.05
//! ```
//! Every term is in `[0, 1]` and the default weights sum to 1.0, so the
//! composite is in `[0, 1]` too.

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};

use crate::layers::{DiscoveredPaper, DiscoverySource, RelationshipType};

/// Citation counts at or above this saturate the impact term.
const CITATION_SATURATION: f64 = 1000.0;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RankingWeights {
    pub relevance: f64,
    pub relationship: f64,
    pub citation_impact: f64,
    pub completeness: f64,
    pub source_reliability: f64,
}

impl Default for RankingWeights {
    fn default() -> Self {
        Self {
            relevance: 0.40,
            relationship: 0.25,
            citation_impact: 0.20,
            completeness: 0.10,
            source_reliability: 0.05,
        }
    }
}

impl RankingWeights {
    fn sum(&self) -> f64 {
        self.relevance + self.relationship + self.citation_impact + self.completeness + self.source_reliability
    }

    /// Non-negative and summing to ~1.0.
    pub fn validate(&self) -> bool {
        let all_non_negative = [
            self.relevance,
            self.relationship,
            self.citation_impact,
            self.completeness,
            self.source_reliability,
        ]
        .iter()
        .all(|w| w.is_finite() && *w >= 0.0);
        all_non_negative && (self.sum() - 1.0).abs() < 1e-6
    }
}

impl RelationshipType {
    /// Fixed importance: direct citation links first, loose field
    /// relatedness last.
    pub fn importance(&self) -> f64 {
        match self {
            RelationshipType::Cites => 1.0,
            RelationshipType::CitedBy => 0.9,
            RelationshipType::SemanticSimilarity => 0.8,
            RelationshipType::Methodological => 0.75,
            RelationshipType::AuthorNetwork => 0.7,
            RelationshipType::Trending => 0.6,
            RelationshipType::KeywordOverlap => 0.55,
            RelationshipType::VenueSimilarity => 0.5,
            RelationshipType::FieldRelated => 0.4,
            RelationshipType::Unknown => 0.2,
        }
    }
}

impl DiscoverySource {
    /// Trust in the provider's metadata, by how rigorously it is verified.
    pub fn reliability(&self) -> f64 {
        match self {
            DiscoverySource::BibliographicIndex => 1.0,
            DiscoverySource::AcademicGraph => 0.9,
            DiscoverySource::RealtimeResearch => 0.7,
        }
    }
}

/// `log(c + 1) / log(1000)`, capped at 1.0; missing data contributes 0.
pub fn citation_impact(citations: Option<u32>) -> f64 {
    match citations {
        Some(c) => ((c as f64 + 1.0).ln() / CITATION_SATURATION.ln()).min(1.0),
        None => 0.0,
    }
}

pub fn composite_score(paper: &DiscoveredPaper, weights: &RankingWeights) -> f64 {
    let score = paper.relevance_score() * weights.relevance
        + paper.relationship.importance() * weights.relationship
        + citation_impact(paper.citation_count) * weights.citation_impact
        + paper.completeness() * weights.completeness
        + paper.source.reliability() * weights.source_reliability;
    score.clamp(0.0, 1.0)
}

/// Descending composite, then relevance, then source reliability; identity
/// key last so equal-scoring papers still order the same way every run.
pub fn compare_ranked(a: &DiscoveredPaper, b: &DiscoveredPaper) -> Ordering {
    let composite = |p: &DiscoveredPaper| p.composite_score.unwrap_or(0.0);
    composite(b)
        .total_cmp(&composite(a))
        .then_with(|| b.relevance_score().total_cmp(&a.relevance_score()))
        .then_with(|| b.source.reliability().total_cmp(&a.source.reliability()))
        .then_with(|| a.identity_key().cmp(&b.identity_key()))
}

/// Score and sort. Does not truncate.
pub fn rank(mut papers: Vec<DiscoveredPaper>, weights: &RankingWeights) -> Vec<DiscoveredPaper> {
    for paper in &mut papers {
        paper.composite_score = Some(composite_score(paper, weights));
    }
    papers.sort_by(compare_ranked);
    papers
}
