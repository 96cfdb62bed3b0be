use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

pub mod coordinator;
pub mod discovery;
pub mod guard;
pub mod llm;
pub mod ranking;
pub mod resolution;
pub mod result;
pub mod store;
pub mod synthesis;
pub mod usage;

/// Per-source timeouts never drop below this floor.
pub const MIN_SOURCE_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_MAX_TOTAL_PAPERS: usize = 100;

/// The external provider a candidate came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DiscoverySource {
    /// OpenAlex works index.
    BibliographicIndex,
    /// Semantic Scholar citation graph.
    AcademicGraph,
    /// arXiv preprint feed.
    RealtimeResearch,
}

impl DiscoverySource {
    pub const ALL: [DiscoverySource; 3] = [
        DiscoverySource::BibliographicIndex,
        DiscoverySource::AcademicGraph,
        DiscoverySource::RealtimeResearch,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            DiscoverySource::BibliographicIndex => "bibliographic-index",
            DiscoverySource::AcademicGraph => "academic-graph",
            DiscoverySource::RealtimeResearch => "realtime-research",
        }
    }
}

impl fmt::Display for DiscoverySource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DiscoverySource {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "bibliographic-index" | "openalex" => Ok(DiscoverySource::BibliographicIndex),
            "academic-graph" | "semantic-scholar" | "semanticscholar" => Ok(DiscoverySource::AcademicGraph),
            "realtime-research" | "arxiv" => Ok(DiscoverySource::RealtimeResearch),
            other => Err(format!("unknown discovery source '{}'", other)),
        }
    }
}

/// Why a discovered paper is considered related to the source paper.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RelationshipType {
    /// The source paper cites this paper.
    Cites,
    /// This paper cites the source paper.
    CitedBy,
    SemanticSimilarity,
    AuthorNetwork,
    Trending,
    Methodological,
    FieldRelated,
    VenueSimilarity,
    KeywordOverlap,
    Unknown,
}

impl RelationshipType {
    pub fn as_str(&self) -> &'static str {
        match self {
            RelationshipType::Cites => "cites",
            RelationshipType::CitedBy => "cited-by",
            RelationshipType::SemanticSimilarity => "semantic-similarity",
            RelationshipType::AuthorNetwork => "author-network",
            RelationshipType::Trending => "trending",
            RelationshipType::Methodological => "methodological",
            RelationshipType::FieldRelated => "field-related",
            RelationshipType::VenueSimilarity => "venue-similarity",
            RelationshipType::KeywordOverlap => "keyword-overlap",
            RelationshipType::Unknown => "unknown",
        }
    }
}

impl fmt::Display for RelationshipType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The persisted paper we are discovering related work for.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SourcePaper {
    pub id: String,
    pub title: String,
    pub doi: Option<String>,
    pub authors: Vec<String>,
    pub abstract_text: Option<String>,
    pub venue: Option<String>,
    pub year: Option<i32>,
}

impl SourcePaper {
    pub fn new(id: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            ..Default::default()
        }
    }

    pub fn with_doi(mut self, doi: impl Into<String>) -> Self {
        self.doi = Some(doi.into());
        self
    }

    pub fn with_authors(mut self, authors: Vec<String>) -> Self {
        self.authors = authors;
        self
    }

    pub fn with_abstract(mut self, abstract_text: impl Into<String>) -> Self {
        self.abstract_text = Some(abstract_text.into());
        self
    }

    pub fn with_venue(mut self, venue: impl Into<String>) -> Self {
        self.venue = Some(venue.into());
        self
    }

    /// Title plus abstract, the text every provider matches against.
    pub fn search_text(&self) -> String {
        match &self.abstract_text {
            Some(abs) => format!("{} {}", self.title, abs),
            None => self.title.clone(),
        }
    }
}

/// One candidate related paper.
///
/// Created by a source client, mutated only during synthesis (relevance
/// enrichment, duplicate merge, ranking), read-only once it is part of a
/// [`result::RelatedPaperDiscoveryResult`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiscoveredPaper {
    pub title: String,
    pub authors: Vec<String>,
    pub abstract_text: Option<String>,
    pub doi: Option<String>,
    /// Provider-native identifier (OpenAlex work id, S2 paper id, arXiv id).
    pub external_id: Option<String>,
    pub venue: Option<String>,
    pub year: Option<i32>,
    pub url: Option<String>,
    pub citation_count: Option<u32>,
    pub source: DiscoverySource,
    pub relationship: RelationshipType,
    relevance_score: f64,
    /// Every source that returned this record, including `source`.
    pub corroborating_sources: BTreeSet<DiscoverySource>,
    /// Set by the ranking stage.
    pub composite_score: Option<f64>,
}

impl DiscoveredPaper {
    pub fn new(
        title: impl Into<String>,
        source: DiscoverySource,
        relationship: RelationshipType,
        relevance_score: f64,
    ) -> Self {
        Self {
            title: title.into(),
            authors: Vec::new(),
            abstract_text: None,
            doi: None,
            external_id: None,
            venue: None,
            year: None,
            url: None,
            citation_count: None,
            source,
            relationship,
            relevance_score: clamp_unit(relevance_score),
            corroborating_sources: BTreeSet::from([source]),
            composite_score: None,
        }
    }

    pub fn with_authors(mut self, authors: Vec<String>) -> Self {
        self.authors = authors;
        self
    }

    pub fn with_doi(mut self, doi: impl Into<String>) -> Self {
        self.doi = Some(doi.into());
        self
    }

    pub fn with_external_id(mut self, id: impl Into<String>) -> Self {
        self.external_id = Some(id.into());
        self
    }

    pub fn with_abstract(mut self, abstract_text: impl Into<String>) -> Self {
        self.abstract_text = Some(abstract_text.into());
        self
    }

    pub fn with_venue(mut self, venue: impl Into<String>) -> Self {
        self.venue = Some(venue.into());
        self
    }

    pub fn with_year(mut self, year: i32) -> Self {
        self.year = Some(year);
        self
    }

    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }

    pub fn with_citation_count(mut self, count: u32) -> Self {
        self.citation_count = Some(count);
        self
    }

    pub fn relevance_score(&self) -> f64 {
        self.relevance_score
    }

    /// Always lands in `[0.0, 1.0]`; non-finite input becomes 0.0.
    pub fn set_relevance_score(&mut self, score: f64) {
        self.relevance_score = clamp_unit(score);
    }

    /// Deterministic deduplication key, see [`resolution::identity_key`].
    pub fn identity_key(&self) -> String {
        resolution::identity_key(self)
    }

    /// Fraction of the seven expected metadata fields that are populated:
    /// title, authors, identifier, venue, year, abstract, URL.
    pub fn completeness(&self) -> f64 {
        let populated = [
            !self.title.trim().is_empty(),
            !self.authors.is_empty(),
            self.doi.is_some() || self.external_id.is_some(),
            self.venue.as_deref().is_some_and(|v| !v.trim().is_empty()),
            self.year.is_some(),
            self.abstract_text.as_deref().is_some_and(|a| !a.trim().is_empty()),
            self.url.is_some(),
        ];
        populated.iter().filter(|p| **p).count() as f64 / populated.len() as f64
    }
}

pub(crate) fn clamp_unit(value: f64) -> f64 {
    if value.is_finite() {
        value.clamp(0.0, 1.0)
    } else {
        0.0
    }
}

/// Immutable per-request discovery policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiscoveryConfiguration {
    pub enabled_sources: BTreeSet<DiscoverySource>,
    /// Explicit per-source timeout. When unset the overall timeout is split
    /// across the enabled sources, never going below [`MIN_SOURCE_TIMEOUT`].
    pub source_timeout: Option<Duration>,
    pub overall_timeout: Duration,
    pub enable_ai_synthesis: bool,
    pub min_relevance: f64,
    pub max_total_papers: usize,
    pub max_results_per_source: usize,
}

impl Default for DiscoveryConfiguration {
    fn default() -> Self {
        Self {
            enabled_sources: DiscoverySource::ALL.into_iter().collect(),
            source_timeout: None,
            overall_timeout: Duration::from_secs(120),
            enable_ai_synthesis: true,
            min_relevance: 0.3,
            max_total_papers: DEFAULT_MAX_TOTAL_PAPERS,
            max_results_per_source: 25,
        }
    }
}

impl DiscoveryConfiguration {
    pub fn with_sources(mut self, sources: impl IntoIterator<Item = DiscoverySource>) -> Self {
        self.enabled_sources = sources.into_iter().collect();
        self
    }

    pub fn with_source_timeout(mut self, timeout: Duration) -> Self {
        self.source_timeout = Some(timeout);
        self
    }

    pub fn with_overall_timeout(mut self, timeout: Duration) -> Self {
        self.overall_timeout = timeout;
        self
    }

    pub fn with_ai_synthesis(mut self, enabled: bool) -> Self {
        self.enable_ai_synthesis = enabled;
        self
    }

    pub fn with_min_relevance(mut self, min_relevance: f64) -> Self {
        self.min_relevance = min_relevance;
        self
    }

    pub fn with_max_total_papers(mut self, max: usize) -> Self {
        self.max_total_papers = max;
        self
    }

    pub fn with_max_results_per_source(mut self, max: usize) -> Self {
        self.max_results_per_source = max;
        self
    }

    pub fn is_enabled(&self, source: DiscoverySource) -> bool {
        self.enabled_sources.contains(&source)
    }

    /// Result cap; zero means "unset".
    pub fn effective_max_papers(&self) -> usize {
        if self.max_total_papers == 0 {
            DEFAULT_MAX_TOTAL_PAPERS
        } else {
            self.max_total_papers
        }
    }

    pub fn per_source_timeout(&self, enabled_count: usize) -> Duration {
        if let Some(explicit) = self.source_timeout {
            return explicit;
        }
        let share = self.overall_timeout / enabled_count.max(1) as u32;
        share.max(MIN_SOURCE_TIMEOUT)
    }

    /// Stable string identifying everything that changes discovery output.
    pub fn fingerprint(&self) -> String {
        let sources: Vec<&str> = self.enabled_sources.iter().map(|s| s.as_str()).collect();
        format!(
            "{}|ai={}|min={:.4}|max={}|per={}",
            sources.join(","),
            self.enable_ai_synthesis,
            self.min_relevance,
            self.effective_max_papers(),
            self.max_results_per_source,
        )
    }
}
