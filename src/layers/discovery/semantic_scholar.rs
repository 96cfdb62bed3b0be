//! Academic graph client backed by the Semantic Scholar Graph API.
//!
//! With a DOI the source paper's own references and citations are pulled in
//! one call; without one we fall back to title search.

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use tracing::{info, instrument};

use super::{check_status, http_client, SourceClient};
use crate::error::SourceError;
use crate::layers::resolution::{
    keyword_overlap, keywords, normalize_doi, shared_method_terms, shares_author,
};
use crate::layers::{DiscoveredPaper, DiscoveryConfiguration, DiscoverySource, RelationshipType, SourcePaper};

const SS_API_BASE: &str = "https://api.semanticscholar.org/graph/v1";
const SOURCE: DiscoverySource = DiscoverySource::AcademicGraph;
const PAPER_FIELDS: &str = "paperId,title,year,venue,abstract,authors,externalIds,citationCount,url";

#[derive(Deserialize)]
struct SSSearchResult {
    #[serde(default)]
    data: Vec<SSPaper>,
}

#[derive(Deserialize)]
struct SSGraphNode {
    #[serde(default)]
    citations: Vec<SSPaper>,
    #[serde(default)]
    references: Vec<SSPaper>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SSPaper {
    paper_id: Option<String>,
    title: Option<String>,
    year: Option<i32>,
    venue: Option<String>,
    #[serde(rename = "abstract")]
    abstract_text: Option<String>,
    #[serde(default)]
    authors: Vec<SSAuthor>,
    external_ids: Option<SSExternalIds>,
    citation_count: Option<u32>,
    url: Option<String>,
}

#[derive(Deserialize)]
struct SSAuthor {
    name: Option<String>,
}

#[derive(Deserialize)]
struct SSExternalIds {
    #[serde(rename = "DOI")]
    doi: Option<String>,
}

pub struct SemanticScholarClient {
    client: Client,
    base_url: String,
    api_key: Option<String>,
}

impl SemanticScholarClient {
    pub fn new(api_key: Option<String>) -> Self {
        Self::with_base_url(SS_API_BASE, api_key)
    }

    pub fn with_base_url(base_url: impl Into<String>, api_key: Option<String>) -> Self {
        Self {
            client: http_client(),
            base_url: base_url.into(),
            api_key,
        }
    }

    async fn get_json<T: for<'de> Deserialize<'de>>(
        &self,
        url: &str,
        params: &[(&str, String)],
    ) -> Result<T, SourceError> {
        let mut request = self.client.get(url).query(params);
        if let Some(key) = &self.api_key {
            request = request.header("x-api-key", key);
        }
        info!("Querying Semantic Scholar: {}", url);
        let body = check_status(SOURCE, request.send().await?).await?.text().await?;
        serde_json::from_str(&body).map_err(|e| SourceError::malformed(SOURCE, e))
    }
}

#[async_trait]
impl SourceClient for SemanticScholarClient {
    fn source(&self) -> DiscoverySource {
        SOURCE
    }

    #[instrument(skip_all, fields(paper = %paper.id))]
    async fn fetch(
        &self,
        paper: &SourcePaper,
        config: &DiscoveryConfiguration,
    ) -> Result<Vec<DiscoveredPaper>, SourceError> {
        let base = self.base_url.trim_end_matches('/');
        let limit = config.max_results_per_source.clamp(1, 100);

        if let Some(doi) = paper.doi.as_deref().and_then(normalize_doi) {
            let url = format!("{}/paper/DOI:{}", base, urlencoding::encode(&doi));
            let nested: Vec<String> = ["citations", "references"]
                .iter()
                .flat_map(|edge| PAPER_FIELDS.split(',').map(move |f| format!("{}.{}", edge, f)))
                .collect();
            match self.get_json::<SSGraphNode>(&url, &[("fields", nested.join(","))]).await {
                Ok(node) => return Ok(map_graph(paper, node)),
                Err(e) if is_not_indexed(&e) => {
                    info!(doi = %doi, "DOI not indexed by Semantic Scholar, searching by title")
                }
                Err(e) => return Err(e),
            }
        }

        let url = format!("{}/paper/search", base);
        let params = [
            ("query", paper.title.trim().to_string()),
            ("fields", PAPER_FIELDS.to_string()),
            ("limit", limit.to_string()),
        ];
        let result: SSSearchResult = self.get_json(&url, &params).await?;
        Ok(map_search(paper, result.data))
    }
}

/// A 404 on a DOI lookup means the graph has no such paper, not that the
/// provider is unhealthy.
fn is_not_indexed(e: &SourceError) -> bool {
    matches!(e, SourceError::Status { status: 404, .. })
}

fn to_discovered(p: SSPaper, relationship: RelationshipType, relevance: f64) -> Option<DiscoveredPaper> {
    let title = p.title.filter(|t| !t.trim().is_empty())?;
    let mut paper = DiscoveredPaper::new(title, SOURCE, relationship, relevance)
        .with_authors(p.authors.into_iter().filter_map(|a| a.name).collect());
    paper.external_id = p.paper_id;
    paper.doi = p.external_ids.and_then(|ids| ids.doi);
    paper.venue = p.venue.filter(|v| !v.trim().is_empty());
    paper.year = p.year;
    paper.abstract_text = p.abstract_text;
    paper.citation_count = p.citation_count;
    paper.url = p.url;
    Some(paper)
}

fn text_overlap(source_terms: &std::collections::BTreeSet<String>, p: &DiscoveredPaper) -> f64 {
    let text = match &p.abstract_text {
        Some(abs) => format!("{} {}", p.title, abs),
        None => p.title.clone(),
    };
    keyword_overlap(source_terms, &keywords(&text))
}

/// Direct citation links are strong evidence on their own; text overlap
/// only nudges them.
fn map_graph(source: &SourcePaper, node: SSGraphNode) -> Vec<DiscoveredPaper> {
    let source_terms = keywords(&source.search_text());
    let references = node
        .references
        .into_iter()
        .filter_map(|p| to_discovered(p, RelationshipType::Cites, 0.0));
    let citations = node
        .citations
        .into_iter()
        .filter_map(|p| to_discovered(p, RelationshipType::CitedBy, 0.0));

    references
        .chain(citations)
        .map(|mut p| {
            let overlap = text_overlap(&source_terms, &p);
            p.set_relevance_score(0.55 + 0.45 * overlap);
            p
        })
        .collect()
}

/// Search hits carry no graph edge, so the relationship comes from content.
fn map_search(source: &SourcePaper, hits: Vec<SSPaper>) -> Vec<DiscoveredPaper> {
    let source_terms = keywords(&source.search_text());
    let total = hits.len().max(1) as f64;

    hits.into_iter()
        .enumerate()
        .filter_map(|(rank, hit)| {
            let mut p = to_discovered(hit, RelationshipType::SemanticSimilarity, 0.0)?;
            let candidate_terms = keywords(&format!(
                "{} {}",
                p.title,
                p.abstract_text.as_deref().unwrap_or("")
            ));
            if shares_author(source, &p) {
                p.relationship = RelationshipType::AuthorNetwork;
            } else if shared_method_terms(&source_terms, &candidate_terms) >= 2 {
                p.relationship = RelationshipType::Methodological;
            }
            let rank_score = 1.0 - rank as f64 / (2.0 * total);
            let overlap = keyword_overlap(&source_terms, &candidate_terms);
            p.set_relevance_score(0.5 * rank_score + 0.5 * overlap);
            Some(p)
        })
        .collect()
}
