//! Bibliographic index client backed by the OpenAlex works API.

use std::collections::BTreeMap;

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use tracing::{info, instrument};

use super::{check_status, http_client, SourceClient};
use crate::error::SourceError;
use crate::layers::resolution::{keyword_overlap, keywords, query_terms, same_venue, shares_author};
use crate::layers::{DiscoveredPaper, DiscoveryConfiguration, DiscoverySource, RelationshipType, SourcePaper};

const OA_API_BASE: &str = "https://api.openalex.org";
const SOURCE: DiscoverySource = DiscoverySource::BibliographicIndex;

#[derive(Deserialize)]
struct OAResponse {
    #[serde(default)]
    results: Vec<OAWork>,
}

#[derive(Deserialize)]
struct OAWork {
    id: String,
    doi: Option<String>,
    title: Option<String>,
    display_name: Option<String>,
    publication_year: Option<i32>,
    #[serde(default)]
    authorships: Vec<OAAuthorship>,
    primary_location: Option<OALocation>,
    cited_by_count: Option<u32>,
    relevance_score: Option<f64>,
    abstract_inverted_index: Option<BTreeMap<String, Vec<usize>>>,
}

#[derive(Deserialize)]
struct OAAuthorship {
    author: OAAuthor,
}

#[derive(Deserialize)]
struct OAAuthor {
    display_name: Option<String>,
}

#[derive(Deserialize)]
struct OALocation {
    landing_page_url: Option<String>,
    source: Option<OASource>,
}

#[derive(Deserialize)]
struct OASource {
    display_name: Option<String>,
}

pub struct OpenAlexClient {
    client: Client,
    base_url: String,
    email: Option<String>,
}

impl OpenAlexClient {
    pub fn new(email: Option<String>) -> Self {
        Self::with_base_url(OA_API_BASE, email)
    }

    pub fn with_base_url(base_url: impl Into<String>, email: Option<String>) -> Self {
        Self {
            client: http_client(),
            base_url: base_url.into(),
            email,
        }
    }
}

#[async_trait]
impl SourceClient for OpenAlexClient {
    fn source(&self) -> DiscoverySource {
        SOURCE
    }

    #[instrument(skip_all, fields(paper = %paper.id))]
    async fn fetch(
        &self,
        paper: &SourcePaper,
        config: &DiscoveryConfiguration,
    ) -> Result<Vec<DiscoveredPaper>, SourceError> {
        let terms = query_terms(&paper.search_text(), 8);
        if terms.is_empty() {
            return Ok(Vec::new());
        }

        let url = format!("{}/works", self.base_url.trim_end_matches('/'));
        let per_page = config.max_results_per_source.clamp(1, 200).to_string();
        let search = terms.join(" ");
        let mut params = vec![("search", search.as_str()), ("per-page", per_page.as_str())];
        if let Some(email) = &self.email {
            params.push(("mailto", email.as_str()));
        }

        info!("Querying OpenAlex: {}", search);
        let resp = self.client.get(&url).query(&params).send().await?;
        let body = check_status(SOURCE, resp).await?.text().await?;
        let parsed: OAResponse =
            serde_json::from_str(&body).map_err(|e| SourceError::malformed(SOURCE, e))?;
        Ok(map_works(paper, parsed.results))
    }
}

/// OpenAlex ships abstracts as word -> positions; put the words back in order.
fn rebuild_abstract(index: &BTreeMap<String, Vec<usize>>) -> Option<String> {
    let mut positioned: Vec<(usize, &str)> = index
        .iter()
        .flat_map(|(word, positions)| positions.iter().map(move |p| (*p, word.as_str())))
        .collect();
    if positioned.is_empty() {
        return None;
    }
    positioned.sort_unstable();
    Some(positioned.into_iter().map(|(_, w)| w).collect::<Vec<_>>().join(" "))
}

fn infer_relationship(source: &SourcePaper, candidate: &DiscoveredPaper, title_overlap: f64) -> RelationshipType {
    if shares_author(source, candidate) {
        RelationshipType::AuthorNetwork
    } else if same_venue(source, candidate) {
        RelationshipType::VenueSimilarity
    } else if title_overlap >= 0.25 {
        RelationshipType::KeywordOverlap
    } else {
        RelationshipType::FieldRelated
    }
}

fn map_works(source: &SourcePaper, works: Vec<OAWork>) -> Vec<DiscoveredPaper> {
    let source_terms = keywords(&source.search_text());
    let source_title_terms = keywords(&source.title);
    // OpenAlex relevance is unbounded; scale against the best hit.
    let max_relevance = works
        .iter()
        .filter_map(|w| w.relevance_score)
        .fold(0.0_f64, f64::max);

    works
        .into_iter()
        .filter_map(|work| {
            let title = work.title.or(work.display_name)?;
            if title.trim().is_empty() {
                return None;
            }
            let abstract_text = work.abstract_inverted_index.as_ref().and_then(rebuild_abstract);
            let authors: Vec<String> = work
                .authorships
                .into_iter()
                .filter_map(|a| a.author.display_name)
                .collect();
            let venue = work
                .primary_location
                .as_ref()
                .and_then(|loc| loc.source.as_ref())
                .and_then(|s| s.display_name.clone());
            let url = work
                .primary_location
                .as_ref()
                .and_then(|loc| loc.landing_page_url.clone())
                .unwrap_or_else(|| work.id.clone());

            let candidate_text = match &abstract_text {
                Some(abs) => format!("{} {}", title, abs),
                None => title.clone(),
            };
            let overlap = keyword_overlap(&source_terms, &keywords(&candidate_text));
            let engine_score = match (work.relevance_score, max_relevance > 0.0) {
                (Some(score), true) => score / max_relevance,
                _ => 0.5,
            };
            let relevance = 0.6 * engine_score + 0.4 * overlap;

            let mut candidate = DiscoveredPaper::new(title, SOURCE, RelationshipType::Unknown, relevance)
                .with_authors(authors)
                .with_external_id(work.id)
                .with_url(url);
            candidate.doi = work.doi;
            candidate.venue = venue;
            candidate.year = work.publication_year;
            candidate.citation_count = work.cited_by_count;
            candidate.abstract_text = abstract_text;

            let title_overlap = keyword_overlap(&source_title_terms, &keywords(&candidate.title));
            candidate.relationship = infer_relationship(source, &candidate, title_overlap);
            Some(candidate)
        })
        .collect()
}
