//! Realtime research client backed by the arXiv Atom feed.
//!
//! Newest submissions first, so the relationship leans on recency
//! ("trending") unless the text match is strong.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use quick_xml::escape::resolve_predefined_entity;
use quick_xml::events::{BytesRef, Event};
use quick_xml::reader::Reader;
use reqwest::Client;
use tracing::{debug, info, instrument, warn};

use super::{check_status, http_client, SourceClient};
use crate::error::SourceError;
use crate::layers::resolution::{keyword_overlap, keywords, query_terms};
use crate::layers::{DiscoveredPaper, DiscoveryConfiguration, DiscoverySource, RelationshipType, SourcePaper};

const ARXIV_API_BASE: &str = "http://export.arxiv.org/api/query";
const SOURCE: DiscoverySource = DiscoverySource::RealtimeResearch;
const TRENDING_WINDOW_DAYS: i64 = 180;
const STRONG_TEXT_MATCH: f64 = 0.35;

/// One Atom `<entry>`.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct ArxivEntry {
    pub id: String,
    pub title: String,
    pub summary: String,
    pub published: Option<DateTime<Utc>>,
    pub authors: Vec<String>,
    pub doi: Option<String>,
    pub journal_ref: Option<String>,
}

pub struct ArxivClient {
    client: Client,
    base_url: String,
}

impl Default for ArxivClient {
    fn default() -> Self {
        Self::new()
    }
}

impl ArxivClient {
    pub fn new() -> Self {
        Self::with_base_url(ARXIV_API_BASE)
    }

    pub fn with_base_url(base_url: impl Into<String>) -> Self {
        Self {
            client: http_client(),
            base_url: base_url.into(),
        }
    }
}

#[async_trait]
impl SourceClient for ArxivClient {
    fn source(&self) -> DiscoverySource {
        SOURCE
    }

    #[instrument(skip_all, fields(paper = %paper.id))]
    async fn fetch(
        &self,
        paper: &SourcePaper,
        config: &DiscoveryConfiguration,
    ) -> Result<Vec<DiscoveredPaper>, SourceError> {
        let terms = query_terms(&paper.title, 3);
        if terms.is_empty() {
            return Ok(Vec::new());
        }
        let query = terms
            .iter()
            .map(|t| format!("all:{}", t))
            .collect::<Vec<_>>()
            .join(" AND ");
        let max_results = config.max_results_per_source.clamp(1, 100).to_string();

        info!("Querying arXiv: {}", query);
        let resp = self
            .client
            .get(&self.base_url)
            .query(&[
                ("search_query", query.as_str()),
                ("start", "0"),
                ("max_results", max_results.as_str()),
                ("sortBy", "submittedDate"),
                ("sortOrder", "descending"),
            ])
            .send()
            .await?;
        let text = check_status(SOURCE, resp).await?.text().await?;
        let entries = parse_feed(&text)?;
        Ok(map_entries(paper, entries, Utc::now()))
    }
}

#[derive(PartialEq)]
enum TagState {
    None,
    Title,
    Summary,
    Published,
    AuthorName,
    Id,
    Doi,
    JournalRef,
}

fn squash_whitespace(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// `&amp;` and friends arrive as their own events; unknown names stay literal.
fn resolve_reference(e: &BytesRef<'_>) -> String {
    if let Ok(Some(ch)) = e.resolve_char_ref() {
        return ch.to_string();
    }
    let name = e.decode().map(|n| n.into_owned()).unwrap_or_default();
    match resolve_predefined_entity(&name) {
        Some(resolved) => resolved.to_string(),
        None => format!("&{};", name),
    }
}

/// Parse an arXiv Atom response. Entries parsed before a mid-document XML
/// error are kept; an error before any entry is a malformed payload.
pub fn parse_feed(xml: &str) -> Result<Vec<ArxivEntry>, SourceError> {
    let mut reader = Reader::from_str(xml);

    let mut entries = Vec::new();
    let mut buf = Vec::new();
    let mut current: Option<ArxivEntry> = None;
    let mut state = TagState::None;
    // Text of the open field, completed at its end tag.
    let mut text = String::new();

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => {
                text.clear();
                state = match e.name().as_ref() {
                    b"entry" => {
                        current = Some(ArxivEntry::default());
                        TagState::None
                    }
                    _ if current.is_none() => TagState::None,
                    b"title" => TagState::Title,
                    b"summary" => TagState::Summary,
                    b"published" => TagState::Published,
                    b"name" => TagState::AuthorName,
                    b"id" => TagState::Id,
                    b"arxiv:doi" => TagState::Doi,
                    b"arxiv:journal_ref" => TagState::JournalRef,
                    _ => TagState::None,
                };
            }
            Ok(Event::Text(e)) if state != TagState::None => {
                text.push_str(&String::from_utf8_lossy(&e.into_inner()));
            }
            Ok(Event::CData(e)) if state != TagState::None => {
                text.push_str(&String::from_utf8_lossy(&e.into_inner()));
            }
            Ok(Event::GeneralRef(e)) if state != TagState::None => {
                text.push_str(&resolve_reference(&e));
            }
            Ok(Event::End(e)) => {
                if e.name().as_ref() == b"entry" {
                    if let Some(mut entry) = current.take() {
                        entry.title = squash_whitespace(&entry.title);
                        entry.summary = squash_whitespace(&entry.summary);
                        debug!("Parsed arXiv entry: title='{}', id='{}'", entry.title, entry.id);
                        entries.push(entry);
                    }
                } else if let Some(entry) = current.as_mut() {
                    let value = text.trim();
                    match state {
                        TagState::Title => entry.title.push_str(value),
                        TagState::Summary => entry.summary.push_str(value),
                        TagState::Published => {
                            entry.published = DateTime::parse_from_rfc3339(value)
                                .ok()
                                .map(|d| d.with_timezone(&Utc));
                        }
                        TagState::AuthorName if !value.is_empty() => {
                            entry.authors.push(squash_whitespace(value))
                        }
                        TagState::Id => entry.id = value.to_string(),
                        TagState::Doi if !value.is_empty() => entry.doi = Some(value.to_string()),
                        TagState::JournalRef if !value.is_empty() => {
                            entry.journal_ref = Some(squash_whitespace(value))
                        }
                        _ => {}
                    }
                }
                state = TagState::None;
                text.clear();
            }
            Ok(Event::Eof) => break,
            Err(e) => {
                if entries.is_empty() {
                    return Err(SourceError::malformed(SOURCE, e));
                }
                warn!(
                    "XML parsing error at position {}: {:?}",
                    reader.buffer_position(),
                    e
                );
                break;
            }
            _ => {}
        }
        buf.clear();
    }

    Ok(entries)
}

fn arxiv_id(abs_url: &str) -> String {
    abs_url
        .rsplit_once("/abs/")
        .map(|(_, id)| id.to_string())
        .unwrap_or_else(|| abs_url.to_string())
}

/// Preprints carry no citation data; the relationship is either a strong
/// text match or a recency signal, never a citation edge.
fn map_entries(source: &SourcePaper, entries: Vec<ArxivEntry>, now: DateTime<Utc>) -> Vec<DiscoveredPaper> {
    let source_terms = keywords(&source.search_text());

    entries
        .into_iter()
        .filter(|e| !e.title.is_empty())
        .map(|entry| {
            let overlap = keyword_overlap(
                &source_terms,
                &keywords(&format!("{} {}", entry.title, entry.summary)),
            );
            let recent = entry
                .published
                .is_some_and(|p| (now - p).num_days() <= TRENDING_WINDOW_DAYS);
            let (relationship, recency_boost) = if overlap >= STRONG_TEXT_MATCH {
                (RelationshipType::SemanticSimilarity, 0.0)
            } else if recent {
                (RelationshipType::Trending, 0.1)
            } else {
                (RelationshipType::KeywordOverlap, 0.0)
            };
            let relevance = 0.3 + 0.7 * overlap + recency_boost;

            let mut paper = DiscoveredPaper::new(entry.title, SOURCE, relationship, relevance)
                .with_authors(entry.authors)
                .with_external_id(arxiv_id(&entry.id))
                .with_venue(entry.journal_ref.unwrap_or_else(|| "arXiv".to_string()));
            if !entry.id.is_empty() {
                paper.url = Some(entry.id);
            }
            if !entry.summary.is_empty() {
                paper.abstract_text = Some(entry.summary);
            }
            paper.doi = entry.doi;
            paper.year = entry.published.map(|p| chrono::Datelike::year(&p));
            paper
        })
        .collect()
}
