use std::collections::BTreeSet;

use strsim::jaro_winkler;

use crate::layers::{DiscoveredPaper, SourcePaper};

/// Titles at or above this Jaro-Winkler similarity are the same work.
const SAME_TITLE_SIMILARITY: f64 = 0.97;

const STOP_WORDS: &[&str] = &[
    "the", "and", "for", "with", "from", "that", "this", "are", "was", "were", "been", "into",
    "onto", "our", "their", "which", "also", "using", "use", "via", "towards", "toward", "over",
    "under", "between", "based", "new", "its", "can", "has", "have", "not", "but", "all", "any",
    "these", "those", "than", "then", "there", "such", "study", "paper", "approach", "results",
];

const METHOD_TERMS: &[&str] = &[
    "transformer", "attention", "convolutional", "recurrent", "bayesian", "regression",
    "reinforcement", "diffusion", "contrastive", "adversarial", "variational", "graph",
    "benchmark", "simulation", "optimization", "sampling", "clustering", "embedding",
    "distillation", "pretraining", "finetuning", "survey",
];

/// Lowercase, strip resolver prefixes. `None` when nothing usable remains.
pub fn normalize_doi(raw: &str) -> Option<String> {
    let mut doi = raw.trim().to_lowercase();
    for prefix in [
        "https://doi.org/",
        "http://doi.org/",
        "https://dx.doi.org/",
        "http://dx.doi.org/",
        "doi:",
    ] {
        if let Some(rest) = doi.strip_prefix(prefix) {
            doi = rest.trim().to_string();
        }
    }
    if doi.is_empty() {
        None
    } else {
        Some(doi)
    }
}

/// Lowercase alphanumerics separated by single spaces.
pub fn normalize_text(raw: &str) -> String {
    raw.chars()
        .map(|c| if c.is_alphanumeric() { c.to_ascii_lowercase() } else { ' ' })
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Family name of an author, tolerant of "Doe, Jane" and "Jane Doe".
pub fn normalize_author(raw: &str) -> String {
    let family = match raw.split_once(',') {
        Some((family, _)) => family.to_string(),
        None => raw.split_whitespace().last().unwrap_or("").to_string(),
    };
    normalize_text(&family).replace(' ', "")
}

/// `doi:<doi>` when a DOI is present, otherwise `title:<title>|<first author>`.
pub fn identity_key(paper: &DiscoveredPaper) -> String {
    if let Some(doi) = paper.doi.as_deref().and_then(normalize_doi) {
        return format!("doi:{}", doi);
    }
    let first_author = paper
        .authors
        .first()
        .map(|a| normalize_author(a))
        .unwrap_or_default();
    format!("title:{}|{}", normalize_text(&paper.title), first_author)
}

/// Content words of length >= 3, stop words removed.
pub fn keywords(text: &str) -> BTreeSet<String> {
    normalize_text(text)
        .split(' ')
        .filter(|w| w.len() >= 3 && !STOP_WORDS.contains(w))
        .map(String::from)
        .collect()
}

/// Jaccard similarity of two keyword sets.
pub fn keyword_overlap(a: &BTreeSet<String>, b: &BTreeSet<String>) -> f64 {
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    let shared = a.intersection(b).count();
    let union = a.union(b).count();
    shared as f64 / union as f64
}

/// The most distinctive query terms of a text, longest first.
pub fn query_terms(text: &str, limit: usize) -> Vec<String> {
    let mut terms: Vec<String> = keywords(text).into_iter().collect();
    terms.sort_by(|a, b| b.len().cmp(&a.len()).then_with(|| a.cmp(b)));
    terms.truncate(limit);
    terms
}

pub fn shared_method_terms(a: &BTreeSet<String>, b: &BTreeSet<String>) -> usize {
    METHOD_TERMS
        .iter()
        .filter(|t| a.contains(**t) && b.contains(**t))
        .count()
}

/// True when any author family name appears on both papers.
pub fn shares_author(source: &SourcePaper, candidate: &DiscoveredPaper) -> bool {
    let source_authors: BTreeSet<String> = source
        .authors
        .iter()
        .map(|a| normalize_author(a))
        .filter(|a| !a.is_empty())
        .collect();
    candidate
        .authors
        .iter()
        .any(|a| source_authors.contains(&normalize_author(a)))
}

pub fn same_venue(source: &SourcePaper, candidate: &DiscoveredPaper) -> bool {
    match (&source.venue, &candidate.venue) {
        (Some(a), Some(b)) => {
            let (a, b) = (normalize_text(a), normalize_text(b));
            !a.is_empty() && a == b
        }
        _ => false,
    }
}

pub struct Resolver;

impl Resolver {
    /// Whether a discovered record is the source paper itself.
    pub fn is_source_paper(source: &SourcePaper, candidate: &DiscoveredPaper) -> bool {
        let source_doi = source.doi.as_deref().and_then(normalize_doi);
        let candidate_doi = candidate.doi.as_deref().and_then(normalize_doi);
        if let (Some(a), Some(b)) = (&source_doi, &candidate_doi) {
            return a == b;
        }

        let query_title = normalize_text(&source.title);
        if query_title.is_empty() {
            return false;
        }
        let similarity = jaro_winkler(&query_title, &normalize_text(&candidate.title));
        tracing::debug!("Candidate: {} (similarity: {:.3})", candidate.title, similarity);
        similarity >= SAME_TITLE_SIMILARITY
    }
}
