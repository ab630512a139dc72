//! Lexical relevance scoring over scanned document metadata.
//!
//! Nothing here touches the filesystem. Scoring is additive over keywords
//! and weighted by where a keyword matched:
//!
//! ```text
//! filename  +3   relative path  +2   preview  +1
//! each matching tag  +2   modified within 7 days  +1 (once)
//! ```
//!
//! All matches are case-insensitive substring checks. Tags match in both
//! directions: a tag containing the keyword, or a keyword containing a tag
//! longer than two characters (`bugs` hits the tag `bug`, `a` never hits `ai`). The weights come from
//! [`ScoringWeights`] so they can be tuned from `[retrieval.weights]`.

use chrono::{DateTime, Duration, Utc};
use lazy_static::lazy_static;
use regex::Regex;
use serde::Serialize;
use std::collections::{BTreeMap, HashSet};

use crate::config::ScoringWeights;
use crate::markdown;
use crate::models::{DocumentRecord, Query};
use crate::scanner::sort_newest_first;

const STOP_WORDS: &[&str] = &[
    "the", "a", "an", "and", "or", "but", "in", "on", "at", "to", "for", "of", "with", "by",
    "from", "as", "is", "was", "are", "were", "been", "be", "have", "has", "had", "do", "does",
    "did", "will", "would", "should", "could", "can", "may", "might", "must", "what", "which",
    "who", "when", "where", "why", "how", "this", "that", "these", "those",
];

lazy_static! {
    static ref PUNCTUATION: Regex = Regex::new(r"[^\w\s]").unwrap();
}

/// Lowercased query tokens longer than two characters that are not stop
/// words. Duplicates are dropped; first occurrence order is kept.
pub fn extract_keywords(query: &str) -> Vec<String> {
    let lowered = query.to_lowercase();
    let cleaned = PUNCTUATION.replace_all(&lowered, " ");

    let mut seen = HashSet::new();
    cleaned
        .split_whitespace()
        .filter(|word| word.chars().count() > 2)
        .filter(|word| !STOP_WORDS.contains(word))
        .filter(|word| seen.insert(word.to_string()))
        .map(str::to_string)
        .collect()
}

/// A document paired with its relevance score.
#[derive(Debug, Clone, Serialize)]
pub struct ScoredDocument {
    pub document: DocumentRecord,
    pub score: u32,
}

/// Score `doc` against `keywords` as of now.
pub fn score(doc: &DocumentRecord, keywords: &[String], weights: &ScoringWeights) -> u32 {
    score_at(doc, keywords, weights, Utc::now())
}

/// Score `doc` against `keywords` with an explicit clock.
pub fn score_at(
    doc: &DocumentRecord,
    keywords: &[String],
    weights: &ScoringWeights,
    now: DateTime<Utc>,
) -> u32 {
    let filename = doc.filename.to_lowercase();
    let path = doc.relative_path.to_lowercase();
    let preview = doc.preview.to_lowercase();
    let tags: Vec<String> = markdown::tags(&doc.frontmatter)
        .into_iter()
        .map(|t| t.to_lowercase())
        .collect();

    let mut total = 0;
    for keyword in keywords {
        let keyword = keyword.as_str();
        if filename.contains(keyword) {
            total += weights.filename;
        }
        if path.contains(keyword) {
            total += weights.path;
        }
        if preview.contains(keyword) {
            total += weights.preview;
        }
        total += weights.tag * tags.iter().filter(|t| tag_matches(t, keyword)).count() as u32;
    }

    // a window too large for chrono covers every document
    let age = now.signed_duration_since(doc.modified_at);
    if Duration::try_days(weights.recency_days).map_or(true, |window| age < window) {
        total += weights.recency_bonus;
    }

    total
}

/// A tag matches when either side contains the other, so the tag `bug`
/// matches the keyword `bugs`. Tags of two characters or fewer only match
/// one way.
fn tag_matches(tag: &str, keyword: &str) -> bool {
    tag.contains(keyword) || (tag.chars().count() > 2 && keyword.contains(tag))
}

/// Score every document and keep the positive ones, best first.
///
/// Ties keep input order.
pub fn rank(
    keywords: &[String],
    docs: &[DocumentRecord],
    weights: &ScoringWeights,
    now: DateTime<Utc>,
) -> Vec<ScoredDocument> {
    let mut scored: Vec<ScoredDocument> = docs
        .iter()
        .map(|doc| ScoredDocument {
            score: score_at(doc, keywords, weights, now),
            document: doc.clone(),
        })
        .filter(|s| s.score > 0)
        .collect();
    scored.sort_by(|a, b| b.score.cmp(&a.score));
    scored
}

/// Pick at most `max_count` documents for `query`.
///
/// When the query yields no keywords the newest documents are returned
/// regardless of score.
pub fn select_top(
    query: &Query,
    docs: &[DocumentRecord],
    max_count: usize,
    weights: &ScoringWeights,
) -> Vec<DocumentRecord> {
    select_top_at(query.keywords(), docs, max_count, weights, Utc::now())
}

pub fn select_top_at(
    keywords: &[String],
    docs: &[DocumentRecord],
    max_count: usize,
    weights: &ScoringWeights,
    now: DateTime<Utc>,
) -> Vec<DocumentRecord> {
    if keywords.is_empty() {
        let mut newest = docs.to_vec();
        sort_newest_first(&mut newest);
        newest.truncate(max_count);
        return newest;
    }

    rank(keywords, docs, weights, now)
        .into_iter()
        .take(max_count)
        .map(|s| s.document)
        .collect()
}

/// Criteria for [`filter_documents`]. Unset fields match everything.
#[derive(Debug, Clone, Default)]
pub struct DocumentFilter {
    /// Keep documents carrying any of these tags (case-insensitive).
    pub tags: Vec<String>,
    /// Keep documents whose relative path starts with this prefix.
    pub folder: Option<String>,
    pub modified_after: Option<DateTime<Utc>>,
    /// Inclusive upper bound on `size_bytes`.
    pub max_size: Option<u64>,
}

pub fn filter_documents(docs: &[DocumentRecord], filter: &DocumentFilter) -> Vec<DocumentRecord> {
    let wanted: Vec<String> = filter.tags.iter().map(|t| t.to_lowercase()).collect();

    docs.iter()
        .filter(|doc| {
            if wanted.is_empty() {
                return true;
            }
            let doc_tags: Vec<String> = markdown::tags(&doc.frontmatter)
                .into_iter()
                .map(|t| t.to_lowercase())
                .collect();
            wanted.iter().any(|t| doc_tags.contains(t))
        })
        .filter(|doc| match &filter.folder {
            Some(prefix) => doc.relative_path.starts_with(prefix.as_str()),
            None => true,
        })
        .filter(|doc| match filter.modified_after {
            Some(after) => doc.modified_at > after,
            None => true,
        })
        .filter(|doc| match filter.max_size {
            Some(max) => doc.size_bytes <= max,
            None => true,
        })
        .cloned()
        .collect()
}

/// Group documents by their first path segment (`root` for top level).
pub fn group_by_folder(docs: &[DocumentRecord]) -> BTreeMap<String, Vec<DocumentRecord>> {
    let mut groups: BTreeMap<String, Vec<DocumentRecord>> = BTreeMap::new();
    for doc in docs {
        groups
            .entry(doc.folder().to_string())
            .or_default()
            .push(doc.clone());
    }
    groups
}

/// Aggregate figures over a set of documents.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DocumentStats {
    pub total_files: usize,
    pub total_bytes: u64,
    /// Rounded mean of `size_bytes`.
    pub average_bytes: u64,
    pub oldest: Option<DateTime<Utc>>,
    pub newest: Option<DateTime<Utc>>,
    pub oversized_files: usize,
}

pub fn document_stats(docs: &[DocumentRecord]) -> DocumentStats {
    if docs.is_empty() {
        return DocumentStats::default();
    }

    let total_bytes: u64 = docs.iter().map(|d| d.size_bytes).sum();
    let count = docs.len() as u64;

    DocumentStats {
        total_files: docs.len(),
        total_bytes,
        average_bytes: (total_bytes + count / 2) / count,
        oldest: docs.iter().map(|d| d.modified_at).min(),
        newest: docs.iter().map(|d| d.modified_at).max(),
        oversized_files: docs.iter().filter(|d| d.is_oversized).count(),
    }
}
