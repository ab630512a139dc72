//! Context retrieval for one chat request.
//!
//! Two mutually exclusive paths:
//!
//! - **Explicit selection**: the caller names document ids. Oversized
//!   documents are dropped, the rest are read in full. An empty result is a
//!   `no_suitable_files` error.
//! - **Automatic selection**: with a vector backend configured, the query is
//!   embedded and matched against indexed excerpts. Any backend failure or an
//!   empty result degrades to a placeholder blob flagged `degraded`; the
//!   request itself never fails here. Without a backend the lexical selector
//!   ranks scanned documents instead.
//!
//! Assembly is first-fit: candidates are appended in order until the next
//! one would push the charged size past the cap. The result is always a
//! prefix of the candidate list.

use futures::future::{join_all, try_join_all};
use std::collections::HashSet;
use std::path::Path;
use tracing::{info, warn};

use crate::config::RetrievalConfig;
use crate::error::{Result, VaultError};
use crate::models::{ContextBlob, ContextSource, DocumentContent, DocumentRecord, Query, VectorHit};
use crate::scanner::{self, ScanLimits};
use crate::selector;
use crate::semantic::{self, SemanticBackend};

/// What the caller handed in alongside the query.
#[derive(Debug, Clone, Default)]
pub struct RetrievalRequest {
    /// Explicitly selected document ids. Empty means automatic selection.
    pub file_ids: Vec<String>,
    /// Metadata from an earlier scan, used instead of re-scanning.
    pub all_files: Option<Vec<DocumentRecord>>,
}

pub struct RetrievalOrchestrator {
    limits: ScanLimits,
    config: RetrievalConfig,
    semantic: SemanticBackend,
}

impl RetrievalOrchestrator {
    pub fn new(limits: ScanLimits, config: RetrievalConfig, semantic: SemanticBackend) -> Self {
        Self {
            limits,
            config,
            semantic,
        }
    }

    pub fn limits(&self) -> &ScanLimits {
        &self.limits
    }

    pub fn config(&self) -> &RetrievalConfig {
        &self.config
    }

    pub fn semantic(&self) -> &SemanticBackend {
        &self.semantic
    }

    /// Build the context for `query` against the vault at `root`.
    pub async fn retrieve(
        &self,
        query: &Query,
        root: &Path,
        request: RetrievalRequest,
    ) -> Result<ContextBlob> {
        if !request.file_ids.is_empty() {
            return self
                .explicit(root, &request.file_ids, request.all_files)
                .await;
        }
        if self.semantic.is_enabled() {
            return Ok(self.semantic_context(query).await);
        }
        self.lexical(query, root, request.all_files).await
    }

    async fn candidates(
        &self,
        root: &Path,
        all_files: Option<Vec<DocumentRecord>>,
    ) -> Result<Vec<DocumentRecord>> {
        match all_files {
            Some(files) => Ok(files),
            None => scanner::scan(root, &self.limits).await,
        }
    }

    async fn explicit(
        &self,
        root: &Path,
        file_ids: &[String],
        all_files: Option<Vec<DocumentRecord>>,
    ) -> Result<ContextBlob> {
        let files = self.candidates(root, all_files).await?;

        let mut seen = HashSet::new();
        let mut selected: Vec<&DocumentRecord> = Vec::new();
        for id in file_ids {
            if !seen.insert(id.as_str()) {
                continue;
            }
            if let Some(file) = files.iter().find(|f| &f.id == id) {
                if !file.is_oversized {
                    selected.push(file);
                }
            }
        }

        info!(
            requested = file_ids.len(),
            usable = selected.len(),
            "explicit selection"
        );
        if selected.is_empty() {
            return Err(VaultError::NoSuitableFiles);
        }

        let documents = try_join_all(
            selected
                .iter()
                .map(|f| scanner::read_document(root, &f.relative_path, &self.limits)),
        )
        .await?;

        Ok(assemble_context(
            ContextSource::Selection,
            documents,
            self.config.context_cap_bytes,
            self.config.per_document_overhead,
        ))
    }

    async fn semantic_context(&self, query: &Query) -> ContextBlob {
        let result = semantic::semantic_search(
            &self.semantic,
            query.raw(),
            self.config.match_count,
            self.config.similarity_threshold,
        )
        .await;

        match result {
            Ok(mut hits) if !hits.is_empty() => {
                hits.truncate(self.config.match_count);
                info!(hits = hits.len(), "semantic context");
                assemble_hits(
                    hits,
                    self.config.context_cap_bytes,
                    self.config.per_document_overhead,
                )
            }
            Ok(_) => {
                warn!("vector search returned no hits; continuing without context");
                ContextBlob::placeholder("no_matches")
            }
            Err(e) => {
                warn!(error = %e, "vector search failed; continuing without context");
                ContextBlob::placeholder(e.code())
            }
        }
    }

    async fn lexical(
        &self,
        query: &Query,
        root: &Path,
        all_files: Option<Vec<DocumentRecord>>,
    ) -> Result<ContextBlob> {
        let files = self.candidates(root, all_files).await?;
        let eligible: Vec<DocumentRecord> =
            files.into_iter().filter(|f| !f.is_oversized).collect();
        let picked = selector::select_top(
            query,
            &eligible,
            self.config.max_files,
            &self.config.weights,
        );

        let reads = join_all(
            picked
                .iter()
                .map(|f| scanner::read_document(root, &f.relative_path, &self.limits)),
        )
        .await;

        let mut documents = Vec::with_capacity(reads.len());
        for (record, read) in picked.iter().zip(reads) {
            match read {
                Ok(doc) => documents.push(doc),
                Err(e) => warn!(path = %record.relative_path, error = %e, "dropping unreadable document"),
            }
        }

        info!(
            candidates = eligible.len(),
            picked = documents.len(),
            "lexical context"
        );
        Ok(assemble_context(
            ContextSource::Lexical,
            documents,
            self.config.context_cap_bytes,
            self.config.per_document_overhead,
        ))
    }
}

/// Bytes a document is charged against the cap.
pub fn document_cost(doc: &DocumentContent, overhead: usize) -> usize {
    doc.full_text.len() + doc.record.relative_path.len() + overhead
}

/// Bytes an excerpt is charged against the cap.
pub fn hit_cost(hit: &VectorHit, overhead: usize) -> usize {
    hit.chunk_text.len()
        + hit.file_path.len()
        + hit.heading.as_ref().map_or(0, |h| h.len())
        + overhead
}

/// Longest prefix of `items` whose total cost stays within `cap`.
fn take_prefix<T>(items: Vec<T>, cap: usize, cost: impl Fn(&T) -> usize) -> (Vec<T>, usize, bool) {
    let total = items.len();
    let mut used = 0;
    let mut kept = Vec::with_capacity(total);

    for item in items {
        let c = cost(&item);
        if used + c > cap {
            break;
        }
        used += c;
        kept.push(item);
    }

    let truncated = kept.len() < total;
    (kept, used, truncated)
}

/// Pack documents, in order, into a blob no larger than `cap`.
pub fn assemble_context(
    source: ContextSource,
    documents: Vec<DocumentContent>,
    cap: usize,
    overhead: usize,
) -> ContextBlob {
    let (documents, cumulative_bytes, truncated) =
        take_prefix(documents, cap, |d| document_cost(d, overhead));
    if truncated {
        info!(kept = documents.len(), cumulative_bytes, "context truncated at cap");
    }
    ContextBlob {
        source,
        documents,
        hits: Vec::new(),
        cumulative_bytes,
        truncated,
        degraded: None,
    }
}

/// Pack semantic excerpts, in order, into a blob no larger than `cap`.
pub fn assemble_hits(hits: Vec<VectorHit>, cap: usize, overhead: usize) -> ContextBlob {
    let (hits, cumulative_bytes, truncated) = take_prefix(hits, cap, |h| hit_cost(h, overhead));
    ContextBlob {
        source: ContextSource::Semantic,
        documents: Vec::new(),
        hits,
        cumulative_bytes,
        truncated,
        degraded: None,
    }
}
