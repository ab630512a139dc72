//! Command implementations behind the `vctx` binary.
//!
//! Each `run_*` function prints human-readable output to stdout and returns
//! `anyhow::Result`. Library errors keep their public message so the CLI
//! never prints more than the HTTP API would.

use anyhow::{anyhow, bail, Result};
use std::future::Future;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::completion::CompletionStreamer;
use crate::config::Config;
use crate::error::VaultError;
use crate::models::{decode_id, DocumentRecord, Query};
use crate::path_guard;
use crate::prompt;
use crate::retrieval::{RetrievalOrchestrator, RetrievalRequest};
use crate::scanner::{self, ScanLimits};
use crate::selector::{self, DocumentFilter};
use crate::semantic::SemanticBackend;

/// `--root`, falling back to `[vault].default_root`.
pub fn resolve_root(config: &Config, root: Option<PathBuf>) -> Result<PathBuf> {
    let root = match root.or_else(|| config.vault.default_root.clone()) {
        Some(root) => root,
        None => bail!("No vault root given. Pass --root or set [vault].default_root."),
    };
    path_guard::validate_root(&root).map_err(public)
}

fn public(err: VaultError) -> anyhow::Error {
    anyhow!("{} ({})", err.public_message(), err.code())
}

/// Scan the vault and print a summary plus every document, newest first.
pub async fn run_scan(config: &Config, root: Option<PathBuf>) -> Result<()> {
    let root = resolve_root(config, root)?;
    let limits = ScanLimits::from_config(&config.vault).map_err(public)?;

    let mut docs = scanner::scan(&root, &limits).await.map_err(public)?;
    scanner::sort_newest_first(&mut docs);

    let stats = selector::document_stats(&docs);
    println!("Vault Scan");
    println!("==========");
    println!();
    println!("  Documents:   {}", stats.total_files);
    println!("  Total size:  {}", format_bytes(stats.total_bytes));
    println!("  Average:     {}", format_bytes(stats.average_bytes));
    println!("  Oversized:   {}", stats.oversized_files);
    if let (Some(oldest), Some(newest)) = (stats.oldest, stats.newest) {
        println!(
            "  Modified:    {} .. {}",
            oldest.format("%Y-%m-%d"),
            newest.format("%Y-%m-%d")
        );
    }

    let groups = selector::group_by_folder(&docs);
    if !groups.is_empty() {
        println!();
        println!("  {:<32} {:>6}", "FOLDER", "DOCS");
        println!("  {}", "-".repeat(40));
        for (folder, members) in &groups {
            println!("  {:<32} {:>6}", folder, members.len());
        }
    }

    println!();
    for doc in &docs {
        print_record(doc);
    }
    Ok(())
}

/// Print one document's body by id.
pub async fn run_read(config: &Config, root: Option<PathBuf>, id: &str) -> Result<()> {
    let root = resolve_root(config, root)?;
    let limits = ScanLimits::from_config(&config.vault).map_err(public)?;
    let relative = decode_id(id).map_err(public)?;

    let doc = scanner::read_document(&root, &relative, &limits)
        .await
        .map_err(public)?;

    println!("--- Document ---");
    println!("path: {}", doc.record.relative_path);
    println!("modified: {}", doc.record.modified_at.format("%Y-%m-%d %H:%M"));
    println!("size: {}", format_bytes(doc.record.size_bytes));
    let tags = crate::markdown::tags(&doc.record.frontmatter);
    if !tags.is_empty() {
        println!("tags: {}", tags.join(", "));
    }
    println!();
    println!("{}", doc.full_text.trim());
    Ok(())
}

/// Options for `vctx select`.
#[derive(Debug, Default)]
pub struct SelectOptions {
    pub limit: Option<usize>,
    pub tags: Vec<String>,
    pub folder: Option<String>,
}

/// Rank vault documents against `query` with the lexical selector.
pub async fn run_select(
    config: &Config,
    root: Option<PathBuf>,
    query: &str,
    options: SelectOptions,
) -> Result<()> {
    let root = resolve_root(config, root)?;
    let query = Query::parse(query, config.retrieval.max_query_chars).map_err(public)?;
    let limits = ScanLimits::from_config(&config.vault).map_err(public)?;

    let docs = scanner::scan(&root, &limits).await.map_err(public)?;
    let filter = DocumentFilter {
        tags: options.tags,
        folder: options.folder,
        ..DocumentFilter::default()
    };
    let docs = selector::filter_documents(&docs, &filter);

    let limit = options.limit.unwrap_or(config.retrieval.max_files);
    let weights = &config.retrieval.weights;
    let now = chrono::Utc::now();
    let selected = selector::select_top_at(query.keywords(), &docs, limit, weights, now);

    if selected.is_empty() {
        println!("No results.");
        return Ok(());
    }

    println!("keywords: {}", query.keywords().join(", "));
    println!();
    for (i, doc) in selected.iter().enumerate() {
        let score = selector::score_at(doc, query.keywords(), weights, now);
        println!("{}. [{}] {}", i + 1, score, doc.relative_path);
        println!("    modified: {}", doc.modified_at.format("%Y-%m-%d"));
        if !doc.preview.is_empty() {
            println!("    excerpt: \"{}\"", doc.preview.replace('\n', " ").trim());
        }
        println!("    id: {}", doc.id);
        println!();
    }
    Ok(())
}

/// Retrieve context for `query` and stream the model's answer to stdout.
///
/// Retrieval and opening the stream share `[server].request_timeout_secs`.
/// Ctrl-C before the first token fails with `cancelled`; after that it stops
/// the stream and releases the upstream connection.
pub async fn run_ask(
    config: &Config,
    root: Option<PathBuf>,
    query: &str,
    file_ids: Vec<String>,
) -> Result<()> {
    let query = Query::parse(query, config.retrieval.max_query_chars).map_err(public)?;
    let streamer = CompletionStreamer::new(&config.completion).map_err(public)?;
    let root = resolve_root(config, root)?;

    let limits = ScanLimits::from_config(&config.vault).map_err(public)?;
    let semantic = SemanticBackend::from_config(config).map_err(public)?;
    let orchestrator = RetrievalOrchestrator::new(limits, config.retrieval.clone(), semantic);

    let request = RetrievalRequest {
        file_ids,
        all_files: None,
    };
    let setup = async {
        let blob = orchestrator.retrieve(&query, &root, request).await?;
        print_context_summary(&root, &blob);
        eprintln!("model: {}", streamer.model());
        let messages = prompt::messages(&blob, query.raw());
        streamer.stream(&messages).await
    };
    let deadline = Duration::from_secs(config.server.request_timeout_secs);
    let cancel = async {
        // without a signal handler only the deadline applies
        if tokio::signal::ctrl_c().await.is_err() {
            std::future::pending::<()>().await;
        }
    };
    let mut opened = within_deadline(setup, deadline, cancel)
        .await
        .map_err(public)?;

    let mut stdout = std::io::stdout();
    loop {
        tokio::select! {
            token = opened.tokens.recv() => match token {
                Some(token) => {
                    print!("{}", token);
                    stdout.flush()?;
                }
                None => break,
            },
            _ = tokio::signal::ctrl_c() => {
                eprintln!();
                eprintln!("Cancelled.");
                break;
            }
        }
    }
    println!();
    Ok(())
}

/// Run `setup` until it finishes, `deadline` passes, or `cancel` resolves.
async fn within_deadline<T, F, C>(
    setup: F,
    deadline: Duration,
    cancel: C,
) -> std::result::Result<T, VaultError>
where
    F: Future<Output = std::result::Result<T, VaultError>>,
    C: Future<Output = ()>,
{
    tokio::select! {
        outcome = tokio::time::timeout(deadline, setup) => {
            outcome.map_err(|_| VaultError::Timeout(deadline))?
        }
        _ = cancel => Err(VaultError::Cancelled),
    }
}

fn print_context_summary(root: &Path, blob: &crate::models::ContextBlob) {
    let degraded = match &blob.degraded {
        Some(reason) => format!(" (degraded: {})", reason),
        None => String::new(),
    };
    eprintln!(
        "context: {} from {} item(s), {}{}{}",
        blob.source.as_str(),
        blob.len(),
        format_bytes(blob.cumulative_bytes as u64),
        if blob.truncated { ", truncated" } else { "" },
        degraded
    );
    for doc in &blob.documents {
        eprintln!("  - {}", doc.record.relative_path);
    }
    tracing::debug!(root = %root.display(), "context assembled");
}

fn print_record(doc: &DocumentRecord) {
    let flag = if doc.is_oversized { " [oversized]" } else { "" };
    println!(
        "{}  {:>9}  {}{}",
        doc.modified_at.format("%Y-%m-%d"),
        format_bytes(doc.size_bytes),
        doc.relative_path,
        flag
    );
}

/// Format a byte count as a human-readable string.
fn format_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{} B", bytes)
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(2048), "2.0 KB");
        assert_eq!(format_bytes(3 * 1024 * 1024), "3.0 MB");
    }

    #[test]
    fn test_resolve_root_requires_a_root() {
        let config = Config::default();
        assert!(resolve_root(&config, None).is_err());
        let err = resolve_root(&config, Some(PathBuf::from("notes"))).unwrap_err();
        assert!(err.to_string().contains("invalid_path"));
    }

    #[tokio::test]
    async fn test_within_deadline_passes_result_through() {
        let out = within_deadline(
            async { Ok::<_, VaultError>(7) },
            Duration::from_secs(5),
            std::future::pending(),
        )
        .await;
        assert_eq!(out.unwrap(), 7);
    }

    #[tokio::test]
    async fn test_within_deadline_times_out() {
        let err = within_deadline(
            async {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok::<_, VaultError>(())
            },
            Duration::from_millis(20),
            std::future::pending(),
        )
        .await
        .unwrap_err();
        assert_eq!(err.code(), "timeout");
    }

    #[tokio::test]
    async fn test_within_deadline_cancelled_before_stream_opens() {
        let err = within_deadline(
            async {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok::<_, VaultError>(())
            },
            Duration::from_secs(30),
            tokio::time::sleep(Duration::from_millis(20)),
        )
        .await
        .unwrap_err();
        assert_eq!(err.code(), "cancelled");
        assert!(public(err).to_string().contains("(cancelled)"));
    }
}
