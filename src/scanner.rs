//! Concurrent vault scanning and single-document reads.
//!
//! [`scan`] walks the vault with an explicit worklist: every directory and
//! every candidate file is a job on a [`JoinSet`], and each job holds a
//! semaphore permit while it touches the filesystem, so the number of open
//! handles never exceeds [`ScanLimits::max_concurrency`] no matter how wide
//! or deep the tree is. Results are merged by the driving loop; no state is
//! shared between jobs.
//!
//! A failure on one file or directory is logged and skipped. Only a bad
//! root fails the scan.

use chrono::{DateTime, Utc};
use globset::{Glob, GlobSet, GlobSetBuilder};
use std::fs::Metadata;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Instant, SystemTime};
use tokio::fs;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::config::VaultConfig;
use crate::error::{Result, VaultError};
use crate::markdown::{self, ParsedMarkdown};
use crate::models::{encode_id, DocumentContent, DocumentRecord};
use crate::path_guard;

/// Size thresholds and filters applied while scanning and reading.
#[derive(Debug, Clone)]
pub struct ScanLimits {
    pub preview_limit_bytes: u64,
    pub max_read_bytes: u64,
    pub warn_size_bytes: u64,
    pub preview_chars: usize,
    pub max_concurrency: usize,
    pub reserved_filenames: Vec<String>,
    exclude: GlobSet,
}

impl ScanLimits {
    pub fn from_config(config: &VaultConfig) -> Result<Self> {
        let mut builder = GlobSetBuilder::new();
        for pattern in &config.exclude_globs {
            let glob = Glob::new(pattern).map_err(|e| {
                VaultError::InvalidInput(format!("invalid exclude glob '{}': {}", pattern, e))
            })?;
            builder.add(glob);
        }
        let exclude = builder
            .build()
            .map_err(|e| VaultError::InvalidInput(format!("invalid exclude globs: {}", e)))?;

        Ok(Self {
            preview_limit_bytes: config.preview_limit_bytes,
            max_read_bytes: config.max_read_bytes,
            warn_size_bytes: config.warn_size_bytes,
            preview_chars: config.preview_chars,
            max_concurrency: config.max_concurrency.max(1),
            reserved_filenames: config.reserved_filenames.clone(),
            exclude,
        })
    }

    fn is_excluded(&self, relative: &str) -> bool {
        self.exclude.is_match(relative)
    }

    fn is_reserved(&self, name: &str) -> bool {
        self.reserved_filenames
            .iter()
            .any(|r| r.eq_ignore_ascii_case(name))
    }
}

impl Default for ScanLimits {
    fn default() -> Self {
        let config = VaultConfig::default();
        Self {
            preview_limit_bytes: config.preview_limit_bytes,
            max_read_bytes: config.max_read_bytes,
            warn_size_bytes: config.warn_size_bytes,
            preview_chars: config.preview_chars,
            max_concurrency: config.max_concurrency,
            reserved_filenames: config.reserved_filenames,
            exclude: GlobSet::empty(),
        }
    }
}

/// Check that `root` passes the path guard and is a listable directory.
///
/// Returns the resolved root.
pub async fn check_vault(root: &Path) -> Result<PathBuf> {
    let root = path_guard::validate_root(root)?;

    let meta = fs::metadata(&root)
        .await
        .map_err(|e| VaultError::from_io(&e, root.display().to_string()))?;
    if !meta.is_dir() {
        return Err(VaultError::NotFound(format!(
            "{} is not a directory",
            root.display()
        )));
    }
    fs::read_dir(&root)
        .await
        .map_err(|e| VaultError::from_io(&e, root.display().to_string()))?;

    Ok(root)
}

enum Job {
    Dir(PathBuf),
    File(PathBuf),
}

enum Outcome {
    Children(Vec<Job>),
    Document(Option<DocumentRecord>),
}

/// Scan every eligible markdown document below `root`.
///
/// Result order is unspecified; see [`sort_newest_first`].
pub async fn scan(root: &Path, limits: &ScanLimits) -> Result<Vec<DocumentRecord>> {
    let started = Instant::now();
    let root = Arc::new(check_vault(root).await?);
    let limits = Arc::new(limits.clone());
    let permits = Arc::new(Semaphore::new(limits.max_concurrency));

    let mut tasks: JoinSet<Outcome> = JoinSet::new();
    let spawn = |tasks: &mut JoinSet<Outcome>, job: Job| {
        let root = root.clone();
        let limits = limits.clone();
        let permits = permits.clone();
        tasks.spawn(async move {
            // The semaphore is never closed, so acquiring cannot fail.
            let _permit = permits.acquire_owned().await.ok();
            match job {
                Job::Dir(dir) => Outcome::Children(list_dir(&root, &dir, &limits).await),
                Job::File(path) => Outcome::Document(scan_file(&root, &path, &limits).await),
            }
        });
    };

    spawn(&mut tasks, Job::Dir(root.as_ref().clone()));

    let mut records = Vec::new();
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok(Outcome::Children(jobs)) => {
                for job in jobs {
                    spawn(&mut tasks, job);
                }
            }
            Ok(Outcome::Document(Some(record))) => records.push(record),
            Ok(Outcome::Document(None)) => {}
            Err(e) => warn!(error = %e, "scan task failed"),
        }
    }

    info!(
        documents = records.len(),
        elapsed_ms = started.elapsed().as_millis() as u64,
        "vault scan complete"
    );
    Ok(records)
}

/// List one directory and turn its eligible entries into jobs.
async fn list_dir(root: &Path, dir: &Path, limits: &ScanLimits) -> Vec<Job> {
    let mut entries = match fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) => {
            warn!(dir = %dir.display(), error = %e, "skipping unreadable directory");
            return Vec::new();
        }
    };

    let mut jobs = Vec::new();
    loop {
        let entry = match entries.next_entry().await {
            Ok(Some(entry)) => entry,
            Ok(None) => break,
            Err(e) => {
                warn!(dir = %dir.display(), error = %e, "directory listing interrupted");
                break;
            }
        };

        let name = entry.file_name().to_string_lossy().to_string();
        if name.starts_with('.') {
            continue;
        }

        let path = entry.path();
        let Some(relative) = relative_path(root, &path) else {
            continue;
        };
        if limits.is_excluded(&relative) {
            debug!(path = %relative, "excluded by glob");
            continue;
        }

        let file_type = match entry.file_type().await {
            Ok(t) => t,
            Err(e) => {
                warn!(path = %relative, error = %e, "skipping entry with unreadable type");
                continue;
            }
        };

        if file_type.is_symlink() {
            debug!(path = %relative, "skipping symlink");
        } else if file_type.is_dir() {
            jobs.push(Job::Dir(path));
        } else if file_type.is_file() && is_markdown(&name) && !limits.is_reserved(&name) {
            jobs.push(Job::File(path));
        }
    }
    jobs
}

/// Build the record for one file, or `None` if it has to be skipped.
async fn scan_file(root: &Path, path: &Path, limits: &ScanLimits) -> Option<DocumentRecord> {
    let relative = relative_path(root, path)?;

    let meta = match fs::metadata(path).await {
        Ok(meta) => meta,
        Err(e) => {
            warn!(path = %relative, error = %e, "skipping file: stat failed");
            return None;
        }
    };

    let size = meta.len();
    if size > limits.max_read_bytes {
        warn!(
            path = %relative,
            size,
            limit = limits.max_read_bytes,
            "skipping file above read limit"
        );
        return None;
    }
    if size > limits.warn_size_bytes {
        warn!(path = %relative, size, "large file");
    }

    let bytes = match fs::read(path).await {
        Ok(bytes) => bytes,
        Err(e) => {
            warn!(path = %relative, error = %e, "skipping file: read failed");
            return None;
        }
    };
    let text = match String::from_utf8(bytes) {
        Ok(text) => text,
        Err(_) => {
            warn!(path = %relative, "skipping file: not valid UTF-8");
            return None;
        }
    };

    let parsed = markdown::parse_frontmatter(&text);
    if let Some(warning) = &parsed.warning {
        warn!(path = %relative, "{}", warning);
    }
    Some(build_record(&relative, &meta, &parsed, limits))
}

/// Read one document in full.
///
/// `relative` goes through the path guard before any filesystem access.
pub async fn read_document(
    root: &Path,
    relative: &str,
    limits: &ScanLimits,
) -> Result<DocumentContent> {
    let root = check_vault(root).await?;
    let path = path_guard::validate(&root, Some(relative))?;

    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    if !is_markdown(&name) {
        return Err(VaultError::InvalidInput(
            "Only markdown documents can be read".to_string(),
        ));
    }

    let meta = fs::metadata(&path)
        .await
        .map_err(|e| VaultError::from_io(&e, relative))?;
    if !meta.is_file() {
        return Err(VaultError::NotFound(relative.to_string()));
    }
    if meta.len() > limits.max_read_bytes {
        return Err(VaultError::TooLarge {
            size: meta.len(),
            limit: limits.max_read_bytes,
        });
    }

    let text = fs::read_to_string(&path)
        .await
        .map_err(|e| VaultError::from_io(&e, relative))?;
    let parsed = markdown::parse_frontmatter(&text);
    if let Some(warning) = &parsed.warning {
        warn!(path = %relative, "{}", warning);
    }

    let relative = relative_path(&root, &path).unwrap_or_else(|| relative.to_string());
    let record = build_record(&relative, &meta, &parsed, limits);
    Ok(DocumentContent {
        record,
        full_text: parsed.body,
    })
}

fn build_record(
    relative: &str,
    meta: &Metadata,
    parsed: &ParsedMarkdown,
    limits: &ScanLimits,
) -> DocumentRecord {
    let modified_at = meta
        .modified()
        .map(DateTime::<Utc>::from)
        .unwrap_or_else(|_| DateTime::<Utc>::from(SystemTime::UNIX_EPOCH));
    let created_at = meta
        .created()
        .map(DateTime::<Utc>::from)
        .unwrap_or(modified_at);

    let preview = markdown::create_preview(&parsed.body, limits.preview_chars);

    DocumentRecord {
        id: encode_id(relative),
        filename: strip_markdown_extension(relative),
        relative_path: relative.to_string(),
        size_bytes: meta.len(),
        modified_at,
        created_at,
        preview,
        is_oversized: meta.len() > limits.preview_limit_bytes,
        frontmatter: parsed.frontmatter.clone(),
    }
}

/// Most recently modified first. Equal timestamps keep their order.
pub fn sort_newest_first(records: &mut [DocumentRecord]) {
    records.sort_by(|a, b| b.modified_at.cmp(&a.modified_at));
}

fn is_markdown(name: &str) -> bool {
    let lower = name.to_ascii_lowercase();
    lower.ends_with(".md") || lower.ends_with(".markdown")
}

fn strip_markdown_extension(relative: &str) -> String {
    let name = relative.rsplit('/').next().unwrap_or(relative);
    let lower = name.to_ascii_lowercase();
    for ext in [".markdown", ".md"] {
        if lower.ends_with(ext) {
            return name[..name.len() - ext.len()].to_string();
        }
    }
    name.to_string()
}

/// `path` relative to `root`, `/`-separated.
fn relative_path(root: &Path, path: &Path) -> Option<String> {
    let relative = path.strip_prefix(root).ok()?;
    let parts: Vec<String> = relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy().to_string())
        .collect();
    if parts.is_empty() {
        None
    } else {
        Some(parts.join("/"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_markdown() {
        assert!(is_markdown("a.md"));
        assert!(is_markdown("A.MD"));
        assert!(is_markdown("notes.markdown"));
        assert!(!is_markdown("a.txt"));
        assert!(!is_markdown("md"));
    }

    #[test]
    fn test_strip_markdown_extension() {
        assert_eq!(strip_markdown_extension("logs/bug-report.md"), "bug-report");
        assert_eq!(strip_markdown_extension("Plan.Markdown"), "Plan");
        assert_eq!(strip_markdown_extension("raw"), "raw");
    }

    #[test]
    fn test_relative_path_uses_forward_slashes() {
        let root = Path::new("/vault");
        assert_eq!(
            relative_path(root, Path::new("/vault/a/b/c.md")).as_deref(),
            Some("a/b/c.md")
        );
        assert_eq!(relative_path(root, Path::new("/vault")), None);
        assert_eq!(relative_path(root, Path::new("/elsewhere/c.md")), None);
    }

    #[test]
    fn test_reserved_names_case_insensitive() {
        let limits = ScanLimits::default();
        assert!(limits.is_reserved("README.md"));
        assert!(limits.is_reserved("readme.md"));
        assert!(!limits.is_reserved("notes.md"));
    }

    #[test]
    fn test_bad_glob_rejected() {
        let config = VaultConfig {
            exclude_globs: vec!["[".to_string()],
            ..VaultConfig::default()
        };
        let err = ScanLimits::from_config(&config).unwrap_err();
        assert_eq!(err.code(), "invalid_input");
    }
}
