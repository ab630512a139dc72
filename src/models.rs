//! Core data models used throughout the retrieval pipeline.
//!
//! Documents are request-scoped: a [`DocumentRecord`] is produced by a scan
//! (or supplied by the caller), upgraded to a [`DocumentContent`] by an
//! explicit read, and packed into a [`ContextBlob`] that lives for exactly
//! one chat request.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Result, VaultError};
use crate::selector::extract_keywords;

/// Parsed front-matter: string keys, arbitrary JSON-compatible values.
pub type Frontmatter = serde_json::Map<String, serde_json::Value>;

/// Metadata for one discovered markdown document.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DocumentRecord {
    /// Reversible encoding of `relative_path`, see [`encode_id`].
    pub id: String,
    /// File name without its markdown extension.
    pub filename: String,
    /// Path below the vault root, always `/`-separated.
    pub relative_path: String,
    pub size_bytes: u64,
    pub modified_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    /// Plain-text excerpt of the body.
    pub preview: String,
    /// `size_bytes` is above the preview threshold.
    pub is_oversized: bool,
    #[serde(default)]
    pub frontmatter: Frontmatter,
}

impl DocumentRecord {
    /// First path segment, or `root` for top-level documents.
    pub fn folder(&self) -> &str {
        match self.relative_path.split_once('/') {
            Some((first, _)) => first,
            None => "root",
        }
    }
}

/// A document whose body has been read in full.
#[derive(Debug, Clone, Serialize)]
pub struct DocumentContent {
    #[serde(flatten)]
    pub record: DocumentRecord,
    /// Markdown body with the front-matter block removed.
    pub full_text: String,
}

/// One excerpt returned by the external similarity search.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VectorHit {
    pub file_path: String,
    #[serde(default)]
    pub chunk_index: i64,
    pub chunk_text: String,
    /// Heading of the section the excerpt came from.
    #[serde(default)]
    pub heading: Option<String>,
    pub similarity: f64,
}

/// Where the context of a request came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ContextSource {
    /// Documents explicitly chosen by the caller.
    Selection,
    /// Excerpts from the vector search.
    Semantic,
    /// Documents ranked by the lexical selector.
    Lexical,
    /// No context; retrieval degraded.
    Placeholder,
}

impl ContextSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContextSource::Selection => "selection",
            ContextSource::Semantic => "semantic",
            ContextSource::Lexical => "lexical",
            ContextSource::Placeholder => "placeholder",
        }
    }
}

/// The size-bounded context handed to the completion model.
#[derive(Debug, Clone, Serialize)]
pub struct ContextBlob {
    pub source: ContextSource,
    /// Included documents, in selection order.
    pub documents: Vec<DocumentContent>,
    /// Included semantic excerpts, in similarity order.
    pub hits: Vec<VectorHit>,
    /// Bytes charged against the cap (text plus per-entry overhead).
    pub cumulative_bytes: usize,
    /// At least one candidate was dropped to respect the cap.
    pub truncated: bool,
    /// Why retrieval fell back to the placeholder, if it did.
    pub degraded: Option<String>,
}

impl ContextBlob {
    pub fn placeholder(reason: impl Into<String>) -> Self {
        Self {
            source: ContextSource::Placeholder,
            documents: Vec::new(),
            hits: Vec::new(),
            cumulative_bytes: 0,
            truncated: false,
            degraded: Some(reason.into()),
        }
    }

    pub fn is_degraded(&self) -> bool {
        self.degraded.is_some()
    }

    pub fn len(&self) -> usize {
        self.documents.len() + self.hits.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A validated caller question.
#[derive(Debug, Clone, PartialEq)]
pub struct Query {
    raw: String,
    keywords: Vec<String>,
}

impl Query {
    /// Validate length (in characters) and extract keywords.
    pub fn parse(raw: &str, max_chars: usize) -> Result<Self> {
        if raw.trim().is_empty() {
            return Err(VaultError::InvalidInput("Message cannot be empty".to_string()));
        }
        if raw.chars().count() > max_chars {
            return Err(VaultError::InvalidInput(format!(
                "Message too long (max {} characters)",
                max_chars
            )));
        }
        Ok(Self {
            raw: raw.to_string(),
            keywords: extract_keywords(raw),
        })
    }

    pub fn raw(&self) -> &str {
        &self.raw
    }

    pub fn keywords(&self) -> &[String] {
        &self.keywords
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// One message of a conversation. Immutable once built.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChatTurn {
    role: Role,
    content: String,
}

impl ChatTurn {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn content(&self) -> &str {
        &self.content
    }
}

/// Encode a relative path as a URL-safe document id.
pub fn encode_id(relative_path: &str) -> String {
    URL_SAFE_NO_PAD.encode(relative_path.as_bytes())
}

/// Decode a document id back into its relative path.
pub fn decode_id(id: &str) -> Result<String> {
    let bytes = URL_SAFE_NO_PAD
        .decode(id.trim_end_matches('='))
        .map_err(|_| VaultError::InvalidInput("Invalid file id".to_string()))?;
    String::from_utf8(bytes).map_err(|_| VaultError::InvalidInput("Invalid file id".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_id_roundtrip() {
        for path in [
            "a.md",
            "product-logs/bug-report-001.md",
            "deep/nested/dir/with spaces.md",
            "ünïcödé/ノート.md",
        ] {
            let id = encode_id(path);
            assert!(!id.contains('/') && !id.contains('+') && !id.contains('='));
            assert_eq!(decode_id(&id).unwrap(), path);
        }
    }

    #[test]
    fn test_decode_accepts_padding() {
        // "ab" encodes to "YWI" without padding.
        assert_eq!(decode_id("YWI=").unwrap(), "ab");
    }

    #[test]
    fn test_decode_invalid_id() {
        let err = decode_id("!!!not base64!!!").unwrap_err();
        assert_eq!(err.code(), "invalid_input");

        // Valid base64 of invalid UTF-8 (0xff 0xfe).
        let err = decode_id("__4").unwrap_err();
        assert_eq!(err.code(), "invalid_input");
    }

    #[test]
    fn test_query_length_bounds() {
        let ok = "x".repeat(1000);
        assert!(Query::parse(&ok, 1000).is_ok());

        let long = "x".repeat(1001);
        let err = Query::parse(&long, 1000).unwrap_err();
        assert_eq!(err.code(), "invalid_input");

        assert!(Query::parse("", 1000).is_err());
        assert!(Query::parse("   \n", 1000).is_err());
    }

    #[test]
    fn test_query_counts_characters_not_bytes() {
        let accented = "é".repeat(1000);
        assert!(Query::parse(&accented, 1000).is_ok());
    }

    #[test]
    fn test_query_keywords() {
        let q = Query::parse("What bugs are mentioned?", 1000).unwrap();
        assert_eq!(q.keywords(), ["bugs", "mentioned"]);
    }

    #[test]
    fn test_folder() {
        let mut doc = DocumentRecord {
            id: encode_id("logs/a.md"),
            filename: "a".into(),
            relative_path: "logs/a.md".into(),
            size_bytes: 1,
            modified_at: Utc::now(),
            created_at: Utc::now(),
            preview: String::new(),
            is_oversized: false,
            frontmatter: Frontmatter::new(),
        };
        assert_eq!(doc.folder(), "logs");
        doc.relative_path = "a.md".into();
        assert_eq!(doc.folder(), "root");
    }
}
