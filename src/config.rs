//! TOML configuration.
//!
//! Every section is optional and every field has a default, so an empty
//! file (or [`Config::default`]) is a working configuration. Credentials are
//! never stored in the file; each remote section names the environment
//! variable that holds its key.
//!
//! ```toml
//! [vault]
//! default_root = "/home/me/notes"
//!
//! [retrieval]
//! context_cap_bytes = 50000
//!
//! [retrieval.weights]
//! filename = 3
//!
//! [completion]
//! model = "anthropic/claude-3.5-sonnet"
//! ```

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub vault: VaultConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub vector: VectorConfig,
    #[serde(default)]
    pub completion: CompletionConfig,
    #[serde(default)]
    pub server: ServerConfig,
}

// ============ [vault] ============

#[derive(Debug, Deserialize, Clone)]
pub struct VaultConfig {
    /// Root used when a request does not name one.
    #[serde(default)]
    pub default_root: Option<PathBuf>,
    /// Documents above this size are flagged `is_oversized`.
    #[serde(default = "default_preview_limit")]
    pub preview_limit_bytes: u64,
    /// Documents above this size are never read.
    #[serde(default = "default_max_read")]
    pub max_read_bytes: u64,
    /// Documents above this size are logged while scanning.
    #[serde(default = "default_warn_size")]
    pub warn_size_bytes: u64,
    #[serde(default = "default_preview_chars")]
    pub preview_chars: usize,
    /// Upper bound on simultaneous filesystem operations during a scan.
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
    #[serde(default)]
    pub exclude_globs: Vec<String>,
    #[serde(default = "default_reserved_filenames")]
    pub reserved_filenames: Vec<String>,
}

impl Default for VaultConfig {
    fn default() -> Self {
        Self {
            default_root: None,
            preview_limit_bytes: default_preview_limit(),
            max_read_bytes: default_max_read(),
            warn_size_bytes: default_warn_size(),
            preview_chars: default_preview_chars(),
            max_concurrency: default_max_concurrency(),
            exclude_globs: Vec::new(),
            reserved_filenames: default_reserved_filenames(),
        }
    }
}

fn default_preview_limit() -> u64 {
    1_000_000
}
fn default_max_read() -> u64 {
    10_000_000
}
fn default_warn_size() -> u64 {
    500_000
}
fn default_preview_chars() -> usize {
    200
}
fn default_max_concurrency() -> usize {
    32
}
fn default_reserved_filenames() -> Vec<String> {
    vec!["README.md".to_string()]
}

// ============ [retrieval] ============

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    #[serde(default = "default_context_cap")]
    pub context_cap_bytes: usize,
    /// Bytes charged per document on top of its text (path, headers, separators).
    #[serde(default = "default_overhead")]
    pub per_document_overhead: usize,
    /// Documents picked by the lexical selector.
    #[serde(default = "default_max_files")]
    pub max_files: usize,
    #[serde(default = "default_match_count")]
    pub match_count: usize,
    #[serde(default = "default_threshold")]
    pub similarity_threshold: f64,
    #[serde(default = "default_max_query_chars")]
    pub max_query_chars: usize,
    #[serde(default = "default_max_rag_query_chars")]
    pub max_rag_query_chars: usize,
    #[serde(default)]
    pub weights: ScoringWeights,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            context_cap_bytes: default_context_cap(),
            per_document_overhead: default_overhead(),
            max_files: default_max_files(),
            match_count: default_match_count(),
            similarity_threshold: default_threshold(),
            max_query_chars: default_max_query_chars(),
            max_rag_query_chars: default_max_rag_query_chars(),
            weights: ScoringWeights::default(),
        }
    }
}

fn default_context_cap() -> usize {
    50_000
}
fn default_overhead() -> usize {
    100
}
fn default_max_files() -> usize {
    5
}
fn default_match_count() -> usize {
    10
}
fn default_threshold() -> f64 {
    0.3
}
fn default_max_query_chars() -> usize {
    1000
}
fn default_max_rag_query_chars() -> usize {
    500
}

/// Points awarded per keyword by match location.
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct ScoringWeights {
    #[serde(default = "default_filename_weight")]
    pub filename: u32,
    #[serde(default = "default_path_weight")]
    pub path: u32,
    #[serde(default = "default_preview_weight")]
    pub preview: u32,
    #[serde(default = "default_tag_weight")]
    pub tag: u32,
    #[serde(default = "default_recency_bonus")]
    pub recency_bonus: u32,
    #[serde(default = "default_recency_days")]
    pub recency_days: i64,
}

impl Default for ScoringWeights {
    fn default() -> Self {
        Self {
            filename: default_filename_weight(),
            path: default_path_weight(),
            preview: default_preview_weight(),
            tag: default_tag_weight(),
            recency_bonus: default_recency_bonus(),
            recency_days: default_recency_days(),
        }
    }
}

fn default_filename_weight() -> u32 {
    3
}
fn default_path_weight() -> u32 {
    2
}
fn default_preview_weight() -> u32 {
    1
}
fn default_tag_weight() -> u32 {
    2
}
fn default_recency_bonus() -> u32 {
    1
}
fn default_recency_days() -> i64 {
    7
}

// ============ [embedding] ============

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_disabled")]
    pub provider: String,
    #[serde(default = "default_embedding_model")]
    pub model: String,
    #[serde(default = "default_embedding_url")]
    pub url: String,
    #[serde(default = "default_openai_key_env")]
    pub api_key_env: String,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_disabled(),
            model: default_embedding_model(),
            url: default_embedding_url(),
            api_key_env: default_openai_key_env(),
            max_retries: default_max_retries(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

impl EmbeddingConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

fn default_disabled() -> String {
    "disabled".to_string()
}
fn default_embedding_model() -> String {
    "text-embedding-ada-002".to_string()
}
fn default_embedding_url() -> String {
    "https://api.openai.com/v1".to_string()
}
fn default_openai_key_env() -> String {
    "OPENAI_API_KEY".to_string()
}
fn default_max_retries() -> u32 {
    2
}
fn default_timeout_secs() -> u64 {
    30
}

// ============ [vector] ============

#[derive(Debug, Deserialize, Clone)]
pub struct VectorConfig {
    #[serde(default = "default_disabled")]
    pub provider: String,
    #[serde(default)]
    pub url: Option<String>,
    /// Name of the similarity-search RPC.
    #[serde(default = "default_vector_function")]
    pub function: String,
    #[serde(default = "default_supabase_key_env")]
    pub api_key_env: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for VectorConfig {
    fn default() -> Self {
        Self {
            provider: default_disabled(),
            url: None,
            function: default_vector_function(),
            api_key_env: default_supabase_key_env(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

impl VectorConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

fn default_vector_function() -> String {
    "match_markdown_chunks".to_string()
}
fn default_supabase_key_env() -> String {
    "SUPABASE_SERVICE_ROLE_KEY".to_string()
}

// ============ [completion] ============

#[derive(Debug, Deserialize, Clone)]
pub struct CompletionConfig {
    #[serde(default = "default_completion_url")]
    pub base_url: String,
    #[serde(default = "default_completion_model")]
    pub model: String,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// First backoff delay; doubles on every further attempt.
    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,
    #[serde(default = "default_completion_key_env")]
    pub api_key_env: String,
    #[serde(default = "default_site_url")]
    pub site_url: String,
    #[serde(default = "default_app_title")]
    pub app_title: String,
    /// A stream that stays silent this long is closed with a failure notice.
    #[serde(default = "default_timeout_secs")]
    pub stream_idle_timeout_secs: u64,
}

impl Default for CompletionConfig {
    fn default() -> Self {
        Self {
            base_url: default_completion_url(),
            model: default_completion_model(),
            max_tokens: default_max_tokens(),
            temperature: default_temperature(),
            max_retries: default_max_retries(),
            retry_base_delay_ms: default_retry_base_delay_ms(),
            api_key_env: default_completion_key_env(),
            site_url: default_site_url(),
            app_title: default_app_title(),
            stream_idle_timeout_secs: default_timeout_secs(),
        }
    }
}

fn default_completion_url() -> String {
    "https://openrouter.ai/api/v1".to_string()
}
fn default_completion_model() -> String {
    "anthropic/claude-3.5-sonnet".to_string()
}
fn default_max_tokens() -> u32 {
    2000
}
fn default_temperature() -> f32 {
    0.7
}
fn default_retry_base_delay_ms() -> u64 {
    1000
}
fn default_completion_key_env() -> String {
    "OPENROUTER_API_KEY".to_string()
}
fn default_site_url() -> String {
    "http://localhost:7340".to_string()
}
fn default_app_title() -> String {
    "vault-context".to_string()
}

// ============ [server] ============

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
    /// Deadline for retrieval plus stream establishment of one chat request.
    #[serde(default = "default_timeout_secs")]
    pub request_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            request_timeout_secs: default_timeout_secs(),
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1:7340".to_string()
}

/// Read an environment variable, treating an empty value as absent.
pub fn read_secret(var: &str) -> Option<String> {
    std::env::var(var).ok().filter(|v| !v.trim().is_empty())
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

const MAX_RECENCY_DAYS: i64 = 36_500;
const MAX_RETRY_BASE_DELAY_MS: u64 = 60_000;

fn validate(config: &Config) -> Result<()> {
    if config.vault.preview_limit_bytes > config.vault.max_read_bytes {
        bail!("vault.preview_limit_bytes must be <= vault.max_read_bytes");
    }
    if config.vault.max_concurrency == 0 {
        bail!("vault.max_concurrency must be > 0");
    }
    if let Some(root) = &config.vault.default_root {
        if !root.is_absolute() {
            bail!("vault.default_root must be an absolute path");
        }
    }

    if config.retrieval.context_cap_bytes == 0 {
        bail!("retrieval.context_cap_bytes must be > 0");
    }
    if config.retrieval.max_files == 0 {
        bail!("retrieval.max_files must be >= 1");
    }
    if !(0.0..=1.0).contains(&config.retrieval.similarity_threshold) {
        bail!("retrieval.similarity_threshold must be in [0.0, 1.0]");
    }
    if config.retrieval.max_query_chars == 0 {
        bail!("retrieval.max_query_chars must be > 0");
    }
    if !(0..=MAX_RECENCY_DAYS).contains(&config.retrieval.weights.recency_days) {
        bail!(
            "retrieval.weights.recency_days must be in [0, {}]",
            MAX_RECENCY_DAYS
        );
    }

    match config.embedding.provider.as_str() {
        "disabled" | "openai" => {}
        other => bail!(
            "Unknown embedding provider: '{}'. Must be disabled or openai.",
            other
        ),
    }

    match config.vector.provider.as_str() {
        "disabled" => {}
        "supabase" => {
            if config.vector.url.is_none() {
                bail!("vector.url must be set when provider is 'supabase'");
            }
            if !config.embedding.is_enabled() {
                bail!("vector search requires an [embedding] provider");
            }
        }
        other => bail!(
            "Unknown vector provider: '{}'. Must be disabled or supabase.",
            other
        ),
    }

    if !(0.0..=2.0).contains(&config.completion.temperature) {
        bail!("completion.temperature must be in [0.0, 2.0]");
    }
    if config.completion.retry_base_delay_ms > MAX_RETRY_BASE_DELAY_MS {
        bail!(
            "completion.retry_base_delay_ms must be <= {}",
            MAX_RETRY_BASE_DELAY_MS
        );
    }
    if config.server.request_timeout_secs == 0 {
        bail!("server.request_timeout_secs must be > 0");
    }

    Ok(())
}
