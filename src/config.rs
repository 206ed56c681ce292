//! TOML configuration parsing and validation.
//!
//! A config file is loaded with [`load_config`], which applies environment
//! overrides and validates every section before returning. Sections other
//! than `[db]` and `[corpus]` are optional and fall back to defaults.
//!
//! | Env var | Effect |
//! |---------|--------|
//! | `SENTINEL_CORPUS_ROOT` | overrides `[corpus].root` (must be absolute) |
//! | `SENTINEL_API_KEYS` | comma-separated keys accepted in `X-API-Key` |
//! | `OPENAI_API_KEY` | required by the `openai` embedding/generation providers |

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

pub const CORPUS_ROOT_ENV: &str = "SENTINEL_CORPUS_ROOT";
pub const API_KEYS_ENV: &str = "SENTINEL_API_KEYS";

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    pub corpus: CorpusConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub generation: GenerationConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub security: SecurityConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    /// SQLite file holding documents, chunks and vectors. `":memory:"` keeps
    /// the index in process memory only.
    pub path: PathBuf,
}

impl DbConfig {
    pub fn is_in_memory(&self) -> bool {
        self.path.as_os_str() == ":memory:"
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct CorpusConfig {
    /// Every ingestion path must resolve under this directory.
    pub root: PathBuf,
    #[serde(default = "default_include_globs")]
    pub include_globs: Vec<String>,
    #[serde(default)]
    pub exclude_globs: Vec<String>,
    #[serde(default)]
    pub follow_symlinks: bool,
}

fn default_include_globs() -> Vec<String> {
    vec![
        "**/*.txt".to_string(),
        "**/*.md".to_string(),
        "**/*.pdf".to_string(),
    ]
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChunkingConfig {
    /// Chunk length in characters.
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    #[serde(default = "default_chunk_overlap")]
    pub chunk_overlap: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            chunk_overlap: default_chunk_overlap(),
        }
    }
}

fn default_chunk_size() -> usize {
    500
}
fn default_chunk_overlap() -> usize {
    50
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    /// `hashing`, `ollama`, `openai`, or `fastembed`.
    #[serde(default = "default_embedding_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default = "default_dims")]
    pub dims: usize,
    /// Base URL for the Ollama provider.
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_embedding_provider(),
            model: None,
            dims: default_dims(),
            url: None,
            batch_size: default_batch_size(),
            max_retries: default_max_retries(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

fn default_embedding_provider() -> String {
    "hashing".to_string()
}
fn default_dims() -> usize {
    384
}
fn default_batch_size() -> usize {
    64
}
fn default_max_retries() -> u32 {
    3
}
fn default_timeout_secs() -> u64 {
    30
}

#[derive(Debug, Deserialize, Clone)]
pub struct GenerationConfig {
    /// `extractive`, `ollama`, `openai`, or `disabled`.
    #[serde(default = "default_generation_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    /// Upper bound on a single backend call.
    #[serde(default = "default_generation_timeout_ms")]
    pub timeout_ms: u64,
    /// Delay before the single retry after a timeout.
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
    /// Concurrent backend calls allowed.
    #[serde(default = "default_max_in_flight")]
    pub max_in_flight: usize,
    /// How long a request may wait for a free slot before `Backpressure`.
    #[serde(default = "default_queue_wait_ms")]
    pub queue_wait_ms: u64,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            provider: default_generation_provider(),
            model: None,
            url: None,
            temperature: default_temperature(),
            timeout_ms: default_generation_timeout_ms(),
            retry_backoff_ms: default_retry_backoff_ms(),
            max_in_flight: default_max_in_flight(),
            queue_wait_ms: default_queue_wait_ms(),
        }
    }
}

fn default_generation_provider() -> String {
    "extractive".to_string()
}
fn default_temperature() -> f32 {
    0.1
}
fn default_generation_timeout_ms() -> u64 {
    120_000
}
fn default_retry_backoff_ms() -> u64 {
    250
}
fn default_max_in_flight() -> usize {
    1
}
fn default_queue_wait_ms() -> u64 {
    5_000
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    /// Hits scoring below this are dropped. `0.0` keeps everything non-negative.
    #[serde(default)]
    pub min_score: f32,
    /// `cosine` or `dot`.
    #[serde(default = "default_metric")]
    pub metric: String,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            top_k: default_top_k(),
            min_score: 0.0,
            metric: default_metric(),
        }
    }
}

fn default_top_k() -> usize {
    5
}
fn default_metric() -> String {
    "cosine".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct SecurityConfig {
    /// Queries are truncated to this many characters before matching.
    #[serde(default = "default_max_query_chars")]
    pub max_query_chars: usize,
    /// Case-insensitive substrings that indicate code execution attempts.
    #[serde(default = "default_deny_patterns")]
    pub deny_patterns: Vec<String>,
    /// Case-insensitive regexes matched against whitespace-normalized text.
    #[serde(default = "default_override_patterns")]
    pub override_patterns: Vec<String>,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            max_query_chars: default_max_query_chars(),
            deny_patterns: default_deny_patterns(),
            override_patterns: default_override_patterns(),
        }
    }
}

fn default_max_query_chars() -> usize {
    1000
}

pub fn default_deny_patterns() -> Vec<String> {
    [
        "import ",
        "exec(",
        "eval(",
        "__import__",
        "os.",
        "sys.",
        "subprocess",
        "open(",
        "file(",
        "compile(",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

pub fn default_override_patterns() -> Vec<String> {
    [
        r"\b(ignore|disregard|forget|skip|override)\b.{0,40}\b(instructions?|rules?|prompts?|directives?|context)\b",
        r"\b(reveal|show|print|repeat|leak|output)\b.{0,30}\bsystem\s+(prompt|instructions?|message)\b",
        r"\byou\s+are\s+now\b",
        r"\bact\s+as\b.{0,30}\b(developer|admin|root|jailbreak|dan)\b",
        r"\bnew\s+instructions?\s*:",
        r"</?\s*(system|assistant)\s*>",
        r"\[\s*(system|inst)\s*\]",
        r"\babaikan\b.{0,40}\b(instruksi|perintah|aturan)\b",
        r"\b(tampilkan|ungkapkan)\b.{0,30}\bprompt\s+sistem\b",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
    /// Per-request deadline for `POST /query`.
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    #[serde(default = "default_cors_origins")]
    pub cors_origins: Vec<String>,
    /// When true, requests must carry a key from `SENTINEL_API_KEYS`.
    #[serde(default = "default_require_api_key")]
    pub require_api_key: bool,
    /// Skip the document deny-list for inline `POST /ingest` uploads.
    #[serde(default)]
    pub trust_uploads: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            request_timeout_ms: default_request_timeout_ms(),
            cors_origins: default_cors_origins(),
            require_api_key: default_require_api_key(),
            trust_uploads: false,
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1:8000".to_string()
}
fn default_request_timeout_ms() -> u64 {
    150_000
}
fn default_cors_origins() -> Vec<String> {
    vec!["http://localhost:3000".to_string()]
}
fn default_require_api_key() -> bool {
    true
}

#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    /// Default `EnvFilter` directive; `RUST_LOG` takes precedence.
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Config {
    /// In-memory configuration rooted at `corpus_root`, with offline
    /// backends. Used by tests and by commands that run without a file.
    pub fn minimal(corpus_root: impl Into<PathBuf>) -> Self {
        Self {
            db: DbConfig {
                path: PathBuf::from(":memory:"),
            },
            corpus: CorpusConfig {
                root: corpus_root.into(),
                include_globs: default_include_globs(),
                exclude_globs: Vec::new(),
                follow_symlinks: false,
            },
            chunking: ChunkingConfig::default(),
            embedding: EmbeddingConfig::default(),
            generation: GenerationConfig::default(),
            retrieval: RetrievalConfig::default(),
            security: SecurityConfig::default(),
            server: ServerConfig {
                require_api_key: false,
                ..ServerConfig::default()
            },
            logging: LoggingConfig::default(),
        }
    }

    /// Accepted API keys, read from the environment on each call.
    pub fn api_keys(&self) -> Vec<String> {
        std::env::var(API_KEYS_ENV)
            .unwrap_or_default()
            .split(',')
            .map(|k| k.trim().to_string())
            .filter(|k| !k.is_empty())
            .collect()
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let mut config: Config =
        toml::from_str(&content).with_context(|| "Failed to parse config file")?;

    if let Ok(root) = std::env::var(CORPUS_ROOT_ENV) {
        if !root.trim().is_empty() {
            config.corpus.root = PathBuf::from(root);
        }
    }

    validate(&config)?;
    Ok(config)
}

/// Validate a parsed config. Called by [`load_config`]; exposed for configs
/// built in code.
pub fn validate(config: &Config) -> Result<()> {
    if !config.corpus.root.is_absolute() {
        bail!(
            "corpus.root must be an absolute path (got '{}'); set it in the config or via {}",
            config.corpus.root.display(),
            CORPUS_ROOT_ENV
        );
    }

    if config.chunking.chunk_size == 0 {
        bail!("chunking.chunk_size must be > 0");
    }
    if config.chunking.chunk_overlap >= config.chunking.chunk_size {
        bail!("chunking.chunk_overlap must be < chunking.chunk_size");
    }

    if config.embedding.dims == 0 {
        bail!("embedding.dims must be > 0");
    }
    if config.embedding.batch_size == 0 {
        bail!("embedding.batch_size must be > 0");
    }
    match config.embedding.provider.as_str() {
        "hashing" | "fastembed" => {}
        "ollama" | "openai" => {
            if config.embedding.model.is_none() {
                bail!(
                    "embedding.model must be specified when provider is '{}'",
                    config.embedding.provider
                );
            }
        }
        other => bail!(
            "Unknown embedding provider: '{}'. Must be hashing, ollama, openai, or fastembed.",
            other
        ),
    }

    match config.generation.provider.as_str() {
        "extractive" | "disabled" => {}
        "ollama" | "openai" => {
            if config.generation.model.is_none() {
                bail!(
                    "generation.model must be specified when provider is '{}'",
                    config.generation.provider
                );
            }
        }
        other => bail!(
            "Unknown generation provider: '{}'. Must be extractive, ollama, openai, or disabled.",
            other
        ),
    }
    if config.generation.max_in_flight == 0 {
        bail!("generation.max_in_flight must be >= 1");
    }
    if config.generation.timeout_ms == 0 {
        bail!("generation.timeout_ms must be > 0");
    }

    if config.retrieval.top_k == 0 {
        bail!("retrieval.top_k must be >= 1");
    }
    if !(-1.0..=1.0).contains(&config.retrieval.min_score) && config.retrieval.metric == "cosine" {
        bail!("retrieval.min_score must be in [-1.0, 1.0] for the cosine metric");
    }
    match config.retrieval.metric.as_str() {
        "cosine" | "dot" => {}
        other => bail!("Unknown retrieval metric: '{}'. Must be cosine or dot.", other),
    }

    if config.security.max_query_chars == 0 {
        bail!("security.max_query_chars must be > 0");
    }
    for pattern in &config.security.override_patterns {
        regex::Regex::new(pattern)
            .with_context(|| format!("security.override_patterns: invalid regex '{}'", pattern))?;
    }

    if config.server.request_timeout_ms == 0 {
        bail!("server.request_timeout_ms must be > 0");
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(extra: &str) -> Result<Config> {
        let content = format!(
            r#"
[db]
path = ":memory:"

[corpus]
root = "/data/corpus"
{}
"#,
            extra
        );
        let config: Config = toml::from_str(&content)?;
        validate(&config)?;
        Ok(config)
    }

    #[test]
    fn test_defaults_apply() {
        let cfg = parse("").unwrap();
        assert_eq!(cfg.chunking.chunk_size, 500);
        assert_eq!(cfg.chunking.chunk_overlap, 50);
        assert_eq!(cfg.embedding.provider, "hashing");
        assert_eq!(cfg.generation.provider, "extractive");
        assert_eq!(cfg.retrieval.metric, "cosine");
        assert!(cfg.db.is_in_memory());
        assert!(cfg.server.require_api_key);
        assert!(!cfg.security.deny_patterns.is_empty());
    }

    #[test]
    fn test_relative_corpus_root_rejected() {
        let content = r#"
[db]
path = ":memory:"

[corpus]
root = "data/corpus"
"#;
        let config: Config = toml::from_str(content).unwrap();
        let err = validate(&config).unwrap_err();
        assert!(err.to_string().contains("absolute"));
    }

    #[test]
    fn test_overlap_not_below_size_rejected() {
        let err = parse("[chunking]\nchunk_size = 100\nchunk_overlap = 100\n").unwrap_err();
        assert!(err.to_string().contains("chunk_overlap"));
    }

    #[test]
    fn test_unknown_provider_rejected() {
        let err = parse("[embedding]\nprovider = \"magic\"\n").unwrap_err();
        assert!(err.to_string().contains("Unknown embedding provider"));
    }

    #[test]
    fn test_ollama_generation_requires_model() {
        let err = parse("[generation]\nprovider = \"ollama\"\n").unwrap_err();
        assert!(err.to_string().contains("generation.model"));
    }

    #[test]
    fn test_invalid_override_regex_rejected() {
        let err = parse("[security]\noverride_patterns = [\"(unclosed\"]\n").unwrap_err();
        assert!(err.to_string().contains("override_patterns"));
    }

    #[test]
    fn test_default_override_patterns_compile() {
        for p in default_override_patterns() {
            regex::Regex::new(&p).unwrap();
        }
    }

    #[test]
    fn test_minimal_is_valid() {
        let cfg = Config::minimal("/tmp/corpus");
        validate(&cfg).unwrap();
        assert!(!cfg.server.require_api_key);
    }
}
