use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub csv: CsvConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub processor: ProcessorConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct CsvConfig {
    /// Directory where raw CSV files live, addressed as `<dir>/<source_id>.csv`.
    #[serde(default = "default_csv_dir")]
    pub dir: PathBuf,
}

impl Default for CsvConfig {
    fn default() -> Self {
        Self {
            dir: default_csv_dir(),
        }
    }
}

fn default_csv_dir() -> PathBuf {
    PathBuf::from("./data/csv")
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChunkingConfig {
    /// Data rows per row-window chunk (R).
    #[serde(default = "default_rows_per_chunk")]
    pub rows_per_chunk: usize,
    /// Overlapping rows between consecutive windows (O), clamped to R-1.
    #[serde(default = "default_overlap_rows")]
    pub overlap_rows: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            rows_per_chunk: default_rows_per_chunk(),
            overlap_rows: default_overlap_rows(),
        }
    }
}

fn default_rows_per_chunk() -> usize {
    20
}
fn default_overlap_rows() -> usize {
    4
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    /// `"mock"` or `"openai"`.
    #[serde(default = "default_embedding_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    /// Batch size for embedding API calls.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Initial batch size for vector-store writes (overridable via
    /// `EMBEDDINGS_INSERT_BATCH_SIZE`).
    #[serde(default = "default_insert_batch_size")]
    pub insert_batch_size: usize,
    /// Bounded worker pool size for batch embedding.
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// When true, refuse to fall back to the mock provider
    /// (overridable via `EMBEDDINGS_STRICT_MODE`).
    #[serde(default)]
    pub strict: bool,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_embedding_provider(),
            model: None,
            batch_size: default_batch_size(),
            insert_batch_size: default_insert_batch_size(),
            workers: default_workers(),
            max_retries: default_max_retries(),
            timeout_secs: default_timeout_secs(),
            strict: false,
        }
    }
}

fn default_embedding_provider() -> String {
    "mock".to_string()
}
fn default_batch_size() -> usize {
    64
}
fn default_insert_batch_size() -> usize {
    100
}
fn default_workers() -> usize {
    4
}
fn default_max_retries() -> u32 {
    5
}
fn default_timeout_secs() -> u64 {
    30
}

#[derive(Debug, Deserialize, Clone)]
pub struct LlmConfig {
    /// `"http"` or `"disabled"`.
    #[serde(default = "default_llm_provider")]
    pub provider: String,
    #[serde(default = "default_llm_base_url")]
    pub base_url: String,
    #[serde(default = "default_llm_model")]
    pub model: String,
    #[serde(default = "default_llm_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: default_llm_provider(),
            base_url: default_llm_base_url(),
            model: default_llm_model(),
            timeout_secs: default_llm_timeout_secs(),
        }
    }
}

fn default_llm_provider() -> String {
    "disabled".to_string()
}
fn default_llm_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}
fn default_llm_model() -> String {
    "gpt-4o-mini".to_string()
}
fn default_llm_timeout_secs() -> u64 {
    60
}

#[derive(Debug, Deserialize, Clone)]
pub struct ProcessorConfig {
    /// Minimum similarity for retrieved chunks.
    #[serde(default = "default_similarity_threshold")]
    pub similarity_threshold: f32,
    /// Top-K chunks retrieved per turn.
    #[serde(default = "default_retrieve_k")]
    pub retrieve_k: usize,
    /// Fraction of required aspects that must be covered for the RAG-only path.
    #[serde(default = "default_coverage_threshold")]
    pub coverage_threshold: f64,
    /// Minimum retrieved chunks for the RAG-only path.
    #[serde(default = "default_min_chunks")]
    pub min_chunks: usize,
    /// Questions under this many tokens take the fallback path when coverage
    /// is insufficient; longer ones are fragmented.
    #[serde(default = "default_short_question_tokens")]
    pub short_question_tokens: usize,
    /// Per-LLM-call token budget for the fragmented path.
    #[serde(default = "default_token_budget")]
    pub token_budget: usize,
    #[serde(default = "default_cache_ttl_hours")]
    pub cache_ttl_hours: i64,
    /// Per-call deadline for store operations, in milliseconds.
    #[serde(default = "default_store_timeout_ms")]
    pub store_timeout_ms: u64,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            similarity_threshold: default_similarity_threshold(),
            retrieve_k: default_retrieve_k(),
            coverage_threshold: default_coverage_threshold(),
            min_chunks: default_min_chunks(),
            short_question_tokens: default_short_question_tokens(),
            token_budget: default_token_budget(),
            cache_ttl_hours: default_cache_ttl_hours(),
            store_timeout_ms: default_store_timeout_ms(),
        }
    }
}

fn default_similarity_threshold() -> f32 {
    0.7
}
fn default_retrieve_k() -> usize {
    6
}
fn default_coverage_threshold() -> f64 {
    0.8
}
fn default_min_chunks() -> usize {
    3
}
fn default_short_question_tokens() -> usize {
    50
}
fn default_token_budget() -> usize {
    6000
}
fn default_cache_ttl_hours() -> i64 {
    24
}
fn default_store_timeout_ms() -> u64 {
    10_000
}

fn env_flag(name: &str) -> Option<bool> {
    std::env::var(name).ok().map(|v| {
        matches!(
            v.trim().to_ascii_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        )
    })
}

impl Config {
    /// Apply environment overrides after parsing.
    fn apply_env(&mut self) {
        if env_flag("EMBEDDINGS_FORCE_MOCK") == Some(true) {
            self.embedding.provider = "mock".to_string();
        }
        if let Some(strict) = env_flag("EMBEDDINGS_STRICT_MODE") {
            self.embedding.strict = strict;
        }
        if let Ok(raw) = std::env::var("EMBEDDINGS_INSERT_BATCH_SIZE") {
            if let Ok(n) = raw.trim().parse::<usize>() {
                if n > 0 {
                    self.embedding.insert_batch_size = n;
                }
            }
        }
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let mut config: Config =
        toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    config.apply_env();
    validate(&config)?;
    Ok(config)
}

fn validate(config: &Config) -> Result<()> {
    if config.chunking.rows_per_chunk == 0 {
        anyhow::bail!("chunking.rows_per_chunk must be > 0");
    }
    if !(0.0..=1.0).contains(&config.processor.coverage_threshold) {
        anyhow::bail!("processor.coverage_threshold must be in [0.0, 1.0]");
    }
    if !(0.0..=1.0).contains(&config.processor.similarity_threshold) {
        anyhow::bail!("processor.similarity_threshold must be in [0.0, 1.0]");
    }
    if config.processor.retrieve_k == 0 {
        anyhow::bail!("processor.retrieve_k must be >= 1");
    }
    if config.processor.token_budget == 0 {
        anyhow::bail!("processor.token_budget must be > 0");
    }
    match config.embedding.provider.as_str() {
        "mock" | "openai" => {}
        other => anyhow::bail!(
            "Unknown embedding provider: '{}'. Must be mock or openai.",
            other
        ),
    }
    if config.embedding.strict && config.embedding.provider == "mock" {
        anyhow::bail!("embedding strict mode refuses the mock provider");
    }
    match config.llm.provider.as_str() {
        "http" | "disabled" => {}
        other => anyhow::bail!("Unknown llm provider: '{}'. Must be http or disabled.", other),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(content: &str) -> Result<Config> {
        let mut config: Config = toml::from_str(content)?;
        config.apply_env();
        validate(&config)?;
        Ok(config)
    }

    #[test]
    fn test_minimal_config_uses_defaults() {
        let config = parse("[db]\npath = \"./data/tabletalk.sqlite\"\n").unwrap();
        assert_eq!(config.chunking.rows_per_chunk, 20);
        assert_eq!(config.chunking.overlap_rows, 4);
        assert_eq!(config.embedding.provider, "mock");
        assert_eq!(config.processor.retrieve_k, 6);
        assert_eq!(config.processor.token_budget, 6000);
        assert_eq!(config.processor.cache_ttl_hours, 24);
    }

    #[test]
    fn test_invalid_coverage_rejected() {
        let result = parse(
            "[db]\npath = \"x.sqlite\"\n[processor]\ncoverage_threshold = 1.5\n",
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_unknown_embedding_provider_rejected() {
        let result = parse("[db]\npath = \"x.sqlite\"\n[embedding]\nprovider = \"quantum\"\n");
        assert!(result.is_err());
    }

    #[test]
    fn test_strict_mode_refuses_mock() {
        let result = parse(
            "[db]\npath = \"x.sqlite\"\n[embedding]\nprovider = \"mock\"\nstrict = true\n",
        );
        assert!(result.is_err());
    }
}
