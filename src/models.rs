//! Core data models for the hybrid query core.
//!
//! These types represent the chunks, sessions, interactions, and answers
//! that flow through the ingestion and query pipeline.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Embedding dimensionality. Every stored vector has exactly this many
/// components; providers emitting a different width are resampled.
pub const EMBEDDING_DIMS: usize = 384;

/// Ingestion stream that produced a chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChunkStrategy {
    /// The six fixed analytical summary chunks.
    Metadata,
    /// Sliding row windows over the raw table.
    CsvRow,
    /// Dataset overview plus one chunk per column.
    CsvColumn,
    /// Gap-filling chunks appended by the planner during complex turns.
    Complementary,
    /// Aggregated sub-query results from the fragmented path.
    Fragment,
}

impl ChunkStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChunkStrategy::Metadata => "metadata",
            ChunkStrategy::CsvRow => "csv_row",
            ChunkStrategy::CsvColumn => "csv_column",
            ChunkStrategy::Complementary => "complementary",
            ChunkStrategy::Fragment => "fragment",
        }
    }
}

/// The six analytical chunk types, in their fixed emission order.
pub const ANALYTICAL_CHUNK_TYPES: [&str; 6] = [
    "metadata_types",
    "metadata_distribution",
    "metadata_central_variability",
    "metadata_frequency_outliers",
    "metadata_correlations",
    "metadata_patterns_clusters",
];

/// Metadata attached to every chunk. The four required keys are explicit
/// fields; stream-specific keys (row ranges, column names, topics) live in
/// the flattened `extra` map.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkMetadata {
    pub source_id: String,
    pub chunk_type: String,
    pub chunk_index: i64,
    pub strategy: ChunkStrategy,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl ChunkMetadata {
    pub fn new(
        source_id: &str,
        chunk_type: &str,
        chunk_index: i64,
        strategy: ChunkStrategy,
    ) -> Self {
        Self {
            source_id: source_id.to_string(),
            chunk_type: chunk_type.to_string(),
            chunk_index,
            strategy,
            extra: serde_json::Map::new(),
        }
    }

    /// Attach an extra key, consuming and returning self for chaining.
    pub fn with(mut self, key: &str, value: serde_json::Value) -> Self {
        self.extra.insert(key.to_string(), value);
        self
    }
}

/// A chunk of analytical or raw tabular text, ready for embedding.
#[derive(Debug, Clone)]
pub struct Chunk {
    pub id: String,
    pub text: String,
    pub metadata: ChunkMetadata,
}

impl Chunk {
    pub fn new(text: String, metadata: ChunkMetadata) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            text,
            metadata,
        }
    }
}

/// A chunk paired with its embedding vector, as written to the vector store.
#[derive(Debug, Clone)]
pub struct VectorRecord {
    pub id: String,
    pub text: String,
    pub vector: Vec<f32>,
    pub metadata: ChunkMetadata,
}

/// A similarity-search result row.
#[derive(Debug, Clone)]
pub struct SearchHit {
    pub id: String,
    pub text: String,
    pub metadata: ChunkMetadata,
    pub similarity: f32,
}

/// A conversational session.
#[derive(Debug, Clone)]
pub struct Session {
    pub session_id: String,
    pub created_at: DateTime<Utc>,
    pub metadata: serde_json::Value,
}

/// A single question/answer turn within a session.
#[derive(Debug, Clone)]
pub struct Interaction {
    pub session_id: String,
    pub turn_index: i64,
    pub question: String,
    pub answer: String,
    pub processing_time_ms: i64,
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

/// Typed context entry categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ContextType {
    Cache,
    Data,
    Relevance,
}

impl ContextType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContextType::Cache => "CACHE",
            ContextType::Data => "DATA",
            ContextType::Relevance => "RELEVANCE",
        }
    }
}

/// A typed context entry with an optional expiry.
#[derive(Debug, Clone)]
pub struct ContextEntry {
    pub session_id: String,
    pub context_type: ContextType,
    pub context_key: String,
    pub context_data: serde_json::Value,
    pub expires_at: Option<DateTime<Utc>>,
}

/// Recent conversational context recalled for prompt assembly.
#[derive(Debug, Clone, Default)]
pub struct RecentContext {
    pub recent_messages: Vec<Interaction>,
    pub data_context: std::collections::HashMap<String, serde_json::Value>,
}

/// Execution strategy chosen by the planner for a single turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    RagOnly,
    CsvFallback,
    CsvFragmented,
}

impl Strategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Strategy::RagOnly => "rag_only",
            Strategy::CsvFallback => "csv_fallback",
            Strategy::CsvFragmented => "csv_fragmented",
        }
    }
}

/// Totals reported by a completed ingestion.
#[derive(Debug, Clone, Serialize)]
pub struct IngestStats {
    pub source_id: String,
    pub metadata_chunks: usize,
    pub row_chunks: usize,
    pub column_chunks: usize,
    pub total_embeddings: usize,
    pub total_stored: usize,
    pub failed: usize,
    pub success_rate: f64,
    pub elapsed_ms: u128,
}

/// The outward-facing answer for one turn.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Answer {
    pub status: String,
    pub content: String,
    pub strategy: Strategy,
    pub chunks_used: Vec<String>,
    pub new_chunks_generated: usize,
    pub csv_accessed: bool,
    pub covered_aspects: Vec<String>,
    pub required_gaps: Vec<String>,
    /// Sub-queries executed on the fragmented path; zero otherwise.
    #[serde(default)]
    pub fragments_count: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub query_analysis: Option<crate::analyzer::Analysis>,
    pub processing_time_seconds: f64,
    pub from_cache: bool,
    pub session_id: String,
    pub timestamp: DateTime<Utc>,
}
