//! Vector repository: persistence and similarity search for embedded chunks.
//!
//! Two backends implement [`VectorStore`]: a SQLite store (vectors as
//! little-endian f32 BLOBs, metadata as JSON) and an in-memory store for
//! tests. Similarity is cosine, reported with the `similarity = 1 - distance`
//! convention, so 1.0 means identical direction.
//!
//! Writes go through [`store_with_retry`]: a timed-out batch is halved and
//! both halves retried; a timed-out single record is retried with
//! exponential backoff (0.5 s doubling, capped at 8 s, at most 3 attempts).
//! Records exhausting their retries are reported in the [`StoreReport`],
//! never silently dropped.

use async_trait::async_trait;
use sqlx::{Row, SqlitePool};
use std::collections::HashMap;
use std::sync::RwLock;
use std::time::Duration;
use tracing::{debug, warn};

use crate::error::{CoreError, Result};
use crate::models::{ChunkMetadata, SearchHit, VectorRecord, EMBEDDING_DIMS};

/// Equality predicate over metadata keys, applied after similarity search.
pub type MetadataFilter = Vec<(String, serde_json::Value)>;

/// Counts reported by [`VectorStore::stats`].
#[derive(Debug, Clone, Default)]
pub struct VectorStoreStats {
    pub total_records: u64,
    pub by_chunk_type: HashMap<String, u64>,
    pub by_source: HashMap<String, u64>,
    /// Per-source breakdown of chunk-type counts. Each dataset's chunk
    /// inventory is read from here, never from the store-wide totals.
    pub by_source_chunk_type: HashMap<String, HashMap<String, u64>>,
}

/// Abstract vector repository.
#[async_trait]
pub trait VectorStore: Send + Sync {
    /// Insert records in one shot. May fail with `Timeout`; callers that
    /// need resilience use [`store_with_retry`].
    async fn insert(&self, records: &[VectorRecord]) -> Result<()>;

    /// Similarity search. Results are ordered by decreasing similarity;
    /// `threshold` is the minimum similarity; `filters` is an equality
    /// predicate on metadata keys applied after the similarity ranking.
    async fn search(
        &self,
        vector: &[f32],
        threshold: f32,
        k: usize,
        filters: Option<&MetadataFilter>,
    ) -> Result<Vec<SearchHit>>;

    /// Delete records whose metadata matches the filter. Returns the count.
    async fn delete_by(&self, filter: &MetadataFilter) -> Result<u64>;

    async fn stats(&self) -> Result<VectorStoreStats>;
}

// ============ Vector codec / validation ============

/// Encode a float vector as little-endian f32 bytes.
pub fn vec_to_blob(vec: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(vec.len() * 4);
    for &v in vec {
        bytes.extend_from_slice(&v.to_le_bytes());
    }
    bytes
}

/// Decode little-endian f32 bytes back into a float vector.
pub fn blob_to_vec(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

/// Compute cosine similarity between two vectors; 0.0 when degenerate.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;
    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom < f32::EPSILON {
        return 0.0;
    }
    dot / denom
}

/// Validate that a vector has exactly [`EMBEDDING_DIMS`] finite components.
pub fn validate_vector(vector: &[f32]) -> Result<()> {
    if vector.len() != EMBEDDING_DIMS {
        return Err(CoreError::DimensionMismatch {
            expected: EMBEDDING_DIMS,
            actual: vector.len(),
        });
    }
    if vector.iter().any(|v| !v.is_finite()) {
        return Err(CoreError::MalformedVector(
            "vector contains non-finite values".to_string(),
        ));
    }
    Ok(())
}

/// Defensive parsing: the transport may hand back a vector either as a
/// numeric array or as a textual array literal (`"[0.1, 0.2, ...]"`).
pub fn parse_vector_payload(value: &serde_json::Value) -> Result<Vec<f32>> {
    let parsed: Vec<f32> = match value {
        serde_json::Value::Array(items) => items
            .iter()
            .map(|v| {
                v.as_f64()
                    .map(|f| f as f32)
                    .ok_or_else(|| CoreError::MalformedVector("non-numeric element".to_string()))
            })
            .collect::<Result<Vec<f32>>>()?,
        serde_json::Value::String(text) => parse_vector_literal(text)?,
        other => {
            return Err(CoreError::MalformedVector(format!(
                "unexpected vector payload: {}",
                other
            )))
        }
    };
    validate_vector(&parsed)?;
    Ok(parsed)
}

fn parse_vector_literal(text: &str) -> Result<Vec<f32>> {
    let inner = text
        .trim()
        .strip_prefix('[')
        .and_then(|s| s.strip_suffix(']'))
        .ok_or_else(|| CoreError::MalformedVector("not an array literal".to_string()))?;
    inner
        .split(',')
        .filter(|s| !s.trim().is_empty())
        .map(|s| {
            s.trim()
                .parse::<f32>()
                .map_err(|_| CoreError::MalformedVector(format!("bad element: {}", s.trim())))
        })
        .collect()
}

/// Whether a metadata record satisfies every `(key, value)` pair. The four
/// required keys are matched against their fields; others against `extra`.
pub fn metadata_matches(metadata: &ChunkMetadata, filter: &MetadataFilter) -> bool {
    filter.iter().all(|(key, value)| match key.as_str() {
        "source_id" => value.as_str() == Some(metadata.source_id.as_str()),
        "chunk_type" => value.as_str() == Some(metadata.chunk_type.as_str()),
        "chunk_index" => value.as_i64() == Some(metadata.chunk_index),
        "strategy" => value.as_str() == Some(metadata.strategy.as_str()),
        other => metadata.extra.get(other) == Some(value),
    })
}

// ============ Retry / split write protocol ============

/// Backoff parameters for single-record retries.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub initial: Duration,
    pub cap: Duration,
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(500),
            cap: Duration::from_secs(8),
            max_attempts: 3,
        }
    }
}

/// Outcome of a resilient write.
#[derive(Debug, Clone, Default)]
pub struct StoreReport {
    pub stored: usize,
    /// Record ids that exhausted their retries.
    pub failed: Vec<String>,
}

/// Write records with the halve-on-timeout protocol. Dimension errors are
/// fatal and reported before anything is written; non-timeout storage
/// errors are fatal mid-flight.
pub async fn store_with_retry(
    store: &dyn VectorStore,
    records: &[VectorRecord],
    batch_size: usize,
    policy: RetryPolicy,
) -> Result<StoreReport> {
    for record in records {
        validate_vector(&record.vector)?;
    }

    let mut report = StoreReport::default();
    // Worklist of (start, end) ranges still to write.
    let mut pending: Vec<(usize, usize)> = Vec::new();
    let batch_size = batch_size.max(1);
    let mut start = 0;
    while start < records.len() {
        let end = (start + batch_size).min(records.len());
        pending.push((start, end));
        start = end;
    }
    pending.reverse();

    while let Some((start, end)) = pending.pop() {
        let batch = &records[start..end];
        match store.insert(batch).await {
            Ok(()) => report.stored += batch.len(),
            Err(e) if e.is_timeout() && batch.len() > 1 => {
                let mid = start + batch.len() / 2;
                debug!(
                    "vector write timed out on {} records, splitting into {}..{} and {}..{}",
                    batch.len(),
                    start,
                    mid,
                    mid,
                    end
                );
                pending.push((mid, end));
                pending.push((start, mid));
            }
            Err(e) if e.is_timeout() => {
                if retry_single(store, &records[start], policy).await {
                    report.stored += 1;
                } else {
                    warn!("vector record {} exhausted retries", records[start].id);
                    report.failed.push(records[start].id.clone());
                }
            }
            Err(e) => return Err(e),
        }
    }

    Ok(report)
}

async fn retry_single(store: &dyn VectorStore, record: &VectorRecord, policy: RetryPolicy) -> bool {
    let mut delay = policy.initial;
    for _ in 0..policy.max_attempts {
        tokio::time::sleep(delay).await;
        match store.insert(std::slice::from_ref(record)).await {
            Ok(()) => return true,
            Err(e) if e.is_timeout() => {
                delay = (delay * 2).min(policy.cap);
            }
            Err(_) => return false,
        }
    }
    false
}

// ============ SQLite backend ============

/// SQLite-backed vector store. Schema lives in `migrate`.
pub struct SqliteVectorStore {
    pool: SqlitePool,
    timeout: Duration,
}

impl SqliteVectorStore {
    pub fn new(pool: SqlitePool, timeout: Duration) -> Self {
        Self { pool, timeout }
    }

    async fn load_all(&self) -> Result<Vec<(String, String, Vec<f32>, ChunkMetadata)>> {
        let rows = sqlx::query("SELECT id, chunk_text, embedding, metadata FROM embeddings")
            .fetch_all(&self.pool)
            .await?;
        let mut records = Vec::with_capacity(rows.len());
        for row in &rows {
            let id: String = row.get("id");
            let text: String = row.get("chunk_text");
            let metadata_json: String = row.get("metadata");
            let metadata: ChunkMetadata = serde_json::from_str(&metadata_json)
                .map_err(|e| CoreError::Storage(format!("bad metadata for {}: {}", id, e)))?;
            let vector = decode_embedding_column(row)?;
            records.push((id, text, vector, metadata));
        }
        Ok(records)
    }
}

/// The embedding column is normally a BLOB, but a foreign writer may have
/// stored an array literal as TEXT; accept both.
fn decode_embedding_column(row: &sqlx::sqlite::SqliteRow) -> Result<Vec<f32>> {
    if let Ok(blob) = row.try_get::<Vec<u8>, _>("embedding") {
        let vector = blob_to_vec(&blob);
        // A textual literal read as bytes will not decode to the right width.
        if vector.len() == EMBEDDING_DIMS {
            validate_vector(&vector)?;
            return Ok(vector);
        }
        if let Ok(text) = std::str::from_utf8(&blob) {
            return parse_vector_payload(&serde_json::Value::String(text.to_string()));
        }
        return Err(CoreError::MalformedVector(format!(
            "embedding decodes to {} components",
            vector.len()
        )));
    }
    let text: String = row
        .try_get("embedding")
        .map_err(|e| CoreError::MalformedVector(e.to_string()))?;
    parse_vector_payload(&serde_json::Value::String(text))
}

#[async_trait]
impl VectorStore for SqliteVectorStore {
    async fn insert(&self, records: &[VectorRecord]) -> Result<()> {
        let fut = async {
            let mut tx = self.pool.begin().await?;
            for record in records {
                validate_vector(&record.vector)?;
                sqlx::query(
                    r#"
                    INSERT INTO embeddings (id, chunk_text, embedding, metadata, created_at)
                    VALUES (?, ?, ?, ?, ?)
                    ON CONFLICT(id) DO UPDATE SET
                        chunk_text = excluded.chunk_text,
                        embedding = excluded.embedding,
                        metadata = excluded.metadata
                    "#,
                )
                .bind(&record.id)
                .bind(&record.text)
                .bind(vec_to_blob(&record.vector))
                .bind(serde_json::to_string(&record.metadata)?)
                .bind(chrono::Utc::now().timestamp())
                .execute(&mut *tx)
                .await?;
            }
            tx.commit().await?;
            Ok::<(), CoreError>(())
        };
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(CoreError::Timeout(format!(
                "insert of {} records exceeded {:?}",
                records.len(),
                self.timeout
            ))),
        }
    }

    async fn search(
        &self,
        vector: &[f32],
        threshold: f32,
        k: usize,
        filters: Option<&MetadataFilter>,
    ) -> Result<Vec<SearchHit>> {
        validate_vector(vector)?;
        let records = self.load_all().await?;
        Ok(rank_hits(records, vector, threshold, k, filters))
    }

    async fn delete_by(&self, filter: &MetadataFilter) -> Result<u64> {
        let records = self.load_all().await?;
        let doomed: Vec<String> = records
            .into_iter()
            .filter(|(_, _, _, m)| metadata_matches(m, filter))
            .map(|(id, _, _, _)| id)
            .collect();
        // Delete in safe batches so a reingest never holds one huge statement.
        let mut deleted = 0u64;
        for batch in doomed.chunks(200) {
            let placeholders = vec!["?"; batch.len()].join(",");
            let sql = format!("DELETE FROM embeddings WHERE id IN ({})", placeholders);
            let mut query = sqlx::query(&sql);
            for id in batch {
                query = query.bind(id);
            }
            deleted += query.execute(&self.pool).await?.rows_affected();
        }
        Ok(deleted)
    }

    async fn stats(&self) -> Result<VectorStoreStats> {
        let records = self.load_all().await?;
        let mut stats = VectorStoreStats {
            total_records: records.len() as u64,
            ..Default::default()
        };
        for (_, _, _, metadata) in &records {
            *stats
                .by_chunk_type
                .entry(metadata.chunk_type.clone())
                .or_insert(0) += 1;
            *stats
                .by_source
                .entry(metadata.source_id.clone())
                .or_insert(0) += 1;
            *stats
                .by_source_chunk_type
                .entry(metadata.source_id.clone())
                .or_default()
                .entry(metadata.chunk_type.clone())
                .or_insert(0) += 1;
        }
        Ok(stats)
    }
}

fn rank_hits(
    records: Vec<(String, String, Vec<f32>, ChunkMetadata)>,
    vector: &[f32],
    threshold: f32,
    k: usize,
    filters: Option<&MetadataFilter>,
) -> Vec<SearchHit> {
    let mut hits: Vec<SearchHit> = records
        .into_iter()
        .map(|(id, text, stored, metadata)| {
            let similarity = cosine_similarity(vector, &stored);
            SearchHit {
                id,
                text,
                metadata,
                similarity,
            }
        })
        .filter(|h| h.similarity >= threshold)
        .collect();
    hits.sort_by(|a, b| {
        b.similarity
            .partial_cmp(&a.similarity)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(a.id.cmp(&b.id))
    });
    if let Some(filter) = filters {
        hits.retain(|h| metadata_matches(&h.metadata, filter));
    }
    hits.truncate(k);
    hits
}

// ============ In-memory backend ============

/// In-memory vector store for tests; brute-force cosine over all records.
pub struct InMemoryVectorStore {
    records: RwLock<Vec<VectorRecord>>,
}

impl InMemoryVectorStore {
    pub fn new() -> Self {
        Self {
            records: RwLock::new(Vec::new()),
        }
    }
}

impl Default for InMemoryVectorStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl VectorStore for InMemoryVectorStore {
    async fn insert(&self, records: &[VectorRecord]) -> Result<()> {
        for record in records {
            validate_vector(&record.vector)?;
        }
        let mut stored = self.records.write().unwrap();
        for record in records {
            stored.retain(|r| r.id != record.id);
            stored.push(record.clone());
        }
        Ok(())
    }

    async fn search(
        &self,
        vector: &[f32],
        threshold: f32,
        k: usize,
        filters: Option<&MetadataFilter>,
    ) -> Result<Vec<SearchHit>> {
        validate_vector(vector)?;
        let records = self.records.read().unwrap();
        let loaded: Vec<(String, String, Vec<f32>, ChunkMetadata)> = records
            .iter()
            .map(|r| {
                (
                    r.id.clone(),
                    r.text.clone(),
                    r.vector.clone(),
                    r.metadata.clone(),
                )
            })
            .collect();
        Ok(rank_hits(loaded, vector, threshold, k, filters))
    }

    async fn delete_by(&self, filter: &MetadataFilter) -> Result<u64> {
        let mut records = self.records.write().unwrap();
        let before = records.len();
        records.retain(|r| !metadata_matches(&r.metadata, filter));
        Ok((before - records.len()) as u64)
    }

    async fn stats(&self) -> Result<VectorStoreStats> {
        let records = self.records.read().unwrap();
        let mut stats = VectorStoreStats {
            total_records: records.len() as u64,
            ..Default::default()
        };
        for r in records.iter() {
            *stats
                .by_chunk_type
                .entry(r.metadata.chunk_type.clone())
                .or_insert(0) += 1;
            *stats
                .by_source
                .entry(r.metadata.source_id.clone())
                .or_insert(0) += 1;
            *stats
                .by_source_chunk_type
                .entry(r.metadata.source_id.clone())
                .or_default()
                .entry(r.metadata.chunk_type.clone())
                .or_insert(0) += 1;
        }
        Ok(stats)
    }
}
