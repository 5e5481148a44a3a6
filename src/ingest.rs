//! Ingestion: CSV in, three chunk streams embedded and stored.
//!
//! Re-ingesting a source id replaces its chunks: prior records for the
//! source are deleted before the new ones are written, so ingestion is
//! idempotent at the source level.

use std::sync::Arc;
use std::time::Instant;
use tracing::info;

use crate::chunker;
use crate::config::{ChunkingConfig, EmbeddingConfig};
use crate::csv_store::CsvStore;
use crate::embedding::{embed_all, EmbeddingProvider};
use crate::error::{CoreError, Result};
use crate::models::{Chunk, IngestStats, VectorRecord};
use crate::table::Table;
use crate::vector_store::{store_with_retry, MetadataFilter, RetryPolicy, VectorStore};

pub struct IngestionAgent {
    vector_store: Arc<dyn VectorStore>,
    provider: Arc<dyn EmbeddingProvider>,
    csv_store: Arc<dyn CsvStore>,
    chunking: ChunkingConfig,
    embedding: EmbeddingConfig,
}

impl IngestionAgent {
    pub fn new(
        vector_store: Arc<dyn VectorStore>,
        provider: Arc<dyn EmbeddingProvider>,
        csv_store: Arc<dyn CsvStore>,
        chunking: ChunkingConfig,
        embedding: EmbeddingConfig,
    ) -> Self {
        Self {
            vector_store,
            provider,
            csv_store,
            chunking,
            embedding,
        }
    }

    /// Ingest raw CSV text under a source id. Produces the analytical,
    /// row-window and column streams, embeds everything, and stores the
    /// vectors, replacing any prior ingestion of the same source.
    pub async fn ingest(&self, source_id: &str, raw_csv: &str) -> Result<IngestStats> {
        let started = Instant::now();
        let table = Table::parse_csv(raw_csv)?;

        let metadata_chunks = chunker::metadata_chunks(&table, source_id);
        let row_chunks = chunker::row_window_chunks(
            &table,
            source_id,
            self.chunking.rows_per_chunk,
            self.chunking.overlap_rows,
        );
        let column_chunks = chunker::column_chunks(&table, source_id);

        let stats_shape = (metadata_chunks.len(), row_chunks.len(), column_chunks.len());
        let mut chunks = metadata_chunks;
        chunks.extend(row_chunks);
        chunks.extend(column_chunks);

        for chunk in &chunks {
            if chunk.text.trim().is_empty() {
                return Err(CoreError::InvalidInput(format!(
                    "empty chunk produced for type {}",
                    chunk.metadata.chunk_type
                )));
            }
        }
        if chunks.is_empty() {
            return Err(CoreError::InvalidInput(format!(
                "no chunks produced for {}",
                source_id
            )));
        }

        info!(
            source_id,
            metadata = stats_shape.0,
            rows = stats_shape.1,
            columns = stats_shape.2,
            "chunked dataset"
        );

        // Keep the raw bytes addressable for the fallback strategies.
        self.csv_store.put(source_id, raw_csv).await?;

        let texts: Vec<String> = chunks.iter().map(|c| c.text.clone()).collect();
        let vectors = embed_all(
            Arc::clone(&self.provider),
            texts,
            self.embedding.batch_size,
            self.embedding.workers,
        )
        .await?;

        let records: Vec<VectorRecord> = chunks
            .into_iter()
            .zip(vectors)
            .map(|(chunk, vector)| chunk_to_record(chunk, vector))
            .collect();

        // Replace semantics: the old ingestion disappears before the new
        // one lands.
        let filter: MetadataFilter = vec![("source_id".to_string(), serde_json::json!(source_id))];
        let deleted = self.vector_store.delete_by(&filter).await?;
        if deleted > 0 {
            info!(source_id, deleted, "removed chunks from prior ingestion");
        }

        let report = store_with_retry(
            self.vector_store.as_ref(),
            &records,
            self.embedding.insert_batch_size,
            RetryPolicy::default(),
        )
        .await?;

        let total = records.len();
        let stats = IngestStats {
            source_id: source_id.to_string(),
            metadata_chunks: stats_shape.0,
            row_chunks: stats_shape.1,
            column_chunks: stats_shape.2,
            total_embeddings: total,
            total_stored: report.stored,
            failed: report.failed.len(),
            success_rate: if total == 0 {
                0.0
            } else {
                report.stored as f64 / total as f64
            },
            elapsed_ms: started.elapsed().as_millis(),
        };
        info!(
            source_id,
            stored = stats.total_stored,
            failed = stats.failed,
            elapsed_ms = stats.elapsed_ms as u64,
            "ingestion complete"
        );
        Ok(stats)
    }
}

fn chunk_to_record(chunk: Chunk, vector: Vec<f32>) -> VectorRecord {
    VectorRecord {
        id: chunk.id,
        text: chunk.text,
        vector,
        metadata: chunk.metadata,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::csv_store::InMemoryCsvStore;
    use crate::embedding::MockProvider;
    use crate::models::ANALYTICAL_CHUNK_TYPES;
    use crate::vector_store::InMemoryVectorStore;

    fn sample_csv(rows: usize) -> String {
        let mut csv = String::from("age,income,city\n");
        for i in 0..rows {
            csv.push_str(&format!("{},{},{}\n", 20 + i % 40, 30000 + i * 100, if i % 2 == 0 { "porto" } else { "lisbon" }));
        }
        csv
    }

    fn agent(
        store: Arc<InMemoryVectorStore>,
        csv: Arc<InMemoryCsvStore>,
    ) -> IngestionAgent {
        IngestionAgent::new(
            store,
            Arc::new(MockProvider),
            csv,
            ChunkingConfig::default(),
            EmbeddingConfig::default(),
        )
    }

    #[tokio::test]
    async fn test_ingest_produces_all_three_streams() {
        let store = Arc::new(InMemoryVectorStore::new());
        let csv = Arc::new(InMemoryCsvStore::new());
        let stats = agent(Arc::clone(&store), Arc::clone(&csv))
            .ingest("census", &sample_csv(50))
            .await
            .unwrap();

        assert_eq!(stats.metadata_chunks, 6);
        // 50 rows, window 20 step 16: [1,20] [17,36] [33,50]
        assert_eq!(stats.row_chunks, 3);
        // overview + 3 columns
        assert_eq!(stats.column_chunks, 4);
        assert_eq!(stats.total_stored, 13);
        assert_eq!(stats.failed, 0);
        assert!((stats.success_rate - 1.0).abs() < f64::EPSILON);

        let stored = store.stats().await.unwrap();
        assert_eq!(stored.total_records, 13);
        for chunk_type in ANALYTICAL_CHUNK_TYPES {
            assert_eq!(stored.by_chunk_type[chunk_type], 1, "{}", chunk_type);
        }
    }

    #[tokio::test]
    async fn test_reingest_replaces_prior_chunks() {
        let store = Arc::new(InMemoryVectorStore::new());
        let csv = Arc::new(InMemoryCsvStore::new());
        let agent = agent(Arc::clone(&store), Arc::clone(&csv));

        agent.ingest("census", &sample_csv(50)).await.unwrap();
        let first = store.stats().await.unwrap().total_records;
        agent.ingest("census", &sample_csv(50)).await.unwrap();
        let second = store.stats().await.unwrap().total_records;
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_ingest_registers_raw_csv() {
        let store = Arc::new(InMemoryVectorStore::new());
        let csv = Arc::new(InMemoryCsvStore::new());
        agent(store, Arc::clone(&csv))
            .ingest("census", &sample_csv(5))
            .await
            .unwrap();
        let table = csv.load("census").await.unwrap();
        assert_eq!(table.n_rows(), 5);
    }

    #[tokio::test]
    async fn test_empty_csv_rejected() {
        let store = Arc::new(InMemoryVectorStore::new());
        let csv = Arc::new(InMemoryCsvStore::new());
        let err = agent(store, csv).ingest("empty", "").await.unwrap_err();
        assert!(matches!(err, CoreError::InvalidInput(_)));
    }
}
