//! The hybrid planner: cache probe, analysis, retrieval, strategy choice,
//! execution, synthesis, persistence.
//!
//! A turn is a linear pipeline; every external call is awaited in sequence.
//! Failures never escape as errors: the worst outcome is an answer with
//! `status == "error"` and a concise cause in `content`.

use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::analyzer::{required_aspects, Analysis, QueryAnalyzer};
use crate::chunker::{self, aspect_of, complementary_type};
use crate::config::ProcessorConfig;
use crate::csv_store::CsvStore;
use crate::embedding::EmbeddingProvider;
use crate::error::{CoreError, Result};
use crate::llm::{ChatOptions, LlmProvider};
use crate::memory::{cache_key, MemoryStore, GLOBAL_SCOPE};
use crate::models::{
    Answer, Chunk, ChunkMetadata, ChunkStrategy, ContextType, SearchHit, Strategy, VectorRecord,
};
use crate::table::Table;
use crate::vector_store::{store_with_retry, MetadataFilter, RetryPolicy, VectorStore};

pub struct HybridProcessor {
    vector_store: Arc<dyn VectorStore>,
    memory: Arc<dyn MemoryStore>,
    embedder: Arc<dyn EmbeddingProvider>,
    llm: Arc<dyn LlmProvider>,
    csv_store: Arc<dyn CsvStore>,
    analyzer: QueryAnalyzer,
    config: ProcessorConfig,
    /// Read-only dataframe cache, keyed by source id.
    tables: RwLock<HashMap<String, Arc<Table>>>,
}

impl HybridProcessor {
    pub fn new(
        vector_store: Arc<dyn VectorStore>,
        memory: Arc<dyn MemoryStore>,
        embedder: Arc<dyn EmbeddingProvider>,
        llm: Arc<dyn LlmProvider>,
        csv_store: Arc<dyn CsvStore>,
        config: ProcessorConfig,
    ) -> Self {
        Self {
            vector_store,
            memory,
            embedder,
            llm: Arc::clone(&llm),
            csv_store,
            analyzer: QueryAnalyzer::new(llm),
            config,
            tables: RwLock::new(HashMap::new()),
        }
    }

    /// Answer one question about one dataset. Never returns an error; the
    /// answer's `status` field reports failure.
    pub async fn process(
        &self,
        question: &str,
        source_id: &str,
        session_id: Option<&str>,
        force_csv: bool,
    ) -> Answer {
        let started = Instant::now();

        let session_id = match self.resolve_session(source_id, session_id).await {
            Ok(id) => id,
            Err(e) => {
                return error_answer(&e.to_string(), "", None, started);
            }
        };

        let key = cache_key(question, source_id);
        match self.probe_cache(&key).await {
            Some(mut cached) => {
                debug!(key = %key, "cache hit");
                cached.from_cache = true;
                cached.session_id = session_id;
                cached.processing_time_seconds = started.elapsed().as_secs_f64();
                return cached;
            }
            None => debug!(key = %key, "cache miss"),
        }

        match self
            .process_uncached(question, source_id, &session_id, force_csv, started)
            .await
        {
            Ok(answer) => {
                self.persist(question, &key, &answer).await;
                answer
            }
            Err(failure) => {
                warn!(source_id, error = %failure.error, "turn failed");
                error_answer(
                    &failure.error.to_string(),
                    &session_id,
                    failure.analysis,
                    started,
                )
            }
        }
    }

    async fn process_uncached(
        &self,
        question: &str,
        source_id: &str,
        session_id: &str,
        force_csv: bool,
        started: Instant,
    ) -> std::result::Result<Answer, TurnFailure> {
        let query_vector = self
            .embedder
            .embed(question)
            .await
            .map_err(TurnFailure::bare)?;

        let available = self
            .chunk_inventory(source_id)
            .await
            .map_err(TurnFailure::bare)?;
        let analysis = self.analyzer.analyze(question, &available).await;

        let filter: MetadataFilter =
            vec![("source_id".to_string(), serde_json::json!(source_id))];
        let hits = self
            .vector_store
            .search(
                &query_vector,
                self.config.similarity_threshold,
                self.config.retrieve_k,
                Some(&filter),
            )
            .await
            .map_err(|e| TurnFailure::with_analysis(e, &analysis))?;

        let required = required_aspects(analysis.category);
        let covered: Vec<String> = required
            .iter()
            .filter(|aspect| {
                hits.iter()
                    .any(|h| aspect_of(&h.metadata.chunk_type) == Some(*aspect))
            })
            .map(|a| a.to_string())
            .collect();
        let gaps: Vec<String> = required
            .iter()
            .filter(|a| !covered.contains(&a.to_string()))
            .map(|a| a.to_string())
            .collect();
        let coverage = if required.is_empty() {
            1.0
        } else {
            covered.len() as f64 / required.len() as f64
        };

        let chosen = self.choose_strategy(question, coverage, hits.len(), force_csv);
        info!(
            source_id,
            strategy = chosen.as_str(),
            coverage,
            retrieved = hits.len(),
            "strategy chosen"
        );

        let history = self.recent_history(session_id).await;
        let mut answer = self
            .execute_with_degradation(
                chosen, question, source_id, &hits, &covered, &gaps, &analysis, &history,
            )
            .await
            .map_err(|e| TurnFailure::with_analysis(e, &analysis))?;

        answer.covered_aspects = covered;
        answer.required_gaps = gaps;
        answer.query_analysis = Some(analysis);
        answer.session_id = session_id.to_string();
        answer.processing_time_seconds = started.elapsed().as_secs_f64();
        answer.timestamp = Utc::now();
        Ok(answer)
    }

    fn choose_strategy(
        &self,
        question: &str,
        coverage: f64,
        retrieved: usize,
        force_csv: bool,
    ) -> Strategy {
        if force_csv {
            return Strategy::CsvFragmented;
        }
        if coverage >= self.config.coverage_threshold && retrieved >= self.config.min_chunks {
            return Strategy::RagOnly;
        }
        let question_tokens = question.split_whitespace().count();
        if question_tokens < self.config.short_question_tokens {
            Strategy::CsvFallback
        } else {
            Strategy::CsvFragmented
        }
    }

    async fn execute_with_degradation(
        &self,
        chosen: Strategy,
        question: &str,
        source_id: &str,
        hits: &[SearchHit],
        covered: &[String],
        gaps: &[String],
        analysis: &Analysis,
        history: &str,
    ) -> Result<Answer> {
        let ladder: &[Strategy] = match chosen {
            Strategy::CsvFragmented => &[
                Strategy::CsvFragmented,
                Strategy::CsvFallback,
                Strategy::RagOnly,
            ],
            Strategy::CsvFallback => &[Strategy::CsvFallback, Strategy::RagOnly],
            Strategy::RagOnly => &[Strategy::RagOnly],
        };

        let mut last_err: Option<CoreError> = None;
        for &strategy in ladder {
            if last_err.is_some() {
                warn!(
                    from = chosen.as_str(),
                    to = strategy.as_str(),
                    "degrading strategy"
                );
            }
            let result = match strategy {
                Strategy::RagOnly => self.exec_rag_only(question, hits, analysis, history).await,
                Strategy::CsvFallback => {
                    self.exec_csv_fallback(question, source_id, hits, gaps, history)
                        .await
                }
                Strategy::CsvFragmented => {
                    self.exec_csv_fragmented(question, source_id, hits, covered, history)
                        .await
                }
            };
            match result {
                Ok(answer) => return Ok(answer),
                Err(e) if degradable(&e) => last_err = Some(e),
                Err(e) => return Err(e),
            }
        }
        Err(last_err
            .unwrap_or_else(|| CoreError::LlmFailure("no strategy could execute".to_string())))
    }

    // ---- rag_only: answer from retrieved chunks, never touching the CSV.

    async fn exec_rag_only(
        &self,
        question: &str,
        hits: &[SearchHit],
        analysis: &Analysis,
        history: &str,
    ) -> Result<Answer> {
        if hits.is_empty() {
            return Err(CoreError::LlmFailure(
                "no chunks retrieved to answer from".to_string(),
            ));
        }
        let context = hits
            .iter()
            .map(|h| format!("[{}]\n{}", h.metadata.chunk_type, h.text))
            .collect::<Vec<_>>()
            .join("\n\n");
        let content = self
            .synthesize(question, &context, analysis.category.as_str(), history)
            .await?;
        Ok(base_answer(
            content,
            Strategy::RagOnly,
            chunk_types_of(hits),
            0,
            false,
            0,
        ))
    }

    // ---- csv_fallback: focused analysis of gap aspects only, persisted as
    // complementary chunks.

    async fn exec_csv_fallback(
        &self,
        question: &str,
        source_id: &str,
        hits: &[SearchHit],
        gaps: &[String],
        history: &str,
    ) -> Result<Answer> {
        let table = self.load_table(source_id).await?;

        let mut focused_sections = Vec::new();
        let mut new_chunks = Vec::new();
        for (idx, aspect) in gaps.iter().enumerate() {
            let analytical =
                chunker::analytical_chunk(&table, source_id, &format!("metadata_{}", aspect), 0);
            focused_sections.push(analytical.text.clone());
            let metadata = ChunkMetadata::new(
                source_id,
                &complementary_type(aspect),
                idx as i64,
                ChunkStrategy::Complementary,
            )
            .with("topic", serde_json::json!(aspect));
            new_chunks.push(Chunk::new(analytical.text, metadata));
        }
        let generated = new_chunks.len();
        if generated > 0 {
            self.persist_chunks(new_chunks).await?;
        }

        let mut context_parts: Vec<String> = hits
            .iter()
            .map(|h| format!("[{}]\n{}", h.metadata.chunk_type, h.text))
            .collect();
        context_parts.extend(
            focused_sections
                .iter()
                .map(|s| format!("[focused analysis]\n{}", s)),
        );
        let content = self
            .synthesize(
                question,
                &context_parts.join("\n\n"),
                "focused table analysis",
                history,
            )
            .await?;

        let mut used = chunk_types_of(hits);
        used.extend(gaps.iter().map(|g| complementary_type(g)));
        Ok(base_answer(content, Strategy::CsvFallback, used, generated, true, 0))
    }

    // ---- csv_fragmented: split the table, execute each fragment, aggregate.

    async fn exec_csv_fragmented(
        &self,
        question: &str,
        source_id: &str,
        hits: &[SearchHit],
        covered: &[String],
        history: &str,
    ) -> Result<Answer> {
        let table = self.load_table(source_id).await?;
        let plan = crate::fragmenter::fragment(question, &table, self.config.token_budget);

        let (summary, fragments_count) = if plan.needs_fragmentation {
            let partials: Vec<FragmentPartial> = plan
                .fragments
                .iter()
                .map(|f| execute_fragment(&table, f))
                .collect();
            (aggregate_partials(&partials), plan.fragments.len())
        } else {
            // Fits in one call; treat the whole table as a single slice.
            let whole = FragmentPartial::from_table(&table, "full");
            (aggregate_partials(&[whole]), 1)
        };

        // The aggregated summary becomes a retrievable chunk for later turns.
        let metadata = ChunkMetadata::new(source_id, "fragment_result", 0, ChunkStrategy::Fragment)
            .with("topic", serde_json::json!("fragment_aggregate"))
            .with("fragments", serde_json::json!(fragments_count));
        self.persist_chunks(vec![Chunk::new(summary.clone(), metadata)])
            .await?;

        let mut context_parts: Vec<String> = hits
            .iter()
            .map(|h| format!("[{}]\n{}", h.metadata.chunk_type, h.text))
            .collect();
        context_parts.push(format!("[fragment aggregate]\n{}", summary));
        if !covered.is_empty() {
            context_parts.push(format!("Aspects already summarized: {}", covered.join(", ")));
        }
        let content = self
            .synthesize(
                question,
                &context_parts.join("\n\n"),
                "fragmented table analysis",
                history,
            )
            .await?;

        let mut used = chunk_types_of(hits);
        used.push("fragment_result".to_string());
        Ok(base_answer(
            content,
            Strategy::CsvFragmented,
            used,
            1,
            true,
            fragments_count,
        ))
    }

    async fn synthesize(
        &self,
        question: &str,
        context: &str,
        mode: &str,
        history: &str,
    ) -> Result<String> {
        let conversation = if history.is_empty() {
            String::new()
        } else {
            format!("Recent conversation:\n{}\n\n", history)
        };
        let prompt = format!(
            "Answer the user's question about a tabular dataset using ONLY the \
             context below ({}).\n\n\
             {}Question: {}\n\n\
             Context:\n{}\n\n\
             Cite the chunk labels in square brackets when they support a \
             claim. If the context is insufficient to answer fully, say so \
             explicitly and state what is missing.",
            mode, conversation, question, context
        );
        let response = self.llm.chat(&prompt, ChatOptions::default()).await?;
        Ok(response.content)
    }

    /// Up to the last three interactions of the session, formatted for the
    /// synthesis prompt. Recall failures degrade to an empty history.
    async fn recent_history(&self, session_id: &str) -> String {
        match self.memory.recall_recent(session_id, 24).await {
            Ok(recent) => {
                let tail = recent
                    .recent_messages
                    .iter()
                    .rev()
                    .take(3)
                    .collect::<Vec<_>>();
                tail.iter()
                    .rev()
                    .map(|i| format!("Q: {}\nA: {}", i.question, i.answer))
                    .collect::<Vec<_>>()
                    .join("\n\n")
            }
            Err(e) => {
                debug!(session_id, error = %e, "history recall failed");
                String::new()
            }
        }
    }

    /// Embed and store planner-generated chunks with the resilient write
    /// protocol; exhausted records are logged, not fatal.
    async fn persist_chunks(&self, chunks: Vec<Chunk>) -> Result<()> {
        let texts: Vec<String> = chunks.iter().map(|c| c.text.clone()).collect();
        let vectors = self.embedder.embed_batch(&texts).await?;
        let records: Vec<VectorRecord> = chunks
            .into_iter()
            .zip(vectors)
            .map(|(chunk, vector)| VectorRecord {
                id: chunk.id,
                text: chunk.text,
                vector,
                metadata: chunk.metadata,
            })
            .collect();
        let report = store_with_retry(
            self.vector_store.as_ref(),
            &records,
            records.len().max(1),
            RetryPolicy::default(),
        )
        .await?;
        if !report.failed.is_empty() {
            warn!(failed = report.failed.len(), "some generated chunks were not stored");
        }
        Ok(())
    }

    /// Chunk types currently stored for this dataset, for the analyzer.
    /// Types belonging to other datasets never reach the strategy hint.
    async fn chunk_inventory(&self, source_id: &str) -> Result<Vec<String>> {
        let stats = self.vector_store.stats().await?;
        let mut types: Vec<String> = stats
            .by_source_chunk_type
            .get(source_id)
            .map(|counts| counts.keys().cloned().collect())
            .unwrap_or_default();
        types.sort();
        Ok(types)
    }

    async fn resolve_session(&self, source_id: &str, session_id: Option<&str>) -> Result<String> {
        if let Some(id) = session_id {
            if self.memory.get_session(id).await?.is_some() {
                return Ok(id.to_string());
            }
        }
        let session = self
            .memory
            .create_session(serde_json::json!({ "source_id": source_id }))
            .await?;
        Ok(session.session_id)
    }

    async fn probe_cache(&self, key: &str) -> Option<Answer> {
        let entry = self
            .memory
            .get_context(GLOBAL_SCOPE, ContextType::Cache, key)
            .await
            .ok()??;
        serde_json::from_value(entry.context_data).ok()
    }

    async fn persist(&self, question: &str, key: &str, answer: &Answer) {
        let metadata = serde_json::json!({ "strategy": answer.strategy.as_str() });
        if let Err(e) = self
            .memory
            .save_interaction(
                &answer.session_id,
                question,
                &answer.content,
                (answer.processing_time_seconds * 1000.0) as i64,
                metadata,
            )
            .await
        {
            warn!(error = %e, "failed to save interaction");
        }
        if answer.status == "success" {
            match serde_json::to_value(answer) {
                Ok(value) => {
                    if let Err(e) = self
                        .memory
                        .save_context(
                            GLOBAL_SCOPE,
                            key,
                            ContextType::Cache,
                            &value,
                            Some(self.config.cache_ttl_hours),
                        )
                        .await
                    {
                        warn!(error = %e, "failed to write cache entry");
                    }
                }
                Err(e) => warn!(error = %e, "failed to serialize answer for cache"),
            }
        }
    }

    async fn load_table(&self, source_id: &str) -> Result<Arc<Table>> {
        if let Some(table) = self.tables.read().await.get(source_id) {
            return Ok(Arc::clone(table));
        }
        let table = Arc::new(self.csv_store.load(source_id).await?);
        self.tables
            .write()
            .await
            .insert(source_id.to_string(), Arc::clone(&table));
        Ok(table)
    }
}

/// A failed turn, carrying whatever analysis was produced before the
/// failure so the error answer can still report it.
struct TurnFailure {
    error: CoreError,
    analysis: Option<Analysis>,
}

impl TurnFailure {
    fn bare(error: CoreError) -> Self {
        Self {
            error,
            analysis: None,
        }
    }

    fn with_analysis(error: CoreError, analysis: &Analysis) -> Self {
        Self {
            error,
            analysis: Some(analysis.clone()),
        }
    }
}

fn degradable(e: &CoreError) -> bool {
    matches!(
        e,
        CoreError::LlmFailure(_) | CoreError::Timeout(_) | CoreError::NotFound(_)
    )
}

fn chunk_types_of(hits: &[SearchHit]) -> Vec<String> {
    hits.iter().map(|h| h.metadata.chunk_type.clone()).collect()
}

fn base_answer(
    content: String,
    strategy: Strategy,
    chunks_used: Vec<String>,
    new_chunks_generated: usize,
    csv_accessed: bool,
    fragments_count: usize,
) -> Answer {
    Answer {
        status: "success".to_string(),
        content,
        strategy,
        chunks_used,
        new_chunks_generated,
        csv_accessed,
        covered_aspects: Vec::new(),
        required_gaps: Vec::new(),
        fragments_count,
        query_analysis: None,
        processing_time_seconds: 0.0,
        from_cache: false,
        session_id: String::new(),
        timestamp: Utc::now(),
    }
}

fn error_answer(
    cause: &str,
    session_id: &str,
    analysis: Option<Analysis>,
    started: Instant,
) -> Answer {
    Answer {
        status: "error".to_string(),
        content: cause.to_string(),
        strategy: Strategy::RagOnly,
        chunks_used: Vec::new(),
        new_chunks_generated: 0,
        csv_accessed: false,
        covered_aspects: Vec::new(),
        required_gaps: Vec::new(),
        fragments_count: 0,
        query_analysis: analysis,
        processing_time_seconds: started.elapsed().as_secs_f64(),
        from_cache: false,
        session_id: session_id.to_string(),
        timestamp: Utc::now(),
    }
}

// ============ Fragment execution & aggregation ============

/// Numeric partials carried from one fragment to the aggregator.
#[derive(Debug, Clone)]
struct FragmentPartial {
    label: String,
    rows: usize,
    /// Per-column (name, count, sum, min, max) over the fragment's slice.
    columns: Vec<(String, usize, f64, f64, f64)>,
}

impl FragmentPartial {
    fn from_table(table: &Table, label: &str) -> Self {
        let columns = table
            .numeric_column_indices()
            .into_iter()
            .map(|idx| {
                let values = table.numeric_values(idx);
                let count = values.len();
                let sum: f64 = values.iter().sum();
                let min = values.iter().cloned().fold(f64::INFINITY, f64::min);
                let max = values.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
                (table.columns[idx].clone(), count, sum, min, max)
            })
            .collect();
        Self {
            label: label.to_string(),
            rows: table.n_rows(),
            columns,
        }
    }
}

fn execute_fragment(table: &Table, fragment: &crate::fragmenter::Fragment) -> FragmentPartial {
    let sliced = match fragment.row_range {
        Some((start, end)) => table.slice_rows(start.saturating_sub(1), end),
        None => table.slice_rows(0, table.n_rows()),
    };
    let scoped = match &fragment.columns {
        Some(cols) => sliced.select_columns(cols),
        None => sliced,
    };
    FragmentPartial::from_table(&scoped, &fragment.fragment_id)
}

/// Roll partial results up into one human-readable summary. Counts and sums
/// combine exactly, so means match an unfragmented computation.
fn aggregate_partials(partials: &[FragmentPartial]) -> String {
    let total_rows: usize = partials.iter().map(|p| p.rows).sum();
    let mut merged: Vec<(String, usize, f64, f64, f64)> = Vec::new();
    for partial in partials {
        for (name, count, sum, min, max) in &partial.columns {
            match merged.iter_mut().find(|(n, ..)| n == name) {
                Some((_, c, s, mn, mx)) => {
                    *c += count;
                    *s += sum;
                    *mn = mn.min(*min);
                    *mx = mx.max(*max);
                }
                None => merged.push((name.clone(), *count, *sum, *min, *max)),
            }
        }
    }

    let mut lines = vec![
        "== Aggregated fragment results ==".to_string(),
        format!("fragments: {}", partials.len()),
        format!("rows covered: {}", total_rows),
    ];
    for (name, count, sum, min, max) in &merged {
        if *count == 0 {
            continue;
        }
        lines.push(format!(
            "  {}: count={} mean={:.4} min={:.4} max={:.4}",
            name,
            count,
            sum / *count as f64,
            min,
            max
        ));
    }
    if merged.is_empty() {
        lines.push("  no numeric columns in the analyzed slices".to_string());
    }
    lines.push(format!(
        "slices: {}",
        partials
            .iter()
            .map(|p| p.label.as_str())
            .collect::<Vec<_>>()
            .join(", ")
    ));
    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fragmenter;

    fn numeric_table(rows: usize) -> Table {
        let columns = vec!["id".to_string(), "amount".to_string()];
        let data = (0..rows)
            .map(|r| vec![r.to_string(), ((r * 3) as f64).to_string()])
            .collect();
        Table {
            columns,
            rows: data,
        }
    }

    #[test]
    fn test_aggregation_matches_unfragmented_mean() {
        let table = numeric_table(500);
        let plan = fragmenter::fragment("Resuma os valores por registro linha a linha", &table, 300);
        assert!(plan.needs_fragmentation);

        let partials: Vec<FragmentPartial> =
            plan.fragments.iter().map(|f| execute_fragment(&table, f)).collect();
        let fragmented = aggregate_partials(&partials);

        let whole = FragmentPartial::from_table(&table, "full");
        let direct = aggregate_partials(&[whole]);

        // Same per-column mean line regardless of fragmentation.
        let pick = |s: &str| {
            s.lines()
                .find(|l| l.trim_start().starts_with("amount:"))
                .unwrap()
                .trim()
                .to_string()
        };
        assert_eq!(pick(&fragmented), pick(&direct));
    }

    #[test]
    fn test_execute_fragment_respects_row_range() {
        let table = numeric_table(100);
        let fragment = fragmenter::Fragment {
            fragment_id: "rows_0".to_string(),
            row_range: Some((1, 10)),
            columns: None,
            sub_question: String::new(),
            est_tokens: 0,
        };
        let partial = execute_fragment(&table, &fragment);
        assert_eq!(partial.rows, 10);
    }

    #[test]
    fn test_execute_fragment_respects_column_scope() {
        let table = numeric_table(50);
        let fragment = fragmenter::Fragment {
            fragment_id: "cols_0".to_string(),
            row_range: None,
            columns: Some(vec!["amount".to_string()]),
            sub_question: String::new(),
            est_tokens: 0,
        };
        let partial = execute_fragment(&table, &fragment);
        assert_eq!(partial.columns.len(), 1);
        assert_eq!(partial.columns[0].0, "amount");
    }

    #[test]
    fn test_degradable_classification() {
        assert!(degradable(&CoreError::LlmFailure("x".into())));
        assert!(degradable(&CoreError::NotFound("x".into())));
        assert!(!degradable(&CoreError::Storage("x".into())));
    }
}
