//! Deterministic chunk production from a parsed table.
//!
//! Three parallel streams are produced per ingestion:
//!
//! 1. **METADATA** — six fixed analytical summary chunks, always emitted in
//!    the same order, each a human-readable structured block so retrieval
//!    over free-text questions has both lexical and semantic signal.
//! 2. **CSV_ROW** — sliding windows of raw rows with the header prepended.
//! 3. **CSV_COLUMN** — a dataset overview plus one chunk per column.
//!
//! Given the same CSV bytes and `source_id`, two runs produce chunks with
//! identical text and metadata, in stable order.

use serde_json::json;

use crate::models::{Chunk, ChunkMetadata, ChunkStrategy, ANALYTICAL_CHUNK_TYPES};
use crate::table::{self, ColumnKind, Table};

/// Quartiles are spelled out for at most this many numeric columns in the
/// distribution chunk; the rest keep the five-number summary short.
const QUARTILE_DETAIL_COLS: usize = 10;

/// At most this many numeric columns feed the correlation matrix.
const CORRELATION_COLS: usize = 15;

/// Top-k values listed for categorical columns.
const TOP_K_VALUES: usize = 5;

/// The aspect a metadata chunk type covers (`metadata_types` -> `types`).
/// Complementary chunks cover the aspect after their `complementary_` prefix.
pub fn aspect_of(chunk_type: &str) -> Option<&str> {
    chunk_type
        .strip_prefix("metadata_")
        .or_else(|| chunk_type.strip_prefix("complementary_"))
}

/// Chunk type of the complementary chunk that fills a gap for `aspect`.
pub fn complementary_type(aspect: &str) -> String {
    format!("complementary_{}", aspect)
}

// ============ METADATA stream ============

/// Emit the six analytical chunks in their fixed order.
pub fn metadata_chunks(table: &Table, source_id: &str) -> Vec<Chunk> {
    ANALYTICAL_CHUNK_TYPES
        .iter()
        .enumerate()
        .map(|(i, chunk_type)| analytical_chunk(table, source_id, chunk_type, i as i64))
        .collect()
}

/// Build one analytical chunk by type. Panics on unknown types are avoided:
/// unknown types fall back to the types summary.
pub fn analytical_chunk(table: &Table, source_id: &str, chunk_type: &str, index: i64) -> Chunk {
    let (text, topic) = match chunk_type {
        "metadata_types" => (types_text(table), "column types and counts"),
        "metadata_distribution" => (distribution_text(table), "numeric distributions"),
        "metadata_central_variability" => (
            central_variability_text(table),
            "central tendency and dispersion",
        ),
        "metadata_frequency_outliers" => (
            frequency_outliers_text(table),
            "value frequencies and outliers",
        ),
        "metadata_correlations" => (correlations_text(table), "pairwise correlations"),
        "metadata_patterns_clusters" => (
            patterns_clusters_text(table),
            "temporal ranges and group sizes",
        ),
        _ => (types_text(table), "column types and counts"),
    };
    let metadata = ChunkMetadata::new(source_id, chunk_type, index, ChunkStrategy::Metadata)
        .with("topic", json!(topic));
    Chunk::new(text, metadata)
}

fn types_text(table: &Table) -> String {
    let mut numeric = 0usize;
    let mut categorical = 0usize;
    let mut temporal = 0usize;
    let mut lines = Vec::new();
    for i in 0..table.n_cols() {
        let kind = table.classify(i);
        match kind {
            ColumnKind::Numeric | ColumnKind::NumericId => numeric += 1,
            ColumnKind::Temporal => temporal += 1,
            ColumnKind::Categorical | ColumnKind::Binary => categorical += 1,
        }
        lines.push(format!(
            "  {}: {} (nulls: {}, unique: {})",
            table.columns[i],
            kind.as_str(),
            table.null_count(i),
            table.unique_count(i)
        ));
    }
    format!(
        "== Column types ==\nrows: {}\ncolumns: {}\nnumeric columns: {}\ncategorical columns: {}\ntemporal columns: {}\n\ncolumn inventory:\n{}",
        table.n_rows(),
        table.n_cols(),
        numeric,
        categorical,
        temporal,
        lines.join("\n")
    )
}

fn distribution_text(table: &Table) -> String {
    let numeric = table.numeric_column_indices();
    if numeric.is_empty() {
        return "== Numeric distributions ==\nnone detected: no numeric columns in this dataset"
            .to_string();
    }
    let mut lines = Vec::new();
    for (pos, &idx) in numeric.iter().enumerate() {
        let values = table.numeric_values(idx);
        if let Some(s) = table::numeric_summary(&values) {
            let mut line = format!(
                "  {}: min={:.4} max={:.4} mean={:.4} median={:.4} std={:.4}",
                table.columns[idx], s.min, s.max, s.mean, s.median, s.std
            );
            if pos < QUARTILE_DETAIL_COLS {
                line.push_str(&format!(" q1={:.4} q2={:.4} q3={:.4}", s.q1, s.q2, s.q3));
            }
            lines.push(line);
        }
    }
    format!(
        "== Numeric distributions ==\nnumeric columns: {}\n\n{}",
        numeric.len(),
        lines.join("\n")
    )
}

fn central_variability_text(table: &Table) -> String {
    let numeric = table.numeric_column_indices();
    if numeric.is_empty() {
        return "== Central tendency and variability ==\nnone detected: no numeric columns in this dataset".to_string();
    }
    let mut lines = Vec::new();
    for &idx in &numeric {
        let values = table.numeric_values(idx);
        if let Some(s) = table::numeric_summary(&values) {
            lines.push(format!(
                "  {}: mean={:.4} median={:.4} mode={:.4} std={:.4} variance={:.4} iqr={:.4}",
                table.columns[idx], s.mean, s.median, s.mode, s.std, s.variance, s.iqr
            ));
        }
    }
    format!(
        "== Central tendency and variability ==\nmeasures per numeric column (mean, median, mode, std, variance, IQR):\n{}",
        lines.join("\n")
    )
}

fn frequency_outliers_text(table: &Table) -> String {
    let mut sections = Vec::new();

    let categorical = table.categorical_column_indices();
    if categorical.is_empty() {
        sections.push("top values:\n  none detected: no categorical columns".to_string());
    } else {
        let mut lines = Vec::new();
        for &idx in &categorical {
            let values = table.column_values(idx);
            let counts = table::value_counts(&values);
            let top: Vec<String> = counts
                .iter()
                .take(TOP_K_VALUES)
                .map(|(v, c)| format!("{}={}", v, c))
                .collect();
            lines.push(format!("  {}: {}", table.columns[idx], top.join(", ")));
        }
        sections.push(format!("top values per categorical column:\n{}", lines.join("\n")));
    }

    let numeric = table.numeric_column_indices();
    if numeric.is_empty() {
        sections.push("outliers:\n  none detected: no numeric columns".to_string());
    } else {
        let mut lines = Vec::new();
        for &idx in &numeric {
            let values = table.numeric_values(idx);
            lines.push(format!(
                "  {}: {} IQR outliers",
                table.columns[idx],
                table::iqr_outlier_count(&values)
            ));
        }
        sections.push(format!("IQR outlier counts per numeric column:\n{}", lines.join("\n")));
    }

    format!("== Frequencies and outliers ==\n{}", sections.join("\n\n"))
}

fn correlations_text(table: &Table) -> String {
    let numeric: Vec<usize> = table
        .numeric_column_indices()
        .into_iter()
        .take(CORRELATION_COLS)
        .collect();
    if numeric.len() < 2 {
        return "== Correlations ==\nnone detected: fewer than two numeric columns".to_string();
    }

    let pairs = table::correlation_pairs(table, &numeric);
    let mut matrix_lines = Vec::new();
    for (i, j, r) in &pairs {
        matrix_lines.push(format!(
            "  {} vs {}: r={:.4}",
            table.columns[*i], table.columns[*j], r
        ));
    }

    let strong: Vec<String> = pairs
        .iter()
        .filter(|(_, _, r)| r.abs() > 0.7)
        .map(|(i, j, r)| format!("  {} vs {}: r={:.4}", table.columns[*i], table.columns[*j], r))
        .collect();
    let strong_section = if strong.is_empty() {
        "strong correlations (|r| > 0.7):\n  none detected".to_string()
    } else {
        format!("strong correlations (|r| > 0.7):\n{}", strong.join("\n"))
    };

    format!(
        "== Correlations ==\npairwise Pearson correlations (first {} numeric columns):\n{}\n\n{}",
        numeric.len(),
        matrix_lines.join("\n"),
        strong_section
    )
}

fn patterns_clusters_text(table: &Table) -> String {
    let mut sections = Vec::new();

    let temporal = table.temporal_column_indices();
    if temporal.is_empty() {
        sections.push("temporal range:\n  none detected: no temporal columns".to_string());
    } else {
        let mut lines = Vec::new();
        for &idx in &temporal {
            let raw = table.column_values(idx);
            if table.is_numeric(idx) {
                let values = table.numeric_values(idx);
                if let Some(s) = table::numeric_summary(&values) {
                    lines.push(format!(
                        "  {}: numeric range {:.4} .. {:.4}",
                        table.columns[idx], s.min, s.max
                    ));
                }
            } else if !raw.is_empty() {
                let mut sorted = raw.clone();
                sorted.sort_unstable();
                lines.push(format!(
                    "  {}: {} .. {}",
                    table.columns[idx],
                    sorted[0],
                    sorted[sorted.len() - 1]
                ));
            }
        }
        sections.push(format!("temporal range per temporal column:\n{}", lines.join("\n")));
    }

    let categorical = table.categorical_column_indices();
    if categorical.is_empty() {
        sections.push("group sizes:\n  none detected: no categorical columns".to_string());
    } else {
        let mut lines = Vec::new();
        for &idx in &categorical {
            let values = table.column_values(idx);
            let counts = table::value_counts(&values);
            let groups: Vec<String> = counts
                .iter()
                .take(TOP_K_VALUES)
                .map(|(v, c)| format!("{}={}", v, c))
                .collect();
            lines.push(format!(
                "  {} ({} groups): {}",
                table.columns[idx],
                counts.len(),
                groups.join(", ")
            ));
        }
        sections.push(format!("group sizes per categorical column:\n{}", lines.join("\n")));
    }

    format!("== Patterns and clusters ==\n{}", sections.join("\n\n"))
}

// ============ CSV_ROW stream ============

/// Slide a window of `rows_per_chunk` rows with `overlap` overlapping rows.
/// The header line is prepended inside every chunk; `overlap` is clamped to
/// `rows_per_chunk - 1`. Row numbers in metadata are 1-based.
pub fn row_window_chunks(
    table: &Table,
    source_id: &str,
    rows_per_chunk: usize,
    overlap: usize,
) -> Vec<Chunk> {
    let rows_per_chunk = rows_per_chunk.max(1);
    let overlap = overlap.min(rows_per_chunk - 1);
    let step = rows_per_chunk - overlap;
    let header = table.header_line();

    let mut chunks = Vec::new();
    let mut start = 0usize;
    let mut index = 0i64;
    while start < table.n_rows() {
        let end = (start + rows_per_chunk).min(table.n_rows());
        let mut lines = Vec::with_capacity(end - start + 1);
        lines.push(header.clone());
        for r in start..end {
            lines.push(table.row_line(r));
        }
        let metadata = ChunkMetadata::new(source_id, "row_window", index, ChunkStrategy::CsvRow)
            .with("start_row", json!(start + 1))
            .with("end_row", json!(end))
            .with("csv_rows", json!(end - start))
            .with("overlap_rows", json!(overlap));
        chunks.push(Chunk::new(lines.join("\n"), metadata));
        index += 1;
        if end == table.n_rows() {
            break;
        }
        start += step;
    }
    chunks
}

// ============ CSV_COLUMN stream ============

/// One dataset-overview chunk followed by one chunk per column.
pub fn column_chunks(table: &Table, source_id: &str) -> Vec<Chunk> {
    let mut chunks = Vec::with_capacity(table.n_cols() + 1);

    let dtypes: Vec<String> = (0..table.n_cols())
        .map(|i| format!("  {}: {}", table.columns[i], table.classify(i).as_str()))
        .collect();
    let overview = format!(
        "== Dataset overview ==\nshape: {} rows x {} columns\ncolumns: {}\n\ndtypes:\n{}",
        table.n_rows(),
        table.n_cols(),
        table.columns.join(", "),
        dtypes.join("\n")
    );
    chunks.push(Chunk::new(
        overview,
        ChunkMetadata::new(source_id, "dataset_overview", 0, ChunkStrategy::CsvColumn),
    ));

    for idx in 0..table.n_cols() {
        let kind = table.classify(idx);
        let is_numeric = table.is_numeric(idx);
        let null_count = table.null_count(idx);
        let unique_count = table.unique_count(idx);
        let samples: Vec<&str> = table
            .rows
            .iter()
            .take(10)
            .map(|r| r[idx].as_str())
            .collect();

        let body = if is_numeric {
            let values = table.numeric_values(idx);
            match table::numeric_summary(&values) {
                Some(s) => format!(
                    "count: {}\nnulls: {}\nunique: {}\nmin: {:.4}\nmax: {:.4}\nmean: {:.4}\nmedian: {:.4}\nmode: {:.4}\nstd: {:.4}\nvariance: {:.4}\nq1: {:.4}\nq2: {:.4}\nq3: {:.4}\niqr: {:.4}",
                    s.count, null_count, unique_count,
                    s.min, s.max, s.mean, s.median, s.mode, s.std, s.variance,
                    s.q1, s.q2, s.q3, s.iqr
                ),
                None => format!("count: 0\nnulls: {}\nunique: {}", null_count, unique_count),
            }
        } else {
            let values = table.column_values(idx);
            let counts = table::value_counts(&values);
            let top: Vec<String> = counts
                .iter()
                .take(10)
                .map(|(v, c)| format!("  {}: {}", v, c))
                .collect();
            let mode_section = counts
                .first()
                .map(|(v, c)| {
                    let share = if values.is_empty() {
                        0.0
                    } else {
                        *c as f64 / values.len() as f64
                    };
                    format!("mode: {} (count: {}, share: {:.2}%)", v, c, share * 100.0)
                })
                .unwrap_or_else(|| "mode: none detected".to_string());
            format!(
                "count: {}\nnulls: {}\nunique: {}\n{}\ntop values:\n{}",
                values.len(),
                null_count,
                unique_count,
                mode_section,
                top.join("\n")
            )
        };

        let text = format!(
            "== Column: {} ==\ndtype: {}\n{}\n\nfirst sample values: {}",
            table.columns[idx],
            kind.as_str(),
            body,
            samples.join(", ")
        );

        let metadata = ChunkMetadata::new(
            source_id,
            "column_analysis",
            (idx + 1) as i64,
            ChunkStrategy::CsvColumn,
        )
        .with("column_name", json!(table.columns[idx]))
        .with("column_dtype", json!(kind.as_str()))
        .with("is_numeric", json!(is_numeric))
        .with("null_count", json!(null_count))
        .with("unique_count", json!(unique_count));
        chunks.push(Chunk::new(text, metadata));
    }

    chunks
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_table() -> Table {
        let mut csv = String::from("Time,Amount,Class,city\n");
        for i in 0..50 {
            csv.push_str(&format!(
                "{},{:.2},{},{}\n",
                i * 10,
                100.0 + i as f64 * 3.5,
                i % 2,
                if i % 3 == 0 { "Lisboa" } else { "Porto" }
            ));
        }
        Table::parse_csv(&csv).unwrap()
    }

    #[test]
    fn test_metadata_stream_emits_exactly_six() {
        let table = sample_table();
        let chunks = metadata_chunks(&table, "sample_00000000");
        assert_eq!(chunks.len(), 6);
        let types: Vec<&str> = chunks.iter().map(|c| c.metadata.chunk_type.as_str()).collect();
        assert_eq!(types, ANALYTICAL_CHUNK_TYPES.to_vec());
        for (i, c) in chunks.iter().enumerate() {
            assert_eq!(c.metadata.chunk_index, i as i64);
            assert_eq!(c.metadata.strategy, ChunkStrategy::Metadata);
            assert!(!c.text.is_empty());
            assert!(c.metadata.extra.contains_key("topic"));
        }
    }

    #[test]
    fn test_metadata_stream_deterministic() {
        let table = sample_table();
        let a = metadata_chunks(&table, "s");
        let b = metadata_chunks(&table, "s");
        for (x, y) in a.iter().zip(b.iter()) {
            assert_eq!(x.text, y.text);
            assert_eq!(x.metadata.chunk_type, y.metadata.chunk_type);
        }
    }

    #[test]
    fn test_types_chunk_mentions_counts() {
        let table = sample_table();
        let chunks = metadata_chunks(&table, "s");
        assert!(chunks[0].text.contains("columns: 4"));
        assert!(chunks[0].text.contains("numeric columns:"));
    }

    #[test]
    fn test_no_temporal_column_gets_none_detected_stanza() {
        let table = Table::parse_csv("a,b\n1,x\n2,y\n3,z\n").unwrap();
        let chunks = metadata_chunks(&table, "s");
        assert!(chunks[5].text.contains("none detected"));
    }

    #[test]
    fn test_correlations_single_numeric_column() {
        let table = Table::parse_csv("a,b\n1,x\n2,y\n").unwrap();
        let chunks = metadata_chunks(&table, "s");
        assert!(chunks[4].text.contains("none detected"));
    }

    #[test]
    fn test_row_windows_cover_all_rows_with_overlap() {
        let table = sample_table(); // 50 rows
        let chunks = row_window_chunks(&table, "s", 20, 4);
        // step 16: windows [1,20], [17,36], [33,50]
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0].metadata.extra["start_row"], json!(1));
        assert_eq!(chunks[0].metadata.extra["end_row"], json!(20));
        assert_eq!(chunks[1].metadata.extra["start_row"], json!(17));
        assert_eq!(chunks[2].metadata.extra["end_row"], json!(50));
        // header inside every chunk
        for c in &chunks {
            assert!(c.text.starts_with("Time,Amount,Class,city"));
        }
    }

    #[test]
    fn test_row_window_overlap_clamped() {
        let table = sample_table();
        let chunks = row_window_chunks(&table, "s", 5, 50);
        assert_eq!(chunks[0].metadata.extra["overlap_rows"], json!(4));
        // step of 1 must still terminate and cover the last row
        let last = chunks.last().unwrap();
        assert_eq!(last.metadata.extra["end_row"], json!(50));
    }

    #[test]
    fn test_column_stream_one_overview_plus_one_per_column() {
        let table = sample_table();
        let chunks = column_chunks(&table, "s");
        assert_eq!(chunks.len(), 5);
        assert_eq!(chunks[0].metadata.chunk_type, "dataset_overview");
        assert!(chunks[0].text.contains("50 rows x 4 columns"));
        for c in &chunks[1..] {
            assert_eq!(c.metadata.chunk_type, "column_analysis");
            assert!(c.metadata.extra.contains_key("column_name"));
            assert!(c.metadata.extra.contains_key("is_numeric"));
        }
    }

    #[test]
    fn test_numeric_column_chunk_has_quartiles() {
        let table = sample_table();
        let chunks = column_chunks(&table, "s");
        let amount = chunks
            .iter()
            .find(|c| c.metadata.extra.get("column_name") == Some(&json!("Amount")))
            .unwrap();
        assert!(amount.text.contains("q1:"));
        assert!(amount.text.contains("iqr:"));
        assert!(amount.text.contains("first sample values:"));
    }

    #[test]
    fn test_categorical_column_chunk_has_mode_share() {
        let table = sample_table();
        let chunks = column_chunks(&table, "s");
        let city = chunks
            .iter()
            .find(|c| c.metadata.extra.get("column_name") == Some(&json!("city")))
            .unwrap();
        assert!(city.text.contains("mode: Porto"));
        assert!(city.text.contains("share:"));
    }

    #[test]
    fn test_aspect_mapping() {
        assert_eq!(aspect_of("metadata_correlations"), Some("correlations"));
        assert_eq!(aspect_of("complementary_correlations"), Some("correlations"));
        assert_eq!(aspect_of("row_window"), None);
        assert_eq!(complementary_type("outliers"), "complementary_outliers");
    }
}
