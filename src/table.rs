//! In-memory tabular data and descriptive statistics.
//!
//! A [`Table`] is parsed once from CSV text and treated as read-only for the
//! rest of the turn. All the statistics the chunker and planner need (summary
//! measures, quartiles, value counts, correlations, IQR outliers) live here
//! as pure functions so they can be exercised without any I/O.

use crate::error::{CoreError, Result};

/// Semantic column classification, decided by dtype plus heuristics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnKind {
    Numeric,
    /// Numeric, integral, near-unique, with an id-like name.
    NumericId,
    Categorical,
    /// Categorical with exactly two distinct values.
    Binary,
    Temporal,
}

impl ColumnKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ColumnKind::Numeric => "numeric",
            ColumnKind::NumericId => "numeric_id",
            ColumnKind::Categorical => "categorical",
            ColumnKind::Binary => "binary",
            ColumnKind::Temporal => "temporal",
        }
    }
}

/// A parsed CSV table. Rows hold raw cell strings; numeric interpretation
/// happens on demand.
#[derive(Debug, Clone)]
pub struct Table {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<String>>,
}

impl Table {
    /// Parse CSV text (quote-aware, `""` escapes, CRLF tolerant).
    ///
    /// Short rows are padded with empty cells; long rows are truncated to the
    /// header width. Fails on empty input or an empty header.
    pub fn parse_csv(text: &str) -> Result<Table> {
        let mut records = parse_csv_records(text);
        if records.is_empty() {
            return Err(CoreError::InvalidInput("empty CSV".to_string()));
        }
        let columns = records.remove(0);
        if columns.iter().all(|c| c.trim().is_empty()) {
            return Err(CoreError::InvalidInput("CSV header is empty".to_string()));
        }
        let width = columns.len();
        let rows: Vec<Vec<String>> = records
            .into_iter()
            .filter(|r| !(r.len() == 1 && r[0].trim().is_empty()))
            .map(|mut r| {
                r.resize(width, String::new());
                r
            })
            .collect();
        Ok(Table { columns, rows })
    }

    pub fn n_rows(&self) -> usize {
        self.rows.len()
    }

    pub fn n_cols(&self) -> usize {
        self.columns.len()
    }

    /// The header as a CSV line, re-escaped.
    pub fn header_line(&self) -> String {
        format_csv_row(&self.columns)
    }

    /// A data row as a CSV line, re-escaped. 0-based index.
    pub fn row_line(&self, index: usize) -> String {
        format_csv_row(&self.rows[index])
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns
            .iter()
            .position(|c| c.eq_ignore_ascii_case(name))
    }

    /// Non-null raw values of a column.
    pub fn column_values(&self, idx: usize) -> Vec<&str> {
        self.rows
            .iter()
            .map(|r| r[idx].as_str())
            .filter(|v| !is_null(v))
            .collect()
    }

    pub fn null_count(&self, idx: usize) -> usize {
        self.rows.iter().filter(|r| is_null(&r[idx])).count()
    }

    pub fn unique_count(&self, idx: usize) -> usize {
        let mut values: Vec<&str> = self.column_values(idx);
        values.sort_unstable();
        values.dedup();
        values.len()
    }

    /// Parsed numeric values of a column (nulls and non-numeric cells skipped).
    pub fn numeric_values(&self, idx: usize) -> Vec<f64> {
        self.column_values(idx)
            .iter()
            .filter_map(|v| v.trim().parse::<f64>().ok())
            .collect()
    }

    /// Whether at least 90% of the column's non-null values parse as numbers.
    pub fn is_numeric(&self, idx: usize) -> bool {
        let values = self.column_values(idx);
        if values.is_empty() {
            return false;
        }
        let parsed = values
            .iter()
            .filter(|v| v.trim().parse::<f64>().is_ok())
            .count();
        parsed as f64 / values.len() as f64 >= 0.9
    }

    /// Classify a column by dtype plus heuristics.
    pub fn classify(&self, idx: usize) -> ColumnKind {
        let name = self.columns[idx].to_lowercase();
        let values = self.column_values(idx);
        let numeric = self.is_numeric(idx);

        let temporal_name = name.contains("date")
            || name.contains("time")
            || name.contains("timestamp")
            || name.ends_with("_at");
        if temporal_name || looks_temporal(&values) {
            return ColumnKind::Temporal;
        }

        if numeric {
            let nums = self.numeric_values(idx);
            let integral = nums.iter().all(|v| v.fract() == 0.0);
            let unique = self.unique_count(idx);
            let id_name = name == "id" || name.ends_with("_id") || name.ends_with("id");
            if integral
                && id_name
                && !values.is_empty()
                && unique as f64 / values.len() as f64 > 0.95
            {
                return ColumnKind::NumericId;
            }
            return ColumnKind::Numeric;
        }

        if self.unique_count(idx) == 2 {
            return ColumnKind::Binary;
        }
        ColumnKind::Categorical
    }

    /// Indices of numeric columns (temporal columns with numeric values count).
    pub fn numeric_column_indices(&self) -> Vec<usize> {
        (0..self.n_cols()).filter(|&i| self.is_numeric(i)).collect()
    }

    /// Indices of non-numeric columns.
    pub fn categorical_column_indices(&self) -> Vec<usize> {
        (0..self.n_cols())
            .filter(|&i| !self.is_numeric(i))
            .collect()
    }

    /// Indices of columns classified temporal.
    pub fn temporal_column_indices(&self) -> Vec<usize> {
        (0..self.n_cols())
            .filter(|&i| self.classify(i) == ColumnKind::Temporal)
            .collect()
    }

    /// A copy containing rows `[start, end)` (0-based, clamped).
    pub fn slice_rows(&self, start: usize, end: usize) -> Table {
        let end = end.min(self.n_rows());
        let start = start.min(end);
        Table {
            columns: self.columns.clone(),
            rows: self.rows[start..end].to_vec(),
        }
    }

    /// A copy containing only the named columns, in the given order.
    /// Unknown names are skipped.
    pub fn select_columns(&self, names: &[String]) -> Table {
        let indices: Vec<usize> = names
            .iter()
            .filter_map(|n| self.column_index(n))
            .collect();
        Table {
            columns: indices.iter().map(|&i| self.columns[i].clone()).collect(),
            rows: self
                .rows
                .iter()
                .map(|r| indices.iter().map(|&i| r[i].clone()).collect())
                .collect(),
        }
    }
}

/// Whether a raw cell counts as null.
pub fn is_null(value: &str) -> bool {
    let v = value.trim();
    v.is_empty() || matches!(v.to_ascii_lowercase().as_str(), "na" | "n/a" | "null" | "nan")
}

fn looks_temporal(values: &[&str]) -> bool {
    if values.is_empty() {
        return false;
    }
    let sample = &values[..values.len().min(50)];
    let parsed = sample
        .iter()
        .filter(|v| {
            let v = v.trim();
            chrono::NaiveDate::parse_from_str(v, "%Y-%m-%d").is_ok()
                || chrono::NaiveDate::parse_from_str(v, "%Y/%m/%d").is_ok()
                || chrono::NaiveDateTime::parse_from_str(v, "%Y-%m-%d %H:%M:%S").is_ok()
                || chrono::DateTime::parse_from_rfc3339(v).is_ok()
        })
        .count();
    parsed as f64 / sample.len() as f64 >= 0.8
}

// ============ CSV parsing / formatting ============

fn parse_csv_records(text: &str) -> Vec<Vec<String>> {
    let mut records = Vec::new();
    let mut record = Vec::new();
    let mut field = String::new();
    let mut in_quotes = false;
    let mut chars = text.chars().peekable();

    while let Some(c) = chars.next() {
        if in_quotes {
            match c {
                '"' => {
                    if chars.peek() == Some(&'"') {
                        chars.next();
                        field.push('"');
                    } else {
                        in_quotes = false;
                    }
                }
                _ => field.push(c),
            }
        } else {
            match c {
                '"' => in_quotes = true,
                ',' => {
                    record.push(std::mem::take(&mut field));
                    }
                '\r' => {}
                '\n' => {
                    record.push(std::mem::take(&mut field));
                    records.push(std::mem::take(&mut record));
                }
                _ => field.push(c),
            }
        }
    }
    if !field.is_empty() || !record.is_empty() {
        record.push(field);
        records.push(record);
    }
    records
}

fn format_csv_row(cells: &[String]) -> String {
    cells
        .iter()
        .map(|c| {
            if c.contains(',') || c.contains('"') || c.contains('\n') {
                format!("\"{}\"", c.replace('"', "\"\""))
            } else {
                c.clone()
            }
        })
        .collect::<Vec<_>>()
        .join(",")
}

// ============ Descriptive statistics ============

/// Summary measures over a numeric column.
#[derive(Debug, Clone)]
pub struct NumericSummary {
    pub count: usize,
    pub min: f64,
    pub max: f64,
    pub mean: f64,
    pub median: f64,
    pub mode: f64,
    pub std: f64,
    pub variance: f64,
    pub q1: f64,
    pub q2: f64,
    pub q3: f64,
    pub iqr: f64,
}

/// Compute summary measures; `None` for an empty slice.
pub fn numeric_summary(values: &[f64]) -> Option<NumericSummary> {
    if values.is_empty() {
        return None;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));

    let count = sorted.len();
    let min = sorted[0];
    let max = sorted[count - 1];
    let mean = sorted.iter().sum::<f64>() / count as f64;
    let variance = sorted.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / count as f64;
    let std = variance.sqrt();
    let q1 = quantile(&sorted, 0.25);
    let q2 = quantile(&sorted, 0.5);
    let q3 = quantile(&sorted, 0.75);

    Some(NumericSummary {
        count,
        min,
        max,
        mean,
        median: q2,
        mode: mode_of(&sorted),
        std,
        variance,
        q1,
        q2,
        q3,
        iqr: q3 - q1,
    })
}

/// Linear-interpolated quantile over a pre-sorted slice.
pub fn quantile(sorted: &[f64], p: f64) -> f64 {
    if sorted.is_empty() {
        return f64::NAN;
    }
    if sorted.len() == 1 {
        return sorted[0];
    }
    let pos = p * (sorted.len() - 1) as f64;
    let lo = pos.floor() as usize;
    let hi = pos.ceil() as usize;
    if lo == hi {
        sorted[lo]
    } else {
        let frac = pos - lo as f64;
        sorted[lo] + (sorted[hi] - sorted[lo]) * frac
    }
}

fn mode_of(sorted: &[f64]) -> f64 {
    let mut best = sorted[0];
    let mut best_count = 0usize;
    let mut current = sorted[0];
    let mut current_count = 0usize;
    for &v in sorted {
        if v == current {
            current_count += 1;
        } else {
            current = v;
            current_count = 1;
        }
        if current_count > best_count {
            best = current;
            best_count = current_count;
        }
    }
    best
}

/// Value frequencies sorted by descending count, ties broken lexically.
pub fn value_counts(values: &[&str]) -> Vec<(String, usize)> {
    let mut counts: std::collections::HashMap<&str, usize> = std::collections::HashMap::new();
    for v in values {
        *counts.entry(v).or_insert(0) += 1;
    }
    let mut pairs: Vec<(String, usize)> = counts
        .into_iter()
        .map(|(v, c)| (v.to_string(), c))
        .collect();
    pairs.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
    pairs
}

/// Pearson correlation over paired values; 0.0 when degenerate.
pub fn pearson(a: &[f64], b: &[f64]) -> f64 {
    let n = a.len().min(b.len());
    if n < 2 {
        return 0.0;
    }
    let a = &a[..n];
    let b = &b[..n];
    let mean_a = a.iter().sum::<f64>() / n as f64;
    let mean_b = b.iter().sum::<f64>() / n as f64;
    let mut cov = 0.0;
    let mut var_a = 0.0;
    let mut var_b = 0.0;
    for i in 0..n {
        let da = a[i] - mean_a;
        let db = b[i] - mean_b;
        cov += da * db;
        var_a += da * da;
        var_b += db * db;
    }
    let denom = (var_a * var_b).sqrt();
    if denom < f64::EPSILON {
        0.0
    } else {
        cov / denom
    }
}

/// Pairwise correlations for the given numeric columns, rows where both
/// cells parse. Returns `(col_i, col_j, r)` for i < j.
pub fn correlation_pairs(table: &Table, indices: &[usize]) -> Vec<(usize, usize, f64)> {
    let mut pairs = Vec::new();
    for (pos, &i) in indices.iter().enumerate() {
        for &j in &indices[pos + 1..] {
            let mut xs = Vec::new();
            let mut ys = Vec::new();
            for row in &table.rows {
                if let (Ok(x), Ok(y)) = (
                    row[i].trim().parse::<f64>(),
                    row[j].trim().parse::<f64>(),
                ) {
                    xs.push(x);
                    ys.push(y);
                }
            }
            pairs.push((i, j, pearson(&xs, &ys)));
        }
    }
    pairs
}

/// Count of values outside `[Q1 - 1.5*IQR, Q3 + 1.5*IQR]`.
pub fn iqr_outlier_count(values: &[f64]) -> usize {
    let summary = match numeric_summary(values) {
        Some(s) => s,
        None => return 0,
    };
    let lo = summary.q1 - 1.5 * summary.iqr;
    let hi = summary.q3 + 1.5 * summary.iqr;
    values.iter().filter(|&&v| v < lo || v > hi).count()
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "name,age,city\nalice,30,Lisboa\nbob,25,Porto\ncarol,35,Lisboa\n";

    #[test]
    fn test_parse_basic_csv() {
        let table = Table::parse_csv(SAMPLE).unwrap();
        assert_eq!(table.columns, vec!["name", "age", "city"]);
        assert_eq!(table.n_rows(), 3);
        assert_eq!(table.rows[1], vec!["bob", "25", "Porto"]);
    }

    #[test]
    fn test_parse_quoted_fields() {
        let text = "a,b\n\"hello, world\",\"say \"\"hi\"\"\"\n";
        let table = Table::parse_csv(text).unwrap();
        assert_eq!(table.rows[0][0], "hello, world");
        assert_eq!(table.rows[0][1], "say \"hi\"");
    }

    #[test]
    fn test_parse_empty_fails() {
        assert!(Table::parse_csv("").is_err());
    }

    #[test]
    fn test_header_line_reescapes() {
        let text = "a,\"b,c\"\n1,2\n";
        let table = Table::parse_csv(text).unwrap();
        assert_eq!(table.header_line(), "a,\"b,c\"");
    }

    #[test]
    fn test_short_rows_padded() {
        let table = Table::parse_csv("a,b,c\n1,2\n").unwrap();
        assert_eq!(table.rows[0], vec!["1", "2", ""]);
    }

    #[test]
    fn test_numeric_detection() {
        let table = Table::parse_csv(SAMPLE).unwrap();
        assert!(table.is_numeric(1));
        assert!(!table.is_numeric(0));
        assert_eq!(table.classify(1), ColumnKind::Numeric);
        assert_eq!(table.classify(2), ColumnKind::Binary); // two cities
    }

    #[test]
    fn test_temporal_by_name_and_value() {
        let by_name = Table::parse_csv("created_at,v\n100,1\n200,2\n").unwrap();
        assert_eq!(by_name.classify(0), ColumnKind::Temporal);

        let by_value =
            Table::parse_csv("d,v\n2024-01-01,1\n2024-01-02,2\n2024-01-03,3\n").unwrap();
        assert_eq!(by_value.classify(0), ColumnKind::Temporal);
    }

    #[test]
    fn test_numeric_id_detection() {
        let mut csv = String::from("user_id,score\n");
        for i in 0..100 {
            csv.push_str(&format!("{},{}\n", i, i % 7));
        }
        let table = Table::parse_csv(&csv).unwrap();
        assert_eq!(table.classify(0), ColumnKind::NumericId);
        assert_eq!(table.classify(1), ColumnKind::Numeric);
    }

    #[test]
    fn test_null_handling() {
        let table = Table::parse_csv("a,b\n1,x\n,y\nNA,z\n").unwrap();
        assert_eq!(table.null_count(0), 2);
        assert_eq!(table.column_values(0), vec!["1"]);
    }

    #[test]
    fn test_numeric_summary() {
        let values = vec![1.0, 2.0, 3.0, 4.0, 5.0];
        let s = numeric_summary(&values).unwrap();
        assert_eq!(s.count, 5);
        assert_eq!(s.min, 1.0);
        assert_eq!(s.max, 5.0);
        assert!((s.mean - 3.0).abs() < 1e-12);
        assert!((s.median - 3.0).abs() < 1e-12);
        assert!((s.q1 - 2.0).abs() < 1e-12);
        assert!((s.q3 - 4.0).abs() < 1e-12);
        assert!((s.iqr - 2.0).abs() < 1e-12);
    }

    #[test]
    fn test_numeric_summary_empty() {
        assert!(numeric_summary(&[]).is_none());
    }

    #[test]
    fn test_mode_picks_most_frequent() {
        let values = vec![1.0, 2.0, 2.0, 3.0, 2.0];
        let s = numeric_summary(&values).unwrap();
        assert_eq!(s.mode, 2.0);
    }

    #[test]
    fn test_pearson_perfect_correlation() {
        let a = vec![1.0, 2.0, 3.0, 4.0];
        let b = vec![2.0, 4.0, 6.0, 8.0];
        assert!((pearson(&a, &b) - 1.0).abs() < 1e-12);
        let c = vec![8.0, 6.0, 4.0, 2.0];
        assert!((pearson(&a, &c) + 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_pearson_degenerate() {
        assert_eq!(pearson(&[1.0], &[2.0]), 0.0);
        assert_eq!(pearson(&[1.0, 1.0, 1.0], &[2.0, 3.0, 4.0]), 0.0);
    }

    #[test]
    fn test_value_counts_ordering() {
        let counts = value_counts(&["b", "a", "b", "c", "a", "b"]);
        assert_eq!(counts[0], ("b".to_string(), 3));
        assert_eq!(counts[1], ("a".to_string(), 2));
        assert_eq!(counts[2], ("c".to_string(), 1));
    }

    #[test]
    fn test_iqr_outliers() {
        let mut values: Vec<f64> = (1..=20).map(|v| v as f64).collect();
        values.push(1000.0);
        assert_eq!(iqr_outlier_count(&values), 1);
    }

    #[test]
    fn test_slice_rows_clamped() {
        let table = Table::parse_csv(SAMPLE).unwrap();
        let slice = table.slice_rows(1, 100);
        assert_eq!(slice.n_rows(), 2);
        assert_eq!(slice.rows[0][0], "bob");
    }

    #[test]
    fn test_select_columns_skips_unknown() {
        let table = Table::parse_csv(SAMPLE).unwrap();
        let selected =
            table.select_columns(&["city".to_string(), "ghost".to_string(), "name".to_string()]);
        assert_eq!(selected.columns, vec!["city", "name"]);
        assert_eq!(selected.rows[0], vec!["Lisboa", "alice"]);
    }
}
