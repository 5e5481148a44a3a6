//! Query fragmentation: split a (question, table) pair into sub-queries
//! whose per-call token estimate fits the downstream model budget.
//!
//! Fragments are independent of one another, so the planner may execute
//! them in any order; their union covers every row and column the original
//! question touches.

use serde::{Deserialize, Serialize};

use crate::table::Table;

/// Rough cost per table cell, in tokens.
const TOKENS_PER_CELL: usize = 2;

/// Column groups include this many columns per fragment when the question
/// names more than one group's worth.
const COLUMNS_PER_GROUP: usize = 8;

/// When the question names at most this many columns and the data fits, no
/// fragmentation is needed.
const UNFRAGMENTED_COLUMN_LIMIT: usize = 10;

/// One independently executable sub-query.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Fragment {
    pub fragment_id: String,
    /// 1-based inclusive data-row range, when partitioned by rows.
    pub row_range: Option<(usize, usize)>,
    /// Column subset, when partitioned by column groups.
    pub columns: Option<Vec<String>>,
    pub sub_question: String,
    pub est_tokens: usize,
}

/// The fragmentation decision for one question.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FragmentPlan {
    pub needs_fragmentation: bool,
    pub fragments: Vec<Fragment>,
    pub reason: String,
}

/// Estimated token cost of sending `rows x cols` cells plus the question.
pub fn estimate_tokens(question: &str, rows: usize, cols: usize) -> usize {
    question.len() / 4 + rows * cols * TOKENS_PER_CELL
}

/// Columns of the table that the question names verbatim
/// (case-insensitive, word-ish match).
pub fn mentioned_columns(question: &str, table: &Table) -> Vec<String> {
    let lower = question.to_lowercase();
    table
        .columns
        .iter()
        .filter(|name| {
            let needle = name.to_lowercase();
            lower
                .match_indices(&needle)
                .any(|(at, _)| is_word_boundary(&lower, at, needle.len()))
        })
        .cloned()
        .collect()
}

fn is_word_boundary(text: &str, at: usize, len: usize) -> bool {
    let before_ok = at == 0
        || text[..at]
            .chars()
            .next_back()
            .is_none_or(|c| !c.is_alphanumeric());
    let after_ok = text[at + len..]
        .chars()
        .next()
        .is_none_or(|c| !c.is_alphanumeric());
    before_ok && after_ok
}

/// Decide whether and how to split the question over the table.
pub fn fragment(question: &str, table: &Table, token_budget: usize) -> FragmentPlan {
    let token_budget = token_budget.max(1);
    let mentioned = mentioned_columns(question, table);
    let full_estimate = estimate_tokens(question, table.n_rows(), table.n_cols());

    if full_estimate <= token_budget && mentioned.len() <= UNFRAGMENTED_COLUMN_LIMIT {
        return FragmentPlan {
            needs_fragmentation: false,
            fragments: Vec::new(),
            reason: "fits budget".to_string(),
        };
    }

    if !mentioned.is_empty() {
        FragmentPlan {
            needs_fragmentation: true,
            fragments: column_group_fragments(question, table, &mentioned, token_budget),
            reason: format!(
                "estimate {} exceeds budget {}; partitioning {} named columns into groups",
                full_estimate,
                token_budget,
                mentioned.len()
            ),
        }
    } else {
        FragmentPlan {
            needs_fragmentation: true,
            fragments: row_range_fragments(question, table, token_budget),
            reason: format!(
                "estimate {} exceeds budget {}; partitioning by row ranges",
                full_estimate, token_budget
            ),
        }
    }
}

fn column_group_fragments(
    question: &str,
    table: &Table,
    mentioned: &[String],
    token_budget: usize,
) -> Vec<Fragment> {
    let mut fragments = Vec::new();
    for (idx, group) in mentioned.chunks(COLUMNS_PER_GROUP).enumerate() {
        let group: Vec<String> = group.to_vec();
        let estimate = estimate_tokens(question, table.n_rows(), group.len());
        if estimate <= token_budget {
            fragments.push(make_column_fragment(question, idx, group, None, estimate));
        } else {
            // The group alone is too wide against the full row count, so
            // split its rows as well.
            let rows_per = rows_fitting(question, group.len(), token_budget, table.n_rows());
            let mut start = 0usize;
            let mut sub = 0usize;
            while start < table.n_rows() {
                let end = (start + rows_per).min(table.n_rows());
                let estimate = estimate_tokens(question, end - start, group.len());
                fragments.push(make_column_fragment(
                    question,
                    idx * 1000 + sub,
                    group.clone(),
                    Some((start + 1, end)),
                    estimate,
                ));
                start = end;
                sub += 1;
            }
        }
    }
    fragments
}

fn make_column_fragment(
    question: &str,
    idx: usize,
    columns: Vec<String>,
    row_range: Option<(usize, usize)>,
    est_tokens: usize,
) -> Fragment {
    let scope = match row_range {
        Some((a, b)) => format!(
            "restricted to columns {{{}}} and rows {}..{}",
            columns.join(", "),
            a,
            b
        ),
        None => format!("restricted to columns {{{}}}", columns.join(", ")),
    };
    Fragment {
        fragment_id: format!("cols_{}", idx),
        row_range,
        columns: Some(columns),
        sub_question: format!("{} ({})", question, scope),
        est_tokens,
    }
}

fn rows_fitting(question: &str, cols: usize, token_budget: usize, total_rows: usize) -> usize {
    let question_cost = question.len() / 4;
    let per_row = cols.max(1) * TOKENS_PER_CELL;
    let budget_rows = token_budget.saturating_sub(question_cost) / per_row;
    budget_rows.max(1).min(total_rows.max(1))
}

fn row_range_fragments(question: &str, table: &Table, token_budget: usize) -> Vec<Fragment> {
    let rows_per = rows_fitting(question, table.n_cols(), token_budget, table.n_rows());
    let mut fragments = Vec::new();
    let mut start = 0usize;
    let mut idx = 0usize;
    while start < table.n_rows() {
        let end = (start + rows_per).min(table.n_rows());
        fragments.push(Fragment {
            fragment_id: format!("rows_{}", idx),
            row_range: Some((start + 1, end)),
            columns: None,
            sub_question: format!("{} (restricted to rows {}..{})", question, start + 1, end),
            est_tokens: estimate_tokens(question, end - start, table.n_cols()),
        });
        start = end;
        idx += 1;
    }
    fragments
}

#[cfg(test)]
mod tests {
    use super::*;

    fn wide_table(rows: usize, cols: usize) -> Table {
        let columns: Vec<String> = (0..cols).map(|i| format!("V{}", i + 1)).collect();
        let data = (0..rows)
            .map(|r| (0..cols).map(|c| ((r + c) as f64).to_string()).collect())
            .collect();
        Table {
            columns,
            rows: data,
        }
    }

    #[test]
    fn test_small_table_fits_budget() {
        let table = wide_table(50, 4);
        let plan = fragment("Qual a média de V1?", &table, 6000);
        assert!(!plan.needs_fragmentation);
        assert!(plan.fragments.is_empty());
        assert_eq!(plan.reason, "fits budget");
    }

    #[test]
    fn test_large_table_splits_by_rows() {
        let table = wide_table(5000, 28);
        let plan = fragment("Resuma os dados de cada registro", &table, 6000);
        assert!(plan.needs_fragmentation);
        assert!(plan.fragments.len() >= 2);
        for f in &plan.fragments {
            assert!(f.est_tokens <= 6000, "fragment {} over budget", f.fragment_id);
            assert!(f.row_range.is_some());
            assert!(f.columns.is_none());
        }
        // Ranges tile the table without gaps.
        let mut expected_start = 1;
        for f in &plan.fragments {
            let (a, b) = f.row_range.unwrap();
            assert_eq!(a, expected_start);
            expected_start = b + 1;
        }
        assert_eq!(expected_start, 5001);
    }

    #[test]
    fn test_named_columns_split_by_column_groups() {
        let table = wide_table(5000, 28);
        let names = table.columns.join(", ");
        let question = format!("Compare as colunas {}", names);
        let plan = fragment(&question, &table, 6000);
        assert!(plan.needs_fragmentation);
        assert!(plan.fragments.len() >= 2);
        for f in &plan.fragments {
            assert!(f.est_tokens <= 6000);
            assert!(f.columns.is_some());
        }
        // Every named column appears in some fragment.
        let covered: Vec<&String> = plan
            .fragments
            .iter()
            .flat_map(|f| f.columns.as_ref().unwrap())
            .collect();
        for name in &table.columns {
            assert!(covered.contains(&name), "column {} not covered", name);
        }
    }

    #[test]
    fn test_mentioned_columns_respects_word_boundaries() {
        let table = wide_table(10, 12);
        // "V1" must not match inside "V12".
        let found = mentioned_columns("média de V1 apenas", &table);
        assert_eq!(found, vec!["V1".to_string()]);
    }

    #[test]
    fn test_sub_question_scopes_the_original() {
        let table = wide_table(5000, 28);
        let plan = fragment("Resuma os valores por registro", &table, 6000);
        let f = &plan.fragments[0];
        assert!(f.sub_question.contains("Resuma os valores"));
        assert!(f.sub_question.contains("rows 1.."));
    }

    #[test]
    fn test_estimate_formula() {
        assert_eq!(estimate_tokens("12345678", 10, 3), 2 + 10 * 3 * TOKENS_PER_CELL);
    }
}
