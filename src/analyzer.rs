//! Question classification: complexity, analytical category, and a strategy
//! hint for the planner.
//!
//! The primary path asks the language model for a small JSON verdict; a
//! deterministic keyword heuristic takes over whenever the model fails or
//! returns something unparseable, so analysis itself never errors out.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;

use crate::chunker::aspect_of;
use crate::llm::{ChatOptions, LlmProvider};

/// Whether summary chunks suffice or the raw table is needed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Complexity {
    Simple,
    Complex,
}

/// Analytical category of a question.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    Structure,
    Statistics,
    Distribution,
    Correlation,
    Outliers,
    Patterns,
    Visualization,
    CustomAnalysis,
    Unknown,
}

impl Category {
    pub fn as_str(&self) -> &'static str {
        match self {
            Category::Structure => "structure",
            Category::Statistics => "statistics",
            Category::Distribution => "distribution",
            Category::Correlation => "correlation",
            Category::Outliers => "outliers",
            Category::Patterns => "patterns",
            Category::Visualization => "visualization",
            Category::CustomAnalysis => "custom_analysis",
            Category::Unknown => "unknown",
        }
    }
}

/// How the planner should approach execution, derived from the
/// classification and the chunk inventory.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum StrategyHint {
    /// Simple questions: answer from chunks already in the store.
    UseExistingChunks { chunks_to_query: Vec<String> },
    /// Complex questions: consult the raw table, guided by existing chunks.
    GuidedCsvAnalysis {
        use_chunks_as_guide: bool,
        generate_new_chunks: String,
        csv_operations: Vec<String>,
    },
}

/// Classification of one question. Supports mapping-style access through
/// [`Analysis::get`] alongside the plain fields.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Analysis {
    pub query: String,
    pub complexity: Complexity,
    pub category: Category,
    pub requires_csv: bool,
    pub requires_row_level_data: bool,
    pub confidence: f64,
    pub reasoning: String,
    pub strategy: StrategyHint,
    pub fallback_used: bool,
}

impl Analysis {
    /// Mapping-style access: `a.get("category")` mirrors `a.category`.
    pub fn get(&self, key: &str) -> Option<serde_json::Value> {
        serde_json::to_value(self).ok()?.get(key).cloned()
    }
}

/// Aspects (analytical chunk-type suffixes) a category needs covered before
/// the planner can stay on the summary-only path.
pub fn required_aspects(category: Category) -> Vec<&'static str> {
    match category {
        Category::Structure => vec!["types"],
        Category::Statistics => vec!["distribution", "central_variability"],
        Category::Distribution => vec!["distribution"],
        Category::Correlation => vec!["correlations"],
        Category::Outliers => vec!["frequency_outliers"],
        Category::Patterns => vec!["patterns_clusters"],
        Category::Visualization => vec!["distribution"],
        Category::CustomAnalysis | Category::Unknown => vec!["types", "distribution"],
    }
}

/// Raw-table operations suggested to the planner for a complex question.
fn csv_operations(category: Category, requires_row_level_data: bool) -> Vec<String> {
    let mut ops: Vec<String> = match category {
        Category::Structure => vec!["profile_schema"],
        Category::Statistics => vec!["compute_detailed_statistics"],
        Category::Distribution | Category::Visualization => vec!["compute_distributions"],
        Category::Correlation => vec!["compute_correlations"],
        Category::Outliers => vec!["detect_outliers_detailed"],
        Category::Patterns => vec!["analyze_temporal_patterns"],
        Category::CustomAnalysis | Category::Unknown => vec!["general_profile"],
    }
    .into_iter()
    .map(String::from)
    .collect();
    if requires_row_level_data {
        ops.push("filter_rows".to_string());
    }
    ops
}

fn build_hint(
    complexity: Complexity,
    category: Category,
    requires_row_level_data: bool,
    available_chunk_types: &[String],
) -> StrategyHint {
    match complexity {
        Complexity::Simple => {
            let wanted = required_aspects(category);
            let chunks_to_query = available_chunk_types
                .iter()
                .filter(|ct| aspect_of(ct).is_some_and(|a| wanted.iter().any(|w| *w == a)))
                .cloned()
                .collect();
            StrategyHint::UseExistingChunks { chunks_to_query }
        }
        Complexity::Complex => StrategyHint::GuidedCsvAnalysis {
            use_chunks_as_guide: true,
            generate_new_chunks: "complementary_only".to_string(),
            csv_operations: csv_operations(category, requires_row_level_data),
        },
    }
}

/// What the model is asked to return.
#[derive(Debug, Deserialize)]
struct LlmVerdict {
    complexity: String,
    category: String,
    #[serde(default)]
    reasoning: String,
    #[serde(default = "default_confidence")]
    confidence: f64,
    #[serde(default)]
    requires_row_level_data: bool,
}

fn default_confidence() -> f64 {
    0.8
}

pub struct QueryAnalyzer {
    llm: Arc<dyn LlmProvider>,
}

impl QueryAnalyzer {
    pub fn new(llm: Arc<dyn LlmProvider>) -> Self {
        Self { llm }
    }

    /// Classify a question given the chunk types known to exist for the
    /// dataset. Infallible: model failures fall back to the heuristic.
    pub async fn analyze(&self, question: &str, available_chunk_types: &[String]) -> Analysis {
        match self.analyze_with_llm(question, available_chunk_types).await {
            Some(analysis) => analysis,
            None => {
                debug!("analyzer falling back to heuristic classification");
                heuristic_analysis(question, available_chunk_types)
            }
        }
    }

    async fn analyze_with_llm(
        &self,
        question: &str,
        available_chunk_types: &[String],
    ) -> Option<Analysis> {
        let prompt = format!(
            "You classify questions about a tabular dataset.\n\
             Available analytical chunk types: {}\n\n\
             Question: {}\n\n\
             Reply with a single JSON object, no prose:\n\
             {{\"complexity\": \"simple\"|\"complex\", \"category\": one of \
             structure|statistics|distribution|correlation|outliers|patterns|\
             visualization|custom_analysis|unknown, \"reasoning\": string, \
             \"confidence\": 0.0-1.0, \"requires_row_level_data\": bool}}\n\
             Use \"simple\" when the pre-computed summaries can answer the \
             question; \"complex\" when individual rows of the raw table are \
             needed.",
            available_chunk_types.join(", "),
            question
        );
        let response = self
            .llm
            .chat(
                &prompt,
                ChatOptions {
                    temperature: 0.1,
                    max_tokens: 512,
                },
            )
            .await
            .ok()?;
        let verdict: LlmVerdict = serde_json::from_str(strip_fences(&response.content)).ok()?;

        let complexity = match verdict.complexity.as_str() {
            "simple" => Complexity::Simple,
            "complex" => Complexity::Complex,
            _ => return None,
        };
        let category = parse_category(&verdict.category)?;
        let requires_csv = complexity == Complexity::Complex || verdict.requires_row_level_data;
        Some(Analysis {
            query: question.to_string(),
            complexity,
            category,
            requires_csv,
            requires_row_level_data: verdict.requires_row_level_data,
            confidence: verdict.confidence.clamp(0.0, 1.0),
            reasoning: verdict.reasoning,
            strategy: build_hint(
                complexity,
                category,
                verdict.requires_row_level_data,
                available_chunk_types,
            ),
            fallback_used: false,
        })
    }
}

fn parse_category(s: &str) -> Option<Category> {
    match s.trim() {
        "structure" => Some(Category::Structure),
        "statistics" => Some(Category::Statistics),
        "distribution" => Some(Category::Distribution),
        "correlation" => Some(Category::Correlation),
        "outliers" => Some(Category::Outliers),
        "patterns" => Some(Category::Patterns),
        "visualization" => Some(Category::Visualization),
        "custom_analysis" => Some(Category::CustomAnalysis),
        "unknown" => Some(Category::Unknown),
        _ => None,
    }
}

/// Tolerate Markdown fences and surrounding prose around a JSON object.
pub fn strip_fences(text: &str) -> &str {
    let trimmed = text.trim();
    let inner = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .and_then(|s| s.strip_suffix("```"))
        .map(str::trim)
        .unwrap_or(trimmed);
    match (inner.find('{'), inner.rfind('}')) {
        (Some(start), Some(end)) if start < end => &inner[start..=end],
        _ => inner,
    }
}

// ============ Heuristic fallback ============

const SIMPLE_STAT_TERMS: [&str; 18] = [
    "mean", "median", "correlation", "std", "quartile", "min", "max", "distribution",
    "histogram", "média", "mediana", "correlação", "desvio", "quartil", "mínimo", "máximo",
    "distribuição", "histograma",
];

const ROW_LEVEL_TERMS: [&str; 14] = [
    "list", "liste", "listar", "filter", "filtr", "above", "below", "acima", "abaixo",
    "specific", "específic", "each record", "cada registro", "todas as linhas",
];

/// Keyword map checked in order; first hit wins.
const CATEGORY_KEYWORDS: [(Category, &[&str]); 8] = [
    (Category::Correlation, &["correla", "relationship", "relação entre", "relaciona"]),
    (Category::Outliers, &["outlier", "anomal", "atípic", "extreme", "extremo"]),
    (
        Category::Patterns,
        &["pattern", "padrão", "padroes", "trend", "tendência", "cluster", "sazonal", "temporal"],
    ),
    (
        Category::Distribution,
        &["distribution", "distribuição", "histogram", "histograma", "spread", "frequência"],
    ),
    (
        Category::Visualization,
        &["plot", "chart", "graph", "gráfico", "visualiz"],
    ),
    (
        Category::Structure,
        &["tipo", "type", "coluna", "column", "dtype", "schema", "estrutura", "structure"],
    ),
    (
        Category::Statistics,
        &["média", "mean", "mediana", "median", "desvio", "std", "variance", "variância",
          "average", "quartil", "quartile", "soma", "sum", "mínim", "máxim"],
    ),
    (
        Category::CustomAnalysis,
        &["calcule", "calculate", "compute", "derive"],
    ),
];

/// Deterministic classification used when the model is unavailable.
pub fn heuristic_analysis(question: &str, available_chunk_types: &[String]) -> Analysis {
    let lower = question.to_lowercase();
    let token_count = lower.split_whitespace().count();

    let has_stat_term = SIMPLE_STAT_TERMS.iter().any(|t| lower.contains(t));
    let has_row_term = ROW_LEVEL_TERMS.iter().any(|t| lower.contains(t));

    let complexity = if has_stat_term && token_count <= 15 {
        Complexity::Simple
    } else if has_row_term {
        Complexity::Complex
    } else {
        Complexity::Simple
    };

    let category = CATEGORY_KEYWORDS
        .iter()
        .find(|(_, terms)| terms.iter().any(|t| lower.contains(t)))
        .map(|(c, _)| *c)
        .unwrap_or(Category::Unknown);

    let requires_csv = complexity == Complexity::Complex;
    Analysis {
        query: question.to_string(),
        complexity,
        category,
        requires_csv,
        requires_row_level_data: has_row_term,
        confidence: 0.6,
        reasoning: "keyword heuristic (language model unavailable)".to_string(),
        strategy: build_hint(complexity, category, has_row_term, available_chunk_types),
        fallback_used: true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::ScriptedLlm;
    use crate::models::ANALYTICAL_CHUNK_TYPES;

    fn chunk_types() -> Vec<String> {
        ANALYTICAL_CHUNK_TYPES.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_strip_fences_plain_json() {
        assert_eq!(strip_fences("{\"a\": 1}"), "{\"a\": 1}");
    }

    #[test]
    fn test_strip_fences_markdown_block() {
        let fenced = "```json\n{\"complexity\": \"simple\"}\n```";
        assert_eq!(strip_fences(fenced), "{\"complexity\": \"simple\"}");
    }

    #[test]
    fn test_strip_fences_with_prose() {
        let noisy = "Sure! Here is the classification: {\"a\": 1} hope that helps";
        assert_eq!(strip_fences(noisy), "{\"a\": 1}");
    }

    #[tokio::test]
    async fn test_llm_verdict_is_used_when_valid() {
        let llm = Arc::new(ScriptedLlm::new(vec![
            r#"```json
            {"complexity": "complex", "category": "outliers", "reasoning": "needs rows",
             "confidence": 0.92, "requires_row_level_data": true}
            ```"#,
        ]));
        let analyzer = QueryAnalyzer::new(llm);
        let a = analyzer
            .analyze("Liste as transações atípicas", &chunk_types())
            .await;
        assert_eq!(a.complexity, Complexity::Complex);
        assert_eq!(a.category, Category::Outliers);
        assert!(a.requires_csv);
        assert!(!a.fallback_used);
        assert!(matches!(a.strategy, StrategyHint::GuidedCsvAnalysis { .. }));
    }

    #[tokio::test]
    async fn test_llm_failure_falls_back() {
        let llm = Arc::new(ScriptedLlm::failing_then(vec![]));
        let analyzer = QueryAnalyzer::new(llm);
        let a = analyzer.analyze("Qual a média de Amount?", &chunk_types()).await;
        assert!(a.fallback_used);
        assert_eq!(a.complexity, Complexity::Simple);
        assert_eq!(a.category, Category::Statistics);
        assert!((a.confidence - 0.6).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn test_malformed_llm_output_falls_back() {
        let llm = Arc::new(ScriptedLlm::new(vec!["the question is quite simple really"]));
        let analyzer = QueryAnalyzer::new(llm);
        let a = analyzer
            .analyze("Quais são os tipos de dados das colunas?", &chunk_types())
            .await;
        assert!(a.fallback_used);
        assert_eq!(a.category, Category::Structure);
    }

    #[test]
    fn test_heuristic_short_stat_question_is_simple() {
        let a = heuristic_analysis("Qual a média de Amount?", &chunk_types());
        assert_eq!(a.complexity, Complexity::Simple);
        assert!(!a.requires_csv);
        match a.strategy {
            StrategyHint::UseExistingChunks { ref chunks_to_query } => {
                assert!(chunks_to_query.contains(&"metadata_distribution".to_string()));
                assert!(chunks_to_query.contains(&"metadata_central_variability".to_string()));
            }
            _ => panic!("expected use_existing_chunks"),
        }
    }

    #[test]
    fn test_heuristic_row_level_question_is_complex() {
        let a = heuristic_analysis("Liste transações com Amount > 1000", &chunk_types());
        assert_eq!(a.complexity, Complexity::Complex);
        assert!(a.requires_csv);
        assert!(a.requires_row_level_data);
    }

    #[test]
    fn test_heuristic_long_stat_question_with_row_terms_is_complex() {
        let a = heuristic_analysis(
            "Please list every row whose Amount is above the overall mean value so I can check each one individually against the median",
            &chunk_types(),
        );
        assert_eq!(a.complexity, Complexity::Complex);
    }

    #[test]
    fn test_correlation_beats_statistics_in_category_map() {
        let a = heuristic_analysis("Qual a correlação entre Amount e V1?", &chunk_types());
        assert_eq!(a.category, Category::Correlation);
    }

    #[test]
    fn test_mapping_access_matches_fields() {
        let a = heuristic_analysis("Qual a média de Amount?", &chunk_types());
        assert_eq!(
            a.get("category").unwrap(),
            serde_json::json!(a.category.as_str())
        );
        assert_eq!(a.get("fallback_used").unwrap(), serde_json::json!(true));
        assert!(a.get("nonexistent").is_none());
    }

    #[test]
    fn test_required_aspects_cover_all_categories() {
        for category in [
            Category::Structure,
            Category::Statistics,
            Category::Distribution,
            Category::Correlation,
            Category::Outliers,
            Category::Patterns,
            Category::Visualization,
            Category::CustomAnalysis,
            Category::Unknown,
        ] {
            assert!(!required_aspects(category).is_empty());
        }
    }
}
