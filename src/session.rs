//! Outward-facing entry point: `ask(question, source_id, session_id?)`.
//!
//! The facade owns input validation and session plumbing; analytical logic
//! lives in the processor.

use std::sync::Arc;
use std::time::Instant;

use crate::memory::MemoryStore;
use crate::models::{Answer, RecentContext};
use crate::processor::HybridProcessor;

pub struct SessionFacade {
    processor: Arc<HybridProcessor>,
    memory: Arc<dyn MemoryStore>,
}

impl SessionFacade {
    pub fn new(processor: Arc<HybridProcessor>, memory: Arc<dyn MemoryStore>) -> Self {
        Self { processor, memory }
    }

    /// Answer one question. Blank questions short-circuit to an error
    /// answer without touching any backend.
    pub async fn ask(
        &self,
        question: &str,
        source_id: &str,
        session_id: Option<&str>,
    ) -> Answer {
        self.ask_with_options(question, source_id, session_id, false)
            .await
    }

    pub async fn ask_with_options(
        &self,
        question: &str,
        source_id: &str,
        session_id: Option<&str>,
        force_csv: bool,
    ) -> Answer {
        let started = Instant::now();
        if question.trim().is_empty() {
            return invalid_question_answer(session_id, started);
        }
        if source_id.trim().is_empty() {
            return invalid_source_answer(session_id, started);
        }
        self.processor
            .process(question, source_id, session_id, force_csv)
            .await
    }

    /// Conversation history for prompt assembly or display.
    pub async fn history(&self, session_id: &str, hours: i64) -> crate::error::Result<RecentContext> {
        self.memory.recall_recent(session_id, hours).await
    }
}

fn invalid_question_answer(session_id: Option<&str>, started: Instant) -> Answer {
    blank_error_answer("question must not be empty", session_id, started)
}

fn invalid_source_answer(session_id: Option<&str>, started: Instant) -> Answer {
    blank_error_answer("source id must not be empty", session_id, started)
}

fn blank_error_answer(cause: &str, session_id: Option<&str>, started: Instant) -> Answer {
    Answer {
        status: "error".to_string(),
        content: cause.to_string(),
        strategy: crate::models::Strategy::RagOnly,
        chunks_used: Vec::new(),
        new_chunks_generated: 0,
        csv_accessed: false,
        covered_aspects: Vec::new(),
        required_gaps: Vec::new(),
        fragments_count: 0,
        query_analysis: None,
        processing_time_seconds: started.elapsed().as_secs_f64(),
        from_cache: false,
        session_id: session_id.unwrap_or_default().to_string(),
        timestamp: chrono::Utc::now(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProcessorConfig;
    use crate::csv_store::InMemoryCsvStore;
    use crate::embedding::MockProvider;
    use crate::llm::ScriptedLlm;
    use crate::memory::InMemoryMemoryStore;
    use crate::vector_store::InMemoryVectorStore;

    fn facade() -> SessionFacade {
        let memory: Arc<InMemoryMemoryStore> = Arc::new(InMemoryMemoryStore::new());
        let processor = Arc::new(HybridProcessor::new(
            Arc::new(InMemoryVectorStore::new()),
            Arc::clone(&memory) as Arc<dyn MemoryStore>,
            Arc::new(MockProvider),
            Arc::new(ScriptedLlm::new(vec![])),
            Arc::new(InMemoryCsvStore::new()),
            ProcessorConfig::default(),
        ));
        SessionFacade::new(processor, memory)
    }

    #[tokio::test]
    async fn test_blank_question_is_rejected_cheaply() {
        let facade = facade();
        let answer = facade.ask("   ", "census", None).await;
        assert_eq!(answer.status, "error");
        assert!(!answer.csv_accessed);
        assert!(answer.chunks_used.is_empty());
    }

    #[tokio::test]
    async fn test_blank_source_is_rejected() {
        let facade = facade();
        let answer = facade.ask("Qual a média?", "", None).await;
        assert_eq!(answer.status, "error");
    }
}
