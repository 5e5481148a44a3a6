//! Language-model provider abstraction.
//!
//! Any backend satisfying [`LlmProvider`] is substitutable: the planner only
//! ever sees `chat(prompt, options)` and the normalized [`CoreError::LlmFailure`]
//! kind. Provider-specific error types never cross this seam.

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use crate::config::LlmConfig;
use crate::error::{CoreError, Result};

/// Sampling options for one call.
#[derive(Debug, Clone, Copy)]
pub struct ChatOptions {
    pub temperature: f32,
    pub max_tokens: u32,
}

impl Default for ChatOptions {
    fn default() -> Self {
        Self {
            temperature: 0.3,
            max_tokens: 2048,
        }
    }
}

/// A completed chat call.
#[derive(Debug, Clone)]
pub struct ChatResponse {
    pub content: String,
}

/// Trait for language-model providers.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    /// Send one prompt and return the completion. Timeouts do not retry;
    /// callers degrade their strategy instead.
    async fn chat(&self, prompt: &str, options: ChatOptions) -> Result<ChatResponse>;
}

// ============ HTTP provider ============

/// Provider for an OpenAI-style `POST {base_url}/chat/completions` endpoint.
/// Requires `OPENAI_API_KEY` (or a compatible gateway key) in the environment.
pub struct HttpLlmProvider {
    base_url: String,
    model: String,
    timeout_secs: u64,
}

impl HttpLlmProvider {
    pub fn new(config: &LlmConfig) -> Result<Self> {
        if std::env::var("OPENAI_API_KEY").is_err() {
            return Err(CoreError::InvalidInput(
                "OPENAI_API_KEY environment variable not set".to_string(),
            ));
        }
        Ok(Self {
            base_url: config.base_url.trim_end_matches('/').to_string(),
            model: config.model.clone(),
            timeout_secs: config.timeout_secs,
        })
    }
}

#[async_trait]
impl LlmProvider for HttpLlmProvider {
    async fn chat(&self, prompt: &str, options: ChatOptions) -> Result<ChatResponse> {
        let api_key = std::env::var("OPENAI_API_KEY")
            .map_err(|_| CoreError::LlmFailure("OPENAI_API_KEY not set".to_string()))?;

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(self.timeout_secs))
            .build()
            .map_err(|e| CoreError::LlmFailure(e.to_string()))?;

        let body = serde_json::json!({
            "model": self.model,
            "messages": [{ "role": "user", "content": prompt }],
            "temperature": options.temperature,
            "max_tokens": options.max_tokens,
        });

        let response = client
            .post(format!("{}/chat/completions", self.base_url))
            .header("Authorization", format!("Bearer {}", api_key))
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    CoreError::Timeout(format!("llm call timed out: {}", e))
                } else {
                    CoreError::LlmFailure(e.to_string())
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(CoreError::LlmFailure(format!(
                "chat API error {}: {}",
                status, text
            )));
        }

        let json: serde_json::Value = response
            .json()
            .await
            .map_err(|e| CoreError::LlmFailure(e.to_string()))?;

        let content = json
            .pointer("/choices/0/message/content")
            .and_then(|c| c.as_str())
            .ok_or_else(|| CoreError::LlmFailure("missing completion content".to_string()))?;

        Ok(ChatResponse {
            content: content.to_string(),
        })
    }
}

// ============ Disabled provider ============

/// Always fails; the analyzer and planner exercise their deterministic
/// fallbacks when this is configured.
pub struct DisabledLlm;

#[async_trait]
impl LlmProvider for DisabledLlm {
    async fn chat(&self, _prompt: &str, _options: ChatOptions) -> Result<ChatResponse> {
        Err(CoreError::LlmFailure("llm provider is disabled".to_string()))
    }
}

/// Create the configured provider.
pub fn create_provider(config: &LlmConfig) -> Result<std::sync::Arc<dyn LlmProvider>> {
    match config.provider.as_str() {
        "http" => Ok(std::sync::Arc::new(HttpLlmProvider::new(config)?)),
        "disabled" => Ok(std::sync::Arc::new(DisabledLlm)),
        other => Err(CoreError::InvalidInput(format!(
            "unknown llm provider: {}",
            other
        ))),
    }
}

// ============ Scripted provider (tests) ============

/// Replays a queue of canned responses. Once the queue drains it fails with
/// `LlmFailure`, which also makes degradation paths easy to exercise.
pub struct ScriptedLlm {
    responses: Mutex<VecDeque<Result<String>>>,
    pub prompts: Mutex<Vec<String>>,
}

impl ScriptedLlm {
    pub fn new(responses: Vec<&str>) -> Self {
        Self {
            responses: Mutex::new(responses.into_iter().map(|r| Ok(r.to_string())).collect()),
            prompts: Mutex::new(Vec::new()),
        }
    }

    /// Queue one failing call before subsequent successes.
    pub fn failing_then(responses: Vec<&str>) -> Self {
        let mut queue: VecDeque<Result<String>> = VecDeque::new();
        queue.push_back(Err(CoreError::LlmFailure("scripted failure".to_string())));
        for r in responses {
            queue.push_back(Ok(r.to_string()));
        }
        Self {
            responses: Mutex::new(queue),
            prompts: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl LlmProvider for ScriptedLlm {
    async fn chat(&self, prompt: &str, _options: ChatOptions) -> Result<ChatResponse> {
        self.prompts.lock().unwrap().push(prompt.to_string());
        match self.responses.lock().unwrap().pop_front() {
            Some(Ok(content)) => Ok(ChatResponse { content }),
            Some(Err(e)) => Err(e),
            None => Err(CoreError::LlmFailure("scripted queue empty".to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_scripted_replays_in_order() {
        let llm = ScriptedLlm::new(vec!["first", "second"]);
        assert_eq!(
            llm.chat("a", ChatOptions::default()).await.unwrap().content,
            "first"
        );
        assert_eq!(
            llm.chat("b", ChatOptions::default()).await.unwrap().content,
            "second"
        );
        assert!(llm.chat("c", ChatOptions::default()).await.is_err());
        assert_eq!(llm.prompts.lock().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_disabled_always_fails() {
        let llm = DisabledLlm;
        let err = llm.chat("hi", ChatOptions::default()).await.unwrap_err();
        assert!(matches!(err, CoreError::LlmFailure(_)));
    }

    #[tokio::test]
    async fn test_failing_then_recovers() {
        let llm = ScriptedLlm::failing_then(vec!["ok"]);
        assert!(llm.chat("a", ChatOptions::default()).await.is_err());
        assert_eq!(
            llm.chat("b", ChatOptions::default()).await.unwrap().content,
            "ok"
        );
    }
}
