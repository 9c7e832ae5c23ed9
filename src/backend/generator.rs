//! Text generation backends
//!
//! One trait, one implementation per wire protocol. Both configured variants
//! (local server and hosted gateway) speak the OpenAI chat-completions
//! protocol and differ only in endpoint, auth and model names.

use crate::config::{resolve_api_key, LlmBackend, LlmConfig};
use crate::error::{Error, Result};
use async_trait::async_trait;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;

/// Cost/quality tier of a generation call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tier {
    /// Cheap and fast: classification, short summaries
    Light,
    /// High quality: final answers and content
    Strong,
}

/// Prompt to text generation.
#[async_trait]
pub trait Generator: Send + Sync {
    /// Complete a single prompt.
    async fn complete(&self, prompt: &str, tier: Tier) -> Result<String>;

    /// Complete prompts concurrently, at most `concurrency` in flight.
    ///
    /// Results keep the input order. A failed call yields an `Err` in its
    /// slot and does not affect the others.
    async fn complete_batch(
        &self,
        prompts: &[String],
        tier: Tier,
        concurrency: usize,
    ) -> Vec<Result<String>> {
        let semaphore = Semaphore::new(concurrency.max(1));
        let tasks = prompts.iter().map(|prompt| {
            let semaphore = &semaphore;
            async move {
                let _permit = semaphore
                    .acquire()
                    .await
                    .map_err(|e| Error::Internal(format!("Batch semaphore closed: {}", e)))?;
                self.complete(prompt, tier).await
            }
        });
        join_all(tasks).await
    }

    /// Human-readable backend name (used in logs).
    fn name(&self) -> &str;
}

/// Build the generator selected by configuration
pub fn build_generator(config: &LlmConfig) -> Result<Arc<dyn Generator>> {
    Ok(Arc::new(ChatGenerator::new(config)?))
}

/// Generator for OpenAI-compatible `/chat/completions` endpoints.
pub struct ChatGenerator {
    client: reqwest::Client,
    endpoint: String,
    api_key: Option<String>,
    light_model: String,
    strong_model: String,
    temperature: f32,
    max_tokens: u32,
    label: &'static str,
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    temperature: f32,
    max_tokens: u32,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Deserialize)]
struct ChatChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

impl ChatGenerator {
    pub fn new(config: &LlmConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        let (base_url, api_key, light_model, strong_model, label) = match &config.backend {
            LlmBackend::Local {
                base_url,
                light_model,
                strong_model,
            } => (base_url, None, light_model, strong_model, "local"),
            LlmBackend::Gateway {
                base_url,
                api_key_ref,
                light_model,
                strong_model,
            } => {
                let key = resolve_api_key(api_key_ref).ok_or_else(|| {
                    Error::Config(format!(
                        "Failed to resolve gateway API key from env var: {}",
                        api_key_ref
                    ))
                })?;
                (base_url, Some(key), light_model, strong_model, "gateway")
            }
        };

        Ok(Self {
            client,
            endpoint: format!("{}/chat/completions", base_url.trim_end_matches('/')),
            api_key,
            light_model: light_model.clone(),
            strong_model: strong_model.clone(),
            temperature: config.temperature,
            max_tokens: config.max_tokens,
            label,
        })
    }

    fn model_for(&self, tier: Tier) -> &str {
        match tier {
            Tier::Light => &self.light_model,
            Tier::Strong => &self.strong_model,
        }
    }
}

#[async_trait]
impl Generator for ChatGenerator {
    async fn complete(&self, prompt: &str, tier: Tier) -> Result<String> {
        let body = ChatRequest {
            model: self.model_for(tier),
            messages: vec![ChatMessage {
                role: "user",
                content: prompt,
            }],
            temperature: self.temperature,
            max_tokens: self.max_tokens,
        };

        let mut request = self.client.post(&self.endpoint).json(&body);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request
            .send()
            .await
            .map_err(|e| Error::Generation(format!("Failed to call {}: {}", self.endpoint, e)))?;
        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(Error::Generation(format!(
                "Generation endpoint returned {}: {}",
                status, text
            )));
        }

        let parsed: ChatResponse = response
            .json()
            .await
            .map_err(|e| Error::Generation(format!("Failed to parse generation response: {}", e)))?;
        parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .map(|c| c.trim().to_string())
            .ok_or_else(|| Error::Generation("Generation response had no content".to_string()))
    }

    fn name(&self) -> &str {
        self.label
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingGenerator {
        in_flight: AtomicUsize,
        peak: AtomicUsize,
    }

    #[async_trait]
    impl Generator for CountingGenerator {
        async fn complete(&self, prompt: &str, _tier: Tier) -> Result<String> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(5)).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            if prompt == "fail" {
                return Err(Error::Generation("boom".to_string()));
            }
            Ok(prompt.to_uppercase())
        }

        fn name(&self) -> &str {
            "counting"
        }
    }

    #[tokio::test]
    async fn test_batch_preserves_order_and_bounds_concurrency() {
        let generator = CountingGenerator {
            in_flight: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        };
        let prompts: Vec<String> = (0..12).map(|i| format!("p{}", i)).collect();
        let results = generator.complete_batch(&prompts, Tier::Light, 3).await;
        assert_eq!(results.len(), 12);
        for (i, result) in results.iter().enumerate() {
            assert_eq!(result.as_ref().unwrap(), &format!("P{}", i));
        }
        assert!(generator.peak.load(Ordering::SeqCst) <= 3);
    }

    #[tokio::test]
    async fn test_batch_isolates_failures() {
        let generator = CountingGenerator {
            in_flight: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        };
        let prompts = vec!["ok".to_string(), "fail".to_string(), "fine".to_string()];
        let results = generator.complete_batch(&prompts, Tier::Light, 0).await;
        assert!(results[0].is_ok());
        assert!(results[1].is_err());
        assert_eq!(results[2].as_ref().unwrap(), "FINE");
    }

    #[test]
    fn test_local_backend_builds_without_key() {
        let generator = ChatGenerator::new(&LlmConfig::default()).unwrap();
        assert_eq!(generator.name(), "local");
        assert!(generator.endpoint.ends_with("/chat/completions"));
        assert_ne!(generator.model_for(Tier::Light), generator.model_for(Tier::Strong));
    }

    #[test]
    fn test_gateway_backend_requires_key() {
        let config = LlmConfig {
            backend: LlmBackend::Gateway {
                base_url: "https://gateway.invalid/v1".to_string(),
                api_key_ref: "mindstack_test_missing_key_ref".to_string(),
                light_model: "a".to_string(),
                strong_model: "b".to_string(),
            },
            ..LlmConfig::default()
        };
        assert!(matches!(ChatGenerator::new(&config), Err(Error::Config(_))));
    }
}
