use crate::generator::*;
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use auditgraph_core::GenerationSettings;
use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

/// Configuration for OpenAI-compatible chat completion endpoints (Ollama, LM Studio, vLLM, ...)
#[derive(Debug, Clone)]
pub struct OpenAICompatibleConfig {
    /// Base URL for the API (e.g., "http://localhost:11434/v1")
    pub base_url: String,
    pub model: String,
    /// Request timeout in seconds
    pub timeout_secs: u64,
    /// Optional API key (some providers require it, some don't)
    pub api_key: Option<SecretString>,
    /// Provider name for display purposes
    pub provider_name: String,
}

impl Default for OpenAICompatibleConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:11434/v1".to_string(),
            model: "llama3.1:8b".to_string(),
            timeout_secs: 120,
            api_key: None,
            provider_name: "openai-compatible".to_string(),
        }
    }
}

impl From<&GenerationSettings> for OpenAICompatibleConfig {
    fn from(settings: &GenerationSettings) -> Self {
        Self {
            base_url: settings.base_url.trim_end_matches('/').to_string(),
            model: settings.model.clone(),
            timeout_secs: settings.timeout_secs,
            api_key: settings.api_key.clone(),
            provider_name: settings.provider.clone(),
        }
    }
}

pub struct OpenAICompatibleGenerator {
    config: OpenAICompatibleConfig,
    client: Client,
}

impl OpenAICompatibleGenerator {
    pub fn new(config: OpenAICompatibleConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self { config, client })
    }

    async fn try_chat_completions_request(
        &self,
        request: &GenerationRequest,
    ) -> Result<ChatCompletionsResponse> {
        let mut messages = Vec::with_capacity(2);
        if let Some(system) = &request.system {
            messages.push(ChatMessage {
                role: "system".to_string(),
                content: system.clone(),
            });
        }
        messages.push(ChatMessage {
            role: "user".to_string(),
            content: request.prompt.clone(),
        });

        let body = ChatCompletionsRequest {
            model: self.config.model.clone(),
            messages,
            temperature: request.temperature,
            max_tokens: request.max_tokens,
        };

        let mut request_builder = self
            .client
            .post(format!("{}/chat/completions", self.config.base_url))
            .header("Content-Type", "application/json")
            .json(&body);

        if let Some(api_key) = &self.config.api_key {
            request_builder = request_builder.header(
                "Authorization",
                format!("Bearer {}", api_key.expose_secret()),
            );
        }

        let response = request_builder.send().await.context(format!(
            "Failed to send request to {} at {}",
            self.config.provider_name, self.config.base_url
        ))?;

        let status = response.status();

        if !status.is_success() {
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());

            return Err(anyhow!(
                "{} API error ({}): {}",
                self.config.provider_name,
                status,
                error_text
            ));
        }

        response.json().await.context(format!(
            "Failed to parse {} chat completions response",
            self.config.provider_name
        ))
    }
}

#[async_trait]
impl TextGenerator for OpenAICompatibleGenerator {
    async fn generate(&self, request: &GenerationRequest) -> GenerationResult<GenerationResponse> {
        let response = self.try_chat_completions_request(request).await?;
        let choice = response
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| anyhow!("No choices in response"))?;

        Ok(GenerationResponse {
            content: choice.message.content,
            total_tokens: response.usage.map(|u| u.total_tokens),
            finish_reason: choice.finish_reason,
            model: self.config.model.clone(),
        })
    }

    async fn is_available(&self) -> bool {
        self.client
            .get(format!("{}/models", self.config.base_url))
            .send()
            .await
            .map(|r| r.status().is_success())
            .unwrap_or(false)
    }

    fn provider_name(&self) -> &str {
        &self.config.provider_name
    }

    fn model_name(&self) -> &str {
        &self.config.model
    }
}

/// Factory for creating generators based on configuration
pub struct GeneratorFactory;

impl GeneratorFactory {
    pub fn create_from_settings(settings: &GenerationSettings) -> Result<Arc<dyn TextGenerator>> {
        match settings.provider.to_lowercase().as_str() {
            "openai-compatible" | "openai" | "ollama" | "lmstudio" | "vllm" => Ok(Arc::new(
                OpenAICompatibleGenerator::new(OpenAICompatibleConfig::from(settings))?,
            )),
            other => Err(anyhow!(
                "Unsupported generation provider: {}. Available providers: openai-compatible, ollama, lmstudio, vllm",
                other
            )),
        }
    }
}

#[derive(Debug, Serialize)]
struct ChatCompletionsRequest {
    model: String,
    messages: Vec<ChatMessage>,
    temperature: f32,
    max_tokens: usize,
}

#[derive(Debug, Serialize, Deserialize)]
struct ChatMessage {
    role: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionsResponse {
    choices: Vec<ChatChoice>,
    #[serde(default)]
    usage: Option<ChatUsage>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChatUsage {
    total_tokens: usize,
}
