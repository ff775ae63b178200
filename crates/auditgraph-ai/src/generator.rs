use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Result type for collaborator calls
pub type GenerationResult<T> = anyhow::Result<T>;

/// One call to the text-generation service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationRequest {
    pub prompt: String,
    /// Optional system instructions
    pub system: Option<String>,
    /// Sampling temperature (0.0 to 2.0)
    pub temperature: f32,
    /// Upper bound on generated tokens
    pub max_tokens: usize,
}

impl GenerationRequest {
    pub fn new(prompt: impl Into<String>, temperature: f32, max_tokens: usize) -> Self {
        Self {
            prompt: prompt.into(),
            system: None,
            temperature,
            max_tokens,
        }
    }

    pub fn with_system(mut self, system: impl Into<String>) -> Self {
        self.system = Some(system.into());
        self
    }
}

/// Response from the text-generation service
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationResponse {
    /// Generated text content
    pub content: String,
    /// Total tokens used in the request
    pub total_tokens: Option<usize>,
    /// Finish reason (e.g., "stop", "length")
    pub finish_reason: Option<String>,
    /// Model used for generation
    pub model: String,
}

impl GenerationResponse {
    pub fn text(content: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            total_tokens: None,
            finish_reason: Some("stop".to_string()),
            model: model.into(),
        }
    }
}

/// The external text-generation collaborator.
///
/// Implementations make a single attempt per call; retries, backoff and
/// deadlines belong to the pipeline.
#[async_trait]
pub trait TextGenerator: Send + Sync {
    async fn generate(&self, request: &GenerationRequest) -> GenerationResult<GenerationResponse>;

    /// Check if the provider is reachable
    async fn is_available(&self) -> bool {
        true
    }

    fn provider_name(&self) -> &str;

    fn model_name(&self) -> &str;
}
