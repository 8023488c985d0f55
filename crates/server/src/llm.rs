use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use leadflow_agent::LlmClient;
use leadflow_core::config::LlmConfig;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::debug;

const DEFAULT_OLLAMA_URL: &str = "http://localhost:11434";

/// `LlmClient` over a local Ollama daemon's `/api/generate` endpoint.
pub struct OllamaClient {
    client: Client,
    base_url: String,
    model: String,
}

#[derive(Serialize)]
struct GenerateRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    stream: bool,
}

#[derive(Deserialize)]
struct GenerateResponse {
    response: String,
}

impl OllamaClient {
    pub fn new(base_url: &str, model: &str, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .context("failed to build ollama http client")?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            model: model.to_string(),
        })
    }

    pub fn from_config(config: &LlmConfig) -> Result<Self> {
        Self::new(
            config.base_url.as_deref().unwrap_or(DEFAULT_OLLAMA_URL),
            &config.model,
            Duration::from_secs(config.timeout_secs),
        )
    }
}

#[async_trait]
impl LlmClient for OllamaClient {
    async fn complete(&self, prompt: &str) -> Result<String> {
        let url = format!("{}/api/generate", self.base_url);
        debug!(event_name = "llm.ollama.request", model = %self.model, "sending ollama completion");

        let response = self
            .client
            .post(&url)
            .json(&GenerateRequest { model: &self.model, prompt, stream: false })
            .send()
            .await
            .with_context(|| format!("ollama request to {url} failed"))?;

        if !response.status().is_success() {
            return Err(anyhow!("ollama returned {}", response.status()));
        }

        let body: GenerateResponse =
            response.json().await.context("failed to decode ollama response")?;
        Ok(body.response)
    }

    fn model_name(&self) -> &str {
        &self.model
    }
}
