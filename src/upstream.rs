use std::sync::Arc;

use crate::config::RelayConfig;
use crate::specs::openai::{OpenAiMessage, OpenAiRequest, OpenAiTool};
use crate::types::{ObservedError, RelayError, Result};

/// Chat-completions client for the hosted provider.
#[derive(Clone)]
pub struct UpstreamClient {
    http: reqwest::Client,
    config: Arc<RelayConfig>,
}

impl UpstreamClient {
    pub fn new(http: reqwest::Client, config: Arc<RelayConfig>) -> Self {
        Self { http, config }
    }

    /// Builds a streaming request. `tool_choice` is only sent alongside a
    /// non-empty tool list.
    pub fn build_request(
        &self,
        messages: Vec<OpenAiMessage>,
        tools: Option<Vec<OpenAiTool>>,
    ) -> OpenAiRequest {
        let tools = tools.filter(|t| !t.is_empty());
        let tool_choice = tools.as_ref().map(|_| serde_json::json!("auto"));
        OpenAiRequest {
            model: self.config.model.clone(),
            messages,
            tools,
            tool_choice,
            stream: true,
            max_tokens: Some(self.config.max_tokens),
            temperature: Some(self.config.temperature),
        }
    }

    /// Sends `request` and returns the response once the status line says
    /// the body is a stream worth reading.
    pub async fn open_stream(&self, request: &OpenAiRequest) -> Result<reqwest::Response> {
        let api_key = self.config.api_key()?;
        tracing::info!(
            "[⚙️  -> ☁️ ] POST {} (model: {}, messages: {}, tools: {})",
            self.config.completions_url(),
            request.model,
            request.messages.len(),
            request.tools.as_ref().map_or(0, Vec::len)
        );

        let response = self
            .http
            .post(self.config.completions_url())
            .header("Authorization", format!("Bearer {}", api_key))
            .json(request)
            .send()
            .await
            .map_err(|e| ObservedError::from(RelayError::Network(e)))?;

        let status = response.status();
        tracing::info!("[☁️  -> ⚙️ ] Status: {}", status);
        if status.is_success() {
            Ok(response)
        } else {
            let error_body = match response.text().await {
                Ok(text) => text,
                Err(e) => {
                    tracing::warn!("Failed to read error body: {}", e);
                    format!("Upstream error (body unreadable): {}", e)
                }
            };
            tracing::error!("[☁️  -> ⚙️ ] Upstream Error: {}", error_body);
            Err(RelayError::Upstream(status, error_body).into())
        }
    }
}
