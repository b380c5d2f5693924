use super::{Channel, ChannelTester, ChannelType, ProbeError, ProbeReport, ProviderError};
use crate::config::TesterConfig;
use anyhow::{Context, Result};
use reqwest::{Client, RequestBuilder};
use serde_json::{json, Value};
use std::time::{Duration, Instant};
use tracing::debug;

const ANTHROPIC_VERSION: &str = "2023-06-01";
const AZURE_API_VERSION: &str = "2024-02-01";

/// Probes a channel with a minimal real request in the provider's native shape.
pub struct HttpChannelTester {
    client: Client,
    prompt: String,
    max_tokens: u32,
}

impl HttpChannelTester {
    pub fn new(config: &TesterConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(config.timeout())
            .user_agent(config.user_agent.clone())
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self {
            client,
            prompt: config.prompt.clone(),
            max_tokens: config.max_tokens,
        })
    }

    fn build_request(&self, channel: &Channel, model: &str) -> RequestBuilder {
        let base = channel.base_url.trim_end_matches('/');
        match channel.channel_type {
            ChannelType::Anthropic => self
                .client
                .post(format!("{}/v1/messages", base))
                .header("x-api-key", &channel.key)
                .header("anthropic-version", ANTHROPIC_VERSION)
                .json(&json!({
                    "model": model,
                    "max_tokens": self.max_tokens,
                    "messages": [{ "role": "user", "content": self.prompt }],
                })),
            ChannelType::Gemini => self
                .client
                .post(format!("{}/v1beta/models/{}:generateContent", base, model))
                .header("x-goog-api-key", &channel.key)
                .json(&json!({
                    "contents": [{ "role": "user", "parts": [{ "text": self.prompt }] }],
                    "generationConfig": { "maxOutputTokens": self.max_tokens },
                })),
            ChannelType::Azure => self
                .client
                .post(format!(
                    "{}/openai/deployments/{}/chat/completions?api-version={}",
                    base, model, AZURE_API_VERSION
                ))
                .header("api-key", &channel.key)
                .json(&self.chat_body(model)),
            _ if is_embedding_model(model) => self
                .client
                .post(format!("{}/v1/embeddings", base))
                .bearer_auth(&channel.key)
                .json(&json!({ "model": model, "input": self.prompt })),
            _ => self
                .client
                .post(format!("{}/v1/chat/completions", base))
                .bearer_auth(&channel.key)
                .json(&self.chat_body(model)),
        }
    }

    fn chat_body(&self, model: &str) -> Value {
        json!({
            "model": model,
            "max_tokens": self.max_tokens,
            "stream": false,
            "messages": [{ "role": "user", "content": self.prompt }],
        })
    }
}

#[async_trait::async_trait]
impl ChannelTester for HttpChannelTester {
    async fn test(&self, channel: &Channel, model: &str) -> ProbeReport {
        if !channel.channel_type.is_testable() {
            return ProbeReport::failure(
                Duration::ZERO,
                ProbeError::new(format!(
                    "channel type {} is not supported for testing",
                    channel.channel_type
                )),
            );
        }

        let start = Instant::now();
        let result = self.build_request(channel, model).send().await;

        let response = match result {
            Ok(resp) => resp,
            Err(e) => {
                return ProbeReport::failure(
                    start.elapsed(),
                    ProbeError::new(format!("request failed: {}", e)),
                )
            }
        };

        let status = response.status();
        let body = match response.text().await {
            Ok(body) => body,
            Err(e) if status.is_success() => {
                return ProbeReport::failure(
                    start.elapsed(),
                    ProbeError::new(format!("failed to read response body: {}", e)),
                )
            }
            // The status code alone still classifies an error response.
            Err(e) => {
                debug!(channel_id = channel.id, %model, error = %e, "Unreadable error body");
                String::new()
            }
        };
        let elapsed = start.elapsed();
        debug!(
            channel_id = channel.id,
            %model,
            status = status.as_u16(),
            elapsed_ms = elapsed.as_millis() as u64,
            "Probe response"
        );

        let provider = parse_provider_error(&body, status.as_u16());
        if status.is_success() && provider.is_none() {
            return ProbeReport::success(elapsed);
        }

        let provider = provider.unwrap_or_else(|| ProviderError {
            message: String::new(),
            code: None,
            status: status.as_u16(),
        });
        let message = if provider.message.is_empty() {
            format!("status code {}", status.as_u16())
        } else {
            format!("status code {}: {}", status.as_u16(), provider.message)
        };
        ProbeReport::failure(elapsed, ProbeError::from_provider(message, provider))
    }
}

fn is_embedding_model(model: &str) -> bool {
    model.to_ascii_lowercase().contains("embedding")
}

/// Extract `{"error": {...}}` from a response body.
///
/// Returns `None` when the body carries no error object.
fn parse_provider_error(body: &str, status: u16) -> Option<ProviderError> {
    let value: Value = serde_json::from_str(body).ok()?;
    let error = value.get("error")?;

    // Some proxies return a bare string.
    if let Some(message) = error.as_str() {
        return Some(ProviderError {
            message: message.to_string(),
            code: None,
            status,
        });
    }

    let message = error
        .get("message")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    let code = ["code", "type", "status"]
        .iter()
        .filter_map(|k| error.get(*k))
        .find_map(|v| match v {
            Value::String(s) if !s.is_empty() => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        });

    Some(ProviderError {
        message,
        code,
        status,
    })
}
