//! Upstream channels and the single-probe seam used by batch jobs.
//!
//! A channel is one configured upstream provider account (base URL, key, the
//! models it serves). [`ChannelTester`] sends one probe request for a
//! (channel, model) pair and reports timing plus a structured failure.

pub mod http;

use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use self::http::HttpChannelTester;

/// Upstream provider kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelType {
    OpenAi,
    Azure,
    Anthropic,
    Gemini,
    /// Any OpenAI-compatible endpoint.
    Custom,
    // Task-oriented providers: no synchronous chat endpoint to probe.
    Midjourney,
    Suno,
    Kling,
}

impl ChannelType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChannelType::OpenAi => "open_ai",
            ChannelType::Azure => "azure",
            ChannelType::Anthropic => "anthropic",
            ChannelType::Gemini => "gemini",
            ChannelType::Custom => "custom",
            ChannelType::Midjourney => "midjourney",
            ChannelType::Suno => "suno",
            ChannelType::Kling => "kling",
        }
    }

    /// Whether a synchronous probe request makes sense for this kind.
    pub fn is_testable(&self) -> bool {
        !matches!(
            self,
            ChannelType::Midjourney | ChannelType::Suno | ChannelType::Kling
        )
    }
}

impl std::fmt::Display for ChannelType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ChannelType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "open_ai" | "openai" => Ok(ChannelType::OpenAi),
            "azure" => Ok(ChannelType::Azure),
            "anthropic" | "claude" => Ok(ChannelType::Anthropic),
            "gemini" => Ok(ChannelType::Gemini),
            "custom" => Ok(ChannelType::Custom),
            "midjourney" => Ok(ChannelType::Midjourney),
            "suno" => Ok(ChannelType::Suno),
            "kling" => Ok(ChannelType::Kling),
            other => anyhow::bail!("unknown channel type '{}'", other),
        }
    }
}

/// Channel availability, stored as its integer code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChannelStatus {
    Enabled = 1,
    ManuallyDisabled = 2,
    AutoDisabled = 3,
}

impl ChannelStatus {
    pub fn code(self) -> i64 {
        self as i64
    }

    pub fn from_code(code: i64) -> Self {
        match code {
            1 => ChannelStatus::Enabled,
            3 => ChannelStatus::AutoDisabled,
            _ => ChannelStatus::ManuallyDisabled,
        }
    }
}

/// A configured upstream channel.
#[derive(Debug, Clone, Serialize)]
pub struct Channel {
    pub id: i64,
    pub name: String,
    pub channel_type: ChannelType,
    pub status: ChannelStatus,
    pub base_url: String,
    #[serde(skip_serializing)]
    pub key: String,
    /// Comma separated model names, as configured by the operator.
    pub models: String,
    /// Model to probe when a job asks for the channel's default.
    pub test_model: Option<String>,
}

impl Channel {
    /// Configured models in order, trimmed, empties dropped. Duplicates are kept;
    /// the planner dedups.
    pub fn model_list(&self) -> Vec<String> {
        self.models
            .split(',')
            .map(str::trim)
            .filter(|m| !m.is_empty())
            .map(str::to_string)
            .collect()
    }

    /// The configured default test model, if non-blank.
    pub fn default_test_model(&self) -> Option<&str> {
        self.test_model
            .as_deref()
            .map(str::trim)
            .filter(|m| !m.is_empty())
    }
}

/// Fields required to register a channel.
#[derive(Debug, Clone, Deserialize)]
pub struct NewChannel {
    pub name: String,
    pub channel_type: ChannelType,
    #[serde(default = "default_status")]
    pub status: ChannelStatus,
    pub base_url: String,
    pub key: String,
    pub models: String,
    #[serde(default)]
    pub test_model: Option<String>,
}

fn default_status() -> ChannelStatus {
    ChannelStatus::Enabled
}

// ---------------------------------------------------------------------------
// Probe seam
// ---------------------------------------------------------------------------

/// Structured error returned by an upstream provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProviderError {
    pub message: String,
    pub code: Option<String>,
    /// HTTP status of the upstream response.
    pub status: u16,
}

/// A failed probe.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct ProbeError {
    pub message: String,
    pub provider: Option<ProviderError>,
}

impl ProbeError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            provider: None,
        }
    }

    pub fn from_provider(message: impl Into<String>, provider: ProviderError) -> Self {
        Self {
            message: message.into(),
            provider: Some(provider),
        }
    }

    /// True when the upstream rejected the request for rate limiting.
    ///
    /// Checked in order: the error text, the provider code/message, the
    /// provider HTTP status.
    pub fn is_rate_limited(&self) -> bool {
        if self.message.contains("429") {
            return true;
        }
        match &self.provider {
            Some(p) => {
                p.code.as_deref().is_some_and(|c| c.contains("429"))
                    || p.message.contains("429")
                    || p.status == 429
            }
            None => false,
        }
    }

    /// Message persisted with a failed result.
    pub fn display_message(&self) -> String {
        if let Some(p) = &self.provider {
            if !p.message.is_empty() {
                return match p.code.as_deref().filter(|c| !c.is_empty()) {
                    Some(code) => format!("{} (code {})", p.message, code),
                    None => p.message.clone(),
                };
            }
        }
        if !self.message.is_empty() {
            return self.message.clone();
        }
        "unknown error".to_string()
    }
}

/// Outcome of one probe request.
#[derive(Debug, Clone)]
pub struct ProbeReport {
    pub elapsed: Duration,
    pub outcome: Result<(), ProbeError>,
}

impl ProbeReport {
    pub fn success(elapsed: Duration) -> Self {
        Self {
            elapsed,
            outcome: Ok(()),
        }
    }

    pub fn failure(elapsed: Duration, error: ProbeError) -> Self {
        Self {
            elapsed,
            outcome: Err(error),
        }
    }
}

/// Sends one probe request for a (channel, model) pair.
///
/// Implementations apply their own upstream timeout; callers never time a
/// probe out themselves.
#[async_trait::async_trait]
pub trait ChannelTester: Send + Sync {
    async fn test(&self, channel: &Channel, model: &str) -> ProbeReport;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn channel(models: &str, test_model: Option<&str>) -> Channel {
        Channel {
            id: 1,
            name: "primary".to_string(),
            channel_type: ChannelType::OpenAi,
            status: ChannelStatus::Enabled,
            base_url: "https://api.example.com".to_string(),
            key: "sk-test".to_string(),
            models: models.to_string(),
            test_model: test_model.map(str::to_string),
        }
    }

    #[test]
    fn test_model_list_trims_and_drops_empties() {
        let ch = channel(" gpt-4o , ,gpt-4o-mini,gpt-4o", None);
        assert_eq!(ch.model_list(), vec!["gpt-4o", "gpt-4o-mini", "gpt-4o"]);
    }

    #[test]
    fn test_blank_test_model_is_none() {
        assert_eq!(channel("a", Some("  ")).default_test_model(), None);
        assert_eq!(channel("a", Some("a")).default_test_model(), Some("a"));
    }

    #[test]
    fn test_channel_type_round_trip_names() {
        for ty in [ChannelType::OpenAi, ChannelType::Gemini, ChannelType::Suno] {
            assert_eq!(ty.as_str().parse::<ChannelType>().unwrap(), ty);
        }
        assert!("nope".parse::<ChannelType>().is_err());
        assert!(!ChannelType::Midjourney.is_testable());
        assert!(ChannelType::Anthropic.is_testable());
    }

    #[test]
    fn test_rate_limit_detection() {
        assert!(ProbeError::new("status code 429: slow down").is_rate_limited());

        let by_code = ProbeError::from_provider(
            "upstream error",
            ProviderError {
                message: "too many".to_string(),
                code: Some("429".to_string()),
                status: 200,
            },
        );
        assert!(by_code.is_rate_limited());

        let by_status = ProbeError::from_provider(
            "upstream error",
            ProviderError {
                message: "quota".to_string(),
                code: None,
                status: 429,
            },
        );
        assert!(by_status.is_rate_limited());

        let other = ProbeError::from_provider(
            "status code 500: boom",
            ProviderError {
                message: "boom".to_string(),
                code: Some("server_error".to_string()),
                status: 500,
            },
        );
        assert!(!other.is_rate_limited());
    }

    #[test]
    fn test_display_message_precedence() {
        let with_code = ProbeError::from_provider(
            "status code 401: bad key",
            ProviderError {
                message: "bad key".to_string(),
                code: Some("invalid_api_key".to_string()),
                status: 401,
            },
        );
        assert_eq!(with_code.display_message(), "bad key (code invalid_api_key)");

        let no_provider_message = ProbeError::from_provider(
            "status code 502",
            ProviderError {
                message: String::new(),
                code: None,
                status: 502,
            },
        );
        assert_eq!(no_provider_message.display_message(), "status code 502");

        assert_eq!(ProbeError::new("").display_message(), "unknown error");
    }
}
