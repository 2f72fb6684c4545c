//! Anthropic Messages API agent

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use tracing::{debug, warn};

use super::config::AgentConfig;
use super::error::AgentError;
use super::types::{Agent, AgentDescriptor, AgentResponse, ExecutionContext, Outcome, UsageMetadata};
use crate::domain::now_ms;

const API_VERSION: &str = "2023-06-01";

/// Calls `POST {base-url}/v1/messages` once per execution
///
/// No internal retries: the scheduler owns retry and backoff policy.
pub struct AnthropicAgent {
    descriptor: AgentDescriptor,
    model: String,
    api_key: String,
    base_url: String,
    max_tokens: u32,
    /// Throttle window assumed when a 429 carries no `retry-after` header
    default_rate_limit: Duration,
    http: Client,
}

impl AnthropicAgent {
    /// Create an agent from configuration, reading the key from `api-key-env`
    pub fn from_config(config: &AgentConfig, default_rate_limit: Duration) -> Result<Self, AgentError> {
        debug!(id = %config.id, model = %config.model, "AnthropicAgent::from_config: called");
        let api_key = std::env::var(&config.api_key_env).map_err(|_| AgentError::MissingApiKey {
            agent: config.id.clone(),
            var: config.api_key_env.clone(),
        })?;
        Self::with_api_key(config, api_key, default_rate_limit)
    }

    pub fn with_api_key(
        config: &AgentConfig,
        api_key: impl Into<String>,
        default_rate_limit: Duration,
    ) -> Result<Self, AgentError> {
        let http = Client::builder().build()?;
        let descriptor = AgentDescriptor::new(&config.id, config.backend_id())
            .with_capabilities(config.capabilities.iter().cloned())
            .with_cost(config.cost_per_call)
            .with_max_concurrency(config.max_concurrency);

        Ok(Self {
            descriptor,
            model: config.model.clone(),
            api_key: api_key.into(),
            base_url: config.base_url.trim_end_matches('/').to_string(),
            max_tokens: config.max_tokens,
            default_rate_limit,
            http,
        })
    }

    fn build_request_body(&self, prompt: &str, context: &ExecutionContext) -> serde_json::Value {
        let max_tokens = context
            .estimated_tokens
            .and_then(|t| u32::try_from(t).ok())
            .map(|t| t.clamp(1, self.max_tokens))
            .unwrap_or(self.max_tokens);
        serde_json::json!({
            "model": self.model,
            "max_tokens": max_tokens,
            "messages": [{ "role": "user", "content": prompt }],
        })
    }

    fn usage(&self, usage: Option<ApiUsage>) -> UsageMetadata {
        let usage = usage.unwrap_or_default();
        UsageMetadata {
            input_tokens: usage.input_tokens,
            output_tokens: usage.output_tokens,
            cost: self.descriptor.estimated_cost_per_call,
        }
    }
}

#[async_trait]
impl Agent for AnthropicAgent {
    fn descriptor(&self) -> AgentDescriptor {
        self.descriptor.clone()
    }

    async fn execute(&self, content: &str, context: &ExecutionContext, timeout: Duration) -> AgentResponse {
        debug!(agent = %self.descriptor.id, content_len = content.len(), "AnthropicAgent::execute: called");
        let url = format!("{}/v1/messages", self.base_url);
        let body = self.build_request_body(&context.render_prompt(content), context);

        let response = match self
            .http
            .post(&url)
            .timeout(timeout)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", API_VERSION)
            .header("content-type", "application/json")
            .json(&body)
            .send()
            .await
        {
            Ok(r) => r,
            Err(e) if e.is_timeout() => {
                debug!(agent = %self.descriptor.id, "AnthropicAgent::execute: timed out");
                return Outcome::RetryableFailure("timeout".to_string()).into();
            }
            Err(e) => {
                warn!(agent = %self.descriptor.id, error = %e, "AnthropicAgent::execute: network error");
                return Outcome::RetryableFailure(format!("network error: {}", e)).into();
            }
        };

        let status = response.status().as_u16();
        let retry_after = response
            .headers()
            .get("retry-after")
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.trim().parse::<i64>().ok());

        if !response.status().is_success() {
            let text = response.text().await.unwrap_or_default();
            let outcome = classify_status(status, retry_after, self.default_rate_limit, &text, now_ms());
            debug!(agent = %self.descriptor.id, status, kind = outcome.kind(), "AnthropicAgent::execute: API error");
            return outcome.into();
        }

        match response.json::<ApiResponse>().await {
            Ok(api_response) => {
                let text = api_response
                    .content
                    .into_iter()
                    .filter_map(|block| block.text)
                    .collect::<Vec<_>>()
                    .join("\n");
                AgentResponse::new(Outcome::Success(text)).with_usage(self.usage(api_response.usage))
            }
            Err(e) => Outcome::RetryableFailure(format!("invalid response: {}", e)).into(),
        }
    }

    async fn health_check(&self) -> bool {
        debug!(agent = %self.descriptor.id, "AnthropicAgent::health_check: called");
        let url = format!("{}/v1/models", self.base_url);
        match self
            .http
            .get(&url)
            .timeout(Duration::from_secs(10))
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", API_VERSION)
            .send()
            .await
        {
            Ok(r) => r.status().is_success(),
            Err(_) => false,
        }
    }
}

/// Map a non-success HTTP status to an outcome
///
/// A 429 without `retry-after` is throttled for `default_wait`.
pub fn classify_status(
    status: u16,
    retry_after_secs: Option<i64>,
    default_wait: Duration,
    body: &str,
    now: i64,
) -> Outcome {
    let message = format!("API error {}: {}", status, body.trim());
    match status {
        429 => {
            let wait_ms = match retry_after_secs {
                Some(secs) => secs.max(0).saturating_mul(1000),
                None => i64::try_from(default_wait.as_millis()).unwrap_or(i64::MAX),
            };
            Outcome::RateLimited(now.saturating_add(wait_ms))
        }
        401 | 403 => Outcome::unreachable(message),
        408 | 409 | 425 => Outcome::RetryableFailure(message),
        // 529 is Anthropic's "overloaded"
        s if s >= 500 => Outcome::RetryableFailure(message),
        _ => Outcome::fatal(message),
    }
}

#[derive(Debug, Deserialize)]
struct ApiResponse {
    #[serde(default)]
    content: Vec<ApiContentBlock>,
    usage: Option<ApiUsage>,
}

#[derive(Debug, Deserialize)]
struct ApiContentBlock {
    text: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct ApiUsage {
    #[serde(default)]
    input_tokens: u64,
    #[serde(default)]
    output_tokens: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::AgentKind;

    const MINUTE: Duration = Duration::from_secs(60);

    fn config() -> AgentConfig {
        let mut config = AgentConfig::new("api", AgentKind::AnthropicApi);
        config.max_tokens = 4096;
        config.base_url = "http://127.0.0.1:9/".to_string();
        config
    }

    #[test]
    fn test_classify_rate_limit_uses_retry_after() {
        assert_eq!(classify_status(429, Some(30), MINUTE, "", 1_000), Outcome::RateLimited(31_000));
        assert_eq!(classify_status(429, None, MINUTE, "", 0), Outcome::RateLimited(60_000));
    }

    #[test]
    fn test_classify_rate_limit_uses_configured_default() {
        let wait = Duration::from_secs(300);
        assert_eq!(classify_status(429, None, wait, "", 1_000), Outcome::RateLimited(301_000));
        // an explicit header still wins
        assert_eq!(classify_status(429, Some(5), wait, "", 0), Outcome::RateLimited(5_000));
    }

    #[test]
    fn test_classify_server_errors_retryable() {
        for status in [500, 502, 503, 529] {
            assert!(matches!(classify_status(status, None, MINUTE, "", 0), Outcome::RetryableFailure(_)));
        }
    }

    #[test]
    fn test_classify_auth_errors_unreachable() {
        for status in [401, 403] {
            assert!(matches!(
                classify_status(status, None, MINUTE, "bad key", 0),
                Outcome::FatalFailure { unreachable: true, .. }
            ));
        }
    }

    #[test]
    fn test_classify_client_errors_fatal() {
        assert_eq!(
            classify_status(400, None, MINUTE, "bad request", 0),
            Outcome::fatal("API error 400: bad request")
        );
    }

    #[test]
    fn test_missing_api_key() {
        let mut config = config();
        config.api_key_env = "PROMPTD_TEST_KEY_THAT_IS_NOT_SET".to_string();
        assert!(matches!(
            AnthropicAgent::from_config(&config, MINUTE),
            Err(AgentError::MissingApiKey { .. })
        ));
    }

    #[test]
    fn test_default_rate_limit_from_caller() {
        let agent = AnthropicAgent::with_api_key(&config(), "k", Duration::from_secs(300)).unwrap();
        assert_eq!(agent.default_rate_limit, Duration::from_secs(300));
    }

    #[test]
    fn test_request_body_caps_tokens() {
        let agent = AnthropicAgent::with_api_key(&config(), "k", MINUTE).unwrap();
        assert_eq!(agent.base_url, "http://127.0.0.1:9");

        let mut ctx = ExecutionContext::new(".");
        let body = agent.build_request_body("hi", &ctx);
        assert_eq!(body["max_tokens"], 4096);
        assert_eq!(body["messages"][0]["content"], "hi");

        ctx.estimated_tokens = Some(100);
        assert_eq!(agent.build_request_body("hi", &ctx)["max_tokens"], 100);
        ctx.estimated_tokens = Some(1_000_000);
        assert_eq!(agent.build_request_body("hi", &ctx)["max_tokens"], 4096);
    }

    #[test]
    fn test_parse_api_response() {
        let json = r#"{"content":[{"type":"text","text":"hello"}],"usage":{"input_tokens":5,"output_tokens":7}}"#;
        let parsed: ApiResponse = serde_json::from_str(json).unwrap();
        assert_eq!(parsed.content[0].text.as_deref(), Some("hello"));
        assert_eq!(parsed.usage.unwrap().output_tokens, 7);
    }

    #[tokio::test]
    async fn test_connection_refused_is_retryable() {
        let agent = AnthropicAgent::with_api_key(&config(), "k", MINUTE).unwrap();
        let response = agent
            .execute("hi", &ExecutionContext::new("."), Duration::from_secs(5))
            .await;
        assert!(matches!(response.outcome, Outcome::RetryableFailure(_)));
        assert!(!agent.health_check().await);
    }
}
