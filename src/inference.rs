use crate::config::{ModelSpec, RetryConfig};
use crate::error::HarnessError;
use crate::models::{TIMEOUT_SENTINEL, Usage, normalize};
use anyhow::{Context, Result};
use async_openai::{
    Client,
    config::OpenAIConfig,
    types::{
        ChatCompletionRequestMessage, ChatCompletionRequestSystemMessageArgs,
        ChatCompletionRequestUserMessageArgs, CreateChatCompletionRequest,
        CreateChatCompletionRequestArgs, CreateChatCompletionResponse,
    },
};
use async_trait::async_trait;
use rand::Rng;
use regex::Regex;
use std::collections::HashMap;
use std::sync::LazyLock;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

static SQL_FENCE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)```sql(.*?)(?:``|$)").expect("Invalid SQL fence regex pattern")
});

static PLAIN_FENCE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)```(.*?)(?:``|$)").expect("Invalid code fence regex pattern")
});

/// How the reply is post-processed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryMode {
    /// Keep only the first fenced code block
    Sql,
    Text,
}

/// Normalized reply of one inference call
#[derive(Debug, Clone, PartialEq)]
pub struct Completion {
    pub content: String,
    pub reported_model: Option<String>,
    pub usage: Option<Usage>,
}

impl Completion {
    /// Placeholder recorded after every attempt failed
    pub fn timed_out() -> Self {
        Self {
            content: TIMEOUT_SENTINEL.to_string(),
            reported_model: None,
            usage: None,
        }
    }
}

/// Chat model backend
#[async_trait]
pub trait InferenceService: Send + Sync {
    /// Transient failures are retried and end in [`Completion::timed_out`];
    /// an `Err` means the request could not be built at all.
    async fn query(
        &self,
        model: &str,
        system: &str,
        message: &str,
        max_tokens: u32,
        mode: QueryMode,
    ) -> Result<Completion>;
}

/// Reduce a reply to the first fenced block, `sql` fences first
pub fn extract_sql(reply: &str) -> &str {
    let fence = if reply.contains("```sql") {
        &SQL_FENCE
    } else if reply.contains("```") {
        &PLAIN_FENCE
    } else {
        return reply;
    };

    fence
        .captures(reply)
        .and_then(|caps| caps.get(1))
        .map_or(reply, |m| m.as_str())
}

/// Delay before retry `attempt`: `scale * ((1.5 + attempt)^2 + U(0.5, 3))` seconds
pub fn backoff_delay(scale: f64, attempt: u32) -> Duration {
    let jitter: f64 = rand::thread_rng().gen_range(0.5..3.0);
    let seconds = scale * ((1.5 + attempt as f64).powi(2) + jitter);
    Duration::from_secs_f64(seconds.max(0.0))
}

/// OpenAI-compatible chat completions for every registry entry
pub struct OpenAiService {
    models: HashMap<String, ModelSpec>,
    retry: RetryConfig,
    http: reqwest::Client,
}

impl OpenAiService {
    pub fn new(models: &[ModelSpec], retry: RetryConfig, request_timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self {
            models: models.iter().map(|m| (m.name.clone(), m.clone())).collect(),
            retry,
            http,
        })
    }

    fn spec(&self, model: &str) -> Result<&ModelSpec> {
        self.models
            .get(model)
            .ok_or_else(|| HarnessError::UnknownModel(model.to_string()).into())
    }

    /// Create the OpenAI client for a registry entry
    fn create_client(&self, spec: &ModelSpec) -> Result<Client<OpenAIConfig>> {
        let api_key = std::env::var(&spec.env_var_api_key)
            .with_context(|| format!("Environment variable {} not found", spec.env_var_api_key))?;

        let openai_config = OpenAIConfig::new()
            .with_api_key(api_key)
            .with_api_base(&spec.api_endpoint);

        Ok(Client::with_config(openai_config).with_http_client(self.http.clone()))
    }

    /// Build the chat completion request. Models without a system role get
    /// the system prompt folded into the user message.
    fn build_request(
        spec: &ModelSpec,
        system: &str,
        message: &str,
        max_tokens: u32,
    ) -> Result<CreateChatCompletionRequest> {
        let mut messages: Vec<ChatCompletionRequestMessage> = Vec::with_capacity(2);
        let user_content = if spec.has_system {
            messages.push(
                ChatCompletionRequestSystemMessageArgs::default()
                    .content(system.to_string())
                    .build()
                    .context("Failed to build system message")?
                    .into(),
            );
            message.to_string()
        } else {
            format!("Context: {system} \n\n{message}")
        };

        messages.push(
            ChatCompletionRequestUserMessageArgs::default()
                .content(user_content)
                .build()
                .context("Failed to build user message")?
                .into(),
        );

        let budget = max_tokens.saturating_add(spec.extra_tokens);

        CreateChatCompletionRequestArgs::default()
            .model(&spec.model)
            .messages(messages)
            .temperature(0.0)
            .max_tokens(u16::try_from(budget).unwrap_or(u16::MAX))
            .build()
            .context("Failed to build chat completion request")
    }

    /// Extract the completion from the API response
    fn extract_completion(response: CreateChatCompletionResponse, mode: QueryMode) -> Completion {
        let reply = response
            .choices
            .first()
            .and_then(|choice| choice.message.content.clone())
            .unwrap_or_default();

        let content = match mode {
            QueryMode::Sql => normalize(extract_sql(&reply)),
            QueryMode::Text => normalize(&reply),
        };

        Completion {
            content,
            reported_model: Some(response.model),
            usage: response.usage.map(|usage| Usage {
                tokens_in: i64::from(usage.prompt_tokens),
                tokens_out: i64::from(usage.completion_tokens),
            }),
        }
    }
}

#[async_trait]
impl InferenceService for OpenAiService {
    async fn query(
        &self,
        model: &str,
        system: &str,
        message: &str,
        max_tokens: u32,
        mode: QueryMode,
    ) -> Result<Completion> {
        let spec = self.spec(model)?;
        let client = self.create_client(spec)?;
        let request = Self::build_request(spec, system, message, max_tokens)?;

        for attempt in 0..self.retry.limit {
            match client.chat().create(request.clone()).await {
                Ok(response) if !response.choices.is_empty() => {
                    debug!(model, attempt, "completion received");
                    return Ok(Self::extract_completion(response, mode));
                }
                Ok(_) => warn!(model, attempt, "completion without choices"),
                Err(e) => warn!(model, attempt, error = %e, "completion failed"),
            }

            if attempt + 1 < self.retry.limit {
                sleep(backoff_delay(self.retry.backoff_scale, attempt)).await;
            }
        }

        warn!(model, retries = self.retry.limit, "giving up, recording timeout");
        Ok(Completion::timed_out())
    }
}
