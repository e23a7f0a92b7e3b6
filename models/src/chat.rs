use fisiorag_core::error::{ErrorCode, FisioError};
use serde::Deserialize;
use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::RetryIf;

#[derive(Error, Debug, Clone)]
pub enum ChatError {
    #[error("chat credentials rejected")]
    Auth,
    #[error("chat rate limit exceeded")]
    RateLimited,
    #[error("chat deadline exceeded")]
    Timeout,
    #[error("transient chat failure: {0}")]
    Transient(String),
    #[error("chat failure: {0}")]
    Fatal(String),
}

impl ChatError {
    pub fn is_retriable(&self) -> bool {
        matches!(self, ChatError::RateLimited | ChatError::Transient(_))
    }
}

impl FisioError for ChatError {
    fn error_code(&self) -> ErrorCode {
        match self {
            ChatError::Auth => ErrorCode::FailedPrecondition,
            ChatError::RateLimited => ErrorCode::ResourceExhausted,
            ChatError::Timeout | ChatError::Transient(_) => ErrorCode::Unavailable,
            ChatError::Fatal(_) => ErrorCode::Internal,
        }
    }

    fn safe_message(&self) -> String {
        match self {
            ChatError::RateLimited => "language model rate limited".to_string(),
            _ => "language model unavailable".to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ChatOptions {
    pub temperature: f32,
    pub max_tokens: Option<u32>,
    /// Request JSON-mode output from the provider.
    pub json_output: bool,
    pub deadline_ms: u64,
}

impl Default for ChatOptions {
    fn default() -> Self {
        Self {
            temperature: 0.0,
            max_tokens: None,
            json_output: true,
            deadline_ms: 30_000,
        }
    }
}

#[async_trait::async_trait]
pub trait ChatModel: Send + Sync {
    async fn complete(&self, prompt: &str, options: &ChatOptions) -> Result<String, ChatError>;
}

/// Scripted model for tests: responses (or errors) pop in FIFO order.
#[derive(Default)]
pub struct MockChatModel {
    script: Mutex<VecDeque<Result<String, ChatError>>>,
}

impl MockChatModel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_responses(responses: Vec<&str>) -> Self {
        let model = Self::new();
        for response in responses {
            model.push_ok(response);
        }
        model
    }

    pub fn push_ok(&self, response: &str) {
        self.script
            .lock()
            .unwrap()
            .push_back(Ok(response.to_string()));
    }

    pub fn push_err(&self, error: ChatError) {
        self.script.lock().unwrap().push_back(Err(error));
    }
}

#[async_trait::async_trait]
impl ChatModel for MockChatModel {
    async fn complete(&self, _prompt: &str, _options: &ChatOptions) -> Result<String, ChatError> {
        self.script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(ChatError::Fatal("mock script exhausted".to_string())))
    }
}

#[derive(Deserialize)]
struct ChatCompletionMessage {
    content: String,
}

#[derive(Deserialize)]
struct ChatCompletionChoice {
    message: ChatCompletionMessage,
}

#[derive(Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<ChatCompletionChoice>,
}

/// OpenAI-style chat completions client. Retries rate limits and transient
/// failures with bounded backoff; concurrency is capped by a semaphore.
pub struct HttpChatModel {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
    max_retries: usize,
    semaphore: Semaphore,
}

impl HttpChatModel {
    pub fn new(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        model: impl Into<String>,
        max_retries: usize,
        max_concurrency: usize,
    ) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
            api_key: api_key.into(),
            model: model.into(),
            max_retries,
            semaphore: Semaphore::new(max_concurrency.max(1)),
        }
    }

    async fn complete_once(&self, prompt: &str, options: &ChatOptions) -> Result<String, ChatError> {
        let url = format!("{}/chat/completions", self.base_url.trim_end_matches('/'));
        let mut body = serde_json::json!({
            "model": self.model,
            "messages": [{"role": "user", "content": prompt}],
            "temperature": options.temperature,
        });
        if let Some(max_tokens) = options.max_tokens {
            body["max_tokens"] = serde_json::json!(max_tokens);
        }
        if options.json_output {
            body["response_format"] = serde_json::json!({"type": "json_object"});
        }

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .timeout(Duration::from_millis(options.deadline_ms))
            .json(&body)
            .send()
            .await
            .map_err(|err| {
                if err.is_timeout() {
                    ChatError::Timeout
                } else {
                    ChatError::Transient(err.to_string())
                }
            })?;

        let status = response.status();
        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
            return Err(ChatError::Auth);
        }
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(ChatError::RateLimited);
        }
        if status.is_server_error() {
            return Err(ChatError::Transient(format!("status {status}")));
        }
        if !status.is_success() {
            return Err(ChatError::Fatal(format!("status {status}")));
        }

        let parsed: ChatCompletionResponse = response
            .json()
            .await
            .map_err(|err| ChatError::Fatal(err.to_string()))?;

        parsed
            .choices
            .into_iter()
            .next()
            .map(|choice| choice.message.content)
            .ok_or_else(|| ChatError::Fatal("empty completion".to_string()))
    }
}

#[async_trait::async_trait]
impl ChatModel for HttpChatModel {
    async fn complete(&self, prompt: &str, options: &ChatOptions) -> Result<String, ChatError> {
        let _permit = self
            .semaphore
            .acquire()
            .await
            .map_err(|_| ChatError::Fatal("chat client closed".to_string()))?;

        let strategy = ExponentialBackoff::from_millis(2)
            .factor(250)
            .max_delay(Duration::from_secs(20))
            .map(jitter)
            .take(self.max_retries);

        RetryIf::spawn(
            strategy,
            || self.complete_once(prompt, options),
            |err: &ChatError| err.is_retriable(),
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn mock_pops_responses_in_order() {
        let model = MockChatModel::with_responses(vec!["uno", "due"]);
        let options = ChatOptions::default();

        assert_eq!(model.complete("x", &options).await.unwrap(), "uno");
        assert_eq!(model.complete("x", &options).await.unwrap(), "due");
        assert!(matches!(
            model.complete("x", &options).await.unwrap_err(),
            ChatError::Fatal(_)
        ));
    }

    #[tokio::test]
    async fn mock_scripted_errors_surface() {
        let model = MockChatModel::new();
        model.push_err(ChatError::RateLimited);

        let err = model.complete("x", &ChatOptions::default()).await.unwrap_err();
        assert!(matches!(err, ChatError::RateLimited));
    }

    #[test]
    fn default_options_are_deterministic() {
        let options = ChatOptions::default();
        assert_eq!(options.temperature, 0.0);
        assert!(options.json_output);
        assert_eq!(options.deadline_ms, 30_000);
    }
}
