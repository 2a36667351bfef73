/// Model client: a uniform interface over chat, raw-text and structured
/// generation calls, with retry/backoff handled inside the client.
///
/// The HTTP implementation targets an OpenAI-compatible chat completions
/// endpoint. Retryable failures (rate limits, overload, transport errors,
/// empty responses) back off exponentially; terminal failures (bad key,
/// unknown model, safety blocks) surface immediately with their kind.
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::Config;
use crate::error::{ModelError, ModelErrorKind};

// ── Wire types ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self { role: "user".to_string(), content: content.into() }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self { role: "assistant".to_string(), content: content.into() }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self { role: "system".to_string(), content: content.into() }
    }
}

/// A structured-generation request: the caller describes the expected JSON
/// shape in the prompt and gets back a parsed `Value`.
#[derive(Debug, Clone)]
pub struct StructuredRequest {
    pub system: String,
    pub prompt: String,
    pub use_secondary: bool,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Option<Vec<Choice>>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: Option<ResponseMessage>,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    content: Option<String>,
}

// ── Client trait ──────────────────────────────────────────────────────────────

#[async_trait]
pub trait ModelClient: Send + Sync {
    /// Conversational call: hidden system instruction + message history.
    async fn chat(
        &self,
        system: &str,
        messages: &[ChatMessage],
        use_secondary: bool,
    ) -> Result<String, ModelError>;

    /// Single-prompt call returning the raw response text.
    async fn raw_text(&self, prompt: &str, use_secondary: bool) -> Result<String, ModelError>;

    /// JSON-mode call; the response is parsed before being returned.
    async fn generate_structured(&self, request: &StructuredRequest) -> Result<Value, ModelError>;
}

// ── HTTP implementation ───────────────────────────────────────────────────────

pub struct HttpClient {
    http: reqwest::Client,
    endpoint: String,
    primary_model: String,
    secondary_model: String,
    api_key: String,
    max_output_tokens: u32,
    max_retries: u32,
    retry_base_delay: Duration,
}

impl HttpClient {
    pub fn from_config(config: &Config, api_key: String) -> Self {
        Self {
            http: reqwest::Client::new(),
            endpoint: config.endpoint(),
            primary_model: config.model.primary_name.clone(),
            secondary_model: config.model.secondary_name.clone(),
            api_key,
            max_output_tokens: config.model.max_output_tokens,
            max_retries: config.model.generation_max_retries,
            retry_base_delay: Duration::from_millis(config.model.generation_retry_base_delay_ms),
        }
    }

    fn model_name(&self, use_secondary: bool) -> &str {
        if use_secondary { &self.secondary_model } else { &self.primary_model }
    }

    /// Issue a call with the retry state machine:
    /// `issued → (retryable_error → backoff → retry)* → (terminal | success)`.
    async fn complete(
        &self,
        model: &str,
        messages: &[Value],
        json_mode: bool,
    ) -> Result<String, ModelError> {
        let max_attempts = self.max_retries + 1;
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match self.issue_once(model, messages, json_mode).await {
                Ok(text) => return Ok(text),
                Err(e) if e.kind.is_retryable() && attempt < max_attempts => {
                    let delay = self.retry_base_delay * 2u32.saturating_pow(attempt - 1);
                    tracing::warn!(
                        kind = %e.kind,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "retryable model error, backing off"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn issue_once(
        &self,
        model: &str,
        messages: &[Value],
        json_mode: bool,
    ) -> Result<String, ModelError> {
        let mut body = serde_json::json!({
            "model": model,
            "messages": messages,
            "max_tokens": self.max_output_tokens,
        });
        if json_mode {
            body["response_format"] = serde_json::json!({"type": "json_object"});
        }

        let resp = self
            .http
            .post(&self.endpoint)
            .header("Content-Type", "application/json")
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&body)
            .send()
            .await
            .map_err(|e| ModelError::new(ModelErrorKind::NetworkError, e.to_string(), model))?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            let kind = match status.as_u16() {
                401 | 403 => ModelErrorKind::InvalidApiKey,
                404 => ModelErrorKind::InvalidModel,
                429 => ModelErrorKind::RateLimit,
                500 | 502 | 503 | 529 => ModelErrorKind::ServerOverloaded,
                _ => ModelErrorKind::NetworkError,
            };
            return Err(ModelError::new(kind, format!("HTTP {status}: {text}"), model));
        }

        let raw = resp
            .text()
            .await
            .map_err(|e| ModelError::new(ModelErrorKind::NoResponse, e.to_string(), model))?;
        if raw.trim().is_empty() {
            return Err(ModelError::new(ModelErrorKind::NoResponse, "empty response body", model));
        }
        let parsed: ChatResponse = serde_json::from_str(&raw)
            .map_err(|e| ModelError::new(ModelErrorKind::NoResponse, format!("unparseable response: {e}"), model))?;

        validate_response(parsed, model)
    }

    fn to_wire(system: &str, messages: &[ChatMessage]) -> Vec<Value> {
        let mut out = Vec::with_capacity(messages.len() + 1);
        if !system.is_empty() {
            out.push(serde_json::json!({"role": "system", "content": system}));
        }
        for m in messages {
            out.push(serde_json::json!({"role": m.role, "content": m.content}));
        }
        out
    }
}

/// Candidate validation: blocked finish reasons are terminal, everything
/// without usable content is a retryable empty response.
fn validate_response(parsed: ChatResponse, model: &str) -> Result<String, ModelError> {
    let Some(choice) = parsed.choices.and_then(|mut c| {
        if c.is_empty() { None } else { Some(c.remove(0)) }
    }) else {
        return Err(ModelError::new(ModelErrorKind::EmptyResponse, "no choices in response", model));
    };

    match choice.finish_reason.as_deref() {
        Some("content_filter") => {
            return Err(ModelError::new(ModelErrorKind::SafetyBlock, "response blocked by safety filter", model));
        }
        Some("recitation") => {
            return Err(ModelError::new(ModelErrorKind::RecitationBlock, "response blocked for recitation", model));
        }
        _ => {}
    }

    match choice.message.and_then(|m| m.content) {
        Some(content) if !content.trim().is_empty() => Ok(content),
        _ => Err(ModelError::new(ModelErrorKind::EmptyResponse, "choice has no content", model)),
    }
}

#[async_trait]
impl ModelClient for HttpClient {
    async fn chat(
        &self,
        system: &str,
        messages: &[ChatMessage],
        use_secondary: bool,
    ) -> Result<String, ModelError> {
        let model = self.model_name(use_secondary);
        let wire = Self::to_wire(system, messages);
        self.complete(model, &wire, false).await
    }

    async fn raw_text(&self, prompt: &str, use_secondary: bool) -> Result<String, ModelError> {
        let model = self.model_name(use_secondary);
        let wire = vec![serde_json::json!({"role": "user", "content": prompt})];
        self.complete(model, &wire, false).await
    }

    async fn generate_structured(&self, request: &StructuredRequest) -> Result<Value, ModelError> {
        let model = self.model_name(request.use_secondary).to_string();
        let mut wire = Vec::new();
        if !request.system.is_empty() {
            wire.push(serde_json::json!({"role": "system", "content": request.system}));
        }
        wire.push(serde_json::json!({"role": "user", "content": request.prompt}));
        let text = self.complete(&model, &wire, true).await?;
        let cleaned = strip_code_fence(&text);
        serde_json::from_str(cleaned).map_err(|e| {
            ModelError::new(
                ModelErrorKind::EmptyResponse,
                format!("structured response was not valid JSON: {e}"),
                model,
            )
        })
    }
}

/// Strip a wrapping markdown code fence (```json, ```diff, plain ```) if the
/// model added one despite instructions. Non-fenced input passes through
/// untouched, trailing newlines included.
pub fn strip_code_fence(text: &str) -> &str {
    let trimmed = text.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return text;
    };
    // Drop the language tag line, then the closing fence.
    let body = match rest.find('\n') {
        Some(idx) => &rest[idx + 1..],
        None => return text,
    };
    body.strip_suffix("```").map(str::trim_end).unwrap_or(body).trim_end_matches('\n')
}

// ── Test double ───────────────────────────────────────────────────────────────

#[cfg(test)]
pub mod testing {
    use std::collections::VecDeque;
    use std::sync::Mutex;

    use super::*;

    /// Scripted client: replies are handed out in push order; an exhausted
    /// queue yields a non-retryable-looking empty-response error so tests
    /// fail loudly instead of hanging.
    #[derive(Default)]
    pub struct MockClient {
        chat_replies: Mutex<VecDeque<Result<String, ModelError>>>,
        raw_replies: Mutex<VecDeque<Result<String, ModelError>>>,
        structured_replies: Mutex<VecDeque<Result<Value, ModelError>>>,
        pub chat_calls: Mutex<Vec<String>>,
        pub raw_calls: Mutex<Vec<String>>,
        pub structured_calls: Mutex<Vec<String>>,
    }

    impl MockClient {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn push_chat(&self, reply: impl Into<String>) {
            self.chat_replies.lock().unwrap().push_back(Ok(reply.into()));
        }

        pub fn push_raw(&self, reply: impl Into<String>) {
            self.raw_replies.lock().unwrap().push_back(Ok(reply.into()));
        }

        pub fn push_raw_err(&self, kind: ModelErrorKind) {
            self.raw_replies
                .lock()
                .unwrap()
                .push_back(Err(ModelError::new(kind, "scripted failure", "mock")));
        }

        pub fn push_structured(&self, reply: Value) {
            self.structured_replies.lock().unwrap().push_back(Ok(reply));
        }

        fn exhausted(which: &str) -> ModelError {
            ModelError::new(ModelErrorKind::EmptyResponse, format!("mock {which} queue exhausted"), "mock")
        }
    }

    #[async_trait]
    impl ModelClient for MockClient {
        async fn chat(
            &self,
            system: &str,
            messages: &[ChatMessage],
            _use_secondary: bool,
        ) -> Result<String, ModelError> {
            let transcript = messages
                .iter()
                .map(|m| format!("{}: {}", m.role, m.content))
                .collect::<Vec<_>>()
                .join("\n");
            self.chat_calls.lock().unwrap().push(format!("{system}\n{transcript}"));
            self.chat_replies
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err(Self::exhausted("chat")))
        }

        async fn raw_text(&self, prompt: &str, _use_secondary: bool) -> Result<String, ModelError> {
            self.raw_calls.lock().unwrap().push(prompt.to_string());
            self.raw_replies
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err(Self::exhausted("raw_text")))
        }

        async fn generate_structured(&self, request: &StructuredRequest) -> Result<Value, ModelError> {
            self.structured_calls.lock().unwrap().push(request.prompt.clone());
            self.structured_replies
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err(Self::exhausted("generate_structured")))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn response_with(content: Option<&str>, finish: Option<&str>) -> ChatResponse {
        ChatResponse {
            choices: Some(vec![Choice {
                message: Some(ResponseMessage { content: content.map(str::to_string) }),
                finish_reason: finish.map(str::to_string),
            }]),
        }
    }

    #[test]
    fn test_validate_success() {
        let r = response_with(Some("hello"), Some("stop"));
        assert_eq!(validate_response(r, "m").unwrap(), "hello");
    }

    #[test]
    fn test_validate_no_choices_is_empty_response() {
        let r = ChatResponse { choices: Some(vec![]) };
        let e = validate_response(r, "m").unwrap_err();
        assert_eq!(e.kind, ModelErrorKind::EmptyResponse);
        let r = ChatResponse { choices: None };
        assert_eq!(validate_response(r, "m").unwrap_err().kind, ModelErrorKind::EmptyResponse);
    }

    #[test]
    fn test_validate_safety_block_is_terminal() {
        let r = response_with(None, Some("content_filter"));
        let e = validate_response(r, "m").unwrap_err();
        assert_eq!(e.kind, ModelErrorKind::SafetyBlock);
        assert!(!e.kind.is_retryable());
    }

    #[test]
    fn test_validate_recitation_block() {
        let r = response_with(Some("partial"), Some("recitation"));
        assert_eq!(validate_response(r, "m").unwrap_err().kind, ModelErrorKind::RecitationBlock);
    }

    #[test]
    fn test_validate_blank_content_is_empty_response() {
        let r = response_with(Some("   "), Some("stop"));
        assert_eq!(validate_response(r, "m").unwrap_err().kind, ModelErrorKind::EmptyResponse);
    }

    #[test]
    fn test_strip_code_fence_json() {
        let fenced = "```json\n{\"a\": 1}\n```";
        assert_eq!(strip_code_fence(fenced), "{\"a\": 1}");
    }

    #[test]
    fn test_strip_code_fence_passthrough_is_untouched() {
        assert_eq!(strip_code_fence("{\"a\": 1}"), "{\"a\": 1}");
        // Trailing newlines survive — generated file content must stay exact.
        assert_eq!(strip_code_fence("const x = 1;\n"), "const x = 1;\n");
    }

    #[test]
    fn test_strip_code_fence_bare() {
        let fenced = "```\ncontent line\n```";
        assert_eq!(strip_code_fence(fenced), "content line");
    }

    #[test]
    fn test_chat_message_constructors() {
        assert_eq!(ChatMessage::user("x").role, "user");
        assert_eq!(ChatMessage::assistant("x").role, "assistant");
        assert_eq!(ChatMessage::system("x").role, "system");
    }

    #[tokio::test]
    async fn test_mock_client_scripted_replies() {
        use testing::MockClient;
        let mock = MockClient::new();
        mock.push_raw("first");
        mock.push_raw("second");
        assert_eq!(mock.raw_text("p", false).await.unwrap(), "first");
        assert_eq!(mock.raw_text("p", false).await.unwrap(), "second");
        assert!(mock.raw_text("p", false).await.is_err());
    }
}
