//! Chat-completion adapter for OpenAI-compatible endpoints.
//!
//! The agent loop talks to [`ChatProvider`]; [`OpenAiProvider`] is the
//! production implementation. Transient failures (429, 5xx, network) are
//! retried here with backoff; callers never retry on their own.

#![forbid(unsafe_code)]

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, warn};
use url::Url;

/// Transient errors are retried this many times beyond the first attempt.
const MAX_RETRIES: u32 = 2;
/// Base backoff between retry attempts, doubled per attempt.
const RETRY_BASE: Duration = Duration::from_millis(500);

// ─── Messages ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

/// One conversation message in OpenAI wire shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<WireToolCall>>,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self::plain(Role::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::plain(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::plain(Role::Assistant, content)
    }

    /// The assistant turn that requested these tool calls.
    pub fn assistant_tool_calls(calls: &[ToolCall]) -> Self {
        Self {
            role: Role::Assistant,
            content: String::new(),
            tool_call_id: None,
            tool_calls: Some(calls.iter().map(WireToolCall::from).collect()),
        }
    }

    /// A tool result message answering one call id.
    pub fn tool_result(call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: Role::Tool,
            content: content.into(),
            tool_call_id: Some(call_id.into()),
            tool_calls: None,
        }
    }

    fn plain(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            tool_call_id: None,
            tool_calls: None,
        }
    }
}

// ─── Tools ────────────────────────────────────────────────────────────────────

/// A tool schema advertised to the model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSchema {
    pub name: String,
    pub description: String,
    /// JSON-schema object for the arguments.
    pub parameters: Value,
}

/// One tool call requested by the model, arguments already parsed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub args: Value,
}

// ─── Response ─────────────────────────────────────────────────────────────────

/// Provider response: optional text, ordered tool calls, finish reason.
#[derive(Debug, Clone)]
pub struct ChatResponse {
    pub content: Option<String>,
    pub tool_calls: Vec<ToolCall>,
    pub finish_reason: String,
}

impl ChatResponse {
    pub fn has_tool_calls(&self) -> bool {
        !self.tool_calls.is_empty()
    }
}

// ─── Errors ───────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("provider returned {status}: {message}")]
    Api {
        status: u16,
        message: String,
        retry_after: Option<Duration>,
    },

    #[error("provider network error: {0}")]
    Network(String),

    #[error("provider response invalid: {0}")]
    InvalidResponse(String),

    #[error("provider not configured: {0}")]
    NotConfigured(String),
}

impl ProviderError {
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Api { status, .. } => Some(*status),
            _ => None,
        }
    }

    pub fn is_auth(&self) -> bool {
        matches!(self.status(), Some(401) | Some(403))
    }

    pub fn is_rate_limit(&self) -> bool {
        self.status() == Some(429)
    }

    pub fn is_server_error(&self) -> bool {
        matches!(self.status(), Some(code) if code >= 500)
    }

    /// Worth retrying: rate limited, upstream 5xx, or the network dropped.
    pub fn is_transient(&self) -> bool {
        self.is_rate_limit() || self.is_server_error() || matches!(self, Self::Network(_))
    }
}

// ─── Provider trait ───────────────────────────────────────────────────────────

#[async_trait]
pub trait ChatProvider: Send + Sync {
    async fn chat(
        &self,
        messages: &[ChatMessage],
        tools: &[ToolSchema],
    ) -> Result<ChatResponse, ProviderError>;
}

// ─── Wire shapes ──────────────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<WireTool<'a>>,
}

#[derive(Debug, Serialize)]
struct WireTool<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    function: &'a ToolSchema,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireToolCall {
    pub id: String,
    #[serde(rename = "type", default = "function_kind")]
    pub kind: String,
    pub function: WireFunction,
}

fn function_kind() -> String {
    "function".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireFunction {
    pub name: String,
    /// JSON-encoded argument object, per the OpenAI wire format.
    pub arguments: String,
}

impl From<&ToolCall> for WireToolCall {
    fn from(call: &ToolCall) -> Self {
        Self {
            id: call.id.clone(),
            kind: "function".to_string(),
            function: WireFunction {
                name: call.name.clone(),
                arguments: call.args.to_string(),
            },
        }
    }
}

#[derive(Debug, Deserialize)]
struct WireResponse {
    choices: Vec<WireChoice>,
}

#[derive(Debug, Deserialize)]
struct WireChoice {
    message: WireMessage,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireMessage {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Vec<WireToolCall>,
}

/// Parse the wire tool calls, folding unparseable argument strings to an
/// empty object so one malformed call does not sink the whole response.
fn parse_tool_calls(wire: Vec<WireToolCall>) -> Vec<ToolCall> {
    wire.into_iter()
        .map(|call| {
            let args = match serde_json::from_str::<Value>(&call.function.arguments) {
                Ok(v) => v,
                Err(e) => {
                    warn!(
                        tool = %call.function.name,
                        error = %e,
                        "tool call arguments are not valid JSON"
                    );
                    Value::Object(serde_json::Map::new())
                }
            };
            ToolCall {
                id: call.id,
                name: call.function.name,
                args,
            }
        })
        .collect()
}

// ─── OpenAI-compatible provider ───────────────────────────────────────────────

/// Chat client for any endpoint speaking the OpenAI chat-completions shape.
pub struct OpenAiProvider {
    client: reqwest::Client,
    endpoint: Url,
    api_key: String,
    model: String,
}

impl OpenAiProvider {
    /// `base_url` is the API root (e.g. `https://api.openai.com/v1`).
    pub fn new(
        base_url: &str,
        api_key: impl Into<String>,
        model: impl Into<String>,
    ) -> Result<Self, ProviderError> {
        // Trailing-slash differences must not eat the version segment.
        let joined = format!("{}/chat/completions", base_url.trim_end_matches('/'));
        let endpoint = Url::parse(&joined)
            .map_err(|e| ProviderError::NotConfigured(format!("bad base url {base_url:?}: {e}")))?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(120))
            .build()
            .map_err(|e| ProviderError::NotConfigured(format!("http client: {e}")))?;
        Ok(Self {
            client,
            endpoint,
            api_key: api_key.into(),
            model: model.into(),
        })
    }

    async fn chat_once(
        &self,
        messages: &[ChatMessage],
        tools: &[ToolSchema],
    ) -> Result<ChatResponse, ProviderError> {
        let request = ChatRequest {
            model: &self.model,
            messages,
            tools: tools
                .iter()
                .map(|schema| WireTool {
                    kind: "function",
                    function: schema,
                })
                .collect(),
        };

        let response = self
            .client
            .post(self.endpoint.clone())
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await
            .map_err(|e| ProviderError::Network(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let retry_after = response
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(parse_retry_after);
            let message = response.text().await.unwrap_or_default();
            return Err(ProviderError::Api {
                status: status.as_u16(),
                message: truncate_body(&message),
                retry_after,
            });
        }

        let wire: WireResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::InvalidResponse(e.to_string()))?;
        let choice = wire
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| ProviderError::InvalidResponse("no choices in response".to_string()))?;

        Ok(ChatResponse {
            content: choice.message.content,
            tool_calls: parse_tool_calls(choice.message.tool_calls),
            finish_reason: choice.finish_reason.unwrap_or_default(),
        })
    }
}

#[async_trait]
impl ChatProvider for OpenAiProvider {
    async fn chat(
        &self,
        messages: &[ChatMessage],
        tools: &[ToolSchema],
    ) -> Result<ChatResponse, ProviderError> {
        let mut attempt = 0u32;
        loop {
            match self.chat_once(messages, tools).await {
                Ok(response) => return Ok(response),
                Err(err) if err.is_transient() && attempt < MAX_RETRIES => {
                    let backoff = match &err {
                        ProviderError::Api {
                            retry_after: Some(after),
                            ..
                        } => *after,
                        _ => RETRY_BASE * 2u32.pow(attempt),
                    };
                    debug!(attempt, backoff_ms = backoff.as_millis() as u64, error = %err,
                        "transient provider error, retrying");
                    tokio::time::sleep(backoff).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

/// Retry-After in whole seconds; date forms are ignored.
fn parse_retry_after(raw: &str) -> Option<Duration> {
    raw.trim().parse::<u64>().ok().map(Duration::from_secs)
}

fn truncate_body(body: &str) -> String {
    const CAP: usize = 500;
    if body.chars().count() > CAP {
        let cut: String = body.chars().take(CAP).collect();
        format!("{cut}…")
    } else {
        body.to_string()
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    // ── Error taxonomy ───────────────────────────────────────────────────────

    fn api_err(status: u16) -> ProviderError {
        ProviderError::Api {
            status,
            message: "x".to_string(),
            retry_after: None,
        }
    }

    #[test]
    fn auth_errors() {
        assert!(api_err(401).is_auth());
        assert!(api_err(403).is_auth());
        assert!(!api_err(401).is_transient());
        assert!(!api_err(404).is_auth());
    }

    #[test]
    fn rate_limit_is_transient() {
        let e = api_err(429);
        assert!(e.is_rate_limit());
        assert!(e.is_transient());
        assert!(!e.is_server_error());
    }

    #[test]
    fn server_errors_are_transient() {
        for code in [500, 502, 503] {
            let e = api_err(code);
            assert!(e.is_server_error(), "{code}");
            assert!(e.is_transient(), "{code}");
        }
        assert!(!api_err(400).is_transient());
    }

    #[test]
    fn network_errors_are_transient() {
        let e = ProviderError::Network("connection reset".to_string());
        assert!(e.is_transient());
        assert_eq!(e.status(), None);
    }

    #[test]
    fn invalid_response_is_terminal() {
        let e = ProviderError::InvalidResponse("bad json".to_string());
        assert!(!e.is_transient());
    }

    // ── Wire shapes ──────────────────────────────────────────────────────────

    #[test]
    fn request_serializes_tools() {
        let schema = ToolSchema {
            name: "restart_service".to_string(),
            description: "Restart one service".to_string(),
            parameters: json!({
                "type": "object",
                "properties": {"service": {"type": "string"}},
                "required": ["service"],
            }),
        };
        let messages = vec![ChatMessage::user("restart db")];
        let request = ChatRequest {
            model: "gpt-4o-mini",
            messages: &messages,
            tools: vec![WireTool {
                kind: "function",
                function: &schema,
            }],
        };
        let s = serde_json::to_string(&request).unwrap();
        assert!(s.contains(r#""type":"function""#));
        assert!(s.contains("restart_service"));
        assert!(s.contains(r#""role":"user""#));
    }

    #[test]
    fn request_omits_empty_tools() {
        let messages = vec![ChatMessage::user("hi")];
        let request = ChatRequest {
            model: "m",
            messages: &messages,
            tools: vec![],
        };
        let s = serde_json::to_string(&request).unwrap();
        assert!(!s.contains("tools"));
    }

    #[test]
    fn tool_result_message_carries_call_id() {
        let msg = ChatMessage::tool_result("call_1", "done");
        let s = serde_json::to_string(&msg).unwrap();
        assert!(s.contains(r#""tool_call_id":"call_1""#));
        assert!(s.contains(r#""role":"tool""#));
    }

    #[test]
    fn assistant_tool_calls_round_trip() {
        let calls = vec![ToolCall {
            id: "call_1".to_string(),
            name: "service_logs".to_string(),
            args: json!({"service": "db", "lines": 50}),
        }];
        let msg = ChatMessage::assistant_tool_calls(&calls);
        let s = serde_json::to_string(&msg).unwrap();
        assert!(s.contains("service_logs"));
        assert!(s.contains(r#"\"lines\":50"#));
    }

    #[test]
    fn response_parses_tool_calls() {
        let raw = r#"{
            "choices": [{
                "message": {
                    "content": null,
                    "tool_calls": [
                        {"id": "call_1", "type": "function",
                         "function": {"name": "triage_report", "arguments": "{}"}},
                        {"id": "call_2", "type": "function",
                         "function": {"name": "service_logs",
                                      "arguments": "{\"service\":\"db\"}"}}
                    ]
                },
                "finish_reason": "tool_calls"
            }]
        }"#;
        let wire: WireResponse = serde_json::from_str(raw).unwrap();
        let choice = wire.choices.into_iter().next().unwrap();
        let calls = parse_tool_calls(choice.message.tool_calls);
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].name, "triage_report");
        assert_eq!(calls[1].args["service"], "db");
        assert_eq!(choice.finish_reason.as_deref(), Some("tool_calls"));
    }

    #[test]
    fn malformed_arguments_fold_to_empty_object() {
        let wire = vec![WireToolCall {
            id: "call_1".to_string(),
            kind: "function".to_string(),
            function: WireFunction {
                name: "broken".to_string(),
                arguments: "{not json".to_string(),
            },
        }];
        let calls = parse_tool_calls(wire);
        assert_eq!(calls[0].args, json!({}));
    }

    #[test]
    fn response_with_plain_content() {
        let raw = r#"{"choices":[{"message":{"content":"all healthy"},"finish_reason":"stop"}]}"#;
        let wire: WireResponse = serde_json::from_str(raw).unwrap();
        let choice = wire.choices.into_iter().next().unwrap();
        assert_eq!(choice.message.content.as_deref(), Some("all healthy"));
        assert!(choice.message.tool_calls.is_empty());
    }

    // ── Helpers ──────────────────────────────────────────────────────────────

    #[test]
    fn retry_after_parses_seconds_only() {
        assert_eq!(parse_retry_after("30"), Some(Duration::from_secs(30)));
        assert_eq!(parse_retry_after(" 5 "), Some(Duration::from_secs(5)));
        assert_eq!(parse_retry_after("Wed, 21 Oct 2026 07:28:00 GMT"), None);
    }

    #[test]
    fn provider_rejects_bad_base_url() {
        assert!(OpenAiProvider::new("not a url", "key", "model").is_err());
    }

    #[test]
    fn body_truncation_is_bounded() {
        let long = "a".repeat(2000);
        let t = truncate_body(&long);
        assert!(t.chars().count() <= 501);
        assert!(t.ends_with('…'));
    }
}
