//! The bounded tool-calling agent loop and its tool registry.
//!
//! The loop is a three-state machine (awaiting-model, executing-tools,
//! returning) with two guards: the iteration budget and the repeated-
//! failure limit. Tool calls execute sequentially in the order the model
//! returned them; results are truncated with a deterministic suffix so
//! multi-turn conversations stay stable. Transient provider errors are NOT
//! retried here; retry is the provider's concern.

#![forbid(unsafe_code)]

use async_trait::async_trait;
use dozor_provider::{ChatMessage, ChatProvider, ProviderError, ToolSchema};
use serde_json::Value;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Deterministic marker appended to truncated tool results.
pub const TRUNCATION_SUFFIX: &str = " …(truncated)";

// ─── Tools ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ToolError {
    #[error("unknown tool: {0}")]
    Unknown(String),

    #[error("invalid arguments: {0}")]
    InvalidArgs(String),

    #[error("command rejected: {0}")]
    Rejected(String),

    #[error("{0}")]
    Failed(String),

    #[error("tool cancelled")]
    Cancelled,
}

/// One callable capability exposed to the model.
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;
    fn description(&self) -> &str;
    /// JSON-schema object describing the argument mapping.
    fn parameters(&self) -> Value;
    async fn execute(&self, cancel: &CancellationToken, args: &Value) -> Result<String, ToolError>;
}

/// Required string argument, with a precise message on absence.
pub fn require_str<'a>(args: &'a Value, key: &str) -> Result<&'a str, ToolError> {
    args.get(key)
        .and_then(Value::as_str)
        .filter(|s| !s.trim().is_empty())
        .ok_or_else(|| ToolError::InvalidArgs(format!("missing required argument {key:?}")))
}

/// Optional integer argument.
pub fn optional_u64(args: &Value, key: &str) -> Result<Option<u64>, ToolError> {
    match args.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(v) => v
            .as_u64()
            .map(Some)
            .ok_or_else(|| ToolError::InvalidArgs(format!("argument {key:?} must be an integer"))),
    }
}

/// Pluggable validation applied before any tool executes. Returning an error
/// refuses the call with no state change.
pub type ValidationPredicate = Arc<dyn Fn(&str, &Value) -> Result<(), String> + Send + Sync>;

/// Name → tool dispatch, in registration order.
pub struct ToolRegistry {
    tools: Vec<Arc<dyn Tool>>,
    validator: Option<ValidationPredicate>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            tools: Vec::new(),
            validator: None,
        }
    }

    pub fn with_validator(mut self, validator: ValidationPredicate) -> Self {
        self.validator = Some(validator);
        self
    }

    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        self.tools.push(tool);
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn Tool>> {
        self.tools.iter().find(|t| t.name() == name)
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Schemas advertised to the provider, in registration order.
    pub fn schemas(&self) -> Vec<ToolSchema> {
        self.tools
            .iter()
            .map(|t| ToolSchema {
                name: t.name().to_string(),
                description: t.description().to_string(),
                parameters: t.parameters(),
            })
            .collect()
    }

    /// Validate and execute one call.
    pub async fn execute(
        &self,
        name: &str,
        args: &Value,
        cancel: &CancellationToken,
    ) -> Result<String, ToolError> {
        let tool = self
            .get(name)
            .ok_or_else(|| ToolError::Unknown(name.to_string()))?;
        if let Some(validator) = &self.validator {
            validator(name, args).map_err(ToolError::Rejected)?;
        }
        tool.execute(cancel, args).await
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

// ─── Agent loop ───────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error("agent cancelled")]
    Cancelled,

    #[error("provider call failed: {0}")]
    Provider(#[from] ProviderError),

    #[error("max tool iterations ({0}) reached without a final answer")]
    IterationBudget(u32),

    #[error("tool {tool} failed {count} times in a row: {last_error}")]
    RepeatedToolFailure {
        tool: String,
        count: u32,
        last_error: String,
    },
}

#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub identity: String,
    pub max_iterations: u32,
    pub max_tool_result_len: usize,
    pub max_repeat_fails: u32,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            identity: "You are dozor, a server-operations agent. You observe a \
                       container fleet, diagnose problems from triage reports and \
                       logs, and take corrective action through your tools. Be \
                       precise; never invent host state."
                .to_string(),
            max_iterations: 10,
            max_tool_result_len: 4000,
            max_repeat_fails: 2,
        }
    }
}

/// The three loop states. Transitions are unconditional except for the
/// iteration-budget and repeat-failure guards.
enum LoopState {
    AwaitingModel,
    ExecutingTools(Vec<dozor_provider::ToolCall>),
    Returning(String),
}

/// Tracks consecutive identical failures of one tool.
#[derive(Default)]
struct RepeatGuard {
    last: Option<(String, String, u32)>,
}

impl RepeatGuard {
    /// Record a failure; returns the consecutive count for this (tool, error).
    fn record_failure(&mut self, tool: &str, error: &str) -> u32 {
        match &mut self.last {
            Some((t, e, count)) if t == tool && e == error => {
                *count += 1;
                *count
            }
            _ => {
                self.last = Some((tool.to_string(), error.to_string(), 1));
                1
            }
        }
    }

    fn record_success(&mut self) {
        self.last = None;
    }
}

/// Driver for tool-calling LLMs over a registry.
pub struct AgentLoop {
    provider: Arc<dyn ChatProvider>,
    registry: Arc<ToolRegistry>,
    config: AgentConfig,
    conversation: Vec<ChatMessage>,
}

impl AgentLoop {
    pub fn new(
        provider: Arc<dyn ChatProvider>,
        registry: Arc<ToolRegistry>,
        config: AgentConfig,
    ) -> Self {
        Self {
            provider,
            registry,
            config,
            conversation: Vec::new(),
        }
    }

    /// Number of messages currently in the conversation.
    pub fn conversation_len(&self) -> usize {
        self.conversation.len()
    }

    /// Drop the conversation, keeping the system identity for the next turn.
    pub fn reset(&mut self) {
        self.conversation.clear();
    }

    /// Process one user turn to a final assistant answer.
    pub async fn process(
        &mut self,
        user_text: &str,
        cancel: &CancellationToken,
    ) -> Result<String, AgentError> {
        if self.conversation.is_empty() {
            self.conversation
                .push(ChatMessage::system(self.system_prompt()));
        }
        self.conversation.push(ChatMessage::user(user_text));

        let schemas = self.registry.schemas();
        let mut state = LoopState::AwaitingModel;
        let mut iterations = 0u32;
        let mut guard = RepeatGuard::default();

        loop {
            state = match state {
                LoopState::AwaitingModel => {
                    if cancel.is_cancelled() {
                        return Err(AgentError::Cancelled);
                    }
                    if iterations >= self.config.max_iterations {
                        return Err(AgentError::IterationBudget(self.config.max_iterations));
                    }
                    iterations += 1;

                    let response = self.provider.chat(&self.conversation, &schemas).await?;
                    if response.has_tool_calls() {
                        self.conversation
                            .push(ChatMessage::assistant_tool_calls(&response.tool_calls));
                        LoopState::ExecutingTools(response.tool_calls)
                    } else {
                        match response.content {
                            Some(content) if !content.trim().is_empty() => {
                                LoopState::Returning(content)
                            }
                            _ => {
                                // Whitespace answer: ask again, against the
                                // same iteration budget.
                                debug!(subsystem = "agent", iteration = iterations,
                                    "model returned empty content, continuing");
                                LoopState::AwaitingModel
                            }
                        }
                    }
                }

                LoopState::ExecutingTools(calls) => {
                    for call in &calls {
                        if cancel.is_cancelled() {
                            return Err(AgentError::Cancelled);
                        }
                        info!(subsystem = "agent", tool = %call.name, "executing tool call");
                        match self.registry.execute(&call.name, &call.args, cancel).await {
                            Ok(result) => {
                                guard.record_success();
                                let text =
                                    truncate_result(&result, self.config.max_tool_result_len);
                                self.conversation
                                    .push(ChatMessage::tool_result(&call.id, text));
                            }
                            Err(ToolError::Cancelled) => return Err(AgentError::Cancelled),
                            Err(err) => {
                                let message = err.to_string();
                                let count = guard.record_failure(&call.name, &message);
                                warn!(subsystem = "agent", tool = %call.name, count,
                                    error = %message, "tool call failed");
                                if count >= self.config.max_repeat_fails + 1 {
                                    return Err(AgentError::RepeatedToolFailure {
                                        tool: call.name.clone(),
                                        count,
                                        last_error: message,
                                    });
                                }
                                self.conversation.push(ChatMessage::tool_result(
                                    &call.id,
                                    format!("error: {message}"),
                                ));
                            }
                        }
                    }
                    LoopState::AwaitingModel
                }

                LoopState::Returning(content) => {
                    self.conversation.push(ChatMessage::assistant(&content));
                    return Ok(content);
                }
            };
        }
    }

    fn system_prompt(&self) -> String {
        let mut prompt = self.config.identity.clone();
        if !self.registry.is_empty() {
            let names: Vec<String> = self.registry.schemas().into_iter().map(|s| s.name).collect();
            prompt.push_str(&format!("\n\nAvailable tools: {}.", names.join(", ")));
        }
        prompt
    }
}

/// Cap a tool result, appending the deterministic truncation marker.
pub fn truncate_result(result: &str, max_len: usize) -> String {
    if result.chars().count() <= max_len {
        return result.to_string();
    }
    let cut: String = result.chars().take(max_len).collect();
    format!("{cut}{TRUNCATION_SUFFIX}")
}

// ─── Tests ────────────────────────────────────────────────────────────────────
