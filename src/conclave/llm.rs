//! The LLM boundary: a provider-agnostic chat-completion trait, trimmed
//! from the teacher's `ClientWrapper` of streaming/native-tool-schema
//! machinery this system doesn't need (DESIGN.md records the trim).

use async_trait::async_trait;

use crate::conclave::error::EngineResult;

/// A single turn of conversation history handed to the model.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Role {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }

    /// A crude token-count heuristic (`spec.md` §4.6 step 2c), carried
    /// directly from the teacher's `LLMSession::count_tokens`.
    pub fn approx_tokens(&self) -> usize {
        self.content.len() / 4
    }
}

#[derive(Debug, Clone)]
pub struct ChatCompletion {
    pub content: String,
}

/// The boundary the core calls through to get a model reply.
/// `spec.md` §1 Non-goals: provider SDKs, retries, and rate limiting live on
/// the implementation behind this trait.
#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn complete(&self, messages: &[ChatMessage]) -> EngineResult<ChatCompletion>;

    fn model_name(&self) -> &str;
}

/// Trims the oldest non-system messages until the remaining history fits
/// under `max_tokens`, mirroring the teacher's
/// `LLMSession::trim_conversation_history`.
pub fn trim_to_budget(mut messages: Vec<ChatMessage>, max_tokens: usize) -> Vec<ChatMessage> {
    let mut total: usize = messages.iter().map(ChatMessage::approx_tokens).sum();
    let mut cursor = 0;
    while total > max_tokens && cursor < messages.len() {
        if messages[cursor].role == Role::System {
            cursor += 1;
            continue;
        }
        total -= messages[cursor].approx_tokens();
        messages.remove(cursor);
    }
    messages
}

/// A scripted reply queue for deterministic tests (Scenarios A-F), grounded
/// on the teacher's `MockClient` pattern used throughout `tests/`.
pub struct ScriptedLlmClient {
    model_name: String,
    replies: std::sync::Mutex<std::collections::VecDeque<String>>,
}

impl ScriptedLlmClient {
    pub fn new(model_name: impl Into<String>, replies: Vec<String>) -> Self {
        Self {
            model_name: model_name.into(),
            replies: std::sync::Mutex::new(replies.into()),
        }
    }
}

#[async_trait]
impl LlmClient for ScriptedLlmClient {
    async fn complete(&self, _messages: &[ChatMessage]) -> EngineResult<ChatCompletion> {
        let mut replies = self.replies.lock().unwrap();
        let content = replies
            .pop_front()
            .unwrap_or_else(|| "(no scripted reply left)".to_string());
        Ok(ChatCompletion { content })
    }

    fn model_name(&self) -> &str {
        &self.model_name
    }
}
