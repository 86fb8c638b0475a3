//! The closed error taxonomy for the conversation engine core.
//!
//! Every variant here is a value, never thrown control flow — callers match
//! on it and decide what to surface (a tool result, a status event, a fatal
//! startup abort). See `spec.md` §7 for the propagation policy.

use thiserror::Error;

/// All errors the core can produce.
#[derive(Debug, Error, Clone)]
pub enum EngineError {
    /// Rejected at an API boundary (malformed request from a caller).
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Missing or invalid configuration. Fatal at startup; a status event at
    /// runtime.
    #[error("configuration error: {0}")]
    ConfigError(String),

    /// No relay acknowledged a publish within the publish timeout.
    #[error("transport unavailable: {0}")]
    TransportUnavailable(String),

    /// An LLM transport error that is safe to retry.
    #[error("retryable LLM error: {0}")]
    LlmErrorRetryable(String),

    /// An LLM transport error (or a repeated malformed tool call) that is
    /// not safe to retry further.
    #[error("fatal LLM error: {0}")]
    LlmErrorFatal(String),

    /// A tool call's arguments failed schema validation.
    #[error("invalid tool arguments for `{tool}`: {reason}")]
    ToolInvalidArgs { tool: String, reason: String },

    /// A tool handler did not return within its configured timeout.
    #[error("tool `{tool}` timed out after {millis}ms")]
    ToolTimeout { tool: String, millis: u64 },

    /// A write/spawn-class tool was invoked outside the `execute` phase.
    #[error("tool `{tool}` is not permitted in phase `{phase}`")]
    ToolPhaseViolation { tool: String, phase: String },

    /// A tool was invoked by an agent whose allow-list does not include it.
    #[error("agent `{agent}` is not permitted to call tool `{tool}`")]
    ToolDenied { agent: String, tool: String },

    /// A requested phase transition is not an edge in the phase lattice.
    #[error("illegal phase transition: {from} -> {to}")]
    IllegalPhase { from: String, to: String },

    /// The Supervisor has raised intervention-required, blocking the
    /// transition or turn in question.
    #[error("intervention required: {reason}")]
    InterventionRequired { reason: String },

    /// The referenced conversation id is not known to the store.
    #[error("unknown conversation: {0}")]
    UnknownConversation(String),

    /// The referenced conversation id was evicted and tombstoned.
    #[error("tombstoned conversation: {0}")]
    TombstonedConversation(String),

    /// No agent survived addressing/filtering for an inbound event.
    #[error("no addressable agents for conversation {0}")]
    NoAddressableAgents(String),
}

impl EngineError {
    /// True for errors that are always surfaced as a status event on the
    /// owning conversation rather than recovered inside a turn (per
    /// spec.md §7 propagation policy).
    pub fn always_surfaces_as_status(&self) -> bool {
        matches!(
            self,
            EngineError::ConfigError(_)
                | EngineError::TransportUnavailable(_)
                | EngineError::UnknownConversation(_)
                | EngineError::TombstonedConversation(_)
                | EngineError::NoAddressableAgents(_)
        )
    }
}

/// Convenience alias used throughout the crate.
pub type EngineResult<T> = Result<T, EngineError>;
