//! Tool registration and invocation (`spec.md` §4.7), generalized from the
//! teacher's `ToolRegistry`/`ToolProtocol` pair into a single dispatcher
//! that additionally enforces allow-lists, phase gating, and truncation.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use crate::conclave::agent::{Agent, AgentRegistry};
use crate::conclave::error::{EngineError, EngineResult};
use crate::conclave::phase_machine::Phase;

/// Output over this size is truncated with a trailing marker
/// (`spec.md` §4.7: "16 KiB").
pub const MAX_TOOL_OUTPUT_BYTES: usize = 16 * 1024;

/// Which class of side effect a tool has, used for phase gating
/// (`spec.md` §4.7: write/spawn-class tools are only permitted in the
/// `execute` phase).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolEffectClass {
    Read,
    Write,
    Publish,
    Spawn,
}

impl ToolEffectClass {
    fn requires_execute_phase(self) -> bool {
        matches!(self, ToolEffectClass::Write | ToolEffectClass::Spawn)
    }
}

/// A tool's result (`spec.md` §3), mirroring the teacher's
/// `ToolResult{success, output, error, metadata}` shape.
#[derive(Debug, Clone)]
pub struct ToolOutcome {
    pub success: bool,
    pub output: String,
    pub error: Option<String>,
}

impl ToolOutcome {
    pub fn success(output: impl Into<String>) -> Self {
        Self {
            success: true,
            output: output.into(),
            error: None,
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            output: String::new(),
            error: Some(error.into()),
        }
    }

    /// `spec.md` §4.7: truncate over-long output with a trailing marker.
    pub(crate) fn truncated(mut self) -> Self {
        if self.output.len() > MAX_TOOL_OUTPUT_BYTES {
            let mut cut = MAX_TOOL_OUTPUT_BYTES;
            while !self.output.is_char_boundary(cut) {
                cut -= 1;
            }
            self.output.truncate(cut);
            self.output.push_str("\n...[truncated]");
        }
        self
    }
}

/// A tool handler, generalized from the teacher's `ToolProtocol::execute`.
#[async_trait]
pub trait ToolHandler: Send + Sync {
    async fn invoke(&self, agent: &Agent, args: Value) -> EngineResult<ToolOutcome>;
}

pub struct ToolSpec {
    pub name: String,
    pub description: String,
    pub effect_class: ToolEffectClass,
    pub timeout: Duration,
    pub handler: Arc<dyn ToolHandler>,
}

/// Owns every registered tool and enforces the invocation contract
/// (`spec.md` §4.7): allow-list check, timeout, phase gate, truncation.
pub struct ToolDispatcher {
    tools: HashMap<String, ToolSpec>,
    agents: Arc<AgentRegistry>,
}

impl ToolDispatcher {
    pub fn new(agents: Arc<AgentRegistry>) -> Self {
        Self {
            tools: HashMap::new(),
            agents,
        }
    }

    pub fn register(&mut self, spec: ToolSpec) {
        self.tools.insert(spec.name.clone(), spec);
    }

    pub fn names(&self) -> Vec<String> {
        self.tools.keys().cloned().collect()
    }

    /// `spec.md` §4.7 `invoke`: allow-list check, phase gate, timeout-wrapped
    /// execution, truncation. Tool timeout does not fail the calling turn —
    /// it surfaces as a failed [`ToolOutcome`] the turn runner feeds back to
    /// the model, per §4.6's failure semantics.
    pub async fn invoke(
        &self,
        agent_slug: &str,
        tool_name: &str,
        current_phase: Phase,
        args: Value,
    ) -> EngineResult<ToolOutcome> {
        let agent = self
            .agents
            .by_slug(agent_slug)
            .ok_or_else(|| EngineError::ToolDenied {
                agent: agent_slug.to_string(),
                tool: tool_name.to_string(),
            })?;

        if !agent.can_use_tool(tool_name) {
            return Err(EngineError::ToolDenied {
                agent: agent_slug.to_string(),
                tool: tool_name.to_string(),
            });
        }

        let spec = self
            .tools
            .get(tool_name)
            .ok_or_else(|| EngineError::ToolInvalidArgs {
                tool: tool_name.to_string(),
                reason: "tool not registered".to_string(),
            })?;

        if spec.effect_class.requires_execute_phase() && current_phase != Phase::Execute {
            return Err(EngineError::ToolPhaseViolation {
                tool: tool_name.to_string(),
                phase: current_phase.as_str().to_string(),
            });
        }

        let millis = spec.timeout.as_millis() as u64;
        match tokio::time::timeout(spec.timeout, spec.handler.invoke(&agent, args)).await {
            Ok(Ok(outcome)) => Ok(outcome.truncated()),
            Ok(Err(err)) => Err(err),
            Err(_) => Err(EngineError::ToolTimeout {
                tool: tool_name.to_string(),
                millis,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conclave::agent::PubKey;

    struct EchoHandler;

    #[async_trait]
    impl ToolHandler for EchoHandler {
        async fn invoke(&self, _agent: &Agent, args: Value) -> EngineResult<ToolOutcome> {
            Ok(ToolOutcome::success(args.to_string()))
        }
    }

    struct SlowHandler;

    #[async_trait]
    impl ToolHandler for SlowHandler {
        async fn invoke(&self, _agent: &Agent, _args: Value) -> EngineResult<ToolOutcome> {
            tokio::time::sleep(Duration::from_millis(50)).await;
            Ok(ToolOutcome::success("done"))
        }
    }

    fn dispatcher_with(spec: ToolSpec) -> ToolDispatcher {
        let agents = Arc::new(AgentRegistry::new());
        agents.register(
            Agent::new("agent-a", PubKey::derive_from_slug("agent-a"))
                .with_tool_allow_list(vec![spec.name.clone()]),
        );
        let mut dispatcher = ToolDispatcher::new(agents);
        dispatcher.register(spec);
        dispatcher
    }

    #[tokio::test]
    async fn read_class_tool_runs_outside_execute_phase() {
        let dispatcher = dispatcher_with(ToolSpec {
            name: "read_conversation_history".to_string(),
            description: "reads history".to_string(),
            effect_class: ToolEffectClass::Read,
            timeout: Duration::from_millis(500),
            handler: Arc::new(EchoHandler),
        });
        let result = dispatcher
            .invoke("agent-a", "read_conversation_history", Phase::Chat, serde_json::json!({}))
            .await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn write_class_tool_is_denied_outside_execute_phase() {
        let dispatcher = dispatcher_with(ToolSpec {
            name: "apply_patch".to_string(),
            description: "applies a patch".to_string(),
            effect_class: ToolEffectClass::Write,
            timeout: Duration::from_millis(500),
            handler: Arc::new(EchoHandler),
        });
        let result = dispatcher
            .invoke("agent-a", "apply_patch", Phase::Chat, serde_json::json!({}))
            .await;
        assert!(matches!(result, Err(EngineError::ToolPhaseViolation { .. })));
    }

    #[tokio::test]
    async fn agent_outside_allow_list_is_denied() {
        let dispatcher = dispatcher_with(ToolSpec {
            name: "record_lesson".to_string(),
            description: "records a lesson".to_string(),
            effect_class: ToolEffectClass::Publish,
            timeout: Duration::from_millis(500),
            handler: Arc::new(EchoHandler),
        });
        let result = dispatcher
            .invoke("nobody", "record_lesson", Phase::Chat, serde_json::json!({}))
            .await;
        assert!(matches!(result, Err(EngineError::ToolDenied { .. })));
    }

    #[tokio::test]
    async fn slow_handler_times_out_without_panicking() {
        let dispatcher = dispatcher_with(ToolSpec {
            name: "slow".to_string(),
            description: "slow".to_string(),
            effect_class: ToolEffectClass::Read,
            timeout: Duration::from_millis(5),
            handler: Arc::new(SlowHandler),
        });
        let result = dispatcher
            .invoke("agent-a", "slow", Phase::Chat, serde_json::json!({}))
            .await;
        assert!(matches!(result, Err(EngineError::ToolTimeout { .. })));
    }

    #[test]
    fn output_over_limit_is_truncated_with_marker() {
        let outcome = ToolOutcome::success("a".repeat(MAX_TOOL_OUTPUT_BYTES + 10)).truncated();
        assert!(outcome.output.ends_with("...[truncated]"));
        assert!(outcome.output.len() <= MAX_TOOL_OUTPUT_BYTES + "\n...[truncated]".len());
    }
}
