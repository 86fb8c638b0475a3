//! Executes one agent turn: prompt, LLM call, tool-call loop, reply
//! publication (`spec.md` §4.6).

use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use serde_json::Value;

use crate::conclave::agent::{Agent, AgentRegistry};
use crate::conclave::conversation::{ActiveTurn, ConversationStore};
use crate::conclave::error::{EngineError, EngineResult};
use crate::conclave::event::{Event, EventBus, EventKind, Tag};
use crate::conclave::execution_logger::{ExecutionLogRecord, ExecutionLogger};
use crate::conclave::llm::{trim_to_budget, ChatMessage, LlmClient};
use crate::conclave::phase_machine::{Phase, ReviewDecision};
use crate::conclave::reflection::{Lesson, ReflectionSystem};
use crate::conclave::supervisor::{CheckpointStatus, RiskLevel, SupervisedTaskType, Supervisor};
use crate::conclave::tool_dispatcher::{ToolDispatcher, ToolOutcome};

/// Per-run tunables (`spec.md` §4.6/§5 defaults).
#[derive(Debug, Clone)]
pub struct TurnLimits {
    pub max_tool_calls: usize,
    pub llm_context_budget_tokens: usize,
    pub retry_backoff: [Duration; 3],
}

impl Default for TurnLimits {
    fn default() -> Self {
        Self {
            max_tool_calls: 8,
            llm_context_budget_tokens: 6000,
            retry_backoff: [
                Duration::from_millis(200),
                Duration::from_millis(800),
                Duration::from_millis(3200),
            ],
        }
    }
}

/// A single parsed `<tool_use>{...}</tool_use>` block (`spec.md` §6).
#[derive(Debug, Clone, Deserialize)]
struct ParsedToolCall {
    name: String,
    #[serde(default)]
    arguments: Value,
    #[serde(default)]
    id: Option<String>,
}

/// Extracts every `<tool_use>...</tool_use>` envelope from assistant
/// content. Buffers the whole message rather than parsing incrementally
/// off a token stream — DESIGN.md records this as a simplification of the
/// streaming parser `spec.md` §9 calls for; the envelope grammar matched is
/// identical, so swapping in an incremental parser later doesn't change any
/// caller of this function.
fn parse_tool_use_blocks(content: &str) -> Result<Vec<ParsedToolCall>, String> {
    const OPEN: &str = "<tool_use>";
    const CLOSE: &str = "</tool_use>";
    let mut calls = Vec::new();
    let mut rest = content;
    while let Some(start) = rest.find(OPEN) {
        let after_open = &rest[start + OPEN.len()..];
        let Some(end) = after_open.find(CLOSE) else {
            return Err(format!("unterminated {OPEN} block"));
        };
        let json_slice = &after_open[..end];
        let call: ParsedToolCall = serde_json::from_str(json_slice)
            .map_err(|err| format!("malformed tool_use JSON: {err}"))?;
        calls.push(call);
        rest = &after_open[end + CLOSE.len()..];
    }
    Ok(calls)
}

/// Text with every `<tool_use>` envelope stripped, left over for the reply.
fn strip_tool_use_blocks(content: &str) -> String {
    const OPEN: &str = "<tool_use>";
    const CLOSE: &str = "</tool_use>";
    let mut out = String::new();
    let mut rest = content;
    while let Some(start) = rest.find(OPEN) {
        out.push_str(&rest[..start]);
        let after_open = &rest[start + OPEN.len()..];
        match after_open.find(CLOSE) {
            Some(end) => rest = &after_open[end + CLOSE.len()..],
            None => {
                rest = "";
                break;
            }
        }
    }
    out.push_str(rest);
    out.trim().to_string()
}

fn phase_prelude(phase: Phase) -> &'static str {
    match phase {
        Phase::Chat => "You are in the chat phase: clarify the request and decide whether planning is needed.",
        Phase::Plan => "You are in the plan phase: produce a concrete plan before requesting execution.",
        Phase::Execute => "You are in the execute phase: carry out the plan using the tools available to you.",
        Phase::Review => "You are in the review phase: assess the work and hand the decision to the supervisor.",
        Phase::Reflect => "You are in the reflect phase: record any lessons learned before closing out.",
        Phase::Done => "This conversation is done.",
    }
}

pub struct TurnRunner {
    conversations: Arc<ConversationStore>,
    agents: Arc<AgentRegistry>,
    bus: Arc<dyn EventBus>,
    tools: Arc<ToolDispatcher>,
    llm: Arc<dyn LlmClient>,
    logger: Arc<ExecutionLogger>,
    supervisor: Arc<Supervisor>,
    reflection: Arc<ReflectionSystem>,
    limits: TurnLimits,
}

impl TurnRunner {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        conversations: Arc<ConversationStore>,
        agents: Arc<AgentRegistry>,
        bus: Arc<dyn EventBus>,
        tools: Arc<ToolDispatcher>,
        llm: Arc<dyn LlmClient>,
        logger: Arc<ExecutionLogger>,
        supervisor: Arc<Supervisor>,
        reflection: Arc<ReflectionSystem>,
    ) -> Self {
        Self {
            conversations,
            agents,
            bus,
            tools,
            llm,
            logger,
            supervisor,
            reflection,
            limits: TurnLimits::default(),
        }
    }

    pub fn with_limits(mut self, limits: TurnLimits) -> Self {
        self.limits = limits;
        self
    }

    /// `spec.md` §4.6: runs one full turn for `agent_slug` against
    /// `triggering_event`, already appended to `conversation_id`'s history
    /// by the Router.
    pub async fn run_turn(
        &self,
        conversation_id: &str,
        agent_slug: &str,
        triggering_event: &Event,
    ) -> EngineResult<()> {
        let agent = self
            .agents
            .by_slug(agent_slug)
            .ok_or_else(|| EngineError::ToolDenied {
                agent: agent_slug.to_string(),
                tool: "<turn>".to_string(),
            })?;

        self.set_active_turn(conversation_id, ActiveTurn::Running).await;
        self.logger.log(ExecutionLogRecord::ExecutionFlowStart {
            conversation_id: conversation_id.to_string(),
            turn_seq: self.turn_seq(conversation_id).await,
        });

        self.publish(&agent, EventKind::TypingStart, String::new(), vec![self.e_tag(conversation_id)])
            .await
            .ok();

        let result = self.run_turn_inner(conversation_id, &agent, triggering_event).await;

        self.publish(&agent, EventKind::TypingStop, String::new(), vec![self.e_tag(conversation_id)])
            .await
            .ok();

        if let Err(err) = &result {
            self.publish(
                &agent,
                EventKind::StatusUpdate,
                format!("turn_failed: {err}"),
                vec![self.e_tag(conversation_id)],
            )
            .await
            .ok();
        }

        self.logger.log(ExecutionLogRecord::ExecutionFlowComplete {
            conversation_id: conversation_id.to_string(),
            turn_seq: self.turn_seq(conversation_id).await,
        });
        self.set_active_turn(conversation_id, ActiveTurn::None).await;

        result
    }

    async fn run_turn_inner(
        &self,
        conversation_id: &str,
        agent: &Agent,
        triggering_event: &Event,
    ) -> EngineResult<()> {
        let mut messages = self.build_prompt(conversation_id, agent, triggering_event).await;
        let mut tool_calls_made = 0usize;
        let mut corrective_reprompt_used = false;

        loop {
            let completion = self.call_llm_with_retry(&messages).await?;

            let calls = match parse_tool_use_blocks(&completion.content) {
                Ok(calls) => calls,
                Err(parse_error) => {
                    if corrective_reprompt_used {
                        return Err(EngineError::LlmErrorFatal(format!(
                            "malformed tool call after corrective re-prompt: {parse_error}"
                        )));
                    }
                    corrective_reprompt_used = true;
                    messages.push(ChatMessage::assistant(completion.content.clone()));
                    messages.push(ChatMessage::user(format!(
                        "Your last tool call could not be parsed: {parse_error}. Please resend a valid <tool_use> block."
                    )));
                    continue;
                }
            };

            if calls.is_empty() {
                let reply_text = strip_tool_use_blocks(&completion.content);
                self.publish_reply(conversation_id, agent, triggering_event, reply_text)
                    .await?;
                return Ok(());
            }

            messages.push(ChatMessage::assistant(completion.content.clone()));

            for call in calls {
                if tool_calls_made >= self.limits.max_tool_calls {
                    return Err(EngineError::InvalidInput("tool_budget_exceeded".to_string()));
                }
                tool_calls_made += 1;

                let phase = self
                    .conversations
                    .with_lock(conversation_id, |conv| {
                        std::future::ready(conv.phase_machine.current())
                    })
                    .await
                    .unwrap_or(Phase::Chat);

                self.logger.log(ExecutionLogRecord::ToolExecutionStart {
                    conversation_id: conversation_id.to_string(),
                    agent_slug: agent.slug.clone(),
                    tool_name: call.name.clone(),
                });

                let outcome = self
                    .dispatch_tool_call(conversation_id, agent, phase, &call)
                    .await;

                let (success, feedback) = match &outcome {
                    Ok(outcome) => (outcome.success, outcome.output.clone()),
                    Err(err) => (false, err.to_string()),
                };

                self.logger.log(ExecutionLogRecord::ToolExecutionComplete {
                    conversation_id: conversation_id.to_string(),
                    agent_slug: agent.slug.clone(),
                    tool_name: call.name.clone(),
                    success,
                });

                messages.push(ChatMessage::user(format!(
                    "tool_result[{}]: {}",
                    call.id.clone().unwrap_or_else(|| call.name.clone()),
                    feedback
                )));
            }

            messages = trim_to_budget(messages, self.limits.llm_context_budget_tokens);
        }
    }

    /// Handles the six mandatory built-in tools synchronously so their
    /// effect lands before the next tool call or the turn's reply
    /// (`spec.md` §4.6 step 6); all other tools go through
    /// [`ToolDispatcher`] unchanged. `request_phase_transition` and
    /// `complete_milestone` need the conversation's phase machine and the
    /// Supervisor directly; `publish_status`/`publish_typing` need the bus
    /// under the calling agent's identity; `record_lesson` needs the
    /// ReflectionSystem; `read_conversation_history` needs the store. None
    /// of that context is available inside a generic [`ToolHandler`], so
    /// all six are handled here rather than registered on the dispatcher.
    async fn dispatch_tool_call(
        &self,
        conversation_id: &str,
        agent: &Agent,
        phase: Phase,
        call: &ParsedToolCall,
    ) -> EngineResult<ToolOutcome> {
        if !agent.can_use_tool(&call.name) {
            return Err(EngineError::ToolDenied {
                agent: agent.slug.clone(),
                tool: call.name.clone(),
            });
        }

        match call.name.as_str() {
            "request_phase_transition" => self.handle_phase_transition(conversation_id, agent, &call.arguments).await,
            "complete_milestone" => self.handle_complete_milestone(conversation_id, agent, &call.arguments).await,
            "record_lesson" => self.handle_record_lesson(agent, &call.arguments).await,
            "publish_status" => self.handle_publish_status(conversation_id, agent, &call.arguments).await,
            "publish_typing" => self.handle_publish_typing(conversation_id, agent, &call.arguments).await,
            "read_conversation_history" => self.handle_read_conversation_history(conversation_id).await,
            _ => {
                self.tools
                    .invoke(&agent.slug, &call.name, phase, call.arguments.clone())
                    .await
            }
        }
    }

    /// `spec.md` §4.9: the `record_lesson` tool invocation that
    /// ReflectionSystem observes and publishes as a Lesson.
    async fn handle_record_lesson(&self, agent: &Agent, args: &Value) -> EngineResult<ToolOutcome> {
        let title = args
            .get("title")
            .and_then(Value::as_str)
            .ok_or_else(|| EngineError::ToolInvalidArgs {
                tool: "record_lesson".to_string(),
                reason: "missing `title`".to_string(),
            })?
            .to_string();
        let body = args
            .get("lesson")
            .and_then(Value::as_str)
            .ok_or_else(|| EngineError::ToolInvalidArgs {
                tool: "record_lesson".to_string(),
                reason: "missing `lesson`".to_string(),
            })?
            .to_string();
        let reference_event_id = args
            .get("referenceEventId")
            .and_then(Value::as_str)
            .map(str::to_string);

        let lesson = Lesson {
            owning_agent: agent.pubkey,
            title,
            body,
            reference_event_id,
        };
        match self.reflection.publish(lesson).await {
            Some(event_id) => Ok(ToolOutcome::success(format!("lesson published as {event_id}"))),
            None => Ok(ToolOutcome::failure("lesson publish failed after retry")),
        }
    }

    /// `spec.md` §4.6 step 1/5 plumbed through as an explicit tool so an
    /// agent can narrate its own status mid-turn (`spec.md` §6 Status
    /// update tags: `confidence`, `commit`, task `e`-tag).
    async fn handle_publish_status(
        &self,
        conversation_id: &str,
        agent: &Agent,
        args: &Value,
    ) -> EngineResult<ToolOutcome> {
        let content = args
            .get("content")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();

        let mut tags = vec![self.e_tag(conversation_id)];
        if let Some(task_id) = args.get("taskId").and_then(Value::as_str) {
            tags.push(vec!["e".to_string(), task_id.to_string(), String::new(), "task".to_string()]);
        }
        if let Some(confidence) = args.get("confidence").and_then(Value::as_u64) {
            tags.push(vec!["confidence".to_string(), confidence.to_string()]);
        }
        if let Some(commit) = args.get("commit").and_then(Value::as_str) {
            tags.push(vec!["commit".to_string(), commit.to_string()]);
        }

        self.publish(agent, EventKind::StatusUpdate, content, tags).await?;
        Ok(ToolOutcome::success("status published"))
    }

    async fn handle_publish_typing(
        &self,
        conversation_id: &str,
        agent: &Agent,
        args: &Value,
    ) -> EngineResult<ToolOutcome> {
        let state = args.get("state").and_then(Value::as_str).unwrap_or("start");
        let kind = if state == "stop" {
            EventKind::TypingStop
        } else {
            EventKind::TypingStart
        };
        self.publish(agent, kind, String::new(), vec![self.e_tag(conversation_id)])
            .await?;
        Ok(ToolOutcome::success(format!("typing {state} published")))
    }

    /// `spec.md` §4.7: "at least one read-only introspection tool
    /// (`read_conversation_history`)". Truncated the same way ToolDispatcher
    /// truncates any other tool's output.
    async fn handle_read_conversation_history(&self, conversation_id: &str) -> EngineResult<ToolOutcome> {
        let history = self
            .conversations
            .with_lock(conversation_id, |conv| std::future::ready(conv.history.clone()))
            .await
            .ok_or_else(|| EngineError::UnknownConversation(conversation_id.to_string()))?;

        let summary: Vec<_> = history
            .iter()
            .map(|e| serde_json::json!({"author": e.author.to_hex(), "content": e.content}))
            .collect();
        let output = serde_json::Value::Array(summary).to_string();
        Ok(ToolOutcome::success(output).truncated())
    }

    async fn handle_phase_transition(
        &self,
        conversation_id: &str,
        agent: &Agent,
        args: &Value,
    ) -> EngineResult<crate::conclave::tool_dispatcher::ToolOutcome> {
        let to = args
            .get("to")
            .and_then(Value::as_str)
            .ok_or_else(|| EngineError::ToolInvalidArgs {
                tool: "request_phase_transition".to_string(),
                reason: "missing `to`".to_string(),
            })?;
        let reason = args
            .get("reason")
            .and_then(Value::as_str)
            .unwrap_or("")
            .to_string();
        let target = match to {
            "chat" => Phase::Chat,
            "plan" => Phase::Plan,
            "execute" => Phase::Execute,
            "review" => Phase::Review,
            "reflect" => Phase::Reflect,
            "done" => Phase::Done,
            other => {
                return Err(EngineError::ToolInvalidArgs {
                    tool: "request_phase_transition".to_string(),
                    reason: format!("unknown phase `{other}`"),
                })
            }
        };

        self.logger.log(ExecutionLogRecord::PhaseTransitionTrigger {
            conversation_id: conversation_id.to_string(),
            requested_by: agent.slug.clone(),
            to_phase: to.to_string(),
        });

        let transition = self
            .conversations
            .with_lock(conversation_id, |conv| {
                let result = conv.phase_machine.request_transition(target, agent.slug.clone(), reason.clone());
                std::future::ready(result)
            })
            .await
            .ok_or_else(|| EngineError::UnknownConversation(conversation_id.to_string()))?;

        match transition {
            Ok(executed) => {
                self.logger.log(ExecutionLogRecord::PhaseTransitionExecuted {
                    conversation_id: conversation_id.to_string(),
                    from_phase: executed.from.as_str().to_string(),
                    to_phase: executed.to.as_str().to_string(),
                    duration_ms: executed.since_prior_transition.as_millis(),
                });

                let mut started_task_id = None;
                if executed.to == Phase::Execute {
                    if let Some(task_type) = args.get("taskType").and_then(Value::as_str) {
                        started_task_id =
                            Some(self.start_supervision(conversation_id, agent, task_type, args));
                    }
                }

                if let Some(task_id) = &started_task_id {
                    let task_id = task_id.clone();
                    self.conversations
                        .with_lock(conversation_id, |conv| {
                            conv.milestone_ids.push(task_id);
                            std::future::ready(())
                        })
                        .await;
                }

                let mut message = format!("transitioned {} -> {}", executed.from.as_str(), executed.to.as_str());
                if let Some(task_id) = started_task_id {
                    message.push_str(&format!(", supervision started as {task_id}"));
                }
                Ok(crate::conclave::tool_dispatcher::ToolOutcome::success(message))
            }
            Err(err) => Ok(crate::conclave::tool_dispatcher::ToolOutcome::failure(err.to_string())),
        }
    }

    /// `spec.md` §4.8: "For each conversation that enters a supervised task
    /// type ..., creates a SupervisionTask with generated checkpoints." The
    /// agent declares the task type as part of its
    /// `request_phase_transition{to:"execute", taskType:...}` call — the
    /// only place in the turn loop where the conversation's task shape is
    /// known. Unrecognized `taskType` values fall back to the default
    /// checkpoint set.
    fn start_supervision(&self, conversation_id: &str, agent: &Agent, task_type: &str, args: &Value) -> String {
        let supervised_type = match task_type {
            "code_generation" => SupervisedTaskType::CodeGeneration,
            "system_modification" => SupervisedTaskType::SystemModification,
            "data_processing" => SupervisedTaskType::DataProcessing,
            _ => SupervisedTaskType::MultiStepOperation,
        };
        let risk_level = match args.get("riskLevel").and_then(Value::as_str) {
            Some("high") => RiskLevel::High,
            Some("low") => RiskLevel::Low,
            _ => RiskLevel::Medium,
        };
        let max_duration = args
            .get("maxDurationSecs")
            .and_then(Value::as_u64)
            .map(Duration::from_secs)
            .unwrap_or(Duration::from_secs(1800));
        let task_id = args
            .get("taskId")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

        self.supervisor.start_task(
            task_id.clone(),
            conversation_id.to_string(),
            agent.pubkey,
            format!("{task_type} entering execute"),
            supervised_type,
            risk_level,
            max_duration,
        )
    }

    /// `spec.md` §4.8: records the checkpoint's reported status, then — if
    /// that recording raised `intervention_required` — vetoes the
    /// conversation's phase machine and publishes an intervention status
    /// event. Finally translates `completeSupervision`'s pass/fail verdict
    /// into the review-phase decision the gatekeeper in `phase_machine.rs`
    /// consults on the next `request_phase_transition` call.
    async fn handle_complete_milestone(
        &self,
        conversation_id: &str,
        agent: &Agent,
        args: &Value,
    ) -> EngineResult<crate::conclave::tool_dispatcher::ToolOutcome> {
        let task_id = args
            .get("taskId")
            .and_then(Value::as_str)
            .ok_or_else(|| EngineError::ToolInvalidArgs {
                tool: "complete_milestone".to_string(),
                reason: "missing `taskId`".to_string(),
            })?;

        if let Some(checkpoint) = args.get("checkpoint").and_then(Value::as_str) {
            let status = match args.get("status").and_then(Value::as_str) {
                Some("failed") => CheckpointStatus::Failed,
                Some("skipped") => CheckpointStatus::Skipped,
                Some("pending") => CheckpointStatus::Pending,
                _ => CheckpointStatus::Passed,
            };
            let notes = args.get("notes").and_then(Value::as_str).map(str::to_string);
            let escalated = self.supervisor.record_checkpoint(task_id, checkpoint, status, notes);

            if escalated {
                let reason = format!(
                    "checkpoint `{checkpoint}` for task `{task_id}` failed or exceeded its time budget"
                );
                self.conversations
                    .with_lock(conversation_id, |conv| {
                        conv.phase_machine.set_intervention_required(Some(reason.clone()));
                        std::future::ready(())
                    })
                    .await;
                self.publish(
                    agent,
                    EventKind::StatusUpdate,
                    format!("intervention_required: {reason}"),
                    vec![self.e_tag(conversation_id)],
                )
                .await
                .ok();
            }
        }

        match self.supervisor.complete_supervision(task_id) {
            Some(result) => {
                let decision = if result.passed {
                    ReviewDecision::Approve
                } else {
                    ReviewDecision::Reject
                };
                self.conversations
                    .with_lock(conversation_id, |conv| {
                        conv.phase_machine.set_review_decision(decision);
                        std::future::ready(())
                    })
                    .await;

                Ok(crate::conclave::tool_dispatcher::ToolOutcome::success(format!(
                    "passed={} issues={:?} conversation={conversation_id}",
                    result.passed, result.issues
                )))
            }
            None => Err(EngineError::ToolInvalidArgs {
                tool: "complete_milestone".to_string(),
                reason: format!("unknown task `{task_id}`"),
            }),
        }
    }

    /// `spec.md` §4.6 step 2: system instructions, phase prelude, budget
    /// truncated history, the triggering event verbatim at the tail.
    async fn build_prompt(
        &self,
        conversation_id: &str,
        agent: &Agent,
        triggering_event: &Event,
    ) -> Vec<ChatMessage> {
        let phase = self
            .conversations
            .with_lock(conversation_id, |conv| std::future::ready(conv.phase_machine.current()))
            .await
            .unwrap_or(Phase::Chat);

        let mut messages = vec![
            ChatMessage::system(agent.instructions.clone()),
            ChatMessage::system(phase_prelude(phase)),
        ];

        let history = self
            .conversations
            .with_lock(conversation_id, |conv| std::future::ready(conv.history.clone()))
            .await
            .unwrap_or_default();

        for event in history.iter().rev().skip(1).rev() {
            let role_is_agent = event.author == agent.pubkey;
            messages.push(if role_is_agent {
                ChatMessage::assistant(event.content.clone())
            } else {
                ChatMessage::user(event.content.clone())
            });
        }

        messages = trim_to_budget(messages, self.limits.llm_context_budget_tokens);
        messages.push(ChatMessage::user(triggering_event.content.clone()));
        messages
    }

    /// `spec.md` §4.6 failure semantics: up to 3 attempts, backoff
    /// 200ms/800ms/3.2s, for retryable LLM errors.
    async fn call_llm_with_retry(
        &self,
        messages: &[ChatMessage],
    ) -> EngineResult<crate::conclave::llm::ChatCompletion> {
        let mut last_err = None;
        for backoff in self.limits.retry_backoff {
            match self.llm.complete(messages).await {
                Ok(completion) => return Ok(completion),
                Err(EngineError::LlmErrorRetryable(reason)) => {
                    last_err = Some(EngineError::LlmErrorRetryable(reason));
                    tokio::time::sleep(backoff).await;
                }
                Err(other) => return Err(other),
            }
        }
        Err(last_err.unwrap_or_else(|| EngineError::LlmErrorFatal("retries exhausted".to_string())))
    }

    async fn publish_reply(
        &self,
        conversation_id: &str,
        agent: &Agent,
        triggering_event: &Event,
        content: String,
    ) -> EngineResult<()> {
        let task_id = triggering_event
            .tags
            .iter()
            .find(|t| t.len() >= 4 && t[0] == "e" && t.get(3).map(String::as_str) == Some("task"))
            .and_then(|t| t.get(1).cloned());

        let previous_event_id = if let Some(task_id) = &task_id {
            self.conversations
                .with_lock(conversation_id, |conv| {
                    let id = conv.most_recent_event_for_task(task_id).map(|e| e.id.clone());
                    std::future::ready(id)
                })
                .await
                .flatten()
        } else {
            None
        };

        let mut tags = vec![self.e_tag(conversation_id)];
        if let Some(task_id) = &task_id {
            tags.push(vec!["e".to_string(), task_id.clone(), String::new(), "task".to_string()]);
        }
        if let Some(previous) = previous_event_id {
            tags.push(vec!["e".to_string(), previous]);
        }

        let ack = self
            .publish(agent, EventKind::ThreadReply, content.clone(), tags.clone())
            .await?;

        let reply_event = Event {
            id: ack.event_id,
            author: agent.pubkey,
            kind: EventKind::ThreadReply,
            content,
            tags,
            timestamp: chrono::Utc::now(),
            received_at: None,
        };
        self.conversations
            .with_lock(conversation_id, |conv| {
                conv.append(reply_event);
                std::future::ready(())
            })
            .await;
        Ok(())
    }

    fn e_tag(&self, conversation_id: &str) -> Tag {
        vec!["e".to_string(), conversation_id.to_string()]
    }

    async fn publish(
        &self,
        agent: &Agent,
        kind: EventKind,
        content: String,
        tags: Vec<Tag>,
    ) -> EngineResult<crate::conclave::event::PublishAck> {
        self.bus.publish(agent.pubkey, kind, content, tags).await
    }

    async fn set_active_turn(&self, conversation_id: &str, state: ActiveTurn) {
        self.conversations
            .with_lock(conversation_id, |conv| {
                conv.active_turn = state;
                if state == ActiveTurn::Running {
                    conv.turn_seq += 1;
                }
                std::future::ready(())
            })
            .await;
    }

    async fn turn_seq(&self, conversation_id: &str) -> u64 {
        self.conversations
            .with_lock(conversation_id, |conv| std::future::ready(conv.turn_seq))
            .await
            .unwrap_or(0)
    }
}
