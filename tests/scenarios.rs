//! End-to-end scenarios against a fully assembled `Runtime`, exercising the
//! Router -> TurnRunner -> EventBus path together rather than one component
//! in isolation.

use std::sync::Arc;

use chrono::Utc;
use conclave::{Agent, AgentRegistry, ConversationStore, EventBus, EventKind, PubKey, Runtime};
use conclave::conclave::event::{Event, InMemoryEventBus};
use conclave::conclave::execution_logger::ExecutionLogger;
use conclave::conclave::llm::ScriptedLlmClient;
use conclave::conclave::supervisor::Supervisor;
use conclave::conclave::team_formation::{AgentScore, TeamFormation};
use conclave::conclave::tool_dispatcher::ToolDispatcher;

fn chat_root(id: &str, content: &str) -> Event {
    Event {
        id: id.to_string(),
        author: PubKey::derive_from_slug("user"),
        kind: EventKind::ChatMessage,
        content: content.to_string(),
        tags: vec![],
        timestamp: Utc::now(),
        received_at: None,
    }
}

fn single_agent_team_formation() -> Arc<TeamFormation> {
    Arc::new(TeamFormation::new(Box::new(|_content, agents| {
        agents
            .iter()
            .map(|a| AgentScore {
                slug: a.slug.clone(),
                score: 1.0,
                independent: false,
            })
            .collect()
    })))
}

#[tokio::test]
async fn scenario_a_minimal_chat_round_trip_through_runtime() {
    let agents = Arc::new(AgentRegistry::new());
    agents.register(
        Agent::new("orchestrator", PubKey::derive_from_slug("orchestrator"))
            .as_orchestrator()
            .with_instructions("You lead the team."),
    );
    let bus: Arc<dyn EventBus> = Arc::new(InMemoryEventBus::new());
    let conversations = Arc::new(ConversationStore::new());
    let tools = Arc::new(ToolDispatcher::new(agents.clone()));
    let supervisor = Arc::new(Supervisor::new());
    let logger = Arc::new(ExecutionLogger::new());
    let team_formation = single_agent_team_formation();
    let llm = Arc::new(ScriptedLlmClient::new(
        "test-model",
        vec!["Hi, what shall we build?".to_string()],
    ));

    let runtime = Runtime::new(
        agents,
        conversations.clone(),
        bus.clone(),
        tools,
        supervisor,
        logger,
        team_formation,
        llm,
    );

    let root = chat_root("root-e2e-1", "Hello");
    runtime.handle_inbound_event(root).await.unwrap();

    let history_len = conversations
        .with_lock("root-e2e-1", |conv| std::future::ready(conv.history.len()))
        .await
        .unwrap();
    assert_eq!(history_len, 2);

    let phase = conversations
        .with_lock("root-e2e-1", |conv| std::future::ready(conv.phase_machine.current()))
        .await
        .unwrap();
    assert_eq!(phase.as_str(), "chat");
}

#[tokio::test]
async fn scenario_f_lesson_publication_is_tagged_correctly() {
    let bus = Arc::new(InMemoryEventBus::new());
    let reflection = conclave::conclave::reflection::ReflectionSystem::new(bus.clone());
    let agent_a = PubKey::derive_from_slug("agent-a");

    reflection
        .publish(conclave::conclave::reflection::Lesson {
            owning_agent: agent_a,
            title: "X".to_string(),
            body: "Y".to_string(),
            reference_event_id: Some("agent-a-definition".to_string()),
        })
        .await;

    let published = bus.published_of_kind(EventKind::AgentLesson);
    assert_eq!(published.len(), 1);
    assert_eq!(published[0].content, "Y");
    assert!(published[0].tags.contains(&vec!["title".to_string(), "X".to_string()]));
    assert!(published[0]
        .tags
        .contains(&vec!["e".to_string(), "agent-a-definition".to_string()]));
}

#[tokio::test]
async fn scenario_e_high_risk_rejection_through_runtime_supervisor() {
    use conclave::conclave::supervisor::{CheckpointStatus, RiskLevel, SupervisedTaskType};
    use std::time::Duration;

    let supervisor = Supervisor::new();
    let task_id = supervisor.start_task(
        "task-e2e-1",
        "conv-e2e-1",
        PubKey::derive_from_slug("agent-a"),
        "Generate code",
        SupervisedTaskType::CodeGeneration,
        RiskLevel::High,
        Duration::from_secs(600),
    );

    supervisor.record_checkpoint(&task_id, "Testing", CheckpointStatus::Failed, None);
    let result = supervisor.complete_supervision(&task_id).unwrap();

    assert!(!result.passed);
    assert!(result.issues.iter().any(|i| i.contains("1 checkpoint(s) failed: Testing")));
}
