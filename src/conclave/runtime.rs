//! The explicit `Runtime` struct (`spec.md` §9 Design Note "Global state"):
//! every component is owned here and passed in, rather than reached
//! through module-scoped singletons. Tests construct a `Runtime` with
//! mocks by calling [`Runtime::new`] directly with test doubles.

use std::sync::Arc;

use crate::conclave::agent::AgentRegistry;
use crate::conclave::config::ConfigService;
use crate::conclave::conversation::ConversationStore;
use crate::conclave::error::EngineResult;
use crate::conclave::event::{Event, EventBus};
use crate::conclave::execution_logger::ExecutionLogger;
use crate::conclave::llm::LlmClient;
use crate::conclave::reflection::ReflectionSystem;
use crate::conclave::router::{Router, TurnRequest};
use crate::conclave::supervisor::Supervisor;
use crate::conclave::team_formation::TeamFormation;
use crate::conclave::tool_dispatcher::ToolDispatcher;
use crate::conclave::turn_runner::TurnRunner;

/// Owns every long-lived component for one run.
pub struct Runtime {
    pub agents: Arc<AgentRegistry>,
    pub conversations: Arc<ConversationStore>,
    pub bus: Arc<dyn EventBus>,
    pub tools: Arc<ToolDispatcher>,
    pub supervisor: Arc<Supervisor>,
    pub reflection: Arc<ReflectionSystem>,
    pub logger: Arc<ExecutionLogger>,
    pub team_formation: Arc<TeamFormation>,
    pub router: Arc<Router>,
    pub turn_runner: Arc<TurnRunner>,
}

impl Runtime {
    /// Assembles a Runtime from already-constructed components. Production
    /// call sites build each component from [`ConfigService`] output; tests
    /// build them directly from mocks (`spec.md` §9: "Tests construct a
    /// Runtime with mocks").
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        agents: Arc<AgentRegistry>,
        conversations: Arc<ConversationStore>,
        bus: Arc<dyn EventBus>,
        tools: Arc<ToolDispatcher>,
        supervisor: Arc<Supervisor>,
        logger: Arc<ExecutionLogger>,
        team_formation: Arc<TeamFormation>,
        llm: Arc<dyn LlmClient>,
    ) -> Self {
        let reflection = Arc::new(ReflectionSystem::new(bus.clone()));
        let router = Arc::new(Router::new(
            conversations.clone(),
            agents.clone(),
            team_formation.clone(),
            logger.clone(),
        ));
        let turn_runner = Arc::new(TurnRunner::new(
            conversations.clone(),
            agents.clone(),
            bus.clone(),
            tools.clone(),
            llm,
            logger.clone(),
            supervisor.clone(),
            reflection.clone(),
        ));

        Self {
            agents,
            conversations,
            bus,
            tools,
            supervisor,
            reflection,
            logger,
            team_formation,
            router,
            turn_runner,
        }
    }

    /// Drives one inbound event end to end: route it, then run a turn for
    /// every agent it addresses, in the router's stable order
    /// (`spec.md` §4.4 step 5 + §4.6).
    pub async fn handle_inbound_event(&self, event: Event) -> EngineResult<()> {
        let requests: Vec<TurnRequest> = self.router.route(event.clone()).await?;
        for request in requests {
            self.turn_runner
                .run_turn(&request.conversation_id, &request.agent_slug, &event)
                .await?;
        }
        Ok(())
    }

    /// Loads configuration and registers every agent it describes, fatal on
    /// any error per `spec.md` §6/§7.
    pub async fn load_agents_from_config(
        agents: &AgentRegistry,
        config: &ConfigService,
    ) -> EngineResult<()> {
        for identity in &config.agent_identities {
            let pubkey = ConfigService::parse_pubkey(&identity.pubkey_hex)?;
            let Some(definition) = config.agent_definitions.get(&identity.slug) else {
                continue;
            };
            let mut agent = crate::conclave::agent::Agent::new(identity.slug.clone(), pubkey)
                .with_role(definition.role.clone())
                .with_instructions(definition.instructions.clone())
                .with_tool_allow_list(definition.tool_allow_list.clone());
            if let Some(preset) = &definition.llm_preset {
                agent = agent.with_llm_preset(preset.clone());
            }
            if identity.is_orchestrator {
                agent = agent.as_orchestrator();
            }
            agents.register(agent);
        }
        Ok(())
    }
}
