//! Inbound-event routing (`spec.md` §4.4): resolves a conversation, forms a
//! team if one doesn't exist yet, and decides which agents a turn should be
//! enqueued for.

use std::sync::Arc;

use crate::conclave::agent::AgentRegistry;
use crate::conclave::conversation::ConversationStore;
use crate::conclave::error::{EngineError, EngineResult};
use crate::conclave::event::Event;
use crate::conclave::execution_logger::{ExecutionLogRecord, ExecutionLogger};
use crate::conclave::team_formation::TeamFormation;

/// One agent a turn should be run for, in the stable order the spec
/// requires (`spec.md` §4.4 step 4: "stable ordering by agent slug").
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TurnRequest {
    pub conversation_id: String,
    pub agent_slug: String,
}

pub struct Router {
    conversations: Arc<ConversationStore>,
    agents: Arc<AgentRegistry>,
    team_formation: Arc<TeamFormation>,
    logger: Arc<ExecutionLogger>,
}

impl Router {
    pub fn new(
        conversations: Arc<ConversationStore>,
        agents: Arc<AgentRegistry>,
        team_formation: Arc<TeamFormation>,
        logger: Arc<ExecutionLogger>,
    ) -> Self {
        Self {
            conversations,
            agents,
            team_formation,
            logger,
        }
    }

    /// `spec.md` §4.4: the five-step routing algorithm run for every
    /// inbound event the adapter hands to the core.
    pub async fn route(&self, event: Event) -> EngineResult<Vec<TurnRequest>> {
        let conversation_id = event
            .conversation_root_tag()
            .map(str::to_string)
            .unwrap_or_else(|| event.id.clone());

        if self.conversations.is_tombstoned(&conversation_id).await {
            return Err(EngineError::TombstonedConversation(conversation_id));
        }

        let is_root = conversation_id == event.id;
        let root_event = if is_root {
            event.clone()
        } else if self.conversations.exists(&conversation_id).await {
            event.clone()
        } else {
            return Err(EngineError::UnknownConversation(conversation_id));
        };

        let created = self.conversations.get_or_create(&root_event).await.created;

        self.conversations
            .with_lock(&conversation_id, |conv| {
                conv.append(event.clone());
                std::future::ready(())
            })
            .await;

        if created {
            self.logger.log(ExecutionLogRecord::ConversationStart {
                conversation_id: conversation_id.clone(),
            });
        }

        // Step 3: address using whatever team already exists (none, for a
        // brand-new conversation) — team formation is step 4, after.
        let current_lead = self
            .conversations
            .with_lock(&conversation_id, |conv| {
                std::future::ready(conv.team.as_ref().map(|t| t.lead_slug.clone()))
            })
            .await
            .flatten();

        let addressed = self.addressed_agents(&event, current_lead.as_deref());

        self.logger.log(ExecutionLogRecord::RoutingAnalysis {
            conversation_id: conversation_id.clone(),
            candidates: addressed.clone(),
        });

        // Step 4: form the team if the conversation doesn't have one yet.
        let has_team = self
            .conversations
            .with_lock(&conversation_id, |conv| std::future::ready(conv.team.is_some()))
            .await
            .unwrap_or(false);

        if !has_team {
            let team = self
                .team_formation
                .form_team(&self.agents, &root_event.content, &self.logger);
            self.conversations
                .with_lock(&conversation_id, |conv| {
                    conv.team = Some(team);
                    std::future::ready(())
                })
                .await;
        }

        let mut requests: Vec<TurnRequest> = addressed
            .into_iter()
            .filter(|slug| self.agents.by_slug(slug).is_some())
            .map(|slug| TurnRequest {
                conversation_id: conversation_id.clone(),
                agent_slug: slug,
            })
            .collect();
        requests.sort_by(|a, b| a.agent_slug.cmp(&b.agent_slug));
        requests.dedup_by(|a, b| a.agent_slug == b.agent_slug);

        if requests.is_empty() {
            return Err(EngineError::NoAddressableAgents(conversation_id));
        }

        self.logger.log(ExecutionLogRecord::RoutingDecision {
            conversation_id,
            addressed: requests.iter().map(|r| r.agent_slug.clone()).collect(),
        });

        Ok(requests)
    }

    /// `spec.md` §4.4 step 3: (a) explicit mentions in `p`-tags; (b) absent
    /// any, the conversation's current lead; (c) absent a lead, the
    /// orchestrator.
    fn addressed_agents(&self, event: &Event, current_lead: Option<&str>) -> Vec<String> {
        let p_tags = event.addressed_pubkeys();
        if p_tags.is_empty() {
            if let Some(lead) = current_lead {
                if self.agents.by_slug(lead).is_some() {
                    return vec![lead.to_string()];
                }
            }
            return self
                .agents
                .orchestrator()
                .map(|a| vec![a.slug])
                .unwrap_or_default();
        }
        p_tags
            .into_iter()
            .filter_map(|pubkey_hex| {
                self.agents
                    .all()
                    .into_iter()
                    .find(|a| a.pubkey.to_hex() == pubkey_hex)
                    .map(|a| a.slug)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conclave::agent::{Agent, PubKey};
    use crate::conclave::event::EventKind;
    use chrono::Utc;

    fn router_with_orchestrator() -> Router {
        let agents = Arc::new(AgentRegistry::new());
        agents.register_built_in("orchestrator", "lead", "lead", vec![]);
        let mut orchestrator = agents.by_slug("orchestrator").unwrap();
        orchestrator.is_orchestrator = true;
        agents.register(orchestrator);

        let conversations = Arc::new(ConversationStore::new());
        let logger = Arc::new(ExecutionLogger::new());
        let team_formation = Arc::new(TeamFormation::new(Box::new(|_c, agents| {
            agents
                .iter()
                .map(|a| crate::conclave::team_formation::AgentScore {
                    slug: a.slug.clone(),
                    score: 1.0,
                    independent: false,
                })
                .collect()
        })));
        Router::new(conversations, agents, team_formation, logger)
    }

    fn chat_event(id: &str) -> Event {
        Event {
            id: id.to_string(),
            author: PubKey::derive_from_slug("user"),
            kind: EventKind::ChatMessage,
            content: "help me plan this".to_string(),
            tags: vec![],
            timestamp: Utc::now(),
            received_at: None,
        }
    }

    #[tokio::test]
    async fn root_event_with_no_p_tags_routes_to_orchestrator() {
        let router = router_with_orchestrator();
        let requests = router.route(chat_event("root-1")).await.unwrap();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].agent_slug, "orchestrator");
    }

    #[tokio::test]
    async fn follow_up_with_no_p_tags_routes_to_conversation_lead_not_orchestrator() {
        let agents = Arc::new(AgentRegistry::new());
        agents.register_built_in("orchestrator", "lead", "lead", vec![]);
        let mut orchestrator = agents.by_slug("orchestrator").unwrap();
        orchestrator.is_orchestrator = true;
        agents.register(orchestrator);
        agents.register(Agent::new("specialist", PubKey::derive_from_slug("specialist")));

        let conversations = Arc::new(ConversationStore::new());
        let logger = Arc::new(ExecutionLogger::new());
        let team_formation = Arc::new(TeamFormation::new(Box::new(|_c, agents| {
            agents
                .iter()
                .map(|a| crate::conclave::team_formation::AgentScore {
                    slug: a.slug.clone(),
                    score: if a.slug == "specialist" { 0.9 } else { 0.1 },
                    independent: false,
                })
                .collect()
        })));
        let router = Router::new(conversations, agents, team_formation, logger);

        let root = router.route(chat_event("root-lead")).await.unwrap();
        assert_eq!(root[0].agent_slug, "specialist");

        let mut follow_up = chat_event("reply-lead");
        follow_up.tags = vec![vec!["e".to_string(), "root-lead".to_string()]];
        let requests = router.route(follow_up).await.unwrap();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].agent_slug, "specialist");
    }

    #[tokio::test]
    async fn unknown_non_root_conversation_is_rejected() {
        let router = router_with_orchestrator();
        let mut reply = chat_event("reply-1");
        reply.tags = vec![vec!["e".to_string(), "never-seen".to_string()]];
        let result = router.route(reply).await;
        assert!(matches!(result, Err(EngineError::UnknownConversation(_))));
    }

    #[tokio::test]
    async fn addressed_agent_not_in_registry_is_dropped() {
        let router = router_with_orchestrator();
        let mut event = chat_event("root-2");
        event.tags = vec![vec!["p".to_string(), "deadbeef".to_string()]];
        let result = router.route(event).await;
        assert!(matches!(result, Err(EngineError::NoAddressableAgents(_))));
    }
}
