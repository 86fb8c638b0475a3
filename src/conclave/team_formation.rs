//! Team formation: scoring registered agents against a new conversation's
//! root content, picking a lead, and choosing an execution strategy.

use std::collections::HashMap;
use std::sync::RwLock;

use sha2::{Digest, Sha256};

use crate::conclave::agent::{Agent, AgentRegistry};
use crate::conclave::execution_logger::{ExecutionLogRecord, ExecutionLogger};

/// Execution strategy chosen for a conversation (`spec.md` §4.11).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    SingleResponder,
    Hierarchical,
    Parallel,
}

/// The team assigned to a conversation.
#[derive(Debug, Clone)]
pub struct Team {
    pub lead_slug: String,
    pub member_slugs: Vec<String>,
    pub strategy: Strategy,
}

/// A per-agent score produced by the classifier, paired with whether the
/// agent is marked independent (eligible for `Parallel`).
#[derive(Debug, Clone)]
pub struct AgentScore {
    pub slug: String,
    pub score: f32,
    pub independent: bool,
}

/// Injectable scoring function, per `spec.md` §9 Design Note ("Team
/// formation determinism": "tests inject a scoring function"). The default
/// production implementation would prompt the orchestrator's LLM; tests use
/// a deterministic closure instead.
pub type ScoringFn = Box<dyn Fn(&str, &[Agent]) -> Vec<AgentScore> + Send + Sync>;

fn content_hash(content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    hasher
        .finalize()
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect()
}

fn agent_set_hash(agents: &[Agent]) -> String {
    let mut slugs: Vec<&str> = agents.iter().map(|a| a.slug.as_str()).collect();
    slugs.sort_unstable();
    content_hash(&slugs.join(","))
}

/// Scores agents and forms a team. Caches results for the life of the
/// conversation keyed by (root-event-content-hash, agent-set-hash), per the
/// Design Note — scoring via an LLM is non-deterministic, so repeat calls
/// for the same conversation must not re-score.
pub struct TeamFormation {
    scoring_fn: ScoringFn,
    cache: RwLock<HashMap<(String, String), Team>>,
}

impl TeamFormation {
    pub fn new(scoring_fn: ScoringFn) -> Self {
        Self {
            scoring_fn,
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// `spec.md` §4.11: score, pick a lead by highest score, pick a
    /// strategy, and log an `agent_decision` record with the reasoning and
    /// alternatives.
    pub fn form_team(
        &self,
        registry: &AgentRegistry,
        root_content: &str,
        logger: &ExecutionLogger,
    ) -> Team {
        let agents = registry.all();
        let key = (content_hash(root_content), agent_set_hash(&agents));

        if let Some(team) = self.cache.read().unwrap().get(&key) {
            return team.clone();
        }

        let mut scores = (self.scoring_fn)(root_content, &agents);
        scores.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap());

        let team = match scores.as_slice() {
            [] => Team {
                lead_slug: registry
                    .orchestrator()
                    .map(|a| a.slug)
                    .unwrap_or_default(),
                member_slugs: Vec::new(),
                strategy: Strategy::SingleResponder,
            },
            [only] => Team {
                lead_slug: only.slug.clone(),
                member_slugs: vec![only.slug.clone()],
                strategy: Strategy::SingleResponder,
            },
            [lead, rest @ ..] => {
                let supports: Vec<&AgentScore> =
                    rest.iter().filter(|s| lead.score - s.score > 0.15).collect();
                let near_tied_independent = rest
                    .first()
                    .map(|second| {
                        (lead.score - second.score).abs() <= 0.05
                            && lead.independent
                            && second.independent
                    })
                    .unwrap_or(false);

                let strategy = if near_tied_independent {
                    Strategy::Parallel
                } else if supports.len() >= 2 {
                    Strategy::Hierarchical
                } else {
                    Strategy::SingleResponder
                };

                Team {
                    lead_slug: lead.slug.clone(),
                    member_slugs: scores.iter().map(|s| s.slug.clone()).collect(),
                    strategy,
                }
            }
        };

        logger.log(ExecutionLogRecord::AgentDecision {
            agent_slug: team.lead_slug.clone(),
            decision: format!("selected strategy {:?}", team.strategy),
            reasoning: "highest-scoring agent became lead; strategy chosen from score spread"
                .to_string(),
            alternatives: scores.iter().map(|s| s.slug.clone()).collect(),
        });

        self.cache.write().unwrap().insert(key, team.clone());
        team
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conclave::agent::PubKey;

    fn registry_with(slugs: &[&str]) -> AgentRegistry {
        let registry = AgentRegistry::new();
        for slug in slugs {
            registry.register(Agent::new(*slug, PubKey::derive_from_slug(slug)));
        }
        registry.register_built_in("orchestrator", "lead", "lead", vec![]);
        registry
    }

    #[test]
    fn single_dominant_agent_yields_single_responder() {
        let registry = registry_with(&["alice"]);
        let logger = ExecutionLogger::new();
        let tf = TeamFormation::new(Box::new(|_content, agents| {
            agents
                .iter()
                .map(|a| AgentScore {
                    slug: a.slug.clone(),
                    score: if a.slug == "alice" { 0.9 } else { 0.1 },
                    independent: false,
                })
                .collect()
        }));
        let team = tf.form_team(&registry, "build a thing", &logger);
        assert_eq!(team.lead_slug, "alice");
        assert_eq!(team.strategy, Strategy::SingleResponder);
    }

    #[test]
    fn near_tied_independent_agents_yield_parallel() {
        let registry = registry_with(&["alice", "bob"]);
        let logger = ExecutionLogger::new();
        let tf = TeamFormation::new(Box::new(|_content, agents| {
            agents
                .iter()
                .filter(|a| a.slug != "orchestrator")
                .map(|a| AgentScore {
                    slug: a.slug.clone(),
                    score: 0.5,
                    independent: true,
                })
                .collect()
        }));
        let team = tf.form_team(&registry, "build a thing", &logger);
        assert_eq!(team.strategy, Strategy::Parallel);
    }

    #[test]
    fn repeated_calls_for_same_content_and_agents_are_cached() {
        let registry = registry_with(&["alice"]);
        let logger = ExecutionLogger::new();
        let calls = std::sync::Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let calls2 = calls.clone();
        let tf = TeamFormation::new(Box::new(move |_content, agents| {
            calls2.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            agents
                .iter()
                .map(|a| AgentScore {
                    slug: a.slug.clone(),
                    score: 1.0,
                    independent: false,
                })
                .collect()
        }));
        tf.form_team(&registry, "same content", &logger);
        tf.form_team(&registry, "same content", &logger);
        assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 1);
    }
}
