//! Agent identity and the registry that owns the set of agents for a run.

use std::collections::HashMap;
use std::fmt;
use std::sync::RwLock;

use crate::conclave::error::{EngineError, EngineResult};
use crate::conclave::event::{EventBus, EventKind};

/// A stable 32-byte public key identifying an agent. Signing/verification
/// is delegated to the transport (`spec.md` §4.1); the core only ever
/// compares, stores, and tags with this value.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct PubKey([u8; 32]);

impl PubKey {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Lowercase hex encoding, the form used in tags and logs.
    pub fn to_hex(&self) -> String {
        self.0.iter().map(|b| format!("{:02x}", b)).collect()
    }

    /// Derives a pubkey deterministically from a slug, for built-in agents
    /// whose definition is synthesized rather than loaded (`spec.md` §4.2).
    /// Not a real signing key — a stand-in the AgentRegistry uses so a
    /// built-in agent has a stable identifier across restarts without a
    /// key-management dependency.
    pub fn derive_from_slug(slug: &str) -> Self {
        use sha2::{Digest, Sha256};
        let mut hasher = Sha256::new();
        hasher.update(slug.as_bytes());
        let digest = hasher.finalize();
        let mut bytes = [0u8; 32];
        bytes.copy_from_slice(&digest[..32]);
        Self(bytes)
    }
}

impl fmt::Debug for PubKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PubKey({})", &self.to_hex()[..8])
    }
}

impl fmt::Display for PubKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

/// An agent's name-resolvable tool permissions.
pub type ToolAllowList = Vec<String>;

/// A persistent agent identity, immutable for the life of a run
/// (`spec.md` §3).
#[derive(Debug, Clone)]
pub struct Agent {
    pub pubkey: PubKey,
    pub slug: String,
    pub role: String,
    pub instructions: String,
    pub tool_allow_list: ToolAllowList,
    pub llm_preset: Option<String>,
    pub is_built_in: bool,
    pub is_orchestrator: bool,
}

impl Agent {
    pub fn new(slug: impl Into<String>, pubkey: PubKey) -> Self {
        Self {
            pubkey,
            slug: slug.into(),
            role: String::new(),
            instructions: String::new(),
            tool_allow_list: Vec::new(),
            llm_preset: None,
            is_built_in: false,
            is_orchestrator: false,
        }
    }

    pub fn with_role(mut self, role: impl Into<String>) -> Self {
        self.role = role.into();
        self
    }

    pub fn with_instructions(mut self, instructions: impl Into<String>) -> Self {
        self.instructions = instructions.into();
        self
    }

    pub fn with_tool_allow_list(mut self, tools: ToolAllowList) -> Self {
        self.tool_allow_list = tools;
        self
    }

    pub fn with_llm_preset(mut self, preset: impl Into<String>) -> Self {
        self.llm_preset = Some(preset.into());
        self
    }

    pub fn as_built_in(mut self) -> Self {
        self.is_built_in = true;
        self
    }

    pub fn as_orchestrator(mut self) -> Self {
        self.is_orchestrator = true;
        self
    }

    pub fn can_use_tool(&self, tool_name: &str) -> bool {
        self.tool_allow_list.iter().any(|t| t == tool_name)
    }
}

/// Owns the set of agents (built-in + project-defined) for a process
/// lifetime (`spec.md` §4.2).
///
/// Guarantees: each call to [`bySlug`](AgentRegistry::by_slug) returns the
/// same [`Agent`] for the process lifetime; identities are generated at
/// most once per slug.
pub struct AgentRegistry {
    by_slug: RwLock<HashMap<String, Agent>>,
    orchestrator_slug: RwLock<Option<String>>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self {
            by_slug: RwLock::new(HashMap::new()),
            orchestrator_slug: RwLock::new(None),
        }
    }

    /// Registers an agent, synthesizing identity-stable registration for
    /// built-ins (`spec.md` §4.2: "for every built-in agent whose
    /// definition is missing, synthesizes a definition from compiled-in
    /// defaults"). Project-defined agents are expected to already carry a
    /// resolved `pubkey` (loaded by ConfigService).
    pub fn register(&self, agent: Agent) {
        if agent.is_orchestrator {
            *self.orchestrator_slug.write().unwrap() = Some(agent.slug.clone());
        }
        self.by_slug.write().unwrap().insert(agent.slug.clone(), agent);
    }

    /// Registers a built-in agent whose pubkey is derived deterministically
    /// from its slug if not already present — satisfies "identities are
    /// generated at most once per slug and are stable across restarts"
    /// without requiring a key-management dependency in this crate.
    pub fn register_built_in(&self, slug: &str, role: &str, instructions: &str, tools: ToolAllowList) {
        let pubkey = PubKey::derive_from_slug(slug);
        let agent = Agent::new(slug, pubkey)
            .with_role(role)
            .with_instructions(instructions)
            .with_tool_allow_list(tools)
            .as_built_in();
        self.register(agent);
    }

    pub fn by_id(&self, pubkey: PubKey) -> Option<Agent> {
        self.by_slug
            .read()
            .unwrap()
            .values()
            .find(|a| a.pubkey == pubkey)
            .cloned()
    }

    pub fn by_slug(&self, slug: &str) -> Option<Agent> {
        self.by_slug.read().unwrap().get(slug).cloned()
    }

    pub fn orchestrator(&self) -> EngineResult<Agent> {
        let slug = self.orchestrator_slug.read().unwrap().clone();
        match slug.and_then(|s| self.by_slug(&s)) {
            Some(agent) => Ok(agent),
            None => Err(EngineError::ConfigError(
                "no orchestrator agent registered".to_string(),
            )),
        }
    }

    pub fn all(&self) -> Vec<Agent> {
        self.by_slug.read().unwrap().values().cloned().collect()
    }

    /// `spec.md` §4.2 `republishProfiles()`: re-publishes every registered
    /// agent's profile (kind 0, `spec.md` §6) onto the bus, e.g. after a
    /// restart so late-subscribing clients can rediscover the team. Returns
    /// the number of profiles published; the first publish failure is
    /// surfaced rather than silently dropping the rest.
    pub async fn republish_profiles(&self, bus: &dyn EventBus) -> EngineResult<usize> {
        let agents = self.all();
        for agent in &agents {
            let profile = serde_json::json!({
                "slug": agent.slug,
                "role": agent.role,
                "instructions": agent.instructions,
                "isOrchestrator": agent.is_orchestrator,
            });
            bus.publish(agent.pubkey, EventKind::AgentProfile, profile.to_string(), vec![])
                .await
                .map_err(|err| EngineError::ConfigError(format!("republish_profiles: {err}")))?;
        }
        Ok(agents.len())
    }

    /// Refuses to remove built-ins, per `spec.md` §4.2.
    pub fn remove_by_slug(&self, slug: &str) -> bool {
        let mut map = self.by_slug.write().unwrap();
        match map.get(slug) {
            Some(agent) if agent.is_built_in => false,
            Some(_) => {
                map.remove(slug);
                true
            }
            None => false,
        }
    }
}

impl Default for AgentRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn by_slug_is_stable_across_calls() {
        let registry = AgentRegistry::new();
        registry.register_built_in("orchestrator", "lead", "you lead", vec!["publish_status".into()]);
        let a = registry.by_slug("orchestrator").unwrap();
        let b = registry.by_slug("orchestrator").unwrap();
        assert_eq!(a.pubkey, b.pubkey);
    }

    #[test]
    fn built_in_agents_cannot_be_removed() {
        let registry = AgentRegistry::new();
        registry.register_built_in("orchestrator", "lead", "you lead", vec![]);
        assert!(!registry.remove_by_slug("orchestrator"));
        assert!(registry.by_slug("orchestrator").is_some());
    }

    #[test]
    fn project_defined_agents_can_be_removed() {
        let registry = AgentRegistry::new();
        let agent = Agent::new("helper", PubKey::derive_from_slug("helper"));
        registry.register(agent);
        assert!(registry.remove_by_slug("helper"));
        assert!(registry.by_slug("helper").is_none());
    }

    #[test]
    fn tool_allow_list_is_checked_by_name() {
        let agent = Agent::new("a", PubKey::derive_from_slug("a"))
            .with_tool_allow_list(vec!["publish_status".to_string()]);
        assert!(agent.can_use_tool("publish_status"));
        assert!(!agent.can_use_tool("spawn"));
    }

    #[tokio::test]
    async fn republish_profiles_publishes_one_event_per_agent() {
        use crate::conclave::event::InMemoryEventBus;

        let registry = AgentRegistry::new();
        registry.register_built_in("orchestrator", "lead", "lead the team", vec![]);
        registry.register(Agent::new("helper", PubKey::derive_from_slug("helper")));

        let bus = InMemoryEventBus::new();
        let count = registry.republish_profiles(&bus).await.unwrap();
        assert_eq!(count, 2);
        assert_eq!(bus.published_of_kind(EventKind::AgentProfile).len(), 2);
    }
}
