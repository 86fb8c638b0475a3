//! The signed event bus boundary.
//!
//! The core treats events as opaque except for the tag contract in
//! `spec.md` §6. Signature verification, relay selection, and encoding all
//! live on the transport side; this module only defines the shape the core
//! needs and the [`EventBus`] trait the core calls through.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Mutex;

use crate::conclave::agent::PubKey;
use crate::conclave::error::{EngineError, EngineResult};

/// Numeric event kinds agreed with the bus (`spec.md` §6).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    ChatMessage,
    ThreadReply,
    StatusUpdate,
    TypingStart,
    TypingStop,
    ProjectStatus,
    AgentProfile,
    AgentLesson,
    AgentDefinition,
    Reaction,
    /// Any kind not covered by the named variants above, kept as its raw
    /// numeric value so the adapter never has to drop unrecognized events.
    Other(u32),
}

impl EventKind {
    /// Maps to the literal numeric kind from `spec.md` §6.
    pub fn as_u32(self) -> u32 {
        match self {
            EventKind::ChatMessage => 11,
            EventKind::ThreadReply => 1111,
            EventKind::StatusUpdate => 1,
            EventKind::TypingStart => 24111,
            EventKind::TypingStop => 24112,
            EventKind::ProjectStatus => 24010,
            EventKind::AgentProfile => 0,
            EventKind::AgentLesson => 4129,
            EventKind::AgentDefinition => 4199,
            EventKind::Reaction => 7,
            EventKind::Other(k) => k,
        }
    }

    pub fn from_u32(k: u32) -> Self {
        match k {
            11 => EventKind::ChatMessage,
            1111 => EventKind::ThreadReply,
            1 => EventKind::StatusUpdate,
            24111 => EventKind::TypingStart,
            24112 => EventKind::TypingStop,
            24010 => EventKind::ProjectStatus,
            0 => EventKind::AgentProfile,
            4129 => EventKind::AgentLesson,
            4199 => EventKind::AgentDefinition,
            7 => EventKind::Reaction,
            other => EventKind::Other(other),
        }
    }

    /// Kinds the EventBus adapter accepts from non-whitelisted authors
    /// (`spec.md` §4.1 step 2: "unless the event kind is explicitly
    /// public (status, lesson)").
    pub fn is_explicitly_public(self) -> bool {
        matches!(self, EventKind::StatusUpdate | EventKind::AgentLesson)
    }
}

/// An ordered tag tuple, e.g. `["e", taskId, "", "task"]`. The first element
/// is always the tag name.
pub type Tag = Vec<String>;

/// An event as the core sees it (`spec.md` §3). Opaque beyond the tag names
/// the core defines.
#[derive(Debug, Clone)]
pub struct Event {
    /// Content-derived id (a hash, per the transport's encoding).
    pub id: String,
    pub author: PubKey,
    pub kind: EventKind,
    pub content: String,
    pub tags: Vec<Tag>,
    pub timestamp: DateTime<Utc>,
    /// Set by the adapter on receipt (`spec.md` §4.1 step 3); `None` for
    /// events the core has not yet received over the bus (e.g. freshly
    /// built outbound events prior to publish).
    pub received_at: Option<DateTime<Utc>>,
}

impl Event {
    /// First `e`-tag with no marker is the conversation root
    /// (`spec.md` §6 "Conversation id extraction").
    pub fn conversation_root_tag(&self) -> Option<&str> {
        self.tags
            .iter()
            .find(|t| t.first().map(String::as_str) == Some("e") && t.len() <= 2)
            .and_then(|t| t.get(1))
            .map(String::as_str)
    }

    /// All `p`-tag entries, in order: addressed agents.
    pub fn addressed_pubkeys(&self) -> Vec<&str> {
        self.tags
            .iter()
            .filter(|t| t.first().map(String::as_str) == Some("p"))
            .filter_map(|t| t.get(1))
            .map(String::as_str)
            .collect()
    }

    /// The `previous-event` link for the same task chain, if present, via
    /// an unmarked `["e", previousEventId]` tag distinct from the root tag.
    /// The core writes this when publishing (`spec.md` §4.6 step 5,
    /// invariant 2 in §8); readers use it to walk the chain backwards.
    pub fn previous_event_tag(&self) -> Option<&str> {
        self.tags
            .iter()
            .filter(|t| t.first().map(String::as_str) == Some("e"))
            .filter(|t| t.len() == 2)
            .nth(1)
            .and_then(|t| t.get(1))
            .map(String::as_str)
    }
}

/// The result of a successful publish: the new event's id and the relays
/// that acknowledged it.
#[derive(Debug, Clone)]
pub struct PublishAck {
    pub event_id: String,
    pub acked_by: Vec<String>,
}

/// The adapter boundary the core calls through to subscribe and publish.
/// A real implementation wraps a relay pool and a signer; this trait is the
/// only thing the core depends on (`spec.md` §1 Non-goals: transport is an
/// external collaborator).
#[async_trait]
pub trait EventBus: Send + Sync {
    /// Publish an event under `author`'s identity. Returns
    /// [`EngineError::TransportUnavailable`] if no relay acknowledges
    /// within the publish timeout; the caller decides retry policy.
    async fn publish(
        &self,
        author: PubKey,
        kind: EventKind,
        content: String,
        tags: Vec<Tag>,
    ) -> EngineResult<PublishAck>;
}

/// An in-process test double: publishes are recorded in order and always
/// acknowledged by a single synthetic relay. Grounded in the teacher's
/// mock-`ClientWrapper` testing pattern used throughout its `tests/`
/// directory.
#[derive(Default)]
pub struct InMemoryEventBus {
    published: Mutex<Vec<Event>>,
    next_id: Mutex<u64>,
    /// When set, `publish` returns this error instead of recording/acking —
    /// used to exercise `transport_unavailable` handling in tests.
    pub fail_next: Mutex<Option<String>>,
}

impl InMemoryEventBus {
    pub fn new() -> Self {
        Self {
            published: Mutex::new(Vec::new()),
            next_id: Mutex::new(0),
            fail_next: Mutex::new(None),
        }
    }

    /// All events published so far, in publish order.
    pub fn published(&self) -> Vec<Event> {
        self.published.lock().unwrap().clone()
    }

    /// Convenience: events of a given kind, in order.
    pub fn published_of_kind(&self, kind: EventKind) -> Vec<Event> {
        self.published()
            .into_iter()
            .filter(|e| e.kind.as_u32() == kind.as_u32())
            .collect()
    }
}

#[async_trait]
impl EventBus for InMemoryEventBus {
    async fn publish(
        &self,
        author: PubKey,
        kind: EventKind,
        content: String,
        tags: Vec<Tag>,
    ) -> EngineResult<PublishAck> {
        if let Some(reason) = self.fail_next.lock().unwrap().take() {
            return Err(EngineError::TransportUnavailable(reason));
        }
        let mut next_id = self.next_id.lock().unwrap();
        let id = format!("evt-{}", *next_id);
        *next_id += 1;
        let event = Event {
            id: id.clone(),
            author,
            kind,
            content,
            tags,
            timestamp: Utc::now(),
            received_at: None,
        };
        self.published.lock().unwrap().push(event);
        Ok(PublishAck {
            event_id: id,
            acked_by: vec!["memory-relay".to_string()],
        })
    }
}

/// Helper used by the adapter at ingest time to build the whitelist check
/// (`spec.md` §4.1 step 2).
pub fn is_author_permitted(
    whitelist: &HashMap<PubKey, ()>,
    author: PubKey,
    kind: EventKind,
) -> bool {
    whitelist.contains_key(&author) || kind.is_explicitly_public()
}
