//! The in-memory conversation store (`spec.md` §4.3), re-architected per
//! §9 Design Note ("Conversation store aliasing") as id-addressed access
//! through a store with per-id locks rather than long-lived references
//! held by many callers.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::Mutex as AsyncMutex;
use tokio::sync::RwLock as AsyncRwLock;

use crate::conclave::event::Event;
use crate::conclave::phase_machine::PhaseMachine;
use crate::conclave::team_formation::Team;

/// `spec.md` §3: Conversation `activeTurn`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActiveTurn {
    None,
    Running,
}

/// Bounded free-form metadata (`spec.md` §3: "free-form but bounded: last
/// task id, branch name, extracted requirements").
#[derive(Debug, Clone, Default)]
pub struct ConversationMetadata {
    pub last_task_id: Option<String>,
    pub branch_name: Option<String>,
    pub extracted_requirements: Option<String>,
}

/// A live conversation. The store exclusively owns instances of this type;
/// callers reach it only through [`ConversationStore::with_lock`].
pub struct Conversation {
    pub id: String,
    pub root_author: crate::conclave::agent::PubKey,
    pub created_at: DateTime<Utc>,
    pub history: Vec<Event>,
    pub phase_machine: PhaseMachine,
    pub team: Option<Team>,
    pub active_turn: ActiveTurn,
    pub milestone_ids: Vec<String>,
    pub metadata: ConversationMetadata,
    /// Monotonically increasing sequence number for this conversation's
    /// turns; used by `ExecutionLogRecord::ExecutionFlowStart/Complete`.
    pub turn_seq: u64,
}

impl Conversation {
    fn new(id: String, root_author: crate::conclave::agent::PubKey) -> Self {
        Self {
            id,
            root_author,
            created_at: Utc::now(),
            history: Vec::new(),
            phase_machine: PhaseMachine::new(),
            team: None,
            active_turn: ActiveTurn::None,
            milestone_ids: Vec::new(),
            metadata: ConversationMetadata::default(),
            turn_seq: 0,
        }
    }

    /// `spec.md` §3 invariant: "history is strictly append-only and
    /// monotone in timestamp."
    pub fn append(&mut self, event: Event) {
        debug_assert!(
            self.history.last().map(|e| e.timestamp <= event.timestamp).unwrap_or(true),
            "history must remain monotone in timestamp"
        );
        self.history.push(event);
    }

    /// Walks `history` backwards to find the most recent prior outbound
    /// event referencing the given task id — the "previous-event" link
    /// source of truth (`spec.md` §8 invariant 2).
    pub fn most_recent_event_for_task(&self, task_id: &str) -> Option<&Event> {
        self.history.iter().rev().find(|e| {
            e.tags
                .iter()
                .any(|t| t.len() >= 2 && t[0] == "e" && t[1] == task_id)
        })
    }
}

/// A handle returned by [`ConversationStore::get_or_create`], telling the
/// caller whether this call created the conversation.
pub struct GetOrCreateResult {
    pub id: String,
    pub created: bool,
}

/// In-memory mapping from conversation id to [`Conversation`]
/// (`spec.md` §4.3).
pub struct ConversationStore {
    entries: AsyncRwLock<HashMap<String, Arc<AsyncMutex<Conversation>>>>,
    tombstones: AsyncRwLock<HashSet<String>>,
    quiescence_interval: Duration,
}

impl ConversationStore {
    pub fn new() -> Self {
        Self {
            entries: AsyncRwLock::new(HashMap::new()),
            tombstones: AsyncRwLock::new(HashSet::new()),
            quiescence_interval: Duration::from_secs(600),
        }
    }

    pub fn with_quiescence_interval(mut self, interval: Duration) -> Self {
        self.quiescence_interval = interval;
        self
    }

    /// `spec.md` §4.3 `getOrCreate`: creation derives the conversation id
    /// from the root event id and seeds `phase = chat`, empty history,
    /// empty team.
    pub async fn get_or_create(&self, root_event: &Event) -> GetOrCreateResult {
        let id = root_event.id.clone();

        if let Some(existing) = self.entries.read().await.get(&id) {
            let _ = existing;
            return GetOrCreateResult { id, created: false };
        }

        let mut entries = self.entries.write().await;
        if entries.contains_key(&id) {
            return GetOrCreateResult { id, created: false };
        }
        let conversation = Conversation::new(id.clone(), root_event.author);
        entries.insert(id.clone(), Arc::new(AsyncMutex::new(conversation)));
        GetOrCreateResult { id, created: true }
    }

    pub async fn is_tombstoned(&self, id: &str) -> bool {
        self.tombstones.read().await.contains(id)
    }

    pub async fn exists(&self, id: &str) -> bool {
        self.entries.read().await.contains_key(id)
    }

    /// `spec.md` §4.3 `withLock`: runs `fn` with the conversation's
    /// exclusive lock held (§5 concurrency model). The lock is an async
    /// mutex, so the lock is naturally released across the `.await` points
    /// inside `f` between suspensions only when `f` itself yields — i.e.
    /// held for the full duration of one call, which matches §5: "while
    /// suspended inside a turn, the conversation's lock is held."
    pub async fn with_lock<F, Fut, T>(&self, id: &str, f: F) -> Option<T>
    where
        F: FnOnce(&mut Conversation) -> Fut,
        Fut: std::future::Future<Output = T>,
    {
        let handle = self.entries.read().await.get(id).cloned()?;
        let mut guard = handle.lock().await;
        Some(f(&mut guard).await)
    }

    /// Evicts a conversation `done` for at least the quiescence interval
    /// and tombstones its id so late-arriving events are dropped rather
    /// than resurrecting it (`spec.md` §4.3).
    pub async fn evict_if_quiescent(&self, id: &str, done_since: DateTime<Utc>) {
        let elapsed = Utc::now().signed_duration_since(done_since);
        if elapsed.to_std().unwrap_or_default() < self.quiescence_interval {
            return;
        }
        self.entries.write().await.remove(id);
        self.tombstones.write().await.insert(id.to_string());
    }
}

impl Default for ConversationStore {
    fn default() -> Self {
        Self::new()
    }
}
