//! Lesson synthesis and publication (`spec.md` §4.9).

use std::sync::Arc;

use crate::conclave::agent::PubKey;
use crate::conclave::event::{EventBus, EventKind, Tag};

/// A published, immutable note attributed to an agent identity
/// (`spec.md` §3). Created by ReflectionSystem; never mutated once
/// published — the same append-only discipline the teacher applies to
/// `ThoughtChain` entries.
#[derive(Debug, Clone)]
pub struct Lesson {
    pub owning_agent: PubKey,
    pub title: String,
    pub body: String,
    pub reference_event_id: Option<String>,
}

/// Observes `record_lesson` tool invocations and publishes the resulting
/// Lesson onto the bus.
pub struct ReflectionSystem {
    bus: Arc<dyn EventBus>,
}

impl ReflectionSystem {
    pub fn new(bus: Arc<dyn EventBus>) -> Self {
        Self { bus }
    }

    /// `spec.md` §4.9: publish is fire-and-forget with one retry. Returns
    /// the published event id on success; logs (rather than propagates) a
    /// final failure, since lesson publication never blocks the turn that
    /// triggered it.
    pub async fn publish(&self, lesson: Lesson) -> Option<String> {
        let mut tags: Vec<Tag> = vec![vec!["title".to_string(), lesson.title.clone()]];
        if let Some(reference) = &lesson.reference_event_id {
            tags.push(vec!["e".to_string(), reference.clone()]);
        }

        for attempt in 0..2 {
            match self
                .bus
                .publish(lesson.owning_agent, EventKind::AgentLesson, lesson.body.clone(), tags.clone())
                .await
            {
                Ok(ack) => return Some(ack.event_id),
                Err(err) if attempt == 0 => {
                    log::warn!("lesson publish failed, retrying once: {err}");
                }
                Err(err) => {
                    log::error!("lesson publish failed after retry, dropping: {err}");
                    return None;
                }
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conclave::event::InMemoryEventBus;

    #[tokio::test]
    async fn publish_tags_title_and_reference_event() {
        let bus = Arc::new(InMemoryEventBus::new());
        let reflection = ReflectionSystem::new(bus.clone());
        let pubkey = PubKey::derive_from_slug("agent-a");

        reflection
            .publish(Lesson {
                owning_agent: pubkey,
                title: "X".to_string(),
                body: "Y".to_string(),
                reference_event_id: Some("definition-event-id".to_string()),
            })
            .await;

        let published = bus.published_of_kind(EventKind::AgentLesson);
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].content, "Y");
        assert!(published[0].tags.contains(&vec!["title".to_string(), "X".to_string()]));
        assert!(published[0]
            .tags
            .contains(&vec!["e".to_string(), "definition-event-id".to_string()]));
    }

    #[tokio::test]
    async fn publish_retries_once_then_gives_up() {
        let bus = Arc::new(InMemoryEventBus::new());
        *bus.fail_next.lock().unwrap() = Some("relay down".to_string());
        let reflection = ReflectionSystem::new(bus.clone());

        let result = reflection
            .publish(Lesson {
                owning_agent: PubKey::derive_from_slug("agent-a"),
                title: "X".to_string(),
                body: "Y".to_string(),
                reference_event_id: None,
            })
            .await;

        assert!(result.is_some());
        assert_eq!(bus.published_of_kind(EventKind::AgentLesson).len(), 1);
    }
}
