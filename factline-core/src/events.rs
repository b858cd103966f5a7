use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::models::EntityKind;

/// Change notifications, published once the corresponding write has
/// committed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum FactEvent {
    FactAppended {
        fact_id: Uuid,
        subject_id: Uuid,
        predicate: String,
        object_id: Uuid,
        episode_id: Option<Uuid>,
    },
    FactSuperseded {
        old_fact_id: Uuid,
        new_fact_id: Uuid,
        at: DateTime<Utc>,
    },
    EntityCreated {
        entity_id: Uuid,
        name: String,
        kind: EntityKind,
    },
    EntitiesMerged {
        keep_id: Uuid,
        merged_id: Uuid,
    },
    EpisodeOpened {
        episode_id: Uuid,
        source: String,
    },
    EpisodeClosed {
        episode_id: Uuid,
        fact_count: usize,
    },
    EpisodeRetracted {
        episode_id: Uuid,
        fact_ids: Vec<Uuid>,
    },
}

impl FactEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::FactAppended { .. } => "fact_appended",
            Self::FactSuperseded { .. } => "fact_superseded",
            Self::EntityCreated { .. } => "entity_created",
            Self::EntitiesMerged { .. } => "entities_merged",
            Self::EpisodeOpened { .. } => "episode_opened",
            Self::EpisodeClosed { .. } => "episode_closed",
            Self::EpisodeRetracted { .. } => "episode_retracted",
        }
    }
}

/// Fan-out of [`FactEvent`]s. Slow subscribers lose the oldest events
/// rather than holding up writers.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<FactEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn publish(&self, event: FactEvent) {
        tracing::trace!(event = event.name(), "publishing");
        // Err only means nobody is listening.
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<FactEvent> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_subscribers_receive_published_events() {
        let bus = EventBus::new(4);
        let mut rx = bus.subscribe();
        let id = Uuid::new_v4();
        bus.publish(FactEvent::EntitiesMerged {
            keep_id: id,
            merged_id: id,
        });
        let event = rx.recv().await.unwrap();
        assert_eq!(event.name(), "entities_merged");
    }

    #[test]
    fn test_publish_without_subscribers_is_ok() {
        let bus = EventBus::new(1);
        assert_eq!(bus.subscriber_count(), 0);
        bus.publish(FactEvent::EpisodeClosed {
            episode_id: Uuid::new_v4(),
            fact_count: 0,
        });
    }

    #[tokio::test]
    async fn test_lagging_subscriber_skips_ahead() {
        let bus = EventBus::new(2);
        let mut rx = bus.subscribe();
        for fact_count in 0..5 {
            bus.publish(FactEvent::EpisodeClosed {
                episode_id: Uuid::nil(),
                fact_count,
            });
        }
        assert!(matches!(
            rx.recv().await,
            Err(broadcast::error::RecvError::Lagged(3))
        ));
        match rx.recv().await.unwrap() {
            FactEvent::EpisodeClosed { fact_count, .. } => assert_eq!(fact_count, 3),
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn test_event_serializes_with_tag() {
        let json = serde_json::to_value(FactEvent::EpisodeOpened {
            episode_id: Uuid::nil(),
            source: "chat".to_string(),
        })
        .unwrap();
        assert_eq!(json["event"], "episode_opened");
        assert_eq!(json["source"], "chat");
    }
}
