use std::sync::Arc;

use crate::clock::{Clock, SystemClock};
use crate::confidence::ConfidenceEngine;
use crate::config::{BackendKind, FactlineConfig};
use crate::episode::EpisodeRecorder;
use crate::error::Result;
use crate::events::{EventBus, FactEvent};
use crate::facts::FactStore;
use crate::models::{Fact, FactInput};
use crate::query::TemporalQueryEngine;
use crate::resolver::{EntityResolver, Normalizer};
use crate::store::{MemoryStore, PgStore, RetryPolicy, TemporalStore};

/// The five components wired over one backend, one clock and one event bus.
/// Cheap to clone; clones share everything.
#[derive(Clone)]
pub struct TemporalMemory {
    store: Arc<dyn TemporalStore>,
    clock: Arc<dyn Clock>,
    events: EventBus,
    resolver: EntityResolver,
    facts: FactStore,
    query: TemporalQueryEngine,
    episodes: EpisodeRecorder,
}

impl TemporalMemory {
    pub fn new(
        store: Arc<dyn TemporalStore>,
        clock: Arc<dyn Clock>,
        config: &FactlineConfig,
    ) -> Result<Self> {
        config.validate()?;
        let retry = RetryPolicy::from(&config.storage);
        let events = EventBus::new(config.events.capacity);

        let resolver = EntityResolver::new(
            store.clone(),
            clock.clone(),
            retry,
            Normalizer::new(&config.resolver.synonyms),
            events.clone(),
        );
        let facts = FactStore::new(
            store.clone(),
            resolver.clone(),
            clock.clone(),
            retry,
            events.clone(),
        );
        let query = TemporalQueryEngine::new(
            facts.clone(),
            resolver.clone(),
            ConfidenceEngine::from(&config.confidence),
            clock.clone(),
            &config.query,
        );
        let episodes = EpisodeRecorder::new(
            store.clone(),
            facts.clone(),
            resolver.clone(),
            clock.clone(),
            retry,
            events.clone(),
        );

        Ok(Self {
            store,
            clock,
            events,
            resolver,
            facts,
            query,
            episodes,
        })
    }

    /// Build the backend named by `storage.backend` on the system clock.
    pub async fn from_config(config: &FactlineConfig) -> Result<Self> {
        let store: Arc<dyn TemporalStore> = match config.storage.backend {
            BackendKind::Postgres => Arc::new(PgStore::connect(&config.database).await?),
            BackendKind::Memory => Arc::new(MemoryStore::new()),
        };
        tracing::info!(backend = ?config.storage.backend, "storage backend ready");
        Self::new(store, Arc::new(SystemClock), config)
    }

    pub fn in_memory(clock: Arc<dyn Clock>, config: &FactlineConfig) -> Result<Self> {
        Self::new(Arc::new(MemoryStore::new()), clock, config)
    }

    pub fn resolver(&self) -> &EntityResolver {
        &self.resolver
    }

    pub fn facts(&self) -> &FactStore {
        &self.facts
    }

    pub fn query(&self) -> &TemporalQueryEngine {
        &self.query
    }

    pub fn episodes(&self) -> &EpisodeRecorder {
        &self.episodes
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<FactEvent> {
        self.events.subscribe()
    }

    /// Resolve names and append outside of any episode.
    pub async fn append(&self, input: FactInput) -> Result<Fact> {
        let new_fact = self.resolver.resolve_input(input, None).await?;
        self.facts.append_fact(new_fact).await
    }

    pub async fn supersede(&self, old_id: uuid::Uuid, input: FactInput) -> Result<Fact> {
        let new_fact = self.resolver.resolve_input(input, None).await?;
        self.facts.supersede_fact(old_id, new_fact).await
    }

    pub async fn health(&self) -> Result<String> {
        self.store.health().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::models::EntityKind;
    use chrono::{TimeZone, Utc};

    #[tokio::test]
    async fn test_writes_publish_events_in_order() {
        let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2024, 1, 2, 0, 0, 0).unwrap()));
        let memory = TemporalMemory::in_memory(clock, &FactlineConfig::in_memory()).unwrap();
        let mut rx = memory.subscribe();

        memory
            .append(FactInput {
                subject: "philip-aga".to_string(),
                subject_kind: EntityKind::Person,
                predicate: "works_at".to_string(),
                object: "ck-delta".to_string(),
                object_kind: EntityKind::Company,
                confidence: 0.9,
                valid_from: None,
                source: "test".to_string(),
                recorded_by: None,
            })
            .await
            .unwrap();

        let names: Vec<&str> = (0..3).map(|_| rx.try_recv().unwrap().name()).collect();
        assert_eq!(names, vec!["entity_created", "entity_created", "fact_appended"]);
    }

    #[tokio::test]
    async fn test_invalid_config_is_rejected() {
        let mut config = FactlineConfig::in_memory();
        config.query.threshold = 1.5;
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let err = TemporalMemory::in_memory(clock, &config).err().unwrap();
        assert_eq!(err.kind(), "internal");
    }

    #[tokio::test]
    async fn test_health_reports_backend() {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let memory = TemporalMemory::in_memory(clock, &FactlineConfig::in_memory()).unwrap();
        assert!(memory.health().await.unwrap().starts_with("in-memory"));
    }
}
