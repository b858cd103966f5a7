//! Episode Recorder: provenance grouping for facts from one ingestion event.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use uuid::Uuid;

use crate::clock::Clock;
use crate::error::{FactlineError, Result};
use crate::events::{EventBus, FactEvent};
use crate::facts::FactStore;
use crate::models::{Episode, Fact, FactInput};
use crate::resolver::EntityResolver;
use crate::store::{check_episode_open, RetryPolicy, TemporalStore};

#[derive(Clone)]
pub struct EpisodeRecorder {
    store: Arc<dyn TemporalStore>,
    facts: FactStore,
    resolver: EntityResolver,
    clock: Arc<dyn Clock>,
    retry: RetryPolicy,
    events: EventBus,
}

impl EpisodeRecorder {
    pub fn new(
        store: Arc<dyn TemporalStore>,
        facts: FactStore,
        resolver: EntityResolver,
        clock: Arc<dyn Clock>,
        retry: RetryPolicy,
        events: EventBus,
    ) -> Self {
        Self {
            store,
            facts,
            resolver,
            clock,
            retry,
            events,
        }
    }

    pub async fn begin_episode(
        &self,
        source: &str,
        occurred_at: DateTime<Utc>,
        recorded_by: Option<String>,
    ) -> Result<Uuid> {
        let now = self.clock.now();
        let source = source.trim();
        if source.is_empty() {
            return Err(FactlineError::validation("episode source must not be empty"));
        }
        if occurred_at > now {
            return Err(FactlineError::validation(format!(
                "episode occurred_at {} is in the future (now {})",
                occurred_at, now
            )));
        }

        let episode = Episode {
            id: Uuid::new_v4(),
            source: source.to_string(),
            occurred_at,
            recorded_by,
            created_at: now,
            closed_at: None,
            retracted_at: None,
            fact_ids: Vec::new(),
        };
        self.retry
            .run("insert_episode", || self.store.insert_episode(&episode))
            .await?;

        tracing::info!(episode_id = %episode.id, source, "episode opened");
        self.events.publish(FactEvent::EpisodeOpened {
            episode_id: episode.id,
            source: episode.source.clone(),
        });
        Ok(episode.id)
    }

    /// Fails fast before resolving names, so a closed episode leaves no new
    /// entities behind. The store repeats the check under lock.
    async fn ensure_open(&self, episode_id: Uuid) -> Result<()> {
        let closed_at = self
            .retry
            .run("get_episode", || self.store.get_episode(episode_id))
            .await?
            .map(|e| e.closed_at);
        check_episode_open(episode_id, closed_at)
    }

    pub async fn record_fact(&self, episode_id: Uuid, input: FactInput) -> Result<Fact> {
        self.ensure_open(episode_id).await?;
        let new_fact = self.resolver.resolve_input(input, Some(episode_id)).await?;
        self.facts.append_fact(new_fact).await
    }

    /// Supersede `old_fact_id` with a fact that belongs to this episode.
    pub async fn record_superseding(
        &self,
        episode_id: Uuid,
        old_fact_id: Uuid,
        input: FactInput,
    ) -> Result<Fact> {
        self.ensure_open(episode_id).await?;
        let new_fact = self.resolver.resolve_input(input, Some(episode_id)).await?;
        self.facts.supersede_fact(old_fact_id, new_fact).await
    }

    /// Freeze the episode's fact list. Closing twice is an error.
    pub async fn close_episode(&self, episode_id: Uuid) -> Result<Episode> {
        let now = self.clock.now();
        let episode = self
            .retry
            .run("close_episode", || self.store.close_episode(episode_id, now))
            .await?;

        tracing::info!(%episode_id, facts = episode.fact_ids.len(), "episode closed");
        self.events.publish(FactEvent::EpisodeClosed {
            episode_id,
            fact_count: episode.fact_ids.len(),
        });
        Ok(episode)
    }

    pub async fn episode(&self, episode_id: Uuid) -> Result<Episode> {
        self.retry
            .run("get_episode", || self.store.get_episode(episode_id))
            .await?
            .ok_or(FactlineError::NotFound { kind: "episode", id: episode_id })
    }

    /// End the validity of every still-open fact the episode recorded and
    /// mark the episode retracted, closing it if it was open. Its facts no
    /// longer corroborate later observations at any point in time. Facts the
    /// episode superseded are not restored; callers re-assert them.
    /// Works on open and closed episodes alike; the rows stay for audit.
    pub async fn retract_episode(&self, episode_id: Uuid) -> Result<Vec<Uuid>> {
        let now = self.clock.now();
        let retracted = self
            .retry
            .run("retract_episode", || self.store.retract_episode(episode_id, now))
            .await?;

        tracing::info!(%episode_id, retracted = retracted.len(), "episode retracted");
        self.events.publish(FactEvent::EpisodeRetracted {
            episode_id,
            fact_ids: retracted.clone(),
        });
        Ok(retracted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::confidence::ConfidenceEngine;
    use crate::config::FactlineConfig;
    use crate::models::EntityKind;
    use crate::service::TemporalMemory;
    use chrono::{Duration, TimeZone};

    fn t(y: i32, m: u32, d: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, 0, 0, 0).unwrap()
    }

    fn memory(now: DateTime<Utc>) -> (TemporalMemory, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(now));
        let memory = TemporalMemory::in_memory(clock.clone(), &FactlineConfig::in_memory()).unwrap();
        (memory, clock)
    }

    fn input(subject: &str, predicate: &str, object: &str, valid_from: DateTime<Utc>) -> FactInput {
        FactInput {
            subject: subject.to_string(),
            subject_kind: EntityKind::Person,
            predicate: predicate.to_string(),
            object: object.to_string(),
            object_kind: EntityKind::Other,
            confidence: 0.9,
            valid_from: Some(valid_from),
            source: "chat".to_string(),
            recorded_by: Some("ingest-bot".to_string()),
        }
    }

    #[tokio::test]
    async fn test_episode_lifecycle() {
        let (memory, _clock) = memory(t(2024, 1, 2));
        let episodes = memory.episodes();
        let id = episodes
            .begin_episode("conversation turn 12", t(2024, 1, 1), None)
            .await
            .unwrap();

        let a = episodes
            .record_fact(id, input("philip-aga", "works_at", "ck-delta", t(2023, 1, 1)))
            .await
            .unwrap();
        let b = episodes
            .record_fact(id, input("philip-aga", "title", "engineer", t(2023, 1, 1)))
            .await
            .unwrap();
        assert_eq!(a.episode_id, Some(id));

        let closed = episodes.close_episode(id).await.unwrap();
        assert!(closed.is_closed());
        assert_eq!(closed.fact_ids, vec![a.id, b.id]);

        let err = episodes
            .record_fact(id, input("philip-aga", "has_skill", "rust", t(2023, 1, 1)))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "closed_episode");
        assert_eq!(episodes.episode(id).await.unwrap().fact_ids.len(), 2);

        let err = episodes.close_episode(id).await.unwrap_err();
        assert_eq!(err.kind(), "closed_episode");
    }

    #[tokio::test]
    async fn test_closed_episode_creates_no_entities() {
        let (memory, _clock) = memory(t(2024, 1, 2));
        let episodes = memory.episodes();
        let id = episodes.begin_episode("doc", t(2024, 1, 1), None).await.unwrap();
        episodes.close_episode(id).await.unwrap();

        episodes
            .record_fact(id, input("brand-new-person", "works_at", "brand-new-co", t(2023, 1, 1)))
            .await
            .unwrap_err();
        let resolution = memory
            .resolver()
            .resolve_detailed("brand-new-person", EntityKind::Person)
            .await
            .unwrap();
        assert_eq!(resolution.matched_by, crate::models::MatchKind::Created);
    }

    #[tokio::test]
    async fn test_begin_episode_validation() {
        let (memory, _clock) = memory(t(2024, 1, 2));
        let episodes = memory.episodes();
        assert_eq!(
            episodes.begin_episode(" ", t(2024, 1, 1), None).await.unwrap_err().kind(),
            "validation"
        );
        assert_eq!(
            episodes
                .begin_episode("doc", t(2024, 1, 2) + Duration::hours(1), None)
                .await
                .unwrap_err()
                .kind(),
            "validation"
        );
    }

    #[tokio::test]
    async fn test_unknown_episode() {
        let (memory, _clock) = memory(t(2024, 1, 2));
        let episodes = memory.episodes();
        let missing = Uuid::new_v4();
        assert_eq!(episodes.episode(missing).await.unwrap_err().kind(), "not_found");
        assert_eq!(
            episodes
                .record_fact(missing, input("a", "works_at", "b", t(2023, 1, 1)))
                .await
                .unwrap_err()
                .kind(),
            "not_found"
        );
        assert_eq!(episodes.close_episode(missing).await.unwrap_err().kind(), "not_found");
        assert_eq!(episodes.retract_episode(missing).await.unwrap_err().kind(), "not_found");
    }

    #[tokio::test]
    async fn test_record_superseding_tags_the_replacement() {
        let (memory, _clock) = memory(t(2024, 1, 2));
        let old = memory
            .append(input("philip-aga", "works_at", "ck-delta", t(2023, 1, 1)))
            .await
            .unwrap();
        let episodes = memory.episodes();
        let id = episodes.begin_episode("profile refresh", t(2024, 1, 2), None).await.unwrap();

        let new = episodes
            .record_superseding(id, old.id, input("philip-aga", "works_at", "other-co", t(2024, 1, 1)))
            .await
            .unwrap();
        assert_eq!(new.episode_id, Some(id));
        assert_eq!(memory.facts().get(old.id).await.unwrap().valid_to, Some(t(2024, 1, 1)));
        assert_eq!(episodes.episode(id).await.unwrap().fact_ids, vec![new.id]);
    }

    #[tokio::test]
    async fn test_retract_episode_ends_validity() {
        let (memory, clock) = memory(t(2024, 1, 2));
        let episodes = memory.episodes();
        let id = episodes.begin_episode("bad import", t(2024, 1, 1), None).await.unwrap();
        let fact = episodes
            .record_fact(id, input("philip-aga", "works_at", "wrong-co", t(2023, 1, 1)))
            .await
            .unwrap();
        episodes.close_episode(id).await.unwrap();

        clock.set(t(2024, 2, 1));
        let retracted = episodes.retract_episode(id).await.unwrap();
        assert_eq!(retracted, vec![fact.id]);

        let stored = memory.facts().get(fact.id).await.unwrap();
        assert_eq!(stored.valid_to, Some(t(2024, 2, 1)));
        assert!(memory.query().current_facts(fact.subject_id).await.unwrap().is_empty());
        // still believed before the retraction took effect
        assert_eq!(
            memory.query().as_of(fact.subject_id, t(2024, 1, 15)).await.unwrap().len(),
            1
        );

        // a second retraction has nothing left to close
        assert!(episodes.retract_episode(id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_retracted_episode_does_not_corroborate() {
        let (memory, clock) = memory(t(2024, 1, 2));
        let episodes = memory.episodes();
        let id = episodes.begin_episode("bad import", t(2024, 1, 1), None).await.unwrap();
        episodes
            .record_fact(
                id,
                FactInput { confidence: 0.6, ..input("philip-aga", "works_at", "wrong-co", t(2023, 1, 1)) },
            )
            .await
            .unwrap();
        episodes.retract_episode(id).await.unwrap();

        // retraction closes an episode that was still open
        let episode = episodes.episode(id).await.unwrap();
        assert_eq!(episode.retracted_at, Some(t(2024, 1, 2)));
        assert_eq!(episode.closed_at, Some(t(2024, 1, 2)));
        assert_eq!(
            episodes
                .record_fact(id, input("philip-aga", "works_at", "other-co", t(2024, 1, 1)))
                .await
                .unwrap_err()
                .kind(),
            "closed_episode"
        );

        clock.set(t(2024, 2, 1));
        let again = memory
            .append(FactInput { confidence: 0.6, ..input("philip-aga", "works_at", "wrong-co", t(2024, 1, 1)) })
            .await
            .unwrap();
        let engine = ConfidenceEngine::from(&FactlineConfig::in_memory().confidence);
        let plain = engine.effective_confidence(&again, t(2024, 2, 1));

        let current = memory.query().current_facts(again.subject_id).await.unwrap();
        assert_eq!(current.len(), 1);
        assert_eq!(current[0].fact.id, again.id);
        assert_eq!(current[0].corroborations, 0);
        assert!((current[0].effective_confidence - plain).abs() < 1e-9);

        // the withdrawn observation backs nothing in the past either
        let past = memory.query().as_of(again.subject_id, t(2024, 1, 1)).await.unwrap();
        assert!(past.iter().all(|s| s.corroborations == 0));
    }

    #[tokio::test]
    async fn test_retract_superseding_episode_leaves_slot_empty() {
        let (memory, clock) = memory(t(2024, 1, 2));
        let old = memory
            .append(input("philip-aga", "works_at", "ck-delta", t(2023, 1, 1)))
            .await
            .unwrap();
        let episodes = memory.episodes();
        let id = episodes.begin_episode("profile refresh", t(2024, 1, 2), None).await.unwrap();
        let new = episodes
            .record_superseding(id, old.id, input("philip-aga", "works_at", "other-co", t(2024, 1, 1)))
            .await
            .unwrap();

        clock.set(t(2024, 2, 1));
        assert_eq!(episodes.retract_episode(id).await.unwrap(), vec![new.id]);

        // the superseded fact keeps its end; nothing is believed until re-asserted
        assert!(memory.query().current_facts(old.subject_id).await.unwrap().is_empty());
        let history = memory.query().history(old.subject_id).await.unwrap();
        let kept = history.iter().find(|f| f.id == old.id).unwrap();
        assert_eq!(kept.valid_to, Some(t(2024, 1, 1)));

        let restored = memory
            .append(input("philip-aga", "works_at", "ck-delta", t(2024, 2, 1)))
            .await
            .unwrap();
        let current = memory.query().current_facts(old.subject_id).await.unwrap();
        assert_eq!(current.len(), 1);
        assert_eq!(current[0].fact.id, restored.id);
    }
}
