//! Fact Store: validated, append-only persistence of temporal facts.

use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::sync::Arc;
use uuid::Uuid;

use crate::clock::Clock;
use crate::error::{FactlineError, Result};
use crate::events::{EventBus, FactEvent};
use crate::models::{Fact, NewFact};
use crate::resolver::EntityResolver;
use crate::store::{RetryPolicy, TemporalStore};

/// Field checks shared by the fact store and by input resolution, so a bad
/// fact is rejected before any entity is created for it.
pub(crate) fn validate_fields(
    confidence: f64,
    predicate: &str,
    valid_from: DateTime<Utc>,
    now: DateTime<Utc>,
) -> Result<()> {
    if !confidence.is_finite() || !(0.0..=1.0).contains(&confidence) {
        return Err(FactlineError::validation(format!(
            "confidence must lie in [0, 1], got {}",
            confidence
        )));
    }
    if predicate.trim().is_empty() {
        return Err(FactlineError::validation("predicate must not be empty"));
    }
    if valid_from > now {
        return Err(FactlineError::validation(format!(
            "valid_from {} is in the future (now {})",
            valid_from, now
        )));
    }
    Ok(())
}

#[derive(Clone)]
pub struct FactStore {
    store: Arc<dyn TemporalStore>,
    resolver: EntityResolver,
    clock: Arc<dyn Clock>,
    retry: RetryPolicy,
    events: EventBus,
}

impl FactStore {
    pub fn new(
        store: Arc<dyn TemporalStore>,
        resolver: EntityResolver,
        clock: Arc<dyn Clock>,
        retry: RetryPolicy,
        events: EventBus,
    ) -> Self {
        Self {
            store,
            resolver,
            clock,
            retry,
            events,
        }
    }

    fn stamp(&self, new_fact: NewFact) -> Result<Fact> {
        let now = self.clock.now();
        validate_fields(new_fact.confidence, &new_fact.predicate, new_fact.valid_from, now)?;
        if new_fact.subject_raw.trim().is_empty() || new_fact.object_raw.trim().is_empty() {
            return Err(FactlineError::validation("subject and object must not be empty"));
        }
        let mut fact = new_fact.into_fact(Uuid::new_v4(), now);
        fact.predicate = fact.predicate.trim().to_string();
        Ok(fact)
    }

    /// Validate and persist a fact; returns its id.
    pub async fn append(&self, new_fact: NewFact) -> Result<Uuid> {
        Ok(self.append_fact(new_fact).await?.id)
    }

    /// As [`append`](Self::append), returning the stored row.
    pub async fn append_fact(&self, new_fact: NewFact) -> Result<Fact> {
        let fact = self.stamp(new_fact)?;
        self.retry
            .run("insert_fact", || self.store.insert_fact(&fact))
            .await?;

        tracing::info!(
            fact_id = %fact.id,
            subject = %fact.subject_raw,
            predicate = %fact.predicate,
            object = %fact.object_raw,
            confidence = fact.confidence,
            "fact appended"
        );
        self.events.publish(FactEvent::FactAppended {
            fact_id: fact.id,
            subject_id: fact.subject_id,
            predicate: fact.predicate.clone(),
            object_id: fact.object_id,
            episode_id: fact.episode_id,
        });
        Ok(fact)
    }

    /// Close `old_id` at the new fact's `valid_from` and append the new fact,
    /// atomically. Returns the new fact's id.
    pub async fn supersede(&self, old_id: Uuid, new_fact: NewFact) -> Result<Uuid> {
        Ok(self.supersede_fact(old_id, new_fact).await?.id)
    }

    /// As [`supersede`](Self::supersede), returning the stored replacement.
    pub async fn supersede_fact(&self, old_id: Uuid, new_fact: NewFact) -> Result<Fact> {
        let fact = self.stamp(new_fact)?;
        self.retry
            .run("supersede_fact", || self.store.supersede_fact(old_id, &fact))
            .await?;

        tracing::info!(old = %old_id, new = %fact.id, valid_from = %fact.valid_from, "fact superseded");
        self.events.publish(FactEvent::FactSuperseded {
            old_fact_id: old_id,
            new_fact_id: fact.id,
            at: fact.valid_from,
        });
        Ok(fact)
    }

    pub async fn get(&self, id: Uuid) -> Result<Fact> {
        self.retry
            .run("get_fact", || self.store.get_fact(id))
            .await?
            .ok_or(FactlineError::NotFound { kind: "fact", id })
    }

    /// Facts about the entity (and everything merged into it) valid at
    /// `as_of`, default now, newest `valid_from` first.
    pub async fn facts_for_entity(
        &self,
        entity_id: Uuid,
        as_of: Option<DateTime<Utc>>,
    ) -> Result<Vec<Fact>> {
        let at = as_of.unwrap_or_else(|| self.clock.now());
        let closure = self.resolver.closure(entity_id).await?;
        self.facts_touching(&closure, Some(at)).await
    }

    /// Every fact about the entity regardless of validity, newest first.
    pub async fn all_facts_for_entity(&self, entity_id: Uuid) -> Result<Vec<Fact>> {
        let closure = self.resolver.closure(entity_id).await?;
        self.facts_touching(&closure, None).await
    }

    /// Episodes among those that recorded `facts` which have been retracted.
    pub(crate) async fn retracted_episodes(&self, facts: &[Fact]) -> Result<HashSet<Uuid>> {
        let mut episode_ids: Vec<Uuid> = facts.iter().filter_map(|f| f.episode_id).collect();
        if episode_ids.is_empty() {
            return Ok(HashSet::new());
        }
        episode_ids.sort();
        episode_ids.dedup();
        let retracted = self
            .retry
            .run("retracted_episodes", || self.store.retracted_episodes(&episode_ids))
            .await?;
        Ok(retracted.into_iter().collect())
    }

    pub(crate) async fn facts_touching(
        &self,
        entity_ids: &[Uuid],
        as_of: Option<DateTime<Utc>>,
    ) -> Result<Vec<Fact>> {
        self.retry
            .run("facts_touching", || self.store.facts_touching(entity_ids, as_of))
            .await
    }
}
