//! Entity Resolver: maps raw names to canonical entity ids.
//!
//! Lookup runs exact alias first, then normalized form, and creates a new
//! entity when neither matches. A normalized hit records the raw spelling as
//! a new alias so the next lookup is exact. Merged entities stay behind as
//! redirects; every id handed out is canonical.

use chrono::{DateTime, Utc};
use regex::Regex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, LazyLock};
use uuid::Uuid;

use crate::clock::Clock;
use crate::error::{FactlineError, Result};
use crate::events::{EventBus, FactEvent};
use crate::facts::validate_fields;
use crate::models::{Entity, EntityKind, FactInput, MatchKind, NewFact, Resolution};
use crate::store::{RetryPolicy, TemporalStore};

/// Redirect chains are flattened on merge; anything longer is a cycle.
const MAX_REDIRECT_HOPS: usize = 16;

/// Runs of anything that is not a letter, digit or whitespace.
static PUNCTUATION: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[^\p{L}\p{N}\s]+").expect("punctuation pattern compiles"));

/// Case, punctuation and whitespace folding plus the configured synonym
/// table. `"CK-Delta"`, `"ck delta"` and `" CK  Delta. "` all fold to
/// `"ck delta"`.
#[derive(Debug, Clone)]
pub struct Normalizer {
    /// folded variant -> folded canonical form
    synonyms: HashMap<String, String>,
}

impl Normalizer {
    pub fn new(synonyms: &HashMap<String, Vec<String>>) -> Self {
        let mut folded = HashMap::new();
        for (canonical, variants) in synonyms {
            let target = Self::fold(canonical);
            for variant in variants {
                let key = Self::fold(variant);
                if !key.is_empty() && key != target {
                    folded.insert(key, target.clone());
                }
            }
        }
        Self { synonyms: folded }
    }

    fn fold(raw: &str) -> String {
        let lowered = raw.to_lowercase();
        PUNCTUATION
            .replace_all(&lowered, " ")
            .split_whitespace()
            .collect::<Vec<_>>()
            .join(" ")
    }

    pub fn normalize(&self, raw: &str) -> String {
        let folded = Self::fold(raw);
        match self.synonyms.get(&folded) {
            Some(canonical) => canonical.clone(),
            None => folded,
        }
    }
}

#[derive(Clone)]
pub struct EntityResolver {
    store: Arc<dyn TemporalStore>,
    clock: Arc<dyn Clock>,
    retry: RetryPolicy,
    normalizer: Arc<Normalizer>,
    events: EventBus,
}

impl EntityResolver {
    pub fn new(
        store: Arc<dyn TemporalStore>,
        clock: Arc<dyn Clock>,
        retry: RetryPolicy,
        normalizer: Normalizer,
        events: EventBus,
    ) -> Self {
        Self {
            store,
            clock,
            retry,
            normalizer: Arc::new(normalizer),
            events,
        }
    }

    pub fn normalize(&self, raw: &str) -> String {
        self.normalizer.normalize(raw)
    }

    /// Canonical id for `raw_name`, creating the entity on first sight.
    pub async fn resolve(&self, raw_name: &str, kind: EntityKind) -> Result<Uuid> {
        Ok(self.resolve_detailed(raw_name, kind).await?.entity_id)
    }

    pub async fn resolve_detailed(&self, raw_name: &str, kind: EntityKind) -> Result<Resolution> {
        let raw = raw_name.trim();
        if raw.is_empty() {
            return Err(FactlineError::validation("entity name must not be empty"));
        }

        let exact = self
            .retry
            .run("find_by_alias", || self.store.find_by_alias(kind, raw))
            .await?;
        if !exact.is_empty() {
            let entity_id = self.pick(exact).await?;
            tracing::debug!(name = raw, %kind, %entity_id, "resolved by exact alias");
            return Ok(Resolution {
                entity_id,
                matched_by: MatchKind::Exact,
            });
        }

        let normalized = self.normalizer.normalize(raw);
        if !normalized.is_empty() {
            let candidates = self
                .retry
                .run("find_by_normalized", || {
                    self.store.find_by_normalized(kind, &normalized)
                })
                .await?;
            if !candidates.is_empty() {
                let entity_id = self.pick(candidates).await?;
                self.retry
                    .run("add_alias", || self.store.add_alias(entity_id, raw, &normalized))
                    .await?;
                tracing::debug!(name = raw, %normalized, %entity_id, "resolved by normalized form");
                return Ok(Resolution {
                    entity_id,
                    matched_by: MatchKind::Normalized,
                });
            }
        }

        let entity = Entity::new(raw, kind, self.clock.now());
        self.retry
            .run("insert_entity", || self.store.insert_entity(&entity, &normalized))
            .await?;
        tracing::info!(name = raw, %kind, entity_id = %entity.id, "entity created");
        self.events.publish(FactEvent::EntityCreated {
            entity_id: entity.id,
            name: entity.canonical_name.clone(),
            kind,
        });
        Ok(Resolution {
            entity_id: entity.id,
            matched_by: MatchKind::Created,
        })
    }

    /// Choose among matching entities: most facts, then oldest, then
    /// lowest id. Redirects collapse onto their survivors first.
    async fn pick(&self, candidates: Vec<Uuid>) -> Result<Uuid> {
        let mut canonical = Vec::with_capacity(candidates.len());
        for id in candidates {
            let c = self.canonical_id(id).await?;
            if !canonical.contains(&c) {
                canonical.push(c);
            }
        }
        if canonical.len() == 1 {
            return Ok(canonical[0]);
        }

        let mut ranked: Vec<(u64, DateTime<Utc>, Uuid)> = Vec::with_capacity(canonical.len());
        for id in canonical {
            let closure = self.closure(id).await?;
            let count = self
                .retry
                .run("count_facts_touching", || self.store.count_facts_touching(&closure))
                .await?;
            let created_at = self.entity(id).await?.created_at;
            ranked.push((count, created_at, id));
        }
        ranked.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(&b.1)).then(a.2.cmp(&b.2)));
        tracing::debug!(candidates = ranked.len(), chosen = %ranked[0].2, "ambiguous name");
        Ok(ranked[0].2)
    }

    /// Follow redirects to the surviving entity.
    pub async fn canonical_id(&self, id: Uuid) -> Result<Uuid> {
        let mut current = id;
        for _ in 0..MAX_REDIRECT_HOPS {
            let entity = self
                .retry
                .run("get_entity", || self.store.get_entity(current))
                .await?
                .ok_or(FactlineError::NotFound { kind: "entity", id: current })?;
            match entity.redirect_to {
                Some(next) => current = next,
                None => return Ok(current),
            }
        }
        Err(FactlineError::conflict(format!(
            "redirect chain from entity {} exceeds {} hops",
            id, MAX_REDIRECT_HOPS
        )))
    }

    /// The canonical entity for `id`, with its full alias set.
    pub async fn entity(&self, id: Uuid) -> Result<Entity> {
        let canonical = self.canonical_id(id).await?;
        self.retry
            .run("get_entity", || self.store.get_entity(canonical))
            .await?
            .ok_or(FactlineError::NotFound { kind: "entity", id: canonical })
    }

    /// The canonical id of `id` followed by every entity redirected into it.
    /// Facts are never rewritten on merge; queries read across this set.
    pub async fn closure(&self, id: Uuid) -> Result<Vec<Uuid>> {
        let canonical = self.canonical_id(id).await?;
        let mut seen = HashSet::from([canonical]);
        let mut ids = vec![canonical];
        let mut queue = VecDeque::from([canonical]);
        while let Some(next) = queue.pop_front() {
            let redirected = self
                .retry
                .run("redirected_to", || self.store.redirected_to(next))
                .await?;
            for r in redirected {
                if seen.insert(r) {
                    ids.push(r);
                    queue.push_back(r);
                }
            }
        }
        Ok(ids)
    }

    /// Fold `merge` into `keep`. Aliases move to `keep`, and facts that
    /// named `merge` read as `keep` from now on. Returns the survivor.
    pub async fn merge(&self, keep: Uuid, merge: Uuid) -> Result<Entity> {
        if keep == merge {
            return Err(FactlineError::conflict(format!(
                "cannot merge entity {} into itself",
                keep
            )));
        }
        self.retry
            .run("merge_entities", || self.store.merge_entities(keep, merge))
            .await?;
        tracing::info!(%keep, %merge, "entities merged");
        self.events.publish(FactEvent::EntitiesMerged {
            keep_id: keep,
            merged_id: merge,
        });
        self.entity(keep).await
    }

    /// Resolve both ends of a caller-supplied fact. Field checks run first
    /// so a rejected fact leaves no entities behind.
    pub async fn resolve_input(&self, input: FactInput, episode_id: Option<Uuid>) -> Result<NewFact> {
        let now = self.clock.now();
        let valid_from = input.valid_from.unwrap_or(now);
        validate_fields(input.confidence, &input.predicate, valid_from, now)?;

        let subject_id = self.resolve(&input.subject, input.subject_kind).await?;
        let object_id = self.resolve(&input.object, input.object_kind).await?;

        Ok(NewFact {
            subject_id,
            subject_raw: input.subject.trim().to_string(),
            predicate: input.predicate.trim().to_string(),
            object_id,
            object_raw: input.object.trim().to_string(),
            confidence: input.confidence,
            valid_from,
            source: input.source,
            episode_id,
            recorded_by: input.recorded_by,
        })
    }
}
