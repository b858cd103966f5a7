//! Temporal Query Engine: what we believe about an entity at an instant.
//!
//! Belief is computed, never stored. For a given instant the engine takes
//! the facts valid then, scores them with decay and corroboration, drops
//! those at or below the threshold and keeps one winner per slot.

use chrono::{DateTime, Utc};
use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use uuid::Uuid;

use crate::clock::Clock;
use crate::confidence::ConfidenceEngine;
use crate::config::QueryConfig;
use crate::error::Result;
use crate::facts::FactStore;
use crate::models::{BeliefChanges, Fact, ScoredFact};
use crate::resolver::EntityResolver;
use crate::store::newest_first;

/// Effective confidences closer than this count as equal.
const TIE_EPSILON: f64 = 1e-9;

/// Conflict key of a fact relative to the queried entity.
#[derive(Debug, PartialEq, Eq, Hash)]
enum Slot<'a> {
    /// The entity is the subject. `object` is only set for multi-valued
    /// predicates, so single-valued ones compete across objects.
    Outgoing { predicate: &'a str, object: Option<Uuid> },
    /// The entity is the object; each distinct subject holds its own slot.
    Incoming { predicate: &'a str, subject: Uuid },
}

#[derive(Clone)]
pub struct TemporalQueryEngine {
    facts: FactStore,
    resolver: EntityResolver,
    confidence: ConfidenceEngine,
    clock: Arc<dyn Clock>,
    threshold: f64,
    multi_valued: Arc<HashSet<String>>,
}

impl TemporalQueryEngine {
    pub fn new(
        facts: FactStore,
        resolver: EntityResolver,
        confidence: ConfidenceEngine,
        clock: Arc<dyn Clock>,
        config: &QueryConfig,
    ) -> Self {
        Self {
            facts,
            resolver,
            confidence,
            clock,
            threshold: config.threshold,
            multi_valued: Arc::new(config.multi_valued_predicates.iter().cloned().collect()),
        }
    }

    pub fn confidence(&self) -> &ConfidenceEngine {
        &self.confidence
    }

    /// Believed state now.
    pub async fn current_facts(&self, entity_id: Uuid) -> Result<Vec<ScoredFact>> {
        self.as_of(entity_id, self.clock.now()).await
    }

    /// Every fact ever recorded about the entity, oldest `valid_from` first,
    /// superseded and decayed facts included.
    pub async fn history(&self, entity_id: Uuid) -> Result<Vec<Fact>> {
        let mut facts = self.facts.all_facts_for_entity(entity_id).await?;
        facts.reverse();
        Ok(facts)
    }

    /// Believed state at `at`, newest `valid_from` first.
    pub async fn as_of(&self, entity_id: Uuid, at: DateTime<Utc>) -> Result<Vec<ScoredFact>> {
        let closure = self.resolver.closure(entity_id).await?;
        let facts = self.facts.facts_touching(&closure, None).await?;
        let canonical = self.canonical_map(&closure, &facts).await?;
        let retracted = self.facts.retracted_episodes(&facts).await?;
        let believed = self.reconcile(closure[0], &facts, &canonical, &retracted, at);
        tracing::debug!(entity = %closure[0], %at, candidates = facts.len(), believed = believed.len(), "as_of");
        Ok(believed)
    }

    /// Difference between the believed state at `from` and at `to`.
    pub async fn changes(
        &self,
        entity_id: Uuid,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<BeliefChanges> {
        let closure = self.resolver.closure(entity_id).await?;
        let facts = self.facts.facts_touching(&closure, None).await?;
        let canonical = self.canonical_map(&closure, &facts).await?;
        let retracted = self.facts.retracted_episodes(&facts).await?;

        let before = self.reconcile(closure[0], &facts, &canonical, &retracted, from);
        let after = self.reconcile(closure[0], &facts, &canonical, &retracted, to);
        let before_ids: HashSet<Uuid> = before.iter().map(|s| s.fact.id).collect();
        let after_ids: HashSet<Uuid> = after.iter().map(|s| s.fact.id).collect();

        Ok(BeliefChanges {
            entity_id: closure[0],
            from,
            to,
            added: after
                .into_iter()
                .filter(|s| !before_ids.contains(&s.fact.id))
                .collect(),
            removed: before
                .into_iter()
                .filter(|s| !after_ids.contains(&s.fact.id))
                .collect(),
        })
    }

    /// Canonical id for every entity the facts mention. Ids in the closure
    /// map to its head; the rest are looked up once each.
    async fn canonical_map(&self, closure: &[Uuid], facts: &[Fact]) -> Result<HashMap<Uuid, Uuid>> {
        let head = closure[0];
        let mut map: HashMap<Uuid, Uuid> = closure.iter().map(|&id| (id, head)).collect();
        for fact in facts {
            for id in [fact.subject_id, fact.object_id] {
                if !map.contains_key(&id) {
                    let canonical = self.resolver.canonical_id(id).await?;
                    map.insert(id, canonical);
                }
            }
        }
        Ok(map)
    }

    fn slot<'a>(&self, entity_id: Uuid, fact: &'a Fact, canonical: &impl Fn(Uuid) -> Uuid) -> Slot<'a> {
        let predicate = fact.predicate.as_str();
        let subject = canonical(fact.subject_id);
        if subject == entity_id {
            let object = self
                .multi_valued
                .contains(predicate)
                .then(|| canonical(fact.object_id));
            Slot::Outgoing { predicate, object }
        } else {
            Slot::Incoming { predicate, subject }
        }
    }

    fn reconcile(
        &self,
        entity_id: Uuid,
        facts: &[Fact],
        canonical: &HashMap<Uuid, Uuid>,
        retracted_episodes: &HashSet<Uuid>,
        at: DateTime<Utc>,
    ) -> Vec<ScoredFact> {
        let canon = |id: Uuid| canonical.get(&id).copied().unwrap_or(id);
        let withdrawn = |f: &Fact| f.episode_id.is_some_and(|e| retracted_episodes.contains(&e));

        // Corroborating chains: observations of the same canonical triple
        // that had started by `at`. Only the newest link is reinforced, and
        // facts of a retracted episode back nothing.
        let mut chains: HashMap<(Uuid, &str, Uuid), Vec<&Fact>> = HashMap::new();
        for fact in facts.iter().filter(|f| f.valid_from <= at && !withdrawn(*f)) {
            chains
                .entry((canon(fact.subject_id), fact.predicate.as_str(), canon(fact.object_id)))
                .or_default()
                .push(fact);
        }
        let corroborations: HashMap<Uuid, usize> = chains
            .values()
            .filter_map(|chain| {
                let newest = chain.iter().min_by(|a, b| newest_first(a, b))?;
                Some((newest.id, chain.len() - 1))
            })
            .collect();

        let mut winners: HashMap<Slot<'_>, ScoredFact> = HashMap::new();
        for fact in facts.iter().filter(|f| f.is_valid_at(at)) {
            let backing = corroborations.get(&fact.id).copied().unwrap_or(0);
            let effective = self.confidence.reinforced_confidence(fact, backing, at);
            if effective <= self.threshold {
                continue;
            }
            let scored = ScoredFact {
                fact: fact.clone(),
                effective_confidence: effective,
                corroborations: backing,
            };
            let slot = self.slot(entity_id, fact, &canon);
            match winners.get(&slot) {
                Some(current) if !beats(&scored, current) => {}
                _ => {
                    winners.insert(slot, scored);
                }
            }
        }

        let mut believed: Vec<ScoredFact> = winners.into_values().collect();
        believed.sort_by(|a, b| newest_first(&a.fact, &b.fact));
        believed
    }
}

/// Higher effective confidence wins; near-ties go to the newer fact.
fn beats(challenger: &ScoredFact, holder: &ScoredFact) -> bool {
    let diff = challenger.effective_confidence - holder.effective_confidence;
    if diff.abs() > TIE_EPSILON {
        return diff > 0.0;
    }
    newest_first(&challenger.fact, &holder.fact) == Ordering::Less
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::FactlineConfig;
    use crate::models::{EntityKind, FactInput};
    use crate::service::TemporalMemory;
    use chrono::{Duration, TimeZone};

    fn t(y: i32, m: u32, d: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, 0, 0, 0).unwrap()
    }

    fn setup(now: DateTime<Utc>, config: FactlineConfig) -> (TemporalMemory, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(now));
        let memory = TemporalMemory::in_memory(clock.clone(), &config).unwrap();
        (memory, clock)
    }

    fn memory(now: DateTime<Utc>) -> (TemporalMemory, Arc<ManualClock>) {
        setup(now, FactlineConfig::in_memory())
    }

    fn input(
        subject: &str,
        predicate: &str,
        object: &str,
        object_kind: EntityKind,
        confidence: f64,
        valid_from: DateTime<Utc>,
    ) -> FactInput {
        FactInput {
            subject: subject.to_string(),
            subject_kind: EntityKind::Person,
            predicate: predicate.to_string(),
            object: object.to_string(),
            object_kind,
            confidence,
            valid_from: Some(valid_from),
            source: "test".to_string(),
            recorded_by: None,
        }
    }

    fn works_at(company: &str, confidence: f64, valid_from: DateTime<Utc>) -> FactInput {
        input("philip-aga", "works_at", company, EntityKind::Company, confidence, valid_from)
    }

    fn objects(scored: &[ScoredFact]) -> Vec<&str> {
        scored.iter().map(|s| s.fact.object_raw.as_str()).collect()
    }

    // ===== philip-aga: append, query, supersede, history =====

    #[tokio::test]
    async fn test_philip_aga_scenario() {
        let (memory, clock) = memory(t(2023, 1, 2));
        let first = memory.append(works_at("ck-delta", 0.95, t(2023, 1, 1))).await.unwrap();
        let person = first.subject_id;

        let current = memory.query().current_facts(person).await.unwrap();
        assert_eq!(objects(&current), vec!["ck-delta"]);
        assert!((current[0].effective_confidence - 0.95).abs() < 0.001);

        let before = memory.query().as_of(person, t(2022, 1, 1)).await.unwrap();
        assert!(before.is_empty());

        clock.set(t(2024, 1, 2));
        let second = memory
            .supersede(first.id, works_at("other-co", 0.9, t(2024, 1, 1)))
            .await
            .unwrap();

        let current = memory.query().current_facts(person).await.unwrap();
        assert_eq!(objects(&current), vec!["other-co"]);

        let mid_2023 = memory.query().as_of(person, t(2023, 6, 1)).await.unwrap();
        assert_eq!(objects(&mid_2023), vec!["ck-delta"]);

        let history = memory.query().history(person).await.unwrap();
        assert_eq!(history.iter().map(|f| f.id).collect::<Vec<_>>(), vec![first.id, second.id]);
        assert_eq!(history[0].valid_to, Some(t(2024, 1, 1)));
    }

    // ===== conflict resolution =====

    #[tokio::test]
    async fn test_higher_confidence_beats_newer() {
        let (memory, _clock) = memory(t(2023, 6, 2));
        memory.append(works_at("old-co", 0.9, t(2023, 6, 1))).await.unwrap();
        let newer = memory.append(works_at("new-co", 0.6, t(2023, 6, 1) + Duration::hours(1))).await.unwrap();

        let current = memory.query().current_facts(newer.subject_id).await.unwrap();
        assert_eq!(objects(&current), vec!["old-co"]);
    }

    #[tokio::test]
    async fn test_equal_confidence_goes_to_most_recent() {
        let (memory, clock) = memory(t(2023, 6, 2));
        // same valid_from so decay is identical; only recorded_at differs
        let start = t(2023, 6, 1);
        memory.append(works_at("first-co", 0.8, start)).await.unwrap();
        clock.advance(Duration::minutes(1));
        let second = memory.append(works_at("second-co", 0.8, start)).await.unwrap();

        let current = memory.query().current_facts(second.subject_id).await.unwrap();
        assert_eq!(objects(&current), vec!["second-co"]);
    }

    #[tokio::test]
    async fn test_equal_confidence_newer_valid_from_wins() {
        // decay-free predicate so confidences tie exactly across instants
        let mut config = FactlineConfig::in_memory();
        config.confidence.lambdas.insert("works_at".to_string(), 0.0);
        let (memory, _clock) = setup(t(2023, 6, 1), config);
        memory.append(works_at("older-co", 0.7, t(2023, 1, 1))).await.unwrap();
        let newer = memory.append(works_at("newer-co", 0.7, t(2023, 3, 1))).await.unwrap();

        let current = memory.query().current_facts(newer.subject_id).await.unwrap();
        assert_eq!(objects(&current), vec!["newer-co"]);
    }

    #[tokio::test]
    async fn test_threshold_excludes_weak_facts_but_history_keeps_them() {
        let (memory, _clock) = memory(t(2023, 1, 2));
        let weak = memory.append(works_at("maybe-co", 0.3, t(2023, 1, 1))).await.unwrap();

        let current = memory.query().current_facts(weak.subject_id).await.unwrap();
        assert!(current.is_empty(), "0.3 is not above the threshold");
        assert_eq!(memory.query().history(weak.subject_id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_decay_drops_stale_facts() {
        let (memory, clock) = memory(t(2020, 1, 2));
        let fact = memory
            .append(input("philip-aga", "has_skill", "cobol", EntityKind::Skill, 0.5, t(2020, 1, 1)))
            .await
            .unwrap();
        assert_eq!(memory.query().current_facts(fact.subject_id).await.unwrap().len(), 1);

        // 0.5 * exp(-0.001 * ~1000) is about 0.18
        clock.set(t(2022, 10, 1));
        assert!(memory.query().current_facts(fact.subject_id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_different_predicates_do_not_compete() {
        let (memory, _clock) = memory(t(2023, 1, 2));
        let a = memory.append(works_at("ck-delta", 0.9, t(2023, 1, 1))).await.unwrap();
        memory
            .append(input("philip-aga", "title", "engineer", EntityKind::Role, 0.8, t(2023, 1, 1)))
            .await
            .unwrap();
        assert_eq!(memory.query().current_facts(a.subject_id).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_multi_valued_predicates_keep_each_object() {
        let mut config = FactlineConfig::in_memory();
        config.query.multi_valued_predicates = vec!["has_skill".to_string()];
        let (memory, _clock) = setup(t(2023, 1, 2), config);

        let rust = memory
            .append(input("philip-aga", "has_skill", "rust", EntityKind::Skill, 0.9, t(2023, 1, 1)))
            .await
            .unwrap();
        memory
            .append(input("philip-aga", "has_skill", "sql", EntityKind::Skill, 0.8, t(2023, 1, 1)))
            .await
            .unwrap();
        assert_eq!(memory.query().current_facts(rust.subject_id).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_incoming_facts_keep_one_slot_per_subject() {
        let (memory, _clock) = memory(t(2023, 1, 2));
        let a = memory.append(works_at("ck-delta", 0.9, t(2023, 1, 1))).await.unwrap();
        memory
            .append(input("jane-doe", "works_at", "ck-delta", EntityKind::Company, 0.9, t(2023, 1, 1)))
            .await
            .unwrap();

        let company = memory.query().current_facts(a.object_id).await.unwrap();
        assert_eq!(company.len(), 2);
    }

    #[tokio::test]
    async fn test_repeated_observations_reinforce_newest() {
        let (memory, _clock) = memory(t(2023, 3, 2));
        memory.append(works_at("ck-delta", 0.6, t(2023, 1, 1))).await.unwrap();
        memory.append(works_at("ck-delta", 0.6, t(2023, 2, 1))).await.unwrap();
        let newest = memory.append(works_at("ck-delta", 0.6, t(2023, 3, 1))).await.unwrap();

        let current = memory.query().current_facts(newest.subject_id).await.unwrap();
        assert_eq!(current.len(), 1);
        assert_eq!(current[0].fact.id, newest.id);
        assert_eq!(current[0].corroborations, 2);
        let decayed = memory.query().confidence().effective_confidence(&newest, t(2023, 3, 2));
        assert!((current[0].effective_confidence - (decayed + 0.10)).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_unknown_entity_is_not_found() {
        let (memory, _clock) = memory(t(2023, 1, 1));
        let err = memory.query().current_facts(Uuid::new_v4()).await.unwrap_err();
        assert_eq!(err.kind(), "not_found");
        let err = memory.query().history(Uuid::new_v4()).await.unwrap_err();
        assert_eq!(err.kind(), "not_found");
    }

    // ===== merge =====

    #[tokio::test]
    async fn test_merge_preserves_facts() {
        let (memory, _clock) = memory(t(2023, 1, 2));
        let a = memory.append(works_at("ck-delta", 0.9, t(2023, 1, 1))).await.unwrap();
        let b = memory
            .append(input("P. Aga", "title", "engineer", EntityKind::Role, 0.8, t(2023, 1, 1)))
            .await
            .unwrap();
        assert_ne!(a.subject_id, b.subject_id);
        let before: HashSet<Uuid> = memory
            .facts()
            .facts_for_entity(b.subject_id, None)
            .await
            .unwrap()
            .iter()
            .map(|f| f.id)
            .collect();

        memory.resolver().merge(a.subject_id, b.subject_id).await.unwrap();

        let via_merged: Vec<Uuid> = memory
            .facts()
            .facts_for_entity(b.subject_id, None)
            .await
            .unwrap()
            .iter()
            .map(|f| f.id)
            .collect();
        let via_kept: Vec<Uuid> = memory
            .facts()
            .facts_for_entity(a.subject_id, None)
            .await
            .unwrap()
            .iter()
            .map(|f| f.id)
            .collect();
        assert_eq!(via_merged, via_kept);
        assert!(before.iter().all(|id| via_kept.contains(id)));

        let current = memory.query().current_facts(a.subject_id).await.unwrap();
        assert_eq!(current.len(), 2);
    }

    #[tokio::test]
    async fn test_merged_duplicates_compete_in_one_slot() {
        let (memory, _clock) = memory(t(2023, 1, 2));
        let a = memory.append(works_at("ck-delta", 0.9, t(2023, 1, 1))).await.unwrap();
        let b = memory
            .append(input("P. Aga", "works_at", "other-co", EntityKind::Company, 0.5, t(2023, 1, 1)))
            .await
            .unwrap();
        memory.resolver().merge(a.subject_id, b.subject_id).await.unwrap();

        let current = memory.query().current_facts(b.subject_id).await.unwrap();
        assert_eq!(objects(&current), vec!["ck-delta"]);
    }

    // ===== changes =====

    #[tokio::test]
    async fn test_changes_between_instants() {
        let (memory, _clock) = memory(t(2024, 6, 1));
        let first = memory.append(works_at("ck-delta", 0.95, t(2023, 1, 1))).await.unwrap();
        let second = memory
            .supersede(first.id, works_at("other-co", 0.9, t(2024, 1, 1)))
            .await
            .unwrap();

        let changes = memory
            .query()
            .changes(first.subject_id, t(2023, 6, 1), t(2024, 6, 1))
            .await
            .unwrap();
        assert_eq!(changes.entity_id, first.subject_id);
        assert_eq!(changes.added.iter().map(|s| s.fact.id).collect::<Vec<_>>(), vec![second.id]);
        assert_eq!(changes.removed.iter().map(|s| s.fact.id).collect::<Vec<_>>(), vec![first.id]);

        let none = memory
            .query()
            .changes(first.subject_id, t(2024, 2, 1), t(2024, 3, 1))
            .await
            .unwrap();
        assert!(none.added.is_empty() && none.removed.is_empty());
    }
}
