//! In-memory storage backend for embedded use and tests.
//!
//! A single `RwLock` over the whole state makes every trait method atomic,
//! which gives the same guarantees the Postgres backend gets from
//! transactions and row locks.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use uuid::Uuid;

use super::{check_episode_open, check_merge, check_supersede, newest_first, TemporalStore};
use crate::error::{FactlineError, Result};
use crate::models::{Entity, EntityKind, Episode, Fact};

#[derive(Debug, Clone)]
struct AliasRow {
    entity_id: Uuid,
    kind: EntityKind,
    alias: String,
    normalized: String,
}

#[derive(Debug, Default)]
struct MemoryState {
    facts: Vec<Fact>,
    fact_index: HashMap<Uuid, usize>,
    entities: HashMap<Uuid, Entity>,
    aliases: Vec<AliasRow>,
    episodes: HashMap<Uuid, Episode>,
}

impl MemoryState {
    fn push_fact(&mut self, fact: &Fact) -> Result<()> {
        if self.fact_index.contains_key(&fact.id) {
            return Err(FactlineError::conflict(format!("fact {} already exists", fact.id)));
        }
        for entity_id in [fact.subject_id, fact.object_id] {
            if !self.entities.contains_key(&entity_id) {
                return Err(FactlineError::NotFound { kind: "entity", id: entity_id });
            }
        }
        if let Some(episode_id) = fact.episode_id {
            let closed_at = self.episodes.get(&episode_id).map(|e| e.closed_at);
            check_episode_open(episode_id, closed_at)?;
        }

        self.fact_index.insert(fact.id, self.facts.len());
        self.facts.push(fact.clone());
        if let Some(episode) = fact.episode_id.and_then(|id| self.episodes.get_mut(&id)) {
            episode.fact_ids.push(fact.id);
        }
        Ok(())
    }

    fn fact(&self, id: Uuid) -> Option<&Fact> {
        self.fact_index.get(&id).map(|&i| &self.facts[i])
    }

    fn entity_with_aliases(&self, id: Uuid) -> Option<Entity> {
        let mut entity = self.entities.get(&id)?.clone();
        entity.aliases = self
            .aliases
            .iter()
            .filter(|a| a.entity_id == id)
            .map(|a| a.alias.clone())
            .collect::<BTreeSet<_>>();
        Some(entity)
    }

    fn alias_matches(&self, kind: EntityKind, pred: impl Fn(&AliasRow) -> bool) -> Vec<Uuid> {
        let mut seen = HashSet::new();
        self.aliases
            .iter()
            .filter(|a| a.kind == kind && pred(a))
            .filter(|a| seen.insert(a.entity_id))
            .map(|a| a.entity_id)
            .collect()
    }
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    state: RwLock<MemoryState>,
}

fn lock_err(context: &'static str) -> FactlineError {
    FactlineError::Internal(format!("poisoned lock: {context}"))
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self, context: &'static str) -> Result<RwLockReadGuard<'_, MemoryState>> {
        self.state.read().map_err(|_| lock_err(context))
    }

    fn write(&self, context: &'static str) -> Result<RwLockWriteGuard<'_, MemoryState>> {
        self.state.write().map_err(|_| lock_err(context))
    }
}

#[async_trait]
impl TemporalStore for MemoryStore {
    async fn insert_fact(&self, fact: &Fact) -> Result<()> {
        self.write("insert_fact")?.push_fact(fact)
    }

    async fn supersede_fact(&self, old_id: Uuid, new_fact: &Fact) -> Result<()> {
        let mut state = self.write("supersede_fact")?;
        check_supersede(old_id, state.fact(old_id), new_fact)?;
        // Insert first: if it fails, the old fact has not been touched.
        state.push_fact(new_fact)?;
        let idx = state.fact_index[&old_id];
        state.facts[idx].valid_to = Some(new_fact.valid_from);
        Ok(())
    }

    async fn get_fact(&self, id: Uuid) -> Result<Option<Fact>> {
        Ok(self.read("get_fact")?.fact(id).cloned())
    }

    async fn facts_touching(
        &self,
        entity_ids: &[Uuid],
        as_of: Option<DateTime<Utc>>,
    ) -> Result<Vec<Fact>> {
        let state = self.read("facts_touching")?;
        let ids: HashSet<Uuid> = entity_ids.iter().copied().collect();
        let mut facts: Vec<Fact> = state
            .facts
            .iter()
            .filter(|f| ids.contains(&f.subject_id) || ids.contains(&f.object_id))
            .filter(|f| as_of.map_or(true, |at| f.is_valid_at(at)))
            .cloned()
            .collect();
        facts.sort_by(newest_first);
        Ok(facts)
    }

    async fn count_facts_touching(&self, entity_ids: &[Uuid]) -> Result<u64> {
        let state = self.read("count_facts_touching")?;
        let ids: HashSet<Uuid> = entity_ids.iter().copied().collect();
        let count = state
            .facts
            .iter()
            .filter(|f| ids.contains(&f.subject_id) || ids.contains(&f.object_id))
            .count();
        Ok(count as u64)
    }

    async fn insert_entity(&self, entity: &Entity, normalized: &str) -> Result<()> {
        let mut state = self.write("insert_entity")?;
        if state.entities.contains_key(&entity.id) {
            return Err(FactlineError::conflict(format!("entity {} already exists", entity.id)));
        }
        for alias in &entity.aliases {
            state.aliases.push(AliasRow {
                entity_id: entity.id,
                kind: entity.kind,
                alias: alias.clone(),
                normalized: normalized.to_string(),
            });
        }
        state.entities.insert(entity.id, entity.clone());
        Ok(())
    }

    async fn get_entity(&self, id: Uuid) -> Result<Option<Entity>> {
        Ok(self.read("get_entity")?.entity_with_aliases(id))
    }

    async fn find_by_alias(&self, kind: EntityKind, alias: &str) -> Result<Vec<Uuid>> {
        Ok(self.read("find_by_alias")?.alias_matches(kind, |a| a.alias == alias))
    }

    async fn find_by_normalized(&self, kind: EntityKind, normalized: &str) -> Result<Vec<Uuid>> {
        Ok(self
            .read("find_by_normalized")?
            .alias_matches(kind, |a| a.normalized == normalized))
    }

    async fn add_alias(&self, entity_id: Uuid, alias: &str, normalized: &str) -> Result<()> {
        let mut state = self.write("add_alias")?;
        let kind = state
            .entities
            .get(&entity_id)
            .map(|e| e.kind)
            .ok_or(FactlineError::NotFound { kind: "entity", id: entity_id })?;
        let exists = state
            .aliases
            .iter()
            .any(|a| a.entity_id == entity_id && a.alias == alias);
        if !exists {
            state.aliases.push(AliasRow {
                entity_id,
                kind,
                alias: alias.to_string(),
                normalized: normalized.to_string(),
            });
        }
        Ok(())
    }

    async fn redirected_to(&self, id: Uuid) -> Result<Vec<Uuid>> {
        let state = self.read("redirected_to")?;
        let mut ids: Vec<Uuid> = state
            .entities
            .values()
            .filter(|e| e.redirect_to == Some(id))
            .map(|e| e.id)
            .collect();
        ids.sort();
        Ok(ids)
    }

    async fn merge_entities(&self, keep: Uuid, merge: Uuid) -> Result<()> {
        let mut state = self.write("merge_entities")?;
        let row = |id: Uuid| state.entities.get(&id).map(|e| (e.kind, e.redirect_to));
        check_merge(keep, merge, row(keep), row(merge))?;

        let kept: HashSet<String> = state
            .aliases
            .iter()
            .filter(|a| a.entity_id == keep)
            .map(|a| a.alias.clone())
            .collect();
        let mut moved = Vec::new();
        state.aliases.retain(|a| {
            if a.entity_id == merge {
                if !kept.contains(&a.alias) {
                    moved.push(AliasRow { entity_id: keep, ..a.clone() });
                }
                false
            } else {
                true
            }
        });
        state.aliases.extend(moved);

        for entity in state.entities.values_mut() {
            if entity.id == merge || entity.redirect_to == Some(merge) {
                entity.redirect_to = Some(keep);
            }
        }
        Ok(())
    }

    async fn insert_episode(&self, episode: &Episode) -> Result<()> {
        let mut state = self.write("insert_episode")?;
        if state.episodes.contains_key(&episode.id) {
            return Err(FactlineError::conflict(format!("episode {} already exists", episode.id)));
        }
        state.episodes.insert(episode.id, episode.clone());
        Ok(())
    }

    async fn get_episode(&self, id: Uuid) -> Result<Option<Episode>> {
        Ok(self.read("get_episode")?.episodes.get(&id).cloned())
    }

    async fn close_episode(&self, id: Uuid, at: DateTime<Utc>) -> Result<Episode> {
        let mut state = self.write("close_episode")?;
        let closed_at = state.episodes.get(&id).map(|e| e.closed_at);
        check_episode_open(id, closed_at)?;
        let episode = state
            .episodes
            .get_mut(&id)
            .ok_or(FactlineError::NotFound { kind: "episode", id })?;
        episode.closed_at = Some(at);
        Ok(episode.clone())
    }

    async fn retract_episode(&self, id: Uuid, at: DateTime<Utc>) -> Result<Vec<Uuid>> {
        let mut state = self.write("retract_episode")?;
        let episode = state
            .episodes
            .get_mut(&id)
            .ok_or(FactlineError::NotFound { kind: "episode", id })?;
        episode.retracted_at = episode.retracted_at.or(Some(at));
        episode.closed_at = episode.closed_at.or(Some(at));
        let fact_ids = episode.fact_ids.clone();

        let mut retracted = Vec::new();
        for fact_id in fact_ids {
            let Some(&idx) = state.fact_index.get(&fact_id) else {
                continue;
            };
            let fact = &mut state.facts[idx];
            if fact.valid_to.is_none() {
                fact.valid_to = Some(at.max(fact.valid_from));
                retracted.push(fact_id);
            }
        }
        Ok(retracted)
    }

    async fn retracted_episodes(&self, episode_ids: &[Uuid]) -> Result<Vec<Uuid>> {
        let state = self.read("retracted_episodes")?;
        Ok(episode_ids
            .iter()
            .copied()
            .filter(|id| state.episodes.get(id).is_some_and(Episode::is_retracted))
            .collect())
    }

    async fn health(&self) -> Result<String> {
        let state = self.read("health")?;
        Ok(format!(
            "in-memory ({} facts, {} entities, {} episodes)",
            state.facts.len(),
            state.entities.len(),
            state.episodes.len()
        ))
    }
}
