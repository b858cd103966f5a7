//! Storage backends for facts, entities and episodes.
//!
//! `TemporalStore` is the persistence seam. Each method is one atomic unit:
//! the components above it validate input and retry transient failures, the
//! backend enforces the invariants that need row locks (single supersession,
//! open-episode writes, merge serialization).

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::cmp::Ordering;
use uuid::Uuid;

use crate::error::{FactlineError, Result};
use crate::models::{Entity, EntityKind, Episode, Fact};

pub mod memory;
pub mod postgres;
pub mod retry;

pub use memory::MemoryStore;
pub use postgres::PgStore;
pub use retry::RetryPolicy;

#[async_trait]
pub trait TemporalStore: Send + Sync {
    /// Insert a fact. When `fact.episode_id` is set, the episode must exist
    /// and be open; the fact is appended to its ordered fact list in the
    /// same transaction.
    async fn insert_fact(&self, fact: &Fact) -> Result<()>;

    /// Set `old.valid_to = new_fact.valid_from` and insert `new_fact`, both or
    /// neither.
    async fn supersede_fact(&self, old_id: Uuid, new_fact: &Fact) -> Result<()>;

    async fn get_fact(&self, id: Uuid) -> Result<Option<Fact>>;

    /// Facts whose subject or object is one of `entity_ids`, optionally
    /// restricted to those valid at `as_of`, newest `valid_from` first.
    async fn facts_touching(
        &self,
        entity_ids: &[Uuid],
        as_of: Option<DateTime<Utc>>,
    ) -> Result<Vec<Fact>>;

    async fn count_facts_touching(&self, entity_ids: &[Uuid]) -> Result<u64>;

    /// Insert a new entity; every alias is stored with `normalized` as its
    /// match key.
    async fn insert_entity(&self, entity: &Entity, normalized: &str) -> Result<()>;

    async fn get_entity(&self, id: Uuid) -> Result<Option<Entity>>;

    async fn find_by_alias(&self, kind: EntityKind, alias: &str) -> Result<Vec<Uuid>>;

    async fn find_by_normalized(&self, kind: EntityKind, normalized: &str) -> Result<Vec<Uuid>>;

    async fn add_alias(&self, entity_id: Uuid, alias: &str, normalized: &str) -> Result<()>;

    /// Ids of entities whose redirect points at `id`.
    async fn redirected_to(&self, id: Uuid) -> Result<Vec<Uuid>>;

    /// Turn `merge` into a redirect to `keep`, moving its aliases and
    /// flattening redirects that pointed at it.
    async fn merge_entities(&self, keep: Uuid, merge: Uuid) -> Result<()>;

    async fn insert_episode(&self, episode: &Episode) -> Result<()>;

    async fn get_episode(&self, id: Uuid) -> Result<Option<Episode>>;

    async fn close_episode(&self, id: Uuid, at: DateTime<Utc>) -> Result<Episode>;

    /// Set `valid_to = max(at, valid_from)` on every still-open fact of the
    /// episode and mark the episode retracted (and closed, if it was open).
    /// Returns the affected fact ids in episode order.
    async fn retract_episode(&self, id: Uuid, at: DateTime<Utc>) -> Result<Vec<Uuid>>;

    /// The subset of `episode_ids` that have been retracted.
    async fn retracted_episodes(&self, episode_ids: &[Uuid]) -> Result<Vec<Uuid>>;

    /// Backend description for health reporting.
    async fn health(&self) -> Result<String>;
}

/// Newest first: `valid_from`, then `recorded_at`, then id, all descending.
pub(crate) fn newest_first(a: &Fact, b: &Fact) -> Ordering {
    b.valid_from
        .cmp(&a.valid_from)
        .then_with(|| b.recorded_at.cmp(&a.recorded_at))
        .then_with(|| b.id.cmp(&a.id))
}

/// Checks shared by every backend once the old fact is locked.
pub(crate) fn check_supersede(old_id: Uuid, old: Option<&Fact>, new_fact: &Fact) -> Result<()> {
    let old = old.ok_or(FactlineError::NotFound { kind: "fact", id: old_id })?;
    if let Some(valid_to) = old.valid_to {
        return Err(FactlineError::conflict(format!(
            "fact {} was already superseded at {}",
            old_id, valid_to
        )));
    }
    if new_fact.valid_from < old.valid_from {
        return Err(FactlineError::validation(format!(
            "superseding fact starts at {} before the fact it replaces ({})",
            new_fact.valid_from, old.valid_from
        )));
    }
    Ok(())
}

/// Merge preconditions, evaluated with both entity rows locked.
/// Each row is `(kind, redirect_to)`.
pub(crate) fn check_merge(
    keep: Uuid,
    merge: Uuid,
    keep_row: Option<(EntityKind, Option<Uuid>)>,
    merge_row: Option<(EntityKind, Option<Uuid>)>,
) -> Result<()> {
    if keep == merge {
        return Err(FactlineError::conflict(format!("cannot merge entity {} into itself", keep)));
    }
    let (keep_kind, keep_redirect) = keep_row.ok_or(FactlineError::NotFound { kind: "entity", id: keep })?;
    let (merge_kind, merge_redirect) =
        merge_row.ok_or(FactlineError::NotFound { kind: "entity", id: merge })?;
    if let Some(target) = keep_redirect {
        return Err(FactlineError::conflict(format!(
            "entity {} was merged into {}; merge into the surviving entity instead",
            keep, target
        )));
    }
    if let Some(target) = merge_redirect {
        return Err(FactlineError::conflict(format!(
            "entity {} was already merged into {}",
            merge, target
        )));
    }
    if keep_kind != merge_kind {
        return Err(FactlineError::validation(format!(
            "cannot merge a {} into a {}",
            merge_kind, keep_kind
        )));
    }
    Ok(())
}

pub(crate) fn check_episode_open(id: Uuid, closed_at: Option<Option<DateTime<Utc>>>) -> Result<()> {
    match closed_at {
        None => Err(FactlineError::NotFound { kind: "episode", id }),
        Some(Some(_)) => Err(FactlineError::ClosedEpisode(id)),
        Some(None) => Ok(()),
    }
}
