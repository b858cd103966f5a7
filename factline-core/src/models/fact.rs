use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::entity::EntityKind;

/// A time-scoped assertion `subject predicate object`.
///
/// Rows are append-only: once stored, only `valid_to` may change, and only
/// from unset to set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Fact {
    pub id: Uuid,
    pub subject_id: Uuid,
    pub subject_raw: String,
    pub predicate: String,
    pub object_id: Uuid,
    pub object_raw: String,
    pub confidence: f64,
    pub valid_from: DateTime<Utc>,
    pub valid_to: Option<DateTime<Utc>>,
    pub source: String,
    pub episode_id: Option<Uuid>,
    pub recorded_by: Option<String>,
    pub recorded_at: DateTime<Utc>,
}

impl Fact {
    /// Valid-time membership: `valid_from <= at < valid_to`.
    pub fn is_valid_at(&self, at: DateTime<Utc>) -> bool {
        self.valid_from <= at && self.valid_to.map_or(true, |to| to > at)
    }

    pub fn touches(&self, entity_id: Uuid) -> bool {
        self.subject_id == entity_id || self.object_id == entity_id
    }
}

/// Caller-facing write shape: raw names, resolved by the entity resolver
/// before anything is persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FactInput {
    pub subject: String,
    #[serde(default)]
    pub subject_kind: EntityKind,
    pub predicate: String,
    pub object: String,
    #[serde(default)]
    pub object_kind: EntityKind,
    pub confidence: f64,
    /// Defaults to the time of the write.
    #[serde(default)]
    pub valid_from: Option<DateTime<Utc>>,
    pub source: String,
    #[serde(default)]
    pub recorded_by: Option<String>,
}

/// A fully resolved fact awaiting `id` and `recorded_at` from the fact store.
#[derive(Debug, Clone, PartialEq)]
pub struct NewFact {
    pub subject_id: Uuid,
    pub subject_raw: String,
    pub predicate: String,
    pub object_id: Uuid,
    pub object_raw: String,
    pub confidence: f64,
    pub valid_from: DateTime<Utc>,
    pub source: String,
    pub episode_id: Option<Uuid>,
    pub recorded_by: Option<String>,
}

impl NewFact {
    pub(crate) fn into_fact(self, id: Uuid, recorded_at: DateTime<Utc>) -> Fact {
        Fact {
            id,
            subject_id: self.subject_id,
            subject_raw: self.subject_raw,
            predicate: self.predicate,
            object_id: self.object_id,
            object_raw: self.object_raw,
            confidence: self.confidence,
            valid_from: self.valid_from,
            valid_to: None,
            source: self.source,
            episode_id: self.episode_id,
            recorded_by: self.recorded_by,
            recorded_at,
        }
    }
}

/// A fact as believed at some instant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoredFact {
    #[serde(flatten)]
    pub fact: Fact,
    pub effective_confidence: f64,
    /// Earlier observations of the same triple backing this fact.
    pub corroborations: usize,
}

/// Difference between the believed state of an entity at two instants.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BeliefChanges {
    pub entity_id: Uuid,
    pub from: DateTime<Utc>,
    pub to: DateTime<Utc>,
    pub added: Vec<ScoredFact>,
    pub removed: Vec<ScoredFact>,
}
