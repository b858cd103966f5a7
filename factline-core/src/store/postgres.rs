//! Postgres backend (sqlx).
//!
//! Plain appends are single inserts. Everything that guards an invariant
//! (supersession, episode-tagged inserts, close, retract, merge) runs in one
//! transaction and takes `FOR UPDATE` locks on the rows it checks.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgConnection, PgPool};
use uuid::Uuid;

use super::{check_episode_open, check_merge, check_supersede, TemporalStore};
use crate::config::DatabaseConfig;
use crate::db;
use crate::error::{FactlineError, Result};
use crate::models::entity::EntityRow;
use crate::models::episode::EpisodeRow;
use crate::models::{Entity, EntityKind, Episode, Fact};

const FACT_COLUMNS: &str = "id, subject_id, subject_raw, predicate, object_id, object_raw, \
     confidence, valid_from, valid_to, source, episode_id, recorded_by, recorded_at";

const EPISODE_COLUMNS: &str =
    "id, source, occurred_at, recorded_by, created_at, closed_at, retracted_at";

#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connect and make sure the schema exists.
    pub async fn connect(config: &DatabaseConfig) -> Result<Self> {
        let pool = db::create_pool(config).await?;
        db::apply_schema(&pool).await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

async fn insert_fact_row(conn: &mut PgConnection, fact: &Fact) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO temporal_facts (
            id, subject_id, subject_raw, predicate, object_id, object_raw,
            confidence, valid_from, valid_to, source, episode_id, recorded_by, recorded_at
        ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
        "#,
    )
    .bind(fact.id)
    .bind(fact.subject_id)
    .bind(&fact.subject_raw)
    .bind(&fact.predicate)
    .bind(fact.object_id)
    .bind(&fact.object_raw)
    .bind(fact.confidence)
    .bind(fact.valid_from)
    .bind(fact.valid_to)
    .bind(&fact.source)
    .bind(fact.episode_id)
    .bind(&fact.recorded_by)
    .bind(fact.recorded_at)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

/// Lock the episode row and fail unless it exists and is open.
async fn lock_open_episode(conn: &mut PgConnection, episode_id: Uuid) -> Result<()> {
    let row: Option<(Option<DateTime<Utc>>,)> =
        sqlx::query_as("SELECT closed_at FROM episodes WHERE id = $1 FOR UPDATE")
            .bind(episode_id)
            .fetch_optional(&mut *conn)
            .await?;
    check_episode_open(episode_id, row.map(|r| r.0))
}

/// Append `fact_id` to the episode's ordered list. The episode row must be
/// locked by the caller.
async fn link_episode_fact(conn: &mut PgConnection, episode_id: Uuid, fact_id: Uuid) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO episode_facts (episode_id, position, fact_id)
        SELECT $1, COALESCE(MAX(position) + 1, 0), $2
        FROM episode_facts
        WHERE episode_id = $1
        "#,
    )
    .bind(episode_id)
    .bind(fact_id)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

async fn insert_with_episode(conn: &mut PgConnection, fact: &Fact) -> Result<()> {
    if let Some(episode_id) = fact.episode_id {
        lock_open_episode(conn, episode_id).await?;
        insert_fact_row(conn, fact).await?;
        link_episode_fact(conn, episode_id, fact.id).await?;
    } else {
        insert_fact_row(conn, fact).await?;
    }
    Ok(())
}

async fn episode_fact_ids(conn: &mut PgConnection, episode_id: Uuid) -> Result<Vec<Uuid>> {
    let ids: Vec<(Uuid,)> = sqlx::query_as(
        "SELECT fact_id FROM episode_facts WHERE episode_id = $1 ORDER BY position",
    )
    .bind(episode_id)
    .fetch_all(&mut *conn)
    .await?;
    Ok(ids.into_iter().map(|r| r.0).collect())
}

fn entity_from_row(row: EntityRow) -> Result<Entity> {
    Entity::try_from(row).map_err(FactlineError::Internal)
}

#[async_trait]
impl TemporalStore for PgStore {
    async fn insert_fact(&self, fact: &Fact) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        insert_with_episode(&mut *tx, fact).await?;
        tx.commit().await?;

        tracing::debug!(fact_id = %fact.id, predicate = %fact.predicate, "fact inserted");
        Ok(())
    }

    async fn supersede_fact(&self, old_id: Uuid, new_fact: &Fact) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        let old: Option<Fact> = sqlx::query_as(&format!(
            "SELECT {} FROM temporal_facts WHERE id = $1 FOR UPDATE",
            FACT_COLUMNS
        ))
        .bind(old_id)
        .fetch_optional(&mut *tx)
        .await?;
        check_supersede(old_id, old.as_ref(), new_fact)?;

        sqlx::query("UPDATE temporal_facts SET valid_to = $1 WHERE id = $2")
            .bind(new_fact.valid_from)
            .bind(old_id)
            .execute(&mut *tx)
            .await?;
        insert_with_episode(&mut *tx, new_fact).await?;

        // Dropping `tx` on any `?` above rolls both halves back.
        tx.commit().await?;

        tracing::debug!(old = %old_id, new = %new_fact.id, "fact superseded");
        Ok(())
    }

    async fn get_fact(&self, id: Uuid) -> Result<Option<Fact>> {
        let fact = sqlx::query_as(&format!(
            "SELECT {} FROM temporal_facts WHERE id = $1",
            FACT_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(fact)
    }

    async fn facts_touching(
        &self,
        entity_ids: &[Uuid],
        as_of: Option<DateTime<Utc>>,
    ) -> Result<Vec<Fact>> {
        let facts = sqlx::query_as(&format!(
            r#"
            SELECT {}
            FROM temporal_facts
            WHERE (subject_id = ANY($1) OR object_id = ANY($1))
              AND ($2::timestamptz IS NULL
                   OR (valid_from <= $2 AND (valid_to IS NULL OR valid_to > $2)))
            ORDER BY valid_from DESC, recorded_at DESC, id DESC
            "#,
            FACT_COLUMNS
        ))
        .bind(entity_ids)
        .bind(as_of)
        .fetch_all(&self.pool)
        .await?;
        Ok(facts)
    }

    async fn count_facts_touching(&self, entity_ids: &[Uuid]) -> Result<u64> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM temporal_facts WHERE subject_id = ANY($1) OR object_id = ANY($1)",
        )
        .bind(entity_ids)
        .fetch_one(&self.pool)
        .await?;
        Ok(count.max(0) as u64)
    }

    async fn insert_entity(&self, entity: &Entity, normalized: &str) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            r#"
            INSERT INTO entities (id, canonical_name, kind, redirect_to, created_at)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(entity.id)
        .bind(&entity.canonical_name)
        .bind(entity.kind.as_str())
        .bind(entity.redirect_to)
        .bind(entity.created_at)
        .execute(&mut *tx)
        .await?;

        for alias in &entity.aliases {
            sqlx::query(
                "INSERT INTO entity_aliases (entity_id, alias, normalized, kind) VALUES ($1, $2, $3, $4)",
            )
            .bind(entity.id)
            .bind(alias)
            .bind(normalized)
            .bind(entity.kind.as_str())
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn get_entity(&self, id: Uuid) -> Result<Option<Entity>> {
        let row: Option<EntityRow> = sqlx::query_as(
            r#"
            SELECT e.id, e.canonical_name, e.kind, e.redirect_to, e.created_at,
                   COALESCE(
                       array_agg(a.alias ORDER BY a.alias) FILTER (WHERE a.alias IS NOT NULL),
                       '{}'::text[]
                   ) AS aliases
            FROM entities e
            LEFT JOIN entity_aliases a ON a.entity_id = e.id
            WHERE e.id = $1
            GROUP BY e.id
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(entity_from_row).transpose()
    }

    async fn find_by_alias(&self, kind: EntityKind, alias: &str) -> Result<Vec<Uuid>> {
        let ids: Vec<(Uuid,)> = sqlx::query_as(
            "SELECT DISTINCT entity_id FROM entity_aliases WHERE kind = $1 AND alias = $2",
        )
        .bind(kind.as_str())
        .bind(alias)
        .fetch_all(&self.pool)
        .await?;
        Ok(ids.into_iter().map(|r| r.0).collect())
    }

    async fn find_by_normalized(&self, kind: EntityKind, normalized: &str) -> Result<Vec<Uuid>> {
        let ids: Vec<(Uuid,)> = sqlx::query_as(
            "SELECT DISTINCT entity_id FROM entity_aliases WHERE kind = $1 AND normalized = $2",
        )
        .bind(kind.as_str())
        .bind(normalized)
        .fetch_all(&self.pool)
        .await?;
        Ok(ids.into_iter().map(|r| r.0).collect())
    }

    async fn add_alias(&self, entity_id: Uuid, alias: &str, normalized: &str) -> Result<()> {
        let result = sqlx::query(
            r#"
            INSERT INTO entity_aliases (entity_id, alias, normalized, kind)
            SELECT id, $2, $3, kind FROM entities WHERE id = $1
            ON CONFLICT (entity_id, alias) DO NOTHING
            "#,
        )
        .bind(entity_id)
        .bind(alias)
        .bind(normalized)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 && self.get_entity(entity_id).await?.is_none() {
            return Err(FactlineError::NotFound { kind: "entity", id: entity_id });
        }
        Ok(())
    }

    async fn redirected_to(&self, id: Uuid) -> Result<Vec<Uuid>> {
        let ids: Vec<(Uuid,)> =
            sqlx::query_as("SELECT id FROM entities WHERE redirect_to = $1 ORDER BY id")
                .bind(id)
                .fetch_all(&self.pool)
                .await?;
        Ok(ids.into_iter().map(|r| r.0).collect())
    }

    async fn merge_entities(&self, keep: Uuid, merge: Uuid) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        // Lock both rows in id order so concurrent merges of the same pair
        // serialize instead of deadlocking or forming a redirect cycle.
        let rows: Vec<(Uuid, String, Option<Uuid>)> = sqlx::query_as(
            "SELECT id, kind, redirect_to FROM entities WHERE id = ANY($1) ORDER BY id FOR UPDATE",
        )
        .bind(vec![keep, merge])
        .fetch_all(&mut *tx)
        .await?;

        let row = |id: Uuid| -> Result<Option<(EntityKind, Option<Uuid>)>> {
            rows.iter()
                .find(|r| r.0 == id)
                .map(|r| {
                    r.1.parse::<EntityKind>()
                        .map(|kind| (kind, r.2))
                        .map_err(FactlineError::Internal)
                })
                .transpose()
        };
        check_merge(keep, merge, row(keep)?, row(merge)?)?;

        sqlx::query(
            r#"
            INSERT INTO entity_aliases (entity_id, alias, normalized, kind)
            SELECT $1, alias, normalized, kind FROM entity_aliases WHERE entity_id = $2
            ON CONFLICT (entity_id, alias) DO NOTHING
            "#,
        )
        .bind(keep)
        .bind(merge)
        .execute(&mut *tx)
        .await?;

        sqlx::query("DELETE FROM entity_aliases WHERE entity_id = $1")
            .bind(merge)
            .execute(&mut *tx)
            .await?;

        sqlx::query("UPDATE entities SET redirect_to = $1 WHERE id = $2 OR redirect_to = $2")
            .bind(keep)
            .bind(merge)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn insert_episode(&self, episode: &Episode) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO episodes (id, source, occurred_at, recorded_by, created_at, closed_at, retracted_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(episode.id)
        .bind(&episode.source)
        .bind(episode.occurred_at)
        .bind(&episode.recorded_by)
        .bind(episode.created_at)
        .bind(episode.closed_at)
        .bind(episode.retracted_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_episode(&self, id: Uuid) -> Result<Option<Episode>> {
        let mut conn = self.pool.acquire().await?;
        let row: Option<EpisodeRow> = sqlx::query_as(&format!(
            "SELECT {} FROM episodes WHERE id = $1",
            EPISODE_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&mut *conn)
        .await?;

        match row {
            Some(row) => {
                let fact_ids = episode_fact_ids(&mut *conn, id).await?;
                Ok(Some(row.with_facts(fact_ids)))
            }
            None => Ok(None),
        }
    }

    async fn close_episode(&self, id: Uuid, at: DateTime<Utc>) -> Result<Episode> {
        let mut tx = self.pool.begin().await?;
        lock_open_episode(&mut *tx, id).await?;

        let row: EpisodeRow = sqlx::query_as(&format!(
            "UPDATE episodes SET closed_at = $2 WHERE id = $1 RETURNING {}",
            EPISODE_COLUMNS
        ))
        .bind(id)
        .bind(at)
        .fetch_one(&mut *tx)
        .await?;
        let fact_ids = episode_fact_ids(&mut *tx, id).await?;
        tx.commit().await?;

        Ok(row.with_facts(fact_ids))
    }

    async fn retract_episode(&self, id: Uuid, at: DateTime<Utc>) -> Result<Vec<Uuid>> {
        let mut tx = self.pool.begin().await?;

        let exists: Option<(Uuid,)> = sqlx::query_as("SELECT id FROM episodes WHERE id = $1 FOR UPDATE")
            .bind(id)
            .fetch_optional(&mut *tx)
            .await?;
        if exists.is_none() {
            return Err(FactlineError::NotFound { kind: "episode", id });
        }

        // The first retraction wins; it also closes an episode still open.
        sqlx::query(
            r#"
            UPDATE episodes
            SET retracted_at = COALESCE(retracted_at, $2),
                closed_at = COALESCE(closed_at, $2)
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(at)
        .execute(&mut *tx)
        .await?;

        let updated: Vec<(Uuid,)> = sqlx::query_as(
            r#"
            UPDATE temporal_facts
            SET valid_to = GREATEST($2, valid_from)
            WHERE valid_to IS NULL
              AND id IN (SELECT fact_id FROM episode_facts WHERE episode_id = $1)
            RETURNING id
            "#,
        )
        .bind(id)
        .bind(at)
        .fetch_all(&mut *tx)
        .await?;
        let order = episode_fact_ids(&mut *tx, id).await?;
        tx.commit().await?;

        let updated: std::collections::HashSet<Uuid> = updated.into_iter().map(|r| r.0).collect();
        Ok(order.into_iter().filter(|fid| updated.contains(fid)).collect())
    }

    async fn retracted_episodes(&self, episode_ids: &[Uuid]) -> Result<Vec<Uuid>> {
        let ids: Vec<(Uuid,)> = sqlx::query_as(
            "SELECT id FROM episodes WHERE id = ANY($1) AND retracted_at IS NOT NULL",
        )
        .bind(episode_ids)
        .fetch_all(&self.pool)
        .await?;
        Ok(ids.into_iter().map(|r| r.0).collect())
    }

    async fn health(&self) -> Result<String> {
        Ok(db::health_check(&self.pool).await?)
    }
}
