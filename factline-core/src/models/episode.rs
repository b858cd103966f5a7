use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One ingestion event and the facts it produced, in recording order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Episode {
    pub id: Uuid,
    pub source: String,
    pub occurred_at: DateTime<Utc>,
    pub recorded_by: Option<String>,
    pub created_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
    /// Set by the first retraction. Facts of a retracted episode never
    /// corroborate other observations.
    #[serde(default)]
    pub retracted_at: Option<DateTime<Utc>>,
    pub fact_ids: Vec<Uuid>,
}

impl Episode {
    pub fn is_closed(&self) -> bool {
        self.closed_at.is_some()
    }

    pub fn is_retracted(&self) -> bool {
        self.retracted_at.is_some()
    }
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub(crate) struct EpisodeRow {
    pub id: Uuid,
    pub source: String,
    pub occurred_at: DateTime<Utc>,
    pub recorded_by: Option<String>,
    pub created_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
    pub retracted_at: Option<DateTime<Utc>>,
}

impl EpisodeRow {
    pub(crate) fn with_facts(self, fact_ids: Vec<Uuid>) -> Episode {
        Episode {
            id: self.id,
            source: self.source,
            occurred_at: self.occurred_at,
            recorded_by: self.recorded_by,
            created_at: self.created_at,
            closed_at: self.closed_at,
            retracted_at: self.retracted_at,
            fact_ids,
        }
    }
}
