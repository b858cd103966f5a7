use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::FactlineError;
use crate::models::{EntityKind, FactInput};

pub const PROTOCOL_VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum FactlineRequest {
    Ping,
    Health,
    Append {
        fact: FactInput,
    },
    Supersede {
        old_fact_id: Uuid,
        fact: FactInput,
    },
    GetFact {
        id: Uuid,
    },
    Resolve {
        name: String,
        #[serde(default)]
        kind: EntityKind,
    },
    Merge {
        keep_id: Uuid,
        merge_id: Uuid,
    },
    GetEntity {
        id: Uuid,
    },
    FactsForEntity {
        entity_id: Uuid,
        #[serde(default)]
        as_of: Option<DateTime<Utc>>,
    },
    Current {
        entity_id: Uuid,
    },
    History {
        entity_id: Uuid,
    },
    AsOf {
        entity_id: Uuid,
        at: DateTime<Utc>,
    },
    Changes {
        entity_id: Uuid,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    },
    BeginEpisode {
        source: String,
        #[serde(default)]
        occurred_at: Option<DateTime<Utc>>,
        #[serde(default)]
        recorded_by: Option<String>,
    },
    RecordFact {
        episode_id: Uuid,
        fact: FactInput,
    },
    RecordSuperseding {
        episode_id: Uuid,
        old_fact_id: Uuid,
        fact: FactInput,
    },
    CloseEpisode {
        episode_id: Uuid,
    },
    GetEpisode {
        episode_id: Uuid,
    },
    RetractEpisode {
        episode_id: Uuid,
    },
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct FactlineResponse {
    pub status: String,
    pub data: Option<serde_json::Value>,
    pub error: Option<String>,
    /// `FactlineError::kind()` of the failure, for status mapping.
    #[serde(default)]
    pub error_kind: Option<String>,
    pub version: String,
}

impl FactlineResponse {
    pub fn ok(data: serde_json::Value) -> Self {
        Self {
            status: "ok".to_string(),
            data: Some(data),
            error: None,
            error_kind: None,
            version: PROTOCOL_VERSION.to_string(),
        }
    }

    /// Error without a domain kind, e.g. an undecodable frame.
    pub fn err(msg: impl Into<String>) -> Self {
        Self {
            status: "error".to_string(),
            data: None,
            error: Some(msg.into()),
            error_kind: Some("internal".to_string()),
            version: PROTOCOL_VERSION.to_string(),
        }
    }

    pub fn from_error(e: &FactlineError) -> Self {
        Self {
            error_kind: Some(e.kind().to_string()),
            ..Self::err(e.to_string())
        }
    }

    pub fn pong() -> Self {
        Self::ok(serde_json::json!({"pong": true}))
    }

    pub fn is_ok(&self) -> bool {
        self.status == "ok"
    }
}
