use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Person,
    Company,
    Skill,
    Industry,
    Location,
    Role,
    #[default]
    Other,
}

impl EntityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Person => "person",
            Self::Company => "company",
            Self::Skill => "skill",
            Self::Industry => "industry",
            Self::Location => "location",
            Self::Role => "role",
            Self::Other => "other",
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "person" => Ok(Self::Person),
            "company" => Ok(Self::Company),
            "skill" => Ok(Self::Skill),
            "industry" => Ok(Self::Industry),
            "location" => Ok(Self::Location),
            "role" => Ok(Self::Role),
            "other" => Ok(Self::Other),
            other => Err(format!("unknown entity kind '{}'", other)),
        }
    }
}

/// Canonical node for a subject or object. A merged entity keeps its row
/// with `redirect_to` pointing at the survivor and an empty alias set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    pub id: Uuid,
    pub canonical_name: String,
    pub kind: EntityKind,
    pub aliases: BTreeSet<String>,
    pub redirect_to: Option<Uuid>,
    pub created_at: DateTime<Utc>,
}

impl Entity {
    pub fn new(canonical_name: impl Into<String>, kind: EntityKind, created_at: DateTime<Utc>) -> Self {
        let canonical_name = canonical_name.into();
        let mut aliases = BTreeSet::new();
        aliases.insert(canonical_name.clone());
        Self {
            id: Uuid::new_v4(),
            canonical_name,
            kind,
            aliases,
            redirect_to: None,
            created_at,
        }
    }

    pub fn is_redirect(&self) -> bool {
        self.redirect_to.is_some()
    }
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub(crate) struct EntityRow {
    pub id: Uuid,
    pub canonical_name: String,
    pub kind: String,
    pub redirect_to: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub aliases: Vec<String>,
}

impl TryFrom<EntityRow> for Entity {
    type Error = String;

    fn try_from(row: EntityRow) -> Result<Self, Self::Error> {
        Ok(Self {
            id: row.id,
            canonical_name: row.canonical_name,
            kind: row.kind.parse()?,
            aliases: row.aliases.into_iter().collect(),
            redirect_to: row.redirect_to,
            created_at: row.created_at,
        })
    }
}

/// How `resolve` arrived at an entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchKind {
    Exact,
    Normalized,
    Created,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Resolution {
    pub entity_id: Uuid,
    pub matched_by: MatchKind,
}
