use thiserror::Error;
use uuid::Uuid;

pub type Result<T> = std::result::Result<T, FactlineError>;

#[derive(Error, Debug)]
pub enum FactlineError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: Uuid },

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Episode {0} is closed")]
    ClosedEpisode(Uuid),

    #[error("Storage unavailable after {attempts} attempts: {reason}")]
    StorageUnavailable { attempts: usize, reason: String },

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Config error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("IPC error: {0}")]
    Ipc(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl FactlineError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }

    /// Stable machine-readable tag carried by IPC responses and mapped to
    /// HTTP status codes by the server.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation",
            Self::NotFound { .. } => "not_found",
            Self::Conflict(_) => "conflict",
            Self::ClosedEpisode(_) => "closed_episode",
            Self::StorageUnavailable { .. } => "storage_unavailable",
            Self::Database(_) | Self::Config(_) | Self::Io(_) | Self::Ipc(_) | Self::Internal(_) => {
                "internal"
            }
        }
    }

    /// Infrastructure failures worth retrying with backoff. Domain errors
    /// never are.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Database(e) => is_transient_sqlx(e),
            Self::Io(_) => true,
            _ => false,
        }
    }
}

fn is_transient_sqlx(e: &sqlx::Error) -> bool {
    match e {
        sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut => true,
        sqlx::Error::Database(db) => db.code().is_some_and(|code| {
            // 08xxx connection exception, 53xxx insufficient resources,
            // 57P0x operator intervention, serialization failure, deadlock
            code.starts_with("08")
                || code.starts_with("53")
                || code.starts_with("57P0")
                || code == "40001"
                || code == "40P01"
        }),
        _ => false,
    }
}
