pub mod clock;
pub mod confidence;
pub mod config;
pub mod db;
pub mod episode;
pub mod error;
pub mod events;
pub mod facts;
pub mod ipc;
pub mod models;
pub mod query;
pub mod resolver;
pub mod service;
pub mod store;

pub use clock::{Clock, ManualClock, SystemClock};
pub use confidence::ConfidenceEngine;
pub use config::FactlineConfig;
pub use episode::EpisodeRecorder;
pub use error::{FactlineError, Result};
pub use events::{EventBus, FactEvent};
pub use facts::FactStore;
pub use query::TemporalQueryEngine;
pub use resolver::{EntityResolver, Normalizer};
pub use service::TemporalMemory;
pub use store::{MemoryStore, PgStore, RetryPolicy, TemporalStore};
