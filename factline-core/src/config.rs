use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::collections::HashMap;

#[derive(Debug, Deserialize, Clone)]
pub struct FactlineConfig {
    pub service: ServiceConfig,
    pub database: DatabaseConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub confidence: ConfidenceConfig,
    #[serde(default)]
    pub query: QueryConfig,
    #[serde(default)]
    pub resolver: ResolverConfig,
    #[serde(default)]
    pub events: EventsConfig,
    #[serde(default)]
    pub http: HttpConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServiceConfig {
    pub socket_path: String,
    pub log_level: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    Postgres,
    Memory,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct StorageConfig {
    pub backend: BackendKind,
    pub retry_attempts: usize,
    pub retry_base_delay_ms: u64,
    pub retry_max_delay_ms: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::Postgres,
            retry_attempts: 3,
            retry_base_delay_ms: 50,
            retry_max_delay_ms: 2_000,
        }
    }
}

/// Decay rates are expressed per day.
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ConfidenceConfig {
    pub default_lambda: f64,
    #[serde(default)]
    pub lambdas: HashMap<String, f64>,
    pub reinforcement_step: f64,
    pub reinforcement_cap: f64,
}

impl Default for ConfidenceConfig {
    fn default() -> Self {
        Self {
            default_lambda: 0.001,
            lambdas: HashMap::new(),
            reinforcement_step: 0.05,
            reinforcement_cap: 0.15,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct QueryConfig {
    pub threshold: f64,
    #[serde(default)]
    pub multi_valued_predicates: Vec<String>,
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            threshold: 0.3,
            multi_valued_predicates: Vec::new(),
        }
    }
}

/// `synonyms` maps a canonical normalized form to the variants that should
/// resolve to it, e.g. `javascript = ["js", "ecmascript"]`.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct ResolverConfig {
    #[serde(default)]
    pub synonyms: HashMap<String, Vec<String>>,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct EventsConfig {
    pub capacity: usize,
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self { capacity: 256 }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct HttpConfig {
    pub enabled: bool,
    pub host: String,
    pub port: u16,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            host: "127.0.0.1".to_string(),
            port: 8766,
        }
    }
}

impl FactlineConfig {
    /// Load from a TOML file, overlaid by `FACTLINE__SECTION__KEY` env vars.
    pub fn load(path: &str) -> Result<Self, ConfigError> {
        let s = Config::builder()
            .add_source(File::with_name(path))
            .add_source(Environment::with_prefix("FACTLINE").separator("__"))
            .build()?;
        let config: Self = s.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Configuration for embedded use: in-memory backend, library defaults.
    pub fn in_memory() -> Self {
        Self {
            service: ServiceConfig {
                socket_path: "/tmp/factline.sock".to_string(),
                log_level: "info".to_string(),
            },
            database: DatabaseConfig {
                url: String::new(),
                max_connections: 1,
            },
            storage: StorageConfig {
                backend: BackendKind::Memory,
                ..StorageConfig::default()
            },
            confidence: ConfidenceConfig::default(),
            query: QueryConfig::default(),
            resolver: ResolverConfig::default(),
            events: EventsConfig::default(),
            http: HttpConfig::default(),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let c = &self.confidence;
        let lambdas_ok = c.default_lambda.is_finite()
            && c.default_lambda >= 0.0
            && c.lambdas.values().all(|l| l.is_finite() && *l >= 0.0);
        if !lambdas_ok {
            return Err(ConfigError::Message(
                "confidence: decay rates must be finite and non-negative".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&c.reinforcement_step) || !(0.0..=1.0).contains(&c.reinforcement_cap) {
            return Err(ConfigError::Message(
                "confidence: reinforcement step and cap must lie in [0, 1]".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.query.threshold) {
            return Err(ConfigError::Message(
                "query: threshold must lie in [0, 1]".to_string(),
            ));
        }
        if self.events.capacity == 0 {
            return Err(ConfigError::Message(
                "events: capacity must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_in_memory_defaults_validate() {
        let config = FactlineConfig::in_memory();
        assert!(config.validate().is_ok());
        assert_eq!(config.storage.backend, BackendKind::Memory);
        assert!((config.query.threshold - 0.3).abs() < f64::EPSILON);
    }

    #[test]
    fn test_negative_lambda_rejected() {
        let mut config = FactlineConfig::in_memory();
        config.confidence.lambdas.insert("has_skill".to_string(), -0.1);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_threshold_out_of_range_rejected() {
        let mut config = FactlineConfig::in_memory();
        config.query.threshold = 1.5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_from_toml() {
        let dir = std::env::temp_dir().join(format!("factline-config-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("factline.toml");
        std::fs::write(
            &path,
            r#"
[service]
socket_path = "/tmp/test.sock"
log_level = "debug"

[database]
url = "postgresql://localhost/factline"
max_connections = 4

[storage]
backend = "memory"
retry_attempts = 2
retry_base_delay_ms = 10
retry_max_delay_ms = 100

[confidence]
default_lambda = 0.002
reinforcement_step = 0.1
reinforcement_cap = 0.2

[confidence.lambdas]
industry = 0.0001

[resolver.synonyms]
javascript = ["js"]
"#,
        )
        .unwrap();

        let config = FactlineConfig::load(path.to_str().unwrap()).unwrap();
        assert_eq!(config.storage.backend, BackendKind::Memory);
        assert_eq!(config.storage.retry_attempts, 2);
        assert_eq!(config.confidence.lambdas.get("industry"), Some(&0.0001));
        assert_eq!(config.resolver.synonyms["javascript"], vec!["js".to_string()]);
        assert_eq!(config.http.port, 8766);

        std::fs::remove_dir_all(&dir).ok();
    }
}
