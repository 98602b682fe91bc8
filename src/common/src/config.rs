use std::time::Duration;

use serde::{Deserialize, Serialize};

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};

/// Connection parameters for the relational store.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RelationalConfig {
    /// PostgreSQL DSN.
    pub dsn: String,
}

impl Default for RelationalConfig {
    fn default() -> Self {
        Self {
            dsn: String::from("postgres://localhost:5432/crowd"),
        }
    }
}

/// Connection parameters for the document search store.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SearchConfig {
    /// Base URL of the Elasticsearch cluster.
    pub url: String,
    /// Per-call HTTP timeout.
    #[serde(with = "humantime_serde")]
    pub request_timeout: Duration,
    /// Interval between async-task status checks.
    #[serde(with = "humantime_serde")]
    pub task_poll_interval: Duration,
    /// Maximum total wait for one async update task.
    #[serde(with = "humantime_serde")]
    pub task_max_wait: Duration,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            url: String::from("http://localhost:9200"),
            request_timeout: Duration::from_secs(30),
            task_poll_interval: Duration::from_secs(5),
            task_max_wait: Duration::from_secs(600),
        }
    }
}

/// Connection parameters for the columnar analytics store.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AnalyticsConfig {
    /// Base URL of the ClickHouse HTTP interface.
    pub url: String,
    pub username: String,
    pub password: String,
    /// Per-statement HTTP timeout.
    #[serde(with = "humantime_serde")]
    pub request_timeout: Duration,
}

impl Default for AnalyticsConfig {
    fn default() -> Self {
        Self {
            url: String::from("http://localhost:8123"),
            username: String::from("default"),
            password: String::new(),
            request_timeout: Duration::from_secs(60),
        }
    }
}

/// Knobs for the masking run itself.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MaskingConfig {
    /// Width of the bounded worker pool for search/analytics work.
    pub worker_width: usize,
    /// Below this many resolved partitions the discovery sweep runs.
    pub discovery_threshold: usize,
    /// How many enumerated partitions discovery probes (prefix sample).
    pub discovery_sample: usize,
    /// Partitions swept unconditionally, independent of resolution results.
    pub fallback_partitions: Vec<String>,
}

impl Default for MaskingConfig {
    fn default() -> Self {
        Self {
            worker_width: 4,
            discovery_threshold: 3,
            discovery_sample: 10,
            fallback_partitions: vec![String::from("unit-metrics")],
        }
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Configuration {
    pub relational: RelationalConfig,
    pub search: SearchConfig,
    pub analytics: AnalyticsConfig,
    pub masking: MaskingConfig,
}

impl Configuration {
    /// Resolution order: hardcoded defaults, then `datascrub.toml`, then
    /// `DATASCRUB__`-prefixed environment variables. Every field has a
    /// default, so missing configuration never hard-fails.
    pub fn load() -> Result<Self, Box<figment::Error>> {
        Self::load_from(Toml::file("datascrub.toml"))
    }

    /// Same resolution order, with an explicit file path.
    pub fn load_path(path: &std::path::Path) -> Result<Self, Box<figment::Error>> {
        Self::load_from(Toml::file(path))
    }

    pub fn load_from<P>(file: P) -> Result<Self, Box<figment::Error>>
    where
        P: figment::Provider,
    {
        let config = Figment::from(Serialized::defaults(Configuration::default()))
            .merge(file)
            .merge(Env::prefixed("DATASCRUB__").split("__"))
            .extract()
            .map_err(Box::new)?;

        Ok(config)
    }
}
