use crate::config::{Lookup, env_duration_millis, env_optional, env_string};
use std::str::FromStr;
use std::time::Duration;

/// Which [`DocumentStore`](super::DocumentStore) implementation backs the service.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum StoreBackend {
    #[default]
    Elasticsearch,
    Memory,
}

impl FromStr for StoreBackend {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "elasticsearch" | "es" => Ok(StoreBackend::Elasticsearch),
            "memory" | "in-memory" => Ok(StoreBackend::Memory),
            other => Err(format!("unknown store backend `{other}`")),
        }
    }
}

/// Connection settings for the document store.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub backend: StoreBackend,
    pub base_url: String,
    pub index: String,
    pub request_timeout: Duration,
    pub api_key: Option<String>,
}

impl StoreConfig {
    pub fn from_lookup(lookup: Lookup<'_>) -> Self {
        let backend = lookup("STORE_BACKEND")
            .and_then(|value| match value.parse::<StoreBackend>() {
                Ok(backend) => Some(backend),
                Err(err) => {
                    log::warn!("{err}; falling back to elasticsearch");
                    None
                }
            })
            .unwrap_or_default();

        Self {
            backend,
            base_url: env_string(lookup, "ELASTICSEARCH_URL", "http://localhost:9200"),
            index: env_string(lookup, "ELASTICSEARCH_INDEX", "emails"),
            request_timeout: env_duration_millis(lookup, "ELASTICSEARCH_TIMEOUT_MS", 30_000),
            api_key: env_optional(lookup, "ELASTICSEARCH_API_KEY"),
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::Elasticsearch,
            base_url: "http://localhost:9200".to_string(),
            index: "emails".to_string(),
            request_timeout: Duration::from_secs(30),
            api_key: None,
        }
    }
}
