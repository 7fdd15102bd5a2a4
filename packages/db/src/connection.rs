//! Store connection management.

use std::sync::Arc;

use queue_core::QueueError;
use thiserror::Error;

use crate::MemoryStore;
use crate::store::Store;

/// Store configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreConfig {
    /// Connection endpoint: "mem://" or "redis://host:port/db"
    pub endpoint: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            endpoint: "mem://".to_string(),
        }
    }
}

impl StoreConfig {
    /// Create a config for in-memory testing.
    pub fn memory() -> Self {
        Self::default()
    }

    /// Create a config for a Redis server (requires the `redis` feature).
    pub fn redis(url: impl Into<String>) -> Self {
        Self {
            endpoint: url.into(),
        }
    }

    /// Read the endpoint from `HOTQUEUE_STORE_URL`, defaulting to memory.
    pub fn from_env() -> Self {
        std::env::var("HOTQUEUE_STORE_URL")
            .map(|endpoint| Self { endpoint })
            .unwrap_or_default()
    }

    fn is_memory(&self) -> bool {
        self.endpoint == "mem://" || self.endpoint == "memory"
    }
}

/// Store errors.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Connection error: {0}")]
    Connection(String),
    #[error("Command error: {0}")]
    Command(String),
    #[error("Store connection closed")]
    Closed,
    #[error("Unsupported endpoint: {0}")]
    UnsupportedEndpoint(String),
}

impl From<StoreError> for QueueError {
    fn from(err: StoreError) -> Self {
        QueueError::Database(err.to_string())
    }
}

#[cfg(feature = "redis")]
impl From<redis::RedisError> for StoreError {
    fn from(err: redis::RedisError) -> Self {
        if err.is_connection_dropped() || err.is_connection_refusal() || err.is_io_error() {
            StoreError::Connection(err.to_string())
        } else {
            StoreError::Command(err.to_string())
        }
    }
}

/// Open a store for the configured endpoint.
pub async fn connect(config: &StoreConfig) -> Result<Arc<dyn Store>, StoreError> {
    tracing::info!("Connecting to store: {}", config.endpoint);

    let store: Arc<dyn Store> = if config.is_memory() {
        Arc::new(MemoryStore::new())
    } else if config.endpoint.starts_with("redis://") || config.endpoint.starts_with("rediss://") {
        open_redis(&config.endpoint).await?
    } else {
        return Err(StoreError::UnsupportedEndpoint(config.endpoint.clone()));
    };

    store.ping().await?;
    tracing::info!("Connected to store: {}", config.endpoint);
    Ok(store)
}

#[cfg(feature = "redis")]
async fn open_redis(endpoint: &str) -> Result<Arc<dyn Store>, StoreError> {
    Ok(Arc::new(crate::RedisStore::open(endpoint)?))
}

#[cfg(not(feature = "redis"))]
async fn open_redis(endpoint: &str) -> Result<Arc<dyn Store>, StoreError> {
    Err(StoreError::UnsupportedEndpoint(format!(
        "{} (built without the redis feature)",
        endpoint
    )))
}
