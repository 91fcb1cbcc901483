//! Backend selection from configuration.

use std::sync::Arc;

use tracing::info;

use syncrelay_core::config::BusConfig;
use syncrelay_core::error::AppError;
use syncrelay_core::result::AppResult;
use syncrelay_core::traits::{MessageBus, OfflineStore, PresenceStore};

/// The three shared backends the sync engine depends on.
///
/// All three come from the same provider so a Redis deployment uses one
/// server for fan-out, presence, and the offline queue.
#[derive(Debug, Clone)]
pub struct Backends {
    /// Cross-instance pub/sub transport.
    pub bus: Arc<dyn MessageBus>,
    /// Offline-delivery queue.
    pub offline: Arc<dyn OfflineStore>,
    /// Cluster presence.
    pub presence: Arc<dyn PresenceStore>,
}

impl Backends {
    /// Create the backends selected by `config.provider`.
    pub async fn from_config(config: &BusConfig) -> AppResult<Self> {
        match config.provider.as_str() {
            #[cfg(feature = "redis-backend")]
            "redis" => {
                info!("Initializing Redis bus, presence, and offline queue");
                let client = crate::redis::RedisClient::connect(&config.redis).await?;
                Ok(Self {
                    bus: Arc::new(crate::redis::RedisMessageBus::new(client.clone())),
                    offline: Arc::new(crate::redis::RedisOfflineStore::new(client.clone())),
                    presence: Arc::new(crate::redis::RedisPresenceStore::new(client)),
                })
            }
            #[cfg(feature = "memory")]
            "memory" => {
                info!("Initializing in-memory bus, presence, and offline queue");
                Ok(Self::in_memory(config.memory_buffer_size))
            }
            other => Err(AppError::configuration(format!(
                "Unknown bus provider: '{other}'. Supported: memory, redis"
            ))),
        }
    }

    /// Fresh in-memory backends.
    #[cfg(feature = "memory")]
    pub fn in_memory(buffer_size: usize) -> Self {
        Self {
            bus: Arc::new(crate::memory::MemoryMessageBus::new(buffer_size)),
            offline: Arc::new(crate::memory::MemoryOfflineStore::new()),
            presence: Arc::new(crate::memory::MemoryPresenceStore::new()),
        }
    }
}

#[cfg(all(test, feature = "memory"))]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_provider_selected() {
        let config = BusConfig::default();
        let backends = Backends::from_config(&config).await.expect("backends");
        assert_eq!(backends.bus.backend_name(), "memory");
    }

    #[tokio::test]
    async fn test_unknown_provider_rejected() {
        let config = BusConfig {
            provider: "kafka".to_string(),
            ..BusConfig::default()
        };
        let err = Backends::from_config(&config).await.unwrap_err();
        assert_eq!(err.kind, syncrelay_core::error::ErrorKind::Configuration);
    }
}
