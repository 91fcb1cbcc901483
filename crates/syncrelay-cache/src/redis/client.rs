//! Redis connection management.

use redis::Client;
use redis::aio::{ConnectionManager, PubSub};
use tracing::info;

use syncrelay_core::config::RedisBusConfig;
use syncrelay_core::error::{AppError, ErrorKind};
use syncrelay_core::result::AppResult;

/// Redis client wrapper with connection management.
///
/// Commands share one reconnecting [`ConnectionManager`]; each subscription
/// opens its own dedicated pub/sub connection from the retained [`Client`].
#[derive(Debug, Clone)]
pub struct RedisClient {
    /// Client used to open pub/sub connections.
    client: Client,
    /// Redis connection manager (pooled, reconnecting).
    conn: ConnectionManager,
    /// Key prefix for all keys.
    key_prefix: String,
}

impl RedisClient {
    /// Create a new Redis client from configuration.
    pub async fn connect(config: &RedisBusConfig) -> AppResult<Self> {
        info!(url = %mask_redis_url(&config.url), "Connecting to Redis");

        let client = Client::open(config.url.as_str()).map_err(|e| {
            AppError::with_source(ErrorKind::BusUnavailable, "Failed to create Redis client", e)
        })?;

        let conn = ConnectionManager::new(client.clone()).await.map_err(|e| {
            AppError::with_source(ErrorKind::BusUnavailable, "Failed to connect to Redis", e)
        })?;

        info!("Successfully connected to Redis");
        Ok(Self {
            client,
            conn,
            key_prefix: config.key_prefix.clone(),
        })
    }

    /// Get a mutable clone of the connection manager.
    pub fn conn_mut(&self) -> ConnectionManager {
        self.conn.clone()
    }

    /// Open a dedicated pub/sub connection.
    pub async fn pubsub(&self) -> AppResult<PubSub> {
        self.client.get_async_pubsub().await.map_err(|e| {
            AppError::with_source(
                ErrorKind::BusUnavailable,
                "Failed to open Redis pub/sub connection",
                e,
            )
        })
    }

    /// Return the key prefix.
    pub fn prefix(&self) -> &str {
        &self.key_prefix
    }
}

/// Map a Redis error on the bus path.
pub(crate) fn bus_err(e: redis::RedisError) -> AppError {
    AppError::with_source(ErrorKind::BusUnavailable, format!("Redis error: {e}"), e)
}

/// Map a Redis error on the presence or offline-queue path.
pub(crate) fn storage_err(e: redis::RedisError) -> AppError {
    AppError::with_source(ErrorKind::Storage, format!("Redis error: {e}"), e)
}

/// Mask password in Redis URL for safe logging.
pub fn mask_redis_url(url: &str) -> String {
    if let Some(at_pos) = url.find('@') {
        if let Some(colon_pos) = url[..at_pos].rfind(':') {
            let scheme_end = url.find("://").map(|p| p + 3).unwrap_or(0);
            if colon_pos > scheme_end {
                return format!("{}:****@{}", &url[..colon_pos], &url[at_pos + 1..]);
            }
        }
    }
    url.to_string()
}
