//! Application configuration schemas.
//!
//! All configuration structs are deserialized via the `config` crate from
//! TOML files plus `SYNCRELAY__*` environment variables. Each sub-module
//! represents a logical configuration section.

pub mod app;
pub mod auth;
pub mod bus;
pub mod logging;
pub mod rate_limit;
pub mod sync;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub use self::app::{CorsConfig, ServerConfig};
pub use self::auth::AuthConfig;
pub use self::bus::{BusConfig, RedisBusConfig};
pub use self::logging::LoggingConfig;
pub use self::rate_limit::{LimitRule, RateLimitConfig};
pub use self::sync::{OfflineConfig, SyncConfig};

use crate::error::AppError;

/// Environment variable prefix for overrides (`SYNCRELAY__SERVER__PORT=9000`).
pub const ENV_PREFIX: &str = "SYNCRELAY";

/// Root application configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// HTTP server settings.
    #[serde(default)]
    pub server: ServerConfig,
    /// Bearer-token settings.
    #[serde(default)]
    pub auth: AuthConfig,
    /// Shared bus, presence, and offline-queue backend settings.
    #[serde(default)]
    pub bus: BusConfig,
    /// Real-time sync engine settings.
    #[serde(default)]
    pub sync: SyncConfig,
    /// Admission-control settings.
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    /// Logging settings.
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl AppConfig {
    /// Load configuration.
    ///
    /// Merges `config/default.toml` (or `path` when given), the
    /// environment-specific overlay `config/{env}.toml`, and environment
    /// variables prefixed with `SYNCRELAY__`.
    pub fn load(path: Option<&str>, env: &str) -> Result<Self, AppError> {
        let base = path.unwrap_or("config/default");

        let config = config::Config::builder()
            .add_source(config::File::with_name(base).required(false))
            .add_source(config::File::with_name(&format!("config/{env}")).required(false))
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .map_err(|e| AppError::configuration(format!("Failed to build config: {e}")))?;

        let mut loaded: AppConfig = config
            .try_deserialize()
            .map_err(|e| AppError::configuration(format!("Failed to deserialize config: {e}")))?;

        loaded.ensure_instance_id();
        loaded.validate()?;
        Ok(loaded)
    }

    /// Assign a generated instance ID when none was configured.
    pub fn ensure_instance_id(&mut self) {
        if self.sync.instance_id.trim().is_empty() {
            self.sync.instance_id = format!("instance-{}", &Uuid::new_v4().simple().to_string()[..8]);
        }
    }

    /// Reject configurations the engine cannot run with.
    pub fn validate(&self) -> Result<(), AppError> {
        if self.sync.instance_id.trim().is_empty() {
            return Err(AppError::configuration("sync.instance_id must not be blank"));
        }
        if self.sync.max_connections == 0 {
            return Err(AppError::configuration("sync.max_connections must be > 0"));
        }
        if self.sync.outbound_buffer_size == 0 {
            return Err(AppError::configuration(
                "sync.outbound_buffer_size must be > 0",
            ));
        }
        for (name, rule) in [("ws", &self.rate_limit.ws), ("api", &self.rate_limit.api)] {
            if rule.max_requests == 0 || rule.window_seconds == 0 {
                return Err(AppError::configuration(format!(
                    "rate_limit.{name} requires max_requests > 0 and window_seconds > 0"
                )));
            }
        }
        if self.auth.jwt_secret.len() < 16 {
            return Err(AppError::configuration(
                "auth.jwt_secret must be at least 16 bytes",
            ));
        }
        Ok(())
    }
}
