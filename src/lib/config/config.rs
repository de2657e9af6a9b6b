use std::{path::Path, time::Duration};

use ::config::{Environment, File};

use super::types::{AppConfig, ConfigError, StoreBackend};

const DEFAULT_FILE: &str = "cubelet.toml";
const ENV_PREFIX: &str = "CUBELET";
const LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

impl AppConfig {
    /// Defaults, then the TOML file, then `CUBELET__SECTION__KEY` variables.
    /// An explicit `path` must exist; the default file is optional.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let file = match path {
            Some(path) => File::from(path).required(true),
            None => File::with_name(DEFAULT_FILE).required(false),
        };

        let config: AppConfig = ::config::Config::builder()
            .add_source(file)
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server.port == 0 {
            return Err(ConfigError::Invalid("server.port must be non-zero".into()));
        }
        if self.worker.idle_interval_secs == 0 {
            return Err(ConfigError::Invalid(
                "worker.idle_interval_secs must be non-zero".into(),
            ));
        }
        if self.scheduler.enabled && self.scheduler.poll_interval_secs == 0 {
            return Err(ConfigError::Invalid(
                "scheduler.poll_interval_secs must be non-zero".into(),
            ));
        }
        if self.runtime.call_timeout_secs == 0 || self.runtime.pull_timeout_secs == 0 {
            return Err(ConfigError::Invalid("runtime timeouts must be non-zero".into()));
        }
        if self.store.backend != StoreBackend::Memory && self.store.path.trim().is_empty() {
            return Err(ConfigError::Invalid(format!(
                "store.path is required for the {:?} backend",
                self.store.backend
            )));
        }
        if !LOG_LEVELS.contains(&self.log.level.to_lowercase().as_str()) {
            return Err(ConfigError::Invalid(format!(
                "unknown log level: {}",
                self.log.level
            )));
        }
        Ok(())
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.server.address, self.server.port)
    }

    pub fn idle_interval(&self) -> Duration {
        Duration::from_secs(self.worker.idle_interval_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.scheduler.poll_interval_secs)
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.runtime.call_timeout_secs)
    }

    pub fn pull_timeout(&self) -> Duration {
        Duration::from_secs(self.runtime.pull_timeout_secs)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.server.shutdown_grace_secs)
    }
}
