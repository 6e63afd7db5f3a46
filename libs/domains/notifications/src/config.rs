use core_config::{ConfigError, FromEnv, env_parse, env_parse_opt};
use std::time::Duration;

/// Delivery confirmation settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryConfirmationConfig {
    /// Lifetime of a pending delivery; expiry counts as failure
    pub ttl: Duration,
    /// How long the dispatcher waits for the client to confirm.
    /// `None` publishes and moves on.
    pub wait: Option<Duration>,
    pub poll_interval: Duration,
}

impl Default for DeliveryConfirmationConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(60),
            wait: None,
            poll_interval: Duration::from_millis(250),
        }
    }
}

impl DeliveryConfirmationConfig {
    pub fn with_wait(mut self, wait: Duration) -> Self {
        self.wait = Some(wait);
        self
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// A pending entry that vanishes inside the wait window was confirmed,
    /// not expired, only while the window is shorter than the TTL.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.ttl.is_zero() {
            return Err(ConfigError::Invalid {
                key: "DELIVERY_CONFIRMATION_TTL_SECONDS".to_string(),
                details: "must be greater than zero".to_string(),
            });
        }
        if let Some(wait) = self.wait {
            if wait >= self.ttl {
                return Err(ConfigError::Invalid {
                    key: "DELIVERY_CONFIRMATION_WAIT_MS".to_string(),
                    details: format!("must be below the TTL of {}s", self.ttl.as_secs()),
                });
            }
        }
        if self.poll_interval.is_zero() {
            return Err(ConfigError::Invalid {
                key: "DELIVERY_CONFIRMATION_POLL_MS".to_string(),
                details: "must be greater than zero".to_string(),
            });
        }
        Ok(())
    }
}

impl FromEnv for DeliveryConfirmationConfig {
    fn from_env() -> Result<Self, ConfigError> {
        let config = Self {
            ttl: Duration::from_secs(env_parse("DELIVERY_CONFIRMATION_TTL_SECONDS", 60u64)?),
            wait: env_parse_opt::<u64>("DELIVERY_CONFIRMATION_WAIT_MS")?.map(Duration::from_millis),
            poll_interval: Duration::from_millis(env_parse("DELIVERY_CONFIRMATION_POLL_MS", 250u64)?),
        };
        config.validate()?;
        Ok(config)
    }
}
