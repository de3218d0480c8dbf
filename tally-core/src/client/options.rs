//! Client construction options.

use std::time::Duration;

use crate::config::ClientConfig;
use crate::delivery::BackoffPolicy;
use crate::enrich::DeviceContext;
use crate::error::{Error, Result};
use crate::types::Properties;

/// Options for one client instance.
#[derive(Debug, Clone)]
pub struct ClientOptions {
    /// Project token; also keys the persisted snapshot
    pub token: String,
    pub server_url: String,
    /// Zero disables periodic flushing
    pub flush_interval: Duration,
    pub flush_on_background: bool,
    pub show_network_activity_indicator: bool,
    pub batch_size: usize,
    pub max_queue_size: usize,
    /// Zero disables scheduled archiving
    pub archive_interval: Duration,
    /// Request timeout for the default HTTP transport
    pub timeout: Duration,
    pub backoff: BackoffPolicy,
    pub context: DeviceContext,
    /// Launch options; a recognized push payload is tracked at startup
    pub launch_payload: Option<Properties>,
}

impl ClientOptions {
    /// Options with library defaults for everything but token and server.
    pub fn new(token: impl Into<String>, server_url: impl Into<String>) -> Self {
        let defaults = ClientConfig::default();
        Self {
            token: token.into(),
            server_url: server_url.into(),
            flush_interval: defaults.flush_interval(),
            flush_on_background: defaults.flush_on_background,
            show_network_activity_indicator: defaults.show_network_activity_indicator,
            batch_size: defaults.batch_size,
            max_queue_size: defaults.max_queue_size,
            archive_interval: defaults.archive_interval(),
            timeout: defaults.timeout(),
            backoff: BackoffPolicy::from(&defaults.backoff),
            context: DeviceContext::detect(),
            launch_payload: None,
        }
    }

    /// Map the `[client]` config section to options.
    pub fn from_config(config: &ClientConfig) -> Result<Self> {
        config.validate()?;
        let token = config
            .token
            .clone()
            .ok_or_else(|| Error::Config("client.token is required".to_string()))?;

        Ok(Self {
            token,
            server_url: config.server_url.clone(),
            flush_interval: config.flush_interval(),
            flush_on_background: config.flush_on_background,
            show_network_activity_indicator: config.show_network_activity_indicator,
            batch_size: config.batch_size,
            max_queue_size: config.max_queue_size,
            archive_interval: config.archive_interval(),
            timeout: config.timeout(),
            backoff: BackoffPolicy::from(&config.backoff),
            context: DeviceContext::detect()
                .with_app(config.app_name.clone(), config.app_version.clone()),
            launch_payload: None,
        })
    }

    pub fn with_flush_interval(mut self, interval: Duration) -> Self {
        self.flush_interval = interval;
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_max_queue_size(mut self, max_queue_size: usize) -> Self {
        self.max_queue_size = max_queue_size;
        self
    }

    pub fn with_archive_interval(mut self, interval: Duration) -> Self {
        self.archive_interval = interval;
        self
    }

    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_launch_payload(mut self, payload: Properties) -> Self {
        self.launch_payload = Some(payload);
        self
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.token.trim().is_empty() {
            return Err(Error::Config("token must not be empty".to_string()));
        }
        if self.server_url.trim().is_empty() {
            return Err(Error::Config("server_url must not be empty".to_string()));
        }
        if self.batch_size == 0 {
            return Err(Error::Config("batch_size must be at least 1".to_string()));
        }
        if self.max_queue_size == 0 {
            return Err(Error::Config(
                "max_queue_size must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_config() {
        let config = ClientConfig {
            token: Some("tok".to_string()),
            flush_interval_secs: 15,
            app_version: Some("2.0".to_string()),
            ..Default::default()
        };
        let options = ClientOptions::from_config(&config).unwrap();
        assert_eq!(options.token, "tok");
        assert_eq!(options.flush_interval, Duration::from_secs(15));
        assert_eq!(options.context.app_version.as_deref(), Some("2.0"));
        assert!(options.validate().is_ok());
    }

    #[test]
    fn test_from_config_requires_token() {
        assert!(ClientOptions::from_config(&ClientConfig::default()).is_err());
    }

    #[test]
    fn test_validate() {
        assert!(ClientOptions::new("", "https://x").validate().is_err());
        assert!(ClientOptions::new("tok", "").validate().is_err());
        assert!(ClientOptions::new("tok", "https://x")
            .with_batch_size(0)
            .validate()
            .is_err());
    }
}
