//! Configuration consumed when connecting and when opening a session.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{LinkError, LinkResult};

pub const MIN_RETRY_COUNT: u32 = 1;
pub const MAX_RETRY_COUNT: u32 = 10;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ModelConfig {
    pub router_model: String,
    pub code_model: String,
    pub vision_model: String,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            router_model: "qwen-turbo".to_owned(),
            code_model: "qwen-max".to_owned(),
            vision_model: "qwen-vl-plus".to_owned(),
        }
    }
}

/// Session-scoped settings. Frozen once the peer acknowledges the session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SessionConfig {
    pub output_directory: String,
    pub max_retry_count: u32,
    pub model_config: ModelConfig,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            output_directory: "Assets/Shaders/Generated".to_owned(),
            max_retry_count: 3,
            model_config: ModelConfig::default(),
        }
    }
}

impl SessionConfig {
    pub fn validate(&self) -> LinkResult<()> {
        if self.output_directory.trim().is_empty() {
            return Err(LinkError::InvalidConfig(
                "outputDirectory must not be empty".to_owned(),
            ));
        }
        if !(MIN_RETRY_COUNT..=MAX_RETRY_COUNT).contains(&self.max_retry_count) {
            return Err(LinkError::InvalidConfig(format!(
                "maxRetryCount must be within [{MIN_RETRY_COUNT}, {MAX_RETRY_COUNT}], got {}",
                self.max_retry_count
            )));
        }
        Ok(())
    }
}

/// Connection lifecycle tuning. All thresholds are measured against the time
/// since the last frame was received.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionConfig {
    pub host: String,
    pub port: u16,
    pub auto_reconnect: bool,
    pub reconnect_interval: Duration,
    pub connection_timeout: Duration,
    pub health_check_interval: Duration,
    pub healthy_threshold: Duration,
    pub unhealthy_threshold: Duration,
    /// Consecutive Unhealthy health checks that force a reconnect.
    pub max_unhealthy_checks: u32,
    /// Consecutive connect failures before a single connection-lost notice.
    pub failure_notice_threshold: u32,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_owned(),
            port: 8765,
            auto_reconnect: true,
            reconnect_interval: Duration::from_secs(3),
            connection_timeout: Duration::from_secs(10),
            health_check_interval: Duration::from_secs(5),
            healthy_threshold: Duration::from_secs(10),
            unhealthy_threshold: Duration::from_secs(30),
            max_unhealthy_checks: 3,
            failure_notice_threshold: 5,
        }
    }
}

impl ConnectionConfig {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            ..Self::default()
        }
    }

    pub fn url(&self) -> String {
        format!("ws://{}:{}", self.host, self.port)
    }

    pub fn validate(&self) -> LinkResult<()> {
        if self.host.trim().is_empty() {
            return Err(LinkError::InvalidConfig("host must not be empty".to_owned()));
        }
        if self.health_check_interval.is_zero() {
            return Err(LinkError::InvalidConfig(
                "health check interval must be positive".to_owned(),
            ));
        }
        if self.healthy_threshold >= self.unhealthy_threshold {
            return Err(LinkError::InvalidConfig(format!(
                "healthy threshold ({:?}) must be below unhealthy threshold ({:?})",
                self.healthy_threshold, self.unhealthy_threshold
            )));
        }
        if self.max_unhealthy_checks == 0 {
            return Err(LinkError::InvalidConfig(
                "max unhealthy checks must be at least 1".to_owned(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_session_config_is_valid() {
        SessionConfig::default().validate().unwrap();
    }

    #[test]
    fn retry_count_outside_range_is_rejected() {
        for bad in [0, 11, 42] {
            let config = SessionConfig {
                max_retry_count: bad,
                ..SessionConfig::default()
            };
            let err = config.validate().unwrap_err();
            assert!(err.is_fatal());
            assert!(err.to_string().contains("maxRetryCount"));
        }
        for good in [1, 10] {
            let config = SessionConfig {
                max_retry_count: good,
                ..SessionConfig::default()
            };
            config.validate().unwrap();
        }
    }

    #[test]
    fn blank_output_directory_is_rejected() {
        let config = SessionConfig {
            output_directory: "   ".to_owned(),
            ..SessionConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn missing_session_fields_take_defaults() {
        let config: SessionConfig =
            serde_json::from_str(r#"{"outputDirectory":"Assets/Out"}"#).unwrap();
        assert_eq!(config.output_directory, "Assets/Out");
        assert_eq!(config.max_retry_count, 3);
        assert_eq!(config.model_config.code_model, "qwen-max");
    }

    #[test]
    fn connection_defaults_point_at_local_peer() {
        let config = ConnectionConfig::default();
        assert_eq!(config.url(), "ws://localhost:8765");
        config.validate().unwrap();
    }

    #[test]
    fn inverted_health_thresholds_are_rejected() {
        let config = ConnectionConfig {
            healthy_threshold: Duration::from_secs(30),
            unhealthy_threshold: Duration::from_secs(10),
            ..ConnectionConfig::default()
        };
        assert!(config.validate().is_err());
    }
}
