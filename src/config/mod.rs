//! Configuration module

use crate::egress::DEFAULT_PROBE_URLS;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Listen address for the TLS transport
    pub listen: String,

    /// Session password (required)
    pub password: String,

    /// TLS server name presented by the camouflage certificate
    pub sni: String,

    /// Path to a record-size scheme file; built-in scheme when unset
    #[serde(rename = "padding-scheme")]
    pub padding_scheme: Option<String>,

    /// Egress dialer settings
    pub egress: EgressConfig,

    /// Log level
    #[serde(rename = "log-level")]
    pub log_level: Option<String>,
}

impl Config {
    /// Load configuration from file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_str(&content)
    }

    /// Load from string
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(content: &str) -> Result<Self> {
        let config: Config = serde_yaml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.password.is_empty() {
            return Err(Error::config("password is required"));
        }
        if self.listen.is_empty() {
            return Err(Error::config("listen address is required"));
        }
        self.egress.validate()
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            listen: "0.0.0.0:15000".to_string(),
            password: String::new(),
            sni: "liveplay.wemeet.tencent.com".to_string(),
            padding_scheme: None,
            egress: EgressConfig::default(),
            log_level: Some("info".to_string()),
        }
    }
}

/// Egress dialer settings.
///
/// All durations are integer seconds. An empty `dial` list means outbound
/// traffic leaves through the OS socket stack with no candidate pool.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EgressConfig {
    /// Comma-separated candidate list (`http://…`, `https://…`,
    /// `socks5://…`, `DIRECT`), priority order
    pub dial: String,

    /// Append an implicit DIRECT candidate when not already present
    #[serde(rename = "dial-fallback")]
    pub dial_fallback: bool,

    /// Probe endpoints for out-of-band liveness checks
    #[serde(rename = "probe-urls")]
    pub probe_urls: Vec<String>,

    #[serde(rename = "probe-interval-secs")]
    pub probe_interval_secs: u64,

    #[serde(rename = "probe-timeout-secs")]
    pub probe_timeout_secs: u64,

    /// Probe URL successes needed to restore a candidate
    #[serde(rename = "success-threshold")]
    pub success_threshold: u32,

    /// How long user traffic may be idle before probes run
    #[serde(rename = "transfer-idle-secs")]
    pub transfer_idle_secs: u64,

    #[serde(rename = "connect-timeout-secs")]
    pub connect_timeout_secs: u64,

    #[serde(rename = "read-timeout-secs")]
    pub read_timeout_secs: u64,

    #[serde(rename = "write-timeout-secs")]
    pub write_timeout_secs: u64,
}

impl EgressConfig {
    pub fn probe_interval(&self) -> Duration {
        Duration::from_secs(self.probe_interval_secs)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_secs)
    }

    pub fn transfer_idle(&self) -> Duration {
        Duration::from_secs(self.transfer_idle_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout_secs)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_secs(self.write_timeout_secs)
    }

    pub fn validate(&self) -> Result<()> {
        if self.success_threshold == 0 {
            return Err(Error::config("success-threshold must be at least 1"));
        }
        if self.probe_interval_secs == 0
            || self.probe_timeout_secs == 0
            || self.connect_timeout_secs == 0
            || self.read_timeout_secs == 0
            || self.write_timeout_secs == 0
        {
            return Err(Error::config("timeouts and intervals must be positive"));
        }
        if self.probe_urls.is_empty() {
            return Err(Error::config("at least one probe URL is required"));
        }
        Ok(())
    }
}

impl Default for EgressConfig {
    fn default() -> Self {
        EgressConfig {
            dial: String::new(),
            dial_fallback: false,
            probe_urls: DEFAULT_PROBE_URLS.iter().map(|s| s.to_string()).collect(),
            probe_interval_secs: 30,
            probe_timeout_secs: 10,
            success_threshold: 1,
            transfer_idle_secs: 300,
            connect_timeout_secs: 30,
            read_timeout_secs: 60,
            write_timeout_secs: 60,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = EgressConfig::default();
        assert_eq!(config.probe_urls.len(), 4);
        assert_eq!(config.probe_interval(), Duration::from_secs(30));
        assert_eq!(config.probe_timeout(), Duration::from_secs(10));
        assert_eq!(config.success_threshold, 1);
        assert_eq!(config.transfer_idle(), Duration::from_secs(300));
        assert_eq!(config.connect_timeout(), Duration::from_secs(30));
        assert_eq!(config.read_timeout(), Duration::from_secs(60));
        assert_eq!(config.write_timeout(), Duration::from_secs(60));
    }

    #[test]
    fn test_yaml_parsing() {
        let yaml = r#"
listen: "127.0.0.1:8443"
password: secret
egress:
  dial: "socks5://127.0.0.1:1080,DIRECT"
  dial-fallback: false
  probe-interval-secs: 15
"#;
        let config = Config::from_str(yaml).unwrap();
        assert_eq!(config.listen, "127.0.0.1:8443");
        assert_eq!(config.egress.dial, "socks5://127.0.0.1:1080,DIRECT");
        assert_eq!(config.egress.probe_interval_secs, 15);
        // untouched fields keep their defaults
        assert_eq!(config.egress.read_timeout_secs, 60);
    }

    #[test]
    fn test_validation_rejects_empty_password() {
        let err = Config::from_str("listen: \"0.0.0.0:1\"\n").unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_validation_rejects_zero_threshold() {
        let yaml = r#"
password: x
egress:
  success-threshold: 0
"#;
        assert!(Config::from_str(yaml).is_err());
    }
}
