//! Client configuration
//!
//! Built from CLI arguments and environment variables; a JSON config file written
//! by the dashboard may override individual values.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;
use tunnelforge_common::constants::{
    CONTAINER_HOST_ALIAS, DEFAULT_CONTROL_PORT, DEFAULT_PUBLIC_PORT, PING_INTERVAL_MS,
};

use crate::local::LocalTarget;
use crate::reconnect::ReconnectConfig;

/// Configuration for the tunnel client
#[derive(Debug, Clone, PartialEq)]
pub struct ClientConfig {
    /// Relay server control endpoint
    pub server_host: String,
    pub server_port: u16,

    /// Local service exposed through the tunnel
    pub local_host: String,
    pub local_port: u16,

    /// Public host and port, only used to print the public address
    pub public_host: String,
    pub public_port: u16,

    /// Keepalive period; the connection is dropped after 1.5x without PING_OK
    pub ping_interval: Duration,

    pub reconnect: ReconnectConfig,

    /// Alias substituted for loopback hosts when running inside a container
    pub container_alias: Option<String>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_host: "127.0.0.1".to_string(),
            server_port: DEFAULT_CONTROL_PORT,
            local_host: "127.0.0.1".to_string(),
            local_port: 8080,
            public_host: "127.0.0.1".to_string(),
            public_port: DEFAULT_PUBLIC_PORT,
            ping_interval: Duration::from_millis(PING_INTERVAL_MS),
            reconnect: ReconnectConfig::default(),
            container_alias: Some(CONTAINER_HOST_ALIAS.to_string()),
        }
    }
}

impl ClientConfig {
    pub fn local_target(&self) -> LocalTarget {
        LocalTarget {
            host: self.local_host.clone(),
            port: self.local_port,
            container_alias: self.container_alias.clone(),
        }
    }

    pub fn public_url(&self, token: &str) -> String {
        format!("http://{}.{}:{}", token, self.public_host, self.public_port)
    }

    /// Apply the values present in a config file
    pub fn apply_file(&mut self, file: FileConfig) -> Result<()> {
        if let Some(interval) = file.reconnect_interval {
            self.reconnect.default_interval = Duration::from_millis(
                interval
                    .as_u64()
                    .filter(|ms| *ms > 0)
                    .context("RECONNECT_INTERVAL must be a positive number of milliseconds")?,
            );
        }
        if let Some(host) = file.proxy_server_main_host {
            self.public_host = host;
        }
        if let Some(host) = file.server_host {
            self.server_host = host;
        }
        if let Some(port) = file.server_port {
            self.server_port = port.as_port().context("Invalid CLIENT_PARAM_SERVER_PORT")?;
        }
        if let Some(host) = file.local_host {
            self.local_host = host;
        }
        if let Some(port) = file.local_port {
            self.local_port = port.as_port().context("Invalid CLIENT_PARAM_LOCAL_APP_PORT")?;
        }
        Ok(())
    }

    pub fn load_file(&mut self, path: &Path) -> Result<()> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let file = FileConfig::from_json(&content)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;
        self.apply_file(file)
    }
}

/// A number that may also be written as a string
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum NumberValue {
    Number(u64),
    Text(String),
}

impl NumberValue {
    pub fn as_u64(&self) -> Option<u64> {
        match self {
            NumberValue::Number(n) => Some(*n),
            NumberValue::Text(s) => s.trim().parse().ok(),
        }
    }

    pub fn as_port(&self) -> Option<u16> {
        self.as_u64().and_then(|n| u16::try_from(n).ok())
    }
}

/// Dashboard config file; unknown keys are ignored
#[derive(Debug, Default, Clone, PartialEq, Eq, Deserialize)]
pub struct FileConfig {
    #[serde(rename = "RECONNECT_INTERVAL")]
    pub reconnect_interval: Option<NumberValue>,

    #[serde(rename = "PROXY_SERVER_MAIN_HOST")]
    pub proxy_server_main_host: Option<String>,

    #[serde(rename = "CLIENT_PARAM_SERVER_HOST")]
    pub server_host: Option<String>,

    #[serde(rename = "CLIENT_PARAM_SERVER_PORT")]
    pub server_port: Option<NumberValue>,

    #[serde(rename = "CLIENT_PARAM_LOCAL_APP_HOST")]
    pub local_host: Option<String>,

    #[serde(rename = "CLIENT_PARAM_LOCAL_APP_PORT")]
    pub local_port: Option<NumberValue>,
}

impl FileConfig {
    pub fn from_json(content: &str) -> Result<Self> {
        Ok(serde_json::from_str(content)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ClientConfig::default();
        assert_eq!(config.server_port, 3000);
        assert_eq!(config.public_port, 4000);
        assert_eq!(config.ping_interval, Duration::from_secs(60));
        assert_eq!(config.reconnect.default_interval, Duration::from_secs(1));
        assert_eq!(config.container_alias.as_deref(), Some("host.docker.internal"));
    }

    #[test]
    fn test_public_url() {
        let config = ClientConfig {
            public_host: "tunnel.example.com".to_string(),
            public_port: 4000,
            ..ClientConfig::default()
        };
        assert_eq!(config.public_url("abc"), "http://abc.tunnel.example.com:4000");
    }

    #[test]
    fn test_file_overrides_present_keys_only() {
        let file = FileConfig::from_json(
            r#"{
                "RECONNECT_INTERVAL": 2500,
                "CLIENT_PARAM_SERVER_HOST": "relay.example.com",
                "CLIENT_PARAM_LOCAL_APP_PORT": "9090",
                "IAM_ID": "ignored"
            }"#,
        )
        .unwrap();

        let mut config = ClientConfig::default();
        config.apply_file(file).unwrap();

        assert_eq!(config.reconnect.default_interval, Duration::from_millis(2500));
        assert_eq!(config.server_host, "relay.example.com");
        assert_eq!(config.local_port, 9090);
        assert_eq!(config.server_port, DEFAULT_CONTROL_PORT);
        assert_eq!(config.local_host, "127.0.0.1");
    }

    #[test]
    fn test_file_rejects_bad_port() {
        let file = FileConfig::from_json(r#"{"CLIENT_PARAM_SERVER_PORT": 70000}"#).unwrap();
        let mut config = ClientConfig::default();
        assert!(config.apply_file(file).is_err());
    }

    #[test]
    fn test_file_rejects_zero_reconnect_interval() {
        for content in [r#"{"RECONNECT_INTERVAL": 0}"#, r#"{"RECONNECT_INTERVAL": "0"}"#] {
            let file = FileConfig::from_json(content).unwrap();
            let mut config = ClientConfig::default();
            assert!(config.apply_file(file).is_err());
            assert_eq!(config.reconnect, ReconnectConfig::default());
        }
    }

    #[test]
    fn test_empty_file() {
        let file = FileConfig::from_json("{}").unwrap();
        assert_eq!(file, FileConfig::default());
    }

    #[test]
    fn test_load_missing_file() {
        let mut config = ClientConfig::default();
        assert!(config
            .load_file(Path::new("/nonexistent/client-config.json"))
            .is_err());
    }
}
