//! Gateway configuration.
//!
//! Loaded from a YAML file, from environment variables, or both (file first,
//! environment on top). Every field has a default so an empty file or an
//! empty environment yields a working listener on `0.0.0.0:1883`.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::session::SessionConfig;

pub const ENV_BIND_ADDRESS: &str = "MQTT_GATEWAY_BIND_ADDRESS";
pub const ENV_LISTEN_PORT: &str = "MQTT_GATEWAY_LISTEN_PORT";
pub const ENV_MAX_MESSAGE_SIZE: &str = "MQTT_GATEWAY_MAX_MESSAGE_SIZE";
pub const ENV_MESSAGING_HOST: &str = "MESSAGING_SERVICE_HOST";
pub const ENV_MESSAGING_PORT: &str = "MESSAGING_SERVICE_PORT";
pub const ENV_HANDSHAKE_TIMEOUT: &str = "MQTT_GATEWAY_HANDSHAKE_TIMEOUT_SECS";
pub const ENV_SSL: &str = "MQTT_GATEWAY_SSL";
pub const ENV_CERT_FILE: &str = "MQTT_GATEWAY_CERT_FILE";
pub const ENV_KEY_FILE: &str = "MQTT_GATEWAY_KEY_FILE";

/// Gateway listener and backend settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// Address the MQTT listener binds to.
    pub bind_address: String,
    pub listen_port: u16,
    /// Maximum MQTT packet size in bytes.
    pub max_message_size: usize,
    /// Messaging backend host.
    pub messaging_service_host: String,
    pub messaging_service_port: u16,
    /// Deadline for session establishment, in seconds.
    pub handshake_timeout_secs: u64,
    /// Serve MQTT over TLS.
    pub ssl: bool,
    pub cert_file: PathBuf,
    pub key_file: PathBuf,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".to_string(),
            listen_port: 1883,
            max_message_size: 131_072,
            messaging_service_host: "0.0.0.0".to_string(),
            messaging_service_port: 5672,
            handshake_timeout_secs: 60,
            ssl: false,
            cert_file: PathBuf::from("./tls/server-cert.pem"),
            key_file: PathBuf::from("./tls/server-key.pem"),
        }
    }
}

impl GatewayConfig {
    /// Defaults overridden by the process environment.
    pub fn from_env() -> Result<Self> {
        Self::default().with_overrides(|key| std::env::var(key).ok())
    }

    /// Load a YAML file. Missing fields take their defaults.
    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&content)
            .map_err(|e| Error::InvalidConfig(format!("{}: {e}", path.display())))
    }

    pub fn from_yaml_str(content: &str) -> Result<Self> {
        if content.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(content).map_err(|e| Error::InvalidConfig(e.to_string()))
    }

    /// Override fields with values found through `lookup`, keyed by the
    /// environment variable names.
    pub fn with_overrides<F>(mut self, lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup(ENV_BIND_ADDRESS) {
            self.bind_address = v;
        }
        if let Some(v) = lookup(ENV_LISTEN_PORT) {
            self.listen_port = parse(ENV_LISTEN_PORT, &v)?;
        }
        if let Some(v) = lookup(ENV_MAX_MESSAGE_SIZE) {
            self.max_message_size = parse(ENV_MAX_MESSAGE_SIZE, &v)?;
        }
        if let Some(v) = lookup(ENV_MESSAGING_HOST) {
            self.messaging_service_host = v;
        }
        if let Some(v) = lookup(ENV_MESSAGING_PORT) {
            self.messaging_service_port = parse(ENV_MESSAGING_PORT, &v)?;
        }
        if let Some(v) = lookup(ENV_HANDSHAKE_TIMEOUT) {
            self.handshake_timeout_secs = parse(ENV_HANDSHAKE_TIMEOUT, &v)?;
        }
        if let Some(v) = lookup(ENV_SSL) {
            self.ssl = parse(ENV_SSL, &v.to_ascii_lowercase())?;
        }
        if let Some(v) = lookup(ENV_CERT_FILE) {
            self.cert_file = PathBuf::from(v);
        }
        if let Some(v) = lookup(ENV_KEY_FILE) {
            self.key_file = PathBuf::from(v);
        }
        Ok(self)
    }

    pub fn validate(&self) -> Result<()> {
        if self.handshake_timeout_secs == 0 {
            return Err(Error::InvalidConfig(
                "handshake timeout must be positive".to_string(),
            ));
        }
        if self.max_message_size == 0 {
            return Err(Error::InvalidConfig(
                "max message size must be positive".to_string(),
            ));
        }
        if self.ssl && !cfg!(feature = "tls") {
            return Err(Error::InvalidConfig(
                "ssl requested but built without the tls feature".to_string(),
            ));
        }
        Ok(())
    }

    /// `host:port` the listener binds to.
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind_address, self.listen_port)
    }

    /// `host:port` of the messaging backend.
    pub fn messaging_addr(&self) -> String {
        format!("{}:{}", self.messaging_service_host, self.messaging_service_port)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }

    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            handshake_timeout: self.handshake_timeout(),
            max_message_size: self.max_message_size,
        }
    }
}

fn parse<T: std::str::FromStr>(key: &str, value: &str) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|e| Error::InvalidConfig(format!("{key}={value:?}: {e}")))
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = GatewayConfig::default();
        assert_eq!(config.listen_addr(), "0.0.0.0:1883");
        assert_eq!(config.messaging_addr(), "0.0.0.0:5672");
        assert_eq!(config.max_message_size, 131_072);
        assert_eq!(config.handshake_timeout(), Duration::from_secs(60));
        assert!(!config.ssl);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_overrides() {
        let config = GatewayConfig::default()
            .with_overrides(lookup(&[
                (ENV_BIND_ADDRESS, "127.0.0.1"),
                (ENV_LISTEN_PORT, "11883"),
                (ENV_MESSAGING_HOST, "qdrouterd"),
                (ENV_HANDSHAKE_TIMEOUT, "5"),
                (ENV_SSL, "FALSE"),
            ]))
            .unwrap();

        assert_eq!(config.listen_addr(), "127.0.0.1:11883");
        assert_eq!(config.messaging_addr(), "qdrouterd:5672");
        assert_eq!(config.session_config().handshake_timeout, Duration::from_secs(5));
        assert!(!config.ssl);
    }

    #[test]
    fn test_bad_override() {
        let err = GatewayConfig::default()
            .with_overrides(lookup(&[(ENV_LISTEN_PORT, "not-a-port")]))
            .unwrap_err();
        assert!(err.to_string().contains(ENV_LISTEN_PORT));
    }

    #[test]
    fn test_yaml_partial() {
        let config = GatewayConfig::from_yaml_str(
            "listen_port: 8883\nssl: true\ncert_file: /etc/tls/cert.pem\n",
        )
        .unwrap();
        assert_eq!(config.listen_port, 8883);
        assert!(config.ssl);
        assert_eq!(config.cert_file, PathBuf::from("/etc/tls/cert.pem"));
        assert_eq!(config.bind_address, "0.0.0.0");
    }

    #[test]
    fn test_yaml_empty() {
        assert_eq!(GatewayConfig::from_yaml_str("").unwrap(), GatewayConfig::default());
    }

    #[test]
    fn test_validate() {
        let config = GatewayConfig {
            handshake_timeout_secs: 0,
            ..GatewayConfig::default()
        };
        assert!(matches!(config.validate(), Err(Error::InvalidConfig(_))));

        let config = GatewayConfig {
            max_message_size: 0,
            ..GatewayConfig::default()
        };
        assert!(config.validate().is_err());

        let config = GatewayConfig {
            ssl: true,
            ..GatewayConfig::default()
        };
        assert_eq!(config.validate().is_ok(), cfg!(feature = "tls"));
    }
}
