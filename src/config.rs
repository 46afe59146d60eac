use serde::{Deserialize, Serialize};
use std::{fs::File, io::BufReader, path::Path, time::Duration};
use thiserror::Error;
use uuid::Uuid;

use crate::{server::ServerIdentity, subject::SubjectCodec};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Server instance id, generated when absent
    #[serde(default = "default_id")]
    pub id: String,

    /// Deployment environment; `None` selects the unqualified subject layout
    #[serde(default = "default_environment")]
    pub environment: Option<String>,

    /// Application queue (the `app` of the subject)
    #[serde(default = "default_queue")]
    pub queue: String,

    #[serde(default = "default_nats_url")]
    pub nats_url: String,

    #[serde(default = "default_shutdown_grace", with = "duration_ms")]
    pub shutdown_grace: Duration,

    /// Caller-side timeout used by clients built from this config
    #[serde(default = "default_request_timeout", with = "duration_ms")]
    pub request_timeout: Duration,

    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_filter")]
    pub filter: String,

    #[serde(default = "default_true")]
    pub ansi: bool,

    #[serde(default)]
    pub with_target: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: default_filter(),
            ansi: default_true(),
            with_target: false,
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            id: default_id(),
            environment: default_environment(),
            queue: default_queue(),
            nats_url: default_nats_url(),
            shutdown_grace: default_shutdown_grace(),
            request_timeout: default_request_timeout(),
            logging: LoggingConfig::default(),
        }
    }
}

impl ServerConfig {
    pub fn from_file<P: AsRef<Path>>(path: P) -> ConfigResult<Self> {
        from_file(path)
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> ConfigResult<Self> {
        from_str(s)
    }

    /// Subject codec for this deployment's layout, environment and queue.
    pub fn codec(&self) -> SubjectCodec {
        match &self.environment {
            Some(environment) => SubjectCodec::qualified(environment.clone(), self.queue.clone()),
            None => SubjectCodec::unqualified(self.queue.clone()),
        }
    }

    pub fn identity(&self) -> ServerIdentity {
        ServerIdentity::new(self.id.clone(), self.queue.clone(), self.environment.clone())
    }
}

pub fn from_file<T: for<'de> Deserialize<'de>, P: AsRef<Path>>(path: P) -> ConfigResult<T> {
    let path = path.as_ref();
    let file = File::open(path).map_err(|source| ConfigError::Io {
        path: path.display().to_string(),
        source,
    })?;
    let reader = BufReader::new(file);
    let config = serde_json::from_reader(reader)?;
    Ok(config)
}

pub fn from_str<T: for<'de> Deserialize<'de>>(s: &str) -> ConfigResult<T> {
    let config = serde_json::from_str(s)?;
    Ok(config)
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),
}

pub type ConfigResult<T> = Result<T, ConfigError>;

fn default_id() -> String {
    Uuid::new_v4().to_string()
}

fn default_environment() -> Option<String> {
    Some("dev".to_string())
}

fn default_queue() -> String {
    "app".to_string()
}

fn default_nats_url() -> String {
    "nats://127.0.0.1:4222".to_string()
}

fn default_shutdown_grace() -> Duration {
    Duration::from_secs(5)
}

fn default_request_timeout() -> Duration {
    Duration::from_secs(3)
}

fn default_filter() -> String {
    "info".to_string()
}

fn default_true() -> bool {
    true
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::subject::SubjectLayout;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = ServerConfig::from_str("{}").unwrap();
        assert_eq!(config.environment.as_deref(), Some("dev"));
        assert_eq!(config.queue, "app");
        assert_eq!(config.shutdown_grace, Duration::from_secs(5));
        assert_eq!(config.logging.filter, "info");
        assert!(!config.id.is_empty());
        assert_eq!(config.codec().layout(), SubjectLayout::Qualified);
    }

    #[test]
    fn test_null_environment_selects_unqualified_layout() {
        let config = ServerConfig::from_str(
            r#"{"id":"s1","environment":null,"queue":"shop","shutdown_grace":250}"#,
        )
        .unwrap();
        assert_eq!(config.codec().layout(), SubjectLayout::Unqualified);
        assert_eq!(config.codec().subscription_subject("user"), "shop.user.*");
        assert_eq!(config.shutdown_grace, Duration::from_millis(250));
        assert_eq!(config.identity().id, "s1");
    }

    #[test]
    fn test_durations_serialize_as_millis() {
        let config = ServerConfig::default();
        let value = serde_json::to_value(&config).unwrap();
        assert_eq!(value["shutdown_grace"], 5000);
        assert_eq!(value["request_timeout"], 3000);
    }

    #[test]
    fn test_from_file() {
        let path = std::env::temp_dir().join(format!("busrpc-config-{}.json", Uuid::new_v4()));
        let mut file = File::create(&path).unwrap();
        file.write_all(br#"{"queue":"orders","logging":{"filter":"debug"}}"#)
            .unwrap();

        let config = ServerConfig::from_file(&path).unwrap();
        std::fs::remove_file(&path).unwrap();

        assert_eq!(config.queue, "orders");
        assert_eq!(config.logging.filter, "debug");
        assert!(config.logging.ansi);
    }

    #[test]
    fn test_missing_file() {
        let result = ServerConfig::from_file("/nonexistent/busrpc.json");
        assert!(matches!(result, Err(ConfigError::Io { .. })));
    }
}
