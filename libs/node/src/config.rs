use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use courier_fabric::{FileConfig, HttpConfig, MemoryConfig};
use serde::Deserialize;

use crate::error::{Error, Result};

/// Top-level node configuration, deserializable from TOML.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub fallback: FallbackConfig,
    pub logging: LoggingConfig,
    pub protocols: ProtocolsConfig,
}

/// Manager behaviour: health probing, retries, de-duplication, shutdown.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FallbackConfig {
    /// Address used as sender for envelopes built by the manager
    pub node_id: String,
    pub health_check_interval_ms: u64,
    pub health_check_timeout_ms: u64,
    /// Delivery attempts allowed per envelope
    pub max_retries: u32,
    /// Consecutive send failures after which a protocol is demoted at once
    pub failure_threshold: u32,
    pub dedup_window_ms: u64,
    /// Applied to envelopes sent without a TTL
    pub default_ttl_secs: Option<u64>,
    pub send_timeout_ms: u64,
    pub retry_backoff_ms: u64,
    pub shutdown_grace_ms: u64,
    pub dispatch_capacity: usize,
}

impl FallbackConfig {
    pub fn health_check_interval(&self) -> Duration {
        Duration::from_millis(self.health_check_interval_ms)
    }

    pub fn health_check_timeout(&self) -> Duration {
        Duration::from_millis(self.health_check_timeout_ms)
    }

    pub fn dedup_window(&self) -> Duration {
        Duration::from_millis(self.dedup_window_ms)
    }

    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }

    pub fn validate(&self) -> Result<()> {
        let checks = [
            (self.max_retries == 0, "max_retries must be at least 1"),
            (self.failure_threshold == 0, "failure_threshold must be at least 1"),
            (self.health_check_interval_ms == 0, "health_check_interval_ms must be positive"),
            (self.health_check_timeout_ms == 0, "health_check_timeout_ms must be positive"),
            (self.send_timeout_ms == 0, "send_timeout_ms must be positive"),
            (self.shutdown_grace_ms == 0, "shutdown_grace_ms must be positive"),
            (self.dispatch_capacity == 0, "dispatch_capacity must be positive"),
            (self.node_id.is_empty(), "node_id must not be empty"),
        ];

        match checks.iter().find(|(failed, _)| *failed) {
            Some((_, msg)) => Err(Error::Config(msg.to_string())),
            None => Ok(()),
        }
    }
}

impl Default for FallbackConfig {
    fn default() -> Self {
        Self {
            node_id: "node".to_string(),
            health_check_interval_ms: 5000,
            health_check_timeout_ms: 300,
            max_retries: 3,
            failure_threshold: 2,
            dedup_window_ms: 30_000,
            default_ttl_secs: None,
            send_timeout_ms: 5000,
            retry_backoff_ms: 100,
            shutdown_grace_ms: 2000,
            dispatch_capacity: 1024,
        }
    }
}

/// Log output settings; `RUST_LOG` overrides `level` when set.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ProtocolsConfig {
    pub memory: MemorySection,
    pub file: FileSection,
    pub http: HttpSection,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MemorySection {
    pub enabled: bool,
    pub priority: i32,
    #[serde(flatten)]
    pub settings: MemoryConfig,
}

impl Default for MemorySection {
    fn default() -> Self {
        Self {
            enabled: true,
            priority: 1,
            settings: MemoryConfig::default(),
        }
    }
}

/// File mailbox section. `address` falls back to the node id when omitted.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FileSection {
    pub enabled: bool,
    pub priority: i32,
    pub address: Option<String>,
    #[serde(flatten)]
    pub settings: FileConfig,
}

impl Default for FileSection {
    fn default() -> Self {
        Self {
            enabled: true,
            priority: 2,
            address: None,
            settings: FileConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HttpSection {
    pub enabled: bool,
    pub priority: i32,
    #[serde(flatten)]
    pub settings: HttpConfig,
}

impl Default for HttpSection {
    fn default() -> Self {
        Self {
            enabled: true,
            priority: 3,
            settings: HttpConfig::default(),
        }
    }
}

impl ProtocolsConfig {
    /// `(name, priority)` of every enabled protocol
    pub fn enabled(&self) -> Vec<(&'static str, i32)> {
        let mut enabled = Vec::new();
        if self.memory.enabled {
            enabled.push(("memory", self.memory.priority));
        }
        if self.file.enabled {
            enabled.push(("file", self.file.priority));
        }
        if self.http.enabled {
            enabled.push(("http", self.http.priority));
        }
        enabled
    }

    /// File settings with the mailbox address resolved
    pub fn file_settings(&self, node_id: &str) -> FileConfig {
        FileConfig {
            address: self
                .file
                .address
                .clone()
                .unwrap_or_else(|| node_id.to_string()),
            ..self.file.settings.clone()
        }
    }
}

impl NodeConfig {
    pub fn from_toml_str(s: &str) -> Result<Self> {
        let config: NodeConfig = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    pub fn validate(&self) -> Result<()> {
        self.fallback.validate()?;

        let file = &self.protocols.file;
        let http = &self.protocols.http;
        let timeouts = [
            (
                file.enabled && file.settings.io_timeout_ms == 0,
                "protocols.file.io_timeout_ms must be positive",
            ),
            (
                http.enabled && http.settings.request_timeout_ms == 0,
                "protocols.http.request_timeout_ms must be positive",
            ),
            (
                http.enabled && http.settings.health_timeout_ms == 0,
                "protocols.http.health_timeout_ms must be positive",
            ),
        ];
        if let Some((_, msg)) = timeouts.iter().find(|(failed, _)| *failed) {
            return Err(Error::Config(msg.to_string()));
        }

        let enabled = self.protocols.enabled();
        if enabled.is_empty() {
            return Err(Error::Config("no protocol enabled".to_string()));
        }

        let mut seen: HashMap<i32, &str> = HashMap::new();
        for (name, priority) in enabled {
            if let Some(existing) = seen.insert(priority, name) {
                return Err(Error::Config(format!(
                    "protocols {existing:?} and {name:?} share priority {priority}"
                )));
            }
        }
        Ok(())
    }
}
