use crate::household::Policy;
use serde::Deserialize;
use std::path::{Path, PathBuf};

// Re-export transport config alongside the rest
pub use crate::transport::NatsConfig;

/// Complete hearth configuration
#[derive(Debug, Clone, Default, Deserialize)]
pub struct HearthConfig {
    #[serde(default)]
    pub presence: PresenceConfig,
    #[serde(default)]
    pub household: HouseholdConfig,
    #[serde(default)]
    pub nats: NatsConfig,
    #[serde(default)]
    pub controller: ControllerConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub api: ApiConfig,
    /// Statically provisioned entities, added on every start
    #[serde(default)]
    pub entities: Vec<EntityConfig>,
}

/// Fusion and timeout tuning
#[derive(Debug, Clone, Deserialize)]
pub struct PresenceConfig {
    /// Heartbeat timeout for entities without their own (floored at 5s)
    #[serde(default = "default_timeout_seconds")]
    pub default_timeout_seconds: u64,
    /// Heartbeats older than this relative to receipt are rejected
    #[serde(default = "default_freshness_window")]
    pub freshness_window_seconds: i64,
    /// After a restart, how long a restored "connected" entity may wait for its
    /// first heartbeat before being disconnected
    #[serde(default = "default_restart_grace")]
    pub restart_grace_seconds: u64,
    /// Reconciliation sweep period
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_seconds: u64,
    /// Burst window for coalescing aggregate recomputation
    #[serde(default = "default_debounce_millis")]
    pub debounce_millis: u64,
}

fn default_timeout_seconds() -> u64 {
    300
}

fn default_freshness_window() -> i64 {
    30
}

fn default_restart_grace() -> u64 {
    300
}

fn default_sweep_interval() -> u64 {
    120
}

fn default_debounce_millis() -> u64 {
    50
}

impl Default for PresenceConfig {
    fn default() -> Self {
        Self {
            default_timeout_seconds: default_timeout_seconds(),
            freshness_window_seconds: default_freshness_window(),
            restart_grace_seconds: default_restart_grace(),
            sweep_interval_seconds: default_sweep_interval(),
            debounce_millis: default_debounce_millis(),
        }
    }
}

/// Household aggregate settings
#[derive(Debug, Clone, Default, Deserialize)]
pub struct HouseholdConfig {
    /// Policy used until one is persisted or set by command
    #[serde(default)]
    pub policy: Policy,
}

/// External mode controller
#[derive(Debug, Clone, Deserialize)]
pub struct ControllerConfig {
    /// `None` disables outgoing mode pushes
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default = "default_controller_timeout")]
    pub timeout_millis: u64,
}

fn default_controller_timeout() -> u64 {
    5000
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            base_url: None,
            timeout_millis: default_controller_timeout(),
        }
    }
}

/// State store location
#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    /// SQLite database file
    #[serde(default = "default_store_path")]
    pub path: PathBuf,
    /// Keep state in memory only (nothing survives a restart)
    #[serde(default)]
    pub in_memory: bool,
}

fn default_store_path() -> PathBuf {
    PathBuf::from("/var/lib/hearth/state.db")
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: default_store_path(),
            in_memory: false,
        }
    }
}

/// Operator HTTP surface
#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
}

fn default_bind() -> String {
    "0.0.0.0:8080".to_string()
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

/// One statically provisioned entity
#[derive(Debug, Clone, Deserialize)]
pub struct EntityConfig {
    pub identity: String,
    pub label: String,
    #[serde(default)]
    pub timeout_seconds: Option<u64>,
}

/// Load configuration from TOML file
pub fn load_config<P: AsRef<Path>>(path: P) -> anyhow::Result<HearthConfig> {
    let contents = std::fs::read_to_string(path)?;
    let config: HearthConfig = toml::from_str(&contents)?;
    Ok(config)
}

/// Load from `path` if it exists, otherwise defaults
pub fn load_or_default<P: AsRef<Path>>(path: P) -> anyhow::Result<HearthConfig> {
    if path.as_ref().exists() {
        load_config(path)
    } else {
        Ok(HearthConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = HearthConfig::default();
        assert_eq!(config.presence.default_timeout_seconds, 300);
        assert_eq!(config.presence.freshness_window_seconds, 30);
        assert_eq!(config.presence.sweep_interval_seconds, 120);
        assert_eq!(config.household.policy, Policy::Anyone);
        assert_eq!(config.nats.subject_prefix, "presence");
        assert!(config.controller.base_url.is_none());
        assert!(config.entities.is_empty());
    }

    #[test]
    fn test_config_deserialization() {
        let toml = r#"
            [presence]
            default_timeout_seconds = 60
            freshness_window_seconds = 20
            restart_grace_seconds = 600
            sweep_interval_seconds = 90
            debounce_millis = 10

            [household]
            policy = "everyone"

            [nats]
            url = "nats://broker.lan:4222"
            subject_prefix = "wifi"

            [controller]
            base_url = "http://hub.lan/api/modes"
            timeout_millis = 1500

            [store]
            path = "/tmp/hearth.db"

            [api]
            bind = "127.0.0.1:9000"

            [[entities]]
            identity = "AA:BB:CC:DD:EE:FF"
            label = "alice"

            [[entities]]
            identity = "11-22-33-44-55-66"
            label = "bob"
            timeout_seconds = 120
        "#;

        let config: HearthConfig = toml::from_str(toml).unwrap();
        assert_eq!(config.presence.default_timeout_seconds, 60);
        assert_eq!(config.presence.restart_grace_seconds, 600);
        assert_eq!(config.household.policy, Policy::Everyone);
        assert_eq!(config.nats.url, "nats://broker.lan:4222");
        assert_eq!(config.nats.subject_prefix, "wifi");
        assert_eq!(
            config.controller.base_url.as_deref(),
            Some("http://hub.lan/api/modes")
        );
        assert_eq!(config.store.path, PathBuf::from("/tmp/hearth.db"));
        assert!(!config.store.in_memory);
        assert_eq!(config.api.bind, "127.0.0.1:9000");
        assert_eq!(config.entities.len(), 2);
        assert_eq!(config.entities[1].timeout_seconds, Some(120));
    }

    #[test]
    fn test_partial_config() {
        // Missing sections use defaults
        let toml = r#"
            [presence]
            default_timeout_seconds = 45
        "#;

        let config: HearthConfig = toml::from_str(toml).unwrap();
        assert_eq!(config.presence.default_timeout_seconds, 45);
        assert_eq!(config.presence.freshness_window_seconds, 30); // Default
        assert_eq!(config.api.bind, "0.0.0.0:8080"); // Default
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let dir = tempfile::TempDir::new().unwrap();
        let config = load_or_default(dir.path().join("absent.toml")).unwrap();
        assert_eq!(config.presence.default_timeout_seconds, 300);
    }
}
