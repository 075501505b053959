use serde::Deserialize;
use std::time::Duration;
use std::{fs, path::Path};

use crate::core::queue::QueueOptions;

#[derive(Debug, Deserialize, Clone, Default)]
pub struct NodeConfig {
    /// Fixed gossip node id as 16 hex characters. Generated per process
    /// when unset.
    pub id: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct GossipConfig {
    /// IPv4 multicast group subscription datagrams are exchanged on.
    pub group: String,
    pub port: u16,
    pub enabled: bool,
}

impl Default for GossipConfig {
    fn default() -> Self {
        Self {
            group: "239.255.21.12".to_string(),
            port: 52181,
            enabled: true,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct QueueDefaults {
    pub auto_acknowledge: bool,
    pub concurrency_limit: usize,
    pub max_attempts: u32,
    pub retry_delay_ms: u64,
    pub durable: bool,
}

impl Default for QueueDefaults {
    fn default() -> Self {
        let options = QueueOptions::default();
        Self {
            auto_acknowledge: options.auto_acknowledge,
            concurrency_limit: options.concurrency_limit,
            max_attempts: options.max_attempts,
            retry_delay_ms: options.retry_delay.as_millis() as u64,
            durable: options.durable,
        }
    }
}

impl From<&QueueDefaults> for QueueOptions {
    fn from(defaults: &QueueDefaults) -> Self {
        QueueOptions {
            auto_acknowledge: defaults.auto_acknowledge,
            concurrency_limit: defaults.concurrency_limit,
            max_attempts: defaults.max_attempts,
            retry_delay: Duration::from_millis(defaults.retry_delay_ms),
            durable: defaults.durable,
        }
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub node: NodeConfig,
    #[serde(default)]
    pub gossip: GossipConfig,
    #[serde(default)]
    pub queue_defaults: QueueDefaults,
}

pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config, anyhow::Error> {
    let raw: String = fs::read_to_string(path)?;
    let config: Config = toml::from_str(&raw)?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_full_config() {
        let raw = r#"
            [gossip]
            group = "239.1.2.3"
            port = 9000
            enabled = false

            [queue_defaults]
            auto_acknowledge = true
            concurrency_limit = 4
            max_attempts = 5
            retry_delay_ms = 250
            durable = false
        "#;
        let config: Config = toml::from_str(raw).unwrap();
        assert_eq!(config.gossip.group, "239.1.2.3");
        assert!(!config.gossip.enabled);

        let options = QueueOptions::from(&config.queue_defaults);
        assert_eq!(options.concurrency_limit, 4);
        assert_eq!(options.retry_delay, Duration::from_millis(250));
    }

    #[test]
    fn missing_sections_fall_back_to_defaults() {
        let config: Config = toml::from_str("").unwrap();
        assert!(config.node.id.is_none());
        assert!(config.gossip.enabled);
        assert_eq!(config.queue_defaults.concurrency_limit, 1);
    }

    #[test]
    fn node_id_override_is_read() {
        let raw = r#"
            [node]
            id = "00112233aabbccdd"
        "#;
        let config: Config = toml::from_str(raw).unwrap();
        assert_eq!(config.node.id.as_deref(), Some("00112233aabbccdd"));
    }
}
