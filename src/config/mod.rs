use std::time::Duration;
use std::{fs, path::Path};

use serde::Deserialize;

/// Broker connection settings.
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct BrokerConfig {
    /// Broker network address (host:port).
    pub addr: String,
    /// Run against a process-wide embedded broker instead of an external
    /// one.
    pub embedded: bool,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            addr: "127.0.0.1:4150".to_string(),
            embedded: false,
        }
    }
}

/// Durable queue settings.
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct QueueConfig {
    /// Topic events are published to.
    pub topic: String,
    /// Named subscription group for the consumer side.
    pub channel: String,
    /// Cap on unacknowledged messages the broker delivers concurrently.
    pub max_in_flight: usize,
    /// Delay before an unacknowledged message is redelivered.
    pub requeue_wait_ms: u64,
    /// Bound on how long a publish waits for the broker's ack.
    pub publish_timeout_ms: u64,
    /// Capacity of the in-memory/staging buffer.
    pub capacity: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            topic: "user_event".to_string(),
            channel: "eventbuf".to_string(),
            max_in_flight: 100,
            requeue_wait_ms: 30_000,
            publish_timeout_ms: 5_000,
            capacity: 100,
        }
    }
}

impl QueueConfig {
    pub fn requeue_wait(&self) -> Duration {
        Duration::from_millis(self.requeue_wait_ms)
    }

    pub fn publish_timeout(&self) -> Duration {
        Duration::from_millis(self.publish_timeout_ms)
    }
}

/// Full configuration, passed explicitly into constructors.
#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct Config {
    pub broker: BrokerConfig,
    pub queue: QueueConfig,
}

/// Loads configuration from a TOML file; absent fields take defaults.
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config, anyhow::Error> {
    let raw: String = fs::read_to_string(path)?;
    let config: Config = toml::from_str(&raw)?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = Config::default();
        assert_eq!(config.broker.addr, "127.0.0.1:4150");
        assert!(!config.broker.embedded);
        assert_eq!(config.queue.topic, "user_event");
        assert_eq!(config.queue.max_in_flight, 100);
        assert_eq!(config.queue.requeue_wait(), Duration::from_secs(30));
        assert_eq!(config.queue.publish_timeout(), Duration::from_secs(5));
    }

    #[test]
    fn partial_toml_overrides_only_named_fields() {
        let config: Config = toml::from_str(
            r#"
            [broker]
            embedded = true

            [queue]
            capacity = 3
            "#,
        )
        .unwrap();
        assert!(config.broker.embedded);
        assert_eq!(config.queue.capacity, 3);
        assert_eq!(config.queue.channel, "eventbuf");
    }
}
