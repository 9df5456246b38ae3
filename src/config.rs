// Configuration keys from the host's perspective: all optional, all defaulted.
// The engine itself never reads the environment except through `from_env`,
// which a host may call as a convenience (mirrors the teacher's own
// `DATABASE_FILE` lookup in its entrypoint) — nothing here is mandatory.
use serde::Deserialize;
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PubsubConfig {
    pub batch_size: usize,
    pub flush_interval_ms: u64,
    pub polling_interval_ms: u64,
    pub max_wait_time_secs: u64,
    pub max_queue_size: usize,
    pub shutdown_timeout_secs: u64,
    pub delivered_retention_secs: u64,
    pub undelivered_retention_secs: u64,
    /// Consecutive store failures a Subscriber tolerates before stopping itself.
    /// `None` (the production default) means unbounded retry.
    pub max_consecutive_failures: Option<u32>,
}

impl Default for PubsubConfig {
    fn default() -> Self {
        Self {
            batch_size: 200,
            flush_interval_ms: 50,
            polling_interval_ms: 100,
            max_wait_time_secs: 30,
            max_queue_size: 10_000,
            shutdown_timeout_secs: 5,
            delivered_retention_secs: 3_600,
            undelivered_retention_secs: 86_400,
            max_consecutive_failures: None,
        }
    }
}

impl PubsubConfig {
    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }

    pub fn polling_interval(&self) -> Duration {
        Duration::from_millis(self.polling_interval_ms)
    }

    pub fn max_wait_time(&self) -> Duration {
        Duration::from_secs(self.max_wait_time_secs)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }

    pub fn delivered_retention(&self) -> Duration {
        Duration::from_secs(self.delivered_retention_secs)
    }

    pub fn undelivered_retention(&self) -> Duration {
        Duration::from_secs(self.undelivered_retention_secs)
    }

    /// Reads any of the `SESSION_PUBSUB_*` environment variables that are
    /// present, falling back to defaults for the rest.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(v) = std::env::var("SESSION_PUBSUB_BATCH_SIZE") {
            if let Ok(n) = v.parse() {
                config.batch_size = n;
            }
        }
        if let Ok(v) = std::env::var("SESSION_PUBSUB_FLUSH_INTERVAL_MS") {
            if let Ok(n) = v.parse() {
                config.flush_interval_ms = n;
            }
        }
        if let Ok(v) = std::env::var("SESSION_PUBSUB_POLLING_INTERVAL_MS") {
            if let Ok(n) = v.parse() {
                config.polling_interval_ms = n;
            }
        }
        if let Ok(v) = std::env::var("SESSION_PUBSUB_MAX_QUEUE_SIZE") {
            if let Ok(n) = v.parse() {
                config.max_queue_size = n;
            }
        }
        if let Ok(v) = std::env::var("SESSION_PUBSUB_SHUTDOWN_TIMEOUT_SECS") {
            if let Ok(n) = v.parse() {
                config.shutdown_timeout_secs = n;
            }
        }
        if let Ok(v) = std::env::var("SESSION_PUBSUB_DELIVERED_RETENTION_SECS") {
            if let Ok(n) = v.parse() {
                config.delivered_retention_secs = n;
            }
        }
        if let Ok(v) = std::env::var("SESSION_PUBSUB_UNDELIVERED_RETENTION_SECS") {
            if let Ok(n) = v.parse() {
                config.undelivered_retention_secs = n;
            }
        }

        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec_table() {
        let config = PubsubConfig::default();
        assert_eq!(config.batch_size, 200);
        assert_eq!(config.flush_interval_ms, 50);
        assert_eq!(config.polling_interval_ms, 100);
        assert_eq!(config.max_wait_time_secs, 30);
        assert_eq!(config.max_queue_size, 10_000);
        assert_eq!(config.shutdown_timeout_secs, 5);
        assert_eq!(config.delivered_retention_secs, 3_600);
        assert_eq!(config.undelivered_retention_secs, 86_400);
    }
}
