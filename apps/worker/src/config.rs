//! Worker configuration.
//!
//! Everything that used to be ambient (current user, server, glossing
//! settings) travels in one explicit context struct handed to each
//! component at construction time.

use std::path::PathBuf;

/// Language-specific behavior switches.
#[derive(Debug, Clone, Default)]
pub struct LanguageProfile {
    /// Languages with a character system get a second export manifest and a
    /// characters collection.
    pub has_characters: bool,
}

/// Replication tunables. The 10,000 batch sizes keep round trips rare for
/// bulk operations at the cost of memory; they are tunables, not contracts.
#[derive(Debug, Clone)]
pub struct ReplicationConfig {
    pub pull_page_size: usize,
    pub push_batch_size: usize,
    /// Poll period for collections without live change notifications.
    pub poll_interval_secs: u64,
    /// Minimum delay between notification-channel reconnect attempts.
    pub channel_retry_floor_secs: u64,
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            pull_page_size: 10_000,
            push_batch_size: 10_000,
            poll_interval_secs: 600,
            channel_retry_floor_secs: 5,
        }
    }
}

#[derive(Debug, Clone)]
pub struct OutboxConfig {
    pub flush_interval_secs: u64,
    pub max_batch: usize,
}

impl Default for OutboxConfig {
    fn default() -> Self {
        Self {
            flush_interval_secs: 30,
            max_batch: 500,
        }
    }
}

/// Full worker context.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Server origin, e.g. `https://learn.example.com`.
    pub base_url: String,
    pub username: String,
    pub lang: LanguageProfile,
    pub replication: ReplicationConfig,
    pub outbox: OutboxConfig,
    /// How long a failed card waits before it is due again, in seconds.
    pub failure_wait_secs: i64,
    /// Override for the database directory; defaults to the platform data dir.
    pub data_dir: Option<PathBuf>,
}

impl WorkerConfig {
    pub fn new(base_url: &str, username: &str) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            username: username.to_string(),
            lang: LanguageProfile::default(),
            replication: ReplicationConfig::default(),
            outbox: OutboxConfig::default(),
            failure_wait_secs: 600,
            data_dir: None,
        }
    }

    /// Host portion of the base URL.
    pub fn host(&self) -> &str {
        self.base_url
            .trim_start_matches("https://")
            .trim_start_matches("http://")
    }

    /// WebSocket endpoint for change subscriptions.
    pub fn subscriptions_url(&self) -> String {
        let scheme = if self.base_url.starts_with("http://") {
            "ws"
        } else {
            "wss"
        };
        format!("{}://{}/subscriptions", scheme, self.host())
    }

    /// Path of the per-user durable store.
    pub fn db_path(&self) -> PathBuf {
        let dir = self
            .data_dir
            .clone()
            .or_else(dirs::data_local_dir)
            .unwrap_or_else(|| PathBuf::from("."))
            .join("lexisync");
        dir.join(crate::store::DocumentStore::file_name(
            &self.username,
            self.host(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn urls_are_derived_from_base() {
        let config = WorkerConfig::new("https://learn.example.com/", "ada");
        assert_eq!(config.base_url, "https://learn.example.com");
        assert_eq!(config.host(), "learn.example.com");
        assert_eq!(
            config.subscriptions_url(),
            "wss://learn.example.com/subscriptions"
        );
    }

    #[test]
    fn db_name_is_sanitized() {
        let config = WorkerConfig::new("https://learn.example.com", "ada.lovelace");
        let path = config.db_path();
        let name = path.file_name().unwrap().to_string_lossy().to_string();
        assert_eq!(name, "lexisync_ada_lovelace_learn_example_com.db");
    }
}
