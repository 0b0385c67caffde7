//! Configuration for the Hermes coordination core
//!
//! Every setting has a default, so an empty or missing file yields a working
//! configuration.
//!
//! # Configuration File Format
//!
//! TOML format, by default in `$XDG_DATA_HOME/hermes/config.toml`:
//!
//! ```toml
//! [storage]
//! path = "/var/lib/hermes/hermes.db"
//! max_retries = 5
//!
//! [runtime]
//! mailbox_warn_depth = 1024
//! request_timeout_ms = 5000
//!
//! [broker]
//! notify_mode = "targeted"
//!
//! [review]
//! auto_start = true
//! command = ["claude", "--print", "--output-format", "json"]
//!
//! [queue]
//! default_ttl_secs = 604800
//! max_attempts = 5
//! ```

use crate::error::{HermesError, Result};
use crate::runtime::mailbox::MailboxPolicy;
use crate::runtime::supervision::RestartPolicy;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Complete configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HermesConfig {
    #[serde(default)]
    pub storage: StorageSettings,

    #[serde(default)]
    pub runtime: RuntimeSettings,

    #[serde(default)]
    pub broker: BrokerSettings,

    #[serde(default)]
    pub review: ReviewSettings,

    #[serde(default)]
    pub queue: QueueSettings,
}

/// Storage settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageSettings {
    /// Database file
    #[serde(default = "default_db_path")]
    pub path: PathBuf,

    /// Attempts after the first when SQLite reports busy/locked
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Linear backoff step between retries
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,

    /// SQLite busy_timeout per connection
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            path: default_db_path(),
            max_retries: default_max_retries(),
            retry_backoff_ms: default_retry_backoff_ms(),
            busy_timeout_ms: default_busy_timeout_ms(),
        }
    }
}

/// Actor runtime settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeSettings {
    /// Hard mailbox bound; `None` means unbounded-but-monitored
    #[serde(default)]
    pub mailbox_capacity: Option<usize>,

    /// Depth at which a mailbox starts logging warnings
    #[serde(default = "default_mailbox_warn_depth")]
    pub mailbox_warn_depth: usize,

    /// Default timeout for request/reply calls
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,

    /// Restarts allowed per window before a service stays down
    #[serde(default = "default_max_restarts")]
    pub max_restarts: usize,

    #[serde(default = "default_restart_window_secs")]
    pub restart_window_secs: u64,
}

impl Default for RuntimeSettings {
    fn default() -> Self {
        Self {
            mailbox_capacity: None,
            mailbox_warn_depth: default_mailbox_warn_depth(),
            request_timeout_ms: default_request_timeout_ms(),
            max_restarts: default_max_restarts(),
            restart_window_secs: default_restart_window_secs(),
        }
    }
}

impl RuntimeSettings {
    pub fn mailbox_policy(&self) -> MailboxPolicy {
        MailboxPolicy {
            capacity: self.mailbox_capacity,
            warn_depth: self.mailbox_warn_depth,
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn restart_policy(&self) -> RestartPolicy {
        RestartPolicy::Restart {
            max_restarts: self.max_restarts,
            window: Duration::from_secs(self.restart_window_secs),
        }
    }
}

/// Who receives a live push after a publish
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotifyMode {
    /// Only the message's recipients that hold a live connection
    Targeted,
    /// Every live subscriber of the topic
    AllSubscribers,
}

/// Broker settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerSettings {
    #[serde(default = "default_notify_mode")]
    pub notify_mode: NotifyMode,

    /// Messages fetched per storage round trip during replay
    #[serde(default = "default_replay_page_size")]
    pub replay_page_size: usize,

    /// Buffered deliveries per live session before it is treated as stalled
    #[serde(default = "default_session_buffer")]
    pub session_buffer: usize,

    /// Upper bound for a single long-poll wait
    #[serde(default = "default_long_poll_max_secs")]
    pub long_poll_max_secs: u64,
}

impl Default for BrokerSettings {
    fn default() -> Self {
        Self {
            notify_mode: default_notify_mode(),
            replay_page_size: default_replay_page_size(),
            session_buffer: default_session_buffer(),
            long_poll_max_secs: default_long_poll_max_secs(),
        }
    }
}

/// Review orchestration settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReviewSettings {
    /// Start reviewers automatically when a review becomes ready
    #[serde(default = "default_true")]
    pub auto_start: bool,

    #[serde(default = "default_max_concurrent_reviewers")]
    pub max_concurrent_reviewers: usize,

    /// Reviewer deadline for full and performance reviews
    #[serde(default = "default_standard_timeout_ms")]
    pub standard_timeout_ms: u64,

    /// Reviewer deadline for security and architecture reviews
    #[serde(default = "default_extended_timeout_ms")]
    pub extended_timeout_ms: u64,

    /// Model CLI invoked once per review pass
    #[serde(default = "default_review_command")]
    pub command: Vec<String>,

    /// Publish verdicts and failures to the requester's inbox
    #[serde(default = "default_true")]
    pub notify_requester: bool,
}

impl Default for ReviewSettings {
    fn default() -> Self {
        Self {
            auto_start: true,
            max_concurrent_reviewers: default_max_concurrent_reviewers(),
            standard_timeout_ms: default_standard_timeout_ms(),
            extended_timeout_ms: default_extended_timeout_ms(),
            command: default_review_command(),
            notify_requester: true,
        }
    }
}

/// Pending operation queue settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueSettings {
    #[serde(default = "default_ttl_secs")]
    pub default_ttl_secs: u64,

    /// Delivery attempts before an operation is marked failed; `None` retries forever
    #[serde(default = "default_max_attempts")]
    pub max_attempts: Option<u32>,

    /// Interval of the expiry and retention sweep
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,

    /// A claim older than this is handed back to `pending` by the sweep
    #[serde(default = "default_claim_lease_secs")]
    pub claim_lease_secs: u64,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            default_ttl_secs: default_ttl_secs(),
            max_attempts: default_max_attempts(),
            sweep_interval_secs: default_sweep_interval_secs(),
            claim_lease_secs: default_claim_lease_secs(),
        }
    }
}

impl QueueSettings {
    pub fn default_ttl(&self) -> Duration {
        Duration::from_secs(self.default_ttl_secs)
    }

    pub fn claim_lease(&self) -> Duration {
        Duration::from_secs(self.claim_lease_secs)
    }
}

// Default value functions
fn default_true() -> bool {
    true
}

fn default_db_path() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("hermes")
        .join("hermes.db")
}

fn default_max_retries() -> u32 {
    5
}

fn default_retry_backoff_ms() -> u64 {
    25
}

fn default_busy_timeout_ms() -> u64 {
    1000
}

fn default_mailbox_warn_depth() -> usize {
    1024
}

fn default_request_timeout_ms() -> u64 {
    5000
}

fn default_max_restarts() -> usize {
    3
}

fn default_restart_window_secs() -> u64 {
    60
}

fn default_notify_mode() -> NotifyMode {
    NotifyMode::Targeted
}

fn default_replay_page_size() -> usize {
    256
}

fn default_session_buffer() -> usize {
    1024
}

fn default_long_poll_max_secs() -> u64 {
    300
}

fn default_max_concurrent_reviewers() -> usize {
    4
}

fn default_standard_timeout_ms() -> u64 {
    10 * 60 * 1000
}

fn default_extended_timeout_ms() -> u64 {
    15 * 60 * 1000
}

fn default_review_command() -> Vec<String> {
    vec![
        "claude".to_string(),
        "--print".to_string(),
        "--output-format".to_string(),
        "json".to_string(),
    ]
}

fn default_ttl_secs() -> u64 {
    7 * 24 * 60 * 60
}

fn default_max_attempts() -> Option<u32> {
    Some(5)
}

fn default_sweep_interval_secs() -> u64 {
    60
}

fn default_claim_lease_secs() -> u64 {
    300
}

impl HermesConfig {
    /// Default config file location
    pub fn default_path() -> PathBuf {
        dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("hermes")
            .join("config.toml")
    }

    /// Load configuration from a file, falling back to defaults when it is missing
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            tracing::debug!("Config file {} not found, using defaults", path.display());
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path)?;
        let config = Self::from_toml_str(&content)?;
        tracing::info!("Loaded configuration from {}", path.display());
        Ok(config)
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Apply `HERMES_DB_PATH` and `HERMES_REVIEW_COMMAND` overrides
    pub fn apply_env(&mut self) {
        if let Ok(path) = std::env::var("HERMES_DB_PATH") {
            self.storage.path = PathBuf::from(path);
        }
        if let Ok(command) = std::env::var("HERMES_REVIEW_COMMAND") {
            let parts: Vec<String> = command.split_whitespace().map(String::from).collect();
            if !parts.is_empty() {
                self.review.command = parts;
            }
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.runtime.mailbox_capacity == Some(0) {
            return Err(HermesError::Config(
                "runtime.mailbox_capacity must be greater than zero".to_string(),
            ));
        }
        if self.broker.replay_page_size == 0 {
            return Err(HermesError::Config(
                "broker.replay_page_size must be greater than zero".to_string(),
            ));
        }
        if self.broker.session_buffer == 0 {
            return Err(HermesError::Config(
                "broker.session_buffer must be greater than zero".to_string(),
            ));
        }
        if self.review.max_concurrent_reviewers == 0 {
            return Err(HermesError::Config(
                "review.max_concurrent_reviewers must be greater than zero".to_string(),
            ));
        }
        if self.review.command.is_empty() {
            return Err(HermesError::Config(
                "review.command must name a program".to_string(),
            ));
        }
        if self.queue.default_ttl_secs == 0 {
            return Err(HermesError::Config(
                "queue.default_ttl_secs must be greater than zero".to_string(),
            ));
        }
        if self.queue.sweep_interval_secs == 0 {
            return Err(HermesError::Config(
                "queue.sweep_interval_secs must be greater than zero".to_string(),
            ));
        }
        if self.queue.max_attempts == Some(0) {
            return Err(HermesError::Config(
                "queue.max_attempts must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults() {
        let config = HermesConfig::default();
        assert_eq!(config.queue.default_ttl(), Duration::from_secs(604_800));
        assert_eq!(config.review.standard_timeout_ms, 600_000);
        assert_eq!(config.review.extended_timeout_ms, 900_000);
        assert_eq!(config.broker.notify_mode, NotifyMode::Targeted);
        assert_eq!(config.runtime.mailbox_capacity, None);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_toml_fills_defaults() {
        let config = HermesConfig::from_toml_str(
            r#"
            [broker]
            notify_mode = "all_subscribers"

            [queue]
            max_attempts = 2
            "#,
        )
        .unwrap();

        assert_eq!(config.broker.notify_mode, NotifyMode::AllSubscribers);
        assert_eq!(config.queue.max_attempts, Some(2));
        assert_eq!(config.queue.default_ttl_secs, 604_800);
        assert!(config.review.auto_start);
    }

    #[test]
    fn test_invalid_values_rejected() {
        let err = HermesConfig::from_toml_str("[runtime]\nmailbox_capacity = 0\n").unwrap_err();
        assert!(matches!(err, HermesError::Config(_)));

        let err = HermesConfig::from_toml_str("[broker]\nnotify_mode = \"everyone\"\n").unwrap_err();
        assert!(matches!(err, HermesError::Config(_)));
    }

    #[test]
    fn test_load_missing_file_uses_defaults() {
        let temp_dir = TempDir::new().unwrap();
        let config = HermesConfig::load(&temp_dir.path().join("absent.toml")).unwrap();
        assert_eq!(config.queue.sweep_interval_secs, 60);
        assert_eq!(config.queue.claim_lease(), Duration::from_secs(300));
    }

    #[test]
    fn test_load_from_file() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("config.toml");
        std::fs::write(&path, "[review]\nauto_start = false\nmax_concurrent_reviewers = 1\n")
            .unwrap();

        let config = HermesConfig::load(&path).unwrap();
        assert!(!config.review.auto_start);
        assert_eq!(config.review.max_concurrent_reviewers, 1);
    }
}
