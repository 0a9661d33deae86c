//! Configuration module
//!
//! Handles loading and saving msgque configuration.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::protocol::DEFAULT_MAX_MSG_DATA_SIZE;

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Parse error: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Serialize error: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("Config file not found: {0}")]
    NotFound(PathBuf),
}

pub type ConfigResult<T> = Result<T, ConfigError>;

/// Main application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// General settings
    #[serde(default)]
    pub general: GeneralConfig,

    /// Per-queue settings
    #[serde(default)]
    pub queue: QueueConfig,

    /// TCP transport settings
    #[serde(default)]
    pub tcp: TcpConfig,

    /// UDP transport settings
    #[serde(default)]
    pub udp: UdpConfig,

    /// Shutdown watchdog settings
    #[serde(default)]
    pub shutdown: ShutdownConfig,
}

/// General configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    /// Name used in log lines
    #[serde(default = "default_name")]
    pub name: String,
    /// Log filter when not running verbose
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Interval between stats log lines, 0 disables them
    #[serde(default = "default_stats_interval")]
    pub stats_interval_secs: u64,
}

fn default_name() -> String {
    "msgque".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_stats_interval() -> u64 {
    60
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            log_level: default_log_level(),
            stats_interval_secs: default_stats_interval(),
        }
    }
}

/// Queue configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Idle/read/write deadline in seconds, 0 disables it
    #[serde(default = "default_queue_timeout")]
    pub timeout_secs: u64,
    /// Capacity of each queue's outbound channel
    #[serde(default = "default_channel_capacity")]
    pub send_channel_capacity: usize,
    /// Largest payload accepted in a frame head
    #[serde(default = "default_max_msg_data_size")]
    pub max_msg_data_size: u32,
}

fn default_queue_timeout() -> u64 {
    180
}

fn default_channel_capacity() -> usize {
    64
}

fn default_max_msg_data_size() -> u32 {
    DEFAULT_MAX_MSG_DATA_SIZE
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_queue_timeout(),
            send_channel_capacity: default_channel_capacity(),
            max_msg_data_size: default_max_msg_data_size(),
        }
    }
}

/// TCP configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TcpConfig {
    /// Dial timeout in ms
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_ms: u64,
    /// Disable Nagle on every connection
    #[serde(default = "default_true")]
    pub nodelay: bool,
}

fn default_connect_timeout() -> u64 {
    1000
}

fn default_true() -> bool {
    true
}

impl Default for TcpConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: default_connect_timeout(),
            nodelay: default_true(),
        }
    }
}

impl TcpConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

/// UDP configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UdpConfig {
    /// Receive tasks sharing one listening socket
    #[serde(default = "default_reader_tasks")]
    pub reader_tasks: usize,
    /// OS read and write buffer size for the listening socket
    #[serde(default = "default_socket_buffer")]
    pub socket_buffer_bytes: usize,
    /// Datagrams buffered per session before new ones are dropped
    #[serde(default = "default_channel_capacity")]
    pub session_channel_capacity: usize,
    /// Largest datagram read from the socket
    #[serde(default = "default_max_datagram")]
    pub max_datagram_bytes: usize,
    /// Stop sessions whose idle time exceeds the queue timeout
    #[serde(default)]
    pub reap_idle_sessions: bool,
}

fn default_reader_tasks() -> usize {
    32
}

fn default_socket_buffer() -> usize {
    16 * 1024 * 1024 // 16 MiB
}

fn default_max_datagram() -> usize {
    64 * 1024
}

impl Default for UdpConfig {
    fn default() -> Self {
        Self {
            reader_tasks: default_reader_tasks(),
            socket_buffer_bytes: default_socket_buffer(),
            session_channel_capacity: default_channel_capacity(),
            max_datagram_bytes: default_max_datagram(),
            reap_idle_sessions: false,
        }
    }
}

/// Shutdown configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShutdownConfig {
    /// Sleep between checks for outstanding tasks
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,
    /// Polls between two reports of still-running slow operations
    #[serde(default = "default_stall_polls")]
    pub stall_report_polls: u32,
}

fn default_poll_interval() -> u64 {
    1
}

fn default_stall_polls() -> u32 {
    3000
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval(),
            stall_report_polls: default_stall_polls(),
        }
    }
}

impl Config {
    /// Load configuration from a file
    pub fn load(path: &Path) -> ConfigResult<Self> {
        if !path.exists() {
            return Err(ConfigError::NotFound(path.to_path_buf()));
        }

        let contents = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Load configuration from the default location
    pub fn load_default() -> ConfigResult<Self> {
        let config_paths = [
            dirs::config_dir().map(|p| p.join("msgque/config.toml")),
            Some(PathBuf::from("./msgque.toml")),
            Some(PathBuf::from("./config.toml")),
        ];

        for path in config_paths.iter().flatten() {
            if path.exists() {
                return Self::load(path);
            }
        }

        Ok(Self::default())
    }

    /// Save configuration to a file
    pub fn save(&self, path: &Path) -> ConfigResult<()> {
        let contents = toml::to_string_pretty(self)?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        std::fs::write(path, contents)?;
        Ok(())
    }
}

/// Generate a sample configuration file
pub fn generate_sample_config() -> ConfigResult<String> {
    let config = Config {
        general: GeneralConfig {
            name: "edge-gateway".to_string(),
            ..Default::default()
        },
        queue: QueueConfig {
            timeout_secs: 60,
            ..Default::default()
        },
        ..Default::default()
    };

    Ok(toml::to_string_pretty(&config)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.queue.timeout_secs, 180);
        assert_eq!(config.queue.send_channel_capacity, 64);
        assert_eq!(config.queue.max_msg_data_size, 1024 * 1024);
        assert_eq!(config.udp.reader_tasks, 32);
        assert_eq!(config.udp.socket_buffer_bytes, 1 << 24);
        assert_eq!(config.shutdown.stall_report_polls, 3000);
        assert!(!config.udp.reap_idle_sessions);
    }

    #[test]
    fn test_save_and_load() {
        let mut config = Config::default();
        config.tcp.connect_timeout_ms = 250;
        let file = NamedTempFile::new().unwrap();

        config.save(file.path()).unwrap();

        let loaded = Config::load(file.path()).unwrap();
        assert_eq!(loaded.tcp.connect_timeout_ms, 250);
        assert_eq!(loaded.queue.timeout_secs, config.queue.timeout_secs);
    }

    #[test]
    fn test_partial_config_uses_defaults() {
        let parsed: Config = toml::from_str("[udp]\nreader_tasks = 4\n").unwrap();
        assert_eq!(parsed.udp.reader_tasks, 4);
        assert_eq!(parsed.udp.session_channel_capacity, 64);
        assert_eq!(parsed.queue.timeout_secs, 180);
    }

    #[test]
    fn test_missing_file() {
        let err = Config::load(Path::new("/definitely/not/here.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::NotFound(_)));
    }

    #[test]
    fn test_sample_config() {
        let sample = generate_sample_config().unwrap();
        let parsed: Config = toml::from_str(&sample).unwrap();
        assert_eq!(parsed.general.name, "edge-gateway");
        assert_eq!(parsed.queue.timeout_secs, 60);
    }
}
