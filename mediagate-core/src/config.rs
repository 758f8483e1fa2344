use config::{Config as ConfigBuilder, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

/// Application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub logging: LoggingConfig,
    pub streaming: StreamingConfig,
    pub ingest: IngestConfig,
    pub recording: RecordingConfig,
    pub proxies: ProxyStoreConfig,
    pub hls_storage: HlsStorageConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub http_port: u16,
    pub rtmp_port: u16,
    pub rtsp_port: u16,
    pub shutdown_timeout_seconds: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            http_port: 8080,
            rtmp_port: 1935,
            rtsp_port: 554,
            shutdown_timeout_seconds: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String, // "json" or "pretty"
    pub file_path: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
            file_path: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamingConfig {
    pub gop_cache_size: usize, // In number of GOPs
    /// Frames buffered per output consumer before it is dropped as overrun.
    pub consumer_queue_capacity: usize,
    pub recorder_queue_capacity: usize,
    /// Grace period before an unused stream (or HLS segmenter) is torn down.
    pub idle_timeout_seconds: u64,
    pub io_timeout_seconds: u64,
    pub hls_segment_duration_ms: i64,
    pub hls_playlist_length: usize,
    pub webrtc_stun_servers: Vec<String>,
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            gop_cache_size: 1,
            consumer_queue_capacity: 512,
            recorder_queue_capacity: 4096,
            idle_timeout_seconds: 30,
            io_timeout_seconds: 10,
            hls_segment_duration_ms: 4000,
            hls_playlist_length: 5,
            webrtc_stun_servers: vec!["stun:stun.l.google.com:19302".to_string()],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IngestConfig {
    pub max_attempts: u32,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    pub connect_timeout_seconds: u64,
    /// Inclusive port range used when a GB28181/RTP binding asks for port 0.
    pub rtp_port_range: [u16; 2],
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            backoff_base_ms: 1000,
            backoff_max_ms: 30_000,
            connect_timeout_seconds: 15,
            rtp_port_range: [30000, 30500],
        }
    }
}

/// Per-stream retention policy, camelCase on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RetentionPolicy {
    pub max_age_days: u32,
    /// 0 = unbounded
    pub max_total_bytes: u64,
    pub pre_roll_seconds: u32,
    pub post_roll_seconds: u32,
    pub segment_duration_seconds: u32,
    pub segment_max_bytes: u64,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            max_age_days: 3,
            max_total_bytes: 0,
            pre_roll_seconds: 5,
            post_roll_seconds: 10,
            segment_duration_seconds: 60,
            segment_max_bytes: 512 * 1024 * 1024,
        }
    }
}

impl RetentionPolicy {
    /// Derives the segment length from "keep N days split into M files".
    #[must_use]
    pub fn from_keep_days(days: u32, keep_segments: u32) -> Self {
        let segment_duration_seconds = (days * 86_400)
            .checked_div(keep_segments)
            .unwrap_or(86_400)
            .max(1);
        Self {
            max_age_days: days,
            segment_duration_seconds,
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.segment_duration_seconds == 0 {
            return Err("segmentDurationSeconds must be positive".to_string());
        }
        if self.segment_max_bytes == 0 {
            return Err("segmentMaxBytes must be positive".to_string());
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RecordingConfig {
    pub root: String,
    pub sweep_interval_seconds: u64,
    pub storage_retry_attempts: usize,
    pub default_policy: RetentionPolicy,
    /// Overrides keyed by `app/stream`.
    pub policies: HashMap<String, RetentionPolicy>,
}

impl Default for RecordingConfig {
    fn default() -> Self {
        Self {
            root: "./record".to_string(),
            sweep_interval_seconds: 60,
            storage_retry_attempts: 3,
            default_policy: RetentionPolicy::default(),
            policies: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyStoreConfig {
    pub store_path: String,
    pub load_on_startup: bool,
}

impl Default for ProxyStoreConfig {
    fn default() -> Self {
        Self {
            store_path: "./data/pull_proxies.json".to_string(),
            load_on_startup: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HlsStorageBackend {
    #[default]
    Memory,
    File,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HlsStorageConfig {
    pub backend: HlsStorageBackend,
    /// Directory for the file backend.
    pub path: String,
    /// Memory backend budget; 0 = backend default.
    pub max_bytes: usize,
}

impl Default for HlsStorageConfig {
    fn default() -> Self {
        Self {
            backend: HlsStorageBackend::Memory,
            path: "./data/hls".to_string(),
            max_bytes: 0,
        }
    }
}

impl Config {
    /// Load configuration from multiple sources with priority:
    /// 1. Environment variables (highest priority)
    /// 2. Config file (if provided)
    /// 3. Defaults (lowest priority)
    pub fn load(config_file: Option<&str>) -> Result<Self, ConfigError> {
        let mut builder = ConfigBuilder::builder();

        if let Some(path) = config_file {
            if Path::new(path).exists() {
                builder = builder.add_source(File::with_name(path));
            }
        }

        // Override with environment variables (MEDIAGATE_SERVER__HTTP_PORT, etc.)
        builder = builder.add_source(
            Environment::with_prefix("MEDIAGATE")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let config: Self = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_env() -> Result<Self, ConfigError> {
        Self::load(None)
    }

    pub fn from_file(path: &str) -> Result<Self, ConfigError> {
        Self::load(Some(path))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: &str| Err(ConfigError::Message(msg.to_string()));

        if self.server.http_port == 0 || self.server.rtmp_port == 0 || self.server.rtsp_port == 0 {
            return invalid("server ports must be non-zero");
        }
        if self.recording.root.trim().is_empty() {
            return invalid("recording.root must not be empty");
        }
        if self.streaming.consumer_queue_capacity == 0 || self.streaming.recorder_queue_capacity == 0 {
            return invalid("queue capacities must be positive");
        }
        let [low, high] = self.ingest.rtp_port_range;
        if low == 0 || low > high {
            return invalid("ingest.rtp_port_range must be a non-empty range of non-zero ports");
        }
        if !matches!(self.logging.format.as_str(), "json" | "pretty") {
            return invalid("logging.format must be \"json\" or \"pretty\"");
        }
        if let Err(e) = self.recording.default_policy.validate() {
            return Err(ConfigError::Message(e));
        }
        Ok(())
    }

    #[must_use]
    pub fn http_address(&self) -> String {
        format!("{}:{}", self.server.host, self.server.http_port)
    }

    #[must_use]
    pub fn rtmp_address(&self) -> String {
        format!("{}:{}", self.server.host, self.server.rtmp_port)
    }

    #[must_use]
    pub fn rtsp_address(&self) -> String {
        format!("{}:{}", self.server.host, self.server.rtsp_port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.server.http_port, 8080);
        assert_eq!(config.streaming.consumer_queue_capacity, 512);
        assert_eq!(config.ingest.max_attempts, 5);
        assert_eq!(config.recording.default_policy.pre_roll_seconds, 5);
        assert_eq!(config.http_address(), "0.0.0.0:8080");
    }

    #[test]
    fn test_validate_rejects() {
        let mut config = Config::default();
        config.ingest.rtp_port_range = [31000, 30000];
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.logging.format = "xml".to_string();
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.recording.root = " ".to_string();
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.streaming.consumer_queue_capacity = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_policy_wire_format() {
        let policy: RetentionPolicy =
            serde_json::from_str(r#"{"maxAgeDays": 7, "preRollSeconds": 3}"#).unwrap();
        assert_eq!(policy.max_age_days, 7);
        assert_eq!(policy.pre_roll_seconds, 3);
        assert_eq!(policy.post_roll_seconds, 10);

        let json = serde_json::to_value(RetentionPolicy::default()).unwrap();
        assert!(json.get("segmentDurationSeconds").is_some());
    }

    #[test]
    fn test_from_keep_days() {
        let policy = RetentionPolicy::from_keep_days(3, 72);
        assert_eq!(policy.segment_duration_seconds, 3600);
        assert_eq!(policy.max_age_days, 3);
        assert_eq!(RetentionPolicy::from_keep_days(1, 0).segment_duration_seconds, 86_400);
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mediagate.json");
        std::fs::write(
            &path,
            r#"{"server": {"rtmp_port": 19350}, "recording": {"root": "/tmp/rec"}}"#,
        )
        .unwrap();
        let config = Config::from_file(path.to_str().unwrap()).unwrap();
        assert_eq!(config.server.rtmp_port, 19350);
        assert_eq!(config.server.http_port, 8080);
        assert_eq!(config.recording.root, "/tmp/rec");
    }
}
