//! Pull proxies: remote sources the gateway pulls and republishes, kept
//! in a JSON file so they survive restarts.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::{fs, sync::Mutex};
use tracing::{debug, info};

use crate::{
    error::{GatewayError, Result},
    frame::StreamKey,
    ingest::{RtpTransport, SourceConfig},
    output::OutputFlags,
};

pub const DEFAULT_VHOST: &str = "__defaultVhost__";

const ALLOWED_SCHEMES: [&str; 5] = ["rtsp://", "rtmp://", "rtp://", "http://", "https://"];

fn default_vhost() -> String {
    DEFAULT_VHOST.to_string()
}

const fn default_true() -> bool {
    true
}

const fn default_timeout() -> u64 {
    15
}

const fn default_retry() -> i32 {
    -1
}

/// One pull proxy. Field names follow the stream-proxy API of the
/// management surface; output flags are flattened into the record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PullProxy {
    #[serde(default = "default_vhost")]
    pub vhost: String,
    pub app: String,
    pub stream: String,
    pub url: String,
    #[serde(default = "default_true")]
    pub enable_audio: bool,
    /// RTSP transport: 0 tcp, 1 udp, 2 multicast.
    #[serde(default)]
    pub rtp_type: u8,
    #[serde(default = "default_timeout")]
    pub timeout_sec: u64,
    /// `-1` retries forever.
    #[serde(default = "default_retry")]
    pub retry_count: i32,
    #[serde(flatten)]
    pub outputs: OutputFlags,
    /// Pull only while someone is watching.
    #[serde(default)]
    pub on_demand: bool,
    /// Rebase timestamps to start at zero.
    #[serde(default = "default_true")]
    pub modify_stamp: bool,
    /// Stop pulling once nobody has watched for the idle timeout.
    #[serde(default)]
    pub auto_close: bool,
    /// Start continuous recording whenever the pull is live.
    #[serde(default)]
    pub record: bool,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
}

impl PullProxy {
    #[must_use]
    pub fn new(app: impl Into<String>, stream: impl Into<String>, url: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            vhost: default_vhost(),
            app: app.into(),
            stream: stream.into(),
            url: url.into(),
            enable_audio: true,
            rtp_type: 0,
            timeout_sec: default_timeout(),
            retry_count: default_retry(),
            outputs: OutputFlags::default(),
            on_demand: false,
            modify_stamp: true,
            auto_close: false,
            record: false,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn key(&self) -> Result<StreamKey> {
        StreamKey::new(self.app.as_str(), self.stream.as_str())
    }

    /// `vhost/app/stream`
    #[must_use]
    pub fn id(&self) -> String {
        format!("{}/{}/{}", self.vhost, self.app, self.stream)
    }

    pub fn validate(&self) -> Result<()> {
        self.key()?;
        if self.vhost.is_empty() {
            return Err(GatewayError::InvalidInput("vhost must not be empty".to_string()));
        }
        let lower = self.url.to_ascii_lowercase();
        if !ALLOWED_SCHEMES.iter().any(|scheme| lower.starts_with(scheme)) {
            return Err(GatewayError::InvalidInput(format!(
                "source url must start with one of {}",
                ALLOWED_SCHEMES.join(", ")
            )));
        }
        Ok(())
    }

    #[must_use]
    pub fn source_config(&self) -> SourceConfig {
        SourceConfig {
            url: self.url.clone(),
            transport: RtpTransport::from_rtp_type(self.rtp_type),
            timeout_seconds: self.timeout_sec,
            retry_count: self.retry_count,
            enable_audio: self.enable_audio,
            rebase_timestamps: self.modify_stamp,
        }
    }
}

/// Proxies in insertion order, mirrored to `path` after every change.
pub struct ProxyStore {
    path: Option<PathBuf>,
    proxies: RwLock<IndexMap<String, PullProxy>>,
    write_lock: Mutex<()>,
}

impl ProxyStore {
    /// Store that never touches disk.
    #[must_use]
    pub fn in_memory() -> Self {
        Self {
            path: None,
            proxies: RwLock::new(IndexMap::new()),
            write_lock: Mutex::new(()),
        }
    }

    /// Loads `path`; a missing file is an empty store.
    pub async fn load(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let mut proxies = IndexMap::new();
        match fs::read(&path).await {
            Ok(data) => {
                let list: Vec<PullProxy> = serde_json::from_slice(&data)
                    .map_err(|e| GatewayError::Config(format!("{}: {e}", path.display())))?;
                for proxy in list {
                    proxy.validate()?;
                    proxies.insert(proxy.id(), proxy);
                }
                info!(path = %path.display(), count = proxies.len(), "Pull proxies loaded");
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "No pull proxy store yet");
            }
            Err(e) => return Err(GatewayError::storage(format!("read {}: {e}", path.display()))),
        }
        Ok(Self {
            path: Some(path),
            proxies: RwLock::new(proxies),
            write_lock: Mutex::new(()),
        })
    }

    #[must_use]
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    #[must_use]
    pub fn list(&self) -> Vec<PullProxy> {
        self.proxies.read().values().cloned().collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.proxies.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.proxies.read().is_empty()
    }

    #[must_use]
    pub fn get(&self, vhost: &str, key: &StreamKey) -> Option<PullProxy> {
        self.proxies
            .read()
            .get(&format!("{vhost}/{key}"))
            .cloned()
    }

    /// The proxy feeding `key`, whatever its vhost.
    #[must_use]
    pub fn find(&self, key: &StreamKey) -> Option<PullProxy> {
        self.proxies
            .read()
            .values()
            .find(|p| p.app == key.app && p.stream == key.stream)
            .cloned()
    }

    /// Inserts or replaces a proxy, keeping the original creation time.
    /// A stream can only be fed by one proxy across vhosts.
    pub async fn upsert(&self, mut proxy: PullProxy) -> Result<PullProxy> {
        proxy.validate()?;
        let _guard = self.write_lock.lock().await;
        {
            let mut proxies = self.proxies.write();
            if let Some(other) = proxies
                .values()
                .find(|p| p.app == proxy.app && p.stream == proxy.stream && p.vhost != proxy.vhost)
            {
                return Err(GatewayError::Busy(format!("{} is already pulled by {}", proxy.key()?, other.id())));
            }
            proxy.updated_at = Utc::now();
            if let Some(existing) = proxies.get(&proxy.id()) {
                proxy.created_at = existing.created_at;
            } else {
                proxy.created_at = proxy.updated_at;
            }
            proxies.insert(proxy.id(), proxy.clone());
        }
        self.save().await?;
        Ok(proxy)
    }

    pub async fn remove(&self, vhost: &str, key: &StreamKey) -> Result<PullProxy> {
        let _guard = self.write_lock.lock().await;
        let removed = self
            .proxies
            .write()
            .shift_remove(&format!("{vhost}/{key}"))
            .ok_or_else(|| GatewayError::NotFound(format!("pull proxy {vhost}/{key}")))?;
        self.save().await?;
        Ok(removed)
    }

    async fn save(&self) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let data = serde_json::to_vec_pretty(&self.list())?;
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            fs::create_dir_all(dir)
                .await
                .map_err(|e| GatewayError::storage(format!("create {}: {e}", dir.display())))?;
        }
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, data)
            .await
            .map_err(|e| GatewayError::storage(format!("write {}: {e}", tmp.display())))?;
        fs::rename(&tmp, path)
            .await
            .map_err(|e| GatewayError::storage(format!("rename {}: {e}", path.display())))?;
        Ok(())
    }
}
