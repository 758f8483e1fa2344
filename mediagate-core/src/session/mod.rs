//! Session & lifecycle manager: the one place that starts and stops
//! ingests, creates and tears down streams, and routes consumer attach
//! requests.
//!
//! Streams are created by a pull proxy starting (at startup or on the
//! first viewer), by a publisher connecting to a listener, or by an RTP /
//! GB28181 port binding. A background reaper tears down streams whose
//! source has gone away and idle streams that nobody watches or records.

pub mod proxy;

use std::{
    net::{IpAddr, Ipv4Addr},
    sync::Arc,
    time::Duration,
};

use dashmap::{mapref::entry::Entry, DashMap};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn, Instrument};

pub use proxy::{ProxyStore, PullProxy, DEFAULT_VHOST};

use crate::{
    config::{Config, IngestConfig, StreamingConfig},
    error::{GatewayError, Result},
    frame::{Protocol, StreamKey},
    ingest::{
        self, gb28181::Gb28181Binding, rtp::RtpBinding, FrameSource, IngestHandle, IngestRuntime, RtpTransport,
        SourceConfig,
    },
    output::{AttachOptions, OutputRegistry, OutputSession},
    recording::{PolicyStore, RecorderStatus, RecordingEngine},
    registry::{Registry, SourceInfo, StreamHandle, StreamState, StreamSummary},
    storage::{self, SegmentStorage},
};

const REAP_INTERVAL: Duration = Duration::from_secs(1);
/// The HLS storage janitor runs every this many reaper ticks.
const JANITOR_TICKS: u64 = 60;
const TRACK_POLL: Duration = Duration::from_millis(50);

fn bound_origin(transport: RtpTransport, ip: IpAddr, port: u16) -> String {
    let scheme = match transport {
        RtpTransport::Tcp => "tcp",
        RtpTransport::Udp => "udp",
        RtpTransport::Multicast => "multicast",
    };
    format!("{scheme}://{ip}:{port}")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IngestKind {
    /// Pulled from a proxy url, reconnected with backoff.
    Pull,
    /// Pushed to one of our listeners.
    Publish,
    /// Received on a port bound for an RTP or GB28181 handoff.
    Bound,
}

struct ActiveIngest {
    stream: StreamHandle,
    handle: IngestHandle,
    kind: IngestKind,
    close_when_idle: bool,
}

impl ActiveIngest {
    fn is_running(&self) -> bool {
        !self.handle.is_finished() && !self.stream.is_closed()
    }
}

/// Result of a port binding handoff.
#[derive(Debug, Clone, Serialize)]
pub struct BoundPort {
    pub stream_key: String,
    pub port: u16,
}

#[derive(Debug, Clone, Serialize)]
pub struct StreamOverview {
    #[serde(flatten)]
    pub summary: StreamSummary,
    pub ingest: Option<IngestKind>,
    pub recording: Option<RecorderStatus>,
}

pub struct SessionManager {
    registry: Arc<Registry>,
    outputs: Arc<OutputRegistry>,
    recording: Arc<RecordingEngine>,
    proxies: Arc<ProxyStore>,
    hls_storage: Arc<dyn SegmentStorage>,
    ingest_config: IngestConfig,
    streaming: StreamingConfig,
    bind_ip: IpAddr,
    load_proxies: bool,
    ingests: DashMap<StreamKey, ActiveIngest>,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl SessionManager {
    #[must_use]
    pub fn new(
        config: &Config,
        registry: Arc<Registry>,
        outputs: Arc<OutputRegistry>,
        recording: Arc<RecordingEngine>,
        proxies: Arc<ProxyStore>,
        hls_storage: Arc<dyn SegmentStorage>,
    ) -> Arc<Self> {
        let bind_ip = config
            .server
            .host
            .parse()
            .unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED));
        Arc::new(Self {
            registry,
            outputs,
            recording,
            proxies,
            hls_storage,
            ingest_config: config.ingest.clone(),
            streaming: config.streaming.clone(),
            bind_ip,
            load_proxies: config.proxies.load_on_startup,
            ingests: DashMap::new(),
            cancel: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// Builds every component from configuration.
    pub async fn from_config(config: &Config) -> Result<Arc<Self>> {
        let policies = Arc::new(PolicyStore::with_overrides(
            config.recording.default_policy,
            &config.recording.policies,
        )?);
        let registry = Registry::init(config.streaming.gop_cache_size, Arc::clone(&policies));
        let hls_storage = storage::from_config(&config.hls_storage);
        let outputs = Arc::new(OutputRegistry::new(&config.streaming, Arc::clone(&hls_storage)));
        let recording = RecordingEngine::new(
            &config.recording,
            config.streaming.recorder_queue_capacity,
            policies,
        );
        let proxies = Arc::new(ProxyStore::load(&config.proxies.store_path).await?);
        Ok(Self::new(config, registry, outputs, recording, proxies, hls_storage))
    }

    #[must_use]
    pub const fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    #[must_use]
    pub const fn outputs(&self) -> &Arc<OutputRegistry> {
        &self.outputs
    }

    #[must_use]
    pub const fn recording(&self) -> &Arc<RecordingEngine> {
        &self.recording
    }

    #[must_use]
    pub const fn proxies(&self) -> &Arc<ProxyStore> {
        &self.proxies
    }

    #[must_use]
    pub fn policies(&self) -> &Arc<PolicyStore> {
        self.recording.policies()
    }

    /// Reconciles the recording index, starts the background tasks and the
    /// stored pull proxies.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        self.recording.reconcile().await?;

        let sweeper = self.recording.spawn_sweeper(self.cancel.child_token());
        let reaper = self.spawn_reaper();
        self.tasks.lock().extend([sweeper, reaper]);

        if self.load_proxies {
            for proxy in self.proxies.list().into_iter().filter(|p| !p.on_demand) {
                if let Err(e) = self.start_pull(&proxy) {
                    warn!(proxy = %proxy.id(), error = %e, "Could not start pull proxy");
                }
            }
        }
        info!(proxies = self.proxies.len(), "Session manager started");
        Ok(())
    }

    /// Stores a proxy and starts it unless it is on demand. An existing
    /// ingest for the stream is replaced; attached viewers stay.
    pub async fn create_pull(&self, proxy: PullProxy) -> Result<PullProxy> {
        let stored = self.proxies.upsert(proxy).await?;
        let key = stored.key()?;
        self.stop_ingest(&key).await;
        if !stored.on_demand {
            self.start_pull(&stored)?;
        }
        info!(proxy = %stored.id(), url = %stored.url, on_demand = stored.on_demand, "Pull proxy saved");
        Ok(stored)
    }

    /// Deletes a proxy and tears its stream down.
    pub async fn remove_pull(&self, vhost: &str, key: &StreamKey) -> Result<PullProxy> {
        let removed = self.proxies.remove(vhost, key).await?;
        self.stop_ingest(key).await;
        match self.registry.release(key, true) {
            Ok(()) | Err(GatewayError::NotFound(_)) => {}
            Err(e) => return Err(e),
        }
        info!(proxy = %removed.id(), "Pull proxy removed");
        Ok(removed)
    }

    /// Starts pulling a proxy, or returns its stream if it already runs.
    pub fn start_pull(&self, proxy: &PullProxy) -> Result<StreamHandle> {
        let key = proxy.key()?;
        let source = proxy.source_config();
        let adapter = ingest::adapter_for(&source)?;
        let runtime = IngestRuntime::new(&self.ingest_config, &self.streaming, &source);
        let (stream, started) = self.launch(&key, IngestKind::Pull, proxy.auto_close || proxy.on_demand, |stream| {
            stream.set_outputs(proxy.outputs);
            Ok(IngestHandle::start(Arc::clone(stream), adapter, source, runtime))
        })?;
        if started {
            self.stream_started(&stream, proxy.record);
        }
        Ok(stream)
    }

    /// A publisher was accepted by a listener. `Busy` when the stream
    /// already has a source.
    pub fn on_publish(
        &self,
        key: &StreamKey,
        protocol: Protocol,
        origin: String,
        source: Box<dyn FrameSource>,
    ) -> Result<StreamHandle> {
        let runtime = IngestRuntime::new(&self.ingest_config, &self.streaming, &SourceConfig::new(origin.clone()));
        let (stream, _) = self.launch(key, IngestKind::Publish, false, move |stream| {
            Ok(IngestHandle::run_source(
                Arc::clone(stream),
                source,
                SourceInfo { protocol, origin },
                runtime,
            ))
        })?;
        self.stream_started(&stream, false);
        Ok(stream)
    }

    /// GB28181 media handoff after SIP negotiation: binds the receive port
    /// and returns it.
    pub async fn bind_gb28181(&self, binding: Gb28181Binding) -> Result<BoundPort> {
        let key = binding.key()?;
        self.ensure_no_source(&key)?;
        let source = binding.bind(self.bind_ip, self.ingest_config.rtp_port_range).await?;
        let port = source.local_port()?;
        let origin = bound_origin(RtpTransport::from(binding.transport), self.bind_ip, port);
        self.run_bound(&key, Protocol::Gb28181, origin, Box::new(source))?;
        info!(stream = %key, port, ssrc = ?binding.ssrc, "GB28181 receiver bound");
        Ok(BoundPort {
            stream_key: key.to_string(),
            port,
        })
    }

    /// Plain RTP handoff: binds the receive port and returns it.
    pub async fn bind_rtp(&self, binding: RtpBinding) -> Result<BoundPort> {
        let key = binding.key()?;
        self.ensure_no_source(&key)?;
        let source = binding.bind(self.bind_ip, self.ingest_config.rtp_port_range).await?;
        let port = source.local_port()?;
        let origin = bound_origin(binding.transport, self.bind_ip, port);
        self.run_bound(&key, Protocol::Rtp, origin, Box::new(source))?;
        info!(stream = %key, port, "RTP receiver bound");
        Ok(BoundPort {
            stream_key: key.to_string(),
            port,
        })
    }

    fn run_bound(&self, key: &StreamKey, protocol: Protocol, origin: String, source: Box<dyn FrameSource>) -> Result<()> {
        let runtime = IngestRuntime::new(&self.ingest_config, &self.streaming, &SourceConfig::new(origin.clone()));
        let (stream, _) = self.launch(key, IngestKind::Bound, false, move |stream| {
            Ok(IngestHandle::run_source(
                Arc::clone(stream),
                source,
                SourceInfo { protocol, origin },
                runtime,
            ))
        })?;
        self.stream_started(&stream, false);
        Ok(())
    }

    /// Attaches a consumer. A stream fed by an on-demand proxy (or one whose
    /// pull is not running) is started first.
    pub async fn attach(&self, key: &StreamKey, protocol: Protocol, options: AttachOptions) -> Result<OutputSession> {
        let running = self.ingests.get(key).is_some_and(|a| a.is_running());
        let stream = match self.proxies.find(key) {
            Some(proxy) if !running => {
                debug!(stream = %key, %protocol, "Starting pull on demand");
                let stream = self.start_pull(&proxy)?;
                self.wait_for_tracks(&stream).await?;
                stream
            }
            _ => self.registry.lookup(key)?,
        };
        self.outputs.attach(&stream, protocol, options).await
    }

    /// Attach with the configured default options.
    pub async fn attach_default(&self, key: &StreamKey, protocol: Protocol) -> Result<OutputSession> {
        self.attach(key, protocol, self.outputs.default_options()).await
    }

    /// Tears a stream down; without `force` this is refused while it has
    /// viewers or open recordings.
    pub async fn release_stream(&self, key: &StreamKey, force: bool) -> Result<()> {
        let stream = self.registry.lookup(key)?;
        self.registry.release(key, force)?;
        if let Some((_, active)) = self
            .ingests
            .remove_if(key, |_, active| Arc::ptr_eq(&active.stream, &stream))
        {
            active.handle.stop().await;
        }
        Ok(())
    }

    #[must_use]
    pub fn streams(&self) -> Vec<StreamOverview> {
        self.registry
            .list_active()
            .iter()
            .map(|stream| self.overview(stream))
            .collect()
    }

    pub fn stream(&self, key: &StreamKey) -> Result<StreamOverview> {
        Ok(self.overview(&self.registry.lookup(key)?))
    }

    fn overview(&self, stream: &StreamHandle) -> StreamOverview {
        StreamOverview {
            summary: stream.summary(),
            ingest: self
                .ingests
                .get(stream.key())
                .filter(|a| a.is_running())
                .map(|a| a.kind),
            recording: self.recording.status(stream.key()),
        }
    }

    fn ensure_no_source(&self, key: &StreamKey) -> Result<()> {
        match self.ingests.get(key) {
            Some(active) if active.is_running() => Err(GatewayError::Busy(format!("{key} already has a source"))),
            _ => Ok(()),
        }
    }

    /// The registered stream, replaced by a fresh one if the current
    /// instance can no longer carry media.
    fn fresh_stream(&self, key: &StreamKey) -> Result<StreamHandle> {
        if let Ok(stream) = self.registry.lookup(key) {
            if stream.state() == StreamState::Failed || stream.bus().is_closed() {
                let _ = self.registry.release(key, true);
            }
        }
        self.registry.register(key)
    }

    /// Starts an ingest under the per-key entry lock so two sources cannot
    /// race onto one stream. Returns the stream and whether a new ingest
    /// was started; a running pull is reused by another pull request.
    fn launch(
        &self,
        key: &StreamKey,
        kind: IngestKind,
        close_when_idle: bool,
        start: impl FnOnce(&StreamHandle) -> Result<IngestHandle>,
    ) -> Result<(StreamHandle, bool)> {
        let entry = self.ingests.entry(key.clone());
        if let Entry::Occupied(existing) = &entry {
            let active = existing.get();
            if active.is_running() {
                if kind == IngestKind::Pull && active.kind == IngestKind::Pull {
                    return Ok((Arc::clone(&active.stream), false));
                }
                return Err(GatewayError::Busy(format!("{key} already has a source")));
            }
        }
        let stream = self.fresh_stream(key)?;
        let handle = start(&stream)?;
        entry.insert(ActiveIngest {
            stream: Arc::clone(&stream),
            handle,
            kind,
            close_when_idle,
        });
        Ok((stream, true))
    }

    fn stream_started(&self, stream: &StreamHandle, record: bool) {
        if let Err(e) = self.recording.attach(stream) {
            warn!(stream = %stream.key(), error = %e, "Recorder could not attach");
            return;
        }
        if record {
            let recording = Arc::clone(&self.recording);
            let key = stream.key().clone();
            tokio::spawn(async move {
                match recording.start_continuous(&key).await {
                    Ok(()) => info!(stream = %key, "Continuous recording started"),
                    Err(GatewayError::Busy(_)) => {}
                    Err(e) => warn!(stream = %key, error = %e, "Could not start recording"),
                }
            });
        }
    }

    async fn stop_ingest(&self, key: &StreamKey) -> bool {
        match self.ingests.remove(key) {
            Some((_, active)) => {
                active.handle.stop().await;
                true
            }
            None => false,
        }
    }

    async fn wait_for_tracks(&self, stream: &StreamHandle) -> Result<()> {
        let limit = Duration::from_secs(self.ingest_config.connect_timeout_seconds.max(1));
        let ready = tokio::time::timeout(limit, async {
            loop {
                if !stream.tracks().is_empty() {
                    return Ok(());
                }
                if stream.state() == StreamState::Failed || stream.is_closed() {
                    return Err(GatewayError::Transport(format!("pull of {} failed", stream.key())));
                }
                tokio::time::sleep(TRACK_POLL).await;
            }
        })
        .await;
        ready.unwrap_or_else(|_| {
            Err(GatewayError::Transport(format!(
                "{} produced no tracks within {limit:?}",
                stream.key()
            )))
        })
    }

    /// Releases `stream` if the registry still holds this instance.
    fn release_instance(&self, stream: &StreamHandle) -> bool {
        match self.registry.lookup(stream.key()) {
            Ok(current) if Arc::ptr_eq(&current, stream) => self.registry.release(stream.key(), true).is_ok(),
            _ => {
                stream.close();
                false
            }
        }
    }

    /// One reaper pass; returns how many streams were torn down.
    pub async fn reap(&self) -> usize {
        let mut released = 0;

        let finished: Vec<StreamKey> = self
            .ingests
            .iter()
            .filter(|entry| entry.handle.is_finished())
            .map(|entry| entry.key().clone())
            .collect();
        for key in finished {
            let Some((_, active)) = self.ingests.remove_if(&key, |_, a| a.handle.is_finished()) else {
                continue;
            };
            let failed = active.stream.state() == StreamState::Failed;
            if active.kind == IngestKind::Pull && !failed {
                continue;
            }
            if failed {
                warn!(stream = %key, "Ingest failed, tearing stream down");
            } else {
                info!(stream = %key, kind = ?active.kind, "Source ended, tearing stream down");
            }
            if self.release_instance(&active.stream) {
                released += 1;
            }
        }

        let idle_timeout = Duration::from_secs(self.streaming.idle_timeout_seconds);
        for stream in self.registry.list_active() {
            let Some(idle) = stream.touch_idle() else {
                continue;
            };
            if idle < idle_timeout || stream.open_recordings() > 0 || self.recording.is_recording(stream.key()) {
                continue;
            }
            let key = stream.key().clone();
            let close = self.ingests.get(&key).is_none_or(|a| a.close_when_idle);
            if !close {
                continue;
            }
            if let Some((_, active)) = self.ingests.remove(&key) {
                active.handle.stop().await;
            }
            info!(stream = %key, idle_seconds = idle.as_secs(), "Idle stream torn down");
            if self.release_instance(&stream) {
                released += 1;
            }
        }
        released
    }

    /// Drops HLS storage entries that outlived every playlist referencing
    /// them.
    async fn clean_hls_storage(&self) {
        let playlist_ms = self.streaming.hls_segment_duration_ms.max(1000)
            * i64::try_from(self.streaming.hls_playlist_length + 2).unwrap_or(i64::MAX);
        let window = Duration::from_millis(u64::try_from(playlist_ms).unwrap_or(u64::MAX))
            .max(Duration::from_secs(self.streaming.idle_timeout_seconds));
        match self.hls_storage.cleanup(window * 2).await {
            Ok(0) => {}
            Ok(removed) => debug!(removed, "Orphaned HLS segments removed"),
            Err(e) => warn!(error = %e, "HLS storage cleanup failed"),
        }
    }

    fn spawn_reaper(self: &Arc<Self>) -> JoinHandle<()> {
        let manager = Arc::clone(self);
        let cancel = self.cancel.child_token();
        tokio::spawn(
            async move {
                let mut ticker = tokio::time::interval(REAP_INTERVAL);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                let mut ticks: u64 = 0;
                loop {
                    tokio::select! {
                        () = cancel.cancelled() => break,
                        _ = ticker.tick() => {
                            manager.reap().await;
                            ticks += 1;
                            if ticks % JANITOR_TICKS == 0 {
                                manager.clean_hls_storage().await;
                            }
                        }
                    }
                }
            }
            .instrument(tracing::info_span!("reaper")),
        )
    }

    /// Stops ingests, drains the registry and waits for recorders to close
    /// their segments. Returns false if anything hit `timeout`.
    pub async fn shutdown(&self, timeout: Duration) -> bool {
        info!("Session manager shutting down");
        self.cancel.cancel();

        let keys: Vec<StreamKey> = self.ingests.iter().map(|e| e.key().clone()).collect();
        let stops: Vec<_> = keys
            .iter()
            .filter_map(|key| self.ingests.remove(key))
            .map(|(_, active)| active.handle.stop())
            .collect();
        futures::future::join_all(stops).await;

        self.outputs.hls().stop_all();
        let drained = self.registry.drain(timeout).await;
        let recorded = self.recording.shutdown(timeout).await;

        let tasks: Vec<_> = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            let _ = task.await;
        }
        drained && recorded
    }
}
