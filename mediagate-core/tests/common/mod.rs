#![allow(dead_code)]

use std::{
    io,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use bytes::Bytes;
use mediagate_core::{
    config::{RecordingConfig, RetentionPolicy, StreamingConfig},
    output::OutputRegistry,
    recording::{DiskFiles, PolicyStore, RecordingEngine, SegmentFile, SegmentFiles, SegmentRecord},
    registry::{Registry, StreamHandle},
    storage::MemoryStorage,
    CodecTag, Frame, StreamKey, TrackInfo,
};

const SPS: &[u8] = &[
    0x67, 0x42, 0xC0, 0x1E, 0xDA, 0x02, 0x80, 0xBF, 0xE5, 0x84, 0x00, 0x00, 0x03, 0x00, 0x04, 0x00, 0x00, 0x03, 0x00,
    0xF2, 0x3C, 0x58, 0xBA, 0x80,
];
const PPS: &[u8] = &[0x68, 0xCE, 0x3C, 0x80];

pub fn video_track() -> TrackInfo {
    let mut config = Vec::new();
    for unit in [SPS, PPS] {
        config.extend_from_slice(&[0, 0, 0, 1]);
        config.extend_from_slice(unit);
    }
    TrackInfo::video(CodecTag::H264, Some(Bytes::from(config)))
}

pub fn video(ts: i64, keyframe: bool) -> Frame {
    let nal: &'static [u8] = if keyframe {
        &[0, 0, 0, 1, 0x65, 0x88, 0x84, 0x00, 0x33]
    } else {
        &[0, 0, 0, 1, 0x41, 0x9A, 0x02]
    };
    Frame::video(CodecTag::H264, ts, ts, keyframe, Bytes::from_static(nal))
}

pub struct Harness {
    pub registry: Arc<Registry>,
    pub policies: Arc<PolicyStore>,
    pub recording: Arc<RecordingEngine>,
    pub outputs: OutputRegistry,
}

impl Harness {
    pub fn new(root: &Path, policy: RetentionPolicy) -> Self {
        Self::with_files(root, policy, Arc::new(DiskFiles))
    }

    pub fn with_files(root: &Path, policy: RetentionPolicy, files: Arc<dyn SegmentFiles>) -> Self {
        let policies = Arc::new(PolicyStore::new(policy));
        let config = RecordingConfig {
            root: root.to_string_lossy().into_owned(),
            storage_retry_attempts: 1,
            default_policy: policy,
            ..RecordingConfig::default()
        };
        Self {
            registry: Registry::init(1, Arc::clone(&policies)),
            recording: RecordingEngine::with_files(&config, 16_384, Arc::clone(&policies), files),
            outputs: OutputRegistry::new(&StreamingConfig::default(), Arc::new(MemoryStorage::new())),
            policies,
        }
    }

    pub fn stream(&self, name: &str) -> StreamHandle {
        let stream = self.registry.register(&key(name)).unwrap();
        stream.bus().set_tracks(vec![video_track()]);
        stream
    }
}

pub fn key(name: &str) -> StreamKey {
    StreamKey::new("live", name).unwrap()
}

pub async fn wait_for<T>(mut check: impl FnMut() -> Option<T>) -> T {
    for _ in 0..500 {
        if let Some(value) = check() {
            return value;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached in time");
}

pub async fn wait_for_segments(recording: &RecordingEngine, key: &StreamKey, count: usize) -> Vec<SegmentRecord> {
    wait_for(|| {
        let segments = recording.list_segments(key, None, None);
        (segments.len() >= count).then_some(segments)
    })
    .await
}

#[derive(Default)]
struct Faults {
    appends: AtomicUsize,
    /// 1-based append to fail, counted across all files; 0 never fails.
    fail_append: AtomicUsize,
    fail_sync: AtomicBool,
}

/// Segment files on disk that fail when told to.
#[derive(Default)]
pub struct FaultyFiles {
    faults: Arc<Faults>,
}

impl FaultyFiles {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn fail_append(&self, nth: usize) {
        self.faults.fail_append.store(nth, Ordering::SeqCst);
    }

    pub fn fail_sync(&self, fail: bool) {
        self.faults.fail_sync.store(fail, Ordering::SeqCst);
    }
}

struct FaultyFile {
    file: Box<dyn SegmentFile>,
    faults: Arc<Faults>,
}

#[async_trait]
impl SegmentFiles for FaultyFiles {
    async fn create(&self, path: &Path) -> io::Result<Box<dyn SegmentFile>> {
        Ok(Box::new(FaultyFile {
            file: DiskFiles.create(path).await?,
            faults: Arc::clone(&self.faults),
        }))
    }
}

#[async_trait]
impl SegmentFile for FaultyFile {
    async fn append(&mut self, data: &[u8]) -> io::Result<()> {
        let n = self.faults.appends.fetch_add(1, Ordering::SeqCst) + 1;
        if n == self.faults.fail_append.load(Ordering::SeqCst) {
            return Err(io::Error::other("injected write failure"));
        }
        self.file.append(data).await
    }

    async fn sync(&mut self) -> io::Result<()> {
        if self.faults.fail_sync.load(Ordering::SeqCst) {
            return Err(io::Error::other("injected sync failure"));
        }
        self.file.sync().await
    }
}

/// Every `.ts` file below `root`.
pub fn media_files(root: &Path) -> Vec<PathBuf> {
    let mut files = Vec::new();
    let mut pending = vec![root.to_path_buf()];
    while let Some(dir) = pending.pop() {
        let Ok(entries) = std::fs::read_dir(&dir) else {
            continue;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() {
                pending.push(path);
            } else if path.extension().is_some_and(|ext| ext == "ts") {
                files.push(path);
            }
        }
    }
    files
}
