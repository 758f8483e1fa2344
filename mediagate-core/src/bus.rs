//! Per-stream frame fan-out.
//!
//! Every consumer owns a bounded queue. Publishing never waits: a consumer
//! whose queue is full is detached on the spot and learns about it as an
//! overrun once it has drained what was already queued. Attach, detach and
//! delivery all happen under one short lock, so a new consumer sees either
//! all of a frame's successors or none of them.

use std::{
    collections::{HashMap, VecDeque},
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Weak,
    },
};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::warn;

use crate::{
    error::{GatewayError, Result},
    frame::{Frame, Protocol, TrackInfo, TrackKind},
};

/// A GOP that grows past this without a keyframe is not worth replaying.
const MAX_GOP_FRAMES: usize = 8192;

#[derive(Debug, Clone, Copy)]
pub struct SubscribeOptions {
    /// Hold delivery until the next keyframe (video keyframe when the
    /// stream has video).
    pub start_at_keyframe: bool,
    /// Start from the cached GOPs instead of waiting, when they fit.
    pub replay_gop: bool,
    pub capacity: usize,
}

impl SubscribeOptions {
    #[must_use]
    pub const fn live(capacity: usize) -> Self {
        Self {
            start_at_keyframe: true,
            replay_gop: true,
            capacity,
        }
    }

    /// After an overrun: next keyframe, no replay.
    #[must_use]
    pub const fn resync(capacity: usize) -> Self {
        Self {
            start_at_keyframe: true,
            replay_gop: false,
            capacity,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct BusStats {
    pub frames: u64,
    pub bytes: u64,
    pub overruns: u64,
    pub last_frame_at: Option<DateTime<Utc>>,
}

struct Slot {
    id: u64,
    protocol: Protocol,
    tx: mpsc::Sender<Frame>,
    waiting_keyframe: bool,
    overrun: Arc<AtomicBool>,
}

#[derive(Default)]
struct BusInner {
    next_seq: u64,
    consumers: Vec<Slot>,
    gops: VecDeque<Vec<Frame>>,
    tracks: Vec<TrackInfo>,
    seen_video: bool,
    closed: bool,
    stats: BusStats,
}

impl BusInner {
    fn has_video(&self) -> bool {
        self.seen_video || self.tracks.iter().any(|t| t.kind == TrackKind::Video)
    }
}

pub struct FrameBus {
    inner: Mutex<BusInner>,
    gop_cache_size: usize,
    next_consumer: AtomicU64,
}

impl FrameBus {
    #[must_use]
    pub fn new(gop_cache_size: usize) -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(BusInner::default()),
            gop_cache_size,
            next_consumer: AtomicU64::new(1),
        })
    }

    /// Delivers a frame to every consumer; returns the assigned sequence
    /// number, or `None` once the bus is closed.
    pub fn publish(&self, mut frame: Frame) -> Option<u64> {
        let mut overran = Vec::new();
        let seq = {
            let mut inner = self.inner.lock();
            if inner.closed {
                return None;
            }
            let seq = inner.next_seq;
            inner.next_seq += 1;
            frame.seq = seq;

            inner.stats.frames += 1;
            inner.stats.bytes += frame.payload.len() as u64;
            inner.stats.last_frame_at = Some(Utc::now());
            if frame.is_video() {
                inner.seen_video = true;
            }
            let opens_gop = frame.keyframe && (frame.is_video() || !inner.has_video());

            if self.gop_cache_size > 0 {
                if opens_gop {
                    inner.gops.push_back(vec![frame.clone()]);
                    while inner.gops.len() > self.gop_cache_size {
                        inner.gops.pop_front();
                    }
                } else if let Some(gop) = inner.gops.back_mut() {
                    gop.push(frame.clone());
                    if gop.len() > MAX_GOP_FRAMES {
                        inner.gops.clear();
                    }
                }
            }

            inner.consumers.retain_mut(|slot| {
                if slot.waiting_keyframe {
                    if !opens_gop {
                        return true;
                    }
                    slot.waiting_keyframe = false;
                }
                match slot.tx.try_send(frame.clone()) {
                    Ok(()) => true,
                    Err(TrySendError::Full(_)) => {
                        slot.overrun.store(true, Ordering::Release);
                        overran.push((slot.id, slot.protocol));
                        false
                    }
                    Err(TrySendError::Closed(_)) => false,
                }
            });
            inner.stats.overruns += overran.len() as u64;
            seq
        };

        for (consumer, protocol) in overran {
            warn!(consumer, %protocol, seq, "Consumer queue full, dropping consumer");
        }
        Some(seq)
    }

    pub fn subscribe(self: &Arc<Self>, protocol: Protocol, options: SubscribeOptions) -> Result<Subscription> {
        let capacity = options.capacity.max(1);
        let (tx, rx) = mpsc::channel(capacity);
        let id = self.next_consumer.fetch_add(1, Ordering::Relaxed);
        let overrun = Arc::new(AtomicBool::new(false));

        let mut inner = self.inner.lock();
        if inner.closed {
            return Err(GatewayError::NotFound("stream is closed".to_string()));
        }

        let mut waiting_keyframe = options.start_at_keyframe;
        if options.replay_gop && waiting_keyframe {
            // newest whole GOPs that fit in the queue
            let mut budget = capacity;
            let mut first = inner.gops.len();
            for (index, gop) in inner.gops.iter().enumerate().rev() {
                if gop.len() > budget {
                    break;
                }
                budget -= gop.len();
                first = index;
            }
            if first < inner.gops.len() {
                for frame in inner.gops.iter().skip(first).flatten() {
                    // cannot fail: the budget above is the channel capacity
                    let _ = tx.try_send(frame.clone());
                }
                waiting_keyframe = false;
            }
        }

        inner.consumers.push(Slot {
            id,
            protocol,
            tx,
            waiting_keyframe,
            overrun: Arc::clone(&overrun),
        });
        drop(inner);

        Ok(Subscription {
            id,
            protocol,
            rx,
            overrun,
            bus: Arc::downgrade(self),
        })
    }

    pub fn detach(&self, id: u64) -> bool {
        let mut inner = self.inner.lock();
        let before = inner.consumers.len();
        inner.consumers.retain(|slot| slot.id != id);
        inner.consumers.len() != before
    }

    /// Ends delivery: consumers drain their queues and then see the end of
    /// the stream.
    pub fn close(&self) {
        let mut inner = self.inner.lock();
        inner.closed = true;
        inner.consumers.clear();
        inner.gops.clear();
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }

    pub fn set_tracks(&self, tracks: Vec<TrackInfo>) {
        self.inner.lock().tracks = tracks;
    }

    /// Adds or replaces the track with the same id.
    pub fn upsert_track(&self, track: TrackInfo) {
        let mut inner = self.inner.lock();
        inner.tracks.retain(|t| t.id != track.id);
        inner.tracks.push(track);
        inner.tracks.sort_by_key(|t| t.id);
    }

    #[must_use]
    pub fn tracks(&self) -> Vec<TrackInfo> {
        self.inner.lock().tracks.clone()
    }

    #[must_use]
    pub fn stats(&self) -> BusStats {
        self.inner.lock().stats.clone()
    }

    /// Attached consumers per protocol.
    #[must_use]
    pub fn consumers(&self) -> HashMap<Protocol, usize> {
        let inner = self.inner.lock();
        let mut counts = HashMap::new();
        for slot in &inner.consumers {
            *counts.entry(slot.protocol).or_insert(0) += 1;
        }
        counts
    }

    /// Consumers that keep a stream busy; the recorder is accounted for
    /// separately.
    #[must_use]
    pub fn viewer_count(&self) -> usize {
        self.inner
            .lock()
            .consumers
            .iter()
            .filter(|slot| slot.protocol != Protocol::Record)
            .count()
    }
}

/// Receiving end of one consumer. Dropping it detaches the consumer.
pub struct Subscription {
    id: u64,
    protocol: Protocol,
    rx: mpsc::Receiver<Frame>,
    overrun: Arc<AtomicBool>,
    bus: Weak<FrameBus>,
}

impl Subscription {
    #[must_use]
    pub const fn id(&self) -> u64 {
        self.id
    }

    #[must_use]
    pub const fn protocol(&self) -> Protocol {
        self.protocol
    }

    /// Next frame in publish order. `Ok(None)` when the stream ended,
    /// `Err(Overrun)` when this consumer was dropped for falling behind.
    pub async fn recv(&mut self) -> Result<Option<Frame>> {
        match self.rx.recv().await {
            Some(frame) => Ok(Some(frame)),
            None => self.end(),
        }
    }

    /// Frames waiting in this consumer's queue.
    #[must_use]
    pub fn queued(&self) -> usize {
        self.rx.len()
    }

    /// Non-waiting variant of [`Self::recv`]; `Ok(None)` also means "empty".
    pub fn try_recv(&mut self) -> Result<Option<Frame>> {
        match self.rx.try_recv() {
            Ok(frame) => Ok(Some(frame)),
            Err(mpsc::error::TryRecvError::Empty) => Ok(None),
            Err(mpsc::error::TryRecvError::Disconnected) => self.end(),
        }
    }

    fn end(&self) -> Result<Option<Frame>> {
        if self.overrun.load(Ordering::Acquire) {
            Err(GatewayError::Overrun(format!(
                "{} consumer {} fell behind",
                self.protocol, self.id
            )))
        } else {
            Ok(None)
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(bus) = self.bus.upgrade() {
            bus.detach(self.id);
        }
    }
}
