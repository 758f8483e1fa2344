//! The per-stream recorder task: a `Record` consumer on the frame bus that
//! keeps the pre-roll ring, writes continuous segments and event captures.

use std::{path::PathBuf, sync::Arc};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

use super::{
    preroll::PreRollBuffer,
    segment::{SegmentIndex, SegmentRecord, SegmentStatus, TriggerReason},
    writer::{MediaClock, SegmentFiles, SegmentWriter},
};
use crate::{
    error::{GatewayError, Result},
    frame::{Frame, TrackInfo, TrackKind},
    output::FrameConsumer,
    registry::{StreamEvent, StreamHandle},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum RecordingState {
    Idle,
    Recording,
    Closing,
    Failed,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RecorderStatus {
    pub state: RecordingState,
    pub event_capturing: bool,
    pub event_until: Option<DateTime<Utc>>,
    pub current_segment: Option<String>,
    pub segments_closed: u64,
    pub last_error: Option<String>,
}

impl Default for RecorderStatus {
    fn default() -> Self {
        Self {
            state: RecordingState::Idle,
            event_capturing: false,
            event_until: None,
            current_segment: None,
            segments_closed: 0,
            last_error: None,
        }
    }
}

/// Outcome of an event trigger.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EventCapture {
    pub segment_id: String,
    pub start_time: DateTime<Utc>,
    pub until: DateTime<Utc>,
    /// The trigger landed inside a running capture and pushed its end out.
    pub extended: bool,
}

pub enum RecorderCommand {
    StartContinuous(oneshot::Sender<Result<()>>),
    StopContinuous(oneshot::Sender<Result<Option<SegmentRecord>>>),
    TriggerEvent {
        pre_roll_seconds: u32,
        post_roll_seconds: u32,
        reply: oneshot::Sender<Result<EventCapture>>,
    },
}

pub struct RecorderContext {
    pub root: PathBuf,
    pub retry_attempts: usize,
    pub index: Arc<SegmentIndex>,
    pub files: Arc<dyn SegmentFiles>,
}

struct EventWindow {
    writer: SegmentWriter,
    until_dts: i64,
}

pub struct Recorder {
    ctx: Arc<RecorderContext>,
    stream: StreamHandle,
    consumer: FrameConsumer,
    status: Arc<RwLock<RecorderStatus>>,
    preroll: PreRollBuffer,
    clock: Option<MediaClock>,
    tracks: Vec<TrackInfo>,
    last_dts: Option<i64>,
    continuous_wanted: bool,
    continuous: Option<SegmentWriter>,
    write_failures: usize,
    event: Option<EventWindow>,
}

impl Recorder {
    #[must_use]
    pub fn new(
        ctx: Arc<RecorderContext>,
        stream: StreamHandle,
        consumer: FrameConsumer,
        status: Arc<RwLock<RecorderStatus>>,
    ) -> Self {
        let preroll = PreRollBuffer::new(stream.policy().pre_roll_seconds);
        let tracks = stream.tracks();
        Self {
            ctx,
            stream,
            consumer,
            status,
            preroll,
            clock: None,
            tracks,
            last_dts: None,
            continuous_wanted: false,
            continuous: None,
            write_failures: 0,
            event: None,
        }
    }

    pub async fn run(mut self, mut commands: mpsc::Receiver<RecorderCommand>) {
        debug!(stream = %self.stream.key(), "Recorder started");
        loop {
            tokio::select! {
                biased;
                Some(command) = commands.recv() => {
                    // a command sees every frame published before it, and no more
                    let mut live = true;
                    for _ in 0..self.consumer.queued() {
                        let next = self.consumer.recv().await;
                        if !self.handle(next).await {
                            live = false;
                            break;
                        }
                    }
                    self.on_command(command).await;
                    if !live {
                        break;
                    }
                }
                next = self.consumer.recv() => {
                    if !self.handle(next).await {
                        break;
                    }
                }
            }
        }

        commands.close();
        while let Ok(command) = commands.try_recv() {
            self.on_command(command).await;
        }
        self.finish().await;
        debug!(stream = %self.stream.key(), "Recorder finished");
    }

    /// Feeds one received frame through; false once the consumer ended.
    async fn handle(&mut self, next: Result<Option<Frame>>) -> bool {
        match next {
            Ok(Some(frame)) => {
                let discontinuity = self.consumer.take_discontinuity();
                self.on_frame(&frame, discontinuity).await;
                true
            }
            Ok(None) => false,
            Err(e) => {
                warn!(stream = %self.stream.key(), error = %e, "Recorder consumer ended");
                false
            }
        }
    }

    fn update_status(&self) {
        let mut status = self.status.write();
        if status.state != RecordingState::Failed || self.continuous_wanted {
            status.state = if self.continuous_wanted {
                RecordingState::Recording
            } else {
                RecordingState::Idle
            };
        }
        status.current_segment = self.continuous.as_ref().map(|w| w.id().to_string());
        status.event_capturing = self.event.is_some();
        status.event_until = match (&self.event, &self.clock) {
            (Some(event), Some(clock)) => Some(clock.at(event.until_dts)),
            _ => None,
        };
    }

    fn closed(&self, record: SegmentRecord) {
        self.status.write().segments_closed += 1;
        self.ctx.index.upsert(record);
    }

    /// Counts a lost or damaged segment; too many in a row fail the recorder.
    fn storage_failure(&mut self, reason: String) {
        self.write_failures += 1;
        if self.write_failures > self.ctx.retry_attempts {
            self.fail(reason);
        }
    }

    fn has_video(&self) -> bool {
        self.tracks.iter().any(|t| t.kind == TrackKind::Video)
    }

    fn opens_gop(&self, frame: &Frame) -> bool {
        if frame.is_video() {
            frame.keyframe
        } else {
            !self.has_video()
        }
    }

    fn fail(&mut self, reason: String) {
        error!(stream = %self.stream.key(), %reason, "Recording failed");
        self.continuous_wanted = false;
        {
            let mut status = self.status.write();
            status.state = RecordingState::Failed;
            status.last_error = Some(reason.clone());
        }
        self.stream.emit(StreamEvent::RecordingFailed(reason));
    }

    async fn open(&self, reason: TriggerReason, first_dts: i64) -> Result<SegmentWriter> {
        let clock = self
            .clock
            .ok_or_else(|| GatewayError::Internal("recorder clock not anchored".to_string()))?;
        SegmentWriter::open_with_retry(
            self.ctx.files.as_ref(),
            &self.ctx.root,
            &self.stream,
            reason,
            clock,
            first_dts,
            self.ctx.retry_attempts,
        )
        .await
    }

    async fn on_frame(&mut self, frame: &Frame, discontinuity: bool) {
        self.clock.get_or_insert_with(|| MediaClock::new(Utc::now(), frame.dts_ms));
        self.last_dts = Some(frame.dts_ms);
        let opens_gop = self.opens_gop(frame);
        if frame.is_video() && frame.keyframe {
            self.tracks = self.stream.tracks();
            self.preroll.set_window(self.stream.policy().pre_roll_seconds);
        }
        self.preroll.push(frame);

        if self.continuous_wanted {
            self.continuous_frame(frame, opens_gop, discontinuity).await;
        }
        if self.event.is_some() {
            self.event_frame(frame).await;
        }
    }

    async fn continuous_frame(&mut self, frame: &Frame, opens_gop: bool, discontinuity: bool) {
        let policy = self.stream.policy();
        if opens_gop {
            let rotate = self.continuous.as_ref().is_some_and(|writer| {
                discontinuity
                    || frame.dts_ms - writer.start_dts() >= i64::from(policy.segment_duration_seconds) * 1000
                    || writer.size() >= policy.segment_max_bytes
            });
            if rotate {
                if let Some(writer) = self.continuous.take() {
                    self.close_writer(writer, Some(frame.dts_ms)).await;
                }
                if !self.continuous_wanted {
                    self.update_status();
                    return;
                }
            }
            if self.continuous.is_none() {
                match self.open(TriggerReason::Continuous, frame.dts_ms).await {
                    Ok(writer) => self.continuous = Some(writer),
                    Err(e) => {
                        self.fail(format!("cannot open segment: {e}"));
                        self.update_status();
                        return;
                    }
                }
            }
            self.update_status();
        }

        let Some(writer) = self.continuous.as_mut() else {
            return;
        };
        if let Err(e) = writer.write(frame, &self.tracks).await {
            warn!(stream = %self.stream.key(), error = %e, "Segment write failed, aborting segment");
            if let Some(writer) = self.continuous.take() {
                let record = writer.abort().await;
                self.ctx.index.upsert(record);
            }
            self.storage_failure(format!("segment writes keep failing: {e}"));
            self.update_status();
        }
    }

    async fn event_frame(&mut self, frame: &Frame) {
        let Some(event) = self.event.as_mut() else {
            return;
        };
        let written = event.writer.write(frame, &self.tracks).await;
        let done = frame.dts_ms >= event.until_dts;
        match written {
            Ok(()) if done => {
                if let Some(event) = self.event.take() {
                    self.close_writer(event.writer, Some(frame.dts_ms)).await;
                    info!(stream = %self.stream.key(), "Event capture closed");
                }
            }
            Ok(()) => return,
            Err(e) => {
                warn!(stream = %self.stream.key(), error = %e, "Event segment write failed");
                if let Some(event) = self.event.take() {
                    let record = event.writer.abort().await;
                    self.ctx.index.upsert(record);
                }
            }
        }
        self.update_status();
    }

    /// Writes buffered history into a freshly opened segment.
    async fn prime(&self, writer: &mut SegmentWriter, frames: &[Frame]) -> Result<()> {
        for frame in frames {
            writer.write(frame, &self.tracks).await?;
        }
        Ok(())
    }

    async fn close_writer(&mut self, writer: SegmentWriter, end_dts: Option<i64>) -> SegmentRecord {
        let record = writer.close(end_dts).await;
        if record.status == SegmentStatus::Complete {
            self.write_failures = 0;
        } else {
            warn!(stream = %self.stream.key(), segment = %record.id, "Segment closed incomplete");
            self.storage_failure(format!("segment {} could not be closed cleanly", record.id));
        }
        self.closed(record.clone());
        record
    }

    /// Replies only after the status reflects the command.
    async fn on_command(&mut self, command: RecorderCommand) {
        match command {
            RecorderCommand::StartContinuous(reply) => {
                let result = self.start_continuous().await;
                self.update_status();
                let _ = reply.send(result);
            }
            RecorderCommand::StopContinuous(reply) => {
                let result = self.stop_continuous().await;
                self.update_status();
                let _ = reply.send(result);
            }
            RecorderCommand::TriggerEvent {
                pre_roll_seconds,
                post_roll_seconds,
                reply,
            } => {
                let result = self.trigger(pre_roll_seconds, post_roll_seconds).await;
                self.update_status();
                let _ = reply.send(result);
            }
        }
    }

    async fn start_continuous(&mut self) -> Result<()> {
        if self.continuous_wanted {
            return Err(GatewayError::Busy(format!("{} is already recording", self.stream.key())));
        }
        if self.stream.is_closed() {
            return Err(GatewayError::NotFound(format!("stream {}", self.stream.key())));
        }
        self.continuous_wanted = true;
        self.write_failures = 0;
        self.status.write().last_error = None;

        // start from the GOP in progress rather than waiting for the next one
        let current = self.last_dts.map(|dts| self.preroll.snapshot_from(dts)).unwrap_or_default();
        if let Some(first) = current.first() {
            let mut writer = match self.open(TriggerReason::Continuous, first.dts_ms).await {
                Ok(writer) => writer,
                Err(e) => {
                    self.fail(format!("cannot open segment: {e}"));
                    return Err(e);
                }
            };
            if let Err(e) = self.prime(&mut writer, &current).await {
                self.continuous_wanted = false;
                self.ctx.index.upsert(writer.abort().await);
                return Err(e);
            }
            self.continuous = Some(writer);
        }
        info!(stream = %self.stream.key(), "Continuous recording started");
        Ok(())
    }

    async fn stop_continuous(&mut self) -> Result<Option<SegmentRecord>> {
        if !self.continuous_wanted {
            return Err(GatewayError::NotFound(format!("{} is not recording", self.stream.key())));
        }
        self.continuous_wanted = false;
        let Some(writer) = self.continuous.take() else {
            info!(stream = %self.stream.key(), "Continuous recording stopped before any segment opened");
            return Ok(None);
        };
        self.status.write().state = RecordingState::Closing;
        let record = self.close_writer(writer, None).await;
        info!(
            stream = %self.stream.key(),
            segment = %record.id,
            status = ?record.status,
            "Continuous recording stopped"
        );
        Ok(Some(record))
    }

    async fn trigger(&mut self, pre_roll_seconds: u32, post_roll_seconds: u32) -> Result<EventCapture> {
        let now = self
            .last_dts
            .ok_or_else(|| GatewayError::NotFound(format!("no media received on {} yet", self.stream.key())))?;
        let clock = self
            .clock
            .ok_or_else(|| GatewayError::Internal("recorder clock not anchored".to_string()))?;
        let until_dts = now + i64::from(post_roll_seconds) * 1000;

        if let Some(event) = self.event.as_mut() {
            event.until_dts = event.until_dts.max(until_dts);
            debug!(stream = %self.stream.key(), "Event capture extended");
            return Ok(EventCapture {
                segment_id: event.writer.id().to_string(),
                start_time: clock.at(event.writer.start_dts()),
                until: clock.at(event.until_dts),
                extended: true,
            });
        }

        let frames = self.preroll.snapshot_from(now - i64::from(pre_roll_seconds) * 1000);
        let first = frames
            .first()
            .ok_or_else(|| GatewayError::NotFound(format!("no keyframe buffered on {}", self.stream.key())))?;
        let mut writer = match self.open(TriggerReason::Event, first.dts_ms).await {
            Ok(writer) => writer,
            Err(e) => {
                self.fail(format!("cannot open event segment: {e}"));
                return Err(e);
            }
        };
        if let Err(e) = self.prime(&mut writer, &frames).await {
            self.ctx.index.upsert(writer.abort().await);
            return Err(e);
        }
        let capture = EventCapture {
            segment_id: writer.id().to_string(),
            start_time: clock.at(first.dts_ms),
            until: clock.at(until_dts),
            extended: false,
        };
        info!(
            stream = %self.stream.key(),
            segment = %capture.segment_id,
            pre_roll_seconds,
            post_roll_seconds,
            "Event capture started"
        );
        self.event = Some(EventWindow { writer, until_dts });
        Ok(capture)
    }

    /// End of stream: everything open is closed cleanly.
    async fn finish(&mut self) {
        if let Some(writer) = self.continuous.take() {
            self.close_writer(writer, None).await;
        }
        if let Some(event) = self.event.take() {
            self.close_writer(event.writer, None).await;
        }
        self.continuous_wanted = false;
        self.update_status();
    }
}
