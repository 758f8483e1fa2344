use std::collections::VecDeque;

use crate::frame::Frame;

/// Audio-only streams have no keyframes to align on; the ring cuts its
/// groups at this length instead.
const AUDIO_GROUP_MS: i64 = 1000;

/// Rolling history of the last `window` of media, kept as whole GOPs so
/// that a capture taken from it always opens on a keyframe.
#[derive(Debug)]
pub struct PreRollBuffer {
    window_ms: i64,
    gops: VecDeque<Vec<Frame>>,
    seen_video: bool,
}

impl PreRollBuffer {
    #[must_use]
    pub fn new(window_seconds: u32) -> Self {
        Self {
            window_ms: i64::from(window_seconds) * 1000,
            gops: VecDeque::new(),
            seen_video: false,
        }
    }

    pub fn set_window(&mut self, window_seconds: u32) {
        self.window_ms = i64::from(window_seconds) * 1000;
    }

    fn opens_group(&self, frame: &Frame) -> bool {
        if frame.is_video() {
            return frame.keyframe;
        }
        !self.seen_video
            && self
                .gops
                .back()
                .and_then(|gop| gop.first())
                .is_none_or(|first| frame.dts_ms - first.dts_ms >= AUDIO_GROUP_MS)
    }

    pub fn push(&mut self, frame: &Frame) {
        if frame.is_video() && !self.seen_video {
            // audio groups collected so far do not start on a keyframe
            self.seen_video = true;
            self.gops.clear();
        }
        if self.opens_group(frame) {
            self.gops.push_back(Vec::new());
        }
        let Some(gop) = self.gops.back_mut() else {
            return;
        };
        gop.push(frame.clone());

        let horizon = frame.dts_ms - self.window_ms;
        while self.gops.len() > 1 && self.gops[1].first().is_some_and(|f| f.dts_ms <= horizon) {
            self.gops.pop_front();
        }
    }

    /// Frames from the latest group opening at or before `from_ms` (or the
    /// oldest group held) up to now.
    #[must_use]
    pub fn snapshot_from(&self, from_ms: i64) -> Vec<Frame> {
        let start = self
            .gops
            .iter()
            .rposition(|gop| gop.first().is_some_and(|f| f.dts_ms <= from_ms))
            .unwrap_or(0);
        self.gops.iter().skip(start).flatten().cloned().collect()
    }

    #[must_use]
    pub fn newest_dts(&self) -> Option<i64> {
        self.gops.back().and_then(|gop| gop.last()).map(|f| f.dts_ms)
    }

    #[must_use]
    pub fn oldest_dts(&self) -> Option<i64> {
        self.gops.front().and_then(|gop| gop.first()).map(|f| f.dts_ms)
    }

    #[must_use]
    pub fn frames(&self) -> usize {
        self.gops.iter().map(Vec::len).sum()
    }

    pub fn clear(&mut self) {
        self.gops.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::output::tests::{audio, video};

    fn feed(buffer: &mut PreRollBuffer, until_ms: i64) {
        // 25 fps, keyframe every second
        for ts in (0..until_ms).step_by(40) {
            buffer.push(&video(ts, ts % 1000 == 0));
        }
    }

    #[test]
    fn test_window_is_gop_aligned() {
        let mut buffer = PreRollBuffer::new(5);
        feed(&mut buffer, 20_000);
        let oldest = buffer.oldest_dts().unwrap();
        let newest = buffer.newest_dts().unwrap();
        assert_eq!(oldest % 1000, 0);
        assert!(newest - oldest >= 5000);
        assert!(newest - oldest < 6000);
    }

    #[test]
    fn test_snapshot_starts_on_keyframe() {
        let mut buffer = PreRollBuffer::new(5);
        feed(&mut buffer, 20_000);
        let frames = buffer.snapshot_from(16_500);
        assert!(frames[0].keyframe);
        assert_eq!(frames[0].dts_ms, 16_000);
        assert_eq!(frames.last().unwrap().dts_ms, 19_960);

        // older than the window: everything held
        let all = buffer.snapshot_from(0);
        assert_eq!(all.len(), buffer.frames());
    }

    #[test]
    fn test_leading_frames_without_keyframe_dropped() {
        let mut buffer = PreRollBuffer::new(5);
        buffer.push(&video(0, false));
        assert_eq!(buffer.frames(), 0);
        buffer.push(&video(40, true));
        assert_eq!(buffer.frames(), 1);
    }

    #[test]
    fn test_audio_only_groups() {
        let mut buffer = PreRollBuffer::new(2);
        for ts in (0..10_000).step_by(20) {
            buffer.push(&audio(ts));
        }
        let oldest = buffer.oldest_dts().unwrap();
        assert!(buffer.newest_dts().unwrap() - oldest >= 2000);
        assert_eq!(oldest % 1000, 0);
    }
}
