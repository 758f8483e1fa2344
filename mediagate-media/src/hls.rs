//! HLS media playlists (RFC 8216) for MPEG-TS and fMP4 segments.

use std::{collections::VecDeque, fmt::Write};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlaylistSegment {
    pub sequence: u64,
    pub duration_ms: i64,
    /// Segment name as served beneath the playlist.
    pub name: String,
    pub discontinuity: bool,
}

/// Sliding-window live playlist.
#[derive(Debug, Clone)]
pub struct MediaPlaylist {
    pub segments: VecDeque<PlaylistSegment>,
    pub max_segments: usize,
    /// Set for fMP4 playlists; rendered as `EXT-X-MAP`.
    pub init_segment: Option<String>,
    pub ended: bool,
    next_sequence: u64,
}

impl MediaPlaylist {
    #[must_use]
    pub const fn new(max_segments: usize, init_segment: Option<String>) -> Self {
        Self {
            segments: VecDeque::new(),
            max_segments,
            init_segment,
            ended: false,
            next_sequence: 0,
        }
    }

    /// Appends a segment and returns the names of segments that slid out of
    /// the window, so their storage can be released.
    pub fn push(&mut self, name: String, duration_ms: i64, discontinuity: bool) -> Vec<String> {
        self.segments.push_back(PlaylistSegment {
            sequence: self.next_sequence,
            duration_ms,
            name,
            discontinuity,
        });
        self.next_sequence += 1;

        let mut evicted = Vec::new();
        while self.segments.len() > self.max_segments.max(1) {
            if let Some(segment) = self.segments.pop_front() {
                evicted.push(segment.name);
            }
        }
        evicted
    }

    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.segments.iter().any(|s| s.name == name)
    }

    #[must_use]
    pub fn target_duration(&self) -> i64 {
        self.segments
            .iter()
            .map(|s| (s.duration_ms + 999) / 1000)
            .max()
            .unwrap_or(10)
            .max(1)
    }

    /// Renders the playlist; `segment_url` maps a segment name to its URI.
    pub fn render<F>(&self, mut segment_url: F) -> String
    where
        F: FnMut(&str) -> String,
    {
        let mut out = String::with_capacity(128 + self.segments.len() * 64);
        out.push_str("#EXTM3U\n");
        let version = if self.init_segment.is_some() { 7 } else { 3 };
        let _ = writeln!(out, "#EXT-X-VERSION:{version}");
        let _ = writeln!(out, "#EXT-X-TARGETDURATION:{}", self.target_duration());
        let first = self.segments.front().map_or(0, |s| s.sequence);
        let _ = writeln!(out, "#EXT-X-MEDIA-SEQUENCE:{first}");
        if let Some(init) = &self.init_segment {
            let _ = writeln!(out, "#EXT-X-MAP:URI=\"{}\"", segment_url(init));
        }
        for segment in &self.segments {
            if segment.discontinuity {
                out.push_str("#EXT-X-DISCONTINUITY\n");
            }
            let _ = writeln!(out, "#EXTINF:{:.3},", segment.duration_ms as f64 / 1000.0);
            out.push_str(&segment_url(&segment.name));
            out.push('\n');
        }
        if self.ended {
            out.push_str("#EXT-X-ENDLIST\n");
        }
        out
    }
}
