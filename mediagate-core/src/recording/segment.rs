//! Segment index records and their on-disk layout.
//!
//! Every segment file `{root}/{app}/{stream}/{YYYY-MM-DD}/{HH-MM-SS}-{id}.ts`
//! has a JSON sidecar next to it (`{file}.json`). The sidecar is the index;
//! the in-memory [`SegmentIndex`] is rebuilt from sidecars at startup.

use std::{
    collections::{BTreeSet, HashMap},
    path::{Path, PathBuf},
};

use chrono::{DateTime, NaiveDate, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::fs;

use crate::{
    error::{GatewayError, Result},
    frame::StreamKey,
};

pub const SEGMENT_EXTENSION: &str = "ts";
pub const SIDECAR_SUFFIX: &str = ".json";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TriggerReason {
    Continuous,
    Event,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SegmentStatus {
    /// Still being written.
    Open,
    Complete,
    /// Aborted by a write failure or a crash; playable up to the damage.
    Incomplete,
    /// Indexed, but the media file is gone.
    Missing,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SegmentRecord {
    pub id: String,
    pub stream_key: String,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub size_bytes: u64,
    pub trigger_reason: TriggerReason,
    pub status: SegmentStatus,
    pub path: PathBuf,
}

impl SegmentRecord {
    pub fn key(&self) -> Result<StreamKey> {
        self.stream_key.parse()
    }

    #[must_use]
    pub fn date(&self) -> NaiveDate {
        self.start_time.date_naive()
    }

    #[must_use]
    pub fn sidecar(&self) -> PathBuf {
        sidecar_path(&self.path)
    }

    #[must_use]
    pub fn overlaps(&self, start: Option<DateTime<Utc>>, end: Option<DateTime<Utc>>) -> bool {
        start.is_none_or(|start| self.end_time >= start) && end.is_none_or(|end| self.start_time <= end)
    }

    /// Writes the sidecar through a temporary file so a crash never leaves
    /// a half-written index entry.
    pub async fn persist(&self) -> Result<()> {
        let sidecar = self.sidecar();
        let tmp = sidecar.with_extension("json.tmp");
        let body = serde_json::to_vec_pretty(self).map_err(GatewayError::storage)?;
        fs::write(&tmp, body)
            .await
            .map_err(|e| GatewayError::storage(format!("write {}: {e}", tmp.display())))?;
        fs::rename(&tmp, &sidecar)
            .await
            .map_err(|e| GatewayError::storage(format!("rename {}: {e}", sidecar.display())))
    }

    pub async fn load(sidecar: &Path) -> Result<Self> {
        let body = fs::read(sidecar)
            .await
            .map_err(|e| GatewayError::storage(format!("read {}: {e}", sidecar.display())))?;
        serde_json::from_slice(&body).map_err(GatewayError::storage)
    }
}

#[must_use]
pub fn stream_dir(root: &Path, key: &StreamKey) -> PathBuf {
    root.join(&key.app).join(&key.stream)
}

#[must_use]
pub fn segment_path(root: &Path, key: &StreamKey, start: DateTime<Utc>, id: &str) -> PathBuf {
    stream_dir(root, key)
        .join(start.format("%Y-%m-%d").to_string())
        .join(format!("{}-{id}.{SEGMENT_EXTENSION}", start.format("%H-%M-%S")))
}

#[must_use]
pub fn sidecar_path(segment: &Path) -> PathBuf {
    let mut name = segment.as_os_str().to_owned();
    name.push(SIDECAR_SUFFIX);
    PathBuf::from(name)
}

/// Per-stream totals for the recordings overview.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamRecordings {
    pub stream_key: String,
    pub segments: usize,
    pub total_bytes: u64,
    pub dates: Vec<NaiveDate>,
    pub first_start: Option<DateTime<Utc>>,
    pub last_end: Option<DateTime<Utc>>,
}

/// In-memory view of every sidecar under the recording root, keyed by
/// segment id.
#[derive(Default)]
pub struct SegmentIndex {
    segments: DashMap<String, SegmentRecord>,
}

impl SegmentIndex {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn upsert(&self, record: SegmentRecord) {
        self.segments.insert(record.id.clone(), record);
    }

    #[must_use]
    pub fn get(&self, id: &str) -> Option<SegmentRecord> {
        self.segments.get(id).map(|r| r.value().clone())
    }

    pub fn remove(&self, id: &str) -> Option<SegmentRecord> {
        self.segments.remove(id).map(|(_, record)| record)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.segments.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    /// Segments of one stream overlapping `[start, end]`, oldest first.
    #[must_use]
    pub fn list(&self, key: &StreamKey, start: Option<DateTime<Utc>>, end: Option<DateTime<Utc>>) -> Vec<SegmentRecord> {
        let stream_key = key.to_string();
        let mut records: Vec<_> = self
            .segments
            .iter()
            .filter(|r| r.stream_key == stream_key && r.overlaps(start, end))
            .map(|r| r.value().clone())
            .collect();
        records.sort_by(|a, b| a.start_time.cmp(&b.start_time).then_with(|| a.id.cmp(&b.id)));
        records
    }

    #[must_use]
    pub fn on_date(&self, key: &StreamKey, date: NaiveDate) -> Vec<SegmentRecord> {
        let mut records = self.list(key, None, None);
        records.retain(|r| r.date() == date);
        records
    }

    #[must_use]
    pub fn summaries(&self) -> Vec<StreamRecordings> {
        let mut by_stream: HashMap<String, (usize, u64, BTreeSet<NaiveDate>, Option<DateTime<Utc>>, Option<DateTime<Utc>>)> =
            HashMap::new();
        for record in &self.segments {
            let entry = by_stream.entry(record.stream_key.clone()).or_default();
            entry.0 += 1;
            entry.1 += record.size_bytes;
            entry.2.insert(record.date());
            entry.3 = Some(entry.3.map_or(record.start_time, |t| t.min(record.start_time)));
            entry.4 = Some(entry.4.map_or(record.end_time, |t| t.max(record.end_time)));
        }
        let mut summaries: Vec<_> = by_stream
            .into_iter()
            .map(|(stream_key, (segments, total_bytes, dates, first_start, last_end))| StreamRecordings {
                stream_key,
                segments,
                total_bytes,
                dates: dates.into_iter().collect(),
                first_start,
                last_end,
            })
            .collect();
        summaries.sort_by(|a, b| a.stream_key.cmp(&b.stream_key));
        summaries
    }

    /// Stream keys that have at least one indexed segment.
    #[must_use]
    pub fn streams(&self) -> Vec<String> {
        let keys: BTreeSet<String> = self.segments.iter().map(|r| r.stream_key.clone()).collect();
        keys.into_iter().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn record(id: &str, key: &str, start_s: i64, end_s: i64) -> SegmentRecord {
        SegmentRecord {
            id: id.to_string(),
            stream_key: key.to_string(),
            start_time: Utc.timestamp_opt(start_s, 0).unwrap(),
            end_time: Utc.timestamp_opt(end_s, 0).unwrap(),
            size_bytes: 100,
            trigger_reason: TriggerReason::Continuous,
            status: SegmentStatus::Complete,
            path: PathBuf::from(format!("/tmp/{id}.ts")),
        }
    }

    #[test]
    fn test_layout() {
        let key = StreamKey::new("live", "cam1").unwrap();
        let start = Utc.with_ymd_and_hms(2026, 3, 9, 7, 5, 2).unwrap();
        let path = segment_path(Path::new("/rec"), &key, start, "abc");
        assert_eq!(path, PathBuf::from("/rec/live/cam1/2026-03-09/07-05-02-abc.ts"));
        assert_eq!(sidecar_path(&path), PathBuf::from("/rec/live/cam1/2026-03-09/07-05-02-abc.ts.json"));
    }

    #[test]
    fn test_range_listing_is_ordered() {
        let index = SegmentIndex::new();
        index.upsert(record("b", "live/cam1", 60, 120));
        index.upsert(record("a", "live/cam1", 0, 60));
        index.upsert(record("c", "live/cam1", 120, 180));
        index.upsert(record("x", "live/cam2", 0, 60));
        let key = StreamKey::new("live", "cam1").unwrap();

        let ids: Vec<_> = index.list(&key, None, None).into_iter().map(|r| r.id).collect();
        assert_eq!(ids, ["a", "b", "c"]);

        let start = Utc.timestamp_opt(90, 0).single();
        let end = Utc.timestamp_opt(130, 0).single();
        let ids: Vec<_> = index.list(&key, start, end).into_iter().map(|r| r.id).collect();
        assert_eq!(ids, ["b", "c"]);

        let summaries = index.summaries();
        assert_eq!(summaries.len(), 2);
        assert_eq!(summaries[0].segments, 3);
        assert_eq!(summaries[0].total_bytes, 300);
    }

    #[test]
    fn test_sidecar_wire_format() {
        let json = serde_json::to_value(record("a", "live/cam1", 0, 60)).unwrap();
        assert_eq!(json["streamKey"], "live/cam1");
        assert_eq!(json["triggerReason"], "continuous");
        assert_eq!(json["status"], "complete");
        assert_eq!(json["sizeBytes"], 100);
    }
}
