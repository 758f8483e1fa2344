//! Retention sweep and startup reconciliation of the recording root.

use std::{
    collections::HashSet,
    sync::Arc,
    io::ErrorKind,
    path::{Path, PathBuf},
};

use chrono::{TimeDelta, Utc};
use mediagate_media::mpegts::demuxer::pts_span;
use serde::Serialize;
use tokio::fs;
use tracing::{debug, info, warn};

use super::{
    lease::LeaseTable,
    segment::{sidecar_path, SegmentIndex, SegmentRecord, SegmentStatus, SEGMENT_EXTENSION, SIDECAR_SUFFIX},
    PolicyStore,
};
use crate::error::{GatewayError, Result};

#[derive(Debug, Default, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SweepReport {
    pub deleted: usize,
    pub freed_bytes: u64,
    /// Over policy but leased; retried on the next sweep.
    pub deferred: usize,
    pub removed_dirs: usize,
}

#[derive(Debug, Default, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconcileReport {
    pub indexed: usize,
    pub missing: usize,
    pub repaired: usize,
    pub orphans_removed: usize,
}

/// Removes a segment file and its sidecar. Files already gone are fine.
pub async fn delete_segment(record: &SegmentRecord) -> Result<()> {
    for path in [record.path.clone(), record.sidecar()] {
        match fs::remove_file(&path).await {
            Err(e) if e.kind() != ErrorKind::NotFound => {
                return Err(GatewayError::storage(format!("delete {}: {e}", path.display())));
            }
            _ => {}
        }
    }
    Ok(())
}

/// Enforces every stream's max age and max total size, oldest first. Open
/// and leased segments are never touched.
pub async fn sweep(root: &Path, index: &SegmentIndex, policies: &PolicyStore, leases: &Arc<LeaseTable>) -> SweepReport {
    let mut report = SweepReport::default();
    let now = Utc::now();
    let mut touched_dirs = HashSet::new();

    for stream_key in index.streams() {
        let Ok(key) = stream_key.parse() else {
            continue;
        };
        let policy = policies.get(&key);
        let segments = index.list(&key, None, None);
        let mut total: u64 = segments.iter().map(|s| s.size_bytes).sum();
        let max_age = TimeDelta::days(i64::from(policy.max_age_days));

        for segment in &segments {
            let expired = policy.max_age_days > 0 && segment.end_time < now - max_age;
            let oversized = policy.max_total_bytes > 0 && total > policy.max_total_bytes;
            if !expired && !oversized {
                // oldest first: nothing newer can be expired, and the size is met
                break;
            }
            if segment.status == SegmentStatus::Open {
                continue;
            }
            // held until the index entry is gone, so no download can lease it meanwhile
            let Some(_reserved) = leases.try_reserve_delete(&segment.id) else {
                debug!(segment = %segment.id, "Retention deferred, segment is leased");
                report.deferred += 1;
                continue;
            };
            match delete_segment(segment).await {
                Ok(()) => {
                    index.remove(&segment.id);
                    total = total.saturating_sub(segment.size_bytes);
                    report.deleted += 1;
                    report.freed_bytes += segment.size_bytes;
                    if let Some(dir) = segment.path.parent() {
                        touched_dirs.insert(dir.to_path_buf());
                    }
                }
                Err(e) => warn!(segment = %segment.id, error = %e, "Retention delete failed"),
            }
        }
    }

    for dir in touched_dirs {
        if remove_if_empty(root, &dir).await {
            report.removed_dirs += 1;
        }
    }
    if report.deleted > 0 || report.deferred > 0 {
        info!(
            deleted = report.deleted,
            freed_bytes = report.freed_bytes,
            deferred = report.deferred,
            "Retention sweep"
        );
    }
    report
}

/// Removes `dir` when it is an empty directory below `root`.
async fn remove_if_empty(root: &Path, dir: &Path) -> bool {
    if !dir.starts_with(root) || dir == root {
        return false;
    }
    let Ok(mut entries) = fs::read_dir(dir).await else {
        return false;
    };
    if matches!(entries.next_entry().await, Ok(Some(_))) {
        return false;
    }
    fs::remove_dir(dir).await.is_ok()
}

/// Every regular file below `root`, depth-first.
async fn walk(root: &Path) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    let mut pending = vec![root.to_path_buf()];
    while let Some(dir) = pending.pop() {
        let mut entries = match fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => continue,
            Err(e) => return Err(GatewayError::storage(format!("read {}: {e}", dir.display()))),
        };
        while let Some(entry) = entries.next_entry().await.map_err(GatewayError::storage)? {
            let file_type = entry.file_type().await.map_err(GatewayError::storage)?;
            if file_type.is_dir() {
                pending.push(entry.path());
            } else if file_type.is_file() {
                files.push(entry.path());
            }
        }
    }
    Ok(files)
}

/// Rebuilds the index from sidecars after a restart:
/// - a sidecar whose media file is gone is marked `Missing`;
/// - a segment left `Open` by a crash becomes `Incomplete` with its real
///   size and the span of media that made it to disk;
/// - a media file without a sidecar is deleted.
pub async fn reconcile(root: &Path, index: &SegmentIndex) -> Result<ReconcileReport> {
    let mut report = ReconcileReport::default();
    let files = walk(root).await?;
    let mut indexed_media = HashSet::new();

    for sidecar in files.iter().filter(|p| p.to_string_lossy().ends_with(SIDECAR_SUFFIX)) {
        let mut record = match SegmentRecord::load(sidecar).await {
            Ok(record) => record,
            Err(e) => {
                warn!(path = %sidecar.display(), error = %e, "Unreadable segment index, skipping");
                continue;
            }
        };
        // the media file sits next to its sidecar
        record.path = sidecar.with_extension("");
        indexed_media.insert(record.path.clone());

        match fs::metadata(&record.path).await {
            Err(_) => {
                if record.status != SegmentStatus::Missing {
                    record.status = SegmentStatus::Missing;
                    persist_quietly(&record).await;
                }
                report.missing += 1;
            }
            Ok(meta) if record.status == SegmentStatus::Open || meta.len() != record.size_bytes => {
                record.size_bytes = meta.len();
                if record.status == SegmentStatus::Open {
                    record.status = SegmentStatus::Incomplete;
                }
                if let Ok(data) = fs::read(&record.path).await {
                    if let Some((first, last)) = pts_span(&data) {
                        let span_ms = i64::try_from((last.saturating_sub(first)) / 90).unwrap_or(0);
                        record.end_time = record.start_time + TimeDelta::milliseconds(span_ms);
                    }
                }
                persist_quietly(&record).await;
                report.repaired += 1;
            }
            Ok(_) => {}
        }
        index.upsert(record);
        report.indexed += 1;
    }

    let media_suffix = format!(".{SEGMENT_EXTENSION}");
    for media in files.iter().filter(|p| p.to_string_lossy().ends_with(&media_suffix)) {
        if indexed_media.contains(media) || fs::try_exists(sidecar_path(media)).await.unwrap_or(true) {
            continue;
        }
        match fs::remove_file(media).await {
            Ok(()) => {
                report.orphans_removed += 1;
                debug!(path = %media.display(), "Removed orphaned segment");
            }
            Err(e) => warn!(path = %media.display(), error = %e, "Could not remove orphaned segment"),
        }
    }

    info!(
        indexed = report.indexed,
        missing = report.missing,
        repaired = report.repaired,
        orphans = report.orphans_removed,
        "Recording index reconciled"
    );
    Ok(report)
}

async fn persist_quietly(record: &SegmentRecord) {
    if let Err(e) = record.persist().await {
        warn!(segment = %record.id, error = %e, "Could not update segment index");
    }
}
