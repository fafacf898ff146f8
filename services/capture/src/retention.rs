//! Per-device retention: keep at most `max_per_device` videos, deleting the
//! oldest first.

use crate::error::StoreError;
use crate::metadata_store::MetadataStore;
use std::io::ErrorKind;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

/// What a retention pass did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RetentionReport {
    /// Records removed (file deleted or already absent)
    pub deleted: Vec<i64>,
    /// Records kept because their file could not be removed
    pub skipped: Vec<i64>,
}

impl RetentionReport {
    pub fn is_empty(&self) -> bool {
        self.deleted.is_empty() && self.skipped.is_empty()
    }
}

pub struct RetentionEnforcer {
    store: Arc<dyn MetadataStore>,
    max_per_device: u64,
}

impl RetentionEnforcer {
    pub fn new(store: Arc<dyn MetadataStore>, max_per_device: u64) -> Self {
        Self {
            store,
            max_per_device,
        }
    }

    /// Bring the device's video count down to the limit.
    ///
    /// The file goes first. A file that is already gone still lets the
    /// record go; any other file error keeps the record and the pass moves
    /// on to the next candidate.
    #[instrument(skip(self))]
    pub async fn enforce(&self, device_key: i64) -> Result<RetentionReport, StoreError> {
        let count = self.store.count_videos(device_key).await?;
        if count <= self.max_per_device {
            debug!(count, max = self.max_per_device, "Within retention limit");
            return Ok(RetentionReport::default());
        }

        let excess = count - self.max_per_device;
        let candidates = self.store.oldest_videos(device_key, excess).await?;
        let mut report = RetentionReport::default();

        for video in candidates {
            match tokio::fs::remove_file(&video.filepath).await {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::NotFound => {
                    debug!(video_id = video.id, path = %video.filepath, "Video file already absent");
                }
                Err(e) => {
                    warn!(
                        video_id = video.id,
                        path = %video.filepath,
                        error = %e,
                        "Failed to delete video file, keeping record"
                    );
                    report.skipped.push(video.id);
                    continue;
                }
            }

            self.store.delete_video(video.id).await?;
            report.deleted.push(video.id);
        }

        if !report.deleted.is_empty() {
            info!(
                deleted = report.deleted.len(),
                skipped = report.skipped.len(),
                "Deleted old videos"
            );
            metrics::counter!("capture.retention.deleted")
                .increment(report.deleted.len() as u64);
        }

        Ok(report)
    }
}
