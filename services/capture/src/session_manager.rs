//! Capture session manager: trigger handling, frame ingestion and
//! finalize/abort.
//!
//! The manager owns the [`SessionTable`] and the collaborator handles. It
//! knows nothing about the bus; the dispatcher feeds it one event at a time.

use crate::config::CaptureConfig;
use crate::directory::{DeviceDirectory, DeviceRecord};
use crate::encoder::ArtifactEncoder;
use crate::error::CaptureError;
use crate::metadata_store::{MetadataStore, NewVideo};
use crate::mqtt_bus::CommandPublisher;
use crate::notifier::Notifier;
use crate::retention::{RetentionEnforcer, RetentionReport};
use crate::router::decode_frame;
use crate::session_table::{
    AppendOutcome, CaptureSession, ClosingSession, CompletionPolicy, SessionTable,
};
use chrono::{DateTime, Utc};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{debug, error, info, instrument, warn};

/// Result of a trigger event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TriggerOutcome {
    /// A new session is capturing
    Opened { motion_event_id: i64 },
    /// A session already exists for the device; nothing changed
    AlreadyActive,
}

/// A persisted video produced by finalize.
#[derive(Debug, Clone)]
pub struct CommittedVideo {
    pub video_id: i64,
    pub motion_event_id: i64,
    pub filename: String,
    pub filepath: PathBuf,
    pub filesize: u64,
    pub frame_count: usize,
    /// `None` when the retention pass itself failed
    pub retention: Option<RetentionReport>,
}

/// Result of closing a session.
#[derive(Debug, Clone)]
pub enum FinalizeOutcome {
    Committed(CommittedVideo),
    /// Too few frames; nothing was written
    Aborted { frame_count: usize },
}

/// External collaborators of the manager.
pub struct Collaborators {
    pub directory: Arc<dyn DeviceDirectory>,
    pub store: Arc<dyn MetadataStore>,
    pub encoder: Arc<dyn ArtifactEncoder>,
    pub publisher: Arc<dyn CommandPublisher>,
    pub notifier: Option<Arc<dyn Notifier>>,
}

pub struct CaptureManager {
    table: SessionTable,
    directory: Arc<dyn DeviceDirectory>,
    store: Arc<dyn MetadataStore>,
    encoder: Arc<dyn ArtifactEncoder>,
    publisher: Arc<dyn CommandPublisher>,
    notifier: Option<Arc<dyn Notifier>>,
    retention: RetentionEnforcer,
    policy: CompletionPolicy,
    storage_dir: PathBuf,
    frame_rate: u32,
    nominal_duration_secs: u32,
    min_frames: usize,
}

impl CaptureManager {
    pub fn new(config: &CaptureConfig, collaborators: Collaborators) -> Self {
        let Collaborators {
            directory,
            store,
            encoder,
            publisher,
            notifier,
        } = collaborators;

        Self {
            table: SessionTable::new(),
            retention: RetentionEnforcer::new(store.clone(), config.max_videos_per_device),
            directory,
            store,
            encoder,
            publisher,
            notifier,
            policy: CompletionPolicy {
                target_frames: config.target_frames(),
                max_age: config.max_session_age(),
            },
            storage_dir: config.storage_dir.clone(),
            frame_rate: config.frame_rate,
            nominal_duration_secs: u32::try_from(config.target_duration_secs).unwrap_or(u32::MAX),
            min_frames: config.min_frames,
        }
    }

    pub fn table(&self) -> &SessionTable {
        &self.table
    }

    /// Open a capture session for a motion trigger.
    ///
    /// The reservation is released on every early return, so a failed or
    /// cancelled trigger leaves no entry behind.
    #[instrument(skip(self))]
    pub async fn handle_trigger(&self, device_id: &str) -> Result<TriggerOutcome, CaptureError> {
        let Some(reservation) = self.table.reserve(device_id) else {
            debug!("Session already active, ignoring trigger");
            metrics::counter!("capture.triggers.duplicate").increment(1);
            return Ok(TriggerOutcome::AlreadyActive);
        };

        let device = self
            .directory
            .lookup(device_id)
            .await?
            .ok_or_else(|| CaptureError::UnknownDevice(device_id.to_string()))?;

        let motion_event_id = self.store.create_motion_event(device.id).await?;

        let session = CaptureSession::new(device.clone(), motion_event_id, self.policy.target_frames);
        let detected_at = session.started_wall;
        reservation.activate(session);

        info!(
            device_key = device.id,
            motion_event_id,
            "Capture session started"
        );
        metrics::counter!("capture.triggers.opened").increment(1);

        if let Err(e) = self.publisher.send_start(device_id) {
            warn!(error = %e, "Failed to send start command");
        }

        self.notify(&device, motion_event_id, detected_at).await;

        Ok(TriggerOutcome::Opened { motion_event_id })
    }

    async fn notify(&self, device: &DeviceRecord, motion_event_id: i64, detected_at: DateTime<Utc>) {
        let Some(notifier) = &self.notifier else {
            return;
        };

        match notifier.notify_motion(device, detected_at).await {
            Ok(()) => {
                if let Err(e) = self.store.mark_notification_sent(motion_event_id).await {
                    warn!(motion_event_id, error = %e, "Failed to mark notification sent");
                }
            }
            Err(e) => {
                warn!(motion_event_id, error = %e, "Failed to send motion notification");
                metrics::counter!("capture.notifications.failed").increment(1);
            }
        }
    }

    /// Buffer one stream frame for the device's open session.
    ///
    /// Frames for devices without a capturing session are dropped before
    /// decoding. A malformed payload leaves the session untouched.
    pub fn accept_frame(&self, device_id: &str, payload: &[u8]) -> Result<AppendOutcome, CaptureError> {
        if !self.table.is_open(device_id) {
            metrics::counter!("capture.frames.dropped").increment(1);
            return Ok(AppendOutcome::NoSession);
        }

        let frame = decode_frame(payload)?;
        let outcome = self.table.append(device_id, frame, &self.policy, Instant::now());

        match &outcome {
            AppendOutcome::NoSession => {
                metrics::counter!("capture.frames.dropped").increment(1);
            }
            AppendOutcome::Buffered { .. } => {
                metrics::counter!("capture.frames.buffered").increment(1);
            }
            AppendOutcome::Complete(closing) => {
                metrics::counter!("capture.frames.buffered").increment(1);
                debug!(
                    device_id,
                    frames = closing.frame_count(),
                    bytes = closing.session().frames.total_bytes(),
                    reason = closing.reason().as_str(),
                    "Capture complete"
                );
            }
        }

        Ok(outcome)
    }

    /// Sessions that went past their age budget without completing.
    pub fn expire_stale(&self) -> Vec<ClosingSession> {
        self.table.take_expired(&self.policy, Instant::now())
    }

    /// Finalize or abort a closed session. The slot is released when
    /// `closing` drops at the end of this call.
    #[instrument(
        skip(self, closing),
        fields(
            device_id = %closing.session().device_id(),
            motion_event_id = closing.session().motion_event_id,
            reason = closing.reason().as_str()
        )
    )]
    pub async fn finish(&self, closing: ClosingSession) -> Result<FinalizeOutcome, CaptureError> {
        let frame_count = closing.frame_count();

        if frame_count < self.min_frames {
            warn!(
                frame_count,
                min_frames = self.min_frames,
                "Not enough frames captured, discarding session"
            );
            metrics::counter!("capture.sessions.aborted").increment(1);
            return Ok(FinalizeOutcome::Aborted { frame_count });
        }

        let result = self.finalize(&closing).await;
        match &result {
            Ok(_) => metrics::counter!("capture.sessions.finalized").increment(1),
            Err(_) => metrics::counter!("capture.sessions.failed").increment(1),
        }

        result.map(FinalizeOutcome::Committed)
    }

    async fn finalize(&self, closing: &ClosingSession) -> Result<CommittedVideo, CaptureError> {
        let session = closing.session();
        let frame_count = session.frames.len();
        let filename = video_filename(session.device_id(), session.started_wall);
        let filepath = self.storage_dir.join(&filename);

        if let Err(e) = self
            .encoder
            .encode(session.frames.frames(), self.frame_rate, &filepath)
            .await
        {
            error!(error = %e, "Failed to encode video");
            remove_artifact(&filepath).await;
            return Err(e.into());
        }

        let filesize = match tokio::fs::metadata(&filepath).await {
            Ok(metadata) => metadata.len(),
            Err(e) => {
                error!(error = %e, path = %filepath.display(), "Encoded video not readable");
                remove_artifact(&filepath).await;
                return Err(e.into());
            }
        };

        let video = NewVideo {
            device_key: session.device.id,
            motion_event_id: session.motion_event_id,
            filename: filename.clone(),
            filepath: filepath.to_string_lossy().into_owned(),
            duration_secs: self.nominal_duration_secs,
            filesize,
            captured_at: session.started_wall,
        };

        let video_id = match self.store.insert_video(&video).await {
            Ok(id) => id,
            Err(e) => {
                error!(error = %e, "Failed to save video metadata, removing file");
                remove_artifact(&filepath).await;
                return Err(e.into());
            }
        };

        info!(
            video_id,
            filename = %filename,
            frame_count,
            filesize,
            "Video saved"
        );
        metrics::counter!("capture.artifacts.bytes").increment(filesize);

        let retention = match self.retention.enforce(session.device.id).await {
            Ok(report) => Some(report),
            Err(e) => {
                error!(error = %e, "Retention enforcement failed");
                None
            }
        };

        Ok(CommittedVideo {
            video_id,
            motion_event_id: session.motion_event_id,
            filename,
            filepath,
            filesize,
            frame_count,
            retention,
        })
    }
}

/// `<device>_<YYYYmmdd_HHMMSS_mmm>.mjpeg`, with the device id reduced to
/// filename-safe characters.
pub fn video_filename(device_id: &str, started: DateTime<Utc>) -> String {
    format!(
        "{}_{}.mjpeg",
        sanitize_filename_component(device_id),
        started.format("%Y%m%d_%H%M%S_%3f")
    )
}

fn sanitize_filename_component(component: &str) -> String {
    component
        .chars()
        .map(|c| match c {
            'a'..='z' | 'A'..='Z' | '0'..='9' | '-' | '_' => c,
            _ => '_',
        })
        .collect()
}

async fn remove_artifact(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => debug!(path = %path.display(), "Removed video file"),
        Err(e) if e.kind() == ErrorKind::NotFound => {}
        Err(e) => warn!(path = %path.display(), error = %e, "Failed to remove video file"),
    }
}
