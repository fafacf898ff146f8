//! In-memory collaborators shared by unit tests.

use crate::directory::{DeviceDirectory, DeviceRecord};
use crate::encoder::ArtifactEncoder;
use crate::error::{BusError, EncodeError, StoreError};
use crate::metadata_store::{MetadataStore, NewVideo, StoredVideo};
use crate::mqtt_bus::CommandPublisher;
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

pub fn device(device_id: &str, key: i64) -> DeviceRecord {
    DeviceRecord {
        id: key,
        device_id: device_id.to_string(),
        owner_id: 1,
        name: format!("Birdhouse {}", device_id),
    }
}

#[derive(Default)]
pub struct FakeDirectory {
    devices: HashMap<String, DeviceRecord>,
}

impl FakeDirectory {
    pub fn with(mut self, device: DeviceRecord) -> Self {
        self.devices.insert(device.device_id.clone(), device);
        self
    }
}

#[async_trait]
impl DeviceDirectory for FakeDirectory {
    async fn lookup(&self, device_id: &str) -> Result<Option<DeviceRecord>, StoreError> {
        Ok(self.devices.get(device_id).cloned())
    }
}

#[derive(Debug, Clone)]
pub struct VideoRow {
    pub id: i64,
    pub video: NewVideo,
}

#[derive(Default)]
struct StoreState {
    last_event_id: i64,
    last_video_id: i64,
    notified: Vec<i64>,
    videos: Vec<VideoRow>,
    fail_events: bool,
    fail_inserts: bool,
}

/// Metadata store over plain vectors with auto-increment ids.
#[derive(Default)]
pub struct InMemoryStore {
    state: Mutex<StoreState>,
}

impl InMemoryStore {
    pub fn with_first_event_id(self, id: i64) -> Self {
        self.state.lock().last_event_id = id - 1;
        self
    }

    pub fn failing_events(self) -> Self {
        self.state.lock().fail_events = true;
        self
    }

    pub fn failing_inserts(self) -> Self {
        self.state.lock().fail_inserts = true;
        self
    }

    pub fn videos(&self) -> Vec<VideoRow> {
        self.state.lock().videos.clone()
    }

    pub fn event_count(&self) -> i64 {
        self.state.lock().last_event_id
    }

    pub fn notified(&self) -> Vec<i64> {
        self.state.lock().notified.clone()
    }
}

#[async_trait]
impl MetadataStore for InMemoryStore {
    async fn create_motion_event(&self, _device_key: i64) -> Result<i64, StoreError> {
        let mut state = self.state.lock();
        if state.fail_events {
            return Err(StoreError::Unavailable("motionEvents insert refused".into()));
        }
        state.last_event_id += 1;
        Ok(state.last_event_id)
    }

    async fn mark_notification_sent(&self, motion_event_id: i64) -> Result<(), StoreError> {
        self.state.lock().notified.push(motion_event_id);
        Ok(())
    }

    async fn insert_video(&self, video: &NewVideo) -> Result<i64, StoreError> {
        let mut state = self.state.lock();
        if state.fail_inserts {
            return Err(StoreError::Unavailable("motionVideos insert refused".into()));
        }
        state.last_video_id += 1;
        let id = state.last_video_id;
        state.videos.push(VideoRow {
            id,
            video: video.clone(),
        });
        Ok(id)
    }

    async fn count_videos(&self, device_key: i64) -> Result<u64, StoreError> {
        let state = self.state.lock();
        Ok(state
            .videos
            .iter()
            .filter(|row| row.video.device_key == device_key)
            .count() as u64)
    }

    async fn oldest_videos(
        &self,
        device_key: i64,
        limit: u64,
    ) -> Result<Vec<StoredVideo>, StoreError> {
        let state = self.state.lock();
        let mut rows: Vec<&VideoRow> = state
            .videos
            .iter()
            .filter(|row| row.video.device_key == device_key)
            .collect();
        rows.sort_by_key(|row| (row.video.captured_at, row.id));

        Ok(rows
            .into_iter()
            .take(limit as usize)
            .map(|row| StoredVideo {
                id: row.id,
                filepath: row.video.filepath.clone(),
            })
            .collect())
    }

    async fn delete_video(&self, video_id: i64) -> Result<(), StoreError> {
        self.state.lock().videos.retain(|row| row.id != video_id);
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct EncodeCall {
    pub frames: Vec<Bytes>,
    pub frame_rate: u32,
    pub output: PathBuf,
}

/// Writes the concatenated frames to the output path and records the call.
#[derive(Default)]
pub struct RecordingEncoder {
    calls: Mutex<Vec<EncodeCall>>,
    fail: bool,
}

impl RecordingEncoder {
    /// Leaves a partial file behind, then reports failure.
    pub fn failing() -> Self {
        Self {
            calls: Mutex::default(),
            fail: true,
        }
    }

    pub fn calls(&self) -> Vec<EncodeCall> {
        self.calls.lock().clone()
    }
}

#[async_trait]
impl ArtifactEncoder for RecordingEncoder {
    async fn encode(
        &self,
        frames: &[Bytes],
        frame_rate: u32,
        output: &Path,
    ) -> Result<(), EncodeError> {
        self.calls.lock().push(EncodeCall {
            frames: frames.to_vec(),
            frame_rate,
            output: output.to_path_buf(),
        });

        let contents: Vec<u8> = frames.iter().flat_map(|f| f.iter().copied()).collect();
        tokio::fs::write(output, &contents).await?;

        if self.fail {
            return Err(EncodeError::Failed {
                status: "exit status: 1".to_string(),
                stderr: "Invalid data found when processing input".to_string(),
            });
        }
        Ok(())
    }
}

#[derive(Default)]
pub struct RecordingPublisher {
    sent: Mutex<Vec<String>>,
}

impl RecordingPublisher {
    pub fn sent(&self) -> Vec<String> {
        self.sent.lock().clone()
    }
}

impl CommandPublisher for RecordingPublisher {
    fn send_start(&self, device_id: &str) -> Result<(), BusError> {
        self.sent.lock().push(device_id.to_string());
        Ok(())
    }
}
