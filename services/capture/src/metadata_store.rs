use crate::config::DatabaseConfig;
use crate::directory::{DeviceDirectory, DeviceRecord};
use crate::error::StoreError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::mysql::{MySqlPool, MySqlPoolOptions};
use sqlx::FromRow;
use tracing::{debug, info, instrument};

/// Video metadata to be inserted after a successful encode
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewVideo {
    /// Internal device key
    pub device_key: i64,
    /// Motion event the video belongs to
    pub motion_event_id: i64,
    /// File name inside the storage directory
    pub filename: String,
    /// Full path of the file
    pub filepath: String,
    /// Nominal duration in seconds
    pub duration_secs: u32,
    /// File size in bytes
    pub filesize: u64,
    /// Capture time (session start)
    pub captured_at: DateTime<Utc>,
}

/// A persisted video as seen by the retention enforcer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct StoredVideo {
    /// Primary key
    pub id: i64,
    /// Full path of the file
    pub filepath: String,
}

/// Correlation records and video metadata.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MetadataStore: Send + Sync {
    /// Record a motion event and return its collaborator-assigned id.
    async fn create_motion_event(&self, device_key: i64) -> Result<i64, StoreError>;

    /// Flag a motion event as notified.
    async fn mark_notification_sent(&self, motion_event_id: i64) -> Result<(), StoreError>;

    /// Insert video metadata and return the new primary key.
    async fn insert_video(&self, video: &NewVideo) -> Result<i64, StoreError>;

    /// Number of videos stored for a device.
    async fn count_videos(&self, device_key: i64) -> Result<u64, StoreError>;

    /// Oldest videos of a device by capture time, ties broken by id.
    async fn oldest_videos(&self, device_key: i64, limit: u64)
        -> Result<Vec<StoredVideo>, StoreError>;

    /// Delete a single video metadata record.
    async fn delete_video(&self, video_id: i64) -> Result<(), StoreError>;
}

/// MySQL-backed device directory and metadata store.
///
/// Every call acquires a pooled connection for the duration of one statement
/// (or transaction) and returns it on drop, error paths included.
pub struct MySqlMetadataStore {
    pool: MySqlPool,
}

impl MySqlMetadataStore {
    /// Create a new metadata store with connection pool
    pub async fn new(config: &DatabaseConfig) -> Result<Self, StoreError> {
        let pool = MySqlPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(config.connect_timeout())
            .idle_timeout(Some(config.idle_timeout()))
            .connect(&config.url)
            .await?;

        info!("Connected to MySQL database");

        Ok(Self { pool })
    }

    /// Run database migrations
    pub async fn run_migrations(&self) -> Result<(), StoreError> {
        info!("Running database migrations");

        sqlx::migrate!("./migrations").run(&self.pool).await?;

        info!("Database migrations completed");
        Ok(())
    }
}

#[async_trait]
impl DeviceDirectory for MySqlMetadataStore {
    #[instrument(skip(self))]
    async fn lookup(&self, device_id: &str) -> Result<Option<DeviceRecord>, StoreError> {
        let device = sqlx::query_as::<_, DeviceRecord>(
            r#"
            SELECT CAST(id AS SIGNED) AS id,
                   deviceId AS device_id,
                   CAST(ownerId AS SIGNED) AS owner_id,
                   name
            FROM devices
            WHERE deviceId = ? AND isActive = 1
            "#,
        )
        .bind(device_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(device)
    }
}

#[async_trait]
impl MetadataStore for MySqlMetadataStore {
    #[instrument(skip(self))]
    async fn create_motion_event(&self, device_key: i64) -> Result<i64, StoreError> {
        let result = sqlx::query(
            r#"
            INSERT INTO motionEvents (deviceId, detectedAt, notificationSent)
            VALUES (?, NOW(), 0)
            "#,
        )
        .bind(device_key)
        .execute(&self.pool)
        .await?;

        let motion_event_id = result.last_insert_id() as i64;
        debug!(motion_event_id, "Motion event recorded");

        Ok(motion_event_id)
    }

    #[instrument(skip(self))]
    async fn mark_notification_sent(&self, motion_event_id: i64) -> Result<(), StoreError> {
        sqlx::query("UPDATE motionEvents SET notificationSent = 1 WHERE id = ?")
            .bind(motion_event_id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    #[instrument(skip(self, video), fields(device_key = video.device_key, filename = %video.filename))]
    async fn insert_video(&self, video: &NewVideo) -> Result<i64, StoreError> {
        let result = sqlx::query(
            r#"
            INSERT INTO motionVideos (
                deviceId, motionEventId, filename, filepath,
                duration, filesize, capturedAt
            ) VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(video.device_key)
        .bind(video.motion_event_id)
        .bind(&video.filename)
        .bind(&video.filepath)
        .bind(video.duration_secs)
        .bind(video.filesize)
        .bind(video.captured_at)
        .execute(&self.pool)
        .await?;

        let video_id = result.last_insert_id() as i64;
        debug!(video_id, "Video metadata saved");

        Ok(video_id)
    }

    async fn count_videos(&self, device_key: i64) -> Result<u64, StoreError> {
        let count: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM motionVideos WHERE deviceId = ?")
            .bind(device_key)
            .fetch_one(&self.pool)
            .await?;

        Ok(count.0.max(0) as u64)
    }

    async fn oldest_videos(
        &self,
        device_key: i64,
        limit: u64,
    ) -> Result<Vec<StoredVideo>, StoreError> {
        let videos = sqlx::query_as::<_, StoredVideo>(
            r#"
            SELECT CAST(id AS SIGNED) AS id, filepath
            FROM motionVideos
            WHERE deviceId = ?
            ORDER BY capturedAt ASC, id ASC
            LIMIT ?
            "#,
        )
        .bind(device_key)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(videos)
    }

    #[instrument(skip(self))]
    async fn delete_video(&self, video_id: i64) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM motionVideos WHERE id = ?")
            .bind(video_id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }
}
