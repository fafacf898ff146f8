use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Main configuration for the capture service
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Service configuration
    #[serde(default)]
    pub service: ServiceConfig,
    /// MQTT bus configuration
    #[serde(default)]
    pub mqtt: MqttConfig,
    /// Database configuration
    pub database: DatabaseConfig,
    /// Capture session configuration
    #[serde(default)]
    pub capture: CaptureConfig,
    /// Push notification configuration (disabled when absent)
    #[serde(default)]
    pub notifications: Option<NotificationConfig>,
}

/// Service-level configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    /// Service name for logging/metrics
    #[serde(default = "default_service_name")]
    pub name: String,
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Log output format (json, pretty)
    #[serde(default = "default_log_format")]
    pub log_format: String,
    /// Metrics port
    #[serde(default = "default_metrics_port")]
    pub metrics_port: u16,
}

/// MQTT broker connection configuration
#[derive(Debug, Clone, Deserialize)]
pub struct MqttConfig {
    /// Broker host
    #[serde(default = "default_mqtt_host")]
    pub host: String,
    /// Broker port
    #[serde(default = "default_mqtt_port")]
    pub port: u16,
    /// Client identifier presented to the broker
    #[serde(default = "default_client_id")]
    pub client_id: String,
    /// Username (used only together with a password)
    pub username: Option<String>,
    /// Password
    pub password: Option<String>,
    /// Keep-alive interval in seconds
    #[serde(default = "default_keep_alive_secs")]
    pub keep_alive_secs: u64,
    /// First topic segment shared by all device topics
    #[serde(default = "default_topic_namespace")]
    pub topic_namespace: String,
    /// Capacity of the inbound event channel
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
    /// Base delay between reconnection attempts in milliseconds
    #[serde(default = "default_reconnect_base_delay_ms")]
    pub reconnect_base_delay_ms: u64,
    /// Maximum delay between reconnection attempts in milliseconds
    #[serde(default = "default_reconnect_max_delay_ms")]
    pub reconnect_max_delay_ms: u64,
}

/// Database configuration
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// MySQL connection URL
    pub url: String,
    /// Maximum number of connections in the pool
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    /// Minimum number of connections in the pool
    #[serde(default = "default_min_connections")]
    pub min_connections: u32,
    /// Connection acquire timeout in seconds
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    /// Idle connection timeout in seconds
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
    /// Run migrations on startup
    #[serde(default)]
    pub run_migrations: bool,
}

/// Capture session configuration
#[derive(Debug, Clone, Deserialize)]
pub struct CaptureConfig {
    /// Directory finished videos are written to
    #[serde(default = "default_storage_dir")]
    pub storage_dir: PathBuf,
    /// Nominal clip length in seconds
    #[serde(default = "default_target_duration_secs")]
    pub target_duration_secs: u64,
    /// Frames per second streamed by the devices and used for encoding
    #[serde(default = "default_frame_rate")]
    pub frame_rate: u32,
    /// Extra seconds a session may run past its nominal length
    #[serde(default = "default_grace_period_secs")]
    pub grace_period_secs: u64,
    /// Sessions with fewer frames are discarded
    #[serde(default = "default_min_frames")]
    pub min_frames: usize,
    /// Videos retained per device
    #[serde(default = "default_max_videos_per_device")]
    pub max_videos_per_device: u64,
    /// Interval of the stalled-session sweep in milliseconds
    #[serde(default = "default_sweep_interval_ms")]
    pub sweep_interval_ms: u64,
    /// ffmpeg executable
    #[serde(default = "default_ffmpeg_path")]
    pub ffmpeg_path: String,
    /// ffmpeg `-q:v` quality (2 is high quality)
    #[serde(default = "default_ffmpeg_quality")]
    pub ffmpeg_quality: u8,
}

/// Push notification service configuration
#[derive(Debug, Clone, Deserialize)]
pub struct NotificationConfig {
    /// Notification endpoint URL
    pub api_url: String,
    /// Bearer token for the notification endpoint
    pub api_key: String,
    /// Request timeout in seconds
    #[serde(default = "default_notification_timeout_secs")]
    pub timeout_secs: u64,
}

/// Configuration validation errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigValidationError {
    #[error("Missing required field: {0}")]
    MissingField(String),

    #[error("Invalid value for {field}: {message}")]
    InvalidValue { field: String, message: String },
}

// Default value functions
fn default_service_name() -> String {
    "capture-service".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "json".to_string()
}

fn default_metrics_port() -> u16 {
    9090
}

fn default_mqtt_host() -> String {
    "localhost".to_string()
}

fn default_mqtt_port() -> u16 {
    1883
}

fn default_client_id() -> String {
    "nestcam-capture".to_string()
}

fn default_keep_alive_secs() -> u64 {
    60
}

fn default_topic_namespace() -> String {
    "device".to_string()
}

fn default_channel_capacity() -> usize {
    256
}

fn default_reconnect_base_delay_ms() -> u64 {
    1000
}

fn default_reconnect_max_delay_ms() -> u64 {
    30000
}

fn default_max_connections() -> u32 {
    5
}

fn default_min_connections() -> u32 {
    1
}

fn default_connect_timeout_secs() -> u64 {
    10
}

fn default_idle_timeout_secs() -> u64 {
    600
}

fn default_storage_dir() -> PathBuf {
    PathBuf::from("/opt/birdhouse-viewer/videos")
}

fn default_target_duration_secs() -> u64 {
    5
}

fn default_frame_rate() -> u32 {
    10
}

fn default_grace_period_secs() -> u64 {
    1
}

fn default_min_frames() -> usize {
    5
}

fn default_max_videos_per_device() -> u64 {
    50
}

fn default_sweep_interval_ms() -> u64 {
    1000
}

fn default_ffmpeg_path() -> String {
    "ffmpeg".to_string()
}

fn default_ffmpeg_quality() -> u8 {
    2
}

fn default_notification_timeout_secs() -> u64 {
    10
}

impl DatabaseConfig {
    /// Pool acquire timeout
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }
}

impl Config {
    /// Load configuration from config files and environment
    pub fn load() -> anyhow::Result<Self> {
        let config = config::Config::builder()
            .add_source(config::File::with_name("config/capture").required(false))
            .add_source(config::File::with_name("/etc/nestcam/capture").required(false))
            // CAPTURE__MQTT__HOST -> mqtt.host
            .add_source(
                config::Environment::with_prefix("CAPTURE")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        config.try_deserialize().map_err(Into::into)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigValidationError> {
        if self.mqtt.host.is_empty() {
            return Err(ConfigValidationError::MissingField("mqtt.host".to_string()));
        }

        if self.mqtt.topic_namespace.is_empty() || self.mqtt.topic_namespace.contains('/') {
            return Err(ConfigValidationError::InvalidValue {
                field: "mqtt.topic_namespace".to_string(),
                message: "Namespace must be a single non-empty topic segment".to_string(),
            });
        }

        if self.mqtt.keep_alive_secs < 5 {
            return Err(ConfigValidationError::InvalidValue {
                field: "mqtt.keep_alive_secs".to_string(),
                message: "Keep-alive must be at least 5 seconds".to_string(),
            });
        }

        if self.mqtt.channel_capacity == 0 {
            return Err(ConfigValidationError::InvalidValue {
                field: "mqtt.channel_capacity".to_string(),
                message: "Channel capacity must be greater than 0".to_string(),
            });
        }

        if self.database.url.is_empty() {
            return Err(ConfigValidationError::MissingField("database.url".to_string()));
        }

        if !self.database.url.starts_with("mysql://") {
            return Err(ConfigValidationError::InvalidValue {
                field: "database.url".to_string(),
                message: "URL must start with mysql://".to_string(),
            });
        }

        if self.capture.target_duration_secs == 0 || self.capture.frame_rate == 0 {
            return Err(ConfigValidationError::InvalidValue {
                field: "capture.target_duration_secs/frame_rate".to_string(),
                message: "Duration and frame rate must be greater than 0".to_string(),
            });
        }

        if self.capture.max_videos_per_device == 0 {
            return Err(ConfigValidationError::InvalidValue {
                field: "capture.max_videos_per_device".to_string(),
                message: "At least one video must be retained".to_string(),
            });
        }

        if self.capture.sweep_interval_ms == 0 {
            return Err(ConfigValidationError::InvalidValue {
                field: "capture.sweep_interval_ms".to_string(),
                message: "Sweep interval must be greater than 0".to_string(),
            });
        }

        if let Some(ref notifications) = self.notifications {
            if notifications.api_url.is_empty() || notifications.api_key.is_empty() {
                return Err(ConfigValidationError::MissingField(
                    "notifications.api_url/api_key".to_string(),
                ));
            }
        }

        Ok(())
    }
}

impl MqttConfig {
    pub fn keep_alive(&self) -> Duration {
        Duration::from_secs(self.keep_alive_secs)
    }

    pub fn reconnect_base_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_base_delay_ms)
    }

    pub fn reconnect_max_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_max_delay_ms)
    }
}

impl CaptureConfig {
    /// Number of frames that completes a session.
    pub fn target_frames(&self) -> usize {
        (self.target_duration_secs * self.frame_rate as u64) as usize
    }

    /// Wall-clock budget after which a session completes regardless of
    /// frame count.
    pub fn max_session_age(&self) -> Duration {
        Duration::from_secs(self.target_duration_secs + self.grace_period_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: default_service_name(),
            log_level: default_log_level(),
            log_format: default_log_format(),
            metrics_port: default_metrics_port(),
        }
    }
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            host: default_mqtt_host(),
            port: default_mqtt_port(),
            client_id: default_client_id(),
            username: None,
            password: None,
            keep_alive_secs: default_keep_alive_secs(),
            topic_namespace: default_topic_namespace(),
            channel_capacity: default_channel_capacity(),
            reconnect_base_delay_ms: default_reconnect_base_delay_ms(),
            reconnect_max_delay_ms: default_reconnect_max_delay_ms(),
        }
    }
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            storage_dir: default_storage_dir(),
            target_duration_secs: default_target_duration_secs(),
            frame_rate: default_frame_rate(),
            grace_period_secs: default_grace_period_secs(),
            min_frames: default_min_frames(),
            max_videos_per_device: default_max_videos_per_device(),
            sweep_interval_ms: default_sweep_interval_ms(),
            ffmpeg_path: default_ffmpeg_path(),
            ffmpeg_quality: default_ffmpeg_quality(),
        }
    }
}
