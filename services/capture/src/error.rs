//! Error types shared by the capture core and its collaborators.

use thiserror::Error;

/// Errors raised by the relational store collaborators (device directory,
/// correlation records, artifact metadata).
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration failed: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

/// Errors raised by the artifact encoder.
#[derive(Error, Debug)]
pub enum EncodeError {
    #[error("No frames to encode")]
    NoFrames,

    #[error("Failed to stage frames: {0}")]
    Staging(#[from] std::io::Error),

    #[error("Failed to start encoder: {0}")]
    Spawn(std::io::Error),

    #[error("Encoder exited with {status}: {stderr}")]
    Failed { status: String, stderr: String },

    #[error("Encoder produced no output at {0}")]
    MissingOutput(String),
}

/// Errors raised by the message bus adapter.
#[derive(Error, Debug)]
pub enum BusError {
    #[error("MQTT client error: {0}")]
    Client(#[from] rumqttc::ClientError),

    #[error("MQTT connection error: {0}")]
    Connection(#[from] rumqttc::ConnectionError),

    #[error("Inbound channel closed")]
    ChannelClosed,
}

/// Errors raised by the push-notification adapter.
#[derive(Error, Debug)]
pub enum NotifyError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Notification API returned {status}: {body}")]
    Rejected { status: u16, body: String },
}

/// Failure taxonomy of the capture session manager.
///
/// Duplicate triggers and insufficient-frame aborts are normal outcomes and
/// are reported through `TriggerOutcome` / `FinalizeOutcome` instead.
#[derive(Error, Debug)]
pub enum CaptureError {
    #[error("Malformed input: {0}")]
    MalformedInput(String),

    #[error("Unknown or inactive device: {0}")]
    UnknownDevice(String),

    #[error("Persistence failed: {0}")]
    Persistence(#[from] StoreError),

    #[error("Encoding failed: {0}")]
    EncodeFailure(#[from] EncodeError),

    #[error("Artifact file error: {0}")]
    Io(#[from] std::io::Error),
}

impl CaptureError {
    /// Noise-level conditions are dropped quietly; everything else is a
    /// resource failure worth an error log.
    pub fn is_noise(&self) -> bool {
        matches!(
            self,
            CaptureError::MalformedInput(_) | CaptureError::UnknownDevice(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_noise_classification() {
        assert!(CaptureError::MalformedInput("bad topic".into()).is_noise());
        assert!(CaptureError::UnknownDevice("cam9".into()).is_noise());
        assert!(!CaptureError::Persistence(StoreError::Unavailable("down".into())).is_noise());
        assert!(!CaptureError::EncodeFailure(EncodeError::NoFrames).is_noise());
    }

    #[test]
    fn test_error_messages() {
        let err = CaptureError::from(EncodeError::Failed {
            status: "exit status: 1".to_string(),
            stderr: "invalid data".to_string(),
        });
        assert_eq!(
            err.to_string(),
            "Encoding failed: Encoder exited with exit status: 1: invalid data"
        );
    }
}
