//! Nestcam Capture Service
//!
//! Motion-triggered video capture for networked birdhouse cameras. A motion
//! event on the bus opens a capture session for the device, the device is
//! told to start streaming, streamed JPEG frames are buffered until the
//! target length (or the age budget) is reached, and the buffered frames are
//! encoded to one MJPEG file whose metadata lands in MySQL. Each device keeps
//! a bounded number of videos; the oldest are deleted first.
//!
//! ## Architecture
//!
//! ```text
//! MQTT broker                                              MySQL
//! ┌──────────────┐   mpsc    ┌──────────────┐            ┌──────────────┐
//! │ device/+/    │──────────▶│ Dispatcher   │            │ devices      │
//! │   motion     │           │  (router)    │            │ motionEvents │
//! │   stream     │           └──────────────┘            │ motionVideos │
//! └──────────────┘             │         │               └──────────────┘
//!        ▲                     ▼         ▼                      ▲
//!        │              ┌──────────┐ ┌──────────┐               │
//!        │ "start"      │ Trigger  │ │ Frame    │               │
//!        └──────────────│ handling │ │ append   │               │
//!                       └──────────┘ └──────────┘               │
//!                             │  Session   │                    │
//!                             └─▶ Table ◀──┘                    │
//!                                   │ complete                  │
//!                                   ▼                           │
//!                            ┌──────────────┐   ┌───────────┐   │
//!                            │ Finalize     │──▶│ ffmpeg    │   │
//!                            │              │───┼───────────┼───┘
//!                            └──────────────┘   └───────────┘
//!                                   │
//!                                   ▼
//!                            ┌──────────────┐
//!                            │ Retention    │
//!                            └──────────────┘
//! ```

pub mod config;
pub mod directory;
pub mod dispatcher;
pub mod encoder;
pub mod error;
pub mod frame_buffer;
pub mod metadata_store;
pub mod mqtt_bus;
pub mod notifier;
pub mod retention;
pub mod router;
pub mod session_manager;
pub mod session_table;

#[cfg(test)]
mod test_support;

pub use config::Config;
pub use directory::{DeviceDirectory, DeviceRecord};
pub use dispatcher::Dispatcher;
pub use encoder::{ArtifactEncoder, FfmpegEncoder};
pub use error::{BusError, CaptureError, EncodeError, NotifyError, StoreError};
pub use metadata_store::{MetadataStore, MySqlMetadataStore, NewVideo, StoredVideo};
pub use mqtt_bus::{CommandPublisher, MqttBus, MqttCommandPublisher};
pub use notifier::{HttpNotifier, Notifier};
pub use retention::{RetentionEnforcer, RetentionReport};
pub use router::BusMessage;
pub use session_manager::{
    CaptureManager, Collaborators, CommittedVideo, FinalizeOutcome, TriggerOutcome,
};
pub use session_table::{AppendOutcome, SessionTable};
