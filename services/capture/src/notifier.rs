//! Push notification for motion events.

use crate::config::NotificationConfig;
use crate::directory::DeviceRecord;
use crate::error::NotifyError;
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;
use std::time::Duration;
use tracing::{info, instrument};

/// Tells a device's users that motion was detected.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify_motion(
        &self,
        device: &DeviceRecord,
        detected_at: DateTime<Utc>,
    ) -> Result<(), NotifyError>;
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct PushRequest<'a> {
    device_id: i64,
    title: String,
    body: String,
    data: PushData<'a>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct PushData<'a> {
    device_id: &'a str,
    #[serde(rename = "type")]
    kind: &'static str,
    timestamp: String,
}

impl<'a> PushRequest<'a> {
    fn motion(device: &'a DeviceRecord, detected_at: DateTime<Utc>) -> Self {
        Self {
            device_id: device.id,
            title: format!("Motion Detected: {}", device.name),
            body: format!("Motion was detected in your birdhouse \"{}\"", device.name),
            data: PushData {
                device_id: &device.device_id,
                kind: "motion_detection",
                timestamp: detected_at.to_rfc3339_opts(SecondsFormat::Millis, true),
            },
        }
    }
}

/// Posts notifications to the push API with a bearer key.
pub struct HttpNotifier {
    client: reqwest::Client,
    api_url: String,
    api_key: String,
}

impl HttpNotifier {
    pub fn new(config: &NotificationConfig) -> Result<Self, NotifyError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self {
            client,
            api_url: config.api_url.clone(),
            api_key: config.api_key.clone(),
        })
    }
}

#[async_trait]
impl Notifier for HttpNotifier {
    #[instrument(skip(self, device), fields(device_id = %device.device_id))]
    async fn notify_motion(
        &self,
        device: &DeviceRecord,
        detected_at: DateTime<Utc>,
    ) -> Result<(), NotifyError> {
        let response = self
            .client
            .post(&self.api_url)
            .bearer_auth(&self.api_key)
            .json(&PushRequest::motion(device, detected_at))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(NotifyError::Rejected {
                status: status.as_u16(),
                body,
            });
        }

        info!(status = status.as_u16(), "Motion notification sent");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_push_request_shape() {
        let device = DeviceRecord {
            id: 12,
            device_id: "cam1".to_string(),
            owner_id: 3,
            name: "Oak tree".to_string(),
        };
        let detected_at = Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).unwrap();

        let json = serde_json::to_value(PushRequest::motion(&device, detected_at)).unwrap();

        assert_eq!(
            json,
            serde_json::json!({
                "deviceId": 12,
                "title": "Motion Detected: Oak tree",
                "body": "Motion was detected in your birdhouse \"Oak tree\"",
                "data": {
                    "deviceId": "cam1",
                    "type": "motion_detection",
                    "timestamp": "2024-05-01T10:00:00.000Z"
                }
            })
        );
    }

    #[test]
    fn test_client_builds_from_config() {
        let config = NotificationConfig {
            api_url: "http://localhost:3000/api/push".to_string(),
            api_key: "key".to_string(),
            timeout_secs: 10,
        };
        assert!(HttpNotifier::new(&config).is_ok());
    }
}
