//! MQTT adapter: subscribes to device topics, forwards publishes into the
//! dispatcher channel and carries outbound control commands.

use crate::config::MqttConfig;
use crate::error::BusError;
use crate::router::{control_topic, motion_filter, stream_filter, BusMessage};
use backoff::{backoff::Backoff, ExponentialBackoff};
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Packet, QoS};
use tokio::sync::mpsc;
use tracing::{debug, info, instrument, warn};

/// Payload of the start-streaming command.
pub const START_COMMAND: &str = "start";

/// Outbound device commands.
#[cfg_attr(test, mockall::automock)]
pub trait CommandPublisher: Send + Sync {
    /// Ask a device to start streaming. Best effort: queued without
    /// waiting for the broker and never acknowledged.
    fn send_start(&self, device_id: &str) -> Result<(), BusError>;
}

/// Inbound side of the MQTT connection.
pub struct MqttBus {
    client: AsyncClient,
    eventloop: EventLoop,
    namespace: String,
    backoff: ExponentialBackoff,
}

/// Publishes control commands through the shared MQTT client.
#[derive(Clone)]
pub struct MqttCommandPublisher {
    client: AsyncClient,
    namespace: String,
}

fn mqtt_options(config: &MqttConfig) -> MqttOptions {
    let mut options = MqttOptions::new(&config.client_id, &config.host, config.port);
    options.set_keep_alive(config.keep_alive());
    options.set_clean_session(true);

    if let (Some(username), Some(password)) = (&config.username, &config.password) {
        options.set_credentials(username, password);
    }

    options
}

/// Reconnect delays start at the base delay and never give up.
fn reconnect_backoff(config: &MqttConfig) -> ExponentialBackoff {
    ExponentialBackoff {
        current_interval: config.reconnect_base_delay(),
        initial_interval: config.reconnect_base_delay(),
        max_interval: config.reconnect_max_delay(),
        max_elapsed_time: None,
        ..Default::default()
    }
}

impl MqttBus {
    /// Build the client. No network traffic happens until [`MqttBus::run`]
    /// polls the event loop.
    pub fn new(config: &MqttConfig) -> (Self, MqttCommandPublisher) {
        let (client, eventloop) = AsyncClient::new(mqtt_options(config), config.channel_capacity);

        let backoff = reconnect_backoff(config);

        let publisher = MqttCommandPublisher {
            client: client.clone(),
            namespace: config.topic_namespace.clone(),
        };

        let bus = Self {
            client,
            eventloop,
            namespace: config.topic_namespace.clone(),
            backoff,
        };

        (bus, publisher)
    }

    /// Drive the connection until the dispatcher hangs up.
    ///
    /// Both device filters are (re)subscribed on every `ConnAck`. Connection
    /// errors are logged and retried after an exponential delay.
    #[instrument(skip(self, tx), fields(namespace = %self.namespace))]
    pub async fn run(mut self, tx: mpsc::Sender<BusMessage>) -> Result<(), BusError> {
        info!("Starting MQTT event loop");

        loop {
            match self.eventloop.poll().await {
                Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                    info!(code = ?ack.code, "Connected to MQTT broker");
                    self.backoff.reset();
                    self.subscribe()?;
                }
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    metrics::counter!("capture.bus.received").increment(1);
                    let message = BusMessage::new(publish.topic, publish.payload);
                    if tx.send(message).await.is_err() {
                        info!("Dispatcher channel closed, stopping MQTT event loop");
                        return Err(BusError::ChannelClosed);
                    }
                }
                Ok(event) => {
                    debug!(event = ?event, "MQTT event");
                }
                Err(e) => {
                    metrics::counter!("capture.bus.errors").increment(1);
                    let delay = self
                        .backoff
                        .next_backoff()
                        .unwrap_or(self.backoff.max_interval);
                    warn!(
                        error = %e,
                        retry_in_ms = delay.as_millis() as u64,
                        "MQTT connection error"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    fn subscribe(&self) -> Result<(), BusError> {
        for filter in [motion_filter(&self.namespace), stream_filter(&self.namespace)] {
            self.client.try_subscribe(filter.as_str(), QoS::AtMostOnce)?;
            info!(filter = %filter, "Subscribed to device topic");
        }
        Ok(())
    }
}

impl CommandPublisher for MqttCommandPublisher {
    fn send_start(&self, device_id: &str) -> Result<(), BusError> {
        let topic = control_topic(&self.namespace, device_id);
        self.client
            .try_publish(topic.as_str(), QoS::AtMostOnce, false, START_COMMAND)?;
        debug!(topic = %topic, "Start command queued");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn config() -> MqttConfig {
        MqttConfig {
            host: "broker.local".to_string(),
            client_id: "capture-test".to_string(),
            keep_alive_secs: 30,
            ..MqttConfig::default()
        }
    }

    #[test]
    fn test_options_from_config() {
        let options = mqtt_options(&config());
        assert_eq!(options.broker_address(), ("broker.local".to_string(), 1883));
        assert_eq!(options.client_id(), "capture-test");
        assert_eq!(options.keep_alive(), Duration::from_secs(30));
        assert!(options.credentials().is_none());
    }

    #[test]
    fn test_credentials_need_both_parts() {
        let mut config = config();
        config.username = Some("viewer".to_string());
        assert!(mqtt_options(&config).credentials().is_none());

        config.password = Some("secret".to_string());
        assert_eq!(
            mqtt_options(&config).credentials(),
            Some(("viewer".to_string(), "secret".to_string()))
        );
    }

    #[test]
    fn test_first_reconnect_delay_follows_base() {
        let mut config = config();
        config.reconnect_base_delay_ms = 200;
        config.reconnect_max_delay_ms = 5_000;

        let mut backoff = reconnect_backoff(&config);
        assert_eq!(backoff.current_interval, Duration::from_millis(200));

        // randomization_factor 0.5 keeps the first delay within 100..=300 ms
        let first = backoff.next_backoff().unwrap();
        assert!(first >= Duration::from_millis(100), "first delay {first:?}");
        assert!(first <= Duration::from_millis(300), "first delay {first:?}");

        for _ in 0..20 {
            assert!(backoff.next_backoff().unwrap() <= Duration::from_millis(5_000));
        }
    }

    #[tokio::test]
    async fn test_start_command_is_queued_without_broker() {
        let (bus, publisher) = MqttBus::new(&config());
        tokio_test::assert_ok!(publisher.send_start("cam1"));
        drop(bus);
    }
}
