use std::time::Duration;

use rumqttc::{AsyncClient, ConnectionError, Event, EventLoop, MqttOptions, Outgoing, Packet, QoS};
use thiserror::Error;
use tokio::time::{timeout, timeout_at, Instant};
use tracing::trace;

use types::Reading;

/// Fixed destination topic for power readings.
pub const POWER_TOPIC: &str = "power/home";

/// Configuration options for the broker connection.
#[cfg_attr(feature = "config", derive(serde::Serialize, serde::Deserialize))]
#[derive(Debug, Clone)]
pub struct MqttConfig {
    pub host: String,
    pub port: u16,
    pub client_id: String,
    pub keep_alive_secs: u64,
    /// Bound on connect handshakes and publish flushes in milliseconds.
    pub op_timeout_ms: u64,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 1883,
            client_id: "eagle-mqtt-bridge".to_string(),
            keep_alive_secs: 30,
            op_timeout_ms: 10_000,
        }
    }
}

#[derive(Debug, Error)]
pub enum PublishError {
    #[error("broker connection failed: {0}")]
    Connect(ConnectionError),
    #[error("broker connection lost: {0}")]
    Connection(ConnectionError),
    #[error("publish queue closed: {0}")]
    Channel(rumqttc::ClientError),
    #[error("broker operation timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },
}

/// One live connection to the broker.
///
/// rumqttc surfaces connection events through its event loop; this wrapper
/// drives the loop inline so connect and publish become plain calls that
/// either succeed or return an error the caller can act on.
pub struct BrokerSession {
    client: AsyncClient,
    eventloop: EventLoop,
    op_timeout: Duration,
}

impl BrokerSession {
    /// Opens the connection and waits for the broker CONNACK within the
    /// operation timeout.
    pub async fn connect(config: &MqttConfig) -> Result<Self, PublishError> {
        let mut options = MqttOptions::new(&config.client_id, &config.host, config.port);
        options.set_keep_alive(Duration::from_secs(config.keep_alive_secs));

        let (client, eventloop) = AsyncClient::new(options, 8);
        let mut session = Self {
            client,
            eventloop,
            op_timeout: Duration::from_millis(config.op_timeout_ms),
        };

        session
            .drive_until(|event| matches!(event, Event::Incoming(Packet::ConnAck(_))))
            .await
            .map_err(|err| match err {
                PublishError::Connection(inner) => PublishError::Connect(inner),
                other => other,
            })?;
        Ok(session)
    }

    /// Sends one message and drives the event loop until the packet has been
    /// flushed to the transport. No internal retry.
    pub async fn publish(&mut self, topic: &str, payload: String) -> Result<(), PublishError> {
        self.client
            .publish(topic, QoS::AtMostOnce, false, payload)
            .await
            .map_err(PublishError::Channel)?;
        self.drive_until(|event| matches!(event, Event::Outgoing(Outgoing::Publish(_))))
            .await
    }

    /// Services the connection for one wait window so keep-alive pings flow
    /// between publishes. Ok means the window elapsed; Err means the
    /// connection was lost and the session should be rebuilt.
    pub async fn idle(&mut self, window: Duration) -> Result<(), PublishError> {
        let deadline = Instant::now() + window;
        loop {
            match timeout_at(deadline, self.eventloop.poll()).await {
                Ok(Ok(event)) => trace!(?event, "broker event"),
                Ok(Err(err)) => return Err(PublishError::Connection(err)),
                Err(_) => return Ok(()),
            }
        }
    }

    /// Best-effort clean disconnect; errors on the way out are ignored.
    pub async fn disconnect(mut self) {
        if self.client.disconnect().await.is_ok() {
            let _ = timeout(self.op_timeout, self.eventloop.poll()).await;
        }
    }

    async fn drive_until(
        &mut self,
        done: impl Fn(&Event) -> bool,
    ) -> Result<(), PublishError> {
        let deadline = Instant::now() + self.op_timeout;
        loop {
            match timeout_at(deadline, self.eventloop.poll()).await {
                Ok(Ok(event)) => {
                    trace!(?event, "broker event");
                    if done(&event) {
                        return Ok(());
                    }
                }
                Ok(Err(err)) => return Err(PublishError::Connection(err)),
                Err(_) => {
                    return Err(PublishError::Timeout {
                        timeout_ms: self.op_timeout.as_millis() as u64,
                    })
                }
            }
        }
    }
}

/// Line-protocol payload for one reading, e.g.
/// `power,location=home,sensor=eagle-200 value=2500`.
pub fn format_reading(reading: &Reading) -> String {
    format!(
        "power,location=home,sensor=eagle-200 value={}",
        reading.watts
    )
}
