use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::watch;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use eagle_client::{ClientError, EagleSession};
use eagle_parser::ParserError;
use mqtt_publisher::{format_reading, BrokerSession, MqttConfig, PublishError, POWER_TOPIC};
use types::Device;

/// The sub-device the bridge publishes readings for, matched by name.
pub const TARGET_DEVICE_NAME: &str = "Power Meter";

#[derive(Debug, Clone)]
pub struct ActorConfig {
    pub poll_interval: Duration,
}

impl Default for ActorConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(5),
        }
    }
}

/// Only discovery can fail the bridge; past that point every error is
/// handled inside the loop.
#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("device session failed during discovery: {0}")]
    Discovery(#[from] ClientError),
    #[error("device list unreadable during discovery: {0}")]
    DiscoveryParse(#[from] ParserError),
}

/// Read access to the device API, one session's worth.
#[async_trait]
pub trait DeviceApi: Send + Sync {
    async fn device_list(&self) -> Result<String, ClientError>;
    async fn device_query(
        &self,
        hardware_address: &str,
        component: &str,
        variable: &str,
    ) -> Result<String, ClientError>;
}

#[async_trait]
impl DeviceApi for EagleSession {
    async fn device_list(&self) -> Result<String, ClientError> {
        EagleSession::device_list(self).await
    }

    async fn device_query(
        &self,
        hardware_address: &str,
        component: &str,
        variable: &str,
    ) -> Result<String, ClientError> {
        EagleSession::device_query(self, hardware_address, component, variable).await
    }
}

/// One live broker connection.
#[async_trait]
pub trait BrokerLink: Send {
    async fn publish(&mut self, topic: &str, payload: String) -> Result<(), PublishError>;
    /// Services the connection for one wait window; Err means the link died.
    async fn idle(&mut self, window: Duration) -> Result<(), PublishError>;
    async fn close(self);
}

/// Opens broker connections; invoked again after every teardown.
#[async_trait]
pub trait BrokerConnector: Send {
    type Link: BrokerLink;
    async fn connect(&self) -> Result<Self::Link, PublishError>;
}

#[async_trait]
impl BrokerLink for BrokerSession {
    async fn publish(&mut self, topic: &str, payload: String) -> Result<(), PublishError> {
        BrokerSession::publish(self, topic, payload).await
    }

    async fn idle(&mut self, window: Duration) -> Result<(), PublishError> {
        BrokerSession::idle(self, window).await
    }

    async fn close(self) {
        BrokerSession::disconnect(self).await;
    }
}

pub struct MqttConnector {
    config: MqttConfig,
}

impl MqttConnector {
    pub fn new(config: MqttConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl BrokerConnector for MqttConnector {
    type Link = BrokerSession;

    async fn connect(&self) -> Result<BrokerSession, PublishError> {
        BrokerSession::connect(&self.config).await
    }
}

/// The polling-and-republishing loop.
///
/// Owns both session lifecycles: the device session for the whole run, the
/// broker session per connection generation. Broker loss tears down only the
/// broker side; device-side trouble after discovery skips the tick. All waits
/// and I/O observe the shutdown flag within one interval.
pub struct BridgeActor<D, C>
where
    D: DeviceApi,
    C: BrokerConnector,
{
    device: D,
    connector: C,
    shutdown: watch::Receiver<bool>,
    config: ActorConfig,
}

impl<D, C> BridgeActor<D, C>
where
    D: DeviceApi,
    C: BrokerConnector,
{
    pub fn new(
        device: D,
        connector: C,
        shutdown: watch::Receiver<bool>,
        config: ActorConfig,
    ) -> Self {
        Self {
            device,
            connector,
            shutdown,
            config,
        }
    }

    /// Runs until cancelled. Returns Err only when discovery fails; a
    /// cancelled run returns Ok.
    pub async fn run(mut self) -> Result<(), BridgeError> {
        let target = match self.discover().await? {
            Some(target) => target,
            None => {
                info!("bridge cancelled during discovery");
                return Ok(());
            }
        };
        info!(
            name = %target.name,
            hardware_address = %target.hardware_address,
            "target device selected"
        );

        self.bridge(&target).await;
        info!("bridge stopped");
        Ok(())
    }

    /// Discovering state: list devices at the poll interval until the power
    /// meter shows up. With no device there is nothing to bridge, so any
    /// failure here is fatal. Returns None on cancellation.
    async fn discover(&mut self) -> Result<Option<Device>, BridgeError> {
        loop {
            if *self.shutdown.borrow() {
                return Ok(None);
            }

            let body = self.device.device_list().await?;
            let devices = eagle_parser::parse_device_list(&body)?;

            if let Some(device) = devices
                .iter()
                .find(|device| device.name == TARGET_DEVICE_NAME)
            {
                return Ok(Some(device.clone()));
            }

            if devices.is_empty() {
                info!("no paired devices yet, waiting");
            } else {
                warn!(
                    listed = devices.len(),
                    target = TARGET_DEVICE_NAME,
                    "target device not in list, waiting"
                );
            }

            if self.wait_interval().await {
                return Ok(None);
            }
        }
    }

    /// Broker session lifecycle: connect, poll until the link dies, then
    /// reconnect after one interval. Fixed-interval retry, no cap.
    async fn bridge(&mut self, target: &Device) {
        loop {
            if *self.shutdown.borrow() {
                return;
            }

            let link = match self.connector.connect().await {
                Ok(link) => link,
                Err(err) => {
                    warn!(
                        error = %err,
                        retry_secs = self.config.poll_interval.as_secs(),
                        "broker connect failed, retrying"
                    );
                    if self.wait_interval().await {
                        return;
                    }
                    continue;
                }
            };
            info!("broker session established");

            if !self.poll(target, link).await {
                return;
            }
            warn!(
                retry_secs = self.config.poll_interval.as_secs(),
                "broker session lost, reconnecting"
            );
            if self.wait_interval().await {
                return;
            }
        }
    }

    /// Steady polling state. Returns true when the broker session was lost
    /// and a reconnect should follow, false on cancellation.
    async fn poll(&mut self, target: &Device, mut link: C::Link) -> bool {
        loop {
            if *self.shutdown.borrow() {
                link.close().await;
                return false;
            }

            if let Err(err) = self.tick(target, &mut link).await {
                // Broken transport; the link is dropped as-is.
                warn!(error = %err, "broker publish failed");
                return true;
            }

            // The interval wait doubles as connection servicing so
            // keep-alives flow and a dead broker surfaces before the next
            // reading is taken.
            let window = self.config.poll_interval;
            tokio::select! {
                result = link.idle(window) => {
                    if let Err(err) = result {
                        warn!(error = %err, "broker connection lost while idle");
                        return true;
                    }
                }
                changed = self.shutdown.changed() => {
                    if changed.is_err() || *self.shutdown.borrow() {
                        link.close().await;
                        return false;
                    }
                }
            }
        }
    }

    /// One poll tick. Device-side trouble and malformed data skip the tick;
    /// only a broker failure propagates to the caller.
    async fn tick(&mut self, target: &Device, link: &mut C::Link) -> Result<(), PublishError> {
        let body = match self
            .device
            .device_query(
                &target.hardware_address,
                eagle_parser::MAIN_COMPONENT,
                eagle_parser::DEMAND_VARIABLE,
            )
            .await
        {
            Ok(body) => body,
            Err(err) => {
                warn!(error = %err, "device query failed, skipping tick");
                return Ok(());
            }
        };

        let query = match eagle_parser::parse_device_query(&body) {
            Ok(query) => query,
            Err(err) => {
                warn!(error = %err, "device response unreadable, skipping tick");
                return Ok(());
            }
        };

        if query.is_empty() {
            debug!("no data this tick");
            return Ok(());
        }

        let reading = match eagle_parser::extract_demand_watts(&query) {
            Ok(reading) => reading,
            Err(err) => {
                warn!(error = %err, "demand value unusable, skipping tick");
                return Ok(());
            }
        };

        info!(watts = reading.watts, "publishing reading");
        link.publish(POWER_TOPIC, format_reading(&reading)).await
    }

    /// Sleeps one poll interval. Returns true when cancellation arrived
    /// during the wait (a dropped sender counts as cancellation).
    async fn wait_interval(&mut self) -> bool {
        tokio::select! {
            _ = sleep(self.config.poll_interval) => false,
            changed = self.shutdown.changed() => {
                changed.is_err() || *self.shutdown.borrow()
            }
        }
    }
}
