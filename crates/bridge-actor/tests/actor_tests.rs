use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tokio::time::{sleep, timeout};

use bridge_actor::{
    ActorConfig, BridgeActor, BrokerConnector, BrokerLink, DeviceApi, TARGET_DEVICE_NAME,
};
use eagle_client::ClientError;
use mqtt_publisher::PublishError;

const INTERVAL: Duration = Duration::from_millis(10);
const TEST_BUDGET: Duration = Duration::from_secs(5);

fn actor_config() -> ActorConfig {
    ActorConfig {
        poll_interval: INTERVAL,
    }
}

fn device_list_xml(names: &[&str]) -> String {
    let mut body = String::from("<DeviceList>");
    for (index, name) in names.iter().enumerate() {
        body.push_str(&format!(
            "<Device><HardwareAddress>0x{index:02x}</HardwareAddress><Name>{name}</Name></Device>"
        ));
    }
    body.push_str("</DeviceList>");
    body
}

fn query_xml(value: &str) -> String {
    format!(
        "<Device><Components><Component><Name>Main</Name><Variables>\
         <Variable><Name>zigbee:InstantaneousDemand</Name><Value>{value}</Value></Variable>\
         </Variables></Component></Components></Device>"
    )
}

const EMPTY_QUERY: &str = "<Device><Components></Components></Device>";

/// Device fake fed from scripts; requests cancellation once the query script
/// runs dry so tests wind down deterministically.
struct ScriptedDevice {
    lists: Mutex<VecDeque<Result<String, ClientError>>>,
    queries: Mutex<VecDeque<Result<String, ClientError>>>,
    queried_addresses: Arc<Mutex<Vec<String>>>,
    shutdown: Arc<watch::Sender<bool>>,
}

impl ScriptedDevice {
    fn new(
        lists: Vec<Result<String, ClientError>>,
        queries: Vec<Result<String, ClientError>>,
        shutdown: Arc<watch::Sender<bool>>,
    ) -> Self {
        Self {
            lists: Mutex::new(lists.into()),
            queries: Mutex::new(queries.into()),
            queried_addresses: Arc::new(Mutex::new(Vec::new())),
            shutdown,
        }
    }
}

#[async_trait]
impl DeviceApi for ScriptedDevice {
    async fn device_list(&self) -> Result<String, ClientError> {
        self.lists
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Ok(device_list_xml(&[TARGET_DEVICE_NAME])))
    }

    async fn device_query(
        &self,
        hardware_address: &str,
        _component: &str,
        _variable: &str,
    ) -> Result<String, ClientError> {
        self.queried_addresses
            .lock()
            .unwrap()
            .push(hardware_address.to_string());
        match self.queries.lock().unwrap().pop_front() {
            Some(result) => result,
            None => {
                let _ = self.shutdown.send(true);
                Ok(EMPTY_QUERY.to_string())
            }
        }
    }
}

#[derive(Clone, Default)]
struct BrokerLog {
    published: Arc<Mutex<Vec<String>>>,
    connects: Arc<Mutex<usize>>,
    publish_attempts: Arc<Mutex<usize>>,
    /// 1-based publish attempt that should fail, once.
    fail_attempt: Arc<Mutex<Option<usize>>>,
    /// Number of connect attempts to fail before succeeding.
    fail_connects: Arc<Mutex<usize>>,
}

struct FakeLink {
    log: BrokerLog,
}

#[async_trait]
impl BrokerLink for FakeLink {
    async fn publish(&mut self, _topic: &str, payload: String) -> Result<(), PublishError> {
        let attempt = {
            let mut attempts = self.log.publish_attempts.lock().unwrap();
            *attempts += 1;
            *attempts
        };
        let should_fail = {
            let mut fail = self.log.fail_attempt.lock().unwrap();
            if *fail == Some(attempt) {
                *fail = None;
                true
            } else {
                false
            }
        };
        if should_fail {
            return Err(PublishError::Timeout { timeout_ms: 1 });
        }
        self.log.published.lock().unwrap().push(payload);
        Ok(())
    }

    async fn idle(&mut self, window: Duration) -> Result<(), PublishError> {
        sleep(window).await;
        Ok(())
    }

    async fn close(self) {}
}

struct FakeConnector {
    log: BrokerLog,
}

#[async_trait]
impl BrokerConnector for FakeConnector {
    type Link = FakeLink;

    async fn connect(&self) -> Result<FakeLink, PublishError> {
        {
            let mut remaining = self.log.fail_connects.lock().unwrap();
            if *remaining > 0 {
                *remaining -= 1;
                return Err(PublishError::Timeout { timeout_ms: 1 });
            }
        }
        *self.log.connects.lock().unwrap() += 1;
        Ok(FakeLink {
            log: self.log.clone(),
        })
    }
}

fn payload_for(watts: &str) -> String {
    format!("power,location=home,sensor=eagle-200 value={watts}")
}

#[tokio::test]
async fn publishes_each_reading_in_order() {
    let (tx, rx) = watch::channel(false);
    let tx = Arc::new(tx);
    let device = ScriptedDevice::new(
        vec![Ok(device_list_xml(&[TARGET_DEVICE_NAME]))],
        vec![
            Ok(query_xml("1.0")),
            Ok(query_xml("2.5")),
            Ok(query_xml("-0.5")),
        ],
        tx.clone(),
    );
    let log = BrokerLog::default();
    let connector = FakeConnector { log: log.clone() };

    let actor = BridgeActor::new(device, connector, rx, actor_config());
    timeout(TEST_BUDGET, actor.run())
        .await
        .expect("run finished")
        .expect("run ok");

    let published = log.published.lock().unwrap().clone();
    assert_eq!(
        published,
        vec![
            payload_for("1000"),
            payload_for("2500"),
            payload_for("-500"),
        ]
    );
    assert_eq!(*log.connects.lock().unwrap(), 1);
}

#[tokio::test]
async fn publish_failure_reconnects_without_replaying_old_readings() {
    let (tx, rx) = watch::channel(false);
    let tx = Arc::new(tx);
    let device = ScriptedDevice::new(
        vec![Ok(device_list_xml(&[TARGET_DEVICE_NAME]))],
        vec![
            Ok(query_xml("1.0")),
            Ok(query_xml("2.0")),
            Ok(query_xml("3.0")),
        ],
        tx.clone(),
    );
    let log = BrokerLog::default();
    *log.fail_attempt.lock().unwrap() = Some(2);
    let connector = FakeConnector { log: log.clone() };

    let actor = BridgeActor::new(device, connector, rx, actor_config());
    timeout(TEST_BUDGET, actor.run())
        .await
        .expect("run finished")
        .expect("run ok");

    // The reading from the failed tick is gone for good; later readings
    // resume on the fresh session.
    let published = log.published.lock().unwrap().clone();
    assert_eq!(published, vec![payload_for("1000"), payload_for("3000")]);
    assert_eq!(*log.connects.lock().unwrap(), 2);
}

#[tokio::test]
async fn device_error_skips_tick_without_touching_broker() {
    let (tx, rx) = watch::channel(false);
    let tx = Arc::new(tx);
    let device = ScriptedDevice::new(
        vec![Ok(device_list_xml(&[TARGET_DEVICE_NAME]))],
        vec![
            Ok(query_xml("1.0")),
            Err(ClientError::Status(500)),
            Ok(query_xml("3.0")),
        ],
        tx.clone(),
    );
    let log = BrokerLog::default();
    let connector = FakeConnector { log: log.clone() };

    let actor = BridgeActor::new(device, connector, rx, actor_config());
    timeout(TEST_BUDGET, actor.run())
        .await
        .expect("run finished")
        .expect("run ok");

    let published = log.published.lock().unwrap().clone();
    assert_eq!(published, vec![payload_for("1000"), payload_for("3000")]);
    assert_eq!(*log.connects.lock().unwrap(), 1);
}

#[tokio::test]
async fn empty_and_malformed_ticks_are_skipped() {
    let (tx, rx) = watch::channel(false);
    let tx = Arc::new(tx);
    let device = ScriptedDevice::new(
        vec![Ok(device_list_xml(&[TARGET_DEVICE_NAME]))],
        vec![
            Ok(EMPTY_QUERY.to_string()),
            Ok(query_xml("offline")),
            Ok(query_xml("0.25")),
        ],
        tx.clone(),
    );
    let log = BrokerLog::default();
    let connector = FakeConnector { log: log.clone() };

    let actor = BridgeActor::new(device, connector, rx, actor_config());
    timeout(TEST_BUDGET, actor.run())
        .await
        .expect("run finished")
        .expect("run ok");

    let published = log.published.lock().unwrap().clone();
    assert_eq!(published, vec![payload_for("250")]);
    assert_eq!(*log.connects.lock().unwrap(), 1);
}

#[tokio::test]
async fn broker_connect_failure_is_retried_at_interval() {
    let (tx, rx) = watch::channel(false);
    let tx = Arc::new(tx);
    let device = ScriptedDevice::new(
        vec![Ok(device_list_xml(&[TARGET_DEVICE_NAME]))],
        vec![Ok(query_xml("1.0"))],
        tx.clone(),
    );
    let log = BrokerLog::default();
    *log.fail_connects.lock().unwrap() = 2;
    let connector = FakeConnector { log: log.clone() };

    let actor = BridgeActor::new(device, connector, rx, actor_config());
    timeout(TEST_BUDGET, actor.run())
        .await
        .expect("run finished")
        .expect("run ok");

    let published = log.published.lock().unwrap().clone();
    assert_eq!(published, vec![payload_for("1000")]);
    assert_eq!(*log.connects.lock().unwrap(), 1);
}

#[tokio::test]
async fn discovery_waits_for_target_and_selects_by_name() {
    let (tx, rx) = watch::channel(false);
    let tx = Arc::new(tx);
    let device = ScriptedDevice::new(
        vec![
            Ok(device_list_xml(&[])),
            Ok(device_list_xml(&["Hallway Thermostat"])),
            Ok(device_list_xml(&["Hallway Thermostat", TARGET_DEVICE_NAME])),
        ],
        vec![Ok(query_xml("1.0"))],
        tx.clone(),
    );
    let log = BrokerLog::default();
    let connector = FakeConnector { log: log.clone() };

    let actor = BridgeActor::new(device, connector, rx, actor_config());
    timeout(TEST_BUDGET, actor.run())
        .await
        .expect("run finished")
        .expect("run ok");

    assert_eq!(
        log.published.lock().unwrap().clone(),
        vec![payload_for("1000")]
    );
}

#[tokio::test]
async fn discovery_queries_the_selected_device_address() {
    let (tx, rx) = watch::channel(false);
    let tx = Arc::new(tx);
    let device = ScriptedDevice::new(
        vec![Ok(device_list_xml(&["Hallway Thermostat", TARGET_DEVICE_NAME]))],
        vec![Ok(query_xml("1.0"))],
        tx.clone(),
    );
    let queried_addresses = device.queried_addresses.clone();
    let log = BrokerLog::default();
    let connector = FakeConnector { log: log.clone() };

    let actor = BridgeActor::new(device, connector, rx, actor_config());
    timeout(TEST_BUDGET, actor.run())
        .await
        .expect("run finished")
        .expect("run ok");

    // The thermostat is entry 0, the meter entry 1.
    let addresses = queried_addresses.lock().unwrap().clone();
    assert!(!addresses.is_empty());
    assert!(addresses.iter().all(|address| address == "0x01"));
}

#[tokio::test]
async fn discovery_failure_is_fatal() {
    let (tx, rx) = watch::channel(false);
    let tx = Arc::new(tx);
    let device = ScriptedDevice::new(vec![Err(ClientError::Auth(401))], vec![], tx.clone());
    let log = BrokerLog::default();
    let connector = FakeConnector { log: log.clone() };

    let actor = BridgeActor::new(device, connector, rx, actor_config());
    let result = timeout(TEST_BUDGET, actor.run()).await.expect("run finished");
    assert!(result.is_err());
    assert_eq!(*log.connects.lock().unwrap(), 0);
}

#[tokio::test]
async fn cancellation_is_prompt_and_idempotent() {
    let (tx, rx) = watch::channel(false);
    let tx = Arc::new(tx);
    // Endless empty readings keep the loop in steady state.
    let device = ScriptedDevice::new(
        vec![Ok(device_list_xml(&[TARGET_DEVICE_NAME]))],
        (0..1000).map(|_| Ok(EMPTY_QUERY.to_string())).collect(),
        tx.clone(),
    );
    let log = BrokerLog::default();
    let connector = FakeConnector { log: log.clone() };

    let actor = BridgeActor::new(device, connector, rx, actor_config());
    let handle = tokio::spawn(actor.run());

    sleep(INTERVAL * 3).await;
    tx.send(true).expect("first cancel");
    tx.send(true).expect("second cancel");

    let result = timeout(INTERVAL * 10, handle)
        .await
        .expect("exited within one interval")
        .expect("task join");
    assert!(result.is_ok());
}

#[tokio::test]
async fn cancellation_before_startup_is_honored() {
    let (tx, rx) = watch::channel(false);
    let tx = Arc::new(tx);
    tx.send(true).expect("cancel before start");

    let device = ScriptedDevice::new(vec![], vec![], tx.clone());
    let log = BrokerLog::default();
    let connector = FakeConnector { log: log.clone() };

    let actor = BridgeActor::new(device, connector, rx, actor_config());
    let result = timeout(TEST_BUDGET, actor.run()).await.expect("run finished");
    assert!(result.is_ok());
    assert_eq!(*log.connects.lock().unwrap(), 0);
}
