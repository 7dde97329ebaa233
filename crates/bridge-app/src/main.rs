use std::env;

use anyhow::{Context, Result};
use tokio::sync::watch;
use tracing::info;

use bridge_actor::{BridgeActor, MqttConnector};
use bridge_app::BridgeConfig;
use eagle_client::EagleSession;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let config_path = parse_config_arg();
    let config = BridgeConfig::load_with_path(config_path).context("load config failed")?;
    config.validate().context("config validation failed")?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let session = EagleSession::connect(config.eagle.clone())
        .await
        .context("eagle connect failed")?;
    info!(host = %config.eagle.host, "eagle session established");

    let actor = BridgeActor::new(
        session,
        MqttConnector::new(config.mqtt.clone()),
        shutdown_rx.clone(),
        config.actor.clone(),
    );
    let mut bridge_handle = tokio::spawn(actor.run());

    notify_ready();
    let watchdog_handle = start_watchdog(shutdown_rx.clone());

    let bridge_result = tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            signal.context("ctrl-c handler failed")?;
            info!("shutdown signal received");
            let _ = shutdown_tx.send(true);
            bridge_handle.await
        }
        result = &mut bridge_handle => result,
    };

    let _ = shutdown_tx.send(true);
    if let Some(handle) = watchdog_handle {
        let _ = handle.await;
    }

    match bridge_result {
        Ok(Ok(())) => Ok(()),
        Ok(Err(err)) => Err(anyhow::Error::new(err).context("bridge failed")),
        Err(err) => Err(anyhow::Error::new(err).context("bridge task panicked")),
    }
}

fn parse_config_arg() -> Option<String> {
    let mut args = env::args().skip(1);
    while let Some(arg) = args.next() {
        if arg == "--config" {
            return args.next();
        }
        if let Some(path) = arg.strip_prefix("--config=") {
            return Some(path.to_string());
        }
    }
    None
}

#[cfg(target_os = "linux")]
fn notify_ready() {
    if let Err(err) = sd_notify::notify(true, &[sd_notify::NotifyState::Ready]) {
        tracing::warn!(error = %err, "systemd ready notify failed");
    }
}

#[cfg(not(target_os = "linux"))]
fn notify_ready() {}

#[cfg(target_os = "linux")]
fn start_watchdog(
    mut shutdown: watch::Receiver<bool>,
) -> Option<tokio::task::JoinHandle<()>> {
    let interval = watchdog_interval()?;
    Some(tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {
                    if let Err(err) = sd_notify::notify(false, &[sd_notify::NotifyState::Watchdog]) {
                        tracing::warn!(error = %err, "systemd watchdog notify failed");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    }))
}

#[cfg(not(target_os = "linux"))]
fn start_watchdog(_shutdown: watch::Receiver<bool>) -> Option<tokio::task::JoinHandle<()>> {
    None
}

#[cfg(target_os = "linux")]
fn watchdog_interval() -> Option<std::time::Duration> {
    let watchdog_usec = env::var("WATCHDOG_USEC").ok()?.parse::<u64>().ok()?;
    if let Some(pid) = env::var("WATCHDOG_PID")
        .ok()
        .and_then(|value| value.parse::<u32>().ok())
    {
        if pid != std::process::id() {
            return None;
        }
    }

    let interval = watchdog_usec.saturating_div(2).max(100_000);
    Some(std::time::Duration::from_micros(interval))
}
