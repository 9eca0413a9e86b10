use std::sync::Arc;
use std::time::Duration;

use anyhow::{Result, anyhow};
use log::{LevelFilter, error, info};
use pixels_central_lib::core::bluetooth::{BluestTransport, Central, PeripheralId, RequestState};
use pixels_central_lib::{CentralConfig, logging};

/// Drains the central until `done` holds or `limit` elapses
async fn pump(central: &mut Central, limit: Duration, mut done: impl FnMut(&Central) -> bool) -> bool {
    let tick = central.config().tick_interval();
    let started = tokio::time::Instant::now();
    loop {
        central.drain();
        if done(central) {
            return true;
        }
        if started.elapsed() >= limit {
            return false;
        }
        tokio::time::sleep(tick).await;
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    logging::init(LevelFilter::Info);

    let name = std::env::args()
        .nth(1)
        .ok_or_else(|| anyhow!("usage: pixels-central <peripheral name>"))?;
    let config_dir = std::env::current_dir()?;
    let config = CentralConfig::load_config(&config_dir).await?;

    let transport = Arc::new(BluestTransport::new().await?);
    let mut central = Central::new(transport, config)?;
    central.initialize()?;
    if !pump(&mut central, Duration::from_secs(5), Central::is_ready).await {
        return Err(anyhow!("Bluetooth radio not available"));
    }

    central.start_scan(&[])?;
    let found = pump(&mut central, Duration::from_secs(30), |central| {
        central
            .scanned_peripherals()
            .iter()
            .any(|peripheral| peripheral.name.contains(&name))
    })
    .await;
    central.stop_scan();

    let Some(peripheral) = central
        .scanned_peripherals()
        .into_iter()
        .find(|peripheral| peripheral.name.contains(&name))
    else {
        central.shutdown();
        return Err(anyhow!("No peripheral named {:?} found (scan complete: {})", name, found));
    };
    let id: PeripheralId = peripheral.id.clone();
    info!("Connecting to {} ({:#X})", peripheral.name, peripheral.address);

    let timeout = central.config().connect_timeout().max(Duration::from_secs(30));
    let connect = central.connect(&id, timeout, |peripheral, ready| {
        info!("{} is {}", peripheral.name, if ready { "ready" } else { "disconnected" });
    })?;
    pump(&mut central, timeout, |_| connect.is_done()).await;
    match connect.poll_state() {
        RequestState::Succeeded(()) => {
            let request_timeout = central.default_timeout();
            let rssi = central.read_rssi(&id, request_timeout)?;
            pump(&mut central, request_timeout, |_| rssi.is_done()).await;
            match rssi.poll_state() {
                RequestState::Succeeded(value) => info!("RSSI of {} is {} dBm", peripheral.name, value),
                state => error!("Failed to read RSSI: {:?}", state),
            }
            for service in central.discovered_services(&id)?.unwrap_or_default() {
                info!("Service {}", service);
            }

            let disconnect = central.disconnect(&id)?;
            pump(&mut central, Duration::from_secs(5), |_| disconnect.is_done()).await;
        }
        state => error!("Failed to connect: {:?}", state),
    }

    central.shutdown();
    Ok(())
}
