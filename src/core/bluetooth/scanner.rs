//! Peripheral scanning
//! Discovery callbacks are posted onto the execution queue where they update
//! the registry and notify the discovery listeners.

use log::{error, info};
use uuid::Uuid;

use crate::core::bluetooth::error::Error;
use crate::core::bluetooth::manager::Central;
use crate::core::bluetooth::types::DiscoveryRecord;

impl Central {
    /// Scans for peripherals advertising any of `service_filter`, or all peripherals if empty
    pub fn start_scan(&mut self, service_filter: &[Uuid]) -> Result<(), Error> {
        if !self.is_ready {
            error!("[BLE] Central not ready for scanning");
            return Err(Error::NotReady);
        }

        let required_services = service_filter.to_vec();
        let queue = self.queue.handle();
        self.is_scanning = self.transport.start_scan(
            service_filter,
            Box::new(move |discovery| {
                let required_services = required_services.clone();
                queue.post(move |central: &mut Central| {
                    central.on_peripheral_discovered(discovery, &required_services);
                });
            }),
        );

        if self.is_scanning {
            let services: Vec<String> = service_filter.iter().map(Uuid::to_string).collect();
            info!(
                "[BLE] Starting scan for BLE peripherals with services [{}]",
                services.join(", ")
            );
            Ok(())
        } else {
            error!("[BLE] Failed to start scanning for peripherals");
            Err(Error::ScanFailed)
        }
    }

    pub fn stop_scan(&mut self) {
        info!("[BLE] Stopping scan");
        self.transport.stop_scan();
        self.is_scanning = false;
    }

    /// Registers a callback fired for every discovery, rediscoveries included
    pub fn add_discovery_listener(&mut self, listener: impl FnMut(&DiscoveryRecord) + 'static) {
        self.discovery_listeners.push(Box::new(listener));
    }

    fn on_peripheral_discovered(&mut self, discovery: DiscoveryRecord, required_services: &[Uuid]) {
        info!(
            "[BLE:{}] Peripheral discovered with address={:#X}, RSSI={}",
            discovery.name, discovery.address, discovery.rssi
        );

        let record = self.registry.upsert_from_discovery(discovery, required_services);
        for listener in self.discovery_listeners.iter_mut() {
            listener(&record.discovery);
        }
    }
}
