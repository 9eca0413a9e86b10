//! Native transport over the `bluest` crate
//! Each native request runs as a tokio task on the runtime the transport was
//! created in; scans, connections and subscriptions are stopped through
//! cancellation tokens.

use std::collections::HashMap;
use std::sync::{Arc, LazyLock, Mutex, MutexGuard, PoisonError};

use anyhow::{Result, anyhow};
use bluest::error::ErrorKind;
use bluest::{Adapter, AdapterEvent, AdvertisingDevice, Characteristic, Device};
use futures_util::StreamExt;
use log::{debug, error, info, warn};
use regex::Regex;
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::core::bluetooth::constants::DEFAULT_MTU;
use crate::core::bluetooth::transport::{
    ConnectionEventCallback, DiscoveryCallback, MtuCallback, NativeTransport, RadioStatusCallback,
    StatusCallback, ValueCallback, ValueChangedCallback,
};
use crate::core::bluetooth::types::{
    CharacteristicProperties, CharacteristicRef, ConnectionEvent, ConnectionEventReason,
    DiscoveryRecord, NativeHandle, PeripheralId, RadioStatus, RequestStatus,
};

static ADDRESS_PATTERN: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"([0-9A-Fa-f]{2}[:-]){5}([0-9A-Fa-f]{2})").ok());

/// Discovered GATT layout of a connected peripheral
#[derive(Default)]
struct GattCache {
    services: Vec<(Uuid, Vec<(Characteristic, CharacteristicProperties)>)>,
}

impl GattCache {
    fn find(&self, characteristic: &CharacteristicRef) -> Option<&(Characteristic, CharacteristicProperties)> {
        let (_, characteristics) = self
            .services
            .iter()
            .find(|(uuid, _)| *uuid == characteristic.service)?;
        characteristics
            .iter()
            .filter(|(c, _)| c.uuid() == characteristic.characteristic)
            .nth(characteristic.instance as usize)
    }
}

struct PeripheralEntry {
    device: Device,
    on_event: Arc<ConnectionEventCallback>,
    gatt: GattCache,
    subscriptions: HashMap<CharacteristicRef, CancellationToken>,
    /// Stops the tasks bound to the current connection
    connection: CancellationToken,
}

#[derive(Default)]
struct Inner {
    discovered: HashMap<PeripheralId, Device>,
    peripherals: HashMap<NativeHandle, PeripheralEntry>,
    next_handle: u64,
    scan: Option<CancellationToken>,
    radio: Option<CancellationToken>,
}

/// [`NativeTransport`] backed by the platform stack through `bluest`
pub struct BluestTransport {
    runtime: Handle,
    adapter: Adapter,
    inner: Arc<Mutex<Inner>>,
}

fn lock(inner: &Mutex<Inner>) -> MutexGuard<'_, Inner> {
    inner.lock().unwrap_or_else(PoisonError::into_inner)
}

fn status_of(error: &bluest::Error) -> RequestStatus {
    match error.kind() {
        ErrorKind::Timeout => RequestStatus::Timeout,
        ErrorKind::NotAuthorized => RequestStatus::AccessDenied,
        ErrorKind::NotSupported => RequestStatus::NotSupported,
        ErrorKind::NotConnected => RequestStatus::Disconnected,
        _ => RequestStatus::Error,
    }
}

fn properties_of(properties: bluest::CharacteristicProperties) -> CharacteristicProperties {
    let mut bits = CharacteristicProperties::NONE;
    let flags = [
        (properties.broadcast, CharacteristicProperties::BROADCAST),
        (properties.read, CharacteristicProperties::READ),
        (properties.write_without_response, CharacteristicProperties::WRITE_WITHOUT_RESPONSE),
        (properties.write, CharacteristicProperties::WRITE),
        (properties.notify, CharacteristicProperties::NOTIFY),
        (properties.indicate, CharacteristicProperties::INDICATE),
        (properties.authenticated_signed_writes, CharacteristicProperties::SIGNED_WRITE),
        (properties.extended_properties, CharacteristicProperties::EXTENDED_PROPERTIES),
    ];
    for (set, flag) in flags {
        if set {
            bits |= flag;
        }
    }
    bits
}

/// Extracts the MAC address embedded in a platform device identifier
fn extract_address(device_id: &str) -> Option<u64> {
    let pattern = ADDRESS_PATTERN.as_ref()?;
    let found = pattern.find_iter(device_id).last()?;
    let hex: String = found.as_str().chars().filter(char::is_ascii_hexdigit).collect();
    u64::from_str_radix(&hex, 16).ok()
}

fn discovery_record(discovered: &AdvertisingDevice) -> DiscoveryRecord {
    let device = &discovered.device;
    let adv = &discovered.adv_data;
    let id = device.id().to_string();
    let name = adv
        .local_name
        .clone()
        .or_else(|| device.name().ok())
        .unwrap_or_default();

    let mut record = DiscoveryRecord::new(
        id.as_str(),
        name,
        extract_address(&id).unwrap_or(0),
        discovered.rssi.map(i32::from).unwrap_or(0),
    );
    record.is_connectable = adv.is_connectable;
    record.tx_power_level = adv.tx_power_level.map(i32::from).unwrap_or(0);
    if let Some(manufacturer) = &adv.manufacturer_data {
        record.manufacturer_data = manufacturer.company_id.to_le_bytes().to_vec();
        record.manufacturer_data.extend_from_slice(&manufacturer.data);
    }
    record.services_data = adv.service_data.clone();
    record.services = adv.services.clone();
    record
}

async fn discover_gatt(device: &Device) -> Result<GattCache, bluest::Error> {
    let mut cache = GattCache::default();
    for service in device.discover_services().await? {
        let mut characteristics = Vec::new();
        for characteristic in service.discover_characteristics().await? {
            let properties = match characteristic.properties().await {
                Ok(properties) => properties_of(properties),
                Err(e) => {
                    warn!("Failed to read properties of {}: {}", characteristic.uuid(), e);
                    CharacteristicProperties::NONE
                }
            };
            characteristics.push((characteristic, properties));
        }
        cache.services.push((service.uuid(), characteristics));
    }
    Ok(cache)
}

/// Reports `Disconnected` once the platform drops the link
async fn watch_link(
    adapter: Adapter,
    inner: Arc<Mutex<Inner>>,
    handle: NativeHandle,
    device: Device,
    token: CancellationToken,
) {
    let mut events = match adapter.device_connection_events(&device).await {
        Ok(events) => events,
        Err(e) => {
            warn!("Cannot follow connection of {}: {}", device.id(), e);
            return;
        }
    };
    loop {
        tokio::select! {
            event = events.next() => match event {
                Some(bluest::ConnectionEvent::Disconnected) | None => break,
                Some(bluest::ConnectionEvent::Connected) => {}
            },
            _ = token.cancelled() => return,
        }
    }

    let on_event = {
        let mut inner = lock(&inner);
        let Some(entry) = inner.peripherals.get_mut(&handle) else {
            return;
        };
        for (_, subscription) in entry.subscriptions.drain() {
            subscription.cancel();
        }
        entry.on_event.clone()
    };
    info!("Device {} lost its connection", device.id());
    on_event(ConnectionEvent::Disconnected, ConnectionEventReason::LinkLoss);
}

impl BluestTransport {
    /// Opens the default adapter, must be called from within a tokio runtime
    pub async fn new() -> Result<Self> {
        let adapter = Adapter::default()
            .await
            .ok_or_else(|| anyhow!("Bluetooth adapter not found"))?;
        adapter.wait_available().await?;
        info!("Bluetooth adapter available");

        Ok(Self {
            runtime: Handle::current(),
            adapter,
            inner: Arc::new(Mutex::new(Inner::default())),
        })
    }

    fn device_of(&self, handle: NativeHandle) -> Option<Device> {
        lock(&self.inner)
            .peripherals
            .get(&handle)
            .map(|entry| entry.device.clone())
    }

    fn characteristic_of(&self, handle: NativeHandle, characteristic: &CharacteristicRef) -> Result<Characteristic, RequestStatus> {
        let inner = lock(&self.inner);
        let entry = inner.peripherals.get(&handle).ok_or(RequestStatus::Disconnected)?;
        entry
            .gatt
            .find(characteristic)
            .map(|(c, _)| c.clone())
            .ok_or(RequestStatus::NotSupported)
    }
}

impl NativeTransport for BluestTransport {
    fn initialize(&self, on_radio_status: RadioStatusCallback) -> bool {
        let token = CancellationToken::new();
        if let Some(previous) = lock(&self.inner).radio.replace(token.clone()) {
            previous.cancel();
        }

        let adapter = self.adapter.clone();
        self.runtime.spawn(async move {
            let available = adapter.is_available().await.unwrap_or(false);
            on_radio_status(if available { RadioStatus::Enabled } else { RadioStatus::Disabled });

            let mut events = match adapter.events().await {
                Ok(events) => events,
                Err(e) => {
                    error!("Failed to follow adapter events: {}", e);
                    return;
                }
            };
            loop {
                tokio::select! {
                    event = events.next() => match event {
                        Some(Ok(AdapterEvent::Available)) => on_radio_status(RadioStatus::Enabled),
                        Some(Ok(AdapterEvent::Unavailable)) => on_radio_status(RadioStatus::Disabled),
                        Some(Err(e)) => error!("Adapter event error: {}", e),
                        None => break,
                    },
                    _ = token.cancelled() => break,
                }
            }
        });
        true
    }

    fn shutdown(&self) {
        let mut inner = lock(&self.inner);
        for token in inner.scan.take().into_iter().chain(inner.radio.take()) {
            token.cancel();
        }
        for (_, entry) in inner.peripherals.drain() {
            let PeripheralEntry {
                device,
                subscriptions,
                connection,
                ..
            } = entry;
            connection.cancel();
            for (_, subscription) in subscriptions {
                subscription.cancel();
            }
            let adapter = self.adapter.clone();
            self.runtime.spawn(async move {
                if let Err(e) = adapter.disconnect_device(&device).await {
                    debug!("Disconnect on shutdown failed: {}", e);
                }
            });
        }
        inner.discovered.clear();
    }

    fn start_scan(&self, service_filter: &[Uuid], on_discovered: DiscoveryCallback) -> bool {
        let token = CancellationToken::new();
        if let Some(previous) = lock(&self.inner).scan.replace(token.clone()) {
            previous.cancel();
        }

        let adapter = self.adapter.clone();
        let inner = self.inner.clone();
        let filter = service_filter.to_vec();
        self.runtime.spawn(async move {
            let mut scan_stream = match adapter.scan(&filter).await {
                Ok(stream) => stream,
                Err(e) => {
                    error!("Failed to start bluetooth scan: {}", e);
                    return;
                }
            };

            loop {
                tokio::select! {
                    result = scan_stream.next() => match result {
                        Some(discovered) => {
                            let record = discovery_record(&discovered);
                            lock(&inner)
                                .discovered
                                .insert(record.id.clone(), discovered.device);
                            on_discovered(record);
                        }
                        None => {
                            info!("Bluetooth scan stream has ended.");
                            break;
                        }
                    },
                    _ = token.cancelled() => break,
                }
            }
        });
        true
    }

    fn stop_scan(&self) {
        if let Some(token) = lock(&self.inner).scan.take() {
            token.cancel();
        }
    }

    fn create_peripheral(&self, discovery: &DiscoveryRecord, on_event: ConnectionEventCallback) -> Option<NativeHandle> {
        let mut inner = lock(&self.inner);
        let device = inner.discovered.get(&discovery.id)?.clone();
        inner.next_handle += 1;
        let handle = NativeHandle(inner.next_handle);
        inner.peripherals.insert(
            handle,
            PeripheralEntry {
                device,
                on_event: Arc::new(on_event),
                gatt: GattCache::default(),
                subscriptions: HashMap::new(),
                connection: CancellationToken::new(),
            },
        );
        Some(handle)
    }

    fn connect(&self, handle: NativeHandle, required_services: &[Uuid], auto_connect: bool, on_result: StatusCallback) {
        let Some((device, on_event, token)) = lock(&self.inner).peripherals.get(&handle).map(|entry| {
            (entry.device.clone(), entry.on_event.clone(), entry.connection.clone())
        }) else {
            on_result(RequestStatus::Disconnected);
            return;
        };
        if auto_connect {
            debug!("Auto connect is not available with bluest, connecting directly");
        }

        let adapter = self.adapter.clone();
        let inner = self.inner.clone();
        let required_services = required_services.to_vec();
        self.runtime.spawn(async move {
            on_event(ConnectionEvent::Connecting, ConnectionEventReason::Success);
            if !device.is_connected().await {
                info!("Initiating connection to {}...", device.id());
                if let Err(e) = adapter.connect_device(&device).await {
                    warn!("Connection to {} failed: {}", device.id(), e);
                    on_result(status_of(&e));
                    return;
                }
            }

            info!("Connection successful, discovering services...");
            let gatt = match discover_gatt(&device).await {
                Ok(gatt) => gatt,
                Err(e) => {
                    error!("Service discovery failed: {}", e);
                    on_result(status_of(&e));
                    on_event(ConnectionEvent::FailedToConnect, ConnectionEventReason::Unknown);
                    return;
                }
            };
            for service in &required_services {
                if !gatt.services.iter().any(|(uuid, _)| uuid == service) {
                    warn!("Required service {} not found on {}", service, device.id());
                }
            }

            match lock(&inner).peripherals.get_mut(&handle) {
                Some(entry) => entry.gatt = gatt,
                None => {
                    on_result(RequestStatus::Canceled);
                    return;
                }
            }
            on_result(RequestStatus::Success);
            on_event(ConnectionEvent::Ready, ConnectionEventReason::Success);
            watch_link(adapter, inner, handle, device, token).await;
        });
    }

    fn disconnect(&self, handle: NativeHandle, on_result: StatusCallback) {
        let Some(entry) = lock(&self.inner).peripherals.remove(&handle) else {
            on_result(RequestStatus::Disconnected);
            return;
        };
        let PeripheralEntry {
            device,
            on_event,
            subscriptions,
            connection,
            ..
        } = entry;
        connection.cancel();
        for (_, subscription) in subscriptions {
            subscription.cancel();
        }

        let adapter = self.adapter.clone();
        self.runtime.spawn(async move {
            on_event(ConnectionEvent::Disconnecting, ConnectionEventReason::Success);
            match adapter.disconnect_device(&device).await {
                Ok(()) => {
                    info!("Successfully disconnected");
                    on_result(RequestStatus::Success);
                }
                Err(e) => {
                    error!("Failed to disconnect {}: {}", device.id(), e);
                    on_result(status_of(&e));
                }
            }
            on_event(ConnectionEvent::Disconnected, ConnectionEventReason::Success);
        });
    }

    fn request_mtu(&self, _handle: NativeHandle, mtu: u16, on_result: MtuCallback) {
        debug!("MTU request of {} bytes not available with bluest", mtu);
        on_result(DEFAULT_MTU, RequestStatus::NotSupported);
    }

    fn read_rssi(&self, handle: NativeHandle, on_result: ValueCallback<i32>) {
        let Some(device) = self.device_of(handle) else {
            on_result(Err(RequestStatus::Disconnected));
            return;
        };
        self.runtime.spawn(async move {
            on_result(device.rssi().await.map(i32::from).map_err(|e| status_of(&e)));
        });
    }

    fn read_characteristic(&self, handle: NativeHandle, characteristic: &CharacteristicRef, on_result: ValueCallback<Vec<u8>>) {
        let characteristic = match self.characteristic_of(handle, characteristic) {
            Ok(characteristic) => characteristic,
            Err(status) => return on_result(Err(status)),
        };
        self.runtime.spawn(async move {
            on_result(characteristic.read().await.map_err(|e| status_of(&e)));
        });
    }

    fn write_characteristic(
        &self,
        handle: NativeHandle,
        characteristic: &CharacteristicRef,
        data: &[u8],
        without_response: bool,
        on_result: StatusCallback,
    ) {
        let characteristic = match self.characteristic_of(handle, characteristic) {
            Ok(characteristic) => characteristic,
            Err(status) => return on_result(status),
        };
        let data = data.to_vec();
        self.runtime.spawn(async move {
            let result = if without_response {
                characteristic.write_without_response(&data).await
            } else {
                characteristic.write(&data).await
            };
            on_result(match result {
                Ok(()) => RequestStatus::Success,
                Err(e) => status_of(&e),
            });
        });
    }

    fn subscribe_characteristic(
        &self,
        handle: NativeHandle,
        characteristic: &CharacteristicRef,
        on_value_changed: ValueChangedCallback,
        on_result: StatusCallback,
    ) {
        let target = *characteristic;
        let characteristic = match self.characteristic_of(handle, characteristic) {
            Ok(characteristic) => characteristic,
            Err(status) => return on_result(status),
        };
        let token = CancellationToken::new();
        {
            let mut inner = lock(&self.inner);
            let Some(entry) = inner.peripherals.get_mut(&handle) else {
                return on_result(RequestStatus::Disconnected);
            };
            if let Some(previous) = entry.subscriptions.insert(target, token.clone()) {
                previous.cancel();
            }
        }

        self.runtime.spawn(async move {
            info!("Subscribing to notifications of {}...", characteristic.uuid());
            let mut notifications = match characteristic.notify().await {
                Ok(stream) => stream,
                Err(e) => {
                    error!("Failed to subscribe to notifications: {}", e);
                    on_result(status_of(&e));
                    return;
                }
            };
            on_result(RequestStatus::Success);

            loop {
                tokio::select! {
                    value = notifications.next() => match value {
                        Some(Ok(value)) => on_value_changed(value),
                        Some(Err(e)) => {
                            error!("Error in notification stream: {}", e);
                            break;
                        }
                        None => break,
                    },
                    _ = token.cancelled() => break,
                }
            }
            info!("Notification stream ended");
        });
    }

    fn unsubscribe_characteristic(&self, handle: NativeHandle, characteristic: &CharacteristicRef, on_result: StatusCallback) {
        let token = lock(&self.inner)
            .peripherals
            .get_mut(&handle)
            .and_then(|entry| entry.subscriptions.remove(characteristic));
        match token {
            Some(token) => {
                token.cancel();
                on_result(RequestStatus::Success);
            }
            None => on_result(RequestStatus::Error),
        }
    }

    fn peripheral_name(&self, handle: NativeHandle) -> Option<String> {
        self.device_of(handle)?.name().ok()
    }

    fn peripheral_mtu(&self, _handle: NativeHandle) -> u16 {
        DEFAULT_MTU
    }

    fn discovered_services(&self, handle: NativeHandle) -> Vec<Uuid> {
        lock(&self.inner)
            .peripherals
            .get(&handle)
            .map(|entry| entry.gatt.services.iter().map(|(uuid, _)| *uuid).collect())
            .unwrap_or_default()
    }

    fn service_characteristics(&self, handle: NativeHandle, service: Uuid) -> Vec<Uuid> {
        lock(&self.inner)
            .peripherals
            .get(&handle)
            .and_then(|entry| entry.gatt.services.iter().find(|(uuid, _)| *uuid == service))
            .map(|(_, characteristics)| characteristics.iter().map(|(c, _)| c.uuid()).collect())
            .unwrap_or_default()
    }

    fn characteristic_properties(&self, handle: NativeHandle, characteristic: &CharacteristicRef) -> CharacteristicProperties {
        lock(&self.inner)
            .peripherals
            .get(&handle)
            .and_then(|entry| entry.gatt.find(characteristic))
            .map(|(_, properties)| *properties)
            .unwrap_or(CharacteristicProperties::NONE)
    }
}
