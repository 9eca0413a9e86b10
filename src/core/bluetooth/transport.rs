//! Interface of the platform Bluetooth stack.
//!
//! Every callback handed to a transport may be invoked on any thread. The
//! central never acts inside a callback: each one only posts its continuation
//! onto the execution queue.

use uuid::Uuid;

use crate::core::bluetooth::types::{
    CharacteristicProperties, CharacteristicRef, ConnectionEvent, ConnectionEventReason,
    DiscoveryRecord, NativeHandle, RadioStatus, RequestStatus,
};

pub type RadioStatusCallback = Box<dyn Fn(RadioStatus) + Send + Sync>;
pub type DiscoveryCallback = Box<dyn Fn(DiscoveryRecord) + Send + Sync>;
pub type ConnectionEventCallback = Box<dyn Fn(ConnectionEvent, ConnectionEventReason) + Send + Sync>;
pub type ValueChangedCallback = Box<dyn Fn(Vec<u8>) + Send + Sync>;

/// One-shot completion of a request without a value
pub type StatusCallback = Box<dyn FnOnce(RequestStatus) + Send>;

/// One-shot completion of a request producing a value, `Err` never carries `Success`
pub type ValueCallback<V> = Box<dyn FnOnce(Result<V, RequestStatus>) + Send>;

/// One-shot completion of an MTU request: the MTU in effect and the status
pub type MtuCallback = Box<dyn FnOnce(u16, RequestStatus) + Send>;

/// Native BLE primitives the central is built on
pub trait NativeTransport: Send + Sync {
    /// Starts the native layer, radio status changes are reported through `on_radio_status`
    fn initialize(&self, on_radio_status: RadioStatusCallback) -> bool;

    fn shutdown(&self);

    /// Starts scanning, an empty filter reports every advertising peripheral
    fn start_scan(&self, service_filter: &[Uuid], on_discovered: DiscoveryCallback) -> bool;

    fn stop_scan(&self);

    /// Creates the native connection resource of a discovered peripheral
    fn create_peripheral(
        &self,
        discovery: &DiscoveryRecord,
        on_connection_event: ConnectionEventCallback,
    ) -> Option<NativeHandle>;

    fn connect(
        &self,
        handle: NativeHandle,
        required_services: &[Uuid],
        auto_connect: bool,
        on_result: StatusCallback,
    );

    /// Disconnects and releases the native resource of `handle`
    fn disconnect(&self, handle: NativeHandle, on_result: StatusCallback);

    fn request_mtu(&self, handle: NativeHandle, mtu: u16, on_result: MtuCallback);

    fn read_rssi(&self, handle: NativeHandle, on_result: ValueCallback<i32>);

    fn read_characteristic(
        &self,
        handle: NativeHandle,
        characteristic: &CharacteristicRef,
        on_result: ValueCallback<Vec<u8>>,
    );

    fn write_characteristic(
        &self,
        handle: NativeHandle,
        characteristic: &CharacteristicRef,
        data: &[u8],
        without_response: bool,
        on_result: StatusCallback,
    );

    fn subscribe_characteristic(
        &self,
        handle: NativeHandle,
        characteristic: &CharacteristicRef,
        on_value_changed: ValueChangedCallback,
        on_result: StatusCallback,
    );

    fn unsubscribe_characteristic(
        &self,
        handle: NativeHandle,
        characteristic: &CharacteristicRef,
        on_result: StatusCallback,
    );

    fn peripheral_name(&self, handle: NativeHandle) -> Option<String>;

    fn peripheral_mtu(&self, handle: NativeHandle) -> u16;

    fn discovered_services(&self, handle: NativeHandle) -> Vec<Uuid>;

    fn service_characteristics(&self, handle: NativeHandle, service: Uuid) -> Vec<Uuid>;

    fn characteristic_properties(
        &self,
        handle: NativeHandle,
        characteristic: &CharacteristicRef,
    ) -> CharacteristicProperties;
}
