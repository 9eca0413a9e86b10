#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use pixels_central_lib::CentralConfig;
use pixels_central_lib::core::bluetooth::{
    Central, CharacteristicProperties, CharacteristicRef, ConnectionEvent, ConnectionEventCallback,
    ConnectionEventReason, DiscoveryCallback, DiscoveryRecord, MtuCallback, NativeHandle,
    NativeTransport, PeripheralId, RadioStatus, RadioStatusCallback, RequestStatus, StatusCallback,
    ValueCallback,
    ValueChangedCallback,
};
use uuid::Uuid;

pub const DIE_ID: &str = "die-42";
pub const DIE_NAME: &str = "Die-42";
pub const DIE_ADDRESS: u64 = 0xAABBCC;

pub fn pixels_service() -> Uuid {
    Uuid::from_u128(0x6e400001_b5a3_f393_e0a9_e50e24dcca9e)
}

pub fn notify_characteristic() -> CharacteristicRef {
    CharacteristicRef::new(pixels_service(), Uuid::from_u128(0x6e400001_b5a3_f393_e0a9_e50e24dcca9f))
}

pub fn write_characteristic() -> CharacteristicRef {
    CharacteristicRef::new(pixels_service(), Uuid::from_u128(0x6e400002_b5a3_f393_e0a9_e50e24dcca9e))
}

pub fn die_discovery(rssi: i32) -> DiscoveryRecord {
    DiscoveryRecord::new(DIE_ID, DIE_NAME, DIE_ADDRESS, rssi)
}

#[derive(Default)]
pub struct MockState {
    pub radio: Option<RadioStatusCallback>,
    pub discovery: Option<DiscoveryCallback>,
    pub scan_filter: Vec<Uuid>,
    pub is_shut_down: bool,
    next_handle: u64,
    pub created: Vec<(PeripheralId, NativeHandle)>,
    pub connection_events: HashMap<NativeHandle, ConnectionEventCallback>,
    pub connects: VecDeque<(NativeHandle, Vec<Uuid>, StatusCallback)>,
    pub connect_count: usize,
    pub disconnects: VecDeque<(NativeHandle, StatusCallback)>,
    pub mtu_requests: VecDeque<(NativeHandle, u16, MtuCallback)>,
    pub mtu_request_count: usize,
    pub rssi_reads: VecDeque<ValueCallback<i32>>,
    pub reads: VecDeque<(CharacteristicRef, ValueCallback<Vec<u8>>)>,
    pub writes: VecDeque<(CharacteristicRef, Vec<u8>, bool, StatusCallback)>,
    pub write_count: usize,
    pub value_callbacks: Vec<(CharacteristicRef, ValueChangedCallback)>,
    pub subscribe_results: VecDeque<StatusCallback>,
    pub unsubscribes: VecDeque<(CharacteristicRef, StatusCallback)>,
    pub mtu: u16,
}

/// In-memory transport whose callbacks are fired by the test
#[derive(Default)]
pub struct MockTransport {
    state: Mutex<MockState>,
}

impl MockTransport {
    pub fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap()
    }

    pub fn set_radio(&self, status: RadioStatus) {
        let state = self.state();
        let callback = state.radio.as_ref().expect("transport not initialized");
        callback(status);
    }

    pub fn discover(&self, record: DiscoveryRecord) {
        let state = self.state();
        let callback = state.discovery.as_ref().expect("scan not started");
        callback(record);
    }

    pub fn handle_count(&self) -> usize {
        self.state().created.len()
    }

    pub fn last_handle(&self) -> NativeHandle {
        self.state().created.last().expect("no peripheral created").1
    }

    pub fn complete_connect(&self, status: RequestStatus) {
        let (_, _, callback) = self.state().connects.pop_front().expect("no pending connect");
        callback(status);
    }

    pub fn emit(&self, handle: NativeHandle, event: ConnectionEvent, reason: ConnectionEventReason) {
        let state = self.state();
        let callback = state.connection_events.get(&handle).expect("unknown handle");
        callback(event, reason);
    }

    pub fn complete_mtu(&self, mtu: u16, status: RequestStatus) {
        let (_, _, callback) = self.state().mtu_requests.pop_front().expect("no pending MTU request");
        self.state().mtu = mtu;
        callback(mtu, status);
    }

    pub fn complete_disconnect(&self, status: RequestStatus) {
        let (_, callback) = self.state().disconnects.pop_front().expect("no pending disconnect");
        callback(status);
    }

    pub fn complete_rssi(&self, result: Result<i32, RequestStatus>) {
        let callback = self.state().rssi_reads.pop_front().expect("no pending RSSI read");
        callback(result);
    }

    pub fn complete_read(&self, result: Result<Vec<u8>, RequestStatus>) {
        let (_, callback) = self.state().reads.pop_front().expect("no pending read");
        callback(result);
    }

    pub fn complete_write(&self, status: RequestStatus) {
        let (_, _, _, callback) = self.state().writes.pop_front().expect("no pending write");
        callback(status);
    }

    pub fn complete_subscribe(&self, status: RequestStatus) {
        let callback = self.state().subscribe_results.pop_front().expect("no pending subscribe");
        callback(status);
    }

    pub fn complete_unsubscribe(&self, status: RequestStatus) {
        let (_, callback) = self.state().unsubscribes.pop_front().expect("no pending unsubscribe");
        callback(status);
    }

    /// Fires the value-changed callback of the most recent subscription to `characteristic`
    pub fn notify_value(&self, characteristic: &CharacteristicRef, value: &[u8]) {
        let state = self.state();
        let (_, callback) = state
            .value_callbacks
            .iter()
            .rev()
            .find(|(c, _)| c == characteristic)
            .expect("characteristic not subscribed");
        callback(value.to_vec());
    }
}

impl NativeTransport for MockTransport {
    fn initialize(&self, on_radio_status: RadioStatusCallback) -> bool {
        self.state().radio = Some(on_radio_status);
        true
    }

    fn shutdown(&self) {
        let mut state = self.state();
        state.is_shut_down = true;
        state.discovery = None;
    }

    fn start_scan(&self, service_filter: &[Uuid], on_discovered: DiscoveryCallback) -> bool {
        let mut state = self.state();
        state.scan_filter = service_filter.to_vec();
        state.discovery = Some(on_discovered);
        true
    }

    fn stop_scan(&self) {
        self.state().discovery = None;
    }

    fn create_peripheral(&self, discovery: &DiscoveryRecord, on_event: ConnectionEventCallback) -> Option<NativeHandle> {
        let mut state = self.state();
        state.next_handle += 1;
        let handle = NativeHandle(state.next_handle);
        state.created.push((discovery.id.clone(), handle));
        state.connection_events.insert(handle, on_event);
        Some(handle)
    }

    fn connect(&self, handle: NativeHandle, required_services: &[Uuid], _auto_connect: bool, on_result: StatusCallback) {
        let mut state = self.state();
        state.connect_count += 1;
        state.connects.push_back((handle, required_services.to_vec(), on_result));
    }

    fn disconnect(&self, handle: NativeHandle, on_result: StatusCallback) {
        self.state().disconnects.push_back((handle, on_result));
    }

    fn request_mtu(&self, handle: NativeHandle, mtu: u16, on_result: MtuCallback) {
        let mut state = self.state();
        state.mtu_request_count += 1;
        state.mtu_requests.push_back((handle, mtu, on_result));
    }

    fn read_rssi(&self, _handle: NativeHandle, on_result: ValueCallback<i32>) {
        self.state().rssi_reads.push_back(on_result);
    }

    fn read_characteristic(&self, _handle: NativeHandle, characteristic: &CharacteristicRef, on_result: ValueCallback<Vec<u8>>) {
        self.state().reads.push_back((*characteristic, on_result));
    }

    fn write_characteristic(
        &self,
        _handle: NativeHandle,
        characteristic: &CharacteristicRef,
        data: &[u8],
        without_response: bool,
        on_result: StatusCallback,
    ) {
        let mut state = self.state();
        state.write_count += 1;
        state
            .writes
            .push_back((*characteristic, data.to_vec(), without_response, on_result));
    }

    fn subscribe_characteristic(
        &self,
        _handle: NativeHandle,
        characteristic: &CharacteristicRef,
        on_value_changed: ValueChangedCallback,
        on_result: StatusCallback,
    ) {
        let mut state = self.state();
        state.value_callbacks.push((*characteristic, on_value_changed));
        state.subscribe_results.push_back(on_result);
    }

    fn unsubscribe_characteristic(&self, _handle: NativeHandle, characteristic: &CharacteristicRef, on_result: StatusCallback) {
        self.state().unsubscribes.push_back((*characteristic, on_result));
    }

    fn peripheral_name(&self, _handle: NativeHandle) -> Option<String> {
        Some(DIE_NAME.to_string())
    }

    fn peripheral_mtu(&self, _handle: NativeHandle) -> u16 {
        self.state().mtu
    }

    fn discovered_services(&self, _handle: NativeHandle) -> Vec<Uuid> {
        vec![pixels_service()]
    }

    fn service_characteristics(&self, _handle: NativeHandle, service: Uuid) -> Vec<Uuid> {
        if service == pixels_service() {
            vec![notify_characteristic().characteristic, write_characteristic().characteristic]
        } else {
            Vec::new()
        }
    }

    fn characteristic_properties(&self, _handle: NativeHandle, characteristic: &CharacteristicRef) -> CharacteristicProperties {
        if *characteristic == notify_characteristic() {
            CharacteristicProperties::NOTIFY
        } else if *characteristic == write_characteristic() {
            CharacteristicProperties::WRITE | CharacteristicProperties::WRITE_WITHOUT_RESPONSE
        } else {
            CharacteristicProperties::NONE
        }
    }
}

/// A central with an enabled radio that discovered Die-42 while scanning for the Pixels service
pub fn central_with_die(config: CentralConfig) -> (Arc<MockTransport>, Central) {
    let transport = Arc::new(MockTransport::default());
    let mut central = Central::new(transport.clone(), config).unwrap();
    central.initialize().unwrap();
    transport.set_radio(RadioStatus::Enabled);
    central.drain();

    central.start_scan(&[pixels_service()]).unwrap();
    transport.discover(die_discovery(-60));
    central.drain();
    (transport, central)
}

pub fn die_id() -> PeripheralId {
    PeripheralId::new(DIE_ID)
}

pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
