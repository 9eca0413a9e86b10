//! Bluetooth central
//! This module provides the main interface for bluetooth operations

use std::marker::PhantomData;
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{debug, error, info};
use uuid::Uuid;

use crate::config::CentralConfig;
use crate::core::bluetooth::connection::ConnectRetryPolicy;
use crate::core::bluetooth::error::Error;
use crate::core::bluetooth::notification::Subscriptions;
use crate::core::bluetooth::queue::{ExecutionQueue, PeripheralLookup, QueueHandle};
use crate::core::bluetooth::registry::{PeripheralRecord, PeripheralState, Registry};
use crate::core::bluetooth::request::{Completion, Deadline, Request};
use crate::core::bluetooth::transport::NativeTransport;
use crate::core::bluetooth::types::{
    CharacteristicProperties, CharacteristicRef, DiscoveryRecord, NativeHandle, PeripheralId,
    RadioStatus, RequestOperation, RequestStatus,
};

/// Sending side of a central's execution queue, usable from any thread
pub type CentralHandle = QueueHandle<Central>;

pub(crate) type DiscoveryListener = Box<dyn FnMut(&DiscoveryRecord)>;

/// Discovers, connects to and talks with BLE peripherals.
///
/// A `Central` lives on the thread that created it and every callback it
/// fires runs there, during [`Central::drain`]. It is neither `Send` nor
/// `Sync`; other threads reach it through a [`CentralHandle`]:
///
/// ```compile_fail
/// use pixels_central_lib::core::bluetooth::Central;
///
/// fn assert_send<T: Send>() {}
/// assert_send::<Central>();
/// ```
pub struct Central {
    pub(crate) registry: Registry,
    pub(crate) transport: Arc<dyn NativeTransport>,
    pub(crate) queue: ExecutionQueue<Central>,
    pub(crate) config: CentralConfig,
    pub(crate) retry_policy: ConnectRetryPolicy,
    pub(crate) subscriptions: Subscriptions,
    pub(crate) discovery_listeners: Vec<DiscoveryListener>,
    /// Requests whose timeout is checked on every drain
    deadlines: Vec<Arc<dyn Deadline>>,
    pub(crate) is_ready: bool,
    pub(crate) is_scanning: bool,
    /// Pins the central to its designated thread
    _designated_thread: PhantomData<*const ()>,
}

impl PeripheralLookup for Central {
    fn is_peripheral_known(&self, id: &PeripheralId) -> bool {
        self.registry.contains(id)
    }
}

impl Central {
    /// Creates a central on the current thread
    pub fn new(transport: Arc<dyn NativeTransport>, config: CentralConfig) -> Result<Self, Error> {
        config.validate()?;
        Ok(Self {
            registry: Registry::new(),
            transport,
            queue: ExecutionQueue::new(),
            retry_policy: ConnectRetryPolicy::from(&config),
            config,
            subscriptions: Subscriptions::default(),
            discovery_listeners: Vec::new(),
            deadlines: Vec::new(),
            is_ready: false,
            is_scanning: false,
            _designated_thread: PhantomData,
        })
    }

    /// Handle for posting work onto this central from other threads
    pub fn handle(&self) -> CentralHandle {
        self.queue.handle()
    }

    pub fn config(&self) -> &CentralConfig {
        &self.config
    }

    /// Runs everything queued since the last call, then expires overdue requests.
    ///
    /// The host calls this periodically (e.g. once per frame) from the
    /// central's thread. Returns the number of actions executed.
    pub fn drain(&mut self) -> usize {
        let mut count = 0;
        while let Some(action) = self.queue.try_next() {
            action(self);
            count += 1;
        }

        let now = Instant::now();
        self.deadlines.retain(|deadline| !deadline.sweep(now));
        count
    }

    pub(crate) fn track<V: Send + 'static>(&mut self, request: &Request<V>) {
        if let Some(deadline) = request.deadline() {
            self.deadlines.push(deadline);
        }
    }

    /// Starts the native transport and follows the radio status
    pub fn initialize(&mut self) -> Result<(), Error> {
        info!("[BLE] Initializing");

        let queue = self.queue.handle();
        let success = self.transport.initialize(Box::new(move |status| {
            queue.post(move |central: &mut Central| central.on_radio_status(status));
        }));

        if success {
            Ok(())
        } else {
            error!("[BLE] Failed to initialize");
            Err(Error::InitializeFailed)
        }
    }

    fn on_radio_status(&mut self, status: RadioStatus) {
        info!("[BLE] Bluetooth radio status: {:?}", status);
        self.is_ready = status == RadioStatus::Enabled;
        self.is_scanning = self.is_scanning && self.is_ready;
    }

    /// Forgets every peripheral and shuts the native transport down.
    ///
    /// Work still queued for a forgotten peripheral is dropped when dequeued.
    pub fn shutdown(&mut self) {
        info!("[BLE] Shutting down");

        self.abort_connect_attempts();
        self.registry.clear();
        self.subscriptions.clear();
        self.is_scanning = false;
        self.is_ready = false;
        self.transport.shutdown();
    }

    /// True while the Bluetooth radio is enabled
    pub fn is_ready(&self) -> bool {
        self.is_ready
    }

    pub fn is_scanning(&self) -> bool {
        self.is_scanning
    }

    pub fn peripheral(&self, id: &PeripheralId) -> Result<&PeripheralRecord, Error> {
        self.registry.get(id)
    }

    pub fn peripheral_state(&self, id: &PeripheralId) -> Result<PeripheralState, Error> {
        Ok(self.registry.get(id)?.state)
    }

    /// Every peripheral discovered since initialization
    pub fn scanned_peripherals(&self) -> Vec<DiscoveryRecord> {
        self.registry
            .iter()
            .map(|record| record.discovery.clone())
            .collect()
    }

    /// Peripherals currently in the `Ready` state
    pub fn connected_peripherals(&self) -> Vec<DiscoveryRecord> {
        self.registry
            .iter()
            .filter(|record| record.state == PeripheralState::Ready)
            .map(|record| record.discovery.clone())
            .collect()
    }

    /// Default timeout of RSSI and characteristic requests
    pub fn default_timeout(&self) -> Duration {
        Duration::from_secs(self.config.request_timeout_secs)
    }

    /// Connects to a discovered peripheral.
    ///
    /// `on_connection_event` is called with `true` once the peripheral is
    /// ready and with `false` when it gets disconnected. Transient failures
    /// are retried silently until the request times out; a zero `timeout`
    /// never expires.
    pub fn connect(
        &mut self,
        id: &PeripheralId,
        timeout: Duration,
        on_connection_event: impl FnMut(&DiscoveryRecord, bool) + 'static,
    ) -> Result<Request<()>, Error> {
        self.begin_connect(id, Box::new(on_connection_event), timeout)
    }

    /// Disconnects a peripheral, its handle becomes invalid immediately
    pub fn disconnect(&mut self, id: &PeripheralId) -> Result<Request<()>, Error> {
        self.begin_disconnect(id, Duration::ZERO)
    }

    /// Handle of a peripheral that finished connecting
    fn ready_handle(&self, id: &PeripheralId) -> Result<Option<NativeHandle>, Error> {
        let record = self.registry.get(id)?;
        Ok(match record.state {
            PeripheralState::Ready => record.handle,
            _ => None,
        })
    }

    pub fn peripheral_name(&self, id: &PeripheralId) -> Result<Option<String>, Error> {
        Ok(self
            .ready_handle(id)?
            .and_then(|handle| self.transport.peripheral_name(handle)))
    }

    /// Negotiated MTU, `None` until the peripheral is ready
    pub fn peripheral_mtu(&self, id: &PeripheralId) -> Result<Option<u16>, Error> {
        Ok(self
            .ready_handle(id)?
            .map(|handle| self.transport.peripheral_mtu(handle)))
    }

    pub fn discovered_services(&self, id: &PeripheralId) -> Result<Option<Vec<Uuid>>, Error> {
        Ok(self
            .ready_handle(id)?
            .map(|handle| self.transport.discovered_services(handle)))
    }

    pub fn service_characteristics(
        &self,
        id: &PeripheralId,
        service: Uuid,
    ) -> Result<Option<Vec<Uuid>>, Error> {
        Ok(self
            .ready_handle(id)?
            .map(|handle| self.transport.service_characteristics(handle, service)))
    }

    pub fn characteristic_properties(
        &self,
        id: &PeripheralId,
        characteristic: &CharacteristicRef,
    ) -> Result<CharacteristicProperties, Error> {
        Ok(self
            .ready_handle(id)?
            .map(|handle| self.transport.characteristic_properties(handle, characteristic))
            .unwrap_or(CharacteristicProperties::NONE))
    }

    /// Wraps a native request against the current handle of `id`
    fn start_request<V: Send + 'static>(
        &mut self,
        id: &PeripheralId,
        operation: RequestOperation,
        timeout: Duration,
        start: impl FnOnce(&dyn NativeTransport, NativeHandle, Completion<V>, &QueueHandle<Central>),
    ) -> Result<Request<V>, Error> {
        let record = self.registry.get(id)?;
        let Some(handle) = record.handle else {
            debug!("[BLE:{}] {} rejected, no native handle", record.name(), operation);
            return Ok(Request::failed(operation, RequestStatus::InvalidHandle));
        };

        let (request, completion) = Request::new(operation, timeout);
        let queue = self.queue.handle();
        start(self.transport.as_ref(), handle, completion, &queue);

        self.track(&request);
        Ok(request)
    }

    pub fn read_rssi(&mut self, id: &PeripheralId, timeout: Duration) -> Result<Request<i32>, Error> {
        self.start_request(
            id,
            RequestOperation::ReadPeripheralRssi,
            timeout,
            |transport, handle, completion, queue| {
                transport.read_rssi(handle, completion.value_callback(queue));
            },
        )
    }

    pub fn read_characteristic(
        &mut self,
        id: &PeripheralId,
        characteristic: CharacteristicRef,
        timeout: Duration,
    ) -> Result<Request<Vec<u8>>, Error> {
        self.start_request(
            id,
            RequestOperation::ReadCharacteristic,
            timeout,
            |transport, handle, completion, queue| {
                transport.read_characteristic(handle, &characteristic, completion.value_callback(queue));
            },
        )
    }

    pub fn write_characteristic(
        &mut self,
        id: &PeripheralId,
        characteristic: CharacteristicRef,
        data: &[u8],
        without_response: bool,
        timeout: Duration,
    ) -> Result<Request<()>, Error> {
        self.start_request(
            id,
            RequestOperation::WriteCharacteristic,
            timeout,
            |transport, handle, completion, queue| {
                transport.write_characteristic(
                    handle,
                    &characteristic,
                    data,
                    without_response,
                    completion.status_callback(queue),
                );
            },
        )
    }
}
