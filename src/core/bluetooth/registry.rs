//! Peripheral registry
//! Single source of truth for everything the central knows about a
//! peripheral. Records are only ever removed all at once, on shutdown.

use std::collections::HashMap;

use uuid::Uuid;

use crate::core::bluetooth::connection::ConnectAttempt;
use crate::core::bluetooth::error::Error;
use crate::core::bluetooth::types::{DiscoveryRecord, NativeHandle, PeripheralId};

/// Caller callback notified with `true` once a peripheral is ready and with
/// `false` once it is disconnected
pub type ConnectionHandler = Box<dyn FnMut(&DiscoveryRecord, bool)>;

/// Lifecycle of a peripheral connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PeripheralState {
    #[default]
    Disconnected,
    Connecting,
    Ready,
    Disconnecting,
}

/// Mutable state of a known peripheral
pub struct PeripheralRecord {
    pub(crate) discovery: DiscoveryRecord,
    /// `None` until a connect request creates one, cleared again on disconnect request
    pub(crate) handle: Option<NativeHandle>,
    /// Service filter of the scan that discovered the peripheral
    pub(crate) required_services: Vec<Uuid>,
    pub(crate) connection_handler: Option<ConnectionHandler>,
    pub(crate) state: PeripheralState,
    pub(crate) connect_attempt: Option<ConnectAttempt>,
    /// Set once the MTU was requested for the current connection
    pub(crate) mtu_requested: bool,
}

impl PeripheralRecord {
    fn new(discovery: DiscoveryRecord, required_services: Vec<Uuid>) -> Self {
        Self {
            discovery,
            handle: None,
            required_services,
            connection_handler: None,
            state: PeripheralState::Disconnected,
            connect_attempt: None,
            mtu_requested: false,
        }
    }

    pub fn discovery(&self) -> &DiscoveryRecord {
        &self.discovery
    }

    pub fn state(&self) -> PeripheralState {
        self.state
    }

    pub fn handle(&self) -> Option<NativeHandle> {
        self.handle
    }

    pub fn required_services(&self) -> &[Uuid] {
        &self.required_services
    }

    /// Name used to prefix log lines about this peripheral
    pub(crate) fn name(&self) -> &str {
        &self.discovery.name
    }

    /// Invokes the caller's connection handler, if any
    pub(crate) fn notify_connection(&mut self, ready: bool) {
        if let Some(handler) = self.connection_handler.as_mut() {
            handler(&self.discovery, ready);
        }
    }
}

/// Maps peripheral identifiers to their records
#[derive(Default)]
pub struct Registry {
    peripherals: HashMap<PeripheralId, PeripheralRecord>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: &PeripheralId) -> Result<&PeripheralRecord, Error> {
        self.peripherals
            .get(id)
            .ok_or_else(|| Error::UnknownPeripheral(id.clone()))
    }

    pub fn get_mut(&mut self, id: &PeripheralId) -> Result<&mut PeripheralRecord, Error> {
        self.peripherals
            .get_mut(id)
            .ok_or_else(|| Error::UnknownPeripheral(id.clone()))
    }

    pub fn contains(&self, id: &PeripheralId) -> bool {
        self.peripherals.contains_key(id)
    }

    /// Registers a discovered peripheral.
    ///
    /// A new peripheral starts `Disconnected`; for a known one only the
    /// discovery record is replaced, handle and state are preserved.
    pub fn upsert_from_discovery(
        &mut self,
        discovery: DiscoveryRecord,
        required_services: &[Uuid],
    ) -> &PeripheralRecord {
        use std::collections::hash_map::Entry;

        match self.peripherals.entry(discovery.id.clone()) {
            Entry::Occupied(entry) => {
                let record = entry.into_mut();
                record.discovery = discovery;
                record
            }
            Entry::Vacant(entry) => {
                entry.insert(PeripheralRecord::new(discovery, required_services.to_vec()))
            }
        }
    }

    pub fn clear(&mut self) {
        self.peripherals.clear();
    }

    pub fn len(&self) -> usize {
        self.peripherals.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peripherals.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &PeripheralRecord> {
        self.peripherals.values()
    }

    pub(crate) fn iter_mut(&mut self) -> impl Iterator<Item = &mut PeripheralRecord> {
        self.peripherals.values_mut()
    }
}
