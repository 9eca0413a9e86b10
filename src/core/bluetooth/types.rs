//! Defines shared data structures for the Bluetooth module.

use std::collections::HashMap;
use std::fmt;

use serde::Serialize;
use uuid::Uuid;

/// Stable per-session identifier of a peripheral (the platform "system id")
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct PeripheralId(String);

impl PeripheralId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeripheralId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PeripheralId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// Advertisement data of a discovered peripheral.
///
/// A new record is created on every discovery callback; rediscovering the
/// same peripheral replaces the stored record.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DiscoveryRecord {
    /// Stable identifier of the peripheral for this session
    pub id: PeripheralId,
    /// The advertised name, empty if none
    pub name: String,
    /// The transport address (48 bits on most platforms, 0 when hidden)
    pub address: u64,
    /// Whether the peripheral accepts connections
    pub is_connectable: bool,
    /// The signal strength (RSSI) in dBm
    pub rssi: i32,
    /// The transmit power level in dBm
    pub tx_power_level: i32,
    pub manufacturer_data: Vec<u8>,
    /// Advertisement payload per service
    pub services_data: HashMap<Uuid, Vec<u8>>,
    pub services: Vec<Uuid>,
    pub overflow_services: Vec<Uuid>,
    pub solicited_services: Vec<Uuid>,
}

impl DiscoveryRecord {
    /// Creates a record with the mandatory fields, advertisement payloads left empty
    pub fn new(id: impl Into<PeripheralId>, name: impl Into<String>, address: u64, rssi: i32) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            address,
            is_connectable: true,
            rssi,
            tx_power_level: 0,
            manufacturer_data: Vec::new(),
            services_data: HashMap::new(),
            services: Vec::new(),
            overflow_services: Vec::new(),
            solicited_services: Vec::new(),
        }
    }
}

/// Opaque token of a native connection resource.
///
/// Values are handed out by the transport; "no handle" is `None` wherever a
/// handle may be missing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NativeHandle(pub u64);

/// Addresses one characteristic of a connected peripheral
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CharacteristicRef {
    pub service: Uuid,
    pub characteristic: Uuid,
    /// Distinguishes characteristics sharing the same UUID within a service
    pub instance: u32,
}

impl CharacteristicRef {
    pub fn new(service: Uuid, characteristic: Uuid) -> Self {
        Self::with_instance(service, characteristic, 0)
    }

    pub fn with_instance(service: Uuid, characteristic: Uuid, instance: u32) -> Self {
        Self {
            service,
            characteristic,
            instance,
        }
    }
}

/// Standard GATT characteristic properties
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct CharacteristicProperties(u32);

impl CharacteristicProperties {
    pub const NONE: Self = Self(0);
    pub const BROADCAST: Self = Self(0x001);
    pub const READ: Self = Self(0x002);
    pub const WRITE_WITHOUT_RESPONSE: Self = Self(0x004);
    pub const WRITE: Self = Self(0x008);
    pub const NOTIFY: Self = Self(0x010);
    pub const INDICATE: Self = Self(0x020);
    pub const SIGNED_WRITE: Self = Self(0x040);
    pub const EXTENDED_PROPERTIES: Self = Self(0x080);

    pub const fn bits(self) -> u32 {
        self.0
    }

    pub const fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl std::ops::BitOr for CharacteristicProperties {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl std::ops::BitOrAssign for CharacteristicProperties {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

/// Status of the host Bluetooth radio
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RadioStatus {
    Enabled,
    Disabled,
    Unauthorized,
    Unsupported,
}

/// Connection events reported by the native layer for a peripheral
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionEvent {
    Connecting,
    /// Connected and services discovered
    Ready,
    Disconnecting,
    Disconnected,
    FailedToConnect,
}

/// Why a connection event happened
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionEventReason {
    Success,
    Unknown,
    Canceled,
    NotSupported,
    Timeout,
    LinkLoss,
    AdapterOff,
    Peripheral,
}

/// Outcome reported for a native request.
///
/// `InvalidHandle` is never produced by a transport: requests issued against
/// a stale handle fail with it before reaching the native layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum RequestStatus {
    #[error("success")]
    Success,
    #[error("invalid peripheral handle")]
    InvalidHandle,
    #[error("timeout")]
    Timeout,
    #[error("access denied")]
    AccessDenied,
    #[error("not supported")]
    NotSupported,
    #[error("canceled")]
    Canceled,
    #[error("peripheral disconnected")]
    Disconnected,
    #[error("transport error")]
    Error,
}

impl RequestStatus {
    /// Connect failures expected while a peripheral is briefly out of reach
    pub fn is_transient_connect_failure(self) -> bool {
        matches!(self, Self::Timeout | Self::AccessDenied)
    }
}

/// Kinds of requests carried by the generic request abstraction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestOperation {
    ConnectPeripheral,
    DisconnectPeripheral,
    ReadPeripheralRssi,
    ReadCharacteristic,
    WriteCharacteristic,
    SubscribeCharacteristic,
    UnsubscribeCharacteristic,
}

impl fmt::Display for RequestOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}
