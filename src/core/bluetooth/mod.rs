//! Bluetooth Low Energy central
//! This module handles all bluetooth operations including scanning,
//! connecting, and exchanging data with peripherals.

#[cfg(feature = "bluest")]
mod bluest_transport;
mod connection;
mod constants;
mod error;
mod manager;
mod notification;
mod queue;
mod registry;
mod request;
mod scanner;
mod transport;
mod types;

// Re-export types that should be publicly accessible
#[cfg(feature = "bluest")]
pub use bluest_transport::BluestTransport;
pub use connection::ConnectRetryPolicy;
pub use constants::*; // Re-export all constants
pub use error::{Error, RequestError};
pub use manager::{Central, CentralHandle};
pub use notification::ValueHandler;
pub use queue::{Action, ExecutionQueue, PeripheralLookup, QueueHandle};
pub use registry::{ConnectionHandler, PeripheralRecord, PeripheralState, Registry};
pub use request::{Request, RequestState};
pub use transport::{
    ConnectionEventCallback, DiscoveryCallback, MtuCallback, NativeTransport, RadioStatusCallback,
    StatusCallback, ValueCallback, ValueChangedCallback,
};
pub use types::{
    CharacteristicProperties, CharacteristicRef, ConnectionEvent, ConnectionEventReason,
    DiscoveryRecord, NativeHandle, PeripheralId, RadioStatus, RequestOperation, RequestStatus,
};
