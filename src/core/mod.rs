//! Core functionality of the Pixels central
//! This module contains everything needed to talk to BLE peripherals

pub mod bluetooth;

// Re-export commonly used types
pub use bluetooth::{Central, CentralHandle, PeripheralId, Request, RequestState};
