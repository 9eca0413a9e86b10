//! Pixels central library
//! Bluetooth Low Energy central core: peripheral registry, serialized
//! execution queue, connection state machine and timed requests.

// Module declarations
pub mod config;
pub mod core;
pub mod logging;
pub mod utils;

pub use config::CentralConfig;
pub use crate::core::bluetooth::{Error, RequestError};
