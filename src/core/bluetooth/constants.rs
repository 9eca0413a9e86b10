//! Constants used throughout the central
//! This module contains protocol limits and default timeouts.

/// Largest ATT MTU a central may ask for
pub const MAX_MTU: u16 = 517;

/// ATT MTU in effect before any negotiation
pub const DEFAULT_MTU: u16 = 23;

/// Default timeout for RSSI and characteristic requests in seconds
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 10;

/// Default connect timeout in seconds, zero means the request never times out
pub const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 0;

/// Interval between two queue drains when the host loop is timer driven
pub const DEFAULT_TICK_INTERVAL_MS: u64 = 16;
