//! Error types of the central.

use crate::core::bluetooth::types::{PeripheralId, RequestOperation, RequestStatus};

/// Misuse detected when a central operation is called.
///
/// Transport failures never surface here, they are delivered through the
/// terminal state of a [`Request`](crate::core::bluetooth::Request).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    #[error("No peripheral found with id {0}")]
    UnknownPeripheral(PeripheralId),

    #[error("Central not ready, the Bluetooth radio is not enabled")]
    NotReady,

    #[error("Failed to initialize the native Bluetooth transport")]
    InitializeFailed,

    #[error("Failed to start scanning for peripherals")]
    ScanFailed,

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
}

/// Terminal failure of an awaited request
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum RequestError {
    #[error("{operation} failed: {status}")]
    Failed {
        operation: RequestOperation,
        status: RequestStatus,
    },

    #[error("{operation} timed out")]
    TimedOut { operation: RequestOperation },
}

impl RequestError {
    pub fn operation(&self) -> RequestOperation {
        match self {
            Self::Failed { operation, .. } | Self::TimedOut { operation } => *operation,
        }
    }
}
