//! Custom error types for the session layer.
//!
//! This module defines the primary error type, `GpibError`, for the entire crate.
//! Using the `thiserror` crate, it provides a centralized and consistent way to handle
//! everything that can go wrong between a caller and an instrument on the bus.
//!
//! ## Error Hierarchy
//!
//! - **`OpenFailure`**: the driver refused to open a session for an address. Fatal for
//!   that session; the registry surfaces it and does not retry.
//! - **`Timeout`**: the driver set TIMO in the sticky status word after a raw call.
//! - **`WaitTimeout`**: a polling wait (message available, service request) ran out of
//!   its wall-clock budget. Like `Timeout`, retryable by the caller.
//! - **`HardwareError`**: the driver set ERR; the message comes from the driver's own
//!   error-string lookup.
//! - **`Format`**: a typed read could not convert the instrument's response.
//! - **`InvalidRange`** / **`InvalidArgument`**: caller misuse.
//! - **`UseAfterClose`**: a session or registry was used after disposal.
//! - **`Cancelled`**: a wait was cancelled through its token. Never reported as a timeout.

use std::time::Duration;

use thiserror::Error;

use crate::address::InstrumentAddress;
use crate::bus::{ErrorCode, StatusWord};

/// Convenience alias for results using the crate error type.
pub type GpibResult<T> = std::result::Result<T, GpibError>;

/// Errors reported by sessions, the registry and the scanner.
#[derive(Error, Debug)]
pub enum GpibError {
    /// The raw interface returned a negative descriptor when opening a session.
    #[error("failed to open a session to {address} on board {board_index} (descriptor {descriptor})")]
    OpenFailure {
        /// Address the session was opened for.
        address: InstrumentAddress,
        /// Board the session was opened on.
        board_index: i32,
        /// Descriptor returned by the raw interface.
        descriptor: i32,
    },

    /// TIMO was set after a raw call.
    #[error("the '{operation}' operation timed out.")]
    Timeout {
        /// Name of the failed operation.
        operation: String,
        /// Command text sent with the call, if any.
        command: Option<String>,
        /// Sticky status word read after the call.
        status: StatusWord,
        /// Raw driver error code read after the call.
        error_code: i32,
    },

    /// A polling wait did not observe its condition within the budget.
    #[error("the '{operation}' operation timed out after {budget:?}.")]
    WaitTimeout {
        /// Name of the wait operation.
        operation: String,
        /// Configured wall-clock budget.
        budget: Duration,
    },

    /// ERR was set after a raw call.
    #[error("{message}")]
    HardwareError {
        /// Name of the failed operation.
        operation: String,
        /// Command text sent with the call, if any.
        command: Option<String>,
        /// Sticky status word read after the call.
        status: StatusWord,
        /// Raw driver error code read after the call.
        error_code: i32,
        /// Human-readable message from the driver's error-string lookup.
        message: String,
    },

    /// A response could not be converted into the requested type.
    #[error("cannot convert response '{value}' to {target}")]
    Format {
        /// Trimmed response text.
        value: String,
        /// Name of the requested type.
        target: &'static str,
    },

    /// Discovery bounds were malformed.
    #[error("invalid primary address range {min}..={max}; both bounds must be within 1..=30 and min <= max")]
    InvalidRange {
        /// Requested lower bound.
        min: u8,
        /// Requested upper bound.
        max: u8,
    },

    /// A caller passed an argument that can never be valid.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The session or registry was already disposed.
    #[error("the {0} has been closed")]
    UseAfterClose(&'static str),

    /// A wait was cancelled before it completed.
    #[error("the '{operation}' operation was cancelled")]
    Cancelled {
        /// Name of the cancelled operation.
        operation: String,
    },

    /// The native GPIB library could not be loaded or lacks a required symbol.
    #[cfg(feature = "native")]
    #[error("GPIB library error: {0}")]
    Library(String),
}

impl GpibError {
    /// True for both bus timeouts and elapsed polling budgets.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. } | Self::WaitTimeout { .. })
    }

    /// True when the operation was cancelled through its token.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled { .. })
    }

    /// The driver error code carried by `Timeout` and `HardwareError`, when it is a known code.
    pub fn error_code(&self) -> Option<ErrorCode> {
        match self {
            Self::Timeout { error_code, .. } | Self::HardwareError { error_code, .. } => {
                ErrorCode::from_raw(*error_code)
            }
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeout_display() {
        let err = GpibError::Timeout {
            operation: "Read".to_string(),
            command: None,
            status: StatusWord::TIMO | StatusWord::ERR,
            error_code: 6,
        };
        assert_eq!(err.to_string(), "the 'Read' operation timed out.");
        assert!(err.is_timeout());
        assert_eq!(err.error_code(), Some(ErrorCode::Eabo));
    }

    #[test]
    fn test_cancelled_is_not_timeout() {
        let err = GpibError::Cancelled {
            operation: "WaitForMessage".to_string(),
        };
        assert!(!err.is_timeout());
        assert!(err.is_cancelled());
    }

    #[test]
    fn test_wait_timeout_names_budget() {
        let err = GpibError::WaitTimeout {
            operation: "WaitForServiceRequest".to_string(),
            budget: Duration::from_millis(250),
        };
        assert!(err.to_string().contains("WaitForServiceRequest"));
        assert!(err.to_string().contains("250ms"));
        assert!(err.is_timeout());
    }
}
