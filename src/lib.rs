//! Session layer for GPIB (IEEE-488) instruments.
//!
//! This library sits on top of a synchronous, status-word-driven bus driver
//! and provides:
//!
//! - [`session::DeviceSession`]: text command I/O with terminator and END framing,
//!   serial polling, and cancellable readiness waits
//! - [`registry::SessionRegistry`]: a session cache that serializes access per
//!   instrument address and reclaims idle sessions
//! - [`scanner::BusScanner`]: listener discovery over a range of primary addresses
//!
//! The driver is injected as a [`bus::RawBusInterface`]. [`bus::SimulatedBus`]
//! stands in for hardware in tests; the `native` feature adds a backend that
//! loads the system GPIB library at runtime.

pub mod address;
pub mod bus;
pub mod config;
pub mod error;
pub mod registry;
pub mod scanner;
pub mod session;

pub use address::{InstrumentAddress, LineTerminator, TimeoutLevel};
pub use error::{GpibError, GpibResult};
pub use registry::SessionRegistry;
pub use scanner::{BusScanner, ScanOutcome};
pub use session::{DeviceSession, DeviceSessionBuilder};
