//! Raw bus access.
//!
//! [`RawBusInterface`] is the injected capability every session, the registry
//! factory and the scanner talk through. It mirrors the synchronous driver
//! API: each call returns immediately with a result and leaves a sticky
//! status word, error code and byte count behind, readable through
//! [`last_status`](RawBusInterface::last_status),
//! [`last_error`](RawBusInterface::last_error) and
//! [`last_count`](RawBusInterface::last_count). Those registers are only valid
//! until the next raw call on the same thread, so callers read them right
//! away without awaiting in between.
//!
//! Implementations:
//! - [`SimulatedBus`]: in-process bus with scripted instruments
//! - `NativeBus` (feature `native`): the system GPIB library loaded at runtime

mod status;
pub mod simulated;

#[cfg(feature = "native")]
pub mod native;

pub use simulated::{BusCall, SimulatedBus, SimulatedInstrument};
pub use status::{ErrorCode, StatusByte, StatusWord};

#[cfg(feature = "native")]
pub use native::NativeBus;

use crate::address::{EosMode, TimeoutLevel};

/// Terminates the probe list handed to [`RawBusInterface::discover`].
pub const NO_ADDRESS: u16 = 0xFFFF;

/// Synchronous primitives of a GPIB driver.
///
/// Every call may block for up to the session's configured [`TimeoutLevel`].
pub trait RawBusInterface: Send + Sync {
    /// Open a device session. A negative descriptor means failure.
    fn open(
        &self,
        board_index: i32,
        primary: u8,
        secondary: u8,
        timeout: TimeoutLevel,
        assert_eoi: bool,
        eos: EosMode,
    ) -> i32;

    /// Take a descriptor online (`value != 0`) or offline (`value == 0`).
    fn take_offline(&self, descriptor: i32, value: i32) -> StatusWord;

    /// Write raw bytes.
    fn write(&self, descriptor: i32, data: &[u8]) -> StatusWord;

    /// Read into `buffer`; the transferred count is in [`last_count`](Self::last_count).
    fn read(&self, descriptor: i32, buffer: &mut [u8]) -> StatusWord;

    /// Send a device clear.
    fn clear(&self, descriptor: i32) -> StatusWord;

    /// Serial poll the device and return its status byte.
    fn serial_poll(&self, descriptor: i32) -> u8;

    /// Status word left by the last call on this thread.
    fn last_status(&self) -> StatusWord;

    /// Error code left by the last call on this thread.
    fn last_error(&self) -> i32;

    /// Byte or result count left by the last call on this thread.
    fn last_count(&self) -> usize;

    /// Human-readable text for an error code.
    fn error_string(&self, code: i32) -> String;

    /// Find listeners among `probes` (terminated by [`NO_ADDRESS`]), filling
    /// `results` and setting the count register to the number found.
    fn discover(&self, board_index: i32, probes: &[u16], results: &mut [u16]);

    /// Driver version text.
    fn version_string(&self) -> String;
}
