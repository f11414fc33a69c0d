//! Device sessions.
//!
//! A [`DeviceSession`] owns one open driver session to one instrument and
//! turns the byte-oriented, status-word-driven raw interface into text
//! command I/O:
//!
//! - writes append the configured [`LineTerminator`]
//! - reads loop over fixed-size chunks until END is seen or a transfer comes
//!   back empty, then strip trailing CR, LF and NUL
//! - every raw call is followed by a [`StatusValidator`] check
//!
//! Readiness waits are synthesized by serial polling at a fixed interval on
//! tokio time, bounded by a wall-clock budget and a [`CancellationToken`].
//!
//! A session is not reentrant. Share it through
//! [`SessionRegistry`](crate::registry::SessionRegistry) or behind your own lock.
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use rust_gpib::address::{InstrumentAddress, LineTerminator};
//! use rust_gpib::bus::{SimulatedBus, SimulatedInstrument};
//! use rust_gpib::session::DeviceSessionBuilder;
//!
//! # fn main() -> rust_gpib::GpibResult<()> {
//! let address = InstrumentAddress::primary_only(7)?;
//! let bus = Arc::new(SimulatedBus::new().with_instrument(
//!     address,
//!     SimulatedInstrument::new().respond("*IDN?", "ACME,DMM-1,0001,1.0"),
//! ));
//!
//! let mut session = DeviceSessionBuilder::new(bus, address)
//!     .with_terminator(LineTerminator::Lf)
//!     .open()?;
//! let idn: String = session.query("*IDN?")?;
//! assert_eq!(idn, "ACME,DMM-1,0001,1.0");
//! # Ok(())
//! # }
//! ```

mod convert;
mod validator;

pub use convert::{parse_scpi_bool, FromResponse};
pub use validator::StatusValidator;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::address::{EosMode, InstrumentAddress, LineTerminator, TimeoutLevel};
use crate::bus::{RawBusInterface, StatusByte, StatusWord};
use crate::error::{GpibError, GpibResult};

/// Size of the chunk each raw read transfers into.
pub const READ_CHUNK_SIZE: usize = 1024;

/// Default interval between serial polls in the wait operations.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Encode text one byte per character. Characters above U+00FF become `?`.
pub(crate) fn encode_text(text: &str) -> Vec<u8> {
    text.chars()
        .map(|c| u8::try_from(u32::from(c)).unwrap_or(b'?'))
        .collect()
}

/// Decode bytes one character per byte.
pub(crate) fn decode_text(bytes: &[u8]) -> String {
    bytes.iter().map(|&b| char::from(b)).collect()
}

fn trim_response(text: &str) -> &str {
    text.trim_end_matches(['\r', '\n', '\0'])
}

/// Settings fixed when a session is opened (the terminator stays adjustable).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionOptions {
    /// Board (interface) index.
    pub board_index: i32,
    /// Driver I/O timeout.
    pub timeout: TimeoutLevel,
    /// Terminator appended to text writes.
    pub terminator: LineTerminator,
    /// Assert EOI with the last byte of each write.
    pub assert_eoi: bool,
    /// End-of-string mode.
    pub eos: EosMode,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            board_index: 0,
            timeout: TimeoutLevel::T10s,
            terminator: LineTerminator::Lf,
            assert_eoi: true,
            eos: EosMode::DISABLED,
        }
    }
}

/// Builder for constructing a [`DeviceSession`] with custom configuration
///
/// Provides a fluent interface for configuring sessions while preserving
/// sensible defaults (board 0, 10 s timeout, LF terminator, EOI on writes,
/// EOS disabled).
pub struct DeviceSessionBuilder {
    bus: Arc<dyn RawBusInterface>,
    address: InstrumentAddress,
    options: SessionOptions,
}

impl DeviceSessionBuilder {
    /// Create a new builder for `address` on `bus`.
    pub fn new(bus: Arc<dyn RawBusInterface>, address: InstrumentAddress) -> Self {
        Self {
            bus,
            address,
            options: SessionOptions::default(),
        }
    }

    /// Replace all options at once.
    pub fn with_options(mut self, options: SessionOptions) -> Self {
        self.options = options;
        self
    }

    /// Set the board index.
    pub fn with_board_index(mut self, board_index: i32) -> Self {
        self.options.board_index = board_index;
        self
    }

    /// Set the driver I/O timeout.
    pub fn with_timeout(mut self, timeout: TimeoutLevel) -> Self {
        self.options.timeout = timeout;
        self
    }

    /// Set the write terminator.
    pub fn with_terminator(mut self, terminator: LineTerminator) -> Self {
        self.options.terminator = terminator;
        self
    }

    /// Set whether EOI is asserted on writes.
    pub fn with_eoi(mut self, assert_eoi: bool) -> Self {
        self.options.assert_eoi = assert_eoi;
        self
    }

    /// Set the end-of-string mode.
    pub fn with_eos(mut self, eos: EosMode) -> Self {
        self.options.eos = eos;
        self
    }

    /// Open the session.
    ///
    /// # Errors
    /// Returns `OpenFailure` if the driver hands back a negative descriptor.
    pub fn open(self) -> GpibResult<DeviceSession> {
        DeviceSession::open(self.bus, self.address, &self.options)
    }
}

/// One open session to one instrument.
pub struct DeviceSession {
    bus: Arc<dyn RawBusInterface>,
    descriptor: i32,
    address: InstrumentAddress,
    board_index: i32,
    timeout: TimeoutLevel,
    terminator: LineTerminator,
    closed: bool,
}

impl fmt::Debug for DeviceSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceSession")
            .field("descriptor", &self.descriptor)
            .field("address", &self.address)
            .field("board_index", &self.board_index)
            .field("timeout", &self.timeout)
            .field("terminator", &self.terminator)
            .field("closed", &self.closed)
            .finish()
    }
}

impl DeviceSession {
    /// Open a session to `address` through `bus`.
    ///
    /// # Errors
    /// Returns `OpenFailure` if the driver hands back a negative descriptor.
    pub fn open(
        bus: Arc<dyn RawBusInterface>,
        address: InstrumentAddress,
        options: &SessionOptions,
    ) -> GpibResult<Self> {
        let descriptor = bus.open(
            options.board_index,
            address.primary(),
            address.secondary(),
            options.timeout,
            options.assert_eoi,
            options.eos,
        );
        if descriptor < 0 {
            return Err(GpibError::OpenFailure {
                address,
                board_index: options.board_index,
                descriptor,
            });
        }

        debug!(%address, descriptor, timeout = %options.timeout, "Opened GPIB session");

        Ok(Self {
            bus,
            descriptor,
            address,
            board_index: options.board_index,
            timeout: options.timeout,
            terminator: options.terminator,
            closed: false,
        })
    }

    /// Instrument address.
    pub fn address(&self) -> InstrumentAddress {
        self.address
    }

    /// Driver descriptor of this session.
    pub fn descriptor(&self) -> i32 {
        self.descriptor
    }

    /// Board index the session was opened on.
    pub fn board_index(&self) -> i32 {
        self.board_index
    }

    /// Timeout chosen at open time.
    pub fn timeout(&self) -> TimeoutLevel {
        self.timeout
    }

    /// Current write terminator.
    pub fn terminator(&self) -> LineTerminator {
        self.terminator
    }

    /// Change the write terminator.
    pub fn set_terminator(&mut self, terminator: LineTerminator) {
        self.terminator = terminator;
    }

    /// Whether [`close`](Self::close) has run.
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    fn ensure_open(&self) -> GpibResult<()> {
        if self.closed {
            return Err(GpibError::UseAfterClose("device session"));
        }
        Ok(())
    }

    fn validator(&self) -> StatusValidator<'_> {
        StatusValidator::new(self.bus.as_ref())
    }

    /// Write a text command followed by the terminator.
    ///
    /// # Errors
    /// - `InvalidArgument` for an empty command
    /// - `UseAfterClose`, `Timeout`, `HardwareError`
    pub fn write(&mut self, command: &str) -> GpibResult<()> {
        self.ensure_open()?;
        if command.is_empty() {
            return Err(GpibError::InvalidArgument(
                "command must not be empty".to_string(),
            ));
        }

        let mut data = encode_text(command);
        data.extend_from_slice(self.terminator.as_bytes());

        trace!(address = %self.address, command, "GPIB write");
        self.bus.write(self.descriptor, &data);
        self.validator().validate("Write", Some(&data))?;
        Ok(())
    }

    /// Write raw bytes without a terminator. An empty slice is a no-op.
    ///
    /// # Errors
    /// `UseAfterClose`, `Timeout`, `HardwareError`
    pub fn write_bytes(&mut self, data: &[u8]) -> GpibResult<()> {
        self.ensure_open()?;
        if data.is_empty() {
            return Ok(());
        }

        self.bus.write(self.descriptor, data);
        self.validator().validate("WriteBytes", None)?;
        Ok(())
    }

    /// Read once into `buffer` and return the driver's transferred count.
    /// A zero-length buffer returns 0 without touching the bus.
    ///
    /// # Errors
    /// `UseAfterClose`, `Timeout`, `HardwareError`
    pub fn read_bytes(&mut self, buffer: &mut [u8]) -> GpibResult<usize> {
        self.ensure_open()?;
        if buffer.is_empty() {
            return Ok(0);
        }
        let (count, _) = self.read_chunk(buffer, "ReadBytes")?;
        Ok(count)
    }

    fn read_chunk(&self, buffer: &mut [u8], operation: &str) -> GpibResult<(usize, StatusWord)> {
        self.bus.read(self.descriptor, buffer);
        let status = self.validator().validate(operation, None)?;
        let count = self.bus.last_count();
        Ok((count, status))
    }

    /// Read one complete message and return it with trailing CR, LF and NUL removed.
    ///
    /// Stops after the chunk on which END is set, or on the first empty
    /// transfer without END.
    ///
    /// # Errors
    /// `UseAfterClose`, `Timeout`, `HardwareError`
    pub fn read(&mut self) -> GpibResult<String> {
        self.ensure_open()?;

        let mut chunk = [0u8; READ_CHUNK_SIZE];
        let mut message = Vec::new();
        loop {
            let (count, status) = self.read_chunk(&mut chunk, "Read")?;
            let count = count.min(chunk.len());
            message.extend_from_slice(&chunk[..count]);
            trace!(address = %self.address, count, end = status.contains(StatusWord::END), "GPIB read chunk");

            if status.contains(StatusWord::END) || count == 0 {
                break;
            }
        }

        Ok(trim_response(&decode_text(&message)).to_string())
    }

    /// Read a message and convert it.
    ///
    /// # Errors
    /// As [`read`](Self::read), plus `Format` when conversion fails.
    pub fn read_as<T: FromResponse>(&mut self) -> GpibResult<T> {
        let text = self.read()?;
        T::from_response(&text)
    }

    /// Write `command`, then read and convert the response.
    ///
    /// # Errors
    /// As [`write`](Self::write) and [`read_as`](Self::read_as).
    pub fn query<T: FromResponse>(&mut self, command: &str) -> GpibResult<T> {
        self.write(command)?;
        self.read_as()
    }

    /// Write `command`, wait for MAV, then read and convert the response.
    ///
    /// # Errors
    /// As [`query`](Self::query), plus `WaitTimeout` and `Cancelled` from the wait.
    pub async fn query_async<T: FromResponse>(
        &mut self,
        command: &str,
        cancel: &CancellationToken,
        poll_interval: Duration,
        timeout: Duration,
    ) -> GpibResult<T> {
        self.write(command)?;
        self.wait_for_message(cancel, poll_interval, timeout).await?;
        self.read_as()
    }

    /// Serial poll the instrument.
    ///
    /// # Errors
    /// `UseAfterClose`, `Timeout`, `HardwareError`
    pub fn serial_poll(&mut self) -> GpibResult<StatusByte> {
        self.ensure_open()?;
        let byte = self.bus.serial_poll(self.descriptor);
        self.validator().validate("SerialPoll", None)?;
        Ok(StatusByte::from_bits_retain(byte))
    }

    /// Poll and report MAV. Polls the instrument on every call.
    ///
    /// # Errors
    /// As [`serial_poll`](Self::serial_poll).
    pub fn is_message_available(&mut self) -> GpibResult<bool> {
        Ok(self.serial_poll()?.contains(StatusByte::MAV))
    }

    /// Poll and report RQS. Polls the instrument on every call.
    ///
    /// # Errors
    /// As [`serial_poll`](Self::serial_poll).
    pub fn is_service_request_asserted(&mut self) -> GpibResult<bool> {
        Ok(self.serial_poll()?.contains(StatusByte::RQS))
    }

    /// Wait until the instrument reports MAV.
    ///
    /// # Errors
    /// - `Cancelled` if `cancel` fires first
    /// - `WaitTimeout` once `timeout` has elapsed
    /// - anything [`serial_poll`](Self::serial_poll) reports
    pub async fn wait_for_message(
        &mut self,
        cancel: &CancellationToken,
        poll_interval: Duration,
        timeout: Duration,
    ) -> GpibResult<()> {
        self.wait_until(
            "WaitForMessage",
            Self::is_message_available,
            cancel,
            poll_interval,
            timeout,
        )
        .await
    }

    /// Wait until the instrument asserts RQS.
    ///
    /// # Errors
    /// - `Cancelled` if `cancel` fires first
    /// - `WaitTimeout` once `timeout` has elapsed
    /// - anything [`serial_poll`](Self::serial_poll) reports
    pub async fn wait_for_service_request(
        &mut self,
        cancel: &CancellationToken,
        poll_interval: Duration,
        timeout: Duration,
    ) -> GpibResult<()> {
        self.wait_until(
            "WaitForServiceRequest",
            Self::is_service_request_asserted,
            cancel,
            poll_interval,
            timeout,
        )
        .await
    }

    async fn wait_until(
        &mut self,
        operation: &str,
        mut predicate: impl FnMut(&mut Self) -> GpibResult<bool>,
        cancel: &CancellationToken,
        poll_interval: Duration,
        timeout: Duration,
    ) -> GpibResult<()> {
        if poll_interval.is_zero() {
            return Err(GpibError::InvalidArgument(
                "poll interval must be greater than zero".to_string(),
            ));
        }
        let cancelled = || GpibError::Cancelled {
            operation: operation.to_string(),
        };
        // A budget past the clock's range means no deadline
        let deadline = Instant::now().checked_add(timeout);

        loop {
            if cancel.is_cancelled() {
                return Err(cancelled());
            }
            if predicate(self)? {
                return Ok(());
            }
            let now = Instant::now();
            if deadline.is_some_and(|deadline| now >= deadline) {
                return Err(GpibError::WaitTimeout {
                    operation: operation.to_string(),
                    budget: timeout,
                });
            }
            trace!(address = %self.address, operation, "Condition not met, polling again");

            let wake = match now.checked_add(poll_interval) {
                Some(next) => Some(deadline.map_or(next, |deadline| next.min(deadline))),
                None => deadline,
            };
            let pause = async {
                match wake {
                    Some(wake) => tokio::time::sleep_until(wake).await,
                    None => std::future::pending().await,
                }
            };
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(cancelled()),
                _ = pause => {}
            }
        }
    }

    /// Send a device clear.
    ///
    /// # Errors
    /// `UseAfterClose`, `Timeout`, `HardwareError`
    pub fn clear(&mut self) -> GpibResult<()> {
        self.ensure_open()?;
        self.bus.clear(self.descriptor);
        self.validator().validate("Clear", None)?;
        Ok(())
    }

    /// Version text of the driver behind this session.
    pub fn version_string(&self) -> String {
        self.bus.version_string()
    }

    /// Take the session offline. Safe to call repeatedly; only the first call
    /// reaches the driver.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;

        let status = self.bus.take_offline(self.descriptor, 0);
        if status.contains(StatusWord::ERR) {
            warn!(
                address = %self.address,
                descriptor = self.descriptor,
                error = self.bus.last_error(),
                "Driver reported an error while taking session offline"
            );
        } else {
            debug!(address = %self.address, descriptor = self.descriptor, "Closed GPIB session");
        }
    }
}

impl Drop for DeviceSession {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{BusCall, SimulatedBus, SimulatedInstrument};

    fn setup(instrument: SimulatedInstrument) -> (Arc<SimulatedBus>, DeviceSession) {
        let address = InstrumentAddress::primary_only(9).expect("valid address");
        let bus = Arc::new(SimulatedBus::new().with_instrument(address, instrument));
        let session = DeviceSessionBuilder::new(bus.clone(), address)
            .open()
            .expect("open");
        (bus, session)
    }

    #[test]
    fn test_text_encoding_is_single_byte() {
        assert_eq!(encode_text("A\u{e9}\u{20ac}"), vec![b'A', 0xE9, b'?']);
        assert_eq!(decode_text(&[b'A', 0xE9]), "A\u{e9}");
    }

    #[test]
    fn test_trim_response_only_strips_line_endings() {
        assert_eq!(trim_response("1.5 \r\n\0"), "1.5 ");
        assert_eq!(trim_response("\r\n"), "");
    }

    #[test]
    fn test_empty_command_fails_fast() {
        let (bus, mut session) = setup(SimulatedInstrument::new());
        bus.clear_calls();
        let err = session.write("").unwrap_err();
        assert!(matches!(err, GpibError::InvalidArgument(_)));
        assert_eq!(bus.call_count(), 0);
    }

    #[test]
    fn test_read_bytes_reports_driver_count() {
        let (bus, mut session) = setup(SimulatedInstrument::new());
        bus.push_output(session.address(), b"abc");
        let mut buffer = [0u8; 16];
        assert_eq!(session.read_bytes(&mut buffer).expect("read"), 3);
        assert_eq!(&buffer[..3], b"abc");
    }

    #[test]
    fn test_close_is_idempotent() {
        let (bus, mut session) = setup(SimulatedInstrument::new());
        let descriptor = session.descriptor();
        session.close();
        session.close();
        drop(session);
        assert_eq!(bus.offline_count(descriptor), 1);
        assert!(bus
            .calls()
            .contains(&BusCall::TakeOffline { descriptor, value: 0 }));
    }

    #[test]
    fn test_drop_closes_session() {
        let (bus, session) = setup(SimulatedInstrument::new());
        let descriptor = session.descriptor();
        drop(session);
        assert_eq!(bus.offline_count(descriptor), 1);
    }
}
