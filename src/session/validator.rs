//! Sticky status decoding.

use crate::bus::{RawBusInterface, StatusWord};
use crate::error::{GpibError, GpibResult};

use super::decode_text;

/// Turns the sticky status word left by a raw call into a typed outcome.
///
/// TIMO is checked before ERR: the driver also sets ERR on a timeout, and
/// that case must surface as [`GpibError::Timeout`].
pub struct StatusValidator<'a> {
    bus: &'a dyn RawBusInterface,
}

impl<'a> StatusValidator<'a> {
    /// Validator reading the registers of `bus`.
    pub fn new(bus: &'a dyn RawBusInterface) -> Self {
        Self { bus }
    }

    /// Check the registers left by the raw call `operation` just made.
    ///
    /// Returns the status word on success so callers can inspect END.
    ///
    /// # Errors
    /// - `Timeout` if TIMO is set
    /// - `HardwareError` if ERR is set, with the driver's error text as message
    pub fn validate(&self, operation: &str, command: Option<&[u8]>) -> GpibResult<StatusWord> {
        let status = self.bus.last_status();
        let error_code = self.bus.last_error();

        if status.contains(StatusWord::TIMO) {
            return Err(GpibError::Timeout {
                operation: operation.to_string(),
                command: command.map(decode_text),
                status,
                error_code,
            });
        }

        if status.contains(StatusWord::ERR) {
            return Err(GpibError::HardwareError {
                operation: operation.to_string(),
                command: command.map(decode_text),
                status,
                error_code,
                message: self.bus.error_string(error_code),
            });
        }

        Ok(status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::{EosMode, InstrumentAddress, TimeoutLevel};
    use crate::bus::{ErrorCode, SimulatedBus, SimulatedInstrument};

    fn bus_with_session() -> (SimulatedBus, i32) {
        let bus = SimulatedBus::new().with_instrument(
            InstrumentAddress::primary_only(4).expect("valid address"),
            SimulatedInstrument::new(),
        );
        let ud = bus.open(0, 4, 0, TimeoutLevel::T1s, true, EosMode::DISABLED);
        (bus, ud)
    }

    #[test]
    fn test_ok_returns_status() {
        let (bus, ud) = bus_with_session();
        bus.clear(ud);
        let status = StatusValidator::new(&bus)
            .validate("Clear", None)
            .expect("clear should validate");
        assert!(status.contains(StatusWord::CMPL));
    }

    #[test]
    fn test_timeout_wins_over_error() {
        let (bus, ud) = bus_with_session();
        bus.inject_fault(StatusWord::TIMO | StatusWord::ERR, ErrorCode::Eabo.raw());
        bus.write(ud, b"*IDN?\n");

        let err = StatusValidator::new(&bus)
            .validate("Write", Some(b"*IDN?\n"))
            .unwrap_err();
        match err {
            GpibError::Timeout {
                operation,
                command,
                status,
                error_code,
            } => {
                assert_eq!(operation, "Write");
                assert_eq!(command.as_deref(), Some("*IDN?\n"));
                assert!(status.contains(StatusWord::ERR));
                assert_eq!(error_code, ErrorCode::Eabo.raw());
            }
            other => panic!("expected Timeout, got {other:?}"),
        }
    }

    #[test]
    fn test_error_uses_driver_message() {
        let (bus, ud) = bus_with_session();
        bus.inject_error(ErrorCode::Enol);
        bus.write(ud, b"*RST\n");

        let err = StatusValidator::new(&bus)
            .validate("Write", Some(b"*RST\n"))
            .unwrap_err();
        assert!(matches!(err, GpibError::HardwareError { .. }));
        assert_eq!(err.to_string(), bus.error_string(ErrorCode::Enol.raw()));
        assert_eq!(err.error_code(), Some(ErrorCode::Enol));
    }

    #[test]
    fn test_validate_does_not_touch_registers() {
        let (bus, ud) = bus_with_session();
        bus.clear(ud);
        let calls = bus.call_count();
        let validator = StatusValidator::new(&bus);
        validator.validate("Clear", None).expect("first");
        validator.validate("Clear", None).expect("second");
        assert_eq!(bus.call_count(), calls);
    }
}
