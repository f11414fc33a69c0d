//! Status registers and driver error codes.
//!
//! Two different registers live here and must not be mixed up: the session
//! status word the driver leaves behind after every raw call, and the
//! instrument's own 8-bit status byte returned by a serial poll.

use std::fmt;

use bitflags::bitflags;

bitflags! {
    /// Sticky session status word set by every raw call.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct StatusWord: u16 {
        /// A driver or bus error occurred.
        const ERR  = 0x8000;
        /// The operation timed out.
        const TIMO = 0x4000;
        /// END (EOI or EOS) was detected.
        const END  = 0x2000;
        /// A service request is pending on the board.
        const SRQI = 0x1000;
        /// The device is requesting service.
        const RQS  = 0x0800;
        /// I/O completed.
        const CMPL = 0x0100;
        /// Lockout state.
        const LOK  = 0x0080;
        /// Remote state.
        const REM  = 0x0040;
        /// Controller-in-charge.
        const CIC  = 0x0020;
        /// Attention is asserted.
        const ATN  = 0x0010;
        /// Talker.
        const TACS = 0x0008;
        /// Listener.
        const LACS = 0x0004;
        /// Device trigger state.
        const DTAS = 0x0002;
        /// Device clear state.
        const DCAS = 0x0001;
    }
}

bitflags! {
    /// Instrument status byte returned by a serial poll.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct StatusByte: u8 {
        /// Service request asserted.
        const RQS = 0x40;
        /// Standard event summary.
        const ESB = 0x20;
        /// Message available in the output queue.
        const MAV = 0x10;
    }
}

/// Standard driver error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    /// System error.
    Edvr,
    /// Function requires the board to be controller-in-charge.
    Ecic,
    /// No listeners on the bus.
    Enol,
    /// Board not addressed correctly.
    Eadr,
    /// Invalid argument to function call.
    Earg,
    /// Function requires the board to be system controller.
    Esac,
    /// I/O operation aborted.
    Eabo,
    /// Non-existent board.
    Eneb,
    /// DMA error.
    Edma,
    /// Asynchronous I/O in progress.
    Eoip,
    /// No capability for operation.
    Ecap,
    /// File system error.
    Efso,
    /// Bus command error.
    Ebus,
    /// Serial poll status byte lost.
    Estb,
    /// SRQ stuck in ON position.
    Esrq,
    /// Table problem.
    Etab,
}

impl ErrorCode {
    /// Decode a raw error code.
    pub fn from_raw(code: i32) -> Option<Self> {
        Some(match code {
            0 => Self::Edvr,
            1 => Self::Ecic,
            2 => Self::Enol,
            3 => Self::Eadr,
            4 => Self::Earg,
            5 => Self::Esac,
            6 => Self::Eabo,
            7 => Self::Eneb,
            8 => Self::Edma,
            10 => Self::Eoip,
            11 => Self::Ecap,
            12 => Self::Efso,
            14 => Self::Ebus,
            15 => Self::Estb,
            16 => Self::Esrq,
            20 => Self::Etab,
            _ => return None,
        })
    }

    /// Raw code as reported by the driver.
    pub fn raw(self) -> i32 {
        match self {
            Self::Edvr => 0,
            Self::Ecic => 1,
            Self::Enol => 2,
            Self::Eadr => 3,
            Self::Earg => 4,
            Self::Esac => 5,
            Self::Eabo => 6,
            Self::Eneb => 7,
            Self::Edma => 8,
            Self::Eoip => 10,
            Self::Ecap => 11,
            Self::Efso => 12,
            Self::Ebus => 14,
            Self::Estb => 15,
            Self::Esrq => 16,
            Self::Etab => 20,
        }
    }

    /// Conventional mnemonic, e.g. `ENOL`.
    pub fn mnemonic(self) -> &'static str {
        match self {
            Self::Edvr => "EDVR",
            Self::Ecic => "ECIC",
            Self::Enol => "ENOL",
            Self::Eadr => "EADR",
            Self::Earg => "EARG",
            Self::Esac => "ESAC",
            Self::Eabo => "EABO",
            Self::Eneb => "ENEB",
            Self::Edma => "EDMA",
            Self::Eoip => "EOIP",
            Self::Ecap => "ECAP",
            Self::Efso => "EFSO",
            Self::Ebus => "EBUS",
            Self::Estb => "ESTB",
            Self::Esrq => "ESRQ",
            Self::Etab => "ETAB",
        }
    }

    /// Short description of the condition.
    pub fn description(self) -> &'static str {
        match self {
            Self::Edvr => "system error",
            Self::Ecic => "function requires GPIB board to be CIC",
            Self::Enol => "no listeners on the GPIB",
            Self::Eadr => "GPIB board not addressed correctly",
            Self::Earg => "invalid argument to function call",
            Self::Esac => "GPIB board not system controller as required",
            Self::Eabo => "I/O operation aborted (timeout)",
            Self::Eneb => "non-existent GPIB board",
            Self::Edma => "DMA error",
            Self::Eoip => "asynchronous I/O in progress",
            Self::Ecap => "no capability for operation",
            Self::Efso => "file system error",
            Self::Ebus => "GPIB bus error",
            Self::Estb => "serial poll status byte queue overflow",
            Self::Esrq => "SRQ stuck in ON position",
            Self::Etab => "table problem",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.mnemonic(), self.description())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_round_trips_known_codes() {
        for raw in [0, 1, 2, 3, 4, 5, 6, 7, 8, 10, 11, 12, 14, 15, 16, 20] {
            let code = ErrorCode::from_raw(raw).expect("known code");
            assert_eq!(code.raw(), raw);
        }
        assert_eq!(ErrorCode::from_raw(9), None);
        assert_eq!(ErrorCode::from_raw(-1), None);
    }

    #[test]
    fn test_status_registers_are_distinct() {
        // RQS lives at different positions in the two registers
        assert_eq!(StatusWord::RQS.bits(), 0x0800);
        assert_eq!(StatusByte::RQS.bits(), 0x40);
        let byte = StatusByte::from_bits_retain(0x51);
        assert!(byte.contains(StatusByte::MAV));
        assert!(byte.contains(StatusByte::RQS));
        assert_eq!(byte.bits(), 0x51);
    }

    #[test]
    fn test_error_code_display() {
        assert_eq!(ErrorCode::Enol.to_string(), "ENOL: no listeners on the GPIB");
    }
}
