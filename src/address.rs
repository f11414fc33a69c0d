//! Addressing and per-session settings.
//!
//! These are plain value types: an instrument's two-part bus address, the
//! driver's timeout ladder, the text terminator appended to writes and the
//! end-of-string mode handed to the driver when a session is opened.

use std::fmt;
use std::time::Duration;

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

use crate::error::{GpibError, GpibResult};

/// Lowest valid primary address.
pub const MIN_PRIMARY: u8 = 1;
/// Highest valid primary address.
pub const MAX_PRIMARY: u8 = 30;
/// Highest valid secondary address. Zero means no secondary addressing.
pub const MAX_SECONDARY: u8 = 31;

/// Two-part address of an instrument on the bus.
///
/// Equality and hashing are by value, which makes the address usable as a
/// registry key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InstrumentAddress {
    primary: u8,
    secondary: u8,
}

impl InstrumentAddress {
    /// Create a validated address.
    ///
    /// # Errors
    /// Returns `InvalidArgument` if `primary` is outside 1..=30 or `secondary`
    /// is above 31.
    pub fn new(primary: u8, secondary: u8) -> GpibResult<Self> {
        if !(MIN_PRIMARY..=MAX_PRIMARY).contains(&primary) {
            return Err(GpibError::InvalidArgument(format!(
                "primary address {primary} is outside {MIN_PRIMARY}..={MAX_PRIMARY}"
            )));
        }
        if secondary > MAX_SECONDARY {
            return Err(GpibError::InvalidArgument(format!(
                "secondary address {secondary} is outside 0..={MAX_SECONDARY}"
            )));
        }
        Ok(Self { primary, secondary })
    }

    /// Address without secondary addressing.
    pub fn primary_only(primary: u8) -> GpibResult<Self> {
        Self::new(primary, 0)
    }

    /// Decode a discovery result word: low byte primary, high byte secondary.
    ///
    /// No range check is applied; the address is reported as the bus saw it.
    pub fn from_raw(raw: u16) -> Self {
        let [low, high] = raw.to_le_bytes();
        Self {
            primary: low,
            secondary: high,
        }
    }

    /// Primary address.
    pub fn primary(&self) -> u8 {
        self.primary
    }

    /// Secondary address, 0 when unused.
    pub fn secondary(&self) -> u8 {
        self.secondary
    }

    /// Whether secondary addressing is in use.
    pub fn has_secondary(&self) -> bool {
        self.secondary != 0
    }
}

impl fmt::Display for InstrumentAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.has_secondary() {
            write!(f, "GPIB::{}::{}::INSTR", self.primary, self.secondary)
        } else {
            write!(f, "GPIB::{}::INSTR", self.primary)
        }
    }
}

/// I/O timeout ladder understood by the driver.
///
/// The discriminant is the index the raw interface expects. Chosen once when
/// a session is opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(u8)]
pub enum TimeoutLevel {
    /// No timeout.
    #[serde(rename = "none")]
    Disabled = 0,
    /// 10 microseconds.
    #[serde(rename = "10us")]
    T10us = 1,
    /// 30 microseconds.
    #[serde(rename = "30us")]
    T30us = 2,
    /// 100 microseconds.
    #[serde(rename = "100us")]
    T100us = 3,
    /// 300 microseconds.
    #[serde(rename = "300us")]
    T300us = 4,
    /// 1 millisecond.
    #[serde(rename = "1ms")]
    T1ms = 5,
    /// 3 milliseconds.
    #[serde(rename = "3ms")]
    T3ms = 6,
    /// 10 milliseconds.
    #[serde(rename = "10ms")]
    T10ms = 7,
    /// 30 milliseconds.
    #[serde(rename = "30ms")]
    T30ms = 8,
    /// 100 milliseconds.
    #[serde(rename = "100ms")]
    T100ms = 9,
    /// 300 milliseconds.
    #[serde(rename = "300ms")]
    T300ms = 10,
    /// 1 second.
    #[serde(rename = "1s")]
    T1s = 11,
    /// 3 seconds.
    #[serde(rename = "3s")]
    T3s = 12,
    /// 10 seconds.
    #[serde(rename = "10s")]
    T10s = 13,
    /// 30 seconds.
    #[serde(rename = "30s")]
    T30s = 14,
    /// 100 seconds.
    #[serde(rename = "100s")]
    T100s = 15,
}

impl TimeoutLevel {
    /// Every level, in ladder order.
    pub const ALL: [TimeoutLevel; 16] = [
        Self::Disabled,
        Self::T10us,
        Self::T30us,
        Self::T100us,
        Self::T300us,
        Self::T1ms,
        Self::T3ms,
        Self::T10ms,
        Self::T30ms,
        Self::T100ms,
        Self::T300ms,
        Self::T1s,
        Self::T3s,
        Self::T10s,
        Self::T30s,
        Self::T100s,
    ];

    /// Index passed to the raw interface.
    pub fn index(self) -> i32 {
        self as i32
    }

    /// Wall-clock duration of the level, `None` when disabled.
    pub fn duration(self) -> Option<Duration> {
        let micros: u64 = match self {
            Self::Disabled => return None,
            Self::T10us => 10,
            Self::T30us => 30,
            Self::T100us => 100,
            Self::T300us => 300,
            Self::T1ms => 1_000,
            Self::T3ms => 3_000,
            Self::T10ms => 10_000,
            Self::T30ms => 30_000,
            Self::T100ms => 100_000,
            Self::T300ms => 300_000,
            Self::T1s => 1_000_000,
            Self::T3s => 3_000_000,
            Self::T10s => 10_000_000,
            Self::T30s => 30_000_000,
            Self::T100s => 100_000_000,
        };
        Some(Duration::from_micros(micros))
    }

    /// Smallest level that is not shorter than `requested`, saturating at 100 s.
    pub fn from_duration(requested: Duration) -> Self {
        Self::ALL[1..]
            .iter()
            .copied()
            .find(|level| level.duration().is_some_and(|d| d >= requested))
            .unwrap_or(Self::T100s)
    }
}

impl Default for TimeoutLevel {
    fn default() -> Self {
        Self::T10s
    }
}

impl fmt::Display for TimeoutLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.duration() {
            Some(d) => write!(f, "{d:?}"),
            None => f.write_str("disabled"),
        }
    }
}

/// Terminator appended to text writes. Raw byte writes never get one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LineTerminator {
    /// Nothing appended.
    None,
    /// `\n`
    #[default]
    Lf,
    /// `\r`
    Cr,
    /// `\r\n`
    CrLf,
}

impl LineTerminator {
    /// Bytes appended to each text write.
    pub fn as_bytes(self) -> &'static [u8] {
        match self {
            Self::None => b"",
            Self::Lf => b"\n",
            Self::Cr => b"\r",
            Self::CrLf => b"\r\n",
        }
    }
}

bitflags! {
    /// End-of-string handling bits, in the driver's encoding.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct EosFlags: u16 {
        /// Terminate reads when the EOS character arrives.
        const REOS = 0x0400;
        /// Assert EOI with the EOS character on writes.
        const XEOS = 0x0800;
        /// Compare all eight bits of the EOS character.
        const BIN  = 0x1000;
    }
}

/// End-of-string mode handed to the driver at open time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct EosMode {
    /// EOS character.
    pub character: u8,
    /// How the character is used.
    pub flags: EosFlags,
}

impl EosMode {
    /// EOS disabled.
    pub const DISABLED: EosMode = EosMode {
        character: 0,
        flags: EosFlags::empty(),
    };

    /// Terminate reads on `character`.
    pub fn terminate_read_on(character: u8) -> Self {
        Self {
            character,
            flags: EosFlags::REOS,
        }
    }

    /// Driver encoding: flags in the high bits, character in the low byte.
    pub fn as_raw(self) -> i32 {
        i32::from(self.flags.bits() | u16::from(self.character))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_address_validation() {
        assert!(InstrumentAddress::new(1, 0).is_ok());
        assert!(InstrumentAddress::new(30, 31).is_ok());
        assert!(InstrumentAddress::new(0, 0).is_err());
        assert!(InstrumentAddress::new(31, 0).is_err());
        assert!(InstrumentAddress::new(5, 32).is_err());
    }

    #[test]
    fn test_address_from_raw_splits_bytes() {
        let address = InstrumentAddress::from_raw(0x0205);
        assert_eq!(address.primary(), 5);
        assert_eq!(address.secondary(), 2);
    }

    #[test]
    fn test_address_display() {
        let plain = InstrumentAddress::primary_only(22).unwrap();
        let secondary = InstrumentAddress::new(3, 4).unwrap();
        assert_eq!(plain.to_string(), "GPIB::22::INSTR");
        assert_eq!(secondary.to_string(), "GPIB::3::4::INSTR");
    }

    #[test]
    fn test_timeout_ladder_is_geometric() {
        assert_eq!(TimeoutLevel::Disabled.duration(), None);
        assert_eq!(TimeoutLevel::T10us.duration(), Some(Duration::from_micros(10)));
        assert_eq!(TimeoutLevel::T100s.duration(), Some(Duration::from_secs(100)));
        for pair in TimeoutLevel::ALL[1..].windows(2) {
            assert!(pair[0].duration() < pair[1].duration());
            assert_eq!(pair[0].index() + 1, pair[1].index());
        }
    }

    #[test]
    fn test_timeout_from_duration() {
        assert_eq!(TimeoutLevel::from_duration(Duration::from_millis(2)), TimeoutLevel::T3ms);
        assert_eq!(TimeoutLevel::from_duration(Duration::from_secs(10)), TimeoutLevel::T10s);
        assert_eq!(TimeoutLevel::from_duration(Duration::from_secs(500)), TimeoutLevel::T100s);
    }

    #[test]
    fn test_terminator_bytes() {
        assert_eq!(LineTerminator::None.as_bytes(), b"");
        assert_eq!(LineTerminator::CrLf.as_bytes(), b"\r\n");
    }

    #[test]
    fn test_eos_raw_encoding() {
        assert_eq!(EosMode::DISABLED.as_raw(), 0);
        assert_eq!(EosMode::terminate_read_on(b'\n').as_raw(), 0x040A);
    }
}
