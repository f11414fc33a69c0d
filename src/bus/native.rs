//! Backend for the system GPIB library.
//!
//! Loads a linux-gpib compatible shared library (`libgpib.so.0` by default)
//! at runtime and forwards every [`RawBusInterface`] call to it. The sticky
//! registers are read through the library's thread-aware accessors
//! (`ThreadIbsta`, `ThreadIberr`, `ThreadIbcntl`), so the values seen by a
//! caller are the ones its own last call produced.
//!
//! Secondary addresses are 1..=31 in this crate; the driver expects and
//! returns them as 0x60..=0x7E.

#![allow(unsafe_code)]

use std::ffi::{c_char, c_int, c_long, c_uint, c_ushort, CStr};
use std::path::Path;

use libloading::Library;
use tracing::info;

use super::{RawBusInterface, StatusWord};
use crate::address::{EosMode, TimeoutLevel};
use crate::error::{GpibError, GpibResult};

/// Library name tried by [`NativeBus::load_default`].
pub const DEFAULT_LIBRARY: &str = "libgpib.so.0";

const SECONDARY_OFFSET: u8 = 0x5F;

type IbdevFn = unsafe extern "C" fn(c_int, c_int, c_int, c_int, c_int, c_int) -> c_int;
type IbonlFn = unsafe extern "C" fn(c_int, c_int) -> c_int;
type IbwrtFn = unsafe extern "C" fn(c_int, *const c_char, c_long) -> c_int;
type IbrdFn = unsafe extern "C" fn(c_int, *mut c_char, c_long) -> c_int;
type IbclrFn = unsafe extern "C" fn(c_int) -> c_int;
type IbrspFn = unsafe extern "C" fn(c_int, *mut c_char) -> c_int;
type ThreadIbstaFn = unsafe extern "C" fn() -> c_int;
type ThreadIberrFn = unsafe extern "C" fn() -> c_int;
type ThreadIbcntlFn = unsafe extern "C" fn() -> c_long;
type ErrorStringFn = unsafe extern "C" fn(c_int) -> *const c_char;
type FindLstnFn = unsafe extern "C" fn(c_int, *const c_ushort, *mut c_ushort, c_int);
type IbversFn = unsafe extern "C" fn(*mut *mut c_char);

/// Driver encoding of a secondary address; 0 stays "none".
fn encode_secondary(secondary: u8) -> u8 {
    if secondary == 0 {
        0
    } else {
        secondary.saturating_add(SECONDARY_OFFSET)
    }
}

/// Inverse of [`encode_secondary`] for discovery results.
fn decode_secondary(raw: u8) -> u8 {
    if (0x60..=0x7E).contains(&raw) {
        raw - SECONDARY_OFFSET
    } else {
        raw
    }
}

fn status(raw: c_int) -> StatusWord {
    // The status word occupies the low 16 bits
    StatusWord::from_bits_retain((raw as c_uint & 0xFFFF) as u16)
}

/// [`RawBusInterface`] over a dynamically loaded GPIB library.
pub struct NativeBus {
    #[allow(dead_code)]
    library: Library,
    path: String,
    ibdev: IbdevFn,
    ibonl: IbonlFn,
    ibwrt: IbwrtFn,
    ibrd: IbrdFn,
    ibclr: IbclrFn,
    ibrsp: IbrspFn,
    thread_ibsta: ThreadIbstaFn,
    thread_iberr: ThreadIberrFn,
    thread_ibcntl: ThreadIbcntlFn,
    error_string: ErrorStringFn,
    find_lstn: FindLstnFn,
    ibvers: Option<IbversFn>,
}

// Only function pointers and the library handle are stored; the driver
// functions are thread-safe and keep per-thread status.
unsafe impl Send for NativeBus {}
unsafe impl Sync for NativeBus {}

macro_rules! symbol {
    ($library:expr, $ty:ty, $name:literal) => {
        unsafe {
            *$library
                .get::<$ty>(concat!($name, "\0").as_bytes())
                .map_err(|e| GpibError::Library(format!("missing symbol {}: {e}", $name)))?
        }
    };
}

impl NativeBus {
    /// Load [`DEFAULT_LIBRARY`].
    ///
    /// # Errors
    /// Returns `Library` if the library or a required symbol is missing.
    pub fn load_default() -> GpibResult<Self> {
        Self::load(DEFAULT_LIBRARY)
    }

    /// Load the GPIB library at `path`.
    ///
    /// # Errors
    /// Returns `Library` if the library or a required symbol is missing.
    ///
    /// # Safety considerations
    ///
    /// The library must implement the linux-gpib C API; a library exporting
    /// the same symbols with other signatures is undefined behavior.
    pub fn load<P: AsRef<Path>>(path: P) -> GpibResult<Self> {
        let path = path.as_ref();
        let path_str = path.display().to_string();

        let library = unsafe { Library::new(path) }
            .map_err(|e| GpibError::Library(format!("cannot load {path_str}: {e}")))?;

        let ibdev = symbol!(library, IbdevFn, "ibdev");
        let ibonl = symbol!(library, IbonlFn, "ibonl");
        let ibwrt = symbol!(library, IbwrtFn, "ibwrt");
        let ibrd = symbol!(library, IbrdFn, "ibrd");
        let ibclr = symbol!(library, IbclrFn, "ibclr");
        let ibrsp = symbol!(library, IbrspFn, "ibrsp");
        let thread_ibsta = symbol!(library, ThreadIbstaFn, "ThreadIbsta");
        let thread_iberr = symbol!(library, ThreadIberrFn, "ThreadIberr");
        let thread_ibcntl = symbol!(library, ThreadIbcntlFn, "ThreadIbcntl");
        let error_string = symbol!(library, ErrorStringFn, "gpib_error_string");
        let find_lstn = symbol!(library, FindLstnFn, "FindLstn");

        let ibvers: Option<IbversFn> =
            unsafe { library.get::<IbversFn>(b"ibvers\0").ok().map(|s| *s) };

        info!(path = %path_str, has_ibvers = ibvers.is_some(), "Loaded GPIB library");

        Ok(Self {
            library,
            path: path_str,
            ibdev,
            ibonl,
            ibwrt,
            ibrd,
            ibclr,
            ibrsp,
            thread_ibsta,
            thread_iberr,
            thread_ibcntl,
            error_string,
            find_lstn,
            ibvers,
        })
    }

    /// Path the library was loaded from.
    pub fn path(&self) -> &str {
        &self.path
    }
}

impl RawBusInterface for NativeBus {
    fn open(
        &self,
        board_index: i32,
        primary: u8,
        secondary: u8,
        timeout: TimeoutLevel,
        assert_eoi: bool,
        eos: EosMode,
    ) -> i32 {
        unsafe {
            (self.ibdev)(
                board_index,
                c_int::from(primary),
                c_int::from(encode_secondary(secondary)),
                timeout.index(),
                c_int::from(assert_eoi),
                eos.as_raw(),
            )
        }
    }

    fn take_offline(&self, descriptor: i32, value: i32) -> StatusWord {
        status(unsafe { (self.ibonl)(descriptor, value) })
    }

    fn write(&self, descriptor: i32, data: &[u8]) -> StatusWord {
        let len = c_long::try_from(data.len()).unwrap_or(c_long::MAX);
        status(unsafe { (self.ibwrt)(descriptor, data.as_ptr().cast(), len) })
    }

    fn read(&self, descriptor: i32, buffer: &mut [u8]) -> StatusWord {
        let len = c_long::try_from(buffer.len()).unwrap_or(c_long::MAX);
        status(unsafe { (self.ibrd)(descriptor, buffer.as_mut_ptr().cast(), len) })
    }

    fn clear(&self, descriptor: i32) -> StatusWord {
        status(unsafe { (self.ibclr)(descriptor) })
    }

    fn serial_poll(&self, descriptor: i32) -> u8 {
        let mut byte: c_char = 0;
        unsafe { (self.ibrsp)(descriptor, &mut byte) };
        byte as u8
    }

    fn last_status(&self) -> StatusWord {
        status(unsafe { (self.thread_ibsta)() })
    }

    fn last_error(&self) -> i32 {
        unsafe { (self.thread_iberr)() }
    }

    fn last_count(&self) -> usize {
        let count = unsafe { (self.thread_ibcntl)() };
        usize::try_from(count).unwrap_or(0)
    }

    fn error_string(&self, code: i32) -> String {
        let text = unsafe { (self.error_string)(code) };
        if text.is_null() {
            return format!("unknown error {code}");
        }
        unsafe { CStr::from_ptr(text) }.to_string_lossy().into_owned()
    }

    fn discover(&self, board_index: i32, probes: &[u16], results: &mut [u16]) {
        let capacity = c_int::try_from(results.len()).unwrap_or(c_int::MAX);
        unsafe { (self.find_lstn)(board_index, probes.as_ptr(), results.as_mut_ptr(), capacity) };

        let found = self.last_count().min(results.len());
        for raw in &mut results[..found] {
            let [primary, secondary] = raw.to_le_bytes();
            *raw = u16::from_le_bytes([primary, decode_secondary(secondary)]);
        }
    }

    fn version_string(&self) -> String {
        let Some(ibvers) = self.ibvers else {
            return "unknown".to_string();
        };
        let mut version: *mut c_char = std::ptr::null_mut();
        unsafe { ibvers(&mut version) };
        if version.is_null() {
            return "unknown".to_string();
        }
        unsafe { CStr::from_ptr(version) }.to_string_lossy().into_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_secondary_mapping() {
        assert_eq!(encode_secondary(0), 0);
        assert_eq!(encode_secondary(1), 0x60);
        assert_eq!(encode_secondary(31), 0x7E);
        for secondary in 1..=31 {
            assert_eq!(decode_secondary(encode_secondary(secondary)), secondary);
        }
        assert_eq!(decode_secondary(0), 0);
    }

    #[test]
    fn test_status_keeps_low_word() {
        let word = status(0x0001_2100);
        assert!(word.contains(StatusWord::END));
        assert!(word.contains(StatusWord::CMPL));
    }

    #[test]
    fn test_missing_library_is_reported() {
        let result = NativeBus::load("/nonexistent/libgpib-missing.so");
        assert!(matches!(result, Err(GpibError::Library(_))));
    }
}
