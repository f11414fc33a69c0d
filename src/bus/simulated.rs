//! Simulated GPIB bus for testing
//!
//! This bus provides an in-process stand-in for the driver so sessions, the
//! registry and the scanner can be exercised without hardware. It provides:
//! - Scripted instruments that answer queries and report a status byte
//! - One-shot fault injection (TIMO / ERR with an error code)
//! - Scripted discovery results, including over-reported counts
//! - Call logging for test verification
//!
//! Sticky registers are kept per thread, the same way the real driver does.

use std::cell::Cell;
use std::collections::{HashMap, VecDeque};

use parking_lot::Mutex;

use super::{ErrorCode, RawBusInterface, StatusByte, StatusWord, NO_ADDRESS};
use crate::address::{EosMode, InstrumentAddress, TimeoutLevel};

#[derive(Debug, Clone, Copy)]
struct Registers {
    status: StatusWord,
    error: i32,
    count: usize,
}

thread_local! {
    static REGISTERS: Cell<Registers> = const {
        Cell::new(Registers {
            status: StatusWord::empty(),
            error: 0,
            count: 0,
        })
    };
}

fn set_registers(status: StatusWord, error: i32, count: usize) -> StatusWord {
    REGISTERS.with(|r| {
        r.set(Registers {
            status,
            error,
            count,
        })
    });
    status
}

fn fail(code: ErrorCode) -> StatusWord {
    set_registers(StatusWord::ERR, code.raw(), 0)
}

/// One recorded raw call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BusCall {
    /// `open`
    Open {
        /// Board index.
        board_index: i32,
        /// Primary address.
        primary: u8,
        /// Secondary address.
        secondary: u8,
        /// Timeout level.
        timeout: TimeoutLevel,
    },
    /// `take_offline`
    TakeOffline {
        /// Session descriptor.
        descriptor: i32,
        /// Online value.
        value: i32,
    },
    /// `write`
    Write {
        /// Session descriptor.
        descriptor: i32,
        /// Bytes written.
        data: Vec<u8>,
    },
    /// `read`
    Read {
        /// Session descriptor.
        descriptor: i32,
        /// Capacity of the caller's buffer.
        capacity: usize,
    },
    /// `clear`
    Clear {
        /// Session descriptor.
        descriptor: i32,
    },
    /// `serial_poll`
    SerialPoll {
        /// Session descriptor.
        descriptor: i32,
    },
    /// `discover`
    Discover {
        /// Board index.
        board_index: i32,
        /// Probe list including the terminator.
        probes: Vec<u16>,
        /// Capacity of the result buffer.
        capacity: usize,
    },
}

/// A scripted instrument attached to the simulated bus.
///
/// # Example
///
/// ```
/// use rust_gpib::bus::SimulatedInstrument;
///
/// let dmm = SimulatedInstrument::new()
///     .respond("*IDN?", "ACME,DMM-1,0001,1.0")
///     .respond("MEAS:VOLT?", "+1.234500E+00");
/// ```
#[derive(Debug, Clone, Default)]
pub struct SimulatedInstrument {
    responses: HashMap<String, String>,
    output: VecDeque<u8>,
    status: StatusByte,
    poll_delay: usize,
    polls_remaining: usize,
    suppress_end: bool,
    written: Vec<Vec<u8>>,
}

impl SimulatedInstrument {
    /// Instrument with no scripted responses.
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer `command` (terminator stripped) with `response` followed by `\n`.
    pub fn respond(mut self, command: &str, response: &str) -> Self {
        self.responses
            .insert(command.to_string(), response.to_string());
        self
    }

    /// Extra status byte bits reported by serial polls.
    pub fn with_status(mut self, status: StatusByte) -> Self {
        self.status = status;
        self
    }

    /// Number of serial polls that report no MAV after each new response.
    pub fn with_poll_delay(mut self, polls: usize) -> Self {
        self.poll_delay = polls;
        self
    }

    /// Never assert END, so reads only stop on an empty transfer.
    pub fn without_end(mut self) -> Self {
        self.suppress_end = true;
        self
    }

    fn queue(&mut self, bytes: &[u8]) {
        self.output.extend(bytes);
        self.polls_remaining = self.poll_delay;
    }

    fn handle_write(&mut self, data: &[u8]) {
        self.written.push(data.to_vec());
        let command: String = data
            .iter()
            .map(|&b| char::from(b))
            .collect::<String>()
            .trim_end_matches(['\r', '\n'])
            .to_string();
        if let Some(response) = self.responses.get(&command).cloned() {
            self.queue(response.as_bytes());
            self.queue(b"\n");
        }
    }

    fn poll(&mut self) -> StatusByte {
        let mut byte = self.status;
        // RQS is cleared once it has been reported
        self.status.remove(StatusByte::RQS);
        if self.polls_remaining > 0 {
            self.polls_remaining -= 1;
        } else if !self.output.is_empty() {
            byte |= StatusByte::MAV;
        }
        byte
    }
}

#[derive(Debug, Clone, Copy)]
struct SessionState {
    address: InstrumentAddress,
    online: bool,
}

#[derive(Debug, Clone, Copy)]
struct Fault {
    status: StatusWord,
    error_code: i32,
}

#[derive(Debug, Default)]
struct BusState {
    instruments: HashMap<InstrumentAddress, SimulatedInstrument>,
    sessions: HashMap<i32, SessionState>,
    next_descriptor: i32,
    fail_open: bool,
    faults: VecDeque<Fault>,
    calls: Vec<BusCall>,
    offline_counts: HashMap<i32, usize>,
    discovery: Option<(Vec<u16>, usize)>,
}

impl BusState {
    fn take_fault(&mut self) -> Option<StatusWord> {
        self.faults
            .pop_front()
            .map(|f| set_registers(f.status, f.error_code, 0))
    }

    fn instrument(&mut self, descriptor: i32) -> Result<&mut SimulatedInstrument, ErrorCode> {
        let session = match self.sessions.get(&descriptor) {
            Some(s) if s.online => *s,
            _ => return Err(ErrorCode::Edvr),
        };
        self.instruments
            .get_mut(&session.address)
            .ok_or(ErrorCode::Enol)
    }
}

/// In-process implementation of [`RawBusInterface`].
///
/// # Example
///
/// ```
/// use rust_gpib::address::InstrumentAddress;
/// use rust_gpib::bus::{SimulatedBus, SimulatedInstrument};
///
/// let bus = SimulatedBus::new();
/// bus.attach(
///     InstrumentAddress::primary_only(5).unwrap(),
///     SimulatedInstrument::new().respond("*IDN?", "ACME,PSU,1,1.0"),
/// );
/// assert_eq!(bus.call_count(), 0);
/// ```
#[derive(Debug)]
pub struct SimulatedBus {
    state: Mutex<BusState>,
}

impl Default for SimulatedBus {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedBus {
    /// Empty bus with no instruments.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(BusState {
                next_descriptor: 16,
                ..BusState::default()
            }),
        }
    }

    /// Attach (or replace) an instrument at `address`.
    pub fn attach(&self, address: InstrumentAddress, instrument: SimulatedInstrument) {
        self.state.lock().instruments.insert(address, instrument);
    }

    /// Builder form of [`attach`](Self::attach).
    pub fn with_instrument(self, address: InstrumentAddress, instrument: SimulatedInstrument) -> Self {
        self.attach(address, instrument);
        self
    }

    /// Queue raw bytes in an instrument's output buffer.
    pub fn push_output(&self, address: InstrumentAddress, bytes: &[u8]) {
        if let Some(instrument) = self.state.lock().instruments.get_mut(&address) {
            instrument.queue(bytes);
        }
    }

    /// Replace the extra status byte bits of an instrument.
    pub fn set_status_byte(&self, address: InstrumentAddress, status: StatusByte) {
        if let Some(instrument) = self.state.lock().instruments.get_mut(&address) {
            instrument.status = status;
        }
    }

    /// Make every subsequent `open` fail with a negative descriptor.
    pub fn set_fail_open(&self, fail_open: bool) {
        self.state.lock().fail_open = fail_open;
    }

    /// Apply `status` and `error_code` to the next write, read, clear or serial poll.
    pub fn inject_fault(&self, status: StatusWord, error_code: i32) {
        self.state.lock().faults.push_back(Fault { status, error_code });
    }

    /// Shorthand for a TIMO fault (the driver reports EABO alongside).
    pub fn inject_timeout(&self) {
        self.inject_fault(StatusWord::TIMO | StatusWord::ERR, ErrorCode::Eabo.raw());
    }

    /// Shorthand for an ERR fault with `code`.
    pub fn inject_error(&self, code: ErrorCode) {
        self.inject_fault(StatusWord::ERR, code.raw());
    }

    /// Report `results` from the next discoveries and set the count register to `reported`.
    pub fn script_discovery(&self, results: Vec<u16>, reported: usize) {
        self.state.lock().discovery = Some((results, reported));
    }

    /// Every raw call recorded so far.
    pub fn calls(&self) -> Vec<BusCall> {
        self.state.lock().calls.clone()
    }

    /// Number of raw calls recorded so far.
    pub fn call_count(&self) -> usize {
        self.state.lock().calls.len()
    }

    /// Forget recorded calls.
    pub fn clear_calls(&self) {
        self.state.lock().calls.clear();
    }

    /// How often `descriptor` was taken offline.
    pub fn offline_count(&self, descriptor: i32) -> usize {
        self.state
            .lock()
            .offline_counts
            .get(&descriptor)
            .copied()
            .unwrap_or(0)
    }

    /// Total number of offline calls across all descriptors.
    pub fn total_offline_count(&self) -> usize {
        self.state.lock().offline_counts.values().sum()
    }

    /// Number of sessions opened and still online.
    pub fn online_sessions(&self) -> usize {
        self.state
            .lock()
            .sessions
            .values()
            .filter(|s| s.online)
            .count()
    }

    /// Writes received by the instrument at `address`.
    pub fn written(&self, address: InstrumentAddress) -> Vec<Vec<u8>> {
        self.state
            .lock()
            .instruments
            .get(&address)
            .map(|i| i.written.clone())
            .unwrap_or_default()
    }
}

impl RawBusInterface for SimulatedBus {
    fn open(
        &self,
        board_index: i32,
        primary: u8,
        secondary: u8,
        timeout: TimeoutLevel,
        _assert_eoi: bool,
        _eos: EosMode,
    ) -> i32 {
        let mut state = self.state.lock();
        state.calls.push(BusCall::Open {
            board_index,
            primary,
            secondary,
            timeout,
        });
        if state.fail_open || board_index < 0 {
            fail(ErrorCode::Eneb);
            return -1;
        }
        let address = match InstrumentAddress::new(primary, secondary) {
            Ok(address) => address,
            Err(_) => {
                fail(ErrorCode::Earg);
                return -1;
            }
        };
        let descriptor = state.next_descriptor;
        state.next_descriptor += 1;
        state.sessions.insert(
            descriptor,
            SessionState {
                address,
                online: true,
            },
        );
        set_registers(StatusWord::CMPL, 0, 0);
        descriptor
    }

    fn take_offline(&self, descriptor: i32, value: i32) -> StatusWord {
        let mut state = self.state.lock();
        state.calls.push(BusCall::TakeOffline { descriptor, value });
        *state.offline_counts.entry(descriptor).or_default() += 1;
        match state.sessions.get_mut(&descriptor) {
            Some(session) => {
                session.online = value != 0;
                set_registers(StatusWord::CMPL, 0, 0)
            }
            None => fail(ErrorCode::Edvr),
        }
    }

    fn write(&self, descriptor: i32, data: &[u8]) -> StatusWord {
        let mut state = self.state.lock();
        state.calls.push(BusCall::Write {
            descriptor,
            data: data.to_vec(),
        });
        if let Some(status) = state.take_fault() {
            return status;
        }
        match state.instrument(descriptor) {
            Ok(instrument) => {
                instrument.handle_write(data);
                set_registers(StatusWord::CMPL, 0, data.len())
            }
            Err(code) => fail(code),
        }
    }

    fn read(&self, descriptor: i32, buffer: &mut [u8]) -> StatusWord {
        let mut state = self.state.lock();
        state.calls.push(BusCall::Read {
            descriptor,
            capacity: buffer.len(),
        });
        if let Some(status) = state.take_fault() {
            return status;
        }
        match state.instrument(descriptor) {
            Ok(instrument) => {
                let count = buffer.len().min(instrument.output.len());
                for (slot, byte) in buffer.iter_mut().zip(instrument.output.drain(..count)) {
                    *slot = byte;
                }
                let mut status = StatusWord::CMPL;
                if count > 0 && instrument.output.is_empty() && !instrument.suppress_end {
                    status |= StatusWord::END;
                }
                set_registers(status, 0, count)
            }
            Err(code) => fail(code),
        }
    }

    fn clear(&self, descriptor: i32) -> StatusWord {
        let mut state = self.state.lock();
        state.calls.push(BusCall::Clear { descriptor });
        if let Some(status) = state.take_fault() {
            return status;
        }
        match state.instrument(descriptor) {
            Ok(instrument) => {
                instrument.output.clear();
                instrument.polls_remaining = 0;
                set_registers(StatusWord::CMPL, 0, 0)
            }
            Err(code) => fail(code),
        }
    }

    fn serial_poll(&self, descriptor: i32) -> u8 {
        let mut state = self.state.lock();
        state.calls.push(BusCall::SerialPoll { descriptor });
        if state.take_fault().is_some() {
            return 0;
        }
        match state.instrument(descriptor) {
            Ok(instrument) => {
                let byte = instrument.poll();
                set_registers(StatusWord::CMPL, 0, 0);
                byte.bits()
            }
            Err(code) => {
                fail(code);
                0
            }
        }
    }

    fn last_status(&self) -> StatusWord {
        REGISTERS.with(|r| r.get().status)
    }

    fn last_error(&self) -> i32 {
        REGISTERS.with(|r| r.get().error)
    }

    fn last_count(&self) -> usize {
        REGISTERS.with(|r| r.get().count)
    }

    fn error_string(&self, code: i32) -> String {
        match ErrorCode::from_raw(code) {
            Some(code) => code.to_string(),
            None => format!("unknown error {code}"),
        }
    }

    fn discover(&self, board_index: i32, probes: &[u16], results: &mut [u16]) {
        let mut state = self.state.lock();
        state.calls.push(BusCall::Discover {
            board_index,
            probes: probes.to_vec(),
            capacity: results.len(),
        });

        let (found, reported) = match &state.discovery {
            Some((scripted, reported)) => (scripted.clone(), *reported),
            None => {
                let mut attached: Vec<InstrumentAddress> =
                    state.instruments.keys().copied().collect();
                attached.sort();
                let found: Vec<u16> = probes
                    .iter()
                    .take_while(|&&p| p != NO_ADDRESS)
                    .flat_map(|&p| {
                        attached
                            .iter()
                            .filter(move |a| u16::from(a.primary()) == p)
                            .map(|a| u16::from_le_bytes([a.primary(), a.secondary()]))
                    })
                    .collect();
                let reported = found.len();
                (found, reported)
            }
        };

        for (slot, raw) in results.iter_mut().zip(found) {
            *slot = raw;
        }
        set_registers(StatusWord::CMPL, 0, reported);
    }

    fn version_string(&self) -> String {
        format!("rust_gpib simulated bus {}", env!("CARGO_PKG_VERSION"))
    }
}
