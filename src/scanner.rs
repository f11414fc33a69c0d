//! Listener discovery.
//!
//! [`BusScanner`] probes a range of primary addresses through the raw
//! discovery primitive and decodes the result words into addresses.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::address::{InstrumentAddress, MAX_PRIMARY, MAX_SECONDARY, MIN_PRIMARY};
use crate::bus::{RawBusInterface, NO_ADDRESS};
use crate::error::{GpibError, GpibResult};

/// Result slots reserved per probed primary address, one per possible secondary.
pub const RESULTS_PER_PRIMARY: usize = MAX_SECONDARY as usize + 1;

/// Decoded discovery result together with what the driver claimed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanOutcome {
    /// Addresses in scan order, at most `max_results` of them.
    pub addresses: Vec<InstrumentAddress>,
    /// Listener count reported by the driver before clamping.
    pub reported: usize,
    /// True when `reported` exceeded the result buffer and entries were dropped.
    pub truncated: bool,
}

/// Enumerates listeners on one board.
pub struct BusScanner {
    bus: Arc<dyn RawBusInterface>,
    board_index: i32,
}

impl BusScanner {
    /// Scanner for `board_index` on `bus`.
    pub fn new(bus: Arc<dyn RawBusInterface>, board_index: i32) -> Self {
        Self { bus, board_index }
    }

    /// Board this scanner probes.
    pub fn board_index(&self) -> i32 {
        self.board_index
    }

    /// Addresses of the listeners answering in `min_primary..=max_primary`.
    ///
    /// If the driver reports more listeners than the result buffer holds
    /// (`32` per probed primary), the list is cut to the buffer size without
    /// signalling it. Use [`scan`](Self::scan) to see whether that happened.
    ///
    /// # Errors
    /// Returns `InvalidRange` unless `1 <= min_primary <= max_primary <= 30`.
    pub fn discover(&self, min_primary: u8, max_primary: u8) -> GpibResult<Vec<InstrumentAddress>> {
        self.scan(min_primary, max_primary)
            .map(|outcome| outcome.addresses)
    }

    /// As [`discover`](Self::discover), also reporting the raw count and truncation.
    ///
    /// # Errors
    /// Returns `InvalidRange` unless `1 <= min_primary <= max_primary <= 30`.
    pub fn scan(&self, min_primary: u8, max_primary: u8) -> GpibResult<ScanOutcome> {
        let valid = MIN_PRIMARY..=MAX_PRIMARY;
        if !valid.contains(&min_primary) || !valid.contains(&max_primary) || min_primary > max_primary
        {
            return Err(GpibError::InvalidRange {
                min: min_primary,
                max: max_primary,
            });
        }

        let mut probes: Vec<u16> = (min_primary..=max_primary).map(u16::from).collect();
        let probed = probes.len();
        probes.push(NO_ADDRESS);

        let max_results = probed * RESULTS_PER_PRIMARY;
        let mut results = vec![0u16; max_results];

        self.bus.discover(self.board_index, &probes, &mut results);
        let reported = self.bus.last_count();
        let found = reported.min(max_results);
        let truncated = reported > max_results;

        if truncated {
            warn!(
                board_index = self.board_index,
                reported,
                kept = max_results,
                "Driver reported more listeners than the result buffer holds; extra entries dropped"
            );
        }

        let addresses: Vec<InstrumentAddress> = results[..found]
            .iter()
            .map(|&raw| InstrumentAddress::from_raw(raw))
            .collect();

        debug!(
            board_index = self.board_index,
            min_primary,
            max_primary,
            found = addresses.len(),
            "Bus scan complete"
        );

        Ok(ScanOutcome {
            addresses,
            reported,
            truncated,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{BusCall, SimulatedBus};
    use tracing_test::traced_test;

    fn scanner(bus: &Arc<SimulatedBus>) -> BusScanner {
        BusScanner::new(bus.clone(), 0)
    }

    #[test]
    fn test_range_validation() {
        let bus = Arc::new(SimulatedBus::new());
        let scanner = scanner(&bus);
        for (min, max) in [(0, 5), (1, 31), (10, 9), (31, 31)] {
            assert!(
                matches!(scanner.discover(min, max), Err(GpibError::InvalidRange { .. })),
                "{min}..={max}"
            );
        }
        assert_eq!(bus.call_count(), 0);
    }

    #[test]
    fn test_probe_list_and_buffer_size() {
        let bus = Arc::new(SimulatedBus::new());
        scanner(&bus).discover(3, 5).unwrap();
        assert_eq!(
            bus.calls(),
            vec![BusCall::Discover {
                board_index: 0,
                probes: vec![3, 4, 5, NO_ADDRESS],
                capacity: 3 * 32,
            }]
        );
    }

    #[test]
    fn test_decode_low_byte_primary() {
        let bus = Arc::new(SimulatedBus::new());
        bus.script_discovery(vec![0x0205, 0x0007], 2);
        let found = scanner(&bus).discover(1, 30).unwrap();
        assert_eq!(found.len(), 2);
        assert_eq!((found[0].primary(), found[0].secondary()), (5, 2));
        assert_eq!((found[1].primary(), found[1].secondary()), (7, 0));
    }

    #[test]
    fn test_over_report_is_clamped() {
        let bus = Arc::new(SimulatedBus::new());
        let raw: Vec<u16> = (0..40u16).map(|i| (i << 8) | 1).collect();
        bus.script_discovery(raw, 40);

        let outcome = scanner(&bus).scan(1, 1).unwrap();
        assert_eq!(outcome.reported, 40);
        assert!(outcome.truncated);
        assert_eq!(outcome.addresses.len(), 32);
        for (i, address) in outcome.addresses.iter().enumerate() {
            assert_eq!(address.secondary() as usize, i);
        }
    }

    #[test]
    #[traced_test]
    fn test_truncation_is_logged_but_discover_stays_silent() {
        let bus = Arc::new(SimulatedBus::new());
        bus.script_discovery(vec![0x0001; 40], 40);

        let found = scanner(&bus).discover(1, 1).unwrap();
        assert_eq!(found.len(), 32);
        assert!(logs_contain("extra entries dropped"));
    }
}
