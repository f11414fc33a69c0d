//! Integration tests for BusScanner
//!
//! Discovery runs against the simulated bus, then every address found is
//! queried through a registry built from configuration, the same way the
//! discovery tool does it.

use std::sync::Arc;

use rust_gpib::address::InstrumentAddress;
use rust_gpib::bus::{SimulatedBus, SimulatedInstrument};
use rust_gpib::config::GpibConfig;
use rust_gpib::{BusScanner, GpibError, SessionRegistry};
use tokio_util::sync::CancellationToken;

fn bench() -> Arc<SimulatedBus> {
    let bus = SimulatedBus::new()
        .with_instrument(
            InstrumentAddress::primary_only(4).unwrap(),
            SimulatedInstrument::new().respond("*IDN?", "ACME,DMM,4,1.0"),
        )
        .with_instrument(
            InstrumentAddress::primary_only(17).unwrap(),
            SimulatedInstrument::new().respond("*IDN?", "ACME,PSU,17,1.0"),
        )
        .with_instrument(
            InstrumentAddress::new(17, 2).unwrap(),
            SimulatedInstrument::new().respond("*IDN?", "ACME,MUX,17-2,1.0"),
        );
    Arc::new(bus)
}

#[test]
fn test_discover_in_scan_order() {
    let bus = bench();
    let scanner = BusScanner::new(bus, 0);

    let found = scanner.discover(1, 30).unwrap();
    let decoded: Vec<(u8, u8)> = found.iter().map(|a| (a.primary(), a.secondary())).collect();
    assert_eq!(decoded, vec![(4, 0), (17, 0), (17, 2)]);
}

#[test]
fn test_discover_respects_range() {
    let bus = bench();
    let scanner = BusScanner::new(bus, 0);
    let found = scanner.discover(10, 20).unwrap();
    assert!(found.iter().all(|a| a.primary() == 17));
    assert_eq!(found.len(), 2);
}

#[test]
fn test_single_address_scan_truncates_to_32() {
    let bus = Arc::new(SimulatedBus::new());
    let raw: Vec<u16> = (0..40).map(|i| 0x0005 | (i << 8)).collect();
    bus.script_discovery(raw.clone(), 40);

    let found = BusScanner::new(bus, 0).discover(1, 1).unwrap();
    assert_eq!(found.len(), 32);
    for (address, raw) in found.iter().zip(&raw) {
        assert_eq!(*address, InstrumentAddress::from_raw(*raw));
    }
}

#[test]
fn test_invalid_range_reported() {
    let bus = bench();
    let err = BusScanner::new(bus, 0).discover(12, 3).unwrap_err();
    assert!(matches!(err, GpibError::InvalidRange { min: 12, max: 3 }));
}

#[tokio::test]
async fn test_scan_then_identify_through_registry() {
    let bus = bench();
    let config = GpibConfig::default();
    let scanner = BusScanner::new(bus.clone(), config.bus.board_index);
    let addresses = scanner
        .discover(config.scan.min_primary, config.scan.max_primary)
        .unwrap();

    let registry = SessionRegistry::from_config(bus.clone(), &config);
    let cancel = CancellationToken::new();
    let mut responses = Vec::new();
    for address in &addresses {
        let idn = registry
            .execute(
                *address,
                |s| {
                    Box::pin(async move {
                        s.clear()?;
                        s.query::<String>("*IDN?")
                    })
                },
                &cancel,
            )
            .await
            .unwrap();
        responses.push(idn);
    }

    assert_eq!(
        responses,
        vec!["ACME,DMM,4,1.0", "ACME,PSU,17,1.0", "ACME,MUX,17-2,1.0"]
    );
    assert_eq!(registry.session_count(), 3);

    registry.dispose().await;
    assert_eq!(bus.online_sessions(), 0);
}
