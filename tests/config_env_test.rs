//! Environment overrides for GpibConfig
//!
//! Kept in its own test binary: the variables are process-wide.

use std::io::Write;

use rust_gpib::address::{LineTerminator, TimeoutLevel};
use rust_gpib::config::{ConfigError, GpibConfig};
use tempfile::NamedTempFile;

#[test]
fn test_environment_overrides_file() {
    let mut file = NamedTempFile::new().unwrap();
    writeln!(file, "log_level = \"warn\"\n\n[bus]\nboard_index = 2\nterminator = \"cr\"").unwrap();

    std::env::set_var("RUST_GPIB_BUS__BOARD_INDEX", "1");
    std::env::set_var("RUST_GPIB_BUS__TIMEOUT", "3s");
    std::env::set_var("RUST_GPIB_REGISTRY__IDLE_THRESHOLD_SECS", "30");
    let config = GpibConfig::load_from(file.path()).unwrap();

    assert_eq!(config.log_level, "warn");
    assert_eq!(config.bus.board_index, 1);
    assert_eq!(config.bus.timeout, TimeoutLevel::T3s);
    assert_eq!(config.bus.terminator, LineTerminator::Cr);
    assert_eq!(config.registry.idle_threshold_secs, 30);

    std::env::set_var("RUST_GPIB_SCAN__MIN_PRIMARY", "0");
    let err = GpibConfig::load_from(file.path()).unwrap_err();
    assert!(matches!(err, ConfigError::ValidationError(_)));

    for key in [
        "RUST_GPIB_BUS__BOARD_INDEX",
        "RUST_GPIB_BUS__TIMEOUT",
        "RUST_GPIB_REGISTRY__IDLE_THRESHOLD_SECS",
        "RUST_GPIB_SCAN__MIN_PRIMARY",
    ] {
        std::env::remove_var(key);
    }
}
