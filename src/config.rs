//! Configuration using Figment
//!
//! Configuration is loaded from:
//! 1. `config/gpib.toml` (base configuration, optional)
//! 2. Environment variables (prefixed with `RUST_GPIB_`)
//!
//! Every key has a default, so an absent file yields a usable configuration.
//!
//! # Environment Variable Overrides
//!
//! Nested keys are separated by a double underscore:
//!
//! ```text
//! RUST_GPIB_LOG_LEVEL=debug
//! RUST_GPIB_BUS__BOARD_INDEX=1
//! RUST_GPIB_BUS__TIMEOUT=3s
//! RUST_GPIB_REGISTRY__IDLE_THRESHOLD_SECS=60
//! ```
//!
//! # Example
//!
//! ```no_run
//! use rust_gpib::config::GpibConfig;
//!
//! fn main() -> anyhow::Result<()> {
//!     let config = GpibConfig::load()?;
//!     println!("Board: {}", config.bus.board_index);
//!     println!("Scan range: {}..={}", config.scan.min_primary, config.scan.max_primary);
//!     Ok(())
//! }
//! ```

use std::path::Path;
use std::time::Duration;

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::address::{EosFlags, EosMode, LineTerminator, TimeoutLevel, MAX_PRIMARY, MIN_PRIMARY};
use crate::registry::RegistryOptions;
use crate::session::SessionOptions;

/// Default location of the configuration file.
pub const DEFAULT_CONFIG_PATH: &str = "config/gpib.toml";

/// Prefix of environment variable overrides.
pub const ENV_PREFIX: &str = "RUST_GPIB_";

/// Configuration error types
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The file or environment could not be read or did not match the schema.
    #[error("Configuration load error: {0}")]
    LoadError(#[from] figment::Error),
    /// A value was read but is not acceptable.
    #[error("Configuration validation error: {0}")]
    ValidationError(String),
}

/// Top-level configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GpibConfig {
    /// Logging level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Session settings applied to every opened session
    #[serde(default)]
    pub bus: BusConfig,
    /// Session cache settings
    #[serde(default)]
    pub registry: RegistryConfig,
    /// Readiness wait settings
    #[serde(default)]
    pub polling: PollingConfig,
    /// Discovery range
    #[serde(default)]
    pub scan: ScanConfig,
}

/// Bus and session configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BusConfig {
    /// Board (interface) index
    #[serde(default)]
    pub board_index: i32,
    /// I/O timeout level ("none", "10us" ... "100s")
    #[serde(default)]
    pub timeout: TimeoutLevel,
    /// Terminator appended to text writes (none, lf, cr, crlf)
    #[serde(default)]
    pub terminator: LineTerminator,
    /// Assert EOI with the last byte of each write
    #[serde(default = "default_assert_eoi")]
    pub assert_eoi: bool,
    /// End-of-string character
    #[serde(default)]
    pub eos_char: u8,
    /// End-of-string flags (REOS=0x400, XEOS=0x800, BIN=0x1000)
    #[serde(default)]
    pub eos_flags: u16,
}

/// Session registry configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryConfig {
    /// Idle time after which a cached session is evicted
    #[serde(default = "default_idle_threshold")]
    pub idle_threshold_secs: u64,
    /// Period of the idle sweep
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
}

/// Readiness polling configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PollingConfig {
    /// Interval between serial polls in milliseconds
    #[serde(default = "default_poll_interval")]
    pub interval_ms: u64,
    /// Wall-clock budget of a wait in milliseconds
    #[serde(default = "default_poll_timeout")]
    pub timeout_ms: u64,
}

/// Discovery configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanConfig {
    /// Lowest primary address probed
    #[serde(default = "default_min_primary")]
    pub min_primary: u8,
    /// Highest primary address probed
    #[serde(default = "default_max_primary")]
    pub max_primary: u8,
}

// ============================================================================
// Default value functions
// ============================================================================

fn default_log_level() -> String {
    "info".to_string()
}

fn default_assert_eoi() -> bool {
    true
}

fn default_idle_threshold() -> u64 {
    300
}

fn default_sweep_interval() -> u64 {
    60
}

fn default_poll_interval() -> u64 {
    50
}

fn default_poll_timeout() -> u64 {
    5000
}

fn default_min_primary() -> u8 {
    MIN_PRIMARY
}

fn default_max_primary() -> u8 {
    MAX_PRIMARY
}

impl Default for GpibConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            bus: BusConfig::default(),
            registry: RegistryConfig::default(),
            polling: PollingConfig::default(),
            scan: ScanConfig::default(),
        }
    }
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            board_index: 0,
            timeout: TimeoutLevel::default(),
            terminator: LineTerminator::default(),
            assert_eoi: default_assert_eoi(),
            eos_char: 0,
            eos_flags: 0,
        }
    }
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            idle_threshold_secs: default_idle_threshold(),
            sweep_interval_secs: default_sweep_interval(),
        }
    }
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_poll_interval(),
            timeout_ms: default_poll_timeout(),
        }
    }
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            min_primary: default_min_primary(),
            max_primary: default_max_primary(),
        }
    }
}

// ============================================================================
// Configuration Loading and Validation
// ============================================================================

impl GpibConfig {
    /// Load configuration from `config/gpib.toml` and environment variables
    ///
    /// Precedence (highest to lowest):
    /// 1. Environment variables (`RUST_GPIB_` prefix)
    /// 2. `config/gpib.toml`
    /// 3. Built-in defaults
    ///
    /// # Errors
    ///
    /// Returns a ConfigError if:
    /// - The config file exists but cannot be parsed
    /// - Configuration validation fails
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load configuration from a specific file path
    ///
    /// A missing file is not an error; defaults and the environment apply.
    ///
    /// # Errors
    ///
    /// Returns a ConfigError if the file cannot be parsed or is invalid.
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        Self::from_figment(Self::figment(path))
    }

    /// The provider stack used by [`load_from`](Self::load_from).
    pub fn figment<P: AsRef<Path>>(path: P) -> Figment {
        Figment::from(Serialized::defaults(GpibConfig::default()))
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
    }

    /// Extract and validate a configuration from any figment.
    ///
    /// # Errors
    ///
    /// Returns a ConfigError if extraction or validation fails.
    pub fn from_figment(figment: Figment) -> Result<Self, ConfigError> {
        let config: Self = figment.extract().map_err(ConfigError::LoadError)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration after loading
    ///
    /// Checks:
    /// - Log level is valid (trace, debug, info, warn, error)
    /// - Board index is not negative
    /// - EOS flags only use known bits
    /// - Poll interval and sweep interval are non-zero
    /// - Scan bounds are within 1..=30 and ordered
    ///
    /// # Errors
    ///
    /// Returns a ConfigError with a descriptive message for any validation failure.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.log_level.as_str()) {
            return Err(ConfigError::ValidationError(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.log_level,
                valid_levels.join(", ")
            )));
        }

        if self.bus.board_index < 0 {
            return Err(ConfigError::ValidationError(format!(
                "Invalid board_index {}. Must be >= 0",
                self.bus.board_index
            )));
        }

        if EosFlags::from_bits(self.bus.eos_flags).is_none() {
            return Err(ConfigError::ValidationError(format!(
                "Invalid eos_flags {:#06x}. Only REOS (0x400), XEOS (0x800) and BIN (0x1000) are allowed",
                self.bus.eos_flags
            )));
        }

        if self.polling.interval_ms == 0 {
            return Err(ConfigError::ValidationError(
                "Invalid polling.interval_ms 0. Must be > 0".to_string(),
            ));
        }

        if self.registry.sweep_interval_secs == 0 {
            return Err(ConfigError::ValidationError(
                "Invalid registry.sweep_interval_secs 0. Must be > 0".to_string(),
            ));
        }

        let range = MIN_PRIMARY..=MAX_PRIMARY;
        let (min, max) = (self.scan.min_primary, self.scan.max_primary);
        if !range.contains(&min) || !range.contains(&max) || min > max {
            return Err(ConfigError::ValidationError(format!(
                "Invalid scan range {min}..={max}. Bounds must be within {MIN_PRIMARY}..={MAX_PRIMARY} and min <= max"
            )));
        }

        Ok(())
    }

    /// Options for every session the registry opens.
    pub fn session_options(&self) -> SessionOptions {
        SessionOptions {
            board_index: self.bus.board_index,
            timeout: self.bus.timeout,
            terminator: self.bus.terminator,
            assert_eoi: self.bus.assert_eoi,
            eos: EosMode {
                character: self.bus.eos_char,
                flags: EosFlags::from_bits_truncate(self.bus.eos_flags),
            },
        }
    }

    /// Idle sweep timing.
    pub fn registry_options(&self) -> RegistryOptions {
        RegistryOptions {
            idle_threshold: Duration::from_secs(self.registry.idle_threshold_secs),
            sweep_interval: Duration::from_secs(self.registry.sweep_interval_secs),
        }
    }

    /// Interval between serial polls in the wait operations.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.polling.interval_ms)
    }

    /// Budget of a readiness wait.
    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.polling.timeout_ms)
    }

    /// Render the configuration as TOML.
    ///
    /// # Errors
    ///
    /// Returns the serializer error if a value cannot be represented.
    pub fn to_toml(&self) -> Result<String, toml::ser::Error> {
        toml::to_string_pretty(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn write_config(contents: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    fn file_only(path: &Path) -> Result<GpibConfig, ConfigError> {
        GpibConfig::from_figment(
            Figment::from(Serialized::defaults(GpibConfig::default())).merge(Toml::file(path)),
        )
    }

    #[test]
    fn test_defaults_are_valid() {
        let config = GpibConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.session_options(), SessionOptions::default());
        assert_eq!(config.registry_options(), RegistryOptions::default());
        assert_eq!(config.poll_interval(), Duration::from_millis(50));
    }

    #[test]
    fn test_missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = file_only(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(config, GpibConfig::default());
    }

    #[test]
    fn test_partial_file_keeps_other_defaults() {
        let file = write_config(
            r#"
log_level = "debug"

[bus]
board_index = 1
timeout = "3s"
terminator = "crlf"
eos_char = 10
eos_flags = 0x400

[scan]
max_primary = 12
"#,
        );

        let config = file_only(file.path()).unwrap();
        assert_eq!(config.log_level, "debug");
        assert_eq!(config.bus.timeout, TimeoutLevel::T3s);
        assert_eq!(config.scan.min_primary, 1);
        assert_eq!(config.scan.max_primary, 12);
        assert_eq!(config.registry.idle_threshold_secs, 300);

        let options = config.session_options();
        assert_eq!(options.board_index, 1);
        assert_eq!(options.terminator, LineTerminator::CrLf);
        assert_eq!(options.eos, EosMode::terminate_read_on(b'\n'));
    }

    #[test]
    fn test_invalid_log_level() {
        let config = GpibConfig {
            log_level: "verbose".to_string(),
            ..GpibConfig::default()
        };
        let result = config.validate();
        assert!(result
            .unwrap_err()
            .to_string()
            .contains("Invalid log_level"));
    }

    #[test]
    fn test_invalid_scan_range() {
        let mut config = GpibConfig::default();
        config.scan.min_primary = 20;
        config.scan.max_primary = 10;
        assert!(config.validate().is_err());

        config.scan.min_primary = 0;
        config.scan.max_primary = 10;
        assert!(config.validate().is_err());

        config.scan.min_primary = 1;
        config.scan.max_primary = 31;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_invalid_eos_flags() {
        let mut config = GpibConfig::default();
        config.bus.eos_flags = 0x0001;
        let err = config.validate().unwrap_err();
        assert!(matches!(err, ConfigError::ValidationError(_)));
    }

    #[test]
    fn test_zero_intervals_rejected() {
        let mut config = GpibConfig::default();
        config.polling.interval_ms = 0;
        assert!(config.validate().is_err());

        let mut config = GpibConfig::default();
        config.registry.sweep_interval_secs = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_unknown_timeout_name_is_load_error() {
        let file = write_config("[bus]\ntimeout = \"7s\"\n");
        let err = file_only(file.path()).unwrap_err();
        assert!(matches!(err, ConfigError::LoadError(_)));
    }

    #[test]
    fn test_toml_round_trip() {
        let config = GpibConfig::default();
        let text = config.to_toml().unwrap();
        let file = write_config(&text);
        assert_eq!(file_only(file.path()).unwrap(), config);
    }
}
