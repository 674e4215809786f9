//! Configuration file management for filament-hub.
//!
//! Handles loading the daemon configuration from a YAML file selected with
//! `-c <path>`. The configuration covers the CAN bus, the Klipper/Moonraker
//! endpoint, runout sensors, the extruder-to-tube mapping, RFID handling,
//! and logging.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

/// Default CAN bitrate (1 Mbps), matching the cabinet firmware default.
pub const DEFAULT_CAN_BITRATE: u32 = 1_000_000;

/// Default Moonraker endpoint on the local host.
pub const DEFAULT_KLIPPER_URL: &str = "ws://127.0.0.1:7125/websocket";

/// Application configuration loaded from the `-c` YAML file.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// CAN bus settings.
    #[serde(default)]
    pub can: CanConfig,
    /// Klipper/Moonraker connection settings.
    #[serde(default)]
    pub klipper: KlipperConfig,
    /// Filament runout supervision settings.
    #[serde(default)]
    pub filament_runout: FilamentRunoutConfig,
    /// Extruder to cabinet tube mapping.
    #[serde(default)]
    pub extruder_mapping: ExtruderMappingConfig,
    /// RFID transfer and record settings.
    #[serde(default)]
    pub rfid: RfidConfig,
    /// Logging settings.
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// CAN bus settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CanConfig {
    /// CAN network device to open (e.g. `can0`).
    #[serde(default = "default_can_interface")]
    pub interface: String,
    /// Bus speed in bits per second. Informational: the kernel interface is
    /// expected to be configured already (`ip link set can0 ... bitrate`).
    #[serde(default = "default_can_bitrate")]
    pub bitrate: u32,
}

/// Klipper/Moonraker connection settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct KlipperConfig {
    /// Moonraker WebSocket endpoint.
    #[serde(default = "default_klipper_url")]
    pub base_url: String,
    /// Pacing of periodic full-status queries, in seconds. Status is pushed
    /// by Moonraker; this is a safety net against silently stale state.
    #[serde(default = "default_update_interval")]
    pub update_interval: f64,
}

/// Filament runout supervision settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FilamentRunoutConfig {
    /// Gate for runout handling. When false, sensor transitions are observed
    /// but never pause a print.
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Names of the `filament_switch_sensor` objects to watch, indexed by
    /// extruder: entry 0 watches extruder 0, entry 1 extruder 1.
    #[serde(default = "default_sensors")]
    pub sensors: Vec<String>,
}

/// Extruder to cabinet tube mapping.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ExtruderMappingConfig {
    /// Extruder selected when the cabinet does not name one.
    #[serde(default)]
    pub default_active: u8,
    /// Map from extruder id to cabinet buffer-zone (tube) id.
    #[serde(default = "default_tube_mapping")]
    pub tube_mapping: BTreeMap<u8, u8>,
}

/// RFID transfer and record settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RfidConfig {
    /// Gate for RFID session handling.
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Apply hotend/bed temperatures from a parsed record via G-code.
    #[serde(default)]
    pub auto_set_temperature: bool,
    /// Directory for persisted filament records.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    /// Seconds without session progress before the transfer is cancelled.
    #[serde(default = "default_transfer_timeout")]
    pub transfer_timeout_seconds: u64,
    /// Seconds between reaper sweeps over active sessions.
    #[serde(default = "default_cleanup_interval")]
    pub cleanup_interval_seconds: u64,
}

/// Logging settings.
///
/// `level` and `log_dir` are honored in-process; the size/backup/retention
/// knobs describe the host's logrotate policy and are only validated here.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LoggingConfig {
    /// Minimum level: `error`, `warn`, `info`, `debug`, or `trace`.
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Directory for the rolling log file. Absent means stderr only.
    #[serde(default)]
    pub log_dir: Option<PathBuf>,
    /// Maximum size of one log file in MiB (logrotate hint).
    #[serde(default = "default_max_size_mb")]
    pub max_size_mb: u64,
    /// Number of rotated files to keep (logrotate hint).
    #[serde(default = "default_backup_count")]
    pub backup_count: u32,
    /// Days of logs to retain (logrotate hint).
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,
}

fn default_can_interface() -> String {
    "can0".to_string()
}

fn default_can_bitrate() -> u32 {
    DEFAULT_CAN_BITRATE
}

fn default_klipper_url() -> String {
    DEFAULT_KLIPPER_URL.to_string()
}

fn default_update_interval() -> f64 {
    5.0
}

fn default_true() -> bool {
    true
}

fn default_sensors() -> Vec<String> {
    vec!["filament_sensor_0".to_string()]
}

fn default_tube_mapping() -> BTreeMap<u8, u8> {
    BTreeMap::from([(0, 0)])
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("/var/lib/filament-hub")
}

fn default_transfer_timeout() -> u64 {
    10
}

fn default_cleanup_interval() -> u64 {
    5
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_max_size_mb() -> u64 {
    10
}

fn default_backup_count() -> u32 {
    5
}

fn default_retention_days() -> u32 {
    7
}

impl Default for CanConfig {
    fn default() -> Self {
        Self {
            interface: default_can_interface(),
            bitrate: default_can_bitrate(),
        }
    }
}

impl Default for KlipperConfig {
    fn default() -> Self {
        Self {
            base_url: default_klipper_url(),
            update_interval: default_update_interval(),
        }
    }
}

impl Default for FilamentRunoutConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            sensors: default_sensors(),
        }
    }
}

impl Default for ExtruderMappingConfig {
    fn default() -> Self {
        Self {
            default_active: 0,
            tube_mapping: default_tube_mapping(),
        }
    }
}

impl Default for RfidConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            auto_set_temperature: false,
            data_dir: default_data_dir(),
            transfer_timeout_seconds: default_transfer_timeout(),
            cleanup_interval_seconds: default_cleanup_interval(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            log_dir: None,
            max_size_mb: default_max_size_mb(),
            backup_count: default_backup_count(),
            retention_days: default_retention_days(),
        }
    }
}

impl Config {
    /// Loads and validates the configuration from `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, is not valid YAML, or
    /// fails [`Config::validate`]. Startup treats any of these as fatal.
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        config.validate()?;
        Ok(config)
    }

    /// Checks cross-field invariants the type system cannot express.
    pub fn validate(&self) -> Result<()> {
        if self.can.interface.is_empty() {
            anyhow::bail!("can.interface must not be empty");
        }
        if self.can.bitrate == 0 {
            anyhow::bail!("can.bitrate must be positive");
        }
        if !(self.klipper.update_interval > 0.0) {
            anyhow::bail!("klipper.update_interval must be positive");
        }
        if self.filament_runout.enabled && self.filament_runout.sensors.is_empty() {
            anyhow::bail!("filament_runout.sensors must name at least one sensor when enabled");
        }
        if self.rfid.transfer_timeout_seconds == 0 {
            anyhow::bail!("rfid.transfer_timeout_seconds must be positive");
        }
        if self.rfid.cleanup_interval_seconds == 0 {
            anyhow::bail!("rfid.cleanup_interval_seconds must be positive");
        }

        // The mapping must cover every watched extruder, with pairwise
        // distinct buffer zones.
        let mapping = &self.extruder_mapping.tube_mapping;
        if mapping.is_empty() {
            anyhow::bail!("extruder_mapping.tube_mapping must not be empty");
        }
        for extruder in 0..self.filament_runout.sensors.len() as u8 {
            if !mapping.contains_key(&extruder) {
                anyhow::bail!("extruder_mapping.tube_mapping has no entry for extruder {extruder}");
            }
        }
        let mut zones: Vec<u8> = mapping.values().copied().collect();
        zones.sort_unstable();
        zones.dedup();
        if zones.len() != mapping.len() {
            anyhow::bail!("extruder_mapping.tube_mapping assigns a buffer zone twice");
        }
        // Zones are reported in an 8-bit presence bitmap.
        if let Some(zone) = zones.iter().find(|&&zone| zone > 7) {
            anyhow::bail!("extruder_mapping.tube_mapping zone {zone} exceeds the supported 0..=7");
        }
        if !mapping.contains_key(&self.extruder_mapping.default_active) {
            anyhow::bail!(
                "extruder_mapping.default_active {} is not in tube_mapping",
                self.extruder_mapping.default_active
            );
        }

        match self.logging.level.as_str() {
            "error" | "warn" | "info" | "debug" | "trace" => {}
            other => anyhow::bail!("logging.level {other:?} is not a valid level"),
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(yaml: &str) -> Config {
        serde_yaml::from_str(yaml).expect("valid yaml")
    }

    mod defaults_tests {
        use super::*;

        #[test]
        fn empty_document_yields_defaults() {
            let config = parse("{}");
            assert_eq!(config.can.interface, "can0");
            assert_eq!(config.can.bitrate, DEFAULT_CAN_BITRATE);
            assert_eq!(config.klipper.base_url, DEFAULT_KLIPPER_URL);
            assert!(config.filament_runout.enabled);
            assert_eq!(config.rfid.transfer_timeout_seconds, 10);
            assert!(config.logging.log_dir.is_none());
            config.validate().expect("defaults validate");
        }

        #[test]
        fn partial_section_keeps_other_defaults() {
            let config = parse("can:\n  interface: can1\n");
            assert_eq!(config.can.interface, "can1");
            assert_eq!(config.can.bitrate, DEFAULT_CAN_BITRATE);
        }
    }

    mod validate_tests {
        use super::*;

        #[test]
        fn rejects_duplicate_buffer_zones() {
            let config = parse(
                "extruder_mapping:\n  tube_mapping:\n    0: 3\n    1: 3\n\
                 filament_runout:\n  sensors: [a, b]\n",
            );
            assert!(config.validate().is_err());
        }

        #[test]
        fn rejects_unmapped_sensor_extruder() {
            let config = parse(
                "extruder_mapping:\n  tube_mapping:\n    0: 0\n\
                 filament_runout:\n  sensors: [a, b]\n",
            );
            assert!(config.validate().is_err());
        }

        #[test]
        fn rejects_default_active_outside_mapping() {
            let config =
                parse("extruder_mapping:\n  default_active: 5\n  tube_mapping:\n    0: 0\n");
            assert!(config.validate().is_err());
        }

        #[test]
        fn rejects_zone_beyond_the_bitmap() {
            let config = parse("extruder_mapping:\n  tube_mapping:\n    0: 9\n  default_active: 0\n");
            assert!(config.validate().is_err());
        }

        #[test]
        fn rejects_bad_log_level() {
            let config = parse("logging:\n  level: verbose\n");
            assert!(config.validate().is_err());
        }

        #[test]
        fn accepts_dual_extruder_layout() {
            let config = parse(
                "filament_runout:\n  sensors: [filament_sensor_0, filament_sensor_1]\n\
                 extruder_mapping:\n  default_active: 0\n  tube_mapping:\n    0: 0\n    1: 1\n",
            );
            config.validate().expect("dual extruder config validates");
        }

        #[test]
        fn allows_disabled_runout_without_sensors() {
            let config = parse("filament_runout:\n  enabled: false\n  sensors: []\n");
            config.validate().expect("disabled runout validates");
        }
    }
}
