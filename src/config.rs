//! Configuration related structures.
//!
//! The console keeps its settings in a JSON file whose keys are stable across
//! releases; the file is read on startup and written back on a normal exit so
//! operator adjustments (USB mapping, password hash) survive restarts.

use crate::error::{Error, Result};
use clap::Parser;
use getset::{CopyGetters, Getters};
use log::LevelFilter;
use serde::{Deserialize, Serialize};
use std::{fs, path::Path, path::PathBuf, time::Duration};

/// Number of target device slots on the factory fixture.
pub const TARGET_DEV_SIZE: usize = 6;

#[derive(Debug, Parser)]
#[command(about = "Factory provisioning console for Android Things attestation devices")]
/// Command line front end; everything else lives in the config file.
pub struct Cli {
    /// The path to the JSON configuration file
    #[arg(default_value = "atft_config.json", env = "ATFT_CONFIG", long = "config")]
    pub config: PathBuf,

    /// The logging level of the application
    #[arg(default_value = "info", long = "log-level", short = 'l', value_name = "LEVEL")]
    pub log_level: LevelFilter,

    /// The fastboot binary to drive devices with
    #[arg(default_value = "fastboot", env = "ATFT_FASTBOOT", long = "fastboot")]
    pub fastboot: PathBuf,

    /// Product or SoM attestation descriptor to load at startup
    #[arg(long = "product", value_name = "FILE")]
    pub product: Option<PathBuf>,

    /// Enter automatic provisioning mode immediately
    #[arg(long = "auto")]
    pub auto: bool,
}

fn default_compatible_version() -> String {
    "0".into()
}

fn default_refresh_interval() -> f64 {
    1.0
}

fn default_audit_interval() -> i64 {
    10
}

fn default_language() -> String {
    "eng".into()
}

fn default_attribute_extension() -> String {
    "*.atpa".into()
}

fn default_key_extension() -> String {
    "*.atfa".into()
}

fn default_update_extension() -> String {
    "*.upd".into()
}

fn default_usb_locations() -> Vec<Option<String>> {
    vec![None; TARGET_DEV_SIZE]
}

#[derive(Clone, Debug, Deserialize, Serialize, CopyGetters, Getters)]
/// The persisted console settings.
pub struct Config {
    #[get = "pub"]
    #[serde(rename = "ATFT_VERSION", default)]
    /// The console version that wrote this file.
    atft_version: String,

    #[get = "pub"]
    #[serde(rename = "COMPATIBLE_ATFA_VERSION", default = "default_compatible_version")]
    /// Minimum appliance OS version this console can drive.
    compatible_atfa_version: String,

    #[get_copy = "pub"]
    #[serde(rename = "DEVICE_REFRESH_INTERVAL", default = "default_refresh_interval")]
    /// Device poll interval in seconds.
    device_refresh_interval: f64,

    #[get_copy = "pub"]
    #[serde(rename = "DEFAULT_KEY_THRESHOLD_1", default)]
    /// First low-key warning threshold.
    default_key_threshold_1: Option<i64>,

    #[get_copy = "pub"]
    #[serde(rename = "DEFAULT_KEY_THRESHOLD_2", default)]
    /// Second (more urgent) low-key warning threshold.
    default_key_threshold_2: Option<i64>,

    #[get = "pub"]
    #[serde(rename = "LOG_DIR", default)]
    /// Directory for the rotating operator log.
    log_dir: Option<PathBuf>,

    #[get_copy = "pub"]
    #[serde(rename = "LOG_SIZE", default)]
    /// Maximum total size of all operator log files, in bytes.
    log_size: u64,

    #[get_copy = "pub"]
    #[serde(rename = "LOG_FILE_NUMBER", default)]
    /// Maximum number of operator log files.
    log_file_number: usize,

    #[get = "pub"]
    #[serde(rename = "AUDIT_DIR", default)]
    /// Directory holding pulled appliance audit files.
    audit_dir: Option<PathBuf>,

    #[get_copy = "pub"]
    #[serde(rename = "AUDIT_INTERVAL", default = "default_audit_interval")]
    /// How many consumed keys between audit pulls.
    audit_interval: i64,

    #[get = "pub"]
    #[serde(rename = "LANGUAGE", default = "default_language")]
    language: String,

    #[get_copy = "pub"]
    #[serde(rename = "REBOOT_TIMEOUT", default)]
    /// Seconds to wait for a target to reappear after reboot.
    reboot_timeout: f64,

    #[get_copy = "pub"]
    #[serde(rename = "ATFA_REBOOT_TIMEOUT", default)]
    /// Seconds to wait for the appliance to reappear after reboot.
    atfa_reboot_timeout: f64,

    #[get = "pub"]
    #[serde(
        rename = "PRODUCT_ATTRIBUTE_FILE_EXTENSION",
        default = "default_attribute_extension"
    )]
    product_attribute_file_extension: String,

    #[get = "pub"]
    #[serde(rename = "KEY_FILE_EXTENSION", default = "default_key_extension")]
    key_file_extension: String,

    #[get = "pub"]
    #[serde(rename = "UPDATE_FILE_EXTENSION", default = "default_update_extension")]
    update_file_extension: String,

    #[get = "pub"]
    #[serde(rename = "PASSWORD_HASH", default)]
    /// Opaque operator password hash; verified by the auth collaborator.
    password_hash: String,

    #[get = "pub"]
    #[serde(rename = "DEVICE_USB_LOCATIONS", default = "default_usb_locations")]
    /// USB location mapped to each device slot, `None` when unmapped.
    device_usb_locations: Vec<Option<String>>,

    #[get_copy = "pub"]
    #[serde(rename = "TEST_MODE", default)]
    /// Disables every step precondition and sequence security check.
    test_mode: bool,

    #[get = "pub"]
    #[serde(rename = "PROVISION_STEPS", default)]
    /// Configured automatic step sequence; empty means mode default.
    provision_steps: Vec<String>,

    #[get = "pub"]
    #[serde(rename = "KEY_DIR", default)]
    /// Staging directory scanned for incoming key bundles.
    key_dir: Option<PathBuf>,

    #[get = "pub"]
    #[serde(rename = "UNLOCK_CREDENTIAL", default)]
    /// Optional credential appended to `oem at-unlock-vboot`.
    unlock_credential: Option<String>,
}

impl Config {
    /// Read the configuration from `path`.
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        let mut config: Config = serde_json::from_str(&content)
            .map_err(|e| Error::DescriptorFormat(format!("config file: {}", e)))?;
        if config.device_usb_locations.len() != TARGET_DEV_SIZE {
            config.device_usb_locations.resize(TARGET_DEV_SIZE, None);
        }
        Ok(config)
    }

    /// Write the configuration back to `path` with sorted keys.
    pub fn persist(&self, path: &Path) -> Result<()> {
        let value = serde_json::to_value(self)
            .map_err(|e| Error::DescriptorFormat(format!("config file: {}", e)))?;
        fs::write(path, format!("{:#}\n", value))?;
        Ok(())
    }

    /// Compatible appliance version as an integer, 0 when unparsable.
    pub fn compatible_atfa_version_number(&self) -> i64 {
        self.compatible_atfa_version.parse().unwrap_or(0)
    }

    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs_f64(self.device_refresh_interval.max(0.1))
    }

    pub fn reboot_timeout_duration(&self) -> Duration {
        Duration::from_secs_f64(self.reboot_timeout.max(0.0))
    }

    pub fn atfa_reboot_timeout_duration(&self) -> Duration {
        Duration::from_secs_f64(self.atfa_reboot_timeout.max(0.0))
    }

    /// Whether any device slot has a USB location mapped. Unmapped slots mean
    /// the console runs in single device mode.
    pub fn multi_device_mode(&self) -> bool {
        self.device_usb_locations.iter().any(Option::is_some)
    }

    /// Update the slot mapping, e.g. after the operator re-maps a fixture.
    pub fn set_device_usb_locations(&mut self, locations: Vec<Option<String>>) {
        self.device_usb_locations = locations;
        self.device_usb_locations.resize(TARGET_DEV_SIZE, None);
    }

    /// Replace the configured step sequence.
    pub fn set_provision_steps(&mut self, steps: Vec<String>) {
        self.provision_steps = steps;
    }
}

impl Default for Config {
    fn default() -> Self {
        serde_json::from_str("{}").expect("empty config deserializes")
    }
}
