//! Serial number to USB physical location mapping.
//!
//! Walks sysfs to pair each connected device's serial with the bus-port path
//! of the USB port it hangs off. Locations are stable across reboots as long
//! as the cable stays in the same port, which is what lets the console pin a
//! fixture slot to a physical position on the bench.

use log::trace;
use std::{
    collections::HashMap,
    fs,
    path::{Path, PathBuf},
};

const USB_DEVICES_PATH: &str = "/sys/bus/usb/devices";

#[derive(Debug)]
pub struct SerialMapper {
    devices_path: PathBuf,
    map: HashMap<String, String>,
}

impl Default for SerialMapper {
    fn default() -> Self {
        Self::new(USB_DEVICES_PATH)
    }
}

impl SerialMapper {
    pub fn new(devices_path: impl Into<PathBuf>) -> Self {
        Self {
            devices_path: devices_path.into(),
            map: HashMap::new(),
        }
    }

    /// Rescan the USB topology. Serials are stored lowercase so lookup is
    /// case insensitive.
    pub fn refresh(&mut self) {
        self.map = Self::scan(&self.devices_path);
        trace!("serial map refreshed ({} devices)", self.map.len());
    }

    /// The current USB location for a serial, if the device is present.
    pub fn location_of(&self, serial: &str) -> Option<String> {
        self.map.get(&serial.to_lowercase()).cloned()
    }

    fn scan(devices_path: &Path) -> HashMap<String, String> {
        let mut map = HashMap::new();
        let entries = match fs::read_dir(devices_path) {
            Ok(entries) => entries,
            Err(_) => return map,
        };
        for entry in entries.flatten() {
            if !entry.path().is_dir() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            // Folder names are either usbN (controllers), bus-port[.port...]
            // (devices) or bus-port:config.interface (interfaces). Only the
            // device form carries a serial.
            if name.contains(':') || !name.contains('-') {
                continue;
            }
            let serial_path = entry.path().join("serial");
            if let Ok(serial) = fs::read_to_string(&serial_path) {
                let serial = serial.trim_end_matches('\n').to_lowercase();
                if !serial.is_empty() {
                    map.insert(serial, name);
                }
            }
        }
        map
    }
}
