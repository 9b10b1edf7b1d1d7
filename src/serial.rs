//! USB serial links: port discovery, persisted port assignment and the
//! [`DeviceLinks`] implementation used against real hardware.
//!
//! The sensor enumerates as two CDC-ACM ports, one carrying the text shell
//! and one carrying binary sample packets.

use std::fmt;
use std::fs;
use std::io::{Read, Write};
use std::path::Path;
use std::time::Duration;

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use serialport::{ClearBuffer, SerialPortType};

use crate::errors::Result;
use crate::session::DeviceLinks;

pub const BAUD_RATE: u32 = 115_200;

/// Shell reads must time out so the reader thread can notice shutdown.
pub const SHELL_READ_TIMEOUT: Duration = Duration::from_millis(150);
pub const DATA_READ_TIMEOUT: Duration = Duration::from_millis(100);

pub const PORT_CONFIG_FILE: &str = "usb_ports_config.json";

const DEFAULT_SHELL_PORT: &str = "/dev/tty.usbmodem1201";
const DEFAULT_DATA_PORT: &str = "/dev/tty.usbmodem1203";

// ============================================================================
// Port discovery
// ============================================================================

/// A serial port visible to the host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PortInfo {
    pub device: String,
    pub description: String,
    pub hwid: String,
}

impl fmt::Display for PortInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}  {}  [{}]", self.device, self.description, self.hwid)
    }
}

impl From<serialport::SerialPortInfo> for PortInfo {
    fn from(info: serialport::SerialPortInfo) -> Self {
        let (description, hwid) = match info.port_type {
            SerialPortType::UsbPort(usb) => {
                let description = usb
                    .product
                    .clone()
                    .or_else(|| usb.manufacturer.clone())
                    .unwrap_or_else(|| "USB Serial Device".to_string());
                let mut hwid = format!("USB VID:PID={:04X}:{:04X}", usb.vid, usb.pid);
                if let Some(serial) = &usb.serial_number {
                    hwid.push_str(&format!(" SER={serial}"));
                }
                (description, hwid)
            }
            SerialPortType::BluetoothPort => ("Bluetooth Serial".to_string(), "BLUETOOTH".to_string()),
            SerialPortType::PciPort => ("PCI Serial".to_string(), "PCI".to_string()),
            SerialPortType::Unknown => ("Unknown Device".to_string(), "N/A".to_string()),
        };
        Self {
            device: info.port_name,
            description,
            hwid,
        }
    }
}

/// Enumerate serial ports.
pub fn available_ports() -> Result<Vec<PortInfo>> {
    let ports = serialport::available_ports()?;
    debug!("found {} serial ports", ports.len());
    Ok(ports.into_iter().map(PortInfo::from).collect())
}

// ============================================================================
// Port configuration
// ============================================================================

/// Which port carries which link.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortConfig {
    pub shell_port: String,
    pub data_port: String,
}

impl Default for PortConfig {
    fn default() -> Self {
        Self {
            shell_port: DEFAULT_SHELL_PORT.to_string(),
            data_port: DEFAULT_DATA_PORT.to_string(),
        }
    }
}

impl PortConfig {
    pub fn new(shell_port: impl Into<String>, data_port: impl Into<String>) -> Self {
        Self {
            shell_port: shell_port.into(),
            data_port: data_port.into(),
        }
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let text = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&text)?)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        fs::write(path, serde_json::to_string_pretty(self)?)?;
        info!("saved port configuration to {}", path.display());
        Ok(())
    }

    /// Load `path`, writing the defaults there first if it does not exist.
    /// An unreadable file yields the defaults.
    pub fn load_or_create(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref();
        if !path.exists() {
            let config = Self::default();
            if let Err(e) = config.save(path) {
                warn!("could not write {}: {e}", path.display());
            }
            return config;
        }
        match Self::load(path) {
            Ok(config) => config,
            Err(e) => {
                warn!("could not read {}: {e}; using defaults", path.display());
                Self::default()
            }
        }
    }
}

// ============================================================================
// Serial links
// ============================================================================

/// Opens the shell and data ports named by a [`PortConfig`].
#[derive(Debug, Clone)]
pub struct SerialLinks {
    pub ports: PortConfig,
    pub baud_rate: u32,
    pub shell_timeout: Duration,
    pub data_timeout: Duration,
}

impl SerialLinks {
    pub fn new(ports: PortConfig) -> Self {
        Self {
            ports,
            baud_rate: BAUD_RATE,
            shell_timeout: SHELL_READ_TIMEOUT,
            data_timeout: DATA_READ_TIMEOUT,
        }
    }
}

impl DeviceLinks for SerialLinks {
    fn open_shell(&mut self) -> Result<(Box<dyn Read + Send>, Box<dyn Write + Send>)> {
        let port = serialport::new(&self.ports.shell_port, self.baud_rate)
            .timeout(self.shell_timeout)
            .open()?;
        let writer = port.try_clone()?;
        info!("shell link open on {}", self.ports.shell_port);
        Ok((Box::new(port), Box::new(writer)))
    }

    fn open_data(&mut self) -> Result<Box<dyn Read + Send>> {
        let port = serialport::new(&self.ports.data_port, self.baud_rate)
            .timeout(self.data_timeout)
            .open()?;
        if let Err(e) = port.clear(ClearBuffer::Input) {
            warn!("could not flush {}: {e}", self.ports.data_port);
        }
        info!("data link open on {}", self.ports.data_port);
        Ok(Box::new(port))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_config_is_created_with_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(PORT_CONFIG_FILE);

        let config = PortConfig::load_or_create(&path);
        assert_eq!(config, PortConfig::default());
        assert!(path.exists());
        assert_eq!(PortConfig::load(&path).unwrap(), config);
    }

    #[test]
    fn saved_config_is_loaded_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(PORT_CONFIG_FILE);
        let config = PortConfig::new("/dev/ttyACM0", "/dev/ttyACM1");
        config.save(&path).unwrap();

        assert_eq!(PortConfig::load_or_create(&path), config);
        let text = fs::read_to_string(&path).unwrap();
        assert!(text.contains("\"shell_port\": \"/dev/ttyACM0\""));
    }

    #[test]
    fn unreadable_config_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(PORT_CONFIG_FILE);
        fs::write(&path, "{ not json").unwrap();

        assert_eq!(PortConfig::load_or_create(&path), PortConfig::default());
        assert!(PortConfig::load(&path).is_err());
    }

    #[test]
    fn usb_port_description_and_hwid() {
        let info = serialport::SerialPortInfo {
            port_name: "/dev/ttyACM0".into(),
            port_type: SerialPortType::UsbPort(serialport::UsbPortInfo {
                vid: 0x2FE3,
                pid: 0x0100,
                serial_number: Some("E4A1".into()),
                manufacturer: Some("ZEPHYR".into()),
                product: Some("Sensor Shell".into()),
            }),
        };
        let port = PortInfo::from(info);
        assert_eq!(port.device, "/dev/ttyACM0");
        assert_eq!(port.description, "Sensor Shell");
        assert_eq!(port.hwid, "USB VID:PID=2FE3:0100 SER=E4A1");

        let unknown = PortInfo::from(serialport::SerialPortInfo {
            port_name: "/dev/ttyS0".into(),
            port_type: SerialPortType::Unknown,
        });
        assert_eq!(unknown.description, "Unknown Device");
        assert_eq!(unknown.hwid, "N/A");
    }
}
