//! Device identity as produced by adapter enumeration.
use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Transport family of a device.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceType {
    /// Asynchronous serial.
    Uart,
    /// Serial Peripheral Interface.
    Spi,
    /// I²C bus.
    I2c,
    /// CAN bus.
    Can,
    /// Ethernet, UDP or TCP.
    Ethernet,
}

impl std::fmt::Display for DeviceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeviceType::Uart => write!(f, "uart"),
            DeviceType::Spi => write!(f, "spi"),
            DeviceType::I2c => write!(f, "i2c"),
            DeviceType::Can => write!(f, "can"),
            DeviceType::Ethernet => write!(f, "ethernet"),
        }
    }
}

impl std::str::FromStr for DeviceType {
    type Err = crate::Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        match s {
            "uart" => Ok(DeviceType::Uart),
            "spi" => Ok(DeviceType::Spi),
            "i2c" => Ok(DeviceType::I2c),
            "can" => Ok(DeviceType::Can),
            "ethernet" => Ok(DeviceType::Ethernet),
            other => Err(crate::Error::InvalidConfig(format!(
                "unknown device type {other:?}"
            ))),
        }
    }
}

/// Stable identity of a discovered wire endpoint.
///
/// Created by adapter enumeration, immutable thereafter.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DeviceInfo {
    /// Opaque id, unique within one enumeration.
    pub id: String,

    /// Human readable name.
    pub name: String,

    /// Transport family.
    #[serde(rename = "type")]
    pub device_type: DeviceType,

    /// OS-specific locator, e.g. "/dev/ttyUSB0" or "can0".
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub path: Option<String>,

    /// USB vendor, where known.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub vendor: Option<String>,

    /// USB product, where known.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub product: Option<String>,

    /// Manufacturer string, where known.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub manufacturer: Option<String>,

    /// Serial number, where known.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub serial: Option<String>,

    /// Extra enumeration details.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub metadata: Option<BTreeMap<String, String>>,
}

impl DeviceInfo {
    /// New device with the given id and name.
    #[must_use]
    pub fn new<S: Into<String>, N: Into<String>>(id: S, name: N, device_type: DeviceType) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            device_type,
            path: None,
            vendor: None,
            product: None,
            manufacturer: None,
            serial: None,
            metadata: None,
        }
    }

    /// The simulator entry for a transport family.
    ///
    /// Returned by enumeration on platforms where real enumeration is
    /// not supported, and openable on every platform.
    #[must_use]
    pub fn simulator(device_type: DeviceType) -> Self {
        Self::new(
            format!("sim:{device_type}"),
            format!("Simulated {device_type} device"),
            device_type,
        )
    }

    /// True for devices created by [`DeviceInfo::simulator`].
    #[must_use]
    pub fn is_simulator(&self) -> bool {
        self.id.starts_with("sim:")
    }

    /// Set the OS path.
    #[must_use]
    pub fn with_path<S: Into<String>>(mut self, path: S) -> Self {
        self.path = Some(path.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_device_type() {
        assert_eq!("can".parse::<DeviceType>().unwrap(), DeviceType::Can);
        assert_eq!(
            "ethernet".parse::<DeviceType>().unwrap(),
            DeviceType::Ethernet
        );
        assert!("midi".parse::<DeviceType>().is_err());
    }

    #[test]
    fn simulator_entry() {
        let d = DeviceInfo::simulator(DeviceType::Spi);
        assert!(d.is_simulator());
        assert_eq!(d.id, "sim:spi");
        assert_eq!(d.device_type, DeviceType::Spi);
    }

    #[test]
    fn real_device_is_not_simulator() {
        let d = DeviceInfo::new("usb-0001", "FTDI", DeviceType::Uart).with_path("/dev/ttyUSB0");
        assert!(!d.is_simulator());
        assert_eq!(d.path.as_deref(), Some("/dev/ttyUSB0"));
    }
}
