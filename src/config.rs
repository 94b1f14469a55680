/*! Declarative configuration schemas.

Deserializable records for device, protocol, and session configs, plus
validation. This module only validates; turning a config into open
options or a live session is the caller's business.
*/
use serde::{Deserialize, Serialize};

use crate::adapter::OpenOptions;
use crate::codec::CodecRegistry;
use crate::device::DeviceType;
use crate::simulator::{SimMode, SimulatorConfig};
use crate::{Error, Result};

const I2C_BUS_SPEEDS: [u32; 3] = [100_000, 400_000, 1_000_000];

fn bad(msg: impl Into<String>) -> Error {
    Error::InvalidConfig(msg.into())
}

/// Device selection plus its open options.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceConfig {
    /// Transport family.
    #[serde(rename = "type")]
    pub device_type: DeviceType,

    /// OS locator of the device.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub path: Option<String>,

    /// Open options; the superset record, validated per family.
    #[serde(flatten)]
    pub options: OpenOptions,
}

impl DeviceConfig {
    /// Check the fields this device type will read.
    pub fn validate(&self) -> Result<()> {
        let o = &self.options;
        match self.device_type {
            DeviceType::Uart => {
                if o.baud() == 0 {
                    return Err(bad("baudRate must be positive"));
                }
                let bits = o.data_bits_or_default();
                if !(5..=8).contains(&bits) {
                    return Err(bad(format!("dataBits must be 5..=8, got {bits}")));
                }
            }
            DeviceType::Spi => {
                if let Some(mode) = o.spi_mode {
                    if mode > 3 {
                        return Err(bad(format!("spiMode must be 0..=3, got {mode}")));
                    }
                }
                if o.clock_speed == Some(0) {
                    return Err(bad("clockSpeed must be positive"));
                }
            }
            DeviceType::I2c => {
                if let Some(speed) = o.i2c_bus_speed {
                    if !I2C_BUS_SPEEDS.contains(&speed) {
                        return Err(bad(format!(
                            "i2cBusSpeed must be one of {I2C_BUS_SPEEDS:?}, got {speed}"
                        )));
                    }
                }
                if let Some(mode) = o.i2c_address_mode {
                    if mode != 7 && mode != 10 {
                        return Err(bad(format!("i2cAddressMode must be 7 or 10, got {mode}")));
                    }
                }
            }
            DeviceType::Can => {
                if o.can_bitrate == Some(0) {
                    return Err(bad("canBitrate must be positive"));
                }
                for f in o.can_filters.iter().flatten() {
                    if f.extended == Some(false) && f.id > 0x7FF {
                        return Err(bad(format!(
                            "standard-frame filter id {:#x} exceeds 11 bits",
                            f.id
                        )));
                    }
                }
            }
            DeviceType::Ethernet => {
                use crate::adapter::EthProtocol;
                if o.eth_protocol == Some(EthProtocol::Raw) {
                    return Err(bad("ethProtocol raw is not supported"));
                }
                if o.eth_port == Some(0) && o.eth_host.is_some() {
                    return Err(bad("ethPort must be set to reach a remote host"));
                }
            }
        }
        Ok(())
    }
}

/// Protocol selection.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct ProtocolConfig {
    /// Codec name, e.g. "efuse".
    pub protocol: String,
}

impl ProtocolConfig {
    /// Check the protocol is a registered codec.
    pub fn validate(&self) -> Result<()> {
        let registry = CodecRegistry::with_defaults();
        if registry.get(&self.protocol).is_none() {
            return Err(Error::UnknownProtocol(self.protocol.clone()));
        }
        Ok(())
    }
}

/// Everything needed to start a session.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionConfig {
    /// Device and open options.
    pub device: DeviceConfig,

    /// Codec selection.
    pub protocol: ProtocolConfig,

    /// Simulator setup, when not opening real hardware.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub simulator: Option<SimulatorConfig>,
}

impl SessionConfig {
    /// Validate all parts.
    pub fn validate(&self) -> Result<()> {
        self.device.validate()?;
        self.protocol.validate()?;
        if let Some(sim) = &self.simulator {
            validate_simulator(sim)?;
        }
        Ok(())
    }
}

fn validate_simulator(sim: &SimulatorConfig) -> Result<()> {
    if !(0.0..=1.0).contains(&sim.error_rate) {
        return Err(bad(format!(
            "errorRate must be within [0, 1], got {}",
            sim.error_rate
        )));
    }
    match sim.mode {
        SimMode::Scripted => {
            let events = sim.script.as_ref().map(|s| s.events.len()).unwrap_or(0);
            if events == 0 {
                return Err(bad("scripted mode needs a non-empty script"));
            }
        }
        SimMode::Burst => {
            if sim.burst_size == Some(0) {
                return Err(bad("burstSize must be positive"));
            }
            if sim.burst_interval_ms == Some(0) {
                return Err(bad("burstInterval must be positive"));
            }
        }
        SimMode::Loopback | SimMode::ErrorInject => {}
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_session(text: &str) -> SessionConfig {
        serde_json::from_str(text).unwrap()
    }

    #[test]
    fn full_session_config_parses_and_validates() {
        let cfg = parse_session(
            r#"{
                "device": {
                    "type": "uart",
                    "path": "/dev/ttyUSB0",
                    "baudRate": 115200,
                    "dataBits": 8,
                    "stopBits": 1,
                    "parity": "none"
                },
                "protocol": {"protocol": "efuse"},
                "simulator": {"mode": "burst", "burstSize": 5, "burstInterval": 100}
            }"#,
        );
        cfg.validate().unwrap();
        assert_eq!(cfg.device.device_type, DeviceType::Uart);
        assert_eq!(cfg.device.options.baud(), 115_200);
    }

    #[test]
    fn uart_bad_data_bits() {
        let cfg = parse_session(
            r#"{
                "device": {"type": "uart", "dataBits": 9},
                "protocol": {"protocol": "efuse"}
            }"#,
        );
        assert!(matches!(cfg.validate(), Err(Error::InvalidConfig(_))));
    }

    #[test]
    fn i2c_speed_whitelist() {
        let cfg = parse_session(
            r#"{
                "device": {"type": "i2c", "i2cBusSpeed": 400000},
                "protocol": {"protocol": "hex"}
            }"#,
        );
        cfg.validate().unwrap();
        let cfg = parse_session(
            r#"{
                "device": {"type": "i2c", "i2cBusSpeed": 123},
                "protocol": {"protocol": "hex"}
            }"#,
        );
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn unknown_protocol() {
        let cfg = parse_session(
            r#"{
                "device": {"type": "spi"},
                "protocol": {"protocol": "modbus"}
            }"#,
        );
        assert!(matches!(cfg.validate(), Err(Error::UnknownProtocol(_))));
    }

    #[test]
    fn simulator_error_rate_range() {
        let cfg = parse_session(
            r#"{
                "device": {"type": "can"},
                "protocol": {"protocol": "hex"},
                "simulator": {"mode": "loopback", "errorRate": 1.5}
            }"#,
        );
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn scripted_needs_events() {
        let cfg = parse_session(
            r#"{
                "device": {"type": "can"},
                "protocol": {"protocol": "hex"},
                "simulator": {"mode": "scripted"}
            }"#,
        );
        assert!(cfg.validate().is_err());
        let cfg = parse_session(
            r#"{
                "device": {"type": "can"},
                "protocol": {"protocol": "hex"},
                "simulator": {
                    "mode": "scripted",
                    "script": {
                        "events": [{"delay": 10, "action": "receive", "data": [1, 2]}],
                        "loop": true
                    }
                }
            }"#,
        );
        cfg.validate().unwrap();
    }

    #[test]
    fn ethernet_raw_rejected() {
        let cfg = parse_session(
            r#"{
                "device": {"type": "ethernet", "ethProtocol": "raw"},
                "protocol": {"protocol": "ascii"}
            }"#,
        );
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn spi_mode_range() {
        let cfg = parse_session(
            r#"{
                "device": {"type": "spi", "spiMode": 3, "bitOrder": "msb"},
                "protocol": {"protocol": "hex"}
            }"#,
        );
        cfg.validate().unwrap();
        let cfg = parse_session(
            r#"{
                "device": {"type": "spi", "spiMode": 4},
                "protocol": {"protocol": "hex"}
            }"#,
        );
        assert!(cfg.validate().is_err());
    }
}
