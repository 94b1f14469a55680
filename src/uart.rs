/*! UART adapter.

Real serial ports go through the `serialport` crate behind the
`serialport` feature; each OS read becomes one rx chunk. Without the
feature, enumeration returns the simulator entry only.

Baud rate and flow control can be changed on the live port via
`set_options`.
*/
use std::sync::Arc;

use crate::adapter::{Adapter, Handle, OpenOptions};
use crate::device::{DeviceInfo, DeviceType};
use crate::simulator::{SimHandle, SimTraffic, SimulatorConfig};
use crate::Result;

/// The UART adapter.
pub struct UartAdapter;

impl Adapter for UartAdapter {
    fn device_type(&self) -> DeviceType {
        DeviceType::Uart
    }

    fn list_devices(&self) -> Result<Vec<DeviceInfo>> {
        let mut devices = real::list_ports();
        if devices.is_empty() {
            devices.push(DeviceInfo::simulator(DeviceType::Uart));
        }
        Ok(devices)
    }

    fn open(&self, device: &DeviceInfo, options: &OpenOptions) -> Result<Arc<dyn Handle>> {
        if device.is_simulator() {
            return Ok(SimHandle::spawn(
                device.clone(),
                SimTraffic::EfuseAdc,
                &SimulatorConfig::loopback(),
                options,
            ));
        }
        real::open(device, options)
    }

    fn create_simulator(&self, config: &SimulatorConfig) -> Result<Arc<dyn Handle>> {
        Ok(SimHandle::spawn(
            DeviceInfo::simulator(DeviceType::Uart),
            SimTraffic::EfuseAdc,
            config,
            &OpenOptions::default(),
        ))
    }
}

#[cfg(feature = "serialport")]
mod real {
    use std::io::Read;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use log::{info, warn};
    use serialport::SerialPort;

    use crate::adapter::{
        AdapterStats, FlowControl, Handle, HandleCore, OpenOptions, Parity, RxCallback, StopBits,
        SubscriptionId,
    };
    use crate::device::{DeviceInfo, DeviceType};
    use crate::{Error, Result};

    const READ_CHUNK: usize = 4096;
    const DEFAULT_TIMEOUT: Duration = Duration::from_millis(100);

    pub(super) fn list_ports() -> Vec<DeviceInfo> {
        let Ok(ports) = serialport::available_ports() else {
            return Vec::new();
        };
        ports
            .into_iter()
            .map(|p| {
                let mut d = DeviceInfo::new(p.port_name.clone(), p.port_name.clone(), DeviceType::Uart)
                    .with_path(p.port_name);
                if let serialport::SerialPortType::UsbPort(usb) = p.port_type {
                    d.vendor = Some(format!("{:04x}", usb.vid));
                    d.product = usb.product;
                    d.manufacturer = usb.manufacturer;
                    d.serial = usb.serial_number;
                }
                d
            })
            .collect()
    }

    fn map_data_bits(bits: u8) -> Result<serialport::DataBits> {
        Ok(match bits {
            5 => serialport::DataBits::Five,
            6 => serialport::DataBits::Six,
            7 => serialport::DataBits::Seven,
            8 => serialport::DataBits::Eight,
            other => return Err(Error::UnsupportedOption(format!("dataBits={other}"))),
        })
    }

    fn map_stop_bits(bits: StopBits) -> Result<serialport::StopBits> {
        Ok(match bits {
            StopBits::One => serialport::StopBits::One,
            StopBits::Two => serialport::StopBits::Two,
            StopBits::OnePointFive => {
                return Err(Error::UnsupportedOption("stopBits=1.5".into()));
            }
        })
    }

    fn map_parity(parity: Parity) -> Result<serialport::Parity> {
        Ok(match parity {
            Parity::None => serialport::Parity::None,
            Parity::Even => serialport::Parity::Even,
            Parity::Odd => serialport::Parity::Odd,
            Parity::Mark | Parity::Space => {
                return Err(Error::UnsupportedOption(format!(
                    "parity={parity:?} not supported on this platform"
                )));
            }
        })
    }

    fn map_flow(flow: Option<&Vec<FlowControl>>) -> serialport::FlowControl {
        match flow {
            None => serialport::FlowControl::None,
            Some(lines) if lines.is_empty() => serialport::FlowControl::None,
            Some(lines) if lines.contains(&FlowControl::XonXoff) => {
                serialport::FlowControl::Software
            }
            Some(_) => serialport::FlowControl::Hardware,
        }
    }

    struct UartHandle {
        core: Arc<HandleCore>,
        port: Mutex<Box<dyn SerialPort>>,
    }

    pub(super) fn open(device: &DeviceInfo, options: &OpenOptions) -> Result<Arc<dyn Handle>> {
        let path = device.path.as_deref().ok_or(Error::DevicePathMissing)?;
        let timeout = options
            .read_timeout
            .map(Duration::from_millis)
            .unwrap_or(DEFAULT_TIMEOUT);
        let port = serialport::new(path, options.baud())
            .data_bits(map_data_bits(options.data_bits_or_default())?)
            .stop_bits(map_stop_bits(options.stop_bits_or_default())?)
            .parity(map_parity(options.parity_or_default())?)
            .flow_control(map_flow(options.flow_control.as_ref()))
            .timeout(timeout)
            .open()
            .map_err(|e| Error::Transport(format!("serial open {path}: {e}")))?;
        let mut reader = port
            .try_clone()
            .map_err(|e| Error::Transport(format!("serial clone: {e}")))?;
        let core = HandleCore::new(device.clone());
        let c = core.clone();
        std::thread::spawn(move || {
            // Each successful OS read is one rx chunk.
            let mut buf = [0u8; READ_CHUNK];
            while !c.is_closed() {
                match reader.read(&mut buf) {
                    Ok(0) => continue,
                    Ok(n) => c.deliver(&buf[..n], None),
                    Err(e)
                        if e.kind() == std::io::ErrorKind::TimedOut
                            || e.kind() == std::io::ErrorKind::WouldBlock =>
                    {
                        continue;
                    }
                    Err(e) => {
                        warn!("serial read failed: {e}");
                        c.record_error();
                        break;
                    }
                }
            }
        });
        info!("{}: serial port open at {} baud", device.id, options.baud());
        Ok(Arc::new(UartHandle {
            core,
            port: Mutex::new(port),
        }))
    }

    impl Handle for UartHandle {
        fn device(&self) -> &DeviceInfo {
            self.core.device()
        }

        fn write(&self, data: &[u8]) -> Result<()> {
            self.core.ensure_open()?;
            use std::io::Write;
            self.port.lock().unwrap().write_all(data).map_err(|e| {
                self.core.record_error();
                Error::Transport(format!("serial write: {e}"))
            })?;
            self.core.record_tx(data.len());
            Ok(())
        }

        fn subscribe(&self, callback: RxCallback) -> SubscriptionId {
            self.core.subscribe(callback)
        }

        fn unsubscribe(&self, id: SubscriptionId) -> bool {
            self.core.unsubscribe(id)
        }

        fn set_options(&self, options: &OpenOptions) -> Result<()> {
            self.core.ensure_open()?;
            let mut port = self.port.lock().unwrap();
            if let Some(baud) = options.baud_rate {
                port.set_baud_rate(baud)
                    .map_err(|e| Error::Transport(format!("set baud: {e}")))?;
            }
            if let Some(lines) = &options.flow_control {
                port.set_flow_control(map_flow(Some(lines)))
                    .map_err(|e| Error::Transport(format!("set flow control: {e}")))?;
                if lines.contains(&FlowControl::Rts) {
                    port.write_request_to_send(true)
                        .map_err(|e| Error::Transport(format!("set RTS: {e}")))?;
                }
                if lines.contains(&FlowControl::Dtr) {
                    port.write_data_terminal_ready(true)
                        .map_err(|e| Error::Transport(format!("set DTR: {e}")))?;
                }
            }
            Ok(())
        }

        fn close(&self) -> Result<()> {
            self.core.mark_closed();
            Ok(())
        }

        fn stats(&self) -> AdapterStats {
            self.core.snapshot()
        }
    }
}

#[cfg(not(feature = "serialport"))]
mod real {
    use std::sync::Arc;

    use crate::adapter::{Handle, OpenOptions};
    use crate::device::DeviceInfo;
    use crate::{Error, Result};

    pub(super) fn list_ports() -> Vec<DeviceInfo> {
        Vec::new()
    }

    pub(super) fn open(device: &DeviceInfo, _options: &OpenOptions) -> Result<Arc<dyn Handle>> {
        if device.path.is_none() {
            return Err(Error::DevicePathMissing);
        }
        Err(Error::Transport(
            "serial hardware support not compiled in (enable the serialport feature)".into(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::ProtocolCodec;
    use std::sync::Mutex;
    use std::time::Duration;

    #[test]
    fn enumeration_always_yields_something() {
        let devices = UartAdapter.list_devices().unwrap();
        assert!(!devices.is_empty());
    }

    #[test]
    fn simulator_loopback_round_trip() {
        let h = UartAdapter
            .open(
                &DeviceInfo::simulator(DeviceType::Uart),
                &OpenOptions::default(),
            )
            .unwrap();
        let chunks = Arc::new(Mutex::new(Vec::new()));
        let c = chunks.clone();
        h.subscribe(Box::new(move |bytes, _| {
            c.lock().unwrap().push(bytes.to_vec());
        }));
        let frame = crate::efuse::encode_frame(0x01, &[0x08, 0x00]);
        h.write(&frame).unwrap();
        std::thread::sleep(Duration::from_millis(80));
        assert_eq!(*chunks.lock().unwrap(), vec![frame]);
        h.close().unwrap();
    }

    #[test]
    fn open_without_path_fails() {
        let d = DeviceInfo::new("uart0", "bare", DeviceType::Uart);
        assert!(UartAdapter.open(&d, &OpenOptions::default()).is_err());
    }

    #[test]
    fn burst_simulator_emits_adc_frames() {
        let h = UartAdapter
            .create_simulator(&SimulatorConfig::burst(30, 2))
            .unwrap();
        let chunks = Arc::new(Mutex::new(Vec::new()));
        let c = chunks.clone();
        h.subscribe(Box::new(move |bytes, _| {
            c.lock().unwrap().push(bytes.to_vec());
        }));
        std::thread::sleep(Duration::from_millis(200));
        h.close().unwrap();
        let got = chunks.lock().unwrap();
        assert!(got.len() >= 4, "got {}", got.len());
        for frame in got.iter() {
            assert!(crate::efuse::EfuseCodec.decode(frame).is_some());
        }
    }
}
