/*! I²C adapter, simulated.

A small bus of virtual devices at 7-bit addresses:

* `0x50`: EEPROM, 256 bytes of 0xAA.
* `0x68`: sensor with a fixed register file.

Transactions use the layout `addr<<1 | rw, length, data...`. Reads
(`rw == 1`) answer with the first `length` bytes of the device after
~2 ms; writes apply `data` to the device.
*/
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, mpsc};
use std::time::Duration;

use log::debug;

use crate::adapter::{
    Adapter, AdapterStats, Delayed, Handle, HandleCore, OpenOptions, RxCallback, SubscriptionId,
    send_delayed, spawn_delayed_deliverer,
};
use crate::device::{DeviceInfo, DeviceType};
use crate::frame::TransportMeta;
use crate::simulator::{SimHandle, SimTraffic, SimulatorConfig};
use crate::{Error, Result};

const EEPROM_ADDR: u8 = 0x50;
const SENSOR_ADDR: u8 = 0x68;
const LATENCY: Duration = Duration::from_millis(2);

/// Register file of the virtual sensor: id, status, then measurement
/// bytes.
const SENSOR_REGS: [u8; 8] = [0x68, 0x01, 0x0B, 0xB8, 0x03, 0xE8, 0x00, 0x2A];

/// The I²C adapter.
pub struct I2cAdapter;

impl Adapter for I2cAdapter {
    fn device_type(&self) -> DeviceType {
        DeviceType::I2c
    }

    fn list_devices(&self) -> Result<Vec<DeviceInfo>> {
        Ok(vec![DeviceInfo::simulator(DeviceType::I2c)])
    }

    fn open(&self, device: &DeviceInfo, _options: &OpenOptions) -> Result<Arc<dyn Handle>> {
        debug!("{}: opening I2C bus model", device.id);
        let mut devices = BTreeMap::new();
        devices.insert(EEPROM_ADDR, vec![0xAA; 256]);
        devices.insert(SENSOR_ADDR, SENSOR_REGS.to_vec());
        let core = HandleCore::new(device.clone());
        let sender = spawn_delayed_deliverer(core.clone(), LATENCY);
        Ok(Arc::new(I2cHandle {
            core,
            devices: Mutex::new(devices),
            sender: Mutex::new(Some(sender)),
        }))
    }

    fn create_simulator(&self, config: &SimulatorConfig) -> Result<Arc<dyn Handle>> {
        Ok(SimHandle::spawn(
            DeviceInfo::simulator(DeviceType::I2c),
            SimTraffic::EfuseAdc,
            config,
            &OpenOptions::default(),
        ))
    }
}

struct I2cHandle {
    core: Arc<HandleCore>,
    devices: Mutex<BTreeMap<u8, Vec<u8>>>,
    sender: Mutex<Option<mpsc::Sender<Delayed>>>,
}

impl Handle for I2cHandle {
    fn device(&self) -> &DeviceInfo {
        self.core.device()
    }

    fn write(&self, data: &[u8]) -> Result<()> {
        self.core.ensure_open()?;
        let [addr_rw, length, payload @ ..] = data else {
            self.core.record_error();
            return Err(Error::Encode(format!(
                "I2C transaction is {} bytes, minimum 2",
                data.len()
            )));
        };
        let addr = addr_rw >> 1;
        let read = addr_rw & 1 == 1;
        let mut devices = self.devices.lock().unwrap();
        let Some(device) = devices.get_mut(&addr) else {
            self.core.record_error();
            return Err(Error::Transport(format!(
                "no I2C device at {addr:#04x}"
            )));
        };
        if read {
            let n = (*length as usize).min(device.len());
            let response = device[..n].to_vec();
            drop(devices);
            send_delayed(
                &self.sender,
                Delayed {
                    bytes: response,
                    transport: Some(TransportMeta::I2c { addr }),
                },
            )?;
        } else {
            for (i, &b) in payload.iter().enumerate() {
                if i >= device.len() {
                    break;
                }
                device[i] = b;
            }
        }
        self.core.record_tx(data.len());
        Ok(())
    }

    fn subscribe(&self, callback: RxCallback) -> SubscriptionId {
        self.core.subscribe(callback)
    }

    fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.core.unsubscribe(id)
    }

    fn set_options(&self, _options: &OpenOptions) -> Result<()> {
        self.core.ensure_open()
    }

    fn close(&self) -> Result<()> {
        if self.core.mark_closed() {
            self.sender.lock().unwrap().take();
        }
        Ok(())
    }

    fn stats(&self) -> AdapterStats {
        self.core.snapshot()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open() -> Arc<dyn Handle> {
        I2cAdapter
            .open(
                &DeviceInfo::simulator(DeviceType::I2c),
                &OpenOptions::default(),
            )
            .unwrap()
    }

    fn responses(h: &Arc<dyn Handle>) -> Arc<Mutex<Vec<(Vec<u8>, Option<TransportMeta>)>>> {
        let out = Arc::new(Mutex::new(Vec::new()));
        let o = out.clone();
        h.subscribe(Box::new(move |bytes, meta| {
            o.lock()
                .unwrap()
                .push((bytes.to_vec(), meta.transport.clone()));
        }));
        out
    }

    #[test]
    fn eeprom_reads_aa() {
        let h = open();
        let got = responses(&h);
        // Read 4 bytes from the EEPROM at 0x50.
        h.write(&[EEPROM_ADDR << 1 | 1, 4]).unwrap();
        std::thread::sleep(Duration::from_millis(60));
        let got = got.lock().unwrap();
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].0, vec![0xAA; 4]);
        assert_eq!(
            got[0].1,
            Some(TransportMeta::I2c { addr: EEPROM_ADDR })
        );
        h.close().unwrap();
    }

    #[test]
    fn sensor_register_file() {
        let h = open();
        let got = responses(&h);
        h.write(&[SENSOR_ADDR << 1 | 1, 3]).unwrap();
        std::thread::sleep(Duration::from_millis(60));
        assert_eq!(got.lock().unwrap()[0].0, SENSOR_REGS[..3].to_vec());
        h.close().unwrap();
    }

    #[test]
    fn read_length_clamped_to_device() {
        let h = open();
        let got = responses(&h);
        h.write(&[SENSOR_ADDR << 1 | 1, 0xFF]).unwrap();
        std::thread::sleep(Duration::from_millis(60));
        assert_eq!(got.lock().unwrap()[0].0.len(), SENSOR_REGS.len());
        h.close().unwrap();
    }

    #[test]
    fn write_applies_to_device() {
        let h = open();
        let got = responses(&h);
        h.write(&[EEPROM_ADDR << 1, 2, 0x01, 0x02]).unwrap();
        h.write(&[EEPROM_ADDR << 1 | 1, 3]).unwrap();
        std::thread::sleep(Duration::from_millis(80));
        assert_eq!(got.lock().unwrap()[0].0, vec![0x01, 0x02, 0xAA]);
        h.close().unwrap();
    }

    #[test]
    fn missing_device_is_an_error() {
        let h = open();
        let r = h.write(&[0x10 << 1 | 1, 1]);
        assert!(matches!(r, Err(Error::Transport(_))));
        assert_eq!(h.stats().errors, 1);
        h.close().unwrap();
    }

    #[test]
    fn short_transaction_rejected() {
        let h = open();
        assert!(matches!(h.write(&[0xA1]), Err(Error::Encode(_))));
        h.close().unwrap();
    }
}
