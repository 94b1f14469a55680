/*! SPI adapter, simulated.

The device model is a 256-byte memory behind two commands:

* `0x03 addr ...` reads: the response mirrors the request length,
  with memory contents from `addr` onward after two turnaround bytes.
* `0x02 addr data...` writes: stores `data` from `addr` onward and
  answers `0x00`.

Anything else is echoed unchanged. Responses arrive ~5 ms after the
write, like a real bus transaction would.
*/
use std::sync::{Arc, Mutex, mpsc};
use std::time::Duration;

use log::debug;

use crate::adapter::{
    Adapter, AdapterStats, Delayed, Handle, HandleCore, OpenOptions, RxCallback, SubscriptionId,
    send_delayed, spawn_delayed_deliverer,
};
use crate::device::{DeviceInfo, DeviceType};
use crate::simulator::{SimHandle, SimTraffic, SimulatorConfig};
use crate::Result;

const CMD_WRITE: u8 = 0x02;
const CMD_READ: u8 = 0x03;
const MEM_SIZE: usize = 256;
const LATENCY: Duration = Duration::from_millis(5);

/// The SPI adapter.
pub struct SpiAdapter;

impl Adapter for SpiAdapter {
    fn device_type(&self) -> DeviceType {
        DeviceType::Spi
    }

    fn list_devices(&self) -> Result<Vec<DeviceInfo>> {
        Ok(vec![DeviceInfo::simulator(DeviceType::Spi)])
    }

    fn open(&self, device: &DeviceInfo, _options: &OpenOptions) -> Result<Arc<dyn Handle>> {
        debug!("{}: opening SPI memory model", device.id);
        let core = HandleCore::new(device.clone());
        let sender = spawn_delayed_deliverer(core.clone(), LATENCY);
        Ok(Arc::new(SpiHandle {
            core,
            memory: Mutex::new([0u8; MEM_SIZE]),
            sender: Mutex::new(Some(sender)),
        }))
    }

    fn create_simulator(&self, config: &SimulatorConfig) -> Result<Arc<dyn Handle>> {
        Ok(SimHandle::spawn(
            DeviceInfo::simulator(DeviceType::Spi),
            SimTraffic::EfuseAdc,
            config,
            &OpenOptions::default(),
        ))
    }
}

struct SpiHandle {
    core: Arc<HandleCore>,
    memory: Mutex<[u8; MEM_SIZE]>,
    sender: Mutex<Option<mpsc::Sender<Delayed>>>,
}

impl SpiHandle {
    fn transact(&self, request: &[u8]) -> Vec<u8> {
        let mut memory = self.memory.lock().unwrap();
        match request {
            [CMD_READ, addr, ..] => {
                let mut response = vec![0u8; request.len()];
                for (i, slot) in response.iter_mut().enumerate().skip(2) {
                    *slot = memory[(*addr as usize + i - 2) % MEM_SIZE];
                }
                response
            }
            [CMD_WRITE, addr, data @ ..] => {
                for (i, &b) in data.iter().enumerate() {
                    memory[(*addr as usize + i) % MEM_SIZE] = b;
                }
                vec![0x00]
            }
            other => other.to_vec(),
        }
    }
}

impl Handle for SpiHandle {
    fn device(&self) -> &DeviceInfo {
        self.core.device()
    }

    fn write(&self, data: &[u8]) -> Result<()> {
        self.core.ensure_open()?;
        let response = self.transact(data);
        send_delayed(
            &self.sender,
            Delayed {
                bytes: response,
                transport: None,
            },
        )?;
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
