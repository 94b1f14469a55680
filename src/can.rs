/*! CAN bus adapter.

Received CAN messages are normalized into a flat layout so the rest of
the pipeline sees plain byte chunks:

```text
id:u32 BE | dlc:u8 | data[dlc]
```

The original envelope (id, extended flag, RTR, dlc) additionally rides
along in the chunk's transport metadata. Writes parse the same layout;
the extended flag is derived from the id.

Real hardware access goes through the `socketcan` crate behind the
`socketcan` feature (Linux only). Everywhere else the adapter
enumerates a single simulator device.
*/
use std::sync::Arc;

use log::debug;

use crate::adapter::{Adapter, CanFilter, Handle, OpenOptions};
use crate::device::{DeviceInfo, DeviceType};
use crate::frame::TransportMeta;
use crate::simulator::{SimHandle, SimTraffic, SimulatorConfig};
use crate::{Error, Result};

const MAX_DLC: usize = 8;

/// Minimum normalized frame: 4 id bytes plus the dlc byte.
const HEADER: usize = 5;

/// Highest standard (11-bit) id.
const STD_ID_MAX: u32 = 0x7FF;

/// One CAN message in adapter form.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CanMessage {
    /// Arbitration id.
    pub id: u32,
    /// Extended (29-bit) id.
    pub ext: bool,
    /// Remote transmission request.
    pub rtr: bool,
    /// Data bytes, at most 8.
    pub data: Vec<u8>,
}

impl CanMessage {
    /// The transport metadata for this message.
    #[must_use]
    pub fn meta(&self) -> TransportMeta {
        TransportMeta::Can {
            id: self.id,
            ext: self.ext,
            rtr: self.rtr,
            dlc: self.data.len() as u8,
        }
    }
}

/// Build the normalized layout. Data beyond 8 bytes is truncated.
pub(crate) fn normalized(id: u32, data: &[u8]) -> Vec<u8> {
    let data = &data[..data.len().min(MAX_DLC)];
    let mut out = Vec::with_capacity(HEADER + data.len());
    out.extend_from_slice(&id.to_be_bytes());
    out.push(data.len() as u8);
    out.extend_from_slice(data);
    out
}

/// Encode a message into the normalized layout.
pub fn encode_frame(id: u32, data: &[u8]) -> Result<Vec<u8>> {
    if data.len() > MAX_DLC {
        return Err(Error::InvalidDlc(data.len()));
    }
    Ok(normalized(id, data))
}

/// Parse the normalized layout back into a message.
pub fn parse_frame(raw: &[u8]) -> Result<CanMessage> {
    if raw.len() < HEADER {
        return Err(Error::Encode(format!(
            "CAN frame is {} bytes, minimum {HEADER}",
            raw.len()
        )));
    }
    let id = u32::from_be_bytes([raw[0], raw[1], raw[2], raw[3]]);
    let dlc = raw[4] as usize;
    if dlc > MAX_DLC {
        return Err(Error::InvalidDlc(dlc));
    }
    if raw.len() != HEADER + dlc {
        return Err(Error::Encode(format!(
            "dlc {dlc} does not match frame length {}",
            raw.len()
        )));
    }
    Ok(CanMessage {
        id,
        ext: id > STD_ID_MAX,
        rtr: false,
        data: raw[HEADER..].to_vec(),
    })
}

/// A message passes if ANY filter matches. An empty set passes
/// everything.
///
/// A filter matches when `(msg.id & mask) == (filter.id & mask)` and
/// its extended flag is unset or equals the message's.
#[must_use]
pub fn filter_pass(filters: &[CanFilter], id: u32, ext: bool) -> bool {
    if filters.is_empty() {
        return true;
    }
    filters.iter().any(|f| {
        (id & f.mask) == (f.id & f.mask) && f.extended.map(|e| e == ext).unwrap_or(true)
    })
}

/// The CAN adapter.
pub struct CanAdapter;

impl Adapter for CanAdapter {
    fn device_type(&self) -> DeviceType {
        DeviceType::Can
    }

    fn list_devices(&self) -> Result<Vec<DeviceInfo>> {
        let mut devices = real::list_interfaces();
        devices.push(DeviceInfo::simulator(DeviceType::Can));
        Ok(devices)
    }

    fn open(&self, device: &DeviceInfo, options: &OpenOptions) -> Result<Arc<dyn Handle>> {
        if device.is_simulator() {
            debug!("opening simulated CAN device");
            return Ok(SimHandle::spawn(
                device.clone(),
                SimTraffic::Can,
                &SimulatorConfig::loopback(),
                options,
            ));
        }
        real::open(device, options)
    }

    fn create_simulator(&self, config: &SimulatorConfig) -> Result<Arc<dyn Handle>> {
        Ok(SimHandle::spawn(
            DeviceInfo::simulator(DeviceType::Can),
            SimTraffic::Can,
            config,
            &OpenOptions::default(),
        ))
    }
}

#[cfg(all(feature = "socketcan", target_os = "linux"))]
mod real {
    use std::sync::{Arc, Mutex};

    use log::{info, warn};
    use socketcan::{CanFrame, CanSocket, EmbeddedFrame, Frame, Socket};

    use super::{CanMessage, filter_pass, normalized, parse_frame};
    use crate::adapter::{
        AdapterStats, CanFilter, Handle, HandleCore, OpenOptions, POLL, RxCallback, SubscriptionId,
    };
    use crate::device::{DeviceInfo, DeviceType};
    use crate::{Error, Result};

    pub(super) fn list_interfaces() -> Vec<DeviceInfo> {
        let mut out = Vec::new();
        if let Ok(entries) = std::fs::read_dir("/sys/class/net") {
            for entry in entries.flatten() {
                let name = entry.file_name().to_string_lossy().into_owned();
                if name.starts_with("can") || name.starts_with("vcan") {
                    out.push(
                        DeviceInfo::new(name.clone(), name.clone(), DeviceType::Can)
                            .with_path(name),
                    );
                }
            }
        }
        out
    }

    struct CanHandle {
        core: Arc<HandleCore>,
        socket: Mutex<CanSocket>,
        filters: Mutex<Vec<CanFilter>>,
    }

    pub(super) fn open(device: &DeviceInfo, options: &OpenOptions) -> Result<Arc<dyn Handle>> {
        let iface = device.path.as_deref().ok_or(Error::DevicePathMissing)?;
        // One socket per direction; CAN allows several sockets on the
        // same interface and this keeps the reader thread sole owner
        // of its fd.
        let reader =
            CanSocket::open(iface).map_err(|e| Error::Transport(format!("CAN open: {e}")))?;
        reader
            .set_read_timeout(POLL)
            .map_err(|e| Error::Transport(format!("CAN timeout: {e}")))?;
        let socket =
            CanSocket::open(iface).map_err(|e| Error::Transport(format!("CAN open: {e}")))?;
        let core = HandleCore::new(device.clone());
        let handle = Arc::new(CanHandle {
            core: core.clone(),
            socket: Mutex::new(socket),
            filters: Mutex::new(options.can_filters.clone().unwrap_or_default()),
        });
        let rx_handle = handle.clone();
        std::thread::spawn(move || {
            while !core.is_closed() {
                match reader.read_frame() {
                    Ok(frame) => {
                        let msg = CanMessage {
                            id: frame.raw_id(),
                            ext: frame.is_extended(),
                            rtr: frame.is_remote_frame(),
                            data: frame.data().to_vec(),
                        };
                        let filters = rx_handle.filters.lock().unwrap();
                        if !filter_pass(&filters, msg.id, msg.ext) {
                            continue;
                        }
                        drop(filters);
                        core.deliver(&normalized(msg.id, &msg.data), Some(msg.meta()));
                    }
                    Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => continue,
                    Err(e) if e.kind() == std::io::ErrorKind::TimedOut => continue,
                    Err(e) => {
                        warn!("CAN read failed: {e}");
                        core.record_error();
                        break;
                    }
                }
            }
        });
        info!("{}: CAN interface open", device.id);
        Ok(handle)
    }

    impl Handle for CanHandle {
        fn device(&self) -> &DeviceInfo {
            self.core.device()
        }

        fn write(&self, data: &[u8]) -> Result<()> {
            self.core.ensure_open()?;
            let msg = parse_frame(data).inspect_err(|_| self.core.record_error())?;
            let frame = if msg.id > super::STD_ID_MAX {
                socketcan::ExtendedId::new(msg.id).and_then(|id| CanFrame::new(id, &msg.data))
            } else {
                socketcan::StandardId::new(msg.id as u16)
                    .and_then(|id| CanFrame::new(id, &msg.data))
            };
            let frame = frame
                .ok_or_else(|| Error::Encode(format!("unusable CAN id {:#x}", msg.id)))?;
            self.socket
                .lock()
                .unwrap()
                .write_frame(&frame)
                .map_err(|e| {
                    self.core.record_error();
                    Error::Transport(format!("CAN write: {e}"))
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
            if let Some(filters) = &options.can_filters {
                *self.filters.lock().unwrap() = filters.clone();
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

#[cfg(not(all(feature = "socketcan", target_os = "linux")))]
mod real {
    use std::sync::Arc;

    use crate::adapter::{Handle, OpenOptions};
    use crate::device::DeviceInfo;
    use crate::{Error, Result};

    pub(super) fn list_interfaces() -> Vec<DeviceInfo> {
        Vec::new()
    }

    pub(super) fn open(_device: &DeviceInfo, _options: &OpenOptions) -> Result<Arc<dyn Handle>> {
        Err(Error::Transport(
            "CAN hardware support not compiled in (enable the socketcan feature)".into(),
        ))
    }
}
