/*! Session pipeline.

A session holds at most one live handle. Received chunks are assigned
strictly monotonic frame ids, timestamped, decoded and validated with
the session's codec, appended to the session log, and published on the
event bus. Outbound sends are recorded as tx frames.

The session log is owned by the pipeline; everyone else sees snapshot
copies.
*/
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use log::{debug, info};

use crate::adapter::{
    AdapterStats, Handle, OpenOptions, SubscriptionId, adapter_for,
};
use crate::codec::{CodecRegistry, ProtocolCodec};
use crate::device::{DeviceInfo, DeviceType};
use crate::event::{Event, EventBus};
use crate::frame::{Direction, ProtocolFrame, now_ns};
use crate::simulator::SimulatorConfig;
use crate::{Error, Result};

/// One observation session over one device.
pub struct Session {
    bus: Arc<EventBus>,
    codec: Arc<dyn ProtocolCodec>,
    log: Arc<Mutex<Vec<ProtocolFrame>>>,
    next_id: Arc<AtomicU64>,
    handle: Option<Arc<dyn Handle>>,
    subscription: Option<SubscriptionId>,
}

impl Session {
    /// New disconnected session with the default decoder (efuse) and
    /// a fresh event bus.
    #[must_use]
    pub fn new() -> Self {
        let registry = CodecRegistry::with_defaults();
        let codec = registry
            .default_codec()
            .unwrap_or_else(|| Arc::new(crate::hex::HexCodec));
        Self::with_codec(codec)
    }

    /// New disconnected session with an explicit codec.
    #[must_use]
    pub fn with_codec(codec: Arc<dyn ProtocolCodec>) -> Self {
        Self {
            bus: Arc::new(EventBus::new()),
            codec,
            log: Arc::new(Mutex::new(Vec::new())),
            next_id: Arc::new(AtomicU64::new(1)),
            handle: None,
            subscription: None,
        }
    }

    /// New session with a codec looked up by name.
    pub fn with_protocol(protocol: &str) -> Result<Self> {
        let registry = CodecRegistry::with_defaults();
        let codec = registry
            .get(protocol)
            .ok_or_else(|| Error::UnknownProtocol(protocol.to_string()))?;
        Ok(Self::with_codec(codec))
    }

    /// The session's event bus.
    #[must_use]
    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    /// Name of the active codec.
    #[must_use]
    pub fn protocol(&self) -> &'static str {
        self.codec.name()
    }

    /// True while a handle is held.
    #[must_use]
    pub fn connected(&self) -> bool {
        self.handle.is_some()
    }

    /// Open a device and start ingesting its chunks.
    pub fn connect(&mut self, device: &DeviceInfo, options: &OpenOptions) -> Result<()> {
        if self.handle.is_some() {
            return Err(Error::Transport("session already connected".into()));
        }
        let adapter = adapter_for(device.device_type);
        let handle = adapter.open(device, options)?;
        self.adopt(handle, device.clone());
        Ok(())
    }

    /// Create a simulator for a transport family and ingest from it.
    pub fn connect_simulator(
        &mut self,
        device_type: DeviceType,
        config: &SimulatorConfig,
    ) -> Result<()> {
        if self.handle.is_some() {
            return Err(Error::Transport("session already connected".into()));
        }
        let adapter = adapter_for(device_type);
        let handle = adapter.create_simulator(config)?;
        let device = handle.device().clone();
        self.adopt(handle, device);
        Ok(())
    }

    fn adopt(&mut self, handle: Arc<dyn Handle>, device: DeviceInfo) {
        let log = self.log.clone();
        let bus = self.bus.clone();
        let codec = self.codec.clone();
        let next_id = self.next_id.clone();
        let subscription = handle.subscribe(Box::new(move |bytes, meta| {
            let id = next_id.fetch_add(1, Ordering::SeqCst);
            let frame = ProtocolFrame {
                id,
                timestamp: meta.timestamp,
                direction: meta.direction,
                raw: bytes.to_vec(),
                decoded: codec.decode(bytes),
                error: codec.validate(bytes),
            };
            log.lock().unwrap().push(frame.clone());
            let error = frame.error.clone();
            bus.emit(&Event::FrameReceived(frame));
            if let Some(error) = error {
                bus.emit(&Event::FrameError { frame_id: id, error });
            }
        }));
        info!("session connected to {}", device.id);
        self.handle = Some(handle);
        self.subscription = Some(subscription);
        self.bus.emit(&Event::DeviceConnected(device));
    }

    /// Transmit bytes through the open handle, recording a tx frame.
    ///
    /// The frame is timestamped before the write; a failed write
    /// records no frame.
    pub fn send(&mut self, data: &[u8]) -> Result<u64> {
        let handle = self
            .handle
            .as_ref()
            .ok_or_else(|| Error::Transport("session not connected".into()))?;
        let timestamp = now_ns();
        if let Err(e) = handle.write(data) {
            self.bus.emit(&Event::DeviceError {
                device: handle.device().id.clone(),
                message: e.to_string(),
            });
            return Err(e);
        }
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let frame = ProtocolFrame {
            id,
            timestamp,
            direction: Direction::Tx,
            raw: data.to_vec(),
            decoded: self.codec.decode(data),
            error: self.codec.validate(data),
        };
        self.log.lock().unwrap().push(frame.clone());
        self.bus.emit(&Event::FrameSent(frame));
        Ok(id)
    }

    /// Apply options to the live handle.
    pub fn set_options(&self, options: &OpenOptions) -> Result<()> {
        match &self.handle {
            Some(h) => h.set_options(options),
            None => Err(Error::Transport("session not connected".into())),
        }
    }

    /// Close the handle, if any.
    pub fn disconnect(&mut self) -> Result<()> {
        if let Some(handle) = self.handle.take() {
            if let Some(sub) = self.subscription.take() {
                handle.unsubscribe(sub);
            }
            handle.close()?;
            debug!("session disconnected from {}", handle.device().id);
            self.bus
                .emit(&Event::DeviceDisconnected(handle.device().clone()));
        }
        Ok(())
    }

    /// Counter snapshot of the live handle.
    #[must_use]
    pub fn stats(&self) -> Option<AdapterStats> {
        self.handle.as_ref().map(|h| h.stats())
    }

    /// Publish a stats:update event with the current counters.
    pub fn publish_stats(&self) {
        if let Some(stats) = self.stats() {
            self.bus.emit(&Event::StatsUpdate(stats));
        }
    }

    /// Snapshot of the session log.
    #[must_use]
    pub fn frames(&self) -> Vec<ProtocolFrame> {
        self.log.lock().unwrap().clone()
    }

    /// Number of logged frames.
    #[must_use]
    pub fn frame_count(&self) -> usize {
        self.log.lock().unwrap().len()
    }

    /// Export the session log as CSV.
    #[must_use]
    pub fn export_csv(&self) -> String {
        crate::export::to_csv(&self.frames())
    }

    /// Export the session log as pretty-printed JSON.
    pub fn export_json(&self) -> Result<String> {
        crate::export::to_json(&self.frames())
    }
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            let _ = handle.close();
        }
    }
}
