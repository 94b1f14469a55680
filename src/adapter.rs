/*! Transport adapter contract.

Every transport family implements [`Adapter`]: enumerate devices, open
one with options, create simulators. An open device is a [`Handle`]:
write frames, subscribe to received chunks, snapshot statistics, close.

The shared plumbing lives in [`HandleCore`]: the subscriber set, the
telemetry counters, monotonic timestamping, and ordered delivery.
Adapters push received chunks into their core; subscribers observe
them in delivery order with strictly non-decreasing timestamps.
*/
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, mpsc};
use std::time::{Duration, Instant};

use log::{debug, error, trace, warn};
use serde::{Deserialize, Serialize};

use crate::device::{DeviceInfo, DeviceType};
use crate::frame::{RxMeta, TransportMeta, now_ns};
use crate::simulator::SimulatorConfig;
use crate::{Error, Result};

/// Poll granularity for worker loops waiting on close.
pub(crate) const POLL: Duration = Duration::from_millis(20);

/// Counters for one open handle. `uptime_ms` is computed at snapshot
/// time; everything else is monotonic.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AdapterStats {
    /// Bytes received, filters applied.
    pub bytes_rx: u64,
    /// Bytes transmitted.
    pub bytes_tx: u64,
    /// Chunks received.
    pub messages_rx: u64,
    /// Frames transmitted.
    pub messages_tx: u64,
    /// Transport and injection errors.
    pub errors: u64,
    /// Milliseconds since open.
    pub uptime_ms: u64,
}

/// UART parity.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[allow(missing_docs)]
pub enum Parity {
    None,
    Even,
    Odd,
    Mark,
    Space,
}

/// UART stop bits.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "f64", into = "f64")]
#[allow(missing_docs)]
pub enum StopBits {
    One,
    OnePointFive,
    Two,
}

impl TryFrom<f64> for StopBits {
    type Error = String;

    fn try_from(v: f64) -> std::result::Result<Self, String> {
        if v == 1.0 {
            Ok(StopBits::One)
        } else if v == 1.5 {
            Ok(StopBits::OnePointFive)
        } else if v == 2.0 {
            Ok(StopBits::Two)
        } else {
            Err(format!("invalid stop bits {v}"))
        }
    }
}

impl From<StopBits> for f64 {
    fn from(v: StopBits) -> f64 {
        match v {
            StopBits::One => 1.0,
            StopBits::OnePointFive => 1.5,
            StopBits::Two => 2.0,
        }
    }
}

/// UART flow control lines.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[allow(missing_docs)]
pub enum FlowControl {
    Rts,
    Cts,
    Dtr,
    Dsr,
    #[serde(rename = "xon-xoff")]
    XonXoff,
}

/// SPI bit order.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[allow(missing_docs)]
pub enum BitOrder {
    Msb,
    Lsb,
}

/// SPI chip select polarity.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[allow(missing_docs)]
pub enum CsPolarity {
    #[serde(rename = "active-low")]
    ActiveLow,
    #[serde(rename = "active-high")]
    ActiveHigh,
}

/// Ethernet transport selector.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[allow(missing_docs)]
pub enum EthProtocol {
    Udp,
    Tcp,
    Raw,
}

/// One CAN acceptance filter.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct CanFilter {
    /// Id to match.
    pub id: u32,
    /// Mask applied to both sides before comparing.
    pub mask: u32,
    /// When set, only match frames with this extended flag.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub extended: Option<bool>,
}

/// Open options, a superset over all transports.
///
/// Each transport reads only the fields relevant to it and ignores the
/// rest. Field names follow the external JSON/CLI spelling.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OpenOptions {
    // UART.
    /// Baud rate, default 115200.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub baud_rate: Option<u32>,
    /// Data bits 5..=8, default 8.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub data_bits: Option<u8>,
    /// Stop bits, default 1.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub stop_bits: Option<StopBits>,
    /// Parity, default none.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub parity: Option<Parity>,
    /// Flow control lines to enable.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub flow_control: Option<Vec<FlowControl>>,
    /// Read timeout in milliseconds.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub read_timeout: Option<u64>,

    // SPI.
    /// SPI mode 0..=3.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub spi_mode: Option<u8>,
    /// SPI clock in Hz.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub clock_speed: Option<u32>,
    /// SPI bit order.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub bit_order: Option<BitOrder>,
    /// Chip select polarity.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub cs_polarity: Option<CsPolarity>,
    /// Chip select hold time in microseconds.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub cs_hold_time: Option<u64>,

    // I2C.
    /// Bus speed: 100_000, 400_000 or 1_000_000.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub i2c_bus_speed: Option<u32>,
    /// Address mode: 7 or 10 bits.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub i2c_address_mode: Option<u8>,
    /// Slave address to target.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub i2c_slave_address: Option<u16>,

    // CAN.
    /// Bitrate in bit/s.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub can_bitrate: Option<u32>,
    /// CAN FD framing.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub can_fd: Option<bool>,
    /// Listen-only mode.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub can_listen_only: Option<bool>,
    /// Acceptance filters; a message passes if any filter matches.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub can_filters: Option<Vec<CanFilter>>,

    // Ethernet.
    /// udp or tcp.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub eth_protocol: Option<EthProtocol>,
    /// Port to bind or connect to.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub eth_port: Option<u16>,
    /// Remote host; selects client mode for TCP.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub eth_host: Option<String>,
    /// Multicast groups to join (UDP).
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub eth_multicast: Option<Vec<String>>,
    /// BPF filter expression; accepted but unused.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub eth_bpf_filter: Option<String>,
}

impl OpenOptions {
    /// Effective baud rate.
    #[must_use]
    pub fn baud(&self) -> u32 {
        self.baud_rate.unwrap_or(115_200)
    }

    /// Effective data bits.
    #[must_use]
    pub fn data_bits_or_default(&self) -> u8 {
        self.data_bits.unwrap_or(8)
    }

    /// Effective stop bits.
    #[must_use]
    pub fn stop_bits_or_default(&self) -> StopBits {
        self.stop_bits.unwrap_or(StopBits::One)
    }

    /// Effective parity.
    #[must_use]
    pub fn parity_or_default(&self) -> Parity {
        self.parity.unwrap_or(Parity::None)
    }
}

/// Token returned by [`Handle::subscribe`].
pub type SubscriptionId = u64;

/// Callback invoked once per received chunk.
pub type RxCallback = Box<dyn FnMut(&[u8], &RxMeta) + Send>;

/// An open wire endpoint.
pub trait Handle: Send + Sync {
    /// The device this handle was opened against.
    fn device(&self) -> &DeviceInfo;

    /// Transmit one logical frame.
    ///
    /// Increments `bytes_tx` and `messages_tx` on success, `errors` on
    /// failure. A single write failure does not close the handle.
    fn write(&self, data: &[u8]) -> Result<()>;

    /// Register a subscriber for received chunks.
    ///
    /// Subscribers are invoked in registration order. A panicking
    /// subscriber is caught and logged without blocking the others.
    fn subscribe(&self, callback: RxCallback) -> SubscriptionId;

    /// Remove a subscriber. Returns false if the token is unknown.
    fn unsubscribe(&self, id: SubscriptionId) -> bool;

    /// Apply a subset of the original options to the live handle.
    ///
    /// UART supports hot-changing baud rate and flow control lines,
    /// CAN supports replacing the filter set, others accept a no-op.
    fn set_options(&self, options: &OpenOptions) -> Result<()>;

    /// Release resources, cancel timers, clear subscribers.
    ///
    /// Idempotent. After close, all further calls fail with
    /// [`Error::Closed`].
    fn close(&self) -> Result<()>;

    /// Snapshot of the counters.
    fn stats(&self) -> AdapterStats;
}

/// A transport family.
pub trait Adapter: Send + Sync {
    /// The family this adapter serves.
    fn device_type(&self) -> DeviceType;

    /// Enumerate currently visible endpoints.
    ///
    /// On platforms where enumeration is not supported this returns
    /// the single simulator entry.
    fn list_devices(&self) -> Result<Vec<DeviceInfo>>;

    /// Acquire the wire.
    fn open(&self, device: &DeviceInfo, options: &OpenOptions) -> Result<Arc<dyn Handle>>;

    /// Whether [`Adapter::create_simulator`] is available.
    fn supports_simulation(&self) -> bool {
        true
    }

    /// Create a simulator handle, indistinguishable from a real one
    /// for read/write purposes.
    fn create_simulator(&self, config: &SimulatorConfig) -> Result<Arc<dyn Handle>>;
}

/// Look up the adapter serving a device type.
#[must_use]
pub fn adapter_for(device_type: DeviceType) -> Box<dyn Adapter> {
    match device_type {
        DeviceType::Uart => Box::new(crate::uart::UartAdapter),
        DeviceType::Spi => Box::new(crate::spi::SpiAdapter),
        DeviceType::I2c => Box::new(crate::i2c::I2cAdapter),
        DeviceType::Can => Box::new(crate::can::CanAdapter),
        DeviceType::Ethernet => Box::new(crate::ethernet::EthernetAdapter),
    }
}

struct Subscriber {
    id: SubscriptionId,
    callback: RxCallback,
}

#[derive(Default)]
struct Counters {
    bytes_rx: u64,
    bytes_tx: u64,
    messages_rx: u64,
    messages_tx: u64,
    errors: u64,
}

/// Shared state of one open handle.
pub(crate) struct HandleCore {
    device: DeviceInfo,
    opened: Instant,
    closed: AtomicBool,
    last_ts: AtomicU64,
    next_sub: AtomicU64,
    subscribers: Mutex<Vec<Subscriber>>,
    counters: Mutex<Counters>,
}

impl HandleCore {
    pub(crate) fn new(device: DeviceInfo) -> Arc<Self> {
        Arc::new(Self {
            device,
            opened: Instant::now(),
            closed: AtomicBool::new(false),
            last_ts: AtomicU64::new(0),
            next_sub: AtomicU64::new(1),
            subscribers: Mutex::new(Vec::new()),
            counters: Mutex::new(Counters::default()),
        })
    }

    pub(crate) fn device(&self) -> &DeviceInfo {
        &self.device
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub(crate) fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(Error::Closed);
        }
        Ok(())
    }

    /// First close wins; also clears the subscriber set.
    pub(crate) fn mark_closed(&self) -> bool {
        let first = !self.closed.swap(true, Ordering::SeqCst);
        if first {
            self.subscribers.lock().unwrap().clear();
            debug!("{}: closed", self.device.id);
        }
        first
    }

    pub(crate) fn subscribe(&self, callback: RxCallback) -> SubscriptionId {
        let id = self.next_sub.fetch_add(1, Ordering::SeqCst);
        self.subscribers
            .lock()
            .unwrap()
            .push(Subscriber { id, callback });
        id
    }

    pub(crate) fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut subs = self.subscribers.lock().unwrap();
        let before = subs.len();
        subs.retain(|s| s.id != id);
        subs.len() != before
    }

    /// Next timestamp, clamped so it never decreases on this handle.
    pub(crate) fn stamp(&self) -> u64 {
        let now = now_ns();
        let prev = self.last_ts.fetch_max(now, Ordering::SeqCst);
        now.max(prev)
    }

    /// Count and deliver one received chunk to all subscribers, in
    /// registration order, serialized on the caller's thread.
    pub(crate) fn deliver(&self, bytes: &[u8], transport: Option<TransportMeta>) {
        if self.is_closed() {
            return;
        }
        let mut meta = RxMeta::rx(self.stamp(), bytes.len());
        meta.transport = transport;
        {
            let mut c = self.counters.lock().unwrap();
            c.bytes_rx += bytes.len() as u64;
            c.messages_rx += 1;
        }
        trace!("{}: rx chunk of {} bytes", self.device.id, bytes.len());
        let mut subs = self.subscribers.lock().unwrap();
        for sub in subs.iter_mut() {
            let r = std::panic::catch_unwind(AssertUnwindSafe(|| {
                (sub.callback)(bytes, &meta);
            }));
            if r.is_err() {
                error!(
                    "{}: rx subscriber {} panicked, continuing",
                    self.device.id, sub.id
                );
            }
        }
    }

    pub(crate) fn record_tx(&self, len: usize) {
        let mut c = self.counters.lock().unwrap();
        c.bytes_tx += len as u64;
        c.messages_tx += 1;
    }

    pub(crate) fn record_error(&self) {
        self.counters.lock().unwrap().errors += 1;
    }

    pub(crate) fn snapshot(&self) -> AdapterStats {
        let c = self.counters.lock().unwrap();
        AdapterStats {
            bytes_rx: c.bytes_rx,
            bytes_tx: c.bytes_tx,
            messages_rx: c.messages_rx,
            messages_tx: c.messages_tx,
            errors: c.errors,
            uptime_ms: self.opened.elapsed().as_millis() as u64,
        }
    }
}

/// A chunk queued for delayed delivery.
pub(crate) struct Delayed {
    pub(crate) bytes: Vec<u8>,
    pub(crate) transport: Option<TransportMeta>,
}

/// Spawn a worker that delivers queued chunks after a fixed delay,
/// preserving queue order. Used by the simulators to model wire
/// latency. The worker exits when the sender is dropped or the core
/// closes.
pub(crate) fn spawn_delayed_deliverer(
    core: Arc<HandleCore>,
    delay: Duration,
) -> mpsc::Sender<Delayed> {
    let (tx, rx) = mpsc::channel::<Delayed>();
    std::thread::spawn(move || {
        while let Ok(job) = rx.recv() {
            if crate::simulator::sleep_closed(&core, delay) {
                break;
            }
            core.deliver(&job.bytes, job.transport);
        }
        trace!("{}: delivery worker done", core.device().id);
    });
    tx
}

/// Convenience for handles that keep their delayed-delivery sender
/// behind a mutex so close can drop it.
pub(crate) fn send_delayed(
    sender: &Mutex<Option<mpsc::Sender<Delayed>>>,
    job: Delayed,
) -> Result<()> {
    let guard = sender.lock().unwrap();
    match guard.as_ref() {
        Some(tx) => {
            if tx.send(job).is_err() {
                warn!("delivery worker is gone");
                return Err(Error::Closed);
            }
            Ok(())
        }
        None => Err(Error::Closed),
    }
}
