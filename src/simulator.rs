/*! Deterministic traffic simulator, available on every transport.

A simulator handle behaves like a real one for read/write purposes.
Four modes:

* `loopback`: every write comes back to subscribers ~10 ms later,
  bytes identical.
* `scripted`: a timeline of events is played back, optionally looping.
* `burst`: every interval, a burst of synthesized frames is emitted.
* `error-inject`: loopback plus drop-with-probability; the probability
  also applies to chunks synthesized by the other modes.
*/
use std::sync::{Arc, Mutex, mpsc};
use std::time::Duration;

use log::{debug, info, trace};
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::adapter::{
    AdapterStats, CanFilter, Handle, HandleCore, OpenOptions, POLL, RxCallback, SubscriptionId,
};
use crate::device::DeviceInfo;
use crate::frame::TransportMeta;
use crate::{Error, Result};

const LOOPBACK_DELAY: Duration = Duration::from_millis(10);

/// Simulator operating mode.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SimMode {
    /// Writes are delivered back to subscribers.
    Loopback,
    /// Play back a scripted timeline.
    Scripted,
    /// Emit periodic bursts of synthesized frames.
    Burst,
    /// Loopback with error injection.
    ErrorInject,
}

/// Action of one scripted event.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SimAction {
    /// Deliver `data` to subscribers.
    Send,
    /// Deliver `data` to subscribers.
    Receive,
    /// Increment the error counter.
    Error,
    /// End the stream.
    Disconnect,
}

/// One step of a scripted timeline.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SimulatorEvent {
    /// Wait this long before acting.
    #[serde(rename = "delay", default)]
    pub delay_ms: u64,

    /// What to do.
    pub action: SimAction,

    /// Payload for send/receive.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub data: Option<Vec<u8>>,
}

/// A scripted timeline.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SimulatorScript {
    /// Ordered events.
    #[serde(default)]
    pub events: Vec<SimulatorEvent>,

    /// Restart from the first event on completion.
    #[serde(rename = "loop", default)]
    pub looping: bool,
}

/// Simulator configuration.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SimulatorConfig {
    /// Operating mode.
    pub mode: SimMode,

    /// Timeline for scripted mode.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub script: Option<SimulatorScript>,

    /// Per-chunk drop probability in [0, 1].
    #[serde(default)]
    pub error_rate: f64,

    /// Frames per burst, default 1.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub burst_size: Option<u32>,

    /// Milliseconds between bursts, default 100.
    #[serde(rename = "burstInterval", skip_serializing_if = "Option::is_none", default)]
    pub burst_interval_ms: Option<u64>,
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        Self::loopback()
    }
}

impl SimulatorConfig {
    /// Plain loopback.
    #[must_use]
    pub fn loopback() -> Self {
        Self {
            mode: SimMode::Loopback,
            script: None,
            error_rate: 0.0,
            burst_size: None,
            burst_interval_ms: None,
        }
    }

    /// Periodic bursts.
    #[must_use]
    pub fn burst(interval_ms: u64, size: u32) -> Self {
        Self {
            mode: SimMode::Burst,
            script: None,
            error_rate: 0.0,
            burst_size: Some(size),
            burst_interval_ms: Some(interval_ms),
        }
    }

    /// Scripted timeline.
    #[must_use]
    pub fn scripted(script: SimulatorScript) -> Self {
        Self {
            mode: SimMode::Scripted,
            script: Some(script),
            error_rate: 0.0,
            burst_size: None,
            burst_interval_ms: None,
        }
    }

    fn burst_size(&self) -> u32 {
        self.burst_size.unwrap_or(1).max(1)
    }

    fn burst_interval(&self) -> Duration {
        Duration::from_millis(self.burst_interval_ms.unwrap_or(100).max(1))
    }
}

/// What kind of traffic the burst mode synthesizes.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum SimTraffic {
    /// EFuse ADC frames with a sinusoidal sample value.
    EfuseAdc,
    /// Rotating automotive CAN ids in the normalized layout.
    Can,
}

/// Sleep in small steps, returning early (true) if the core closes.
pub(crate) fn sleep_closed(core: &HandleCore, total: Duration) -> bool {
    let mut remaining = total;
    while remaining > Duration::ZERO {
        if core.is_closed() {
            return true;
        }
        let step = remaining.min(POLL);
        std::thread::sleep(step);
        remaining -= step;
    }
    core.is_closed()
}

/// Drop a synthesized chunk with probability `rate`, counting it as an
/// error. Deterministic at the extremes.
fn inject_drop(core: &HandleCore, rate: f64) -> bool {
    if rate <= 0.0 {
        return false;
    }
    if rate >= 1.0 || rand::rng().random::<f64>() < rate {
        core.record_error();
        trace!("{}: injected error, chunk dropped", core.device().id);
        return true;
    }
    false
}

/// EFuse ADC burst frame: 12-bit value swinging sinusoidally around
/// 2048 with amplitude 500, one phase step per frame.
pub(crate) fn efuse_adc_frame(counter: u64) -> Vec<u8> {
    let phase = (counter % 64) as f64 / 64.0 * std::f64::consts::TAU;
    let value = (2048.0 + 500.0 * phase.sin()).round() as u16 & 0x0FFF;
    crate::efuse::encode_frame(0x01, &value.to_be_bytes())
}

/// CAN burst frame in the adapter-normalized layout, with the id and
/// data derived from the frame counter.
pub(crate) fn can_burst_frame(counter: u64) -> (Vec<u8>, TransportMeta) {
    let mut data = [0u8; 8];
    let id: u32 = if counter % 10 == 9 {
        // OBD-II request: mode 01, PID 0C (engine RPM).
        data[..3].copy_from_slice(&[0x02, 0x01, 0x0C]);
        0x7E0
    } else {
        match counter % 3 {
            0 => {
                let rpm = (800 + (counter * 37) % 2400) as u16;
                data[..2].copy_from_slice(&rpm.to_be_bytes());
                0x100
            }
            1 => {
                data[0] = ((counter * 5) % 200) as u8;
                0x200
            }
            _ => {
                data[0] = (70 + counter % 50) as u8;
                0x300
            }
        }
    };
    let bytes = crate::can::normalized(id, &data);
    (
        bytes,
        TransportMeta::Can {
            id,
            ext: false,
            rtr: false,
            dlc: 8,
        },
    )
}

enum WriteBehavior {
    /// Echo writes back through the delay worker.
    Loopback,
    /// Accept and count writes, deliver nothing.
    Swallow,
}

/// Simulator handle shared by all transports.
pub(crate) struct SimHandle {
    core: Arc<HandleCore>,
    config: SimulatorConfig,
    traffic: SimTraffic,
    filters: Mutex<Vec<CanFilter>>,
    sender: Mutex<Option<mpsc::Sender<Vec<u8>>>>,
}

impl SimHandle {
    /// Create the handle and start its worker.
    pub(crate) fn spawn(
        device: DeviceInfo,
        traffic: SimTraffic,
        config: &SimulatorConfig,
        options: &OpenOptions,
    ) -> Arc<Self> {
        let core = HandleCore::new(device);
        let rate = config.error_rate.clamp(0.0, 1.0);
        let sender = match config.mode {
            SimMode::Loopback | SimMode::ErrorInject => {
                let (tx, rx) = mpsc::channel::<Vec<u8>>();
                let c = core.clone();
                std::thread::spawn(move || run_loopback(&c, &rx, traffic, rate));
                Some(tx)
            }
            SimMode::Scripted => {
                let script = config.script.clone().unwrap_or_default();
                let c = core.clone();
                std::thread::spawn(move || run_scripted(&c, &script, rate));
                None
            }
            SimMode::Burst => {
                let c = core.clone();
                let interval = config.burst_interval();
                let size = config.burst_size();
                std::thread::spawn(move || run_burst(&c, traffic, interval, size, rate));
                None
            }
        };
        info!(
            "{}: simulator started in {:?} mode",
            core.device().id,
            config.mode
        );
        Arc::new(Self {
            core,
            config: config.clone(),
            traffic,
            filters: Mutex::new(options.can_filters.clone().unwrap_or_default()),
            sender: Mutex::new(sender),
        })
    }

    fn write_behavior(&self) -> WriteBehavior {
        match self.config.mode {
            SimMode::Loopback | SimMode::ErrorInject => WriteBehavior::Loopback,
            SimMode::Scripted | SimMode::Burst => WriteBehavior::Swallow,
        }
    }
}

fn run_loopback(core: &HandleCore, rx: &mpsc::Receiver<Vec<u8>>, traffic: SimTraffic, rate: f64) {
    while let Ok(bytes) = rx.recv() {
        if sleep_closed(core, LOOPBACK_DELAY) {
            break;
        }
        if inject_drop(core, rate) {
            continue;
        }
        let transport = match traffic {
            SimTraffic::Can => crate::can::parse_frame(&bytes).ok().map(|m| m.meta()),
            SimTraffic::EfuseAdc => None,
        };
        core.deliver(&bytes, transport);
    }
    trace!("{}: loopback worker done", core.device().id);
}

fn run_scripted(core: &HandleCore, script: &SimulatorScript, rate: f64) {
    if script.events.is_empty() {
        debug!("{}: empty script, nothing to play", core.device().id);
        return;
    }
    loop {
        for event in &script.events {
            if sleep_closed(core, Duration::from_millis(event.delay_ms)) {
                return;
            }
            match event.action {
                SimAction::Send | SimAction::Receive => {
                    let data = event.data.clone().unwrap_or_default();
                    if !inject_drop(core, rate) {
                        core.deliver(&data, None);
                    }
                }
                SimAction::Error => core.record_error(),
                SimAction::Disconnect => {
                    debug!("{}: scripted disconnect", core.device().id);
                    return;
                }
            }
        }
        if !script.looping {
            return;
        }
    }
}

fn run_burst(core: &HandleCore, traffic: SimTraffic, interval: Duration, size: u32, rate: f64) {
    let mut counter = 0u64;
    loop {
        if sleep_closed(core, interval) {
            return;
        }
        for _ in 0..size {
            let (bytes, transport) = match traffic {
                SimTraffic::EfuseAdc => (efuse_adc_frame(counter), None),
                SimTraffic::Can => {
                    let (bytes, meta) = can_burst_frame(counter);
                    (bytes, Some(meta))
                }
            };
            counter += 1;
            if inject_drop(core, rate) {
                continue;
            }
            core.deliver(&bytes, transport);
        }
    }
}

impl Handle for SimHandle {
    fn device(&self) -> &DeviceInfo {
        self.core.device()
    }

    fn write(&self, data: &[u8]) -> Result<()> {
        self.core.ensure_open()?;
        if self.traffic == SimTraffic::Can {
            // Enforce the normalized CAN layout on writes.
            let msg = crate::can::parse_frame(data).inspect_err(|_| self.core.record_error())?;
            let filters = self.filters.lock().unwrap();
            if !crate::can::filter_pass(&filters, msg.id, msg.ext) {
                // Filtered out before delivery; the write itself counts.
                self.core.record_tx(data.len());
                return Ok(());
            }
        }
        match self.write_behavior() {
            WriteBehavior::Loopback => {
                let guard = self.sender.lock().unwrap();
                let Some(tx) = guard.as_ref() else {
                    return Err(Error::Closed);
                };
                if tx.send(data.to_vec()).is_err() {
                    self.core.record_error();
                    return Err(Error::Closed);
                }
            }
            WriteBehavior::Swallow => {}
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

    fn set_options(&self, options: &OpenOptions) -> Result<()> {
        self.core.ensure_open()?;
        if let Some(filters) = &options.can_filters {
            *self.filters.lock().unwrap() = filters.clone();
        }
        Ok(())
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
