#![warn(missing_docs)]
/*! CommWatch observes, decodes, synthesizes, and replays byte streams
over a heterogeneous set of wire transports.

Supported transport families are asynchronous serial (UART), CAN bus,
SPI, I²C, and Ethernet (UDP and TCP). Every transport is normalized
into the same shape: an adapter opens a device and hands back a handle
that emits timestamped byte chunks and accepts frame writes, with
per-handle telemetry counters.

# Architecture overview

```text
   [ Transport adapter ]      uart / can / ethernet / spi / i2c,
           ↓                  real hardware or simulator
    (chunk, rx meta)
           ↓
   [ Session pipeline ]       frame ids, timestamps
           ↓
   [ Codec decode+validate ]  efuse / cobs / slip / hex / ascii
           ↓
   [ Session log ]  →  [ Event bus ]  →  subscribers, exports
```

An adapter's `open` returns a [`adapter::Handle`]: `write` transmits
one logical frame, `subscribe` registers a callback invoked once per
received chunk, `stats` snapshots the counters. Every adapter can also
create a deterministic simulator handle (loopback, scripted timeline,
periodic burst, error injection) that is indistinguishable from a real
one for read/write purposes.

Codecs are stateless and total: `decode` returns either a well-formed
[`frame::DecodedFrame`] or nothing, `validate` independently reports
the first structural problem, and `encode` builds the canonical wire
representation from a field list.

# Example

Encode an EFuse ADC frame and decode it back:

```
use commwatch::codec::{CodecRegistry, ProtocolCodec};
use commwatch::frame::{FieldValue, FrameField};

let reg = CodecRegistry::with_defaults();
let efuse = reg.get("efuse").unwrap();
let raw = efuse.encode(&[
    FrameField::new("type", FieldValue::U8(1)),
    FrameField::new("payload", FieldValue::Bytes(vec![0x08, 0x00])),
])?;
let decoded = efuse.decode(&raw).unwrap();
assert!(decoded.checksum.unwrap().valid);
# Ok::<(), commwatch::Error>(())
```
 */

pub mod adapter;
pub mod ascii;
pub mod can;
pub mod cobs;
pub mod codec;
pub mod config;
pub mod crc;
pub mod device;
pub mod efuse;
pub mod ethernet;
pub mod event;
pub mod export;
pub mod frame;
pub mod hex;
pub mod i2c;
pub mod session;
pub mod simulator;
pub mod slip;
pub mod spi;
pub mod uart;

/// CommWatch error.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Device has no path to open.
    #[error("device path missing")]
    DevicePathMissing,

    /// An option is not supported by this transport or platform.
    #[error("unsupported option: {0}")]
    UnsupportedOption(String),

    /// The handle has been closed.
    #[error("handle is closed")]
    Closed,

    /// Encode was called without a mandatory field.
    #[error("missing required field: {0}")]
    MissingRequiredField(String),

    /// No codec registered under this name.
    #[error("unknown protocol: {0}")]
    UnknownProtocol(String),

    /// A config record failed validation.
    #[error("invalid config: {0}")]
    InvalidConfig(String),

    /// Malformed input to an encoder.
    #[error("encode error: {0}")]
    Encode(String),

    /// CAN frame with more than 8 data bytes.
    #[error("invalid dlc {0}, max 8")]
    InvalidDlc(usize),

    /// Transport-level failure (open, read, write, disconnect).
    #[error("transport error: {0}")]
    Transport(String),

    /// JSON serialization or parse failure.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// CommWatch result type.
pub type Result<T, E = Error> = std::result::Result<T, E>;

pub use adapter::{Adapter, AdapterStats, Handle, OpenOptions, adapter_for};
pub use device::{DeviceInfo, DeviceType};
pub use event::{Event, EventBus, EventKind};
pub use frame::{DecodedFrame, Direction, FrameError, ProtocolFrame, RxMeta};
pub use session::Session;
pub use simulator::SimulatorConfig;
