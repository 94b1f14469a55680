/*! Frame data model.

Everything the pipeline passes around: per-chunk metadata from the
adapters, decoded frames from the codecs, and the protocol frames that
end up in the session log.
*/
use std::collections::BTreeMap;
use std::sync::OnceLock;
use std::time::Instant;

use serde::{Deserialize, Serialize};

static EPOCH: OnceLock<Instant> = OnceLock::new();

/// Current monotonic time in nanoseconds.
///
/// Measured from a process-wide epoch established on first call.
#[must_use]
pub fn now_ns() -> u64 {
    EPOCH.get_or_init(Instant::now).elapsed().as_nanos() as u64
}

/// Direction of a chunk or frame relative to this process.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// Received from the wire.
    Rx,
    /// Transmitted by us.
    Tx,
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Direction::Rx => write!(f, "rx"),
            Direction::Tx => write!(f, "tx"),
        }
    }
}

/// Semantic type tag of a decoded field.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[allow(missing_docs)]
pub enum FieldType {
    Uint8,
    Uint16,
    Uint32,
    Int8,
    Int16,
    Int32,
    Float,
    String,
    Bytes,
}

/// Typed value of a decoded field.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(untagged)]
#[allow(missing_docs)]
pub enum FieldValue {
    U8(u8),
    U16(u16),
    U32(u32),
    I8(i8),
    I16(i16),
    I32(i32),
    F32(f32),
    String(String),
    Bytes(Vec<u8>),
}

impl FieldValue {
    /// The type tag matching this value.
    #[must_use]
    pub fn field_type(&self) -> FieldType {
        match self {
            FieldValue::U8(_) => FieldType::Uint8,
            FieldValue::U16(_) => FieldType::Uint16,
            FieldValue::U32(_) => FieldType::Uint32,
            FieldValue::I8(_) => FieldType::Int8,
            FieldValue::I16(_) => FieldType::Int16,
            FieldValue::I32(_) => FieldType::Int32,
            FieldValue::F32(_) => FieldType::Float,
            FieldValue::String(_) => FieldType::String,
            FieldValue::Bytes(_) => FieldType::Bytes,
        }
    }

    /// Unsigned view of an integer value, if it is one.
    #[must_use]
    pub fn as_u64(&self) -> Option<u64> {
        match self {
            FieldValue::U8(v) => Some(u64::from(*v)),
            FieldValue::U16(v) => Some(u64::from(*v)),
            FieldValue::U32(v) => Some(u64::from(*v)),
            FieldValue::I8(v) if *v >= 0 => Some(*v as u64),
            FieldValue::I16(v) if *v >= 0 => Some(*v as u64),
            FieldValue::I32(v) if *v >= 0 => Some(*v as u64),
            _ => None,
        }
    }

    /// String view, if this is a string value.
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            FieldValue::String(s) => Some(s),
            _ => None,
        }
    }

    /// Byte view, if this is a bytes value.
    #[must_use]
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            FieldValue::Bytes(b) => Some(b),
            _ => None,
        }
    }
}

/// One decoded field: name, typed value, and where in the parent frame
/// it came from.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct FrameField {
    /// Field name.
    pub name: String,

    /// Typed value.
    pub value: FieldValue,

    /// Semantic type tag.
    #[serde(rename = "type")]
    pub field_type: FieldType,

    /// Raw bytes covering this field.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub raw: Vec<u8>,

    /// Offset of `raw` into the parent frame.
    pub offset: usize,

    /// Optional scaling factor applied to produce `value`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scaling: Option<f32>,

    /// Optional unit, e.g. "V".
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,
}

impl FrameField {
    /// Create a bare field with no raw slice.
    ///
    /// This is the shape used as *input* to codec encode.
    #[must_use]
    pub fn new<S: Into<String>>(name: S, value: FieldValue) -> Self {
        Self {
            name: name.into(),
            field_type: value.field_type(),
            value,
            raw: Vec::new(),
            offset: 0,
            scaling: None,
            unit: None,
        }
    }

    /// Create a field anchored at an offset with its raw bytes.
    #[must_use]
    pub fn at<S: Into<String>>(name: S, value: FieldValue, offset: usize, raw: &[u8]) -> Self {
        Self {
            name: name.into(),
            field_type: value.field_type(),
            value,
            raw: raw.to_vec(),
            offset,
            scaling: None,
            unit: None,
        }
    }

    /// Attach a unit.
    #[must_use]
    pub fn with_unit<S: Into<String>>(mut self, unit: S) -> Self {
        self.unit = Some(unit.into());
        self
    }

    /// Attach a scaling factor.
    #[must_use]
    pub fn with_scaling(mut self, scaling: f32) -> Self {
        self.scaling = Some(scaling);
        self
    }
}

/// Checksum verification result carried inside a decoded frame.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct ChecksumInfo {
    /// Checksum algorithm, e.g. "crc16-ccitt-false".
    #[serde(rename = "type")]
    pub kind: String,

    /// Value found on the wire.
    pub expected: u32,

    /// Value calculated from the data.
    pub calculated: u32,

    /// True iff expected equals calculated.
    pub valid: bool,
}

impl ChecksumInfo {
    /// Build from the wire and calculated values.
    #[must_use]
    pub fn new<S: Into<String>>(kind: S, expected: u32, calculated: u32) -> Self {
        Self {
            kind: kind.into(),
            expected,
            calculated,
            valid: expected == calculated,
        }
    }
}

/// Codec output: protocol name plus an ordered field list.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct DecodedFrame {
    /// Name of the protocol that produced this.
    pub protocol: String,

    /// Decoded fields in wire order.
    pub fields: Vec<FrameField>,

    /// Checksum verification, where the protocol has one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub checksum: Option<ChecksumInfo>,

    /// Free-form annotations.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<BTreeMap<String, String>>,
}

impl DecodedFrame {
    /// New empty frame for the named protocol.
    #[must_use]
    pub fn new<S: Into<String>>(protocol: S) -> Self {
        Self {
            protocol: protocol.into(),
            fields: Vec::new(),
            checksum: None,
            metadata: None,
        }
    }

    /// Look up a field by name.
    #[must_use]
    pub fn field(&self, name: &str) -> Option<&FrameField> {
        self.fields.iter().find(|f| f.name == name)
    }
}

/// Severity of a validation finding.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    /// Suspicious but decodable.
    Warning,
    /// Structurally broken.
    Error,
}

/// A validation finding attached to a protocol frame.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct FrameError {
    /// Stable identifier, e.g. "CRC_MISMATCH".
    pub code: String,

    /// Human readable description.
    pub message: String,

    /// Severity.
    pub severity: Severity,
}

impl FrameError {
    /// Error-severity finding.
    #[must_use]
    pub fn error<S: Into<String>>(code: &str, message: S) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
            severity: Severity::Error,
        }
    }

    /// Warning-severity finding.
    #[must_use]
    pub fn warning<S: Into<String>>(code: &str, message: S) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
            severity: Severity::Warning,
        }
    }
}

/// Transport-specific details attached to a received chunk.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
#[serde(untagged)]
pub enum TransportMeta {
    /// CAN message envelope.
    Can {
        /// Arbitration id.
        #[serde(rename = "canId")]
        id: u32,
        /// Extended (29-bit) id.
        #[serde(rename = "canExt")]
        ext: bool,
        /// Remote transmission request.
        #[serde(rename = "canRtr")]
        rtr: bool,
        /// Data length code.
        #[serde(rename = "canDlc")]
        dlc: u8,
    },
    /// UDP datagram origin.
    Udp {
        /// Remote address and port.
        #[serde(rename = "remoteAddr")]
        addr: std::net::SocketAddr,
    },
    /// I²C transaction target.
    I2c {
        /// 7-bit slave address.
        #[serde(rename = "slaveAddr")]
        addr: u8,
    },
}

/// Per-chunk metadata attached by the adapter.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct RxMeta {
    /// Nanosecond monotonic timestamp, non-decreasing per handle.
    pub timestamp: u64,

    /// Chunk direction.
    pub direction: Direction,

    /// Chunk length in bytes.
    pub length: usize,

    /// Transport-reported error, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    /// Transport-specific details.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transport: Option<TransportMeta>,
}

impl RxMeta {
    /// Received-chunk metadata.
    #[must_use]
    pub fn rx(timestamp: u64, length: usize) -> Self {
        Self {
            timestamp,
            direction: Direction::Rx,
            length,
            error: None,
            transport: None,
        }
    }

    /// Attach transport details.
    #[must_use]
    pub fn with_transport(mut self, transport: TransportMeta) -> Self {
        self.transport = Some(transport);
        self
    }
}

/// One observed unit in a session: raw bytes plus decode and
/// validation results. Immutable once appended to the session log.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ProtocolFrame {
    /// Unique, strictly monotonic id within the session.
    pub id: u64,

    /// Nanosecond timestamp.
    pub timestamp: u64,

    /// Direction.
    pub direction: Direction,

    /// Raw bytes as seen on the wire.
    pub raw: Vec<u8>,

    /// Codec decode output, if the codec produced one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub decoded: Option<DecodedFrame>,

    /// Validation finding, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<FrameError>,
}
