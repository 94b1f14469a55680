/*! Protocol codec contract and registry.

A codec is the triple (decode, encode, validate) for one wire format.
Codecs are stateless: every call stands alone, and both decode and
validate are total functions on arbitrary byte slices.
*/
use std::sync::Arc;

use crate::Result;
use crate::frame::{DecodedFrame, FieldValue, FrameError, FrameField};

/// Stable validation error codes.
pub mod codes {
    #![allow(missing_docs)]
    pub const FRAME_TOO_SHORT: &str = "FRAME_TOO_SHORT";
    pub const INVALID_START_MARKER: &str = "INVALID_START_MARKER";
    pub const INVALID_END_MARKER: &str = "INVALID_END_MARKER";
    pub const LENGTH_MISMATCH: &str = "LENGTH_MISMATCH";
    pub const CRC_MISMATCH: &str = "CRC_MISMATCH";
    pub const INVALID_DLC: &str = "INVALID_DLC";
    pub const EMPTY_FRAME: &str = "EMPTY_FRAME";
    pub const INVALID_COBS: &str = "INVALID_COBS";
    pub const NON_PRINTABLE: &str = "NON_PRINTABLE";
}

/// A wire format codec.
pub trait ProtocolCodec: Send + Sync {
    /// Protocol id, e.g. "efuse".
    fn name(&self) -> &'static str;

    /// Structurally parse raw bytes.
    ///
    /// Total: returns `None` for any input it cannot parse, never
    /// fails, never returns partial garbage.
    fn decode(&self, raw: &[u8]) -> Option<DecodedFrame>;

    /// Build the canonical wire representation from a field list.
    ///
    /// Fails with [`crate::Error::MissingRequiredField`] when a
    /// mandatory field is absent.
    fn encode(&self, fields: &[FrameField]) -> Result<Vec<u8>>;

    /// Report the first structural problem, or `None` if well-formed.
    ///
    /// Independent of decode: a codec may refuse to decode while
    /// validate still names a specific error, and vice versa.
    fn validate(&self, raw: &[u8]) -> Option<FrameError>;
}

/// Find a named field among encode inputs.
pub(crate) fn field<'a>(fields: &'a [FrameField], name: &str) -> Option<&'a FieldValue> {
    fields.iter().find(|f| f.name == name).map(|f| &f.value)
}

/// Find a named field, or fail with `MissingRequiredField`.
pub(crate) fn require<'a>(fields: &'a [FrameField], name: &str) -> Result<&'a FieldValue> {
    field(fields, name).ok_or_else(|| crate::Error::MissingRequiredField(name.to_string()))
}

/// Maps protocol id to codec instance.
pub struct CodecRegistry {
    codecs: Vec<Arc<dyn ProtocolCodec>>,
}

impl CodecRegistry {
    /// Empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self { codecs: Vec::new() }
    }

    /// Registry holding the default decoders, in their fixed order
    /// efuse, cobs, slip, hex, ascii.
    #[must_use]
    pub fn with_defaults() -> Self {
        let mut reg = Self::new();
        reg.register(Arc::new(crate::efuse::EfuseCodec));
        reg.register(Arc::new(crate::cobs::CobsCodec));
        reg.register(Arc::new(crate::slip::SlipCodec));
        reg.register(Arc::new(crate::hex::HexCodec));
        reg.register(Arc::new(crate::ascii::AsciiCodec));
        reg
    }

    /// Add a codec. A codec registered under an existing name shadows
    /// the earlier one.
    pub fn register(&mut self, codec: Arc<dyn ProtocolCodec>) {
        self.codecs.insert(0, codec);
    }

    /// Look up a codec by protocol id.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<Arc<dyn ProtocolCodec>> {
        self.codecs.iter().find(|c| c.name() == name).cloned()
    }

    /// Registered protocol ids, in registry order.
    #[must_use]
    pub fn names(&self) -> Vec<&'static str> {
        let mut names: Vec<&'static str> = Vec::with_capacity(self.codecs.len());
        // Later registrations shadow earlier ones.
        for c in self.codecs.iter().rev() {
            if !names.contains(&c.name()) {
                names.push(c.name());
            }
        }
        names
    }

    /// The session default decoder.
    #[must_use]
    pub fn default_codec(&self) -> Option<Arc<dyn ProtocolCodec>> {
        self.get("efuse").or_else(|| self.codecs.last().cloned())
    }
}

impl Default for CodecRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_order() {
        let reg = CodecRegistry::with_defaults();
        assert_eq!(reg.names(), vec!["efuse", "cobs", "slip", "hex", "ascii"]);
    }

    #[test]
    fn lookup() {
        let reg = CodecRegistry::with_defaults();
        assert!(reg.get("slip").is_some());
        assert!(reg.get("modbus").is_none());
        assert_eq!(reg.default_codec().unwrap().name(), "efuse");
    }

    #[test]
    fn codecs_are_total_on_garbage() {
        let reg = CodecRegistry::with_defaults();
        let garbage: Vec<u8> = (0..64).map(|i| (i * 37) as u8).collect();
        for name in reg.names() {
            let c = reg.get(name).unwrap();
            // Must not panic, whatever the outcome.
            let _ = c.decode(&garbage);
            let _ = c.validate(&garbage);
            let _ = c.decode(&[]);
            let _ = c.validate(&[]);
        }
    }
}
