//! Hex dump codec: raw bytes as a space-separated hex string.
use itertools::Itertools;

use crate::codec::{ProtocolCodec, field, require};
use crate::frame::{DecodedFrame, FieldValue, FrameError, FrameField};
use crate::{Error, Result};

/// Format bytes as lowercase hex separated by single spaces.
#[must_use]
pub fn hex_string(data: &[u8]) -> String {
    data.iter().map(|b| format!("{b:02x}")).join(" ")
}

/// The hex codec.
pub struct HexCodec;

impl ProtocolCodec for HexCodec {
    fn name(&self) -> &'static str {
        "hex"
    }

    fn decode(&self, raw: &[u8]) -> Option<DecodedFrame> {
        let mut d = DecodedFrame::new("hex");
        d.fields.push(FrameField::at(
            "hex",
            FieldValue::String(hex_string(raw)),
            0,
            raw,
        ));
        d.fields
            .push(FrameField::at("raw", FieldValue::Bytes(raw.to_vec()), 0, raw));
        Some(d)
    }

    fn encode(&self, fields: &[FrameField]) -> Result<Vec<u8>> {
        if let Some(v) = field(fields, "hex") {
            let s = v
                .as_str()
                .ok_or_else(|| Error::Encode("field \"hex\" must be a string".into()))?;
            let digits: Vec<u32> = s
                .chars()
                .filter(|c| !c.is_whitespace())
                .map(|c| {
                    c.to_digit(16)
                        .ok_or_else(|| Error::Encode(format!("invalid hex digit {c:?}")))
                })
                .collect::<Result<_>>()?;
            if digits.len() % 2 != 0 {
                return Err(Error::Encode(format!(
                    "odd number of hex digits: {}",
                    digits.len()
                )));
            }
            return Ok(digits
                .chunks(2)
                .map(|pair| (pair[0] << 4 | pair[1]) as u8)
                .collect());
        }
        let raw = require(fields, "raw")?
            .as_bytes()
            .ok_or_else(|| Error::Encode("field \"raw\" must be bytes".into()))?;
        Ok(raw.to_vec())
    }

    fn validate(&self, _raw: &[u8]) -> Option<FrameError> {
        None
    }
}
