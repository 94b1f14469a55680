/*! Consistent Overhead Byte Stuffing.

The encoded form carries no trailing delimiter byte; framing is the
caller's business.
*/
use crate::codec::{ProtocolCodec, codes, require};
use crate::frame::{DecodedFrame, FieldValue, FrameError, FrameField};
use crate::{Error, Result};

/// COBS-encode a byte sequence.
pub(crate) fn encode_bytes(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len() + data.len() / 254 + 2);
    let mut code_pos = 0;
    out.push(0);
    let mut code = 1u8;
    for &b in data {
        if b == 0 {
            out[code_pos] = code;
            code_pos = out.len();
            out.push(0);
            code = 1;
        } else {
            out.push(b);
            code += 1;
            if code == 0xFF {
                // Long run: flush the block without consuming a zero.
                out[code_pos] = code;
                code_pos = out.len();
                out.push(0);
                code = 1;
            }
        }
    }
    out[code_pos] = code;
    out
}

/// COBS-decode a byte sequence. `None` on structural errors.
pub(crate) fn decode_bytes(data: &[u8]) -> Option<Vec<u8>> {
    if data.is_empty() {
        return None;
    }
    let mut out = Vec::with_capacity(data.len());
    let mut i = 0;
    while i < data.len() {
        let code = data[i] as usize;
        if code == 0 {
            return None;
        }
        i += 1;
        if i + code - 1 > data.len() {
            return None;
        }
        out.extend_from_slice(&data[i..i + code - 1]);
        i += code - 1;
        if code < 0xFF && i < data.len() {
            out.push(0);
        }
    }
    Some(out)
}

/// The COBS codec.
pub struct CobsCodec;

impl ProtocolCodec for CobsCodec {
    fn name(&self) -> &'static str {
        "cobs"
    }

    fn decode(&self, raw: &[u8]) -> Option<DecodedFrame> {
        let data = decode_bytes(raw)?;
        let mut d = DecodedFrame::new("cobs");
        d.fields
            .push(FrameField::at("data", FieldValue::Bytes(data), 0, raw));
        Some(d)
    }

    fn encode(&self, fields: &[FrameField]) -> Result<Vec<u8>> {
        let data = require(fields, "raw")?
            .as_bytes()
            .ok_or_else(|| Error::Encode("field \"raw\" must be bytes".into()))?;
        Ok(encode_bytes(data))
    }

    fn validate(&self, raw: &[u8]) -> Option<FrameError> {
        if raw.is_empty() {
            return Some(FrameError::error(codes::EMPTY_FRAME, "empty frame"));
        }
        if decode_bytes(raw).is_none() {
            return Some(FrameError::error(
                codes::INVALID_COBS,
                "invalid COBS structure",
            ));
        }
        None
    }
}
