/*! SLIP framing, RFC 1055.
*/
use crate::codec::{ProtocolCodec, codes, require};
use crate::frame::{DecodedFrame, FieldValue, FrameError, FrameField};
use crate::{Error, Result};

const SLIP_END: u8 = 0xC0;
const SLIP_ESC: u8 = 0xDB;
const SLIP_ESC_END: u8 = 0xDC;
const SLIP_ESC_ESC: u8 = 0xDD;

/// Escape a byte sequence and append the trailing END.
pub(crate) fn encode_bytes(data: &[u8]) -> Vec<u8> {
    // Add 10% capacity to leave room for escapes.
    let mut out = Vec::with_capacity((1 + data.len()) * 110 / 100);
    for &b in data {
        match b {
            SLIP_END => out.extend([SLIP_ESC, SLIP_ESC_END]),
            SLIP_ESC => out.extend([SLIP_ESC, SLIP_ESC_ESC]),
            b => out.push(b),
        }
    }
    out.push(SLIP_END);
    out
}

/// Unescape until END or exhaustion. `None` on a bad escape.
pub(crate) fn decode_bytes(data: &[u8]) -> Option<Vec<u8>> {
    let mut out = Vec::with_capacity(data.len());
    let mut i = 0;
    while i < data.len() {
        match data[i] {
            SLIP_END => break,
            SLIP_ESC => {
                match data.get(i + 1) {
                    Some(&SLIP_ESC_END) => out.push(SLIP_END),
                    Some(&SLIP_ESC_ESC) => out.push(SLIP_ESC),
                    _ => return None,
                }
                i += 2;
            }
            b => {
                out.push(b);
                i += 1;
            }
        }
    }
    Some(out)
}

/// The SLIP codec.
pub struct SlipCodec;

impl ProtocolCodec for SlipCodec {
    fn name(&self) -> &'static str {
        "slip"
    }

    fn decode(&self, raw: &[u8]) -> Option<DecodedFrame> {
        let data = decode_bytes(raw)?;
        let mut d = DecodedFrame::new("slip");
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
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip() {
        for data in [
            vec![],
            vec![0x01, 0x02, 0x03],
            vec![SLIP_END],
            vec![SLIP_ESC],
            vec![SLIP_ESC, SLIP_END, SLIP_ESC_END, SLIP_ESC_ESC],
            (0..=255u8).collect::<Vec<_>>(),
        ] {
            let encoded = encode_bytes(&data);
            // No embedded END before the trailing one.
            assert_eq!(
                encoded.iter().position(|&b| b == SLIP_END),
                Some(encoded.len() - 1),
                "data {data:02x?}"
            );
            assert_eq!(decode_bytes(&encoded).unwrap(), data);
        }
    }

    #[test]
    fn escape_expansion() {
        assert_eq!(
            encode_bytes(&[SLIP_END]),
            vec![SLIP_ESC, SLIP_ESC_END, SLIP_END]
        );
        assert_eq!(
            encode_bytes(&[SLIP_ESC]),
            vec![SLIP_ESC, SLIP_ESC_ESC, SLIP_END]
        );
    }

    #[test]
    fn bad_escape() {
        assert!(decode_bytes(&[SLIP_ESC, 0x42]).is_none());
        // Trailing lone escape.
        assert!(decode_bytes(&[0x01, SLIP_ESC]).is_none());
    }

    #[test]
    fn stops_at_end_marker() {
        let decoded = decode_bytes(&[0x01, SLIP_END, 0x02, 0x03]).unwrap();
        assert_eq!(decoded, vec![0x01]);
    }

    #[test]
    fn round_trip_random() {
        use rand::Rng;
        let mut rng = rand::rng();
        for _ in 0..50 {
            let len = rng.random_range(0..400);
            let data: Vec<u8> = (0..len).map(|_| rng.random()).collect();
            assert_eq!(decode_bytes(&encode_bytes(&data)).unwrap(), data);
        }
    }

    #[test]
    fn validate_empty_only() {
        assert_eq!(
            SlipCodec.validate(&[]).unwrap().code,
            codes::EMPTY_FRAME
        );
        assert!(SlipCodec.validate(&[SLIP_ESC, 0x42]).is_none());
        assert!(SlipCodec.validate(&[0x01]).is_none());
    }
}
