//! ASCII text codec.
use crate::codec::{ProtocolCodec, codes, field, require};
use crate::frame::{DecodedFrame, FieldValue, FrameError, FrameField};
use crate::{Error, Result};

fn printable(b: u8) -> bool {
    b >= 0x20 || b == b'\t' || b == b'\n' || b == b'\r'
}

/// The ASCII codec.
///
/// Bytes outside 7-bit ASCII pass through the lossy converter rather
/// than failing decode.
pub struct AsciiCodec;

impl ProtocolCodec for AsciiCodec {
    fn name(&self) -> &'static str {
        "ascii"
    }

    fn decode(&self, raw: &[u8]) -> Option<DecodedFrame> {
        let mut d = DecodedFrame::new("ascii");
        d.fields.push(FrameField::at(
            "text",
            FieldValue::String(String::from_utf8_lossy(raw).into_owned()),
            0,
            raw,
        ));
        Some(d)
    }

    fn encode(&self, fields: &[FrameField]) -> Result<Vec<u8>> {
        if let Some(v) = field(fields, "text") {
            let s = v
                .as_str()
                .ok_or_else(|| Error::Encode("field \"text\" must be a string".into()))?;
            return Ok(s.as_bytes().to_vec());
        }
        let raw = require(fields, "raw")?
            .as_bytes()
            .ok_or_else(|| Error::Encode("field \"raw\" must be bytes".into()))?;
        Ok(raw.to_vec())
    }

    fn validate(&self, raw: &[u8]) -> Option<FrameError> {
        let bad = raw.iter().filter(|&&b| !printable(b)).count();
        if bad > 0 {
            return Some(FrameError::warning(
                codes::NON_PRINTABLE,
                format!("{bad} non-printable byte(s)"),
            ));
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::Severity;

    #[test]
    fn decode_plain_text() {
        let d = AsciiCodec.decode(b"hello\r\n").unwrap();
        assert_eq!(
            d.field("text").unwrap().value,
            FieldValue::String("hello\r\n".to_string())
        );
        assert!(AsciiCodec.validate(b"hello\r\n").is_none());
    }

    #[test]
    fn decode_is_lossy_not_failing() {
        let d = AsciiCodec.decode(&[0x68, 0x69, 0xFF]).unwrap();
        let text = d.field("text").unwrap().value.as_str().unwrap().to_owned();
        assert!(text.starts_with("hi"));
    }

    #[test]
    fn non_printable_is_a_warning() {
        let e = AsciiCodec.validate(&[0x01, b'a']).unwrap();
        assert_eq!(e.code, codes::NON_PRINTABLE);
        assert_eq!(e.severity, Severity::Warning);
        // Tab, LF and CR are fine.
        assert!(AsciiCodec.validate(b"a\tb\nc\rd").is_none());
    }

    #[test]
    fn encode_text_and_raw() {
        let raw = AsciiCodec
            .encode(&[FrameField::new(
                "text",
                FieldValue::String("ok".to_string()),
            )])
            .unwrap();
        assert_eq!(raw, b"ok");
        let raw = AsciiCodec
            .encode(&[FrameField::new("raw", FieldValue::Bytes(vec![0x41]))])
            .unwrap();
        assert_eq!(raw, b"A");
        assert!(matches!(
            AsciiCodec.encode(&[]),
            Err(Error::MissingRequiredField(_))
        ));
    }
}
