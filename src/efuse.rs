/*! EFuse framed format.

Wire layout, in order:

```text
0xAA | type:u8 | length:u16 BE | payload[length] | crc:u16 BE | 0xBB
```

`crc` is CRC-16/CCITT-FALSE over type, length, and payload. A frame
with a wrong CRC still decodes, with `checksum.valid == false`;
validate reports it as `CRC_MISMATCH` separately. The two paths are
deliberately not unified.
*/
use crate::codec::{ProtocolCodec, codes, require};
use crate::crc::crc16_ccitt_false;
use crate::frame::{ChecksumInfo, DecodedFrame, FieldValue, FrameError, FrameField};
use crate::{Error, Result};

const START: u8 = 0xAA;
const END: u8 = 0xBB;

/// Start, type, two length bytes, two CRC bytes, end.
const OVERHEAD: usize = 7;

const CHECKSUM_KIND: &str = "crc16-ccitt-false";

/// Build a complete frame around a payload.
pub(crate) fn encode_frame(ftype: u8, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(OVERHEAD + payload.len());
    out.push(START);
    out.push(ftype);
    out.extend_from_slice(&(payload.len() as u16).to_be_bytes());
    out.extend_from_slice(payload);
    let crc = crc16_ccitt_false(&out[1..]);
    out.extend_from_slice(&crc.to_be_bytes());
    out.push(END);
    out
}

struct Parsed<'a> {
    ftype: u8,
    length: u16,
    payload: &'a [u8],
    wire_crc: u16,
    calc_crc: u16,
}

fn parse(raw: &[u8]) -> Option<Parsed<'_>> {
    if raw.len() < OVERHEAD {
        return None;
    }
    if raw[0] != START || raw[raw.len() - 1] != END {
        return None;
    }
    let length = u16::from_be_bytes([raw[2], raw[3]]);
    if raw.len() != OVERHEAD + length as usize {
        return None;
    }
    let payload = &raw[4..4 + length as usize];
    let crc_at = 4 + length as usize;
    Some(Parsed {
        ftype: raw[1],
        length,
        payload,
        wire_crc: u16::from_be_bytes([raw[crc_at], raw[crc_at + 1]]),
        calc_crc: crc16_ccitt_false(&raw[1..crc_at]),
    })
}

/// The EFuse codec.
pub struct EfuseCodec;

impl ProtocolCodec for EfuseCodec {
    fn name(&self) -> &'static str {
        "efuse"
    }

    fn decode(&self, raw: &[u8]) -> Option<DecodedFrame> {
        let p = parse(raw)?;
        let mut d = DecodedFrame::new("efuse");
        d.fields
            .push(FrameField::at("type", FieldValue::U8(p.ftype), 1, &raw[1..2]));
        d.fields.push(FrameField::at(
            "length",
            FieldValue::U16(p.length),
            2,
            &raw[2..4],
        ));
        d.fields.push(FrameField::at(
            "payload",
            FieldValue::Bytes(p.payload.to_vec()),
            4,
            p.payload,
        ));
        match p.ftype {
            0x01 if p.payload.len() >= 2 => {
                let adc_raw = u16::from_be_bytes([p.payload[0], p.payload[1]]);
                let voltage = f32::from(adc_raw) * 3.3 / 4095.0;
                d.fields.push(FrameField::at(
                    "adc_raw",
                    FieldValue::U16(adc_raw),
                    4,
                    &p.payload[..2],
                ));
                d.fields.push(
                    FrameField::at(
                        "voltage",
                        FieldValue::String(format!("{voltage:.3}")),
                        4,
                        &p.payload[..2],
                    )
                    .with_scaling(3.3 / 4095.0)
                    .with_unit("V"),
                );
            }
            0x02 if !p.payload.is_empty() => {
                let status = p.payload[0];
                d.fields.push(FrameField::at(
                    "status",
                    FieldValue::U8(status),
                    4,
                    &p.payload[..1],
                ));
                d.fields.push(FrameField::at(
                    "ready",
                    FieldValue::U8(status & 0x01),
                    4,
                    &p.payload[..1],
                ));
                d.fields.push(FrameField::at(
                    "error",
                    FieldValue::U8((status & 0x02) >> 1),
                    4,
                    &p.payload[..1],
                ));
            }
            0x03 if p.payload.len() >= 4 => {
                let value = u32::from_be_bytes([
                    p.payload[0],
                    p.payload[1],
                    p.payload[2],
                    p.payload[3],
                ]);
                d.fields.push(FrameField::at(
                    "config_value",
                    FieldValue::U32(value),
                    4,
                    &p.payload[..4],
                ));
            }
            _ => {}
        }
        d.checksum = Some(ChecksumInfo::new(
            CHECKSUM_KIND,
            u32::from(p.wire_crc),
            u32::from(p.calc_crc),
        ));
        Some(d)
    }

    fn encode(&self, fields: &[FrameField]) -> Result<Vec<u8>> {
        let ftype = require(fields, "type")?
            .as_u64()
            .filter(|v| *v <= 0xff)
            .ok_or_else(|| Error::Encode("field \"type\" must be a byte".into()))?;
        let payload = require(fields, "payload")?
            .as_bytes()
            .ok_or_else(|| Error::Encode("field \"payload\" must be bytes".into()))?;
        if payload.len() > usize::from(u16::MAX) {
            return Err(Error::Encode(format!(
                "payload too long: {} bytes, max 65535",
                payload.len()
            )));
        }
        Ok(encode_frame(ftype as u8, payload))
    }

    fn validate(&self, raw: &[u8]) -> Option<FrameError> {
        if raw.len() < OVERHEAD {
            return Some(FrameError::error(
                codes::FRAME_TOO_SHORT,
                format!("frame is {} bytes, minimum {OVERHEAD}", raw.len()),
            ));
        }
        if raw[0] != START {
            return Some(FrameError::error(
                codes::INVALID_START_MARKER,
                format!("expected start marker {START:#04x}, got {:#04x}", raw[0]),
            ));
        }
        if raw[raw.len() - 1] != END {
            return Some(FrameError::error(
                codes::INVALID_END_MARKER,
                format!(
                    "expected end marker {END:#04x}, got {:#04x}",
                    raw[raw.len() - 1]
                ),
            ));
        }
        let length = u16::from_be_bytes([raw[2], raw[3]]) as usize;
        if raw.len() != OVERHEAD + length {
            return Some(FrameError::error(
                codes::LENGTH_MISMATCH,
                format!(
                    "declared payload length {length} implies {} bytes, frame is {}",
                    OVERHEAD + length,
                    raw.len()
                ),
            ));
        }
        let crc_at = 4 + length;
        let wire = u16::from_be_bytes([raw[crc_at], raw[crc_at + 1]]);
        let calc = crc16_ccitt_false(&raw[1..crc_at]);
        if wire != calc {
            return Some(FrameError::error(
                codes::CRC_MISMATCH,
                format!("CRC on wire {wire:#06x}, calculated {calc:#06x}"),
            ));
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Result;

    fn adc_frame() -> Vec<u8> {
        // type 0x01, payload 08 00 (adc_raw 2048).
        encode_frame(0x01, &[0x08, 0x00])
    }

    #[test]
    fn adc_decode() {
        let raw = adc_frame();
        assert_eq!(raw.len(), 9);
        assert_eq!(raw[0], 0xAA);
        assert_eq!(raw[raw.len() - 1], 0xBB);
        let d = EfuseCodec.decode(&raw).unwrap();
        assert_eq!(d.field("type").unwrap().value, FieldValue::U8(1));
        assert_eq!(d.field("length").unwrap().value, FieldValue::U16(2));
        assert_eq!(
            d.field("payload").unwrap().value,
            FieldValue::Bytes(vec![0x08, 0x00])
        );
        assert_eq!(d.field("adc_raw").unwrap().value, FieldValue::U16(2048));
        let voltage = d.field("voltage").unwrap();
        assert_eq!(voltage.value, FieldValue::String("1.650".to_string()));
        assert_eq!(voltage.unit.as_deref(), Some("V"));
        assert!(d.checksum.unwrap().valid);
        assert!(EfuseCodec.validate(&raw).is_none());
    }

    #[test]
    fn crc_mismatch_decodes_but_fails_validate() {
        let mut raw = adc_frame();
        // Zero out the CRC field.
        let n = raw.len();
        raw[n - 3] = 0;
        raw[n - 2] = 0;
        let d = EfuseCodec.decode(&raw).unwrap();
        assert!(!d.checksum.unwrap().valid);
        let e = EfuseCodec.validate(&raw).unwrap();
        assert_eq!(e.code, codes::CRC_MISMATCH);
    }

    #[test]
    fn length_mismatch() {
        let mut raw = adc_frame();
        // Declare a 5-byte payload in a 9-byte frame.
        raw[3] = 0x05;
        assert!(EfuseCodec.decode(&raw).is_none());
        let e = EfuseCodec.validate(&raw).unwrap();
        assert_eq!(e.code, codes::LENGTH_MISMATCH);
    }

    #[test]
    fn validate_check_order() {
        assert_eq!(
            EfuseCodec.validate(&[0xAA, 0xBB]).unwrap().code,
            codes::FRAME_TOO_SHORT
        );
        assert_eq!(
            EfuseCodec
                .validate(&[0x00, 1, 0, 0, 0, 0, 0xBB])
                .unwrap()
                .code,
            codes::INVALID_START_MARKER
        );
        assert_eq!(
            EfuseCodec
                .validate(&[0xAA, 1, 0, 0, 0, 0, 0x00])
                .unwrap()
                .code,
            codes::INVALID_END_MARKER
        );
    }

    #[test]
    fn status_frame_bits() {
        let raw = encode_frame(0x02, &[0x03]);
        let d = EfuseCodec.decode(&raw).unwrap();
        assert_eq!(d.field("status").unwrap().value, FieldValue::U8(3));
        assert_eq!(d.field("ready").unwrap().value, FieldValue::U8(1));
        assert_eq!(d.field("error").unwrap().value, FieldValue::U8(1));
    }

    #[test]
    fn config_frame_value() {
        let raw = encode_frame(0x03, &[0xDE, 0xAD, 0xBE, 0xEF]);
        let d = EfuseCodec.decode(&raw).unwrap();
        assert_eq!(
            d.field("config_value").unwrap().value,
            FieldValue::U32(0xDEAD_BEEF)
        );
    }

    #[test]
    fn unknown_type_has_no_extra_fields() {
        let raw = encode_frame(0x7F, &[1, 2, 3]);
        let d = EfuseCodec.decode(&raw).unwrap();
        assert_eq!(d.fields.len(), 3);
    }

    #[test]
    fn round_trip() -> Result<()> {
        for (ftype, payload) in [
            (0u8, vec![]),
            (1, vec![0x08, 0x00]),
            (2, vec![0x01]),
            (3, vec![1, 2, 3, 4]),
            (0xFF, (0..=255u8).collect()),
        ] {
            let raw = EfuseCodec.encode(&[
                FrameField::new("type", FieldValue::U8(ftype)),
                FrameField::new("payload", FieldValue::Bytes(payload.clone())),
            ])?;
            let d = EfuseCodec.decode(&raw).unwrap();
            assert_eq!(d.field("type").unwrap().value.as_u64(), Some(ftype.into()));
            assert_eq!(
                d.field("payload").unwrap().value.as_bytes().unwrap(),
                &payload[..]
            );
            assert!(d.checksum.unwrap().valid);
            assert!(EfuseCodec.validate(&raw).is_none());
        }
        Ok(())
    }

    #[test]
    fn round_trip_random() -> Result<()> {
        use rand::Rng;
        let mut rng = rand::rng();
        for _ in 0..50 {
            let len = rng.random_range(0..300);
            let payload: Vec<u8> = (0..len).map(|_| rng.random()).collect();
            let ftype: u8 = rng.random();
            let raw = EfuseCodec.encode(&[
                FrameField::new("type", FieldValue::U8(ftype)),
                FrameField::new("payload", FieldValue::Bytes(payload.clone())),
            ])?;
            let d = EfuseCodec.decode(&raw).unwrap();
            assert_eq!(
                d.field("payload").unwrap().value.as_bytes().unwrap(),
                &payload[..]
            );
            assert!(d.checksum.unwrap().valid);
        }
        Ok(())
    }

    #[test]
    fn encode_missing_fields() {
        let r = EfuseCodec.encode(&[FrameField::new("type", FieldValue::U8(1))]);
        assert!(matches!(
            r,
            Err(crate::Error::MissingRequiredField(ref f)) if f == "payload"
        ));
        let r = EfuseCodec.encode(&[FrameField::new(
            "payload",
            FieldValue::Bytes(vec![1]),
        )]);
        assert!(matches!(
            r,
            Err(crate::Error::MissingRequiredField(ref f)) if f == "type"
        ));
    }

    #[test]
    fn truncated_and_garbage() {
        assert!(EfuseCodec.decode(&[]).is_none());
        assert!(EfuseCodec.decode(&[0xAA]).is_none());
        assert!(EfuseCodec.decode(b"garbage").is_none());
    }
}
