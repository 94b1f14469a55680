/*! Session log export and import.

Two formats: a CSV summary (timestamp, direction, length, hex dump)
and a JSON document carrying the full frames, re-importable for
replay. Timestamps are written as decimal strings in the JSON form so
nanosecond values survive JSON number round trips.
*/
use itertools::Itertools;
use serde::{Deserialize, Serialize};

use crate::frame::{DecodedFrame, Direction, FrameError, ProtocolFrame};
use crate::{Error, Result};

/// Format version written by [`to_json`] and accepted by
/// [`from_json`].
pub const EXPORT_VERSION: &str = "1.0";

/// Render the log as CSV: header
/// `Timestamp,Direction,Length,Hex`, one row per frame, timestamps in
/// millisecond floats, hex lowercase space-separated and quoted.
/// UTF-8, LF line endings, no BOM.
#[must_use]
pub fn to_csv(frames: &[ProtocolFrame]) -> String {
    let mut out = String::from("Timestamp,Direction,Length,Hex\n");
    for frame in frames {
        let hex = frame.raw.iter().map(|b| format!("{b:02x}")).join(" ");
        out.push_str(&format!(
            "{}.{:06},{},{},\"{}\"\n",
            frame.timestamp / 1_000_000,
            frame.timestamp % 1_000_000,
            frame.direction,
            frame.raw.len(),
            hex
        ));
    }
    out
}

#[derive(Serialize)]
struct ExportFile<'a> {
    version: &'static str,
    frames: Vec<ExportFrame<'a>>,
}

#[derive(Serialize)]
struct ExportFrame<'a> {
    id: u64,
    timestamp: String,
    direction: Direction,
    raw: &'a [u8],
    #[serde(skip_serializing_if = "Option::is_none")]
    decoded: Option<&'a DecodedFrame>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<&'a FrameError>,
}

/// Render the log as pretty-printed JSON.
pub fn to_json(frames: &[ProtocolFrame]) -> Result<String> {
    let doc = ExportFile {
        version: EXPORT_VERSION,
        frames: frames
            .iter()
            .map(|f| ExportFrame {
                id: f.id,
                timestamp: f.timestamp.to_string(),
                direction: f.direction,
                raw: &f.raw,
                decoded: f.decoded.as_ref(),
                error: f.error.as_ref(),
            })
            .collect(),
    };
    Ok(serde_json::to_string_pretty(&doc)?)
}

/// A frame read back from a JSON export.
///
/// Only the replayable subset is parsed; decoded fields and errors are
/// ignored.
#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct ReplayFrame {
    /// Original frame id.
    pub id: u64,
    /// Nanosecond timestamp as a decimal string.
    pub timestamp: String,
    /// Direction.
    pub direction: Direction,
    /// Raw bytes.
    pub raw: Vec<u8>,
}

impl ReplayFrame {
    /// The timestamp as nanoseconds.
    pub fn timestamp_ns(&self) -> Result<u64> {
        self.timestamp
            .parse()
            .map_err(|_| Error::InvalidConfig(format!("bad timestamp {:?}", self.timestamp)))
    }
}

/// A parsed JSON export.
#[derive(Clone, Debug, Deserialize)]
pub struct ReplayFile {
    /// Format version.
    pub version: String,
    /// Frames in log order.
    pub frames: Vec<ReplayFrame>,
}

/// Parse a JSON export produced by [`to_json`].
pub fn from_json(text: &str) -> Result<ReplayFile> {
    let file: ReplayFile = serde_json::from_str(text)?;
    if file.version != EXPORT_VERSION {
        return Err(Error::InvalidConfig(format!(
            "unsupported export version {:?}",
            file.version
        )));
    }
    Ok(file)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::ProtocolCodec;
    use crate::frame::{FieldValue, FrameField};

    fn sample_frames() -> Vec<ProtocolFrame> {
        let raw = crate::efuse::encode_frame(0x01, &[0x08, 0x00]);
        vec![
            ProtocolFrame {
                id: 1,
                timestamp: 1_500_000,
                direction: Direction::Tx,
                raw: vec![0xAB, 0xCD],
                decoded: None,
                error: None,
            },
            ProtocolFrame {
                id: 2,
                timestamp: 2_250_000_123,
                direction: Direction::Rx,
                raw: raw.clone(),
                decoded: crate::efuse::EfuseCodec.decode(&raw),
                error: None,
            },
        ]
    }

    #[test]
    fn csv_golden() {
        let csv = to_csv(&sample_frames()[..1]);
        assert_eq!(csv, "Timestamp,Direction,Length,Hex\n1.500000,tx,2,\"ab cd\"\n");
    }

    #[test]
    fn csv_has_lf_endings_and_ms_floats() {
        let csv = to_csv(&sample_frames());
        assert!(!csv.contains('\r'));
        let lines: Vec<&str> = csv.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[2].starts_with("2250.000123,rx,9,\""));
    }

    #[test]
    fn json_structure() -> Result<()> {
        let text = to_json(&sample_frames())?;
        // Two-space pretty printing.
        assert!(text.contains("\n  \"version\": \"1.0\""));
        let value: serde_json::Value = serde_json::from_str(&text)?;
        assert_eq!(value["version"], "1.0");
        let frames = value["frames"].as_array().unwrap();
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0]["id"], 1);
        assert_eq!(frames[0]["timestamp"], "1500000");
        assert_eq!(frames[0]["direction"], "tx");
        assert_eq!(frames[0]["raw"], serde_json::json!([0xAB, 0xCD]));
        assert!(frames[0].get("decoded").is_none());
        assert_eq!(frames[1]["decoded"]["protocol"], "efuse");
        assert_eq!(frames[1]["decoded"]["checksum"]["valid"], true);
        Ok(())
    }

    #[test]
    fn json_round_trip_for_replay() -> Result<()> {
        let frames = sample_frames();
        let text = to_json(&frames)?;
        let replay = from_json(&text)?;
        assert_eq!(replay.version, EXPORT_VERSION);
        assert_eq!(replay.frames.len(), 2);
        assert_eq!(replay.frames[0].raw, frames[0].raw);
        assert_eq!(replay.frames[1].timestamp_ns()?, 2_250_000_123);
        assert_eq!(replay.frames[0].direction, Direction::Tx);
        Ok(())
    }

    #[test]
    fn version_is_checked() {
        let r = from_json(r#"{"version": "9.9", "frames": []}"#);
        assert!(matches!(r, Err(Error::InvalidConfig(_))));
    }

    #[test]
    fn decoded_fields_serialize_with_type_tags() -> Result<()> {
        let mut decoded = DecodedFrame::new("efuse");
        decoded.fields.push(
            FrameField::at("voltage", FieldValue::String("1.650".into()), 4, &[8, 0])
                .with_unit("V"),
        );
        let frame = ProtocolFrame {
            id: 1,
            timestamp: 0,
            direction: Direction::Rx,
            raw: vec![],
            decoded: Some(decoded),
            error: Some(FrameError::error("CRC_MISMATCH", "boom")),
        };
        let text = to_json(&[frame])?;
        let value: serde_json::Value = serde_json::from_str(&text)?;
        let field = &value["frames"][0]["decoded"]["fields"][0];
        assert_eq!(field["name"], "voltage");
        assert_eq!(field["type"], "string");
        assert_eq!(field["value"], "1.650");
        assert_eq!(field["unit"], "V");
        assert_eq!(value["frames"][0]["error"]["severity"], "error");
        Ok(())
    }
}
