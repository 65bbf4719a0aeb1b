//! JSONL detection source.
//!
//! Reads newline-delimited detection payloads, one JSON document per line.
//! Two shapes are accepted:
//! - batch: `camera_id`, `frame_number`, `timestamp`, `frame_dimensions`
//!   and a `detections` array, one document per analyzed frame
//! - flat: `camera_id`, `timestamp`, `label`, `confidence`, `bbox`, the
//!   one-detection-per-line form live capture workers emit
//!
//! Capture workers print payloads to stdout behind a `DETECTION_JSON:`
//! prefix; the prefix is recognized and any other stdout chatter ignored.
//! Timestamps may be epoch milliseconds or RFC 3339 text.
//!
//! A line is accepted or rejected whole: one bad detection in a batch
//! document rejects the document. Rejects are counted and logged.

use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::collections::VecDeque;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use super::{DetectionSource, SourceStats};
use crate::{validate_source_id, BoundingBox, DetectionRecord};

const STDOUT_PREFIX: &str = "DETECTION_JSON:";

pub struct JsonlSource<R> {
    reader: R,
    pending: VecDeque<DetectionRecord>,
    produced: u64,
    skipped: u64,
    healthy: bool,
}

impl JsonlSource<BufReader<File>> {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path)
            .map_err(|e| anyhow!("failed to open detection log {}: {}", path.display(), e))?;
        Ok(Self::from_reader(BufReader::new(file)))
    }
}

impl<R: BufRead> JsonlSource<R> {
    pub fn from_reader(reader: R) -> Self {
        Self {
            reader,
            pending: VecDeque::new(),
            produced: 0,
            skipped: 0,
            healthy: true,
        }
    }

    /// Drain the stream into memory. Batch tooling convenience.
    pub fn read_all(&mut self) -> Result<Vec<DetectionRecord>> {
        let mut records = Vec::new();
        while let Some(record) = self.next_detection()? {
            records.push(record);
        }
        Ok(records)
    }
}

impl<R: BufRead> DetectionSource for JsonlSource<R> {
    fn next_detection(&mut self) -> Result<Option<DetectionRecord>> {
        loop {
            if let Some(record) = self.pending.pop_front() {
                self.produced += 1;
                return Ok(Some(record));
            }

            let mut line = String::new();
            let read = match self.reader.read_line(&mut line) {
                Ok(read) => read,
                Err(e) => {
                    self.healthy = false;
                    return Err(anyhow!("detection log read failed: {}", e));
                }
            };
            if read == 0 {
                return Ok(None);
            }

            let Some(payload) = extract_payload(&line) else {
                continue;
            };
            match parse_payload(payload) {
                Ok(records) => self.pending.extend(records),
                Err(e) => {
                    self.skipped += 1;
                    log::warn!("skipping malformed detection line: {}", e);
                }
            }
        }
    }

    fn is_healthy(&self) -> bool {
        self.healthy
    }

    fn stats(&self) -> SourceStats {
        SourceStats {
            produced: self.produced,
            skipped: self.skipped,
        }
    }
}

/// Returns the JSON document carried by a line, or `None` for chatter.
fn extract_payload(line: &str) -> Option<&str> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return None;
    }
    if let Some(rest) = trimmed.strip_prefix(STDOUT_PREFIX) {
        return Some(rest.trim_start());
    }
    if trimmed.starts_with('{') {
        return Some(trimmed);
    }
    None
}

fn parse_payload(payload: &str) -> Result<Vec<DetectionRecord>> {
    let envelope: WireEnvelope = serde_json::from_str(payload)?;
    envelope.into_records()
}

// -------------------- Wire Shapes --------------------

#[derive(Debug, Deserialize)]
struct WireEnvelope {
    camera_id: String,
    timestamp: WireTimestamp,
    #[serde(default)]
    frame_number: Option<u64>,
    #[serde(default)]
    frame_dimensions: Option<WireDimensions>,
    #[serde(default)]
    detections: Option<Vec<WireDetection>>,
    #[serde(default)]
    label: Option<String>,
    #[serde(default)]
    confidence: Option<f32>,
    #[serde(default)]
    bbox: Option<[f32; 4]>,
    // Live workers emit snapshot_path and image_path side by side with the
    // same value. An alias would make serde reject that as a duplicate
    // field, so they are separate fields coalesced in into_records.
    #[serde(default)]
    snapshot_path: Option<String>,
    #[serde(default)]
    image_path: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum WireTimestamp {
    Millis(i64),
    Iso(String),
}

impl WireTimestamp {
    fn resolve(&self) -> Result<i64> {
        match self {
            WireTimestamp::Millis(ms) => Ok(*ms),
            WireTimestamp::Iso(text) => {
                let parsed = chrono::DateTime::parse_from_rfc3339(text)
                    .map_err(|e| anyhow!("unparseable timestamp {:?}: {}", text, e))?;
                Ok(parsed.timestamp_millis())
            }
        }
    }
}

#[derive(Debug, Deserialize)]
struct WireDimensions {
    width: u32,
    height: u32,
}

#[derive(Debug, Deserialize)]
struct WireDetection {
    label: String,
    confidence: f32,
    bbox: [f32; 4],
    #[serde(default)]
    snapshot_path: Option<String>,
}

impl WireEnvelope {
    fn into_records(self) -> Result<Vec<DetectionRecord>> {
        validate_source_id(&self.camera_id)?;
        let source_id = self.camera_id.to_lowercase();
        let observed_at_ms = self.timestamp.resolve()?;
        let (frame_width, frame_height) = match &self.frame_dimensions {
            Some(dims) => (Some(dims.width), Some(dims.height)),
            None => (None, None),
        };

        let mut records = Vec::new();
        if let Some(detections) = self.detections {
            for detection in detections {
                let [x1, y1, x2, y2] = detection.bbox;
                let record = DetectionRecord {
                    source_id: source_id.clone(),
                    frame_index: self.frame_number,
                    observed_at_ms,
                    label: detection.label,
                    confidence: detection.confidence,
                    bounding_box: BoundingBox::new(x1, y1, x2, y2),
                    frame_width,
                    frame_height,
                    image_ref: detection
                        .snapshot_path
                        .or_else(|| self.snapshot_path.clone())
                        .or_else(|| self.image_path.clone()),
                };
                record.validate()?;
                records.push(record);
            }
        } else {
            let label = self
                .label
                .ok_or_else(|| anyhow!("line carries neither a detections array nor a label"))?;
            let confidence = self
                .confidence
                .ok_or_else(|| anyhow!("flat detection line is missing confidence"))?;
            let [x1, y1, x2, y2] = self
                .bbox
                .ok_or_else(|| anyhow!("flat detection line is missing bbox"))?;
            let record = DetectionRecord {
                source_id,
                frame_index: self.frame_number,
                observed_at_ms,
                label,
                confidence,
                bounding_box: BoundingBox::new(x1, y1, x2, y2),
                frame_width,
                frame_height,
                image_ref: self.snapshot_path.or(self.image_path),
            };
            record.validate()?;
            records.push(record);
        }
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn source(text: &str) -> JsonlSource<Cursor<Vec<u8>>> {
        JsonlSource::from_reader(Cursor::new(text.as_bytes().to_vec()))
    }

    #[test]
    fn batch_lines_fan_out_into_records() {
        let line = r#"{"camera_id":"cam-a","frame_number":17,"timestamp":"2026-07-01T12:00:00Z","frame_dimensions":{"width":640,"height":480},"detections":[{"label":"person","confidence":0.91,"bbox":[100,120,180,260]},{"label":"knife","confidence":0.74,"bbox":[160,200,200,240]}],"snapshot_path":"cam-a/000017.jpg"}"#;
        let mut src = source(line);
        let records = src.read_all().unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].source_id, "cam-a");
        assert_eq!(records[0].frame_index, Some(17));
        assert_eq!(records[0].frame_width, Some(640));
        assert_eq!(records[0].observed_at_ms, records[1].observed_at_ms);
        assert!(records[0].observed_at_ms > 0);
        assert_eq!(records[0].image_ref.as_deref(), Some("cam-a/000017.jpg"));
        assert_eq!(records[1].label, "knife");
        assert_eq!(src.stats().produced, 2);
        assert_eq!(src.stats().skipped, 0);
    }

    #[test]
    fn flat_lines_parse_with_numeric_timestamps() {
        let line = r#"{"camera_id":"Cam-B","timestamp":1719830000000,"label":"person","confidence":0.83,"bbox":[10,20,30,40],"snapshot_path":"cam-b/live.jpg"}"#;
        let mut src = source(line);
        let records = src.read_all().unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].source_id, "cam-b");
        assert_eq!(records[0].observed_at_ms, 1_719_830_000_000);
        assert_eq!(records[0].frame_index, None);
        assert_eq!(records[0].image_ref.as_deref(), Some("cam-b/live.jpg"));
    }

    #[test]
    fn live_worker_lines_carry_both_image_keys() {
        // The full v1-format key set, snapshot_path and image_path both set.
        let text = concat!(
            r#"{"type":"detection","camera_id":"cam-a","timestamp":"2026-07-01T12:00:00Z","label":"person","confidence":0.88,"frame_image":null,"snapshot_path":"http://cams:9000/snaps/cam-a_42.jpg","image_path":"http://cams:9000/snaps/cam-a_42.jpg","imageUrl":"http://cams:9000/snaps/cam-a_42.jpg","bbox":[100,120,180,260],"mode":"LIVE","id":"42"}"#,
            "\n",
            r#"{"camera_id":"cam-a","timestamp":2000,"label":"car","confidence":0.6,"bbox":[0,0,40,40],"image_path":"cam-a/fallback.jpg"}"#,
            "\n",
        );
        let mut src = source(text);
        let records = src.read_all().unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(
            records[0].image_ref.as_deref(),
            Some("http://cams:9000/snaps/cam-a_42.jpg")
        );
        assert_eq!(records[1].image_ref.as_deref(), Some("cam-a/fallback.jpg"));
        assert_eq!(src.stats().produced, 2);
        assert_eq!(src.stats().skipped, 0);
    }

    #[test]
    fn stdout_prefix_is_recognized_and_chatter_ignored() {
        let text = concat!(
            "loading model weights...\n",
            "DETECTION_JSON: {\"camera_id\":\"cam-a\",\"timestamp\":1000,\"label\":\"person\",\"confidence\":0.9,\"bbox\":[0,0,10,10]}\n",
            "done\n",
        );
        let mut src = source(text);
        let records = src.read_all().unwrap();
        assert_eq!(records.len(), 1);
        // Chatter is not an error.
        assert_eq!(src.stats().skipped, 0);
    }

    #[test]
    fn malformed_lines_are_counted_and_do_not_stop_the_stream() {
        let text = concat!(
            "{broken\n",
            "{\"camera_id\":\"cam-a\",\"timestamp\":\"not-a-time\",\"label\":\"person\",\"confidence\":0.9,\"bbox\":[0,0,1,1]}\n",
            "{\"camera_id\":\"cam-a\",\"timestamp\":2000,\"label\":\"person\",\"confidence\":1.5,\"bbox\":[0,0,1,1]}\n",
            "{\"camera_id\":\"cam-a\",\"timestamp\":3000,\"label\":\"person\",\"confidence\":0.9,\"bbox\":[0,0,1,1]}\n",
        );
        let mut src = source(text);
        let records = src.read_all().unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].observed_at_ms, 3_000);
        assert_eq!(src.stats().produced, 1);
        assert_eq!(src.stats().skipped, 3);
        assert!(src.is_healthy());
    }

    #[test]
    fn one_bad_detection_rejects_the_whole_batch_line() {
        let line = r#"{"camera_id":"cam-a","timestamp":1000,"detections":[{"label":"person","confidence":0.9,"bbox":[0,0,10,10]},{"label":"person","confidence":0.9,"bbox":[50,50,10,10]}]}"#;
        let mut src = source(line);
        let records = src.read_all().unwrap();
        assert!(records.is_empty());
        assert_eq!(src.stats().skipped, 1);
    }

    #[test]
    fn stream_end_is_none_not_error() {
        let mut src = source("");
        assert!(src.next_detection().unwrap().is_none());
        assert!(src.next_detection().unwrap().is_none());
    }
}
