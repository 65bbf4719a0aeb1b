//! Synthetic detection source.
//!
//! Emits a deterministic walk: one object sweeping across the frame at a
//! fixed cadence, with a silence gap injected every `gap_every` records so
//! downstream episode splitting has something to split on. Two sources
//! built from the same config emit byte-identical streams.

use anyhow::{anyhow, Result};

use super::{DetectionSource, SourceStats};
use crate::{validate_source_id, BoundingBox, DetectionRecord};

#[derive(Clone, Debug)]
pub struct StubConfig {
    pub source_id: String,
    /// records to emit before the stream ends
    pub total: u64,
    pub step_ms: i64,
    /// inject a gap after every N records; 0 disables gaps
    pub gap_every: u64,
    pub gap_ms: i64,
    pub start_ms: i64,
}

impl Default for StubConfig {
    fn default() -> Self {
        Self {
            source_id: "stub-0".to_string(),
            total: 120,
            step_ms: 200,
            gap_every: 40,
            gap_ms: 5_000,
            start_ms: 0,
        }
    }
}

pub struct StubSource {
    config: StubConfig,
    emitted: u64,
    next_ms: i64,
}

impl StubSource {
    pub fn new(config: StubConfig) -> Result<Self> {
        validate_source_id(&config.source_id)?;
        if config.step_ms <= 0 {
            return Err(anyhow!("step_ms must be > 0, got {}", config.step_ms));
        }
        if config.gap_ms < 0 {
            return Err(anyhow!("gap_ms must be >= 0, got {}", config.gap_ms));
        }
        let next_ms = config.start_ms;
        Ok(Self {
            config,
            emitted: 0,
            next_ms,
        })
    }
}

impl DetectionSource for StubSource {
    fn next_detection(&mut self) -> Result<Option<DetectionRecord>> {
        if self.emitted >= self.config.total {
            return Ok(None);
        }

        let step = self.emitted % 50;
        let x1 = 40.0 + step as f32 * 10.0;
        let label = if self.emitted % 25 == 24 { "dog" } else { "person" };
        let confidence = 0.55 + (self.emitted % 4) as f32 * 0.1;

        let record = DetectionRecord {
            source_id: self.config.source_id.clone(),
            frame_index: None,
            observed_at_ms: self.next_ms,
            label: label.to_string(),
            confidence,
            bounding_box: BoundingBox::new(x1, 200.0, x1 + 60.0, 340.0),
            frame_width: Some(640),
            frame_height: Some(480),
            image_ref: Some(format!(
                "{}/{:06}.jpg",
                self.config.source_id, self.emitted
            )),
        };

        self.emitted += 1;
        self.next_ms += self.config.step_ms;
        if self.config.gap_every > 0 && self.emitted % self.config.gap_every == 0 {
            self.next_ms += self.config.gap_ms;
        }
        Ok(Some(record))
    }

    fn is_healthy(&self) -> bool {
        true
    }

    fn stats(&self) -> SourceStats {
        SourceStats {
            produced: self.emitted,
            skipped: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drain(source: &mut StubSource) -> Vec<DetectionRecord> {
        let mut records = Vec::new();
        while let Some(record) = source.next_detection().unwrap() {
            records.push(record);
        }
        records
    }

    #[test]
    fn identical_configs_emit_identical_streams() {
        let mut a = StubSource::new(StubConfig::default()).unwrap();
        let mut b = StubSource::new(StubConfig::default()).unwrap();
        let a_json = serde_json::to_string(&drain(&mut a)).unwrap();
        let b_json = serde_json::to_string(&drain(&mut b)).unwrap();
        assert_eq!(a_json, b_json);
    }

    #[test]
    fn gaps_appear_at_the_configured_cadence() {
        let mut source = StubSource::new(StubConfig::default()).unwrap();
        let records = drain(&mut source);
        assert_eq!(records.len(), 120);
        assert_eq!(records[1].observed_at_ms - records[0].observed_at_ms, 200);
        assert_eq!(
            records[40].observed_at_ms - records[39].observed_at_ms,
            200 + 5_000
        );
    }

    #[test]
    fn stream_ends_after_total() {
        let config = StubConfig {
            total: 5,
            ..StubConfig::default()
        };
        let mut source = StubSource::new(config).unwrap();
        assert_eq!(drain(&mut source).len(), 5);
        assert!(source.next_detection().unwrap().is_none());
        assert_eq!(source.stats().produced, 5);
    }

    #[test]
    fn every_record_passes_validation() {
        let mut source = StubSource::new(StubConfig::default()).unwrap();
        for record in drain(&mut source) {
            assert!(record.validate().is_ok());
            assert_eq!(record.source_id, "stub-0");
            assert!(record.image_ref.is_some());
        }
    }

    #[test]
    fn bad_configs_are_rejected() {
        let config = StubConfig {
            source_id: "NOT ALLOWED!".to_string(),
            ..StubConfig::default()
        };
        assert!(StubSource::new(config).is_err());

        let config = StubConfig {
            step_ms: 0,
            ..StubConfig::default()
        };
        assert!(StubSource::new(config).is_err());
    }
}
