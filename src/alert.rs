//! Alert gating for live feeds.
//!
//! One high-confidence sighting of a watched class should page once, not
//! once per frame. The gate runs on detection timestamps rather than the
//! wall clock, so replaying a recorded stream produces the same alerts the
//! live run did.

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::DetectionRecord;

pub const DEFAULT_COOLDOWN_MS: i64 = 30_000;
pub const DEFAULT_MIN_CONFIDENCE: f32 = 0.7;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AlertConfig {
    /// per source+label quiet period after a fired alert
    pub cooldown_ms: i64,
    pub min_confidence: f32,
    /// watched classes, matched case-insensitively
    pub labels: Vec<String>,
}

impl Default for AlertConfig {
    fn default() -> Self {
        Self {
            cooldown_ms: DEFAULT_COOLDOWN_MS,
            min_confidence: DEFAULT_MIN_CONFIDENCE,
            labels: vec!["person".to_string()],
        }
    }
}

impl AlertConfig {
    pub fn validate(&self) -> Result<()> {
        if self.cooldown_ms < 0 {
            return Err(anyhow!("cooldown_ms must be >= 0, got {}", self.cooldown_ms));
        }
        if !(0.0..=1.0).contains(&self.min_confidence) {
            return Err(anyhow!(
                "min_confidence must be within 0..=1, got {}",
                self.min_confidence
            ));
        }
        if self.labels.is_empty() {
            return Err(anyhow!("alert labels must not be empty"));
        }
        Ok(())
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Alert {
    pub source_id: String,
    pub label: String,
    pub confidence: f32,
    pub observed_at_ms: i64,
}

/// Stateful dedup over the detection stream.
#[derive(Debug)]
pub struct AlertGate {
    config: AlertConfig,
    labels: Vec<String>,
    last_fired_ms: BTreeMap<(String, String), i64>,
}

impl AlertGate {
    pub fn new(config: AlertConfig) -> Result<Self> {
        config.validate()?;
        let labels = config.labels.iter().map(|l| l.to_lowercase()).collect();
        Ok(Self {
            config,
            labels,
            last_fired_ms: BTreeMap::new(),
        })
    }

    /// Returns the alert to deliver, or `None` when the detection is not
    /// watched, not confident enough, or still inside the quiet period.
    pub fn observe(&mut self, detection: &DetectionRecord) -> Option<Alert> {
        let label = detection.label.to_lowercase();
        if !self.labels.contains(&label) {
            return None;
        }
        if detection.confidence < self.config.min_confidence {
            return None;
        }

        let key = (detection.source_id.to_lowercase(), label.clone());
        if let Some(last_ms) = self.last_fired_ms.get(&key) {
            // Suppresses stragglers with rewound timestamps too.
            if detection.observed_at_ms - last_ms < self.config.cooldown_ms {
                return None;
            }
        }
        self.last_fired_ms.insert(key.clone(), detection.observed_at_ms);

        log::info!(
            "{}: alert for '{}' at {} (confidence {:.2})",
            key.0,
            label,
            detection.observed_at_ms,
            detection.confidence
        );
        Some(Alert {
            source_id: key.0,
            label,
            confidence: detection.confidence,
            observed_at_ms: detection.observed_at_ms,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::BoundingBox;

    fn det(source: &str, label: &str, confidence: f32, at_ms: i64) -> DetectionRecord {
        DetectionRecord {
            source_id: source.to_string(),
            frame_index: None,
            observed_at_ms: at_ms,
            label: label.to_string(),
            confidence,
            bounding_box: BoundingBox::new(100.0, 120.0, 180.0, 260.0),
            frame_width: Some(640),
            frame_height: Some(480),
            image_ref: None,
        }
    }

    fn gate() -> AlertGate {
        AlertGate::new(AlertConfig::default()).unwrap()
    }

    #[test]
    fn confident_watched_class_fires() {
        let mut gate = gate();
        let alert = gate.observe(&det("cam-a", "person", 0.9, 1_000)).unwrap();
        assert_eq!(alert.source_id, "cam-a");
        assert_eq!(alert.label, "person");
        assert_eq!(alert.observed_at_ms, 1_000);
    }

    #[test]
    fn unwatched_or_hesitant_detections_never_fire() {
        let mut gate = gate();
        assert!(gate.observe(&det("cam-a", "car", 0.99, 0)).is_none());
        assert!(gate.observe(&det("cam-a", "person", 0.69, 0)).is_none());
    }

    #[test]
    fn labels_match_case_insensitively() {
        let mut gate = gate();
        assert!(gate.observe(&det("cam-a", "Person", 0.9, 0)).is_some());
    }

    #[test]
    fn cooldown_suppresses_until_elapsed() {
        let mut gate = gate();
        assert!(gate.observe(&det("cam-a", "person", 0.9, 0)).is_some());
        assert!(gate.observe(&det("cam-a", "person", 0.9, 29_999)).is_none());
        assert!(gate.observe(&det("cam-a", "person", 0.9, 30_000)).is_some());
    }

    #[test]
    fn cooldown_is_per_source_and_label() {
        let mut config = AlertConfig::default();
        config.labels.push("dog".to_string());
        let mut gate = AlertGate::new(config).unwrap();

        assert!(gate.observe(&det("cam-a", "person", 0.9, 0)).is_some());
        assert!(gate.observe(&det("cam-b", "person", 0.9, 1_000)).is_some());
        assert!(gate.observe(&det("cam-a", "dog", 0.9, 2_000)).is_some());
        assert!(gate.observe(&det("cam-a", "person", 0.9, 3_000)).is_none());
    }

    #[test]
    fn rewound_timestamps_stay_suppressed() {
        let mut gate = gate();
        assert!(gate.observe(&det("cam-a", "person", 0.9, 10_000)).is_some());
        assert!(gate.observe(&det("cam-a", "person", 0.9, 5_000)).is_none());
    }

    #[test]
    fn config_rejects_bad_values() {
        let mut config = AlertConfig::default();
        config.cooldown_ms = -1;
        assert!(AlertGate::new(config).is_err());

        let mut config = AlertConfig::default();
        config.min_confidence = 1.5;
        assert!(AlertGate::new(config).is_err());

        let mut config = AlertConfig::default();
        config.labels.clear();
        assert!(AlertGate::new(config).is_err());
    }
}
