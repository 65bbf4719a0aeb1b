//! Threat scoring rules.
//!
//! Class weights encode how much attention a detected object deserves on a
//! perimeter feed. Interaction rules add a bonus when two classes co-occur
//! in the same frame, which is where most of the signal lives: a knife on a
//! bench is a curiosity, a person holding one is not.
//!
//! The defaults below are tuned for COCO-style detector labels. Deployments
//! can override the whole table through the config file.

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Detections below this confidence contribute nothing to a score.
pub const DEFAULT_CONFIDENCE_THRESHOLD: f32 = 0.3;
/// Frames further apart than this belong to different candidate episodes.
pub const DEFAULT_GAP_THRESHOLD_MS: i64 = 3_000;
/// Live feeds carry no frame numbers; timestamps are bucketed at this width.
pub const DEFAULT_FRAME_BUCKET_MS: i64 = 100;
/// Same-source episodes starting closer than this are near-duplicates.
pub const DEFAULT_DIVERSITY_WINDOW_MS: i64 = 30_000;
/// Classes missing from the weight table score this much.
pub const DEFAULT_CLASS_WEIGHT: f64 = 1.0;

pub const DEFAULT_CLASS_WEIGHTS: &[(&str, f64)] = &[
    ("person", 10.0),
    ("car", 5.0),
    ("truck", 6.0),
    ("bus", 4.0),
    ("motorcycle", 5.0),
    ("bicycle", 3.0),
    ("dog", 2.0),
    ("cat", 1.0),
    ("backpack", 4.0),
    ("handbag", 3.0),
    ("suitcase", 5.0),
    ("knife", 40.0),
    ("scissors", 15.0),
    ("baseball bat", 30.0),
    ("skateboard", 2.0),
    ("bench", 1.0),
    ("bird", 1.0),
    ("umbrella", 2.0),
    ("cell phone", 3.0),
    ("laptop", 6.0),
    ("bottle", 1.0),
];

pub const DEFAULT_INTERACTIONS: &[(&str, &str, f64)] = &[
    ("person", "knife", 50.0),
    ("person", "baseball bat", 35.0),
    ("person", "scissors", 15.0),
    ("person", "suitcase", 10.0),
    ("person", "backpack", 8.0),
    ("person", "laptop", 8.0),
    ("person", "truck", 5.0),
    ("person", "car", 4.0),
];

// -------------------- Threat Levels --------------------

/// Boundaries over an episode's peak frame score.
pub const CRITICAL_FRAME_SCORE: f64 = 75.0;
pub const HIGH_FRAME_SCORE: f64 = 40.0;
pub const MEDIUM_FRAME_SCORE: f64 = 20.0;
pub const LOW_FRAME_SCORE: f64 = 8.0;

/// Ordered least to most severe so collections sort naturally.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ThreatLevel {
    Minimal,
    Low,
    Medium,
    High,
    Critical,
}

impl ThreatLevel {
    /// Bucket by the single worst frame, not the episode total: a long calm
    /// episode must not out-rank a short armed one.
    pub fn from_frame_score(score: f64) -> Self {
        if score >= CRITICAL_FRAME_SCORE {
            ThreatLevel::Critical
        } else if score >= HIGH_FRAME_SCORE {
            ThreatLevel::High
        } else if score >= MEDIUM_FRAME_SCORE {
            ThreatLevel::Medium
        } else if score >= LOW_FRAME_SCORE {
            ThreatLevel::Low
        } else {
            ThreatLevel::Minimal
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            ThreatLevel::Minimal => "minimal",
            ThreatLevel::Low => "low",
            ThreatLevel::Medium => "medium",
            ThreatLevel::High => "high",
            ThreatLevel::Critical => "critical",
        }
    }
}

// -------------------- Weight Tables --------------------

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ThreatWeights {
    /// class label -> weight; lookups are case-insensitive
    pub classes: BTreeMap<String, f64>,
    /// weight for labels outside the table
    pub default_weight: f64,
}

impl Default for ThreatWeights {
    fn default() -> Self {
        let mut classes = BTreeMap::new();
        for (label, weight) in DEFAULT_CLASS_WEIGHTS {
            classes.insert((*label).to_string(), *weight);
        }
        Self {
            classes,
            default_weight: DEFAULT_CLASS_WEIGHT,
        }
    }
}

impl ThreatWeights {
    pub fn weight(&self, label: &str) -> f64 {
        let label = label.to_lowercase();
        self.classes
            .get(&label)
            .copied()
            .unwrap_or(self.default_weight)
    }

    pub fn validate(&self) -> Result<()> {
        if !self.default_weight.is_finite() || self.default_weight < 0.0 {
            return Err(anyhow!("default_weight must be finite and >= 0"));
        }
        for (label, weight) in &self.classes {
            if !weight.is_finite() || *weight < 0.0 {
                return Err(anyhow!("weight for '{}' must be finite and >= 0", label));
            }
        }
        Ok(())
    }
}

/// Same-frame co-occurrence bonus. Both labels must clear the confidence
/// gate inside one frame for the bonus to apply.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct InteractionRule {
    pub first: String,
    pub second: String,
    pub bonus: f64,
}

pub fn default_interactions() -> Vec<InteractionRule> {
    DEFAULT_INTERACTIONS
        .iter()
        .map(|(first, second, bonus)| InteractionRule {
            first: (*first).to_string(),
            second: (*second).to_string(),
            bonus: *bonus,
        })
        .collect()
}

// -------------------- Scoring Config --------------------

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ScoringConfig {
    pub confidence_threshold: f32,
    pub gap_threshold_ms: i64,
    /// candidate episodes shorter than this are discarded
    pub min_duration_ms: i64,
    pub frame_bucket_ms: i64,
    pub diversity_window_ms: i64,
    pub weights: ThreatWeights,
    pub interactions: Vec<InteractionRule>,
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self {
            confidence_threshold: DEFAULT_CONFIDENCE_THRESHOLD,
            gap_threshold_ms: DEFAULT_GAP_THRESHOLD_MS,
            min_duration_ms: 0,
            frame_bucket_ms: DEFAULT_FRAME_BUCKET_MS,
            diversity_window_ms: DEFAULT_DIVERSITY_WINDOW_MS,
            weights: ThreatWeights::default(),
            interactions: default_interactions(),
        }
    }
}

impl ScoringConfig {
    pub fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.confidence_threshold) {
            return Err(anyhow!(
                "confidence_threshold must be within 0..=1, got {}",
                self.confidence_threshold
            ));
        }
        if self.gap_threshold_ms <= 0 {
            return Err(anyhow!(
                "gap_threshold_ms must be > 0, got {}",
                self.gap_threshold_ms
            ));
        }
        if self.frame_bucket_ms <= 0 {
            return Err(anyhow!(
                "frame_bucket_ms must be > 0, got {}",
                self.frame_bucket_ms
            ));
        }
        if self.min_duration_ms < 0 {
            return Err(anyhow!(
                "min_duration_ms must be >= 0, got {}",
                self.min_duration_ms
            ));
        }
        if self.diversity_window_ms < 0 {
            return Err(anyhow!(
                "diversity_window_ms must be >= 0, got {}",
                self.diversity_window_ms
            ));
        }
        self.weights.validate()?;
        for rule in &self.interactions {
            if !rule.bonus.is_finite() || rule.bonus < 0.0 {
                return Err(anyhow!(
                    "interaction bonus for '{}'+'{}' must be finite and >= 0",
                    rule.first,
                    rule.second
                ));
            }
        }
        Ok(())
    }
}
