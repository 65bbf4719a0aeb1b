//! Incremental episode building.
//!
//! One `EpisodeBuilder` owns the gap/continuity state machine for a single
//! source. Detections arrive one at a time; the builder returns a closed
//! episode the moment the stream proves the previous run of activity ended,
//! either through a silence gap or a spatial jump.
//!
//! Builders MUST NOT:
//! - accept detections from a foreign source (dropped and counted)
//! - mutate an episode after it has closed
//! - fail on malformed input (skip and count instead)
//!
//! Sparse streams are the normal case: a builder that never sees a
//! detection simply never produces an episode.

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};

use crate::{validate_source_id, DetectionRecord, Episode};

pub mod registry;
pub mod worker;

/// Silence gap for live feeds, where detections arrive at frame cadence.
pub const DEFAULT_LIVE_GAP_MS: i64 = 2_000;
/// Silence gap for batch reprocessing of recorded video.
pub const DEFAULT_BATCH_GAP_MS: i64 = 15_000;
/// Normalized-center jump that splits an episode in batch mode.
pub const DEFAULT_BATCH_DISTANCE: f64 = 0.3;
/// Live feeds cap episode size so a camera stuck on a parked car cannot
/// grow an episode without bound.
pub const DEFAULT_MAX_MEMBERS: usize = 300;

// -------------------- Config --------------------

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EpisodeBuilderConfig {
    pub source_id: String,
    /// a gap strictly greater than this closes the open episode
    pub gap_threshold_ms: i64,
    /// optional spatial split: normalized-center distance between
    /// consecutive detections; `None` disables the rule
    pub distance_threshold: Option<f64>,
    /// close the episode once it holds this many members; 0 = uncapped
    pub max_members: usize,
}

impl EpisodeBuilderConfig {
    pub fn live(source_id: &str) -> Self {
        Self {
            source_id: source_id.to_string(),
            gap_threshold_ms: DEFAULT_LIVE_GAP_MS,
            distance_threshold: None,
            max_members: DEFAULT_MAX_MEMBERS,
        }
    }

    pub fn batch(source_id: &str) -> Self {
        Self {
            source_id: source_id.to_string(),
            gap_threshold_ms: DEFAULT_BATCH_GAP_MS,
            distance_threshold: Some(DEFAULT_BATCH_DISTANCE),
            max_members: 0,
        }
    }

    pub fn validate(&self) -> Result<()> {
        validate_source_id(&self.source_id)?;
        if self.gap_threshold_ms <= 0 {
            return Err(anyhow!(
                "gap_threshold_ms must be > 0, got {}",
                self.gap_threshold_ms
            ));
        }
        if let Some(distance) = self.distance_threshold {
            if !distance.is_finite() || distance <= 0.0 {
                return Err(anyhow!(
                    "distance_threshold must be > 0, got {}",
                    distance
                ));
            }
        }
        Ok(())
    }
}

// -------------------- Stats --------------------

#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize)]
pub struct BuilderStats {
    /// closed episodes produced so far
    pub episode_count: u64,
    /// accepted detections (members of closed or open episodes)
    pub total_detections: u64,
    pub invalid_detections: u64,
    pub out_of_order_detections: u64,
    /// accepted detections per closed episode
    pub compression_ratio: f64,
}

// -------------------- Builder --------------------

pub struct EpisodeBuilder {
    config: EpisodeBuilderConfig,
    current: Option<Episode>,
    /// high-water mark over accepted timestamps; guards episode ordering
    /// even across a cap-close, when no episode is open
    last_seen_ms: Option<i64>,
    episode_count: u64,
    total_detections: u64,
    invalid_detections: u64,
    out_of_order_detections: u64,
}

impl EpisodeBuilder {
    pub fn new(mut config: EpisodeBuilderConfig) -> Result<Self> {
        config.validate()?;
        config.source_id = config.source_id.to_lowercase();
        Ok(Self {
            config,
            current: None,
            last_seen_ms: None,
            episode_count: 0,
            total_detections: 0,
            invalid_detections: 0,
            out_of_order_detections: 0,
        })
    }

    pub fn source_id(&self) -> &str {
        &self.config.source_id
    }

    pub fn has_open_episode(&self) -> bool {
        self.current.is_some()
    }

    /// Feed one detection. Returns the previous episode when this detection
    /// proves it ended (or the current one, when the member cap seals it).
    pub fn process(&mut self, detection: DetectionRecord) -> Option<Episode> {
        if let Err(err) = detection.validate() {
            self.invalid_detections += 1;
            log::warn!("{}: dropping invalid detection: {}", self.config.source_id, err);
            return None;
        }
        if !detection.source_id.eq_ignore_ascii_case(&self.config.source_id) {
            self.invalid_detections += 1;
            log::warn!(
                "{}: dropping detection for foreign source {:?}",
                self.config.source_id,
                detection.source_id
            );
            return None;
        }
        if let Some(last_seen) = self.last_seen_ms {
            if detection.observed_at_ms < last_seen {
                self.out_of_order_detections += 1;
                log::warn!(
                    "{}: dropping out-of-order detection at {} (stream is at {})",
                    self.config.source_id,
                    detection.observed_at_ms,
                    last_seen
                );
                return None;
            }
        }

        self.last_seen_ms = Some(detection.observed_at_ms);
        self.total_detections += 1;

        let Some(mut current) = self.current.take() else {
            let mut episode = Episode::open(detection);
            // A cap of one is met by the opening member itself.
            if self.config.max_members == 1 {
                episode.close();
                self.episode_count += 1;
                return Some(episode);
            }
            self.current = Some(episode);
            return None;
        };

        if self.splits_episode(&current, &detection) {
            current.close();
            self.episode_count += 1;
            self.current = Some(Episode::open(detection));
            return Some(current);
        }

        current.append(detection);
        if self.config.max_members > 0 && current.members.len() >= self.config.max_members {
            current.close();
            self.episode_count += 1;
            log::debug!(
                "{}: episode {} sealed at member cap {}",
                self.config.source_id,
                current.id,
                self.config.max_members
            );
            return Some(current);
        }
        self.current = Some(current);
        None
    }

    /// Convenience fold over a slice of the stream.
    pub fn process_many(
        &mut self,
        detections: impl IntoIterator<Item = DetectionRecord>,
    ) -> Vec<Episode> {
        detections
            .into_iter()
            .filter_map(|detection| self.process(detection))
            .collect()
    }

    /// Force-close the open episode, if any. Shutdown path; idempotent.
    pub fn flush(&mut self) -> Option<Episode> {
        let mut current = self.current.take()?;
        current.close();
        self.episode_count += 1;
        Some(current)
    }

    pub fn stats(&self) -> BuilderStats {
        BuilderStats {
            episode_count: self.episode_count,
            total_detections: self.total_detections,
            invalid_detections: self.invalid_detections,
            out_of_order_detections: self.out_of_order_detections,
            compression_ratio: self.total_detections as f64 / self.episode_count.max(1) as f64,
        }
    }

    fn splits_episode(&self, current: &Episode, detection: &DetectionRecord) -> bool {
        let gap = detection.observed_at_ms - current.last_observed_ms();
        if gap > self.config.gap_threshold_ms {
            return true;
        }
        let Some(threshold) = self.config.distance_threshold else {
            return false;
        };
        // Both centers must be known; otherwise only the gap rule applies.
        let (Some(last), Some(next)) = (
            current.members.last().and_then(|m| m.normalized_center()),
            detection.normalized_center(),
        ) else {
            return false;
        };
        let dx = next.0 - last.0;
        let dy = next.1 - last.1;
        (dx * dx + dy * dy).sqrt() > threshold
    }
}

// -------------------- Tests --------------------
