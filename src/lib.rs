//! Vigil detection-stream kernel.
//!
//! This crate folds noisy per-frame object detections from camera and video
//! sources into a small set of reviewable episodes.
//!
//! # Architecture
//!
//! The pipeline has three stages:
//!
//! 1. **Episode building** (`episode`): one incremental builder per source
//!    turns the detection stream into temporally/spatially contiguous
//!    episodes. Builders never share state across sources.
//! 2. **Threat scoring** (`score`): pure batch functions group detection
//!    snapshots into frames and candidate episodes, score them against a
//!    weight table, and rank the top-K with per-source diversity.
//! 3. **Frame selection** (`select`): picks a bounded, deterministic set of
//!    representative frames per episode for expensive downstream review.
//!
//! Rules enforced by construction:
//!
//! - An episode only ever contains detections from a single source.
//! - A closed episode is immutable; persistence upserts are idempotent on id.
//! - Malformed detections are skipped and counted, never fatal.
//! - Empty input produces empty output, never an error.
//! - Configuration errors surface at construction time, not mid-stream.
//!
//! # Module Structure
//!
//! - `episode`: EpisodeBuilder, SourceRegistry, per-source workers
//! - `ingest`: detection sources (JSONL wire reader, synthetic stub)
//! - `score`: frame/episode grouping, threat rules, ranking
//! - `select`: representative frame selection
//! - `storage` / `images`: episode and snapshot persistence
//! - `alert`: cooldown-limited high-confidence alert gate
//! - Core types: DetectionRecord, BoundingBox, Zone, Episode

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::sync::OnceLock;

pub mod alert;
pub mod config;
pub mod episode;
pub mod images;
pub mod ingest;
pub mod score;
pub mod select;
pub mod storage;

pub use alert::{Alert, AlertConfig, AlertGate};
pub use episode::registry::SourceRegistry;
pub use episode::worker::{SourceHandle, WorkerConfig};
pub use episode::{BuilderStats, EpisodeBuilder, EpisodeBuilderConfig};
pub use images::{FilesystemImageStore, ImageStore, InMemoryImageStore};
pub use ingest::{DetectionSource, JsonlSource, SourceStats, StubSource};
pub use score::rank::{
    merge_ranked_feeds, select_best_episodes, RankOptions, RankStats, RankedEpisodes,
};
pub use score::rules::{InteractionRule, ScoringConfig, ThreatLevel, ThreatWeights};
pub use score::{
    group_into_episodes, group_into_frames, score_episode, CandidateEpisode, EpisodeScore, Frame,
    ScoredEpisode,
};
pub use select::{select_frames, FrameSelectConfig, FrameSelection, SelectedFrame, SelectionReason};
pub use storage::{DetectionFilter, EpisodeStore, InMemoryEpisodeStore, SqliteEpisodeStore};

// -------------------- Bounding Boxes --------------------

/// Axis-aligned box in pixel coordinates, origin at the top-left of the frame.
/// Well-formed boxes satisfy `x1 <= x2` and `y1 <= y2`.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
}

impl BoundingBox {
    pub fn new(x1: f32, y1: f32, x2: f32, y2: f32) -> Self {
        Self { x1, y1, x2, y2 }
    }

    pub fn width(&self) -> f32 {
        self.x2 - self.x1
    }

    pub fn height(&self) -> f32 {
        self.y2 - self.y1
    }

    pub fn center(&self) -> (f32, f32) {
        ((self.x1 + self.x2) / 2.0, (self.y1 + self.y2) / 2.0)
    }

    pub fn validate(&self) -> Result<()> {
        if !self.x1.is_finite()
            || !self.y1.is_finite()
            || !self.x2.is_finite()
            || !self.y2.is_finite()
        {
            return Err(anyhow!("bounding box coordinates must be finite"));
        }
        if self.x1 > self.x2 || self.y1 > self.y2 {
            return Err(anyhow!(
                "bounding box corners out of order: ({}, {}) .. ({}, {})",
                self.x1,
                self.y1,
                self.x2,
                self.y2
            ));
        }
        Ok(())
    }
}

// -------------------- Zones --------------------

/// Coarse location bucket derived from a detection's normalized bbox center.
///
/// Image coordinates grow downward, so a large normalized `y` means the
/// object sits low in the frame, close to the camera.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Zone {
    Foreground,
    Background,
    Left,
    Right,
    Center,
}

impl Zone {
    pub fn from_normalized(cx: f64, cy: f64) -> Self {
        if cy > 0.7 {
            Zone::Foreground
        } else if cy < 0.3 {
            Zone::Background
        } else if cx < 0.3 {
            Zone::Left
        } else if cx > 0.7 {
            Zone::Right
        } else {
            Zone::Center
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Zone::Foreground => "foreground",
            Zone::Background => "background",
            Zone::Left => "left",
            Zone::Right => "right",
            Zone::Center => "center",
        }
    }
}

// -------------------- Detection Records --------------------

/// One detected object in one frame (or instant, for live feeds).
///
/// Field names are the stable wire contract; producers are the capture
/// workers, consumers are the builder and the batch scorer.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DetectionRecord {
    /// camera or video identifier; see [`validate_source_id`]
    pub source_id: String,
    /// video-relative frame number; absent for live feeds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub frame_index: Option<u64>,
    /// milliseconds since epoch, monotonic per source
    pub observed_at_ms: i64,
    pub label: String,
    /// detector confidence, 0..=1
    pub confidence: f32,
    pub bounding_box: BoundingBox,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub frame_width: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub frame_height: Option<u32>,
    /// opaque pointer into the image store (snapshot path, object key, ...)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_ref: Option<String>,
}

impl DetectionRecord {
    pub fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.confidence) {
            return Err(anyhow!(
                "detection confidence out of bounds: {}",
                self.confidence
            ));
        }
        self.bounding_box.validate()
    }

    /// Bbox center divided by frame dimensions. `None` when the capture
    /// worker did not report dimensions, or reported a degenerate frame.
    pub fn normalized_center(&self) -> Option<(f64, f64)> {
        let width = self.frame_width?;
        let height = self.frame_height?;
        if width == 0 || height == 0 {
            return None;
        }
        let (cx, cy) = self.bounding_box.center();
        Some((f64::from(cx) / f64::from(width), f64::from(cy) / f64::from(height)))
    }

    /// Records without a normalized center fall in the neutral bucket.
    pub fn zone(&self) -> Zone {
        match self.normalized_center() {
            Some((cx, cy)) => Zone::from_normalized(cx, cy),
            None => Zone::Center,
        }
    }
}

// -------------------- Source ID Discipline --------------------

/// A conforming source_id is a short local identifier, matched case-insensitively.
///
/// Allowed: "cam-front", "lot_a.2", "driveway01"
/// Disallowed: whitespace, slashes, punctuation outside [._-], empty strings.
pub fn validate_source_id(source_id: &str) -> Result<()> {
    // Compile once for hot paths.
    static SOURCE_ID_RE: OnceLock<regex::Regex> = OnceLock::new();
    let re =
        SOURCE_ID_RE.get_or_init(|| regex::Regex::new(r"^[a-z0-9][a-z0-9._-]{0,63}$").unwrap());

    let sid = source_id.to_lowercase();
    if !re.is_match(&sid) {
        return Err(anyhow!(
            "source_id must match ^[a-z0-9][a-z0-9._-]{{0,63}}$ (got {:?})",
            source_id
        ));
    }
    Ok(())
}

// -------------------- Episodes --------------------

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EpisodeStatus {
    Open,
    Closed,
}

/// A maximal run of contiguous detections from a single source.
///
/// Summary fields (`duration_seconds`, `frame_count`, `primary_class`,
/// `class_counts`, `best_confidence`) are derived when the episode closes;
/// while open they hold zero values.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Episode {
    /// stable digest of (source_id, start_ms); the idempotent upsert key
    pub id: String,
    pub source_id: String,
    pub start_ms: i64,
    pub end_ms: i64,
    pub status: EpisodeStatus,
    pub members: Vec<DetectionRecord>,
    pub duration_seconds: f64,
    pub frame_count: usize,
    pub primary_class: String,
    pub class_counts: BTreeMap<String, usize>,
    pub best_confidence: f32,
}

impl Episode {
    /// Open a new episode anchored at its first accepted detection.
    pub fn open(first: DetectionRecord) -> Self {
        let id = episode_id(&first.source_id, first.observed_at_ms);
        let source_id = first.source_id.clone();
        let start_ms = first.observed_at_ms;
        Self {
            id,
            source_id,
            start_ms,
            end_ms: start_ms,
            status: EpisodeStatus::Open,
            members: vec![first],
            duration_seconds: 0.0,
            frame_count: 0,
            primary_class: String::new(),
            class_counts: BTreeMap::new(),
            best_confidence: 0.0,
        }
    }

    pub(crate) fn append(&mut self, record: DetectionRecord) {
        self.end_ms = record.observed_at_ms;
        self.members.push(record);
    }

    pub fn last_observed_ms(&self) -> i64 {
        self.members
            .last()
            .map(|m| m.observed_at_ms)
            .unwrap_or(self.start_ms)
    }

    pub fn is_closed(&self) -> bool {
        self.status == EpisodeStatus::Closed
    }

    /// Seal the episode and derive its summary fields. Idempotent.
    pub fn close(&mut self) {
        if self.is_closed() {
            return;
        }
        self.status = EpisodeStatus::Closed;
        self.end_ms = self.last_observed_ms();
        self.duration_seconds = (self.end_ms - self.start_ms) as f64 / 1000.0;
        self.frame_count = self.members.len();
        self.class_counts.clear();
        for member in &self.members {
            *self.class_counts.entry(member.label.clone()).or_insert(0) += 1;
        }
        self.best_confidence = self
            .members
            .iter()
            .map(|m| m.confidence)
            .fold(0.0, f32::max);
        // Ascending key order means ties resolve to the smallest label.
        let mut primary = String::new();
        let mut primary_count = 0usize;
        for (label, count) in &self.class_counts {
            if *count > primary_count {
                primary = label.clone();
                primary_count = *count;
            }
        }
        self.primary_class = primary;
    }
}

/// Stable episode identifier: `ep:` + first 16 hex chars of a SHA-256 over
/// the source and the episode's anchor timestamp. Re-running a stream
/// reproduces the same ids, which is what makes store upserts idempotent.
pub fn episode_id(source_id: &str, start_ms: i64) -> String {
    let mut hasher = Sha256::new();
    hasher.update(source_id.as_bytes());
    hasher.update(start_ms.to_le_bytes());
    let digest: [u8; 32] = hasher.finalize().into();
    format!("ep:{}", hex::encode(&digest[..8]))
}

// -------------------- Tests --------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(label: &str, confidence: f32, at_ms: i64) -> DetectionRecord {
        DetectionRecord {
            source_id: "cam-front".to_string(),
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

    #[test]
    fn rejects_confidence_out_of_bounds() {
        assert!(sample("person", 1.5, 0).validate().is_err());
        assert!(sample("person", -0.1, 0).validate().is_err());
        assert!(sample("person", f32::NAN, 0).validate().is_err());
        assert!(sample("person", 0.0, 0).validate().is_ok());
        assert!(sample("person", 1.0, 0).validate().is_ok());
    }

    #[test]
    fn rejects_misordered_bounding_box() {
        let mut det = sample("person", 0.9, 0);
        det.bounding_box = BoundingBox::new(200.0, 120.0, 180.0, 260.0);
        assert!(det.validate().is_err());
        det.bounding_box = BoundingBox::new(100.0, 300.0, 180.0, 260.0);
        assert!(det.validate().is_err());
        det.bounding_box = BoundingBox::new(100.0, f32::INFINITY, 180.0, 260.0);
        assert!(det.validate().is_err());
    }

    #[test]
    fn source_id_allowlist() {
        assert!(validate_source_id("cam-front").is_ok());
        assert!(validate_source_id("CAM-FRONT").is_ok());
        assert!(validate_source_id("lot_a.2").is_ok());
        assert!(validate_source_id("").is_err());
        assert!(validate_source_id("cam front").is_err());
        assert!(validate_source_id("cam/front").is_err());
        assert!(validate_source_id("-leading").is_err());
    }

    #[test]
    fn zone_buckets_from_normalized_center() {
        assert_eq!(Zone::from_normalized(0.5, 0.9), Zone::Foreground);
        assert_eq!(Zone::from_normalized(0.5, 0.1), Zone::Background);
        assert_eq!(Zone::from_normalized(0.1, 0.5), Zone::Left);
        assert_eq!(Zone::from_normalized(0.9, 0.5), Zone::Right);
        assert_eq!(Zone::from_normalized(0.5, 0.5), Zone::Center);
    }

    #[test]
    fn zone_defaults_to_center_without_dimensions() {
        let mut det = sample("person", 0.9, 0);
        det.frame_width = None;
        assert_eq!(det.normalized_center(), None);
        assert_eq!(det.zone(), Zone::Center);

        let mut det = sample("person", 0.9, 0);
        det.frame_height = Some(0);
        assert_eq!(det.zone(), Zone::Center);
    }

    #[test]
    fn episode_id_is_stable_and_source_scoped() {
        let a = episode_id("cam-front", 1_000);
        let b = episode_id("cam-front", 1_000);
        let c = episode_id("cam-back", 1_000);
        let d = episode_id("cam-front", 2_000);
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_ne!(a, d);
        assert!(a.starts_with("ep:"));
        assert_eq!(a.len(), "ep:".len() + 16);
    }

    #[test]
    fn close_derives_summary_fields() {
        let mut ep = Episode::open(sample("car", 0.6, 1_000));
        ep.append(sample("person", 0.9, 1_500));
        ep.append(sample("car", 0.4, 2_000));
        ep.append(sample("person", 0.7, 3_000));
        ep.close();

        assert!(ep.is_closed());
        assert_eq!(ep.start_ms, 1_000);
        assert_eq!(ep.end_ms, 3_000);
        assert!((ep.duration_seconds - 2.0).abs() < f64::EPSILON);
        assert_eq!(ep.frame_count, 4);
        assert_eq!(ep.class_counts.get("car"), Some(&2));
        assert_eq!(ep.class_counts.get("person"), Some(&2));
        // Tie on counts resolves to the lexicographically smallest label.
        assert_eq!(ep.primary_class, "car");
        assert!((ep.best_confidence - 0.9).abs() < f32::EPSILON);
    }

    #[test]
    fn close_is_idempotent() {
        let mut ep = Episode::open(sample("person", 0.8, 500));
        ep.close();
        let first = ep.clone();
        ep.close();
        assert_eq!(ep.end_ms, first.end_ms);
        assert_eq!(ep.frame_count, first.frame_count);
    }
}
