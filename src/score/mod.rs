//! Batch threat scoring.
//!
//! Turns a bag of detection records into per-frame groups, candidate
//! episodes, and numeric scores. Everything here is pure: no clocks, no
//! I/O, no shared state, so results are reproducible across runs.
//!
//! Scoring MUST NOT:
//! - mix detections from different sources into one episode
//! - let a long calm episode outrank a short armed one at the same peak
//! - mutate or reorder the caller's input

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use crate::DetectionRecord;

pub mod rank;
pub mod rules;

use rules::{ScoringConfig, ThreatLevel};

// -------------------- Frames --------------------

/// All detections that share one moment on one source.
///
/// Video feeds group by explicit frame number; live feeds group by a
/// fixed-width time bucket since they never report frame numbers.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Frame {
    pub source_id: String,
    /// earliest member timestamp
    pub timestamp_ms: i64,
    pub detections: Vec<DetectionRecord>,
}

pub fn group_into_frames(
    detections: &[DetectionRecord],
    config: &ScoringConfig,
) -> Result<Vec<Frame>> {
    config.validate()?;

    // An explicit frame number always wins over the time bucket, so a video
    // with sparse timestamps still groups correctly.
    #[derive(PartialEq, Eq, PartialOrd, Ord)]
    enum FrameKey {
        Index(u64),
        Bucket(i64),
    }

    let mut grouped: BTreeMap<(String, FrameKey), Frame> = BTreeMap::new();
    for detection in detections {
        let source_id = detection.source_id.to_lowercase();
        let key = match detection.frame_index {
            Some(index) => FrameKey::Index(index),
            None => FrameKey::Bucket(detection.observed_at_ms.div_euclid(config.frame_bucket_ms)),
        };
        let frame = grouped.entry((source_id.clone(), key)).or_insert_with(|| Frame {
            source_id,
            timestamp_ms: detection.observed_at_ms,
            detections: Vec::new(),
        });
        frame.timestamp_ms = frame.timestamp_ms.min(detection.observed_at_ms);
        frame.detections.push(detection.clone());
    }

    let mut frames: Vec<Frame> = grouped.into_values().collect();
    frames.sort_by(|a, b| {
        (a.source_id.as_str(), a.timestamp_ms).cmp(&(b.source_id.as_str(), b.timestamp_ms))
    });
    Ok(frames)
}

// -------------------- Candidate Episodes --------------------

/// A gap-delimited run of frames from one source, pre-scoring.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CandidateEpisode {
    pub source_id: String,
    pub start_ms: i64,
    pub end_ms: i64,
    pub frames: Vec<Frame>,
}

impl CandidateEpisode {
    pub fn duration_ms(&self) -> i64 {
        self.end_ms - self.start_ms
    }

    pub fn detection_count(&self) -> usize {
        self.frames.iter().map(|frame| frame.detections.len()).sum()
    }
}

/// Split a single source's frames into candidate episodes at silence gaps.
///
/// Frames from more than one source are an error: cross-source grouping is
/// always a caller bug, never something to paper over.
pub fn group_into_episodes(
    frames: &[Frame],
    config: &ScoringConfig,
) -> Result<Vec<CandidateEpisode>> {
    config.validate()?;
    let Some(first) = frames.first() else {
        return Ok(Vec::new());
    };
    let source_id = first.source_id.to_lowercase();
    for frame in frames {
        if !frame.source_id.eq_ignore_ascii_case(&source_id) {
            return Err(anyhow!(
                "cannot group frames from mixed sources ('{}' and '{}')",
                source_id,
                frame.source_id
            ));
        }
    }

    let mut ordered: Vec<&Frame> = frames.iter().collect();
    ordered.sort_by_key(|frame| frame.timestamp_ms);

    let mut episodes = Vec::new();
    let mut current: Vec<Frame> = Vec::new();
    let mut last_ms = first.timestamp_ms;
    for frame in ordered {
        if !current.is_empty() && frame.timestamp_ms - last_ms > config.gap_threshold_ms {
            episodes.extend(candidate_from_frames(&source_id, std::mem::take(&mut current)));
        }
        last_ms = frame.timestamp_ms;
        current.push(frame.clone());
    }
    episodes.extend(candidate_from_frames(&source_id, current));

    episodes.retain(|episode| episode.duration_ms() >= config.min_duration_ms);
    Ok(episodes)
}

fn candidate_from_frames(source_id: &str, frames: Vec<Frame>) -> Option<CandidateEpisode> {
    let start_ms = frames.first()?.timestamp_ms;
    let end_ms = frames.last()?.timestamp_ms;
    Some(CandidateEpisode {
        source_id: source_id.to_string(),
        start_ms,
        end_ms,
        frames,
    })
}

// -------------------- Scores --------------------

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct EpisodeScore {
    /// sum of all frame scores
    pub total: f64,
    /// single worst frame; drives the threat level
    pub max_frame_score: f64,
    pub threat_level: ThreatLevel,
}

/// A candidate episode flattened into its ranking summary.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ScoredEpisode {
    pub source_id: String,
    pub start_ms: i64,
    pub end_ms: i64,
    pub frame_count: usize,
    pub detection_count: usize,
    pub score: f64,
    pub max_frame_score: f64,
    pub threat_level: ThreatLevel,
    /// 1-based position after ranking; 0 until ranked
    pub rank: usize,
}

impl ScoredEpisode {
    pub fn from_candidate(candidate: &CandidateEpisode, score: &EpisodeScore) -> Self {
        Self {
            source_id: candidate.source_id.clone(),
            start_ms: candidate.start_ms,
            end_ms: candidate.end_ms,
            frame_count: candidate.frames.len(),
            detection_count: candidate.detection_count(),
            score: score.total,
            max_frame_score: score.max_frame_score,
            threat_level: score.threat_level,
            rank: 0,
        }
    }

    pub fn duration_seconds(&self) -> f64 {
        (self.end_ms - self.start_ms) as f64 / 1000.0
    }
}

pub fn score_episode(episode: &CandidateEpisode, config: &ScoringConfig) -> EpisodeScore {
    let mut total = 0.0;
    let mut max_frame_score: f64 = 0.0;
    for frame in &episode.frames {
        let frame_score = score_frame(frame, config);
        total += frame_score;
        max_frame_score = max_frame_score.max(frame_score);
    }
    EpisodeScore {
        total,
        max_frame_score,
        threat_level: ThreatLevel::from_frame_score(max_frame_score),
    }
}

fn score_frame(frame: &Frame, config: &ScoringConfig) -> f64 {
    let mut present: BTreeSet<String> = BTreeSet::new();
    let mut score = 0.0;
    for detection in &frame.detections {
        if detection.confidence < config.confidence_threshold {
            continue;
        }
        let label = detection.label.to_lowercase();
        score += config.weights.weight(&label);
        present.insert(label);
    }
    // Interaction bonuses fire once per frame, no matter how many copies of
    // each class cleared the gate.
    for rule in &config.interactions {
        if present.contains(&rule.first.to_lowercase())
            && present.contains(&rule.second.to_lowercase())
        {
            score += rule.bonus;
        }
    }
    score
}
