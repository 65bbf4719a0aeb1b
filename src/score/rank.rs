//! Top-K episode ranking.
//!
//! This is the surface a review queue actually consumes: score every
//! candidate episode, keep the strongest few, and spread same-source picks
//! out in time so eight slots don't show the same loiterer eight times.
//!
//! Sources are ranked against each other but never grouped together; a
//! detection stream with five cameras yields five independent candidate
//! pools feeding one ladder.

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;

use super::rules::{ScoringConfig, ThreatLevel};
use super::{group_into_episodes, group_into_frames, score_episode, Frame, ScoredEpisode};
use crate::DetectionRecord;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RankOptions {
    pub scoring: ScoringConfig,
    /// skip same-source episodes starting within the diversity window of an
    /// already-selected one
    pub use_diversity: bool,
    /// episodes scoring below this never reach the ladder
    pub min_score: f64,
}

impl Default for RankOptions {
    fn default() -> Self {
        Self {
            scoring: ScoringConfig::default(),
            use_diversity: true,
            min_score: 0.0,
        }
    }
}

impl RankOptions {
    pub fn validate(&self) -> Result<()> {
        self.scoring.validate()?;
        if !self.min_score.is_finite() {
            return Err(anyhow!("min_score must be finite, got {}", self.min_score));
        }
        Ok(())
    }
}

/// Aggregates over every scored candidate, captured before the min-score
/// filter and the ladder cut so operators can see what was passed over.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct RankStats {
    pub total_frames: usize,
    pub total_episodes: usize,
    pub selected_episodes: usize,
    pub score_distribution: BTreeMap<ThreatLevel, usize>,
    pub max_score: f64,
    pub avg_score: f64,
}

impl RankStats {
    fn from_candidates(total_frames: usize, candidates: &[ScoredEpisode]) -> Self {
        let mut score_distribution: BTreeMap<ThreatLevel, usize> = BTreeMap::new();
        let mut max_score: f64 = 0.0;
        let mut sum = 0.0;
        for episode in candidates {
            *score_distribution.entry(episode.threat_level).or_insert(0) += 1;
            max_score = max_score.max(episode.score);
            sum += episode.score;
        }
        let avg_score = if candidates.is_empty() {
            0.0
        } else {
            sum / candidates.len() as f64
        };
        Self {
            total_frames,
            total_episodes: candidates.len(),
            selected_episodes: 0,
            score_distribution,
            max_score,
            avg_score,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RankedEpisodes {
    pub episodes: Vec<ScoredEpisode>,
    pub stats: RankStats,
}

/// Score everything, then keep at most `limit` episodes.
///
/// Order is score descending with more recent episodes winning ties. Empty
/// input is a normal outcome and yields an empty ranking with zeroed stats.
pub fn select_best_episodes(
    detections: &[DetectionRecord],
    limit: usize,
    options: &RankOptions,
) -> Result<RankedEpisodes> {
    options.validate()?;

    let frames = group_into_frames(detections, &options.scoring)?;
    let total_frames = frames.len();

    let mut by_source: BTreeMap<String, Vec<Frame>> = BTreeMap::new();
    for frame in frames {
        by_source
            .entry(frame.source_id.clone())
            .or_default()
            .push(frame);
    }

    let mut candidates: Vec<ScoredEpisode> = Vec::new();
    for source_frames in by_source.values() {
        for candidate in group_into_episodes(source_frames, &options.scoring)? {
            let score = score_episode(&candidate, &options.scoring);
            candidates.push(ScoredEpisode::from_candidate(&candidate, &score));
        }
    }

    let mut stats = RankStats::from_candidates(total_frames, &candidates);

    let mut pool: Vec<ScoredEpisode> = candidates
        .into_iter()
        .filter(|episode| episode.score >= options.min_score)
        .collect();
    pool.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(Ordering::Equal)
            .then(b.start_ms.cmp(&a.start_ms))
    });

    let window_ms = options.scoring.diversity_window_ms;
    let mut selected: Vec<ScoredEpisode> = Vec::new();
    for episode in pool {
        if selected.len() >= limit {
            break;
        }
        if options.use_diversity && crowds_selection(&episode, &selected, window_ms) {
            continue;
        }
        selected.push(episode);
    }
    for (index, episode) in selected.iter_mut().enumerate() {
        episode.rank = index + 1;
    }

    stats.selected_episodes = selected.len();
    Ok(RankedEpisodes {
        episodes: selected,
        stats,
    })
}

/// Strictly-within skips; starting exactly at the window edge is far enough.
fn crowds_selection(episode: &ScoredEpisode, selected: &[ScoredEpisode], window_ms: i64) -> bool {
    selected.iter().any(|kept| {
        kept.source_id == episode.source_id
            && (kept.start_ms - episode.start_ms).abs() < window_ms
    })
}

/// Combine already-ranked feeds into one recency-ordered ladder.
///
/// Used when per-source rankings were computed separately (one store per
/// site, say) and a dashboard wants a single list. Scores only break ties;
/// the merged view reads newest-first.
pub fn merge_ranked_feeds(feeds: Vec<Vec<ScoredEpisode>>, limit: usize) -> Vec<ScoredEpisode> {
    let mut merged: Vec<ScoredEpisode> = feeds.into_iter().flatten().collect();
    merged.sort_by(|a, b| {
        b.start_ms
            .cmp(&a.start_ms)
            .then(b.score.partial_cmp(&a.score).unwrap_or(Ordering::Equal))
    });
    merged.truncate(limit);
    for (index, episode) in merged.iter_mut().enumerate() {
        episode.rank = index + 1;
    }
    merged
}
