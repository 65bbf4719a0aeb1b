//! Review-frame selection.
//!
//! An episode can span hundreds of stored snapshots; a review card shows a
//! handful. Selection is bounded and deterministic: the same episode and
//! the same image store always produce the same frames, so two operators
//! looking at the same incident see the same evidence.

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};

use crate::images::ImageStore;
use crate::{DetectionRecord, Zone};

pub const DEFAULT_MAX_FRAMES: usize = 8;

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct FrameSelectConfig {
    pub max_frames: usize,
}

impl Default for FrameSelectConfig {
    fn default() -> Self {
        Self {
            max_frames: DEFAULT_MAX_FRAMES,
        }
    }
}

impl FrameSelectConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_frames == 0 {
            return Err(anyhow!("max_frames must be > 0"));
        }
        Ok(())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SelectionReason {
    #[serde(rename = "Episode start")]
    EpisodeStart,
    #[serde(rename = "Episode end")]
    EpisodeEnd,
    #[serde(rename = "Motion sample")]
    MotionSample,
}

impl SelectionReason {
    pub fn label(&self) -> &'static str {
        match self {
            SelectionReason::EpisodeStart => "Episode start",
            SelectionReason::EpisodeEnd => "Episode end",
            SelectionReason::MotionSample => "Motion sample",
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SelectedFrame {
    /// position within the episode's stored-image run, oldest first
    pub index: usize,
    pub image_ref: String,
    pub label: String,
    pub reason: SelectionReason,
    /// offset from episode start, "7s" under a minute, "1:15" above
    pub relative_time: String,
    pub zone: Zone,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FrameSelection {
    pub frames: Vec<SelectedFrame>,
    /// set when the episode had no retrievable images
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

/// Pick at most `max_frames` members whose snapshots are actually present
/// in the image store.
///
/// First and last eligible frames anchor the selection; the interior is an
/// even index spread, so a three-minute episode shows beginning, end, and
/// evenly spaced motion between them.
pub fn select_frames(
    members: &[DetectionRecord],
    config: &FrameSelectConfig,
    images: &dyn ImageStore,
) -> Result<FrameSelection> {
    config.validate()?;

    let episode_start_ms = members
        .iter()
        .map(|member| member.observed_at_ms)
        .min()
        .unwrap_or(0);

    let mut eligible: Vec<(&DetectionRecord, &str)> = members
        .iter()
        .filter_map(|member| {
            let image_ref = member.image_ref.as_deref()?;
            images.contains(image_ref).then_some((member, image_ref))
        })
        .collect();
    eligible.sort_by_key(|(member, _)| member.observed_at_ms);

    if eligible.is_empty() {
        return Ok(FrameSelection {
            frames: Vec::new(),
            note: Some("no stored images for this episode".to_string()),
        });
    }

    let mut picked: Vec<usize> = Vec::new();
    if eligible.len() <= config.max_frames {
        picked.extend(0..eligible.len());
    } else if config.max_frames == 1 {
        picked.push(0);
    } else {
        picked.push(0);
        for i in 1..=(config.max_frames - 2) {
            picked.push(i * eligible.len() / config.max_frames);
        }
        picked.push(eligible.len() - 1);
    }

    let last = eligible.len() - 1;
    let frames = picked
        .into_iter()
        .map(|index| {
            let (member, image_ref) = eligible[index];
            let reason = if index == 0 {
                SelectionReason::EpisodeStart
            } else if index == last {
                SelectionReason::EpisodeEnd
            } else {
                SelectionReason::MotionSample
            };
            SelectedFrame {
                index,
                image_ref: image_ref.to_string(),
                label: member.label.clone(),
                reason,
                relative_time: format_relative(member.observed_at_ms - episode_start_ms),
                zone: member.zone(),
            }
        })
        .collect();

    Ok(FrameSelection { frames, note: None })
}

fn format_relative(offset_ms: i64) -> String {
    let seconds = offset_ms / 1_000;
    if seconds < 60 {
        format!("{}s", seconds)
    } else {
        format!("{}:{:02}", seconds / 60, seconds % 60)
    }
}
