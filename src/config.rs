use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::alert::{AlertConfig, DEFAULT_COOLDOWN_MS, DEFAULT_MIN_CONFIDENCE};
use crate::episode::worker::{WorkerConfig, DEFAULT_QUEUE_DEPTH};
use crate::episode::{EpisodeBuilderConfig, DEFAULT_LIVE_GAP_MS, DEFAULT_MAX_MEMBERS};
use crate::score::rank::RankOptions;
use crate::select::{FrameSelectConfig, DEFAULT_MAX_FRAMES};

const DEFAULT_DB_PATH: &str = "vigil.db";
const DEFAULT_SNAPSHOT_DIR: &str = "snapshots";
const DEFAULT_RANK_LIMIT: usize = 10;
const DEFAULT_ALERT_LABELS: &[&str] = &["person"];

#[derive(Debug, Deserialize, Default)]
struct VigildConfigFile {
    db_path: Option<String>,
    snapshot_dir: Option<String>,
    builder: Option<BuilderConfigFile>,
    alerts: Option<AlertConfigFile>,
    ranking: Option<RankingConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
struct BuilderConfigFile {
    gap_ms: Option<i64>,
    max_members: Option<usize>,
    queue_depth: Option<usize>,
}

#[derive(Debug, Deserialize, Default)]
struct AlertConfigFile {
    enabled: Option<bool>,
    cooldown_ms: Option<i64>,
    min_confidence: Option<f32>,
    labels: Option<Vec<String>>,
}

#[derive(Debug, Deserialize, Default)]
struct RankingConfigFile {
    limit: Option<usize>,
    max_frames: Option<usize>,
    min_score: Option<f64>,
    use_diversity: Option<bool>,
}

#[derive(Debug, Clone)]
pub struct VigildConfig {
    pub db_path: String,
    pub snapshot_dir: PathBuf,
    pub builder: BuilderSettings,
    pub alerts: AlertSettings,
    pub ranking: RankingSettings,
}

#[derive(Debug, Clone)]
pub struct BuilderSettings {
    pub gap_ms: i64,
    pub max_members: usize,
    pub queue_depth: usize,
}

#[derive(Debug, Clone)]
pub struct AlertSettings {
    pub enabled: bool,
    pub cooldown_ms: i64,
    pub min_confidence: f32,
    pub labels: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct RankingSettings {
    pub limit: usize,
    pub max_frames: usize,
    pub min_score: f64,
    pub use_diversity: bool,
}

impl VigildConfig {
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("VIGIL_CONFIG").ok();
        let file_cfg = match config_path.as_deref() {
            Some(path) => Some(read_config_file(Path::new(path))?),
            None => None,
        };
        let mut cfg = Self::from_file(file_cfg.unwrap_or_default());
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: VigildConfigFile) -> Self {
        let db_path = file.db_path.unwrap_or_else(|| DEFAULT_DB_PATH.to_string());
        let snapshot_dir = PathBuf::from(
            file.snapshot_dir
                .unwrap_or_else(|| DEFAULT_SNAPSHOT_DIR.to_string()),
        );
        let builder = BuilderSettings {
            gap_ms: file
                .builder
                .as_ref()
                .and_then(|builder| builder.gap_ms)
                .unwrap_or(DEFAULT_LIVE_GAP_MS),
            max_members: file
                .builder
                .as_ref()
                .and_then(|builder| builder.max_members)
                .unwrap_or(DEFAULT_MAX_MEMBERS),
            queue_depth: file
                .builder
                .and_then(|builder| builder.queue_depth)
                .unwrap_or(DEFAULT_QUEUE_DEPTH),
        };
        let alerts = AlertSettings {
            enabled: file
                .alerts
                .as_ref()
                .and_then(|alerts| alerts.enabled)
                .unwrap_or(true),
            cooldown_ms: file
                .alerts
                .as_ref()
                .and_then(|alerts| alerts.cooldown_ms)
                .unwrap_or(DEFAULT_COOLDOWN_MS),
            min_confidence: file
                .alerts
                .as_ref()
                .and_then(|alerts| alerts.min_confidence)
                .unwrap_or(DEFAULT_MIN_CONFIDENCE),
            labels: file.alerts.and_then(|alerts| alerts.labels).unwrap_or_else(|| {
                DEFAULT_ALERT_LABELS
                    .iter()
                    .map(|label| (*label).to_string())
                    .collect()
            }),
        };
        let ranking = RankingSettings {
            limit: file
                .ranking
                .as_ref()
                .and_then(|ranking| ranking.limit)
                .unwrap_or(DEFAULT_RANK_LIMIT),
            max_frames: file
                .ranking
                .as_ref()
                .and_then(|ranking| ranking.max_frames)
                .unwrap_or(DEFAULT_MAX_FRAMES),
            min_score: file
                .ranking
                .as_ref()
                .and_then(|ranking| ranking.min_score)
                .unwrap_or(0.0),
            use_diversity: file
                .ranking
                .and_then(|ranking| ranking.use_diversity)
                .unwrap_or(true),
        };
        Self {
            db_path,
            snapshot_dir,
            builder,
            alerts,
            ranking,
        }
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Ok(path) = std::env::var("VIGIL_DB_PATH") {
            if !path.trim().is_empty() {
                self.db_path = path;
            }
        }
        if let Ok(dir) = std::env::var("VIGIL_SNAPSHOT_DIR") {
            if !dir.trim().is_empty() {
                self.snapshot_dir = PathBuf::from(dir);
            }
        }
        if let Ok(gap) = std::env::var("VIGIL_GAP_MS") {
            self.builder.gap_ms = gap
                .parse()
                .map_err(|_| anyhow!("VIGIL_GAP_MS must be an integer number of milliseconds"))?;
        }
        if let Ok(cap) = std::env::var("VIGIL_MAX_MEMBERS") {
            self.builder.max_members = cap
                .parse()
                .map_err(|_| anyhow!("VIGIL_MAX_MEMBERS must be a non-negative integer"))?;
        }
        if let Ok(cooldown) = std::env::var("VIGIL_ALERT_COOLDOWN_MS") {
            self.alerts.cooldown_ms = cooldown.parse().map_err(|_| {
                anyhow!("VIGIL_ALERT_COOLDOWN_MS must be an integer number of milliseconds")
            })?;
        }
        if let Ok(labels) = std::env::var("VIGIL_ALERT_LABELS") {
            let parsed = split_csv(&labels);
            if !parsed.is_empty() {
                self.alerts.labels = parsed;
            }
        }
        if let Ok(limit) = std::env::var("VIGIL_RANK_LIMIT") {
            self.ranking.limit = limit
                .parse()
                .map_err(|_| anyhow!("VIGIL_RANK_LIMIT must be a positive integer"))?;
        }
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        if self.db_path.trim().is_empty() {
            return Err(anyhow!("db_path must not be empty"));
        }
        if self.snapshot_dir.as_os_str().is_empty() {
            return Err(anyhow!("snapshot_dir must not be empty"));
        }
        if self.builder.gap_ms <= 0 {
            return Err(anyhow!("builder.gap_ms must be greater than zero"));
        }
        if self.builder.queue_depth == 0 {
            return Err(anyhow!("builder.queue_depth must be greater than zero"));
        }
        if self.alerts.enabled {
            self.alert_config().validate()?;
        }
        if self.ranking.limit == 0 {
            return Err(anyhow!("ranking.limit must be greater than zero"));
        }
        if self.ranking.max_frames == 0 {
            return Err(anyhow!("ranking.max_frames must be greater than zero"));
        }
        if !self.ranking.min_score.is_finite() {
            return Err(anyhow!("ranking.min_score must be finite"));
        }
        Ok(())
    }

    /// Live-feed builder settings for one source.
    pub fn builder_config(&self, source_id: &str) -> EpisodeBuilderConfig {
        let mut config = EpisodeBuilderConfig::live(source_id);
        config.gap_threshold_ms = self.builder.gap_ms;
        config.max_members = self.builder.max_members;
        config
    }

    pub fn worker_config(&self, source_id: &str) -> WorkerConfig {
        let mut config = WorkerConfig::new(self.builder_config(source_id));
        config.queue_depth = self.builder.queue_depth;
        config
    }

    pub fn alert_config(&self) -> AlertConfig {
        AlertConfig {
            cooldown_ms: self.alerts.cooldown_ms,
            min_confidence: self.alerts.min_confidence,
            labels: self.alerts.labels.clone(),
        }
    }

    pub fn rank_options(&self) -> RankOptions {
        let mut options = RankOptions::default();
        options.use_diversity = self.ranking.use_diversity;
        options.min_score = self.ranking.min_score;
        options
    }

    pub fn frame_select_config(&self) -> FrameSelectConfig {
        FrameSelectConfig {
            max_frames: self.ranking.max_frames,
        }
    }
}

fn read_config_file(path: &Path) -> Result<VigildConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let cfg = serde_json::from_str(&raw)
        .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?;
    Ok(cfg)
}

fn split_csv(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|entry| entry.trim())
        .filter(|entry| !entry.is_empty())
        .map(|entry| entry.to_string())
        .collect()
}
