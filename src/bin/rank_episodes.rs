//! rank_episodes - batch threat ranking over a detection log or store

use anyhow::{anyhow, Result};
use clap::Parser;
use serde::Serialize;

use vigil::{
    select_best_episodes, select_frames, DetectionFilter, DetectionRecord, EpisodeStore,
    FilesystemImageStore, FrameSelectConfig, FrameSelection, JsonlSource, RankOptions, RankStats,
    ScoredEpisode, SqliteEpisodeStore,
};

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Detection JSONL log to rank; "-" reads stdin.
    #[arg(long)]
    input: Option<String>,
    /// Rank detections already persisted to this database instead.
    #[arg(long)]
    db_path: Option<String>,
    /// Restrict a database read to one source.
    #[arg(long)]
    source: Option<String>,
    /// Restrict a database read to detections at or after this epoch ms.
    #[arg(long)]
    since_ms: Option<i64>,
    /// Restrict a database read to detections before this epoch ms.
    #[arg(long)]
    until_ms: Option<i64>,
    /// Maximum episodes in the ranking.
    #[arg(long, default_value_t = 10)]
    limit: usize,
    /// Drop episodes scoring below this.
    #[arg(long, default_value_t = 0.0)]
    min_score: f64,
    /// Rank near-duplicate episodes instead of spreading picks out in time.
    #[arg(long, default_value_t = false)]
    no_diversity: bool,
    /// Review frames attached to each ranked episode.
    #[arg(long, default_value_t = 8)]
    max_frames: usize,
    /// Snapshot directory backing the review frames.
    #[arg(long, default_value = "snapshots")]
    snapshot_dir: String,
    /// Report destination; "-" writes stdout.
    #[arg(long, default_value = "-")]
    output: String,
}

#[derive(Serialize)]
struct Report {
    generated_at_ms: i64,
    stats: RankStats,
    episodes: Vec<ReportEpisode>,
}

#[derive(Serialize)]
struct ReportEpisode {
    #[serde(flatten)]
    episode: ScoredEpisode,
    frames: FrameSelection,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let records = load_records(&args)?;
    log::info!("ranking {} detections", records.len());

    let mut options = RankOptions::default();
    options.use_diversity = !args.no_diversity;
    options.min_score = args.min_score;
    let ranked = select_best_episodes(&records, args.limit, &options)?;

    let images = FilesystemImageStore::new(&args.snapshot_dir);
    let select_config = FrameSelectConfig {
        max_frames: args.max_frames,
    };
    // Members of the closing frame bucket can trail the episode end by up
    // to a bucket width.
    let member_slack_ms = options.scoring.frame_bucket_ms - 1;

    let mut episodes = Vec::with_capacity(ranked.episodes.len());
    for episode in ranked.episodes {
        let members: Vec<DetectionRecord> = records
            .iter()
            .filter(|record| {
                record.source_id.eq_ignore_ascii_case(&episode.source_id)
                    && record.observed_at_ms >= episode.start_ms
                    && record.observed_at_ms <= episode.end_ms + member_slack_ms
            })
            .cloned()
            .collect();
        let frames = select_frames(&members, &select_config, &images)?;
        episodes.push(ReportEpisode { episode, frames });
    }

    let report = Report {
        generated_at_ms: chrono::Utc::now().timestamp_millis(),
        stats: ranked.stats,
        episodes,
    };
    let json = serde_json::to_string_pretty(&report)?;
    if args.output == "-" {
        println!("{}", json);
    } else {
        std::fs::write(&args.output, json)?;
        log::info!("report written to {}", args.output);
    }
    Ok(())
}

fn load_records(args: &Args) -> Result<Vec<DetectionRecord>> {
    match (&args.input, &args.db_path) {
        (Some(_), Some(_)) | (None, None) => {
            Err(anyhow!("provide exactly one of --input or --db-path"))
        }
        (Some(input), None) => {
            if input == "-" {
                JsonlSource::from_reader(std::io::stdin().lock()).read_all()
            } else {
                JsonlSource::open(input)?.read_all()
            }
        }
        (None, Some(db_path)) => {
            let store = SqliteEpisodeStore::open(db_path)?;
            let filter = DetectionFilter {
                source_id: args.source.clone(),
                since_ms: args.since_ms,
                until_ms: args.until_ms,
            };
            store.list_detections(&filter)
        }
    }
}
