//! vigild - detection-stream episode daemon
//!
//! This daemon:
//! 1. Reads detection records from a JSONL stream (file, stdin, or the
//!    built-in synthetic source)
//! 2. Starts one episode worker per source on first sight
//! 3. Folds contiguous detections into episodes and persists them
//! 4. Emits cooldown-gated alerts for watched classes

use anyhow::Result;
use clap::Parser;
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use vigil::config::VigildConfig;
use vigil::episode::worker::SharedEpisodeStore;
use vigil::ingest::stub::StubConfig;
use vigil::{
    AlertGate, DetectionSource, JsonlSource, SourceRegistry, SqliteEpisodeStore, StubSource,
};

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Detection JSONL stream; "-" reads stdin.
    #[arg(long, default_value = "-")]
    input: String,
    /// Run the built-in synthetic source instead of reading input.
    #[arg(long, default_value_t = false)]
    stub: bool,
    /// Records the synthetic source emits before stopping.
    #[arg(long, default_value_t = 120)]
    stub_total: u64,
    /// Override the configured database path.
    #[arg(long)]
    db_path: Option<String>,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let mut config = VigildConfig::load()?;
    if let Some(db_path) = args.db_path.clone() {
        config.db_path = db_path;
    }

    let store: SharedEpisodeStore =
        Arc::new(Mutex::new(SqliteEpisodeStore::open(&config.db_path)?));
    let registry = SourceRegistry::new(store);
    let mut gate = if config.alerts.enabled {
        Some(AlertGate::new(config.alert_config())?)
    } else {
        None
    };

    let mut source = open_source(&args)?;

    let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();
    ctrlc::set_handler(move || {
        let _ = shutdown_tx.send(());
    })?;

    log::info!("vigild running. writing to {}", config.db_path);
    log::info!(
        "gap_ms={}, max_members={}, alerts={}",
        config.builder.gap_ms,
        config.builder.max_members,
        config.alerts.enabled
    );

    let mut alert_count = 0u64;
    let mut last_health_log = Instant::now();
    loop {
        if shutdown_rx.try_recv().is_ok() {
            log::info!("shutdown requested");
            break;
        }

        let Some(record) = source.next_detection()? else {
            log::info!("input stream ended");
            break;
        };

        if !registry.is_running(&record.source_id) {
            registry.start_source(config.worker_config(&record.source_id))?;
        }
        if let Some(gate) = gate.as_mut() {
            if gate.observe(&record).is_some() {
                alert_count += 1;
            }
        }
        registry.submit(record)?;

        if last_health_log.elapsed() >= Duration::from_secs(5) {
            let stats = source.stats();
            log::info!(
                "source health={} produced={} skipped={}",
                source.is_healthy(),
                stats.produced,
                stats.skipped
            );
            last_health_log = Instant::now();
        }
    }

    for (source_id, outcome) in registry.stop_all() {
        match outcome {
            Ok(stats) => log::info!(
                "{}: {} episodes from {} detections (x{:.1} folding, {} out of order)",
                source_id,
                stats.episode_count,
                stats.total_detections,
                stats.compression_ratio,
                stats.out_of_order_detections
            ),
            Err(e) => log::error!("{}: worker stop failed: {}", source_id, e),
        }
    }

    let stats = source.stats();
    log::info!(
        "ingest done: produced={} skipped={} alerts={}",
        stats.produced,
        stats.skipped,
        alert_count
    );
    Ok(())
}

fn open_source(args: &Args) -> Result<Box<dyn DetectionSource>> {
    if args.stub {
        let config = StubConfig {
            total: args.stub_total,
            ..StubConfig::default()
        };
        return Ok(Box::new(StubSource::new(config)?));
    }
    if args.input == "-" {
        return Ok(Box::new(JsonlSource::from_reader(std::io::stdin().lock())));
    }
    Ok(Box::new(JsonlSource::open(&args.input)?))
}
