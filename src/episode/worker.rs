//! Per-source worker runtime.
//!
//! Each source gets exactly one thread owning one `EpisodeBuilder`, fed by a
//! bounded channel. Closed episodes cross into the shared store at that
//! single boundary; nothing else in the pipeline touches builder state from
//! outside its thread.
//!
//! Stopping a worker drops its sender, which drains the queue, flushes any
//! open episode into the store, and hands the builder stats back to the
//! caller.

use anyhow::{anyhow, Result};
use std::sync::mpsc::{sync_channel, Receiver, SyncSender};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use crate::episode::{BuilderStats, EpisodeBuilderConfig};
use crate::storage::EpisodeStore;
use crate::{DetectionRecord, Episode, EpisodeBuilder};

/// Store handle shared by all workers; locked only to upsert a closed episode.
pub type SharedEpisodeStore = Arc<Mutex<dyn EpisodeStore + Send>>;

pub const DEFAULT_QUEUE_DEPTH: usize = 256;

#[derive(Clone, Debug)]
pub struct WorkerConfig {
    pub builder: EpisodeBuilderConfig,
    /// bounded channel capacity between the feed and the builder thread
    pub queue_depth: usize,
}

impl WorkerConfig {
    pub fn new(builder: EpisodeBuilderConfig) -> Self {
        Self {
            builder,
            queue_depth: DEFAULT_QUEUE_DEPTH,
        }
    }
}

#[derive(Debug)]
pub struct SourceHandle {
    source_id: String,
    sender: Option<SyncSender<DetectionRecord>>,
    join: Option<JoinHandle<BuilderStats>>,
}

impl SourceHandle {
    pub fn source_id(&self) -> &str {
        &self.source_id
    }

    /// Queue one detection for the builder thread. Applies backpressure when
    /// the queue is full.
    pub fn submit(&self, detection: DetectionRecord) -> Result<()> {
        self.sender()?
            .send(detection)
            .map_err(|_| anyhow!("worker for '{}' is gone", self.source_id))
    }

    /// Clone the feed sender, so callers can queue detections without
    /// holding a lock on whatever owns this handle.
    pub(crate) fn sender(&self) -> Result<SyncSender<DetectionRecord>> {
        self.sender
            .clone()
            .ok_or_else(|| anyhow!("worker for '{}' already stopped", self.source_id))
    }

    /// Drain the queue, flush the open episode into the store, and join.
    pub fn stop(mut self) -> Result<BuilderStats> {
        drop(self.sender.take());
        let join = self
            .join
            .take()
            .ok_or_else(|| anyhow!("worker for '{}' already joined", self.source_id))?;
        join.join()
            .map_err(|_| anyhow!("worker thread for '{}' panicked", self.source_id))
    }
}

/// Validate config and spawn the builder thread for one source.
pub fn spawn_source_worker(config: WorkerConfig, store: SharedEpisodeStore) -> Result<SourceHandle> {
    if config.queue_depth == 0 {
        return Err(anyhow!("queue_depth must be > 0"));
    }
    let builder = EpisodeBuilder::new(config.builder)?;
    let source_id = builder.source_id().to_string();
    let (sender, receiver) = sync_channel(config.queue_depth);
    let thread_source = source_id.clone();
    let join = std::thread::spawn(move || run_worker(thread_source, receiver, builder, store));
    Ok(SourceHandle {
        source_id,
        sender: Some(sender),
        join: Some(join),
    })
}

fn run_worker(
    source_id: String,
    receiver: Receiver<DetectionRecord>,
    mut builder: EpisodeBuilder,
    store: SharedEpisodeStore,
) -> BuilderStats {
    while let Ok(detection) = receiver.recv() {
        if let Some(episode) = builder.process(detection) {
            persist(&source_id, &store, &episode);
        }
    }
    if let Some(episode) = builder.flush() {
        persist(&source_id, &store, &episode);
    }
    builder.stats()
}

fn persist(source_id: &str, store: &SharedEpisodeStore, episode: &Episode) {
    let mut guard = match store.lock() {
        Ok(guard) => guard,
        Err(poisoned) => {
            log::error!("{}: episode store lock poisoned, continuing", source_id);
            poisoned.into_inner()
        }
    };
    match guard.upsert_episode(episode) {
        Ok(()) => log::info!(
            "{}: closed episode {} ({} members, {:.1}s)",
            source_id,
            episode.id,
            episode.frame_count,
            episode.duration_seconds
        ),
        Err(err) => log::error!(
            "{}: failed to persist episode {}: {}",
            source_id,
            episode.id,
            err
        ),
    }
}
