//! Thread-safe registry of running source workers.
//!
//! The registry is the only shared mutable map in the pipeline. It enforces
//! at most one worker (and therefore one builder) per source; a second start
//! for the same source is an error, not a silent replacement.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::{anyhow, Result};

use crate::episode::worker::{spawn_source_worker, SharedEpisodeStore, SourceHandle, WorkerConfig};
use crate::episode::BuilderStats;
use crate::DetectionRecord;

pub struct SourceRegistry {
    store: SharedEpisodeStore,
    sources: Mutex<HashMap<String, SourceHandle>>,
}

impl SourceRegistry {
    pub fn new(store: SharedEpisodeStore) -> Self {
        Self {
            store,
            sources: Mutex::new(HashMap::new()),
        }
    }

    /// Spawn a worker for the configured source. Source ids are
    /// case-insensitive; starting one twice is an error.
    pub fn start_source(&self, config: WorkerConfig) -> Result<()> {
        let source_id = config.builder.source_id.to_lowercase();
        let mut sources = self.lock_sources()?;
        if sources.contains_key(&source_id) {
            return Err(anyhow!("source '{}' is already running", source_id));
        }
        let handle = spawn_source_worker(config, Arc::clone(&self.store))?;
        log::info!("started worker for source '{}'", source_id);
        sources.insert(source_id, handle);
        Ok(())
    }

    /// Route a detection to its source's worker.
    ///
    /// The registry guard is dropped before the send: a full queue blocks
    /// only its own feeder, never submits for other sources.
    pub fn submit(&self, detection: DetectionRecord) -> Result<()> {
        let key = detection.source_id.to_lowercase();
        let sender = {
            let sources = self.lock_sources()?;
            let handle = sources
                .get(&key)
                .ok_or_else(|| anyhow!("source '{}' is not running", key))?;
            handle.sender()?
        };
        sender
            .send(detection)
            .map_err(|_| anyhow!("worker for '{}' is gone", key))
    }

    pub fn is_running(&self, source_id: &str) -> bool {
        self.lock_sources()
            .map(|sources| sources.contains_key(&source_id.to_lowercase()))
            .unwrap_or(false)
    }

    pub fn list(&self) -> Vec<String> {
        let mut names = self
            .lock_sources()
            .map(|sources| sources.keys().cloned().collect::<Vec<_>>())
            .unwrap_or_default();
        names.sort();
        names
    }

    /// Stop one source: flush its open episode into the store and join the
    /// worker thread.
    pub fn stop_source(&self, source_id: &str) -> Result<BuilderStats> {
        let handle = {
            let mut sources = self.lock_sources()?;
            sources.remove(&source_id.to_lowercase())
        };
        let handle = handle.ok_or_else(|| anyhow!("source '{}' is not running", source_id))?;
        handle.stop()
    }

    /// Stop every running source. Shutdown path: drains all workers and
    /// reports per-source outcomes instead of failing on the first.
    pub fn stop_all(&self) -> Vec<(String, Result<BuilderStats>)> {
        let handles: Vec<(String, SourceHandle)> = match self.lock_sources() {
            Ok(mut sources) => sources.drain().collect(),
            Err(err) => {
                log::error!("cannot drain source registry: {}", err);
                return Vec::new();
            }
        };
        let mut outcomes: Vec<(String, Result<BuilderStats>)> = handles
            .into_iter()
            .map(|(source_id, handle)| {
                let outcome = handle.stop();
                (source_id, outcome)
            })
            .collect();
        outcomes.sort_by(|a, b| a.0.cmp(&b.0));
        outcomes
    }

    fn lock_sources(&self) -> Result<MutexGuard<'_, HashMap<String, SourceHandle>>> {
        self.sources
            .lock()
            .map_err(|_| anyhow!("source registry lock poisoned"))
    }
}
