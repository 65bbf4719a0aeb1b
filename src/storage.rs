//! Episode persistence.
//!
//! Closed episodes are written through `EpisodeStore::upsert_episode`, keyed
//! on the episode id so replaying a stream converges instead of duplicating.
//! The sqlite store keeps the full episode as a JSON payload next to the
//! columns the filters need.

use anyhow::{anyhow, Result};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::{DetectionRecord, Episode};

/// Half-open time window plus optional source scope, applied per detection.
/// `since_ms` is inclusive, `until_ms` exclusive.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct DetectionFilter {
    pub source_id: Option<String>,
    pub since_ms: Option<i64>,
    pub until_ms: Option<i64>,
}

impl DetectionFilter {
    pub fn for_source(source_id: &str) -> Self {
        Self {
            source_id: Some(source_id.to_string()),
            since_ms: None,
            until_ms: None,
        }
    }

    fn matches(&self, record: &DetectionRecord) -> bool {
        if let Some(source) = &self.source_id {
            if !record.source_id.eq_ignore_ascii_case(source) {
                return false;
            }
        }
        if let Some(since) = self.since_ms {
            if record.observed_at_ms < since {
                return false;
            }
        }
        if let Some(until) = self.until_ms {
            if record.observed_at_ms >= until {
                return false;
            }
        }
        true
    }
}

pub trait EpisodeStore {
    /// Insert or replace by episode id. Re-upserting the same closed episode
    /// is a no-op in effect, which is what makes stream replay safe.
    fn upsert_episode(&mut self, episode: &Episode) -> Result<()>;

    fn get_episode(&self, id: &str) -> Result<Option<Episode>>;

    /// Episodes ordered by (start_ms, id), optionally scoped to one source.
    fn list_episodes(&self, source_id: Option<&str>) -> Result<Vec<Episode>>;

    /// Flat member snapshot across stored episodes, ordered by
    /// (source_id, observed_at_ms). This is the scorer's input.
    fn list_detections(&self, filter: &DetectionFilter) -> Result<Vec<DetectionRecord>>;
}

// -------------------- Sqlite --------------------

pub struct SqliteEpisodeStore {
    conn: Connection,
}

impl SqliteEpisodeStore {
    pub fn open(db_path: &str) -> Result<Self> {
        let conn = Connection::open(db_path)?;
        let mut store = Self { conn };
        store.ensure_schema()?;
        Ok(store)
    }

    fn ensure_schema(&mut self) -> Result<()> {
        self.conn.execute_batch(
            r#"
            PRAGMA journal_mode=WAL;

            CREATE TABLE IF NOT EXISTS episodes (
              id TEXT PRIMARY KEY,
              source_id TEXT NOT NULL,
              start_ms INTEGER NOT NULL,
              end_ms INTEGER NOT NULL,
              status TEXT NOT NULL,
              frame_count INTEGER NOT NULL,
              primary_class TEXT NOT NULL,
              updated_at INTEGER NOT NULL,
              payload_json TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_episodes_source_start ON episodes(source_id, start_ms);
            CREATE INDEX IF NOT EXISTS idx_episodes_end ON episodes(end_ms);
            "#,
        )?;
        Ok(())
    }

    fn load_payloads(&self, source_id: Option<&str>) -> Result<Vec<String>> {
        let mut payloads = Vec::new();
        match source_id {
            Some(source) => {
                let mut stmt = self.conn.prepare(
                    "SELECT payload_json FROM episodes WHERE source_id = ?1 ORDER BY start_ms ASC, id ASC",
                )?;
                let mut rows = stmt.query(params![source.to_lowercase()])?;
                while let Some(row) = rows.next()? {
                    payloads.push(row.get(0)?);
                }
            }
            None => {
                let mut stmt = self.conn.prepare(
                    "SELECT payload_json FROM episodes ORDER BY start_ms ASC, id ASC",
                )?;
                let mut rows = stmt.query([])?;
                while let Some(row) = rows.next()? {
                    payloads.push(row.get(0)?);
                }
            }
        }
        Ok(payloads)
    }
}

impl EpisodeStore for SqliteEpisodeStore {
    fn upsert_episode(&mut self, episode: &Episode) -> Result<()> {
        let status = if episode.is_closed() { "closed" } else { "open" };
        let payload_json = serde_json::to_string(episode)?;
        let updated_at = now_ms()?;
        self.conn.execute(
            r#"
            INSERT INTO episodes(id, source_id, start_ms, end_ms, status, frame_count, primary_class, updated_at, payload_json)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
            ON CONFLICT(id) DO UPDATE SET
              source_id = excluded.source_id,
              start_ms = excluded.start_ms,
              end_ms = excluded.end_ms,
              status = excluded.status,
              frame_count = excluded.frame_count,
              primary_class = excluded.primary_class,
              updated_at = excluded.updated_at,
              payload_json = excluded.payload_json
            "#,
            params![
                episode.id,
                episode.source_id.to_lowercase(),
                episode.start_ms,
                episode.end_ms,
                status,
                episode.frame_count as i64,
                episode.primary_class,
                updated_at,
                payload_json,
            ],
        )?;
        Ok(())
    }

    fn get_episode(&self, id: &str) -> Result<Option<Episode>> {
        let payload: Option<String> = self
            .conn
            .query_row(
                "SELECT payload_json FROM episodes WHERE id = ?1",
                params![id],
                |row| row.get(0),
            )
            .optional()?;
        match payload {
            Some(payload) => Ok(Some(serde_json::from_str(&payload)?)),
            None => Ok(None),
        }
    }

    fn list_episodes(&self, source_id: Option<&str>) -> Result<Vec<Episode>> {
        let payloads = self.load_payloads(source_id)?;
        let mut episodes = Vec::with_capacity(payloads.len());
        for payload in payloads {
            episodes.push(serde_json::from_str(&payload)?);
        }
        Ok(episodes)
    }

    fn list_detections(&self, filter: &DetectionFilter) -> Result<Vec<DetectionRecord>> {
        let episodes = self.list_episodes(filter.source_id.as_deref())?;
        Ok(collect_members(&episodes, filter))
    }
}

// -------------------- In-memory --------------------

#[derive(Clone, Debug, Default)]
pub struct InMemoryEpisodeStore {
    episodes: BTreeMap<String, Episode>,
}

impl InMemoryEpisodeStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl EpisodeStore for InMemoryEpisodeStore {
    fn upsert_episode(&mut self, episode: &Episode) -> Result<()> {
        self.episodes.insert(episode.id.clone(), episode.clone());
        Ok(())
    }

    fn get_episode(&self, id: &str) -> Result<Option<Episode>> {
        Ok(self.episodes.get(id).cloned())
    }

    fn list_episodes(&self, source_id: Option<&str>) -> Result<Vec<Episode>> {
        let mut episodes: Vec<Episode> = self
            .episodes
            .values()
            .filter(|episode| match source_id {
                Some(source) => episode.source_id.eq_ignore_ascii_case(source),
                None => true,
            })
            .cloned()
            .collect();
        episodes.sort_by(|a, b| a.start_ms.cmp(&b.start_ms).then_with(|| a.id.cmp(&b.id)));
        Ok(episodes)
    }

    fn list_detections(&self, filter: &DetectionFilter) -> Result<Vec<DetectionRecord>> {
        let episodes = self.list_episodes(filter.source_id.as_deref())?;
        Ok(collect_members(&episodes, filter))
    }
}

fn collect_members(episodes: &[Episode], filter: &DetectionFilter) -> Vec<DetectionRecord> {
    let mut members: Vec<DetectionRecord> = episodes
        .iter()
        .flat_map(|episode| episode.members.iter())
        .filter(|record| filter.matches(record))
        .cloned()
        .collect();
    members.sort_by(|a, b| {
        a.source_id
            .cmp(&b.source_id)
            .then_with(|| a.observed_at_ms.cmp(&b.observed_at_ms))
    });
    members
}

fn now_ms() -> Result<i64> {
    let elapsed = SystemTime::now().duration_since(UNIX_EPOCH)?;
    i64::try_from(elapsed.as_millis()).map_err(|_| anyhow!("system clock out of i64 range"))
}
