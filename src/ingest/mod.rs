//! Detection ingestion sources.
//!
//! This module provides sources of detection records:
//! - JSONL streams (capture worker stdout, batch export files)
//! - Stub source (testing, demos)
//!
//! Sources parse and hand records onward; episode semantics live in the
//! builder. The ingestion layer is responsible for:
//! - Decoding wire payloads into [`DetectionRecord`]s
//! - Rejecting lines that fail shape or bounds validation
//! - Counting what it produced and what it skipped
//!
//! The ingestion layer MUST NOT:
//! - Invent or reorder timestamps
//! - Drop a malformed line silently
//! - Touch the episode store

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::DetectionRecord;

pub mod jsonl;
pub mod stub;

pub use jsonl::JsonlSource;
pub use stub::StubSource;

/// One feed of detections. `Ok(None)` means the stream ended.
pub trait DetectionSource {
    fn next_detection(&mut self) -> Result<Option<DetectionRecord>>;

    fn is_healthy(&self) -> bool;

    fn stats(&self) -> SourceStats;
}

#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize)]
pub struct SourceStats {
    pub produced: u64,
    pub skipped: u64,
}
