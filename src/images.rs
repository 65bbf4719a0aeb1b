//! Snapshot storage behind the frame selector.
//!
//! Detection records carry opaque image refs; this module answers whether a
//! ref is still retrievable and hands back the bytes when it is. Retention
//! belongs to whoever writes the snapshots, so a dangling ref is a normal
//! answer here, never an error.

use anyhow::{anyhow, Result};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Component, Path, PathBuf};

pub trait ImageStore {
    fn contains(&self, image_ref: &str) -> bool;
    /// `Ok(None)` when the ref is unknown or already evicted.
    fn fetch(&self, image_ref: &str) -> Result<Option<Vec<u8>>>;
}

// -------------------- In-Memory Store --------------------

/// Test double and small-deployment backend.
#[derive(Debug, Default)]
pub struct InMemoryImageStore {
    images: BTreeMap<String, Vec<u8>>,
}

impl InMemoryImageStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, image_ref: &str, bytes: Vec<u8>) {
        self.images.insert(image_ref.to_string(), bytes);
    }

    pub fn len(&self) -> usize {
        self.images.len()
    }

    pub fn is_empty(&self) -> bool {
        self.images.is_empty()
    }
}

impl ImageStore for InMemoryImageStore {
    fn contains(&self, image_ref: &str) -> bool {
        self.images.contains_key(image_ref)
    }

    fn fetch(&self, image_ref: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.images.get(image_ref).cloned())
    }
}

// -------------------- Filesystem Store --------------------

/// Snapshot directory written by capture workers.
///
/// Refs resolve strictly under the root. Absolute refs and refs with parent
/// components are rejected, so a hostile ref in a detection payload cannot
/// read outside the snapshot tree.
#[derive(Debug)]
pub struct FilesystemImageStore {
    root: PathBuf,
}

impl FilesystemImageStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, image_ref: &str) -> Result<PathBuf> {
        let relative = Path::new(image_ref);
        if relative.is_absolute() {
            return Err(anyhow!("image ref must be relative: {:?}", image_ref));
        }
        for component in relative.components() {
            match component {
                Component::Normal(_) | Component::CurDir => {}
                _ => {
                    return Err(anyhow!(
                        "image ref escapes the snapshot root: {:?}",
                        image_ref
                    ))
                }
            }
        }
        Ok(self.root.join(relative))
    }
}

impl ImageStore for FilesystemImageStore {
    fn contains(&self, image_ref: &str) -> bool {
        match self.resolve(image_ref) {
            Ok(path) => path.is_file(),
            Err(_) => false,
        }
    }

    fn fetch(&self, image_ref: &str) -> Result<Option<Vec<u8>>> {
        let path = self.resolve(image_ref)?;
        if !path.is_file() {
            return Ok(None);
        }
        Ok(Some(fs::read(&path)?))
    }
}
