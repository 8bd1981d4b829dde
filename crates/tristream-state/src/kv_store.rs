//! Raw KV-cache slot dumps.
//!
//! Each save writes one file named `kv_slot_<slot>_<unix nanos>_<seq>.bin`
//! holding the bytes exactly as given. The store does not interpret them.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::Utc;
use tracing::debug;

use crate::error::{Result, StateError};
use crate::manager::write_atomic;

const PREFIX: &str = "kv_slot_";
const EXT: &str = "bin";

/// Directory of KV-cache slot dumps.
#[derive(Debug)]
pub struct KvSlotStore {
    dir: PathBuf,
    seq: AtomicU64,
}

impl KvSlotStore {
    /// Store rooted at `dir`, created on first save.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            seq: AtomicU64::new(0),
        }
    }

    /// Storage directory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Write `data` for `slot` and return the new file's path.
    pub fn save(&self, slot: usize, data: &[u8]) -> Result<PathBuf> {
        fs::create_dir_all(&self.dir)?;
        let nanos = Utc::now().timestamp_nanos_opt().unwrap_or(0);
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        let path = self
            .dir
            .join(format!("{}{}_{}_{}.{}", PREFIX, slot, nanos, seq, EXT));
        write_atomic(&path, |w| {
            std::io::Write::write_all(w, data)?;
            Ok(())
        })?;
        debug!("Saved KV slot {} ({} bytes) to {}", slot, data.len(), path.display());
        Ok(path)
    }

    /// Read a dump back.
    pub fn load(&self, path: impl AsRef<Path>) -> Result<Vec<u8>> {
        let path = path.as_ref();
        match fs::read(path) {
            Ok(data) => Ok(data),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(StateError::NotFound(path.to_path_buf()))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Dumps for `slot`, newest first.
    pub fn list(&self, slot: usize) -> Result<Vec<PathBuf>> {
        if !self.dir.exists() {
            return Ok(Vec::new());
        }
        let mut found: Vec<((i64, u64), PathBuf)> = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if let Some((s, order)) = parse_name(&path) {
                if s == slot {
                    found.push((order, path));
                }
            }
        }
        found.sort_by(|a, b| b.0.cmp(&a.0));
        Ok(found.into_iter().map(|(_, path)| path).collect())
    }

    /// Newest dump for `slot`, if any.
    pub fn load_latest(&self, slot: usize) -> Result<Option<Vec<u8>>> {
        match self.list(slot)?.first() {
            Some(path) => self.load(path).map(Some),
            None => Ok(None),
        }
    }
}

/// `(slot, (nanos, seq))` from a dump file name.
fn parse_name(path: &Path) -> Option<(usize, (i64, u64))> {
    if path.extension()? != EXT {
        return None;
    }
    let stem = path.file_stem()?.to_str()?.strip_prefix(PREFIX)?;
    let mut parts = stem.split('_');
    let slot = parts.next()?.parse().ok()?;
    let nanos = parts.next()?.parse().ok()?;
    let seq = parts.next()?.parse().ok()?;
    if parts.next().is_some() {
        return None;
    }
    Some((slot, (nanos, seq)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_save_and_load() {
        let dir = TempDir::new().unwrap();
        let store = KvSlotStore::new(dir.path().join("kv"));
        let data: Vec<u8> = (0..=255).collect();

        let path = store.save(3, &data).unwrap();
        assert!(path.starts_with(store.dir()));
        assert!(path.file_name().unwrap().to_str().unwrap().starts_with("kv_slot_3_"));
        assert_eq!(store.load(&path).unwrap(), data);
    }

    #[test]
    fn test_list_newest_first_per_slot() {
        let dir = TempDir::new().unwrap();
        let store = KvSlotStore::new(dir.path());
        let first = store.save(1, b"one").unwrap();
        store.save(2, b"other slot").unwrap();
        let second = store.save(1, b"two").unwrap();

        assert_eq!(store.list(1).unwrap(), vec![second, first]);
        assert_eq!(store.list(2).unwrap().len(), 1);
        assert!(store.list(7).unwrap().is_empty());
        assert_eq!(store.load_latest(1).unwrap().unwrap(), b"two");
        assert!(store.load_latest(7).unwrap().is_none());
    }

    #[test]
    fn test_missing_dump() {
        let dir = TempDir::new().unwrap();
        let store = KvSlotStore::new(dir.path().join("never-created"));
        assert!(store.list(0).unwrap().is_empty());
        assert!(matches!(
            store.load(dir.path().join("kv_slot_0_1_0.bin")),
            Err(StateError::NotFound(_))
        ));
    }

    #[test]
    fn test_foreign_files_ignored() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("kv_slot_x_1_0.bin"), b"bad").unwrap();
        std::fs::write(dir.path().join("kv_slot_0_1_0.txt"), b"bad").unwrap();
        let store = KvSlotStore::new(dir.path());
        assert!(store.list(0).unwrap().is_empty());
    }
}
