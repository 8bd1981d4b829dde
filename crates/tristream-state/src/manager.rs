//! Snapshot and checkpoint management.

use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use tristream_config::{RecoveryMode, StateConfig};

use crate::error::{Result, StateError};
use crate::format::{
    read_binary_state_with_header, write_binary_state_with_options, FLAG_CHECKPOINT,
};
use crate::kv_store::KvSlotStore;
use crate::state::{CognitiveState, FORMAT_VERSION};

/// Index file name inside the storage directory.
pub const INDEX_FILE: &str = "snapshots.json";

/// Snapshot file extension.
pub const SNAPSHOT_EXT: &str = "trst";

/// Subdirectory holding KV-cache slot dumps.
pub const KV_DIR: &str = "kv";

/// Metadata about a written snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotInfo {
    /// File stem, unique within the directory
    pub id: String,
    /// Full path
    pub path: PathBuf,
    /// Format version
    pub version: u32,
    /// Capture time
    pub timestamp: DateTime<Utc>,
    /// Description given at save time
    pub description: String,
    /// Checkpoints are never pruned
    pub is_checkpoint: bool,
    /// File size
    pub size_bytes: u64,
    /// State checksum
    pub checksum: String,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct SnapshotIndex {
    snapshots: Vec<SnapshotInfo>,
}

/// Writes, lists, loads and prunes state snapshots in one directory.
pub struct StateManager {
    config: StateConfig,
    snapshots: RwLock<Vec<SnapshotInfo>>,
    /// Held while the index is written so the file never goes backwards.
    index_lock: Mutex<()>,
    initialized: AtomicBool,
    counter: AtomicU64,
}

impl StateManager {
    /// Create a manager; nothing touches the disk until [`initialize`](Self::initialize).
    pub fn new(config: StateConfig) -> Self {
        Self {
            config,
            snapshots: RwLock::new(Vec::new()),
            index_lock: Mutex::new(()),
            initialized: AtomicBool::new(false),
            counter: AtomicU64::new(0),
        }
    }

    /// Configuration.
    pub fn config(&self) -> &StateConfig {
        &self.config
    }

    /// Storage directory.
    pub fn storage_dir(&self) -> &Path {
        &self.config.storage_dir
    }

    /// Whether `initialize` has run.
    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
    }

    /// Create the storage directory and load the index. Idempotent.
    pub fn initialize(&self) -> Result<()> {
        if self.is_initialized() {
            return Ok(());
        }
        fs::create_dir_all(&self.config.storage_dir)?;

        let index_path = self.index_path();
        let mut snapshots = if index_path.exists() {
            let reader = BufReader::new(File::open(&index_path)?);
            let index: SnapshotIndex = serde_json::from_reader(reader)?;
            index.snapshots
        } else {
            Vec::new()
        };

        let before = snapshots.len();
        snapshots.retain(|s| s.path.exists());
        if snapshots.len() != before {
            warn!(
                "Dropped {} index entries with missing files",
                before - snapshots.len()
            );
        }
        sort_newest_first(&mut snapshots);

        *self.snapshots.write() = snapshots;
        self.initialized.store(true, Ordering::Release);
        if before != self.snapshots.read().len() {
            self.persist_index()?;
        }

        info!(
            "State manager initialized at {} ({} snapshots)",
            self.config.storage_dir.display(),
            self.snapshots.read().len()
        );
        Ok(())
    }

    /// Slot dump store under the storage directory.
    pub fn kv_slot_store(&self) -> KvSlotStore {
        KvSlotStore::new(self.config.storage_dir.join(KV_DIR))
    }

    fn ensure_initialized(&self) -> Result<()> {
        if self.is_initialized() {
            Ok(())
        } else {
            Err(StateError::NotInitialized)
        }
    }

    fn index_path(&self) -> PathBuf {
        self.config.storage_dir.join(INDEX_FILE)
    }

    /// Write a regular snapshot.
    pub fn save_state(&self, state: &CognitiveState, description: &str) -> Result<SnapshotInfo> {
        self.write_snapshot(state, description, false)
    }

    /// Write a checkpoint.
    pub fn create_checkpoint(
        &self,
        state: &CognitiveState,
        description: &str,
    ) -> Result<SnapshotInfo> {
        self.write_snapshot(state, description, true)
    }

    fn write_snapshot(
        &self,
        state: &CognitiveState,
        description: &str,
        is_checkpoint: bool,
    ) -> Result<SnapshotInfo> {
        self.ensure_initialized()?;

        let mut state = state.clone();
        state.version = FORMAT_VERSION;
        state.timestamp = Utc::now();
        state.description = description.to_string();
        state.seal()?;

        let seq = self.counter.fetch_add(1, Ordering::Relaxed);
        let kind = if is_checkpoint { "checkpoint" } else { "snapshot" };
        let id = format!(
            "{}-{}-{:04}",
            kind,
            state.timestamp.format("%Y%m%dT%H%M%S%.6f"),
            seq
        );
        let path = self
            .config
            .storage_dir
            .join(format!("{}.{}", id, SNAPSHOT_EXT));

        let flags = if is_checkpoint { FLAG_CHECKPOINT } else { 0 };
        let level = self.config.effective_compression_level();
        write_atomic(&path, |w| {
            write_binary_state_with_options(w, &state, flags, level).map(|_| ())
        })?;

        let info = SnapshotInfo {
            id,
            size_bytes: fs::metadata(&path)?.len(),
            path,
            version: state.version,
            timestamp: state.timestamp,
            description: state.description.clone(),
            is_checkpoint,
            checksum: state.checksum.clone(),
        };

        {
            let mut snapshots = self.snapshots.write();
            snapshots.insert(0, info.clone());
            sort_newest_first(&mut snapshots);
        }
        self.prune()?;
        self.persist_index()?;

        info!(
            "Saved {} {} ({} bytes)",
            kind,
            info.id,
            info.size_bytes
        );
        Ok(info)
    }

    /// Known snapshots, newest first.
    pub fn list_snapshots(&self) -> Vec<SnapshotInfo> {
        self.snapshots.read().clone()
    }

    /// Newest snapshot of any kind.
    pub fn latest_snapshot(&self) -> Option<SnapshotInfo> {
        self.snapshots.read().first().cloned()
    }

    /// Newest checkpoint.
    pub fn latest_checkpoint(&self) -> Option<SnapshotInfo> {
        self.snapshots.read().iter().find(|s| s.is_checkpoint).cloned()
    }

    /// Snapshot by id.
    pub fn get(&self, id: &str) -> Option<SnapshotInfo> {
        self.snapshots.read().iter().find(|s| s.id == id).cloned()
    }

    /// Load and validate a state file.
    pub fn load_state(&self, path: impl AsRef<Path>) -> Result<CognitiveState> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(StateError::NotFound(path.to_path_buf()));
        }
        let mut reader = BufReader::new(File::open(path)?);
        let (_, state) = read_binary_state_with_header(&mut reader)?;
        if !state.verify_checksum()? {
            return Err(StateError::Corrupt(format!(
                "state checksum mismatch in {}",
                path.display()
            )));
        }
        debug!("Loaded state from {}", path.display());
        Ok(state)
    }

    /// Delete a snapshot by id. Returns false if unknown.
    pub fn delete_snapshot(&self, id: &str) -> Result<bool> {
        self.ensure_initialized()?;
        let removed = {
            let mut snapshots = self.snapshots.write();
            match snapshots.iter().position(|s| s.id == id) {
                Some(pos) => snapshots.remove(pos),
                None => return Ok(false),
            }
        };
        remove_file_if_exists(&removed.path)?;
        self.persist_index()?;
        info!("Deleted snapshot {}", id);
        Ok(true)
    }

    /// Load the state selected by the configured recovery mode.
    pub fn recover(&self) -> Result<Option<CognitiveState>> {
        self.ensure_initialized()?;
        let target = match self.config.recovery_mode {
            RecoveryMode::None => return Ok(None),
            RecoveryMode::Latest => self.latest_snapshot(),
            RecoveryMode::Checkpoint => self.latest_checkpoint(),
        };
        match target {
            Some(info) => {
                let state = self.load_state(&info.path)?;
                info!("Recovered state from {}", info.id);
                Ok(Some(state))
            }
            None => {
                debug!("No snapshot to recover");
                Ok(None)
            }
        }
    }

    fn prune(&self) -> Result<()> {
        let doomed: Vec<SnapshotInfo> = {
            let mut snapshots = self.snapshots.write();
            let mut regular = 0usize;
            let mut doomed = Vec::new();
            snapshots.retain(|s| {
                if s.is_checkpoint {
                    return true;
                }
                regular += 1;
                if regular > self.config.max_snapshots {
                    doomed.push(s.clone());
                    false
                } else {
                    true
                }
            });
            doomed
        };

        for info in &doomed {
            remove_file_if_exists(&info.path)?;
            debug!("Pruned snapshot {}", info.id);
        }
        Ok(())
    }

    fn persist_index(&self) -> Result<()> {
        let _guard = self.index_lock.lock();
        let index = SnapshotIndex {
            snapshots: self.snapshots.read().clone(),
        };
        write_atomic(&self.index_path(), |w| {
            serde_json::to_writer_pretty(&mut *w, &index)?;
            Ok(())
        })
    }
}

/// Stable, so equal timestamps keep their insertion order.
fn sort_newest_first(snapshots: &mut [SnapshotInfo]) {
    snapshots.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
}

fn remove_file_if_exists(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Write through a uniquely named temp file in the same directory, then
/// rename it over `path`. The temp file is removed if anything fails.
pub(crate) fn write_atomic<F>(path: &Path, write: F) -> Result<()>
where
    F: FnOnce(&mut BufWriter<&File>) -> Result<()>,
{
    let dir = match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir,
        _ => Path::new("."),
    };
    let tmp = tempfile::Builder::new()
        .prefix(".tristream-")
        .suffix(".tmp")
        .tempfile_in(dir)?;

    {
        let mut writer = BufWriter::new(tmp.as_file());
        write(&mut writer)?;
        writer.flush()?;
    }
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| StateError::Io(e.error))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn open_manager(dir: &TempDir) -> StateManager {
        let manager = StateManager::new(StateConfig::in_dir(dir.path()));
        manager.initialize().unwrap();
        manager
    }

    fn state(step: u64) -> CognitiveState {
        let mut state = CognitiveState::new("");
        state.streams[0].step = step;
        state
    }

    #[test]
    fn test_initialize_idempotent() {
        let dir = TempDir::new().unwrap();
        let nested = dir.path().join("a/b");
        let manager = StateManager::new(StateConfig::in_dir(&nested));
        assert!(matches!(
            manager.save_state(&state(0), "x"),
            Err(StateError::NotInitialized)
        ));
        manager.initialize().unwrap();
        manager.initialize().unwrap();
        assert!(nested.is_dir());
    }

    #[test]
    fn test_save_and_load() {
        let dir = TempDir::new().unwrap();
        let manager = open_manager(&dir);

        let info = manager.save_state(&state(7), "first save").unwrap();
        assert!(!info.is_checkpoint);
        assert!(info.path.exists());
        assert!(info.size_bytes > 0);

        let loaded = manager.load_state(&info.path).unwrap();
        assert_eq!(loaded.description, "first save");
        assert_eq!(loaded.streams[0].step, 7);
        assert_eq!(loaded.checksum, info.checksum);
    }

    #[test]
    fn test_list_newest_first() {
        let dir = TempDir::new().unwrap();
        let manager = open_manager(&dir);
        let a = manager.save_state(&state(1), "a").unwrap();
        let b = manager.create_checkpoint(&state(2), "b").unwrap();
        let c = manager.save_state(&state(3), "c").unwrap();

        let ids: Vec<_> = manager.list_snapshots().into_iter().map(|s| s.id).collect();
        assert_eq!(ids, vec![c.id.clone(), b.id.clone(), a.id]);
        assert_eq!(manager.latest_snapshot().unwrap().id, c.id);
        assert_eq!(manager.latest_checkpoint().unwrap().id, b.id);
        assert!(b.is_checkpoint);
    }

    #[test]
    fn test_index_survives_restart() {
        let dir = TempDir::new().unwrap();
        let saved = {
            let manager = open_manager(&dir);
            manager.save_state(&state(1), "one").unwrap();
            manager.create_checkpoint(&state(2), "two").unwrap()
        };
        assert!(dir.path().join(INDEX_FILE).exists());

        let manager = open_manager(&dir);
        assert_eq!(manager.list_snapshots().len(), 2);
        assert_eq!(manager.latest_snapshot().unwrap(), saved);
    }

    #[test]
    fn test_missing_files_dropped_from_index() {
        let dir = TempDir::new().unwrap();
        let info = {
            let manager = open_manager(&dir);
            manager.save_state(&state(1), "one").unwrap()
        };
        fs::remove_file(&info.path).unwrap();
        let manager = open_manager(&dir);
        assert!(manager.list_snapshots().is_empty());
    }

    #[test]
    fn test_prune_keeps_checkpoints() {
        let dir = TempDir::new().unwrap();
        let mut config = StateConfig::in_dir(dir.path());
        config.max_snapshots = 2;
        let manager = StateManager::new(config);
        manager.initialize().unwrap();

        let first = manager.save_state(&state(1), "1").unwrap();
        let cp = manager.create_checkpoint(&state(2), "cp").unwrap();
        manager.save_state(&state(3), "3").unwrap();
        manager.save_state(&state(4), "4").unwrap();

        let list = manager.list_snapshots();
        assert_eq!(list.iter().filter(|s| !s.is_checkpoint).count(), 2);
        assert!(list.iter().any(|s| s.id == cp.id));
        assert!(!first.path.exists());
        assert!(cp.path.exists());
    }

    #[test]
    fn test_delete() {
        let dir = TempDir::new().unwrap();
        let manager = open_manager(&dir);
        let info = manager.save_state(&state(1), "x").unwrap();
        assert!(manager.delete_snapshot(&info.id).unwrap());
        assert!(!info.path.exists());
        assert!(!manager.delete_snapshot(&info.id).unwrap());
        assert!(manager.list_snapshots().is_empty());
    }

    #[test]
    fn test_recover_modes() {
        let dir = TempDir::new().unwrap();
        let manager = open_manager(&dir);
        assert!(manager.recover().unwrap().is_none());

        manager.create_checkpoint(&state(10), "cp").unwrap();
        manager.save_state(&state(20), "snap").unwrap();
        assert_eq!(manager.recover().unwrap().unwrap().streams[0].step, 20);

        let mut config = StateConfig::in_dir(dir.path());
        config.recovery_mode = RecoveryMode::Checkpoint;
        let by_checkpoint = StateManager::new(config.clone());
        by_checkpoint.initialize().unwrap();
        assert_eq!(by_checkpoint.recover().unwrap().unwrap().streams[0].step, 10);

        config.recovery_mode = RecoveryMode::None;
        let fresh = StateManager::new(config);
        fresh.initialize().unwrap();
        assert!(fresh.recover().unwrap().is_none());
    }

    #[test]
    fn test_load_missing_and_corrupt() {
        let dir = TempDir::new().unwrap();
        let manager = open_manager(&dir);
        assert!(matches!(
            manager.load_state(dir.path().join("nope.trst")),
            Err(StateError::NotFound(_))
        ));

        let info = manager.save_state(&state(1), "x").unwrap();
        let mut bytes = fs::read(&info.path).unwrap();
        let mid = bytes.len() - 3;
        bytes[mid] ^= 0x55;
        fs::write(&info.path, bytes).unwrap();
        assert!(matches!(
            manager.load_state(&info.path),
            Err(StateError::Corrupt(_))
        ));
    }

    #[test]
    fn test_concurrent_saves_keep_index_consistent() {
        let dir = TempDir::new().unwrap();
        let mut config = StateConfig::in_dir(dir.path());
        config.max_snapshots = 10;
        let manager = std::sync::Arc::new(StateManager::new(config.clone()));
        manager.initialize().unwrap();

        let workers: Vec<_> = (0..8)
            .map(|t| {
                let manager = manager.clone();
                std::thread::spawn(move || {
                    for i in 0..25 {
                        if i % 5 == 0 {
                            manager.create_checkpoint(&state(t * 100 + i), "cp").unwrap();
                        } else {
                            manager.save_state(&state(t * 100 + i), "snap").unwrap();
                        }
                    }
                })
            })
            .collect();
        for worker in workers {
            worker.join().unwrap();
        }

        let listed = manager.list_snapshots();
        assert_eq!(listed.iter().filter(|s| s.is_checkpoint).count(), 8 * 5);
        assert_eq!(listed.iter().filter(|s| !s.is_checkpoint).count(), 10);
        assert!(listed.iter().all(|s| s.path.exists()));

        let reloaded = StateManager::new(config);
        reloaded.initialize().unwrap();
        assert_eq!(reloaded.list_snapshots().len(), listed.len());

        let on_disk = fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.path().extension().is_some_and(|x| x == SNAPSHOT_EXT))
            .count();
        assert_eq!(on_disk, listed.len());
    }

    #[test]
    fn test_uncompressed_snapshots_load() {
        let dir = TempDir::new().unwrap();
        let mut config = StateConfig::in_dir(dir.path());
        config.compression = false;
        let plain = StateManager::new(config);
        plain.initialize().unwrap();
        let info = plain.save_state(&state(3), "plain").unwrap();

        let mut reader = BufReader::new(File::open(&info.path).unwrap());
        let (header, _) = read_binary_state_with_header(&mut reader).unwrap();
        assert!(!header.is_compressed());

        let compressed = open_manager(&dir);
        assert_eq!(compressed.load_state(&info.path).unwrap().streams[0].step, 3);
        let packed = compressed.save_state(&state(4), "packed").unwrap();
        let mut reader = BufReader::new(File::open(&packed.path).unwrap());
        assert!(read_binary_state_with_header(&mut reader).unwrap().0.is_compressed());
    }

    #[test]
    fn test_kv_dumps_live_beside_snapshots() {
        let dir = TempDir::new().unwrap();
        let manager = open_manager(&dir);
        let path = manager.kv_slot_store().save(0, &[1, 2, 3]).unwrap();
        assert!(path.starts_with(dir.path().join(KV_DIR)));
        manager.save_state(&state(1), "x").unwrap();

        let reopened = open_manager(&dir);
        assert_eq!(reopened.list_snapshots().len(), 1);
        assert_eq!(reopened.kv_slot_store().load_latest(0).unwrap().unwrap(), vec![1, 2, 3]);
    }

    #[test]
    fn test_no_temp_files_left() {
        let dir = TempDir::new().unwrap();
        let manager = open_manager(&dir);
        manager.save_state(&state(1), "x").unwrap();
        let leftovers = fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.path().extension().is_some_and(|x| x == "tmp"))
            .count();
        assert_eq!(leftovers, 0);
    }
}
