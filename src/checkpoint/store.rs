//! Checkpoint store and persistence backends

use fd_lock::RwLock;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::fmt;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

use super::state::{Checkpoint, CheckpointError};
use crate::metrics;
use crate::TaskResult;

/// Maximum allowed checkpoint file size (256 MB) to prevent memory exhaustion
pub const MAX_CHECKPOINT_FILE_SIZE: u64 = 256 * 1024 * 1024;

/// Durable storage for a [`Checkpoint`]
pub trait CheckpointBackend: Send + Sync + fmt::Debug {
    /// Load the stored checkpoint, `None` if nothing was stored yet
    fn load(&self) -> Result<Option<Checkpoint>, CheckpointError>;

    /// Atomically replace the stored checkpoint
    fn save(&self, checkpoint: &Checkpoint) -> Result<(), CheckpointError>;

    /// Move the stored checkpoint out of the resume path.
    /// Returns where it was archived to.
    fn archive(&self) -> Result<Option<String>, CheckpointError>;

    /// Delete the stored checkpoint
    fn remove(&self) -> Result<(), CheckpointError>;

    /// Human-readable location
    fn describe(&self) -> String;
}

/// JSON file backend with atomic replace and advisory locking
#[derive(Debug, Clone)]
pub struct FileBackend {
    path: PathBuf,
}

impl FileBackend {
    /// Backend writing to `path`
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Checkpoint file path
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Where a completed checkpoint is archived
    pub fn archive_path(&self) -> PathBuf {
        self.path.with_extension("completed.json")
    }

    fn lock_file(&self) -> Result<std::fs::File, CheckpointError> {
        let lock_path = self.path.with_extension("lock");
        OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(&lock_path)
            .map_err(|e| CheckpointError::Lock(format!("Failed to create lock file: {e}")))
    }
}

impl CheckpointBackend for FileBackend {
    fn load(&self) -> Result<Option<Checkpoint>, CheckpointError> {
        let path = &self.path;
        if !path.exists() {
            debug!(path = %path.display(), "No checkpoint file found");
            return Ok(None);
        }

        let lock = RwLock::new(self.lock_file()?);
        let _guard = lock
            .read()
            .map_err(|e| CheckpointError::Lock(format!("Failed to acquire read lock: {e}")))?;

        let metadata = std::fs::metadata(path).map_err(|e| CheckpointError::Io(e.to_string()))?;
        if metadata.len() > MAX_CHECKPOINT_FILE_SIZE {
            return Err(CheckpointError::TooLarge {
                size: metadata.len(),
                max: MAX_CHECKPOINT_FILE_SIZE,
            });
        }

        let contents =
            std::fs::read_to_string(path).map_err(|e| CheckpointError::Io(e.to_string()))?;
        let checkpoint = Checkpoint::from_json(&contents).map_err(|e| {
            warn!(path = %path.display(), error = %e, "Failed to load checkpoint");
            e
        })?;

        info!(
            path = %path.display(),
            results = checkpoint.len(),
            schema_version = %checkpoint.schema_version(),
            "Checkpoint loaded"
        );
        Ok(Some(checkpoint))
    }

    fn save(&self, checkpoint: &Checkpoint) -> Result<(), CheckpointError> {
        let path = &self.path;
        let parent_dir = match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        std::fs::create_dir_all(parent_dir).map_err(|e| CheckpointError::Io(e.to_string()))?;

        let json = checkpoint.to_json()?;

        let mut lock = RwLock::new(self.lock_file()?);
        let _guard = lock
            .write()
            .map_err(|e| CheckpointError::Lock(format!("Failed to acquire write lock: {e}")))?;

        let mut temp_file = tempfile::NamedTempFile::new_in(parent_dir)
            .map_err(|e| CheckpointError::Io(format!("Failed to create temp file: {e}")))?;
        temp_file
            .write_all(json.as_bytes())
            .map_err(|e| CheckpointError::Io(format!("Failed to write to temp file: {e}")))?;
        temp_file
            .flush()
            .map_err(|e| CheckpointError::Io(format!("Failed to flush temp file: {e}")))?;
        temp_file
            .as_file()
            .sync_all()
            .map_err(|e| CheckpointError::Io(format!("Failed to sync temp file: {e}")))?;
        temp_file
            .persist(path)
            .map_err(|e| CheckpointError::Io(format!("Failed to persist temp file: {e}")))?;

        // Fsync parent directory so the rename itself is durable
        if let Ok(dir) = std::fs::File::open(parent_dir) {
            let _ = dir.sync_all();
        }

        debug!(
            path = %path.display(),
            results = checkpoint.len(),
            "Checkpoint written"
        );
        Ok(())
    }

    fn archive(&self) -> Result<Option<String>, CheckpointError> {
        if !self.path.exists() {
            return Ok(None);
        }
        let target = self.archive_path();
        std::fs::rename(&self.path, &target)
            .map_err(|e| CheckpointError::Io(format!("Failed to archive checkpoint: {e}")))?;
        let _ = std::fs::remove_file(self.path.with_extension("lock"));
        Ok(Some(target.display().to_string()))
    }

    fn remove(&self) -> Result<(), CheckpointError> {
        for path in [self.path.clone(), self.path.with_extension("lock")] {
            match std::fs::remove_file(&path) {
                Ok(()) => debug!(path = %path.display(), "Removed"),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(CheckpointError::Io(e.to_string())),
            }
        }
        Ok(())
    }

    fn describe(&self) -> String {
        self.path.display().to_string()
    }
}

/// In-memory backend for tests and embedding.
///
/// Clones share the same storage, so a test can keep a handle to inspect what
/// a store persisted or to simulate write failures.
#[derive(Debug, Clone, Default)]
pub struct MemoryBackend {
    stored: Arc<Mutex<Option<Checkpoint>>>,
    archived: Arc<Mutex<Option<Checkpoint>>>,
    writes: Arc<AtomicUsize>,
    fail_writes: Arc<AtomicBool>,
}

impl MemoryBackend {
    /// Empty backend
    pub fn new() -> Self {
        Self::default()
    }

    /// Backend pre-populated with `checkpoint`
    pub fn with_checkpoint(checkpoint: Checkpoint) -> Self {
        let backend = Self::new();
        *backend.stored.lock() = Some(checkpoint);
        backend
    }

    /// Currently stored checkpoint
    pub fn stored(&self) -> Option<Checkpoint> {
        self.stored.lock().clone()
    }

    /// Archived checkpoint, if the run completed
    pub fn archived(&self) -> Option<Checkpoint> {
        self.archived.lock().clone()
    }

    /// Number of successful saves
    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    /// Make every subsequent save fail
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }
}

impl CheckpointBackend for MemoryBackend {
    fn load(&self) -> Result<Option<Checkpoint>, CheckpointError> {
        Ok(self.stored())
    }

    fn save(&self, checkpoint: &Checkpoint) -> Result<(), CheckpointError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(CheckpointError::Io("simulated write failure".to_string()));
        }
        *self.stored.lock() = Some(checkpoint.clone());
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn archive(&self) -> Result<Option<String>, CheckpointError> {
        let taken = self.stored.lock().take();
        match taken {
            Some(checkpoint) => {
                *self.archived.lock() = Some(checkpoint);
                Ok(Some("memory://archived".to_string()))
            }
            None => Ok(None),
        }
    }

    fn remove(&self) -> Result<(), CheckpointError> {
        *self.stored.lock() = None;
        Ok(())
    }

    fn describe(&self) -> String {
        "memory".to_string()
    }
}

struct StoreState {
    checkpoint: Checkpoint,
    pending: usize,
}

/// Shared record of terminal results with periodic durable flushes.
///
/// `record` only touches memory; `flush` writes the whole checkpoint through
/// the backend. Flushes are serialized, so a slower writer can never replace a
/// newer snapshot with an older one.
pub struct CheckpointStore {
    backend: Box<dyn CheckpointBackend>,
    state: Mutex<StoreState>,
    flush_lock: Mutex<()>,
    completed_before: HashSet<String>,
}

impl fmt::Debug for CheckpointStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CheckpointStore")
            .field("backend", &self.backend)
            .field("completed_before", &self.completed_before.len())
            .finish()
    }
}

impl CheckpointStore {
    /// Resume from whatever the backend holds (empty if nothing)
    pub fn load(backend: Box<dyn CheckpointBackend>) -> Result<Self, CheckpointError> {
        let checkpoint = match backend.load()? {
            Some(mut checkpoint) => {
                checkpoint.begin_run();
                info!(
                    location = %backend.describe(),
                    succeeded = checkpoint.succeeded(),
                    failed = checkpoint.failed(),
                    "Resuming from checkpoint"
                );
                checkpoint
            }
            None => Checkpoint::new(),
        };
        Ok(Self::from_checkpoint(backend, checkpoint))
    }

    /// Start a new lineage, ignoring anything the backend holds.
    /// The stored checkpoint is replaced on the first flush.
    pub fn fresh(backend: Box<dyn CheckpointBackend>) -> Self {
        Self::from_checkpoint(backend, Checkpoint::new())
    }

    fn from_checkpoint(backend: Box<dyn CheckpointBackend>, checkpoint: Checkpoint) -> Self {
        let completed_before = checkpoint.succeeded_ids().map(str::to_string).collect();
        Self {
            backend,
            state: Mutex::new(StoreState {
                checkpoint,
                pending: 0,
            }),
            flush_lock: Mutex::new(()),
            completed_before,
        }
    }

    /// Whether the item already succeeded in the loaded checkpoint
    pub fn should_skip(&self, item_id: &str) -> bool {
        self.completed_before.contains(item_id)
    }

    /// Number of successes carried over from the loaded checkpoint
    pub fn skippable(&self) -> usize {
        self.completed_before.len()
    }

    /// Add a terminal result to the in-memory checkpoint.
    /// Returns the number of results recorded since the last flush.
    pub fn record(&self, result: TaskResult) -> usize {
        let mut state = self.state.lock();
        if state.checkpoint.insert(result) {
            state.pending += 1;
        }
        state.pending
    }

    /// Results recorded since the last flush
    pub fn pending(&self) -> usize {
        self.state.lock().pending
    }

    /// Atomically persist the current checkpoint
    pub fn flush(&self) -> Result<(), CheckpointError> {
        let _flush_guard = self.flush_lock.lock();
        let (mut snapshot, pending) = {
            let state = self.state.lock();
            (state.checkpoint.clone(), state.pending)
        };
        snapshot.mark_saved();

        let started = Instant::now();
        let result = self.backend.save(&snapshot);
        metrics::record_checkpoint_flush(started.elapsed(), result.is_ok());
        result?;

        let mut state = self.state.lock();
        state.pending = state.pending.saturating_sub(pending);
        state.checkpoint.mark_saved();
        info!(
            location = %self.backend.describe(),
            results = snapshot.len(),
            "Checkpoint saved"
        );
        Ok(())
    }

    /// Copy of the in-memory checkpoint
    pub fn snapshot(&self) -> Checkpoint {
        self.state.lock().checkpoint.clone()
    }

    /// Archive the persisted checkpoint after a fully successful run
    pub fn finalize(&self) -> Result<Option<String>, CheckpointError> {
        let _flush_guard = self.flush_lock.lock();
        let archived = self.backend.archive()?;
        if let Some(location) = &archived {
            info!(archived_to = %location, "All items succeeded, checkpoint archived");
        }
        Ok(archived)
    }

    /// Human-readable location of the backing storage
    pub fn location(&self) -> String {
        self.backend.describe()
    }
}
