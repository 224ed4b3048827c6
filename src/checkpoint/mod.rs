//! Checkpoint persistence for resumable runs
//!
//! Provides the checkpoint document, atomic file writes with file locking and
//! an in-memory backend for tests.

pub mod state;
pub mod store;

pub use state::{Checkpoint, CheckpointError, CheckpointMetadata, Cursor, SCHEMA_VERSION};
pub use store::{CheckpointBackend, CheckpointStore, FileBackend, MemoryBackend};
