//! Durable snapshots of identity, timers and the event queue.
//!
//! A snapshot is one JSON document keyed to the project token. Writes go to a
//! temporary file that is renamed over the previous snapshot, so a crash
//! leaves either the old or the new snapshot on disk, never a partial one.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use crate::error::{Error, Result};
use crate::types::{Properties, QueueEntry};

/// Current snapshot layout version.
pub const SNAPSHOT_VERSION: u32 = 1;

/// Storage for a single snapshot, replaced as a whole on every write.
pub trait DurableStore: Send {
    fn write_snapshot(&self, bytes: &[u8]) -> Result<()>;
    fn read_snapshot(&self) -> Result<Option<Vec<u8>>>;
}

/// Snapshot file on local disk.
#[derive(Debug, Clone)]
pub struct FileStore {
    path: PathBuf,
}

impl FileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Snapshot file for `token` inside `dir`.
    ///
    /// The token is hashed so arbitrary token strings map to safe file names.
    pub fn for_token(dir: &Path, token: &str) -> Self {
        let digest = Sha256::digest(token.as_bytes());
        let name = format!("tally-{}.json", hex::encode(&digest[..8]));
        Self::new(dir.join(name))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

impl DurableStore for FileStore {
    fn write_snapshot(&self, bytes: &[u8]) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let temp = self.temp_path();
        {
            let mut file = std::fs::File::create(&temp)?;
            file.write_all(bytes)?;
            file.sync_all()?;
        }
        std::fs::rename(&temp, &self.path).map_err(|e| {
            Error::Persistence(format!(
                "failed to move snapshot into place at {}: {}",
                self.path.display(),
                e
            ))
        })?;
        Ok(())
    }

    fn read_snapshot(&self) -> Result<Option<Vec<u8>>> {
        match std::fs::read(&self.path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

/// In-memory store; clones share the same slot, which lets tests simulate a
/// restart by building a second client over the same store.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    slot: Arc<Mutex<Option<Vec<u8>>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current raw snapshot, if any.
    pub fn contents(&self) -> Option<Vec<u8>> {
        self.slot.lock().ok().and_then(|slot| slot.clone())
    }

    /// Overwrite the raw snapshot (e.g. with garbage, to test recovery).
    pub fn put(&self, bytes: Vec<u8>) {
        if let Ok(mut slot) = self.slot.lock() {
            *slot = Some(bytes);
        }
    }
}

impl DurableStore for MemoryStore {
    fn write_snapshot(&self, bytes: &[u8]) -> Result<()> {
        let mut slot = self
            .slot
            .lock()
            .map_err(|_| Error::Persistence("memory store lock poisoned".to_string()))?;
        *slot = Some(bytes.to_vec());
        Ok(())
    }

    fn read_snapshot(&self) -> Result<Option<Vec<u8>>> {
        let slot = self
            .slot
            .lock()
            .map_err(|_| Error::Persistence("memory store lock poisoned".to_string()))?;
        Ok(slot.clone())
    }
}

/// Everything that survives a restart.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub version: u32,
    pub token: String,
    pub distinct_id: String,
    #[serde(default)]
    pub name_tag: Option<String>,
    #[serde(default)]
    pub super_properties: Properties,
    #[serde(default)]
    pub timed_events: BTreeMap<String, DateTime<Utc>>,
    #[serde(default)]
    pub queue: Vec<QueueEntry>,
}

impl Snapshot {
    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// Reads and writes snapshots for one project token.
pub struct PersistenceManager {
    token: String,
    store: Box<dyn DurableStore>,
}

impl PersistenceManager {
    pub fn new(token: impl Into<String>, store: Box<dyn DurableStore>) -> Self {
        Self {
            token: token.into(),
            store,
        }
    }

    /// Write `snapshot`, replacing the previous one.
    pub fn archive(&self, snapshot: &Snapshot) -> Result<()> {
        let bytes = snapshot.encode()?;
        self.store.write_snapshot(&bytes)?;
        tracing::debug!(
            queued = snapshot.queue.len(),
            bytes = bytes.len(),
            "Archived client state"
        );
        Ok(())
    }

    /// Load the last snapshot for this token.
    ///
    /// Missing, unreadable, corrupt, foreign-token or unknown-version snapshots
    /// all yield `None`; restoring never fails.
    pub fn restore(&self) -> Option<Snapshot> {
        let bytes = match self.store.read_snapshot() {
            Ok(Some(bytes)) => bytes,
            Ok(None) => return None,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to read snapshot, starting empty");
                return None;
            }
        };

        let snapshot = match Snapshot::decode(&bytes) {
            Ok(snapshot) => snapshot,
            Err(e) => {
                tracing::warn!(error = %e, "Corrupt snapshot, starting empty");
                return None;
            }
        };

        if snapshot.version != SNAPSHOT_VERSION {
            tracing::warn!(
                version = snapshot.version,
                expected = SNAPSHOT_VERSION,
                "Unsupported snapshot version, starting empty"
            );
            return None;
        }
        if snapshot.token != self.token {
            tracing::warn!("Snapshot belongs to a different project token, ignoring it");
            return None;
        }

        tracing::info!(queued = snapshot.queue.len(), "Restored client state");
        Some(snapshot)
    }
}
