//! Ordered, persisted server entry list
//!
//! Index 0 is the current/preferred server. Every mutation happens under one
//! lock, and the file write that reflects it happens before the lock is
//! released.

use super::entry::ServerEntry;
use crate::{Error, Result};
use parking_lot::Mutex;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Upper bound on the total encoded size written to disk
pub const MAX_SAVED_ENTRIES_SIZE: usize = 4 * 1024 * 1024;

#[derive(Serialize, Deserialize)]
struct PersistedEntries {
    #[serde(rename = "serverEntries")]
    server_entries: Vec<String>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum PersistedFormat {
    Wrapped(PersistedEntries),
    Bare(Vec<String>),
}

/// Origin of a merge batch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeSource {
    /// Shipped with the client; never overwrites an existing entry
    Embedded,
    /// Remote list or handshake delta; overwrites existing entries
    Discovered,
}

/// Outcome counters of a merge
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergeStats {
    pub inserted: usize,
    pub replaced: usize,
    pub kept: usize,
    pub failed: usize,
}

#[derive(Default)]
struct StoreInner {
    entries: Vec<ServerEntry>,
    current: Option<ServerEntry>,
}

/// Thread-safe ordered server list backed by a JSON file
pub struct ServerEntryStore {
    inner: Mutex<StoreInner>,
    path: Option<PathBuf>,
}

impl ServerEntryStore {
    /// Open the store at `path`, restoring any persisted entries in order
    pub fn open<P: Into<PathBuf>>(path: P) -> Self {
        let path = path.into();
        let entries = Self::read_file(&path);
        info!(
            "Loaded {} server entries from {}",
            entries.len(),
            path.display()
        );
        ServerEntryStore {
            inner: Mutex::new(StoreInner {
                entries,
                current: None,
            }),
            path: Some(path),
        }
    }

    /// A store that never touches the filesystem
    pub fn in_memory() -> Self {
        ServerEntryStore {
            inner: Mutex::new(StoreInner::default()),
            path: None,
        }
    }

    /// Re-read the persisted list, replacing the in-memory one
    pub fn load(&self) -> Vec<ServerEntry> {
        let mut inner = self.inner.lock();
        if let Some(path) = &self.path {
            inner.entries = Self::read_file(path);
        }
        inner.entries.clone()
    }

    fn read_file(path: &Path) -> Vec<ServerEntry> {
        let content = match std::fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Vec::new(),
            Err(e) => {
                warn!("Failed to read server entries from {}: {}", path.display(), e);
                return Vec::new();
            }
        };

        let encoded = match serde_json::from_str::<PersistedFormat>(&content) {
            Ok(PersistedFormat::Wrapped(p)) => p.server_entries,
            Ok(PersistedFormat::Bare(list)) => list,
            Err(e) => {
                warn!("Ignoring corrupt server entry file {}: {}", path.display(), e);
                return Vec::new();
            }
        };

        let mut entries: Vec<ServerEntry> = Vec::with_capacity(encoded.len());
        for raw in &encoded {
            match ServerEntry::decode(raw) {
                Ok(entry) => {
                    if entries.iter().any(|e| e.ip_address == entry.ip_address) {
                        debug!("Skipping duplicate persisted entry {}", entry.ip_address);
                        continue;
                    }
                    entries.push(entry);
                }
                Err(e) => warn!("Skipping undecodable persisted entry: {}", e),
            }
        }
        entries
    }

    fn save(&self, entries: &[ServerEntry]) {
        let Some(path) = &self.path else {
            return;
        };
        if let Err(e) = Self::write_file(path, entries) {
            warn!("{}", e);
        }
    }

    fn write_file(path: &Path, entries: &[ServerEntry]) -> Result<()> {
        let mut total = 0usize;
        let mut encoded = Vec::with_capacity(entries.len());
        for entry in entries {
            total += entry.raw_encoding().len();
            if total > MAX_SAVED_ENTRIES_SIZE {
                debug!(
                    "Server entry list truncated to {} entries on save",
                    encoded.len()
                );
                break;
            }
            encoded.push(entry.raw_encoding().to_string());
        }

        let body = serde_json::to_vec(&PersistedEntries {
            server_entries: encoded,
        })
        .map_err(|e| Error::persistence(e.to_string()))?;

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    Error::persistence(format!("create {}: {}", parent.display(), e))
                })?;
            }
        }

        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, body)
            .map_err(|e| Error::persistence(format!("write {}: {}", tmp.display(), e)))?;
        std::fs::rename(&tmp, path)
            .map_err(|e| Error::persistence(format!("rename {}: {}", path.display(), e)))?;
        Ok(())
    }

    /// Merge entries shipped with the client
    pub fn merge_embedded<S: AsRef<str>>(&self, raw_entries: &[S], shuffle: bool) -> MergeStats {
        self.merge(raw_entries, MergeSource::Embedded, shuffle)
    }

    /// Merge entries learned from a remote list or a handshake
    pub fn merge_discovered<S: AsRef<str>>(&self, raw_entries: &[S], shuffle: bool) -> MergeStats {
        self.merge(raw_entries, MergeSource::Discovered, shuffle)
    }

    /// Decode and insert a batch.
    ///
    /// Existing addresses are replaced only for discovered batches. New
    /// entries go to index 1 so the current server keeps index 0.
    pub fn merge<S: AsRef<str>>(
        &self,
        raw_entries: &[S],
        source: MergeSource,
        shuffle: bool,
    ) -> MergeStats {
        let mut stats = MergeStats::default();
        let mut batch: Vec<ServerEntry> = Vec::with_capacity(raw_entries.len());
        for raw in raw_entries {
            let raw = raw.as_ref().trim();
            if raw.is_empty() {
                continue;
            }
            match ServerEntry::decode(raw) {
                Ok(entry) => batch.push(entry),
                Err(e) => {
                    stats.failed += 1;
                    warn!("Skipping undecodable {:?} server entry: {}", source, e);
                }
            }
        }

        if shuffle {
            batch.shuffle(&mut rand::thread_rng());
        }

        let mut inner = self.inner.lock();
        for entry in batch {
            match inner
                .entries
                .iter()
                .position(|e| e.ip_address == entry.ip_address)
            {
                Some(index) => {
                    if source == MergeSource::Discovered {
                        inner.entries[index] = entry;
                        stats.replaced += 1;
                    } else {
                        stats.kept += 1;
                    }
                }
                None => {
                    let index = if inner.entries.is_empty() { 0 } else { 1 };
                    inner.entries.insert(index, entry);
                    stats.inserted += 1;
                }
            }
        }

        if stats.inserted > 0 || stats.replaced > 0 {
            self.save(&inner.entries);
        }

        debug!(
            "Merged {:?} server entries: {} inserted, {} replaced, {} kept, {} failed",
            source, stats.inserted, stats.replaced, stats.kept, stats.failed
        );
        stats
    }

    /// Snapshot list[0] as the current server
    pub fn set_current_server_entry(&self) -> Option<ServerEntry> {
        let mut inner = self.inner.lock();
        let current = inner.entries.first().cloned();
        inner.current = current.clone();
        current
    }

    /// Snapshot list[0] as the current server only if it is `ip_address`.
    ///
    /// A concurrent replacement can leave another server at the head after
    /// selection; the current server is left untouched then.
    pub fn set_current_server_entry_for(&self, ip_address: &str) -> Option<ServerEntry> {
        let mut inner = self.inner.lock();
        let head = inner
            .entries
            .first()
            .filter(|e| e.ip_address == ip_address)
            .cloned()?;
        inner.current = Some(head.clone());
        Some(head)
    }

    pub fn current_server_entry(&self) -> Option<ServerEntry> {
        self.inner.lock().current.clone()
    }

    /// Move the current server to the tail (last-chance position)
    pub fn mark_current_failed(&self) {
        let mut inner = self.inner.lock();
        let Some(current) = inner.current.clone() else {
            return;
        };
        if let Some(index) = inner
            .entries
            .iter()
            .position(|e| e.ip_address == current.ip_address)
        {
            let entry = inner.entries.remove(index);
            inner.entries.push(entry);
            self.save(&inner.entries);
            debug!("Server {} moved to the end of the list", current.ip_address);
        }
    }

    /// Place `ordered` at the head in the given order.
    ///
    /// An existing entry whose encoding differs from the one passed in was
    /// replaced concurrently and keeps its position.
    pub fn move_entries_to_front(&self, ordered: &[ServerEntry]) {
        let mut inner = self.inner.lock();
        for entry in ordered.iter().rev() {
            match inner
                .entries
                .iter()
                .position(|e| e.ip_address == entry.ip_address)
            {
                Some(index) => {
                    if inner.entries[index].raw_encoding() != entry.raw_encoding() {
                        continue;
                    }
                    let existing = inner.entries.remove(index);
                    inner.entries.insert(0, existing);
                }
                None => inner.entries.insert(0, entry.clone()),
            }
        }
        self.save(&inner.entries);
    }

    /// Ordered snapshot
    pub fn entries(&self) -> Vec<ServerEntry> {
        self.inner.lock().entries.clone()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().entries.is_empty()
    }

    /// Whether any entry could carry a tunnel in `region`
    pub fn has_usable_entry(&self, region: &str) -> bool {
        self.inner
            .lock()
            .entries
            .iter()
            .any(|e| e.is_tunnel_capable() && e.in_region(region))
    }
}
