// Durable response cache keyed by request fingerprint.
//
// The cache is a scoped resource: opened once at process start, held for the
// life of the session, and flushed back to disk on drop so a crash inside a
// REPL turn still unwinds through the flush. On-disk format is a single JSON
// snapshot; the write goes through a temp file plus rename so readers of the
// file never see a half-written snapshot. In-process, the map sits behind an
// RwLock: lookups are concurrent, a put for a key is atomic with respect to
// gets of the same key.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::RwLock;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::fingerprint::Fingerprint;

/// A cached response. Created whole on a successful fetch, never mutated,
/// dropped on expiry or invalidation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
    pub body: String,
    /// Subset of response headers worth keeping (content type, rate-limit
    /// telemetry). Not used for freshness; TTL is ours, not the server's.
    pub headers: BTreeMap<String, String>,
    pub stored_at: u64,
    pub expires_at: u64,
}

impl CacheEntry {
    fn is_expired(&self, now: u64) -> bool {
        now > self.expires_at
    }
}

pub struct ResponseCache {
    path: PathBuf,
    entries: RwLock<HashMap<String, CacheEntry>>,
    dirty: AtomicBool,
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

impl ResponseCache {
    /// Open the cache backed by `path`. A missing file starts empty; a
    /// corrupt file is discarded with a warning rather than failing startup.
    /// Entries that expired while the process was away are pruned on load.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let mut entries: HashMap<String, CacheEntry> = match fs::read_to_string(&path) {
            Ok(raw) => serde_json::from_str(&raw).unwrap_or_else(|e| {
                warn!(path = %path.display(), error = %e, "discarding corrupt cache file");
                HashMap::new()
            }),
            Err(_) => HashMap::new(),
        };

        let now = unix_now();
        let before = entries.len();
        entries.retain(|_, entry| !entry.is_expired(now));
        debug!(
            path = %path.display(),
            loaded = entries.len(),
            pruned = before - entries.len(),
            "opened response cache"
        );

        Ok(ResponseCache {
            path,
            entries: RwLock::new(entries),
            dirty: AtomicBool::new(false),
        })
    }

    /// Look up a fresh entry. Never touches the network; an expired entry
    /// reads as absent.
    pub fn get(&self, fingerprint: &Fingerprint) -> Option<CacheEntry> {
        let entries = self.entries.read().ok()?;
        let entry = entries.get(fingerprint.as_str())?;
        if entry.is_expired(unix_now()) {
            debug!(key = %fingerprint, "cache entry expired");
            return None;
        }
        debug!(key = %fingerprint, "cache hit");
        Some(entry.clone())
    }

    pub fn put(
        &self,
        fingerprint: &Fingerprint,
        body: String,
        headers: BTreeMap<String, String>,
        ttl: Duration,
    ) {
        let now = unix_now();
        let entry = CacheEntry {
            body,
            headers,
            stored_at: now,
            expires_at: now + ttl.as_secs(),
        };
        if let Ok(mut entries) = self.entries.write() {
            entries.insert(fingerprint.as_str().to_string(), entry);
            self.dirty.store(true, Ordering::Release);
            debug!(key = %fingerprint, ttl_secs = ttl.as_secs(), "cache write");
        }
    }

    pub fn invalidate(&self, fingerprint: &Fingerprint) {
        if let Ok(mut entries) = self.entries.write() {
            if entries.remove(fingerprint.as_str()).is_some() {
                self.dirty.store(true, Ordering::Release);
                debug!(key = %fingerprint, "cache invalidated");
            }
        }
    }

    /// Persist the snapshot if anything changed since the last flush.
    /// Temp-file + rename keeps the on-disk file whole at all times.
    pub fn flush(&self) -> Result<()> {
        if !self.dirty.swap(false, Ordering::AcqRel) {
            return Ok(());
        }
        let snapshot = {
            let entries = self
                .entries
                .read()
                .map_err(|_| anyhow::anyhow!("cache lock poisoned"))?;
            serde_json::to_string(&*entries).context("serializing cache snapshot")?
        };
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)
                    .with_context(|| format!("creating cache dir {}", parent.display()))?;
            }
        }
        let tmp = self.path.with_extension("tmp");
        fs::write(&tmp, snapshot)
            .with_context(|| format!("writing cache snapshot {}", tmp.display()))?;
        fs::rename(&tmp, &self.path)
            .with_context(|| format!("replacing cache file {}", self.path.display()))?;
        debug!(path = %self.path.display(), "cache flushed");
        Ok(())
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.entries.read().map(|e| e.len()).unwrap_or(0)
    }

    #[cfg(test)]
    pub fn path(&self) -> &std::path::Path {
        &self.path
    }
}

impl Drop for ResponseCache {
    fn drop(&mut self) {
        // Guaranteed-release path: runs on normal exit and on unwind.
        if let Err(e) = self.flush() {
            warn!(error = %e, "failed to flush response cache on shutdown");
        }
    }
}
