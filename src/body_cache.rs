//! Content-addressed request-body cache.
//!
//! Request bodies are stored once and replayed across retries and channel
//! switches. Three modes: memory, disk, or hybrid (memory below a byte
//! threshold, disk above). Entry ids combine the body's MD5 with a
//! nanosecond timestamp so identical bodies get distinct ids. A
//! background cleaner purges entries past their TTL, then evicts oldest
//! entries until total size drops to 80% of the ceiling.

use crate::config::{BodyCacheConfig, CacheMode};
use crate::error::{RelayError, Result};
use crate::events::{emit, Event, EventHandler};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Observability counters for the body cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BodyCacheStats {
    /// Lookups served from either tier.
    pub hits: u64,
    /// Lookups that found nothing.
    pub misses: u64,
    /// Entries removed by TTL or size eviction.
    pub evictions: u64,
    /// Total cached bytes across both tiers.
    pub total_bytes: u64,
    /// Entries in the memory tier.
    pub memory_entries: usize,
    /// Entries in the disk tier.
    pub disk_entries: usize,
}

#[derive(Debug, Clone)]
struct MemoryEntry {
    bytes: Vec<u8>,
    created_at: SystemTime,
}

#[derive(Debug, Clone)]
struct DiskEntry {
    path: PathBuf,
    size: u64,
    md5: String,
    created_at: SystemTime,
}

/// The body cache.
pub struct BodyCache {
    config: BodyCacheConfig,
    memory: RwLock<HashMap<String, MemoryEntry>>,
    disk: RwLock<HashMap<String, DiskEntry>>,
    total_bytes: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    events: Option<Arc<dyn EventHandler>>,
    task: Mutex<Option<JoinHandle<()>>>,
    shutdown: Mutex<CancellationToken>,
}

impl BodyCache {
    /// An empty cache with the given settings.
    pub fn new(config: BodyCacheConfig) -> Self {
        Self {
            config,
            memory: RwLock::new(HashMap::new()),
            disk: RwLock::new(HashMap::new()),
            total_bytes: AtomicU64::new(0),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            events: None,
            task: Mutex::new(None),
            shutdown: Mutex::new(CancellationToken::new()),
        }
    }

    /// Attach an event handler for eviction reporting.
    pub fn with_events(mut self, events: Arc<dyn EventHandler>) -> Self {
        self.events = Some(events);
        self
    }

    /// Derive a unique cache id for `body`: MD5 hex plus a nanosecond
    /// timestamp, so identical bodies never collide.
    fn make_id(body: &[u8]) -> String {
        let digest = md5::compute(body);
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos();
        format!("{:x}-{}", digest, nanos)
    }

    /// Store `body` and return its cache id.
    pub async fn put(&self, body: &[u8]) -> Result<String> {
        let id = Self::make_id(body);
        let use_disk = match self.config.mode {
            CacheMode::Memory => false,
            CacheMode::Disk => true,
            CacheMode::Hybrid => body.len() as u64 > self.config.memory_threshold,
        };

        if use_disk {
            tokio::fs::create_dir_all(&self.config.disk_path)
                .await
                .map_err(|e| RelayError::cache(format!("create cache dir: {}", e)))?;
            let path = self.config.disk_path.join(format!("{}.dat", id));
            tokio::fs::write(&path, body)
                .await
                .map_err(|e| RelayError::cache(format!("write cache entry: {}", e)))?;

            let entry = DiskEntry {
                path,
                size: body.len() as u64,
                md5: format!("{:x}", md5::compute(body)),
                created_at: SystemTime::now(),
            };
            self.disk.write().insert(id.clone(), entry);
        } else {
            let entry = MemoryEntry {
                bytes: body.to_vec(),
                created_at: SystemTime::now(),
            };
            self.memory.write().insert(id.clone(), entry);
        }

        self.total_bytes.fetch_add(body.len() as u64, Ordering::Relaxed);
        Ok(id)
    }

    /// Fetch a body by id. Memory is consulted first, then the disk
    /// metadata; a missing file invalidates its metadata entry.
    pub async fn get(&self, id: &str) -> Result<Vec<u8>> {
        if let Some(entry) = self.memory.read().get(id) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(entry.bytes.clone());
        }

        let disk_entry = self.disk.read().get(id).cloned();
        if let Some(entry) = disk_entry {
            match tokio::fs::read(&entry.path).await {
                Ok(bytes) => {
                    self.hits.fetch_add(1, Ordering::Relaxed);
                    return Ok(bytes);
                }
                Err(_) => {
                    // Stale metadata for a vanished file.
                    if self.disk.write().remove(id).is_some() {
                        self.total_bytes.fetch_sub(entry.size, Ordering::Relaxed);
                    }
                }
            }
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        Err(RelayError::cache(format!("body {} not found", id)))
    }

    /// Remove one entry from either tier.
    pub async fn remove(&self, id: &str) {
        if let Some(entry) = self.memory.write().remove(id) {
            self.total_bytes
                .fetch_sub(entry.bytes.len() as u64, Ordering::Relaxed);
            return;
        }
        let removed = self.disk.write().remove(id);
        if let Some(entry) = removed {
            self.total_bytes.fetch_sub(entry.size, Ordering::Relaxed);
            let _ = tokio::fs::remove_file(&entry.path).await;
        }
    }

    /// Purge expired entries, then evict oldest entries until total size
    /// is at or below 80% of the ceiling.
    pub async fn cleanup(&self) {
        let now = SystemTime::now();
        let ttl = self.config.max_cache_duration;

        // TTL pass.
        let mut expired: Vec<String> = Vec::new();
        {
            let memory = self.memory.read();
            for (id, entry) in memory.iter() {
                if now.duration_since(entry.created_at).unwrap_or_default() > ttl {
                    expired.push(id.clone());
                }
            }
        }
        {
            let disk = self.disk.read();
            for (id, entry) in disk.iter() {
                if now.duration_since(entry.created_at).unwrap_or_default() > ttl {
                    expired.push(id.clone());
                }
            }
        }

        let mut reclaimed = 0u64;
        let ttl_evicted = expired.len() as u64;
        for id in &expired {
            let before = self.total_bytes.load(Ordering::Relaxed);
            self.remove(id).await;
            reclaimed += before.saturating_sub(self.total_bytes.load(Ordering::Relaxed));
        }
        if ttl_evicted > 0 {
            self.evictions.fetch_add(ttl_evicted, Ordering::Relaxed);
            emit(
                &self.events,
                Event::CacheEviction {
                    evicted: ttl_evicted,
                    reclaimed_bytes: reclaimed,
                    reason: "ttl",
                },
            );
        }

        // Size pass: oldest first, down to 80% of the ceiling.
        if self.total_bytes.load(Ordering::Relaxed) <= self.config.max_cache_size {
            return;
        }
        let target = self.config.max_cache_size * 8 / 10;

        let mut entries: Vec<(String, SystemTime, u64)> = Vec::new();
        {
            let memory = self.memory.read();
            for (id, entry) in memory.iter() {
                entries.push((id.clone(), entry.created_at, entry.bytes.len() as u64));
            }
        }
        {
            let disk = self.disk.read();
            for (id, entry) in disk.iter() {
                entries.push((id.clone(), entry.created_at, entry.size));
            }
        }
        entries.sort_by_key(|(_, created, _)| *created);

        let mut size_evicted = 0u64;
        let mut size_reclaimed = 0u64;
        for (id, _, size) in entries {
            if self.total_bytes.load(Ordering::Relaxed) <= target {
                break;
            }
            self.remove(&id).await;
            size_evicted += 1;
            size_reclaimed += size;
        }
        if size_evicted > 0 {
            self.evictions.fetch_add(size_evicted, Ordering::Relaxed);
            emit(
                &self.events,
                Event::CacheEviction {
                    evicted: size_evicted,
                    reclaimed_bytes: size_reclaimed,
                    reason: "size",
                },
            );
        }
    }

    /// Atomically empty both tiers.
    pub async fn purge_all(&self) {
        let disk_entries: Vec<DiskEntry> = {
            let mut memory = self.memory.write();
            let mut disk = self.disk.write();
            memory.clear();
            let entries = disk.drain().map(|(_, e)| e).collect();
            self.total_bytes.store(0, Ordering::Relaxed);
            entries
        };

        for entry in disk_entries {
            let _ = tokio::fs::remove_file(&entry.path).await;
        }
    }

    /// The recorded MD5 of a disk entry, for integrity checks.
    pub fn disk_md5(&self, id: &str) -> Option<String> {
        self.disk.read().get(id).map(|e| e.md5.clone())
    }

    /// Current counters and tier sizes.
    pub fn stats(&self) -> BodyCacheStats {
        BodyCacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            total_bytes: self.total_bytes.load(Ordering::Relaxed),
            memory_entries: self.memory.read().len(),
            disk_entries: self.disk.read().len(),
        }
    }

    /// Launch the periodic cleanup loop. Idempotent.
    pub fn start(self: &Arc<Self>) {
        let mut task = self.task.lock();
        if task.is_some() {
            return;
        }

        let token = CancellationToken::new();
        *self.shutdown.lock() = token.clone();

        let cache = self.clone();
        let interval = self.config.cleanup_interval;
        *task = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        tracing::debug!("body cache cleanup pass");
                        cache.cleanup().await;
                    }
                }
            }
        }));
    }

    /// Stop the cleanup loop and wait for it to exit. Idempotent.
    pub async fn stop(&self) {
        self.shutdown.lock().cancel();
        let task = self.task.lock().take();
        if let Some(handle) = task {
            let _ = handle.await;
        }
    }
}

impl std::fmt::Debug for BodyCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let stats = self.stats();
        f.debug_struct("BodyCache")
            .field("mode", &self.config.mode)
            .field("total_bytes", &stats.total_bytes)
            .field("memory_entries", &stats.memory_entries)
            .field("disk_entries", &stats.disk_entries)
            .finish()
    }
}
