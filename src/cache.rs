//! Process-wide channel registry with secondary indices.
//!
//! [`ChannelCache`] maintains the primary `id -> Channel` map plus three
//! secondary indices (type, model, region). Each map is independently
//! lockable; a refresh builds complete replacement maps off to the side
//! and swaps them in under the write locks, so readers see either the
//! full old set or the full new set, never a partial index.

use crate::channel::{Channel, ChannelFilter};
use crate::error::{RelayError, Result};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// External origin of channel definitions (an admin database, a config
/// service). The relay periodically pulls the full set and swaps it into
/// the cache with [`ChannelCache::refresh`]; a load failure leaves the
/// prior state intact.
#[async_trait]
pub trait ChannelSource: Send + Sync {
    /// Produce the complete current channel set.
    async fn load_channels(&self) -> Result<Vec<Arc<Channel>>>;
}

/// Observability counters for the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheStats {
    /// Lookups that found a channel.
    pub hits: u64,
    /// Lookups that missed.
    pub misses: u64,
    /// Channels currently registered.
    pub channels: usize,
}

type Index = HashMap<String, Vec<Arc<Channel>>>;

/// Registry of upstream channels with type/model/region indices.
///
/// The `"*"` supported-model entry is indexed under the literal `"*"`
/// key and expanded at query time, so [`get_by_model`](Self::get_by_model)
/// returns wildcard channels for every model without the index growing
/// per model name.
#[derive(Default)]
pub struct ChannelCache {
    channels: RwLock<HashMap<u64, Arc<Channel>>>,
    by_type: RwLock<Index>,
    by_model: RwLock<Index>,
    by_region: RwLock<Index>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl ChannelCache {
    /// An empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a channel, replacing any previous entry with the same id.
    pub fn add(&self, channel: Arc<Channel>) {
        if let Some(old) = self.channels.write().insert(channel.id, channel.clone()) {
            self.unindex(&old);
        }
        self.index(&channel);
    }

    /// Remove a channel. Returns the removed entry, if any.
    pub fn remove(&self, id: u64) -> Option<Arc<Channel>> {
        let removed = self.channels.write().remove(&id);
        if let Some(ref channel) = removed {
            self.unindex(channel);
        }
        removed
    }

    /// Replace a channel's registration (same as [`add`](Self::add); the
    /// indices are rebuilt for the new attribute values).
    pub fn update(&self, channel: Arc<Channel>) {
        self.add(channel);
    }

    /// Look up a channel by id. Records a hit or miss.
    pub fn get(&self, id: u64) -> Result<Arc<Channel>> {
        match self.channels.read().get(&id) {
            Some(channel) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Ok(channel.clone())
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                Err(RelayError::cache(format!("channel {} not found", id)))
            }
        }
    }

    /// All channels of one provider class. Empty when none match.
    pub fn get_by_type(&self, channel_type: &str) -> Vec<Arc<Channel>> {
        self.by_type
            .read()
            .get(channel_type)
            .cloned()
            .unwrap_or_default()
    }

    /// All channels serving `model`, including wildcard channels.
    pub fn get_by_model(&self, model: &str) -> Vec<Arc<Channel>> {
        let index = self.by_model.read();
        let mut out: Vec<Arc<Channel>> = index.get(model).cloned().unwrap_or_default();
        if model != "*" {
            if let Some(wildcards) = index.get("*") {
                for channel in wildcards {
                    if !out.iter().any(|c| c.id == channel.id) {
                        out.push(channel.clone());
                    }
                }
            }
        }
        out
    }

    /// All channels in one region. Empty when none match.
    pub fn get_by_region(&self, region: &str) -> Vec<Arc<Channel>> {
        self.by_region
            .read()
            .get(region)
            .cloned()
            .unwrap_or_default()
    }

    /// All channels satisfying `filter`, in insertion order of the
    /// narrowest applicable index.
    pub fn filter(&self, filter: &ChannelFilter) -> Vec<Arc<Channel>> {
        // Start from the narrowest index available to avoid a full scan.
        let base: Vec<Arc<Channel>> = if let Some(ref model) = filter.model {
            self.get_by_model(model)
        } else if let Some(ref t) = filter.channel_type {
            self.get_by_type(t)
        } else if let Some(ref region) = filter.region {
            self.get_by_region(region)
        } else {
            self.channels.read().values().cloned().collect()
        };

        base.into_iter().filter(|c| filter.matches(c)).collect()
    }

    /// Atomically replace the whole store with `channels` and rebuild
    /// every index.
    pub fn refresh(&self, channels: Vec<Arc<Channel>>) {
        let mut primary: HashMap<u64, Arc<Channel>> = HashMap::with_capacity(channels.len());
        let mut by_type: Index = HashMap::new();
        let mut by_model: Index = HashMap::new();
        let mut by_region: Index = HashMap::new();

        for channel in channels {
            Self::index_into(&channel, &mut by_type, &mut by_model, &mut by_region);
            primary.insert(channel.id, channel);
        }

        // The primary lock is held across the index swaps so no reader
        // interleaves a new primary map with an old index.
        let mut primary_guard = self.channels.write();
        *primary_guard = primary;
        *self.by_type.write() = by_type;
        *self.by_model.write() = by_model;
        *self.by_region.write() = by_region;
    }

    /// Drop every channel and index entry.
    pub fn clear(&self) {
        self.refresh(Vec::new());
    }

    /// Number of registered channels.
    pub fn len(&self) -> usize {
        self.channels.read().len()
    }

    /// Whether the cache holds no channels.
    pub fn is_empty(&self) -> bool {
        self.channels.read().is_empty()
    }

    /// Snapshot of all channels.
    pub fn all(&self) -> Vec<Arc<Channel>> {
        self.channels.read().values().cloned().collect()
    }

    /// Hit/miss counters and current size.
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            channels: self.len(),
        }
    }

    fn index(&self, channel: &Arc<Channel>) {
        let mut by_type = self.by_type.write();
        let mut by_model = self.by_model.write();
        let mut by_region = self.by_region.write();
        Self::index_into(channel, &mut by_type, &mut by_model, &mut by_region);
    }

    fn index_into(channel: &Arc<Channel>, by_type: &mut Index, by_model: &mut Index, by_region: &mut Index) {
        by_type
            .entry(channel.channel_type.clone())
            .or_default()
            .push(channel.clone());
        for model in &channel.supported_models {
            by_model.entry(model.clone()).or_default().push(channel.clone());
        }
        if !channel.region.is_empty() {
            by_region
                .entry(channel.region.clone())
                .or_default()
                .push(channel.clone());
        }
    }

    fn unindex(&self, channel: &Channel) {
        let mut by_type = self.by_type.write();
        if let Some(list) = by_type.get_mut(&channel.channel_type) {
            list.retain(|c| c.id != channel.id);
            if list.is_empty() {
                by_type.remove(&channel.channel_type);
            }
        }
        drop(by_type);

        let mut by_model = self.by_model.write();
        for model in &channel.supported_models {
            if let Some(list) = by_model.get_mut(model) {
                list.retain(|c| c.id != channel.id);
                if list.is_empty() {
                    by_model.remove(model);
                }
            }
        }
        drop(by_model);

        if !channel.region.is_empty() {
            let mut by_region = self.by_region.write();
            if let Some(list) = by_region.get_mut(&channel.region) {
                list.retain(|c| c.id != channel.id);
                if list.is_empty() {
                    by_region.remove(&channel.region);
                }
            }
        }
    }
}

impl std::fmt::Debug for ChannelCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelCache")
            .field("channels", &self.len())
            .field("hits", &self.hits.load(Ordering::Relaxed))
            .field("misses", &self.misses.load(Ordering::Relaxed))
            .finish()
    }
}
