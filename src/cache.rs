// src/cache.rs
//! Content-addressed render cache
//! - Keys: SHA-256 over (source text, canonicalized parameter set)
//! - LRU eviction bounded by byte budget and entry count
//! - Hit/miss counters are cumulative for the cache's lifetime
//!
//! Avoids re-invoking the external geometry compiler for identical inputs.
//! Concurrent `get_or_render` calls for the same key are *not* de-duplicated;
//! the coordinator's single-render guarantee makes that case rare enough that
//! the occasional duplicate compile is cheaper than tracking in-flight keys.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use lru::LruCache;
use parking_lot::Mutex;
use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::params::ParamValue;
use crate::Result;

// ---------- Config ----------

pub struct CacheConfig {
    /// Total byte budget across all cached meshes.
    pub max_bytes: u64,
    /// Hard cap on the number of cached entries.
    pub max_entries: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_bytes: 64 * 1024 * 1024, // 64MB
            max_entries: 128,
        }
    }
}

// ---------- Key ----------

/// Deterministic fingerprint of one (source text, parameter set) pair.
#[derive(Copy, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey([u8; 32]);

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}

impl fmt::Debug for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // First 8 hex chars are plenty for log lines.
        write!(
            f,
            "CacheKey({:02x}{:02x}{:02x}{:02x}..)",
            self.0[0], self.0[1], self.0[2], self.0[3]
        )
    }
}

// ---------- Entry ----------

struct CacheEntry {
    mesh: Arc<[u8]>,
    size_bytes: u64,
    created: Instant,
    last_access: Instant,
    access_count: u64,
    /// Measured compile duration for the miss that produced this entry.
    render_duration: Option<Duration>,
}

// ---------- Stats ----------

/// Snapshot of cache effectiveness, consumed by the stats surface.
#[derive(Debug, Clone, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    /// hits / (hits + misses); 0.0 when the cache has never been queried.
    pub hit_rate: f64,
    pub used_bytes: u64,
    pub entry_count: usize,
    pub max_bytes: u64,
    pub max_entries: usize,
}

// ---------- RenderCache ----------

struct CacheInner {
    entries: LruCache<CacheKey, CacheEntry>,
    total_bytes: u64,
}

impl CacheInner {
    #[cfg(debug_assertions)]
    fn check_byte_total(&self) {
        let sum: u64 = self.entries.iter().map(|(_, e)| e.size_bytes).sum();
        debug_assert_eq!(sum, self.total_bytes, "cache byte total out of sync");
    }

    #[cfg(not(debug_assertions))]
    fn check_byte_total(&self) {}
}

pub struct RenderCache {
    cfg: CacheConfig,
    inner: Mutex<CacheInner>,
    // Lifetime counters; survive clear().
    hits: AtomicU64,
    misses: AtomicU64,
}

impl RenderCache {
    pub fn new(cfg: CacheConfig) -> Self {
        Self {
            cfg,
            inner: Mutex::new(CacheInner {
                entries: LruCache::unbounded(),
                total_bytes: 0,
            }),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Fingerprint one (source, parameters) pair.
    ///
    /// Parameters are canonicalized by name before hashing, so insertion order
    /// never affects the key. Every field is length-prefixed to keep distinct
    /// inputs from colliding under concatenation.
    pub fn compute_key(source: &str, params: &HashMap<String, ParamValue>) -> CacheKey {
        let mut hasher = Sha256::new();
        hasher.update((source.len() as u64).to_le_bytes());
        hasher.update(source.as_bytes());

        let mut sorted: Vec<(&String, &ParamValue)> = params.iter().collect();
        sorted.sort_unstable_by_key(|(name, _)| name.as_str());

        hasher.update((sorted.len() as u64).to_le_bytes());
        for (name, value) in sorted {
            hasher.update((name.len() as u64).to_le_bytes());
            hasher.update(name.as_bytes());
            value.digest_into(&mut hasher);
        }

        CacheKey(hasher.finalize().into())
    }

    /// Look up cached mesh bytes. A hit refreshes recency and access
    /// bookkeeping; a miss only bumps the miss counter.
    pub fn get(&self, key: &CacheKey) -> Option<Arc<[u8]>> {
        let mut inner = self.inner.lock();
        match inner.entries.get_mut(key) {
            Some(entry) => {
                entry.access_count += 1;
                entry.last_access = Instant::now();
                let mesh = entry.mesh.clone();
                self.hits.fetch_add(1, Ordering::Relaxed);
                log::debug!("cache hit for {:?} ({} bytes)", key, mesh.len());
                Some(mesh)
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                log::debug!("cache miss for {:?}", key);
                None
            }
        }
    }

    /// Insert mesh bytes under `key`, evicting least-recently-used entries
    /// until both budgets hold. An entry strictly larger than the whole byte
    /// budget is rejected outright (logged no-op); an entry exactly at the
    /// budget is accepted.
    pub fn store(&self, key: CacheKey, mesh: Arc<[u8]>, render_duration: Option<Duration>) {
        let size_bytes = mesh.len() as u64;
        if size_bytes > self.cfg.max_bytes {
            log::warn!(
                "not caching {:?}: {} bytes exceeds the {} byte budget",
                key,
                size_bytes,
                self.cfg.max_bytes
            );
            return;
        }

        let mut inner = self.inner.lock();

        // Replacing the same key must not double-count its bytes.
        if let Some(old) = inner.entries.pop(&key) {
            inner.total_bytes -= old.size_bytes;
        }

        while inner.entries.len() + 1 > self.cfg.max_entries
            || inner.total_bytes + size_bytes > self.cfg.max_bytes
        {
            match inner.entries.pop_lru() {
                Some((evicted_key, evicted)) => {
                    inner.total_bytes -= evicted.size_bytes;
                    log::debug!(
                        "evicting {:?} ({} bytes, {} accesses, lived {:.1}s, idle {:.1}s, rendered in {:?})",
                        evicted_key,
                        evicted.size_bytes,
                        evicted.access_count,
                        evicted.created.elapsed().as_secs_f64(),
                        evicted.last_access.elapsed().as_secs_f64(),
                        evicted.render_duration
                    );
                }
                None => break,
            }
        }

        let now = Instant::now();
        inner.entries.push(
            key,
            CacheEntry {
                mesh,
                size_bytes,
                created: now,
                last_access: now,
                access_count: 0,
                render_duration,
            },
        );
        inner.total_bytes += size_bytes;
        inner.check_byte_total();
    }

    /// Return cached bytes for `key`, or invoke `render` to produce them.
    ///
    /// On a miss the compile duration is measured and stored as entry
    /// metadata. `render` is invoked at most once per call; simultaneous
    /// callers missing on the same key will each compile.
    pub async fn get_or_render<F, Fut>(&self, key: CacheKey, render: F) -> Result<Arc<[u8]>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Vec<u8>>>,
    {
        if let Some(mesh) = self.get(&key) {
            return Ok(mesh);
        }

        let started = Instant::now();
        let bytes = render().await?;
        let took = started.elapsed();

        let mesh: Arc<[u8]> = bytes.into();
        log::info!(
            "rendered {:?} in {:.1}ms ({} bytes)",
            key,
            took.as_secs_f64() * 1000.0,
            mesh.len()
        );
        self.store(key, mesh.clone(), Some(took));
        Ok(mesh)
    }

    /// Drop every entry. Lifetime hit/miss counters are deliberately kept.
    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        let dropped = inner.entries.len();
        inner.entries.clear();
        inner.total_bytes = 0;
        log::info!("render cache cleared ({} entries dropped)", dropped);
    }

    pub fn stats(&self) -> CacheStats {
        let (used_bytes, entry_count) = {
            let inner = self.inner.lock();
            (inner.total_bytes, inner.entries.len())
        };
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let requests = hits + misses;
        CacheStats {
            hits,
            misses,
            hit_rate: if requests == 0 {
                0.0
            } else {
                hits as f64 / requests as f64
            },
            used_bytes,
            entry_count,
            max_bytes: self.cfg.max_bytes,
            max_entries: self.cfg.max_entries,
        }
    }

}
