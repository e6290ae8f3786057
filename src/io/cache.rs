//! Tiered result cache
//!
//! Results live in two tiers. The memory tier holds recently produced results
//! for a fixed TTL, at most `memory_capacity` of them, evicting the least
//! recently used first. The disk tier holds three PNG derivatives per result under
//! `full/`, `thumb/` and `preview/`, indexed by `metadata.json`:
//!
//! ```text
//! <cache_dir>/
//!   metadata.json
//!   full/<key>.png
//!   thumb/<key>.png
//!   preview/<key>.png
//! ```
//!
//! Keys are the SHA-256 of the canonical request serialization, so identical
//! requests always resolve to the same entry.

use crate::core::analysis::IndexStatistics;
use crate::core::visualize::VisualizationMode;
use crate::io::encode::{self, Derivative};
use crate::types::{
    CacheTier, FusionError, FusionOutcome, FusionProvenance, FusionRequest, FusionResult, GeoWindow,
};
use chrono::{DateTime, Utc};
use lru::LruCache;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Bumped whenever rendering changes so stale entries stop matching
pub const CACHE_FORMAT_VERSION: &str = "v5";

const INDEX_FILE: &str = "metadata.json";

/// Cache configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Root directory of the disk tier
    pub cache_dir: PathBuf,
    /// Lifetime of memory-tier entries in seconds
    pub memory_ttl_secs: u64,
    /// Most results held in memory; 0 disables the memory tier
    pub memory_capacity: usize,
    /// Longest edge of the thumbnail derivative
    pub thumbnail_size: u32,
    /// Longest edge of the preview derivative
    pub preview_size: u32,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            cache_dir: default_cache_dir(),
            memory_ttl_secs: 3600, // 1 hour
            memory_capacity: 64,
            thumbnail_size: 256,
            preview_size: 128,
        }
    }
}

impl CacheConfig {
    pub fn in_dir<P: AsRef<Path>>(cache_dir: P) -> Self {
        Self {
            cache_dir: cache_dir.as_ref().to_path_buf(),
            ..Default::default()
        }
    }
}

/// Platform cache directory, or `./cache` when there is none
pub fn default_cache_dir() -> PathBuf {
    dirs::cache_dir()
        .map(|dir| dir.join("geofusion"))
        .unwrap_or_else(|| PathBuf::from("./cache"))
}

/// Byte sizes of the stored derivatives
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DerivativeSizes {
    pub full: u64,
    pub thumb: u64,
    pub preview: u64,
}

impl DerivativeSizes {
    pub fn total(&self) -> u64 {
        self.full + self.thumb + self.preview
    }

    fn set(&mut self, derivative: Derivative, size: u64) {
        match derivative {
            Derivative::Full => self.full = size,
            Derivative::Thumbnail => self.thumb = size,
            Derivative::Preview => self.preview = size,
        }
    }
}

/// Metadata index record of one cached result
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub key: String,
    #[serde(rename = "timestamp")]
    pub created_at: DateTime<Utc>,
    /// `(height, width)` of the full derivative
    pub original_size: (usize, usize),
    pub derivative_sizes: DerivativeSizes,
    /// Stored renditions over the full-resolution byte size
    pub compression_ratio: f64,
    pub source_parameters: FusionRequest,
    pub window: GeoWindow,
    pub visualization: VisualizationMode,
    pub provenance: FusionProvenance,
    pub statistics: Option<IndexStatistics>,
}

/// Where a key currently lives
#[derive(Debug, Clone)]
pub struct CacheStatus {
    pub key: String,
    pub in_memory: bool,
    pub on_disk: bool,
    pub entry: Option<CacheEntry>,
}

/// Outcome of an age-based cleanup
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CleanupStats {
    /// Entries removed from the index
    pub items_removed: usize,
    /// Bytes of derivative files deleted
    pub bytes_freed: u64,
}

/// Disk tier totals
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CacheStats {
    pub total_items: usize,
    pub total_bytes: u64,
    pub memory_items: usize,
    pub cache_dir: PathBuf,
}

/// Memory + disk result cache
///
/// The metadata index is only mutated under its lock. Derivative files for
/// different keys may be written concurrently.
pub struct TieredCache {
    config: CacheConfig,
    index: Mutex<BTreeMap<String, CacheEntry>>,
    memory: Mutex<LruCache<String, (Instant, Arc<FusionResult>)>>,
}

impl TieredCache {
    /// Open (or create) a cache directory and load its index
    pub fn open(config: CacheConfig) -> FusionOutcome<Self> {
        std::fs::create_dir_all(&config.cache_dir)?;
        for derivative in Derivative::ALL {
            std::fs::create_dir_all(config.cache_dir.join(derivative.dir_name()))?;
        }

        let index_path = config.cache_dir.join(INDEX_FILE);
        let index = if index_path.exists() {
            let bytes = std::fs::read(&index_path)?;
            match serde_json::from_slice::<BTreeMap<String, CacheEntry>>(&bytes) {
                Ok(index) => index,
                Err(e) => {
                    log::warn!(
                        "Ignoring unreadable cache index {}: {}",
                        index_path.display(),
                        e
                    );
                    BTreeMap::new()
                }
            }
        } else {
            BTreeMap::new()
        };

        log::info!(
            "Opened cache at {} with {} entries",
            config.cache_dir.display(),
            index.len()
        );

        Ok(Self {
            config,
            index: Mutex::new(index),
            memory: Mutex::new(LruCache::unbounded()),
        })
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Content-addressed key of a request
    pub fn cache_key(request: &FusionRequest) -> FusionOutcome<String> {
        let canonical = serde_json::to_vec(&serde_json::json!({
            "version": CACHE_FORMAT_VERSION,
            "request": request,
        }))?;
        let digest = Sha256::digest(&canonical);
        Ok(digest.iter().map(|b| format!("{:02x}", b)).collect())
    }

    /// Public identifier of the result stored under `key`
    pub fn result_id(key: &str) -> String {
        format!("fusion_{}", &key[..key.len().min(12)])
    }

    /// Path of a derivative file
    pub fn derivative_path(&self, key: &str, derivative: Derivative) -> PathBuf {
        self.config
            .cache_dir
            .join(derivative.dir_name())
            .join(format!("{}.png", key))
    }

    pub fn contains(&self, key: &str) -> bool {
        self.index.lock().contains_key(key)
    }

    /// Look a key up in the memory tier, then the disk tier
    ///
    /// Disk hits are promoted to memory. Unreadable disk entries count as misses.
    pub fn get(&self, key: &str) -> Option<FusionResult> {
        if let Some(result) = self.get_memory(key) {
            log::debug!("Memory cache hit for {}", key);
            return Some(result);
        }

        let entry = self.index.lock().get(key).cloned()?;
        match self.load_from_disk(&entry) {
            Ok(result) => {
                log::debug!("Disk cache hit for {}", key);
                self.remember(key, result.clone());
                Some(result)
            }
            Err(e) => {
                log::warn!("Failed to read cached result {}: {}", key, e);
                None
            }
        }
    }

    fn get_memory(&self, key: &str) -> Option<FusionResult> {
        let ttl = Duration::from_secs(self.config.memory_ttl_secs);
        let mut memory = self.memory.lock();
        let expired = match memory.get(key) {
            Some((stored, result)) if stored.elapsed() < ttl => {
                let mut result = (**result).clone();
                result.served_from = CacheTier::Memory;
                return Some(result);
            }
            Some(_) => true,
            None => false,
        };
        if expired {
            memory.pop(key);
        }
        None
    }

    /// Insert into the memory tier, evicting least recently used entries
    fn remember(&self, key: &str, result: FusionResult) {
        let capacity = self.config.memory_capacity;
        if capacity == 0 {
            return;
        }
        let mut memory = self.memory.lock();
        memory.pop(key);
        while memory.len() >= capacity {
            match memory.pop_lru() {
                Some((evicted, _)) => log::debug!("Evicted {} from memory cache", evicted),
                None => break,
            }
        }
        memory.put(key.to_string(), (Instant::now(), Arc::new(result)));
    }

    fn load_from_disk(&self, entry: &CacheEntry) -> FusionOutcome<FusionResult> {
        let bytes = std::fs::read(self.derivative_path(&entry.key, Derivative::Full))?;
        let data = encode::image_to_tensor(&encode::decode_png(&bytes)?);
        Ok(FusionResult {
            id: Self::result_id(&entry.key),
            cache_key: entry.key.clone(),
            window: entry.window,
            visualization: entry.visualization,
            data,
            provenance: entry.provenance.clone(),
            statistics: entry.statistics.clone(),
            served_from: CacheTier::Disk,
        })
    }

    /// Persist a result's derivatives and index entry
    pub fn store(&self, result: &FusionResult, request: &FusionRequest) -> FusionOutcome<CacheEntry> {
        self.store_at(result, request, Utc::now())
    }

    /// Persist with an explicit creation time
    pub fn store_at(
        &self,
        result: &FusionResult,
        request: &FusionRequest,
        created_at: DateTime<Utc>,
    ) -> FusionOutcome<CacheEntry> {
        let key = result.cache_key.clone();
        let full = encode::tensor_to_image(&result.data)?;

        let mut sizes = DerivativeSizes::default();
        let mut written = Vec::new();
        for derivative in Derivative::ALL {
            let path = self.derivative_path(&key, derivative);
            match self.write_derivative(&full, derivative, &path) {
                Ok(size) => {
                    sizes.set(derivative, size);
                    written.push(path);
                }
                Err(e) => {
                    remove_files(&written);
                    return Err(FusionError::Cache(format!(
                        "Failed to write {} derivative for {}: {}",
                        derivative.dir_name(),
                        key,
                        e
                    )));
                }
            }
        }

        let entry = CacheEntry {
            key: key.clone(),
            created_at,
            original_size: result.dim(),
            derivative_sizes: sizes,
            compression_ratio: if sizes.full > 0 {
                sizes.total() as f64 / sizes.full as f64
            } else {
                0.0
            },
            source_parameters: request.clone(),
            window: result.window,
            visualization: result.visualization,
            provenance: result.provenance.clone(),
            statistics: result.statistics.clone(),
        };

        {
            let mut index = self.index.lock();
            let previous = index.insert(key.clone(), entry.clone());
            if let Err(e) = self.save_index(&index) {
                match previous {
                    Some(prev) => {
                        index.insert(key.clone(), prev);
                    }
                    None => {
                        index.remove(&key);
                        remove_files(&written);
                    }
                }
                return Err(e);
            }
        }

        let mut cached = result.clone();
        cached.served_from = CacheTier::Computed;
        self.remember(&key, cached);

        log::info!(
            "Cached {} ({}x{}, {} bytes on disk)",
            key,
            entry.original_size.0,
            entry.original_size.1,
            sizes.total()
        );
        Ok(entry)
    }

    fn write_derivative(&self, full: &image::RgbImage, derivative: Derivative, path: &Path) -> FusionOutcome<u64> {
        let bytes = match derivative {
            Derivative::Full => encode::encode_png(full)?,
            Derivative::Thumbnail => encode::encode_png(&encode::derivative(full, self.config.thumbnail_size))?,
            Derivative::Preview => encode::encode_png(&encode::derivative(full, self.config.preview_size))?,
        };
        std::fs::write(path, &bytes)?;
        Ok(bytes.len() as u64)
    }

    fn save_index(&self, index: &BTreeMap<String, CacheEntry>) -> FusionOutcome<()> {
        let path = self.config.cache_dir.join(INDEX_FILE);
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, serde_json::to_vec_pretty(index)?)?;
        std::fs::rename(&tmp, &path)?;
        Ok(())
    }

    pub fn status(&self, key: &str) -> CacheStatus {
        let ttl = Duration::from_secs(self.config.memory_ttl_secs);
        let in_memory = self
            .memory
            .lock()
            .peek(key)
            .map(|(stored, _)| stored.elapsed() < ttl)
            .unwrap_or(false);
        let entry = self.index.lock().get(key).cloned();
        CacheStatus {
            key: key.to_string(),
            in_memory,
            on_disk: entry.is_some(),
            entry,
        }
    }

    /// Encoded bytes of one derivative, `None` if the key is not cached
    pub fn get_derivative(&self, key: &str, derivative: Derivative) -> FusionOutcome<Option<Vec<u8>>> {
        if !self.contains(key) {
            return Ok(None);
        }
        let path = self.derivative_path(key, derivative);
        match std::fs::read(&path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub fn get_full(&self, key: &str) -> FusionOutcome<Option<Vec<u8>>> {
        self.get_derivative(key, Derivative::Full)
    }

    pub fn get_thumbnail(&self, key: &str) -> FusionOutcome<Option<Vec<u8>>> {
        self.get_derivative(key, Derivative::Thumbnail)
    }

    pub fn get_preview(&self, key: &str) -> FusionOutcome<Option<Vec<u8>>> {
        self.get_derivative(key, Derivative::Preview)
    }

    /// Remove entries older than `max_age`
    pub fn cleanup(&self, max_age: chrono::Duration) -> FusionOutcome<CleanupStats> {
        self.cleanup_older_than(Utc::now() - max_age)
    }

    /// Remove entries created before `cutoff`, with their files
    pub fn cleanup_older_than(&self, cutoff: DateTime<Utc>) -> FusionOutcome<CleanupStats> {
        let mut stats = CleanupStats::default();
        let mut index = self.index.lock();

        let expired: Vec<String> = index
            .values()
            .filter(|entry| entry.created_at < cutoff)
            .map(|entry| entry.key.clone())
            .collect();
        if expired.is_empty() {
            return Ok(stats);
        }

        // Whatever was removed before a failure is still written to the index
        let mut removed = Vec::new();
        let mut failure = None;
        for key in &expired {
            match self.remove_derivatives(key) {
                Ok(bytes) => {
                    index.remove(key);
                    stats.items_removed += 1;
                    stats.bytes_freed += bytes;
                    removed.push(key);
                }
                Err(e) => {
                    log::warn!("Failed to remove cached files for {}: {}", key, e);
                    failure = Some(e);
                    break;
                }
            }
        }
        if !removed.is_empty() {
            self.save_index(&index)?;
        }
        drop(index);

        let mut memory = self.memory.lock();
        for key in removed {
            memory.pop(key);
        }
        drop(memory);

        if let Some(e) = failure {
            return Err(e);
        }

        log::info!(
            "Cache cleanup removed {} entries, freed {} bytes",
            stats.items_removed,
            stats.bytes_freed
        );
        Ok(stats)
    }

    /// Delete the derivative files of one key; returns the bytes freed
    fn remove_derivatives(&self, key: &str) -> FusionOutcome<u64> {
        let mut freed = 0;
        for derivative in Derivative::ALL {
            let path = self.derivative_path(key, derivative);
            match std::fs::metadata(&path) {
                Ok(meta) => {
                    std::fs::remove_file(&path)?;
                    freed += meta.len();
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(freed)
    }

    pub fn stats(&self) -> CacheStats {
        let index = self.index.lock();
        CacheStats {
            total_items: index.len(),
            total_bytes: index.values().map(|e| e.derivative_sizes.total()).sum(),
            memory_items: self.memory.lock().len(),
            cache_dir: self.config.cache_dir.clone(),
        }
    }

    /// Drop memory entries past their TTL; returns how many were dropped
    pub fn purge_expired_memory(&self) -> usize {
        let ttl = Duration::from_secs(self.config.memory_ttl_secs);
        let mut memory = self.memory.lock();
        let expired: Vec<String> = memory
            .iter()
            .filter(|(_, (stored, _))| stored.elapsed() >= ttl)
            .map(|(key, _)| key.clone())
            .collect();
        for key in &expired {
            memory.pop(key);
        }
        expired.len()
    }
}

fn remove_files(paths: &[PathBuf]) {
    for path in paths {
        if let Err(e) = std::fs::remove_file(path) {
            log::warn!("Failed to remove {}: {}", path.display(), e);
        }
    }
}
