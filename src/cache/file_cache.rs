// src/cache/file_cache.rs
// Content-addressed disk cache for downloaded data files

use std::collections::HashMap;
use std::fs;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use anyhow::{Result, anyhow};
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

/// Statistics snapshot for monitoring.
#[derive(Debug, Clone, serde::Serialize)]
pub struct FileCacheStats {
    pub file_count: usize,
    pub total_size_bytes: u64,
    pub cache_dir: String,
    pub max_cache_bytes: u64,
    pub max_file_bytes: u64,
}

/// Disk cache keyed by the SHA-256 of the source URL.
///
/// Files are owned by the cache; callers must not delete returned paths.
/// Concurrent downloads of the same URL are serialized by a per-URL mutex,
/// and the downloader writes to a `.download_` tempfile that is atomically
/// renamed into place on success.
pub struct FileCache {
    cache_dir: PathBuf,
    max_cache_bytes: u64,
    max_file_bytes: u64,
    stale_temp_max_age: Duration,
    url_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    client: reqwest::blocking::Client,
}

impl FileCache {
    pub fn new(
        cache_dir: impl Into<PathBuf>,
        max_cache_bytes: u64,
        max_file_bytes: u64,
        stale_temp_max_age_secs: u64,
    ) -> Self {
        Self {
            cache_dir: cache_dir.into(),
            max_cache_bytes,
            max_file_bytes,
            stale_temp_max_age: Duration::from_secs(stale_temp_max_age_secs),
            url_locks: Mutex::new(HashMap::new()),
            client: reqwest::blocking::Client::builder()
                .timeout(Duration::from_secs(300))
                .build()
                .expect("reqwest blocking client"),
        }
    }

    /// SHA-256 hex digest of the URL.
    pub fn cache_key(url: &str) -> String {
        hex::encode(Sha256::digest(url.as_bytes()))
    }

    /// File suffix derived from the URL path. `.csv.gz` wins over `.csv`,
    /// which wins over `.tsv`; everything else is treated as parquet.
    pub fn suffix_for_url(url: &str) -> &'static str {
        let lower = url.to_lowercase();
        if lower.contains(".csv.gz") {
            ".csv.gz"
        } else if lower.contains(".csv") {
            ".csv"
        } else if lower.contains(".tsv") {
            ".tsv"
        } else {
            ".parquet"
        }
    }

    fn cache_path(&self, url: &str) -> PathBuf {
        self.cache_dir
            .join(format!("{}{}", Self::cache_key(url), Self::suffix_for_url(url)))
    }

    fn temp_path(&self, url: &str) -> PathBuf {
        self.cache_dir.join(format!(
            ".download_{}{}",
            Self::cache_key(url),
            Self::suffix_for_url(url)
        ))
    }

    fn ensure_cache_dir(&self) -> Result<()> {
        fs::create_dir_all(&self.cache_dir)?;
        Ok(())
    }

    fn lock_for_url(&self, url: &str) -> Arc<Mutex<()>> {
        let mut locks = self.url_locks.lock();
        locks
            .entry(url.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Return the cached path if present, bumping its access time.
    pub fn get_cached(&self, url: &str) -> Option<PathBuf> {
        let path = self.cache_path(url);
        if path.is_file() {
            touch(&path);
            Some(path)
        } else {
            None
        }
    }

    /// Download a URL into the cache (blocking) and return its stable path.
    pub fn download_and_cache(&self, url: &str) -> Result<PathBuf> {
        self.ensure_cache_dir()?;

        let lock = self.lock_for_url(url);
        let _guard = lock.lock();

        // Another downloader may have finished while we waited on the lock.
        if let Some(path) = self.get_cached(url) {
            debug!("File cache hit for {}", url);
            return Ok(path);
        }

        let final_path = self.cache_path(url);
        let temp = self.temp_path(url);

        let mut response = self
            .client
            .get(url)
            .send()
            .map_err(|e| anyhow!("Failed to download {url}: {e}"))?;
        if !response.status().is_success() {
            return Err(anyhow!(
                "Failed to download {url}: HTTP {}",
                response.status()
            ));
        }

        let mut out = fs::File::create(&temp)?;
        let mut total: u64 = 0;
        let mut buf = [0u8; 64 * 1024];
        loop {
            let n = response
                .read(&mut buf)
                .map_err(|e| anyhow!("Download of {url} failed mid-stream: {e}"))?;
            if n == 0 {
                break;
            }
            total += n as u64;
            if total > self.max_file_bytes {
                return Err(anyhow!(
                    "File at {url} exceeds the {} byte limit",
                    self.max_file_bytes
                ));
            }
            out.write_all(&buf[..n])?;
        }
        out.flush()?;
        drop(out);

        fs::rename(&temp, &final_path)?;
        info!("Cached {} ({} bytes) as {:?}", url, total, final_path);

        self.evict_lru();
        Ok(final_path)
    }

    /// Remove every cached file; returns the number removed.
    pub fn clear_cache(&self) -> usize {
        let mut removed = 0;
        for entry in list_files(&self.cache_dir) {
            if fs::remove_file(&entry).is_ok() {
                removed += 1;
            }
        }
        removed
    }

    pub fn cache_stats(&self) -> FileCacheStats {
        let mut file_count = 0;
        let mut total_size_bytes = 0u64;
        for entry in list_files(&self.cache_dir) {
            if is_temp(&entry) {
                continue;
            }
            if let Ok(meta) = entry.metadata() {
                file_count += 1;
                total_size_bytes += meta.len();
            }
        }
        FileCacheStats {
            file_count,
            total_size_bytes,
            cache_dir: self.cache_dir.to_string_lossy().into_owned(),
            max_cache_bytes: self.max_cache_bytes,
            max_file_bytes: self.max_file_bytes,
        }
    }

    /// Remove partial-download tempfiles older than the configured age.
    pub fn cleanup_stale_temps(&self) -> usize {
        let mut removed = 0;
        let cutoff = SystemTime::now() - self.stale_temp_max_age;
        for entry in list_files(&self.cache_dir) {
            if !is_temp(&entry) {
                continue;
            }
            let stale = entry
                .metadata()
                .and_then(|m| m.modified())
                .map(|m| m < cutoff)
                .unwrap_or(false);
            if stale && fs::remove_file(&entry).is_ok() {
                debug!("Removed stale tempfile {:?}", entry);
                removed += 1;
            }
        }
        removed
    }

    /// While total size exceeds the cap, remove the least recently touched file.
    pub fn evict_lru(&self) -> usize {
        let mut removed = 0;
        loop {
            let mut files: Vec<(PathBuf, u64, SystemTime)> = list_files(&self.cache_dir)
                .into_iter()
                .filter(|p| !is_temp(p))
                .filter_map(|p| {
                    let meta = p.metadata().ok()?;
                    let mtime = meta.modified().ok()?;
                    Some((p, meta.len(), mtime))
                })
                .collect();

            let total: u64 = files.iter().map(|(_, size, _)| size).sum();
            if total <= self.max_cache_bytes || files.is_empty() {
                break;
            }

            files.sort_by_key(|(_, _, mtime)| *mtime);
            let (oldest, size, _) = files.remove(0);
            if fs::remove_file(&oldest).is_ok() {
                warn!("Evicted {:?} ({} bytes) from file cache", oldest, size);
                removed += 1;
            } else {
                break;
            }
        }
        removed
    }
}

fn list_files(dir: &Path) -> Vec<PathBuf> {
    fs::read_dir(dir)
        .map(|entries| {
            entries
                .filter_map(|e| e.ok())
                .map(|e| e.path())
                .filter(|p| p.is_file())
                .collect()
        })
        .unwrap_or_default()
}

fn is_temp(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .map(|n| n.starts_with(".download_"))
        .unwrap_or(false)
}

fn touch(path: &Path) {
    if let Ok(file) = fs::File::options().write(true).open(path) {
        let _ = file.set_modified(SystemTime::now());
    }
}
