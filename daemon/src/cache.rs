/// Content-addressed on-disk store for downloaded images.
///
/// Files are named by the SHA-256 of their source URL plus an extension
/// inferred from the URL path, so the same URL always lands on the same
/// file across restarts. Expired entries are purged lazily on lookup and
/// eagerly once at construction; the size cap is enforced inside
/// [`ImageCache::store`] by evicting least-recently-accessed files first.
///
/// The whole check-evict-write sequence runs under one mutex so two
/// concurrent downloads cannot both conclude there is room and jointly
/// overshoot the cap.
use anyhow::{bail, Context, Result};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{Duration, SystemTime};

use crate::config::CacheConfig;

/// Fallback extension when the URL path carries none (or an implausible one).
pub const DEFAULT_EXTENSION: &str = "jpg";
const MAX_EXTENSION_LEN: usize = 5;

/// Cache behavior knobs, derived from the `[cache]` config section.
/// Passed per call so a config reload takes effect without rebuilding
/// the cache.
#[derive(Debug, Clone)]
pub struct CacheSettings {
    pub enabled: bool,
    pub max_bytes: u64,
    pub expiry: Duration,
}

impl From<&CacheConfig> for CacheSettings {
    fn from(c: &CacheConfig) -> Self {
        Self {
            enabled: c.enabled,
            max_bytes: c.max_size_mb.saturating_mul(1024 * 1024),
            expiry: Duration::from_secs(c.expiry_days.saturating_mul(24 * 60 * 60)),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct EntryMeta {
    created: SystemTime,
    last_access: SystemTime,
    size: u64,
}

pub struct ImageCache {
    dir: PathBuf,
    /// Per-file bookkeeping, keyed by on-disk file name. Seeded from fs
    /// metadata by the startup sweep, authoritative afterwards.
    entries: Mutex<HashMap<String, EntryMeta>>,
}

impl ImageCache {
    /// Opens (creating if needed) the cache at `dir` and runs the one-time
    /// startup sweep: entries older than the expiry threshold are deleted,
    /// the rest seed the in-memory table.
    pub fn new(dir: PathBuf, settings: &CacheSettings) -> Self {
        if let Err(e) = std::fs::create_dir_all(&dir) {
            eprintln!("[cache] Failed to create cache directory {}: {e}", dir.display());
        }

        let mut entries = HashMap::new();
        let mut swept = 0usize;
        if let Ok(read_dir) = std::fs::read_dir(&dir) {
            let now = SystemTime::now();
            for entry in read_dir.flatten() {
                let path = entry.path();
                if !path.is_file() {
                    continue;
                }
                let Ok(meta) = entry.metadata() else { continue };
                let (created, last_access) = file_times(&meta);
                if age(now, created) >= settings.expiry {
                    if let Err(e) = std::fs::remove_file(&path) {
                        eprintln!("[cache] Failed to sweep {}: {e}", path.display());
                    } else {
                        swept += 1;
                    }
                    continue;
                }
                if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
                    entries.insert(
                        name.to_string(),
                        EntryMeta {
                            created,
                            last_access,
                            size: meta.len(),
                        },
                    );
                }
            }
        }
        if swept > 0 {
            eprintln!("[cache] Startup sweep removed {swept} expired file(s)");
        }

        Self {
            dir,
            entries: Mutex::new(entries),
        }
    }

    /// Deterministic cache key for `url`: lowercase-hex SHA-256.
    pub fn cache_key(url: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(url.as_bytes());
        format!("{:x}", hasher.finalize())
    }

    /// On-disk file name for `url`: `<sha256>.<ext>`.
    pub fn cached_file_name(url: &str) -> String {
        format!("{}.{}", Self::cache_key(url), infer_extension(url))
    }

    /// Looks `url` up in the cache. Returns the local path on a fresh hit
    /// (updating its last-access time); deletes and misses on an expired
    /// entry; always misses when the cache is disabled.
    pub fn resolve(&self, url: &str, settings: &CacheSettings) -> Option<PathBuf> {
        if !settings.enabled {
            return None;
        }

        let name = Self::cached_file_name(url);
        let path = self.dir.join(&name);
        let mut entries = self.entries.lock().unwrap();

        if !path.is_file() {
            entries.remove(&name);
            return None;
        }

        let now = SystemTime::now();
        let meta = match entries.get(&name) {
            Some(m) => *m,
            // On disk but not in the table (e.g. placed there externally):
            // adopt it with fs timestamps.
            None => {
                let fs_meta = std::fs::metadata(&path).ok()?;
                let (created, last_access) = file_times(&fs_meta);
                EntryMeta {
                    created,
                    last_access,
                    size: fs_meta.len(),
                }
            }
        };

        if age(now, meta.created) >= settings.expiry {
            if let Err(e) = std::fs::remove_file(&path) {
                eprintln!("[cache] Failed to remove expired {}: {e}", path.display());
            }
            entries.remove(&name);
            return None;
        }

        entries.insert(
            name,
            EntryMeta {
                last_access: now,
                ..meta
            },
        );
        Some(path)
    }

    /// Writes `bytes` for `url` into the cache, evicting least-recently-
    /// accessed entries first until the configured cap has room. Errors here
    /// are non-fatal to callers, which fall back to [`spill_to_temp`].
    pub fn store(&self, url: &str, bytes: &[u8], settings: &CacheSettings) -> Result<PathBuf> {
        if !settings.enabled {
            bail!("cache is disabled");
        }

        let name = Self::cached_file_name(url);
        let path = self.dir.join(&name);
        let needed = bytes.len() as u64;

        let mut entries = self.entries.lock().unwrap();

        std::fs::create_dir_all(&self.dir)
            .with_context(|| format!("Failed to create cache directory {}", self.dir.display()))?;

        // Re-storing the same URL replaces its file; drop the old entry from
        // the accounting before sizing the eviction.
        entries.remove(&name);
        let mut total: u64 = entries.values().map(|m| m.size).sum();

        if total + needed > settings.max_bytes {
            let mut by_access: Vec<(String, EntryMeta)> =
                entries.iter().map(|(k, v)| (k.clone(), *v)).collect();
            by_access.sort_by_key(|(_, m)| m.last_access);

            for (victim, meta) in by_access {
                if total + needed <= settings.max_bytes {
                    break;
                }
                let victim_path = self.dir.join(&victim);
                if let Err(e) = std::fs::remove_file(&victim_path) {
                    eprintln!("[cache] Failed to evict {}: {e}", victim_path.display());
                }
                entries.remove(&victim);
                total = total.saturating_sub(meta.size);
            }
        }

        std::fs::write(&path, bytes)
            .with_context(|| format!("Failed to write cache file {}", path.display()))?;

        let now = SystemTime::now();
        entries.insert(
            name,
            EntryMeta {
                created: now,
                last_access: now,
                size: needed,
            },
        );
        Ok(path)
    }

    /// Total size of all tracked cache entries, in bytes.
    pub fn total_size(&self) -> u64 {
        self.entries.lock().unwrap().values().map(|m| m.size).sum()
    }

    /// Test hook: backdate an entry's bookkeeping times.
    #[cfg(test)]
    fn set_times(&self, url: &str, created: SystemTime, last_access: SystemTime) {
        let name = Self::cached_file_name(url);
        let mut entries = self.entries.lock().unwrap();
        if let Some(meta) = entries.get_mut(&name) {
            meta.created = created;
            meta.last_access = last_access;
        }
    }
}

/// Resolves `url` to a local file: cache hit, or download-and-store on a
/// miss. A failed cache write degrades to a throwaway temp file — the image
/// still gets applied, it just is not retained.
pub async fn resolve_or_fetch(
    cache: &ImageCache,
    api: &dyn crate::api::LinkApi,
    settings: &CacheSettings,
    url: &str,
) -> Result<PathBuf> {
    if let Some(path) = cache.resolve(url, settings) {
        return Ok(path);
    }
    let bytes = api.download(url).await?;
    if !settings.enabled {
        return spill_to_temp(url, &bytes);
    }
    match cache.store(url, &bytes, settings) {
        Ok(path) => Ok(path),
        Err(e) => {
            eprintln!("[cache] Store failed ({e:#}); falling back to a temp file");
            spill_to_temp(url, &bytes)
        }
    }
}

/// Writes `bytes` to a throwaway file under the OS temp directory and returns
/// its path. The fallback when the cache itself cannot be written.
pub fn spill_to_temp(url: &str, bytes: &[u8]) -> Result<PathBuf> {
    let path = std::env::temp_dir().join(ImageCache::cached_file_name(url));
    std::fs::write(&path, bytes)
        .with_context(|| format!("Failed to write temp file {}", path.display()))?;
    Ok(path)
}

/// Extension from the final URL path segment, when present and plausible
/// (1–5 alphanumeric chars); otherwise [`DEFAULT_EXTENSION`].
fn infer_extension(url: &str) -> String {
    let ext = url::Url::parse(url).ok().and_then(|u| {
        let segment = u.path_segments()?.last()?.to_string();
        let ext = Path::new(&segment).extension()?.to_str()?.to_ascii_lowercase();
        let plausible = !ext.is_empty()
            && ext.len() <= MAX_EXTENSION_LEN
            && ext.chars().all(|c| c.is_ascii_alphanumeric());
        plausible.then_some(ext)
    });
    ext.unwrap_or_else(|| DEFAULT_EXTENSION.to_string())
}

/// (created, last-access) from fs metadata, degrading to the modification
/// time where the platform or filesystem does not track one.
fn file_times(meta: &std::fs::Metadata) -> (SystemTime, SystemTime) {
    let modified = meta.modified().unwrap_or_else(|_| SystemTime::now());
    let created = meta.created().unwrap_or(modified);
    let accessed = meta.accessed().unwrap_or(modified);
    (created, accessed)
}

fn age(now: SystemTime, then: SystemTime) -> Duration {
    now.duration_since(then).unwrap_or_default()
}
