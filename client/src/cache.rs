//! On-disk copy of the last server list that was fetched successfully.

use crate::discovery::ListServerEntry;
use crate::error::CacheError;
use bincode::{deserialize, serialize};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io;
use std::path::Path;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

const CACHE_FORMAT: u32 = 1;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedServer {
    pub entry: ListServerEntry,
    /// Seconds since the Unix epoch.
    pub saved_at: u64,
}

#[derive(Debug, Serialize, Deserialize)]
struct CacheFile {
    format: u32,
    servers: Vec<CachedServer>,
}

fn unix_seconds(time: SystemTime) -> u64 {
    time.duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[derive(Debug, Default)]
pub struct ServerListCache {
    servers: BTreeMap<String, CachedServer>,
    max_age: Duration,
}

impl ServerListCache {
    pub fn new(max_age: Duration) -> Self {
        Self {
            servers: BTreeMap::new(),
            max_age,
        }
    }

    pub fn len(&self) -> usize {
        self.servers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.servers.is_empty()
    }

    /// Records freshly fetched servers, replacing older copies of the same
    /// server.
    pub fn update(&mut self, entries: &[ListServerEntry], now: SystemTime) {
        let saved_at = unix_seconds(now);
        for entry in entries {
            self.servers.insert(
                entry.key(),
                CachedServer {
                    entry: entry.clone(),
                    saved_at,
                },
            );
        }
    }

    /// Servers saved less than the maximum age ago. A zero maximum age
    /// disables the cache.
    pub fn fresh_entries(&self, now: SystemTime) -> Vec<ListServerEntry> {
        if self.max_age.is_zero() {
            return Vec::new();
        }
        let now = unix_seconds(now);
        self.servers
            .values()
            .filter(|cached| now.saturating_sub(cached.saved_at) < self.max_age.as_secs())
            .map(|cached| cached.entry.clone())
            .collect()
    }

    pub fn encode(&self) -> Result<Vec<u8>, CacheError> {
        let file = CacheFile {
            format: CACHE_FORMAT,
            servers: self.servers.values().cloned().collect(),
        };
        Ok(serialize(&file)?)
    }

    pub fn decode(bytes: &[u8], max_age: Duration) -> Result<Self, CacheError> {
        let file: CacheFile = deserialize(bytes)?;
        if file.format != CACHE_FORMAT {
            return Err(CacheError::UnsupportedVersion(file.format));
        }
        let mut cache = Self::new(max_age);
        for cached in file.servers {
            cache.servers.insert(cached.entry.key(), cached);
        }
        Ok(cache)
    }

    /// A missing file is an empty cache.
    pub fn load(path: &Path, max_age: Duration) -> Result<Self, CacheError> {
        match std::fs::read(path) {
            Ok(bytes) => Self::decode(&bytes, max_age),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(Self::new(max_age)),
            Err(e) => Err(e.into()),
        }
    }

    pub fn save(&self, path: &Path) -> Result<(), CacheError> {
        std::fs::write(path, self.encode()?)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DAY: Duration = Duration::from_secs(24 * 60 * 60);

    fn test_entry(name: &str) -> ListServerEntry {
        ListServerEntry {
            name: name.to_string(),
            port: 5155,
            version: "BZFS0221".to_string(),
            game_info: String::new(),
            address: None,
            title: format!("{} arena", name),
        }
    }

    fn temp_path(tag: &str) -> std::path::PathBuf {
        std::env::temp_dir().join(format!("tanknet-cache-{}-{}.bin", tag, std::process::id()))
    }

    #[test]
    fn test_fresh_entries_respect_age() {
        let start = UNIX_EPOCH + Duration::from_secs(1_000_000);
        let mut cache = ServerListCache::new(DAY);
        cache.update(&[test_entry("old")], start);
        cache.update(&[test_entry("new")], start + DAY);

        let fresh = cache.fresh_entries(start + DAY + Duration::from_secs(1));
        assert_eq!(fresh, vec![test_entry("new")]);
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn test_zero_age_disables_fallback() {
        let mut cache = ServerListCache::new(Duration::ZERO);
        let now = SystemTime::now();
        cache.update(&[test_entry("a")], now);
        assert!(cache.fresh_entries(now).is_empty());
    }

    #[test]
    fn test_save_and_load() {
        let path = temp_path("roundtrip");
        let now = SystemTime::now();
        let mut cache = ServerListCache::new(DAY);
        cache.update(&[test_entry("a"), test_entry("b")], now);
        cache.save(&path).unwrap();

        let loaded = ServerListCache::load(&path, DAY).unwrap();
        assert_eq!(loaded.fresh_entries(now), vec![test_entry("a"), test_entry("b")]);
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn test_missing_file_is_empty() {
        let cache = ServerListCache::load(&temp_path("missing"), DAY).unwrap();
        assert!(cache.is_empty());
    }

    #[test]
    fn test_rejects_other_formats() {
        let file = CacheFile {
            format: CACHE_FORMAT + 1,
            servers: Vec::new(),
        };
        let bytes = serialize(&file).unwrap();
        assert!(matches!(
            ServerListCache::decode(&bytes, DAY),
            Err(CacheError::UnsupportedVersion(2))
        ));
        assert!(matches!(
            ServerListCache::decode(&[1, 2], DAY),
            Err(CacheError::Encoding(_))
        ));
    }
}
