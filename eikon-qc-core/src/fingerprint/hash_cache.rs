use std::{
    collections::BTreeMap,
    fs,
    io::Write,
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;
use uuid::Uuid;

/// Cached content hash for one file, valid while size and mtime hold.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HashCacheEntry {
    pub size: u64,
    /// Modification time in whole seconds since the epoch.
    pub mtime: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hash: Option<String>,
}

/// Per-directory map of file name to cached content hash.
///
/// Purely an optimisation: loading never fails and saving is best-effort,
/// so deleting the file only costs a rehash.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct HashCache {
    entries: BTreeMap<String, HashCacheEntry>,
}

impl HashCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load `<dir>/<name>`. Missing files, malformed JSON and malformed
    /// individual entries all degrade to "not cached".
    pub fn load(dir: &Path, name: &str) -> Self {
        let path = dir.join(name);
        let raw = match fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(err) => {
                if err.kind() != std::io::ErrorKind::NotFound {
                    debug!("hash cache {:?} unreadable: {}", path, err);
                }
                return Self::default();
            }
        };

        let map: BTreeMap<String, Value> = match serde_json::from_str(&raw) {
            Ok(map) => map,
            Err(err) => {
                debug!("hash cache {:?} is not valid JSON: {}", path, err);
                return Self::default();
            }
        };

        let entries = map
            .into_iter()
            .filter_map(|(file, value)| {
                serde_json::from_value::<HashCacheEntry>(value)
                    .ok()
                    .map(|entry| (file, entry))
            })
            .collect();
        Self { entries }
    }

    /// Persist atomically (tmp + rename). Failures are logged and dropped.
    pub fn save(&self, dir: &Path, name: &str) {
        let path = dir.join(name);
        if let Err(err) = self.try_save(&path) {
            debug!("hash cache save to {:?} abandoned: {}", path, err);
        }
    }

    fn try_save(&self, path: &Path) -> std::io::Result<()> {
        let body = serde_json::to_string_pretty(&self.entries)?;
        let tmp = tmp_sibling(path);

        let result = (|| {
            let mut file = fs::File::create(&tmp)?;
            file.write_all(body.as_bytes())?;
            file.sync_all()?;
            drop(file);
            fs::rename(&tmp, path)
        })();

        if result.is_err() {
            let _ = fs::remove_file(&tmp);
        }
        result
    }

    pub fn get(&self, file_name: &str) -> Option<&HashCacheEntry> {
        self.entries.get(file_name)
    }

    pub fn insert(&mut self, file_name: impl Into<String>, entry: HashCacheEntry) {
        self.entries.insert(file_name.into(), entry);
    }

    /// Drop entries selected by `predicate`, returning how many went.
    pub fn prune<F>(&mut self, mut predicate: F) -> usize
    where
        F: FnMut(&str) -> bool,
    {
        let before = self.entries.len();
        self.entries.retain(|name, _| !predicate(name));
        before - self.entries.len()
    }

    /// Stored hash per file name, for names accepted by `filter`.
    pub fn hashes_where<F>(&self, mut filter: F) -> BTreeMap<String, String>
    where
        F: FnMut(&str) -> bool,
    {
        self.entries
            .iter()
            .filter(|(name, _)| filter(name))
            .filter_map(|(name, entry)| {
                entry.hash.clone().map(|hash| (name.clone(), hash))
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Temporary path in the same directory, so the final rename stays atomic.
pub(crate) fn tmp_sibling(path: &Path) -> PathBuf {
    let file_name = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    path.with_file_name(format!("{file_name}.tmp-{}", Uuid::new_v4().simple()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const NAME: &str = ".qc.hashcache.json";

    fn entry(hash: &str) -> HashCacheEntry {
        HashCacheEntry {
            size: 5,
            mtime: 1_700_000_000,
            hash: Some(hash.to_string()),
        }
    }

    #[test]
    fn missing_cache_loads_empty() {
        let dir = TempDir::new().expect("tempdir");
        assert!(HashCache::load(dir.path(), NAME).is_empty());
    }

    #[test]
    fn invalid_json_loads_empty() {
        let dir = TempDir::new().expect("tempdir");
        fs::write(dir.path().join(NAME), "{this is not valid json")
            .expect("write");
        assert!(HashCache::load(dir.path(), NAME).is_empty());
    }

    #[test]
    fn junk_entries_are_dropped_but_valid_ones_survive() {
        let dir = TempDir::new().expect("tempdir");
        fs::write(
            dir.path().join(NAME),
            r#"{
                "a.0001.exr": {"size": 5, "mtime": 1700000000, "hash": "blake3:aa"},
                "junk_field": ["unexpected", 123]
            }"#,
        )
        .expect("write");

        let cache = HashCache::load(dir.path(), NAME);
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.get("a.0001.exr"), Some(&entry("blake3:aa")));
    }

    #[test]
    fn save_then_load_preserves_entries_and_leaves_no_tmp() {
        let dir = TempDir::new().expect("tempdir");
        let mut cache = HashCache::new();
        cache.insert("f1.exr", entry("blake3:1111"));
        cache.insert("f2.exr", entry("blake3:2222"));

        cache.save(dir.path(), NAME);

        assert_eq!(HashCache::load(dir.path(), NAME), cache);
        let leftovers: Vec<_> = fs::read_dir(dir.path())
            .expect("read_dir")
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().contains(".tmp-"))
            .collect();
        assert!(leftovers.is_empty(), "temp file left behind");
    }

    #[test]
    fn prune_and_filtered_hashes() {
        let mut cache = HashCache::new();
        cache.insert("shot.0001.exr", entry("blake3:1"));
        cache.insert("shot.0002.exr", entry("blake3:2"));
        cache.insert("other.mov", entry("blake3:3"));

        let shots = cache.hashes_where(|name| name.starts_with("shot."));
        assert_eq!(shots.len(), 2);

        let removed = cache.prune(|name| name == "shot.0002.exr");
        assert_eq!(removed, 1);
        assert!(cache.get("shot.0002.exr").is_none());
        assert_eq!(cache.len(), 2);
    }
}
