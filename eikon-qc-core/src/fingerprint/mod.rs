//! Layered fingerprints for change detection.
//!
//! A [`CheapFingerprint`] is a stat-only aggregate used to skip deep hashing
//! when nothing plausibly changed. Content hashes are tagged with their
//! algorithm (`"blake3:<hex>"`, `"sha256:<hex>"`), and sequence manifests are
//! hashed with BLAKE2b-256 over `name \0 size \0 hash \n` lines.

pub mod hash_cache;

use std::{
    fs::{self, File},
    io::Read,
    path::{Path, PathBuf},
    time::{SystemTime, UNIX_EPOCH},
};

use blake2::{Blake2b, Digest, digest::consts::U32};
use serde::{Deserialize, Serialize};

use crate::error::{QcError, Result};

pub use hash_cache::{HashCache, HashCacheEntry};

const READ_CHUNK: usize = 4 * 1024 * 1024;

/// Algorithm tag of per-file content hashes produced by this build.
#[cfg(feature = "blake3")]
pub const CONTENT_HASH_ALGORITHM: &str = "blake3";
#[cfg(not(feature = "blake3"))]
pub const CONTENT_HASH_ALGORITHM: &str = "sha256";

/// Algorithm tag of manifest hashes.
pub const MANIFEST_HASH_ALGORITHM: &str = "blake2b";

/// Stat-only aggregate over a set of files. Comparative only.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CheapFingerprint {
    pub files: u64,
    pub bytes: u64,
    pub newest_mtime: i64,
}

/// Size and whole-second mtime of one file.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FileStat {
    pub size: u64,
    pub mtime: i64,
}

pub fn stat(path: &Path) -> Result<FileStat> {
    let md = fs::metadata(path).map_err(|e| QcError::io(path, e))?;
    let mtime = md
        .modified()
        .map(unix_seconds)
        .map_err(|e| QcError::io(path, e))?;
    Ok(FileStat {
        size: md.len(),
        mtime,
    })
}

fn unix_seconds(time: SystemTime) -> i64 {
    match time.duration_since(UNIX_EPOCH) {
        Ok(after) => after.as_secs() as i64,
        Err(before) => -(before.duration().as_secs() as i64),
    }
}

pub fn cheap_fingerprint(paths: &[PathBuf]) -> Result<CheapFingerprint> {
    let mut fp = CheapFingerprint::default();
    for path in paths {
        let st = stat(path)?;
        fp.files += 1;
        fp.bytes += st.size;
        fp.newest_mtime = fp.newest_mtime.max(st.mtime);
    }
    Ok(fp)
}

/// Deep content hash of one file, prefixed with its algorithm tag.
pub fn content_hash(path: &Path) -> Result<String> {
    let mut file = File::open(path).map_err(|e| QcError::io(path, e))?;
    let mut hasher = ContentHasher::new();
    let mut buf = vec![0u8; READ_CHUNK];
    loop {
        let read = file.read(&mut buf).map_err(|e| QcError::io(path, e))?;
        if read == 0 {
            break;
        }
        hasher.update(&buf[..read]);
    }
    Ok(hasher.finish())
}

#[cfg(feature = "blake3")]
struct ContentHasher(blake3::Hasher);

#[cfg(feature = "blake3")]
impl ContentHasher {
    fn new() -> Self {
        Self(blake3::Hasher::new())
    }

    fn update(&mut self, bytes: &[u8]) {
        self.0.update(bytes);
    }

    fn finish(self) -> String {
        format!("{CONTENT_HASH_ALGORITHM}:{}", self.0.finalize().to_hex())
    }
}

#[cfg(not(feature = "blake3"))]
struct ContentHasher(sha2::Sha256);

#[cfg(not(feature = "blake3"))]
impl ContentHasher {
    fn new() -> Self {
        Self(sha2::Sha256::new())
    }

    fn update(&mut self, bytes: &[u8]) {
        sha2::Digest::update(&mut self.0, bytes);
    }

    fn finish(self) -> String {
        format!(
            "{CONTENT_HASH_ALGORITHM}:{}",
            hex::encode(sha2::Digest::finalize(self.0))
        )
    }
}

fn cache_key(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.to_string_lossy().into_owned())
}

/// Content hash reusing `cache` when size, mtime and algorithm all match.
///
/// Two different contents with identical size and mtime (same second) would
/// produce a stale hit; the manifest-level comparison is the backstop.
pub fn content_hash_cached(path: &Path, cache: &mut HashCache) -> Result<String> {
    let st = stat(path)?;
    let key = cache_key(path);

    if let Some(entry) = cache.get(&key)
        && entry.size == st.size
        && entry.mtime == st.mtime
        && let Some(hash) = entry.hash.as_deref()
        && has_current_tag(hash)
    {
        return Ok(hash.to_string());
    }

    let hash = content_hash(path)?;
    cache.insert(
        key,
        HashCacheEntry {
            size: st.size,
            mtime: st.mtime,
            hash: Some(hash.clone()),
        },
    );
    Ok(hash)
}

fn has_current_tag(hash: &str) -> bool {
    hash.split_once(':')
        .is_some_and(|(tag, _)| tag == CONTENT_HASH_ALGORITHM)
}

/// Hash over an ordered file set. The caller owns the ordering; any
/// permutation of the same files yields a different manifest hash.
pub fn manifest_hash(files: &[PathBuf], cache: &mut HashCache) -> Result<String> {
    let mut hasher = Blake2b::<U32>::new();
    for path in files {
        let st = stat(path)?;
        let file_hash = content_hash_cached(path, cache)?;
        let line = format!("{}\0{}\0{}\n", cache_key(path), st.size, file_hash);
        hasher.update(line.as_bytes());
    }
    Ok(format!(
        "{MANIFEST_HASH_ALGORITHM}:{}",
        hex::encode(hasher.finalize())
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::TempDir;

    fn write(dir: &Path, name: &str, bytes: &[u8]) -> PathBuf {
        let path = dir.join(name);
        fs::write(&path, bytes).expect("write fixture");
        path
    }

    fn set_mtime(path: &Path, secs: u64) {
        let file = File::options().write(true).open(path).expect("open");
        file.set_modified(UNIX_EPOCH + Duration::from_secs(secs))
            .expect("set mtime");
    }

    #[test]
    fn cheap_fingerprint_aggregates_stat_data() {
        let dir = TempDir::new().expect("tempdir");
        let a = write(dir.path(), "a.0001.exr", b"abc");
        let b = write(dir.path(), "a.0002.exr", b"defgh");
        set_mtime(&a, 1_000);
        set_mtime(&b, 2_000);

        let fp = cheap_fingerprint(&[a, b]).expect("fingerprint");
        assert_eq!(
            fp,
            CheapFingerprint {
                files: 2,
                bytes: 8,
                newest_mtime: 2_000
            }
        );
    }

    #[test]
    fn content_hash_is_tagged_with_algorithm() {
        let dir = TempDir::new().expect("tempdir");
        let path = write(dir.path(), "clip.mxf", b"payload");

        let hash = content_hash(&path).expect("hash");
        let (tag, hex_digest) = hash.split_once(':').expect("tagged");
        assert_eq!(tag, CONTENT_HASH_ALGORITHM);
        assert_eq!(hex_digest.len(), 64);
    }

    #[test]
    fn missing_file_is_an_io_error() {
        let dir = TempDir::new().expect("tempdir");
        let err = content_hash(&dir.path().join("gone.mov"))
            .expect_err("missing file must fail");
        assert!(matches!(err, QcError::Io { .. }));
    }

    #[test]
    fn cache_hit_requires_matching_size_and_mtime() {
        let dir = TempDir::new().expect("tempdir");
        let path = write(dir.path(), "a.0001.dpx", b"one");
        set_mtime(&path, 5_000);

        let mut cache = HashCache::new();
        let first = content_hash_cached(&path, &mut cache).expect("hash");

        // Poison the cached hash; a hit must return it verbatim.
        let poisoned = format!("{CONTENT_HASH_ALGORITHM}:cached");
        cache.insert(
            "a.0001.dpx",
            HashCacheEntry {
                size: 3,
                mtime: 5_000,
                hash: Some(poisoned.clone()),
            },
        );
        assert_eq!(
            content_hash_cached(&path, &mut cache).expect("hash"),
            poisoned
        );

        // Bumping the mtime invalidates the entry and rewrites it.
        set_mtime(&path, 5_001);
        let fresh = content_hash_cached(&path, &mut cache).expect("hash");
        assert_eq!(fresh, first);
        assert_eq!(cache.get("a.0001.dpx").map(|e| e.mtime), Some(5_001));
    }

    #[test]
    fn cache_entry_from_other_algorithm_is_ignored() {
        let dir = TempDir::new().expect("tempdir");
        let path = write(dir.path(), "a.0001.dpx", b"one");
        set_mtime(&path, 5_000);

        let mut cache = HashCache::new();
        cache.insert(
            "a.0001.dpx",
            HashCacheEntry {
                size: 3,
                mtime: 5_000,
                hash: Some("md5:deadbeef".to_string()),
            },
        );

        let hash = content_hash_cached(&path, &mut cache).expect("hash");
        assert!(hash.starts_with(CONTENT_HASH_ALGORITHM));
    }

    #[test]
    fn manifest_hash_is_deterministic_and_order_sensitive() {
        let dir = TempDir::new().expect("tempdir");
        let a = write(dir.path(), "s.0001.exr", b"frame-1");
        let b = write(dir.path(), "s.0002.exr", b"frame-2");

        let mut cache = HashCache::new();
        let forward = vec![a.clone(), b.clone()];
        let first = manifest_hash(&forward, &mut cache).expect("manifest");
        let second = manifest_hash(&forward, &mut cache).expect("manifest");
        assert_eq!(first, second);
        assert!(first.starts_with("blake2b:"));

        let reversed = manifest_hash(&[b, a], &mut cache).expect("manifest");
        assert_ne!(first, reversed);
    }
}
