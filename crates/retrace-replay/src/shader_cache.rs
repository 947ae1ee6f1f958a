//! Content-addressed cache of compiled shader and pipeline binaries.
//!
//! Two layers: a per-process LRU of binaries, and an optional persistent directory shared
//! across runs:
//!
//! ```text
//! <root>/index.json          size and last-used stamp per entry
//! <root>/<hh>/<hash>.bin     "RTSC" | version u32 | len u64 | blake3(blob) | blob
//! ```
//!
//! The persistent layer is best-effort. A corrupt entry is deleted and reported as a miss; any
//! other I/O failure disables persistence for the rest of the process. Replay never fails
//! because of the cache.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::fs;
use std::io::{self, Write};
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use lru::LruCache;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::ShaderCacheConfig;

/// Bump when the key derivation or blob layout changes; old entries then stop matching.
pub const CACHE_FORMAT_VERSION: u32 = 1;

const KEY_DOMAIN: &[u8] = b"retrace shader cache key v1";
const BLOB_MAGIC: [u8; 4] = *b"RTSC";
const BLOB_HEADER_SIZE: usize = 4 + 4 + 8 + 32;
const INDEX_FILE: &str = "index.json";

#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContentHash(pub [u8; 32]);

impl ContentHash {
    pub fn of_bytecode(bytecode: &[u8]) -> Self {
        let mut hasher = blake3::Hasher::new();
        hasher.update(KEY_DOMAIN);
        hasher.update(&CACHE_FORMAT_VERSION.to_le_bytes());
        hasher.update(bytecode);
        ContentHash(*hasher.finalize().as_bytes())
    }

    pub fn to_hex(&self) -> String {
        blake3::Hash::from(self.0).to_hex().to_string()
    }

    pub fn from_hex(hex: &str) -> Option<Self> {
        blake3::Hash::from_hex(hex)
            .ok()
            .map(|hash| ContentHash(*hash.as_bytes()))
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContentHash({})", self.to_hex())
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct ShaderCacheStats {
    pub memory_hits: u64,
    pub persistent_hits: u64,
    pub misses: u64,
    pub stores: u64,
    pub evictions: u64,
    pub corrupt_entries: u64,
    pub persistent_disabled: bool,
}

#[derive(Default)]
struct Counters {
    memory_hits: AtomicU64,
    persistent_hits: AtomicU64,
    misses: AtomicU64,
    stores: AtomicU64,
    evictions: AtomicU64,
    corrupt_entries: AtomicU64,
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
struct IndexEntry {
    size: u64,
    last_used: u64,
}

#[derive(Debug, Serialize, Deserialize)]
struct IndexFile {
    version: u32,
    entries: BTreeMap<String, IndexEntry>,
}

struct DiskStore {
    root: PathBuf,
    entries: HashMap<ContentHash, IndexEntry>,
    /// `entries` ordered oldest first by last-used stamp.
    by_age: BTreeSet<(u64, ContentHash)>,
    total_bytes: u64,
    /// Logical clock for last-used stamps; persisted implicitly as the largest stamp.
    clock: u64,
    dirty: bool,
}

impl DiskStore {
    fn open(root: &Path) -> io::Result<Self> {
        fs::create_dir_all(root)?;
        let entries = match read_index(root)? {
            Some(entries) => entries,
            None => scan_blobs(root)?,
        };
        let total_bytes = entries.values().map(|e| e.size).sum();
        let by_age = entries
            .iter()
            .map(|(hash, entry)| (entry.last_used, *hash))
            .collect();
        let clock = entries.values().map(|e| e.last_used).max().unwrap_or(0);
        debug!(root = %root.display(), entries = entries.len(), total_bytes, "opened shader cache");
        Ok(Self {
            root: root.to_path_buf(),
            entries,
            by_age,
            total_bytes,
            clock,
            dirty: false,
        })
    }

    fn blob_path(&self, hash: &ContentHash) -> PathBuf {
        blob_path(&self.root, hash)
    }

    fn touch(&mut self, hash: &ContentHash) {
        if let Some(entry) = self.entries.get_mut(hash) {
            self.by_age.remove(&(entry.last_used, *hash));
            self.clock += 1;
            entry.last_used = self.clock;
            self.by_age.insert((self.clock, *hash));
            self.dirty = true;
        }
    }

    fn forget(&mut self, hash: &ContentHash) {
        if let Some(entry) = self.entries.remove(hash) {
            self.by_age.remove(&(entry.last_used, *hash));
            self.total_bytes = self.total_bytes.saturating_sub(entry.size);
            self.dirty = true;
        }
    }

    fn insert(&mut self, hash: ContentHash, size: u64) {
        self.forget(&hash);
        self.clock += 1;
        self.entries.insert(
            hash,
            IndexEntry {
                size,
                last_used: self.clock,
            },
        );
        self.by_age.insert((self.clock, hash));
        self.total_bytes += size;
        self.dirty = true;
    }

    /// Removes least-recently-used entries until both limits hold. Returns how many went.
    fn evict(&mut self, max_entries: usize, max_bytes: u64) -> io::Result<u64> {
        let mut evicted = 0;
        while self.entries.len() > max_entries || self.total_bytes > max_bytes {
            let Some(&(_, victim)) = self.by_age.first() else {
                break;
            };
            remove_if_exists(&self.blob_path(&victim))?;
            self.forget(&victim);
            evicted += 1;
        }
        Ok(evicted)
    }

    fn save_index(&mut self) -> io::Result<()> {
        if !self.dirty {
            return Ok(());
        }
        let index = IndexFile {
            version: CACHE_FORMAT_VERSION,
            entries: self
                .entries
                .iter()
                .map(|(hash, entry)| (hash.to_hex(), *entry))
                .collect(),
        };
        let json = serde_json::to_vec_pretty(&index).map_err(io::Error::other)?;
        write_atomic(&self.root.join(INDEX_FILE), &json)?;
        self.dirty = false;
        Ok(())
    }
}

enum PersistentState {
    Uninitialized,
    Ready(DiskStore),
    Disabled,
}

pub struct ShaderCache {
    config: ShaderCacheConfig,
    memory: Option<Mutex<LruCache<ContentHash, Arc<[u8]>>>>,
    persistent: Mutex<PersistentState>,
    persistent_disabled: AtomicBool,
    counters: Counters,
}

impl ShaderCache {
    /// Creates the cache. The persistent directory is opened lazily on first use.
    pub fn new(config: ShaderCacheConfig) -> Self {
        let memory = NonZeroUsize::new(config.memory_entries)
            .filter(|_| config.enabled)
            .map(|cap| Mutex::new(LruCache::new(cap)));
        let persistent = if config.enabled && config.root.is_some() {
            PersistentState::Uninitialized
        } else {
            PersistentState::Disabled
        };
        Self {
            config,
            memory,
            persistent: Mutex::new(persistent),
            persistent_disabled: AtomicBool::new(false),
            counters: Counters::default(),
        }
    }

    pub fn disabled() -> Self {
        Self::new(ShaderCacheConfig::disabled())
    }

    pub fn config(&self) -> &ShaderCacheConfig {
        &self.config
    }

    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    pub fn stats(&self) -> ShaderCacheStats {
        let c = &self.counters;
        ShaderCacheStats {
            memory_hits: c.memory_hits.load(Ordering::Relaxed),
            persistent_hits: c.persistent_hits.load(Ordering::Relaxed),
            misses: c.misses.load(Ordering::Relaxed),
            stores: c.stores.load(Ordering::Relaxed),
            evictions: c.evictions.load(Ordering::Relaxed),
            corrupt_entries: c.corrupt_entries.load(Ordering::Relaxed),
            persistent_disabled: self.persistent_disabled.load(Ordering::Relaxed),
        }
    }

    /// Returns the cached binary for `hash`, refreshing its recency on a hit.
    pub fn lookup(&self, hash: &ContentHash) -> Option<Arc<[u8]>> {
        if !self.config.enabled {
            bump(&self.counters.misses);
            return None;
        }

        if let Some(memory) = &self.memory {
            if let Some(hit) = lock(memory).get(hash).cloned() {
                bump(&self.counters.memory_hits);
                self.with_store(|store| {
                    store.touch(hash);
                    Ok(())
                });
                return Some(hit);
            }
        }

        // Read the blob without holding the lock; concurrent lookups of other keys proceed.
        let path = self.with_store(|store| {
            Ok(store
                .entries
                .contains_key(hash)
                .then(|| store.blob_path(hash)))
        });
        let Some(path) = path.flatten() else {
            bump(&self.counters.misses);
            return None;
        };

        match read_blob(&path) {
            Ok(blob) => {
                let blob: Arc<[u8]> = blob.into();
                self.with_store(|store| {
                    store.touch(hash);
                    Ok(())
                });
                if let Some(memory) = &self.memory {
                    lock(memory).put(*hash, Arc::clone(&blob));
                }
                bump(&self.counters.persistent_hits);
                Some(blob)
            }
            Err(BlobError::Corrupt(reason)) => {
                warn!(%hash, path = %path.display(), reason, "discarding corrupt shader cache entry");
                bump(&self.counters.corrupt_entries);
                bump(&self.counters.misses);
                self.with_store(|store| {
                    store.forget(hash);
                    remove_if_exists(&path)
                });
                None
            }
            Err(BlobError::Io(err)) if err.kind() == io::ErrorKind::NotFound => {
                // Removed behind our back (another process evicted it).
                bump(&self.counters.misses);
                self.with_store(|store| {
                    store.forget(hash);
                    Ok(())
                });
                None
            }
            Err(BlobError::Io(err)) => {
                bump(&self.counters.misses);
                self.disable_persistent(&err);
                None
            }
        }
    }

    /// Stores `binary` under `hash`. Concurrent stores of one key are last-writer-wins.
    pub fn store(&self, hash: &ContentHash, binary: &[u8]) {
        if !self.config.enabled {
            return;
        }
        if let Some(memory) = &self.memory {
            lock(memory).put(*hash, Arc::from(binary));
        }
        bump(&self.counters.stores);

        // The blob is written and synced before the index lock is taken; only the bookkeeping
        // runs under it.
        let Some(root) = self.with_store(|store| Ok(store.root.clone())) else {
            return;
        };
        if let Err(err) = write_atomic(&blob_path(&root, hash), &encode_blob(binary)) {
            self.disable_persistent(&err);
            return;
        }

        let (max_entries, max_bytes) = (self.config.max_entries, self.config.max_bytes);
        let evicted = self.with_store(|store| {
            store.insert(*hash, (BLOB_HEADER_SIZE + binary.len()) as u64);
            let evicted = store.evict(max_entries, max_bytes)?;
            store.save_index()?;
            Ok(evicted)
        });
        if let Some(evicted @ 1..) = evicted {
            debug!(evicted, "evicted shader cache entries");
            self.counters.evictions.fetch_add(evicted, Ordering::Relaxed);
        }
    }

    /// Marks `hash` as recently used without reading it.
    pub fn touch(&self, hash: &ContentHash) {
        if !self.config.enabled {
            return;
        }
        if let Some(memory) = &self.memory {
            lock(memory).promote(hash);
        }
        self.with_store(|store| {
            store.touch(hash);
            Ok(())
        });
    }

    /// Writes pending last-used stamps to the index.
    pub fn flush(&self) {
        self.with_store(|store| store.save_index());
    }

    pub fn is_persistent_disabled(&self) -> bool {
        self.persistent_disabled.load(Ordering::Relaxed)
    }

    /// Runs `f` against the persistent store, opening it on first use. Returns `None` when
    /// persistence is off; an I/O error from `f` turns it off.
    fn with_store<T>(&self, f: impl FnOnce(&mut DiskStore) -> io::Result<T>) -> Option<T> {
        let mut state = lock(&self.persistent);
        if let PersistentState::Uninitialized = *state {
            let root = self.config.root.as_deref()?;
            match DiskStore::open(root) {
                Ok(store) => *state = PersistentState::Ready(store),
                Err(err) => {
                    *state = PersistentState::Disabled;
                    drop(state);
                    self.disable_persistent(&err);
                    return None;
                }
            }
        }
        let PersistentState::Ready(store) = &mut *state else {
            return None;
        };
        match f(store) {
            Ok(value) => Some(value),
            Err(err) => {
                *state = PersistentState::Disabled;
                drop(state);
                self.disable_persistent(&err);
                None
            }
        }
    }

    fn disable_persistent(&self, err: &io::Error) {
        *lock(&self.persistent) = PersistentState::Disabled;
        if !self.persistent_disabled.swap(true, Ordering::Relaxed) {
            warn!(
                root = ?self.config.root,
                "shader cache persistence disabled for this process: {err}"
            );
        }
    }
}

impl Drop for ShaderCache {
    fn drop(&mut self) {
        self.flush();
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn blob_path(root: &Path, hash: &ContentHash) -> PathBuf {
    let hex = hash.to_hex();
    root.join(&hex[..2]).join(format!("{hex}.bin"))
}

fn encode_blob(binary: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(BLOB_HEADER_SIZE + binary.len());
    out.extend_from_slice(&BLOB_MAGIC);
    out.extend_from_slice(&CACHE_FORMAT_VERSION.to_le_bytes());
    out.extend_from_slice(&(binary.len() as u64).to_le_bytes());
    out.extend_from_slice(blake3::hash(binary).as_bytes());
    out.extend_from_slice(binary);
    out
}

enum BlobError {
    Io(io::Error),
    Corrupt(&'static str),
}

fn read_blob(path: &Path) -> Result<Vec<u8>, BlobError> {
    let bytes = fs::read(path).map_err(BlobError::Io)?;
    if bytes.len() < BLOB_HEADER_SIZE {
        return Err(BlobError::Corrupt("shorter than the blob header"));
    }
    let (header, body) = bytes.split_at(BLOB_HEADER_SIZE);
    if header[..4] != BLOB_MAGIC {
        return Err(BlobError::Corrupt("bad magic"));
    }
    let mut version = [0u8; 4];
    version.copy_from_slice(&header[4..8]);
    if u32::from_le_bytes(version) != CACHE_FORMAT_VERSION {
        return Err(BlobError::Corrupt("unsupported cache format version"));
    }
    let mut len = [0u8; 8];
    len.copy_from_slice(&header[8..16]);
    if u64::from_le_bytes(len) != body.len() as u64 {
        return Err(BlobError::Corrupt("length mismatch"));
    }
    if blake3::hash(body).as_bytes() != &header[16..48] {
        return Err(BlobError::Corrupt("checksum mismatch"));
    }
    Ok(body.to_vec())
}

/// Writes through a uniquely named temporary file and renames it into place.
fn write_atomic(path: &Path, bytes: &[u8]) -> io::Result<()> {
    static TMP_COUNTER: AtomicU64 = AtomicU64::new(0);

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let tmp = path.with_extension(format!(
        "tmp.{}.{}",
        std::process::id(),
        TMP_COUNTER.fetch_add(1, Ordering::Relaxed)
    ));
    let result = (|| {
        let mut file = fs::File::create(&tmp)?;
        file.write_all(bytes)?;
        file.sync_all()?;
        fs::rename(&tmp, path)
    })();
    if result.is_err() {
        let _ = fs::remove_file(&tmp);
    }
    result
}

fn remove_if_exists(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Err(err) if err.kind() != io::ErrorKind::NotFound => Err(err),
        _ => Ok(()),
    }
}

/// Loads `index.json`. Returns `None` when it is missing, unreadable as JSON or from another
/// format version, in which case the caller rebuilds it from the blobs on disk.
fn read_index(root: &Path) -> io::Result<Option<HashMap<ContentHash, IndexEntry>>> {
    let bytes = match fs::read(root.join(INDEX_FILE)) {
        Ok(bytes) => bytes,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(err),
    };
    let index: IndexFile = match serde_json::from_slice(&bytes) {
        Ok(index) => index,
        Err(err) => {
            warn!(root = %root.display(), "rebuilding unreadable shader cache index: {err}");
            return Ok(None);
        }
    };
    if index.version != CACHE_FORMAT_VERSION {
        return Ok(None);
    }
    Ok(Some(
        index
            .entries
            .into_iter()
            .filter_map(|(hex, entry)| ContentHash::from_hex(&hex).map(|hash| (hash, entry)))
            .collect(),
    ))
}

fn scan_blobs(root: &Path) -> io::Result<HashMap<ContentHash, IndexEntry>> {
    let mut entries = HashMap::new();
    for shard in fs::read_dir(root)? {
        let shard = shard?;
        if !shard.file_type()?.is_dir() {
            continue;
        }
        for blob in fs::read_dir(shard.path())? {
            let blob = blob?;
            let path = blob.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some("bin") {
                continue;
            }
            let Some(hash) = path
                .file_stem()
                .and_then(|stem| stem.to_str())
                .and_then(ContentHash::from_hex)
            else {
                continue;
            };
            entries.insert(
                hash,
                IndexEntry {
                    size: blob.metadata()?.len(),
                    last_used: 0,
                },
            );
        }
    }
    Ok(entries)
}
