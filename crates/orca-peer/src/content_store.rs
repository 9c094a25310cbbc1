//! Two-tier content store
//!
//! Blobs live in a bounded drive tier (one read-only file per key) and are
//! cached in a bounded memory tier. When a tier is full the largest resident
//! item is evicted, repeatedly, until the new item fits. The memory tier only
//! ever caches items present on the drive tier.

use orca_core::{ContentKey, Error, Result};
use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

/// Capacity of each tier, in bytes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreLimits {
    pub memory_cap: usize,
    pub drive_cap: usize,
}

impl Default for StoreLimits {
    fn default() -> Self {
        Self {
            memory_cap: 4_000,
            drive_cap: 1_000_000,
        }
    }
}

/// Sizes of resident items, ordered so the largest is found in log time
#[derive(Debug)]
struct SizeIndex {
    capacity: usize,
    used: usize,
    sizes: HashMap<ContentKey, usize>,
    by_size: BTreeSet<(usize, ContentKey)>,
}

impl SizeIndex {
    fn new(capacity: usize) -> Self {
        Self {
            capacity,
            used: 0,
            sizes: HashMap::new(),
            by_size: BTreeSet::new(),
        }
    }

    fn contains(&self, key: &ContentKey) -> bool {
        self.sizes.contains_key(key)
    }

    fn insert(&mut self, key: ContentKey, size: usize) {
        if self.sizes.insert(key, size).is_none() {
            self.by_size.insert((size, key));
            self.used += size;
        }
    }

    fn remove(&mut self, key: &ContentKey) -> Option<usize> {
        let size = self.sizes.remove(key)?;
        self.by_size.remove(&(size, *key));
        self.used -= size;
        Some(size)
    }

    fn largest(&self) -> Option<ContentKey> {
        self.by_size.iter().next_back().map(|(_, key)| *key)
    }

    fn fits(&self, size: usize) -> bool {
        self.used + size <= self.capacity
    }
}

struct MemoryTier {
    index: SizeIndex,
    blobs: HashMap<ContentKey, Vec<u8>>,
}

struct DriveTier {
    dir: PathBuf,
    index: SizeIndex,
}

struct Tiers {
    memory: MemoryTier,
    drive: DriveTier,
}

/// Content-addressed blob store
pub struct ContentStore {
    tiers: Mutex<Tiers>,
}

impl ContentStore {
    /// Open the store rooted at `dir`, rebuilding the drive index from disk
    pub fn open(dir: &Path, limits: StoreLimits) -> Result<Self> {
        std::fs::create_dir_all(dir)?;

        let mut drive = DriveTier {
            dir: dir.to_path_buf(),
            index: SizeIndex::new(limits.drive_cap),
        };

        for entry in std::fs::read_dir(dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            let name = entry.file_name();
            let Ok(key) = name.to_string_lossy().parse::<ContentKey>() else {
                continue;
            };
            let size = entry.metadata()?.len() as usize;
            drive.index.insert(key, size);
        }

        // A smaller cap than last time: shed the largest items
        while drive.index.used > drive.index.capacity {
            match drive.index.largest() {
                Some(key) => drive.evict(&key)?,
                None => break,
            }
        }

        tracing::info!(
            "Opened content store at {} ({} items, {} bytes)",
            dir.display(),
            drive.index.sizes.len(),
            drive.index.used
        );

        Ok(Self {
            tiers: Mutex::new(Tiers {
                memory: MemoryTier {
                    index: SizeIndex::new(limits.memory_cap),
                    blobs: HashMap::new(),
                },
                drive,
            }),
        })
    }

    fn tiers(&self) -> MutexGuard<'_, Tiers> {
        self.tiers.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Store a blob in both tiers, returning its key
    ///
    /// Storing bytes that are already present returns the same key without
    /// touching the drive.
    pub fn put(&self, bytes: &[u8]) -> Result<ContentKey> {
        let key = ContentKey::of(bytes);
        let mut tiers = self.tiers();
        tiers.drive_put(key, bytes)?;
        tiers.buffer_put(key, bytes);
        Ok(key)
    }

    /// Store a blob on the drive tier only
    pub fn drive_put(&self, bytes: &[u8]) -> Result<ContentKey> {
        let key = ContentKey::of(bytes);
        self.tiers().drive_put(key, bytes)?;
        Ok(key)
    }

    /// Cache a blob in the memory tier
    ///
    /// The blob must already be on the drive tier; items larger than the whole
    /// memory tier are not cached.
    pub fn buffer_put(&self, bytes: &[u8]) -> Result<ContentKey> {
        let key = ContentKey::of(bytes);
        let mut tiers = self.tiers();
        if !tiers.drive.index.contains(&key) {
            return Err(Error::NotFound(format!("{} is not on the drive tier", key)));
        }
        tiers.buffer_put(key, bytes);
        Ok(key)
    }

    /// Fetch a blob, backfilling the memory tier on a drive hit
    pub fn get(&self, key: &ContentKey) -> Result<Vec<u8>> {
        let mut tiers = self.tiers();

        if let Some(bytes) = tiers.memory.blobs.get(key) {
            tracing::debug!("Memory hit for {}", key);
            return Ok(bytes.clone());
        }

        if !tiers.drive.index.contains(key) {
            return Err(Error::NotFound(key.to_hex()));
        }

        let bytes = match std::fs::read(tiers.drive.path_for(key)) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::warn!("{} vanished from the drive, dropping it from the index", key);
                tiers.drive.index.remove(key);
                return Err(Error::NotFound(key.to_hex()));
            }
            Err(e) => return Err(e.into()),
        };
        tiers.buffer_put(*key, &bytes);
        Ok(bytes)
    }

    /// Largest blob the drive tier can ever hold
    pub fn drive_capacity(&self) -> usize {
        self.tiers().drive.index.capacity
    }

    pub fn contains(&self, key: &ContentKey) -> bool {
        self.tiers().drive.index.contains(key)
    }

    /// Size of a stored blob
    pub fn size_of(&self, key: &ContentKey) -> Option<usize> {
        self.tiers().drive.index.sizes.get(key).copied()
    }

    /// Keys and sizes of everything on the drive tier
    pub fn list(&self) -> Vec<(ContentKey, usize)> {
        let tiers = self.tiers();
        let mut items: Vec<_> = tiers
            .drive
            .index
            .sizes
            .iter()
            .map(|(k, s)| (*k, *s))
            .collect();
        items.sort();
        items
    }

    /// Bytes held in the memory tier
    pub fn memory_used(&self) -> usize {
        self.tiers().memory.index.used
    }

    /// Bytes held on the drive tier
    pub fn drive_used(&self) -> usize {
        self.tiers().drive.index.used
    }

    /// Whether a key is currently cached in memory
    pub fn is_cached(&self, key: &ContentKey) -> bool {
        self.tiers().memory.index.contains(key)
    }
}

impl Tiers {
    fn drive_put(&mut self, key: ContentKey, bytes: &[u8]) -> Result<()> {
        if self.drive.index.contains(&key) {
            return Ok(());
        }

        let size = bytes.len();
        if size > self.drive.index.capacity {
            return Err(Error::TooLarge {
                tier: "drive",
                size,
                capacity: self.drive.index.capacity,
            });
        }

        while !self.drive.index.fits(size) {
            let Some(victim) = self.drive.index.largest() else {
                break;
            };
            self.drive.evict(&victim)?;
            // Memory only caches drive items
            self.memory.evict(&victim);
        }

        self.drive.write(&key, bytes)?;
        self.drive.index.insert(key, size);
        tracing::debug!("Stored {} on drive ({} bytes)", key, size);
        Ok(())
    }

    fn buffer_put(&mut self, key: ContentKey, bytes: &[u8]) {
        if self.memory.index.contains(&key) {
            return;
        }

        let size = bytes.len();
        if size > self.memory.index.capacity {
            tracing::debug!("{} ({} bytes) too large to cache", key, size);
            return;
        }

        while !self.memory.index.fits(size) {
            let Some(victim) = self.memory.index.largest() else {
                break;
            };
            self.memory.evict(&victim);
        }

        self.memory.blobs.insert(key, bytes.to_vec());
        self.memory.index.insert(key, size);
    }
}

impl MemoryTier {
    fn evict(&mut self, key: &ContentKey) {
        if self.index.remove(key).is_some() {
            self.blobs.remove(key);
            tracing::debug!("Evicted {} from memory", key);
        }
    }
}

impl DriveTier {
    fn path_for(&self, key: &ContentKey) -> PathBuf {
        self.dir.join(key.to_hex())
    }

    fn write(&self, key: &ContentKey, bytes: &[u8]) -> Result<()> {
        let path = self.path_for(key);
        let tmp = self.dir.join(format!("{}.tmp", key.to_hex()));
        std::fs::write(&tmp, bytes)?;

        let mut perms = std::fs::metadata(&tmp)?.permissions();
        perms.set_readonly(true);
        std::fs::set_permissions(&tmp, perms)?;

        std::fs::rename(&tmp, &path)?;
        Ok(())
    }

    fn evict(&mut self, key: &ContentKey) -> Result<()> {
        let path = self.path_for(key);
        if let Ok(meta) = std::fs::metadata(&path) {
            let mut perms = meta.permissions();
            perms.set_readonly(false);
            let _ = std::fs::set_permissions(&path, perms);
        }
        match std::fs::remove_file(&path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        self.index.remove(key);
        tracing::info!("Evicted {} from drive", key);
        Ok(())
    }
}
