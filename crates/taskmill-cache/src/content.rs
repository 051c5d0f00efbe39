use std::any::{Any, TypeId};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};

use dashmap::DashMap;
use parking_lot::Mutex;
use thiserror::Error;

use taskmill_sync::{ExclusiveLock, ReentrantAcquire};

/// A file as observed at one point in time: its identity (path) and its
/// current content descriptor.
///
/// The descriptor is an opaque, equality-comparable token representing the
/// file's observed content; how it is produced (hash, mtime+size, ...) is
/// the host's business. The cache only ever compares descriptors for
/// equality to decide freshness.
pub trait FileSnapshot {
    type Descriptor: Clone + PartialEq + Send + Sync + 'static;

    fn path(&self) -> &Path;

    /// The content descriptor currently observed for this file.
    fn descriptor(&self) -> Self::Descriptor;
}

/// Computes a value derived from a file's content.
///
/// Computer identity is part of the cache key: two computers are the same
/// key if they have the same type and the same
/// [`discriminant`](Self::discriminant). A computer parameterized by
/// configuration must fold that configuration into its discriminant, or
/// differently-configured instances will share cache entries.
pub trait FileDataComputer<F: FileSnapshot>: Send + Sync + 'static {
    type Data: Send + Sync + 'static;

    /// Distinguishes differently-parameterized computers of the same type.
    fn discriminant(&self) -> u64 {
        0
    }

    fn compute(&self, file: &F) -> anyhow::Result<Self::Data>;
}

/// Error returned by [`ContentDataCache::compute`].
///
/// Computation failures are not cached; the next call for the same key
/// invokes the computer again.
#[derive(Debug, Error)]
pub enum ContentCacheError {
    /// The computer failed. The failure belongs to this caller only.
    #[error(transparent)]
    Compute(#[from] anyhow::Error),
    /// The computer re-entered the cache for its own (path, computer) key
    /// while holding its load lock.
    #[error("reentrant data computation for the same file")]
    Reentrant(#[from] ReentrantAcquire),
}

#[derive(Clone, Debug, Eq, Hash, PartialEq)]
struct ComputerId {
    type_id: TypeId,
    discriminant: u64,
}

impl ComputerId {
    fn of<F, C>(computer: &C) -> Self
    where
        F: FileSnapshot,
        C: FileDataComputer<F>,
    {
        ComputerId {
            type_id: TypeId::of::<C>(),
            discriminant: computer.discriminant(),
        }
    }
}

#[derive(Clone, Debug, Eq, Hash, PartialEq)]
struct CacheKey {
    path: PathBuf,
    computer: ComputerId,
}

type AnyValue = Arc<dyn Any + Send + Sync>;

/// The held value of an entry. `cacheify` downgrades `Strong` to `Soft`;
/// an access that finds the `Soft` value still alive re-strongifies it.
enum ValueRef {
    Strong(AnyValue),
    Soft(Weak<dyn Any + Send + Sync>),
}

struct Entry<D> {
    /// The descriptor observed when the value was computed. The entry is
    /// usable only while this equals the file's current descriptor.
    descriptor: D,
    value: Mutex<ValueRef>,
}

impl<D> Entry<D> {
    fn new(descriptor: D, value: AnyValue) -> Self {
        Entry {
            descriptor,
            value: Mutex::new(ValueRef::Strong(value)),
        }
    }

    /// Returns the held value, re-strongifying a reclaimable one.
    fn value_strongified(&self) -> Option<AnyValue> {
        let mut value = self.value.lock();
        match &*value {
            ValueRef::Strong(data) => Some(Arc::clone(data)),
            ValueRef::Soft(weak) => {
                let data = weak.upgrade()?;
                *value = ValueRef::Strong(Arc::clone(&data));
                Some(data)
            }
        }
    }

    /// Makes the held value reclaimable; returns whether the entry still
    /// holds any data at all.
    fn cacheify(&self) -> bool {
        let mut value = self.value.lock();
        match &*value {
            ValueRef::Strong(data) => {
                let weak = Arc::downgrade(data);
                *value = ValueRef::Soft(weak);
                true
            }
            ValueRef::Soft(weak) => weak.strong_count() > 0,
        }
    }
}

/// A content-addressed derived-data cache.
///
/// Memoizes values derived from file content per (absolute path, computer
/// identity) pair. An entry is fresh only while its stored descriptor
/// equals the file's currently observed one; on mismatch the value is
/// recomputed under a per-key [`ExclusiveLock`], so concurrent misses for
/// one key collapse into a single computation.
///
/// Files with relative paths bypass the cache entirely: a relative path is
/// not a stable cache identity.
pub struct ContentDataCache<F: FileSnapshot> {
    entries: DashMap<CacheKey, Entry<F::Descriptor>>,
    load_locks: DashMap<CacheKey, Arc<ExclusiveLock>>,
}

impl<F: FileSnapshot> fmt::Debug for ContentDataCache<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContentDataCache")
            .field("entries", &self.entries.len())
            .field("load_locks", &self.load_locks.len())
            .finish()
    }
}

impl<F: FileSnapshot> Default for ContentDataCache<F> {
    fn default() -> Self {
        ContentDataCache {
            entries: DashMap::new(),
            load_locks: DashMap::new(),
        }
    }
}

impl<F: FileSnapshot> ContentDataCache<F> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the data derived from `file` by `computer`, shared across
    /// all callers requesting the same (path, computer) pair.
    pub fn compute<C>(&self, file: &F, computer: &C) -> Result<Arc<C::Data>, ContentCacheError>
    where
        C: FileDataComputer<F>,
    {
        if !file.path().is_absolute() {
            return Ok(Arc::new(computer.compute(file)?));
        }

        let key = CacheKey {
            path: file.path().to_path_buf(),
            computer: ComputerId::of::<F, C>(computer),
        };
        let descriptor = file.descriptor();

        if let Some(data) = self.lookup_fresh::<C>(&key, &descriptor) {
            return Ok(data);
        }

        let lock = {
            let entry = self
                .load_locks
                .entry(key.clone())
                .or_insert_with(|| Arc::new(ExclusiveLock::new()));
            // Clone out of the map so no shard lock is held while blocked.
            Arc::clone(entry.value())
        };
        let _guard = lock.lock()?;

        // Double-checked: a concurrent miss may have stored the entry while
        // we waited for the lock.
        if let Some(data) = self.lookup_fresh::<C>(&key, &descriptor) {
            return Ok(data);
        }

        let data = Arc::new(computer.compute(file)?);
        self.entries
            .insert(key, Entry::new(descriptor, data.clone() as AnyValue));
        Ok(data)
    }

    fn lookup_fresh<C>(&self, key: &CacheKey, current: &F::Descriptor) -> Option<Arc<C::Data>>
    where
        C: FileDataComputer<F>,
    {
        let entry = self.entries.get(key)?;
        if entry.descriptor != *current {
            return None;
        }
        let value = entry.value_strongified()?;
        // The key carries the computer's TypeId, so a stored value is
        // always of the computer's data type; treat a mismatch as a miss.
        value.downcast::<C::Data>().ok()
    }

    /// Removes every cached entry whose path equals `path` or is nested
    /// under it.
    pub fn invalidate(&self, path: &Path) {
        let before = self.entries.len();
        self.entries.retain(|key, _| !key.path.starts_with(path));
        let removed = before - self.entries.len();
        if removed > 0 {
            tracing::debug!(removed, path = %path.display(), "invalidated content cache entries");
        }
    }

    pub fn invalidate_all(&self) {
        self.entries.clear();
    }

    /// Makes every held value reclaimable and drops entries whose value has
    /// already been reclaimed, bounding memory use without an explicit
    /// eviction policy. Intended to be driven periodically by the host.
    pub fn cacheify(&self) {
        let before = self.entries.len();
        self.entries.retain(|_, entry| entry.cacheify());
        let dropped = before - self.entries.len();
        if dropped > 0 {
            tracing::debug!(dropped, "dropped reclaimed content cache entries");
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
