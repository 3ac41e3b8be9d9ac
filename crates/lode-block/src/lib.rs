#![forbid(unsafe_code)]
//! Byte-addressed devices and the cached block reader.
//!
//! The reader operates purely on physical byte addresses; logical→physical
//! chunk translation happens above it, in the volume layer. The mount is
//! read-only, so cache entries are immutable once inserted and reads are
//! idempotent for the volume's lifetime.

use lode_error::{Error, Result};
use lru::LruCache;
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::num::NonZeroUsize;
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::Arc;
use tracing::trace;

/// Default number of node-sized entries the reader cache retains.
pub const DEFAULT_CACHE_CAPACITY: usize = 32;

/// Byte-addressed device for fixed-offset reads (pread semantics).
pub trait ByteDevice: Send + Sync {
    /// Total length in bytes.
    fn len_bytes(&self) -> u64;

    /// Read exactly `buf.len()` bytes from `offset` into `buf`.
    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()>;
}

/// File-backed byte device using `pread`-style positioned I/O.
///
/// Opened read-only; `std::os::unix::fs::FileExt` needs no shared seek
/// position, so one handle serves concurrent readers.
#[derive(Debug, Clone)]
pub struct FileByteDevice {
    file: Arc<File>,
    len: u64,
}

impl FileByteDevice {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let file = OpenOptions::new().read(true).open(path.as_ref())?;
        let len = file.metadata()?.len();
        Ok(Self {
            file: Arc::new(file),
            len,
        })
    }
}

impl ByteDevice for FileByteDevice {
    fn len_bytes(&self) -> u64 {
        self.len
    }

    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        self.file.read_exact_at(buf, offset)?;
        Ok(())
    }
}

/// In-memory byte device over an owned image, used by tests and the harness.
#[derive(Debug, Clone)]
pub struct MemByteDevice {
    image: Arc<[u8]>,
}

impl MemByteDevice {
    #[must_use]
    pub fn new(image: Vec<u8>) -> Self {
        Self {
            image: image.into(),
        }
    }
}

impl ByteDevice for MemByteDevice {
    fn len_bytes(&self) -> u64 {
        self.image.len() as u64
    }

    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let start = usize::try_from(offset)
            .map_err(|_| Error::Io(std::io::ErrorKind::UnexpectedEof.into()))?;
        let end = start
            .checked_add(buf.len())
            .filter(|end| *end <= self.image.len())
            .ok_or_else(|| Error::Io(std::io::ErrorKind::UnexpectedEof.into()))?;
        buf.copy_from_slice(&self.image[start..end]);
        Ok(())
    }
}

/// Snapshot of reader cache statistics.
///
/// All counters are monotonically increasing for the lifetime of the reader.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheMetrics {
    /// Read requests satisfied from the cache.
    pub hits: u64,
    /// Read requests that required a device read.
    pub misses: u64,
    /// Entries evicted to make room for new ones.
    pub evictions: u64,
    /// Current number of resident entries.
    pub resident: usize,
}

impl CacheMetrics {
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn hit_ratio(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            return 0.0;
        }
        self.hits as f64 / total as f64
    }
}

#[derive(Debug)]
struct CacheInner {
    entries: LruCache<(u64, u32), Arc<[u8]>>,
    hits: u64,
    misses: u64,
    evictions: u64,
}

/// Positioned reader with an LRU cache over node-sized reads.
///
/// Entries are keyed by `(physical offset, length)` and shared out as
/// `Arc<[u8]>`; a hit never touches the device.
#[derive(Debug)]
pub struct BlockReader<D> {
    dev: D,
    cache: Mutex<CacheInner>,
}

impl<D: ByteDevice> BlockReader<D> {
    pub fn new(dev: D) -> Self {
        Self::with_capacity(dev, DEFAULT_CACHE_CAPACITY)
    }

    /// Create a reader whose cache holds at most `capacity` entries.
    ///
    /// A zero capacity is clamped to one entry.
    pub fn with_capacity(dev: D, capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            dev,
            cache: Mutex::new(CacheInner {
                entries: LruCache::new(capacity),
                hits: 0,
                misses: 0,
                evictions: 0,
            }),
        }
    }

    #[must_use]
    pub fn device(&self) -> &D {
        &self.dev
    }

    /// Uncached positioned read of `len` bytes at physical `offset`.
    pub fn direct_read(&self, offset: u64, len: usize) -> Result<Vec<u8>> {
        let mut buf = vec![0_u8; len];
        self.dev.read_exact_at(offset, &mut buf)?;
        Ok(buf)
    }

    /// Cached positioned read; identical contract to [`Self::direct_read`],
    /// but a hit avoids the device.
    pub fn cached_read(&self, offset: u64, len: u32) -> Result<Arc<[u8]>> {
        let key = (offset, len);

        {
            let mut cache = self.cache.lock();
            if let Some(entry) = cache.entries.get(&key) {
                let entry = Arc::clone(entry);
                cache.hits += 1;
                trace!(target: "lode::block", event = "cache_hit", offset, len);
                return Ok(entry);
            }
            cache.misses += 1;
        }

        // Read outside the lock; concurrent misses on the same key both read
        // the device and the second insert wins, which is harmless because
        // the content is identical on a read-only mount.
        let buf: Arc<[u8]> = self.direct_read(offset, len as usize)?.into();

        let mut cache = self.cache.lock();
        if cache.entries.len() == cache.entries.cap().get() && !cache.entries.contains(&key) {
            cache.evictions += 1;
        }
        cache.entries.put(key, Arc::clone(&buf));
        trace!(target: "lode::block", event = "cache_fill", offset, len);
        Ok(buf)
    }

    #[must_use]
    pub fn metrics(&self) -> CacheMetrics {
        let cache = self.cache.lock();
        CacheMetrics {
            hits: cache.hits,
            misses: cache.misses,
            evictions: cache.evictions,
            resident: cache.entries.len(),
        }
    }
}
