#![forbid(unsafe_code)]
//! Block I/O layer for SLFS.
//!
//! Provides the `ByteDevice` and `BlockDevice` traits, file-backed and
//! in-memory devices, and the pinned `BufferCache` the core reads and
//! writes through. A buffer stays cached while any `BufHandle` to it is
//! alive; dropping the handle releases the pin, so early returns and
//! panics can never leak a pinned buffer.

use parking_lot::{Mutex, MutexGuard};
use slfs_error::{Result, SlfsError};
use slfs_types::{BLOCK_SIZE, BlockNumber};
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::trace;

// ── Owned block buffer ──────────────────────────────────────────────────────

/// Owned block buffer.
///
/// Invariant: length equals the device block size.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockBuf {
    bytes: Vec<u8>,
}

impl BlockBuf {
    #[must_use]
    pub fn new(bytes: Vec<u8>) -> Self {
        Self { bytes }
    }

    #[must_use]
    pub fn zeroed(len: usize) -> Self {
        Self {
            bytes: vec![0_u8; len],
        }
    }

    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        &self.bytes
    }

    pub fn make_mut(&mut self) -> &mut [u8] {
        &mut self.bytes
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    #[must_use]
    pub fn into_inner(self) -> Vec<u8> {
        self.bytes
    }
}

// ── Byte-addressed devices ──────────────────────────────────────────────────

/// Byte-addressed device for fixed-offset I/O (pread/pwrite semantics).
pub trait ByteDevice: Send + Sync {
    /// Total length in bytes.
    fn len_bytes(&self) -> u64;

    /// Read exactly `buf.len()` bytes from `offset` into `buf`.
    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()>;

    /// Write all bytes in `buf` to `offset`.
    fn write_all_at(&self, offset: u64, buf: &[u8]) -> Result<()>;

    /// Flush pending writes to stable storage.
    fn sync(&self) -> Result<()>;
}

fn check_range(offset: u64, len: usize, device_len: u64, op: &str) -> Result<()> {
    let end = offset
        .checked_add(u64::try_from(len).map_err(|_| {
            SlfsError::Format(format!("{op} length overflows u64"))
        })?)
        .ok_or_else(|| SlfsError::Format(format!("{op} range overflows u64")))?;
    if end > device_len {
        return Err(SlfsError::Format(format!(
            "{op} out of bounds: offset={offset} len={len} device_len={device_len}"
        )));
    }
    Ok(())
}

/// File-backed byte device using `pread`/`pwrite` style I/O.
///
/// `std::os::unix::fs::FileExt` is thread-safe and does not require a
/// shared seek position.
#[derive(Debug, Clone)]
pub struct FileByteDevice {
    file: Arc<File>,
    len: u64,
    writable: bool,
}

impl FileByteDevice {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let (file, writable) = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path.as_ref())
            .map(|file| (file, true))
            .or_else(|_| {
                OpenOptions::new()
                    .read(true)
                    .open(path.as_ref())
                    .map(|file| (file, false))
            })?;
        let len = file.metadata()?.len();
        Ok(Self {
            file: Arc::new(file),
            len,
            writable,
        })
    }

    /// Create (or truncate) a file of exactly `len` bytes.
    pub fn create(path: impl AsRef<Path>, len: u64) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path.as_ref())?;
        file.set_len(len)?;
        Ok(Self {
            file: Arc::new(file),
            len,
            writable: true,
        })
    }
}

impl ByteDevice for FileByteDevice {
    fn len_bytes(&self) -> u64 {
        self.len
    }

    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        check_range(offset, buf.len(), self.len, "read")?;
        self.file.read_exact_at(buf, offset)?;
        Ok(())
    }

    fn write_all_at(&self, offset: u64, buf: &[u8]) -> Result<()> {
        if !self.writable {
            return Err(SlfsError::PermissionDenied);
        }
        check_range(offset, buf.len(), self.len, "write")?;
        self.file.write_all_at(buf, offset)?;
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        self.file.sync_all()?;
        Ok(())
    }
}

/// In-memory byte device for tests and scratch images.
#[derive(Debug)]
pub struct MemDevice {
    bytes: Mutex<Vec<u8>>,
    len: u64,
}

impl MemDevice {
    #[must_use]
    pub fn new(len: u64) -> Self {
        Self {
            bytes: Mutex::new(vec![0_u8; usize::try_from(len).expect("mem device size")]),
            len,
        }
    }
}

impl ByteDevice for MemDevice {
    fn len_bytes(&self) -> u64 {
        self.len
    }

    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        check_range(offset, buf.len(), self.len, "read")?;
        let bytes = self.bytes.lock();
        let start = usize::try_from(offset).expect("mem device offset");
        buf.copy_from_slice(&bytes[start..start + buf.len()]);
        Ok(())
    }

    fn write_all_at(&self, offset: u64, buf: &[u8]) -> Result<()> {
        check_range(offset, buf.len(), self.len, "write")?;
        let mut bytes = self.bytes.lock();
        let start = usize::try_from(offset).expect("mem device offset");
        bytes[start..start + buf.len()].copy_from_slice(buf);
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        Ok(())
    }
}

// ── Block-addressed devices ─────────────────────────────────────────────────

/// Block-addressed I/O interface.
pub trait BlockDevice: Send + Sync {
    /// Read a block by number.
    fn read_block(&self, block: BlockNumber) -> Result<BlockBuf>;

    /// Write a block by number. `data.len()` MUST equal `block_size()`.
    fn write_block(&self, block: BlockNumber, data: &[u8]) -> Result<()>;

    /// Device block size in bytes.
    fn block_size(&self) -> u32;

    /// Total number of blocks.
    fn block_count(&self) -> u64;

    /// Flush pending writes to stable storage.
    fn sync(&self) -> Result<()>;
}

/// Adapter exposing a `ByteDevice` as fixed-size blocks.
#[derive(Debug)]
pub struct ByteBlockDevice<D: ByteDevice> {
    inner: D,
    block_size: u32,
    block_count: u64,
}

impl<D: ByteDevice> ByteBlockDevice<D> {
    pub fn new(inner: D, block_size: u32) -> Result<Self> {
        if block_size == 0 || !block_size.is_power_of_two() {
            return Err(SlfsError::Format(format!(
                "block size {block_size} is not a power of two"
            )));
        }
        let block_count = inner.len_bytes() / u64::from(block_size);
        Ok(Self {
            inner,
            block_size,
            block_count,
        })
    }

    #[must_use]
    pub fn inner(&self) -> &D {
        &self.inner
    }

    fn block_offset(&self, block: BlockNumber) -> Result<u64> {
        if u64::from(block.0) >= self.block_count {
            return Err(SlfsError::Format(format!(
                "block {block} beyond device end ({} blocks)",
                self.block_count
            )));
        }
        Ok(u64::from(block.0) * u64::from(self.block_size))
    }
}

impl<D: ByteDevice> BlockDevice for ByteBlockDevice<D> {
    fn read_block(&self, block: BlockNumber) -> Result<BlockBuf> {
        let offset = self.block_offset(block)?;
        let mut buf = BlockBuf::zeroed(self.block_size as usize);
        self.inner.read_exact_at(offset, buf.make_mut())?;
        trace!(target: "slfs::block", event = "read", block = block.0);
        Ok(buf)
    }

    fn write_block(&self, block: BlockNumber, data: &[u8]) -> Result<()> {
        if data.len() != self.block_size as usize {
            return Err(SlfsError::Format(format!(
                "write_block length {} != block size {}",
                data.len(),
                self.block_size
            )));
        }
        let offset = self.block_offset(block)?;
        self.inner.write_all_at(offset, data)?;
        trace!(target: "slfs::block", event = "write", block = block.0);
        Ok(())
    }

    fn block_size(&self) -> u32 {
        self.block_size
    }

    fn block_count(&self) -> u64 {
        self.block_count
    }

    fn sync(&self) -> Result<()> {
        self.inner.sync()
    }
}

/// Open a path as a `BLOCK_SIZE`-granular device.
pub fn open_block_device(path: impl AsRef<Path>) -> Result<ByteBlockDevice<FileByteDevice>> {
    let dev = FileByteDevice::open(path)?;
    ByteBlockDevice::new(dev, BLOCK_SIZE as u32)
}

// ── Buffer cache ────────────────────────────────────────────────────────────

/// Cache hit/miss/eviction counters.
#[derive(Debug, Default)]
pub struct CacheMetrics {
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

/// Point-in-time snapshot of the counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheMetricsSnapshot {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
}

impl CacheMetricsSnapshot {
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
struct BufEntry {
    block: BlockNumber,
    /// Per-buffer sleep lock, held across read-modify-write.
    data: Mutex<Vec<u8>>,
}

/// Pinned reference to a cached block.
///
/// The buffer cannot be evicted while any handle to it exists; dropping
/// the handle is the `brelse`.
#[derive(Debug, Clone)]
pub struct BufHandle {
    entry: Arc<BufEntry>,
}

impl BufHandle {
    #[must_use]
    pub fn block(&self) -> BlockNumber {
        self.entry.block
    }

    /// Lock the buffer contents. The guard is the per-buffer sleep lock;
    /// release it before calling `BufferCache::bwrite` on the same handle.
    pub fn data(&self) -> MutexGuard<'_, Vec<u8>> {
        self.entry.data.lock()
    }
}

struct CacheMap {
    entries: HashMap<u32, Arc<BufEntry>>,
    /// Blocks in rough recency order; stale ids are skipped at evict time.
    lru: Vec<u32>,
}

/// Write-through pinned block cache.
///
/// `bread` pins, `bwrite` persists, dropping the handle unpins. Writes go
/// straight to the device, so durability per block follows issue order.
pub struct BufferCache {
    dev: Arc<dyn BlockDevice>,
    map: Mutex<CacheMap>,
    capacity: usize,
    metrics: CacheMetrics,
}

impl BufferCache {
    #[must_use]
    pub fn new(dev: Arc<dyn BlockDevice>, capacity: usize) -> Self {
        Self {
            dev,
            map: Mutex::new(CacheMap {
                entries: HashMap::new(),
                lru: Vec::new(),
            }),
            capacity: capacity.max(1),
            metrics: CacheMetrics::default(),
        }
    }

    #[must_use]
    pub fn device(&self) -> &Arc<dyn BlockDevice> {
        &self.dev
    }

    #[must_use]
    pub fn block_count(&self) -> u64 {
        self.dev.block_count()
    }

    /// Get a pinned handle to `block`, reading it from the device on miss.
    pub fn bread(&self, block: BlockNumber) -> Result<BufHandle> {
        {
            let mut map = self.map.lock();
            if let Some(entry) = map.entries.get(&block.0) {
                let entry = Arc::clone(entry);
                map.lru.push(block.0);
                self.metrics.hits.fetch_add(1, Ordering::Relaxed);
                return Ok(BufHandle { entry });
            }
        }

        // Miss: read outside the map lock, then insert (a racing reader may
        // have inserted meanwhile; reuse theirs to keep one entry per block).
        self.metrics.misses.fetch_add(1, Ordering::Relaxed);
        let buf = self.dev.read_block(block)?;

        let mut map = self.map.lock();
        if let Some(entry) = map.entries.get(&block.0) {
            let entry = Arc::clone(entry);
            return Ok(BufHandle { entry });
        }

        self.evict_locked(&mut map);
        let entry = Arc::new(BufEntry {
            block,
            data: Mutex::new(buf.into_inner()),
        });
        map.entries.insert(block.0, Arc::clone(&entry));
        map.lru.push(block.0);
        Ok(BufHandle { entry })
    }

    /// Persist the buffer's current contents to the device.
    ///
    /// Acquires the buffer lock internally; the caller must not hold the
    /// `data()` guard across this call.
    pub fn bwrite(&self, buf: &BufHandle) -> Result<()> {
        let data = buf.entry.data.lock().clone();
        self.dev.write_block(buf.entry.block, &data)
    }

    /// Flush the underlying device.
    pub fn sync(&self) -> Result<()> {
        self.dev.sync()
    }

    #[must_use]
    pub fn metrics(&self) -> CacheMetricsSnapshot {
        CacheMetricsSnapshot {
            hits: self.metrics.hits.load(Ordering::Relaxed),
            misses: self.metrics.misses.load(Ordering::Relaxed),
            evictions: self.metrics.evictions.load(Ordering::Relaxed),
        }
    }

    /// Evict unpinned entries, oldest first, until below capacity.
    fn evict_locked(&self, map: &mut CacheMap) {
        while map.entries.len() >= self.capacity {
            let mut evicted = false;
            let mut idx = 0;
            while idx < map.lru.len() {
                let id = map.lru[idx];
                let pinned = map
                    .entries
                    .get(&id)
                    .is_some_and(|entry| Arc::strong_count(entry) > 1);
                let still_cached = map.entries.contains_key(&id);
                // Keep only the most recent mention of each id.
                let last_mention = map.lru.iter().rposition(|b| *b == id) == Some(idx);
                if !still_cached || !last_mention {
                    map.lru.remove(idx);
                    continue;
                }
                if pinned {
                    idx += 1;
                    continue;
                }
                map.entries.remove(&id);
                map.lru.remove(idx);
                self.metrics.evictions.fetch_add(1, Ordering::Relaxed);
                trace!(target: "slfs::block", event = "evict", block = id);
                evicted = true;
                break;
            }
            if !evicted {
                // Everything pinned; let the cache run over capacity rather
                // than stall the caller.
                break;
            }
        }
    }
}

impl std::fmt::Debug for BufferCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferCache")
            .field("capacity", &self.capacity)
            .field("metrics", &self.metrics)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mem_block_device(blocks: u64) -> Arc<dyn BlockDevice> {
        let dev = MemDevice::new(blocks * BLOCK_SIZE as u64);
        Arc::new(ByteBlockDevice::new(dev, BLOCK_SIZE as u32).expect("block device"))
    }

    #[test]
    fn mem_device_round_trip() {
        let dev = mem_block_device(8);
        let mut data = vec![0_u8; BLOCK_SIZE];
        data[0] = 0xAB;
        data[BLOCK_SIZE - 1] = 0xCD;
        dev.write_block(BlockNumber(3), &data).expect("write");
        let buf = dev.read_block(BlockNumber(3)).expect("read");
        assert_eq!(buf.as_slice(), &data[..]);
    }

    #[test]
    fn out_of_bounds_block_rejected() {
        let dev = mem_block_device(4);
        assert!(dev.read_block(BlockNumber(4)).is_err());
        assert!(dev.write_block(BlockNumber(4), &[0_u8; BLOCK_SIZE]).is_err());
    }

    #[test]
    fn short_write_rejected() {
        let dev = mem_block_device(4);
        assert!(dev.write_block(BlockNumber(0), &[0_u8; 10]).is_err());
    }

    #[test]
    fn cache_hits_and_misses() {
        let cache = BufferCache::new(mem_block_device(8), 4);
        let a = cache.bread(BlockNumber(0)).expect("bread");
        drop(a);
        let _b = cache.bread(BlockNumber(0)).expect("bread");
        let snap = cache.metrics();
        assert_eq!(snap.misses, 1);
        assert_eq!(snap.hits, 1);
        assert!((snap.hit_ratio() - 0.5).abs() < 1e-9);
    }

    #[test]
    fn bwrite_is_write_through() {
        let dev = mem_block_device(8);
        let cache = BufferCache::new(Arc::clone(&dev), 4);

        let buf = cache.bread(BlockNumber(2)).expect("bread");
        buf.data()[0] = 0x5A;
        cache.bwrite(&buf).expect("bwrite");
        drop(buf);

        // Visible on the raw device, not just in cache.
        let raw = dev.read_block(BlockNumber(2)).expect("read");
        assert_eq!(raw.as_slice()[0], 0x5A);
    }

    #[test]
    fn pinned_buffers_survive_eviction_pressure() {
        let cache = BufferCache::new(mem_block_device(16), 2);

        let pinned = cache.bread(BlockNumber(0)).expect("bread");
        pinned.data()[0] = 0x77;

        // Churn through enough blocks to force eviction of everything
        // unpinned.
        for b in 1..10 {
            let h = cache.bread(BlockNumber(b)).expect("bread");
            drop(h);
        }

        // The pinned buffer's contents are still the in-memory ones.
        assert_eq!(pinned.data()[0], 0x77);
        let again = cache.bread(BlockNumber(0)).expect("bread");
        assert_eq!(again.data()[0], 0x77);
        assert!(cache.metrics().evictions > 0);
    }

    #[test]
    fn dropped_buffers_are_evictable() {
        let cache = BufferCache::new(mem_block_device(16), 2);
        for b in 0..8 {
            let h = cache.bread(BlockNumber(b)).expect("bread");
            drop(h);
        }
        assert!(cache.metrics().evictions >= 6);
    }

    #[test]
    fn file_device_round_trip() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("slfs.img");
        let dev = FileByteDevice::create(&path, 16 * BLOCK_SIZE as u64).expect("create");
        let dev = ByteBlockDevice::new(dev, BLOCK_SIZE as u32).expect("block device");

        let mut data = vec![0_u8; BLOCK_SIZE];
        data[7] = 0x42;
        dev.write_block(BlockNumber(5), &data).expect("write");
        dev.sync().expect("sync");

        let reopened = open_block_device(&path).expect("open");
        assert_eq!(reopened.block_count(), 16);
        let buf = reopened.read_block(BlockNumber(5)).expect("read");
        assert_eq!(buf.as_slice()[7], 0x42);
    }
}
