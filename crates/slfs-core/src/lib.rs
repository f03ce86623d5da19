#![forbid(unsafe_code)]
//! SLFS engine.
//!
//! A Sprite-style log-structured filesystem core. Every mutation appends to
//! a monotonically growing log tail; inode locations drift and are tracked
//! by the imap; a cost-benefit cleaner recycles segments whose contents
//! have died. Five subsystems cooperate:
//!
//! 1. the block allocator (log tail, segment boundaries, free ring),
//! 2. the segment summary buffer (per-block descriptors for the cleaner),
//! 3. the segment usage table (live bytes + age per segment),
//! 4. the imap and the dirty-inode buffer (batched inode flushes),
//! 5. the cleaner (victim selection, live-block relocation).
//!
//! State is split into three lock owners, ordered inode-cache →
//! dirty-inodes → log. No owner's lock is ever held across buffer-cache
//! I/O: the pattern throughout is copy under lock, release, do I/O,
//! re-acquire.

mod cleaner;
mod file;
mod inodes;
mod log;
mod mkfs;
mod sync;

pub use cleaner::GcReport;
pub use inodes::{InodeHandle, InodeLock, InodeStat};
pub use mkfs::{FormatOptions, format};
pub use slfs_ondisk::{BlockKind, Checkpoint, InodeType, SsbEntry, Superblock, SutEntry};

use crate::inodes::{DirtyInodes, InodeCache};
use crate::log::LogState;
use parking_lot::Mutex;
use slfs_block::{BlockDevice, BufferCache};
use slfs_error::{Result, SlfsError};
use slfs_ondisk::{imap_block_from_bytes, sut_block_from_bytes};
use slfs_types::{BlockNumber, Geometry, ImapEntry, InodeNumber, SUPERBLOCK_BLOCK, SegmentIndex};
use std::collections::VecDeque;
use std::sync::Arc;
use tracing::{info, warn};

/// Blocks held by the buffer cache.
const CACHE_CAPACITY: usize = 256;

/// Cleaner tunables.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GcConfig {
    /// Disk-use percentage that arms the cleaner.
    pub threshold_percent: u32,
    /// Victims cleaned per run; also the free-segment low-water mark.
    pub target_segs: u32,
    /// Segments above this utilization are not worth cleaning unless
    /// nothing else qualifies.
    pub util_threshold_percent: u32,
}

impl Default for GcConfig {
    fn default() -> Self {
        Self {
            threshold_percent: 30,
            target_segs: 8,
            util_threshold_percent: 95,
        }
    }
}

/// A mounted SLFS instance.
pub struct Slfs {
    pub(crate) cache: BufferCache,
    pub(crate) geo: Geometry,
    pub(crate) sb: Superblock,
    pub(crate) config: GcConfig,
    pub(crate) log: Mutex<LogState>,
    pub(crate) dirty: Mutex<DirtyInodes>,
    pub(crate) icache: InodeCache,
}

impl Slfs {
    /// Mount a device: validate the superblock, pick a checkpoint, load the
    /// imap and SUT, and rebuild the free ring.
    pub fn mount(dev: Arc<dyn BlockDevice>, config: GcConfig) -> Result<Arc<Self>> {
        let cache = BufferCache::new(dev, CACHE_CAPACITY);

        let sb = {
            let buf = cache.bread(BlockNumber(SUPERBLOCK_BLOCK))?;
            let data = buf.data();
            Superblock::parse(&data).map_err(|e| SlfsError::Format(format!("superblock: {e}")))?
        };
        let geo = sb.geometry();

        let cp = Self::choose_checkpoint(&cache, &sb)?;
        if cp.valid == 1 && !(geo.segstart..=geo.log_end()).contains(&cp.log_tail) {
            return Err(SlfsError::Corruption {
                block: cp.log_tail,
                detail: "checkpoint log tail outside the log area".into(),
            });
        }
        let tail = if cp.valid == 1 { cp.log_tail } else { geo.segstart };

        let mut imap = vec![ImapEntry::FREE; geo.ninodes as usize];
        for i in 0..(cp.imap_nblocks as usize).min(cp.imap_addrs.len()) {
            let addr = cp.imap_addrs[i];
            if addr == 0 {
                continue;
            }
            let buf = cache.bread(BlockNumber(addr))?;
            imap_block_from_bytes(
                &buf.data(),
                &mut imap,
                i * slfs_types::IMAP_ENTRIES_PER_BLOCK,
            )
            .map_err(|e| SlfsError::Format(format!("imap block {addr}: {e}")))?;
        }
        // A pending marker can only describe the dirty buffer of the session
        // that wrote it; after a remount that buffer is gone.
        for (inum, entry) in imap.iter_mut().enumerate() {
            if entry.is_pending() {
                warn!(target: "slfs::mount", inum, "dropping stale in-buffer imap marker");
                *entry = ImapEntry::FREE;
            }
        }

        let mut sut = vec![SutEntry::default(); geo.nsegs as usize];
        for i in 0..(cp.sut_nblocks as usize).min(cp.sut_addrs.len()) {
            let addr = cp.sut_addrs[i];
            if addr == 0 {
                continue;
            }
            let buf = cache.bread(BlockNumber(addr))?;
            sut_block_from_bytes(&buf.data(), &mut sut, i * slfs_types::SUT_ENTRIES_PER_BLOCK)
                .map_err(|e| SlfsError::Format(format!("SUT block {addr}: {e}")))?;
        }

        // A tail at the very end of the log sits in no segment; the
        // out-of-range sentinel keeps it from matching any ring entry.
        let cur_seg = geo
            .segment_of(BlockNumber(tail))
            .unwrap_or(SegmentIndex(geo.nsegs));

        // Free segments recorded in the SUT go back on the ring.
        let mut free_ring = VecDeque::new();
        for (seg, entry) in sut.iter().enumerate() {
            if entry.is_free() && seg as u32 != cur_seg.0 {
                free_ring.push_back(seg as u32);
            }
        }

        // Sequential phase: nothing beyond the tail's segment has ever been
        // written, so the allocator may stream to the end of the log.
        // Otherwise the tail sits in a recycled segment and must stop at its
        // boundary.
        let untouched_beyond = sut
            .iter()
            .enumerate()
            .filter(|(seg, _)| *seg as u32 > cur_seg.0)
            .all(|(_, e)| e.live_bytes == 0 && e.age == 0 && !e.is_free());
        let region_end = if untouched_beyond || cur_seg.0 >= geo.nsegs {
            geo.log_end()
        } else {
            geo.segment_end(cur_seg).0
        };

        let ticks = sut.iter().map(|e| e.age).max().unwrap_or(0).wrapping_add(1);

        info!(
            target: "slfs::mount",
            size = geo.size,
            nsegs = geo.nsegs,
            segsize = geo.segsize,
            segstart = geo.segstart,
            ninodes = geo.ninodes,
            log_tail = tail,
            free_segs = free_ring.len(),
            checkpoint_ts = cp.timestamp,
            "mounted"
        );

        Ok(Arc::new(Self {
            cache,
            geo,
            sb,
            config,
            log: Mutex::new(LogState::new(geo, cp, tail, region_end, imap, sut, free_ring, ticks)),
            dirty: Mutex::new(DirtyInodes::default()),
            icache: InodeCache::default(),
        }))
    }

    /// Pick the recovery checkpoint per the header/footer rule: a slot
    /// counts only if its valid flag is set and both stamps agree; of the
    /// valid slots, the higher timestamp wins. Neither valid means a
    /// freshly formatted log.
    fn choose_checkpoint(cache: &BufferCache, sb: &Superblock) -> Result<Checkpoint> {
        let mut chosen = Checkpoint::empty();
        for slot in [sb.checkpoint0, sb.checkpoint1] {
            if slot == 0 {
                continue;
            }
            let buf = cache.bread(BlockNumber(slot))?;
            let parsed = match Checkpoint::parse(&buf.data()) {
                Ok(cp) => cp,
                Err(e) => {
                    warn!(target: "slfs::mount", slot, error = %e, "unreadable checkpoint slot");
                    continue;
                }
            };
            if parsed.is_valid() && (chosen.valid != 1 || parsed.timestamp > chosen.timestamp) {
                chosen = parsed;
            }
        }
        Ok(chosen)
    }

    #[must_use]
    pub fn geometry(&self) -> Geometry {
        self.geo
    }

    #[must_use]
    pub fn superblock(&self) -> Superblock {
        self.sb
    }

    /// Snapshot of the in-memory checkpoint (as of the last sync).
    #[must_use]
    pub fn checkpoint(&self) -> Checkpoint {
        self.log.lock().cp
    }

    /// Number of segments currently on the free ring.
    #[must_use]
    pub fn free_segment_count(&self) -> usize {
        self.log.lock().free_ring.len()
    }

    /// Copy of the segment usage table.
    #[must_use]
    pub fn segment_usage(&self) -> Vec<SutEntry> {
        self.log.lock().sut.clone()
    }

    /// Usage record for one segment.
    pub fn segment_usage_of(&self, seg: SegmentIndex) -> Result<SutEntry> {
        let log = self.log.lock();
        log.sut
            .get(seg.0 as usize)
            .copied()
            .ok_or_else(|| SlfsError::InvalidArgument(format!("segment {seg} out of range")))
    }

    /// Current log tail (next block to be written).
    #[must_use]
    pub fn log_tail(&self) -> BlockNumber {
        BlockNumber(self.log.lock().tail)
    }

    /// Copy of the imap.
    #[must_use]
    pub fn imap_snapshot(&self) -> Vec<ImapEntry> {
        self.log.lock().imap.clone()
    }

    /// Imap entry for one inode.
    pub fn imap_entry(&self, inum: InodeNumber) -> Result<ImapEntry> {
        let log = self.log.lock();
        log.imap
            .get(inum.0 as usize)
            .copied()
            .ok_or_else(|| SlfsError::InvalidArgument(format!("inum {inum} out of range")))
    }

    #[must_use]
    pub fn buffer_cache(&self) -> &BufferCache {
        &self.cache
    }
}

impl std::fmt::Debug for Slfs {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Slfs")
            .field("geometry", &self.geo)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use slfs_block::{ByteBlockDevice, MemDevice};
    use slfs_types::BLOCK_SIZE;

    fn make_device(blocks: u32) -> Arc<dyn BlockDevice> {
        let dev = MemDevice::new(u64::from(blocks) * BLOCK_SIZE as u64);
        Arc::new(ByteBlockDevice::new(dev, BLOCK_SIZE as u32).expect("block device"))
    }

    fn formatted(opts: FormatOptions) -> (Arc<dyn BlockDevice>, Arc<Slfs>) {
        let dev = make_device(opts.size_blocks);
        format(&dev, &opts).expect("format");
        let fs = Slfs::mount(Arc::clone(&dev), GcConfig::default()).expect("mount");
        (dev, fs)
    }

    #[test]
    fn format_then_mount_recovers_geometry() {
        let opts = FormatOptions {
            size_blocks: 2_000,
            segment_blocks: 32,
            ninodes: 64,
        };
        let (_dev, fs) = formatted(opts);

        let geo = fs.geometry();
        assert_eq!(geo.size, 2_000);
        assert_eq!(geo.segsize, 32);
        assert_eq!(geo.nsegs, (2_000 - geo.segstart) / 32);

        let cp = fs.checkpoint();
        assert!(cp.is_valid());
        assert_eq!(fs.log_tail(), BlockNumber(cp.log_tail));

        // The builder pre-allocates only the root directory inode.
        let allocated: Vec<usize> = fs
            .imap_snapshot()
            .iter()
            .enumerate()
            .filter(|(_, e)| !e.is_free())
            .map(|(i, _)| i)
            .collect();
        assert_eq!(allocated, vec![InodeNumber::ROOT.0 as usize]);
    }

    #[test]
    fn mount_rejects_non_slfs_image() {
        let dev = make_device(64);
        let err = Slfs::mount(dev, GcConfig::default()).unwrap_err();
        assert!(matches!(err, SlfsError::Format(_)));
    }

    #[test]
    fn ialloc_exhaustion_reports_no_space() {
        let opts = FormatOptions {
            size_blocks: 2_000,
            segment_blocks: 32,
            ninodes: 4,
        };
        let (_dev, fs) = formatted(opts);

        // Root takes inum 1; slots 2 and 3 remain (inum 0 is reserved).
        for expected in 2..4_u32 {
            let ip = fs.ialloc(InodeType::File).expect("ialloc");
            assert_eq!(ip.inum(), InodeNumber(expected));
        }
        let err = fs.ialloc(InodeType::File).unwrap_err();
        assert!(matches!(err, SlfsError::NoSpace));
    }

    #[test]
    fn full_disk_fails_with_no_space_instead_of_panicking() {
        // Two segments of log only; the third file's worth of writes
        // cannot fit even after an emergency cleaner run.
        let opts = FormatOptions {
            size_blocks: 4 + 3 * 16 + 1,
            segment_blocks: 16,
            ninodes: 8,
        };
        let (_dev, fs) = formatted(opts);

        let ip = fs.ialloc(InodeType::File).expect("ialloc");
        let lock = fs.ilock(&ip).expect("ilock");
        fs.set_nlink(&lock, 1).expect("nlink");

        let chunk = vec![0x5A_u8; BLOCK_SIZE];
        let mut wrote = 0_u32;
        let err = loop {
            match fs.writei(&lock, &chunk, wrote * BLOCK_SIZE as u32) {
                Ok(_) => wrote += 1,
                Err(e) => break e,
            }
            assert!(wrote < 200, "writes never hit the disk limit");
        };
        assert!(matches!(err, SlfsError::NoSpace), "got {err:?}");
        assert!(wrote > 0, "some writes must succeed first");
    }
}
