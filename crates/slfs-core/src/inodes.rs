//! Inodes: the dirty-inode buffer, the imap operations, and the in-memory
//! inode cache.
//!
//! Inodes have no fixed home on disk. Modified inodes collect in the dirty
//! buffer and are flushed several-per-block to the log tail; the imap then
//! records `(block, version, slot)` per inum. Readers check the dirty
//! buffer (both halves) before consulting the imap.
//!
//! The cache hands out `InodeHandle`s. `ilock` takes the per-inode sleep
//! lock (held across I/O) and loads the inode on first use; field access
//! goes through a short state lock so the cleaner can repoint block
//! addresses of cached inodes without ever taking the sleep lock.

use crate::Slfs;
use parking_lot::{Mutex, MutexGuard};
use slfs_error::{Result, SlfsError};
use slfs_ondisk::{BlockKind, Dinode, InodeType, SsbEntry};
use slfs_types::{
    BLOCK_SIZE, BlockNumber, DINODE_SIZE, ImapEntry, INODES_PER_BLOCK, InodeNumber, NDIRECT,
    Version,
};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, trace};

/// Active inode handles kept before unreferenced cache entries are pruned.
const INODE_CACHE_CAPACITY: usize = 64;

/// Segment-tail blocks that must stay available for the flush + SSB pair.
const FLUSH_RESERVED_BLOCKS: u32 = 2;

// ── Dirty-inode buffer ──────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub(crate) struct DirtyInode {
    pub(crate) inum: u32,
    pub(crate) version: Version,
    pub(crate) di: Dinode,
}

/// Modified inodes awaiting a batched flush. The flushing half holds the
/// copy currently being written so readers keep finding in-flight inodes.
#[derive(Debug, Default)]
pub(crate) struct DirtyInodes {
    pub(crate) active: Vec<DirtyInode>,
    pub(crate) flushing: Vec<DirtyInode>,
}

impl DirtyInodes {
    pub(crate) fn find(&self, inum: u32) -> Option<&DirtyInode> {
        self.active
            .iter()
            .find(|e| e.inum == inum)
            .or_else(|| self.flushing.iter().find(|e| e.inum == inum))
    }
}

// ── In-memory inode cache ───────────────────────────────────────────────────

/// In-memory image of an inode.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct InodeState {
    pub(crate) loaded: bool,
    pub(crate) itype: InodeType,
    pub(crate) major: i16,
    pub(crate) minor: i16,
    pub(crate) nlink: i16,
    pub(crate) size: u32,
    pub(crate) version: Version,
    pub(crate) addrs: [u32; NDIRECT + 1],
}

impl InodeState {
    pub(crate) fn to_dinode(self) -> Dinode {
        Dinode {
            itype: self.itype,
            major: self.major,
            minor: self.minor,
            nlink: self.nlink,
            size: self.size,
            addrs: self.addrs,
        }
    }

    pub(crate) fn load(&mut self, di: &Dinode, version: Version) {
        self.loaded = true;
        self.itype = di.itype;
        self.major = di.major;
        self.minor = di.minor;
        self.nlink = di.nlink;
        self.size = di.size;
        self.version = version;
        self.addrs = di.addrs;
    }
}

#[derive(Debug)]
pub(crate) struct CachedInode {
    pub(crate) inum: u32,
    /// Logical ownership, held across I/O by `ilock` callers.
    sleep: Mutex<()>,
    /// Short-section field access; never held across I/O or other locks.
    state: Mutex<InodeState>,
}

impl CachedInode {
    pub(crate) fn with_state<R>(&self, f: impl FnOnce(&mut InodeState) -> R) -> R {
        f(&mut self.state.lock())
    }
}

/// Reference to a cached inode. Clones share the entry; the cache prunes
/// entries once no handle remains.
#[derive(Debug, Clone)]
pub struct InodeHandle {
    pub(crate) inner: Arc<CachedInode>,
}

impl InodeHandle {
    #[must_use]
    pub fn inum(&self) -> InodeNumber {
        InodeNumber(self.inner.inum)
    }
}

/// Proof of ownership of an inode's sleep lock. Required by the read/write
/// path; dropping it is the unlock.
pub struct InodeLock<'a> {
    pub(crate) inode: &'a InodeHandle,
    _sleep: MutexGuard<'a, ()>,
}

impl InodeLock<'_> {
    #[must_use]
    pub fn inum(&self) -> InodeNumber {
        self.inode.inum()
    }
}

#[derive(Debug, Default)]
pub(crate) struct InodeCache {
    map: Mutex<HashMap<u32, Arc<CachedInode>>>,
}

impl InodeCache {
    fn get_or_insert(&self, inum: u32) -> Arc<CachedInode> {
        let mut map = self.map.lock();
        if map.len() > INODE_CACHE_CAPACITY {
            map.retain(|_, entry| Arc::strong_count(entry) > 1);
        }
        Arc::clone(map.entry(inum).or_insert_with(|| {
            Arc::new(CachedInode {
                inum,
                sleep: Mutex::new(()),
                state: Mutex::new(InodeState::default()),
            })
        }))
    }

    pub(crate) fn lookup(&self, inum: u32) -> Option<Arc<CachedInode>> {
        self.map.lock().get(&inum).map(Arc::clone)
    }

    fn prune(&self) {
        self.map
            .lock()
            .retain(|_, entry| Arc::strong_count(entry) > 1);
    }
}

/// Stat information for an inode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InodeStat {
    pub inum: InodeNumber,
    pub itype: InodeType,
    pub nlink: i16,
    pub size: u32,
}

// ── Operations ──────────────────────────────────────────────────────────────

impl Slfs {
    /// Allocate a fresh inode of the given type.
    ///
    /// The imap slot is claimed with the in-buffer marker and the zeroed
    /// inode lives in the dirty buffer until the first flush gives it an
    /// on-disk home.
    pub fn ialloc(&self, itype: InodeType) -> Result<InodeHandle> {
        assert!(!itype.is_free(), "ialloc of a free inode type");

        let inum = {
            let mut log = self.log.lock();
            let found = (1..log.imap.len()).find(|&i| log.imap[i].is_free());
            if let Some(i) = found {
                log.imap[i] = ImapEntry::PENDING;
            }
            found
        };
        let Some(inum) = inum else {
            return Err(SlfsError::NoSpace);
        };
        let inum = inum as u32;
        debug!(target: "slfs::inode", inum, ?itype, "ialloc");

        self.iupdate_raw(inum, Version(0), Dinode::new(itype))?;
        Ok(self.iget(InodeNumber(inum)))
    }

    /// Get a handle to an inode without locking or reading it.
    #[must_use]
    pub fn iget(&self, inum: InodeNumber) -> InodeHandle {
        InodeHandle {
            inner: self.icache.get_or_insert(inum.0),
        }
    }

    /// Take the inode's sleep lock, reading it (dirty buffer first, then
    /// imap) on first use.
    pub fn ilock<'a>(&self, ip: &'a InodeHandle) -> Result<InodeLock<'a>> {
        let sleep = ip.inner.sleep.lock();

        if !ip.inner.with_state(|s| s.loaded) {
            let (di, version) = self.iread_raw(ip.inner.inum)?;
            if di.itype.is_free() {
                return Err(SlfsError::NotFound(format!(
                    "inode {} is not allocated",
                    ip.inner.inum
                )));
            }
            ip.inner.with_state(|s| s.load(&di, version));
        }

        Ok(InodeLock {
            inode: ip,
            _sleep: sleep,
        })
    }

    /// Drop a handle. On the last reference to an unlinked inode, truncate
    /// it, bump its version, and free its imap slot.
    pub fn iput(&self, ip: InodeHandle) -> Result<()> {
        // Cache map + this handle: nobody else can resurrect it below us.
        let last_ref = Arc::strong_count(&ip.inner) == 2;
        if last_ref {
            let _sleep = ip.inner.sleep.lock();
            let (loaded, nlink) = ip.inner.with_state(|s| (s.loaded, s.nlink));
            if loaded && nlink == 0 {
                self.ifree(&ip)?;
                ip.inner.with_state(|s| *s = InodeState::default());
            }
        }
        drop(ip);
        self.icache.prune();
        Ok(())
    }

    /// Copy an inode's current in-memory image into the dirty buffer.
    pub fn iupdate(&self, lock: &InodeLock<'_>) -> Result<()> {
        let (di, version) = lock
            .inode
            .inner
            .with_state(|s| (s.to_dinode(), s.version));
        self.iupdate_raw(lock.inode.inner.inum, version, di)
    }

    /// Set an inode's link count. The syscall layer owns link semantics;
    /// the core only persists the field.
    pub fn set_nlink(&self, lock: &InodeLock<'_>, nlink: i16) -> Result<()> {
        lock.inode.inner.with_state(|s| s.nlink = nlink);
        self.iupdate(lock)
    }

    /// Stat an inode under its lock.
    #[must_use]
    pub fn stati(&self, lock: &InodeLock<'_>) -> InodeStat {
        lock.inode.inner.with_state(|s| InodeStat {
            inum: lock.inode.inum(),
            itype: s.itype,
            nlink: s.nlink,
            size: s.size,
        })
    }

    /// Read an inode image: dirty buffer (both halves) first, then the
    /// block the imap points at.
    pub(crate) fn iread_raw(&self, inum: u32) -> Result<(Dinode, Version)> {
        {
            let dirty = self.dirty.lock();
            if let Some(entry) = dirty.find(inum) {
                return Ok((entry.di, entry.version));
            }
        }

        let entry = {
            let log = self.log.lock();
            log.imap
                .get(inum as usize)
                .copied()
                .ok_or_else(|| SlfsError::InvalidArgument(format!("inum {inum} out of range")))?
        };

        if entry.is_free() {
            return Err(SlfsError::NotFound(format!("inode {inum} is not allocated")));
        }
        assert!(
            !entry.is_pending(),
            "inode {inum} marked in-flight but absent from dirty buffer"
        );

        let block = entry.block();
        if block.0 == 0 || block.0 >= self.geo.size {
            return Err(SlfsError::Corruption {
                block: block.0,
                detail: format!("imap entry for inode {inum} points outside the image"),
            });
        }

        let buf = self.cache.bread(block)?;
        let di = {
            let data = buf.data();
            Dinode::read_from_block(&data, entry.slot() as usize).map_err(|e| {
                SlfsError::Corruption {
                    block: block.0,
                    detail: format!("inode {inum} slot {}: {e}", entry.slot()),
                }
            })?
        };
        Ok((di, Version(u32::from(entry.version()))))
    }

    /// Insert or update an inode in the dirty buffer, syncing when the
    /// buffer reaches a block's worth.
    pub(crate) fn iupdate_raw(&self, inum: u32, version: Version, di: Dinode) -> Result<()> {
        let need_sync = {
            let mut dirty = self.dirty.lock();
            if let Some(entry) = dirty.active.iter_mut().find(|e| e.inum == inum) {
                entry.di = di;
                entry.version = version;
            } else {
                dirty.active.push(DirtyInode { inum, version, di });
            }
            dirty.active.len() >= INODES_PER_BLOCK
        };
        if need_sync {
            self.sync()?;
        }
        Ok(())
    }

    /// Free an unlinked inode: truncate, mark the type free, drop it from
    /// the dirty buffer, clear the imap slot, and persist the state.
    fn ifree(&self, ip: &InodeHandle) -> Result<()> {
        let inum = ip.inner.inum;
        debug!(target: "slfs::inode", inum, "ifree");

        self.itrunc(ip)?;
        ip.inner.with_state(|s| s.itype = InodeType::Free);

        {
            let mut dirty = self.dirty.lock();
            dirty.active.retain(|e| e.inum != inum);
            // A copy already in the flushing half cannot be pulled back;
            // clearing the imap below makes the flush skip it.
        }
        {
            let mut log = self.log.lock();
            log.imap[inum as usize] = ImapEntry::FREE;
        }

        self.sync()
    }

    /// Drain the dirty buffer to packed inode blocks at the log tail and
    /// repoint the imap.
    ///
    /// One INODE-kind SSB entry covers each whole block; the cleaner
    /// reconstructs per-inode liveness from the imap.
    pub(crate) fn flush_dirty_inodes(&self) -> Result<()> {
        loop {
            // Leave the reserved tail blocks alone: if the segment cannot
            // take an inode block plus its SSB, flush on the next sync.
            {
                let log = self.log.lock();
                if log.tail < log.region_end {
                    let disk_remaining = log.region_end - log.tail;
                    if log.seg_remaining() <= FLUSH_RESERVED_BLOCKS
                        || disk_remaining <= FLUSH_RESERVED_BLOCKS
                    {
                        return Ok(());
                    }
                }
            }

            let batch: Vec<DirtyInode> = {
                let mut dirty = self.dirty.lock();
                if dirty.active.is_empty() {
                    return Ok(());
                }
                assert!(
                    dirty.flushing.is_empty(),
                    "inode flush already in progress"
                );
                let take = dirty.active.len().min(INODES_PER_BLOCK);
                dirty.flushing = dirty.active.drain(..take).collect();
                dirty.flushing.clone()
            };

            let result = self.flush_batch(&batch);
            if let Err(e) = result {
                // Restore the copies so nothing is lost; order front-first
                // so a retry flushes the same inodes.
                let mut dirty = self.dirty.lock();
                let mut restored = std::mem::take(&mut dirty.flushing);
                restored.append(&mut dirty.active);
                dirty.active = restored;
                return Err(e);
            }

            self.dirty.lock().flushing.clear();

            // The buffer only exceeds one block when the cleaner dirtied
            // inodes while a sync was latched; drain the rest too.
            let more = self.dirty.lock().active.len() >= INODES_PER_BLOCK;
            if !more {
                return Ok(());
            }
        }
    }

    fn flush_batch(&self, batch: &[DirtyInode]) -> Result<()> {
        let first_inum = batch[0].inum;
        let block = self
            .allocate(SsbEntry {
                kind: BlockKind::Inode,
                inum: InodeNumber(first_inum),
                offset: 0,
                version: Version(0),
            })?
            .0;

        let mut data = vec![0_u8; BLOCK_SIZE];
        for (slot, entry) in batch.iter().enumerate() {
            entry.di.write_to_block(&mut data, slot);
        }
        self.write_block_bytes(block, &data)?;

        let mut log = self.log.lock();
        log.update_usage(block, BLOCK_SIZE as i32);
        for (slot, entry) in batch.iter().enumerate() {
            // Freed while in flight: the type went free or the imap slot
            // was already cleared. Either way the slot stays free.
            if entry.di.itype.is_free() {
                continue;
            }
            let old = log.imap[entry.inum as usize];
            if old.is_free() {
                continue;
            }
            if old.is_resident() && old.block().0 != block {
                // The previous image of this inode just went stale.
                log.update_usage(old.block().0, -(DINODE_SIZE as i32));
            }
            log.imap[entry.inum as usize] =
                ImapEntry::encode(BlockNumber(block), entry.version, slot as u8);
        }
        drop(log);

        trace!(target: "slfs::inode", block, count = batch.len(), "flushed inode block");
        Ok(())
    }
}
