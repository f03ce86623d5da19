//! Log-state owner: the allocator, the segment summary buffer, and the
//! segment usage table.
//!
//! `LogState` is the single lock-protected home of the log tail, the
//! allocation region, the imap, the SUT, the in-memory SSB buffer, and the
//! free-segment ring. All methods on `LogState` run under the log lock;
//! methods on `Slfs` acquire and release it around buffer I/O.

use crate::{GcConfig, Slfs};
use slfs_error::{Result, SlfsError};
use slfs_ondisk::{Checkpoint, SsbBlock, SsbEntry, SutEntry};
use slfs_types::{
    BLOCK_SIZE, BlockNumber, Geometry, ImapEntry, SSB_ENTRIES_PER_BLOCK, SegmentIndex,
};
use std::collections::VecDeque;
use tracing::{debug, trace, warn};

/// Blocks at the tail end of every segment reserved for the inode-flush
/// block and the SSB; regular allocations never consume them.
const SEGMENT_RESERVED_BLOCKS: u32 = 2;

/// When this few blocks remain in the segment or region, a sync is forced
/// so the dirty-inode flush and the SSB still fit before the boundary.
const SYNC_LOW_WATER_BLOCKS: u32 = 5;

pub(crate) struct LogState {
    geo: Geometry,
    /// Next block to write.
    pub(crate) tail: u32,
    /// End of the current allocation region: the log end while sequential
    /// space remains, else the end of the recycled segment in use.
    pub(crate) region_end: u32,
    /// Allocation-count clock; SUT ages are stamps of this counter.
    pub(crate) ticks: u32,
    /// In-memory checkpoint, rewritten by each sync.
    pub(crate) cp: Checkpoint,
    pub(crate) imap: Vec<ImapEntry>,
    pub(crate) sut: Vec<SutEntry>,
    /// SSB entries for blocks appended since the last flush, append order.
    pub(crate) ssb_buf: Vec<SsbEntry>,
    /// A flush copy is in flight; blocks further flushes and reservations.
    pub(crate) ssb_flushing: bool,
    /// Cleaner-produced segment indices, consumed FIFO.
    pub(crate) free_ring: VecDeque<u32>,
    pub(crate) syncing: bool,
    pub(crate) gc_running: bool,
    /// Latched when a cleaner run made no progress; cleared when the free
    /// ring drops below target again (deletes may have opened space).
    pub(crate) gc_failed: bool,
}

/// A flush copy of the SSB buffer together with its destination block.
/// Owned by value, so nothing can race with it between reservation and
/// write.
pub(crate) struct PendingSsb {
    pub(crate) block: u32,
    pub(crate) entries: Vec<SsbEntry>,
    pub(crate) timestamp: u32,
    pub(crate) next_seg_addr: u32,
}

impl LogState {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        geo: Geometry,
        cp: Checkpoint,
        tail: u32,
        region_end: u32,
        imap: Vec<ImapEntry>,
        sut: Vec<SutEntry>,
        free_ring: VecDeque<u32>,
        ticks: u32,
    ) -> Self {
        Self {
            geo,
            tail,
            region_end,
            ticks,
            cp,
            imap,
            sut,
            ssb_buf: Vec::new(),
            ssb_flushing: false,
            free_ring,
            syncing: false,
            gc_running: false,
            gc_failed: false,
        }
    }

    pub(crate) fn seg_offset(&self) -> u32 {
        (self.tail - self.geo.segstart) % self.geo.segsize
    }

    pub(crate) fn seg_remaining(&self) -> u32 {
        self.geo.segsize - self.seg_offset()
    }

    pub(crate) fn current_segment(&self) -> SegmentIndex {
        SegmentIndex((self.tail - self.geo.segstart) / self.geo.segsize)
    }

    pub(crate) fn usage_percent(&self) -> u32 {
        let used = u64::from(self.tail - self.geo.segstart);
        let total = u64::from(self.geo.log_end() - self.geo.segstart);
        ((used * 100) / total.max(1)) as u32
    }

    /// Adjust a segment's live-byte count, saturating at zero, and stamp
    /// its age with the current tick. Blocks outside the log are ignored.
    pub(crate) fn update_usage(&mut self, block: u32, delta: i32) {
        let Some(seg) = self.geo.segment_of(BlockNumber(block)) else {
            return;
        };
        let entry = &mut self.sut[seg.0 as usize];
        if delta >= 0 {
            entry.live_bytes = entry.live_bytes.saturating_add(delta as u32);
        } else {
            entry.live_bytes = entry.live_bytes.saturating_sub(delta.unsigned_abs());
        }
        entry.age = self.ticks;
    }

    /// Record an SSB entry for a just-reserved block. Overflow is
    /// structurally impossible with full-segment coverage (the buffer holds
    /// more entries than a segment has blocks); drop on the floor if it
    /// happens anyway.
    pub(crate) fn push_ssb(&mut self, entry: SsbEntry) {
        if self.ssb_buf.len() < SSB_ENTRIES_PER_BLOCK {
            self.ssb_buf.push(entry);
        } else {
            warn!(target: "slfs::alloc", "SSB buffer overflow, dropping entry");
        }
    }

    /// Move the tail to the head segment of the free ring. Returns false if
    /// the ring is empty.
    pub(crate) fn switch_to_free_segment(&mut self) -> bool {
        let Some(seg) = self.free_ring.pop_front() else {
            return false;
        };
        assert!(seg < self.geo.nsegs, "free ring held invalid segment {seg}");
        self.tail = self.geo.segment_start(SegmentIndex(seg)).0;
        self.region_end = self.tail + self.geo.segsize;
        // Reset from the free sentinel; the segment is now the write target.
        self.sut[seg as usize].live_bytes = 0;
        debug!(target: "slfs::alloc", segment = seg, tail = self.tail, "switched to free segment");
        true
    }

    /// Consume one tail block for internal metadata or a relocation,
    /// crossing into a free segment when the region is exhausted. Sync-path
    /// and cleaner allocations come through here; they are exempt from the
    /// reserved-zone rule.
    pub(crate) fn advance_tail_internal(&mut self) -> Option<u32> {
        if self.tail >= self.region_end && !self.switch_to_free_segment() {
            return None;
        }
        let block = self.tail;
        self.tail += 1;
        self.ticks = self.ticks.wrapping_add(1);
        assert!(
            block < self.geo.size,
            "allocator produced invalid block {block}"
        );
        Some(block)
    }
}

enum AllocStep {
    Allocated(u32),
    EmergencyGc,
    Exhausted,
}

impl Slfs {
    /// Reserve one log block, appending `entry` to the segment summary
    /// buffer atomically with the reservation. The caller writes the block
    /// itself (through the buffer cache) after this returns.
    pub fn allocate(&self, entry: SsbEntry) -> Result<BlockNumber> {
        self.alloc_inner(Some(entry))
    }

    /// Reserve one log block for internal metadata (imap, SUT chains) with
    /// no SSB coverage.
    pub fn allocate_internal(&self) -> Result<BlockNumber> {
        self.alloc_inner(None)
    }

    fn alloc_inner(&self, entry: Option<SsbEntry>) -> Result<BlockNumber> {
        self.maybe_trigger_gc()?;
        self.maybe_trigger_sync()?;

        let mut attempted_emergency_gc = false;
        loop {
            let (step, pending) = {
                let mut log = self.log.lock();
                self.alloc_step(&mut log, entry, attempted_emergency_gc)
            };

            // Seal a reserved end-of-segment SSB before anything else gets
            // written; by the time the segment fills, its summary is on
            // disk.
            if let Some(pending) = pending {
                self.write_ssb(pending)?;
            }

            match step {
                AllocStep::Allocated(block) => {
                    trace!(target: "slfs::alloc", block, "allocated");
                    return Ok(BlockNumber(block));
                }
                AllocStep::EmergencyGc => {
                    attempted_emergency_gc = true;
                    debug!(target: "slfs::alloc", "emergency cleaner run");
                    self.run_gc()?;
                }
                AllocStep::Exhausted => return Err(SlfsError::NoSpace),
            }
        }
    }

    /// One allocation attempt under the log lock.
    fn alloc_step(
        &self,
        log: &mut LogState,
        entry: Option<SsbEntry>,
        attempted_emergency_gc: bool,
    ) -> (AllocStep, Option<PendingSsb>) {
        let geo = self.geo;
        let mut pending = None;
        let mut seg_remaining = if log.tail >= log.region_end {
            0
        } else {
            log.seg_remaining()
        };

        // The segment is ending. Its final block is the SSB's reserved
        // slot, so the summary always sits at a known place for recovery
        // and cleaning; the slot before it stays free for a late inode
        // flush.
        if (1..=SEGMENT_RESERVED_BLOCKS).contains(&seg_remaining) {
            if !log.ssb_buf.is_empty() && !log.ssb_flushing {
                log.ssb_flushing = true;
                let entries = std::mem::take(&mut log.ssb_buf);
                let last = geo.segment_end(log.current_segment()).0 - 1;
                pending = Some(PendingSsb {
                    block: last,
                    entries,
                    timestamp: log.cp.timestamp,
                    next_seg_addr: 0,
                });
            }
            seg_remaining = 0;
        }

        if seg_remaining == 0 {
            // Align to the next segment start.
            let consumed = log.tail - geo.segstart;
            let next_start = geo.segstart + consumed.div_ceil(geo.segsize) * geo.segsize;
            if log.tail < log.region_end && next_start < log.region_end {
                log.tail = next_start;
            } else if !log.switch_to_free_segment() {
                let step = if !attempted_emergency_gc && !log.gc_running && !log.gc_failed {
                    AllocStep::EmergencyGc
                } else {
                    AllocStep::Exhausted
                };
                return (step, pending);
            }
        }

        let block = log.tail;
        log.tail += 1;
        log.ticks = log.ticks.wrapping_add(1);
        assert!(block < geo.size, "allocator produced invalid block {block}");

        if let Some(entry) = entry {
            log.push_ssb(entry);
        }
        if let Some(pending) = pending.as_mut() {
            pending.next_seg_addr = geo.segment_start(log.current_segment()).0;
        }

        (AllocStep::Allocated(block), pending)
    }

    /// Arm the cleaner when free segments run low (re-checking the
    /// `gc_failed` latch first: deletes since the last failure may have
    /// opened reclaimable space).
    fn maybe_trigger_gc(&self) -> Result<()> {
        let (should_gc, in_sync) = {
            let mut log = self.log.lock();
            let free = log.free_ring.len() as u32;
            if log.gc_failed && free < self.config.target_segs {
                log.gc_failed = false;
            }
            let low = free < self.config.target_segs;
            let armed = !log.gc_running && !log.syncing && !log.gc_failed && low;
            let should = armed
                && (log.region_end < self.geo.log_end()
                    || log.usage_percent() >= self.config.threshold_percent);
            (should, log.syncing)
        };

        if should_gc {
            // Flush the SSB first so every block already appended has
            // coverage before the cleaner starts classifying.
            if !in_sync {
                self.flush_ssb_now()?;
            }
            self.run_gc()?;
        }
        Ok(())
    }

    /// Force a sync while enough blocks remain for the metadata it writes.
    fn maybe_trigger_sync(&self) -> Result<()> {
        let should_sync = {
            let log = self.log.lock();
            if log.syncing || log.tail >= log.region_end {
                false
            } else {
                let disk_remaining = log.region_end - log.tail;
                log.seg_remaining() <= SYNC_LOW_WATER_BLOCKS
                    || disk_remaining <= SYNC_LOW_WATER_BLOCKS
            }
        };
        if should_sync {
            self.sync()?;
        }
        Ok(())
    }

    /// Flush the SSB buffer to a freshly reserved log block, if there is
    /// anything to flush and no flush is already in flight. Returns the
    /// block written.
    pub(crate) fn flush_ssb_now(&self) -> Result<Option<BlockNumber>> {
        let pending = {
            let mut log = self.log.lock();
            if log.ssb_flushing || log.ssb_buf.is_empty() {
                return Ok(None);
            }
            let Some(block) = log.advance_tail_internal() else {
                // Critically full (mid-cleaning). Keep the entries buffered
                // and let a later flush retry.
                warn!(target: "slfs::alloc", "out of space, deferring SSB write");
                return Ok(None);
            };
            log.ssb_flushing = true;
            let entries = std::mem::take(&mut log.ssb_buf);
            let next_seg_addr = if log.seg_offset() == 0 { log.tail } else { 0 };
            PendingSsb {
                block,
                entries,
                timestamp: log.cp.timestamp,
                next_seg_addr,
            }
        };

        let block = pending.block;
        self.write_ssb(pending)?;
        Ok(Some(BlockNumber(block)))
    }

    /// Write a flush copy to its reserved block and release the flush
    /// latch. On I/O failure the entries are restored to the buffer so a
    /// later flush can retry.
    pub(crate) fn write_ssb(&self, pending: PendingSsb) -> Result<()> {
        let PendingSsb {
            block,
            entries,
            timestamp,
            next_seg_addr,
        } = pending;

        let count = entries.len();
        let ssb = SsbBlock {
            timestamp,
            next_seg_addr,
            entries,
        };

        let result = self.write_block_bytes(block, &ssb.to_block());

        let mut log = self.log.lock();
        log.ssb_flushing = false;
        match result {
            Ok(()) => {
                trace!(target: "slfs::alloc", block, entries = count, "SSB sealed");
                Ok(())
            }
            Err(e) => {
                // Put the copy back in front so append order survives.
                let mut restored = ssb.entries;
                restored.extend(log.ssb_buf.drain(..));
                log.ssb_buf = restored;
                Err(e)
            }
        }
    }

    /// Adjust segment liveness for `block` by `delta` bytes.
    pub(crate) fn update_usage(&self, block: u32, delta: i32) {
        self.log.lock().update_usage(block, delta);
    }

    /// Overwrite `block` with `bytes` through the cache.
    pub(crate) fn write_block_bytes(&self, block: u32, bytes: &[u8]) -> Result<()> {
        let buf = self.cache.bread(BlockNumber(block))?;
        {
            let mut data = buf.data();
            data.copy_from_slice(bytes);
        }
        self.cache.bwrite(&buf)
    }

    /// Overwrite `block` with zeroes through the cache.
    pub(crate) fn zero_block(&self, block: u32) -> Result<()> {
        self.write_block_bytes(block, &[0_u8; BLOCK_SIZE])
    }

    pub(crate) fn gc_config(&self) -> GcConfig {
        self.config
    }
}
