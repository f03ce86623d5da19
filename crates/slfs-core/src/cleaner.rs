//! The segment cleaner.
//!
//! Victims are chosen by cost-benefit (cold, sparsely occupied segments
//! first). Each victim's segment summary blocks identify what the segment
//! holds; live blocks (imap version equal to the descriptor's) are copied
//! to the log tail, every pointer to them is repointed, and the segment
//! joins the free ring. Segments without summaries (image-builder output)
//! get a full imap-and-pointer walk instead.
//!
//! The cleaner is a synchronous service on the caller's thread, entered
//! from the allocator when thresholds fire; `gc_running` keeps it
//! non-reentrant.

use crate::Slfs;
use slfs_error::{Result, SlfsError};
use slfs_ondisk::{BlockKind, Dinode, SUT_FREE, SsbBlock, SsbEntry};
use slfs_types::{
    BLOCK_SIZE, BlockNumber, InodeNumber, MAX_FILE_BLOCKS, NDIRECT, NINDIRECT, SegmentIndex,
    Version, read_le_u32, write_le_u32,
};
use std::collections::HashSet;
use tracing::{debug, info, warn};

const BLOCK_BYTES: i32 = BLOCK_SIZE as i32;

/// What one cleaner run accomplished.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GcReport {
    /// Victim segments selected this run.
    pub victims: usize,
    /// Victims fully cleaned and returned to the free ring.
    pub segments_freed: usize,
    /// Live blocks copied to the log tail.
    pub blocks_relocated: usize,
    /// False when the run stopped early (no candidates, progress guard, or
    /// out of tail space mid-relocation).
    pub completed: bool,
}

#[derive(Debug, Clone, Copy)]
struct Victim {
    seg: u32,
    score: u64,
    util: u32,
}

struct CleanOutcome {
    relocated: usize,
    completed: bool,
}

impl Slfs {
    /// Run the cleaner once. Returns what it achieved; a run that found
    /// nothing to do latches `gc_failed` so the allocator stops retrying
    /// until deletes open new opportunities.
    pub fn run_gc(&self) -> Result<GcReport> {
        {
            let mut log = self.log.lock();
            if log.gc_running {
                return Ok(GcReport::default());
            }
            log.gc_running = true;
        }

        let result = self.gc_inner();

        // Drop the latch before syncing; sync is skipped while the cleaner
        // runs and this run is done mutating.
        self.log.lock().gc_running = false;

        let report = match result {
            Ok(report) => report,
            Err(e) => {
                self.log.lock().gc_failed = true;
                return Err(e);
            }
        };

        if report.victims > 0 {
            self.sync()?;
        }

        {
            let mut log = self.log.lock();
            log.gc_failed = !(report.completed && report.segments_freed > 0);
        }

        info!(
            target: "slfs::gc",
            victims = report.victims,
            freed = report.segments_freed,
            relocated = report.blocks_relocated,
            completed = report.completed,
            "cleaner run finished"
        );
        Ok(report)
    }

    fn gc_inner(&self) -> Result<GcReport> {
        let victims = self.select_victims();
        if victims.is_empty() {
            debug!(target: "slfs::gc", "no suitable segments to clean");
            return Ok(GcReport {
                victims: 0,
                segments_freed: 0,
                blocks_relocated: 0,
                completed: false,
            });
        }

        // Progress guard: relocation itself consumes tail space. With less
        // than half a segment left and nothing on the free ring, a run
        // could strand mid-victim; refuse instead.
        {
            let log = self.log.lock();
            let remaining = log.region_end.saturating_sub(log.tail);
            if remaining < self.geo.segsize / 2 && log.free_ring.is_empty() {
                warn!(
                    target: "slfs::gc",
                    remaining,
                    "not enough tail space to clean safely"
                );
                return Ok(GcReport {
                    victims: victims.len(),
                    segments_freed: 0,
                    blocks_relocated: 0,
                    completed: false,
                });
            }
        }

        let mut report = GcReport {
            victims: victims.len(),
            segments_freed: 0,
            blocks_relocated: 0,
            completed: true,
        };

        for victim in &victims {
            debug!(
                target: "slfs::gc",
                segment = victim.seg,
                score = victim.score,
                util = victim.util,
                "cleaning victim"
            );
            let outcome = self.clean_segment(SegmentIndex(victim.seg))?;
            report.blocks_relocated += outcome.relocated;
            if outcome.completed {
                report.segments_freed += 1;
            } else {
                report.completed = false;
                break;
            }
        }

        Ok(report)
    }

    /// Cost-benefit victim selection.
    ///
    /// `score = (100 - u) * age * 1000 / (100 + u)` for utilization `u` in
    /// percent; full segments score zero and are never picked. Segments
    /// above the utilization threshold are only considered when nothing
    /// else qualifies.
    fn select_victims(&self) -> Vec<Victim> {
        let cfg = self.gc_config();
        let (sut, cur_seg, ticks, frontier) = {
            let log = self.log.lock();
            // Virgin segments ahead of the sequential tail are unwritten
            // space, not garbage; freeing one would hand the same blocks
            // out twice. Once recycling starts, every segment is fair game.
            let frontier = if log.region_end == self.geo.log_end() {
                log.tail
            } else {
                self.geo.log_end()
            };
            (log.sut.clone(), log.current_segment().0, log.ticks, frontier)
        };
        let seg_bytes = u64::from(self.geo.segment_bytes());

        let pick = |respect_util_threshold: bool| -> Vec<Victim> {
            let mut victims: Vec<Victim> = Vec::new();
            for (seg, entry) in sut.iter().enumerate() {
                let seg = seg as u32;
                if seg == cur_seg || entry.live_bytes == SUT_FREE {
                    continue;
                }
                if self.geo.segment_start(SegmentIndex(seg)).0 >= frontier {
                    continue;
                }
                let util =
                    ((u64::from(entry.live_bytes) * 100 / seg_bytes).min(100)) as u32;
                if util >= 100 {
                    continue;
                }
                if respect_util_threshold && util > cfg.util_threshold_percent {
                    continue;
                }
                let age = u64::from(ticks.saturating_sub(entry.age).max(1));
                let score = (u64::from(100 - util) * age * 1000 / u64::from(100 + util)).max(1);

                let pos = victims
                    .iter()
                    .position(|v| score > v.score)
                    .unwrap_or(victims.len());
                if pos < cfg.target_segs as usize {
                    victims.insert(pos, Victim { seg, score, util });
                    victims.truncate(cfg.target_segs as usize);
                }
            }
            victims
        };

        let victims = pick(true);
        if victims.is_empty() { pick(false) } else { victims }
    }

    /// Clean one victim: classify via its SSBs, relocate what is live,
    /// seal the relocation summaries, and free the segment. A victim whose
    /// cleaning could not finish is NOT freed; it still holds live blocks
    /// and a later run retries it.
    fn clean_segment(&self, seg: SegmentIndex) -> Result<CleanOutcome> {
        let seg_start = self.geo.segment_start(seg).0;
        let seg_end = self.geo.segment_end(seg).0;
        let mut relocated_inode_blocks: HashSet<u32> = HashSet::new();
        let mut relocated = 0_usize;
        let mut completed = true;

        // A block is an SSB iff the magic matches and the checksum
        // verifies; everything else is payload.
        let mut ssbs: Vec<SsbBlock> = Vec::new();
        for block in seg_start..seg_end {
            let buf = self.cache.bread(BlockNumber(block))?;
            let probed = SsbBlock::probe(&buf.data());
            if let Some(ssb) = probed {
                ssbs.push(ssb);
            }
        }

        'entries: for ssb in &ssbs {
            for entry in &ssb.entries {
                match entry.kind {
                    BlockKind::Inode => {
                        // One entry covers a whole inode block; liveness
                        // comes from the imap, not the entry. Relocate
                        // every inode block the imap still homes here.
                        let targets: Vec<u32> = {
                            let log = self.log.lock();
                            log.imap
                                .iter()
                                .filter(|e| e.is_resident())
                                .map(|e| e.block().0)
                                .filter(|b| (seg_start..seg_end).contains(b))
                                .collect()
                        };
                        for iblk in targets {
                            if !relocated_inode_blocks.insert(iblk) {
                                continue;
                            }
                            match self.relocate_inode_block(iblk) {
                                Ok(()) => relocated += 1,
                                Err(SlfsError::NoSpace) => {
                                    completed = false;
                                    break 'entries;
                                }
                                Err(e) => return Err(e),
                            }
                        }
                    }
                    BlockKind::Data | BlockKind::Indirect => {
                        let imap_entry = {
                            let log = self.log.lock();
                            log.imap.get(entry.inum.0 as usize).copied()
                        };
                        let Some(imap_entry) = imap_entry else {
                            continue;
                        };
                        if !imap_entry.is_resident() {
                            continue; // inode deleted or still in-buffer
                        }
                        if imap_entry.version() != entry.version.truncated() {
                            continue; // overwritten or truncated: dead
                        }

                        let Some(addr) = self.resolve_entry_addr(entry)? else {
                            continue;
                        };
                        if addr == 0 {
                            continue;
                        }
                        if addr >= self.geo.size {
                            warn!(
                                target: "slfs::gc",
                                addr,
                                inum = entry.inum.0,
                                "resolved address outside image, skipping entry"
                            );
                            continue;
                        }
                        if !(seg_start..seg_end).contains(&addr) {
                            continue; // already moved elsewhere
                        }

                        match self.relocate_block(entry, addr) {
                            Ok(()) => relocated += 1,
                            Err(SlfsError::NoSpace) => {
                                completed = false;
                                break 'entries;
                            }
                            Err(e) => return Err(e),
                        }
                    }
                }
            }
        }

        // Image-builder segments carry no SSBs; fall back to walking the
        // imap and every allocated inode's pointers.
        if ssbs.is_empty() && completed {
            match self.safety_scan(seg_start, seg_end, &mut relocated_inode_blocks) {
                Ok(count) => relocated += count,
                Err(SlfsError::NoSpace) => completed = false,
                Err(e) => return Err(e),
            }
        }

        // Seal summaries for the relocations just performed.
        self.flush_ssb_now()?;

        if completed {
            self.free_segment(seg);
        } else {
            warn!(target: "slfs::gc", segment = seg.0, "cleaning stopped early, segment kept");
        }

        Ok(CleanOutcome {
            relocated,
            completed,
        })
    }

    /// Mark a fully cleaned segment free and put it on the ring.
    fn free_segment(&self, seg: SegmentIndex) {
        assert!(seg.0 < self.geo.nsegs, "freeing invalid segment {seg}");
        let mut log = self.log.lock();
        let ticks = log.ticks;
        let entry = &mut log.sut[seg.0 as usize];
        entry.live_bytes = SUT_FREE;
        entry.age = ticks;
        log.free_ring.push_back(seg.0);
        debug!(target: "slfs::gc", segment = seg.0, "segment freed");
    }

    /// Where does this descriptor's block currently live? Follows the
    /// freshest inode image (dirty buffer first, then disk), and the
    /// indirect block for offsets past `NDIRECT`. `None` means the block
    /// is dead or unresolvable; corrupt references are logged and treated
    /// as not present.
    fn resolve_entry_addr(&self, entry: &SsbEntry) -> Result<Option<u32>> {
        let inum = entry.inum.0;
        let bn = entry.offset as usize;

        let image: Option<Dinode> = {
            let dirty = self.dirty.lock();
            dirty.find(inum).map(|e| e.di)
        };
        let image = match image {
            Some(di) => di,
            None => {
                let imap_entry = {
                    let log = self.log.lock();
                    log.imap[inum as usize]
                };
                if !imap_entry.is_resident() {
                    return Ok(None);
                }
                let iblk = imap_entry.block().0;
                if iblk == 0 || iblk >= self.geo.size {
                    warn!(target: "slfs::gc", inum, iblk, "imap points outside image");
                    return Ok(None);
                }
                let buf = self.cache.bread(BlockNumber(iblk))?;
                let parsed = Dinode::read_from_block(&buf.data(), imap_entry.slot() as usize);
                match parsed {
                    Ok(di) => di,
                    Err(e) => {
                        warn!(target: "slfs::gc", inum, iblk, error = %e, "unreadable inode");
                        return Ok(None);
                    }
                }
            }
        };

        if image.itype.is_free() {
            return Ok(None);
        }

        match entry.kind {
            BlockKind::Indirect => Ok(Some(image.indirect())),
            BlockKind::Data if bn < NDIRECT => Ok(Some(image.addrs[bn])),
            BlockKind::Data => {
                let ind = image.indirect();
                if ind == 0 {
                    return Ok(None);
                }
                if ind >= self.geo.size {
                    warn!(target: "slfs::gc", inum, ind, "indirect pointer outside image");
                    return Ok(None);
                }
                let ibn = bn - NDIRECT;
                if ibn >= NINDIRECT {
                    warn!(target: "slfs::gc", inum, offset = bn, "offset beyond indirect range");
                    return Ok(None);
                }
                let buf = self.cache.bread(BlockNumber(ind))?;
                let data = buf.data();
                Ok(Some(read_le_u32(&data, ibn * 4).expect("indirect slot in range")))
            }
            BlockKind::Inode => Ok(None),
        }
    }

    /// Copy a live data/indirect block to the log tail and repoint every
    /// reference: the owning inode's `addrs[]` (dirty buffer preferred,
    /// disk image re-dirtied otherwise), the indirect block for data
    /// reached through it (itself copied first), and any cached in-memory
    /// inode.
    fn relocate_block(&self, entry: &SsbEntry, old_addr: u32) -> Result<()> {
        let inum = entry.inum.0;
        let bn = entry.offset as usize;

        if old_addr == 0 || old_addr >= self.geo.size {
            warn!(target: "slfs::gc", inum, old_addr, "refusing to relocate invalid block");
            return Ok(());
        }
        if bn >= MAX_FILE_BLOCKS {
            warn!(target: "slfs::gc", inum, offset = bn, "descriptor offset out of range");
            return Ok(());
        }

        // Relocation carries the inode's CURRENT version, not the stale
        // descriptor's, so the new SSB entry stays live.
        let imap_entry = {
            let log = self.log.lock();
            log.imap[inum as usize]
        };
        if !imap_entry.is_resident() {
            return Ok(()); // freed while cleaning; nothing to move
        }
        let current_version = Version(u32::from(imap_entry.version()));

        let old_bytes = {
            let buf = self.cache.bread(BlockNumber(old_addr))?;
            let data = buf.data();
            data.clone()
        };

        let new_block = {
            let mut log = self.log.lock();
            let Some(block) = log.advance_tail_internal() else {
                return Err(SlfsError::NoSpace);
            };
            log.push_ssb(SsbEntry {
                kind: entry.kind,
                inum: entry.inum,
                offset: entry.offset,
                version: current_version,
            });
            block
        };

        self.write_block_bytes(new_block, &old_bytes)?;
        {
            let mut log = self.log.lock();
            log.update_usage(new_block, BLOCK_BYTES);
            log.update_usage(old_addr, -BLOCK_BYTES);
        }

        // Repoint the owner.
        let direct_or_indirect = bn < NDIRECT || entry.kind == BlockKind::Indirect;
        let mut new_ind_for_cache = 0_u32;

        if direct_or_indirect {
            self.repoint_owner(inum, current_version, |di| {
                if entry.kind == BlockKind::Indirect {
                    di.addrs[NDIRECT] = new_block;
                } else {
                    di.addrs[bn] = new_block;
                }
            })?;
        } else {
            // Data reached through the indirect block: copy the indirect
            // block too and patch its slot.
            let image = self.owner_image(inum)?;
            let Some(image) = image else {
                return Ok(());
            };
            let old_ind = image.indirect();
            if old_ind != 0 {
                if old_ind >= self.geo.size {
                    warn!(target: "slfs::gc", inum, old_ind, "indirect pointer outside image");
                    return Ok(());
                }
                let ibn = bn - NDIRECT;
                let new_ind = {
                    let mut log = self.log.lock();
                    let Some(block) = log.advance_tail_internal() else {
                        return Err(SlfsError::NoSpace);
                    };
                    log.push_ssb(SsbEntry {
                        kind: BlockKind::Indirect,
                        inum: entry.inum,
                        offset: NDIRECT as u32,
                        version: current_version,
                    });
                    block
                };

                let mut ind_bytes = {
                    let buf = self.cache.bread(BlockNumber(old_ind))?;
                    let data = buf.data();
                    data.clone()
                };
                write_le_u32(&mut ind_bytes, ibn * 4, new_block);
                self.write_block_bytes(new_ind, &ind_bytes)?;

                {
                    let mut log = self.log.lock();
                    log.update_usage(new_ind, BLOCK_BYTES);
                    log.update_usage(old_ind, -BLOCK_BYTES);
                }

                self.repoint_owner(inum, current_version, |di| {
                    di.addrs[NDIRECT] = new_ind;
                })?;
                new_ind_for_cache = new_ind;
            }
        }

        // Keep any cached in-memory inode coherent. The state lock is a
        // short leaf lock, so this is safe even when the owner's sleep
        // lock is held higher up this very call stack.
        if let Some(cached) = self.icache.lookup(inum) {
            cached.with_state(|s| {
                if !s.loaded {
                    return;
                }
                if entry.kind == BlockKind::Indirect {
                    s.addrs[NDIRECT] = new_block;
                } else if bn < NDIRECT {
                    s.addrs[bn] = new_block;
                } else if new_ind_for_cache != 0 {
                    s.addrs[NDIRECT] = new_ind_for_cache;
                }
            });
        }

        Ok(())
    }

    /// Latest image of an inode for the cleaner: dirty buffer first, then
    /// the on-disk copy. `None` when freed or unreadable.
    fn owner_image(&self, inum: u32) -> Result<Option<Dinode>> {
        {
            let dirty = self.dirty.lock();
            if let Some(entry) = dirty.find(inum) {
                return Ok((!entry.di.itype.is_free()).then_some(entry.di));
            }
        }
        let imap_entry = {
            let log = self.log.lock();
            log.imap[inum as usize]
        };
        if !imap_entry.is_resident() {
            return Ok(None);
        }
        let iblk = imap_entry.block().0;
        if iblk == 0 || iblk >= self.geo.size {
            warn!(target: "slfs::gc", inum, iblk, "imap points outside image");
            return Ok(None);
        }
        let buf = self.cache.bread(BlockNumber(iblk))?;
        let parsed = Dinode::read_from_block(&buf.data(), imap_entry.slot() as usize);
        match parsed {
            Ok(di) if !di.itype.is_free() => Ok(Some(di)),
            Ok(_) => Ok(None),
            Err(e) => {
                warn!(target: "slfs::gc", inum, iblk, error = %e, "unreadable inode");
                Ok(None)
            }
        }
    }

    /// Apply a pointer fix to the owning inode: in place in the dirty
    /// buffer when present, else read-modify-redirty the on-disk image.
    fn repoint_owner(
        &self,
        inum: u32,
        version: Version,
        fix: impl Fn(&mut Dinode),
    ) -> Result<()> {
        {
            let mut dirty = self.dirty.lock();
            if let Some(entry) = dirty.active.iter_mut().find(|e| e.inum == inum) {
                if !entry.di.itype.is_free() {
                    fix(&mut entry.di);
                }
                return Ok(());
            }
        }

        let Some(mut image) = self.owner_image(inum)? else {
            return Ok(());
        };
        fix(&mut image);
        self.iupdate_raw(inum, version, image)
    }

    /// Copy a whole inode block to the log tail, merging any newer images
    /// from the dirty buffer, then rewrite every imap entry that referenced
    /// the old block.
    fn relocate_inode_block(&self, old_block: u32) -> Result<()> {
        if old_block == 0 || old_block >= self.geo.size {
            warn!(target: "slfs::gc", old_block, "refusing to relocate invalid inode block");
            return Ok(());
        }

        // Everybody homed in this block, slot by slot.
        let targets: Vec<(u32, u8)> = {
            let log = self.log.lock();
            log.imap
                .iter()
                .enumerate()
                .filter(|(_, e)| e.is_resident() && e.block().0 == old_block)
                .map(|(inum, e)| (inum as u32, e.slot()))
                .collect()
        };
        if targets.is_empty() {
            return Ok(());
        }

        let mut bytes = {
            let buf = self.cache.bread(BlockNumber(old_block))?;
            let data = buf.data();
            data.clone()
        };

        let new_block = {
            let mut log = self.log.lock();
            let Some(block) = log.advance_tail_internal() else {
                return Err(SlfsError::NoSpace);
            };
            log.push_ssb(SsbEntry {
                kind: BlockKind::Inode,
                inum: InodeNumber(targets[0].0),
                offset: 0,
                version: Version(0),
            });
            block
        };

        // Any in-flight image beats the on-disk copy.
        {
            let dirty = self.dirty.lock();
            for entry in dirty.active.iter().chain(dirty.flushing.iter()) {
                if let Some((_, slot)) = targets.iter().find(|(inum, _)| *inum == entry.inum) {
                    entry.di.write_to_block(&mut bytes, *slot as usize);
                }
            }
        }

        self.write_block_bytes(new_block, &bytes)?;

        {
            let mut log = self.log.lock();
            log.update_usage(new_block, BLOCK_BYTES);
            log.update_usage(old_block, -BLOCK_BYTES);
            for (inum, _) in &targets {
                let current = log.imap[*inum as usize];
                if current.is_resident() && current.block().0 == old_block {
                    log.imap[*inum as usize] = slfs_types::ImapEntry::encode(
                        BlockNumber(new_block),
                        Version(u32::from(current.version())),
                        current.slot(),
                    );
                }
            }
        }

        debug!(target: "slfs::gc", old_block, new_block, inodes = targets.len(), "inode block relocated");
        Ok(())
    }

    /// Full liveness walk for segments with no summaries: relocate imap
    /// blocks homed here, then chase every allocated inode's direct and
    /// indirect pointers into the victim.
    fn safety_scan(
        &self,
        seg_start: u32,
        seg_end: u32,
        relocated_inode_blocks: &mut HashSet<u32>,
    ) -> Result<usize> {
        let mut count = 0_usize;

        let inode_blocks: Vec<u32> = {
            let log = self.log.lock();
            log.imap
                .iter()
                .filter(|e| e.is_resident())
                .map(|e| e.block().0)
                .filter(|b| (seg_start..seg_end).contains(b))
                .collect()
        };
        for iblk in inode_blocks {
            if relocated_inode_blocks.insert(iblk) {
                self.relocate_inode_block(iblk)?;
                count += 1;
            }
        }

        let inums: Vec<u32> = {
            let log = self.log.lock();
            (0..log.imap.len() as u32)
                .filter(|i| log.imap[*i as usize].is_resident())
                .collect()
        };

        for inum in inums {
            let Some(image) = self.owner_image(inum)? else {
                continue;
            };
            let version = {
                let log = self.log.lock();
                Version(u32::from(log.imap[inum as usize].version()))
            };

            for bn in 0..NDIRECT {
                let addr = {
                    let Some(image) = self.owner_image(inum)? else {
                        break;
                    };
                    image.addrs[bn]
                };
                if addr != 0 && (seg_start..seg_end).contains(&addr) {
                    let synthesized = SsbEntry {
                        kind: BlockKind::Data,
                        inum: InodeNumber(inum),
                        offset: bn as u32,
                        version,
                    };
                    self.relocate_block(&synthesized, addr)?;
                    count += 1;
                }
            }

            let mut ind = image.indirect();
            if ind != 0 && (seg_start..seg_end).contains(&ind) {
                let synthesized = SsbEntry {
                    kind: BlockKind::Indirect,
                    inum: InodeNumber(inum),
                    offset: NDIRECT as u32,
                    version,
                };
                self.relocate_block(&synthesized, ind)?;
                count += 1;
                ind = self.owner_image(inum)?.map_or(0, |di| di.indirect());
            }

            if ind != 0 && ind < self.geo.size {
                for ibn in 0..NINDIRECT {
                    // Re-resolve each round: relocations may copy the
                    // indirect block out from under the walk.
                    let Some(image) = self.owner_image(inum)? else {
                        break;
                    };
                    let ind_now = image.indirect();
                    if ind_now == 0 || ind_now >= self.geo.size {
                        break;
                    }
                    let addr = {
                        let buf = self.cache.bread(BlockNumber(ind_now))?;
                        let data = buf.data();
                        read_le_u32(&data, ibn * 4).expect("indirect slot in range")
                    };
                    if addr != 0 && (seg_start..seg_end).contains(&addr) {
                        let synthesized = SsbEntry {
                            kind: BlockKind::Data,
                            inum: InodeNumber(inum),
                            offset: (NDIRECT + ibn) as u32,
                            version,
                        };
                        self.relocate_block(&synthesized, addr)?;
                        count += 1;
                    }
                }
            }
        }

        Ok(count)
    }
}
