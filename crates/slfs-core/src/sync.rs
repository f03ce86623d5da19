//! Sync: persist the volatile state in fixed order.
//!
//! drain dirty inodes → flush the SSB → persist the SUT (partial update) →
//! write the imap → write the checkpoint. One sync runs at a time; syncs
//! are skipped while the cleaner runs (it syncs itself on completion).

use crate::Slfs;
use slfs_error::{Result, SlfsError};
use slfs_ondisk::{imap_block_to_bytes, sut_block_to_bytes};
use slfs_types::{BlockNumber, IMAP_ENTRIES_PER_BLOCK, SUT_ENTRIES_PER_BLOCK};
use tracing::{debug, trace};

impl Slfs {
    /// Flush everything volatile and write a fresh checkpoint.
    ///
    /// Idempotent and safely re-entrant after failure; a sync that finds
    /// another sync (or the cleaner) in flight returns without doing
    /// anything.
    pub fn sync(&self) -> Result<()> {
        {
            let mut log = self.log.lock();
            if log.syncing || log.gc_running {
                return Ok(());
            }
            log.syncing = true;
        }

        let result = self.sync_inner();
        self.log.lock().syncing = false;
        result
    }

    fn sync_inner(&self) -> Result<()> {
        self.flush_dirty_inodes()?;
        self.flush_ssb_now()?;
        self.write_sut()?;
        self.write_imap()?;
        self.write_checkpoint()?;
        Ok(())
    }

    /// Persist the SUT, skipping blocks whose content has not changed
    /// since the previous image (partial update).
    fn write_sut(&self) -> Result<()> {
        let (snapshot, nblocks, old_addrs) = {
            let mut log = self.log.lock();
            let nblocks = self.geo.sut_nblocks();
            log.cp.sut_nblocks = nblocks;
            (log.sut.clone(), nblocks as usize, log.cp.sut_addrs)
        };

        for i in 0..nblocks {
            let bytes = sut_block_to_bytes(&snapshot, i * SUT_ENTRIES_PER_BLOCK);

            let unchanged = {
                let old_addr = old_addrs[i];
                old_addr != 0 && {
                    let buf = self.cache.bread(BlockNumber(old_addr))?;
                    let data = buf.data();
                    *data == bytes
                }
            };
            if unchanged {
                continue;
            }

            let block = {
                let mut log = self.log.lock();
                let Some(block) = log.advance_tail_internal() else {
                    return Err(SlfsError::NoSpace);
                };
                log.cp.sut_addrs[i] = block;
                block
            };
            self.write_block_bytes(block, &bytes)?;
            trace!(target: "slfs::sync", block, index = i, "SUT block written");
        }
        Ok(())
    }

    /// Write the full imap to fresh log blocks and record them in the
    /// checkpoint.
    fn write_imap(&self) -> Result<()> {
        let (snapshot, nblocks) = {
            let mut log = self.log.lock();
            let nblocks = self.geo.imap_nblocks();
            log.cp.imap_nblocks = nblocks;
            (log.imap.clone(), nblocks as usize)
        };

        for i in 0..nblocks {
            let bytes = imap_block_to_bytes(&snapshot, i * IMAP_ENTRIES_PER_BLOCK);
            let block = {
                let mut log = self.log.lock();
                let Some(block) = log.advance_tail_internal() else {
                    return Err(SlfsError::NoSpace);
                };
                log.cp.imap_addrs[i] = block;
                block
            };
            self.write_block_bytes(block, &bytes)?;
            trace!(target: "slfs::sync", block, index = i, "imap block written");
        }
        Ok(())
    }

    /// Stamp and write the checkpoint record. The serialized block carries
    /// the timestamp at both ends; recovery only trusts a slot whose
    /// stamps agree.
    fn write_checkpoint(&self) -> Result<()> {
        let cp = {
            let mut log = self.log.lock();
            log.cp.timestamp = log.cp.timestamp.wrapping_add(1);
            log.cp.log_tail = log.tail;
            log.cp.cur_seg = log.current_segment().0;
            log.cp.seg_offset = log.seg_offset();
            log.cp.valid = 1;
            log.ticks = log.ticks.wrapping_add(1);
            log.cp
        };

        self.write_block_bytes(self.sb.checkpoint0, &cp.to_block())?;
        self.cache.sync()?;

        debug!(
            target: "slfs::sync",
            timestamp = cp.timestamp,
            log_tail = cp.log_tail,
            "checkpoint written"
        );
        Ok(())
    }
}
