//! Offline image formatter.
//!
//! Lays down a fresh image: superblock at block 1, both checkpoint slots,
//! and a minimal log containing the root inode and the initial imap. The
//! builder writes no SUT and no SSBs; the runtime starts from zeroed usage
//! counters and the cleaner's safety scan handles builder segments.

use slfs_block::BlockDevice;
use slfs_error::{Result, SlfsError};
use slfs_ondisk::{Checkpoint, Dinode, InodeType, Superblock};
use slfs_types::{
    BLOCK_SIZE, BlockNumber, CHECKPOINT0_BLOCK, CHECKPOINT1_BLOCK, IMAP_ENTRIES_PER_BLOCK,
    ImapEntry, InodeNumber, SLFS_MAGIC, SUPERBLOCK_BLOCK, Version,
};
use std::sync::Arc;
use tracing::info;

/// First log block: boot, superblock, and the two checkpoint slots come
/// before it.
const LOG_START: u32 = 4;

/// Geometry requested of a fresh image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FormatOptions {
    /// Image size in blocks.
    pub size_blocks: u32,
    /// Segment size in blocks.
    pub segment_blocks: u32,
    /// Maximum inode count.
    pub ninodes: u32,
}

impl Default for FormatOptions {
    fn default() -> Self {
        Self {
            size_blocks: 20_000,
            segment_blocks: 32,
            ninodes: 200,
        }
    }
}

/// Format `dev` as an empty SLFS image and return its superblock.
///
/// The root inode (inum 1) is pre-allocated as an empty directory, so the
/// first runtime `ialloc` hands out inum 2.
pub fn format(dev: &Arc<dyn BlockDevice>, opts: &FormatOptions) -> Result<Superblock> {
    if dev.block_size() != BLOCK_SIZE as u32 {
        return Err(SlfsError::InvalidArgument(format!(
            "device block size {} != {BLOCK_SIZE}",
            dev.block_size()
        )));
    }
    if u64::from(opts.size_blocks) > dev.block_count() {
        return Err(SlfsError::InvalidArgument(format!(
            "image of {} blocks exceeds device of {} blocks",
            opts.size_blocks,
            dev.block_count()
        )));
    }
    if opts.segment_blocks < 8 {
        return Err(SlfsError::InvalidArgument(
            "segments below 8 blocks leave no room for payload".into(),
        ));
    }

    let sb = Superblock {
        magic: SLFS_MAGIC,
        size: opts.size_blocks,
        nsegs: (opts.size_blocks - LOG_START) / opts.segment_blocks,
        segsize: opts.segment_blocks,
        segstart: LOG_START,
        ninodes: opts.ninodes,
        checkpoint0: CHECKPOINT0_BLOCK,
        checkpoint1: CHECKPOINT1_BLOCK,
    };
    // Round-trip through the codec so the same validation that guards
    // mounting rejects bad geometry here.
    Superblock::parse(&sb.to_block()).map_err(|e| SlfsError::Format(format!("geometry: {e}")))?;
    let geo = sb.geometry();

    dev.write_block(BlockNumber(0), &[0_u8; BLOCK_SIZE])?;
    dev.write_block(BlockNumber(SUPERBLOCK_BLOCK), &sb.to_block())?;

    let mut tail = LOG_START;
    let mut imap = vec![ImapEntry::FREE; opts.ninodes as usize];

    // Root inode, packed alone into the first log block.
    let mut inode_block = vec![0_u8; BLOCK_SIZE];
    let mut root = Dinode::new(InodeType::Dir);
    root.nlink = 1;
    root.write_to_block(&mut inode_block, 0);
    dev.write_block(BlockNumber(tail), &inode_block)?;
    imap[InodeNumber::ROOT.0 as usize] = ImapEntry::encode(BlockNumber(tail), Version(0), 0);
    tail += 1;

    // Initial imap.
    let mut cp = Checkpoint::empty();
    cp.imap_nblocks = geo.imap_nblocks();
    for i in 0..cp.imap_nblocks as usize {
        let bytes = slfs_ondisk::imap_block_to_bytes(&imap, i * IMAP_ENTRIES_PER_BLOCK);
        dev.write_block(BlockNumber(tail), &bytes)?;
        cp.imap_addrs[i] = tail;
        tail += 1;
    }

    cp.timestamp = 1;
    cp.log_tail = tail;
    cp.cur_seg = (tail - geo.segstart) / geo.segsize;
    cp.seg_offset = (tail - geo.segstart) % geo.segsize;
    cp.sut_nblocks = 0;
    cp.valid = 1;
    dev.write_block(BlockNumber(sb.checkpoint0), &cp.to_block())?;
    dev.write_block(BlockNumber(sb.checkpoint1), &[0_u8; BLOCK_SIZE])?;

    dev.sync()?;

    info!(
        target: "slfs::mkfs",
        size = sb.size,
        nsegs = sb.nsegs,
        segsize = sb.segsize,
        ninodes = sb.ninodes,
        log_tail = tail,
        "image formatted"
    );
    Ok(sb)
}
