#![forbid(unsafe_code)]
//! End-to-end scenarios: create/write/read, overwrite liveness, delete and
//! reuse, cleaning under pressure, indirect-block copy-on-write, and
//! checkpoint recovery.

use slfs_block::{BlockDevice, ByteBlockDevice, MemDevice};
use slfs_core::{
    BlockKind, FormatOptions, GcConfig, InodeHandle, InodeType, Slfs, SsbEntry, Superblock,
};
use slfs_ondisk::{Checkpoint, Dinode, SsbBlock};
use slfs_types::{BLOCK_SIZE, BlockNumber, InodeNumber, NDIRECT, Version};
use std::sync::Arc;

fn make_device(blocks: u32) -> Arc<dyn BlockDevice> {
    let dev = MemDevice::new(u64::from(blocks) * BLOCK_SIZE as u64);
    Arc::new(ByteBlockDevice::new(dev, BLOCK_SIZE as u32).expect("block device"))
}

fn fresh_fs(opts: FormatOptions, gc: GcConfig) -> (Arc<dyn BlockDevice>, Arc<Slfs>) {
    let dev = make_device(opts.size_blocks);
    slfs_core::format(&dev, &opts).expect("format");
    let fs = Slfs::mount(Arc::clone(&dev), gc).expect("mount");
    (dev, fs)
}

fn small_opts() -> FormatOptions {
    FormatOptions {
        size_blocks: 2_000,
        segment_blocks: 32,
        ninodes: 64,
    }
}

fn create_file(fs: &Slfs) -> InodeHandle {
    let ip = fs.ialloc(InodeType::File).expect("ialloc");
    let lock = fs.ilock(&ip).expect("ilock");
    fs.set_nlink(&lock, 1).expect("set_nlink");
    drop(lock);
    ip
}

fn write_file(fs: &Slfs, ip: &InodeHandle, data: &[u8], off: u32) {
    let lock = fs.ilock(ip).expect("ilock");
    let written = fs.writei(&lock, data, off).expect("writei");
    assert_eq!(written, data.len());
}

fn read_file(fs: &Slfs, ip: &InodeHandle, len: usize, off: u32) -> Vec<u8> {
    let lock = fs.ilock(ip).expect("ilock");
    let mut buf = vec![0_u8; len];
    let read = fs.readi(&lock, &mut buf, off).expect("readi");
    buf.truncate(read);
    buf
}

fn delete_file(fs: &Slfs, ip: InodeHandle) {
    let lock = fs.ilock(&ip).expect("ilock");
    fs.set_nlink(&lock, 0).expect("set_nlink");
    drop(lock);
    fs.iput(ip).expect("iput");
}

/// Deterministic content keyed by a seed.
fn pattern(seed: u32, len: usize) -> Vec<u8> {
    (0..len)
        .map(|i| ((seed.wrapping_mul(31).wrapping_add(i as u32)) % 251) as u8)
        .collect()
}

/// On-disk image of an inode, as the imap sees it (flushed state only).
fn dinode_of(fs: &Slfs, inum: InodeNumber) -> Dinode {
    let entry = fs.imap_entry(inum).expect("imap entry");
    assert!(entry.is_resident(), "inode {inum} not flushed");
    let buf = fs.buffer_cache().bread(entry.block()).expect("bread");
    let data = buf.data();
    Dinode::read_from_block(&data, entry.slot() as usize).expect("dinode")
}

// ── Scenario 1: create → write → read ───────────────────────────────────────

#[test]
fn create_write_read() {
    let (_dev, fs) = fresh_fs(small_opts(), GcConfig::default());

    let ip = fs.ialloc(InodeType::File).expect("ialloc");
    // Root holds inum 1; the first runtime inode is 2.
    assert_eq!(ip.inum(), InodeNumber(2));

    let lock = fs.ilock(&ip).expect("ilock");
    fs.set_nlink(&lock, 1).expect("set_nlink");

    let before = fs.imap_entry(InodeNumber(2)).expect("imap");
    assert!(before.is_pending(), "unflushed inode lives in the buffer");

    assert_eq!(fs.writei(&lock, b"HELLO", 0).expect("writei"), 5);
    let mut buf = [0_u8; 5];
    assert_eq!(fs.readi(&lock, &mut buf, 0).expect("readi"), 5);
    assert_eq!(&buf, b"HELLO");

    let data_seg = fs
        .geometry()
        .segment_of(fs.block_address(&lock, 0).expect("addr").expect("mapped"))
        .expect("segment");
    drop(lock);

    fs.sync().expect("sync");

    // The flush moved the inode out of the buffer and into the log.
    let after = fs.imap_entry(InodeNumber(2)).expect("imap");
    assert!(after.is_resident());
    assert_ne!(after, before);

    // Data block + inode block both count as live.
    let usage = fs.segment_usage_of(data_seg).expect("sut");
    assert!(
        usage.live_bytes >= 2 * BLOCK_SIZE as u32,
        "expected at least data + inode liveness, got {}",
        usage.live_bytes
    );
}

// ── Scenario 2: overwrite kills the old block, GC reclaims it ───────────────

#[test]
fn overwrite_marks_old_block_dead_and_gc_frees_it() {
    let (_dev, fs) = fresh_fs(small_opts(), GcConfig::default());
    let ip = create_file(&fs);

    // Fill well past the first segment so the overwrite lands elsewhere.
    let body = pattern(7, 40 * BLOCK_SIZE);
    write_file(&fs, &ip, &body, 0);

    let lock = fs.ilock(&ip).expect("ilock");
    let first_addr = fs
        .block_address(&lock, 0)
        .expect("addr")
        .expect("mapped");
    let first_seg = fs.geometry().segment_of(first_addr).expect("segment");
    drop(lock);
    let live_before = fs.segment_usage_of(first_seg).expect("sut").live_bytes;

    // Overwrite the first block; its old copy dies.
    let fresh = pattern(8, BLOCK_SIZE);
    write_file(&fs, &ip, &fresh, 0);

    let live_after = fs.segment_usage_of(first_seg).expect("sut").live_bytes;
    assert!(
        live_after <= live_before - BLOCK_SIZE as u32,
        "old copy still counted live: {live_before} -> {live_after}"
    );

    let lock = fs.ilock(&ip).expect("ilock");
    let moved = fs
        .block_address(&lock, 0)
        .expect("addr")
        .expect("mapped");
    drop(lock);
    assert_ne!(moved, first_addr, "copy-on-write must move the block");

    // Clean until the victim is recycled; every block it still held live
    // moves out first.
    fs.sync().expect("sync");
    for _ in 0..fs.geometry().nsegs {
        if fs.segment_usage_of(first_seg).expect("sut").is_free() {
            break;
        }
        fs.run_gc().expect("gc");
    }
    assert!(
        fs.segment_usage_of(first_seg).expect("sut").is_free(),
        "victim segment was never freed"
    );

    // No data was harmed.
    let mut expect = body;
    expect[..BLOCK_SIZE].copy_from_slice(&fresh);
    assert_eq!(read_file(&fs, &ip, expect.len(), 0), expect);
}

// ── Scenario 3: delete, then reuse of the inum sees none of the old data ────

#[test]
fn delete_frees_blocks_and_reuse_is_clean() {
    let (_dev, fs) = fresh_fs(small_opts(), GcConfig::default());
    let ip = create_file(&fs);
    let inum = ip.inum();

    write_file(&fs, &ip, &pattern(3, 20 * 1024), 0);

    // Truncate bumps the version so stale summaries stop matching.
    let lock = fs.ilock(&ip).expect("ilock");
    let v_before = fs.inode_version(&lock);
    fs.truncate(&lock).expect("truncate");
    let v_after = fs.inode_version(&lock);
    assert_eq!(v_after, Version(v_before.0 + 1));
    assert_eq!(fs.stati(&lock).size, 0);
    drop(lock);

    delete_file(&fs, ip);
    assert!(
        fs.imap_entry(inum).expect("imap").is_free(),
        "imap slot must clear on free"
    );

    // The slot is recycled; nothing of the old file shows through it.
    let again = fs.ialloc(InodeType::File).expect("ialloc");
    assert_eq!(again.inum(), inum);
    let lock = fs.ilock(&again).expect("ilock");
    fs.set_nlink(&lock, 1).expect("set_nlink");
    assert_eq!(fs.stati(&lock).size, 0);
    for bn in 0..NDIRECT as u32 {
        assert_eq!(fs.block_address(&lock, bn).expect("addr"), None);
    }
    let mut buf = [0_u8; 16];
    assert_eq!(fs.readi(&lock, &mut buf, 0).expect("readi"), 0);
}

// ── Scenario 4: cleaning under pressure, no data loss ───────────────────────

#[test]
fn gc_under_pressure_preserves_data() {
    let gc = GcConfig {
        threshold_percent: 30,
        target_segs: 4,
        util_threshold_percent: 90,
    };
    let (_dev, fs) = fresh_fs(
        FormatOptions {
            size_blocks: 2_000,
            segment_blocks: 32,
            ninodes: 64,
        },
        gc,
    );

    // ~60 usable segments. Ten 32 KiB files reach well past the trigger
    // threshold.
    let file_bytes = 32 * 1024;
    let mut files: Vec<(u32, Option<InodeHandle>)> = Vec::new();
    for seed in 0..10_u32 {
        let ip = create_file(&fs);
        write_file(&fs, &ip, &pattern(seed, file_bytes), 0);
        files.push((seed, Some(ip)));
    }
    fs.sync().expect("sync");

    // Delete every other file, opening dead space across many segments.
    for (seed, slot) in files.iter_mut() {
        if *seed % 2 == 1 {
            delete_file(&fs, slot.take().expect("handle"));
        }
    }

    let report = fs.run_gc().expect("gc");
    assert!(report.completed, "cleaner must finish with space available");
    assert!(
        fs.free_segment_count() >= gc.target_segs as usize,
        "expected at least {} free segments, have {}",
        gc.target_segs,
        fs.free_segment_count()
    );

    // Keep writing; recycled segments get consumed.
    for seed in 10..14_u32 {
        let ip = create_file(&fs);
        write_file(&fs, &ip, &pattern(seed, file_bytes), 0);
        files.push((seed, Some(ip)));
    }

    // Every surviving file reads back exactly.
    for (seed, slot) in &files {
        if let Some(ip) = slot {
            assert_eq!(
                read_file(&fs, ip, file_bytes, 0),
                pattern(*seed, file_bytes),
                "file {seed} corrupted"
            );
        }
    }
}

// ── Scenario 5: indirect-block copy-on-write through the cleaner ────────────

#[test]
fn cleaner_relocates_indirect_block() {
    let (dev, fs) = fresh_fs(small_opts(), GcConfig::default());
    let ip = create_file(&fs);
    let inum = ip.inum();

    // 16 KiB + 16 KiB forces the single indirect block into use.
    let half = 16 * 1024;
    let first = pattern(21, half);
    let second = pattern(22, half);
    write_file(&fs, &ip, &first, 0);
    write_file(&fs, &ip, &second, half as u32);
    fs.sync().expect("sync");

    let old_ind = dinode_of(&fs, inum).indirect();
    assert_ne!(old_ind, 0, "file this large must use the indirect block");
    let ind_seg = fs
        .geometry()
        .segment_of(BlockNumber(old_ind))
        .expect("segment");

    // Park the tail elsewhere so the indirect's segment is a candidate.
    let filler = create_file(&fs);
    write_file(&fs, &filler, &pattern(23, 64 * 1024), 0);
    fs.sync().expect("sync");

    for _ in 0..fs.geometry().nsegs {
        if fs.segment_usage_of(ind_seg).expect("sut").is_free() {
            break;
        }
        fs.run_gc().expect("gc");
    }
    assert!(
        fs.segment_usage_of(ind_seg).expect("sut").is_free(),
        "segment holding the indirect block was never cleaned"
    );

    // The inode now names a relocated indirect block, and an INDIRECT
    // summary entry for it exists somewhere in the log.
    let new_ind = dinode_of(&fs, inum).indirect();
    assert_ne!(new_ind, old_ind, "indirect block must have moved");

    let geo = fs.geometry();
    let mut saw_indirect_entry = false;
    for block in geo.segstart..geo.log_end() {
        let buf = dev.read_block(BlockNumber(block)).expect("read");
        if let Some(ssb) = SsbBlock::probe(buf.as_slice()) {
            if ssb
                .entries
                .iter()
                .any(|e| e.kind == BlockKind::Indirect && e.inum == inum)
            {
                saw_indirect_entry = true;
                break;
            }
        }
    }
    assert!(saw_indirect_entry, "no INDIRECT summary entry found");

    // The tail half reads back intact through the new indirect block.
    assert_eq!(read_file(&fs, &ip, half, half as u32), second);
    assert_eq!(read_file(&fs, &ip, half, 0), first);
}

// ── Scenario 6: recovery sees exactly the checkpointed state ────────────────

#[test]
fn recovery_follows_last_checkpoint() {
    let opts = FormatOptions {
        size_blocks: 4_000,
        segment_blocks: 128,
        ninodes: 64,
    };
    let (dev, fs) = fresh_fs(opts, GcConfig::default());

    // Three files, checkpointed.
    let mut kept = Vec::new();
    for seed in 0..3_u32 {
        let ip = create_file(&fs);
        write_file(&fs, &ip, &pattern(seed, 2 * BLOCK_SIZE), 0);
        kept.push((seed, ip.inum()));
    }
    fs.sync().expect("sync");

    // Two more files, NOT checkpointed: small enough to trigger no
    // internal sync (dirty buffer stays under a block's worth, the tail
    // stays clear of the segment end).
    let lost_a = create_file(&fs);
    let lost_b = create_file(&fs);
    write_file(&fs, &lost_a, &pattern(40, BLOCK_SIZE), 0);
    write_file(&fs, &lost_b, &pattern(41, BLOCK_SIZE), 0);
    let lost_inums = [lost_a.inum(), lost_b.inum()];

    // Crash: drop the instance without syncing, remount the device.
    drop((lost_a, lost_b));
    drop(fs);
    let fs = Slfs::mount(Arc::clone(&dev), GcConfig::default()).expect("remount");

    // The checkpointed files are all there, byte for byte.
    for (seed, inum) in &kept {
        let ip = fs.iget(*inum);
        assert_eq!(read_file(&fs, &ip, 2 * BLOCK_SIZE, 0), pattern(*seed, 2 * BLOCK_SIZE));
    }

    // The unsynced files are gone without a trace.
    for inum in lost_inums {
        assert!(
            fs.imap_entry(inum).expect("imap").is_free(),
            "post-checkpoint inode {inum} survived the crash"
        );
    }

    // And the recovered tail matches the checkpoint, not the crashed run.
    let cp = fs.checkpoint();
    assert!(cp.is_valid());
    assert_eq!(fs.log_tail(), BlockNumber(cp.log_tail));
}

// ── Append-order and summary-coverage properties ────────────────────────────

#[test]
fn allocations_append_monotonically_and_seal_summaries() {
    let (dev, fs) = fresh_fs(small_opts(), GcConfig::default());
    let geo = fs.geometry();

    let mut last = 0_u32;
    let mut crossed_segments = Vec::new();
    for i in 0..100_u32 {
        let block = fs
            .allocate(SsbEntry {
                kind: BlockKind::Data,
                inum: InodeNumber(2),
                offset: i,
                version: Version(0),
            })
            .expect("allocate")
            .0;
        // Sequential phase: strictly increasing, never the reserved slot.
        assert!(block > last || last == 0, "tail went backwards: {last} -> {block}");
        assert_ne!(
            geo.offset_in_segment(BlockNumber(block)),
            geo.segsize - 1,
            "payload landed on the reserved summary slot"
        );
        if last != 0 {
            let prev_seg = geo.segment_of(BlockNumber(last)).expect("segment");
            let seg = geo.segment_of(BlockNumber(block)).expect("segment");
            if seg != prev_seg {
                crossed_segments.push(prev_seg);
            }
        }
        last = block;
    }

    assert!(
        !crossed_segments.is_empty(),
        "100 allocations must cross at least one 32-block segment"
    );
    // Every completed segment carries a verifiable summary for its payload
    // (flushed either into the reserved final slot or by the boundary
    // sync, but always within the segment).
    for seg in crossed_segments {
        let mut found = false;
        for block in geo.segment_start(seg).0..geo.segment_end(seg).0 {
            let buf = dev.read_block(BlockNumber(block)).expect("read");
            if SsbBlock::probe(buf.as_slice()).is_some() {
                found = true;
                break;
            }
        }
        assert!(found, "segment {seg} has no summary block");
    }
}

// ── File-backed image round trip ────────────────────────────────────────────

#[test]
fn file_backed_image_survives_reopen() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("slfs.img");
    let opts = small_opts();

    let dev = slfs_block::FileByteDevice::create(
        &path,
        u64::from(opts.size_blocks) * BLOCK_SIZE as u64,
    )
    .expect("create");
    let dev: Arc<dyn BlockDevice> =
        Arc::new(ByteBlockDevice::new(dev, BLOCK_SIZE as u32).expect("block device"));
    slfs_core::format(&dev, &opts).expect("format");

    let inum;
    {
        let fs = Slfs::mount(dev, GcConfig::default()).expect("mount");
        let ip = create_file(&fs);
        inum = ip.inum();
        write_file(&fs, &ip, &pattern(99, 3 * BLOCK_SIZE), 0);
        fs.sync().expect("sync");
    }

    // Fresh process: reopen the file from its path.
    let reopened = slfs_block::open_block_device(&path).expect("open");
    let fs = Slfs::mount(Arc::new(reopened), GcConfig::default()).expect("remount");
    let ip = fs.iget(inum);
    assert_eq!(read_file(&fs, &ip, 3 * BLOCK_SIZE, 0), pattern(99, 3 * BLOCK_SIZE));
}

// ── Checkpoint slot arbitration ─────────────────────────────────────────────

#[test]
fn torn_checkpoint_slot_is_rejected_at_mount() {
    let (dev, fs) = fresh_fs(small_opts(), GcConfig::default());
    let ip = create_file(&fs);
    write_file(&fs, &ip, &pattern(9, 4 * BLOCK_SIZE), 0);
    fs.sync().expect("sync");
    let sb: Superblock = fs.superblock();
    drop(ip);
    drop(fs);

    // Tear checkpoint slot 0: header stamp advances, footer lags.
    let buf = dev.read_block(BlockNumber(sb.checkpoint0)).expect("read");
    let mut bytes = buf.as_slice().to_vec();
    let torn = Checkpoint::parse(&bytes).expect("parse").timestamp + 1;
    bytes[0..4].copy_from_slice(&torn.to_le_bytes());
    dev.write_block(BlockNumber(sb.checkpoint0), &bytes)
        .expect("write");

    // Neither slot is valid now (slot 1 was never written): the mount
    // falls back to a fresh log rather than trusting torn state.
    let fs = Slfs::mount(Arc::clone(&dev), GcConfig::default()).expect("mount");
    assert_eq!(fs.log_tail(), BlockNumber(fs.geometry().segstart));

    // Restore an intact slot 1 with a high stamp: it wins arbitration.
    drop(fs);
    let mut cp = Checkpoint::parse(&bytes).expect("parse");
    cp.timestamp = torn + 10;
    cp.valid = 1;
    dev.write_block(BlockNumber(sb.checkpoint1), &cp.to_block())
        .expect("write");
    let fs = Slfs::mount(Arc::clone(&dev), GcConfig::default()).expect("mount");
    assert_eq!(fs.checkpoint().timestamp, torn + 10);
}
