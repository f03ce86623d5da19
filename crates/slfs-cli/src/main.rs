#![forbid(unsafe_code)]

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use serde::Serialize;
use slfs_block::{BlockDevice, ByteBlockDevice, FileByteDevice, open_block_device};
use slfs_core::{FormatOptions, GcConfig, Slfs};
use slfs_ondisk::{Dinode, SUT_FREE};
use slfs_types::{BLOCK_SIZE, BlockNumber, InodeNumber, NDIRECT, NINDIRECT, read_le_u32};
use std::path::{Path, PathBuf};
use std::sync::Arc;

// ── CLI definition ──────────────────────────────────────────────────────────

#[derive(Parser)]
#[command(name = "slfs", about = "SLFS — log-structured filesystem toolkit")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create a fresh SLFS image file.
    Mkfs {
        /// Path of the image file to create.
        image: PathBuf,
        /// Image size in blocks.
        #[arg(long, default_value_t = 20_000)]
        size_blocks: u32,
        /// Segment size in blocks.
        #[arg(long, default_value_t = 32)]
        segment_blocks: u32,
        /// Maximum number of inodes.
        #[arg(long, default_value_t = 200)]
        ninodes: u32,
    },
    /// Show the superblock and the recovered checkpoint.
    Inspect {
        /// Path to the image.
        image: PathBuf,
        /// Output in JSON format.
        #[arg(long)]
        json: bool,
    },
    /// Dump the segment usage table.
    Segments {
        /// Path to the image.
        image: PathBuf,
        /// Output in JSON format.
        #[arg(long)]
        json: bool,
        /// Also list segments with zero live bytes.
        #[arg(long)]
        all: bool,
    },
    /// Run the cleaner once and report what it freed.
    Gc {
        /// Path to the image.
        image: PathBuf,
        /// Output in JSON format.
        #[arg(long)]
        json: bool,
    },
    /// Walk the imap and every inode's pointers, reporting inconsistencies.
    Fsck {
        /// Path to the image.
        image: PathBuf,
        /// Output in JSON format.
        #[arg(long)]
        json: bool,
    },
}

// ── Serializable outputs ────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
struct InspectOutput {
    size_blocks: u32,
    segments: u32,
    segment_blocks: u32,
    log_start: u32,
    max_inodes: u32,
    checkpoint_timestamp: u32,
    checkpoint_valid: bool,
    log_tail: u32,
    imap_blocks: u32,
    sut_blocks: u32,
    free_segments: usize,
    allocated_inodes: usize,
}

#[derive(Debug, Serialize)]
struct SegmentRow {
    segment: u32,
    live_bytes: u32,
    utilization_percent: u32,
    age: u32,
    free: bool,
}

#[derive(Debug, Serialize)]
struct FsckReport {
    allocated_inodes: usize,
    referenced_blocks: usize,
    errors: Vec<String>,
}

// ── Main ────────────────────────────────────────────────────────────────────

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    if let Err(error) = run() {
        eprintln!("error: {error:#}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Mkfs {
            image,
            size_blocks,
            segment_blocks,
            ninodes,
        } => mkfs_cmd(&image, size_blocks, segment_blocks, ninodes),
        Command::Inspect { image, json } => inspect_cmd(&image, json),
        Command::Segments { image, json, all } => segments_cmd(&image, json, all),
        Command::Gc { image, json } => gc_cmd(&image, json),
        Command::Fsck { image, json } => fsck_cmd(&image, json),
    }
}

fn mount(path: &Path) -> Result<Arc<Slfs>> {
    let dev = open_block_device(path)
        .with_context(|| format!("opening image {}", path.display()))?;
    let dev: Arc<dyn BlockDevice> = Arc::new(dev);
    Slfs::mount(dev, GcConfig::default()).context("mounting image")
}

fn mkfs_cmd(path: &Path, size_blocks: u32, segment_blocks: u32, ninodes: u32) -> Result<()> {
    let dev = FileByteDevice::create(path, u64::from(size_blocks) * BLOCK_SIZE as u64)
        .with_context(|| format!("creating image {}", path.display()))?;
    let dev: Arc<dyn BlockDevice> =
        Arc::new(ByteBlockDevice::new(dev, BLOCK_SIZE as u32).context("block device")?);

    let sb = slfs_core::format(
        &dev,
        &FormatOptions {
            size_blocks,
            segment_blocks,
            ninodes,
        },
    )
    .context("formatting image")?;

    println!(
        "formatted {}: {} blocks, {} segments of {} blocks, {} inodes",
        path.display(),
        sb.size,
        sb.nsegs,
        sb.segsize,
        sb.ninodes
    );
    Ok(())
}

fn inspect_cmd(path: &Path, json: bool) -> Result<()> {
    let fs = mount(path)?;
    let sb = fs.superblock();
    let cp = fs.checkpoint();
    let allocated = fs
        .imap_snapshot()
        .iter()
        .filter(|e| !e.is_free())
        .count();

    let out = InspectOutput {
        size_blocks: sb.size,
        segments: sb.nsegs,
        segment_blocks: sb.segsize,
        log_start: sb.segstart,
        max_inodes: sb.ninodes,
        checkpoint_timestamp: cp.timestamp,
        checkpoint_valid: cp.is_valid(),
        log_tail: cp.log_tail,
        imap_blocks: cp.imap_nblocks,
        sut_blocks: cp.sut_nblocks,
        free_segments: fs.free_segment_count(),
        allocated_inodes: allocated,
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&out)?);
    } else {
        println!(
            "image: {} blocks, {} segments of {} blocks starting at {}",
            out.size_blocks, out.segments, out.segment_blocks, out.log_start
        );
        println!(
            "checkpoint: ts={} valid={} log_tail={} imap_blocks={} sut_blocks={}",
            out.checkpoint_timestamp,
            out.checkpoint_valid,
            out.log_tail,
            out.imap_blocks,
            out.sut_blocks
        );
        println!(
            "inodes: {} / {} allocated; free segments: {}",
            out.allocated_inodes, out.max_inodes, out.free_segments
        );
    }
    Ok(())
}

fn segments_cmd(path: &Path, json: bool, all: bool) -> Result<()> {
    let fs = mount(path)?;
    let seg_bytes = fs.geometry().segment_bytes();

    let rows: Vec<SegmentRow> = fs
        .segment_usage()
        .iter()
        .enumerate()
        .filter(|(_, e)| all || e.live_bytes != 0)
        .map(|(seg, e)| {
            let free = e.live_bytes == SUT_FREE;
            let live = if free { 0 } else { e.live_bytes };
            SegmentRow {
                segment: seg as u32,
                live_bytes: live,
                utilization_percent: ((u64::from(live) * 100) / u64::from(seg_bytes)).min(100)
                    as u32,
                age: e.age,
                free,
            }
        })
        .collect();

    if json {
        println!("{}", serde_json::to_string_pretty(&rows)?);
    } else {
        println!("{:>8} {:>12} {:>6} {:>10} {:>5}", "segment", "live_bytes", "util%", "age", "free");
        for row in &rows {
            println!(
                "{:>8} {:>12} {:>6} {:>10} {:>5}",
                row.segment, row.live_bytes, row.utilization_percent, row.age, row.free
            );
        }
        println!("{} segments listed", rows.len());
    }
    Ok(())
}

fn gc_cmd(path: &Path, json: bool) -> Result<()> {
    let fs = mount(path)?;
    let report = fs.run_gc().context("cleaner run")?;
    fs.sync().context("final sync")?;

    if json {
        #[derive(Serialize)]
        struct GcOutput {
            victims: usize,
            segments_freed: usize,
            blocks_relocated: usize,
            completed: bool,
            free_segments: usize,
        }
        let out = GcOutput {
            victims: report.victims,
            segments_freed: report.segments_freed,
            blocks_relocated: report.blocks_relocated,
            completed: report.completed,
            free_segments: fs.free_segment_count(),
        };
        println!("{}", serde_json::to_string_pretty(&out)?);
    } else {
        println!(
            "cleaner: {} victims, {} freed, {} blocks relocated, completed={}",
            report.victims, report.segments_freed, report.blocks_relocated, report.completed
        );
        println!("free segments now: {}", fs.free_segment_count());
    }
    Ok(())
}

fn fsck_cmd(path: &Path, json: bool) -> Result<()> {
    let fs = mount(path)?;
    let geo = fs.geometry();
    let cache = fs.buffer_cache();

    let mut errors = Vec::new();
    let mut referenced_blocks = 0_usize;
    let mut allocated = 0_usize;

    for (inum, entry) in fs.imap_snapshot().iter().enumerate() {
        if entry.is_free() {
            continue;
        }
        if entry.is_pending() {
            errors.push(format!("inode {inum}: stale in-buffer marker in imap"));
            continue;
        }
        allocated += 1;

        let iblk = entry.block().0;
        if iblk == 0 || iblk >= geo.size {
            errors.push(format!("inode {inum}: imap block {iblk} outside image"));
            continue;
        }

        let buf = cache.bread(BlockNumber(iblk))?;
        let di = {
            let data = buf.data();
            Dinode::read_from_block(&data, entry.slot() as usize)
        };
        let di = match di {
            Ok(di) => di,
            Err(e) => {
                errors.push(format!("inode {inum}: unreadable at block {iblk}: {e}"));
                continue;
            }
        };
        if di.itype.is_free() {
            errors.push(format!(
                "inode {inum}: imap names block {iblk} but the slot is free"
            ));
            continue;
        }

        let mut check = |what: &str, addr: u32| {
            if addr >= geo.size {
                errors.push(format!("inode {inum}: {what} block {addr} outside image"));
            } else {
                referenced_blocks += 1;
            }
        };
        for (bn, addr) in di.addrs.iter().take(NDIRECT).enumerate() {
            if *addr != 0 {
                check(&format!("direct[{bn}]"), *addr);
            }
        }
        let ind = di.indirect();
        if ind != 0 {
            check("indirect", ind);
            if ind < geo.size {
                let ind_buf = cache.bread(BlockNumber(ind))?;
                let data = ind_buf.data();
                for ibn in 0..NINDIRECT {
                    let addr = read_le_u32(&data, ibn * 4).expect("indirect slot");
                    if addr != 0 {
                        check(&format!("indirect[{ibn}]"), addr);
                    }
                }
            }
        }

        // Keep inum 1 reserved for the root directory.
        if inum == InodeNumber::ROOT.0 as usize && di.itype != slfs_core::InodeType::Dir {
            errors.push(format!("inode {inum}: root is not a directory"));
        }
    }

    let report = FsckReport {
        allocated_inodes: allocated,
        referenced_blocks,
        errors,
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!(
            "fsck: {} inodes allocated, {} blocks referenced",
            report.allocated_inodes, report.referenced_blocks
        );
        for error in &report.errors {
            println!("  {error}");
        }
        if report.errors.is_empty() {
            println!("clean");
        }
    }

    if !report.errors.is_empty() {
        bail!("{} inconsistencies found", report.errors.len());
    }
    Ok(())
}
