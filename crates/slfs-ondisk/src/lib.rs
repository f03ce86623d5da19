#![forbid(unsafe_code)]
//! On-disk formats for SLFS.
//!
//! Every record that touches the device is parsed and serialized here with
//! explicit little-endian offsets: the superblock, the checkpoint record,
//! segment summary blocks, segment usage table blocks, packed inode blocks,
//! and imap blocks. No in-memory struct is ever reinterpreted as bytes.
//!
//! Disk layout:
//!
//! ```text
//! [ boot | superblock | checkpoint0 | checkpoint1 | log segments … ]
//! ```

use serde::{Deserialize, Serialize};
use slfs_types::{
    BLOCK_SIZE, DINODE_SIZE, Geometry, IMAP_ENTRIES_PER_BLOCK, ImapEntry, InodeNumber, NDIRECT,
    NIMAP_BLOCKS, NSUT_BLOCKS, ParseError, SLFS_MAGIC, SSB_ENTRIES_PER_BLOCK, SSB_ENTRY_SIZE,
    SSB_HEADER_SIZE, SSB_MAGIC, SUT_ENTRIES_PER_BLOCK, Version, ensure_slice, read_le_i16,
    read_le_u32, write_le_i16, write_le_u32,
};

// ── Superblock ──────────────────────────────────────────────────────────────

/// Superblock. Written once by the image formatter, read-only at runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Superblock {
    pub magic: u32,
    /// Image size in blocks.
    pub size: u32,
    pub nsegs: u32,
    pub segsize: u32,
    pub segstart: u32,
    pub ninodes: u32,
    pub checkpoint0: u32,
    pub checkpoint1: u32,
}

impl Superblock {
    /// Parse from the superblock block, validating the magic and geometry.
    pub fn parse(data: &[u8]) -> Result<Self, ParseError> {
        let magic = read_le_u32(data, 0x00)?;
        if magic != SLFS_MAGIC {
            return Err(ParseError::InvalidMagic {
                expected: SLFS_MAGIC,
                actual: magic,
            });
        }

        let sb = Self {
            magic,
            size: read_le_u32(data, 0x04)?,
            nsegs: read_le_u32(data, 0x08)?,
            segsize: read_le_u32(data, 0x0C)?,
            segstart: read_le_u32(data, 0x10)?,
            ninodes: read_le_u32(data, 0x14)?,
            checkpoint0: read_le_u32(data, 0x18)?,
            checkpoint1: read_le_u32(data, 0x1C)?,
        };
        sb.validate()?;
        Ok(sb)
    }

    fn validate(&self) -> Result<(), ParseError> {
        if self.segsize == 0 {
            return Err(ParseError::InvalidField {
                field: "segsize",
                reason: "must be non-zero",
            });
        }
        if self.size > slfs_types::IMAP_MAX_BLOCK + 1 {
            return Err(ParseError::InvalidField {
                field: "size",
                reason: "exceeds imap-addressable block count",
            });
        }
        if self.segstart >= self.size {
            return Err(ParseError::InvalidField {
                field: "segstart",
                reason: "log start beyond image end",
            });
        }
        let log_blocks = self.size - self.segstart;
        if u64::from(self.nsegs) * u64::from(self.segsize) > u64::from(log_blocks) {
            return Err(ParseError::InvalidField {
                field: "nsegs",
                reason: "segments exceed log area",
            });
        }
        if self.ninodes as usize > NIMAP_BLOCKS * IMAP_ENTRIES_PER_BLOCK {
            return Err(ParseError::InvalidField {
                field: "ninodes",
                reason: "exceeds imap capacity",
            });
        }
        if self.nsegs as usize > NSUT_BLOCKS * SUT_ENTRIES_PER_BLOCK {
            return Err(ParseError::InvalidField {
                field: "nsegs",
                reason: "exceeds SUT capacity",
            });
        }
        Ok(())
    }

    /// Serialize into a zero-padded block.
    #[must_use]
    pub fn to_block(&self) -> Vec<u8> {
        let mut data = vec![0_u8; BLOCK_SIZE];
        write_le_u32(&mut data, 0x00, self.magic);
        write_le_u32(&mut data, 0x04, self.size);
        write_le_u32(&mut data, 0x08, self.nsegs);
        write_le_u32(&mut data, 0x0C, self.segsize);
        write_le_u32(&mut data, 0x10, self.segstart);
        write_le_u32(&mut data, 0x14, self.ninodes);
        write_le_u32(&mut data, 0x18, self.checkpoint0);
        write_le_u32(&mut data, 0x1C, self.checkpoint1);
        data
    }

    #[must_use]
    pub fn geometry(&self) -> Geometry {
        Geometry {
            size: self.size,
            nsegs: self.nsegs,
            segsize: self.segsize,
            segstart: self.segstart,
            ninodes: self.ninodes,
        }
    }
}

// ── Checkpoint record ───────────────────────────────────────────────────────

const CP_FOOTER_OFFSET: usize = BLOCK_SIZE - 4;

/// Checkpoint record, exactly one block.
///
/// The header timestamp is the first word and the footer timestamp the last
/// four bytes of the block; a slot is trusted only when `valid` is set and
/// the two stamps agree, so a torn write is never read as valid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub timestamp: u32,
    pub log_tail: u32,
    pub cur_seg: u32,
    pub seg_offset: u32,
    pub imap_addrs: [u32; NIMAP_BLOCKS],
    pub imap_nblocks: u32,
    pub sut_addrs: [u32; NSUT_BLOCKS],
    pub sut_nblocks: u32,
    pub valid: u32,
    pub footer_timestamp: u32,
}

impl Checkpoint {
    /// A zeroed, invalid record (fresh-format state).
    #[must_use]
    pub fn empty() -> Self {
        Self {
            timestamp: 0,
            log_tail: 0,
            cur_seg: 0,
            seg_offset: 0,
            imap_addrs: [0; NIMAP_BLOCKS],
            imap_nblocks: 0,
            sut_addrs: [0; NSUT_BLOCKS],
            sut_nblocks: 0,
            valid: 0,
            footer_timestamp: 0,
        }
    }

    /// Structural parse; consistency is a separate question (`is_valid`).
    pub fn parse(data: &[u8]) -> Result<Self, ParseError> {
        if data.len() < BLOCK_SIZE {
            return Err(ParseError::InsufficientData {
                needed: BLOCK_SIZE,
                offset: 0,
                actual: data.len(),
            });
        }

        let mut imap_addrs = [0_u32; NIMAP_BLOCKS];
        for (i, addr) in imap_addrs.iter_mut().enumerate() {
            *addr = read_le_u32(data, 0x10 + i * 4)?;
        }
        let mut sut_addrs = [0_u32; NSUT_BLOCKS];
        for (i, addr) in sut_addrs.iter_mut().enumerate() {
            *addr = read_le_u32(data, 0x24 + i * 4)?;
        }

        Ok(Self {
            timestamp: read_le_u32(data, 0x00)?,
            log_tail: read_le_u32(data, 0x04)?,
            cur_seg: read_le_u32(data, 0x08)?,
            seg_offset: read_le_u32(data, 0x0C)?,
            imap_addrs,
            imap_nblocks: read_le_u32(data, 0x20)?,
            sut_addrs,
            sut_nblocks: read_le_u32(data, 0x44)?,
            valid: read_le_u32(data, 0x48)?,
            footer_timestamp: read_le_u32(data, CP_FOOTER_OFFSET)?,
        })
    }

    /// Serialize into one block, stamping the footer equal to the header.
    #[must_use]
    pub fn to_block(&self) -> Vec<u8> {
        let mut data = vec![0_u8; BLOCK_SIZE];
        write_le_u32(&mut data, 0x00, self.timestamp);
        write_le_u32(&mut data, 0x04, self.log_tail);
        write_le_u32(&mut data, 0x08, self.cur_seg);
        write_le_u32(&mut data, 0x0C, self.seg_offset);
        for (i, addr) in self.imap_addrs.iter().enumerate() {
            write_le_u32(&mut data, 0x10 + i * 4, *addr);
        }
        write_le_u32(&mut data, 0x20, self.imap_nblocks);
        for (i, addr) in self.sut_addrs.iter().enumerate() {
            write_le_u32(&mut data, 0x24 + i * 4, *addr);
        }
        write_le_u32(&mut data, 0x44, self.sut_nblocks);
        write_le_u32(&mut data, 0x48, self.valid);
        write_le_u32(&mut data, CP_FOOTER_OFFSET, self.timestamp);
        data
    }

    /// Whether this slot may be trusted: flag set and stamps agree.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.valid == 1 && self.timestamp == self.footer_timestamp
    }
}

// ── Segment summary blocks ──────────────────────────────────────────────────

/// Kind of a log block described by an SSB entry. Never zero on disk; raw
/// zero means "no entry", which the codec surfaces as a parse failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BlockKind {
    Data,
    Inode,
    Indirect,
}

impl BlockKind {
    #[must_use]
    pub fn to_raw(self) -> u8 {
        match self {
            Self::Data => 1,
            Self::Inode => 2,
            Self::Indirect => 3,
        }
    }

    pub fn from_raw(raw: u8) -> Result<Self, ParseError> {
        match raw {
            1 => Ok(Self::Data),
            2 => Ok(Self::Inode),
            3 => Ok(Self::Indirect),
            _ => Err(ParseError::InvalidField {
                field: "ssb_entry.kind",
                reason: "unknown block kind",
            }),
        }
    }
}

/// Descriptor for one appended log block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SsbEntry {
    pub kind: BlockKind,
    pub inum: InodeNumber,
    /// File block offset; `NDIRECT` for the indirect block itself.
    pub offset: u32,
    pub version: Version,
}

impl SsbEntry {
    fn checksum_word(&self) -> u32 {
        u32::from(self.kind.to_raw()) ^ self.inum.0 ^ self.offset ^ self.version.0
    }
}

/// XOR checksum over the 32-bit words of all entries.
#[must_use]
pub fn ssb_checksum(entries: &[SsbEntry]) -> u32 {
    entries
        .iter()
        .fold(0_u32, |acc, entry| acc ^ entry.checksum_word())
}

/// Segment summary block: self-describing record of the non-SSB blocks
/// written to a segment, in append order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SsbBlock {
    /// Sync sequence at flush time; reserved for roll-forward recovery.
    pub timestamp: u32,
    /// Start block of the segment the log moved to, or 0. Reserved for
    /// roll-forward recovery.
    pub next_seg_addr: u32,
    pub entries: Vec<SsbEntry>,
}

impl SsbBlock {
    /// Parse and verify an SSB block: magic, entry count, XOR checksum.
    pub fn parse(data: &[u8]) -> Result<Self, ParseError> {
        let magic = read_le_u32(data, 0x00)?;
        if magic != SSB_MAGIC {
            return Err(ParseError::InvalidMagic {
                expected: SSB_MAGIC,
                actual: magic,
            });
        }

        let nblocks = read_le_u32(data, 0x04)? as usize;
        if nblocks > SSB_ENTRIES_PER_BLOCK {
            return Err(ParseError::InvalidField {
                field: "ssb.nblocks",
                reason: "entry count exceeds block capacity",
            });
        }
        let checksum = read_le_u32(data, 0x08)?;
        let timestamp = read_le_u32(data, 0x0C)?;
        let next_seg_addr = read_le_u32(data, 0x10)?;

        let mut entries = Vec::with_capacity(nblocks);
        for i in 0..nblocks {
            let base = SSB_HEADER_SIZE + i * SSB_ENTRY_SIZE;
            let raw_kind = ensure_slice(data, base, 1)?[0];
            entries.push(SsbEntry {
                kind: BlockKind::from_raw(raw_kind)?,
                inum: InodeNumber(read_le_u32(data, base + 1)?),
                offset: read_le_u32(data, base + 5)?,
                version: Version(read_le_u32(data, base + 9)?),
            });
        }

        let computed = ssb_checksum(&entries);
        if computed != checksum {
            return Err(ParseError::ChecksumMismatch {
                expected: checksum,
                actual: computed,
            });
        }

        Ok(Self {
            timestamp,
            next_seg_addr,
            entries,
        })
    }

    /// Quiet probe used by the cleaner's segment scan: a block either is a
    /// verifiable SSB or it is payload; there is no error case.
    #[must_use]
    pub fn probe(data: &[u8]) -> Option<Self> {
        Self::parse(data).ok()
    }

    /// Serialize into one zero-padded block.
    ///
    /// # Panics
    /// Panics if more entries are given than fit in a block; the in-memory
    /// buffer is bounded by the same constant, so this indicates a bug.
    #[must_use]
    pub fn to_block(&self) -> Vec<u8> {
        assert!(
            self.entries.len() <= SSB_ENTRIES_PER_BLOCK,
            "SSB entry overflow"
        );
        let mut data = vec![0_u8; BLOCK_SIZE];
        write_le_u32(&mut data, 0x00, SSB_MAGIC);
        write_le_u32(&mut data, 0x04, self.entries.len() as u32);
        write_le_u32(&mut data, 0x08, ssb_checksum(&self.entries));
        write_le_u32(&mut data, 0x0C, self.timestamp);
        write_le_u32(&mut data, 0x10, self.next_seg_addr);
        for (i, entry) in self.entries.iter().enumerate() {
            let base = SSB_HEADER_SIZE + i * SSB_ENTRY_SIZE;
            data[base] = entry.kind.to_raw();
            write_le_u32(&mut data, base + 1, entry.inum.0);
            write_le_u32(&mut data, base + 5, entry.offset);
            write_le_u32(&mut data, base + 9, entry.version.0);
        }
        data
    }
}

// ── Segment usage table ─────────────────────────────────────────────────────

/// Live-bytes value marking a segment as sitting on the free ring.
pub const SUT_FREE: u32 = u32::MAX;

/// Per-segment usage record.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SutEntry {
    pub live_bytes: u32,
    /// Tick of the last modification; drives the cost-benefit age factor.
    pub age: u32,
}

impl SutEntry {
    #[must_use]
    pub fn is_free(&self) -> bool {
        self.live_bytes == SUT_FREE
    }
}

/// Pack one SUT block's worth of entries starting at `entries[first..]`.
#[must_use]
pub fn sut_block_to_bytes(entries: &[SutEntry], first: usize) -> Vec<u8> {
    let mut data = vec![0_u8; BLOCK_SIZE];
    for i in 0..SUT_ENTRIES_PER_BLOCK {
        let Some(entry) = entries.get(first + i) else {
            break;
        };
        write_le_u32(&mut data, i * 8, entry.live_bytes);
        write_le_u32(&mut data, i * 8 + 4, entry.age);
    }
    data
}

/// Unpack one SUT block into `entries[first..]`, clamped to the table size.
pub fn sut_block_from_bytes(
    data: &[u8],
    entries: &mut [SutEntry],
    first: usize,
) -> Result<(), ParseError> {
    for i in 0..SUT_ENTRIES_PER_BLOCK {
        let Some(entry) = entries.get_mut(first + i) else {
            break;
        };
        entry.live_bytes = read_le_u32(data, i * 8)?;
        entry.age = read_le_u32(data, i * 8 + 4)?;
    }
    Ok(())
}

// ── Imap blocks ─────────────────────────────────────────────────────────────

/// Pack one imap block's worth of entries starting at `imap[first..]`.
#[must_use]
pub fn imap_block_to_bytes(imap: &[ImapEntry], first: usize) -> Vec<u8> {
    let mut data = vec![0_u8; BLOCK_SIZE];
    for i in 0..IMAP_ENTRIES_PER_BLOCK {
        let Some(entry) = imap.get(first + i) else {
            break;
        };
        write_le_u32(&mut data, i * 4, entry.0);
    }
    data
}

/// Unpack one imap block into `imap[first..]`, clamped to the table size.
pub fn imap_block_from_bytes(
    data: &[u8],
    imap: &mut [ImapEntry],
    first: usize,
) -> Result<(), ParseError> {
    for i in 0..IMAP_ENTRIES_PER_BLOCK {
        let Some(entry) = imap.get_mut(first + i) else {
            break;
        };
        *entry = ImapEntry(read_le_u32(data, i * 4)?);
    }
    Ok(())
}

// ── On-disk inodes ──────────────────────────────────────────────────────────

/// Inode type tag.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum InodeType {
    /// Unallocated slot; the rest of the record is garbage.
    #[default]
    Free,
    Dir,
    File,
    Dev,
}

impl InodeType {
    #[must_use]
    pub fn to_raw(self) -> i16 {
        match self {
            Self::Free => 0,
            Self::Dir => 1,
            Self::File => 2,
            Self::Dev => 3,
        }
    }

    pub fn from_raw(raw: i16) -> Result<Self, ParseError> {
        match raw {
            0 => Ok(Self::Free),
            1 => Ok(Self::Dir),
            2 => Ok(Self::File),
            3 => Ok(Self::Dev),
            _ => Err(ParseError::InvalidField {
                field: "dinode.type",
                reason: "unknown inode type",
            }),
        }
    }

    #[must_use]
    pub fn is_free(self) -> bool {
        self == Self::Free
    }
}

/// On-disk inode. `INODES_PER_BLOCK` of these pack into one block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dinode {
    pub itype: InodeType,
    pub major: i16,
    pub minor: i16,
    pub nlink: i16,
    /// File size in bytes.
    pub size: u32,
    /// `NDIRECT` direct pointers plus the single indirect pointer.
    pub addrs: [u32; NDIRECT + 1],
}

impl Dinode {
    /// A zeroed inode of the given type.
    #[must_use]
    pub fn new(itype: InodeType) -> Self {
        Self {
            itype,
            major: 0,
            minor: 0,
            nlink: 0,
            size: 0,
            addrs: [0; NDIRECT + 1],
        }
    }

    /// The indirect pointer (`addrs[NDIRECT]`).
    #[must_use]
    pub fn indirect(&self) -> u32 {
        self.addrs[NDIRECT]
    }

    /// Parse the inode at `slot` within a packed inode block.
    pub fn read_from_block(data: &[u8], slot: usize) -> Result<Self, ParseError> {
        let base = slot
            .checked_mul(DINODE_SIZE)
            .and_then(|base| base.checked_add(DINODE_SIZE).map(|_| base))
            .filter(|base| base + DINODE_SIZE <= data.len())
            .ok_or(ParseError::InvalidField {
                field: "dinode.slot",
                reason: "slot beyond block",
            })?;

        let mut addrs = [0_u32; NDIRECT + 1];
        for (i, addr) in addrs.iter_mut().enumerate() {
            *addr = read_le_u32(data, base + 12 + i * 4)?;
        }

        Ok(Self {
            itype: InodeType::from_raw(read_le_i16(data, base)?)?,
            major: read_le_i16(data, base + 2)?,
            minor: read_le_i16(data, base + 4)?,
            nlink: read_le_i16(data, base + 6)?,
            size: read_le_u32(data, base + 8)?,
            addrs,
        })
    }

    /// Serialize the inode into `slot` of a packed inode block.
    ///
    /// # Panics
    /// Panics if `slot` does not fit in the block; slots come from the
    /// 4-bit imap field, so this indicates a bug.
    pub fn write_to_block(&self, data: &mut [u8], slot: usize) {
        let base = slot * DINODE_SIZE;
        assert!(base + DINODE_SIZE <= data.len(), "inode slot beyond block");
        write_le_i16(data, base, self.itype.to_raw());
        write_le_i16(data, base + 2, self.major);
        write_le_i16(data, base + 4, self.minor);
        write_le_i16(data, base + 6, self.nlink);
        write_le_u32(data, base + 8, self.size);
        for (i, addr) in self.addrs.iter().enumerate() {
            write_le_u32(data, base + 12 + i * 4, *addr);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use slfs_types::{BlockNumber, CHECKPOINT0_BLOCK, CHECKPOINT1_BLOCK};

    fn sample_superblock() -> Superblock {
        Superblock {
            magic: SLFS_MAGIC,
            size: 20_000,
            nsegs: (20_000 - 4) / 32,
            segsize: 32,
            segstart: 4,
            ninodes: 200,
            checkpoint0: CHECKPOINT0_BLOCK,
            checkpoint1: CHECKPOINT1_BLOCK,
        }
    }

    #[test]
    fn superblock_round_trip() {
        let sb = sample_superblock();
        let block = sb.to_block();
        assert_eq!(block.len(), BLOCK_SIZE);
        let parsed = Superblock::parse(&block).expect("parse");
        assert_eq!(parsed, sb);
    }

    #[test]
    fn superblock_rejects_bad_magic() {
        let mut block = sample_superblock().to_block();
        block[0] ^= 0xFF;
        assert!(matches!(
            Superblock::parse(&block),
            Err(ParseError::InvalidMagic { .. })
        ));
    }

    #[test]
    fn superblock_rejects_inconsistent_geometry() {
        let mut sb = sample_superblock();
        sb.segstart = sb.size;
        assert!(Superblock::parse(&sb.to_block()).is_err());

        let mut sb = sample_superblock();
        sb.nsegs = sb.size; // far more segments than the log can hold
        assert!(Superblock::parse(&sb.to_block()).is_err());
    }

    #[test]
    fn checkpoint_round_trip_and_validity() {
        let mut cp = Checkpoint::empty();
        cp.timestamp = 41;
        cp.log_tail = 1234;
        cp.cur_seg = 38;
        cp.seg_offset = 14;
        cp.imap_addrs[0] = 1200;
        cp.imap_nblocks = 1;
        cp.sut_addrs[0] = 1201;
        cp.sut_addrs[1] = 1202;
        cp.sut_nblocks = 2;
        cp.valid = 1;

        let block = cp.to_block();
        let parsed = Checkpoint::parse(&block).expect("parse");
        assert_eq!(parsed.timestamp, 41);
        assert_eq!(parsed.footer_timestamp, 41);
        assert!(parsed.is_valid());
        assert_eq!(parsed.log_tail, 1234);
        assert_eq!(parsed.imap_addrs[0], 1200);
        assert_eq!(parsed.sut_addrs[1], 1202);
    }

    #[test]
    fn torn_checkpoint_is_invalid() {
        let mut cp = Checkpoint::empty();
        cp.timestamp = 7;
        cp.valid = 1;
        let mut block = cp.to_block();

        // Simulate a torn write: header updated, footer still the old stamp.
        write_le_u32(&mut block, BLOCK_SIZE - 4, 6);
        let parsed = Checkpoint::parse(&block).expect("parse");
        assert!(!parsed.is_valid());

        // And an unset valid flag is never trusted, stamps or not.
        let mut cp = Checkpoint::empty();
        cp.timestamp = 9;
        let parsed = Checkpoint::parse(&cp.to_block()).expect("parse");
        assert!(!parsed.is_valid());
    }

    #[test]
    fn ssb_round_trip() {
        let ssb = SsbBlock {
            timestamp: 3,
            next_seg_addr: 68,
            entries: vec![
                SsbEntry {
                    kind: BlockKind::Data,
                    inum: InodeNumber(2),
                    offset: 0,
                    version: Version(1),
                },
                SsbEntry {
                    kind: BlockKind::Indirect,
                    inum: InodeNumber(2),
                    offset: NDIRECT as u32,
                    version: Version(1),
                },
                SsbEntry {
                    kind: BlockKind::Inode,
                    inum: InodeNumber(2),
                    offset: 0,
                    version: Version(0),
                },
            ],
        };

        let block = ssb.to_block();
        let parsed = SsbBlock::parse(&block).expect("parse");
        assert_eq!(parsed, ssb);
        assert!(SsbBlock::probe(&block).is_some());
    }

    #[test]
    fn ssb_rejects_corruption() {
        let ssb = SsbBlock {
            timestamp: 0,
            next_seg_addr: 0,
            entries: vec![SsbEntry {
                kind: BlockKind::Data,
                inum: InodeNumber(5),
                offset: 3,
                version: Version(2),
            }],
        };
        let mut block = ssb.to_block();

        // Flip a byte inside the entry area: checksum must catch it.
        block[SSB_HEADER_SIZE + 2] ^= 0x10;
        assert!(matches!(
            SsbBlock::parse(&block),
            Err(ParseError::ChecksumMismatch { .. })
        ));
        assert!(SsbBlock::probe(&block).is_none());

        // A payload block full of zeroes is simply not an SSB.
        assert!(SsbBlock::probe(&[0_u8; BLOCK_SIZE]).is_none());
    }

    #[test]
    fn ssb_rejects_zero_kind() {
        let ssb = SsbBlock {
            timestamp: 0,
            next_seg_addr: 0,
            entries: vec![SsbEntry {
                kind: BlockKind::Data,
                inum: InodeNumber(1),
                offset: 0,
                version: Version(0),
            }],
        };
        let mut block = ssb.to_block();
        block[SSB_HEADER_SIZE] = 0; // kind byte
        assert!(SsbBlock::parse(&block).is_err());
    }

    #[test]
    fn sut_block_round_trip() {
        let mut entries = vec![SutEntry::default(); 300];
        entries[0] = SutEntry {
            live_bytes: 4096,
            age: 17,
        };
        entries[130] = SutEntry {
            live_bytes: SUT_FREE,
            age: 20,
        };

        let block0 = sut_block_to_bytes(&entries, 0);
        let block1 = sut_block_to_bytes(&entries, SUT_ENTRIES_PER_BLOCK);

        let mut out = vec![SutEntry::default(); 300];
        sut_block_from_bytes(&block0, &mut out, 0).expect("unpack");
        sut_block_from_bytes(&block1, &mut out, SUT_ENTRIES_PER_BLOCK).expect("unpack");

        assert_eq!(out, entries);
        assert!(out[130].is_free());
        assert!(!out[0].is_free());
    }

    #[test]
    fn imap_block_round_trip() {
        let mut imap = vec![ImapEntry::FREE; 300];
        imap[1] = ImapEntry::encode(BlockNumber(900), Version(3), 4);
        imap[2] = ImapEntry::PENDING;
        imap[299] = ImapEntry::encode(BlockNumber(12), Version(0), 0);

        let block0 = imap_block_to_bytes(&imap, 0);
        let block1 = imap_block_to_bytes(&imap, IMAP_ENTRIES_PER_BLOCK);

        let mut out = vec![ImapEntry::FREE; 300];
        imap_block_from_bytes(&block0, &mut out, 0).expect("unpack");
        imap_block_from_bytes(&block1, &mut out, IMAP_ENTRIES_PER_BLOCK).expect("unpack");

        assert_eq!(out, imap);
        assert!(out[2].is_pending());
        assert_eq!(out[1].block(), BlockNumber(900));
    }

    #[test]
    fn dinode_round_trip() {
        let mut block = vec![0_u8; BLOCK_SIZE];
        let mut di = Dinode::new(InodeType::File);
        di.nlink = 1;
        di.size = 5 * 1024;
        di.addrs[0] = 100;
        di.addrs[4] = 104;
        di.addrs[NDIRECT] = 777;

        di.write_to_block(&mut block, 7);
        let parsed = Dinode::read_from_block(&block, 7).expect("parse");
        assert_eq!(parsed, di);
        assert_eq!(parsed.indirect(), 777);

        // Untouched slots parse as free inodes.
        let empty = Dinode::read_from_block(&block, 0).expect("parse");
        assert!(empty.itype.is_free());
    }

    #[test]
    fn dinode_rejects_out_of_range_slot() {
        let block = vec![0_u8; BLOCK_SIZE];
        assert!(Dinode::read_from_block(&block, slfs_types::INODES_PER_BLOCK).is_err());
    }

    #[test]
    fn dinode_dev_numbers_survive() {
        let mut block = vec![0_u8; BLOCK_SIZE];
        let mut di = Dinode::new(InodeType::Dev);
        di.major = 1;
        di.minor = -1;
        di.nlink = 1;
        di.write_to_block(&mut block, 0);
        let parsed = Dinode::read_from_block(&block, 0).expect("parse");
        assert_eq!(parsed.major, 1);
        assert_eq!(parsed.minor, -1);
    }
}
