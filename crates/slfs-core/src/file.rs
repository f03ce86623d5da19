//! File content I/O: block mapping, reads, copy-on-write writes, truncate.
//!
//! The first `NDIRECT` blocks of a file live in `addrs[]`; the rest behind
//! the single indirect block. A write never updates in place: each touched
//! block gets a fresh log block (with its SSB entry added atomically by the
//! allocator), the old block goes dead in the SUT, and writes through the
//! indirect range copy the indirect block itself as well.

use crate::Slfs;
use crate::inodes::InodeLock;
use slfs_error::{Result, SlfsError};
use slfs_ondisk::{BlockKind, InodeType, SsbEntry};
use slfs_types::{
    BLOCK_SIZE, BlockNumber, MAX_FILE_BLOCKS, NDIRECT, NINDIRECT, read_le_u32, write_le_u32,
};
use tracing::trace;

const BLOCK_BYTES: i32 = BLOCK_SIZE as i32;

impl Slfs {
    /// Disk address of file block `bn`, allocating (and zeroing) it if the
    /// file has no block there yet.
    pub(crate) fn bmap(&self, lock: &InodeLock<'_>, bn: u32) -> Result<u32> {
        let ip = &lock.inode.inner;
        let inum = lock.inum();

        if (bn as usize) < NDIRECT {
            let (addr, version) = ip.with_state(|s| (s.addrs[bn as usize], s.version));
            if addr != 0 {
                return Ok(addr);
            }
            let addr = self
                .allocate(SsbEntry {
                    kind: BlockKind::Data,
                    inum,
                    offset: bn,
                    version,
                })?
                .0;
            self.update_usage(addr, BLOCK_BYTES);
            self.zero_block(addr)?;
            ip.with_state(|s| s.addrs[bn as usize] = addr);
            return Ok(addr);
        }

        let ibn = bn as usize - NDIRECT;
        if ibn >= NINDIRECT {
            return Err(SlfsError::FileTooLarge);
        }

        let (mut ind, version) = ip.with_state(|s| (s.addrs[NDIRECT], s.version));
        if ind == 0 {
            ind = self
                .allocate(SsbEntry {
                    kind: BlockKind::Indirect,
                    inum,
                    offset: NDIRECT as u32,
                    version,
                })?
                .0;
            self.update_usage(ind, BLOCK_BYTES);
            self.zero_block(ind)?;
            ip.with_state(|s| s.addrs[NDIRECT] = ind);
        }
        if ind >= self.geo.size {
            return Err(SlfsError::Corruption {
                block: ind,
                detail: format!("indirect pointer of inode {inum} outside the image"),
            });
        }

        let buf = self.cache.bread(BlockNumber(ind))?;
        let addr = read_le_u32(&buf.data(), ibn * 4).expect("indirect slot in range");
        if addr != 0 {
            return Ok(addr);
        }

        let addr = self
            .allocate(SsbEntry {
                kind: BlockKind::Data,
                inum,
                offset: bn,
                version,
            })?
            .0;
        self.update_usage(addr, BLOCK_BYTES);
        self.zero_block(addr)?;
        {
            let mut data = buf.data();
            write_le_u32(&mut data, ibn * 4, addr);
        }
        self.cache.bwrite(&buf)?;
        Ok(addr)
    }

    /// Read file content at `off` into `dst`. Returns the bytes read,
    /// clamped to the end of the file.
    pub fn readi(&self, lock: &InodeLock<'_>, dst: &mut [u8], off: u32) -> Result<usize> {
        let (itype, size) = lock.inode.inner.with_state(|s| (s.itype, s.size));
        if itype == InodeType::Dev {
            return Err(SlfsError::InvalidArgument(
                "device inodes have no block content".into(),
            ));
        }
        if off > size {
            return Err(SlfsError::InvalidArgument("read beyond end of file".into()));
        }

        let n = dst.len().min((size - off) as usize);
        let mut off = off as usize;
        let mut tot = 0;
        while tot < n {
            let addr = self.bmap(lock, (off / BLOCK_SIZE) as u32)?;
            if addr >= self.geo.size {
                return Err(SlfsError::Corruption {
                    block: addr,
                    detail: format!("data pointer of inode {} outside the image", lock.inum()),
                });
            }
            let buf = self.cache.bread(BlockNumber(addr))?;
            let in_block = off % BLOCK_SIZE;
            let m = (n - tot).min(BLOCK_SIZE - in_block);
            dst[tot..tot + m].copy_from_slice(&buf.data()[in_block..in_block + m]);
            tot += m;
            off += m;
        }
        Ok(n)
    }

    /// Write `src` at `off`, copy-on-write. Every touched block moves to
    /// the log tail; partial blocks are primed from the old copy first.
    pub fn writei(&self, lock: &InodeLock<'_>, src: &[u8], off: u32) -> Result<usize> {
        let ip = &lock.inode.inner;
        let inum = lock.inum();

        let (itype, size) = ip.with_state(|s| (s.itype, s.size));
        if itype == InodeType::Dev {
            return Err(SlfsError::InvalidArgument(
                "device inodes have no block content".into(),
            ));
        }
        if off > size {
            return Err(SlfsError::InvalidArgument(
                "write beyond end of file".into(),
            ));
        }
        let n = src.len();
        if off as usize + n > MAX_FILE_BLOCKS * BLOCK_SIZE {
            return Err(SlfsError::FileTooLarge);
        }

        let mut off = off as usize;
        let mut tot = 0;
        while tot < n {
            let bn = (off / BLOCK_SIZE) as u32;
            let in_block = off % BLOCK_SIZE;
            let m = (n - tot).min(BLOCK_SIZE - in_block);
            let version = ip.with_state(|s| s.version);

            // The block being superseded, if the file has one here.
            let old_addr = self.resolve_existing(lock, bn)?;

            let new_addr = self
                .allocate(SsbEntry {
                    kind: BlockKind::Data,
                    inum,
                    offset: bn,
                    version,
                })?
                .0;
            self.update_usage(new_addr, BLOCK_BYTES);

            // Prime partial blocks from the old copy (or zeroes for fresh
            // blocks) before splicing the new bytes in.
            let prime: Option<Vec<u8>> = if m < BLOCK_SIZE {
                if old_addr != 0 {
                    if old_addr >= self.geo.size {
                        return Err(SlfsError::Corruption {
                            block: old_addr,
                            detail: format!("data pointer of inode {inum} outside the image"),
                        });
                    }
                    let old = self.cache.bread(BlockNumber(old_addr))?;
                    let data = old.data().clone();
                    Some(data)
                } else {
                    Some(vec![0_u8; BLOCK_SIZE])
                }
            } else {
                None
            };

            let buf = self.cache.bread(BlockNumber(new_addr))?;
            {
                let mut data = buf.data();
                if let Some(prime) = &prime {
                    data.copy_from_slice(prime);
                }
                data[in_block..in_block + m].copy_from_slice(&src[tot..tot + m]);
            }
            self.cache.bwrite(&buf)?;

            if (bn as usize) < NDIRECT {
                ip.with_state(|s| s.addrs[bn as usize] = new_addr);
            } else {
                self.cow_indirect(lock, bn, new_addr, version)?;
            }

            if old_addr != 0 {
                self.update_usage(old_addr, -BLOCK_BYTES);
            }

            tot += m;
            off += m;
        }

        if n > 0 && off > ip.with_state(|s| s.size) as usize {
            ip.with_state(|s| s.size = off as u32);
        }
        self.iupdate(lock)?;

        trace!(target: "slfs::file", inum = inum.0, bytes = n, "writei");
        Ok(n)
    }

    /// Current address of file block `bn`, or `None` if the file has no
    /// block there. Never allocates.
    pub fn block_address(&self, lock: &InodeLock<'_>, bn: u32) -> Result<Option<BlockNumber>> {
        if bn as usize >= MAX_FILE_BLOCKS {
            return Err(SlfsError::FileTooLarge);
        }
        let addr = self.resolve_existing(lock, bn)?;
        Ok((addr != 0).then_some(BlockNumber(addr)))
    }

    /// Discard an inode's content (see `itrunc`); the inode stays
    /// allocated with size zero and a bumped version.
    pub fn truncate(&self, lock: &InodeLock<'_>) -> Result<()> {
        self.itrunc(lock.inode)
    }

    /// The inode's current version counter.
    #[must_use]
    pub fn inode_version(&self, lock: &InodeLock<'_>) -> slfs_types::Version {
        lock.inode.inner.with_state(|s| s.version)
    }

    /// Current address of file block `bn`, without allocating.
    fn resolve_existing(&self, lock: &InodeLock<'_>, bn: u32) -> Result<u32> {
        let ip = &lock.inode.inner;
        if (bn as usize) < NDIRECT {
            return Ok(ip.with_state(|s| s.addrs[bn as usize]));
        }
        let ind = ip.with_state(|s| s.addrs[NDIRECT]);
        if ind == 0 {
            return Ok(0);
        }
        if ind >= self.geo.size {
            return Err(SlfsError::Corruption {
                block: ind,
                detail: format!(
                    "indirect pointer of inode {} outside the image",
                    lock.inum()
                ),
            });
        }
        let buf = self.cache.bread(BlockNumber(ind))?;
        let data = buf.data();
        Ok(read_le_u32(&data, (bn as usize - NDIRECT) * 4).expect("indirect slot in range"))
    }

    /// Point indirect slot `bn - NDIRECT` at `new_addr` by copying the
    /// indirect block to the log tail (or creating it).
    fn cow_indirect(
        &self,
        lock: &InodeLock<'_>,
        bn: u32,
        new_addr: u32,
        version: slfs_types::Version,
    ) -> Result<()> {
        let ip = &lock.inode.inner;
        let inum = lock.inum();
        let ibn = bn as usize - NDIRECT;

        let old_ind = ip.with_state(|s| s.addrs[NDIRECT]);
        let new_ind = self
            .allocate(SsbEntry {
                kind: BlockKind::Indirect,
                inum,
                offset: NDIRECT as u32,
                version,
            })?
            .0;
        self.update_usage(new_ind, BLOCK_BYTES);

        let mut bytes = if old_ind == 0 {
            vec![0_u8; BLOCK_SIZE]
        } else {
            if old_ind >= self.geo.size {
                return Err(SlfsError::Corruption {
                    block: old_ind,
                    detail: format!("indirect pointer of inode {inum} outside the image"),
                });
            }
            let buf = self.cache.bread(BlockNumber(old_ind))?;
            let bytes = buf.data().clone();
            self.update_usage(old_ind, -BLOCK_BYTES);
            bytes
        };
        write_le_u32(&mut bytes, ibn * 4, new_addr);
        self.write_block_bytes(new_ind, &bytes)?;

        ip.with_state(|s| s.addrs[NDIRECT] = new_ind);
        Ok(())
    }

    /// Discard an inode's content: every referenced block goes dead in the
    /// SUT, the pointers clear, and the version increments so stale SSB
    /// entries stop matching.
    pub(crate) fn itrunc(&self, ip: &crate::inodes::InodeHandle) -> Result<()> {
        let addrs = ip.inner.with_state(|s| s.addrs);

        for addr in addrs.iter().take(NDIRECT) {
            if *addr != 0 {
                self.update_usage(*addr, -BLOCK_BYTES);
            }
        }

        let ind = addrs[NDIRECT];
        if ind != 0 {
            if ind < self.geo.size {
                let bytes = {
                    let buf = self.cache.bread(BlockNumber(ind))?;
                    let data = buf.data();
                    data.clone()
                };
                for i in 0..NINDIRECT {
                    let addr = read_le_u32(&bytes, i * 4).expect("indirect slot in range");
                    if addr != 0 {
                        self.update_usage(addr, -BLOCK_BYTES);
                    }
                }
            }
            self.update_usage(ind, -BLOCK_BYTES);
        }

        let (inum, version, di) = ip.inner.with_state(|s| {
            s.addrs = [0; NDIRECT + 1];
            s.size = 0;
            s.version = s.version.bumped();
            (ip.inner.inum, s.version, s.to_dinode())
        });
        self.iupdate_raw(inum, version, di)
    }
}
