//! The in-memory inode handle: pairs a raw on-disk inode record with its
//! inode number, exposes the 15-slot block-pointer array without the
//! original driver's raw-pointer aliasing, and tracks a dirty flag for
//! writeback.

use crate::error::Result;
use crate::superblock::RO_COMPAT_HUGE_FILE;
use crate::superblock::Superblock;

/// `HUGE_FILE_FL`: this inode's `i_blocks` is already expressed in
/// filesystem blocks rather than 512-byte sectors.
pub const HUGE_FILE_FL: u32 = 0x0004_0000;

/// The on-disk ext4 inode record (128-byte base; extended fields beyond
/// the base size are out of scope). Field order and widths are chosen so
/// natural alignment already matches the on-disk byte layout with no
/// padding, so this can be `#[repr(C)]` rather than `packed`, letting
/// callers take ordinary references into individual fields.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct RawInode {
    pub i_mode: u16,
    pub i_uid: u16,
    pub i_size_lo: u32,
    pub i_atime: u32,
    pub i_ctime: u32,
    pub i_mtime: u32,
    pub i_dtime: u32,
    pub i_gid: u16,
    pub i_links_count: u16,
    pub i_blocks_lo: u32,
    pub i_flags: u32,
    osd1: u32,
    pub i_block: [u32; 15],
    pub i_generation: u32,
    pub i_file_acl_lo: u32,
    pub i_size_high: u32,
    i_obso_faddr: u32,
    pub l_i_blocks_high: u16,
    l_i_file_acl_high: u16,
    l_i_uid_high: u16,
    l_i_gid_high: u16,
    l_i_checksum_lo: u16,
    l_i_reserved: u16,
}

impl Default for RawInode {
    fn default() -> Self {
        // SAFETY: an all-zero bit pattern is a valid `RawInode`.
        unsafe { std::mem::zeroed() }
    }
}

/// Fetch/persist the raw inode record at its inode-table offset. The
/// concrete implementation (inode-table lookup, directory/extent
/// resolution) lives outside the core; see `Ext4Core`'s `DiskInodeStore`
/// for the minimal disk-backed implementation this crate ships.
pub trait InodeStore {
    fn get_by_number(&mut self, ino: u32) -> Result<RawInode>;
    fn set_by_number(&mut self, ino: u32, raw: &RawInode) -> Result<()>;
}

/// An in-memory handle to an inode. `i_ino == 0` marks an anonymous,
/// temporary inode that is never written back.
pub struct Inode {
    pub(crate) i_ino: u32,
    raw_inode: RawInode,
    dirty: bool,
}

impl Inode {
    /// Wrap a raw inode record fetched by the caller.
    pub fn get(ino: u32, raw_inode: RawInode) -> Self {
        Self {
            i_ino: ino,
            raw_inode,
            dirty: false,
        }
    }

    pub fn ino(&self) -> u32 {
        self.i_ino
    }

    pub fn raw(&self) -> &RawInode {
        &self.raw_inode
    }

    /// Mutable view of the inode's direct/indirect/extent block-pointer
    /// slots. Replaces the original driver's `i_data` pointer alias.
    pub fn i_block_mut(&mut self) -> &mut [u32; 15] {
        self.dirty = true;
        &mut self.raw_inode.i_block
    }

    pub fn mark_dirty(&mut self) {
        self.dirty = true;
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Write the record back through `store` if dirty and non-anonymous,
    /// then consume the handle.
    pub fn put(mut self, store: &mut dyn InodeStore) -> Result<()> {
        if self.dirty && self.i_ino != 0 {
            store.set_by_number(self.i_ino, &self.raw_inode)?;
            self.dirty = false;
        }
        Ok(())
    }

    /// 64-bit file size, assembled from `i_size_lo`/`i_size_high`.
    pub fn size(&self) -> u64 {
        let lo = self.raw_inode.i_size_lo as u64;
        let hi = self.raw_inode.i_size_high as u64;
        (hi << 32) | lo
    }

    /// Set the 64-bit file size, marking the inode dirty.
    pub fn set_size(&mut self, size: u64) {
        self.raw_inode.i_size_lo = size as u32;
        self.raw_inode.i_size_high = (size >> 32) as u32;
        self.dirty = true;
    }

    /// Physical block count, decoded per `ext4_inode_blocks`.
    pub fn blocks(&self, sb: &Superblock) -> u64 {
        ext4_inode_blocks(sb, &self.raw_inode)
    }

    /// Set the physical block count, marking the inode dirty.
    pub fn set_blocks(&mut self, sb: &Superblock, blocks: u64) {
        ext4_set_inode_blocks(sb, &mut self.raw_inode, blocks);
        self.dirty = true;
    }
}

/// Decode `i_blocks` into a filesystem-block count.
///
/// Without `HUGE_FILE` the field is always in 512-byte sectors. With
/// `HUGE_FILE` supported, the combined 48-bit `l_i_blocks_high:i_blocks_lo`
/// value is in filesystem blocks when `HUGE_FILE_FL` is set on the inode,
/// and in sectors otherwise.
pub fn ext4_inode_blocks(sb: &Superblock, raw: &RawInode) -> u64 {
    let shift = sb.block_size_bits() - 9;
    if sb.has_ro_compat(RO_COMPAT_HUGE_FILE) {
        let blocks = ((raw.l_i_blocks_high as u64) << 32) | raw.i_blocks_lo as u64;
        if raw.i_flags & HUGE_FILE_FL != 0 {
            blocks
        } else {
            blocks >> shift
        }
    } else {
        (raw.i_blocks_lo as u64) >> shift
    }
}

/// Encode a filesystem-block count into `i_blocks`, inverse of
/// [`ext4_inode_blocks`].
pub fn ext4_set_inode_blocks(sb: &Superblock, raw: &mut RawInode, blocks: u64) {
    let shift = sb.block_size_bits() - 9;
    if sb.has_ro_compat(RO_COMPAT_HUGE_FILE) && raw.i_flags & HUGE_FILE_FL != 0 {
        raw.i_blocks_lo = blocks as u32;
        raw.l_i_blocks_high = (blocks >> 32) as u16;
    } else {
        let sectors = blocks << shift;
        raw.i_blocks_lo = sectors as u32;
        raw.l_i_blocks_high = if sb.has_ro_compat(RO_COMPAT_HUGE_FILE) {
            (sectors >> 32) as u16
        } else {
            0
        };
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::superblock::{test_set_ro_compat, test_superblock};

    #[test]
    fn raw_inode_is_128_bytes() {
        assert_eq!(std::mem::size_of::<RawInode>(), 128);
    }

    #[test]
    fn blocks_round_trip_without_huge_file() {
        let sb = test_superblock(8192, 2048, 128);
        let mut raw = RawInode::default();
        ext4_set_inode_blocks(&sb, &mut raw, 40);
        assert_eq!(ext4_inode_blocks(&sb, &raw), 40);
    }

    #[test]
    fn blocks_round_trip_with_huge_file_flag() {
        let mut sb = test_superblock(8192, 2048, 128);
        test_set_ro_compat(&mut sb, RO_COMPAT_HUGE_FILE);
        let mut raw = RawInode::default();
        raw.i_flags |= HUGE_FILE_FL;
        let big = 1u64 << 40;
        ext4_set_inode_blocks(&sb, &mut raw, big);
        assert_eq!(ext4_inode_blocks(&sb, &raw), big);
    }

    #[test]
    fn size_round_trip() {
        let mut inode = Inode::get(0, RawInode::default());
        inode.set_size(0x1_0000_0001);
        assert_eq!(inode.size(), 0x1_0000_0001);
    }
}
