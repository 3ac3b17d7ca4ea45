//! The group-descriptor table: one record per block group, loaded at mount
//! time and written back lazily per dirty entry. Entries are stored at a
//! fixed 64-byte in-memory stride regardless of the on-disk stride
//! (`desc_size`, 32 or 64 bytes), so code never needs to special-case the
//! smaller on-disk layout except at (de)serialization boundaries.

use crate::disk::Disk;
use crate::error::Result;
use crate::superblock::{
    Superblock, EXT4_MIN_DESC_SIZE_64BIT, INCOMPAT_META_BG, RO_COMPAT_SPARSE_SUPER,
};

/// In-memory record size; always large enough to hold the 64-bit fields
/// even when the on-disk stride is 32 bytes.
pub const DESC_RECORD_SIZE: usize = 64;

/// Group flag: block bitmap not yet initialized on disk.
pub const BG_BLOCK_UNINIT: u16 = 0x0001;
/// Group flag: inode bitmap not yet initialized on disk.
pub const BG_INODE_UNINIT: u16 = 0x0002;

const OFF_BLOCK_BITMAP_LO: usize = 0x00;
const OFF_INODE_BITMAP_LO: usize = 0x04;
const OFF_INODE_TABLE_LO: usize = 0x08;
const OFF_FREE_BLOCKS_COUNT_LO: usize = 0x0C;
const OFF_FREE_INODES_COUNT_LO: usize = 0x0E;
const OFF_USED_DIRS_COUNT_LO: usize = 0x10;
const OFF_FLAGS: usize = 0x12;
const OFF_ITABLE_UNUSED_LO: usize = 0x1C;
const OFF_BLOCK_BITMAP_HI: usize = 0x20;
const OFF_INODE_BITMAP_HI: usize = 0x24;
const OFF_INODE_TABLE_HI: usize = 0x28;
const OFF_FREE_BLOCKS_COUNT_HI: usize = 0x2C;
const OFF_FREE_INODES_COUNT_HI: usize = 0x2E;
const OFF_USED_DIRS_COUNT_HI: usize = 0x30;
const OFF_ITABLE_UNUSED_HI: usize = 0x32;

fn get_u32(raw: &[u8], off: usize) -> u32 {
    u32::from_le_bytes(raw[off..off + 4].try_into().unwrap())
}

fn set_u32(raw: &mut [u8], off: usize, val: u32) {
    raw[off..off + 4].copy_from_slice(&val.to_le_bytes());
}

fn get_u16(raw: &[u8], off: usize) -> u16 {
    u16::from_le_bytes(raw[off..off + 2].try_into().unwrap())
}

fn set_u16(raw: &mut [u8], off: usize, val: u16) {
    raw[off..off + 2].copy_from_slice(&val.to_le_bytes());
}

/// A single group descriptor entry.
pub struct GroupDescriptor {
    raw: [u8; DESC_RECORD_SIZE],
    has_64bit: bool,
    dirty: bool,
}

impl GroupDescriptor {
    fn new(has_64bit: bool) -> Self {
        Self {
            raw: [0u8; DESC_RECORD_SIZE],
            has_64bit,
            dirty: false,
        }
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn flags(&self) -> u16 {
        get_u16(&self.raw, OFF_FLAGS)
    }

    pub fn set_flags(&mut self, flags: u16) {
        set_u16(&mut self.raw, OFF_FLAGS, flags);
        self.dirty = true;
    }

    pub fn block_bitmap(&self) -> u64 {
        self.get_split(OFF_BLOCK_BITMAP_LO, OFF_BLOCK_BITMAP_HI)
    }

    pub fn set_block_bitmap(&mut self, val: u64) {
        self.set_split(OFF_BLOCK_BITMAP_LO, OFF_BLOCK_BITMAP_HI, val);
    }

    pub fn inode_bitmap(&self) -> u64 {
        self.get_split(OFF_INODE_BITMAP_LO, OFF_INODE_BITMAP_HI)
    }

    pub fn set_inode_bitmap(&mut self, val: u64) {
        self.set_split(OFF_INODE_BITMAP_LO, OFF_INODE_BITMAP_HI, val);
    }

    pub fn inode_table(&self) -> u64 {
        self.get_split(OFF_INODE_TABLE_LO, OFF_INODE_TABLE_HI)
    }

    pub fn set_inode_table(&mut self, val: u64) {
        self.set_split(OFF_INODE_TABLE_LO, OFF_INODE_TABLE_HI, val);
    }

    pub fn free_blocks_count(&self) -> u32 {
        self.get_split16(OFF_FREE_BLOCKS_COUNT_LO, OFF_FREE_BLOCKS_COUNT_HI)
    }

    pub fn set_free_blocks_count(&mut self, val: u32) {
        self.set_split16(OFF_FREE_BLOCKS_COUNT_LO, OFF_FREE_BLOCKS_COUNT_HI, val);
    }

    pub fn free_inodes_count(&self) -> u32 {
        self.get_split16(OFF_FREE_INODES_COUNT_LO, OFF_FREE_INODES_COUNT_HI)
    }

    pub fn set_free_inodes_count(&mut self, val: u32) {
        self.set_split16(OFF_FREE_INODES_COUNT_LO, OFF_FREE_INODES_COUNT_HI, val);
    }

    pub fn used_dirs_count(&self) -> u32 {
        self.get_split16(OFF_USED_DIRS_COUNT_LO, OFF_USED_DIRS_COUNT_HI)
    }

    pub fn set_used_dirs_count(&mut self, val: u32) {
        self.set_split16(OFF_USED_DIRS_COUNT_LO, OFF_USED_DIRS_COUNT_HI, val);
    }

    pub fn itable_unused_count(&self) -> u32 {
        self.get_split16(OFF_ITABLE_UNUSED_LO, OFF_ITABLE_UNUSED_HI)
    }

    pub fn set_itable_unused_count(&mut self, val: u32) {
        self.set_split16(OFF_ITABLE_UNUSED_LO, OFF_ITABLE_UNUSED_HI, val);
    }

    fn get_split(&self, off_lo: usize, off_hi: usize) -> u64 {
        let lo = get_u32(&self.raw, off_lo) as u64;
        let hi = if self.has_64bit {
            get_u32(&self.raw, off_hi) as u64
        } else {
            0
        };
        (hi << 32) | lo
    }

    fn set_split(&mut self, off_lo: usize, off_hi: usize, val: u64) {
        set_u32(&mut self.raw, off_lo, val as u32);
        if self.has_64bit {
            set_u32(&mut self.raw, off_hi, (val >> 32) as u32);
        }
        self.dirty = true;
    }

    fn get_split16(&self, off_lo: usize, off_hi: usize) -> u32 {
        let lo = get_u16(&self.raw, off_lo) as u32;
        let hi = if self.has_64bit {
            get_u16(&self.raw, off_hi) as u32
        } else {
            0
        };
        (hi << 16) | lo
    }

    fn set_split16(&mut self, off_lo: usize, off_hi: usize, val: u32) {
        set_u16(&mut self.raw, off_lo, val as u16);
        if self.has_64bit {
            set_u16(&mut self.raw, off_hi, (val >> 16) as u16);
        }
        self.dirty = true;
    }
}

/// Whether the sparse-superblock predicate holds for `group`: true for
/// groups 0 and 1, and for groups equal to a power of 3, 5, or 7.
pub fn ext4_bg_has_super(sb: &Superblock, group: u32) -> bool {
    if !sb.has_ro_compat(RO_COMPAT_SPARSE_SUPER) {
        return true;
    }
    if group == 0 || group == 1 {
        return true;
    }
    for base in [3u32, 5, 7] {
        let mut p = base;
        while p < group {
            p = match p.checked_mul(base) {
                Some(v) => v,
                None => break,
            };
        }
        if p == group {
            return true;
        }
    }
    false
}

/// Number of group-descriptor-table blocks stored in `group`, accounting
/// for Meta-BG.
pub fn ext4_bg_num_gdb(sb: &Superblock, group: u32, n_gdb: u32) -> u32 {
    let desc_per_block = sb.block_size() / sb.desc_size() as u32;
    let meta_group = if desc_per_block == 0 {
        0
    } else {
        group / desc_per_block
    };
    if !sb.has_incompat(INCOMPAT_META_BG) || meta_group < sb.first_meta_bg() {
        if ext4_bg_has_super(sb, group) {
            n_gdb
        } else {
            0
        }
    } else {
        let first = meta_group * desc_per_block;
        let last = first + desc_per_block - 1;
        if group == first || group == first + 1 || group == last {
            1
        } else {
            0
        }
    }
}

/// Filesystem block number of the group-descriptor block `nr`
/// (0-based index into the descriptor table's own block list, not a group
/// number).
pub fn descriptor_loc(sb: &Superblock, nr: u32) -> u64 {
    let desc_per_block = sb.block_size() / sb.desc_size() as u32;
    if !sb.has_incompat(INCOMPAT_META_BG) || nr < sb.first_meta_bg() {
        sb.sb_block() as u64 + nr as u64 + 1
    } else {
        let group = nr * desc_per_block;
        let first_block = sb.first_data_block() as u64 + group as u64 * sb.blocks_per_group() as u64;
        first_block + if ext4_bg_has_super(sb, group) { 1 } else { 0 }
    }
}

/// The group-descriptor table.
pub struct GroupDescriptorTable {
    entries: Vec<GroupDescriptor>,
    desc_size: u16,
}

impl GroupDescriptorTable {
    /// Read every group's descriptor from `disk`.
    pub fn load(disk: &Disk, sb: &Superblock) -> Result<Self> {
        let n = sb.n_block_groups();
        let desc_size = sb.desc_size();
        let has_64bit = desc_size >= EXT4_MIN_DESC_SIZE_64BIT;
        let desc_per_block = sb.block_size() / desc_size as u32;
        let mut entries = Vec::with_capacity(n as usize);
        for i in 0..n {
            let block = descriptor_loc(sb, i / desc_per_block);
            let offset = (block << sb.block_size_bits())
                + (desc_size as u64 * (i % desc_per_block) as u64);
            let mut gd = GroupDescriptor::new(has_64bit);
            disk.read(offset, &mut gd.raw[..desc_size as usize])?;
            gd.dirty = false;
            entries.push(gd);
        }
        Ok(Self { entries, desc_size })
    }

    /// Write back every dirty descriptor.
    pub fn writeback(&mut self, disk: &Disk, sb: &Superblock) -> Result<()> {
        let desc_per_block = sb.block_size() / self.desc_size as u32;
        for (i, gd) in self.entries.iter_mut().enumerate() {
            if !gd.dirty {
                continue;
            }
            let i = i as u32;
            let block = descriptor_loc(sb, i / desc_per_block);
            let offset = (block << sb.block_size_bits())
                + (self.desc_size as u64 * (i % desc_per_block) as u64);
            disk.write(offset, &gd.raw[..self.desc_size as usize])?;
            gd.dirty = false;
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, group: u32) -> &GroupDescriptor {
        &self.entries[group as usize]
    }

    pub fn get_mut(&mut self, group: u32) -> &mut GroupDescriptor {
        &mut self.entries[group as usize]
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn sparse_super_predicate() {
        use crate::superblock::{test_set_ro_compat, test_superblock};
        let mut sb = test_superblock(8192, 2048, 256);
        test_set_ro_compat(&mut sb, RO_COMPAT_SPARSE_SUPER);
        for g in [0u32, 1, 3, 5, 7, 9, 25, 49] {
            assert!(ext4_bg_has_super(&sb, g), "group {g} should carry a backup");
        }
        for g in [2u32, 4, 6, 8, 10] {
            assert!(!ext4_bg_has_super(&sb, g), "group {g} should not carry a backup");
        }
    }

    #[test]
    fn no_sparse_super_means_every_group_has_backup() {
        use crate::superblock::test_superblock;
        let sb = test_superblock(8192, 2048, 256);
        assert!(ext4_bg_has_super(&sb, 2));
        assert!(ext4_bg_has_super(&sb, 10));
    }

    #[test]
    fn split_fields_ignore_hi_half_for_32_byte_descriptors() {
        let mut gd = GroupDescriptor::new(false);
        gd.set_block_bitmap(0x1_0000_0005);
        // hi half silently dropped: 32-bit descriptors cannot represent it.
        assert_eq!(gd.block_bitmap(), 0x00000005);
    }

    #[test]
    fn split_fields_round_trip_for_64_byte_descriptors() {
        let mut gd = GroupDescriptor::new(true);
        gd.set_block_bitmap(0x1_0000_0005);
        assert_eq!(gd.block_bitmap(), 0x1_0000_0005);
    }
}
