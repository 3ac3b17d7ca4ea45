//! The ext4 superblock: in-memory image, geometry accessors, and
//! writeback. The on-disk record is 1024 bytes starting at byte offset
//! 0x400; fields are accessed at fixed little-endian byte offsets so that
//! bytes this crate does not interpret still round-trip unchanged through
//! `super_fill`/`super_writeback`.

use log::info;
use uuid::Uuid;

use crate::disk::Disk;
use crate::error::Result;

/// Byte offset of the superblock within the device.
pub const BOOT_SECTOR_SIZE: u64 = 0x400;
/// On-disk size of the superblock record.
pub const SUPERBLOCK_SIZE: usize = 1024;
/// Minimum block size ext4 supports; used to derive the block containing
/// the superblock on small-block-size filesystems.
pub const EXT4_MIN_BLOCK_SIZE: u32 = 1024;

const OFF_BLOCKS_COUNT_LO: usize = 0x04;
const OFF_R_BLOCKS_COUNT_LO: usize = 0x08;
const OFF_FREE_BLOCKS_COUNT_LO: usize = 0x0C;
const OFF_FIRST_DATA_BLOCK: usize = 0x14;
const OFF_LOG_BLOCK_SIZE: usize = 0x18;
const OFF_BLOCKS_PER_GROUP: usize = 0x20;
const OFF_INODES_PER_GROUP: usize = 0x28;
const OFF_INODE_SIZE: usize = 0x58;
const OFF_FEATURE_COMPAT: usize = 0x5C;
const OFF_FEATURE_INCOMPAT: usize = 0x60;
const OFF_FEATURE_RO_COMPAT: usize = 0x64;
const OFF_UUID: usize = 0x68;
const OFF_RESERVED_GDT_BLOCKS: usize = 0xCE;
const OFF_DESC_SIZE: usize = 0xFE;
const OFF_FIRST_META_BG: usize = 0x104;
const OFF_BLOCKS_COUNT_HI: usize = 0x150;
const OFF_R_BLOCKS_COUNT_HI: usize = 0x154;
const OFF_FREE_BLOCKS_COUNT_HI: usize = 0x158;

/// `RO_COMPAT_SPARSE_SUPER`
pub const RO_COMPAT_SPARSE_SUPER: u32 = 0x0001;
/// `RO_COMPAT_HUGE_FILE`
pub const RO_COMPAT_HUGE_FILE: u32 = 0x0008;
/// `INCOMPAT_META_BG`
pub const INCOMPAT_META_BG: u32 = 0x0010;
/// `INCOMPAT_FLEX_BG`
pub const INCOMPAT_FLEX_BG: u32 = 0x0200;

/// `EXT4_MIN_DESC_SIZE`
pub const EXT4_MIN_DESC_SIZE: u16 = 32;
/// `EXT4_MIN_DESC_SIZE_64BIT`
pub const EXT4_MIN_DESC_SIZE_64BIT: u16 = 64;

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

/// In-memory image of the ext4 superblock.
pub struct Superblock {
    raw: [u8; SUPERBLOCK_SIZE],
    dirty: bool,
}

impl Superblock {
    /// Load the superblock from `disk`.
    pub fn load(disk: &Disk) -> Result<Self> {
        let mut raw = [0u8; SUPERBLOCK_SIZE];
        disk.read(BOOT_SECTOR_SIZE, &mut raw)?;
        let sb = Self { raw, dirty: false };
        info!(
            "superblock loaded: block_size={} blocks_per_group={} inodes_per_group={} inode_size={} groups={}",
            sb.block_size(),
            sb.blocks_per_group(),
            sb.inodes_per_group(),
            sb.inode_size(),
            sb.n_block_groups(),
        );
        Ok(sb)
    }

    /// Write the superblock back to `disk` if dirty, then clear the dirty
    /// flag.
    pub fn writeback(&mut self, disk: &Disk) -> Result<()> {
        if !self.dirty {
            return Ok(());
        }
        disk.write(BOOT_SECTOR_SIZE, &self.raw)?;
        self.dirty = false;
        Ok(())
    }

    /// Whether the in-memory image has unwritten changes.
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Block size in bytes, derived from `s_log_block_size`.
    pub fn block_size(&self) -> u32 {
        1u32 << (get_u32(&self.raw, OFF_LOG_BLOCK_SIZE) + 10)
    }

    /// `log2(block_size)`, as used by the buffer cache.
    pub fn block_size_bits(&self) -> u32 {
        get_u32(&self.raw, OFF_LOG_BLOCK_SIZE) + 10
    }

    pub fn first_data_block(&self) -> u32 {
        get_u32(&self.raw, OFF_FIRST_DATA_BLOCK)
    }

    pub fn blocks_per_group(&self) -> u32 {
        get_u32(&self.raw, OFF_BLOCKS_PER_GROUP)
    }

    pub fn inodes_per_group(&self) -> u32 {
        get_u32(&self.raw, OFF_INODES_PER_GROUP)
    }

    pub fn inode_size(&self) -> u16 {
        get_u16(&self.raw, OFF_INODE_SIZE)
    }

    pub fn feature_compat(&self) -> u32 {
        get_u32(&self.raw, OFF_FEATURE_COMPAT)
    }

    pub fn feature_incompat(&self) -> u32 {
        get_u32(&self.raw, OFF_FEATURE_INCOMPAT)
    }

    pub fn feature_ro_compat(&self) -> u32 {
        get_u32(&self.raw, OFF_FEATURE_RO_COMPAT)
    }

    pub fn has_incompat(&self, flag: u32) -> bool {
        self.feature_incompat() & flag != 0
    }

    pub fn has_ro_compat(&self, flag: u32) -> bool {
        self.feature_ro_compat() & flag != 0
    }

    pub fn first_meta_bg(&self) -> u32 {
        get_u32(&self.raw, OFF_FIRST_META_BG)
    }

    pub fn reserved_gdt_blocks(&self) -> u16 {
        get_u16(&self.raw, OFF_RESERVED_GDT_BLOCKS)
    }

    /// Effective on-disk group-descriptor size: `EXT4_MIN_DESC_SIZE` if
    /// `s_desc_size == 0`, else the stored value.
    pub fn desc_size(&self) -> u16 {
        let raw = get_u16(&self.raw, OFF_DESC_SIZE);
        if raw == 0 {
            EXT4_MIN_DESC_SIZE
        } else {
            raw
        }
    }

    /// Volume UUID, decoded from `s_uuid`.
    pub fn uuid(&self) -> Uuid {
        let bytes: [u8; 16] = self.raw[OFF_UUID..OFF_UUID + 16].try_into().unwrap();
        Uuid::from_bytes(bytes)
    }

    pub fn blocks_count(&self) -> u64 {
        let lo = get_u32(&self.raw, OFF_BLOCKS_COUNT_LO) as u64;
        let hi = get_u32(&self.raw, OFF_BLOCKS_COUNT_HI) as u64;
        (hi << 32) | lo
    }

    pub fn set_blocks_count(&mut self, count: u64) {
        set_u32(&mut self.raw, OFF_BLOCKS_COUNT_LO, count as u32);
        set_u32(&mut self.raw, OFF_BLOCKS_COUNT_HI, (count >> 32) as u32);
        self.dirty = true;
    }

    pub fn r_blocks_count(&self) -> u64 {
        let lo = get_u32(&self.raw, OFF_R_BLOCKS_COUNT_LO) as u64;
        let hi = get_u32(&self.raw, OFF_R_BLOCKS_COUNT_HI) as u64;
        (hi << 32) | lo
    }

    pub fn set_r_blocks_count(&mut self, count: u64) {
        set_u32(&mut self.raw, OFF_R_BLOCKS_COUNT_LO, count as u32);
        set_u32(&mut self.raw, OFF_R_BLOCKS_COUNT_HI, (count >> 32) as u32);
        self.dirty = true;
    }

    pub fn free_blocks_count(&self) -> u64 {
        let lo = get_u32(&self.raw, OFF_FREE_BLOCKS_COUNT_LO) as u64;
        let hi = get_u32(&self.raw, OFF_FREE_BLOCKS_COUNT_HI) as u64;
        (hi << 32) | lo
    }

    pub fn set_free_blocks_count(&mut self, count: u64) {
        set_u32(&mut self.raw, OFF_FREE_BLOCKS_COUNT_LO, count as u32);
        set_u32(&mut self.raw, OFF_FREE_BLOCKS_COUNT_HI, (count >> 32) as u32);
        self.dirty = true;
    }

    /// Number of block groups, `ceil(blocks_count / blocks_per_group)`.
    pub fn n_block_groups(&self) -> u32 {
        let blocks = self.blocks_count();
        let bpg = self.blocks_per_group() as u64;
        ((blocks + bpg - 1) / bpg) as u32
    }

    /// Filesystem block number holding the superblock itself, used as the
    /// base for group-descriptor-table offset arithmetic. 1 when the block
    /// size is the minimum (1024, so the superblock's 1024..2048 byte range
    /// falls in block 1); 0 for any larger block size, where the superblock
    /// falls inside block 0 alongside the boot sector.
    pub fn sb_block(&self) -> u32 {
        EXT4_MIN_BLOCK_SIZE / self.block_size()
    }
}

#[cfg(test)]
pub(crate) fn test_superblock(blocks_per_group: u32, inodes_per_group: u32, inode_size: u16) -> Superblock {
    let mut raw = [0u8; SUPERBLOCK_SIZE];
    set_u32(&mut raw, OFF_LOG_BLOCK_SIZE, 0);
    set_u32(&mut raw, OFF_BLOCKS_PER_GROUP, blocks_per_group);
    set_u32(&mut raw, OFF_INODES_PER_GROUP, inodes_per_group);
    set_u16(&mut raw, OFF_INODE_SIZE, inode_size);
    Superblock { raw, dirty: false }
}

#[cfg(test)]
pub(crate) fn test_set_ro_compat(sb: &mut Superblock, flag: u32) {
    let cur = get_u32(&sb.raw, OFF_FEATURE_RO_COMPAT);
    set_u32(&mut sb.raw, OFF_FEATURE_RO_COMPAT, cur | flag);
}

#[cfg(test)]
pub(crate) fn test_set_incompat(sb: &mut Superblock, flag: u32) {
    let cur = get_u32(&sb.raw, OFF_FEATURE_INCOMPAT);
    set_u32(&mut sb.raw, OFF_FEATURE_INCOMPAT, cur | flag);
}

#[cfg(test)]
mod test {
    use super::*;

    fn blank_sb() -> Superblock {
        let mut raw = [0u8; SUPERBLOCK_SIZE];
        set_u32(&mut raw, OFF_LOG_BLOCK_SIZE, 0); // 1024-byte blocks
        set_u32(&mut raw, OFF_BLOCKS_PER_GROUP, 8192);
        set_u32(&mut raw, OFF_INODES_PER_GROUP, 2048);
        set_u16(&mut raw, OFF_INODE_SIZE, 256);
        Superblock { raw, dirty: false }
    }

    #[test]
    fn block_size_derivation() {
        let sb = blank_sb();
        assert_eq!(sb.block_size(), 1024);
    }

    #[test]
    fn n_block_groups_rounds_up() {
        let mut sb = blank_sb();
        sb.set_blocks_count(8193);
        assert_eq!(sb.n_block_groups(), 2);
    }

    #[test]
    fn counts_round_trip_through_64_bits() {
        let mut sb = blank_sb();
        let big = (1u64 << 40) + 7;
        sb.set_blocks_count(big);
        assert_eq!(sb.blocks_count(), big);
    }

    #[test]
    fn desc_size_defaults_to_minimum() {
        let sb = blank_sb();
        assert_eq!(sb.desc_size(), EXT4_MIN_DESC_SIZE);
    }

    #[test]
    fn sb_block_is_one_at_minimum_block_size_else_zero() {
        let sb = blank_sb();
        assert_eq!(sb.block_size(), 1024);
        assert_eq!(sb.sb_block(), 1);

        let mut raw = [0u8; SUPERBLOCK_SIZE];
        set_u32(&mut raw, OFF_LOG_BLOCK_SIZE, 2); // 4096-byte blocks
        let sb4k = Superblock { raw, dirty: false };
        assert_eq!(sb4k.block_size(), 4096);
        assert_eq!(sb4k.sb_block(), 0);
    }
}
