//! Lazy block-bitmap initialization and the first-fit block allocator.
//!
//! These are free functions taking the pieces they need explicitly (disk,
//! buffer cache, superblock, group-descriptor table) rather than methods on
//! one large struct, mirroring the original driver's own free-function
//! style over process-global state, except here the state is borrowed
//! from the caller instead of reached into globally.

use log::{error, warn};

use crate::bitmap::{find_next_zero_bit, find_zero_run_len, mark_bitmap_end, set_bits};
use crate::buffer::BufferCache;
use crate::config::MountConfig;
use crate::disk::Disk;
use crate::error::{Ext4Error, Result};
use crate::group_desc::{ext4_bg_num_gdb, GroupDescriptorTable, BG_BLOCK_UNINIT};
use crate::inode::Inode;
use crate::superblock::{Superblock, INCOMPAT_FLEX_BG, INCOMPAT_META_BG};

/// Number of filesystem blocks actually belonging to `group`, accounting
/// for the last group's remainder.
pub fn group_blocks(sb: &Superblock, group: u32) -> u32 {
    let n_groups = sb.n_block_groups();
    if group + 1 < n_groups {
        sb.blocks_per_group()
    } else {
        let total = sb.blocks_count() - sb.first_data_block() as u64;
        let bpg = sb.blocks_per_group() as u64;
        (total - bpg * (n_groups - 1) as u64) as u32
    }
}

/// Count of the group's own metadata blocks (block bitmap, inode bitmap,
/// each inode-table block) that actually physically reside in this group.
/// Without Flex-BG this is always `itable_blocks_per_group + 2`.
fn group_used_meta_blocks(sb: &Superblock, gdt: &GroupDescriptorTable, group: u32) -> u32 {
    let itable_blocks = sb.inodes_per_group() / (sb.block_size() / sb.inode_size() as u32).max(1);
    let mut used = itable_blocks + 2;
    if !sb.has_incompat(INCOMPAT_FLEX_BG) {
        return used;
    }
    let gd = gdt.get(group);
    let group_first = sb.first_data_block() as u64 + group as u64 * sb.blocks_per_group() as u64;
    let group_last = group_first + group_blocks(sb, group) as u64;
    let in_group = |block: u64| block >= group_first && block < group_last;
    if !in_group(gd.block_bitmap()) {
        used -= 1;
    }
    if !in_group(gd.inode_bitmap()) {
        used -= 1;
    }
    let table_start = gd.inode_table();
    for i in 0..itable_blocks as u64 {
        if !in_group(table_start + i) {
            used -= 1;
        }
    }
    used
}

/// Reserved-block count (`bit_max`) at the start of the group: the
/// superblock backup (if any), the group-descriptor-table blocks stored
/// here, and the reserved GDT growth blocks.
fn reserved_bit_max(sb: &Superblock, gdt: &GroupDescriptorTable, group: u32) -> u32 {
    use crate::group_desc::ext4_bg_has_super;
    let has_super = ext4_bg_has_super(sb, group);
    let mut bit_max = if has_super { 1 } else { 0 };
    let desc_per_block = (sb.block_size() / sb.desc_size() as u32).max(1);
    let in_meta_bg_range = sb.has_incompat(INCOMPAT_META_BG) && group >= sb.first_meta_bg() * desc_per_block;
    if !in_meta_bg_range {
        if bit_max > 0 {
            let n_gdb = (gdt.len() as u32).div_ceil(desc_per_block);
            bit_max += ext4_bg_num_gdb(sb, group, n_gdb) + sb.reserved_gdt_blocks() as u32;
        }
    } else {
        let n_gdb = (gdt.len() as u32).div_ceil(desc_per_block);
        bit_max += ext4_bg_num_gdb(sb, group, n_gdb);
    }
    bit_max
}

/// Whether `group`'s block bitmap has already been materialized on disk.
pub fn is_block_bitmap_inited(gdt: &GroupDescriptorTable, group: u32) -> bool {
    gdt.get(group).flags() & BG_BLOCK_UNINIT == 0
}

/// Build the block bitmap for `group` from geometry alone. If `data` is
/// `Some`, the bitmap bytes are materialized into it; in either case the
/// free-block count for the group is returned (before subtracting the
/// group's own metadata usage, which the caller folds in separately via
/// [`group_used_meta_blocks`]).
fn build_block_bitmap(sb: &Superblock, gdt: &GroupDescriptorTable, group: u32, data: Option<&mut [u8]>) -> u32 {
    let bit_max = reserved_bit_max(sb, gdt, group);
    let blocks = group_blocks(sb, group);
    let free_blocks = blocks - bit_max;
    if let Some(buf) = data {
        buf.fill(0);
        if bit_max > 0 {
            set_bits(buf, 0, bit_max);
        }
        let gd = gdt.get(group);
        let group_first = sb.first_data_block() as u64 + group as u64 * sb.blocks_per_group() as u64;
        let itable_blocks = sb.inodes_per_group() / (sb.block_size() / sb.inode_size() as u32).max(1);
        let mut mark = |block: u64| {
            if !sb.has_incompat(INCOMPAT_FLEX_BG) || (block >= group_first && block < group_first + blocks as u64) {
                if block >= group_first {
                    let rel = (block - group_first) as u32;
                    if rel < blocks {
                        crate::bitmap::set_bit(buf, rel);
                    }
                }
            }
        };
        mark(gd.block_bitmap());
        mark(gd.inode_bitmap());
        for i in 0..itable_blocks as u64 {
            mark(gd.inode_table() + i);
        }
        mark_bitmap_end(blocks, sb.block_size() * 8, buf);
    }
    free_blocks
}

/// Materialize `group`'s block bitmap (via `bwrite`, no pre-read) if it is
/// still marked uninitialized, and clear the flag.
pub fn try_to_init_block_bitmap(
    cache: &mut BufferCache,
    disk: &Disk,
    sb: &Superblock,
    gdt: &mut GroupDescriptorTable,
    group: u32,
) -> Result<()> {
    if is_block_bitmap_inited(gdt, group) {
        return Ok(());
    }
    let block_bitmap_block = gdt.get(group).block_bitmap();
    let bh = cache.bwrite(block_bitmap_block)?;
    let free_blocks = build_block_bitmap(sb, gdt, group, Some(&mut bh.data_mut()));
    cache.mark_buffer_dirty(&bh);
    cache.brelse(disk, bh)?;
    let used_meta = group_used_meta_blocks(sb, gdt, group);
    let gd = gdt.get_mut(group);
    gd.set_free_blocks_count(free_blocks - used_meta);
    let flags = gd.flags();
    gd.set_flags(flags & !BG_BLOCK_UNINIT);
    Ok(())
}

/// Allocate up to `wanted` contiguous filesystem blocks, starting the
/// search near `goal` (0 to let the allocator pick group 0). Returns the
/// first allocated block and the run length actually obtained.
pub fn new_meta_blocks(
    cache: &mut BufferCache,
    disk: &Disk,
    sb: &mut Superblock,
    gdt: &mut GroupDescriptorTable,
    config: &MountConfig,
    inode: &mut Inode,
    goal: u64,
    wanted: u32,
) -> Result<(u64, u32)> {
    let n_groups = sb.n_block_groups();
    let group_goal = if goal != 0 {
        ((goal - sb.first_data_block() as u64) / sb.blocks_per_group() as u64) as u32
    } else {
        0
    };
    let mut block_group = group_goal;
    loop {
        try_to_init_block_bitmap(cache, disk, sb, gdt, block_group)?;
        let bitmap_block = gdt.get(block_group).block_bitmap();
        let bh = cache.bread(disk, bitmap_block)?;
        let free = gdt.get(block_group).free_blocks_count();
        if free == 0 {
            cache.brelse(disk, bh)?;
        } else {
            let bit_len = group_blocks(sb, block_group);
            let first = find_next_zero_bit(&bh.data(), bit_len, 0);
            let run = find_zero_run_len(&bh.data(), bit_len, first);
            if run == 0 {
                cache.brelse(disk, bh)?;
                if config.strict_corruption_checks {
                    return Err(Ext4Error::Corruption(format!(
                        "group {block_group} reports {free} free blocks but its bitmap has no free bit"
                    )));
                }
                warn!(
                    "group {block_group} reports {free} free blocks but its bitmap is full; \
                     self-healing by zeroing the group's free count"
                );
                gdt.get_mut(block_group).set_free_blocks_count(0);
            } else {
                let got = run.min(wanted);
                {
                    let mut data = bh.data_mut();
                    set_bits(&mut data, first, got);
                }
                cache.mark_buffer_dirty(&bh);
                cache.brelse(disk, bh)?;
                gdt.get_mut(block_group).set_free_blocks_count(free - got);
                sb.set_free_blocks_count(sb.free_blocks_count() - got as u64);
                let new_blocks = inode.blocks(sb) + got as u64;
                inode.set_blocks(sb, new_blocks);
                let physical = sb.first_data_block() as u64
                    + block_group as u64 * sb.blocks_per_group() as u64
                    + first as u64;
                return Ok((physical, got));
            }
        }
        block_group = (block_group + 1) % n_groups;
        if block_group == group_goal {
            return Err(Ext4Error::NoSpace);
        }
    }
}

/// Free `count` contiguous blocks starting at `block`, previously obtained
/// from [`new_meta_blocks`].
pub fn ext4_ext_free_blocks(
    cache: &mut BufferCache,
    disk: &Disk,
    sb: &mut Superblock,
    gdt: &mut GroupDescriptorTable,
    inode: &mut Inode,
    block: u64,
    count: u32,
) -> Result<()> {
    let rel = block - sb.first_data_block() as u64;
    let group = (rel / sb.blocks_per_group() as u64) as u32;
    let offset = (rel % sb.blocks_per_group() as u64) as u32;
    if !is_block_bitmap_inited(gdt, group) {
        error!("refusing to free {count} block(s) at {block} into uninitialized group {group}");
        return Err(Ext4Error::FreeIntoUninitGroup { group });
    }
    let bitmap_block = gdt.get(group).block_bitmap();
    let bh = cache.bread(disk, bitmap_block)?;
    {
        let mut data = bh.data_mut();
        crate::bitmap::clear_bits(&mut data, offset, count);
    }
    cache.mark_buffer_dirty(&bh);
    cache.brelse(disk, bh)?;
    let free = gdt.get(group).free_blocks_count();
    gdt.get_mut(group).set_free_blocks_count(free + count);
    sb.set_free_blocks_count(sb.free_blocks_count() + count as u64);
    let new_blocks = inode.blocks(sb).saturating_sub(count as u64);
    inode.set_blocks(sb, new_blocks);
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::inode::RawInode;
    use crate::superblock::test_superblock;
    use std::io::Write;
    use tempfile::NamedTempFile;

    /// Build a tiny one-group filesystem image: block size 1024, a single
    /// group of 512 blocks, descriptor + bitmap + inode table laid out at
    /// fixed blocks, all bitmap bits initially clear so the reserved region
    /// is whatever `build_block_bitmap` computes for it.
    fn single_group_fs() -> (Disk, BufferCache, Superblock, GroupDescriptorTable) {
        let block_size = 1024u32;
        let blocks_per_group = 512u32;
        let mut f = NamedTempFile::new().unwrap();
        f.write_all(&vec![0u8; (block_size * blocks_per_group) as usize])
            .unwrap();
        let disk = Disk::open(f.path(), false).unwrap();
        let cache = BufferCache::init(block_size);

        let mut sb = test_superblock(blocks_per_group, 128, 128);
        sb.set_blocks_count(blocks_per_group as u64);

        let mut gdt = GroupDescriptorTable::load(&disk, &sb).unwrap();
        assert_eq!(gdt.len(), 1);
        // Metadata blocks sit immediately after the reserved region so the
        // group's free space is one contiguous run, keeping the allocator
        // tests' expectations simple.
        let gd = gdt.get_mut(0);
        gd.set_block_bitmap(2);
        gd.set_inode_bitmap(3);
        gd.set_inode_table(4);
        gd.set_flags(BG_BLOCK_UNINIT);
        gd.set_free_blocks_count(0);

        sb.set_free_blocks_count(blocks_per_group as u64);
        (disk, cache, sb, gdt)
    }

    #[test]
    fn lazy_init_clears_uninit_flag_and_seeds_reserved_bits() {
        let (disk, mut cache, sb, mut gdt) = single_group_fs();
        try_to_init_block_bitmap(&mut cache, &disk, &sb, &mut gdt, 0).unwrap();
        assert!(is_block_bitmap_inited(&gdt, 0));
        assert!(gdt.get(0).free_blocks_count() > 0);
    }

    #[test]
    fn allocate_then_free_restores_counts_and_bits() {
        let (disk, mut cache, mut sb, mut gdt) = single_group_fs();
        let config = MountConfig::new("unused");
        let mut inode = Inode::get(0, RawInode::default());

        let sb_free_before = sb.free_blocks_count();
        let before_free = {
            try_to_init_block_bitmap(&mut cache, &disk, &sb, &mut gdt, 0).unwrap();
            gdt.get(0).free_blocks_count()
        };

        let (block, got) =
            new_meta_blocks(&mut cache, &disk, &mut sb, &mut gdt, &config, &mut inode, 0, 8).unwrap();
        assert_eq!(got, 8);
        assert_eq!(gdt.get(0).free_blocks_count(), before_free - 8);
        assert_eq!(sb.free_blocks_count(), sb_free_before - 8);
        assert_eq!(inode.blocks(&sb), 8);

        ext4_ext_free_blocks(&mut cache, &disk, &mut sb, &mut gdt, &mut inode, block, got).unwrap();
        assert_eq!(gdt.get(0).free_blocks_count(), before_free);
        assert_eq!(sb.free_blocks_count(), sb_free_before);
        assert_eq!(inode.blocks(&sb), 0);
    }

    #[test]
    fn allocation_caps_at_available_run_length() {
        let (disk, mut cache, mut sb, mut gdt) = single_group_fs();
        let config = MountConfig::new("unused");
        let mut inode = Inode::get(0, RawInode::default());
        try_to_init_block_bitmap(&mut cache, &disk, &sb, &mut gdt, 0).unwrap();

        // Consume all but 5 free blocks by allocating in a big chunk first.
        let before = gdt.get(0).free_blocks_count();
        let (_, got) = new_meta_blocks(
            &mut cache,
            &disk,
            &mut sb,
            &mut gdt,
            &config,
            &mut inode,
            0,
            before - 5,
        )
        .unwrap();
        assert_eq!(got, before - 5);

        let (_, got2) =
            new_meta_blocks(&mut cache, &disk, &mut sb, &mut gdt, &config, &mut inode, 0, 16).unwrap();
        assert_eq!(got2, 5);
    }

    #[test]
    fn exhausted_group_returns_no_space() {
        let (disk, mut cache, mut sb, mut gdt) = single_group_fs();
        let config = MountConfig::new("unused");
        let mut inode = Inode::get(0, RawInode::default());
        try_to_init_block_bitmap(&mut cache, &disk, &sb, &mut gdt, 0).unwrap();
        let before = gdt.get(0).free_blocks_count();
        new_meta_blocks(&mut cache, &disk, &mut sb, &mut gdt, &config, &mut inode, 0, before).unwrap();
        let err = new_meta_blocks(&mut cache, &disk, &mut sb, &mut gdt, &config, &mut inode, 0, 1)
            .unwrap_err();
        assert!(matches!(err, Ext4Error::NoSpace));
    }

    #[test]
    fn free_into_uninit_group_is_reported() {
        let (disk, mut cache, mut sb, mut gdt) = single_group_fs();
        let mut inode = Inode::get(0, RawInode::default());
        let err = ext4_ext_free_blocks(&mut cache, &disk, &mut sb, &mut gdt, &mut inode, 10, 1)
            .unwrap_err();
        assert!(matches!(err, Ext4Error::FreeIntoUninitGroup { group: 0 }));
    }
}
