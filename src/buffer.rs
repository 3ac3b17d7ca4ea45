//! The buffer cache and buffered positioned I/O built on top of it. Every
//! read/write above the raw [`crate::disk::Disk`] flows through here so
//! that a block touched twice in quick succession is fetched from the
//! device only once.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use log::warn;

use crate::disk::Disk;
use crate::error::Result;

struct BufferHead {
    block: u64,
    data: Vec<u8>,
    uptodate: bool,
    dirty: bool,
}

/// A handle to a cached block. Acquired via [`BufferCache::bread`] or
/// [`BufferCache::bwrite`] and released via [`BufferCache::brelse`] or
/// [`BufferCache::bforget`].
pub struct BufferRef(Rc<RefCell<BufferHead>>);

impl BufferRef {
    /// Read-only view of the block's bytes.
    pub fn data(&self) -> std::cell::Ref<'_, [u8]> {
        std::cell::Ref::map(self.0.borrow(), |h| h.data.as_slice())
    }

    /// Mutable view of the block's bytes. Does not itself mark the buffer
    /// dirty; call [`BufferCache::mark_buffer_dirty`] after mutating.
    pub fn data_mut(&self) -> std::cell::RefMut<'_, [u8]> {
        std::cell::RefMut::map(self.0.borrow_mut(), |h| h.data.as_mut_slice())
    }

    /// The block number this buffer caches.
    pub fn block(&self) -> u64 {
        self.0.borrow().block
    }
}

/// Maps filesystem block numbers to in-memory block buffers.
pub struct BufferCache {
    block_size: u32,
    buffers: HashMap<u64, Rc<RefCell<BufferHead>>>,
}

impl BufferCache {
    /// Initialize the cache for the given block size, known only once the
    /// superblock has been loaded.
    pub fn init(block_size: u32) -> Self {
        Self {
            block_size,
            buffers: HashMap::new(),
        }
    }

    pub fn block_size(&self) -> u32 {
        self.block_size
    }

    fn slot(&mut self, block: u64) -> Rc<RefCell<BufferHead>> {
        self.buffers
            .entry(block)
            .or_insert_with(|| {
                Rc::new(RefCell::new(BufferHead {
                    block,
                    data: vec![0u8; self.block_size as usize],
                    uptodate: false,
                    dirty: false,
                }))
            })
            .clone()
    }

    /// Obtain `block`, fetching it from `disk` synchronously if it is not
    /// already uptodate.
    pub fn bread(&mut self, disk: &Disk, block: u64) -> Result<BufferRef> {
        let slot = self.slot(block);
        let needs_fetch = !slot.borrow().uptodate;
        if needs_fetch {
            let offset = block * self.block_size as u64;
            let mut data = vec![0u8; self.block_size as usize];
            disk.read(offset, &mut data)?;
            let mut h = slot.borrow_mut();
            h.data = data;
            h.uptodate = true;
        }
        Ok(BufferRef(slot))
    }

    /// Obtain `block` without pre-reading it; the caller will overwrite the
    /// block in full before marking it dirty.
    pub fn bwrite(&mut self, block: u64) -> Result<BufferRef> {
        Ok(BufferRef(self.slot(block)))
    }

    /// Mark a buffer uptodate and dirty.
    pub fn mark_buffer_dirty(&mut self, buf: &BufferRef) {
        let mut h = buf.0.borrow_mut();
        h.uptodate = true;
        h.dirty = true;
    }

    /// Release a buffer reference. Dirty buffers are flushed immediately
    /// (the minimal compliant eviction policy of keeping one buffer per
    /// cached block for the cache's lifetime).
    pub fn brelse(&mut self, disk: &Disk, buf: BufferRef) -> Result<()> {
        self.flush_if_dirty(disk, &buf)
    }

    /// Invalidate a buffer (clear uptodate/dirty) and release it without
    /// writing it back.
    pub fn bforget(&mut self, buf: BufferRef) {
        let mut h = buf.0.borrow_mut();
        h.uptodate = false;
        h.dirty = false;
    }

    fn flush_if_dirty(&self, disk: &Disk, buf: &BufferRef) -> Result<()> {
        let mut h = buf.0.borrow_mut();
        if h.dirty {
            let offset = h.block * self.block_size as u64;
            disk.write(offset, &h.data)?;
            h.dirty = false;
        }
        Ok(())
    }

    /// Flush every dirty buffer. Called at cache teardown, which acts as a
    /// write-back barrier.
    pub fn cleanup(&mut self, disk: &Disk) -> Result<()> {
        for slot in self.buffers.values() {
            let mut h = slot.borrow_mut();
            if h.dirty {
                let offset = h.block * self.block_size as u64;
                disk.write(offset, &h.data)?;
                h.dirty = false;
            }
        }
        Ok(())
    }
}

/// Read `buf.len()` bytes starting at byte `offset`, splitting the request
/// into an optional head-partial block, whole middle blocks, and an
/// optional tail-partial block.
pub fn read_buffered(cache: &mut BufferCache, disk: &Disk, offset: u64, buf: &mut [u8]) -> Result<()> {
    if buf.is_empty() {
        warn!("buffered read of size 0 at offset {offset}, ignoring");
        return Ok(());
    }
    let bs = cache.block_size() as u64;
    let mut remaining = buf.len() as u64;
    let mut cur_off = offset;
    let mut written = 0usize;
    while remaining > 0 {
        let block = cur_off / bs;
        let in_block = (cur_off % bs) as usize;
        let chunk = ((bs as usize - in_block) as u64).min(remaining) as usize;
        let bh = cache.bread(disk, block)?;
        buf[written..written + chunk].copy_from_slice(&bh.data()[in_block..in_block + chunk]);
        cache.brelse(disk, bh)?;
        cur_off += chunk as u64;
        written += chunk;
        remaining -= chunk as u64;
    }
    Ok(())
}

/// Write `buf.len()` bytes starting at byte `offset`, preserving untouched
/// bytes in any partial head/tail block by reading it first.
pub fn write_buffered(cache: &mut BufferCache, disk: &Disk, offset: u64, buf: &[u8]) -> Result<()> {
    if buf.is_empty() {
        warn!("buffered write of size 0 at offset {offset}, ignoring");
        return Ok(());
    }
    let bs = cache.block_size() as u64;
    let mut remaining = buf.len() as u64;
    let mut cur_off = offset;
    let mut read = 0usize;
    while remaining > 0 {
        let block = cur_off / bs;
        let in_block = (cur_off % bs) as usize;
        let chunk = ((bs as usize - in_block) as u64).min(remaining) as usize;
        let whole_block = in_block == 0 && chunk as u64 == bs;
        let bh = if whole_block {
            cache.bwrite(block)?
        } else {
            cache.bread(disk, block)?
        };
        bh.data_mut()[in_block..in_block + chunk].copy_from_slice(&buf[read..read + chunk]);
        cache.mark_buffer_dirty(&bh);
        cache.brelse(disk, bh)?;
        cur_off += chunk as u64;
        read += chunk;
        remaining -= chunk as u64;
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn setup(block_size: u32, blocks: u64) -> (Disk, BufferCache) {
        let mut f = NamedTempFile::new().unwrap();
        f.write_all(&vec![0u8; (block_size as u64 * blocks) as usize])
            .unwrap();
        let disk = Disk::open(f.path(), false).unwrap();
        let cache = BufferCache::init(block_size);
        // `f`'s temp file is unlinked on drop here; the already-open fd
        // inside `disk` remains valid on Unix regardless.
        (disk, cache)
    }

    #[test]
    fn write_then_read_back_straddles_blocks() {
        let (disk, mut cache) = setup(1024, 4);
        let payload: Vec<u8> = (0..3000u32).map(|i| (i % 251) as u8).collect();
        write_buffered(&mut cache, &disk, 100, &payload).unwrap();
        let mut out = vec![0u8; payload.len()];
        read_buffered(&mut cache, &disk, 100, &mut out).unwrap();
        assert_eq!(out, payload);
    }

    #[test]
    fn partial_head_write_preserves_untouched_bytes() {
        let (disk, mut cache) = setup(1024, 1);
        write_buffered(&mut cache, &disk, 0, &[0xAAu8; 1024]).unwrap();
        write_buffered(&mut cache, &disk, 100, &[0xBBu8; 50]).unwrap();
        let mut out = vec![0u8; 1024];
        read_buffered(&mut cache, &disk, 0, &mut out).unwrap();
        assert!(out[..100].iter().all(|&b| b == 0xAA));
        assert!(out[100..150].iter().all(|&b| b == 0xBB));
        assert!(out[150..].iter().all(|&b| b == 0xAA));
    }

    #[test]
    fn cleanup_flushes_dirty_buffers() {
        let (disk, mut cache) = setup(1024, 1);
        let bh = cache.bwrite(0).unwrap();
        bh.data_mut().fill(0x42);
        cache.mark_buffer_dirty(&bh);
        drop(bh);
        cache.cleanup(&disk).unwrap();
        let mut out = vec![0u8; 1024];
        disk.read(0, &mut out).unwrap();
        assert!(out.iter().all(|&b| b == 0x42));
    }
}
