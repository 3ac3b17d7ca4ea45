//! The backing store: a single file descriptor opened over the ext4 image,
//! with positioned read/write serialized by two independent locks and a
//! cursor API for streaming sequential transfers.

use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::os::unix::io::AsRawFd;
use std::path::Path;
use std::sync::Mutex;

use log::{debug, warn};

use crate::error::Result;

/// A short-lived byte cursor over a half-open range, used to stream
/// sequential reads/writes without recomputing offsets at each step.
pub struct DiskCursor {
    cur: u64,
    remaining: u64,
}

impl DiskCursor {
    /// How many bytes remain in this cursor.
    pub fn remaining(&self) -> u64 {
        self.remaining
    }
}

/// The ext4 image's backing file descriptor.
pub struct Disk {
    file: File,
    read_lock: Mutex<()>,
    write_lock: Mutex<()>,
}

impl Disk {
    /// Open the backing file at `path`. `read_only` suppresses write access
    /// even if the caller later attempts one.
    pub fn open(path: impl AsRef<Path>, read_only: bool) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(!read_only)
            .open(path)?;
        Ok(Self {
            file,
            read_lock: Mutex::new(()),
            write_lock: Mutex::new(()),
        })
    }

    /// Size of the backing store in bytes. Uses `BLKGETSIZE64` for a block
    /// device, falling back to the file's metadata length otherwise.
    pub fn size_bytes(&self) -> Result<u64> {
        const BLKGETSIZE64: u64 = request_code_read(0x12, 114, std::mem::size_of::<u64>());
        let mut size: u64 = 0;
        let ret = unsafe { libc::ioctl(self.file.as_raw_fd(), BLKGETSIZE64 as _, &mut size) };
        if ret == 0 {
            return Ok(size);
        }
        Ok(self.file.metadata()?.len())
    }

    /// Positioned read of exactly `buf.len()` bytes at `offset`.
    pub fn read(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        if buf.is_empty() {
            warn!("disk read of size 0 at offset {offset}, ignoring");
            return Ok(());
        }
        debug!("disk read: offset={offset} size={}", buf.len());
        let _guard = self.read_lock.lock().unwrap();
        self.file.read_exact_at(buf, offset)?;
        Ok(())
    }

    /// Positioned write of exactly `buf.len()` bytes at `offset`.
    pub fn write(&self, offset: u64, buf: &[u8]) -> Result<()> {
        if buf.is_empty() {
            warn!("disk write of size 0 at offset {offset}, ignoring");
            return Ok(());
        }
        debug!("disk write: offset={offset} size={}", buf.len());
        let _guard = self.write_lock.lock().unwrap();
        self.file.write_all_at(buf, offset)?;
        Ok(())
    }

    /// Begin a cursor over `unit_size * units` bytes starting at
    /// `start_off`.
    pub fn ctx_create(&self, start_off: u64, unit_size: u64, units: u64) -> DiskCursor {
        DiskCursor {
            cur: start_off,
            remaining: unit_size.saturating_mul(units),
        }
    }

    /// Read up to `buf.len()` bytes (capped by the cursor's remaining
    /// count) and advance the cursor. Returns the number of bytes
    /// transferred.
    pub fn ctx_read(&self, ctx: &mut DiskCursor, buf: &mut [u8]) -> Result<usize> {
        if ctx.remaining == 0 {
            warn!("disk cursor exhausted at offset {}", ctx.cur);
            return Ok(0);
        }
        let n = (buf.len() as u64).min(ctx.remaining) as usize;
        self.read(ctx.cur, &mut buf[..n])?;
        ctx.cur += n as u64;
        ctx.remaining -= n as u64;
        Ok(n)
    }

    /// Write up to `buf.len()` bytes (capped by the cursor's remaining
    /// count) and advance the cursor. Returns the number of bytes
    /// transferred.
    pub fn ctx_write(&self, ctx: &mut DiskCursor, buf: &[u8]) -> Result<usize> {
        if ctx.remaining == 0 {
            warn!("disk cursor exhausted at offset {}", ctx.cur);
            return Ok(0);
        }
        let n = (buf.len() as u64).min(ctx.remaining) as usize;
        self.write(ctx.cur, &buf[..n])?;
        ctx.cur += n as u64;
        ctx.remaining -= n as u64;
        Ok(n)
    }
}

/// Re-implements the `_IOR('0', nr, size)` macro from `<linux/ioctl.h>` for
/// `BLKGETSIZE64`, which `libc` does not expose directly.
const fn request_code_read(ty: u8, nr: u8, size: usize) -> u64 {
    const IOC_READ: u64 = 2;
    let size = size as u64;
    (IOC_READ << 30) | ((ty as u64) << 8) | (nr as u64) | (size << 16)
}
