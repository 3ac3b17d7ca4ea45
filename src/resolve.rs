//! Seam for the out-of-scope extent-tree walker. The core does not resolve
//! logical file offsets to physical blocks (that is directory/extent
//! territory), but higher layers built on this core need a place to plug
//! one in.

use crate::error::Result;
use crate::inode::Inode;

/// Resolves a logical block index within a file to a physical filesystem
/// block, or `None` for a hole. A real implementation walks extent trees
/// or indirect blocks; this crate ships none.
pub trait DataBlockResolver {
    fn resolve(&self, inode: &Inode, logical_block: u64) -> Result<Option<u64>>;
}

/// A resolver that reports every logical block as a hole. Used only in
/// tests that exercise the allocator/inode plumbing without a real
/// directory or extent tree behind them.
pub struct NullResolver;

impl DataBlockResolver for NullResolver {
    fn resolve(&self, _inode: &Inode, _logical_block: u64) -> Result<Option<u64>> {
        Ok(None)
    }
}
