//! Core layout engine for a read/write ext4 volume: superblock and
//! group-descriptor management, the block-bitmap lifecycle, the block
//! allocator, the buffered block-device cache, and inode block-count
//! accounting.
//!
//! Directory traversal, the extent tree, and the file-operation facade
//! that would sit on top of this core are out of scope; see
//! [`inode::InodeStore`] and [`resolve::DataBlockResolver`] for where
//! those collaborators attach.

pub mod alloc;
pub mod bitmap;
pub mod buffer;
pub mod config;
pub mod core_fs;
pub mod disk;
pub mod error;
pub mod group_desc;
pub mod inode;
pub mod resolve;
pub mod superblock;

pub use config::MountConfig;
pub use core_fs::Ext4Core;
pub use error::{Ext4Error, Result};
