#![no_std]
//! FAT32 filesystem driver for embedded block devices.
//!
//! The driver reads and writes a FAT32 volume through a small pinned
//! write-back block cache. It supports directory listing with VFAT long
//! names, sequential file read and write, truncation, and a write-mount
//! protocol that tracks the volume clean flag and the FS information
//! sector's free-cluster accounting.

pub mod block;
mod chain;
pub mod dir;
mod fat;
pub mod file;
pub mod fs;
pub mod geometry;
pub mod mkfs;

mod alloc;

#[cfg(test)]
pub(crate) mod testutil;

pub use block::{is_partition_type_supported, BlockDevice, BlockId, BlockRange};
pub use dir::DirLister;
pub use file::File;
pub use fs::{FatFs, FsEntry};
pub use geometry::InitError;

pub use emvfs::{EntryType, FileName, FsError, FsResult, MAX_NAME_LEN};

#[cfg(test)]
extern crate std;
