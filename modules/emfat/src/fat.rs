//! FAT entry codec and cluster index arithmetic.
//!
//! FAT entries are little-endian u32 values of which only the low 28 bits
//! are meaningful; the high 4 bits are reserved and must survive every
//! rewrite. Entry 1 carries the volume clean flag in bit 27.

use emvfs::{FsError, FsResult};

use crate::block::{BlockId, BlockRef};
use crate::fs::FatFs;
use crate::geometry::{read_u32, write_u32};

/// First cluster index that is no longer a chain link (end-of-chain range).
pub const NORMAL_CLUSTER_END: u32 = 0x0fff_fff8;

/// Marker written to terminate a chain.
pub const END_OF_CHAIN_MARKER: u32 = 0x0fff_ffff;

/// Marker for a free cluster.
pub const FREE_CLUSTER_MARKER: u32 = 0;

/// FAT entry holding the volume status bits.
pub const FS_STATUS_ENTRY: u32 = 1;

/// Clean-unmount flag inside FAT entry 1.
pub const ENTRY1_CLEAN_BIT: u32 = 1 << 27;

const ENTRY_MASK: u32 = 0x0fff_ffff;
const ENTRY_RESERVED_MASK: u32 = 0xf000_0000;

/// Strip the reserved high bits from a raw FAT entry.
pub(crate) fn mask_entry(raw: u32) -> u32 {
    raw & ENTRY_MASK
}

/// Merge a new entry value into a raw entry, preserving the reserved bits.
pub(crate) fn update_entry(raw: u32, value: u32) -> u32 {
    (raw & ENTRY_RESERVED_MASK) | value
}

/// A cluster index that may appear as a chain link.
pub(crate) fn is_cluster_normal(cluster: u32) -> bool {
    (2..NORMAL_CLUSTER_END).contains(&cluster)
}

impl<'a> FatFs<'a> {
    /// A cluster index with a backing data cluster on this volume.
    pub(crate) fn is_valid_for_data(&self, cluster: u32) -> bool {
        cluster >= 2 && cluster - 2 < self.geometry().num_valid_clusters
    }

    /// A cluster index with a FAT entry on this volume.
    pub(crate) fn is_valid_for_fat(&self, cluster: u32) -> bool {
        cluster < self.geometry().num_fat_entries
    }

    fn fat_entries_per_block(&self) -> u32 {
        (self.block_size() / 4) as u32
    }

    /// Range-relative block holding the FAT entry of `cluster`.
    fn fat_block_for(&self, cluster: u32) -> u64 {
        debug_assert!(self.is_valid_for_fat(cluster));
        self.geometry().num_reserved_blocks + (cluster / self.fat_entries_per_block()) as u64
    }

    /// Pin the FAT block containing `cluster`'s entry. Write-back is
    /// mirrored over every FAT copy.
    pub(crate) fn pin_fat_block(&self, cluster: u32) -> FsResult<BlockRef<'_>> {
        let geo = self.geometry();
        self.pin_rel_block_mirrored(
            self.fat_block_for(cluster),
            geo.blocks_per_fat,
            geo.num_fats,
        )
    }

    /// Read the masked FAT entry of `cluster` from a pinned FAT block.
    pub(crate) fn read_fat_entry(&self, block: &BlockRef<'_>, cluster: u32) -> u32 {
        debug_assert_eq!(block.block_id(), self.abs_block(self.fat_block_for(cluster)));
        let offset = self.fat_entry_offset(cluster);
        mask_entry(block.with(|buf| read_u32(buf, offset)))
    }

    /// Rewrite the FAT entry of `cluster` in a pinned FAT block, preserving
    /// the reserved bits and marking the block dirty.
    pub(crate) fn write_fat_entry(&self, block: &BlockRef<'_>, cluster: u32, value: u32) {
        debug_assert_eq!(block.block_id(), self.abs_block(self.fat_block_for(cluster)));
        let offset = self.fat_entry_offset(cluster);
        block.with_mut(|buf| {
            let raw = read_u32(buf, offset);
            write_u32(buf, offset, update_entry(raw, value));
        });
    }

    /// Set or clear the clean flag in FAT entry 1, leaving every other bit
    /// of the entry untouched.
    pub(crate) fn set_clean_bit(&self, block: &BlockRef<'_>, set: bool) {
        let entry = self.read_fat_entry(block, FS_STATUS_ENTRY);
        let entry = if set {
            entry | ENTRY1_CLEAN_BIT
        } else {
            entry & !ENTRY1_CLEAN_BIT
        };
        self.write_fat_entry(block, FS_STATUS_ENTRY, entry);
    }

    fn fat_entry_offset(&self, cluster: u32) -> usize {
        (cluster % self.fat_entries_per_block()) as usize * 4
    }

    /// Range-relative index of a block inside a data cluster.
    pub(crate) fn data_block_index(&self, cluster: u32, block_in_cluster: u16) -> u64 {
        let geo = self.geometry();
        debug_assert!(self.is_valid_for_data(cluster));
        debug_assert!(block_in_cluster < geo.blocks_per_cluster);
        geo.fat_end_blocks
            + (cluster - 2) as u64 * geo.blocks_per_cluster as u64
            + block_in_cluster as u64
    }

    /// Absolute device block for a range-relative index.
    pub(crate) fn abs_block(&self, rel_block: u64) -> BlockId {
        self.range().abs_block(rel_block)
    }

    /// Pin a range-relative block without mirroring.
    pub(crate) fn pin_rel_block(&self, rel_block: u64) -> FsResult<BlockRef<'_>> {
        self.cache().pin(self.abs_block(rel_block), 0, 1)
    }

    fn pin_rel_block_mirrored(
        &self,
        rel_block: u64,
        stride: u64,
        count: u8,
    ) -> FsResult<BlockRef<'_>> {
        if rel_block >= self.range().length() {
            return Err(FsError::Corrupted);
        }
        self.cache().pin(self.abs_block(rel_block), stride, count)
    }
}
