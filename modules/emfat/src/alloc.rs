//! Rotating free-cluster allocator.
//!
//! All chain extensions share one cursor over the cluster space. A scan
//! starts where the previous one stopped, wraps at the end of the valid
//! range, and fails once it returns to its starting position. The cursor is
//! seeded from the FSInfo last-allocated hint at write mount and written
//! back there after every allocation.

use emvfs::{FsError, FsResult};
use log::warn;

use crate::fat::END_OF_CHAIN_MARKER;
use crate::fs::FatFs;

impl<'a> FatFs<'a> {
    /// Find a free cluster, mark it end-of-chain and return it.
    ///
    /// The volume must be write-mounted. The FSInfo free count and
    /// last-allocated hint are updated along the way.
    pub(crate) fn allocate_cluster(&self) -> FsResult<u32> {
        debug_assert!(self.is_write_mounted());
        let num_valid_clusters = self.geometry().num_valid_clusters;
        let scan_start = self.with_alloc_cursor(|position, start| {
            *start = *position;
            *start
        });

        loop {
            let (candidate, position_after) = self.with_alloc_cursor(|position, _| {
                let candidate = 2 + *position;
                *position += 1;
                if *position == num_valid_clusters {
                    *position = 0;
                }
                (candidate, *position)
            });

            let fat_block = self.pin_fat_block(candidate)?;
            if self.read_fat_entry(&fat_block, candidate) == 0 {
                self.write_fat_entry(&fat_block, candidate, END_OF_CHAIN_MARKER);
                self.fs_info_adjust_free_clusters(false)?;
                self.fs_info_set_last_allocated(2 + position_after)?;
                return Ok(candidate);
            }

            if position_after == scan_start {
                warn!("fat: no free cluster");
                return Err(FsError::NoSpace);
            }
        }
    }
}
