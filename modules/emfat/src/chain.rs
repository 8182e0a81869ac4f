//! Cluster chain traversal and mutation.

use emvfs::{FsError, FsResult};

use crate::fat::{is_cluster_normal, END_OF_CHAIN_MARKER, FREE_CLUSTER_MARKER};
use crate::fs::FatFs;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum IterState {
    /// Positioned before the first cluster; `current == first`.
    Start,
    /// Positioned on a normal cluster.
    Cluster,
    /// Walked past the last cluster.
    End,
}

/// Iterator over one file's or directory's FAT chain.
///
/// `advance` follows FAT links one cluster at a time; `extend` appends a
/// newly allocated cluster at the end position; `truncate` frees everything
/// after the current position.
pub(crate) struct ClusterChain {
    first_cluster: u32,
    current_cluster: u32,
    prev_cluster: u32,
    iter_state: IterState,
}

impl ClusterChain {
    pub(crate) fn new(first_cluster: u32) -> Self {
        Self {
            first_cluster,
            current_cluster: first_cluster,
            prev_cluster: 0,
            iter_state: IterState::Start,
        }
    }

    /// Reset to the start of the chain.
    pub(crate) fn rewind(&mut self) {
        self.iter_state = IterState::Start;
        self.current_cluster = self.first_cluster;
        self.prev_cluster = 0;
    }

    pub(crate) fn end_reached(&self) -> bool {
        self.iter_state == IterState::End
    }

    /// The cluster under the iterator. Only meaningful while positioned on
    /// one.
    pub(crate) fn current_cluster(&self) -> u32 {
        debug_assert_eq!(self.iter_state, IterState::Cluster);
        self.current_cluster
    }

    pub(crate) fn first_cluster(&self) -> u32 {
        self.first_cluster
    }

    /// Step to the next cluster.
    ///
    /// The first call after a rewind does not follow a link; it only
    /// classifies the first cluster. Later calls read the FAT entry of the
    /// current cluster and move on, reaching the end state at the first
    /// non-normal link.
    pub(crate) fn advance(&mut self, fs: &FatFs<'_>) -> FsResult<()> {
        if self.iter_state == IterState::Cluster {
            if !fs.is_valid_for_fat(self.current_cluster) {
                return Err(FsError::Corrupted);
            }
            let fat_block = fs.pin_fat_block(self.current_cluster)?;
            self.prev_cluster = self.current_cluster;
            self.current_cluster = fs.read_fat_entry(&fat_block, self.prev_cluster);
        }
        if self.iter_state != IterState::End {
            self.iter_state = if is_cluster_normal(self.current_cluster) {
                IterState::Cluster
            } else {
                IterState::End
            };
        }
        Ok(())
    }

    /// Append a freshly allocated cluster at the end of the chain.
    ///
    /// Only legal at the end position on a write-mounted volume. Returns
    /// true when the chain was empty and its first cluster changed, in which
    /// case the caller must rewrite the owning directory entry.
    pub(crate) fn extend(&mut self, fs: &FatFs<'_>) -> FsResult<bool> {
        debug_assert_eq!(self.iter_state, IterState::End);
        debug_assert!(!is_cluster_normal(self.current_cluster));
        debug_assert_eq!(
            is_cluster_normal(self.first_cluster),
            is_cluster_normal(self.prev_cluster)
        );

        // Pin the link block before allocating so a pin failure cannot leave
        // a cluster allocated but unreachable.
        let link_block = if is_cluster_normal(self.prev_cluster) {
            if !fs.is_valid_for_fat(self.prev_cluster) {
                return Err(FsError::Corrupted);
            }
            Some(fs.pin_fat_block(self.prev_cluster)?)
        } else {
            None
        };

        let new_cluster = fs.allocate_cluster()?;
        self.current_cluster = new_cluster;
        let first_cluster_changed = match &link_block {
            Some(block) => {
                fs.write_fat_entry(block, self.prev_cluster, new_cluster);
                false
            }
            None => {
                self.first_cluster = new_cluster;
                true
            }
        };
        self.iter_state = IterState::Cluster;
        Ok(first_cluster_changed)
    }

    /// Free every cluster after the current iteration position.
    ///
    /// At the start position the whole chain is released and the first
    /// cluster becomes the end-of-chain sentinel; the return value reports
    /// that change. Interior truncation relinks the current cluster past
    /// each freed one, holding both affected FAT blocks pinned at once.
    pub(crate) fn truncate(&mut self, fs: &FatFs<'_>) -> FsResult<bool> {
        loop {
            if !is_cluster_normal(self.current_cluster) {
                return Ok(false);
            }
            debug_assert_ne!(self.iter_state, IterState::End);
            if !fs.is_valid_for_fat(self.current_cluster) {
                return Err(FsError::Corrupted);
            }
            let current_block = fs.pin_fat_block(self.current_cluster)?;
            let next_cluster = fs.read_fat_entry(&current_block, self.current_cluster);

            if !is_cluster_normal(next_cluster) {
                // The current cluster is the tail. Only a truncation from
                // the start position drops it as well.
                if self.iter_state == IterState::Start {
                    fs.write_fat_entry(&current_block, self.current_cluster, FREE_CLUSTER_MARKER);
                    fs.fs_info_adjust_free_clusters(true)?;
                    self.first_cluster = END_OF_CHAIN_MARKER;
                    self.current_cluster = self.first_cluster;
                    return Ok(true);
                }
                return Ok(false);
            }

            if !fs.is_valid_for_fat(next_cluster) {
                return Err(FsError::Corrupted);
            }
            let next_block = fs.pin_fat_block(next_cluster)?;
            let after_next = fs.read_fat_entry(&next_block, next_cluster);
            fs.write_fat_entry(&current_block, self.current_cluster, after_next);
            fs.write_fat_entry(&next_block, next_cluster, FREE_CLUSTER_MARKER);
            fs.fs_info_adjust_free_clusters(true)?;
        }
    }
}
