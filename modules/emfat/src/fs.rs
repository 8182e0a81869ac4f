//! FAT32 volume core: geometry, write-mount protocol, FSInfo maintenance.

use emvfs::{EntryType, FsError, FsResult};
use log::{debug, warn};
use spin::Mutex;

use crate::block::{BlockCache, BlockDevice, BlockRange};
use crate::fat::{ENTRY1_CLEAN_BIT, FS_STATUS_ENTRY};
use crate::geometry::{read_u32, write_u32, ClusterGeometry, InitError};

const FS_INFO_SIG1_OFFSET: usize = 0x000;
const FS_INFO_SIG2_OFFSET: usize = 0x1e4;
const FS_INFO_FREE_CLUSTERS_OFFSET: usize = 0x1e8;
const FS_INFO_LAST_ALLOCATED_OFFSET: usize = 0x1ec;
const FS_INFO_SIG3_OFFSET: usize = 0x1fc;

const FS_INFO_SIG1: u32 = 0x4161_5252;
const FS_INFO_SIG2: u32 = 0x6141_7272;
const FS_INFO_SIG3: u32 = 0xaa55_0000;

#[derive(Clone, Copy, Debug)]
/// A directory entry as seen by directory listing and file open.
pub struct FsEntry {
    /// File or directory.
    pub kind: EntryType,
    /// Size in bytes; 0 for directories.
    pub file_size: u32,
    /// First cluster of the entry's data chain.
    pub cluster_index: u32,
    /// Range-relative block holding the 32-byte directory slot; 0 for the
    /// root directory, which has no slot.
    pub dir_entry_block_index: u64,
    /// Slot position inside that block.
    pub dir_entry_block_offset: u16,
}

/// Write-mount protocol phase.
///
/// At rest the volume is either `NotMounted` or `Mounted`; the other states
/// name the protocol step in flight so failures report the phase they
/// occurred in.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum WriteMountState {
    NotMounted,
    MountMeta,
    MountFsInfo,
    MountFlush,
    Mounted,
    UnmountFlush1,
    UnmountMeta,
    UnmountFlush2,
}

struct CoreState {
    write_mount_state: WriteMountState,
    alloc_position: u32,
    alloc_start: u32,
    num_write_references: usize,
}

/// A mounted FAT32 volume over a block range of a cached device.
///
/// Reading works as soon as [`FatFs::mount`] succeeds; writing additionally
/// requires [`FatFs::start_write_mount`].
pub struct FatFs<'a> {
    cache: BlockCache<'a>,
    range: BlockRange,
    geometry: ClusterGeometry,
    state: Mutex<CoreState>,
}

impl<'a> FatFs<'a> {
    /// Parse the boot block of `range` and bring the volume up read-only.
    pub fn mount(device: &'a dyn BlockDevice, range: BlockRange) -> Result<Self, InitError> {
        let cache = BlockCache::new(device).map_err(|_| InitError::Io)?;
        if range.length() == 0 {
            return Err(InitError::Io);
        }
        let geometry = {
            let boot = cache
                .pin(range.abs_block(0), 0, 1)
                .map_err(|_| InitError::Io)?;
            boot.with(|buf| ClusterGeometry::parse(buf, cache.block_size(), range.length()))?
        };
        debug!(
            "fat: mounted, {} clusters of {} blocks, root at {}",
            geometry.num_valid_clusters, geometry.blocks_per_cluster, geometry.root_cluster
        );
        Ok(Self {
            cache,
            range,
            geometry,
            state: Mutex::new(CoreState {
                write_mount_state: WriteMountState::NotMounted,
                alloc_position: 0,
                alloc_start: 0,
                num_write_references: 0,
            }),
        })
    }

    /// Cache block size in bytes.
    pub fn block_size(&self) -> usize {
        self.cache.block_size()
    }

    /// The synthetic entry for the root directory.
    pub fn root_entry(&self) -> FsEntry {
        FsEntry {
            kind: EntryType::Dir,
            file_size: 0,
            cluster_index: self.geometry.root_cluster,
            dir_entry_block_index: 0,
            dir_entry_block_offset: 0,
        }
    }

    /// Whether the volume is currently write-mounted.
    pub fn is_write_mounted(&self) -> bool {
        self.state.lock().write_mount_state == WriteMountState::Mounted
    }

    /// Take write responsibility for the volume.
    ///
    /// Verifies the previous session ended cleanly (clean flag set in FAT
    /// entry 1), that the device is writable and that the volume carries an
    /// FS information sector; then clears the clean flag and flushes, so a
    /// crash from here on is detectable. On any failure the volume stays
    /// read-only.
    pub fn start_write_mount(&self) -> FsResult<()> {
        {
            let mut state = self.state.lock();
            if state.write_mount_state != WriteMountState::NotMounted {
                return Err(FsError::Busy);
            }
            debug_assert_eq!(state.num_write_references, 0);
            state.write_mount_state = WriteMountState::MountMeta;
        }
        match self.write_mount_steps() {
            Ok(()) => {
                self.state.lock().write_mount_state = WriteMountState::Mounted;
                debug!("fat: write mounted");
                Ok(())
            }
            Err(err) => {
                self.state.lock().write_mount_state = WriteMountState::NotMounted;
                warn!("fat: write mount failed: {:?}", err);
                Err(err)
            }
        }
    }

    fn write_mount_steps(&self) -> FsResult<()> {
        let meta = self.pin_fat_block(FS_STATUS_ENTRY)?;
        let entry1 = self.read_fat_entry(&meta, FS_STATUS_ENTRY);
        if entry1 & ENTRY1_CLEAN_BIT == 0 {
            warn!("fat: volume was not cleanly unmounted");
            return Err(FsError::Corrupted);
        }
        if !self.cache.device().is_writable() {
            return Err(FsError::ReadOnly);
        }
        if self.geometry.fs_info_block == 0 {
            return Err(FsError::NotSupported);
        }

        self.state.lock().write_mount_state = WriteMountState::MountFsInfo;
        {
            let info = self.pin_rel_block(self.geometry.fs_info_block)?;
            let (sig1, sig2, sig3, last_allocated) = info.with(|buf| {
                (
                    read_u32(buf, FS_INFO_SIG1_OFFSET),
                    read_u32(buf, FS_INFO_SIG2_OFFSET),
                    read_u32(buf, FS_INFO_SIG3_OFFSET),
                    read_u32(buf, FS_INFO_LAST_ALLOCATED_OFFSET),
                )
            });
            if sig1 != FS_INFO_SIG1 || sig2 != FS_INFO_SIG2 || sig3 != FS_INFO_SIG3 {
                return Err(FsError::Corrupted);
            }
            let mut state = self.state.lock();
            state.alloc_position = 0;
            if last_allocated >= 2 && last_allocated < 2 + self.geometry.num_valid_clusters {
                state.alloc_position = last_allocated - 2;
            }
        }

        self.set_clean_bit(&meta, false);
        self.state.lock().write_mount_state = WriteMountState::MountFlush;
        if let Err(err) = self.cache.flush() {
            // Leave the cached copy consistent with the on-disk state.
            self.set_clean_bit(&meta, true);
            return Err(err);
        }
        Ok(())
    }

    /// Whether write unmount may start (no live write references).
    pub fn can_start_write_unmount(&self) -> bool {
        let state = self.state.lock();
        state.write_mount_state == WriteMountState::Mounted && state.num_write_references == 0
    }

    /// Give up write responsibility.
    ///
    /// The first flush commits user data while the clean flag is still
    /// clear; the second commits the flag itself, so its persistence implies
    /// the data's. On failure the volume stays write-mounted.
    pub fn start_write_unmount(&self) -> FsResult<()> {
        {
            let mut state = self.state.lock();
            if state.write_mount_state != WriteMountState::Mounted {
                return Err(FsError::Invalid);
            }
            if state.num_write_references != 0 {
                return Err(FsError::Busy);
            }
            state.write_mount_state = WriteMountState::UnmountFlush1;
        }
        match self.write_unmount_steps() {
            Ok(()) => {
                self.state.lock().write_mount_state = WriteMountState::NotMounted;
                debug!("fat: write unmounted");
                Ok(())
            }
            Err(err) => {
                self.state.lock().write_mount_state = WriteMountState::Mounted;
                warn!("fat: write unmount failed: {:?}", err);
                Err(err)
            }
        }
    }

    fn write_unmount_steps(&self) -> FsResult<()> {
        self.cache.flush()?;

        self.state.lock().write_mount_state = WriteMountState::UnmountMeta;
        {
            let meta = self.pin_fat_block(FS_STATUS_ENTRY)?;
            let entry1 = self.read_fat_entry(&meta, FS_STATUS_ENTRY);
            if entry1 & ENTRY1_CLEAN_BIT != 0 {
                return Err(FsError::Corrupted);
            }
            self.set_clean_bit(&meta, true);
        }

        self.state.lock().write_mount_state = WriteMountState::UnmountFlush2;
        self.cache.flush()?;
        Ok(())
    }

    /// Decrement or increment the FSInfo free-cluster count.
    ///
    /// A stored value above the cluster count is stale and left untouched.
    pub(crate) fn fs_info_adjust_free_clusters(&self, increment: bool) -> FsResult<()> {
        if self.geometry.fs_info_block == 0 {
            return Ok(());
        }
        let info = self.pin_rel_block(self.geometry.fs_info_block)?;
        let free = info.with(|buf| read_u32(buf, FS_INFO_FREE_CLUSTERS_OFFSET));
        if free <= self.geometry.num_valid_clusters {
            let free = if increment {
                free.wrapping_add(1)
            } else {
                free.wrapping_sub(1)
            };
            info.with_mut(|buf| write_u32(buf, FS_INFO_FREE_CLUSTERS_OFFSET, free));
        }
        Ok(())
    }

    /// Record the allocator cursor in the FSInfo last-allocated hint.
    pub(crate) fn fs_info_set_last_allocated(&self, cluster: u32) -> FsResult<()> {
        if self.geometry.fs_info_block == 0 {
            return Ok(());
        }
        let info = self.pin_rel_block(self.geometry.fs_info_block)?;
        info.with_mut(|buf| write_u32(buf, FS_INFO_LAST_ALLOCATED_OFFSET, cluster));
        Ok(())
    }

    pub(crate) fn geometry(&self) -> &ClusterGeometry {
        &self.geometry
    }

    pub(crate) fn range(&self) -> &BlockRange {
        &self.range
    }

    pub(crate) fn cache(&self) -> &BlockCache<'a> {
        &self.cache
    }

    pub(crate) fn device(&self) -> &dyn BlockDevice {
        self.cache.device()
    }

    pub(crate) fn blocks_per_cluster(&self) -> u16 {
        self.geometry.blocks_per_cluster
    }

    pub(crate) fn with_alloc_cursor<R>(&self, f: impl FnOnce(&mut u32, &mut u32) -> R) -> R {
        let mut state = self.state.lock();
        let CoreState {
            alloc_position,
            alloc_start,
            ..
        } = &mut *state;
        f(alloc_position, alloc_start)
    }

    pub(crate) fn take_write_reference(&self) -> Option<WriteReference<'_>> {
        let mut state = self.state.lock();
        if state.write_mount_state != WriteMountState::Mounted {
            return None;
        }
        state.num_write_references += 1;
        Some(WriteReference { fs: self })
    }
}

/// Scoped token certifying the volume is write-mounted for its lifetime.
/// While any token is live, write unmount is refused.
pub struct WriteReference<'r> {
    fs: &'r FatFs<'r>,
}

impl Drop for WriteReference<'_> {
    fn drop(&mut self) {
        let mut state = self.fs.state.lock();
        debug_assert!(state.num_write_references > 0);
        state.num_write_references -= 1;
    }
}
