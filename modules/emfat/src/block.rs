//! Block device abstraction and a small pinned write-back cache.

use emvfs::{FsError, FsResult};
use spin::Mutex;

/// Logical block identifier.
pub type BlockId = u64;

/// Smallest block size the driver accepts.
pub const MIN_BLOCK_SIZE: usize = 512;

/// Largest block size the cache can hold.
pub const MAX_BLOCK_SIZE: usize = 4096;

/// Abstract block device interface.
pub trait BlockDevice {
    /// Return the block size in bytes.
    fn block_size(&self) -> usize;
    /// Read a block into the provided buffer.
    fn read_block(&self, block_id: BlockId, buf: &mut [u8]) -> FsResult<()>;
    /// Write a block from the provided buffer.
    fn write_block(&self, block_id: BlockId, buf: &[u8]) -> FsResult<()>;
    /// Flush any buffered writes to the device.
    fn flush(&self) -> FsResult<()>;
    /// Whether the device accepts writes.
    fn is_writable(&self) -> bool {
        true
    }
}

/// Supported MBR partition types (FAT32 with LBA addressing).
pub fn is_partition_type_supported(partition_type: u8) -> bool {
    partition_type == 0x0b || partition_type == 0x0c
}

#[derive(Clone, Copy, Debug)]
/// Window of a device given to the filesystem: blocks
/// `base..base + length`, addressed relative to `base`.
pub struct BlockRange {
    base: BlockId,
    length: u64,
}

impl BlockRange {
    /// Construct a range from its first absolute block and length.
    pub const fn new(base: BlockId, length: u64) -> Self {
        Self { base, length }
    }

    /// Number of blocks in the range.
    pub fn length(&self) -> u64 {
        self.length
    }

    /// Translate a range-relative block index to an absolute one.
    pub fn abs_block(&self, rel_block: u64) -> BlockId {
        debug_assert!(rel_block < self.length);
        self.base + rel_block
    }
}

const CACHE_SLOTS: usize = 32;

#[derive(Clone, Copy)]
struct CacheSlot {
    block_id: BlockId,
    write_stride: u64,
    write_count: u8,
    valid: bool,
    dirty: bool,
    pins: u8,
    buf: [u8; MAX_BLOCK_SIZE],
}

impl CacheSlot {
    const fn new() -> Self {
        Self {
            block_id: 0,
            write_stride: 0,
            write_count: 1,
            valid: false,
            dirty: false,
            pins: 0,
            buf: [0u8; MAX_BLOCK_SIZE],
        }
    }
}

struct CacheState {
    slots: [CacheSlot; CACHE_SLOTS],
}

/// Write-back block cache with reference-counted pins.
///
/// A pin keeps a block resident until the returned [`BlockRef`] is dropped.
/// Each slot remembers a `(stride, count)` pair so one dirty block can be
/// written back to `count` mirror locations `stride` blocks apart, which is
/// how FAT copies stay in sync.
pub struct BlockCache<'a> {
    device: &'a dyn BlockDevice,
    block_size: usize,
    state: Mutex<CacheState>,
}

impl<'a> BlockCache<'a> {
    /// Create a cache over a device, validating its block size.
    pub fn new(device: &'a dyn BlockDevice) -> FsResult<Self> {
        let block_size = device.block_size();
        if !(MIN_BLOCK_SIZE..=MAX_BLOCK_SIZE).contains(&block_size) || block_size % 32 != 0 {
            return Err(FsError::Invalid);
        }
        Ok(Self {
            device,
            block_size,
            state: Mutex::new(CacheState {
                slots: [CacheSlot::new(); CACHE_SLOTS],
            }),
        })
    }

    /// Return the block size in bytes.
    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Return the underlying device, for uncached data I/O.
    pub fn device(&self) -> &dyn BlockDevice {
        self.device
    }

    /// Pin a block, reading it from the device on a miss.
    ///
    /// `(write_stride, write_count)` describe where a dirty copy is written
    /// back; plain blocks pass `(0, 1)`.
    pub fn pin(
        &self,
        block_id: BlockId,
        write_stride: u64,
        write_count: u8,
    ) -> FsResult<BlockRef<'_>> {
        debug_assert!(write_count >= 1);
        let mut state = self.state.lock();

        let mut hit = None;
        let mut free_invalid = None;
        let mut free_clean = None;
        for (index, slot) in state.slots.iter().enumerate() {
            if slot.valid && slot.block_id == block_id {
                hit = Some(index);
                break;
            }
            if slot.pins == 0 {
                if !slot.valid {
                    free_invalid.get_or_insert(index);
                } else {
                    free_clean.get_or_insert(index);
                }
            }
        }

        if let Some(index) = hit {
            let slot = &mut state.slots[index];
            debug_assert!(slot.pins == 0 || slot.write_stride == write_stride);
            slot.write_stride = write_stride;
            slot.write_count = write_count;
            slot.pins += 1;
            return Ok(BlockRef { cache: self, slot: index });
        }

        let index = free_invalid.or(free_clean).ok_or(FsError::Busy)?;
        if state.slots[index].valid && state.slots[index].dirty {
            self.write_back(&state.slots[index])?;
            state.slots[index].dirty = false;
        }
        let slot = &mut state.slots[index];
        slot.valid = false;
        self.device
            .read_block(block_id, &mut slot.buf[..self.block_size])?;
        slot.block_id = block_id;
        slot.write_stride = write_stride;
        slot.write_count = write_count;
        slot.valid = true;
        slot.dirty = false;
        slot.pins = 1;
        Ok(BlockRef { cache: self, slot: index })
    }

    /// Write every dirty block (and its mirrors) back, then flush the device.
    pub fn flush(&self) -> FsResult<()> {
        let mut state = self.state.lock();
        for slot in state.slots.iter_mut() {
            if slot.valid && slot.dirty {
                self.write_back(slot)?;
                slot.dirty = false;
            }
        }
        self.device.flush()
    }

    fn write_back(&self, slot: &CacheSlot) -> FsResult<()> {
        for copy in 0..slot.write_count {
            let target = slot.block_id + slot.write_stride * copy as u64;
            self.device
                .write_block(target, &slot.buf[..self.block_size])?;
        }
        Ok(())
    }
}

/// Reference-counted pin on one cached block.
pub struct BlockRef<'r> {
    cache: &'r BlockCache<'r>,
    slot: usize,
}

impl<'r> BlockRef<'r> {
    /// The pinned block's identifier.
    pub fn block_id(&self) -> BlockId {
        self.cache.state.lock().slots[self.slot].block_id
    }

    /// Read access to the block contents.
    ///
    /// The closure must not touch the cache.
    pub fn with<R>(&self, f: impl FnOnce(&[u8]) -> R) -> R {
        let state = self.cache.state.lock();
        f(&state.slots[self.slot].buf[..self.cache.block_size])
    }

    /// Mutating access to the block contents; marks the block dirty.
    ///
    /// The closure must not touch the cache.
    pub fn with_mut<R>(&self, f: impl FnOnce(&mut [u8]) -> R) -> R {
        let mut state = self.cache.state.lock();
        let slot = &mut state.slots[self.slot];
        slot.dirty = true;
        f(&mut slot.buf[..self.cache.block_size])
    }
}

impl Drop for BlockRef<'_> {
    fn drop(&mut self) {
        let mut state = self.cache.state.lock();
        let slot = &mut state.slots[self.slot];
        debug_assert!(slot.pins > 0);
        slot.pins -= 1;
    }
}
