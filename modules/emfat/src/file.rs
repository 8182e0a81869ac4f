//! Per-open file handle: sequential block read/write and truncation.

use emvfs::{EntryType, FsError, FsResult};

use crate::chain::ClusterChain;
use crate::dir::DirEntryRef;
use crate::fs::{FatFs, FsEntry, WriteReference};

struct Writable<'r> {
    dir_entry: DirEntryRef<'r>,
    // Held for its lifetime: blocks write unmount while the file is open
    // for writing.
    _write_ref: WriteReference<'r>,
}

/// An open file.
///
/// Reads and writes proceed one device block at a time at the current
/// position. Writing requires [`File::open_writable`] first, which verifies
/// the directory entry still describes this file.
pub struct File<'r> {
    fs: &'r FatFs<'r>,
    chain: ClusterChain,
    dir_entry_block_index: u64,
    dir_entry_block_offset: u16,
    file_size: u32,
    file_pos: u32,
    block_in_cluster: u16,
    writable: Option<Writable<'r>>,
}

impl<'r> File<'r> {
    /// Open the file behind a directory entry.
    pub fn open(fs: &'r FatFs<'r>, entry: &FsEntry) -> FsResult<Self> {
        if entry.kind != EntryType::File {
            return Err(FsError::Invalid);
        }
        Ok(Self {
            fs,
            chain: ClusterChain::new(entry.cluster_index),
            dir_entry_block_index: entry.dir_entry_block_index,
            dir_entry_block_offset: entry.dir_entry_block_offset,
            file_size: entry.file_size,
            file_pos: 0,
            block_in_cluster: fs.blocks_per_cluster(),
            writable: None,
        })
    }

    /// Current size in bytes.
    pub fn file_size(&self) -> u32 {
        self.file_size
    }

    /// Current position in bytes.
    pub fn file_pos(&self) -> u32 {
        self.file_pos
    }

    /// Reset the position to the start of the file.
    pub fn rewind(&mut self) {
        self.chain.rewind();
        self.file_pos = 0;
        self.block_in_cluster = self.fs.blocks_per_cluster();
    }

    /// Read the next block of the file into `buf`.
    ///
    /// Returns the number of valid bytes: a full block in the interior,
    /// `file_size - file_pos` on the final block, 0 at end of file.
    pub fn read_block(&mut self, buf: &mut [u8]) -> FsResult<usize> {
        let block_size = self.fs.block_size();
        if buf.len() < block_size {
            return Err(FsError::Invalid);
        }
        if self.file_pos >= self.file_size {
            return Ok(0);
        }
        self.step_into_cluster()?;
        if self.chain.end_reached() {
            // The size field promises more data than the chain holds.
            return Err(FsError::Corrupted);
        }
        let abs_block = self.current_data_block()?;
        self.fs
            .device()
            .read_block(abs_block, &mut buf[..block_size])?;
        let length = (block_size as u32).min(self.file_size - self.file_pos);
        self.file_pos += length;
        self.block_in_cluster += 1;
        Ok(length as usize)
    }

    /// Acquire write access.
    ///
    /// Takes a write reference (volume must be write-mounted), pins the
    /// directory entry and verifies it still carries this file's first
    /// cluster and size; a mismatch means the entry changed since the file
    /// was opened.
    pub fn open_writable(&mut self) -> FsResult<()> {
        if self.writable.is_some() {
            return Err(FsError::Invalid);
        }
        let write_ref = self
            .fs
            .take_write_reference()
            .ok_or(FsError::ReadOnly)?;
        let dir_entry = self
            .fs
            .pin_dir_entry(self.dir_entry_block_index, self.dir_entry_block_offset)?;
        if dir_entry.first_cluster() != self.chain.first_cluster()
            || dir_entry.file_size() != self.file_size
        {
            return Err(FsError::Stale);
        }
        self.writable = Some(Writable {
            dir_entry,
            _write_ref: write_ref,
        });
        Ok(())
    }

    /// Drop write access, releasing the write reference and the pinned
    /// directory entry.
    pub fn close_writable(&mut self) {
        self.writable = None;
    }

    /// Write one block at the current position.
    ///
    /// The position must be block-aligned and `bytes_in_block` in
    /// `1..=block_size`; the full block from `buf` is written to the device
    /// while only `bytes_in_block` bytes advance the position and extend the
    /// file size. The chain grows by a fresh cluster when the current one is
    /// exhausted.
    pub fn write_block(&mut self, buf: &[u8], bytes_in_block: usize) -> FsResult<()> {
        let block_size = self.fs.block_size();
        if self.writable.is_none() {
            return Err(FsError::ReadOnly);
        }
        if buf.len() < block_size
            || bytes_in_block == 0
            || bytes_in_block > block_size
            || self.file_pos as usize % block_size != 0
        {
            return Err(FsError::Invalid);
        }
        self.step_into_cluster()?;
        if self.chain.end_reached() {
            let first_cluster_changed = self.chain.extend(self.fs)?;
            if first_cluster_changed {
                if let Some(writable) = &self.writable {
                    writable.dir_entry.set_first_cluster(self.chain.first_cluster());
                }
            }
            self.block_in_cluster = 0;
        }
        let abs_block = self.current_data_block()?;
        self.fs.device().write_block(abs_block, &buf[..block_size])?;
        self.file_pos += bytes_in_block as u32;
        if self.file_size < self.file_pos {
            self.file_size = self.file_pos;
            if let Some(writable) = &self.writable {
                writable.dir_entry.set_file_size(self.file_size);
            }
        }
        self.block_in_cluster += 1;
        Ok(())
    }

    /// Cut the file off at the current position.
    ///
    /// Shrinks the size field when needed and frees every cluster past the
    /// position; truncating at position 0 releases the whole chain and
    /// stores a zero first cluster in the directory entry.
    pub fn truncate(&mut self) -> FsResult<()> {
        let writable = self.writable.as_ref().ok_or(FsError::ReadOnly)?;
        if self.file_size > self.file_pos {
            self.file_size = self.file_pos;
            writable.dir_entry.set_file_size(self.file_size);
        }
        let first_cluster_changed = self.chain.truncate(self.fs)?;
        if first_cluster_changed {
            writable.dir_entry.set_first_cluster(self.chain.first_cluster());
        }
        Ok(())
    }

    /// Advance the chain when the current cluster's blocks are used up.
    fn step_into_cluster(&mut self) -> FsResult<()> {
        if self.block_in_cluster == self.fs.blocks_per_cluster() {
            self.chain.advance(self.fs)?;
            if !self.chain.end_reached() {
                self.block_in_cluster = 0;
            }
        }
        Ok(())
    }

    fn current_data_block(&self) -> FsResult<u64> {
        let cluster = self.chain.current_cluster();
        if !self.fs.is_valid_for_data(cluster) {
            return Err(FsError::Corrupted);
        }
        Ok(self
            .fs
            .abs_block(self.fs.data_block_index(cluster, self.block_in_cluster)))
    }
}
