//! In-memory block device and image surgery helpers for tests.

use std::cell::{Cell, RefCell};
use std::vec;
use std::vec::Vec;

use emvfs::{FsError, FsResult};

use crate::block::{BlockDevice, BlockId, BlockRange};
use crate::dir::vfat_checksum;
use crate::fat::END_OF_CHAIN_MARKER;
use crate::geometry::{read_u32, write_u16, write_u32};
use crate::mkfs::{encode_short_name, format, ImageSpec};

pub(crate) struct TestBlockDevice {
    block_size: usize,
    data: RefCell<Vec<u8>>,
    writable: bool,
    fail_flush: Cell<bool>,
}

impl TestBlockDevice {
    pub(crate) fn new(block_size: usize, num_blocks: usize) -> Self {
        Self::from_image(block_size, vec![0u8; block_size * num_blocks])
    }

    pub(crate) fn from_image(block_size: usize, image: Vec<u8>) -> Self {
        Self {
            block_size,
            data: RefCell::new(image),
            writable: true,
            fail_flush: Cell::new(false),
        }
    }

    pub(crate) fn read_only(mut self) -> Self {
        self.writable = false;
        self
    }

    pub(crate) fn fail_flushes(&self, fail: bool) {
        self.fail_flush.set(fail);
    }

    pub(crate) fn whole_range(&self) -> BlockRange {
        BlockRange::new(0, (self.data.borrow().len() / self.block_size) as u64)
    }

    pub(crate) fn byte_at(&self, offset: usize) -> u8 {
        self.data.borrow()[offset]
    }

    // -- raw image surgery, addressed via an ImageSpec layout --

    pub(crate) fn fat_entry(&self, spec: &ImageSpec, cluster: u32) -> u32 {
        self.fat_entry_in_copy(spec, 0, cluster)
    }

    pub(crate) fn fat_entry_in_copy(&self, spec: &ImageSpec, copy: u8, cluster: u32) -> u32 {
        let offset = spec.fat_byte_offset(copy) + cluster as usize * 4;
        read_u32(&self.data.borrow(), offset)
    }

    pub(crate) fn set_raw_fat_entry(&self, spec: &ImageSpec, cluster: u32, value: u32) {
        self.set_fat_entry(spec, cluster, value);
    }

    fn set_fat_entry(&self, spec: &ImageSpec, cluster: u32, value: u32) {
        let mut data = self.data.borrow_mut();
        for copy in 0..spec.num_fats {
            let offset = spec.fat_byte_offset(copy) + cluster as usize * 4;
            write_u32(&mut data, offset, value);
        }
    }

    /// Link the given clusters into a chain ending with the end marker.
    pub(crate) fn set_fat_chain(&self, spec: &ImageSpec, clusters: &[u32]) {
        for pair in clusters.windows(2) {
            self.set_fat_entry(spec, pair[0], pair[1]);
        }
        if let Some(&last) = clusters.last() {
            self.set_fat_entry(spec, last, END_OF_CHAIN_MARKER);
        }
    }

    pub(crate) fn fs_info_free_clusters(&self, spec: &ImageSpec) -> u32 {
        let offset = spec.fs_info_sector as usize * spec.bytes_per_sector as usize;
        read_u32(&self.data.borrow(), offset + 0x1e8)
    }

    pub(crate) fn fs_info_last_allocated(&self, spec: &ImageSpec) -> u32 {
        let offset = spec.fs_info_sector as usize * spec.bytes_per_sector as usize;
        read_u32(&self.data.borrow(), offset + 0x1ec)
    }

    fn root_slot_offset(&self, spec: &ImageSpec, slot: u16) -> usize {
        spec.cluster_byte_offset(2) + slot as usize * 32
    }

    fn write_slot(&self, spec: &ImageSpec, slot: u16, entry: &[u8; 32]) {
        let offset = self.root_slot_offset(spec, slot);
        self.data.borrow_mut()[offset..offset + 32].copy_from_slice(entry);
    }

    fn short_entry(
        name83: [u8; 11],
        attrs: u8,
        nt_flags: u8,
        cluster: u32,
        size: u32,
    ) -> [u8; 32] {
        let mut entry = [0u8; 32];
        entry[..11].copy_from_slice(&name83);
        entry[11] = attrs;
        entry[12] = nt_flags;
        write_u16(&mut entry, 0x14, (cluster >> 16) as u16);
        write_u16(&mut entry, 0x1a, cluster as u16);
        write_u32(&mut entry, 0x1c, size);
        entry
    }

    pub(crate) fn add_file83(
        &self,
        spec: &ImageSpec,
        slot: u16,
        name: &str,
        cluster: u32,
        size: u32,
    ) {
        let name83 = encode_short_name(name).unwrap();
        self.write_slot(spec, slot, &Self::short_entry(name83, 0x20, 0, cluster, size));
    }

    pub(crate) fn add_dir83(&self, spec: &ImageSpec, slot: u16, name: &str, cluster: u32) {
        let name83 = encode_short_name(name).unwrap();
        self.write_slot(spec, slot, &Self::short_entry(name83, 0x10, 0, cluster, 0));
    }

    pub(crate) fn add_entry83_raw(
        &self,
        spec: &ImageSpec,
        slot: u16,
        name: &str,
        attrs: u8,
        cluster: u32,
        size: u32,
    ) {
        let name83 = encode_short_name(name).unwrap();
        self.write_slot(spec, slot, &Self::short_entry(name83, attrs, 0, cluster, size));
    }

    pub(crate) fn add_entry83_flags(
        &self,
        spec: &ImageSpec,
        slot: u16,
        name: &str,
        attrs: u8,
        nt_flags: u8,
        cluster: u32,
        size: u32,
    ) {
        let name83 = encode_short_name(name).unwrap();
        self.write_slot(
            spec,
            slot,
            &Self::short_entry(name83, attrs, nt_flags, cluster, size),
        );
    }

    pub(crate) fn add_volume_label(&self, spec: &ImageSpec, slot: u16, label: &str) {
        let mut name83 = [b' '; 11];
        name83[..label.len()].copy_from_slice(label.as_bytes());
        self.write_slot(spec, slot, &Self::short_entry(name83, 0x08, 0, 0, 0));
    }

    pub(crate) fn free_slot(&self, spec: &ImageSpec, slot: u16) {
        let offset = self.root_slot_offset(spec, slot);
        self.data.borrow_mut()[offset] = 0xe5;
    }

    /// Write the long-name fragment run for `long_name` starting at
    /// `start_slot`, bound to `short_name`'s checksum. Returns the number of
    /// fragment slots written; the short entry is not written.
    pub(crate) fn add_lfn_run(
        &self,
        spec: &ImageSpec,
        start_slot: u16,
        long_name: &str,
        short_name: &str,
    ) -> u16 {
        let name83 = encode_short_name(short_name).unwrap();
        let checksum = vfat_checksum(&name83);
        let units: Vec<u16> = long_name.encode_utf16().collect();
        let num_fragments = units.len().div_ceil(13).max(1) as u16;

        for index in 0..num_fragments {
            let seq = num_fragments - index;
            let start_flag = if index == 0 { 0x40 } else { 0 };
            let mut entry = [0u8; 32];
            entry[0] = seq as u8 | start_flag;
            entry[11] = 0x0f;
            entry[12] = 0;
            entry[13] = checksum;
            let base = (seq as usize - 1) * 13;
            for position in 0..13 {
                let unit = match units.get(base + position) {
                    Some(&unit) => unit,
                    None if base + position == units.len() => 0x0000,
                    None => 0xffff,
                };
                let offset = match position {
                    0..=4 => 1 + position * 2,
                    5..=10 => 14 + (position - 5) * 2,
                    _ => 28 + (position - 11) * 2,
                };
                write_u16(&mut entry, offset, unit);
            }
            self.write_slot(spec, start_slot + index, &entry);
        }
        num_fragments
    }

    pub(crate) fn add_file_lfn(
        &self,
        spec: &ImageSpec,
        start_slot: u16,
        long_name: &str,
        short_name: &str,
        cluster: u32,
        size: u32,
    ) {
        let fragments = self.add_lfn_run(spec, start_slot, long_name, short_name);
        self.add_entry83_raw(spec, start_slot + fragments, short_name, 0x20, cluster, size);
    }

    /// Flip the checksum byte of the long-name fragment at `slot`.
    pub(crate) fn corrupt_lfn_checksum(&self, spec: &ImageSpec, slot: u16) {
        let offset = self.root_slot_offset(spec, slot) + 13;
        let mut data = self.data.borrow_mut();
        data[offset] ^= 0xff;
    }

    pub(crate) fn write_dot_entries(
        &self,
        spec: &ImageSpec,
        dir_cluster: u32,
        dot_cluster: u32,
        dotdot_cluster: u32,
    ) {
        let mut dot = [b' '; 11];
        dot[0] = b'.';
        let mut dotdot = [b' '; 11];
        dotdot[0] = b'.';
        dotdot[1] = b'.';
        let base = spec.cluster_byte_offset(dir_cluster);
        let mut data = self.data.borrow_mut();
        data[base..base + 32].copy_from_slice(&Self::short_entry(dot, 0x10, 0, dot_cluster, 0));
        data[base + 32..base + 64]
            .copy_from_slice(&Self::short_entry(dotdot, 0x10, 0, dotdot_cluster, 0));
    }

    pub(crate) fn write_cluster_data(&self, spec: &ImageSpec, cluster: u32, bytes: &[u8]) {
        let base = spec.cluster_byte_offset(cluster);
        self.data.borrow_mut()[base..base + bytes.len()].copy_from_slice(bytes);
    }

    pub(crate) fn dir_entry_cluster(&self, spec: &ImageSpec, slot: u16) -> u32 {
        let offset = self.root_slot_offset(spec, slot);
        let data = self.data.borrow();
        let low = u16::from_le_bytes([data[offset + 0x1a], data[offset + 0x1b]]) as u32;
        let high = u16::from_le_bytes([data[offset + 0x14], data[offset + 0x15]]) as u32;
        high << 16 | low
    }

    pub(crate) fn dir_entry_size(&self, spec: &ImageSpec, slot: u16) -> u32 {
        let offset = self.root_slot_offset(spec, slot);
        read_u32(&self.data.borrow(), offset + 0x1c)
    }
}

impl BlockDevice for TestBlockDevice {
    fn block_size(&self) -> usize {
        self.block_size
    }

    fn read_block(&self, block_id: BlockId, buf: &mut [u8]) -> FsResult<()> {
        let offset = block_id as usize * self.block_size;
        let data = self.data.borrow();
        if offset + self.block_size > data.len() {
            return Err(FsError::Io);
        }
        buf[..self.block_size].copy_from_slice(&data[offset..offset + self.block_size]);
        Ok(())
    }

    fn write_block(&self, block_id: BlockId, buf: &[u8]) -> FsResult<()> {
        if !self.writable {
            return Err(FsError::ReadOnly);
        }
        let offset = block_id as usize * self.block_size;
        let mut data = self.data.borrow_mut();
        if offset + self.block_size > data.len() {
            return Err(FsError::Io);
        }
        data[offset..offset + self.block_size].copy_from_slice(&buf[..self.block_size]);
        Ok(())
    }

    fn flush(&self) -> FsResult<()> {
        if self.fail_flush.get() {
            return Err(FsError::Io);
        }
        Ok(())
    }

    fn is_writable(&self) -> bool {
        self.writable
    }
}

/// Format an image for `spec` and wrap it in a test device.
pub(crate) fn image_device(spec: &ImageSpec) -> TestBlockDevice {
    let mut image = vec![0u8; spec.image_bytes()];
    format(&mut image, spec).unwrap();
    TestBlockDevice::from_image(spec.bytes_per_sector as usize, image)
}
