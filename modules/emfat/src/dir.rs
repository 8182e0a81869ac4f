//! Directory entry access and directory listing with VFAT long names.

use bitflags::bitflags;
use emvfs::{EntryType, FileName, FsError, FsResult, MAX_NAME_LEN};

use crate::block::BlockRef;
use crate::chain::ClusterChain;
use crate::fat::{mask_entry, END_OF_CHAIN_MARKER};
use crate::fs::{FatFs, FsEntry};
use crate::geometry::{read_u16, read_u32, write_u16, write_u32};

/// Size of one directory slot in bytes.
pub(crate) const DIR_ENTRY_SIZE: usize = 32;

const ENTRY_ATTRS_OFFSET: usize = 0x0b;
const ENTRY_NT_FLAGS_OFFSET: usize = 0x0c;
const ENTRY_CHECKSUM_OFFSET: usize = 0x0d;
const ENTRY_CLUSTER_HIGH_OFFSET: usize = 0x14;
const ENTRY_CLUSTER_LOW_OFFSET: usize = 0x1a;
const ENTRY_SIZE_OFFSET: usize = 0x1c;

const ENTRY_FREE: u8 = 0xe5;
const ATTRS_LONG_NAME: u8 = 0x0f;
const NT_LOWERCASE_NAME: u8 = 0x08;
const NT_LOWERCASE_EXT: u8 = 0x10;

bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub(crate) struct DirAttrs: u8 {
        const READ_ONLY = 0x01;
        const HIDDEN = 0x02;
        const SYSTEM = 0x04;
        const VOLUME_ID = 0x08;
        const DIRECTORY = 0x10;
        const ARCHIVE = 0x20;
        const DEVICE = 0x40;
    }
}

pub(crate) fn read_entry_first_cluster(entry: &[u8]) -> u32 {
    (read_u16(entry, ENTRY_CLUSTER_HIGH_OFFSET) as u32) << 16
        | read_u16(entry, ENTRY_CLUSTER_LOW_OFFSET) as u32
}

fn write_entry_first_cluster(entry: &mut [u8], value: u32) {
    write_u16(entry, ENTRY_CLUSTER_LOW_OFFSET, value as u16);
    write_u16(entry, ENTRY_CLUSTER_HIGH_OFFSET, (value >> 16) as u16);
}

/// Checksum binding a VFAT long-name run to its short entry.
pub(crate) fn vfat_checksum(short_name: &[u8]) -> u8 {
    short_name[..11]
        .iter()
        .fold(0u8, |csum, &byte| {
            ((csum & 1) << 7).wrapping_add(csum >> 1).wrapping_add(byte)
        })
}

fn utf8_encode(ch: u16, out: &mut [u8; 3]) -> usize {
    if ch < 0x80 {
        out[0] = ch as u8;
        1
    } else if ch < 0x800 {
        out[0] = 0xc0 | (ch >> 6) as u8;
        out[1] = 0x80 | (ch & 0x3f) as u8;
        2
    } else {
        out[0] = 0xe0 | (ch >> 12) as u8;
        out[1] = 0x80 | ((ch >> 6) & 0x3f) as u8;
        out[2] = 0x80 | (ch & 0x3f) as u8;
        3
    }
}

/// Pinned accessor for one 32-byte directory slot.
///
/// Holds the slot's block in the cache; setters mark it dirty.
pub(crate) struct DirEntryRef<'r> {
    block: BlockRef<'r>,
    offset: usize,
}

impl<'a> FatFs<'a> {
    pub(crate) fn pin_dir_entry(
        &self,
        block_index: u64,
        block_offset: u16,
    ) -> FsResult<DirEntryRef<'_>> {
        if block_index == 0
            || block_index >= self.range().length()
            || block_offset as usize >= self.block_size() / DIR_ENTRY_SIZE
        {
            return Err(FsError::Invalid);
        }
        Ok(DirEntryRef {
            block: self.pin_rel_block(block_index)?,
            offset: block_offset as usize * DIR_ENTRY_SIZE,
        })
    }
}

impl DirEntryRef<'_> {
    pub(crate) fn first_cluster(&self) -> u32 {
        let offset = self.offset;
        mask_entry(self.block.with(|buf| read_entry_first_cluster(&buf[offset..])))
    }

    /// Rewrite the first-cluster field, preserving its reserved high bits.
    /// The end-of-chain sentinel of an emptied chain is stored as 0.
    pub(crate) fn set_first_cluster(&self, value: u32) {
        let value = if value == END_OF_CHAIN_MARKER { 0 } else { value };
        let offset = self.offset;
        self.block.with_mut(|buf| {
            let entry = &mut buf[offset..];
            let raw = read_entry_first_cluster(entry);
            write_entry_first_cluster(entry, (raw & 0xf000_0000) | value);
        });
    }

    pub(crate) fn file_size(&self) -> u32 {
        let offset = self.offset;
        self.block.with(|buf| read_u32(buf, offset + ENTRY_SIZE_OFFSET))
    }

    pub(crate) fn set_file_size(&self, value: u32) {
        let offset = self.offset;
        self.block
            .with_mut(|buf| write_u32(buf, offset + ENTRY_SIZE_OFFSET, value));
    }
}

/// Streaming directory reader.
///
/// Walks the directory's cluster chain slot by slot, reassembling VFAT
/// long-name runs and validating them against their short entry's checksum.
pub struct DirLister<'r> {
    fs: &'r FatFs<'r>,
    chain: ClusterChain,
    block_in_cluster: u16,
    block_entry_pos: u16,
    dir_block: Option<BlockRef<'r>>,
    vfat_seq: i8,
    vfat_csum: u8,
    name_pos: usize,
    name_buf: [u8; MAX_NAME_LEN + 1],
}

impl<'a> FatFs<'a> {
    /// Start listing the directory behind `dir`.
    pub fn list_dir(&self, dir: &FsEntry) -> FsResult<DirLister<'_>> {
        if dir.kind != EntryType::Dir {
            return Err(FsError::NotDir);
        }
        Ok(DirLister {
            fs: self,
            chain: ClusterChain::new(dir.cluster_index),
            block_in_cluster: self.blocks_per_cluster(),
            block_entry_pos: (self.block_size() / DIR_ENTRY_SIZE) as u16,
            dir_block: None,
            vfat_seq: -1,
            vfat_csum: 0,
            name_pos: MAX_NAME_LEN,
            name_buf: [0; MAX_NAME_LEN + 1],
        })
    }

    /// Find an entry of the given kind and name in a directory.
    ///
    /// Ok(None) means the directory holds no such entry. Name comparison is
    /// byte-wise, optionally ASCII case-insensitive.
    pub fn find_entry(
        &self,
        dir: &FsEntry,
        kind: EntryType,
        name: &str,
        case_insensitive: bool,
    ) -> FsResult<Option<FsEntry>> {
        let mut lister = self.list_dir(dir)?;
        while let Some((entry_name, entry)) = lister.next_entry()? {
            if entry.kind != kind {
                continue;
            }
            let matches = if case_insensitive {
                entry_name.as_bytes().eq_ignore_ascii_case(name.as_bytes())
            } else {
                entry_name.as_bytes() == name.as_bytes()
            };
            if matches {
                return Ok(Some(entry));
            }
        }
        Ok(None)
    }
}

impl<'r> DirLister<'r> {
    /// Produce the next directory entry, or None at the end of the
    /// directory.
    pub fn next_entry(&mut self) -> FsResult<Option<(FileName, FsEntry)>> {
        let fs = self.fs;
        let entries_per_block = (fs.block_size() / DIR_ENTRY_SIZE) as u16;
        let blocks_per_cluster = fs.blocks_per_cluster();

        loop {
            if self.block_entry_pos == entries_per_block {
                if self.block_in_cluster == blocks_per_cluster {
                    self.dir_block = None;
                    self.chain.advance(fs)?;
                    if self.chain.end_reached() {
                        return Ok(None);
                    }
                    self.block_in_cluster = 0;
                    continue;
                }
                let cluster = self.chain.current_cluster();
                if !fs.is_valid_for_data(cluster) {
                    return Err(FsError::Corrupted);
                }
                let block_index = fs.data_block_index(cluster, self.block_in_cluster);
                self.dir_block = Some(fs.pin_rel_block(block_index)?);
                self.block_in_cluster += 1;
                self.block_entry_pos = 0;
            }

            let slot_offset = self.block_entry_pos as usize * DIR_ENTRY_SIZE;
            let entry: [u8; DIR_ENTRY_SIZE] = match &self.dir_block {
                Some(block) => block.with(|buf| {
                    let mut slot = [0u8; DIR_ENTRY_SIZE];
                    slot.copy_from_slice(&buf[slot_offset..slot_offset + DIR_ENTRY_SIZE]);
                    slot
                }),
                None => return Err(FsError::Invalid),
            };

            let first_byte = entry[0];
            let attrs = entry[ENTRY_ATTRS_OFFSET];
            let nt_flags = entry[ENTRY_NT_FLAGS_OFFSET];
            let checksum_byte = entry[ENTRY_CHECKSUM_OFFSET];
            let file_size = read_u32(&entry, ENTRY_SIZE_OFFSET);

            if first_byte == 0 {
                return Ok(None);
            }
            self.block_entry_pos += 1;

            if first_byte != ENTRY_FREE && attrs == ATTRS_LONG_NAME && nt_flags == 0 && file_size != 0 {
                let entry_seq = (first_byte & 0x1f) as i8;
                if first_byte & 0x60 == 0x40 {
                    self.vfat_seq = entry_seq;
                    self.vfat_csum = checksum_byte;
                    self.name_pos = MAX_NAME_LEN;
                }
                if entry_seq > 0
                    && self.vfat_seq != -1
                    && entry_seq == self.vfat_seq
                    && checksum_byte == self.vfat_csum
                    && self.collect_lfn_fragment(&entry)
                {
                    self.vfat_seq -= 1;
                } else {
                    self.vfat_seq = -1;
                }
                continue;
            }

            if first_byte == ENTRY_FREE {
                self.vfat_seq = -1;
                continue;
            }

            let attr_flags = DirAttrs::from_bits_retain(attrs);
            if attr_flags.intersects(DirAttrs::VOLUME_ID | DirAttrs::DEVICE) {
                // A pending long-name run survives these slots; only a real
                // short entry or a free slot consumes it.
                continue;
            }

            let pending_seq = self.vfat_seq;
            self.vfat_seq = -1;

            let is_dir = attr_flags.contains(DirAttrs::DIRECTORY);
            let is_dot = first_byte == b'.';

            let mut first_cluster = mask_entry(read_entry_first_cluster(&entry));
            if is_dot && first_cluster == 0 {
                first_cluster = fs.geometry().root_cluster;
            }

            let name = if !is_dot
                && pending_seq == 0
                && vfat_checksum(&entry[..11]) == self.vfat_csum
            {
                FileName::from_bytes(&self.name_buf[self.name_pos..MAX_NAME_LEN])?
            } else {
                short_entry_name(&entry, nt_flags)?
            };

            let fs_entry = FsEntry {
                kind: if is_dir { EntryType::Dir } else { EntryType::File },
                file_size,
                cluster_index: first_cluster,
                dir_entry_block_index: fs
                    .data_block_index(self.chain.current_cluster(), self.block_in_cluster - 1),
                dir_entry_block_offset: self.block_entry_pos - 1,
            };
            return Ok(Some((name, fs_entry)));
        }
    }

    /// Fold one long-name fragment into the name buffer, tail first.
    /// Returns false when the name does not fit.
    fn collect_lfn_fragment(&mut self, entry: &[u8; DIR_ENTRY_SIZE]) -> bool {
        let mut payload = [0u8; 26];
        payload[..10].copy_from_slice(&entry[1..11]);
        payload[10..22].copy_from_slice(&entry[14..26]);
        payload[22..26].copy_from_slice(&entry[28..32]);

        let mut chunk_len = 0usize;
        let mut encoded = [0u8; 3];
        for pair in payload.chunks_exact(2) {
            let ch = u16::from_le_bytes([pair[0], pair[1]]);
            if ch == 0 {
                break;
            }
            let len = utf8_encode(ch, &mut encoded);
            if len > self.name_pos - chunk_len {
                return false;
            }
            self.name_buf[chunk_len..chunk_len + len].copy_from_slice(&encoded[..len]);
            chunk_len += len;
        }
        self.name_buf.copy_within(..chunk_len, self.name_pos - chunk_len);
        self.name_pos -= chunk_len;
        true
    }
}

/// Canonical form of an 8.3 short name: 0x05 lead-byte rewrite, trailing
/// space trim, optional lowercasing, '.' join for a non-empty extension.
fn short_entry_name(entry: &[u8; DIR_ENTRY_SIZE], nt_flags: u8) -> FsResult<FileName> {
    let mut base = [0u8; 8];
    base.copy_from_slice(&entry[..8]);
    if base[0] == 0x05 {
        base[0] = 0xe5;
    }
    let base_len = fixup_83_part(&mut base, nt_flags & NT_LOWERCASE_NAME != 0);

    let mut ext = [0u8; 3];
    ext.copy_from_slice(&entry[8..11]);
    let ext_len = fixup_83_part(&mut ext, nt_flags & NT_LOWERCASE_EXT != 0);

    let mut name = [0u8; 12];
    let mut len = base_len;
    name[..base_len].copy_from_slice(&base[..base_len]);
    if ext_len > 0 {
        name[len] = b'.';
        len += 1;
        name[len..len + ext_len].copy_from_slice(&ext[..ext_len]);
        len += ext_len;
    }
    FileName::from_bytes(&name[..len])
}

fn fixup_83_part(part: &mut [u8], lowercase: bool) -> usize {
    let len = part
        .iter()
        .rposition(|&byte| byte != b' ')
        .map_or(0, |index| index + 1);
    if lowercase {
        part[..len].make_ascii_lowercase();
    }
    len
}
