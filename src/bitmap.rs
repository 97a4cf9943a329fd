//! Persistent dirty bitmaps: the bitmaps header extension, its directory and
//! the per-bitmap tables.

use std::borrow::Cow;
use std::io::{Read, Seek, SeekFrom};

use bitflags::bitflags;
use bytemuck::{Pod, Zeroable};
use tracing::{debug, trace};

use crate::error::{Qcow2Error, Result};
use crate::field::DisplayHint::{BitmapFlags as BitmapFlagsHint, Decimal, Hex};
use crate::field::FieldWidth::{U8, U16, U32, U64};
use crate::field::{FieldSpec, StructLayout};
use crate::util::{ReaderExt, SeekExt, align8};

/// Bytes of bitmap table read per unit of `bitmap_table_size`.
pub const BITMAP_TABLE_BYTES_PER_UNIT: u64 = 64;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct BitmapFlags: u32 {
        const IN_USE = 0x1;
        const AUTO = 0x2;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BitmapTableEntryKind {
    Serialized,
    AllOnes,
    AllZeroes,
}

impl std::fmt::Display for BitmapTableEntryKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            BitmapTableEntryKind::Serialized => "serialized",
            BitmapTableEntryKind::AllOnes => "all-ones",
            BitmapTableEntryKind::AllZeroes => "all-zeroes",
        })
    }
}

/// One bitmap table slot, in host byte order.
#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
pub struct BitmapTableEntry(u64);

impl BitmapTableEntry {
    /// Bits 9..=55; the low 9 bits are flags/reserved.
    pub const OFFSET_MASK: u64 = 0x00ff_ffff_ffff_fe00;
    pub const FLAG_ALL_ONES: u64 = 1;

    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub const fn raw(self) -> u64 {
        self.0
    }

    pub const fn offset(self) -> u64 {
        self.0 & Self::OFFSET_MASK
    }

    pub const fn kind(self) -> BitmapTableEntryKind {
        if self.offset() != 0 {
            BitmapTableEntryKind::Serialized
        } else if self.0 & Self::FLAG_ALL_ONES != 0 {
            BitmapTableEntryKind::AllOnes
        } else {
            BitmapTableEntryKind::AllZeroes
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BitmapTable {
    entries: Vec<BitmapTableEntry>,
    /// Only carried for consumers; the decode never uses it.
    cluster_size: u64,
}

impl BitmapTable {
    /// Reads `table_size_units * 64` bytes of big-endian slots at the current
    /// position.
    pub fn parse<R: Read>(reader: &mut R, table_size_units: u32, cluster_size: u64) -> Result<Self> {
        let len = u64::from(table_size_units) * BITMAP_TABLE_BYTES_PER_UNIT;
        let raw = reader.read_vec(len, "bitmap table")?;

        let mut entries =
            vec![BitmapTableEntry::zeroed(); raw.len() / std::mem::size_of::<BitmapTableEntry>()];
        bytemuck::cast_slice_mut::<BitmapTableEntry, u8>(&mut entries).copy_from_slice(&raw);
        for entry in &mut entries {
            entry.0 = u64::from_be(entry.0);
        }

        Ok(Self {
            entries,
            cluster_size,
        })
    }

    pub fn entries(&self) -> &[BitmapTableEntry] {
        &self.entries
    }

    pub fn cluster_size(&self) -> u64 {
        self.cluster_size
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BitmapDirEntry {
    pub bitmap_table_offset: u64,
    /// In units of [`BITMAP_TABLE_BYTES_PER_UNIT`] bytes.
    pub bitmap_table_size: u32,
    pub flags: u32,
    pub bitmap_type: u8,
    pub granularity_bits: u8,
    pub name_size: u16,
    pub extra_data_size: u32,
    pub name: Vec<u8>,
    pub table: BitmapTable,
}

impl BitmapDirEntry {
    pub const LAYOUT: StructLayout = StructLayout::new(&[
        FieldSpec::new(U64, Hex, "bitmap_table_offset"),
        FieldSpec::new(U32, Decimal, "bitmap_table_size"),
        FieldSpec::new(U32, BitmapFlagsHint, "flags"),
        FieldSpec::new(U8, Decimal, "type"),
        FieldSpec::new(U8, Decimal, "granularity_bits"),
        FieldSpec::new(U16, Decimal, "name_size"),
        FieldSpec::new(U32, Decimal, "extra_data_size"),
    ]);

    /// Parses one directory entry at the current position and leaves the
    /// stream at the start of the next one. The bitmap table is read out of
    /// line without moving the directory cursor.
    pub fn parse<S: Read + Seek>(stream: &mut S, cluster_size: u64) -> Result<Self> {
        let values = Self::LAYOUT.read(stream, "bitmap directory entry")?;
        let &[
            bitmap_table_offset,
            bitmap_table_size,
            flags,
            bitmap_type,
            granularity_bits,
            name_size,
            extra_data_size,
        ] = values.as_slice()
        else {
            return Err(Qcow2Error::InvalidLayout("bitmap directory entry"));
        };
        let bitmap_table_size = bitmap_table_size as u32;
        let name_size = name_size as u16;
        let extra_data_size = extra_data_size as u32;

        stream.skip(u64::from(extra_data_size))?;
        let name = stream.read_vec(u64::from(name_size), "bitmap name")?;

        let raw_size = Self::raw_size_of(name_size, extra_data_size);
        stream.skip(align8(raw_size) - raw_size)?;

        let table = stream.with_restored_position(|s| {
            s.seek(SeekFrom::Start(bitmap_table_offset))?;
            BitmapTable::parse(s, bitmap_table_size, cluster_size)
        })?;

        let entry = Self {
            bitmap_table_offset,
            bitmap_table_size,
            flags: flags as u32,
            bitmap_type: bitmap_type as u8,
            granularity_bits: granularity_bits as u8,
            name_size,
            extra_data_size,
            name,
            table,
        };
        trace!(
            name = %entry.name_lossy(),
            table_offset = entry.bitmap_table_offset,
            table_entries = entry.table.entries().len(),
            "parsed bitmap directory entry"
        );
        Ok(entry)
    }

    fn raw_size_of(name_size: u16, extra_data_size: u32) -> u64 {
        Self::LAYOUT.size() as u64 + u64::from(extra_data_size) + u64::from(name_size)
    }

    /// Fixed prefix plus extra data plus name, before padding.
    pub fn raw_size(&self) -> u64 {
        Self::raw_size_of(self.name_size, self.extra_data_size)
    }

    /// Bytes the entry occupies in the directory.
    pub fn padded_size(&self) -> u64 {
        align8(self.raw_size())
    }

    pub fn bitmap_flags(&self) -> BitmapFlags {
        BitmapFlags::from_bits_retain(self.flags)
    }

    /// Bitmap names are ASCII on disk; anything else is replaced.
    pub fn name_lossy(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BitmapExtension {
    pub nb_bitmaps: u32,
    pub reserved32: u32,
    pub bitmap_directory_size: u64,
    pub bitmap_directory_offset: u64,
    pub cluster_size: u64,
    pub directory: Vec<BitmapDirEntry>,
}

impl BitmapExtension {
    pub const LAYOUT: StructLayout = StructLayout::new(&[
        FieldSpec::new(U32, Decimal, "nb_bitmaps"),
        FieldSpec::new(U32, Decimal, "reserved32"),
        FieldSpec::new(U64, Hex, "bitmap_directory_size"),
        FieldSpec::new(U64, Hex, "bitmap_directory_offset"),
    ]);

    /// Parses the extension payload at the current position, then the
    /// directory it points to.
    pub fn parse<S: Read + Seek>(stream: &mut S, cluster_size: u64) -> Result<Self> {
        let values = Self::LAYOUT.read(stream, "bitmaps extension")?;
        let &[nb_bitmaps, reserved32, bitmap_directory_size, bitmap_directory_offset] =
            values.as_slice()
        else {
            return Err(Qcow2Error::InvalidLayout("bitmaps extension"));
        };
        let nb_bitmaps = nb_bitmaps as u32;

        stream.seek(SeekFrom::Start(bitmap_directory_offset))?;
        let directory = (0..nb_bitmaps)
            .map(|_| BitmapDirEntry::parse(stream, cluster_size))
            .collect::<Result<Vec<_>>>()?;

        debug!(
            nb_bitmaps,
            directory_offset = bitmap_directory_offset,
            "parsed bitmaps extension"
        );
        Ok(Self {
            nb_bitmaps,
            reserved32: reserved32 as u32,
            bitmap_directory_size,
            bitmap_directory_offset,
            cluster_size,
            directory,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::io::Cursor;

    fn dir_entry_bytes(table_offset: u64, table_size: u32, flags: u32, name: &[u8]) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend_from_slice(&table_offset.to_be_bytes());
        buf.extend_from_slice(&table_size.to_be_bytes());
        buf.extend_from_slice(&flags.to_be_bytes());
        buf.push(1); // type
        buf.push(16); // granularity_bits
        buf.extend_from_slice(&(name.len() as u16).to_be_bytes());
        buf.extend_from_slice(&0u32.to_be_bytes());
        buf.extend_from_slice(name);
        buf.resize(align8(buf.len() as u64) as usize, 0);
        buf
    }

    #[test]
    fn classifies_table_slots() {
        assert_eq!(
            BitmapTableEntry::new(0x10000).kind(),
            BitmapTableEntryKind::Serialized
        );
        assert_eq!(BitmapTableEntry::new(1).kind(), BitmapTableEntryKind::AllOnes);
        assert_eq!(BitmapTableEntry::new(0).kind(), BitmapTableEntryKind::AllZeroes);
        // Reserved high bits and low flag bits never count as an offset.
        assert_eq!(
            BitmapTableEntry::new(0xff00_0000_0000_01fe).kind(),
            BitmapTableEntryKind::AllZeroes
        );
        assert_eq!(BitmapTableEntry::new(0x10001).offset(), 0x10000);
    }

    proptest! {
        #[test]
        fn classification_follows_mask_then_flag(raw in any::<u64>()) {
            let entry = BitmapTableEntry::new(raw);
            let expected = if raw & 0x00ff_ffff_ffff_fe00 != 0 {
                BitmapTableEntryKind::Serialized
            } else if raw & 1 != 0 {
                BitmapTableEntryKind::AllOnes
            } else {
                BitmapTableEntryKind::AllZeroes
            };
            prop_assert_eq!(entry.kind(), expected);
        }
    }

    #[test]
    fn table_reads_eight_slots_per_unit() {
        let mut buf = Vec::new();
        for slot in [0x20000u64, 1, 0, 0, 0, 0, 0, 0x30200] {
            buf.extend_from_slice(&slot.to_be_bytes());
        }
        let table = BitmapTable::parse(&mut Cursor::new(buf), 1, 65536).unwrap();
        let kinds: Vec<_> = table.entries().iter().map(|e| e.kind()).collect();
        assert_eq!(kinds.len(), 8);
        assert_eq!(kinds[0], BitmapTableEntryKind::Serialized);
        assert_eq!(kinds[1], BitmapTableEntryKind::AllOnes);
        assert_eq!(kinds[2], BitmapTableEntryKind::AllZeroes);
        assert_eq!(table.entries()[7].offset(), 0x30200);
        assert_eq!(table.cluster_size(), 65536);
    }

    #[test]
    fn short_table_is_truncated() {
        let err = BitmapTable::parse(&mut Cursor::new(vec![0u8; 63]), 1, 512).unwrap_err();
        assert!(matches!(
            err,
            Qcow2Error::Truncated {
                what: "bitmap table",
                expected: 64,
                actual: 63
            }
        ));
    }

    #[test]
    fn dir_entry_with_four_byte_name_occupies_32_bytes() {
        let mut image = dir_entry_bytes(0x100, 0, BitmapFlags::AUTO.bits(), b"test");
        assert_eq!(image.len(), 32);
        image.resize(0x100, 0);

        let mut cursor = Cursor::new(image);
        let entry = BitmapDirEntry::parse(&mut cursor, 65536).unwrap();
        assert_eq!(entry.name, b"test");
        assert_eq!(entry.raw_size(), 26);
        assert_eq!(entry.padded_size(), 32);
        assert_eq!(cursor.position(), 32);
        assert_eq!(entry.bitmap_flags(), BitmapFlags::AUTO);
        assert_eq!(entry.granularity_bits, 16);
    }

    #[test]
    fn extra_data_is_skipped_before_name() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&0u64.to_be_bytes());
        buf.extend_from_slice(&0u32.to_be_bytes());
        buf.extend_from_slice(&BitmapFlags::IN_USE.bits().to_be_bytes());
        buf.extend_from_slice(&[1, 16]);
        buf.extend_from_slice(&2u16.to_be_bytes());
        buf.extend_from_slice(&4u32.to_be_bytes());
        buf.extend_from_slice(&[0xee; 4]);
        buf.extend_from_slice(b"b0");
        // 22 + 4 + 2 = 28, padded to 32
        buf.resize(32, 0);

        let mut cursor = Cursor::new(buf);
        let entry = BitmapDirEntry::parse(&mut cursor, 512).unwrap();
        assert_eq!(entry.name_lossy(), "b0");
        assert_eq!(entry.extra_data_size, 4);
        assert_eq!(cursor.position(), 32);
        assert!(entry.table.entries().is_empty());
    }

    #[test]
    fn directory_entries_are_read_back_to_back() {
        // payload at 0, directory at 0x40, tables at 0x100 and 0x140
        let mut image = vec![0u8; 0x180];
        let mut payload = Vec::new();
        payload.extend_from_slice(&2u32.to_be_bytes());
        payload.extend_from_slice(&0u32.to_be_bytes());
        payload.extend_from_slice(&0x40u64.to_be_bytes());
        payload.extend_from_slice(&0x40u64.to_be_bytes());
        image[..24].copy_from_slice(&payload);

        let first = dir_entry_bytes(0x100, 1, BitmapFlags::IN_USE.bits(), b"first");
        let second = dir_entry_bytes(0x140, 1, 0, b"second-bitmap");
        image[0x40..0x40 + first.len()].copy_from_slice(&first);
        let second_at = 0x40 + first.len();
        image[second_at..second_at + second.len()].copy_from_slice(&second);
        image[0x100..0x108].copy_from_slice(&1u64.to_be_bytes());
        image[0x140..0x148].copy_from_slice(&0x50000u64.to_be_bytes());

        let mut cursor = Cursor::new(image);
        let ext = BitmapExtension::parse(&mut cursor, 65536).unwrap();
        assert_eq!(ext.nb_bitmaps, 2);
        assert_eq!(ext.directory.len(), 2);
        assert_eq!(ext.directory[0].name_lossy(), "first");
        assert_eq!(ext.directory[1].name_lossy(), "second-bitmap");
        assert_eq!(
            ext.directory[0].table.entries()[0].kind(),
            BitmapTableEntryKind::AllOnes
        );
        assert_eq!(ext.directory[1].table.entries()[0].offset(), 0x50000);
        assert_eq!(cursor.position(), (second_at + second.len()) as u64);
    }
}
