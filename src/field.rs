//! Big-endian fixed-width field codec.
//!
//! Every fixed-size qcow2 record is described by a [`StructLayout`]: an
//! ordered list of [`FieldSpec`]s. The list is both the wire layout and the
//! order in which values are packed. Values travel through the codec
//! positionally as `u64`s and typed records destructure them by position.

use std::io::Read;

use crate::error::{Qcow2Error, Result};
use crate::util::ReaderExt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldWidth {
    U8,
    U16,
    U32,
    U64,
}

impl FieldWidth {
    pub const fn bytes(self) -> usize {
        match self {
            FieldWidth::U8 => 1,
            FieldWidth::U16 => 2,
            FieldWidth::U32 => 4,
            FieldWidth::U64 => 8,
        }
    }

    pub const fn max_value(self) -> u64 {
        match self {
            FieldWidth::U8 => u8::MAX as u64,
            FieldWidth::U16 => u16::MAX as u64,
            FieldWidth::U32 => u32::MAX as u64,
            FieldWidth::U64 => u64::MAX,
        }
    }
}

/// How a consumer should render a field's value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisplayHint {
    Decimal,
    Hex,
    /// 64-bit feature bitset, rendered as the list of set bits.
    Flags,
    BitmapFlags,
    ExtensionMagic,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldSpec {
    pub width: FieldWidth,
    pub display: DisplayHint,
    pub name: &'static str,
}

impl FieldSpec {
    pub const fn new(width: FieldWidth, display: DisplayHint, name: &'static str) -> Self {
        Self {
            width,
            display,
            name,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct StructLayout {
    fields: &'static [FieldSpec],
}

impl StructLayout {
    pub const fn new(fields: &'static [FieldSpec]) -> Self {
        Self { fields }
    }

    pub const fn fields(&self) -> &'static [FieldSpec] {
        self.fields
    }

    /// Encoded size in bytes.
    pub const fn size(&self) -> usize {
        let mut total = 0;
        let mut i = 0;
        while i < self.fields.len() {
            total += self.fields[i].width.bytes();
            i += 1;
        }
        total
    }

    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.fields.iter().position(|f| f.name == name)
    }

    /// Decodes a buffer of exactly [`size`](Self::size) bytes.
    pub fn decode(&self, buf: &[u8]) -> Result<Vec<u64>> {
        if buf.len() < self.size() {
            return Err(Qcow2Error::Truncated {
                what: "fixed-size record",
                expected: self.size() as u64,
                actual: buf.len() as u64,
            });
        }
        if buf.len() > self.size() {
            return Err(Qcow2Error::InvalidLayout(
                "buffer is longer than the record",
            ));
        }

        let mut values = Vec::with_capacity(self.fields.len());
        let mut rest = buf;
        for field in self.fields {
            let (head, tail) = rest.split_at(field.width.bytes());
            values.push(head.iter().fold(0u64, |acc, b| (acc << 8) | u64::from(*b)));
            rest = tail;
        }
        Ok(values)
    }

    /// Decodes one record at the reader's current position.
    pub fn read<R: Read>(&self, reader: &mut R, what: &'static str) -> Result<Vec<u64>> {
        let buf = reader.read_vec(self.size() as u64, what)?;
        self.decode(&buf)
    }

    pub fn encode(&self, values: &[u64]) -> Result<Vec<u8>> {
        if values.len() != self.fields.len() {
            return Err(Qcow2Error::InvalidLayout(
                "value count does not match field count",
            ));
        }

        let mut buf = Vec::with_capacity(self.size());
        for (field, &value) in self.fields.iter().zip(values) {
            if value > field.width.max_value() {
                return Err(Qcow2Error::ValueOutOfRange {
                    field: field.name,
                    value,
                });
            }
            buf.extend_from_slice(&value.to_be_bytes()[8 - field.width.bytes()..]);
        }
        Ok(buf)
    }
}
