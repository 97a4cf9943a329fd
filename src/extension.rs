//! Header extensions: tagged, length-prefixed records following the fixed
//! header, each padded to 8 bytes. The chain ends at a zero magic or at the
//! extension-area bound.

use std::io::{Read, Seek, SeekFrom, Write};

use tracing::{debug, trace, warn};

use crate::bitmap::BitmapExtension;
use crate::error::{Qcow2Error, Result};
use crate::field::DisplayHint::{Decimal, ExtensionMagic};
use crate::field::FieldWidth::U32;
use crate::field::{FieldSpec, StructLayout};
use crate::util::{ReaderExt, SeekExt, align8};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtensionKind {
    BackingFormat,
    FeatureTable,
    CryptoHeader,
    Bitmaps,
    DataFile,
    Unknown(u32),
}

impl ExtensionKind {
    pub const BACKING_FORMAT_MAGIC: u32 = 0xe279_2aca;
    pub const FEATURE_TABLE_MAGIC: u32 = 0x6803_f857;
    pub const CRYPTO_HEADER_MAGIC: u32 = 0x0537_be77;
    pub const BITMAPS_MAGIC: u32 = 0x2385_2875;
    pub const DATA_FILE_MAGIC: u32 = 0x4441_5441;

    pub const fn from_magic(magic: u32) -> Self {
        match magic {
            Self::BACKING_FORMAT_MAGIC => ExtensionKind::BackingFormat,
            Self::FEATURE_TABLE_MAGIC => ExtensionKind::FeatureTable,
            Self::CRYPTO_HEADER_MAGIC => ExtensionKind::CryptoHeader,
            Self::BITMAPS_MAGIC => ExtensionKind::Bitmaps,
            Self::DATA_FILE_MAGIC => ExtensionKind::DataFile,
            other => ExtensionKind::Unknown(other),
        }
    }

    pub const fn magic(self) -> u32 {
        match self {
            ExtensionKind::BackingFormat => Self::BACKING_FORMAT_MAGIC,
            ExtensionKind::FeatureTable => Self::FEATURE_TABLE_MAGIC,
            ExtensionKind::CryptoHeader => Self::CRYPTO_HEADER_MAGIC,
            ExtensionKind::Bitmaps => Self::BITMAPS_MAGIC,
            ExtensionKind::DataFile => Self::DATA_FILE_MAGIC,
            ExtensionKind::Unknown(magic) => magic,
        }
    }

    pub const fn name(self) -> Option<&'static str> {
        match self {
            ExtensionKind::BackingFormat => Some("Backing format"),
            ExtensionKind::FeatureTable => Some("Feature table"),
            ExtensionKind::CryptoHeader => Some("Crypto header"),
            ExtensionKind::Bitmaps => Some("Bitmaps"),
            ExtensionKind::DataFile => Some("Data file"),
            ExtensionKind::Unknown(_) => None,
        }
    }
}

/// What the codec understood of an extension's payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExtensionContent {
    /// Not interpreted; written back verbatim.
    Opaque,
    Bitmaps(BitmapExtension),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeaderExtension {
    magic: u32,
    length: u32,
    /// Payload zero-padded to a multiple of 8.
    data: Vec<u8>,
    content: ExtensionContent,
}

impl HeaderExtension {
    pub const LAYOUT: StructLayout = StructLayout::new(&[
        FieldSpec::new(U32, ExtensionMagic, "magic"),
        FieldSpec::new(U32, Decimal, "length"),
    ]);
    pub const TERMINATOR_MAGIC: u32 = 0;

    /// Builds an opaque extension from raw payload bytes.
    pub fn create(magic: u32, data: impl Into<Vec<u8>>) -> Result<Self> {
        let mut data = data.into();
        let length = u32::try_from(data.len()).map_err(|_| Qcow2Error::ValueOutOfRange {
            field: "length",
            value: data.len() as u64,
        })?;
        data.resize(align8(u64::from(length)) as usize, 0);
        Ok(Self {
            magic,
            length,
            data,
            content: ExtensionContent::Opaque,
        })
    }

    pub fn magic(&self) -> u32 {
        self.magic
    }

    pub fn kind(&self) -> ExtensionKind {
        ExtensionKind::from_magic(self.magic)
    }

    /// Payload length before padding.
    pub fn length(&self) -> u32 {
        self.length
    }

    pub fn payload(&self) -> &[u8] {
        &self.data[..self.length as usize]
    }

    /// Payload bytes occupied on disk, padding included.
    pub fn padded_len(&self) -> u64 {
        align8(u64::from(self.length))
    }

    pub fn content(&self) -> &ExtensionContent {
        &self.content
    }

    pub fn bitmaps(&self) -> Option<&BitmapExtension> {
        match &self.content {
            ExtensionContent::Bitmaps(bitmaps) => Some(bitmaps),
            ExtensionContent::Opaque => None,
        }
    }

    /// The on-disk record: magic, length, padded payload.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut buf = Self::LAYOUT.encode(&[u64::from(self.magic), u64::from(self.length)])?;
        buf.extend_from_slice(&self.data);
        Ok(buf)
    }

    /// Reads one record at the current position. Returns `None` at the
    /// terminator.
    fn read<S: Read + Seek>(stream: &mut S, cluster_size: u64) -> Result<Option<Self>> {
        let values = Self::LAYOUT.read(stream, "header extension")?;
        let &[magic, length] = values.as_slice() else {
            return Err(Qcow2Error::InvalidLayout("header extension"));
        };
        let (magic, length) = (magic as u32, length as u32);
        if magic == Self::TERMINATOR_MAGIC {
            return Ok(None);
        }

        let payload_start = stream.stream_position()?;
        let mut data = stream.read_vec(u64::from(length), "header extension data")?;
        let padded = align8(u64::from(length));
        stream.skip(padded - u64::from(length))?;
        data.resize(padded as usize, 0);

        let content = match ExtensionKind::from_magic(magic) {
            ExtensionKind::Bitmaps => stream.with_restored_position(|s| {
                s.seek(SeekFrom::Start(payload_start))?;
                BitmapExtension::parse(s, cluster_size).map(ExtensionContent::Bitmaps)
            })?,
            _ => ExtensionContent::Opaque,
        };

        trace!(magic = format_args!("{magic:#x}"), length, "read header extension");
        Ok(Some(Self {
            magic,
            length,
            data,
            content,
        }))
    }
}

/// Reads extensions from `start` until a terminator or until the cursor
/// reaches `bound`.
pub fn scan_extensions<S: Read + Seek>(
    stream: &mut S,
    start: u64,
    bound: u64,
    cluster_size: u64,
) -> Result<Vec<HeaderExtension>> {
    stream.seek(SeekFrom::Start(start))?;

    let mut extensions = Vec::new();
    loop {
        let pos = stream.stream_position()?;
        if pos >= bound {
            warn!(pos, bound, "header extension area ended without terminator");
            break;
        }
        match HeaderExtension::read(stream, cluster_size)? {
            Some(ext) => extensions.push(ext),
            None => break,
        }
    }

    debug!(count = extensions.len(), start, bound, "scanned header extensions");
    Ok(extensions)
}

/// Serializes `extensions` followed by the terminator record.
pub fn encode_extensions(extensions: &[HeaderExtension]) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    for ext in extensions {
        buf.extend_from_slice(&ext.to_bytes()?);
    }
    buf.extend_from_slice(&HeaderExtension::LAYOUT.encode(&[
        u64::from(HeaderExtension::TERMINATOR_MAGIC),
        0,
    ])?);
    Ok(buf)
}

/// Writes `extensions` and the terminator at `at`, returning the position
/// just past the terminator.
pub fn write_extensions<S: Write + Seek>(
    stream: &mut S,
    extensions: &[HeaderExtension],
    at: u64,
) -> Result<u64> {
    let buf = encode_extensions(extensions)?;
    stream.seek(SeekFrom::Start(at))?;
    stream.write_all(&buf)?;
    Ok(stream.stream_position()?)
}
