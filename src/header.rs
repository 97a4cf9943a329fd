use std::io::{Read, Seek, SeekFrom, Write};

use tracing::{debug, warn};

use crate::error::{Qcow2Error, Result};
use crate::extension::{HeaderExtension, encode_extensions, scan_extensions};
use crate::field::DisplayHint::{Decimal, Flags, Hex};
use crate::field::FieldWidth::{U32, U64};
use crate::field::{FieldSpec, StructLayout};
use crate::util::ReaderExt;

const HEADER_FIELDS: &[FieldSpec] = &[
    // version 2
    FieldSpec::new(U32, Hex, "magic"),
    FieldSpec::new(U32, Decimal, "version"),
    FieldSpec::new(U64, Hex, "backing_file_offset"),
    FieldSpec::new(U32, Hex, "backing_file_size"),
    FieldSpec::new(U32, Decimal, "cluster_bits"),
    FieldSpec::new(U64, Decimal, "size"),
    FieldSpec::new(U32, Decimal, "crypt_method"),
    FieldSpec::new(U32, Decimal, "l1_size"),
    FieldSpec::new(U64, Hex, "l1_table_offset"),
    FieldSpec::new(U64, Hex, "refcount_table_offset"),
    FieldSpec::new(U32, Decimal, "refcount_table_clusters"),
    FieldSpec::new(U32, Decimal, "nb_snapshots"),
    FieldSpec::new(U64, Hex, "snapshot_offset"),
    // version 3
    FieldSpec::new(U64, Flags, "incompatible_features"),
    FieldSpec::new(U64, Flags, "compatible_features"),
    FieldSpec::new(U64, Flags, "autoclear_features"),
    FieldSpec::new(U32, Decimal, "refcount_order"),
    FieldSpec::new(U32, Decimal, "header_length"),
];

const V2_FIELD_COUNT: usize = 13;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeatureGroup {
    Incompatible,
    Compatible,
    Autoclear,
}

/// The qcow2 image header: fixed fields, header extensions and the backing
/// file name.
///
/// Version 2 images get the version 3 fields filled with their implied
/// defaults, so every field is always present.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Header {
    pub magic: u32,
    pub version: u32,
    pub backing_file_offset: u64,
    pub backing_file_size: u32,
    pub cluster_bits: u32,
    pub size: u64,
    pub crypt_method: u32,
    pub l1_size: u32,
    pub l1_table_offset: u64,
    pub refcount_table_offset: u64,
    pub refcount_table_clusters: u32,
    pub nb_snapshots: u32,
    pub snapshot_offset: u64,
    pub incompatible_features: u64,
    pub compatible_features: u64,
    pub autoclear_features: u64,
    pub refcount_order: u32,
    pub header_length: u32,

    /// In wire order.
    pub extensions: Vec<HeaderExtension>,
    pub backing_file: Option<Vec<u8>>,
    /// Bytes between the end of the fixed fields and `header_length`, kept
    /// verbatim (e.g. the compression type of newer images).
    pub header_tail: Vec<u8>,
}

impl Header {
    pub const MAGIC: u32 = 0x5146_49fb; // "QFI\xfb"
    pub const V2_HEADER_LENGTH: u32 = 72;
    pub const V3_HEADER_LENGTH: u32 = 104;
    pub const DEFAULT_REFCOUNT_ORDER: u32 = 4;

    pub const V2_LAYOUT: StructLayout = StructLayout::new(HEADER_FIELDS.split_at(V2_FIELD_COUNT).0);
    pub const V3_EXTRA_LAYOUT: StructLayout =
        StructLayout::new(HEADER_FIELDS.split_at(V2_FIELD_COUNT).1);
    pub const V3_LAYOUT: StructLayout = StructLayout::new(HEADER_FIELDS);

    /// A header for a fresh image with no extensions and no backing file.
    pub fn new(version: u32, cluster_bits: u32, size: u64) -> Self {
        Self {
            magic: Self::MAGIC,
            version,
            cluster_bits,
            size,
            refcount_order: Self::DEFAULT_REFCOUNT_ORDER,
            header_length: if version >= 3 {
                Self::V3_HEADER_LENGTH
            } else {
                Self::V2_HEADER_LENGTH
            },
            ..Default::default()
        }
    }

    pub fn parse<S: Read + Seek>(stream: &mut S) -> Result<Self> {
        stream.seek(SeekFrom::Start(0))?;
        let mut values = Self::V2_LAYOUT.read(stream, "version 2 header")?;
        let version = values[1];
        if version >= 3 {
            values.extend(Self::V3_EXTRA_LAYOUT.read(stream, "version 3 header")?);
        } else {
            values.extend([
                0,
                0,
                0,
                u64::from(Self::DEFAULT_REFCOUNT_ORDER),
                u64::from(Self::V2_HEADER_LENGTH),
            ]);
        }

        let mut header = Self::default();
        header.apply_values(&values)?;
        if header.magic != Self::MAGIC {
            warn!(magic = format_args!("{:#x}", header.magic), "unexpected image magic");
        }

        let cluster_size = header
            .cluster_size()
            .ok_or(Qcow2Error::InvalidClusterBits(header.cluster_bits))?;
        let fixed = header.check_header_length()?;
        header.header_tail = stream.read_vec(
            u64::from(header.header_length) - fixed as u64,
            "header tail",
        )?;

        let bound = header.extension_area_end(cluster_size);
        header.extensions = scan_extensions(
            stream,
            u64::from(header.header_length),
            bound,
            cluster_size,
        )?;

        if header.backing_file_offset != 0 {
            stream.seek(SeekFrom::Start(header.backing_file_offset))?;
            header.backing_file = Some(stream.read_vec(
                u64::from(header.backing_file_size),
                "backing file name",
            )?);
        }

        debug!(
            version = header.version,
            cluster_size,
            header_length = header.header_length,
            extensions = header.extensions.len(),
            backing_file = header.backing_file.is_some(),
            "parsed header"
        );
        Ok(header)
    }

    /// Writes the extensions, backing file name and fixed fields back to
    /// `stream`.
    ///
    /// The extension area and backing file name must fit in the first
    /// cluster. That is checked before anything is written, so a failed
    /// update leaves the stream untouched. On success `backing_file_offset`
    /// and `backing_file_size` describe the newly written name, or are both
    /// zero when there is none.
    pub fn update<S: Write + Seek>(&mut self, stream: &mut S) -> Result<()> {
        let cluster_size = self
            .cluster_size()
            .ok_or(Qcow2Error::InvalidClusterBits(self.cluster_bits))?;
        self.check_header_length()?;

        let area_start = u64::from(self.header_length);
        let mut area = encode_extensions(&self.extensions)?;
        let mut backing = None;
        if let Some(name) = &self.backing_file {
            let size = u32::try_from(name.len()).map_err(|_| Qcow2Error::ValueOutOfRange {
                field: "backing_file_size",
                value: name.len() as u64,
            })?;
            backing = Some((area_start + area.len() as u64, size));
            area.extend_from_slice(name);
        }

        let end = area_start + area.len() as u64;
        if end > cluster_size {
            return Err(Qcow2Error::ExtensionAreaOverflow { end, cluster_size });
        }

        // No name means offset 0, or a later parse would read one back.
        let (offset, size) = backing.unwrap_or((0, 0));
        self.backing_file_offset = offset;
        self.backing_file_size = size;

        let layout = self.fixed_layout();
        let mut prefix = layout.encode(&self.field_values()[..layout.fields().len()])?;
        prefix.extend_from_slice(&self.header_tail);
        prefix.resize(self.header_length as usize, 0);

        stream.seek(SeekFrom::Start(area_start))?;
        stream.write_all(&area)?;
        stream.seek(SeekFrom::Start(0))?;
        stream.write_all(&prefix)?;

        debug!(
            version = self.version,
            extensions = self.extensions.len(),
            end,
            "updated header"
        );
        Ok(())
    }

    /// `None` if `cluster_bits` is too large to shift by.
    pub fn cluster_size(&self) -> Option<u64> {
        1u64.checked_shl(self.cluster_bits)
    }

    /// Extensions never run into the backing file name or past the first
    /// cluster.
    pub fn extension_area_end(&self, cluster_size: u64) -> u64 {
        if self.backing_file_offset != 0 {
            cluster_size.min(self.backing_file_offset)
        } else {
            cluster_size
        }
    }

    /// The fixed fields present on disk for this header's version.
    pub fn fixed_layout(&self) -> StructLayout {
        if self.version >= 3 {
            Self::V3_LAYOUT
        } else {
            Self::V2_LAYOUT
        }
    }

    fn check_header_length(&self) -> Result<usize> {
        let minimum = self.fixed_layout().size();
        if (self.header_length as usize) < minimum {
            return Err(Qcow2Error::InvalidHeaderLength {
                header_length: self.header_length,
                minimum: minimum as u32,
            });
        }
        Ok(minimum)
    }

    /// Values of every fixed field, version 3 fields included, in
    /// [`Header::V3_LAYOUT`] order.
    pub fn field_values(&self) -> Vec<u64> {
        vec![
            u64::from(self.magic),
            u64::from(self.version),
            self.backing_file_offset,
            u64::from(self.backing_file_size),
            u64::from(self.cluster_bits),
            self.size,
            u64::from(self.crypt_method),
            u64::from(self.l1_size),
            self.l1_table_offset,
            self.refcount_table_offset,
            u64::from(self.refcount_table_clusters),
            u64::from(self.nb_snapshots),
            self.snapshot_offset,
            self.incompatible_features,
            self.compatible_features,
            self.autoclear_features,
            u64::from(self.refcount_order),
            u64::from(self.header_length),
        ]
    }

    /// The fields stored on disk for this version, paired with their values.
    pub fn fields(&self) -> Vec<(FieldSpec, u64)> {
        self.fixed_layout()
            .fields()
            .iter()
            .copied()
            .zip(self.field_values())
            .collect()
    }

    fn apply_values(&mut self, values: &[u64]) -> Result<()> {
        let &[
            magic,
            version,
            backing_file_offset,
            backing_file_size,
            cluster_bits,
            size,
            crypt_method,
            l1_size,
            l1_table_offset,
            refcount_table_offset,
            refcount_table_clusters,
            nb_snapshots,
            snapshot_offset,
            incompatible_features,
            compatible_features,
            autoclear_features,
            refcount_order,
            header_length,
        ] = values
        else {
            return Err(Qcow2Error::InvalidLayout("header"));
        };

        self.magic = magic as u32;
        self.version = version as u32;
        self.backing_file_offset = backing_file_offset;
        self.backing_file_size = backing_file_size as u32;
        self.cluster_bits = cluster_bits as u32;
        self.size = size;
        self.crypt_method = crypt_method as u32;
        self.l1_size = l1_size as u32;
        self.l1_table_offset = l1_table_offset;
        self.refcount_table_offset = refcount_table_offset;
        self.refcount_table_clusters = refcount_table_clusters as u32;
        self.nb_snapshots = nb_snapshots as u32;
        self.snapshot_offset = snapshot_offset;
        self.incompatible_features = incompatible_features;
        self.compatible_features = compatible_features;
        self.autoclear_features = autoclear_features;
        self.refcount_order = refcount_order as u32;
        self.header_length = header_length as u32;
        Ok(())
    }

    /// Sets a fixed field by its on-disk name.
    pub fn set_field(&mut self, name: &str, value: u64) -> Result<()> {
        let index = Self::V3_LAYOUT
            .index_of(name)
            .ok_or_else(|| Qcow2Error::UnknownField(name.to_owned()))?;
        let field = HEADER_FIELDS[index];
        if value > field.width.max_value() {
            return Err(Qcow2Error::ValueOutOfRange {
                field: field.name,
                value,
            });
        }

        let mut values = self.field_values();
        values[index] = value;
        self.apply_values(&values)
    }

    pub fn set_feature_bit(&mut self, group: FeatureGroup, bit: u32) -> Result<()> {
        let (field, features) = match group {
            FeatureGroup::Incompatible => ("incompatible_features", &mut self.incompatible_features),
            FeatureGroup::Compatible => ("compatible_features", &mut self.compatible_features),
            FeatureGroup::Autoclear => ("autoclear_features", &mut self.autoclear_features),
        };
        let mask = 1u64.checked_shl(bit).ok_or(Qcow2Error::ValueOutOfRange {
            field,
            value: u64::from(bit),
        })?;
        *features |= mask;
        Ok(())
    }

    pub fn add_extension(&mut self, extension: HeaderExtension) {
        self.extensions.push(extension);
    }

    /// Removes every extension with `magic`, returning how many were dropped.
    pub fn remove_extensions(&mut self, magic: u32) -> usize {
        let before = self.extensions.len();
        self.extensions.retain(|ext| ext.magic() != magic);
        before - self.extensions.len()
    }
}
