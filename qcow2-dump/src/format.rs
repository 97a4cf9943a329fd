use std::fmt::Write;

use qcow2::field::{DisplayHint, FieldSpec};
use qcow2::{BitmapDirEntry, BitmapExtension, BitmapFlags, ExtensionKind, Header, HeaderExtension};

pub fn value(hint: DisplayHint, value: u64) -> String {
    match hint {
        DisplayHint::Decimal => value.to_string(),
        DisplayHint::Hex => format!("{value:#x}"),
        DisplayHint::Flags => format!("{:?}", set_bits(value)),
        DisplayHint::BitmapFlags => {
            let names: Vec<String> = set_bits(value)
                .into_iter()
                .map(|bit| {
                    let flag = 1u64 << bit;
                    if flag == u64::from(BitmapFlags::IN_USE.bits()) {
                        "in-use".to_owned()
                    } else if flag == u64::from(BitmapFlags::AUTO.bits()) {
                        "auto".to_owned()
                    } else {
                        format!("{flag:#x}")
                    }
                })
                .collect();
            format!("{value:#x} ({names:?})")
        }
        DisplayHint::ExtensionMagic => {
            let name = u32::try_from(value)
                .ok()
                .and_then(|magic| ExtensionKind::from_magic(magic).name())
                .unwrap_or("<unknown>");
            format!("{value:#x} ({name})")
        }
    }
}

fn set_bits(value: u64) -> Vec<u32> {
    (0..64).filter(|bit| value & (1u64 << bit) != 0).collect()
}

fn fields(out: &mut String, fields: impl IntoIterator<Item = (FieldSpec, u64)>) {
    for (spec, v) in fields {
        let _ = writeln!(out, "{:<25} {}", spec.name, value(spec.display, v));
    }
}

/// Quoted if the payload is printable ASCII, `<binary>` otherwise.
pub fn payload(data: &[u8]) -> String {
    let printable = data
        .iter()
        .all(|b| b.is_ascii_graphic() || b" \t\n\r\x0b\x0c".contains(b));
    if printable {
        format!("'{}'", String::from_utf8_lossy(data))
    } else {
        "<binary>".to_owned()
    }
}

pub fn header(header: &Header) -> String {
    let mut out = String::new();
    fields(&mut out, header.fields());
    if let Some(name) = &header.backing_file {
        let _ = writeln!(out, "{:<25} {}", "backing_file", payload(name));
    }
    out
}

pub fn extensions(header: &Header) -> String {
    let mut out = String::new();
    for ext in &header.extensions {
        out.push_str("Header extension:\n");
        extension(&mut out, ext);
        out.push('\n');
    }
    out
}

fn extension(out: &mut String, ext: &HeaderExtension) {
    fields(
        out,
        HeaderExtension::LAYOUT
            .fields()
            .iter()
            .copied()
            .zip([u64::from(ext.magic()), u64::from(ext.length())]),
    );
    match ext.bitmaps() {
        Some(bitmaps) => bitmap_extension(out, bitmaps),
        None => {
            let _ = writeln!(out, "{:<25} {}", "data", payload(ext.payload()));
        }
    }
}

fn bitmap_extension(out: &mut String, ext: &BitmapExtension) {
    fields(
        out,
        BitmapExtension::LAYOUT.fields().iter().copied().zip([
            u64::from(ext.nb_bitmaps),
            u64::from(ext.reserved32),
            ext.bitmap_directory_size,
            ext.bitmap_directory_offset,
        ]),
    );
    for entry in &ext.directory {
        out.push('\n');
        bitmap_dir_entry(out, entry);
    }
}

fn bitmap_dir_entry(out: &mut String, entry: &BitmapDirEntry) {
    let _ = writeln!(out, "{:<25} {}", "Bitmap name", entry.name_lossy());
    fields(
        out,
        BitmapDirEntry::LAYOUT.fields().iter().copied().zip([
            entry.bitmap_table_offset,
            u64::from(entry.bitmap_table_size),
            u64::from(entry.flags),
            u64::from(entry.bitmap_type),
            u64::from(entry.granularity_bits),
            u64::from(entry.name_size),
            u64::from(entry.extra_data_size),
        ]),
    );

    let size = entry.table.cluster_size();
    let _ = writeln!(out, "{:<14} {:<15} {:<24} size", "Bitmap table", "type", "offset");
    for (i, slot) in entry.table.entries().iter().enumerate() {
        let _ = writeln!(
            out,
            "{:<14} {:<15} {:<24} {}",
            i,
            slot.kind().to_string(),
            slot.offset(),
            size
        );
    }
}
