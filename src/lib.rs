//! Reading and rewriting qcow2 image metadata: the fixed header, the header
//! extension chain and the persistent dirty bitmap directory.
//!
//! ```no_run
//! # fn main() -> qcow2::Result<()> {
//! let mut file = std::fs::OpenOptions::new()
//!     .read(true)
//!     .write(true)
//!     .open("disk.qcow2")?;
//! let mut header = qcow2::parse(&mut file)?;
//! header.add_extension(qcow2::HeaderExtension::create(0x12345678, b"note".to_vec())?);
//! header.update(&mut file)?;
//! # Ok(())
//! # }
//! ```

use std::io::{Read, Seek};

pub mod bitmap;
pub mod error;
pub mod extension;
pub mod field;
pub mod header;
mod util;

pub use bitmap::{
    BitmapDirEntry, BitmapExtension, BitmapFlags, BitmapTable, BitmapTableEntry,
    BitmapTableEntryKind,
};
pub use error::{Qcow2Error, Result};
pub use extension::{ExtensionContent, ExtensionKind, HeaderExtension};
pub use header::{FeatureGroup, Header};
pub use util::align8;

/// Parses the header of the image in `stream`.
pub fn parse<S: Read + Seek>(stream: &mut S) -> Result<Header> {
    Header::parse(stream)
}
