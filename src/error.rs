use thiserror::Error;

#[derive(Error, Debug)]
pub enum Qcow2Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Truncated {what}: expected {expected} bytes, got {actual}")]
    Truncated {
        what: &'static str,
        expected: u64,
        actual: u64,
    },
    #[error(
        "Header extensions and backing file name end at {end:#x}, past the first cluster ({cluster_size:#x} bytes)"
    )]
    ExtensionAreaOverflow { end: u64, cluster_size: u64 },
    #[error("Invalid field layout: {0}")]
    InvalidLayout(&'static str),
    #[error("Value {value:#x} does not fit in field {field}")]
    ValueOutOfRange { field: &'static str, value: u64 },
    #[error("Unknown header field: {0}")]
    UnknownField(String),
    #[error("Invalid cluster_bits: {0}")]
    InvalidClusterBits(u32),
    #[error("Invalid header_length {header_length}, fixed header needs at least {minimum} bytes")]
    InvalidHeaderLength { header_length: u32, minimum: u32 },
}

pub type Result<T> = std::result::Result<T, Qcow2Error>;
