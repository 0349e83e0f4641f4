//! Errors

use std::io;

use thiserror::Error;

/// Errors generated while packing a tar stream into a SquashFS image
#[derive(Error, Debug)]
pub enum PackError {
    #[error("reading tar stream: {0}")]
    InputRead(io::Error),

    #[error("tar format: {0}")]
    TarFormat(String),

    #[error("unsupported xattr key: {0}")]
    UnsupportedXattr(String),

    #[error("writing image: {0}")]
    OutputIo(io::Error),

    #[error("initializing compressor: {0}")]
    CompressorInit(String),

    #[error("compressor: {0}")]
    CompressorRuntime(String),

    #[error("serializing image structures: {0:?}")]
    Serialize(#[from] deku::DekuError),

    #[error("invariant violated: {0}")]
    Internal(String),

    #[error("resources exhausted: {0}")]
    ResourceExhaustion(String),
}

impl PackError {
    /// True for errors that default (non-strict) mode recovers from by
    /// skipping the offending tar entry.
    pub fn is_skippable(&self) -> bool {
        matches!(self, PackError::TarFormat(_) | PackError::UnsupportedXattr(_))
    }
}

impl From<PackError> for io::Error {
    fn from(value: PackError) -> Self {
        use PackError::*;
        match value {
            InputRead(io) | OutputIo(io) => io,
            Serialize(e) => Self::new(io::ErrorKind::InvalidData, e.to_string()),
            e @ (TarFormat(_) | UnsupportedXattr(_)) => {
                Self::new(io::ErrorKind::InvalidData, e.to_string())
            }
            e @ (CompressorInit(_) | CompressorRuntime(_)) => {
                Self::new(io::ErrorKind::Unsupported, e.to_string())
            }
            e @ (Internal(_) | ResourceExhaustion(_)) => {
                Self::new(io::ErrorKind::Other, e.to_string())
            }
        }
    }
}
