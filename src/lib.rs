//! Streaming tar to SquashFS 4.0 packer.
//!
//! Reads an uncompressed tar archive from a forward-only stream, builds an
//! in-memory filesystem tree, compresses file data on a worker pool and
//! serializes a little-endian SquashFS 4.0 image to a positional sink.

pub mod compressor;
mod data;
pub mod dir;
pub mod error;
mod export;
mod fragment;
mod id;
pub mod inode;
pub mod metadata;
mod packer;
mod serializer;
mod sink;
pub mod superblock;
pub mod tar;
mod tree;
pub mod xattr;

pub use crate::compressor::{CompressionOptions, Compressor, FilesystemCompressor};
pub use crate::data::DataSize;
pub use crate::dir::{Dir, DirEntry};
pub use crate::error::PackError;
pub use crate::export::Export;
pub use crate::fragment::Fragment;
pub use crate::id::Id;
pub use crate::inode::{Inode, InodeHeader, InodeId, InodeInner};
pub use crate::metadata::METADATA_MAXSIZE;
pub use crate::packer::{pack, Config, Defaults};
pub use crate::sink::{MemorySink, Sink};
pub use crate::superblock::{Flags, SuperBlock};
pub use crate::xattr::{XattrId, XattrTableHeader};

/// 128KiB
pub const DEFAULT_BLOCK_SIZE: u32 = 0x20000;

/// 4KiB
pub const DEFAULT_DEV_BLOCK_SIZE: u32 = 0x1000;

/// 1MiB
pub const MAX_BLOCK_SIZE: u32 = 1024 * 1024;

/// 4KiB
pub const MIN_BLOCK_SIZE: u32 = 4096;

/// Smallest device block size accepted for tail padding
pub const MIN_DEV_BLOCK_SIZE: u32 = 1024;
