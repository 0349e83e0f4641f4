//! Index Node for file or directory

use core::fmt;

use deku::bitvec::{BitVec, Msb0};
use deku::prelude::*;

use crate::data::DataSize;
use crate::dir::DirectoryIndex;
use crate::metadata::MetadataWriter;

/// Sentinel for "this inode has no extended attributes"
pub const XATTR_NOT_SET: u32 = 0xffff_ffff;

/// Sentinel for "this file has no tail fragment"
pub const FRAG_NOT_SET: u32 = 0xffff_ffff;

#[derive(Debug, DekuRead, DekuWrite, Clone, PartialEq, Eq)]
#[deku(ctx = "block_size: u32, block_log: u16")]
#[deku(endian = "little")]
pub struct Inode {
    pub id: InodeId,
    pub header: InodeHeader,
    #[deku(ctx = "*id, block_size, block_log")]
    pub inner: InodeInner,
}

impl Inode {
    pub fn new(id: InodeId, header: InodeHeader, inner: InodeInner) -> Self {
        Inode { id, header, inner }
    }

    /// Write to `m_writer`, returning the inode reference
    /// `(metadata block start << 16) | offset` pointing at it
    pub(crate) fn to_writer(
        &self,
        m_writer: &mut MetadataWriter,
        block_size: u32,
        block_log: u16,
    ) -> Result<u64, crate::error::PackError> {
        use std::io::Write;

        let mut bytes = BitVec::<u8, Msb0>::new();
        self.write(&mut bytes, (block_size, block_log))?;
        let (start, offset) = m_writer.position();
        m_writer
            .write_all(bytes.as_raw_slice())
            .map_err(|e| crate::error::PackError::Internal(e.to_string()))?;

        Ok(((start as u64) << 16) | ((offset as u64) & 0xffff))
    }
}

#[derive(Debug, DekuRead, DekuWrite, Clone, Copy, PartialEq, Eq)]
#[deku(type = "u16")]
#[deku(endian = "endian", ctx = "endian: deku::ctx::Endian")]
#[rustfmt::skip]
pub enum InodeId {
    BasicDirectory       = 1,
    BasicFile            = 2,
    BasicSymlink         = 3,
    BasicBlockDevice     = 4,
    BasicCharacterDevice = 5,
    BasicNamedPipe       = 6,
    BasicSocket          = 7,
    ExtendedDirectory    = 8,
    ExtendedFile         = 9,
    ExtendedSymlink      = 10,
    ExtendedBlockDevice  = 11,
    ExtendedCharacterDevice = 12,
    ExtendedNamedPipe    = 13,
    ExtendedSocket       = 14,
}

impl InodeId {
    /// Directory entries always store the basic type
    pub(crate) fn into_base_type(self) -> Self {
        match self {
            Self::ExtendedDirectory => InodeId::BasicDirectory,
            Self::ExtendedFile => InodeId::BasicFile,
            Self::ExtendedSymlink => InodeId::BasicSymlink,
            Self::ExtendedBlockDevice => InodeId::BasicBlockDevice,
            Self::ExtendedCharacterDevice => InodeId::BasicCharacterDevice,
            Self::ExtendedNamedPipe => InodeId::BasicNamedPipe,
            Self::ExtendedSocket => InodeId::BasicSocket,
            _ => self,
        }
    }
}

#[derive(Debug, DekuRead, DekuWrite, Clone, PartialEq, Eq)]
#[deku(
    ctx = "endian: deku::ctx::Endian, id: InodeId, block_size: u32, block_log: u16"
)]
#[deku(endian = "endian")]
#[deku(id = "id")]
pub enum InodeInner {
    #[deku(id = "InodeId::BasicDirectory")]
    BasicDirectory(BasicDirectory),

    #[deku(id = "InodeId::BasicFile")]
    BasicFile(#[deku(ctx = "block_size, block_log")] BasicFile),

    #[deku(id = "InodeId::BasicSymlink")]
    BasicSymlink(BasicSymlink),

    #[deku(id = "InodeId::BasicBlockDevice")]
    BasicBlockDevice(BasicDeviceSpecialFile),

    #[deku(id = "InodeId::BasicCharacterDevice")]
    BasicCharacterDevice(BasicDeviceSpecialFile),

    #[deku(id = "InodeId::BasicNamedPipe")]
    BasicNamedPipe(BasicIpc),

    #[deku(id = "InodeId::BasicSocket")]
    BasicSocket(BasicIpc),

    #[deku(id = "InodeId::ExtendedDirectory")]
    ExtendedDirectory(ExtendedDirectory),

    #[deku(id = "InodeId::ExtendedFile")]
    ExtendedFile(#[deku(ctx = "block_size, block_log")] ExtendedFile),

    #[deku(id = "InodeId::ExtendedSymlink")]
    ExtendedSymlink(ExtendedSymlink),

    #[deku(id = "InodeId::ExtendedBlockDevice")]
    ExtendedBlockDevice(ExtendedDeviceSpecialFile),

    #[deku(id = "InodeId::ExtendedCharacterDevice")]
    ExtendedCharacterDevice(ExtendedDeviceSpecialFile),

    #[deku(id = "InodeId::ExtendedNamedPipe")]
    ExtendedNamedPipe(ExtendedIpc),

    #[deku(id = "InodeId::ExtendedSocket")]
    ExtendedSocket(ExtendedIpc),
}

#[derive(Debug, DekuRead, DekuWrite, Clone, Copy, PartialEq, Eq, Default)]
#[deku(endian = "endian", ctx = "endian: deku::ctx::Endian")]
pub struct InodeHeader {
    pub permissions: u16,
    /// index into id table
    pub uid: u16,
    /// index into id table
    pub gid: u16,
    pub mtime: u32,
    pub inode_number: u32,
}

#[derive(Debug, DekuRead, DekuWrite, Clone, PartialEq, Eq)]
#[deku(endian = "endian", ctx = "endian: deku::ctx::Endian")]
pub struct BasicDirectory {
    pub block_index: u32,
    pub link_count: u32,
    pub file_size: u16,
    pub block_offset: u16,
    pub parent_inode: u32,
}

#[derive(Debug, DekuRead, DekuWrite, Clone, PartialEq, Eq)]
#[deku(endian = "endian", ctx = "endian: deku::ctx::Endian")]
pub struct ExtendedDirectory {
    pub link_count: u32,
    pub file_size: u32,
    pub block_index: u32,
    pub parent_inode: u32,
    #[deku(assert = "*index_count < 256")]
    pub index_count: u16,
    pub block_offset: u16,
    pub xattr_index: u32,
    #[deku(count = "*index_count")]
    pub dir_index: Vec<DirectoryIndex>,
}

#[derive(Debug, DekuRead, DekuWrite, Clone, PartialEq, Eq)]
#[deku(
    endian = "endian",
    ctx = "endian: deku::ctx::Endian, block_size: u32, block_log: u16"
)]
pub struct BasicFile {
    pub blocks_start: u32,
    pub frag_index: u32,
    pub block_offset: u32,
    pub file_size: u32,
    #[deku(count = "block_count(block_size, block_log, *frag_index, *file_size as u64)")]
    pub block_sizes: Vec<DataSize>,
}

#[derive(Debug, DekuRead, DekuWrite, Clone, PartialEq, Eq)]
#[deku(
    endian = "endian",
    ctx = "endian: deku::ctx::Endian, block_size: u32, block_log: u16"
)]
pub struct ExtendedFile {
    pub blocks_start: u64,
    pub file_size: u64,
    /// Number of bytes saved by omitting hole blocks
    pub sparse: u64,
    pub link_count: u32,
    pub frag_index: u32,
    pub block_offset: u32,
    pub xattr_index: u32,
    #[deku(count = "block_count(block_size, block_log, *frag_index, *file_size)")]
    pub block_sizes: Vec<DataSize>,
}

impl From<&ExtendedFile> for BasicFile {
    fn from(ex_file: &ExtendedFile) -> Self {
        Self {
            blocks_start: ex_file.blocks_start as u32,
            frag_index: ex_file.frag_index,
            block_offset: ex_file.block_offset,
            file_size: ex_file.file_size as u32,
            block_sizes: ex_file.block_sizes.clone(),
        }
    }
}

fn block_count(block_size: u32, block_log: u16, fragment: u32, file_size: u64) -> u64 {
    if fragment == FRAG_NOT_SET {
        (file_size + u64::from(block_size) - 1) >> block_log
    } else {
        file_size >> block_log
    }
}

#[derive(DekuRead, DekuWrite, Clone, PartialEq, Eq)]
#[deku(endian = "endian", ctx = "endian: deku::ctx::Endian")]
pub struct BasicSymlink {
    pub link_count: u32,
    #[deku(assert = "*target_size < 65536")]
    pub target_size: u32,
    #[deku(count = "target_size")]
    pub target_path: Vec<u8>,
}

impl fmt::Debug for BasicSymlink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BasicSymlink")
            .field("link_count", &self.link_count)
            .field("target_size", &self.target_size)
            .field("target_path", &String::from_utf8_lossy(&self.target_path))
            .finish()
    }
}

#[derive(DekuRead, DekuWrite, Clone, PartialEq, Eq)]
#[deku(endian = "endian", ctx = "endian: deku::ctx::Endian")]
pub struct ExtendedSymlink {
    pub link_count: u32,
    #[deku(assert = "*target_size < 65536")]
    pub target_size: u32,
    #[deku(count = "target_size")]
    pub target_path: Vec<u8>,
    pub xattr_index: u32,
}

impl fmt::Debug for ExtendedSymlink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExtendedSymlink")
            .field("link_count", &self.link_count)
            .field("target_size", &self.target_size)
            .field("target_path", &String::from_utf8_lossy(&self.target_path))
            .field("xattr_index", &self.xattr_index)
            .finish()
    }
}

#[derive(Debug, DekuRead, DekuWrite, Clone, PartialEq, Eq)]
#[deku(endian = "endian", ctx = "endian: deku::ctx::Endian")]
pub struct BasicDeviceSpecialFile {
    pub link_count: u32,
    pub device_number: u32,
}

#[derive(Debug, DekuRead, DekuWrite, Clone, PartialEq, Eq)]
#[deku(endian = "endian", ctx = "endian: deku::ctx::Endian")]
pub struct ExtendedDeviceSpecialFile {
    pub link_count: u32,
    pub device_number: u32,
    pub xattr_index: u32,
}

/// FIFOs and sockets carry no payload beyond the link count
#[derive(Debug, DekuRead, DekuWrite, Clone, PartialEq, Eq)]
#[deku(endian = "endian", ctx = "endian: deku::ctx::Endian")]
pub struct BasicIpc {
    pub link_count: u32,
}

#[derive(Debug, DekuRead, DekuWrite, Clone, PartialEq, Eq)]
#[deku(endian = "endian", ctx = "endian: deku::ctx::Endian")]
pub struct ExtendedIpc {
    pub link_count: u32,
    pub xattr_index: u32,
}

#[cfg(test)]
mod tests {
    use deku::bitvec::BitView;

    use super::*;

    fn round_trip(inode: Inode) {
        let mut bv = BitVec::<u8, Msb0>::new();
        inode.write(&mut bv, (0x20000, 17)).unwrap();
        let bits = bv.as_raw_slice().view_bits::<Msb0>();
        let (rest, back) = Inode::read(bits, (0x20000, 17)).unwrap();
        assert!(rest.is_empty());
        assert_eq!(back, inode);
    }

    #[test]
    fn test_file_inode_round_trip() {
        round_trip(Inode::new(
            InodeId::BasicFile,
            InodeHeader { permissions: 0o644, uid: 0, gid: 0, mtime: 5, inode_number: 1 },
            InodeInner::BasicFile(BasicFile {
                blocks_start: 96,
                frag_index: FRAG_NOT_SET,
                block_offset: 0,
                file_size: 0x20000 + 10,
                block_sizes: vec![DataSize::new_compressed(100), DataSize::new_uncompressed(10)],
            }),
        ));
    }

    #[test]
    fn test_fragment_only_file_has_no_blocks() {
        round_trip(Inode::new(
            InodeId::BasicFile,
            InodeHeader { permissions: 0o644, uid: 0, gid: 0, mtime: 5, inode_number: 1 },
            InodeInner::BasicFile(BasicFile {
                blocks_start: 0,
                frag_index: 0,
                block_offset: 12,
                file_size: 100,
                block_sizes: vec![],
            }),
        ));
    }

    #[test]
    fn test_extended_inodes_round_trip() {
        round_trip(Inode::new(
            InodeId::ExtendedFile,
            InodeHeader { permissions: 0o644, uid: 1, gid: 1, mtime: 5, inode_number: 3 },
            InodeInner::ExtendedFile(ExtendedFile {
                blocks_start: 96,
                file_size: 0x40000,
                sparse: 0x20000,
                link_count: 1,
                frag_index: FRAG_NOT_SET,
                block_offset: 0,
                xattr_index: 0,
                block_sizes: vec![
                    DataSize::new_compressed(55),
                    DataSize::new_hole(),
                ],
            }),
        ));
        round_trip(Inode::new(
            InodeId::ExtendedSymlink,
            InodeHeader { permissions: 0o777, uid: 0, gid: 0, mtime: 5, inode_number: 4 },
            InodeInner::ExtendedSymlink(ExtendedSymlink {
                link_count: 1,
                target_size: 6,
                target_path: b"target".to_vec(),
                xattr_index: 1,
            }),
        ));
        round_trip(Inode::new(
            InodeId::BasicSocket,
            InodeHeader { permissions: 0o600, uid: 0, gid: 0, mtime: 5, inode_number: 5 },
            InodeInner::BasicSocket(BasicIpc { link_count: 1 }),
        ));
    }
}
