//! Image serialization
//!
//! Bottom-up walk of the sorted tree emitting inodes and directory runs into
//! their metadata streams, followed by the fragment, export, id and xattr
//! tables and the finalized superblock.

use std::io::Write;

use deku::bitvec::BitVec;
use deku::prelude::*;
use tracing::{info, trace};

use crate::compressor::{CompressionOptions, FilesystemCompressor};
use crate::data::DataResults;
use crate::dir::{Dir, DirEntry};
use crate::error::PackError;
use crate::export::Export;
use crate::fragment;
use crate::id;
use crate::id::IdTable;
use crate::inode::{
    BasicDeviceSpecialFile, BasicDirectory, BasicFile, BasicIpc, BasicSymlink,
    ExtendedDeviceSpecialFile, ExtendedDirectory, ExtendedFile, ExtendedIpc, ExtendedSymlink,
    Inode, InodeHeader, InodeId, InodeInner, FRAG_NOT_SET, XATTR_NOT_SET,
};
use crate::metadata::{self, MetadataWriter, METADATA_MAXSIZE};
use crate::sink::Sink;
use crate::superblock::{Flags, SuperBlock};
use crate::tree::{FsTree, NodePayload, TreeNode};
use crate::xattr::{XattrId, XattrStore, XattrTableHeader};

/// One directory entry in the making: where the child's inode landed
#[derive(Debug, Clone)]
struct Entry {
    start: u32,
    offset: u16,
    inode: u32,
    t: InodeId,
    name: Vec<u8>,
}

impl Entry {
    fn create_dir(creating_dir: &Vec<&Entry>, start: u32, lowest_inode: u32) -> Dir {
        let mut dir = Dir::new(lowest_inode);
        dir.start = start;
        for e in creating_dir {
            let new_entry = DirEntry {
                offset: e.offset,
                inode_offset: (e.inode - lowest_inode) as i16,
                t: e.t.into_base_type(),
                name_size: e.name.len() as u16 - 1,
                name: e.name.clone(),
            };
            dir.push(new_entry);
        }
        dir
    }

    /// Group sorted entries into runs sharing one header: same inode metadata
    /// block, at most 256 entries, inode deltas that fit an i16
    fn into_dir(entries: Vec<Entry>) -> Vec<Dir> {
        let mut dirs = vec![];
        let mut creating_dir: Vec<&Entry> = vec![];
        let mut lowest_inode = u32::MAX;
        let mut highest_inode = 0u32;
        let mut iter = entries.iter().peekable();
        let mut creating_start = match iter.peek() {
            Some(entry) => entry.start,
            None => return vec![],
        };

        while let Some(e) = iter.next() {
            lowest_inode = lowest_inode.min(e.inode);
            highest_inode = highest_inode.max(e.inode);
            creating_dir.push(e);

            if let Some(next) = iter.peek() {
                // if the next entry would stretch the run's inode deltas past an i16
                let wide_delta = next.inode.max(highest_inode) - next.inode.min(lowest_inode)
                    > i16::MAX as u32;
                // make sure entries have the correct start and amount of directories
                if next.start != creating_start || creating_dir.len() >= 256 || wide_delta {
                    dirs.push(Self::create_dir(&creating_dir, creating_start, lowest_inode));
                    creating_dir = vec![];
                    creating_start = next.start;
                    lowest_inode = u32::MAX;
                    highest_inode = 0;
                }
            } else {
                dirs.push(Self::create_dir(&creating_dir, creating_start, lowest_inode));
            }
        }

        dirs
    }
}

pub(crate) struct ImageConfig {
    pub block_size: u32,
    pub dev_block_size: u32,
    pub mod_time: u32,
    pub exportable: bool,
}

pub(crate) struct Serializer<'a> {
    sink: &'a dyn Sink,
    tree: &'a FsTree,
    data: &'a DataResults,
    store: &'a XattrStore,
    compressor: FilesystemCompressor,
    config: ImageConfig,
    inode_writer: MetadataWriter,
    dir_writer: MetadataWriter,
    id_table: IdTable,
    /// inode reference of every inode in number order, for the export table
    inode_refs: Vec<u64>,
    block_log: u16,
}

impl<'a> Serializer<'a> {
    pub fn new(
        sink: &'a dyn Sink,
        tree: &'a FsTree,
        data: &'a DataResults,
        store: &'a XattrStore,
        compressor: FilesystemCompressor,
        config: ImageConfig,
    ) -> Self {
        let block_log = config.block_size.trailing_zeros() as u16;
        Self {
            sink,
            tree,
            data,
            store,
            compressor,
            inode_writer: MetadataWriter::new(compressor, config.block_size),
            dir_writer: MetadataWriter::new(compressor, config.block_size),
            id_table: IdTable::new(),
            inode_refs: vec![],
            config,
            block_log,
        }
    }

    /// Lay out everything past the data region and finalize the superblock
    pub fn write(mut self, inode_table: &[usize]) -> Result<SuperBlock, PackError> {
        let mut superblock = SuperBlock::new(self.compressor.id, self.config.block_size);
        superblock.mod_time = self.config.mod_time;
        superblock.flags |= Flags::DataHasBeenDeduplicated as u16;

        // intern every uid/gid up front so inodes can store table indices
        let tree = self.tree;
        for node in &tree.nodes {
            self.id_table.lookup_add(node.header.uid)?;
            self.id_table.lookup_add(node.header.gid)?;
        }

        let mut offset = self.data.end;

        // compressor options follow the data region
        if let Some(options) = self.compressor.options {
            superblock.flags |= Flags::CompressorOptionsArePresent as u16;
            self.write_compressor_options(options, &mut offset)?;
        }

        info!("Creating Inodes and Dirs");
        let root = self.write_tree(0)?;
        superblock.root_inode = (u64::from(root.start) << 16) | u64::from(root.offset);
        superblock.inode_count = inode_table.len() as u32 - 2;

        info!("Writing Inodes");
        superblock.inode_table = offset;
        let blob = self.inode_writer.finish()?;
        self.write_all(&mut offset, &blob)?;

        info!("Writing Dirs");
        superblock.dir_table = offset;
        let blob = self.dir_writer.finish()?;
        self.write_all(&mut offset, &blob)?;

        info!("Writing Frag Lookup Table");
        if self.data.fragment_table.is_empty() {
            superblock.flags |= Flags::FragmentsAreNotUsed as u16;
        } else {
            let elements = self
                .data
                .fragment_table
                .iter()
                .map(|fragment| fragment.to_bytes())
                .collect::<Result<Vec<_>, _>>()?;
            let table_offset =
                self.write_lookup_table(&mut offset, &elements, fragment::SIZE)?;
            superblock.frag_table = table_offset;
            superblock.frag_count = self.data.fragment_table.len() as u32;
        }

        if self.config.exportable {
            info!("Writing Export Lookup Table");
            superblock.flags |= Flags::NFSExportTableExists as u16;
            let elements = self
                .inode_refs
                .iter()
                .map(|num| Export { num: *num }.to_bytes())
                .collect::<Result<Vec<_>, _>>()?;
            let table_offset =
                self.write_lookup_table(&mut offset, &elements, crate::export::SIZE)?;
            superblock.export_table = table_offset;
        }

        info!("Writing Id Lookup Table");
        let elements = self
            .id_table
            .ids
            .iter()
            .map(|id| id.to_bytes())
            .collect::<Result<Vec<_>, _>>()?;
        let table_offset = self.write_lookup_table(&mut offset, &elements, id::SIZE)?;
        superblock.id_table = table_offset;
        superblock.id_count = self.id_table.len() as u16;

        if self.store.is_empty() {
            superblock.flags |= Flags::NoXattrsInArchive as u16;
        } else {
            info!("Writing Xattr Tables");
            self.write_xattr_table(&mut offset, &mut superblock)?;
        }

        info!("Finalize Superblock and End Bytes");
        self.finalize(offset, &mut superblock)?;
        Ok(superblock)
    }

    fn write_all(&self, offset: &mut u64, bytes: &[u8]) -> Result<(), PackError> {
        self.sink.write_at(*offset, bytes).map_err(PackError::OutputIo)?;
        *offset += bytes.len() as u64;
        Ok(())
    }

    fn write_compressor_options(
        &mut self,
        options: CompressionOptions,
        offset: &mut u64,
    ) -> Result<(), PackError> {
        let mut bv = BitVec::new();
        options.write(&mut bv, self.compressor.id)?;
        let mut writer = MetadataWriter::new(self.compressor, self.config.block_size);
        writer
            .write_all(bv.as_raw_slice())
            .map_err(|e| PackError::Internal(e.to_string()))?;
        let blob = writer.finish()?;
        self.write_all(offset, &blob)
    }

    /// Post-order walk: children's inodes and the directory listing land
    /// before the directory's own inode, which the returned entry points at
    fn write_tree(&mut self, index: usize) -> Result<Entry, PackError> {
        let tree = self.tree;
        let node = &tree.nodes[index];
        if !node.is_dir() {
            return self.write_leaf(node);
        }

        let mut entries = Vec::with_capacity(node.children().len());
        for child in node.children() {
            entries.push(self.write_tree(*child)?);
        }

        // write dir
        let (block_index, block_offset) = self.dir_writer.position();
        trace!("WRITING DIR: {block_offset:#02x?}");
        let mut total_size: usize = 3;
        for dir in Entry::into_dir(entries) {
            let bytes = dir.to_bytes()?;
            total_size += bytes.len();
            self.dir_writer
                .write_all(&bytes)
                .map_err(|e| PackError::Internal(e.to_string()))?;
        }

        let link_count = 2 + node.children().len() as u32;
        let parent_inode = if index == 0 {
            // the root's parent is by convention one past the last inode
            node.inode_num + 1
        } else {
            tree.nodes[node.parent].inode_num
        };

        let header = self.inode_header(node)?;
        let use_extended = node.xattr_idx != XATTR_NOT_SET || total_size > u16::MAX as usize;
        let inode = if use_extended {
            Inode::new(
                InodeId::ExtendedDirectory,
                header,
                InodeInner::ExtendedDirectory(ExtendedDirectory {
                    link_count,
                    file_size: total_size as u32,
                    block_index,
                    parent_inode,
                    index_count: 0,
                    block_offset,
                    xattr_index: node.xattr_idx,
                    dir_index: vec![],
                }),
            )
        } else {
            Inode::new(
                InodeId::BasicDirectory,
                header,
                InodeInner::BasicDirectory(BasicDirectory {
                    block_index,
                    link_count,
                    file_size: total_size as u16,
                    block_offset,
                    parent_inode,
                }),
            )
        };

        self.emit_inode(node, inode)
    }

    fn write_leaf(&mut self, node: &TreeNode) -> Result<Entry, PackError> {
        let header = self.inode_header(node)?;
        let has_xattr = node.xattr_idx != XATTR_NOT_SET;

        let inode = match &node.payload {
            NodePayload::File(info) => {
                let add = info.add.as_ref().ok_or_else(|| {
                    PackError::Internal("file node without data placement".to_string())
                })?;
                let (blocks_start, frag_index, block_offset, block_sizes) =
                    crate::data::file_inode_fields(add, self.data);

                let needs_extended = has_xattr
                    || info.size > u64::from(u32::MAX)
                    || blocks_start > u64::from(u32::MAX);
                if needs_extended {
                    let sparse = block_sizes.iter().filter(|size| size.is_hole()).count()
                        as u64
                        * u64::from(self.config.block_size);
                    Inode::new(
                        InodeId::ExtendedFile,
                        header,
                        InodeInner::ExtendedFile(ExtendedFile {
                            blocks_start,
                            file_size: info.size,
                            sparse,
                            link_count: 1,
                            frag_index,
                            block_offset,
                            xattr_index: node.xattr_idx,
                            block_sizes,
                        }),
                    )
                } else {
                    Inode::new(
                        InodeId::BasicFile,
                        header,
                        InodeInner::BasicFile(BasicFile {
                            blocks_start: blocks_start as u32,
                            frag_index,
                            block_offset,
                            file_size: info.size as u32,
                            block_sizes,
                        }),
                    )
                }
            }
            NodePayload::Symlink(target) => {
                if has_xattr {
                    Inode::new(
                        InodeId::ExtendedSymlink,
                        header,
                        InodeInner::ExtendedSymlink(ExtendedSymlink {
                            link_count: 1,
                            target_size: target.len() as u32,
                            target_path: target.clone(),
                            xattr_index: node.xattr_idx,
                        }),
                    )
                } else {
                    Inode::new(
                        InodeId::BasicSymlink,
                        header,
                        InodeInner::BasicSymlink(BasicSymlink {
                            link_count: 1,
                            target_size: target.len() as u32,
                            target_path: target.clone(),
                        }),
                    )
                }
            }
            NodePayload::BlockDevice(devno) => {
                let device = BasicDeviceSpecialFile { link_count: 1, device_number: *devno };
                if has_xattr {
                    Inode::new(
                        InodeId::ExtendedBlockDevice,
                        header,
                        InodeInner::ExtendedBlockDevice(ExtendedDeviceSpecialFile {
                            link_count: 1,
                            device_number: *devno,
                            xattr_index: node.xattr_idx,
                        }),
                    )
                } else {
                    Inode::new(InodeId::BasicBlockDevice, header, InodeInner::BasicBlockDevice(device))
                }
            }
            NodePayload::CharDevice(devno) => {
                let device = BasicDeviceSpecialFile { link_count: 1, device_number: *devno };
                if has_xattr {
                    Inode::new(
                        InodeId::ExtendedCharacterDevice,
                        header,
                        InodeInner::ExtendedCharacterDevice(ExtendedDeviceSpecialFile {
                            link_count: 1,
                            device_number: *devno,
                            xattr_index: node.xattr_idx,
                        }),
                    )
                } else {
                    Inode::new(
                        InodeId::BasicCharacterDevice,
                        header,
                        InodeInner::BasicCharacterDevice(device),
                    )
                }
            }
            NodePayload::Fifo => {
                if has_xattr {
                    Inode::new(
                        InodeId::ExtendedNamedPipe,
                        header,
                        InodeInner::ExtendedNamedPipe(ExtendedIpc {
                            link_count: 1,
                            xattr_index: node.xattr_idx,
                        }),
                    )
                } else {
                    Inode::new(
                        InodeId::BasicNamedPipe,
                        header,
                        InodeInner::BasicNamedPipe(BasicIpc { link_count: 1 }),
                    )
                }
            }
            NodePayload::Socket => {
                if has_xattr {
                    Inode::new(
                        InodeId::ExtendedSocket,
                        header,
                        InodeInner::ExtendedSocket(ExtendedIpc {
                            link_count: 1,
                            xattr_index: node.xattr_idx,
                        }),
                    )
                } else {
                    Inode::new(
                        InodeId::BasicSocket,
                        header,
                        InodeInner::BasicSocket(BasicIpc { link_count: 1 }),
                    )
                }
            }
            NodePayload::Dir { .. } => {
                return Err(PackError::Internal("directory in leaf position".to_string()))
            }
        };

        self.emit_inode(node, inode)
    }

    fn inode_header(&mut self, node: &TreeNode) -> Result<InodeHeader, PackError> {
        let uid = self
            .id_table
            .get(node.header.uid)
            .ok_or_else(|| PackError::Internal("uid missing from id table".to_string()))?;
        let gid = self
            .id_table
            .get(node.header.gid)
            .ok_or_else(|| PackError::Internal("gid missing from id table".to_string()))?;
        Ok(InodeHeader {
            permissions: node.header.mode,
            uid,
            gid,
            mtime: node.header.mtime,
            inode_number: node.inode_num,
        })
    }

    fn emit_inode(&mut self, node: &TreeNode, inode: Inode) -> Result<Entry, PackError> {
        let inode_ref =
            inode.to_writer(&mut self.inode_writer, self.config.block_size, self.block_log)?;
        debug_assert_eq!(self.inode_refs.len() + 1, node.inode_num as usize);
        self.inode_refs.push(inode_ref);

        Ok(Entry {
            start: (inode_ref >> 16) as u32,
            offset: (inode_ref & 0xffff) as u16,
            inode: node.inode_num,
            t: inode.id,
            name: node.name.clone(),
        })
    }

    /// Table layout shared by the fragment, export and id tables: the
    /// serialized elements chunked into metadata blocks, followed by a list
    /// of absolute block offsets which is what the superblock points at.
    fn write_lookup_table(
        &self,
        offset: &mut u64,
        elements: &[Vec<u8>],
        element_size: usize,
    ) -> Result<u64, PackError> {
        let mut ptrs: Vec<u64> = vec![];
        let mut table_bytes = Vec::with_capacity(elements.len() * element_size);
        let mut iter = elements.iter().peekable();
        while let Some(bytes) = iter.next() {
            table_bytes.extend_from_slice(bytes);

            // once table_bytes + next is over the maximum size of a metadata block, write
            if (table_bytes.len() + element_size > METADATA_MAXSIZE) || iter.peek().is_none() {
                ptrs.push(*offset);
                let len = metadata::set_if_uncompressed(table_bytes.len() as u16);
                self.write_all(offset, &len.to_le_bytes())?;
                self.write_all(offset, &table_bytes)?;
                table_bytes.clear();
            }
        }

        let table_offset = *offset;
        for ptr in ptrs {
            self.write_all(offset, &ptr.to_le_bytes())?;
        }
        Ok(table_offset)
    }

    /// Two streams: the key/value records of every deduplicated set, then the
    /// id entries locating each set, indexed from a header the superblock
    /// points at
    fn write_xattr_table(
        &mut self,
        offset: &mut u64,
        superblock: &mut SuperBlock,
    ) -> Result<(), PackError> {
        let mut kv_writer = MetadataWriter::new(self.compressor, self.config.block_size);
        let mut ids = Vec::with_capacity(self.store.sets.len());
        for set in &self.store.sets {
            let (start, kv_offset) = kv_writer.position();
            let records = self.store.set_records(set)?;
            kv_writer
                .write_all(&records)
                .map_err(|e| PackError::Internal(e.to_string()))?;
            ids.push(XattrId {
                xattr_ref: (u64::from(start) << 16) | u64::from(kv_offset),
                count: set.len() as u32,
                size: records.len() as u32,
            });
        }

        let kv_start = *offset;
        let blob = kv_writer.finish()?;
        self.write_all(offset, &blob)?;

        // the id entries are themselves a metadata stream
        let mut id_writer = MetadataWriter::new(self.compressor, self.config.block_size);
        for id in &ids {
            id_writer
                .write_all(&id.to_bytes()?)
                .map_err(|e| PackError::Internal(e.to_string()))?;
        }
        let id_base = *offset;
        let id_blob = id_writer.finish()?;
        self.write_all(offset, &id_blob)?;
        let ptrs: Vec<u64> = metadata_block_offsets(&id_blob)
            .into_iter()
            .map(|rel| id_base + rel)
            .collect();

        superblock.xattr_table = *offset;
        let header = XattrTableHeader {
            kv_start,
            xattr_ids: ids.len() as u32,
            unused: 0,
        };
        self.write_all(offset, &header.to_bytes()?)?;
        for ptr in ptrs {
            self.write_all(offset, &ptr.to_le_bytes())?;
        }
        Ok(())
    }

    /// Tail-pad to the device block size and write the final superblock over
    /// the placeholder
    fn finalize(&self, offset: u64, superblock: &mut SuperBlock) -> Result<(), PackError> {
        superblock.bytes_used = offset;

        let dev_block = u64::from(self.config.dev_block_size);
        let padded = (offset + dev_block - 1) / dev_block * dev_block;
        if padded > offset {
            let pad = vec![0u8; (padded - offset) as usize];
            self.sink.write_at(offset, &pad).map_err(PackError::OutputIo)?;
        }

        let bytes = superblock.to_bytes()?;
        self.sink.write_at(0, &bytes).map_err(PackError::OutputIo)?;
        Ok(())
    }
}

/// Offsets of each length-prefixed block inside a serialized metadata stream
fn metadata_block_offsets(blob: &[u8]) -> Vec<u64> {
    let mut offsets = vec![];
    let mut pos = 0usize;
    while pos + 2 <= blob.len() {
        offsets.push(pos as u64);
        let len = u16::from_le_bytes([blob[pos], blob[pos + 1]]);
        pos += 2 + metadata::len(len) as usize;
    }
    offsets
}
