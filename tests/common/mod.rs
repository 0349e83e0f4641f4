//! Shared helpers for the integration tests: tiny tar archive builders and
//! just enough SquashFS reading to verify the images this crate produces.

#![allow(dead_code)]

use std::collections::HashMap;
use std::io::Cursor;

use deku::bitvec::{BitView, Msb0};
use deku::prelude::*;

use tar2sqfs::inode::{BasicFile, Inode, InodeInner};
use tar2sqfs::metadata;
use tar2sqfs::superblock::NOT_SET;
use tar2sqfs::xattr::{XattrId, XattrKey, XattrTableHeader, XattrValue};
use tar2sqfs::{compressor, Compressor, DataSize, Dir, Fragment, Id, SuperBlock};

pub const RECORD: usize = 512;

// ---- tar builders -------------------------------------------------------

pub fn raw_header(name: &[u8], typeflag: u8, size: u64, mode: u32, uid: u32) -> [u8; RECORD] {
    let mut block = [0u8; RECORD];
    block[..name.len()].copy_from_slice(name);
    block[100..107].copy_from_slice(format!("{mode:07o}").as_bytes());
    block[108..115].copy_from_slice(format!("{uid:07o}").as_bytes());
    block[116..123].copy_from_slice(format!("{uid:07o}").as_bytes());
    block[124..135].copy_from_slice(format!("{size:011o}").as_bytes());
    block[136..147].copy_from_slice(format!("{:011o}", 1_650_000_000u64).as_bytes());
    block[156] = typeflag;
    block[257..263].copy_from_slice(b"ustar\0");
    block[263..265].copy_from_slice(b"00");
    checksum(&mut block);
    block
}

pub fn checksum(block: &mut [u8; RECORD]) {
    block[148..156].copy_from_slice(b"        ");
    let sum: u64 = block.iter().map(|b| u64::from(*b)).sum();
    block[148..156].copy_from_slice(format!("{sum:06o}\0 ").as_bytes());
}

pub fn pad_payload(archive: &mut Vec<u8>, payload: &[u8]) {
    archive.extend_from_slice(payload);
    let pad = (RECORD - payload.len() % RECORD) % RECORD;
    archive.extend(std::iter::repeat(0).take(pad));
}

pub fn add_file(archive: &mut Vec<u8>, name: &[u8], payload: &[u8], mode: u32, uid: u32) {
    archive.extend_from_slice(&raw_header(name, b'0', payload.len() as u64, mode, uid));
    pad_payload(archive, payload);
}

pub fn add_dir(archive: &mut Vec<u8>, name: &[u8], mode: u32, uid: u32) {
    archive.extend_from_slice(&raw_header(name, b'5', 0, mode, uid));
}

pub fn add_symlink(archive: &mut Vec<u8>, name: &[u8], target: &[u8]) {
    let mut block = raw_header(name, b'2', 0, 0o777, 0);
    block[157..157 + target.len()].copy_from_slice(target);
    checksum(&mut block);
    archive.extend_from_slice(&block);
}

pub fn terminate(archive: &mut Vec<u8>) {
    archive.extend(std::iter::repeat(0).take(2 * RECORD));
}

/// One `"<len> <key>=<value>\n"` PAX field
pub fn pax_field(key: &str, value: &[u8]) -> Vec<u8> {
    let payload_len = key.len() + value.len() + 3;
    let mut total = payload_len + payload_len.to_string().len();
    if total.to_string().len() > payload_len.to_string().len() {
        total += 1;
    }
    let mut out = format!("{total} {key}=").into_bytes();
    out.extend_from_slice(value);
    out.push(b'\n');
    out
}

/// PAX extended header record followed by the member header carrying `payload`
pub fn add_pax_file(archive: &mut Vec<u8>, name: &[u8], payload: &[u8], mode: u32, pax: &[u8]) {
    archive.extend_from_slice(&raw_header(b"PaxHeaders/x", b'x', pax.len() as u64, 0o644, 0));
    pad_payload(archive, pax);
    archive.extend_from_slice(&raw_header(name, b'0', payload.len() as u64, mode, 0));
    pad_payload(archive, payload);
}

fn div_ceil(a: usize, b: usize) -> usize {
    (a + b - 1) / b
}

// ---- image readback -----------------------------------------------------

/// Walks a metadata stream block by block, keeping the mapping from on-disk
/// block offsets to offsets in the decompressed stream
pub struct MetaStream<'a> {
    image: &'a [u8],
    base: u64,
    compressor: Compressor,
    /// Disk offset (relative to `base`) of the next unread block
    pub pos: u64,
    pub data: Vec<u8>,
    pub block_map: HashMap<u32, usize>,
}

impl<'a> MetaStream<'a> {
    pub fn new(image: &'a [u8], base: u64, compressor: Compressor) -> Self {
        Self { image, base, compressor, pos: 0, data: vec![], block_map: HashMap::new() }
    }

    pub fn read_one(&mut self) {
        self.block_map.insert(self.pos as u32, self.data.len());
        let start = (self.base + self.pos) as usize;
        let mut cursor = Cursor::new(&self.image[start..]);
        let block = metadata::read_block(&mut cursor, self.compressor).unwrap();
        self.pos += cursor.position();
        self.data.extend(block);
    }

    /// Read blocks until the stream holds `needed` decompressed bytes
    pub fn ensure(&mut self, needed: usize) {
        while self.data.len() < needed {
            self.read_one();
        }
    }

    /// Decompressed-stream position of `(block, offset)`
    pub fn resolve(&mut self, block: u32, offset: u16) -> usize {
        while !self.block_map.contains_key(&block) {
            self.read_one();
        }
        self.block_map[&block] + offset as usize
    }

    /// Read every block in `[base, base + limit)`
    pub fn read_to_disk_limit(&mut self, limit: u64) {
        while self.pos < limit {
            self.read_one();
        }
        assert_eq!(self.pos, limit, "metadata stream not aligned with table bounds");
    }
}

pub struct Image {
    pub bytes: Vec<u8>,
    pub sb: SuperBlock,
}

/// A parsed inode along with the reference it was stored under
pub struct ReadInode {
    pub inode: Inode,
    pub inode_ref: u64,
}

impl Image {
    pub fn parse(bytes: Vec<u8>) -> Self {
        let (_, sb) = SuperBlock::from_bytes((&bytes[..96], 0)).unwrap();
        Self { bytes, sb }
    }

    /// The whole inode table in storage order (which is inode-number order,
    /// starting at 1)
    pub fn inodes(&self) -> Vec<ReadInode> {
        let mut stream = MetaStream::new(&self.bytes, self.sb.inode_table, self.sb.compressor);
        stream.read_to_disk_limit(self.sb.dir_table - self.sb.inode_table);

        // invert the block map so stream positions turn back into references
        let mut blocks: Vec<(usize, u32)> =
            stream.block_map.iter().map(|(disk, cum)| (*cum, *disk)).collect();
        blocks.sort_unstable();

        let total_bits = stream.data.len() * 8;
        let bits = stream.data.view_bits::<Msb0>();
        let mut rest = bits;
        let mut out = vec![];
        while !rest.is_empty() {
            let pos = (total_bits - rest.len()) / 8;
            let (disk_block, cum) = blocks
                .iter()
                .rev()
                .find(|(cum, _)| *cum <= pos)
                .map(|(cum, disk)| (*disk, *cum))
                .unwrap();
            let inode_ref = (u64::from(disk_block) << 16) | (pos - cum) as u64;
            let (next, inode) =
                Inode::read(rest, (self.sb.block_size, self.sb.block_log)).unwrap();
            rest = next;
            out.push(ReadInode { inode, inode_ref });
        }
        assert_eq!(out.len() as u32, self.sb.inode_count + 1);
        out
    }

    pub fn inode_by_number(&self, number: u32) -> Inode {
        let inodes = self.inodes();
        let found = &inodes[number as usize - 1];
        assert_eq!(found.inode.header.inode_number, number);
        found.inode.clone()
    }

    pub fn root_inode(&self) -> Inode {
        let inodes = self.inodes();
        inodes
            .iter()
            .find(|i| i.inode_ref == self.sb.root_inode)
            .expect("root inode reference not found")
            .inode
            .clone()
    }

    /// Directory listing of a directory inode as `(name, inode number)`, in
    /// stored order
    pub fn dir_entries(&self, inode: &Inode) -> Vec<(Vec<u8>, u32)> {
        let (block_index, block_offset, file_size) = match &inode.inner {
            InodeInner::BasicDirectory(dir) => {
                (dir.block_index, dir.block_offset, dir.file_size as usize)
            }
            InodeInner::ExtendedDirectory(dir) => {
                (dir.block_index, dir.block_offset, dir.file_size as usize)
            }
            other => panic!("not a directory inode: {other:?}"),
        };
        if file_size <= 3 {
            return vec![];
        }
        let listing_len = file_size - 3;

        let mut stream = MetaStream::new(&self.bytes, self.sb.dir_table, self.sb.compressor);
        let start = stream.resolve(block_index, block_offset);
        stream.ensure(start + listing_len);
        let listing = &stream.data[start..start + listing_len];

        let mut out = vec![];
        let mut rest = listing;
        while !rest.is_empty() {
            let ((next, _), dir) = Dir::from_bytes((rest, 0)).unwrap();
            for entry in dir.entries() {
                let number = (dir.inode_num() as i64 + i64::from(entry.inode_offset())) as u32;
                out.push((entry.name().to_vec(), number));
            }
            rest = next;
        }
        out
    }

    pub fn fragments(&self) -> Vec<Fragment> {
        if self.sb.frag_table == NOT_SET {
            return vec![];
        }
        self.lookup_table(self.sb.frag_table, self.sb.frag_count as usize, 16)
            .chunks_exact(16)
            .map(|chunk| Fragment::from_bytes((chunk, 0)).unwrap().1)
            .collect()
    }

    pub fn ids(&self) -> Vec<u32> {
        self.lookup_table(self.sb.id_table, self.sb.id_count as usize, 4)
            .chunks_exact(4)
            .map(|chunk| Id::from_bytes((chunk, 0)).unwrap().1.num)
            .collect()
    }

    pub fn export_refs(&self, count: usize) -> Vec<u64> {
        assert_ne!(self.sb.export_table, NOT_SET);
        self.lookup_table(self.sb.export_table, count, 8)
            .chunks_exact(8)
            .map(|chunk| u64::from_le_bytes(chunk.try_into().unwrap()))
            .collect()
    }

    /// Concatenated element bytes of a pointer-indexed lookup table
    fn lookup_table(&self, table_offset: u64, count: usize, element_size: usize) -> Vec<u8> {
        let total = count * element_size;
        let per_block = 8192 / element_size * element_size;
        let num_blocks = div_ceil(total, per_block).max(1);

        let mut data = vec![];
        for i in 0..num_blocks {
            let ptr_at = table_offset as usize + i * 8;
            let ptr = u64::from_le_bytes(self.bytes[ptr_at..ptr_at + 8].try_into().unwrap());
            let mut cursor = Cursor::new(&self.bytes[ptr as usize..]);
            data.extend(metadata::read_block(&mut cursor, self.sb.compressor).unwrap());
        }
        data.truncate(total);
        data
    }

    /// Reconstruct a regular file's logical contents from its inode
    pub fn read_file(&self, inode: &Inode) -> Vec<u8> {
        let basic: BasicFile = match &inode.inner {
            InodeInner::BasicFile(file) => file.clone(),
            InodeInner::ExtendedFile(file) => BasicFile::from(file),
            other => panic!("not a file inode: {other:?}"),
        };

        let mut out = vec![];
        let mut offset = u64::from(basic.blocks_start);
        for size in &basic.block_sizes {
            let remaining = basic.file_size as usize - out.len();
            let logical = remaining.min(self.sb.block_size as usize);
            let block = self.read_data_block(&mut offset, *size, logical);
            out.extend(block);
        }

        if basic.frag_index != 0xffff_ffff {
            let fragment = self.fragments()[basic.frag_index as usize];
            let mut frag_offset = fragment.start;
            let block = self.read_data_block(
                &mut frag_offset,
                fragment.size,
                self.sb.block_size as usize,
            );
            let tail_len = basic.file_size as usize - out.len();
            let tail_start = basic.block_offset as usize;
            out.extend_from_slice(&block[tail_start..tail_start + tail_len]);
        }

        assert_eq!(out.len(), basic.file_size as usize);
        out
    }

    fn read_data_block(&self, offset: &mut u64, size: DataSize, logical: usize) -> Vec<u8> {
        if size.is_hole() {
            return vec![0u8; logical];
        }
        let start = *offset as usize;
        let stored = &self.bytes[start..start + size.size() as usize];
        *offset += u64::from(size.size());
        if size.uncompressed() {
            stored.to_vec()
        } else {
            let mut out = vec![];
            compressor::decompress(stored, &mut out, self.sb.compressor, logical).unwrap();
            out
        }
    }

    /// Every deduplicated xattr set as `(full key, value)` pairs
    pub fn xattr_sets(&self) -> Vec<Vec<(Vec<u8>, Vec<u8>)>> {
        assert_ne!(self.sb.xattr_table, NOT_SET);
        let header_at = self.sb.xattr_table as usize;
        let (_, header) =
            XattrTableHeader::from_bytes((&self.bytes[header_at..header_at + 16], 0)).unwrap();

        // id entries live in metadata blocks listed after the header
        let count = header.xattr_ids as usize;
        let num_blocks = div_ceil(count * 16, 8192 / 16 * 16).max(1);
        let mut id_bytes = vec![];
        for i in 0..num_blocks {
            let ptr_at = header_at + 16 + i * 8;
            let ptr = u64::from_le_bytes(self.bytes[ptr_at..ptr_at + 8].try_into().unwrap());
            let mut cursor = Cursor::new(&self.bytes[ptr as usize..]);
            id_bytes.extend(metadata::read_block(&mut cursor, self.sb.compressor).unwrap());
        }
        id_bytes.truncate(count * 16);

        let mut kv_stream = MetaStream::new(&self.bytes, header.kv_start, self.sb.compressor);
        let prefixes = ["user.", "trusted.", "security."];

        let mut sets = vec![];
        for chunk in id_bytes.chunks_exact(16) {
            let (_, id) = XattrId::from_bytes((chunk, 0)).unwrap();
            let start =
                kv_stream.resolve((id.xattr_ref >> 16) as u32, (id.xattr_ref & 0xffff) as u16);
            kv_stream.ensure(start + id.size as usize);
            let set_bytes = kv_stream.data[start..start + id.size as usize].to_vec();
            let mut rest = &set_bytes[..];

            let mut pairs = vec![];
            for _ in 0..id.count {
                let ((next, _), key) = XattrKey::from_bytes((rest, 0)).unwrap();
                let ((next, _), value) = XattrValue::from_bytes((next, 0)).unwrap();
                rest = next;
                let mut full = prefixes[key.t as usize].as_bytes().to_vec();
                full.extend_from_slice(&key.name);
                pairs.push((full, value.value));
            }
            sets.push(pairs);
        }
        sets
    }
}
