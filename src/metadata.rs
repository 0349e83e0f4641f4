//! Compressed metadata block streams

use std::collections::VecDeque;
use std::io::{self, Read, Write};

use tracing::trace;

use crate::compressor::{self, Compressor, FilesystemCompressor};
use crate::error::PackError;

pub const METADATA_MAXSIZE: usize = 0x2000;

const METADATA_UNCOMPRESSED: u16 = 1 << 15;

/// Writer producing a stream of metadata blocks: up to 8 KiB of payload each,
/// compressed when that helps, prefixed with a u16 length word whose high bit
/// marks a block stored uncompressed.
pub(crate) struct MetadataWriter {
    compressor: FilesystemCompressor,
    block_size: u32,
    /// Offset from the beginning of the metadata stream to the block currently
    /// being filled
    pub(crate) metadata_start: u32,
    // All current bytes that are uncompressed
    pub(crate) uncompressed_bytes: VecDeque<u8>,
    // All current bytes that are compressed or uncompressed
    pub(crate) final_bytes: Vec<(bool, Vec<u8>)>,
}

impl MetadataWriter {
    pub fn new(compressor: FilesystemCompressor, block_size: u32) -> Self {
        Self {
            compressor,
            block_size,
            metadata_start: 0,
            uncompressed_bytes: VecDeque::new(),
            final_bytes: vec![],
        }
    }

    /// Position an inode reference would point at right now:
    /// (stream offset of the current block, byte offset inside it)
    pub fn position(&self) -> (u32, u16) {
        (self.metadata_start, self.uncompressed_bytes.len() as u16)
    }

    fn add_block(&mut self) -> Result<(), PackError> {
        // uncompress data that will create the metablock
        let uncompressed_len = self.uncompressed_bytes.len().min(METADATA_MAXSIZE);
        if uncompressed_len == 0 {
            // nothing to add
            return Ok(());
        }

        if self.uncompressed_bytes.as_slices().0.len() < uncompressed_len {
            self.uncompressed_bytes.make_contiguous();
        }
        let uncompressed = &self.uncompressed_bytes.as_slices().0[0..uncompressed_len];

        let compressed = compressor::compress(uncompressed, self.compressor, self.block_size)?;

        // Remove the data consumed, if the uncompressed data is smaller, use it.
        let (is_compressed, metadata) = if compressed.len() >= uncompressed_len {
            let uncompressed = self.uncompressed_bytes.drain(0..uncompressed_len).collect();
            (false, uncompressed)
        } else {
            self.uncompressed_bytes.drain(0..uncompressed_len);
            (true, compressed)
        };

        // Metadata len + bytes + last metadata_start
        self.metadata_start += 2 + metadata.len() as u32;
        trace!("new metadata start: {:#02x?}", self.metadata_start);
        self.final_bytes.push((is_compressed, metadata));

        Ok(())
    }

    /// Emit any partial block and return the serialized stream
    pub fn finish(&mut self) -> Result<Vec<u8>, PackError> {
        // add any remaining data
        while !self.uncompressed_bytes.is_empty() {
            self.add_block()?;
        }

        let mut out = vec![];
        for (is_compressed, block) in &self.final_bytes {
            // if uncompressed, set the highest bit of len
            let len =
                block.len() as u16 | if *is_compressed { 0 } else { METADATA_UNCOMPRESSED };
            out.extend_from_slice(&len.to_le_bytes());
            out.extend_from_slice(block);
        }
        Ok(out)
    }
}

impl Write for MetadataWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        // add all of buf into uncompressed
        self.uncompressed_bytes.write_all(buf)?;

        // if there is too much uncompressed data, create a new metadata block
        while self.uncompressed_bytes.len() >= METADATA_MAXSIZE {
            self.add_block().map_err(io::Error::from)?;
        }

        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Read one metadata block back from an image: length word, then the block
/// bytes, decompressed when the stored-uncompressed bit is clear
pub fn read_block<R: Read + ?Sized>(
    reader: &mut R,
    compressor: Compressor,
) -> Result<Vec<u8>, PackError> {
    let mut len_bytes = [0u8; 2];
    reader.read_exact(&mut len_bytes).map_err(PackError::OutputIo)?;
    let metadata_len = u16::from_le_bytes(len_bytes);

    let byte_len = len(metadata_len);
    let mut buf = vec![0u8; byte_len as usize];
    reader.read_exact(&mut buf).map_err(PackError::OutputIo)?;

    if is_compressed(metadata_len) {
        let mut out = Vec::with_capacity(METADATA_MAXSIZE);
        compressor::decompress(&buf, &mut out, compressor, METADATA_MAXSIZE)?;
        Ok(out)
    } else {
        Ok(buf)
    }
}

/// Check is_compressed bit within raw `len`
pub fn is_compressed(len: u16) -> bool {
    len & METADATA_UNCOMPRESSED == 0
}

/// Get actual length of `data` following `len` from unedited `len`
pub fn len(len: u16) -> u16 {
    len & !(METADATA_UNCOMPRESSED)
}

pub fn set_if_uncompressed(len: u16) -> u16 {
    len | METADATA_UNCOMPRESSED
}
