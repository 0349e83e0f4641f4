//! Streaming tar decoder
//!
//! Reads 512-byte records from a forward-only stream and yields one decoded
//! [`TarHeader`] per archive member, folding GNU longname/longlink records,
//! PAX extended headers, sparse maps and xattrs into it. The input is never
//! seeked; skipping advances by reading.

mod header;
mod pax;
pub mod sparse;

use std::io::Read;

use tracing::warn;

use crate::error::PackError;
use crate::tar::header::{TarBlock, RECORD_SIZE};
use crate::tar::pax::PaxData;
use crate::tar::sparse::{SparseMap, SparseSegment};

pub use crate::tar::sparse::SparseExpandReader;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum EntryKind {
    File,
    Directory,
    Symlink,
    HardLink,
    CharDevice,
    BlockDevice,
    Fifo,
    /// Typeflag this decoder does not understand; the entry is skippable
    Unknown(u8),
}

/// One decoded archive member, positioned at the start of its payload
#[derive(Debug)]
pub struct TarHeader {
    /// Canonical, root-relative, slash-normalized path
    pub name: Vec<u8>,
    pub kind: EntryKind,
    pub mode: u16,
    pub uid: u32,
    pub gid: u32,
    pub mtime: u32,
    /// Payload bytes on the wire; differs from `actual_size` for sparse files
    pub record_size: u64,
    /// Logical file size
    pub actual_size: u64,
    pub link_target: Option<Vec<u8>>,
    /// Packed device number for character/block devices
    pub devno: u32,
    pub sparse: Option<SparseMap>,
    pub xattrs: Vec<(Vec<u8>, Vec<u8>)>,
}

/// Values a PAX global header (`g`) establishes for subsequent entries
#[derive(Debug, Default)]
struct GlobalDefaults {
    uid: Option<u32>,
    gid: Option<u32>,
    mtime: Option<u32>,
}

pub struct TarReader<R: Read> {
    input: R,
    strict: bool,
    global: GlobalDefaults,
}

impl<R: Read> TarReader<R> {
    pub fn new(input: R, strict: bool) -> Self {
        Self { input, strict, global: GlobalDefaults::default() }
    }

    /// Decode the next archive member. Returns `None` at end of archive.
    ///
    /// In default mode undecodable members are skipped with a warning and the
    /// next member is tried; in strict mode they are fatal.
    pub fn read_header(&mut self) -> Result<Option<TarHeader>, PackError> {
        let mut longname: Option<Vec<u8>> = None;
        let mut longlink: Option<Vec<u8>> = None;
        let mut pax: Option<PaxData> = None;

        loop {
            let block = match self.read_block_or_eof()? {
                Some(block) => block,
                None => return Ok(None),
            };

            if block.is_zero() {
                // end of archive is two consecutive zero records
                match self.read_block_or_eof()? {
                    None => return Ok(None),
                    Some(second) if second.is_zero() => return Ok(None),
                    Some(_) => {
                        return Err(PackError::TarFormat(
                            "lone zero record inside archive".to_string(),
                        ))
                    }
                }
            }

            if !block.checksum_valid() {
                let err = PackError::TarFormat("record checksum mismatch".to_string());
                if self.strict {
                    return Err(err);
                }
                warn!("{err}, skipping entry");
                let size = block.size().unwrap_or(0);
                self.skip_entry(size)?;
                longname = None;
                longlink = None;
                pax = None;
                continue;
            }

            match block.typeflag() {
                b'L' => longname = Some(self.read_string_payload(&block)?),
                b'K' => longlink = Some(self.read_string_payload(&block)?),
                b'x' | b'X' => {
                    let parsed = self.read_pax_payload(&block)?;
                    match pax.as_mut() {
                        Some(existing) => existing.merge(parsed),
                        None => pax = Some(parsed),
                    }
                }
                b'g' => {
                    let parsed = self.read_pax_payload(&block)?;
                    self.global.uid = parsed.uid.or(self.global.uid);
                    self.global.gid = parsed.gid.or(self.global.gid);
                    self.global.mtime = parsed.mtime.or(self.global.mtime);
                }
                _ => match self.build_entry(block, longname.take(), longlink.take(), pax.take()) {
                    Ok(header) => return Ok(Some(header)),
                    Err(Skipped::Recovered) => continue,
                    Err(Skipped::Fatal(e)) => return Err(e),
                },
            }
        }
    }

    /// Consume the padding that rounds an `n`-byte payload up to 512
    pub fn skip_padding(&mut self, n: u64) -> Result<(), PackError> {
        let pad = (RECORD_SIZE as u64 - n % RECORD_SIZE as u64) % RECORD_SIZE as u64;
        self.discard(pad)
    }

    /// Read-and-discard an entire payload including padding
    pub fn skip_entry(&mut self, record_size: u64) -> Result<(), PackError> {
        self.discard(record_size)?;
        self.skip_padding(record_size)
    }

    /// Borrow the payload of the current member as a bounded reader
    pub fn payload_reader(&mut self, size: u64) -> std::io::Take<&mut R> {
        (&mut self.input).take(size)
    }

    fn discard(&mut self, mut n: u64) -> Result<(), PackError> {
        let mut scratch = [0u8; 4096];
        while n > 0 {
            let want = scratch.len().min(n as usize);
            self.input
                .read_exact(&mut scratch[..want])
                .map_err(PackError::InputRead)?;
            n -= want as u64;
        }
        Ok(())
    }

    fn read_block(&mut self) -> Result<TarBlock, PackError> {
        let mut block = TarBlock([0u8; RECORD_SIZE]);
        self.input
            .read_exact(&mut block.0)
            .map_err(PackError::InputRead)?;
        Ok(block)
    }

    /// Like `read_block`, but a clean EOF at a record boundary ends the archive
    fn read_block_or_eof(&mut self) -> Result<Option<TarBlock>, PackError> {
        let mut block = TarBlock([0u8; RECORD_SIZE]);
        let mut filled = 0;
        while filled < RECORD_SIZE {
            let n = self
                .input
                .read(&mut block.0[filled..])
                .map_err(PackError::InputRead)?;
            if n == 0 {
                if filled == 0 {
                    return Ok(None);
                }
                return Err(PackError::TarFormat("truncated record".to_string()));
            }
            filled += n;
        }
        Ok(Some(block))
    }

    /// Longname/longlink and PAX payloads are read into memory whole; cap
    /// them so a forged size field cannot trigger a huge allocation
    const MAX_HEADER_PAYLOAD: u64 = 16 * 1024 * 1024;

    fn read_string_payload(&mut self, block: &TarBlock) -> Result<Vec<u8>, PackError> {
        let size = block.size()?;
        if size > Self::MAX_HEADER_PAYLOAD {
            return Err(PackError::TarFormat("oversized name record".to_string()));
        }
        let mut bytes = vec![0u8; size as usize];
        self.input
            .read_exact(&mut bytes)
            .map_err(PackError::InputRead)?;
        self.skip_padding(size)?;
        while bytes.last() == Some(&0) {
            bytes.pop();
        }
        Ok(bytes)
    }

    fn read_pax_payload(&mut self, block: &TarBlock) -> Result<PaxData, PackError> {
        let size = block.size()?;
        if size > Self::MAX_HEADER_PAYLOAD {
            return Err(PackError::TarFormat("oversized extended header".to_string()));
        }
        let mut bytes = vec![0u8; size as usize];
        self.input
            .read_exact(&mut bytes)
            .map_err(PackError::InputRead)?;
        self.skip_padding(size)?;
        PaxData::parse(&bytes, self.strict)
    }

    /// The map of a GNU sparse 1.0 member sits at the front of the payload:
    /// newline-terminated decimal numbers, padded to a record boundary.
    /// Returns the segments and the number of payload bytes consumed.
    fn read_sparse_1_0_map(&mut self) -> Result<(Vec<SparseSegment>, u64), PackError> {
        let mut numbers: Vec<u64> = vec![];
        let mut needed = None;
        let mut digits = vec![];
        let mut consumed = 0u64;

        'blocks: loop {
            let block = self.read_block()?;
            consumed += RECORD_SIZE as u64;
            for b in block.0.iter() {
                match b {
                    b'\n' => {
                        numbers.push(pax::parse_decimal(&digits)?);
                        digits.clear();
                        if needed.is_none() {
                            let count = numbers[0];
                            if count > 0x0010_0000 {
                                return Err(PackError::TarFormat(
                                    "unreasonable sparse map entry count".to_string(),
                                ));
                            }
                            needed = Some(1 + 2 * count as usize);
                        }
                        if numbers.len() == needed.unwrap() {
                            break 'blocks;
                        }
                    }
                    b'0'..=b'9' => digits.push(*b),
                    _ => {
                        return Err(PackError::TarFormat(
                            "malformed sparse map in payload".to_string(),
                        ))
                    }
                }
            }
        }

        let segments = numbers[1..]
            .chunks_exact(2)
            .map(|pair| SparseSegment { offset: pair[0], count: pair[1] })
            .collect();
        Ok((segments, consumed))
    }

    fn build_entry(
        &mut self,
        block: TarBlock,
        longname: Option<Vec<u8>>,
        longlink: Option<Vec<u8>>,
        pax: Option<PaxData>,
    ) -> Result<TarHeader, Skipped> {
        match self.try_build_entry(block, longname, longlink, pax) {
            Ok(Err((err, record_size))) => {
                if self.strict {
                    Err(Skipped::Fatal(err))
                } else {
                    warn!("{err}, skipping entry");
                    match self.skip_entry(record_size) {
                        Ok(()) => Err(Skipped::Recovered),
                        Err(e) => Err(Skipped::Fatal(e)),
                    }
                }
            }
            Ok(Ok(header)) => Ok(header),
            Err(e) => Err(Skipped::Fatal(e)),
        }
    }

    /// Inner result: `Err((err, record_size))` marks a malformed member that
    /// can still be skipped over
    #[allow(clippy::type_complexity)]
    fn try_build_entry(
        &mut self,
        block: TarBlock,
        longname: Option<Vec<u8>>,
        longlink: Option<Vec<u8>>,
        pax: Option<PaxData>,
    ) -> Result<Result<TarHeader, (PackError, u64)>, PackError> {
        let pax = pax.unwrap_or_default();
        let mut record_size = match pax.size {
            Some(size) => size,
            None => match block.size() {
                Ok(size) => size,
                Err(e) => return Ok(Err((e, 0))),
            },
        };

        macro_rules! skippable {
            ($e:expr) => {
                match $e {
                    Ok(v) => v,
                    Err(e) => return Ok(Err((e, record_size))),
                }
            };
        }

        let typeflag = block.typeflag();
        let kind = match typeflag {
            b'0' | 0 | b'7' | b'S' => EntryKind::File,
            b'1' => EntryKind::HardLink,
            b'2' => EntryKind::Symlink,
            b'3' => EntryKind::CharDevice,
            b'4' => EntryKind::BlockDevice,
            b'5' => EntryKind::Directory,
            b'6' => EntryKind::Fifo,
            other => EntryKind::Unknown(other),
        };

        let mut raw_name = longname
            .or(pax.path)
            .unwrap_or_else(|| block.full_name());

        let mut actual_size = record_size;
        let mut sparse = None;
        if typeflag == b'S' {
            // old-style GNU sparse header, possibly with continuation records
            let mut segments: Vec<SparseSegment> = skippable!(block.gnu_sparse_entries())
                .into_iter()
                .map(|(offset, count)| SparseSegment { offset, count })
                .collect();
            let mut extended = block.gnu_sparse_is_extended();
            while extended {
                let cont = self.read_block()?;
                segments.extend(
                    skippable!(cont.gnu_sparse_cont_entries())
                        .into_iter()
                        .map(|(offset, count)| SparseSegment { offset, count }),
                );
                extended = cont.gnu_sparse_cont_is_extended();
            }
            actual_size = skippable!(block.gnu_sparse_realsize());
            sparse = Some(SparseMap::new(segments, actual_size));
        } else if pax.sparse.map_in_payload() {
            // GNU sparse 1.0: the map is the front of the payload
            if let Some(name) = &pax.sparse.name {
                raw_name = name.clone();
            }
            actual_size = match pax.sparse.actual_size() {
                Some(size) => size,
                None => {
                    return Ok(Err((
                        PackError::TarFormat("sparse member without realsize".to_string()),
                        record_size,
                    )))
                }
            };
            let (segments, consumed) = self.read_sparse_1_0_map()?;
            if consumed > record_size {
                return Err(PackError::TarFormat(
                    "sparse map longer than payload".to_string(),
                ));
            }
            record_size -= consumed;
            sparse = Some(SparseMap::new(segments, actual_size));
        } else {
            match pax.sparse.into_map() {
                Ok(Some(map)) => {
                    actual_size = map.segments.last().map(|s| s.offset).unwrap_or(0);
                    sparse = Some(map);
                }
                Ok(None) => {}
                Err(e) => return Ok(Err((e, record_size))),
            }
        }

        let name = skippable!(canonicalize_name(&raw_name));

        let link_target = longlink.or(pax.linkpath).or_else(|| {
            let link = block.linkname();
            if link.is_empty() {
                None
            } else {
                Some(link.to_vec())
            }
        });

        let mode = skippable!(block.mode()) as u16 & 0o7777;
        let uid = match pax.uid.or(self.global.uid) {
            Some(uid) => uid,
            None => skippable!(block.uid()) as u32,
        };
        let gid = match pax.gid.or(self.global.gid) {
            Some(gid) => gid,
            None => skippable!(block.gid()) as u32,
        };
        let mtime = match pax.mtime.or(self.global.mtime) {
            Some(mtime) => mtime,
            None => skippable!(block.mtime()).min(u64::from(u32::MAX)) as u32,
        };

        let devno = if matches!(kind, EntryKind::CharDevice | EntryKind::BlockDevice) {
            let major = skippable!(block.devmajor()) as u32;
            let minor = skippable!(block.devminor()) as u32;
            encode_dev(major, minor)
        } else {
            0
        };

        Ok(Ok(TarHeader {
            name,
            kind,
            mode,
            uid,
            gid,
            mtime,
            record_size,
            actual_size,
            link_target,
            devno,
            sparse,
            xattrs: pax.xattrs,
        }))
    }
}

enum Skipped {
    Recovered,
    Fatal(PackError),
}

/// Make a tar member name root-relative: strip leading separators, resolve
/// `.`/`..`, refuse paths that escape the root. The empty result names the
/// root itself (e.g. a `./` member).
pub fn canonicalize_name(raw: &[u8]) -> Result<Vec<u8>, PackError> {
    let mut parts: Vec<&[u8]> = vec![];
    for component in raw.split(|b| *b == b'/') {
        match component {
            b"" | b"." => continue,
            b".." => {
                if parts.pop().is_none() {
                    return Err(PackError::TarFormat(format!(
                        "path escapes archive root: {}",
                        String::from_utf8_lossy(raw)
                    )));
                }
            }
            part => parts.push(part),
        }
    }
    Ok(parts.join(&b'/'))
}

/// Linux device number encoding
fn encode_dev(major: u32, minor: u32) -> u32 {
    (minor & 0xff) | ((major & 0xfff) << 8) | ((minor & !0xff) << 12)
}


#[cfg(test)]
mod tests {
    use super::testutil::{pad_payload, raw_header, terminate};
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_plain_file() {
        let mut archive = vec![];
        archive.extend_from_slice(&raw_header(b"dir/file.txt", b'0', 5, 0o644, 1000));
        pad_payload(&mut archive, b"hello");
        terminate(&mut archive);

        let mut reader = TarReader::new(Cursor::new(archive), false);
        let header = reader.read_header().unwrap().unwrap();
        assert_eq!(header.name, b"dir/file.txt");
        assert_eq!(header.kind, EntryKind::File);
        assert_eq!(header.mode, 0o644);
        assert_eq!(header.uid, 1000);
        assert_eq!(header.record_size, 5);

        let mut payload = String::new();
        reader.payload_reader(5).read_to_string(&mut payload).unwrap();
        assert_eq!(payload, "hello");
        reader.skip_padding(5).unwrap();
        assert!(reader.read_header().unwrap().is_none());
    }

    #[test]
    fn test_empty_archive() {
        let mut archive = vec![];
        terminate(&mut archive);
        let mut reader = TarReader::new(Cursor::new(archive), false);
        assert!(reader.read_header().unwrap().is_none());
    }

    #[test]
    fn test_gnu_longname() {
        let long = [b'a'; 200];
        let mut name = long.to_vec();
        name.extend_from_slice(b"/file");

        let mut archive = vec![];
        archive.extend_from_slice(&raw_header(b"././@LongLink", b'L', name.len() as u64, 0, 0));
        pad_payload(&mut archive, &name);
        archive.extend_from_slice(&raw_header(b"short", b'0', 0, 0o600, 0));
        terminate(&mut archive);

        let mut reader = TarReader::new(Cursor::new(archive), false);
        let header = reader.read_header().unwrap().unwrap();
        assert_eq!(header.name, name);
    }

    #[test]
    fn test_escaping_path_is_skipped() {
        let mut archive = vec![];
        archive.extend_from_slice(&raw_header(b"../evil", b'0', 4, 0o644, 0));
        pad_payload(&mut archive, b"evil");
        archive.extend_from_slice(&raw_header(b"good", b'0', 0, 0o644, 0));
        terminate(&mut archive);

        let mut reader = TarReader::new(Cursor::new(archive), false);
        let header = reader.read_header().unwrap().unwrap();
        assert_eq!(header.name, b"good");
        assert!(reader.read_header().unwrap().is_none());
    }

    #[test]
    fn test_escaping_path_is_fatal_in_strict_mode() {
        let mut archive = vec![];
        archive.extend_from_slice(&raw_header(b"../evil", b'0', 4, 0o644, 0));
        pad_payload(&mut archive, b"evil");
        terminate(&mut archive);

        let mut reader = TarReader::new(Cursor::new(archive), true);
        assert!(reader.read_header().is_err());
    }

    #[test]
    fn test_pax_overrides() {
        let pax_payload = {
            let mut p = vec![];
            p.extend_from_slice(b"31 path=override/long/name.txt\n");
            p.extend_from_slice(b"20 mtime=1650000000\n");
            p
        };
        let mut archive = vec![];
        archive.extend_from_slice(&raw_header(
            b"PaxHeaders/name.txt",
            b'x',
            pax_payload.len() as u64,
            0o644,
            0,
        ));
        pad_payload(&mut archive, &pax_payload);
        archive.extend_from_slice(&raw_header(b"name.txt", b'0', 3, 0o644, 7));
        pad_payload(&mut archive, b"abc");
        terminate(&mut archive);

        let mut reader = TarReader::new(Cursor::new(archive), false);
        let header = reader.read_header().unwrap().unwrap();
        assert_eq!(header.name, b"override/long/name.txt");
        assert_eq!(header.mtime, 1_650_000_000);
        assert_eq!(header.uid, 7);
    }

    #[test]
    fn test_old_gnu_sparse() {
        let mut block = raw_header(b"sparse.bin", b'S', 1024, 0o644, 0);
        // two data segments of 512 bytes at offsets 0 and 4096
        block[386..397].copy_from_slice(format!("{:011o}", 0).as_bytes());
        block[398..409].copy_from_slice(format!("{:011o}", 512).as_bytes());
        block[410..421].copy_from_slice(format!("{:011o}", 4096).as_bytes());
        block[422..433].copy_from_slice(format!("{:011o}", 512).as_bytes());
        block[483..494].copy_from_slice(format!("{:011o}", 8192).as_bytes());
        // fix checksum after poking the sparse region
        block[148..156].copy_from_slice(b"        ");
        let sum: u64 = block.iter().map(|b| u64::from(*b)).sum();
        block[148..156].copy_from_slice(format!("{sum:06o}\0 ").as_bytes());

        let mut archive = vec![];
        archive.extend_from_slice(&block);
        pad_payload(&mut archive, &[0xabu8; 1024]);
        terminate(&mut archive);

        let mut reader = TarReader::new(Cursor::new(archive), false);
        let header = reader.read_header().unwrap().unwrap();
        assert_eq!(header.kind, EntryKind::File);
        assert_eq!(header.record_size, 1024);
        assert_eq!(header.actual_size, 8192);
        let map = header.sparse.unwrap();
        map.validate(1024, 8192).unwrap();
        assert_eq!(map.segments[1].offset, 4096);
    }

    #[test]
    fn test_unknown_typeflag_is_reported() {
        let mut archive = vec![];
        archive.extend_from_slice(&raw_header(b"strange", b'Z', 0, 0o644, 0));
        terminate(&mut archive);

        let mut reader = TarReader::new(Cursor::new(archive), false);
        let header = reader.read_header().unwrap().unwrap();
        assert_eq!(header.kind, EntryKind::Unknown(b'Z'));
    }

    #[test]
    fn test_canonicalize() {
        assert_eq!(canonicalize_name(b"/abs/path").unwrap(), b"abs/path");
        assert_eq!(canonicalize_name(b"./a/./b/").unwrap(), b"a/b");
        assert_eq!(canonicalize_name(b"a/b/../c").unwrap(), b"a/c");
        assert_eq!(canonicalize_name(b"./").unwrap(), b"");
        assert!(canonicalize_name(b"../evil").is_err());
        assert!(canonicalize_name(b"a/../../evil").is_err());
    }
}
