//! Sparse file maps
//!
//! A sparse map is an ordered list of `(offset, count)` data segments; the
//! gaps between them are holes. A final zero-count segment marks logical EOF.

use std::io::{self, Read};

use crate::error::PackError;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct SparseSegment {
    pub offset: u64,
    pub count: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SparseMap {
    /// Data segments, terminated by a zero-count segment at logical EOF
    pub segments: Vec<SparseSegment>,
}

impl SparseMap {
    /// Build a map from data segments, appending the EOF terminator
    pub fn new(mut segments: Vec<SparseSegment>, actual_size: u64) -> Self {
        if segments.last().map(|s| s.count != 0).unwrap_or(true) {
            segments.push(SparseSegment { offset: actual_size, count: 0 });
        }
        Self { segments }
    }

    /// Bytes actually present on the wire
    pub fn data_bytes(&self) -> u64 {
        self.segments.iter().map(|s| s.count).sum()
    }

    /// Enforce the map invariants: segments monotonically non-overlapping,
    /// data bytes equal to the wire payload, terminator at logical EOF.
    pub fn validate(&self, record_size: u64, actual_size: u64) -> Result<(), PackError> {
        let terminator = self
            .segments
            .last()
            .ok_or_else(|| PackError::TarFormat("empty sparse map".to_string()))?;
        if terminator.count != 0 || terminator.offset != actual_size {
            return Err(PackError::TarFormat(
                "sparse map not terminated at logical EOF".to_string(),
            ));
        }

        let mut end = 0u64;
        for segment in &self.segments[..self.segments.len() - 1] {
            if segment.offset < end {
                return Err(PackError::TarFormat(
                    "sparse map segments overlap or are out of order".to_string(),
                ));
            }
            end = segment
                .offset
                .checked_add(segment.count)
                .ok_or_else(|| PackError::TarFormat("sparse segment overflows".to_string()))?;
            if end > actual_size {
                return Err(PackError::TarFormat(
                    "sparse segment past logical EOF".to_string(),
                ));
            }
        }

        if self.data_bytes() != record_size {
            return Err(PackError::TarFormat(format!(
                "sparse map data bytes {} do not match payload size {}",
                self.data_bytes(),
                record_size
            )));
        }
        Ok(())
    }
}

/// Expands a sparse wire payload to its logical byte stream, holes as zeros
pub struct SparseExpandReader<'a, R: Read> {
    inner: &'a mut R,
    map: &'a SparseMap,
    /// Index of the segment being copied or approached
    segment: usize,
    /// Bytes of the current segment already copied
    copied: u64,
    /// Logical stream position
    pos: u64,
    actual_size: u64,
}

impl<'a, R: Read> SparseExpandReader<'a, R> {
    pub fn new(inner: &'a mut R, map: &'a SparseMap, actual_size: u64) -> Self {
        Self { inner, map, segment: 0, copied: 0, pos: 0, actual_size }
    }
}

impl<R: Read> Read for SparseExpandReader<'_, R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() || self.pos >= self.actual_size {
            return Ok(0);
        }

        // step over exhausted and terminator segments
        while self.segment < self.map.segments.len() {
            let seg = &self.map.segments[self.segment];
            if seg.count == 0 || self.copied == seg.count {
                self.segment += 1;
                self.copied = 0;
            } else {
                break;
            }
        }

        let limit = (self.actual_size - self.pos) as usize;
        let want = buf.len().min(limit);

        match self.map.segments.get(self.segment) {
            // inside a hole before the next data segment
            Some(seg) if self.pos < seg.offset => {
                let n = want.min((seg.offset - self.pos) as usize);
                buf[..n].fill(0);
                self.pos += n as u64;
                Ok(n)
            }
            // inside a data segment
            Some(seg) => {
                let remaining = (seg.count - self.copied) as usize;
                let n = self.inner.read(&mut buf[..want.min(remaining)])?;
                if n == 0 {
                    return Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "sparse payload ended early",
                    ));
                }
                self.copied += n as u64;
                self.pos += n as u64;
                Ok(n)
            }
            // trailing hole after the last data segment
            None => {
                buf[..want].fill(0);
                self.pos += want as u64;
                Ok(want)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;

    fn map(segments: &[(u64, u64)], actual_size: u64) -> SparseMap {
        SparseMap::new(
            segments.iter().map(|(offset, count)| SparseSegment { offset: *offset, count: *count }).collect(),
            actual_size,
        )
    }

    #[test]
    fn test_validate() {
        let m = map(&[(0, 4), (10, 4)], 20);
        m.validate(8, 20).unwrap();

        // wrong payload size
        assert!(m.validate(9, 20).is_err());
        // overlapping segments
        let bad = map(&[(0, 8), (4, 4)], 20);
        assert!(bad.validate(12, 20).is_err());
        // segment past EOF
        let bad = map(&[(18, 4)], 20);
        assert!(bad.validate(4, 20).is_err());
    }

    #[test]
    fn test_all_holes_map_is_valid() {
        let m = map(&[], 32);
        m.validate(0, 32).unwrap();
        assert_eq!(m.data_bytes(), 0);
    }

    #[test]
    fn test_expansion() {
        let m = map(&[(2, 3), (8, 2)], 12);
        m.validate(5, 12).unwrap();

        let wire = b"abcde";
        let mut inner = Cursor::new(&wire[..]);
        let mut reader = SparseExpandReader::new(&mut inner, &m, 12);
        let mut out = vec![];
        reader.read_to_end(&mut out).unwrap();

        assert_eq!(out, b"\0\0abc\0\0\0de\0\0");
    }

    #[test]
    fn test_expansion_of_all_holes() {
        let m = map(&[], 7);
        let mut inner = Cursor::new(&b""[..]);
        let mut reader = SparseExpandReader::new(&mut inner, &m, 7);
        let mut out = vec![];
        reader.read_to_end(&mut out).unwrap();
        assert_eq!(out, vec![0u8; 7]);
    }

    #[test]
    fn test_short_payload_is_an_error() {
        let m = map(&[(0, 4)], 4);
        let mut inner = Cursor::new(&b"ab"[..]);
        let mut reader = SparseExpandReader::new(&mut inner, &m, 4);
        let mut out = vec![];
        assert!(reader.read_to_end(&mut out).is_err());
    }
}
