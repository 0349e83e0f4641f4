//! PAX extended header records
//!
//! The payload of an `x` (per-entry) or `g` (global) record is a sequence of
//! `"<len> <key>=<value>\n"` fields; `len` counts the entire field.

use base64::alphabet;
use base64::engine::{DecodePaddingMode, GeneralPurpose, GeneralPurposeConfig};
use base64::Engine;
use tracing::warn;

use crate::error::PackError;
use crate::tar::sparse::{SparseMap, SparseSegment};

/// libarchive writes standard-alphabet base64, with or without padding
const BASE64: GeneralPurpose = GeneralPurpose::new(
    &alphabet::STANDARD,
    GeneralPurposeConfig::new().with_decode_padding_mode(DecodePaddingMode::Indifferent),
);

const SCHILY_XATTR: &[u8] = b"SCHILY.xattr.";
const LIBARCHIVE_XATTR: &[u8] = b"LIBARCHIVE.xattr.";

/// Accumulator for the `GNU.sparse.*` key family.
///
/// Version 0.0 delivers the map as alternating `offset`/`numbytes` keys, so
/// decoding is a two-state machine: waiting for an offset, then waiting for
/// the matching byte count before the pair commits.
#[derive(Debug, Default)]
pub(crate) struct PaxSparse {
    major: Option<u64>,
    minor: Option<u64>,
    /// Logical size for map versions 0.0/0.1
    size: Option<u64>,
    /// Logical size for map version 1.0
    realsize: Option<u64>,
    /// Entry name override for map version 1.0
    pub(crate) name: Option<Vec<u8>>,
    /// Comma-separated `offset,count` list of version 0.1
    map: Option<Vec<u8>>,
    segments: Vec<SparseSegment>,
    state: PairState,
}

#[derive(Debug, Default, PartialEq, Eq)]
enum PairState {
    #[default]
    WantOffset,
    WantCount(u64),
}

impl PaxSparse {
    fn is_present(&self) -> bool {
        self.major.is_some()
            || self.size.is_some()
            || self.map.is_some()
            || !self.segments.is_empty()
    }

    /// The payload itself starts with the map (version 1.0)
    pub fn map_in_payload(&self) -> bool {
        self.major == Some(1) && self.minor.unwrap_or(0) == 0
    }

    pub fn actual_size(&self) -> Option<u64> {
        self.realsize.or(self.size)
    }

    /// Resolve versions 0.0/0.1 into a sparse map; 1.0 maps live in the
    /// payload and are read by the caller.
    pub fn into_map(self) -> Result<Option<SparseMap>, PackError> {
        if !self.is_present() {
            return Ok(None);
        }
        if self.map_in_payload() {
            return Err(PackError::Internal(
                "version 1.0 sparse map must be read from the payload".to_string(),
            ));
        }
        let actual_size = self
            .size
            .ok_or_else(|| PackError::TarFormat("sparse map without GNU.sparse.size".to_string()))?;

        let segments = if let Some(map) = self.map {
            // version 0.1: "offset,count,offset,count,..."
            let mut numbers = vec![];
            for part in map.split(|b| *b == b',') {
                numbers.push(parse_decimal(part)?);
            }
            if numbers.len() % 2 != 0 {
                return Err(PackError::TarFormat("odd GNU.sparse.map".to_string()));
            }
            numbers
                .chunks_exact(2)
                .map(|pair| SparseSegment { offset: pair[0], count: pair[1] })
                .collect()
        } else {
            if self.state != PairState::WantOffset {
                return Err(PackError::TarFormat(
                    "GNU.sparse.offset without matching numbytes".to_string(),
                ));
            }
            self.segments
        };

        Ok(Some(SparseMap::new(segments, actual_size)))
    }
}

/// Everything a PAX header can override on the following entry
#[derive(Debug, Default)]
pub(crate) struct PaxData {
    pub path: Option<Vec<u8>>,
    pub linkpath: Option<Vec<u8>>,
    pub size: Option<u64>,
    pub mtime: Option<u32>,
    pub uid: Option<u32>,
    pub gid: Option<u32>,
    pub xattrs: Vec<(Vec<u8>, Vec<u8>)>,
    pub sparse: PaxSparse,
}

impl PaxData {
    /// Fold a later PAX header into this one: scalar fields override,
    /// attribute lists append
    pub fn merge(&mut self, other: PaxData) {
        if other.path.is_some() {
            self.path = other.path;
        }
        if other.linkpath.is_some() {
            self.linkpath = other.linkpath;
        }
        self.size = other.size.or(self.size);
        self.mtime = other.mtime.or(self.mtime);
        self.uid = other.uid.or(self.uid);
        self.gid = other.gid.or(self.gid);
        self.xattrs.extend(other.xattrs);
        if other.sparse.is_present() {
            self.sparse = other.sparse;
        }
    }

    /// Decode one PAX payload. `strict` promotes malformed fields to errors.
    pub fn parse(payload: &[u8], strict: bool) -> Result<Self, PackError> {
        let mut data = PaxData::default();
        let mut rest = payload;
        while !rest.is_empty() && rest[0] != 0 {
            let (key, value, next) = split_record(rest)?;
            if let Err(e) = data.apply(key, value) {
                if strict {
                    return Err(e);
                }
                warn!("ignoring pax field: {e}");
            }
            rest = next;
        }
        Ok(data)
    }

    fn apply(&mut self, key: &[u8], value: &[u8]) -> Result<(), PackError> {
        match key {
            b"path" => self.path = Some(value.to_vec()),
            b"linkpath" => self.linkpath = Some(value.to_vec()),
            b"size" => self.size = Some(parse_decimal(value)?),
            b"mtime" => self.mtime = Some(parse_seconds(value)?),
            b"uid" => self.uid = Some(parse_decimal(value)? as u32),
            b"gid" => self.gid = Some(parse_decimal(value)? as u32),
            // numeric ids win over names
            b"uname" | b"gname" => {}
            b"GNU.sparse.major" => self.sparse.major = Some(parse_decimal(value)?),
            b"GNU.sparse.minor" => self.sparse.minor = Some(parse_decimal(value)?),
            b"GNU.sparse.name" => self.sparse.name = Some(value.to_vec()),
            b"GNU.sparse.realsize" => self.sparse.realsize = Some(parse_decimal(value)?),
            b"GNU.sparse.size" => self.sparse.size = Some(parse_decimal(value)?),
            b"GNU.sparse.numblocks" => {
                self.sparse.segments.reserve(parse_decimal(value)? as usize);
            }
            b"GNU.sparse.offset" => match self.sparse.state {
                PairState::WantOffset => {
                    self.sparse.state = PairState::WantCount(parse_decimal(value)?);
                }
                PairState::WantCount(_) => {
                    return Err(PackError::TarFormat(
                        "GNU.sparse.offset repeated without numbytes".to_string(),
                    ))
                }
            },
            b"GNU.sparse.numbytes" => match self.sparse.state {
                PairState::WantCount(offset) => {
                    self.sparse.segments.push(SparseSegment {
                        offset,
                        count: parse_decimal(value)?,
                    });
                    self.sparse.state = PairState::WantOffset;
                }
                PairState::WantOffset => {
                    return Err(PackError::TarFormat(
                        "GNU.sparse.numbytes without offset".to_string(),
                    ))
                }
            },
            b"GNU.sparse.map" => self.sparse.map = Some(value.to_vec()),
            _ if key.starts_with(SCHILY_XATTR) => {
                let name = key[SCHILY_XATTR.len()..].to_vec();
                self.xattrs.push((name, value.to_vec()));
            }
            _ if key.starts_with(LIBARCHIVE_XATTR) => {
                let name = key[LIBARCHIVE_XATTR.len()..].to_vec();
                let decoded = BASE64.decode(value).map_err(|e| {
                    PackError::TarFormat(format!(
                        "bad base64 xattr value for {}: {e}",
                        String::from_utf8_lossy(&name)
                    ))
                })?;
                self.xattrs.push((name, decoded));
            }
            // unrecognized keys are allowed and ignored
            _ => {}
        }
        Ok(())
    }
}

/// Split `"<len> <key>=<value>\n..."` into its first field and the rest
fn split_record(input: &[u8]) -> Result<(&[u8], &[u8], &[u8]), PackError> {
    let malformed = || PackError::TarFormat("malformed pax record".to_string());

    let space = input.iter().position(|b| *b == b' ').ok_or_else(malformed)?;
    let len = parse_decimal(&input[..space])? as usize;
    if len <= space + 1 || len > input.len() {
        return Err(malformed());
    }
    let record = &input[space + 1..len];
    if record.last() != Some(&b'\n') {
        return Err(malformed());
    }
    let record = &record[..record.len() - 1];
    let eq = record.iter().position(|b| *b == b'=').ok_or_else(malformed)?;
    Ok((&record[..eq], &record[eq + 1..], &input[len..]))
}

pub(crate) fn parse_decimal(field: &[u8]) -> Result<u64, PackError> {
    if field.is_empty() {
        return Err(PackError::TarFormat("empty numeric pax field".to_string()));
    }
    let mut n: u64 = 0;
    for b in field {
        if !b.is_ascii_digit() {
            return Err(PackError::TarFormat(format!(
                "illegal decimal character {:#02x}",
                b
            )));
        }
        n = n
            .checked_mul(10)
            .and_then(|n| n.checked_add(u64::from(b - b'0')))
            .ok_or_else(|| PackError::TarFormat("decimal pax field overflow".to_string()))?;
    }
    Ok(n)
}

/// `mtime` may carry subsecond digits; negative times clamp to zero
fn parse_seconds(field: &[u8]) -> Result<u32, PackError> {
    if field.first() == Some(&b'-') {
        return Ok(0);
    }
    let whole = match field.iter().position(|b| *b == b'.') {
        Some(dot) => &field[..dot],
        None => field,
    };
    Ok(parse_decimal(whole)?.min(u64::from(u32::MAX)) as u32)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(key: &str, value: &[u8]) -> Vec<u8> {
        // +3: space, equals, newline
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

    #[test]
    fn test_basic_fields() {
        let mut payload = record("path", b"some/dir/file");
        payload.extend(record("size", b"1234"));
        payload.extend(record("mtime", b"1650000000.5"));
        payload.extend(record("uid", b"1000"));

        let data = PaxData::parse(&payload, true).unwrap();
        assert_eq!(data.path.as_deref(), Some(&b"some/dir/file"[..]));
        assert_eq!(data.size, Some(1234));
        assert_eq!(data.mtime, Some(1_650_000_000));
        assert_eq!(data.uid, Some(1000));
        assert!(data.sparse.into_map().unwrap().is_none());
    }

    #[test]
    fn test_xattrs() {
        let mut payload = record("SCHILY.xattr.user.foo", b"bar");
        payload.extend(record("LIBARCHIVE.xattr.security.selinux", b"c2VjcmV0"));

        let data = PaxData::parse(&payload, true).unwrap();
        assert_eq!(
            data.xattrs,
            vec![
                (b"user.foo".to_vec(), b"bar".to_vec()),
                (b"security.selinux".to_vec(), b"secret".to_vec()),
            ]
        );
    }

    #[test]
    fn test_sparse_0_0() {
        let mut payload = record("GNU.sparse.size", b"100");
        payload.extend(record("GNU.sparse.numblocks", b"2"));
        payload.extend(record("GNU.sparse.offset", b"0"));
        payload.extend(record("GNU.sparse.numbytes", b"10"));
        payload.extend(record("GNU.sparse.offset", b"50"));
        payload.extend(record("GNU.sparse.numbytes", b"10"));

        let data = PaxData::parse(&payload, true).unwrap();
        let map = data.sparse.into_map().unwrap().unwrap();
        map.validate(20, 100).unwrap();
        assert_eq!(map.segments.len(), 3);
        assert_eq!(map.segments[1], SparseSegment { offset: 50, count: 10 });
    }

    #[test]
    fn test_sparse_0_1() {
        let mut payload = record("GNU.sparse.size", b"64");
        payload.extend(record("GNU.sparse.map", b"8,4,32,4"));

        let data = PaxData::parse(&payload, true).unwrap();
        let map = data.sparse.into_map().unwrap().unwrap();
        map.validate(8, 64).unwrap();
        assert_eq!(map.segments[0], SparseSegment { offset: 8, count: 4 });
    }

    #[test]
    fn test_sparse_1_0_defers_to_payload() {
        let mut payload = record("GNU.sparse.major", b"1");
        payload.extend(record("GNU.sparse.minor", b"0"));
        payload.extend(record("GNU.sparse.name", b"big.bin"));
        payload.extend(record("GNU.sparse.realsize", b"4096"));

        let data = PaxData::parse(&payload, true).unwrap();
        assert!(data.sparse.map_in_payload());
        assert_eq!(data.sparse.actual_size(), Some(4096));
        assert_eq!(data.sparse.name.as_deref(), Some(&b"big.bin"[..]));
    }

    #[test]
    fn test_dangling_sparse_offset_is_rejected() {
        let mut payload = record("GNU.sparse.size", b"100");
        payload.extend(record("GNU.sparse.offset", b"0"));

        let data = PaxData::parse(&payload, true).unwrap();
        assert!(data.sparse.into_map().is_err());
    }

    #[test]
    fn test_malformed_record() {
        assert!(PaxData::parse(b"7 x=y\n", true).is_err());
        assert!(PaxData::parse(b"junk", true).is_err());
    }
}
