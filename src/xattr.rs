//! Extended attribute storage and deduplication

use deku::prelude::*;
use rustc_hash::FxHashMap;

use crate::error::PackError;
use crate::inode::XATTR_NOT_SET;

/// Attribute namespaces SquashFS can store. Everything else is dropped (or
/// fatal in strict mode).
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[repr(u16)]
pub enum XattrPrefix {
    User = 0,
    Trusted = 1,
    Security = 2,
}

impl XattrPrefix {
    /// Split `user.foo` into `(XattrPrefix::User, b"foo")`
    pub fn split(key: &[u8]) -> Option<(XattrPrefix, &[u8])> {
        for (prefix, id) in [
            (&b"user."[..], XattrPrefix::User),
            (&b"trusted."[..], XattrPrefix::Trusted),
            (&b"security."[..], XattrPrefix::Security),
        ] {
            if let Some(rest) = key.strip_prefix(prefix) {
                if !rest.is_empty() {
                    return Some((id, rest));
                }
            }
        }
        None
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            XattrPrefix::User => "user.",
            XattrPrefix::Trusted => "trusted.",
            XattrPrefix::Security => "security.",
        }
    }
}

/// One key record in the key/value metadata stream, name stored without its
/// namespace prefix
#[derive(Debug, DekuRead, DekuWrite, Clone, PartialEq, Eq)]
#[deku(endian = "little")]
pub struct XattrKey {
    pub t: u16,
    pub name_size: u16,
    #[deku(count = "name_size")]
    pub name: Vec<u8>,
}

/// The value record following each key record
#[derive(Debug, DekuRead, DekuWrite, Clone, PartialEq, Eq)]
#[deku(endian = "little")]
pub struct XattrValue {
    pub value_size: u32,
    #[deku(count = "value_size")]
    pub value: Vec<u8>,
}

/// One entry of the xattr id table: where a deduplicated attribute set lives
/// in the key/value stream
#[derive(Debug, Copy, Clone, DekuRead, DekuWrite, PartialEq, Eq)]
#[deku(endian = "little")]
pub struct XattrId {
    /// `(metadata block start << 16) | offset` into the key/value stream
    pub xattr_ref: u64,
    /// Number of key/value pairs in the set
    pub count: u32,
    /// Uncompressed byte size of the set's records
    pub size: u32,
}

/// Header placed at `superblock.xattr_table`
#[derive(Debug, Copy, Clone, DekuRead, DekuWrite, PartialEq, Eq)]
#[deku(endian = "little")]
pub struct XattrTableHeader {
    /// Absolute offset of the first key/value metadata block
    pub kv_start: u64,
    pub xattr_ids: u32,
    pub unused: u32,
}

/// Deduplicating attribute store.
///
/// Every distinct key and value is interned once; every node's attribute list
/// collapses to a sorted `(key_id, value_id)` list, and structurally equal
/// lists share one xattr index.
#[derive(Debug, Default)]
pub(crate) struct XattrStore {
    pub(crate) keys: Vec<(XattrPrefix, Vec<u8>)>,
    key_index: FxHashMap<Vec<u8>, u32>,
    pub(crate) values: Vec<Vec<u8>>,
    value_index: FxHashMap<Vec<u8>, u32>,
    pub(crate) sets: Vec<Vec<(u32, u32)>>,
    set_index: FxHashMap<Vec<(u32, u32)>, u32>,
}

impl XattrStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Intern one `key=value` pair, returning `(key_id, value_id)`.
    /// Keys outside the `user.`/`trusted.`/`security.` namespaces are refused.
    pub fn add_pair(&mut self, key: &[u8], value: &[u8]) -> Result<(u32, u32), PackError> {
        let (prefix, name) = XattrPrefix::split(key).ok_or_else(|| {
            PackError::UnsupportedXattr(String::from_utf8_lossy(key).into_owned())
        })?;

        let key_id = match self.key_index.get(key) {
            Some(id) => *id,
            None => {
                let id = self.keys.len() as u32;
                self.keys.push((prefix, name.to_vec()));
                self.key_index.insert(key.to_vec(), id);
                id
            }
        };
        let value_id = match self.value_index.get(value) {
            Some(id) => *id,
            None => {
                let id = self.values.len() as u32;
                self.values.push(value.to_vec());
                self.value_index.insert(value.to_vec(), id);
                id
            }
        };
        Ok((key_id, value_id))
    }

    /// Collapse a node's working pair list to its deduplicated set index.
    /// Returns [`XATTR_NOT_SET`] for an empty list.
    pub fn intern_set(&mut self, mut pairs: Vec<(u32, u32)>) -> u32 {
        if pairs.is_empty() {
            return XATTR_NOT_SET;
        }
        pairs.sort_unstable_by_key(|(key_id, _)| *key_id);
        pairs.dedup();

        if let Some(index) = self.set_index.get(&pairs) {
            return *index;
        }
        let index = self.sets.len() as u32;
        self.sets.push(pairs.clone());
        self.set_index.insert(pairs, index);
        index
    }

    pub fn is_empty(&self) -> bool {
        self.sets.is_empty()
    }

    /// Serialized key/value records of one set, as they land in the stream
    pub fn set_records(&self, set: &[(u32, u32)]) -> Result<Vec<u8>, PackError> {
        let mut bytes = vec![];
        for (key_id, value_id) in set {
            let (prefix, name) = &self.keys[*key_id as usize];
            let value = &self.values[*value_id as usize];
            let key = XattrKey {
                t: *prefix as u16,
                name_size: name.len() as u16,
                name: name.clone(),
            };
            let val = XattrValue { value_size: value.len() as u32, value: value.clone() };
            bytes.extend_from_slice(&key.to_bytes()?);
            bytes.extend_from_slice(&val.to_bytes()?);
        }
        Ok(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prefix_split() {
        assert_eq!(
            XattrPrefix::split(b"user.foo"),
            Some((XattrPrefix::User, &b"foo"[..]))
        );
        assert_eq!(
            XattrPrefix::split(b"security.selinux"),
            Some((XattrPrefix::Security, &b"selinux"[..]))
        );
        assert_eq!(XattrPrefix::split(b"system.posix_acl_access"), None);
        assert_eq!(XattrPrefix::split(b"user."), None);
    }

    #[test]
    fn test_identical_sets_share_an_index() {
        let mut store = XattrStore::new();

        let a1 = store.add_pair(b"user.foo", b"1").unwrap();
        let a2 = store.add_pair(b"user.bar", b"2").unwrap();
        let first = store.intern_set(vec![a1, a2]);

        // same pairs in the other order, interned separately
        let b2 = store.add_pair(b"user.bar", b"2").unwrap();
        let b1 = store.add_pair(b"user.foo", b"1").unwrap();
        let second = store.intern_set(vec![b2, b1]);

        assert_eq!(first, second);
        assert_eq!(store.sets.len(), 1);
        assert_eq!(store.keys.len(), 2);

        let different = store.intern_set(vec![a1]);
        assert_ne!(first, different);
    }

    #[test]
    fn test_empty_set_is_not_set() {
        let mut store = XattrStore::new();
        assert_eq!(store.intern_set(vec![]), XATTR_NOT_SET);
        assert!(store.is_empty());
    }

    #[test]
    fn test_unsupported_prefix_is_refused() {
        let mut store = XattrStore::new();
        let err = store.add_pair(b"system.posix_acl_access", b"x").unwrap_err();
        assert!(matches!(err, PackError::UnsupportedXattr(_)));
    }
}
