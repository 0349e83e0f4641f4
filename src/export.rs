//! NFS export support

use deku::prelude::*;

pub(crate) const SIZE: usize = std::mem::size_of::<u64>();

/// Lookup-by-inode-number entry: the inode reference for inode `index + 1`
#[derive(Debug, Copy, Clone, DekuRead, DekuWrite, PartialEq, Eq)]
#[deku(endian = "little")]
pub struct Export {
    pub num: u64,
}
