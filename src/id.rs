//! 32 bit user and group IDs

use deku::prelude::*;
use rustc_hash::FxHashMap;

use crate::error::PackError;

pub(crate) const SIZE: usize = std::mem::size_of::<u32>();

#[derive(Debug, Copy, Clone, DekuRead, DekuWrite, PartialEq, Eq)]
#[deku(endian = "little")]
pub struct Id {
    pub num: u32,
}

impl Id {
    pub fn new(num: u32) -> Id {
        Id { num }
    }
}

/// Dense table of every distinct uid/gid in the image. Inodes store 16-bit
/// indices into this.
#[derive(Debug, Default)]
pub(crate) struct IdTable {
    pub(crate) ids: Vec<Id>,
    index: FxHashMap<u32, u16>,
}

impl IdTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return index of id, adding if required
    pub fn lookup_add(&mut self, id: u32) -> Result<u16, PackError> {
        if let Some(index) = self.index.get(&id) {
            return Ok(*index);
        }
        let index = u16::try_from(self.ids.len())
            .map_err(|_| PackError::ResourceExhaustion("more than 65536 distinct ids".to_string()))?;
        self.ids.push(Id::new(id));
        self.index.insert(id, index);
        Ok(index)
    }

    pub fn get(&self, id: u32) -> Option<u16> {
        self.index.get(&id).copied()
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }
}
