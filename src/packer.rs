//! End-to-end packing pipeline
//!
//! Decodes tar members from the input stream, grows the filesystem tree,
//! streams file payloads through the parallel data writer and hands the
//! finished tree to the serializer.

use std::io::Read;
use std::sync::Arc;

use tracing::{info, warn};

use crate::compressor::FilesystemCompressor;
use crate::data::DataWriter;
use crate::error::PackError;
use crate::serializer::{ImageConfig, Serializer};
use crate::sink::Sink;
use crate::superblock::SuperBlock;
use crate::tar::{EntryKind, SparseExpandReader, TarHeader, TarReader};
use crate::tree::{FileInfo, FsTree, NodeHeader, NodePayload};
use crate::xattr::XattrStore;
use crate::{DEFAULT_BLOCK_SIZE, DEFAULT_DEV_BLOCK_SIZE, MAX_BLOCK_SIZE, MIN_BLOCK_SIZE, MIN_DEV_BLOCK_SIZE};

/// Attributes applied to implied directories, and to every entry unless
/// `--keep-time` retains the archive's timestamps
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Defaults {
    pub uid: u32,
    pub gid: u32,
    pub mode: u16,
    pub mtime: u32,
}

impl Default for Defaults {
    fn default() -> Self {
        Self { uid: 0, gid: 0, mode: 0o755, mtime: 0 }
    }
}

/// Everything the pipeline needs to know, threaded explicitly instead of
/// living in process-wide state
#[derive(Debug, Clone)]
pub struct Config {
    pub compressor: FilesystemCompressor,
    pub block_size: u32,
    pub dev_block_size: u32,
    pub num_jobs: usize,
    /// Inflight block limit; 0 selects `10 × num_jobs`
    pub max_backlog: usize,
    pub defaults: Defaults,
    /// `--no-skip`: treat recoverable tar problems as fatal
    pub strict: bool,
    pub no_xattr: bool,
    pub keep_time: bool,
    pub exportable: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            compressor: FilesystemCompressor::default(),
            block_size: DEFAULT_BLOCK_SIZE,
            dev_block_size: DEFAULT_DEV_BLOCK_SIZE,
            num_jobs: 1,
            max_backlog: 0,
            defaults: Defaults::default(),
            strict: false,
            no_xattr: false,
            keep_time: false,
            exportable: false,
        }
    }
}

impl Config {
    fn validate(&self) -> Result<(), PackError> {
        if !(MIN_BLOCK_SIZE..=MAX_BLOCK_SIZE).contains(&self.block_size)
            || !self.block_size.is_power_of_two()
        {
            return Err(PackError::Internal(format!(
                "block size {} is not a power of two in [{MIN_BLOCK_SIZE}, {MAX_BLOCK_SIZE}]",
                self.block_size
            )));
        }
        if self.dev_block_size < MIN_DEV_BLOCK_SIZE {
            return Err(PackError::Internal(format!(
                "device block size {} is below {MIN_DEV_BLOCK_SIZE}",
                self.dev_block_size
            )));
        }
        Ok(())
    }

    fn backlog(&self) -> usize {
        if self.max_backlog == 0 {
            10 * self.num_jobs.max(1)
        } else {
            self.max_backlog
        }
    }
}

/// Pack the tar archive read from `input` into a SquashFS image on `sink`
pub fn pack<R: Read>(
    config: &Config,
    input: R,
    sink: Arc<dyn Sink>,
) -> Result<SuperBlock, PackError> {
    config.validate()?;

    // placeholder superblock; finalized after every table lands
    sink.write_at(0, &[0u8; 96]).map_err(PackError::OutputIo)?;

    let defaults = NodeHeader {
        mode: config.defaults.mode,
        uid: config.defaults.uid,
        gid: config.defaults.gid,
        mtime: config.defaults.mtime,
    };
    let mut tree = FsTree::new(defaults);
    let mut store = XattrStore::new();
    let mut reader = TarReader::new(input, config.strict);
    let mut data_writer = DataWriter::new(
        Arc::clone(&sink),
        config.compressor,
        config.block_size,
        96,
        config.num_jobs.max(1),
        config.backlog(),
    );

    info!("Reading tar stream");
    while let Some(header) = reader.read_header()? {
        if let Err(e) = ingest(
            config,
            &mut tree,
            &mut store,
            &mut reader,
            &mut data_writer,
            header,
        )? {
            // recoverable problem with this member: already skipped past it
            warn!("{e}, skipping entry");
        }
    }

    info!("Waiting for data writer");
    let results = data_writer.finish()?;

    tree.sort_recursive();
    tree.dedup_xattr(&mut store);
    let inode_table = tree.gen_inode_table();

    let serializer = Serializer::new(
        sink.as_ref(),
        &tree,
        &results,
        &store,
        config.compressor,
        ImageConfig {
            block_size: config.block_size,
            dev_block_size: config.dev_block_size,
            mod_time: config.defaults.mtime,
            exportable: config.exportable,
        },
    );
    serializer.write(&inode_table)
}

/// Handle one decoded member. The outer `Result` is fatal; the inner one is a
/// recoverable per-member problem that was skipped over (fatal under
/// `--no-skip`).
fn ingest<R: Read>(
    config: &Config,
    tree: &mut FsTree,
    store: &mut XattrStore,
    reader: &mut TarReader<R>,
    data_writer: &mut DataWriter,
    header: TarHeader,
) -> Result<Result<(), PackError>, PackError> {
    let name = String::from_utf8_lossy(&header.name).into_owned();
    let record_size = header.record_size;
    let recover = |reader: &mut TarReader<R>,
                   e: PackError|
     -> Result<Result<(), PackError>, PackError> {
        if config.strict {
            return Err(e);
        }
        reader.skip_entry(record_size)?;
        Ok(Err(e))
    };

    let kind = match header.kind {
        EntryKind::Unknown(flag) => {
            return recover(
                reader,
                PackError::TarFormat(format!("{name}: unknown record type {:?}", flag as char)),
            );
        }
        EntryKind::HardLink => {
            // a hard link's content cannot be recovered from a forward-only
            // stream; only self-contained records (payload present) are usable
            if header.record_size == 0 {
                return recover(
                    reader,
                    PackError::TarFormat(format!("{name}: hard link without payload")),
                );
            }
            EntryKind::File
        }
        kind => kind,
    };

    if let Some(map) = &header.sparse {
        if let Err(e) = map.validate(header.record_size, header.actual_size) {
            return recover(reader, PackError::TarFormat(format!("{name}: {e}")));
        }
    }

    let node_header = NodeHeader {
        mode: header.mode,
        uid: header.uid,
        gid: header.gid,
        mtime: if config.keep_time { header.mtime } else { config.defaults.mtime },
    };

    let payload = match kind {
        EntryKind::File => NodePayload::File(FileInfo { size: header.actual_size, add: None }),
        EntryKind::Directory => NodePayload::Dir { children: vec![] },
        EntryKind::Symlink => match &header.link_target {
            Some(target) => NodePayload::Symlink(target.clone()),
            None => {
                return recover(
                    reader,
                    PackError::TarFormat(format!("{name}: symlink without target")),
                )
            }
        },
        EntryKind::CharDevice => NodePayload::CharDevice(header.devno),
        EntryKind::BlockDevice => NodePayload::BlockDevice(header.devno),
        EntryKind::Fifo => NodePayload::Fifo,
        EntryKind::HardLink | EntryKind::Unknown(_) => unreachable!(),
    };
    let is_file = matches!(payload, NodePayload::File(_));

    let index = match tree.insert(&header.name, node_header, payload) {
        Ok(index) => index,
        Err(e) => return recover(reader, e),
    };

    if !config.no_xattr {
        for (key, value) in &header.xattrs {
            match store.add_pair(key, value) {
                Ok(pair) => tree.add_xattr(index, pair),
                Err(e) if config.strict => return Err(e),
                Err(e) => warn!("{name}: {e}, attribute dropped"),
            }
        }
    }

    if is_file {
        let add = {
            let mut payload = reader.payload_reader(header.record_size);
            match &header.sparse {
                Some(map) => {
                    let mut expanded =
                        SparseExpandReader::new(&mut payload, map, header.actual_size);
                    data_writer.add_file(&mut expanded, header.actual_size)?
                }
                None => data_writer.add_file(&mut payload, header.actual_size)?,
            }
        };
        reader.skip_padding(header.record_size)?;
        if let NodePayload::File(info) = &mut tree.nodes[index].payload {
            info.add = Some(add);
        }
    } else if header.record_size > 0 {
        // non-file member with payload bytes: step over them
        reader.skip_entry(header.record_size)?;
    }

    Ok(Ok(()))
}
