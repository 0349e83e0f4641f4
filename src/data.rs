//! File Data
//!
//! Regular file payloads are chunked into blocks, compressed on a pool of
//! worker threads and written strictly in submission order by a single writer
//! task. Duplicate blocks are resolved by the producer against already
//! written data before they ever enter the queue; tails smaller than a block
//! are packed into shared fragment blocks.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, VecDeque};
use std::io::Read;
use std::mem;
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::{Arc, Mutex, Weak};
use std::thread::{self, JoinHandle};

use crossbeam_channel::{bounded, unbounded, Receiver, Sender};
use deku::prelude::*;
use rustc_hash::FxHashMap;
use tracing::trace;
use xxhash_rust::xxh64::xxh64;

use crate::compressor::{self, FilesystemCompressor};
use crate::error::PackError;
use crate::fragment::Fragment;
use crate::inode::FRAG_NOT_SET;
use crate::sink::Sink;

// bitflag for data size field in inode for signifying that the data is uncompressed
const DATA_STORED_UNCOMPRESSED: u32 = 1 << 24;

/// On-disk size of one block, with the high bit flagging uncompressed storage.
/// A size of zero marks a hole (block of zeros that was never stored).
#[derive(Copy, Clone, Debug, PartialEq, Eq, DekuRead, DekuWrite)]
#[deku(endian = "endian", ctx = "endian: deku::ctx::Endian")]
pub struct DataSize(u32);

impl DataSize {
    #[inline]
    pub fn new(size: u32, uncompressed: bool) -> Self {
        let mut value: u32 = size;
        if value > DATA_STORED_UNCOMPRESSED {
            panic!("value is too big");
        }
        if uncompressed {
            value |= DATA_STORED_UNCOMPRESSED;
        }
        Self(value)
    }

    #[inline]
    pub fn new_compressed(size: u32) -> Self {
        Self::new(size, false)
    }

    #[inline]
    pub fn new_uncompressed(size: u32) -> Self {
        Self::new(size, true)
    }

    #[inline]
    pub fn new_hole() -> Self {
        Self(0)
    }

    #[inline]
    pub fn uncompressed(&self) -> bool {
        self.0 & DATA_STORED_UNCOMPRESSED != 0
    }

    #[inline]
    pub fn size(&self) -> u32 {
        self.0 & !DATA_STORED_UNCOMPRESSED
    }

    #[inline]
    pub fn is_hole(&self) -> bool {
        self.size() == 0
    }
}

/// Where one block of a file ended up: filled by the writer task for fresh
/// blocks, shared between files when a block deduplicates
type BlockSlot = Arc<Mutex<Option<(u64, DataSize)>>>;

fn empty_slot() -> BlockSlot {
    Arc::new(Mutex::new(None))
}

fn hole_slot() -> BlockSlot {
    Arc::new(Mutex::new(Some((0, DataSize::new_hole()))))
}

/// Tail location of a file inside the fragment table
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) struct FragmentRef {
    pub frag_index: u32,
    pub block_offset: u32,
}

/// What `add_file` hands back immediately; the block list arrives at `finish`
#[derive(Debug, Copy, Clone)]
pub(crate) struct FileAdd {
    pub file_id: u32,
    pub fragment: Option<FragmentRef>,
}

/// Final block placement of one file
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct FileBlocks {
    pub blocks_start: u64,
    pub block_sizes: Vec<DataSize>,
}

/// Everything the serializer needs once the data region is complete
pub(crate) struct DataResults {
    pub files: FxHashMap<u32, FileBlocks>,
    pub fragment_table: Vec<Fragment>,
    /// First byte past the data region
    pub end: u64,
}

struct WorkItem {
    seq: u64,
    kind: WorkKind,
}

enum WorkKind {
    Block { bytes: Arc<Vec<u8>>, slot: BlockSlot },
    Fragment { index: u32, bytes: Vec<u8> },
}

enum DoneKind {
    Block { data: Vec<u8>, size: DataSize, slot: BlockSlot },
    Fragment { index: u32, data: Vec<u8>, size: DataSize },
}

struct DoneItem {
    seq: u64,
    kind: DoneKind,
}

impl PartialEq for DoneItem {
    fn eq(&self, other: &Self) -> bool {
        self.seq == other.seq
    }
}
impl Eq for DoneItem {}
impl PartialOrd for DoneItem {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for DoneItem {
    // inverted so the BinaryHeap pops the lowest sequence number first
    fn cmp(&self, other: &Self) -> Ordering {
        other.seq.cmp(&self.seq)
    }
}

struct PipeShared {
    cancel: AtomicBool,
    last_error: Mutex<Option<PackError>>,
}

impl PipeShared {
    fn fail(&self, error: PackError) {
        let mut last = self.last_error.lock().unwrap();
        if last.is_none() {
            *last = Some(error);
        }
        self.cancel.store(true, AtomicOrdering::SeqCst);
    }

    fn cancelled(&self) -> bool {
        self.cancel.load(AtomicOrdering::SeqCst)
    }
}

/// One previously seen block in the dedup table: its (eventual) location,
/// plus its uncompressed bytes while it is still in flight
struct DedupEntry {
    slot: BlockSlot,
    bytes: Weak<Vec<u8>>,
}

/// Fragment tail already sitting in the packer, kept for byte-exact dedup
struct FragCandidate {
    frag_index: u32,
    block_offset: u32,
    bytes: Vec<u8>,
}

pub(crate) struct DataWriter {
    sink: Arc<dyn Sink>,
    fs_compressor: FilesystemCompressor,
    block_size: u32,
    shared: Arc<PipeShared>,
    submit_tx: Option<Sender<WorkItem>>,
    workers: Vec<JoinHandle<()>>,
    writer: Option<JoinHandle<WriterOutput>>,
    seq: u64,
    next_file_id: u32,
    /// Ordered block placements of every file fed so far
    file_slots: FxHashMap<u32, Vec<BlockSlot>>,
    /// Every distinct block ever submitted, keyed by content hash
    dedup: FxHashMap<u64, Vec<DedupEntry>>,
    /// Uncompressed bytes of blocks the writer has not placed yet, kept so
    /// duplicates submitted back to back still resolve; drained front-first
    /// as the writer catches up
    inflight: VecDeque<(BlockSlot, Arc<Vec<u8>>)>,
    /// Un-written fragment bytes
    frag_bytes: Vec<u8>,
    /// Index the next flushed fragment block will get
    frag_count: u32,
    frag_dedup: FxHashMap<u64, Vec<FragCandidate>>,
}

impl DataWriter {
    pub fn new(
        sink: Arc<dyn Sink>,
        fs_compressor: FilesystemCompressor,
        block_size: u32,
        data_start: u64,
        num_jobs: usize,
        max_backlog: usize,
    ) -> Self {
        let shared = Arc::new(PipeShared {
            cancel: AtomicBool::new(false),
            last_error: Mutex::new(None),
        });

        let (submit_tx, submit_rx) = bounded::<WorkItem>(max_backlog.max(1));
        let (done_tx, done_rx) = unbounded::<DoneItem>();

        let workers = (0..num_jobs.max(1))
            .map(|_| {
                let rx = submit_rx.clone();
                let tx = done_tx.clone();
                let shared = Arc::clone(&shared);
                thread::spawn(move || worker_loop(rx, tx, fs_compressor, block_size, shared))
            })
            .collect();
        // the writer exits when every worker has dropped its sender
        drop(done_tx);

        let writer = {
            let shared = Arc::clone(&shared);
            let sink = Arc::clone(&sink);
            thread::spawn(move || {
                let mut task = WriterTask {
                    sink,
                    shared,
                    offset: data_start,
                    heap: BinaryHeap::new(),
                    next_seq: 0,
                    fragments: vec![],
                };
                task.run(done_rx);
                WriterOutput { fragments: task.fragments, offset: task.offset }
            })
        };

        Self {
            sink,
            fs_compressor,
            block_size,
            shared,
            submit_tx: Some(submit_tx),
            workers,
            writer: Some(writer),
            seq: 0,
            next_file_id: 0,
            file_slots: FxHashMap::default(),
            dedup: FxHashMap::default(),
            inflight: VecDeque::new(),
            frag_bytes: vec![],
            frag_count: 0,
            frag_dedup: FxHashMap::default(),
        }
    }

    /// Surface the first error any task hit
    pub fn last_error(&self) -> Result<(), PackError> {
        if !self.shared.cancelled() {
            return Ok(());
        }
        match self.shared.last_error.lock().unwrap().take() {
            Some(e) => Err(e),
            None => Err(PackError::Internal("data pipeline cancelled".to_string())),
        }
    }

    fn submit(&mut self, kind: WorkKind) -> Result<(), PackError> {
        self.last_error()?;
        let item = WorkItem { seq: self.seq, kind };
        self.seq += 1;
        self.submit_tx
            .as_ref()
            .expect("submit after finish")
            .send(item)
            .map_err(|_| PackError::Internal("data pipeline hung up".to_string()))
    }

    /// Feed one regular file's logical byte stream. Holes in sparse files must
    /// already be expanded to zeros by `reader`.
    pub fn add_file(
        &mut self,
        reader: &mut dyn Read,
        size: u64,
    ) -> Result<FileAdd, PackError> {
        let file_id = self.next_file_id;
        self.next_file_id += 1;

        let block_size = u64::from(self.block_size);
        let full_blocks = size / block_size;
        let tail_len = (size % block_size) as usize;

        let mut slots = Vec::with_capacity(full_blocks as usize);
        for _ in 0..full_blocks {
            let mut bytes = vec![0u8; self.block_size as usize];
            reader.read_exact(&mut bytes).map_err(PackError::InputRead)?;
            if bytes.iter().all(|b| *b == 0) {
                slots.push(hole_slot());
                continue;
            }

            // duplicates resolve here, before compression, and take no
            // sequence number
            let hash = xxh64(&bytes, 0);
            if let Some(slot) = self.probe_dedup(hash, &bytes)? {
                trace!("duplicate block found");
                slots.push(slot);
                continue;
            }

            let bytes = Arc::new(bytes);
            let slot = empty_slot();
            self.dedup.entry(hash).or_default().push(DedupEntry {
                slot: Arc::clone(&slot),
                bytes: Arc::downgrade(&bytes),
            });
            self.inflight.push_back((Arc::clone(&slot), Arc::clone(&bytes)));
            slots.push(Arc::clone(&slot));
            self.submit(WorkKind::Block { bytes, slot })?;
        }
        self.file_slots.insert(file_id, slots);

        let mut fragment = None;
        if tail_len > 0 {
            let mut tail = vec![0u8; tail_len];
            reader.read_exact(&mut tail).map_err(PackError::InputRead)?;
            fragment = Some(self.add_fragment(tail)?);
        }

        Ok(FileAdd { file_id, fragment })
    }

    /// Look the block up in the global table of previously seen blocks and
    /// verify a candidate byte for byte: against the sink for blocks already
    /// on disk, against the retained bytes for blocks still in flight.
    fn probe_dedup(&mut self, hash: u64, bytes: &[u8]) -> Result<Option<BlockSlot>, PackError> {
        self.drain_placed();
        let entries = match self.dedup.get(&hash) {
            Some(entries) => entries,
            None => return Ok(None),
        };
        for entry in entries {
            let placed = *entry.slot.lock().unwrap();
            if let Some((offset, size)) = placed {
                if self.verify_written(offset, size, bytes)? {
                    return Ok(Some(Arc::clone(&entry.slot)));
                }
            } else if let Some(pending) = entry.bytes.upgrade() {
                if pending.as_slice() == bytes {
                    return Ok(Some(Arc::clone(&entry.slot)));
                }
            }
        }
        Ok(None)
    }

    /// Re-read a written block through the sink and compare it with the
    /// candidate's uncompressed bytes
    fn verify_written(
        &self,
        offset: u64,
        size: DataSize,
        bytes: &[u8],
    ) -> Result<bool, PackError> {
        let mut stored = vec![0u8; size.size() as usize];
        self.sink
            .read_at(offset, &mut stored)
            .map_err(PackError::OutputIo)?;
        if size.uncompressed() {
            return Ok(stored == bytes);
        }
        let mut out = Vec::with_capacity(self.block_size as usize);
        compressor::decompress(&stored, &mut out, self.fs_compressor.id, self.block_size as usize)?;
        Ok(out == bytes)
    }

    /// Drop retained bytes of blocks the writer has placed. Blocks place in
    /// submission order, so checking from the front is enough.
    fn drain_placed(&mut self) {
        while self
            .inflight
            .front()
            .map(|(slot, _)| slot.lock().unwrap().is_some())
            .unwrap_or(false)
        {
            self.inflight.pop_front();
        }
    }

    fn add_fragment(&mut self, tail: Vec<u8>) -> Result<FragmentRef, PackError> {
        let hash = xxh64(&tail, 0);
        if let Some(candidates) = self.frag_dedup.get(&hash) {
            for candidate in candidates {
                if candidate.bytes == tail {
                    trace!("duplicate fragment tail found");
                    return Ok(FragmentRef {
                        frag_index: candidate.frag_index,
                        block_offset: candidate.block_offset,
                    });
                }
            }
        }

        // tail would overflow the fragment block, flush what we have first
        if self.frag_bytes.len() + tail.len() > self.block_size as usize {
            self.flush_fragments()?;
        }

        let frag_ref = FragmentRef {
            frag_index: self.frag_count,
            block_offset: self.frag_bytes.len() as u32,
        };
        self.frag_bytes.extend_from_slice(&tail);
        self.frag_dedup.entry(hash).or_default().push(FragCandidate {
            frag_index: frag_ref.frag_index,
            block_offset: frag_ref.block_offset,
            bytes: tail,
        });
        Ok(frag_ref)
    }

    fn flush_fragments(&mut self) -> Result<(), PackError> {
        if self.frag_bytes.is_empty() {
            return Ok(());
        }
        let bytes = mem::take(&mut self.frag_bytes);
        let index = self.frag_count;
        self.frag_count += 1;
        self.submit(WorkKind::Fragment { index, bytes })
    }

    /// Flush the partial fragment block, wait for all inflight work and
    /// return the final placement of every file and fragment.
    pub fn finish(mut self) -> Result<DataResults, PackError> {
        self.flush_fragments()?;
        drop(self.submit_tx.take());
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
        let output = self
            .writer
            .take()
            .expect("finish called twice")
            .join()
            .map_err(|_| PackError::Internal("writer task panicked".to_string()))?;
        self.last_error()?;

        // every slot is placed now; turn them into per-file block lists
        let mut files = FxHashMap::default();
        for (file_id, slots) in mem::take(&mut self.file_slots) {
            if slots.is_empty() {
                continue;
            }
            let mut blocks_start = None;
            let mut block_sizes = Vec::with_capacity(slots.len());
            for slot in slots {
                let placed = *slot.lock().unwrap();
                let (offset, size) = placed.ok_or_else(|| {
                    PackError::Internal("block never reached the writer".to_string())
                })?;
                if blocks_start.is_none() && !size.is_hole() {
                    blocks_start = Some(offset);
                }
                block_sizes.push(size);
            }
            files.insert(
                file_id,
                FileBlocks { blocks_start: blocks_start.unwrap_or(0), block_sizes },
            );
        }

        Ok(DataResults {
            files,
            fragment_table: output.fragments,
            end: output.offset,
        })
    }
}

fn compress_block(
    bytes: &[u8],
    fc: FilesystemCompressor,
    block_size: u32,
) -> Result<(Vec<u8>, DataSize), PackError> {
    let cb = compressor::compress(bytes, fc, block_size)?;
    // compression didn't reduce size
    if cb.len() < bytes.len() {
        let size = DataSize::new_compressed(cb.len() as u32);
        Ok((cb, size))
    } else {
        let size = DataSize::new_uncompressed(bytes.len() as u32);
        Ok((bytes.to_vec(), size))
    }
}

fn worker_loop(
    rx: Receiver<WorkItem>,
    tx: Sender<DoneItem>,
    fc: FilesystemCompressor,
    block_size: u32,
    shared: Arc<PipeShared>,
) {
    while let Ok(item) = rx.recv() {
        // after cancellation keep draining so the producer never blocks on a
        // full queue
        if shared.cancelled() {
            continue;
        }
        let kind = match item.kind {
            WorkKind::Block { bytes, slot } => match compress_block(&bytes, fc, block_size) {
                Ok((data, size)) => DoneKind::Block { data, size, slot },
                Err(e) => {
                    shared.fail(e);
                    continue;
                }
            },
            WorkKind::Fragment { index, bytes } => match compress_block(&bytes, fc, block_size) {
                Ok((data, size)) => DoneKind::Fragment { index, data, size },
                Err(e) => {
                    shared.fail(e);
                    continue;
                }
            },
        };
        if tx.send(DoneItem { seq: item.seq, kind }).is_err() {
            return;
        }
    }
}

struct WriterOutput {
    fragments: Vec<Fragment>,
    offset: u64,
}

struct WriterTask {
    sink: Arc<dyn Sink>,
    shared: Arc<PipeShared>,
    offset: u64,
    heap: BinaryHeap<DoneItem>,
    next_seq: u64,
    fragments: Vec<Fragment>,
}

impl WriterTask {
    fn run(&mut self, rx: Receiver<DoneItem>) {
        while let Ok(item) = rx.recv() {
            self.heap.push(item);
            // emit only while the heap's head is the next expected sequence
            while self
                .heap
                .peek()
                .map(|head| head.seq == self.next_seq)
                .unwrap_or(false)
            {
                let item = self.heap.pop().unwrap();
                self.next_seq += 1;
                if self.shared.cancelled() {
                    continue;
                }
                if let Err(e) = self.emit(item.kind) {
                    self.shared.fail(e);
                }
            }
        }
    }

    fn emit(&mut self, kind: DoneKind) -> Result<(), PackError> {
        match kind {
            DoneKind::Block { data, size, slot } => {
                self.sink
                    .write_at(self.offset, &data)
                    .map_err(PackError::OutputIo)?;
                // publish the placement only once the bytes are on disk, so
                // dedup verification reads never race the write
                *slot.lock().unwrap() = Some((self.offset, size));
                self.offset += data.len() as u64;
            }
            DoneKind::Fragment { index, data, size } => {
                debug_assert_eq!(index as usize, self.fragments.len());
                self.sink
                    .write_at(self.offset, &data)
                    .map_err(PackError::OutputIo)?;
                self.fragments.push(Fragment::new(self.offset, size, 0));
                self.offset += data.len() as u64;
            }
        }
        Ok(())
    }
}

/// Turn `add_file`'s immediate result plus the finish-time block list into
/// the values a file inode stores
pub(crate) fn file_inode_fields(
    add: &FileAdd,
    results: &DataResults,
) -> (u64, u32, u32, Vec<DataSize>) {
    let (blocks_start, block_sizes) = match results.files.get(&add.file_id) {
        Some(blocks) => (blocks.blocks_start, blocks.block_sizes.clone()),
        None => (0, vec![]),
    };
    match add.fragment {
        Some(frag) => (blocks_start, frag.frag_index, frag.block_offset, block_sizes),
        None => (blocks_start, FRAG_NOT_SET, 0, block_sizes),
    }
}
