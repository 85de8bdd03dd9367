// Copyright 2021-2026 The Statecore developers.
// This file is part of Statecore.

// Statecore is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.

// Statecore is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.

// You should have received a copy of the GNU General Public License
// along with Statecore.  If not, see <http://www.gnu.org/licenses/>.

//! Node i/o over the async engine: page-aligned direct reads of node
//! records and the buffered append streams feeding sequential chunks.

use std::{
    cell::{Cell, RefCell},
    collections::HashSet,
    os::unix::io::RawFd,
    rc::Rc,
    sync::Arc,
};

use storage_aio::{
    connect, AnySender, AsyncIo, CompletionAction, Operation, ReadSingleBufferSender,
};
use storage_pool::{Chunk, ChunkKind, StoragePool};

use crate::{
    errno,
    meta::{virtual_offset, DbMetadata, ListKind},
    node::{ChunkOffset, Node},
    Error, Result,
};

const PAGE: u64 = 4096;
/// Staged bytes are flushed once they exceed this many pages.
const FLUSH_THRESHOLD: usize = 56 * PAGE as usize;

fn round_up_page(v: u64) -> u64 {
    (v + PAGE - 1) & !(PAGE - 1)
}

/// Shared read/write plumbing between the database facade, the update
/// engine and compaction.
pub(crate) struct NodeIo {
    pool: Arc<StoragePool>,
    io: AsyncIo,
}

impl NodeIo {
    pub fn new(pool: Arc<StoragePool>, io: AsyncIo) -> NodeIo {
        NodeIo { pool, io }
    }

    pub fn pool(&self) -> &Arc<StoragePool> {
        &self.pool
    }

    pub fn engine(&self) -> &AsyncIo {
        &self.io
    }

    fn initiate_retrying(&self, mut op: Box<Operation>) -> Result<()> {
        loop {
            match self.io.initiate(op) {
                Ok(_) => return Ok(()),
                Err(failed) => match failed.error {
                    // Back-pressure: drain a completion and try again.
                    storage_aio::Error::BufferPoolExhausted => {
                        op = failed.operation;
                        self.io.poll_blocking(16).map_err(Error::Aio)?;
                    }
                    other => return Err(Error::Aio(other)),
                },
            }
        }
    }

    // Records larger than the registered buffers are rare; read them with
    // an ad-hoc aligned buffer outside the ring.
    fn read_aligned_large(
        &self,
        chunk: &Arc<Chunk>,
        aligned_offset: u64,
        len: usize,
    ) -> Result<Vec<u8>> {
        let padded = round_up_page(len as u64) as usize;
        let mut backing = vec![0u8; padded + PAGE as usize];
        let shift = backing.as_ptr().align_offset(PAGE as usize);
        let (fd, base) = chunk.read_fd();
        let n = unsafe {
            libc::pread(
                fd,
                backing.as_mut_ptr().add(shift) as *mut libc::c_void,
                padded,
                (base + aligned_offset) as libc::off_t,
            )
        };
        if n < len as isize {
            return Err(Error::Io(errno()));
        }
        Ok(backing[shift..shift + len].to_vec())
    }

    /// Reads and parses the node record at `offset`.
    pub fn read_node(&self, offset: ChunkOffset) -> Result<Node> {
        let mut nodes = self.read_nodes(&[offset])?;
        Ok(nodes.pop().expect("one offset, one node"))
    }

    /// Reads a batch of node records, overlapping the device reads, and
    /// returns the parsed nodes in input order.
    pub fn read_nodes(&self, offsets: &[ChunkOffset]) -> Result<Vec<Node>> {
        struct Pending {
            chunk: Arc<Chunk>,
            aligned: u64,
            rel: usize,
            slot: Rc<RefCell<Option<storage_aio::Result<storage_aio::ReadBuffer>>>>,
        }

        let window = self.io.buffers().buffer_size();
        let outstanding = Rc::new(Cell::new(0usize));
        let mut pending = Vec::with_capacity(offsets.len());
        for offset in offsets {
            debug_assert!(offset.is_valid());
            let chunk = self
                .pool
                .activate_chunk(ChunkKind::Seq, offset.chunk_id())
                .map_err(Error::Pool)?;
            let aligned = offset.offset() & !(PAGE - 1);
            let rel = (offset.offset() - aligned) as usize;
            let len = window.min((chunk.capacity() - aligned) as usize);
            let slot: Rc<RefCell<Option<storage_aio::Result<storage_aio::ReadBuffer>>>> =
                Rc::new(RefCell::new(None));
            let out = slot.clone();
            let counter = outstanding.clone();
            counter.set(counter.get() + 1);
            let sender = ReadSingleBufferSender::from_chunk(&chunk, aligned, len);
            self.initiate_retrying(connect(
                AnySender::Read(sender),
                move |_io: &AsyncIo, res: storage_aio::OpResult| {
                    *out.borrow_mut() = Some(res.into_read_buffer());
                    counter.set(counter.get() - 1);
                    CompletionAction::Done
                },
            ))?;
            pending.push(Pending {
                chunk,
                aligned,
                rel,
                slot,
            });
        }
        while outstanding.get() > 0 {
            self.io.poll_blocking(64).map_err(Error::Aio)?;
        }

        let mut nodes = Vec::with_capacity(pending.len());
        for p in pending {
            let buf = p
                .slot
                .borrow_mut()
                .take()
                .expect("completed read")
                .map_err(Error::Aio)?;
            let filled = buf.filled();
            if filled.len() < p.rel + 4 {
                return Err(Error::CorruptNode);
            }
            let record_len = u32::from_le_bytes(
                filled[p.rel..p.rel + 4].try_into().expect("4 bytes"),
            ) as usize;
            let start = p.rel + 4;
            let node = if filled.len() >= start + record_len {
                Node::deserialize(&filled[start..start + record_len])?
            } else {
                // The record runs past the first read window; fetch the
                // whole span in one aligned read.
                let total = round_up_page((p.rel + 4 + record_len) as u64) as usize;
                let bytes = self.read_aligned_large(&p.chunk, p.aligned, total)?;
                Node::deserialize(&bytes[start..start + record_len])?
            };
            nodes.push(node);
        }
        Ok(nodes)
    }
}

/// A buffered append stream over the tail chunk of the fast or slow list.
///
/// Records are staged in memory and claimed from the chunk's zone append
/// pointer in whole pages, so the direct-i/o alignment rules hold; the
/// stream pads its final page at flush time and later records start past
/// the padding.
pub(crate) struct NodeWriter {
    which: ListKind,
    capacity_shift: u32,
    chunk: Option<Arc<Chunk>>,
    chunk_id: u32,
    insertion_count: u32,
    upto: u64,
    staging: Vec<u8>,
    touched_fds: HashSet<RawFd>,
}

impl NodeWriter {
    pub fn new(which: ListKind, capacity_shift: u32) -> NodeWriter {
        debug_assert!(which != ListKind::Free);
        NodeWriter {
            which,
            capacity_shift,
            chunk: None,
            chunk_id: 0,
            insertion_count: 0,
            upto: 0,
            staging: Vec::new(),
            touched_fds: HashSet::new(),
        }
    }

    /// Points the stream at the current tail chunk of its list, resuming
    /// at the chunk's append pointer.
    pub fn resume(&mut self, node_io: &NodeIo, meta: &DbMetadata) -> Result<()> {
        if let Some(tail) = meta.list_tail(self.which) {
            let chunk = node_io
                .pool()
                .activate_chunk(ChunkKind::Seq, tail)
                .map_err(Error::Pool)?;
            debug_assert_eq!(chunk.size() % PAGE, 0);
            self.upto = chunk.size();
            self.chunk = Some(chunk);
            self.chunk_id = tail;
            self.insertion_count = meta.insertion_count(tail);
        }
        Ok(())
    }

    /// The position the next commit's work-in-progress span starts at.
    pub fn wip_offset(&self) -> ChunkOffset {
        match &self.chunk {
            Some(_) => ChunkOffset::new(self.chunk_id, self.upto + self.staging.len() as u64),
            None => ChunkOffset::INVALID,
        }
    }

    fn rotate(&mut self, node_io: &NodeIo, meta: &mut DbMetadata) -> Result<()> {
        let id = meta
            .pop_list_head(ListKind::Free)?
            .ok_or(Error::OutOfSpace)?;
        meta.append_to_list(self.which, id)?;
        let chunk = node_io
            .pool()
            .activate_chunk(ChunkKind::Seq, id)
            .map_err(Error::Pool)?;
        meta.sub_free_capacity(chunk.capacity())?;
        debug_assert_eq!(chunk.size(), 0);
        debug!(target: "triedb", "append stream {:?} rotated to chunk {id}", self.which);
        self.chunk = Some(chunk);
        self.chunk_id = id;
        self.insertion_count = meta.insertion_count(id);
        self.upto = 0;
        Ok(())
    }

    /// Appends one serialized node record and returns its chunk offset
    /// plus its virtual offset within this stream's list.
    pub fn append_node(
        &mut self,
        node_io: &NodeIo,
        meta: &mut DbMetadata,
        record: &[u8],
    ) -> Result<(ChunkOffset, u32)> {
        let framed_len = 4 + record.len() as u64;
        let capacity = 1u64 << self.capacity_shift;
        let fits = |w: &NodeWriter| {
            w.chunk.is_some()
                && w.upto + round_up_page(w.staging.len() as u64 + framed_len) <= capacity
        };
        if !fits(self) {
            self.flush(node_io, meta)?;
            self.rotate(node_io, meta)?;
        }
        let offset_in_chunk = self.upto + self.staging.len() as u64;
        self.staging
            .extend_from_slice(&(record.len() as u32).to_le_bytes());
        self.staging.extend_from_slice(record);
        if self.staging.len() >= FLUSH_THRESHOLD {
            self.flush(node_io, meta)?;
        }
        Ok((
            ChunkOffset::new(self.chunk_id, offset_in_chunk),
            virtual_offset(self.insertion_count, offset_in_chunk, self.capacity_shift),
        ))
    }

    /// Writes the staged bytes out through the engine, padding the tail
    /// to a whole page.
    pub fn flush(&mut self, node_io: &NodeIo, _meta: &mut DbMetadata) -> Result<()> {
        if self.staging.is_empty() {
            return Ok(());
        }
        let chunk = self.chunk.as_ref().expect("staged bytes imply a chunk");
        let padded = round_up_page(self.staging.len() as u64);
        self.staging.resize(padded as usize, 0);
        let (fd, claimed_at) = chunk.write_fd(padded).map_err(Error::Pool)?;
        debug_assert_eq!(claimed_at, chunk.read_fd().1 + self.upto);
        self.touched_fds.insert(fd);

        let io = node_io.engine();
        let mut written = 0usize;
        while written < self.staging.len() {
            let mut buf = loop {
                match io.buffers().acquire_write() {
                    Ok(buf) => break buf,
                    Err(storage_aio::Error::BufferPoolExhausted) => {
                        io.poll_blocking(16).map_err(Error::Aio)?;
                    }
                    Err(other) => return Err(Error::Aio(other)),
                }
            };
            let this = buf.capacity().min(self.staging.len() - written);
            buf.fill_from(&self.staging[written..written + this]);
            let done: Rc<RefCell<Option<storage_aio::Result<()>>>> = Rc::new(RefCell::new(None));
            let out = done.clone();
            let sender = storage_aio::WriteSender::new(fd, claimed_at + written as u64, buf);
            self.initiate_write(node_io, sender, out)?;
            loop {
                if let Some(res) = done.borrow_mut().take() {
                    res.map_err(Error::Aio)?;
                    break;
                }
                io.poll_blocking(16).map_err(Error::Aio)?;
            }
            written += this;
        }
        self.upto += padded;
        self.staging.clear();
        Ok(())
    }

    fn initiate_write(
        &self,
        node_io: &NodeIo,
        sender: storage_aio::WriteSender,
        out: Rc<RefCell<Option<storage_aio::Result<()>>>>,
    ) -> Result<()> {
        let op = connect(
            AnySender::Write(sender),
            move |_io: &AsyncIo, res: storage_aio::OpResult| {
                *out.borrow_mut() = Some(res.into_unit());
                CompletionAction::Done
            },
        );
        node_io
            .io
            .initiate(op)
            .map(|_| ())
            .map_err(|failed| Error::Aio(failed.error))
    }

    /// Durably flushes every device this stream has written to.
    pub fn sync(&mut self) -> Result<()> {
        for fd in self.touched_fds.drain() {
            if unsafe { libc::fsync(fd) } == -1 {
                return Err(Error::Io(errno()));
            }
        }
        Ok(())
    }

    pub fn current_chunk_id(&self) -> Option<u32> {
        self.chunk.as_ref().map(|_| self.chunk_id)
    }

    pub fn list_kind(&self) -> ListKind {
        self.which
    }
}
