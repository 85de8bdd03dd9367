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

//! Persistent database metadata in the first conventional chunk.
//!
//! The record tracks three doubly linked lists of chunk ids (free, fast,
//! slow), the committed root offset, and the work-in-progress offsets that
//! recovery rewinds. Every mutation is bracketed by setting and clearing
//! the dirty byte, so a torn record after a crash is detectable. List
//! nodes are 8 bytes with bit-packed prev/next/flags; removals happen only
//! at the ends so the per-node insertion counter never loses accuracy.

use std::{os::unix::io::RawFd, sync::Arc};

use storage_pool::Chunk;

use crate::{errno, node::ChunkOffset, Error, Result};

pub const META_MAGIC: [u8; 4] = *b"SCM1";
pub const INVALID_CHUNK_ID: u32 = 0xfffff;
const INVALID_LIST_END: u32 = u32::MAX;
const HEADER_SIZE: usize = 88;

/// Which of the three lists a chunk sits in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListKind {
    Free,
    Fast,
    Slow,
}

/// The offsets advanced at each database commit. `root_offset` is the
/// single linearization point: readers observe either the old root or the
/// new one, never anything in between.
#[derive(Debug, Clone, Copy)]
pub struct DbOffsets {
    pub root_offset: ChunkOffset,
    pub start_of_wip_offset_fast: ChunkOffset,
    pub start_of_wip_offset_slow: ChunkOffset,
    pub last_compact_offset_fast: u32,
    pub last_compact_offset_slow: u32,
    pub last_compact_offset_range_fast: u32,
    pub last_compact_offset_range_slow: u32,
}

impl Default for DbOffsets {
    fn default() -> Self {
        DbOffsets {
            root_offset: ChunkOffset::INVALID,
            start_of_wip_offset_fast: ChunkOffset::INVALID,
            start_of_wip_offset_slow: ChunkOffset::INVALID,
            last_compact_offset_fast: 0,
            last_compact_offset_slow: 0,
            last_compact_offset_range_fast: 0,
            last_compact_offset_range_slow: 0,
        }
    }
}

// An 8-byte list node: prev:20 | in_fast:1 | in_slow:1 | count_lo:10 |
// next:20 | unused:2 | count_hi:10.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ChunkInfo(u64);

impl ChunkInfo {
    fn empty() -> ChunkInfo {
        ChunkInfo(0).with_prev(INVALID_CHUNK_ID).with_next(INVALID_CHUNK_ID)
    }

    fn prev(self) -> u32 {
        (self.0 & 0xfffff) as u32
    }

    fn with_prev(self, prev: u32) -> ChunkInfo {
        ChunkInfo((self.0 & !0xfffff) | (prev as u64 & 0xfffff))
    }

    fn next(self) -> u32 {
        ((self.0 >> 32) & 0xfffff) as u32
    }

    fn with_next(self, next: u32) -> ChunkInfo {
        ChunkInfo((self.0 & !(0xfffffu64 << 32)) | ((next as u64 & 0xfffff) << 32))
    }

    fn in_fast(self) -> bool {
        self.0 & (1 << 20) != 0
    }

    fn in_slow(self) -> bool {
        self.0 & (1 << 21) != 0
    }

    fn with_flags(self, in_fast: bool, in_slow: bool) -> ChunkInfo {
        let mut v = self.0 & !(0b11 << 20);
        v |= (in_fast as u64) << 20;
        v |= (in_slow as u64) << 21;
        ChunkInfo(v)
    }

    // 20-bit wrapping counter split over two fields.
    fn insertion_count(self) -> u32 {
        let lo = ((self.0 >> 22) & 0x3ff) as u32;
        let hi = ((self.0 >> 54) & 0x3ff) as u32;
        (hi << 10) | lo
    }

    fn with_insertion_count(self, count: u32) -> ChunkInfo {
        let count = count & 0xfffff;
        let mut v = self.0 & !((0x3ffu64 << 22) | (0x3ffu64 << 54));
        v |= ((count & 0x3ff) as u64) << 22;
        v |= ((count >> 10) as u64) << 54;
        ChunkInfo(v)
    }
}

#[derive(Debug, Clone, Copy)]
struct IdPair {
    begin: u32,
    end: u32,
}

impl IdPair {
    fn empty() -> IdPair {
        IdPair {
            begin: INVALID_LIST_END,
            end: INVALID_LIST_END,
        }
    }
}

/// The in-memory mirror of the persistent record, written through to the
/// first conventional chunk on every mutation.
pub struct DbMetadata {
    #[allow(dead_code)]
    chunk: Arc<Chunk>,
    fd: RawFd,
    base: u64,
    read_only: bool,

    pub free_capacity: u64,
    pub offsets: DbOffsets,
    pub slow_fast_ratio: f32,
    free_list: IdPair,
    fast_list: IdPair,
    slow_list: IdPair,
    info: Vec<ChunkInfo>,
}

fn pwrite_all(fd: RawFd, buf: &[u8], offset: u64) -> Result<()> {
    let n = unsafe {
        libc::pwrite(
            fd,
            buf.as_ptr() as *const libc::c_void,
            buf.len(),
            offset as libc::off_t,
        )
    };
    if n != buf.len() as isize {
        return Err(Error::Io(errno()));
    }
    Ok(())
}

fn pread_all(fd: RawFd, buf: &mut [u8], offset: u64) -> Result<()> {
    let n = unsafe {
        libc::pread(
            fd,
            buf.as_mut_ptr() as *mut libc::c_void,
            buf.len(),
            offset as libc::off_t,
        )
    };
    if n != buf.len() as isize {
        return Err(Error::Io(errno()));
    }
    Ok(())
}

impl DbMetadata {
    /// Formats a fresh record: every sequential chunk goes to the free
    /// list.
    pub fn create(chunk: Arc<Chunk>, seq_chunk_count: u32, chunk_capacity: u64) -> Result<DbMetadata> {
        assert!(seq_chunk_count < INVALID_CHUNK_ID);
        // Metadata i/o is byte-granular; it goes through the page cache,
        // not the direct-i/o descriptors.
        let (fd, base) = chunk.cached_rw_fd();
        let mut meta = DbMetadata {
            chunk,
            fd,
            base,
            read_only: false,
            free_capacity: 0,
            offsets: DbOffsets::default(),
            slow_fast_ratio: 2.0,
            free_list: IdPair::empty(),
            fast_list: IdPair::empty(),
            slow_list: IdPair::empty(),
            info: vec![ChunkInfo::empty(); seq_chunk_count as usize],
        };
        meta.write_dirty(1)?;
        for id in 0..seq_chunk_count {
            meta.link_append(ListKind::Free, id);
        }
        meta.free_capacity = seq_chunk_count as u64 * chunk_capacity;
        meta.persist()?;
        meta.write_dirty(0)?;
        Ok(meta)
    }

    /// Loads an existing record. A set dirty byte is fatal unless
    /// `allow_dirty`; the caller then rewinds the work-in-progress spans.
    pub fn open(chunk: Arc<Chunk>, read_only: bool, allow_dirty: bool) -> Result<DbMetadata> {
        let (fd, base) = chunk.cached_rw_fd();
        let mut header = [0u8; HEADER_SIZE];
        pread_all(fd, &mut header, base)?;
        if header[0..4] != META_MAGIC {
            return Err(Error::BadMetaMagic);
        }
        let dirty = header[4] != 0;
        if dirty && !allow_dirty {
            return Err(Error::DirtyState);
        }
        let u64_at = |o: usize| u64::from_le_bytes(header[o..o + 8].try_into().expect("8 bytes"));
        let u32_at = |o: usize| u32::from_le_bytes(header[o..o + 4].try_into().expect("4 bytes"));

        let count = u32_at(60) as usize;
        let mut info_bytes = vec![0u8; count * 8];
        pread_all(fd, &mut info_bytes, base + HEADER_SIZE as u64)?;
        let info = info_bytes
            .chunks(8)
            .map(|c| ChunkInfo(u64::from_le_bytes(c.try_into().expect("8 bytes"))))
            .collect();

        Ok(DbMetadata {
            chunk,
            fd,
            base,
            read_only,
            free_capacity: u64_at(8),
            offsets: DbOffsets {
                root_offset: ChunkOffset::from_raw(u64_at(16)),
                start_of_wip_offset_fast: ChunkOffset::from_raw(u64_at(24)),
                start_of_wip_offset_slow: ChunkOffset::from_raw(u64_at(32)),
                last_compact_offset_fast: u32_at(40),
                last_compact_offset_slow: u32_at(44),
                last_compact_offset_range_fast: u32_at(48),
                last_compact_offset_range_slow: u32_at(52),
            },
            slow_fast_ratio: f32::from_le_bytes(header[56..60].try_into().expect("4 bytes")),
            free_list: IdPair {
                begin: u32_at(64),
                end: u32_at(68),
            },
            fast_list: IdPair {
                begin: u32_at(72),
                end: u32_at(76),
            },
            slow_list: IdPair {
                begin: u32_at(80),
                end: u32_at(84),
            },
            info,
        })
    }

    /// Whether the on-disk record says a mutation was in progress.
    pub fn is_dirty_on_disk(&self) -> Result<bool> {
        let mut byte = [0u8; 1];
        pread_all(self.fd, &mut byte, self.base + 4)?;
        Ok(byte[0] != 0)
    }

    /// Leaves the dirty byte set, as a crashed process would. Test
    /// scaffolding for recovery scenarios.
    pub fn poison_dirty(&mut self) -> Result<()> {
        self.write_dirty(1)
    }

    /// Clears the dirty byte after recovery has rewound the WIP spans.
    pub fn clear_dirty(&mut self) -> Result<()> {
        self.write_dirty(0)
    }

    fn write_dirty(&mut self, value: u8) -> Result<()> {
        debug_assert!(!self.read_only);
        pwrite_all(self.fd, &[value], self.base + 4)
    }

    fn persist(&mut self) -> Result<()> {
        let mut out = Vec::with_capacity(HEADER_SIZE + self.info.len() * 8);
        out.extend_from_slice(&META_MAGIC);
        out.push(1); // dirty while the record itself is being rewritten
        out.extend_from_slice(&[0u8; 3]);
        out.extend_from_slice(&self.free_capacity.to_le_bytes());
        out.extend_from_slice(&self.offsets.root_offset.to_raw().to_le_bytes());
        out.extend_from_slice(&self.offsets.start_of_wip_offset_fast.to_raw().to_le_bytes());
        out.extend_from_slice(&self.offsets.start_of_wip_offset_slow.to_raw().to_le_bytes());
        out.extend_from_slice(&self.offsets.last_compact_offset_fast.to_le_bytes());
        out.extend_from_slice(&self.offsets.last_compact_offset_slow.to_le_bytes());
        out.extend_from_slice(&self.offsets.last_compact_offset_range_fast.to_le_bytes());
        out.extend_from_slice(&self.offsets.last_compact_offset_range_slow.to_le_bytes());
        out.extend_from_slice(&self.slow_fast_ratio.to_le_bytes());
        out.extend_from_slice(&(self.info.len() as u32).to_le_bytes());
        for pair in [self.free_list, self.fast_list, self.slow_list] {
            out.extend_from_slice(&pair.begin.to_le_bytes());
            out.extend_from_slice(&pair.end.to_le_bytes());
        }
        debug_assert_eq!(out.len(), HEADER_SIZE);
        for info in &self.info {
            out.extend_from_slice(&info.0.to_le_bytes());
        }
        pwrite_all(self.fd, &out, self.base)
    }

    fn with_dirty<R>(&mut self, f: impl FnOnce(&mut Self) -> R) -> Result<R> {
        self.write_dirty(1)?;
        let r = f(self);
        self.persist()?;
        self.write_dirty(0)?;
        Ok(r)
    }

    fn list(&self, which: ListKind) -> IdPair {
        match which {
            ListKind::Free => self.free_list,
            ListKind::Fast => self.fast_list,
            ListKind::Slow => self.slow_list,
        }
    }

    fn list_mut(&mut self, which: ListKind) -> &mut IdPair {
        match which {
            ListKind::Free => &mut self.free_list,
            ListKind::Fast => &mut self.fast_list,
            ListKind::Slow => &mut self.slow_list,
        }
    }

    /// Which list the chunk currently belongs to.
    pub fn list_of(&self, id: u32) -> ListKind {
        let info = self.info[id as usize];
        if info.in_fast() {
            ListKind::Fast
        } else if info.in_slow() {
            ListKind::Slow
        } else {
            ListKind::Free
        }
    }

    pub fn list_head(&self, which: ListKind) -> Option<u32> {
        match self.list(which).begin {
            INVALID_LIST_END => None,
            id => Some(id),
        }
    }

    pub fn list_tail(&self, which: ListKind) -> Option<u32> {
        match self.list(which).end {
            INVALID_LIST_END => None,
            id => Some(id),
        }
    }

    pub fn next_in_list(&self, id: u32) -> Option<u32> {
        match self.info[id as usize].next() {
            INVALID_CHUNK_ID => None,
            next => Some(next),
        }
    }

    /// Monotone position of the chunk within its list; wraps at 20 bits.
    pub fn insertion_count(&self, id: u32) -> u32 {
        self.info[id as usize].insertion_count()
    }

    // Link manipulation without persistence; the public wrappers bracket
    // with the dirty byte.
    fn link_append(&mut self, which: ListKind, id: u32) {
        let mut info = ChunkInfo::empty().with_flags(
            which == ListKind::Fast,
            which == ListKind::Slow,
        );
        let list = self.list(which);
        if list.end == INVALID_LIST_END {
            debug_assert!(list.begin == INVALID_LIST_END);
            self.info[id as usize] = info;
            *self.list_mut(which) = IdPair { begin: id, end: id };
            return;
        }
        let tail_id = list.end;
        let tail = self.info[tail_id as usize];
        debug_assert_eq!(tail.next(), INVALID_CHUNK_ID);
        info = info
            .with_prev(tail_id)
            .with_insertion_count(tail.insertion_count().wrapping_add(1));
        self.info[id as usize] = info;
        self.info[tail_id as usize] = tail.with_next(id);
        self.list_mut(which).end = id;
    }

    fn link_prepend(&mut self, which: ListKind, id: u32) {
        let mut info = ChunkInfo::empty().with_flags(
            which == ListKind::Fast,
            which == ListKind::Slow,
        );
        let list = self.list(which);
        if list.begin == INVALID_LIST_END {
            debug_assert!(list.end == INVALID_LIST_END);
            self.info[id as usize] = info;
            *self.list_mut(which) = IdPair { begin: id, end: id };
            return;
        }
        let head_id = list.begin;
        let head = self.info[head_id as usize];
        debug_assert_eq!(head.prev(), INVALID_CHUNK_ID);
        info = info
            .with_next(head_id)
            .with_insertion_count(head.insertion_count().wrapping_sub(1));
        self.info[id as usize] = info;
        self.info[head_id as usize] = head.with_prev(id);
        self.list_mut(which).begin = id;
    }

    fn link_remove(&mut self, id: u32) {
        let which = self.list_of(id);
        let info = self.info[id as usize];
        match (info.prev(), info.next()) {
            (INVALID_CHUNK_ID, INVALID_CHUNK_ID) => {
                let list = self.list_mut(which);
                debug_assert!(list.begin == id && list.end == id);
                *list = IdPair::empty();
            }
            (INVALID_CHUNK_ID, next) => {
                debug_assert_eq!(self.list(which).begin, id);
                self.info[next as usize] = self.info[next as usize].with_prev(INVALID_CHUNK_ID);
                self.list_mut(which).begin = next;
            }
            (prev, INVALID_CHUNK_ID) => {
                debug_assert_eq!(self.list(which).end, id);
                self.info[prev as usize] = self.info[prev as usize].with_next(INVALID_CHUNK_ID);
                self.list_mut(which).end = prev;
            }
            _ => panic!(
                "mid-list removals are disabled so insertion counts stay accurate (chunk {id})"
            ),
        }
        self.info[id as usize] = ChunkInfo::empty();
    }

    /// Appends `id` to the tail of a list.
    pub fn append_to_list(&mut self, which: ListKind, id: u32) -> Result<()> {
        self.with_dirty(|m| m.link_append(which, id))
    }

    /// Prepends `id` to the head of a list.
    pub fn prepend_to_list(&mut self, which: ListKind, id: u32) -> Result<()> {
        self.with_dirty(|m| m.link_prepend(which, id))
    }

    /// Unlinks `id` from whichever end of its list it occupies.
    pub fn remove_from_list(&mut self, id: u32) -> Result<()> {
        self.with_dirty(|m| m.link_remove(id))
    }

    /// Detaches and returns the head of a list.
    pub fn pop_list_head(&mut self, which: ListKind) -> Result<Option<u32>> {
        self.with_dirty(|m| {
            let head = match m.list(which).begin {
                INVALID_LIST_END => return None,
                id => id,
            };
            m.link_remove(head);
            Some(head)
        })
    }

    pub fn add_free_capacity(&mut self, bytes: u64) -> Result<()> {
        self.with_dirty(|m| m.free_capacity += bytes)
    }

    pub fn sub_free_capacity(&mut self, bytes: u64) -> Result<()> {
        self.with_dirty(|m| m.free_capacity -= bytes)
    }

    /// Publishes a new set of database offsets; advancing `root_offset`
    /// commits the batch.
    pub fn advance_offsets(&mut self, offsets: DbOffsets) -> Result<()> {
        self.with_dirty(|m| m.offsets = offsets)
    }

    pub fn set_slow_fast_ratio(&mut self, ratio: f32) -> Result<()> {
        self.with_dirty(|m| m.slow_fast_ratio = ratio)
    }
}

/// Truncated "virtual" position of a byte inside a list: the chunk's
/// insertion count in the high bits, the top of the intra-chunk offset in
/// the low bits. Monotone over a list until the 20-bit counter wraps.
pub fn virtual_offset(insertion_count: u32, offset_in_chunk: u64, capacity_shift: u32) -> u32 {
    debug_assert!(capacity_shift >= 12);
    (insertion_count << 12) | (offset_in_chunk >> (capacity_shift - 12)) as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunk_info_bit_packing() {
        let info = ChunkInfo::empty()
            .with_prev(0x12345)
            .with_next(0xabcde)
            .with_flags(true, false)
            .with_insertion_count(0xfffff);
        assert_eq!(info.prev(), 0x12345);
        assert_eq!(info.next(), 0xabcde);
        assert!(info.in_fast());
        assert!(!info.in_slow());
        assert_eq!(info.insertion_count(), 0xfffff);
        let wrapped = info.with_insertion_count(0xfffff_u32.wrapping_add(1));
        assert_eq!(wrapped.insertion_count(), 0);
    }

    #[test]
    fn virtual_offsets_order_by_list_position() {
        let shift = 24;
        let a = virtual_offset(0, 1 << 23, shift);
        let b = virtual_offset(1, 0, shift);
        let c = virtual_offset(1, 1 << 23, shift);
        assert!(a < b && b < c);
    }
}
