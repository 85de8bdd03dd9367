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

//! Ring file layout, initialisation and memory mapping.

use std::{
    fs::File,
    os::unix::io::AsRawFd,
    path::Path,
    sync::atomic::{AtomicU64, Ordering},
};

use crate::{
    iter::EventIterator, recorder::EventRecorder, ContentType, Error, EventDescriptor, Result,
    RingSize, HEADER_VERSION, PAGE_2MB,
};

// Header field offsets within the first page; fixed by the repr(C) layout
// documented in the crate root.
const MAGIC_OFFSET: usize = 0;
const CONTENT_TYPE_OFFSET: usize = 8;
const SCHEMA_HASH_OFFSET: usize = 16;
const SIZE_OFFSET: usize = 48;
const CONTROL_OFFSET: usize = 72;

/// The three shared control words live together in the header.
#[repr(C)]
pub(crate) struct RingControl {
    pub last_seqno: AtomicU64,
    pub next_payload_byte: AtomicU64,
    pub buffer_window_start: AtomicU64,
}

/// How a ring is mapped into this process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapMode {
    ReadOnly,
    ReadWrite,
}

impl MapMode {
    fn prot(self) -> libc::c_int {
        match self {
            MapMode::ReadOnly => libc::PROT_READ,
            MapMode::ReadWrite => libc::PROT_READ | libc::PROT_WRITE,
        }
    }
}

fn mmap_section(
    addr: *mut libc::c_void,
    len: u64,
    prot: libc::c_int,
    flags: libc::c_int,
    fd: libc::c_int,
    offset: u64,
) -> Result<*mut u8> {
    let ptr = unsafe { libc::mmap(addr, len as usize, prot, flags, fd, offset as libc::off_t) };
    if ptr == libc::MAP_FAILED {
        return Err(Error::Io(std::io::Error::last_os_error()));
    }
    Ok(ptr as *mut u8)
}

/// Initialises the ring structure inside an already sized file region.
///
/// The whole header page is zeroed to erase stale data from prior use, and
/// every descriptor's sequence number field must start out zero for
/// readers to detect validity, so the descriptor array is zeroed too.
pub fn init_ring_file(
    file: &File,
    ring_offset: u64,
    size: &RingSize,
    content_type: ContentType,
    schema_hash: &[u8; 32],
) -> Result<()> {
    size.validate()?;
    if content_type == ContentType::None {
        return Err(Error::InvalidContentType(content_type as u16));
    }
    let ring_bytes = size.storage_bytes();
    let file_len = file.metadata().map_err(Error::Io)?.len();
    if ring_offset + ring_bytes > file_len {
        return Err(Error::FileTooSmall {
            needed: ring_offset + ring_bytes,
            have: file_len,
        });
    }

    let descriptor_bytes = size.descriptor_capacity * std::mem::size_of::<EventDescriptor>() as u64;
    let init_len = PAGE_2MB + descriptor_bytes;
    let base = mmap_section(
        std::ptr::null_mut(),
        init_len,
        libc::PROT_READ | libc::PROT_WRITE,
        libc::MAP_SHARED,
        file.as_raw_fd(),
        ring_offset,
    )?;

    unsafe {
        std::ptr::write_bytes(base, 0, init_len as usize);
        let header = std::slice::from_raw_parts_mut(base, PAGE_2MB as usize);
        header[MAGIC_OFFSET..MAGIC_OFFSET + 8].copy_from_slice(&HEADER_VERSION);
        header[CONTENT_TYPE_OFFSET..CONTENT_TYPE_OFFSET + 2]
            .copy_from_slice(&(content_type as u16).to_le_bytes());
        header[SCHEMA_HASH_OFFSET..SCHEMA_HASH_OFFSET + 32].copy_from_slice(schema_hash);
        header[SIZE_OFFSET..SIZE_OFFSET + 8]
            .copy_from_slice(&size.descriptor_capacity.to_le_bytes());
        header[SIZE_OFFSET + 8..SIZE_OFFSET + 16]
            .copy_from_slice(&size.payload_buf_size.to_le_bytes());
        header[SIZE_OFFSET + 16..SIZE_OFFSET + 24]
            .copy_from_slice(&size.context_area_size.to_le_bytes());
        libc::munmap(base as *mut libc::c_void, init_len as usize);
    }
    debug!(
        target: "eventring",
        "initialised ring: {} descriptors, {} payload bytes",
        size.descriptor_capacity,
        size.payload_buf_size
    );
    Ok(())
}

/// Creates and sizes a fresh ring file at `path`, then initialises it.
pub fn create_ring_file(
    path: &Path,
    size: &RingSize,
    content_type: ContentType,
    schema_hash: &[u8; 32],
) -> Result<File> {
    let file = std::fs::OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(true)
        .open(path)
        .map_err(Error::Io)?;
    file.set_len(size.storage_bytes()).map_err(Error::Io)?;
    init_ring_file(&file, 0, size, content_type, schema_hash)?;
    Ok(file)
}

/// A mapped event ring.
///
/// The payload buffer is mapped twice contiguously: an anonymous
/// reservation of twice the buffer size is taken first, then the buffer is
/// mapped into both halves, so a payload that crosses the end of the
/// buffer wraps around in plain linear memory.
pub struct EventRing {
    mode: MapMode,
    header: *mut u8,
    descriptors: *mut EventDescriptor,
    payload_buf: *mut u8,
    context_area: *mut u8,
    size: RingSize,
    content_type: ContentType,
    schema_hash: [u8; 32],
}

// The maps are MAP_SHARED memory whose mutation protocol is entirely
// atomic-based; the pointers themselves never change after construction.
unsafe impl Send for EventRing {}
unsafe impl Sync for EventRing {}

impl EventRing {
    /// Maps the ring stored in `file` at `ring_offset`.
    pub fn map(file: &File, mode: MapMode, ring_offset: u64) -> Result<EventRing> {
        let fd = file.as_raw_fd();
        let prot = mode.prot();
        let header = mmap_section(
            std::ptr::null_mut(),
            PAGE_2MB,
            prot,
            libc::MAP_SHARED,
            fd,
            ring_offset,
        )?;

        let header_bytes = unsafe { std::slice::from_raw_parts(header, PAGE_2MB as usize) };
        if header_bytes[MAGIC_OFFSET..MAGIC_OFFSET + 8] != HEADER_VERSION {
            unsafe { libc::munmap(header as *mut libc::c_void, PAGE_2MB as usize) };
            return Err(Error::BadMagic);
        }
        let read_u64 = |off: usize| {
            u64::from_le_bytes(header_bytes[off..off + 8].try_into().expect("8 byte slice"))
        };
        let size = RingSize {
            descriptor_capacity: read_u64(SIZE_OFFSET),
            payload_buf_size: read_u64(SIZE_OFFSET + 8),
            context_area_size: read_u64(SIZE_OFFSET + 16),
        };
        let content_code = u16::from_le_bytes(
            header_bytes[CONTENT_TYPE_OFFSET..CONTENT_TYPE_OFFSET + 2]
                .try_into()
                .expect("2 byte slice"),
        );
        let content_type = match ContentType::from_u16(content_code) {
            Some(ct) => ct,
            None => {
                unsafe { libc::munmap(header as *mut libc::c_void, PAGE_2MB as usize) };
                return Err(Error::InvalidContentType(content_code));
            }
        };
        let mut schema_hash = [0u8; 32];
        schema_hash.copy_from_slice(&header_bytes[SCHEMA_HASH_OFFSET..SCHEMA_HASH_OFFSET + 32]);

        let base_data_offset = ring_offset + PAGE_2MB;
        let descriptor_bytes =
            size.descriptor_capacity * std::mem::size_of::<EventDescriptor>() as u64;

        let mut ring = EventRing {
            mode,
            header,
            descriptors: std::ptr::null_mut(),
            payload_buf: std::ptr::null_mut(),
            context_area: std::ptr::null_mut(),
            size,
            content_type,
            schema_hash,
        };

        ring.descriptors = mmap_section(
            std::ptr::null_mut(),
            descriptor_bytes,
            prot,
            libc::MAP_SHARED,
            fd,
            base_data_offset,
        )? as *mut EventDescriptor;

        // Reserve twice the payload buffer, then pin the buffer into both
        // halves of the reservation.
        let reservation = mmap_section(
            std::ptr::null_mut(),
            2 * size.payload_buf_size,
            prot,
            libc::MAP_SHARED | libc::MAP_ANONYMOUS,
            -1,
            0,
        )?;
        ring.payload_buf = reservation;
        let payload_file_offset = base_data_offset + descriptor_bytes;
        mmap_section(
            reservation as *mut libc::c_void,
            size.payload_buf_size,
            prot,
            libc::MAP_SHARED | libc::MAP_FIXED,
            fd,
            payload_file_offset,
        )?;
        mmap_section(
            unsafe { reservation.add(size.payload_buf_size as usize) } as *mut libc::c_void,
            size.payload_buf_size,
            prot,
            libc::MAP_SHARED | libc::MAP_FIXED,
            fd,
            payload_file_offset,
        )?;

        if size.context_area_size > 0 {
            ring.context_area = mmap_section(
                std::ptr::null_mut(),
                size.context_area_size,
                prot,
                libc::MAP_SHARED,
                fd,
                payload_file_offset + size.payload_buf_size,
            )?;
        }

        Ok(ring)
    }

    pub fn size(&self) -> &RingSize {
        &self.size
    }

    pub fn content_type(&self) -> ContentType {
        self.content_type
    }

    pub fn schema_hash(&self) -> &[u8; 32] {
        &self.schema_hash
    }

    pub(crate) fn control(&self) -> &RingControl {
        unsafe { &*(self.header.add(CONTROL_OFFSET) as *const RingControl) }
    }

    pub(crate) fn descriptors(&self) -> *mut EventDescriptor {
        self.descriptors
    }

    pub(crate) fn payload_base(&self) -> *mut u8 {
        self.payload_buf
    }

    /// Mapped context area, if the ring carries one.
    pub fn context_area(&self) -> Option<&[u8]> {
        if self.context_area.is_null() {
            None
        } else {
            Some(unsafe {
                std::slice::from_raw_parts(self.context_area, self.size.context_area_size as usize)
            })
        }
    }

    /// Live value of the last allocated sequence number.
    pub fn last_seqno(&self) -> u64 {
        self.control().last_seqno.load(Ordering::Acquire)
    }

    /// A reader positioned at the current end of the ring.
    pub fn iterator(&self) -> EventIterator {
        EventIterator::new(self)
    }

    /// A recorder for this ring; requires a writable mapping.
    pub fn recorder(&self) -> Result<EventRecorder> {
        if self.mode != MapMode::ReadWrite {
            return Err(Error::WrongProtection("writing"));
        }
        Ok(EventRecorder::new(self))
    }

    /// Borrows the payload of a copied descriptor.
    ///
    /// The bytes peeked through the mapped buffer may be overwritten by a
    /// recorder at any time; call `payload_check` after consuming them and
    /// discard the event if it fails.
    pub fn payload_peek<'a>(&'a self, event: &'a EventDescriptor) -> &'a [u8] {
        if event.inline_payload != 0 {
            return &event.payload[..event.payload_size as usize];
        }
        let mask = self.size.payload_buf_size - 1;
        unsafe {
            std::slice::from_raw_parts(
                self.payload_buf.add((event.payload_buf_offset & mask) as usize),
                event.payload_size as usize,
            )
        }
    }

    /// Returns whether the payload region of `event` is still inside the
    /// valid window, i.e. has not been overwritten since the descriptor
    /// was copied.
    pub fn payload_check(&self, event: &EventDescriptor) -> bool {
        if event.inline_payload != 0 {
            return true;
        }
        let window_start = self.control().buffer_window_start.load(Ordering::Acquire);
        event.payload_buf_offset >= window_start
    }

    /// Copies the descriptor holding `seqno`, if it is still in the ring.
    pub fn try_copy(&self, seqno: u64) -> Option<EventDescriptor> {
        if seqno == 0 {
            return None;
        }
        let mask = self.size.descriptor_capacity - 1;
        let slot = unsafe { self.descriptors.add(((seqno - 1) & mask) as usize) };
        let seq_atomic = unsafe { &*(slot as *const AtomicU64) };
        if seq_atomic.load(Ordering::Acquire) != seqno {
            return None;
        }
        let copy = unsafe { std::ptr::read_volatile(slot) };
        // Re-check after the copy: a recorder zeroes the field before
        // reusing the slot, so a stable value brackets a consistent copy.
        if seq_atomic.load(Ordering::Acquire) != seqno {
            return None;
        }
        Some(copy)
    }
}

impl Drop for EventRing {
    fn drop(&mut self) {
        unsafe {
            if !self.descriptors.is_null() {
                libc::munmap(
                    self.descriptors as *mut libc::c_void,
                    (self.size.descriptor_capacity * std::mem::size_of::<EventDescriptor>() as u64)
                        as usize,
                );
            }
            if !self.payload_buf.is_null() {
                libc::munmap(
                    self.payload_buf as *mut libc::c_void,
                    (2 * self.size.payload_buf_size) as usize,
                );
            }
            if !self.context_area.is_null() {
                libc::munmap(
                    self.context_area as *mut libc::c_void,
                    self.size.context_area_size as usize,
                );
            }
            libc::munmap(self.header as *mut libc::c_void, PAGE_2MB as usize);
        }
    }
}
