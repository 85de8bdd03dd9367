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

//! Fixed pool of page-aligned buffers shared with the kernel.
//!
//! The whole pool is a single aligned allocation carved into equally sized
//! buffers so it can be registered with the ring in one go. Exhaustion is
//! surfaced to initiators as back-pressure, never as blocking.

use std::{cell::RefCell, rc::Rc, slice};

use crate::{Error, Result};

pub(crate) const BUFFER_ALIGN: usize = 4096;

struct PoolShared {
    base: *mut u8,
    buf_size: usize,
    count: usize,
    free: RefCell<Vec<u16>>,
}

impl Drop for PoolShared {
    fn drop(&mut self) {
        unsafe { libc::free(self.base as *mut libc::c_void) }
    }
}

/// The engine's pool of direct-i/o buffers.
pub struct BufferPool {
    shared: Rc<PoolShared>,
}

impl BufferPool {
    pub(crate) fn new(count: usize, buf_size: usize) -> Result<BufferPool> {
        assert!(buf_size % BUFFER_ALIGN == 0, "buffer size must be page aligned");
        assert!(count > 0 && count <= u16::MAX as usize);
        let mut base: *mut libc::c_void = std::ptr::null_mut();
        let rc = unsafe { libc::posix_memalign(&mut base, BUFFER_ALIGN, count * buf_size) };
        if rc != 0 {
            return Err(crate::os_error(rc));
        }
        let free = (0..count as u16).rev().collect();
        Ok(BufferPool {
            shared: Rc::new(PoolShared {
                base: base as *mut u8,
                buf_size,
                count,
                free: RefCell::new(free),
            }),
        })
    }

    /// Size in bytes of each buffer in the pool.
    pub fn buffer_size(&self) -> usize {
        self.shared.buf_size
    }

    /// Number of buffers currently available for acquisition.
    pub fn available(&self) -> usize {
        self.shared.free.borrow().len()
    }

    /// The iovec array describing every buffer, for kernel registration.
    pub(crate) fn iovecs(&self) -> Vec<libc::iovec> {
        (0..self.shared.count)
            .map(|i| libc::iovec {
                iov_base: unsafe { self.shared.base.add(i * self.shared.buf_size) }
                    as *mut libc::c_void,
                iov_len: self.shared.buf_size,
            })
            .collect()
    }

    /// Acquires a read buffer, failing with back-pressure when none is
    /// free.
    pub fn acquire_read(&self) -> Result<ReadBuffer> {
        let index = self
            .shared
            .free
            .borrow_mut()
            .pop()
            .ok_or(Error::BufferPoolExhausted)?;
        Ok(ReadBuffer {
            shared: self.shared.clone(),
            index,
            filled: 0,
        })
    }

    /// Acquires a write buffer, failing with back-pressure when none is
    /// free.
    pub fn acquire_write(&self) -> Result<WriteBuffer> {
        let index = self
            .shared
            .free
            .borrow_mut()
            .pop()
            .ok_or(Error::BufferPoolExhausted)?;
        Ok(WriteBuffer {
            shared: self.shared.clone(),
            index,
            len: 0,
        })
    }
}

fn buffer_ptr(shared: &PoolShared, index: u16) -> *mut u8 {
    unsafe { shared.base.add(index as usize * shared.buf_size) }
}

/// A page-aligned buffer a read operation fills. Returned to the pool when
/// dropped.
pub struct ReadBuffer {
    shared: Rc<PoolShared>,
    index: u16,
    filled: usize,
}

impl ReadBuffer {
    pub(crate) fn registered_index(&self) -> u16 {
        self.index
    }

    pub(crate) fn as_mut_ptr(&mut self) -> *mut u8 {
        buffer_ptr(&self.shared, self.index)
    }

    pub(crate) fn set_filled(&mut self, filled: usize) {
        debug_assert!(filled <= self.capacity());
        self.filled = filled;
    }

    /// Capacity of the underlying buffer.
    pub fn capacity(&self) -> usize {
        self.shared.buf_size
    }

    /// The portion of the buffer filled by the completed read.
    pub fn filled(&self) -> &[u8] {
        unsafe { slice::from_raw_parts(buffer_ptr(&self.shared, self.index), self.filled) }
    }

    /// Number of bytes the read transferred.
    pub fn len(&self) -> usize {
        self.filled
    }

    pub fn is_empty(&self) -> bool {
        self.filled == 0
    }
}

impl Drop for ReadBuffer {
    fn drop(&mut self) {
        self.shared.free.borrow_mut().push(self.index);
    }
}

/// A page-aligned buffer the caller fills before connecting it to a write
/// operation. Returned to the pool when dropped.
pub struct WriteBuffer {
    shared: Rc<PoolShared>,
    index: u16,
    len: usize,
}

impl WriteBuffer {
    pub(crate) fn registered_index(&self) -> u16 {
        self.index
    }

    pub(crate) fn as_ptr(&self) -> *const u8 {
        buffer_ptr(&self.shared, self.index)
    }

    /// Capacity of the underlying buffer.
    pub fn capacity(&self) -> usize {
        self.shared.buf_size
    }

    /// Bytes staged for writing.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Copies `data` into the buffer, replacing any previous content.
    pub fn fill_from(&mut self, data: &[u8]) {
        assert!(data.len() <= self.capacity());
        unsafe {
            std::ptr::copy_nonoverlapping(
                data.as_ptr(),
                buffer_ptr(&self.shared, self.index),
                data.len(),
            );
        }
        self.len = data.len();
    }

    /// Direct mutable access to the full buffer; pair with `set_len`.
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        unsafe {
            slice::from_raw_parts_mut(buffer_ptr(&self.shared, self.index), self.shared.buf_size)
        }
    }

    /// Declares how many staged bytes the write shall transfer.
    pub fn set_len(&mut self, len: usize) {
        assert!(len <= self.capacity());
        self.len = len;
    }

    /// The staged bytes.
    pub fn staged(&self) -> &[u8] {
        unsafe { slice::from_raw_parts(buffer_ptr(&self.shared, self.index), self.len) }
    }
}

impl Drop for WriteBuffer {
    fn drop(&mut self) {
        self.shared.free.borrow_mut().push(self.index);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exhaustion_is_back_pressure() {
        let pool = BufferPool::new(2, 4096).unwrap();
        let a = pool.acquire_read().unwrap();
        let _b = pool.acquire_read().unwrap();
        assert!(matches!(pool.acquire_read(), Err(Error::BufferPoolExhausted)));
        drop(a);
        assert!(pool.acquire_read().is_ok());
    }

    #[test]
    fn write_buffer_round_trip() {
        let pool = BufferPool::new(1, 4096).unwrap();
        let mut buf = pool.acquire_write().unwrap();
        buf.fill_from(b"hello");
        assert_eq!(buf.staged(), b"hello");
        assert_eq!(buf.len(), 5);
    }
}
