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

//! The sender kinds understood by the engine.
//!
//! A sender is a parameterised description of an operation: the target fd
//! and offset, the buffers, the deadline. Buffer-carrying senders acquire
//! their buffers at submission time so that queued operations exert no
//! pressure on the pool.

use std::{os::unix::io::RawFd, time::Duration};

use io_uring::{opcode, types};
use storage_pool::Chunk;

use crate::{
    buffer::{ReadBuffer, WriteBuffer},
    operation::{OpResult, Prepared},
    os_error, AsyncIo, Error, Priority, Result,
};

/// A read into a single buffer from the engine's registered pool.
///
/// Initiation fails with `BufferPoolExhausted` back-pressure when the pool
/// is dry; wrap the receiver in a retry queue if that matters.
pub struct ReadSingleBufferSender {
    fd: RawFd,
    offset: u64,
    len: usize,
    priority: Priority,
    buf: Option<ReadBuffer>,
}

impl ReadSingleBufferSender {
    pub fn new(fd: RawFd, offset: u64, len: usize) -> ReadSingleBufferSender {
        ReadSingleBufferSender {
            fd,
            offset,
            len,
            priority: Priority::Normal,
            buf: None,
        }
    }

    /// Reads `len` bytes from `offset` within the chunk.
    pub fn from_chunk(chunk: &Chunk, offset_in_chunk: u64, len: usize) -> ReadSingleBufferSender {
        let (fd, base) = chunk.read_fd();
        Self::new(fd, base + offset_in_chunk, len)
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub(crate) fn prepare(&mut self, io: &AsyncIo) -> Result<Prepared> {
        if self.len > io.buffers().buffer_size() {
            return Err(Error::ShortTransfer {
                expected: self.len,
                got: io.buffers().buffer_size(),
            });
        }
        let mut buf = match self.buf.take() {
            Some(buf) => buf,
            None => io.buffers().acquire_read()?,
        };
        let entry = if io.buffers_registered() {
            opcode::ReadFixed::new(
                types::Fd(self.fd),
                buf.as_mut_ptr(),
                self.len as _,
                buf.registered_index(),
            )
            .offset(self.offset as _)
            .ioprio(self.priority.to_ioprio())
            .build()
        } else {
            opcode::Read::new(types::Fd(self.fd), buf.as_mut_ptr(), self.len as _)
                .offset(self.offset as _)
                .ioprio(self.priority.to_ioprio())
                .build()
        };
        self.buf = Some(buf);
        Ok(Prepared::Entry(entry))
    }

    pub(crate) fn complete(&mut self, raw: Result<usize>) -> OpResult {
        match raw {
            Ok(n) => {
                let mut buf = self.buf.take().expect("read completed without a buffer");
                buf.set_filled(n);
                OpResult::ReadBuffer(Ok(buf))
            }
            Err(err) => {
                self.buf = None;
                OpResult::ReadBuffer(Err(err))
            }
        }
    }
}

/// A scatter read into several buffers from the engine's pool.
pub struct ReadScatterSender {
    fd: RawFd,
    offset: u64,
    len: usize,
    priority: Priority,
    bufs: Vec<ReadBuffer>,
    iovecs: Vec<libc::iovec>,
}

impl ReadScatterSender {
    pub fn new(fd: RawFd, offset: u64, len: usize) -> ReadScatterSender {
        ReadScatterSender {
            fd,
            offset,
            len,
            priority: Priority::Normal,
            bufs: Vec::new(),
            iovecs: Vec::new(),
        }
    }

    pub fn from_chunk(chunk: &Chunk, offset_in_chunk: u64, len: usize) -> ReadScatterSender {
        let (fd, base) = chunk.read_fd();
        Self::new(fd, base + offset_in_chunk, len)
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub(crate) fn prepare(&mut self, io: &AsyncIo) -> Result<Prepared> {
        let buf_size = io.buffers().buffer_size();
        let needed = self.len.div_ceil(buf_size);
        while self.bufs.len() < needed {
            match io.buffers().acquire_read() {
                Ok(buf) => self.bufs.push(buf),
                Err(err) => {
                    // Give back what we already took; a half-acquired
                    // scatter starves other initiators.
                    self.bufs.clear();
                    return Err(err);
                }
            }
        }
        let mut remaining = self.len;
        self.iovecs.clear();
        for buf in self.bufs.iter_mut() {
            let this = remaining.min(buf_size);
            self.iovecs.push(libc::iovec {
                iov_base: buf.as_mut_ptr() as *mut libc::c_void,
                iov_len: this,
            });
            remaining -= this;
        }
        let entry = opcode::Readv::new(
            types::Fd(self.fd),
            self.iovecs.as_ptr(),
            self.iovecs.len() as _,
        )
        .offset(self.offset as _)
        .ioprio(self.priority.to_ioprio())
        .build();
        Ok(Prepared::Entry(entry))
    }

    pub(crate) fn complete(&mut self, raw: Result<usize>) -> OpResult {
        match raw {
            Ok(mut n) => {
                let mut bufs = std::mem::take(&mut self.bufs);
                for buf in bufs.iter_mut() {
                    let this = n.min(buf.capacity());
                    buf.set_filled(this);
                    n -= this;
                }
                OpResult::ScatterBuffers(Ok(bufs))
            }
            Err(err) => {
                self.bufs.clear();
                OpResult::ScatterBuffers(Err(err))
            }
        }
    }
}

/// A write of a staged buffer.
pub struct WriteSender {
    fd: RawFd,
    offset: u64,
    priority: Priority,
    buf: Option<WriteBuffer>,
}

impl WriteSender {
    pub fn new(fd: RawFd, offset: u64, buf: WriteBuffer) -> WriteSender {
        WriteSender {
            fd,
            offset,
            priority: Priority::Normal,
            buf: Some(buf),
        }
    }

    /// Appends the staged buffer to a sequential chunk (or writes at the
    /// base of a conventional one). The zone append pointer is claimed
    /// here, at sender construction.
    pub fn append_to_chunk(chunk: &Chunk, buf: WriteBuffer) -> storage_pool::Result<WriteSender> {
        let (fd, offset) = chunk.write_fd(buf.len() as u64)?;
        Ok(WriteSender::new(fd, offset, buf))
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub(crate) fn prepare(&mut self, _io: &AsyncIo) -> Result<Prepared> {
        let buf = self.buf.as_ref().expect("write sender has no staged buffer");
        let entry = opcode::Write::new(types::Fd(self.fd), buf.as_ptr(), buf.len() as _)
            .offset(self.offset as _)
            .ioprio(self.priority.to_ioprio())
            .build();
        Ok(Prepared::Entry(entry))
    }

    pub(crate) fn complete(&mut self, raw: Result<usize>) -> OpResult {
        let buf = self.buf.take().expect("write completed without a buffer");
        match raw {
            Ok(n) if n == buf.len() => OpResult::WriteBuffer(Ok(buf)),
            Ok(n) => OpResult::WriteBuffer(Err(Error::ShortTransfer {
                expected: buf.len(),
                got: n,
            })),
            Err(err) => OpResult::WriteBuffer(Err(err)),
        }
    }
}

#[derive(Clone, Copy)]
enum TimeoutSpec {
    Relative(Duration),
    AbsoluteMonotonic(libc::timespec),
    AbsoluteWallclock(libc::timespec),
}

/// Delivers `Ok(())` once the delay elapses or the deadline passes.
///
/// Cancellable by dropping the connected operation before initiation, or
/// through `AsyncIo::cancel` afterwards.
pub struct TimeoutSender {
    spec: TimeoutSpec,
    // Lives here so the kernel sees a stable address for the whole
    // lifetime of the submission.
    ts: types::Timespec,
}

impl TimeoutSender {
    pub fn relative(delay: Duration) -> TimeoutSender {
        TimeoutSender {
            spec: TimeoutSpec::Relative(delay),
            ts: types::Timespec::new(),
        }
    }

    pub fn deadline_monotonic(deadline: libc::timespec) -> TimeoutSender {
        TimeoutSender {
            spec: TimeoutSpec::AbsoluteMonotonic(deadline),
            ts: types::Timespec::new(),
        }
    }

    pub fn deadline_wallclock(deadline: libc::timespec) -> TimeoutSender {
        TimeoutSender {
            spec: TimeoutSpec::AbsoluteWallclock(deadline),
            ts: types::Timespec::new(),
        }
    }

    pub(crate) fn prepare(&mut self) -> Result<Prepared> {
        let (ts, flags) = match self.spec {
            TimeoutSpec::Relative(delay) => (
                types::Timespec::new()
                    .sec(delay.as_secs())
                    .nsec(delay.subsec_nanos()),
                types::TimeoutFlags::empty(),
            ),
            TimeoutSpec::AbsoluteMonotonic(ts) => (
                types::Timespec::new().sec(ts.tv_sec as u64).nsec(ts.tv_nsec as u32),
                types::TimeoutFlags::ABS,
            ),
            TimeoutSpec::AbsoluteWallclock(ts) => (
                types::Timespec::new().sec(ts.tv_sec as u64).nsec(ts.tv_nsec as u32),
                types::TimeoutFlags::ABS | types::TimeoutFlags::REALTIME,
            ),
        };
        self.ts = ts;
        let entry = opcode::Timeout::new(&self.ts as *const types::Timespec)
            .flags(flags)
            .build();
        Ok(Prepared::Entry(entry))
    }

    pub(crate) fn complete(&mut self, raw: Result<usize>) -> OpResult {
        match raw {
            // Expiry is reported by the kernel as ETIME; that is the
            // success case for a timeout.
            Err(Error::Io(ref err)) if err.raw_os_error() == Some(libc::ETIME) => {
                OpResult::Unit(Ok(()))
            }
            Err(Error::Io(ref err)) if err.raw_os_error() == Some(libc::ECANCELED) => {
                OpResult::Unit(Err(Error::Cancelled))
            }
            Err(err) => OpResult::Unit(Err(err)),
            Ok(_) => OpResult::Unit(Ok(())),
        }
    }
}

/// The sole operation kind which may be connected off-thread: it performs
/// no kernel i/o and completes immediately once the owning thread picks it
/// up from the handoff slot.
pub struct ThreadsafeSender;

impl ThreadsafeSender {
    pub fn new() -> ThreadsafeSender {
        ThreadsafeSender
    }

    pub(crate) fn prepare(&mut self) -> Result<Prepared> {
        Ok(Prepared::Immediate(OpResult::Unit(Ok(()))))
    }

    pub(crate) fn complete(&mut self, raw: Result<usize>) -> OpResult {
        OpResult::Unit(raw.map(|_| ()))
    }
}

impl Default for ThreadsafeSender {
    fn default() -> Self {
        ThreadsafeSender::new()
    }
}

pub(crate) fn raw_result(res: i32) -> Result<usize> {
    if res < 0 {
        Err(os_error(-res))
    } else {
        Ok(res as usize)
    }
}
