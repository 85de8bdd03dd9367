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

//! A zone chunk from storage, always handed out behind an `Arc`.
//!
//! The last holder dropping its handle releases any per-chunk resources; in
//! the emulation layer the file descriptors belong to the device and only
//! the device reference is released.

use std::{os::unix::io::RawFd, sync::Arc};

use crate::{device::DeviceInner, errno, ChunkKind, Error, Result};

// ioctl issuing a discard to a whole block device range, _IO(0x12, 119).
const BLKDISCARD: libc::c_ulong = 0x1277;

/// A fixed-capacity span of a backing device.
///
/// Conventional chunks accept random writes anywhere inside the span and
/// always report themselves full. Sequential chunks only accept appends at
/// the implicit write pointer persisted in the device tail metadata.
pub struct Chunk {
    device: Arc<DeviceInner>,
    device_index: u32,
    chunk_index: u32,
    zone_id: u32,
    append_only: bool,
    read_only: bool,
}

impl Chunk {
    pub(crate) fn new(
        device: Arc<DeviceInner>,
        device_index: u32,
        chunk_index: u32,
        zone_id: u32,
        append_only: bool,
        read_only: bool,
    ) -> Chunk {
        Chunk {
            device,
            device_index,
            chunk_index,
            zone_id,
            append_only,
            read_only,
        }
    }

    /// Index of the owning device in `StoragePool::devices()`.
    pub fn device_index(&self) -> u32 {
        self.device_index
    }

    /// Returns whether this chunk is a conventional write chunk.
    pub fn is_conventional_write(&self) -> bool {
        !self.append_only
    }

    /// Returns whether this chunk is a sequential write chunk.
    pub fn is_sequential_write(&self) -> bool {
        self.append_only
    }

    /// Returns the type of zone and the id within that zone (each starts
    /// from zero).
    pub fn zone_id(&self) -> (ChunkKind, u32) {
        if self.append_only {
            (ChunkKind::Seq, self.zone_id)
        } else {
            (ChunkKind::Cnv, self.zone_id)
        }
    }

    /// Returns the capacity of the zone.
    pub fn capacity(&self) -> u64 {
        self.device.chunk_capacity()
    }

    /// Absolute byte offset of this chunk within its device.
    fn base_offset(&self) -> u64 {
        self.device.chunk_offset(self.chunk_index)
    }

    /// Returns a file descriptor able to read from the chunk, along with
    /// the offset which must be added to any i/o performed with it.
    pub fn read_fd(&self) -> (RawFd, u64) {
        (self.device.read_raw_fd(), self.base_offset())
    }

    /// Returns a page-cached file descriptor for small metadata i/o
    /// inside the chunk, exempt from direct-i/o alignment rules. Only
    /// conventional chunks carry metadata.
    pub fn cached_rw_fd(&self) -> (RawFd, u64) {
        (self.device.cached_raw_fd(), self.base_offset())
    }

    /// Returns a file descriptor able to write to the chunk, along with the
    /// offset pointing at the next append position.
    ///
    /// For sequential chunks the zone append pointer is advanced by
    /// `bytes_which_shall_be_written` before returning, so the caller owns
    /// the returned span exclusively.
    pub fn write_fd(&self, bytes_which_shall_be_written: u64) -> Result<(RawFd, u64)> {
        if self.read_only {
            return Err(Error::ReadOnly);
        }
        if !self.append_only {
            return Ok((self.device.write_raw_fd(), self.base_offset()));
        }
        let capacity = self.capacity();
        let used = self.device.bytes_used(self.chunk_index) as u64;
        if used + bytes_which_shall_be_written > capacity {
            return Err(Error::AppendOverflow {
                capacity,
                used,
                requested: bytes_which_shall_be_written,
            });
        }
        let previous = self
            .device
            .advance_bytes_used(self.chunk_index, bytes_which_shall_be_written as u32);
        Ok((self.device.write_raw_fd(), self.base_offset() + previous as u64))
    }

    /// Returns the current amount of the zone filled with data.
    /// Conventional chunks are always full.
    pub fn size(&self) -> u64 {
        if self.append_only {
            self.device.bytes_used(self.chunk_index) as u64
        } else {
            self.capacity()
        }
    }

    fn discard_range(&self, offset: u64, len: u64) -> Result<()> {
        let fd = self.device.write_raw_fd();
        let ret = if self.device.is_block() {
            let range: [u64; 2] = [offset, len];
            unsafe { libc::ioctl(fd, BLKDISCARD, range.as_ptr()) }
        } else {
            unsafe {
                libc::fallocate(
                    fd,
                    libc::FALLOC_FL_PUNCH_HOLE | libc::FALLOC_FL_KEEP_SIZE,
                    offset as libc::off_t,
                    len as libc::off_t,
                )
            }
        };
        if ret == -1 {
            return Err(Error::Io(errno()));
        }
        Ok(())
    }

    /// Destroys the contents of the chunk, releasing the backing storage
    /// for use by others. Sequential chunks have their zone append pointer
    /// reset; a subsequent read of the emulated zone returns zeroes.
    pub fn destroy_contents(&self) -> Result<()> {
        if self.read_only {
            return Err(Error::ReadOnly);
        }
        self.discard_range(self.base_offset(), self.capacity())?;
        if self.append_only {
            self.device.set_bytes_used(self.chunk_index, 0);
        }
        trace!(target: "pool", "destroyed contents of chunk {:?}", self.zone_id());
        Ok(())
    }

    /// Clones part or all of the contents of this chunk into another chunk,
    /// using kernel copy offload where available. The destination chunk
    /// must be empty if it is sequential append only.
    ///
    /// Returns the number of bytes cloned.
    pub fn clone_contents_into(&self, other: &Chunk, bytes: u32) -> Result<u32> {
        if other.read_only {
            return Err(Error::ReadOnly);
        }
        if other.append_only && other.size() != 0 {
            return Err(Error::DestinationNotEmpty);
        }
        let to_copy = (bytes as u64).min(self.size());
        let (src_fd, src_base) = self.read_fd();
        let dst_fd = other.device.write_raw_fd();
        let dst_base = other.base_offset();

        let mut copied: u64 = 0;
        while copied < to_copy {
            let mut off_in = (src_base + copied) as libc::loff_t;
            let mut off_out = (dst_base + copied) as libc::loff_t;
            let n = unsafe {
                libc::copy_file_range(
                    src_fd,
                    &mut off_in,
                    dst_fd,
                    &mut off_out,
                    (to_copy - copied) as usize,
                    0,
                )
            };
            if n == -1 {
                let err = errno();
                match err.raw_os_error() {
                    // Kernel offload unavailable across these devices;
                    // fall back to a bounce copy.
                    Some(libc::EXDEV) | Some(libc::ENOSYS) | Some(libc::EINVAL) => {
                        copied += bounce_copy(
                            src_fd,
                            src_base + copied,
                            dst_fd,
                            dst_base + copied,
                            to_copy - copied,
                        )?;
                        break;
                    }
                    _ => return Err(Error::Io(err)),
                }
            } else if n == 0 {
                break;
            } else {
                copied += n as u64;
            }
        }
        if other.append_only {
            other.device.set_bytes_used(other.chunk_index, copied as u32);
        }
        Ok(copied as u32)
    }

    /// Tries to trim the contents of the chunk by discarding `bytes` from
    /// the tail. Returns `false` when this cannot be done efficiently.
    pub fn try_trim_contents(&self, bytes: u32) -> bool {
        if self.read_only || !self.append_only {
            return false;
        }
        let used = self.size();
        if bytes as u64 > used {
            return false;
        }
        let new_used = used - bytes as u64;
        if self
            .discard_range(self.base_offset() + new_used, bytes as u64)
            .is_err()
        {
            return false;
        }
        self.device.set_bytes_used(self.chunk_index, new_used as u32);
        true
    }
}

fn bounce_copy(src_fd: RawFd, src_off: u64, dst_fd: RawFd, dst_off: u64, len: u64) -> Result<u64> {
    let mut buf = vec![0u8; 1 << 20];
    let mut copied: u64 = 0;
    while copied < len {
        let want = buf.len().min((len - copied) as usize);
        let n = unsafe {
            libc::pread(
                src_fd,
                buf.as_mut_ptr() as *mut libc::c_void,
                want,
                (src_off + copied) as libc::off_t,
            )
        };
        if n == -1 {
            return Err(Error::Io(errno()));
        }
        if n == 0 {
            break;
        }
        let w = unsafe {
            libc::pwrite(
                dst_fd,
                buf.as_ptr() as *const libc::c_void,
                n as usize,
                (dst_off + copied) as libc::off_t,
            )
        };
        if w != n {
            return Err(Error::Io(errno()));
        }
        copied += n as u64;
    }
    Ok(copied)
}
