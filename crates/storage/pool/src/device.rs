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

//! A source of backing storage for the pool, with its persistent tail
//! metadata.
//!
//! The tail of every device carries a 64-byte `metadata` record preceded by
//! one `u32` bytes-used counter per chunk. The counters emulate the zone
//! append pointer of real zoned hardware and are updated with atomic stores
//! through a shared read-write mapping.

use std::{
    fs::{File, OpenOptions},
    os::unix::{
        fs::{FileTypeExt, MetadataExt, OpenOptionsExt},
        io::AsRawFd,
    },
    path::{Path, PathBuf},
    sync::atomic::{AtomicU32, Ordering},
    sync::Arc,
};

use keccak_hash::keccak;
use memmap::MmapOptions;

use crate::{errno, Error, Result, CNV_CHUNKS_PER_DEVICE, CPU_PAGE_SIZE, METADATA_MAGIC};

/// Size of the fixed metadata record at the very end of a device.
pub(crate) const METADATA_SIZE: u64 = 64;

const CONFIG_HASH_OFFSET: usize = 52;
const CHUNK_CAPACITY_OFFSET: usize = 56;
const MAGIC_OFFSET: usize = 60;

fn round_down_page(value: u64) -> u64 {
    value & !(CPU_PAGE_SIZE - 1)
}

/// Number of chunks fitting on a device of `file_size` bytes, leaving room
/// for the metadata record and the counter array. The front CPU page of the
/// metadata region must not include any chunk.
pub(crate) fn chunk_count_for(file_size: u64, chunk_capacity: u64) -> u64 {
    let end = file_size - METADATA_SIZE;
    let mut ret = end / (chunk_capacity + 4);
    let end_of_chunks = round_down_page(ret * chunk_capacity);
    let start_of_metadata = round_down_page(end - ret * 4);
    if start_of_metadata == end_of_chunks {
        ret -= 1;
    }
    ret
}

/// What kind of storage backs a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceKind {
    File,
    BlockDevice,
    /// A zonefs mount. Recognised but not yet supported; the emulation
    /// layer is the production path.
    ZonedDevice,
}

struct TailMap {
    map: memmap::MmapMut,
    counters_offset: usize,
    metadata_offset: usize,
    count: u64,
}

impl TailMap {
    fn counter(&self, chunk_index: u32) -> &AtomicU32 {
        debug_assert!((chunk_index as u64) < self.count);
        // The counter array is plain little-endian u32s in a MAP_SHARED
        // region; all mutation goes through atomic stores.
        unsafe {
            let ptr = self
                .map
                .as_ptr()
                .add(self.counters_offset + chunk_index as usize * 4);
            &*(ptr as *const AtomicU32)
        }
    }

    fn metadata_u32(&self, offset: usize) -> u32 {
        let b = &self.map[self.metadata_offset + offset..self.metadata_offset + offset + 4];
        u32::from_le_bytes([b[0], b[1], b[2], b[3]])
    }

    fn magic(&self) -> [u8; 4] {
        let b = &self.map[self.metadata_offset + MAGIC_OFFSET..self.metadata_offset + MAGIC_OFFSET + 4];
        [b[0], b[1], b[2], b[3]]
    }
}

pub(crate) struct DeviceInner {
    path: PathBuf,
    kind: DeviceKind,
    cached_rw: File,
    uncached_read: File,
    uncached_write: File,
    unique_hash: u64,
    size_of_file: u64,
    chunk_capacity: u64,
    chunk_count: u64,
    cnv_count: u32,
    tail: TailMap,
}

impl DeviceInner {
    pub(crate) fn chunk_capacity(&self) -> u64 {
        self.chunk_capacity
    }

    pub(crate) fn chunk_count(&self) -> u64 {
        self.chunk_count
    }

    pub(crate) fn cnv_count(&self) -> u32 {
        self.cnv_count
    }

    pub(crate) fn unique_hash(&self) -> u64 {
        self.unique_hash
    }

    pub(crate) fn read_raw_fd(&self) -> i32 {
        self.uncached_read.as_raw_fd()
    }

    pub(crate) fn write_raw_fd(&self) -> i32 {
        self.uncached_write.as_raw_fd()
    }

    pub(crate) fn cached_raw_fd(&self) -> i32 {
        self.cached_rw.as_raw_fd()
    }

    /// Byte offset of chunk `index` within this device.
    pub(crate) fn chunk_offset(&self, index: u32) -> u64 {
        index as u64 * self.chunk_capacity
    }

    pub(crate) fn bytes_used(&self, chunk_index: u32) -> u32 {
        self.tail.counter(chunk_index).load(Ordering::Acquire)
    }

    pub(crate) fn set_bytes_used(&self, chunk_index: u32, value: u32) {
        self.tail.counter(chunk_index).store(value, Ordering::Release);
    }

    /// Advances the zone append pointer by `add` bytes, returning the
    /// previous value.
    pub(crate) fn advance_bytes_used(&self, chunk_index: u32, add: u32) -> u32 {
        self.tail.counter(chunk_index).fetch_add(add, Ordering::AcqRel)
    }

    pub(crate) fn is_block(&self) -> bool {
        self.kind == DeviceKind::BlockDevice
    }
}

/// A backing storage device of the pool.
pub struct Device {
    pub(crate) inner: Arc<DeviceInner>,
}

impl Device {
    /// The current filesystem path of the device.
    pub fn current_path(&self) -> &Path {
        &self.inner.path
    }

    /// Returns if this device is a file on a filesystem.
    pub fn is_file(&self) -> bool {
        self.inner.kind == DeviceKind::File
    }

    /// Returns if this device is a block device e.g. a raw partition.
    pub fn is_block_device(&self) -> bool {
        self.inner.kind == DeviceKind::BlockDevice
    }

    /// Returns if this device is a zonefs mount.
    pub fn is_zoned_device(&self) -> bool {
        self.inner.kind == DeviceKind::ZonedDevice
    }

    /// Returns the number of chunks on this device.
    pub fn chunks(&self) -> u64 {
        self.inner.chunk_count
    }

    /// Hash uniquely identifying this device, derived from its inode
    /// identity. Feeds the pool configuration hash.
    pub fn unique_hash(&self) -> u64 {
        self.inner.unique_hash
    }

    /// Size of the backing inode or block device in bytes.
    pub fn size_bytes(&self) -> u64 {
        self.inner.size_of_file
    }

    /// Returns the chunk capacity of the device, and how much of that is
    /// currently filled with data, in that order.
    pub fn capacity(&self) -> (u64, u64) {
        let inner = &self.inner;
        let total = inner.chunk_count * inner.chunk_capacity;
        let mut used = inner.cnv_count as u64 * inner.chunk_capacity;
        for i in inner.cnv_count..inner.chunk_count as u32 {
            used += inner.bytes_used(i) as u64;
        }
        (total, used)
    }
}

fn open_uncached(path: &Path, write: bool) -> Result<File> {
    let mut opts = OpenOptions::new();
    opts.read(true).write(write).custom_flags(libc::O_DIRECT);
    match opts.open(path) {
        Ok(f) => Ok(f),
        Err(_) => {
            // Filesystems such as tmpfs reject O_DIRECT; fall back to the
            // page cache so the pool still works there.
            debug!(target: "pool", "O_DIRECT unavailable on {}, using cached i/o", path.display());
            let mut opts = OpenOptions::new();
            opts.read(true).write(write);
            opts.open(path).map_err(Error::Io)
        }
    }
}

fn device_size(file: &File) -> Result<u64> {
    let size = unsafe { libc::lseek(file.as_raw_fd(), 0, libc::SEEK_END) };
    if size < 0 {
        return Err(Error::Io(errno()));
    }
    Ok(size as u64)
}

/// Opens (and possibly formats) the device at `path`.
///
/// `format` asks for the tail metadata to be (re)initialised; otherwise the
/// existing metadata is verified against `config_hash`.
pub(crate) fn open_device(
    path: &Path,
    chunk_capacity: u64,
    config_hash: u32,
    format: bool,
    check_config: bool,
) -> Result<Arc<DeviceInner>> {
    let cached_rw = OpenOptions::new()
        .read(true)
        .write(true)
        .open(path)
        .map_err(Error::Io)?;
    open_device_from(cached_rw, path.to_path_buf(), chunk_capacity, config_hash, format, check_config)
}

/// As `open_device` but over an already opened file, used by the anonymous
/// pool constructor.
pub(crate) fn open_device_from(
    cached_rw: File,
    path: PathBuf,
    chunk_capacity: u64,
    config_hash: u32,
    format: bool,
    check_config: bool,
) -> Result<Arc<DeviceInner>> {
    let meta = cached_rw.metadata().map_err(Error::Io)?;
    let kind = if meta.file_type().is_block_device() {
        DeviceKind::BlockDevice
    } else {
        DeviceKind::File
    };
    let size_of_file = device_size(&cached_rw)?;
    if size_of_file < chunk_capacity + METADATA_SIZE + CPU_PAGE_SIZE {
        return Err(Error::DeviceTooSmall(path));
    }

    let count = chunk_count_for(size_of_file, chunk_capacity);
    if count == 0 {
        return Err(Error::DeviceTooSmall(path));
    }

    let end = size_of_file - METADATA_SIZE;
    let map_start = round_down_page(end - count * 4);
    let map_len = (size_of_file - map_start) as usize;
    let map = unsafe {
        MmapOptions::new()
            .offset(map_start as usize)
            .len(map_len)
            .map_mut(&cached_rw)
            .map_err(Error::Io)?
    };
    let mut tail = TailMap {
        map,
        counters_offset: (end - map_start) as usize - count as usize * 4,
        metadata_offset: (end - map_start) as usize,
        count,
    };

    if format {
        let meta_off = tail.metadata_offset;
        for b in tail.map[..meta_off + METADATA_SIZE as usize].iter_mut() {
            *b = 0;
        }
        tail.map[meta_off + CONFIG_HASH_OFFSET..meta_off + CONFIG_HASH_OFFSET + 4]
            .copy_from_slice(&config_hash.to_le_bytes());
        tail.map[meta_off + CHUNK_CAPACITY_OFFSET..meta_off + CHUNK_CAPACITY_OFFSET + 4]
            .copy_from_slice(&(chunk_capacity as u32).to_le_bytes());
        tail.map[meta_off + MAGIC_OFFSET..meta_off + MAGIC_OFFSET + 4].copy_from_slice(&METADATA_MAGIC);
        tail.map.flush().map_err(Error::Io)?;
        trace!(target: "pool", "formatted device {} with {} chunks", path.display(), count);
    } else {
        if tail.magic() != METADATA_MAGIC {
            return Err(Error::BadMagic(path));
        }
        let found = tail.metadata_u32(CONFIG_HASH_OFFSET);
        if check_config && found != config_hash {
            return Err(Error::ConfigMismatch {
                expected: config_hash,
                found,
            });
        }
    }

    let st = cached_rw.metadata().map_err(Error::Io)?;
    let unique_hash = {
        let mut buf = [0u8; 16];
        buf[..8].copy_from_slice(&st.dev().to_le_bytes());
        buf[8..].copy_from_slice(&st.ino().to_le_bytes());
        let h = keccak(buf);
        u64::from_le_bytes(h.as_bytes()[..8].try_into().expect("8 byte slice"))
    };

    let uncached_read = open_uncached(&path, false)?;
    let uncached_write = open_uncached(&path, true)?;

    let cnv_count = CNV_CHUNKS_PER_DEVICE.min(count as u32);
    Ok(Arc::new(DeviceInner {
        path,
        kind,
        cached_rw,
        uncached_read,
        uncached_write,
        unique_hash,
        size_of_file,
        chunk_capacity,
        chunk_count: count,
        cnv_count,
        tail,
    }))
}

/// Reads the chunk capacity recorded on an already formatted device, used
/// when reopening a pool whose creation flags are unknown.
pub(crate) fn read_chunk_capacity(path: &Path) -> Result<Option<u64>> {
    let file = match OpenOptions::new().read(true).open(path) {
        Ok(f) => f,
        Err(err) => return Err(Error::Io(err)),
    };
    let size = device_size(&file)?;
    if size < METADATA_SIZE + CPU_PAGE_SIZE {
        return Ok(None);
    }
    use std::os::unix::fs::FileExt;
    let mut buf = [0u8; METADATA_SIZE as usize];
    file.read_exact_at(&mut buf, size - METADATA_SIZE)
        .map_err(Error::Io)?;
    if buf[MAGIC_OFFSET..MAGIC_OFFSET + 4] != METADATA_MAGIC {
        return Ok(None);
    }
    let cap = u32::from_le_bytes(
        buf[CHUNK_CAPACITY_OFFSET..CHUNK_CAPACITY_OFFSET + 4]
            .try_into()
            .expect("4 byte slice"),
    );
    Ok(Some(cap as u64))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunk_count_reserves_metadata_page() {
        let cap = 1u64 << 24;
        // Exactly ten chunks plus a generous tail.
        let count = chunk_count_for(10 * cap + 16384, cap);
        assert_eq!(count, 10);
        // A file of exactly n chunks cannot hold n: the tail would overlap.
        let count = chunk_count_for(10 * cap, cap);
        assert!(count < 10);
    }
}
