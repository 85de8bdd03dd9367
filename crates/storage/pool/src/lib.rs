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

//! Lowest-latency zoned storage abstraction with an emulation layer for
//! plain files and raw partitions.
//!
//! A pool chops its backing devices into fixed-capacity chunks and exposes
//! them as conventional (`cnv`, random-write) and sequential (`seq`,
//! append-only) zones with uniform semantics. Resetting a chunk issues a
//! TRIM to the underlying storage so that SSD garbage collection does not
//! pile up behind normal i/o.

#[macro_use]
extern crate log;

use std::{fmt, io, path::PathBuf};

mod chunk;
mod device;
mod pool;

pub use chunk::Chunk;
pub use device::{Device, DeviceKind};
pub use pool::StoragePool;

/// Size of a CPU page; the front page of the device tail metadata must not
/// overlap any chunk.
pub const CPU_PAGE_SIZE: u64 = 4096;

/// Magic trailer identifying v1 of the device tail metadata.
pub const METADATA_MAGIC: [u8; 4] = *b"MND0";

/// Conventional chunks designated at the front of every device. The
/// remainder of the device is sequential-write chunks.
pub const CNV_CHUNKS_PER_DEVICE: u32 = 3;

/// Type of chunk, conventional or sequential.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChunkKind {
    /// Conventional zone: random read-write.
    Cnv = 0,
    /// Sequential zone: append only, recycled as a whole.
    Seq = 1,
}

/// What to do when opening the pool for use.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    OpenExisting,
    CreateIfNeeded,
    Truncate,
}

/// Flags for storage pool creation.
#[derive(Debug, Clone, Copy)]
pub struct CreationFlags {
    /// How much to shift a bit left to form the chunk capacity. The
    /// allowed range is 24 (16 MiB) to 32 (4 GiB).
    pub chunk_capacity_shift: u8,
    /// Whether to interleave sequential chunks evenly across devices
    /// during creation.
    pub interleave_chunks_evenly: bool,
    /// Whether to open the pool read-only.
    pub open_read_only: bool,
    /// Whether to open read-only allowing a dirty closed database.
    pub open_read_only_allow_dirty: bool,
    /// Disables the check preventing use of a storage configuration
    /// different to the one the pool was created with. Disabling it can
    /// destroy the pool, as well as whatever partition you feed it.
    pub disable_mismatching_storage_pool_check: bool,
}

impl Default for CreationFlags {
    fn default() -> Self {
        CreationFlags {
            chunk_capacity_shift: 28,
            interleave_chunks_evenly: false,
            open_read_only: false,
            open_read_only_allow_dirty: false,
            disable_mismatching_storage_pool_check: false,
        }
    }
}

/// Storage pool errors.
#[derive(Debug)]
pub enum Error {
    /// IO error
    Io(io::Error),
    /// The device tail metadata does not carry the expected magic.
    BadMagic(PathBuf),
    /// The pool was created with a different storage configuration.
    ConfigMismatch { expected: u32, found: u32 },
    /// Chunk capacity shift outside the supported 24..=32 range.
    UnsupportedChunkCapacity(u8),
    /// A device is too small to hold a single chunk plus metadata.
    DeviceTooSmall(PathBuf),
    /// An append would run past the end of a sequential chunk.
    AppendOverflow { capacity: u64, used: u64, requested: u64 },
    /// Destination chunk of a clone must be empty.
    DestinationNotEmpty,
    /// Mutating operation on a read-only pool.
    ReadOnly,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            Error::Io(ref err) => write!(f, "{err}"),
            Error::BadMagic(ref path) => {
                write!(f, "no storage pool metadata found on {}", path.display())
            }
            Error::ConfigMismatch { expected, found } => write!(
                f,
                "storage pool configuration hash mismatch: expected {expected:08x}, found {found:08x}"
            ),
            Error::UnsupportedChunkCapacity(shift) => {
                write!(f, "chunk capacity shift {shift} outside supported range 24..=32")
            }
            Error::DeviceTooSmall(ref path) => {
                write!(f, "device {} cannot hold a single chunk", path.display())
            }
            Error::AppendOverflow {
                capacity,
                used,
                requested,
            } => write!(
                f,
                "append of {requested} bytes exceeds chunk capacity ({used} of {capacity} used)"
            ),
            Error::DestinationNotEmpty => {
                write!(f, "destination sequential chunk must be empty")
            }
            Error::ReadOnly => write!(f, "storage pool is read-only"),
        }
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error::Io(err)
    }
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

pub(crate) fn errno() -> io::Error {
    io::Error::last_os_error()
}
