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

//! The storage pool: devices partitioned into uniform conventional and
//! sequential chunks.

use std::{
    fs::OpenOptions,
    os::unix::{fs::MetadataExt, fs::OpenOptionsExt, io::AsRawFd},
    path::PathBuf,
    sync::{Arc, Weak},
};

use keccak_hash::keccak;
use parking_lot::Mutex;

use crate::{
    chunk::Chunk,
    device::{open_device, open_device_from, read_chunk_capacity, DeviceInner},
    ChunkKind, CreationFlags, Device, Error, Mode, Result,
};

struct ChunkSlot {
    active: Weak<Chunk>,
    device_index: u32,
    chunk_index: u32,
}

struct PoolInner {
    // Indexed by ChunkKind as usize.
    chunks: [Vec<ChunkSlot>; 2],
}

/// A pool of uniform storage chunks spread over one or more backing
/// devices.
///
/// Chunks are reference counted: `activate_chunk` opens any resources a
/// chunk needs on demand and `chunk` returns the shared handle only while
/// some holder keeps it alive.
pub struct StoragePool {
    read_only: bool,
    read_only_allow_dirty: bool,
    newly_truncated: bool,
    chunk_capacity: u64,
    config_hash: u32,
    devices: Vec<Device>,
    inner: Mutex<PoolInner>,
}

fn config_hash_of(unique_hashes: &[u64], chunk_capacity: u64, interleave: bool) -> u32 {
    let mut buf = Vec::with_capacity(unique_hashes.len() * 8 + 9);
    for h in unique_hashes {
        buf.extend_from_slice(&h.to_le_bytes());
    }
    buf.extend_from_slice(&chunk_capacity.to_le_bytes());
    buf.push(interleave as u8);
    let h = keccak(&buf);
    u32::from_le_bytes(h.as_bytes()[..4].try_into().expect("4 byte slice"))
}

fn unique_hash_of(meta: &std::fs::Metadata) -> u64 {
    let mut buf = [0u8; 16];
    buf[..8].copy_from_slice(&meta.dev().to_le_bytes());
    buf[8..].copy_from_slice(&meta.ino().to_le_bytes());
    let h = keccak(buf);
    u64::from_le_bytes(h.as_bytes()[..8].try_into().expect("8 byte slice"))
}

/// Deterministic interleaved assignment of sequential chunks to devices.
///
/// Bresenham-style accumulation: every slot goes to the device with the
/// largest accumulated credit, keeping the gap between two consecutive
/// chunks of device `i` bounded by `ceil(total / count_i) + 1`.
fn interleave_assignment(seq_counts: &[u64]) -> Vec<u32> {
    let total: u64 = seq_counts.iter().sum();
    let mut credit: Vec<i128> = vec![0; seq_counts.len()];
    let mut remaining: Vec<u64> = seq_counts.to_vec();
    let mut out = Vec::with_capacity(total as usize);
    for _ in 0..total {
        for i in 0..credit.len() {
            if remaining[i] > 0 {
                credit[i] += seq_counts[i] as i128;
            }
        }
        let mut best = usize::MAX;
        for i in 0..credit.len() {
            if remaining[i] > 0 && (best == usize::MAX || credit[i] > credit[best]) {
                best = i;
            }
        }
        debug_assert!(best != usize::MAX);
        credit[best] -= total as i128;
        remaining[best] -= 1;
        out.push(best as u32);
    }
    out
}

impl StoragePool {
    /// Opens a storage pool over the listed backing storage sources.
    pub fn open(sources: &[PathBuf], mode: Mode, flags: CreationFlags) -> Result<StoragePool> {
        if flags.chunk_capacity_shift < 24 || flags.chunk_capacity_shift > 32 {
            return Err(Error::UnsupportedChunkCapacity(flags.chunk_capacity_shift));
        }
        let chunk_capacity = 1u64 << flags.chunk_capacity_shift;

        let mut unique_hashes = Vec::with_capacity(sources.len());
        for path in sources {
            let meta = std::fs::metadata(path).map_err(Error::Io)?;
            unique_hashes.push(unique_hash_of(&meta));
        }
        let config_hash =
            config_hash_of(&unique_hashes, chunk_capacity, flags.interleave_chunks_evenly);

        let mut devices = Vec::with_capacity(sources.len());
        let mut newly_truncated = false;
        for path in sources {
            let format = match mode {
                Mode::Truncate => true,
                Mode::OpenExisting => false,
                Mode::CreateIfNeeded => read_chunk_capacity(path)?.is_none(),
            };
            newly_truncated |= format;
            let inner = open_device(
                path,
                chunk_capacity,
                config_hash,
                format,
                !flags.disable_mismatching_storage_pool_check,
            )?;
            devices.push(Device { inner });
        }

        Self::assemble(devices, chunk_capacity, config_hash, newly_truncated, flags)
    }

    /// Constructs a pool over a temporary anonymous inode; useful for test
    /// code. The inode vanishes when the pool is dropped.
    pub fn anonymous(flags: CreationFlags) -> Result<StoragePool> {
        if flags.chunk_capacity_shift < 24 || flags.chunk_capacity_shift > 32 {
            return Err(Error::UnsupportedChunkCapacity(flags.chunk_capacity_shift));
        }
        let chunk_capacity = 1u64 << flags.chunk_capacity_shift;
        let dir = std::env::temp_dir();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_TMPFILE)
            .open(&dir)
            .map_err(Error::Io)?;
        // Eight chunks plus the metadata tail; sparse, so cheap.
        file.set_len(chunk_capacity * 8 + 16384).map_err(Error::Io)?;
        let meta = file.metadata().map_err(Error::Io)?;
        let config_hash = config_hash_of(
            &[unique_hash_of(&meta)],
            chunk_capacity,
            flags.interleave_chunks_evenly,
        );
        let path = PathBuf::from(format!("/proc/self/fd/{}", file.as_raw_fd()));
        let inner = open_device_from(file, path, chunk_capacity, config_hash, true, false)?;
        Self::assemble(
            vec![Device { inner }],
            chunk_capacity,
            config_hash,
            true,
            flags,
        )
    }

    fn assemble(
        devices: Vec<Device>,
        chunk_capacity: u64,
        config_hash: u32,
        newly_truncated: bool,
        flags: CreationFlags,
    ) -> Result<StoragePool> {
        let mut cnv = Vec::new();
        let mut seq = Vec::new();

        for (d, device) in devices.iter().enumerate() {
            for i in 0..device.inner.cnv_count() {
                cnv.push(ChunkSlot {
                    active: Weak::new(),
                    device_index: d as u32,
                    chunk_index: i,
                });
            }
        }

        let seq_counts: Vec<u64> = devices
            .iter()
            .map(|d| d.inner.chunk_count() - d.inner.cnv_count() as u64)
            .collect();
        if flags.interleave_chunks_evenly {
            let assignment = interleave_assignment(&seq_counts);
            let mut next_chunk: Vec<u32> =
                devices.iter().map(|d| d.inner.cnv_count()).collect();
            for d in assignment {
                seq.push(ChunkSlot {
                    active: Weak::new(),
                    device_index: d,
                    chunk_index: next_chunk[d as usize],
                });
                next_chunk[d as usize] += 1;
            }
        } else {
            for (d, device) in devices.iter().enumerate() {
                for i in device.inner.cnv_count()..device.inner.chunk_count() as u32 {
                    seq.push(ChunkSlot {
                        active: Weak::new(),
                        device_index: d as u32,
                        chunk_index: i,
                    });
                }
            }
        }

        debug!(
            target: "pool",
            "pool opened: {} devices, {} cnv chunks, {} seq chunks, capacity {}",
            devices.len(),
            cnv.len(),
            seq.len(),
            chunk_capacity
        );

        Ok(StoragePool {
            read_only: flags.open_read_only,
            read_only_allow_dirty: flags.open_read_only_allow_dirty,
            newly_truncated,
            chunk_capacity,
            config_hash,
            devices,
            inner: Mutex::new(PoolInner { chunks: [cnv, seq] }),
        })
    }

    /// True if the storage pool was opened read only.
    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    /// True if the pool was opened read only and a dirty closed state is to
    /// be tolerated.
    pub fn is_read_only_allow_dirty(&self) -> bool {
        self.read_only_allow_dirty
    }

    /// True if the pool was just truncated and structures need
    /// reinitialising.
    pub fn is_newly_truncated(&self) -> bool {
        self.newly_truncated
    }

    /// The uniform chunk capacity of the pool.
    pub fn chunk_capacity(&self) -> u64 {
        self.chunk_capacity
    }

    /// The non-cryptographic digest of the pool configuration.
    pub fn config_hash(&self) -> u32 {
        self.config_hash
    }

    /// Returns the list of backing storage devices.
    pub fn devices(&self) -> &[Device] {
        &self.devices
    }

    /// Returns the number of chunks of the specified type.
    pub fn chunks(&self, which: ChunkKind) -> u32 {
        self.inner.lock().chunks[which as usize].len() as u32
    }

    /// Returns the number of currently active chunks of the specified type.
    pub fn currently_active_chunks(&self, which: ChunkKind) -> u32 {
        self.inner.lock().chunks[which as usize]
            .iter()
            .filter(|slot| slot.active.strong_count() > 0)
            .count() as u32
    }

    /// Returns an existing chunk handle, if it is currently activated.
    pub fn chunk(&self, which: ChunkKind, id: u32) -> Option<Arc<Chunk>> {
        self.inner.lock().chunks[which as usize]
            .get(id as usize)
            .and_then(|slot| slot.active.upgrade())
    }

    /// Clones this pool as a read-only view sharing the same devices.
    /// Activated chunks of the clone refuse writes.
    pub fn clone_as_read_only(&self) -> StoragePool {
        let devices = self
            .devices
            .iter()
            .map(|d| Device {
                inner: d.inner.clone(),
            })
            .collect();
        let inner = self.inner.lock();
        let chunks = [0, 1].map(|kind: usize| {
            inner.chunks[kind]
                .iter()
                .map(|slot| ChunkSlot {
                    active: Weak::new(),
                    device_index: slot.device_index,
                    chunk_index: slot.chunk_index,
                })
                .collect()
        });
        StoragePool {
            read_only: true,
            read_only_allow_dirty: self.read_only_allow_dirty,
            newly_truncated: false,
            chunk_capacity: self.chunk_capacity,
            config_hash: self.config_hash,
            devices,
            inner: Mutex::new(PoolInner { chunks }),
        }
    }

    /// Activates a chunk, opening any per-chunk resources on demand, and
    /// returns the shared handle.
    pub fn activate_chunk(&self, which: ChunkKind, id: u32) -> Result<Arc<Chunk>> {
        let mut inner = self.inner.lock();
        let slot = inner.chunks[which as usize]
            .get_mut(id as usize)
            .ok_or_else(|| {
                Error::Io(std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    format!("no chunk {id} of kind {which:?}"),
                ))
            })?;
        if let Some(chunk) = slot.active.upgrade() {
            return Ok(chunk);
        }
        let device: &Arc<DeviceInner> = &self.devices[slot.device_index as usize].inner;
        let chunk = Arc::new(Chunk::new(
            device.clone(),
            slot.device_index,
            slot.chunk_index,
            id,
            which == ChunkKind::Seq,
            self.read_only,
        ));
        slot.active = Arc::downgrade(&chunk);
        Ok(chunk)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interleave_is_deterministic_and_balanced() {
        let counts = [19u64, 9, 4];
        let a = interleave_assignment(&counts);
        let b = interleave_assignment(&counts);
        assert_eq!(a, b);
        assert_eq!(a.len(), 32);
        assert_eq!(a.iter().filter(|d| **d == 0).count(), 19);
        assert_eq!(a.iter().filter(|d| **d == 1).count(), 9);
        assert_eq!(a.iter().filter(|d| **d == 2).count(), 4);
        // Gap of the smallest device stays within ceil(32/4) + 1.
        let idx: Vec<usize> = a
            .iter()
            .enumerate()
            .filter(|(_, d)| **d == 2)
            .map(|(i, _)| i)
            .collect();
        for w in idx.windows(2) {
            assert!(w[1] - w[0] <= 9);
        }
    }

}
