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

use std::{fs, os::unix::io::RawFd, path::PathBuf, sync::Arc};

use storage_pool::{Chunk, ChunkKind, CreationFlags, Error, Mode, StoragePool};
use tempdir::TempDir;

const MIB: usize = 1024 * 1024;

fn small_flags() -> CreationFlags {
    CreationFlags {
        chunk_capacity_shift: 24,
        ..CreationFlags::default()
    }
}

fn pwrite_all(fd: RawFd, buf: &[u8], offset: u64) {
    let n = unsafe {
        libc::pwrite(
            fd,
            buf.as_ptr() as *const libc::c_void,
            buf.len(),
            offset as libc::off_t,
        )
    };
    assert_eq!(n, buf.len() as isize, "{}", std::io::Error::last_os_error());
}

fn pread_all(fd: RawFd, buf: &mut [u8], offset: u64) {
    let n = unsafe {
        libc::pread(
            fd,
            buf.as_mut_ptr() as *mut libc::c_void,
            buf.len(),
            offset as libc::off_t,
        )
    };
    assert_eq!(n, buf.len() as isize, "{}", std::io::Error::last_os_error());
}

fn check_pattern(chunk: &Arc<Chunk>, a: u8, b: u8) {
    let (fd, base) = chunk.read_fd();
    let mut readback = vec![0u8; MIB];
    pread_all(fd, &mut readback, base);
    assert!(readback.iter().all(|x| *x == a));
    pread_all(fd, &mut readback, base + MIB as u64);
    assert!(readback.iter().all(|x| *x == b));
}

// Scenario: activate cnv[0], seq[0] and seq[last], write distinct byte
// patterns into each, read everything back, then destroy chunks one at a
// time verifying the others stay intact.
#[test]
fn anonymous_pool_read_write_destroy() {
    let pool = StoragePool::anonymous(small_flags()).unwrap();
    let capacity = pool.chunk_capacity();
    let last_seq = pool.chunks(ChunkKind::Seq) - 1;

    let chunk1 = pool.activate_chunk(ChunkKind::Cnv, 0).unwrap();
    let chunk2 = pool.activate_chunk(ChunkKind::Seq, 0).unwrap();
    let chunk3 = pool.activate_chunk(ChunkKind::Seq, last_seq).unwrap();
    assert_eq!(pool.currently_active_chunks(ChunkKind::Cnv), 1);
    assert_eq!(pool.currently_active_chunks(ChunkKind::Seq), 2);

    let mut buffer = vec![0u8; MIB];

    // Conventional chunks are always full and writable anywhere.
    assert_eq!(chunk1.size(), chunk1.capacity());
    buffer.fill(0xee);
    let (fd, off) = chunk1.write_fd(buffer.len() as u64).unwrap();
    assert_eq!(off, 0);
    pwrite_all(fd, &buffer, off);
    buffer.fill(0xaa);
    let (fd, off) = chunk1.write_fd(buffer.len() as u64).unwrap();
    assert_eq!(off, 0);
    pwrite_all(fd, &buffer, off + MIB as u64);
    assert_eq!(chunk1.size(), chunk1.capacity());

    // First sequential chunk lands after the conventional chunks.
    buffer.fill(0x77);
    let (fd, off) = chunk2.write_fd(buffer.len() as u64).unwrap();
    assert_eq!(off, capacity * 3);
    pwrite_all(fd, &buffer, off);
    assert_eq!(chunk2.size(), MIB as u64);
    buffer.fill(0x55);
    let (fd, off) = chunk2.write_fd(buffer.len() as u64).unwrap();
    assert_eq!(off, capacity * 3 + MIB as u64);
    pwrite_all(fd, &buffer, off);
    assert_eq!(chunk2.size(), 2 * MIB as u64);

    buffer.fill(0x33);
    let (fd, off) = chunk3.write_fd(buffer.len() as u64).unwrap();
    assert_eq!(off, capacity * (3 + last_seq as u64));
    pwrite_all(fd, &buffer, off);
    buffer.fill(0x22);
    let (fd, off) = chunk3.write_fd(buffer.len() as u64).unwrap();
    pwrite_all(fd, &buffer, off);
    assert_eq!(chunk3.size(), 2 * MIB as u64);

    check_pattern(&chunk1, 0xee, 0xaa);
    check_pattern(&chunk2, 0x77, 0x55);
    check_pattern(&chunk3, 0x33, 0x22);

    chunk3.destroy_contents().unwrap();
    assert_eq!(chunk1.size(), chunk1.capacity());
    assert_eq!(chunk2.size(), 2 * MIB as u64);
    assert_eq!(chunk3.size(), 0);
    check_pattern(&chunk1, 0xee, 0xaa);
    check_pattern(&chunk2, 0x77, 0x55);
    check_pattern(&chunk3, 0x00, 0x00);

    chunk1.destroy_contents().unwrap();
    check_pattern(&chunk1, 0x00, 0x00);
    check_pattern(&chunk2, 0x77, 0x55);

    chunk2.destroy_contents().unwrap();
    assert_eq!(chunk2.size(), 0);
    check_pattern(&chunk2, 0x00, 0x00);

    drop(chunk1);
    drop(chunk2);
    drop(chunk3);
    assert_eq!(pool.currently_active_chunks(ChunkKind::Cnv), 0);
    assert_eq!(pool.currently_active_chunks(ChunkKind::Seq), 0);
}

#[test]
fn append_past_capacity_fails() {
    let pool = StoragePool::anonymous(small_flags()).unwrap();
    let chunk = pool.activate_chunk(ChunkKind::Seq, 0).unwrap();
    let capacity = chunk.capacity();
    assert!(chunk.write_fd(capacity).is_ok());
    match chunk.write_fd(1) {
        Err(Error::AppendOverflow { .. }) => (),
        other => panic!("expected append overflow, got {:?}", other.map(|_| ())),
    }
}

fn create_sized_file(dir: &TempDir, name: &str, chunks: u64, capacity: u64) -> PathBuf {
    let path = dir.path().join(name);
    let file = fs::File::create(&path).unwrap();
    file.set_len(chunks * capacity + 16384).unwrap();
    path
}

fn gap_means(pool: &StoragePool, devices: usize) -> Vec<f64> {
    let mut indices: Vec<Vec<u32>> = vec![Vec::new(); devices];
    for n in 0..pool.chunks(ChunkKind::Seq) {
        let chunk = pool.activate_chunk(ChunkKind::Seq, n).unwrap();
        indices[chunk.device_index() as usize].push(n);
    }
    indices
        .iter()
        .map(|idx| {
            let gaps: Vec<u32> = idx.windows(2).map(|w| w[1] - w[0]).collect();
            gaps.iter().sum::<u32>() as f64 / gaps.len() as f64
        })
        .collect()
}

// Scenario: three devices sized 22, 12 and 7 chunks. Interleaving spreads
// each device's sequential chunks evenly through the enumeration; without
// it enumeration is device-major and every gap is exactly one.
#[test]
fn device_interleaving() {
    let capacity = 1u64 << 24;
    let run = |interleave: bool| -> Vec<f64> {
        let dir = TempDir::new("statecore-pool-test").unwrap();
        let devs = vec![
            create_sized_file(&dir, "dev0", 22, capacity),
            create_sized_file(&dir, "dev1", 12, capacity),
            create_sized_file(&dir, "dev2", 7, capacity),
        ];
        let flags = CreationFlags {
            chunk_capacity_shift: 24,
            interleave_chunks_evenly: interleave,
            ..CreationFlags::default()
        };
        let pool = StoragePool::open(&devs, Mode::CreateIfNeeded, flags).unwrap();
        assert_eq!(pool.chunks(ChunkKind::Cnv), 9);
        assert_eq!(pool.chunks(ChunkKind::Seq), 19 + 9 + 4);
        gap_means(&pool, 3)
    };

    let means = run(false);
    assert_eq!(means[0], 1.0);
    assert_eq!(means[1], 1.0);
    assert_eq!(means[2], 1.0);

    let means = run(true);
    assert!(means[0] >= 1.6, "device 0 gap mean {}", means[0]);
    assert!(means[1] >= 3.5, "device 1 gap mean {}", means[1]);
    assert!(means[2] >= 8.0, "device 2 gap mean {}", means[2]);
}

// Scenario: reopening an existing pool with a different device set must be
// rejected; truncating with the new set starts over.
#[test]
fn config_hash_differs() {
    let capacity = 1u64 << 24;
    let dir = TempDir::new("statecore-pool-test").unwrap();
    let devs = vec![
        create_sized_file(&dir, "dev0", 20, capacity),
        create_sized_file(&dir, "dev1", 10, capacity),
        create_sized_file(&dir, "dev2", 5, capacity),
    ];
    {
        let _pool = StoragePool::open(&devs, Mode::CreateIfNeeded, small_flags()).unwrap();
    }
    let devs2 = vec![devs[0].clone(), devs[1].clone()];
    match StoragePool::open(&devs2, Mode::OpenExisting, small_flags()) {
        Err(Error::ConfigMismatch { .. }) => (),
        other => panic!("expected config mismatch, got {:?}", other.map(|_| ())),
    }
    let pool = StoragePool::open(&devs2, Mode::Truncate, small_flags()).unwrap();
    assert!(pool.is_newly_truncated());
}

#[test]
fn clone_content_between_pools() {
    let pool1 = StoragePool::anonymous(small_flags()).unwrap();
    let pool2 = StoragePool::anonymous(small_flags()).unwrap();

    let mut buffer = vec![0u8; MIB];
    buffer.fill(0xee);
    let chunk1 = pool1.activate_chunk(ChunkKind::Seq, 0).unwrap();
    let (fd, off) = chunk1.write_fd(buffer.len() as u64).unwrap();
    pwrite_all(fd, &buffer, off);
    assert_eq!(chunk1.size(), MIB as u64);

    let chunk2 = pool2.activate_chunk(ChunkKind::Seq, 0).unwrap();
    let cloned = chunk1.clone_contents_into(&chunk2, u32::MAX).unwrap();
    assert_eq!(cloned as usize, MIB);
    assert_eq!(chunk2.size(), MIB as u64);

    let (fd, base) = chunk2.read_fd();
    let mut readback = vec![0u8; MIB];
    pread_all(fd, &mut readback, base);
    assert!(readback.iter().all(|x| *x == 0xee));
}

#[test]
fn read_only_clone_shares_contents() {
    let pool = StoragePool::anonymous(small_flags()).unwrap();
    let chunk = pool.activate_chunk(ChunkKind::Seq, 0).unwrap();
    let mut buffer = vec![0u8; MIB];
    buffer.fill(0xd7);
    let (fd, off) = chunk.write_fd(buffer.len() as u64).unwrap();
    pwrite_all(fd, &buffer, off);

    let frozen = pool.clone_as_read_only();
    assert!(frozen.is_read_only());
    assert_eq!(frozen.chunks(ChunkKind::Seq), pool.chunks(ChunkKind::Seq));
    let view = frozen.activate_chunk(ChunkKind::Seq, 0).unwrap();
    assert_eq!(view.size(), MIB as u64);
    let (fd, base) = view.read_fd();
    let mut readback = vec![0u8; MIB];
    pread_all(fd, &mut readback, base);
    assert!(readback.iter().all(|x| *x == 0xd7));
    assert!(matches!(view.write_fd(1), Err(Error::ReadOnly)));
}

#[test]
fn trim_tail_of_sequential_chunk() {
    let pool = StoragePool::anonymous(small_flags()).unwrap();
    let chunk = pool.activate_chunk(ChunkKind::Seq, 0).unwrap();
    let mut buffer = vec![0u8; MIB];
    buffer.fill(0xab);
    let (fd, off) = chunk.write_fd(buffer.len() as u64).unwrap();
    pwrite_all(fd, &buffer, off);
    assert!(chunk.try_trim_contents(MIB as u32 / 2));
    assert_eq!(chunk.size(), MIB as u64 / 2);
    assert!(!chunk.try_trim_contents(MIB as u32));
    // Conventional chunks cannot be tail-trimmed.
    let cnv = pool.activate_chunk(ChunkKind::Cnv, 0).unwrap();
    assert!(!cnv.try_trim_contents(1));
}
