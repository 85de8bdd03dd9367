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

//! End to end: commit state through the trie database and publish each
//! new root on the event ring, the way an execution loop does.

use std::{fs, sync::Arc};

use statecore::{
    event_ring::{create_ring_file, ContentType, EventRing, MapMode, NextResult, RingSize},
    storage_pool::{CreationFlags, Mode, StoragePool},
    triedb::{DbOptions, Nibbles, StateDb, Update},
};
use tempdir::TempDir;

const BLOCK_COMMITTED: u16 = 1;

#[test]
fn roots_flow_from_triedb_to_event_ring() {
    let dir = TempDir::new("statecore-substrate").unwrap();

    let pool_path = dir.path().join("pool");
    let file = fs::File::create(&pool_path).unwrap();
    file.set_len(16 * (1 << 24) + 16384).unwrap();
    let pool = Arc::new(
        StoragePool::open(
            &[pool_path],
            Mode::CreateIfNeeded,
            CreationFlags {
                chunk_capacity_shift: 24,
                ..CreationFlags::default()
            },
        )
        .unwrap(),
    );
    let mut db = StateDb::open_state(pool, DbOptions::default()).unwrap();

    let ring_path = dir.path().join("exec.ring");
    let size = RingSize::from_shifts(12, 26, 0).unwrap();
    let ring_file = create_ring_file(&ring_path, &size, ContentType::Exec, &[7u8; 32]).unwrap();
    let ring = EventRing::map(&ring_file, MapMode::ReadWrite, 0).unwrap();
    let recorder = ring.recorder().unwrap();
    let mut reader = ring.iterator();

    let mut roots = Vec::new();
    for block in 1..=5i64 {
        let key = Nibbles::from_key_bytes(&[block as u8; 32]);
        let root = db
            .commit(vec![Update::put(key, format!("block {block}").into_bytes())], block)
            .unwrap();
        let mut payload = Vec::with_capacity(40);
        payload.extend_from_slice(&(block as u64).to_le_bytes());
        payload.extend_from_slice(root.as_bytes());
        recorder.record(BLOCK_COMMITTED, &payload);
        roots.push(root);
    }

    for (i, expected_root) in roots.iter().enumerate() {
        match reader.try_next() {
            NextResult::Ready(event) => {
                assert_eq!(event.event_type, BLOCK_COMMITTED);
                assert_eq!(event.seqno, i as u64 + 1);
                let payload = ring.payload_peek(&event);
                assert_eq!(payload.len(), 40);
                let block = u64::from_le_bytes(payload[..8].try_into().unwrap());
                assert_eq!(block, i as u64 + 1);
                assert_eq!(&payload[8..], expected_root.as_bytes());
                assert!(ring.payload_check(&event));
            }
            _ => panic!("expected a committed-block event"),
        }
    }
    assert!(matches!(reader.try_next(), NextResult::NotReady));
}
