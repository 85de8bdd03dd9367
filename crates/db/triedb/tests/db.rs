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

use std::{fs, path::PathBuf, sync::Arc};

use storage_pool::{CreationFlags, Mode, StoragePool};
use tempdir::TempDir;
use triedb::{
    empty_trie_root, DbOptions, Error, Nibbles, StateDb, Update, VarLenDb,
};

const CHUNK_SHIFT: u8 = 24;

fn pool_path(dir: &TempDir) -> PathBuf {
    dir.path().join("pool")
}

fn create_pool_file(dir: &TempDir, chunks: u64) -> PathBuf {
    let path = pool_path(dir);
    let file = fs::File::create(&path).unwrap();
    file.set_len(chunks * (1 << CHUNK_SHIFT) + 16384).unwrap();
    path
}

fn open_pool(dir: &TempDir, mode: Mode) -> Arc<StoragePool> {
    let flags = CreationFlags {
        chunk_capacity_shift: CHUNK_SHIFT,
        ..CreationFlags::default()
    };
    Arc::new(StoragePool::open(&[pool_path(dir)], mode, flags).unwrap())
}

fn key(byte: u8) -> Nibbles {
    Nibbles::from_key_bytes(&[byte; 32])
}

#[test]
fn insert_lookup_update_delete() {
    let dir = TempDir::new("statecore-triedb").unwrap();
    create_pool_file(&dir, 16);
    let pool = open_pool(&dir, Mode::CreateIfNeeded);
    let mut db = StateDb::open_state(pool, DbOptions::default()).unwrap();

    assert_eq!(db.state_root(), empty_trie_root());
    assert_eq!(db.get(&key(0x11)).unwrap(), None);

    let root1 = db
        .commit(
            vec![
                Update::put(key(0x11), b"first".to_vec()),
                Update::put(key(0x22), b"second".to_vec()),
            ],
            1,
        )
        .unwrap();
    assert_ne!(root1, empty_trie_root());
    assert_eq!(db.get(&key(0x11)).unwrap(), Some(b"first".to_vec()));
    assert_eq!(db.get(&key(0x22)).unwrap(), Some(b"second".to_vec()));
    assert_eq!(db.get(&key(0x33)).unwrap(), None);
    assert_eq!(db.latest_version(), Some(1));

    let root2 = db
        .commit(vec![Update::put(key(0x11), b"rewritten".to_vec())], 2)
        .unwrap();
    assert_ne!(root2, root1);
    assert_eq!(db.get(&key(0x11)).unwrap(), Some(b"rewritten".to_vec()));

    let root3 = db.commit(vec![Update::tombstone(key(0x11))], 3).unwrap();
    assert_ne!(root3, root2);
    assert_eq!(db.get(&key(0x11)).unwrap(), None);
    assert_eq!(db.get(&key(0x22)).unwrap(), Some(b"second".to_vec()));

    let root4 = db.commit(vec![Update::tombstone(key(0x22))], 4).unwrap();
    assert_eq!(root4, empty_trie_root());
    assert_eq!(db.get(&key(0x22)).unwrap(), None);
}

// Scenario: insert, commit, close, reopen; lookups see the committed
// values and the recomputed root matches the one returned at commit time.
#[test]
fn reopen_preserves_state() {
    let dir = TempDir::new("statecore-triedb").unwrap();
    create_pool_file(&dir, 16);

    let root = {
        let pool = open_pool(&dir, Mode::CreateIfNeeded);
        let mut db = StateDb::open_state(pool, DbOptions::default()).unwrap();
        db.commit(
            vec![
                Update::put(key(0xa1), b"value a".to_vec()),
                Update::put(key(0xb2), b"value b".to_vec()),
            ],
            7,
        )
        .unwrap()
    };

    let pool = open_pool(&dir, Mode::OpenExisting);
    let db = StateDb::open_state(pool, DbOptions::default()).unwrap();
    assert_eq!(db.state_root(), root);
    assert_eq!(db.latest_version(), Some(7));
    assert_eq!(db.get(&key(0xa1)).unwrap(), Some(b"value a".to_vec()));
    assert_eq!(db.get(&key(0xb2)).unwrap(), Some(b"value b".to_vec()));
}

// Scenario: a crash that leaves the dirty byte set. Reopening without
// consent fails; with consent the last committed root is recovered and
// the torn work-in-progress span is discarded.
#[test]
fn dirty_close_recovery() {
    let dir = TempDir::new("statecore-triedb").unwrap();
    create_pool_file(&dir, 16);

    let committed_root = {
        let pool = open_pool(&dir, Mode::CreateIfNeeded);
        let mut db = StateDb::open_state(pool, DbOptions::default()).unwrap();
        db.commit(
            vec![
                Update::put(key(0x10), b"balance".to_vec()),
                Update::put(key(0x20), b"slot".to_vec()),
            ],
            1,
        )
        .unwrap();
        let root = db
            .commit(vec![Update::put(key(0x10), b"new balance".to_vec())], 2)
            .unwrap();
        db.poison_dirty_for_crash_test().unwrap();
        root
    };

    {
        let pool = open_pool(&dir, Mode::OpenExisting);
        match StateDb::open_state(pool, DbOptions::default()) {
            Err(Error::DirtyState) => (),
            other => panic!("expected dirty-state failure, got {:?}", other.err()),
        }
    }

    let pool = open_pool(&dir, Mode::OpenExisting);
    let db = StateDb::open_state(
        pool,
        DbOptions {
            allow_dirty: true,
            ..DbOptions::default()
        },
    )
    .unwrap();
    assert_eq!(db.state_root(), committed_root);
    assert_eq!(db.get(&key(0x10)).unwrap(), Some(b"new balance".to_vec()));
    assert_eq!(db.get(&key(0x20)).unwrap(), Some(b"slot".to_vec()));
}

// Updating one key of a populated trie rewrites only the path to that
// key; everything else is shared with the previous version by offset.
#[test]
fn structural_sharing_bounds_write_amplification() {
    let dir = TempDir::new("statecore-triedb").unwrap();
    create_pool_file(&dir, 16);
    let pool = open_pool(&dir, Mode::CreateIfNeeded);
    let mut db = StateDb::open_state(pool, DbOptions::default()).unwrap();

    let batch: Vec<Update> = (0..128u8)
        .map(|i| Update::put(key(i), format!("value {i}").into_bytes()))
        .collect();
    db.commit(batch, 1).unwrap();
    let bulk_end = db.write_position().unwrap();

    db.commit(vec![Update::put(key(7), b"touched".to_vec())], 2)
        .unwrap();
    let single_end = db.write_position().unwrap();

    let bulk_bytes = bulk_end.offset();
    let single_bytes = single_end.offset() - bulk_end.offset();
    assert!(
        single_bytes * 4 < bulk_bytes,
        "single-key update wrote {single_bytes} of {bulk_bytes} bulk bytes"
    );

    for i in 0..128u8 {
        let expect = if i == 7 {
            b"touched".to_vec()
        } else {
            format!("value {i}").into_bytes()
        };
        assert_eq!(db.get(&key(i)).unwrap(), Some(expect), "key {i}");
    }

    // The previous version's root still resolves alongside the writer.
    let old_root = db.root_offset().unwrap();
    db.commit(vec![Update::put(key(9), b"again".to_vec())], 3)
        .unwrap();
    assert_eq!(
        db.get_at_root(old_root, &key(7)).unwrap(),
        Some(b"touched".to_vec())
    );
}

// Scenario: the classic branching fixture. The resulting root must equal
// the published reference value for this key set.
#[test]
fn merkle_root_matches_reference_fixture() {
    let dir = TempDir::new("statecore-triedb").unwrap();
    create_pool_file(&dir, 16);
    let pool = open_pool(&dir, Mode::CreateIfNeeded);
    let mut db = VarLenDb::open_var_len(pool, DbOptions::default()).unwrap();

    let fixture: [(&[u8], &[u8]); 3] = [
        (b"doe", b"reindeer"),
        (b"dog", b"puppy"),
        (b"dogglesworth", b"cat"),
    ];
    let updates = fixture
        .iter()
        .map(|(k, v)| Update::put(Nibbles::from_key_bytes(k), v.to_vec()))
        .collect();
    let root = db.commit(updates, 1).unwrap();
    assert_eq!(
        format!("{root:x}"),
        "8aad789dff2f538bca5d8ea56e8abe10f4c7ba3a5dea95fea4cd6e7c3a1168d3"
    );

    for (k, v) in fixture {
        assert_eq!(db.get(&Nibbles::from_key_bytes(k)).unwrap(), Some(v.to_vec()));
    }
}

// The fixture root must not depend on insertion order or batch boundaries.
#[test]
fn merkle_root_is_insertion_order_independent() {
    let build = |batches: &[&[(&[u8], &[u8])]]| {
        let dir = TempDir::new("statecore-triedb").unwrap();
        create_pool_file(&dir, 16);
        let pool = open_pool(&dir, Mode::CreateIfNeeded);
        let mut db = VarLenDb::open_var_len(pool, DbOptions::default()).unwrap();
        let mut root = empty_trie_root();
        for (version, batch) in batches.iter().enumerate() {
            let updates = batch
                .iter()
                .map(|(k, v)| Update::put(Nibbles::from_key_bytes(k), v.to_vec()))
                .collect();
            root = db.commit(updates, version as i64 + 1).unwrap();
        }
        root
    };

    let all: &[(&[u8], &[u8])] = &[
        (b"doe", b"reindeer"),
        (b"dog", b"puppy"),
        (b"dogglesworth", b"cat"),
    ];
    let first: &[(&[u8], &[u8])] = &[(b"dogglesworth", b"cat")];
    let second: &[(&[u8], &[u8])] = &[(b"doe", b"reindeer")];
    let third: &[(&[u8], &[u8])] = &[(b"dog", b"puppy")];
    let one_shot = build(&[all]);
    let incremental = build(&[first, second, third]);
    assert_eq!(one_shot, incremental);
}

#[test]
fn deletion_collapses_to_equivalent_trie() {
    let with_keys = |keys: &[(&[u8], &[u8])]| {
        let dir = TempDir::new("statecore-triedb").unwrap();
        create_pool_file(&dir, 16);
        let pool = open_pool(&dir, Mode::CreateIfNeeded);
        let mut db = VarLenDb::open_var_len(pool, DbOptions::default()).unwrap();
        let updates = keys
            .iter()
            .map(|(k, v)| Update::put(Nibbles::from_key_bytes(k), v.to_vec()))
            .collect();
        db.commit(updates, 1).unwrap()
    };

    let dir = TempDir::new("statecore-triedb").unwrap();
    create_pool_file(&dir, 16);
    let pool = open_pool(&dir, Mode::CreateIfNeeded);
    let mut db = VarLenDb::open_var_len(pool, DbOptions::default()).unwrap();
    db.commit(
        vec![
            Update::put(Nibbles::from_key_bytes(b"doe"), b"reindeer".to_vec()),
            Update::put(Nibbles::from_key_bytes(b"dog"), b"puppy".to_vec()),
            Update::put(Nibbles::from_key_bytes(b"dogglesworth"), b"cat".to_vec()),
        ],
        1,
    )
    .unwrap();
    let after_delete = db
        .commit(
            vec![Update::tombstone(Nibbles::from_key_bytes(b"dogglesworth"))],
            2,
        )
        .unwrap();

    let remaining: &[(&[u8], &[u8])] = &[(b"doe", b"reindeer"), (b"dog", b"puppy")];
    let fresh = with_keys(remaining);
    assert_eq!(after_delete, fresh);
    assert_eq!(
        db.get(&Nibbles::from_key_bytes(b"dogglesworth")).unwrap(),
        None
    );
    assert_eq!(
        db.get(&Nibbles::from_key_bytes(b"dog")).unwrap(),
        Some(b"puppy".to_vec())
    );
}

#[test]
fn nested_subtrie_under_account_leaf() {
    let dir = TempDir::new("statecore-triedb").unwrap();
    create_pool_file(&dir, 16);
    let pool = open_pool(&dir, Mode::CreateIfNeeded);
    let mut db = StateDb::open_state(pool, DbOptions::default()).unwrap();

    let account = key(0xaa);
    let slot1 = key(0x01);
    let slot2 = key(0x02);

    let root1 = db
        .commit(
            vec![Update {
                key: account.clone(),
                value: Some(b"account".to_vec()),
                incarnation: false,
                nested: vec![
                    Update::put(slot1.clone(), b"one".to_vec()),
                    Update::put(slot2.clone(), b"two".to_vec()),
                ],
            }],
            1,
        )
        .unwrap();
    assert_eq!(db.get(&account).unwrap(), Some(b"account".to_vec()));
    assert_eq!(db.get_nested(&account, &slot1).unwrap(), Some(b"one".to_vec()));
    assert_eq!(db.get_nested(&account, &slot2).unwrap(), Some(b"two".to_vec()));

    // Updating one storage slot changes the root.
    let root2 = db
        .commit(
            vec![Update {
                key: account.clone(),
                value: None,
                incarnation: false,
                nested: vec![Update::put(slot1.clone(), b"rewritten".to_vec())],
            }],
            2,
        )
        .unwrap();
    assert_ne!(root2, root1);
    assert_eq!(db.get(&account).unwrap(), Some(b"account".to_vec()));
    assert_eq!(
        db.get_nested(&account, &slot1).unwrap(),
        Some(b"rewritten".to_vec())
    );
    assert_eq!(db.get_nested(&account, &slot2).unwrap(), Some(b"two".to_vec()));

    // A new incarnation discards the whole previous subtrie.
    db.commit(
        vec![Update {
            key: account.clone(),
            value: Some(b"account v2".to_vec()),
            incarnation: true,
            nested: vec![Update::put(slot2.clone(), b"fresh".to_vec())],
        }],
        3,
    )
    .unwrap();
    assert_eq!(db.get_nested(&account, &slot1).unwrap(), None);
    assert_eq!(db.get_nested(&account, &slot2).unwrap(), Some(b"fresh".to_vec()));

    // Deleting the account deletes its storage with it.
    db.commit(vec![Update::tombstone(account.clone())], 4).unwrap();
    assert_eq!(db.get(&account).unwrap(), None);
    assert_eq!(db.get_nested(&account, &slot2).unwrap(), None);
}

// Filling more than one chunk and compacting the oldest one must not
// change the state root, and every key stays readable from the copied
// nodes.
#[test]
fn compaction_preserves_root_and_reads() {
    let dir = TempDir::new("statecore-triedb").unwrap();
    create_pool_file(&dir, 24);
    let pool = open_pool(&dir, Mode::CreateIfNeeded);
    let mut db = StateDb::open_state(pool, DbOptions::default()).unwrap();

    // Large values force chunk rotation quickly.
    let big = vec![0xabu8; 1 << 20];
    for i in 0..20u8 {
        let mut value = big.clone();
        value[0] = i;
        db.commit(vec![Update::put(key(i), value)], i as i64 + 1).unwrap();
    }
    let root_before = db.state_root();
    let free_before = db.free_capacity();

    let stats = db.compact(10).unwrap();
    assert!(stats.victim_chunk.is_some(), "two chunks must yield a victim");
    assert!(stats.nodes_rewritten > 0);
    assert_eq!(db.state_root(), root_before);
    assert!(db.free_capacity() > free_before);

    for i in 0..20u8 {
        let got = db.get(&key(i)).unwrap().expect("key survives compaction");
        assert_eq!(got.len(), 1 << 20);
        assert_eq!(got[0], i);
    }

    // The database keeps working after compaction.
    db.commit(vec![Update::put(key(99), b"after".to_vec())], 100)
        .unwrap();
    assert_eq!(db.get(&key(99)).unwrap(), Some(b"after".to_vec()));
}

#[test]
fn read_only_open_rejects_commits() {
    let dir = TempDir::new("statecore-triedb").unwrap();
    create_pool_file(&dir, 16);
    {
        let pool = open_pool(&dir, Mode::CreateIfNeeded);
        let mut db = StateDb::open_state(pool, DbOptions::default()).unwrap();
        db.commit(vec![Update::put(key(0x42), b"frozen".to_vec())], 1)
            .unwrap();
    }
    let pool = open_pool(&dir, Mode::OpenExisting);
    let mut db = StateDb::open_state(
        pool,
        DbOptions {
            read_only: true,
            ..DbOptions::default()
        },
    )
    .unwrap();
    assert_eq!(db.get(&key(0x42)).unwrap(), Some(b"frozen".to_vec()));
    assert!(matches!(
        db.commit(vec![Update::put(key(0x43), b"nope".to_vec())], 2),
        Err(Error::ReadOnly)
    ));
}
