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

//! The database facade: open/recover, commit, lookup.

use std::sync::Arc;

use ethereum_types::H256;
use storage_aio::{AsyncIo, RingConfig};
use storage_pool::{ChunkKind, StoragePool};

use crate::{
    compute::{empty_trie_root, Compute, MerkleCompute, VarLenMerkleCompute},
    io_layer::{NodeIo, NodeWriter},
    meta::{DbMetadata, DbOffsets, ListKind},
    nibbles::Nibbles,
    node::{ChunkOffset, Node},
    update::{apply_batch, UpdateCtx},
    CacheDepth, Error, Result, Update,
};

/// Tuning knobs for opening a database.
#[derive(Debug, Clone)]
pub struct DbOptions {
    pub read_only: bool,
    /// Permit opening a database whose dirty byte is still set; recovery
    /// rewinds the work-in-progress spans.
    pub allow_dirty: bool,
    pub cache_depth: CacheDepth,
    pub ring: RingConfig,
}

impl Default for DbOptions {
    fn default() -> Self {
        DbOptions {
            read_only: false,
            allow_dirty: false,
            cache_depth: CacheDepth::AboveDepth(8),
            ring: RingConfig::default(),
        }
    }
}

/// A versioned trie database over a storage pool.
///
/// Single writer per pool; historical roots stay readable concurrently
/// because published nodes are immutable.
pub struct Db<C: Compute> {
    pub(crate) node_io: NodeIo,
    pub(crate) meta: DbMetadata,
    pub(crate) writer_fast: NodeWriter,
    pub(crate) writer_slow: NodeWriter,
    pub(crate) compute: C,
    pub(crate) options: DbOptions,
    pub(crate) capacity_shift: u32,
    pub(crate) root: Option<Node>,
    pub(crate) root_reference: Option<Vec<u8>>,
    pub(crate) root_version: Option<i64>,
}

/// Database hashing state and storage tries.
pub type StateDb = Db<MerkleCompute>;
/// Database hashing variable key length tries (receipts, transactions).
pub type VarLenDb = Db<VarLenMerkleCompute>;

impl<C: Compute> Db<C> {
    /// Opens (creating or recovering as needed) a database over `pool`.
    pub fn open(pool: Arc<StoragePool>, options: DbOptions, compute: C) -> Result<Db<C>> {
        let engine = AsyncIo::new(options.ring.clone()).map_err(Error::Aio)?;
        let node_io = NodeIo::new(pool.clone(), engine);
        let capacity_shift = pool.chunk_capacity().trailing_zeros();
        let cnv0 = pool
            .activate_chunk(ChunkKind::Cnv, 0)
            .map_err(Error::Pool)?;

        let read_only = options.read_only || pool.is_read_only();
        let allow_dirty = options.allow_dirty || pool.is_read_only_allow_dirty();
        let meta = if pool.is_newly_truncated() && !read_only {
            DbMetadata::create(cnv0, pool.chunks(ChunkKind::Seq), pool.chunk_capacity())?
        } else {
            match DbMetadata::open(cnv0.clone(), read_only, allow_dirty) {
                Ok(meta) => meta,
                Err(Error::BadMetaMagic) if !read_only => {
                    DbMetadata::create(cnv0, pool.chunks(ChunkKind::Seq), pool.chunk_capacity())?
                }
                Err(err) => return Err(err),
            }
        };

        let mut db = Db {
            node_io,
            meta,
            writer_fast: NodeWriter::new(ListKind::Fast, capacity_shift),
            writer_slow: NodeWriter::new(ListKind::Slow, capacity_shift),
            compute,
            options: DbOptions {
                read_only,
                allow_dirty,
                ..options
            },
            capacity_shift,
            root: None,
            root_reference: None,
            root_version: None,
        };

        if !read_only {
            db.rewind_wip()?;
            db.meta.clear_dirty()?;
        }
        db.writer_fast.resume(&db.node_io, &db.meta)?;
        db.writer_slow.resume(&db.node_io, &db.meta)?;

        let root_offset = db.meta.offsets.root_offset;
        if root_offset.is_valid() {
            let root = db.node_io.read_node(root_offset)?;
            db.root_reference = Some(db.compute.compute(&root));
            db.root_version = Some(root.version);
            db.root = Some(root);
        }
        info!(
            target: "triedb",
            "database opened, root {:?}, version {:?}",
            root_offset,
            db.root_version
        );
        Ok(db)
    }

    // Content past the committed work-in-progress offsets was never
    // published; chunks rotated to after the WIP chunk go back to the
    // free list and the WIP chunk's tail is trimmed.
    fn rewind_wip(&mut self) -> Result<()> {
        for (wip, list) in [
            (self.meta.offsets.start_of_wip_offset_fast, ListKind::Fast),
            (self.meta.offsets.start_of_wip_offset_slow, ListKind::Slow),
        ] {
            if !wip.is_valid() {
                // Nothing was ever committed to this list.
                while let Some(id) = self.meta.pop_list_head(list)? {
                    let chunk = self
                        .node_io
                        .pool()
                        .activate_chunk(ChunkKind::Seq, id)
                        .map_err(Error::Pool)?;
                    chunk.destroy_contents().map_err(Error::Pool)?;
                    self.meta.append_to_list(ListKind::Free, id)?;
                    self.meta.add_free_capacity(chunk.capacity())?;
                }
                continue;
            }
            while self.meta.list_tail(list) != Some(wip.chunk_id()) {
                let tail = self
                    .meta
                    .list_tail(list)
                    .expect("the WIP chunk is linked on its list");
                trace!(target: "triedb", "recovery drops torn chunk {tail}");
                self.meta.remove_from_list(tail)?;
                let chunk = self
                    .node_io
                    .pool()
                    .activate_chunk(ChunkKind::Seq, tail)
                    .map_err(Error::Pool)?;
                chunk.destroy_contents().map_err(Error::Pool)?;
                self.meta.append_to_list(ListKind::Free, tail)?;
                self.meta.add_free_capacity(chunk.capacity())?;
            }
            let chunk = self
                .node_io
                .pool()
                .activate_chunk(ChunkKind::Seq, wip.chunk_id())
                .map_err(Error::Pool)?;
            let excess = chunk.size().saturating_sub(wip.offset());
            if excess > 0 {
                trace!(target: "triedb", "recovery trims {excess} torn bytes");
                chunk.try_trim_contents(excess as u32);
            }
        }
        Ok(())
    }

    /// Largest value a leaf can hold on this pool.
    pub fn max_value_len(&self) -> usize {
        (1usize << self.capacity_shift) - 4096
    }

    fn check_value_sizes(&self, updates: &[Update]) -> Result<()> {
        let max = self.max_value_len();
        let mut stack: Vec<&Update> = updates.iter().collect();
        while let Some(u) = stack.pop() {
            if let Some(value) = &u.value {
                if value.len() > max {
                    return Err(Error::ValueTooLarge {
                        len: value.len(),
                        max,
                    });
                }
            }
            stack.extend(u.nested.iter());
        }
        Ok(())
    }

    /// Applies a batch and commits the new root under `version`. Returns
    /// the new state root hash. On any failure before the root offset is
    /// advanced the previous root stays committed.
    pub fn commit(&mut self, updates: Vec<Update>, version: i64) -> Result<H256> {
        if self.options.read_only {
            return Err(Error::ReadOnly);
        }
        if updates.is_empty() {
            return Ok(self.state_root());
        }
        self.check_value_sizes(&updates)?;

        let old_root = match self.root.take() {
            Some(root) => Some(root),
            None if self.meta.offsets.root_offset.is_valid() => {
                Some(self.node_io.read_node(self.meta.offsets.root_offset)?)
            }
            None => None,
        };

        let nested_leaves = self.compute.nested_leaves();
        let result = {
            let mut ctx = UpdateCtx {
                node_io: &self.node_io,
                meta: &mut self.meta,
                writer: &mut self.writer_fast,
                compute: &mut self.compute,
                version,
                cache_depth: self.options.cache_depth,
                nested_leaves,
            };
            apply_batch(&mut ctx, old_root, updates)?
        };

        self.writer_fast.flush(&self.node_io, &mut self.meta)?;
        self.writer_slow.flush(&self.node_io, &mut self.meta)?;
        self.writer_fast.sync()?;
        self.writer_slow.sync()?;

        let offsets = DbOffsets {
            root_offset: result.as_ref().map_or(ChunkOffset::INVALID, |c| c.offset),
            start_of_wip_offset_fast: self.writer_fast.wip_offset(),
            start_of_wip_offset_slow: self.writer_slow.wip_offset(),
            ..self.meta.offsets
        };
        self.meta.advance_offsets(offsets)?;

        match result {
            Some(child) => {
                self.root = if child.cache {
                    child.node.map(|b| *b)
                } else {
                    None
                };
                self.root_reference = Some(child.data);
                self.root_version = Some(version);
            }
            None => {
                self.root = None;
                self.root_reference = None;
                self.root_version = None;
            }
        }
        debug!(target: "triedb", "committed version {version}, root {:?}", offsets.root_offset);
        Ok(self.state_root())
    }

    /// The committed root hash; the hash of the empty trie when nothing
    /// was ever committed.
    pub fn state_root(&self) -> H256 {
        match &self.root_reference {
            Some(reference) => self.compute.root_hash(reference),
            None => empty_trie_root(),
        }
    }

    /// On-disk offset of the committed root, if any.
    pub fn root_offset(&self) -> Option<ChunkOffset> {
        let offset = self.meta.offsets.root_offset;
        offset.is_valid().then_some(offset)
    }

    /// Version of the committed root.
    pub fn latest_version(&self) -> Option<i64> {
        self.root_version
    }

    /// Looks a key up under the committed root.
    pub fn get(&self, key: &Nibbles) -> Result<Option<Vec<u8>>> {
        self.get_with_nested(key, None)
    }

    /// Looks up `nested_key` inside the subtrie hanging under `key`.
    pub fn get_nested(&self, key: &Nibbles, nested_key: &Nibbles) -> Result<Option<Vec<u8>>> {
        self.get_with_nested(key, Some(nested_key))
    }

    fn get_with_nested(&self, key: &Nibbles, nested: Option<&Nibbles>) -> Result<Option<Vec<u8>>> {
        match &self.root {
            Some(root) => self.walk(root, key, 0, nested),
            None => match self.root_offset() {
                Some(offset) => {
                    let root = self.node_io.read_node(offset)?;
                    self.walk(&root, key, 0, nested)
                }
                None => Ok(None),
            },
        }
    }

    /// Looks a key up under a historical root. Nodes are immutable once
    /// published, so this is safe concurrently with a writer as long as
    /// compaction has not reclaimed the version's chunks.
    pub fn get_at_root(&self, root: ChunkOffset, key: &Nibbles) -> Result<Option<Vec<u8>>> {
        let root = self.node_io.read_node(root)?;
        self.walk(&root, key, 0, None)
    }

    fn walk(
        &self,
        node: &Node,
        key: &Nibbles,
        consumed: usize,
        nested: Option<&Nibbles>,
    ) -> Result<Option<Vec<u8>>> {
        if !key.slice_from(consumed).starts_with(&node.path) {
            return Ok(None);
        }
        let consumed = consumed + node.path.len();
        if consumed == key.len() {
            return match nested {
                None => Ok(node.value.clone()),
                Some(nested_key) => self.walk_branch(node, nested_key, 0, None),
            };
        }
        self.walk_branch(node, key, consumed, nested)
    }

    fn walk_branch(
        &self,
        node: &Node,
        key: &Nibbles,
        consumed: usize,
        nested: Option<&Nibbles>,
    ) -> Result<Option<Vec<u8>>> {
        let branch = key.at(consumed);
        let child = match node.child(branch) {
            Some(child) => child,
            None => return Ok(None),
        };
        match &child.next {
            Some(next) => self.walk(next, key, consumed + 1, nested),
            None => {
                let loaded = self.node_io.read_node(child.offset)?;
                self.walk(&loaded, key, consumed + 1, nested)
            }
        }
    }

    /// Bytes of capacity left on the free list.
    pub fn free_capacity(&self) -> u64 {
        self.meta.free_capacity
    }

    /// Current append position of the fast stream, staged bytes included.
    pub fn write_position(&self) -> Option<ChunkOffset> {
        let offset = self.writer_fast.wip_offset();
        offset.is_valid().then_some(offset)
    }

    /// The slow-to-fast capacity ratio the allocator aims for.
    pub fn slow_fast_ratio(&self) -> f32 {
        self.meta.slow_fast_ratio
    }

    /// Adjusts the slow-to-fast capacity ratio tuning hint.
    pub fn set_slow_fast_ratio(&mut self, ratio: f32) -> Result<()> {
        if self.options.read_only {
            return Err(Error::ReadOnly);
        }
        self.meta.set_slow_fast_ratio(ratio)
    }

    /// Leaves the metadata dirty byte set, as if the process had crashed
    /// mid-mutation. Recovery test scaffolding.
    pub fn poison_dirty_for_crash_test(&mut self) -> Result<()> {
        self.meta.poison_dirty()
    }
}

impl StateDb {
    /// Opens a state database with the default fixed-length Merkle
    /// computation.
    pub fn open_state(pool: Arc<StoragePool>, options: DbOptions) -> Result<StateDb> {
        Db::open(pool, options, MerkleCompute::new())
    }
}

impl VarLenDb {
    /// Opens a database hashing variable key length tries.
    pub fn open_var_len(pool: Arc<StoragePool>, options: DbOptions) -> Result<VarLenDb> {
        Db::open(pool, options, VarLenMerkleCompute::new())
    }
}
