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

//! Compaction: reclaiming the oldest chunk of a list.
//!
//! A pass picks the head chunk of the fast or slow list as the victim,
//! walks the committed trie copying every live node inside the victim to
//! the current slow write position, republishes the root, and returns the
//! emptied chunk to the free list via a discard. Per-child minimum virtual
//! offsets let the walk skip every branch whose subtrie cannot reach into
//! the victim. Merkle data is untouched: moving a node never changes its
//! hash, so the state root is identical before and after.
//!
//! Roots of versions older than the retention cut-off passed by the
//! caller may stop resolving once their exclusive nodes are reclaimed.

use storage_pool::ChunkKind;

use crate::{
    compute::Compute,
    db::Db,
    meta::ListKind,
    node::{ChunkOffset, INVALID_VIRTUAL_OFFSET},
    Error, Result,
};

/// What a compaction pass did.
#[derive(Debug, Clone, Copy, Default)]
pub struct CompactionStats {
    /// The reclaimed chunk, if any.
    pub victim_chunk: Option<u32>,
    /// Live nodes copied out of the victim (or rewritten above them).
    pub nodes_rewritten: usize,
    /// Capacity returned to the free list.
    pub bytes_freed: u64,
}

struct Rewritten {
    offset: ChunkOffset,
    min_fast: u32,
    min_slow: u32,
}

impl<C: Compute> Db<C> {
    /// Compacts the head chunk of the fast list. Historical roots with
    /// versions below `retain_min_version` are no longer guaranteed to
    /// resolve afterwards.
    pub fn compact(&mut self, retain_min_version: i64) -> Result<CompactionStats> {
        self.compact_list(ListKind::Fast, retain_min_version)
    }

    /// Compacts the head chunk of the slow list.
    pub fn compact_slow(&mut self, retain_min_version: i64) -> Result<CompactionStats> {
        self.compact_list(ListKind::Slow, retain_min_version)
    }

    fn compact_list(&mut self, list: ListKind, retain_min_version: i64) -> Result<CompactionStats> {
        if self.options.read_only {
            return Err(Error::ReadOnly);
        }
        let mut stats = CompactionStats::default();
        let victim = match self.meta.list_head(list) {
            Some(id) => id,
            None => return Ok(stats),
        };
        let active_writer = match list {
            ListKind::Fast => self.writer_fast.current_chunk_id(),
            _ => self.writer_slow.current_chunk_id(),
        };
        if active_writer == Some(victim) {
            // The list's only chunk is still being appended to.
            return Ok(stats);
        }
        // Every virtual offset whose insertion count matches the victim's
        // lies inside it.
        let window_end = (self.meta.insertion_count(victim) << 12) | 0xfff;

        let new_root = match self.root_offset() {
            None => None,
            Some(root_offset) => {
                let rewritten =
                    self.rewrite_node(root_offset, list, victim, window_end, &mut stats)?;
                self.writer_slow.flush(&self.node_io, &mut self.meta)?;
                self.writer_slow.sync()?;
                Some(rewritten.map_or(root_offset, |r| r.offset))
            }
        };

        let mut offsets = self.meta.offsets;
        if let Some(root) = new_root {
            offsets.root_offset = root;
        }
        offsets.start_of_wip_offset_fast = self.writer_fast.wip_offset();
        offsets.start_of_wip_offset_slow = self.writer_slow.wip_offset();
        match list {
            ListKind::Fast => {
                offsets.last_compact_offset_fast = window_end;
                offsets.last_compact_offset_range_fast = 1 << 12;
            }
            _ => {
                offsets.last_compact_offset_slow = window_end;
                offsets.last_compact_offset_range_slow = 1 << 12;
            }
        }
        self.meta.advance_offsets(offsets)?;

        // The in-memory tree still names offsets inside the victim.
        self.root = None;

        self.meta.remove_from_list(victim)?;
        let chunk = self
            .node_io
            .pool()
            .activate_chunk(ChunkKind::Seq, victim)
            .map_err(Error::Pool)?;
        chunk.destroy_contents().map_err(Error::Pool)?;
        self.meta.append_to_list(ListKind::Free, victim)?;
        self.meta.add_free_capacity(chunk.capacity())?;

        stats.victim_chunk = Some(victim);
        stats.bytes_freed = chunk.capacity();
        info!(
            target: "triedb",
            "compacted chunk {victim} from {list:?} list, {} nodes rewritten, retention {}",
            stats.nodes_rewritten,
            retain_min_version
        );
        Ok(stats)
    }

    // Rewrites the subtree at `offset` so nothing live remains inside the
    // victim chunk. Returns `None` when the subtree was untouched.
    fn rewrite_node(
        &mut self,
        offset: ChunkOffset,
        list: ListKind,
        victim: u32,
        window_end: u32,
        stats: &mut CompactionStats,
    ) -> Result<Option<Rewritten>> {
        let in_victim = offset.chunk_id() == victim;
        let mut node = self.node_io.read_node(offset)?;
        let mut changed = in_victim;

        for i in 0..node.children.len() {
            let reaches_victim = {
                let child = &node.children[i];
                let min = match list {
                    ListKind::Fast => child.min_offset_fast,
                    _ => child.min_offset_slow,
                };
                min != INVALID_VIRTUAL_OFFSET && min <= window_end
            };
            if !reaches_victim {
                continue;
            }
            let child_offset = node.children[i].offset;
            if let Some(r) = self.rewrite_node(child_offset, list, victim, window_end, stats)? {
                let child = &mut node.children[i];
                child.offset = r.offset;
                child.min_offset_fast = r.min_fast;
                child.min_offset_slow = r.min_slow;
                child.next = None;
                changed = true;
            }
        }
        if !changed {
            return Ok(None);
        }

        let record = node.serialize();
        let (new_offset, own_virtual) =
            self.writer_slow
                .append_node(&self.node_io, &mut self.meta, &record)?;
        let mut min_fast = INVALID_VIRTUAL_OFFSET;
        let mut min_slow = own_virtual;
        for child in &node.children {
            min_fast = min_fast.min(child.min_offset_fast);
            min_slow = min_slow.min(child.min_offset_slow);
        }
        stats.nodes_rewritten += 1;
        Ok(Some(Rewritten {
            offset: new_offset,
            min_fast,
            min_slow,
        }))
    }
}
