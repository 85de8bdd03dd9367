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

//! The copy-on-write update engine.
//!
//! A batch is sorted by key and driven down the trie branch-wise. Subtries
//! without updates are carried over by reference; touched nodes are
//! rebuilt bottom-up, serialized, appended to the current sequential
//! chunk, and their fresh offsets recorded in the rebuilt parents. Before
//! recursing into a node's children, every child that exists only as an
//! on-disk offset is fetched in one batched round of reads.

use crate::{
    compute::Compute,
    io_layer::{NodeIo, NodeWriter},
    meta::{DbMetadata, ListKind},
    nibbles::Nibbles,
    node::{branches, Child, ChildData, ChunkOffset, Node, INVALID_VIRTUAL_OFFSET},
    CacheDepth, Result, Update,
};

pub(crate) struct UpdateCtx<'a, C: Compute> {
    pub node_io: &'a NodeIo,
    pub meta: &'a mut DbMetadata,
    pub writer: &'a mut NodeWriter,
    pub compute: &'a mut C,
    pub version: i64,
    pub cache_depth: CacheDepth,
    /// Whether a valued node's children form a nested subtrie (fixed key
    /// length tries) rather than same-trie extensions (variable length).
    pub nested_leaves: bool,
}

/// Applies a batch against the previous root and returns the staged new
/// root, or `None` when the trie became empty.
pub(crate) fn apply_batch<C: Compute>(
    ctx: &mut UpdateCtx<'_, C>,
    old_root: Option<Node>,
    mut updates: Vec<Update>,
) -> Result<Option<ChildData>> {
    updates.sort_by(|a, b| a.key.as_slice().cmp(b.key.as_slice()));
    // Last write to a key wins within one batch.
    let mut deduped: Vec<Update> = Vec::with_capacity(updates.len());
    for u in updates {
        match deduped.last_mut() {
            Some(last) if last.key == u.key => *last = u,
            _ => deduped.push(u),
        }
    }
    assert!(!deduped.is_empty(), "empty batches are handled by the caller");
    match old_root {
        None => build_new(ctx, deduped, 0, 0, 0),
        Some(node) => update_subtree(ctx, Box::new(node), deduped, 0, 0, 0),
    }
}

fn matching_from(key: &Nibbles, key_offset: usize, path: &Nibbles) -> usize {
    let mut n = 0;
    while n < path.len() && key_offset + n < key.len() && key.at(key_offset + n) == path.at(n) {
        n += 1;
    }
    n
}

// Splits the batch at nibble position `at` into the update ending exactly
// there and the per-branch groups of longer keys.
fn partition_at(
    updates: Vec<Update>,
    at: usize,
) -> (Option<Update>, [Vec<Update>; 16]) {
    let mut here = None;
    let mut groups: [Vec<Update>; 16] = Default::default();
    for u in updates {
        if u.key.len() == at {
            debug_assert!(here.is_none(), "batch was deduplicated");
            here = Some(u);
        } else {
            debug_assert!(u.key.len() > at);
            groups[u.key.at(at) as usize].push(u);
        }
    }
    (here, groups)
}

/// Builds a fresh subtree purely from updates; tombstones for keys that
/// never existed are dropped.
fn build_new<C: Compute>(
    ctx: &mut UpdateCtx<'_, C>,
    updates: Vec<Update>,
    key_offset: usize,
    branch: u8,
    depth: usize,
) -> Result<Option<ChildData>> {
    let updates: Vec<Update> = updates.into_iter().filter(|u| u.value.is_some()).collect();
    if updates.is_empty() {
        return Ok(None);
    }

    let first = updates[0].key.clone();
    let mut common = first.len() - key_offset;
    for u in &updates[1..] {
        common = common.min(matching_from(&u.key, key_offset, &first.slice_from(key_offset)));
    }
    let path = first.slice(key_offset, key_offset + common);
    let at = key_offset + common;
    let (here, groups) = partition_at(updates, at);

    let mut staged: Vec<ChildData> = Vec::new();
    let has_branches = groups.iter().any(|g| !g.is_empty());
    for (nibble, group) in groups.into_iter().enumerate() {
        if group.is_empty() {
            continue;
        }
        if let Some(child) = build_new(ctx, group, at + 1, nibble as u8, depth + common + 1)? {
            staged.push(child);
        }
    }

    let (value, nested, _incarnation) = match here {
        Some(u) => (u.value, u.nested, u.incarnation),
        None => (None, Vec::new(), false),
    };
    if !nested.is_empty() {
        assert!(
            !has_branches,
            "a key cannot gain a nested subtrie and same-trie extensions at once"
        );
        staged = build_nested_children(ctx, nested, depth + common)?;
    }

    if staged.is_empty() && value.is_none() {
        return Ok(None);
    }
    if value.is_none() && staged.len() == 1 {
        // A value-less one-child node is not canonical; hoist the child.
        let only = staged.pop().expect("one staged child");
        return Ok(Some(hoist_child(ctx, only, &path, branch, depth)?));
    }
    Ok(Some(finalize_node(ctx, path, value, staged, branch, depth)?))
}

fn build_nested_children<C: Compute>(
    ctx: &mut UpdateCtx<'_, C>,
    nested: Vec<Update>,
    depth: usize,
) -> Result<Vec<ChildData>> {
    let mut groups: [Vec<Update>; 16] = Default::default();
    for u in nested {
        assert!(!u.key.is_empty(), "nested keys must be non-empty");
        groups[u.key.at(0) as usize].push(u);
    }
    let mut staged = Vec::new();
    for (nibble, group) in groups.into_iter().enumerate() {
        if group.is_empty() {
            continue;
        }
        if let Some(child) = build_new(ctx, group, 1, nibble as u8, depth + 1)? {
            staged.push(child);
        }
    }
    Ok(staged)
}

/// Rebuilds `node` under the batch. `key_offset` nibbles of every key are
/// already consumed by the path to the node's branch point.
fn update_subtree<C: Compute>(
    ctx: &mut UpdateCtx<'_, C>,
    node: Box<Node>,
    updates: Vec<Update>,
    key_offset: usize,
    branch: u8,
    depth: usize,
) -> Result<Option<ChildData>> {
    debug_assert!(!updates.is_empty());
    let mut divergence = node.path.len();
    for u in &updates {
        divergence = divergence.min(matching_from(&u.key, key_offset, &node.path));
    }
    if divergence == node.path.len() {
        descend(ctx, node, updates, key_offset, branch, depth)
    } else {
        split(ctx, node, updates, key_offset, divergence, branch, depth)
    }
}

// All updates share the node's whole path: apply the value change here and
// merge the per-branch groups with the node's children.
fn descend<C: Compute>(
    ctx: &mut UpdateCtx<'_, C>,
    mut node: Box<Node>,
    updates: Vec<Update>,
    key_offset: usize,
    branch: u8,
    depth: usize,
) -> Result<Option<ChildData>> {
    let at = key_offset + node.path.len();
    let path = node.path.clone();
    let child_depth = depth + node.path.len() + 1;
    let (here, groups) = partition_at(updates, at);

    let mut value = node.value.take();
    let mut nested = Vec::new();
    let mut incarnation = false;
    if let Some(u) = here {
        let tombstone = u.value.is_none() && u.nested.is_empty();
        if tombstone {
            if ctx.nested_leaves {
                // Erasing the key drops its whole nested subtrie; with
                // fixed-length keys no same-trie group can coexist.
                debug_assert!(groups.iter().all(|g| g.is_empty()));
                return Ok(None);
            }
            value = None;
        } else {
            if let Some(v) = u.value {
                value = Some(v);
            }
            nested = u.nested;
            incarnation = u.incarnation;
        }
    }

    // Detach the old children into their branch slots.
    let old_mask = node.mask;
    let old_children = std::mem::take(&mut node.children);
    let mut old_by_branch: [Option<Child>; 16] = Default::default();
    for ((_, b), child) in branches(old_mask).zip(old_children) {
        old_by_branch[b as usize] = Some(child);
    }
    if incarnation {
        old_by_branch = Default::default();
    }

    let has_same_trie_groups = groups.iter().any(|g| !g.is_empty());
    let staged = if !nested.is_empty() {
        assert!(
            !has_same_trie_groups,
            "a key cannot gain a nested subtrie and same-trie extensions at once"
        );
        let mut nested_groups: [Vec<Update>; 16] = Default::default();
        for u in nested {
            assert!(!u.key.is_empty(), "nested keys must be non-empty");
            nested_groups[u.key.at(0) as usize].push(u);
        }
        merge_children(ctx, old_by_branch, nested_groups, 1, child_depth)?
    } else {
        merge_children(ctx, old_by_branch, groups, at + 1, child_depth)?
    };

    if staged.is_empty() && value.is_none() {
        return Ok(None);
    }
    if value.is_none() && staged.len() == 1 {
        let mut staged = staged;
        let only = staged.pop().expect("one staged child");
        return Ok(Some(hoist_child(ctx, only, &path, branch, depth)?));
    }
    Ok(Some(finalize_node(ctx, path, value, staged, branch, depth)?))
}

// Merges old children with per-branch update groups. Children that exist
// only on disk and are about to be descended into are fetched first in a
// single batched read.
fn merge_children<C: Compute>(
    ctx: &mut UpdateCtx<'_, C>,
    mut old_by_branch: [Option<Child>; 16],
    groups: [Vec<Update>; 16],
    child_key_offset: usize,
    child_depth: usize,
) -> Result<Vec<ChildData>> {
    let mut to_load: Vec<(usize, ChunkOffset)> = Vec::new();
    for (nibble, group) in groups.iter().enumerate() {
        if group.is_empty() {
            continue;
        }
        if let Some(child) = &old_by_branch[nibble] {
            if child.next.is_none() {
                to_load.push((nibble, child.offset));
            }
        }
    }
    let offsets: Vec<ChunkOffset> = to_load.iter().map(|(_, o)| *o).collect();
    let mut loaded = ctx.node_io.read_nodes(&offsets)?;
    for (nibble, _) in to_load.iter().rev() {
        let node = loaded.pop().expect("one node per requested offset");
        old_by_branch[*nibble]
            .as_mut()
            .expect("load list was built from present children")
            .next = Some(Box::new(node));
    }

    let mut staged: Vec<ChildData> = Vec::new();
    for (nibble, group) in groups.into_iter().enumerate() {
        let old = old_by_branch[nibble].take();
        if group.is_empty() {
            if let Some(child) = old {
                staged.push(carry_child(nibble as u8, child));
            }
            continue;
        }
        let rebuilt = match old {
            Some(mut child) => {
                let old_node = child.next.take().expect("descended children are loaded");
                update_subtree(ctx, old_node, group, child_key_offset, nibble as u8, child_depth)?
            }
            None => build_new(ctx, group, child_key_offset, nibble as u8, child_depth)?,
        };
        if let Some(child) = rebuilt {
            staged.push(child);
        }
    }
    Ok(staged)
}

// The batch diverges from the node's path at `divergence`: shorten the
// node to the suffix past the split point and hang it, along with the
// diverging updates, under a new branch node.
fn split<C: Compute>(
    ctx: &mut UpdateCtx<'_, C>,
    mut node: Box<Node>,
    updates: Vec<Update>,
    key_offset: usize,
    divergence: usize,
    branch: u8,
    depth: usize,
) -> Result<Option<ChildData>> {
    let full_path = node.path.clone();
    let split_nibble = full_path.at(divergence);
    let prefix = full_path.slice(0, divergence);
    let at = key_offset + divergence;
    let child_depth = depth + divergence + 1;
    node.path = full_path.slice_from(divergence + 1);

    let (here, mut groups) = partition_at(updates, at);

    let mut staged: Vec<ChildData> = Vec::new();
    for nibble in 0..16u8 {
        let group = std::mem::take(&mut groups[nibble as usize]);
        if nibble == split_nibble {
            let child = if group.is_empty() {
                // Untouched, but its path shrank, so it is rewritten.
                Some(refinalize(ctx, node, nibble, child_depth)?)
            } else {
                update_subtree(ctx, node, group, at + 1, nibble, child_depth)?
            };
            // The old node is consumed either way.
            node = Box::new(Node::default());
            if let Some(child) = child {
                staged.push(child);
            }
        } else if !group.is_empty() {
            if let Some(child) = build_new(ctx, group, at + 1, nibble, child_depth)? {
                staged.push(child);
            }
        }
    }
    let value = here.and_then(|u| u.value);
    if staged.is_empty() && value.is_none() {
        return Ok(None);
    }
    if value.is_none() && staged.len() == 1 {
        let only = staged.pop().expect("one staged child");
        return Ok(Some(hoist_child(ctx, only, &prefix, branch, depth)?));
    }
    Ok(Some(finalize_node(ctx, prefix, value, staged, branch, depth)?))
}

// Collapses a value-less one-child node: the child absorbs the parent's
// path plus its own branch nibble and is rewritten under the parent's
// slot.
fn hoist_child<C: Compute>(
    ctx: &mut UpdateCtx<'_, C>,
    only: ChildData,
    parent_path: &Nibbles,
    branch: u8,
    depth: usize,
) -> Result<ChildData> {
    let mut child_node = match only.node {
        Some(node) => node,
        None => Box::new(ctx.node_io.read_node(only.offset)?),
    };
    child_node.path = parent_path.join(&child_node.path.prepend(only.branch));
    refinalize(ctx, child_node, branch, depth)
}

// Serializes an already assembled node (typically after a path change)
// and stages it as a child.
fn refinalize<C: Compute>(
    ctx: &mut UpdateCtx<'_, C>,
    mut node: Box<Node>,
    branch: u8,
    depth: usize,
) -> Result<ChildData> {
    node.version = ctx.version;
    let reference = ctx.compute.compute(&node);
    let record = node.serialize();
    let (offset, own_virtual) = ctx.writer.append_node(ctx.node_io, ctx.meta, &record)?;

    let mut min_fast = INVALID_VIRTUAL_OFFSET;
    let mut min_slow = INVALID_VIRTUAL_OFFSET;
    let mut min_version = node.version;
    for child in &node.children {
        min_fast = min_fast.min(child.min_offset_fast);
        min_slow = min_slow.min(child.min_offset_slow);
        min_version = min_version.min(child.subtrie_min_version);
    }
    match writer_list(ctx) {
        ListKind::Fast => min_fast = min_fast.min(own_virtual),
        _ => min_slow = min_slow.min(own_virtual),
    }

    Ok(ChildData {
        branch,
        node: Some(node),
        offset,
        data: reference,
        subtrie_min_version: min_version,
        min_offset_fast: min_fast,
        min_offset_slow: min_slow,
        cache: ctx.cache_depth.keep(depth),
    })
}

fn writer_list<C: Compute>(ctx: &UpdateCtx<'_, C>) -> ListKind {
    ctx.writer.list_kind()
}

fn carry_child(branch: u8, child: Child) -> ChildData {
    ChildData {
        branch,
        offset: child.offset,
        data: child.data,
        subtrie_min_version: child.subtrie_min_version,
        min_offset_fast: child.min_offset_fast,
        min_offset_slow: child.min_offset_slow,
        node: child.next,
        cache: true,
    }
}

// Assembles, hashes, serializes and appends a rebuilt node, returning its
// staging slot for the parent.
fn finalize_node<C: Compute>(
    ctx: &mut UpdateCtx<'_, C>,
    path: Nibbles,
    value: Option<Vec<u8>>,
    mut staged: Vec<ChildData>,
    branch: u8,
    depth: usize,
) -> Result<ChildData> {
    debug_assert!(staged.windows(2).all(|w| w[0].branch < w[1].branch));
    let mask = staged.iter().fold(0u16, |m, c| m | 1 << c.branch);
    if ctx.nested_leaves && value.is_some() && staged.len() == 1 && staged[0].node.is_none() {
        // The single-child hoist inside compute_data needs the child's
        // path; a carried child may exist only as an offset.
        staged[0].node = Some(Box::new(ctx.node_io.read_node(staged[0].offset)?));
    }
    let data = ctx
        .compute
        .compute_data(&staged, mask, &path, value.as_deref());

    let mut node = Box::new(Node {
        mask,
        path,
        value,
        data,
        version: ctx.version,
        children: Vec::with_capacity(staged.len()),
    });
    for child in staged {
        node.children.push(child.into_child());
    }
    refinalize(ctx, node, branch, depth)
}
