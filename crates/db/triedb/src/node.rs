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

//! Trie node representation and its on-disk codec.
//!
//! A node can be extension and branch at once: a non-empty relative path
//! with a child mask. A node with a value is a leaf, which may still have
//! children when a nested subtrie hangs under it. One-child nodes without
//! a value never exist in canonical form; they are collapsed into their
//! remaining child.

use crate::{nibbles::Nibbles, Error, Result};

/// Maximum bytes of cached intermediate hash data per node.
pub const MAX_DATA_LEN: usize = (1 << 6) - 1;

/// A node's position on storage, packed as `chunk_id:20 | offset:44`.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChunkOffset(u64);

impl ChunkOffset {
    pub const INVALID: ChunkOffset = ChunkOffset(u64::MAX);
    const OFFSET_BITS: u32 = 44;

    pub fn new(chunk_id: u32, offset: u64) -> ChunkOffset {
        debug_assert!(chunk_id < (1 << 20));
        debug_assert!(offset < (1 << Self::OFFSET_BITS));
        ChunkOffset(((chunk_id as u64) << Self::OFFSET_BITS) | offset)
    }

    pub fn from_raw(raw: u64) -> ChunkOffset {
        ChunkOffset(raw)
    }

    pub fn to_raw(self) -> u64 {
        self.0
    }

    pub fn chunk_id(self) -> u32 {
        (self.0 >> Self::OFFSET_BITS) as u32
    }

    pub fn offset(self) -> u64 {
        self.0 & ((1 << Self::OFFSET_BITS) - 1)
    }

    pub fn is_valid(self) -> bool {
        self.0 != u64::MAX
    }
}

impl std::fmt::Debug for ChunkOffset {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        if self.is_valid() {
            write!(f, "{}:{}", self.chunk_id(), self.offset())
        } else {
            write!(f, "invalid")
        }
    }
}

/// Truncated "virtual" list offset used by the compaction pruning walks;
/// smaller means older within its list.
pub const INVALID_VIRTUAL_OFFSET: u32 = u32::MAX;

/// A child slot of a node.
#[derive(Debug)]
pub struct Child {
    /// On-disk position; only valid once the child's bytes have been
    /// handed to the i/o engine.
    pub offset: ChunkOffset,
    /// Minimum fast-list virtual offset in the child's subtrie.
    pub min_offset_fast: u32,
    /// Minimum slow-list virtual offset in the child's subtrie.
    pub min_offset_slow: u32,
    /// Minimum node version in the child's subtrie.
    pub subtrie_min_version: i64,
    /// The child's Merkle reference: inline RLP under 32 bytes, otherwise
    /// the 32-byte Keccak of its encoding.
    pub data: Vec<u8>,
    /// In-memory child, absent when only the on-disk offset is known.
    pub next: Option<Box<Node>>,
}

/// Iterates the set branches of a mask as `(child_index, branch)`.
pub fn branches(mask: u16) -> impl Iterator<Item = (usize, u8)> {
    let mut m = mask;
    let mut index = 0usize;
    std::iter::from_fn(move || {
        if m == 0 {
            return None;
        }
        let branch = m.trailing_zeros() as u8;
        m &= m - 1;
        let i = index;
        index += 1;
        Some((i, branch))
    })
}

/// An in-memory trie node.
#[derive(Debug, Default)]
pub struct Node {
    /// Bitmap of which of the 16 branches exist.
    pub mask: u16,
    /// Relative path from the parent's branch point.
    pub path: Nibbles,
    /// Leaf payload.
    pub value: Option<Vec<u8>>,
    /// Cached intermediate hash for an implicit branch node.
    pub data: Vec<u8>,
    /// For leaves the version of the last write; for interior nodes at
    /// least the maximum version underneath.
    pub version: i64,
    /// Child slots, one per set mask bit, in branch order.
    pub children: Vec<Child>,
}

impl Node {
    pub fn number_of_children(&self) -> usize {
        self.children.len()
    }

    pub fn has_value(&self) -> bool {
        self.value.is_some()
    }

    pub fn has_path(&self) -> bool {
        !self.path.is_empty()
    }

    /// Index into `children` for a branch nibble; the branch must be set.
    pub fn child_index(&self, branch: u8) -> usize {
        debug_assert!(self.mask & (1 << branch) != 0);
        (self.mask & ((1u16 << branch) - 1)).count_ones() as usize
    }

    pub fn child(&self, branch: u8) -> Option<&Child> {
        if self.mask & (1 << branch) == 0 {
            None
        } else {
            Some(&self.children[self.child_index(branch)])
        }
    }

    /// Minimum version across this node and its subtries.
    pub fn min_version(&self) -> i64 {
        self.children
            .iter()
            .map(|c| c.subtrie_min_version)
            .fold(self.version, i64::min)
    }

    /// Serialized size on disk, excluding the record length prefix.
    pub fn disk_size(&self) -> usize {
        let child_data: usize = self.children.iter().map(|c| c.data.len()).sum();
        2 + 1
            + 1
            + 4
            + 8
            + self.children.len() * (8 + 4 + 4 + 8 + 2)
            + self.path.len().div_ceil(2)
            + self.value.as_ref().map_or(0, |v| v.len())
            + self.data.len()
            + child_data
    }

    /// Encodes the node into the on-disk record layout. All multi-byte
    /// fields are little-endian.
    pub fn serialize(&self) -> Vec<u8> {
        debug_assert_eq!(self.children.len(), self.mask.count_ones() as usize);
        debug_assert!(self.data.len() <= MAX_DATA_LEN);
        debug_assert!(self.path.len() <= u8::MAX as usize);

        let mut out = Vec::with_capacity(self.disk_size());
        out.extend_from_slice(&self.mask.to_le_bytes());
        let bitpacked: u8 = (self.has_value() as u8) | ((self.data.len() as u8) << 2);
        out.push(bitpacked);
        out.push(self.path.len() as u8);
        let value_len = self.value.as_ref().map_or(0, |v| v.len()) as u32;
        out.extend_from_slice(&value_len.to_le_bytes());
        out.extend_from_slice(&self.version.to_le_bytes());

        let mut child_data_offset: u16 = 0;
        for child in &self.children {
            out.extend_from_slice(&child.offset.to_raw().to_le_bytes());
            out.extend_from_slice(&child.min_offset_fast.to_le_bytes());
            out.extend_from_slice(&child.min_offset_slow.to_le_bytes());
            out.extend_from_slice(&child.subtrie_min_version.to_le_bytes());
            out.extend_from_slice(&child_data_offset.to_le_bytes());
            child_data_offset += child.data.len() as u16;
        }

        out.extend_from_slice(&self.path.to_packed());
        if let Some(value) = &self.value {
            out.extend_from_slice(value);
        }
        out.extend_from_slice(&self.data);
        for child in &self.children {
            out.extend_from_slice(&child.data);
        }
        out
    }

    /// Decodes a node record produced by `serialize`.
    pub fn deserialize(bytes: &[u8]) -> Result<Node> {
        let fail = || Error::CorruptNode;
        if bytes.len() < 16 {
            return Err(fail());
        }
        let mask = u16::from_le_bytes(bytes[0..2].try_into().expect("2 bytes"));
        let bitpacked = bytes[2];
        let has_value = bitpacked & 1 != 0;
        let data_len = (bitpacked >> 2) as usize;
        let path_nibbles = bytes[3] as usize;
        let value_len = u32::from_le_bytes(bytes[4..8].try_into().expect("4 bytes")) as usize;
        let version = i64::from_le_bytes(bytes[8..16].try_into().expect("8 bytes"));

        let child_count = mask.count_ones() as usize;
        let mut pos = 16;
        let mut raw_children = Vec::with_capacity(child_count);
        for _ in 0..child_count {
            if bytes.len() < pos + 26 {
                return Err(fail());
            }
            let offset =
                u64::from_le_bytes(bytes[pos..pos + 8].try_into().expect("8 bytes"));
            let min_fast =
                u32::from_le_bytes(bytes[pos + 8..pos + 12].try_into().expect("4 bytes"));
            let min_slow =
                u32::from_le_bytes(bytes[pos + 12..pos + 16].try_into().expect("4 bytes"));
            let min_version =
                i64::from_le_bytes(bytes[pos + 16..pos + 24].try_into().expect("8 bytes"));
            let data_off =
                u16::from_le_bytes(bytes[pos + 24..pos + 26].try_into().expect("2 bytes"));
            raw_children.push((offset, min_fast, min_slow, min_version, data_off));
            pos += 26;
        }

        let path_bytes = path_nibbles.div_ceil(2);
        if bytes.len() < pos + path_bytes + value_len + data_len {
            return Err(fail());
        }
        let path = Nibbles::from_packed(&bytes[pos..pos + path_bytes], path_nibbles);
        pos += path_bytes;
        let value = if has_value {
            Some(bytes[pos..pos + value_len].to_vec())
        } else {
            None
        };
        pos += value_len;
        let data = bytes[pos..pos + data_len].to_vec();
        pos += data_len;

        let child_blob = &bytes[pos..];
        let mut children = Vec::with_capacity(child_count);
        for (i, (offset, min_fast, min_slow, min_version, data_off)) in
            raw_children.iter().enumerate()
        {
            let start = *data_off as usize;
            let end = if i + 1 < child_count {
                raw_children[i + 1].4 as usize
            } else {
                child_blob.len()
            };
            if start > end || end > child_blob.len() {
                return Err(fail());
            }
            children.push(Child {
                offset: ChunkOffset::from_raw(*offset),
                min_offset_fast: *min_fast,
                min_offset_slow: *min_slow,
                subtrie_min_version: *min_version,
                data: child_blob[start..end].to_vec(),
                next: None,
            });
        }

        Ok(Node {
            mask,
            path,
            value,
            data,
            version,
            children,
        })
    }
}

/// Staging slot for a child while the update recursion rebuilds a node.
///
/// The in-memory node stays attached until the parent has hashed and
/// serialized itself; only then does the cache policy decide whether the
/// pointer survives into the parent's child table.
#[derive(Debug)]
pub struct ChildData {
    pub branch: u8,
    pub node: Option<Box<Node>>,
    pub offset: ChunkOffset,
    pub data: Vec<u8>,
    pub subtrie_min_version: i64,
    pub min_offset_fast: u32,
    pub min_offset_slow: u32,
    /// Attach the in-memory node to the parent; drop it otherwise.
    pub cache: bool,
}

impl ChildData {
    pub fn is_valid(&self) -> bool {
        self.branch < 16
    }

    pub fn into_child(self) -> Child {
        Child {
            offset: self.offset,
            min_offset_fast: self.min_offset_fast,
            min_offset_slow: self.min_offset_slow,
            subtrie_min_version: self.subtrie_min_version,
            data: self.data,
            next: if self.cache { self.node } else { None },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_node() -> Node {
        Node {
            mask: 0b0000_0000_0101_0000,
            path: Nibbles::from_nibbles(&[6, 4, 6]),
            value: Some(b"payload".to_vec()),
            data: vec![0xab; 32],
            version: 42,
            children: vec![
                Child {
                    offset: ChunkOffset::new(3, 4096),
                    min_offset_fast: 7,
                    min_offset_slow: INVALID_VIRTUAL_OFFSET,
                    subtrie_min_version: 40,
                    data: vec![0x11; 32],
                    next: None,
                },
                Child {
                    offset: ChunkOffset::new(900_000, (1 << 44) - 1),
                    min_offset_fast: 9,
                    min_offset_slow: 3,
                    subtrie_min_version: 41,
                    data: vec![0xc2, 0x01, 0x02],
                    next: None,
                },
            ],
        }
    }

    #[test]
    fn chunk_offset_packing() {
        let off = ChunkOffset::new(0xabcde, 0x0123_4567_89ab);
        assert_eq!(off.chunk_id(), 0xabcde);
        assert_eq!(off.offset(), 0x0123_4567_89ab);
        assert!(!ChunkOffset::INVALID.is_valid());
    }

    #[test]
    fn serialization_round_trip() {
        let node = sample_node();
        let bytes = node.serialize();
        assert_eq!(bytes.len(), node.disk_size());
        let back = Node::deserialize(&bytes).unwrap();
        assert_eq!(back.mask, node.mask);
        assert_eq!(back.path, node.path);
        assert_eq!(back.value, node.value);
        assert_eq!(back.data, node.data);
        assert_eq!(back.version, node.version);
        assert_eq!(back.children.len(), 2);
        for (a, b) in back.children.iter().zip(node.children.iter()) {
            assert_eq!(a.offset, b.offset);
            assert_eq!(a.min_offset_fast, b.min_offset_fast);
            assert_eq!(a.min_offset_slow, b.min_offset_slow);
            assert_eq!(a.subtrie_min_version, b.subtrie_min_version);
            assert_eq!(a.data, b.data);
        }
    }

    #[test]
    fn branch_iteration_matches_mask() {
        let collected: Vec<(usize, u8)> = branches(0b1000_0000_0101_0000).collect();
        assert_eq!(collected, vec![(0, 4), (1, 6), (2, 15)]);
    }

    #[test]
    fn child_index_by_popcount() {
        let node = sample_node();
        assert_eq!(node.child_index(4), 0);
        assert_eq!(node.child_index(6), 1);
        assert!(node.child(5).is_none());
        assert!(node.child(6).is_some());
    }
}
