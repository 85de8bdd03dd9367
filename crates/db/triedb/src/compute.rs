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

//! Merkle hashing plugged into the trie update engine.
//!
//! A node's contribution to its parent is a "reference": the node's RLP
//! encoding when it is under 32 bytes, otherwise the 32-byte Keccak of
//! that encoding. The trie root is always reduced to a full hash.

use ethereum_types::H256;
use keccak_hash::keccak;
use rlp::RlpStream;

use crate::{
    nibbles::Nibbles,
    node::{branches, ChildData, Node},
};

pub const KECCAK256_SIZE: usize = 32;

/// Root hash of a trie with no entries, `keccak(rlp(""))`.
pub fn empty_trie_root() -> H256 {
    keccak([0x80u8])
}

fn to_node_reference(rlp_bytes: &[u8]) -> Vec<u8> {
    if rlp_bytes.len() < KECCAK256_SIZE {
        rlp_bytes.to_vec()
    } else {
        keccak(rlp_bytes).as_bytes().to_vec()
    }
}

fn append_reference(s: &mut RlpStream, reference: &[u8]) {
    if reference.len() >= KECCAK256_SIZE {
        s.append(&reference.to_vec());
    } else {
        // An inline reference is already a complete RLP item.
        s.append_raw(reference, 1);
    }
}

/// RLP of `[hex_prefix(path, leaf), second]`, reduced to a reference.
/// The second piece is a byte string for leaf values and hashes, and an
/// already encoded item for inline child references.
fn encode_two_pieces(path: &Nibbles, second: &[u8], leaf: bool) -> Vec<u8> {
    let mut s = RlpStream::new_list(2);
    s.append(&path.hex_prefix_encode(leaf));
    if leaf {
        s.append(&second.to_vec());
    } else {
        append_reference(&mut s, second);
    }
    to_node_reference(&s.out())
}

fn append_empty(s: &mut RlpStream) {
    s.append_empty_data();
}

/// The sixteen branch items followed by the value slot.
fn encode_branch_items<'a>(
    refs: &[Option<&'a [u8]>; 16],
    value: Option<&[u8]>,
) -> Vec<u8> {
    let mut s = RlpStream::new_list(17);
    for r in refs.iter() {
        match r {
            Some(data) => append_reference(&mut s, data),
            None => append_empty(&mut s),
        }
    }
    match value {
        Some(v) if !v.is_empty() => {
            s.append(&v.to_vec());
        }
        _ => append_empty(&mut s),
    }
    s.out().to_vec()
}

fn refs_of_node(node: &Node) -> [Option<&[u8]>; 16] {
    let mut refs: [Option<&[u8]>; 16] = [None; 16];
    for (index, branch) in branches(node.mask) {
        refs[branch as usize] = Some(node.children[index].data.as_slice());
    }
    refs
}

fn refs_of_children<'a>(children: &'a [ChildData]) -> [Option<&'a [u8]>; 16] {
    let mut refs: [Option<&'a [u8]>; 16] = [None; 16];
    for child in children {
        if child.is_valid() {
            refs[child.branch as usize] = Some(child.data.as_slice());
        }
    }
    refs
}

/// Per-trie hashing policy.
///
/// `compute` yields the reference a parent records for the node;
/// `compute_branch` the reference of the node's branch part alone;
/// `compute_data` whatever the node caches inline at build time (the
/// subtrie root for nested leaves, the branch reference for nodes that
/// encode as extensions).
pub trait Compute {
    fn compute_data(
        &mut self,
        children: &[ChildData],
        mask: u16,
        path: &Nibbles,
        value: Option<&[u8]>,
    ) -> Vec<u8>;

    fn compute_branch(&mut self, node: &Node) -> Vec<u8>;

    fn compute(&mut self, node: &Node) -> Vec<u8>;

    /// Reduces a root reference to the trie root hash.
    fn root_hash(&self, reference: &[u8]) -> H256 {
        if reference.len() < KECCAK256_SIZE {
            keccak(reference)
        } else {
            H256::from_slice(reference)
        }
    }

    /// Whether a valued node's children form a nested subtrie (true for
    /// fixed key length tries) rather than same-trie extensions.
    fn nested_leaves(&self) -> bool {
        false
    }
}

/// Maps a leaf node to the bytes hashed as its payload. The state trie
/// splices the cached storage root into the account encoding here; the
/// plain policy hashes the stored value as is.
pub trait LeafPayload {
    fn payload(node: &Node) -> Vec<u8>;
}

/// Leaf payload is the stored value; when a nested subtrie hangs under
/// the leaf, its cached root hash is folded in so any change below the
/// leaf changes the leaf's own hash.
pub struct ValuePayload;

impl LeafPayload for ValuePayload {
    fn payload(node: &Node) -> Vec<u8> {
        let value = node.value.as_deref().unwrap_or(&[]);
        if node.number_of_children() == 0 {
            return value.to_vec();
        }
        let mut s = RlpStream::new_list(2);
        s.append(&value.to_vec());
        s.append(&node.data.to_vec());
        s.out().to_vec()
    }
}

/// Merkle computation for fixed key length tries (state, storage): every
/// key has the same depth, so values only ever live in leaves and a leaf
/// with children is the root of a nested subtrie.
pub struct MerkleCompute<L: LeafPayload = ValuePayload> {
    _marker: std::marker::PhantomData<L>,
}

impl<L: LeafPayload> MerkleCompute<L> {
    pub fn new() -> Self {
        MerkleCompute {
            _marker: std::marker::PhantomData,
        }
    }
}

impl<L: LeafPayload> Default for MerkleCompute<L> {
    fn default() -> Self {
        Self::new()
    }
}

impl<L: LeafPayload> Compute for MerkleCompute<L> {
    fn compute_data(
        &mut self,
        children: &[ChildData],
        mask: u16,
        _path: &Nibbles,
        value: Option<&[u8]>,
    ) -> Vec<u8> {
        if value.is_none() || mask == 0 {
            return Vec::new();
        }
        // The node roots a nested subtrie; cache that subtrie's root hash.
        let reference = if mask.count_ones() == 1 {
            let child = children
                .iter()
                .find(|c| c.is_valid())
                .expect("mask has one bit, one staged child");
            match &child.node {
                Some(node) => {
                    let second = if node.has_value() {
                        L::payload(node)
                    } else {
                        self.compute_branch(node)
                    };
                    encode_two_pieces(
                        &node.path.prepend(child.branch),
                        &second,
                        node.has_value(),
                    )
                }
                // Child evicted already: its reference stands in for the
                // hoisted encoding.
                None => child.data.clone(),
            }
        } else {
            to_node_reference(&encode_branch_items(&refs_of_children(children), None))
        };
        if reference.len() < KECCAK256_SIZE {
            keccak(&reference).as_bytes().to_vec()
        } else {
            reference
        }
    }

    fn compute_branch(&mut self, node: &Node) -> Vec<u8> {
        debug_assert!(node.number_of_children() > 0);
        to_node_reference(&encode_branch_items(&refs_of_node(node), None))
    }

    fn compute(&mut self, node: &Node) -> Vec<u8> {
        if node.has_value() {
            return encode_two_pieces(&node.path, &L::payload(node), true);
        }
        debug_assert!(node.number_of_children() > 1);
        if node.has_path() {
            let reference = self.compute_branch(node);
            return encode_two_pieces(&node.path, &reference, false);
        }
        self.compute_branch(node)
    }

    fn nested_leaves(&self) -> bool {
        true
    }
}

/// Processes leaf bytes before they are hashed, e.g. stripping an
/// envelope. The default passes them through.
pub trait LeafProcessor {
    fn process(value: &[u8]) -> Vec<u8> {
        value.to_vec()
    }
}

/// Pass-through leaf processor.
pub struct NoopProcessor;

impl LeafProcessor for NoopProcessor {}

/// Merkle computation for variable key length tries (receipts,
/// transactions): a key may end at an interior node, so branch nodes
/// carry values and a node with both path and children encodes as an
/// extension wrapping a value-bearing branch.
pub struct VarLenMerkleCompute<P: LeafProcessor = NoopProcessor> {
    _marker: std::marker::PhantomData<P>,
}

impl<P: LeafProcessor> VarLenMerkleCompute<P> {
    pub fn new() -> Self {
        VarLenMerkleCompute {
            _marker: std::marker::PhantomData,
        }
    }

    fn branch_reference(
        &self,
        refs: &[Option<&[u8]>; 16],
        value: Option<&[u8]>,
    ) -> Vec<u8> {
        let processed = value.map(P::process);
        to_node_reference(&encode_branch_items(refs, processed.as_deref()))
    }
}

impl<P: LeafProcessor> Default for VarLenMerkleCompute<P> {
    fn default() -> Self {
        Self::new()
    }
}

impl<P: LeafProcessor> Compute for VarLenMerkleCompute<P> {
    fn compute_data(
        &mut self,
        children: &[ChildData],
        mask: u16,
        path: &Nibbles,
        value: Option<&[u8]>,
    ) -> Vec<u8> {
        if mask == 0 || path.is_empty() {
            // Nothing cached: leaves have no branch part, and a pathless
            // branch is encoded directly by `compute`.
            return Vec::new();
        }
        self.branch_reference(&refs_of_children(children), value)
    }

    fn compute_branch(&mut self, node: &Node) -> Vec<u8> {
        debug_assert!(node.number_of_children() > 0);
        if !node.data.is_empty() {
            return node.data.clone();
        }
        self.branch_reference(&refs_of_node(node), node.value.as_deref())
    }

    fn compute(&mut self, node: &Node) -> Vec<u8> {
        if node.number_of_children() == 0 {
            debug_assert!(node.has_value());
            return encode_two_pieces(&node.path, &P::process(node.value.as_deref().unwrap_or(&[])), true);
        }
        if node.has_path() {
            // Extension wrapping the (possibly value-bearing) branch whose
            // reference was cached at build time.
            let reference = self.compute_branch(node);
            return encode_two_pieces(&node.path, &reference, false);
        }
        self.compute_branch(node)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_trie_root_matches_published_constant() {
        assert_eq!(
            format!("{:x}", empty_trie_root()),
            "56e81f171bcc55a6ff8345e692c0f86e5b48e01b996cadc001622fb5e363b421"
        );
    }

    #[test]
    fn small_nodes_are_inlined() {
        // rlp([hp([5], leaf), "coin"]) is 7 bytes, so the reference is the
        // encoding itself.
        let reference = encode_two_pieces(&Nibbles::from_nibbles(&[5]), b"coin", true);
        assert_eq!(reference, vec![0xc6, 0x35, 0x84, b'c', b'o', b'i', b'n']);
    }

    #[test]
    fn large_nodes_hash_to_32_bytes() {
        let value = vec![0xee; 64];
        let reference = encode_two_pieces(&Nibbles::from_nibbles(&[1, 2]), &value, true);
        assert_eq!(reference.len(), KECCAK256_SIZE);
    }
}
