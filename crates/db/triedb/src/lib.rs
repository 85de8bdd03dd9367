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

//! Versioned, copy-on-write Merkle-Patricia trie database persisted to
//! the chunked storage pool.
//!
//! The trie is persistent: an update takes the current root plus an
//! ordered batch of keyed changes and produces a new root, sharing every
//! untouched subtrie by on-disk offset. Node bytes append to sequential
//! chunks managed by a two-generation (fast/slow) allocator; advancing the
//! committed root offset in the metadata record is the single
//! linearization point of a batch.

#[macro_use]
extern crate log;

use std::{fmt, io};

mod compact;
pub mod compute;
mod db;
mod io_layer;
mod meta;
pub mod nibbles;
pub mod node;
mod update;

pub use compact::CompactionStats;
pub use compute::{
    empty_trie_root, Compute, LeafPayload, LeafProcessor, MerkleCompute, NoopProcessor,
    ValuePayload, VarLenMerkleCompute,
};
pub use db::{Db, DbOptions, StateDb, VarLenDb};
pub use meta::{DbOffsets, ListKind};
pub use nibbles::Nibbles;
pub use node::ChunkOffset;

/// How deep in-memory node pointers are retained after their bytes become
/// durable; below the threshold only the on-disk offset is kept.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheDepth {
    /// Cache the whole trie in memory.
    All,
    /// Cache nodes fewer than this many nibbles deep.
    AboveDepth(u8),
}

impl CacheDepth {
    pub(crate) fn keep(self, depth: usize) -> bool {
        match self {
            CacheDepth::All => true,
            CacheDepth::AboveDepth(limit) => depth < limit as usize,
        }
    }
}

/// One keyed change in an update batch.
#[derive(Debug, Clone, Default)]
pub struct Update {
    /// Key path in nibbles.
    pub key: Nibbles,
    /// New value, or `None` for a tombstone.
    pub value: Option<Vec<u8>>,
    /// Discard any existing nested subtrie under the key before applying
    /// `nested`.
    pub incarnation: bool,
    /// Changes to the subtrie hanging under this key's leaf.
    pub nested: Vec<Update>,
}

impl Update {
    pub fn put(key: Nibbles, value: Vec<u8>) -> Update {
        Update {
            key,
            value: Some(value),
            incarnation: false,
            nested: Vec::new(),
        }
    }

    pub fn tombstone(key: Nibbles) -> Update {
        Update {
            key,
            value: None,
            incarnation: false,
            nested: Vec::new(),
        }
    }
}

/// Trie database errors.
#[derive(Debug)]
pub enum Error {
    /// IO error
    Io(io::Error),
    /// Storage pool error
    Pool(storage_pool::Error),
    /// Async i/o error
    Aio(storage_aio::Error),
    /// A node record failed to parse.
    CorruptNode,
    /// The metadata record carries the wrong magic.
    BadMetaMagic,
    /// The database was not closed cleanly and `allow_dirty` is not set.
    DirtyState,
    /// The free list ran out of chunks.
    OutOfSpace,
    /// A value exceeds what a leaf node can hold.
    ValueTooLarge { len: usize, max: usize },
    /// The database was opened read-only.
    ReadOnly,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            Error::Io(ref err) => write!(f, "{err}"),
            Error::Pool(ref err) => write!(f, "{err}"),
            Error::Aio(ref err) => write!(f, "{err}"),
            Error::CorruptNode => write!(f, "corrupt trie node record"),
            Error::BadMetaMagic => write!(f, "database metadata magic mismatch"),
            Error::DirtyState => {
                write!(f, "database was not closed cleanly; pass allow_dirty to recover")
            }
            Error::OutOfSpace => write!(f, "no free chunks left in the pool"),
            Error::ValueTooLarge { len, max } => {
                write!(f, "value of {len} bytes exceeds the {max} byte leaf limit")
            }
            Error::ReadOnly => write!(f, "database is read-only"),
        }
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error::Io(err)
    }
}

impl From<storage_pool::Error> for Error {
    fn from(err: storage_pool::Error) -> Self {
        Error::Pool(err)
    }
}

impl From<storage_aio::Error> for Error {
    fn from(err: storage_aio::Error) -> Self {
        Error::Aio(err)
    }
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

pub(crate) fn errno() -> io::Error {
    io::Error::last_os_error()
}
