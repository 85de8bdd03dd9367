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

//! Statecore: the state storage and i/o substrate of a high-throughput
//! blockchain execution node.
//!
//! Four subsystems make up the substrate:
//!
//! - [`storage_pool`]: a chunk-oriented block-storage abstraction over raw
//!   partitions, files or zoned devices, exposing uniform conventional and
//!   sequential-write zones.
//! - [`storage_aio`]: a sender/receiver async i/o engine over a kernel
//!   submission/completion ring with registered direct-i/o buffers.
//! - [`triedb`]: a versioned copy-on-write Merkle-Patricia trie database
//!   persisted to the pool, with a two-generation chunk allocator,
//!   compaction, and crash recovery.
//! - [`event_ring`]: a lock-free shared-memory ring publishing execution
//!   events to out-of-process readers.

pub use event_ring;
pub use storage_aio;
pub use storage_pool;
pub use triedb;

pub use ethereum_types::H256;
