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

//! Reader-side iteration over the descriptor array.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::{EventDescriptor, EventRing};

/// Outcome of asking for the next event.
pub enum NextResult {
    /// A consistent copy of the next descriptor.
    Ready(EventDescriptor),
    /// Nothing published past the reader's position yet.
    NotReady,
    /// The reader fell so far behind that its next descriptor was
    /// overwritten; the iterator has been reset to the current end of the
    /// ring.
    Gap,
}

/// A reader's cursor into the ring. Each reader owns one; the ring itself
/// is never mutated by iteration.
pub struct EventIterator<'ring> {
    ring: &'ring EventRing,
    desc_capacity_mask: u64,
    read_last_seqno: u64,
}

impl<'ring> EventIterator<'ring> {
    pub(crate) fn new(ring: &'ring EventRing) -> EventIterator<'ring> {
        let mut iter = EventIterator {
            ring,
            desc_capacity_mask: ring.size().descriptor_capacity - 1,
            read_last_seqno: 0,
        };
        iter.reset();
        iter
    }

    /// The sequence number of the last event this reader consumed.
    pub fn read_last_seqno(&self) -> u64 {
        self.read_last_seqno
    }

    /// Moves the cursor so the next `try_next` yields `seqno`; the value
    /// is only validated when the descriptor is actually read.
    pub fn set_seqno(&mut self, seqno: u64) {
        self.read_last_seqno = seqno.saturating_sub(1);
    }

    /// Resets the cursor to the current end of the ring and returns the
    /// sequence number it now sits after.
    pub fn reset(&mut self) -> u64 {
        self.read_last_seqno = self.ring.last_seqno();
        self.read_last_seqno
    }

    /// Attempts to consume the next event.
    pub fn try_next(&mut self) -> NextResult {
        let produced = self.ring.last_seqno();
        if produced <= self.read_last_seqno {
            return NextResult::NotReady;
        }
        let expected = self.read_last_seqno + 1;
        let slot = unsafe {
            self.ring
                .descriptors()
                .add(((expected - 1) & self.desc_capacity_mask) as usize)
        };
        let seq_atomic = unsafe { &*(slot as *const AtomicU64) };
        let seq = seq_atomic.load(Ordering::Acquire);
        if seq != expected {
            if seq > expected {
                // Overwritten by a newer lap: the reader is too far
                // behind. Reset to the end of the ring.
                self.reset();
                return NextResult::Gap;
            }
            // Zero or an older value: the producer allocated our event but
            // has not published it yet.
            return NextResult::NotReady;
        }
        // A writer may scribble on the slot while we copy; the re-check of
        // the sequence number below rejects a torn copy.
        let copy = unsafe { std::ptr::read_volatile(slot) };
        if seq_atomic.load(Ordering::Acquire) != expected {
            // Invalidated while copying; treat like a gap only if a newer
            // event took the slot, otherwise wait for the republish.
            let now = seq_atomic.load(Ordering::Acquire);
            if now > expected {
                self.reset();
                return NextResult::Gap;
            }
            return NextResult::NotReady;
        }
        self.read_last_seqno = expected;
        NextResult::Ready(copy)
    }

    /// Convenience wrapper over the ring's random-access copy.
    pub fn try_copy(&self, seqno: u64) -> Option<EventDescriptor> {
        self.ring.try_copy(seqno)
    }
}
