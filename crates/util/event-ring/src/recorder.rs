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

//! Multi-producer event recorder.
//!
//! Producers never block and never contend on a lock: the sequence number
//! and the payload byte range are claimed with independent fetch-adds, the
//! slot's stale sequence number is zeroed with a release store so readers
//! can detect the invalidation, and the filled descriptor is published by
//! a release store of the new sequence number.

use std::sync::atomic::Ordering;

use crate::{
    epoch_nanos, ring::RingControl, round_up, EventDescriptor, EventRing, INLINE_PAYLOAD_MAX,
    WINDOW_INCR,
};

/// Records events into a writable mapped ring. Cheap to clone per thread;
/// all clones share the ring's control words.
pub struct EventRecorder<'ring> {
    ring: &'ring EventRing,
    desc_capacity_mask: u64,
    payload_buf_mask: u64,
}

// All shared mutation is atomic or bracketed by the seqno protocol.
unsafe impl Send for EventRecorder<'_> {}
unsafe impl Sync for EventRecorder<'_> {}

impl<'ring> EventRecorder<'ring> {
    pub(crate) fn new(ring: &'ring EventRing) -> EventRecorder<'ring> {
        EventRecorder {
            ring,
            desc_capacity_mask: ring.size().descriptor_capacity - 1,
            payload_buf_mask: ring.size().payload_buf_size - 1,
        }
    }

    fn control(&self) -> &RingControl {
        self.ring.control()
    }

    /// Reserves a slot and payload space for an event of `payload_size`
    /// bytes. Returns the sequence number, the slot pointer and the
    /// destination to copy the payload to.
    fn reserve(&self, payload_size: usize) -> (u64, *mut EventDescriptor, *mut u8) {
        let control = self.control();
        let store_inline = payload_size <= INLINE_PAYLOAD_MAX;
        let alloc_size = if store_inline {
            0
        } else {
            round_up(payload_size as u64, 8)
        };
        let last_seqno = control.last_seqno.fetch_add(1, Ordering::Relaxed);
        let payload_begin = control.next_payload_byte.fetch_add(alloc_size, Ordering::Relaxed);

        // Zero the slot's sequence number first: the slot may hold an
        // older event a reader is inspecting right now, and the zero is
        // what lets it detect the fields went invalid.
        let slot = unsafe {
            self.ring
                .descriptors()
                .add((last_seqno & self.desc_capacity_mask) as usize)
        };
        let seq_atomic =
            unsafe { &*(slot as *const EventDescriptor as *const std::sync::atomic::AtomicU64) };
        seq_atomic.store(0, Ordering::Release);

        let payload_end = payload_begin + alloc_size;
        let buffer_window_start = control.buffer_window_start.load(Ordering::Relaxed);
        if payload_end - buffer_window_start > self.payload_buf_mask + 1 - WINDOW_INCR {
            // Slide the window forward by the payload size rounded up to
            // WINDOW_INCR; a racing slide by another producer is fine, the
            // compare-exchange simply yields.
            let _ = control.buffer_window_start.compare_exchange(
                buffer_window_start,
                buffer_window_start + round_up(payload_size as u64, WINDOW_INCR),
                Ordering::Relaxed,
                Ordering::Relaxed,
            );
        }

        let seqno = last_seqno + 1;
        unsafe {
            (*slot).payload_size = payload_size as u32;
            (*slot).inline_payload = store_inline as u16;
            let dst = if store_inline {
                (*slot).payload.as_mut_ptr()
            } else {
                (*slot).payload_buf_offset = payload_begin;
                self.ring
                    .payload_base()
                    .add((payload_begin & self.payload_buf_mask) as usize)
            };
            (seqno, slot, dst)
        }
    }

    /// Records one event. Returns the sequence number it was published
    /// under.
    ///
    /// Payloads larger than `payload_buf_size - 2 * WINDOW_INCR` are born
    /// expired: the descriptor commits but `payload_check` will fail for
    /// every reader.
    pub fn record(&self, event_type: u16, payload: &[u8]) -> u64 {
        assert!(
            payload.len() as u64 <= self.payload_buf_mask + 1,
            "payload cannot exceed the payload buffer"
        );
        let nanos = epoch_nanos();
        let (seqno, slot, dst) = self.reserve(payload.len());
        unsafe {
            std::ptr::copy_nonoverlapping(payload.as_ptr(), dst, payload.len());
            (*slot).event_type = event_type;
            (*slot).epoch_nanos = nanos;
            let seq_atomic =
                &*(slot as *const EventDescriptor as *const std::sync::atomic::AtomicU64);
            seq_atomic.store(seqno, Ordering::Release);
        }
        seqno
    }

    /// Vectored variant of `record`: gathers `slices` into one payload.
    pub fn record_slices(&self, event_type: u16, slices: &[&[u8]]) -> u64 {
        let payload_size: usize = slices.iter().map(|s| s.len()).sum();
        assert!(
            payload_size as u64 <= self.payload_buf_mask + 1,
            "payload cannot exceed the payload buffer"
        );
        let nanos = epoch_nanos();
        let (seqno, slot, mut dst) = self.reserve(payload_size);
        unsafe {
            for s in slices {
                std::ptr::copy_nonoverlapping(s.as_ptr(), dst, s.len());
                dst = dst.add(s.len());
            }
            (*slot).event_type = event_type;
            (*slot).epoch_nanos = nanos;
            let seq_atomic =
                &*(slot as *const EventDescriptor as *const std::sync::atomic::AtomicU64);
            seq_atomic.store(seqno, Ordering::Release);
        }
        seqno
    }
}
