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

use std::fs::File;

use event_ring::{
    create_ring_file, ContentType, EventRing, MapMode, NextResult, RingSize, WINDOW_INCR,
};
use tempdir::TempDir;

const SCHEMA_HASH: [u8; 32] = [0x42; 32];
const MIB: usize = 1024 * 1024;

fn make_ring(dir: &TempDir, descriptors_shift: u8, payload_shift: u8) -> (File, EventRing) {
    let path = dir.path().join("events.ring");
    let size = RingSize::from_shifts(descriptors_shift, payload_shift, 0).unwrap();
    let file = create_ring_file(&path, &size, ContentType::Test, &SCHEMA_HASH).unwrap();
    let ring = EventRing::map(&file, MapMode::ReadWrite, 0).unwrap();
    (file, ring)
}

#[test]
fn header_round_trip_and_read_only_mapping() {
    let dir = TempDir::new("statecore-event-ring").unwrap();
    let (file, ring) = make_ring(&dir, 12, 26);
    assert_eq!(ring.content_type(), ContentType::Test);
    assert_eq!(ring.schema_hash(), &SCHEMA_HASH);
    assert_eq!(ring.size().descriptor_capacity, 1 << 12);
    drop(ring);

    let reader = EventRing::map(&file, MapMode::ReadOnly, 0).unwrap();
    assert_eq!(reader.content_type(), ContentType::Test);
    assert!(reader.recorder().is_err());
}

#[test]
fn inline_payload_round_trip() {
    let dir = TempDir::new("statecore-event-ring").unwrap();
    let (_file, ring) = make_ring(&dir, 12, 26);
    let recorder = ring.recorder().unwrap();
    let mut iter = ring.iterator();

    let seqno = recorder.record(3, b"tiny payload");
    assert_eq!(seqno, 1);
    match iter.try_next() {
        NextResult::Ready(ev) => {
            assert_eq!(ev.seqno, 1);
            assert_eq!(ev.event_type, 3);
            assert_ne!(ev.inline_payload, 0);
            assert_eq!(ring.payload_peek(&ev), b"tiny payload");
            assert!(ring.payload_check(&ev));
        }
        _ => panic!("expected an event"),
    }
    assert!(matches!(iter.try_next(), NextResult::NotReady));
}

// Scenario: several writers, one reader. Sequence numbers observed by the
// reader are strictly monotonic, each writer's own counter sequence
// arrives in order, and every payload passes validation while the reader
// keeps up.
#[test]
fn multi_writer_single_reader_ordering() {
    const WRITERS: u64 = 4;
    const PER_WRITER: u64 = 1 << 14;
    const TOTAL: u64 = WRITERS * PER_WRITER;

    let dir = TempDir::new("statecore-event-ring").unwrap();
    let (_file, ring) = make_ring(&dir, 16, 26);
    let mut iter = ring.iterator();

    std::thread::scope(|scope| {
        for writer in 0..WRITERS {
            let recorder = ring.recorder().unwrap();
            scope.spawn(move || {
                let mut payload = [0u8; 128];
                payload[..8].copy_from_slice(&writer.to_le_bytes());
                for counter in 0..PER_WRITER {
                    payload[8..16].copy_from_slice(&counter.to_le_bytes());
                    recorder.record(7, &payload);
                }
            });
        }

        let mut next_counter = [0u64; WRITERS as usize];
        let mut last_seqno = 0u64;
        let mut seen = 0u64;
        while seen < TOTAL {
            match iter.try_next() {
                NextResult::Ready(ev) => {
                    assert!(ev.seqno > last_seqno, "seqno went backwards");
                    last_seqno = ev.seqno;
                    let payload = ring.payload_peek(&ev);
                    assert_eq!(payload.len(), 128);
                    let writer =
                        u64::from_le_bytes(payload[..8].try_into().unwrap()) as usize;
                    let counter = u64::from_le_bytes(payload[8..16].try_into().unwrap());
                    assert!(ring.payload_check(&ev), "payload expired under the reader");
                    assert_eq!(
                        counter, next_counter[writer],
                        "writer {writer} out of order"
                    );
                    next_counter[writer] += 1;
                    seen += 1;
                }
                NextResult::NotReady => std::hint::spin_loop(),
                NextResult::Gap => {
                    panic!("gap although the descriptor array holds every event")
                }
            }
        }
    });
}

// Scenario: oversized payloads are born expired. With a 64 MiB payload
// buffer, anything bigger than 64 MiB - 2 * WINDOW_INCR commits its
// descriptor but always fails the payload check.
#[test]
fn oversized_payloads_are_born_expired() {
    let dir = TempDir::new("statecore-event-ring").unwrap();
    let (_file, ring) = make_ring(&dir, 12, 26);
    let recorder = ring.recorder().unwrap();
    let buf_size = ring.size().payload_buf_size;
    assert_eq!(buf_size, 64 * MIB as u64);

    let cases: [(usize, bool); 5] = [
        (MIB, true),
        (8 * MIB, true),
        ((buf_size - 2 * WINDOW_INCR) as usize, true),
        ((buf_size - WINDOW_INCR) as usize, false),
        (buf_size as usize, false),
    ];
    for (size, expect_valid) in cases {
        let payload = vec![0x5au8; size];
        let seqno = recorder.record(1, &payload);
        let ev = ring.try_copy(seqno).expect("descriptor must commit");
        assert_eq!(
            ring.payload_check(&ev),
            expect_valid,
            "payload of {size} bytes"
        );
    }
}

// Scenario: a payload written near the end of the buffer crosses the end
// and is still readable verbatim thanks to the wrap-around double mapping.
#[test]
fn payload_wraps_across_buffer_end() {
    let dir = TempDir::new("statecore-event-ring").unwrap();
    let (_file, ring) = make_ring(&dir, 12, 26);
    let recorder = ring.recorder().unwrap();
    let mut iter = ring.iterator();

    // Advance the payload cursor to 56 MiB.
    let filler = vec![0u8; 8 * MIB];
    for _ in 0..7 {
        recorder.record(1, &filler);
    }
    let pattern: Vec<u8> = (0..WINDOW_INCR as usize).map(|i| (i % 251) as u8).collect();
    let seqno = recorder.record(2, &pattern);
    assert_eq!(seqno, 8);

    for _ in 0..7 {
        assert!(matches!(iter.try_next(), NextResult::Ready(_)));
    }
    match iter.try_next() {
        NextResult::Ready(ev) => {
            assert_eq!(ev.event_type, 2);
            // The payload starts 8 MiB before the end of the buffer and
            // wraps around it.
            assert!(ev.payload_buf_offset + WINDOW_INCR > ring.size().payload_buf_size);
            let payload = ring.payload_peek(&ev);
            assert_eq!(payload, &pattern[..]);
            assert!(ring.payload_check(&ev));
        }
        _ => panic!("expected the wrapping event"),
    }
}

// A reader that fell a whole lap behind sees a gap and is reset to the
// current end of the ring.
#[test]
fn lapped_reader_detects_gap() {
    let dir = TempDir::new("statecore-event-ring").unwrap();
    let (_file, ring) = make_ring(&dir, 12, 26);
    let recorder = ring.recorder().unwrap();
    let mut iter = ring.iterator();

    let capacity = ring.size().descriptor_capacity;
    for _ in 0..capacity + 10 {
        recorder.record(1, b"x");
    }
    match iter.try_next() {
        NextResult::Gap => (),
        _ => panic!("expected a gap"),
    }
    assert_eq!(iter.read_last_seqno(), capacity + 10);
    assert!(matches!(iter.try_next(), NextResult::NotReady));
}

#[test]
fn vectored_record_gathers_slices() {
    let dir = TempDir::new("statecore-event-ring").unwrap();
    let (_file, ring) = make_ring(&dir, 12, 26);
    let recorder = ring.recorder().unwrap();
    let mut iter = ring.iterator();

    let big = vec![0xcdu8; 40];
    let seqno = recorder.record_slices(9, &[b"head", &big, b"tail"]);
    assert_eq!(seqno, 1);
    match iter.try_next() {
        NextResult::Ready(ev) => {
            let payload = ring.payload_peek(&ev);
            assert_eq!(&payload[..4], b"head");
            assert_eq!(&payload[4..44], &big[..]);
            assert_eq!(&payload[44..], b"tail");
        }
        _ => panic!("expected an event"),
    }
}
