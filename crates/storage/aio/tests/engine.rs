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

use std::{
    cell::Cell,
    rc::Rc,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use storage_aio::{
    connect, AnySender, AsyncIo, CompletionAction, ReadSingleBufferSender, RingConfig,
    ThreadsafeSender, TimeoutSender, WriteSender,
};
use storage_pool::{ChunkKind, CreationFlags, StoragePool};

fn small_pool() -> StoragePool {
    StoragePool::anonymous(CreationFlags {
        chunk_capacity_shift: 24,
        ..CreationFlags::default()
    })
    .unwrap()
}

#[test]
fn write_then_read_chunk() {
    let pool = small_pool();
    let io = AsyncIo::new(RingConfig::default()).unwrap();
    let chunk = pool.activate_chunk(ChunkKind::Cnv, 0).unwrap();

    let mut buf = io.buffers().acquire_write().unwrap();
    buf.as_mut_slice()[..8192].fill(0x5a);
    buf.set_len(8192);

    let wrote = Rc::new(Cell::new(false));
    let flag = wrote.clone();
    let sender = WriteSender::append_to_chunk(&chunk, buf).unwrap();
    io.initiate(connect(AnySender::Write(sender), move |_io: &AsyncIo, res| {
        res.into_write_buffer().unwrap();
        flag.set(true);
        CompletionAction::Done
    }))
    .unwrap();
    while !wrote.get() {
        io.poll_blocking(16).unwrap();
    }

    let read_ok = Rc::new(Cell::new(false));
    let flag = read_ok.clone();
    let sender = ReadSingleBufferSender::from_chunk(&chunk, 0, 8192);
    io.initiate(connect(AnySender::Read(sender), move |_io: &AsyncIo, res| {
        let buf = res.into_read_buffer().unwrap();
        assert_eq!(buf.len(), 8192);
        assert!(buf.filled().iter().all(|b| *b == 0x5a));
        flag.set(true);
        CompletionAction::Done
    }))
    .unwrap();
    while !read_ok.get() {
        io.poll_blocking(16).unwrap();
    }

    let stats = io.stats();
    assert_eq!(stats.writes_initiated, 1);
    assert_eq!(stats.reads_initiated, 1);
}

// A timed delay delivers no earlier than the delay and within a scheduling
// slop after it.
#[test]
fn timed_delay_bounds() {
    let io = AsyncIo::new(RingConfig::default()).unwrap();
    let fired = Rc::new(Cell::new(false));
    let flag = fired.clone();
    let started = Instant::now();
    io.initiate(connect(
        AnySender::Timeout(TimeoutSender::relative(Duration::from_millis(50))),
        move |_io: &AsyncIo, res| {
            res.into_unit().unwrap();
            flag.set(true);
            CompletionAction::Done
        },
    ))
    .unwrap();
    while !fired.get() {
        io.poll_blocking(1).unwrap();
    }
    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_millis(50), "fired early: {elapsed:?}");
    assert!(elapsed <= Duration::from_millis(250), "fired late: {elapsed:?}");
}

// Completions whose receivers immediately initiate two more operations
// must not recurse: deferred initiations are drained iteratively, keeping
// the observed handler depth a small constant.
#[test]
fn initiation_storm_stays_shallow() {
    const TOTAL: u32 = 10_000;

    let pool = small_pool();
    let io = Rc::new(
        AsyncIo::new(RingConfig {
            concurrent_read_io_limit: 16,
            read_buffers: 32,
            buffer_size: 4096,
            ..RingConfig::default()
        })
        .unwrap(),
    );
    let chunk = pool.activate_chunk(ChunkKind::Cnv, 0).unwrap();

    let remaining = Rc::new(Cell::new(TOTAL));
    let completed = Rc::new(Cell::new(0u32));

    fn launch(
        io: &AsyncIo,
        chunk: &Arc<storage_pool::Chunk>,
        remaining: &Rc<Cell<u32>>,
        completed: &Rc<Cell<u32>>,
    ) {
        if remaining.get() == 0 {
            return;
        }
        remaining.set(remaining.get() - 1);
        let chunk2 = chunk.clone();
        let rem = remaining.clone();
        let comp = completed.clone();
        let sender = ReadSingleBufferSender::from_chunk(chunk, 0, 4096);
        io.initiate(connect(AnySender::Read(sender), move |io: &AsyncIo, res| {
            res.into_read_buffer().unwrap();
            comp.set(comp.get() + 1);
            launch(io, &chunk2, &rem, &comp);
            launch(io, &chunk2, &rem, &comp);
            CompletionAction::Done
        }))
        .unwrap();
    }

    for _ in 0..4 {
        launch(&io, &chunk, &remaining, &completed);
    }
    while completed.get() < TOTAL {
        io.poll_blocking(64).unwrap();
    }

    let stats = io.stats();
    assert!(stats.completions as u32 >= TOTAL);
    assert!(
        stats.max_recursion_depth < 3,
        "recursion depth {} too deep",
        stats.max_recursion_depth
    );
    assert!(stats.deferred_initiations > 0);
}

#[test]
fn threadsafe_handle_wakes_blocked_engine() {
    let io = AsyncIo::new(RingConfig::default()).unwrap();
    let handle = io.threadsafe_handle();
    let observed = Arc::new(AtomicBool::new(false));

    let flag = observed.clone();
    let poster = std::thread::spawn(move || {
        std::thread::sleep(Duration::from_millis(30));
        handle.post(move |_io: &AsyncIo| {
            flag.store(true, Ordering::SeqCst);
        });
    });

    while !observed.load(Ordering::SeqCst) {
        io.poll_blocking(16).unwrap();
    }
    poster.join().unwrap();
}

#[test]
fn threadsafe_sender_completes_immediately() {
    let io = AsyncIo::new(RingConfig::default()).unwrap();
    let done = Rc::new(Cell::new(false));
    let flag = done.clone();
    let outcome = io
        .initiate(connect(
            AnySender::Threadsafe(ThreadsafeSender::new()),
            move |_io: &AsyncIo, res| {
                res.into_unit().unwrap();
                flag.set(true);
                CompletionAction::Done
            },
        ))
        .unwrap();
    assert_eq!(outcome, storage_aio::Initiated::CompletedImmediately);
    assert!(done.get());
}
