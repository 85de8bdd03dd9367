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

//! The i/o engine: a submission/completion ring, the registered buffer
//! pool, and the per-thread mailbox of deferred initiations.

use std::{
    cell::{Cell, RefCell, UnsafeCell},
    collections::{HashMap, VecDeque},
    os::unix::io::RawFd,
    thread::{self, ThreadId},
};

use crossbeam_channel::{Receiver as MailReceiver, Sender as MailSender};
use io_uring::{opcode, types, IoUring};

use crate::{
    operation::{FailedInitiation, OpKind, OpResult, Operation, Prepared},
    senders::raw_result,
    BufferPool, CompletionAction, Error, Result,
};

const EVENTFD_TOKEN: u64 = u64::MAX;
const CANCEL_TOKEN: u64 = u64::MAX - 1;

type Mail = Box<dyn FnOnce(&AsyncIo) + Send + 'static>;

/// Ring construction options.
#[derive(Debug, Clone)]
pub struct RingConfig {
    /// Submission queue depth.
    pub entries: u32,
    /// Number of direct-i/o buffers in the registered pool.
    pub read_buffers: usize,
    /// Size of each pool buffer; must be a page multiple.
    pub buffer_size: usize,
    /// Cap on reads submitted to the kernel at once; reads beyond the cap
    /// are queued until a read completes.
    pub concurrent_read_io_limit: usize,
    /// Pin a kernel submission-polling thread to this CPU instead of
    /// entering the kernel per submit.
    pub sq_thread_cpu: Option<u32>,
    /// Busy-poll completions instead of relying on interrupts; needs
    /// storage opened with direct i/o.
    pub enable_io_polling: bool,
}

impl Default for RingConfig {
    fn default() -> Self {
        RingConfig {
            entries: 256,
            read_buffers: 64,
            buffer_size: 128 * 1024,
            concurrent_read_io_limit: 64,
            sq_thread_cpu: None,
            enable_io_polling: false,
        }
    }
}

/// Counters exposed for tests and monitoring.
#[derive(Debug, Clone, Copy, Default)]
pub struct Stats {
    pub reads_initiated: u64,
    pub writes_initiated: u64,
    pub completions: u64,
    pub deferred_initiations: u64,
    pub immediate_completions: u64,
    pub max_recursion_depth: u32,
}

/// Outcome of initiating an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Initiated {
    /// Submitted to the kernel; the token names the operation until its
    /// completion is delivered.
    Submitted(u64),
    /// Parked on the pending-initiations queue because a completion
    /// handler is running; submitted once the outermost handler returns.
    Deferred,
    /// Parked behind the concurrent read i/o limit.
    Queued,
    /// Completed at initiation; the receiver has already run.
    CompletedImmediately,
}

/// The async i/o engine. Single-threaded cooperative: not `Send`, and all
/// calls must come from the thread that created it. `ThreadsafeHandle` is
/// the one cross-thread entry point.
pub struct AsyncIo {
    ring: RefCell<IoUring>,
    buffers: BufferPool,
    buffers_registered: bool,
    ops: RefCell<HashMap<u64, Box<Operation>>>,
    next_token: Cell<u64>,
    inflight: Cell<usize>,
    read_inflight: Cell<usize>,
    concurrent_read_limit: usize,
    pending: RefCell<VecDeque<Box<Operation>>>,
    queued_reads: RefCell<VecDeque<Box<Operation>>>,
    depth: Cell<u32>,
    stats: RefCell<Stats>,
    owner: ThreadId,
    mail_rx: MailReceiver<Mail>,
    mail_tx: MailSender<Mail>,
    eventfd: RawFd,
    event_buf: Box<UnsafeCell<[u8; 8]>>,
    eventfd_armed: Cell<bool>,
}

impl AsyncIo {
    /// Builds an engine with the given ring configuration.
    pub fn new(config: RingConfig) -> Result<AsyncIo> {
        let mut builder = IoUring::builder();
        if let Some(cpu) = config.sq_thread_cpu {
            builder.setup_sqpoll(1000).setup_sqpoll_cpu(cpu);
        }
        if config.enable_io_polling {
            builder.setup_iopoll();
        }
        let ring = builder.build(config.entries).map_err(Error::Io)?;
        let buffers = BufferPool::new(config.read_buffers, config.buffer_size)?;
        let buffers_registered = {
            let iovecs = buffers.iovecs();
            match unsafe { ring.submitter().register_buffers(&iovecs) } {
                Ok(()) => true,
                Err(err) => {
                    warn!(target: "aio", "buffer registration failed, using plain reads: {err}");
                    false
                }
            }
        };
        let eventfd = unsafe { libc::eventfd(0, libc::EFD_CLOEXEC | libc::EFD_NONBLOCK) };
        if eventfd == -1 {
            return Err(Error::Io(std::io::Error::last_os_error()));
        }
        let (mail_tx, mail_rx) = crossbeam_channel::unbounded();
        Ok(AsyncIo {
            ring: RefCell::new(ring),
            buffers,
            buffers_registered,
            ops: RefCell::new(HashMap::new()),
            next_token: Cell::new(1),
            inflight: Cell::new(0),
            read_inflight: Cell::new(0),
            concurrent_read_limit: config.concurrent_read_io_limit,
            pending: RefCell::new(VecDeque::new()),
            queued_reads: RefCell::new(VecDeque::new()),
            depth: Cell::new(0),
            stats: RefCell::new(Stats::default()),
            owner: thread::current().id(),
            mail_rx,
            mail_tx,
            eventfd,
            event_buf: Box::new(UnsafeCell::new([0u8; 8])),
            eventfd_armed: Cell::new(false),
        })
    }

    fn assert_owner(&self) {
        assert_eq!(
            thread::current().id(),
            self.owner,
            "operation initiated off the engine's owning thread"
        );
    }

    /// The engine's buffer pool.
    pub fn buffers(&self) -> &BufferPool {
        &self.buffers
    }

    pub(crate) fn buffers_registered(&self) -> bool {
        self.buffers_registered
    }

    /// Number of operations between submission and completion.
    pub fn inflight(&self) -> usize {
        self.inflight.get()
    }

    /// Copy of the engine counters.
    pub fn stats(&self) -> Stats {
        *self.stats.borrow()
    }

    /// A cloneable, `Send` handle posting closures to run on the owning
    /// thread; the engine is woken through an eventfd if it is blocked in
    /// `poll_blocking`.
    pub fn threadsafe_handle(&self) -> ThreadsafeHandle {
        let fd = unsafe { libc::dup(self.eventfd) };
        assert!(fd != -1, "eventfd dup failed");
        ThreadsafeHandle {
            tx: self.mail_tx.clone(),
            eventfd: fd,
        }
    }

    /// Initiates a connected operation.
    ///
    /// Inside a completion handler every kind except writes is deferred to
    /// the pending queue, which the engine drains iteratively once the
    /// outermost handler returns; this bounds stack growth no matter how
    /// many operations a receiver spawns.
    pub fn initiate(
        &self,
        op: Box<Operation>,
    ) -> std::result::Result<Initiated, FailedInitiation> {
        self.assert_owner();
        if self.depth.get() > 0 && op.kind().may_defer() {
            self.stats.borrow_mut().deferred_initiations += 1;
            self.pending.borrow_mut().push_back(op);
            return Ok(Initiated::Deferred);
        }
        if matches!(op.kind(), OpKind::Read | OpKind::ReadScatter)
            && self.read_inflight.get() >= self.concurrent_read_limit
        {
            self.queued_reads.borrow_mut().push_back(op);
            return Ok(Initiated::Queued);
        }
        self.submit_op(op)
    }

    fn submit_op(
        &self,
        mut op: Box<Operation>,
    ) -> std::result::Result<Initiated, FailedInitiation> {
        op.executing = true;
        let prepared = match op.sender.prepare(self) {
            Ok(p) => p,
            Err(error) => {
                op.executing = false;
                return Err(FailedInitiation {
                    error,
                    operation: op,
                });
            }
        };
        match prepared {
            Prepared::Immediate(res) => {
                op.executing = false;
                self.stats.borrow_mut().immediate_completions += 1;
                self.deliver(op, res);
                Ok(Initiated::CompletedImmediately)
            }
            Prepared::Entry(entry) => {
                let token = self.next_token.get();
                self.next_token.set(token + 1);
                let kind = op.kind();
                if let Err(error) = self.push_entry(entry.user_data(token)) {
                    op.executing = false;
                    return Err(FailedInitiation {
                        error,
                        operation: op,
                    });
                }
                self.ops.borrow_mut().insert(token, op);
                self.inflight.set(self.inflight.get() + 1);
                let mut stats = self.stats.borrow_mut();
                match kind {
                    OpKind::Read | OpKind::ReadScatter => {
                        self.read_inflight.set(self.read_inflight.get() + 1);
                        stats.reads_initiated += 1;
                    }
                    OpKind::Write => stats.writes_initiated += 1,
                    _ => (),
                }
                Ok(Initiated::Submitted(token))
            }
        }
    }

    fn push_entry(&self, entry: io_uring::squeue::Entry) -> Result<()> {
        let mut ring = self.ring.borrow_mut();
        loop {
            {
                let mut sq = ring.submission();
                if unsafe { sq.push(&entry) }.is_ok() {
                    return Ok(());
                }
            }
            // Submission queue full; flush to the kernel to make room.
            ring.submit().map_err(Error::Io)?;
        }
    }

    /// Cancels an in-flight operation by token. Only timeouts are
    /// reliably cancellable; i/o already submitted to the kernel runs to
    /// completion and the receiver sees its result regardless.
    pub fn cancel(&self, token: u64) -> Result<()> {
        self.assert_owner();
        self.push_entry(
            opcode::AsyncCancel::new(token)
                .build()
                .user_data(CANCEL_TOKEN),
        )
    }

    /// Blocks until at least one completion is available, then delivers up
    /// to `max` completions. Returns the number delivered.
    pub fn poll_blocking(&self, max: usize) -> Result<usize> {
        self.assert_owner();
        self.ensure_eventfd_armed()?;
        {
            let ring = self.ring.borrow_mut();
            ring.submit_and_wait(1).map_err(Error::Io)?;
        }
        Ok(self.reap(max))
    }

    /// Delivers up to `max` already reaped completions without blocking.
    pub fn poll_nonblocking(&self, max: usize) -> Result<usize> {
        self.assert_owner();
        self.ensure_eventfd_armed()?;
        {
            let ring = self.ring.borrow_mut();
            ring.submit().map_err(Error::Io)?;
        }
        Ok(self.reap(max))
    }

    fn event_buf_ptr(&self) -> *mut u8 {
        self.event_buf.get() as *mut u8
    }

    fn ensure_eventfd_armed(&self) -> Result<()> {
        if self.eventfd_armed.get() {
            return Ok(());
        }
        let entry = opcode::Read::new(types::Fd(self.eventfd), self.event_buf_ptr(), 8)
            .build()
            .user_data(EVENTFD_TOKEN);
        self.push_entry(entry)?;
        self.eventfd_armed.set(true);
        Ok(())
    }

    fn reap(&self, max: usize) -> usize {
        let mut done: Vec<(u64, i32)> = Vec::new();
        {
            let mut ring = self.ring.borrow_mut();
            let mut cq = ring.completion();
            cq.sync();
            while done.len() < max {
                match cq.next() {
                    Some(cqe) => done.push((cqe.user_data(), cqe.result())),
                    None => break,
                }
            }
        }
        let count = done.len();
        for (token, res) in done {
            self.complete_one(token, res);
        }
        self.drain_after_completions();
        count
    }

    fn complete_one(&self, token: u64, res: i32) {
        if token == EVENTFD_TOKEN {
            self.eventfd_armed.set(false);
            for mail in self.mail_rx.try_iter().collect::<Vec<_>>() {
                mail(self);
            }
            return;
        }
        if token == CANCEL_TOKEN {
            return;
        }
        let mut op = match self.ops.borrow_mut().remove(&token) {
            Some(op) => op,
            None => {
                warn!(target: "aio", "completion for unknown token {token}");
                return;
            }
        };
        op.executing = false;
        self.inflight.set(self.inflight.get().saturating_sub(1));
        if matches!(op.kind(), OpKind::Read | OpKind::ReadScatter) {
            self.read_inflight.set(self.read_inflight.get().saturating_sub(1));
        }
        self.stats.borrow_mut().completions += 1;
        let result = op.sender.complete(raw_result(res));
        self.deliver(op, result);
    }

    fn deliver(&self, mut op: Box<Operation>, res: OpResult) {
        let depth = self.depth.get() + 1;
        self.depth.set(depth);
        {
            let mut stats = self.stats.borrow_mut();
            if depth > stats.max_recursion_depth {
                stats.max_recursion_depth = depth;
            }
        }
        let action = op.receiver.set_value(self, res);
        self.depth.set(depth - 1);
        match action {
            CompletionAction::Done => (),
            CompletionAction::Reinitiate => self.initiate_or_fail(op),
            CompletionAction::ReplaceSelf(replacement) => self.initiate_or_fail(replacement),
        }
    }

    fn initiate_or_fail(&self, op: Box<Operation>) {
        if let Err(failed) = self.initiate(op) {
            let FailedInitiation {
                error,
                operation: mut op,
            } = failed;
            let res = op.sender.error_result(error);
            self.deliver(op, res);
        }
    }

    /// Drains the pending-initiation queue and refills free read slots.
    /// Runs only at the outermost level, turning would-be recursion into
    /// iteration.
    fn drain_after_completions(&self) {
        if self.depth.get() != 0 {
            return;
        }
        loop {
            while self.read_inflight.get() < self.concurrent_read_limit {
                let op = match self.queued_reads.borrow_mut().pop_front() {
                    Some(op) => op,
                    None => break,
                };
                if let Err(failed) = self.submit_op(op) {
                    let FailedInitiation {
                        error,
                        operation: mut op,
                    } = failed;
                    let res = op.sender.error_result(error);
                    self.deliver(op, res);
                }
            }
            let op = match self.pending.borrow_mut().pop_front() {
                Some(op) => op,
                None => break,
            };
            self.initiate_or_fail(op);
        }
    }
}

impl Drop for AsyncIo {
    fn drop(&mut self) {
        trace!(target: "aio", "engine shutting down, {} ops in flight", self.inflight.get());
        unsafe { libc::close(self.eventfd) };
    }
}

/// Cross-thread entry point into the engine: posts a closure to the
/// owning thread's handoff slot and wakes the engine through an eventfd.
pub struct ThreadsafeHandle {
    tx: MailSender<Mail>,
    eventfd: RawFd,
}

impl ThreadsafeHandle {
    /// Posts `f` to run on the engine's owning thread at its next poll.
    pub fn post<F: FnOnce(&AsyncIo) + Send + 'static>(&self, f: F) {
        // A send error means the engine is gone; the wakeup below is then
        // a no-op write to our duped fd.
        let _ = self.tx.send(Box::new(f));
        let one: u64 = 1;
        unsafe {
            libc::write(
                self.eventfd,
                &one as *const u64 as *const libc::c_void,
                8,
            )
        };
    }
}

impl Clone for ThreadsafeHandle {
    fn clone(&self) -> Self {
        let fd = unsafe { libc::dup(self.eventfd) };
        assert!(fd != -1, "eventfd dup failed");
        ThreadsafeHandle {
            tx: self.tx.clone(),
            eventfd: fd,
        }
    }
}

impl Drop for ThreadsafeHandle {
    fn drop(&mut self) {
        unsafe { libc::close(self.eventfd) };
    }
}
