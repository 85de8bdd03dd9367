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

//! Connected operation states: a sender paired with a receiver.
//!
//! An operation is immovable between submission and completion: the engine
//! owns the boxed state and the initiation token is the only legal name for
//! it. Senders are a closed sum of operation kinds dispatched
//! monomorphically; receivers are arbitrary user objects.

use crate::{
    buffer::{ReadBuffer, WriteBuffer},
    senders::{ReadScatterSender, ReadSingleBufferSender, ThreadsafeSender, TimeoutSender, WriteSender},
    AsyncIo, Error, Result,
};

/// The kind tag of a connected operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpKind {
    Read,
    ReadScatter,
    Write,
    Timeout,
    Threadsafe,
}

impl OpKind {
    /// Writes must never be deferred behind later initiations; everything
    /// else may be parked on the pending queue while a completion handler
    /// is running.
    pub(crate) fn may_defer(self) -> bool {
        self != OpKind::Write
    }
}

/// The typed completion value delivered to a receiver.
pub enum OpResult {
    /// Completion with no interesting value, e.g. a timeout expiry.
    Unit(Result<()>),
    /// Bytes transferred.
    Size(Result<usize>),
    /// A read completed into an engine-supplied buffer.
    ReadBuffer(Result<ReadBuffer>),
    /// A write completed, handing the staged buffer back.
    WriteBuffer(Result<WriteBuffer>),
    /// A scatter read completed into several engine-supplied buffers.
    ScatterBuffers(Result<Vec<ReadBuffer>>),
}

impl OpResult {
    /// Decays any completion value to bytes transferred.
    pub fn into_size(self) -> Result<usize> {
        match self {
            OpResult::Unit(r) => r.map(|_| 0),
            OpResult::Size(r) => r,
            OpResult::ReadBuffer(r) => r.map(|b| b.len()),
            OpResult::WriteBuffer(r) => r.map(|b| b.len()),
            OpResult::ScatterBuffers(r) => r.map(|bufs| bufs.iter().map(|b| b.len()).sum()),
        }
    }

    /// Decays any completion value to success or failure.
    pub fn into_unit(self) -> Result<()> {
        self.into_size().map(|_| ())
    }

    /// Extracts the filled read buffer; panics on a mismatched kind, which
    /// is a programming error in the sender/receiver pairing.
    pub fn into_read_buffer(self) -> Result<ReadBuffer> {
        match self {
            OpResult::ReadBuffer(r) => r,
            _ => panic!("receiver expected a filled read buffer"),
        }
    }

    /// Extracts the written buffer; panics on a mismatched kind.
    pub fn into_write_buffer(self) -> Result<WriteBuffer> {
        match self {
            OpResult::WriteBuffer(r) => r,
            _ => panic!("receiver expected a filled write buffer"),
        }
    }

    /// Extracts the scatter buffers; panics on a mismatched kind.
    pub fn into_scatter_buffers(self) -> Result<Vec<ReadBuffer>> {
        match self {
            OpResult::ScatterBuffers(r) => r,
            _ => panic!("receiver expected scatter read buffers"),
        }
    }
}

/// What the engine should do with the operation state after the receiver
/// has run.
pub enum CompletionAction {
    /// Release the operation state.
    Done,
    /// Re-launder the state and initiate it again.
    Reinitiate,
    /// Release the state and initiate this replacement instead.
    ReplaceSelf(Box<Operation>),
}

/// An object whose `set_value` is called upon operation completion, on the
/// engine's owning thread.
pub trait Receiver: 'static {
    fn set_value(&mut self, io: &AsyncIo, res: OpResult) -> CompletionAction;
}

impl<F> Receiver for F
where
    F: FnMut(&AsyncIo, OpResult) -> CompletionAction + 'static,
{
    fn set_value(&mut self, io: &AsyncIo, res: OpResult) -> CompletionAction {
        self(io, res)
    }
}

/// The closed sum of sender kinds the engine understands.
pub enum AnySender {
    Read(ReadSingleBufferSender),
    ReadScatter(ReadScatterSender),
    Write(WriteSender),
    Timeout(TimeoutSender),
    Threadsafe(ThreadsafeSender),
}

/// What a sender produced at submission time.
pub(crate) enum Prepared {
    /// A submission queue entry to push to the ring.
    Entry(io_uring::squeue::Entry),
    /// The operation completed at initiation; the receiver runs
    /// synchronously.
    Immediate(OpResult),
}

impl AnySender {
    pub(crate) fn kind(&self) -> OpKind {
        match self {
            AnySender::Read(_) => OpKind::Read,
            AnySender::ReadScatter(_) => OpKind::ReadScatter,
            AnySender::Write(_) => OpKind::Write,
            AnySender::Timeout(_) => OpKind::Timeout,
            AnySender::Threadsafe(_) => OpKind::Threadsafe,
        }
    }

    pub(crate) fn prepare(&mut self, io: &AsyncIo) -> Result<Prepared> {
        match self {
            AnySender::Read(s) => s.prepare(io),
            AnySender::ReadScatter(s) => s.prepare(io),
            AnySender::Write(s) => s.prepare(io),
            AnySender::Timeout(s) => s.prepare(),
            AnySender::Threadsafe(s) => s.prepare(),
        }
    }

    /// Transforms the raw kernel completion into the sender's natural
    /// result type.
    pub(crate) fn complete(&mut self, raw: Result<usize>) -> OpResult {
        match self {
            AnySender::Read(s) => s.complete(raw),
            AnySender::ReadScatter(s) => s.complete(raw),
            AnySender::Write(s) => s.complete(raw),
            AnySender::Timeout(s) => s.complete(raw),
            AnySender::Threadsafe(s) => s.complete(raw),
        }
    }

    /// Produces a failed result of the sender's natural type, for errors
    /// detected before the kernel was involved.
    pub(crate) fn error_result(&mut self, err: Error) -> OpResult {
        match self {
            AnySender::Read(_) => OpResult::ReadBuffer(Err(err)),
            AnySender::ReadScatter(_) => OpResult::ScatterBuffers(Err(err)),
            AnySender::Write(_) => OpResult::WriteBuffer(Err(err)),
            AnySender::Timeout(_) => OpResult::Unit(Err(err)),
            AnySender::Threadsafe(_) => OpResult::Unit(Err(err)),
        }
    }
}

/// The immovable state pairing a sender with a receiver.
pub struct Operation {
    pub(crate) sender: AnySender,
    pub(crate) receiver: Box<dyn Receiver>,
    pub(crate) executing: bool,
}

impl Operation {
    /// The kind tag of this operation.
    pub fn kind(&self) -> OpKind {
        self.sender.kind()
    }

    /// Whether the operation is currently between submission and
    /// completion.
    pub fn is_executing(&self) -> bool {
        self.executing
    }
}

/// Connects a sender and a receiver into an operation state ready for
/// initiation.
pub fn connect<R: Receiver>(sender: AnySender, receiver: R) -> Box<Operation> {
    Box::new(Operation {
        sender,
        receiver: Box::new(receiver),
        executing: false,
    })
}

/// An initiation that could not be carried out; the operation state is
/// handed back so the caller can retry later.
pub struct FailedInitiation {
    pub error: Error,
    pub operation: Box<Operation>,
}

impl std::fmt::Debug for FailedInitiation {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "FailedInitiation({:?})", self.error)
    }
}
