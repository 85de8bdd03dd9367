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

//! Sender/receiver async i/o over a kernel submission/completion ring.
//!
//! The scheduling model is single-threaded cooperative: every operation
//! except the threadsafe kind must be initiated and completed on the
//! engine's owning thread. A sender describes the i/o to perform, a
//! receiver is invoked with the typed result when the kernel reaps the
//! completion. Connecting the two produces an operation state owned by the
//! engine between submission and completion; the token returned by
//! initiation is the only legal way to name it until then.

#[macro_use]
extern crate log;

use std::{fmt, io};

mod buffer;
mod engine;
mod operation;
mod senders;

pub use buffer::{BufferPool, ReadBuffer, WriteBuffer};
pub use engine::{AsyncIo, Initiated, RingConfig, Stats, ThreadsafeHandle};
pub use operation::{
    connect, AnySender, CompletionAction, FailedInitiation, OpKind, OpResult, Operation, Receiver,
};
pub use senders::{
    ReadScatterSender, ReadSingleBufferSender, ThreadsafeSender, TimeoutSender, WriteSender,
};

/// I/O priority of an individual operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Priority {
    Normal,
    /// Translated to the OS real-time i/o priority class; requires the
    /// process to hold the corresponding capability.
    Highest,
}

impl Priority {
    pub(crate) fn to_ioprio(self) -> u16 {
        match self {
            // IOPRIO_PRIO_VALUE(IOPRIO_CLASS_RT, 0)
            Priority::Highest => 1 << 13,
            Priority::Normal => 0,
        }
    }
}

/// Async i/o errors. Back-pressure kinds are non-fatal; callers retry later
/// or compose with a queue.
#[derive(Debug)]
pub enum Error {
    /// IO error
    Io(io::Error),
    /// The fixed pool of direct-i/o read buffers is exhausted.
    BufferPoolExhausted,
    /// The configured cap on concurrent read operations was reached and
    /// internal queueing was declined.
    ConcurrentReadLimitReached,
    /// The operation was cancelled before it fired.
    Cancelled,
    /// Fewer bytes transferred than requested.
    ShortTransfer { expected: usize, got: usize },
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            Error::Io(ref err) => write!(f, "{err}"),
            Error::BufferPoolExhausted => write!(f, "read buffer pool exhausted"),
            Error::ConcurrentReadLimitReached => {
                write!(f, "concurrent read i/o limit reached")
            }
            Error::Cancelled => write!(f, "operation cancelled"),
            Error::ShortTransfer { expected, got } => {
                write!(f, "short transfer: {got} of {expected} bytes")
            }
        }
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error::Io(err)
    }
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

pub(crate) fn os_error(raw: i32) -> Error {
    Error::Io(io::Error::from_raw_os_error(raw))
}
