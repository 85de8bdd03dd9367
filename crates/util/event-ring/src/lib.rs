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

//! Shared-memory event ring: single producing process, many readers.
//!
//! The ring file is divided into four sections aligned to 2 MiB large-page
//! boundaries: header, descriptor array, payload buffer and context area.
//! The payload buffer is mapped twice back to back so that a payload
//! crossing the end of the buffer can be written and read with plain
//! contiguous addressing. Recorders never block; readers detect loss
//! through descriptor gaps and the sliding payload validity window.

#[macro_use]
extern crate log;

use std::{fmt, io};

mod iter;
mod recorder;
mod ring;

pub use iter::{EventIterator, NextResult};
pub use recorder::EventRecorder;
pub use ring::{create_ring_file, init_ring_file, EventRing, MapMode};

/// Section alignment; also the size of the header section.
pub const PAGE_2MB: u64 = 1 << 21;

/// Minimum unit by which the payload validity window advances.
pub const WINDOW_INCR: u64 = 1 << 24;

/// Version string at the front of every ring file.
pub const HEADER_VERSION: [u8; 8] = *b"evring1\0";

/// Where the test-content ring lives unless `EVENT_RING_FILE` says
/// otherwise.
pub const DEFAULT_TEST_RING_PATH: &str = "/tmp/statecore-events-test.ring";

/// Bytes of payload stored inline in a descriptor.
pub const INLINE_PAYLOAD_MAX: usize = 32;

pub const MIN_DESCRIPTORS_SHIFT: u8 = 12;
pub const MAX_DESCRIPTORS_SHIFT: u8 = 30;
pub const MIN_PAYLOAD_BUF_SHIFT: u8 = 26;
pub const MAX_PAYLOAD_BUF_SHIFT: u8 = 40;

/// What a ring carries; recorded in the header next to the schema hash.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentType {
    None = 0,
    Test = 1,
    Exec = 2,
}

impl ContentType {
    pub fn name(self) -> &'static str {
        CONTENT_TYPE_NAMES[self as usize]
    }

    pub fn from_u16(value: u16) -> Option<ContentType> {
        match value {
            0 => Some(ContentType::None),
            1 => Some(ContentType::Test),
            2 => Some(ContentType::Exec),
            _ => None,
        }
    }
}

pub const CONTENT_TYPE_NAMES: [&str; 3] = ["none", "test", "exec"];

/// A fixed descriptor slot; index in the array is `(seqno - 1) mod
/// capacity`.
#[repr(C, align(64))]
#[derive(Clone, Copy)]
pub struct EventDescriptor {
    pub seqno: u64,
    pub event_type: u16,
    /// Non-zero when the payload lives inline in this record.
    pub inline_payload: u16,
    pub payload_size: u32,
    pub epoch_nanos: u64,
    pub payload_buf_offset: u64,
    pub payload: [u8; INLINE_PAYLOAD_MAX],
}

const _: () = assert!(std::mem::size_of::<EventDescriptor>() == 64);

/// The three sizes fixed at ring creation.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct RingSize {
    pub descriptor_capacity: u64,
    pub payload_buf_size: u64,
    pub context_area_size: u64,
}

impl RingSize {
    /// Validates the shifts and expands them into byte sizes.
    pub fn from_shifts(
        descriptors_shift: u8,
        payload_buf_shift: u8,
        context_large_pages: u16,
    ) -> Result<RingSize> {
        if !(MIN_DESCRIPTORS_SHIFT..=MAX_DESCRIPTORS_SHIFT).contains(&descriptors_shift) {
            return Err(Error::ShiftOutOfRange {
                what: "descriptors_shift",
                shift: descriptors_shift,
                min: MIN_DESCRIPTORS_SHIFT,
                max: MAX_DESCRIPTORS_SHIFT,
            });
        }
        if !(MIN_PAYLOAD_BUF_SHIFT..=MAX_PAYLOAD_BUF_SHIFT).contains(&payload_buf_shift) {
            return Err(Error::ShiftOutOfRange {
                what: "payload_buf_shift",
                shift: payload_buf_shift,
                min: MIN_PAYLOAD_BUF_SHIFT,
                max: MAX_PAYLOAD_BUF_SHIFT,
            });
        }
        Ok(RingSize {
            descriptor_capacity: 1 << descriptors_shift,
            payload_buf_size: 1 << payload_buf_shift,
            context_area_size: PAGE_2MB * context_large_pages as u64,
        })
    }

    /// Total bytes of backing storage the ring needs.
    pub fn storage_bytes(&self) -> u64 {
        PAGE_2MB
            + self.descriptor_capacity * std::mem::size_of::<EventDescriptor>() as u64
            + self.payload_buf_size
            + self.context_area_size
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if !self.descriptor_capacity.is_power_of_two()
            || self.descriptor_capacity < (1 << MIN_DESCRIPTORS_SHIFT)
            || self.descriptor_capacity > (1 << MAX_DESCRIPTORS_SHIFT)
        {
            return Err(Error::InvalidSize("descriptor capacity"));
        }
        if !self.payload_buf_size.is_power_of_two()
            || self.payload_buf_size < (1 << MIN_PAYLOAD_BUF_SHIFT)
            || self.payload_buf_size > (1 << MAX_PAYLOAD_BUF_SHIFT)
        {
            return Err(Error::InvalidSize("payload buffer size"));
        }
        if self.context_area_size > 0 && !self.context_area_size.is_power_of_two() {
            return Err(Error::InvalidSize("context area size"));
        }
        Ok(())
    }
}

/// Event ring errors.
#[derive(Debug)]
pub enum Error {
    /// IO error
    Io(io::Error),
    /// A size shift fell outside its allowed range.
    ShiftOutOfRange {
        what: &'static str,
        shift: u8,
        min: u8,
        max: u8,
    },
    /// A size was not an allowed power of two.
    InvalidSize(&'static str),
    /// The ring file cannot hold the whole ring.
    FileTooSmall { needed: u64, have: u64 },
    /// The file does not carry the current header version string.
    BadMagic,
    /// Unknown content type code in the header.
    InvalidContentType(u16),
    /// The mapping protection does not permit the requested role.
    WrongProtection(&'static str),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            Error::Io(ref err) => write!(f, "{err}"),
            Error::ShiftOutOfRange {
                what,
                shift,
                min,
                max,
            } => write!(f, "{what} {shift} outside allowed range [{min}, {max}]"),
            Error::InvalidSize(what) => write!(f, "invalid {what}"),
            Error::FileTooSmall { needed, have } => {
                write!(f, "ring file of {have} bytes cannot hold ring of {needed} bytes")
            }
            Error::BadMagic => write!(f, "file does not contain the current ring version string"),
            Error::InvalidContentType(code) => write!(f, "invalid content type code {code}"),
            Error::WrongProtection(what) => write!(f, "ring memory not mapped for {what}"),
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

pub(crate) fn round_up(value: u64, align: u64) -> u64 {
    debug_assert!(align.is_power_of_two());
    (value + align - 1) & !(align - 1)
}

pub(crate) fn epoch_nanos() -> u64 {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    unsafe { libc::clock_gettime(libc::CLOCK_REALTIME, &mut ts) };
    ts.tv_sec as u64 * 1_000_000_000 + ts.tv_nsec as u64
}
