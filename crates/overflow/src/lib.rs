//! # overflow
//!
//! Turns perf_event overflow notifications into decoded, scaled group
//! samples. A notification names the file descriptor that overflowed; the
//! controller resolves it to the group leader, pulls one record out of the
//! leader's sample buffer, attributes each member value through its unique
//! id, corrects it for multiplexing, reports it, and rearms the group for
//! exactly one more overflow.
//!

pub mod completion;
pub mod controller;
pub mod progress;
pub mod registry;
pub mod sample;
pub mod scaling;

#[cfg(target_os = "linux")]
pub mod counter;
#[cfg(target_os = "linux")]
pub mod relay;
#[cfg(target_os = "linux")]
pub mod session;

pub use completion::task_completion_handler;
pub use controller::*;
pub use progress::NotificationCounter;
pub use registry::*;
pub use sample::*;

use std::fmt;
use std::io;
use std::os::unix::io::RawFd;

use perf::PerfRingError;
use thiserror::Error;

/// Key used to look up a monitored event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Lookup {
    Handle(RawFd),
    UniqueId(u64),
}

impl fmt::Display for Lookup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Lookup::Handle(fd) => write!(f, "fd={}", fd),
            Lookup::UniqueId(id) => write!(f, "id={}", id),
        }
    }
}

/// Who raised a notification, derived from the sign of `si_code`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    Kernel,
    User,
}

impl fmt::Display for Origin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Origin::Kernel => f.write_str("kernel"),
            Origin::User => f.write_str("user"),
        }
    }
}

/// Errors raised while laying out or bootstrapping an event group
#[derive(Error, Debug, PartialEq, Eq)]
pub enum LayoutError {
    #[error("no events requested")]
    NoEvents,

    #[error("sample type {0:#x} must be exactly IP | READ")]
    SampleType(u64),

    #[error("read format {0:#x} must include GROUP and ID")]
    MissingGroupIds(u64),

    #[error("read format {0:#x} has unsupported bits")]
    UnsupportedReadFormat(u64),

    #[error("group read reports {reported} members but {expected} are registered")]
    MemberCount { reported: u64, expected: usize },

    #[error("group read is {len} bytes, need {needed}")]
    Truncated { len: usize, needed: usize },

    #[error("event {0} has no unique id")]
    MissingUniqueId(String),

    #[error("duplicate {0}")]
    Duplicate(Lookup),
}

/// Errors of the notification pipeline; all of them end the run
#[derive(Error, Debug)]
pub enum Error {
    #[error("{op} failed for {event}: {source}")]
    Setup {
        op: &'static str,
        event: String,
        #[source]
        source: io::Error,
    },

    #[error("invalid event layout: {0}")]
    Layout(#[from] LayoutError),

    #[error("notification not generated by a counter overflow (origin {origin}, code {code})")]
    ProtocolViolation { origin: Origin, code: i32 },

    #[error("cannot read sample buffer of {event}: {source}")]
    BufferUnderrun {
        event: String,
        #[source]
        source: PerfRingError,
    },

    #[error("corrupt record in sample buffer of {event}: {source}")]
    CorruptRecord {
        event: String,
        #[source]
        source: PerfRingError,
    },

    #[error("no event associated with {0}")]
    UnknownEvent(Lookup),

    #[error("{event} has no sample buffer")]
    NoBuffer { event: String },

    #[error("cannot refresh {event}: {source}")]
    Rearm {
        event: String,
        #[source]
        source: io::Error,
    },

    #[error("notification relay failed: {0}")]
    Relay(#[source] io::Error),

    #[error("notification handling aborted")]
    Aborted,

    #[error("notification handler panicked or was cancelled: {0}")]
    Join(#[from] tokio::task::JoinError),
}
