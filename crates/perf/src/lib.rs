//! # perf
//!
//! Reader for the circular sample buffer that the kernel shares with a
//! `perf_event_open` file descriptor. The buffer is treated as logically
//! infinite: the read cursor only ever grows and is reduced modulo the
//! buffer size on access, so every wrap-around is handled in one place.
//!

mod memory_ring_storage;
#[cfg(target_os = "linux")]
mod mmap_ring_storage;
mod ring;

pub use memory_ring_storage::*;
#[cfg(target_os = "linux")]
pub use mmap_ring_storage::*;
pub use ring::*;

use std::os::unix::io::RawFd;
use thiserror::Error;

/// Errors that can occur when acquiring ring storage
#[derive(Error, Debug)]
pub enum RingStorageError {
    #[error("OS error: {0}")]
    OsError(#[from] std::io::Error),

    #[error("page count {0} is not a power of 2")]
    InvalidPageCount(u32),
}

/// Backing memory of a perf ring: one metadata page followed by the data pages.
pub trait RingStorage {
    /// Raw buffer containing the metadata page and data pages, used to
    /// derive the ring pointers
    fn data_mut(&mut self) -> &mut [u8];

    /// Return the number of data pages in the ring buffer
    fn num_data_pages(&self) -> u32;

    /// Return the page size the storage was laid out with
    fn page_size(&self) -> u64;

    /// Return the perf event file descriptor backing this storage, or -1
    fn file_descriptor(&self) -> RawFd;
}
