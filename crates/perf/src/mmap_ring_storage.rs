#![cfg(target_os = "linux")]

use std::io;
use std::os::unix::io::{AsRawFd, BorrowedFd, RawFd};
use std::ptr;
use std::slice;

use libc::{c_void, mmap, munmap, MAP_SHARED, PROT_READ, PROT_WRITE};

use crate::{RingStorage, RingStorageError};

/// Memory-mapped ring storage shared with the kernel through a perf event fd
///
/// This implementation is only available on Linux platforms. The mapping is
/// read-write so the consumer can publish `data_tail`; the kernel then never
/// overwrites bytes the consumer has not released yet.
pub struct MmapRingStorage {
    data: *mut u8,
    data_len: usize,
    n_data_pages: u32,
    page_size: u64,
    fd: RawFd,
}

// The mapping is plain shared memory; the ring built on top of it
// serialises access through data_head / data_tail.
unsafe impl Send for MmapRingStorage {}

impl MmapRingStorage {
    /// Map the sample buffer of an already opened perf event
    ///
    /// # Arguments
    ///
    /// * `fd` - The perf event file descriptor (usually the group leader)
    /// * `n_pages` - Number of data pages in the ring buffer, must be a power of 2
    ///
    /// The mapping keeps its own reference to the perf event, so it stays
    /// valid even if the descriptor is closed first.
    pub fn new(fd: BorrowedFd<'_>, n_pages: u32) -> Result<Self, RingStorageError> {
        if !n_pages.is_power_of_two() {
            return Err(RingStorageError::InvalidPageCount(n_pages));
        }

        let page_size = page_size::get() as u64;
        let raw_fd = fd.as_raw_fd();

        // 1 metadata page + data pages
        let total_size = (page_size * (1 + u64::from(n_pages))) as usize;
        let data_ptr = unsafe {
            mmap(
                ptr::null_mut(),
                total_size,
                PROT_READ | PROT_WRITE,
                MAP_SHARED,
                raw_fd,
                0,
            )
        };

        if data_ptr == libc::MAP_FAILED {
            return Err(RingStorageError::OsError(io::Error::last_os_error()));
        }

        Ok(MmapRingStorage {
            data: data_ptr as *mut u8,
            data_len: total_size,
            n_data_pages: n_pages,
            page_size,
            fd: raw_fd,
        })
    }
}

impl RingStorage for MmapRingStorage {
    fn data_mut(&mut self) -> &mut [u8] {
        unsafe { slice::from_raw_parts_mut(self.data, self.data_len) }
    }

    fn num_data_pages(&self) -> u32 {
        self.n_data_pages
    }

    fn page_size(&self) -> u64 {
        self.page_size
    }

    fn file_descriptor(&self) -> RawFd {
        self.fd
    }
}

impl Drop for MmapRingStorage {
    fn drop(&mut self) {
        if !self.data.is_null() {
            unsafe {
                let _ = munmap(self.data as *mut c_void, self.data_len);
            }
            self.data = ptr::null_mut();
        }
    }
}
