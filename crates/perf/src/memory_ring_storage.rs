use std::mem::{offset_of, size_of};
use std::os::fd::RawFd;
use std::slice;

use crate::{PerfEventMmapPage, RingStorage, RingStorageError};

/// Memory-based ring storage implementation
///
/// Stands in for the kernel mapping in tests and simulations. The buffer is
/// allocated as `u64` words so the metadata page is suitably aligned for its
/// atomic fields.
pub struct MemoryRingStorage {
    words: Vec<u64>,
    n_data_pages: u32,
    page_size: u64,
}

impl MemoryRingStorage {
    /// Create a new memory-based ring storage with `n_pages` system pages of data
    pub fn new(n_pages: u32) -> Result<Self, RingStorageError> {
        if !n_pages.is_power_of_two() {
            return Err(RingStorageError::InvalidPageCount(n_pages));
        }
        let page_size = page_size::get() as u64;
        Ok(Self::alloc(page_size, u64::from(n_pages) * page_size, n_pages))
    }

    /// Create a storage whose data area is `data_size` bytes, independent of
    /// the system page size.
    ///
    /// The data area starts right after a full metadata page and its size is
    /// advertised through `data_offset` / `data_size`, the same way newer
    /// kernels describe the mapping. Small sizes make wrap-around easy to
    /// reach in tests.
    pub fn with_data_size(data_size: u64) -> Self {
        let page_size = page_size::get() as u64;
        let mut storage = Self::alloc(page_size, data_size, 0);
        storage.put_word(offset_of!(PerfEventMmapPage, data_offset), page_size);
        storage.put_word(offset_of!(PerfEventMmapPage, data_size), data_size);
        storage
    }

    fn alloc(meta_size: u64, data_size: u64, n_data_pages: u32) -> Self {
        let total = (meta_size + data_size) as usize;
        let words = vec![0u64; total.div_ceil(size_of::<u64>())];
        MemoryRingStorage {
            words,
            n_data_pages,
            page_size: meta_size,
        }
    }

    fn put_word(&mut self, byte_offset: usize, value: u64) {
        self.words[byte_offset / size_of::<u64>()] = value;
    }
}

impl RingStorage for MemoryRingStorage {
    fn data_mut(&mut self) -> &mut [u8] {
        let len = self.words.len() * size_of::<u64>();
        unsafe { slice::from_raw_parts_mut(self.words.as_mut_ptr() as *mut u8, len) }
    }

    fn num_data_pages(&self) -> u32 {
        self.n_data_pages
    }

    fn page_size(&self) -> u64 {
        self.page_size
    }

    fn file_descriptor(&self) -> RawFd {
        -1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_ring_storage() {
        let n_pages = 2;
        let mut storage = MemoryRingStorage::new(n_pages).unwrap();

        // Check basic properties
        assert_eq!(storage.num_data_pages(), n_pages);
        assert_eq!(storage.page_size(), page_size::get() as u64);

        let expected_size = storage.page_size() * (1 + u64::from(n_pages));
        assert_eq!(storage.data_mut().len() as u64, expected_size);

        assert_eq!(storage.file_descriptor(), -1);
    }

    #[test]
    fn test_rejects_non_power_of_two_pages() {
        assert!(matches!(
            MemoryRingStorage::new(3),
            Err(RingStorageError::InvalidPageCount(3))
        ));
    }

    #[test]
    fn test_with_data_size_advertises_layout() {
        let mut storage = MemoryRingStorage::with_data_size(64);
        let page_size = page_size::get() as u64;
        assert_eq!(storage.data_mut().len() as u64, page_size + 64);

        let meta = storage.data_mut().as_ptr() as *const PerfEventMmapPage;
        unsafe {
            assert_eq!((*meta).data_offset, page_size);
            assert_eq!((*meta).data_size, 64);
        }
        // Metadata must be aligned for the atomic head/tail fields
        assert_eq!(meta as usize % std::mem::align_of::<PerfEventMmapPage>(), 0);
    }
}
