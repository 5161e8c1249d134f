use std::mem::size_of;
use std::os::unix::io::RawFd;
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicU64, Ordering};

use plain::Plain;
use thiserror::Error;

use crate::RingStorage;

/// Errors that can occur when using the perf ring buffer
#[derive(Error, Debug, PartialEq, Eq)]
pub enum PerfRingError {
    #[error("buffer length must be a power of 2 and at least 8 bytes")]
    InvalidBufferLength,

    #[error("data buffer cannot be nil")]
    NilBuffer,

    #[error("buffer full")]
    NoSpace,

    #[error("data too large for buffer")]
    CannotFit,

    #[error("cannot write empty data")]
    EmptyWrite,

    #[error("requested {requested} bytes but only {available} are available")]
    BufferUnderrun { requested: u64, available: u64 },

    #[error("record header declares {size} bytes, less than the header itself")]
    MalformedHeader { size: u16 },

    #[error("cursor {requested} outside of readable range [{cursor}, {head}]")]
    CursorOutOfRange { requested: u64, cursor: u64, head: u64 },
}

/// Header at the start of every record in the ring (`struct perf_event_header`)
#[repr(C)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RecordHeader {
    pub type_: u32,
    pub misc: u16,
    pub size: u16,
}
unsafe impl Plain for RecordHeader {}

impl RecordHeader {
    /// Number of bytes in the record after the header
    pub fn body_len(&self) -> u64 {
        u64::from(self.size).saturating_sub(size_of::<RecordHeader>() as u64)
    }
}

/// Shared metadata page for perf ring buffer
#[repr(C)]
pub struct PerfEventMmapPage {
    pub version: u32,
    pub compat_version: u32,
    pad1: [u8; 1024 - 8],
    pub data_head: AtomicU64,
    pub data_tail: AtomicU64,
    pub data_offset: u64,
    pub data_size: u64,
    pub aux_offset: u64,
    pub aux_size: u64,
}

/// Type constants for perf records
pub const PERF_RECORD_LOST: u32 = 2;
pub const PERF_RECORD_SAMPLE: u32 = 9;

/// Sequential access to binary fields, bounded by what the producer has published.
pub trait FieldReader {
    /// Copy exactly `buf.len()` bytes and advance past them
    fn read(&mut self, buf: &mut [u8]) -> Result<(), PerfRingError>;

    /// Bytes that can still be read
    fn available(&self) -> u64;

    /// Read one native-endian 8-byte field
    fn read_u64(&mut self) -> Result<u64, PerfRingError> {
        let mut buf = [0u8; 8];
        self.read(&mut buf)?;
        Ok(u64::from_ne_bytes(buf))
    }
}

/// PerfRing is the consumer (and, for tests, producer) view of one perf ring buffer.
///
/// The read cursor is a logical byte position that only grows; the physical
/// offset is `cursor & buf_mask`. Reads never go past the producer position
/// observed by the last [`PerfRing::start_read_batch`].
pub struct PerfRing {
    // Shared metadata page
    meta: NonNull<PerfEventMmapPage>,
    // Data buffer
    data: *mut u8,
    // Data buffer length
    data_len: usize,
    // Mask for quick modulo operations (buffer size - 1)
    buf_mask: u64,
    // Consumer read position
    cursor: u64,
    // Producer position seen at the start of the read batch
    head: u64,
    // Producer write position, only advanced by `write_record`
    write_pos: u64,
    // Consumer position seen at the start of the write batch
    released: u64,
    // Owns the memory the pointers above point into; dropped last
    storage: Box<dyn RingStorage + Send>,
}

// Safety: the ring owns its storage, and the pointers stay valid for as long
// as the storage lives. Moving the ring to another thread moves the only
// consumer with it.
unsafe impl Send for PerfRing {}

impl PerfRing {
    /// Initializes a PerfRing over a storage holding the metadata page and data pages
    pub fn new<S>(storage: S) -> Result<Self, PerfRingError>
    where
        S: RingStorage + Send + 'static,
    {
        let mut storage: Box<dyn RingStorage + Send> = Box::new(storage);
        let page_size = storage.page_size();
        let n_pages = storage.num_data_pages();
        let data = storage.data_mut();

        if data.is_empty() {
            return Err(PerfRingError::NilBuffer);
        }
        if (data.len() as u64) < size_of::<PerfEventMmapPage>() as u64 {
            return Err(PerfRingError::InvalidBufferLength);
        }

        let meta_ptr = data.as_mut_ptr() as *mut PerfEventMmapPage;
        let meta = NonNull::new(meta_ptr).ok_or(PerfRingError::NilBuffer)?;

        // If data_offset is not given (older kernels), the data starts one page
        // in and spans all data pages; otherwise the kernel tells us where.
        let (data_start, buf_len) = unsafe {
            let m = meta.as_ref();
            if m.data_offset == 0 {
                (page_size, u64::from(n_pages) * page_size)
            } else {
                (m.data_offset, m.data_size)
            }
        };

        if !buf_len.is_power_of_two() || buf_len < 8 {
            return Err(PerfRingError::InvalidBufferLength);
        }
        if data_start + buf_len > data.len() as u64 {
            return Err(PerfRingError::InvalidBufferLength);
        }

        let data_ptr = unsafe { data.as_mut_ptr().add(data_start as usize) };
        let (data_tail, data_head) = unsafe {
            let m = meta.as_ref();
            (
                m.data_tail.load(Ordering::Acquire),
                m.data_head.load(Ordering::Acquire),
            )
        };

        Ok(PerfRing {
            meta,
            data: data_ptr,
            data_len: buf_len as usize,
            buf_mask: buf_len - 1,
            cursor: data_tail,
            head: data_tail,
            write_pos: data_head,
            released: data_tail,
            storage,
        })
    }

    /// Size of the data area in bytes
    pub fn capacity(&self) -> u64 {
        self.buf_mask + 1
    }

    /// Perf event descriptor the ring belongs to, or -1 for heap storage
    pub fn file_descriptor(&self) -> RawFd {
        self.storage.file_descriptor()
    }

    /// Logical read position
    pub fn cursor(&self) -> u64 {
        self.cursor
    }

    /// Physical offset of the read position inside the data area
    pub fn offset(&self) -> u64 {
        self.cursor & self.buf_mask
    }

    /// Starts a read batch by observing the producer position
    pub fn start_read_batch(&mut self) {
        self.head = unsafe { self.meta.as_ref() }
            .data_head
            .load(Ordering::Acquire);
    }

    /// Finishes a read batch, handing consumed space back to the producer
    pub fn finish_read_batch(&mut self) {
        unsafe {
            self.meta
                .as_ref()
                .data_tail
                .store(self.cursor, Ordering::Release);
        }
    }

    /// Returns the number of bytes available to read in this batch
    pub fn bytes_remaining(&self) -> u64 {
        // A corrupt head can never make more than one buffer readable
        self.head.saturating_sub(self.cursor).min(self.capacity())
    }

    /// Advances the cursor without copying
    pub fn skip(&mut self, len: u64) -> Result<(), PerfRingError> {
        let available = self.bytes_remaining();
        if len > available {
            return Err(PerfRingError::BufferUnderrun {
                requested: len,
                available,
            });
        }
        self.cursor += len;
        Ok(())
    }

    /// Moves the cursor forward to `pos`, which must lie between the cursor and the head
    pub fn advance_to(&mut self, pos: u64) -> Result<(), PerfRingError> {
        if pos < self.cursor || pos > self.cursor + self.bytes_remaining() {
            return Err(PerfRingError::CursorOutOfRange {
                requested: pos,
                cursor: self.cursor,
                head: self.head,
            });
        }
        self.cursor = pos;
        Ok(())
    }

    /// Reads the next record header
    ///
    /// The header's declared size is checked against the bytes the producer
    /// has published, so the body can never run into unwritten memory.
    pub fn read_header(&mut self) -> Result<RecordHeader, PerfRingError> {
        let mut buf = [0u8; size_of::<RecordHeader>()];
        self.read(&mut buf)?;

        let mut header = RecordHeader::default();
        // Cannot fail: the buffer is exactly one header long
        let _ = plain::copy_from_bytes(&mut header, &buf);

        if (header.size as usize) < size_of::<RecordHeader>() {
            return Err(PerfRingError::MalformedHeader { size: header.size });
        }
        let available = self.bytes_remaining();
        if header.body_len() > available {
            return Err(PerfRingError::BufferUnderrun {
                requested: header.body_len(),
                available,
            });
        }
        Ok(header)
    }

    /// Reads the next record header and returns a reader bounded by the record.
    ///
    /// Dropping the returned [`Record`] always leaves the cursor at the start
    /// of the following record, however much of the body was consumed.
    pub fn next_record(&mut self) -> Result<Record<'_>, PerfRingError> {
        let start = self.cursor;
        let header = self.read_header()?;
        Ok(Record {
            end: start + u64::from(header.size),
            header,
            ring: self,
        })
    }

    fn copy_out(&self, pos: u64, buf: &mut [u8]) {
        if buf.is_empty() {
            return;
        }
        let start = (pos & self.buf_mask) as usize;
        let first_len = buf.len().min(self.data_len - start);
        unsafe {
            ptr::copy_nonoverlapping(self.data.add(start), buf.as_mut_ptr(), first_len);
            // Wrapped part, empty when the read is contiguous
            ptr::copy_nonoverlapping(
                self.data,
                buf.as_mut_ptr().add(first_len),
                buf.len() - first_len,
            );
        }
    }

    fn copy_in(&mut self, pos: u64, bytes: &[u8]) {
        if bytes.is_empty() {
            return;
        }
        let start = (pos & self.buf_mask) as usize;
        let first_len = bytes.len().min(self.data_len - start);
        unsafe {
            ptr::copy_nonoverlapping(bytes.as_ptr(), self.data.add(start), first_len);
            ptr::copy_nonoverlapping(
                bytes.as_ptr().add(first_len),
                self.data,
                bytes.len() - first_len,
            );
        }
    }

    /// Starts a write batch operation
    pub fn start_write_batch(&mut self) {
        // Get the current consumer position from shared memory
        let meta = unsafe { self.meta.as_ref() };
        self.released = meta.data_tail.load(Ordering::Acquire);
        self.write_pos = meta.data_head.load(Ordering::Acquire);
    }

    /// Writes a record of the given type; the payload is padded to 8 bytes
    ///
    /// Returns the logical position of the record header.
    pub fn write_record(
        &mut self,
        type_: u32,
        misc: u16,
        payload: &[u8],
    ) -> Result<u64, PerfRingError> {
        if payload.is_empty() {
            return Err(PerfRingError::EmptyWrite);
        }

        let unaligned_len = size_of::<RecordHeader>() + payload.len();
        let aligned_len = (unaligned_len + 7) & !7;
        if aligned_len > usize::from(u16::MAX) || aligned_len as u64 > self.capacity() {
            return Err(PerfRingError::CannotFit);
        }

        let header = RecordHeader {
            type_,
            misc,
            size: aligned_len as u16,
        };
        let mut bytes = Vec::with_capacity(aligned_len);
        bytes.extend_from_slice(unsafe { plain::as_bytes(&header) });
        bytes.extend_from_slice(payload);
        bytes.resize(aligned_len, 0);

        self.write_bytes(&bytes)
    }

    /// Writes raw bytes at the producer position, wrapping as needed
    pub fn write_bytes(&mut self, bytes: &[u8]) -> Result<u64, PerfRingError> {
        if bytes.is_empty() {
            return Err(PerfRingError::EmptyWrite);
        }
        if bytes.len() as u64 > self.capacity() {
            return Err(PerfRingError::CannotFit);
        }
        // Check if there's enough space
        if self.write_pos + bytes.len() as u64 - self.released > self.capacity() {
            return Err(PerfRingError::NoSpace);
        }

        let pos = self.write_pos;
        self.copy_in(pos, bytes);
        self.write_pos += bytes.len() as u64;
        Ok(pos)
    }

    /// Finishes a write batch operation, publishing the written bytes
    pub fn finish_write_batch(&mut self) {
        unsafe {
            self.meta
                .as_ref()
                .data_head
                .store(self.write_pos, Ordering::Release);
        }
    }
}

impl FieldReader for PerfRing {
    fn read(&mut self, buf: &mut [u8]) -> Result<(), PerfRingError> {
        let requested = buf.len() as u64;
        let available = self.bytes_remaining();
        if requested > available {
            return Err(PerfRingError::BufferUnderrun {
                requested,
                available,
            });
        }
        self.copy_out(self.cursor, buf);
        self.cursor += requested;
        Ok(())
    }

    fn available(&self) -> u64 {
        self.bytes_remaining()
    }
}

/// One record being consumed from a [`PerfRing`]
pub struct Record<'a> {
    header: RecordHeader,
    end: u64,
    ring: &'a mut PerfRing,
}

impl Record<'_> {
    pub fn header(&self) -> RecordHeader {
        self.header
    }

    /// Bytes of the body not consumed yet
    pub fn remaining(&self) -> u64 {
        self.end - self.ring.cursor
    }
}

impl FieldReader for Record<'_> {
    fn read(&mut self, buf: &mut [u8]) -> Result<(), PerfRingError> {
        let available = self.remaining();
        if buf.len() as u64 > available {
            return Err(PerfRingError::BufferUnderrun {
                requested: buf.len() as u64,
                available,
            });
        }
        self.ring.read(buf)
    }

    fn available(&self) -> u64 {
        self.remaining()
    }
}

impl Drop for Record<'_> {
    fn drop(&mut self) {
        // `end` was checked against the head when the header was read
        let _ = self.ring.advance_to(self.end);
    }
}
