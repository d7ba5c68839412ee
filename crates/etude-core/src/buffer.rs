// src/buffer.rs
use libc::{c_int, c_void};
use std::io;

/// Size of the stack scratch area `read_from_fd` spills into when the
/// buffer's writable tail is too short for what the socket has queued.
pub const SCRATCH_SIZE: usize = 65_536;

pub const INITIAL_CAPACITY: usize = 1024;

/// Growable byte buffer with separate read and write cursors.
///
/// ```text
/// +-------------------+------------------+------------------+
/// | prependable bytes |  readable bytes  |  writable bytes  |
/// +-------------------+------------------+------------------+
/// 0      <=       read_pos     <=     write_pos    <=     len
/// ```
#[derive(Debug, Clone)]
pub struct Buffer {
    buf: Vec<u8>,
    read_pos: usize,
    write_pos: usize,
}

impl Buffer {
    pub fn new() -> Self {
        Self::with_capacity(INITIAL_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: vec![0; capacity],
            read_pos: 0,
            write_pos: 0,
        }
    }

    #[inline(always)]
    fn check(&self) {
        debug_assert!(self.read_pos <= self.write_pos);
        debug_assert!(self.write_pos <= self.buf.len());
    }

    #[inline(always)]
    pub fn readable_bytes(&self) -> usize {
        self.write_pos - self.read_pos
    }

    #[inline(always)]
    pub fn writable_bytes(&self) -> usize {
        self.buf.len() - self.write_pos
    }

    /// Bytes before the read cursor that were already consumed and can be
    /// reclaimed by compaction.
    #[inline(always)]
    pub fn prependable_bytes(&self) -> usize {
        self.read_pos
    }

    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.readable_bytes() == 0
    }

    /// The unread region, without copying.
    #[inline(always)]
    pub fn peek(&self) -> &[u8] {
        &self.buf[self.read_pos..self.write_pos]
    }

    pub fn retrieve(&mut self, len: usize) {
        assert!(len <= self.readable_bytes(), "retrieve past write cursor");
        if len == self.readable_bytes() {
            self.retrieve_all();
        } else {
            self.read_pos += len;
        }
        self.check();
    }

    /// Retire everything up to `end`, an offset into `peek()`.
    pub fn retrieve_until(&mut self, end: usize) {
        self.retrieve(end);
    }

    pub fn retrieve_all(&mut self) {
        self.read_pos = 0;
        self.write_pos = 0;
    }

    pub fn append(&mut self, data: &[u8]) {
        self.ensure_writable(data.len());
        self.buf[self.write_pos..self.write_pos + data.len()].copy_from_slice(data);
        self.has_written(data.len());
    }

    pub fn has_written(&mut self, len: usize) {
        assert!(len <= self.writable_bytes(), "has_written past capacity");
        self.write_pos += len;
        self.check();
    }

    pub fn ensure_writable(&mut self, len: usize) {
        if self.writable_bytes() < len {
            self.make_space(len);
        }
        debug_assert!(self.writable_bytes() >= len);
    }

    fn make_space(&mut self, len: usize) {
        if self.writable_bytes() + self.prependable_bytes() < len {
            self.buf.resize(self.write_pos + len, 0);
        } else {
            // Slide the unread bytes to the front instead of allocating.
            let readable = self.readable_bytes();
            self.buf.copy_within(self.read_pos..self.write_pos, 0);
            self.read_pos = 0;
            self.write_pos = readable;
        }
        self.check();
    }

    /// One vectored read: fills the writable tail first, then spills the
    /// excess into a stack scratch region which is appended afterwards.
    ///
    /// `Ok(0)` means the peer closed its end. `WouldBlock` is reported as an
    /// error of that kind so callers can tell it apart from real failures.
    pub fn read_from_fd(&mut self, fd: c_int) -> io::Result<usize> {
        let mut scratch = [0u8; SCRATCH_SIZE];
        let writable = self.writable_bytes();
        let iov = [
            libc::iovec {
                iov_base: self.buf[self.write_pos..].as_mut_ptr() as *mut c_void,
                iov_len: writable,
            },
            libc::iovec {
                iov_base: scratch.as_mut_ptr() as *mut c_void,
                iov_len: scratch.len(),
            },
        ];

        // SAFETY: both iovecs point into live, exclusively borrowed memory of
        // the stated lengths for the duration of the call.
        let res = unsafe { libc::readv(fd, iov.as_ptr(), iov.len() as c_int) };
        if res < 0 {
            return Err(io::Error::last_os_error());
        }

        let n = res as usize;
        if n <= writable {
            self.has_written(n);
        } else {
            self.write_pos = self.buf.len();
            self.append(&scratch[..n - writable]);
        }
        Ok(n)
    }

    /// Write the unread region to `fd`, advancing the read cursor by what
    /// the kernel accepted.
    pub fn write_to_fd(&mut self, fd: c_int) -> io::Result<usize> {
        let data = self.peek();
        // SAFETY: `data` is a valid slice for the duration of the call.
        let res = unsafe { libc::write(fd, data.as_ptr() as *const c_void, data.len()) };
        if res < 0 {
            return Err(io::Error::last_os_error());
        }
        self.retrieve(res as usize);
        Ok(res as usize)
    }
}

impl Default for Buffer {
    fn default() -> Self {
        Self::new()
    }
}
