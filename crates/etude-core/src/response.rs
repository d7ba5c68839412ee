// src/response.rs
use crate::http::Status;
use crate::mime::HTML_MIME;
use crate::resource::FileMapping;
use crate::syscalls;
use arrayvec::ArrayVec;
use std::io::{self, Write};
use std::os::fd::RawFd;

/// Capacity of the header block. Responses whose headers do not fit are
/// downgraded to 500.
pub const HEADER_BLOCK_SIZE: usize = 1024;

pub const SERVER_NAME: &str = "etude";

/// Second segment of the write vector.
#[derive(Debug, Default)]
pub enum Body {
    #[default]
    Empty,
    Static(&'static [u8]),
    Mapped(FileMapping),
    Generated(Vec<u8>),
}

impl Body {
    pub fn as_slice(&self) -> &[u8] {
        match self {
            Body::Empty => &[],
            Body::Static(bytes) => bytes,
            Body::Mapped(map) => map.as_slice(),
            Body::Generated(bytes) => bytes,
        }
    }

    pub fn len(&self) -> usize {
        self.as_slice().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug)]
pub struct HeaderOverflow;

#[derive(Debug)]
pub enum WriteProgress {
    /// Everything was sent; the body has been released.
    Complete,
    /// The socket is full. Wait for the next writable event.
    Pending,
    /// Fatal socket error. The body has been released.
    Failed(io::Error),
}

/// Bounded header block plus one body segment, drained with `writev`
/// across as many writable events as it takes.
#[derive(Debug, Default)]
pub struct ResponseWriter {
    header: ArrayVec<u8, HEADER_BLOCK_SIZE>,
    body: Body,
    /// HEAD: the header advertises the body length but the body stays home.
    omit_body: bool,
    header_sent: usize,
    body_sent: usize,
    bytes_total: usize,
    status: Option<Status>,
}

impl ResponseWriter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build the header block for `status` and attach `body`.
    ///
    /// On overflow nothing is kept, the writer is left empty.
    pub fn prepare(
        &mut self,
        status: Status,
        content_type: &str,
        keep_alive: bool,
        body: Body,
        omit_body: bool,
    ) -> Result<(), HeaderOverflow> {
        self.clear();

        let built = write_header_block(&mut self.header, status, body.len(), content_type, keep_alive);
        if built.is_err() {
            self.header.clear();
            return Err(HeaderOverflow);
        }

        self.bytes_total = self.header.len() + if omit_body { 0 } else { body.len() };
        self.body = body;
        self.omit_body = omit_body;
        self.status = Some(status);
        Ok(())
    }

    /// Standard error page for `status`.
    pub fn prepare_error(
        &mut self,
        status: Status,
        keep_alive: bool,
        omit_body: bool,
    ) -> Result<(), HeaderOverflow> {
        self.prepare(status, HTML_MIME, keep_alive, Body::Static(status.page()), omit_body)
    }

    pub fn status(&self) -> Option<Status> {
        self.status
    }

    pub fn bytes_sent(&self) -> usize {
        self.header_sent + self.body_sent
    }

    pub fn bytes_total(&self) -> usize {
        self.bytes_total
    }

    pub fn is_done(&self) -> bool {
        self.bytes_sent() >= self.bytes_total
    }

    /// The unsent remainder: header tail first, then body tail.
    pub fn segments(&self) -> [&[u8]; 2] {
        let body: &[u8] = if self.omit_body {
            &[]
        } else {
            // Empty once released.
            self.body.as_slice().get(self.body_sent..).unwrap_or(&[])
        };
        [&self.header[self.header_sent..], body]
    }

    /// Account for `n` bytes accepted by the kernel. The header segment is
    /// retired only once fully sent.
    pub fn advance(&mut self, n: usize) {
        let header_left = self.header.len() - self.header_sent;
        let from_header = n.min(header_left);
        self.header_sent += from_header;

        let from_body = n - from_header;
        debug_assert!(self.body_sent + from_body <= self.body.len());
        self.body_sent += from_body;
    }

    /// Write as much as the socket takes.
    pub fn write_to(&mut self, fd: RawFd) -> WriteProgress {
        loop {
            if self.is_done() {
                self.release();
                return WriteProgress::Complete;
            }

            let result = {
                let segments = self.segments();
                syscalls::writev_nonblocking(fd, &segments)
            };
            match result {
                Ok(n) => self.advance(n),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return WriteProgress::Pending,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    self.release();
                    return WriteProgress::Failed(e);
                }
            }
        }
    }

    /// Drop the body (unmapping a file) but keep the counters.
    fn release(&mut self) {
        self.body = Body::Empty;
    }

    pub fn clear(&mut self) {
        self.header.clear();
        self.body = Body::Empty;
        self.omit_body = false;
        self.header_sent = 0;
        self.body_sent = 0;
        self.bytes_total = 0;
        self.status = None;
    }
}

fn write_header_block(
    out: &mut ArrayVec<u8, HEADER_BLOCK_SIZE>,
    status: Status,
    content_length: usize,
    content_type: &str,
    keep_alive: bool,
) -> io::Result<()> {
    out.write_all(status.status_line())?;
    write!(out, "Content-Length: {content_length}\r\n")?;
    write!(out, "Content-Type: {content_type}\r\n")?;
    if keep_alive {
        out.write_all(b"Connection: keep-alive\r\n")?;
    } else {
        out.write_all(b"Connection: close\r\n")?;
    }
    write!(out, "Server: {SERVER_NAME}\r\n\r\n")?;
    Ok(())
}
