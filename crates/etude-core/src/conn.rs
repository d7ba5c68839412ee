// src/conn.rs
use crate::buffer::Buffer;
use crate::http::{Method, Status};
use crate::parser::{HttpParser, ParseOutcome, ParserLimits};
use crate::response::{ResponseWriter, WriteProgress};
use crate::service::{Reply, Service};
use crate::slab::ConnId;
use crate::syscalls::{Epoll, Interest};
use std::io;
use std::net::SocketAddr;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use tracing::warn;

/// Stop draining the socket once this much input is buffered. The rest is
/// picked up when the connection is re-armed.
pub const READ_HIGH_WATER: usize = 1024 * 1024;

#[derive(Debug)]
pub enum ReadProgress {
    /// Bytes appended to the read buffer (zero on a spurious wakeup).
    Data(usize),
    PeerClosed,
    Failed(io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessOutcome {
    /// Request incomplete; wait for more input.
    NeedMoreData,
    /// A response is staged in the writer.
    Respond,
    /// Nothing sensible can be sent; tear the connection down.
    Close,
}

/// One accepted socket and everything needed to serve requests on it.
///
/// The socket is closed when the connection is dropped.
pub struct Connection {
    id: ConnId,
    fd: OwnedFd,
    peer: SocketAddr,
    read_buf: Buffer,
    parser: HttpParser,
    writer: ResponseWriter,
    keep_alive: bool,
    armed: Option<Interest>,
    requests_served: u32,
    max_keep_alive_requests: u32,
}

impl Connection {
    pub fn new(
        id: ConnId,
        fd: OwnedFd,
        peer: SocketAddr,
        limits: ParserLimits,
        max_keep_alive_requests: u32,
    ) -> Self {
        Self {
            id,
            fd,
            peer,
            read_buf: Buffer::new(),
            parser: HttpParser::new(limits),
            writer: ResponseWriter::new(),
            keep_alive: false,
            armed: None,
            requests_served: 0,
            max_keep_alive_requests,
        }
    }

    pub fn id(&self) -> ConnId {
        self.id
    }

    pub fn fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn armed(&self) -> Option<Interest> {
        self.armed
    }

    pub fn keep_alive(&self) -> bool {
        self.keep_alive
    }

    pub fn requests_served(&self) -> u32 {
        self.requests_served
    }

    pub fn has_buffered_input(&self) -> bool {
        !self.read_buf.is_empty()
    }

    pub fn writer(&self) -> &ResponseWriter {
        &self.writer
    }

    /// First registration with epoll, waiting for the request.
    pub fn register(&mut self, epoll: &Epoll) -> io::Result<()> {
        if !self.mark_armed(Interest::Read) {
            return Err(double_arm());
        }
        epoll
            .add(self.fd(), self.id.token(), Interest::Read.epoll_flags())
            .inspect_err(|_| self.armed = None)
    }

    /// Record that `interest` is about to be armed. Refuses (and trips a
    /// debug assertion) if the connection is still armed.
    pub fn mark_armed(&mut self, interest: Interest) -> bool {
        if let Some(current) = self.armed {
            debug_assert!(
                false,
                "connection {} armed for {interest:?} while still armed for {current:?}",
                self.id
            );
            return false;
        }
        self.armed = Some(interest);
        true
    }

    /// Re-arm the one-shot registration.
    pub fn arm(&mut self, epoll: &Epoll, interest: Interest) -> io::Result<()> {
        if !self.mark_armed(interest) {
            return Err(double_arm());
        }
        epoll
            .modify(self.fd(), self.id.token(), interest.epoll_flags())
            .inspect_err(|_| self.armed = None)
    }

    /// A one-shot event was delivered; the registration is now inert.
    pub fn disarm(&mut self) {
        self.armed = None;
    }

    /// Drain the socket into the read buffer until it would block.
    pub fn read_available(&mut self) -> ReadProgress {
        let fd = self.fd();
        let mut total = 0;
        while self.read_buf.readable_bytes() < READ_HIGH_WATER {
            match self.read_buf.read_from_fd(fd) {
                Ok(0) => return ReadProgress::PeerClosed,
                Ok(n) => total += n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return ReadProgress::Failed(e),
            }
        }
        ReadProgress::Data(total)
    }

    /// Advance the parser over buffered input and, once a request is
    /// complete, stage its response. Runs on a worker thread.
    pub fn process(&mut self, service: &Service) -> ProcessOutcome {
        match self.parser.parse(&mut self.read_buf) {
            ParseOutcome::NeedMoreData => ProcessOutcome::NeedMoreData,
            ParseOutcome::Complete => {
                self.requests_served += 1;
                let (reply, head) = {
                    let req = self.parser.request();
                    self.keep_alive =
                        req.keep_alive && self.requests_served < self.max_keep_alive_requests;
                    (service.respond(req), req.method == Method::Head)
                };
                self.stage(reply, head)
            }
            ParseOutcome::Malformed => {
                self.keep_alive = false;
                self.stage(Reply::error(Status::BadRequest), false)
            }
            ParseOutcome::InternalError => self.fail_internal(),
        }
    }

    fn stage(&mut self, reply: Reply, head: bool) -> ProcessOutcome {
        let staged = self.writer.prepare(
            reply.status,
            &reply.content_type,
            self.keep_alive,
            reply.body,
            head,
        );
        match staged {
            Ok(()) => ProcessOutcome::Respond,
            Err(_) => {
                warn!(conn = %self.id, content_type = %reply.content_type, "response header too large");
                self.fail_internal()
            }
        }
    }

    /// Replace whatever was in progress with a 500 and close afterwards.
    pub fn fail_internal(&mut self) -> ProcessOutcome {
        self.keep_alive = false;
        match self.writer.prepare_error(Status::InternalError, false, false) {
            Ok(()) => ProcessOutcome::Respond,
            Err(_) => ProcessOutcome::Close,
        }
    }

    /// Push the staged response out. Runs on the reactor thread.
    pub fn write(&mut self) -> WriteProgress {
        self.writer.write_to(self.fd.as_raw_fd())
    }

    /// After a fully flushed response: reset for the next request on the
    /// same socket. Unread pipelined bytes stay buffered. Returns false if
    /// the connection should be closed instead.
    pub fn finish_response(&mut self) -> bool {
        self.writer.clear();
        self.parser.reset();
        if !self.keep_alive {
            return false;
        }
        self.keep_alive = false;
        true
    }
}

fn double_arm() -> io::Error {
    io::Error::new(io::ErrorKind::AlreadyExists, "connection is already armed")
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("fd", &self.fd())
            .field("peer", &self.peer)
            .field("armed", &self.armed)
            .field("requests_served", &self.requests_served)
            .finish()
    }
}
