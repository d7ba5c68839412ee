// src/reactor.rs
use crate::conn::{Connection, ProcessOutcome, ReadProgress};
use crate::error::EtudeResult;
use crate::metrics::ServerMetrics;
use crate::parser::ParserLimits;
use crate::pool::{Dispatcher, PoolOptions};
use crate::response::WriteProgress;
use crate::service::Service;
use crate::slab::{ConnId, ConnectionSlab};
use crate::syscalls::{
    self, EPOLLERR, EPOLLET, EPOLLHUP, EPOLLIN, EPOLLOUT, EPOLLRDHUP, Epoll, Interest,
    epoll_event,
};
use crate::timer::TimerHeap;
use std::io;
use std::net::SocketAddr;
use std::os::fd::{AsRawFd, OwnedFd};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

pub const LISTENER_TOKEN: u64 = u64::MAX;
pub const PIPE_TOKEN: u64 = u64::MAX - 1;

/// Self-pipe bytes.
pub const TICK: u8 = b'A';
pub const TERMINATE: u8 = b'T';
pub const WAKE: u8 = b'W';

const EVENT_BATCH: usize = 1024;
const DRAIN_POLL_MS: i32 = 100;

/// Write end of the reactor's self-pipe. Cheap to clone, safe to use from
/// any thread.
#[derive(Clone)]
pub struct Notifier {
    tx: Arc<OwnedFd>,
}

impl Notifier {
    pub fn new(tx: OwnedFd) -> Self {
        Self { tx: Arc::new(tx) }
    }

    pub fn notify(&self, signal: u8) {
        match syscalls::write_nonblocking(self.tx.as_raw_fd(), &[signal]) {
            Ok(_) => {}
            // Pipe full: the reactor has plenty of wakeups queued already.
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
            Err(e) => warn!(error = %e, "self-pipe write failed"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ReactorOptions {
    pub idle_timeout: Duration,
    pub max_connections: usize,
    pub limits: ParserLimits,
    pub max_keep_alive_requests: u32,
    pub shutdown_grace: Duration,
    pub pool: PoolOptions,
}

enum Slot {
    /// Owned by the reactor, waiting for readiness.
    Idle(Box<Connection>),
    /// Moved to a worker. Its idle timer is parked until it comes back.
    InFlight,
}

/// Connection table plus what teardown needs. This is the context timer
/// callbacks run against.
pub(crate) struct ConnectionTable {
    slab: ConnectionSlab<Slot>,
    epoll: Arc<Epoll>,
    metrics: Arc<ServerMetrics>,
}

impl ConnectionTable {
    fn evict(&mut self, id: ConnId) {
        // Busy connections have no timer; anything else here is stale.
        if !matches!(self.slab.get(id), Some(Slot::Idle(_))) {
            return;
        }
        if let Some(Slot::Idle(conn)) = self.slab.remove(id) {
            self.metrics.inc_timed_out();
            debug!(conn = %id, peer = %conn.peer(), "idle timeout");
            self.teardown(conn);
        }
    }

    fn teardown(&self, conn: Box<Connection>) {
        if let Err(e) = self.epoll.delete(conn.fd()) {
            debug!(conn = %conn.id(), error = %e, "epoll delete failed");
        }
        self.metrics.dec_conn();
        debug!(conn = %conn.id(), peer = %conn.peer(), served = conn.requests_served(), "connection closed");
    }

    fn take_idle(&mut self, id: ConnId) -> Option<Box<Connection>> {
        let slot = self.slab.get_mut(id)?;
        if !matches!(slot, Slot::Idle(_)) {
            return None;
        }
        match std::mem::replace(slot, Slot::InFlight) {
            Slot::Idle(conn) => Some(conn),
            Slot::InFlight => None,
        }
    }

    fn put_back(&mut self, conn: Box<Connection>) {
        match self.slab.get_mut(conn.id()) {
            Some(slot) => *slot = Slot::Idle(conn),
            None => {
                debug_assert!(false, "connection {} lost its slot", conn.id());
                self.teardown(conn);
            }
        }
    }
}

struct Returned {
    conn: Box<Connection>,
    rearmed: bool,
}

/// Connections coming back from workers.
///
/// A worker re-arms the socket while holding this lock, so by the time the
/// reactor can see the connection here its registration is settled, and an
/// event for it forces a drain before being handled.
#[derive(Default)]
pub(crate) struct ReturnQueue {
    items: Mutex<Vec<Returned>>,
}

impl ReturnQueue {
    fn hand_back(
        &self,
        mut conn: Box<Connection>,
        next: Option<Interest>,
        epoll: &Epoll,
        notifier: &Notifier,
    ) {
        let mut items = self.items.lock().unwrap_or_else(PoisonError::into_inner);
        let rearmed = match next {
            Some(interest) if conn.mark_armed(interest) => {
                match epoll.modify(conn.fd(), conn.id().token(), interest.epoll_flags()) {
                    Ok(()) => true,
                    Err(e) => {
                        warn!(conn = %conn.id(), error = %e, "re-arm failed");
                        conn.disarm();
                        false
                    }
                }
            }
            _ => false,
        };
        items.push(Returned { conn, rearmed });
        drop(items);

        // Nothing will fire for this connection; make the reactor look.
        if !rearmed {
            notifier.notify(WAKE);
        }
    }

    fn take(&self) -> Vec<Returned> {
        std::mem::take(&mut *self.items.lock().unwrap_or_else(PoisonError::into_inner))
    }
}

/// Worker-side half of a request: parse, stage a response, hand back.
fn serve(
    mut conn: Box<Connection>,
    service: &Service,
    epoll: &Epoll,
    returns: &ReturnQueue,
    notifier: &Notifier,
) {
    let outcome = match panic::catch_unwind(AssertUnwindSafe(|| conn.process(service))) {
        Ok(outcome) => outcome,
        Err(_) => {
            error!(conn = %conn.id(), "panic while processing request");
            conn.fail_internal()
        }
    };
    let next = match outcome {
        ProcessOutcome::NeedMoreData => Some(Interest::Read),
        ProcessOutcome::Respond => Some(Interest::Write),
        ProcessOutcome::Close => None,
    };
    returns.hand_back(conn, next, epoll, notifier);
}

/// The event loop. Owns the epoll instance, the connection table and the
/// timer heap; everything here runs on one thread.
pub struct Reactor {
    epoll: Arc<Epoll>,
    listener: Option<OwnedFd>,
    accepting: bool,
    pipe_rx: OwnedFd,
    table: ConnectionTable,
    timers: TimerHeap<ConnId, ConnectionTable>,
    dispatcher: Dispatcher<Box<Connection>>,
    returns: Arc<ReturnQueue>,
    options: ReactorOptions,
    stop: Arc<AtomicBool>,
    tick_due: bool,
    stop_requested: bool,
    shutdown_deadline: Option<Instant>,
}

impl Reactor {
    pub fn new(
        options: ReactorOptions,
        listener: OwnedFd,
        pipe_rx: OwnedFd,
        notifier: Notifier,
        service: Arc<Service>,
        metrics: Arc<ServerMetrics>,
        stop: Arc<AtomicBool>,
    ) -> EtudeResult<Self> {
        let epoll = Arc::new(Epoll::new()?);
        epoll.add(listener.as_raw_fd(), LISTENER_TOKEN, EPOLLIN as u32)?;
        epoll.add(pipe_rx.as_raw_fd(), PIPE_TOKEN, (EPOLLIN | EPOLLET) as u32)?;

        let returns = Arc::new(ReturnQueue::default());
        let dispatcher = {
            let epoll = epoll.clone();
            let returns = returns.clone();
            Dispatcher::start(&options.pool, move |conn: Box<Connection>| {
                serve(conn, &service, &epoll, &returns, &notifier);
            })?
        };

        Ok(Self {
            table: ConnectionTable {
                slab: ConnectionSlab::new(options.max_connections),
                epoll: epoll.clone(),
                metrics,
            },
            epoll,
            listener: Some(listener),
            accepting: true,
            pipe_rx,
            timers: TimerHeap::with_capacity(1024),
            dispatcher,
            returns,
            options,
            stop,
            tick_due: false,
            stop_requested: false,
            shutdown_deadline: None,
        })
    }

    pub fn run(mut self) -> EtudeResult<()> {
        let mut events = vec![epoll_event { events: 0, u64: 0 }; EVENT_BATCH];

        loop {
            self.drain_returns();

            if self.tick_due {
                self.tick_due = false;
                let fired = self.timers.sweep(Instant::now(), &mut self.table);
                if fired > 0 {
                    debug!(fired, "idle connections evicted");
                }
            }

            if self.shutdown_deadline.is_none()
                && (self.stop_requested || self.stop.load(Ordering::Acquire))
            {
                self.begin_shutdown();
            }
            if let Some(deadline) = self.shutdown_deadline {
                if self.table.slab.is_empty() {
                    break;
                }
                if Instant::now() >= deadline {
                    warn!(remaining = self.table.slab.len(), "shutdown grace expired");
                    break;
                }
            }

            let timeout = if self.shutdown_deadline.is_some() {
                DRAIN_POLL_MS
            } else {
                -1
            };
            let n = self.epoll.wait(&mut events, timeout)?;
            for ev in &events[..n] {
                let (token, flags) = (ev.u64, ev.events);
                match token {
                    LISTENER_TOKEN => self.accept_all(),
                    PIPE_TOKEN => self.drain_pipe(),
                    _ => self.connection_event(ConnId::from_token(token), flags),
                }
            }
        }

        self.finish();
        Ok(())
    }

    fn accept_all(&mut self) {
        loop {
            let Some(listener) = self.listener.as_ref().filter(|_| self.accepting) else {
                return;
            };
            match syscalls::accept_connection(listener.as_raw_fd()) {
                Ok(Some((fd, peer))) => self.admit(fd, peer),
                Ok(None) => return,
                Err(e) => {
                    warn!(error = %e, "accept failed");
                    return;
                }
            }
        }
    }

    fn admit(&mut self, fd: OwnedFd, peer: SocketAddr) {
        let table = &mut self.table;
        if table.slab.len() >= self.options.max_connections {
            table.metrics.inc_refused();
            warn!(%peer, max = self.options.max_connections, "connection limit reached, refusing");
            return;
        }

        let limits = self.options.limits;
        let max_requests = self.options.max_keep_alive_requests;
        let Some(id) = table.slab.allocate(|id| {
            Slot::Idle(Box::new(Connection::new(id, fd, peer, limits, max_requests)))
        }) else {
            table.metrics.inc_refused();
            warn!(%peer, "connection table full, refusing");
            return;
        };

        let registered = match table.slab.get_mut(id) {
            Some(Slot::Idle(conn)) => conn.register(&self.epoll),
            _ => Err(io::Error::other("fresh slot is not idle")),
        };
        if let Err(e) = registered {
            warn!(%peer, error = %e, "failed to register connection");
            table.slab.remove(id);
            return;
        }

        table.metrics.inc_conn();
        self.start_idle_timer(id);
        debug!(conn = %id, %peer, "accepted");
    }

    /// (Re)start the idle countdown for a connection the reactor holds.
    fn start_idle_timer(&mut self, id: ConnId) {
        self.timers.insert(
            id,
            Instant::now() + self.options.idle_timeout,
            Box::new(move |table: &mut ConnectionTable| table.evict(id)),
        );
    }

    fn drain_pipe(&mut self) {
        let mut buf = [0u8; 256];
        loop {
            match syscalls::read_nonblocking(self.pipe_rx.as_raw_fd(), &mut buf) {
                Ok(0) => return,
                Ok(n) => {
                    for &signal in &buf[..n] {
                        match signal {
                            TICK => self.tick_due = true,
                            TERMINATE => self.stop_requested = true,
                            _ => {}
                        }
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    warn!(error = %e, "self-pipe read failed");
                    return;
                }
            }
        }
    }

    fn connection_event(&mut self, id: ConnId, flags: u32) {
        if matches!(self.table.slab.get(id), Some(Slot::InFlight)) {
            // Re-armed by a worker; collect it before acting on the event.
            self.drain_returns();
        }
        let Some(mut conn) = self.table.take_idle(id) else {
            // Stale id from a connection that is already gone.
            return;
        };
        conn.disarm();

        if flags & (EPOLLRDHUP | EPOLLHUP | EPOLLERR) as u32 != 0 {
            self.close(conn);
            return;
        }

        if flags & EPOLLIN as u32 != 0 {
            match conn.read_available() {
                ReadProgress::Data(0) => self.rearm(conn, Interest::Read),
                ReadProgress::Data(_) => self.dispatch(conn),
                ReadProgress::PeerClosed => self.close(conn),
                ReadProgress::Failed(e) => {
                    debug!(conn = %id, error = %e, "read failed");
                    self.close(conn);
                }
            }
        } else if flags & EPOLLOUT as u32 != 0 {
            self.write_ready(conn);
        } else {
            self.rearm(conn, Interest::Read);
        }
    }

    fn write_ready(&mut self, mut conn: Box<Connection>) {
        let id = conn.id();
        let before = conn.writer().bytes_sent();
        let progress = conn.write();
        self.table
            .metrics
            .add_bytes(conn.writer().bytes_sent() - before);

        match progress {
            WriteProgress::Complete => {
                self.table.metrics.inc_req();
                let keep = self.shutdown_deadline.is_none() && conn.finish_response();
                if !keep {
                    self.close(conn);
                    return;
                }
                self.timers
                    .adjust(id, Instant::now() + self.options.idle_timeout);
                if conn.has_buffered_input() {
                    self.dispatch(conn);
                } else {
                    self.rearm(conn, Interest::Read);
                }
            }
            WriteProgress::Pending => {
                self.timers
                    .adjust(id, Instant::now() + self.options.idle_timeout);
                self.rearm(conn, Interest::Write);
            }
            WriteProgress::Failed(e) => {
                debug!(conn = %id, error = %e, "write failed");
                self.close(conn);
            }
        }
    }

    fn dispatch(&mut self, conn: Box<Connection>) {
        // Not idle while a worker has it; the timer restarts on return.
        self.timers.cancel(conn.id());
        if let Err(conn) = self.dispatcher.submit(conn) {
            warn!(conn = %conn.id(), peer = %conn.peer(), "dispatch queue full, dropping connection");
            self.close(conn);
        }
    }

    fn rearm(&mut self, mut conn: Box<Connection>, interest: Interest) {
        match conn.arm(&self.epoll, interest) {
            Ok(()) => self.table.put_back(conn),
            Err(e) => {
                warn!(conn = %conn.id(), error = %e, "re-arm failed");
                self.close(conn);
            }
        }
    }

    /// Tear down a connection the reactor currently holds.
    fn close(&mut self, conn: Box<Connection>) {
        let id = conn.id();
        self.table.slab.remove(id);
        self.timers.cancel(id);
        self.table.teardown(conn);
    }

    fn drain_returns(&mut self) {
        for Returned { conn, rearmed } in self.returns.take() {
            if !matches!(self.table.slab.get(conn.id()), Some(Slot::InFlight)) {
                debug_assert!(false, "returned connection {} has no in-flight slot", conn.id());
                self.table.teardown(conn);
                continue;
            }
            let closing_reader =
                self.shutdown_deadline.is_some() && conn.armed() == Some(Interest::Read);
            if !rearmed || closing_reader {
                self.close(conn);
            } else {
                let id = conn.id();
                self.table.put_back(conn);
                self.start_idle_timer(id);
            }
        }
    }

    /// Stop accepting and drop connections that are only waiting for a
    /// request. Pending responses and in-flight work get `shutdown_grace`;
    /// the listening socket stays open (but unwatched) until they are done.
    fn begin_shutdown(&mut self) {
        info!(
            connections = self.table.slab.len(),
            grace_ms = self.options.shutdown_grace.as_millis() as u64,
            "shutting down"
        );
        self.accepting = false;
        if let Some(listener) = &self.listener {
            if let Err(e) = self.epoll.delete(listener.as_raw_fd()) {
                debug!(error = %e, "listener deregistration failed");
            }
        }

        for id in self.table.slab.ids() {
            let waiting = matches!(
                self.table.slab.get(id),
                Some(Slot::Idle(conn)) if conn.armed() == Some(Interest::Read)
            );
            if waiting {
                if let Some(conn) = self.table.take_idle(id) {
                    self.close(conn);
                }
            }
        }
        self.shutdown_deadline = Some(Instant::now() + self.options.shutdown_grace);
    }

    fn finish(mut self) {
        self.dispatcher.shutdown();
        for Returned { conn, .. } in self.returns.take() {
            self.close(conn);
        }
        for id in self.table.slab.ids() {
            if let Some(Slot::Idle(conn)) = self.table.slab.remove(id) {
                self.table.teardown(conn);
            }
        }
        self.timers.clear();
        self.listener = None;
        info!("reactor stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::CgiGateway;
    use std::collections::HashMap;
    use std::io::{Read, Write};
    use std::net::TcpStream;
    use std::thread;

    /// A reactor driven by hand from the test thread.
    struct Harness {
        reactor: Reactor,
        addr: SocketAddr,
        notifier: Notifier,
        service: Arc<Service>,
        metrics: Arc<ServerMetrics>,
        events: HashMap<u64, u32>,
        _root: tempfile::TempDir,
    }

    fn harness(workers: usize, queue_capacity: usize) -> Harness {
        let root = tempfile::tempdir().unwrap();
        std::fs::write(root.path().join("index.html"), b"home").unwrap();
        let listener =
            syscalls::create_listen_socket("127.0.0.1:0".parse().unwrap(), 16).unwrap();
        let addr = syscalls::local_addr(listener.as_raw_fd()).unwrap();
        let (pipe_rx, pipe_tx) = syscalls::create_pipe().unwrap();
        let notifier = Notifier::new(pipe_tx);
        let service = Arc::new(Service::new(root.path(), Arc::new(CgiGateway::default())));
        let metrics = Arc::new(ServerMetrics::new());
        let options = ReactorOptions {
            idle_timeout: Duration::from_secs(30),
            max_connections: 8,
            limits: ParserLimits::default(),
            max_keep_alive_requests: 100,
            shutdown_grace: Duration::from_millis(100),
            pool: PoolOptions {
                workers,
                queue_capacity,
                pin_workers: false,
                name: "reactor-test".to_string(),
            },
        };
        let reactor = Reactor::new(
            options,
            listener,
            pipe_rx,
            notifier.clone(),
            service.clone(),
            metrics.clone(),
            Arc::new(AtomicBool::new(false)),
        )
        .unwrap();
        Harness {
            reactor,
            addr,
            notifier,
            service,
            metrics,
            events: HashMap::new(),
            _root: root,
        }
    }

    impl Harness {
        fn connect(&mut self) -> (TcpStream, ConnId) {
            let stream = TcpStream::connect(self.addr).unwrap();
            stream
                .set_read_timeout(Some(Duration::from_secs(5)))
                .unwrap();
            let before = self.reactor.table.slab.ids();
            for _ in 0..200 {
                self.reactor.accept_all();
                let fresh = self.reactor.table.slab.ids().into_iter().find(|id| !before.contains(id));
                if let Some(id) = fresh {
                    return (stream, id);
                }
                thread::sleep(Duration::from_millis(5));
            }
            panic!("connection was never accepted");
        }

        /// Wait for readiness on `token`. Events for other tokens are kept
        /// for later calls, since one-shot registrations will not repeat them.
        fn wait_for(&mut self, token: u64) -> u32 {
            let mut batch = vec![epoll_event { events: 0, u64: 0 }; 16];
            for _ in 0..50 {
                if let Some(flags) = self.events.remove(&token) {
                    return flags;
                }
                let n = self.reactor.epoll.wait(&mut batch, 100).unwrap();
                for ev in &batch[..n] {
                    if ev.u64 != LISTENER_TOKEN {
                        *self.events.entry(ev.u64).or_default() |= ev.events;
                    }
                }
            }
            panic!("no event for token {token:#x}");
        }

        /// Run the event loop's handling of one connection event.
        fn handle(&mut self, id: ConnId) {
            let flags = self.wait_for(id.token());
            self.reactor.connection_event(id, flags);
        }

        /// Collect `id` from the return queue once its worker is done.
        fn collect(&mut self, id: ConnId) {
            for _ in 0..400 {
                self.reactor.drain_returns();
                if matches!(self.reactor.table.slab.get(id), Some(Slot::Idle(_))) {
                    return;
                }
                thread::sleep(Duration::from_millis(5));
            }
            panic!("{id} never came back from its worker");
        }

        fn armed(&self, id: ConnId) -> Option<Interest> {
            match self.reactor.table.slab.get(id) {
                Some(Slot::Idle(conn)) => conn.armed(),
                _ => None,
            }
        }

        /// What a worker does with a connection, run on this thread.
        fn serve_here(&self, conn: Box<Connection>) {
            serve(
                conn,
                &self.service,
                &self.reactor.epoll,
                &self.reactor.returns,
                &self.notifier,
            );
        }
    }

    fn read_until(stream: &mut TcpStream, suffix: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        let mut chunk = [0u8; 512];
        while !out.ends_with(suffix) {
            let n = stream.read(&mut chunk).unwrap();
            assert_ne!(n, 0, "closed before {:?}", String::from_utf8_lossy(suffix));
            out.extend_from_slice(&chunk[..n]);
        }
        out
    }

    fn assert_eof(stream: &mut TcpStream) {
        let mut buf = [0u8; 16];
        match stream.read(&mut buf) {
            Ok(0) => {}
            Ok(n) => panic!("expected EOF, got {n} bytes"),
            Err(e) if e.kind() == io::ErrorKind::ConnectionReset => {}
            Err(e) => panic!("expected EOF, got {e}"),
        }
    }

    const KEEP_ALIVE_GET: &[u8] = b"GET / HTTP/1.1\r\nConnection: keep-alive\r\n\r\n";

    #[test]
    fn test_request_round_trip_through_worker() {
        let mut h = harness(1, 16);
        let (mut client, id) = h.connect();
        assert_eq!(h.armed(id), Some(Interest::Read));
        assert!(h.reactor.timers.contains(id));

        client.write_all(KEEP_ALIVE_GET).unwrap();
        h.handle(id);
        h.collect(id);
        assert_eq!(h.armed(id), Some(Interest::Write));

        h.handle(id);
        let out = read_until(&mut client, b"home");
        assert!(out.starts_with(b"HTTP/1.1 200 OK\r\n"));
        assert_eq!(h.armed(id), Some(Interest::Read));
        assert_eq!(h.metrics.snapshot().requests, 1);
    }

    #[test]
    fn test_idle_timer_is_parked_while_in_flight() {
        let mut h = harness(1, 16);
        let (mut client, id) = h.connect();
        client.write_all(KEEP_ALIVE_GET).unwrap();
        h.handle(id);

        // Dispatched: no timer, and an eviction aimed at it is ignored.
        assert!(!h.reactor.timers.contains(id));
        h.reactor.table.evict(id);
        assert!(h.reactor.table.slab.get(id).is_some());
        let late = Instant::now() + Duration::from_secs(3600);
        assert_eq!(h.reactor.timers.sweep(late, &mut h.reactor.table), 0);

        // Back from the worker: the response still goes out.
        h.collect(id);
        assert!(h.reactor.timers.contains(id));
        h.handle(id);
        read_until(&mut client, b"home");
        assert_eq!(h.metrics.snapshot().timed_out, 0);

        // Idle again, so the restarted timer does apply.
        assert_eq!(h.reactor.timers.sweep(late, &mut h.reactor.table), 1);
        assert!(h.reactor.table.slab.get(id).is_none());
        assert_eq!(h.metrics.snapshot().timed_out, 1);
        assert_eof(&mut client);
    }

    #[test]
    fn test_event_for_returned_connection_is_collected_first() {
        let mut h = harness(1, 16);
        let (mut client, id) = h.connect();
        client.write_all(b"GET / HTTP/1.1\r\nConnection: keep-alive\r\n").unwrap();
        let flags = h.wait_for(id.token());

        // Half a request: the worker re-arms for reading and hands it back.
        let mut conn = h.reactor.table.take_idle(id).unwrap();
        conn.disarm();
        assert!(matches!(conn.read_available(), ReadProgress::Data(n) if n > 0));
        assert_ne!(flags & EPOLLIN as u32, 0);
        h.serve_here(conn);
        assert!(matches!(h.reactor.table.slab.get(id), Some(Slot::InFlight)));

        // The rest arrives before the reactor drained its return queue.
        client.write_all(b"\r\n").unwrap();
        h.handle(id);
        h.collect(id);
        h.handle(id);
        let out = read_until(&mut client, b"home");
        assert!(out.starts_with(b"HTTP/1.1 200 OK\r\n"));
    }

    #[test]
    fn test_stale_token_after_slot_reuse_is_ignored() {
        let mut h = harness(1, 16);
        let (old_client, old) = h.connect();
        let conn = h.reactor.table.take_idle(old).unwrap();
        h.reactor.close(conn);
        drop(old_client);

        let (_client, id) = h.connect();
        assert_eq!(id.index, old.index);
        assert_ne!(id.generation, old.generation);

        h.reactor.connection_event(old, (EPOLLIN | EPOLLHUP) as u32);
        assert_eq!(h.armed(id), Some(Interest::Read));
        assert!(h.reactor.timers.contains(id));
        assert_eq!(h.metrics.snapshot().active_connections, 1);
    }

    #[test]
    fn test_full_queue_drops_connection() {
        // No workers: the first job sits in the queue for good.
        let mut h = harness(0, 1);
        let (mut first, a) = h.connect();
        let (mut second, b) = h.connect();
        first.write_all(KEEP_ALIVE_GET).unwrap();
        second.write_all(KEEP_ALIVE_GET).unwrap();

        h.handle(a);
        assert_eq!(h.reactor.dispatcher.queued(), 1);
        h.handle(b);
        assert!(h.reactor.table.slab.get(b).is_none());
        assert!(!h.reactor.timers.contains(b));
        assert_eof(&mut second);

        assert!(matches!(h.reactor.table.slab.get(a), Some(Slot::InFlight)));
        assert_eq!(h.metrics.snapshot().active_connections, 1);
        first.set_nonblocking(true).unwrap();
        let mut buf = [0u8; 1];
        assert_eq!(
            first.read(&mut buf).unwrap_err().kind(),
            io::ErrorKind::WouldBlock
        );
    }

    #[test]
    fn test_unarmed_hand_back_wakes_reactor() {
        let mut h = harness(1, 16);
        let (mut client, id) = h.connect();
        let mut conn = h.reactor.table.take_idle(id).unwrap();
        conn.disarm();
        h.reactor
            .returns
            .hand_back(conn, None, &h.reactor.epoll, &h.notifier);

        h.wait_for(PIPE_TOKEN);
        let mut buf = [0u8; 8];
        let n = syscalls::read_nonblocking(h.reactor.pipe_rx.as_raw_fd(), &mut buf).unwrap();
        assert_eq!(&buf[..n], &[WAKE]);

        h.reactor.drain_returns();
        assert!(h.reactor.table.slab.get(id).is_none());
        assert_eq!(h.metrics.snapshot().active_connections, 0);
        assert_eof(&mut client);
    }

    #[test]
    fn test_rearmed_hand_back_stays_quiet() {
        let mut h = harness(1, 16);
        let (_client, id) = h.connect();
        let mut conn = h.reactor.table.take_idle(id).unwrap();
        conn.disarm();
        h.reactor
            .returns
            .hand_back(conn, Some(Interest::Read), &h.reactor.epoll, &h.notifier);

        let mut buf = [0u8; 8];
        let err = syscalls::read_nonblocking(h.reactor.pipe_rx.as_raw_fd(), &mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::WouldBlock);
        h.reactor.drain_returns();
        assert_eq!(h.armed(id), Some(Interest::Read));
        assert!(h.reactor.timers.contains(id));
    }

    #[test]
    fn test_shutdown_keeps_listener_until_finished() {
        let mut h = harness(1, 16);
        let (_client, _id) = h.connect();
        h.reactor.begin_shutdown();
        assert!(h.reactor.table.slab.is_empty());
        assert!(h.reactor.listener.is_some());

        // Still bound, but nothing is accepted any more.
        let late = TcpStream::connect(h.addr);
        h.reactor.accept_all();
        assert!(h.reactor.table.slab.is_empty());

        h.reactor.finish();
        drop(late);
        assert!(TcpStream::connect_timeout(&h.addr, Duration::from_millis(200)).is_err());
    }
}
