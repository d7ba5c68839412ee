// src/server.rs
use crate::config::ServerConfig;
use crate::error::{EtudeError, EtudeResult};
use crate::gateway::{CgiGateway, Gateway};
use crate::metrics::ServerMetrics;
use crate::pool::PoolOptions;
use crate::reactor::{Notifier, Reactor, ReactorOptions, TERMINATE, TICK};
use crate::service::Service;
use crate::syscalls;
use std::net::SocketAddr;
use std::os::fd::{AsRawFd, OwnedFd};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::info;

/// Asks a running server to stop. Safe to call from a signal handler
/// thread, more than once.
#[derive(Clone)]
pub struct ShutdownHandle {
    stop: Arc<AtomicBool>,
    notifier: Notifier,
}

impl ShutdownHandle {
    pub fn shutdown(&self) {
        self.stop.store(true, Ordering::Release);
        self.notifier.notify(TERMINATE);
    }

    pub fn is_shutdown(&self) -> bool {
        self.stop.load(Ordering::Acquire)
    }
}

/// A bound, not yet running server.
pub struct Server {
    config: ServerConfig,
    listener: OwnedFd,
    local_addr: SocketAddr,
    pipe_rx: OwnedFd,
    notifier: Notifier,
    stop: Arc<AtomicBool>,
    metrics: Arc<ServerMetrics>,
    gateway: Arc<dyn Gateway>,
}

impl Server {
    /// Validate `config` and bind the listening socket.
    pub fn bind(config: ServerConfig) -> EtudeResult<Self> {
        config.validate()?;
        let addr = config.socket_addr()?;
        let listener = syscalls::create_listen_socket(addr, config.backlog)?;
        let local_addr = syscalls::local_addr(listener.as_raw_fd())?;
        let (pipe_rx, pipe_tx) = syscalls::create_pipe()?;
        let gateway: Arc<dyn Gateway> = Arc::new(CgiGateway::new(config.cgi_max_output));

        Ok(Self {
            config,
            listener,
            local_addr,
            pipe_rx,
            notifier: Notifier::new(pipe_tx),
            stop: Arc::new(AtomicBool::new(false)),
            metrics: Arc::new(ServerMetrics::new()),
            gateway,
        })
    }

    /// Replace the default CGI gateway.
    pub fn gateway(mut self, gateway: Arc<dyn Gateway>) -> Self {
        self.gateway = gateway;
        self
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn metrics(&self) -> Arc<ServerMetrics> {
        self.metrics.clone()
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            stop: self.stop.clone(),
            notifier: self.notifier.clone(),
        }
    }

    /// Serve until a shutdown is requested. Blocks the calling thread, which
    /// becomes the reactor.
    pub fn run(self) -> EtudeResult<()> {
        let config = &self.config;
        let options = ReactorOptions {
            idle_timeout: config.idle_timeout(),
            max_connections: config.max_connections,
            limits: config.parser_limits(),
            max_keep_alive_requests: config.max_keep_alive_requests,
            shutdown_grace: config.shutdown_grace(),
            pool: PoolOptions {
                workers: config.workers,
                queue_capacity: config.queue_capacity,
                pin_workers: config.pin_workers,
                name: "etude-worker".to_string(),
            },
        };
        // Scripts run with their own directory as cwd; keep paths absolute.
        let doc_root = std::fs::canonicalize(&config.doc_root)?;
        let service = Arc::new(Service::new(doc_root, self.gateway.clone()));

        let reactor = Reactor::new(
            options,
            self.listener,
            self.pipe_rx,
            self.notifier.clone(),
            service,
            self.metrics.clone(),
            self.stop.clone(),
        )?;

        let notifier = self.notifier.clone();
        let ticker = spawn_periodic("etude-ticker", config.tick_interval(), move || {
            notifier.notify(TICK);
        })?;

        let reporter = match config.metrics_interval() {
            Some(interval) => {
                let metrics = self.metrics.clone();
                Some(spawn_periodic("etude-metrics", interval, move || {
                    let m = metrics.snapshot();
                    info!(
                        active = m.active_connections,
                        requests = m.requests,
                        bytes_sent = m.bytes_sent,
                        refused = m.refused,
                        timed_out = m.timed_out,
                        "metrics"
                    );
                })?)
            }
            None => None,
        };

        info!(
            addr = %self.local_addr,
            workers = config.workers,
            doc_root = %config.doc_root.display(),
            "etude listening"
        );
        let result = reactor.run();

        ticker.stop();
        if let Some(reporter) = reporter {
            reporter.stop();
        }
        info!("etude shut down");
        result
    }
}

/// Background thread running `tick` every `interval` until stopped.
struct Periodic {
    stop: Sender<()>,
    handle: JoinHandle<()>,
}

impl Periodic {
    fn stop(self) {
        drop(self.stop);
        let _ = self.handle.join();
    }
}

fn spawn_periodic<F>(name: &str, interval: Duration, mut tick: F) -> EtudeResult<Periodic>
where
    F: FnMut() + Send + 'static,
{
    let (stop, stopped) = mpsc::channel::<()>();
    let handle = thread::Builder::new()
        .name(name.to_string())
        .spawn(move || {
            loop {
                match stopped.recv_timeout(interval) {
                    Err(RecvTimeoutError::Timeout) => tick(),
                    _ => break,
                }
            }
        })
        .map_err(|source| EtudeError::WorkerSpawn {
            name: name.to_string(),
            source,
        })?;
    Ok(Periodic { stop, handle })
}
