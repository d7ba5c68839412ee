// src/config.rs
use crate::error::{EtudeError, EtudeResult};
use crate::parser::{DEFAULT_MAX_CONTENT_LENGTH, DEFAULT_MAX_LINE_LENGTH, ParserLimits};
use crate::slab;
use serde::Deserialize;
use std::net::{IpAddr, SocketAddr, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Server configuration, usually loaded from the `[server]` table of a TOML
/// file. Every field has a default, so an empty file is a valid config.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct ServerConfig {
    /// Listen address (default: 0.0.0.0)
    pub host: String,

    /// Listen port (default: 10000)
    pub port: u16,

    /// Directory static files and scripts are served from (default: ./resources)
    pub doc_root: PathBuf,

    /// Worker threads (default: number of CPUs)
    pub workers: usize,

    /// Ready connections that may wait for a worker before new ones are dropped
    pub queue_capacity: usize,

    /// Listen backlog
    pub backlog: i32,

    /// Concurrent connections; accepts above this are refused
    pub max_connections: usize,

    /// Idle connections are closed after this many seconds
    pub idle_timeout_secs: u64,

    /// How often idle timers are swept
    pub tick_interval_secs: u64,

    /// Largest accepted `Content-Length`
    pub max_content_length: usize,

    /// Longest accepted request line or header line
    pub max_line_length: usize,

    /// Requests served on one connection before it is closed
    pub max_keep_alive_requests: u32,

    /// Pin workers to CPU cores
    pub pin_workers: bool,

    /// Log a metrics line this often; 0 disables the reporter
    pub metrics_interval_secs: u64,

    /// How long shutdown waits for in-flight responses
    pub shutdown_grace_ms: u64,

    /// Cap on the output of a gateway script
    pub cgi_max_output: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 10000,
            doc_root: PathBuf::from("./resources"),
            workers: num_cpus::get(),
            queue_capacity: 10_000,
            backlog: 1024,
            max_connections: 65_536,
            idle_timeout_secs: 15,
            tick_interval_secs: 5,
            max_content_length: DEFAULT_MAX_CONTENT_LENGTH,
            max_line_length: DEFAULT_MAX_LINE_LENGTH,
            max_keep_alive_requests: 10_000,
            pin_workers: false,
            metrics_interval_secs: 0,
            shutdown_grace_ms: 2_000,
            cgi_max_output: crate::gateway::DEFAULT_MAX_OUTPUT,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct ConfigFile {
    #[serde(default)]
    server: ServerConfig,
}

impl ServerConfig {
    /// Parse a TOML document with a `[server]` table.
    pub fn from_toml_str(s: &str) -> EtudeResult<Self> {
        let file: ConfigFile = toml::from_str(s).map_err(|e| EtudeError::Config(e.to_string()))?;
        Ok(file.server)
    }

    pub fn from_file(path: &Path) -> EtudeResult<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| EtudeError::Config(format!("{}: {e}", path.display())))?;
        Self::from_toml_str(&text)
    }

    /// Reject values the server cannot run with.
    pub fn validate(&self) -> EtudeResult<()> {
        let nonzero = [
            ("workers", self.workers as u64),
            ("queue_capacity", self.queue_capacity as u64),
            ("max_connections", self.max_connections as u64),
            ("idle_timeout_secs", self.idle_timeout_secs),
            ("tick_interval_secs", self.tick_interval_secs),
            ("max_line_length", self.max_line_length as u64),
            ("max_keep_alive_requests", u64::from(self.max_keep_alive_requests)),
        ];
        if let Some((name, _)) = nonzero.iter().find(|(_, v)| *v == 0) {
            return Err(EtudeError::Config(format!("{name} must be greater than zero")));
        }
        if self.max_connections > slab::MAX_CAPACITY {
            return Err(EtudeError::Config(format!(
                "max_connections must be at most {}",
                slab::MAX_CAPACITY
            )));
        }
        if self.backlog <= 0 {
            return Err(EtudeError::Config("backlog must be greater than zero".into()));
        }
        if !self.doc_root.is_dir() {
            return Err(EtudeError::Config(format!(
                "doc_root {} is not a directory",
                self.doc_root.display()
            )));
        }
        Ok(())
    }

    /// Resolve `host:port`. IP literals are used as is; names go through the
    /// system resolver and the first address wins.
    pub fn socket_addr(&self) -> EtudeResult<SocketAddr> {
        if let Ok(ip) = self.host.parse::<IpAddr>() {
            return Ok(SocketAddr::new(ip, self.port));
        }
        (self.host.as_str(), self.port)
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| EtudeError::Config(format!("host {} did not resolve", self.host)))
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs(self.tick_interval_secs)
    }

    pub fn metrics_interval(&self) -> Option<Duration> {
        (self.metrics_interval_secs > 0).then(|| Duration::from_secs(self.metrics_interval_secs))
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }

    pub fn parser_limits(&self) -> ParserLimits {
        ParserLimits {
            max_content_length: self.max_content_length,
            max_line_length: self.max_line_length,
        }
    }
}
