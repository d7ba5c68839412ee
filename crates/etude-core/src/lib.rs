// src/lib.rs
//! Multi-threaded HTTP/1.1 static file and CGI server on raw sockets and
//! epoll. One reactor thread owns the sockets; a bounded pool of workers
//! parses requests and stages responses.
pub mod buffer;
pub mod config;
pub mod conn;
pub mod error;
pub mod gateway;
pub mod http;
pub mod logging;
pub mod metrics;
pub mod mime;
pub mod parser;
pub mod pool;
pub mod reactor;
pub mod resource;
pub mod response;
pub mod server;
pub mod service;
pub mod slab;
pub mod syscalls;
pub mod timer;

// Re-exports for users
pub use config::ServerConfig;
pub use error::{EtudeError, EtudeResult};
pub use gateway::{CgiGateway, Gateway, GatewayError, GatewayRequest, GatewayResponse};
pub use http::{Method, Request, Status};
pub use metrics::{MetricsSnapshot, ServerMetrics};
pub use server::{Server, ShutdownHandle};
