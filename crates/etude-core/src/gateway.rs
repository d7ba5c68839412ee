// src/gateway.rs
use crate::http::{HTTP_VERSION, Method};
use std::io::{self, Read, Write};
use std::path::Path;
use std::process::{Command, Stdio};
use std::time::Duration;
use tracing::{debug, warn};

pub const DEFAULT_MAX_OUTPUT: usize = 1024 * 1024;

/// Everything a dynamic handler gets to see about one request.
#[derive(Debug, Clone, Copy)]
pub struct GatewayRequest<'a> {
    /// Resolved executable on disk.
    pub script: &'a Path,
    pub doc_root: &'a Path,
    pub method: Method,
    /// Request path as the client sent it, after normalization.
    pub path: &'a str,
    pub query: &'a str,
    pub body: &'a [u8],
    pub content_type: Option<&'a str>,
    pub cookie: Option<&'a str>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GatewayResponse {
    pub body: Vec<u8>,
    /// Overrides the MIME type derived from the request path.
    pub content_type: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("failed to start {script}: {source}")]
    Spawn {
        script: String,
        #[source]
        source: io::Error,
    },
    #[error("I/O with script failed: {0}")]
    Io(#[from] io::Error),
    #[error("script exited with status {0:?}")]
    Exit(Option<i32>),
    #[error("script output exceeds {0} bytes")]
    OutputTooLarge(usize),
}

/// Dynamic-content collaborator. Implementations run on worker threads.
pub trait Gateway: Send + Sync {
    fn invoke(&self, req: &GatewayRequest<'_>) -> Result<GatewayResponse, GatewayError>;
}

/// Runs the resolved target as a CGI/1.1 program.
///
/// The request body is written to the child's stdin, stdout becomes the
/// response. A leading header block (`Name: value` lines up to a blank line)
/// is stripped; of its fields only `Content-Type` is honored.
#[derive(Debug, Clone)]
pub struct CgiGateway {
    max_output: usize,
}

impl CgiGateway {
    pub fn new(max_output: usize) -> Self {
        Self { max_output }
    }

    fn command(&self, req: &GatewayRequest<'_>) -> Command {
        let mut cmd = Command::new(req.script);
        cmd.env_clear()
            .env("GATEWAY_INTERFACE", "CGI/1.1")
            .env("SERVER_PROTOCOL", HTTP_VERSION)
            .env("SERVER_SOFTWARE", "etude")
            .env("REQUEST_METHOD", req.method.as_str())
            .env("SCRIPT_NAME", req.path)
            .env("DOCUMENT_ROOT", req.doc_root)
            .env("QUERY_STRING", req.query)
            .env("CONTENT_LENGTH", req.body.len().to_string())
            .env("CONTENT_TYPE", req.content_type.unwrap_or(""))
            .env("HTTP_COOKIE", req.cookie.unwrap_or(""))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null());
        if let Some(path) = std::env::var_os("PATH") {
            cmd.env("PATH", path);
        }
        if let Some(dir) = req.script.parent() {
            cmd.current_dir(dir);
        }
        cmd
    }

    fn spawn(&self, req: &GatewayRequest<'_>) -> Result<std::process::Child, GatewayError> {
        let mut attempts = 0;
        loop {
            match self.command(req).spawn() {
                Ok(child) => return Ok(child),
                // Another thread's fork may still hold a freshly written
                // script open for writing.
                Err(e) if e.raw_os_error() == Some(libc::ETXTBSY) && attempts < 5 => {
                    attempts += 1;
                    std::thread::sleep(Duration::from_millis(10));
                }
                Err(source) => {
                    return Err(GatewayError::Spawn {
                        script: req.script.display().to_string(),
                        source,
                    });
                }
            }
        }
    }
}

impl Default for CgiGateway {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_OUTPUT)
    }
}

impl Gateway for CgiGateway {
    fn invoke(&self, req: &GatewayRequest<'_>) -> Result<GatewayResponse, GatewayError> {
        let mut child = self.spawn(req)?;
        let mut stdin = child.stdin.take();
        let mut stdout = child
            .stdout
            .take()
            .ok_or_else(|| io::Error::other("child stdout not captured"))?;

        let limit = self.max_output;
        let (written, output) = std::thread::scope(|s| {
            // Feed stdin concurrently so a script that writes before reading
            // everything cannot deadlock against us.
            let feeder = s.spawn(move || -> io::Result<()> {
                if let Some(mut stdin) = stdin.take() {
                    match stdin.write_all(req.body) {
                        // Scripts may ignore their input.
                        Err(e) if e.kind() == io::ErrorKind::BrokenPipe => {}
                        other => other?,
                    }
                }
                Ok(())
            });

            let mut output = Vec::new();
            let read = (&mut stdout)
                .take(limit as u64 + 1)
                .read_to_end(&mut output);
            if read.is_err() || output.len() > limit {
                // Unblocks the feeder too: its writes now fail with EPIPE.
                let _ = child.kill();
            }
            (feeder.join(), read.map(|_| output))
        });

        let output = match output {
            Ok(output) if output.len() > limit => {
                let _ = child.wait();
                warn!(script = %req.script.display(), limit, "script output too large");
                return Err(GatewayError::OutputTooLarge(limit));
            }
            Ok(output) => output,
            Err(e) => {
                let _ = child.wait();
                return Err(e.into());
            }
        };
        match written {
            Ok(result) => result?,
            Err(_) => return Err(io::Error::other("stdin feeder panicked").into()),
        }

        let status = child.wait()?;
        if !status.success() {
            debug!(script = %req.script.display(), ?status, "script failed");
            return Err(GatewayError::Exit(status.code()));
        }

        Ok(split_cgi_output(output))
    }
}

/// Separate an optional CGI header block from the body.
fn split_cgi_output(output: Vec<u8>) -> GatewayResponse {
    let Some((head_len, sep_len)) = find_blank_line(&output) else {
        return GatewayResponse {
            body: output,
            content_type: None,
        };
    };

    let head = &output[..head_len];
    let mut content_type = None;
    for line in head.split(|&b| b == b'\n') {
        let line = line.strip_suffix(b"\r").unwrap_or(line);
        let Some(colon) = line.iter().position(|&b| b == b':') else {
            return GatewayResponse {
                body: output,
                content_type: None,
            };
        };
        let name = &line[..colon];
        if name.is_empty() || !name.iter().all(|b| b.is_ascii_alphanumeric() || *b == b'-') {
            return GatewayResponse {
                body: output,
                content_type: None,
            };
        }
        if name.eq_ignore_ascii_case(b"content-type") {
            let value = String::from_utf8_lossy(&line[colon + 1..]).trim().to_string();
            content_type = Some(value);
        }
    }

    let mut body = output;
    body.drain(..head_len + sep_len);
    GatewayResponse { body, content_type }
}

/// Offset of the first empty line and the length of its terminator run.
fn find_blank_line(data: &[u8]) -> Option<(usize, usize)> {
    let crlf = memchr::memmem::find(data, b"\r\n\r\n").map(|i| (i, 4));
    let lf = memchr::memmem::find(data, b"\n\n").map(|i| (i, 2));
    match (crlf, lf) {
        (Some(a), Some(b)) => Some(if a.0 <= b.0 { a } else { b }),
        (a, b) => a.or(b),
    }
}
