// src/http.rs

pub const HTTP_VERSION: &str = "HTTP/1.1";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Method {
    #[default]
    Get,
    Post,
    Head,
    Put,
    Delete,
    Patch,
    Options,
    Trace,
    Connect,
}

impl Method {
    pub fn from_bytes(b: &[u8]) -> Option<Self> {
        match b {
            b"GET" => Some(Method::Get),
            b"POST" => Some(Method::Post),
            b"HEAD" => Some(Method::Head),
            b"PUT" => Some(Method::Put),
            b"DELETE" => Some(Method::Delete),
            b"PATCH" => Some(Method::Patch),
            b"OPTIONS" => Some(Method::Options),
            b"TRACE" => Some(Method::Trace),
            b"CONNECT" => Some(Method::Connect),
            _ => None,
        }
    }

    /// Methods the server actually answers. Everything else is rejected
    /// with 400 during request-line parsing.
    pub fn is_served(self) -> bool {
        matches!(self, Method::Get | Method::Post | Method::Head)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Post => "POST",
            Method::Head => "HEAD",
            Method::Put => "PUT",
            Method::Delete => "DELETE",
            Method::Patch => "PATCH",
            Method::Options => "OPTIONS",
            Method::Trace => "TRACE",
            Method::Connect => "CONNECT",
        }
    }
}

impl std::fmt::Display for Method {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Everything the parser extracts from one request.
///
/// Owned rather than borrowed from the read buffer: the buffer is compacted
/// and refilled while a request is still being assembled across reads.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Request {
    pub method: Method,
    /// Normalized, percent-decoded path. Always starts with `/`.
    pub path: String,
    pub query: Option<String>,
    pub version: String,
    pub host: Option<String>,
    pub content_length: usize,
    pub content_type: Option<String>,
    pub cookie: Option<String>,
    pub keep_alive: bool,
    /// Query string present or POST: resolved through the gateway when the
    /// target is executable.
    pub dynamic: bool,
    pub mime: &'static str,
    pub body: Vec<u8>,
}

impl Request {
    pub fn reset(&mut self) {
        *self = Request::default();
    }
}

/// Status codes the engine can emit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Ok,
    BadRequest,
    Forbidden,
    NotFound,
    InternalError,
}

impl Status {
    pub fn code(self) -> u16 {
        match self {
            Status::Ok => 200,
            Status::BadRequest => 400,
            Status::Forbidden => 403,
            Status::NotFound => 404,
            Status::InternalError => 500,
        }
    }

    pub fn status_line(self) -> &'static [u8] {
        match self {
            Status::Ok => b"HTTP/1.1 200 OK\r\n",
            Status::BadRequest => b"HTTP/1.1 400 Bad Request\r\n",
            Status::Forbidden => b"HTTP/1.1 403 Forbidden\r\n",
            Status::NotFound => b"HTTP/1.1 404 Not Found\r\n",
            Status::InternalError => b"HTTP/1.1 500 Internal Server Error\r\n",
        }
    }

    /// Small HTML page sent as the body of error responses, and for 200s on
    /// zero-length files.
    pub fn page(self) -> &'static [u8] {
        match self {
            Status::Ok => b"<html><head><meta charset=\"utf-8\"><title>200 OK</title></head><body><h2>200 OK</h2><p>Request success.</p><hr><em>etude</em></body></html>",
            Status::BadRequest => b"<html><head><meta charset=\"utf-8\"><title>400 Bad Request</title></head><body><h2>400 Bad Request</h2><p>Your request has bad syntax or is inherently impossible to satisfy.</p><hr><em>etude</em></body></html>",
            Status::Forbidden => b"<html><head><meta charset=\"utf-8\"><title>403 Forbidden</title></head><body><h2>403 Forbidden</h2><p>You do not have permission to get this resource from this server.</p><hr><em>etude</em></body></html>",
            Status::NotFound => b"<html><head><meta charset=\"utf-8\"><title>404 Not Found</title></head><body><h2>404 Not Found</h2><p>The requested resource was not found on this server.</p><hr><em>etude</em></body></html>",
            Status::InternalError => b"<html><head><meta charset=\"utf-8\"><title>500 Internal Error</title></head><body><h2>500 Internal Error</h2><p>There was an unusual problem serving the requested resource.</p><hr><em>etude</em></body></html>",
        }
    }
}
