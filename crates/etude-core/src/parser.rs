// src/parser.rs
use crate::buffer::Buffer;
use crate::http::{HTTP_VERSION, Method, Request};
use crate::mime;
use memchr::memchr2;
use tracing::debug;

pub const DEFAULT_MAX_CONTENT_LENGTH: usize = 8 * 1024 * 1024;
pub const DEFAULT_MAX_LINE_LENGTH: usize = 8 * 1024;

/// Result of feeding the parser whatever is currently buffered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseOutcome {
    /// The request is not complete yet; wait for the next read.
    NeedMoreData,
    /// A full request (line, headers and body) has been parsed.
    Complete,
    /// Protocol error. Answered with 400.
    Malformed,
    /// The request could not be held in memory. Answered with 500.
    InternalError,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseState {
    RequestLine,
    Headers,
    Content,
    /// A terminal outcome was reached; only `reset` leaves this state.
    Done,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LineStatus {
    Complete,
    Malformed,
    Incomplete,
}

/// Why a line was rejected. Only used for logging.
#[derive(Debug)]
struct Malformed(&'static str);

#[derive(Debug, Clone, Copy)]
pub struct ParserLimits {
    pub max_content_length: usize,
    pub max_line_length: usize,
}

impl Default for ParserLimits {
    fn default() -> Self {
        Self {
            max_content_length: DEFAULT_MAX_CONTENT_LENGTH,
            max_line_length: DEFAULT_MAX_LINE_LENGTH,
        }
    }
}

/// Incremental HTTP/1.1 request parser.
///
/// Consumes bytes from a connection's read buffer as they arrive; any split
/// of the input across calls reaches the same outcome as a single call with
/// the whole request.
#[derive(Debug)]
pub struct HttpParser {
    state: ParseState,
    line: Vec<u8>,
    request: Request,
    limits: ParserLimits,
    outcome: Option<ParseOutcome>,
    content_length_seen: bool,
}

impl HttpParser {
    pub fn new(limits: ParserLimits) -> Self {
        Self {
            state: ParseState::RequestLine,
            line: Vec::with_capacity(128),
            request: Request::default(),
            limits,
            outcome: None,
            content_length_seen: false,
        }
    }

    pub fn state(&self) -> ParseState {
        self.state
    }

    pub fn request(&self) -> &Request {
        &self.request
    }

    /// Prepare for the next request on a kept-alive connection.
    pub fn reset(&mut self) {
        self.state = ParseState::RequestLine;
        self.line.clear();
        self.request.reset();
        self.outcome = None;
        self.content_length_seen = false;
    }

    /// Advance the state machine over everything readable in `buf`.
    /// Consumed bytes are retired from the buffer; bytes past the end of a
    /// complete request are left in place.
    pub fn parse(&mut self, buf: &mut Buffer) -> ParseOutcome {
        if let Some(outcome) = self.outcome {
            return outcome;
        }
        let outcome = self.run(buf);
        if outcome != ParseOutcome::NeedMoreData {
            self.state = ParseState::Done;
            self.outcome = Some(outcome);
        }
        outcome
    }

    fn run(&mut self, buf: &mut Buffer) -> ParseOutcome {
        loop {
            if self.state == ParseState::Content {
                return self.parse_content(buf);
            }

            match self.scan_line(buf) {
                LineStatus::Incomplete => {
                    if self.line.len() > self.limits.max_line_length {
                        debug!(len = self.line.len(), "request line or header too long");
                        return ParseOutcome::Malformed;
                    }
                    return ParseOutcome::NeedMoreData;
                }
                LineStatus::Malformed => {
                    debug!("bad line terminator");
                    return ParseOutcome::Malformed;
                }
                LineStatus::Complete => {}
            }

            if self.line.len() > self.limits.max_line_length {
                debug!(len = self.line.len(), "request line or header too long");
                return ParseOutcome::Malformed;
            }

            let line = std::mem::take(&mut self.line);
            let step = match self.state {
                ParseState::RequestLine => self.parse_request_line(&line).map(|()| None),
                ParseState::Headers => self.parse_header(&line),
                ParseState::Content | ParseState::Done => Ok(Some(ParseOutcome::InternalError)),
            };
            // Hand the allocation back for the next line.
            self.line = line;
            self.line.clear();

            match step {
                Ok(None) => continue,
                Ok(Some(outcome)) => return outcome,
                Err(Malformed(reason)) => {
                    debug!(reason, "malformed request");
                    return ParseOutcome::Malformed;
                }
            }
        }
    }

    /// Move bytes up to the next line terminator into `self.line`.
    ///
    /// A `CR` that is the last buffered byte stays in the buffer until the
    /// byte after it arrives.
    fn scan_line(&mut self, buf: &mut Buffer) -> LineStatus {
        let (consumed, status) = {
            let data = buf.peek();
            match memchr2(b'\r', b'\n', data) {
                None => {
                    self.line.extend_from_slice(data);
                    (data.len(), LineStatus::Incomplete)
                }
                Some(i) => {
                    self.line.extend_from_slice(&data[..i]);
                    if data[i] == b'\n' {
                        (i, LineStatus::Malformed)
                    } else {
                        match data.get(i + 1) {
                            None => (i, LineStatus::Incomplete),
                            Some(b'\n') => (i + 2, LineStatus::Complete),
                            Some(_) => (i, LineStatus::Malformed),
                        }
                    }
                }
            }
        };
        buf.retrieve(consumed);
        status
    }

    fn parse_request_line(&mut self, line: &[u8]) -> Result<(), Malformed> {
        let text = std::str::from_utf8(line).map_err(|_| Malformed("request line is not UTF-8"))?;
        let mut parts = text.split_ascii_whitespace();
        let (Some(method), Some(target), Some(version), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(Malformed("request line must have three parts"));
        };

        let method = Method::from_bytes(method.as_bytes())
            .filter(|m| m.is_served())
            .ok_or(Malformed("unsupported method"))?;
        if version != HTTP_VERSION {
            return Err(Malformed("unsupported protocol version"));
        }

        let (path, query) = normalize_target(target)?;

        let req = &mut self.request;
        req.method = method;
        req.dynamic = query.is_some() || method == Method::Post;
        req.mime = mime::from_path(&path);
        req.path = path;
        req.query = query;
        req.version = version.to_string();

        self.state = ParseState::Headers;
        Ok(())
    }

    /// Returns `Some(outcome)` when the header section ends the request.
    fn parse_header(&mut self, line: &[u8]) -> Result<Option<ParseOutcome>, Malformed> {
        if line.is_empty() {
            if self.request.content_length == 0 {
                return Ok(Some(ParseOutcome::Complete));
            }
            if self.request.body.try_reserve_exact(self.request.content_length).is_err() {
                return Ok(Some(ParseOutcome::InternalError));
            }
            self.state = ParseState::Content;
            return Ok(None);
        }

        let Some(colon) = line.iter().position(|&b| b == b':') else {
            debug!(line = %String::from_utf8_lossy(line), "ignoring header line without ':'");
            return Ok(None);
        };
        let name = String::from_utf8_lossy(&line[..colon]);
        let name = name.trim();
        let value = String::from_utf8_lossy(&line[colon + 1..]);
        let value = value.trim_matches(|c| c == ' ' || c == '\t');

        let req = &mut self.request;
        if name.eq_ignore_ascii_case("connection") {
            for token in value.split(',').map(str::trim) {
                if token.eq_ignore_ascii_case("keep-alive") {
                    req.keep_alive = true;
                } else if token.eq_ignore_ascii_case("close") {
                    req.keep_alive = false;
                }
            }
        } else if name.eq_ignore_ascii_case("content-length") {
            // `usize::from_str` would take a leading '+'.
            if value.is_empty() || !value.bytes().all(|b| b.is_ascii_digit()) {
                return Err(Malformed("invalid Content-Length"));
            }
            let len: usize = value
                .parse()
                .map_err(|_| Malformed("invalid Content-Length"))?;
            if self.content_length_seen && len != req.content_length {
                return Err(Malformed("conflicting Content-Length"));
            }
            if len > self.limits.max_content_length {
                return Err(Malformed("Content-Length above limit"));
            }
            req.content_length = len;
            self.content_length_seen = true;
        } else if name.eq_ignore_ascii_case("content-type") {
            req.content_type = Some(value.to_string());
        } else if name.eq_ignore_ascii_case("host") {
            req.host = Some(value.to_string());
        } else if name.eq_ignore_ascii_case("cookie") {
            req.cookie = Some(value.to_string());
        } else {
            debug!(header = %name, "ignoring unknown header");
        }
        Ok(None)
    }

    fn parse_content(&mut self, buf: &mut Buffer) -> ParseOutcome {
        let req = &mut self.request;
        let missing = req.content_length - req.body.len();
        let take = missing.min(buf.readable_bytes());
        req.body.extend_from_slice(&buf.peek()[..take]);
        buf.retrieve(take);

        if req.body.len() == req.content_length {
            ParseOutcome::Complete
        } else {
            ParseOutcome::NeedMoreData
        }
    }
}

/// Reduce a request target to `(path, query)`.
///
/// Absolute-form targets lose their scheme and authority, the query string
/// is split off, the path is percent-decoded and directory paths get
/// `index.html` appended.
fn normalize_target(target: &str) -> Result<(String, Option<String>), Malformed> {
    let mut target = target.to_string();
    let scheme_len = ["http://", "https://"]
        .iter()
        .find(|scheme| {
            target.len() >= scheme.len() && target[..scheme.len()].eq_ignore_ascii_case(scheme)
        })
        .map(|scheme| scheme.len());
    if let Some(scheme_len) = scheme_len {
        let rest = &target[scheme_len..];
        target = match rest.find(['/', '?']) {
            Some(i) if rest.as_bytes()[i] == b'/' => rest[i..].to_string(),
            Some(i) => format!("/{}", &rest[i..]),
            None => "/".to_string(),
        };
    }

    let (raw_path, query) = match target.split_once('?') {
        Some((path, query)) => (path, Some(query.to_string())),
        None => (target.as_str(), None),
    };
    if !raw_path.is_empty() && !raw_path.starts_with('/') {
        return Err(Malformed("request target must be an absolute path"));
    }

    let mut path = percent_decode(raw_path)?;
    if path.is_empty() {
        path.push_str("/index.html");
    } else if path.ends_with('/') {
        path.push_str("index.html");
    }
    Ok((path, query))
}

fn percent_decode(input: &str) -> Result<String, Malformed> {
    let bytes = input.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'%' => {
                let hex = bytes
                    .get(i + 1..i + 3)
                    .ok_or(Malformed("truncated percent escape"))?;
                let hi = hex_value(hex[0]).ok_or(Malformed("invalid percent escape"))?;
                let lo = hex_value(hex[1]).ok_or(Malformed("invalid percent escape"))?;
                out.push(hi << 4 | lo);
                i += 3;
            }
            b => {
                out.push(b);
                i += 1;
            }
        }
    }
    if out.contains(&0) {
        return Err(Malformed("NUL byte in path"));
    }
    String::from_utf8(out).map_err(|_| Malformed("decoded path is not UTF-8"))
}

fn hex_value(b: u8) -> Option<u8> {
    match b {
        b'0'..=b'9' => Some(b - b'0'),
        b'a'..=b'f' => Some(b - b'a' + 10),
        b'A'..=b'F' => Some(b - b'A' + 10),
        _ => None,
    }
}
