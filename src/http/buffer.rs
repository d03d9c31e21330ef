//! Incremental HTTP message parser
//!
//! A `MessageBuffer` is fed raw bytes straight off a socket, in whatever
//! pieces the socket hands out, and assembles exactly one request or
//! response. Bytes past the end of the message are left unconsumed so
//! the caller can start the next buffer with them (pipelining).

use super::{
    names, Encoding, EncodingMap, Error, Headers, HttpRequest, HttpResponse, Method, Result,
    Status, Version, DEFAULT_MAX_HEADER_SIZE, IDENTITY,
};
use bytes::Bytes;
use std::sync::Arc;

/// Which side of the exchange a buffer parses
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    Request,
    Response,
}

/// A parsed request line or status line
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartLine {
    Request {
        method: Method,
        target: String,
        version: Version,
    },
    Response {
        version: Version,
        status: Status,
        reason: String,
    },
}

impl StartLine {
    pub fn version(&self) -> Version {
        match self {
            StartLine::Request { version, .. } | StartLine::Response { version, .. } => *version,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    StartLine,
    Headers,
    Body,
    Complete,
}

/// Parser state for one message on one socket
pub struct MessageBuffer {
    kind: MessageKind,
    state: State,
    line: Vec<u8>,
    head_size: usize,
    max_header_size: usize,
    start: Option<StartLine>,
    headers: Headers,
    content_length: usize,
    body: Vec<u8>,
    encodings: Arc<EncodingMap>,
    content_encoding: Option<Arc<dyn Encoding>>,
    accepted: Option<AcceptedEncodings>,
}

impl MessageBuffer {
    /// Create a buffer with no known encodings and the default header limit
    pub fn new(kind: MessageKind) -> Self {
        MessageBuffer {
            kind,
            state: State::StartLine,
            line: Vec::new(),
            head_size: 0,
            max_header_size: DEFAULT_MAX_HEADER_SIZE,
            start: None,
            headers: Headers::new(),
            content_length: 0,
            body: Vec::new(),
            encodings: Arc::new(EncodingMap::new()),
            content_encoding: None,
            accepted: None,
        }
    }

    /// Buffer for an inbound request (server side)
    pub fn request() -> Self {
        Self::new(MessageKind::Request)
    }

    /// Buffer for an inbound response (client side)
    pub fn response() -> Self {
        Self::new(MessageKind::Response)
    }

    /// Content encodings that may appear in `Content-Encoding`
    pub fn with_encodings(mut self, encodings: Arc<EncodingMap>) -> Self {
        self.encodings = encodings;
        self
    }

    /// Bound on the start line plus header block, in bytes
    pub fn with_max_header_size(mut self, max: usize) -> Self {
        self.max_header_size = max;
        self
    }

    /// Feed bytes to the parser
    ///
    /// Returns how many bytes of `data` belong to this message. Anything
    /// after that belongs to the next message on the connection. Once the
    /// buffer is complete every further call consumes nothing.
    pub fn feed(&mut self, data: &[u8]) -> Result<usize> {
        let mut consumed = 0;

        while consumed < data.len() {
            let rest = &data[consumed..];
            match self.state {
                State::StartLine | State::Headers => {
                    let (take, has_line) = match rest.iter().position(|&b| b == b'\n') {
                        Some(pos) => (pos + 1, true),
                        None => (rest.len(), false),
                    };
                    self.head_size += take;
                    if self.head_size > self.max_header_size {
                        return Err(Error::framing(
                            Status::BAD_REQUEST,
                            format!(
                                "Bad Request (header block exceeds {} bytes)",
                                self.max_header_size
                            ),
                        ));
                    }
                    self.line.extend_from_slice(&rest[..take]);
                    consumed += take;
                    if has_line {
                        self.take_line()?;
                    }
                }
                State::Body => {
                    let take = (self.content_length - self.body.len()).min(rest.len());
                    self.body.extend_from_slice(&rest[..take]);
                    consumed += take;
                    if self.body.len() == self.content_length {
                        self.state = State::Complete;
                    }
                }
                State::Complete => break,
            }
        }

        Ok(consumed)
    }

    fn take_line(&mut self) -> Result<()> {
        let mut raw = std::mem::take(&mut self.line);
        while matches!(raw.last(), Some(b'\n') | Some(b'\r')) {
            raw.pop();
        }
        let line = String::from_utf8_lossy(&raw);

        match self.state {
            State::StartLine => {
                // Stray blank lines before a message are tolerated
                if line.is_empty() {
                    return Ok(());
                }
                self.start = Some(match self.kind {
                    MessageKind::Request => parse_request_line(&line)?,
                    MessageKind::Response => parse_status_line(&line)?,
                });
                self.state = State::Headers;
            }
            State::Headers => {
                if line.is_empty() {
                    self.finish_head()?;
                } else if line.starts_with(' ') || line.starts_with('\t') {
                    self.headers.continue_last(&line)?;
                } else {
                    let (name, value) = Headers::parse_header_line(&line)?;
                    self.headers.append(&name, value);
                }
            }
            State::Body | State::Complete => {}
        }
        Ok(())
    }

    fn finish_head(&mut self) -> Result<()> {
        if let Some(te) = self.headers.get(names::TRANSFER_ENCODING) {
            if !te.trim().eq_ignore_ascii_case(IDENTITY) {
                return Err(Error::framing(
                    Status::BAD_REQUEST,
                    format!("Bad Request (unsupported Transfer-Encoding: {})", te),
                ));
            }
        }

        let declared = match self.headers.get(names::CONTENT_LENGTH) {
            Some(value) => Some(parse_content_length(value)?),
            None => None,
        };

        if let Some(StartLine::Request {
            method, version, ..
        }) = &self.start
        {
            if declared.is_none() && *method != Method::Get {
                return Err(Error::framing(
                    Status::PRECONDITION_FAILED,
                    "Precondition Failed (Content-Length header missing)",
                ));
            }
            if *version == Version::Http11 && !self.headers.contains(names::HOST) {
                return Err(Error::framing(
                    Status::PRECONDITION_FAILED,
                    "Precondition Failed (Host header missing)",
                ));
            }
            if let Some(value) = self.headers.get(names::ACCEPT_ENCODING) {
                self.accepted = Some(AcceptedEncodings::parse(value)?);
            }
        }

        if let Some(value) = self.headers.get(names::CONTENT_ENCODING) {
            let value = value.trim();
            if !value.eq_ignore_ascii_case(IDENTITY) {
                let encoding = self
                    .encodings
                    .get(value)
                    .ok_or_else(|| Error::UnsupportedEncoding(value.to_string()))?;
                self.content_encoding = Some(encoding);
            }
        }

        self.content_length = declared.unwrap_or(0);
        self.body.reserve_exact(self.content_length);
        self.state = if self.content_length == 0 {
            State::Complete
        } else {
            State::Body
        };
        Ok(())
    }

    /// Whether a full message has been assembled
    pub fn is_complete(&self) -> bool {
        self.state == State::Complete
    }

    /// Whether any byte of a message has been seen yet
    pub fn is_empty(&self) -> bool {
        self.state == State::StartLine && self.line.is_empty()
    }

    pub fn kind(&self) -> MessageKind {
        self.kind
    }

    /// The parsed start line, once available
    pub fn start_line(&self) -> Option<&StartLine> {
        self.start.as_ref()
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    /// Body bytes received so far, still content-encoded
    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// Declared body length; zero until the header block is parsed
    pub fn content_length(&self) -> usize {
        self.content_length
    }

    /// The non-identity content encoding of the body, if any
    pub fn content_encoding(&self) -> Option<&str> {
        self.content_encoding.as_ref().map(|e| e.name())
    }

    /// Ranked `Accept-Encoding` entries
    ///
    /// `None` means the header was absent, which is not the same as an
    /// empty header value.
    pub fn accepted_encodings(&self) -> Option<&AcceptedEncodings> {
        self.accepted.as_ref()
    }

    /// Whether the connection may carry another message after this one
    pub fn keep_alive(&self) -> bool {
        let Some(start) = &self.start else {
            return false;
        };
        if self.headers.has_token(names::CONNECTION, "close") {
            return false;
        }
        match start.version() {
            Version::Http11 => true,
            Version::Http10 => self.headers.has_token(names::CONNECTION, "keep-alive"),
        }
    }

    pub fn must_close(&self) -> bool {
        !self.keep_alive()
    }

    fn decoded_body(&self) -> Result<Bytes> {
        match &self.content_encoding {
            Some(encoding) => encoding.decode(&self.body).map(Bytes::from).map_err(|e| {
                Error::framing(
                    Status::BAD_REQUEST,
                    format!("Bad Request (cannot decode {} body: {})", encoding.name(), e),
                )
            }),
            None => Ok(Bytes::copy_from_slice(&self.body)),
        }
    }

    /// Convert a complete request buffer into a request with a decoded body
    ///
    /// The `Content-Encoding` header is dropped once the body is decoded.
    pub fn into_request(self) -> Result<HttpRequest> {
        if !self.is_complete() {
            return Err(Error::Incomplete);
        }
        let body = self.decoded_body()?;
        let Some(StartLine::Request {
            method,
            target,
            version,
        }) = self.start
        else {
            return Err(Error::Incomplete);
        };

        let mut request = HttpRequest::builder()
            .method(method)
            .uri(target)
            .version(version)
            .body(body)
            .build();
        *request.headers_mut() = self.headers;
        request.headers_mut().remove(names::CONTENT_ENCODING);
        Ok(request)
    }

    /// Convert a complete response buffer into a response with a decoded body
    pub fn into_response(self) -> Result<HttpResponse> {
        if !self.is_complete() {
            return Err(Error::Incomplete);
        }
        let body = self.decoded_body()?;
        let Some(StartLine::Response {
            version,
            status,
            reason,
        }) = self.start
        else {
            return Err(Error::Incomplete);
        };

        let mut response = HttpResponse::builder()
            .version(version)
            .status(status)
            .reason(reason)
            .body(body)
            .build();
        *response.headers_mut() = self.headers;
        response.headers_mut().remove(names::CONTENT_ENCODING);
        Ok(response)
    }
}

impl std::fmt::Debug for MessageBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageBuffer")
            .field("kind", &self.kind)
            .field("state", &self.state)
            .field("start", &self.start)
            .field("content_length", &self.content_length)
            .field("received", &self.body.len())
            .finish()
    }
}

/// Parse a request line
///
/// Format: METHOD TARGET VERSION
fn parse_request_line(line: &str) -> Result<StartLine> {
    let parts: Vec<&str> = line.split_whitespace().collect();
    if parts.len() != 3 {
        return Err(Error::framing(
            Status::BAD_REQUEST,
            format!("Bad Request (malformed request line: {:?})", line),
        ));
    }

    let method = Method::parse(parts[0]).ok_or_else(|| {
        Error::framing(
            Status::NOT_IMPLEMENTED,
            format!("Not Implemented (method {})", parts[0]),
        )
    })?;
    if parts[1] == "*" {
        return Err(Error::framing(
            Status::NOT_IMPLEMENTED,
            "Not Implemented (asterisk target)",
        ));
    }
    let version = Version::parse(parts[2]).ok_or_else(|| {
        Error::framing(
            Status::VERSION_NOT_SUPPORTED,
            format!("HTTP Version Not Supported ({})", parts[2]),
        )
    })?;

    Ok(StartLine::Request {
        method,
        target: parts[1].to_string(),
        version,
    })
}

/// Parse a status line
///
/// Format: VERSION CODE [REASON]
fn parse_status_line(line: &str) -> Result<StartLine> {
    let mut parts = line.splitn(3, ' ');
    let version = parts.next().unwrap_or_default();
    let code = parts.next().unwrap_or_default();

    let version = Version::parse(version).ok_or_else(|| {
        Error::framing(
            Status::VERSION_NOT_SUPPORTED,
            format!("HTTP Version Not Supported ({})", version),
        )
    })?;
    let status = code
        .parse::<u16>()
        .ok()
        .and_then(|c| Status::new(c).ok())
        .ok_or_else(|| {
            Error::framing(
                Status::BAD_REQUEST,
                format!("Bad Request (malformed status line: {:?})", line),
            )
        })?;
    let reason = match parts.next() {
        Some(r) if !r.trim().is_empty() => r.trim().to_string(),
        _ => status.reason_phrase().to_string(),
    };

    Ok(StartLine::Response {
        version,
        status,
        reason,
    })
}

/// Parse a (possibly merged) `Content-Length` value
fn parse_content_length(value: &str) -> Result<usize> {
    let mut length = None;
    for part in value.split(',') {
        let n = part.trim().parse::<usize>().map_err(|_| {
            Error::framing(
                Status::BAD_REQUEST,
                format!("Bad Request (invalid Content-Length: {})", value),
            )
        })?;
        match length {
            Some(prev) if prev != n => {
                return Err(Error::framing(
                    Status::BAD_REQUEST,
                    format!("Bad Request (conflicting Content-Length: {})", value),
                ))
            }
            _ => length = Some(n),
        }
    }
    length.ok_or_else(|| Error::framing(Status::BAD_REQUEST, "Bad Request (empty Content-Length)"))
}

/// Encodings a peer accepts, best first
///
/// Entries without an explicit `q` outrank every weighted entry, and
/// equal weights keep the order in which they appeared in the header.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AcceptedEncodings {
    entries: Vec<(String, Option<f32>)>,
}

impl AcceptedEncodings {
    /// Parse an `Accept-Encoding` header value
    pub fn parse(value: &str) -> Result<Self> {
        let mut entries: Vec<(String, Option<f32>)> = Vec::new();

        for element in value.split(',') {
            let element = element.trim();
            if element.is_empty() {
                continue;
            }

            let mut params = element.split(';');
            let name = params.next().unwrap_or_default().trim().to_ascii_lowercase();
            if name.is_empty() {
                return Err(bad_accept(value));
            }

            let mut weight = None;
            for param in params {
                let (key, q) = param.split_once('=').ok_or_else(|| bad_accept(value))?;
                if !key.trim().eq_ignore_ascii_case("q") {
                    return Err(bad_accept(value));
                }
                let q: f32 = q.trim().parse().map_err(|_| bad_accept(value))?;
                if !(0.0..=1.0).contains(&q) {
                    return Err(bad_accept(value));
                }
                weight = Some(q);
            }

            match entries.iter_mut().find(|(n, _)| *n == name) {
                Some(existing) => {
                    if rank(weight) > rank(existing.1) {
                        existing.1 = weight;
                    }
                }
                None => entries.push((name, weight)),
            }
        }

        // Stable, so equal weights stay in order of appearance
        entries.sort_by(|a, b| rank(b.1).total_cmp(&rank(a.1)));
        Ok(AcceptedEncodings { entries })
    }

    /// Iterate over `(name, weight)` pairs, best first
    pub fn iter(&self) -> impl Iterator<Item = (&str, Option<f32>)> {
        self.entries.iter().map(|(n, q)| (n.as_str(), *q))
    }

    /// Encoding names, best first
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(n, _)| n.as_str())
    }

    /// The weight recorded for `name`; `Some(None)` means no explicit `q`
    pub fn weight(&self, name: &str) -> Option<Option<f32>> {
        self.entries
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, q)| *q)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

fn rank(weight: Option<f32>) -> f32 {
    weight.unwrap_or(f32::INFINITY)
}

fn bad_accept(value: &str) -> Error {
    Error::framing(
        Status::BAD_REQUEST,
        format!("Bad Request (malformed Accept-Encoding: {})", value),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::encoding::testing::Reverse;

    fn framing_status(result: Result<usize>) -> u16 {
        match result {
            Err(e) => e.status().map(|s| s.code()).unwrap_or(0),
            Ok(_) => 0,
        }
    }

    #[test]
    fn test_simple_post() {
        let mut buffer = MessageBuffer::request();
        let data = b"POST /RPC2 HTTP/1.1\r\nHost: localhost\r\nContent-Length: 5\r\n\r\nhello";
        assert_eq!(buffer.feed(data).unwrap(), data.len());
        assert!(buffer.is_complete());

        let request = buffer.into_request().unwrap();
        assert_eq!(request.method(), Method::Post);
        assert_eq!(request.uri(), "/RPC2");
        assert_eq!(request.body().as_ref(), b"hello");
    }

    #[test]
    fn test_byte_at_a_time() {
        let data = b"POST /RPC2 HTTP/1.1\r\nHost: a\r\nContent-Length: 3\r\n\r\nabc";
        let mut buffer = MessageBuffer::request();
        for (i, byte) in data.iter().enumerate() {
            assert!(!buffer.is_complete(), "complete early at byte {}", i);
            assert_eq!(buffer.feed(std::slice::from_ref(byte)).unwrap(), 1);
        }
        assert!(buffer.is_complete());
        assert_eq!(buffer.body(), b"abc");
    }

    #[test]
    fn test_leftover_bytes_are_not_consumed() {
        let first = b"GET /a HTTP/1.1\r\nHost: x\r\n\r\n";
        let mut data = first.to_vec();
        data.extend_from_slice(b"GET /b HTTP/1.1\r\n");

        let mut buffer = MessageBuffer::request();
        assert_eq!(buffer.feed(&data).unwrap(), first.len());
        assert!(buffer.is_complete());

        let mut next = MessageBuffer::request();
        next.feed(&data[first.len()..]).unwrap();
        match next.start_line() {
            Some(StartLine::Request { target, .. }) => assert_eq!(target, "/b"),
            other => panic!("unexpected start line: {:?}", other),
        }
    }

    #[test]
    fn test_malformed_request_lines() {
        let mut buffer = MessageBuffer::request();
        assert_eq!(framing_status(buffer.feed(b"FOO /x\r\n")), 400);

        let mut buffer = MessageBuffer::request();
        assert_eq!(framing_status(buffer.feed(b"PUT / HTTP/1.1\r\n")), 501);

        let mut buffer = MessageBuffer::request();
        assert_eq!(framing_status(buffer.feed(b"GET / HTTP/2.0\r\n")), 505);

        let mut buffer = MessageBuffer::request();
        assert_eq!(framing_status(buffer.feed(b"GET * HTTP/1.1\r\n")), 501);
    }

    #[test]
    fn test_missing_required_headers() {
        let mut buffer = MessageBuffer::request();
        assert_eq!(
            framing_status(buffer.feed(b"POST / HTTP/1.1\r\nHost: x\r\n\r\n")),
            412
        );

        let mut buffer = MessageBuffer::request();
        assert_eq!(framing_status(buffer.feed(b"GET / HTTP/1.1\r\n\r\n")), 412);

        // HTTP/1.0 does not need Host
        let mut buffer = MessageBuffer::request();
        buffer.feed(b"GET / HTTP/1.0\r\n\r\n").unwrap();
        assert!(buffer.is_complete());
        assert!(buffer.must_close());
    }

    #[test]
    fn test_bad_content_length() {
        let mut buffer = MessageBuffer::request();
        assert_eq!(
            framing_status(buffer.feed(
                b"POST / HTTP/1.1\r\nHost: x\r\nContent-Length: 3\r\nContent-Length: 4\r\n\r\n"
            )),
            400
        );

        let mut buffer = MessageBuffer::request();
        assert_eq!(
            framing_status(buffer.feed(b"POST / HTTP/1.1\r\nHost: x\r\nContent-Length: -1\r\n\r\n")),
            400
        );

        // Identical duplicates are harmless
        let mut buffer = MessageBuffer::request();
        buffer
            .feed(b"POST / HTTP/1.1\r\nHost: x\r\nContent-Length: 2\r\nContent-Length: 2\r\n\r\nok")
            .unwrap();
        assert!(buffer.is_complete());
    }

    #[test]
    fn test_chunked_is_rejected() {
        let mut buffer = MessageBuffer::request();
        assert_eq!(
            framing_status(buffer.feed(
                b"POST / HTTP/1.1\r\nHost: x\r\nTransfer-Encoding: chunked\r\n\r\n"
            )),
            400
        );
    }

    #[test]
    fn test_header_size_limit() {
        let mut buffer = MessageBuffer::request().with_max_header_size(32);
        let result = buffer.feed(b"GET / HTTP/1.1\r\nHost: localhost\r\nX-Padding: aaaaaaaa\r\n");
        assert_eq!(framing_status(result), 400);
    }

    #[test]
    fn test_unknown_content_encoding() {
        let mut buffer = MessageBuffer::request();
        let result = buffer
            .feed(b"POST / HTTP/1.1\r\nHost: x\r\nContent-Encoding: br\r\nContent-Length: 1\r\n\r\n");
        assert_eq!(framing_status(result), 415);
    }

    #[test]
    fn test_known_content_encoding_is_decoded() {
        let mut map = EncodingMap::new();
        map.insert(Arc::new(Reverse("x-rev")));

        let mut buffer = MessageBuffer::request().with_encodings(Arc::new(map));
        buffer
            .feed(b"POST / HTTP/1.1\r\nHost: x\r\nContent-Encoding: X-Rev\r\nContent-Length: 3\r\n\r\ncba")
            .unwrap();
        assert_eq!(buffer.content_encoding(), Some("x-rev"));
        assert_eq!(buffer.body(), b"cba");

        let request = buffer.into_request().unwrap();
        assert_eq!(request.body().as_ref(), b"abc");
        assert!(!request.headers().contains("Content-Encoding"));
    }

    #[test]
    fn test_header_folding_and_merging() {
        let mut buffer = MessageBuffer::request();
        buffer
            .feed(b"GET / HTTP/1.1\r\nHost: x\r\nX-Long: one\r\n two\r\nX-Multi: a\r\nx-multi: b\r\n\r\n")
            .unwrap();
        assert_eq!(buffer.headers().get("X-Long"), Some("one two"));
        assert_eq!(buffer.headers().get("X-Multi"), Some("a, b"));
    }

    #[test]
    fn test_response_parsing() {
        let mut buffer = MessageBuffer::response();
        buffer
            .feed(b"HTTP/1.1 404 No Such Method\r\nContent-Length: 2\r\nConnection: close\r\n\r\nno")
            .unwrap();
        assert!(buffer.must_close());

        let response = buffer.into_response().unwrap();
        assert_eq!(response.status(), Status::NOT_FOUND);
        assert_eq!(response.reason(), "No Such Method");
        assert_eq!(response.body().as_ref(), b"no");
    }

    #[test]
    fn test_response_without_length_has_empty_body() {
        let mut buffer = MessageBuffer::response();
        buffer.feed(b"HTTP/1.1 200 OK\r\n\r\n").unwrap();
        assert!(buffer.is_complete());
        assert!(buffer.body().is_empty());
    }

    #[test]
    fn test_accept_encoding_ranking() {
        let accepted = AcceptedEncodings::parse("gzip;q=0.5, deflate;q=0.8, identity").unwrap();
        let order: Vec<_> = accepted.names().collect();
        assert_eq!(order, vec!["identity", "deflate", "gzip"]);
    }

    #[test]
    fn test_accept_encoding_unweighted_beats_explicit_one() {
        let accepted = AcceptedEncodings::parse("gzip;q=1.0, br").unwrap();
        let order: Vec<_> = accepted.names().collect();
        assert_eq!(order, vec!["br", "gzip"]);
    }

    #[test]
    fn test_accept_encoding_ties_keep_first_appearance() {
        let accepted = AcceptedEncodings::parse("b;q=0.5, a;q=0.5, c;q=0.5").unwrap();
        let order: Vec<_> = accepted.names().collect();
        assert_eq!(order, vec!["b", "a", "c"]);
    }

    #[test]
    fn test_accept_encoding_duplicates_keep_higher_weight() {
        let accepted = AcceptedEncodings::parse("GZIP;q=0.2, deflate;q=0.5, gzip").unwrap();
        assert_eq!(accepted.len(), 2);
        assert_eq!(accepted.weight("gzip"), Some(None));
        assert_eq!(accepted.names().next(), Some("gzip"));

        let accepted = AcceptedEncodings::parse("gzip, gzip;q=0.9").unwrap();
        assert_eq!(accepted.weight("gzip"), Some(None));
    }

    #[test]
    fn test_accept_encoding_malformed() {
        assert!(AcceptedEncodings::parse("gzip;q=1.5").is_err());
        assert!(AcceptedEncodings::parse("gzip;q=abc").is_err());
        assert!(AcceptedEncodings::parse("gzip;level=3").is_err());
        assert!(AcceptedEncodings::parse(";q=0.5").is_err());
        assert_eq!(AcceptedEncodings::parse("gzip,,deflate").unwrap().len(), 2);
    }

    #[test]
    fn test_absent_accept_encoding_differs_from_empty() {
        let mut absent = MessageBuffer::request();
        absent.feed(b"GET / HTTP/1.1\r\nHost: x\r\n\r\n").unwrap();
        assert!(absent.accepted_encodings().is_none());

        let mut empty = MessageBuffer::request();
        empty
            .feed(b"GET / HTTP/1.1\r\nHost: x\r\nAccept-Encoding: \r\n\r\n")
            .unwrap();
        assert!(empty.accepted_encodings().unwrap().is_empty());
    }

    #[test]
    fn test_completion_is_idempotent() {
        let mut buffer = MessageBuffer::request();
        buffer
            .feed(b"POST / HTTP/1.1\r\nHost: x\r\nAccept-Encoding: gzip\r\nContent-Length: 2\r\n\r\nhi")
            .unwrap();
        assert!(buffer.is_complete());

        let headers = buffer.headers().clone();
        let body = buffer.body().to_vec();
        let accepted = buffer.accepted_encodings().cloned();

        assert_eq!(buffer.feed(b"").unwrap(), 0);
        assert_eq!(buffer.feed(b"extra").unwrap(), 0);
        assert!(buffer.is_complete());
        assert_eq!(buffer.headers(), &headers);
        assert_eq!(buffer.body(), &body[..]);
        assert_eq!(buffer.accepted_encodings().cloned(), accepted);
    }

    #[test]
    fn test_keep_alive_rules() {
        let mut buffer = MessageBuffer::request();
        buffer
            .feed(b"GET / HTTP/1.0\r\nConnection: Keep-Alive\r\n\r\n")
            .unwrap();
        assert!(buffer.keep_alive());

        let mut buffer = MessageBuffer::request();
        buffer
            .feed(b"GET / HTTP/1.1\r\nHost: x\r\nConnection: close\r\n\r\n")
            .unwrap();
        assert!(buffer.must_close());
    }
}
