//! HTTP/1.1 framing.
//!
//! # Responsibilities
//! - Client role writes requests, remote role writes responses
//! - Map sigil headers (`@foo-bar`) to `X-Foo-Bar` and back
//! - Route service calls through `/api/<id>/<name>` paths
//! - Yield a chunk only once the head and the declared body are buffered
//!
//! # Design Decisions
//! - Bodies are always sized by `Content-Length`; no chunked transfer
//! - A malformed or oversized request is answered with a 4xx response and
//!   the buffer is dropped; the connection stays open
//! - `close` has no closing bytes on this framing

use crate::codec::{HeaderMap, Value};
use crate::protocol::head::{self, MAX_HEAD_BYTES};
use crate::protocol::ws::DEFAULT_MAX_MESSAGE_BYTES;
use crate::protocol::{Chunk, CloseStatus, Protocol, Received, Role};

/// Real HTTP headers carried verbatim.
const PASS_THROUGH: [&str; 6] = [
    "Content-Type",
    "Cache-Control",
    "Location",
    "Access-Control-Allow-Origin",
    "Access-Control-Allow-Methods",
    "Access-Control-Allow-Headers",
];

/// Sigil headers that describe the start line instead of a field.
const START_LINE_KEYS: [&str; 3] = ["@method", "@url", "@status"];

const API_PREFIX: &str = "/api/";

pub struct HttpProtocol {
    role: Role,
    max_message_bytes: usize,
    buffer: Vec<u8>,
    closed: bool,
}

impl HttpProtocol {
    pub fn new(role: Role) -> Self {
        Self::with_limit(role, DEFAULT_MAX_MESSAGE_BYTES)
    }

    pub fn with_limit(role: Role, max_message_bytes: usize) -> Self {
        Self {
            role,
            max_message_bytes,
            buffer: Vec::new(),
            closed: false,
        }
    }

    fn request_line(headers: &HeaderMap) -> String {
        let text = |key: &str| headers.get(key).and_then(Value::as_str);
        if let Some(id) = text("@service-id") {
            if let Some(method) = text("@service-method") {
                return format!("GET {}{}/{} HTTP/1.1", API_PREFIX, encode_segment(id), encode_segment(method));
            }
            if let Some(event) = text("@service-event") {
                return format!("POST {}{}/{} HTTP/1.1", API_PREFIX, encode_segment(id), encode_segment(event));
            }
        }
        let method = text("@method").unwrap_or("POST").to_ascii_uppercase();
        let url = text("@url").unwrap_or("/");
        format!("{} {} HTTP/1.1", method, url)
    }

    /// Answer a bad request head and drop whatever is buffered.
    fn reject(&mut self, received: &mut Received, status: u16) {
        tracing::debug!(role = %self.role, status, "Rejecting malformed HTTP message");
        self.buffer.clear();
        match self.role {
            Role::Remote => {
                let fields = vec![
                    ("Connection".to_string(), "keep-alive".to_string()),
                    ("Content-Length".to_string(), "0".to_string()),
                ];
                let start = format!("HTTP/1.1 {} {}", status, reason_phrase(status));
                received.replies.push(head::render(&start, &fields).into_bytes());
            }
            Role::Client => {
                let mut headers = HeaderMap::new();
                headers.insert("@status".to_string(), Value::Int(i64::from(status)));
                received.chunks.push(Chunk {
                    payload: Vec::new(),
                    headers,
                });
            }
        }
    }

    /// Start-line derived headers for a parsed head, or `None` if malformed.
    fn start_line_headers(&self, parsed: &head::Head, headers: &mut HeaderMap) -> Option<()> {
        let (first, second, third) = parsed.start_parts()?;
        match self.role {
            Role::Remote => {
                if !third.starts_with("HTTP/") {
                    return None;
                }
                headers.insert("@method".to_string(), Value::from(first));
                headers.insert("@url".to_string(), Value::from(second));
                if let Some((id, name)) = parse_api_path(second) {
                    headers.entry("@service-id".to_string()).or_insert(Value::String(id));
                    let has_target = headers.contains_key("@service-method")
                        || headers.contains_key("@service-event");
                    if !has_target {
                        let key = if first == "GET" { "@service-method" } else { "@service-event" };
                        headers.insert(key.to_string(), Value::String(name));
                    }
                }
            }
            Role::Client => {
                if !first.starts_with("HTTP/") {
                    return None;
                }
                let status: u16 = second.parse().ok()?;
                headers.insert("@status".to_string(), Value::Int(i64::from(status)));
            }
        }
        Some(())
    }
}

impl Protocol for HttpProtocol {
    fn name(&self) -> &'static str {
        "http"
    }

    fn send(&mut self, payload: &[u8], headers: &HeaderMap, _binary: bool) -> Option<Vec<u8>> {
        if self.closed {
            return None;
        }
        let mut fields = vec![
            ("Connection".to_string(), "keep-alive".to_string()),
            ("Content-Length".to_string(), payload.len().to_string()),
        ];
        let mut exposed = vec!["Content-Type".to_string()];
        for (key, value) in headers {
            if START_LINE_KEYS.contains(&key.as_str()) {
                continue;
            }
            if key.starts_with('@') {
                let name = wire_name(key);
                exposed.push(name.clone());
                fields.push((name, field_value(value)));
            } else if let Some(canonical) = pass_through(key) {
                fields.push((canonical.to_string(), field_value(value)));
            }
        }

        let start = match self.role {
            Role::Client => Self::request_line(headers),
            Role::Remote => {
                let status = headers
                    .get("@status")
                    .and_then(Value::as_i64)
                    .and_then(|s| u16::try_from(s).ok())
                    .unwrap_or(200);
                fields.push(("Access-Control-Expose-Headers".to_string(), exposed.join(", ")));
                format!("HTTP/1.1 {} {}", status, reason_phrase(status))
            }
        };

        let mut out = head::render(&start, &fields).into_bytes();
        out.extend_from_slice(payload);
        Some(out)
    }

    fn receive(&mut self, bytes: &[u8]) -> Received {
        let mut received = Received::default();
        if self.closed {
            return received;
        }
        self.buffer.extend_from_slice(bytes);

        loop {
            let Some(head_end) = head::find_end(&self.buffer) else {
                if self.buffer.len() > MAX_HEAD_BYTES {
                    self.reject(&mut received, 400);
                }
                break;
            };
            let Some(parsed) = head::parse(&self.buffer[..head_end]) else {
                self.reject(&mut received, 400);
                break;
            };

            let mut headers = HeaderMap::new();
            for (name, value) in &parsed.headers {
                if let Some(key) = sigil_name(name) {
                    headers.insert(key, Value::String(value.clone()));
                } else if let Some(canonical) = pass_through(name) {
                    headers.insert(canonical.to_string(), Value::String(value.clone()));
                }
            }
            if self.start_line_headers(&parsed, &mut headers).is_none() {
                self.reject(&mut received, 400);
                break;
            }

            let length = match parsed.get("content-length") {
                None => 0,
                Some(value) => match value.parse::<usize>() {
                    Ok(length) => length,
                    Err(_) => {
                        self.reject(&mut received, 400);
                        break;
                    }
                },
            };
            if length > self.max_message_bytes {
                self.reject(&mut received, 413);
                break;
            }

            let total = head_end + length;
            if self.buffer.len() < total {
                break;
            }
            let payload = self.buffer[head_end..total].to_vec();
            self.buffer.drain(..total);
            received.chunks.push(Chunk { payload, headers });
        }
        received
    }

    fn close(&mut self, _status: CloseStatus) -> Option<Vec<u8>> {
        self.closed = true;
        self.buffer.clear();
        None
    }

    fn is_closed(&self) -> bool {
        self.closed
    }
}

fn pass_through(name: &str) -> Option<&'static str> {
    PASS_THROUGH
        .iter()
        .copied()
        .find(|candidate| candidate.eq_ignore_ascii_case(name))
}

/// `@service-id` → `X-Service-Id`
fn wire_name(sigil: &str) -> String {
    let bare = sigil.trim_start_matches('@');
    let mut out = String::from("X");
    for word in bare.split('-') {
        out.push('-');
        let mut chars = word.chars();
        if let Some(first) = chars.next() {
            out.extend(first.to_uppercase());
            out.push_str(&chars.as_str().to_ascii_lowercase());
        }
    }
    out
}

/// `X-Service-Id` → `@service-id`
fn sigil_name(wire: &str) -> Option<String> {
    let prefix = wire.get(..2)?;
    if !prefix.eq_ignore_ascii_case("x-") || wire.len() == 2 {
        return None;
    }
    Some(format!("@{}", wire[2..].to_ascii_lowercase()))
}

/// Header text without line breaks.
fn field_value(value: &Value) -> String {
    value
        .to_string()
        .chars()
        .map(|c| if c == '\r' || c == '\n' { ' ' } else { c })
        .collect()
}

fn reason_phrase(status: u16) -> &'static str {
    match status {
        200 => "OK",
        201 => "Created",
        204 => "No Content",
        301 => "Moved Permanently",
        302 => "Found",
        304 => "Not Modified",
        400 => "Bad Request",
        401 => "Unauthorized",
        403 => "Forbidden",
        404 => "Not Found",
        405 => "Method Not Allowed",
        413 => "Payload Too Large",
        500 => "Internal Server Error",
        503 => "Service Unavailable",
        _ => "Unknown",
    }
}

fn is_path_safe(byte: u8) -> bool {
    byte.is_ascii_alphanumeric() || b"-._~@!$&'()*+,;=:".contains(&byte)
}

fn encode_segment(segment: &str) -> String {
    let mut out = String::with_capacity(segment.len());
    for byte in segment.bytes() {
        if is_path_safe(byte) {
            out.push(char::from(byte));
        } else {
            out.push_str(&format!("%{:02X}", byte));
        }
    }
    out
}

fn decode_segment(segment: &str) -> Option<String> {
    let bytes = segment.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let hex = segment.get(i + 1..i + 3)?;
            out.push(u8::from_str_radix(hex, 16).ok()?);
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8(out).ok()
}

/// `/api/<id>/<name>` → `(id, name)`
fn parse_api_path(url: &str) -> Option<(String, String)> {
    let path = url.split('?').next()?;
    let rest = path.strip_prefix(API_PREFIX)?;
    let (id, name) = rest.split_once('/')?;
    if id.is_empty() || name.is_empty() || name.contains('/') {
        return None;
    }
    Some((decode_segment(id)?, decode_segment(name)?))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service_headers(id: &str, key: &str, name: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert("@service-id".to_string(), Value::from(id));
        headers.insert(key.to_string(), Value::from(name));
        headers
    }

    fn text(bytes: &[u8]) -> String {
        String::from_utf8(bytes.to_vec()).expect("utf8")
    }

    #[test]
    fn method_call_becomes_get_request() {
        let mut client = HttpProtocol::new(Role::Client);
        let bytes = client
            .send(b"{}", &service_headers("chat", "@service-method", "history"), false)
            .expect("request");
        let request = text(&bytes);
        assert!(request.starts_with("GET /api/chat/history HTTP/1.1\r\n"), "{}", request);
        assert!(request.contains("Connection: keep-alive\r\n"));
        assert!(request.contains("Content-Length: 2\r\n"));
        assert!(request.contains("X-Service-Id: chat\r\n"));
        assert!(request.contains("X-Service-Method: history\r\n"));
        assert!(request.ends_with("\r\n\r\n{}"));
    }

    #[test]
    fn event_call_becomes_post_request() {
        let mut client = HttpProtocol::new(Role::Client);
        let bytes = client
            .send(b"", &service_headers("chat", "@service-event", "said"), false)
            .expect("request");
        assert!(text(&bytes).starts_with("POST /api/chat/said HTTP/1.1\r\n"));
    }

    #[test]
    fn plain_request_uses_method_and_url() {
        let mut headers = HeaderMap::new();
        headers.insert("@method".to_string(), Value::from("put"));
        headers.insert("@url".to_string(), Value::from("/things/1"));
        headers.insert("Content-Type".to_string(), Value::from("application/json"));
        headers.insert("X-Ignored".to_string(), Value::from("plain headers are dropped"));
        let mut client = HttpProtocol::new(Role::Client);
        let request = text(&client.send(b"", &headers, false).expect("request"));
        assert!(request.starts_with("PUT /things/1 HTTP/1.1\r\n"));
        assert!(request.contains("Content-Type: application/json\r\n"));
        assert!(!request.contains("X-Ignored"));
        assert!(!request.contains("X-Method"));

        let mut bare = HttpProtocol::new(Role::Client);
        let request = text(&bare.send(b"", &HeaderMap::new(), false).expect("request"));
        assert!(request.starts_with("POST / HTTP/1.1\r\n"));
    }

    #[test]
    fn remote_decodes_request() {
        let mut client = HttpProtocol::new(Role::Client);
        let mut remote = HttpProtocol::new(Role::Remote);
        let bytes = client
            .send(b"[1]", &service_headers("chat", "@service-method", "history"), false)
            .expect("request");

        let chunks = remote.receive(&bytes).chunks;
        assert_eq!(chunks.len(), 1);
        let headers = &chunks[0].headers;
        assert_eq!(chunks[0].payload, b"[1]".to_vec());
        assert_eq!(headers.get("@service-id"), Some(&Value::from("chat")));
        assert_eq!(headers.get("@service-method"), Some(&Value::from("history")));
        assert_eq!(headers.get("@method"), Some(&Value::from("GET")));
        assert_eq!(headers.get("@url"), Some(&Value::from("/api/chat/history")));
    }

    #[test]
    fn path_alone_routes_to_service() {
        let mut remote = HttpProtocol::new(Role::Remote);
        let chunks = remote
            .receive(b"POST /api/a%20b/ping?x=1 HTTP/1.1\r\nContent-Length: 0\r\n\r\n")
            .chunks;
        assert_eq!(chunks[0].headers.get("@service-id"), Some(&Value::from("a b")));
        assert_eq!(chunks[0].headers.get("@service-event"), Some(&Value::from("ping")));
    }

    #[test]
    fn response_carries_status_both_ways() {
        let mut remote = HttpProtocol::new(Role::Remote);
        let mut headers = service_headers("chat", "@service-event", "success");
        headers.insert("@status".to_string(), Value::Int(404));
        let bytes = remote.send(b"{}", &headers, false).expect("response");
        let response = text(&bytes);
        assert!(response.starts_with("HTTP/1.1 404 Not Found\r\n"));
        assert!(response.contains(
            "Access-Control-Expose-Headers: Content-Type, X-Service-Event, X-Service-Id\r\n"
        ));

        let mut client = HttpProtocol::new(Role::Client);
        let chunks = client.receive(&bytes).chunks;
        assert_eq!(chunks[0].headers.get("@status"), Some(&Value::Int(404)));
        assert_eq!(chunks[0].headers.get("@service-event"), Some(&Value::from("success")));
    }

    #[test]
    fn waits_for_declared_body() {
        let mut remote = HttpProtocol::new(Role::Remote);
        let head = b"POST / HTTP/1.1\r\nContent-Length: 5\r\n\r\nab";
        assert!(remote.receive(head).chunks.is_empty());
        let chunks = remote.receive(b"cde").chunks;
        assert_eq!(chunks[0].payload, b"abcde".to_vec());
    }

    #[test]
    fn byte_at_a_time_matches_single_feed() {
        let mut client = HttpProtocol::new(Role::Client);
        let mut stream = Vec::new();
        for name in ["one", "two", "three"] {
            stream.extend(
                client
                    .send(name.as_bytes(), &service_headers("s", "@service-event", name), false)
                    .expect("request"),
            );
        }
        let expected = HttpProtocol::new(Role::Remote).receive(&stream).chunks;
        assert_eq!(expected.len(), 3);

        let mut trickle = HttpProtocol::new(Role::Remote);
        let mut chunks = Vec::new();
        for byte in &stream {
            chunks.extend(trickle.receive(std::slice::from_ref(byte)).chunks);
        }
        assert_eq!(chunks, expected);
    }

    #[test]
    fn malformed_request_gets_400_and_connection_survives() {
        let mut remote = HttpProtocol::new(Role::Remote);
        let received = remote.receive(b"garbage without structure\r\n\r\n");
        assert!(received.chunks.is_empty());
        assert!(text(&received.replies[0]).starts_with("HTTP/1.1 400 Bad Request\r\n"));

        let chunks = remote.receive(b"GET / HTTP/1.1\r\n\r\n").chunks;
        assert_eq!(chunks.len(), 1);
    }

    #[test]
    fn oversized_body_gets_413() {
        let mut remote = HttpProtocol::with_limit(Role::Remote, 4);
        let received = remote.receive(b"POST / HTTP/1.1\r\nContent-Length: 10\r\n\r\n");
        assert!(text(&received.replies[0]).starts_with("HTTP/1.1 413 Payload Too Large\r\n"));
    }

    #[test]
    fn malformed_response_surfaces_as_status_chunk() {
        let mut client = HttpProtocol::new(Role::Client);
        let received = client.receive(b"HTTP/1.1 abc\r\n\r\n");
        assert!(received.replies.is_empty());
        assert_eq!(received.chunks[0].headers.get("@status"), Some(&Value::Int(400)));
    }

    #[test]
    fn close_has_no_bytes_but_stops_sending() {
        let mut client = HttpProtocol::new(Role::Client);
        assert_eq!(client.close(CloseStatus::NORMAL), None);
        assert!(client.is_closed());
        assert_eq!(client.send(b"", &HeaderMap::new(), false), None);
    }

    #[test]
    fn header_name_mapping() {
        assert_eq!(wire_name("@service-origin"), "X-Service-Origin");
        assert_eq!(sigil_name("x-SERVICE-origin").as_deref(), Some("@service-origin"));
        assert_eq!(sigil_name("Content-Type"), None);
        assert_eq!(sigil_name("X-"), None);
    }
}
