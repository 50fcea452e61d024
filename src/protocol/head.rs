//! HTTP/1.1 message heads, shared by the HTTP framing and the WS handshake.

/// Largest head accepted before the terminator must have appeared.
pub(crate) const MAX_HEAD_BYTES: usize = 8 * 1024;

const TERMINATOR: &[u8] = b"\r\n\r\n";

/// A parsed start line plus header fields, names kept as sent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Head {
    pub start_line: String,
    pub headers: Vec<(String, String)>,
}

impl Head {
    /// Case-insensitive header lookup.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    /// The three space-separated parts of the start line; the third keeps
    /// any inner spaces (reason phrases).
    pub fn start_parts(&self) -> Option<(&str, &str, &str)> {
        let mut parts = self.start_line.splitn(3, ' ');
        let first = parts.next()?;
        let second = parts.next()?;
        let third = parts.next().unwrap_or("");
        Some((first, second, third))
    }
}

/// Offset just past the blank line ending the head, if it is buffered.
pub(crate) fn find_end(buffer: &[u8]) -> Option<usize> {
    buffer
        .windows(TERMINATOR.len())
        .position(|window| window == TERMINATOR)
        .map(|at| at + TERMINATOR.len())
}

/// Parse a complete head (terminator included or not).
pub(crate) fn parse(bytes: &[u8]) -> Option<Head> {
    let text = std::str::from_utf8(bytes).ok()?;
    let mut lines = text.split("\r\n");
    let start_line = lines.next()?.trim().to_string();
    if start_line.is_empty() {
        return None;
    }
    let mut headers = Vec::new();
    for line in lines {
        if line.is_empty() {
            continue;
        }
        let (name, value) = line.split_once(':')?;
        let name = name.trim();
        if name.is_empty() || name.contains(' ') {
            return None;
        }
        headers.push((name.to_string(), value.trim().to_string()));
    }
    Some(Head { start_line, headers })
}

/// Render a head: start line, fields, blank line.
pub(crate) fn render(start_line: &str, headers: &[(String, String)]) -> String {
    let mut out = String::with_capacity(128);
    out.push_str(start_line);
    out.push_str("\r\n");
    for (name, value) in headers {
        out.push_str(name);
        out.push_str(": ");
        out.push_str(value);
        out.push_str("\r\n");
    }
    out.push_str("\r\n");
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finds_terminator() {
        assert_eq!(find_end(b"GET / HTTP/1.1\r\nA: b\r\n\r\nbody"), Some(24));
        assert_eq!(find_end(b"GET / HTTP/1.1\r\nA: b\r\n"), None);
    }

    #[test]
    fn parses_fields_case_insensitively() {
        let head = parse(b"HTTP/1.1 101 Switching Protocols\r\nUpgrade: WebSocket\r\nX-Thing:  v \r\n\r\n")
            .expect("head");
        assert_eq!(head.get("upgrade"), Some("WebSocket"));
        assert_eq!(head.get("x-thing"), Some("v"));
        assert_eq!(
            head.start_parts(),
            Some(("HTTP/1.1", "101", "Switching Protocols"))
        );
    }

    #[test]
    fn rejects_field_without_colon() {
        assert!(parse(b"GET / HTTP/1.1\r\nbroken line\r\n\r\n").is_none());
        assert!(parse(b"\r\n\r\n").is_none());
    }

    #[test]
    fn render_then_parse() {
        let text = render("GET /x HTTP/1.1", &[("Host".to_string(), "h:1".to_string())]);
        assert_eq!(text, "GET /x HTTP/1.1\r\nHost: h:1\r\n\r\n");
        assert_eq!(parse(text.as_bytes()).and_then(|h| h.get("host").map(String::from)), Some("h:1".to_string()));
    }
}
