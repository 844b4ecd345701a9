//! Minimal HTTP/1.1 request parsing and response encoding.

use handoff_core::host::Response;

/// Largest request head we buffer before giving up on the connection.
pub const MAX_HEAD: usize = 16 * 1024;

#[derive(Debug, PartialEq, Eq)]
pub struct RequestHead {
    /// Bytes consumed, including the blank line.
    pub len: usize,
    pub method: String,
    pub path: String,
    pub keep_alive: bool,
}

/// Parse one request head from the front of `buf`.
/// `None` if the head is not complete yet. Bodies are not supported.
pub fn parse_request(buf: &[u8]) -> Option<RequestHead> {
    let end = buf.windows(4).position(|w| w == b"\r\n\r\n")?;
    let head = String::from_utf8_lossy(&buf[..end]);
    let mut lines = head.split("\r\n");

    let mut parts = lines.next().unwrap_or("").split(' ');
    let method = parts.next().unwrap_or("").to_string();
    let path = parts.next().filter(|p| !p.is_empty()).unwrap_or("/").to_string();
    let version = parts.next().unwrap_or("HTTP/1.0");

    let mut keep_alive = version == "HTTP/1.1";
    for line in lines {
        let Some((name, value)) = line.split_once(':') else {
            continue;
        };
        if name.trim().eq_ignore_ascii_case("connection") {
            let value = value.trim();
            if value.eq_ignore_ascii_case("close") {
                keep_alive = false;
            } else if value.eq_ignore_ascii_case("keep-alive") {
                keep_alive = true;
            }
        }
    }

    Some(RequestHead { len: end + 4, method, path, keep_alive })
}

fn reason(status: u16) -> &'static str {
    match status {
        200 => "OK",
        400 => "Bad Request",
        404 => "Not Found",
        405 => "Method Not Allowed",
        431 => "Request Header Fields Too Large",
        500 => "Internal Server Error",
        503 => "Service Unavailable",
        _ => "Unknown",
    }
}

pub fn encode_response(resp: &Response, keep_alive: bool) -> Vec<u8> {
    let header = format!(
        "HTTP/1.1 {} {}\r\n\
         Content-Type: {}\r\n\
         Content-Length: {}\r\n\
         Connection: {}\r\n\
         Server: handoff-httpd\r\n\
         \r\n",
        resp.status,
        reason(resp.status),
        resp.content_type,
        resp.body.len(),
        if keep_alive { "keep-alive" } else { "close" },
    );
    let mut out = header.into_bytes();
    out.extend_from_slice(&resp.body);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn incomplete_head() {
        assert_eq!(parse_request(b"GET / HTTP/1.1\r\nHost: x\r\n"), None);
    }

    #[test]
    fn simple_get() {
        let raw = b"GET /slow HTTP/1.1\r\nHost: x\r\n\r\nGET /next";
        let head = parse_request(raw).unwrap();
        assert_eq!(head.method, "GET");
        assert_eq!(head.path, "/slow");
        assert!(head.keep_alive);
        assert_eq!(&raw[head.len..], b"GET /next");
    }

    #[test]
    fn connection_header_wins() {
        let head = parse_request(b"GET / HTTP/1.1\r\nConnection: close\r\n\r\n").unwrap();
        assert!(!head.keep_alive);
        let head = parse_request(b"GET / HTTP/1.0\r\nconnection: Keep-Alive\r\n\r\n").unwrap();
        assert!(head.keep_alive);
        let head = parse_request(b"GET / HTTP/1.0\r\n\r\n").unwrap();
        assert!(!head.keep_alive);
    }

    #[test]
    fn encodes_headers_and_body() {
        let out = encode_response(&Response::text(200, "hi\n"), true);
        let text = String::from_utf8(out).unwrap();
        assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(text.contains("Content-Type: text/plain\r\n"));
        assert!(text.contains("Content-Length: 3\r\n"));
        assert!(text.contains("Connection: keep-alive\r\n"));
        assert!(text.ends_with("\r\n\r\nhi\n"));
    }
}
