//! HTTP proxy request head parsing

use std::io;

use bytes::{Bytes, BytesMut};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::dialer::Target;

/// Largest request head the proxy will buffer
pub const MAX_HEAD_SIZE: usize = 16 * 1024;

const HEAD_END: &[u8] = b"\r\n\r\n";

/// Request hop-by-hop headers dropped before forwarding
const STRIPPED_HEADERS: &[&str] = &["connection", "keep-alive", "proxy-connection"];

/// Why a request head was rejected
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RequestError {
    #[error("malformed request: {0}")]
    Malformed(&'static str),

    #[error("unsupported request target: {0}")]
    UnsupportedTarget(String),

    #[error("invalid upstream address: {0}")]
    InvalidAddress(String),
}

/// What the client asked the proxy to do
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestKind {
    /// Open a raw tunnel
    Connect,
    /// Forward a plain HTTP request; `head` is the rewritten origin-form head
    Forward { head: Bytes },
}

/// A parsed proxy request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyRequest {
    pub method: String,
    pub target: Target,
    pub kind: RequestKind,
}

impl ProxyRequest {
    pub fn is_connect(&self) -> bool {
        matches!(self.kind, RequestKind::Connect)
    }

    /// Parse a complete request head, terminator included.
    pub fn parse(head: &[u8]) -> Result<Self, RequestError> {
        let text = std::str::from_utf8(head).map_err(|_| RequestError::Malformed("non-UTF-8 head"))?;
        let text = text
            .strip_suffix("\r\n\r\n")
            .ok_or(RequestError::Malformed("unterminated head"))?;

        let mut lines = text.split("\r\n");
        let request_line = lines.next().ok_or(RequestError::Malformed("empty head"))?;

        let mut parts = request_line.split_whitespace();
        let (method, uri, version) = match (parts.next(), parts.next(), parts.next(), parts.next()) {
            (Some(m), Some(u), Some(v), None) => (m, u, v),
            _ => return Err(RequestError::Malformed("bad request line")),
        };

        if !version.starts_with("HTTP/1.") {
            return Err(RequestError::Malformed("unsupported HTTP version"));
        }

        let headers: Vec<(&str, &str)> = lines
            .filter(|line| !line.is_empty())
            .map(|line| {
                line.split_once(':')
                    .map(|(name, value)| (name.trim(), value.trim()))
                    .ok_or(RequestError::Malformed("bad header line"))
            })
            .collect::<Result<_, _>>()?;

        if method.eq_ignore_ascii_case("CONNECT") {
            let target = Target::parse_with_default(uri, 443)
                .map_err(|_| RequestError::InvalidAddress(uri.to_string()))?;
            return Ok(Self {
                method: method.to_string(),
                target,
                kind: RequestKind::Connect,
            });
        }

        let rest = strip_scheme(uri).ok_or_else(|| RequestError::UnsupportedTarget(uri.to_string()))?;
        let (authority, path) = match rest.find(['/', '?']) {
            Some(idx) if rest.as_bytes()[idx] == b'/' => (&rest[..idx], rest[idx..].to_string()),
            Some(idx) => (&rest[..idx], format!("/{}", &rest[idx..])),
            None => (rest, "/".to_string()),
        };

        let target = Target::parse_with_default(authority, 80)
            .map_err(|_| RequestError::InvalidAddress(authority.to_string()))?;

        let head = rewrite_head(method, &path, version, authority, &headers);
        Ok(Self {
            method: method.to_string(),
            target,
            kind: RequestKind::Forward { head },
        })
    }
}

fn strip_scheme(uri: &str) -> Option<&str> {
    let (scheme, rest) = uri.split_once("://")?;
    scheme.eq_ignore_ascii_case("http").then_some(rest)
}

fn rewrite_head(
    method: &str,
    path: &str,
    version: &str,
    authority: &str,
    headers: &[(&str, &str)],
) -> Bytes {
    let mut out = BytesMut::with_capacity(256);
    out.extend_from_slice(format!("{} {} {}\r\n", method, path, version).as_bytes());

    let mut has_host = false;
    for (name, value) in headers {
        let lower = name.to_ascii_lowercase();
        if lower.starts_with("proxy-") || STRIPPED_HEADERS.contains(&lower.as_str()) {
            continue;
        }
        has_host |= lower == "host";
        out.extend_from_slice(format!("{}: {}\r\n", name, value).as_bytes());
    }

    if !has_host {
        out.extend_from_slice(format!("Host: {}\r\n", authority).as_bytes());
    }
    out.extend_from_slice(b"Connection: close\r\n\r\n");
    out.freeze()
}

/// Read until the end of the request head.
///
/// On success `buf` holds the head followed by whatever the client sent
/// after it, and the returned value is the length of the head.
pub async fn read_head<R>(reader: &mut R, buf: &mut BytesMut) -> io::Result<usize>
where
    R: AsyncRead + Unpin,
{
    let mut scanned = 0;
    loop {
        if let Some(pos) = find_head_end(&buf[scanned..]) {
            return Ok(scanned + pos + HEAD_END.len());
        }
        // Terminator may straddle two reads
        scanned = buf.len().saturating_sub(HEAD_END.len() - 1);

        if buf.len() >= MAX_HEAD_SIZE {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "request head too large",
            ));
        }

        buf.reserve(1024);
        if reader.read_buf(buf).await? == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "client closed before sending a full request head",
            ));
        }
    }
}

fn find_head_end(haystack: &[u8]) -> Option<usize> {
    haystack.windows(HEAD_END.len()).position(|w| w == HEAD_END)
}
