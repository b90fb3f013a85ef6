// HTTP/1.1 head parsing and CRLF framing
use crate::error::{ProxyError, Result};
use std::fmt;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub const CRLF: &str = "\r\n";

/// Cap on the request/response head, everything up to the first empty line.
const MAX_HEAD: usize = 64 * 1024;

/// Headers whose scope is a single transport connection; they are never
/// forwarded through the proxy in either direction.
const HOP_BY_HOP: &[&str] = &[
    "Proxy-Authorization",
    "Proxy-Connection",
    "Connection",
    "TE",
    "Trailer",
    "Transfer-Encoding",
    "Upgrade",
    "Keep-Alive",
];

pub fn is_hop_by_hop(name: &str) -> bool {
    HOP_BY_HOP.iter().any(|h| h.eq_ignore_ascii_case(name))
}

/// One header line, original name casing preserved for reproduction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    pub name: String,
    pub value: String,
}

impl Header {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Header {
            name: name.into(),
            value: value.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestHead {
    pub method: String,
    pub target: String,
    pub version: String,
    pub headers: Vec<Header>,
}

impl RequestHead {
    pub fn new(method: &str, target: &str, version: &str) -> Self {
        RequestHead {
            method: method.to_string(),
            target: target.to_string(),
            version: version.to_string(),
            headers: Vec::new(),
        }
    }

    /// First header with the given name, case-insensitive.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|h| h.name.eq_ignore_ascii_case(name))
            .map(|h| h.value.as_str())
    }

    /// Declared content length; `-1` when absent or malformed.
    pub fn content_length(&self) -> i64 {
        match self.header("Content-Length") {
            Some(v) => v.trim().parse::<i64>().ok().filter(|n| *n >= 0).unwrap_or(-1),
            None => -1,
        }
    }

    pub fn is_chunked(&self) -> bool {
        self.header("Transfer-Encoding")
            .map(|v| v.to_ascii_lowercase().contains("chunked"))
            .unwrap_or(false)
    }

    /// Parses a complete head block, the reverse of [`RequestHead::to_bytes`].
    pub fn parse(bytes: &[u8]) -> Result<RequestHead> {
        let text = std::str::from_utf8(bytes)
            .map_err(|_| ProxyError::MalformedRequest("head is not valid UTF-8".into()))?;
        let mut lines = text.split(CRLF).filter(|l| !l.is_empty());
        let request_line = lines
            .next()
            .ok_or_else(|| ProxyError::MalformedRequest("empty request head".into()))?;
        let mut parts = request_line.split_whitespace();
        let method = parts
            .next()
            .ok_or_else(|| ProxyError::MalformedRequest("missing method".into()))?;
        let target = parts
            .next()
            .ok_or_else(|| ProxyError::MalformedRequest("missing request target".into()))?;
        let version = parts.next().unwrap_or("HTTP/1.1");
        let mut head = RequestHead::new(method, target, version);
        for line in lines {
            let (name, value) = line.split_once(':').ok_or_else(|| {
                ProxyError::MalformedRequest(format!("invalid header line: {line}"))
            })?;
            head.headers.push(Header::new(name.trim(), value.trim()));
        }
        Ok(head)
    }

    /// Emits the request line and every header as `<line>\r\n`, followed by
    /// the empty separator line.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(256);
        out.extend_from_slice(
            format!("{} {} {}{CRLF}", self.method, self.target, self.version).as_bytes(),
        );
        for h in &self.headers {
            out.extend_from_slice(format!("{}: {}{CRLF}", h.name, h.value).as_bytes());
        }
        out.extend_from_slice(CRLF.as_bytes());
        out
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseHead {
    pub status: u16,
    pub status_line: String,
    pub headers: Vec<Header>,
}

impl ResponseHead {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|h| h.name.eq_ignore_ascii_case(name))
            .map(|h| h.value.as_str())
    }

    /// Every value carried by headers with the given name.
    pub fn header_values<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> {
        self.headers
            .iter()
            .filter(move |h| h.name.eq_ignore_ascii_case(name))
            .map(|h| h.value.as_str())
    }

    pub fn content_length(&self) -> i64 {
        match self.header("Content-Length") {
            Some(v) => v.trim().parse::<i64>().ok().filter(|n| *n >= 0).unwrap_or(-1),
            None => -1,
        }
    }

    pub fn is_chunked(&self) -> bool {
        self.header("Transfer-Encoding")
            .map(|v| v.to_ascii_lowercase().contains("chunked"))
            .unwrap_or(false)
    }

    /// Whether the sender intends to keep the transport connection open.
    pub fn keep_alive(&self) -> bool {
        let connection = self
            .header("Connection")
            .or_else(|| self.header("Proxy-Connection"));
        match connection {
            Some(v) if v.to_ascii_lowercase().contains("close") => false,
            Some(v) if v.to_ascii_lowercase().contains("keep-alive") => true,
            _ => !self.status_line.starts_with("HTTP/1.0"),
        }
    }

    pub fn parse(bytes: &[u8]) -> Result<ResponseHead> {
        let text = std::str::from_utf8(bytes).map_err(|_| {
            ProxyError::UpstreamProtocol("response head is not valid UTF-8".into())
        })?;
        let mut lines = text.split(CRLF).filter(|l| !l.is_empty());
        let status_line = lines
            .next()
            .ok_or_else(|| ProxyError::UpstreamProtocol("empty response head".into()))?
            .to_string();
        let status = status_line
            .split_whitespace()
            .nth(1)
            .and_then(|s| s.parse::<u16>().ok())
            .ok_or_else(|| {
                ProxyError::UpstreamProtocol(format!("invalid status line: {status_line}"))
            })?;
        let mut headers = Vec::new();
        for line in lines {
            let (name, value) = line.split_once(':').ok_or_else(|| {
                ProxyError::UpstreamProtocol(format!("invalid header line: {line}"))
            })?;
            headers.push(Header::new(name.trim(), value.trim()));
        }
        Ok(ResponseHead {
            status,
            status_line,
            headers,
        })
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(256);
        out.extend_from_slice(self.status_line.as_bytes());
        out.extend_from_slice(CRLF.as_bytes());
        for h in &self.headers {
            out.extend_from_slice(format!("{}: {}{CRLF}", h.name, h.value).as_bytes());
        }
        out.extend_from_slice(CRLF.as_bytes());
        out
    }
}

/// Reads a request head up to the first empty CRLF line. Returns the parsed
/// head together with any body bytes that were already pulled off the socket.
pub async fn read_request_head<R>(reader: &mut R) -> Result<(RequestHead, Vec<u8>)>
where
    R: AsyncRead + Unpin,
{
    match read_head_block(reader).await? {
        HeadBlock::Complete(head_bytes, leftover) => {
            Ok((RequestHead::parse(&head_bytes)?, leftover))
        }
        HeadBlock::Closed => Err(ProxyError::MalformedRequest(
            "connection closed before request head".into(),
        )),
        HeadBlock::TooLarge => Err(ProxyError::MalformedRequest(format!(
            "request head exceeds {MAX_HEAD} bytes"
        ))),
    }
}

/// Reads a response head from the upstream proxy. Leftover bytes belong to
/// the response entity (or, after a CONNECT success, to the tunnel).
pub async fn read_response_head<R>(reader: &mut R) -> Result<(ResponseHead, Vec<u8>)>
where
    R: AsyncRead + Unpin,
{
    match read_head_block(reader).await? {
        HeadBlock::Complete(head_bytes, leftover) => {
            Ok((ResponseHead::parse(&head_bytes)?, leftover))
        }
        HeadBlock::Closed => Err(ProxyError::UpstreamIo(std::io::Error::new(
            std::io::ErrorKind::UnexpectedEof,
            "connection closed before response head",
        ))),
        HeadBlock::TooLarge => Err(ProxyError::UpstreamProtocol(format!(
            "response head exceeds {MAX_HEAD} bytes"
        ))),
    }
}

enum HeadBlock {
    Complete(Vec<u8>, Vec<u8>),
    Closed,
    TooLarge,
}

async fn read_head_block<R>(reader: &mut R) -> Result<HeadBlock>
where
    R: AsyncRead + Unpin,
{
    let mut buf = Vec::with_capacity(1024);
    let mut chunk = [0u8; 1024];
    loop {
        if let Some(pos) = find_head_end(&buf) {
            let leftover = buf.split_off(pos);
            return Ok(HeadBlock::Complete(buf, leftover));
        }
        if buf.len() > MAX_HEAD {
            return Ok(HeadBlock::TooLarge);
        }
        let n = reader.read(&mut chunk).await?;
        if n == 0 {
            return Ok(HeadBlock::Closed);
        }
        buf.extend_from_slice(&chunk[..n]);
    }
}

fn find_head_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n").map(|i| i + 4)
}

/// Writes a response head to the client, tolerating downstream failure.
/// Clients routinely close their read side right after the status line.
pub async fn write_head_silently<W>(writer: &mut W, head: &ResponseHead)
where
    W: AsyncWrite + Unpin,
{
    if let Err(e) = writer.write_all(&head.to_bytes()).await {
        tracing::debug!("error writing response head to client: {}", e);
    }
    if let Err(e) = writer.flush().await {
        tracing::debug!("error flushing response head to client: {}", e);
    }
}

/// Consumes what remains of a response entity with a declared length so
/// the connection can carry another exchange.
pub(crate) async fn drain_entity<R>(
    reader: &mut R,
    head: &ResponseHead,
    leftover: &[u8],
) -> Result<()>
where
    R: AsyncRead + Unpin,
{
    let declared = head.content_length();
    if declared <= leftover.len() as i64 {
        return Ok(());
    }
    let mut remaining = declared as u64 - leftover.len() as u64;
    let mut chunk = [0u8; 4096];
    while remaining > 0 {
        let want = remaining.min(chunk.len() as u64) as usize;
        let n = reader.read(&mut chunk[..want]).await?;
        if n == 0 {
            break;
        }
        remaining -= n as u64;
    }
    Ok(())
}

/// A host and port pair, the address form used on both proxy hops.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct HostPort {
    pub host: String,
    pub port: u16,
}

impl HostPort {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        HostPort {
            host: host.into(),
            port,
        }
    }

    /// Parses `host:port`; a missing, malformed or non-positive port
    /// normalizes to 80.
    pub fn parse(value: &str) -> Self {
        match value.rsplit_once(':') {
            Some((host, port)) => {
                let port = port
                    .parse::<i32>()
                    .ok()
                    .filter(|p| *p > 0 && *p <= u16::MAX as i32)
                    .unwrap_or(80) as u16;
                HostPort::new(host, port)
            }
            None => HostPort::new(value, 80),
        }
    }
}

impl fmt::Display for HostPort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}
