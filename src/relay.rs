// Plain-request forwarding through the authenticating connection pool
use crate::auth::{ntlm_challenge, NtlmCredentials, NtlmSession};
use crate::body::StreamingRequestBody;
use crate::config::SystemConfig;
use crate::error::{ProxyError, Result};
use crate::http::{
    self, is_hop_by_hop, Header, HostPort, RequestHead, ResponseHead,
};
use crate::pool::{keep_alive_duration, ConnectionPool, PooledConnection, UpstreamRoute};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;

const TRANSFER_BUFFER: usize = 8 * 1024;

/// Forwards a non-CONNECT client request through the upstream proxy,
/// authenticating with NTLM on fresh pooled connections, and streams the
/// response back.
pub struct RelayHandler<'a> {
    proxy: HostPort,
    credentials: &'a NtlmCredentials,
    system: &'a SystemConfig,
    pool: &'a ConnectionPool,
}

impl<'a> RelayHandler<'a> {
    pub fn new(
        proxy: HostPort,
        credentials: &'a NtlmCredentials,
        system: &'a SystemConfig,
        pool: &'a ConnectionPool,
    ) -> Self {
        RelayHandler {
            proxy,
            credentials,
            system,
            pool,
        }
    }

    /// Relays one request. Errors are returned only while nothing has been
    /// written downstream; after that the client connection is simply
    /// dropped.
    pub async fn relay<R, W>(
        &self,
        head: RequestHead,
        leftover: Vec<u8>,
        client_read: R,
        client_out: &mut W,
    ) -> Result<()>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let target = resolve_target(&head)?;
        let route = UpstreamRoute {
            target,
            proxy: self.proxy.clone(),
            tunnelled: false,
        };
        let mut body = StreamingRequestBody::new(&head, leftover, client_read).await?;

        let mut session = NtlmSession::new(self.credentials);
        let mut auth_header: Option<String> = None;
        let mut current: Option<PooledConnection> = None;
        let mut retried_stale = false;

        let (mut conn, response, response_leftover) = loop {
            let mut conn = match current.take() {
                Some(open) => open,
                None => self.pool.lease(&route).await?,
            };
            let request = self.upstream_request(&head, &body, auth_header.as_deref());
            match exchange(&mut conn, &request, &mut body).await {
                Err(ProxyError::UpstreamIo(e))
                    if conn.reused
                        && body.is_repeatable()
                        && self.system.retries
                        && !retried_stale =>
                {
                    tracing::debug!("stale pooled connection, retrying on a fresh one: {e}");
                    retried_stale = true;
                    continue;
                }
                Err(e) => return Err(e),
                Ok((response, response_leftover)) => {
                    if response.status == 407 {
                        if let Some(token) = ntlm_challenge(&response) {
                            if !body.is_repeatable() {
                                return Err(ProxyError::UpstreamProtocol(
                                    "non-repeatable request body cannot be replayed for proxy authentication"
                                        .into(),
                                ));
                            }
                            match session.respond(&token)? {
                                Some(next) => {
                                    auth_header = Some(next);
                                    if response.keep_alive() {
                                        http::drain_entity(
                                            conn.stream(),
                                            &response,
                                            &response_leftover,
                                        )
                                        .await?;
                                        current = Some(conn);
                                    }
                                    continue;
                                }
                                None => return Err(ProxyError::AuthExhausted),
                            }
                        }
                    }
                    break (conn, response, response_leftover);
                }
            }
        };

        session.succeed();
        conn.authenticated = true;

        // Response head goes out minus hop-by-hop headers; from here on a
        // failure can only drop the connection.
        let forwarded = ResponseHead {
            status: response.status,
            status_line: response.status_line.clone(),
            headers: response
                .headers
                .iter()
                .filter(|h| !is_hop_by_hop(&h.name))
                .cloned()
                .collect(),
        };
        if let Err(e) = client_out.write_all(&forwarded.to_bytes()).await {
            tracing::debug!("client went away before the response head: {e}");
            return Ok(());
        }

        let outcome = self
            .copy_response_body(&head, &response, response_leftover, &mut conn, client_out)
            .await;
        match outcome {
            Ok(reusable) => {
                if reusable {
                    let keep_alive =
                        keep_alive_duration(&response, self.system.max_connection_idle);
                    self.pool.release(conn, keep_alive);
                }
            }
            Err(e) => {
                tracing::debug!("response relay aborted: {e}");
            }
        }
        let _ = client_out.flush().await;
        Ok(())
    }

    /// Streams the response entity downstream; returns whether the upstream
    /// connection is clean enough to pool.
    async fn copy_response_body<W>(
        &self,
        request: &RequestHead,
        response: &ResponseHead,
        leftover: Vec<u8>,
        conn: &mut PooledConnection,
        client_out: &mut W,
    ) -> Result<bool>
    where
        W: AsyncWrite + Unpin,
    {
        if request.method.eq_ignore_ascii_case("HEAD")
            || response.status == 204
            || response.status == 304
        {
            return Ok(response.keep_alive() && leftover.is_empty());
        }

        if response.is_chunked() {
            // The Transfer-Encoding header was stripped, so the body is
            // de-chunked and delimited by closing the client connection.
            copy_chunked(conn.stream(), leftover, client_out).await?;
            return Ok(false);
        }

        let declared = response.content_length();
        if declared >= 0 {
            let complete =
                copy_declared(conn.stream(), leftover, declared as u64, client_out).await?;
            return Ok(complete && response.keep_alive());
        }

        // No framing information: close-delimited body.
        client_out.write_all(&leftover).await?;
        let mut chunk = vec![0u8; TRANSFER_BUFFER];
        loop {
            let n = conn.stream().read(&mut chunk).await?;
            if n == 0 {
                break;
            }
            client_out.write_all(&chunk[..n]).await?;
        }
        Ok(false)
    }

    /// Mirrors the client request toward the proxy, minus hop-by-hop
    /// headers, plus the pending NTLM response when a round is in flight.
    fn upstream_request(
        &self,
        head: &RequestHead,
        body: &StreamingRequestBody<impl AsyncRead + Unpin>,
        auth: Option<&str>,
    ) -> RequestHead {
        let mut request = RequestHead::new(&head.method, &head.target, &head.version);
        request.headers = head
            .headers
            .iter()
            .filter(|h| !is_hop_by_hop(&h.name))
            .cloned()
            .collect();
        // A fully buffered body of unknown declared length gets an exact
        // Content-Length so the proxy can frame it.
        if head.content_length() < 0 && body.is_repeatable() && body.buffered_len() > 0 {
            request
                .headers
                .push(Header::new("Content-Length", body.buffered_len().to_string()));
        }
        if let Some(value) = auth {
            request
                .headers
                .push(Header::new("Proxy-Authorization", value));
        }
        request
    }
}

async fn exchange<R>(
    conn: &mut PooledConnection,
    request: &RequestHead,
    body: &mut StreamingRequestBody<R>,
) -> Result<(ResponseHead, Vec<u8>)>
where
    R: AsyncRead + Unpin,
{
    let stream = conn.stream();
    stream.write_all(&request.to_bytes()).await?;
    body.write_to(stream).await?;
    http::read_response_head(stream).await
}

fn resolve_target(head: &RequestHead) -> Result<HostPort> {
    if let Some(rest) = head.target.strip_prefix("http://") {
        return Ok(authority_host_port(authority_of(rest), 80));
    }
    if let Some(rest) = head.target.strip_prefix("https://") {
        return Ok(authority_host_port(authority_of(rest), 443));
    }
    if let Some(host) = head.header("Host") {
        return Ok(authority_host_port(host, 80));
    }
    Err(ProxyError::MalformedRequest(format!(
        "cannot determine request target from {}",
        head.target
    )))
}

fn authority_of(rest: &str) -> &str {
    rest.split(['/', '?', '#']).next().unwrap_or(rest)
}

fn authority_host_port(authority: &str, default_port: u16) -> HostPort {
    match authority.rsplit_once(':') {
        Some((host, port)) => match port.parse::<u16>() {
            Ok(port) if port > 0 => HostPort::new(host, port),
            _ => HostPort::new(authority, default_port),
        },
        None => HostPort::new(authority, default_port),
    }
}

/// Copies a length-delimited entity; returns true when every declared byte
/// arrived and no stray bytes remain buffered.
async fn copy_declared<W>(
    stream: &mut TcpStream,
    leftover: Vec<u8>,
    declared: u64,
    client_out: &mut W,
) -> Result<bool>
where
    W: AsyncWrite + Unpin,
{
    let buffered = leftover.len() as u64;
    let from_buffer = buffered.min(declared) as usize;
    client_out.write_all(&leftover[..from_buffer]).await?;

    let mut remaining = declared - from_buffer as u64;
    let mut chunk = vec![0u8; TRANSFER_BUFFER];
    while remaining > 0 {
        let want = remaining.min(TRANSFER_BUFFER as u64) as usize;
        let n = stream.read(&mut chunk[..want]).await?;
        if n == 0 {
            return Ok(false);
        }
        client_out.write_all(&chunk[..n]).await?;
        remaining -= n as u64;
    }
    Ok(buffered <= declared)
}

/// Decodes a chunked entity and forwards the payload bytes.
async fn copy_chunked<W>(
    stream: &mut TcpStream,
    leftover: Vec<u8>,
    client_out: &mut W,
) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut reader = EntityReader::new(stream, leftover);
    loop {
        let line = reader.read_line().await?;
        let size_field = line.split(';').next().unwrap_or("").trim();
        let size = u64::from_str_radix(size_field, 16).map_err(|_| {
            ProxyError::UpstreamProtocol(format!("invalid chunk size line: {line}"))
        })?;
        if size == 0 {
            // trailer section runs to the next empty line
            loop {
                if reader.read_line().await?.is_empty() {
                    return Ok(());
                }
            }
        }
        reader.copy_exact(size, client_out).await?;
        let delimiter = reader.read_line().await?;
        if !delimiter.is_empty() {
            return Err(ProxyError::UpstreamProtocol(
                "missing CRLF after chunk data".into(),
            ));
        }
    }
}

/// Buffered view over the response entity: the head parser may already have
/// pulled entity bytes off the socket.
struct EntityReader<'a> {
    stream: &'a mut TcpStream,
    buf: Vec<u8>,
    pos: usize,
}

impl<'a> EntityReader<'a> {
    fn new(stream: &'a mut TcpStream, leftover: Vec<u8>) -> Self {
        EntityReader {
            stream,
            buf: leftover,
            pos: 0,
        }
    }

    async fn fill(&mut self) -> Result<bool> {
        if self.pos == self.buf.len() {
            self.buf.clear();
            self.pos = 0;
        }
        let mut chunk = [0u8; TRANSFER_BUFFER];
        let n = self.stream.read(&mut chunk).await?;
        self.buf.extend_from_slice(&chunk[..n]);
        Ok(n > 0)
    }

    /// Reads through the next LF; returns the line without its CRLF.
    async fn read_line(&mut self) -> Result<String> {
        loop {
            if let Some(offset) = self.buf[self.pos..].iter().position(|b| *b == b'\n') {
                let end = self.pos + offset;
                let mut line = &self.buf[self.pos..end];
                if line.ends_with(b"\r") {
                    line = &line[..line.len() - 1];
                }
                let text = String::from_utf8_lossy(line).into_owned();
                self.pos = end + 1;
                return Ok(text);
            }
            if self.buf.len() - self.pos > 8 * 1024 {
                return Err(ProxyError::UpstreamProtocol(
                    "chunk framing line too long".into(),
                ));
            }
            if !self.fill().await? {
                return Err(ProxyError::UpstreamProtocol(
                    "connection closed inside chunked entity".into(),
                ));
            }
        }
    }

    async fn copy_exact<W>(&mut self, mut n: u64, out: &mut W) -> Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        while n > 0 {
            if self.pos == self.buf.len() && !self.fill().await? {
                return Err(ProxyError::UpstreamProtocol(
                    "connection closed inside chunked entity".into(),
                ));
            }
            let available = &self.buf[self.pos..];
            let take = (available.len() as u64).min(n) as usize;
            out.write_all(&available[..take]).await?;
            self.pos += take;
            n -= take as u64;
        }
        Ok(())
    }
}
