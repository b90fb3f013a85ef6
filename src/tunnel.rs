// CONNECT tunnel negotiation and raw byte bridging
use crate::auth::{ntlm_challenge, NtlmCredentials, NtlmSession};
use crate::config::SystemConfig;
use crate::error::{ProxyError, Result};
use crate::http::{self, Header, HostPort, RequestHead, ResponseHead};
use crate::pool::connect_tuned;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;

const USER_AGENT: &str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"));

/// Cap on a refused tunnel's buffered entity, kept only for diagnostics
/// and the downstream relay of the refusal.
const MAX_REFUSAL_ENTITY: usize = 64 * 1024;

/// Establishes CONNECT tunnels through the upstream proxy, running the
/// NTLM challenge rounds on a single connection wherever keep-alive
/// permits.
pub struct TunnelNegotiator<'a> {
    proxy: HostPort,
    credentials: &'a NtlmCredentials,
    system: &'a SystemConfig,
}

impl<'a> TunnelNegotiator<'a> {
    pub fn new(proxy: HostPort, credentials: &'a NtlmCredentials, system: &'a SystemConfig) -> Self {
        TunnelNegotiator {
            proxy,
            credentials,
            system,
        }
    }

    /// Negotiates a tunnel to `target`. On success the upstream's status
    /// line and headers have been relayed to `client_out` and the raw
    /// socket is returned together with any tunnel bytes that followed
    /// the response head.
    pub async fn tunnel<W>(
        &self,
        target: &HostPort,
        version: &str,
        client_out: &mut W,
    ) -> Result<(TcpStream, Vec<u8>)>
    where
        W: AsyncWrite + Unpin,
    {
        let target = if target.port == 0 {
            HostPort::new(target.host.clone(), 80)
        } else {
            target.clone()
        };

        let mut session = NtlmSession::new(self.credentials);
        let mut connection: Option<TcpStream> = None;
        let mut auth_header: Option<String> = None;

        let (response, leftover, stream) = loop {
            let mut stream = match connection.take() {
                Some(open) => open,
                None => connect_tuned(&self.proxy, self.system.socket_buffer_size).await?,
            };

            let connect = self.connect_request(&target, version, auth_header.take());
            stream.write_all(&connect.to_bytes()).await?;
            stream.flush().await?;

            let (response, leftover) = http::read_response_head(&mut stream).await?;
            tracing::debug!("tunnel status code: {}", response.status);

            if response.status < 200 {
                return Err(ProxyError::UpstreamProtocol(format!(
                    "unexpected response to CONNECT request: {}",
                    response.status_line
                )));
            }

            if response.status == 407 {
                if let Some(token) = ntlm_challenge(&response) {
                    if let Some(next) = session.respond(&token)? {
                        if response.keep_alive() {
                            tracing::debug!("consuming challenge entity, keeping the connection");
                            http::drain_entity(&mut stream, &response, &leftover).await?;
                            connection = Some(stream);
                        } else {
                            tracing::debug!("closing tunnel connection before next round");
                        }
                        auth_header = Some(next);
                        continue;
                    }
                }
            }

            break (response, leftover, stream);
        };

        if response.status > 299 {
            session.fail();
            let mut stream = stream;
            let body = buffer_entity(&mut stream, &response, leftover)
                .await
                .unwrap_or_default();
            tracing::debug!("closing refused tunnel connection");
            return Err(ProxyError::TunnelRefused {
                head: response,
                body,
            });
        }

        session.succeed();
        // The client may have stopped caring after the status line; write
        // failures here must not kill the tunnel.
        http::write_head_silently(client_out, &response).await;
        Ok((stream, leftover))
    }

    fn connect_request(
        &self,
        target: &HostPort,
        version: &str,
        auth: Option<String>,
    ) -> RequestHead {
        let mut request = RequestHead::new("CONNECT", &target.to_string(), version);
        request.headers.push(Header::new("Host", target.to_string()));
        request.headers.push(Header::new("User-Agent", USER_AGENT));
        request
            .headers
            .push(Header::new("Proxy-Connection", "Keep-Alive"));
        if let Some(value) = auth {
            request.headers.push(Header::new("Proxy-Authorization", value));
        }
        request
    }
}

async fn buffer_entity(
    stream: &mut TcpStream,
    head: &ResponseHead,
    leftover: Vec<u8>,
) -> Result<Vec<u8>> {
    let declared = head.content_length();
    let mut body = leftover;
    if declared >= 0 {
        body.truncate(declared as usize);
        let target = (declared as usize).min(MAX_REFUSAL_ENTITY);
        let mut chunk = [0u8; 4096];
        while body.len() < target {
            let want = (target - body.len()).min(chunk.len());
            let n = stream.read(&mut chunk[..want]).await?;
            if n == 0 {
                break;
            }
            body.extend_from_slice(&chunk[..n]);
        }
    }
    Ok(body)
}

/// Bidirectional raw copy between the client socket and the established
/// tunnel. Each direction runs on its own task; EOF or error on one side
/// half-closes the peer, and both sockets are gone once both tasks end.
///
/// Bytes already pulled off either socket while parsing heads are handed
/// over as `client_initial` / `upstream_initial` and go out first, keeping
/// each direction in arrival order.
pub async fn bridge<R, W>(
    client_read: R,
    client_write: W,
    upstream: TcpStream,
    client_initial: Vec<u8>,
    upstream_initial: Vec<u8>,
    buffer_size: usize,
) where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (upstream_read, upstream_write) = upstream.into_split();
    let capacity = buffer_size.max(1024);

    let uplink = tokio::spawn(copy_direction(
        client_read,
        upstream_write,
        client_initial,
        capacity,
        "client->upstream",
    ));
    let downlink = tokio::spawn(copy_direction(
        upstream_read,
        client_write,
        upstream_initial,
        capacity,
        "upstream->client",
    ));
    let _ = tokio::join!(uplink, downlink);
}

async fn copy_direction<R, W>(
    reader: R,
    mut writer: W,
    initial: Vec<u8>,
    capacity: usize,
    label: &'static str,
) where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut reader = BufReader::with_capacity(capacity, reader);
    let result = async {
        if !initial.is_empty() {
            writer.write_all(&initial).await?;
        }
        tokio::io::copy_buf(&mut reader, &mut writer).await
    }
    .await;
    match result {
        Ok(bytes) => tracing::debug!("{label}: {bytes} bytes"),
        Err(e) => tracing::debug!("{label}: {e}"),
    }
    let _ = writer.shutdown().await;
}
