// Local listener, accept loop and per-connection dispatch
use crate::context::ProxyContext;
use crate::error::{ProxyError, Result};
use crate::http::{self, HostPort};
use crate::relay::RelayHandler;
use crate::tunnel::{self, TunnelNegotiator};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ServerState {
    New,
    Started,
    Closed,
}

/// The local proxy server: binds the listening socket and hands every
/// accepted connection to its own worker task.
pub struct ProxyServer {
    context: Arc<ProxyContext>,
    state: ServerState,
    accept_task: Option<JoinHandle<()>>,
    local_addr: Option<SocketAddr>,
}

impl ProxyServer {
    pub fn new(context: Arc<ProxyContext>) -> Self {
        ProxyServer {
            context,
            state: ServerState::New,
            accept_task: None,
            local_addr: None,
        }
    }

    /// Starts the dependencies and then binds the listener, so a failed
    /// start never leaks a bound port.
    pub async fn start(&mut self) -> Result<()> {
        match self.state {
            ServerState::Started => {
                return Err(ProxyError::IllegalState("server already started"))
            }
            ServerState::Closed => return Err(ProxyError::IllegalState("server is closed")),
            ServerState::New => {}
        }

        self.context.start()?;

        let port = self.context.user().local_port;
        let listener = TcpListener::bind(("127.0.0.1", port)).await.map_err(|e| {
            ProxyError::Configuration(format!("cannot bind local port {port}: {e}"))
        })?;
        let local_addr = listener.local_addr()?;

        let context = Arc::clone(&self.context);
        self.accept_task = Some(tokio::spawn(accept_loop(listener, context)));
        self.local_addr = Some(local_addr);
        self.state = ServerState::Started;
        tracing::info!("server started, listening on {local_addr}");
        Ok(())
    }

    /// Actual bound address, useful when `local_port` is 0.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Stops accepting, severs nothing that is already in flight, and tears
    /// down the shared context. Safe to call more than once.
    pub async fn close(&mut self) {
        if self.state == ServerState::Closed {
            return;
        }
        tracing::info!("stopping local proxy server");
        if let Some(task) = self.accept_task.take() {
            task.abort();
            let _ = task.await;
        }
        self.context.close();
        self.state = ServerState::Closed;
    }
}

async fn accept_loop(listener: TcpListener, context: Arc<ProxyContext>) {
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                tune_client_socket(&stream, context.system().server_socket_buffer_size);
                let context = Arc::clone(&context);
                tokio::spawn(handle_connection(context, stream, peer));
            }
            Err(e) => {
                tracing::warn!("error accepting connection: {e}");
            }
        }
    }
}

fn tune_client_socket(stream: &TcpStream, buffer_size: usize) {
    let _ = stream.set_nodelay(true);
    let socket = socket2::SockRef::from(stream);
    if let Err(e) = socket.set_recv_buffer_size(buffer_size) {
        tracing::debug!("cannot set receive buffer size: {e}");
    }
    if let Err(e) = socket.set_send_buffer_size(buffer_size) {
        tracing::debug!("cannot set send buffer size: {e}");
    }
}

/// Services one client connection end-to-end. Failures stay local to the
/// connection; the accept loop never sees them.
async fn handle_connection(context: Arc<ProxyContext>, stream: TcpStream, peer: SocketAddr) {
    tracing::debug!("new connection from {peer}");
    let (mut client_read, mut client_write) = stream.into_split();

    let (head, leftover) = match http::read_request_head(&mut client_read).await {
        Ok(parsed) => parsed,
        Err(e) => {
            tracing::debug!("cannot parse request from {peer}: {e}");
            write_error_response(&mut client_write, &e).await;
            return;
        }
    };
    tracing::debug!("{} {} from {peer}", head.method, head.target);

    if head.method.eq_ignore_ascii_case("CONNECT") {
        match connect_phase(&context, &head, &mut client_write).await {
            Ok((upstream, upstream_initial)) => {
                tunnel::bridge(
                    client_read,
                    client_write,
                    upstream,
                    leftover,
                    upstream_initial,
                    context.system().server_socket_buffer_size,
                )
                .await;
                tracing::debug!("tunnel for {peer} closed");
            }
            Err(e) => {
                tracing::debug!("tunnel for {peer} failed: {e}");
                write_error_response(&mut client_write, &e).await;
            }
        }
    } else if let Err(e) = relay_phase(&context, head, leftover, client_read, &mut client_write).await
    {
        tracing::debug!("relay for {peer} failed: {e}");
        write_error_response(&mut client_write, &e).await;
    }
}

async fn connect_phase(
    context: &ProxyContext,
    head: &http::RequestHead,
    client_write: &mut OwnedWriteHalf,
) -> Result<(TcpStream, Vec<u8>)> {
    let credentials = context.credentials().get()?;
    let negotiator =
        TunnelNegotiator::new(context.proxy_address(), credentials, context.system());
    let target = HostPort::parse(&head.target);
    negotiator.tunnel(&target, &head.version, client_write).await
}

async fn relay_phase(
    context: &ProxyContext,
    head: http::RequestHead,
    leftover: Vec<u8>,
    client_read: OwnedReadHalf,
    client_write: &mut OwnedWriteHalf,
) -> Result<()> {
    let credentials = context.credentials().get()?;
    let handler = RelayHandler::new(
        context.proxy_address(),
        credentials,
        context.system(),
        context.pool(),
    );
    handler.relay(head, leftover, client_read, client_write).await
}

/// Maps an error to a downstream reply. Tunnel refusals are relayed as the
/// upstream sent them; everything else becomes a synthesized status.
async fn write_error_response<W>(writer: &mut W, error: &ProxyError)
where
    W: AsyncWrite + Unpin,
{
    let payload = match error {
        ProxyError::TunnelRefused { head, body } => {
            let mut bytes = head.to_bytes();
            bytes.extend_from_slice(body);
            bytes
        }
        other => {
            let (status, reason) = other.downstream_status();
            format!(
                "HTTP/1.1 {status} {reason}\r\nContent-Length: 0\r\nConnection: close\r\n\r\n"
            )
            .into_bytes()
        }
    };
    if let Err(e) = writer.write_all(&payload).await {
        tracing::debug!("cannot deliver error response: {e}");
    }
    let _ = writer.flush().await;
    let _ = writer.shutdown().await;
}
