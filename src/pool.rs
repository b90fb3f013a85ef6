// Upstream connection pooling and idle eviction
use crate::config::SystemConfig;
use crate::error::{ProxyError, Result};
use crate::http::{HostPort, ResponseHead};
use std::collections::{HashMap, VecDeque};
use std::io;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::net::{lookup_host, TcpSocket, TcpStream};
use tokio::time::{Duration, Instant};

/// A connection's place in the proxy topology. Pooled connections are only
/// reused on the exact same route.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct UpstreamRoute {
    pub target: HostPort,
    pub proxy: HostPort,
    pub tunnelled: bool,
}

/// Opens a TCP connection with the proxy-side socket tuning applied:
/// `TCP_NODELAY` and the configured send/receive buffer sizes.
pub async fn connect_tuned(addr: &HostPort, buffer_size: usize) -> io::Result<TcpStream> {
    let mut last_err = None;
    for resolved in lookup_host((addr.host.as_str(), addr.port)).await? {
        let socket = if resolved.is_ipv4() {
            TcpSocket::new_v4()?
        } else {
            TcpSocket::new_v6()?
        };
        if let Err(e) = socket.set_recv_buffer_size(buffer_size as u32) {
            tracing::debug!("cannot set receive buffer size: {e}");
        }
        if let Err(e) = socket.set_send_buffer_size(buffer_size as u32) {
            tracing::debug!("cannot set send buffer size: {e}");
        }
        match socket.connect(resolved).await {
            Ok(stream) => {
                stream.set_nodelay(true)?;
                return Ok(stream);
            }
            Err(e) => last_err = Some(e),
        }
    }
    Err(last_err.unwrap_or_else(|| {
        io::Error::new(io::ErrorKind::NotFound, format!("no address resolved for {addr}"))
    }))
}

/// Keep-alive duration of a pooled connection: the `timeout=<n>` parameter
/// of the response's `Keep-Alive` header when present and parsable, else
/// the configured idle maximum.
pub fn keep_alive_duration(head: &ResponseHead, max_connection_idle: u64) -> Duration {
    if let Some(value) = head.header("Keep-Alive") {
        for element in value.split(',') {
            if let Some((name, v)) = element.split_once('=') {
                if name.trim().eq_ignore_ascii_case("timeout") {
                    if let Ok(secs) = v.trim().parse::<u64>() {
                        return Duration::from_millis(secs * 1000);
                    }
                }
            }
        }
    }
    Duration::from_millis(max_connection_idle * 1000)
}

struct IdleConn {
    stream: TcpStream,
    authenticated: bool,
    idle_since: Instant,
    expire_at: Instant,
}

#[derive(Default)]
struct PoolInner {
    idle: HashMap<UpstreamRoute, VecDeque<IdleConn>>,
    /// Leased + idle connections per route.
    route_counts: HashMap<UpstreamRoute, usize>,
    total: usize,
}

struct PoolShared {
    max_total: Option<usize>,
    max_per_route: Option<usize>,
    max_idle: Duration,
    socket_buffer_size: usize,
    inner: Mutex<PoolInner>,
}

impl PoolShared {
    fn lock(&self) -> MutexGuard<'_, PoolInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn forget_one(inner: &mut PoolInner, route: &UpstreamRoute) {
        inner.total = inner.total.saturating_sub(1);
        if let Some(count) = inner.route_counts.get_mut(route) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                inner.route_counts.remove(route);
            }
        }
    }

    /// Closes the idle connection that has been parked the longest, on any
    /// route, to make room under the total cap. Returns false when every
    /// pooled connection is currently leased.
    fn evict_one_idle(inner: &mut PoolInner) -> bool {
        let oldest = inner
            .idle
            .iter()
            .filter(|(_, q)| !q.is_empty())
            .min_by_key(|(_, q)| q.front().map(|c| c.idle_since))
            .map(|(route, _)| route.clone());
        match oldest {
            Some(route) => {
                if let Some(queue) = inner.idle.get_mut(&route) {
                    queue.pop_front();
                }
                Self::forget_one(inner, &route);
                true
            }
            None => false,
        }
    }
}

/// Pools authenticated upstream connections across all worker tasks.
/// Internally synchronized; the lock is never held across I/O.
#[derive(Clone)]
pub struct ConnectionPool {
    shared: Arc<PoolShared>,
}

impl ConnectionPool {
    pub fn new(system: &SystemConfig) -> Self {
        ConnectionPool {
            shared: Arc::new(PoolShared {
                max_total: system.max_connections,
                max_per_route: system.max_connections_per_route,
                max_idle: Duration::from_secs(system.max_connection_idle),
                socket_buffer_size: system.socket_buffer_size,
                inner: Mutex::new(PoolInner::default()),
            }),
        }
    }

    /// Leases a connection for one request: a fresh idle connection on the
    /// route when available, a newly opened one otherwise.
    pub async fn lease(&self, route: &UpstreamRoute) -> Result<PooledConnection> {
        if let Some(idle) = self.checkout(route) {
            return Ok(PooledConnection {
                stream: Some(idle.stream),
                route: route.clone(),
                authenticated: idle.authenticated,
                reused: true,
                shared: Arc::clone(&self.shared),
            });
        }

        // Reserve a slot before dialing so concurrent leases observe the caps.
        {
            let mut inner = self.shared.lock();
            if let Some(max) = self.shared.max_total {
                if inner.total >= max && !PoolShared::evict_one_idle(&mut inner) {
                    return Err(ProxyError::UpstreamIo(io::Error::new(
                        io::ErrorKind::Other,
                        "upstream connection pool exhausted",
                    )));
                }
            }
            if let Some(max) = self.shared.max_per_route {
                if inner.route_counts.get(route).copied().unwrap_or(0) >= max {
                    return Err(ProxyError::UpstreamIo(io::Error::new(
                        io::ErrorKind::Other,
                        format!("connection pool exhausted for route to {}", route.target),
                    )));
                }
            }
            inner.total += 1;
            *inner.route_counts.entry(route.clone()).or_insert(0) += 1;
        }

        match connect_tuned(&route.proxy, self.shared.socket_buffer_size).await {
            Ok(stream) => Ok(PooledConnection {
                stream: Some(stream),
                route: route.clone(),
                authenticated: false,
                reused: false,
                shared: Arc::clone(&self.shared),
            }),
            Err(e) => {
                let mut inner = self.shared.lock();
                PoolShared::forget_one(&mut inner, route);
                Err(e.into())
            }
        }
    }

    fn checkout(&self, route: &UpstreamRoute) -> Option<IdleConn> {
        let mut inner = self.shared.lock();
        let now = Instant::now();
        let mut expired = 0usize;
        let picked = loop {
            let queue = inner.idle.get_mut(route)?;
            match queue.pop_front() {
                None => break None,
                Some(idle) if idle.expire_at > now => break Some(idle),
                Some(_) => expired += 1,
            }
        };
        for _ in 0..expired {
            PoolShared::forget_one(&mut inner, route);
        }
        picked
    }

    /// Returns a connection to the idle set for up to `keep_alive`.
    pub fn release(&self, mut conn: PooledConnection, keep_alive: Duration) {
        let Some(stream) = conn.stream.take() else {
            return;
        };
        let now = Instant::now();
        let mut inner = self.shared.lock();
        inner
            .idle
            .entry(conn.route.clone())
            .or_default()
            .push_back(IdleConn {
                stream,
                authenticated: conn.authenticated,
                idle_since: now,
                expire_at: now + keep_alive,
            });
    }

    /// Closes idle connections whose keep-alive window has elapsed.
    pub fn close_expired(&self) {
        let now = Instant::now();
        self.retain_idle(|idle| idle.expire_at > now);
    }

    /// Closes connections idle longer than the configured maximum.
    pub fn close_idle(&self) {
        let now = Instant::now();
        let max_idle = self.shared.max_idle;
        self.retain_idle(|idle| now.duration_since(idle.idle_since) < max_idle);
    }

    pub fn close_all(&self) {
        self.retain_idle(|_| false);
    }

    pub fn idle_count(&self) -> usize {
        let inner = self.shared.lock();
        inner.idle.values().map(VecDeque::len).sum()
    }

    fn retain_idle<F>(&self, keep: F)
    where
        F: Fn(&IdleConn) -> bool,
    {
        let mut inner = self.shared.lock();
        let routes: Vec<UpstreamRoute> = inner.idle.keys().cloned().collect();
        for route in routes {
            let removed = {
                let Some(queue) = inner.idle.get_mut(&route) else {
                    continue;
                };
                let before = queue.len();
                queue.retain(&keep);
                before - queue.len()
            };
            for _ in 0..removed {
                PoolShared::forget_one(&mut inner, &route);
            }
            if inner.idle.get(&route).map(VecDeque::is_empty).unwrap_or(false) {
                inner.idle.remove(&route);
            }
        }
    }
}

/// One leased upstream connection. Dropping it without a release closes
/// the socket and frees its pool slot.
pub struct PooledConnection {
    stream: Option<TcpStream>,
    route: UpstreamRoute,
    /// Set once the NTLM handshake has completed on this connection.
    pub authenticated: bool,
    /// Whether this lease reused an idle pooled connection.
    pub reused: bool,
    shared: Arc<PoolShared>,
}

impl PooledConnection {
    pub fn stream(&mut self) -> &mut TcpStream {
        self.stream.as_mut().expect("connection already released")
    }

    pub fn route(&self) -> &UpstreamRoute {
        &self.route
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        if self.stream.is_some() {
            let mut inner = self.shared.lock();
            PoolShared::forget_one(&mut inner, &self.route);
        }
    }
}
