// Shared per-process resources: credentials, pool, eviction timer
use crate::auth::CredentialsStore;
use crate::config::{Config, SystemConfig, UserConfig};
use crate::error::{ProxyError, Result};
use crate::http::HostPort;
use crate::pool::ConnectionPool;
use std::sync::{Mutex, PoisonError};
use tokio::task::JoinHandle;
use tokio::time::Duration;

/// Everything the request handlers share. Built once, started before the
/// listener binds, closed when the server shuts down.
pub struct ProxyContext {
    user: UserConfig,
    system: SystemConfig,
    credentials: CredentialsStore,
    pool: ConnectionPool,
    eviction_task: Mutex<Option<JoinHandle<()>>>,
}

impl ProxyContext {
    pub fn new(config: Config) -> Self {
        let Config { user, system } = config;
        ProxyContext {
            credentials: CredentialsStore::new(user.clone()),
            pool: ConnectionPool::new(&system),
            user,
            system,
            eviction_task: Mutex::new(None),
        }
    }

    /// Validates the configuration and, when enabled, starts the periodic
    /// eviction of expired and idle pooled connections. Failing here keeps
    /// the local port unbound.
    pub fn start(&self) -> Result<()> {
        if self.user.proxy_host.trim().is_empty() {
            return Err(ProxyError::Configuration("proxy_host is required".into()));
        }
        self.credentials.get()?;

        if self.system.eviction_enabled {
            tracing::info!("starting connection eviction timer");
            let pool = self.pool.clone();
            let period = Duration::from_secs(self.system.eviction_period.max(1));
            let task = tokio::spawn(async move {
                let mut ticker = tokio::time::interval(period);
                loop {
                    ticker.tick().await;
                    pool.close_expired();
                    pool.close_idle();
                }
            });
            let mut slot = self
                .eviction_task
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            if let Some(previous) = slot.replace(task) {
                previous.abort();
            }
        }
        Ok(())
    }

    /// Cancels the eviction timer and closes every pooled connection.
    pub fn close(&self) {
        tracing::info!("closing proxy context resources");
        let task = self
            .eviction_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(task) = task {
            task.abort();
        }
        self.pool.close_all();
    }

    pub fn credentials(&self) -> &CredentialsStore {
        &self.credentials
    }

    pub fn pool(&self) -> &ConnectionPool {
        &self.pool
    }

    pub fn user(&self) -> &UserConfig {
        &self.user
    }

    pub fn system(&self) -> &SystemConfig {
        &self.system
    }

    pub fn proxy_address(&self) -> HostPort {
        HostPort::new(self.user.proxy_host.clone(), self.user.proxy_port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::UpstreamRoute;
    use tokio::net::TcpListener;

    fn test_config(proxy_port: u16) -> Config {
        Config {
            user: UserConfig {
                username: "jdoe".into(),
                password: "secret".into(),
                domain: "CORP".into(),
                proxy_host: "127.0.0.1".into(),
                proxy_port,
                local_port: 0,
            },
            system: SystemConfig {
                eviction_enabled: true,
                eviction_period: 1,
                max_connection_idle: 1,
                ..SystemConfig::default()
            },
        }
    }

    #[test]
    fn start_rejects_missing_proxy_host() {
        let mut config = test_config(3128);
        config.user.proxy_host = String::new();
        let context = ProxyContext::new(config);
        // start() spawns nothing before validation, so a runtime is not needed
        assert!(matches!(
            context.start(),
            Err(ProxyError::Configuration(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn eviction_timer_clears_idle_connections() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let context = ProxyContext::new(test_config(port));
        context.start().unwrap();

        let route = UpstreamRoute {
            target: HostPort::new("example.com", 80),
            proxy: HostPort::new("127.0.0.1", port),
            tunnelled: false,
        };
        let conn = context.pool().lease(&route).await.unwrap();
        context.pool().release(conn, Duration::from_secs(1));
        assert_eq!(context.pool().idle_count(), 1);

        tokio::time::advance(Duration::from_secs(3)).await;
        tokio::task::yield_now().await;
        tokio::task::yield_now().await;
        assert_eq!(context.pool().idle_count(), 0);

        context.close();
    }
}
