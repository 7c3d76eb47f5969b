//! Shared server state, built once in `main` and handed to every task

use std::sync::Arc;

use tungate::{ConnectionLimiter, IpRateLimiter, RateLimiter, ReclaimPolicy};

use crate::config::ServerConfig;
use crate::registry::{ControlRegistry, TunnelRegistry};
use crate::tls::TlsConfig;

pub struct ServerContext {
    pub tunnels: Arc<TunnelRegistry>,
    pub controls: ControlRegistry,
    pub ip_limiter: IpRateLimiter,
    pub conn_limiter: Arc<ConnectionLimiter>,
    pub tls: TlsConfig,
}

impl ServerContext {
    pub fn new(config: &ServerConfig, tls: TlsConfig) -> Self {
        let ip_options = config.limiter_options(config.ip_rate, config.ip_burst);
        let conn_options = config.limiter_options(config.conn_rate, config.conn_burst);

        Self {
            tunnels: Arc::new(TunnelRegistry::new(
                config.registry_cache_size,
                config.domain.clone(),
            )),
            controls: ControlRegistry::new(),
            ip_limiter: IpRateLimiter::with_limiter(RateLimiter::new(ip_options)),
            conn_limiter: Arc::new(ConnectionLimiter::with_limiter(
                RateLimiter::new(conn_options),
                config.max_conns_per_ip,
            )),
            tls,
        }
    }

    /// Limiters whose idle buckets the daemon reclaims in the background
    pub fn limiters(&self) -> [&Arc<RateLimiter>; 2] {
        [self.ip_limiter.limiter(), self.conn_limiter.limiter()]
    }

    /// Whether the limiters were configured to reclaim idle buckets
    pub fn reclaims(&self) -> bool {
        self.limiters()
            .iter()
            .any(|limiter| limiter.options().reclaim_policy != ReclaimPolicy::Never)
    }
}

#[cfg(test)]
pub(crate) fn test_context() -> Arc<ServerContext> {
    let config = ServerConfig {
        domain: "tunnel.test".to_string(),
        ..ServerConfig::default()
    };
    Arc::new(ServerContext::new(&config, TlsConfig::disabled()))
}
