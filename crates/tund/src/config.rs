//! Command line options and the server configuration built from them

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{bail, Result};
use clap::Parser;
use tungate::RateLimiterOptions;

/// Longest accepted save or reclamation interval (one week)
pub const MAX_INTERVAL_SECS: u64 = 7 * 24 * 60 * 60;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Address for control and proxy connections
    #[arg(long, default_value = "0.0.0.0:4443")]
    pub tunnel_addr: String,

    /// Domain public tunnel URLs are created under
    #[arg(long, default_value = "tunnel.localhost")]
    pub domain: String,

    /// TLS certificate (PEM); requires --tls-key
    #[arg(long)]
    pub tls_crt: Option<PathBuf>,

    /// TLS private key (PEM); requires --tls-crt
    #[arg(long)]
    pub tls_key: Option<PathBuf>,

    /// File the tunnel affinity cache is restored from and saved to
    #[arg(long, env = "REGISTRY_CACHE_FILE")]
    pub registry_cache_file: Option<PathBuf>,

    /// Affinity cache capacity in bytes
    #[arg(long, default_value_t = 1024 * 1024)]
    pub registry_cache_size: u64,

    /// Seconds between affinity cache saves
    #[arg(long, default_value_t = 600)]
    pub registry_save_interval_secs: u64,

    /// New connections per second allowed from one IP
    #[arg(long, default_value_t = 10.0)]
    pub ip_rate: f64,

    /// Burst of new connections allowed from one IP
    #[arg(long, default_value_t = 20)]
    pub ip_burst: u32,

    /// Admitted connections per second per IP
    #[arg(long, default_value_t = 100.0)]
    pub conn_rate: f64,

    /// Burst for admitted connections per IP
    #[arg(long, default_value_t = 200)]
    pub conn_burst: u32,

    /// Concurrent connections one IP may hold
    #[arg(long, default_value_t = 50)]
    pub max_conns_per_ip: usize,

    /// Reclaim limiter buckets idle this many seconds (0 keeps them forever)
    #[arg(long, default_value_t = 600)]
    pub limiter_idle_secs: u64,

    /// Seconds between limiter reclamation passes
    #[arg(long, default_value_t = 600)]
    pub limiter_reclaim_interval_secs: u64,

    /// Default log filter when RUST_LOG is unset
    #[arg(long, default_value = "info")]
    pub log_level: String,

    /// Log destination: stdout, stderr, none or a file path
    #[arg(long, default_value = "stdout")]
    pub log_to: LogTarget,

    /// Health check mode (for Docker)
    #[arg(long)]
    pub health: bool,
}

/// Where log output goes
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogTarget {
    Stdout,
    Stderr,
    None,
    File(PathBuf),
}

impl FromStr for LogTarget {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "stdout" => LogTarget::Stdout,
            "stderr" => LogTarget::Stderr,
            "none" | "false" => LogTarget::None,
            path => LogTarget::File(PathBuf::from(path)),
        })
    }
}

/// Validated server settings
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub tunnel_addr: String,
    pub domain: String,
    pub tls: Option<(PathBuf, PathBuf)>,
    pub registry_cache_file: Option<PathBuf>,
    pub registry_cache_size: u64,
    pub registry_save_interval: Duration,
    pub ip_rate: f64,
    pub ip_burst: u32,
    pub conn_rate: f64,
    pub conn_burst: u32,
    pub max_conns_per_ip: usize,
    /// `None` disables bucket reclamation
    pub limiter_idle: Option<Duration>,
    pub limiter_reclaim_interval: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            tunnel_addr: "0.0.0.0:4443".to_string(),
            domain: "tunnel.localhost".to_string(),
            tls: None,
            registry_cache_file: None,
            registry_cache_size: 1024 * 1024,
            registry_save_interval: Duration::from_secs(600),
            ip_rate: 10.0,
            ip_burst: 20,
            conn_rate: 100.0,
            conn_burst: 200,
            max_conns_per_ip: 50,
            limiter_idle: Some(Duration::from_secs(600)),
            limiter_reclaim_interval: Duration::from_secs(600),
        }
    }
}

impl ServerConfig {
    pub fn from_args(args: &Args) -> Result<Self> {
        let tls = match (&args.tls_crt, &args.tls_key) {
            (Some(crt), Some(key)) => Some((crt.clone(), key.clone())),
            (None, None) => None,
            _ => bail!("--tls-crt and --tls-key must be given together"),
        };

        for (flag, secs) in [
            ("--registry-save-interval-secs", args.registry_save_interval_secs),
            ("--limiter-reclaim-interval-secs", args.limiter_reclaim_interval_secs),
            ("--limiter-idle-secs", args.limiter_idle_secs),
        ] {
            if secs > MAX_INTERVAL_SECS {
                bail!("{} must be at most {}", flag, MAX_INTERVAL_SECS);
            }
        }
        if args.registry_save_interval_secs == 0 {
            bail!("--registry-save-interval-secs must be positive");
        }
        if args.limiter_reclaim_interval_secs == 0 {
            bail!("--limiter-reclaim-interval-secs must be positive");
        }

        Ok(Self {
            tunnel_addr: args.tunnel_addr.clone(),
            domain: args.domain.clone(),
            tls,
            registry_cache_file: args.registry_cache_file.clone(),
            registry_cache_size: args.registry_cache_size,
            registry_save_interval: Duration::from_secs(args.registry_save_interval_secs),
            ip_rate: args.ip_rate,
            ip_burst: args.ip_burst,
            conn_rate: args.conn_rate,
            conn_burst: args.conn_burst,
            max_conns_per_ip: args.max_conns_per_ip,
            limiter_idle: (args.limiter_idle_secs > 0)
                .then(|| Duration::from_secs(args.limiter_idle_secs)),
            limiter_reclaim_interval: Duration::from_secs(args.limiter_reclaim_interval_secs),
        })
    }

    /// Limiter options carrying this config's reclamation settings
    pub fn limiter_options(&self, rate: f64, burst: u32) -> RateLimiterOptions {
        let options = RateLimiterOptions::new(rate, burst);
        match self.limiter_idle {
            Some(idle) => options.reclaim_idle(idle, self.limiter_reclaim_interval),
            None => options,
        }
    }
}
