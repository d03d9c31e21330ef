//! Transport configuration
//!
//! One `Config` serves both clients and servers; each reads the options
//! that apply to it.
//!
//! ```
//! use rpcwire::config::Config;
//! use std::time::Duration;
//!
//! let config = Config::builder()
//!     .pool_limit(2)
//!     .pool_timeout_millis(100)
//!     .request_timeout(Duration::from_secs(5))
//!     .worker_threads(8)
//!     .build();
//! assert_eq!(config.worker_threads, 8);
//! ```

use crate::http::tls::TlsSettings;
use crate::http::DEFAULT_MAX_HEADER_SIZE;
use std::time::Duration;

pub use crate::net::PoolLimit;

/// Default number of worker threads
pub const DEFAULT_WORKER_THREADS: usize = 4;

/// Transport options
#[derive(Debug, Clone)]
pub struct Config {
    /// Cap on concurrently checked-out connections per destination
    pub pool_limit: PoolLimit,
    /// How long `acquire` waits at the cap; `None` waits forever
    pub pool_timeout: Option<Duration>,
    /// Deadline for one request; `None` means no deadline
    pub request_timeout: Option<Duration>,
    /// Idle connections older than this are closed
    pub idle_timeout: Option<Duration>,
    pub tls: Option<TlsSettings>,
    /// Encode response bodies with a negotiated encoding
    pub compress_responses: bool,
    pub worker_threads: usize,
    pub max_header_size: usize,
    /// Server only: accepted sockets beyond this many are closed
    pub max_connections: Option<usize>,
    /// Client only: request body encoding to apply, by name
    pub request_encoding: Option<String>,
    pub user_agent: String,
    pub server_name: String,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            pool_limit: PoolLimit::Unbounded,
            pool_timeout: None,
            request_timeout: None,
            idle_timeout: None,
            tls: None,
            compress_responses: false,
            worker_threads: DEFAULT_WORKER_THREADS,
            max_header_size: DEFAULT_MAX_HEADER_SIZE,
            max_connections: None,
            request_encoding: None,
            user_agent: concat!("rpcwire/", env!("CARGO_PKG_VERSION")).to_string(),
            server_name: concat!("rpcwire/", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }
}

impl Config {
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::default()
    }
}

fn millis(ms: u64) -> Option<Duration> {
    (ms > 0).then(|| Duration::from_millis(ms))
}

/// Consuming builder for `Config`
#[derive(Debug, Clone, Default)]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    /// Zero means unbounded
    pub fn pool_limit(mut self, limit: usize) -> Self {
        self.config.pool_limit = PoolLimit::from(limit);
        self
    }

    pub fn pool_limit_of(mut self, limit: PoolLimit) -> Self {
        self.config.pool_limit = limit;
        self
    }

    pub fn pool_timeout(mut self, timeout: Duration) -> Self {
        self.config.pool_timeout = Some(timeout);
        self
    }

    /// Zero means wait forever
    pub fn pool_timeout_millis(mut self, ms: u64) -> Self {
        self.config.pool_timeout = millis(ms);
        self
    }

    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.config.request_timeout = Some(timeout);
        self
    }

    /// Zero means no deadline
    pub fn request_timeout_millis(mut self, ms: u64) -> Self {
        self.config.request_timeout = millis(ms);
        self
    }

    pub fn idle_timeout(mut self, timeout: Duration) -> Self {
        self.config.idle_timeout = Some(timeout);
        self
    }

    /// Zero means idle connections are kept indefinitely
    pub fn idle_timeout_millis(mut self, ms: u64) -> Self {
        self.config.idle_timeout = millis(ms);
        self
    }

    pub fn tls(mut self, settings: TlsSettings) -> Self {
        self.config.tls = Some(settings);
        self
    }

    pub fn compress_responses(mut self, enabled: bool) -> Self {
        self.config.compress_responses = enabled;
        self
    }

    pub fn worker_threads(mut self, threads: usize) -> Self {
        self.config.worker_threads = threads.max(1);
        self
    }

    pub fn max_header_size(mut self, size: usize) -> Self {
        self.config.max_header_size = size;
        self
    }

    pub fn max_connections(mut self, max: usize) -> Self {
        self.config.max_connections = Some(max);
        self
    }

    pub fn request_encoding(mut self, name: impl Into<String>) -> Self {
        self.config.request_encoding = Some(name.into());
        self
    }

    pub fn user_agent(mut self, agent: impl Into<String>) -> Self {
        self.config.user_agent = agent.into();
        self
    }

    pub fn server_name(mut self, name: impl Into<String>) -> Self {
        self.config.server_name = name.into();
        self
    }

    pub fn build(self) -> Config {
        self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.pool_limit, PoolLimit::Unbounded);
        assert!(config.pool_timeout.is_none());
        assert!(config.request_timeout.is_none());
        assert_eq!(config.worker_threads, DEFAULT_WORKER_THREADS);
        assert_eq!(config.max_header_size, DEFAULT_MAX_HEADER_SIZE);
        assert!(config.user_agent.starts_with("rpcwire/"));
    }

    #[test]
    fn test_zero_means_none() {
        let config = Config::builder()
            .pool_limit(0)
            .pool_timeout_millis(0)
            .request_timeout_millis(0)
            .idle_timeout_millis(0)
            .worker_threads(0)
            .build();
        assert_eq!(config.pool_limit, PoolLimit::Unbounded);
        assert!(config.pool_timeout.is_none());
        assert!(config.request_timeout.is_none());
        assert!(config.idle_timeout.is_none());
        assert_eq!(config.worker_threads, 1);
    }

    #[test]
    fn test_builder_values() {
        let config = Config::builder()
            .pool_limit_of(PoolLimit::AtMost(3))
            .pool_timeout_millis(250)
            .compress_responses(true)
            .server_name("test-server")
            .build();
        assert_eq!(config.pool_limit, PoolLimit::AtMost(3));
        assert_eq!(config.pool_timeout, Some(Duration::from_millis(250)));
        assert!(config.compress_responses);
        assert_eq!(config.server_name, "test-server");
    }
}
