//! Client configuration.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use zk_wire::MAX_PACKET_SIZE;

use crate::error::ZkError;

/// Default ZooKeeper client port
pub const DEFAULT_PORT: u16 = 2181;

/// One server of the ensemble
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Backend {
    /// Host name or IP address
    pub address: String,
    /// TCP port
    pub port: u16,
}

impl Backend {
    /// Create a backend entry
    pub fn new(address: impl Into<String>, port: u16) -> Self {
        Self {
            address: address.into(),
            port,
        }
    }

    /// Parse a comma-separated `host[:port]` list
    pub fn parse_list(list: &str) -> Result<Vec<Backend>, ZkError> {
        list.split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::parse)
            .collect()
    }
}

impl FromStr for Backend {
    type Err = ZkError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ZkError::InvalidAddress(s.to_string());

        // [v6]:port
        if let Some(rest) = s.strip_prefix('[') {
            let (host, tail) = rest.split_once(']').ok_or_else(invalid)?;
            let port = match tail.strip_prefix(':') {
                Some(port) => port.parse().map_err(|_| invalid())?,
                None if tail.is_empty() => DEFAULT_PORT,
                None => return Err(invalid()),
            };
            return Ok(Backend::new(host, port));
        }

        match s.rsplit_once(':') {
            Some((host, port)) if !host.is_empty() && !host.contains(':') => {
                Ok(Backend::new(host, port.parse().map_err(|_| invalid())?))
            }
            None if !s.is_empty() => Ok(Backend::new(s, DEFAULT_PORT)),
            _ => Err(invalid()),
        }
    }
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.address.contains(':') {
            write!(f, "[{}]:{}", self.address, self.port)
        } else {
            write!(f, "{}:{}", self.address, self.port)
        }
    }
}

/// Connect and backoff parameters for the backend pool
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// TCP connect timeout per attempt
    pub timeout: Duration,
    /// Consecutive failed attempts before the pool reports failure
    pub retries: u32,
    /// Initial delay between attempts
    pub delay: Duration,
    /// Upper bound for the exponential backoff
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            timeout: Duration::from_millis(3000),
            retries: 3,
            delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Backoff before attempt `attempt` (1-based count of failures so far)
    pub fn backoff(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(16);
        self.delay
            .checked_mul(1u32 << shift)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}

/// Client configuration
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Ensemble members
    pub servers: Vec<Backend>,
    /// Requested session timeout; the server may negotiate a different one
    pub session_timeout: Duration,
    /// Connect and backoff policy
    pub connect: RetryPolicy,
    /// Largest packet accepted from the server
    pub max_frame_size: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            servers: vec![Backend::new("127.0.0.1", DEFAULT_PORT)],
            session_timeout: Duration::from_millis(30000),
            connect: RetryPolicy::default(),
            max_frame_size: MAX_PACKET_SIZE,
        }
    }
}

impl ClientConfig {
    /// Configuration for the given servers with default settings
    pub fn new(servers: Vec<Backend>) -> Self {
        Self {
            servers,
            ..Self::default()
        }
    }

    /// Set the requested session timeout
    pub fn with_session_timeout(mut self, timeout: Duration) -> Self {
        self.session_timeout = timeout;
        self
    }

    /// Set the connect policy
    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.connect = policy;
        self
    }

    /// Set the packet size ceiling
    pub fn with_max_frame_size(mut self, max_frame_size: usize) -> Self {
        self.max_frame_size = max_frame_size;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_backends() {
        let list = Backend::parse_list("zk1:2182, zk2,[::1]:2183,[fe80::1]").unwrap();
        assert_eq!(
            list,
            vec![
                Backend::new("zk1", 2182),
                Backend::new("zk2", 2181),
                Backend::new("::1", 2183),
                Backend::new("fe80::1", 2181),
            ]
        );
        assert_eq!(list[2].to_string(), "[::1]:2183");
        assert!("zk1:notaport".parse::<Backend>().is_err());
        assert!(":2181".parse::<Backend>().is_err());
    }

    #[test]
    fn test_backoff_is_capped() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.backoff(1), Duration::from_millis(500));
        assert_eq!(policy.backoff(2), Duration::from_millis(1000));
        assert_eq!(policy.backoff(4), Duration::from_millis(4000));
        assert_eq!(policy.backoff(20), Duration::from_secs(30));
    }

    #[test]
    fn test_defaults() {
        let config = ClientConfig::default().with_session_timeout(Duration::from_secs(5));
        assert_eq!(config.session_timeout, Duration::from_secs(5));
        assert_eq!(config.connect.timeout, Duration::from_millis(3000));
        assert_eq!(config.connect.retries, 3);
        assert_eq!(config.max_frame_size, MAX_PACKET_SIZE);
    }
}
