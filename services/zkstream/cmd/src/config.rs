//! Configuration handling for the zkstream tool.
//!
//! Settings come from an optional YAML file, then environment variables,
//! then command-line flags (applied in `main`).

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info, warn};
use zk_session::{Backend, ClientConfig, RetryPolicy};

/// zkstream client configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ZkCliConfig {
    /// Ensemble members as `host[:port]`
    pub servers: Vec<String>,
    /// Requested session timeout (milliseconds)
    pub session_timeout_ms: u64,
    /// TCP connect timeout per attempt (milliseconds)
    pub connect_timeout_ms: u64,
    /// Failed attempts before giving up on the ensemble
    pub retries: u32,
    /// Initial reconnect delay (milliseconds)
    pub retry_delay_ms: u64,
    /// Reconnect delay ceiling (milliseconds)
    pub retry_max_delay_ms: u64,
}

impl Default for ZkCliConfig {
    fn default() -> Self {
        let policy = RetryPolicy::default();
        Self {
            servers: vec!["127.0.0.1:2181".to_string()],
            session_timeout_ms: 30000,
            connect_timeout_ms: policy.timeout.as_millis() as u64,
            retries: policy.retries,
            retry_delay_ms: policy.delay.as_millis() as u64,
            retry_max_delay_ms: policy.max_delay.as_millis() as u64,
        }
    }
}

/// Root configuration structure (matches the YAML structure)
#[derive(Debug, Deserialize)]
struct RootConfig {
    zookeeper: Option<ZookeeperSection>,
}

#[derive(Debug, Deserialize)]
struct ZookeeperSection {
    servers: Option<Vec<String>>,
    session_timeout_ms: Option<u64>,
    connect_timeout_ms: Option<u64>,
    retries: Option<u32>,
    retry_delay_ms: Option<u64>,
    retry_max_delay_ms: Option<u64>,
}

impl ZkCliConfig {
    /// Load configuration from file and environment variables
    pub fn load_from_file<P: AsRef<Path>>(config_path: P) -> Result<Self> {
        let mut config = Self::default();

        match std::fs::read_to_string(&config_path) {
            Ok(content) => {
                let root: RootConfig = serde_yaml::from_str(&content)
                    .with_context(|| format!("parsing {:?}", config_path.as_ref()))?;
                config.apply_root_config(root);
                info!("Loaded configuration from {:?}", config_path.as_ref());
            }
            Err(_) => debug!(
                "Config file {:?} not found, using defaults",
                config_path.as_ref()
            ),
        }

        config.apply_overrides(|key| std::env::var(key).ok());
        debug!(
            "zookeeper configuration: servers={}, session_timeout={}ms, connect_timeout={}ms",
            config.servers.join(","),
            config.session_timeout_ms,
            config.connect_timeout_ms
        );
        Ok(config)
    }

    fn apply_root_config(&mut self, root: RootConfig) {
        let Some(zk) = root.zookeeper else {
            return;
        };
        if let Some(servers) = zk.servers {
            self.servers = servers;
        }
        if let Some(ms) = zk.session_timeout_ms {
            self.session_timeout_ms = ms;
        }
        if let Some(ms) = zk.connect_timeout_ms {
            self.connect_timeout_ms = ms;
        }
        if let Some(retries) = zk.retries {
            self.retries = retries;
        }
        if let Some(ms) = zk.retry_delay_ms {
            self.retry_delay_ms = ms;
        }
        if let Some(ms) = zk.retry_max_delay_ms {
            self.retry_max_delay_ms = ms;
        }
    }

    /// Apply `ZK_*` overrides read through `lookup`
    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(servers) = lookup("ZK_SERVERS") {
            self.servers = servers
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect();
            info!("Servers overridden by environment: {}", servers);
        }

        for (key, field) in [
            ("ZK_SESSION_TIMEOUT_MS", &mut self.session_timeout_ms),
            ("ZK_CONNECT_TIMEOUT_MS", &mut self.connect_timeout_ms),
        ] {
            let Some(value) = lookup(key) else {
                continue;
            };
            match value.parse::<u64>() {
                Ok(ms) => {
                    *field = ms;
                    info!("{} overridden by environment: {}", key, ms);
                }
                Err(_) => warn!("Ignoring {}={}: not a number of milliseconds", key, value),
            }
        }
    }

    /// Replace the server list with a comma-separated `host:port` list
    pub fn set_servers(&mut self, list: &str) {
        self.servers = list.split(',').map(|s| s.trim().to_string()).collect();
    }

    /// Build the library configuration
    pub fn to_client_config(&self) -> Result<ClientConfig> {
        let servers = Backend::parse_list(&self.servers.join(","))?;
        if servers.is_empty() {
            anyhow::bail!("no zookeeper servers configured");
        }
        Ok(ClientConfig::new(servers)
            .with_session_timeout(Duration::from_millis(self.session_timeout_ms))
            .with_retry_policy(RetryPolicy {
                timeout: Duration::from_millis(self.connect_timeout_ms),
                retries: self.retries,
                delay: Duration::from_millis(self.retry_delay_ms),
                max_delay: Duration::from_millis(self.retry_max_delay_ms),
            }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_config() {
        let config = ZkCliConfig::default();
        assert_eq!(config.servers, vec!["127.0.0.1:2181"]);
        assert_eq!(config.session_timeout_ms, 30000);
        assert_eq!(config.connect_timeout_ms, 3000);
        assert_eq!(config.retries, 3);
    }

    #[test]
    fn test_load_from_file() {
        let yaml_content = r#"
zookeeper:
  servers:
    - zk1:2181
    - zk2:2182
  session_timeout_ms: 10000
  retries: 5
"#;

        let mut temp_file = NamedTempFile::new().unwrap();
        temp_file.write_all(yaml_content.as_bytes()).unwrap();

        let config = ZkCliConfig::load_from_file(temp_file.path()).unwrap();
        assert_eq!(config.servers, vec!["zk1:2181", "zk2:2182"]);
        assert_eq!(config.session_timeout_ms, 10000);
        assert_eq!(config.retries, 5);
        assert_eq!(config.connect_timeout_ms, 3000);
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let loaded = ZkCliConfig::load_from_file(dir.path().join("absent.yaml")).unwrap();
        assert_eq!(loaded.retries, 3);
        assert_eq!(loaded.retry_delay_ms, 500);
    }

    #[test]
    fn test_malformed_file_is_an_error() {
        let mut temp_file = NamedTempFile::new().unwrap();
        temp_file.write_all(b"zookeeper: [unclosed").unwrap();
        assert!(ZkCliConfig::load_from_file(temp_file.path()).is_err());
    }

    #[test]
    fn test_environment_overrides() {
        let env: HashMap<&str, &str> = [
            ("ZK_SERVERS", "a:1, b:2"),
            ("ZK_SESSION_TIMEOUT_MS", "4000"),
            ("ZK_CONNECT_TIMEOUT_MS", "soon"),
        ]
        .into_iter()
        .collect();

        let mut config = ZkCliConfig::default();
        config.apply_overrides(|key| env.get(key).map(|v| v.to_string()));
        assert_eq!(config.servers, vec!["a:1", "b:2"]);
        assert_eq!(config.session_timeout_ms, 4000);
        assert_eq!(config.connect_timeout_ms, 3000);
    }

    #[test]
    fn test_to_client_config() {
        let mut config = ZkCliConfig::default();
        config.set_servers("zk1,zk2:2182");
        config.session_timeout_ms = 8000;

        let client = config.to_client_config().unwrap();
        assert_eq!(
            client.servers,
            vec![Backend::new("zk1", 2181), Backend::new("zk2", 2182)]
        );
        assert_eq!(client.session_timeout, Duration::from_secs(8));
        assert_eq!(client.connect.delay, Duration::from_millis(500));

        config.servers.clear();
        assert!(config.to_client_config().is_err());
    }
}
