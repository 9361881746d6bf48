//! Client properties
//!
//! Every tunable of the watch client lives in [`ClientProperties`]. Values can be
//! set in code through the `with_*` builders or loaded from an optional config
//! file layered under `BATATA_CLIENT_*` environment variables.

use std::path::{Path, PathBuf};
use std::time::Duration;

use config::{Config, Environment, File};
use serde::Deserialize;

use crate::error::Result;

pub const DEFAULT_PER_TASK_CONFIG_SIZE: usize = 3000;
pub const DEFAULT_LONG_POLL_TIMEOUT_MS: u64 = 30_000;
pub const DEFAULT_QUERY_TIMEOUT_MS: u64 = 3_000;
pub const DEFAULT_SERVER_LIST_REFRESH_MS: u64 = 30_000;
pub const DEFAULT_SERVER_PORT: u16 = 8848;
pub const DEFAULT_ENDPOINT_PORT: u16 = 8080;

const ENV_PREFIX: &str = "BATATA_CLIENT";

/// Configuration of a config watch client
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct ClientProperties {
    /// Fixed server addresses (`host[:port]` or full URL)
    pub server_addr: Vec<String>,
    /// Address server used to discover the server list when no fixed list is given
    pub endpoint: Option<String>,
    pub endpoint_port: u16,
    pub endpoint_context_path: String,
    pub endpoint_cluster_name: String,
    /// Context path on config servers (e.g. "nacos")
    pub context_path: String,
    /// Tenant applied to keys created through the config service
    pub namespace: String,
    /// Environment directory name for the local store; derived when empty
    pub env_name: String,
    /// Root of the local override/snapshot trees
    pub local_store_path: Option<PathBuf>,
    pub snapshot_enabled: bool,
    /// Maximum number of keys polled by one shard worker
    pub per_task_config_size: usize,
    pub long_poll_timeout_ms: u64,
    pub query_timeout_ms: u64,
    pub server_list_refresh_interval_ms: u64,
    pub init_server_list_retry_times: usize,
    pub supervisor_interval_ms: u64,
    pub task_penalty_ms: u64,
    pub idle_backoff_ms: u64,
}

impl Default for ClientProperties {
    fn default() -> Self {
        Self {
            server_addr: Vec::new(),
            endpoint: None,
            endpoint_port: DEFAULT_ENDPOINT_PORT,
            endpoint_context_path: "nacos".to_string(),
            endpoint_cluster_name: "serverlist".to_string(),
            context_path: "nacos".to_string(),
            namespace: String::new(),
            env_name: String::new(),
            local_store_path: None,
            snapshot_enabled: true,
            per_task_config_size: DEFAULT_PER_TASK_CONFIG_SIZE,
            long_poll_timeout_ms: DEFAULT_LONG_POLL_TIMEOUT_MS,
            query_timeout_ms: DEFAULT_QUERY_TIMEOUT_MS,
            server_list_refresh_interval_ms: DEFAULT_SERVER_LIST_REFRESH_MS,
            init_server_list_retry_times: 5,
            supervisor_interval_ms: 10,
            task_penalty_ms: 2_000,
            idle_backoff_ms: 100,
        }
    }
}

impl ClientProperties {
    /// Create properties with a single fixed server
    pub fn new(server_addr: &str) -> Self {
        Self {
            server_addr: vec![server_addr.to_string()],
            ..Default::default()
        }
    }

    /// Create properties with several fixed servers
    pub fn with_servers(server_addrs: Vec<String>) -> Self {
        Self {
            server_addr: server_addrs,
            ..Default::default()
        }
    }

    /// Create properties that discover servers through an address server
    pub fn with_endpoint(endpoint: &str) -> Self {
        Self {
            endpoint: Some(endpoint.to_string()),
            ..Default::default()
        }
    }

    /// Load properties from an optional file, overridden by `BATATA_CLIENT_*` variables.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(File::from(path).required(true));
        }
        builder = builder.add_source(
            Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("_")
                .separator("__")
                .list_separator(",")
                .with_list_parse_key("server_addr")
                .try_parsing(true),
        );

        let properties = builder.build()?.try_deserialize()?;
        Ok(properties)
    }

    pub fn with_namespace(mut self, namespace: &str) -> Self {
        self.namespace = namespace.to_string();
        self
    }

    pub fn with_context_path(mut self, path: &str) -> Self {
        self.context_path = path.to_string();
        self
    }

    pub fn with_local_store_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.local_store_path = Some(path.into());
        self
    }

    pub fn with_per_task_config_size(mut self, size: usize) -> Self {
        self.per_task_config_size = size;
        self
    }

    /// Set long-poll hold and plain fetch timeouts
    pub fn with_timeouts(mut self, long_poll_ms: u64, query_ms: u64) -> Self {
        self.long_poll_timeout_ms = long_poll_ms;
        self.query_timeout_ms = query_ms;
        self
    }

    pub fn with_refresh_interval(mut self, interval_ms: u64) -> Self {
        self.server_list_refresh_interval_ms = interval_ms;
        self
    }

    /// Whether the server list is fixed rather than discovered
    pub fn is_fixed(&self) -> bool {
        !self.server_addr.is_empty()
    }

    /// Per-shard capacity, never zero
    pub fn per_task_size(&self) -> usize {
        self.per_task_config_size.max(1)
    }

    pub fn long_poll_timeout(&self) -> Duration {
        Duration::from_millis(self.long_poll_timeout_ms)
    }

    pub fn query_timeout(&self) -> Duration {
        Duration::from_millis(self.query_timeout_ms)
    }

    pub fn refresh_interval(&self) -> Duration {
        Duration::from_millis(self.server_list_refresh_interval_ms)
    }

    pub fn supervisor_interval(&self) -> Duration {
        Duration::from_millis(self.supervisor_interval_ms.max(1))
    }

    pub fn task_penalty(&self) -> Duration {
        Duration::from_millis(self.task_penalty_ms)
    }

    pub fn idle_backoff(&self) -> Duration {
        Duration::from_millis(self.idle_backoff_ms)
    }

    /// Address server URL, if discovery is configured
    pub fn address_server_url(&self) -> Option<String> {
        let endpoint = self.endpoint.as_deref()?.trim();
        if endpoint.is_empty() {
            return None;
        }
        let host = if endpoint.contains(':') {
            endpoint.to_string()
        } else {
            format!("{}:{}", endpoint, self.endpoint_port)
        };
        Some(format!(
            "http://{}/{}/{}",
            host,
            self.endpoint_context_path.trim_matches('/'),
            self.endpoint_cluster_name.trim_matches('/')
        ))
    }

    /// Name of the local store environment
    pub fn resolved_env_name(&self) -> String {
        if !self.env_name.is_empty() {
            return self.env_name.clone();
        }
        if self.is_fixed() {
            let joined = self
                .server_addr
                .iter()
                .map(|addr| {
                    addr.trim_start_matches("http://")
                        .trim_start_matches("https://")
                        .replace([':', '/'], "_")
                })
                .collect::<Vec<_>>()
                .join("-");
            return format!("fixed-{}", joined);
        }
        match &self.endpoint {
            Some(endpoint) => format!(
                "{}-{}",
                endpoint.replace(':', "_"),
                self.endpoint_cluster_name
            ),
            None => "default".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_properties_default() {
        let props = ClientProperties::default();
        assert_eq!(props.per_task_config_size, 3000);
        assert_eq!(props.long_poll_timeout(), Duration::from_secs(30));
        assert_eq!(props.query_timeout(), Duration::from_secs(3));
        assert_eq!(props.refresh_interval(), Duration::from_secs(30));
        assert!(props.snapshot_enabled);
        assert!(!props.is_fixed());
    }

    #[test]
    fn test_properties_builder() {
        let props = ClientProperties::new("127.0.0.1:8848")
            .with_namespace("dev")
            .with_context_path("/config")
            .with_per_task_config_size(10)
            .with_timeouts(5000, 1000);

        assert!(props.is_fixed());
        assert_eq!(props.namespace, "dev");
        assert_eq!(props.context_path, "/config");
        assert_eq!(props.per_task_size(), 10);
        assert_eq!(props.long_poll_timeout_ms, 5000);
        assert_eq!(props.query_timeout_ms, 1000);
    }

    #[test]
    fn test_per_task_size_never_zero() {
        let props = ClientProperties::default().with_per_task_config_size(0);
        assert_eq!(props.per_task_size(), 1);
    }

    #[test]
    fn test_address_server_url() {
        let props = ClientProperties::with_endpoint("address.example.com");
        assert_eq!(
            props.address_server_url().as_deref(),
            Some("http://address.example.com:8080/nacos/serverlist")
        );

        let props = ClientProperties::with_endpoint("address.example.com:9090");
        assert_eq!(
            props.address_server_url().as_deref(),
            Some("http://address.example.com:9090/nacos/serverlist")
        );

        assert!(ClientProperties::default().address_server_url().is_none());
    }

    #[test]
    fn test_resolved_env_name() {
        let props = ClientProperties::with_servers(vec![
            "10.0.0.1:8848".to_string(),
            "http://10.0.0.2:8848".to_string(),
        ]);
        assert_eq!(
            props.resolved_env_name(),
            "fixed-10.0.0.1_8848-10.0.0.2_8848"
        );

        let props = ClientProperties::with_endpoint("jmenv.example.com");
        assert_eq!(props.resolved_env_name(), "jmenv.example.com-serverlist");

        let mut props = ClientProperties::default();
        props.env_name = "custom".to_string();
        assert_eq!(props.resolved_env_name(), "custom");
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("client.yaml");
        std::fs::write(
            &path,
            "server_addr:\n  - 127.0.0.1:8848\n  - 127.0.0.2:8848\nnamespace: prod\nper_task_config_size: 500\nlong_poll_timeout_ms: 10000\n",
        )
        .unwrap();

        let props = ClientProperties::load(Some(&path)).unwrap();
        assert_eq!(props.server_addr.len(), 2);
        assert_eq!(props.namespace, "prod");
        assert_eq!(props.per_task_config_size, 500);
        assert_eq!(props.long_poll_timeout_ms, 10000);
        // untouched options keep their defaults
        assert_eq!(props.query_timeout_ms, 3000);
    }

    #[test]
    fn test_load_missing_file_fails() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("absent.yaml");
        assert!(ClientProperties::load(Some(&path)).is_err());
    }
}
