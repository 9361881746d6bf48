//! Configuration management service
//!
//! Provides `BatataConfigService` for reading configs and listening for
//! changes through HTTP long polling.

pub mod cache;
pub mod filter;
pub mod listener;
pub mod probe;
pub mod registry;
pub mod worker;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tracing::{info, warn};

use crate::error::{ClientError, Result};
use crate::http::{HttpTransport, ReqwestTransport, ServerHttpAgent};
use crate::local_config::{LocalConfigInfoProcessor, LocalConfigStore, SnapshotSwitch};
use crate::metrics::MetricsMonitor;
use crate::notify::NotifyCenter;
use crate::properties::ClientProperties;
use crate::server_list::ServerListManager;

use self::cache::{ConfigKey, content_md5};
use self::filter::{ConfigFilter, ConfigFilterChainManager};
use self::listener::{ConfigChangeListener, ConfigResponse};
use self::worker::ClientWorker;

pub const DEFAULT_GROUP: &str = "DEFAULT_GROUP";

/// Nacos-compatible config service backed by HTTP long polling.
///
/// Owns every component of one connection to a config service. Dropping it
/// (or calling [`shutdown`](Self::shutdown)) stops all background tasks.
pub struct BatataConfigService {
    namespace: String,
    notify_center: Arc<NotifyCenter>,
    server_list: Arc<ServerListManager>,
    worker: Arc<ClientWorker>,
    local_config: Arc<LocalConfigInfoProcessor>,
    filter_chain: Arc<ConfigFilterChainManager>,
    metrics: Arc<MetricsMonitor>,
    closed: AtomicBool,
}

impl BatataConfigService {
    /// Create a config service using the default reqwest transport.
    pub fn new(properties: ClientProperties) -> Result<Self> {
        let transport = Arc::new(ReqwestTransport::new(properties.query_timeout())?);
        Self::with_transport(properties, transport)
    }

    /// Create a config service sending all traffic through `transport`.
    pub fn with_transport(properties: ClientProperties, transport: Arc<dyn HttpTransport>) -> Result<Self> {
        let notify_center = Arc::new(NotifyCenter::new());
        let metrics = Arc::new(MetricsMonitor::new()?);
        notify_center.register_listener(metrics.clone());

        let server_list = Arc::new(ServerListManager::new(
            &properties,
            transport.clone(),
            notify_center.clone(),
        )?);
        let agent = Arc::new(ServerHttpAgent::new(
            transport,
            server_list.clone(),
            &properties.context_path,
        ));
        let local_config = Arc::new(LocalConfigInfoProcessor::from_properties(&properties));
        let filter_chain = Arc::new(ConfigFilterChainManager::new());
        let worker = Arc::new(ClientWorker::new(
            &properties,
            agent,
            local_config.clone(),
            filter_chain.clone(),
            metrics.clone(),
        ));

        Ok(Self {
            namespace: properties.namespace.clone(),
            notify_center,
            server_list,
            worker,
            local_config,
            filter_chain,
            metrics,
            closed: AtomicBool::new(false),
        })
    }

    /// Start the server list manager and the long-polling worker.
    ///
    /// Fails only when no config server can be discovered.
    pub async fn start(&self) -> Result<()> {
        self.server_list.start().await?;
        self.metrics
            .server_list_size
            .set(self.server_list.server_urls().len() as i64);
        self.worker.start();
        info!(name = %self.server_list.name(), namespace = %self.namespace, "Config service started");
        Ok(())
    }

    fn config_key(&self, data_id: &str, group: &str) -> ConfigKey {
        let group = if group.trim().is_empty() {
            DEFAULT_GROUP
        } else {
            group.trim()
        };
        ConfigKey::new(data_id.trim(), group, &self.namespace)
    }

    /// Get a config value.
    ///
    /// A local failover file wins over the server. When the server cannot be
    /// reached the last snapshot is returned instead; permission errors are
    /// returned to the caller.
    pub async fn get_config(&self, data_id: &str, group: &str, timeout: Duration) -> Result<Option<String>> {
        let key = self.config_key(data_id, group);
        let mut response = self.query_config(&key, timeout).await?;
        self.filter_chain.do_filter_query(&mut response).await?;
        Ok(response.content)
    }

    /// Read the unfiltered value of `key` from the failover file, the server or the snapshot.
    async fn query_config(&self, key: &ConfigKey, timeout: Duration) -> Result<ConfigResponse> {
        let mut response = ConfigResponse {
            data_id: key.data_id.clone(),
            group: key.group.clone(),
            tenant: key.tenant.clone(),
            ..Default::default()
        };

        match self.local_config.read_override(key) {
            Ok(Some(failover)) => {
                warn!(key = %key, "Using failover content");
                response.content = Some(failover.content);
                response.encrypted_data_key = self.local_config.read_override_data_key(key).ok().flatten();
                return Ok(response);
            }
            Ok(None) => {}
            Err(e) => warn!(key = %key, error = %e, "Failed to read failover file"),
        }

        match self.worker.get_server_config(key, timeout).await {
            Ok(query) => {
                response.content = query.content;
                response.encrypted_data_key = query.encrypted_data_key;
                response.config_type = query.config_type;
            }
            Err(e @ ClientError::PermissionDenied(_)) => return Err(e),
            Err(e) => {
                warn!(key = %key, error = %e, "Failed to get config from server, using snapshot");
                response.content = self.local_config.read_snapshot(key).unwrap_or_else(|e| {
                    warn!(key = %key, error = %e, "Failed to read snapshot");
                    None
                });
                response.encrypted_data_key = self.local_config.read_snapshot_data_key(key).ok().flatten();
            }
        }
        Ok(response)
    }

    /// Get a config value and listen for later changes.
    ///
    /// The listener is only notified once the value differs from the one
    /// returned here.
    pub async fn get_config_and_sign_listener(
        &self,
        data_id: &str,
        group: &str,
        timeout: Duration,
        listener: Arc<dyn ConfigChangeListener>,
    ) -> Result<Option<String>> {
        let key = self.config_key(data_id, group);
        let mut response = self.query_config(&key, timeout).await?;
        // entries track the digest of the unfiltered value
        let md5 = content_md5(response.content.as_deref());
        self.filter_chain.do_filter_query(&mut response).await?;

        let cache = self.worker.add_cache_data_if_absent(&key);
        cache.add_listener_with_md5(listener, &md5);
        Ok(response.content)
    }

    /// Add a listener for config changes.
    ///
    /// The listener receives the current value on the next poll, then every
    /// later change.
    pub fn add_listener(&self, data_id: &str, group: &str, listener: Arc<dyn ConfigChangeListener>) {
        let cache = self.worker.add_cache_data_if_absent(&self.config_key(data_id, group));
        cache.add_listener(listener);
    }

    /// Remove a listener. The config stops being polled once it has none left.
    pub fn remove_listener(&self, data_id: &str, group: &str, listener: &Arc<dyn ConfigChangeListener>) {
        let key = self.config_key(data_id, group);
        if let Some(cache) = self.worker.get_cache(&key) {
            cache.remove_listener(listener);
            if !cache.has_listeners() {
                self.worker.remove_cache(&key);
            }
        }
    }

    /// `"UP"` when the last long poll reached a server, `"DOWN"` otherwise.
    pub fn server_status(&self) -> &'static str {
        if self.worker.is_health_server() {
            "UP"
        } else {
            "DOWN"
        }
    }

    pub fn add_filter(&self, filter: Arc<dyn ConfigFilter>) {
        self.filter_chain.add_filter(filter);
    }

    pub fn snapshot_switch(&self) -> &SnapshotSwitch {
        self.local_config.snapshot_switch()
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn notify_center(&self) -> &Arc<NotifyCenter> {
        &self.notify_center
    }

    pub fn server_list(&self) -> &Arc<ServerListManager> {
        &self.server_list
    }

    pub fn worker(&self) -> &Arc<ClientWorker> {
        &self.worker
    }

    pub fn metrics(&self) -> &Arc<MetricsMonitor> {
        &self.metrics
    }

    /// Stop the long-polling tasks and the server list refresh.
    pub fn shutdown(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.worker.shutdown();
        self.server_list.shutdown();
        info!(name = %self.server_list.name(), "Config service stopped");
    }
}

impl Drop for BatataConfigService {
    fn drop(&mut self) {
        self.shutdown();
    }
}
