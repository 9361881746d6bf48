//! Long-polling client worker
//!
//! A supervisor task grows the number of shard workers as the registry grows.
//! Each shard worker loops forever over the configs assigned to its shard:
//! apply local failover files, long-poll the server for changed keys, fetch
//! the changed configs and notify listeners.

use std::collections::HashSet;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use futures::FutureExt;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::error::{ClientError, Result};
use crate::http::ServerHttpAgent;
use crate::local_config::LocalConfigStore;
use crate::metrics::{MetricsMonitor, Timer};
use crate::properties::ClientProperties;

use super::cache::{CacheData, ConfigKey};
use super::filter::ConfigFilterChainManager;
use super::probe::{encode_probe, parse_changed_keys};
use super::registry::WatchRegistry;

pub const CONFIG_PATH: &str = "/v1/cs/configs";
pub const CONFIG_LISTENER_PATH: &str = "/v1/cs/configs/listener";

pub const PROBE_MODIFY_REQUEST: &str = "Listening-Configs";
pub const LONG_PULLING_TIMEOUT: &str = "Long-Pulling-Timeout";
pub const LONG_PULLING_TIMEOUT_NO_HANGUP: &str = "Long-Pulling-Timeout-No-Hangup";
pub const ENCRYPTED_DATA_KEY_HEADER: &str = "Encrypted-Data-Key";
pub const CONFIG_TYPE_HEADER: &str = "Config-Type";

/// Result of a plain config fetch
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ConfigQueryResult {
    /// `None` when the config does not exist on the server
    pub content: Option<String>,
    pub encrypted_data_key: Option<String>,
    pub config_type: Option<String>,
}

/// Sharded long-polling scheduler
pub struct ClientWorker {
    agent: Arc<ServerHttpAgent>,
    store: Arc<dyn LocalConfigStore>,
    registry: WatchRegistry,
    filter_chain: Arc<ConfigFilterChainManager>,
    metrics: Arc<MetricsMonitor>,
    long_poll_timeout: Duration,
    query_timeout: Duration,
    supervisor_interval: Duration,
    task_penalty: Duration,
    idle_backoff: Duration,
    healthy: AtomicBool,
    current_task_count: AtomicUsize,
    supervisor: Mutex<Option<JoinHandle<()>>>,
    shard_tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl ClientWorker {
    pub fn new(
        properties: &ClientProperties,
        agent: Arc<ServerHttpAgent>,
        store: Arc<dyn LocalConfigStore>,
        filter_chain: Arc<ConfigFilterChainManager>,
        metrics: Arc<MetricsMonitor>,
    ) -> Self {
        Self {
            agent,
            store,
            registry: WatchRegistry::new(properties.per_task_size()),
            filter_chain,
            metrics,
            long_poll_timeout: properties.long_poll_timeout(),
            query_timeout: properties.query_timeout(),
            supervisor_interval: properties.supervisor_interval(),
            task_penalty: properties.task_penalty(),
            idle_backoff: properties.idle_backoff(),
            healthy: AtomicBool::new(true),
            current_task_count: AtomicUsize::new(0),
            supervisor: Mutex::new(None),
            shard_tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn registry(&self) -> &WatchRegistry {
        &self.registry
    }

    pub fn agent(&self) -> &Arc<ServerHttpAgent> {
        &self.agent
    }

    pub fn store(&self) -> &Arc<dyn LocalConfigStore> {
        &self.store
    }

    /// Whether the last long poll reached a server
    pub fn is_health_server(&self) -> bool {
        self.healthy.load(Ordering::Acquire)
    }

    fn set_health_server(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::Release);
    }

    /// Number of shard workers launched so far
    pub fn current_task_count(&self) -> usize {
        self.current_task_count.load(Ordering::Acquire)
    }

    pub fn get_cache(&self, key: &ConfigKey) -> Option<Arc<CacheData>> {
        self.registry.get(key)
    }

    /// Get the watched entry for `key`, creating it on first use.
    ///
    /// A new entry is seeded from the failover file, or failing that from the
    /// snapshot, before it becomes visible to the shard workers.
    pub fn add_cache_data_if_absent(&self, key: &ConfigKey) -> Arc<CacheData> {
        if let Some(cache) = self.registry.get(key) {
            return cache;
        }

        let candidate = CacheData::new(key.clone(), self.filter_chain.clone());
        self.load_local_content(&candidate);

        let cache = self.registry.insert_if_absent(candidate);
        self.metrics.set_listen_config_count(self.registry.len());
        cache
    }

    fn load_local_content(&self, cache: &CacheData) {
        let key = cache.key();
        let local = match self.store.read_override(key) {
            Ok(Some(failover)) => Some((
                failover.content,
                self.store.read_override_data_key(key),
            )),
            Ok(None) => None,
            Err(e) => {
                warn!(key = %key, error = %e, "Failed to read failover file");
                None
            }
        };

        let (content, data_key) = match local {
            Some((content, data_key)) => (Some(content), data_key),
            None => match self.store.read_snapshot(key) {
                Ok(content) => (content, self.store.read_snapshot_data_key(key)),
                Err(e) => {
                    warn!(key = %key, error = %e, "Failed to read snapshot");
                    (None, Ok(None))
                }
            },
        };

        cache.set_content(content);
        match data_key {
            Ok(data_key) => cache.set_encrypted_data_key(data_key),
            Err(e) => warn!(key = %key, error = %e, "Failed to read encrypted data key"),
        }
    }

    /// Stop watching `key`. The entry is dropped without flushing anything.
    pub fn remove_cache(&self, key: &ConfigKey) -> Option<Arc<CacheData>> {
        let removed = self.registry.remove(key);
        if removed.is_some() {
            self.metrics.set_listen_config_count(self.registry.len());
        }
        removed
    }

    /// Fetch a config from the server and record the result as the snapshot.
    pub async fn get_server_config(&self, key: &ConfigKey, timeout: Duration) -> Result<ConfigQueryResult> {
        let mut params = vec![
            ("dataId".to_string(), key.data_id.clone()),
            ("group".to_string(), key.group.clone()),
        ];
        if !key.tenant.is_empty() {
            params.push(("tenant".to_string(), key.tenant.clone()));
        }

        let timer = Timer::start(&self.metrics, "query");
        let result = match self
            .agent
            .http_get(CONFIG_PATH, &[], &params, timeout)
            .await
        {
            Ok(result) => result,
            Err(e) => {
                timer.failure(error_type(&e));
                error!(key = %key, error = %e, "Failed to query config");
                return Err(e);
            }
        };

        match result.code {
            200 => {
                timer.success();
                let encrypted_data_key = result
                    .header(ENCRYPTED_DATA_KEY_HEADER)
                    .map(str::to_string);
                let config_type = result.header(CONFIG_TYPE_HEADER).map(str::to_string);
                let query = ConfigQueryResult {
                    content: Some(result.body),
                    encrypted_data_key,
                    config_type,
                };
                self.save_snapshot(key, query.content.as_deref(), query.encrypted_data_key.as_deref());
                Ok(query)
            }
            404 => {
                timer.success();
                self.save_snapshot(key, None, None);
                Ok(ConfigQueryResult::default())
            }
            409 => {
                timer.failure("conflict");
                error!(key = %key, "Config is being modified concurrently");
                Err(ClientError::Conflict(key.to_string()))
            }
            403 => {
                timer.failure("forbidden");
                error!(key = %key, "No permission to read config");
                Err(ClientError::PermissionDenied(key.to_string()))
            }
            code => {
                timer.failure("server_error");
                error!(key = %key, code, "Unexpected response when querying config");
                Err(ClientError::ServerError {
                    code,
                    message: result.body,
                })
            }
        }
    }

    fn save_snapshot(&self, key: &ConfigKey, content: Option<&str>, data_key: Option<&str>) {
        if let Err(e) = self.store.write_snapshot(key, content) {
            warn!(key = %key, error = %e, "Failed to write snapshot");
        }
        if let Err(e) = self.store.write_snapshot_data_key(key, data_key) {
            warn!(key = %key, error = %e, "Failed to write encrypted data key snapshot");
        }
    }

    /// Apply failover file changes to `cache`.
    ///
    /// Returns `true` when the entry's content was replaced from a failover file.
    pub fn check_local_config(&self, cache: &CacheData) -> bool {
        let key = cache.key();
        let version = match self.store.override_version(key) {
            Ok(version) => version,
            Err(e) => {
                warn!(key = %key, error = %e, "Failed to stat failover file");
                None
            }
        };

        match (cache.is_use_local_config(), version) {
            (false, Some(_)) => {
                if self.load_failover(cache) {
                    info!(key = %key, md5 = %cache.md5(), "Failover file created, using local config");
                    return true;
                }
                false
            }
            (true, None) => {
                cache.set_use_local_config(false);
                info!(key = %key, "Failover file deleted, no longer using local config");
                false
            }
            (true, Some(version)) if version != cache.local_config_version() => {
                if self.load_failover(cache) {
                    info!(key = %key, md5 = %cache.md5(), "Failover file changed, reloaded local config");
                    return true;
                }
                false
            }
            _ => false,
        }
    }

    fn load_failover(&self, cache: &CacheData) -> bool {
        let key = cache.key();
        match self.store.read_override(key) {
            Ok(Some(failover)) => {
                cache.set_use_local_config(true);
                cache.set_local_config_version(failover.version);
                cache.set_content(Some(failover.content));
                match self.store.read_override_data_key(key) {
                    Ok(data_key) => cache.set_encrypted_data_key(data_key),
                    Err(e) => warn!(key = %key, error = %e, "Failed to read failover data key"),
                }
                true
            }
            Ok(None) => false,
            Err(e) => {
                warn!(key = %key, error = %e, "Failed to read failover file");
                false
            }
        }
    }

    /// Long-poll the server with the digests of `caches`.
    ///
    /// Returns the keys the server reports as changed. With `initializing` set
    /// the server answers immediately instead of holding the request.
    pub async fn check_update_data_ids(&self, caches: &[Arc<CacheData>], initializing: bool) -> Result<Vec<ConfigKey>> {
        if caches.is_empty() {
            return Ok(Vec::new());
        }

        let probe = encode_probe(caches.iter().map(|cache| cache.as_ref()));
        let hold_ms = self.long_poll_timeout.as_millis().to_string();
        let mut headers = vec![(LONG_PULLING_TIMEOUT.to_string(), hold_ms)];
        if initializing {
            headers.push((LONG_PULLING_TIMEOUT_NO_HANGUP.to_string(), "true".to_string()));
        }
        let params = vec![(PROBE_MODIFY_REQUEST.to_string(), probe)];

        // leave the server time to answer before the hold expires on our side
        let read_timeout = self.long_poll_timeout + self.long_poll_timeout / 2;

        let timer = Timer::start(&self.metrics, "long_poll");
        match self
            .agent
            .http_post(CONFIG_LISTENER_PATH, &headers, &params, read_timeout)
            .await
        {
            Ok(result) if result.is_ok() => {
                timer.success();
                self.set_health_server(true);
                Ok(parse_changed_keys(&result.body))
            }
            Ok(result) => {
                timer.failure("server_error");
                self.set_health_server(false);
                error!(code = result.code, "Long poll rejected by server");
                Ok(Vec::new())
            }
            Err(e) => {
                timer.failure(error_type(&e));
                self.set_health_server(false);
                error!(error = %e, "Long poll failed");
                Err(e)
            }
        }
    }

    /// Run one poll/reconcile round for shard `task_id`.
    pub async fn run_shard_iteration(&self, task_id: usize) -> Result<()> {
        let caches = self.registry.entries_for_task(task_id);

        let mut probe = Vec::new();
        let mut initializing = HashSet::new();
        for cache in &caches {
            self.check_local_config(cache);
            if cache.is_use_local_config() {
                cache.check_listener_md5().await;
                continue;
            }
            if cache.is_initializing() {
                initializing.insert(cache.key().clone());
            }
            probe.push(cache.clone());
        }

        if probe.is_empty() {
            tokio::time::sleep(self.idle_backoff).await;
        } else {
            let changed = self
                .check_update_data_ids(&probe, !initializing.is_empty())
                .await?;
            for key in changed {
                self.refresh_changed(&key).await;
            }
        }

        for cache in &caches {
            if !cache.is_initializing() || initializing.contains(cache.key()) {
                cache.check_listener_md5().await;
                cache.set_initializing(false);
            }
        }
        Ok(())
    }

    async fn refresh_changed(&self, key: &ConfigKey) {
        let Some(cache) = self.registry.get(key) else {
            debug!(key = %key, "Changed config is no longer watched");
            return;
        };

        match self.get_server_config(key, self.query_timeout).await {
            Ok(query) => {
                cache.set_content(query.content);
                cache.set_encrypted_data_key(query.encrypted_data_key);
                cache.set_config_type(query.config_type);
                info!(key = %key, md5 = %cache.md5(), "Config changed on server");
            }
            Err(e) => {
                error!(key = %key, error = %e, "Failed to fetch changed config");
            }
        }
    }

    /// Number of shard workers the current registry needs
    pub fn required_task_count(&self) -> usize {
        self.registry.required_task_count()
    }

    /// Start the supervisor.
    pub fn start(self: &Arc<Self>) {
        let mut supervisor = self.supervisor.lock();
        if supervisor.is_some() {
            return;
        }

        let worker: Weak<Self> = Arc::downgrade(self);
        let interval = self.supervisor_interval.max(Duration::from_millis(1));
        *supervisor = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                let Some(worker) = worker.upgrade() else {
                    break;
                };
                worker.check_config_info();
            }
        }));
        info!(interval = ?interval, "Client worker started");
    }

    /// Launch shard workers until they cover the registry. Never shrinks.
    pub fn check_config_info(self: &Arc<Self>) {
        let required = self.required_task_count();
        let mut shard_tasks = self.shard_tasks.lock();
        let current = self.current_task_count();
        if required <= current {
            return;
        }

        for task_id in current..required {
            let worker = self.clone();
            shard_tasks.push(tokio::spawn(worker.run_shard(task_id)));
            info!(task_id, "Started long-polling shard");
        }
        self.current_task_count.store(required, Ordering::Release);
    }

    async fn run_shard(self: Arc<Self>, task_id: usize) {
        loop {
            match AssertUnwindSafe(self.run_shard_iteration(task_id))
                .catch_unwind()
                .await
            {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    error!(task_id, error = %e, "Long-polling iteration failed");
                    tokio::time::sleep(self.task_penalty).await;
                }
                Err(_) => {
                    error!(task_id, "Long-polling iteration panicked");
                    tokio::time::sleep(self.task_penalty).await;
                }
            }
        }
    }

    /// Abort the supervisor and every shard worker.
    pub fn shutdown(&self) {
        if let Some(handle) = self.supervisor.lock().take() {
            handle.abort();
        }
        let shard_tasks = std::mem::take(&mut *self.shard_tasks.lock());
        if !shard_tasks.is_empty() {
            info!(count = shard_tasks.len(), "Stopping long-polling shards");
        }
        for handle in shard_tasks {
            handle.abort();
        }
    }
}

impl Drop for ClientWorker {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn error_type(e: &ClientError) -> &'static str {
    match e {
        ClientError::Timeout => "timeout",
        ClientError::NoAvailableServer { .. } => "no_available_server",
        ClientError::Http(_) => "transport",
        _ => "other",
    }
}
