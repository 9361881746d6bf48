//! Config cache data for tracking per-config state and listeners

use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

use md5::{Digest, Md5};
use parking_lot::RwLock;
use tracing::{error, info, warn};

use super::filter::ConfigFilterChainManager;
use super::listener::{ConfigChangeListener, ConfigResponse, ManagedListener};

/// Digest of an absent config. Distinct from the digest of empty content.
pub const ABSENT_MD5: &str = "";

/// Identity of a config item
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConfigKey {
    pub data_id: String,
    pub group: String,
    pub tenant: String,
}

impl ConfigKey {
    pub fn new(data_id: &str, group: &str, tenant: &str) -> Self {
        Self {
            data_id: data_id.to_string(),
            group: group.to_string(),
            tenant: tenant.to_string(),
        }
    }

    /// Build the cache key for this config.
    pub fn group_key(&self) -> String {
        build_cache_key(&self.data_id, &self.group, &self.tenant)
    }
}

impl fmt::Display for ConfigKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.group_key())
    }
}

#[derive(Default)]
struct CacheContent {
    content: Option<String>,
    md5: String,
    encrypted_data_key: Option<String>,
    config_type: Option<String>,
}

/// Cache entry for a single config item, tracking content, MD5, and listeners.
///
/// Content and digest change together under one lock; the remaining flags are
/// atomics so the polling task and listener management never contend on a
/// shared lock.
pub struct CacheData {
    key: ConfigKey,
    task_id: AtomicUsize,
    content: RwLock<CacheContent>,
    use_local_config: AtomicBool,
    local_config_version: AtomicU64,
    initializing: AtomicBool,
    listeners: RwLock<Vec<Arc<ManagedListener>>>,
    filter_chain: Arc<ConfigFilterChainManager>,
}

impl CacheData {
    /// Create a new CacheData for the given config key.
    pub fn new(key: ConfigKey, filter_chain: Arc<ConfigFilterChainManager>) -> Self {
        Self {
            key,
            task_id: AtomicUsize::new(0),
            content: RwLock::new(CacheContent {
                md5: ABSENT_MD5.to_string(),
                ..Default::default()
            }),
            use_local_config: AtomicBool::new(false),
            local_config_version: AtomicU64::new(0),
            initializing: AtomicBool::new(true),
            listeners: RwLock::new(Vec::new()),
            filter_chain,
        }
    }

    pub fn key(&self) -> &ConfigKey {
        &self.key
    }

    pub fn data_id(&self) -> &str {
        &self.key.data_id
    }

    pub fn group(&self) -> &str {
        &self.key.group
    }

    pub fn tenant(&self) -> &str {
        &self.key.tenant
    }

    /// Shard this entry is polled by
    pub fn task_id(&self) -> usize {
        self.task_id.load(Ordering::Acquire)
    }

    pub(crate) fn set_task_id(&self, task_id: usize) {
        self.task_id.store(task_id, Ordering::Release);
    }

    pub fn content(&self) -> Option<String> {
        self.content.read().content.clone()
    }

    pub fn md5(&self) -> String {
        self.content.read().md5.clone()
    }

    /// Update the content and recompute the MD5 hash.
    /// Returns `true` if the digest actually changed.
    pub fn set_content(&self, content: Option<String>) -> bool {
        let new_md5 = content_md5(content.as_deref());
        let mut state = self.content.write();
        let changed = state.md5 != new_md5;
        state.content = content;
        state.md5 = new_md5;
        changed
    }

    pub fn encrypted_data_key(&self) -> Option<String> {
        self.content.read().encrypted_data_key.clone()
    }

    pub fn set_encrypted_data_key(&self, encrypted_data_key: Option<String>) {
        self.content.write().encrypted_data_key = encrypted_data_key;
    }

    pub fn config_type(&self) -> Option<String> {
        self.content.read().config_type.clone()
    }

    pub fn set_config_type(&self, config_type: Option<String>) {
        self.content.write().config_type = config_type;
    }

    pub fn is_use_local_config(&self) -> bool {
        self.use_local_config.load(Ordering::Acquire)
    }

    pub fn set_use_local_config(&self, use_local_config: bool) {
        self.use_local_config
            .store(use_local_config, Ordering::Release);
        if !use_local_config {
            self.local_config_version.store(0, Ordering::Release);
        }
    }

    pub fn local_config_version(&self) -> u64 {
        self.local_config_version.load(Ordering::Acquire)
    }

    pub fn set_local_config_version(&self, version: u64) {
        self.local_config_version.store(version, Ordering::Release);
    }

    pub fn is_initializing(&self) -> bool {
        self.initializing.load(Ordering::Acquire)
    }

    pub fn set_initializing(&self, initializing: bool) {
        self.initializing.store(initializing, Ordering::Release);
    }

    /// Add a listener to this cache entry. Returns `false` if it was already registered.
    pub fn add_listener(&self, listener: Arc<dyn ConfigChangeListener>) -> bool {
        self.add_listener_with_md5(listener, ABSENT_MD5)
    }

    /// Add a listener that is considered to have already received `md5`.
    pub fn add_listener_with_md5(&self, listener: Arc<dyn ConfigChangeListener>, md5: &str) -> bool {
        let mut listeners = self.listeners.write();
        if listeners.iter().any(|l| l.wraps(&listener)) {
            return false;
        }
        listeners.push(Arc::new(ManagedListener::new(listener, md5)));
        info!(key = %self.key, count = listeners.len(), "Added listener");
        true
    }

    /// Remove a listener. Returns `true` if it was registered.
    pub fn remove_listener(&self, listener: &Arc<dyn ConfigChangeListener>) -> bool {
        let mut listeners = self.listeners.write();
        let before = listeners.len();
        listeners.retain(|l| !l.wraps(listener));
        let removed = listeners.len() != before;
        if removed {
            info!(key = %self.key, count = listeners.len(), "Removed listener");
        }
        removed
    }

    /// Check if there are any registered listeners.
    pub fn has_listeners(&self) -> bool {
        !self.listeners.read().is_empty()
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.read().len()
    }

    /// Digest last delivered to `listener`, if it is registered here
    pub fn listener_last_md5(&self, listener: &Arc<dyn ConfigChangeListener>) -> Option<String> {
        self.listeners
            .read()
            .iter()
            .find(|l| l.wraps(listener))
            .map(|l| l.last_call_md5())
    }

    /// Current value as delivered to listeners
    pub fn to_response(&self) -> ConfigResponse {
        self.snapshot().1
    }

    /// Digest and value read under one lock
    fn snapshot(&self) -> (String, ConfigResponse) {
        let state = self.content.read();
        let response = ConfigResponse {
            data_id: self.key.data_id.clone(),
            group: self.key.group.clone(),
            tenant: self.key.tenant.clone(),
            content: state.content.clone(),
            encrypted_data_key: state.encrypted_data_key.clone(),
            config_type: state.config_type.clone(),
        };
        (state.md5.clone(), response)
    }

    /// Notify every listener whose last delivered digest differs from the current one.
    pub async fn check_listener_md5(&self) {
        let (md5, response) = self.snapshot();
        let listeners = self.listeners.read().clone();

        for wrap in listeners {
            if wrap.last_call_md5() != md5 {
                self.safe_notify_listener(&wrap, response.clone(), &md5)
                    .await;
            }
        }
    }

    async fn safe_notify_listener(&self, wrap: &Arc<ManagedListener>, mut response: ConfigResponse, md5: &str) {
        if let Err(e) = self.filter_chain.do_filter_query(&mut response).await {
            error!(key = %self.key, md5, error = %e, "Filter chain rejected config, listener not notified");
            return;
        }

        match wrap.listener().executor() {
            Some(handle) => {
                if !wrap.begin_notify() {
                    warn!(key = %self.key, md5, "Previous notification still running, retrying later");
                    return;
                }
                let wrap = wrap.clone();
                let md5 = md5.to_string();
                let key = self.key.clone();
                handle.spawn_blocking(move || {
                    deliver(&wrap, response, &md5, &key);
                    wrap.end_notify();
                });
            }
            None => {
                deliver(wrap, response, md5, &self.key);
            }
        }
    }
}

/// Invoke the callback; the digest is recorded only when it succeeds.
fn deliver(wrap: &ManagedListener, response: ConfigResponse, md5: &str, key: &ConfigKey) -> bool {
    let listener = wrap.listener().clone();
    match catch_unwind(AssertUnwindSafe(|| listener.receive_config_info(response))) {
        Ok(Ok(())) => {
            wrap.set_last_call_md5(md5);
            info!(key = %key, md5, "Notified listener");
            true
        }
        Ok(Err(e)) => {
            error!(key = %key, md5, error = %e, "Listener failed to receive config");
            false
        }
        Err(_) => {
            error!(key = %key, md5, "Listener panicked while receiving config");
            false
        }
    }
}

/// Build a cache key from config identifiers.
pub fn build_cache_key(data_id: &str, group: &str, tenant: &str) -> String {
    if tenant.is_empty() {
        format!("{}+{}", data_id, group)
    } else {
        format!("{}+{}+{}", data_id, group, tenant)
    }
}

/// Compute MD5 hash of a string, returning the hex digest.
pub fn compute_md5(content: &str) -> String {
    let mut hasher = Md5::new();
    hasher.update(content.as_bytes());
    let result = hasher.finalize();
    const_hex::encode(result)
}

/// Digest of possibly-absent content
pub fn content_md5(content: Option<&str>) -> String {
    match content {
        Some(content) => compute_md5(content),
        None => ABSENT_MD5.to_string(),
    }
}
