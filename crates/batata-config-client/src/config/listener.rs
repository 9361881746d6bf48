//! Config change listener trait and notification types

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;

/// Information about a config change delivered to listeners.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ConfigResponse {
    pub data_id: String,
    pub group: String,
    pub tenant: String,
    /// `None` when the config does not exist
    pub content: Option<String>,
    pub encrypted_data_key: Option<String>,
    pub config_type: Option<String>,
}

/// Trait for receiving config change notifications.
///
/// Implement this trait to be notified when a config value changes. Returning
/// an error (or panicking) leaves the change undelivered, so the same value is
/// offered again on the next reconciliation.
pub trait ConfigChangeListener: Send + Sync + 'static {
    /// Called when the config content has changed.
    fn receive_config_info(&self, config_info: ConfigResponse) -> anyhow::Result<()>;

    /// Runtime to run the callback on. `None` runs it inline on the polling task.
    fn executor(&self) -> Option<tokio::runtime::Handle> {
        None
    }
}

/// A simple listener that invokes a closure.
pub struct FnConfigChangeListener<F>
where
    F: Fn(ConfigResponse) -> anyhow::Result<()> + Send + Sync + 'static,
{
    f: F,
}

impl<F> FnConfigChangeListener<F>
where
    F: Fn(ConfigResponse) -> anyhow::Result<()> + Send + Sync + 'static,
{
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

impl<F> ConfigChangeListener for FnConfigChangeListener<F>
where
    F: Fn(ConfigResponse) -> anyhow::Result<()> + Send + Sync + 'static,
{
    fn receive_config_info(&self, config_info: ConfigResponse) -> anyhow::Result<()> {
        (self.f)(config_info)
    }
}

/// A listener registered on one cache entry, with the digest it last received.
pub struct ManagedListener {
    listener: Arc<dyn ConfigChangeListener>,
    last_call_md5: Mutex<String>,
    in_notifying: AtomicBool,
}

impl ManagedListener {
    pub fn new(listener: Arc<dyn ConfigChangeListener>, last_call_md5: &str) -> Self {
        Self {
            listener,
            last_call_md5: Mutex::new(last_call_md5.to_string()),
            in_notifying: AtomicBool::new(false),
        }
    }

    pub fn listener(&self) -> &Arc<dyn ConfigChangeListener> {
        &self.listener
    }

    pub fn last_call_md5(&self) -> String {
        self.last_call_md5.lock().clone()
    }

    pub(crate) fn set_last_call_md5(&self, md5: &str) {
        *self.last_call_md5.lock() = md5.to_string();
    }

    /// Whether this registration wraps `listener`
    pub fn wraps(&self, listener: &Arc<dyn ConfigChangeListener>) -> bool {
        same_listener(&self.listener, listener)
    }

    /// Mark a delegated delivery as in flight; false if one already is.
    pub(crate) fn begin_notify(&self) -> bool {
        !self.in_notifying.swap(true, Ordering::AcqRel)
    }

    pub(crate) fn end_notify(&self) {
        self.in_notifying.store(false, Ordering::Release);
    }
}

/// Listener identity is the identity of the callback object.
pub fn same_listener(a: &Arc<dyn ConfigChangeListener>, b: &Arc<dyn ConfigChangeListener>) -> bool {
    std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b))
}
