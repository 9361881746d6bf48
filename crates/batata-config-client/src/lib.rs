//! Batata Config Client - Nacos-compatible configuration watch client
//!
//! This crate provides:
//! - Long-polling config watch with sharded background workers
//! - Listener notification with per-listener delivery tracking
//! - Local failover files and last-known-good snapshots
//! - Server list discovery with sticky failover
//! - In-process event bus and Prometheus metrics

pub mod config;
pub mod error;
pub mod http;
pub mod local_config;
pub mod metrics;
pub mod notify;
pub mod properties;
pub mod server_list;

pub use config::BatataConfigService;
pub use config::cache::{CacheData, ConfigKey};
pub use config::filter::{ConfigFilter, ConfigFilterChainManager};
pub use config::listener::{ConfigChangeListener, ConfigResponse, FnConfigChangeListener};
pub use config::worker::ClientWorker;
pub use error::ClientError;
pub use http::{HttpTransport, ReqwestTransport, ServerHttpAgent};
pub use local_config::{LocalConfigInfoProcessor, LocalConfigStore, SnapshotSwitch};
pub use metrics::MetricsMonitor;
pub use notify::{Event, EventListener, NotifyCenter, ServerListChangedEvent};
pub use properties::ClientProperties;
pub use server_list::ServerListManager;
