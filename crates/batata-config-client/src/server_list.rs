//! Server address management
//!
//! Holds the list of config servers and the sticky "current" server used by
//! [`ServerHttpAgent`](crate::http::ServerHttpAgent). The list is either fixed
//! by configuration or discovered from an address server and refreshed
//! periodically.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use arc_swap::{ArcSwap, ArcSwapOption};
use parking_lot::Mutex;
use rand::seq::SliceRandom;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::error::{ClientError, Result};
use crate::http::{HttpRequest, HttpTransport};
use crate::notify::{NotifyCenter, ServerListChangedEvent};
use crate::properties::{ClientProperties, DEFAULT_SERVER_PORT};

const ADDRESS_SERVER_TIMEOUT: Duration = Duration::from_secs(3);

/// Manages the config server list and the sticky current server
pub struct ServerListManager {
    name: String,
    fixed: bool,
    address_server_url: Option<String>,
    servers: ArcSwap<Vec<String>>,
    current: ArcSwapOption<String>,
    started: AtomicBool,
    refresh_interval: Duration,
    init_retry_times: usize,
    transport: Arc<dyn HttpTransport>,
    notify_center: Arc<NotifyCenter>,
    refresh_task: Mutex<Option<JoinHandle<()>>>,
}

impl ServerListManager {
    pub fn new(
        properties: &ClientProperties,
        transport: Arc<dyn HttpTransport>,
        notify_center: Arc<NotifyCenter>,
    ) -> Result<Self> {
        let fixed = properties.is_fixed();
        let address_server_url = properties.address_server_url();

        if !fixed && address_server_url.is_none() {
            return Err(ClientError::EmptyServerList(
                "neither server_addr nor endpoint is configured".to_string(),
            ));
        }

        let servers = if fixed {
            let mut servers: Vec<String> = properties
                .server_addr
                .iter()
                .filter_map(|addr| normalize_server_addr(addr))
                .collect();
            servers.dedup();
            servers
        } else {
            Vec::new()
        };

        let name = match &address_server_url {
            Some(url) if !fixed => url.clone(),
            _ => properties.resolved_env_name(),
        };

        Ok(Self {
            name,
            fixed,
            address_server_url,
            servers: ArcSwap::from_pointee(servers),
            current: ArcSwapOption::empty(),
            started: AtomicBool::new(false),
            refresh_interval: properties.refresh_interval(),
            init_retry_times: properties.init_server_list_retry_times.max(1),
            transport,
            notify_center,
            refresh_task: Mutex::new(None),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_fixed(&self) -> bool {
        self.fixed
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }

    /// Start the manager.
    ///
    /// A fixed list starts immediately. A discovered list is fetched with
    /// bounded retries; failing to obtain any server is fatal.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        if self.is_started() {
            return Ok(());
        }

        if self.fixed {
            if self.servers.load().is_empty() {
                return Err(ClientError::EmptyServerList(self.name.clone()));
            }
            self.started.store(true, Ordering::Release);
            info!(name = %self.name, servers = ?self.servers.load_full(), "Server list manager started with fixed list");
            return Ok(());
        }

        for attempt in 0..self.init_retry_times {
            match self.refresh().await {
                Ok(_) if !self.servers.load().is_empty() => break,
                Ok(_) => warn!(name = %self.name, attempt, "Address server returned no servers"),
                Err(e) => warn!(name = %self.name, attempt, error = %e, "Failed to fetch server list"),
            }
            if attempt + 1 < self.init_retry_times {
                tokio::time::sleep(Duration::from_millis((attempt as u64 + 1) * 100)).await;
            }
        }

        if self.servers.load().is_empty() {
            error!(name = %self.name, "Failed to obtain server list, giving up");
            return Err(ClientError::EmptyServerList(self.name.clone()));
        }

        self.started.store(true, Ordering::Release);
        self.spawn_refresh_task();
        info!(name = %self.name, servers = ?self.servers.load_full(), "Server list manager started");
        Ok(())
    }

    /// Stop the periodic refresh.
    pub fn shutdown(&self) {
        if let Some(handle) = self.refresh_task.lock().take() {
            handle.abort();
        }
    }

    fn spawn_refresh_task(self: &Arc<Self>) {
        let manager: Weak<Self> = Arc::downgrade(self);
        let interval = self.refresh_interval;

        let handle = tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                let Some(manager) = manager.upgrade() else {
                    break;
                };
                if let Err(e) = manager.refresh().await {
                    warn!(name = %manager.name, error = %e, "Failed to refresh server list");
                }
            }
        });

        *self.refresh_task.lock() = Some(handle);
    }

    /// Fetch the list from the address server and apply it.
    ///
    /// Returns whether the list changed.
    pub async fn refresh(&self) -> Result<bool> {
        let Some(url) = &self.address_server_url else {
            return Ok(false);
        };
        if self.fixed {
            return Ok(false);
        }

        let result = self
            .transport
            .execute(HttpRequest::get(url.clone(), ADDRESS_SERVER_TIMEOUT))
            .await?;

        if !result.is_ok() {
            return Err(ClientError::ServerError {
                code: result.code,
                message: format!("address server {} returned {}", url, result.code),
            });
        }

        let servers = parse_server_list(&result.body);
        Ok(self.update_servers(servers))
    }

    /// Replace the list if it differs, clearing the sticky server and
    /// publishing a [`ServerListChangedEvent`]. An empty list is ignored.
    pub fn update_servers(&self, mut servers: Vec<String>) -> bool {
        if servers.is_empty() {
            warn!(name = %self.name, "Ignoring empty server list");
            return false;
        }
        servers.sort();
        servers.dedup();

        let current = self.servers.load_full();
        let mut sorted_current = current.as_ref().clone();
        sorted_current.sort();
        if sorted_current == servers {
            debug!(name = %self.name, "Server list unchanged");
            return false;
        }

        info!(name = %self.name, old = ?current, new = ?servers, "Server list changed");
        self.servers.store(Arc::new(servers.clone()));
        self.current.store(None);

        self.notify_center.publish(Arc::new(ServerListChangedEvent {
            name: self.name.clone(),
            servers,
        }));
        true
    }

    pub fn server_urls(&self) -> Arc<Vec<String>> {
        self.servers.load_full()
    }

    /// The sticky server, if one has been chosen
    pub fn current_server(&self) -> Option<String> {
        self.current.load_full().map(|s| s.as_ref().clone())
    }

    pub fn set_current_server(&self, server: &str) {
        let unchanged = self
            .current
            .load()
            .as_deref()
            .is_some_and(|current| current == server);
        if !unchanged {
            debug!(name = %self.name, server, "Switching current server");
            self.current.store(Some(Arc::new(server.to_string())));
        }
    }

    /// All servers in a fresh random order
    pub fn failover_order(&self) -> Vec<String> {
        let mut servers = self.servers.load().as_ref().clone();
        servers.shuffle(&mut rand::rng());
        servers
    }
}

impl Drop for ServerListManager {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Parse an address server response: one `host[:port]` per line.
pub fn parse_server_list(body: &str) -> Vec<String> {
    body.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .filter_map(normalize_server_addr)
        .collect()
}

/// Normalize `host`, `host:port` or a full URL into a base URL.
pub fn normalize_server_addr(addr: &str) -> Option<String> {
    let addr = addr.trim().trim_end_matches('/');
    if addr.is_empty() {
        return None;
    }
    if addr.starts_with("http://") || addr.starts_with("https://") {
        return Some(addr.to_string());
    }
    if addr.contains(':') {
        Some(format!("http://{}", addr))
    } else {
        Some(format!("http://{}:{}", addr, DEFAULT_SERVER_PORT))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::HttpResult;
    use crate::notify::{Event, EventListener};
    use async_trait::async_trait;
    use std::any::TypeId;
    use std::sync::atomic::AtomicUsize;

    struct StaticBody(&'static str);

    #[async_trait]
    impl HttpTransport for StaticBody {
        async fn execute(&self, _request: HttpRequest) -> Result<HttpResult> {
            Ok(HttpResult::new(200, self.0))
        }
    }

    struct ChangeCounter(AtomicUsize);

    impl EventListener for ChangeCounter {
        fn interests(&self) -> Vec<TypeId> {
            vec![TypeId::of::<ServerListChangedEvent>()]
        }

        fn on_event(&self, event: &dyn Event) -> anyhow::Result<()> {
            assert!(event.as_any().is::<ServerListChangedEvent>());
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn fixed_manager(servers: &[&str]) -> ServerListManager {
        let props =
            ClientProperties::with_servers(servers.iter().map(|s| s.to_string()).collect());
        ServerListManager::new(&props, Arc::new(StaticBody("")), Arc::new(NotifyCenter::new()))
            .unwrap()
    }

    #[test]
    fn test_normalize_server_addr() {
        assert_eq!(
            normalize_server_addr("127.0.0.1").as_deref(),
            Some("http://127.0.0.1:8848")
        );
        assert_eq!(
            normalize_server_addr("127.0.0.1:9848").as_deref(),
            Some("http://127.0.0.1:9848")
        );
        assert_eq!(
            normalize_server_addr("https://config.example.com/").as_deref(),
            Some("https://config.example.com")
        );
        assert_eq!(normalize_server_addr("  "), None);
    }

    #[test]
    fn test_parse_server_list() {
        let servers = parse_server_list("10.0.0.1:8848\n\n# comment\n 10.0.0.2 \n");
        assert_eq!(
            servers,
            vec!["http://10.0.0.1:8848", "http://10.0.0.2:8848"]
        );
    }

    #[test]
    fn test_requires_server_source() {
        let props = ClientProperties::default();
        let result =
            ServerListManager::new(&props, Arc::new(StaticBody("")), Arc::new(NotifyCenter::new()));
        assert!(matches!(result, Err(ClientError::EmptyServerList(_))));
    }

    #[test]
    fn test_sticky_server() {
        let manager = fixed_manager(&["10.0.0.1:8848", "10.0.0.2:8848"]);
        assert!(manager.current_server().is_none());

        manager.set_current_server("http://10.0.0.2:8848");
        assert_eq!(
            manager.current_server().as_deref(),
            Some("http://10.0.0.2:8848")
        );
    }

    #[test]
    fn test_failover_order_is_permutation() {
        let manager = fixed_manager(&["10.0.0.1", "10.0.0.2", "10.0.0.3"]);
        let mut order = manager.failover_order();
        order.sort();
        assert_eq!(order, manager.server_urls().as_ref().clone());
    }

    #[test]
    fn test_update_servers_publishes_and_clears_sticky() {
        let notify = Arc::new(NotifyCenter::new());
        let counter = Arc::new(ChangeCounter(AtomicUsize::new(0)));
        notify.register_listener(counter.clone());

        let props = ClientProperties::with_servers(vec!["10.0.0.1".to_string()]);
        let manager = ServerListManager::new(&props, Arc::new(StaticBody("")), notify).unwrap();
        manager.set_current_server("http://10.0.0.1:8848");

        assert!(manager.update_servers(vec![
            "http://10.0.0.2:8848".to_string(),
            "http://10.0.0.3:8848".to_string(),
        ]));
        assert!(manager.current_server().is_none());
        assert_eq!(counter.0.load(Ordering::SeqCst), 1);

        // same list in a different order is not a change
        assert!(!manager.update_servers(vec![
            "http://10.0.0.3:8848".to_string(),
            "http://10.0.0.2:8848".to_string(),
        ]));
        // empty lists are ignored
        assert!(!manager.update_servers(Vec::new()));
        assert_eq!(manager.server_urls().len(), 2);
        assert_eq!(counter.0.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_start_with_address_server() {
        let props = ClientProperties::with_endpoint("address.example.com").with_refresh_interval(60_000);
        let manager = Arc::new(
            ServerListManager::new(
                &props,
                Arc::new(StaticBody("10.0.0.1:8848\n10.0.0.2:8848\n")),
                Arc::new(NotifyCenter::new()),
            )
            .unwrap(),
        );

        manager.start().await.unwrap();
        assert!(manager.is_started());
        assert!(!manager.is_fixed());
        assert_eq!(manager.server_urls().len(), 2);
        manager.shutdown();
    }

    #[tokio::test]
    async fn test_start_fails_without_servers() {
        let mut props = ClientProperties::with_endpoint("address.example.com");
        props.init_server_list_retry_times = 2;
        let manager = Arc::new(
            ServerListManager::new(&props, Arc::new(StaticBody("\n")), Arc::new(NotifyCenter::new()))
                .unwrap(),
        );

        let started_at = std::time::Instant::now();
        let result = manager.start().await;
        assert!(matches!(result, Err(ClientError::EmptyServerList(_))));
        assert!(!manager.is_started());

        // one backoff between the two attempts, none after the last
        let elapsed = started_at.elapsed();
        assert!(elapsed >= Duration::from_millis(100), "{elapsed:?}");
        assert!(elapsed < Duration::from_millis(250), "{elapsed:?}");
    }
}
