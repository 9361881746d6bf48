//! Shared fixtures for the config client integration tests
//!
//! `ScriptedServer` is an in-memory `HttpTransport` that plays the part of a
//! config server: long-poll answers and per-dataId fetch answers are queued up
//! front and every request is recorded.

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use batata_config_client::config::worker::{CONFIG_LISTENER_PATH, CONFIG_PATH};
use batata_config_client::error::Result;
use batata_config_client::http::{HttpMethod, HttpRequest, HttpResult, HttpTransport};
use batata_config_client::{
    BatataConfigService, ClientProperties, ConfigChangeListener, ConfigResponse,
};
use parking_lot::Mutex;
use tempfile::TempDir;

pub const DATA_ID: &str = "app.cfg";
pub const GROUP: &str = "DEFAULT";

#[derive(Default)]
pub struct ScriptedServer {
    long_poll: Mutex<VecDeque<HttpResult>>,
    configs: Mutex<HashMap<String, VecDeque<HttpResult>>>,
    requests: Mutex<Vec<HttpRequest>>,
    /// How long an empty long poll is held
    pub hold: Duration,
}

impl ScriptedServer {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn holding(hold: Duration) -> Arc<Self> {
        Arc::new(Self {
            hold,
            ..Default::default()
        })
    }

    /// Queue a long-poll answer naming `keys` as changed.
    pub fn push_changed(&self, keys: &[(&str, &str)]) {
        let body: String = keys
            .iter()
            .map(|(data_id, group)| format!("{}%02{}%01", data_id, group))
            .collect();
        self.long_poll.lock().push_back(HttpResult::new(200, body));
    }

    pub fn push_long_poll(&self, result: HttpResult) {
        self.long_poll.lock().push_back(result);
    }

    /// Queue the content returned by the next fetch of `data_id`.
    pub fn push_config(&self, data_id: &str, content: &str) {
        self.push_config_result(data_id, HttpResult::new(200, content));
    }

    pub fn push_config_result(&self, data_id: &str, result: HttpResult) {
        self.configs
            .lock()
            .entry(data_id.to_string())
            .or_default()
            .push_back(result);
    }

    pub fn requests(&self) -> Vec<HttpRequest> {
        self.requests.lock().clone()
    }

    pub fn fetch_count(&self) -> usize {
        self.requests
            .lock()
            .iter()
            .filter(|r| r.method == HttpMethod::Get && r.url.ends_with(CONFIG_PATH))
            .count()
    }

    pub fn long_poll_count(&self) -> usize {
        self.requests
            .lock()
            .iter()
            .filter(|r| r.url.ends_with(CONFIG_LISTENER_PATH))
            .count()
    }
}

#[async_trait]
impl HttpTransport for ScriptedServer {
    async fn execute(&self, request: HttpRequest) -> Result<HttpResult> {
        self.requests.lock().push(request.clone());

        if request.url.ends_with(CONFIG_LISTENER_PATH) {
            let next = self.long_poll.lock().pop_front();
            return match next {
                Some(result) => Ok(result),
                None => {
                    tokio::time::sleep(self.hold).await;
                    Ok(HttpResult::new(200, ""))
                }
            };
        }

        if request.url.ends_with(CONFIG_PATH) {
            let data_id = request.param("dataId").unwrap_or_default().to_string();
            let next = self
                .configs
                .lock()
                .get_mut(&data_id)
                .and_then(|queue| queue.pop_front());
            return Ok(next.unwrap_or_else(|| HttpResult::new(404, "")));
        }

        Ok(HttpResult::new(404, ""))
    }
}

/// Records the content of every delivery. Fails the first `failures` deliveries.
pub struct RecordingListener {
    received: Mutex<Vec<Option<String>>>,
    failures: Mutex<usize>,
}

impl RecordingListener {
    pub fn new() -> Arc<Self> {
        Self::failing(0)
    }

    pub fn failing(failures: usize) -> Arc<Self> {
        Arc::new(Self {
            received: Mutex::new(Vec::new()),
            failures: Mutex::new(failures),
        })
    }

    pub fn received(&self) -> Vec<Option<String>> {
        self.received.lock().clone()
    }

    pub fn contents(&self) -> Vec<String> {
        self.received().into_iter().flatten().collect()
    }
}

impl ConfigChangeListener for RecordingListener {
    fn receive_config_info(&self, config_info: ConfigResponse) -> anyhow::Result<()> {
        let mut failures = self.failures.lock();
        if *failures > 0 {
            *failures -= 1;
            anyhow::bail!("listener not ready");
        }
        self.received.lock().push(config_info.content);
        Ok(())
    }
}

pub fn properties(dir: &TempDir) -> ClientProperties {
    ClientProperties::new("127.0.0.1:8848")
        .with_local_store_path(dir.path())
        .with_timeouts(30_000, 1_000)
}

pub fn service(dir: &TempDir, server: Arc<ScriptedServer>) -> BatataConfigService {
    service_with(properties(dir), server)
}

pub fn service_with(properties: ClientProperties, server: Arc<ScriptedServer>) -> BatataConfigService {
    BatataConfigService::with_transport(properties, server).expect("service")
}

/// Poll `condition` until it holds or `timeout` expires.
pub async fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}
