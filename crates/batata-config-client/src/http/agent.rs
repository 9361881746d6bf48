//! Failover HTTP agent
//!
//! Requests go to the sticky current server first. When it fails (transport
//! error or a 5xx status) the remaining servers are tried in a random order
//! within the caller's time budget, and the first one that answers becomes
//! the new sticky server.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{error, warn};

use crate::error::{ClientError, Result};
use crate::server_list::ServerListManager;

use super::{HttpMethod, HttpRequest, HttpResult, HttpTransport};

/// HTTP agent that fails over across the servers of a [`ServerListManager`]
pub struct ServerHttpAgent {
    transport: Arc<dyn HttpTransport>,
    server_list: Arc<ServerListManager>,
    context_path: String,
}

impl ServerHttpAgent {
    pub fn new(
        transport: Arc<dyn HttpTransport>,
        server_list: Arc<ServerListManager>,
        context_path: &str,
    ) -> Self {
        Self {
            transport,
            server_list,
            context_path: context_path.trim_matches('/').to_string(),
        }
    }

    pub fn server_list(&self) -> &Arc<ServerListManager> {
        &self.server_list
    }

    pub async fn http_get(
        &self,
        path: &str,
        headers: &[(String, String)],
        params: &[(String, String)],
        timeout: Duration,
    ) -> Result<HttpResult> {
        self.request(HttpMethod::Get, path, headers, params, timeout)
            .await
    }

    pub async fn http_post(
        &self,
        path: &str,
        headers: &[(String, String)],
        params: &[(String, String)],
        timeout: Duration,
    ) -> Result<HttpResult> {
        self.request(HttpMethod::Post, path, headers, params, timeout)
            .await
    }

    async fn request(
        &self,
        method: HttpMethod,
        path: &str,
        headers: &[(String, String)],
        params: &[(String, String)],
        timeout: Duration,
    ) -> Result<HttpResult> {
        let deadline = Instant::now() + timeout;

        let sticky = self.server_list.current_server();
        if let Some(server) = &sticky {
            match self
                .call(method, server, path, headers, params, timeout)
                .await
            {
                Ok(result) if !is_server_unavailable(result.code) => return Ok(result),
                Ok(result) => {
                    warn!(server = %server, path, code = result.code, "Current server unavailable, failing over")
                }
                Err(e) => warn!(server = %server, path, error = %e, "Request to current server failed, failing over"),
            }
        }

        for server in self.server_list.failover_order() {
            if sticky.as_deref() == Some(server.as_str()) {
                continue;
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }

            match self
                .call(method, &server, path, headers, params, remaining)
                .await
            {
                Ok(result) if !is_server_unavailable(result.code) => {
                    self.server_list.set_current_server(&server);
                    return Ok(result);
                }
                Ok(result) => warn!(server = %server, path, code = result.code, "Server unavailable"),
                Err(e) => warn!(server = %server, path, error = %e, "Request failed"),
            }
        }

        error!(path, "No available server");
        Err(ClientError::NoAvailableServer {
            path: path.to_string(),
        })
    }

    async fn call(
        &self,
        method: HttpMethod,
        server: &str,
        path: &str,
        headers: &[(String, String)],
        params: &[(String, String)],
        timeout: Duration,
    ) -> Result<HttpResult> {
        let request = HttpRequest {
            method,
            url: self.build_url(server, path),
            headers: headers.to_vec(),
            params: params.to_vec(),
            timeout,
        };
        self.transport.execute(request).await
    }

    /// Build full URL with context path
    fn build_url(&self, server: &str, path: &str) -> String {
        if self.context_path.is_empty() {
            format!("{}{}", server, path)
        } else {
            format!("{}/{}{}", server, self.context_path, path)
        }
    }
}

/// Statuses that mean "try another server"
pub fn is_server_unavailable(code: u16) -> bool {
    code >= 500
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notify::NotifyCenter;
    use crate::properties::ClientProperties;
    use async_trait::async_trait;
    use parking_lot::Mutex;

    /// Answers per server host with a fixed status; records the hosts called.
    struct PerServer {
        statuses: Vec<(&'static str, u16)>,
        calls: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl HttpTransport for PerServer {
        async fn execute(&self, request: HttpRequest) -> Result<HttpResult> {
            self.calls.lock().push(request.url.clone());
            for (host, status) in &self.statuses {
                if request.url.contains(host) {
                    return Ok(HttpResult::new(*status, "ok"));
                }
            }
            Err(ClientError::Timeout)
        }
    }

    fn agent(statuses: Vec<(&'static str, u16)>, servers: &[&str]) -> (ServerHttpAgent, Arc<PerServer>) {
        let transport = Arc::new(PerServer {
            statuses,
            calls: Mutex::new(Vec::new()),
        });
        let props =
            ClientProperties::with_servers(servers.iter().map(|s| s.to_string()).collect());
        let server_list = Arc::new(
            ServerListManager::new(&props, transport.clone(), Arc::new(NotifyCenter::new()))
                .unwrap(),
        );
        (
            ServerHttpAgent::new(transport.clone(), server_list, "nacos"),
            transport,
        )
    }

    #[test]
    fn test_is_server_unavailable() {
        assert!(is_server_unavailable(500));
        assert!(is_server_unavailable(502));
        assert!(is_server_unavailable(503));
        assert!(!is_server_unavailable(200));
        assert!(!is_server_unavailable(404));
        assert!(!is_server_unavailable(403));
    }

    #[test]
    fn test_build_url() {
        let (agent, _) = agent(vec![], &["10.0.0.1:8848"]);
        assert_eq!(
            agent.build_url("http://10.0.0.1:8848", "/v1/cs/configs"),
            "http://10.0.0.1:8848/nacos/v1/cs/configs"
        );
    }

    #[tokio::test]
    async fn test_first_success_becomes_sticky() {
        let (agent, transport) = agent(
            vec![("10.0.0.1", 200), ("10.0.0.2", 200)],
            &["10.0.0.1:8848", "10.0.0.2:8848"],
        );

        let result = agent
            .http_get("/v1/cs/configs", &[], &[], Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(result.code, 200);

        let sticky = agent.server_list().current_server().unwrap();
        let first_call = transport.calls.lock()[0].clone();
        assert!(first_call.starts_with(&sticky));

        // subsequent calls go straight to the sticky server
        for _ in 0..5 {
            agent
                .http_get("/v1/cs/configs", &[], &[], Duration::from_secs(1))
                .await
                .unwrap();
        }
        assert!(
            transport
                .calls
                .lock()
                .iter()
                .all(|url| url.starts_with(&sticky))
        );
    }

    #[tokio::test]
    async fn test_fails_over_from_unavailable_sticky() {
        let (agent, _) = agent(
            vec![("10.0.0.1", 503), ("10.0.0.2", 200)],
            &["10.0.0.1:8848", "10.0.0.2:8848"],
        );
        agent
            .server_list()
            .set_current_server("http://10.0.0.1:8848");

        let result = agent
            .http_post("/v1/cs/configs/listener", &[], &[], Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(result.code, 200);
        assert_eq!(
            agent.server_list().current_server().as_deref(),
            Some("http://10.0.0.2:8848")
        );
    }

    #[tokio::test]
    async fn test_client_errors_do_not_fail_over() {
        let (agent, transport) = agent(
            vec![("10.0.0.1", 404), ("10.0.0.2", 200)],
            &["10.0.0.1:8848", "10.0.0.2:8848"],
        );
        agent
            .server_list()
            .set_current_server("http://10.0.0.1:8848");

        let result = agent
            .http_get("/v1/cs/configs", &[], &[], Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(result.code, 404);
        assert_eq!(transport.calls.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_no_available_server() {
        let (agent, _) = agent(
            vec![("10.0.0.1", 500)],
            &["10.0.0.1:8848", "10.0.0.2:8848"],
        );

        let result = agent
            .http_get("/v1/cs/configs", &[], &[], Duration::from_secs(1))
            .await;
        assert!(matches!(result, Err(ClientError::NoAvailableServer { .. })));
        assert!(agent.server_list().current_server().is_none());
    }
}
