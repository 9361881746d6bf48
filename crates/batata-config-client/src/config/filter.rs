//! Configuration filter chain
//!
//! Every value handed to a listener or returned from `get_config` passes
//! through the chain first. Filters run in ascending `order()`.

use std::sync::Arc;

use parking_lot::RwLock;

use super::listener::ConfigResponse;

/// Config filter applied to values after they are read
#[async_trait::async_trait]
pub trait ConfigFilter: Send + Sync {
    /// Get filter order (lower value = higher priority)
    fn order(&self) -> i32;

    /// Get filter name
    fn name(&self) -> &str;

    /// Filter config after querying
    async fn filter_query(&self, response: &mut ConfigResponse) -> anyhow::Result<()>;
}

/// Config filter chain manager
#[derive(Default)]
pub struct ConfigFilterChainManager {
    filters: RwLock<Vec<Arc<dyn ConfigFilter>>>,
}

impl ConfigFilterChainManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a filter to the chain, replacing any filter with the same name
    pub fn add_filter(&self, filter: Arc<dyn ConfigFilter>) {
        let mut filters = self.filters.write();
        filters.retain(|f| f.name() != filter.name());
        filters.push(filter);
        filters.sort_by_key(|f| f.order());
    }

    /// Remove a filter by name
    pub fn remove_filter(&self, name: &str) {
        self.filters.write().retain(|f| f.name() != name);
    }

    /// Names of the filters in execution order
    pub fn filter_names(&self) -> Vec<String> {
        self.filters
            .read()
            .iter()
            .map(|f| f.name().to_string())
            .collect()
    }

    /// Run every filter on a queried value
    pub async fn do_filter_query(&self, response: &mut ConfigResponse) -> anyhow::Result<()> {
        let filters = self.filters.read().clone();
        for filter in filters {
            filter.filter_query(response).await?;
        }
        Ok(())
    }
}

/// Config filter for logging
pub struct LoggingConfigFilter {
    order: i32,
}

impl LoggingConfigFilter {
    pub fn new(order: i32) -> Self {
        Self { order }
    }
}

#[async_trait::async_trait]
impl ConfigFilter for LoggingConfigFilter {
    fn order(&self) -> i32 {
        self.order
    }

    fn name(&self) -> &str {
        "logging"
    }

    async fn filter_query(&self, response: &mut ConfigResponse) -> anyhow::Result<()> {
        tracing::debug!(
            data_id = %response.data_id,
            group = %response.group,
            tenant = %response.tenant,
            content_len = response.content.as_ref().map(String::len).unwrap_or(0),
            "Filtering query"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Test filter that transforms content to uppercase
    struct UppercaseFilter;

    #[async_trait::async_trait]
    impl ConfigFilter for UppercaseFilter {
        fn order(&self) -> i32 {
            10
        }

        fn name(&self) -> &str {
            "uppercase"
        }

        async fn filter_query(&self, response: &mut ConfigResponse) -> anyhow::Result<()> {
            response.content = response.content.as_ref().map(|c| c.to_uppercase());
            Ok(())
        }
    }

    /// Test filter that adds prefix
    struct PrefixFilter {
        prefix: String,
    }

    #[async_trait::async_trait]
    impl ConfigFilter for PrefixFilter {
        fn order(&self) -> i32 {
            20
        }

        fn name(&self) -> &str {
            "prefix"
        }

        async fn filter_query(&self, response: &mut ConfigResponse) -> anyhow::Result<()> {
            response.content = response
                .content
                .as_ref()
                .map(|c| format!("{}{}", self.prefix, c));
            Ok(())
        }
    }

    struct RejectFilter;

    #[async_trait::async_trait]
    impl ConfigFilter for RejectFilter {
        fn order(&self) -> i32 {
            0
        }

        fn name(&self) -> &str {
            "reject"
        }

        async fn filter_query(&self, _response: &mut ConfigResponse) -> anyhow::Result<()> {
            anyhow::bail!("decryption failed")
        }
    }

    #[tokio::test]
    async fn test_filter_chain_query() {
        let manager = ConfigFilterChainManager::new();
        manager.add_filter(Arc::new(PrefixFilter {
            prefix: "pref:".to_string(),
        }));
        manager.add_filter(Arc::new(UppercaseFilter));

        let mut response = ConfigResponse {
            data_id: "test".to_string(),
            group: "group".to_string(),
            content: Some("hello".to_string()),
            ..Default::default()
        };

        manager.do_filter_query(&mut response).await.unwrap();

        // Uppercase (order 10) runs before Prefix (order 20)
        assert_eq!(response.content.as_deref(), Some("pref:HELLO"));
        assert_eq!(manager.filter_names(), vec!["uppercase", "prefix"]);
    }

    #[tokio::test]
    async fn test_filter_error_propagates() {
        let manager = ConfigFilterChainManager::new();
        manager.add_filter(Arc::new(RejectFilter));
        manager.add_filter(Arc::new(LoggingConfigFilter::new(5)));

        let mut response = ConfigResponse::default();
        assert!(manager.do_filter_query(&mut response).await.is_err());
    }

    #[test]
    fn test_remove_filter() {
        let manager = ConfigFilterChainManager::new();
        manager.add_filter(Arc::new(UppercaseFilter));
        manager.add_filter(Arc::new(PrefixFilter {
            prefix: "test:".to_string(),
        }));

        manager.remove_filter("uppercase");

        assert_eq!(manager.filter_names(), vec!["prefix"]);
    }

    #[tokio::test]
    async fn test_add_filter_replaces_same_name() {
        let manager = ConfigFilterChainManager::new();
        manager.add_filter(Arc::new(PrefixFilter {
            prefix: "a:".to_string(),
        }));
        manager.add_filter(Arc::new(PrefixFilter {
            prefix: "b:".to_string(),
        }));
        assert_eq!(manager.filter_names(), vec!["prefix"]);

        let mut response = ConfigResponse {
            content: Some("x".to_string()),
            ..Default::default()
        };
        manager.do_filter_query(&mut response).await.unwrap();
        assert_eq!(response.content.as_deref(), Some("b:x"));
    }
}
