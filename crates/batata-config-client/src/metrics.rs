//! Prometheus metrics monitoring
//!
//! Provides metrics collection for:
//! - Request latency (histogram)
//! - Watched config count (gauge)
//! - Server list size (gauge)
//! - Failed request count (counter)
//!
//! Each client owns its own registry so several clients can live in one
//! process without colliding on metric names.

use std::any::TypeId;
use std::time::{Duration, Instant};

use prometheus::{
    CounterVec, Encoder, HistogramOpts, HistogramVec, IntGauge, Opts, Registry, TextEncoder,
};

use crate::error::Result;
use crate::notify::{Event, EventListener, ServerListChangedEvent};

/// Prometheus metrics collector
pub struct MetricsMonitor {
    registry: Registry,

    /// Request latency histogram
    pub request_latency: HistogramVec,

    /// Number of watched configs
    pub listen_config_count: IntGauge,

    /// Failed request count counter
    pub failed_request_count: CounterVec,

    /// Number of known config servers
    pub server_list_size: IntGauge,
}

impl MetricsMonitor {
    /// Create a new metrics monitor
    pub fn new() -> Result<Self> {
        let registry = Registry::new_custom(Some("batata_config".to_string()), None)?;

        let request_latency = HistogramVec::new(
            HistogramOpts::new("request_latency_seconds", "Request latency in seconds"),
            &["operation", "status"],
        )?;
        let listen_config_count =
            IntGauge::with_opts(Opts::new("listen_config_count", "Number of watched configs"))?;
        let failed_request_count = CounterVec::new(
            Opts::new("failed_requests_total", "Total number of failed requests"),
            &["operation", "error_type"],
        )?;
        let server_list_size =
            IntGauge::with_opts(Opts::new("server_list_size", "Number of known config servers"))?;

        registry.register(Box::new(request_latency.clone()))?;
        registry.register(Box::new(listen_config_count.clone()))?;
        registry.register(Box::new(failed_request_count.clone()))?;
        registry.register(Box::new(server_list_size.clone()))?;

        Ok(Self {
            registry,
            request_latency,
            listen_config_count,
            failed_request_count,
            server_list_size,
        })
    }

    /// Record request latency
    pub fn record_latency(&self, operation: &str, status: &str, duration: Duration) {
        self.request_latency
            .with_label_values(&[operation, status])
            .observe(duration.as_secs_f64());
    }

    pub fn set_listen_config_count(&self, count: usize) {
        self.listen_config_count.set(count as i64);
    }

    /// Increment failed request count
    pub fn increment_failed_request(&self, operation: &str, error_type: &str) {
        self.failed_request_count
            .with_label_values(&[operation, error_type])
            .inc();
    }

    /// Get metrics in Prometheus format
    pub fn gather(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        Ok(encoder.encode_to_string(&metric_families)?)
    }
}

impl EventListener for MetricsMonitor {
    fn interests(&self) -> Vec<TypeId> {
        vec![TypeId::of::<ServerListChangedEvent>()]
    }

    fn on_event(&self, event: &dyn Event) -> anyhow::Result<()> {
        if let Some(changed) = event.as_any().downcast_ref::<ServerListChangedEvent>() {
            self.server_list_size.set(changed.servers.len() as i64);
        }
        Ok(())
    }
}

/// Simple metrics timer for measuring operation duration
pub struct Timer<'a> {
    metrics: &'a MetricsMonitor,
    operation: &'static str,
    start: Instant,
}

impl<'a> Timer<'a> {
    /// Create a new timer
    pub fn start(metrics: &'a MetricsMonitor, operation: &'static str) -> Self {
        Self {
            metrics,
            operation,
            start: Instant::now(),
        }
    }

    /// Stop the timer and record success
    pub fn success(self) {
        self.metrics
            .record_latency(self.operation, "success", self.start.elapsed());
    }

    /// Stop the timer and record failure
    pub fn failure(self, error_type: &str) {
        self.metrics
            .record_latency(self.operation, "error", self.start.elapsed());
        self.metrics
            .increment_failed_request(self.operation, error_type);
    }
}
