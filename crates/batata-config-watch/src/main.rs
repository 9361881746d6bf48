//! Command-line config watcher.
//!
//! Connects to a Batata/Nacos server, prints the current value of the given
//! configs and logs every change until interrupted.

mod logging;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use batata_config_client::{
    BatataConfigService, ClientProperties, ConfigChangeListener, ConfigResponse,
};
use clap::Parser;
use tracing::{error, info};

use crate::logging::{LoggingConfig, init_logging};

/// Command line arguments for the watcher
#[derive(Debug, Parser)]
#[command(name = "batata-config-watch", version, about)]
struct Cli {
    /// Client properties file (YAML, TOML or JSON)
    #[arg(short = 'c', long = "config", env = "BATATA_CLIENT_CONFIG_FILE")]
    config: Option<PathBuf>,
    /// Config server addresses, comma separated
    #[arg(short = 's', long = "server-addr", value_delimiter = ',')]
    server_addr: Vec<String>,
    /// Address server used for server discovery
    #[arg(long = "endpoint")]
    endpoint: Option<String>,
    #[arg(short = 'n', long = "namespace")]
    namespace: Option<String>,
    /// Data ids to watch
    #[arg(short = 'd', long = "data-id", required = true)]
    data_ids: Vec<String>,
    #[arg(short = 'g', long = "group", default_value = "DEFAULT_GROUP")]
    group: String,
    /// Timeout of the initial read in milliseconds
    #[arg(long = "timeout-ms", default_value_t = 3000)]
    timeout_ms: u64,
    #[arg(long = "log-dir", env = "BATATA_LOG_DIR")]
    log_dir: Option<PathBuf>,
    #[arg(long = "log-level", default_value = "info")]
    log_level: String,
}

impl Cli {
    /// Apply command line values over the loaded properties.
    fn apply(&self, properties: &mut ClientProperties) {
        if !self.server_addr.is_empty() {
            properties.server_addr = self.server_addr.clone();
        }
        if let Some(endpoint) = &self.endpoint {
            properties.endpoint = Some(endpoint.clone());
        }
        if let Some(namespace) = &self.namespace {
            properties.namespace = namespace.clone();
        }
    }
}

/// Logs every change it receives.
struct LoggingListener;

impl ConfigChangeListener for LoggingListener {
    fn receive_config_info(&self, config_info: ConfigResponse) -> anyhow::Result<()> {
        match &config_info.content {
            Some(content) => info!(
                data_id = %config_info.data_id,
                group = %config_info.group,
                tenant = %config_info.tenant,
                config_type = ?config_info.config_type,
                "Config changed:\n{}",
                content
            ),
            None => info!(
                data_id = %config_info.data_id,
                group = %config_info.group,
                tenant = %config_info.tenant,
                "Config removed"
            ),
        }
        Ok(())
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let _logging_guard = init_logging(&LoggingConfig::new(cli.log_dir.clone(), &cli.log_level))?;

    let mut properties = ClientProperties::load(cli.config.as_deref())?;
    cli.apply(&mut properties);

    let service = BatataConfigService::new(properties)?;
    service.start().await?;

    let listener: Arc<dyn ConfigChangeListener> = Arc::new(LoggingListener);
    let timeout = Duration::from_millis(cli.timeout_ms);
    for data_id in &cli.data_ids {
        match service
            .get_config_and_sign_listener(data_id, &cli.group, timeout, listener.clone())
            .await
        {
            Ok(Some(content)) => info!(data_id = %data_id, group = %cli.group, "Current config:\n{}", content),
            Ok(None) => info!(data_id = %data_id, group = %cli.group, "Config does not exist yet"),
            Err(e) => {
                error!(data_id = %data_id, group = %cli.group, error = %e, "Failed to read config, watching anyway");
                service.add_listener(data_id, &cli.group, listener.clone());
            }
        }
    }

    info!(count = cli.data_ids.len(), status = service.server_status(), "Watching configs, press Ctrl+C to stop");
    tokio::signal::ctrl_c().await?;

    service.shutdown();
    info!("Watcher stopped");
    Ok(())
}
