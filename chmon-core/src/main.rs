use chmon_core::{init_logging, telemetry::PrometheusExporter, ClickHouseClient, Monitor, MonitorConfig};
use std::sync::Arc;
use tracing::{error, info};

#[tokio::main]
async fn main() {
    init_logging();

    info!("chmon - ClickHouse storage monitor");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let config = match MonitorConfig::load() {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            std::process::exit(1);
        }
    };

    info!("Configuration loaded");
    info!("  Table: {}", config.table.name);
    info!("  Materialized views: {:?}", config.table.derived);
    info!("  Allocated space: {} bytes", config.storage.allocated_bytes);
    info!("  Threshold: {}", config.storage.threshold);
    info!("  Delete percentage: {}", config.storage.delete_percentage);
    info!("  Monitor interval: {:?}", config.schedule.monitor_interval);

    let client = match ClickHouseClient::connect(
        &config.clickhouse,
        config.schedule.connection_retry(),
        config.schedule.query_timeout,
    )
    .await
    {
        Ok(client) => client,
        Err(e) => {
            error!("Error when connecting to ClickHouse: {}", e);
            std::process::exit(1);
        }
    };

    let mut monitor = Monitor::new(client, config.clone());

    if config.telemetry.enable_prometheus {
        let exporter = match PrometheusExporter::new() {
            Ok(exporter) => Arc::new(exporter),
            Err(e) => {
                error!("Failed to initialize Prometheus exporter: {}", e);
                std::process::exit(1);
            }
        };
        exporter.spawn_server(config.telemetry.metrics_port);
        monitor = monitor.with_metrics(exporter);
    }

    monitor.check_storage_condition().await;

    if let Err(e) = monitor.run().await {
        error!("Monitor error: {}", e);
        std::process::exit(1);
    }

    info!("chmon terminated gracefully");
}
