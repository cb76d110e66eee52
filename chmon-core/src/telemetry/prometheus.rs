use crate::error::Result;
use crate::executor::EvictionReport;
use crate::sampler::UsageSample;
use axum::{routing::get, Router};
use prometheus::{Encoder, Gauge, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};
use std::sync::Arc;
use tracing::{error, info};

pub struct PrometheusExporter {
    registry: Registry,

    // Usage
    disk_free: IntGauge,
    used: IntGauge,
    capacity: IntGauge,
    usage_ratio: Gauge,

    // Eviction
    cooldown_remaining: IntGauge,
    evictions: IntCounter,
    deleted_tables: IntCounterVec,
    query_timeouts: IntCounterVec,
}

impl PrometheusExporter {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let disk_free = IntGauge::new(
            "chmon_disk_free_bytes",
            "Free space on the disk backing ClickHouse in bytes",
        )?;

        let used = IntGauge::new(
            "chmon_used_bytes",
            "Bytes used by the active parts of the monitored tables",
        )?;

        let capacity = IntGauge::new(
            "chmon_capacity_bytes",
            "Effective capacity: smaller of the allocated size and free plus used space",
        )?;

        let usage_ratio = Gauge::new("chmon_usage_ratio", "Used bytes divided by capacity")?;

        let cooldown_remaining = IntGauge::new(
            "chmon_cooldown_remaining",
            "Remaining rounds during which no deletion is decided",
        )?;

        let evictions = IntCounter::new(
            "chmon_evictions_total",
            "Number of eviction attempt sequences",
        )?;

        let deleted_tables = IntCounterVec::new(
            Opts::new(
                "chmon_deleted_tables_total",
                "Per table delete attempts by outcome",
            ),
            &["table", "outcome"],
        )?;

        let query_timeouts = IntCounterVec::new(
            Opts::new(
                "chmon_query_timeouts_total",
                "Operations that kept failing until their timeout",
            ),
            &["operation"],
        )?;

        registry.register(Box::new(disk_free.clone()))?;
        registry.register(Box::new(used.clone()))?;
        registry.register(Box::new(capacity.clone()))?;
        registry.register(Box::new(usage_ratio.clone()))?;
        registry.register(Box::new(cooldown_remaining.clone()))?;
        registry.register(Box::new(evictions.clone()))?;
        registry.register(Box::new(deleted_tables.clone()))?;
        registry.register(Box::new(query_timeouts.clone()))?;

        Ok(Self {
            registry,
            disk_free,
            used,
            capacity,
            usage_ratio,
            cooldown_remaining,
            evictions,
            deleted_tables,
            query_timeouts,
        })
    }

    pub fn update_usage(&self, sample: &UsageSample) {
        self.disk_free.set(clamp(sample.free));
        self.used.set(clamp(sample.used));
        self.capacity.set(clamp(sample.capacity));
        if let Some(ratio) = sample.usage_ratio() {
            self.usage_ratio.set(ratio);
        }
    }

    pub fn set_cooldown(&self, remaining: u32) {
        self.cooldown_remaining.set(remaining as i64);
    }

    pub fn record_eviction(&self, report: &EvictionReport) {
        self.evictions.inc();

        for table in &report.succeeded {
            self.deleted_tables
                .with_label_values(&[table.as_str(), "success"])
                .inc();
        }

        for (table, _) in &report.failed {
            self.deleted_tables
                .with_label_values(&[table.as_str(), "failure"])
                .inc();
        }
    }

    pub fn record_query_timeout(&self, operation: &str) {
        self.query_timeouts.with_label_values(&[operation]).inc();
    }

    pub fn render_metrics(&self) -> String {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();

        if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
            error!("Failed to encode metrics: {}", e);
        }

        String::from_utf8_lossy(&buffer).into_owned()
    }

    pub async fn serve(self: Arc<Self>, port: u16) -> Result<()> {
        let app = Router::new().route(
            "/metrics",
            get(move || async move { self.render_metrics() }),
        );

        let addr = std::net::SocketAddr::from(([0, 0, 0, 0], port));
        info!("Prometheus metrics server listening on {}", addr);

        let listener = tokio::net::TcpListener::bind(addr).await?;
        axum::serve(listener, app).await?;

        Ok(())
    }

    /// Serves the registry in the background.
    pub fn spawn_server(self: &Arc<Self>, port: u16) {
        let exporter = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(e) = exporter.serve(port).await {
                error!("Prometheus server error: {}", e);
            }
        });
    }
}

fn clamp(bytes: u64) -> i64 {
    i64::try_from(bytes).unwrap_or(i64::MAX)
}
