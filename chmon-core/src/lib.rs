pub mod clickhouse;
pub mod config;
pub mod engine;
pub mod error;
pub mod executor;
pub mod monitor;
pub mod planner;
pub mod retry;
pub mod sampler;
pub mod size;
pub mod telemetry;

pub use clickhouse::ClickHouseClient;
pub use config::MonitorConfig;
pub use error::{MonitorError, Result};
pub use monitor::Monitor;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub fn init_logging() {
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,chmon_core=debug"))
        )
        .with(tracing_subscriber::fmt::layer().with_target(true))
        .init();
}
