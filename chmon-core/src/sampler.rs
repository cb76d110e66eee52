use crate::engine::StorageEngine;
use crate::error::Result;
use crate::retry::RetryPolicy;
use serde::Serialize;
use tracing::{info, warn};

pub const DISK_USAGE_QUERY: &str = "SELECT free_space, total_space FROM system.disks";

/// Free and total bytes of the disk backing ClickHouse.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DiskUsage {
    pub free: u64,
    pub total: u64,
}

/// Usage measured in one tick. Never reused across ticks since the disk
/// underneath can change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct UsageSample {
    pub free: u64,
    pub used: u64,
    /// Smaller of the allocated budget and `free + used`.
    pub capacity: u64,
}

impl UsageSample {
    pub fn new(disk: DiskUsage, used: u64, allocated: u64) -> Self {
        Self {
            free: disk.free,
            used,
            capacity: allocated.min(disk.free.saturating_add(used)),
        }
    }

    /// `used / capacity`, or `None` when there is no capacity at all.
    pub fn usage_ratio(&self) -> Option<f64> {
        if self.capacity == 0 {
            None
        } else {
            Some(self.used as f64 / self.capacity as f64)
        }
    }
}

/// Measures storage usage of the monitored table set.
pub struct UsageSampler {
    parts_query: String,
    allocated: u64,
    policy: RetryPolicy,
}

impl UsageSampler {
    pub fn new<'a>(
        tables: impl IntoIterator<Item = &'a str>,
        allocated: u64,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            parts_query: parts_query(tables),
            allocated,
            policy,
        }
    }

    pub async fn get_disk_usage<E: StorageEngine + ?Sized>(&self, engine: &E) -> Result<DiskUsage> {
        let row = self
            .policy
            .query("get the disk usage", || engine.query_row(DISK_USAGE_QUERY))
            .await?;

        Ok(DiskUsage {
            free: row.get(0)?,
            total: row.get(1)?,
        })
    }

    /// Bytes held by the active data parts of the monitored tables.
    pub async fn get_engine_usage<E: StorageEngine + ?Sized>(&self, engine: &E) -> Result<u64> {
        let row = self
            .policy
            .query("get the used space size by ClickHouse", || {
                engine.query_row(&self.parts_query)
            })
            .await?;
        row.get(0)
    }

    pub async fn sample<E: StorageEngine + ?Sized>(&self, engine: &E) -> Result<UsageSample> {
        let disk = self.get_disk_usage(engine).await?;
        let used = self.get_engine_usage(engine).await?;
        Ok(UsageSample::new(disk, used, self.allocated))
    }

    /// Logs how much of the disk is available to ClickHouse at all. A low
    /// value implies the disk is shared with other software.
    pub async fn check_storage_condition<E: StorageEngine + ?Sized>(&self, engine: &E) {
        let disk = match self.get_disk_usage(engine).await {
            Ok(disk) => disk,
            Err(e) => {
                warn!(error = %e, "Skipping storage condition check");
                return;
            }
        };
        let used = match self.get_engine_usage(engine).await {
            Ok(used) => used,
            Err(e) => {
                warn!(error = %e, "Skipping storage condition check");
                return;
            }
        };

        match available_percentage(disk, used) {
            Some(available) => info!(
                available_percentage = available,
                "Low available percentage implies ClickHouse does not save data on a dedicated disk"
            ),
            None => warn!("ClickHouse reports a disk with no total space"),
        }
    }
}

fn available_percentage(disk: DiskUsage, used: u64) -> Option<f64> {
    if disk.total == 0 {
        return None;
    }
    Some(disk.free.saturating_add(used) as f64 / disk.total as f64)
}

fn parts_query<'a>(tables: impl IntoIterator<Item = &'a str>) -> String {
    let names = tables
        .into_iter()
        .map(|t| format!("'{}'", t))
        .collect::<Vec<_>>()
        .join(", ");
    format!(
        "SELECT SUM(bytes) FROM system.parts WHERE active AND table IN ({})",
        names
    )
}
