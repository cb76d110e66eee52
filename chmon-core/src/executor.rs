use crate::engine::StorageEngine;
use crate::planner::{EvictionBoundary, TIME_FORMAT};
use crate::retry::RetryPolicy;
use serde::Serialize;
use tracing::{error, info};

/// Outcome of one eviction attempt sequence.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct EvictionReport {
    /// Tables whose delete was accepted, in the order they were attempted.
    pub succeeded: Vec<String>,
    /// Tables whose delete failed, with the error message.
    pub failed: Vec<(String, String)>,
}

impl EvictionReport {
    pub fn attempted(&self) -> usize {
        self.succeeded.len() + self.failed.len()
    }

    pub fn is_complete_success(&self) -> bool {
        self.failed.is_empty()
    }
}

pub struct EvictionExecutor {
    time_column: String,
    policy: RetryPolicy,
}

pub fn delete_command(table: &str, time_column: &str, boundary: &EvictionBoundary) -> String {
    format!(
        "ALTER TABLE {} DELETE WHERE {} < toDateTime('{}')",
        table,
        time_column,
        boundary.time.format(TIME_FORMAT)
    )
}

impl EvictionExecutor {
    pub fn new(time_column: impl Into<String>, policy: RetryPolicy) -> Self {
        Self {
            time_column: time_column.into(),
            policy,
        }
    }

    /// Deletes rows older than the boundary from every table in order. A
    /// failing table does not stop the remaining ones.
    pub async fn execute<'a, E: StorageEngine + ?Sized>(
        &self,
        engine: &E,
        tables: impl IntoIterator<Item = &'a str>,
        boundary: &EvictionBoundary,
    ) -> EvictionReport {
        let mut report = EvictionReport::default();

        for table in tables {
            let command = delete_command(table, &self.time_column, boundary);
            match self
                .policy
                .query("delete records from ClickHouse", || engine.exec(&command))
                .await
            {
                Ok(_) => {
                    info!(table, "Deleted old records");
                    report.succeeded.push(table.to_string());
                }
                Err(e) => {
                    error!(table, error = %e, "Failed to delete records from ClickHouse");
                    report.failed.push((table.to_string(), e.to_string()));
                }
            }
        }

        report
    }
}
