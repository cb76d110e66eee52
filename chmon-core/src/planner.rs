//! Picks the insertion time before which rows are deleted.
//!
//! The boundary is found in the row dimension: with `count` rows and a delete
//! percentage `p`, the time column of the row at offset
//! `floor(count * p) - 1` in the table's natural order becomes the boundary.
//! This assumes the engine iterates rows in insertion order.

use crate::config::TableConfig;
use crate::engine::StorageEngine;
use crate::error::{MonitorError, Result};
use crate::retry::RetryPolicy;
use chrono::NaiveDateTime;
use tracing::{debug, info};

pub const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EvictionBoundary {
    pub time: NaiveDateTime,
    pub delete_row_num: u64,
}

pub struct EvictionPlanner {
    table: String,
    time_column: String,
    delete_percentage: f64,
    policy: RetryPolicy,
}

/// Number of rows to delete, truncated towards zero.
pub fn compute_delete_row_num(count: u64, delete_percentage: f64) -> u64 {
    (count as f64 * delete_percentage) as u64
}

impl EvictionPlanner {
    pub fn new(table: &TableConfig, delete_percentage: f64, policy: RetryPolicy) -> Self {
        Self {
            table: table.name.clone(),
            time_column: table.time_column.clone(),
            delete_percentage,
            policy,
        }
    }

    pub async fn get_delete_row_num<E: StorageEngine + ?Sized>(&self, engine: &E) -> Result<u64> {
        let sql = format!("SELECT COUNT() FROM {}", self.table);
        let count: u64 = self
            .policy
            .query("get the number of records", || engine.query_row(&sql))
            .await?
            .get(0)?;

        let delete_row_num = compute_delete_row_num(count, self.delete_percentage);
        debug!(table = %self.table, count, delete_row_num, "Counted records");
        Ok(delete_row_num)
    }

    /// Reads the insertion time of the last row to delete.
    pub async fn get_time_boundary<E: StorageEngine + ?Sized>(
        &self,
        engine: &E,
        delete_row_num: u64,
    ) -> Result<NaiveDateTime> {
        let offset = delete_row_num.checked_sub(1).ok_or_else(|| {
            MonitorError::InvariantViolation("time boundary requested for zero rows".to_string())
        })?;
        let sql = format!(
            "SELECT {} FROM {} LIMIT 1 OFFSET {}",
            self.time_column, self.table, offset
        );

        let row = self
            .policy
            .query("get the time boundary", || engine.query_row(&sql))
            .await?;
        let raw = row.raw(0)?;

        NaiveDateTime::parse_from_str(raw, TIME_FORMAT).map_err(|e| {
            MonitorError::InvalidResponse(format!("{} value {:?}: {}", self.time_column, raw, e))
        })
    }

    /// Computes the eviction boundary, or `None` when the table is too small
    /// for the delete percentage to cover a single row.
    pub async fn plan<E: StorageEngine + ?Sized>(&self, engine: &E) -> Result<Option<EvictionBoundary>> {
        let delete_row_num = self.get_delete_row_num(engine).await?;
        if delete_row_num == 0 {
            info!(table = %self.table, "No records to delete");
            return Ok(None);
        }

        let time = self.get_time_boundary(engine, delete_row_num).await?;
        info!(
            table = %self.table,
            delete_row_num,
            boundary = %time.format(TIME_FORMAT),
            "Computed time boundary"
        );

        Ok(Some(EvictionBoundary {
            time,
            delete_row_num,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{MockStorageEngine, Row};
    use chrono::NaiveDate;
    use std::time::Duration;

    fn planner(delete_percentage: f64) -> EvictionPlanner {
        let table = TableConfig {
            name: "flows".to_string(),
            derived: vec![],
            time_column: "timeInserted".to_string(),
        };
        EvictionPlanner::new(
            &table,
            delete_percentage,
            RetryPolicy::new(Duration::from_secs(1), Duration::from_secs(10)),
        )
    }

    fn expect_count(engine: &mut MockStorageEngine, count: u64) {
        engine
            .expect_query_row()
            .withf(|sql| sql == "SELECT COUNT() FROM flows")
            .times(1)
            .returning(move |_| Ok(Row::new(vec![count.to_string()])));
    }

    #[test]
    fn test_compute_delete_row_num() {
        assert_eq!(compute_delete_row_num(1000, 0.1), 100);
        assert_eq!(compute_delete_row_num(1000, 0.5), 500);
        assert_eq!(compute_delete_row_num(9, 0.1), 0);
        assert_eq!(compute_delete_row_num(19, 0.1), 1);
        assert_eq!(compute_delete_row_num(0, 1.0), 0);
    }

    #[tokio::test]
    async fn test_boundary_uses_last_deleted_row_offset() {
        let mut engine = MockStorageEngine::new();
        expect_count(&mut engine, 1000);
        engine
            .expect_query_row()
            .withf(|sql| sql == "SELECT timeInserted FROM flows LIMIT 1 OFFSET 99")
            .times(1)
            .returning(|_| Ok(Row::new(vec!["2024-03-01 12:30:45".to_string()])));

        let boundary = planner(0.1).plan(&engine).await.unwrap().unwrap();

        assert_eq!(boundary.delete_row_num, 100);
        assert_eq!(
            boundary.time,
            NaiveDate::from_ymd_opt(2024, 3, 1)
                .unwrap()
                .and_hms_opt(12, 30, 45)
                .unwrap()
        );
    }

    #[tokio::test]
    async fn test_zero_rows_skips_boundary_query() {
        let mut engine = MockStorageEngine::new();
        expect_count(&mut engine, 5);

        assert_eq!(planner(0.1).plan(&engine).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_zero_offset_is_an_invariant_violation() {
        let engine = MockStorageEngine::new();
        let err = planner(0.1).get_time_boundary(&engine, 0).await.unwrap_err();
        assert!(matches!(err, MonitorError::InvariantViolation(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_count_timeout_aborts_planning() {
        let mut engine = MockStorageEngine::new();
        engine
            .expect_query_row()
            .withf(|sql| sql.starts_with("SELECT COUNT()"))
            .returning(|_| Err(MonitorError::Database("too many parts".into())));

        let err = planner(0.1).plan(&engine).await.unwrap_err();

        assert!(matches!(
            err,
            MonitorError::QueryTimeout { ref operation, .. } if operation == "get the number of records"
        ));
    }

    #[tokio::test]
    async fn test_unparseable_boundary() {
        let mut engine = MockStorageEngine::new();
        expect_count(&mut engine, 10);
        engine
            .expect_query_row()
            .withf(|sql| sql.contains("OFFSET 0"))
            .returning(|_| Ok(Row::new(vec!["yesterday".to_string()])));

        let err = planner(0.1).plan(&engine).await.unwrap_err();
        assert!(matches!(err, MonitorError::InvalidResponse(_)));
    }
}
