//! The narrow surface of the storage engine the monitor depends on.

use crate::error::{MonitorError, Result};
use async_trait::async_trait;
use std::str::FromStr;

/// A single result row, one string per column as returned by the engine.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Row {
    columns: Vec<String>,
}

impl Row {
    pub fn new(columns: Vec<String>) -> Self {
        Self { columns }
    }

    /// Builds a row from a TabSeparated line.
    pub fn from_tsv(line: &str) -> Self {
        Self::new(line.split('\t').map(|c| c.to_string()).collect())
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    pub fn raw(&self, index: usize) -> Result<&str> {
        self.columns.get(index).map(String::as_str).ok_or_else(|| {
            MonitorError::InvalidResponse(format!(
                "column {} missing, row has {} column(s)",
                index,
                self.columns.len()
            ))
        })
    }

    pub fn get<T>(&self, index: usize) -> Result<T>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        let raw = self.raw(index)?;
        raw.parse().map_err(|e: T::Err| {
            MonitorError::InvalidResponse(format!("column {} value {:?}: {}", index, raw, e))
        })
    }
}

impl<S: Into<String>> FromIterator<S> for Row {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        Self::new(iter.into_iter().map(Into::into).collect())
    }
}

/// Query/execute access to the storage engine.
///
/// A handle is created once by the connection manager and lent to every
/// other component. Implementations must not retry internally; callers
/// wrap each call in a [`crate::retry::RetryPolicy`].
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait StorageEngine: Send + Sync {
    async fn ping(&self) -> Result<()>;

    /// Runs a query and returns its first row.
    async fn query_row(&self, sql: &str) -> Result<Row>;

    /// Runs a command, returning the number of rows it reports as written.
    async fn exec(&self, sql: &str) -> Result<u64>;
}
