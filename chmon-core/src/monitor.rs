use crate::config::MonitorConfig;
use crate::engine::StorageEngine;
use crate::error::{MonitorError, Result};
use crate::executor::{EvictionExecutor, EvictionReport};
use crate::planner::EvictionPlanner;
use crate::sampler::{UsageSample, UsageSampler};
use crate::telemetry::PrometheusExporter;
use std::future::Future;
use std::sync::Arc;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info};

/// Rounds left before eviction decisions resume.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cooldown {
    remaining: u32,
    rounds: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CooldownState {
    Active,
    Cooling(u32),
}

impl Cooldown {
    pub fn new(rounds: u32) -> Self {
        Self {
            remaining: 0,
            rounds,
        }
    }

    pub fn state(&self) -> CooldownState {
        match self.remaining {
            0 => CooldownState::Active,
            n => CooldownState::Cooling(n),
        }
    }

    pub fn remaining(&self) -> u32 {
        self.remaining
    }

    /// Starts a cooldown after an eviction.
    pub fn arm(&mut self) {
        self.remaining = self.rounds;
    }

    /// Consumes one cooling round.
    pub fn tick(&mut self) -> Result<()> {
        self.remaining = self.remaining.checked_sub(1).ok_or_else(|| {
            MonitorError::InvariantViolation(
                "cooldown consumed while no round was remaining".to_string(),
            )
        })?;
        Ok(())
    }
}

/// What a single tick did.
#[derive(Debug, Clone, PartialEq)]
pub enum TickOutcome {
    /// Cooling down; the sample is present when sampling succeeded.
    Skipped {
        remaining: u32,
        sample: Option<UsageSample>,
    },
    /// Usage is at or below the threshold.
    BelowThreshold(UsageSample),
    /// Effective capacity is zero so no ratio could be computed.
    NoCapacity(UsageSample),
    /// Over the threshold but the delete percentage covers no row.
    NothingToDelete(UsageSample),
    Evicted {
        sample: UsageSample,
        report: EvictionReport,
    },
    /// A query timed out or failed; nothing was deleted.
    Aborted(String),
}

/// Owns the ClickHouse handle and the cooldown, the only state that
/// survives across ticks.
pub struct Monitor<E: StorageEngine> {
    engine: E,
    config: MonitorConfig,
    sampler: UsageSampler,
    planner: EvictionPlanner,
    executor: EvictionExecutor,
    cooldown: Cooldown,
    metrics: Option<Arc<PrometheusExporter>>,
}

impl<E: StorageEngine> Monitor<E> {
    pub fn new(engine: E, config: MonitorConfig) -> Self {
        let policy = config.schedule.query_retry();
        let sampler = UsageSampler::new(config.table.all(), config.storage.allocated_bytes, policy);
        let planner = EvictionPlanner::new(&config.table, config.storage.delete_percentage, policy);
        let executor = EvictionExecutor::new(config.table.time_column.clone(), policy);
        let cooldown = Cooldown::new(config.schedule.skip_rounds);

        Self {
            engine,
            config,
            sampler,
            planner,
            executor,
            cooldown,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<PrometheusExporter>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn cooldown(&self) -> &Cooldown {
        &self.cooldown
    }

    pub async fn check_storage_condition(&self) {
        self.sampler.check_storage_condition(&self.engine).await;
    }

    /// Runs one round. Only invariant violations are returned as errors;
    /// query failures abort the round and are reported in the outcome.
    pub async fn tick(&mut self) -> Result<TickOutcome> {
        let outcome = match self.cooldown.state() {
            CooldownState::Cooling(remaining) => {
                info!(remaining, "Skip rounds after a successful deletion");
                let sample = self.sample().await.ok();
                self.cooldown.tick()?;
                TickOutcome::Skipped { remaining, sample }
            }
            CooldownState::Active => self.monitor_memory().await?,
        };

        if let Some(metrics) = &self.metrics {
            metrics.set_cooldown(self.cooldown.remaining());
        }

        Ok(outcome)
    }

    async fn sample(&self) -> Result<UsageSample> {
        match self.sampler.sample(&self.engine).await {
            Ok(sample) => {
                info!(
                    total = sample.capacity,
                    used = sample.used,
                    free = sample.free,
                    percentage = sample.usage_ratio().unwrap_or_default(),
                    "Memory usage"
                );
                if let Some(metrics) = &self.metrics {
                    metrics.update_usage(&sample);
                }
                Ok(sample)
            }
            Err(e) => {
                self.record_failure(&e);
                Err(e)
            }
        }
    }

    async fn monitor_memory(&mut self) -> Result<TickOutcome> {
        let sample = match self.sample().await {
            Ok(sample) => sample,
            Err(e) => return Ok(TickOutcome::Aborted(e.to_string())),
        };

        let Some(ratio) = sample.usage_ratio() else {
            error!(
                allocated = self.config.storage.allocated_bytes,
                free = sample.free,
                used = sample.used,
                "Effective capacity is 0, check STORAGE_SIZE and the ClickHouse disk"
            );
            return Ok(TickOutcome::NoCapacity(sample));
        };

        if ratio <= self.config.storage.threshold {
            debug!(ratio, threshold = self.config.storage.threshold, "Usage below threshold");
            return Ok(TickOutcome::BelowThreshold(sample));
        }

        info!(ratio, threshold = self.config.storage.threshold, "Usage above threshold");

        let boundary = match self.planner.plan(&self.engine).await {
            Ok(Some(boundary)) => boundary,
            Ok(None) => return Ok(TickOutcome::NothingToDelete(sample)),
            Err(e) if e.is_fatal() => return Err(e),
            Err(e) => {
                error!(error = %e, "Failed to get the time boundary");
                self.record_failure(&e);
                return Ok(TickOutcome::Aborted(e.to_string()));
            }
        };

        let report = self
            .executor
            .execute(&self.engine, self.config.table.all(), &boundary)
            .await;

        if !report.is_complete_success() {
            let failed: Vec<&str> = report.failed.iter().map(|(t, _)| t.as_str()).collect();
            error!(?failed, "Some deletes failed, skipping rounds anyway");
        }
        if let Some(metrics) = &self.metrics {
            metrics.record_eviction(&report);
        }

        self.cooldown.arm();
        info!(skip_rounds = self.cooldown.remaining(), "Skip rounds after a deletion");

        Ok(TickOutcome::Evicted { sample, report })
    }

    fn record_failure(&self, error: &MonitorError) {
        if let (Some(metrics), MonitorError::QueryTimeout { operation, .. }) = (&self.metrics, error) {
            metrics.record_query_timeout(operation);
        }
    }

    /// Ticks at the configured interval until Ctrl+C or an invariant
    /// violation.
    pub async fn run(&mut self) -> Result<()> {
        self.run_until(async {
            match tokio::signal::ctrl_c().await {
                Ok(()) => info!("Ctrl+C received, shutting down"),
                Err(e) => {
                    error!(error = %e, "Failed to listen for Ctrl+C");
                    std::future::pending::<()>().await;
                }
            }
        })
        .await
    }

    /// Ticks until `shutdown` completes. A shutdown requested during a tick
    /// takes effect once that tick is done. Missed ticks are not caught up.
    pub async fn run_until<F: Future<Output = ()>>(&mut self, shutdown: F) -> Result<()> {
        let mut interval = interval(self.config.schedule.monitor_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tokio::pin!(shutdown);

        info!(
            period = ?self.config.schedule.monitor_interval,
            table = %self.config.table.name,
            threshold = self.config.storage.threshold,
            "Starting monitor"
        );

        loop {
            tokio::select! {
                biased;
                _ = &mut shutdown => {
                    info!("Monitor shutting down");
                    break;
                }
                _ = interval.tick() => {
                    if let Err(e) = self.tick().await {
                        error!(error = %e, "Monitor stopped");
                        return Err(e);
                    }
                }
            }
        }

        Ok(())
    }
}
