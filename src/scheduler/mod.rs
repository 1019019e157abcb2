//! Reconciliation sweeps.
//!
//! Four fixed-interval jobs settle pending cashbacks, retry failed ones, cancel expired ones and
//! expire stale payments. Every run executes in its own task so a failing or panicking sweep is
//! logged and the schedule carries on. When a [`DbJobLease`] is configured, a scheduled run first
//! takes the job's lease; manual triggers skip the lease.

pub mod lease;

pub use lease::DbJobLease;

use crate::{
    config::SchedulerConfig,
    errors::ServiceError,
    services::{cashbacks::CashbackProcessResult, CashbackService, PaymentService},
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use strum::IntoEnumIterator;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{error, info, instrument, warn};

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
    strum::EnumIter,
)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum JobKind {
    ProcessPendingCashbacks,
    RetryFailedCashbacks,
    CancelExpiredCashbacks,
    ExpirePendingPayments,
}

impl JobKind {
    pub fn interval(self, config: &SchedulerConfig) -> Duration {
        Duration::from_secs(match self {
            JobKind::ProcessPendingCashbacks => config.process_pending_interval_secs,
            JobKind::RetryFailedCashbacks => config.retry_failed_interval_secs,
            JobKind::CancelExpiredCashbacks => config.cancel_expired_interval_secs,
            JobKind::ExpirePendingPayments => config.expire_payments_interval_secs,
        })
    }
}

/// Outcome of one sweep.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobReport {
    pub job: JobKind,
    pub started_at: DateTime<Utc>,
    /// Records the sweep touched.
    pub processed: u64,
    pub succeeded: u64,
    pub failed: u64,
    /// True when another instance held the lease and nothing ran.
    pub skipped: bool,
    pub duration_ms: u64,
}

impl JobReport {
    fn new(job: JobKind, started_at: DateTime<Utc>) -> Self {
        Self {
            job,
            started_at,
            processed: 0,
            succeeded: 0,
            failed: 0,
            skipped: false,
            duration_ms: 0,
        }
    }

    fn with_results(mut self, results: &[CashbackProcessResult]) -> Self {
        self.processed = results.len() as u64;
        self.succeeded = results.iter().filter(|r| r.success).count() as u64;
        self.failed = self.processed - self.succeeded;
        self
    }

    fn with_count(mut self, count: u64) -> Self {
        self.processed = count;
        self.succeeded = count;
        self
    }
}

struct JobRunner {
    payments: Arc<PaymentService>,
    cashbacks: Arc<CashbackService>,
    config: SchedulerConfig,
    max_retries: i32,
    lease: Option<DbJobLease>,
}

impl JobRunner {
    async fn execute(&self, job: JobKind) -> Result<JobReport, ServiceError> {
        let started = Instant::now();
        let report = JobReport::new(job, Utc::now());

        let mut report = match job {
            JobKind::ProcessPendingCashbacks => report.with_results(
                &self
                    .cashbacks
                    .process_pending_cashbacks(self.config.batch_size)
                    .await?,
            ),
            JobKind::RetryFailedCashbacks => report.with_results(
                &self
                    .cashbacks
                    .retry_failed_cashbacks(self.max_retries, self.config.batch_size)
                    .await?,
            ),
            JobKind::CancelExpiredCashbacks => {
                report.with_count(self.cashbacks.cancel_expired_cashbacks().await?)
            }
            JobKind::ExpirePendingPayments => {
                report.with_count(self.payments.process_expired_payments().await?)
            }
        };

        report.duration_ms = started.elapsed().as_millis() as u64;
        metrics::counter!("stateset_scheduler.runs", 1, "job" => job.to_string());
        metrics::histogram!("stateset_scheduler.duration", started.elapsed(), "job" => job.to_string());
        info!(
            job = %job,
            processed = report.processed,
            succeeded = report.succeeded,
            failed = report.failed,
            duration_ms = report.duration_ms,
            timezone = %self.config.timezone,
            "Reconciliation job finished"
        );
        Ok(report)
    }

    /// A scheduled run: takes the lease first when one is configured.
    async fn run_scheduled(&self, job: JobKind) -> Result<JobReport, ServiceError> {
        if let Some(lease) = &self.lease {
            // Shorter than the period so the next tick on any instance can take it.
            let ttl = job
                .interval(&self.config)
                .saturating_sub(Duration::from_secs(1))
                .max(Duration::from_secs(1));
            if !lease.try_acquire(&job.to_string(), ttl).await? {
                info!(job = %job, holder = lease.holder(), "Lease held elsewhere, skipping run");
                let mut report = JobReport::new(job, Utc::now());
                report.skipped = true;
                return Ok(report);
            }
        }
        self.execute(job).await
    }
}

struct Running {
    shutdown: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
}

/// Owns the four periodic sweeps. Start and stop act on all of them together.
pub struct ReconciliationScheduler {
    runner: Arc<JobRunner>,
    running: Mutex<Option<Running>>,
}

impl ReconciliationScheduler {
    pub fn new(
        payments: Arc<PaymentService>,
        cashbacks: Arc<CashbackService>,
        config: SchedulerConfig,
        max_retries: i32,
    ) -> Self {
        Self {
            runner: Arc::new(JobRunner {
                payments,
                cashbacks,
                config,
                max_retries,
                lease: None,
            }),
            running: Mutex::new(None),
        }
    }

    /// Guards scheduled runs with `lease`. Has no effect on a scheduler that is already running.
    pub fn with_lease(mut self, lease: DbJobLease) -> Self {
        if let Some(runner) = Arc::get_mut(&mut self.runner) {
            runner.lease = Some(lease);
        }
        self
    }

    fn state(&self) -> std::sync::MutexGuard<'_, Option<Running>> {
        self.running
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn is_running(&self) -> bool {
        self.state().is_some()
    }

    /// Spawns the job loops. Returns false, and changes nothing, when already running.
    pub fn start(&self) -> bool {
        let mut state = self.state();
        if state.is_some() {
            warn!("Reconciliation scheduler is already running");
            return false;
        }

        let (shutdown, rx) = watch::channel(false);
        let handles = JobKind::iter()
            .map(|job| {
                let runner = self.runner.clone();
                let period = job.interval(&runner.config);
                tokio::spawn(job_loop(runner, job, period, rx.clone()))
            })
            .collect();

        *state = Some(Running { shutdown, handles });
        info!(
            timezone = %self.runner.config.timezone,
            lease = self.runner.lease.is_some(),
            "Reconciliation scheduler started"
        );
        true
    }

    /// Signals every loop to finish and waits for them. A run in progress completes first.
    pub async fn stop(&self) {
        let running = self.state().take();
        let Some(running) = running else {
            return;
        };

        let _ = running.shutdown.send(true);
        for handle in running.handles {
            if let Err(e) = handle.await {
                error!(error = %e, "Reconciliation job loop ended abnormally");
            }
        }
        info!("Reconciliation scheduler stopped");
    }

    /// Runs a job immediately by name, bypassing the lease.
    #[instrument(skip(self))]
    pub async fn trigger(&self, name: &str) -> Result<JobReport, ServiceError> {
        let job = JobKind::from_str(name)
            .map_err(|_| ServiceError::ValidationError(format!("Unknown job: {}", name)))?;
        info!(job = %job, "Manually triggered reconciliation job");
        self.runner.execute(job).await
    }
}

async fn job_loop(
    runner: Arc<JobRunner>,
    job: JobKind,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let runner = runner.clone();
                let run = tokio::spawn(async move { runner.run_scheduled(job).await });
                match run.await {
                    Ok(Ok(_)) => {}
                    Ok(Err(e)) => {
                        metrics::counter!("stateset_scheduler.failures", 1, "job" => job.to_string());
                        error!(job = %job, error = %e, "Reconciliation job failed");
                    }
                    Err(e) => {
                        metrics::counter!("stateset_scheduler.failures", 1, "job" => job.to_string());
                        error!(job = %job, error = %e, "Reconciliation job panicked");
                    }
                }
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_names_are_kebab_case() {
        assert_eq!(
            JobKind::ProcessPendingCashbacks.to_string(),
            "process-pending-cashbacks"
        );
        assert_eq!(
            JobKind::from_str("expire-pending-payments").unwrap(),
            JobKind::ExpirePendingPayments
        );
        assert!(JobKind::from_str("reindex").is_err());
    }

    #[test]
    fn intervals_follow_config() {
        let config = SchedulerConfig::default();
        assert_eq!(
            JobKind::ProcessPendingCashbacks.interval(&config),
            Duration::from_secs(300)
        );
        assert_eq!(
            JobKind::RetryFailedCashbacks.interval(&config),
            Duration::from_secs(1800)
        );
        assert_eq!(
            JobKind::CancelExpiredCashbacks.interval(&config),
            Duration::from_secs(3600)
        );
        assert_eq!(
            JobKind::ExpirePendingPayments.interval(&config),
            Duration::from_secs(600)
        );
    }

    #[test]
    fn report_counts_results() {
        let ok = CashbackProcessResult {
            cashback_id: uuid::Uuid::new_v4(),
            success: true,
            status: None,
            tx_hash: None,
            error: None,
        };
        let bad = CashbackProcessResult {
            success: false,
            ..ok.clone()
        };
        let report = JobReport::new(JobKind::ProcessPendingCashbacks, Utc::now())
            .with_results(&[ok, bad.clone(), bad]);
        assert_eq!(
            (report.processed, report.succeeded, report.failed),
            (3, 1, 2)
        );
    }
}
