use std::future::Future;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sheetsync_core::{DateKey, DateReport, Outcome};
use thiserror::Error;
use tokio::sync::Mutex;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{info, warn};

use crate::service::SyncService;

/// Cron expressions (seconds resolution, evaluated in UTC).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleConfig {
    pub hourly_cron: String,
    pub daily_check_cron: String,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            hourly_cron: "0 59 * * * *".to_string(),
            // 01:00 in Asia/Seoul
            daily_check_cron: "0 0 16 * * *".to_string(),
        }
    }
}

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("auto update is already running")]
    AlreadyRunning,
    #[error("auto update is not running")]
    NotRunning,
    #[error("scheduler error: {0}")]
    Scheduler(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScheduledJob {
    HourlyToday,
    DailyCheck,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ScheduledRun {
    pub job: ScheduledJob,
    pub date: DateKey,
    pub outcome: Outcome,
    pub finished_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SchedulerStatus {
    pub running: bool,
    pub hourly_cron: String,
    pub daily_check_cron: String,
    pub started_at: Option<DateTime<Utc>>,
    pub last_run: Option<ScheduledRun>,
}

#[derive(Clone)]
struct RunningSchedule {
    scheduler: JobScheduler,
    started_at: DateTime<Utc>,
}

/// Owns the recurring jobs; at most one schedule runs per instance.
pub struct AutoUpdateScheduler {
    service: Arc<SyncService>,
    config: ScheduleConfig,
    state: Mutex<Option<RunningSchedule>>,
    last_run: Arc<Mutex<Option<ScheduledRun>>>,
}

impl AutoUpdateScheduler {
    pub fn new(service: Arc<SyncService>, config: ScheduleConfig) -> Self {
        Self {
            service,
            config,
            state: Mutex::new(None),
            last_run: Arc::new(Mutex::new(None)),
        }
    }

    pub async fn start(&self) -> Result<(), SchedulerError> {
        let mut state = self.state.lock().await;
        if state.is_some() {
            return Err(SchedulerError::AlreadyRunning);
        }
        let scheduler = JobScheduler::new()
            .await
            .map_err(|err| SchedulerError::Scheduler(format!("creating scheduler: {err}")))?;
        for (kind, cron) in [
            (ScheduledJob::HourlyToday, &self.config.hourly_cron),
            (ScheduledJob::DailyCheck, &self.config.daily_check_cron),
        ] {
            let job = self.job(kind, cron)?;
            scheduler
                .add(job)
                .await
                .map_err(|err| SchedulerError::Scheduler(format!("adding job for cron {cron}: {err}")))?;
        }
        scheduler
            .start()
            .await
            .map_err(|err| SchedulerError::Scheduler(format!("starting scheduler: {err}")))?;

        let started_at = Utc::now();
        info!(
            hourly = %self.config.hourly_cron,
            daily_check = %self.config.daily_check_cron,
            "auto update started"
        );
        *state = Some(RunningSchedule { scheduler, started_at });
        Ok(())
    }

    pub async fn stop(&self) -> Result<(), SchedulerError> {
        let mut state = self.state.lock().await;
        stop_running(&mut *state, |mut running: RunningSchedule| async move {
            running
                .scheduler
                .shutdown()
                .await
                .map_err(|err| SchedulerError::Scheduler(format!("stopping scheduler: {err}")))
        })
        .await?;
        info!("auto update stopped");
        Ok(())
    }

    pub async fn status(&self) -> SchedulerStatus {
        let started_at = self.state.lock().await.as_ref().map(|r| r.started_at);
        SchedulerStatus {
            running: started_at.is_some(),
            hourly_cron: self.config.hourly_cron.clone(),
            daily_check_cron: self.config.daily_check_cron.clone(),
            started_at,
            last_run: self.last_run.lock().await.clone(),
        }
    }

    /// Runs one job body immediately, exactly as the schedule would.
    pub async fn run_now(&self, kind: ScheduledJob) -> DateReport {
        run_job(&self.service, &self.last_run, kind).await
    }

    fn job(&self, kind: ScheduledJob, cron: &str) -> Result<Job, SchedulerError> {
        let service = self.service.clone();
        let last_run = self.last_run.clone();
        Job::new_async(cron, move |_uuid, _l| {
            let service = service.clone();
            let last_run = last_run.clone();
            Box::pin(async move {
                run_job(&service, &last_run, kind).await;
            })
        })
        .map_err(|err| SchedulerError::Scheduler(format!("invalid cron `{cron}`: {err}")))
    }
}

/// Clears `state` only after `shutdown` succeeds.
async fn stop_running<S, F, Fut>(state: &mut Option<S>, shutdown: F) -> Result<(), SchedulerError>
where
    S: Clone,
    F: FnOnce(S) -> Fut,
    Fut: Future<Output = Result<(), SchedulerError>>,
{
    let running = state.clone().ok_or(SchedulerError::NotRunning)?;
    shutdown(running).await?;
    *state = None;
    Ok(())
}

async fn run_job(
    service: &SyncService,
    last_run: &Mutex<Option<ScheduledRun>>,
    kind: ScheduledJob,
) -> DateReport {
    let report = match kind {
        ScheduledJob::HourlyToday => service.sync_today().await,
        ScheduledJob::DailyCheck => service.check_previous_day().await,
    };
    if report.outcome.is_failed() {
        warn!(job = ?kind, date = %report.date, outcome = ?report.outcome, "scheduled run failed");
    } else {
        info!(job = ?kind, date = %report.date, outcome = ?report.outcome, "scheduled run finished");
    }
    *last_run.lock().await = Some(ScheduledRun {
        job: kind,
        date: report.date,
        outcome: report.outcome.clone(),
        finished_at: Utc::now(),
    });
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::SheetLayout;
    use crate::testing::{clock_at, ScriptedSource};
    use sheetsync_storage::{DocumentStore, MemoryDocumentStore, RetryPolicy};

    async fn scheduler(config: ScheduleConfig) -> (AutoUpdateScheduler, Arc<MemoryDocumentStore>) {
        let store = Arc::new(MemoryDocumentStore::new("primary-id"));
        store.seed("dataset", vec![vec!["날짜"]]).await;
        store.ensure_sheet_exists("25.09").await.unwrap();
        let service = SyncService::new(Arc::new(ScriptedSource::default()), store.clone(), SheetLayout::default())
            .with_retry(RetryPolicy::single_attempt(), RetryPolicy::single_attempt())
            .with_clock(clock_at("2025-09-20T01:59:00Z"));
        (AutoUpdateScheduler::new(Arc::new(service), config), store)
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn start_and_stop_are_explicit_transitions() {
        let (scheduler, _) = scheduler(ScheduleConfig::default()).await;
        assert!(!scheduler.status().await.running);
        assert!(matches!(scheduler.stop().await, Err(SchedulerError::NotRunning)));

        scheduler.start().await.unwrap();
        let status = scheduler.status().await;
        assert!(status.running);
        assert!(status.started_at.is_some());
        assert_eq!(status.hourly_cron, "0 59 * * * *");
        assert!(matches!(scheduler.start().await, Err(SchedulerError::AlreadyRunning)));

        scheduler.stop().await.unwrap();
        assert!(!scheduler.status().await.running);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn bad_cron_leaves_scheduler_stopped() {
        let (scheduler, _) = scheduler(ScheduleConfig {
            hourly_cron: "every hour".into(),
            ..ScheduleConfig::default()
        })
        .await;
        assert!(matches!(scheduler.start().await, Err(SchedulerError::Scheduler(_))));
        assert!(!scheduler.status().await.running);
    }

    #[tokio::test]
    async fn failed_shutdown_keeps_schedule_running() {
        let mut state = Some(7u8);
        let err = stop_running(&mut state, |_| async {
            Err(SchedulerError::Scheduler("shutdown timed out".into()))
        })
        .await
        .unwrap_err();
        assert!(matches!(err, SchedulerError::Scheduler(_)));
        assert_eq!(state, Some(7));

        stop_running(&mut state, |_| async { Ok(()) }).await.unwrap();
        assert_eq!(state, None);
        assert!(matches!(
            stop_running(&mut state, |_| async { Ok(()) }).await,
            Err(SchedulerError::NotRunning)
        ));
    }

    #[tokio::test]
    async fn job_runs_are_recorded() {
        let (scheduler, store) = scheduler(ScheduleConfig::default()).await;
        let report = scheduler.run_now(ScheduledJob::DailyCheck).await;
        assert_eq!(report.date.to_string(), "2025-09-19");
        assert_eq!(report.outcome, Outcome::Written);
        assert_eq!(store.get_column("dataset", 0).await.unwrap()[1], "2025-09-19");

        let last = scheduler.status().await.last_run.unwrap();
        assert_eq!(last.job, ScheduledJob::DailyCheck);
        assert_eq!(last.date, report.date);
    }
}
