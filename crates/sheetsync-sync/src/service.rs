use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use sheetsync_core::{
    DailyMetrics, DailySnapshot, DateKey, DateRange, DateReport, Outcome, SheetOutcome,
    SweepReport, SyncError, ValueInputMode,
};
use sheetsync_source::MetricsSource;
use sheetsync_storage::{retry_with, DocumentStore, RetryPolicy};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::layout::{SheetLayout, SpreadsheetRole, TargetSheet};
use crate::resolver::DuplicateResolver;
use crate::upsert::{UpsertContext, UpsertEngine};

pub const STAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct FixedClock(pub DateTime<Utc>);

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        self.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SweepMode {
    /// Write-once rows for past dates are left alone.
    #[default]
    Routine,
    /// Every row in the range is rewritten from the source.
    Reconcile,
}

/// One async mutex per spreadsheet id.
#[derive(Debug, Default)]
pub struct SpreadsheetLocks {
    inner: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl SpreadsheetLocks {
    /// Locks every id, always in sorted order so overlapping callers cannot deadlock.
    pub async fn acquire(&self, ids: &[&str]) -> Vec<OwnedMutexGuard<()>> {
        let mut ids = ids.to_vec();
        ids.sort_unstable();
        ids.dedup();
        let locks = {
            let mut inner = self.inner.lock().await;
            ids.iter()
                .map(|id| inner.entry(id.to_string()).or_default().clone())
                .collect::<Vec<_>>()
        };
        let mut guards = Vec::with_capacity(locks.len());
        for lock in locks {
            guards.push(lock.lock_owned().await);
        }
        guards
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResolveResult {
    pub sheet: String,
    pub removed: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Drives metrics from the source into every configured sheet.
pub struct SyncService {
    source: Arc<dyn MetricsSource>,
    primary: Arc<dyn DocumentStore>,
    secondary: Option<Arc<dyn DocumentStore>>,
    layout: SheetLayout,
    fetch_retry: RetryPolicy,
    write_retry: RetryPolicy,
    clock: Arc<dyn Clock>,
    timezone: Tz,
    locks: SpreadsheetLocks,
}

impl SyncService {
    pub fn new(source: Arc<dyn MetricsSource>, primary: Arc<dyn DocumentStore>, layout: SheetLayout) -> Self {
        Self {
            source,
            primary,
            secondary: None,
            layout,
            fetch_retry: RetryPolicy::fixed(3, std::time::Duration::from_millis(5000)),
            write_retry: RetryPolicy::default(),
            clock: Arc::new(SystemClock),
            timezone: chrono_tz::Asia::Seoul,
            locks: SpreadsheetLocks::default(),
        }
    }

    pub fn with_secondary(mut self, store: Arc<dyn DocumentStore>) -> Self {
        self.secondary = Some(store);
        self
    }

    pub fn with_retry(mut self, fetch: RetryPolicy, write: RetryPolicy) -> Self {
        self.fetch_retry = fetch;
        self.write_retry = write;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_timezone(mut self, timezone: Tz) -> Self {
        self.timezone = timezone;
        self
    }

    pub fn layout(&self) -> &SheetLayout {
        &self.layout
    }

    pub fn timezone(&self) -> Tz {
        self.timezone
    }

    /// Calendar day of "now" in the configured zone.
    pub fn today(&self) -> DateKey {
        DateKey::from_date(self.clock.now().with_timezone(&self.timezone).date_naive())
    }

    pub fn stamp(&self) -> String {
        self.clock
            .now()
            .with_timezone(&self.timezone)
            .format(STAMP_FORMAT)
            .to_string()
    }

    fn store_for(&self, role: SpreadsheetRole) -> Option<&Arc<dyn DocumentStore>> {
        match role {
            SpreadsheetRole::Primary => Some(&self.primary),
            SpreadsheetRole::Secondary => self.secondary.as_ref(),
        }
    }

    fn spreadsheet_ids(&self) -> Vec<&str> {
        let mut ids = vec![self.primary.spreadsheet_id()];
        if let Some(secondary) = &self.secondary {
            ids.push(secondary.spreadsheet_id());
        }
        ids
    }

    /// Syncs one date into every sheet. Failures are reported in the returned outcome.
    pub async fn sync_date(&self, date: DateKey, reconcile: bool) -> DateReport {
        let _guards = self.locks.acquire(&self.spreadsheet_ids()).await;
        self.apply_date(date, reconcile).await
    }

    pub async fn sync_today(&self) -> DateReport {
        self.sync_date(self.today(), false).await
    }

    /// Routine pass over yesterday, filling rows the last hourly runs missed.
    pub async fn check_previous_day(&self) -> DateReport {
        let today = self.today();
        match today.pred() {
            Some(yesterday) => self.sync_date(yesterday, false).await,
            None => DateReport::failed(today, "no previous day"),
        }
    }

    /// Walks the range one day at a time; one entry per day whatever happens.
    pub async fn sweep(&self, range: DateRange, mode: SweepMode) -> SweepReport {
        let run_id = Uuid::new_v4();
        let span = info_span!("sweep", %run_id, start = %range.start, end = %range.end, ?mode);
        async move {
            let _guards = self.locks.acquire(&self.spreadsheet_ids()).await;
            let started_at = self.clock.now();
            info!(days = range.len(), "sweep started");

            let mut entries = Vec::with_capacity(range.len());
            for date in range.days() {
                let report = self.apply_date(date, mode == SweepMode::Reconcile).await;
                entries.push(report);
            }

            let report = SweepReport {
                range,
                started_at,
                finished_at: self.clock.now(),
                entries,
            };
            let counts = report.counts();
            info!(
                written = counts.written,
                skipped = counts.skipped,
                failed = counts.failed,
                status = ?report.status(),
                "sweep finished"
            );
            report
        }
        .instrument(span)
        .await
    }

    async fn apply_date(&self, date: DateKey, reconcile: bool) -> DateReport {
        let with_secondary =
            self.secondary.is_some() && self.layout.for_role(SpreadsheetRole::Secondary).next().is_some();
        let snapshot = match retry_with(&self.fetch_retry, "fetch metrics", || {
            self.source.fetch_snapshot(date, with_secondary)
        })
        .await
        {
            Ok(snapshot) => snapshot,
            Err(err) => {
                warn!(%date, error = %err, "fetching metrics failed");
                return DateReport::failed(date, err);
            }
        };

        let ctx = UpsertContext {
            today: self.today(),
            stamp: self.stamp(),
            reconcile,
        };
        let mut sheets = Vec::with_capacity(self.layout.sheets.len());
        for target in &self.layout.sheets {
            let Some(store) = self.store_for(target.spreadsheet) else {
                debug!(sheet = %target.name, "secondary spreadsheet not configured, skipping");
                continue;
            };
            let outcome = match self.apply_target(store.as_ref(), target, &snapshot, &ctx).await {
                Ok(outcome) => outcome,
                Err(err) => {
                    warn!(%date, sheet = %target.name, error = %err, "sheet update failed");
                    Outcome::failed(err)
                }
            };
            sheets.push(SheetOutcome {
                sheet: target.sheet_name_for(date),
                outcome,
            });
        }

        let report = DateReport::from_sheets(date, sheets);
        info!(%date, outcome = ?report.outcome, "date synced");
        report
    }

    async fn apply_target(
        &self,
        store: &dyn DocumentStore,
        target: &TargetSheet,
        snapshot: &DailySnapshot,
        ctx: &UpsertContext,
    ) -> Result<Outcome, SyncError> {
        if target.create_if_missing {
            let sheet = target.sheet_name_for(snapshot.date);
            let created =
                retry_with(&self.write_retry, "ensure sheet", || store.ensure_sheet_exists(&sheet)).await?;
            if created && !target.header.is_empty() && !target.is_monthly() {
                self.write_header_row(store, target).await?;
            }
        }
        let rows = target.build_rows(snapshot, &ctx.stamp);
        UpsertEngine::new(store, self.write_retry)
            .upsert(target, snapshot.date, &rows, ctx)
            .await
    }

    /// Writes header rows into every scanned sheet, creating missing sheets.
    pub async fn setup_headers(&self) -> Vec<SheetOutcome> {
        let _guards = self.locks.acquire(&self.spreadsheet_ids()).await;
        let mut results = Vec::new();
        for target in &self.layout.sheets {
            if target.header.is_empty() || target.is_monthly() {
                continue;
            }
            let Some(store) = self.store_for(target.spreadsheet) else {
                continue;
            };
            let outcome = match self.write_header(store.as_ref(), target).await {
                Ok(()) => Outcome::Written,
                Err(err) => {
                    warn!(sheet = %target.name, error = %err, "header setup failed");
                    Outcome::failed(err)
                }
            };
            results.push(SheetOutcome {
                sheet: target.name.clone(),
                outcome,
            });
        }
        results
    }

    async fn write_header(&self, store: &dyn DocumentStore, target: &TargetSheet) -> Result<(), SyncError> {
        retry_with(&self.write_retry, "ensure sheet", || store.ensure_sheet_exists(&target.name)).await?;
        self.write_header_row(store, target).await?;
        if target.format_header {
            retry_with(&self.write_retry, "format header", || {
                store.format_header_row(&target.name, target.columns)
            })
            .await?;
        }
        info!(sheet = %target.name, "header written");
        Ok(())
    }

    async fn write_header_row(&self, store: &dyn DocumentStore, target: &TargetSheet) -> Result<(), SyncError> {
        let address = target.row_address(&target.name, 1);
        let header = [target.header_row()];
        retry_with(&self.write_retry, "write header", || {
            store.update_range(&address, &header, ValueInputMode::Raw)
        })
        .await
    }

    /// Collapses duplicate rows for `date` in one named sheet, or in every keyed sheet.
    pub async fn resolve_duplicates(
        &self,
        date: DateKey,
        sheet: Option<&str>,
    ) -> Result<Vec<ResolveResult>, SyncError> {
        let targets: Vec<&TargetSheet> = match sheet {
            Some(name) => {
                let target = self
                    .layout
                    .find(name)
                    .ok_or_else(|| SyncError::InvalidInput(format!("unknown sheet `{name}`")))?;
                if !target.is_keyed() {
                    return Err(SyncError::InvalidInput(format!(
                        "`{name}` does not keep one row per date"
                    )));
                }
                if self.store_for(target.spreadsheet).is_none() {
                    return Err(SyncError::NotConfigured("GOOGLE_SPREADSHEET_ID2".into()));
                }
                vec![target]
            }
            None => self
                .layout
                .sheets
                .iter()
                .filter(|t| t.is_keyed() && self.store_for(t.spreadsheet).is_some())
                .collect(),
        };

        let _guards = self.locks.acquire(&self.spreadsheet_ids()).await;
        let mut results = Vec::with_capacity(targets.len());
        for target in targets {
            let Some(store) = self.store_for(target.spreadsheet) else {
                continue;
            };
            let resolver = DuplicateResolver::new(store.as_ref(), self.write_retry);
            let result = match resolver.resolve(target, date).await {
                Ok(removed) => ResolveResult {
                    sheet: target.name.clone(),
                    removed,
                    error: None,
                },
                Err(err) => {
                    warn!(sheet = %target.name, %date, error = %err, "duplicate cleanup failed");
                    ResolveResult {
                        sheet: target.name.clone(),
                        removed: 0,
                        error: Some(err.to_string()),
                    }
                }
            };
            results.push(result);
        }
        Ok(results)
    }

    pub async fn fetch_daily_metrics(&self, date: DateKey) -> Result<DailyMetrics, SyncError> {
        retry_with(&self.fetch_retry, "fetch metrics", || self.source.fetch_daily_metrics(date)).await
    }

    pub async fn fetch_period_totals(&self, range: DateRange) -> Result<DailyMetrics, SyncError> {
        retry_with(&self.fetch_retry, "fetch period totals", || {
            self.source.fetch_period_totals(range)
        })
        .await
    }
}
