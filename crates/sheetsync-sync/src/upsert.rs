use sheetsync_core::{CellValue, DateKey, Outcome, SheetAddress, SheetRow, SyncError, UpdatePolicy};
use sheetsync_storage::{retry_with, DocumentStore, RetryPolicy};
use tracing::{debug, info};

use crate::layout::{Placement, TargetSheet};
use crate::locator::{monthly_row, RowLocator};

/// Caller-side facts an upsert decision depends on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpsertContext {
    /// Current processing date in the configured zone.
    pub today: DateKey,
    /// Text written into update-time columns.
    pub stamp: String,
    /// Explicit reconciliation: write-once rows may be overwritten.
    pub reconcile: bool,
}

impl UpsertContext {
    fn may_overwrite(&self, target: &TargetSheet, date: DateKey) -> bool {
        date == self.today || self.reconcile || target.policy == UpdatePolicy::AlwaysOverwrite
    }
}

/// Insert, overwrite or skip decision for one date key on one sheet.
pub struct UpsertEngine<'a> {
    store: &'a dyn DocumentStore,
    retry: RetryPolicy,
}

impl<'a> UpsertEngine<'a> {
    pub fn new(store: &'a dyn DocumentStore, retry: RetryPolicy) -> Self {
        Self { store, retry }
    }

    pub async fn upsert(
        &self,
        target: &TargetSheet,
        date: DateKey,
        rows: &[SheetRow],
        ctx: &UpsertContext,
    ) -> Result<Outcome, SyncError> {
        if rows.is_empty() {
            debug!(sheet = %target.name, %date, "nothing to write");
            return Ok(Outcome::SkippedExisting);
        }
        if let Some(row) = rows.iter().find(|r| r.len() != target.columns.width()) {
            return Err(SyncError::InvalidInput(format!(
                "row of {} cells does not fit {} columns of `{}`",
                row.len(),
                target.columns.width(),
                target.name
            )));
        }

        if target.policy == UpdatePolicy::AppendOnly {
            self.append(&target.full_span(), target, rows).await?;
            info!(sheet = %target.name, %date, rows = rows.len(), "appended rows");
            return Ok(Outcome::Written);
        }
        match &target.placement {
            Placement::Monthly { row_offset, .. } => {
                self.upsert_monthly(target, date, single_row(target, rows)?, *row_offset, ctx)
                    .await
            }
            Placement::Scanned => self.upsert_scanned(target, date, single_row(target, rows)?, ctx).await,
            Placement::Grouped => self.upsert_grouped(target, date, rows, ctx).await,
        }
    }

    async fn upsert_monthly(
        &self,
        target: &TargetSheet,
        date: DateKey,
        row: &SheetRow,
        row_offset: u32,
        ctx: &UpsertContext,
    ) -> Result<Outcome, SyncError> {
        let sheet = target.sheet_name_for(date);
        let address = target.row_address(&sheet, monthly_row(date, row_offset));
        if !ctx.may_overwrite(target, date) && self.has_values(&address).await? {
            debug!(sheet = %sheet, %date, "monthly row already filled");
            return Ok(Outcome::SkippedExisting);
        }
        self.overwrite(&address, target, row).await?;
        info!(sheet = %sheet, %date, range = %address, "wrote monthly row");
        Ok(Outcome::Written)
    }

    async fn upsert_scanned(
        &self,
        target: &TargetSheet,
        date: DateKey,
        row: &SheetRow,
        ctx: &UpsertContext,
    ) -> Result<Outcome, SyncError> {
        let locator = RowLocator::new(self.store, self.retry);
        let matches = locator.scan(&target.name, target.columns.first, date).await?;
        let Some(&first) = matches.first() else {
            self.append(&target.full_span(), target, std::slice::from_ref(row)).await?;
            info!(sheet = %target.name, %date, "appended row");
            return Ok(Outcome::Written);
        };

        let address = target.row_address(&target.name, first);
        if !ctx.may_overwrite(target, date) {
            let data = SheetAddress::row(target.name.clone(), first, target.data_columns());
            if self.has_values(&data).await? {
                if matches.len() > 1 {
                    debug!(sheet = %target.name, %date, rows = ?matches, "duplicate rows for date");
                    return Ok(Outcome::SkippedDuplicate);
                }
                debug!(sheet = %target.name, %date, row = first, "row already filled");
                return Ok(Outcome::SkippedExisting);
            }
        }
        self.overwrite(&address, target, row).await?;
        info!(sheet = %target.name, %date, row = first, "overwrote row");
        Ok(Outcome::Written)
    }

    /// One row per (date, category): existing categories follow the overwrite rules,
    /// new ones are appended together.
    async fn upsert_grouped(
        &self,
        target: &TargetSheet,
        date: DateKey,
        rows: &[SheetRow],
        ctx: &UpsertContext,
    ) -> Result<Outcome, SyncError> {
        let locator = RowLocator::new(self.store, self.retry);
        let existing = locator.scan_grouped(&target.name, target.columns.first, date).await?;

        let mut outcomes = Vec::with_capacity(rows.len());
        let mut missing = Vec::new();
        for row in rows {
            let category = row.cells().get(1).map(CellValue::render).unwrap_or_default();
            let matches = existing
                .iter()
                .filter(|(_, c)| *c == category)
                .map(|(r, _)| *r)
                .collect::<Vec<_>>();
            let Some(&first) = matches.first() else {
                missing.push(row.clone());
                continue;
            };
            if !ctx.may_overwrite(target, date) {
                let data = SheetAddress::row(target.name.clone(), first, target.data_columns());
                if self.has_values(&data).await? {
                    debug!(sheet = %target.name, %date, %category, "category row already filled");
                    outcomes.push(if matches.len() > 1 {
                        Outcome::SkippedDuplicate
                    } else {
                        Outcome::SkippedExisting
                    });
                    continue;
                }
            }
            self.overwrite(&target.row_address(&target.name, first), target, row).await?;
            outcomes.push(Outcome::Written);
        }

        if !missing.is_empty() {
            self.append(&target.full_span(), target, &missing).await?;
            outcomes.push(Outcome::Written);
        }
        let outcome = Outcome::fold(outcomes);
        info!(sheet = %target.name, %date, appended = missing.len(), ?outcome, "upserted category rows");
        Ok(outcome)
    }

    async fn has_values(&self, address: &SheetAddress) -> Result<bool, SyncError> {
        let cells = retry_with(&self.retry, "read row", || self.store.get_range(address)).await?;
        Ok(cells.iter().flatten().any(|cell| !cell.trim().is_empty()))
    }

    async fn overwrite(&self, address: &SheetAddress, target: &TargetSheet, row: &SheetRow) -> Result<(), SyncError> {
        let rows = std::slice::from_ref(row);
        retry_with(&self.retry, "update row", || {
            self.store.update_range(address, rows, target.mode)
        })
        .await
    }

    async fn append(&self, address: &SheetAddress, target: &TargetSheet, rows: &[SheetRow]) -> Result<(), SyncError> {
        retry_with(&RetryPolicy::single_attempt(), "append rows", || {
            self.store.append_rows(address, rows, target.mode)
        })
        .await
    }
}

fn single_row<'r>(target: &TargetSheet, rows: &'r [SheetRow]) -> Result<&'r SheetRow, SyncError> {
    match rows {
        [row] => Ok(row),
        _ => Err(SyncError::InvalidInput(format!(
            "`{}` keeps one row per date but {} were built",
            target.name,
            rows.len()
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::SheetLayout;
    use sheetsync_core::{CellValue, ValueInputMode};
    use sheetsync_storage::{MemoryDocumentStore, StoreOp};

    fn key(s: &str) -> DateKey {
        DateKey::parse(s).unwrap()
    }

    fn ctx(today: &str) -> UpsertContext {
        UpsertContext {
            today: key(today),
            stamp: "2025-09-20 10:59:00".into(),
            reconcile: false,
        }
    }

    fn daily_row(date: &str, new: u64) -> SheetRow {
        SheetRow::new(vec![
            date.into(),
            new.into(),
            1u64.into(),
            0u64.into(),
            2u64.into(),
            "2025-09-20 10:59:00".into(),
        ])
    }

    fn write_once_dataset() -> TargetSheet {
        let mut target = SheetLayout::default().find("dataset").unwrap().clone();
        target.policy = UpdatePolicy::WriteOnceUnlessToday;
        target
    }

    async fn store_with_header() -> MemoryDocumentStore {
        let store = MemoryDocumentStore::new("primary");
        store.seed("dataset", vec![vec!["날짜", "통합 신규"]]).await;
        store
    }

    #[tokio::test]
    async fn empty_sheet_gets_row_appended() {
        let store = store_with_header().await;
        let engine = UpsertEngine::new(&store, RetryPolicy::single_attempt());
        let outcome = engine
            .upsert(&write_once_dataset(), key("2025-09-15"), &[daily_row("2025-09-15", 3)], &ctx("2025-09-20"))
            .await
            .unwrap();
        assert_eq!(outcome, Outcome::Written);
        let grid = store.snapshot("dataset").await.unwrap();
        assert_eq!(grid[1], vec!["2025-09-15", "3", "1", "0", "2", "2025-09-20 10:59:00"]);
    }

    #[tokio::test]
    async fn past_date_is_write_once() {
        let store = store_with_header().await;
        let engine = UpsertEngine::new(&store, RetryPolicy::single_attempt());
        let target = write_once_dataset();
        let date = key("2025-09-15");
        engine.upsert(&target, date, &[daily_row("2025-09-15", 3)], &ctx("2025-09-20")).await.unwrap();

        let second = engine
            .upsert(&target, date, &[daily_row("2025-09-15", 5)], &ctx("2025-09-20"))
            .await
            .unwrap();
        assert_eq!(second, Outcome::SkippedExisting);
        assert_eq!(store.snapshot("dataset").await.unwrap()[1][1], "3");
        assert_eq!(store.calls(StoreOp::Append).await, 1);
    }

    #[tokio::test]
    async fn today_is_always_rewritten() {
        let store = store_with_header().await;
        let engine = UpsertEngine::new(&store, RetryPolicy::single_attempt());
        let target = write_once_dataset();
        let date = key("2025-09-20");
        engine.upsert(&target, date, &[daily_row("2025-09-20", 3)], &ctx("2025-09-20")).await.unwrap();

        let second = engine
            .upsert(&target, date, &[daily_row("2025-09-20", 7)], &ctx("2025-09-20"))
            .await
            .unwrap();
        assert_eq!(second, Outcome::Written);
        let grid = store.snapshot("dataset").await.unwrap();
        assert_eq!(grid.len(), 2);
        assert_eq!(grid[1][1], "7");
    }

    #[tokio::test]
    async fn always_overwrite_is_idempotent() {
        let store = store_with_header().await;
        let engine = UpsertEngine::new(&store, RetryPolicy::single_attempt());
        let target = SheetLayout::default().find("dataset").unwrap().clone();
        let date = key("2025-09-15");
        for _ in 0..2 {
            let outcome = engine
                .upsert(&target, date, &[daily_row("2025-09-15", 3)], &ctx("2025-09-20"))
                .await
                .unwrap();
            assert_eq!(outcome, Outcome::Written);
        }
        let grid = store.snapshot("dataset").await.unwrap();
        assert_eq!(grid.len(), 2);
        assert_eq!(grid[1], vec!["2025-09-15", "3", "1", "0", "2", "2025-09-20 10:59:00"]);
        assert_eq!(store.calls(StoreOp::Update).await, 1);
    }

    #[tokio::test]
    async fn blank_placeholder_row_is_filled() {
        let store = MemoryDocumentStore::new("primary");
        store
            .seed("dataset", vec![vec!["날짜"], vec!["2025-09-15", "", "", "", "", ""]])
            .await;
        let engine = UpsertEngine::new(&store, RetryPolicy::single_attempt());
        let outcome = engine
            .upsert(&write_once_dataset(), key("2025-09-15"), &[daily_row("2025-09-15", 3)], &ctx("2025-09-20"))
            .await
            .unwrap();
        assert_eq!(outcome, Outcome::Written);
        assert_eq!(store.snapshot("dataset").await.unwrap()[1][1], "3");
    }

    #[tokio::test]
    async fn duplicated_filled_rows_are_reported() {
        let store = MemoryDocumentStore::new("primary");
        store
            .seed(
                "dataset",
                vec![vec!["날짜"], vec!["2025-09-15", "3"], vec!["2025-09-15", "3"]],
            )
            .await;
        let engine = UpsertEngine::new(&store, RetryPolicy::single_attempt());
        let outcome = engine
            .upsert(&write_once_dataset(), key("2025-09-15"), &[daily_row("2025-09-15", 9)], &ctx("2025-09-20"))
            .await
            .unwrap();
        assert_eq!(outcome, Outcome::SkippedDuplicate);
    }

    #[tokio::test]
    async fn reconcile_overwrites_write_once_rows() {
        let store = MemoryDocumentStore::new("primary");
        store.seed("dataset", vec![vec!["날짜"], vec!["2025-09-15", "3"]]).await;
        let engine = UpsertEngine::new(&store, RetryPolicy::single_attempt());
        let mut ctx = ctx("2025-09-20");
        ctx.reconcile = true;
        let outcome = engine
            .upsert(&write_once_dataset(), key("2025-09-15"), &[daily_row("2025-09-15", 9)], &ctx)
            .await
            .unwrap();
        assert_eq!(outcome, Outcome::Written);
        assert_eq!(store.snapshot("dataset").await.unwrap()[1][1], "9");
    }

    #[tokio::test]
    async fn monthly_rows_use_day_offset_and_interpreted_numbers() {
        let store = MemoryDocumentStore::new("primary");
        store.ensure_sheet_exists("25.08").await.unwrap();
        let layout = SheetLayout::default();
        let monthly = layout.find("monthly").unwrap();
        let engine = UpsertEngine::new(&store, RetryPolicy::single_attempt());
        let row = SheetRow::new(vec!["3".into(), "1".into(), "0".into(), "2".into()]);

        let first = engine.upsert(monthly, key("2025-08-15"), &[row.clone()], &ctx("2025-09-20")).await.unwrap();
        assert_eq!(first, Outcome::Written);
        let writes = store.writes().await;
        assert_eq!(writes[0].address, "'25.08'!C19:F19");
        assert_eq!(writes[0].mode, Some(ValueInputMode::Interpreted));
        assert_eq!(store.row("25.08", 19).await.unwrap()[2], CellValue::Integer(3));

        let second = engine.upsert(monthly, key("2025-08-15"), &[row], &ctx("2025-09-20")).await.unwrap();
        assert_eq!(second, Outcome::SkippedExisting);
    }

    #[tokio::test]
    async fn missing_monthly_sheet_is_an_error() {
        let store = MemoryDocumentStore::new("primary");
        let layout = SheetLayout::default();
        let engine = UpsertEngine::new(&store, RetryPolicy::single_attempt());
        let row = SheetRow::new(vec![1u64.into(), 1u64.into(), 1u64.into(), 1u64.into()]);
        let err = engine
            .upsert(layout.find("monthly").unwrap(), key("2025-08-15"), &[row], &ctx("2025-09-20"))
            .await
            .unwrap_err();
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn append_only_failures_are_not_retried() {
        let store = MemoryDocumentStore::new("secondary");
        store.seed("dataset3", vec![vec!["날짜"]]).await;
        store
            .fail_next(StoreOp::Append, SyncError::transient("append", "timeout"), 1)
            .await;
        let mut target = SheetLayout::default().find("dataset3").unwrap().clone();
        target.placement = Placement::Scanned;
        target.policy = UpdatePolicy::AppendOnly;
        let engine = UpsertEngine::new(&store, RetryPolicy::default());
        let err = engine
            .upsert(&target, key("2025-09-15"), &[grade_row("2025-09-15", "GOLD", 2)], &ctx("2025-09-20"))
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::RetriesExhausted { attempts: 1, .. }));
        assert_eq!(store.calls(StoreOp::Append).await, 1);
    }

    fn grade_row(date: &str, grade: &str, count: u64) -> SheetRow {
        SheetRow::new(vec![
            date.into(),
            grade.into(),
            count.into(),
            1.0f64.into(),
            1.0f64.into(),
            1.0f64.into(),
        ])
    }

    fn grade_rows(grid: &[Vec<String>], date: &str, grade: &str) -> Vec<Vec<String>> {
        grid.iter()
            .filter(|row| row.len() > 1 && row[0] == date && row[1] == grade)
            .cloned()
            .collect()
    }

    #[tokio::test]
    async fn grade_rows_are_keyed_by_date_and_grade() {
        let store = MemoryDocumentStore::new("secondary");
        store.seed("dataset3", vec![vec!["날짜", "등급명"]]).await;
        let layout = SheetLayout::default();
        let target = layout.find("dataset3").unwrap();
        let engine = UpsertEngine::new(&store, RetryPolicy::single_attempt());

        let first = [grade_row("2025-09-20", "GOLD", 2), grade_row("2025-09-20", "SILVER", 5)];
        let outcome = engine.upsert(target, key("2025-09-20"), &first, &ctx("2025-09-20")).await.unwrap();
        assert_eq!(outcome, Outcome::Written);
        assert_eq!(store.calls(StoreOp::Append).await, 1);

        let second = [
            grade_row("2025-09-20", "GOLD", 3),
            grade_row("2025-09-20", "SILVER", 6),
            grade_row("2025-09-20", "VIP", 1),
        ];
        engine.upsert(target, key("2025-09-20"), &second, &ctx("2025-09-20")).await.unwrap();

        let grid = store.snapshot("dataset3").await.unwrap();
        assert_eq!(grid.len(), 4);
        let gold = grade_rows(&grid, "2025-09-20", "GOLD");
        assert_eq!(gold.len(), 1);
        assert_eq!(gold[0][2], "3");
        assert_eq!(grade_rows(&grid, "2025-09-20", "SILVER")[0][2], "6");
        assert_eq!(grade_rows(&grid, "2025-09-20", "VIP").len(), 1);
        assert_eq!(store.calls(StoreOp::Append).await, 2);
    }

    #[tokio::test]
    async fn write_once_grade_rows_skip_past_dates() {
        let store = MemoryDocumentStore::new("secondary");
        store
            .seed("dataset3", vec![vec!["날짜", "등급명"], vec!["2025-09-15", "GOLD", "2", "1", "1", "1"]])
            .await;
        let mut target = SheetLayout::default().find("dataset3").unwrap().clone();
        target.policy = UpdatePolicy::WriteOnceUnlessToday;
        let engine = UpsertEngine::new(&store, RetryPolicy::single_attempt());

        let outcome = engine
            .upsert(&target, key("2025-09-15"), &[grade_row("2025-09-15", "GOLD", 9)], &ctx("2025-09-20"))
            .await
            .unwrap();
        assert_eq!(outcome, Outcome::SkippedExisting);
        assert_eq!(store.snapshot("dataset3").await.unwrap()[1][2], "2");
        assert_eq!(store.calls(StoreOp::Update).await, 0);
    }
}
