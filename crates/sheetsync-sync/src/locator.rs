use sheetsync_core::{ColumnSpan, DateKey, SheetAddress, SyncError};
use sheetsync_storage::{retry_with, DocumentStore, RetryPolicy};

/// Finds the row holding a date key.
pub struct RowLocator<'a> {
    store: &'a dyn DocumentStore,
    retry: RetryPolicy,
}

impl<'a> RowLocator<'a> {
    pub fn new(store: &'a dyn DocumentStore, retry: RetryPolicy) -> Self {
        Self { store, retry }
    }

    /// Every 1-based row in `column` whose value is exactly `key`, ascending.
    /// Row 1 is the header and never matches.
    pub async fn scan(&self, sheet: &str, column: u32, key: DateKey) -> Result<Vec<u32>, SyncError> {
        let values = retry_with(&self.retry, "read key column", || {
            self.store.get_column(sheet, column)
        })
        .await?;
        let needle = key.to_string();
        Ok(values
            .iter()
            .enumerate()
            .skip(1)
            .filter(|(_, value)| **value == needle)
            .map(|(index, _)| index as u32 + 1)
            .collect())
    }

    /// Rows whose date cell is exactly `key`, paired with the category cell beside it.
    pub async fn scan_grouped(
        &self,
        sheet: &str,
        column: u32,
        key: DateKey,
    ) -> Result<Vec<(u32, String)>, SyncError> {
        let address = SheetAddress::columns(sheet, ColumnSpan::new(column, column + 1));
        let rows = retry_with(&self.retry, "read key columns", || self.store.get_range(&address)).await?;
        let needle = key.to_string();
        Ok(rows
            .into_iter()
            .enumerate()
            .skip(1)
            .filter(|(_, cells)| cells.first().is_some_and(|date| *date == needle))
            .map(|(index, mut cells)| {
                let category = if cells.len() > 1 { cells.swap_remove(1) } else { String::new() };
                (index as u32 + 1, category)
            })
            .collect())
    }

    /// First matching row, if any.
    pub async fn locate(&self, sheet: &str, column: u32, key: DateKey) -> Result<Option<u32>, SyncError> {
        Ok(self.scan(sheet, column, key).await?.into_iter().next())
    }
}

/// Fixed row of a day inside a monthly sheet.
pub fn monthly_row(date: DateKey, row_offset: u32) -> u32 {
    date.day_of_month() + row_offset
}
