use std::collections::HashSet;

use sheetsync_core::{DateKey, SyncError};
use sheetsync_storage::{retry_with, DocumentStore, RetryPolicy};
use tracing::info;

use crate::layout::TargetSheet;
use crate::locator::RowLocator;

/// Collapses rows sharing a date key down to the earliest one.
pub struct DuplicateResolver<'a> {
    store: &'a dyn DocumentStore,
    retry: RetryPolicy,
}

impl<'a> DuplicateResolver<'a> {
    pub fn new(store: &'a dyn DocumentStore, retry: RetryPolicy) -> Self {
        Self { store, retry }
    }

    /// Clears every matching row except the first and returns how many were cleared.
    /// Grouped sheets keep the first row of each category.
    /// Cleared rows stay in place as blanks so row positions never shift.
    pub async fn resolve(&self, target: &TargetSheet, date: DateKey) -> Result<usize, SyncError> {
        if !target.is_keyed() {
            return Err(SyncError::InvalidInput(format!(
                "`{}` does not keep one row per date",
                target.name
            )));
        }
        let locator = RowLocator::new(self.store, self.retry);
        let mut extra = if target.is_grouped() {
            let mut seen = HashSet::new();
            locator
                .scan_grouped(&target.name, target.columns.first, date)
                .await?
                .into_iter()
                .filter(|(_, category)| !seen.insert(category.clone()))
                .map(|(row, _)| row)
                .collect::<Vec<_>>()
        } else {
            locator
                .scan(&target.name, target.columns.first, date)
                .await?
                .into_iter()
                .skip(1)
                .collect()
        };
        extra.sort_unstable();

        for &row in extra.iter().rev() {
            let address = target.row_address(&target.name, row);
            retry_with(&self.retry, "clear duplicate row", || self.store.clear_range(&address)).await?;
        }
        if !extra.is_empty() {
            info!(sheet = %target.name, %date, removed = extra.len(), "cleared duplicate rows");
        }
        Ok(extra.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::SheetLayout;
    use sheetsync_storage::{MemoryDocumentStore, StoreOp};

    fn key(s: &str) -> DateKey {
        DateKey::parse(s).unwrap()
    }

    #[tokio::test]
    async fn keeps_earliest_row_and_clears_the_rest_bottom_up() {
        let store = MemoryDocumentStore::new("primary");
        store
            .seed(
                "dataset",
                vec![
                    vec!["날짜", "통합 신규"],
                    vec!["2025-09-15", "3"],
                    vec!["2025-09-16", "1"],
                    vec!["2025-09-15", "4"],
                    vec!["2025-09-15", "5"],
                ],
            )
            .await;
        let layout = SheetLayout::default();
        let resolver = DuplicateResolver::new(&store, RetryPolicy::single_attempt());
        let removed = resolver.resolve(layout.find("dataset").unwrap(), key("2025-09-15")).await.unwrap();
        assert_eq!(removed, 2);

        let clears = store
            .writes()
            .await
            .into_iter()
            .filter(|w| w.op == StoreOp::Clear)
            .map(|w| w.address)
            .collect::<Vec<_>>();
        assert_eq!(clears, vec!["'dataset'!A5:F5", "'dataset'!A4:F4"]);

        let grid = store.snapshot("dataset").await.unwrap();
        assert_eq!(grid.len(), 5);
        assert_eq!(grid[1], vec!["2025-09-15", "3"]);
        let remaining = grid.iter().filter(|row| row[0] == "2025-09-15").count();
        assert_eq!(remaining, 1);
    }

    #[tokio::test]
    async fn no_duplicates_removes_nothing() {
        let store = MemoryDocumentStore::new("primary");
        store.seed("dataset", vec![vec!["날짜"], vec!["2025-09-15"]]).await;
        let layout = SheetLayout::default();
        let resolver = DuplicateResolver::new(&store, RetryPolicy::single_attempt());
        assert_eq!(resolver.resolve(layout.find("dataset").unwrap(), key("2025-09-15")).await.unwrap(), 0);
        assert_eq!(resolver.resolve(layout.find("dataset").unwrap(), key("2025-09-01")).await.unwrap(), 0);
        assert_eq!(store.calls(StoreOp::Clear).await, 0);
    }

    #[tokio::test]
    async fn grouped_sheets_keep_one_row_per_category() {
        let store = MemoryDocumentStore::new("secondary");
        store
            .seed(
                "dataset3",
                vec![
                    vec!["날짜", "등급명"],
                    vec!["2025-09-15", "GOLD", "2"],
                    vec!["2025-09-15", "SILVER", "5"],
                    vec!["2025-09-15", "GOLD", "2"],
                    vec!["2025-09-16", "GOLD", "1"],
                    vec!["2025-09-15", "SILVER", "5"],
                ],
            )
            .await;
        let layout = SheetLayout::default();
        let resolver = DuplicateResolver::new(&store, RetryPolicy::single_attempt());
        let removed = resolver.resolve(layout.find("dataset3").unwrap(), key("2025-09-15")).await.unwrap();
        assert_eq!(removed, 2);

        let grid = store.snapshot("dataset3").await.unwrap();
        let kept = grid
            .iter()
            .filter(|row| row.first().is_some_and(|d| d == "2025-09-15"))
            .map(|row| row[1].as_str())
            .collect::<Vec<_>>();
        assert_eq!(kept, vec!["GOLD", "SILVER"]);
        assert_eq!(grid[4], vec!["2025-09-16", "GOLD", "1"]);
    }

    #[tokio::test]
    async fn append_only_sheets_are_rejected() {
        let store = MemoryDocumentStore::new("secondary");
        let mut target = SheetLayout::default().find("dataset3").unwrap().clone();
        target.placement = crate::layout::Placement::Scanned;
        target.policy = sheetsync_core::UpdatePolicy::AppendOnly;
        let resolver = DuplicateResolver::new(&store, RetryPolicy::single_attempt());
        let err = resolver.resolve(&target, key("2025-09-15")).await.unwrap_err();
        assert!(matches!(err, SyncError::InvalidInput(_)));
    }
}
