use async_trait::async_trait;
use sheetsync_core::{ColumnSpan, SheetAddress, SheetRow, SyncError, ValueInputMode};

/// Row-level access to one spreadsheet.
///
/// Reads are never cached: every call reflects the store's current state, including
/// edits made outside this process.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    fn spreadsheet_id(&self) -> &str;

    /// Cells of one column from row 1 down to the last non-empty cell. Gaps are `""`.
    async fn get_column(&self, sheet: &str, column: u32) -> Result<Vec<String>, SyncError>;

    /// Rendered cell values of a range; trailing empty rows and cells are omitted.
    async fn get_range(&self, address: &SheetAddress) -> Result<Vec<Vec<String>>, SyncError>;

    async fn update_range(
        &self,
        address: &SheetAddress,
        rows: &[SheetRow],
        mode: ValueInputMode,
    ) -> Result<(), SyncError>;

    async fn append_rows(
        &self,
        address: &SheetAddress,
        rows: &[SheetRow],
        mode: ValueInputMode,
    ) -> Result<(), SyncError>;

    async fn clear_range(&self, address: &SheetAddress) -> Result<(), SyncError>;

    /// Creates the sheet when absent. Returns `true` only when it was created.
    async fn ensure_sheet_exists(&self, sheet: &str) -> Result<bool, SyncError>;

    async fn list_sheets(&self) -> Result<Vec<String>, SyncError>;

    /// Bold header styling plus a frozen first row.
    async fn format_header_row(&self, sheet: &str, columns: ColumnSpan) -> Result<(), SyncError>;
}
