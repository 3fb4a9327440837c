use std::collections::{BTreeMap, HashMap, VecDeque};

use async_trait::async_trait;
use sheetsync_core::{CellValue, ColumnSpan, SheetAddress, SheetRow, SyncError, ValueInputMode};
use tokio::sync::Mutex;

use crate::store::DocumentStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreOp {
    GetColumn,
    GetRange,
    Update,
    Append,
    Clear,
    EnsureSheet,
    ListSheets,
    FormatHeader,
}

#[derive(Debug, Clone, PartialEq)]
pub struct WriteRecord {
    pub op: StoreOp,
    pub address: String,
    pub rows: Vec<SheetRow>,
    pub mode: Option<ValueInputMode>,
}

#[derive(Debug, Default)]
struct MemoryState {
    sheets: BTreeMap<String, Vec<Vec<CellValue>>>,
    calls: HashMap<StoreOp, usize>,
    failures: HashMap<StoreOp, VecDeque<Option<SyncError>>>,
    writes: Vec<WriteRecord>,
    formatted: Vec<String>,
}

/// Process-local document store with scripted failures, used for dry runs and tests.
#[derive(Debug)]
pub struct MemoryDocumentStore {
    spreadsheet_id: String,
    state: Mutex<MemoryState>,
}

impl MemoryDocumentStore {
    pub fn new(spreadsheet_id: impl Into<String>) -> Self {
        Self {
            spreadsheet_id: spreadsheet_id.into(),
            state: Mutex::new(MemoryState::default()),
        }
    }

    /// Replaces a sheet's contents with literal text cells.
    pub async fn seed(&self, sheet: &str, rows: Vec<Vec<&str>>) {
        let grid = rows
            .into_iter()
            .map(|row| row.into_iter().map(CellValue::from).collect())
            .collect();
        self.state.lock().await.sheets.insert(sheet.to_string(), grid);
    }

    /// Queues `times` failures for the next calls of `op`.
    pub async fn fail_next(&self, op: StoreOp, err: SyncError, times: usize) {
        let mut state = self.state.lock().await;
        let queue = state.failures.entry(op).or_default();
        for _ in 0..times {
            queue.push_back(Some(err.clone()));
        }
    }

    /// Lets the next `skip` calls of `op` through, then fails the one after.
    pub async fn fail_after(&self, op: StoreOp, skip: usize, err: SyncError) {
        let mut state = self.state.lock().await;
        let queue = state.failures.entry(op).or_default();
        queue.extend((0..skip).map(|_| None));
        queue.push_back(Some(err));
    }

    pub async fn calls(&self, op: StoreOp) -> usize {
        self.state.lock().await.calls.get(&op).copied().unwrap_or(0)
    }

    pub async fn writes(&self) -> Vec<WriteRecord> {
        self.state.lock().await.writes.clone()
    }

    pub async fn formatted_headers(&self) -> Vec<String> {
        self.state.lock().await.formatted.clone()
    }

    /// Full rendered grid of a sheet, `None` if the sheet does not exist.
    pub async fn snapshot(&self, sheet: &str) -> Option<Vec<Vec<String>>> {
        let state = self.state.lock().await;
        state.sheets.get(sheet).map(|grid| {
            grid.iter()
                .map(|row| row.iter().map(CellValue::render).collect())
                .collect()
        })
    }

    /// Raw cells of one 1-based row.
    pub async fn row(&self, sheet: &str, row: u32) -> Option<Vec<CellValue>> {
        let state = self.state.lock().await;
        state
            .sheets
            .get(sheet)
            .and_then(|grid| grid.get(row.saturating_sub(1) as usize))
            .cloned()
    }

    fn enter(state: &mut MemoryState, op: StoreOp) -> Result<(), SyncError> {
        *state.calls.entry(op).or_default() += 1;
        if let Some(Some(err)) = state.failures.get_mut(&op).and_then(|q| q.pop_front()) {
            return Err(err);
        }
        Ok(())
    }

    fn sheet<'a>(
        state: &'a MemoryState,
        name: &str,
    ) -> Result<&'a Vec<Vec<CellValue>>, SyncError> {
        state
            .sheets
            .get(name)
            .ok_or_else(|| SyncError::rejected("read range", format!("unable to parse range: {name}")))
    }

    fn sheet_mut<'a>(
        state: &'a mut MemoryState,
        name: &str,
    ) -> Result<&'a mut Vec<Vec<CellValue>>, SyncError> {
        state
            .sheets
            .get_mut(name)
            .ok_or_else(|| SyncError::rejected("write range", format!("unable to parse range: {name}")))
    }
}

fn interpret(cell: &CellValue, mode: ValueInputMode) -> CellValue {
    match (mode, cell) {
        (ValueInputMode::Interpreted, CellValue::Text(text)) => {
            if let Ok(value) = text.trim().parse::<i64>() {
                CellValue::Integer(value)
            } else if let Ok(value) = text.trim().parse::<f64>() {
                CellValue::Number(value)
            } else {
                cell.clone()
            }
        }
        _ => cell.clone(),
    }
}

fn cell_at(grid: &[Vec<CellValue>], row: usize, col: usize) -> String {
    grid.get(row)
        .and_then(|r| r.get(col))
        .map(CellValue::render)
        .unwrap_or_default()
}

fn row_is_blank(grid: &[Vec<CellValue>], row: usize, span: ColumnSpan) -> bool {
    (span.first..=span.last).all(|col| cell_at(grid, row, col as usize).trim().is_empty())
}

fn write_cells(grid: &mut Vec<Vec<CellValue>>, row: usize, first_col: usize, cells: &[CellValue]) {
    if grid.len() <= row {
        grid.resize_with(row + 1, Vec::new);
    }
    let target = &mut grid[row];
    let needed = first_col + cells.len();
    if target.len() < needed {
        target.resize(needed, CellValue::from(""));
    }
    for (offset, cell) in cells.iter().enumerate() {
        target[first_col + offset] = cell.clone();
    }
}

#[async_trait]
impl DocumentStore for MemoryDocumentStore {
    fn spreadsheet_id(&self) -> &str {
        &self.spreadsheet_id
    }

    async fn get_column(&self, sheet: &str, column: u32) -> Result<Vec<String>, SyncError> {
        let mut state = self.state.lock().await;
        Self::enter(&mut state, StoreOp::GetColumn)?;
        let grid = Self::sheet(&state, sheet)?;
        let mut values = (0..grid.len())
            .map(|row| cell_at(grid, row, column as usize))
            .collect::<Vec<_>>();
        while values.last().is_some_and(|v| v.trim().is_empty()) {
            values.pop();
        }
        Ok(values)
    }

    async fn get_range(&self, address: &SheetAddress) -> Result<Vec<Vec<String>>, SyncError> {
        let mut state = self.state.lock().await;
        Self::enter(&mut state, StoreOp::GetRange)?;
        let grid = Self::sheet(&state, &address.sheet)?;
        let rows: Vec<usize> = match address.row {
            Some(row) => vec![row.saturating_sub(1) as usize],
            None => (0..grid.len()).collect(),
        };
        let mut out = rows
            .into_iter()
            .map(|row| {
                let mut cells = (address.columns.first..=address.columns.last)
                    .map(|col| cell_at(grid, row, col as usize))
                    .collect::<Vec<_>>();
                while cells.last().is_some_and(|c| c.is_empty()) {
                    cells.pop();
                }
                cells
            })
            .collect::<Vec<_>>();
        while out.last().is_some_and(|r| r.is_empty()) {
            out.pop();
        }
        Ok(out)
    }

    async fn update_range(
        &self,
        address: &SheetAddress,
        rows: &[SheetRow],
        mode: ValueInputMode,
    ) -> Result<(), SyncError> {
        let mut state = self.state.lock().await;
        Self::enter(&mut state, StoreOp::Update)?;
        let Some(start) = address.row else {
            return Err(SyncError::rejected("update range", "update requires a row address"));
        };
        let grid = Self::sheet_mut(&mut state, &address.sheet)?;
        for (offset, row) in rows.iter().enumerate() {
            let cells = row.cells().iter().map(|c| interpret(c, mode)).collect::<Vec<_>>();
            write_cells(
                grid,
                start.saturating_sub(1) as usize + offset,
                address.columns.first as usize,
                &cells,
            );
        }
        state.writes.push(WriteRecord {
            op: StoreOp::Update,
            address: address.a1(),
            rows: rows.to_vec(),
            mode: Some(mode),
        });
        Ok(())
    }

    async fn append_rows(
        &self,
        address: &SheetAddress,
        rows: &[SheetRow],
        mode: ValueInputMode,
    ) -> Result<(), SyncError> {
        let mut state = self.state.lock().await;
        Self::enter(&mut state, StoreOp::Append)?;
        let grid = Self::sheet_mut(&mut state, &address.sheet)?;
        let mut next = grid.len();
        while next > 0 && row_is_blank(grid, next - 1, address.columns) {
            next -= 1;
        }
        for (offset, row) in rows.iter().enumerate() {
            let cells = row.cells().iter().map(|c| interpret(c, mode)).collect::<Vec<_>>();
            write_cells(grid, next + offset, address.columns.first as usize, &cells);
        }
        state.writes.push(WriteRecord {
            op: StoreOp::Append,
            address: address.a1(),
            rows: rows.to_vec(),
            mode: Some(mode),
        });
        Ok(())
    }

    async fn clear_range(&self, address: &SheetAddress) -> Result<(), SyncError> {
        let mut state = self.state.lock().await;
        Self::enter(&mut state, StoreOp::Clear)?;
        let grid = Self::sheet_mut(&mut state, &address.sheet)?;
        let rows: Vec<usize> = match address.row {
            Some(row) => vec![row.saturating_sub(1) as usize],
            None => (0..grid.len()).collect(),
        };
        for row in rows {
            if let Some(cells) = grid.get_mut(row) {
                for col in address.columns.first..=address.columns.last {
                    if let Some(cell) = cells.get_mut(col as usize) {
                        *cell = CellValue::from("");
                    }
                }
            }
        }
        state.writes.push(WriteRecord {
            op: StoreOp::Clear,
            address: address.a1(),
            rows: Vec::new(),
            mode: None,
        });
        Ok(())
    }

    async fn ensure_sheet_exists(&self, sheet: &str) -> Result<bool, SyncError> {
        let mut state = self.state.lock().await;
        Self::enter(&mut state, StoreOp::EnsureSheet)?;
        if state.sheets.contains_key(sheet) {
            return Ok(false);
        }
        state.sheets.insert(sheet.to_string(), Vec::new());
        Ok(true)
    }

    async fn list_sheets(&self) -> Result<Vec<String>, SyncError> {
        let mut state = self.state.lock().await;
        Self::enter(&mut state, StoreOp::ListSheets)?;
        Ok(state.sheets.keys().cloned().collect())
    }

    async fn format_header_row(&self, sheet: &str, _columns: ColumnSpan) -> Result<(), SyncError> {
        let mut state = self.state.lock().await;
        Self::enter(&mut state, StoreOp::FormatHeader)?;
        Self::sheet(&state, sheet)?;
        state.formatted.push(sheet.to_string());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn span(first: &str, last: &str) -> ColumnSpan {
        ColumnSpan::letters(first, last).unwrap()
    }

    #[tokio::test]
    async fn append_lands_after_last_non_blank_row() {
        let store = MemoryDocumentStore::new("sheet-1");
        store
            .seed("dataset", vec![vec!["date", "new"], vec!["2025-09-01", "1"]])
            .await;

        let row = SheetRow::new(vec!["2025-09-02".into(), 4u64.into()]);
        store
            .append_rows(&SheetAddress::columns("dataset", span("A", "B")), &[row], ValueInputMode::Raw)
            .await
            .unwrap();

        let grid = store.snapshot("dataset").await.unwrap();
        assert_eq!(grid.len(), 3);
        assert_eq!(grid[2], vec!["2025-09-02", "4"]);
        assert_eq!(
            store.get_column("dataset", 0).await.unwrap(),
            vec!["date", "2025-09-01", "2025-09-02"]
        );
    }

    #[tokio::test]
    async fn interpreted_mode_stores_numbers() {
        let store = MemoryDocumentStore::new("sheet-1");
        store.ensure_sheet_exists("25.08").await.unwrap();
        let row = SheetRow::new(vec!["12".into(), "abc".into()]);
        store
            .update_range(&SheetAddress::row("25.08", 5, span("C", "D")), &[row], ValueInputMode::Interpreted)
            .await
            .unwrap();
        let cells = store.row("25.08", 5).await.unwrap();
        assert_eq!(cells[2], CellValue::Integer(12));
        assert_eq!(cells[3], CellValue::Text("abc".into()));
    }

    #[tokio::test]
    async fn scripted_failures_are_consumed_in_order() {
        let store = MemoryDocumentStore::new("sheet-1");
        store.seed("dataset", vec![vec!["date"]]).await;
        store
            .fail_next(StoreOp::GetColumn, SyncError::transient("read", "503"), 1)
            .await;
        assert!(store.get_column("dataset", 0).await.is_err());
        assert!(store.get_column("dataset", 0).await.is_ok());
        assert_eq!(store.calls(StoreOp::GetColumn).await, 2);
    }

    #[tokio::test]
    async fn ensure_sheet_reports_creation_once() {
        let store = MemoryDocumentStore::new("sheet-1");
        assert!(store.ensure_sheet_exists("dataset3").await.unwrap());
        assert!(!store.ensure_sheet_exists("dataset3").await.unwrap());
        assert_eq!(store.list_sheets().await.unwrap(), vec!["dataset3"]);
    }

    #[tokio::test]
    async fn delayed_failure_hits_the_later_call() {
        let store = MemoryDocumentStore::new("sheet-1");
        store.seed("dataset", vec![vec!["date"]]).await;
        store
            .fail_after(StoreOp::GetColumn, 2, SyncError::transient("read", "503"))
            .await;
        assert!(store.get_column("dataset", 0).await.is_ok());
        assert!(store.get_column("dataset", 0).await.is_ok());
        assert!(store.get_column("dataset", 0).await.is_err());
        assert!(store.get_column("dataset", 0).await.is_ok());
    }

    #[tokio::test]
    async fn missing_sheet_is_rejected() {
        let store = MemoryDocumentStore::new("sheet-1");
        let err = store.get_column("nope", 0).await.unwrap_err();
        assert!(!err.is_retryable());
    }
}
