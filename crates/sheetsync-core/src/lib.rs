//! Core domain model for the metrics-to-sheet sync.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const CRATE_NAME: &str = "sheetsync-core";

/// Calendar-day key (`YYYY-MM-DD`) identifying one row per logical metric set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct DateKey(NaiveDate);

impl DateKey {
    pub const FORMAT: &'static str = "%Y-%m-%d";

    /// Strict parse: exactly ten characters, zero-padded, and a real calendar day.
    pub fn parse(input: &str) -> Result<Self, SyncError> {
        let trimmed = input.trim();
        if trimmed.len() != 10 {
            return Err(SyncError::InvalidDateKey(input.to_string()));
        }
        let date = NaiveDate::parse_from_str(trimmed, Self::FORMAT)
            .map_err(|_| SyncError::InvalidDateKey(input.to_string()))?;
        if date.format(Self::FORMAT).to_string() != trimmed {
            return Err(SyncError::InvalidDateKey(input.to_string()));
        }
        Ok(Self(date))
    }

    pub fn from_date(date: NaiveDate) -> Self {
        Self(date)
    }

    pub fn date(&self) -> NaiveDate {
        self.0
    }

    pub fn day_of_month(&self) -> u32 {
        chrono::Datelike::day(&self.0)
    }

    pub fn succ(&self) -> Option<Self> {
        self.0.succ_opt().map(Self)
    }

    pub fn pred(&self) -> Option<Self> {
        self.0.pred_opt().map(Self)
    }

    /// Formats the key with a chrono format string, e.g. `%y.%m` for monthly sheet names.
    pub fn format(&self, fmt: &str) -> String {
        self.0.format(fmt).to_string()
    }
}

impl fmt::Display for DateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.format(Self::FORMAT))
    }
}

impl FromStr for DateKey {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for DateKey {
    type Error = SyncError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<DateKey> for String {
    fn from(value: DateKey) -> Self {
        value.to_string()
    }
}

/// Longest range a single sweep may cover.
pub const MAX_SWEEP_DAYS: usize = 366;

/// Inclusive calendar-day range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DateRange {
    pub start: DateKey,
    pub end: DateKey,
}

impl DateRange {
    pub fn new(start: DateKey, end: DateKey) -> Result<Self, SyncError> {
        if start > end {
            return Err(SyncError::InvalidRange { start, end });
        }
        Ok(Self { start, end })
    }

    pub fn single(date: DateKey) -> Self {
        Self { start: date, end: date }
    }

    /// Like [`DateRange::new`], but rejects ranges longer than [`MAX_SWEEP_DAYS`].
    pub fn for_sweep(start: DateKey, end: DateKey) -> Result<Self, SyncError> {
        let range = Self::new(start, end)?;
        if range.len() > MAX_SWEEP_DAYS {
            return Err(SyncError::InvalidInput(format!(
                "{start}..{end} covers {} days; a sweep covers at most {MAX_SWEEP_DAYS}",
                range.len()
            )));
        }
        Ok(range)
    }

    pub fn len(&self) -> usize {
        (self.end.date() - self.start.date()).num_days() as usize + 1
    }

    pub fn is_empty(&self) -> bool {
        false
    }

    /// Every day in the range, ascending.
    pub fn days(&self) -> impl Iterator<Item = DateKey> {
        let start = self.start.date();
        let count = self.len() as i64;
        (0..count).map(move |offset| DateKey(start + Duration::days(offset)))
    }
}

/// Daily integration metrics. Absent source rows are represented by [`DailyMetrics::default`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DailyMetrics {
    pub total_integrated_users: u64,
    pub new_integrated_users: u64,
    pub converted_integrated_users: u64,
    pub physical_card_requests: u64,
    pub online_auto_issued_cards: u64,
}

impl DailyMetrics {
    /// The four values mirrored into sheets, in column order.
    pub fn sheet_values(&self) -> [u64; 4] {
        [
            self.new_integrated_users,
            self.converted_integrated_users,
            self.physical_card_requests,
            self.online_auto_issued_cards,
        ]
    }
}

/// Charging and mileage amounts for one day.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct MileageStats {
    pub total_pc: f64,
    pub used_point: f64,
    pub use_card_price: f64,
    pub paid_price: f64,
    pub served_mileage: f64,
    pub charging_count: u64,
    pub elctc_pc_ratio: f64,
    pub paid_price_ratio: f64,
    pub point_success_count: u64,
    pub point_other_status_count: u64,
    pub avg_price: f64,
    pub avg_paid_price: f64,
    pub avg_mileage: f64,
    pub charging_qy: f64,
}

/// Mileage statistics for one membership grade on one day.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GradeStats {
    pub grade_name: String,
    pub charging_count: u64,
    pub avg_pc: f64,
    pub avg_paid_price: f64,
    pub avg_mileage: f64,
}

/// Everything fetched from the metrics source for one date key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DailySnapshot {
    pub date: DateKey,
    pub metrics: DailyMetrics,
    pub mileage: MileageStats,
    pub grades: Vec<GradeStats>,
    pub registrations: u64,
}

impl DailySnapshot {
    pub fn empty(date: DateKey) -> Self {
        Self {
            date,
            metrics: DailyMetrics::default(),
            mileage: MileageStats::default(),
            grades: Vec::new(),
            registrations: 0,
        }
    }
}

/// One cell written to the document store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CellValue {
    Integer(i64),
    Number(f64),
    Text(String),
}

impl CellValue {
    pub fn is_blank(&self) -> bool {
        matches!(self, CellValue::Text(text) if text.trim().is_empty())
    }

    pub fn render(&self) -> String {
        match self {
            CellValue::Integer(value) => value.to_string(),
            CellValue::Number(value) => value.to_string(),
            CellValue::Text(text) => text.clone(),
        }
    }
}

impl From<&str> for CellValue {
    fn from(value: &str) -> Self {
        CellValue::Text(value.to_string())
    }
}

impl From<String> for CellValue {
    fn from(value: String) -> Self {
        CellValue::Text(value)
    }
}

impl From<u64> for CellValue {
    fn from(value: u64) -> Self {
        CellValue::Integer(i64::try_from(value).unwrap_or(i64::MAX))
    }
}

impl From<f64> for CellValue {
    fn from(value: f64) -> Self {
        CellValue::Number(value)
    }
}

impl From<DateKey> for CellValue {
    fn from(value: DateKey) -> Self {
        CellValue::Text(value.to_string())
    }
}

/// Ordered cells written to one contiguous range of one sheet.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SheetRow(pub Vec<CellValue>);

impl SheetRow {
    pub fn new(cells: Vec<CellValue>) -> Self {
        Self(cells)
    }

    pub fn cells(&self) -> &[CellValue] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn rendered(&self) -> Vec<String> {
        self.0.iter().map(CellValue::render).collect()
    }
}

/// Converts a zero-based column index into sheet letters (`0 -> A`, `26 -> AA`).
pub fn column_letter(index: u32) -> String {
    let mut n = index + 1;
    let mut letters = Vec::new();
    while n > 0 {
        let rem = (n - 1) % 26;
        letters.push((b'A' + rem as u8) as char);
        n = (n - 1) / 26;
    }
    letters.iter().rev().collect()
}

/// Inverse of [`column_letter`].
pub fn column_index(letters: &str) -> Option<u32> {
    if letters.is_empty() {
        return None;
    }
    let mut n: u32 = 0;
    for c in letters.chars() {
        if !c.is_ascii_alphabetic() {
            return None;
        }
        let digit = (c.to_ascii_uppercase() as u8 - b'A') as u32 + 1;
        n = n.checked_mul(26)?.checked_add(digit)?;
    }
    Some(n - 1)
}

/// Inclusive zero-based column span.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnSpan {
    pub first: u32,
    pub last: u32,
}

impl ColumnSpan {
    pub fn new(first: u32, last: u32) -> Self {
        Self {
            first: first.min(last),
            last: first.max(last),
        }
    }

    pub fn letters(first: &str, last: &str) -> Result<Self, SyncError> {
        let f = column_index(first)
            .ok_or_else(|| SyncError::InvalidInput(format!("bad column `{first}`")))?;
        let l = column_index(last)
            .ok_or_else(|| SyncError::InvalidInput(format!("bad column `{last}`")))?;
        Ok(Self::new(f, l))
    }

    pub fn width(&self) -> usize {
        (self.last - self.first + 1) as usize
    }
}

/// Quotes a sheet title for A1 notation, doubling embedded quotes.
pub fn quote_sheet_name(name: &str) -> String {
    format!("'{}'", name.replace('\'', "''"))
}

/// A (sheet, rows, columns) address rendered to A1 notation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SheetAddress {
    pub sheet: String,
    /// 1-based row; `None` addresses whole columns.
    pub row: Option<u32>,
    pub columns: ColumnSpan,
}

impl SheetAddress {
    pub fn row(sheet: impl Into<String>, row: u32, columns: ColumnSpan) -> Self {
        Self {
            sheet: sheet.into(),
            row: Some(row),
            columns,
        }
    }

    pub fn columns(sheet: impl Into<String>, columns: ColumnSpan) -> Self {
        Self {
            sheet: sheet.into(),
            row: None,
            columns,
        }
    }

    pub fn a1(&self) -> String {
        let first = column_letter(self.columns.first);
        let last = column_letter(self.columns.last);
        let sheet = quote_sheet_name(&self.sheet);
        match self.row {
            Some(row) => format!("{sheet}!{first}{row}:{last}{row}"),
            None => format!("{sheet}!{first}:{last}"),
        }
    }
}

impl fmt::Display for SheetAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.a1())
    }
}

/// Per-sheet freshness policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum UpdatePolicy {
    AlwaysOverwrite,
    WriteOnceUnlessToday,
    AppendOnly,
}

/// Whether the store keeps written values as literal text or interprets them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ValueInputMode {
    Raw,
    Interpreted,
}

impl ValueInputMode {
    pub fn as_api_str(&self) -> &'static str {
        match self {
            ValueInputMode::Raw => "RAW",
            ValueInputMode::Interpreted => "USER_ENTERED",
        }
    }
}

/// Result of applying one date key to one sheet (or, folded, to all sheets).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Outcome {
    Written,
    SkippedDuplicate,
    SkippedExisting,
    Failed { reason: String },
}

impl Outcome {
    pub fn failed(reason: impl fmt::Display) -> Self {
        Outcome::Failed {
            reason: reason.to_string(),
        }
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, Outcome::Failed { .. })
    }

    pub fn is_skipped(&self) -> bool {
        matches!(self, Outcome::SkippedDuplicate | Outcome::SkippedExisting)
    }

    /// Folds per-sheet outcomes into one outcome for the date.
    ///
    /// Any failure wins (first reason kept), then any write, then duplicate skips.
    pub fn fold<I: IntoIterator<Item = Outcome>>(outcomes: I) -> Outcome {
        let mut written = false;
        let mut duplicate = false;
        for outcome in outcomes {
            match outcome {
                Outcome::Failed { .. } => return outcome,
                Outcome::Written => written = true,
                Outcome::SkippedDuplicate => duplicate = true,
                Outcome::SkippedExisting => {}
            }
        }
        if written {
            Outcome::Written
        } else if duplicate {
            Outcome::SkippedDuplicate
        } else {
            Outcome::SkippedExisting
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SheetOutcome {
    pub sheet: String,
    pub outcome: Outcome,
}

/// Outcome of syncing a single date key into every target sheet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DateReport {
    pub date: DateKey,
    pub outcome: Outcome,
    pub sheets: Vec<SheetOutcome>,
}

impl DateReport {
    pub fn from_sheets(date: DateKey, sheets: Vec<SheetOutcome>) -> Self {
        let outcome = Outcome::fold(sheets.iter().map(|s| s.outcome.clone()));
        Self {
            date,
            outcome,
            sheets,
        }
    }

    pub fn failed(date: DateKey, reason: impl fmt::Display) -> Self {
        Self {
            date,
            outcome: Outcome::failed(reason),
            sheets: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Completed,
    PartiallyFailed,
    Failed,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SweepCounts {
    pub written: usize,
    pub skipped: usize,
    pub failed: usize,
}

/// Ordered (date, outcome) entries for every day of a swept range.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub range: DateRange,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub entries: Vec<DateReport>,
}

impl SweepReport {
    pub fn counts(&self) -> SweepCounts {
        let mut counts = SweepCounts::default();
        for entry in &self.entries {
            match &entry.outcome {
                Outcome::Written => counts.written += 1,
                Outcome::SkippedDuplicate | Outcome::SkippedExisting => counts.skipped += 1,
                Outcome::Failed { .. } => counts.failed += 1,
            }
        }
        counts
    }

    pub fn status(&self) -> RunStatus {
        let counts = self.counts();
        if counts.failed == 0 {
            RunStatus::Completed
        } else if counts.failed == self.entries.len() {
            RunStatus::Failed
        } else {
            RunStatus::PartiallyFailed
        }
    }

    pub fn outcomes(&self) -> Vec<(DateKey, Outcome)> {
        self.entries
            .iter()
            .map(|e| (e.date, e.outcome.clone()))
            .collect()
    }
}

/// Coarse error taxonomy driving retry and propagation decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    Transient,
    PermanentInput,
    FatalAfterRetry,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SyncError {
    #[error("invalid date key `{0}`: expected YYYY-MM-DD")]
    InvalidDateKey(String),
    #[error("invalid date range: {start} is after {end}")]
    InvalidRange { start: DateKey, end: DateKey },
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("{0} is not configured")]
    NotConfigured(String),
    #[error("{operation} failed: {message}")]
    Transient { operation: String, message: String },
    #[error("{operation} rejected: {message}")]
    Rejected { operation: String, message: String },
    #[error("{operation} failed after {attempts} attempts: {message}")]
    RetriesExhausted {
        operation: String,
        attempts: u32,
        message: String,
    },
}

impl SyncError {
    pub fn transient(operation: impl Into<String>, message: impl fmt::Display) -> Self {
        SyncError::Transient {
            operation: operation.into(),
            message: message.to_string(),
        }
    }

    pub fn rejected(operation: impl Into<String>, message: impl fmt::Display) -> Self {
        SyncError::Rejected {
            operation: operation.into(),
            message: message.to_string(),
        }
    }

    pub fn class(&self) -> ErrorClass {
        match self {
            SyncError::Transient { .. } => ErrorClass::Transient,
            SyncError::RetriesExhausted { .. } => ErrorClass::FatalAfterRetry,
            SyncError::InvalidDateKey(_)
            | SyncError::InvalidRange { .. }
            | SyncError::InvalidInput(_)
            | SyncError::NotConfigured(_)
            | SyncError::Rejected { .. } => ErrorClass::PermanentInput,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.class() == ErrorClass::Transient
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(s: &str) -> DateKey {
        DateKey::parse(s).unwrap()
    }

    #[test]
    fn date_key_parse_is_strict() {
        assert_eq!(key("2025-09-15").to_string(), "2025-09-15");
        assert!(DateKey::parse("2025-9-15").is_err());
        assert!(DateKey::parse("2025-02-30").is_err());
        assert!(DateKey::parse("15/09/2025").is_err());
        assert!(matches!(
            DateKey::parse("nope"),
            Err(SyncError::InvalidDateKey(_))
        ));
    }

    #[test]
    fn range_days_are_inclusive_and_ascending() {
        let range = DateRange::new(key("2025-08-30"), key("2025-09-02")).unwrap();
        let days = range.days().map(|d| d.to_string()).collect::<Vec<_>>();
        assert_eq!(days, vec!["2025-08-30", "2025-08-31", "2025-09-01", "2025-09-02"]);
        assert_eq!(range.len(), 4);
        assert!(DateRange::new(key("2025-09-02"), key("2025-09-01")).is_err());
    }

    #[test]
    fn sweep_ranges_are_capped() {
        assert_eq!(DateRange::for_sweep(key("2024-01-01"), key("2024-12-31")).unwrap().len(), 366);
        let err = DateRange::for_sweep(key("2024-01-01"), key("2025-01-01")).unwrap_err();
        assert_eq!(err.class(), ErrorClass::PermanentInput);
        assert!(matches!(
            DateRange::for_sweep(key("2025-09-02"), key("2025-09-01")),
            Err(SyncError::InvalidRange { .. })
        ));
    }

    #[test]
    fn a1_notation_quotes_sheet_names() {
        let span = ColumnSpan::letters("C", "F").unwrap();
        assert_eq!(SheetAddress::row("25.08", 19, span).a1(), "'25.08'!C19:F19");
        assert_eq!(
            SheetAddress::columns("it's", ColumnSpan::new(0, 0)).a1(),
            "'it''s'!A:A"
        );
        assert_eq!(column_letter(15), "P");
        assert_eq!(column_letter(26), "AA");
        assert_eq!(column_index("AA"), Some(26));
    }

    #[test]
    fn outcome_fold_prefers_failure_then_write() {
        let failed = Outcome::fold(vec![
            Outcome::Written,
            Outcome::failed("boom"),
            Outcome::failed("later"),
        ]);
        assert_eq!(failed, Outcome::failed("boom"));
        assert_eq!(
            Outcome::fold(vec![Outcome::SkippedExisting, Outcome::Written]),
            Outcome::Written
        );
        assert_eq!(
            Outcome::fold(vec![Outcome::SkippedExisting, Outcome::SkippedDuplicate]),
            Outcome::SkippedDuplicate
        );
    }

    #[test]
    fn error_classes_drive_retry() {
        assert!(SyncError::transient("read", "timeout").is_retryable());
        assert!(!SyncError::InvalidDateKey("x".into()).is_retryable());
        assert_eq!(
            SyncError::NotConfigured("GOOGLE_SPREADSHEET_ID".into()).class(),
            ErrorClass::PermanentInput
        );
    }

    #[test]
    fn outcome_serializes_with_status_tag() {
        let json = serde_json::to_value(Outcome::failed("db down")).unwrap();
        assert_eq!(json, serde_json::json!({"status": "failed", "reason": "db down"}));
    }
}
