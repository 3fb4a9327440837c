//! Target-sheet catalogue: where each date key lands and what its row looks like.

use std::path::Path;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use sheetsync_core::{
    CellValue, ColumnSpan, DailySnapshot, DateKey, SheetAddress, SheetRow, UpdatePolicy,
    ValueInputMode,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpreadsheetRole {
    Primary,
    Secondary,
}

/// Which part of a [`DailySnapshot`] feeds a sheet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RowSource {
    /// `[date, new, converted, physical, online, updated_at]`
    DailyMetrics,
    /// `[new, converted, physical, online]`, no date or timestamp cells.
    MonthlyMetrics,
    /// `[date, 14 mileage figures, updated_at]`
    Mileage,
    /// `[date, grade, count, avg_pc, avg_paid, avg_mileage]` per grade.
    GradeStats,
    /// `[date, registrations, updated_at]`
    Registrations,
}

impl RowSource {
    pub fn width(&self) -> usize {
        match self {
            RowSource::DailyMetrics => 6,
            RowSource::MonthlyMetrics => 4,
            RowSource::Mileage => 16,
            RowSource::GradeStats => 6,
            RowSource::Registrations => 3,
        }
    }

    fn carries_date_key(&self) -> bool {
        !matches!(self, RowSource::MonthlyMetrics)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Placement {
    /// Row found by scanning the date-key column (first column of the span).
    Scanned,
    /// Like `Scanned`, but a row is keyed by the date together with the category
    /// in the next column, so one date holds one row per category.
    Grouped,
    /// One sheet per month named by `name_format`; row = day-of-month + `row_offset`.
    Monthly { name_format: String, row_offset: u32 },
}

mod span_letters {
    use serde::de::Error as _;
    use serde::{Deserialize, Deserializer, Serializer};
    use sheetsync_core::{column_letter, ColumnSpan};

    pub fn serialize<S: Serializer>(span: &ColumnSpan, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&format!("{}:{}", column_letter(span.first), column_letter(span.last)))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<ColumnSpan, D::Error> {
        let text = String::deserialize(d)?;
        let (first, last) = text
            .split_once(':')
            .ok_or_else(|| D::Error::custom(format!("expected `A:F` style span, got `{text}`")))?;
        ColumnSpan::letters(first.trim(), last.trim()).map_err(D::Error::custom)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TargetSheet {
    pub name: String,
    pub spreadsheet: SpreadsheetRole,
    pub source: RowSource,
    pub placement: Placement,
    #[serde(with = "span_letters")]
    pub columns: ColumnSpan,
    pub mode: ValueInputMode,
    pub policy: UpdatePolicy,
    #[serde(default)]
    pub header: Vec<String>,
    #[serde(default)]
    pub format_header: bool,
    #[serde(default)]
    pub create_if_missing: bool,
}

impl TargetSheet {
    /// Concrete sheet title for a date (monthly sheets resolve to e.g. `25.08`).
    pub fn sheet_name_for(&self, date: DateKey) -> String {
        match &self.placement {
            Placement::Scanned | Placement::Grouped => self.name.clone(),
            Placement::Monthly { name_format, .. } => date.format(name_format),
        }
    }

    pub fn is_monthly(&self) -> bool {
        matches!(self.placement, Placement::Monthly { .. })
    }

    pub fn is_grouped(&self) -> bool {
        matches!(self.placement, Placement::Grouped)
    }

    /// Whether the sheet keeps at most one row per key (date, or date and category).
    pub fn is_keyed(&self) -> bool {
        self.policy != UpdatePolicy::AppendOnly && !self.is_monthly()
    }

    /// Leading columns that identify a row.
    fn key_width(&self) -> u32 {
        match self.placement {
            Placement::Grouped => 2,
            Placement::Scanned if self.source.carries_date_key() => 1,
            _ => 0,
        }
    }

    pub fn full_span(&self) -> SheetAddress {
        SheetAddress::columns(self.name.clone(), self.columns)
    }

    pub fn row_address(&self, sheet: &str, row: u32) -> SheetAddress {
        SheetAddress::row(sheet, row, self.columns)
    }

    /// Columns holding data rather than the row key.
    pub fn data_columns(&self) -> ColumnSpan {
        let key = self.key_width();
        if key > 0 && self.columns.width() > key as usize {
            ColumnSpan::new(self.columns.first + key, self.columns.last)
        } else {
            self.columns
        }
    }

    pub fn header_row(&self) -> SheetRow {
        SheetRow::new(self.header.iter().map(|h| CellValue::from(h.as_str())).collect())
    }

    /// Rows this sheet receives for a snapshot; empty when there is nothing to write.
    pub fn build_rows(&self, snapshot: &DailySnapshot, stamp: &str) -> Vec<SheetRow> {
        let date = CellValue::from(snapshot.date);
        let stamp = CellValue::from(stamp);
        let m = &snapshot.metrics;
        match self.source {
            RowSource::DailyMetrics => {
                let mut cells = vec![date];
                cells.extend(m.sheet_values().into_iter().map(CellValue::from));
                cells.push(stamp);
                vec![SheetRow::new(cells)]
            }
            RowSource::MonthlyMetrics => vec![SheetRow::new(
                m.sheet_values().into_iter().map(CellValue::from).collect(),
            )],
            RowSource::Mileage => {
                let s = &snapshot.mileage;
                vec![SheetRow::new(vec![
                    date,
                    s.total_pc.into(),
                    s.used_point.into(),
                    s.use_card_price.into(),
                    s.paid_price.into(),
                    s.served_mileage.into(),
                    s.charging_count.into(),
                    s.elctc_pc_ratio.into(),
                    s.paid_price_ratio.into(),
                    s.point_success_count.into(),
                    s.point_other_status_count.into(),
                    s.avg_price.into(),
                    s.avg_paid_price.into(),
                    s.avg_mileage.into(),
                    s.charging_qy.into(),
                    stamp,
                ])]
            }
            RowSource::GradeStats => snapshot
                .grades
                .iter()
                .map(|g| {
                    SheetRow::new(vec![
                        date.clone(),
                        g.grade_name.clone().into(),
                        g.charging_count.into(),
                        g.avg_pc.into(),
                        g.avg_paid_price.into(),
                        g.avg_mileage.into(),
                    ])
                })
                .collect(),
            RowSource::Registrations => vec![SheetRow::new(vec![
                date,
                snapshot.registrations.into(),
                stamp,
            ])],
        }
    }

    fn validate(&self) -> Result<()> {
        if self.columns.width() != self.source.width() {
            bail!(
                "sheet `{}`: {:?} rows are {} cells wide but the column span holds {}",
                self.name,
                self.source,
                self.source.width(),
                self.columns.width()
            );
        }
        if !self.header.is_empty() && self.header.len() != self.columns.width() {
            bail!("sheet `{}`: header has {} labels for {} columns", self.name, self.header.len(), self.columns.width());
        }
        match (&self.placement, self.policy) {
            (Placement::Monthly { .. }, UpdatePolicy::AppendOnly) => {
                bail!("sheet `{}`: monthly sheets have fixed rows and cannot be append-only", self.name)
            }
            (Placement::Scanned | Placement::Grouped, _) if !self.source.carries_date_key() => {
                bail!("sheet `{}`: scanned sheets need a date key in their first column", self.name)
            }
            (Placement::Grouped, UpdatePolicy::AppendOnly) => {
                bail!("sheet `{}`: grouped sheets are keyed by date and category and cannot be append-only", self.name)
            }
            (Placement::Grouped, _) if self.columns.width() < 2 => {
                bail!("sheet `{}`: grouped sheets need a category column after the date", self.name)
            }
            (Placement::Monthly { name_format, .. }, _) if name_format.trim().is_empty() => {
                bail!("sheet `{}`: monthly name_format is empty", self.name)
            }
            _ => Ok(()),
        }
    }
}

fn labels(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SheetLayout {
    pub sheets: Vec<TargetSheet>,
}

impl Default for SheetLayout {
    fn default() -> Self {
        Self {
            sheets: vec![
                TargetSheet {
                    name: "dataset".into(),
                    spreadsheet: SpreadsheetRole::Primary,
                    source: RowSource::DailyMetrics,
                    placement: Placement::Scanned,
                    columns: ColumnSpan::new(0, 5),
                    mode: ValueInputMode::Raw,
                    policy: UpdatePolicy::AlwaysOverwrite,
                    header: labels(&["날짜", "통합 신규", "통합 전환", "실물 카드 신청", "온라인 카드 자동발급", "업데이트 시간"]),
                    format_header: true,
                    create_if_missing: false,
                },
                TargetSheet {
                    name: "monthly".into(),
                    spreadsheet: SpreadsheetRole::Primary,
                    source: RowSource::MonthlyMetrics,
                    placement: Placement::Monthly {
                        name_format: "%y.%m".into(),
                        row_offset: 4,
                    },
                    columns: ColumnSpan::new(2, 5),
                    mode: ValueInputMode::Interpreted,
                    policy: UpdatePolicy::WriteOnceUnlessToday,
                    header: Vec::new(),
                    format_header: false,
                    create_if_missing: false,
                },
                TargetSheet {
                    name: "dataset2".into(),
                    spreadsheet: SpreadsheetRole::Secondary,
                    source: RowSource::Mileage,
                    placement: Placement::Scanned,
                    columns: ColumnSpan::new(0, 15),
                    mode: ValueInputMode::Interpreted,
                    policy: UpdatePolicy::AlwaysOverwrite,
                    header: labels(&[
                        "날짜", "총 충전금액", "포인트 사용금액", "카드 사용금액", "실제 결제금액",
                        "서비스 마일리지", "충전 건수", "충전금 대비 마일리지 비율(%)",
                        "결제금 대비 마일리지 비율(%)", "포인트 성공 건수", "포인트 기타 상태 건수",
                        "평균 충전금액", "평균 결제금액", "평균 마일리지", "충전량", "업데이트 시간",
                    ]),
                    format_header: false,
                    create_if_missing: true,
                },
                TargetSheet {
                    name: "dataset3".into(),
                    spreadsheet: SpreadsheetRole::Secondary,
                    source: RowSource::GradeStats,
                    placement: Placement::Grouped,
                    columns: ColumnSpan::new(0, 5),
                    mode: ValueInputMode::Interpreted,
                    policy: UpdatePolicy::AlwaysOverwrite,
                    header: labels(&["날짜", "등급명", "충전 건수", "평균 충전금액", "평균 결제금액", "평균 마일리지"]),
                    format_header: false,
                    create_if_missing: true,
                },
                TargetSheet {
                    name: "dataset4".into(),
                    spreadsheet: SpreadsheetRole::Secondary,
                    source: RowSource::Registrations,
                    placement: Placement::Scanned,
                    columns: ColumnSpan::new(0, 2),
                    mode: ValueInputMode::Interpreted,
                    policy: UpdatePolicy::AlwaysOverwrite,
                    header: labels(&["날짜", "회원 등록 수", "업데이트 시간"]),
                    format_header: false,
                    create_if_missing: true,
                },
            ],
        }
    }
}

impl SheetLayout {
    pub fn from_yaml_str(text: &str) -> Result<Self> {
        let layout: Self = serde_yaml::from_str(text).context("parsing sheet layout")?;
        layout.validate()?;
        Ok(layout)
    }

    pub fn from_path(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        Self::from_yaml_str(&text).with_context(|| format!("loading {}", path.display()))
    }

    /// The file at `path` when given, otherwise the built-in catalogue.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::from_path(path),
            None => Ok(Self::default()),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.sheets.is_empty() {
            bail!("sheet layout lists no target sheets");
        }
        for (i, sheet) in self.sheets.iter().enumerate() {
            sheet.validate()?;
            if self.sheets[..i].iter().any(|other| other.name == sheet.name) {
                bail!("sheet `{}` is listed twice", sheet.name);
            }
        }
        Ok(())
    }

    pub fn find(&self, name: &str) -> Option<&TargetSheet> {
        self.sheets.iter().find(|s| s.name == name)
    }

    pub fn for_role(&self, role: SpreadsheetRole) -> impl Iterator<Item = &TargetSheet> {
        self.sheets.iter().filter(move |s| s.spreadsheet == role)
    }
}
