//! Metrics source contract + the PostgreSQL aggregate queries behind it.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, NaiveTime, TimeZone, Utc};
use chrono_tz::Tz;
use sheetsync_core::{
    DailyMetrics, DailySnapshot, DateKey, DateRange, GradeStats, MileageStats, SyncError,
};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Row};
use tracing::debug;

pub const CRATE_NAME: &str = "sheetsync-source";

/// Read-only access to the aggregate metrics for calendar days.
///
/// Implementations return zero records when the store has no rows for a day;
/// callers never apply defaults themselves.
#[async_trait]
pub trait MetricsSource: Send + Sync {
    async fn fetch_daily_metrics(&self, date: DateKey) -> Result<DailyMetrics, SyncError>;

    async fn fetch_period_totals(&self, range: DateRange) -> Result<DailyMetrics, SyncError>;

    async fn fetch_mileage_stats(&self, date: DateKey) -> Result<MileageStats, SyncError>;

    async fn fetch_grade_stats(&self, date: DateKey) -> Result<Vec<GradeStats>, SyncError>;

    async fn fetch_registration_count(&self, date: DateKey) -> Result<u64, SyncError>;

    /// One record per day of `range`, ascending.
    async fn fetch_range_metrics(
        &self,
        range: DateRange,
    ) -> Result<Vec<(DateKey, DailyMetrics)>, SyncError> {
        let mut out = Vec::with_capacity(range.len());
        for date in range.days() {
            out.push((date, self.fetch_daily_metrics(date).await?));
        }
        Ok(out)
    }

    /// Daily metrics plus, when `with_mileage` is set, the mileage/grade/registration
    /// figures that feed the secondary spreadsheet.
    async fn fetch_snapshot(
        &self,
        date: DateKey,
        with_mileage: bool,
    ) -> Result<DailySnapshot, SyncError> {
        let mut snapshot = DailySnapshot::empty(date);
        snapshot.metrics = self.fetch_daily_metrics(date).await?;
        if with_mileage {
            snapshot.mileage = self.fetch_mileage_stats(date).await?;
            snapshot.grades = self.fetch_grade_stats(date).await?;
            snapshot.registrations = self.fetch_registration_count(date).await?;
        }
        Ok(snapshot)
    }
}

/// UTC instants bounding the civil days of `range` in `tz`: `[start 00:00, day after end 00:00)`.
pub fn day_bounds_utc(tz: Tz, range: DateRange) -> Result<(DateTime<Utc>, DateTime<Utc>), SyncError> {
    let local_midnight = |date: chrono::NaiveDate| {
        tz.from_local_datetime(&date.and_time(NaiveTime::MIN))
            .earliest()
            .map(|dt| dt.with_timezone(&Utc))
            .ok_or_else(|| SyncError::InvalidInput(format!("no local midnight for {date} in {tz}")))
    };
    let after_end = range
        .end
        .succ()
        .ok_or_else(|| SyncError::InvalidInput(format!("{} has no following day", range.end)))?;
    Ok((local_midnight(range.start.date())?, local_midnight(after_end.date())?))
}

/// SQLSTATE classes a retry cannot fix: data exceptions, integrity violations,
/// bad credentials, and syntax or access rule violations.
pub fn is_permanent_sqlstate(code: &str) -> bool {
    ["22", "23", "28", "42"].iter().any(|class| code.starts_with(class))
}

/// Maps driver errors onto the sync taxonomy. Query shape and decoding problems are
/// permanent; everything else, including serialization failures and deadlocks, is transient.
pub fn sql_error(operation: &str, err: sqlx::Error) -> SyncError {
    match &err {
        sqlx::Error::Configuration(_) => SyncError::NotConfigured(format!("database ({err})")),
        sqlx::Error::RowNotFound
        | sqlx::Error::TypeNotFound { .. }
        | sqlx::Error::ColumnIndexOutOfBounds { .. }
        | sqlx::Error::ColumnNotFound(_)
        | sqlx::Error::ColumnDecode { .. }
        | sqlx::Error::Encode(_)
        | sqlx::Error::Decode(_) => SyncError::rejected(operation, err),
        sqlx::Error::Database(db) if db.code().is_some_and(|code| is_permanent_sqlstate(&code)) => {
            SyncError::rejected(operation, err)
        }
        _ => SyncError::transient(operation, err),
    }
}

const DAILY_METRICS_SQL: &str = r#"
SELECT
  (SELECT COUNT(DISTINCT uli.cloud_id)
     FROM user_login_info uli
    WHERE uli.ssbyp = '00'
      AND uli.reg_dt >= $1 AND uli.reg_dt < $2) AS total_integrated_users,
  (SELECT COUNT(DISTINCT u.cloud_id)
     FROM user_login_info uli
     JOIN users u ON uli.cloud_id = u.cloud_id
    WHERE uli.ssbyp = '00'
      AND u.reg_dt >= $3
      AND uli.reg_dt >= $1 AND uli.reg_dt < $2) AS new_integrated_users,
  (SELECT COUNT(DISTINCT u.cloud_id)
     FROM user_login_info uli
     JOIN users u ON uli.cloud_id = u.cloud_id
    WHERE uli.ssbyp = '00'
      AND u.reg_dt < $3
      AND uli.reg_dt >= $1 AND uli.reg_dt < $2) AS converted_integrated_users,
  (SELECT COUNT(*)
     FROM user_card_hist uch
    WHERE uch.actor = '회원실물카드신청'
      AND uch.reg_dt >= $1 AND uch.reg_dt < $2) AS physical_card_requests,
  (SELECT COUNT(DISTINCT uch.user_id)
     FROM user_card_hist uch
    WHERE uch.status = '발급완료'
      AND uch.card_ty = '온라인'
      AND uch.reg_dt >= $1 AND uch.reg_dt < $2) AS online_auto_issued_cards
"#;

const MILEAGE_STATS_SQL: &str = r#"
SELECT
  COALESCE(SUM(mce.elctc_pc), 0)::float8 AS total_pc,
  COALESCE(SUM(mce.paid_point_price), 0)::float8 AS used_point,
  COALESCE(SUM(mce.paid_card_price), 0)::float8 AS use_card_price,
  COALESCE(SUM(mce.paid_price), 0)::float8 AS paid_price,
  COALESCE(SUM(cmh.mileage), 0)::float8 AS served_mileage,
  COUNT(mce.id) AS charging_count,
  CASE WHEN SUM(mce.elctc_pc) > 0
       THEN ROUND(SUM(cmh.mileage)::numeric / SUM(mce.elctc_pc) * 100, 2)
       ELSE 0 END::float8 AS elctc_pc_ratio,
  CASE WHEN SUM(mce.paid_price) > 0
       THEN ROUND(SUM(cmh.mileage)::numeric / SUM(mce.paid_price) * 100, 2)
       ELSE 0 END::float8 AS paid_price_ratio,
  COUNT(CASE WHEN cmh.status = 'SUCCESS' THEN 1 END) AS point_success_count,
  COUNT(CASE WHEN cmh.status <> 'SUCCESS' THEN 1 END) AS point_other_status_count,
  CASE WHEN COUNT(mce.id) > 0
       THEN ROUND(SUM(mce.elctc_pc)::numeric / COUNT(mce.id), 2)
       ELSE 0 END::float8 AS avg_price,
  CASE WHEN COUNT(mce.id) > 0
       THEN ROUND(SUM(mce.paid_price)::numeric / COUNT(mce.id), 2)
       ELSE 0 END::float8 AS avg_paid_price,
  CASE WHEN COUNT(mce.id) > 0
       THEN ROUND(SUM(cmh.mileage)::numeric / COUNT(mce.id), 2)
       ELSE 0 END::float8 AS avg_mileage,
  COALESCE(SUM(mce.elctc_qy), 0)::float8 AS charging_qy
FROM mmny_chrgr_elctc mce
JOIN collect_mileage_history cmh ON cmh.elctc_id::integer = mce.id
WHERE mce.end_dt >= $1 AND mce.end_dt < $2
"#;

const GRADE_STATS_SQL: &str = r#"
SELECT
  COALESCE(cmh.grade_nm, 'Unknown') AS grade_nm,
  COUNT(cmh.id) AS charging_count,
  CASE WHEN COUNT(cmh.id) > 0
       THEN ROUND(SUM(mce.elctc_pc)::numeric / COUNT(cmh.id), 2)
       ELSE 0 END::float8 AS avg_pc,
  CASE WHEN COUNT(cmh.id) > 0
       THEN ROUND(SUM(mce.paid_price)::numeric / COUNT(cmh.id), 2)
       ELSE 0 END::float8 AS avg_paid_price,
  CASE WHEN COUNT(cmh.id) > 0
       THEN ROUND(SUM(cmh.mileage)::numeric / COUNT(cmh.id), 2)
       ELSE 0 END::float8 AS avg_mileage
FROM mmny_chrgr_elctc mce
JOIN collect_mileage_history cmh ON cmh.elctc_id::integer = mce.id
WHERE mce.end_dt >= $1 AND mce.end_dt < $2
GROUP BY COALESCE(cmh.grade_nm, 'Unknown')
ORDER BY grade_nm
"#;

const REGISTRATION_SQL: &str = r#"
SELECT COUNT(u.id) AS registration_count
  FROM users u
 WHERE u.reg_dt >= $1 AND u.reg_dt < $2
"#;

#[derive(Debug, Clone)]
pub struct PgSourceConfig {
    pub database_url: String,
    pub timezone: Tz,
    /// Accounts created at or after this instant count as "new", earlier ones as "converted".
    pub integration_cutoff: DateTime<Utc>,
    pub max_connections: u32,
    pub acquire_timeout: Duration,
}

/// PostgreSQL-backed metrics source over the fixed reporting schema.
#[derive(Debug, Clone)]
pub struct PgMetricsSource {
    pool: PgPool,
    timezone: Tz,
    integration_cutoff: DateTime<Utc>,
}

fn count(row: &PgRow, column: &str) -> Result<u64, SyncError> {
    let value: Option<i64> = row
        .try_get(column)
        .map_err(|err| sql_error("decode metrics row", err))?;
    Ok(value.unwrap_or(0).max(0) as u64)
}

fn amount(row: &PgRow, column: &str) -> Result<f64, SyncError> {
    let value: Option<f64> = row
        .try_get(column)
        .map_err(|err| sql_error("decode metrics row", err))?;
    Ok(value.unwrap_or(0.0))
}

impl PgMetricsSource {
    /// Builds a lazily-connecting pool; no connection is attempted until the first query.
    pub fn connect_lazy(config: &PgSourceConfig) -> Result<Self, SyncError> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections.max(1))
            .acquire_timeout(config.acquire_timeout)
            .connect_lazy(&config.database_url)
            .map_err(|err| sql_error("configure database pool", err))?;
        Ok(Self::from_pool(pool, config.timezone, config.integration_cutoff))
    }

    pub fn from_pool(pool: PgPool, timezone: Tz, integration_cutoff: DateTime<Utc>) -> Self {
        Self {
            pool,
            timezone,
            integration_cutoff,
        }
    }

    async fn fetch_one_row(
        &self,
        operation: &str,
        sql: &str,
        range: DateRange,
    ) -> Result<Option<PgRow>, SyncError> {
        let (start, end) = day_bounds_utc(self.timezone, range)?;
        debug!(operation, %start, %end, "querying metrics");
        sqlx::query(sql)
            .bind(start)
            .bind(end)
            .bind(self.integration_cutoff)
            .fetch_optional(&self.pool)
            .await
            .map_err(|err| sql_error(operation, err))
    }
}

#[async_trait]
impl MetricsSource for PgMetricsSource {
    async fn fetch_daily_metrics(&self, date: DateKey) -> Result<DailyMetrics, SyncError> {
        self.fetch_period_totals(DateRange::single(date)).await
    }

    async fn fetch_period_totals(&self, range: DateRange) -> Result<DailyMetrics, SyncError> {
        let Some(row) = self
            .fetch_one_row("fetch daily metrics", DAILY_METRICS_SQL, range)
            .await?
        else {
            return Ok(DailyMetrics::default());
        };
        Ok(DailyMetrics {
            total_integrated_users: count(&row, "total_integrated_users")?,
            new_integrated_users: count(&row, "new_integrated_users")?,
            converted_integrated_users: count(&row, "converted_integrated_users")?,
            physical_card_requests: count(&row, "physical_card_requests")?,
            online_auto_issued_cards: count(&row, "online_auto_issued_cards")?,
        })
    }

    async fn fetch_mileage_stats(&self, date: DateKey) -> Result<MileageStats, SyncError> {
        let (start, end) = day_bounds_utc(self.timezone, DateRange::single(date))?;
        let row = sqlx::query(MILEAGE_STATS_SQL)
            .bind(start)
            .bind(end)
            .fetch_optional(&self.pool)
            .await
            .map_err(|err| sql_error("fetch mileage stats", err))?;
        let Some(row) = row else {
            return Ok(MileageStats::default());
        };
        Ok(MileageStats {
            total_pc: amount(&row, "total_pc")?,
            used_point: amount(&row, "used_point")?,
            use_card_price: amount(&row, "use_card_price")?,
            paid_price: amount(&row, "paid_price")?,
            served_mileage: amount(&row, "served_mileage")?,
            charging_count: count(&row, "charging_count")?,
            elctc_pc_ratio: amount(&row, "elctc_pc_ratio")?,
            paid_price_ratio: amount(&row, "paid_price_ratio")?,
            point_success_count: count(&row, "point_success_count")?,
            point_other_status_count: count(&row, "point_other_status_count")?,
            avg_price: amount(&row, "avg_price")?,
            avg_paid_price: amount(&row, "avg_paid_price")?,
            avg_mileage: amount(&row, "avg_mileage")?,
            charging_qy: amount(&row, "charging_qy")?,
        })
    }

    async fn fetch_grade_stats(&self, date: DateKey) -> Result<Vec<GradeStats>, SyncError> {
        let (start, end) = day_bounds_utc(self.timezone, DateRange::single(date))?;
        let rows = sqlx::query(GRADE_STATS_SQL)
            .bind(start)
            .bind(end)
            .fetch_all(&self.pool)
            .await
            .map_err(|err| sql_error("fetch grade stats", err))?;
        rows.iter()
            .map(|row| {
                Ok(GradeStats {
                    grade_name: row
                        .try_get("grade_nm")
                        .map_err(|err| sql_error("decode grade row", err))?,
                    charging_count: count(row, "charging_count")?,
                    avg_pc: amount(row, "avg_pc")?,
                    avg_paid_price: amount(row, "avg_paid_price")?,
                    avg_mileage: amount(row, "avg_mileage")?,
                })
            })
            .collect()
    }

    async fn fetch_registration_count(&self, date: DateKey) -> Result<u64, SyncError> {
        let (start, end) = day_bounds_utc(self.timezone, DateRange::single(date))?;
        let row = sqlx::query(REGISTRATION_SQL)
            .bind(start)
            .bind(end)
            .fetch_optional(&self.pool)
            .await
            .map_err(|err| sql_error("fetch registration count", err))?;
        match row {
            Some(row) => count(&row, "registration_count"),
            None => Ok(0),
        }
    }
}
