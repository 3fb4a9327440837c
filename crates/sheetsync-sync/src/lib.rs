//! Row location, upsert decisions, sweeps, duplicate cleanup and scheduling
//! for the metrics-to-sheet sync.

mod config;
mod layout;
mod locator;
mod resolver;
mod scheduler;
mod service;
mod upsert;

pub use config::{build_service, SyncConfig, DEFAULT_INTEGRATION_CUTOFF};
pub use layout::{Placement, RowSource, SheetLayout, SpreadsheetRole, TargetSheet};
pub use locator::{monthly_row, RowLocator};
pub use resolver::DuplicateResolver;
pub use scheduler::{
    AutoUpdateScheduler, ScheduleConfig, ScheduledJob, ScheduledRun, SchedulerError, SchedulerStatus,
};
pub use service::{
    Clock, FixedClock, ResolveResult, SpreadsheetLocks, SweepMode, SyncService, SystemClock, STAMP_FORMAT,
};
pub use upsert::{UpsertContext, UpsertEngine};

pub const CRATE_NAME: &str = "sheetsync-sync";

#[cfg(test)]
pub(crate) mod testing {
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    use async_trait::async_trait;
    use chrono::{DateTime, Utc};
    use sheetsync_core::{DailyMetrics, DateKey, DateRange, GradeStats, MileageStats, SyncError};
    use sheetsync_source::MetricsSource;

    use crate::service::FixedClock;

    pub fn clock_at(rfc3339: &str) -> Arc<FixedClock> {
        let now = DateTime::parse_from_rfc3339(rfc3339).unwrap().with_timezone(&Utc);
        Arc::new(FixedClock(now))
    }

    /// Metrics keyed by date; unknown dates are all-zero.
    #[derive(Default)]
    pub struct ScriptedSource {
        metrics: Mutex<HashMap<DateKey, DailyMetrics>>,
        failures: Mutex<HashMap<DateKey, SyncError>>,
        calls: AtomicUsize,
    }

    impl ScriptedSource {
        pub fn set(&self, date: DateKey, [new, converted, physical, online]: [u64; 4]) {
            self.metrics.lock().unwrap().insert(
                date,
                DailyMetrics {
                    total_integrated_users: new + converted,
                    new_integrated_users: new,
                    converted_integrated_users: converted,
                    physical_card_requests: physical,
                    online_auto_issued_cards: online,
                },
            );
        }

        pub fn fail_on(&self, date: DateKey, err: SyncError) {
            self.failures.lock().unwrap().insert(date, err);
        }

        pub fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl MetricsSource for ScriptedSource {
        async fn fetch_daily_metrics(&self, date: DateKey) -> Result<DailyMetrics, SyncError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(err) = self.failures.lock().unwrap().get(&date) {
                return Err(err.clone());
            }
            Ok(self.metrics.lock().unwrap().get(&date).copied().unwrap_or_default())
        }

        async fn fetch_period_totals(&self, range: DateRange) -> Result<DailyMetrics, SyncError> {
            let metrics = self.metrics.lock().unwrap();
            let mut total = DailyMetrics::default();
            for m in range.days().filter_map(|d| metrics.get(&d)) {
                total.total_integrated_users += m.total_integrated_users;
                total.new_integrated_users += m.new_integrated_users;
                total.converted_integrated_users += m.converted_integrated_users;
                total.physical_card_requests += m.physical_card_requests;
                total.online_auto_issued_cards += m.online_auto_issued_cards;
            }
            Ok(total)
        }

        async fn fetch_mileage_stats(&self, _date: DateKey) -> Result<MileageStats, SyncError> {
            Ok(MileageStats {
                total_pc: 1000.0,
                charging_count: 4,
                ..Default::default()
            })
        }

        async fn fetch_grade_stats(&self, _date: DateKey) -> Result<Vec<GradeStats>, SyncError> {
            Ok(vec![GradeStats {
                grade_name: "GOLD".into(),
                charging_count: 4,
                avg_pc: 250.0,
                avg_paid_price: 200.0,
                avg_mileage: 5.0,
            }])
        }

        async fn fetch_registration_count(&self, _date: DateKey) -> Result<u64, SyncError> {
            Ok(7)
        }
    }
}
