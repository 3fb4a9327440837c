use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use sheetsync_core::SyncError;
use sheetsync_source::{PgMetricsSource, PgSourceConfig};
use sheetsync_storage::{
    load_token_provider_from_env, DocumentStore, GoogleSheetsConfig, GoogleSheetsStore, RetryPolicy,
};
use tracing::info;

use crate::layout::SheetLayout;
use crate::scheduler::ScheduleConfig;
use crate::service::SyncService;

pub const DEFAULT_INTEGRATION_CUTOFF: &str = "2025-07-28T05:00:00Z";

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub database_url: Option<String>,
    pub primary_spreadsheet_id: Option<String>,
    pub secondary_spreadsheet_id: Option<String>,
    pub timezone: Tz,
    pub layout_file: Option<PathBuf>,
    pub scheduler_enabled: bool,
    pub schedule: ScheduleConfig,
    pub fetch_retry: RetryPolicy,
    pub write_retry: RetryPolicy,
    pub http_timeout_secs: u64,
    pub web_port: u16,
    pub integration_cutoff: DateTime<Utc>,
}

fn parse_or<T>(var: &impl Fn(&str) -> Option<String>, name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match var(name) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|err| anyhow!("{name}={raw:?}: {err}")),
        None => Ok(default),
    }
}

impl SyncConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Builds the config from any variable lookup; blank values count as unset.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let var = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());
        let defaults = ScheduleConfig::default();

        let timezone = match var("SHEETSYNC_TIMEZONE") {
            Some(name) => name
                .trim()
                .parse::<Tz>()
                .map_err(|err| anyhow!("SHEETSYNC_TIMEZONE={name:?}: {err}"))?,
            None => chrono_tz::Asia::Seoul,
        };
        let cutoff = var("SHEETSYNC_INTEGRATION_CUTOFF").unwrap_or_else(|| DEFAULT_INTEGRATION_CUTOFF.to_string());
        let integration_cutoff = DateTime::parse_from_rfc3339(cutoff.trim())
            .with_context(|| format!("SHEETSYNC_INTEGRATION_CUTOFF={cutoff:?}"))?
            .with_timezone(&Utc);

        Ok(Self {
            database_url: var("DATABASE_URL"),
            primary_spreadsheet_id: var("GOOGLE_SPREADSHEET_ID"),
            secondary_spreadsheet_id: var("GOOGLE_SPREADSHEET_ID2"),
            timezone,
            layout_file: var("SHEETSYNC_LAYOUT_FILE").map(PathBuf::from),
            scheduler_enabled: var("SHEETSYNC_SCHEDULER_ENABLED")
                .map(|v| matches!(v.trim(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(false),
            schedule: ScheduleConfig {
                hourly_cron: var("SHEETSYNC_HOURLY_CRON").unwrap_or(defaults.hourly_cron),
                daily_check_cron: var("SHEETSYNC_DAILY_CHECK_CRON").unwrap_or(defaults.daily_check_cron),
            },
            fetch_retry: RetryPolicy::fixed(
                parse_or(&var, "SHEETSYNC_FETCH_MAX_ATTEMPTS", 3)?,
                Duration::from_millis(parse_or(&var, "SHEETSYNC_FETCH_RETRY_DELAY_MS", 5000)?),
            ),
            write_retry: RetryPolicy::fixed(
                parse_or(&var, "SHEETSYNC_WRITE_MAX_ATTEMPTS", 3)?,
                Duration::from_millis(parse_or(&var, "SHEETSYNC_WRITE_RETRY_DELAY_MS", 3000)?),
            ),
            http_timeout_secs: parse_or(&var, "SHEETSYNC_HTTP_TIMEOUT_SECS", 20)?,
            web_port: parse_or(&var, "SHEETSYNC_WEB_PORT", 3000)?,
            integration_cutoff,
        })
    }

    pub fn layout(&self) -> Result<SheetLayout> {
        SheetLayout::load(self.layout_file.as_deref())
    }
}

fn google_store(
    http: &reqwest::Client,
    spreadsheet_id: &str,
    timeout: Duration,
    tokens: Arc<dyn sheetsync_storage::TokenProvider>,
) -> Arc<dyn DocumentStore> {
    let mut config = GoogleSheetsConfig::new(spreadsheet_id);
    config.timeout = timeout;
    Arc::new(GoogleSheetsStore::with_client(http.clone(), config, tokens))
}

/// Wires the Postgres source and Google Sheets stores described by `config`.
///
/// Missing settings surface as [`SyncError::NotConfigured`] so callers can keep
/// serving and report the gap instead of exiting.
pub fn build_service(config: &SyncConfig) -> Result<SyncService, SyncError> {
    let database_url = config
        .database_url
        .clone()
        .ok_or_else(|| SyncError::NotConfigured("DATABASE_URL".into()))?;
    let primary_id = config
        .primary_spreadsheet_id
        .as_deref()
        .ok_or_else(|| SyncError::NotConfigured("GOOGLE_SPREADSHEET_ID".into()))?;
    let layout = config
        .layout()
        .map_err(|err| SyncError::InvalidInput(format!("{err:#}")))?;

    let timeout = Duration::from_secs(config.http_timeout_secs);
    let http = reqwest::Client::builder()
        .gzip(true)
        .brotli(true)
        .timeout(timeout)
        .build()
        .map_err(|err| SyncError::InvalidInput(format!("building http client: {err}")))?;
    let tokens = load_token_provider_from_env(http.clone())?
        .ok_or_else(|| SyncError::NotConfigured("Google service account credentials".into()))?;

    let source = PgMetricsSource::connect_lazy(&PgSourceConfig {
        database_url,
        timezone: config.timezone,
        integration_cutoff: config.integration_cutoff,
        max_connections: 5,
        acquire_timeout: Duration::from_secs(10),
    })?;

    let mut service = SyncService::new(
        Arc::new(source),
        google_store(&http, primary_id, timeout, tokens.clone()),
        layout,
    )
    .with_retry(config.fetch_retry, config.write_retry)
    .with_timezone(config.timezone);
    if let Some(secondary_id) = config.secondary_spreadsheet_id.as_deref() {
        service = service.with_secondary(google_store(&http, secondary_id, timeout, tokens));
    }
    info!(
        primary = primary_id,
        secondary = config.secondary_spreadsheet_id.as_deref().unwrap_or("-"),
        timezone = %config.timezone,
        "sync service configured"
    );
    Ok(service)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect::<HashMap<_, _>>();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn defaults_apply_when_unset() {
        let config = SyncConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config.timezone, chrono_tz::Asia::Seoul);
        assert_eq!(config.fetch_retry, RetryPolicy::fixed(3, Duration::from_millis(5000)));
        assert_eq!(config.write_retry, RetryPolicy::default());
        assert_eq!(config.schedule, ScheduleConfig::default());
        assert_eq!(config.web_port, 3000);
        assert!(!config.scheduler_enabled);
        assert_eq!(config.integration_cutoff.to_rfc3339(), "2025-07-28T05:00:00+00:00");
    }

    #[test]
    fn overrides_are_parsed() {
        let config = SyncConfig::from_lookup(lookup(&[
            ("GOOGLE_SPREADSHEET_ID", "sheet-a"),
            ("GOOGLE_SPREADSHEET_ID2", "  "),
            ("SHEETSYNC_TIMEZONE", "UTC"),
            ("SHEETSYNC_SCHEDULER_ENABLED", "true"),
            ("SHEETSYNC_WRITE_MAX_ATTEMPTS", "5"),
            ("SHEETSYNC_WEB_PORT", "8080"),
        ]))
        .unwrap();
        assert_eq!(config.primary_spreadsheet_id.as_deref(), Some("sheet-a"));
        assert_eq!(config.secondary_spreadsheet_id, None);
        assert_eq!(config.timezone, chrono_tz::UTC);
        assert!(config.scheduler_enabled);
        assert_eq!(config.write_retry.max_attempts, 5);
        assert_eq!(config.web_port, 8080);
    }

    #[test]
    fn malformed_values_name_the_variable() {
        let err = SyncConfig::from_lookup(lookup(&[("SHEETSYNC_WEB_PORT", "eighty")])).unwrap_err();
        assert!(err.to_string().contains("SHEETSYNC_WEB_PORT"));
        let err = SyncConfig::from_lookup(lookup(&[("SHEETSYNC_TIMEZONE", "Mars/Base")])).unwrap_err();
        assert!(err.to_string().contains("SHEETSYNC_TIMEZONE"));
    }

    #[test]
    fn missing_settings_are_not_configured() {
        let config = SyncConfig::from_lookup(lookup(&[("GOOGLE_SPREADSHEET_ID", "sheet-a")])).unwrap();
        let err = build_service(&config).err().unwrap();
        assert_eq!(err, SyncError::NotConfigured("DATABASE_URL".into()));

        let config = SyncConfig::from_lookup(lookup(&[("DATABASE_URL", "postgres://localhost/x")])).unwrap();
        let err = build_service(&config).err().unwrap();
        assert_eq!(err, SyncError::NotConfigured("GOOGLE_SPREADSHEET_ID".into()));
    }
}
