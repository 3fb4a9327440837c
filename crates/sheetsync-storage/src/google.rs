use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Method, Url};
use serde::{de::DeserializeOwned, Deserialize};
use serde_json::{json, Value as JsonValue};
use sheetsync_core::{ColumnSpan, SheetAddress, SheetRow, SyncError, ValueInputMode};
use tracing::{debug, info};

use crate::auth::TokenProvider;
use crate::store::DocumentStore;
use crate::{classify_status, sync_error_from_reqwest, RetryDisposition};

pub const DEFAULT_SHEETS_BASE_URL: &str = "https://sheets.googleapis.com/v4";

#[derive(Debug, Clone)]
pub struct GoogleSheetsConfig {
    pub spreadsheet_id: String,
    pub base_url: String,
    pub timeout: Duration,
}

impl GoogleSheetsConfig {
    pub fn new(spreadsheet_id: impl Into<String>) -> Self {
        Self {
            spreadsheet_id: spreadsheet_id.into(),
            base_url: DEFAULT_SHEETS_BASE_URL.to_string(),
            timeout: Duration::from_secs(20),
        }
    }
}

#[derive(Debug, Deserialize)]
struct ValueRange {
    #[serde(default)]
    values: Vec<Vec<JsonValue>>,
}

#[derive(Debug, Deserialize)]
struct SpreadsheetMeta {
    #[serde(default)]
    sheets: Vec<SheetEntry>,
}

#[derive(Debug, Deserialize)]
struct SheetEntry {
    properties: SheetProperties,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SheetProperties {
    #[serde(default)]
    sheet_id: i64,
    title: String,
}

/// Google Sheets v4 REST client bound to one spreadsheet.
pub struct GoogleSheetsStore {
    http: reqwest::Client,
    config: GoogleSheetsConfig,
    tokens: Arc<dyn TokenProvider>,
}

fn render_json_cell(value: &JsonValue) -> String {
    match value {
        JsonValue::String(s) => s.clone(),
        JsonValue::Null => String::new(),
        other => other.to_string(),
    }
}

fn rows_payload(rows: &[SheetRow]) -> JsonValue {
    serde_json::to_value(rows).unwrap_or(JsonValue::Array(Vec::new()))
}

impl GoogleSheetsStore {
    pub fn new(config: GoogleSheetsConfig, tokens: Arc<dyn TokenProvider>) -> Result<Self, SyncError> {
        let http = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout)
            .build()
            .map_err(|err| SyncError::InvalidInput(format!("building http client: {err}")))?;
        Ok(Self::with_client(http, config, tokens))
    }

    pub fn with_client(
        http: reqwest::Client,
        config: GoogleSheetsConfig,
        tokens: Arc<dyn TokenProvider>,
    ) -> Self {
        Self { http, config, tokens }
    }

    fn url(&self, segments: &[&str], last: Option<String>) -> Result<Url, SyncError> {
        let mut url = Url::parse(&self.config.base_url)
            .map_err(|err| SyncError::InvalidInput(format!("sheets base url: {err}")))?;
        {
            let mut path = url
                .path_segments_mut()
                .map_err(|_| SyncError::InvalidInput("sheets base url cannot be a base".into()))?;
            path.pop_if_empty();
            path.push("spreadsheets");
            path.extend(segments);
            if let Some(last) = last {
                path.push(&last);
            }
        }
        Ok(url)
    }

    fn values_url(&self, range: &str, action: &str) -> Result<Url, SyncError> {
        self.url(
            &[self.config.spreadsheet_id.as_str(), "values"],
            Some(format!("{range}{action}")),
        )
    }

    fn spreadsheet_url(&self, action: &str) -> Result<Url, SyncError> {
        self.url(&[], Some(format!("{}{action}", self.config.spreadsheet_id)))
    }

    async fn send<T: DeserializeOwned>(
        &self,
        operation: &str,
        method: Method,
        url: Url,
        query: &[(&str, &str)],
        body: Option<JsonValue>,
    ) -> Result<T, SyncError> {
        let token = self.tokens.access_token().await?;
        let mut req = self
            .http
            .request(method, url)
            .bearer_auth(token)
            .query(query);
        if let Some(body) = body {
            req = req.json(&body);
        }
        let resp = req
            .send()
            .await
            .map_err(|err| sync_error_from_reqwest(operation, err))?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            let message = format!("http {status}: {}", body.trim());
            return Err(match classify_status(status) {
                RetryDisposition::Retryable => SyncError::transient(operation, message),
                RetryDisposition::NonRetryable => SyncError::rejected(operation, message),
            });
        }
        resp.json::<T>()
            .await
            .map_err(|err| sync_error_from_reqwest(operation, err))
    }

    async fn metadata(&self) -> Result<SpreadsheetMeta, SyncError> {
        let url = self.spreadsheet_url("")?;
        self.send(
            "read spreadsheet metadata",
            Method::GET,
            url,
            &[("fields", "sheets.properties(sheetId,title)")],
            None,
        )
        .await
    }

    async fn batch_update(&self, operation: &str, requests: Vec<JsonValue>) -> Result<(), SyncError> {
        let url = self.spreadsheet_url(":batchUpdate")?;
        let _: JsonValue = self
            .send(operation, Method::POST, url, &[], Some(json!({ "requests": requests })))
            .await?;
        Ok(())
    }
}

#[async_trait]
impl DocumentStore for GoogleSheetsStore {
    fn spreadsheet_id(&self) -> &str {
        &self.config.spreadsheet_id
    }

    async fn get_column(&self, sheet: &str, column: u32) -> Result<Vec<String>, SyncError> {
        let address = SheetAddress::columns(sheet, ColumnSpan::new(column, column));
        let rows = self.get_range(&address).await?;
        Ok(rows
            .into_iter()
            .map(|row| row.into_iter().next().unwrap_or_default())
            .collect())
    }

    async fn get_range(&self, address: &SheetAddress) -> Result<Vec<Vec<String>>, SyncError> {
        let range = address.a1();
        let url = self.values_url(&range, "")?;
        let body: ValueRange = self
            .send("read range", Method::GET, url, &[("majorDimension", "ROWS")], None)
            .await?;
        debug!(range = %range, rows = body.values.len(), "read range");
        Ok(body
            .values
            .iter()
            .map(|row| row.iter().map(render_json_cell).collect())
            .collect())
    }

    async fn update_range(
        &self,
        address: &SheetAddress,
        rows: &[SheetRow],
        mode: ValueInputMode,
    ) -> Result<(), SyncError> {
        let range = address.a1();
        let url = self.values_url(&range, "")?;
        let _: JsonValue = self
            .send(
                "update range",
                Method::PUT,
                url,
                &[("valueInputOption", mode.as_api_str())],
                Some(json!({ "range": range, "majorDimension": "ROWS", "values": rows_payload(rows) })),
            )
            .await?;
        debug!(range = %range, rows = rows.len(), "updated range");
        Ok(())
    }

    async fn append_rows(
        &self,
        address: &SheetAddress,
        rows: &[SheetRow],
        mode: ValueInputMode,
    ) -> Result<(), SyncError> {
        let range = address.a1();
        let url = self.values_url(&range, ":append")?;
        let _: JsonValue = self
            .send(
                "append rows",
                Method::POST,
                url,
                &[
                    ("valueInputOption", mode.as_api_str()),
                    ("insertDataOption", "INSERT_ROWS"),
                ],
                Some(json!({ "majorDimension": "ROWS", "values": rows_payload(rows) })),
            )
            .await?;
        debug!(range = %range, rows = rows.len(), "appended rows");
        Ok(())
    }

    async fn clear_range(&self, address: &SheetAddress) -> Result<(), SyncError> {
        let range = address.a1();
        let url = self.values_url(&range, ":clear")?;
        let _: JsonValue = self
            .send("clear range", Method::POST, url, &[], Some(json!({})))
            .await?;
        Ok(())
    }

    async fn ensure_sheet_exists(&self, sheet: &str) -> Result<bool, SyncError> {
        if self.list_sheets().await?.iter().any(|title| title == sheet) {
            return Ok(false);
        }
        self.batch_update(
            "add sheet",
            vec![json!({ "addSheet": { "properties": { "title": sheet } } })],
        )
        .await?;
        info!(spreadsheet = %self.config.spreadsheet_id, sheet, "created sheet");
        Ok(true)
    }

    async fn list_sheets(&self) -> Result<Vec<String>, SyncError> {
        Ok(self
            .metadata()
            .await?
            .sheets
            .into_iter()
            .map(|s| s.properties.title)
            .collect())
    }

    async fn format_header_row(&self, sheet: &str, columns: ColumnSpan) -> Result<(), SyncError> {
        let meta = self.metadata().await?;
        let sheet_id = meta
            .sheets
            .iter()
            .find(|s| s.properties.title == sheet)
            .map(|s| s.properties.sheet_id)
            .ok_or_else(|| SyncError::rejected("format header", format!("no sheet named {sheet}")))?;
        self.batch_update(
            "format header",
            vec![
                json!({
                    "repeatCell": {
                        "range": {
                            "sheetId": sheet_id,
                            "startRowIndex": 0,
                            "endRowIndex": 1,
                            "startColumnIndex": columns.first,
                            "endColumnIndex": columns.last + 1
                        },
                        "cell": {
                            "userEnteredFormat": {
                                "backgroundColor": { "red": 0.2, "green": 0.2, "blue": 0.2 },
                                "textFormat": {
                                    "foregroundColor": { "red": 1, "green": 1, "blue": 1 },
                                    "bold": true
                                }
                            }
                        },
                        "fields": "userEnteredFormat(backgroundColor,textFormat)"
                    }
                }),
                json!({
                    "updateSheetProperties": {
                        "properties": {
                            "sheetId": sheet_id,
                            "gridProperties": { "frozenRowCount": 1 }
                        },
                        "fields": "gridProperties.frozenRowCount"
                    }
                }),
            ],
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::StaticToken;

    fn store() -> GoogleSheetsStore {
        GoogleSheetsStore::new(GoogleSheetsConfig::new("abc123"), Arc::new(StaticToken("t".into()))).unwrap()
    }

    #[test]
    fn values_urls_encode_quoted_ranges() {
        let store = store();
        let url = store.values_url("'25.08'!C5:F5", "").unwrap();
        assert_eq!(
            url.as_str(),
            "https://sheets.googleapis.com/v4/spreadsheets/abc123/values/'25.08'!C5:F5"
        );
        let append = store.values_url("'data set'!A:F", ":append").unwrap();
        assert_eq!(
            append.as_str(),
            "https://sheets.googleapis.com/v4/spreadsheets/abc123/values/'data%20set'!A:F:append"
        );
        assert_eq!(
            store.spreadsheet_url(":batchUpdate").unwrap().as_str(),
            "https://sheets.googleapis.com/v4/spreadsheets/abc123:batchUpdate"
        );
    }

    #[test]
    fn cells_render_like_formatted_values() {
        assert_eq!(render_json_cell(&json!("2025-09-15")), "2025-09-15");
        assert_eq!(render_json_cell(&json!(3)), "3");
        assert_eq!(render_json_cell(&JsonValue::Null), "");
    }

    #[test]
    fn rows_serialize_as_typed_cells() {
        let row = SheetRow::new(vec!["2025-09-15".into(), 3u64.into(), 0.5f64.into()]);
        assert_eq!(rows_payload(&[row]), json!([["2025-09-15", 3, 0.5]]));
    }
}
