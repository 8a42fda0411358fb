use std::time::Duration;

use reqwest::Url;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{DeleteOutcome, ExternalSource, GatewayError, RawRow};
use crate::config::SourceConfig;
use crate::intake::INTAKE_COLUMNS;
use crate::models::NaturalKey;

/// Last column of the intake range (11 columns, A..K).
const LAST_COLUMN: char = 'K';

/// Spreadsheet HTTP client (Sheets v4 values API).
pub struct SheetsSource {
    config: SourceConfig,
    client: reqwest::blocking::Client,
}

impl SheetsSource {
    pub fn new(config: SourceConfig) -> Result<Self, GatewayError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| GatewayError::SourceUnavailable(format!("HTTP client: {e}")))?;

        Ok(Self { config, client })
    }

    fn endpoint(&self, segments: &[&str]) -> Result<Url, GatewayError> {
        let mut url = Url::parse(&self.config.base_url).map_err(|e| {
            GatewayError::SourceUnavailable(format!("invalid source URL {}: {e}", self.config.base_url))
        })?;
        url.path_segments_mut()
            .map_err(|_| {
                GatewayError::SourceUnavailable(format!(
                    "source URL cannot take a path: {}",
                    self.config.base_url
                ))
            })?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    fn values_url(&self) -> Result<Url, GatewayError> {
        let range = format!("'{}'!A:{}", self.config.tab, LAST_COLUMN);
        self.endpoint(&["v4", "spreadsheets", &self.config.spreadsheet_id, "values", &range])
    }

    fn metadata_url(&self) -> Result<Url, GatewayError> {
        let mut url = self.endpoint(&["v4", "spreadsheets", &self.config.spreadsheet_id])?;
        url.query_pairs_mut().append_pair("fields", "sheets.properties");
        Ok(url)
    }

    fn batch_update_url(&self) -> Result<Url, GatewayError> {
        let target = format!("{}:batchUpdate", self.config.spreadsheet_id);
        self.endpoint(&["v4", "spreadsheets", &target])
    }

    fn authorize(
        &self,
        request: reqwest::blocking::RequestBuilder,
    ) -> reqwest::blocking::RequestBuilder {
        match &self.config.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    fn send(
        &self,
        request: reqwest::blocking::RequestBuilder,
    ) -> Result<reqwest::blocking::Response, GatewayError> {
        let response = self
            .authorize(request)
            .send()
            .map_err(|e| self.classify(e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().unwrap_or_default();
            return Err(GatewayError::SourceUnavailable(format!(
                "HTTP {}: {}",
                status.as_u16(),
                body.trim()
            )));
        }
        Ok(response)
    }

    fn classify(&self, e: reqwest::Error) -> GatewayError {
        if e.is_timeout() {
            GatewayError::Timeout {
                secs: self.config.timeout_secs,
            }
        } else if e.is_connect() {
            GatewayError::SourceUnavailable(format!("cannot reach {}", self.config.base_url))
        } else {
            GatewayError::SourceUnavailable(e.to_string())
        }
    }

    fn fetch_values(&self) -> Result<Vec<Vec<Value>>, GatewayError> {
        let url = self.values_url()?;
        let response = self.send(self.client.get(url))?;
        let parsed: ValueRange = response
            .json()
            .map_err(|e| GatewayError::MalformedResponse(e.to_string()))?;
        Ok(parsed.values)
    }

    fn sheet_id(&self) -> Result<i64, GatewayError> {
        let url = self.metadata_url()?;
        let response = self.send(self.client.get(url))?;
        let parsed: SpreadsheetMetadata = response
            .json()
            .map_err(|e| GatewayError::MalformedResponse(e.to_string()))?;
        find_sheet_id(&parsed, &self.config.tab)
    }
}

/// Body of `GET .../values/{range}`. `values` is omitted when the range is empty.
#[derive(Deserialize)]
struct ValueRange {
    #[serde(default)]
    values: Vec<Vec<Value>>,
}

#[derive(Deserialize)]
struct SpreadsheetMetadata {
    #[serde(default)]
    sheets: Vec<SheetEntry>,
}

#[derive(Deserialize)]
struct SheetEntry {
    properties: SheetProperties,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SheetProperties {
    sheet_id: i64,
    title: String,
}

#[derive(Serialize)]
struct BatchUpdateRequest {
    requests: Vec<DeleteDimensionRequest>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct DeleteDimensionRequest {
    delete_dimension: DeleteDimension,
}

#[derive(Serialize)]
struct DeleteDimension {
    range: DimensionRange,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct DimensionRange {
    sheet_id: i64,
    dimension: &'static str,
    start_index: usize,
    end_index: usize,
}

fn find_sheet_id(metadata: &SpreadsheetMetadata, tab: &str) -> Result<i64, GatewayError> {
    metadata
        .sheets
        .iter()
        .find(|s| s.properties.title == tab)
        .map(|s| s.properties.sheet_id)
        .ok_or_else(|| GatewayError::MalformedResponse(format!("no tab named '{tab}'")))
}

fn cell_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// Drop header rows and number the remaining ones from zero.
fn rows_from_values(values: &[Vec<Value>], header_rows: usize) -> Vec<RawRow> {
    values
        .iter()
        .skip(header_rows)
        .enumerate()
        .map(|(position, cells)| {
            let mut cells: Vec<String> = cells.iter().map(cell_text).collect();
            // Trailing blank cells are omitted by the API.
            if cells.len() < INTAKE_COLUMNS && !cells.is_empty() {
                cells.resize(INTAKE_COLUMNS, String::new());
            }
            RawRow::new(position, cells)
        })
        .collect()
}

fn delete_request(sheet_id: i64, sheet_row: usize) -> BatchUpdateRequest {
    BatchUpdateRequest {
        requests: vec![DeleteDimensionRequest {
            delete_dimension: DeleteDimension {
                range: DimensionRange {
                    sheet_id,
                    dimension: "ROWS",
                    start_index: sheet_row,
                    end_index: sheet_row + 1,
                },
            },
        }],
    }
}

impl ExternalSource for SheetsSource {
    fn list_rows(&self) -> Result<Vec<RawRow>, GatewayError> {
        let values = self.fetch_values()?;
        let rows = rows_from_values(&values, self.config.header_rows);
        tracing::debug!(rows = rows.len(), "Fetched intake rows");
        Ok(rows)
    }

    fn delete_row(&self, key: &NaturalKey) -> Result<DeleteOutcome, GatewayError> {
        // Positions shift whenever someone edits the sheet, so the row is
        // located on a fresh read with only the delete call after it. The
        // index can still go stale if the sheet changes between those two.
        let sheet_id = self.sheet_id()?;
        let values = self.fetch_values()?;
        let rows = rows_from_values(&values, self.config.header_rows);
        let Some(row) = rows.iter().find(|r| r.natural_key().as_ref() == Some(key)) else {
            tracing::info!(natural_key = %key, "Row already absent from source");
            return Ok(DeleteOutcome::NotFound);
        };

        let sheet_row = self.config.header_rows + row.position;
        let url = self.batch_update_url()?;
        self.send(
            self.client
                .post(url)
                .json(&delete_request(sheet_id, sheet_row)),
        )?;

        tracing::info!(natural_key = %key, sheet_row, "Deleted row from source");
        Ok(DeleteOutcome::Deleted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn config(base_url: &str, timeout_secs: u64) -> SourceConfig {
        SourceConfig {
            base_url: base_url.into(),
            spreadsheet_id: "abc123".into(),
            tab: "Form Responses 1".into(),
            token: None,
            timeout_secs,
            header_rows: 1,
        }
    }

    #[test]
    fn values_url_encodes_tab_name() {
        let source = SheetsSource::new(config("http://localhost:8080", 5)).unwrap();
        let url = source.values_url().unwrap().to_string();
        assert!(url.starts_with("http://localhost:8080/v4/spreadsheets/abc123/values/"));
        assert!(url.ends_with("'Form%20Responses%201'!A:K"));
    }

    #[test]
    fn batch_update_and_metadata_urls() {
        let source = SheetsSource::new(config("http://localhost:8080/", 5)).unwrap();
        assert_eq!(
            source.batch_update_url().unwrap().as_str(),
            "http://localhost:8080/v4/spreadsheets/abc123:batchUpdate"
        );
        assert_eq!(
            source.metadata_url().unwrap().as_str(),
            "http://localhost:8080/v4/spreadsheets/abc123?fields=sheets.properties"
        );
    }

    #[test]
    fn invalid_base_url_is_unavailable() {
        let source = SheetsSource::new(config("not a url", 5)).unwrap();
        let err = source.list_rows().unwrap_err();
        assert!(matches!(err, GatewayError::SourceUnavailable(_)));
    }

    #[test]
    fn rows_skip_header_and_pad_short_rows() {
        let values: Vec<Vec<Value>> = vec![
            vec![json!("Timestamp"), json!("Email")],
            vec![json!("12/03/2024 10:15:00"), json!(""), json!("Maria"), json!(54)],
            vec![],
        ];
        let rows = rows_from_values(&values, 1);
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].position, 0);
        assert_eq!(rows[0].cells.len(), INTAKE_COLUMNS);
        assert_eq!(rows[0].cells[3], "54");
        assert_eq!(rows[0].cells[10], "");
        assert!(rows[1].cells.is_empty());
    }

    #[test]
    fn empty_range_has_no_values() {
        let parsed: ValueRange = serde_json::from_value(json!({"range": "A1:K1"})).unwrap();
        assert!(parsed.values.is_empty());
    }

    #[test]
    fn sheet_id_lookup_by_title() {
        let metadata: SpreadsheetMetadata = serde_json::from_value(json!({
            "sheets": [
                {"properties": {"sheetId": 0, "title": "Summary"}},
                {"properties": {"sheetId": 918273, "title": "Form Responses 1"}}
            ]
        }))
        .unwrap();
        assert_eq!(find_sheet_id(&metadata, "Form Responses 1").unwrap(), 918273);
        assert!(matches!(
            find_sheet_id(&metadata, "Missing"),
            Err(GatewayError::MalformedResponse(_))
        ));
    }

    #[test]
    fn delete_request_targets_single_row() {
        let body = serde_json::to_value(delete_request(42, 7)).unwrap();
        assert_eq!(
            body,
            json!({
                "requests": [{
                    "deleteDimension": {
                        "range": {
                            "sheetId": 42,
                            "dimension": "ROWS",
                            "startIndex": 7,
                            "endIndex": 8
                        }
                    }
                }]
            })
        );
    }

    #[test]
    fn refused_connection_is_unavailable() {
        let source = SheetsSource::new(config("http://127.0.0.1:9", 2)).unwrap();
        let err = source.list_rows().unwrap_err();
        assert!(matches!(err, GatewayError::SourceUnavailable(_)));
    }

    #[test]
    fn silent_server_times_out() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let source = SheetsSource::new(config(&format!("http://{addr}"), 1)).unwrap();

        let err = source.list_rows().unwrap_err();
        assert_eq!(err, GatewayError::Timeout { secs: 1 });
        drop(listener);
    }

    #[test]
    fn silent_server_times_out_on_delete() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let source = SheetsSource::new(config(&format!("http://{addr}"), 1)).unwrap();

        let err = source.delete_row(&NaturalKey::derive("1", "A")).unwrap_err();
        assert_eq!(err, GatewayError::Timeout { secs: 1 });
        drop(listener);
    }
}
