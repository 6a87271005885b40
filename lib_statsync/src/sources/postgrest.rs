//! # PostgREST Snapshot Source
//!
//! Reads the whole metrics table through the REST gateway of a hosted
//! Postgres backend (`GET /rest/v1/{table}?select=*`).

use reqwest::header::{HeaderMap, HeaderValue};
use reqwest::Method;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::core::collaborator::SnapshotSource;
use crate::core::error::SyncError;
use crate::core::model::{MetricRow, MetricValue, FIELD_ENTITY_ID, FIELD_METRIC_NAME, FIELD_METRIC_VALUE};
use crate::retrieve::ky_http::ApiClient;

/// Maps the remote table's column names onto the canonical row fields.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ColumnMap {
    /// Column holding the entity id.
    pub entity_id: String,
    /// Column holding the metric name.
    pub metric_name: String,
    /// Column holding the metric value.
    pub metric_value: String,
}

impl Default for ColumnMap {
    fn default() -> Self {
        Self {
            entity_id: "demo_id".to_string(),
            metric_name: "metric_name".to_string(),
            metric_value: "metric_value".to_string(),
        }
    }
}

impl ColumnMap {
    /// Re-keys a remote record under the canonical field names.
    ///
    /// Columns outside the mapping are dropped; mapped columns that are
    /// missing stay missing.
    pub fn to_canonical(&self, record: &Map<String, Value>) -> Map<String, Value> {
        let mut out = Map::new();
        for (column, field) in [
            (&self.entity_id, FIELD_ENTITY_ID),
            (&self.metric_name, FIELD_METRIC_NAME),
            (&self.metric_value, FIELD_METRIC_VALUE),
        ] {
            if let Some(value) = record.get(column.as_str()) {
                out.insert(field.to_string(), value.clone());
            }
        }
        out
    }

    /// Builds a row from a remote record, or `None` if any field is unusable.
    pub fn to_row(&self, record: &Map<String, Value>) -> Option<MetricRow> {
        let entity_id = record.get(self.entity_id.as_str())?.as_str().filter(|s| !s.is_empty())?;
        let metric_name = record.get(self.metric_name.as_str())?.as_str().filter(|s| !s.is_empty())?;
        let metric_value = MetricValue::from_json(record.get(self.metric_value.as_str())?)?;
        Some(MetricRow::new(entity_id, metric_name, metric_value))
    }
}

/// # PostgREST Snapshot
///
/// One fetch equals one `select=*` over the configured table.
pub struct PostgrestSnapshot {
    client: ApiClient,
    api_key: String,
    table: String,
    columns: ColumnMap,
}

impl PostgrestSnapshot {
    /// Retries per request on transient HTTP failures.
    pub const MAX_RETRIES: u32 = 3;

    /// Creates a source for `table` under the backend at `base_url`.
    ///
    /// `api_key` is sent both as the `apikey` header and as bearer token.
    pub fn new(base_url: &str, api_key: &str, table: &str, columns: ColumnMap) -> Result<Self, SyncError> {
        let base = if base_url.ends_with('/') {
            base_url.to_string()
        } else {
            format!("{}/", base_url)
        };
        let client = ApiClient::new(&base, Some(api_key.to_string()), Self::MAX_RETRIES)
            .map_err(|e| SyncError::Config(format!("invalid backend url '{}': {}", base_url, e)))?;

        Ok(Self {
            client,
            api_key: api_key.to_string(),
            table: table.to_string(),
            columns,
        })
    }

    /// Relative path of the snapshot query.
    pub fn query_path(&self) -> String {
        format!("rest/v1/{}?select=*", self.table)
    }

    fn headers(&self) -> Result<HeaderMap, SyncError> {
        let mut headers = HeaderMap::new();
        let key = HeaderValue::from_str(&self.api_key).map_err(|e| SyncError::Config(format!("invalid api key: {}", e)))?;
        headers.insert("apikey", key);
        headers.insert("Accept", HeaderValue::from_static("application/json"));
        Ok(headers)
    }

    /// Turns the decoded body into rows, skipping unusable records.
    pub fn rows_from_records(&self, records: &[Map<String, Value>]) -> Vec<MetricRow> {
        let mut rows = Vec::with_capacity(records.len());
        for record in records {
            match self.columns.to_row(record) {
                Some(row) => rows.push(row),
                None => log::warn!("Skipping unusable row from '{}': {}", self.table, Value::Object(record.clone())),
            }
        }
        rows
    }
}

impl SnapshotSource for PostgrestSnapshot {
    async fn fetch(&self) -> Result<Vec<MetricRow>, SyncError> {
        let path = self.query_path();
        log::debug!("Fetching snapshot: {}{}", self.client.base_url(), path);

        let response = self
            .client
            .request::<Vec<Map<String, Value>>>(Method::GET, &path, Some(self.headers()?))
            .await
            .map_err(|e| SyncError::TransientFetch(e.to_string()))?;

        if !response.success {
            return Err(SyncError::TransientFetch(format!(
                "HTTP {}: {}",
                response.status,
                response.error_body.unwrap_or_default()
            )));
        }

        let records = response.data.unwrap_or_default();
        let rows = self.rows_from_records(&records);
        log::info!("Snapshot of '{}' returned {} row(s).", self.table, rows.len());
        Ok(rows)
    }
}
