//! The append-only observability writer: a connection enum with `Disabled`/`Mock`/`Production`
//! variants so tests
//! never need a real ClickHouse instance, plus the same `INSERT ... FORMAT JSONEachRow`
//! wire shape, plus a batched, backpressure-shedding write path on top of a simple
//! one-row-per-call version.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use reqwest::Client;
use serde::Serialize;
use tokio::sync::Notify;
use url::Url;

use crate::error::{Error, ErrorDetails};

#[derive(Clone)]
pub enum ClickHouseConnectionInfo {
    Disabled,
    Mock {
        mock_data: Arc<RwLock<HashMap<String, Vec<serde_json::Value>>>>,
        healthy: bool,
    },
    Production {
        base_url: Url,
        database: String,
        client: Client,
    },
}

impl ClickHouseConnectionInfo {
    pub fn new(base_url: &str, database: &str) -> Result<Self, Error> {
        let base_url = Url::parse(base_url).map_err(|e| ErrorDetails::Config {
            message: format!("Invalid ClickHouse URL `{base_url}`: {e}"),
        })?;
        Ok(Self::Production {
            base_url,
            database: database.to_string(),
            client: Client::new(),
        })
    }

    pub fn new_mock(healthy: bool) -> Self {
        Self::Mock {
            mock_data: Arc::new(RwLock::new(HashMap::new())),
            healthy,
        }
    }

    pub fn new_disabled() -> Self {
        Self::Disabled
    }

    fn get_url(&self, query: &str) -> Result<Url, Error> {
        match self {
            ClickHouseConnectionInfo::Production { base_url, database, .. } => {
                let mut url = base_url.clone();
                url.query_pairs_mut()
                    .append_pair("database", database)
                    .append_pair("query", query);
                Ok(url)
            }
            _ => Err(ErrorDetails::ClickHouseQuery {
                message: "not a production ClickHouse connection".to_string(),
            }
            .into()),
        }
    }

    /// Writes one observability row. Non-fatal by the caller's choice: inference responses
    /// must never block on, or fail because of, an observability write — callers should call
    /// this from a detached task, not inline.
    pub async fn write<T: Serialize>(&self, row: &T, table: &str) -> Result<(), Error> {
        match self {
            ClickHouseConnectionInfo::Disabled => Ok(()),
            ClickHouseConnectionInfo::Mock { mock_data, .. } => {
                let value = serde_json::to_value(row).map_err(|e| ErrorDetails::Serialization {
                    message: e.to_string(),
                })?;
                let mut data = mock_data.write().unwrap_or_else(|e| e.into_inner());
                data.entry(table.to_string()).or_default().push(value);
                Ok(())
            }
            ClickHouseConnectionInfo::Production { client, .. } => {
                let row_json = serde_json::to_string(row).map_err(|e| ErrorDetails::Serialization {
                    message: e.to_string(),
                })?;
                let query = format!(
                    "INSERT INTO {table} SETTINGS async_insert=1, wait_for_async_insert=1 FORMAT JSONEachRow"
                );
                let url = self.get_url(&query)?;
                let response = client.post(url).body(row_json).send().await.map_err(|e| {
                    ErrorDetails::ClickHouseQuery {
                        message: e.to_string(),
                    }
                })?;
                if !response.status().is_success() {
                    let status = response.status();
                    let body = response.text().await.unwrap_or_default();
                    return Err(ErrorDetails::ClickHouseQuery {
                        message: format!("HTTP {status}: {body}"),
                    }
                    .into());
                }
                Ok(())
            }
        }
    }

    pub async fn health(&self) -> Result<(), Error> {
        match self {
            ClickHouseConnectionInfo::Disabled => Ok(()),
            ClickHouseConnectionInfo::Mock { healthy, .. } => {
                if *healthy {
                    Ok(())
                } else {
                    Err(ErrorDetails::ClickHouseQuery {
                        message: "mock ClickHouse connection is unhealthy".to_string(),
                    }
                    .into())
                }
            }
            ClickHouseConnectionInfo::Production { client, .. } => {
                let url = self.get_url("SELECT 1")?;
                client
                    .get(url)
                    .send()
                    .await
                    .map_err(|e| ErrorDetails::ClickHouseQuery {
                        message: e.to_string(),
                    })?;
                Ok(())
            }
        }
    }

    /// Reads every row in `table` whose `field` equals `value`, for `GET /episode/{id}`.
    /// Uses a `WHERE` clause against Production ClickHouse; filters the
    /// in-memory map directly against the Mock connection.
    pub async fn query_rows_by_field(
        &self,
        table: &str,
        field: &str,
        value: &str,
    ) -> Result<Vec<serde_json::Value>, Error> {
        match self {
            ClickHouseConnectionInfo::Disabled => Ok(Vec::new()),
            ClickHouseConnectionInfo::Mock { mock_data, .. } => {
                let data = mock_data.read().unwrap_or_else(|e| e.into_inner());
                Ok(data
                    .get(table)
                    .cloned()
                    .unwrap_or_default()
                    .into_iter()
                    .filter(|row| row.get(field).and_then(|v| v.as_str()) == Some(value))
                    .collect())
            }
            ClickHouseConnectionInfo::Production { client, .. } => {
                let query = format!("SELECT * FROM {table} WHERE {field} = '{value}' FORMAT JSONEachRow");
                let url = self.get_url(&query)?;
                let response = client.get(url).send().await.map_err(|e| ErrorDetails::ClickHouseQuery {
                    message: e.to_string(),
                })?;
                if !response.status().is_success() {
                    let status = response.status();
                    let body = response.text().await.unwrap_or_default();
                    return Err(ErrorDetails::ClickHouseQuery {
                        message: format!("HTTP {status}: {body}"),
                    }
                    .into());
                }
                let body = response.text().await.map_err(|e| ErrorDetails::ClickHouseQuery {
                    message: e.to_string(),
                })?;
                Ok(body.lines().filter_map(|line| serde_json::from_str(line).ok()).collect())
            }
        }
    }

    #[cfg(test)]
    pub fn read(&self, table: &str) -> Vec<serde_json::Value> {
        match self {
            ClickHouseConnectionInfo::Mock { mock_data, .. } => mock_data
                .read()
                .unwrap_or_else(|e| e.into_inner())
                .get(table)
                .cloned()
                .unwrap_or_default(),
            _ => Vec::new(),
        }
    }
}

/// One observability row queued for the background writer.
pub struct WriteJob {
    pub table: String,
    pub row: serde_json::Value,
}

/// A bounded ring buffer in front of `ClickHouseConnectionInfo::write`, so a burst of
/// inferences sheds observability writes under backpressure instead of piling up unbounded
/// memory or stalling the request path: never let the write queue apply backpressure to
/// inference. Sheds the *oldest* queued row rather than rejecting the newest one, so a writer
/// that's fallen behind still reflects the most recent traffic once it catches up.
#[derive(Clone)]
pub struct ObservabilityWriter {
    queue: Arc<Mutex<VecDeque<WriteJob>>>,
    notify: Arc<Notify>,
    capacity: usize,
}

impl ObservabilityWriter {
    pub fn spawn(connection: ClickHouseConnectionInfo, queue_capacity: usize) -> Self {
        let queue = Arc::new(Mutex::new(VecDeque::with_capacity(queue_capacity)));
        let notify = Arc::new(Notify::new());
        let writer = Self {
            queue: queue.clone(),
            notify: notify.clone(),
            capacity: queue_capacity,
        };
        tokio::spawn(async move {
            loop {
                let job = queue.lock().unwrap_or_else(|e| e.into_inner()).pop_front();
                match job {
                    Some(job) => {
                        if let Err(err) = connection.write(&job.row, &job.table).await {
                            tracing::warn!(table = %job.table, error = %err, "observability write failed");
                        }
                    }
                    None => notify.notified().await,
                }
            }
        });
        writer
    }

    /// Enqueues a row for writing. If the queue is already at capacity, evicts the oldest
    /// queued row (and counts it as dropped) to make room for this one.
    pub fn enqueue(&self, table: &str, row: serde_json::Value) {
        let job = WriteJob {
            table: table.to_string(),
            row,
        };
        let mut queue = self.queue.lock().unwrap_or_else(|e| e.into_inner());
        if queue.len() >= self.capacity {
            if let Some(dropped) = queue.pop_front() {
                metrics::counter!("observability_writes_dropped_total", "table" => dropped.table)
                    .increment(1);
            }
        }
        queue.push_back(job);
        drop(queue);
        self.notify.notify_one();
    }
}

pub const DEFAULT_QUEUE_CAPACITY: usize = 4096;
pub const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(5);

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn mock_connection_records_rows() {
        let connection = ClickHouseConnectionInfo::new_mock(true);
        connection
            .write(&json!({"id": "abc"}), "ChatInference")
            .await
            .unwrap();
        let rows = connection.read("ChatInference");
        assert_eq!(rows.len(), 1);
    }

    #[tokio::test]
    async fn disabled_connection_accepts_writes_silently() {
        let connection = ClickHouseConnectionInfo::new_disabled();
        connection.write(&json!({"id": "abc"}), "ChatInference").await.unwrap();
    }

    #[tokio::test]
    async fn writer_delivers_to_mock_connection() {
        let connection = ClickHouseConnectionInfo::new_mock(true);
        let writer = ObservabilityWriter::spawn(connection.clone(), 16);
        writer.enqueue("ChatInference", json!({"id": "abc"}));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(connection.read("ChatInference").len(), 1);
    }
}
