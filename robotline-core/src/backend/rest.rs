//! HTTP client for a PostgREST-style hosted backend
//!
//! Reads and plan updates go to the table endpoints under `backend.url`:
//!
//! | Capability | Request |
//! |------------|---------|
//! | instance status | `GET /remote_instances?id=eq.{id}` |
//! | instance by name | `GET /remote_instances?site_id=eq.{site}&name=eq.{name}&order=created_at.desc` |
//! | timeline page | `GET /instance_logs?instance_id=eq.{id}&order=created_at.desc&limit={n}` |
//! | plans | `GET /instance_plans?instance_id=eq.{id}&order=created_at.asc` |
//! | plan update | `PATCH /instance_plans?id=eq.{id}` |
//!
//! Actions are `POST {actions}/send-message` and `POST {actions}/create-instance`.
//!
//! The change feed is emulated by re-reading both tables on an interval and
//! diffing each snapshot against the previous one.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use tokio::sync::mpsc;

use super::{
    ActionApi, ActionResponse, ChangeFeed, CreateInstanceRequest, FeedReceiver, InstanceDirectory,
    PlanStore, SendMessageRequest, TimelineStore, FEED_CHANNEL_CAPACITY,
};
use crate::config::BackendConfig;
use crate::error::{Error, Result};
use crate::normalize::{self, row_id};
use crate::types::{FeedEvent, FeedTable, InstanceRecord, PlanStatus};

const INSTANCES_TABLE: &str = "remote_instances";
const INSTANCE_COLUMNS: &str = "id,name,status,created_at";

/// Most log rows the change feed looks at per poll
const FEED_LOG_WINDOW: usize = 200;

/// HTTP implementation of every collaborator trait
#[derive(Clone)]
pub struct RestBackend {
    http_client: reqwest::Client,
    base_url: String,
    actions_url: String,
    feed_interval: Duration,
}

impl std::fmt::Debug for RestBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RestBackend")
            .field("base_url", &self.base_url)
            .field("actions_url", &self.actions_url)
            .finish()
    }
}

impl RestBackend {
    /// Create a new client from configuration
    ///
    /// Returns an error if the configuration is invalid or missing required fields.
    pub fn new(config: &BackendConfig) -> Result<Self> {
        config.validate()?;

        let base_url = config
            .url
            .clone()
            .ok_or_else(|| Error::Config("backend.url is required".to_string()))?
            .trim_end_matches('/')
            .to_string();
        let actions_url = config
            .actions_base()
            .ok_or_else(|| Error::Config("backend.url is required".to_string()))?;

        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        if let Some(api_key) = &config.api_key {
            headers.insert(
                "apikey",
                HeaderValue::from_str(api_key)
                    .map_err(|e| Error::Config(format!("invalid api_key: {}", e)))?,
            );
            headers.insert(
                AUTHORIZATION,
                HeaderValue::from_str(&format!("Bearer {}", api_key))
                    .map_err(|e| Error::Config(format!("invalid api_key: {}", e)))?,
            );
        }

        let http_client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .default_headers(headers)
            .build()
            .map_err(|e| Error::Config(format!("failed to create HTTP client: {}", e)))?;

        Ok(Self {
            http_client,
            base_url,
            actions_url,
            feed_interval: config.feed_poll_interval(),
        })
    }

    fn table_url(&self, table: &str) -> String {
        format!("{}/{}", self.base_url, table)
    }

    async fn select(&self, table: &str, query: &[(&str, String)]) -> Result<Vec<Value>> {
        let response = self
            .http_client
            .get(self.table_url(table))
            .query(query)
            .send()
            .await?;
        parse_json(response).await
    }

    async fn patch_plan(&self, plan_id: &str, body: Value) -> Result<()> {
        let response = self
            .http_client
            .patch(self.table_url(FeedTable::Plans.as_str()))
            .query(&[("id", eq(plan_id))])
            .header("Prefer", "return=minimal")
            .json(&body)
            .send()
            .await?;
        ensure_success(response).await?;
        Ok(())
    }

    async fn post_action<B: serde::Serialize + Sync>(
        &self,
        action: &str,
        body: &B,
    ) -> Result<ActionResponse> {
        let url = format!("{}/{}", self.actions_url, action);
        let response = self.http_client.post(&url).json(body).send().await?;
        let status = response.status();
        let text = response.text().await?;

        // Logical errors come back as `{"error": "..."}`, sometimes with a 4xx.
        if let Ok(parsed) = serde_json::from_str::<ActionResponse>(&text) {
            if parsed.error.is_some() || status.is_success() {
                return Ok(parsed);
            }
        }
        if status.is_success() {
            return Ok(ActionResponse::default());
        }
        Err(api_error(status, &text))
    }

    async fn first_instance(&self, query: &[(&str, String)]) -> Result<Option<InstanceRecord>> {
        let rows = self.select(INSTANCES_TABLE, query).await?;
        rows.first().map(normalize::instance_record).transpose()
    }

    async fn snapshot(&self, instance_id: &str) -> Result<(Vec<Value>, Vec<Value>)> {
        let mut logs = self.fetch_timeline(instance_id, FEED_LOG_WINDOW).await?;
        logs.reverse();
        let plans = self.fetch_plans(instance_id).await?;
        Ok((logs, plans))
    }
}

#[async_trait]
impl ActionApi for RestBackend {
    async fn send_message(&self, request: SendMessageRequest) -> Result<ActionResponse> {
        self.post_action("send-message", &request).await
    }

    async fn create_instance(&self, request: CreateInstanceRequest) -> Result<ActionResponse> {
        self.post_action("create-instance", &request).await
    }
}

#[async_trait]
impl InstanceDirectory for RestBackend {
    async fn instance_status(&self, instance_id: &str) -> Result<Option<InstanceRecord>> {
        self.first_instance(&[
            ("select", INSTANCE_COLUMNS.to_string()),
            ("id", eq(instance_id)),
            ("limit", "1".to_string()),
        ])
        .await
    }

    async fn find_instance_by_name(
        &self,
        site_id: &str,
        name: &str,
    ) -> Result<Option<InstanceRecord>> {
        self.first_instance(&[
            ("select", INSTANCE_COLUMNS.to_string()),
            ("site_id", eq(site_id)),
            ("name", eq(name)),
            ("order", "created_at.desc".to_string()),
            ("limit", "1".to_string()),
        ])
        .await
    }
}

#[async_trait]
impl TimelineStore for RestBackend {
    async fn fetch_timeline(&self, instance_id: &str, limit: usize) -> Result<Vec<Value>> {
        self.select(
            FeedTable::Logs.as_str(),
            &[
                ("instance_id", eq(instance_id)),
                ("order", "created_at.desc".to_string()),
                ("limit", limit.to_string()),
            ],
        )
        .await
    }

    async fn fetch_plans(&self, instance_id: &str) -> Result<Vec<Value>> {
        self.select(
            FeedTable::Plans.as_str(),
            &[
                ("instance_id", eq(instance_id)),
                ("order", "created_at.asc".to_string()),
            ],
        )
        .await
    }
}

#[async_trait]
impl PlanStore for RestBackend {
    async fn update_plan_status(&self, plan_id: &str, status: PlanStatus) -> Result<()> {
        self.patch_plan(plan_id, json!({ "status": status.as_str() }))
            .await
    }

    async fn update_plan_steps(&self, plan_id: &str, steps: Value) -> Result<()> {
        self.patch_plan(plan_id, json!({ "steps": steps })).await
    }
}

#[async_trait]
impl ChangeFeed for RestBackend {
    async fn subscribe(&self, instance_id: &str) -> Result<FeedReceiver> {
        let (tx, rx) = mpsc::channel(FEED_CHANNEL_CAPACITY);
        let backend = self.clone();
        let instance_id = instance_id.to_string();

        tokio::spawn(async move {
            let mut baseline = FeedBaseline::default();

            while !tx.is_closed() {
                match backend.snapshot(&instance_id).await {
                    Ok((log_rows, plan_rows)) => {
                        for event in baseline.advance(&log_rows, &plan_rows) {
                            if tx.send(Ok(event)).await.is_err() {
                                break;
                            }
                        }
                    }
                    Err(e) => {
                        tracing::warn!(instance = %instance_id, error = %e, "Feed poll failed");
                        baseline.forget_logs();
                        if tx.send(Err(Error::Feed(e.to_string()))).await.is_err() {
                            break;
                        }
                    }
                }
                tokio::time::sleep(backend.feed_interval).await;
            }
            tracing::debug!(instance = %instance_id, "REST feed stopped");
        });

        Ok(rx)
    }
}

/// Last rows seen by the polling feed, per table.
///
/// The first snapshot only sets the baseline since the page load already
/// covers it.
#[derive(Debug, Default)]
pub struct FeedBaseline {
    logs: Option<HashMap<String, Value>>,
    plans: Option<HashMap<String, Value>>,
}

impl FeedBaseline {
    /// Events since the previous snapshot; `log_rows` becomes the new baseline.
    pub fn advance(&mut self, log_rows: &[Value], plan_rows: &[Value]) -> Vec<FeedEvent> {
        let mut events = Vec::new();
        let log_window_full = log_rows.len() >= FEED_LOG_WINDOW;
        if let Some(previous) = &self.logs {
            events.extend(diff_snapshot(
                FeedTable::Logs,
                previous,
                log_rows,
                !log_window_full,
            ));
        }
        if let Some(previous) = &self.plans {
            events.extend(diff_snapshot(FeedTable::Plans, previous, plan_rows, true));
        }
        self.logs = Some(index_rows(log_rows));
        self.plans = Some(index_rows(plan_rows));
        events
    }

    /// A feed error empties the subscriber's timeline, so the next snapshot
    /// re-sends every log row as an insert.
    pub fn forget_logs(&mut self) {
        self.logs = Some(HashMap::new());
    }
}

/// Events that turn `previous` into `current`.
///
/// Deletes are only reported when `current` is the complete table for the
/// instance; otherwise a row leaving the window would look deleted.
pub fn diff_snapshot(
    table: FeedTable,
    previous: &HashMap<String, Value>,
    current: &[Value],
    report_deletes: bool,
) -> Vec<FeedEvent> {
    let mut events = Vec::new();
    for row in current {
        let Some(id) = row_id(row) else {
            continue;
        };
        match previous.get(&id) {
            None => events.push(FeedEvent::Insert {
                table,
                row: row.clone(),
            }),
            Some(old) if old != row => events.push(FeedEvent::Update {
                table,
                row: row.clone(),
            }),
            Some(_) => {}
        }
    }

    if report_deletes {
        let current_ids: Vec<String> = current.iter().filter_map(row_id).collect();
        let mut deleted: Vec<&String> = previous
            .keys()
            .filter(|id| !current_ids.contains(id))
            .collect();
        deleted.sort();
        events.extend(deleted.into_iter().map(|id| FeedEvent::Delete {
            table,
            id: id.clone(),
        }));
    }
    events
}

fn index_rows(rows: &[Value]) -> HashMap<String, Value> {
    rows.iter()
        .filter_map(|row| row_id(row).map(|id| (id, row.clone())))
        .collect()
}

fn eq(value: &str) -> String {
    format!("eq.{}", value)
}

async fn ensure_success(response: reqwest::Response) -> Result<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let error_text = response
        .text()
        .await
        .unwrap_or_else(|_| "unknown".to_string());
    Err(api_error(status, &error_text))
}

async fn parse_json<T: DeserializeOwned>(response: reqwest::Response) -> Result<T> {
    let response = ensure_success(response).await?;
    Ok(response.json().await?)
}

fn api_error(status: reqwest::StatusCode, body: &str) -> Error {
    // PostgREST errors carry a human-readable `message`.
    let message = serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|v| {
            v.get("message")
                .or_else(|| v.get("error"))
                .and_then(Value::as_str)
                .map(str::to_string)
        })
        .unwrap_or_else(|| body.to_string());
    Error::Backend(format!("API error ({}): {}", status, message))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backend_config() -> BackendConfig {
        BackendConfig {
            url: Some("https://project.example.co/rest/v1".to_string()),
            api_key: Some("anon-key".to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn test_client_requires_valid_config() {
        assert!(RestBackend::new(&BackendConfig::default()).is_err());
    }

    #[test]
    fn test_client_with_valid_config() {
        let backend = RestBackend::new(&backend_config()).unwrap();
        assert_eq!(
            backend.table_url("instance_logs"),
            "https://project.example.co/rest/v1/instance_logs"
        );
        assert_eq!(backend.actions_url, "https://project.example.co/rest/v1/actions");
    }

    #[test]
    fn test_diff_snapshot() {
        let previous = index_rows(&[
            json!({"id": "a", "message": "one"}),
            json!({"id": "b", "message": "two"}),
            json!({"id": "c", "message": "three"}),
        ]);
        let current = vec![
            json!({"id": "a", "message": "one"}),
            json!({"id": "b", "message": "two, edited"}),
            json!({"id": "d", "message": "four"}),
        ];

        let events = diff_snapshot(FeedTable::Logs, &previous, &current, true);

        assert_eq!(
            events,
            vec![
                FeedEvent::Update {
                    table: FeedTable::Logs,
                    row: json!({"id": "b", "message": "two, edited"}),
                },
                FeedEvent::Insert {
                    table: FeedTable::Logs,
                    row: json!({"id": "d", "message": "four"}),
                },
                FeedEvent::Delete {
                    table: FeedTable::Logs,
                    id: "c".to_string(),
                },
            ]
        );

        let events = diff_snapshot(FeedTable::Logs, &previous, &current, false);
        assert_eq!(events.len(), 2);
    }

    #[test]
    fn test_feed_baseline_replays_logs_after_error() {
        let logs = vec![
            json!({"id": "L1", "message": "started"}),
            json!({"id": "L2", "message": "navigated"}),
        ];
        let plans = vec![json!({"id": "p1", "status": "pending"})];
        let mut baseline = FeedBaseline::default();

        assert!(baseline.advance(&logs, &plans).is_empty());
        assert!(baseline.advance(&logs, &plans).is_empty());

        baseline.forget_logs();
        let events = baseline.advance(&logs, &plans);

        assert_eq!(events.len(), 2);
        assert!(events
            .iter()
            .all(|e| matches!(e, FeedEvent::Insert { table: FeedTable::Logs, .. })));
        assert!(baseline.advance(&logs, &plans).is_empty());
    }

    #[test]
    fn test_api_error_prefers_message_field() {
        let err = api_error(
            reqwest::StatusCode::BAD_REQUEST,
            r#"{"message": "site not found", "code": "PGRST116"}"#,
        );
        assert_eq!(err.to_string(), "API error (400 Bad Request): site not found");

        let err = api_error(reqwest::StatusCode::BAD_GATEWAY, "upstream down");
        assert!(err.to_string().contains("upstream down"));
    }
}
