//! In-process backend
//!
//! Implements every collaborator trait against plain in-memory tables so the
//! coordinator can run without a network. Tests script instance status
//! sequences, inject failures, and push feed events through it.

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;

use super::{
    ActionApi, ActionResponse, ChangeFeed, CreateInstanceRequest, FeedReceiver, InstanceDirectory,
    PlanStore, SendMessageRequest, TimelineStore, FEED_CHANNEL_CAPACITY,
};
use crate::error::{Error, Result};
use crate::normalize::row_id;
use crate::types::{FeedEvent, FeedTable, InstanceRecord, InstanceStatus, PlanStatus};

#[derive(Debug)]
struct ScriptedInstance {
    id: String,
    name: Option<String>,
    site_id: Option<String>,
    /// Upcoming statuses; the last one repeats forever
    statuses: VecDeque<InstanceStatus>,
    current: InstanceStatus,
}

impl ScriptedInstance {
    fn next_record(&mut self) -> InstanceRecord {
        if let Some(status) = self.statuses.pop_front() {
            self.current = status;
        }
        InstanceRecord {
            id: self.id.clone(),
            name: self.name.clone(),
            status: self.current.clone(),
            created_at: None,
        }
    }
}

#[derive(Default)]
struct MemoryState {
    instances: Vec<ScriptedInstance>,
    logs: HashMap<String, Vec<Value>>,
    plans: HashMap<String, Vec<Value>>,
    subscribers: HashMap<String, Vec<mpsc::Sender<Result<FeedEvent>>>>,

    sent: Vec<SendMessageRequest>,
    created: Vec<CreateInstanceRequest>,
    send_response: Option<ActionResponse>,
    create_response: Option<ActionResponse>,
    send_failure: Option<Error>,
    create_failure: Option<Error>,

    status_queries: usize,
    fail_status_queries: bool,
    fail_subscribe: bool,
    fail_plan_updates: bool,
    timeline_delay: Option<Duration>,
    plan_status_updates: Vec<(String, PlanStatus)>,
    plan_step_updates: Vec<(String, Value)>,
}

/// Scriptable backend that lives entirely in memory
#[derive(Default)]
pub struct MemoryBackend {
    state: Mutex<MemoryState>,
}

impl std::fmt::Debug for MemoryBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.lock();
        f.debug_struct("MemoryBackend")
            .field("instances", &state.instances.len())
            .field("sent", &state.sent.len())
            .field("created", &state.created.len())
            .finish()
    }
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    // ------------------------------------------------------------------
    // Scripting
    // ------------------------------------------------------------------

    /// Register `id` with a status sequence returned one per query.
    pub fn script_instance(&self, id: &str, statuses: &[InstanceStatus]) {
        self.add_instance(id, None, None, statuses);
    }

    /// Register an instance that can be found by `(site_id, name)`.
    pub fn script_named_instance(
        &self,
        site_id: &str,
        name: &str,
        id: &str,
        statuses: &[InstanceStatus],
    ) {
        self.add_instance(id, Some(name), Some(site_id), statuses);
    }

    fn add_instance(
        &self,
        id: &str,
        name: Option<&str>,
        site_id: Option<&str>,
        statuses: &[InstanceStatus],
    ) {
        let mut state = self.lock();
        state.instances.retain(|i| i.id != id);
        state.instances.push(ScriptedInstance {
            id: id.to_string(),
            name: name.map(str::to_string),
            site_id: site_id.map(str::to_string),
            statuses: statuses.iter().cloned().collect(),
            current: InstanceStatus::Pending,
        });
    }

    pub fn fail_status_queries(&self, fail: bool) {
        self.lock().fail_status_queries = fail;
    }

    pub fn status_query_count(&self) -> usize {
        self.lock().status_queries
    }

    pub fn set_send_response(&self, response: ActionResponse) {
        self.lock().send_response = Some(response);
    }

    pub fn set_create_response(&self, response: ActionResponse) {
        self.lock().create_response = Some(response);
    }

    /// The next `send_message` call fails with `error`.
    pub fn fail_next_send(&self, error: Error) {
        self.lock().send_failure = Some(error);
    }

    /// The next `create_instance` call fails with `error`.
    pub fn fail_next_create(&self, error: Error) {
        self.lock().create_failure = Some(error);
    }

    pub fn fail_subscribe(&self, fail: bool) {
        self.lock().fail_subscribe = fail;
    }

    pub fn fail_plan_updates(&self, fail: bool) {
        self.lock().fail_plan_updates = fail;
    }

    /// Page loads wait `delay` before reading the log table.
    pub fn delay_timeline(&self, delay: Duration) {
        self.lock().timeline_delay = Some(delay);
    }

    // ------------------------------------------------------------------
    // Recorded traffic
    // ------------------------------------------------------------------

    pub fn sent_messages(&self) -> Vec<SendMessageRequest> {
        self.lock().sent.clone()
    }

    pub fn created_instances(&self) -> Vec<CreateInstanceRequest> {
        self.lock().created.clone()
    }

    pub fn plan_status_updates(&self) -> Vec<(String, PlanStatus)> {
        self.lock().plan_status_updates.clone()
    }

    pub fn plan_step_updates(&self) -> Vec<(String, Value)> {
        self.lock().plan_step_updates.clone()
    }

    /// Live subscriptions for `instance_id`
    pub fn subscriber_count(&self, instance_id: &str) -> usize {
        self.lock()
            .subscribers
            .get(instance_id)
            .map_or(0, |subs| subs.iter().filter(|tx| !tx.is_closed()).count())
    }

    // ------------------------------------------------------------------
    // Table contents
    // ------------------------------------------------------------------

    /// Store log rows without notifying subscribers.
    pub fn seed_logs(&self, instance_id: &str, rows: Vec<Value>) {
        self.lock()
            .logs
            .entry(instance_id.to_string())
            .or_default()
            .extend(rows);
    }

    /// Store plan rows without notifying subscribers.
    pub fn seed_plans(&self, instance_id: &str, rows: Vec<Value>) {
        self.lock()
            .plans
            .entry(instance_id.to_string())
            .or_default()
            .extend(rows);
    }

    pub fn insert_log(&self, instance_id: &str, row: Value) {
        self.upsert(instance_id, FeedTable::Logs, row, true);
    }

    pub fn update_log(&self, instance_id: &str, row: Value) {
        self.upsert(instance_id, FeedTable::Logs, row, false);
    }

    pub fn delete_log(&self, instance_id: &str, id: &str) {
        self.delete(instance_id, FeedTable::Logs, id);
    }

    pub fn insert_plan(&self, instance_id: &str, row: Value) {
        self.upsert(instance_id, FeedTable::Plans, row, true);
    }

    pub fn update_plan(&self, instance_id: &str, row: Value) {
        self.upsert(instance_id, FeedTable::Plans, row, false);
    }

    pub fn delete_plan(&self, instance_id: &str, id: &str) {
        self.delete(instance_id, FeedTable::Plans, id);
    }

    /// Deliver a transport error to every subscriber of `instance_id`.
    pub fn break_feed(&self, instance_id: &str, message: &str) {
        let mut state = self.lock();
        deliver(&mut state, instance_id, || {
            Err(Error::Feed(message.to_string()))
        });
    }

    fn upsert(&self, instance_id: &str, table: FeedTable, row: Value, insert: bool) {
        let mut state = self.lock();
        let rows = match table {
            FeedTable::Logs => state.logs.entry(instance_id.to_string()).or_default(),
            FeedTable::Plans => state.plans.entry(instance_id.to_string()).or_default(),
        };
        let id = row_id(&row);
        match rows.iter_mut().find(|r| id.is_some() && row_id(r) == id) {
            Some(existing) => *existing = row.clone(),
            None => rows.push(row.clone()),
        }

        deliver(&mut state, instance_id, || {
            Ok(if insert {
                FeedEvent::Insert {
                    table,
                    row: row.clone(),
                }
            } else {
                FeedEvent::Update {
                    table,
                    row: row.clone(),
                }
            })
        });
    }

    fn delete(&self, instance_id: &str, table: FeedTable, id: &str) {
        let mut state = self.lock();
        let rows = match table {
            FeedTable::Logs => state.logs.get_mut(instance_id),
            FeedTable::Plans => state.plans.get_mut(instance_id),
        };
        if let Some(rows) = rows {
            rows.retain(|r| row_id(r).as_deref() != Some(id));
        }
        deliver(&mut state, instance_id, || {
            Ok(FeedEvent::Delete {
                table,
                id: id.to_string(),
            })
        });
    }
}

fn deliver(
    state: &mut MemoryState,
    instance_id: &str,
    event: impl Fn() -> Result<FeedEvent>,
) {
    let Some(subscribers) = state.subscribers.get_mut(instance_id) else {
        return;
    };
    subscribers.retain(|tx| match tx.try_send(event()) {
        Ok(()) => true,
        Err(mpsc::error::TrySendError::Full(_)) => {
            tracing::warn!(instance = %instance_id, "Feed subscriber is full, dropping event");
            true
        }
        Err(mpsc::error::TrySendError::Closed(_)) => false,
    });
}

#[async_trait]
impl ActionApi for MemoryBackend {
    async fn send_message(&self, request: SendMessageRequest) -> Result<ActionResponse> {
        let mut state = self.lock();
        state.sent.push(request.clone());
        if let Some(error) = state.send_failure.take() {
            return Err(error);
        }
        Ok(state.send_response.clone().unwrap_or(ActionResponse {
            instance_id: Some(request.instance_id),
            status: None,
            error: None,
        }))
    }

    async fn create_instance(&self, request: CreateInstanceRequest) -> Result<ActionResponse> {
        let mut state = self.lock();
        state.created.push(request);
        if let Some(error) = state.create_failure.take() {
            return Err(error);
        }
        Ok(state.create_response.clone().unwrap_or(ActionResponse {
            instance_id: None,
            status: Some(InstanceStatus::Starting.as_str().to_string()),
            error: None,
        }))
    }
}

#[async_trait]
impl InstanceDirectory for MemoryBackend {
    async fn instance_status(&self, instance_id: &str) -> Result<Option<InstanceRecord>> {
        let mut state = self.lock();
        state.status_queries += 1;
        if state.fail_status_queries {
            return Err(Error::Backend("status query failed".to_string()));
        }
        Ok(state
            .instances
            .iter_mut()
            .find(|i| i.id == instance_id)
            .map(ScriptedInstance::next_record))
    }

    async fn find_instance_by_name(
        &self,
        site_id: &str,
        name: &str,
    ) -> Result<Option<InstanceRecord>> {
        let mut state = self.lock();
        state.status_queries += 1;
        if state.fail_status_queries {
            return Err(Error::Backend("status query failed".to_string()));
        }
        Ok(state
            .instances
            .iter_mut()
            .rev()
            .find(|i| i.site_id.as_deref() == Some(site_id) && i.name.as_deref() == Some(name))
            .map(ScriptedInstance::next_record))
    }
}

#[async_trait]
impl TimelineStore for MemoryBackend {
    async fn fetch_timeline(&self, instance_id: &str, limit: usize) -> Result<Vec<Value>> {
        let delay = self.lock().timeline_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let state = self.lock();
        let rows = state.logs.get(instance_id).cloned().unwrap_or_default();
        let skip = rows.len().saturating_sub(limit);
        Ok(rows.into_iter().skip(skip).collect())
    }

    async fn fetch_plans(&self, instance_id: &str) -> Result<Vec<Value>> {
        Ok(self
            .lock()
            .plans
            .get(instance_id)
            .cloned()
            .unwrap_or_default())
    }
}

#[async_trait]
impl PlanStore for MemoryBackend {
    async fn update_plan_status(&self, plan_id: &str, status: PlanStatus) -> Result<()> {
        let mut state = self.lock();
        if state.fail_plan_updates {
            return Err(Error::Backend("plan update rejected".to_string()));
        }
        state
            .plan_status_updates
            .push((plan_id.to_string(), status));
        Ok(())
    }

    async fn update_plan_steps(&self, plan_id: &str, steps: Value) -> Result<()> {
        let mut state = self.lock();
        if state.fail_plan_updates {
            return Err(Error::Backend("plan update rejected".to_string()));
        }
        state.plan_step_updates.push((plan_id.to_string(), steps));
        Ok(())
    }
}

#[async_trait]
impl ChangeFeed for MemoryBackend {
    async fn subscribe(&self, instance_id: &str) -> Result<FeedReceiver> {
        let mut state = self.lock();
        if state.fail_subscribe {
            return Err(Error::Feed("subscription refused".to_string()));
        }
        let (tx, rx) = mpsc::channel(FEED_CHANNEL_CAPACITY);
        state
            .subscribers
            .entry(instance_id.to_string())
            .or_default()
            .push(tx);
        tracing::debug!(instance = %instance_id, "Memory feed subscribed");
        Ok(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_scripted_status_repeats_last() {
        let backend = MemoryBackend::new();
        backend.script_instance("a", &[InstanceStatus::Pending, InstanceStatus::Running]);

        let mut seen = Vec::new();
        for _ in 0..3 {
            let record = backend.instance_status("a").await.unwrap().unwrap();
            seen.push(record.status);
        }

        assert_eq!(
            seen,
            vec![
                InstanceStatus::Pending,
                InstanceStatus::Running,
                InstanceStatus::Running
            ]
        );
        assert!(backend.instance_status("missing").await.unwrap().is_none());
        assert_eq!(backend.status_query_count(), 4);
    }

    #[tokio::test]
    async fn test_feed_delivers_and_stores() {
        let backend = MemoryBackend::new();
        let mut rx = backend.subscribe("a").await.unwrap();

        backend.insert_log("a", json!({"id": "L1", "message": "hi"}));
        backend.update_log("a", json!({"id": "L1", "message": "hello"}));
        backend.delete_log("a", "L1");

        assert!(matches!(rx.recv().await, Some(Ok(FeedEvent::Insert { .. }))));
        assert!(matches!(rx.recv().await, Some(Ok(FeedEvent::Update { .. }))));
        assert!(matches!(rx.recv().await, Some(Ok(FeedEvent::Delete { .. }))));
        assert!(backend.fetch_timeline("a", 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_dropped_receivers_are_pruned() {
        let backend = MemoryBackend::new();
        let rx = backend.subscribe("a").await.unwrap();
        assert_eq!(backend.subscriber_count("a"), 1);

        drop(rx);
        backend.insert_log("a", json!({"id": "L1"}));

        assert_eq!(backend.subscriber_count("a"), 0);
    }

    #[tokio::test]
    async fn test_fetch_timeline_returns_newest_page() {
        let backend = MemoryBackend::new();
        backend.seed_logs(
            "a",
            (0..5).map(|i| json!({"id": format!("L{}", i)})).collect(),
        );

        let page = backend.fetch_timeline("a", 2).await.unwrap();

        let ids: Vec<_> = page.iter().filter_map(row_id).collect();
        assert_eq!(ids, vec!["L3", "L4"]);
    }
}
