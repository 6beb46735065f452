//! Event stream merger
//!
//! Applies change-feed events for the active instance to the local timeline
//! and plan list:
//!
//! - INSERT is skipped when the id is already present.
//! - INSERT of a user action takes the place of a matching optimistic entry
//!   when there is one.
//! - UPDATE replaces in place, keeping the local collapsed flag.
//! - DELETE removes by id.
//!
//! A qualifying inserted entry is reported as a response so the caller can
//! clear the thinking indicator.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;

use super::plans;
use super::signals::{SessionSignal, SignalSender};
use super::state::{SessionState, SharedSession};
use super::thinking::{ClearReason, ThinkingTracker};
use crate::backend::FeedReceiver;
use crate::config::SessionConfig;
use crate::error::{Error, Result};
use crate::normalize;
use crate::types::{EntryKind, FeedEvent, FeedTable, InstanceIdentity, TimelineEntry};

/// Decides whether an inserted entry is the answer the user is waiting for.
///
/// The rule is a heuristic: any non-user entry with a non-trivial body that
/// is close to the current time counts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResponsePolicy {
    /// The trimmed body must be longer than this
    pub min_chars: usize,
    /// Maximum distance between the entry timestamp and now
    pub window: Duration,
}

impl Default for ResponsePolicy {
    fn default() -> Self {
        Self {
            min_chars: 5,
            window: Duration::from_secs(60),
        }
    }
}

impl ResponsePolicy {
    pub fn from_config(config: &SessionConfig) -> Self {
        Self {
            min_chars: config.min_response_chars,
            window: config.response_window(),
        }
    }

    pub fn qualifies(&self, entry: &TimelineEntry) -> bool {
        self.qualifies_at(entry, Utc::now())
    }

    pub fn qualifies_at(&self, entry: &TimelineEntry, now: DateTime<Utc>) -> bool {
        if entry.is_user_action() {
            return false;
        }
        if entry.message.trim().chars().count() <= self.min_chars {
            return false;
        }
        let distance = (now - entry.created_at).abs();
        match distance.to_std() {
            Ok(distance) => distance <= self.window,
            Err(_) => false,
        }
    }
}

/// Decides which entries start out collapsed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CollapsePolicy {
    /// System messages longer than this collapse
    pub threshold: usize,
}

impl Default for CollapsePolicy {
    fn default() -> Self {
        Self { threshold: 200 }
    }
}

impl CollapsePolicy {
    pub fn should_collapse(&self, entry: &TimelineEntry) -> bool {
        if entry.kind == EntryKind::SystemMessage && entry.message.chars().count() > self.threshold
        {
            return true;
        }
        entry.is_tool_bearing()
    }

    pub fn apply(&self, entry: &mut TimelineEntry) {
        entry.collapsed = self.should_collapse(entry);
    }
}

/// What a single event did to local state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeAction {
    Appended,
    /// Took the place of an optimistic entry at this index
    Reconciled { index: usize },
    /// Already present, skipped
    Duplicate,
    Replaced,
    /// Update or delete for an id we do not have
    Missing,
    Removed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MergeOutcome {
    pub table: FeedTable,
    pub action: MergeAction,
    /// The event is a qualifying response
    pub response: bool,
}

impl MergeOutcome {
    fn new(table: FeedTable, action: MergeAction) -> Self {
        Self {
            table,
            action,
            response: false,
        }
    }

    /// Local state was modified
    pub fn changed(&self) -> bool {
        !matches!(self.action, MergeAction::Duplicate | MergeAction::Missing)
    }
}

#[derive(Debug, Clone, Default)]
pub struct EventStreamMerger {
    response: ResponsePolicy,
    collapse: CollapsePolicy,
}

impl EventStreamMerger {
    pub fn new(response: ResponsePolicy, collapse: CollapsePolicy) -> Self {
        Self { response, collapse }
    }

    pub fn from_config(config: &SessionConfig) -> Self {
        Self::new(
            ResponsePolicy::from_config(config),
            CollapsePolicy {
                threshold: config.collapse_threshold_chars,
            },
        )
    }

    pub fn collapse_policy(&self) -> &CollapsePolicy {
        &self.collapse
    }

    /// Apply one feed event to `state`.
    pub fn apply(&self, state: &mut SessionState, event: &FeedEvent) -> Result<MergeOutcome> {
        match event.table() {
            FeedTable::Logs => self.apply_log(state, event),
            FeedTable::Plans => self.apply_plan(state, event),
        }
    }

    fn apply_log(&self, state: &mut SessionState, event: &FeedEvent) -> Result<MergeOutcome> {
        let table = FeedTable::Logs;
        match event {
            FeedEvent::Insert { row, .. } => {
                let mut entry = normalize::timeline_entry(row)?;
                self.collapse.apply(&mut entry);
                let response = self.response.qualifies(&entry);

                let action = if state.timeline.contains(&entry.id) {
                    tracing::debug!(id = %entry.id, "Skipping duplicate timeline entry");
                    MergeAction::Duplicate
                } else if entry.is_user_action() {
                    let SessionState {
                        buffer, timeline, ..
                    } = &mut *state;
                    match buffer.reconcile(timeline, entry) {
                        Ok(index) => MergeAction::Reconciled { index },
                        Err(entry) => push_or_skip(state, entry),
                    }
                } else {
                    push_or_skip(state, entry)
                };

                Ok(MergeOutcome {
                    table,
                    action,
                    response: response && action == MergeAction::Appended,
                })
            }
            FeedEvent::Update { row, .. } => {
                let mut entry = normalize::timeline_entry(row)?;
                match state.timeline.position(&entry.id) {
                    Some(index) => {
                        entry.collapsed = state.timeline.entries()[index].collapsed;
                        state.timeline.replace_at(index, entry);
                        Ok(MergeOutcome::new(table, MergeAction::Replaced))
                    }
                    None => {
                        tracing::debug!(id = %entry.id, "Update for unknown timeline entry");
                        Ok(MergeOutcome::new(table, MergeAction::Missing))
                    }
                }
            }
            FeedEvent::Delete { id, .. } => {
                let action = match state.timeline.remove(id) {
                    Some(_) => MergeAction::Removed,
                    None => MergeAction::Missing,
                };
                Ok(MergeOutcome::new(table, action))
            }
        }
    }

    fn apply_plan(&self, state: &mut SessionState, event: &FeedEvent) -> Result<MergeOutcome> {
        let table = FeedTable::Plans;
        let action = match event {
            FeedEvent::Insert { row, .. } | FeedEvent::Update { row, .. } => {
                let plan = normalize::instance_plan(row)?;
                match state.plans.iter().position(|p| p.id == plan.id) {
                    Some(index) => {
                        state.plans[index] = plan;
                        MergeAction::Replaced
                    }
                    None => {
                        state.plans.push(plan);
                        MergeAction::Appended
                    }
                }
            }
            FeedEvent::Delete { id, .. } => {
                let before = state.plans.len();
                state.plans.retain(|p| &p.id != id);
                if state.plans.len() < before {
                    MergeAction::Removed
                } else {
                    MergeAction::Missing
                }
            }
        };
        Ok(MergeOutcome::new(table, action))
    }
}

fn push_or_skip(state: &mut SessionState, entry: TimelineEntry) -> MergeAction {
    let id = entry.id.clone();
    if state.timeline.push_unique(entry) {
        MergeAction::Appended
    } else {
        tracing::debug!(id = %id, "Skipping duplicate timeline entry");
        MergeAction::Duplicate
    }
}

/// A live feed reader for one instance. Dropping it stops the reader.
#[derive(Debug)]
pub struct FeedSubscription {
    identity: InstanceIdentity,
    handle: JoinHandle<()>,
}

impl FeedSubscription {
    pub fn identity(&self) -> &InstanceIdentity {
        &self.identity
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

impl Drop for FeedSubscription {
    fn drop(&mut self) {
        tracing::debug!(instance = %self.identity, "Tearing down feed subscription");
        self.handle.abort();
    }
}

/// Everything the feed reader task needs
pub(crate) struct FeedPump {
    pub merger: Arc<EventStreamMerger>,
    pub session: SharedSession,
    pub existing: ThinkingTracker,
    pub signals: SignalSender,
    pub identity: InstanceIdentity,
    pub epoch: u64,
}

impl FeedPump {
    pub(crate) fn spawn(self, mut receiver: FeedReceiver) -> FeedSubscription {
        let identity = self.identity.clone();
        let handle = tokio::spawn(async move {
            while let Some(item) = receiver.recv().await {
                match item {
                    Ok(event) => {
                        if !self.handle_event(&event) {
                            break;
                        }
                    }
                    Err(e) => self.handle_error(&e),
                }
            }
            tracing::debug!(instance = %self.identity, "Feed closed");
        });
        FeedSubscription { identity, handle }
    }

    /// Returns false once the session has moved on.
    fn handle_event(&self, event: &FeedEvent) -> bool {
        let result = {
            let mut state = self.session.lock();
            if !state.is_current(&self.identity, self.epoch) {
                return false;
            }
            let result = self.merger.apply(&mut state, event);
            if let Ok(outcome) = &result {
                if outcome.table == FeedTable::Plans && outcome.changed() {
                    plans::warn_on_conflicts(&state.plans);
                }
            }
            result
        };

        match result {
            Ok(outcome) => {
                if outcome.changed() {
                    self.signals.emit(match outcome.table {
                        FeedTable::Logs => SessionSignal::TimelineChanged,
                        FeedTable::Plans => SessionSignal::PlansChanged,
                    });
                }
                if outcome.table == FeedTable::Logs && outcome.action == MergeAction::Appended {
                    self.signals.emit(SessionSignal::ScrollToBottom);
                }
                if outcome.response {
                    self.existing.clear(&self.identity, ClearReason::Response);
                }
            }
            Err(e) => {
                tracing::warn!(
                    instance = %self.identity,
                    table = event.table().as_str(),
                    error = %e,
                    "Dropping malformed feed event"
                );
            }
        }
        true
    }

    fn handle_error(&self, error: &Error) {
        tracing::error!(instance = %self.identity, error = %error, "Change feed error");
        let reset = {
            let mut state = self.session.lock();
            if state.is_current(&self.identity, self.epoch) {
                state.timeline.clear();
                state.loading = false;
                true
            } else {
                false
            }
        };
        if reset {
            self.signals.emit(SessionSignal::TimelineChanged);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::state::SessionContext;
    use serde_json::json;

    fn state() -> SessionState {
        let mut state = SessionState::new(SessionContext::new("site-1", "robot"));
        state.reset_for(InstanceIdentity::assigned("abc"));
        state
    }

    fn log_row(id: &str, kind: &str, message: &str) -> serde_json::Value {
        json!({
            "id": id,
            "log_type": kind,
            "message": message,
            "created_at": Utc::now().to_rfc3339(),
        })
    }

    fn insert(row: serde_json::Value) -> FeedEvent {
        FeedEvent::Insert {
            table: FeedTable::Logs,
            row,
        }
    }

    #[test]
    fn test_insert_user_action_reconciles_optimistic_entry() {
        let merger = EventStreamMerger::default();
        let mut state = state();
        let SessionState {
            buffer, timeline, ..
        } = &mut state;
        buffer.add(timeline, "Hello", None);

        let outcome = merger
            .apply(&mut state, &insert(log_row("A1", "user_action", "Hello")))
            .unwrap();

        assert_eq!(outcome.action, MergeAction::Reconciled { index: 0 });
        assert!(!outcome.response);
        assert_eq!(state.timeline.len(), 1);
        assert_eq!(state.timeline.entries()[0].id, "A1");
    }

    #[test]
    fn test_insert_duplicate_id_is_skipped() {
        let merger = EventStreamMerger::default();
        let mut state = state();
        let event = insert(log_row("L1", "agent_action", "Looking at the page now"));

        merger.apply(&mut state, &event).unwrap();
        let outcome = merger.apply(&mut state, &event).unwrap();

        assert_eq!(outcome.action, MergeAction::Duplicate);
        assert!(!outcome.response);
        assert_eq!(state.timeline.len(), 1);
    }

    #[test]
    fn test_repeated_user_insert_keeps_pending_temporary() {
        let merger = EventStreamMerger::default();
        let mut state = state();
        let event = insert(log_row("A1", "user_action", "ok"));
        merger.apply(&mut state, &event).unwrap();
        let SessionState {
            buffer, timeline, ..
        } = &mut state;
        let temp = buffer.add(timeline, "ok", None);

        let outcome = merger.apply(&mut state, &event).unwrap();

        assert_eq!(outcome.action, MergeAction::Duplicate);
        let ids: Vec<_> = state.timeline.iter().map(|e| e.id.as_str()).collect();
        assert_eq!(ids, vec!["A1", temp.id.as_str()]);
    }

    #[test]
    fn test_agent_insert_is_response() {
        let merger = EventStreamMerger::default();
        let mut state = state();

        let outcome = merger
            .apply(&mut state, &insert(log_row("L1", "agent_action", "On it, opening the site")))
            .unwrap();

        assert!(outcome.response);
    }

    #[test]
    fn test_response_policy_rules() {
        let policy = ResponsePolicy::default();
        let now = Utc::now();
        let mut entry = normalize::timeline_entry(&log_row("L1", "system", "ok")).unwrap();
        entry.created_at = now;
        assert!(!policy.qualifies_at(&entry, now), "too short");

        entry.message = "  12345  ".to_string();
        assert!(!policy.qualifies_at(&entry, now), "exactly five chars");

        entry.message = "123456".to_string();
        assert!(policy.qualifies_at(&entry, now));

        entry.created_at = now - chrono::Duration::seconds(61);
        assert!(!policy.qualifies_at(&entry, now), "stale");

        entry.created_at = now;
        entry.kind = EntryKind::UserAction;
        assert!(!policy.qualifies_at(&entry, now), "user action");
    }

    #[test]
    fn test_collapse_policy() {
        let policy = CollapsePolicy::default();
        let short = normalize::timeline_entry(&log_row("L1", "system", "short")).unwrap();
        assert!(!policy.should_collapse(&short));

        let long = normalize::timeline_entry(&log_row("L2", "system", &"x".repeat(201))).unwrap();
        assert!(policy.should_collapse(&long));

        let tool = normalize::timeline_entry(&json!({
            "id": "L3",
            "log_type": "tool_call",
            "message": "",
            "tool_name": "browser",
            "tool_result": {"url": "https://example.com"},
        }))
        .unwrap();
        assert!(policy.should_collapse(&tool));

        let bare_tool = normalize::timeline_entry(&json!({
            "id": "L4",
            "log_type": "tool_call",
            "tool_name": "browser",
        }))
        .unwrap();
        assert!(!policy.should_collapse(&bare_tool));
    }

    #[test]
    fn test_update_keeps_position_and_collapsed_flag() {
        let merger = EventStreamMerger::default();
        let mut state = state();
        merger
            .apply(&mut state, &insert(log_row("L1", "system", &"x".repeat(300))))
            .unwrap();
        merger
            .apply(&mut state, &insert(log_row("L2", "system", "second")))
            .unwrap();

        let outcome = merger
            .apply(
                &mut state,
                &FeedEvent::Update {
                    table: FeedTable::Logs,
                    row: log_row("L1", "system", "edited"),
                },
            )
            .unwrap();

        assert_eq!(outcome.action, MergeAction::Replaced);
        assert_eq!(state.timeline.entries()[0].message, "edited");
        assert!(state.timeline.entries()[0].collapsed);
    }

    #[test]
    fn test_delete_and_missing() {
        let merger = EventStreamMerger::default();
        let mut state = state();
        merger
            .apply(&mut state, &insert(log_row("L1", "system", "hello")))
            .unwrap();

        let delete = |id: &str| FeedEvent::Delete {
            table: FeedTable::Logs,
            id: id.to_string(),
        };
        assert_eq!(
            merger.apply(&mut state, &delete("L1")).unwrap().action,
            MergeAction::Removed
        );
        assert_eq!(
            merger.apply(&mut state, &delete("L1")).unwrap().action,
            MergeAction::Missing
        );
        assert!(state.timeline.is_empty());
    }

    #[test]
    fn test_plan_events_upsert_and_remove() {
        let merger = EventStreamMerger::default();
        let mut state = state();
        let plan = |status: &str| FeedEvent::Update {
            table: FeedTable::Plans,
            row: json!({"id": "p1", "title": "Audit", "status": status}),
        };

        assert_eq!(
            merger.apply(&mut state, &plan("pending")).unwrap().action,
            MergeAction::Appended
        );
        assert_eq!(
            merger.apply(&mut state, &plan("in_progress")).unwrap().action,
            MergeAction::Replaced
        );
        assert_eq!(state.plans.len(), 1);

        merger
            .apply(
                &mut state,
                &FeedEvent::Delete {
                    table: FeedTable::Plans,
                    id: "p1".to_string(),
                },
            )
            .unwrap();
        assert!(state.plans.is_empty());
    }

    #[test]
    fn test_malformed_row_is_an_error() {
        let merger = EventStreamMerger::default();
        let mut state = state();
        let result = merger.apply(&mut state, &insert(json!({"message": "no id"})));
        assert!(matches!(result, Err(Error::Payload { .. })));
        assert!(state.timeline.is_empty());
    }
}
