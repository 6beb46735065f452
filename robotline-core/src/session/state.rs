//! Session-scoped state shared by the coordinator's components.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};

use serde_json::Value;

use super::optimistic::OptimisticBuffer;
use super::timeline::Timeline;
use crate::types::{InstanceIdentity, InstancePlan};

/// Who the console is talking to and on whose behalf.
///
/// Outbound actions read `site_id`, `user_id`, `activity` and `context` from
/// here. `active` is written only by `SessionCoordinator::open_instance`.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionContext {
    pub active: InstanceIdentity,
    pub site_id: String,
    pub user_id: Option<String>,
    /// Activity kind forwarded with actions
    pub activity: String,
    /// Extra context serialized into outbound requests
    pub context: Option<Value>,
}

impl SessionContext {
    pub fn new(site_id: impl Into<String>, activity: impl Into<String>) -> Self {
        Self {
            active: InstanceIdentity::Pending,
            site_id: site_id.into(),
            user_id: None,
            activity: activity.into(),
            context: None,
        }
    }

    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn with_context(mut self, context: Value) -> Self {
        self.context = Some(context);
        self
    }

    /// `context` as the JSON string the action API expects
    pub fn serialized_context(&self) -> Option<String> {
        self.context.as_ref().map(Value::to_string)
    }
}

/// Mutable state for the active instance.
#[derive(Debug)]
pub struct SessionState {
    pub context: SessionContext,
    pub timeline: Timeline,
    pub buffer: OptimisticBuffer,
    pub plans: Vec<InstancePlan>,
    /// Step ids the user collapsed locally
    pub collapsed_steps: HashSet<String>,
    /// An instance page is being fetched
    pub loading: bool,
    /// A send is in flight; further sends are refused
    pub sending: bool,
    /// Bumped on every identity change so late results can be dropped
    pub epoch: u64,
}

impl SessionState {
    pub fn new(context: SessionContext) -> Self {
        Self {
            context,
            timeline: Timeline::new(),
            buffer: OptimisticBuffer::new(),
            plans: Vec::new(),
            collapsed_steps: HashSet::new(),
            loading: false,
            sending: false,
            epoch: 0,
        }
    }

    /// Switch to `identity`, dropping everything owned by the previous one.
    /// Returns the new epoch.
    pub fn reset_for(&mut self, identity: InstanceIdentity) -> u64 {
        self.context.active = identity;
        self.timeline.clear();
        self.buffer.reset();
        self.plans.clear();
        self.collapsed_steps.clear();
        self.loading = false;
        self.epoch += 1;
        self.epoch
    }

    /// Whether `identity` at `epoch` is still the active session
    pub fn is_current(&self, identity: &InstanceIdentity, epoch: u64) -> bool {
        self.epoch == epoch && &self.context.active == identity
    }
}

/// Handle to [`SessionState`] shared between the coordinator and its tasks.
///
/// The lock is never held across an `.await`.
#[derive(Debug, Clone)]
pub struct SharedSession {
    inner: Arc<Mutex<SessionState>>,
}

impl SharedSession {
    pub fn new(state: SessionState) -> Self {
        Self {
            inner: Arc::new(Mutex::new(state)),
        }
    }

    pub fn lock(&self) -> MutexGuard<'_, SessionState> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_reset_bumps_epoch_and_clears() {
        let mut state = SessionState::new(SessionContext::new("site-1", "robot"));
        state.loading = true;
        state.collapsed_steps.insert("s1".to_string());

        let epoch = state.reset_for(InstanceIdentity::assigned("abc"));

        assert_eq!(epoch, 1);
        assert!(!state.loading);
        assert!(state.collapsed_steps.is_empty());
        assert!(state.is_current(&InstanceIdentity::assigned("abc"), 1));
        assert!(!state.is_current(&InstanceIdentity::assigned("abc"), 0));
        assert!(!state.is_current(&InstanceIdentity::Pending, 1));
    }

    #[test]
    fn test_serialized_context() {
        let context = SessionContext::new("site-1", "robot").with_context(json!({"page": "home"}));
        assert_eq!(
            context.serialized_context().as_deref(),
            Some(r#"{"page":"home"}"#)
        );
    }
}
