//! The instance session coordinator
//!
//! Owns the session state for one console and wires the components together:
//! sends go through the optimistic buffer and a thinking tracker, feed events
//! go through the merger, and instance start-up goes through the poller.
//!
//! Nothing here returns a transport error to the caller of
//! [`SessionCoordinator::send_message`]; failures become notices and the
//! session returns to idle.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::task::JoinHandle;

use super::groups::{group_tool_calls, TimelineItem};
use super::merger::{EventStreamMerger, FeedPump, FeedSubscription};
use super::plans::{self, PlanBuckets};
use super::poller::{LifecyclePoller, OwnerCheck, PollOutcome, PollRequest, PollTarget};
use super::signals::{NoticeLevel, SessionSignal, SignalSender};
use super::state::{SessionContext, SessionState, SharedSession};
use super::thinking::{ClearReason, IdleHook, ThinkingScope, ThinkingTracker};
use super::timeline::Timeline;
use crate::backend::{Collaborators, CreateInstanceRequest, SendMessageRequest};
use crate::config::SessionConfig;
use crate::error::{Error, Result};
use crate::normalize;
use crate::types::{InstanceIdentity, InstancePlan, PlanStatus, PlanStep, TimelineEntry};

/// Result of [`SessionCoordinator::send_message`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendOutcome {
    /// Delivered to a running instance
    Sent,
    /// Accepted; the instance is starting and being polled
    Starting,
    Ignored(IgnoreReason),
    /// Request failed; the message is the notice that was shown
    Failed(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IgnoreReason {
    /// Blank after trimming
    Empty,
    /// Another send is still in flight
    Busy,
}

/// Everything a front end needs to render the session
#[derive(Debug, Clone, PartialEq)]
pub struct SessionSnapshot {
    pub identity: InstanceIdentity,
    pub timeline: Vec<TimelineEntry>,
    /// `timeline` with tool-call runs grouped
    pub items: Vec<TimelineItem>,
    pub plans: Vec<InstancePlan>,
    pub buckets: PlanBuckets,
    pub steps: Vec<PlanStep>,
    pub collapsed_steps: HashSet<String>,
    /// Waiting on a response from the active instance
    pub thinking: bool,
    /// Waiting on a new instance to come up
    pub bootstrapping: bool,
    pub loading: bool,
    pub sending: bool,
    /// A lifecycle poll is running
    pub starting: bool,
    /// Optimistic messages the backend has not echoed yet
    pub unconfirmed: usize,
}

struct CoordinatorInner {
    config: SessionConfig,
    backend: Collaborators,
    session: SharedSession,
    signals: SignalSender,
    existing: ThinkingTracker,
    bootstrap: ThinkingTracker,
    merger: Arc<EventStreamMerger>,
    poller: LifecyclePoller,
    subscription: Mutex<Option<FeedSubscription>>,
    poll_task: Mutex<Option<PollTask>>,
}

/// The running lifecycle poll and the identity it was started for
struct PollTask {
    owner: InstanceIdentity,
    handle: JoinHandle<()>,
    /// Aborted but possibly not unwound yet
    cancelled: bool,
}

/// Cloneable handle to one console session
#[derive(Clone)]
pub struct SessionCoordinator {
    inner: Arc<CoordinatorInner>,
}

impl std::fmt::Debug for SessionCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionCoordinator")
            .field("identity", &self.identity())
            .field("existing", &self.inner.existing)
            .field("bootstrap", &self.inner.bootstrap)
            .finish()
    }
}

impl SessionCoordinator {
    /// Build a coordinator in the `Pending` identity.
    pub fn new(config: SessionConfig, backend: Collaborators, context: SessionContext) -> Self {
        let session = SharedSession::new(SessionState::new(context));
        let signals = SignalSender::new();

        let on_idle: IdleHook = {
            let session = session.clone();
            let signals = signals.clone();
            Arc::new(move |scope, owner, reason| {
                tracing::debug!(
                    scope = scope.as_str(),
                    owner = %owner,
                    reason = reason.as_str(),
                    "Input enabled"
                );
                session.lock().sending = false;
                signals.emit(SessionSignal::InputEnabled { scope });
            })
        };

        let timeout = config.thinking_timeout();
        let existing = ThinkingTracker::new(ThinkingScope::Existing, timeout, on_idle.clone());
        let bootstrap = ThinkingTracker::new(ThinkingScope::Bootstrap, timeout, on_idle);
        let merger = Arc::new(EventStreamMerger::from_config(&config));
        let poller =
            LifecyclePoller::from_config(backend.directory.clone(), signals.clone(), &config);

        Self {
            inner: Arc::new(CoordinatorInner {
                config,
                backend,
                session,
                signals,
                existing,
                bootstrap,
                merger,
                poller,
                subscription: Mutex::new(None),
                poll_task: Mutex::new(None),
            }),
        }
    }

    pub fn subscribe_signals(&self) -> tokio::sync::broadcast::Receiver<SessionSignal> {
        self.inner.signals.subscribe()
    }

    pub fn identity(&self) -> InstanceIdentity {
        self.inner.session.lock().context.active.clone()
    }

    pub fn context(&self) -> SessionContext {
        self.inner.session.lock().context.clone()
    }

    pub fn config(&self) -> &SessionConfig {
        &self.inner.config
    }

    /// Tracker for messages sent to an existing instance
    pub fn existing_tracker(&self) -> &ThinkingTracker {
        &self.inner.existing
    }

    /// Tracker for a brand-new instance coming up
    pub fn bootstrap_tracker(&self) -> &ThinkingTracker {
        &self.inner.bootstrap
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        let (identity, timeline, plans, collapsed_steps, loading, sending, unconfirmed) = {
            let state = self.inner.session.lock();
            (
                state.context.active.clone(),
                state.timeline.entries().to_vec(),
                state.plans.clone(),
                state.collapsed_steps.clone(),
                state.loading,
                state.sending,
                state.buffer.outstanding(),
            )
        };

        SessionSnapshot {
            items: group_tool_calls(&timeline),
            buckets: plans::categorize_plans(&plans),
            steps: plans::derive_all_steps(&plans),
            thinking: self.inner.existing.is_thinking_for(&identity),
            bootstrapping: self.inner.bootstrap.is_thinking(),
            starting: self.inner.poller.is_running(),
            identity,
            timeline,
            plans,
            collapsed_steps,
            loading,
            sending,
            unconfirmed,
        }
    }

    // ------------------------------------------------------------------
    // Identity
    // ------------------------------------------------------------------

    /// Make `identity` the active instance.
    ///
    /// Tears down the previous feed, releases thinking state owned by anyone
    /// else, then subscribes and loads the newest timeline page. Results that
    /// arrive after another switch are dropped.
    pub async fn open_instance(&self, identity: InstanceIdentity) -> Result<()> {
        drop(self.subscription_slot().take());
        if let Some(task) = lock(&self.inner.poll_task).as_mut() {
            if task.owner != identity && !task.cancelled {
                tracing::debug!(owner = %task.owner, "Cancelling lifecycle poll");
                task.handle.abort();
                task.cancelled = true;
            }
        }
        self.inner.existing.release_unless(&identity);
        self.inner.bootstrap.release_unless(&identity);

        let epoch = {
            let mut state = self.inner.session.lock();
            let epoch = state.reset_for(identity.clone());
            state.loading = !identity.is_pending();
            epoch
        };
        tracing::info!(instance = %identity, epoch, "Opening instance");
        self.inner.signals.emit(SessionSignal::TimelineChanged);
        self.inner.signals.emit(SessionSignal::PlansChanged);

        let Some(instance_id) = identity.instance_id() else {
            return Ok(());
        };

        // Subscribe before loading so nothing written in between is missed.
        let receiver = match self.inner.backend.feed.subscribe(instance_id).await {
            Ok(receiver) => receiver,
            Err(e) => return Err(self.load_failed(&identity, epoch, e)),
        };
        {
            let mut slot = self.subscription_slot();
            if !self.inner.session.lock().is_current(&identity, epoch) {
                tracing::debug!(instance = %identity, "Identity changed while subscribing");
                return Ok(());
            }
            *slot = Some(
                FeedPump {
                    merger: Arc::clone(&self.inner.merger),
                    session: self.inner.session.clone(),
                    existing: self.inner.existing.clone(),
                    signals: self.inner.signals.clone(),
                    identity: identity.clone(),
                    epoch,
                }
                .spawn(receiver),
            );
        }

        let rows = match self
            .inner
            .backend
            .timeline
            .fetch_timeline(instance_id, self.inner.config.timeline_page_size)
            .await
        {
            Ok(rows) => rows,
            Err(e) => return Err(self.load_failed(&identity, epoch, e)),
        };
        let plan_rows = match self.inner.backend.timeline.fetch_plans(instance_id).await {
            Ok(rows) => rows,
            Err(e) => return Err(self.load_failed(&identity, epoch, e)),
        };

        let mut loaded = normalize::timeline_entries(&rows);
        let collapse = self.inner.merger.collapse_policy();
        for entry in &mut loaded {
            collapse.apply(entry);
        }
        let loaded_plans = normalize::instance_plans(&plan_rows);

        {
            let mut state = self.inner.session.lock();
            if !state.is_current(&identity, epoch) {
                tracing::debug!(instance = %identity, "Dropping page for inactive instance");
                return Ok(());
            }

            // Keep whatever the feed delivered while the page was loading. A
            // message sent meanwhile may already be confirmed in the page.
            let mut live = std::mem::take(&mut state.timeline);
            for entry in loaded.iter().filter(|e| e.is_user_action()) {
                if !live.contains(&entry.id) {
                    let _ = state.buffer.reconcile(&mut live, entry.clone());
                }
            }
            let mut timeline = Timeline::from_entries(loaded);
            for entry in live.into_entries() {
                timeline.push_unique(entry);
            }
            state.timeline = timeline;

            let live_plans = std::mem::replace(&mut state.plans, loaded_plans);
            for plan in live_plans {
                match state.plans.iter().position(|p| p.id == plan.id) {
                    Some(index) => state.plans[index] = plan,
                    None => state.plans.push(plan),
                }
            }
            plans::warn_on_conflicts(&state.plans);
            state.loading = false;

            tracing::info!(
                instance = %identity,
                entries = state.timeline.len(),
                plans = state.plans.len(),
                "Instance loaded"
            );
        }

        self.inner.signals.emit(SessionSignal::TimelineChanged);
        self.inner.signals.emit(SessionSignal::PlansChanged);
        self.inner.signals.emit(SessionSignal::ScrollToBottom);
        Ok(())
    }

    fn load_failed(&self, identity: &InstanceIdentity, epoch: u64, error: Error) -> Error {
        tracing::error!(instance = %identity, error = %error, "Failed to open instance");
        let current = {
            let mut state = self.inner.session.lock();
            let current = state.is_current(identity, epoch);
            if current {
                state.loading = false;
            }
            current
        };
        if current {
            self.inner.signals.notify(
                NoticeLevel::Error,
                format!("Could not load the conversation: {}", error),
            );
        }
        error
    }

    // ------------------------------------------------------------------
    // Sending
    // ------------------------------------------------------------------

    /// Send `text` to the active instance, creating one when there is none.
    pub async fn send_message(&self, text: &str) -> SendOutcome {
        let text = text.trim();
        if text.is_empty() {
            return SendOutcome::Ignored(IgnoreReason::Empty);
        }

        let context = {
            let mut state = self.inner.session.lock();
            if state.sending {
                tracing::debug!("Send ignored, another send is in flight");
                return SendOutcome::Ignored(IgnoreReason::Busy);
            }
            state.sending = true;
            let user_id = state.context.user_id.clone();
            let SessionState {
                buffer, timeline, ..
            } = &mut *state;
            buffer.add(timeline, text, user_id.as_deref());
            state.context.clone()
        };
        self.inner.signals.emit(SessionSignal::TimelineChanged);
        self.inner.signals.emit(SessionSignal::ScrollToBottom);

        match context.active.clone() {
            InstanceIdentity::Assigned(instance_id) => {
                self.send_to_existing(instance_id, text, &context).await
            }
            InstanceIdentity::Pending => self.create_instance(text, &context).await,
        }
    }

    async fn send_to_existing(
        &self,
        instance_id: String,
        text: &str,
        context: &SessionContext,
    ) -> SendOutcome {
        let owner = InstanceIdentity::assigned(instance_id.clone());
        self.inner.existing.start(owner.clone());

        let request = SendMessageRequest {
            instance_id: instance_id.clone(),
            message: text.to_string(),
            site_id: context.site_id.clone(),
            context: context.serialized_context(),
            activity: context.activity.clone(),
        };

        let response = match self.inner.backend.actions.send_message(request).await {
            Ok(response) => response,
            Err(e) => {
                tracing::warn!(instance = %instance_id, error = %e, "Send failed");
                return self.fail_send(
                    &self.inner.existing,
                    &owner,
                    format!("Message could not be sent: {}", e),
                );
            }
        };

        if let Some(error) = response.error.clone() {
            tracing::warn!(instance = %instance_id, error = %error, "Send rejected by backend");
            return self.fail_send(&self.inner.existing, &owner, error);
        }

        match response.status() {
            Some(status) if status.is_failed() => self.fail_send(
                &self.inner.existing,
                &owner,
                format!("The robot is not available (status: {})", status),
            ),
            Some(status) if !status.is_ready() => {
                tracing::info!(instance = %instance_id, status = %status, "Instance is resuming");
                self.spawn_poll(
                    PollRequest::new(
                        PollTarget::ById(instance_id),
                        self.inner.existing.clone(),
                        owner,
                    ),
                    false,
                );
                SendOutcome::Starting
            }
            _ => {
                tracing::debug!(instance = %instance_id, "Message sent");
                SendOutcome::Sent
            }
        }
    }

    async fn create_instance(&self, text: &str, context: &SessionContext) -> SendOutcome {
        let owner = InstanceIdentity::Pending;
        self.inner.bootstrap.start(owner.clone());

        let name = self.inner.config.instance_name.clone();
        let request = CreateInstanceRequest {
            site_id: context.site_id.clone(),
            user_id: context.user_id.clone(),
            activity: context.activity.clone(),
            message: text.to_string(),
            context: context.serialized_context(),
            name: name.clone(),
        };

        let response = match self.inner.backend.actions.create_instance(request).await {
            Ok(response) => response,
            Err(e) => {
                tracing::warn!(site = %context.site_id, error = %e, "Instance creation failed");
                return self.fail_send(
                    &self.inner.bootstrap,
                    &owner,
                    format!("Could not start the robot: {}", e),
                );
            }
        };

        if let Some(error) = response.error.clone() {
            tracing::warn!(site = %context.site_id, error = %error, "Instance creation rejected");
            return self.fail_send(&self.inner.bootstrap, &owner, error);
        }

        let target = match response.instance_id.filter(|id| !id.is_empty()) {
            Some(id) => PollTarget::ById(id),
            None => PollTarget::ByName {
                site_id: context.site_id.clone(),
                name,
            },
        };
        tracing::info!(poll_target = %target, "Instance requested");

        self.spawn_poll(
            PollRequest::new(target, self.inner.bootstrap.clone(), owner).navigating(),
            true,
        );
        SendOutcome::Starting
    }

    /// Surface a send failure and return the tracker to idle.
    fn fail_send(
        &self,
        tracker: &ThinkingTracker,
        owner: &InstanceIdentity,
        message: String,
    ) -> SendOutcome {
        let active = self.identity() == *owner;
        if active {
            self.inner.signals.notify(NoticeLevel::Error, message.clone());
        } else {
            tracing::debug!(owner = %owner, "Dropping failure for inactive instance");
        }

        if !tracker.clear(owner, ClearReason::Cancelled) && active {
            // Already idle (expired); the send lock may still be held.
            self.inner.session.lock().sending = false;
        }
        SendOutcome::Failed(message)
    }

    fn spawn_poll(&self, request: PollRequest, open_on_ready: bool) {
        let owner = request.owner.clone();
        let request = request.while_active(self.owner_check());

        let mut slot = lock(&self.inner.poll_task);
        let previous = match slot.take() {
            Some(task) if task.owner == owner && !task.cancelled && !task.handle.is_finished() => {
                // Keep the running loop for this owner.
                tracing::debug!(owner = %owner, "Lifecycle poll already in flight");
                *slot = Some(task);
                return;
            }
            Some(task) => {
                task.handle.abort();
                Some(task.handle)
            }
            None => None,
        };

        let coordinator = self.clone();
        let poll_owner = owner.clone();
        let handle = tokio::spawn(async move {
            // A cancelled loop releases the single-flight flag when it unwinds.
            if let Some(previous) = previous {
                let _ = previous.await;
            }
            let outcome = coordinator.inner.poller.run(request).await;
            match outcome {
                PollOutcome::Ready { instance_id, .. } if open_on_ready => {
                    coordinator.detach_poll(&poll_owner);
                    if !coordinator.identity().is_pending() {
                        tracing::debug!(instance = %instance_id, "Session moved on, not opening");
                        return;
                    }
                    let identity = InstanceIdentity::assigned(instance_id);
                    if let Err(e) = coordinator.open_instance(identity).await {
                        tracing::warn!(error = %e, "Failed to open new instance");
                    }
                }
                PollOutcome::AlreadyRunning => {
                    tracing::debug!("Lifecycle poll already in flight");
                }
                other => tracing::debug!(outcome = ?other, "Lifecycle poll finished"),
            }
        });
        *slot = Some(PollTask {
            owner,
            handle,
            cancelled: false,
        });
    }

    /// Forget the finished poll for `owner` so opening its instance does not cancel it.
    fn detach_poll(&self, owner: &InstanceIdentity) {
        let mut slot = lock(&self.inner.poll_task);
        if slot.as_ref().is_some_and(|task| &task.owner == owner) {
            slot.take();
        }
    }

    fn owner_check(&self) -> OwnerCheck {
        let session = self.inner.session.clone();
        Arc::new(move |owner| session.lock().context.active == *owner)
    }

    // ------------------------------------------------------------------
    // Plans and steps
    // ------------------------------------------------------------------

    /// Flip the local collapsed flag of a step. Returns the new state.
    pub fn toggle_step_collapse(&self, step_id: &str) -> bool {
        let collapsed = {
            let mut state = self.inner.session.lock();
            if state.collapsed_steps.remove(step_id) {
                false
            } else {
                state.collapsed_steps.insert(step_id.to_string());
                true
            }
        };
        self.inner.signals.emit(SessionSignal::PlansChanged);
        collapsed
    }

    /// Move an in-progress plan to paused.
    pub async fn pause_plan(&self, plan_id: &str) -> Result<()> {
        let plan = self.plan(plan_id)?;
        if plan.status != PlanStatus::InProgress {
            return Err(self.plan_failed(Error::InvalidPlanTransition {
                plan_id: plan_id.to_string(),
                status: plan.status.as_str(),
                action: "paused",
            }));
        }
        self.set_plan_status(plan_id, PlanStatus::Paused).await
    }

    /// Move a paused plan back to in progress.
    pub async fn resume_plan(&self, plan_id: &str) -> Result<()> {
        let plan = self.plan(plan_id)?;
        if plan.status != PlanStatus::Paused {
            return Err(self.plan_failed(Error::InvalidPlanTransition {
                plan_id: plan_id.to_string(),
                status: plan.status.as_str(),
                action: "resumed",
            }));
        }

        let others: Vec<String> = {
            let state = self.inner.session.lock();
            state
                .plans
                .iter()
                .filter(|p| p.id != plan_id && p.status == PlanStatus::InProgress)
                .map(|p| p.id.clone())
                .collect()
        };
        if !others.is_empty() {
            tracing::warn!(
                plan_id,
                in_progress = ?others,
                "Resuming a plan while another is in progress"
            );
        }

        self.set_plan_status(plan_id, PlanStatus::InProgress).await
    }

    /// Remove one step from its plan.
    pub async fn delete_step(&self, step_id: &str) -> Result<()> {
        let plan = self.plan_for_step(step_id)?;
        let steps = plans::remove_step(&plan, step_id).map_err(|e| self.plan_failed(e))?;
        self.set_plan_steps(&plan.id, steps).await?;
        self.inner.session.lock().collapsed_steps.remove(step_id);
        Ok(())
    }

    /// Change a step's title and description.
    pub async fn edit_step(
        &self,
        step_id: &str,
        title: &str,
        description: Option<&str>,
    ) -> Result<()> {
        let title = title.trim();
        if title.is_empty() {
            return Err(self.plan_failed(Error::InvalidInput(
                "step title must not be empty".to_string(),
            )));
        }
        let plan = self.plan_for_step(step_id)?;
        let steps = plans::edit_step(&plan, step_id, title, description)
            .map_err(|e| self.plan_failed(e))?;
        self.set_plan_steps(&plan.id, steps).await
    }

    fn plan(&self, plan_id: &str) -> Result<InstancePlan> {
        let found = self
            .inner
            .session
            .lock()
            .plans
            .iter()
            .find(|p| p.id == plan_id)
            .cloned();
        found.ok_or_else(|| self.plan_failed(Error::PlanNotFound(plan_id.to_string())))
    }

    fn plan_for_step(&self, step_id: &str) -> Result<InstancePlan> {
        let found = {
            let state = self.inner.session.lock();
            state
                .plans
                .iter()
                .find(|plan| plans::derive_steps(plan).iter().any(|s| s.id == step_id))
                .cloned()
        };
        found.ok_or_else(|| self.plan_failed(Error::StepNotFound(step_id.to_string())))
    }

    async fn set_plan_status(&self, plan_id: &str, status: PlanStatus) -> Result<()> {
        let epoch = self.inner.session.lock().epoch;
        self.inner
            .backend
            .plans
            .update_plan_status(plan_id, status)
            .await
            .map_err(|e| self.plan_failed(e))?;

        tracing::info!(plan_id, status = status.as_str(), "Plan status updated");
        self.update_local_plan(epoch, plan_id, |plan| plan.status = status);
        Ok(())
    }

    async fn set_plan_steps(&self, plan_id: &str, steps: serde_json::Value) -> Result<()> {
        let epoch = self.inner.session.lock().epoch;
        self.inner
            .backend
            .plans
            .update_plan_steps(plan_id, steps.clone())
            .await
            .map_err(|e| self.plan_failed(e))?;

        tracing::info!(plan_id, "Plan steps updated");
        self.update_local_plan(epoch, plan_id, |plan| plan.steps = Some(steps));
        Ok(())
    }

    fn update_local_plan(&self, epoch: u64, plan_id: &str, update: impl FnOnce(&mut InstancePlan)) {
        {
            let mut state = self.inner.session.lock();
            if state.epoch != epoch {
                return;
            }
            match state.plans.iter_mut().find(|p| p.id == plan_id) {
                Some(plan) => update(plan),
                None => return,
            }
            plans::warn_on_conflicts(&state.plans);
        }
        self.inner.signals.emit(SessionSignal::PlansChanged);
    }

    fn plan_failed(&self, error: Error) -> Error {
        tracing::warn!(error = %error, "Plan update failed");
        self.inner
            .signals
            .notify(NoticeLevel::Error, format!("Plan update failed: {}", error));
        error
    }

    // ------------------------------------------------------------------
    // Teardown
    // ------------------------------------------------------------------

    /// Stop the feed and any poll loop, return both trackers to idle and drop
    /// unconfirmed messages.
    pub fn close(&self) {
        drop(self.subscription_slot().take());
        if let Some(task) = lock(&self.inner.poll_task).take() {
            task.handle.abort();
        }
        self.inner.existing.release(ClearReason::Cancelled);
        self.inner.bootstrap.release(ClearReason::Cancelled);
        let purged = {
            let mut state = self.inner.session.lock();
            let SessionState {
                buffer, timeline, ..
            } = &mut *state;
            buffer.purge(timeline)
        };
        if purged > 0 {
            self.inner.signals.emit(SessionSignal::TimelineChanged);
        }
        tracing::info!(instance = %self.identity(), purged, "Session closed");
    }

    fn subscription_slot(&self) -> MutexGuard<'_, Option<FeedSubscription>> {
        lock(&self.inner.subscription)
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
